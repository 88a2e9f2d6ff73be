//! Two-stage image dialog over a remote vision-language model.
//!
//! A caller uploads an image (`action = "new"`). The model describes it and asks
//! a few clarifying questions, which come back together with a [`DialogState`].
//! The caller later sends that state back with the answers (`action = "answer"`)
//! and receives the model's final answer, decoded as JSON when possible.
//!
//! The service itself is stateless between calls: all continuity travels in
//! the caller-held [`DialogState`].
//!
//! Next to the dialog, one-shot instructions can be run against an optional
//! image, either collected into a single reply or passed through as plain text
//! while the model streams.

/// Inbound HTTP surface (`/analyze`, `/vision_then_reason`, `/vision_stream`).
pub mod api;

/// YAML configuration consumed at startup.
pub mod config;

/// Error taxonomy shared by every stage.
pub mod error;

/// Completion text extraction from loosely shaped upstream responses.
pub mod extract;

/// The two-stage orchestrator and one-shot instructions.
pub mod pipeline;

/// Prompt templates with named slots.
pub mod prompt;

/// Separation of an image description from the clarifying questions.
pub mod splitter;

/// State carried by the caller between the two stages.
pub mod state;

/// Buffered and streamed calls to the inference endpoint.
pub mod upstream;

pub use config::AppConfig;
pub use error::DialogError;
pub use pipeline::{
    Action, DialogPipeline, DialogRequest, DialogTurn, FragmentStream, InstructionReply, PipelineResult, TurnOptions,
};
pub use prompt::PromptBook;
pub use state::{AskingState, DialogState, QaPair, Question, Stage};
pub use upstream::{
    ImageUpload, InferenceBackend, InferenceRequest, RecordStream, StreamRecord, StreamedCompletion, UpstreamClient,
};
