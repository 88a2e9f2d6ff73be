use std::{collections::HashMap, pin::Pin, str::FromStr};

use futures::{Stream, StreamExt, future::ready};
use serde::Serialize;
use serde_json::Value;

use crate::{
    config::{AppConfig, DialogConfig, ImageTransport},
    error::DialogError,
    extract::extract_text,
    prompt::{self, ASK_QUESTIONS, FINAL_DIAGNOSIS, PromptBook},
    splitter,
    state::{AskingState, DialogState, QaPair, Question},
    upstream::{ImageUpload, InferenceBackend, InferenceRequest},
};

/// Stands in for the image description in the stage-one prompt; the image itself is attached.
const ATTACHED_IMAGE_PLACEHOLDER: &str = "(image attached)";

const DESCRIBE_AND_INSTRUCT: &str =
    "Describe the image and produce concise actionable summary. Instruction: {instruction}";
const ANSWER_INSTRUCTION: &str = "Instruction: {instruction}\nPlease answer concisely.";

/// Text pieces of a streamed reply, in arrival order.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, DialogError>> + Send>>;

/// The caller-requested transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Start a dialog from an uploaded image.
    New,
    /// Answer the questions of a previous `New`.
    Answer,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::New => "new",
            Action::Answer => "answer",
        }
    }
}

impl FromStr for Action {
    type Err = DialogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Action::New),
            "answer" => Ok(Action::Answer),
            _ => Err(DialogError::invalid("unsupported action")),
        }
    }
}

/// Per-call knobs supplied by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TurnOptions {
    pub stream: bool,
    /// Overrides the configured token budget for this call; zero means "use the default".
    pub max_tokens: Option<u32>,
}

/// One inbound call, with caller-supplied JSON still in raw form.
#[derive(Debug, Clone)]
pub struct DialogRequest {
    pub action: Action,
    pub image: Option<ImageUpload>,
    pub answers: Option<String>,
    pub dialog_state: Option<String>,
    pub options: TurnOptions,
}

/// Outcome of one pipeline stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "stage", rename_all = "lowercase")]
pub enum PipelineResult {
    Asking {
        image_description: String,
        questions: Vec<Question>,
        #[serde(skip_serializing_if = "Option::is_none")]
        chunks: Option<Vec<String>>,
        /// Raw buffered body, or the last streamed record.
        #[serde(skip_serializing_if = "Option::is_none")]
        upstream: Option<Value>,
    },
    Final {
        final_text: String,
        /// `final_text` decoded as JSON when it is valid JSON.
        parsed: Option<Value>,
        qa_pairs: Vec<QaPair>,
        #[serde(skip_serializing_if = "Option::is_none")]
        chunks: Option<Vec<String>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        upstream: Option<Value>,
    },
}

/// A stage result together with the state the caller must send back next time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DialogTurn {
    #[serde(flatten)]
    pub result: PipelineResult,
    pub dialog_state: DialogState,
}

/// Streamed reply to a one-shot instruction, collected in full.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstructionReply {
    pub text: String,
    pub chunks: Vec<String>,
    /// Last record that decoded successfully.
    pub last_obj: Option<Value>,
}

struct Completion {
    text: String,
    chunks: Option<Vec<String>>,
    upstream: Option<Value>,
}

/// Drives the two-stage image dialog against an inference backend.
///
/// The pipeline keeps no per-dialog memory. Everything needed for the second
/// stage travels in the [`DialogState`] returned by the first one.
pub struct DialogPipeline<B: InferenceBackend> {
    backend: B,
    prompts: PromptBook,
    model: String,
    dialog: DialogConfig,
    image_transport: ImageTransport,
}

impl<B: InferenceBackend> DialogPipeline<B> {
    pub fn new(backend: B, prompts: PromptBook, model: impl Into<String>, dialog: DialogConfig) -> Self {
        Self {
            backend,
            prompts,
            model: model.into(),
            dialog,
            image_transport: ImageTransport::default(),
        }
    }

    pub fn from_config(backend: B, prompts: PromptBook, config: &AppConfig) -> Self {
        Self::new(
            backend,
            prompts,
            config.upstream.default_model.clone(),
            config.dialog.clone(),
        )
        .with_image_transport(config.upstream.image_transport)
    }

    pub fn with_image_transport(mut self, transport: ImageTransport) -> Self {
        self.image_transport = transport;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Validates a raw request and runs the matching stage.
    pub async fn handle(&self, request: DialogRequest) -> Result<DialogTurn, DialogError> {
        if let Some(raw) = request.dialog_state.as_deref() {
            serde_json::from_str::<Value>(raw)
                .map_err(|_| DialogError::invalid("dialog_state must be valid JSON"))?;
        }

        match request.action {
            Action::New => {
                let image = request
                    .image
                    .ok_or_else(|| DialogError::invalid("image required for action=new"))?;
                self.ask_questions(image, request.options).await
            }
            Action::Answer => {
                let raw_answers = request
                    .answers
                    .filter(|raw| !raw.is_empty())
                    .ok_or_else(|| DialogError::invalid("answers required for action=answer"))?;
                let answers = parse_answers(&raw_answers)?;
                let raw_state = request
                    .dialog_state
                    .ok_or_else(|| DialogError::invalid("dialog_state required for action=answer"))?;
                let state = AskingState::from_json(&raw_state)?;
                self.finalize(&state, &answers, request.options).await
            }
        }
    }

    /// Stage one: describe the image and collect clarifying questions.
    pub async fn ask_questions(&self, image: ImageUpload, options: TurnOptions) -> Result<DialogTurn, DialogError> {
        let prompt = self
            .prompts
            .render_prompt(ASK_QUESTIONS, &[("image_description", ATTACHED_IMAGE_PLACEHOLDER)])?;

        let mut request = InferenceRequest::new(
            self.model.clone(),
            prompt,
            budget(options.max_tokens, self.dialog.ask_max_tokens),
        );
        match self.image_transport {
            ImageTransport::Inline => request.images = Some(vec![image.to_base64()]),
            ImageTransport::Multipart => request.attachment = Some(image),
        }

        let completion = self.complete(request, options.stream).await?;
        let split = splitter::split(&completion.text, &self.dialog.stage_marker);
        let questions = Question::numbered(split.questions, self.dialog.max_questions);

        log::info!("Stage one produced {} question(s)", questions.len());

        Ok(DialogTurn {
            dialog_state: DialogState::asking(split.description.clone(), questions.clone()),
            result: PipelineResult::Asking {
                image_description: split.description,
                questions,
                chunks: completion.chunks,
                upstream: completion.upstream,
            },
        })
    }

    /// Stage two: synthesize the final answer from the description and the answered questions.
    pub async fn finalize(
        &self,
        state: &AskingState,
        answers: &HashMap<String, String>,
        options: TurnOptions,
    ) -> Result<DialogTurn, DialogError> {
        let qa_pairs = state.qa_pairs(|id| answers.get(id).cloned());
        let serialized_pairs = serde_json::to_string(&qa_pairs)?;

        let prompt = self.prompts.render_prompt(
            FINAL_DIAGNOSIS,
            &[
                ("image_description", state.image_description.as_str()),
                ("answers", serialized_pairs.as_str()),
            ],
        )?;
        let request = InferenceRequest::new(
            self.model.clone(),
            prompt,
            budget(options.max_tokens, self.dialog.final_max_tokens),
        );

        let completion = self.complete(request, options.stream).await?;
        let parsed = match serde_json::from_str::<Value>(&completion.text) {
            Ok(value) => Some(value),
            Err(e) => {
                log::debug!("Final answer is not structured: {e}");
                None
            }
        };

        Ok(DialogTurn {
            result: PipelineResult::Final {
                final_text: completion.text,
                parsed,
                qa_pairs,
                chunks: completion.chunks,
                upstream: completion.upstream,
            },
            dialog_state: DialogState::finished(),
        })
    }

    /// Runs a one-shot instruction, with or without an image, and collects the streamed reply.
    pub async fn instruct(&self, image: Option<ImageUpload>, instruction: &str) -> Result<InstructionReply, DialogError> {
        let request = self.instruction_request(image, instruction)?;
        let streamed = self.backend.call_streamed(request).await?;
        Ok(InstructionReply {
            text: streamed.final_text,
            chunks: streamed.chunks,
            last_obj: streamed.last_envelope,
        })
    }

    /// Runs a one-shot instruction and hands back its text pieces as they arrive.
    ///
    /// Upstream status errors surface here; transport errors after the first
    /// piece end the returned stream with an `Err`.
    pub async fn instruct_stream(
        &self,
        image: Option<ImageUpload>,
        instruction: &str,
    ) -> Result<FragmentStream, DialogError> {
        let request = self.instruction_request(image, instruction)?;
        let records = self.backend.open_stream(request).await?;
        Ok(Box::pin(records.filter_map(|record| {
            ready(record.map(|record| record.fragment).transpose())
        })))
    }

    fn instruction_request(
        &self,
        image: Option<ImageUpload>,
        instruction: &str,
    ) -> Result<InferenceRequest, DialogError> {
        let (template, max_tokens) = match image {
            Some(_) => (DESCRIBE_AND_INSTRUCT, self.dialog.vision_max_tokens),
            None => (ANSWER_INSTRUCTION, self.dialog.instruction_max_tokens),
        };
        let prompt = prompt::render(template, &[("instruction", instruction)])?;

        log::info!(
            "Running instruction with_image={} ({} chars)",
            image.is_some(),
            instruction.len()
        );

        // always multipart: the instruction endpoints forward the upload as a file
        let mut request = InferenceRequest::new(self.model.clone(), prompt, max_tokens);
        request.attachment = image;
        Ok(request)
    }

    async fn complete(&self, request: InferenceRequest, stream: bool) -> Result<Completion, DialogError> {
        if stream {
            let streamed = self.backend.call_streamed(request).await?;
            Ok(Completion {
                text: streamed.final_text,
                chunks: Some(streamed.chunks),
                upstream: streamed.last_envelope,
            })
        } else {
            let body = self.backend.call_buffered(request).await?;
            Ok(Completion {
                text: extract_text(&body),
                chunks: None,
                upstream: Some(body),
            })
        }
    }
}

fn budget(requested: Option<u32>, default: u32) -> u32 {
    requested.filter(|n| *n > 0).unwrap_or(default)
}

/// Decodes the `answers` field: a JSON object mapping question id to answer.
fn parse_answers(raw: &str) -> Result<HashMap<String, String>, DialogError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|_| DialogError::invalid("answers must be valid JSON"))?;
    let Value::Object(map) = value else {
        return Err(DialogError::invalid("answers must be a JSON object"));
    };

    Ok(map
        .into_iter()
        .map(|(id, answer)| {
            let answer = match answer {
                Value::String(s) => s,
                Value::Null => String::new(),
                other => other.to_string(),
            };
            (id, answer)
        })
        .collect())
}
