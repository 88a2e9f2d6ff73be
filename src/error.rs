use std::time::Duration;

use crate::prompt::TemplateError;

/// Errors produced while driving a dialog through the upstream model.
#[derive(Debug, thiserror::Error)]
pub enum DialogError {
    /// The caller supplied input that violates a precondition of the requested action.
    #[error("{0}")]
    InvalidRequest(String),

    /// The inference backend answered with a non-success status.
    #[error("upstream returned HTTP {status}: {body}")]
    UpstreamHttp { status: u16, body: String },

    /// The configured per-call timeout elapsed.
    #[error("upstream timed out after {0:?}")]
    UpstreamTimeout(Duration),

    /// Connection or body decoding failure on the upstream call.
    #[error("upstream request failed: {0}")]
    Upstream(#[source] reqwest::Error),

    #[error("failed to encode upstream payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("configuration error: {0}")]
    Config(String),
}

impl DialogError {
    pub fn invalid(message: impl Into<String>) -> Self {
        DialogError::InvalidRequest(message.into())
    }

    /// Returns true for failures that originate at the inference backend.
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            DialogError::UpstreamHttp { .. }
                | DialogError::UpstreamTimeout(_)
                | DialogError::Upstream(_)
        )
    }
}
