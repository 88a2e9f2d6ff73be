use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{DefaultBodyLimit, Multipart, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;

use crate::{
    config::ServiceConfig,
    error::DialogError,
    pipeline::{Action, DialogPipeline, DialogRequest, DialogTurn, InstructionReply, TurnOptions},
    upstream::{ImageUpload, InferenceBackend},
};

/// Error body returned by every route: `{"detail": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub detail: String,
}

impl ApiError {
    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            detail: detail.into(),
        }
    }
}

impl From<DialogError> for ApiError {
    fn from(err: DialogError) -> Self {
        let status = match &err {
            DialogError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            DialogError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            DialogError::UpstreamHttp { .. } | DialogError::Upstream(_) => StatusCode::BAD_GATEWAY,
            DialogError::Encode(_) | DialogError::Template(_) | DialogError::Config(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status == StatusCode::BAD_REQUEST {
            log::warn!("Rejected request: {err}");
        } else {
            log::error!("Dialog failed: {err}");
        }
        Self {
            status,
            detail: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

struct ApiState<B: InferenceBackend> {
    pipeline: Arc<DialogPipeline<B>>,
    allowed_actions: Arc<Vec<String>>,
}

impl<B: InferenceBackend> Clone for ApiState<B> {
    fn clone(&self) -> Self {
        Self {
            pipeline: self.pipeline.clone(),
            allowed_actions: self.allowed_actions.clone(),
        }
    }
}

/// Fields of an upload form as received. `/analyze` reads the dialog fields,
/// the instruction routes read `image` and `instruction`.
#[derive(Default)]
struct UploadForm {
    image: Option<ImageUpload>,
    instruction: Option<String>,
    action: Option<String>,
    answers: Option<String>,
    dialog_state: Option<String>,
    stream: Option<String>,
    max_tokens: Option<String>,
}

impl UploadForm {
    async fn read(mut multipart: Multipart) -> Result<Self, ApiError> {
        let mut form = UploadForm::default();

        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| ApiError::bad_request(e.body_text()))?
        {
            let Some(name) = field.name().map(str::to_string) else {
                continue;
            };

            if name == "image" {
                let filename = field.file_name().unwrap_or("upload").to_string();
                let content_type = field.content_type().map(str::to_string);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request(e.body_text()))?;
                // browsers send an empty part when no file was chosen
                if !bytes.is_empty() {
                    form.image = Some(ImageUpload::new(filename, content_type, bytes.to_vec()));
                }
                continue;
            }

            let value = field
                .text()
                .await
                .map_err(|e| ApiError::bad_request(e.body_text()))?;
            match name.as_str() {
                "instruction" => form.instruction = Some(value),
                "action" => form.action = Some(value),
                "answers" => form.answers = Some(value),
                "dialog_state" => form.dialog_state = Some(value),
                "stream" => form.stream = Some(value),
                "max_tokens" => form.max_tokens = Some(value),
                other => log::debug!("Ignoring unknown form field `{other}`"),
            }
        }

        Ok(form)
    }

    fn into_request(self, allowed_actions: &[String]) -> Result<DialogRequest, ApiError> {
        let action = self
            .action
            .ok_or_else(|| ApiError::bad_request("action is required"))?;
        if !allowed_actions.iter().any(|allowed| *allowed == action) {
            return Err(ApiError::bad_request("unsupported action"));
        }
        let action: Action = action.parse()?;

        let stream = self
            .stream
            .is_some_and(|s| s.trim().eq_ignore_ascii_case("true"));
        let max_tokens = match self.max_tokens.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(
                raw.parse::<u32>()
                    .map_err(|_| ApiError::bad_request("max_tokens must be a positive integer"))?,
            ),
        };

        Ok(DialogRequest {
            action,
            image: self.image,
            answers: self.answers,
            dialog_state: self.dialog_state.filter(|raw| !raw.trim().is_empty()),
            options: TurnOptions { stream, max_tokens },
        })
    }
}

async fn analyze<B: InferenceBackend + 'static>(
    State(state): State<ApiState<B>>,
    multipart: Multipart,
) -> Result<Json<DialogTurn>, ApiError> {
    let form = UploadForm::read(multipart).await?;
    let request = form.into_request(&state.allowed_actions)?;
    let action = request.action;

    log::info!(
        "Running action={} stream={}",
        action.as_str(),
        request.options.stream
    );

    // dropping this future on client disconnect also drops the upstream response
    let turn = state.pipeline.handle(request).await?;
    log::info!(
        "Action {} left the dialog in stage {}",
        action.as_str(),
        turn.dialog_state.stage().as_str()
    );
    Ok(Json(turn))
}

async fn vision_then_reason<B: InferenceBackend + 'static>(
    State(state): State<ApiState<B>>,
    multipart: Multipart,
) -> Result<Json<InstructionReply>, ApiError> {
    let form = UploadForm::read(multipart).await?;
    let instruction = form.instruction.unwrap_or_default();

    let reply = state.pipeline.instruct(form.image, &instruction).await?;
    Ok(Json(reply))
}

async fn vision_stream<B: InferenceBackend + 'static>(
    State(state): State<ApiState<B>>,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let form = UploadForm::read(multipart).await?;
    let instruction = form.instruction.unwrap_or_default();

    // the body owns the upstream stream; a disconnect drops both
    let fragments = state.pipeline.instruct_stream(form.image, &instruction).await?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(fragments),
    )
        .into_response())
}

/// Builds the HTTP surface around a dialog pipeline.
pub fn router<B: InferenceBackend + 'static>(pipeline: Arc<DialogPipeline<B>>, service: &ServiceConfig) -> Router {
    let state = ApiState {
        pipeline,
        allowed_actions: Arc::new(service.allowed_actions.clone()),
    };

    Router::new()
        .route("/", get(|| async { "Vision dialog service" }))
        .route("/analyze", post(analyze::<B>))
        .route("/vision_then_reason", post(vision_then_reason::<B>))
        .route("/vision_stream", post(vision_stream::<B>))
        .layer(DefaultBodyLimit::max(service.max_upload_bytes))
        .with_state(state)
}
