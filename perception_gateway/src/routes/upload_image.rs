use crate::{
    image_codec::DecodeError,
    orchestrator::{OrchestratorError, UploadResponse},
    server::SharedState,
};
use axum::{
    extract::{multipart::MultipartError, Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use thiserror::Error;
use tracing::instrument;

const FILE_FIELDS: [&str; 2] = ["file", "image"];
const PROMPT_FIELD: &str = "prompt";

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Missing image file field `file`")]
    MissingFile,
    #[error("Malformed multipart body: {0}")]
    Multipart(#[from] MultipartError),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        let status = match &self {
            UploadError::MissingFile => StatusCode::BAD_REQUEST,
            UploadError::Multipart(e) => e.status(),
            UploadError::Orchestrator(OrchestratorError::Decode(DecodeError::TooLarge(..))) => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            UploadError::Orchestrator(OrchestratorError::Decode(_)) => StatusCode::BAD_REQUEST,
            UploadError::Orchestrator(OrchestratorError::Caption(_)) => StatusCode::BAD_GATEWAY,
            UploadError::Orchestrator(OrchestratorError::CaptionTimeout(_)) => {
                StatusCode::GATEWAY_TIMEOUT
            }
            UploadError::Orchestrator(OrchestratorError::TaskFailed(_)) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[instrument(skip(state, multipart))]
pub async fn upload_image(
    State(state): State<SharedState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, UploadError> {
    let mut image_data = None;
    let mut prompt = None;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some(n) if FILE_FIELDS.contains(&n) => image_data = Some(field.bytes().await?),
            Some(PROMPT_FIELD) => prompt = Some(field.text().await?),
            _ => tracing::debug!("Ignoring multipart field {:?}", name),
        }
    }

    let image_data = image_data.ok_or(UploadError::MissingFile)?;
    let response = state.orchestrator.handle_upload(image_data, prompt).await?;

    Ok(Json(response))
}
