use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use ledgersync_core::Error as CoreError;
use ledgersync_sync::SyncError;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    Core(#[from] CoreError),
    #[error("{0}")]
    Sync(#[from] SyncError),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Conflict(String),
    // Surface the underlying error message to help debugging during development
    #[error("{0}")]
    Anyhow(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorBody {
    code: u16,
    message: String,
}

fn core_status(error: &CoreError) -> StatusCode {
    match error {
        CoreError::CredentialNotFound(_) => StatusCode::NOT_FOUND,
        CoreError::Validation(_) | CoreError::InvalidConfigValue(_) => StatusCode::BAD_REQUEST,
        CoreError::CredentialCorruptOrMismatched { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Core(e) => core_status(e),
            ApiError::Sync(e) => match e {
                SyncError::AlreadyRunning(_) => StatusCode::CONFLICT,
                SyncError::RunNotFound(_) => StatusCode::NOT_FOUND,
                SyncError::Core(core) => core_status(core),
                SyncError::Exchange(_) => StatusCode::BAD_GATEWAY,
            },
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Anyhow(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }
        let body = Json(ErrorBody {
            code: status.as_u16(),
            message: self.to_string(),
        });
        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
