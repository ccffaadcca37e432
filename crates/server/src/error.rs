use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use scorch::ScorchError;
use scorch_core::CoreError;
use serde::Serialize;
use utoipa::ToSchema;

#[derive(Debug)]
pub enum AppError {
    NotFound(String),
    BadRequest(String),
    Scorch(ScorchError),
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    error: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            AppError::Scorch(err) => {
                let (status, error_type) = match &err {
                    ScorchError::ExperimentNotFound(_)
                    | ScorchError::TerminalNotFound(_)
                    | ScorchError::Core(CoreError::RunNotFound(_))
                    | ScorchError::Core(CoreError::LoopNotFound { .. }) => {
                        (StatusCode::NOT_FOUND, "not_found")
                    }
                    ScorchError::NoActiveRun(_) => (StatusCode::NOT_FOUND, "no_active_run"),
                    ScorchError::RunInProgress { .. } => (StatusCode::CONFLICT, "run_in_progress"),
                    ScorchError::OwnershipRejected(_) => {
                        (StatusCode::FORBIDDEN, "ownership_rejected")
                    }
                    ScorchError::Core(_) | ScorchError::InvalidMetadata { .. } => {
                        (StatusCode::BAD_REQUEST, "invalid_metadata")
                    }
                    _ => {
                        tracing::error!(error = %err, "Engine error");
                        (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
                    }
                };
                (status, error_type, err.to_string())
            }
        };

        let body = Json(ErrorResponse {
            error: error_type.to_string(),
            message,
        });

        (status, body).into_response()
    }
}

impl From<ScorchError> for AppError {
    fn from(err: ScorchError) -> Self {
        AppError::Scorch(err)
    }
}
