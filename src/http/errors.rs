use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::{
    constants::INTERNAL_SERVER_ERROR,
    core::{
        engine::EngineError, gate::GateError, registry::RegistryError, traits::builder::BuildLog,
    },
    http::models::{BuildFailureResponse, Message},
};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("Failed to install runtime")]
    BuildFailed { log: BuildLog },
    #[error("Failed to update the package manager")]
    UpdateFailed { log: BuildLog },
    #[error("Service is shutting down")]
    Unavailable,
    #[error("{}", INTERNAL_SERVER_ERROR)]
    Internal,
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::InvalidLimits { .. } => ApiError::BadRequest(e.to_string()),
            EngineError::UnknownRuntime(_) | EngineError::Registry(RegistryError::NotFound) => {
                ApiError::NotFound(e.to_string())
            }
            EngineError::Registry(
                RegistryError::MissingField(_)
                | RegistryError::InvalidSourceFileName
                | RegistryError::DuplicateName,
            ) => ApiError::BadRequest(e.to_string()),
            EngineError::BuildFailed { log } => ApiError::BuildFailed { log },
            EngineError::Gate(GateError::Closed) => ApiError::Unavailable,
            EngineError::Registry(_) | EngineError::Pipeline(_) | EngineError::Internal { .. } => {
                tracing::error!("Request failed: {}", e);
                ApiError::Internal
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = self.to_string();
        match self {
            ApiError::BadRequest(_) => {
                (StatusCode::BAD_REQUEST, Json(Message { message })).into_response()
            }
            ApiError::NotFound(_) => {
                (StatusCode::NOT_FOUND, Json(Message { message })).into_response()
            }
            ApiError::BuildFailed { log } => (
                StatusCode::BAD_REQUEST,
                Json(BuildFailureResponse {
                    message,
                    stdout: log.stdout,
                    stderr: log.stderr,
                }),
            )
                .into_response(),
            ApiError::UpdateFailed { log } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(BuildFailureResponse {
                    message,
                    stdout: log.stdout,
                    stderr: log.stderr,
                }),
            )
                .into_response(),
            ApiError::Unavailable => {
                (StatusCode::SERVICE_UNAVAILABLE, Json(Message { message })).into_response()
            }
            ApiError::Internal => {
                (StatusCode::INTERNAL_SERVER_ERROR, Json(Message { message })).into_response()
            }
        }
    }
}
