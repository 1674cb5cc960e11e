use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use db::models::research_task::ResearchTaskError;
use deployment::DeploymentError;
use services::services::{config::ConfigError, dispatcher::DispatchError};
use thiserror::Error;
use utils::response::ApiResponse;

#[derive(Debug, Error, ts_rs::TS)]
#[ts(type = "string")]
pub enum ApiError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    ResearchTask(#[from] ResearchTaskError),
    #[error(transparent)]
    Deployment(#[from] DeploymentError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Bad Request: {0}")]
    BadRequest(String),
    #[error("Not Found: {0}")]
    NotFound(String),
    #[error("Internal Server Error: {0}")]
    InternalError(String),
}

impl ApiError {
    fn status(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Dispatch(err) => match err {
                DispatchError::Validation(_) => (StatusCode::BAD_REQUEST, "ValidationError"),
                DispatchError::NotFound => (StatusCode::NOT_FOUND, "NotFound"),
                DispatchError::InvalidState { .. } => (StatusCode::CONFLICT, "InvalidState"),
                DispatchError::AlreadyRunning(_) => (StatusCode::CONFLICT, "AlreadyRunning"),
                DispatchError::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, "ShuttingDown"),
                DispatchError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DatabaseError"),
            },
            ApiError::ResearchTask(err) => match err {
                ResearchTaskError::NotFound => (StatusCode::NOT_FOUND, "NotFound"),
                ResearchTaskError::InvalidTransition { .. } => {
                    (StatusCode::CONFLICT, "InvalidState")
                }
                ResearchTaskError::Database(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "DatabaseError")
                }
            },
            ApiError::Deployment(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DeploymentError"),
            ApiError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DatabaseError"),
            ApiError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "ConfigError"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BadRequest"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NotFound"),
            ApiError::InternalError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "InternalError"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status_code, error_type) = self.status();

        let error_message = match &self {
            ApiError::BadRequest(msg) | ApiError::NotFound(msg) | ApiError::InternalError(msg) => {
                msg.clone()
            }
            _ if status_code.is_client_error() => self.to_string(),
            _ => {
                tracing::error!("{}: {}", error_type, self);
                format!("{}: {}", error_type, self)
            }
        };
        let response = ApiResponse::<()>::error(&error_message);
        (status_code, Json(response)).into_response()
    }
}
