//! Request-level errors and their HTTP rendering.
//!
//! Store and upstream failures reach clients as generic messages. The cause
//! is only logged.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::auth::AuthError;
use crate::forms::{ValidationError, NOT_AN_IMAGE};
use crate::model::InferenceError;
use crate::store::StoreError;

pub const NOT_FOUND_PAGE: &str = "Error 404: Page not found";
pub const UNAUTHORISED_PAGE: &str = "Error 401: Unauthorised access or action";
const UPSTREAM_FAILED: &str = "Error getting a prediction from the model server";
const SERVER_FAILED: &str = "Something went wrong with our server";

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{0}")]
    Rejected(String),
    #[error("invalid email or password")]
    InvalidCredentials,
    #[error("authentication required")]
    Unauthorized,
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Inference(#[from] InferenceError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl AppError {
    /// A request that passed form validation but was refused, reported inline.
    pub fn rejected(message: impl Into<String>) -> Self {
        AppError::Rejected(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::Rejected(_) => StatusCode::BAD_REQUEST,
            AppError::InvalidCredentials | AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Inference(InferenceError::Image(_)) => StatusCode::BAD_REQUEST,
            AppError::Inference(_) => StatusCode::BAD_GATEWAY,
            AppError::Store(StoreError::NotFound) => StatusCode::NOT_FOUND,
            AppError::Store(_) | AppError::Auth(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn messages(&self) -> Vec<String> {
        match self {
            AppError::Validation(err) => err.messages().to_vec(),
            AppError::Rejected(message) | AppError::NotFound(message) => vec![message.clone()],
            AppError::InvalidCredentials => vec!["Invalid email or password".to_string()],
            AppError::Unauthorized => vec![UNAUTHORISED_PAGE.to_string()],
            AppError::Inference(InferenceError::Image(_)) => vec![NOT_AN_IMAGE.to_string()],
            AppError::Inference(_) => vec![UPSTREAM_FAILED.to_string()],
            AppError::Store(StoreError::NotFound) => vec!["Result is not available".to_string()],
            AppError::Store(_) | AppError::Auth(_) => vec![SERVER_FAILED.to_string()],
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "Request rejected");
        }
        (status, Json(json!({ "errors": self.messages() }))).into_response()
    }
}
