use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};

use crate::game::GameError;
use crate::wordset::TooFewWords;

/// Errors returned to HTTP clients. The body is the message as plain text.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("Unauthorized")]
    Unauthorized,
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn internal(e: impl std::fmt::Display) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<GameError> for ApiError {
    fn from(e: GameError) -> Self {
        Self::BadRequest(e.to_string())
    }
}

impl From<TooFewWords> for ApiError {
    fn from(e: TooFewWords) -> Self {
        Self::BadRequest(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = format!("{}\n", self);
        if matches!(self, Self::Unauthorized) {
            return (status, [(header::WWW_AUTHENTICATE, "Basic realm=\"admin\"")], body).into_response();
        }
        (status, body).into_response()
    }
}
