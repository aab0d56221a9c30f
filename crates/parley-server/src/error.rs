use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use parley_shared::protocol::ErrorCode;
use parley_shared::ProtocolError;
use parley_store::StoreError;

use crate::auth::AuthError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Authentication failed: {0}")]
    Unauthorized(AuthError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Code sent to a client over the socket for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            ServerError::Unauthorized(_) => ErrorCode::AuthError,
            ServerError::BadRequest(_) | ServerError::Protocol(_) => ErrorCode::BadRequest,
            ServerError::Store(_) | ServerError::Internal(_) => ErrorCode::SyncFailed,
        }
    }
}

// A failed identity lookup is an outage, not a bad credential.
impl From<AuthError> for ServerError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Store(e) => ServerError::Store(e),
            other => ServerError::Unauthorized(other),
        }
    }
}

impl From<tokio::task::JoinError> for ServerError {
    fn from(e: tokio::task::JoinError) -> Self {
        ServerError::Internal(format!("Blocking task failed: {e}"))
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "auth_error".to_string()),
            ServerError::Store(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Storage error".to_string())
            }
            ServerError::BadRequest(_) | ServerError::Protocol(_) => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            ServerError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejected_credentials_answer_401() {
        let err = ServerError::from(AuthError::Expired);
        assert_eq!(err.code(), ErrorCode::AuthError);
        assert_eq!(err.into_response().status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_identity_lookup_outage_answers_500() {
        let err = ServerError::from(AuthError::Store(StoreError::Poisoned));
        assert!(matches!(err, ServerError::Store(StoreError::Poisoned)));
        assert_eq!(err.code(), ErrorCode::SyncFailed);
        assert_eq!(
            err.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
