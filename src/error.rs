// Error handling module
// Defines the error taxonomy surfaced to callers of the session layer

use reqwest::Response;
use serde::Deserialize;
use thiserror::Error;

/// Fallback shown when the server did not author a message
pub const GENERIC_FAILURE_MESSAGE: &str = "could not complete the request";

/// Rejected state-machine transitions on the session context
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    /// A refresh cycle is already running
    #[error("a token refresh is already in progress")]
    AlreadyRefreshing,

    /// completeRefresh called without a matching beginRefresh
    #[error("no token refresh is in progress")]
    NotRefreshing,

    /// Operation needs a signed-in session
    #[error("no session is signed in")]
    SignedOut,

    /// Sign-in attempted while a refresh cycle is running
    #[error("cannot sign in while a token refresh is in progress")]
    Refreshing,
}

/// Errors that can occur while issuing requests or managing the session
#[derive(Error, Debug)]
pub enum ApiError {
    /// No response received (connectivity, timeout)
    #[error("Network error ({kind}): {message}")]
    Network { kind: &'static str, message: String },

    /// Response received with a non-2xx status that was not absorbed by a refresh
    #[error("Server error: {status} - {}", .message.as_deref().unwrap_or(GENERIC_FAILURE_MESSAGE))]
    Server { status: u16, message: Option<String> },

    /// The session could not be renewed and has been signed out
    #[error("Session expired, sign in again")]
    SessionExpired,

    /// Session state machine refused the operation
    #[error("Invalid session transition: {0}")]
    Transition(#[from] TransitionError),

    /// Durable storage failed on a write path
    #[error("Storage error: {0}")]
    Storage(String),

    /// Session payload failed validation (e.g. empty tokens)
    #[error("Invalid session: {0}")]
    InvalidSession(String),

    /// Request rejected locally before it was sent
    #[error("Validation error: {0}")]
    Validation(String),

    /// A success response body could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Structured error body returned by the backend
#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

impl ApiError {
    /// Build a ServerError from a non-success response, keeping the
    /// server-authored message when the body carries one
    pub async fn from_response(response: Response) -> Self {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        ApiError::Server {
            status,
            message: parse_error_message(&body),
        }
    }

    /// Categorize a transport failure
    pub fn from_transport(err: &reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            "timeout"
        } else if err.is_connect() {
            "connection_failed"
        } else if err.is_request() {
            "request_error"
        } else if err.is_body() {
            "body_error"
        } else if err.is_decode() {
            "decode_error"
        } else {
            "unknown"
        };

        ApiError::Network {
            kind,
            message: err.to_string(),
        }
    }

    /// Message suitable for presentation: server-authored when available
    pub fn user_message(&self) -> String {
        match self {
            ApiError::Server {
                message: Some(message),
                ..
            } => message.clone(),
            ApiError::SessionExpired => self.to_string(),
            _ => GENERIC_FAILURE_MESSAGE.to_string(),
        }
    }

    /// Whether presentation code should navigate back to sign in
    pub fn is_session_expired(&self) -> bool {
        matches!(self, ApiError::SessionExpired)
    }
}

fn parse_error_message(body: &str) -> Option<String> {
    serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.message)
        .filter(|m| !m.trim().is_empty())
}

/// Result type alias for API operations
pub type Result<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = ApiError::Server {
            status: 400,
            message: Some("E-mail já cadastrado".to_string()),
        };
        assert_eq!(err.to_string(), "Server error: 400 - E-mail já cadastrado");

        let err = ApiError::Server {
            status: 500,
            message: None,
        };
        assert_eq!(
            err.to_string(),
            "Server error: 500 - could not complete the request"
        );

        let err = ApiError::SessionExpired;
        assert_eq!(err.to_string(), "Session expired, sign in again");
    }

    #[test]
    fn test_transition_error_message() {
        let err = ApiError::from(TransitionError::AlreadyRefreshing);
        assert_eq!(
            err.to_string(),
            "Invalid session transition: a token refresh is already in progress"
        );
    }

    #[test]
    fn test_validation_error_message() {
        let err = ApiError::Validation("Informe o nome".to_string());
        assert_eq!(err.to_string(), "Validation error: Informe o nome");
    }

    #[test]
    fn test_internal_error_message() {
        let err = ApiError::Internal(anyhow::anyhow!("Something went wrong"));
        assert_eq!(err.to_string(), "Internal error: Something went wrong");
    }

    #[test]
    fn test_user_message_prefers_server_message() {
        let err = ApiError::Server {
            status: 401,
            message: Some("E-mail e/ou senha incorreta".to_string()),
        };
        assert_eq!(err.user_message(), "E-mail e/ou senha incorreta");
    }

    #[test]
    fn test_user_message_fallback() {
        let err = ApiError::Network {
            kind: "timeout",
            message: "operation timed out".to_string(),
        };
        assert_eq!(err.user_message(), GENERIC_FAILURE_MESSAGE);

        let err = ApiError::Server {
            status: 502,
            message: None,
        };
        assert_eq!(err.user_message(), GENERIC_FAILURE_MESSAGE);
        assert!(!err.is_session_expired());
        assert!(ApiError::SessionExpired.is_session_expired());
    }

    #[test]
    fn test_parse_error_message() {
        assert_eq!(
            parse_error_message(r#"{"status":"error","message":"Exercício não encontrado"}"#),
            Some("Exercício não encontrado".to_string())
        );
        assert_eq!(parse_error_message(r#"{"status":"error"}"#), None);
        assert_eq!(parse_error_message(r#"{"message":"  "}"#), None);
        assert_eq!(parse_error_message("<html>Bad Gateway</html>"), None);
        assert_eq!(parse_error_message(""), None);
    }
}
