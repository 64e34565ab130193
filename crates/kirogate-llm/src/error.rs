use http::StatusCode;
use kirogate_auth::AuthError;
use kirogate_core::HttpError;
use thiserror::Error;

use crate::eventstream::ProtocolError;

/// Errors that can occur while serving a chat completion
#[derive(Debug, Error)]
pub enum LlmError {
    /// Upstream credential could not be obtained or refreshed
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// Request uses content the upstream cannot represent
    #[error("invalid request: {0}")]
    Validation(String),

    /// Requested model is not in the catalog
    #[error("unsupported model '{model}'; available: {available}")]
    ModelNotFound { model: String, available: String },

    /// Upstream binary framing was corrupt
    #[error("upstream protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Network failure or exhausted retries on 5xx
    #[error("upstream unavailable: {0}")]
    Transport(String),

    /// No first byte, no frame within the idle window, or total deadline reached
    #[error("upstream timed out: {0}")]
    Timeout(String),

    /// Upstream kept answering 429
    #[error("upstream rate limit exceeded")]
    RateLimited {
        /// Seconds the upstream asked us to wait, if it said
        retry_after: Option<u64>,
    },

    /// Upstream rejected the request with a non-retryable status
    #[error("upstream returned {status}: {message}")]
    Upstream { status: u16, message: String },

    /// Upstream reported an exception inside the event stream
    #[error("upstream exception {kind}: {message}")]
    UpstreamException { kind: String, message: String },

    /// Unexpected internal error
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl HttpError for LlmError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::Validation(_) | Self::ModelNotFound { .. } => StatusCode::BAD_REQUEST,
            Self::Protocol(_) | Self::Transport(_) | Self::UpstreamException { .. } => StatusCode::BAD_GATEWAY,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Upstream { status, .. } => StatusCode::from_u16(*status)
                .ok()
                .filter(StatusCode::is_client_error)
                .unwrap_or(StatusCode::BAD_GATEWAY),
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &str {
        match self {
            Self::Auth(_) => "authentication_error",
            Self::Validation(_) | Self::ModelNotFound { .. } => "invalid_request_error",
            Self::Protocol(_) | Self::Transport(_) | Self::UpstreamException { .. } => "upstream_error",
            Self::Timeout(_) => "timeout_error",
            Self::RateLimited { .. } => "rate_limit_error",
            Self::Upstream { .. } => match self.status_code() {
                StatusCode::BAD_GATEWAY => "upstream_error",
                _ => "invalid_request_error",
            },
            Self::Internal(_) => "internal_error",
        }
    }

    fn client_message(&self) -> String {
        match self {
            Self::Internal(_) => "an internal error occurred".to_owned(),
            other => other.to_string(),
        }
    }

    fn retry_after(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_client_errors_pass_through() {
        let err = LlmError::Upstream {
            status: 400,
            message: "Improperly formed request".to_owned(),
        };
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.error_type(), "invalid_request_error");

        let err = LlmError::Upstream {
            status: 500,
            message: "boom".to_owned(),
        };
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(err.error_type(), "upstream_error");
    }

    #[test]
    fn internal_errors_are_redacted() {
        let err = LlmError::Internal(anyhow::anyhow!("secret detail"));
        assert_eq!(err.client_message(), "an internal error occurred");
    }

    #[test]
    fn rate_limit_carries_retry_after() {
        let err = LlmError::RateLimited { retry_after: Some(7) };
        assert_eq!(err.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.retry_after(), Some(7));
    }

    #[test]
    fn auth_failures_are_unauthorized() {
        let err = LlmError::from(AuthError::MissingRefreshToken);
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
    }
}
