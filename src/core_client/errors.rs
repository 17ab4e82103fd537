//! Core-service client error types.

use thiserror::Error;

/// Errors surfaced by the core-service write interface.
///
/// Every variant carries enough context (status, body, endpoint) for the
/// calling tool to classify the failure.
#[derive(Debug, Error)]
pub enum CoreServiceError {
    /// TCP/TLS connection or request transport failed.
    #[error("transport error calling {endpoint}: {reason}")]
    Transport { endpoint: String, reason: String },

    /// The request did not complete within the configured timeout.
    #[error("request to {endpoint} timed out")]
    Timeout { endpoint: String },

    /// Non-2xx HTTP response.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// The response body could not be decoded.
    #[error("malformed response: {reason}")]
    Decode { reason: String },

    /// The entity does not exist (HTTP 404 on get/delete).
    #[error("{kind} '{id}' not found")]
    NotFound { kind: String, id: String },

    /// Client construction or configuration failed.
    #[error("config error: {reason}")]
    Config { reason: String },
}

impl CoreServiceError {
    /// Transport failures, timeouts, 429 and 5xx are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            CoreServiceError::Transport { .. } | CoreServiceError::Timeout { .. } => true,
            CoreServiceError::Http { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// HTTP status, when the failure came from a response.
    pub fn status(&self) -> Option<u16> {
        match self {
            CoreServiceError::Http { status, .. } => Some(*status),
            CoreServiceError::NotFound { .. } => Some(404),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(CoreServiceError::Timeout {
            endpoint: "http://core/tasks".into()
        }
        .is_retryable());
        assert!(CoreServiceError::Http {
            status: 429,
            body: String::new()
        }
        .is_retryable());
        assert!(CoreServiceError::Http {
            status: 502,
            body: String::new()
        }
        .is_retryable());
        assert!(!CoreServiceError::Http {
            status: 400,
            body: "missing title".into()
        }
        .is_retryable());
        assert!(!CoreServiceError::Decode {
            reason: "eof".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_status_exposed() {
        let err = CoreServiceError::Http {
            status: 409,
            body: "conflict".into(),
        };
        assert_eq!(err.status(), Some(409));
        assert_eq!(err.to_string(), "HTTP 409: conflict");
        assert_eq!(
            CoreServiceError::NotFound {
                kind: "task".into(),
                id: "t1".into()
            }
            .status(),
            Some(404)
        );
    }
}
