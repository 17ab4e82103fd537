//! Errors from the model endpoint used for classification and synthesis.
//!
//! Every variant is recoverable for the engine: callers log it and fall back
//! to keyword classification or templated synthesis.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum InferenceError {
    /// The endpoint could not be reached.
    #[error("connection failed to {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    #[error("inference timeout after {duration_secs}s")]
    Timeout { duration_secs: u64 },

    /// Non-2xx reply; `body` is truncated.
    #[error("HTTP {status}: {body}")]
    HttpError { status: u16, body: String },

    /// The reply had no usable completion text.
    #[error("malformed completion: {reason}")]
    MalformedResponse { reason: String },

    #[error("model config error: {reason}")]
    ConfigError { reason: String },
}
