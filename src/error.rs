//! Error types for sift-core.

use thiserror::Error;

/// Result type alias using sift-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during pipeline operations.
#[derive(Error, Debug)]
pub enum Error {
    /// LLM API error
    #[error("LLM API error: {provider} - {message}")]
    LlmApi { provider: String, message: String },

    /// LLM error (simple variant)
    #[error("LLM error: {0}")]
    Llm(String),

    /// Model response failed shape or content validation
    #[error("invalid model response: {0}")]
    InvalidResponse(String),

    /// Translation service error
    #[error("translation error: {0}")]
    Translation(String),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(String),

    /// Image decode/encode error
    #[error("image error: {0}")]
    Image(String),

    /// LLM file-store error
    #[error("file store error: {0}")]
    FileStore(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Persistence write error
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Timeout during operation
    #[error("operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Cooperative cancellation fired
    #[error("operation cancelled")]
    Cancelled,

    /// Sentinel: a thumbnail batch is partially complete and the remainder
    /// should be requested again.
    #[error("thumbnail batch partially complete")]
    PendingThumbnails,
}

impl Error {
    /// Create an LLM API error.
    pub fn llm_api(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::LlmApi {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create an HTTP transport error.
    pub fn http(message: impl Into<String>) -> Self {
        Self::Http(message.into())
    }

    /// Create an invalid-response error.
    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::InvalidResponse(message.into())
    }

    /// Create a timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Whether the retry wrapper may re-attempt the operation.
    ///
    /// Transient transport failures, rate limits and the pending-thumbnail
    /// sentinel are retryable; validation, cancellation and configuration
    /// errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Http(_) | Self::PendingThumbnails => true,
            Self::Llm(message) | Self::Translation(message) => is_retryable_message(message),
            Self::LlmApi { message, .. } => is_retryable_message(message),
            _ => false,
        }
    }
}

fn is_retryable_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("429")
        || lower.contains("500")
        || lower.contains("502")
        || lower.contains("503")
        || lower.contains("rate limit")
        || lower.contains("rate_limit")
        || lower.contains("too many requests")
        || lower.contains("temporarily unavailable")
        || lower.contains("unavailable")
        || lower.contains("timeout")
}
