//! Error types for the Cadence domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each collaborator boundary has its own error enum; the agent loop itself
//! never returns an error.

use thiserror::Error;

/// Failures a [`crate::provider::Provider`] can report to the stream collector.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Malformed stream chunk: {0}")]
    MalformedChunk(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Whether another attempt may succeed. Cancellation is final.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Cancelled | Self::NotConfigured(_))
    }
}

/// Failures a [`crate::tool::Tool`] can return. The registry turns them
/// into failed results.
#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_displays_correctly() {
        let err = ProviderError::ApiError {
            status_code: 429,
            message: "Too many requests".into(),
        };
        assert!(err.to_string().contains("429"));
        assert!(err.to_string().contains("Too many requests"));
    }

    #[test]
    fn tool_error_displays_correctly() {
        let err = ToolError::ExecutionFailed {
            tool_name: "shell".into(),
            reason: "exit status 2".into(),
        };
        assert!(err.to_string().contains("shell"));
        assert!(err.to_string().contains("exit status 2"));
    }

    #[test]
    fn cancellation_is_not_retryable() {
        assert!(!ProviderError::Cancelled.is_retryable());
        assert!(ProviderError::Timeout("300s".into()).is_retryable());
        assert!(ProviderError::Network("reset".into()).is_retryable());
    }
}
