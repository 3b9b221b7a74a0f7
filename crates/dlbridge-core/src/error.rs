//! Error types for dlbridge core

use dlbridge_types::TransportError;
use thiserror::Error;
use uuid::Uuid;

/// Result type alias for dlbridge operations
pub type Result<T> = std::result::Result<T, DownloadError>;

/// Errors that can occur in dlbridge core
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The engine build exposes neither download API generation
    #[error("No download API is available in this engine build")]
    UnsupportedCapability,

    #[error("Engine rejected the resume data")]
    InvalidResumeData,

    /// A native redirect policy value outside the known vocabulary.
    /// This is a programming defect, not a runtime condition.
    #[error("Native redirect policy {0} has no mapping")]
    RedirectPolicyUnmapped(i64),

    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Download not found: {0}")]
    NotFound(Uuid),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt download record: {0}")]
    CorruptRecord(String),

    #[error("Timeout")]
    Timeout,
}

impl DownloadError {
    /// Check if the caller should offer a retry for this error
    pub fn is_retryable(&self) -> bool {
        match self {
            DownloadError::Transport(e) => !e.is_cancellation(),
            DownloadError::InvalidResumeData | DownloadError::Timeout => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dlbridge_types::TransportErrorKind;

    #[test]
    fn test_retryable() {
        assert!(DownloadError::InvalidResumeData.is_retryable());
        assert!(DownloadError::Transport(TransportError::new(TransportErrorKind::Network, "reset")).is_retryable());
        assert!(!DownloadError::Transport(TransportError::cancelled()).is_retryable());
        assert!(!DownloadError::UnsupportedCapability.is_retryable());
        assert!(!DownloadError::RedirectPolicyUnmapped(7).is_retryable());
    }
}
