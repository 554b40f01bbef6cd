// Error taxonomy for recording sessions.

use reqwest::StatusCode;
use thiserror::Error;

/// Errors surfaced by a recording session or its components.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Traffic interception could not be installed, or the tap closed before
    /// delivering any media exchange.
    #[error("Capture unavailable: {reason}")]
    CaptureUnavailable { reason: String },

    /// The same sequence key arrived twice with different content lengths.
    /// Indicates corrupted or ad-swapped content and is never resolved silently.
    #[error(
        "Segment conflict for key {sequence_key}: existing {existing_len} bytes, incoming {incoming_len} bytes"
    )]
    SegmentConflict {
        sequence_key: u64,
        existing_len: u64,
        incoming_len: u64,
    },

    /// A segment fetch gave up after exhausting its retry budget.
    #[error("Fetch exhausted for segment {sequence_key} after {attempts} attempts: {reason}")]
    FetchExhausted {
        sequence_key: u64,
        attempts: u32,
        reason: String,
    },

    #[error("HTTP status {status} for {url}")]
    HttpStatus { status: StatusCode, url: String },

    #[error("Invalid manifest: {reason}")]
    InvalidManifest { reason: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session cancelled")]
    Cancelled,
}

impl SessionError {
    /// Create a new CaptureUnavailable error.
    pub fn capture_unavailable(reason: impl Into<String>) -> Self {
        SessionError::CaptureUnavailable {
            reason: reason.into(),
        }
    }

    /// Create a new InvalidManifest error.
    pub fn invalid_manifest(reason: impl Into<String>) -> Self {
        SessionError::InvalidManifest {
            reason: reason.into(),
        }
    }

    /// Whether a failed operation carrying this error is worth retrying.
    ///
    /// Transport-level problems (connect, timeout, body interruptions) and the
    /// classic transient status set (408, 429, 500, 502, 503, 504) are retryable.
    /// Everything else, including the remaining 4xx family, fails immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            SessionError::Network(e) => {
                e.is_connect() || e.is_timeout() || e.is_request() || e.is_body() || e.is_decode()
            }
            SessionError::HttpStatus { status, .. } => is_retryable_status(*status),
            _ => false,
        }
    }
}

/// Transient HTTP statuses that warrant another attempt.
pub fn is_retryable_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 408 | 429 | 500 | 502 | 503 | 504)
}
