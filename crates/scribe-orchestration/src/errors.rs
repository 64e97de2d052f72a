//! Error taxonomy for remote-call jobs.
//!
//! Cache misses and rate-limit rejections are not errors inside the cache
//! and limiter themselves; they become [`JobError`] only at the
//! collaborator boundary, where a caller has to decide what to do next.

use std::path::PathBuf;

use thiserror::Error;

/// Errors produced while running a job.
#[derive(Debug, Error)]
pub enum JobError {
    /// Input file does not exist.
    #[error("Audio file not found: {}", path.display())]
    NotFound {
        /// Path that was looked up.
        path: PathBuf,
    },

    /// Local call budget exhausted.
    #[error("Rate limit exceeded, retry in {retry_after_ms}ms")]
    RateLimited {
        /// Time until a slot frees up.
        retry_after_ms: u64,
    },

    /// Connection-level failure.
    #[error("Network error: {0}")]
    Transport(String),

    /// Request exceeded the transport timeout.
    #[error("Request timed out after {timeout_ms}ms")]
    Timeout {
        /// Configured timeout.
        timeout_ms: u64,
    },

    /// Remote service answered with an error payload.
    #[error("API error ({status}): {message}")]
    Upstream {
        /// HTTP status code.
        status: u16,
        /// Error description from the response body.
        message: String,
    },

    /// Cooperative cancellation won the race.
    #[error("Operation aborted by user")]
    Cancelled,

    /// Running and queued slots are all taken.
    #[error("Too many jobs in flight ({registered} registered, limit {limit})")]
    Busy {
        /// Jobs currently registered.
        registered: usize,
        /// Running plus queued capacity.
        limit: usize,
    },

    /// A job with this id is already registered.
    #[error("Job {job_id} is already running")]
    DuplicateJob {
        /// Conflicting job id.
        job_id: String,
    },

    /// Local file I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Anything else.
    #[error("{0}")]
    Unexpected(String),
}

impl JobError {
    /// Whether an automatic retry could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Transport(_) | Self::Timeout { .. } | Self::Busy { .. } => {
                true
            }
            Self::Upstream { status, .. } => *status == 408 || *status == 429 || *status >= 500,
            Self::NotFound { .. }
            | Self::Cancelled
            | Self::DuplicateJob { .. }
            | Self::Io(_)
            | Self::Json(_)
            | Self::Unexpected(_) => false,
        }
    }

    /// Suggested wait before retrying, if known.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }

    /// Error category string for results and progress events.
    pub fn category(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::RateLimited { .. } => "rate_limit",
            Self::Transport(_) => "network",
            Self::Timeout { .. } => "timeout",
            Self::Upstream { .. } => "upstream",
            Self::Cancelled => "cancelled",
            Self::Busy { .. } => "busy",
            Self::DuplicateJob { .. } => "duplicate",
            Self::Io(_) => "io",
            Self::Json(_) => "parse",
            Self::Unexpected(_) => "unexpected",
        }
    }
}

/// Result alias for job operations.
pub type Result<T> = std::result::Result<T, JobError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_message_names_path() {
        let err = JobError::NotFound {
            path: PathBuf::from("/tmp/missing.webm"),
        };
        assert_eq!(err.to_string(), "Audio file not found: /tmp/missing.webm");
        assert!(!err.is_retryable());
        assert_eq!(err.category(), "not_found");
    }

    #[test]
    fn cancelled_mentions_aborted() {
        let err = JobError::Cancelled;
        assert!(err.to_string().contains("aborted"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn rate_limited_is_retryable_with_delay() {
        let err = JobError::RateLimited { retry_after_ms: 1500 };
        assert!(err.is_retryable());
        assert_eq!(err.retry_after_ms(), Some(1500));
        assert_eq!(err.category(), "rate_limit");
    }

    #[test]
    fn upstream_retryable_depends_on_status() {
        let server = JobError::Upstream {
            status: 503,
            message: "unavailable".into(),
        };
        let throttled = JobError::Upstream {
            status: 429,
            message: "slow down".into(),
        };
        let bad_request = JobError::Upstream {
            status: 400,
            message: "bad audio".into(),
        };
        assert!(server.is_retryable());
        assert!(throttled.is_retryable());
        assert!(!bad_request.is_retryable());
        assert_eq!(bad_request.to_string(), "API error (400): bad audio");
    }

    #[test]
    fn transport_and_timeout_are_retryable() {
        assert!(JobError::Transport("reset".into()).is_retryable());
        assert!(JobError::Timeout { timeout_ms: 60_000 }.is_retryable());
        assert_eq!(JobError::Timeout { timeout_ms: 1 }.category(), "timeout");
    }

    #[test]
    fn io_from_conversion() {
        let err: JobError = std::io::Error::other("disk").into();
        assert!(matches!(err, JobError::Io(_)));
        assert_eq!(err.retry_after_ms(), None);
    }
}
