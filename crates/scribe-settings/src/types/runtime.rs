//! Cache, rate limit, and job orchestration settings.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Result cache settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheSettings {
    /// Maximum number of entries per cache.
    pub max_size: usize,
    /// TTL applied when a value is stored without an explicit one.
    pub default_ttl_ms: u64,
    /// Interval of the background expiry sweep. `0` disables the timer.
    pub cleanup_interval_ms: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_size: 100,
            default_ttl_ms: 60 * 60 * 1000,
            cleanup_interval_ms: 5 * 60 * 1000,
        }
    }
}

impl CacheSettings {
    /// Default TTL as a [`Duration`].
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    /// Sweep interval, or `None` when the periodic sweep is disabled.
    pub fn cleanup_interval(&self) -> Option<Duration> {
        (self.cleanup_interval_ms > 0).then(|| Duration::from_millis(self.cleanup_interval_ms))
    }
}

/// Sliding-window rate limit settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitSettings {
    /// Calls allowed per window.
    pub max_calls: usize,
    /// Window length in milliseconds.
    pub window_ms: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_calls: 10,
            window_ms: 60_000,
        }
    }
}

impl RateLimitSettings {
    /// Window as a [`Duration`].
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Job orchestration settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobSettings {
    /// Jobs allowed to call the remote service at the same time.
    pub max_concurrent_jobs: usize,
    /// Jobs allowed to wait for a slot before new ones are rejected.
    pub max_queued_jobs: usize,
    /// Interval between simulated progress updates.
    pub progress_tick_ms: u64,
    /// Directory for scratch files. A fresh temp dir is used when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scratch_dir: Option<PathBuf>,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 3,
            max_queued_jobs: 10,
            progress_tick_ms: 500,
            scratch_dir: None,
        }
    }
}
