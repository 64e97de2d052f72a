//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` for the JSON file
//! format. Each type implements [`Default`] with production default values,
//! and every section is `#[serde(default)]` so a partial file is valid.

mod api;
mod runtime;

pub use api::*;
pub use runtime::*;

use serde::{Deserialize, Serialize};

/// Root settings type.
///
/// Loaded from `~/.scribe/settings.json` with defaults applied for missing
/// fields. Environment variables can override specific values.
///
/// ```json
/// {
///   "cache": { "maxSize": 50 },
///   "rateLimit": { "maxCalls": 5, "windowMs": 30000 }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScribeSettings {
    /// Result cache sizing and expiry.
    pub cache: CacheSettings,
    /// Outbound call budget.
    pub rate_limit: RateLimitSettings,
    /// Job orchestration limits.
    pub jobs: JobSettings,
    /// Remote speech/format service.
    pub api: ApiSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

impl ScribeSettings {
    /// Correct values that would break orchestration invariants.
    ///
    /// Called automatically during loading. Zero capacities and windows
    /// are raised to 1 with a warning rather than rejected.
    pub fn validate(&mut self) {
        fn at_least_one_usize(val: &mut usize, name: &str) {
            if *val == 0 {
                tracing::warn!("{name} must be at least 1, correcting");
                *val = 1;
            }
        }

        fn at_least_one_u64(val: &mut u64, name: &str) {
            if *val == 0 {
                tracing::warn!("{name} must be at least 1, correcting");
                *val = 1;
            }
        }

        at_least_one_usize(&mut self.cache.max_size, "cache.maxSize");
        at_least_one_usize(&mut self.rate_limit.max_calls, "rateLimit.maxCalls");
        at_least_one_u64(&mut self.rate_limit.window_ms, "rateLimit.windowMs");
        at_least_one_usize(&mut self.jobs.max_concurrent_jobs, "jobs.maxConcurrentJobs");
        at_least_one_u64(&mut self.jobs.progress_tick_ms, "jobs.progressTickMs");
        at_least_one_u64(&mut self.api.timeout_ms, "api.timeoutMs");
    }
}

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Minimum level when `RUST_LOG` is not set.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
