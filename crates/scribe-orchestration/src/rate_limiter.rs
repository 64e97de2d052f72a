//! Sliding-window rate limiter for outbound remote calls.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use scribe_settings::RateLimitSettings;
use tokio::time::Instant;
use tracing::debug;

/// Default calls per window.
pub const DEFAULT_MAX_CALLS: usize = 10;
/// Default window length.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Bounds calls to at most `max_calls` within any trailing `window`.
///
/// Rejections are a plain `false`, never an error; callers query
/// [`time_until_reset`](Self::time_until_reset) to decide how long to wait.
pub struct RateLimiter {
    max_calls: usize,
    window: Duration,
    calls: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// Create a limiter allowing `max_calls` per `window`.
    pub fn new(max_calls: usize, window: Duration) -> Self {
        Self {
            max_calls,
            window,
            calls: Mutex::new(VecDeque::with_capacity(max_calls)),
        }
    }

    /// Create a limiter from [`RateLimitSettings`].
    pub fn from_settings(settings: &RateLimitSettings) -> Self {
        Self::new(settings.max_calls, settings.window())
    }

    /// Record a call if the budget allows it.
    ///
    /// Returns `false` without recording anything when the window is full.
    pub fn is_allowed(&self) -> bool {
        let now = Instant::now();
        let mut calls = self.calls.lock();
        self.prune(&mut calls, now);

        if calls.len() < self.max_calls {
            calls.push_back(now);
            true
        } else {
            debug!(
                max_calls = self.max_calls,
                window_ms = self.window.as_millis() as u64,
                "rate limit reached"
            );
            false
        }
    }

    /// Time until the oldest recorded call leaves the window.
    ///
    /// Zero when nothing is recorded or the oldest call has already expired.
    pub fn time_until_reset(&self) -> Duration {
        let calls = self.calls.lock();
        calls.front().map_or(Duration::ZERO, |oldest| {
            (*oldest + self.window).saturating_duration_since(Instant::now())
        })
    }

    /// Calls currently inside the window.
    pub fn recorded_calls(&self) -> usize {
        let mut calls = self.calls.lock();
        self.prune(&mut calls, Instant::now());
        calls.len()
    }

    /// Calls allowed per window.
    pub fn max_calls(&self) -> usize {
        self.max_calls
    }

    /// Window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    fn prune(&self, calls: &mut VecDeque<Instant>, now: Instant) {
        while let Some(&oldest) = calls.front() {
            if now.duration_since(oldest) >= self.window {
                let _ = calls.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CALLS, DEFAULT_WINDOW)
    }
}
