//! # scribe-settings
//!
//! Layered configuration for the scribe request orchestration layer.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`ScribeSettings::default()`]
//! 2. **User file**: `~/.scribe/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `SCRIBE_*` overrides (highest priority)
//!
//! There is no global instance. The binary loads settings once and hands
//! the pieces to the cache, rate limiter, and orchestrator constructors.
//!
//! ## Crate Position
//!
//! Standalone (no scribe crate dependencies).
//! Depended on by: scribe-logging, scribe-orchestration, scribe-cli.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
