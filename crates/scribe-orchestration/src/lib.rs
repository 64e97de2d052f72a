//! # scribe-orchestration
//!
//! Request orchestration for remote speech transcription and formatting.
//!
//! - **Cache**: Content-addressed TTL cache with LRU eviction and a periodic sweep
//! - **Rate limiter**: Sliding-window admission of outbound calls
//! - **Client**: [`SpeechClient`] contract plus a cached, rate-limited implementation
//! - **Backend**: HTTP transport to an OpenAI-compatible service
//! - **Orchestrator**: Cancellable jobs with bounded concurrency and progress events
//!
//! ## Crate Position
//!
//! Depends on: scribe-settings.
//! Depended on by: scribe-cli.

#![deny(unsafe_code)]

pub mod backend;
pub mod cache;
pub mod client;
pub mod emitter;
pub mod errors;
pub mod orchestrator;
pub mod progress;
pub mod rate_limiter;

#[cfg(test)]
mod testutil;

pub use backend::{HttpSpeechBackend, SpeechBackend};
pub use cache::{CacheManager, CacheStats, generate_content_key, generate_file_key, key_for_bytes};
pub use client::{
    CachedSpeechClient, ClientCacheStats, FormatOptions, FormatStyle, SpeechClient,
    TranscribeOptions, Transcription,
};
pub use emitter::{JobSubscription, ProgressEmitter};
pub use errors::{JobError, Result};
pub use orchestrator::{JobOptions, JobOrchestrator, JobResult, OrchestratorConfig, new_job_id};
pub use progress::{ProgressDetails, ProgressEvent, ProgressStage};
pub use rate_limiter::RateLimiter;
