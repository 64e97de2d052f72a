//! Remote-call collaborator used by the orchestrator.
//!
//! [`SpeechClient`] is the contract the orchestrator depends on.
//! [`CachedSpeechClient`] implements it over any [`SpeechBackend`] by
//! consulting the result caches first and the rate limiter only on a miss.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use scribe_settings::ScribeSettings;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::backend::SpeechBackend;
use crate::cache::{CacheManager, CacheStats, generate_content_key, key_for_bytes};
use crate::errors::{JobError, Result};
use crate::rate_limiter::RateLimiter;

/// Options sent with a transcription request.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscribeOptions {
    /// ISO 639-1 language hint (e.g. "en").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Vocabulary or style hint for the model.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Sampling temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

/// How a transcript is rewritten.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatStyle {
    /// Fix punctuation and remove filler words, keep wording.
    #[default]
    Clean,
    /// Markdown note with headings and bullet points.
    Notes,
    /// Short summary.
    Summary,
}

impl FormatStyle {
    /// System prompt for this style.
    pub fn system_prompt(self) -> &'static str {
        match self {
            Self::Clean => {
                "Clean up the following voice transcript. Fix punctuation and capitalization, \
                 remove filler words and false starts, and keep the speaker's wording. \
                 Return only the cleaned text."
            }
            Self::Notes => {
                "Turn the following voice transcript into a well-structured Markdown note. \
                 Use headings and bullet points where they help. Do not invent content. \
                 Return only the note."
            }
            Self::Summary => {
                "Summarize the following voice transcript in a few concise sentences. \
                 Return only the summary."
            }
        }
    }
}

impl std::str::FromStr for FormatStyle {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "clean" => Ok(Self::Clean),
            "notes" => Ok(Self::Notes),
            "summary" => Ok(Self::Summary),
            other => Err(format!("unknown format style: {other}")),
        }
    }
}

/// Options sent with a formatting request.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatOptions {
    /// Output style.
    pub style: FormatStyle,
    /// Extra instructions appended to the system prompt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    /// Sampling temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

/// Transcription returned by the remote service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transcription {
    /// Transcribed text.
    pub text: String,
    /// Detected or requested language.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Audio duration reported by the service.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
}

/// Stats for both result caches.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientCacheStats {
    /// Transcription cache.
    pub transcriptions: CacheStats,
    /// Formatting cache.
    pub formats: CacheStats,
}

/// Transcribe and format operations as seen by the orchestrator.
#[async_trait]
pub trait SpeechClient: Send + Sync {
    /// Transcribe the audio file at `audio_path`.
    async fn transcribe(&self, audio_path: &Path, options: &TranscribeOptions)
    -> Result<Transcription>;

    /// Rewrite `text` according to `options`.
    async fn format(&self, text: &str, options: &FormatOptions) -> Result<String>;

    /// Stats for the caches behind this client.
    fn cache_stats(&self) -> ClientCacheStats;

    /// Drop every cached result.
    fn clear_caches(&self);
}

/// [`SpeechClient`] that memoizes results and rate-limits backend calls.
///
/// Cache hits return immediately and never count against the rate budget.
pub struct CachedSpeechClient<B> {
    backend: B,
    transcriptions: Arc<CacheManager<Transcription>>,
    formats: Arc<CacheManager<String>>,
    limiter: Arc<RateLimiter>,
}

impl<B: SpeechBackend> CachedSpeechClient<B> {
    /// Wrap `backend` with injected caches and limiter.
    pub fn new(
        backend: B,
        transcriptions: Arc<CacheManager<Transcription>>,
        formats: Arc<CacheManager<String>>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            backend,
            transcriptions,
            formats,
            limiter,
        }
    }

    /// Build caches and limiter from settings.
    ///
    /// The cache sweep timers are not started; see
    /// [`start_cache_cleanup`](Self::start_cache_cleanup).
    pub fn from_settings(backend: B, settings: &ScribeSettings) -> Self {
        Self::new(
            backend,
            Arc::new(CacheManager::from_settings(&settings.cache)),
            Arc::new(CacheManager::from_settings(&settings.cache)),
            Arc::new(RateLimiter::from_settings(&settings.rate_limit)),
        )
    }

    /// Start the periodic expiry sweep on both caches.
    pub fn start_cache_cleanup(&self, interval: Duration) {
        self.transcriptions.start_cleanup_task(interval);
        self.formats.start_cleanup_task(interval);
    }

    /// Stop the sweep timers and drop all cached results.
    pub fn destroy(&self) {
        self.transcriptions.destroy();
        self.formats.destroy();
    }

    /// Shared rate limiter.
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Wrapped backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn acquire_call_slot(&self) -> Result<()> {
        if self.limiter.is_allowed() {
            Ok(())
        } else {
            let retry_after_ms = self.limiter.time_until_reset().as_millis() as u64;
            warn!(retry_after_ms, "outbound call rejected by rate limiter");
            Err(JobError::RateLimited { retry_after_ms })
        }
    }
}

#[async_trait]
impl<B: SpeechBackend> SpeechClient for CachedSpeechClient<B> {
    #[instrument(skip(self, options), fields(path = %audio_path.display()))]
    async fn transcribe(
        &self,
        audio_path: &Path,
        options: &TranscribeOptions,
    ) -> Result<Transcription> {
        let audio = match tokio::fs::read(audio_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(JobError::NotFound {
                    path: audio_path.to_path_buf(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let key = generate_content_key(&key_for_bytes(&audio), options)?;
        if let Some(hit) = self.transcriptions.get(&key) {
            debug!("transcription cache hit");
            return Ok(hit);
        }

        self.acquire_call_slot()?;
        let file_name = audio_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("audio.webm")
            .to_string();
        debug!(bytes = audio.len(), "transcription cache miss, calling backend");
        let transcription = self.backend.transcribe(audio, &file_name, options).await?;
        self.transcriptions.set(key, transcription.clone(), None);
        Ok(transcription)
    }

    #[instrument(skip_all, fields(chars = text.len(), style = ?options.style))]
    async fn format(&self, text: &str, options: &FormatOptions) -> Result<String> {
        let key = generate_content_key(text, options)?;
        if let Some(hit) = self.formats.get(&key) {
            debug!("format cache hit");
            return Ok(hit);
        }

        self.acquire_call_slot()?;
        let formatted = self.backend.format(text, options).await?;
        self.formats.set(key, formatted.clone(), None);
        Ok(formatted)
    }

    fn cache_stats(&self) -> ClientCacheStats {
        ClientCacheStats {
            transcriptions: self.transcriptions.stats(),
            formats: self.formats.stats(),
        }
    }

    fn clear_caches(&self) {
        self.transcriptions.clear();
        self.formats.clear();
    }
}
