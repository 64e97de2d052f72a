//! Remote speech/format service settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Settings for the OpenAI-compatible transcription and formatting endpoints.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiSettings {
    /// Base URL, without a trailing slash (e.g. `https://api.openai.com/v1`).
    pub base_url: String,
    /// Model used for `/audio/transcriptions`.
    pub transcription_model: String,
    /// Model used for `/chat/completions` formatting.
    pub format_model: String,
    /// Per-request timeout in milliseconds.
    pub timeout_ms: u64,
    /// Bearer token. Read from file or `SCRIBE_API_KEY`, never written back out.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            transcription_model: "whisper-1".to_string(),
            format_model: "gpt-4o-mini".to_string(),
            timeout_ms: 60_000,
            api_key: None,
        }
    }
}

impl ApiSettings {
    /// Request timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
