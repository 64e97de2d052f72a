//! Network backends for the speech and formatting service.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use scribe_settings::ApiSettings;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::client::{FormatOptions, TranscribeOptions, Transcription};
use crate::errors::{JobError, Result};

/// Raw remote operations, without caching or rate limiting.
#[async_trait]
pub trait SpeechBackend: Send + Sync {
    /// Send audio bytes for transcription.
    async fn transcribe(
        &self,
        audio: Vec<u8>,
        file_name: &str,
        options: &TranscribeOptions,
    ) -> Result<Transcription>;

    /// Send text for formatting.
    async fn format(&self, text: &str, options: &FormatOptions) -> Result<String>;
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
    language: Option<String>,
    duration: Option<f64>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

/// Backend for OpenAI-compatible `/audio/transcriptions` and `/chat/completions`.
pub struct HttpSpeechBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    transcription_model: String,
    format_model: String,
    timeout: Duration,
}

impl HttpSpeechBackend {
    /// Create a backend from [`ApiSettings`].
    pub fn new(settings: &ApiSettings) -> Result<Self> {
        let timeout = settings.timeout();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("scribe/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| JobError::Unexpected(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            transcription_model: settings.transcription_model.clone(),
            format_model: settings.format_model.clone(),
            timeout,
        })
    }

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        let builder = self.client.post(format!("{}{path}", self.base_url));
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    fn send_error(&self, e: &reqwest::Error) -> JobError {
        if e.is_timeout() {
            JobError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            }
        } else {
            JobError::Transport(e.to_string())
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = builder.send().await.map_err(|e| self.send_error(&e))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_ms = retry_after_ms(response.headers());
            return Err(JobError::RateLimited { retry_after_ms });
        }

        let body = response.text().await.unwrap_or_default();
        Err(JobError::Upstream {
            status: status.as_u16(),
            message: upstream_message(&body),
        })
    }
}

/// `Retry-After` delta-seconds in milliseconds, 0 when absent or not a number.
fn retry_after_ms(headers: &reqwest::header::HeaderMap) -> u64 {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(0, |secs| secs.saturating_mul(1000))
}

/// Pull `error.message` out of an error body, falling back to the raw text.
fn upstream_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(String::from))
        .unwrap_or_else(|| {
            let trimmed = body.trim();
            if trimmed.is_empty() {
                "empty error response".to_string()
            } else {
                trimmed.to_string()
            }
        })
}

#[async_trait]
impl SpeechBackend for HttpSpeechBackend {
    async fn transcribe(
        &self,
        audio: Vec<u8>,
        file_name: &str,
        options: &TranscribeOptions,
    ) -> Result<Transcription> {
        debug!(bytes = audio.len(), file_name, "sending transcription request");
        let mut form = Form::new()
            .part("file", Part::bytes(audio).file_name(file_name.to_string()))
            .text("model", self.transcription_model.clone())
            .text("response_format", "verbose_json");
        if let Some(language) = &options.language {
            form = form.text("language", language.clone());
        }
        if let Some(prompt) = &options.prompt {
            form = form.text("prompt", prompt.clone());
        }
        if let Some(temperature) = options.temperature {
            form = form.text("temperature", temperature.to_string());
        }

        let response = self
            .send(self.request("/audio/transcriptions").multipart(form))
            .await?;
        let body: TranscriptionResponse = response
            .json()
            .await
            .map_err(|e| JobError::Unexpected(format!("invalid transcription response: {e}")))?;

        Ok(Transcription {
            text: body.text,
            language: body.language.or_else(|| options.language.clone()),
            duration_seconds: body.duration,
        })
    }

    async fn format(&self, text: &str, options: &FormatOptions) -> Result<String> {
        debug!(chars = text.len(), style = ?options.style, "sending format request");
        let system = match &options.instructions {
            Some(extra) => format!("{}\n\n{extra}", options.style.system_prompt()),
            None => options.style.system_prompt().to_string(),
        };
        let mut payload = json!({
            "model": self.format_model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": text},
            ],
        });
        if let Some(temperature) = options.temperature {
            payload["temperature"] = json!(temperature);
        }

        let response = self
            .send(self.request("/chat/completions").json(&payload))
            .await?;
        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| JobError::Unexpected(format!("invalid completion response: {e}")))?;

        body.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|content| content.trim().to_string())
            .ok_or_else(|| JobError::Unexpected("completion contained no text".into()))
    }
}
