//! Test doubles shared by unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::backend::SpeechBackend;
use crate::client::{FormatOptions, TranscribeOptions, Transcription};
use crate::errors::{JobError, Result};

#[derive(Default)]
struct MockState {
    transcribe_calls: AtomicUsize,
    format_calls: AtomicUsize,
    fail_status: Mutex<Option<u16>>,
    delay: Mutex<Duration>,
}

/// In-memory backend with call counters, optional latency, and failures.
#[derive(Clone, Default)]
pub(crate) struct MockBackend {
    state: Arc<MockState>,
}

impl MockBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Every call sleeps for `delay` before answering.
    pub(crate) fn with_delay(delay: Duration) -> Self {
        let backend = Self::new();
        *backend.state.delay.lock() = delay;
        backend
    }

    /// Answer every call with an upstream error of `status`, or succeed on `None`.
    pub(crate) fn fail_with_status(&self, status: Option<u16>) {
        *self.state.fail_status.lock() = status;
    }

    pub(crate) fn transcribe_calls(&self) -> usize {
        self.state.transcribe_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn format_calls(&self) -> usize {
        self.state.format_calls.load(Ordering::SeqCst)
    }

    async fn simulate(&self) -> Result<()> {
        let delay = *self.state.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match *self.state.fail_status.lock() {
            Some(status) => Err(JobError::Upstream {
                status,
                message: "mock failure".into(),
            }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl SpeechBackend for MockBackend {
    async fn transcribe(
        &self,
        audio: Vec<u8>,
        _file_name: &str,
        options: &TranscribeOptions,
    ) -> Result<Transcription> {
        let _ = self.state.transcribe_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate().await?;
        Ok(Transcription {
            text: format!("transcript of {} bytes", audio.len()),
            language: options.language.clone(),
            duration_seconds: Some(1.5),
        })
    }

    async fn format(&self, text: &str, options: &FormatOptions) -> Result<String> {
        let _ = self.state.format_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate().await?;
        Ok(format!("[{:?}] {text}", options.style))
    }
}
