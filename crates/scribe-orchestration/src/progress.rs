//! Progress events emitted for each job.

use serde::{Deserialize, Serialize};

/// Phase of a job's lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStage {
    /// Job registered, input being validated or waiting for a slot.
    Preparing,
    /// Audio is with the transcription service.
    Transcribing,
    /// Transcript is with the formatting service.
    Formatting,
    /// Result is being written out.
    Saving,
    /// Finished successfully.
    Complete,
    /// Finished with an error, including cancellation.
    Error,
}

impl ProgressStage {
    /// Whether no further events follow for the job.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Preparing => "preparing",
            Self::Transcribing => "transcribing",
            Self::Formatting => "formatting",
            Self::Saving => "saving",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for ProgressStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extra data attached to a `complete` event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressDetails {
    /// Characters in the final text.
    pub text_length: usize,
    /// Wall time the job took.
    pub duration_ms: u64,
}

/// One progress update for one job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    /// Job this event belongs to.
    pub job_id: String,
    /// Current stage.
    pub stage: ProgressStage,
    /// Percent complete, 0–100.
    pub progress: u8,
    /// Human-readable status line.
    pub message: String,
    /// Present on `complete`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<ProgressDetails>,
    /// ISO 8601 timestamp.
    pub timestamp: String,
}

impl ProgressEvent {
    /// Create an event stamped with the current UTC time.
    ///
    /// `progress` is clamped to 100.
    #[must_use]
    pub fn new(
        job_id: impl Into<String>,
        stage: ProgressStage,
        progress: u8,
        message: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            stage,
            progress: progress.min(100),
            message: message.into(),
            details: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Attach completion details.
    #[must_use]
    pub fn with_details(mut self, details: ProgressDetails) -> Self {
        self.details = Some(details);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_stages() {
        assert!(ProgressStage::Complete.is_terminal());
        assert!(ProgressStage::Error.is_terminal());
        assert!(!ProgressStage::Preparing.is_terminal());
        assert!(!ProgressStage::Transcribing.is_terminal());
        assert!(!ProgressStage::Formatting.is_terminal());
        assert!(!ProgressStage::Saving.is_terminal());
    }

    #[test]
    fn progress_is_clamped() {
        let event = ProgressEvent::new("j", ProgressStage::Transcribing, 150, "working");
        assert_eq!(event.progress, 100);
    }

    #[test]
    fn serializes_wire_format() {
        let event = ProgressEvent::new("job-1", ProgressStage::Complete, 100, "done").with_details(
            ProgressDetails {
                text_length: 42,
                duration_ms: 1500,
            },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["jobId"], "job-1");
        assert_eq!(json["stage"], "complete");
        assert_eq!(json["progress"], 100);
        assert_eq!(json["details"]["textLength"], 42);
        assert_eq!(json["details"]["durationMs"], 1500);
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn details_omitted_when_absent() {
        let event = ProgressEvent::new("job-1", ProgressStage::Preparing, 5, "starting");
        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("details").is_none());
    }

    #[test]
    fn stage_display_matches_serde() {
        for stage in [
            ProgressStage::Preparing,
            ProgressStage::Transcribing,
            ProgressStage::Formatting,
            ProgressStage::Saving,
            ProgressStage::Complete,
            ProgressStage::Error,
        ] {
            let json = serde_json::to_value(stage).unwrap();
            assert_eq!(json, stage.to_string());
        }
    }
}
