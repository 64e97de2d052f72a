//! Job orchestrator: tracks in-flight remote-call jobs.
//!
//! Each job is registered with a [`CancellationToken`] for the whole of its
//! processing and removed exactly once, by whichever comes first of
//! [`JobOrchestrator::cancel_job`] or the job's own [`JobGuard`] drop.
//! Progress goes out through a shared [`ProgressEmitter`]; a per-job
//! [`JobReporter`] keeps one job's events in stage order and lets through
//! exactly one terminal event.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use scribe_settings::JobSettings;
use serde::{Deserialize, Serialize};
use tempfile::{NamedTempFile, TempDir};
use tokio::sync::{Semaphore, broadcast};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::client::{ClientCacheStats, FormatOptions, SpeechClient, TranscribeOptions, Transcription};
use crate::emitter::{JobSubscription, ProgressEmitter};
use crate::errors::{JobError, Result};
use crate::progress::{ProgressDetails, ProgressEvent, ProgressStage};

const PREPARING_PROGRESS: u8 = 5;
const QUEUED_PROGRESS: u8 = 8;
const TRANSCRIBING_PROGRESS: u8 = 15;
const TRANSCRIBING_CEILING: u8 = 65;
const FORMATTING_PROGRESS: u8 = 70;
const FORMATTING_CEILING: u8 = 95;
const PROGRESS_STEP: u8 = 5;

/// Orchestrator limits and scratch storage.
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Jobs allowed past `preparing` at once.
    pub max_concurrent_jobs: usize,
    /// Registered jobs allowed to wait for a slot.
    pub max_queued_jobs: usize,
    /// Interval of simulated progress updates.
    pub progress_tick: Duration,
    /// Scratch directory for in-memory inputs. A private temp dir when `None`.
    pub scratch_dir: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from_settings(&JobSettings::default())
    }
}

impl OrchestratorConfig {
    /// Build from [`JobSettings`].
    pub fn from_settings(settings: &JobSettings) -> Self {
        Self {
            max_concurrent_jobs: settings.max_concurrent_jobs.max(1),
            max_queued_jobs: settings.max_queued_jobs,
            progress_tick: Duration::from_millis(settings.progress_tick_ms.max(1)),
            scratch_dir: settings.scratch_dir.clone(),
        }
    }
}

/// What to do with a job's input.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobOptions {
    /// Transcription request options.
    pub transcribe: TranscribeOptions,
    /// Run a formatting pass after transcription when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<FormatOptions>,
}

/// Final outcome of a job. Failures never escape as `Err`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    /// Job this result belongs to.
    pub job_id: String,
    /// Whether the job completed.
    pub success: bool,
    /// Raw transcript.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Formatted transcript, when formatting was requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formatted_text: Option<String>,
    /// Error message on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// [`JobError::category`] on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_category: Option<String>,
    /// Time from start to settlement.
    pub duration_ms: u64,
}

impl JobResult {
    fn success(job_id: &str, output: JobOutput, duration_ms: u64) -> Self {
        Self {
            job_id: job_id.to_string(),
            success: true,
            text: Some(output.transcription.text),
            formatted_text: output.formatted,
            error: None,
            error_category: None,
            duration_ms,
        }
    }

    fn failure(job_id: &str, err: &JobError, duration_ms: u64) -> Self {
        Self {
            job_id: job_id.to_string(),
            success: false,
            text: None,
            formatted_text: None,
            error: Some(err.to_string()),
            error_category: Some(err.category().to_string()),
            duration_ms,
        }
    }
}

struct JobOutput {
    transcription: Transcription,
    formatted: Option<String>,
}

/// Serializes one job's events and admits a single terminal event.
struct JobReporter {
    job_id: String,
    emitter: Arc<ProgressEmitter>,
    finished: Mutex<bool>,
}

impl JobReporter {
    fn report(&self, stage: ProgressStage, progress: u8, message: impl Into<String>) -> bool {
        self.report_event(ProgressEvent::new(&self.job_id, stage, progress, message))
    }

    /// Returns `false` if a terminal event was already reported.
    fn report_event(&self, event: ProgressEvent) -> bool {
        let mut finished = self.finished.lock();
        if *finished {
            return false;
        }
        *finished = event.stage.is_terminal();
        let _ = self.emitter.emit(event);
        true
    }
}

struct ActiveJob {
    generation: u64,
    cancel: CancellationToken,
    reporter: Arc<JobReporter>,
}

/// Deregisters its job on drop unless `cancel_job` already did.
struct JobGuard<'a> {
    jobs: &'a Mutex<HashMap<String, ActiveJob>>,
    job_id: String,
    generation: u64,
}

impl Drop for JobGuard<'_> {
    fn drop(&mut self) {
        let mut jobs = self.jobs.lock();
        if jobs
            .get(&self.job_id)
            .is_some_and(|job| job.generation == self.generation)
        {
            let _ = jobs.remove(&self.job_id);
            debug!(job_id = %self.job_id, "job deregistered");
        }
    }
}

/// Coordinates concurrent transcription jobs.
pub struct JobOrchestrator {
    client: Arc<dyn SpeechClient>,
    emitter: Arc<ProgressEmitter>,
    jobs: Mutex<HashMap<String, ActiveJob>>,
    /// Permits for jobs allowed to call the remote service.
    slots: Arc<Semaphore>,
    generation: AtomicU64,
    config: OrchestratorConfig,
    /// Private scratch directory, removed with the orchestrator.
    scratch: TempDir,
}

impl JobOrchestrator {
    /// Create an orchestrator over `client`.
    ///
    /// Scratch files live in a private directory created under
    /// `config.scratch_dir` (or the system temp dir). Only that directory is
    /// ever emptied; other contents of a configured directory are left alone.
    ///
    /// Fails only if the scratch directory cannot be created.
    pub fn new(client: Arc<dyn SpeechClient>, config: OrchestratorConfig) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        let _ = builder.prefix("scribe-jobs-");
        let scratch = match &config.scratch_dir {
            Some(parent) => {
                std::fs::create_dir_all(parent)?;
                builder.tempdir_in(parent)?
            }
            None => builder.tempdir()?,
        };
        debug!(path = %scratch.path().display(), "scratch directory ready");

        Ok(Self {
            client,
            emitter: Arc::new(ProgressEmitter::new()),
            jobs: Mutex::new(HashMap::new()),
            slots: Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1))),
            generation: AtomicU64::new(0),
            config,
            scratch,
        })
    }

    /// Subscribe to progress events of every job.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.emitter.subscribe()
    }

    /// Subscribe to the progress of one job, ending after its terminal event.
    pub fn subscribe_job(&self, job_id: impl Into<String>) -> JobSubscription {
        self.emitter.subscribe_job(job_id)
    }

    /// Shared progress emitter.
    pub fn progress_emitter(&self) -> &Arc<ProgressEmitter> {
        &self.emitter
    }

    /// Private directory holding scratch files for in-memory inputs.
    pub fn scratch_dir(&self) -> &Path {
        self.scratch.path()
    }

    /// Active configuration.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Transcribe (and optionally format) the audio file at `audio_path`.
    ///
    /// `job_id` defaults to a time-ordered id from [`new_job_id`]. The job is
    /// registered for exactly as long as this future runs.
    pub async fn process_job(
        &self,
        audio_path: &Path,
        options: &JobOptions,
        job_id: Option<String>,
    ) -> JobResult {
        let job_id = job_id.unwrap_or_else(new_job_id);
        self.execute(job_id, audio_path, options).await
    }

    /// Write `audio` to a scratch file and process it like [`process_job`](Self::process_job).
    ///
    /// The scratch file is removed whatever the outcome.
    pub async fn process_job_from_blob(
        &self,
        audio: &[u8],
        extension: &str,
        options: &JobOptions,
        job_id: Option<String>,
    ) -> JobResult {
        let job_id = job_id.unwrap_or_else(new_job_id);
        let scratch = match self.write_scratch_file(&job_id, audio, extension).await {
            Ok(file) => file,
            Err(err) => {
                error!(job_id, error = %err, "failed to write scratch file");
                let _ = self.emitter.emit(ProgressEvent::new(
                    &job_id,
                    ProgressStage::Error,
                    0,
                    err.to_string(),
                ));
                return JobResult::failure(&job_id, &err, 0);
            }
        };

        let result = self.execute(job_id, scratch.path(), options).await;
        if let Err(e) = scratch.close() {
            // Already gone when cleanup() swept the directory
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(error = %e, "failed to remove scratch file");
            }
        }
        result
    }

    /// Cancel a registered job.
    ///
    /// Reports the `error` event, signals the token, and deregisters the job.
    /// Returns `false` for unknown or already finished jobs.
    #[instrument(skip(self))]
    pub fn cancel_job(&self, job_id: &str) -> bool {
        let Some(job) = self.jobs.lock().remove(job_id) else {
            debug!(job_id, "cancel requested for unknown job");
            return false;
        };
        warn!(job_id, "job cancelled");
        let _ = job
            .reporter
            .report(ProgressStage::Error, 0, format!("Job {job_id} aborted by user"));
        job.cancel.cancel();
        true
    }

    /// Ids of all registered jobs, sorted.
    pub fn current_jobs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.jobs.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stats of the client's caches.
    pub fn cache_stats(&self) -> ClientCacheStats {
        self.client.cache_stats()
    }

    /// Drop every cached result in the client.
    pub fn clear_caches(&self) {
        self.client.clear_caches();
    }

    /// Cancel every registered job and empty the private scratch directory.
    #[instrument(skip(self))]
    pub async fn cleanup(&self) -> Result<()> {
        let ids = self.current_jobs();
        info!(jobs = ids.len(), "orchestrator cleanup");
        for id in &ids {
            let _ = self.cancel_job(id);
        }

        let mut entries = tokio::fs::read_dir(self.scratch_dir()).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let removed = if entry.file_type().await?.is_dir() {
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_file(&path).await
            };
            match removed {
                Ok(()) => debug!(path = %path.display(), "removed scratch entry"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    #[instrument(skip_all, fields(job_id = %job_id, path = %audio_path.display()))]
    async fn execute(&self, job_id: String, audio_path: &Path, options: &JobOptions) -> JobResult {
        let started = Instant::now();
        let elapsed_ms = || started.elapsed().as_millis() as u64;

        let (guard, cancel, reporter) = match self.register(&job_id) {
            Ok(registered) => registered,
            Err(err @ JobError::DuplicateJob { .. }) => {
                // The id belongs to the running job; its observers get no event
                warn!(error = %err, "job rejected");
                return JobResult::failure(&job_id, &err, 0);
            }
            Err(err) => {
                warn!(error = %err, "job rejected");
                let _ = self.emitter.emit(ProgressEvent::new(
                    &job_id,
                    ProgressStage::Error,
                    0,
                    err.to_string(),
                ));
                return JobResult::failure(&job_id, &err, 0);
            }
        };
        info!("job started");

        let outcome = self.run(audio_path, options, &cancel, &reporter).await;
        let duration_ms = elapsed_ms();

        let result = match outcome {
            Ok(output) => {
                let text_length = output
                    .formatted
                    .as_deref()
                    .unwrap_or(&output.transcription.text)
                    .chars()
                    .count();
                let event = ProgressEvent::new(
                    &job_id,
                    ProgressStage::Complete,
                    100,
                    "Transcription complete",
                )
                .with_details(ProgressDetails {
                    text_length,
                    duration_ms,
                });
                if reporter.report_event(event) {
                    info!(duration_ms, text_length, "job complete");
                    JobResult::success(&job_id, output, duration_ms)
                } else {
                    // cancel_job reported first; its outcome stands
                    JobResult::failure(&job_id, &JobError::Cancelled, duration_ms)
                }
            }
            Err(JobError::Cancelled) => {
                let _ = reporter.report(
                    ProgressStage::Error,
                    0,
                    format!("Job {job_id} aborted by user"),
                );
                JobResult::failure(&job_id, &JobError::Cancelled, duration_ms)
            }
            Err(err) => {
                error!(error = %err, category = err.category(), "job failed");
                let _ = reporter.report(ProgressStage::Error, 0, err.to_string());
                JobResult::failure(&job_id, &err, duration_ms)
            }
        };

        drop(guard);
        result
    }

    fn register(
        &self,
        job_id: &str,
    ) -> Result<(JobGuard<'_>, CancellationToken, Arc<JobReporter>)> {
        let mut jobs = self.jobs.lock();
        if jobs.contains_key(job_id) {
            return Err(JobError::DuplicateJob {
                job_id: job_id.to_string(),
            });
        }
        let limit = self.config.max_concurrent_jobs + self.config.max_queued_jobs;
        if jobs.len() >= limit {
            return Err(JobError::Busy {
                registered: jobs.len(),
                limit,
            });
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let reporter = Arc::new(JobReporter {
            job_id: job_id.to_string(),
            emitter: Arc::clone(&self.emitter),
            finished: Mutex::new(false),
        });
        let _ = jobs.insert(
            job_id.to_string(),
            ActiveJob {
                generation,
                cancel: cancel.clone(),
                reporter: Arc::clone(&reporter),
            },
        );

        let guard = JobGuard {
            jobs: &self.jobs,
            job_id: job_id.to_string(),
            generation,
        };
        Ok((guard, cancel, reporter))
    }

    async fn run(
        &self,
        audio_path: &Path,
        options: &JobOptions,
        cancel: &CancellationToken,
        reporter: &JobReporter,
    ) -> Result<JobOutput> {
        let _ = reporter.report(
            ProgressStage::Preparing,
            PREPARING_PROGRESS,
            "Preparing audio file",
        );

        if !tokio::fs::try_exists(audio_path).await? {
            return Err(JobError::NotFound {
                path: audio_path.to_path_buf(),
            });
        }

        // Held until the job settles
        let _permit = match Arc::clone(&self.slots).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                let _ = reporter.report(
                    ProgressStage::Preparing,
                    QUEUED_PROGRESS,
                    "Waiting for an available slot",
                );
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Err(JobError::Cancelled),
                    permit = Arc::clone(&self.slots).acquire_owned() => permit
                        .map_err(|_| JobError::Unexpected("job slots closed".into()))?,
                }
            }
        };

        let _ = reporter.report(
            ProgressStage::Transcribing,
            TRANSCRIBING_PROGRESS,
            "Transcribing audio",
        );
        let transcription = self
            .race(
                cancel,
                reporter,
                ProgressStage::Transcribing,
                (TRANSCRIBING_PROGRESS, TRANSCRIBING_CEILING),
                self.client.transcribe(audio_path, &options.transcribe),
            )
            .await?;

        let formatted = match &options.format {
            Some(format) => {
                let _ = reporter.report(
                    ProgressStage::Formatting,
                    FORMATTING_PROGRESS,
                    "Formatting transcript",
                );
                Some(
                    self.race(
                        cancel,
                        reporter,
                        ProgressStage::Formatting,
                        (FORMATTING_PROGRESS, FORMATTING_CEILING),
                        self.client.format(&transcription.text, format),
                    )
                    .await?,
                )
            }
            None => None,
        };

        Ok(JobOutput {
            transcription,
            formatted,
        })
    }

    /// Await `call` unless `cancel` fires first.
    ///
    /// Emits simulated progress for `stage` on every tick, climbing from
    /// `range.0` by `PROGRESS_STEP` up to `range.1`. The ticker is dropped
    /// with this future, so it stops the moment the race settles.
    async fn race<T, F>(
        &self,
        cancel: &CancellationToken,
        reporter: &JobReporter,
        stage: ProgressStage,
        range: (u8, u8),
        call: F,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let mut call = std::pin::pin!(call);
        let tick = self.config.progress_tick;
        let mut ticker = tokio::time::interval_at(Instant::now() + tick, tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let (mut progress, ceiling) = range;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(JobError::Cancelled),
                result = &mut call => return result,
                _ = ticker.tick() => {
                    if progress < ceiling {
                        progress = progress.saturating_add(PROGRESS_STEP).min(ceiling);
                        let _ = reporter.report(stage, progress, stage_message(stage));
                    }
                }
            }
        }
    }

    async fn write_scratch_file(
        &self,
        job_id: &str,
        audio: &[u8],
        extension: &str,
    ) -> Result<NamedTempFile> {
        let file = tempfile::Builder::new()
            .prefix(&format!("{}-", sanitize_file_stem(job_id)))
            .suffix(&format!(".{}", sanitize_file_stem(extension)))
            .tempfile_in(self.scratch_dir())?;
        tokio::fs::write(file.path(), audio).await?;
        debug!(job_id, path = %file.path().display(), bytes = audio.len(), "wrote scratch file");
        Ok(file)
    }
}

fn stage_message(stage: ProgressStage) -> &'static str {
    match stage {
        ProgressStage::Formatting => "Formatting transcript",
        _ => "Transcribing audio",
    }
}

fn sanitize_file_stem(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Fresh time-ordered job id (`job_<uuid v7>`).
pub fn new_job_id() -> String {
    format!("job_{}", uuid::Uuid::now_v7().simple())
}
