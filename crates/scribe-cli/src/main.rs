//! # scribe
//!
//! Command-line front end: wires settings, logging, the HTTP backend, and the
//! job orchestrator together for one transcription job.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use scribe_orchestration::{
    CachedSpeechClient, FormatOptions, FormatStyle, HttpSpeechBackend, JobOptions,
    JobOrchestrator, JobResult, JobSubscription, OrchestratorConfig, SpeechClient,
    TranscribeOptions, new_job_id,
};
use scribe_settings::ScribeSettings;

/// Transcribe and format voice recordings.
#[derive(Parser, Debug)]
#[command(name = "scribe", version, about = "Transcribe and format voice recordings")]
struct Cli {
    /// Settings file (defaults to `~/.scribe/settings.json`).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Transcribe an audio file.
    Transcribe(TranscribeArgs),
    /// Print the effective settings as JSON.
    Config,
}

#[derive(Args, Debug)]
struct TranscribeArgs {
    /// Audio file to transcribe.
    file: PathBuf,

    /// Format the transcript: clean, notes, or summary.
    #[arg(long)]
    format: Option<FormatStyle>,

    /// Language hint (ISO 639-1, e.g. "en").
    #[arg(long)]
    language: Option<String>,

    /// Vocabulary or style hint for the transcription model.
    #[arg(long)]
    prompt: Option<String>,

    /// Job id (defaults to a generated `job_<uuid>`).
    #[arg(long)]
    job_id: Option<String>,

    /// Emit progress events and the result as JSON lines on stdout.
    #[arg(long)]
    json: bool,
}

impl TranscribeArgs {
    fn job_options(&self) -> JobOptions {
        JobOptions {
            transcribe: TranscribeOptions {
                language: self.language.clone(),
                prompt: self.prompt.clone(),
                temperature: None,
            },
            format: self.format.map(|style| FormatOptions {
                style,
                ..FormatOptions::default()
            }),
        }
    }
}

fn load_settings(path: Option<&PathBuf>) -> Result<ScribeSettings> {
    match path {
        Some(path) => scribe_settings::load_settings_from_path(path)
            .with_context(|| format!("Failed to load settings from {}", path.display())),
        None => scribe_settings::load_settings().context("Failed to load settings"),
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Cli::parse();

    // Settings first: the log level comes from them
    let settings = load_settings(args.settings.as_ref())?;
    scribe_logging::init_from_settings(&settings.logging);

    match args.command {
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Transcribe(transcribe) => run_transcribe(&settings, &transcribe).await,
    }
}

async fn run_transcribe(settings: &ScribeSettings, args: &TranscribeArgs) -> Result<ExitCode> {
    if settings.api.api_key.is_none() {
        tracing::warn!("no API key configured (set SCRIBE_API_KEY or apiKey in settings)");
    }

    let backend = HttpSpeechBackend::new(&settings.api)?;
    let client = Arc::new(CachedSpeechClient::from_settings(backend, settings));
    if let Some(interval) = settings.cache.cleanup_interval() {
        client.start_cache_cleanup(interval);
    }
    let shared: Arc<dyn SpeechClient> = client.clone();
    let orchestrator = JobOrchestrator::new(shared, OrchestratorConfig::from_settings(&settings.jobs))
        .context("Failed to create job scratch directory")?;

    let job_id = args.job_id.clone().unwrap_or_else(new_job_id);
    let printer = tokio::spawn(print_progress(orchestrator.subscribe_job(&job_id), args.json));
    tracing::info!(job_id, file = %args.file.display(), "starting job");

    let options = args.job_options();
    let job = orchestrator.process_job(&args.file, &options, Some(job_id.clone()));
    tokio::pin!(job);
    let settled = tokio::select! {
        result = &mut job => Ok(result),
        signal = tokio::signal::ctrl_c() => Err(signal),
    };
    let result = match settled {
        Ok(result) => result,
        Err(signal) => {
            signal.context("Failed to listen for ctrl-c")?;
            tracing::warn!(job_id, "interrupt received, cancelling job");
            let _ = orchestrator.cancel_job(&job_id);
            job.await
        }
    };

    // The terminal event is emitted before the result settles
    let _ = tokio::time::timeout(Duration::from_secs(1), printer).await;
    print_result(&result, args.json)?;

    if let Err(e) = orchestrator.cleanup().await {
        tracing::warn!(error = %e, "cleanup failed");
    }
    client.destroy();

    Ok(if result.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn print_progress(mut progress: JobSubscription, json: bool) {
    while let Some(event) = progress.recv().await {
        if json {
            if let Ok(line) = serde_json::to_string(&event) {
                println!("{line}");
            }
        } else {
            eprintln!("[{:>3}%] {:<12} {}", event.progress, event.stage, event.message);
        }
    }
    if progress.skipped() > 0 {
        tracing::debug!(skipped = progress.skipped(), "progress printer fell behind");
    }
}

fn print_result(result: &JobResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(result)?);
        return Ok(());
    }
    match (&result.formatted_text, &result.text, &result.error) {
        (Some(formatted), _, _) => println!("{formatted}"),
        (None, Some(text), _) => println!("{text}"),
        (None, None, Some(error)) => eprintln!("error: {error}"),
        (None, None, None) => {}
    }
    Ok(())
}
