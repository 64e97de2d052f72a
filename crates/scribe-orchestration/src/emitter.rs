//! Progress delivery to observers.
//!
//! Every event goes out on one broadcast channel. Observers either take the
//! raw stream of all jobs with [`ProgressEmitter::subscribe`] or register for
//! a single job with [`ProgressEmitter::subscribe_job`], which yields that
//! job's events in stage order and ends after its terminal event.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::debug;

use crate::progress::ProgressEvent;

/// Events buffered per observer before it starts lagging.
const CHANNEL_CAPACITY: usize = 1024;

/// Shared progress channel for all jobs of an orchestrator.
///
/// `emit` is synchronous. An observer that falls more than the channel
/// capacity behind loses its oldest events; jobs never wait for observers.
pub struct ProgressEmitter {
    tx: broadcast::Sender<ProgressEvent>,
    emitted: AtomicU64,
    unobserved: AtomicU64,
}

impl ProgressEmitter {
    /// Emitter with the default per-observer buffer.
    pub fn new() -> Self {
        Self::with_capacity(CHANNEL_CAPACITY)
    }

    /// Emitter buffering up to `capacity` events per observer.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            emitted: AtomicU64::new(0),
            unobserved: AtomicU64::new(0),
        }
    }

    /// Publish `event`; returns how many observers it reached.
    pub fn emit(&self, event: ProgressEvent) -> usize {
        let _ = self.emitted.fetch_add(1, Ordering::Relaxed);
        match self.tx.send(event) {
            Ok(observers) => observers,
            Err(_) => {
                let _ = self.unobserved.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    /// Raw stream of every job's events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    /// Register for the events of `job_id` only.
    ///
    /// Subscribe before starting the job to see its `preparing` event.
    pub fn subscribe_job(&self, job_id: impl Into<String>) -> JobSubscription {
        JobSubscription {
            job_id: job_id.into(),
            rx: self.tx.subscribe(),
            finished: false,
            skipped: 0,
        }
    }

    /// Live observers, raw and per-job alike.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Events published so far.
    pub fn emit_count(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    /// Events published while nobody was subscribed.
    pub fn unobserved_count(&self) -> u64 {
        self.unobserved.load(Ordering::Relaxed)
    }
}

impl Default for ProgressEmitter {
    fn default() -> Self {
        Self::new()
    }
}

/// One observer's view of a single job.
pub struct JobSubscription {
    job_id: String,
    rx: broadcast::Receiver<ProgressEvent>,
    finished: bool,
    skipped: u64,
}

impl JobSubscription {
    /// Job this subscription follows.
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Whether the terminal event was delivered or the channel closed.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Events dropped because this observer lagged (any job's).
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Next event of the job; `None` after its terminal event.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        while !self.finished {
            match self.rx.recv().await {
                Ok(event) => {
                    if let Some(event) = self.accept(event) {
                        return Some(event);
                    }
                }
                Err(RecvError::Lagged(n)) => self.note_lag(n),
                Err(RecvError::Closed) => self.finished = true,
            }
        }
        None
    }

    /// Next already-buffered event of the job, without waiting.
    pub fn try_recv(&mut self) -> Option<ProgressEvent> {
        while !self.finished {
            match self.rx.try_recv() {
                Ok(event) => {
                    if let Some(event) = self.accept(event) {
                        return Some(event);
                    }
                }
                Err(TryRecvError::Lagged(n)) => self.note_lag(n),
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Closed) => self.finished = true,
            }
        }
        None
    }

    fn accept(&mut self, event: ProgressEvent) -> Option<ProgressEvent> {
        if event.job_id != self.job_id {
            return None;
        }
        self.finished = event.stage.is_terminal();
        Some(event)
    }

    fn note_lag(&mut self, n: u64) {
        self.skipped += n;
        debug!(job_id = %self.job_id, skipped = n, "progress observer lagged");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressStage;

    fn event(job_id: &str, stage: ProgressStage) -> ProgressEvent {
        ProgressEvent::new(job_id, stage, 5, "test")
    }

    #[test]
    fn emit_without_observers_is_counted() {
        let emitter = ProgressEmitter::new();
        assert_eq!(emitter.emit(event("j1", ProgressStage::Preparing)), 0);
        assert_eq!(emitter.emit_count(), 1);
        assert_eq!(emitter.unobserved_count(), 1);
    }

    #[tokio::test]
    async fn raw_observers_are_independent() {
        let emitter = ProgressEmitter::new();
        let mut rx1 = emitter.subscribe();
        let mut rx2 = emitter.subscribe();
        assert_eq!(emitter.subscriber_count(), 2);

        assert_eq!(emitter.emit(event("j1", ProgressStage::Preparing)), 2);
        assert_eq!(emitter.unobserved_count(), 0);

        assert_eq!(rx1.recv().await.unwrap().job_id, "j1");
        drop(rx1);
        assert_eq!(rx2.recv().await.unwrap().job_id, "j1");
        assert_eq!(emitter.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn job_subscription_filters_and_ends_at_terminal() {
        let emitter = ProgressEmitter::new();
        let mut sub = emitter.subscribe_job("j1");
        assert_eq!(sub.job_id(), "j1");

        let _ = emitter.emit(event("j1", ProgressStage::Preparing));
        let _ = emitter.emit(event("j2", ProgressStage::Preparing));
        let _ = emitter.emit(event("j1", ProgressStage::Transcribing));
        let _ = emitter.emit(event("j2", ProgressStage::Complete));
        let _ = emitter.emit(event("j1", ProgressStage::Complete));
        let _ = emitter.emit(event("j1", ProgressStage::Error));

        let mut stages = Vec::new();
        while let Some(e) = sub.recv().await {
            assert_eq!(e.job_id, "j1");
            stages.push(e.stage);
        }
        assert_eq!(
            stages,
            vec![
                ProgressStage::Preparing,
                ProgressStage::Transcribing,
                ProgressStage::Complete
            ]
        );
        assert!(sub.is_finished());
        assert!(sub.recv().await.is_none());
    }

    #[test]
    fn try_recv_returns_none_when_drained() {
        let emitter = ProgressEmitter::new();
        let mut sub = emitter.subscribe_job("j1");
        assert!(sub.try_recv().is_none());

        let _ = emitter.emit(event("j2", ProgressStage::Transcribing));
        let _ = emitter.emit(event("j1", ProgressStage::Transcribing));
        assert_eq!(sub.try_recv().unwrap().stage, ProgressStage::Transcribing);
        assert!(sub.try_recv().is_none());
        assert!(!sub.is_finished());
    }

    #[tokio::test]
    async fn lagging_job_observer_skips_and_continues() {
        let emitter = ProgressEmitter::with_capacity(2);
        let mut sub = emitter.subscribe_job("j1");

        for _ in 0..3 {
            let _ = emitter.emit(event("j1", ProgressStage::Transcribing));
        }
        let _ = emitter.emit(event("j1", ProgressStage::Complete));

        assert_eq!(sub.recv().await.unwrap().stage, ProgressStage::Transcribing);
        assert_eq!(sub.recv().await.unwrap().stage, ProgressStage::Complete);
        assert_eq!(sub.skipped(), 2);
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn subscription_ends_when_emitter_dropped() {
        let emitter = ProgressEmitter::new();
        let mut sub = emitter.subscribe_job("j1");
        drop(emitter);
        assert!(sub.recv().await.is_none());
        assert!(sub.is_finished());
    }
}
