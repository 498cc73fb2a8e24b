//! The three-stage job pipeline.
//!
//! ```text
//! upload tasks -> [Uploader] -> objects -> [Submitter] -> jobs -> [JobTracker] -> results
//! ```
//!
//! Stages are connected by bounded channels and run concurrently. Each stage
//! owns the sender of its output channel and drops it when its input is
//! exhausted, so completion propagates from the scanner through to the result
//! collector without any extra signalling.

pub mod limiter;
pub mod submitter;
pub mod tracker;
pub mod uploader;

pub use limiter::RateLimiter;
pub use tracker::{PollPolicy, TrackerStats};

use crate::models::{Batch, JobResult, StageFailure, UploadTask};
use crate::progress::PipelineProgress;
use crate::services::{AnalysisService, ObjectStore};
use futures::Stream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use submitter::Submitter;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracker::JobTracker;
use uploader::Uploader;

/// Adapt a borrowed channel receiver into a stream that ends when every
/// sender is gone. The receiver stays usable once the stream is dropped.
pub(crate) fn receiver_stream<'a, T: 'a>(
    rx: &'a mut mpsc::Receiver<T>,
) -> impl Stream<Item = T> + 'a {
    futures::stream::unfold(rx, |rx| async move { rx.recv().await.map(|item| (item, rx)) })
}

/// Tunables injected into the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub bucket: String,
    /// Concurrent uploads and concurrent submissions.
    pub concurrency: usize,
    /// Request body bytes allowed per `rate_window`.
    pub submission_rate: u64,
    pub rate_window: Duration,
    /// Concurrent status checks.
    pub poll_concurrency: usize,
    pub poll_policy: PollPolicy,
    /// Capacity of each inter-stage channel.
    pub channel_capacity: usize,
}

impl PipelineSettings {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            concurrency: 9,
            submission_rate: 64,
            rate_window: Duration::from_secs(1),
            poll_concurrency: 9,
            poll_policy: PollPolicy::default(),
            channel_capacity: 64,
        }
    }
}

/// Live counters shared by the stages.
#[derive(Debug, Default)]
pub struct PipelineCounters {
    discovered: AtomicUsize,
    uploaded: AtomicUsize,
    upload_failures: AtomicUsize,
    submitted: AtomicUsize,
    submission_failures: AtomicUsize,
    succeeded: AtomicUsize,
    partial_success: AtomicUsize,
    failed: AtomicUsize,
}

impl PipelineCounters {
    pub(crate) fn discovered(&self) {
        self.discovered.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn uploaded(&self) {
        self.uploaded.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn upload_failed(&self) {
        self.upload_failures.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn submission_failed(&self) {
        self.submission_failures.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn succeeded(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn partially_succeeded(&self) {
        self.partial_success.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            discovered: self.discovered.load(Ordering::Relaxed),
            uploaded: self.uploaded.load(Ordering::Relaxed),
            upload_failures: self.upload_failures.load(Ordering::Relaxed),
            submitted: self.submitted.load(Ordering::Relaxed),
            submission_failures: self.submission_failures.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            partial_success: self.partial_success.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`PipelineCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub discovered: usize,
    pub uploaded: usize,
    pub upload_failures: usize,
    pub submitted: usize,
    pub submission_failures: usize,
    pub succeeded: usize,
    pub partial_success: usize,
    pub failed: usize,
}

/// Everything a run produced.
#[derive(Debug)]
pub struct PipelineOutcome {
    pub results: Vec<JobResult>,
    pub failures: Vec<StageFailure>,
    pub counters: CounterSnapshot,
    pub tracker: TrackerStats,
    pub cancelled: bool,
}

/// The upload → submit → track pipeline.
pub struct Pipeline {
    settings: PipelineSettings,
    store: Arc<dyn ObjectStore>,
    analysis: Arc<dyn AnalysisService>,
    progress: PipelineProgress,
}

impl Pipeline {
    pub fn new(
        settings: PipelineSettings,
        store: Arc<dyn ObjectStore>,
        analysis: Arc<dyn AnalysisService>,
        progress: PipelineProgress,
    ) -> Self {
        Self {
            settings,
            store,
            analysis,
            progress,
        }
    }

    /// Run every task in `tasks` through the pipeline.
    ///
    /// Returns once the task channel has closed and every submitted job has a
    /// terminal result, or once `cancel` fires and the stages have wound down.
    pub async fn run(
        &self,
        batch: &Batch,
        tasks: mpsc::Receiver<UploadTask>,
        cancel: CancellationToken,
    ) -> PipelineOutcome {
        let settings = &self.settings;
        info!(
            "Starting batch {} into {}/{} ({} workers, {} bytes/{:?} submission ceiling)",
            batch,
            settings.bucket,
            batch.prefix(),
            settings.concurrency,
            settings.submission_rate,
            settings.rate_window
        );

        let capacity = settings.channel_capacity.max(1);
        let (object_tx, object_rx) = mpsc::channel(capacity);
        let (job_tx, job_rx) = mpsc::channel(capacity);
        let (result_tx, mut result_rx) = mpsc::channel(capacity);
        let (failure_tx, mut failure_rx) = mpsc::unbounded_channel();

        let counters = Arc::new(PipelineCounters::default());
        let limiter = Arc::new(RateLimiter::new(settings.submission_rate, settings.rate_window));

        let uploader = Uploader::new(
            self.store.clone(),
            settings.bucket.clone(),
            settings.concurrency,
            counters.clone(),
            self.progress.clone(),
        );
        let submitter = Submitter::new(
            self.analysis.clone(),
            limiter,
            settings.concurrency,
            counters.clone(),
            self.progress.clone(),
        );
        let tracker = JobTracker::new(
            self.analysis.clone(),
            settings.poll_policy.clone(),
            settings.poll_concurrency,
            counters.clone(),
            self.progress.clone(),
        );

        let upload = tokio::spawn(uploader.run(tasks, object_tx, failure_tx.clone(), cancel.clone()));
        let submit = tokio::spawn(submitter.run(object_rx, job_tx, failure_tx, cancel.clone()));
        let track = tokio::spawn(tracker.run(job_rx, result_tx, cancel.clone()));

        let mut results = Vec::new();
        while let Some(result) = result_rx.recv().await {
            results.push(result);
        }

        for (stage, handle) in [("upload", upload), ("submission", submit)] {
            if let Err(e) = handle.await {
                error!("The {} stage stopped abnormally: {}", stage, e);
            }
        }
        let tracker = match track.await {
            Ok(stats) => stats,
            Err(e) => {
                error!("The tracking stage stopped abnormally: {}", e);
                TrackerStats::default()
            }
        };

        let mut failures = Vec::new();
        while let Some(failure) = failure_rx.recv().await {
            failures.push(failure);
        }

        self.progress.finish();
        let counters = counters.snapshot();
        info!(
            "Batch {} finished: {} uploaded, {} jobs, {} results, {} stage failures",
            batch,
            counters.uploaded,
            counters.submitted,
            results.len(),
            failures.len()
        );

        PipelineOutcome {
            results,
            failures,
            counters,
            tracker,
            cancelled: cancel.is_cancelled(),
        }
    }
}
