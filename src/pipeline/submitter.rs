//! Submission pool: uploaded objects to analysis jobs.
//!
//! Two independent limits apply. The shared [`RateLimiter`] bounds request
//! body volume over time; `concurrency` bounds outstanding requests.

use super::limiter::RateLimiter;
use super::{receiver_stream, PipelineCounters};
use crate::error::PipelineError;
use crate::models::{AnalysisRequest, JobId, RemoteObject, Stage, StageFailure, SubmittedJob};
use crate::progress::PipelineProgress;
use crate::services::AnalysisService;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct Submitter {
    analysis: Arc<dyn AnalysisService>,
    limiter: Arc<RateLimiter>,
    concurrency: usize,
    counters: Arc<PipelineCounters>,
    progress: PipelineProgress,
}

impl Submitter {
    pub fn new(
        analysis: Arc<dyn AnalysisService>,
        limiter: Arc<RateLimiter>,
        concurrency: usize,
        counters: Arc<PipelineCounters>,
        progress: PipelineProgress,
    ) -> Self {
        Self {
            analysis,
            limiter,
            concurrency: concurrency.max(1),
            counters,
            progress,
        }
    }

    /// Submit every object until the input closes or the run is cancelled.
    pub async fn run(
        self,
        mut objects: mpsc::Receiver<RemoteObject>,
        jobs: mpsc::Sender<SubmittedJob>,
        failures: mpsc::UnboundedSender<StageFailure>,
        cancel: CancellationToken,
    ) {
        let stop = cancel.clone();
        let this = &self;
        let jobs = &jobs;
        let failures = &failures;
        let cancel = &cancel;

        receiver_stream(&mut objects)
            .take_until(async move { stop.cancelled().await })
            .for_each_concurrent(self.concurrency, move |object| async move {
                let failure = match this.submit(&object, cancel).await {
                    Ok(job_id) => {
                        this.counters.submitted();
                        this.progress.submitted();
                        let job = SubmittedJob {
                            job_id,
                            object: object.clone(),
                        };
                        match jobs.send(job).await {
                            Ok(()) => None,
                            Err(mpsc::error::SendError(job)) => Some(format!(
                                "job {} started but the tracker had already stopped",
                                job.job_id
                            )),
                        }
                    }
                    Err(e) => Some(e.to_string()),
                };

                if let Some(message) = failure {
                    warn!("{}", message);
                    this.counters.submission_failed();
                    let _ = failures.send(StageFailure {
                        stage: Stage::Submission,
                        subject: object.key.clone(),
                        message,
                    });
                }
            })
            .await;

        // Objects still queued after a cancel are never submitted.
        objects.close();
        let mut abandoned = 0;
        while let Some(object) = objects.recv().await {
            abandoned += 1;
            self.counters.submission_failed();
            let _ = failures.send(StageFailure {
                stage: Stage::Submission,
                subject: object.key,
                message: PipelineError::Cancelled.to_string(),
            });
        }
        if abandoned > 0 {
            warn!("Cancelled; {} uploaded objects were not submitted", abandoned);
        }

        debug!("Submitter finished");
    }

    async fn submit(
        &self,
        object: &RemoteObject,
        cancel: &CancellationToken,
    ) -> Result<JobId, PipelineError> {
        let cost = AnalysisRequest::for_object(object).body().len() as u64;

        tokio::select! {
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            _ = self.limiter.acquire(cost) => {}
        }

        debug!("Starting analysis job for {}", object);
        let job_id = tokio::select! {
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            result = self.analysis.submit(object) => result.map_err(|source| PipelineError::Submission {
                key: object.key.clone(),
                source,
            })?,
        };
        debug!("Analysis job for {} started. Job ID: {}", object, job_id);

        Ok(job_id)
    }
}
