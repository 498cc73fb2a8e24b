//! Uploader pool: local files to remote objects.

use super::{receiver_stream, PipelineCounters};
use crate::error::{PipelineError, ServiceError};
use crate::models::{RemoteObject, Stage, StageFailure, UploadTask};
use crate::progress::PipelineProgress;
use crate::services::ObjectStore;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct Uploader {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    concurrency: usize,
    counters: Arc<PipelineCounters>,
    progress: PipelineProgress,
}

impl Uploader {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        bucket: String,
        concurrency: usize,
        counters: Arc<PipelineCounters>,
        progress: PipelineProgress,
    ) -> Self {
        Self {
            store,
            bucket,
            concurrency: concurrency.max(1),
            counters,
            progress,
        }
    }

    /// Upload every task until the input closes or the run is cancelled.
    ///
    /// Dropping `objects` on return tells the submission stage that no more
    /// objects will arrive.
    pub async fn run(
        self,
        mut tasks: mpsc::Receiver<UploadTask>,
        objects: mpsc::Sender<RemoteObject>,
        failures: mpsc::UnboundedSender<StageFailure>,
        cancel: CancellationToken,
    ) {
        let stop = cancel.clone();
        let this = &self;
        let objects = &objects;
        let failures = &failures;
        let cancel = &cancel;

        receiver_stream(&mut tasks)
            .take_until(async move { stop.cancelled().await })
            .for_each_concurrent(self.concurrency, move |task| async move {
                this.counters.discovered();
                match this.upload(&task, cancel).await {
                    Ok(object) => {
                        this.counters.uploaded();
                        this.progress.uploaded();
                        if let Err(mpsc::error::SendError(object)) = objects.send(object).await {
                            warn!("Submission stage closed before {} was submitted", object);
                            this.counters.submission_failed();
                            let _ = failures.send(StageFailure {
                                stage: Stage::Submission,
                                subject: object.key,
                                message: PipelineError::Cancelled.to_string(),
                            });
                        }
                    }
                    Err(e) => {
                        warn!("{}", e);
                        this.counters.upload_failed();
                        let _ = failures.send(StageFailure {
                            stage: Stage::Upload,
                            subject: task.local_path.display().to_string(),
                            message: e.to_string(),
                        });
                    }
                }
            })
            .await;

        debug!("Uploader finished");
    }

    async fn upload(
        &self,
        task: &UploadTask,
        cancel: &CancellationToken,
    ) -> Result<RemoteObject, PipelineError> {
        let path = task.local_path.display().to_string();
        let body = tokio::fs::read(&task.local_path)
            .await
            .map_err(|e| PipelineError::Upload {
                path: path.clone(),
                source: ServiceError::Transport(format!("cannot read local file: {}", e)),
            })?;

        debug!("Uploading {} to {}/{}", path, self.bucket, task.key);
        tokio::select! {
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            result = self.store.put(&self.bucket, &task.key, body) => {
                result.map_err(|source| PipelineError::Upload { path: path.clone(), source })?;
            }
        }
        debug!("Uploaded {} to {}/{}", path, self.bucket, task.key);

        Ok(RemoteObject {
            bucket: self.bucket.clone(),
            key: task.key.clone(),
        })
    }
}
