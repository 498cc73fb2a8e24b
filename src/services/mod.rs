//! Seams to the external services the pipeline orchestrates.
//!
//! The pipeline only talks to these traits; `crate::aws` provides the
//! network-backed implementations.

use crate::error::ServiceError;
use crate::models::{JobId, RemoteObject, StatusReport};
use async_trait::async_trait;

#[cfg(test)]
pub mod testing;

/// Remote object storage.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `body` under `key` in `bucket`.
    async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<(), ServiceError>;
}

/// Asynchronous document-analysis service.
#[async_trait]
pub trait AnalysisService: Send + Sync {
    /// Start an analysis job for an uploaded object.
    async fn submit(&self, object: &RemoteObject) -> Result<JobId, ServiceError>;

    /// Fetch the current status (and, once finished, the full result) of a job.
    async fn get_status(&self, job_id: &JobId) -> Result<StatusReport, ServiceError>;
}
