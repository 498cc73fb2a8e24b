//! Data models for the receipt pipeline.
//!
//! This module contains the core data structures that flow between the
//! pipeline stages and into the report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// One end-to-end run, scoped by a unique object-store prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    id: Uuid,
}

impl Batch {
    /// Create a batch with a freshly generated identifier.
    pub fn new() -> Self {
        Self { id: Uuid::new_v4() }
    }

    /// The batch identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Object-store prefix owning every upload of this batch.
    pub fn prefix(&self) -> String {
        self.id.to_string()
    }

    /// Destination key for a file at `relative` (below the input root).
    ///
    /// Path components are always joined with `/`, whatever the platform.
    pub fn key_for(&self, relative: &Path) -> String {
        let mut key = self.prefix();
        for component in relative.components() {
            key.push('/');
            key.push_str(&component.as_os_str().to_string_lossy());
        }
        key
    }

    /// Build the upload task for `path`, found below `root`.
    pub fn task_for(&self, root: &Path, path: &Path) -> UploadTask {
        let relative = path.strip_prefix(root).unwrap_or(path);
        UploadTask {
            local_path: path.to_path_buf(),
            key: self.key_for(relative),
        }
    }
}

impl Default for Batch {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// A local file paired with its destination key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTask {
    pub local_path: PathBuf,
    pub key: String,
}

/// Location of an uploaded object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteObject {
    pub bucket: String,
    pub key: String,
}

impl fmt::Display for RemoteObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// Identifier returned by the analysis service when a job is started.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Request body naming the document an analysis job should read.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AnalysisRequest {
    pub document_location: DocumentLocation,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentLocation {
    #[serde(rename = "S3Object")]
    pub s3_object: S3ObjectRef,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct S3ObjectRef {
    pub bucket: String,
    pub name: String,
}

impl AnalysisRequest {
    pub fn for_object(object: &RemoteObject) -> Self {
        Self {
            document_location: DocumentLocation {
                s3_object: S3ObjectRef {
                    bucket: object.bucket.clone(),
                    name: object.key.clone(),
                },
            },
        }
    }

    /// Serialized request body.
    pub fn body(&self) -> Vec<u8> {
        // Plain structs of strings always serialize.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// A job handed from the submission stage to the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedJob {
    pub job_id: JobId,
    pub object: RemoteObject,
}

/// Status of an analysis job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Submitted,
    InProgress,
    Succeeded,
    PartialSuccess,
    Failed,
}

impl JobStatus {
    /// Parse the status string reported by the service.
    ///
    /// Returns `None` for anything unrecognised.
    pub fn from_wire(status: &str) -> Option<Self> {
        match status {
            "SUBMITTED" => Some(JobStatus::Submitted),
            "IN_PROGRESS" => Some(JobStatus::InProgress),
            "SUCCEEDED" => Some(JobStatus::Succeeded),
            "PARTIAL_SUCCESS" => Some(JobStatus::PartialSuccess),
            "FAILED" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::PartialSuccess | JobStatus::Failed
        )
    }

    /// Whether a job currently in `self` may move to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        !self.is_terminal() && next != JobStatus::Submitted
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Submitted => "SUBMITTED",
            JobStatus::InProgress => "IN_PROGRESS",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::PartialSuccess => "PARTIAL_SUCCESS",
            JobStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Raw answer to a status fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    /// Status string exactly as reported.
    pub status: String,
    /// Full response body.
    pub payload: Value,
}

impl StatusReport {
    /// The service-provided explanation for a failed job, if any.
    pub fn status_message(&self) -> Option<&str> {
        self.payload.get("StatusMessage").and_then(Value::as_str)
    }
}

/// Why a job ended in `FAILED`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// The service reported the job as failed.
    ServiceReported { message: String },
    /// The service reported a status we do not recognise.
    UnknownStatus { status: String },
    /// A status fetch was rejected outright.
    Rejected { message: String },
    /// The job did not finish within the poll budget.
    Timeout {
        attempts: u32,
        last_error: Option<String>,
    },
    /// The run was interrupted before the job finished.
    Cancelled,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::ServiceReported { message } => write!(f, "service reported failure: {}", message),
            FailureReason::UnknownStatus { status } => write!(f, "unknown job status '{}'", status),
            FailureReason::Rejected { message } => write!(f, "status request rejected: {}", message),
            FailureReason::Timeout {
                attempts,
                last_error: Some(e),
            } => write!(f, "timed out after {} polls (last error: {})", attempts, e),
            FailureReason::Timeout { attempts, .. } => write!(f, "timed out after {} polls", attempts),
            FailureReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Terminal outcome of an analysis job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobOutcome {
    Succeeded {
        payload: Value,
    },
    PartialSuccess {
        payload: Value,
    },
    Failed {
        reason: FailureReason,
        #[serde(skip_serializing_if = "Option::is_none")]
        raw: Option<Value>,
    },
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Succeeded { .. } => JobStatus::Succeeded,
            JobOutcome::PartialSuccess { .. } => JobStatus::PartialSuccess,
            JobOutcome::Failed { .. } => JobStatus::Failed,
        }
    }

    /// Analysis payload, present for (partially) successful jobs.
    pub fn payload(&self) -> Option<&Value> {
        match self {
            JobOutcome::Succeeded { payload } | JobOutcome::PartialSuccess { payload } => Some(payload),
            JobOutcome::Failed { .. } => None,
        }
    }
}

/// Terminal result for one analysis job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: JobId,
    pub object: RemoteObject,
    pub outcome: JobOutcome,
}

impl JobResult {
    pub fn failed(job: SubmittedJob, reason: FailureReason, raw: Option<Value>) -> Self {
        Self {
            job_id: job.job_id,
            object: job.object,
            outcome: JobOutcome::Failed { reason, raw },
        }
    }
}

/// Pipeline stage that can drop an item before it becomes a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Upload,
    Submission,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Upload => write!(f, "upload"),
            Stage::Submission => write!(f, "submission"),
        }
    }
}

/// An item that was dropped by the upload or submission stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    pub stage: Stage,
    /// Local path (upload) or object key (submission).
    pub subject: String,
    pub message: String,
}

/// Counts per outcome across a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeSummary {
    pub total_jobs: usize,
    pub succeeded: usize,
    pub partial_success: usize,
    pub failed: usize,
    pub upload_failures: usize,
    pub submission_failures: usize,
    /// Failed jobs grouped by failure kind.
    pub failures_by_kind: HashMap<String, usize>,
}

impl OutcomeSummary {
    pub fn from_results(results: &[JobResult], stage_failures: &[StageFailure]) -> Self {
        let mut summary = Self {
            total_jobs: results.len(),
            ..Self::default()
        };

        for result in results {
            match &result.outcome {
                JobOutcome::Succeeded { .. } => summary.succeeded += 1,
                JobOutcome::PartialSuccess { .. } => summary.partial_success += 1,
                JobOutcome::Failed { reason, .. } => {
                    summary.failed += 1;
                    *summary
                        .failures_by_kind
                        .entry(reason.kind().to_string())
                        .or_insert(0) += 1;
                }
            }
        }

        for failure in stage_failures {
            match failure.stage {
                Stage::Upload => summary.upload_failures += 1,
                Stage::Submission => summary.submission_failures += 1,
            }
        }

        summary
    }

    /// Whether anything at all went wrong.
    pub fn has_failures(&self) -> bool {
        self.failed > 0 || self.upload_failures > 0 || self.submission_failures > 0
    }
}

impl FailureReason {
    /// Short machine-friendly name of the failure kind.
    pub fn kind(&self) -> &'static str {
        match self {
            FailureReason::ServiceReported { .. } => "service_reported",
            FailureReason::UnknownStatus { .. } => "unknown_status",
            FailureReason::Rejected { .. } => "rejected",
            FailureReason::Timeout { .. } => "timeout",
            FailureReason::Cancelled => "cancelled",
        }
    }
}

/// One extracted row of the report (one successfully analysed document).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportRow {
    /// Object key, relative to the batch prefix.
    pub source: String,
    pub job_id: JobId,
    pub status: JobStatus,
    pub fields: BTreeMap<String, String>,
}

/// A job or item that produced no extracted row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureEntry {
    pub source: String,
    pub stage: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    pub message: String,
}

/// Metadata about the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportMetadata {
    pub batch_id: String,
    pub bucket: String,
    pub region: String,
    pub input_dir: String,
    pub generated_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub interrupted: bool,
}

/// The complete expense report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub metadata: ReportMetadata,
    pub summary: OutcomeSummary,
    /// Field columns present in the rows, in display order.
    pub columns: Vec<String>,
    pub rows: Vec<ReportRow>,
    pub failures: Vec<FailureEntry>,
}
