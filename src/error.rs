//! Error types for the pipeline and its external services.
//!
//! Per-item failures (`Upload`, `Submission`) are recorded and never abort
//! sibling items. `Configuration` is the only fatal kind and is raised before
//! any work starts.

use thiserror::Error;

/// Error returned by an external service call (object store or analysis service).
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    /// Network failure, timeout, or a 5xx response.
    #[error("transport error: {0}")]
    Transport(String),

    /// The service asked us to slow down.
    #[error("throttled: {0}")]
    Throttled(String),

    /// The service rejected the request (4xx).
    #[error("rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// The response could not be decoded.
    #[error("undecodable response: {0}")]
    Decode(String),
}

impl ServiceError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ServiceError::Transport(_) | ServiceError::Throttled(_))
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ServiceError::Decode(e.to_string())
        } else {
            ServiceError::Transport(e.to_string())
        }
    }
}

/// Pipeline-level error taxonomy.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("upload of {path} failed: {source}")]
    Upload {
        path: String,
        #[source]
        source: ServiceError,
    },

    #[error("submission of {key} failed: {source}")]
    Submission {
        key: String,
        #[source]
        source: ServiceError,
    },

    #[error("status poll for job {job_id} failed: {source}")]
    PollTransport {
        job_id: String,
        #[source]
        source: ServiceError,
    },

    #[error("job {job_id} failed: {reason}")]
    JobFailed { job_id: String, reason: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("cancelled")]
    Cancelled,
}
