//! Network-backed implementations of the service seams.
//!
//! Requests are plain HTTPS calls made with `reqwest` and signed with
//! Signature Version 4. Credentials come from the standard environment
//! variables.

pub mod s3;
pub mod sigv4;
pub mod textract;

pub use s3::S3Store;
pub use sigv4::Credentials;
pub use textract::TextractService;

use crate::error::{PipelineError, ServiceError};
use reqwest::Url;
use std::time::Duration;

/// Connection settings shared by both services.
#[derive(Debug, Clone)]
pub struct AwsSettings {
    pub region: String,
    /// Override for the object store endpoint (path-style addressing is used).
    pub s3_endpoint: Option<String>,
    /// Override for the analysis service endpoint.
    pub textract_endpoint: Option<String>,
    pub request_timeout: Duration,
}

impl AwsSettings {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            s3_endpoint: None,
            textract_endpoint: None,
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl Credentials {
    /// Read `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY` and the optional
    /// `AWS_SESSION_TOKEN` from the environment.
    pub fn from_env() -> Result<Self, PipelineError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, PipelineError> {
        let required = |name: &str| {
            lookup(name)
                .filter(|value| !value.trim().is_empty())
                .ok_or_else(|| PipelineError::Configuration(format!("{} is not set", name)))
        };

        Ok(Self {
            access_key_id: required("AWS_ACCESS_KEY_ID")?,
            secret_access_key: required("AWS_SECRET_ACCESS_KEY")?,
            session_token: lookup("AWS_SESSION_TOKEN").filter(|v| !v.is_empty()),
        })
    }
}

/// Build the HTTP client used by both services.
pub fn http_client(settings: &AwsSettings) -> Result<reqwest::Client, PipelineError> {
    reqwest::Client::builder()
        .timeout(settings.request_timeout)
        .build()
        .map_err(|e| PipelineError::Configuration(format!("Failed to create HTTP client: {}", e)))
}

/// Parse an endpoint override, or fall back to the regional default.
pub(crate) fn endpoint(
    configured: Option<&str>,
    default: String,
) -> Result<Url, PipelineError> {
    let raw = configured.map(str::to_string).unwrap_or(default);
    Url::parse(&raw).map_err(|e| PipelineError::Configuration(format!("Invalid endpoint '{}': {}", raw, e)))
}

/// `host[:port]` exactly as it will be sent in the `Host` header.
pub(crate) fn host_header(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}

const THROTTLING_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "ThrottledException",
    "ProvisionedThroughputExceededException",
    "LimitExceededException",
    "RequestLimitExceeded",
    "TooManyRequestsException",
    "SlowDown",
];

/// Map a non-success response to a service error.
///
/// `code` is the service error code (e.g. the `__type` of a JSON error or the
/// `<Code>` of an XML one) when it could be read.
pub(crate) fn classify_failure(status: u16, code: Option<&str>, message: String) -> ServiceError {
    let throttled = status == 429 || code.is_some_and(|c| THROTTLING_CODES.contains(&c));
    let detail = match code {
        Some(code) if !message.contains(code) => format!("{}: {}", code, message),
        _ => message,
    };

    if throttled {
        ServiceError::Throttled(detail)
    } else if status >= 500 {
        ServiceError::Transport(format!("HTTP {}: {}", status, detail))
    } else {
        ServiceError::Rejected { status, message: detail }
    }
}

/// Map a send error, naming timeouts and connection failures.
pub(crate) fn send_error(e: reqwest::Error, target: &Url) -> ServiceError {
    if e.is_timeout() {
        ServiceError::Transport(format!("Request to {} timed out", host_header(target)))
    } else if e.is_connect() {
        ServiceError::Transport(format!("Cannot connect to {}", host_header(target)))
    } else {
        ServiceError::from(e)
    }
}
