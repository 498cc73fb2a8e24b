//! Configuration file handling.
//!
//! This module handles loading and merging configuration from
//! `.receiptflow.toml` files.

use crate::analysis::NORMALIZED_FIELDS;
use crate::aws::AwsSettings;
use crate::cli::OutputFormat;
use crate::error::PipelineError;
use crate::pipeline::{PipelineSettings, PollPolicy};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = ".receiptflow.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Object store and analysis service settings.
    #[serde(default)]
    pub aws: AwsConfig,

    /// Pipeline tunables.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Scanner settings.
    #[serde(default)]
    pub scanner: ScannerConfig,

    /// Report settings.
    #[serde(default)]
    pub report: ReportConfig,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Directory receiving one sub-directory per batch.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Enable verbose logging by default.
    #[serde(default)]
    pub verbose: bool,

    /// Report formats to write.
    #[serde(default = "default_formats")]
    pub formats: Vec<OutputFormat>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            verbose: false,
            formats: default_formats(),
        }
    }
}

fn default_output_dir() -> String {
    "output".to_string()
}

fn default_formats() -> Vec<OutputFormat> {
    vec![OutputFormat::Json, OutputFormat::Csv, OutputFormat::Markdown]
}

/// Cloud service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwsConfig {
    /// Destination bucket for uploads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,

    /// Region of both the bucket and the analysis service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// Custom object store endpoint (e.g. a local S3-compatible server).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3_endpoint: Option<String>,

    /// Custom analysis service endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub textract_endpoint: Option<String>,

    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            bucket: None,
            region: None,
            s3_endpoint: None,
            textract_endpoint: None,
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    60
}

/// Pipeline concurrency, rate and polling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Concurrent uploads and concurrent submissions.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Submission request bytes admitted per rate window.
    #[serde(default = "default_submission_rate")]
    pub submission_rate: u64,

    #[serde(default = "default_rate_window_ms")]
    pub rate_window_ms: u64,

    /// Concurrent status checks.
    #[serde(default = "default_concurrency")]
    pub poll_concurrency: usize,

    #[serde(default = "default_initial_backoff_ms")]
    pub poll_initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub poll_max_backoff_ms: u64,

    /// A job still running after this long is failed with a timeout.
    #[serde(default = "default_max_poll_duration")]
    pub max_poll_duration_secs: u64,

    /// Optional cap on status checks per job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_poll_attempts: Option<u32>,

    /// Capacity of each channel between stages.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            submission_rate: default_submission_rate(),
            rate_window_ms: default_rate_window_ms(),
            poll_concurrency: default_concurrency(),
            poll_initial_backoff_ms: default_initial_backoff_ms(),
            poll_max_backoff_ms: default_max_backoff_ms(),
            max_poll_duration_secs: default_max_poll_duration(),
            max_poll_attempts: None,
            channel_capacity: default_channel_capacity(),
        }
    }
}

fn default_concurrency() -> usize {
    9
}

fn default_submission_rate() -> u64 {
    64
}

fn default_rate_window_ms() -> u64 {
    1000
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_max_poll_duration() -> u64 {
    1800 // 30 min
}

fn default_channel_capacity() -> usize {
    64
}

/// File scanner settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// File extensions to include.
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,

    /// Match extensions regardless of case.
    #[serde(default)]
    pub case_insensitive: bool,

    /// File or directory names to skip.
    #[serde(default)]
    pub excludes: Vec<String>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            extensions: default_extensions(),
            case_insensitive: false,
            excludes: Vec::new(),
        }
    }
}

fn default_extensions() -> Vec<String> {
    vec!["png", "jpg", "jpeg", "pdf"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Report generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Expense fields kept in the report, in column order.
    #[serde(default = "default_fields")]
    pub fields: Vec<String>,

    /// Remove columns that are empty in every row.
    #[serde(default = "default_true")]
    pub drop_empty_columns: bool,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            fields: default_fields(),
            drop_empty_columns: true,
        }
    }
}

fn default_fields() -> Vec<String> {
    NORMALIZED_FIELDS.iter().map(|f| f.to_string()).collect()
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Find the configuration for a run.
    ///
    /// An explicit path must exist. Otherwise `DEFAULT_CONFIG_FILE` in `dir` is
    /// used when present, and `Ok(None)` means defaults apply. A file that
    /// exists but does not parse is always an error.
    pub fn discover(explicit: Option<&Path>, dir: &Path) -> Result<Option<(Self, PathBuf)>> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => {
                let path = dir.join(DEFAULT_CONFIG_FILE);
                if !path.exists() {
                    return Ok(None);
                }
                path
            }
        };

        let config = Self::load(&path)?;
        Ok(Some((config, path)))
    }

    /// Log level for this run. `quiet` wins over `[general] verbose`.
    pub fn log_level(&self, quiet: bool) -> tracing::Level {
        if quiet {
            tracing::Level::ERROR
        } else if self.general.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// Only values given on the command line (or through their environment
    /// variables) override the file.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(ref bucket) = args.bucket {
            self.aws.bucket = Some(bucket.clone());
        }
        if let Some(ref region) = args.region {
            self.aws.region = Some(region.clone());
        }

        if let Some(concurrency) = args.concurrency {
            self.pipeline.concurrency = concurrency;
            self.pipeline.poll_concurrency = concurrency;
        }
        if let Some(rate) = args.rate {
            self.pipeline.submission_rate = rate;
        }
        if let Some(timeout) = args.poll_timeout {
            self.pipeline.max_poll_duration_secs = timeout;
        }

        if let Some(ref output_dir) = args.output_dir {
            self.general.output_dir = output_dir.to_string_lossy().to_string();
        }
        if let Some(ref formats) = args.format {
            self.general.formats = formats.clone();
        }

        // Flags only ever switch things on.
        if args.ignore_case {
            self.scanner.case_insensitive = true;
        }
        if args.verbose {
            self.general.verbose = true;
        }
    }

    /// Check that a run can start with this configuration.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let missing = |what: &str, flag: &str, env: &str, key: &str| {
            PipelineError::Configuration(format!(
                "no {} configured (use {}, {} or [aws].{})",
                what, flag, env, key
            ))
        };

        if self.aws.bucket.as_deref().map_or(true, |b| b.trim().is_empty()) {
            return Err(missing("bucket", "--bucket", "AWS_BUCKET", "bucket"));
        }
        if self.aws.region.as_deref().map_or(true, |r| r.trim().is_empty()) {
            return Err(missing("region", "--region", "AWS_REGION", "region"));
        }

        let p = &self.pipeline;
        let positive = [
            ("concurrency", p.concurrency as u64),
            ("submission_rate", p.submission_rate),
            ("rate_window_ms", p.rate_window_ms),
            ("poll_concurrency", p.poll_concurrency as u64),
            ("max_poll_duration_secs", p.max_poll_duration_secs),
            ("channel_capacity", p.channel_capacity as u64),
            ("aws.request_timeout_seconds", self.aws.request_timeout_seconds),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(PipelineError::Configuration(format!(
                    "{} must be at least 1",
                    name
                )));
            }
        }
        if p.max_poll_attempts == Some(0) {
            return Err(PipelineError::Configuration(
                "max_poll_attempts must be at least 1".to_string(),
            ));
        }
        if p.poll_initial_backoff_ms > p.poll_max_backoff_ms {
            return Err(PipelineError::Configuration(
                "poll_initial_backoff_ms must not exceed poll_max_backoff_ms".to_string(),
            ));
        }

        if self.scanner.extensions.is_empty() {
            return Err(PipelineError::Configuration(
                "at least one scanner extension is required".to_string(),
            ));
        }
        if self.general.formats.is_empty() {
            return Err(PipelineError::Configuration(
                "at least one report format is required".to_string(),
            ));
        }

        Ok(())
    }

    /// Tunables for the pipeline. Call [`Config::validate`] first.
    pub fn pipeline_settings(&self) -> PipelineSettings {
        let p = &self.pipeline;
        PipelineSettings {
            bucket: self.aws.bucket.clone().unwrap_or_default(),
            concurrency: p.concurrency,
            submission_rate: p.submission_rate,
            rate_window: Duration::from_millis(p.rate_window_ms),
            poll_concurrency: p.poll_concurrency,
            poll_policy: PollPolicy {
                initial_backoff: Duration::from_millis(p.poll_initial_backoff_ms),
                max_backoff: Duration::from_millis(p.poll_max_backoff_ms),
                max_duration: Duration::from_secs(p.max_poll_duration_secs),
                max_attempts: p.max_poll_attempts,
            },
            channel_capacity: p.channel_capacity,
        }
    }

    /// Connection settings for the cloud services. Call [`Config::validate`] first.
    pub fn aws_settings(&self) -> AwsSettings {
        AwsSettings {
            s3_endpoint: self.aws.s3_endpoint.clone(),
            textract_endpoint: self.aws.textract_endpoint.clone(),
            request_timeout: Duration::from_secs(self.aws.request_timeout_seconds),
            ..AwsSettings::new(self.aws.region.clone().unwrap_or_default())
        }
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::tests::make_args;

    fn valid() -> Config {
        let mut config = Config::default();
        config.aws.bucket = Some("receipts".to_string());
        config.aws.region = Some("us-east-1".to_string());
        config
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.pipeline.concurrency, 9);
        assert_eq!(config.pipeline.submission_rate, 64);
        assert_eq!(config.general.output_dir, "output");
        assert!(config.scanner.extensions.contains(&"pdf".to_string()));
        assert!(!config.scanner.case_insensitive);
        assert!(config.report.fields.contains(&"VENDOR_NAME".to_string()));
    }

    #[test]
    fn test_parse_config() {
        let toml_content = r#"
[general]
output_dir = "reports"
formats = ["json"]

[aws]
bucket = "my-receipts"
region = "eu-west-1"
s3_endpoint = "http://localhost:9000"

[pipeline]
concurrency = 4
max_poll_attempts = 20

[scanner]
case_insensitive = true
excludes = ["archive"]
"#;

        let config: Config = toml::from_str(toml_content).unwrap();
        assert_eq!(config.general.output_dir, "reports");
        assert_eq!(config.general.formats, vec![OutputFormat::Json]);
        assert_eq!(config.aws.bucket.as_deref(), Some("my-receipts"));
        assert_eq!(config.aws.s3_endpoint.as_deref(), Some("http://localhost:9000"));
        assert_eq!(config.pipeline.concurrency, 4);
        assert_eq!(config.pipeline.poll_concurrency, 9);
        assert_eq!(config.pipeline.max_poll_attempts, Some(20));
        assert!(config.scanner.case_insensitive);
        assert_eq!(config.scanner.excludes, vec!["archive"]);
        assert_eq!(config.scanner.extensions.len(), 4);
    }

    #[test]
    fn test_default_toml_generation() {
        let toml_str = Config::default_toml();
        assert!(toml_str.contains("[general]"));
        assert!(toml_str.contains("[aws]"));
        assert!(toml_str.contains("[pipeline]"));
        assert!(toml_str.contains("[scanner]"));
        assert!(toml_str.contains("[report]"));

        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.pipeline.max_poll_duration_secs, 1800);
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut config = valid();
        config.pipeline.submission_rate = 10;

        let mut args = make_args();
        args.bucket = Some("other".to_string());
        args.concurrency = Some(3);
        args.ignore_case = true;
        args.poll_timeout = Some(60);
        config.merge_with_args(&args);

        assert_eq!(config.aws.bucket.as_deref(), Some("other"));
        assert_eq!(config.aws.region.as_deref(), Some("us-east-1"));
        assert_eq!(config.pipeline.concurrency, 3);
        assert_eq!(config.pipeline.poll_concurrency, 3);
        assert_eq!(config.pipeline.submission_rate, 10);
        assert_eq!(config.pipeline.max_poll_duration_secs, 60);
        assert!(config.scanner.case_insensitive);
    }

    #[test]
    fn test_validation() {
        assert!(valid().validate().is_ok());

        let mut config = valid();
        config.aws.bucket = None;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("bucket"));

        let mut config = valid();
        config.aws.region = Some(" ".to_string());
        assert!(config.validate().is_err());

        let mut config = valid();
        config.pipeline.concurrency = 0;
        assert!(matches!(config.validate(), Err(PipelineError::Configuration(_))));

        let mut config = valid();
        config.pipeline.submission_rate = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.pipeline.poll_initial_backoff_ms = 60_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_settings_conversion() {
        let mut config = valid();
        config.pipeline.max_poll_attempts = Some(5);
        config.aws.textract_endpoint = Some("http://localhost:4566".to_string());

        let settings = config.pipeline_settings();
        assert_eq!(settings.bucket, "receipts");
        assert_eq!(settings.rate_window, Duration::from_secs(1));
        assert_eq!(settings.poll_policy.max_duration, Duration::from_secs(1800));
        assert_eq!(settings.poll_policy.max_attempts, Some(5));

        let aws = config.aws_settings();
        assert_eq!(aws.region, "us-east-1");
        assert_eq!(aws.textract_endpoint.as_deref(), Some("http://localhost:4566"));
        assert_eq!(aws.request_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_discover_default_file() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(Config::discover(None, dir.path()).unwrap().is_none());

        std::fs::write(
            dir.path().join(DEFAULT_CONFIG_FILE),
            "[general]\nverbose = true\n",
        )
        .unwrap();
        let (config, path) = Config::discover(None, dir.path()).unwrap().unwrap();
        assert!(config.general.verbose);
        assert_eq!(path, dir.path().join(DEFAULT_CONFIG_FILE));
    }

    #[test]
    fn test_malformed_default_file_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join(DEFAULT_CONFIG_FILE), "[pipeline\nconcurrency = ").unwrap();

        let err = Config::discover(None, dir.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse config file"));
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(Config::discover(Some(&missing), dir.path()).is_err());
    }

    #[test]
    fn test_log_level_honors_verbose_setting() {
        let mut config = Config::default();
        assert_eq!(config.log_level(false), tracing::Level::INFO);

        config.general.verbose = true;
        assert_eq!(config.log_level(false), tracing::Level::DEBUG);
        assert_eq!(config.log_level(true), tracing::Level::ERROR);

        let mut config = Config::default();
        let mut args = make_args();
        args.verbose = true;
        config.merge_with_args(&args);
        assert_eq!(config.log_level(false), tracing::Level::DEBUG);
    }
}
