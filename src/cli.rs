//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// receiptflow - bulk expense extraction for receipts and invoices
///
/// Uploads every receipt under a directory to a bucket, runs an expense
/// analysis job per document, and writes the extracted fields as a report.
///
/// Examples:
///   receiptflow --input ./receipts --bucket my-receipts --region eu-west-1
///   receiptflow --input ./receipts --format csv --output-dir reports
///   receiptflow --input ./receipts --dry-run
///   receiptflow --init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Directory containing the receipts to process
    #[arg(short, long, default_value = "demo_data", value_name = "DIR")]
    pub input: PathBuf,

    /// Bucket receiving the uploads
    #[arg(short, long, env = "AWS_BUCKET", value_name = "BUCKET")]
    pub bucket: Option<String>,

    /// Region of the bucket and the analysis service
    #[arg(short, long, env = "AWS_REGION", value_name = "REGION")]
    pub region: Option<String>,

    /// Concurrent uploads, submissions and status checks
    #[arg(long, env = "RECEIPTFLOW_CONCURRENCY", value_name = "NUM")]
    pub concurrency: Option<usize>,

    /// Submission request bytes admitted per second
    #[arg(long, env = "RECEIPTFLOW_RATE", value_name = "NUM")]
    pub rate: Option<u64>,

    /// Directory receiving the reports (one sub-directory per batch)
    #[arg(short, long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Report formats (comma-separated: json, csv, markdown)
    #[arg(long, value_name = "FORMATS", value_delimiter = ',')]
    pub format: Option<Vec<OutputFormat>>,

    /// Path to configuration file
    ///
    /// If not specified, looks for .receiptflow.toml in the current directory
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Give up on a job still running after this many seconds
    #[arg(long, value_name = "SECS")]
    pub poll_timeout: Option<u64>,

    /// Match file extensions regardless of case (.PNG, .Pdf, ...)
    #[arg(long)]
    pub ignore_case: bool,

    /// Enable verbose logging output
    #[arg(short, long)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long)]
    pub quiet: bool,

    /// Dry run: list the files that would be uploaded and exit
    #[arg(long)]
    pub dry_run: bool,

    /// Exit with code 2 if any upload, submission or job failed
    #[arg(long)]
    pub fail_on_errors: bool,

    /// Generate a default .receiptflow.toml configuration file
    #[arg(long)]
    pub init_config: bool,
}

/// Output format for the report.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Full report as JSON
    Json,
    /// One row per analysed document
    Csv,
    /// Human-readable summary
    Markdown,
}

impl OutputFormat {
    /// File name the report is written to.
    pub fn file_name(&self) -> &'static str {
        match self {
            OutputFormat::Json => "report.json",
            OutputFormat::Csv => "report.csv",
            OutputFormat::Markdown => "report.md",
        }
    }
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        // Skip validation for --init-config
        if self.init_config {
            return Ok(());
        }

        if self.concurrency == Some(0) {
            return Err("Concurrency must be at least 1".to_string());
        }

        if self.rate == Some(0) {
            return Err("Rate must be at least 1".to_string());
        }

        if self.poll_timeout == Some(0) {
            return Err("Poll timeout must be at least 1 second".to_string());
        }

        // Check for conflicting options
        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        if !self.input.exists() {
            return Err(format!(
                "Input directory does not exist: {}",
                self.input.display()
            ));
        }
        if !self.input.is_dir() {
            return Err(format!(
                "Input path is not a directory: {}",
                self.input.display()
            ));
        }

        Ok(())
    }
}
