//! receiptflow - bulk expense extraction
//!
//! Uploads a directory of receipts to object storage, runs an asynchronous
//! expense analysis job per document, and writes the extracted fields as a
//! report.
//!
//! Exit codes:
//!   0   - Success
//!   1   - Runtime or configuration error
//!   2   - A failure was recorded and --fail-on-errors was set
//!   130 - Interrupted with Ctrl-C (a partial report is still written)

mod analysis;
mod aws;
mod cli;
mod config;
mod error;
mod models;
mod pipeline;
mod progress;
mod report;
mod scanner;
mod services;

use anyhow::{Context, Result};
use chrono::Utc;
use cli::Args;
use config::{Config, DEFAULT_CONFIG_FILE};
use models::{Batch, ReportMetadata};
use pipeline::Pipeline;
use progress::PipelineProgress;
use scanner::{FileScanner, ScanConfig};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

const EXIT_FAILURES: i32 = 2;
const EXIT_INTERRUPTED: i32 = 130;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse_args();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle --init-config early (no logging needed)
    if args.init_config {
        return handle_init_config();
    }

    let (mut config, config_path) = match Config::discover(args.config.as_deref(), Path::new(".")) {
        Ok(Some((config, path))) => (config, Some(path)),
        Ok(None) => (Config::default(), None),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    };
    config.merge_with_args(&args);

    init_logging(&config, args.quiet);

    info!("receiptflow v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);
    match config_path {
        Some(path) => info!("Loaded config from {}", path.display()),
        None => debug!("No config file found, using defaults"),
    }

    match run(args, config).await {
        Ok(exit_code) => {
            std::process::exit(exit_code);
        }
        Err(e) => {
            error!("Run failed: {:#}", e);
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Handle --init-config: generate a default .receiptflow.toml.
fn handle_init_config() -> Result<()> {
    let path = Path::new(DEFAULT_CONFIG_FILE);

    if path.exists() {
        eprintln!(
            "⚠️  {} already exists. Remove it first or edit it manually.",
            DEFAULT_CONFIG_FILE
        );
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content)
        .with_context(|| format!("Failed to write {}", DEFAULT_CONFIG_FILE))?;

    println!("✅ Created {} with default settings.", DEFAULT_CONFIG_FILE);
    println!("   Set [aws].bucket and [aws].region, then adjust rates and report fields.");
    Ok(())
}

/// Initialize logging. `RUST_LOG` wins over -v/-q and `[general] verbose` when set.
fn init_logging(config: &Config, quiet: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level(quiet).to_string().to_lowercase()));

    let result = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .try_init();

    if let Err(e) = result {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

/// Run one batch end to end. Returns the exit code.
async fn run(args: Args, config: Config) -> Result<i32> {
    let start_time = Instant::now();

    let scan_config = ScanConfig::from(&config.scanner);

    if args.dry_run {
        return handle_dry_run(&args.input, &scan_config, &config);
    }

    config.validate()?;
    let credentials = aws::Credentials::from_env()?;
    let aws_settings = config.aws_settings();
    let client = aws::http_client(&aws_settings)?;
    let store = Arc::new(aws::S3Store::new(
        client.clone(),
        credentials.clone(),
        &aws_settings,
    )?);
    let textract = Arc::new(aws::TextractService::new(client, credentials, &aws_settings)?);

    let settings = config.pipeline_settings();
    let batch = Batch::new();

    println!(
        "📤 Processing receipts in {} → s3://{}/{}/",
        args.input.display(),
        settings.bucket,
        batch.prefix()
    );
    println!(
        "   Region: {} | Workers: {} | Submission ceiling: {} bytes per {}ms",
        aws_settings.region,
        settings.concurrency,
        settings.submission_rate,
        settings.rate_window.as_millis()
    );

    let progress = if args.quiet {
        PipelineProgress::hidden()
    } else {
        PipelineProgress::visible()
    };

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        let progress = progress.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                progress.println("⚠️  Interrupted; abandoning unfinished jobs...");
                cancel.cancel();
            }
        }
    });

    let file_scanner = FileScanner::new(args.input.clone(), scan_config);
    let tasks = file_scanner.stream_tasks(batch.clone(), settings.channel_capacity, cancel.clone());

    let pipeline = Pipeline::new(settings.clone(), store, textract, progress);
    let outcome = pipeline.run(&batch, tasks, cancel).await;

    println!("\n📝 Generating report...");

    let metadata = ReportMetadata {
        batch_id: batch.id().to_string(),
        bucket: settings.bucket.clone(),
        region: aws_settings.region.clone(),
        input_dir: args.input.display().to_string(),
        generated_at: Utc::now(),
        duration_seconds: start_time.elapsed().as_secs_f64(),
        interrupted: outcome.cancelled,
    };
    let report = analysis::build_report(
        metadata,
        &batch,
        &outcome.results,
        &outcome.failures,
        &config.report,
    );
    let written = report::save_report(
        &report,
        Path::new(&config.general.output_dir),
        &config.general.formats,
    )?;

    let summary = &report.summary;
    println!("\n📊 Batch Summary:");
    println!(
        "   Files found: {} | Uploaded: {} | Jobs: {}",
        outcome.counters.discovered, outcome.counters.uploaded, outcome.counters.submitted
    );
    println!(
        "   - ✅ Succeeded: {} | 🟡 Partial: {} | ❌ Failed: {}",
        summary.succeeded, summary.partial_success, summary.failed
    );
    if summary.upload_failures > 0 || summary.submission_failures > 0 {
        println!(
            "   - ⚠️  Upload failures: {} | Submission failures: {}",
            summary.upload_failures, summary.submission_failures
        );
    }
    println!(
        "   Status checks: {} ({} transient errors, {} timeouts)",
        outcome.tracker.polls, outcome.tracker.transient_errors, outcome.tracker.timeouts
    );
    println!("   Duration: {:.1}s", report.metadata.duration_seconds);
    for path in &written {
        println!("   📄 {}", path.display());
    }

    if outcome.cancelled {
        eprintln!(
            "\n⛔ Interrupted: {} unfinished jobs were abandoned.",
            outcome.tracker.cancelled
        );
        return Ok(EXIT_INTERRUPTED);
    }

    println!("\n✅ Batch {} complete!", batch);

    if args.fail_on_errors && summary.has_failures() {
        eprintln!("\n⛔ Failures were recorded. Failing (exit code {}).", EXIT_FAILURES);
        return Ok(EXIT_FAILURES);
    }

    Ok(0)
}

/// Handle --dry-run: scan files, print what would be uploaded, exit.
fn handle_dry_run(input: &Path, scan_config: &ScanConfig, config: &Config) -> Result<i32> {
    println!("\n🔍 Dry run: scanning files (no uploads, no analysis jobs)...\n");

    let file_scanner = FileScanner::new(input.to_path_buf(), scan_config.clone());
    let files = file_scanner.scan()?;

    if files.is_empty() {
        println!(
            "   No matching receipts found in {}.",
            file_scanner.root().display()
        );
    } else {
        println!("   Found {} files that would be uploaded:\n", files.len());
        let total: u64 = files.iter().map(|f| f.size).sum();
        for file in &files {
            println!("     📄 {} ({} bytes)", file.path, file.size);
        }
        println!("\n   Total: {} files, {} bytes", files.len(), total);
    }

    if let Err(e) = config.validate() {
        println!("\n⚠️  A real run would stop here: {}", e);
    }

    println!("\n✅ Dry run complete. No network calls were made.");
    Ok(0)
}
