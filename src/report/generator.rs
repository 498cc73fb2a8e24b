//! Report generation.
//!
//! This module renders an expense report as JSON, CSV or Markdown and writes
//! the selected formats into the batch's output directory.

use crate::analysis::column_total;
use crate::cli::OutputFormat;
use crate::models::{FailureEntry, OutcomeSummary, Report, ReportMetadata, ReportRow};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Generate a complete Markdown report.
pub fn generate_markdown_report(report: &Report) -> String {
    let mut output = String::new();

    // Title
    output.push_str("# Expense Report\n\n");

    output.push_str(&generate_metadata_section(&report.metadata));
    output.push_str(&generate_summary_section(&report.summary, &report.rows));
    output.push_str(&generate_rows_section(&report.columns, &report.rows));
    output.push_str(&generate_failures_section(&report.failures));
    output.push_str(&generate_footer());

    output
}

/// Generate the metadata section.
fn generate_metadata_section(metadata: &ReportMetadata) -> String {
    let mut section = String::new();

    section.push_str("## Metadata\n\n");
    section.push_str(&format!("- **Batch:** `{}`\n", metadata.batch_id));
    section.push_str(&format!(
        "- **Location:** `s3://{}/{}/` ({})\n",
        metadata.bucket, metadata.batch_id, metadata.region
    ));
    section.push_str(&format!("- **Input Directory:** `{}`\n", metadata.input_dir));
    section.push_str(&format!(
        "- **Generated:** {}\n",
        metadata.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    section.push_str(&format!(
        "- **Duration:** {:.1}s\n",
        metadata.duration_seconds
    ));
    if metadata.interrupted {
        section.push_str("- **Interrupted:** yes, results are incomplete\n");
    }
    section.push('\n');

    section
}

/// Generate the summary section.
fn generate_summary_section(summary: &OutcomeSummary, rows: &[ReportRow]) -> String {
    let mut section = String::new();

    section.push_str("## Summary\n\n");
    section.push_str("| ✅ Succeeded | 🟡 Partial | ❌ Failed | **Jobs** | Upload Failures | Submission Failures |\n");
    section.push_str("|:---:|:---:|:---:|:---:|:---:|:---:|\n");
    section.push_str(&format!(
        "| {} | {} | {} | **{}** | {} | {} |\n\n",
        summary.succeeded,
        summary.partial_success,
        summary.failed,
        summary.total_jobs,
        summary.upload_failures,
        summary.submission_failures
    ));

    if !summary.failures_by_kind.is_empty() {
        section.push_str("### Failed Jobs by Kind\n\n");
        section.push_str("| Kind | Count |\n");
        section.push_str("|:---|:---:|\n");

        let mut kinds: Vec<_> = summary.failures_by_kind.iter().collect();
        kinds.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));

        for (kind, count) in kinds {
            section.push_str(&format!("| {} | {} |\n", kind, count));
        }
        section.push('\n');
    }

    if let Some(total) = column_total(rows, "TOTAL") {
        section.push_str(&format!("**Sum of TOTAL:** {:.2}\n\n", total));
    }

    section
}

/// Generate the extracted-fields table.
fn generate_rows_section(columns: &[String], rows: &[ReportRow]) -> String {
    let mut section = String::new();

    section.push_str("## Extracted Fields\n\n");

    if rows.is_empty() {
        section.push_str("No documents were analysed successfully.\n\n");
        return section;
    }

    section.push_str("| Source | Status |");
    for column in columns {
        section.push_str(&format!(" {} |", column));
    }
    section.push('\n');
    section.push_str("|:---|:---:|");
    for _ in columns {
        section.push_str(":---|");
    }
    section.push('\n');

    for row in rows {
        section.push_str(&format!("| `{}` | {} |", row.source, row.status));
        for column in columns {
            let value = row.fields.get(column).map(String::as_str).unwrap_or("");
            section.push_str(&format!(" {} |", markdown_cell(value)));
        }
        section.push('\n');
    }
    section.push('\n');

    section
}

/// Generate the failures section.
fn generate_failures_section(failures: &[FailureEntry]) -> String {
    if failures.is_empty() {
        return String::new();
    }

    let mut section = String::new();

    section.push_str("## Failures\n\n");
    section.push_str("| Source | Stage | Job | Message |\n");
    section.push_str("|:---|:---|:---|:---|\n");

    for failure in failures {
        let job = failure
            .job_id
            .as_ref()
            .map(|id| format!("`{}`", id))
            .unwrap_or_default();
        section.push_str(&format!(
            "| `{}` | {} | {} | {} |\n",
            failure.source,
            failure.stage,
            job,
            markdown_cell(&failure.message)
        ));
    }
    section.push('\n');

    section
}

/// Generate the report footer.
fn generate_footer() -> String {
    let mut footer = String::new();

    footer.push_str("---\n\n");
    footer.push_str(&format!(
        "*Report generated by receiptflow v{}*\n",
        env!("CARGO_PKG_VERSION")
    ));

    footer
}

fn markdown_cell(value: &str) -> String {
    value.replace('|', "\\|").replace('\n', "<br>")
}

/// Generate a JSON report.
pub fn generate_json_report(report: &Report) -> Result<String> {
    serde_json::to_string_pretty(report).map_err(Into::into)
}

/// Generate a CSV table with one line per extracted row.
pub fn generate_csv_report(report: &Report) -> String {
    let mut output = String::new();

    let mut header = vec!["source".to_string(), "job_id".to_string(), "status".to_string()];
    header.extend(report.columns.iter().cloned());
    output.push_str(&csv_line(&header));

    for row in &report.rows {
        let mut line = vec![row.source.clone(), row.job_id.to_string(), row.status.to_string()];
        for column in &report.columns {
            line.push(row.fields.get(column).cloned().unwrap_or_default());
        }
        output.push_str(&csv_line(&line));
    }

    output
}

fn csv_line(fields: &[String]) -> String {
    let escaped: Vec<String> = fields.iter().map(|f| csv_field(f)).collect();
    format!("{}\n", escaped.join(","))
}

/// Quote a field if it contains a separator, quote or line break.
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Render `report` in `format`.
pub fn render(report: &Report, format: OutputFormat) -> Result<String> {
    Ok(match format {
        OutputFormat::Json => generate_json_report(report)?,
        OutputFormat::Csv => generate_csv_report(report),
        OutputFormat::Markdown => generate_markdown_report(report),
    })
}

/// Write every requested format to `<output_dir>/<batch-id>/`.
///
/// Returns the paths written, in `formats` order.
pub fn save_report(
    report: &Report,
    output_dir: &Path,
    formats: &[OutputFormat],
) -> Result<Vec<PathBuf>> {
    let dir = output_dir.join(&report.metadata.batch_id);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create output directory {}", dir.display()))?;

    let mut written = Vec::new();
    for format in formats {
        let path = dir.join(format.file_name());
        if written.contains(&path) {
            continue;
        }
        let content = render(report, *format)?;
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
        written.push(path);
    }

    Ok(written)
}
