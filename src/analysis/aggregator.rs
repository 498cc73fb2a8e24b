//! Expense aggregation and statistics.
//!
//! This module extracts summary fields from analysis payloads and assembles
//! the per-batch report.

use crate::config::ReportConfig;
use crate::models::{
    Batch, FailureEntry, JobOutcome, JobResult, OutcomeSummary, Report, ReportMetadata, ReportRow,
    StageFailure,
};
use serde_json::Value;
use std::collections::BTreeMap;

/// Expense summary fields recognised in a report, in column order.
pub const NORMALIZED_FIELDS: &[&str] = &[
    "INVOICE_RECEIPT_DATE",
    "INVOICE_RECEIPT_ID",
    "TAX_PAYER_ID",
    "CUSTOMER_NUMBER",
    "ACCOUNT_NUMBER",
    "VENDOR_NAME",
    "RECEIVER_NAME",
    "VENDOR_ADDRESS",
    "RECEIVER_ADDRESS",
    "ORDER_DATE",
    "DUE_DATE",
    "DELIVERY_DATE",
    "PO_NUMBER",
    "PAYMENT_TERMS",
    "TOTAL",
    "AMOUNT_DUE",
    "AMOUNT_PAID",
    "SUBTOTAL",
    "TAX",
    "SERVICE_CHARGE",
    "GRATUITY",
    "PRIOR_BALANCE",
    "DISCOUNT",
    "SHIPPING_HANDLING_CHARGE",
    "VENDOR_ABN_NUMBER",
    "VENDOR_GST_NUMBER",
    "VENDOR_PAN_NUMBER",
    "VENDOR_VAT_NUMBER",
    "RECEIVER_ABN_NUMBER",
    "RECEIVER_GST_NUMBER",
    "RECEIVER_PAN_NUMBER",
    "RECEIVER_VAT_NUMBER",
    "VENDOR_PHONE",
    "RECEIVER_PHONE",
    "VENDOR_URL",
    "ITEM",
    "QUANTITY",
    "PRICE",
    "UNIT_PRICE",
    "PRODUCT_CODE",
    "ADDRESS",
    "NAME",
    "ADDRESS_BLOCK",
    "STREET",
    "CITY",
    "STATE",
    "COUNTRY",
    "ZIP_CODE",
];

/// Collect the summary fields of every expense document in `payload`.
///
/// Only fields listed in `fields` are kept. When several documents carry the
/// same field, the last one wins.
pub fn summarize_expense(payload: &Value, fields: &[String]) -> BTreeMap<String, String> {
    let mut summary = BTreeMap::new();

    let documents = payload
        .get("ExpenseDocuments")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    for document in documents {
        let summary_fields = document
            .get("SummaryFields")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        for field in summary_fields {
            let name = field.pointer("/Type/Text").and_then(Value::as_str);
            let value = field.pointer("/ValueDetection/Text").and_then(Value::as_str);
            if let (Some(name), Some(value)) = (name, value) {
                if fields.iter().any(|f| f == name) {
                    summary.insert(name.to_string(), value.to_string());
                }
            }
        }
    }

    summary
}

/// Object key relative to the batch prefix.
pub fn source_name(batch: &Batch, key: &str) -> String {
    let prefix = format!("{}/", batch.prefix());
    key.strip_prefix(&prefix).unwrap_or(key).to_string()
}

/// One row per job that produced a payload, sorted by source.
pub fn build_rows(results: &[JobResult], batch: &Batch, fields: &[String]) -> Vec<ReportRow> {
    let mut rows: Vec<ReportRow> = results
        .iter()
        .filter_map(|result| {
            let payload = result.outcome.payload()?;
            Some(ReportRow {
                source: source_name(batch, &result.object.key),
                job_id: result.job_id.clone(),
                status: result.outcome.status(),
                fields: summarize_expense(payload, fields),
            })
        })
        .collect();
    rows.sort_by(|a, b| a.source.cmp(&b.source));
    rows
}

/// Columns to show, in `fields` order.
///
/// With `drop_empty` set, a column is kept only if at least one row has a
/// non-empty value for it.
pub fn populated_columns(rows: &[ReportRow], fields: &[String], drop_empty: bool) -> Vec<String> {
    fields
        .iter()
        .filter(|field| {
            !drop_empty
                || rows.iter().any(|row| {
                    row.fields
                        .get(field.as_str())
                        .is_some_and(|v| !v.trim().is_empty())
                })
        })
        .cloned()
        .collect()
}

/// Everything that did not produce a row: failed jobs and dropped items.
pub fn failure_entries(
    results: &[JobResult],
    stage_failures: &[StageFailure],
    batch: &Batch,
) -> Vec<FailureEntry> {
    let jobs = results.iter().filter_map(|result| match &result.outcome {
        JobOutcome::Failed { reason, .. } => Some(FailureEntry {
            source: source_name(batch, &result.object.key),
            stage: "analysis".to_string(),
            job_id: Some(result.job_id.clone()),
            message: reason.to_string(),
        }),
        _ => None,
    });

    let dropped = stage_failures.iter().map(|failure| FailureEntry {
        source: source_name(batch, &failure.subject),
        stage: failure.stage.to_string(),
        job_id: None,
        message: failure.message.clone(),
    });

    let mut entries: Vec<FailureEntry> = dropped.chain(jobs).collect();
    entries.sort_by(|a, b| a.source.cmp(&b.source).then(a.stage.cmp(&b.stage)));
    entries
}

/// Assemble the full report for a batch.
pub fn build_report(
    metadata: ReportMetadata,
    batch: &Batch,
    results: &[JobResult],
    stage_failures: &[StageFailure],
    config: &ReportConfig,
) -> Report {
    let rows = build_rows(results, batch, &config.fields);
    let columns = populated_columns(&rows, &config.fields, config.drop_empty_columns);
    Report {
        metadata,
        summary: OutcomeSummary::from_results(results, stage_failures),
        columns,
        rows,
        failures: failure_entries(results, stage_failures, batch),
    }
}

/// Sum of a money-like column across rows, ignoring values that do not parse.
///
/// Currency symbols, thousands separators and whitespace are stripped first.
pub fn column_total(rows: &[ReportRow], column: &str) -> Option<f64> {
    let values: Vec<f64> = rows
        .iter()
        .filter_map(|row| row.fields.get(column))
        .filter_map(|raw| {
            let cleaned: String = raw
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
                .collect();
            cleaned.parse::<f64>().ok()
        })
        .collect();

    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum())
    }
}
