//! CSV export of recommendation listings
//!
//! Each stored document expands into one row per term and engine that has
//! data. Documents are expected to have gone through
//! [`present`](super::transform::present) already, so amounts carry the
//! caller's units and variations are percentages.

use super::transform::{ENGINES, TERMS};
use crate::storage::{NamespaceRecommendationRecord, RecommendationRecord};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

pub const CONTAINER_HEADER: [&str; 38] = [
    "id",
    "cluster_uuid",
    "cluster_alias",
    "container",
    "project",
    "workload",
    "workload_type",
    "last_reported",
    "source_id",
    "current_cpu_limit_amount",
    "current_cpu_limit_format",
    "current_memory_limit_amount",
    "current_memory_limit_format",
    "current_cpu_request_amount",
    "current_cpu_request_format",
    "current_memory_request_amount",
    "current_memory_request_format",
    "monitoring_end_time",
    "recommendation_term",
    "duration_in_hours",
    "monitoring_start_time",
    "recommendation_type",
    "config_cpu_limit_amount",
    "config_cpu_limit_format",
    "config_memory_limit_amount",
    "config_memory_limit_format",
    "config_cpu_request_amount",
    "config_cpu_request_format",
    "config_memory_request_amount",
    "config_memory_request_format",
    "variation_cpu_limit_amount",
    "variation_cpu_limit_format",
    "variation_memory_limit_amount",
    "variation_memory_limit_format",
    "variation_cpu_request_amount",
    "variation_cpu_request_format",
    "variation_memory_request_amount",
    "variation_memory_request_format",
];

/// Namespaces only carry requests
pub const NAMESPACE_HEADER: [&str; 23] = [
    "id",
    "cluster_uuid",
    "cluster_alias",
    "project",
    "last_reported",
    "source_id",
    "current_cpu_request_amount",
    "current_cpu_request_format",
    "current_memory_request_amount",
    "current_memory_request_format",
    "monitoring_end_time",
    "recommendation_term",
    "duration_in_hours",
    "monitoring_start_time",
    "recommendation_type",
    "config_cpu_request_amount",
    "config_cpu_request_format",
    "config_memory_request_amount",
    "config_memory_request_format",
    "variation_cpu_request_amount",
    "variation_cpu_request_format",
    "variation_memory_request_amount",
    "variation_memory_request_format",
];

/// Three decimals at most, without trailing zeros
pub fn format_amount(value: f64) -> String {
    let truncated = (value * 1000.0).trunc() / 1000.0;
    let text = format!("{truncated:.3}");
    let text = text.trim_end_matches('0').trim_end_matches('.');
    match text {
        "-0" => "0".to_string(),
        other => other.to_string(),
    }
}

fn text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.as_f64().map(format_amount).unwrap_or_default(),
        _ => String::new(),
    }
}

fn timestamp(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default()
}

/// `amount`, `format` of `block.section.resource`
fn pair(block: Option<&Value>, section: &str, resource: &str) -> [String; 2] {
    let entry = block.and_then(|b| b.get(section)).and_then(|s| s.get(resource));
    [
        text(entry.and_then(|e| e.get("amount"))),
        text(entry.and_then(|e| e.get("format"))),
    ]
}

/// Cells of a block for the given sections, cpu before memory
fn block_cells(block: Option<&Value>, sections: &[&str]) -> Vec<String> {
    sections
        .iter()
        .flat_map(|section| {
            let [cpu_amount, cpu_format] = pair(block, section, "cpu");
            let [memory_amount, memory_format] = pair(block, section, "memory");
            [cpu_amount, cpu_format, memory_amount, memory_format]
        })
        .collect()
}

/// Rows for every (term, engine) with data, identity cells first
fn expand(prefix: &[String], doc: &Value, sections: &[&str]) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let current = block_cells(doc.get("current"), sections);
    let end = text(doc.get("monitoring_end_time"));

    for term_name in TERMS {
        let Some(term) = doc.pointer(&format!("/recommendation_terms/{term_name}")) else {
            continue;
        };
        let Some(engines) = term.get("recommendation_engines") else {
            continue;
        };
        for engine_name in ENGINES {
            let Some(engine) = engines.get(engine_name) else {
                continue;
            };
            let mut row = prefix.to_vec();
            row.extend(current.iter().cloned());
            row.push(end.clone());
            row.push(term_name.to_string());
            row.push(text(term.get("duration_in_hours")));
            row.push(text(term.get("monitoring_start_time")));
            row.push(engine_name.to_string());
            row.extend(block_cells(engine.get("config"), sections));
            row.extend(block_cells(engine.get("variation"), sections));
            rows.push(row);
        }
    }
    rows
}

fn write_rows(header: &[&str], rows: impl Iterator<Item = Vec<String>>) -> Result<Vec<u8>, csv::Error> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(header)?;
    for row in rows {
        writer.write_record(&row)?;
    }
    writer
        .into_inner()
        .map_err(|e| csv::Error::from(e.into_error()))
}

/// Container recommendations with their presented documents
pub fn container_csv(items: &[(RecommendationRecord, Value)]) -> Result<Vec<u8>, csv::Error> {
    let rows = items.iter().flat_map(|(record, doc)| {
        let prefix = [
            record.id.to_string(),
            record.cluster_uuid.clone(),
            record.cluster_alias.clone(),
            record.container.clone(),
            record.project.clone(),
            record.workload.clone(),
            record.workload_type.clone(),
            timestamp(record.last_reported),
            record.source_id.clone(),
        ];
        expand(&prefix, doc, &["limits", "requests"])
    });
    write_rows(&CONTAINER_HEADER, rows)
}

pub fn namespace_csv(items: &[(NamespaceRecommendationRecord, Value)]) -> Result<Vec<u8>, csv::Error> {
    let rows = items.iter().flat_map(|(record, doc)| {
        let prefix = [
            record.id.to_string(),
            record.cluster_uuid.clone(),
            record.cluster_alias.clone(),
            record.project.clone(),
            timestamp(record.last_reported),
            record.source_id.clone(),
        ];
        expand(&prefix, doc, &["requests"])
    });
    write_rows(&NAMESPACE_HEADER, rows)
}
