//! Presentation of stored recommendation documents
//!
//! Stored documents keep analyzer units (cores, bytes). Before they are
//! served, amounts are converted to the caller's units, variations are
//! expressed as a percentage of the current value, and notifications the
//! UI does not render are removed.

use super::error::ApiError;
use super::list_options::QueryParams;
use crate::kruize::recommendation::{percentage, NOTICE_CODES, ZERO_TIME};
use serde_json::{Map, Value};

pub const TERMS: [&str; 3] = ["short_term", "medium_term", "long_term"];
pub const ENGINES: [&str; 2] = ["cost", "performance"];
const SECTIONS: [&str; 2] = ["limits", "requests"];
const PLOT_STATS: [&str; 5] = ["q1", "q3", "min", "max", "median"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CpuUnit {
    #[default]
    Cores,
    Millicores,
}

impl CpuUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            CpuUnit::Cores => "cores",
            CpuUnit::Millicores => "millicores",
        }
    }

    pub fn convert(&self, cores: f64) -> f64 {
        match self {
            CpuUnit::Cores => truncate_three_decimals(cores),
            CpuUnit::Millicores => (cores * 1000.0).round(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryUnit {
    Bytes,
    #[default]
    MiB,
    GiB,
}

impl MemoryUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryUnit::Bytes => "bytes",
            MemoryUnit::MiB => "MiB",
            MemoryUnit::GiB => "GiB",
        }
    }

    pub fn convert(&self, bytes: f64) -> f64 {
        let truncate = |v: f64| (v * 100.0).trunc() / 100.0;
        match self {
            MemoryUnit::Bytes => bytes,
            MemoryUnit::MiB => truncate(bytes / 1024.0 / 1024.0),
            MemoryUnit::GiB => truncate(bytes / 1024.0 / 1024.0 / 1024.0),
        }
    }
}

/// Units requested through `cpu_unit` / `memory_unit`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Units {
    pub cpu: CpuUnit,
    pub memory: MemoryUnit,
}

impl Units {
    pub fn parse(params: &QueryParams) -> Result<Self, ApiError> {
        let cpu = match params.get("cpu_unit") {
            None | Some("cores") => CpuUnit::Cores,
            Some("millicores") => CpuUnit::Millicores,
            Some(other) => return Err(ApiError::bad_request(format!("invalid cpu_unit: {other}"))),
        };
        let memory = match params.get("memory_unit") {
            None | Some("MiB") => MemoryUnit::MiB,
            Some("GiB") => MemoryUnit::GiB,
            Some("bytes") => MemoryUnit::Bytes,
            Some(other) => return Err(ApiError::bad_request(format!("invalid memory_unit: {other}"))),
        };
        Ok(Self { cpu, memory })
    }
}

/// Truncate to three decimals, leaving shorter values untouched
pub fn truncate_three_decimals(value: f64) -> f64 {
    let text = value.to_string();
    match text.split_once('.') {
        Some((_, decimals)) if decimals.len() > 3 => (value * 1000.0).trunc() / 1000.0,
        _ => value,
    }
}

fn number(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn amount_at(doc: &Value, section: &str, resource: &str) -> f64 {
    doc.get(section)
        .and_then(|s| s.get(resource))
        .and_then(|r| r.get("amount"))
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
}

/// Convert the `{limits,requests}.{cpu,memory}` amounts of one block
fn convert_block(block: &mut Value, units: Units) {
    for section in SECTIONS {
        let Some(section) = block.get_mut(section) else {
            continue;
        };
        if let Some(cpu) = section.get_mut("cpu").and_then(Value::as_object_mut) {
            if let Some(amount) = cpu.get("amount").and_then(Value::as_f64) {
                cpu.insert("amount".into(), number(units.cpu.convert(amount)));
                cpu.insert("format".into(), units.cpu.as_str().into());
            }
        }
        if let Some(memory) = section.get_mut("memory").and_then(Value::as_object_mut) {
            if let Some(amount) = memory.get("amount").and_then(Value::as_f64) {
                memory.insert("amount".into(), number(units.memory.convert(amount)));
                memory.insert("format".into(), units.memory.as_str().into());
            }
        }
    }
}

/// Express a variation block relative to the unconverted `current` block
fn variation_to_percent(variation: &mut Value, current: &Value) {
    for section in SECTIONS {
        let Some(block) = variation.get_mut(section) else {
            continue;
        };
        for resource in ["cpu", "memory"] {
            let Some(entry) = block.get_mut(resource).and_then(Value::as_object_mut) else {
                continue;
            };
            let Some(delta) = entry.get("amount").and_then(Value::as_f64) else {
                continue;
            };
            let whole = amount_at(current, section, resource);
            entry.insert(
                "amount".into(),
                number(truncate_three_decimals(percentage(delta, whole))),
            );
            entry.insert("format".into(), "percent".into());
        }
    }
}

fn convert_plots(term: &mut Map<String, Value>, units: Units) {
    let Some(points) = term
        .get_mut("plots")
        .and_then(|p| p.get_mut("plots_data"))
        .and_then(Value::as_object_mut)
    else {
        return;
    };
    for point in points.values_mut() {
        if let Some(cpu) = point.get_mut("cpuUsage").and_then(Value::as_object_mut) {
            for stat in PLOT_STATS {
                if let Some(v) = cpu.get(stat).and_then(Value::as_f64) {
                    cpu.insert(stat.into(), number(units.cpu.convert(v)));
                }
            }
            cpu.insert("format".into(), units.cpu.as_str().into());
        }
        if let Some(memory) = point.get_mut("memoryUsage").and_then(Value::as_object_mut) {
            for stat in PLOT_STATS {
                if let Some(v) = memory.get(stat).and_then(Value::as_f64) {
                    memory.insert(stat.into(), number(units.memory.convert(v)));
                }
            }
            memory.insert("format".into(), units.memory.as_str().into());
        }
    }
}

/// Remove notification codes outside the notice allowlist, collecting them in `dropped`
fn filter_notifications(notifications: Option<&mut Value>, dropped: &mut Vec<String>) {
    let Some(notifications) = notifications.and_then(Value::as_object_mut) else {
        return;
    };
    notifications.retain(|code, _| {
        let keep = NOTICE_CODES.contains(&code.as_str());
        if !keep {
            dropped.push(code.clone());
        }
        keep
    });
}

/// Rewrite a stored document for presentation
///
/// Returns the notification codes that were removed.
pub fn present(doc: &mut Value, units: Units, drop_plots: bool) -> Vec<String> {
    let mut dropped = Vec::new();
    let current = doc.get("current").cloned().unwrap_or(Value::Null);

    filter_notifications(doc.get_mut("notifications"), &mut dropped);

    if let Some(terms) = doc.get_mut("recommendation_terms") {
        for name in TERMS {
            let Some(term) = terms.get_mut(name).and_then(Value::as_object_mut) else {
                continue;
            };
            if term.get("monitoring_start_time").and_then(Value::as_str) == Some(ZERO_TIME) {
                term.remove("monitoring_start_time");
            }
            if let Some(hours) = term.get("duration_in_hours").and_then(Value::as_f64) {
                term.insert("duration_in_hours".into(), number((hours * 10.0).trunc() / 10.0));
            }
            if drop_plots {
                term.remove("plots");
            } else {
                convert_plots(term, units);
            }
            filter_notifications(term.get_mut("notifications"), &mut dropped);

            if let Some(engines) = term.get_mut("recommendation_engines") {
                for engine in ENGINES {
                    let Some(engine) = engines.get_mut(engine) else {
                        continue;
                    };
                    filter_notifications(engine.get_mut("notifications"), &mut dropped);
                    if let Some(config) = engine.get_mut("config") {
                        convert_block(config, units);
                    }
                    if let Some(variation) = engine.get_mut("variation") {
                        variation_to_percent(variation, &current);
                    }
                }
            }
        }
    }

    if let Some(current) = doc.get_mut("current") {
        convert_block(current, units);
    }
    dropped
}
