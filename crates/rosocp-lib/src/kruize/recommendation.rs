//! Recommendation responses and their validity rules

use super::payload::kruize_time;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Notification codes that are reported but never invalidate a datum
pub const NOTICE_CODES: [&str; 4] = ["323004", "323005", "324003", "324004"];

/// Monitoring start the analyzer uses for "not computed"
pub const ZERO_TIME: &str = "0001-01-01T00:00:00Z";

/// Short-term window, used when a datum carries no start time
const SHORT_TERM_HOURS: i64 = 24;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub code: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Recommendations {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub notifications: BTreeMap<String, Notification>,
    /// Data points keyed by monitoring end time, kept verbatim
    #[serde(default)]
    pub data: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendedContainer {
    #[serde(default)]
    pub container_image_name: Option<String>,
    pub container_name: String,
    #[serde(default)]
    pub recommendations: Recommendations,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendedNamespace {
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub recommendations: Recommendations,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendedObject {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub containers: Vec<RecommendedContainer>,
    #[serde(default)]
    pub namespaces: Option<RecommendedNamespace>,
}

/// One element of an `updateRecommendations` / `listRecommendations` body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendedExperiment {
    #[serde(default)]
    pub cluster_name: Option<String>,
    #[serde(default)]
    pub experiment_name: Option<String>,
    #[serde(default)]
    pub experiment_type: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub kubernetes_objects: Vec<RecommendedObject>,
}

/// Why a response body was rejected
#[derive(Debug, Error, PartialEq)]
pub enum InvalidRecommendation {
    #[error("response is empty")]
    Empty,

    #[error("response has no kubernetes objects")]
    NoObjects,

    #[error("response has no containers")]
    NoContainers,

    #[error("response has no namespace block")]
    NoNamespace,

    #[error("{target} has no recommendation data")]
    NoData { target: String },

    #[error("{target} carries blocking notification {code}")]
    Blocking { target: String, code: String },
}

/// How a notification code affects validity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationClass {
    Informational,
    Notice,
    Blocking,
}

pub fn classify(code: &str, notification: &Notification) -> NotificationClass {
    if NOTICE_CODES.contains(&code) {
        NotificationClass::Notice
    } else if code.starts_with('1') || notification.kind.eq_ignore_ascii_case("info") {
        NotificationClass::Informational
    } else {
        NotificationClass::Blocking
    }
}

/// A data point ready to be stored
#[derive(Debug, Clone, PartialEq)]
pub struct RecommendationItem {
    /// Container name, or the namespace for namespace experiments
    pub target: String,
    pub monitoring_start: DateTime<Utc>,
    pub monitoring_end: DateTime<Utc>,
    pub datum: Value,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidRecommendation {
    pub items: Vec<RecommendationItem>,
    /// Notice codes seen along the way
    pub notices: Vec<String>,
}

fn datum_notifications(datum: &Value) -> BTreeMap<String, Notification> {
    datum
        .get("notifications")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
}

fn monitoring_start(datum: &Value, end: DateTime<Utc>) -> DateTime<Utc> {
    datum
        .pointer("/recommendation_terms/short_term/monitoring_start_time")
        .and_then(Value::as_str)
        .filter(|s| *s != ZERO_TIME)
        .and_then(kruize_time::parse)
        .unwrap_or(end - Duration::hours(SHORT_TERM_HOURS))
}

fn collect_items(
    target: &str,
    recommendations: &Recommendations,
    out: &mut ValidRecommendation,
) -> Result<(), InvalidRecommendation> {
    if recommendations.data.is_empty() {
        return Err(InvalidRecommendation::NoData {
            target: target.to_string(),
        });
    }
    // Only data points decide validity; top-level codes are counted
    out.notices.extend(
        recommendations
            .notifications
            .iter()
            .filter(|(code, n)| classify(code, n) == NotificationClass::Notice)
            .map(|(code, _)| code.clone()),
    );
    for (key, datum) in &recommendations.data {
        for (code, notification) in datum_notifications(datum) {
            match classify(&code, &notification) {
                NotificationClass::Informational => {}
                NotificationClass::Notice => out.notices.push(code),
                NotificationClass::Blocking => {
                    return Err(InvalidRecommendation::Blocking {
                        target: target.to_string(),
                        code,
                    })
                }
            }
        }
        let end = datum
            .get("monitoring_end_time")
            .and_then(Value::as_str)
            .and_then(kruize_time::parse)
            .or_else(|| kruize_time::parse(key));
        let Some(monitoring_end) = end else {
            return Err(InvalidRecommendation::NoData {
                target: target.to_string(),
            });
        };
        out.items.push(RecommendationItem {
            target: target.to_string(),
            monitoring_start: monitoring_start(datum, monitoring_end),
            monitoring_end,
            datum: datum.clone(),
        });
    }
    Ok(())
}

fn first_object(body: &[RecommendedExperiment]) -> Result<&RecommendedObject, InvalidRecommendation> {
    let experiment = body.first().ok_or(InvalidRecommendation::Empty)?;
    experiment
        .kubernetes_objects
        .first()
        .ok_or(InvalidRecommendation::NoObjects)
}

/// Validate a container experiment response
pub fn validate_containers(
    body: &[RecommendedExperiment],
) -> Result<ValidRecommendation, InvalidRecommendation> {
    let object = first_object(body)?;
    if object.containers.is_empty() {
        return Err(InvalidRecommendation::NoContainers);
    }
    let mut out = ValidRecommendation::default();
    for container in &object.containers {
        collect_items(&container.container_name, &container.recommendations, &mut out)?;
    }
    Ok(out)
}

/// Validate a namespace experiment response
pub fn validate_namespace(
    body: &[RecommendedExperiment],
) -> Result<ValidRecommendation, InvalidRecommendation> {
    let object = first_object(body)?;
    let block = object
        .namespaces
        .as_ref()
        .ok_or(InvalidRecommendation::NoNamespace)?;
    let target = block
        .namespace
        .clone()
        .or_else(|| object.namespace.clone())
        .unwrap_or_default();
    let mut out = ValidRecommendation::default();
    collect_items(&target, &block.recommendations, &mut out)?;
    Ok(out)
}

/// `part` as a percentage of `whole`; zero when either side is zero
pub fn percentage(part: f64, whole: f64) -> f64 {
    if part == 0.0 || whole == 0.0 {
        0.0
    } else {
        part / whole * 100.0
    }
}

/// Denormalized request figures stored alongside a namespace datum
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NamespaceSummary {
    pub cpu_request_current: Option<f64>,
    pub cpu_variation: Option<f64>,
    pub memory_request_current: Option<f64>,
    pub memory_variation: Option<f64>,
}

pub fn namespace_summary(datum: &Value) -> NamespaceSummary {
    let amount = |path: &str| datum.pointer(path).and_then(Value::as_f64);
    let cpu_current = amount("/current/requests/cpu/amount");
    let memory_current = amount("/current/requests/memory/amount");
    let variation = |path: &str, current: Option<f64>| {
        let delta = amount(path)?;
        Some(percentage(delta, current.unwrap_or(0.0)))
    };
    NamespaceSummary {
        cpu_request_current: cpu_current,
        cpu_variation: variation(
            "/recommendation_terms/short_term/recommendation_engines/cost/variation/requests/cpu/amount",
            cpu_current,
        ),
        memory_request_current: memory_current,
        memory_variation: variation(
            "/recommendation_terms/short_term/recommendation_engines/cost/variation/requests/memory/amount",
            memory_current,
        ),
    }
}
