//! Request bodies sent to the analyzer

use super::{PERFORMANCE_PROFILE, PAYLOAD_VERSION};
use crate::experiment::ExperimentKey;
use crate::report::{AggregatedRow, K8sObjectGroup, Metric, NamespaceInterval, Stat};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

/// Analyzer timestamps: RFC 3339, millisecond precision, `Z` suffix
pub mod kruize_time {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

    pub fn format(ts: &DateTime<Utc>) -> String {
        ts.format(FORMAT).to_string()
    }

    pub fn parse(value: &str) -> Option<DateTime<Utc>> {
        NaiveDateTime::parse_from_str(value, FORMAT)
            .map(|n| n.and_utc())
            .ok()
            .or_else(|| {
                DateTime::parse_from_rfc3339(value)
                    .ok()
                    .map(|ts| ts.with_timezone(&Utc))
            })
    }

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp {raw:?}")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerRef {
    pub container_image_name: String,
    pub container_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceRef {
    pub namespace: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentObject {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub containers: Option<Vec<ContainerRef>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespaces: Option<NamespaceRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialSettings {
    pub measurement_duration: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationSettings {
    pub threshold: String,
}

/// Body element of `POST /createExperiment`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateExperiment {
    pub version: String,
    pub experiment_name: String,
    pub cluster_name: String,
    pub performance_profile: String,
    pub mode: String,
    pub target_cluster: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experiment_type: Option<String>,
    pub kubernetes_objects: Vec<ExperimentObject>,
    pub trial_settings: TrialSettings,
    pub recommendation_settings: RecommendationSettings,
}

impl CreateExperiment {
    fn base(key: &ExperimentKey, object: ExperimentObject, experiment_type: Option<String>) -> Self {
        Self {
            version: PAYLOAD_VERSION.to_string(),
            experiment_name: key.experiment_name(),
            cluster_name: key.cluster_name(),
            performance_profile: PERFORMANCE_PROFILE.to_string(),
            mode: "monitor".to_string(),
            target_cluster: "remote".to_string(),
            experiment_type,
            kubernetes_objects: vec![object],
            trial_settings: TrialSettings {
                measurement_duration: "15min".to_string(),
            },
            recommendation_settings: RecommendationSettings {
                threshold: "0.1".to_string(),
            },
        }
    }

    /// Experiment for a workload and its (container, image) pairs
    pub fn for_workload(key: &ExperimentKey, containers: &[(String, String)]) -> Self {
        let containers = containers
            .iter()
            .map(|(name, image)| ContainerRef {
                container_image_name: image.clone(),
                container_name: name.clone(),
            })
            .collect();
        let object = ExperimentObject {
            kind: Some(key.kind.as_str().to_string()),
            name: Some(key.name.clone()),
            namespace: Some(key.namespace.clone()),
            containers: Some(containers),
            namespaces: None,
        };
        Self::base(key, object, None)
    }

    pub fn for_namespace(key: &ExperimentKey) -> Self {
        let object = ExperimentObject {
            kind: None,
            name: None,
            namespace: None,
            containers: None,
            namespaces: Some(NamespaceRef {
                namespace: key.namespace.clone(),
            }),
        };
        Self::base(key, object, Some(key.experiment_type().as_str().to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    pub sum: f64,
    pub avg: f64,
    pub format: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricResults {
    pub aggregation_info: AggregationInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricEntry {
    pub name: String,
    pub results: MetricResults,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerResult {
    pub container_image_name: String,
    pub container_name: String,
    pub metrics: Vec<MetricEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceResult {
    pub namespace: String,
    pub metrics: Vec<MetricEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultObject {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub containers: Option<Vec<ContainerResult>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespaces: Option<NamespaceResult>,
}

/// Body element of `POST /updateResults`: one measurement interval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateResult {
    pub version: String,
    pub experiment_name: String,
    #[serde(with = "kruize_time")]
    pub interval_start_time: DateTime<Utc>,
    #[serde(with = "kruize_time")]
    pub interval_end_time: DateTime<Utc>,
    pub kubernetes_objects: Vec<ResultObject>,
}

impl UpdateResult {
    pub fn interval(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        (self.interval_start_time, self.interval_end_time)
    }

    /// Containers reported in this interval
    pub fn containers(&self) -> impl Iterator<Item = &ContainerResult> {
        self.kubernetes_objects
            .iter()
            .filter_map(|o| o.containers.as_ref())
            .flatten()
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn metric_name(metric: Metric) -> &'static str {
    match metric {
        Metric::CpuRequest => "cpuRequest",
        Metric::CpuLimit => "cpuLimit",
        Metric::CpuUsage => "cpuUsage",
        Metric::CpuThrottle => "cpuThrottle",
        Metric::MemoryRequest => "memoryRequest",
        Metric::MemoryLimit => "memoryLimit",
        Metric::MemoryUsage => "memoryUsage",
        Metric::MemoryRss => "memoryRSS",
    }
}

fn namespace_metric_name(metric: Metric) -> String {
    let name = metric_name(metric);
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => format!("namespace{}{}", first.to_ascii_uppercase(), chars.as_str()),
        None => String::from("namespace"),
    }
}

/// Convert one metric's aggregates into an analyzer entry
///
/// A metric is only reported when both its sum and average are known.
/// Memory is sent in MiB, CPU in cores.
fn metric_entry(
    name: String,
    metric: Metric,
    value: impl Fn(Metric, Stat) -> Option<f64>,
) -> Option<MetricEntry> {
    let scale = |v: f64| {
        if metric.is_memory() {
            round2(v / BYTES_PER_MIB)
        } else {
            round2(v)
        }
    };
    let sum = value(metric, Stat::Sum)?;
    let avg = value(metric, Stat::Avg)?;
    Some(MetricEntry {
        name,
        results: MetricResults {
            aggregation_info: AggregationInfo {
                min: value(metric, Stat::Min).map(scale),
                max: value(metric, Stat::Max).map(scale),
                sum: scale(sum),
                avg: scale(avg),
                format: if metric.is_memory() { "MiB" } else { "cores" }.to_string(),
            },
        },
    })
}

/// Analyzer metric list for one aggregated container row
pub fn container_metrics(row: &AggregatedRow) -> Vec<MetricEntry> {
    Metric::ALL
        .iter()
        .filter_map(|m| metric_entry(metric_name(*m).to_string(), *m, |m, s| row.value(m, s)))
        .collect()
}

fn namespace_metrics(totals: &NamespaceInterval) -> Vec<MetricEntry> {
    Metric::ALL
        .iter()
        .filter_map(|m| metric_entry(namespace_metric_name(*m), *m, |m, s| totals.value(m, s)))
        .collect()
}

/// One `updateResults` entry per interval of the group, chronologically
pub fn results_for_group(key: &ExperimentKey, group: &K8sObjectGroup) -> Vec<UpdateResult> {
    group
        .intervals()
        .into_iter()
        .map(|((start, end), rows)| {
            let containers = rows
                .iter()
                .map(|row| ContainerResult {
                    container_image_name: row.image_name.clone(),
                    container_name: row.container_name.clone(),
                    metrics: container_metrics(row),
                })
                .collect();
            UpdateResult {
                version: PAYLOAD_VERSION.to_string(),
                experiment_name: key.experiment_name(),
                interval_start_time: start,
                interval_end_time: end,
                kubernetes_objects: vec![ResultObject {
                    kind: Some(group.kind.as_str().to_string()),
                    name: Some(group.name.clone()),
                    namespace: Some(group.namespace.clone()),
                    containers: Some(containers),
                    namespaces: None,
                }],
            }
        })
        .collect()
}

/// One `updateResults` entry per namespace interval
pub fn results_for_namespace(key: &ExperimentKey, totals: &[NamespaceInterval]) -> Vec<UpdateResult> {
    totals
        .iter()
        .filter(|t| t.namespace == key.namespace)
        .map(|t| UpdateResult {
            version: PAYLOAD_VERSION.to_string(),
            experiment_name: key.experiment_name(),
            interval_start_time: t.interval_start,
            interval_end_time: t.interval_end,
            kubernetes_objects: vec![ResultObject {
                kind: None,
                name: None,
                namespace: None,
                containers: None,
                namespaces: Some(NamespaceResult {
                    namespace: t.namespace.clone(),
                    metrics: namespace_metrics(t),
                }),
            }],
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::WorkloadKind;
    use crate::report::{metric_index, METRIC_COUNT};
    use chrono::TimeZone;

    fn row(container: &str) -> AggregatedRow {
        let mut metrics = [Some(1.0); METRIC_COUNT];
        metrics[metric_index(Metric::MemoryUsage, Stat::Avg).unwrap()] = Some(512.0 * BYTES_PER_MIB);
        metrics[metric_index(Metric::CpuLimit, Stat::Sum).unwrap()] = None;
        AggregatedRow {
            namespace: "acme".into(),
            kind: WorkloadKind::Deployment,
            name: "api".into(),
            workload: "api".into(),
            container_name: container.into(),
            image_name: format!("quay.io/acme/{container}:1"),
            interval_start: Utc.with_ymd_and_hms(2023, 2, 1, 0, 0, 0).unwrap(),
            interval_end: Utc.with_ymd_and_hms(2023, 2, 1, 0, 15, 0).unwrap(),
            metrics,
        }
    }

    #[test]
    fn test_create_experiment_wire_format() {
        let key = ExperimentKey::new("o", "s", "c", "acme", WorkloadKind::Deployment, "api");
        let body = CreateExperiment::for_workload(
            &key,
            &[("web".into(), "img-web".into()), ("worker".into(), "img-worker".into())],
        );
        let json = serde_json::to_value(vec![body]).unwrap();

        assert_eq!(json[0]["experiment_name"], "o|s|c|acme|deployment|api");
        assert_eq!(json[0]["cluster_name"], "o;c");
        assert_eq!(json[0]["performance_profile"], "resource-optimization-openshift");
        assert_eq!(json[0]["mode"], "monitor");
        assert_eq!(json[0]["target_cluster"], "remote");
        assert_eq!(json[0]["version"], "v2.0");
        assert_eq!(json[0]["trial_settings"]["measurement_duration"], "15min");
        assert_eq!(json[0]["recommendation_settings"]["threshold"], "0.1");
        assert_eq!(json[0]["kubernetes_objects"][0]["type"], "deployment");
        assert_eq!(json[0]["kubernetes_objects"][0]["containers"][1]["container_name"], "worker");
        assert!(json[0].get("experiment_type").is_none());
    }

    #[test]
    fn test_namespace_experiment_wire_format() {
        let key = ExperimentKey::for_namespace("o", "s", "c", "acme");
        let json = serde_json::to_value(CreateExperiment::for_namespace(&key)).unwrap();

        assert_eq!(json["experiment_type"], "namespace");
        assert_eq!(json["kubernetes_objects"][0]["namespaces"]["namespace"], "acme");
        assert!(json["kubernetes_objects"][0].get("type").is_none());
    }

    #[test]
    fn test_container_metrics_units_and_presence() {
        let metrics = container_metrics(&row("web"));

        assert!(metrics.iter().all(|m| m.name != "cpuLimit"));
        let memory = metrics.iter().find(|m| m.name == "memoryUsage").unwrap();
        assert_eq!(memory.results.aggregation_info.avg, 512.0);
        assert_eq!(memory.results.aggregation_info.format, "MiB");

        let throttle = metrics.iter().find(|m| m.name == "cpuThrottle").unwrap();
        assert_eq!(throttle.results.aggregation_info.min, None);
        assert_eq!(throttle.results.aggregation_info.max, Some(1.0));
        assert_eq!(throttle.results.aggregation_info.format, "cores");
    }

    #[test]
    fn test_results_for_group_serializes_intervals() {
        let key = ExperimentKey::new("o", "s", "c", "acme", WorkloadKind::Deployment, "api");
        let group = K8sObjectGroup {
            namespace: "acme".into(),
            kind: WorkloadKind::Deployment,
            name: "api".into(),
            rows: vec![row("web"), row("worker")],
        };

        let results = results_for_group(&key, &group);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].containers().count(), 2);

        let json = serde_json::to_value(&results[0]).unwrap();
        assert_eq!(json["interval_start_time"], "2023-02-01T00:00:00.000Z");
        assert_eq!(json["interval_end_time"], "2023-02-01T00:15:00.000Z");
    }

    #[test]
    fn test_namespace_metric_names() {
        assert_eq!(namespace_metric_name(Metric::CpuUsage), "namespaceCpuUsage");
        assert_eq!(namespace_metric_name(Metric::MemoryRss), "namespaceMemoryRSS");
    }

    #[test]
    fn test_kruize_time_parse() {
        let ts = kruize_time::parse("2024-03-10T01:00:00.000Z").unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 3, 10, 1, 0, 0).unwrap());
        assert_eq!(kruize_time::format(&ts), "2024-03-10T01:00:00.000Z");
        assert!(kruize_time::parse("2024-03-10T01:00:00Z").is_some());
    }
}
