//! Row filtering, workload kind inference and per-container aggregation
//!
//! Rows are grouped by (namespace, kind, name, workload, container, image,
//! interval) and each metric column is reduced according to its suffix.
//! Values are sorted before reduction so the result does not depend on
//! input row order.

use super::{
    CsvReport, Metric, MetricValues, ReportError, ReportRow, Stat, METRIC_COLUMNS, METRIC_COUNT,
};
use crate::models::WorkloadKind;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};

const NONE_MARKER: &str = "<none>";

/// Aggregated measurements of one container over one interval
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedRow {
    pub namespace: String,
    pub kind: WorkloadKind,
    pub name: String,
    pub workload: String,
    pub container_name: String,
    pub image_name: String,
    pub interval_start: DateTime<Utc>,
    pub interval_end: DateTime<Utc>,
    pub metrics: MetricValues,
}

impl AggregatedRow {
    pub fn value(&self, metric: Metric, stat: Stat) -> Option<f64> {
        super::metric_index(metric, stat).and_then(|i| self.metrics[i])
    }
}

/// All aggregated rows of one Kubernetes object
#[derive(Debug, Clone, PartialEq)]
pub struct K8sObjectGroup {
    pub namespace: String,
    pub kind: WorkloadKind,
    pub name: String,
    pub rows: Vec<AggregatedRow>,
}

impl K8sObjectGroup {
    /// Latest interval end across the group
    pub fn max_interval_end(&self) -> Option<DateTime<Utc>> {
        self.rows.iter().map(|r| r.interval_end).max()
    }

    /// Distinct container names, sorted
    pub fn containers(&self) -> Vec<String> {
        self.rows
            .iter()
            .map(|r| r.container_name.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Distinct (container, image) pairs, sorted by container
    pub fn container_images(&self) -> Vec<(String, String)> {
        self.rows
            .iter()
            .map(|r| (r.container_name.clone(), r.image_name.clone()))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Rows bucketed by interval, in chronological order
    pub fn intervals(&self) -> BTreeMap<(DateTime<Utc>, DateTime<Utc>), Vec<&AggregatedRow>> {
        let mut out: BTreeMap<_, Vec<&AggregatedRow>> = BTreeMap::new();
        for row in &self.rows {
            out.entry((row.interval_start, row.interval_end))
                .or_default()
                .push(row);
        }
        out
    }
}

/// Namespace totals of one interval across containers
#[derive(Debug, Clone, PartialEq)]
pub struct NamespaceInterval {
    pub namespace: String,
    pub interval_start: DateTime<Utc>,
    pub interval_end: DateTime<Utc>,
    pub metrics: MetricValues,
}

impl NamespaceInterval {
    pub fn value(&self, metric: Metric, stat: Stat) -> Option<f64> {
        super::metric_index(metric, stat).and_then(|i| self.metrics[i])
    }
}

/// Output of [`aggregate`]
#[derive(Debug, Clone)]
pub struct Aggregation {
    pub groups: Vec<K8sObjectGroup>,
    /// Rows dropped by the validity filter
    pub invalid_datapoints: usize,
}

impl Aggregation {
    /// Per-namespace, per-interval totals over every kept container.
    ///
    /// Sums add up, averages are the mean of container averages and
    /// min/max keep the extreme container value.
    pub fn namespace_totals(&self) -> Vec<NamespaceInterval> {
        let mut buckets: BTreeMap<(String, DateTime<Utc>, DateTime<Utc>), Vec<Vec<f64>>> =
            BTreeMap::new();
        for row in self.groups.iter().flat_map(|g| g.rows.iter()) {
            let slots = buckets
                .entry((row.namespace.clone(), row.interval_start, row.interval_end))
                .or_insert_with(|| vec![Vec::new(); METRIC_COUNT]);
            for (slot, value) in slots.iter_mut().zip(row.metrics.iter()) {
                if let Some(v) = value {
                    slot.push(*v);
                }
            }
        }

        buckets
            .into_iter()
            .map(|((namespace, interval_start, interval_end), slots)| {
                let mut metrics: MetricValues = [None; METRIC_COUNT];
                for ((out, column), mut values) in
                    metrics.iter_mut().zip(METRIC_COLUMNS.iter()).zip(slots)
                {
                    *out = reduce(&mut values, column.stat);
                }
                NamespaceInterval {
                    namespace,
                    interval_start,
                    interval_end,
                    metrics,
                }
            })
            .collect()
    }

    /// Distinct namespaces with at least one kept row
    pub fn namespaces(&self) -> Vec<String> {
        self.groups
            .iter()
            .map(|g| g.namespace.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

fn is_blank(value: &str) -> bool {
    value.is_empty() || value == NONE_MARKER
}

/// Row filter: owner and workload type must be set and every usage column
/// must hold a non-negative number
fn is_valid(row: &ReportRow) -> bool {
    if is_blank(&row.owner_kind) || is_blank(&row.owner_name) || is_blank(&row.workload_type) {
        return false;
    }
    if row.interval_start.is_none() || row.interval_end.is_none() {
        return false;
    }
    METRIC_COLUMNS
        .iter()
        .zip(row.metrics.iter())
        .filter(|(c, _)| c.metric.is_usage())
        .all(|(_, v)| matches!(v, Some(x) if *x >= 0.0))
}

/// Rebuild the object a row belongs to
///
/// Bare replica sets and replication controllers (no owning workload) are
/// experiments of their own; everything else is keyed by its workload.
fn infer_object(row: &ReportRow, workload_type: WorkloadKind) -> (WorkloadKind, String) {
    let owner_kind = row.owner_kind.to_lowercase();
    if is_blank(&row.workload) {
        if owner_kind == "replicaset" {
            return (WorkloadKind::ReplicaSet, row.owner_name.clone());
        }
        if owner_kind == "replicationcontroller" {
            return (WorkloadKind::ReplicationController, row.owner_name.clone());
        }
    }
    (workload_type, row.workload.clone())
}

type GroupKey = (
    String,
    WorkloadKind,
    String,
    String,
    String,
    String,
    DateTime<Utc>,
    DateTime<Utc>,
);

/// Validate, filter and aggregate a report
pub fn aggregate(report: &CsvReport) -> Result<Aggregation, ReportError> {
    let rows = report.typed_rows()?;

    let mut invalid_datapoints = 0usize;
    let mut buckets: BTreeMap<GroupKey, Vec<Vec<f64>>> = BTreeMap::new();

    for row in &rows {
        if !is_valid(row) {
            invalid_datapoints += 1;
            continue;
        }
        let Some(workload_type) = WorkloadKind::from_reported(&row.workload_type) else {
            continue;
        };
        let (Some(start), Some(end)) = (row.interval_start, row.interval_end) else {
            continue;
        };
        let (kind, name) = infer_object(row, workload_type);

        let key = (
            row.namespace.clone(),
            kind,
            name,
            row.workload.clone(),
            row.container_name.clone(),
            row.image_name.clone(),
            start,
            end,
        );
        let slots = buckets
            .entry(key)
            .or_insert_with(|| vec![Vec::new(); METRIC_COUNT]);
        for (slot, value) in slots.iter_mut().zip(row.metrics.iter()) {
            if let Some(v) = value {
                slot.push(*v);
            }
        }
    }

    if buckets.is_empty() {
        return Err(ReportError::EmptyAfterFilter);
    }

    let mut groups: Vec<K8sObjectGroup> = Vec::new();
    for (key, slots) in buckets {
        let (namespace, kind, name, workload, container_name, image_name, start, end) = key;

        let mut metrics: MetricValues = [None; METRIC_COUNT];
        for ((out, column), mut values) in metrics.iter_mut().zip(METRIC_COLUMNS.iter()).zip(slots) {
            *out = reduce(&mut values, column.stat);
        }

        let row = AggregatedRow {
            namespace: namespace.clone(),
            kind,
            name: name.clone(),
            workload,
            container_name,
            image_name,
            interval_start: start,
            interval_end: end,
            metrics,
        };

        // BTreeMap order keeps rows of one object contiguous
        match groups.last_mut() {
            Some(g) if g.namespace == namespace && g.kind == kind && g.name == name => {
                g.rows.push(row)
            }
            _ => groups.push(K8sObjectGroup {
                namespace,
                kind,
                name,
                rows: vec![row],
            }),
        }
    }

    Ok(Aggregation {
        groups,
        invalid_datapoints,
    })
}

fn reduce(values: &mut [f64], stat: Stat) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let sum: f64 = values.iter().sum();
    Some(match stat {
        Stat::Sum => sum,
        Stat::Avg => sum / values.len() as f64,
        Stat::Min => values[0],
        Stat::Max => values[values.len() - 1],
    })
}
