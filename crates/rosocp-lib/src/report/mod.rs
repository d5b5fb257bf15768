//! Usage reports uploaded by clusters
//!
//! A report is a CSV with one row per (pod, container, interval). This
//! module fetches and parses reports ([`loader`]) and turns them into
//! per-workload aggregates ready for the analyzer ([`aggregator`]).

pub mod aggregator;
pub mod loader;


pub use aggregator::{aggregate, AggregatedRow, Aggregation, K8sObjectGroup, NamespaceInterval};
pub use loader::{CsvReport, HttpReportSource, ReportRow, ReportSource};

use thiserror::Error;

/// Errors raised while loading or aggregating a report
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to fetch report {url}: {message}")]
    Fetch { url: String, message: String },

    #[error("report {url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("malformed CSV: {0}")]
    Malformed(String),

    #[error("report is missing required columns: {}", missing.join(", "))]
    SchemaMismatch { missing: Vec<String> },

    #[error("no valid rows left after filtering")]
    EmptyAfterFilter,
}

impl ReportError {
    /// Whether the file itself is unusable (counted as an invalid CSV)
    pub fn is_invalid_csv(&self) -> bool {
        matches!(self, ReportError::Malformed(_) | ReportError::SchemaMismatch { .. })
    }
}

/// Non-metric columns, in report order
pub const IDENTITY_COLUMNS: [&str; 14] = [
    "report_period_start",
    "report_period_end",
    "interval_start",
    "interval_end",
    "container_name",
    "pod",
    "owner_name",
    "owner_kind",
    "workload",
    "workload_type",
    "namespace",
    "image_name",
    "node",
    "resource_id",
];

/// Resource measured by a metric column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    CpuRequest,
    CpuLimit,
    CpuUsage,
    CpuThrottle,
    MemoryRequest,
    MemoryLimit,
    MemoryUsage,
    MemoryRss,
}

impl Metric {
    pub const ALL: [Metric; 8] = [
        Metric::CpuRequest,
        Metric::CpuLimit,
        Metric::CpuUsage,
        Metric::CpuThrottle,
        Metric::MemoryRequest,
        Metric::MemoryLimit,
        Metric::MemoryUsage,
        Metric::MemoryRss,
    ];

    /// Usage metrics must be present and non-negative on every kept row
    pub fn is_usage(&self) -> bool {
        matches!(self, Metric::CpuUsage | Metric::MemoryUsage | Metric::MemoryRss)
    }

    pub fn is_memory(&self) -> bool {
        matches!(
            self,
            Metric::MemoryRequest | Metric::MemoryLimit | Metric::MemoryUsage | Metric::MemoryRss
        )
    }
}

/// Aggregation applied to a metric column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stat {
    Avg,
    Min,
    Max,
    Sum,
}

#[derive(Debug, Clone, Copy)]
pub struct MetricColumn {
    pub name: &'static str,
    pub metric: Metric,
    pub stat: Stat,
}

const fn col(name: &'static str, metric: Metric, stat: Stat) -> MetricColumn {
    MetricColumn { name, metric, stat }
}

pub const METRIC_COUNT: usize = 23;

/// Metric columns, in report order
pub const METRIC_COLUMNS: [MetricColumn; METRIC_COUNT] = [
    col("cpu_request_container_avg", Metric::CpuRequest, Stat::Avg),
    col("cpu_request_container_sum", Metric::CpuRequest, Stat::Sum),
    col("cpu_limit_container_avg", Metric::CpuLimit, Stat::Avg),
    col("cpu_limit_container_sum", Metric::CpuLimit, Stat::Sum),
    col("cpu_usage_container_avg", Metric::CpuUsage, Stat::Avg),
    col("cpu_usage_container_min", Metric::CpuUsage, Stat::Min),
    col("cpu_usage_container_max", Metric::CpuUsage, Stat::Max),
    col("cpu_usage_container_sum", Metric::CpuUsage, Stat::Sum),
    col("cpu_throttle_container_avg", Metric::CpuThrottle, Stat::Avg),
    col("cpu_throttle_container_max", Metric::CpuThrottle, Stat::Max),
    col("cpu_throttle_container_sum", Metric::CpuThrottle, Stat::Sum),
    col("memory_request_container_avg", Metric::MemoryRequest, Stat::Avg),
    col("memory_request_container_sum", Metric::MemoryRequest, Stat::Sum),
    col("memory_limit_container_avg", Metric::MemoryLimit, Stat::Avg),
    col("memory_limit_container_sum", Metric::MemoryLimit, Stat::Sum),
    col("memory_usage_container_avg", Metric::MemoryUsage, Stat::Avg),
    col("memory_usage_container_min", Metric::MemoryUsage, Stat::Min),
    col("memory_usage_container_max", Metric::MemoryUsage, Stat::Max),
    col("memory_usage_container_sum", Metric::MemoryUsage, Stat::Sum),
    col("memory_rss_usage_container_avg", Metric::MemoryRss, Stat::Avg),
    col("memory_rss_usage_container_min", Metric::MemoryRss, Stat::Min),
    col("memory_rss_usage_container_max", Metric::MemoryRss, Stat::Max),
    col("memory_rss_usage_container_sum", Metric::MemoryRss, Stat::Sum),
];

/// One value slot per entry of [`METRIC_COLUMNS`]
pub type MetricValues = [Option<f64>; METRIC_COUNT];

/// Position of a (metric, stat) pair in [`METRIC_COLUMNS`]
pub fn metric_index(metric: Metric, stat: Stat) -> Option<usize> {
    METRIC_COLUMNS
        .iter()
        .position(|c| c.metric == metric && c.stat == stat)
}

/// Every column a report must carry
pub fn required_columns() -> impl Iterator<Item = &'static str> {
    IDENTITY_COLUMNS
        .into_iter()
        .chain(METRIC_COLUMNS.iter().map(|c| c.name))
}
