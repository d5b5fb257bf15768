//! Observability infrastructure for the pipeline processes
//!
//! Provides:
//! - Prometheus counters shared by every consumer and the read API
//! - Tracing subscriber initialization (JSON or text)

use crate::config::LogFormat;
use prometheus::{register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec};
use std::sync::OnceLock;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<PipelineMetricsInner> = OnceLock::new();

struct PipelineMetricsInner {
    invalid_csv: IntCounter,
    invalid_datapoints: IntCounter,
    db_errors: IntCounter,
    partition_missing: IntCounter,
    kruize_exceptions: IntCounterVec,
    experiments_created: IntCounter,
    recommendation_requests: IntCounterVec,
    recommendation_successes: IntCounterVec,
    invalid_recommendations: IntCounterVec,
    recommendation_notices: IntCounterVec,
    deferred_recommendations: IntCounter,
    messages_consumed: IntCounterVec,
    experiments_deleted: IntCounter,
    api_requests: IntCounterVec,
}

impl PipelineMetricsInner {
    fn new() -> Self {
        Self {
            invalid_csv: register_int_counter!(
                "rosocp_invalid_csv_total",
                "Number of uploaded CSV files rejected as unreadable or malformed"
            )
            .expect("Failed to register invalid_csv"),

            invalid_datapoints: register_int_counter!(
                "rosocp_invalid_datapoints_total",
                "Number of CSV rows dropped by the aggregator row filter"
            )
            .expect("Failed to register invalid_datapoints"),

            db_errors: register_int_counter!(
                "rosocp_db_error_total",
                "Number of failed database statements"
            )
            .expect("Failed to register db_errors"),

            partition_missing: register_int_counter!(
                "rosocp_partition_missing_total",
                "Number of inserts rejected because no partition covers the row"
            )
            .expect("Failed to register partition_missing"),

            kruize_exceptions: register_int_counter_vec!(
                "rosocp_kruize_api_exception_total",
                "Number of failed analyzer calls per endpoint",
                &["path"]
            )
            .expect("Failed to register kruize_exceptions"),

            experiments_created: register_int_counter!(
                "rosocp_create_experiment_total",
                "Number of experiments registered with the analyzer"
            )
            .expect("Failed to register experiments_created"),

            recommendation_requests: register_int_counter_vec!(
                "rosocp_recommendation_request_total",
                "Number of updateRecommendations calls",
                &["kind"]
            )
            .expect("Failed to register recommendation_requests"),

            recommendation_successes: register_int_counter_vec!(
                "rosocp_recommendation_success_total",
                "Number of recommendation sets persisted",
                &["kind"]
            )
            .expect("Failed to register recommendation_successes"),

            invalid_recommendations: register_int_counter_vec!(
                "rosocp_invalid_recommendation_total",
                "Number of analyzer responses failing validation",
                &["kind"]
            )
            .expect("Failed to register invalid_recommendations"),

            recommendation_notices: register_int_counter_vec!(
                "rosocp_recommendation_notice_total",
                "Informational notice codes seen on recommendations",
                &["code"]
            )
            .expect("Failed to register recommendation_notices"),

            deferred_recommendations: register_int_counter!(
                "rosocp_deferred_recommendation_total",
                "Recommendation-due messages left uncommitted for a later retry"
            )
            .expect("Failed to register deferred_recommendations"),

            messages_consumed: register_int_counter_vec!(
                "rosocp_messages_consumed_total",
                "Messages read from the bus",
                &["topic"]
            )
            .expect("Failed to register messages_consumed"),

            experiments_deleted: register_int_counter!(
                "rosocp_experiments_deleted_total",
                "Experiments removed from the analyzer after a source was destroyed"
            )
            .expect("Failed to register experiments_deleted"),

            api_requests: register_int_counter_vec!(
                "rosocp_api_requests_total",
                "Read API requests by route and status",
                &["route", "status"]
            )
            .expect("Failed to register api_requests"),
        }
    }
}

/// Pipeline metrics for Prometheus exposition
///
/// A lightweight handle to the global metrics instance; clones share
/// the same underlying collectors.
#[derive(Clone)]
pub struct PipelineMetrics {
    _private: (),
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineMetrics {
    /// Create a new metrics handle (registers the collectors on first call)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(PipelineMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &PipelineMetricsInner {
        GLOBAL_METRICS.get_or_init(PipelineMetricsInner::new)
    }

    pub fn inc_invalid_csv(&self) {
        self.inner().invalid_csv.inc();
    }

    pub fn add_invalid_datapoints(&self, count: u64) {
        self.inner().invalid_datapoints.inc_by(count);
    }

    pub fn inc_db_errors(&self) {
        self.inner().db_errors.inc();
    }

    pub fn inc_partition_missing(&self) {
        self.inner().partition_missing.inc();
    }

    pub fn inc_kruize_exception(&self, path: &str) {
        self.inner().kruize_exceptions.with_label_values(&[path]).inc();
    }

    pub fn inc_experiments_created(&self) {
        self.inner().experiments_created.inc();
    }

    pub fn inc_recommendation_request(&self, kind: &str) {
        self.inner().recommendation_requests.with_label_values(&[kind]).inc();
    }

    pub fn inc_recommendation_success(&self, kind: &str) {
        self.inner().recommendation_successes.with_label_values(&[kind]).inc();
    }

    pub fn inc_invalid_recommendation(&self, kind: &str) {
        self.inner().invalid_recommendations.with_label_values(&[kind]).inc();
    }

    pub fn inc_recommendation_notice(&self, code: &str) {
        self.inner().recommendation_notices.with_label_values(&[code]).inc();
    }

    pub fn inc_deferred_recommendation(&self) {
        self.inner().deferred_recommendations.inc();
    }

    pub fn inc_messages_consumed(&self, topic: &str) {
        self.inner().messages_consumed.with_label_values(&[topic]).inc();
    }

    pub fn inc_experiments_deleted(&self) {
        self.inner().experiments_deleted.inc();
    }

    pub fn inc_api_request(&self, route: &str, status: u16) {
        self.inner()
            .api_requests
            .with_label_values(&[route, &status.to_string()])
            .inc();
    }

    /// Current value of the invalid-datapoints counter
    pub fn invalid_datapoints(&self) -> u64 {
        self.inner().invalid_datapoints.get()
    }

    /// Current value of the invalid-CSV counter
    pub fn invalid_csv(&self) -> u64 {
        self.inner().invalid_csv.get()
    }

    /// Current value of the database error counter
    pub fn db_errors(&self) -> u64 {
        self.inner().db_errors.get()
    }

    pub fn deferred_recommendations(&self) -> u64 {
        self.inner().deferred_recommendations.get()
    }

    pub fn experiments_deleted(&self) -> u64 {
        self.inner().experiments_deleted.get()
    }
}

/// Install the global tracing subscriber
///
/// `level` accepts anything `EnvFilter` understands (`info`, `rosocp_lib=debug`, ...);
/// `RUST_LOG` takes precedence when set.
pub fn init_tracing(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.to_lowercase()))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    let result = match format {
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
        LogFormat::Text => registry.with(fmt::layer()).try_init(),
    };
    if let Err(e) = result {
        eprintln!("tracing subscriber already installed: {e}");
    }
}
