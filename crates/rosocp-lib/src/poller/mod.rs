//! Recommendation poller
//!
//! Consumes recommendation-due announcements, asks the analyzer for fresh
//! recommendations once enough new data has accumulated, and stores the
//! valid ones. Anything a retry can fix leaves the offset uncommitted.

#[cfg(test)]
mod tests;

use crate::bus::{BusMessage, Disposition, MessageHandler};
use crate::kruize::recommendation::{
    namespace_summary, validate_containers, validate_namespace, InvalidRecommendation,
    RecommendedExperiment, ValidRecommendation,
};
use crate::kruize::{Analyzer, AnalyzerError};
use crate::models::{ExperimentType, RecommendationDue};
use crate::observability::PipelineMetrics;
use crate::storage::{NamespaceRecommendationRow, RecommendationRow, RecommendationStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Whether an announcement warrants a call to the analyzer
///
/// New workloads are always polled, as are workloads with nothing stored
/// yet. Otherwise the report must reach at least `delay` past the stored
/// monitoring end, or start a new month: a report ending on the 1st polls
/// right away when the stored recommendation is from an earlier day.
pub fn should_poll(
    new_record: bool,
    stored_end: Option<DateTime<Utc>>,
    max_end: DateTime<Utc>,
    delay: Duration,
) -> bool {
    if new_record {
        return true;
    }
    match stored_end {
        Some(stored) => max_end - stored >= delay || first_of_month_after(stored, max_end),
        None => true,
    }
}

fn first_of_month_after(stored: DateTime<Utc>, max_end: DateTime<Utc>) -> bool {
    max_end.day() == 1 && max_end.date_naive() > stored.date_naive()
}

pub struct RecommendationPoller {
    analyzer: Arc<dyn Analyzer>,
    store: Arc<dyn RecommendationStore>,
    fetch_delay: Duration,
    metrics: PipelineMetrics,
}

impl RecommendationPoller {
    pub fn new(
        analyzer: Arc<dyn Analyzer>,
        store: Arc<dyn RecommendationStore>,
        fetch_delay_hours: i64,
        metrics: PipelineMetrics,
    ) -> Self {
        Self {
            analyzer,
            store,
            fetch_delay: Duration::hours(fetch_delay_hours),
            metrics,
        }
    }

    fn store_failed(&self, err: &StoreError) {
        self.metrics.inc_db_errors();
        error!(error = %err, "Recommendation store failure");
    }

    async fn stored_end(&self, due: &RecommendationDue) -> Result<Option<DateTime<Utc>>, StoreError> {
        let workload_id = due.metadata.workload_id;
        match due.metadata.experiment_type {
            ExperimentType::Container => self.store.latest_container_monitoring_end(workload_id).await,
            ExperimentType::Namespace => self.store.latest_namespace_monitoring_end(workload_id).await,
        }
    }

    /// Handle one validated announcement
    pub async fn process(&self, due: &RecommendationDue) -> Disposition {
        let meta = &due.metadata;
        let kind = meta.experiment_type.as_str();

        match self.store.workload_exists(meta.workload_id).await {
            Ok(true) => {}
            Ok(false) => {
                info!(workload_id = meta.workload_id, "Workload no longer exists; skipping");
                return Disposition::Commit;
            }
            Err(e) => {
                self.store_failed(&e);
                return Disposition::Defer;
            }
        }

        let stored_end = match self.stored_end(due).await {
            Ok(end) => end,
            Err(e) => {
                self.store_failed(&e);
                return Disposition::Defer;
            }
        };
        if !should_poll(meta.new_record, stored_end, meta.max_endtime_report, self.fetch_delay) {
            self.metrics.inc_deferred_recommendation();
            debug!(
                max_end = %meta.max_endtime_report,
                stored_end = ?stored_end,
                "Too early to ask for a new recommendation"
            );
            return Disposition::Defer;
        }

        self.metrics.inc_recommendation_request(kind);
        let body = match self
            .analyzer
            .update_recommendations(&meta.experiment_name, meta.max_endtime_report)
            .await
        {
            Ok(body) => body,
            Err(AnalyzerError::RecommendationNotReady { .. }) => {
                info!("Recommendation not ready yet; will retry");
                return Disposition::Defer;
            }
            Err(e) => {
                warn!(error = %e, "Unable to update recommendations");
                return Disposition::Defer;
            }
        };

        let valid = match self.validate(meta.experiment_type, &body) {
            Ok(valid) => valid,
            Err(e) => {
                self.metrics.inc_invalid_recommendation(kind);
                warn!(reason = %e, "Invalid recommendation; skipping");
                return Disposition::Commit;
            }
        };
        for code in &valid.notices {
            self.metrics.inc_recommendation_notice(code);
        }

        let saved = match meta.experiment_type {
            ExperimentType::Container => {
                let rows = container_rows(meta.workload_id, &valid);
                self.store
                    .save_container_recommendations(&meta.org_id, &rows)
                    .await
            }
            ExperimentType::Namespace => {
                let rows = namespace_rows(meta.workload_id, &valid);
                self.store
                    .save_namespace_recommendations(&meta.org_id, &rows)
                    .await
            }
        };
        if let Err(e) = saved {
            self.store_failed(&e);
            return Disposition::Defer;
        }

        self.metrics.inc_recommendation_success(kind);
        info!(items = valid.items.len(), "Recommendations stored");
        Disposition::Commit
    }

    fn validate(
        &self,
        experiment_type: ExperimentType,
        body: &[RecommendedExperiment],
    ) -> Result<ValidRecommendation, InvalidRecommendation> {
        match experiment_type {
            ExperimentType::Container => validate_containers(body),
            ExperimentType::Namespace => validate_namespace(body),
        }
    }
}

fn container_rows(workload_id: i64, valid: &ValidRecommendation) -> Vec<RecommendationRow> {
    valid
        .items
        .iter()
        .map(|item| RecommendationRow {
            workload_id,
            container_name: item.target.clone(),
            monitoring_start: item.monitoring_start,
            monitoring_end: item.monitoring_end,
            recommendations: item.datum.clone(),
        })
        .collect()
}

fn namespace_rows(workload_id: i64, valid: &ValidRecommendation) -> Vec<NamespaceRecommendationRow> {
    valid
        .items
        .iter()
        .map(|item| {
            let summary = namespace_summary(&item.datum);
            NamespaceRecommendationRow {
                workload_id,
                namespace_name: item.target.clone(),
                cpu_request_current: summary.cpu_request_current,
                cpu_variation: summary.cpu_variation,
                memory_request_current: summary.memory_request_current,
                memory_variation: summary.memory_variation,
                monitoring_start: item.monitoring_start,
                monitoring_end: item.monitoring_end,
                recommendations: item.datum.clone(),
            }
        })
        .collect()
}

#[async_trait]
impl MessageHandler for RecommendationPoller {
    async fn handle(&self, message: &BusMessage) -> Disposition {
        let due: RecommendationDue = match serde_json::from_slice(&message.payload) {
            Ok(due) => due,
            Err(e) => {
                warn!(offset = message.offset, error = %e, "Skipping undecodable recommendation request");
                return Disposition::Commit;
            }
        };
        if let Err(e) = due.validate() {
            warn!(request_id = %due.request_id, error = %e, "Skipping invalid recommendation request");
            return Disposition::Commit;
        }

        let span = info_span!(
            "recommendation",
            request_id = %due.request_id,
            org_id = %due.metadata.org_id,
            experiment = %due.metadata.experiment_name
        );
        self.process(&due).instrument(span).await
    }
}
