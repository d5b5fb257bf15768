//! Ingest processor
//!
//! Consumes upload announcements. Each report is downloaded, aggregated
//! into per-workload groups and pushed to the analyzer; every group that
//! reaches the analyzer is persisted and announced on the recommendation
//! topic. Failures are contained per group, so one bad workload never
//! holds back the rest of an upload.


use crate::bus::{publish_json, BusMessage, Disposition, MessageHandler, Publisher};
use crate::experiment::ExperimentKey;
use crate::featureflags::NamespaceGate;
use crate::kruize::payload::{results_for_group, results_for_namespace};
use crate::kruize::{Analyzer, AnalyzerError, CreateExperiment, Interval, UpdateResult};
use crate::models::{
    ExperimentType, IngestMessage, RecommendationDue, RecommendationDueMetadata, WorkloadKind,
};
use crate::observability::PipelineMetrics;
use crate::report::{aggregate, Aggregation, K8sObjectGroup, ReportSource};
use crate::storage::{IngestStore, NewCluster, NewWorkload, StoreError, WorkloadMetricsRow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Identity of the upload being processed
#[derive(Debug, Clone)]
struct Upload {
    request_id: String,
    org_id: String,
    source_id: String,
    cluster_uuid: String,
}

impl Upload {
    fn key(&self, namespace: &str, kind: WorkloadKind, name: &str) -> ExperimentKey {
        ExperimentKey::new(
            self.org_id.as_str(),
            self.source_id.as_str(),
            self.cluster_uuid.as_str(),
            namespace,
            kind,
            name,
        )
    }
}

/// A workload that reached the analyzer and the database
#[derive(Debug, Clone, PartialEq)]
pub struct GroupOutcome {
    pub experiment_name: String,
    pub workload_id: i64,
    pub acknowledged: usize,
}

pub struct IngestProcessor {
    reports: Arc<dyn ReportSource>,
    analyzer: Arc<dyn Analyzer>,
    store: Arc<dyn IngestStore>,
    publisher: Arc<dyn Publisher>,
    namespace_gate: NamespaceGate,
    recommendation_topic: String,
    metrics: PipelineMetrics,
}

impl IngestProcessor {
    pub fn new(
        reports: Arc<dyn ReportSource>,
        analyzer: Arc<dyn Analyzer>,
        store: Arc<dyn IngestStore>,
        publisher: Arc<dyn Publisher>,
        namespace_gate: NamespaceGate,
        recommendation_topic: impl Into<String>,
        metrics: PipelineMetrics,
    ) -> Self {
        Self {
            reports,
            analyzer,
            store,
            publisher,
            namespace_gate,
            recommendation_topic: recommendation_topic.into(),
            metrics,
        }
    }

    fn store_failed(&self, what: &str, err: &StoreError) {
        match err {
            StoreError::NoPartition { table, at } => {
                self.metrics.inc_partition_missing();
                error!(table, at = %at, "No partition for {what}");
            }
            StoreError::Database(e) => {
                self.metrics.inc_db_errors();
                error!(error = %e, "Unable to save {what}");
            }
        }
    }

    /// Process one decoded and validated upload
    pub async fn process(&self, message: &IngestMessage) -> Disposition {
        let meta = &message.metadata;
        let account = Some(meta.account.as_str()).filter(|a| !a.is_empty());

        let tenant_id = match self.store.upsert_tenant(&meta.org_id, account).await {
            Ok(id) => id,
            Err(e) => {
                self.store_failed("tenant", &e);
                return Disposition::Defer;
            }
        };
        let cluster = NewCluster {
            tenant_id,
            source_id: meta.source_id.clone(),
            cluster_uuid: meta.cluster_uuid.clone(),
            cluster_alias: meta.cluster_alias.clone(),
            last_reported_at: Utc::now(),
        };
        let cluster_id = match self.store.upsert_cluster(&cluster).await {
            Ok(id) => id,
            Err(e) => {
                self.store_failed("cluster", &e);
                return Disposition::Defer;
            }
        };

        let upload = Upload {
            request_id: message.request_id.clone(),
            org_id: meta.org_id.clone(),
            source_id: meta.source_id.clone(),
            cluster_uuid: meta.cluster_uuid.clone(),
        };
        let namespaces_enabled = self.namespace_gate.is_enabled(&meta.org_id).await;

        for url in &message.files {
            let report = match self.reports.load(url).await {
                Ok(report) => report,
                Err(e) => {
                    self.metrics.inc_invalid_csv();
                    error!(url = %url, error = %e, "Unable to load report; skipping upload");
                    return Disposition::Commit;
                }
            };
            let aggregation = match aggregate(&report) {
                Ok(aggregation) => aggregation,
                Err(e) => {
                    if e.is_invalid_csv() {
                        self.metrics.inc_invalid_csv();
                    }
                    warn!(url = %url, error = %e, "Report has no usable rows");
                    continue;
                }
            };
            if aggregation.invalid_datapoints > 0 {
                self.metrics
                    .add_invalid_datapoints(aggregation.invalid_datapoints as u64);
                debug!(url = %url, dropped = aggregation.invalid_datapoints, "Dropped invalid rows");
            }

            let mut processed = 0usize;
            for group in &aggregation.groups {
                if self.process_group(&upload, cluster_id, group).await.is_some() {
                    processed += 1;
                }
            }
            if namespaces_enabled {
                self.process_namespaces(&upload, cluster_id, &aggregation).await;
            }
            info!(
                url = %url,
                groups = aggregation.groups.len(),
                processed,
                "Report processed"
            );
        }

        Disposition::Commit
    }

    async fn register(&self, experiment: &CreateExperiment) -> bool {
        match self.analyzer.create_experiment(experiment).await {
            Ok(()) => true,
            Err(e) => {
                warn!(experiment = %experiment.experiment_name, error = %e, "Unable to create experiment");
                false
            }
        }
    }

    async fn push_results(
        &self,
        experiment_name: &str,
        results: &[UpdateResult],
    ) -> Option<HashSet<Interval>> {
        match self.analyzer.update_results(results).await {
            Ok(acked) => Some(acked.into_iter().collect()),
            Err(AnalyzerError::ExperimentMissing(_)) => {
                warn!(experiment = %experiment_name, "Experiment vanished before results were sent");
                None
            }
            Err(e) => {
                warn!(experiment = %experiment_name, error = %e, "Unable to send results");
                Some(HashSet::new())
            }
        }
    }

    async fn announce(
        &self,
        upload: &Upload,
        experiment_name: &str,
        workload_id: i64,
        max_end: DateTime<Utc>,
        new_record: bool,
        experiment_type: ExperimentType,
    ) {
        let due = RecommendationDue {
            request_id: upload.request_id.clone(),
            metadata: RecommendationDueMetadata {
                org_id: upload.org_id.clone(),
                workload_id,
                experiment_name: experiment_name.to_string(),
                max_endtime_report: max_end,
                new_record,
                experiment_type,
            },
        };
        if let Err(e) = publish_json(
            self.publisher.as_ref(),
            &self.recommendation_topic,
            experiment_name,
            &due,
        )
        .await
        {
            error!(experiment = %experiment_name, error = %e, "Unable to publish recommendation request");
        }
    }

    /// Push one workload through the analyzer and persist it
    async fn process_group(
        &self,
        upload: &Upload,
        cluster_id: i64,
        group: &K8sObjectGroup,
    ) -> Option<GroupOutcome> {
        let max_end = group.max_interval_end()?;
        let key = upload.key(&group.namespace, group.kind, &group.name);
        let experiment_name = key.experiment_name();

        let experiment = CreateExperiment::for_workload(&key, &group.container_images());
        if !self.register(&experiment).await {
            return None;
        }

        let workload = NewWorkload {
            org_id: upload.org_id.clone(),
            cluster_id,
            experiment_name: experiment_name.clone(),
            namespace: group.namespace.clone(),
            workload_type: group.kind,
            workload_name: group.name.clone(),
            containers: group.containers(),
            metrics_upload_at: max_end,
        };
        let record = match self.store.upsert_workload(&workload).await {
            Ok(record) => record,
            Err(e) => {
                self.store_failed("workload", &e);
                return None;
            }
        };

        let results = results_for_group(&key, group);
        let acked = self.push_results(&experiment_name, &results).await?;

        let rows: Vec<WorkloadMetricsRow> = results
            .iter()
            .filter(|r| acked.contains(&r.interval()))
            .flat_map(|r| {
                r.containers().map(|c| WorkloadMetricsRow {
                    org_id: upload.org_id.clone(),
                    workload_id: record.id,
                    container_name: c.container_name.clone(),
                    interval_start: r.interval_start_time,
                    interval_end: r.interval_end_time,
                    usage_metrics: serde_json::to_value(&c.metrics).unwrap_or_default(),
                })
            })
            .collect();
        if !rows.is_empty() {
            if let Err(e) = self.store.insert_workload_metrics(&rows).await {
                self.store_failed("workload metrics", &e);
            }
        }

        self.announce(
            upload,
            &experiment_name,
            record.id,
            max_end,
            record.inserted,
            ExperimentType::Container,
        )
        .await;

        debug!(experiment = %experiment_name, intervals = acked.len(), "Workload processed");
        Some(GroupOutcome {
            experiment_name,
            workload_id: record.id,
            acknowledged: acked.len(),
        })
    }

    /// One namespace experiment per namespace of the report
    async fn process_namespaces(&self, upload: &Upload, cluster_id: i64, aggregation: &Aggregation) {
        let totals = aggregation.namespace_totals();
        for namespace in aggregation.namespaces() {
            let key = ExperimentKey::for_namespace(
                upload.org_id.as_str(),
                upload.source_id.as_str(),
                upload.cluster_uuid.as_str(),
                namespace.as_str(),
            );
            let results = results_for_namespace(&key, &totals);
            let Some(max_end) = results.iter().map(|r| r.interval_end_time).max() else {
                continue;
            };
            let experiment_name = key.experiment_name();

            if !self.register(&CreateExperiment::for_namespace(&key)).await {
                continue;
            }
            let workload = NewWorkload {
                org_id: upload.org_id.clone(),
                cluster_id,
                experiment_name: experiment_name.clone(),
                namespace: namespace.clone(),
                workload_type: WorkloadKind::Namespace,
                workload_name: namespace.clone(),
                containers: Vec::new(),
                metrics_upload_at: max_end,
            };
            let record = match self.store.upsert_workload(&workload).await {
                Ok(record) => record,
                Err(e) => {
                    self.store_failed("namespace workload", &e);
                    continue;
                }
            };
            if self.push_results(&experiment_name, &results).await.is_none() {
                continue;
            }
            self.announce(
                upload,
                &experiment_name,
                record.id,
                max_end,
                record.inserted,
                ExperimentType::Namespace,
            )
            .await;
        }
    }
}

#[async_trait]
impl MessageHandler for IngestProcessor {
    async fn handle(&self, message: &BusMessage) -> Disposition {
        let upload: IngestMessage = match serde_json::from_slice(&message.payload) {
            Ok(upload) => upload,
            Err(e) => {
                warn!(offset = message.offset, error = %e, "Skipping undecodable upload message");
                return Disposition::Commit;
            }
        };
        if let Err(e) = upload.validate() {
            warn!(request_id = %upload.request_id, error = %e, "Skipping invalid upload message");
            return Disposition::Commit;
        }

        let span = info_span!(
            "ingest",
            request_id = %upload.request_id,
            org_id = %upload.metadata.org_id
        );
        self.process(&upload).instrument(span).await
    }
}
