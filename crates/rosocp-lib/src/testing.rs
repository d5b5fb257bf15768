//! In-memory doubles shared by component tests

use crate::bus::{BusError, Publisher};
use crate::kruize::{Analyzer, AnalyzerError, CreateExperiment, Interval, RecommendedExperiment, UpdateResult};
use crate::report::{CsvReport, ReportError, ReportSource};
use crate::storage::{
    ClusterRecord, ClusterStore, IngestStore, NamespaceRecommendationRecord, NamespaceRecommendationRow,
    NewCluster, NewWorkload, PartitionStore, RecommendationReader, RecommendationRecord, RecommendationRow,
    RecommendationStore, SelectQuery, StoreError, WorkloadMetricsRow, WorkloadRecord, WorkloadRef,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

/// Serves fixed CSV bodies by URL
#[derive(Default)]
pub(crate) struct StaticReports {
    bodies: HashMap<String, String>,
}

impl StaticReports {
    pub(crate) fn with(mut self, url: &str, body: String) -> Self {
        self.bodies.insert(url.to_string(), body);
        self
    }
}

#[async_trait]
impl ReportSource for StaticReports {
    async fn load(&self, url: &str) -> Result<CsvReport, ReportError> {
        match self.bodies.get(url) {
            Some(body) => CsvReport::parse(body.as_bytes()),
            None => Err(ReportError::Status {
                url: url.to_string(),
                status: 404,
            }),
        }
    }
}

#[derive(Default)]
pub(crate) struct MockAnalyzer {
    pub created: Mutex<Vec<CreateExperiment>>,
    pub results: Mutex<Vec<UpdateResult>>,
    pub recommendation_calls: Mutex<Vec<(String, DateTime<Utc>)>>,
    pub deleted: Mutex<Vec<String>>,
    /// Experiments whose creation fails
    pub reject_create: HashSet<String>,
    /// Experiments the analyzer claims not to know
    pub missing: HashSet<String>,
    /// Experiments whose results cannot be delivered
    pub unreachable_results: HashSet<String>,
    pub fail_delete: bool,
    /// Queued `update_recommendations` answers; empty means not ready
    pub responses: Mutex<VecDeque<Result<Vec<RecommendedExperiment>, AnalyzerError>>>,
}

impl MockAnalyzer {
    pub(crate) fn respond(&self, response: Result<Vec<RecommendedExperiment>, AnalyzerError>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub(crate) fn created_names(&self) -> Vec<String> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.experiment_name.clone())
            .collect()
    }
}

#[async_trait]
impl Analyzer for MockAnalyzer {
    async fn bootstrap_profile(&self) -> Result<(), AnalyzerError> {
        Ok(())
    }

    async fn create_experiment(&self, experiment: &CreateExperiment) -> Result<(), AnalyzerError> {
        self.created.lock().unwrap().push(experiment.clone());
        if self.reject_create.contains(&experiment.experiment_name) {
            return Err(AnalyzerError::Rejected {
                path: "createExperiment".into(),
                status: 400,
                message: "rejected".into(),
            });
        }
        Ok(())
    }

    async fn update_results(&self, results: &[UpdateResult]) -> Result<Vec<Interval>, AnalyzerError> {
        if let Some(first) = results.first() {
            if self.missing.contains(&first.experiment_name) {
                return Err(AnalyzerError::ExperimentMissing(first.experiment_name.clone()));
            }
            if self.unreachable_results.contains(&first.experiment_name) {
                return Err(AnalyzerError::Transport {
                    path: "updateResults".into(),
                    message: "connection reset".into(),
                });
            }
        }
        self.results.lock().unwrap().extend(results.iter().cloned());
        Ok(results.iter().map(UpdateResult::interval).collect())
    }

    async fn update_recommendations(
        &self,
        experiment_name: &str,
        end: DateTime<Utc>,
    ) -> Result<Vec<RecommendedExperiment>, AnalyzerError> {
        self.recommendation_calls
            .lock()
            .unwrap()
            .push((experiment_name.to_string(), end));
        self.responses.lock().unwrap().pop_front().unwrap_or_else(|| {
            Err(AnalyzerError::RecommendationNotReady {
                experiment: experiment_name.to_string(),
                end,
            })
        })
    }

    async fn list_recommendations(
        &self,
        experiment_name: &str,
        end: DateTime<Utc>,
    ) -> Result<Vec<RecommendedExperiment>, AnalyzerError> {
        self.update_recommendations(experiment_name, end).await
    }

    async fn delete_experiment(&self, experiment_name: &str) -> Result<(), AnalyzerError> {
        self.deleted.lock().unwrap().push(experiment_name.to_string());
        if self.fail_delete {
            return Err(AnalyzerError::Transport {
                path: "deleteExperiment".into(),
                message: "connection refused".into(),
            });
        }
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct MockPublisher {
    pub sent: Mutex<Vec<(String, String, Vec<u8>)>>,
}

impl MockPublisher {
    pub(crate) fn decoded<T: serde::de::DeserializeOwned>(&self) -> Vec<(String, T)> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, key, payload)| (key.clone(), serde_json::from_slice(payload).unwrap()))
            .collect()
    }
}

#[async_trait]
impl Publisher for MockPublisher {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), BusError> {
        self.sent
            .lock()
            .unwrap()
            .push((topic.to_string(), key.to_string(), payload.to_vec()));
        Ok(())
    }
}

#[derive(Debug, Default)]
pub(crate) struct StoreState {
    pub tenants: HashMap<String, i64>,
    pub clusters: Vec<(i64, NewCluster)>,
    pub workloads: Vec<(i64, NewWorkload)>,
    pub metrics: Vec<WorkloadMetricsRow>,
    pub recommendations: HashMap<(i64, String), RecommendationRow>,
    pub history: Vec<(String, RecommendationRow)>,
    pub namespace_recommendations: HashMap<i64, NamespaceRecommendationRow>,
    pub namespace_history: Vec<(String, NamespaceRecommendationRow)>,
    pub dropped_partitions: Vec<NaiveDate>,
    pub created_partitions: Vec<(NaiveDate, i32)>,
    pub container_page: Vec<RecommendationRecord>,
    pub namespace_page: Vec<NamespaceRecommendationRecord>,
    pub queries: Vec<String>,
}

/// Store double implementing every store trait over one mutex
#[derive(Default)]
pub(crate) struct MockStore {
    pub state: Mutex<StoreState>,
    pub fail_metrics: bool,
    pub fail_partitions: bool,
}

impl MockStore {
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut StoreState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub(crate) fn add_workload(&self, workload: NewWorkload) -> i64 {
        self.with_state(|s| {
            let id = s.workloads.len() as i64 + 1;
            s.workloads.push((id, workload));
            id
        })
    }

    pub(crate) fn add_cluster(&self, cluster: NewCluster) -> i64 {
        self.with_state(|s| {
            let id = s.clusters.len() as i64 + 1;
            s.clusters.push((id, cluster));
            id
        })
    }
}

fn database_error(message: &str) -> StoreError {
    StoreError::Database(sqlx::Error::Protocol(message.to_string()))
}

#[async_trait]
impl IngestStore for MockStore {
    async fn upsert_tenant(&self, org_id: &str, _account: Option<&str>) -> Result<i64, StoreError> {
        Ok(self.with_state(|s| {
            let next = s.tenants.len() as i64 + 1;
            *s.tenants.entry(org_id.to_string()).or_insert(next)
        }))
    }

    async fn upsert_cluster(&self, cluster: &NewCluster) -> Result<i64, StoreError> {
        Ok(self.with_state(|s| {
            if let Some((id, existing)) = s
                .clusters
                .iter_mut()
                .find(|(_, c)| c.tenant_id == cluster.tenant_id && c.cluster_uuid == cluster.cluster_uuid)
            {
                *existing = cluster.clone();
                return *id;
            }
            let id = s.clusters.len() as i64 + 1;
            s.clusters.push((id, cluster.clone()));
            id
        }))
    }

    async fn upsert_workload(&self, workload: &NewWorkload) -> Result<WorkloadRecord, StoreError> {
        Ok(self.with_state(|s| {
            if let Some((id, existing)) = s.workloads.iter_mut().find(|(_, w)| {
                w.org_id == workload.org_id
                    && w.cluster_id == workload.cluster_id
                    && w.experiment_name == workload.experiment_name
            }) {
                existing.containers = workload.containers.clone();
                existing.metrics_upload_at = workload.metrics_upload_at;
                return WorkloadRecord {
                    id: *id,
                    inserted: false,
                };
            }
            let id = s.workloads.len() as i64 + 1;
            s.workloads.push((id, workload.clone()));
            WorkloadRecord { id, inserted: true }
        }))
    }

    async fn insert_workload_metrics(&self, rows: &[WorkloadMetricsRow]) -> Result<u64, StoreError> {
        if self.fail_metrics {
            return Err(database_error("insert failed"));
        }
        Ok(self.with_state(|s| {
            let mut inserted = 0;
            for row in rows {
                let exists = s.metrics.iter().any(|m| {
                    m.org_id == row.org_id
                        && m.workload_id == row.workload_id
                        && m.container_name == row.container_name
                        && m.interval_start == row.interval_start
                        && m.interval_end == row.interval_end
                });
                if !exists {
                    s.metrics.push(row.clone());
                    inserted += 1;
                }
            }
            inserted
        }))
    }
}

#[async_trait]
impl RecommendationStore for MockStore {
    async fn workload_exists(&self, workload_id: i64) -> Result<bool, StoreError> {
        Ok(self.with_state(|s| s.workloads.iter().any(|(id, _)| *id == workload_id)))
    }

    async fn latest_container_monitoring_end(
        &self,
        workload_id: i64,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.with_state(|s| {
            s.recommendations
                .values()
                .filter(|r| r.workload_id == workload_id)
                .map(|r| r.monitoring_end)
                .max()
        }))
    }

    async fn latest_namespace_monitoring_end(
        &self,
        workload_id: i64,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.with_state(|s| s.namespace_recommendations.get(&workload_id).map(|r| r.monitoring_end)))
    }

    async fn save_container_recommendations(
        &self,
        org_id: &str,
        rows: &[RecommendationRow],
    ) -> Result<(), StoreError> {
        self.with_state(|s| {
            for row in rows {
                let key = (row.workload_id, row.container_name.clone());
                let newer = s
                    .recommendations
                    .get(&key)
                    .map_or(true, |current| current.monitoring_end <= row.monitoring_end);
                if newer {
                    s.recommendations.insert(key, row.clone());
                }
                let seen = s.history.iter().any(|(org, h)| {
                    org == org_id
                        && h.workload_id == row.workload_id
                        && h.container_name == row.container_name
                        && h.monitoring_end == row.monitoring_end
                });
                if !seen {
                    s.history.push((org_id.to_string(), row.clone()));
                }
            }
        });
        Ok(())
    }

    async fn save_namespace_recommendations(
        &self,
        org_id: &str,
        rows: &[NamespaceRecommendationRow],
    ) -> Result<(), StoreError> {
        self.with_state(|s| {
            for row in rows {
                let newer = s
                    .namespace_recommendations
                    .get(&row.workload_id)
                    .map_or(true, |current| current.monitoring_end <= row.monitoring_end);
                if newer {
                    s.namespace_recommendations.insert(row.workload_id, row.clone());
                }
                let seen = s.namespace_history.iter().any(|(org, h)| {
                    org == org_id && h.workload_id == row.workload_id && h.monitoring_end == row.monitoring_end
                });
                if !seen {
                    s.namespace_history.push((org_id.to_string(), row.clone()));
                }
            }
        });
        Ok(())
    }
}

#[async_trait]
impl ClusterStore for MockStore {
    async fn find_cluster_by_source(&self, source_id: &str) -> Result<Option<ClusterRecord>, StoreError> {
        Ok(self.with_state(|s| {
            s.clusters
                .iter()
                .find(|(_, c)| c.source_id == source_id)
                .map(|(id, c)| ClusterRecord {
                    id: *id,
                    tenant_id: c.tenant_id,
                    source_id: c.source_id.clone(),
                    cluster_uuid: c.cluster_uuid.clone(),
                    cluster_alias: c.cluster_alias.clone(),
                })
        }))
    }

    async fn workloads_of_cluster(&self, cluster_id: i64) -> Result<Vec<WorkloadRef>, StoreError> {
        Ok(self.with_state(|s| {
            s.workloads
                .iter()
                .filter(|(_, w)| w.cluster_id == cluster_id)
                .map(|(id, w)| WorkloadRef {
                    id: *id,
                    experiment_name: w.experiment_name.clone(),
                })
                .collect()
        }))
    }

    async fn delete_cluster(&self, cluster_id: i64) -> Result<(), StoreError> {
        self.with_state(|s| {
            s.clusters.retain(|(id, _)| *id != cluster_id);
            let gone: HashSet<i64> = s
                .workloads
                .iter()
                .filter(|(_, w)| w.cluster_id == cluster_id)
                .map(|(id, _)| *id)
                .collect();
            s.workloads.retain(|(id, _)| !gone.contains(id));
            s.metrics.retain(|m| !gone.contains(&m.workload_id));
            s.recommendations.retain(|(id, _), _| !gone.contains(id));
        });
        Ok(())
    }
}

#[async_trait]
impl PartitionStore for MockStore {
    async fn drop_partitions(&self, threshold: NaiveDate) -> Result<(), StoreError> {
        if self.fail_partitions {
            return Err(database_error("drop failed"));
        }
        self.with_state(|s| s.dropped_partitions.push(threshold));
        Ok(())
    }

    async fn create_partitions(&self, start: NaiveDate, count: i32) -> Result<(), StoreError> {
        self.with_state(|s| s.created_partitions.push((start, count)));
        Ok(())
    }
}

#[async_trait]
impl RecommendationReader for MockStore {
    async fn container_recommendations(
        &self,
        query: &SelectQuery,
    ) -> Result<(Vec<RecommendationRecord>, i64), StoreError> {
        Ok(self.with_state(|s| {
            s.queries.push(query.render().0);
            (s.container_page.clone(), s.container_page.len() as i64)
        }))
    }

    async fn namespace_recommendations(
        &self,
        query: &SelectQuery,
    ) -> Result<(Vec<NamespaceRecommendationRecord>, i64), StoreError> {
        Ok(self.with_state(|s| {
            s.queries.push(query.render().0);
            (s.namespace_page.clone(), s.namespace_page.len() as i64)
        }))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
