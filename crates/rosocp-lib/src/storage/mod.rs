//! Persistence
//!
//! Each process talks to the database through the narrow trait it needs
//! ([`IngestStore`], [`RecommendationStore`], [`ClusterStore`],
//! [`PartitionStore`], [`RecommendationReader`]); [`PgStore`] implements
//! all of them over one sqlx pool.

mod postgres;
pub mod query;

pub use postgres::PgStore;
pub use query::{Predicate, SelectQuery, SortOrder, SqlValue};

use crate::models::WorkloadKind;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no partition of {table} covers {at}")]
    NoPartition { table: &'static str, at: DateTime<Utc> },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    /// Map an insert failure into a partitioned table
    pub fn from_insert(table: &'static str, at: DateTime<Utc>, err: sqlx::Error) -> Self {
        if err.to_string().contains("no partition of relation") {
            StoreError::NoPartition { table, at }
        } else {
            StoreError::Database(err)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewCluster {
    pub tenant_id: i64,
    pub source_id: String,
    pub cluster_uuid: String,
    pub cluster_alias: String,
    pub last_reported_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewWorkload {
    pub org_id: String,
    pub cluster_id: i64,
    pub experiment_name: String,
    pub namespace: String,
    pub workload_type: WorkloadKind,
    pub workload_name: String,
    pub containers: Vec<String>,
    pub metrics_upload_at: DateTime<Utc>,
}

/// Result of a workload upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkloadRecord {
    pub id: i64,
    /// The row did not exist before
    pub inserted: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadMetricsRow {
    pub org_id: String,
    pub workload_id: i64,
    pub container_name: String,
    pub interval_start: DateTime<Utc>,
    pub interval_end: DateTime<Utc>,
    pub usage_metrics: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecommendationRow {
    pub workload_id: i64,
    pub container_name: String,
    pub monitoring_start: DateTime<Utc>,
    pub monitoring_end: DateTime<Utc>,
    pub recommendations: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NamespaceRecommendationRow {
    pub workload_id: i64,
    pub namespace_name: String,
    pub cpu_request_current: Option<f64>,
    pub cpu_variation: Option<f64>,
    pub memory_request_current: Option<f64>,
    pub memory_variation: Option<f64>,
    pub monitoring_start: DateTime<Utc>,
    pub monitoring_end: DateTime<Utc>,
    pub recommendations: Value,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ClusterRecord {
    pub id: i64,
    pub tenant_id: i64,
    pub source_id: String,
    pub cluster_uuid: String,
    pub cluster_alias: String,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct WorkloadRef {
    pub id: i64,
    pub experiment_name: String,
}

/// Container recommendation joined with its workload and cluster
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct RecommendationRecord {
    pub id: Uuid,
    pub cluster_uuid: String,
    pub cluster_alias: String,
    pub source_id: String,
    pub project: String,
    pub workload: String,
    pub workload_type: String,
    pub container: String,
    pub last_reported: Option<DateTime<Utc>>,
    pub recommendations: Value,
}

/// Namespace recommendation joined with its workload and cluster
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct NamespaceRecommendationRecord {
    pub id: Uuid,
    pub cluster_uuid: String,
    pub cluster_alias: String,
    pub source_id: String,
    pub project: String,
    pub cpu_request_current: Option<f64>,
    pub cpu_variation: Option<f64>,
    pub memory_request_current: Option<f64>,
    pub memory_variation: Option<f64>,
    pub last_reported: Option<DateTime<Utc>>,
    pub recommendations: Value,
}

const CONTAINER_COLUMNS: &str = "recommendation_sets.id AS id, \
    clusters.cluster_uuid AS cluster_uuid, \
    clusters.cluster_alias AS cluster_alias, \
    clusters.source_id AS source_id, \
    workloads.namespace AS project, \
    workloads.workload_name AS workload, \
    workloads.workload_type AS workload_type, \
    recommendation_sets.container_name AS container, \
    clusters.last_reported_at AS last_reported, \
    recommendation_sets.recommendations AS recommendations";

const CONTAINER_FROM: &str = "recommendation_sets \
    JOIN workloads ON workloads.id = recommendation_sets.workload_id \
    JOIN clusters ON clusters.id = workloads.cluster_id \
    JOIN rh_accounts ON rh_accounts.id = clusters.tenant_id";

const NAMESPACE_COLUMNS: &str = "namespace_recommendation_sets.id AS id, \
    clusters.cluster_uuid AS cluster_uuid, \
    clusters.cluster_alias AS cluster_alias, \
    clusters.source_id AS source_id, \
    namespace_recommendation_sets.namespace_name AS project, \
    namespace_recommendation_sets.cpu_request_current AS cpu_request_current, \
    namespace_recommendation_sets.cpu_variation AS cpu_variation, \
    namespace_recommendation_sets.memory_request_current AS memory_request_current, \
    namespace_recommendation_sets.memory_variation AS memory_variation, \
    clusters.last_reported_at AS last_reported, \
    namespace_recommendation_sets.recommendations AS recommendations";

const NAMESPACE_FROM: &str = "namespace_recommendation_sets \
    JOIN workloads ON workloads.id = namespace_recommendation_sets.workload_id \
    JOIN clusters ON clusters.id = workloads.cluster_id \
    JOIN rh_accounts ON rh_accounts.id = clusters.tenant_id";

/// Container recommendations of one tenant
pub fn container_recommendation_query(org_id: &str) -> SelectQuery {
    let mut query = SelectQuery::new(CONTAINER_COLUMNS, CONTAINER_FROM);
    query.where_sql("rh_accounts.org_id = ?", vec![SqlValue::Text(org_id.to_string())]);
    query
}

/// Namespace recommendations of one tenant
pub fn namespace_recommendation_query(org_id: &str) -> SelectQuery {
    let mut query = SelectQuery::new(NAMESPACE_COLUMNS, NAMESPACE_FROM);
    query.where_sql("rh_accounts.org_id = ?", vec![SqlValue::Text(org_id.to_string())]);
    query
}

/// Writes performed by the ingest processor
#[async_trait]
pub trait IngestStore: Send + Sync {
    async fn upsert_tenant(&self, org_id: &str, account: Option<&str>) -> Result<i64, StoreError>;

    async fn upsert_cluster(&self, cluster: &NewCluster) -> Result<i64, StoreError>;

    async fn upsert_workload(&self, workload: &NewWorkload) -> Result<WorkloadRecord, StoreError>;

    /// Insert-ignore; returns the number of new rows
    async fn insert_workload_metrics(&self, rows: &[WorkloadMetricsRow]) -> Result<u64, StoreError>;
}

/// Reads and writes performed by the recommendation poller
#[async_trait]
pub trait RecommendationStore: Send + Sync {
    async fn workload_exists(&self, workload_id: i64) -> Result<bool, StoreError>;

    /// Latest stored monitoring end of the workload's container recommendations
    async fn latest_container_monitoring_end(
        &self,
        workload_id: i64,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    async fn latest_namespace_monitoring_end(
        &self,
        workload_id: i64,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Upsert current rows and insert-ignore history in one transaction
    async fn save_container_recommendations(
        &self,
        org_id: &str,
        rows: &[RecommendationRow],
    ) -> Result<(), StoreError>;

    async fn save_namespace_recommendations(
        &self,
        org_id: &str,
        rows: &[NamespaceRecommendationRow],
    ) -> Result<(), StoreError>;
}

/// Lookups and deletes performed by the sources listener
#[async_trait]
pub trait ClusterStore: Send + Sync {
    async fn find_cluster_by_source(&self, source_id: &str) -> Result<Option<ClusterRecord>, StoreError>;

    async fn workloads_of_cluster(&self, cluster_id: i64) -> Result<Vec<WorkloadRef>, StoreError>;

    /// Delete the cluster and everything that references it
    async fn delete_cluster(&self, cluster_id: i64) -> Result<(), StoreError>;
}

#[async_trait]
pub trait PartitionStore: Send + Sync {
    /// `drop_ros_partition(threshold)`
    async fn drop_partitions(&self, threshold: NaiveDate) -> Result<(), StoreError>;

    /// `create_ros_partitions(start, count)`
    async fn create_partitions(&self, start: NaiveDate, count: i32) -> Result<(), StoreError>;
}

/// Queries behind the read API
#[async_trait]
pub trait RecommendationReader: Send + Sync {
    /// Page of rows plus the total count ignoring the page
    async fn container_recommendations(
        &self,
        query: &SelectQuery,
    ) -> Result<(Vec<RecommendationRecord>, i64), StoreError>;

    async fn namespace_recommendations(
        &self,
        query: &SelectQuery,
    ) -> Result<(Vec<NamespaceRecommendationRecord>, i64), StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}
