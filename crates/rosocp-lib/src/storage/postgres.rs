//! PostgreSQL implementation of the store traits

use super::{
    ClusterRecord, ClusterStore, IngestStore, NamespaceRecommendationRecord, NamespaceRecommendationRow,
    NewCluster, NewWorkload, PartitionStore, RecommendationReader, RecommendationRecord, RecommendationRow,
    RecommendationStore, SelectQuery, SqlValue, StoreError, WorkloadMetricsRow, WorkloadRecord, WorkloadRef,
};
use crate::config::DatabaseSettings;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgArguments, PgPoolOptions};
use sqlx::query::{QueryAs, QueryScalar};
use sqlx::{PgPool, Postgres};
use std::time::Duration;
use tracing::{debug, info};

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// A cluster is identified by its uuid within a tenant; the source may change
const UPSERT_CLUSTER: &str = "INSERT INTO clusters (tenant_id, source_id, cluster_uuid, cluster_alias, last_reported_at) \
     VALUES ($1, $2, $3, $4, $5) \
     ON CONFLICT (tenant_id, cluster_uuid) DO UPDATE SET \
        source_id = EXCLUDED.source_id, \
        cluster_alias = EXCLUDED.cluster_alias, \
        last_reported_at = EXCLUDED.last_reported_at \
     RETURNING id";

/// One pool shared by every store trait
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(settings: &DatabaseSettings) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_with(settings.connect_options())
            .await?;
        info!(host = %settings.host, database = %settings.name, "Connected to database");
        Ok(Self { pool })
    }

    /// Apply the embedded schema migrations
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations applied");
        Ok(())
    }

    /// List the embedded migrations as `(version, description, applied)`
    pub async fn migration_status(&self) -> anyhow::Result<Vec<(i64, String, bool)>> {
        // The bookkeeping table only exists once `migrate` has run.
        let applied: Vec<i64> =
            sqlx::query_scalar("SELECT version FROM _sqlx_migrations WHERE success ORDER BY version")
                .fetch_all(&self.pool)
                .await
                .unwrap_or_default();

        let migrator = sqlx::migrate!("./migrations");
        Ok(migrator
            .iter()
            .map(|m| (m.version, m.description.to_string(), applied.contains(&m.version)))
            .collect())
    }

    async fn latest_end(&self, sql: &str, workload_id: i64) -> Result<Option<DateTime<Utc>>, StoreError> {
        let latest: Option<DateTime<Utc>> = sqlx::query_scalar(sql)
            .bind(workload_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(latest)
    }

    async fn page<O>(&self, query: &SelectQuery) -> Result<(Vec<O>, i64), StoreError>
    where
        O: for<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> + Send + Unpin,
    {
        let (sql, args) = query.render();
        let (count_sql, count_args) = query.render_count();
        debug!(filters = %query.describe(), "Listing recommendations");

        let mut rows = sqlx::query_as::<_, O>(&sql);
        for arg in args {
            rows = bind_row(rows, arg);
        }
        let records = rows.fetch_all(&self.pool).await?;

        let mut count = sqlx::query_scalar::<_, i64>(&count_sql);
        for arg in count_args {
            count = bind_scalar(count, arg);
        }
        let total = count.fetch_one(&self.pool).await?;

        Ok((records, total))
    }
}

fn bind_row<'q, O>(
    query: QueryAs<'q, Postgres, O, PgArguments>,
    value: SqlValue,
) -> QueryAs<'q, Postgres, O, PgArguments> {
    match value {
        SqlValue::Text(v) => query.bind(v),
        SqlValue::Int(v) => query.bind(v),
        SqlValue::Timestamp(v) => query.bind(v),
        SqlValue::TextList(v) => query.bind(v),
    }
}

fn bind_scalar<'q, O>(
    query: QueryScalar<'q, Postgres, O, PgArguments>,
    value: SqlValue,
) -> QueryScalar<'q, Postgres, O, PgArguments> {
    match value {
        SqlValue::Text(v) => query.bind(v),
        SqlValue::Int(v) => query.bind(v),
        SqlValue::Timestamp(v) => query.bind(v),
        SqlValue::TextList(v) => query.bind(v),
    }
}

#[async_trait]
impl IngestStore for PgStore {
    async fn upsert_tenant(&self, org_id: &str, account: Option<&str>) -> Result<i64, StoreError> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO rh_accounts (org_id, account) VALUES ($1, $2) \
             ON CONFLICT (org_id) DO UPDATE SET account = COALESCE(EXCLUDED.account, rh_accounts.account) \
             RETURNING id",
        )
        .bind(org_id)
        .bind(account)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn upsert_cluster(&self, cluster: &NewCluster) -> Result<i64, StoreError> {
        let id: i64 = sqlx::query_scalar(UPSERT_CLUSTER)
            .bind(cluster.tenant_id)
            .bind(&cluster.source_id)
            .bind(&cluster.cluster_uuid)
            .bind(&cluster.cluster_alias)
            .bind(cluster.last_reported_at)
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    async fn upsert_workload(&self, workload: &NewWorkload) -> Result<WorkloadRecord, StoreError> {
        let (id, inserted): (i64, bool) = sqlx::query_as(
            "INSERT INTO workloads \
                (org_id, cluster_id, experiment_name, namespace, workload_type, workload_name, containers, metrics_upload_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (org_id, cluster_id, experiment_name) DO UPDATE SET \
                containers = EXCLUDED.containers, \
                metrics_upload_at = EXCLUDED.metrics_upload_at \
             RETURNING id, (xmax = 0) AS inserted",
        )
        .bind(&workload.org_id)
        .bind(workload.cluster_id)
        .bind(&workload.experiment_name)
        .bind(&workload.namespace)
        .bind(workload.workload_type.as_str())
        .bind(&workload.workload_name)
        .bind(&workload.containers)
        .bind(workload.metrics_upload_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(WorkloadRecord { id, inserted })
    }

    async fn insert_workload_metrics(&self, rows: &[WorkloadMetricsRow]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for row in rows {
            let result = sqlx::query(
                "INSERT INTO workload_metrics \
                    (org_id, workload_id, container_name, interval_start, interval_end, usage_metrics) \
                 VALUES ($1, $2, $3, $4, $5, $6) \
                 ON CONFLICT (org_id, workload_id, container_name, interval_start, interval_end) DO NOTHING",
            )
            .bind(&row.org_id)
            .bind(row.workload_id)
            .bind(&row.container_name)
            .bind(row.interval_start)
            .bind(row.interval_end)
            .bind(&row.usage_metrics)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::from_insert("workload_metrics", row.interval_end, e))?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }
}

#[async_trait]
impl RecommendationStore for PgStore {
    async fn workload_exists(&self, workload_id: i64) -> Result<bool, StoreError> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM workloads WHERE id = $1)")
            .bind(workload_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn latest_container_monitoring_end(
        &self,
        workload_id: i64,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.latest_end(
            "SELECT MAX(monitoring_end_time) FROM recommendation_sets WHERE workload_id = $1",
            workload_id,
        )
        .await
    }

    async fn latest_namespace_monitoring_end(
        &self,
        workload_id: i64,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.latest_end(
            "SELECT MAX(monitoring_end_time) FROM namespace_recommendation_sets WHERE workload_id = $1",
            workload_id,
        )
        .await
    }

    async fn save_container_recommendations(
        &self,
        org_id: &str,
        rows: &[RecommendationRow],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            // never replace a newer recommendation with an older one
            sqlx::query(
                "INSERT INTO recommendation_sets \
                    (workload_id, container_name, monitoring_start_time, monitoring_end_time, recommendations, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, now()) \
                 ON CONFLICT (workload_id, container_name) DO UPDATE SET \
                    monitoring_start_time = EXCLUDED.monitoring_start_time, \
                    monitoring_end_time = EXCLUDED.monitoring_end_time, \
                    recommendations = EXCLUDED.recommendations, \
                    updated_at = now() \
                 WHERE recommendation_sets.monitoring_end_time <= EXCLUDED.monitoring_end_time",
            )
            .bind(row.workload_id)
            .bind(&row.container_name)
            .bind(row.monitoring_start)
            .bind(row.monitoring_end)
            .bind(&row.recommendations)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO historical_recommendation_sets \
                    (org_id, workload_id, container_name, monitoring_start_time, monitoring_end_time, recommendations) \
                 VALUES ($1, $2, $3, $4, $5, $6) \
                 ON CONFLICT (org_id, workload_id, container_name, monitoring_end_time) DO NOTHING",
            )
            .bind(org_id)
            .bind(row.workload_id)
            .bind(&row.container_name)
            .bind(row.monitoring_start)
            .bind(row.monitoring_end)
            .bind(&row.recommendations)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::from_insert("historical_recommendation_sets", row.monitoring_end, e))?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn save_namespace_recommendations(
        &self,
        org_id: &str,
        rows: &[NamespaceRecommendationRow],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                "INSERT INTO namespace_recommendation_sets \
                    (workload_id, namespace_name, cpu_request_current, cpu_variation, \
                     memory_request_current, memory_variation, monitoring_start_time, \
                     monitoring_end_time, recommendations, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, now()) \
                 ON CONFLICT (workload_id) DO UPDATE SET \
                    namespace_name = EXCLUDED.namespace_name, \
                    cpu_request_current = EXCLUDED.cpu_request_current, \
                    cpu_variation = EXCLUDED.cpu_variation, \
                    memory_request_current = EXCLUDED.memory_request_current, \
                    memory_variation = EXCLUDED.memory_variation, \
                    monitoring_start_time = EXCLUDED.monitoring_start_time, \
                    monitoring_end_time = EXCLUDED.monitoring_end_time, \
                    recommendations = EXCLUDED.recommendations, \
                    updated_at = now() \
                 WHERE namespace_recommendation_sets.monitoring_end_time <= EXCLUDED.monitoring_end_time",
            )
            .bind(row.workload_id)
            .bind(&row.namespace_name)
            .bind(row.cpu_request_current)
            .bind(row.cpu_variation)
            .bind(row.memory_request_current)
            .bind(row.memory_variation)
            .bind(row.monitoring_start)
            .bind(row.monitoring_end)
            .bind(&row.recommendations)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO historical_namespace_recommendation_sets \
                    (org_id, workload_id, namespace_name, cpu_request_current, cpu_variation, \
                     memory_request_current, memory_variation, monitoring_start_time, \
                     monitoring_end_time, recommendations) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
                 ON CONFLICT (org_id, workload_id, namespace_name, monitoring_end_time) DO NOTHING",
            )
            .bind(org_id)
            .bind(row.workload_id)
            .bind(&row.namespace_name)
            .bind(row.cpu_request_current)
            .bind(row.cpu_variation)
            .bind(row.memory_request_current)
            .bind(row.memory_variation)
            .bind(row.monitoring_start)
            .bind(row.monitoring_end)
            .bind(&row.recommendations)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                StoreError::from_insert("historical_namespace_recommendation_sets", row.monitoring_end, e)
            })?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl ClusterStore for PgStore {
    async fn find_cluster_by_source(&self, source_id: &str) -> Result<Option<ClusterRecord>, StoreError> {
        let cluster = sqlx::query_as::<_, ClusterRecord>(
            "SELECT id, tenant_id, source_id, cluster_uuid, cluster_alias FROM clusters WHERE source_id = $1",
        )
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(cluster)
    }

    async fn workloads_of_cluster(&self, cluster_id: i64) -> Result<Vec<WorkloadRef>, StoreError> {
        let workloads = sqlx::query_as::<_, WorkloadRef>(
            "SELECT id, experiment_name FROM workloads WHERE cluster_id = $1 ORDER BY id",
        )
        .bind(cluster_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(workloads)
    }

    async fn delete_cluster(&self, cluster_id: i64) -> Result<(), StoreError> {
        // workloads, recommendations and metrics cascade
        sqlx::query("DELETE FROM clusters WHERE id = $1")
            .bind(cluster_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PartitionStore for PgStore {
    async fn drop_partitions(&self, threshold: NaiveDate) -> Result<(), StoreError> {
        sqlx::query("SELECT drop_ros_partition($1)")
            .bind(threshold)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_partitions(&self, start: NaiveDate, count: i32) -> Result<(), StoreError> {
        sqlx::query("SELECT create_ros_partitions($1, $2)")
            .bind(start)
            .bind(count)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl RecommendationReader for PgStore {
    async fn container_recommendations(
        &self,
        query: &SelectQuery,
    ) -> Result<(Vec<RecommendationRecord>, i64), StoreError> {
        self.page(query).await
    }

    async fn namespace_recommendations(
        &self,
        query: &SelectQuery,
    ) -> Result<(Vec<NamespaceRecommendationRecord>, i64), StoreError> {
        self.page(query).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INITIAL_SCHEMA: &str = include_str!("../../migrations/20240101000001_initial_schema.sql");

    #[test]
    fn test_cluster_upsert_matches_unique_key() {
        assert!(UPSERT_CLUSTER.contains("ON CONFLICT (tenant_id, cluster_uuid)"));
        assert!(UPSERT_CLUSTER.contains("source_id = EXCLUDED.source_id"));

        let clusters = INITIAL_SCHEMA
            .split("CREATE TABLE IF NOT EXISTS clusters")
            .nth(1)
            .and_then(|rest| rest.split(");").next())
            .unwrap();
        assert!(clusters.contains("UNIQUE (tenant_id, cluster_uuid)"));
        assert!(!clusters.contains("UNIQUE (tenant_id, source_id)"));
    }
}
