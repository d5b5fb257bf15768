//! Half-month partition retention

use super::Housekeeping;
use crate::observability::PipelineMetrics;
use crate::storage::{PartitionStore, StoreError};
use async_trait::async_trait;
use chrono::{Datelike, Duration, NaiveDate, Utc};
use std::sync::Arc;
use tracing::{error, info};

/// Upcoming partitions created on every pass
const PARTITIONS_AHEAD: i32 = 2;

/// Date handed to `drop_ros_partition` for a retention window
///
/// Partitions start on the 1st and the 16th. A threshold in the first half
/// of a month keeps the whole previous second half; a threshold in the
/// second half keeps the whole current month.
pub fn partition_threshold(today: NaiveDate, retention_days: i64) -> NaiveDate {
    let threshold = today - Duration::days(retention_days);
    let month_start = threshold.with_day(1).unwrap_or(threshold);
    if threshold.day() < 15 {
        let previous = month_start.pred_opt().unwrap_or(month_start);
        previous.with_day(16).unwrap_or(previous)
    } else {
        month_start
    }
}

pub struct PartitionCleaner {
    store: Arc<dyn PartitionStore>,
    retention_days: i64,
    metrics: PipelineMetrics,
}

impl PartitionCleaner {
    pub fn new(store: Arc<dyn PartitionStore>, retention_days: i64, metrics: PipelineMetrics) -> Self {
        Self {
            store,
            retention_days,
            metrics,
        }
    }

    /// Drop expired partitions and make sure the next ones exist
    pub async fn clean(&self, today: NaiveDate) -> Result<NaiveDate, StoreError> {
        let target = partition_threshold(today, self.retention_days);
        self.store.drop_partitions(target).await?;
        info!(threshold = %target, retention_days = self.retention_days, "Dropped expired partitions");

        self.store.create_partitions(today, PARTITIONS_AHEAD).await?;
        Ok(target)
    }
}

#[async_trait]
impl Housekeeping for PartitionCleaner {
    fn name(&self) -> &'static str {
        "partitions"
    }

    async fn run_once(&self) {
        if let Err(e) = self.clean(Utc::now().date_naive()).await {
            self.metrics.inc_db_errors();
            error!(error = %e, "Partition maintenance failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockStore;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_threshold_in_first_half_keeps_previous_second_half() {
        // 2024-03-25 minus 15 days = 2024-03-10
        assert_eq!(partition_threshold(date(2024, 3, 25), 15), date(2024, 2, 16));
    }

    #[test]
    fn test_threshold_in_second_half_keeps_current_month() {
        // 2024-04-04 minus 15 days = 2024-03-20
        assert_eq!(partition_threshold(date(2024, 4, 4), 15), date(2024, 3, 1));
    }

    #[test]
    fn test_threshold_crosses_year() {
        assert_eq!(partition_threshold(date(2024, 1, 20), 15), date(2023, 12, 16));
    }

    #[test]
    fn test_retention_window_bounds() {
        let mut today = date(2024, 1, 1);
        while today < date(2025, 1, 1) {
            let target = partition_threshold(today, 15);
            let threshold = today - Duration::days(15);
            assert!(target <= threshold, "{today}: {target} beyond {threshold}");
            assert!(target > threshold - Duration::days(31), "{today}: {target} too old");
            today += Duration::days(1);
        }
    }

    #[tokio::test]
    async fn test_clean_drops_then_creates() {
        let store = Arc::new(MockStore::default());
        let cleaner = PartitionCleaner::new(store.clone(), 15, PipelineMetrics::new());

        let target = cleaner.clean(date(2024, 3, 25)).await.unwrap();

        assert_eq!(target, date(2024, 2, 16));
        store.with_state(|s| {
            assert_eq!(s.dropped_partitions, vec![date(2024, 2, 16)]);
            assert_eq!(s.created_partitions, vec![(date(2024, 3, 25), 2)]);
        });
    }

    #[tokio::test]
    async fn test_failed_drop_is_counted_not_raised() {
        let store = Arc::new(MockStore {
            fail_partitions: true,
            ..Default::default()
        });
        let cleaner = PartitionCleaner::new(store.clone(), 15, PipelineMetrics::new());
        let before = PipelineMetrics::new().db_errors();

        cleaner.run_once().await;

        assert!(PipelineMetrics::new().db_errors() > before);
        store.with_state(|s| assert!(s.created_partitions.is_empty()));
    }
}
