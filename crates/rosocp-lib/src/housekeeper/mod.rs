//! Housekeeping jobs
//!
//! This module provides:
//! - The sources listener, which removes clusters whose cost application was destroyed
//! - The partition cleaner, which drops half-month partitions past retention
//! - A periodic runner for jobs that are not driven by the bus

pub mod partitions;
pub mod sources;

pub use partitions::{partition_threshold, PartitionCleaner};
pub use sources::{SourcesClient, SourcesHandler, APPLICATION_DESTROY};

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, info};

/// A job run on a fixed schedule
#[async_trait]
pub trait Housekeeping: Send + Sync {
    fn name(&self) -> &'static str;

    /// One pass; failures are logged by the job itself
    async fn run_once(&self);
}

/// Runs a job every `period` until shutdown, starting immediately
pub struct Housekeeper {
    job: Arc<dyn Housekeeping>,
    period: Duration,
}

impl Housekeeper {
    pub fn new(job: Arc<dyn Housekeeping>, period: Duration) -> Self {
        Self { job, period }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            job = self.job.name(),
            interval_secs = self.period.as_secs(),
            "Starting housekeeper"
        );

        let mut ticker = interval(self.period);
        let mut passes = 0u64;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.job.run_once().await;
                    passes += 1;
                    debug!(job = self.job.name(), passes, "Housekeeping pass complete");
                }
                _ = shutdown.recv() => {
                    info!(job = self.job.name(), "Shutting down housekeeper");
                    break;
                }
            }
        }
    }
}
