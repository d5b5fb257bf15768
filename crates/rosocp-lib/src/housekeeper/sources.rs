//! Sources service events
//!
//! Destroying the cost-management application of a source removes the
//! cluster it reported, every workload under it, and the analyzer-side
//! experiments of those workloads.

use crate::bus::{BusMessage, Disposition, MessageHandler};
use crate::config::SourcesSettings;
use crate::kruize::Analyzer;
use crate::models::SourcesEvent;
use crate::observability::PipelineMetrics;
use crate::storage::ClusterStore;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// `event_type` header value of the events acted upon
pub const APPLICATION_DESTROY: &str = "Application.destroy";

const EVENT_TYPE_HEADER: &str = "event_type";
const COST_APPLICATION: &str = "/insights/platform/cost-management";

/// Application type id used by on-prem installs
pub const ONPREM_APPLICATION_TYPE: i64 = 0;

#[derive(Debug, Error)]
pub enum SourcesError {
    #[error("sources request failed: {0}")]
    Transport(String),

    #[error("sources service returned HTTP {0}")]
    Status(u16),

    #[error("unexpected application_types response: {0}")]
    Decode(String),
}

#[derive(Debug, Deserialize)]
struct ApplicationTypes {
    #[serde(default)]
    data: Vec<ApplicationType>,
}

#[derive(Debug, Deserialize)]
struct ApplicationType {
    id: Value,
}

/// Client for the sources inventory API
pub struct SourcesClient {
    client: Client,
    url: String,
    onprem: bool,
}

impl SourcesClient {
    pub fn new(settings: &SourcesSettings, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {e}"))?;
        Ok(Self {
            client,
            url: format!(
                "{}{}/application_types",
                settings.base_url.trim_end_matches('/'),
                settings.prefix
            ),
            onprem: settings.onprem,
        })
    }

    /// Id of the cost-management application type
    pub async fn cost_application_id(&self) -> Result<i64, SourcesError> {
        if self.onprem {
            return Ok(ONPREM_APPLICATION_TYPE);
        }
        let response = self
            .client
            .get(&self.url)
            .query(&[("filter[name][eq]", COST_APPLICATION)])
            .send()
            .await
            .map_err(|e| SourcesError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourcesError::Status(status.as_u16()));
        }
        let body: ApplicationTypes = response
            .json()
            .await
            .map_err(|e| SourcesError::Decode(e.to_string()))?;

        let first = body
            .data
            .first()
            .ok_or_else(|| SourcesError::Decode("no application type returned".into()))?;
        // the API serializes ids as strings
        match &first.id {
            Value::String(s) => s.parse().map_err(|_| SourcesError::Decode(format!("id {s:?}"))),
            Value::Number(n) => n.as_i64().ok_or_else(|| SourcesError::Decode(format!("id {n}"))),
            other => Err(SourcesError::Decode(format!("id {other}"))),
        }
    }
}

pub struct SourcesHandler {
    cost_application_id: i64,
    analyzer: Arc<dyn Analyzer>,
    store: Arc<dyn ClusterStore>,
    metrics: PipelineMetrics,
}

impl SourcesHandler {
    pub fn new(
        cost_application_id: i64,
        analyzer: Arc<dyn Analyzer>,
        store: Arc<dyn ClusterStore>,
        metrics: PipelineMetrics,
    ) -> Self {
        Self {
            cost_application_id,
            analyzer,
            store,
            metrics,
        }
    }

    /// Remove the cluster reported through `source_id`
    pub async fn remove_source(&self, source_id: &str) -> Disposition {
        let cluster = match self.store.find_cluster_by_source(source_id).await {
            Ok(Some(cluster)) => cluster,
            Ok(None) => {
                debug!("No cluster reported through this source");
                return Disposition::Commit;
            }
            Err(e) => {
                self.metrics.inc_db_errors();
                error!(error = %e, "Unable to look up cluster");
                return Disposition::Defer;
            }
        };

        let workloads = match self.store.workloads_of_cluster(cluster.id).await {
            Ok(workloads) => workloads,
            Err(e) => {
                self.metrics.inc_db_errors();
                error!(error = %e, "Unable to list workloads of cluster");
                return Disposition::Defer;
            }
        };
        for workload in &workloads {
            match self.analyzer.delete_experiment(&workload.experiment_name).await {
                Ok(()) => self.metrics.inc_experiments_deleted(),
                Err(e) => {
                    warn!(experiment = %workload.experiment_name, error = %e, "Unable to delete experiment")
                }
            }
        }

        if let Err(e) = self.store.delete_cluster(cluster.id).await {
            self.metrics.inc_db_errors();
            error!(cluster_uuid = %cluster.cluster_uuid, error = %e, "Unable to delete cluster");
            return Disposition::Defer;
        }
        info!(
            cluster_uuid = %cluster.cluster_uuid,
            workloads = workloads.len(),
            "Deleted cluster of destroyed source"
        );
        Disposition::Commit
    }
}

#[async_trait]
impl MessageHandler for SourcesHandler {
    async fn handle(&self, message: &BusMessage) -> Disposition {
        if message.header(EVENT_TYPE_HEADER) != Some(APPLICATION_DESTROY) {
            return Disposition::Commit;
        }
        let event: SourcesEvent = match serde_json::from_slice(&message.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(offset = message.offset, error = %e, "Skipping undecodable sources event");
                return Disposition::Commit;
            }
        };
        if let Err(e) = event.validate() {
            warn!(error = %e, "Skipping invalid sources event");
            return Disposition::Commit;
        }
        if event.application_type_id != self.cost_application_id {
            return Disposition::Commit;
        }

        let source_id = event.source_id.to_string();
        let span = info_span!("sources", source_id = %source_id, tenant = %event.tenant);
        self.remove_source(&source_id).instrument(span).await
    }
}
