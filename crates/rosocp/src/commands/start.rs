//! Long-running pipeline processes
//!
//! Each process serves `/healthz`, `/readyz` and `/metrics` on the Prometheus
//! port and stops after the in-flight message on SIGINT or SIGTERM.

use anyhow::{Context, Result};
use rosocp_lib::api::{self, ApiState};
use rosocp_lib::bus::{KafkaConsumer, KafkaPublisher, MessageHandler};
use rosocp_lib::featureflags::namespace_gate;
use rosocp_lib::health::components::{ANALYZER, CONSUMER, DATABASE, PRODUCER, READ_API};
use rosocp_lib::housekeeper::{Housekeeper, PartitionCleaner, SourcesClient, SourcesHandler};
use rosocp_lib::identity::{authenticator, Authenticator};
use rosocp_lib::kruize::{Analyzer, KruizeClient};
use rosocp_lib::poller::RecommendationPoller;
use rosocp_lib::processor::IngestProcessor;
use rosocp_lib::rbac::RbacClient;
use rosocp_lib::report::HttpReportSource;
use rosocp_lib::storage::RecommendationReader;
use rosocp_lib::{probes, HealthRegistry, PipelineMetrics, Settings};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const DATABASE_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Shared scaffolding of a running process
struct Process {
    name: &'static str,
    health: HealthRegistry,
    metrics: PipelineMetrics,
    shutdown: broadcast::Sender<()>,
    probe_server: JoinHandle<()>,
}

impl Process {
    async fn start(settings: &Settings, name: &'static str, components: &[&str]) -> Self {
        info!(process = name, version = env!("CARGO_PKG_VERSION"), "Starting");

        let health = HealthRegistry::new(settings.service_name.clone());
        for component in components {
            health.register(component).await;
        }

        let (shutdown, _) = broadcast::channel(4);
        tokio::spawn(forward_signals(shutdown.clone()));

        let port = settings.api.prometheus_port;
        let probe_server = tokio::spawn({
            let health = health.clone();
            let stopped = stopped(&shutdown);
            async move {
                if let Err(e) = probes::serve(port, health, stopped).await {
                    error!(port, error = %e, "Probe server failed");
                }
            }
        });

        Self {
            name,
            health,
            metrics: PipelineMetrics::new(),
            shutdown,
            probe_server,
        }
    }

    fn receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    async fn ready(&self) {
        self.health.set_ready(true).await;
        info!(process = self.name, "Ready");
    }

    async fn finish(self) {
        self.health.set_ready(false).await;
        let _ = self.shutdown.send(());
        if let Err(e) = self.probe_server.await {
            warn!(error = %e, "Probe server task ended abnormally");
        }
        info!(process = self.name, "Stopped");
    }

    /// Install the performance profile; a failure only degrades the process
    /// since experiment calls install it again on demand.
    async fn bootstrap(&self, analyzer: &dyn Analyzer) {
        match analyzer.bootstrap_profile().await {
            Ok(()) => self.health.set_healthy(ANALYZER).await,
            Err(e) => {
                warn!(error = %e, "Unable to install the performance profile");
                self.health.set_degraded(ANALYZER, e.to_string()).await;
            }
        }
    }

    /// Consume `topic` until shutdown
    async fn consume(
        self,
        settings: &Settings,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
        stop: broadcast::Receiver<()>,
    ) -> Result<()> {
        let consumer = KafkaConsumer::new(&settings.kafka, topic, self.metrics.clone())
            .with_context(|| format!("Unable to subscribe to {topic}"))?
            .with_health(self.health.clone());
        self.health.set_healthy(CONSUMER).await;

        self.ready().await;
        consumer.run(handler, stop).await;
        self.finish().await;
        Ok(())
    }
}

fn stopped(shutdown: &broadcast::Sender<()>) -> impl Future<Output = ()> + Send + 'static {
    let mut receiver = shutdown.subscribe();
    async move {
        let _ = receiver.recv().await;
    }
}

async fn forward_signals(shutdown: broadcast::Sender<()>) {
    wait_for_signal().await;
    let _ = shutdown.send(());
}

/// Keep the database component current while the API serves
async fn watch_database(
    store: Arc<dyn RecommendationReader>,
    health: HealthRegistry,
    mut stop: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(DATABASE_CHECK_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => match store.ping().await {
                Ok(()) => health.set_healthy(DATABASE).await,
                Err(e) => {
                    warn!(error = %e, "Database check failed");
                    health.set_unhealthy(DATABASE, e.to_string()).await;
                }
            },
            _ = stop.recv() => break,
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
                _ = terminate.recv() => info!("SIGTERM received"),
            }
        }
        Err(e) => {
            warn!(error = %e, "Unable to listen for SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
            info!("SIGINT received");
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("SIGINT received");
}

/// `rosocp start processor`
pub async fn processor(settings: Settings) -> Result<()> {
    let process = Process::start(&settings, "processor", &[DATABASE, CONSUMER, PRODUCER, ANALYZER]).await;
    let stop = process.receiver();
    let metrics = process.metrics.clone();

    let store = Arc::new(super::connect(&settings).await?);
    process.health.set_healthy(DATABASE).await;

    let kruize = Arc::new(KruizeClient::new(&settings.kruize, metrics.clone())?);
    process.bootstrap(&*kruize).await;

    let publisher = Arc::new(KafkaPublisher::new(&settings.kafka).context("Unable to create the Kafka producer")?);
    process.health.set_healthy(PRODUCER).await;

    let reports = Arc::new(HttpReportSource::new(settings.kruize.request_timeout)?);
    let gate = namespace_gate(&settings.features, &settings.service_name, process.receiver()).await?;

    let handler = IngestProcessor::new(
        reports,
        kruize,
        store,
        publisher,
        gate,
        settings.kafka.recommendation_topic.clone(),
        metrics,
    );
    let topic = settings.kafka.upload_topic.clone();
    process.consume(&settings, &topic, Arc::new(handler), stop).await
}

/// `rosocp start recommendation-poller`
pub async fn recommendation_poller(settings: Settings) -> Result<()> {
    let process = Process::start(&settings, "recommendation-poller", &[DATABASE, CONSUMER, ANALYZER]).await;
    let stop = process.receiver();
    let metrics = process.metrics.clone();

    let store = Arc::new(super::connect(&settings).await?);
    process.health.set_healthy(DATABASE).await;

    let kruize = Arc::new(KruizeClient::new(&settings.kruize, metrics.clone())?);
    process.health.set_healthy(ANALYZER).await;

    let handler = RecommendationPoller::new(
        kruize,
        store,
        settings.kruize.recommendation_fetch_delay_hours,
        metrics,
    );
    let topic = settings.kafka.recommendation_topic.clone();
    process.consume(&settings, &topic, Arc::new(handler), stop).await
}

/// `rosocp start housekeeper --sources`
pub async fn sources_listener(settings: Settings) -> Result<()> {
    let process = Process::start(&settings, "sources-listener", &[DATABASE, CONSUMER, ANALYZER]).await;
    let stop = process.receiver();
    let metrics = process.metrics.clone();

    let store = Arc::new(super::connect(&settings).await?);
    process.health.set_healthy(DATABASE).await;

    let sources = SourcesClient::new(&settings.sources, settings.kruize.request_timeout)?;
    let application_id = sources
        .cost_application_id()
        .await
        .context("Unable to resolve the cost-management application type")?;
    info!(application_id, "Listening for cost-management source deletions");

    let kruize = Arc::new(KruizeClient::new(&settings.kruize, metrics.clone())?);
    process.health.set_healthy(ANALYZER).await;

    let handler = SourcesHandler::new(application_id, kruize, store, metrics);
    let topic = settings.kafka.sources_event_topic.clone();
    process.consume(&settings, &topic, Arc::new(handler), stop).await
}

/// `rosocp start housekeeper --partition`
pub async fn partition_cleaner(settings: Settings) -> Result<()> {
    let process = Process::start(&settings, "partition-cleaner", &[DATABASE]).await;
    let stop = process.receiver();

    let store = Arc::new(super::connect(&settings).await?);
    process.health.set_healthy(DATABASE).await;

    let cleaner = PartitionCleaner::new(
        store,
        settings.housekeeper.data_retention_days,
        process.metrics.clone(),
    );

    process.ready().await;
    Housekeeper::new(Arc::new(cleaner), settings.housekeeper.interval)
        .run(stop)
        .await;
    process.finish().await;
    Ok(())
}

/// `rosocp start api`
pub async fn api(settings: Settings) -> Result<()> {
    let process = Process::start(&settings, "api", &[DATABASE, READ_API]).await;
    let timeout = settings.kruize.request_timeout;

    let store = Arc::new(super::connect(&settings).await?);
    process.health.set_healthy(DATABASE).await;
    tokio::spawn(watch_database(store.clone(), process.health.clone(), process.receiver()));

    let auth: Arc<dyn Authenticator> = Arc::from(authenticator(&settings.api, timeout)?);
    let permissions = Arc::new(RbacClient::new(&settings.rbac, timeout)?);
    let gate = namespace_gate(&settings.features, &settings.service_name, process.receiver()).await?;
    if !settings.rbac.enabled {
        warn!("RBAC is disabled, every caller sees every recommendation of its organization");
    }

    let state = Arc::new(ApiState {
        store,
        auth,
        permissions,
        namespace_gate: gate,
        rbac_enabled: settings.rbac.enabled,
        record_limit_csv: settings.api.record_limit_csv,
        metrics: process.metrics.clone(),
    });
    process.health.set_healthy(READ_API).await;

    process.ready().await;
    let served = api::serve(settings.api.port, state, stopped(&process.shutdown)).await;
    if let Err(e) = &served {
        process.health.set_unhealthy(READ_API, e.to_string()).await;
    }
    process.finish().await;
    served
}
