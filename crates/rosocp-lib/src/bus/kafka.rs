//! Kafka consumer loop and producer built on rdkafka

use super::{BusError, BusMessage, Disposition, MessageHandler, Publisher};
use crate::config::KafkaSettings;
use crate::health::{components, HealthRegistry};
use crate::observability::PipelineMetrics;
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::producer::{FutureProducer, FutureRecord};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

const POLL_TIMEOUT: Duration = Duration::from_secs(1);
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Client settings shared by consumers and producers
pub fn client_config(settings: &KafkaSettings) -> ClientConfig {
    let mut config = ClientConfig::new();
    config
        .set("bootstrap.servers", &settings.bootstrap_servers)
        .set("allow.auto.create.topics", "true");

    if let Some(mechanism) = &settings.sasl_mechanism {
        config.set("sasl.mechanism", mechanism);
        if let Some(protocol) = &settings.security_protocol {
            config.set("security.protocol", protocol);
        }
        if let Some(username) = &settings.sasl_username {
            config.set("sasl.username", username);
        }
        if let Some(password) = &settings.sasl_password {
            config.set("sasl.password", password);
        }
        if let Some(ca) = &settings.ca_location {
            config.set("ssl.ca.location", ca);
        }
    }
    config
}

fn detach(message: &BorrowedMessage<'_>) -> BusMessage {
    let mut headers = HashMap::new();
    if let Some(raw) = message.headers() {
        for header in raw.iter() {
            if let Some(value) = header.value {
                headers.insert(
                    header.key.to_string(),
                    String::from_utf8_lossy(value).into_owned(),
                );
            }
        }
    }
    BusMessage {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message
            .key()
            .map(|k| String::from_utf8_lossy(k).into_owned()),
        headers,
        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
    }
}

/// A subscribed consumer feeding one handler
pub struct KafkaConsumer {
    consumer: StreamConsumer,
    topic: String,
    auto_commit: bool,
    metrics: PipelineMetrics,
    health: Option<HealthRegistry>,
}

impl KafkaConsumer {
    pub fn new(settings: &KafkaSettings, topic: &str, metrics: PipelineMetrics) -> Result<Self, BusError> {
        let consumer: StreamConsumer = client_config(settings)
            .set("group.id", &settings.consumer_group_id)
            .set("enable.auto.commit", settings.auto_commit.to_string())
            .set("auto.offset.reset", "earliest")
            .create()?;
        consumer.subscribe(&[topic])?;

        info!(topic, group = %settings.consumer_group_id, auto_commit = settings.auto_commit, "Subscribed to topic");

        Ok(Self {
            consumer,
            topic: topic.to_string(),
            auto_commit: settings.auto_commit,
            metrics,
            health: None,
        })
    }

    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    async fn report(&self, result: Result<(), String>) {
        let Some(health) = &self.health else {
            return;
        };
        match result {
            Ok(()) => health.set_healthy(components::CONSUMER).await,
            Err(message) => health.set_degraded(components::CONSUMER, message).await,
        }
    }

    /// Read messages until shutdown, one at a time
    pub async fn run(self, handler: Arc<dyn MessageHandler>, mut shutdown: broadcast::Receiver<()>) {
        info!(topic = %self.topic, "Starting consumer loop");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!(topic = %self.topic, "Consumer shutting down");
                    break;
                }

                received = tokio::time::timeout(POLL_TIMEOUT, self.consumer.recv()) => {
                    let message = match received {
                        // no message within the poll window
                        Err(_) => continue,
                        Ok(Err(e)) => {
                            error!(topic = %self.topic, error = %e, "Consumer error");
                            self.report(Err(e.to_string())).await;
                            continue;
                        }
                        Ok(Ok(message)) => message,
                    };

                    let detached = detach(&message);
                    self.metrics.inc_messages_consumed(&self.topic);
                    debug!(
                        topic = %self.topic,
                        partition = detached.partition,
                        offset = detached.offset,
                        "Message received"
                    );

                    let disposition = handler.handle(&detached).await;
                    match disposition {
                        Disposition::Commit if !self.auto_commit => {
                            if let Err(e) = self.consumer.commit_message(&message, CommitMode::Async) {
                                error!(topic = %self.topic, offset = detached.offset, error = %e, "Unable to commit offset");
                            }
                        }
                        Disposition::Commit => {}
                        Disposition::Defer => {
                            debug!(topic = %self.topic, offset = detached.offset, "Offset left uncommitted");
                        }
                    }
                    self.report(Ok(())).await;
                }
            }
        }
    }
}

/// Producer that waits for each delivery report
pub struct KafkaPublisher {
    producer: FutureProducer,
}

impl KafkaPublisher {
    pub fn new(settings: &KafkaSettings) -> Result<Self, BusError> {
        let producer: FutureProducer = client_config(settings)
            .set("message.timeout.ms", DELIVERY_TIMEOUT.as_millis().to_string())
            .create()?;
        Ok(Self { producer })
    }
}

#[async_trait]
impl Publisher for KafkaPublisher {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), BusError> {
        let record = FutureRecord::to(topic).key(key).payload(payload);
        match self.producer.send(record, DELIVERY_TIMEOUT).await {
            Ok((partition, offset)) => {
                debug!(topic, key, partition, offset, "Message delivered");
                Ok(())
            }
            Err((e, _)) => {
                warn!(topic, key, error = %e, "Message delivery failed");
                Err(BusError::Delivery {
                    topic: topic.to_string(),
                    message: e.to_string(),
                })
            }
        }
    }
}
