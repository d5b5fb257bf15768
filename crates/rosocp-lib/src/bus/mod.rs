//! Message bus plumbing
//!
//! Consumers hand each message to a [`MessageHandler`] and commit its offset
//! only when the handler returns [`Disposition::Commit`]. With auto-commit
//! disabled this gives at-least-once delivery; a deferred message is read
//! again after a rebalance or restart.

pub mod kafka;

pub use kafka::{KafkaConsumer, KafkaPublisher};

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("kafka client error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("delivery to {topic} failed: {message}")]
    Delivery { topic: String, message: String },

    #[error("cannot encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A consumed message, detached from the client that read it
#[derive(Debug, Clone, Default)]
pub struct BusMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub headers: HashMap<String, String>,
    pub payload: Vec<u8>,
}

impl BusMessage {
    /// Convenience constructor for a bare payload
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// What the consumer should do with the offset of a handled message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Commit,
    /// Leave the offset uncommitted so the message is redelivered
    Defer,
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &BusMessage) -> Disposition;
}

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish and wait for the broker acknowledgement
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), BusError>;
}

/// Serialize `value` as JSON and publish it
pub async fn publish_json<T: Serialize + Sync>(
    publisher: &dyn Publisher,
    topic: &str,
    key: &str,
    value: &T,
) -> Result<(), BusError> {
    let payload = serde_json::to_vec(value)?;
    publisher.publish(topic, key, &payload).await
}
