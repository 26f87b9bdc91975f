//! Message broker abstraction for the dispatch service.
//!
//! The dispatcher only relies on topic semantics:
//!
//! - `publish` appends a message to a topic
//! - every consumer group sees every message of a topic
//! - subscribers sharing a group compete for messages
//! - a message is acknowledged once handled; delivery is at-least-once
//! - an unacknowledged message is handed out again, either right away after
//!   [`Subscription::release`] or once it has sat idle past the broker's
//!   redelivery timeout (its consumer crashed or stalled)
//!
//! [`RedisStreamsBroker`] maps topics onto Redis Streams. [`InMemoryBroker`]
//! keeps everything in process and adds inspection and failure injection for
//! tests.

mod error;
mod memory;
mod redis_streams;

pub use error::{BrokerError, BrokerResult};
pub use memory::InMemoryBroker;
pub use redis_streams::{RedisStreamsBroker, RedisStreamsConfig};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

/// A message read from a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    /// Broker-assigned message ID (e.g. a stream entry ID).
    pub id: String,
    pub topic: String,
    pub payload: Vec<u8>,
}

impl BrokerMessage {
    /// Decode the payload as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> BrokerResult<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Publishing side of the broker, plus subscription factory.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Append `payload` to `topic`, returning the message ID.
    async fn publish(&self, topic: &str, payload: &[u8]) -> BrokerResult<String>;

    /// Join consumer group `group` on `topic`, creating the group if needed.
    async fn subscribe(&self, topic: &str, group: &str) -> BrokerResult<Box<dyn Subscription>>;
}

/// One consumer's view of a topic within a group.
#[async_trait]
pub trait Subscription: Send {
    fn topic(&self) -> &str;

    /// Wait a bounded time for the next message. `None` means nothing arrived;
    /// callers loop, checking for shutdown between calls.
    async fn next(&mut self) -> BrokerResult<Option<BrokerMessage>>;

    /// Acknowledge a handled message.
    async fn ack(&mut self, message: &BrokerMessage) -> BrokerResult<()>;

    /// Give a message back unhandled. It stays pending and is read again
    /// before new messages.
    async fn release(&mut self, message: &BrokerMessage) -> BrokerResult<()>;
}

/// Shared broker handle.
pub type BrokerHandle = Arc<dyn Broker>;

/// Serialize `body` as JSON and publish it.
pub async fn publish_json<T: Serialize + ?Sized>(
    broker: &dyn Broker,
    topic: &str,
    body: &T,
) -> BrokerResult<String> {
    let payload = serde_json::to_vec(body)?;
    broker.publish(topic, &payload).await
}
