//! Redis Streams broker.
//!
//! One stream per topic. Messages are `XADD`ed with a single `payload` field,
//! consumer groups are created at ID `0` with `MKSTREAM`, reads use
//! `XREADGROUP ... BLOCK` and handled messages are `XACK`ed.
//!
//! Entries left pending by a consumer that died or restarted under another
//! name are taken over with a periodic `XAUTOCLAIM ... JUSTID` and then read
//! from this consumer's own pending list.
//!
//! Each subscription owns its own connection, since a blocking read stalls
//! every other command queued on the same connection.

use crate::{Broker, BrokerError, BrokerMessage, BrokerResult, Subscription};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, RedisResult};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Stream entry field holding the message body.
const PAYLOAD_FIELD: &str = "payload";

/// Maximum entries taken over by one `XAUTOCLAIM`.
const CLAIM_BATCH: usize = 100;

/// Redis Streams broker configuration.
#[derive(Debug, Clone)]
pub struct RedisStreamsConfig {
    /// Redis connection URL.
    pub redis_url: String,
    /// Consumer name within every group this process joins.
    pub consumer_name: String,
    /// How long a single XREADGROUP blocks.
    pub block_timeout: Duration,
    /// Approximate cap on stream length (`XADD MAXLEN ~`).
    pub max_stream_len: usize,
    /// Idle time after which another consumer's pending entry is claimed.
    /// Also the interval between claim passes.
    pub claim_idle: Duration,
}

impl RedisStreamsConfig {
    pub fn new(redis_url: impl Into<String>, consumer_name: impl Into<String>) -> Self {
        Self {
            redis_url: redis_url.into(),
            consumer_name: consumer_name.into(),
            block_timeout: Duration::from_millis(1_000),
            max_stream_len: 100_000,
            claim_idle: Duration::from_secs(30),
        }
    }
}

/// [`Broker`] backed by Redis Streams.
pub struct RedisStreamsBroker {
    client: Client,
    conn: Mutex<MultiplexedConnection>,
    config: RedisStreamsConfig,
}

impl RedisStreamsBroker {
    /// Connect to Redis.
    pub async fn connect(config: RedisStreamsConfig) -> BrokerResult<Self> {
        let client = Client::open(config.redis_url.as_str())?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!(consumer = %config.consumer_name, "Connected to Redis");

        Ok(Self {
            client,
            conn: Mutex::new(conn),
            config,
        })
    }

    async fn reconnect(&self) -> BrokerResult<()> {
        info!("Reconnecting to Redis...");
        let fresh = self.client.get_multiplexed_async_connection().await?;
        *self.conn.lock().await = fresh;
        Ok(())
    }
}

#[async_trait]
impl Broker for RedisStreamsBroker {
    async fn publish(&self, topic: &str, payload: &[u8]) -> BrokerResult<String> {
        let mut conn = self.conn.lock().await.clone();

        // XADD key MAXLEN ~ n * field value
        let result: RedisResult<String> = redis::cmd("XADD")
            .arg(topic)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.config.max_stream_len)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(payload)
            .query_async(&mut conn)
            .await;

        match result {
            Ok(id) => {
                debug!(topic, message_id = %id, "Published message");
                Ok(id)
            }
            Err(e) => {
                let err = BrokerError::from(e);
                if err.is_connection_error() {
                    if let Err(reconnect_err) = self.reconnect().await {
                        warn!(error = %reconnect_err, "Redis reconnect failed");
                    }
                }
                Err(err)
            }
        }
    }

    async fn subscribe(&self, topic: &str, group: &str) -> BrokerResult<Box<dyn Subscription>> {
        let conn = self.client.get_multiplexed_async_connection().await?;
        let subscription = RedisSubscription {
            client: self.client.clone(),
            conn,
            topic: topic.to_string(),
            group: group.to_string(),
            consumer: self.config.consumer_name.clone(),
            block_ms: self.config.block_timeout.as_millis() as u64,
            claim_idle: self.config.claim_idle,
            last_claim: None,
            reading_backlog: true,
            needs_reconnect: false,
        };
        subscription.ensure_consumer_group().await?;
        Ok(Box::new(subscription))
    }
}

struct RedisSubscription {
    client: Client,
    conn: MultiplexedConnection,
    topic: String,
    group: String,
    consumer: String,
    block_ms: u64,
    claim_idle: Duration,
    last_claim: Option<Instant>,
    /// Re-read this consumer's own un-acked entries (ID `0`) before new ones.
    reading_backlog: bool,
    needs_reconnect: bool,
}

impl RedisSubscription {
    /// Ensure the consumer group exists, creating it if necessary.
    async fn ensure_consumer_group(&self) -> BrokerResult<()> {
        // XGROUP CREATE key group 0 MKSTREAM: a new group sees the whole stream.
        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.topic)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut self.conn.clone())
            .await;

        match result {
            Ok(()) => {
                info!(stream = %self.topic, group = %self.group, "Created consumer group");
                Ok(())
            }
            // BUSYGROUP means the group already exists, which is fine
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(stream = %self.topic, group = %self.group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn reconnect(&mut self) -> BrokerResult<()> {
        info!(stream = %self.topic, "Reconnecting subscription to Redis...");
        self.conn = self.client.get_multiplexed_async_connection().await?;
        self.ensure_consumer_group().await?;
        self.reading_backlog = true;
        self.needs_reconnect = false;
        Ok(())
    }

    fn claim_due(&self) -> bool {
        self.last_claim
            .map_or(true, |at| at.elapsed() >= self.claim_idle)
    }

    /// Move entries idle longer than `claim_idle` into this consumer's
    /// pending list. Returns how many were claimed.
    async fn claim_stale(&mut self) -> BrokerResult<usize> {
        // XAUTOCLAIM key group consumer min-idle 0-0 COUNT n JUSTID
        let value: redis::Value = redis::cmd("XAUTOCLAIM")
            .arg(&self.topic)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(self.claim_idle.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(CLAIM_BATCH)
            .arg("JUSTID")
            .query_async(&mut self.conn)
            .await?;
        parse_xautoclaim_count(value)
    }

    async fn read(&mut self, start_id: &str, block: bool) -> BrokerResult<Option<BrokerMessage>> {
        // XREADGROUP GROUP g c COUNT 1 [BLOCK ms] STREAMS key id
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(1);
        if block {
            cmd.arg("BLOCK").arg(self.block_ms);
        }
        cmd.arg("STREAMS").arg(&self.topic).arg(start_id);

        let value: redis::Value = cmd.query_async(&mut self.conn).await?;
        parse_xreadgroup_response(&self.topic, value)
    }
}

#[async_trait]
impl Subscription for RedisSubscription {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn next(&mut self) -> BrokerResult<Option<BrokerMessage>> {
        if self.needs_reconnect {
            self.reconnect().await?;
        }

        if self.claim_due() {
            self.last_claim = Some(Instant::now());
            match self.claim_stale().await {
                Ok(0) => {}
                Ok(claimed) => {
                    info!(
                        stream = %self.topic,
                        group = %self.group,
                        claimed,
                        "Claimed stale pending entries"
                    );
                    self.reading_backlog = true;
                }
                Err(e) => warn!(stream = %self.topic, error = %e, "XAUTOCLAIM failed"),
            }
        }

        if self.reading_backlog {
            match self.read("0", false).await {
                Ok(Some(message)) => return Ok(Some(message)),
                Ok(None) => self.reading_backlog = false,
                Err(e) => {
                    warn!(stream = %self.topic, error = %e, "Skipping pending-entry backlog");
                    self.reading_backlog = false;
                }
            }
        }

        match self.read(">", true).await {
            Ok(message) => Ok(message),
            Err(e) => {
                if e.is_connection_error() {
                    self.needs_reconnect = true;
                }
                Err(e)
            }
        }
    }

    async fn ack(&mut self, message: &BrokerMessage) -> BrokerResult<()> {
        let result: i64 = self
            .conn
            .xack(&self.topic, &self.group, &[message.id.as_str()])
            .await?;

        if result == 1 {
            debug!(message_id = %message.id, stream = %self.topic, "Acknowledged message");
        } else {
            warn!(
                message_id = %message.id,
                stream = %self.topic,
                "XACK returned {}, message may not exist",
                result
            );
        }
        Ok(())
    }

    async fn release(&mut self, message: &BrokerMessage) -> BrokerResult<()> {
        // Still in our pending list; the next read starts from ID 0.
        debug!(message_id = %message.id, stream = %self.topic, "Released message");
        self.reading_backlog = true;
        Ok(())
    }
}

/// Count the entry IDs in an `XAUTOCLAIM ... JUSTID` reply.
///
/// Reply shape: `[next_cursor, [id, ...], [deleted_id, ...]]` (the last
/// element is absent before Redis 7).
fn parse_xautoclaim_count(value: redis::Value) -> BrokerResult<usize> {
    let parts = match value {
        redis::Value::Array(parts) => parts,
        other => {
            return Err(BrokerError::Protocol(format!(
                "Unexpected XAUTOCLAIM response type: {other:?}"
            )))
        }
    };
    match parts.get(1) {
        Some(redis::Value::Array(ids)) => Ok(ids.len()),
        _ => Err(BrokerError::Protocol(
            "Expected array of claimed IDs".to_string(),
        )),
    }
}

/// Extract the first entry from an XREADGROUP reply.
///
/// Reply shape: `[[stream_key, [[message_id, [field, value, ...]], ...]]]`.
/// A block timeout replies `Nil`; an empty backlog replies with no entries.
fn parse_xreadgroup_response(
    topic: &str,
    value: redis::Value,
) -> BrokerResult<Option<BrokerMessage>> {
    let streams = match value {
        redis::Value::Array(streams) => streams,
        redis::Value::Nil => return Ok(None),
        other => {
            return Err(BrokerError::Protocol(format!(
                "Unexpected XREADGROUP response type: {other:?}"
            )))
        }
    };

    let Some(stream) = streams.first() else {
        return Ok(None);
    };
    let redis::Value::Array(stream) = stream else {
        return Err(BrokerError::Protocol("Expected array for stream entry".to_string()));
    };
    let Some(redis::Value::Array(messages)) = stream.get(1) else {
        return Err(BrokerError::Protocol("Expected array for messages".to_string()));
    };
    let Some(message) = messages.first() else {
        return Ok(None);
    };
    let redis::Value::Array(message) = message else {
        return Err(BrokerError::Protocol("Expected array for message".to_string()));
    };
    if message.len() < 2 {
        return Err(BrokerError::Protocol("Message entry too short".to_string()));
    }

    let id = value_to_string(&message[0]).ok_or_else(|| {
        BrokerError::Protocol(format!("Expected string for message ID, got {:?}", message[0]))
    })?;

    let redis::Value::Array(fields) = &message[1] else {
        return Err(BrokerError::Protocol(format!(
            "Message {id} has no fields (trimmed?)"
        )));
    };

    let payload = fields
        .chunks(2)
        .find(|pair| pair.len() == 2 && value_to_string(&pair[0]).as_deref() == Some(PAYLOAD_FIELD))
        .and_then(|pair| match &pair[1] {
            redis::Value::BulkString(bytes) => Some(bytes.clone()),
            redis::Value::SimpleString(s) => Some(s.as_bytes().to_vec()),
            _ => None,
        })
        .ok_or_else(|| BrokerError::Protocol(format!("Message {id} missing payload field")))?;

    debug!(message_id = %id, stream = %topic, payload_len = payload.len(), "Read message from stream");

    Ok(Some(BrokerMessage {
        id,
        topic: topic.to_string(),
        payload,
    }))
}

fn value_to_string(value: &redis::Value) -> Option<String> {
    match value {
        redis::Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).to_string()),
        redis::Value::SimpleString(s) => Some(s.clone()),
        _ => None,
    }
}
