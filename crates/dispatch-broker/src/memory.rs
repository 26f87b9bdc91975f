//! In-process broker.
//!
//! Each consumer group gets its own queue. A group created after messages were
//! published starts from the oldest message still in the publish log, like a
//! stream group created at ID `0` on a capped stream. Unacknowledged messages
//! are tracked per group and handed out again once released, or once idle
//! past the redelivery timeout.

use crate::{Broker, BrokerError, BrokerMessage, BrokerResult, Subscription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::Instant;
use tracing::debug;

/// Default time `Subscription::next` waits before returning `None`.
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(200);

/// Default idle time after which an unacknowledged message is redelivered.
const DEFAULT_REDELIVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of published messages kept for late groups and inspection.
pub const DEFAULT_MAX_LOG_LEN: usize = 10_000;

#[derive(Clone)]
struct Entry {
    seq: u64,
    message: BrokerMessage,
}

struct Unacked {
    entry: Entry,
    handed_out_at: Instant,
    released: bool,
}

type UnackedMap = Arc<Mutex<HashMap<String, Unacked>>>;

struct Group {
    sender: mpsc::UnboundedSender<Entry>,
    receiver: Arc<AsyncMutex<mpsc::UnboundedReceiver<Entry>>>,
    unacked: UnackedMap,
}

#[derive(Default)]
struct State {
    next_id: u64,
    /// Most recent successfully published messages, oldest first.
    log: VecDeque<Entry>,
    /// topic -> group -> queue
    groups: HashMap<String, HashMap<String, Group>>,
    fail_next_publishes: usize,
    failed_publishes: usize,
}

/// Process-local [`Broker`].
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
    poll_timeout: Duration,
    redelivery_timeout: Duration,
    max_log_len: usize,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_poll_timeout(DEFAULT_POLL_TIMEOUT)
    }

    /// Broker whose subscriptions wait at most `poll_timeout` per `next` call.
    pub fn with_poll_timeout(poll_timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            poll_timeout,
            redelivery_timeout: DEFAULT_REDELIVERY_TIMEOUT,
            max_log_len: DEFAULT_MAX_LOG_LEN,
        }
    }

    /// Redeliver unacknowledged messages idle for at least `timeout`.
    pub fn redelivery_timeout(mut self, timeout: Duration) -> Self {
        self.redelivery_timeout = timeout;
        self
    }

    /// Keep at most `len` messages in the publish log.
    pub fn max_log_len(mut self, len: usize) -> Self {
        self.max_log_len = len;
        self
    }

    /// Make the next `n` publishes fail with [`BrokerError::Unavailable`].
    pub fn fail_next_publishes(&self, n: usize) {
        self.state.lock().fail_next_publishes = n;
    }

    /// Number of publishes rejected by [`Self::fail_next_publishes`].
    pub fn failed_publishes(&self) -> usize {
        self.state.lock().failed_publishes
    }

    /// Messages published to `topic` still in the log, oldest first.
    pub fn published(&self, topic: &str) -> Vec<BrokerMessage> {
        self.state
            .lock()
            .log
            .iter()
            .filter(|e| e.message.topic == topic)
            .map(|e| e.message.clone())
            .collect()
    }

    /// Decoded JSON bodies published to `topic`, oldest first.
    pub fn published_json(&self, topic: &str) -> Vec<serde_json::Value> {
        self.published(topic)
            .iter()
            .filter_map(|m| m.json().ok())
            .collect()
    }

    /// Messages handed to `group` on `topic` but not yet acknowledged.
    pub fn unacked(&self, topic: &str, group: &str) -> usize {
        self.state
            .lock()
            .groups
            .get(topic)
            .and_then(|groups| groups.get(group))
            .map(|g| g.unacked.lock().len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, topic: &str, payload: &[u8]) -> BrokerResult<String> {
        let mut state = self.state.lock();

        if state.fail_next_publishes > 0 {
            state.fail_next_publishes -= 1;
            state.failed_publishes += 1;
            return Err(BrokerError::Unavailable(format!(
                "injected publish failure on {topic}"
            )));
        }

        state.next_id += 1;
        let entry = Entry {
            seq: state.next_id,
            message: BrokerMessage {
                id: format!("{}-0", state.next_id),
                topic: topic.to_string(),
                payload: payload.to_vec(),
            },
        };

        if let Some(groups) = state.groups.get(topic) {
            for group in groups.values() {
                let _ = group.sender.send(entry.clone());
            }
        }
        state.log.push_back(entry.clone());
        while state.log.len() > self.max_log_len {
            state.log.pop_front();
        }

        debug!(topic, message_id = %entry.message.id, "Published message");
        Ok(entry.message.id)
    }

    async fn subscribe(&self, topic: &str, group: &str) -> BrokerResult<Box<dyn Subscription>> {
        let mut state = self.state.lock();

        let backlog: Vec<Entry> = state
            .log
            .iter()
            .filter(|e| e.message.topic == topic)
            .cloned()
            .collect();

        let entry = state
            .groups
            .entry(topic.to_string())
            .or_default()
            .entry(group.to_string())
            .or_insert_with(|| {
                let (sender, receiver) = mpsc::unbounded_channel();
                for message in backlog {
                    let _ = sender.send(message);
                }
                debug!(topic, group, "Created consumer group");
                Group {
                    sender,
                    receiver: Arc::new(AsyncMutex::new(receiver)),
                    unacked: Arc::new(Mutex::new(HashMap::new())),
                }
            });

        Ok(Box::new(MemorySubscription {
            topic: topic.to_string(),
            receiver: entry.receiver.clone(),
            unacked: entry.unacked.clone(),
            poll_timeout: self.poll_timeout,
            redelivery_timeout: self.redelivery_timeout,
        }))
    }
}

struct MemorySubscription {
    topic: String,
    receiver: Arc<AsyncMutex<mpsc::UnboundedReceiver<Entry>>>,
    unacked: UnackedMap,
    poll_timeout: Duration,
    redelivery_timeout: Duration,
}

impl MemorySubscription {
    /// Oldest pending message that was released or has sat idle too long.
    fn claim_pending(&self) -> Option<BrokerMessage> {
        let now = Instant::now();
        let mut unacked = self.unacked.lock();
        let pending = unacked
            .values_mut()
            .filter(|u| {
                u.released || now.duration_since(u.handed_out_at) >= self.redelivery_timeout
            })
            .min_by_key(|u| u.entry.seq)?;

        pending.handed_out_at = now;
        pending.released = false;
        debug!(topic = %self.topic, message_id = %pending.entry.message.id, "Redelivering message");
        Some(pending.entry.message.clone())
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn next(&mut self) -> BrokerResult<Option<BrokerMessage>> {
        if let Some(message) = self.claim_pending() {
            return Ok(Some(message));
        }

        let received = tokio::time::timeout(self.poll_timeout, async {
            self.receiver.lock().await.recv().await
        })
        .await;

        match received {
            Ok(Some(entry)) => {
                let message = entry.message.clone();
                self.unacked.lock().insert(
                    message.id.clone(),
                    Unacked {
                        entry,
                        handed_out_at: Instant::now(),
                        released: false,
                    },
                );
                Ok(Some(message))
            }
            Ok(None) => Err(BrokerError::Unavailable("broker dropped".to_string())),
            Err(_) => Ok(None),
        }
    }

    async fn ack(&mut self, message: &BrokerMessage) -> BrokerResult<()> {
        self.unacked.lock().remove(&message.id);
        Ok(())
    }

    async fn release(&mut self, message: &BrokerMessage) -> BrokerResult<()> {
        if let Some(pending) = self.unacked.lock().get_mut(&message.id) {
            pending.released = true;
        }
        Ok(())
    }
}
