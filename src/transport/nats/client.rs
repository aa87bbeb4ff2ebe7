//! NATS JetStream client — streams per key, durable pull consumers per group

use super::config::{NatsConfig, StorageType};
use crate::error::{BusError, Result};
use crate::types::{GroupStart, RawEntry};
use async_nats::jetstream;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Shortest pull request expiry; the server treats zero as "no expiry"
const MIN_FETCH_WAIT: Duration = Duration::from_millis(10);

/// Delivered-but-unacknowledged messages by (key, group, id)
///
/// Acks go through the message handle, so it is kept until the bus
/// acknowledges the id. After `max_age` the server has redelivered the
/// message, possibly to another process, and the handle is dropped.
struct InFlight<M> {
    max_age: Duration,
    entries: HashMap<(String, String, String), (Instant, M)>,
}

impl<M> InFlight<M> {
    fn new(max_age: Duration) -> Self {
        Self {
            max_age,
            entries: HashMap::new(),
        }
    }

    /// Track a delivery; a redelivery of the same id replaces the old handle
    fn insert(&mut self, key: &str, group: &str, id: String, msg: M) {
        self.entries.insert(
            (key.to_string(), group.to_string(), id),
            (Instant::now(), msg),
        );
    }

    fn take(&mut self, key: &str, group: &str, id: &str) -> Option<M> {
        self.entries
            .remove(&(key.to_string(), group.to_string(), id.to_string()))
            .map(|(_, msg)| msg)
    }

    /// Drop handles older than `max_age`, returning how many were dropped
    fn prune(&mut self) -> usize {
        let before = self.entries.len();
        let max_age = self.max_age;
        self.entries.retain(|_, (at, _)| at.elapsed() < max_age);
        before - self.entries.len()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Connected JetStream client
///
/// Owns the NATS connection plus the per-key streams, per-group consumers and
/// the in-flight message handles.
pub struct NatsClient {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    config: Arc<NatsConfig>,
    streams: Mutex<HashSet<String>>,
    consumers: Mutex<HashMap<(String, String), jetstream::consumer::PullConsumer>>,
    in_flight: Mutex<InFlight<jetstream::Message>>,
}

impl NatsClient {
    /// Open one connection with the given options
    pub async fn connect(
        url: &str,
        options: async_nats::ConnectOptions,
        config: Arc<NatsConfig>,
    ) -> Result<Self> {
        let client = options
            .connect(url)
            .await
            .map_err(|e| BusError::Connection(format!("{}: {}", url, e)))?;

        tracing::info!(url = %url, "Connected to NATS");

        let jetstream = jetstream::new(client.clone());
        let ack_wait = Duration::from_secs(config.ack_wait_secs);
        Ok(Self {
            client,
            jetstream,
            config,
            streams: Mutex::new(HashSet::new()),
            consumers: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(InFlight::new(ack_wait)),
        })
    }

    /// Publish a body to a key's subject, returning the stream sequence
    pub async fn publish(&self, key: &str, body: bytes::Bytes) -> Result<u64> {
        self.ensure_stream_cached(key).await?;
        let subject = self.config.subject_for(key);

        let ack = self
            .jetstream
            .publish(subject.clone(), body)
            .await
            .map_err(|e| BusError::Publish {
                stream: key.to_string(),
                reason: e.to_string(),
            })?
            .await
            .map_err(|e| BusError::Publish {
                stream: key.to_string(),
                reason: format!("ack failed: {}", e),
            })?;

        tracing::debug!(stream = key, subject = %subject, sequence = ack.sequence, "Message appended");
        Ok(ack.sequence)
    }

    /// Create the durable consumer for a group if missing
    pub async fn ensure_consumer(&self, key: &str, group: &str, start: GroupStart) -> Result<()> {
        let stream = self.ensure_stream(key).await?;
        let name = self.config.consumer_name_for(group);

        let deliver_policy = match start {
            GroupStart::Beginning => jetstream::consumer::DeliverPolicy::All,
            GroupStart::New => jetstream::consumer::DeliverPolicy::New,
        };

        let consumer = stream
            .get_or_create_consumer(
                &name,
                jetstream::consumer::pull::Config {
                    durable_name: Some(name.clone()),
                    filter_subject: self.config.subject_for(key),
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    ack_wait: Duration::from_secs(self.config.ack_wait_secs),
                    deliver_policy,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| {
                BusError::Consumer(format!("Failed to create durable consumer '{}': {}", name, e))
            })?;

        self.consumers
            .lock()
            .await
            .insert((key.to_string(), group.to_string()), consumer);

        tracing::info!(stream = key, group, consumer = %name, "Consumer group ready");
        Ok(())
    }

    /// Fetch up to `count` messages for a group, waiting at most `block`
    pub async fn fetch(
        &self,
        key: &str,
        group: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<RawEntry>> {
        let consumer = self
            .consumers
            .lock()
            .await
            .get(&(key.to_string(), group.to_string()))
            .cloned()
            .ok_or_else(|| {
                BusError::Consumer(format!("No consumer group '{}' for stream '{}'", group, key))
            })?;

        let batch = consumer
            .fetch()
            .max_messages(count)
            .expires(block.max(MIN_FETCH_WAIT))
            .messages()
            .await
            .map_err(|e| BusError::Consumer(format!("Failed to fetch from '{}': {}", key, e)))?;

        {
            let mut in_flight = self.in_flight.lock().await;
            let dropped = in_flight.prune();
            if dropped > 0 {
                tracing::debug!(
                    stream = key,
                    dropped,
                    remaining = in_flight.len(),
                    "Dropped expired in-flight messages"
                );
            }
        }

        let mut batch = std::pin::pin!(batch);
        let mut entries = Vec::new();
        while let Some(msg) = batch.next().await {
            let msg = match msg {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::warn!(stream = key, error = %e, "Error fetching message");
                    break;
                }
            };

            let (sequence, delivered) = match msg.info() {
                Ok(info) => (info.stream_sequence, info.delivered.max(1) as u64),
                Err(e) => {
                    tracing::warn!(stream = key, error = %e, "Message without JetStream metadata");
                    continue;
                }
            };

            let id = sequence.to_string();
            entries.push(RawEntry {
                id: id.clone(),
                body: msg.payload.clone(),
                delivery_count: delivered,
            });
            self.in_flight.lock().await.insert(key, group, id, msg);
        }

        Ok(entries)
    }

    /// Acknowledge delivered messages by id
    pub async fn ack(&self, key: &str, group: &str, ids: &[String]) -> Result<u64> {
        let mut acked = 0;
        for id in ids {
            let msg = self.in_flight.lock().await.take(key, group, id);

            if let Some(msg) = msg {
                msg.ack()
                    .await
                    .map_err(|e| BusError::Ack(format!("{} on '{}': {}", id, key, e)))?;
                acked += 1;
            }
        }
        Ok(acked)
    }

    /// Number of messages stored for a key
    pub async fn stream_len(&self, key: &str) -> Result<u64> {
        let mut stream = self.ensure_stream(key).await?;
        let info = stream
            .info()
            .await
            .map_err(|e| BusError::Stream(format!("Failed to get stream info: {}", e)))?;
        Ok(info.state.messages)
    }

    /// Round-trip to the server
    pub async fn ping(&self) -> Result<()> {
        let timeout = Duration::from_secs(self.config.request_timeout_secs);
        tokio::time::timeout(timeout, self.client.flush())
            .await
            .map_err(|_| BusError::Timeout(format!("ping after {}s", timeout.as_secs())))?
            .map_err(|e| BusError::Connection(format!("ping failed: {}", e)))
    }

    /// Flush buffered publishes
    pub async fn flush(&self) -> Result<()> {
        self.client
            .flush()
            .await
            .map_err(|e| BusError::Connection(format!("flush failed: {}", e)))
    }

    pub fn config(&self) -> &NatsConfig {
        &self.config
    }

    async fn ensure_stream_cached(&self, key: &str) -> Result<()> {
        if self.streams.lock().await.contains(key) {
            return Ok(());
        }
        self.ensure_stream(key).await?;
        self.streams.lock().await.insert(key.to_string());
        Ok(())
    }

    async fn ensure_stream(&self, key: &str) -> Result<jetstream::stream::Stream> {
        let name = self.config.stream_name_for(key);
        let storage = match self.config.storage {
            StorageType::File => jetstream::stream::StorageType::File,
            StorageType::Memory => jetstream::stream::StorageType::Memory,
        };

        let stream = self
            .jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: name.clone(),
                subjects: vec![self.config.subject_for(key)],
                storage,
                max_messages: self.config.max_messages,
                max_bytes: self.config.max_bytes,
                max_age: Duration::from_secs(self.config.max_age_secs),
                retention: jetstream::stream::RetentionPolicy::Limits,
                ..Default::default()
            })
            .await
            .map_err(|e| BusError::Stream(format!("Failed to create/get stream '{}': {}", name, e)))?;

        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_tracks_unacked_deliveries() {
        let mut in_flight = InFlight::new(Duration::from_secs(30));
        in_flight.insert("price:update", "g1", "1".to_string(), ());
        in_flight.insert("price:update", "g1", "2".to_string(), ());
        assert!(in_flight.take("price:update", "g1", "1").is_some());
        assert!(in_flight.take("price:update", "g1", "1").is_none());
        assert_eq!(in_flight.len(), 1);

        // Redelivery replaces rather than duplicates
        in_flight.insert("price:update", "g1", "2".to_string(), ());
        assert_eq!(in_flight.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_drops_failed_deliveries_after_ack_wait() {
        let mut in_flight = InFlight::new(Duration::from_secs(30));
        // Handler failed on every one of these; none is ever acked
        for id in 0..100 {
            in_flight.insert("order:request", "exec", id.to_string(), ());
        }
        assert_eq!(in_flight.prune(), 0);

        tokio::time::advance(Duration::from_secs(20)).await;
        in_flight.insert("order:request", "exec", "fresh".to_string(), ());

        tokio::time::advance(Duration::from_secs(15)).await;
        assert_eq!(in_flight.prune(), 100);
        assert_eq!(in_flight.len(), 1);
        assert!(in_flight.take("order:request", "exec", "fresh").is_some());
    }
}
