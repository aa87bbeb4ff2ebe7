//! Message bus — validated publish and consumer-group consume over a transport
//!
//! `MessageBus` is the single entry point for producers and consumers. Every
//! publish is resolved against the `StreamRegistry` and validated by the
//! stream's schema before the transport is touched; every consume loop runs
//! on its own task and can be stopped individually or all at once by `close`.

use crate::breaker::BreakerRegistry;
use crate::config::BusConfig;
use crate::crypto::MessageSigner;
use crate::dlq::{should_dead_letter, DeadLetter, DeadLetterHandler, DeadLetterReason};
use crate::error::{BusError, Result};
use crate::health::{HealthMonitor, HealthSnapshot};
use crate::registry::{StreamBinding, StreamRegistry};
use crate::retry::RetryStrategy;
use crate::transport::nats::{NatsConfig, NatsTransport};
use crate::transport::{ConnectionStatus, GroupRead, Transport};
use crate::types::{
    ConsumeOptions, MessageEnvelope, RawEntry, ReadCursor, ReceivedMessage, StoredMessage,
    StreamId,
};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Bus state as observed by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BusState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Open,
    Closing,
    Closed,
}

/// Processes messages delivered to a consume loop
///
/// Returning `Err` leaves the message unacknowledged; it stays pending for
/// the consumer and is offered again after `error_backoff_ms`.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: ReceivedMessage) -> Result<()>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(ReceivedMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, message: ReceivedMessage) -> Result<()> {
        (self)(message).await
    }
}

/// Handle to one running consume loop
#[derive(Debug, Clone)]
pub struct ConsumerHandle {
    stream: StreamId,
    group: String,
    consumer: String,
    token: CancellationToken,
}

impl ConsumerHandle {
    /// Ask this loop to exit at its next read boundary
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn stream(&self) -> &StreamId {
        &self.stream
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }
}

/// Schema-validated message bus over a shared transport connection
pub struct MessageBus {
    id: String,
    config: BusConfig,
    registry: Arc<StreamRegistry>,
    transport: Arc<dyn Transport>,
    health: Arc<HealthMonitor>,
    signer: Option<MessageSigner>,
    dead_letters: Option<Arc<dyn DeadLetterHandler>>,
    connected: OnceCell<()>,
    lifecycle: Mutex<Lifecycle>,
    shutdown: CancellationToken,
    consumers: Mutex<Vec<JoinHandle<()>>>,
}

impl MessageBus {
    /// Create a bus over `transport`
    ///
    /// With `auto_connect` the connection is established before returning;
    /// otherwise the first publish or consume connects.
    pub async fn new(
        config: BusConfig,
        registry: Arc<StreamRegistry>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;
        let signer = config
            .signing_key
            .as_deref()
            .map(MessageSigner::new)
            .transpose()?;

        let bus = Self {
            id: uuid::Uuid::new_v4().to_string(),
            health: HealthMonitor::new(transport.clone()),
            config,
            registry,
            transport,
            signer,
            dead_letters: None,
            connected: OnceCell::new(),
            lifecycle: Mutex::new(Lifecycle::Open),
            shutdown: CancellationToken::new(),
            consumers: Mutex::new(Vec::new()),
        };

        tracing::info!(
            bus = %bus.id,
            transport = bus.transport.name(),
            url = %bus.config.url,
            streams = bus.registry.len(),
            "Message bus created"
        );

        if bus.config.auto_connect {
            bus.ensure_connected().await?;
        }
        Ok(bus)
    }

    /// Create a bus on NATS JetStream
    ///
    /// Reconnect delays come from the breaker registered for `config.url` in
    /// `breakers`, so buses sharing a registry share breaker state.
    pub async fn connect_nats(
        config: BusConfig,
        nats: NatsConfig,
        registry: Arc<StreamRegistry>,
        breakers: Arc<BreakerRegistry>,
    ) -> Result<Self> {
        config.validate()?;
        let retry = RetryStrategy::new(breakers, config.url.clone(), config.breaker.clone());
        let transport = Arc::new(NatsTransport::new(config.url.clone(), nats, retry));
        Self::new(config, registry, transport).await
    }

    /// Replace the signer derived from `signing_key`
    pub fn with_signer(mut self, signer: MessageSigner) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Route poison and exhausted messages to `handler`
    pub fn with_dead_letter(mut self, handler: Arc<dyn DeadLetterHandler>) -> Self {
        self.dead_letters = Some(handler);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn registry(&self) -> &StreamRegistry {
        &self.registry
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub fn dead_letter_queue(&self) -> Option<&Arc<dyn DeadLetterHandler>> {
        self.dead_letters.as_ref()
    }

    /// Current state
    ///
    /// While open this follows the transport: a connection that dropped and
    /// is being retried reads as `Disconnected`.
    pub fn state(&self) -> BusState {
        match self.lifecycle() {
            Lifecycle::Closing => BusState::Closing,
            Lifecycle::Closed => BusState::Closed,
            Lifecycle::Open => match self.transport.status() {
                ConnectionStatus::Ready => BusState::Connected,
                ConnectionStatus::Connecting => BusState::Connecting,
                ConnectionStatus::Disconnected | ConnectionStatus::Reconnecting => {
                    BusState::Disconnected
                }
                ConnectionStatus::Closed => BusState::Closed,
            },
        }
    }

    pub async fn health(&self) -> HealthSnapshot {
        self.health.health().await
    }

    /// Validate `payload` against the stream's schema and append it
    ///
    /// Returns the transport-assigned id. An unknown stream or a rejected
    /// payload fails before any transport I/O.
    pub async fn publish(&self, stream: &str, payload: &serde_json::Value) -> Result<String> {
        let binding = self.registry.resolve(stream)?;
        let canonical =
            binding
                .schema
                .validate(payload)
                .map_err(|reason| BusError::SchemaValidation {
                    stream: stream.to_string(),
                    reason,
                })?;

        self.ensure_connected().await?;

        let published_at = Utc::now();
        let signature = match &self.signer {
            Some(signer) => Some(signer.sign(&binding.physical_key, published_at, &canonical)?),
            None => None,
        };
        let body = serde_json::to_vec(&StoredMessage {
            payload: canonical,
            published_at,
            signature,
        })?;

        match self
            .transport
            .append(&binding.physical_key, bytes::Bytes::from(body))
            .await
        {
            Ok(id) => {
                self.health.record_publish();
                tracing::debug!(stream = %binding.stream, key = %binding.physical_key, id = %id, "Message published");
                Ok(id)
            }
            Err(e) => {
                self.health.record_error();
                tracing::warn!(stream = %binding.stream, error = %e, "Publish failed");
                Err(e)
            }
        }
    }

    /// Serialize a typed payload and publish it
    pub async fn publish_typed<T: Serialize>(&self, stream: &str, payload: &T) -> Result<String> {
        let value = serde_json::to_value(payload)?;
        self.publish(stream, &value).await
    }

    /// Start a consume loop for `consumer` in `group` on `stream`
    ///
    /// The group is created if missing. The loop runs until its handle is
    /// stopped or the bus is closed.
    pub async fn consume<H>(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        handler: H,
        options: ConsumeOptions,
    ) -> Result<ConsumerHandle>
    where
        H: MessageHandler + 'static,
    {
        let binding = self.registry.resolve(stream)?.clone();
        if group.is_empty() || consumer.is_empty() {
            return Err(BusError::Config(
                "group and consumer names must not be empty".to_string(),
            ));
        }
        if options.batch_size == 0 {
            return Err(BusError::Config("batchSize must be positive".to_string()));
        }

        self.ensure_connected().await?;
        self.transport
            .ensure_group(&binding.physical_key, group, options.start)
            .await?;

        let token = self.shutdown.child_token();
        let handle = ConsumerHandle {
            stream: binding.stream.clone(),
            group: group.to_string(),
            consumer: consumer.to_string(),
            token: token.clone(),
        };
        let worker = ConsumeLoop {
            transport: self.transport.clone(),
            health: self.health.clone(),
            signer: self.signer.clone(),
            dead_letters: self.dead_letters.clone(),
            binding,
            group: group.to_string(),
            consumer: consumer.to_string(),
            options,
            token,
        };

        {
            let mut consumers = self.consumers.lock().unwrap_or_else(|e| e.into_inner());
            // close() drains this list after leaving Open, so check under the lock
            if self.lifecycle() != Lifecycle::Open {
                handle.stop();
                return Err(BusError::Closed);
            }
            consumers.retain(|task| !task.is_finished());
            consumers.push(tokio::spawn(worker.run(handler)));
        }

        Ok(handle)
    }

    /// `consume` with the options from `BusConfig::consume`
    pub async fn consume_default<H>(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        handler: H,
    ) -> Result<ConsumerHandle>
    where
        H: MessageHandler + 'static,
    {
        let options = self.config.consume.clone();
        self.consume(stream, group, consumer, handler, options).await
    }

    /// Number of entries stored for a stream
    pub async fn stream_len(&self, stream: &str) -> Result<u64> {
        let binding = self.registry.resolve(stream)?;
        self.ensure_connected().await?;
        self.transport.stream_len(&binding.physical_key).await
    }

    /// Stop all consume loops and close the connection
    ///
    /// Loops get `grace` to finish their current message. Loops still
    /// running after that are aborted and the connection is force-closed;
    /// the timeout is logged, never returned. Calling `close` again is a
    /// no-op.
    pub async fn close(&self, grace: Duration) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
            if *lifecycle != Lifecycle::Open {
                return Ok(());
            }
            *lifecycle = Lifecycle::Closing;
        }

        let deadline = Instant::now() + grace;
        self.shutdown.cancel();

        let mut tasks = std::mem::take(&mut *self.consumers.lock().unwrap_or_else(|e| e.into_inner()));
        tracing::info!(bus = %self.id, consumers = tasks.len(), grace_ms = grace.as_millis() as u64, "Closing message bus");

        let drained =
            tokio::time::timeout_at(deadline, futures::future::join_all(tasks.iter_mut()))
                .await
                .is_ok();

        if drained {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, self.transport.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(bus = %self.id, error = %e, "Transport close failed");
                }
                Err(_) => {
                    self.transport.force_close();
                    tracing::warn!(bus = %self.id, "Transport close timed out, forced");
                }
            }
        } else {
            let outstanding = tasks.iter().filter(|task| !task.is_finished()).count();
            for task in &tasks {
                task.abort();
            }
            self.transport.force_close();

            let err = BusError::ShutdownTimeout {
                grace_ms: grace.as_millis() as u64,
                outstanding,
            };
            tracing::warn!(bus = %self.id, error = %err, "Forced shutdown");
        }

        *self.lifecycle.lock().unwrap_or_else(|e| e.into_inner()) = Lifecycle::Closed;
        tracing::info!(bus = %self.id, "Message bus closed");
        Ok(())
    }

    /// Consumer name unique to this process, for fan-out style consumers
    pub fn unique_consumer_name(prefix: &str) -> String {
        format!("{}-{}", prefix, uuid::Uuid::new_v4().simple())
    }

    fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn ensure_connected(&self) -> Result<()> {
        if self.lifecycle() != Lifecycle::Open {
            return Err(BusError::Closed);
        }

        self.connected
            .get_or_try_init(|| async {
                tokio::select! {
                    _ = self.shutdown.cancelled() => Err(BusError::Closed),
                    connected = self.transport.connect() => connected,
                }
            })
            .await?;
        Ok(())
    }
}

impl Drop for MessageBus {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("id", &self.id)
            .field("transport", &self.transport.name())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Acked,
    Failed,
    DeadLettered,
    Rejected,
}

/// State owned by one consume task
struct ConsumeLoop {
    transport: Arc<dyn Transport>,
    health: Arc<HealthMonitor>,
    signer: Option<MessageSigner>,
    dead_letters: Option<Arc<dyn DeadLetterHandler>>,
    binding: StreamBinding,
    group: String,
    consumer: String,
    options: ConsumeOptions,
    token: CancellationToken,
}

impl ConsumeLoop {
    async fn run<H: MessageHandler>(self, handler: H) {
        tracing::info!(
            stream = %self.binding.stream,
            group = %self.group,
            consumer = %self.consumer,
            "Consumer started"
        );

        let backoff = Duration::from_millis(self.options.error_backoff_ms);
        // When to re-read this consumer's own unacknowledged entries
        let mut sweep_at = self.options.replay_pending.then(Instant::now);

        while !self.token.is_cancelled() {
            let sweep = matches!(sweep_at, Some(at) if at <= Instant::now());
            let read = if sweep {
                GroupRead {
                    key: &self.binding.physical_key,
                    group: &self.group,
                    consumer: &self.consumer,
                    cursor: ReadCursor::Pending,
                    count: usize::MAX,
                    block: Duration::ZERO,
                }
            } else {
                let mut block = Duration::from_millis(self.options.block_ms);
                if let Some(at) = sweep_at {
                    block = block.min(at.saturating_duration_since(Instant::now()));
                }
                GroupRead {
                    key: &self.binding.physical_key,
                    group: &self.group,
                    consumer: &self.consumer,
                    cursor: ReadCursor::New,
                    count: self.options.batch_size,
                    block,
                }
            };

            let batch = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                batch = self.transport.read_group(&read) => batch,
            };

            let batch = match batch {
                Ok(batch) => batch,
                Err(e) => {
                    if self.token.is_cancelled() {
                        break;
                    }
                    self.health.record_error();
                    tracing::warn!(
                        stream = %self.binding.stream,
                        group = %self.group,
                        consumer = %self.consumer,
                        error = %e,
                        "Consumer read failed"
                    );
                    tokio::select! {
                        _ = self.token.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    continue;
                }
            };

            if sweep {
                sweep_at = None;
            }

            let mut failed = false;
            for entry in batch {
                // Unprocessed entries stay pending for the next replay
                if self.token.is_cancelled() {
                    break;
                }
                if self.process(&handler, entry).await == Delivery::Failed {
                    failed = true;
                }
            }
            if failed && sweep_at.is_none() {
                sweep_at = Some(Instant::now() + backoff);
            }
        }

        tracing::info!(
            stream = %self.binding.stream,
            group = %self.group,
            consumer = %self.consumer,
            "Consumer stopped"
        );
    }

    async fn process<H: MessageHandler>(&self, handler: &H, entry: RawEntry) -> Delivery {
        let envelope = match self.open(&entry) {
            Ok(envelope) => envelope,
            Err(reason) => {
                self.health.record_error();
                return if self.dead_letter(entry, reason).await {
                    Delivery::DeadLettered
                } else {
                    Delivery::Rejected
                };
            }
        };

        let message = ReceivedMessage::new(
            envelope,
            self.binding.stream.clone(),
            &self.group,
            &self.consumer,
            entry.delivery_count,
            self.token.clone(),
        );

        match handler.handle(message).await {
            Ok(()) => {
                if self.ack(&entry.id).await {
                    Delivery::Acked
                } else {
                    Delivery::Failed
                }
            }
            Err(e) => {
                self.health.record_error();
                tracing::warn!(
                    stream = %self.binding.stream,
                    group = %self.group,
                    consumer = %self.consumer,
                    id = %entry.id,
                    delivery_count = entry.delivery_count,
                    error = %e,
                    "Handler failed, message left pending"
                );

                if should_dead_letter(entry.delivery_count, self.options.max_deliver) {
                    let reason = DeadLetterReason::MaxDeliveries {
                        deliveries: entry.delivery_count,
                        last_error: e.to_string(),
                    };
                    if self.dead_letter(entry, reason).await {
                        return Delivery::DeadLettered;
                    }
                }
                Delivery::Failed
            }
        }
    }

    /// Decode, authenticate and re-validate a stored entry
    fn open(&self, entry: &RawEntry) -> std::result::Result<MessageEnvelope, DeadLetterReason> {
        let stored: StoredMessage = serde_json::from_slice(&entry.body)
            .map_err(|e| DeadLetterReason::Undecodable(e.to_string()))?;

        if let Some(signer) = &self.signer {
            signer
                .verify(
                    &self.binding.physical_key,
                    stored.published_at,
                    &stored.payload,
                    stored.signature.as_deref(),
                )
                .map_err(|e| DeadLetterReason::BadSignature(e.to_string()))?;
        }

        let payload = self
            .binding
            .schema
            .validate(&stored.payload)
            .map_err(DeadLetterReason::SchemaViolation)?;

        Ok(MessageEnvelope {
            id: entry.id.clone(),
            payload,
            published_at: stored.published_at,
            signature: stored.signature,
        })
    }

    /// Hand an entry to the dead letter queue and acknowledge it
    ///
    /// Returns false if the entry is still pending.
    async fn dead_letter(&self, entry: RawEntry, reason: DeadLetterReason) -> bool {
        let Some(dead_letters) = &self.dead_letters else {
            tracing::warn!(
                stream = %self.binding.stream,
                group = %self.group,
                id = %entry.id,
                reason = %reason,
                "Unprocessable message left pending, no dead letter queue configured"
            );
            return false;
        };

        let id = entry.id.clone();
        let letter = DeadLetter::new(
            self.binding.stream.clone(),
            &self.group,
            entry.id,
            entry.body,
            entry.delivery_count,
            reason,
        );

        match dead_letters.handle(letter).await {
            Ok(()) => self.ack(&id).await,
            Err(e) => {
                self.health.record_error();
                tracing::warn!(
                    stream = %self.binding.stream,
                    group = %self.group,
                    id = %id,
                    error = %e,
                    "Dead letter handler failed, message left pending"
                );
                false
            }
        }
    }

    async fn ack(&self, id: &str) -> bool {
        match self
            .transport
            .ack(&self.binding.physical_key, &self.group, &[id.to_string()])
            .await
        {
            Ok(_) => {
                tracing::debug!(stream = %self.binding.stream, group = %self.group, id, "Message acknowledged");
                true
            }
            Err(e) => {
                self.health.record_error();
                tracing::warn!(
                    stream = %self.binding.stream,
                    group = %self.group,
                    id,
                    error = %e,
                    "Acknowledge failed, message left pending"
                );
                false
            }
        }
    }
}
