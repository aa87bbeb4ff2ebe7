//! NATS JetStream transport
//!
//! Implements `Transport` on NATS JetStream: one stream per physical key, a
//! durable pull consumer per consumer group, explicit acks. Reconnect delays
//! come from the `RetryStrategy`, both for the initial connection and for
//! the client's own reconnect loop.

mod client;
mod config;

pub use client::NatsClient;
pub use config::{NatsConfig, StorageType};

use super::{ConnectionStatus, GroupRead, Transport};
use crate::error::{BusError, Result};
use crate::retry::RetryStrategy;
use crate::types::{GroupStart, RawEntry, ReadCursor};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Status shared with the connection event callback
#[derive(Debug)]
struct StatusCell(AtomicU8);

impl StatusCell {
    fn new(status: ConnectionStatus) -> Self {
        Self(AtomicU8::new(status as u8))
    }

    fn get(&self) -> ConnectionStatus {
        match self.0.load(Ordering::Acquire) {
            0 => ConnectionStatus::Disconnected,
            1 => ConnectionStatus::Connecting,
            2 => ConnectionStatus::Ready,
            3 => ConnectionStatus::Reconnecting,
            _ => ConnectionStatus::Closed,
        }
    }

    /// Record `status` unless the transport is already closed; `Closed` is final
    fn set(&self, status: ConnectionStatus) {
        let closed = ConnectionStatus::Closed as u8;
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != closed).then_some(status as u8)
            });
    }
}

/// NATS JetStream transport
pub struct NatsTransport {
    url: String,
    config: Arc<NatsConfig>,
    retry: RetryStrategy,
    status: Arc<StatusCell>,
    errors: broadcast::Sender<String>,
    client: Mutex<Option<Arc<NatsClient>>>,
    shutdown: CancellationToken,
}

impl NatsTransport {
    pub fn new(url: impl Into<String>, config: NatsConfig, retry: RetryStrategy) -> Self {
        let (errors, _) = broadcast::channel(64);
        Self {
            url: url.into(),
            config: Arc::new(config),
            retry,
            status: Arc::new(StatusCell::new(ConnectionStatus::Disconnected)),
            errors,
            client: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn config(&self) -> &NatsConfig {
        &self.config
    }

    /// The connected client, if any
    pub fn client(&self) -> Option<Arc<NatsClient>> {
        self.client.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn connected(&self) -> Result<Arc<NatsClient>> {
        if self.shutdown.is_cancelled() {
            return Err(BusError::Connection("transport closed".to_string()));
        }
        self.client()
            .ok_or_else(|| BusError::Connection(format!("not connected to {}", self.url)))
    }

    fn connect_options(&self) -> async_nats::ConnectOptions {
        let status = self.status.clone();
        let errors = self.errors.clone();
        let retry = self.retry.clone();

        let mut opts = async_nats::ConnectOptions::new()
            .connection_timeout(Duration::from_secs(self.config.connect_timeout_secs))
            .request_timeout(Some(Duration::from_secs(self.config.request_timeout_secs)))
            .reconnect_delay_callback(self.retry.clone().into_callback())
            .event_callback(move |event| {
                let status = status.clone();
                let errors = errors.clone();
                let retry = retry.clone();
                async move {
                    match event {
                        async_nats::Event::Connected => {
                            status.set(ConnectionStatus::Ready);
                            retry.on_connected();
                            tracing::info!("NATS connection restored");
                        }
                        async_nats::Event::Disconnected => {
                            status.set(ConnectionStatus::Reconnecting);
                            let _ = errors.send("disconnected from NATS".to_string());
                            tracing::warn!("NATS connection lost");
                        }
                        async_nats::Event::ServerError(e) => {
                            let _ = errors.send(format!("server error: {}", e));
                            tracing::warn!(error = %e, "NATS server error");
                        }
                        async_nats::Event::ClientError(e) => {
                            let _ = errors.send(format!("client error: {}", e));
                            tracing::warn!(error = %e, "NATS client error");
                        }
                        other => {
                            tracing::debug!(event = ?other, "NATS connection event");
                        }
                    }
                }
            });

        if let Some(ref token) = self.config.token {
            opts = opts.token(token.clone());
        }

        opts
    }
}

#[async_trait]
impl Transport for NatsTransport {
    async fn connect(&self) -> Result<()> {
        if self.client().is_some() {
            return Ok(());
        }

        self.status.set(ConnectionStatus::Connecting);
        let mut attempt: u32 = 0;

        loop {
            match NatsClient::connect(&self.url, self.connect_options(), self.config.clone()).await {
                Ok(_) if self.shutdown.is_cancelled() => {
                    return Err(BusError::Connection("transport closed".to_string()));
                }
                Ok(client) => {
                    self.retry.on_connected();
                    self.status.set(ConnectionStatus::Ready);
                    *self.client.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(client));
                    return Ok(());
                }
                Err(_) if self.shutdown.is_cancelled() => {
                    return Err(BusError::Connection("transport closed".to_string()));
                }
                Err(e) => {
                    attempt += 1;
                    let delay = self.retry.delay_for(attempt);
                    let _ = self.errors.send(e.to_string());
                    self.status.set(ConnectionStatus::Reconnecting);
                    tracing::warn!(
                        url = %self.url,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "NATS connect failed, retrying"
                    );

                    tokio::select! {
                        _ = self.shutdown.cancelled() => {
                            return Err(BusError::Connection("transport closed".to_string()));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn append(&self, key: &str, body: bytes::Bytes) -> Result<String> {
        let client = self.connected()?;
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(BusError::Connection("transport closed".to_string())),
            seq = client.publish(key, body) => seq.map(|s| s.to_string()),
        }
    }

    async fn ensure_group(&self, key: &str, group: &str, start: GroupStart) -> Result<()> {
        self.connected()?.ensure_consumer(key, group, start).await
    }

    async fn read_group(&self, read: &GroupRead<'_>) -> Result<Vec<RawEntry>> {
        // The server redelivers unacknowledged messages itself after ack_wait
        if read.cursor == ReadCursor::Pending {
            return Ok(Vec::new());
        }

        let client = self.connected()?;
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(BusError::Connection("transport closed".to_string())),
            batch = client.fetch(read.key, read.group, read.count, read.block) => batch,
        }
    }

    async fn ack(&self, key: &str, group: &str, ids: &[String]) -> Result<u64> {
        self.connected()?.ack(key, group, ids).await
    }

    async fn stream_len(&self, key: &str) -> Result<u64> {
        self.connected()?.stream_len(key).await
    }

    async fn ping(&self) -> Result<()> {
        self.connected()?.ping().await
    }

    fn status(&self) -> ConnectionStatus {
        self.status.get()
    }

    fn subscribe_errors(&self) -> broadcast::Receiver<String> {
        self.errors.subscribe()
    }

    async fn close(&self) -> Result<()> {
        let client = self.client.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.status.set(ConnectionStatus::Closed);
        self.shutdown.cancel();

        if let Some(client) = client {
            client.flush().await?;
            tracing::info!(url = %self.url, "NATS connection closed");
        }
        Ok(())
    }

    fn force_close(&self) {
        self.shutdown.cancel();
        self.status.set(ConnectionStatus::Closed);
        if self
            .client
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .is_some()
        {
            tracing::warn!(url = %self.url, "NATS connection force-closed");
        }
    }

    fn name(&self) -> &str {
        "nats"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerConfig, BreakerRegistry};

    fn transport() -> NatsTransport {
        let retry = RetryStrategy::new(
            Arc::new(BreakerRegistry::new()),
            "nats://127.0.0.1:1",
            BreakerConfig::default(),
        );
        NatsTransport::new("nats://127.0.0.1:1", NatsConfig::default(), retry)
    }

    #[test]
    fn test_status_cell_roundtrip() {
        let cell = StatusCell::new(ConnectionStatus::Disconnected);
        for status in [
            ConnectionStatus::Connecting,
            ConnectionStatus::Ready,
            ConnectionStatus::Reconnecting,
            ConnectionStatus::Disconnected,
        ] {
            cell.set(status);
            assert_eq!(cell.get(), status);
        }
    }

    #[test]
    fn test_status_cell_closed_is_final() {
        let cell = StatusCell::new(ConnectionStatus::Ready);
        cell.set(ConnectionStatus::Closed);
        for status in [
            ConnectionStatus::Ready,
            ConnectionStatus::Reconnecting,
            ConnectionStatus::Connecting,
        ] {
            cell.set(status);
            assert_eq!(cell.get(), ConnectionStatus::Closed);
        }
    }

    #[tokio::test]
    async fn test_operations_before_connect_fail() {
        let t = transport();
        assert_eq!(t.status(), ConnectionStatus::Disconnected);
        assert!(matches!(t.ping().await, Err(BusError::Connection(_))));
        assert!(t.append("price:update", bytes::Bytes::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_force_close_stops_connect_loop() {
        let t = Arc::new(transport());
        let connecting = {
            let t = t.clone();
            tokio::spawn(async move { t.connect().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        t.force_close();

        let result = tokio::time::timeout(Duration::from_secs(10), connecting)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_err());
        assert_eq!(t.status(), ConnectionStatus::Closed);
    }
}
