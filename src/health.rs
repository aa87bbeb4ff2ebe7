//! Health monitor — connection status, last error, uptime, counters
//!
//! Counters are fed by the bus; `last_error` is kept current by a background
//! task listening to the transport's error events.

use crate::transport::Transport;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Instant;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

/// Accumulated counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthMetrics {
    pub publishes: u64,
    pub errors: u64,
}

/// Point-in-time health projection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub connected: bool,
    pub transport_status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub uptime_ms: u64,
    pub metrics: HealthMetrics,
}

/// Passive observer of one transport connection
pub struct HealthMonitor {
    transport: Arc<dyn Transport>,
    started_at: Instant,
    publishes: AtomicU64,
    errors: AtomicU64,
    last_error: RwLock<Option<String>>,
    shutdown: CancellationToken,
}

impl HealthMonitor {
    /// Create a monitor and subscribe to the transport's error events
    ///
    /// Must be called inside a tokio runtime; the listener task ends when the
    /// monitor is dropped or the transport's event channel closes.
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        Self::spawn(transport).0
    }

    pub(crate) fn spawn(transport: Arc<dyn Transport>) -> (Arc<Self>, JoinHandle<()>) {
        let events = BroadcastStream::new(transport.subscribe_errors());
        let shutdown = CancellationToken::new();
        let monitor = Arc::new(Self {
            transport,
            started_at: Instant::now(),
            publishes: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            last_error: RwLock::new(None),
            shutdown: shutdown.clone(),
        });

        let listener = tokio::spawn(listen_for_errors(
            Arc::downgrade(&monitor),
            events,
            shutdown,
        ));
        (monitor, listener)
    }

    pub fn record_publish(&self) {
        self.publishes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an error and remember its message
    pub fn record_error_message(&self, message: impl Into<String>) {
        self.record_error();
        *self.last_error.write().unwrap_or_else(|e| e.into_inner()) = Some(message.into());
    }

    pub fn metrics(&self) -> HealthMetrics {
        HealthMetrics {
            publishes: self.publishes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Answer a liveness query
    ///
    /// A `ready` transport is confirmed with a ping; if the ping fails the
    /// snapshot reports `connected: false` and status `error` whatever the
    /// transport claims.
    pub async fn health(&self) -> HealthSnapshot {
        let status = self.transport.status();

        let (connected, transport_status) = if status.is_ready() {
            match self.transport.ping().await {
                Ok(()) => (true, status.as_str().to_string()),
                Err(e) => {
                    tracing::warn!(error = %e, "Health ping failed");
                    *self.last_error.write().unwrap_or_else(|e| e.into_inner()) =
                        Some(e.to_string());
                    (false, "error".to_string())
                }
            }
        } else {
            (false, status.as_str().to_string())
        };

        HealthSnapshot {
            connected,
            transport_status,
            last_error: self.last_error(),
            uptime_ms: self.started_at.elapsed().as_millis() as u64,
            metrics: self.metrics(),
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn listen_for_errors(
    monitor: Weak<HealthMonitor>,
    mut events: BroadcastStream<String>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.next() => event,
        };
        let Some(event) = event else {
            break;
        };
        let Some(monitor) = monitor.upgrade() else {
            break;
        };
        match event {
            Ok(message) => {
                tracing::debug!(error = %message, "Transport error event");
                monitor.record_error_message(message);
            }
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Health monitor lagged behind transport errors");
            }
        }
    }
}
