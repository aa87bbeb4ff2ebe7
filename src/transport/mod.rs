//! Transport trait — the durable, ordered log underneath the bus
//!
//! A transport keeps one append-only log per physical stream key and tracks
//! consumer-group cursors. All backends (NATS JetStream, in-memory, etc.)
//! implement `Transport` so the bus never depends on a specific technology.

use crate::error::Result;
use crate::types::{GroupStart, RawEntry, ReadCursor};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;

pub mod memory;
pub mod nats;

/// Connection status reported by the transport itself
///
/// Self-reported status can lag actual reachability; the health monitor
/// confirms `Ready` with a ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Never connected
    Disconnected,
    /// First connection in progress
    Connecting,
    /// Connected and usable
    Ready,
    /// Connection lost, reconnect loop running
    Reconnecting,
    /// Closed for good
    Closed,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Ready => "ready",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Closed => "closed",
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, ConnectionStatus::Ready)
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A consumer-group read request
#[derive(Debug, Clone)]
pub struct GroupRead<'a> {
    pub key: &'a str,
    pub group: &'a str,
    pub consumer: &'a str,
    pub cursor: ReadCursor,
    pub count: usize,
    /// Longest time to wait for new entries; never unbounded
    pub block: Duration,
}

/// Core trait for stream transports
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the connection, retrying through the transport's reconnect hook
    async fn connect(&self) -> Result<()>;

    /// Append a message body to the stream, returning the assigned id
    async fn append(&self, key: &str, body: bytes::Bytes) -> Result<String>;

    /// Create the consumer group if it does not exist (idempotent)
    async fn ensure_group(&self, key: &str, group: &str, start: GroupStart) -> Result<()>;

    /// Read entries as `consumer` within `group`, waiting at most `block`
    ///
    /// Returns an empty batch on timeout. `ReadCursor::New` assigns the
    /// returned entries to the consumer as pending.
    async fn read_group(&self, read: &GroupRead<'_>) -> Result<Vec<RawEntry>>;

    /// Acknowledge processed ids, returning how many were pending
    async fn ack(&self, key: &str, group: &str, ids: &[String]) -> Result<u64>;

    /// Number of entries in the stream
    async fn stream_len(&self, key: &str) -> Result<u64>;

    /// Lightweight liveness check
    async fn ping(&self) -> Result<()>;

    /// Self-reported connection status
    fn status(&self) -> ConnectionStatus;

    /// Subscribe to connection error events
    fn subscribe_errors(&self) -> broadcast::Receiver<String>;

    /// Close after letting in-flight requests finish
    async fn close(&self) -> Result<()>;

    /// Tear the connection down immediately
    ///
    /// Any read or append in flight fails with a connection error.
    fn force_close(&self);

    /// Transport name (e.g., "nats", "memory")
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_strings() {
        assert_eq!(ConnectionStatus::Ready.to_string(), "ready");
        assert_eq!(ConnectionStatus::Reconnecting.as_str(), "reconnecting");
        assert!(ConnectionStatus::Ready.is_ready());
        assert!(!ConnectionStatus::Connecting.is_ready());
        assert_eq!(
            serde_json::to_string(&ConnectionStatus::Closed).unwrap(),
            "\"closed\""
        );
    }
}
