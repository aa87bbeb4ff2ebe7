//! Core message types for the trading bus
//!
//! All wire types use camelCase JSON serialization.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio_util::sync::CancellationToken;

/// Logical stream identifier (e.g., `price.update`, `order.request`)
///
/// Every identifier handed to `publish`/`consume` must be registered in the
/// `StreamRegistry`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StreamId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl std::borrow::Borrow<str> for StreamId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for StreamId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A published message as seen by consumers
///
/// The `id` is assigned by the transport at append time; the envelope is
/// never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    /// Transport-assigned sequence token
    pub id: String,

    /// Canonical payload, already validated against the stream schema
    pub payload: serde_json::Value,

    /// When the producer published the message
    pub published_at: DateTime<Utc>,

    /// Base64 HMAC-SHA256 over the signed content, if the producer had a key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// Body stored in the transport for each appended message
///
/// The transport owns the id, so it is not part of the stored body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub payload: serde_json::Value,
    pub published_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl StoredMessage {
    pub fn into_envelope(self, id: impl Into<String>) -> MessageEnvelope {
        MessageEnvelope {
            id: id.into(),
            payload: self.payload,
            published_at: self.published_at,
            signature: self.signature,
        }
    }
}

/// An entry read from the transport before decoding
#[derive(Debug, Clone)]
pub struct RawEntry {
    /// Transport-assigned id
    pub id: String,

    /// Serialized `StoredMessage`
    pub body: bytes::Bytes,

    /// How many times this entry has been delivered to the group (1 on first delivery)
    pub delivery_count: u64,
}

/// A decoded message handed to a consumer handler
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    /// The message envelope
    pub envelope: MessageEnvelope,

    /// Logical stream the message was read from
    pub stream: StreamId,

    /// Consumer group name
    pub group: String,

    /// Consumer name within the group
    pub consumer: String,

    /// Number of delivery attempts, including this one
    pub delivery_count: u64,

    cancellation: CancellationToken,
}

impl ReceivedMessage {
    pub fn new(
        envelope: MessageEnvelope,
        stream: StreamId,
        group: impl Into<String>,
        consumer: impl Into<String>,
        delivery_count: u64,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            envelope,
            stream,
            group: group.into(),
            consumer: consumer.into(),
            delivery_count,
            cancellation,
        }
    }

    pub fn id(&self) -> &str {
        &self.envelope.id
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.envelope.payload
    }

    /// Deserialize the payload into a typed value
    pub fn decode<T: DeserializeOwned>(&self) -> crate::Result<T> {
        serde_json::from_value(self.envelope.payload.clone()).map_err(Into::into)
    }

    /// True once the bus (or this consumer) has been asked to shut down
    ///
    /// Long-running handlers should check this, or await `cancelled()`,
    /// so that `close` does not have to force-terminate them.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves when shutdown has been requested
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }
}

/// Where a newly created consumer group starts reading
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GroupStart {
    /// Deliver everything already in the stream
    #[default]
    Beginning,
    /// Deliver only messages appended after the group is created
    New,
}

/// Which entries a group read returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadCursor {
    /// Entries never delivered to the group
    New,
    /// Entries already delivered to this consumer but not yet acknowledged
    Pending,
}

/// Options for a consume loop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConsumeOptions {
    /// Upper bound for one blocking read, in milliseconds
    pub block_ms: u64,

    /// Maximum entries fetched per read
    pub batch_size: usize,

    /// Start position when the group is created by this call
    pub start: GroupStart,

    /// Dead-letter a message once its handler has failed this many deliveries
    ///
    /// `None` leaves failed messages pending indefinitely.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_deliver: Option<u64>,

    /// Pause after a failed read before trying again, in milliseconds
    pub error_backoff_ms: u64,

    /// Re-deliver this consumer's unacknowledged entries before reading new ones
    pub replay_pending: bool,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            block_ms: 5_000,
            batch_size: 10,
            start: GroupStart::Beginning,
            max_deliver: None,
            error_backoff_ms: 1_000,
            replay_pending: true,
        }
    }
}

impl ConsumeOptions {
    pub fn with_block_ms(mut self, block_ms: u64) -> Self {
        self.block_ms = block_ms;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_deliver(mut self, max_deliver: u64) -> Self {
        self.max_deliver = Some(max_deliver);
        self
    }
}
