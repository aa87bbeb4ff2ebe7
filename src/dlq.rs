//! Dead letter queue — park messages a consumer can never process
//!
//! Poison messages (undecodable body, payload failing the stream schema,
//! bad signature) and messages whose handler failed `max_deliver` times are
//! handed to a `DeadLetterHandler` and then acknowledged, so they stop
//! blocking the consumer group.

use crate::error::Result;
use crate::types::StreamId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use tokio::sync::RwLock;

/// Why a message was dead-lettered
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "detail")]
pub enum DeadLetterReason {
    /// Body is not a valid stored message
    Undecodable(String),
    /// Payload no longer satisfies the stream schema
    SchemaViolation(String),
    /// Missing or mismatching signature
    BadSignature(String),
    /// Handler failed on every allowed delivery
    MaxDeliveries { deliveries: u64, last_error: String },
}

impl std::fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeadLetterReason::Undecodable(e) => write!(f, "undecodable: {}", e),
            DeadLetterReason::SchemaViolation(e) => write!(f, "schema violation: {}", e),
            DeadLetterReason::BadSignature(e) => write!(f, "bad signature: {}", e),
            DeadLetterReason::MaxDeliveries {
                deliveries,
                last_error,
            } => write!(f, "handler failed {} times: {}", deliveries, last_error),
        }
    }
}

/// A message removed from its consumer group
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub stream: StreamId,
    pub group: String,
    /// Transport-assigned id
    pub id: String,
    /// Raw stored body, kept as-is since it may not decode
    #[serde(skip)]
    pub body: bytes::Bytes,
    pub delivery_count: u64,
    pub reason: DeadLetterReason,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(
        stream: StreamId,
        group: impl Into<String>,
        id: impl Into<String>,
        body: bytes::Bytes,
        delivery_count: u64,
        reason: DeadLetterReason,
    ) -> Self {
        Self {
            stream,
            group: group.into(),
            id: id.into(),
            body,
            delivery_count,
            reason,
            dead_lettered_at: Utc::now(),
        }
    }

    /// Body as UTF-8 text, lossy
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Destination for dead-lettered messages
///
/// If `handle` fails the message is left unacknowledged and will be offered
/// again on the next pending replay.
#[async_trait]
pub trait DeadLetterHandler: Send + Sync {
    async fn handle(&self, letter: DeadLetter) -> Result<()>;

    /// Number of messages currently held
    async fn count(&self) -> Result<usize>;

    /// Most recent messages first
    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>>;
}

/// Bounded in-memory dead letter queue; the oldest entries are dropped first
pub struct MemoryDeadLetterQueue {
    letters: RwLock<VecDeque<DeadLetter>>,
    capacity: usize,
}

impl MemoryDeadLetterQueue {
    /// `capacity` of 0 means unbounded
    pub fn new(capacity: usize) -> Self {
        Self {
            letters: RwLock::new(VecDeque::new()),
            capacity,
        }
    }
}

impl Default for MemoryDeadLetterQueue {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl DeadLetterHandler for MemoryDeadLetterQueue {
    async fn handle(&self, letter: DeadLetter) -> Result<()> {
        tracing::warn!(
            stream = %letter.stream,
            group = %letter.group,
            id = %letter.id,
            delivery_count = letter.delivery_count,
            reason = %letter.reason,
            "Message dead-lettered"
        );

        let mut letters = self.letters.write().await;
        letters.push_back(letter);
        while self.capacity > 0 && letters.len() > self.capacity {
            letters.pop_front();
        }
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.letters.read().await.len())
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let letters = self.letters.read().await;
        Ok(letters.iter().rev().take(limit).cloned().collect())
    }
}

/// Whether a failed delivery has used up its attempts
pub fn should_dead_letter(delivery_count: u64, max_deliver: Option<u64>) -> bool {
    matches!(max_deliver, Some(max) if max > 0 && delivery_count >= max)
}
