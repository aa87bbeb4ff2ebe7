//! # trading-bus
//!
//! Schema-validated, consumer-group message bus for trading services.
//!
//! ## Overview
//!
//! `trading-bus` moves typed domain messages (price updates, order requests,
//! fills, liquidations, chain events, risk alerts) between services over a
//! durable stream transport. Every message is validated against its stream's
//! schema before it is written, consumers share work through consumer groups
//! with explicit acknowledgement, and reconnects are paced by a tiered
//! circuit breaker.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use trading_bus::{BusConfig, ConsumeOptions, MessageBus, ReceivedMessage, StreamRegistry};
//! use trading_bus::transport::memory::MemoryTransport;
//!
//! # async fn example() -> trading_bus::Result<()> {
//! let bus = MessageBus::new(
//!     BusConfig::new("memory://local"),
//!     Arc::new(StreamRegistry::trading()),
//!     Arc::new(MemoryTransport::default()),
//! )
//! .await?;
//!
//! bus.publish(
//!     "price.update",
//!     &serde_json::json!({"ticker": "SOL", "price": 150_000_000u64}),
//! )
//! .await?;
//!
//! bus.consume(
//!     "price.update",
//!     "pricing",
//!     "worker-1",
//!     |msg: ReceivedMessage| async move {
//!         println!("{} -> {}", msg.id(), msg.payload());
//!         Ok::<_, trading_bus::BusError>(())
//!     },
//!     ConsumeOptions::default(),
//! )
//! .await?;
//!
//! bus.close(Duration::from_secs(5)).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Transports
//!
//! - **memory** — In-process stream log with consumer groups and fault injection
//! - **nats** — NATS JetStream, one stream per key, durable pull consumer per group
//!
//! ## Architecture
//!
//! - **StreamRegistry** — logical stream id → physical key + schema
//! - **Schema** — pure payload validator returning the canonical payload
//! - **CircuitBreaker** / **RetryStrategy** — tiered reconnect delays per target
//! - **HealthMonitor** — connection status, last error, uptime, counters
//! - **MessageBus** — publish, consume, close

pub mod breaker;
pub mod bus;
pub mod config;
pub mod crypto;
pub mod dlq;
pub mod error;
pub mod health;
pub mod payloads;
pub mod registry;
pub mod retry;
pub mod schema;
pub mod transport;
pub mod types;

// Re-export core types
pub use breaker::{BreakerConfig, BreakerRegistry, BreakerState, BreakerTier, CircuitBreaker};
pub use bus::{BusState, ConsumerHandle, MessageBus, MessageHandler};
pub use config::BusConfig;
pub use crypto::MessageSigner;
pub use dlq::{DeadLetter, DeadLetterHandler, DeadLetterReason, MemoryDeadLetterQueue};
pub use error::{BusError, Result};
pub use health::{HealthMetrics, HealthMonitor, HealthSnapshot};
pub use registry::{StreamBinding, StreamRegistry, StreamRegistryBuilder};
pub use retry::RetryStrategy;
pub use schema::{FieldSchema, Payload, Schema, TypedSchema};
pub use transport::{ConnectionStatus, Transport};
pub use types::{
    ConsumeOptions, GroupStart, MessageEnvelope, ReceivedMessage, StreamId,
};

// Re-export transports for convenience
pub use transport::memory::{MemoryConfig, MemoryTransport};
pub use transport::nats::{NatsConfig, NatsTransport, StorageType};
