//! Stream registry — logical stream ids to physical keys and schemas
//!
//! The registry is built once at startup and is read-only afterwards, so
//! lookups need no locking. It is passed to each `MessageBus` explicitly,
//! which lets tests substitute their own schema set.

use crate::error::{BusError, Result};
use crate::payloads::{
    ChainEvent, OrderFilled, OrderRequest, PositionLiquidated, PriceUpdate, RiskAlert,
};
use crate::schema::{Payload, Schema, TypedSchema};
use crate::types::StreamId;
use std::collections::HashMap;
use std::sync::Arc;

/// Resolution result for a registered stream
#[derive(Clone)]
pub struct StreamBinding {
    /// Logical id (e.g. `price.update`)
    pub stream: StreamId,

    /// Key used by the transport (e.g. `price:update`)
    pub physical_key: String,

    /// Validator every message on this stream must satisfy
    pub schema: Arc<dyn Schema>,
}

impl std::fmt::Debug for StreamBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamBinding")
            .field("stream", &self.stream)
            .field("physical_key", &self.physical_key)
            .field("schema", &self.schema.name())
            .finish()
    }
}

/// Immutable mapping of stream ids to bindings
#[derive(Debug)]
pub struct StreamRegistry {
    bindings: HashMap<StreamId, StreamBinding>,
}

impl StreamRegistry {
    pub fn builder() -> StreamRegistryBuilder {
        StreamRegistryBuilder::default()
    }

    /// Registry with the trading platform's stream table
    pub fn trading() -> Self {
        let bindings = [
            binding::<PriceUpdate>("price.update", "price:update"),
            binding::<OrderRequest>("order.request", "order:request"),
            binding::<OrderFilled>("order.filled", "order:filled"),
            binding::<PositionLiquidated>("position.liquidated", "position:liquidated"),
            binding::<ChainEvent>("chain.event", "chain:event"),
            binding::<RiskAlert>("risk.alert", "risk:alert"),
        ];

        Self {
            bindings: bindings
                .into_iter()
                .map(|b| (b.stream.clone(), b))
                .collect(),
        }
    }

    /// Look up a stream, failing with `UnknownStream` if it is not registered
    pub fn resolve(&self, stream: &str) -> Result<&StreamBinding> {
        self.bindings
            .get(stream)
            .ok_or_else(|| BusError::UnknownStream(stream.to_string()))
    }

    pub fn contains(&self, stream: &str) -> bool {
        self.bindings.contains_key(stream)
    }

    /// Registered stream ids, sorted
    pub fn streams(&self) -> Vec<StreamId> {
        let mut ids: Vec<StreamId> = self.bindings.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

fn binding<T: Payload>(stream: &str, physical_key: &str) -> StreamBinding {
    StreamBinding {
        stream: StreamId::new(stream),
        physical_key: physical_key.to_string(),
        schema: Arc::new(TypedSchema::<T>::new(stream)),
    }
}

/// Builder for a custom `StreamRegistry`
#[derive(Default)]
pub struct StreamRegistryBuilder {
    bindings: Vec<StreamBinding>,
}

impl StreamRegistryBuilder {
    /// Register a stream with an arbitrary schema
    pub fn stream(
        mut self,
        stream: impl Into<String>,
        physical_key: impl Into<String>,
        schema: impl Schema + 'static,
    ) -> Self {
        self.bindings.push(StreamBinding {
            stream: StreamId::new(stream),
            physical_key: physical_key.into(),
            schema: Arc::new(schema),
        });
        self
    }

    /// Register a stream validated by a serde payload type
    pub fn typed<T: Payload>(self, stream: impl Into<String>, physical_key: impl Into<String>) -> Self {
        let stream = stream.into();
        let schema = TypedSchema::<T>::new(stream.clone());
        self.stream(stream, physical_key, schema)
    }

    /// Validate and freeze the table
    ///
    /// Rejects empty names and duplicate stream ids or physical keys.
    pub fn build(self) -> Result<StreamRegistry> {
        let mut bindings = HashMap::with_capacity(self.bindings.len());
        let mut keys = std::collections::HashSet::new();

        for b in self.bindings {
            if b.stream.as_str().is_empty() || b.physical_key.is_empty() {
                return Err(BusError::Config(
                    "Stream id and physical key cannot be empty".to_string(),
                ));
            }
            if !keys.insert(b.physical_key.clone()) {
                return Err(BusError::Config(format!(
                    "Physical key '{}' registered twice",
                    b.physical_key
                )));
            }
            if bindings.contains_key(&b.stream) {
                return Err(BusError::Config(format!(
                    "Stream '{}' registered twice",
                    b.stream
                )));
            }
            bindings.insert(b.stream.clone(), b);
        }

        Ok(StreamRegistry { bindings })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldSchema;

    #[test]
    fn test_trading_table() {
        let reg = StreamRegistry::trading();
        let binding = reg.resolve("price.update").unwrap();
        assert_eq!(binding.physical_key, "price:update");
        assert_eq!(binding.schema.name(), "price.update");

        assert!(reg.contains("order.request"));
        assert!(reg.contains("position.liquidated"));
        assert_eq!(reg.len(), 6);
    }

    #[test]
    fn test_resolve_unknown_stream() {
        let reg = StreamRegistry::trading();
        let err = reg.resolve("price.updates").unwrap_err();
        assert!(matches!(err, BusError::UnknownStream(ref s) if s == "price.updates"));
    }

    #[test]
    fn test_builder_custom_schema() {
        let reg = StreamRegistry::builder()
            .stream("test.event", "test:event", FieldSchema::new("test.event", &["id"]))
            .typed::<PriceUpdate>("test.price", "test:price")
            .build()
            .unwrap();

        assert_eq!(reg.streams(), vec![StreamId::new("test.event"), StreamId::new("test.price")]);
        let binding = reg.resolve("test.event").unwrap();
        assert!(binding.schema.validate(&serde_json::json!({})).is_err());
    }

    #[test]
    fn test_builder_rejects_duplicates() {
        let dup_stream = StreamRegistry::builder()
            .stream("a", "a:1", FieldSchema::new("a", &[]))
            .stream("a", "a:2", FieldSchema::new("a", &[]))
            .build();
        assert!(dup_stream.is_err());

        let dup_key = StreamRegistry::builder()
            .stream("a", "k", FieldSchema::new("a", &[]))
            .stream("b", "k", FieldSchema::new("b", &[]))
            .build();
        assert!(dup_key.is_err());
    }

    #[test]
    fn test_builder_rejects_empty_names() {
        let result = StreamRegistry::builder()
            .stream("", "k", FieldSchema::new("x", &[]))
            .build();
        assert!(matches!(result, Err(BusError::Config(_))));
    }

    #[test]
    fn test_concurrent_lookups() {
        let reg = Arc::new(StreamRegistry::trading());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let reg = reg.clone();
                std::thread::spawn(move || reg.resolve("order.request").map(|b| b.physical_key.clone()))
            })
            .collect();

        for h in handles {
            assert_eq!(h.join().unwrap().unwrap(), "order:request");
        }
    }
}
