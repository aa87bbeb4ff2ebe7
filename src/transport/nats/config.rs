//! NATS JetStream transport configuration

use serde::{Deserialize, Serialize};

/// JetStream storage backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// Persist to disk
    #[default]
    File,
    /// Keep in server memory
    Memory,
}

/// Configuration for the NATS transport
///
/// Each physical stream key gets its own JetStream stream, so stream limits
/// apply per key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NatsConfig {
    /// Prefix for JetStream stream names (`BUS` → `BUS_PRICE_UPDATE`)
    pub stream_prefix: String,

    /// Prefix for subjects (`bus` → `bus.price.update`)
    pub subject_prefix: String,

    pub storage: StorageType,

    /// Maximum messages per stream (-1 = unlimited)
    pub max_messages: i64,

    /// Maximum bytes per stream (-1 = unlimited)
    pub max_bytes: i64,

    /// Maximum message age in seconds (0 = unlimited)
    pub max_age_secs: u64,

    pub connect_timeout_secs: u64,

    pub request_timeout_secs: u64,

    /// Time the server waits for an ack before redelivering
    pub ack_wait_secs: u64,

    /// Authentication token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            stream_prefix: "BUS".to_string(),
            subject_prefix: "bus".to_string(),
            storage: StorageType::File,
            max_messages: 1_000_000,
            max_bytes: -1,
            max_age_secs: 7 * 24 * 3600,
            connect_timeout_secs: 5,
            request_timeout_secs: 10,
            ack_wait_secs: 30,
            token: None,
        }
    }
}

impl NatsConfig {
    /// Subject for a physical key (`price:update` → `bus.price.update`)
    pub fn subject_for(&self, key: &str) -> String {
        format!("{}.{}", self.subject_prefix, key.replace(':', "."))
    }

    /// JetStream stream name for a physical key
    pub fn stream_name_for(&self, key: &str) -> String {
        format!("{}_{}", self.stream_prefix, sanitize(key).to_uppercase())
    }

    /// Durable consumer name for a group
    pub fn consumer_name_for(&self, group: &str) -> String {
        sanitize(group)
    }
}

/// Replace characters NATS does not allow in stream/consumer names
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NatsConfig::default();
        assert_eq!(config.stream_prefix, "BUS");
        assert_eq!(config.storage, StorageType::File);
        assert!(config.token.is_none());
    }

    #[test]
    fn test_naming() {
        let config = NatsConfig::default();
        assert_eq!(config.subject_for("price:update"), "bus.price.update");
        assert_eq!(config.stream_name_for("price:update"), "BUS_PRICE_UPDATE");
        assert_eq!(config.stream_name_for("position:liquidated"), "BUS_POSITION_LIQUIDATED");
        assert_eq!(config.consumer_name_for("risk.engine"), "risk_engine");
        assert_eq!(config.consumer_name_for("g1"), "g1");
    }

    #[test]
    fn test_partial_deserialize() {
        let config: NatsConfig =
            serde_json::from_str(r#"{"subjectPrefix": "test", "storage": "memory"}"#).unwrap();
        assert_eq!(config.subject_prefix, "test");
        assert_eq!(config.storage, StorageType::Memory);
        assert_eq!(config.ack_wait_secs, 30);
    }
}
