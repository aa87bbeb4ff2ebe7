//! Bus configuration

use crate::breaker::BreakerConfig;
use crate::error::{BusError, Result};
use crate::types::ConsumeOptions;
use serde::{Deserialize, Serialize};

/// Configuration for a `MessageBus`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BusConfig {
    /// Transport endpoint; also the circuit breaker target
    pub url: String,

    /// HMAC key for signing published messages and verifying consumed ones
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signing_key: Option<String>,

    pub breaker: BreakerConfig,

    /// Connect when the bus is created; otherwise on first use
    pub auto_connect: bool,

    /// Defaults applied by `consume_default`
    pub consume: ConsumeOptions,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            signing_key: None,
            breaker: BreakerConfig::default(),
            auto_connect: true,
            consume: ConsumeOptions::default(),
        }
    }
}

impl BusConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_signing_key(mut self, key: impl Into<String>) -> Self {
        self.signing_key = Some(key.into());
        self
    }

    pub fn with_auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(BusError::Config("url must not be empty".to_string()));
        }
        if self.breaker.max_failures > self.breaker.max_attempts {
            return Err(BusError::Config(format!(
                "breaker maxFailures ({}) exceeds maxAttempts ({})",
                self.breaker.max_failures, self.breaker.max_attempts
            )));
        }
        if self.breaker.base_delay_ms == 0 {
            return Err(BusError::Config("breaker baseDelayMs must be positive".to_string()));
        }
        if matches!(&self.signing_key, Some(k) if k.is_empty()) {
            return Err(BusError::Config("signingKey must not be empty".to_string()));
        }
        if self.consume.batch_size == 0 {
            return Err(BusError::Config("consume batchSize must be positive".to_string()));
        }
        Ok(())
    }
}
