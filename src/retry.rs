//! Reconnect hook — maps "reconnect attempt N" to a delay via the breaker

use crate::breaker::{BreakerConfig, BreakerRegistry, CircuitBreaker};
use std::sync::Arc;
use std::time::Duration;

/// Retry strategy handed to a transport's reconnect loop
///
/// Holds only the breaker registry handle and the target it speaks for;
/// all delay decisions are made by the target's `CircuitBreaker`.
#[derive(Debug, Clone)]
pub struct RetryStrategy {
    breakers: Arc<BreakerRegistry>,
    target: String,
    config: BreakerConfig,
}

impl RetryStrategy {
    pub fn new(breakers: Arc<BreakerRegistry>, target: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            breakers,
            target: target.into(),
            config,
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based)
    ///
    /// Attempt numbers restart at 1 only after a successful connection, so
    /// attempt 1 resets the breaker before the delay is computed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let breaker = self.breaker();
        if attempt <= 1 {
            breaker.reset();
        }
        breaker.on_failure(attempt)
    }

    /// Report a successful connection
    pub fn on_connected(&self) {
        self.breaker().reset();
    }

    pub fn breaker(&self) -> Arc<CircuitBreaker> {
        self.breakers.breaker(&self.target, &self.config)
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Closure form for transports that take a `Fn(usize) -> Duration` hook
    pub fn into_callback(self) -> impl Fn(usize) -> Duration + Send + Sync + 'static {
        move |attempts: usize| {
            let attempt = u32::try_from(attempts).unwrap_or(u32::MAX).max(1);
            self.delay_for(attempt)
        }
    }
}
