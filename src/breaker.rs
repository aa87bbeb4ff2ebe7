//! Connection circuit breaker — reconnect delay from consecutive failures
//!
//! Three backoff tiers:
//!
//! ```text
//!   attempt <= max_failures          Closed       exponential, capped short delay
//!   attempt <= max_attempts          Open         open_ms on every attempt
//!   attempt >  max_attempts          LongBackoff  long_delay_ms, forever
//! ```
//!
//! The breaker never gives up: once a target recovers, the next successful
//! connection resets it to `Closed`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Breaker tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BreakerConfig {
    /// Last attempt that still gets the short, exponential delay
    pub max_failures: u32,

    /// Last attempt of the Open tier; later attempts use `long_delay_ms`
    pub max_attempts: u32,

    /// Delay while Open (milliseconds)
    pub open_ms: u64,

    /// Delay once attempts are exhausted (milliseconds)
    pub long_delay_ms: u64,

    /// First short-tier delay (milliseconds), doubled per attempt
    pub base_delay_ms: u64,

    /// Cap for the short tier (milliseconds)
    pub max_short_delay_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            max_attempts: 10,
            open_ms: 60_000,
            long_delay_ms: 3_600_000,
            base_delay_ms: 200,
            max_short_delay_ms: 5_000,
        }
    }
}

/// Backoff severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BreakerTier {
    /// Normal transient-failure backoff
    Closed,
    /// Spaced retries at `open_ms`
    Open,
    /// Prolonged outage, retry at `long_delay_ms`
    LongBackoff,
}

impl BreakerTier {
    /// Tier for a 1-based attempt number
    pub fn for_attempt(attempt: u32, config: &BreakerConfig) -> Self {
        if attempt <= config.max_failures {
            BreakerTier::Closed
        } else if attempt <= config.max_attempts {
            BreakerTier::Open
        } else {
            BreakerTier::LongBackoff
        }
    }

    /// Delay this tier prescribes for `attempt`
    pub fn delay(self, attempt: u32, config: &BreakerConfig) -> Duration {
        match self {
            BreakerTier::Closed => {
                let exp = attempt.saturating_sub(1).min(32);
                let ms = config
                    .base_delay_ms
                    .saturating_mul(1u64 << exp)
                    .min(config.max_short_delay_ms);
                Duration::from_millis(ms)
            }
            BreakerTier::Open => Duration::from_millis(config.open_ms),
            BreakerTier::LongBackoff => Duration::from_millis(config.long_delay_ms),
        }
    }
}

impl std::fmt::Display for BreakerTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerTier::Closed => write!(f, "closed"),
            BreakerTier::Open => write!(f, "open"),
            BreakerTier::LongBackoff => write!(f, "long-backoff"),
        }
    }
}

/// Point-in-time copy of a breaker's state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerState {
    pub consecutive_failures: u32,
    pub tier: BreakerTier,
    pub opened_at: Option<Instant>,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self {
            consecutive_failures: 0,
            tier: BreakerTier::Closed,
            opened_at: None,
        }
    }
}

/// Circuit breaker for one connection target
#[derive(Debug)]
pub struct CircuitBreaker {
    target: String,
    config: BreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(target: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            target: target.into(),
            config,
            state: Mutex::new(BreakerState::default()),
        }
    }

    /// Record failed attempt number `attempt` (1-based) and return the delay
    /// before the next one
    pub fn on_failure(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let tier = BreakerTier::for_attempt(attempt, &self.config);
        let delay = tier.delay(attempt, &self.config);

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let previous = state.tier;
        state.consecutive_failures = attempt;
        state.tier = tier;

        if tier != BreakerTier::Closed && state.opened_at.is_none() {
            state.opened_at = Some(Instant::now());
        }

        if tier != previous {
            tracing::warn!(
                target_url = %self.target,
                attempt,
                from = %previous,
                to = %tier,
                delay_ms = delay.as_millis() as u64,
                "Circuit breaker tier changed"
            );
        } else {
            tracing::debug!(
                target_url = %self.target,
                attempt,
                tier = %tier,
                delay_ms = delay.as_millis() as u64,
                "Reconnect scheduled"
            );
        }

        delay
    }

    /// Return to `Closed` after a successful connection
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.consecutive_failures > 0 {
            tracing::info!(
                target_url = %self.target,
                failures = state.consecutive_failures,
                "Circuit breaker reset"
            );
        }
        *state = BreakerState::default();
    }

    pub fn state(&self) -> BreakerState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn tier(&self) -> BreakerTier {
        self.state().tier
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }
}

/// Breakers cached per connection target
///
/// Owned by whatever constructs buses; buses pointed at the same target share
/// one breaker and therefore one backoff schedule. Entries live as long as
/// the registry.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the breaker for `target`, creating it with `config` on first use
    ///
    /// The config of the first caller wins for the registry's lifetime.
    pub fn breaker(&self, target: &str, config: &BreakerConfig) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        breakers
            .entry(target.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(target, config.clone())))
            .clone()
    }

    pub fn get(&self, target: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(target)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.breakers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            "nats://127.0.0.1:4222",
            BreakerConfig {
                max_failures: 5,
                max_attempts: 10,
                open_ms: 60_000,
                long_delay_ms: 3_600_000,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_short_tier_non_decreasing_and_capped() {
        let breaker = test_breaker();
        let cap = Duration::from_millis(breaker.config().max_short_delay_ms);

        let delays: Vec<Duration> = (1..=5).map(|n| breaker.on_failure(n)).collect();
        for pair in delays.windows(2) {
            assert!(pair[0] <= pair[1], "{:?}", delays);
        }
        assert!(delays.iter().all(|d| *d <= cap));
        assert_eq!(delays[0], Duration::from_millis(200));
        assert_eq!(breaker.tier(), BreakerTier::Closed);
    }

    #[test]
    fn test_open_tier() {
        let breaker = test_breaker();
        for n in 6..=10 {
            assert_eq!(breaker.on_failure(n), Duration::from_millis(60_000));
        }
        let state = breaker.state();
        assert_eq!(state.tier, BreakerTier::Open);
        assert_eq!(state.consecutive_failures, 10);
        assert!(state.opened_at.is_some());
    }

    #[test]
    fn test_long_backoff_forever() {
        let breaker = test_breaker();
        for n in [11, 12, 50, 10_000, u32::MAX] {
            assert_eq!(breaker.on_failure(n), Duration::from_millis(3_600_000));
        }
        assert_eq!(breaker.tier(), BreakerTier::LongBackoff);
    }

    #[test]
    fn test_reset_returns_to_short_tier() {
        let breaker = test_breaker();
        for n in 1..=12 {
            breaker.on_failure(n);
        }
        assert_eq!(breaker.tier(), BreakerTier::LongBackoff);

        breaker.reset();
        assert_eq!(breaker.state(), BreakerState::default());
        assert_eq!(breaker.on_failure(1), Duration::from_millis(200));
        assert_eq!(breaker.tier(), BreakerTier::Closed);
    }

    #[test]
    fn test_short_delay_cap_applies() {
        let breaker = CircuitBreaker::new(
            "t",
            BreakerConfig {
                max_failures: 40,
                max_attempts: 50,
                base_delay_ms: 1_000,
                max_short_delay_ms: 3_000,
                ..Default::default()
            },
        );
        assert_eq!(breaker.on_failure(2), Duration::from_millis(2_000));
        assert_eq!(breaker.on_failure(3), Duration::from_millis(3_000));
        assert_eq!(breaker.on_failure(40), Duration::from_millis(3_000));
    }

    #[test]
    fn test_tier_boundaries() {
        let config = BreakerConfig::default();
        assert_eq!(BreakerTier::for_attempt(5, &config), BreakerTier::Closed);
        assert_eq!(BreakerTier::for_attempt(6, &config), BreakerTier::Open);
        assert_eq!(BreakerTier::for_attempt(10, &config), BreakerTier::Open);
        assert_eq!(BreakerTier::for_attempt(11, &config), BreakerTier::LongBackoff);
    }

    #[test]
    fn test_registry_shares_breaker_per_target() {
        let registry = BreakerRegistry::new();
        let config = BreakerConfig::default();

        let a = registry.breaker("nats://a:4222", &config);
        let a2 = registry.breaker("nats://a:4222", &config);
        let b = registry.breaker("nats://b:4222", &config);

        assert!(Arc::ptr_eq(&a, &a2));
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 2);

        a.on_failure(7);
        assert_eq!(a2.tier(), BreakerTier::Open);
        assert_eq!(b.tier(), BreakerTier::Closed);
    }

    #[test]
    fn test_registry_first_config_wins() {
        let registry = BreakerRegistry::new();
        registry.breaker("t", &BreakerConfig { open_ms: 1, ..Default::default() });
        let again = registry.breaker("t", &BreakerConfig { open_ms: 2, ..Default::default() });
        assert_eq!(again.config().open_ms, 1);
        assert!(registry.get("missing").is_none());
    }
}
