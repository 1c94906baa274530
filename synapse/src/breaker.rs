//! Per-agent circuit breaking.
//!
//! Each agent gets an independent breaker. While `Open`, the agent is
//! excluded from selection entirely; after a cooldown the breaker moves to
//! `HalfOpen` and admits a bounded number of trial requests. A trial success
//! run closes the breaker; a trial failure reopens it with a doubled
//! (capped) cooldown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::agent::AgentId;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Requests flow normally.
    Closed,
    /// The agent is isolated; no requests until the cooldown elapses.
    Open,
    /// Cooldown elapsed; a limited number of trial requests are admitted.
    HalfOpen,
}

/// Circuit breaker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the breaker open.
    pub failure_threshold: u32,
    /// Trial successes required to close a half-open breaker.
    pub success_threshold: u32,
    /// Initial open-state cooldown.
    #[serde(with = "crate::config::serde_duration")]
    pub cooldown: Duration,
    /// Upper bound on the backed-off cooldown.
    #[serde(with = "crate::config::serde_duration")]
    pub max_cooldown: Duration,
    /// Trial requests admitted while half-open.
    pub half_open_max_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(300),
            half_open_max_requests: 1,
        }
    }
}

/// Failure-isolation state machine for one agent.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_attempts: u32,
    reopen_count: u32,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            half_open_attempts: 0,
            reopen_count: 0,
            opened_at: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.state
    }

    fn current_cooldown(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.reopen_count.min(16));
        self.config
            .cooldown
            .saturating_mul(factor)
            .min(self.config.max_cooldown)
    }

    /// Whether a request may currently be sent to this agent. Applies the
    /// time-based `Open` → `HalfOpen` transition but does not consume a
    /// half-open trial slot; call [`CircuitBreaker::note_attempt`] once the
    /// agent is actually selected.
    pub fn can_execute(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let Some(opened_at) = self.opened_at else {
                    return false;
                };
                if opened_at.elapsed() >= self.current_cooldown() {
                    self.state = CircuitState::HalfOpen;
                    self.half_open_attempts = 0;
                    self.success_count = 0;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => self.half_open_attempts < self.config.half_open_max_requests,
        }
    }

    /// Consume a trial slot when half-open. No effect otherwise.
    pub fn note_attempt(&mut self) {
        if self.state == CircuitState::HalfOpen {
            self.half_open_attempts += 1;
        }
    }

    /// Record a successful attempt outcome.
    pub fn record_success(&mut self) {
        match self.state {
            CircuitState::Closed => {
                self.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                self.success_count += 1;
                if self.success_count >= self.config.success_threshold {
                    self.close();
                }
            }
            // Late outcome from an attempt issued before the trip.
            CircuitState::Open => {}
        }
    }

    /// Record a failed attempt outcome.
    pub fn record_failure(&mut self) {
        match self.state {
            CircuitState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.config.failure_threshold {
                    self.trip();
                }
            }
            CircuitState::HalfOpen => {
                self.reopen_count += 1;
                self.trip();
            }
            CircuitState::Open => {}
        }
    }

    /// Force the breaker back to a pristine closed state.
    pub fn reset(&mut self) {
        self.close();
    }

    fn trip(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.success_count = 0;
        self.half_open_attempts = 0;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.success_count = 0;
        self.half_open_attempts = 0;
        self.reopen_count = 0;
        self.opened_at = None;
    }
}

/// Shared map of per-agent breakers.
#[derive(Clone)]
pub struct CircuitBreakerRegistry {
    breakers: Arc<RwLock<HashMap<AgentId, Arc<RwLock<CircuitBreaker>>>>>,
}

impl CircuitBreakerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            breakers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Get the breaker for `agent_id`, creating it on first use.
    pub async fn get_or_create(
        &self,
        agent_id: &AgentId,
        config: CircuitBreakerConfig,
    ) -> Arc<RwLock<CircuitBreaker>> {
        let mut breakers = self.breakers.write().await;
        breakers
            .entry(agent_id.clone())
            .or_insert_with(|| Arc::new(RwLock::new(CircuitBreaker::new(config))))
            .clone()
    }

    /// Get the breaker for `agent_id` if one exists.
    pub async fn get(&self, agent_id: &AgentId) -> Option<Arc<RwLock<CircuitBreaker>>> {
        let breakers = self.breakers.read().await;
        breakers.get(agent_id).cloned()
    }

    /// Drop the breaker for a removed agent.
    pub async fn remove(&self, agent_id: &AgentId) {
        let mut breakers = self.breakers.write().await;
        breakers.remove(agent_id);
    }

    /// Snapshot of every tracked breaker's state.
    pub async fn states(&self) -> HashMap<AgentId, CircuitState> {
        let breakers = self.breakers.read().await;
        let mut states = HashMap::with_capacity(breakers.len());
        for (id, breaker) in breakers.iter() {
            states.insert(id.clone(), breaker.read().await.state());
        }
        states
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(cooldown_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 1,
            cooldown: Duration::from_millis(cooldown_ms),
            max_cooldown: Duration::from_millis(cooldown_ms * 8),
            half_open_max_requests: 1,
        }
    }

    #[test]
    fn test_trips_open_at_failure_threshold() {
        let mut breaker = CircuitBreaker::new(config(1000));

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_execute());
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let mut breaker = CircuitBreaker::new(config(1000));

        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_cooldown_admits_trial_then_success_closes() {
        let mut breaker = CircuitBreaker::new(config(20));
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_execute());

        std::thread::sleep(Duration::from_millis(30));
        assert!(breaker.can_execute());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.note_attempt();
        // the single trial slot is consumed
        assert!(!breaker.can_execute());

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.can_execute());
    }

    #[test]
    fn test_half_open_failure_reopens_with_backed_off_cooldown() {
        let mut breaker = CircuitBreaker::new(config(60));
        for _ in 0..3 {
            breaker.record_failure();
        }

        std::thread::sleep(Duration::from_millis(70));
        assert!(breaker.can_execute());
        breaker.note_attempt();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        // the cooldown has doubled to 120ms, so 70ms is no longer enough
        std::thread::sleep(Duration::from_millis(70));
        assert!(!breaker.can_execute());

        std::thread::sleep(Duration::from_millis(60));
        assert!(breaker.can_execute());
    }

    #[test]
    fn test_close_clears_backoff() {
        let mut breaker = CircuitBreaker::new(config(10));
        for _ in 0..3 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(15));
        assert!(breaker.can_execute());
        breaker.note_attempt();
        breaker.record_failure();

        std::thread::sleep(Duration::from_millis(25));
        assert!(breaker.can_execute());
        breaker.note_attempt();
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);

        // after closing, a fresh trip starts from the base cooldown again
        for _ in 0..3 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(15));
        assert!(breaker.can_execute());
    }

    #[tokio::test]
    async fn test_registry_creates_one_breaker_per_agent() {
        let registry = CircuitBreakerRegistry::new();
        let a1 = AgentId::from_string("a1");

        let first = registry.get_or_create(&a1, config(1000)).await;
        first.write().await.record_failure();

        let second = registry.get_or_create(&a1, config(1000)).await;
        assert!(Arc::ptr_eq(&first, &second));

        registry.remove(&a1).await;
        assert!(registry.get(&a1).await.is_none());
    }
}
