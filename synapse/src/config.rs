//! Configuration surface for the orchestration core.
//!
//! Every section mirrors one component: registry, routing, circuit breaker,
//! connection pool, and telemetry. All sections implement `Default` so a
//! zero-config `SynapseConfig::default()` is a usable starting point.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::breaker::CircuitBreakerConfig;
use crate::strategy::RoutingStrategy;
use crate::task::RetryPolicy;

// Helper module for serializing Duration as seconds
pub(crate) mod serde_duration {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Millisecond variant for the delays that are routinely sub-second
pub(crate) mod serde_duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Top-level configuration for an [`Orchestrator`](crate::Orchestrator).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SynapseConfig {
    /// Agent registry settings.
    pub registry: RegistryConfig,
    /// Task routing settings.
    pub routing: RoutingConfig,
    /// Per-agent circuit breaker settings.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Connection pool settings.
    pub connection_pool: PoolConfig,
    /// Metrics collection settings.
    pub telemetry: TelemetryConfig,
}

/// Agent registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Maximum number of registered agents.
    pub max_agents: usize,

    /// Interval between health-check sweeps.
    #[serde(with = "serde_duration")]
    pub health_check_interval: Duration,

    /// Enable the periodic discovery scan.
    pub discovery_enabled: bool,

    /// Interval between discovery scans.
    #[serde(with = "serde_duration")]
    pub discovery_interval: Duration,

    /// Consecutive unreachable probes before an agent is evicted.
    pub eviction_threshold: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_agents: 100,
            health_check_interval: Duration::from_secs(30),
            discovery_enabled: false,
            discovery_interval: Duration::from_secs(60),
            eviction_threshold: 3,
        }
    }
}

/// Task routing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Strategy used when adaptive routing is disabled.
    pub default_strategy: RoutingStrategy,

    /// Default per-task timeout, also the orchestrator-level deadline.
    #[serde(with = "serde_duration")]
    pub task_timeout: Duration,

    /// When set, overrides `default_strategy` with [`RoutingStrategy::Adaptive`].
    pub enable_adaptive_routing: bool,

    /// EMA learning rate for agent success scores, in (0, 1].
    pub learning_rate: f64,

    /// Probability of an exploratory (uniform random) pick under adaptive routing.
    pub exploration_rate: f64,

    /// Base delay for the retry backoff schedule.
    #[serde(with = "serde_duration_ms")]
    pub base_retry_delay: Duration,

    /// Retry policy applied to tasks that do not carry their own.
    pub default_retry_policy: RetryPolicy,

    /// Pending-task count above which the router is reported as backlogged.
    pub pending_task_threshold: usize,
}

impl RoutingConfig {
    /// The strategy the router actually runs with.
    pub fn effective_strategy(&self) -> RoutingStrategy {
        if self.enable_adaptive_routing {
            RoutingStrategy::Adaptive
        } else {
            self.default_strategy
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_strategy: RoutingStrategy::RoundRobin,
            task_timeout: Duration::from_secs(30),
            enable_adaptive_routing: false,
            learning_rate: 0.2,
            exploration_rate: 0.1,
            base_retry_delay: Duration::from_millis(100),
            default_retry_policy: RetryPolicy::default(),
            pending_task_threshold: 100,
        }
    }
}

/// Connection pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum pooled connections per agent.
    pub max_per_agent: usize,

    /// How long `acquire` waits for a free connection before giving up.
    #[serde(with = "serde_duration_ms")]
    pub acquire_timeout: Duration,

    /// Idle connections older than this are swept.
    #[serde(with = "serde_duration")]
    pub idle_timeout: Duration,

    /// Connections pre-created per agent during warm-up.
    pub min_warm: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_per_agent: 5,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(300),
            min_warm: 1,
        }
    }
}

/// Telemetry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Enable the periodic metrics timer.
    pub enabled: bool,

    /// Interval between `MetricsCollected` emissions.
    #[serde(with = "serde_duration")]
    pub metrics_interval: Duration,

    /// Task results older than this are pruned from history.
    #[serde(with = "serde_duration")]
    pub retention_period: Duration,

    /// Hard cap on the in-memory task result history.
    pub history_cap: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            metrics_interval: Duration::from_secs(10),
            retention_period: Duration::from_secs(3600),
            history_cap: 10_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_sane() {
        let config = SynapseConfig::default();
        assert_eq!(config.registry.max_agents, 100);
        assert_eq!(config.connection_pool.max_per_agent, 5);
        assert_eq!(config.telemetry.history_cap, 10_000);
        assert!(config.routing.learning_rate > 0.0 && config.routing.learning_rate <= 1.0);
    }

    #[test]
    fn test_config_serde_round_trip() {
        let config = SynapseConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: SynapseConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.registry.max_agents, config.registry.max_agents);
        assert_eq!(
            parsed.registry.health_check_interval,
            config.registry.health_check_interval
        );
        assert_eq!(
            parsed.connection_pool.acquire_timeout,
            config.connection_pool.acquire_timeout
        );
        assert_eq!(
            parsed.routing.default_strategy,
            config.routing.default_strategy
        );
    }

    #[test]
    fn test_adaptive_flag_overrides_default_strategy() {
        let mut routing = RoutingConfig::default();
        assert_eq!(routing.effective_strategy(), RoutingStrategy::RoundRobin);

        routing.enable_adaptive_routing = true;
        assert_eq!(routing.effective_strategy(), RoutingStrategy::Adaptive);
    }
}
