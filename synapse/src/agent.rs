//! Agent identity, metadata, and the collaborator trait seams.
//!
//! The core never talks to a worker directly: invocation, health probing,
//! and discovery are capabilities supplied by the surrounding system through
//! [`AgentTransport`] and [`AgentDiscovery`].

use std::collections::HashSet;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::pool::ConnectionId;

/// Unique agent identifier.
///
/// Ordering is lexicographic over the underlying string; deterministic
/// tie-breaks in the router rely on it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AgentId(String);

impl AgentId {
    /// Create a new unique agent ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from string (for deserialization/testing)
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// The underlying string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Health signal for an agent, updated by periodic probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentHealth {
    /// Agent is responsive.
    Healthy,
    /// Agent responds but slowly or partially.
    Degraded,
    /// Agent does not respond to probes.
    Unreachable,
}

/// Rolling performance statistics for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentPerformance {
    /// Exponential moving average of attempt outcomes, in [0, 1].
    pub success_score: f64,
    /// Attempts recorded against this agent.
    pub tasks_completed: u64,
    /// Running average attempt duration in milliseconds.
    pub avg_execution_time_ms: f64,
}

impl Default for AgentPerformance {
    fn default() -> Self {
        Self {
            success_score: 1.0,
            tasks_completed: 0,
            avg_execution_time_ms: 0.0,
        }
    }
}

/// Everything the registry tracks about one agent.
///
/// Owned exclusively by the registry; reads hand out clones, so holders see
/// a snapshot, never live state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMetadata {
    /// Unique id.
    pub id: AgentId,
    /// Capability tags this agent advertises. Matching is case-sensitive.
    pub capabilities: HashSet<String>,
    /// Latest health signal.
    pub health: AgentHealth,
    /// Rolling performance stats.
    pub performance: AgentPerformance,
    /// Registration timestamp; round-robin rotation follows this order.
    pub registered_at: DateTime<Utc>,
    /// When the last health probe ran, if any.
    pub last_health_check: Option<DateTime<Utc>>,
}

impl AgentMetadata {
    /// Create metadata for a newly known agent.
    pub fn new(id: AgentId, capabilities: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            id,
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            health: AgentHealth::Healthy,
            performance: AgentPerformance::default(),
            registered_at: Utc::now(),
            last_health_check: None,
        }
    }

    /// Whether this agent advertises every capability in `required`.
    pub fn satisfies(&self, required: &HashSet<String>) -> bool {
        required.iter().all(|cap| self.capabilities.contains(cap))
    }
}

/// Transport capability supplied by the layer that owns the actual wire
/// protocol. The pool calls `open_connection`/`close_connection` (the only
/// places real I/O setup and teardown happen); the router calls `invoke`;
/// the registry calls `probe`.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// Perform connection setup with the agent.
    async fn open_connection(&self, agent_id: &AgentId) -> Result<()>;

    /// Tear down a previously opened connection. Best-effort.
    async fn close_connection(&self, agent_id: &AgentId, connection_id: &ConnectionId);

    /// Execute one task payload on the agent over the given connection.
    async fn invoke(
        &self,
        agent_id: &AgentId,
        connection_id: &ConnectionId,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value>;

    /// Probe the agent's health.
    async fn probe(&self, agent_id: &AgentId) -> AgentHealth;
}

/// Discovery capability: yields agents that should be registered.
#[async_trait]
pub trait AgentDiscovery: Send + Sync {
    /// Return currently advertised agents. Implementations may return the
    /// full set each call; the registry skips ids it already knows.
    async fn discover(&self) -> Vec<AgentMetadata>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_id_creation() {
        let id = AgentId::new();
        assert!(!id.to_string().is_empty());
    }

    #[test]
    fn test_agent_id_ordering_is_lexicographic() {
        let a = AgentId::from_string("agent-a");
        let b = AgentId::from_string("agent-b");
        assert!(a < b);
    }

    #[test]
    fn test_capability_superset_matching() {
        let meta = AgentMetadata::new(AgentId::from_string("a1"), ["embedding", "gpu", "nlp"]);

        let mut required = HashSet::new();
        required.insert("embedding".to_string());
        required.insert("gpu".to_string());
        assert!(meta.satisfies(&required));

        required.insert("vision".to_string());
        assert!(!meta.satisfies(&required));

        // matching is case-sensitive
        let mut cased = HashSet::new();
        cased.insert("GPU".to_string());
        assert!(!meta.satisfies(&cased));
    }

    #[test]
    fn test_empty_requirements_always_satisfied() {
        let meta = AgentMetadata::new(AgentId::from_string("a1"), Vec::<String>::new());
        assert!(meta.satisfies(&HashSet::new()));
    }

    #[test]
    fn test_default_performance_starts_optimistic() {
        let perf = AgentPerformance::default();
        assert_eq!(perf.success_score, 1.0);
        assert_eq!(perf.tasks_completed, 0);
    }
}
