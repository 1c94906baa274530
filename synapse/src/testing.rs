//! Test support: scripted in-memory transport and discovery.
//!
//! No real I/O. Outcomes are scripted per agent ahead of time; anything
//! unscripted succeeds with a default payload. Used by the crate's own unit
//! and integration tests, and usable by downstream crates for theirs.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;

use crate::agent::{AgentDiscovery, AgentHealth, AgentId, AgentMetadata, AgentTransport};
use crate::error::{Result, SynapseError};
use crate::pool::ConnectionId;

/// One scripted invocation outcome.
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    /// Return this payload.
    Succeed(serde_json::Value),
    /// Fail with this message (retryable from the router's point of view).
    Fail(String),
    /// Sleep for the duration, then return the default payload.
    Hang(Duration),
}

/// In-memory [`AgentTransport`] with per-agent scripted behavior.
pub struct ScriptedTransport {
    invocations: Mutex<Vec<(AgentId, serde_json::Value)>>,
    scripts: Mutex<HashMap<AgentId, VecDeque<ScriptedOutcome>>>,
    defaults: Mutex<HashMap<AgentId, ScriptedOutcome>>,
    health: Mutex<HashMap<AgentId, AgentHealth>>,
    refuse_connections: Mutex<HashSet<AgentId>>,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

impl ScriptedTransport {
    /// Create a transport where every invocation succeeds.
    pub fn new() -> Self {
        Self {
            invocations: Mutex::new(Vec::new()),
            scripts: Mutex::new(HashMap::new()),
            defaults: Mutex::new(HashMap::new()),
            health: Mutex::new(HashMap::new()),
            refuse_connections: Mutex::new(HashSet::new()),
            opened: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
        }
    }

    /// Queue outcomes for an agent, consumed one per invocation.
    pub async fn script(&self, agent_id: &AgentId, outcomes: Vec<ScriptedOutcome>) {
        self.scripts
            .lock()
            .await
            .entry(agent_id.clone())
            .or_default()
            .extend(outcomes);
    }

    /// Set the outcome used once an agent's script runs dry.
    pub async fn set_default(&self, agent_id: &AgentId, outcome: ScriptedOutcome) {
        self.defaults.lock().await.insert(agent_id.clone(), outcome);
    }

    /// Make every invocation of this agent fail.
    pub async fn always_fail(&self, agent_id: &AgentId) {
        self.set_default(agent_id, ScriptedOutcome::Fail("scripted failure".to_string()))
            .await;
    }

    /// Set the health returned by probes for this agent.
    pub async fn set_health(&self, agent_id: &AgentId, health: AgentHealth) {
        self.health.lock().await.insert(agent_id.clone(), health);
    }

    /// Refuse to open connections for this agent.
    pub async fn set_connection_refused(&self, agent_id: &AgentId) {
        self.refuse_connections
            .lock()
            .await
            .insert(agent_id.clone());
    }

    /// Total invocations across every agent.
    pub async fn invocation_count(&self) -> usize {
        self.invocations.lock().await.len()
    }

    /// Invocations recorded for one agent.
    pub async fn invocations_for(&self, agent_id: &AgentId) -> usize {
        self.invocations
            .lock()
            .await
            .iter()
            .filter(|(id, _)| id == agent_id)
            .count()
    }

    /// Connections opened so far.
    pub fn opened_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Connections closed so far.
    pub fn closed_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    async fn next_outcome(&self, agent_id: &AgentId) -> ScriptedOutcome {
        if let Some(queue) = self.scripts.lock().await.get_mut(agent_id) {
            if let Some(outcome) = queue.pop_front() {
                return outcome;
            }
        }
        if let Some(outcome) = self.defaults.lock().await.get(agent_id) {
            return outcome.clone();
        }
        ScriptedOutcome::Succeed(json!({"ok": true}))
    }
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentTransport for ScriptedTransport {
    async fn open_connection(&self, agent_id: &AgentId) -> Result<()> {
        if self.refuse_connections.lock().await.contains(agent_id) {
            return Err(SynapseError::AgentInvocation {
                agent_id: agent_id.clone(),
                message: "connection refused".to_string(),
            });
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close_connection(&self, _agent_id: &AgentId, _connection_id: &ConnectionId) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    async fn invoke(
        &self,
        agent_id: &AgentId,
        _connection_id: &ConnectionId,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        self.invocations
            .lock()
            .await
            .push((agent_id.clone(), payload.clone()));

        match self.next_outcome(agent_id).await {
            ScriptedOutcome::Succeed(value) => Ok(value),
            ScriptedOutcome::Fail(message) => Err(SynapseError::AgentInvocation {
                agent_id: agent_id.clone(),
                message,
            }),
            ScriptedOutcome::Hang(duration) => {
                tokio::time::sleep(duration).await;
                Ok(json!({"ok": true, "delayed_ms": duration.as_millis() as u64}))
            }
        }
    }

    async fn probe(&self, agent_id: &AgentId) -> AgentHealth {
        self.health
            .lock()
            .await
            .get(agent_id)
            .copied()
            .unwrap_or(AgentHealth::Healthy)
    }
}

/// Discovery capability that always advertises a fixed set of agents.
pub struct StaticDiscovery {
    agents: Vec<AgentMetadata>,
}

impl StaticDiscovery {
    /// Create a discovery source advertising exactly these agents.
    pub fn new(agents: Vec<AgentMetadata>) -> Self {
        Self { agents }
    }
}

#[async_trait]
impl AgentDiscovery for StaticDiscovery {
    async fn discover(&self) -> Vec<AgentMetadata> {
        self.agents.clone()
    }
}
