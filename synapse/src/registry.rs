//! Agent registry: the single owner of agent metadata.
//!
//! Tracks known agents, their capability tags, health, and rolling
//! performance stats. The router and orchestrator only ever read snapshot
//! clones. Background loops probe agent health and, when enabled, pull new
//! agents from the discovery capability.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::agent::{AgentDiscovery, AgentId, AgentMetadata, AgentTransport};
use crate::config::RegistryConfig;
use crate::error::{Result, SynapseError};
use crate::events::{EventBus, OrchestratorEvent};
use crate::pool::ConnectionPool;

/// Registry of known agents, indexed by capability.
pub struct AgentRegistry {
    agents: RwLock<HashMap<AgentId, AgentMetadata>>,
    capability_index: RwLock<HashMap<String, HashSet<AgentId>>>,
    unreachable_streaks: RwLock<HashMap<AgentId, u32>>,
    config: RegistryConfig,
    learning_rate: f64,
    transport: Arc<dyn AgentTransport>,
    discovery: Option<Arc<dyn AgentDiscovery>>,
    events: EventBus,
    background_tasks: RwLock<Vec<JoinHandle<()>>>,
}

impl AgentRegistry {
    /// Create an empty registry.
    pub fn new(
        config: RegistryConfig,
        learning_rate: f64,
        transport: Arc<dyn AgentTransport>,
        discovery: Option<Arc<dyn AgentDiscovery>>,
        events: EventBus,
    ) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            capability_index: RwLock::new(HashMap::new()),
            unreachable_streaks: RwLock::new(HashMap::new()),
            config,
            learning_rate,
            transport,
            discovery,
            events,
            background_tasks: RwLock::new(Vec::new()),
        }
    }

    /// Add an agent, or overwrite an existing registration with the same id.
    ///
    /// Re-registering a known id never counts against capacity and keeps the
    /// agent's rolling performance stats. Fails with
    /// [`SynapseError::CapacityExceeded`] once the configured limit is hit.
    pub async fn register_agent(&self, mut meta: AgentMetadata) -> Result<()> {
        let mut agents = self.agents.write().await;
        let previous = agents.get(&meta.id);

        if previous.is_none() && agents.len() >= self.config.max_agents {
            return Err(SynapseError::CapacityExceeded {
                max: self.config.max_agents,
            });
        }

        let mut index = self.capability_index.write().await;
        if let Some(old) = previous {
            // same worker re-announcing itself: keep its history
            meta.performance = old.performance.clone();
            meta.registered_at = old.registered_at;
            for cap in &old.capabilities {
                if let Some(ids) = index.get_mut(cap) {
                    ids.remove(&meta.id);
                }
            }
        }
        for cap in &meta.capabilities {
            index.entry(cap.clone()).or_default().insert(meta.id.clone());
        }
        drop(index);

        info!(agent_id = %meta.id, capabilities = meta.capabilities.len(), "agent registered");
        let agent_id = meta.id.clone();
        agents.insert(agent_id.clone(), meta);
        drop(agents);

        self.events
            .publish(OrchestratorEvent::AgentRegistered { agent_id });
        Ok(())
    }

    /// Remove an agent. A no-op for unknown ids.
    pub async fn unregister_agent(&self, agent_id: &AgentId) {
        let removed = {
            let mut agents = self.agents.write().await;
            agents.remove(agent_id)
        };

        let Some(meta) = removed else {
            debug!(agent_id = %agent_id, "unregister for unknown agent ignored");
            return;
        };

        {
            let mut index = self.capability_index.write().await;
            for cap in &meta.capabilities {
                if let Some(ids) = index.get_mut(cap) {
                    ids.remove(agent_id);
                    if ids.is_empty() {
                        index.remove(cap);
                    }
                }
            }
        }
        self.unreachable_streaks.write().await.remove(agent_id);

        info!(agent_id = %agent_id, "agent unregistered");
        self.events.publish(OrchestratorEvent::AgentUnregistered {
            agent_id: agent_id.clone(),
        });
    }

    /// All agents whose capability set is a superset of `required`, sorted
    /// by id. An empty result is valid, not an error.
    pub async fn find_agents_by_capabilities(
        &self,
        required: &HashSet<String>,
    ) -> Vec<AgentMetadata> {
        let agents = self.agents.read().await;

        let mut matches: Vec<AgentMetadata> = if required.is_empty() {
            agents.values().cloned().collect()
        } else {
            let index = self.capability_index.read().await;
            let mut candidates: Option<HashSet<AgentId>> = None;
            for cap in required {
                let Some(ids) = index.get(cap) else {
                    return Vec::new();
                };
                candidates = Some(match candidates {
                    None => ids.clone(),
                    Some(acc) => acc.intersection(ids).cloned().collect(),
                });
                if candidates.as_ref().is_some_and(HashSet::is_empty) {
                    return Vec::new();
                }
            }
            candidates
                .unwrap_or_default()
                .iter()
                .filter_map(|id| agents.get(id).cloned())
                .collect()
        };

        matches.sort_by(|a, b| a.id.cmp(&b.id));
        matches
    }

    /// Snapshot of one agent.
    pub async fn get_agent(&self, agent_id: &AgentId) -> Option<AgentMetadata> {
        self.agents.read().await.get(agent_id).cloned()
    }

    /// Snapshot of every agent.
    pub async fn all_agents(&self) -> Vec<AgentMetadata> {
        self.agents.read().await.values().cloned().collect()
    }

    /// Number of registered agents.
    pub async fn agent_count(&self) -> usize {
        self.agents.read().await.len()
    }

    /// Fold one attempt outcome into the agent's rolling stats. A no-op
    /// when the agent was removed mid-flight.
    pub async fn update_agent_stats(
        &self,
        agent_id: &AgentId,
        success: bool,
        execution_time: std::time::Duration,
    ) {
        let mut agents = self.agents.write().await;
        let Some(meta) = agents.get_mut(agent_id) else {
            debug!(agent_id = %agent_id, "stats update for unknown agent ignored");
            return;
        };

        let outcome = if success { 1.0 } else { 0.0 };
        let perf = &mut meta.performance;
        perf.success_score =
            perf.success_score * (1.0 - self.learning_rate) + outcome * self.learning_rate;
        perf.tasks_completed += 1;

        let ms = execution_time.as_millis() as f64;
        let n = perf.tasks_completed as f64;
        perf.avg_execution_time_ms += (ms - perf.avg_execution_time_ms) / n;
    }

    /// Probe every agent once, apply health transitions, and evict agents
    /// that have been unreachable for too many consecutive probes.
    async fn health_check_pass(&self, pool: &ConnectionPool) {
        let ids: Vec<AgentId> = {
            let agents = self.agents.read().await;
            agents.keys().cloned().collect()
        };

        for agent_id in ids {
            let current = self.transport.probe(&agent_id).await;

            let previous = {
                let mut agents = self.agents.write().await;
                let Some(meta) = agents.get_mut(&agent_id) else {
                    continue;
                };
                let previous = meta.health;
                meta.health = current;
                meta.last_health_check = Some(Utc::now());
                previous
            };

            if previous != current {
                info!(agent_id = %agent_id, ?previous, ?current, "agent health changed");
                self.events.publish(OrchestratorEvent::AgentHealthChanged {
                    agent_id: agent_id.clone(),
                    previous,
                    current,
                });
            }

            let streak = {
                let mut streaks = self.unreachable_streaks.write().await;
                if current == crate::agent::AgentHealth::Unreachable {
                    let streak = streaks.entry(agent_id.clone()).or_insert(0);
                    *streak += 1;
                    *streak
                } else {
                    streaks.remove(&agent_id);
                    0
                }
            };

            if streak >= self.config.eviction_threshold {
                warn!(agent_id = %agent_id, streak, "evicting unreachable agent");
                self.unregister_agent(&agent_id).await;
                pool.remove_agent(&agent_id).await;
            }
        }
    }

    /// Pull the discovery capability once and register unknown agents.
    async fn discovery_pass(&self) {
        let Some(discovery) = &self.discovery else {
            return;
        };

        for meta in discovery.discover().await {
            if self.get_agent(&meta.id).await.is_some() {
                continue;
            }
            let agent_id = meta.id.clone();
            match self.register_agent(meta).await {
                Ok(()) => debug!(agent_id = %agent_id, "agent discovered"),
                Err(err) => {
                    warn!(agent_id = %agent_id, error = %err, "discovered agent not registered");
                    break;
                }
            }
        }
    }

    /// Start the health-check loop and, when enabled, the discovery loop.
    pub async fn start_background_tasks(self: &Arc<Self>, pool: Arc<ConnectionPool>) {
        let mut tasks = self.background_tasks.write().await;

        let registry = Arc::clone(self);
        let health_interval = self.config.health_check_interval;
        tasks.push(tokio::spawn(async move {
            let mut ticker = interval(health_interval);
            loop {
                ticker.tick().await;
                registry.health_check_pass(&pool).await;
            }
        }));

        if self.config.discovery_enabled {
            if self.discovery.is_none() {
                warn!("discovery enabled but no discovery capability was provided");
            } else {
                let registry = Arc::clone(self);
                let discovery_interval = self.config.discovery_interval;
                tasks.push(tokio::spawn(async move {
                    let mut ticker = interval(discovery_interval);
                    loop {
                        ticker.tick().await;
                        registry.discovery_pass().await;
                    }
                }));
            }
        }
    }

    /// Abort the background loops.
    pub async fn stop_background_tasks(&self) {
        let mut tasks = self.background_tasks.write().await;
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}
