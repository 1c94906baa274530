//! Bounded per-agent connection pooling.
//!
//! The pool owns every connection. The router borrows one for the duration
//! of a single invocation and always returns it: `release` on normal
//! completion, `discard` when an attempt times out mid-invoke. Physical
//! setup/teardown goes through [`AgentTransport`], the only place the
//! system touches real I/O.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::interval;
use uuid::Uuid;

use crate::agent::{AgentId, AgentTransport};
use crate::config::PoolConfig;
use crate::error::{Result, SynapseError};
use crate::events::{EventBus, OrchestratorEvent};

/// Unique pooled-connection identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(String);

impl ConnectionId {
    fn new(agent_id: &AgentId) -> Self {
        Self(format!("{agent_id}_{}", Uuid::new_v4()))
    }

    /// The underlying string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug)]
struct PooledConnection {
    id: ConnectionId,
    last_used: Instant,
    use_count: u64,
    in_use: bool,
}

impl PooledConnection {
    fn reserve(agent_id: &AgentId) -> Self {
        Self {
            id: ConnectionId::new(agent_id),
            last_used: Instant::now(),
            use_count: 0,
            in_use: true,
        }
    }
}

/// Per-agent connection counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentPoolStats {
    /// Pooled connections for this agent.
    pub total: usize,
    /// Connections currently borrowed.
    pub in_use: usize,
}

/// Pool-wide statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    /// Fraction of maximum capacity currently borrowed, in [0, 1].
    pub utilization: f64,
    /// Counts per agent.
    pub per_agent: HashMap<AgentId, AgentPoolStats>,
}

/// Bounded pool of reusable connections, one sub-pool per agent.
pub struct ConnectionPool {
    connections: RwLock<HashMap<AgentId, Vec<PooledConnection>>>,
    config: PoolConfig,
    transport: Arc<dyn AgentTransport>,
    events: EventBus,
    returned: Notify,
    background_tasks: RwLock<Vec<JoinHandle<()>>>,
}

impl ConnectionPool {
    /// Create an empty pool.
    pub fn new(config: PoolConfig, transport: Arc<dyn AgentTransport>, events: EventBus) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            config,
            transport,
            events,
            returned: Notify::new(),
            background_tasks: RwLock::new(Vec::new()),
        }
    }

    /// Borrow a connection for `agent_id`, waiting up to the configured
    /// acquire timeout when the sub-pool is at its limit.
    pub async fn acquire(&self, agent_id: &AgentId) -> Result<ConnectionId> {
        self.acquire_within(agent_id, self.config.acquire_timeout)
            .await
    }

    /// The configured acquire timeout.
    pub fn acquire_timeout(&self) -> std::time::Duration {
        self.config.acquire_timeout
    }

    /// Borrow a connection with an explicit wait budget.
    pub async fn acquire_within(
        &self,
        agent_id: &AgentId,
        max_wait: std::time::Duration,
    ) -> Result<ConnectionId> {
        let deadline = Instant::now() + max_wait;

        loop {
            enum Plan {
                Reuse(ConnectionId),
                Create(ConnectionId),
                Wait,
            }

            let plan = {
                let mut connections = self.connections.write().await;
                let pool = connections.entry(agent_id.clone()).or_default();

                if let Some(conn) = pool
                    .iter_mut()
                    .filter(|c| !c.in_use)
                    .min_by_key(|c| c.use_count)
                {
                    conn.in_use = true;
                    conn.last_used = Instant::now();
                    conn.use_count += 1;
                    Plan::Reuse(conn.id.clone())
                } else if pool.len() < self.config.max_per_agent {
                    // Reserve the slot before the async open so the limit
                    // holds even while setup is in flight.
                    let conn = PooledConnection::reserve(agent_id);
                    let id = conn.id.clone();
                    pool.push(conn);
                    Plan::Create(id)
                } else {
                    Plan::Wait
                }
            };

            match plan {
                Plan::Reuse(id) => {
                    tracing::debug!(agent_id = %agent_id, connection_id = %id, "reusing pooled connection");
                    return Ok(id);
                }
                Plan::Create(id) => match self.transport.open_connection(agent_id).await {
                    Ok(()) => {
                        tracing::debug!(agent_id = %agent_id, connection_id = %id, "opened new connection");
                        self.mark_use(agent_id, &id).await;
                        self.events.publish(OrchestratorEvent::ConnectionCreated {
                            agent_id: agent_id.clone(),
                            connection_id: id.clone(),
                        });
                        return Ok(id);
                    }
                    Err(err) => {
                        self.drop_reservation(agent_id, &id).await;
                        return Err(err);
                    }
                },
                Plan::Wait => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(SynapseError::PoolExhausted {
                            agent_id: agent_id.clone(),
                        });
                    }
                    if tokio::time::timeout(remaining, self.returned.notified())
                        .await
                        .is_err()
                    {
                        return Err(SynapseError::PoolExhausted {
                            agent_id: agent_id.clone(),
                        });
                    }
                }
            }
        }
    }

    async fn mark_use(&self, agent_id: &AgentId, connection_id: &ConnectionId) {
        let mut connections = self.connections.write().await;
        if let Some(pool) = connections.get_mut(agent_id) {
            if let Some(conn) = pool.iter_mut().find(|c| &c.id == connection_id) {
                conn.use_count += 1;
                conn.last_used = Instant::now();
            }
        }
    }

    async fn drop_reservation(&self, agent_id: &AgentId, connection_id: &ConnectionId) {
        let mut connections = self.connections.write().await;
        if let Some(pool) = connections.get_mut(agent_id) {
            pool.retain(|c| &c.id != connection_id);
        }
        drop(connections);
        self.returned.notify_one();
    }

    /// Return a borrowed connection to the pool and wake one waiter.
    pub async fn release(&self, agent_id: &AgentId, connection_id: &ConnectionId) {
        let mut connections = self.connections.write().await;
        if let Some(pool) = connections.get_mut(agent_id) {
            if let Some(conn) = pool.iter_mut().find(|c| &c.id == connection_id) {
                conn.in_use = false;
                conn.last_used = Instant::now();
            }
        }
        drop(connections);
        self.returned.notify_one();
    }

    /// Close and drop a borrowed connection whose state is no longer
    /// trustworthy (e.g. the invocation timed out mid-flight).
    pub async fn discard(&self, agent_id: &AgentId, connection_id: &ConnectionId) {
        let removed = {
            let mut connections = self.connections.write().await;
            match connections.get_mut(agent_id) {
                Some(pool) => {
                    let before = pool.len();
                    pool.retain(|c| &c.id != connection_id);
                    before != pool.len()
                }
                None => false,
            }
        };

        if removed {
            self.transport
                .close_connection(agent_id, connection_id)
                .await;
            self.events.publish(OrchestratorEvent::ConnectionRemoved {
                agent_id: agent_id.clone(),
                connection_id: connection_id.clone(),
            });
            self.returned.notify_one();
        }
    }

    /// Pre-create connections so first real requests skip setup latency.
    /// Per-agent failures are logged and skipped.
    pub async fn warm_up(&self, agent_ids: &[AgentId]) {
        let target = self.config.min_warm.min(self.config.max_per_agent);

        for agent_id in agent_ids {
            loop {
                let reserved = {
                    let mut connections = self.connections.write().await;
                    let pool = connections.entry(agent_id.clone()).or_default();
                    if pool.len() >= target {
                        None
                    } else {
                        let conn = PooledConnection::reserve(agent_id);
                        let id = conn.id.clone();
                        pool.push(conn);
                        Some(id)
                    }
                };

                let Some(id) = reserved else { break };

                match self.transport.open_connection(agent_id).await {
                    Ok(()) => {
                        {
                            let mut connections = self.connections.write().await;
                            if let Some(pool) = connections.get_mut(agent_id) {
                                if let Some(conn) = pool.iter_mut().find(|c| c.id == id) {
                                    conn.in_use = false;
                                }
                            }
                        }
                        self.events.publish(OrchestratorEvent::ConnectionCreated {
                            agent_id: agent_id.clone(),
                            connection_id: id,
                        });
                        self.returned.notify_one();
                    }
                    Err(err) => {
                        tracing::warn!(agent_id = %agent_id, error = %err, "warm-up connection failed");
                        self.drop_reservation(agent_id, &id).await;
                        break;
                    }
                }
            }
        }
    }

    /// Close and drop every connection belonging to a removed agent.
    pub async fn remove_agent(&self, agent_id: &AgentId) {
        let removed = {
            let mut connections = self.connections.write().await;
            connections.remove(agent_id).unwrap_or_default()
        };

        for conn in &removed {
            self.transport.close_connection(agent_id, &conn.id).await;
            self.events.publish(OrchestratorEvent::ConnectionRemoved {
                agent_id: agent_id.clone(),
                connection_id: conn.id.clone(),
            });
        }

        if !removed.is_empty() {
            tracing::info!(agent_id = %agent_id, count = removed.len(), "dropped connections for removed agent");
            self.returned.notify_waiters();
        }
    }

    /// Current utilization and per-agent counts.
    pub async fn stats(&self) -> PoolStats {
        let connections = self.connections.read().await;

        let mut per_agent = HashMap::with_capacity(connections.len());
        let mut total_in_use = 0usize;
        for (agent_id, pool) in connections.iter() {
            let in_use = pool.iter().filter(|c| c.in_use).count();
            total_in_use += in_use;
            per_agent.insert(
                agent_id.clone(),
                AgentPoolStats {
                    total: pool.len(),
                    in_use,
                },
            );
        }

        let capacity = connections.len() * self.config.max_per_agent;
        let utilization = if capacity > 0 {
            total_in_use as f64 / capacity as f64
        } else {
            0.0
        };

        PoolStats {
            utilization,
            per_agent,
        }
    }

    /// Drop free connections that have sat idle past the configured timeout.
    /// Returns how many were removed.
    pub async fn sweep_idle(&self) -> usize {
        let mut removed = Vec::new();
        {
            let mut connections = self.connections.write().await;
            for (agent_id, pool) in connections.iter_mut() {
                let mut kept = Vec::with_capacity(pool.len());
                for conn in pool.drain(..) {
                    if !conn.in_use && conn.last_used.elapsed() > self.config.idle_timeout {
                        removed.push((agent_id.clone(), conn.id));
                    } else {
                        kept.push(conn);
                    }
                }
                *pool = kept;
            }
        }

        for (agent_id, connection_id) in &removed {
            self.transport
                .close_connection(agent_id, connection_id)
                .await;
            self.events.publish(OrchestratorEvent::ConnectionRemoved {
                agent_id: agent_id.clone(),
                connection_id: connection_id.clone(),
            });
        }

        if !removed.is_empty() {
            tracing::info!(count = removed.len(), "swept idle connections");
        }
        removed.len()
    }

    /// Start the idle-sweep background task.
    pub async fn start_background_tasks(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        let sweep_interval = self.config.idle_timeout;
        let handle = tokio::spawn(async move {
            let mut ticker = interval(sweep_interval);
            loop {
                ticker.tick().await;
                pool.sweep_idle().await;
            }
        });
        self.background_tasks.write().await.push(handle);
    }

    /// Stop background tasks and close every pooled connection.
    pub async fn shutdown(&self) {
        {
            let mut tasks = self.background_tasks.write().await;
            for task in tasks.drain(..) {
                task.abort();
            }
        }

        let drained: Vec<(AgentId, Vec<PooledConnection>)> = {
            let mut connections = self.connections.write().await;
            connections.drain().collect()
        };
        for (agent_id, pool) in &drained {
            for conn in pool {
                self.transport.close_connection(agent_id, &conn.id).await;
            }
        }
        self.returned.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedTransport;
    use std::time::Duration;

    fn test_pool(max_per_agent: usize, acquire_timeout_ms: u64) -> (Arc<ConnectionPool>, Arc<ScriptedTransport>) {
        let transport = Arc::new(ScriptedTransport::new());
        let config = PoolConfig {
            max_per_agent,
            acquire_timeout: Duration::from_millis(acquire_timeout_ms),
            idle_timeout: Duration::from_secs(300),
            min_warm: 2,
        };
        let pool = Arc::new(ConnectionPool::new(
            config,
            transport.clone() as Arc<dyn AgentTransport>,
            EventBus::new(),
        ));
        (pool, transport)
    }

    #[tokio::test]
    async fn test_acquire_creates_then_reuses() {
        let (pool, transport) = test_pool(5, 100);
        let agent = AgentId::from_string("a1");

        let first = pool.acquire(&agent).await.unwrap();
        pool.release(&agent, &first).await;

        let second = pool.acquire(&agent).await.unwrap();
        assert_eq!(first, second, "released connection should be reused");
        assert_eq!(transport.opened_count(), 1);
    }

    #[tokio::test]
    async fn test_acquire_times_out_when_exhausted() {
        let (pool, _transport) = test_pool(1, 50);
        let agent = AgentId::from_string("a1");

        let held = pool.acquire(&agent).await.unwrap();
        let err = pool.acquire(&agent).await.unwrap_err();
        assert!(matches!(err, SynapseError::PoolExhausted { .. }));

        pool.release(&agent, &held).await;
        assert!(pool.acquire(&agent).await.is_ok());
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_release() {
        let (pool, _transport) = test_pool(1, 500);
        let agent = AgentId::from_string("a1");

        let held = pool.acquire(&agent).await.unwrap();

        let waiter_pool = Arc::clone(&pool);
        let waiter_agent = agent.clone();
        let waiter =
            tokio::spawn(async move { waiter_pool.acquire(&waiter_agent).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.release(&agent, &held).await;

        let reacquired = waiter.await.unwrap().unwrap();
        assert_eq!(reacquired, held);
    }

    #[tokio::test]
    async fn test_warm_up_pre_creates_connections() {
        let (pool, transport) = test_pool(5, 100);
        let agents = vec![AgentId::from_string("a1"), AgentId::from_string("a2")];

        pool.warm_up(&agents).await;
        assert_eq!(transport.opened_count(), 4); // min_warm = 2 per agent

        // warmed connections satisfy acquire without new opens
        let conn = pool.acquire(&agents[0]).await.unwrap();
        assert_eq!(transport.opened_count(), 4);
        pool.release(&agents[0], &conn).await;
    }

    #[tokio::test]
    async fn test_remove_agent_closes_connections() {
        let (pool, transport) = test_pool(5, 100);
        let agent = AgentId::from_string("a1");

        let conn = pool.acquire(&agent).await.unwrap();
        pool.release(&agent, &conn).await;
        pool.remove_agent(&agent).await;

        assert_eq!(transport.closed_count(), 1);
        let stats = pool.stats().await;
        assert!(stats.per_agent.is_empty());
    }

    #[tokio::test]
    async fn test_discard_removes_connection() {
        let (pool, transport) = test_pool(5, 100);
        let agent = AgentId::from_string("a1");

        let conn = pool.acquire(&agent).await.unwrap();
        pool.discard(&agent, &conn).await;
        assert_eq!(transport.closed_count(), 1);

        // next acquire opens a fresh connection
        let next = pool.acquire(&agent).await.unwrap();
        assert_ne!(conn, next);
        assert_eq!(transport.opened_count(), 2);
    }

    #[tokio::test]
    async fn test_utilization_reflects_borrowed_share() {
        let (pool, _transport) = test_pool(4, 100);
        let agent = AgentId::from_string("a1");

        let c1 = pool.acquire(&agent).await.unwrap();
        let _c2 = pool.acquire(&agent).await.unwrap();

        let stats = pool.stats().await;
        assert_eq!(stats.per_agent[&agent].total, 2);
        assert_eq!(stats.per_agent[&agent].in_use, 2);
        assert!((stats.utilization - 0.5).abs() < f64::EPSILON);

        pool.release(&agent, &c1).await;
        let stats = pool.stats().await;
        assert_eq!(stats.per_agent[&agent].in_use, 1);
        assert!((stats.utilization - 0.25).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_sweep_idle_only_removes_free_connections() {
        let transport = Arc::new(ScriptedTransport::new());
        let config = PoolConfig {
            max_per_agent: 5,
            acquire_timeout: Duration::from_millis(100),
            idle_timeout: Duration::from_millis(10),
            min_warm: 1,
        };
        let pool = ConnectionPool::new(
            config,
            transport.clone() as Arc<dyn AgentTransport>,
            EventBus::new(),
        );
        let agent = AgentId::from_string("a1");

        let busy = pool.acquire(&agent).await.unwrap();
        let free = pool.acquire(&agent).await.unwrap();
        pool.release(&agent, &free).await;

        tokio::time::sleep(Duration::from_millis(25)).await;
        let swept = pool.sweep_idle().await;
        assert_eq!(swept, 1);

        let stats = pool.stats().await;
        assert_eq!(stats.per_agent[&agent].total, 1);
        pool.release(&agent, &busy).await;
    }
}
