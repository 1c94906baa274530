//! Orchestrator façade.
//!
//! The single entry point for the surrounding system: accepts
//! task-execution requests, drives the router, aggregates results into
//! metrics, and owns component lifecycle (initialize, warm-up, shutdown).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{info, warn};

use crate::agent::{AgentDiscovery, AgentId, AgentMetadata, AgentTransport};
use crate::config::SynapseConfig;
use crate::error::{Result, SynapseError};
use crate::events::{EventBus, OrchestratorEvent};
use crate::metrics::{MetricsReport, TaskHistory};
use crate::pool::ConnectionPool;
use crate::registry::AgentRegistry;
use crate::router::TaskRouter;
use crate::task::{ResultMetadata, Task, TaskResult};

/// One task-execution request, before the orchestrator turns it into a
/// [`Task`] with configured defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Caller-defined task type tag.
    pub task_type: String,
    /// Opaque payload handed to the selected agent.
    pub payload: serde_json::Value,
    /// Capabilities the executing agent must advertise.
    pub required_capabilities: HashSet<String>,
    /// Opaque caller metadata.
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
}

impl TaskRequest {
    /// Create a request with no context.
    pub fn new(
        task_type: impl Into<String>,
        payload: serde_json::Value,
        required_capabilities: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            task_type: task_type.into(),
            payload,
            required_capabilities: required_capabilities
                .into_iter()
                .map(Into::into)
                .collect(),
            context: HashMap::new(),
        }
    }

    /// Attach caller context.
    pub fn with_context(mut self, context: HashMap<String, serde_json::Value>) -> Self {
        self.context = context;
        self
    }
}

/// Overall health verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthVerdict {
    /// Every component check passed.
    Healthy,
    /// Some checks failed, but fewer than a majority.
    Degraded,
    /// A majority of checks failed.
    Unhealthy,
}

/// Component-level health booleans plus the aggregate verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// Aggregate verdict.
    pub verdict: HealthVerdict,
    /// At least one agent is registered.
    pub registry_has_agents: bool,
    /// The router's pending-task count is below the configured threshold.
    pub router_backlog_ok: bool,
    /// Pool utilization is below 0.9.
    pub pool_capacity_ok: bool,
}

/// The orchestration core façade.
pub struct Orchestrator {
    config: SynapseConfig,
    registry: Arc<AgentRegistry>,
    pool: Arc<ConnectionPool>,
    router: Arc<TaskRouter>,
    history: Arc<TaskHistory>,
    events: EventBus,
    initialized: AtomicBool,
    telemetry_task: RwLock<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Create an orchestrator without a discovery capability.
    pub fn new(config: SynapseConfig, transport: Arc<dyn AgentTransport>) -> Self {
        Self::build(config, transport, None)
    }

    /// Create an orchestrator with a discovery capability.
    pub fn with_discovery(
        config: SynapseConfig,
        transport: Arc<dyn AgentTransport>,
        discovery: Arc<dyn AgentDiscovery>,
    ) -> Self {
        Self::build(config, transport, Some(discovery))
    }

    fn build(
        config: SynapseConfig,
        transport: Arc<dyn AgentTransport>,
        discovery: Option<Arc<dyn AgentDiscovery>>,
    ) -> Self {
        let events = EventBus::new();
        let history = Arc::new(TaskHistory::new(config.telemetry.history_cap));
        let registry = Arc::new(AgentRegistry::new(
            config.registry.clone(),
            config.routing.learning_rate,
            Arc::clone(&transport),
            discovery,
            events.clone(),
        ));
        let pool = Arc::new(ConnectionPool::new(
            config.connection_pool.clone(),
            Arc::clone(&transport),
            events.clone(),
        ));
        let router = Arc::new(TaskRouter::new(
            Arc::clone(&registry),
            Arc::clone(&pool),
            transport,
            config.routing.clone(),
            config.circuit_breaker.clone(),
            Arc::clone(&history),
            events.clone(),
        ));

        Self {
            config,
            registry,
            pool,
            router,
            history,
            events,
            initialized: AtomicBool::new(false),
            telemetry_task: RwLock::new(None),
        }
    }

    /// Start background loops (health checks, discovery, telemetry).
    /// Calling twice is a no-op.
    pub async fn initialize(&self) {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return;
        }

        self.registry
            .start_background_tasks(Arc::clone(&self.pool))
            .await;
        self.pool.start_background_tasks().await;

        if self.config.telemetry.enabled {
            let history = Arc::clone(&self.history);
            let events = self.events.clone();
            let metrics_interval = self.config.telemetry.metrics_interval;
            let retention = self.config.telemetry.retention_period;
            let handle = tokio::spawn(async move {
                let mut ticker = interval(metrics_interval);
                loop {
                    ticker.tick().await;
                    history.prune_older_than(retention).await;
                    let report = history.report().await;
                    events.publish(OrchestratorEvent::MetricsCollected { report });
                }
            });
            *self.telemetry_task.write().await = Some(handle);
        }

        info!("orchestrator initialized");
    }

    /// Register an agent.
    pub async fn register_agent(&self, meta: AgentMetadata) -> Result<()> {
        self.registry.register_agent(meta).await
    }

    /// Unregister an agent and drop its pooled connections.
    pub async fn unregister_agent(&self, agent_id: &AgentId) {
        self.registry.unregister_agent(agent_id).await;
        self.pool.remove_agent(agent_id).await;
    }

    /// Execute one task to a terminal [`TaskResult`].
    ///
    /// The returned future resolves with the result, or fails with
    /// [`SynapseError::TaskTimeout`] when the task's deadline elapses before
    /// a terminal event arrives. The deadline does not cancel the in-flight
    /// attempt loop; a late result is still recorded in history and agent
    /// stats, the caller just no longer sees it.
    pub async fn execute_task(
        &self,
        task_type: impl Into<String>,
        payload: serde_json::Value,
        required_capabilities: impl IntoIterator<Item = impl Into<String>>,
        context: Option<HashMap<String, serde_json::Value>>,
    ) -> Result<TaskResult> {
        let mut request = TaskRequest::new(task_type, payload, required_capabilities);
        if let Some(context) = context {
            request = request.with_context(context);
        }
        self.execute_request(request).await
    }

    /// Execute a prepared [`TaskRequest`].
    pub async fn execute_request(&self, request: TaskRequest) -> Result<TaskResult> {
        let task = self.build_task(request);
        self.execute_built(task).await
    }

    async fn execute_built(&self, task: Task) -> Result<TaskResult> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(SynapseError::NotInitialized);
        }

        let task_id = task.id;
        let deadline = task.timeout;
        let rx = self.router.submit_task(task).await?;

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_closed)) => Err(SynapseError::Other(anyhow::anyhow!(
                "task {task_id} terminated without a result"
            ))),
            Err(_elapsed) => {
                warn!(task_id = %task_id, "task deadline elapsed before a terminal event");
                Err(SynapseError::TaskTimeout { task_id })
            }
        }
    }

    /// Execute a batch concurrently. Every element of the returned vector is
    /// a well-formed [`TaskResult`]; per-task failures are folded into
    /// failed results instead of failing the batch.
    pub async fn execute_tasks(&self, requests: Vec<TaskRequest>) -> Vec<TaskResult> {
        let futures = requests.into_iter().map(|request| async move {
            let task = self.build_task(request);
            let task_id = task.id;
            let started_at = Utc::now();
            let clock = Instant::now();

            match self.execute_built(task).await {
                Ok(result) => result,
                Err(err) => TaskResult {
                    task_id,
                    agent_id: None,
                    success: false,
                    output: None,
                    error: Some(err.to_string()),
                    execution_time_ms: clock.elapsed().as_millis() as u64,
                    metadata: ResultMetadata {
                        started_at,
                        finished_at: Utc::now(),
                        retry_count: 0,
                    },
                },
            }
        });

        futures::future::join_all(futures).await
    }

    /// Compute a metrics snapshot from the bounded result history.
    pub async fn get_metrics(&self) -> MetricsReport {
        self.history.report().await
    }

    /// Aggregate component checks into an overall verdict.
    pub async fn health_check(&self) -> HealthReport {
        let registry_has_agents = self.registry.agent_count().await >= 1;
        let router_backlog_ok =
            self.router.pending_tasks() < self.config.routing.pending_task_threshold;
        let pool_capacity_ok = self.pool.stats().await.utilization < 0.9;

        let green = [registry_has_agents, router_backlog_ok, pool_capacity_ok]
            .iter()
            .filter(|ok| **ok)
            .count();
        let verdict = match green {
            3 => HealthVerdict::Healthy,
            2 => HealthVerdict::Degraded,
            _ => HealthVerdict::Unhealthy,
        };

        HealthReport {
            verdict,
            registry_has_agents,
            router_backlog_ok,
            pool_capacity_ok,
        }
    }

    /// Pre-create connections for every registered agent.
    pub async fn warm_up(&self) {
        let agent_ids: Vec<AgentId> = self
            .registry
            .all_agents()
            .await
            .into_iter()
            .map(|meta| meta.id)
            .collect();
        self.pool.warm_up(&agent_ids).await;
    }

    /// Stop telemetry, then tear down router, pool, and registry
    /// concurrently (best-effort). Calling twice is a no-op.
    pub async fn shutdown(&self) {
        if !self.initialized.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(handle) = self.telemetry_task.write().await.take() {
            handle.abort();
        }

        tokio::join!(
            self.router.shutdown(),
            self.pool.shutdown(),
            self.registry.stop_background_tasks(),
        );

        info!("orchestrator shut down");
    }

    /// Subscribe to lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }

    /// The agent registry.
    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// The connection pool.
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// The task router.
    pub fn router(&self) -> &Arc<TaskRouter> {
        &self.router
    }

    fn build_task(&self, request: TaskRequest) -> Task {
        Task::new(request.task_type, request.payload)
            .with_capabilities(request.required_capabilities)
            .with_timeout(self.config.routing.task_timeout)
            .with_retry_policy(self.config.routing.default_retry_policy.clone())
            .with_context(request.context)
    }
}
