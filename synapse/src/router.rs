//! Task routing and execution.
//!
//! One spawned loop owns each submitted task: select an agent (capability
//! eligibility, then the circuit-breaker gate, then the configured
//! strategy), execute the attempt over a pooled connection under the task's
//! timeout, and retry with exponential backoff until success or the retry
//! budget runs out. Exactly one [`TaskResult`] comes out the other end.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use chrono::Utc;
use tokio::sync::{RwLock, oneshot};
use tracing::{debug, info, warn};

use crate::agent::{AgentId, AgentTransport};
use crate::breaker::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};
use crate::config::RoutingConfig;
use crate::error::{Result, SynapseError};
use crate::events::{EventBus, OrchestratorEvent};
use crate::metrics::TaskHistory;
use crate::pool::ConnectionPool;
use crate::registry::AgentRegistry;
use crate::strategy::{AgentSelector, CandidateAgent};
use crate::task::{ResultMetadata, Task, TaskResult};

/// Routes tasks onto agents and drives them to a terminal result.
pub struct TaskRouter {
    registry: Arc<AgentRegistry>,
    pool: Arc<ConnectionPool>,
    transport: Arc<dyn AgentTransport>,
    breakers: CircuitBreakerRegistry,
    breaker_config: CircuitBreakerConfig,
    selector: AgentSelector,
    routing: RoutingConfig,
    events: EventBus,
    history: Arc<TaskHistory>,
    in_flight: RwLock<HashMap<AgentId, usize>>,
    pending: AtomicUsize,
}

impl TaskRouter {
    /// Create a router over the given registry, pool, and transport.
    pub fn new(
        registry: Arc<AgentRegistry>,
        pool: Arc<ConnectionPool>,
        transport: Arc<dyn AgentTransport>,
        routing: RoutingConfig,
        breaker_config: CircuitBreakerConfig,
        history: Arc<TaskHistory>,
        events: EventBus,
    ) -> Self {
        let selector = AgentSelector::new(routing.effective_strategy(), routing.exploration_rate);
        Self {
            registry,
            pool,
            transport,
            breakers: CircuitBreakerRegistry::new(),
            breaker_config,
            selector,
            routing,
            events,
            history,
            in_flight: RwLock::new(HashMap::new()),
            pending: AtomicUsize::new(0),
        }
    }

    /// Validate eligibility and start working the task. Returns immediately
    /// with a receiver for the terminal [`TaskResult`].
    ///
    /// Fails with [`SynapseError::NoEligibleAgent`] when no registered agent
    /// advertises the required capabilities; in that case no agent is ever
    /// invoked.
    pub async fn submit_task(self: &Arc<Self>, task: Task) -> Result<oneshot::Receiver<TaskResult>> {
        let eligible = self
            .registry
            .find_agents_by_capabilities(&task.required_capabilities)
            .await;
        if eligible.is_empty() {
            let mut required: Vec<String> =
                task.required_capabilities.iter().cloned().collect();
            required.sort();
            return Err(SynapseError::NoEligibleAgent { required });
        }

        debug!(task_id = %task.id, task_type = %task.task_type, "task submitted");
        self.events.publish(OrchestratorEvent::TaskSubmitted { task_id: task.id });
        self.pending.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = oneshot::channel();
        let router = Arc::clone(self);
        tokio::spawn(async move {
            router.run_task(task, tx).await;
        });
        Ok(rx)
    }

    /// Tasks submitted but not yet terminal.
    pub fn pending_tasks(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Snapshot of every tracked circuit breaker.
    pub async fn circuit_states(&self) -> HashMap<AgentId, CircuitState> {
        self.breakers.states().await
    }

    /// In-flight attempt count for one agent.
    pub async fn in_flight_for(&self, agent_id: &AgentId) -> usize {
        *self.in_flight.read().await.get(agent_id).unwrap_or(&0)
    }

    /// Best-effort drain: waits briefly for spawned task loops to finish.
    pub async fn shutdown(&self) {
        let deadline = Instant::now() + std::time::Duration::from_secs(5);
        while self.pending_tasks() > 0 && Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        let left = self.pending_tasks();
        if left > 0 {
            warn!(pending = left, "router shutting down with tasks still in flight");
        }
    }

    async fn run_task(self: Arc<Self>, task: Task, tx: oneshot::Sender<TaskResult>) {
        let policy = task
            .retry_policy
            .clone()
            .unwrap_or_else(|| self.routing.default_retry_policy.clone());
        let started_at = Utc::now();
        let clock = Instant::now();
        let mut retry_count: u32 = 0;

        let result = loop {
            let agent_id = match self.select_agent(&task).await {
                Ok(id) => id,
                Err(err) => {
                    break self.failure_result(&task, None, &err, retry_count, started_at, clock);
                }
            };

            self.events.publish(OrchestratorEvent::TaskStarted {
                task_id: task.id,
                agent_id: agent_id.clone(),
                attempt: retry_count,
            });

            let attempt_start = Instant::now();
            self.track_start(&agent_id).await;
            let outcome = self.execute_attempt(&task, &agent_id).await;
            self.track_finish(&agent_id).await;
            let attempt_elapsed = attempt_start.elapsed();

            match outcome {
                Ok(output) => {
                    self.registry
                        .update_agent_stats(&agent_id, true, attempt_elapsed)
                        .await;
                    self.record_breaker_outcome(&agent_id, true).await;
                    break self.success_result(
                        &task,
                        agent_id,
                        output,
                        retry_count,
                        started_at,
                        clock,
                    );
                }
                Err(err) => {
                    if err.is_retryable() {
                        self.registry
                            .update_agent_stats(&agent_id, false, attempt_elapsed)
                            .await;
                        self.record_breaker_outcome(&agent_id, false).await;

                        if retry_count < policy.max_retries {
                            let delay =
                                policy.backoff_delay(self.routing.base_retry_delay, retry_count);
                            warn!(
                                task_id = %task.id,
                                agent_id = %agent_id,
                                retry = retry_count + 1,
                                delay_ms = delay.as_millis() as u64,
                                error = %err,
                                "attempt failed, backing off before retry"
                            );
                            tokio::time::sleep(delay).await;
                            retry_count += 1;
                            continue;
                        }
                    }
                    break self.failure_result(
                        &task,
                        Some(agent_id),
                        &err,
                        retry_count,
                        started_at,
                        clock,
                    );
                }
            }
        };

        self.pending.fetch_sub(1, Ordering::SeqCst);

        if result.success {
            info!(task_id = %task.id, execution_time_ms = result.execution_time_ms, "task completed");
            self.events.publish(OrchestratorEvent::TaskCompleted {
                task_id: task.id,
                result: result.clone(),
            });
        } else {
            warn!(task_id = %task.id, error = result.error.as_deref().unwrap_or(""), "task failed");
            self.events.publish(OrchestratorEvent::TaskFailed {
                task_id: task.id,
                error: result.error.clone().unwrap_or_default(),
            });
        }

        self.history.record(result.clone()).await;
        // the caller may have timed out and dropped the receiver; the late
        // result has already been recorded above
        let _ = tx.send(result);
    }

    /// Pick one agent: capability eligibility, circuit-breaker gate, then
    /// the configured strategy.
    async fn select_agent(&self, task: &Task) -> Result<AgentId> {
        let eligible = self
            .registry
            .find_agents_by_capabilities(&task.required_capabilities)
            .await;
        if eligible.is_empty() {
            let mut required: Vec<String> =
                task.required_capabilities.iter().cloned().collect();
            required.sort();
            return Err(SynapseError::NoEligibleAgent { required });
        }

        let mut admitted = Vec::with_capacity(eligible.len());
        for meta in eligible {
            let breaker = self
                .breakers
                .get_or_create(&meta.id, self.breaker_config.clone())
                .await;
            let allowed = breaker.write().await.can_execute();
            if allowed {
                admitted.push(meta);
            }
        }
        if admitted.is_empty() {
            return Err(SynapseError::NoHealthyAgent);
        }

        let candidates: Vec<CandidateAgent> = {
            let in_flight = self.in_flight.read().await;
            admitted
                .into_iter()
                .map(|meta| CandidateAgent {
                    in_flight: *in_flight.get(&meta.id).unwrap_or(&0),
                    success_score: meta.performance.success_score,
                    registered_at: meta.registered_at,
                    id: meta.id,
                })
                .collect()
        };

        let chosen = self
            .selector
            .select(&candidates)
            .ok_or(SynapseError::NoHealthyAgent)?;

        if let Some(breaker) = self.breakers.get(&chosen).await {
            breaker.write().await.note_attempt();
        }
        debug!(task_id = %task.id, agent_id = %chosen, "agent selected");
        Ok(chosen)
    }

    /// Run one attempt: acquire a connection and invoke the agent, with the
    /// whole attempt bounded by `task.timeout`. The connection is returned
    /// on every path: released when the invocation finished, discarded when
    /// it timed out mid-flight.
    async fn execute_attempt(
        &self,
        task: &Task,
        agent_id: &AgentId,
    ) -> Result<serde_json::Value> {
        let attempt_start = Instant::now();
        let acquire_budget = self.pool.acquire_timeout().min(task.timeout);
        let connection_id = self.pool.acquire_within(agent_id, acquire_budget).await?;

        let remaining = task.timeout.saturating_sub(attempt_start.elapsed());
        if remaining.is_zero() {
            self.pool.release(agent_id, &connection_id).await;
            return Err(SynapseError::AgentInvocation {
                agent_id: agent_id.clone(),
                message: "attempt budget spent acquiring a connection".to_string(),
            });
        }

        match tokio::time::timeout(
            remaining,
            self.transport.invoke(agent_id, &connection_id, &task.payload),
        )
        .await
        {
            Ok(Ok(output)) => {
                self.pool.release(agent_id, &connection_id).await;
                Ok(output)
            }
            Ok(Err(err)) => {
                self.pool.release(agent_id, &connection_id).await;
                Err(err)
            }
            Err(_elapsed) => {
                // the invocation is still running somewhere; the connection
                // state is unknown, so drop it rather than pool it
                self.pool.discard(agent_id, &connection_id).await;
                Err(SynapseError::AgentInvocation {
                    agent_id: agent_id.clone(),
                    message: format!("attempt timed out after {:?}", task.timeout),
                })
            }
        }
    }

    async fn record_breaker_outcome(&self, agent_id: &AgentId, success: bool) {
        let breaker = self
            .breakers
            .get_or_create(agent_id, self.breaker_config.clone())
            .await;
        let mut guard = breaker.write().await;
        let before = guard.state();
        if success {
            guard.record_success();
        } else {
            guard.record_failure();
        }
        let after = guard.state();
        drop(guard);

        if before != after {
            match after {
                CircuitState::Open => {
                    warn!(agent_id = %agent_id, "circuit breaker opened");
                    self.events.publish(OrchestratorEvent::CircuitOpened {
                        agent_id: agent_id.clone(),
                    });
                }
                CircuitState::Closed => {
                    info!(agent_id = %agent_id, "circuit breaker closed");
                    self.events.publish(OrchestratorEvent::CircuitClosed {
                        agent_id: agent_id.clone(),
                    });
                }
                CircuitState::HalfOpen => {}
            }
        }
    }

    async fn track_start(&self, agent_id: &AgentId) {
        let mut in_flight = self.in_flight.write().await;
        *in_flight.entry(agent_id.clone()).or_insert(0) += 1;
    }

    async fn track_finish(&self, agent_id: &AgentId) {
        let mut in_flight = self.in_flight.write().await;
        if let Some(count) = in_flight.get_mut(agent_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                in_flight.remove(agent_id);
            }
        }
    }

    fn success_result(
        &self,
        task: &Task,
        agent_id: AgentId,
        output: serde_json::Value,
        retry_count: u32,
        started_at: chrono::DateTime<Utc>,
        clock: Instant,
    ) -> TaskResult {
        TaskResult {
            task_id: task.id,
            agent_id: Some(agent_id),
            success: true,
            output: Some(output),
            error: None,
            execution_time_ms: clock.elapsed().as_millis() as u64,
            metadata: ResultMetadata {
                started_at,
                finished_at: Utc::now(),
                retry_count,
            },
        }
    }

    fn failure_result(
        &self,
        task: &Task,
        agent_id: Option<AgentId>,
        error: &SynapseError,
        retry_count: u32,
        started_at: chrono::DateTime<Utc>,
        clock: Instant,
    ) -> TaskResult {
        TaskResult {
            task_id: task.id,
            agent_id,
            success: false,
            output: None,
            error: Some(error.to_string()),
            execution_time_ms: clock.elapsed().as_millis() as u64,
            metadata: ResultMetadata {
                started_at,
                finished_at: Utc::now(),
                retry_count,
            },
        }
    }
}
