//! Lifecycle events published by the core.
//!
//! A single broadcast bus fans events out to any number of subscribers
//! (dashboards, loggers). Delivery is lossy for subscribers that fall
//! behind; within one task, events are published in causal order.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::agent::{AgentHealth, AgentId};
use crate::metrics::MetricsReport;
use crate::pool::ConnectionId;
use crate::task::{TaskId, TaskResult};

/// Default buffer size for the event channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Events emitted by the orchestration core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OrchestratorEvent {
    /// An agent was added to the registry.
    AgentRegistered {
        /// The registered agent.
        agent_id: AgentId,
    },
    /// An agent was removed from the registry.
    AgentUnregistered {
        /// The removed agent.
        agent_id: AgentId,
    },
    /// A health probe observed a transition.
    AgentHealthChanged {
        /// The probed agent.
        agent_id: AgentId,
        /// Health before the probe.
        previous: AgentHealth,
        /// Health after the probe.
        current: AgentHealth,
    },
    /// A task passed eligibility validation and entered the router.
    TaskSubmitted {
        /// The submitted task.
        task_id: TaskId,
    },
    /// An execution attempt began on an agent.
    TaskStarted {
        /// The task being attempted.
        task_id: TaskId,
        /// The agent selected for this attempt.
        agent_id: AgentId,
        /// Zero-based attempt number (equals retries consumed so far).
        attempt: u32,
    },
    /// A task reached a successful terminal outcome.
    TaskCompleted {
        /// The finished task.
        task_id: TaskId,
        /// Its result.
        result: TaskResult,
    },
    /// A task reached a failed terminal outcome.
    TaskFailed {
        /// The failed task.
        task_id: TaskId,
        /// The terminal error description.
        error: String,
    },
    /// An agent's circuit breaker tripped open.
    CircuitOpened {
        /// The isolated agent.
        agent_id: AgentId,
    },
    /// An agent's circuit breaker closed again.
    CircuitClosed {
        /// The recovered agent.
        agent_id: AgentId,
    },
    /// The pool created a connection.
    ConnectionCreated {
        /// Owning agent.
        agent_id: AgentId,
        /// The new connection.
        connection_id: ConnectionId,
    },
    /// The pool closed and dropped a connection.
    ConnectionRemoved {
        /// Owning agent.
        agent_id: AgentId,
        /// The removed connection.
        connection_id: ConnectionId,
    },
    /// Periodic metrics snapshot.
    MetricsCollected {
        /// The snapshot.
        report: MetricsReport,
    },
}

/// Broadcast bus carrying [`OrchestratorEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<OrchestratorEvent>,
}

impl EventBus {
    /// Create a bus with the default buffer capacity.
    pub fn new() -> Self {
        Self::with_capacity(EVENT_CHANNEL_CAPACITY)
    }

    /// Create a bus with an explicit buffer capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event. Events with no subscribers are dropped.
    pub fn publish(&self, event: OrchestratorEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        let agent_id = AgentId::from_string("a1");
        bus.publish(OrchestratorEvent::AgentRegistered {
            agent_id: agent_id.clone(),
        });

        match rx.recv().await.unwrap() {
            OrchestratorEvent::AgentRegistered { agent_id: got } => assert_eq!(got, agent_id),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(OrchestratorEvent::AgentUnregistered {
            agent_id: AgentId::from_string("gone"),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }
}
