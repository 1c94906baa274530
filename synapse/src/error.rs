//! Error taxonomy for the orchestration core.

use crate::agent::AgentId;
use crate::task::TaskId;

/// Result type for orchestration operations
pub type Result<T> = std::result::Result<T, SynapseError>;

/// Errors surfaced by the orchestration core.
///
/// Only [`SynapseError::AgentInvocation`] is retryable; every other kind is
/// terminal for the task that produced it and is surfaced to the caller
/// directly.
#[derive(Debug, thiserror::Error)]
pub enum SynapseError {
    /// The registry already holds the configured maximum number of agents.
    #[error("agent capacity exceeded: registry is limited to {max} agents")]
    CapacityExceeded {
        /// Configured `registry.max_agents` limit.
        max: usize,
    },

    /// No registered agent advertises every required capability.
    #[error("no eligible agent for capabilities {required:?}")]
    NoEligibleAgent {
        /// The capabilities the task asked for.
        required: Vec<String>,
    },

    /// Every capability-eligible agent is currently circuit-open.
    #[error("all eligible agents are circuit-open")]
    NoHealthyAgent,

    /// No connection became available within the acquire timeout.
    #[error("connection pool exhausted for agent {agent_id}")]
    PoolExhausted {
        /// Agent whose pool was saturated.
        agent_id: AgentId,
    },

    /// The task's overall deadline elapsed before a terminal event arrived.
    #[error("task {task_id} timed out before completing")]
    TaskTimeout {
        /// The task that timed out.
        task_id: TaskId,
    },

    /// The agent call itself failed (or timed out mid-attempt).
    #[error("agent {agent_id} invocation failed: {message}")]
    AgentInvocation {
        /// Agent that was being invoked.
        agent_id: AgentId,
        /// Wrapped error from the transport.
        message: String,
    },

    /// Operation requires `initialize()` to have been called first.
    #[error("orchestrator is not initialized")]
    NotInitialized,

    /// Anything else.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SynapseError {
    /// Whether the router may retry the attempt that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SynapseError::AgentInvocation { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_invocation_errors_are_retryable() {
        let retryable = SynapseError::AgentInvocation {
            agent_id: AgentId::from_string("a1"),
            message: "boom".to_string(),
        };
        assert!(retryable.is_retryable());

        assert!(!SynapseError::NoHealthyAgent.is_retryable());
        assert!(
            !SynapseError::PoolExhausted {
                agent_id: AgentId::from_string("a1"),
            }
            .is_retryable()
        );
        assert!(!SynapseError::CapacityExceeded { max: 4 }.is_retryable());
    }

    #[test]
    fn test_error_display_includes_context() {
        let err = SynapseError::NoEligibleAgent {
            required: vec!["gpu".to_string(), "vision".to_string()],
        };
        let rendered = err.to_string();
        assert!(rendered.contains("gpu"));
        assert!(rendered.contains("vision"));
    }
}
