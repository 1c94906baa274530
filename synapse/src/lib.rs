//! Synapse - Task Orchestration Core
//!
//! Synapse distributes discrete units of work across a dynamic pool of
//! capability-tagged worker agents. It selects an agent per task, enforces
//! timeouts and retries, isolates failing agents via per-agent circuit
//! breaking, and reports aggregate performance metrics. The transport that
//! delivers tasks in and carries agent calls out is supplied by the
//! surrounding system through trait seams.
//!
//! # Architecture
//!
//! - `agent` - Agent identity, metadata, and the collaborator trait seams
//! - `registry` - Agent registry with capability lookup and health checks
//! - `pool` - Bounded per-agent connection pooling
//! - `router` - Agent selection, circuit breaking, timeout/retry execution
//! - `strategy` - Round-robin, least-loaded, and adaptive selection
//! - `breaker` - Per-agent circuit breaker state machines
//! - `orchestrator` - The façade tying the components together
//! - `metrics` - Bounded result history and on-demand reports
//! - `events` - Broadcast lifecycle events
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use synapse::{AgentId, AgentMetadata, Orchestrator, SynapseConfig};
//! use synapse::testing::ScriptedTransport;
//!
//! # async fn run() -> synapse::Result<()> {
//! let transport = Arc::new(ScriptedTransport::new());
//! let orchestrator = Orchestrator::new(SynapseConfig::default(), transport);
//! orchestrator.initialize().await;
//!
//! let agent = AgentMetadata::new(AgentId::from_string("worker-1"), ["embedding"]);
//! orchestrator.register_agent(agent).await?;
//!
//! let result = orchestrator
//!     .execute_task("embed", serde_json::json!({"text": "hello"}), ["embedding"], None)
//!     .await?;
//! assert!(result.success);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod agent;
pub mod breaker;
pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod orchestrator;
pub mod pool;
pub mod registry;
pub mod router;
pub mod strategy;
pub mod task;

// Scripted transport/discovery for tests
pub mod testing;

pub use agent::{AgentDiscovery, AgentHealth, AgentId, AgentMetadata, AgentPerformance, AgentTransport};
pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use config::{PoolConfig, RegistryConfig, RoutingConfig, SynapseConfig, TelemetryConfig};
pub use error::{Result, SynapseError};
pub use events::{EventBus, OrchestratorEvent};
pub use metrics::{LatencyPercentiles, MetricsReport, TaskHistory};
pub use orchestrator::{HealthReport, HealthVerdict, Orchestrator, TaskRequest};
pub use pool::{ConnectionId, ConnectionPool, PoolStats};
pub use registry::AgentRegistry;
pub use router::TaskRouter;
pub use strategy::RoutingStrategy;
pub use task::{ResultMetadata, RetryPolicy, Task, TaskId, TaskPriority, TaskResult};

/// Synapse version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
