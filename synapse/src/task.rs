//! Task and task-result types.
//!
//! A [`Task`] is immutable once built: the orchestrator constructs it, the
//! router consumes it, and exactly one [`TaskResult`] is produced per task
//! after all retries are exhausted or a success occurs.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::AgentId;

/// Globally unique task identifier.
pub type TaskId = Uuid;

/// Task priority, ordered from `Low` to `Critical`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    /// Background work.
    Low,
    /// Normal work.
    #[default]
    Medium,
    /// Latency-sensitive work.
    High,
    /// Must-run work.
    Critical,
}

/// Retry schedule for failed attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the initial attempt (0 disables retries).
    pub max_retries: u32,
    /// Multiplier applied per retry on top of the base delay.
    pub backoff_multiplier: f64,
    /// Upper bound on a single backoff delay.
    #[serde(with = "crate::config::serde_duration")]
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry following attempt number `retry_count`:
    /// `min(base * multiplier^retry_count, max_backoff)`.
    pub fn backoff_delay(&self, base: Duration, retry_count: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(retry_count.min(32) as i32);
        let delay_ms = (base.as_millis() as f64 * factor.max(0.0))
            .min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(delay_ms as u64)
    }
}

/// A discrete unit of work to route onto an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Globally unique id.
    pub id: TaskId,
    /// Caller-defined task type tag.
    pub task_type: String,
    /// Opaque payload handed to the agent on invocation.
    pub payload: serde_json::Value,
    /// Capabilities an agent must advertise to be eligible.
    pub required_capabilities: HashSet<String>,
    /// Scheduling priority.
    pub priority: TaskPriority,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Per-attempt execution budget (connection acquire + invoke).
    #[serde(with = "crate::config::serde_duration")]
    pub timeout: Duration,
    /// Opaque caller metadata carried alongside the task.
    pub context: HashMap<String, serde_json::Value>,
    /// Retry schedule; the router falls back to the configured default when absent.
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
}

impl Task {
    /// Create a task with defaults: medium priority, 30s timeout, no
    /// capability requirements.
    pub fn new(task_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_type: task_type.into(),
            payload,
            required_capabilities: HashSet::new(),
            priority: TaskPriority::Medium,
            created_at: Utc::now(),
            timeout: Duration::from_secs(30),
            context: HashMap::new(),
            retry_policy: None,
        }
    }

    /// Replace the required capability set.
    pub fn with_capabilities(mut self, caps: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.required_capabilities = caps.into_iter().map(Into::into).collect();
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Attach caller context.
    pub fn with_context(mut self, context: HashMap<String, serde_json::Value>) -> Self {
        self.context = context;
        self
    }

    /// Attach an explicit retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }
}

/// Timing and retry bookkeeping attached to every result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultMetadata {
    /// When the router began working the task.
    pub started_at: DateTime<Utc>,
    /// When the terminal outcome was reached.
    pub finished_at: DateTime<Utc>,
    /// Retries consumed before the terminal outcome.
    pub retry_count: u32,
}

/// The terminal outcome of a task, produced exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    /// The task this result belongs to.
    pub task_id: TaskId,
    /// The agent that produced the outcome; `None` when no attempt ever
    /// reached an agent (e.g. selection failed outright).
    pub agent_id: Option<AgentId>,
    /// Whether the task succeeded.
    pub success: bool,
    /// Agent response payload on success.
    pub output: Option<serde_json::Value>,
    /// Terminal error description on failure.
    pub error: Option<String>,
    /// Wall-clock milliseconds from submission to terminal outcome.
    pub execution_time_ms: u64,
    /// Timing and retry bookkeeping.
    pub metadata: ResultMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_builder_defaults() {
        let task = Task::new("embed", json!({"text": "hello"}));
        assert_eq!(task.priority, TaskPriority::Medium);
        assert_eq!(task.timeout, Duration::from_secs(30));
        assert!(task.required_capabilities.is_empty());
        assert!(task.retry_policy.is_none());
    }

    #[test]
    fn test_task_builder_chaining() {
        let task = Task::new("embed", json!({}))
            .with_capabilities(["embedding", "gpu"])
            .with_priority(TaskPriority::Critical)
            .with_timeout(Duration::from_secs(5));

        assert_eq!(task.required_capabilities.len(), 2);
        assert!(task.required_capabilities.contains("gpu"));
        assert_eq!(task.priority, TaskPriority::Critical);
        assert_eq!(task.timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::Low < TaskPriority::Medium);
        assert!(TaskPriority::High < TaskPriority::Critical);
    }

    #[test]
    fn test_backoff_delay_schedule() {
        let policy = RetryPolicy {
            max_retries: 5,
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_millis(400),
        };
        let base = Duration::from_millis(100);

        assert_eq!(policy.backoff_delay(base, 0), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(base, 1), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(base, 2), Duration::from_millis(400));
        // capped at max_backoff from here on
        assert_eq!(policy.backoff_delay(base, 3), Duration::from_millis(400));
        assert_eq!(policy.backoff_delay(base, 10), Duration::from_millis(400));
    }

    #[test]
    fn test_task_serde_round_trip() {
        let task = Task::new("summarize", json!({"doc": "abc"}))
            .with_capabilities(["nlp"])
            .with_retry_policy(RetryPolicy::default());
        let json = serde_json::to_string(&task).unwrap();
        let parsed: Task = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.id, task.id);
        assert_eq!(parsed.task_type, "summarize");
        assert!(parsed.required_capabilities.contains("nlp"));
        assert!(parsed.retry_policy.is_some());
    }
}
