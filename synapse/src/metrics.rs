//! Metrics aggregation over the bounded task-result history.
//!
//! Results arrive in arbitrary order across tasks; the history treats them
//! as an unordered multiset. Reports are computed on demand, never cached.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::agent::AgentId;
use crate::task::TaskResult;

/// Latency percentiles over recorded execution times, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyPercentiles {
    /// Median.
    pub p50_ms: u64,
    /// 95th percentile.
    pub p95_ms: u64,
    /// 99th percentile.
    pub p99_ms: u64,
}

/// On-demand metrics snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsReport {
    /// When this report was generated.
    pub generated_at: DateTime<Utc>,
    /// Seconds since the history began.
    pub uptime_secs: f64,
    /// Results currently in the history window.
    pub total_tasks: u64,
    /// Successful results in the window.
    pub successful_tasks: u64,
    /// Failed results in the window.
    pub failed_tasks: u64,
    /// Mean execution time in milliseconds.
    pub avg_duration_ms: f64,
    /// Throughput over uptime.
    pub tasks_per_second: f64,
    /// Failed share of the window, in [0, 1].
    pub error_rate: f64,
    /// Share of the window each agent executed, in [0, 1].
    pub agent_utilization: HashMap<AgentId, f64>,
    /// Latency percentiles.
    pub latency: LatencyPercentiles,
}

/// Bounded in-memory window of task results.
pub struct TaskHistory {
    results: RwLock<VecDeque<TaskResult>>,
    cap: usize,
    started_at: Instant,
}

impl TaskHistory {
    /// Create a history holding at most `cap` results.
    pub fn new(cap: usize) -> Self {
        Self {
            results: RwLock::new(VecDeque::with_capacity(cap.min(1024))),
            cap,
            started_at: Instant::now(),
        }
    }

    /// Append a result, evicting the oldest entries past the cap.
    pub async fn record(&self, result: TaskResult) {
        let mut results = self.results.write().await;
        results.push_back(result);
        while results.len() > self.cap {
            results.pop_front();
        }
    }

    /// Drop results older than `retention`.
    pub async fn prune_older_than(&self, retention: Duration) {
        let Ok(age) = chrono::Duration::from_std(retention) else {
            return;
        };
        let cutoff = Utc::now() - age;
        let mut results = self.results.write().await;
        results.retain(|r| r.metadata.finished_at >= cutoff);
    }

    /// Number of results currently held.
    pub async fn len(&self) -> usize {
        self.results.read().await.len()
    }

    /// Whether the history is empty.
    pub async fn is_empty(&self) -> bool {
        self.results.read().await.is_empty()
    }

    /// Compute a report over the current window.
    pub async fn report(&self) -> MetricsReport {
        let results = self.results.read().await;

        let total = results.len() as u64;
        let successful = results.iter().filter(|r| r.success).count() as u64;
        let failed = total - successful;

        let mut durations: Vec<u64> = results.iter().map(|r| r.execution_time_ms).collect();
        durations.sort_unstable();

        let avg_duration_ms = if durations.is_empty() {
            0.0
        } else {
            durations.iter().sum::<u64>() as f64 / durations.len() as f64
        };

        let uptime_secs = self.started_at.elapsed().as_secs_f64();
        let tasks_per_second = if uptime_secs > f64::EPSILON {
            total as f64 / uptime_secs
        } else {
            0.0
        };

        let error_rate = if total > 0 {
            failed as f64 / total as f64
        } else {
            0.0
        };

        let mut agent_counts: HashMap<AgentId, u64> = HashMap::new();
        for result in results.iter() {
            if let Some(agent_id) = &result.agent_id {
                *agent_counts.entry(agent_id.clone()).or_insert(0) += 1;
            }
        }
        let agent_utilization = agent_counts
            .into_iter()
            .map(|(id, count)| (id, count as f64 / total.max(1) as f64))
            .collect();

        MetricsReport {
            generated_at: Utc::now(),
            uptime_secs,
            total_tasks: total,
            successful_tasks: successful,
            failed_tasks: failed,
            avg_duration_ms,
            tasks_per_second,
            error_rate,
            agent_utilization,
            latency: LatencyPercentiles {
                p50_ms: percentile_ms(&durations, 50.0),
                p95_ms: percentile_ms(&durations, 95.0),
                p99_ms: percentile_ms(&durations, 99.0),
            },
        }
    }
}

/// Nearest-rank percentile: index `ceil(p/100 * n) - 1`, clamped.
fn percentile_ms(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    let idx = rank.saturating_sub(1).min(sorted.len() - 1);
    sorted[idx]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::ResultMetadata;
    use uuid::Uuid;

    fn result(agent: Option<&str>, success: bool, ms: u64) -> TaskResult {
        let now = Utc::now();
        TaskResult {
            task_id: Uuid::new_v4(),
            agent_id: agent.map(AgentId::from_string),
            success,
            output: None,
            error: if success { None } else { Some("boom".to_string()) },
            execution_time_ms: ms,
            metadata: ResultMetadata {
                started_at: now,
                finished_at: now,
                retry_count: 0,
            },
        }
    }

    #[test]
    fn test_percentile_nearest_rank() {
        let values: Vec<u64> = (1..=100).collect();
        assert_eq!(percentile_ms(&values, 50.0), 50);
        assert_eq!(percentile_ms(&values, 95.0), 95);
        assert_eq!(percentile_ms(&values, 99.0), 99);
        assert_eq!(percentile_ms(&values, 100.0), 100);
    }

    #[test]
    fn test_percentile_small_and_empty_inputs() {
        assert_eq!(percentile_ms(&[], 95.0), 0);
        assert_eq!(percentile_ms(&[42], 50.0), 42);
        assert_eq!(percentile_ms(&[42], 99.0), 42);
        // n = 4: p50 -> ceil(2) - 1 = index 1
        assert_eq!(percentile_ms(&[10, 20, 30, 40], 50.0), 20);
    }

    #[tokio::test]
    async fn test_report_over_known_durations() {
        let history = TaskHistory::new(10_000);
        for ms in 1..=100u64 {
            history.record(result(Some("a1"), true, ms)).await;
        }

        let report = history.report().await;
        assert_eq!(report.total_tasks, 100);
        assert_eq!(report.successful_tasks, 100);
        assert_eq!(report.latency.p50_ms, 50);
        assert_eq!(report.latency.p95_ms, 95);
        assert_eq!(report.latency.p99_ms, 99);
        assert!((report.avg_duration_ms - 50.5).abs() < 1e-9);
        assert_eq!(report.error_rate, 0.0);
    }

    #[tokio::test]
    async fn test_error_rate_and_agent_utilization() {
        let history = TaskHistory::new(10_000);
        history.record(result(Some("a1"), true, 10)).await;
        history.record(result(Some("a1"), true, 10)).await;
        history.record(result(Some("a2"), false, 10)).await;
        history.record(result(None, false, 10)).await;

        let report = history.report().await;
        assert_eq!(report.total_tasks, 4);
        assert_eq!(report.failed_tasks, 2);
        assert!((report.error_rate - 0.5).abs() < f64::EPSILON);
        assert!((report.agent_utilization[&AgentId::from_string("a1")] - 0.5).abs() < f64::EPSILON);
        assert!(
            (report.agent_utilization[&AgentId::from_string("a2")] - 0.25).abs() < f64::EPSILON
        );
    }

    #[tokio::test]
    async fn test_history_cap_evicts_oldest() {
        let history = TaskHistory::new(5);
        for ms in 0..10u64 {
            history.record(result(Some("a1"), true, ms)).await;
        }
        assert_eq!(history.len().await, 5);

        let report = history.report().await;
        // only the newest five (5..=9) remain
        assert_eq!(report.latency.p50_ms, 7);
    }

    #[tokio::test]
    async fn test_empty_history_report_is_zeroed() {
        let history = TaskHistory::new(100);
        let report = history.report().await;
        assert_eq!(report.total_tasks, 0);
        assert_eq!(report.error_rate, 0.0);
        assert_eq!(report.latency.p99_ms, 0);
        assert!(report.agent_utilization.is_empty());
    }
}
