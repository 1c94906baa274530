//! Agent selection strategies.
//!
//! Given the capability-eligible, circuit-closed candidates for a task, a
//! strategy picks exactly one agent. Ties always break to the lowest agent
//! id so distributions are reproducible.

use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::agent::AgentId;

/// Selection policy for eligible agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingStrategy {
    /// Rotate through eligible agents in registration order.
    #[default]
    RoundRobin,
    /// Pick the eligible agent with the fewest in-flight tasks.
    LeastLoaded,
    /// Pick probabilistically weighted by success score, with occasional
    /// uniform exploration.
    Adaptive,
}

/// One eligible agent as seen at selection time.
#[derive(Debug, Clone)]
pub struct CandidateAgent {
    /// The agent's id.
    pub id: AgentId,
    /// Current EMA success score.
    pub success_score: f64,
    /// Router-tracked in-flight attempt count.
    pub in_flight: usize,
    /// Registration timestamp (drives round-robin ordering).
    pub registered_at: DateTime<Utc>,
}

/// Stateful selector applying one [`RoutingStrategy`].
pub struct AgentSelector {
    strategy: RoutingStrategy,
    exploration_rate: f64,
    rotation: AtomicUsize,
}

impl AgentSelector {
    /// Create a selector. `exploration_rate` only matters for
    /// [`RoutingStrategy::Adaptive`].
    pub fn new(strategy: RoutingStrategy, exploration_rate: f64) -> Self {
        Self {
            strategy,
            exploration_rate: exploration_rate.clamp(0.0, 1.0),
            rotation: AtomicUsize::new(0),
        }
    }

    /// The strategy this selector applies.
    pub fn strategy(&self) -> RoutingStrategy {
        self.strategy
    }

    /// Pick one agent among the candidates, or `None` when the slice is empty.
    pub fn select(&self, candidates: &[CandidateAgent]) -> Option<AgentId> {
        if candidates.is_empty() {
            return None;
        }
        match self.strategy {
            RoutingStrategy::RoundRobin => self.select_round_robin(candidates),
            RoutingStrategy::LeastLoaded => Self::select_least_loaded(candidates),
            RoutingStrategy::Adaptive => self.select_adaptive(candidates),
        }
    }

    fn select_round_robin(&self, candidates: &[CandidateAgent]) -> Option<AgentId> {
        let mut ordered: Vec<&CandidateAgent> = candidates.iter().collect();
        ordered.sort_by(|a, b| {
            a.registered_at
                .cmp(&b.registered_at)
                .then_with(|| a.id.cmp(&b.id))
        });

        let slot = self.rotation.fetch_add(1, Ordering::Relaxed);
        Some(ordered[slot % ordered.len()].id.clone())
    }

    fn select_least_loaded(candidates: &[CandidateAgent]) -> Option<AgentId> {
        candidates
            .iter()
            .min_by(|a, b| a.in_flight.cmp(&b.in_flight).then_with(|| a.id.cmp(&b.id)))
            .map(|c| c.id.clone())
    }

    fn select_adaptive(&self, candidates: &[CandidateAgent]) -> Option<AgentId> {
        let mut rng = rand::rng();

        if self.exploration_rate > 0.0 && rng.random_bool(self.exploration_rate) {
            let idx = rng.random_range(0..candidates.len());
            return Some(candidates[idx].id.clone());
        }

        let total: f64 = candidates.iter().map(|c| c.success_score.max(0.0)).sum();
        if total <= f64::EPSILON {
            // every score has collapsed to zero; fall back to the lowest id
            return candidates.iter().map(|c| &c.id).min().cloned();
        }

        // walk candidates in id order so equal-weight draws stay reproducible
        let mut ordered: Vec<&CandidateAgent> = candidates.iter().collect();
        ordered.sort_by(|a, b| a.id.cmp(&b.id));

        let draw = rng.random::<f64>() * total;
        let mut cumulative = 0.0;
        for candidate in &ordered {
            cumulative += candidate.success_score.max(0.0);
            if draw <= cumulative {
                return Some(candidate.id.clone());
            }
        }
        ordered.last().map(|c| c.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, score: f64, in_flight: usize, seq: i64) -> CandidateAgent {
        CandidateAgent {
            id: AgentId::from_string(id),
            success_score: score,
            in_flight,
            registered_at: DateTime::<Utc>::from_timestamp(1_700_000_000 + seq, 0).unwrap(),
        }
    }

    #[test]
    fn test_round_robin_rotates_in_registration_order() {
        let selector = AgentSelector::new(RoutingStrategy::RoundRobin, 0.0);
        let candidates = vec![
            candidate("c", 1.0, 0, 2),
            candidate("a", 1.0, 0, 0),
            candidate("b", 1.0, 0, 1),
        ];

        let picks: Vec<String> = (0..6)
            .map(|_| selector.select(&candidates).unwrap().to_string())
            .collect();
        assert_eq!(picks, ["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn test_round_robin_is_even_over_multiple_cycles() {
        let selector = AgentSelector::new(RoutingStrategy::RoundRobin, 0.0);
        let candidates = vec![
            candidate("a", 1.0, 0, 0),
            candidate("b", 1.0, 0, 1),
            candidate("c", 1.0, 0, 2),
        ];

        let mut counts = std::collections::HashMap::new();
        for _ in 0..9 {
            let id = selector.select(&candidates).unwrap();
            *counts.entry(id.to_string()).or_insert(0u32) += 1;
        }
        assert_eq!(counts["a"], 3);
        assert_eq!(counts["b"], 3);
        assert_eq!(counts["c"], 3);
    }

    #[test]
    fn test_least_loaded_picks_fewest_in_flight() {
        let selector = AgentSelector::new(RoutingStrategy::LeastLoaded, 0.0);
        let candidates = vec![
            candidate("a", 1.0, 4, 0),
            candidate("b", 1.0, 1, 1),
            candidate("c", 1.0, 2, 2),
        ];
        assert_eq!(selector.select(&candidates).unwrap().as_str(), "b");
    }

    #[test]
    fn test_least_loaded_ties_break_to_lowest_id() {
        let selector = AgentSelector::new(RoutingStrategy::LeastLoaded, 0.0);
        let candidates = vec![
            candidate("c", 1.0, 1, 2),
            candidate("a", 1.0, 1, 0),
            candidate("b", 1.0, 1, 1),
        ];
        assert_eq!(selector.select(&candidates).unwrap().as_str(), "a");
    }

    #[test]
    fn test_adaptive_prefers_high_scores() {
        let selector = AgentSelector::new(RoutingStrategy::Adaptive, 0.0);
        let candidates = vec![candidate("good", 0.95, 0, 0), candidate("bad", 0.05, 0, 1)];

        // weighted random, so assert statistically like the balancer tests do
        let mut good_picks = 0;
        for _ in 0..100 {
            if selector.select(&candidates).unwrap().as_str() == "good" {
                good_picks += 1;
            }
        }
        assert!(good_picks > 60, "good agent picked only {good_picks}/100");
    }

    #[test]
    fn test_adaptive_all_zero_scores_falls_back_to_lowest_id() {
        let selector = AgentSelector::new(RoutingStrategy::Adaptive, 0.0);
        let candidates = vec![
            candidate("b", 0.0, 0, 1),
            candidate("a", 0.0, 0, 0),
            candidate("c", 0.0, 0, 2),
        ];
        assert_eq!(selector.select(&candidates).unwrap().as_str(), "a");
    }

    #[test]
    fn test_empty_candidates_selects_nothing() {
        let selector = AgentSelector::new(RoutingStrategy::RoundRobin, 0.0);
        assert!(selector.select(&[]).is_none());
    }
}
