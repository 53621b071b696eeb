//! Patch selector
//!
//! Ranks shadow-evaluated patches by reward delta with a small latency
//! penalty, disqualifies guard failures and missing metrics, and picks the
//! winner deterministically.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use super::guards::{check_guards, GuardResult};
use super::shadow::ShadowEvalResult;
use crate::config::GuardThresholds;

/// Latency tie-break weight: 100 ms of p95 regression costs 0.001 reward.
pub const LATENCY_PENALTY_PER_MS: f64 = 1e-5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionCandidate {
    pub shadow_result: ShadowEvalResult,
    pub guard_result: GuardResult,
    pub rank_score: f64,
    pub rank_position: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionResult {
    pub winner: Option<SelectionCandidate>,
    pub candidates: Vec<SelectionCandidate>,
    pub filtered_count: usize,
    pub selection_criteria: serde_json::Value,
}

fn rank_score(shadow: &ShadowEvalResult, guard: &GuardResult) -> f64 {
    if !guard.passed {
        return f64::NEG_INFINITY;
    }
    let Some(reward_delta) = shadow.reward_delta else {
        warn!(patch_id = %shadow.patch_id, "missing reward_delta, disqualified");
        return f64::NEG_INFINITY;
    };
    let mut score = reward_delta;
    if let Some(latency_delta) = shadow.latency_p95_delta {
        score -= latency_delta * LATENCY_PENALTY_PER_MS;
    }
    debug!(patch_id = %shadow.patch_id, score, "candidate scored");
    score
}

/// Rank all candidates and pick the first safe one. `require_positive`
/// additionally demands a strictly positive score from the winner.
pub fn rank_and_pick(
    shadow_results: Vec<ShadowEvalResult>,
    thresholds: &GuardThresholds,
    require_positive: bool,
) -> SelectionResult {
    if shadow_results.is_empty() {
        return SelectionResult {
            winner: None,
            candidates: Vec::new(),
            filtered_count: 0,
            selection_criteria: json!({ "reason": "no_candidates" }),
        };
    }

    let total = shadow_results.len();
    let mut candidates: Vec<SelectionCandidate> = shadow_results
        .into_iter()
        .map(|shadow| {
            let guard = check_guards(&shadow, thresholds);
            let score = rank_score(&shadow, &guard);
            SelectionCandidate {
                shadow_result: shadow,
                guard_result: guard,
                rank_score: score,
                rank_position: 0,
            }
        })
        .collect();

    let filtered_count = candidates
        .iter()
        .filter(|c| c.rank_score == f64::NEG_INFINITY)
        .count();

    // Highest score first; equal scores break toward the smaller patch id.
    candidates.sort_by(|a, b| {
        b.rank_score
            .partial_cmp(&a.rank_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.shadow_result.patch_id.cmp(&b.shadow_result.patch_id))
    });
    for (i, candidate) in candidates.iter_mut().enumerate() {
        candidate.rank_position = i + 1;
    }

    let winner = candidates
        .iter()
        .find(|c| {
            c.guard_result.passed
                && c.rank_score.is_finite()
                && (!require_positive || c.rank_score > 0.0)
        })
        .cloned();

    match &winner {
        Some(w) => info!(
            patch_id = %w.shadow_result.patch_id,
            score = w.rank_score,
            "selected winner"
        ),
        None => warn!("no safe candidates after guard filtering"),
    }

    SelectionResult {
        winner,
        candidates,
        filtered_count,
        selection_criteria: json!({
            "algorithm": "reward_delta_primary_latency_tiebreak",
            "primary_metric": "reward_delta",
            "tie_breaker": "latency_p95_delta",
            "latency_penalty_per_ms": LATENCY_PENALTY_PER_MS,
            "require_positive": require_positive,
            "total_evaluated": total,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shadow(patch_id: &str, reward_delta: Option<f64>, latency_delta: f64) -> ShadowEvalResult {
        ShadowEvalResult {
            patch_id: patch_id.to_string(),
            status: "completed".to_string(),
            avg_reward_before: Some(0.5),
            avg_reward_after: reward_delta.map(|d| 0.5 + d),
            error_rate_before: Some(0.0),
            error_rate_after: Some(0.0),
            latency_p95_before: Some(1000.0),
            latency_p95_after: Some(1000.0 + latency_delta),
            reward_delta,
            error_rate_delta: Some(0.0),
            latency_p95_delta: Some(latency_delta),
            tests_run: 3,
            baseline_samples: 1,
            execution_time_ms: 10,
            error_message: None,
        }
    }

    #[test]
    fn best_reward_delta_wins() {
        let result = rank_and_pick(
            vec![shadow("a", Some(0.05), 0.0), shadow("b", Some(0.15), 0.0)],
            &GuardThresholds::default(),
            false,
        );
        assert_eq!(result.winner.unwrap().shadow_result.patch_id, "b");
    }

    #[test]
    fn latency_breaks_reward_ties() {
        let result = rank_and_pick(
            vec![
                shadow("slow", Some(0.10), 400.0),
                shadow("fast", Some(0.10), 0.0),
            ],
            &GuardThresholds::default(),
            false,
        );
        // Equal reward deltas; the 400ms regression costs 0.004 score.
        let winner = result.winner.unwrap();
        assert_eq!(winner.shadow_result.patch_id, "fast");
    }

    #[test]
    fn guard_failures_are_filtered() {
        let mut bad = shadow("bad", Some(0.5), 0.0);
        bad.error_rate_after = Some(0.9);
        let result = rank_and_pick(
            vec![bad, shadow("ok", Some(0.01), 0.0)],
            &GuardThresholds::default(),
            false,
        );
        assert_eq!(result.filtered_count, 1);
        assert_eq!(result.winner.unwrap().shadow_result.patch_id, "ok");
    }

    #[test]
    fn missing_reward_delta_disqualifies() {
        let result = rank_and_pick(
            vec![shadow("noreward", None, 0.0)],
            &GuardThresholds::default(),
            false,
        );
        assert!(result.winner.is_none());
        assert_eq!(result.filtered_count, 1);
    }

    #[test]
    fn equal_scores_tie_break_by_patch_id() {
        let result = rank_and_pick(
            vec![shadow("zzz", Some(0.1), 0.0), shadow("aaa", Some(0.1), 0.0)],
            &GuardThresholds::default(),
            false,
        );
        assert_eq!(result.winner.unwrap().shadow_result.patch_id, "aaa");
    }

    #[test]
    fn require_positive_rejects_non_positive_winners() {
        let result = rank_and_pick(
            vec![shadow("meh", Some(-0.01), 0.0)],
            &GuardThresholds::default(),
            true,
        );
        assert!(result.winner.is_none());
        // Candidate list still carries the ranked entry.
        assert_eq!(result.candidates.len(), 1);
    }

    #[test]
    fn empty_input_has_no_winner() {
        let result = rank_and_pick(vec![], &GuardThresholds::default(), false);
        assert!(result.winner.is_none());
        assert_eq!(result.selection_criteria["reason"], "no_candidates");
    }

    #[test]
    fn rank_positions_are_assigned_in_order() {
        let result = rank_and_pick(
            vec![
                shadow("mid", Some(0.05), 0.0),
                shadow("top", Some(0.2), 0.0),
                shadow("low", Some(0.01), 0.0),
            ],
            &GuardThresholds::default(),
            false,
        );
        let order: Vec<(String, usize)> = result
            .candidates
            .iter()
            .map(|c| (c.shadow_result.patch_id.clone(), c.rank_position))
            .collect();
        assert_eq!(order[0], ("top".to_string(), 1));
        assert_eq!(order[1], ("mid".to_string(), 2));
        assert_eq!(order[2], ("low".to_string(), 3));
    }
}
