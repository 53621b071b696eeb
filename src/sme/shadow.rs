//! Shadow evaluation
//!
//! Runs a deterministic Golden subset through the pipeline twice, baseline
//! and patched in an isolated worktree, and reports metric
//! deltas. Shadow runs have no user-visible side effects: no session, no
//! realtime subscribers, no live memory writes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::applier::DryRunApplier;
use super::golden::{load_golden_items, GoldenItem};
use super::types::MetaPatch;

/// Metrics from one golden item run.
#[derive(Debug, Clone)]
pub struct GoldenRunMetrics {
    pub reward: Option<f64>,
    pub cost_penalty: f64,
    pub error_rate: f64,
    pub latency_ms: f64,
}

/// The pipeline shadow evaluation drives. `shadow_root` is `Some` when the
/// item must execute against the patched worktree instead of the live tree.
#[async_trait]
pub trait GoldenPipeline: Send + Sync {
    async fn run_item(
        &self,
        item: &GoldenItem,
        shadow_root: Option<&Path>,
    ) -> Result<GoldenRunMetrics>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowEvalResult {
    pub patch_id: String,
    pub status: String,
    pub avg_reward_before: Option<f64>,
    pub avg_reward_after: Option<f64>,
    pub error_rate_before: Option<f64>,
    pub error_rate_after: Option<f64>,
    pub latency_p95_before: Option<f64>,
    pub latency_p95_after: Option<f64>,
    pub reward_delta: Option<f64>,
    pub error_rate_delta: Option<f64>,
    pub latency_p95_delta: Option<f64>,
    pub tests_run: usize,
    pub baseline_samples: usize,
    pub execution_time_ms: u64,
    pub error_message: Option<String>,
}

impl ShadowEvalResult {
    fn new(patch_id: &str) -> Self {
        Self {
            patch_id: patch_id.to_string(),
            status: "running".to_string(),
            avg_reward_before: None,
            avg_reward_after: None,
            error_rate_before: None,
            error_rate_after: None,
            latency_p95_before: None,
            latency_p95_after: None,
            reward_delta: None,
            error_rate_delta: None,
            latency_p95_delta: None,
            tests_run: 0,
            baseline_samples: 0,
            execution_time_ms: 0,
            error_message: None,
        }
    }

    pub fn is_improvement(&self, min_reward_delta: f64) -> bool {
        self.reward_delta
            .map(|d| d >= min_reward_delta)
            .unwrap_or(false)
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// 95th percentile; max of the sample when there are fewer than 20 points.
fn latency_p95(latencies: &[f64]) -> Option<f64> {
    if latencies.is_empty() {
        return None;
    }
    let mut sorted = latencies.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    if sorted.len() < 20 {
        return sorted.last().copied();
    }
    let idx = ((sorted.len() as f64) * 0.95).ceil() as usize - 1;
    sorted.get(idx.min(sorted.len() - 1)).copied()
}

struct RoundMetrics {
    rewards: Vec<f64>,
    error_rates: Vec<f64>,
    latencies: Vec<f64>,
}

pub struct ShadowEvaluator {
    pipeline: Arc<dyn GoldenPipeline>,
    applier: DryRunApplier,
    golden_dir: PathBuf,
    max_items: usize,
    baseline_samples: usize,
    timeout_secs: u64,
}

impl ShadowEvaluator {
    pub fn new(
        pipeline: Arc<dyn GoldenPipeline>,
        repo_root: impl Into<PathBuf>,
        golden_dir: impl Into<PathBuf>,
        max_items: usize,
        baseline_samples: usize,
        timeout_secs: u64,
    ) -> Self {
        Self {
            pipeline,
            applier: DryRunApplier::new(repo_root, false),
            golden_dir: golden_dir.into(),
            max_items,
            baseline_samples,
            timeout_secs,
        }
    }

    async fn run_round(
        &self,
        items: &[GoldenItem],
        shadow_root: Option<&Path>,
    ) -> RoundMetrics {
        let mut metrics = RoundMetrics {
            rewards: Vec::new(),
            error_rates: Vec::new(),
            latencies: Vec::new(),
        };
        for item in items {
            match self.pipeline.run_item(item, shadow_root).await {
                Ok(run) => {
                    if let Some(reward) = run.reward.filter(|r| r.is_finite()) {
                        metrics.rewards.push(reward);
                    }
                    metrics.error_rates.push(run.error_rate);
                    metrics.latencies.push(run.latency_ms);
                }
                Err(e) => {
                    warn!(item = %item.id, "shadow pipeline item failed: {e}");
                    metrics.error_rates.push(1.0);
                }
            }
        }
        metrics
    }

    async fn evaluate_inner(&self, patch: &MetaPatch) -> ShadowEvalResult {
        let mut result = ShadowEvalResult::new(&patch.id);

        let items = load_golden_items(&self.golden_dir, self.max_items);
        if items.is_empty() {
            result.status = "failed".to_string();
            result.error_message = Some("No Golden Set items available".to_string());
            return result;
        }
        result.tests_run = items.len();
        info!(patch_id = %patch.id, items = items.len(), "shadow evaluation started");

        // Baseline rounds for stability.
        let mut baseline = RoundMetrics {
            rewards: Vec::new(),
            error_rates: Vec::new(),
            latencies: Vec::new(),
        };
        for sample in 0..self.baseline_samples.max(1) {
            debug!(sample = sample + 1, "baseline round");
            let round = self.run_round(&items, None).await;
            baseline.rewards.extend(round.rewards);
            baseline.error_rates.extend(round.error_rates);
            baseline.latencies.extend(round.latencies);
        }
        result.baseline_samples = self.baseline_samples.max(1);
        result.avg_reward_before = mean(&baseline.rewards);
        result.error_rate_before = mean(&baseline.error_rates);
        result.latency_p95_before = latency_p95(&baseline.latencies);

        // Patched round in an isolated worktree.
        let worktree = match self.applier.create_worktree() {
            Ok(w) => w,
            Err(e) => {
                result.status = "failed".to_string();
                result.error_message = Some(format!("worktree creation failed: {e}"));
                return result;
            }
        };
        let mut shadow_patch = patch.clone();
        match self.applier.try_apply_only(&mut shadow_patch, worktree.path()).await {
            Ok(true) => {}
            Ok(false) => {
                result.status = "failed".to_string();
                result.error_message = Some("patch failed to apply in shadow worktree".to_string());
                return result;
            }
            Err(e) => {
                result.status = "failed".to_string();
                result.error_message = Some(format!("shadow apply error: {e}"));
                return result;
            }
        }

        let patched = self.run_round(&items, Some(worktree.path())).await;
        result.avg_reward_after = mean(&patched.rewards);
        result.error_rate_after = mean(&patched.error_rates);
        result.latency_p95_after = latency_p95(&patched.latencies);

        result.reward_delta = match (result.avg_reward_before, result.avg_reward_after) {
            (Some(before), Some(after)) => Some(after - before),
            _ => None,
        };
        result.error_rate_delta = match (result.error_rate_before, result.error_rate_after) {
            (Some(before), Some(after)) => Some(after - before),
            _ => None,
        };
        result.latency_p95_delta = match (result.latency_p95_before, result.latency_p95_after) {
            (Some(before), Some(after)) => Some(after - before),
            _ => None,
        };

        result.status = "completed".to_string();
        info!(
            patch_id = %patch.id,
            reward_delta = ?result.reward_delta,
            "shadow evaluation complete"
        );
        result
    }

    /// Evaluate one patch under the whole-patch time budget.
    pub async fn evaluate(&self, patch: &MetaPatch) -> ShadowEvalResult {
        let start = Instant::now();
        let budget = Duration::from_secs(self.timeout_secs);
        let mut result = match tokio::time::timeout(budget, self.evaluate_inner(patch)).await {
            Ok(result) => result,
            Err(_) => {
                let mut timed_out = ShadowEvalResult::new(&patch.id);
                timed_out.status = "timeout".to_string();
                timed_out.error_message = Some(format!(
                    "shadow evaluation timed out after {}s",
                    self.timeout_secs
                ));
                timed_out
            }
        };
        result.execution_time_ms = start.elapsed().as_millis() as u64;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakePipeline {
        baseline_reward: f64,
        patched_reward: f64,
        patched_calls: AtomicUsize,
        delay_ms: u64,
    }

    #[async_trait]
    impl GoldenPipeline for FakePipeline {
        async fn run_item(
            &self,
            _item: &GoldenItem,
            shadow_root: Option<&Path>,
        ) -> Result<GoldenRunMetrics> {
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            let reward = if shadow_root.is_some() {
                self.patched_calls.fetch_add(1, Ordering::SeqCst);
                self.patched_reward
            } else {
                self.baseline_reward
            };
            Ok(GoldenRunMetrics {
                reward: Some(reward),
                cost_penalty: 0.1,
                error_rate: 0.0,
                latency_ms: 50.0,
            })
        }
    }

    fn seed_repo_with_golden(n_items: usize) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/config.rs"), "line one\nline two\n").unwrap();
        let golden = dir.path().join("storage/golden");
        std::fs::create_dir_all(&golden).unwrap();
        for i in 0..n_items {
            let item = serde_json::json!({
                "id": format!("g{i}"),
                "task_class": "code",
                "task": "write a function",
                "seed": 42,
            });
            std::fs::write(golden.join(format!("g{i}.json")), item.to_string()).unwrap();
        }
        dir
    }

    fn patch() -> MetaPatch {
        let diff = "--- a/src/config.rs\n+++ b/src/config.rs\n@@ -1,2 +1,3 @@\n line one\n+inserted\n line two\n";
        MetaPatch::create("bandit", "test", "insert", diff, 1)
    }

    fn evaluator(repo: &tempfile::TempDir, pipeline: Arc<dyn GoldenPipeline>) -> ShadowEvaluator {
        ShadowEvaluator::new(
            pipeline,
            repo.path(),
            repo.path().join("storage/golden"),
            5,
            1,
            30,
        )
    }

    #[tokio::test]
    async fn computes_before_after_deltas() {
        let repo = seed_repo_with_golden(3);
        let pipeline = Arc::new(FakePipeline {
            baseline_reward: 0.5,
            patched_reward: 0.7,
            patched_calls: AtomicUsize::new(0),
            delay_ms: 0,
        });
        let result = evaluator(&repo, pipeline.clone()).evaluate(&patch()).await;

        assert_eq!(result.status, "completed");
        assert_eq!(result.tests_run, 3);
        assert!((result.reward_delta.unwrap() - 0.2).abs() < 1e-9);
        assert_eq!(result.error_rate_delta, Some(0.0));
        // Each golden item ran exactly once against the patched tree.
        assert_eq!(pipeline.patched_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn empty_golden_set_fails_cleanly() {
        let repo = seed_repo_with_golden(0);
        let pipeline = Arc::new(FakePipeline {
            baseline_reward: 0.5,
            patched_reward: 0.5,
            patched_calls: AtomicUsize::new(0),
            delay_ms: 0,
        });
        let result = evaluator(&repo, pipeline).evaluate(&patch()).await;
        assert_eq!(result.status, "failed");
        assert_eq!(
            result.error_message.as_deref(),
            Some("No Golden Set items available")
        );
    }

    #[tokio::test]
    async fn unappliable_patch_fails_shadow() {
        let repo = seed_repo_with_golden(2);
        let pipeline = Arc::new(FakePipeline {
            baseline_reward: 0.5,
            patched_reward: 0.5,
            patched_calls: AtomicUsize::new(0),
            delay_ms: 0,
        });
        let diff = "--- a/src/config.rs\n+++ b/src/config.rs\n@@ -1,2 +1,3 @@\n no such line\n+x\n other line\n";
        let bad = MetaPatch::create("bandit", "test", "bad", diff, 1);
        let result = evaluator(&repo, pipeline).evaluate(&bad).await;
        assert_eq!(result.status, "failed");
        assert!(result.error_message.unwrap().contains("failed to apply"));
    }

    #[tokio::test]
    async fn exceeding_budget_times_out() {
        let repo = seed_repo_with_golden(3);
        let pipeline = Arc::new(FakePipeline {
            baseline_reward: 0.5,
            patched_reward: 0.5,
            patched_calls: AtomicUsize::new(0),
            delay_ms: 400,
        });
        let evaluator = ShadowEvaluator::new(
            pipeline,
            repo.path(),
            repo.path().join("storage/golden"),
            5,
            1,
            1,
        );
        let result = evaluator.evaluate(&patch()).await;
        assert_eq!(result.status, "timeout");
    }

    #[test]
    fn p95_is_max_for_small_samples() {
        let small: Vec<f64> = (1..=5).map(|i| i as f64).collect();
        assert_eq!(latency_p95(&small), Some(5.0));
        let large: Vec<f64> = (1..=100).map(|i| i as f64).collect();
        assert_eq!(latency_p95(&large), Some(95.0));
        assert_eq!(latency_p95(&[]), None);
    }
}
