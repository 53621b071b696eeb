//! Post-run improvement worker
//!
//! A single in-process worker drains a FIFO queue of self-improvement jobs.
//! Each job runs the diverse Golden subset before and after a small critic
//! adjustment to the reward tuning multipliers, and keeps the change only
//! when the acceptance gates pass. Admission is gated by an idempotency set
//! on the source run id, a rolling-hour rate limit, and the resource
//! monitor; each job runs under a hard timeout.

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use super::golden::{select_golden_subset, GoldenItem};
use super::resources::ResourceMonitor;
use super::shadow::GoldenPipeline;
use crate::config::CodeLoopConfig;
use crate::meta::rewards::Tuning;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SubsetKpis {
    pub avg_reward: f64,
    pub avg_cost: f64,
    pub pass_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImprovementReport {
    pub loop_id: String,
    pub source_run_id: Option<i64>,
    pub mode: String,
    pub before: SubsetKpis,
    pub after: SubsetKpis,
    pub delta_total_reward: f64,
    pub tuning_before: Tuning,
    pub tuning_after: Tuning,
    pub applied: bool,
    pub accepted: bool,
    pub reject_reasons: Vec<String>,
}

struct Job {
    source_run_id: i64,
    mode: String,
}

#[derive(Default)]
struct WorkerState {
    queue: VecDeque<Job>,
    processed: HashSet<i64>,
    run_starts: VecDeque<Instant>,
    running: bool,
}

pub struct ImprovementWorker {
    pipeline: Arc<dyn GoldenPipeline>,
    resources: Arc<ResourceMonitor>,
    config: CodeLoopConfig,
    golden_dir: PathBuf,
    tuning_path: PathBuf,
    runs_dir: PathBuf,
    state: Mutex<WorkerState>,
}

impl ImprovementWorker {
    pub fn new(
        pipeline: Arc<dyn GoldenPipeline>,
        resources: Arc<ResourceMonitor>,
        config: CodeLoopConfig,
        golden_dir: PathBuf,
        tuning_path: PathBuf,
        runs_dir: PathBuf,
    ) -> Self {
        Self {
            pipeline,
            resources,
            config,
            golden_dir,
            tuning_path,
            runs_dir,
            state: Mutex::new(WorkerState::default()),
        }
    }

    fn within_rate_limit(state: &mut WorkerState, max_per_hour: usize) -> bool {
        // checked_sub: the monotonic clock may not reach back a full hour
        // early in process (or host) life.
        if let Some(cutoff) = Instant::now().checked_sub(Duration::from_secs(3600)) {
            while state
                .run_starts
                .front()
                .map(|t| *t < cutoff)
                .unwrap_or(false)
            {
                state.run_starts.pop_front();
            }
        }
        state.run_starts.len() < max_per_hour
    }

    /// Admit a job unless it was already processed, the rolling-hour budget
    /// is spent, or the host is under pressure. Starts the drain task when
    /// idle. Returns whether the job was enqueued.
    pub fn maybe_enqueue(self: &Arc<Self>, source_run_id: i64, mode: Option<String>) -> bool {
        let (admitted, start_worker) = {
            let mut state = match self.state.lock() {
                Ok(s) => s,
                Err(poisoned) => poisoned.into_inner(),
            };
            if state.processed.contains(&source_run_id) {
                return false;
            }
            if !Self::within_rate_limit(&mut state, self.config.max_per_hour) {
                info!(source_run_id, "improvement job rejected by rate limit");
                return false;
            }
            let (resources_ok, _, _) = self.resources.check();
            if !resources_ok {
                info!(source_run_id, "improvement job rejected by resource guards");
                return false;
            }

            state.queue.push_back(Job {
                source_run_id,
                mode: mode.unwrap_or_else(|| self.config.mode.clone()),
            });
            state.processed.insert(source_run_id);
            let start = !state.running;
            state.running = true;
            (true, start)
        };

        if start_worker {
            let worker = Arc::clone(self);
            tokio::spawn(async move {
                worker.drain().await;
            });
        }
        admitted
    }

    async fn drain(self: Arc<Self>) {
        loop {
            let job = {
                let mut state = match self.state.lock() {
                    Ok(s) => s,
                    Err(poisoned) => poisoned.into_inner(),
                };
                match state.queue.pop_front() {
                    Some(job) => job,
                    None => {
                        state.running = false;
                        return;
                    }
                }
            };

            let timeout = Duration::from_secs(self.config.timeout_seconds);
            let result = tokio::time::timeout(
                timeout,
                self.run_improvement(Some(job.source_run_id), &job.mode),
            )
            .await;
            if result.is_err() {
                warn!(
                    source_run_id = job.source_run_id,
                    "improvement job timed out"
                );
            }

            let mut state = match self.state.lock() {
                Ok(s) => s,
                Err(poisoned) => poisoned.into_inner(),
            };
            state.run_starts.push_back(Instant::now());
        }
    }

    async fn run_subset(&self, subset: &[GoldenItem]) -> SubsetKpis {
        let mut rewards = Vec::new();
        let mut costs = Vec::new();
        let mut passes = 0usize;
        let mut total = 0usize;

        for item in subset {
            match self.pipeline.run_item(item, None).await {
                Ok(metrics) => {
                    let reward = metrics.reward.unwrap_or(0.0);
                    rewards.push(reward);
                    costs.push(metrics.cost_penalty);
                    total += 1;
                    if reward >= self.config.golden_pass_rate_target {
                        passes += 1;
                    }
                }
                Err(e) => warn!(item = %item.id, "subset item failed: {e}"),
            }
        }

        SubsetKpis {
            avg_reward: if rewards.is_empty() {
                0.0
            } else {
                rewards.iter().sum::<f64>() / rewards.len() as f64
            },
            avg_cost: if costs.is_empty() {
                0.0
            } else {
                costs.iter().sum::<f64>() / costs.len() as f64
            },
            pass_rate: if total == 0 {
                0.0
            } else {
                passes as f64 / total as f64
            },
        }
    }

    fn load_tuning(&self) -> Tuning {
        std::fs::read_to_string(&self.tuning_path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    fn write_tuning(&self, tuning: &Tuning) -> std::io::Result<()> {
        if let Some(parent) = self.tuning_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(
            &self.tuning_path,
            serde_json::to_string_pretty(tuning).unwrap_or_else(|_| "{}".to_string()),
        )
    }

    /// One improvement cycle: measure, nudge one multiplier, re-measure,
    /// keep or revert.
    pub async fn run_improvement(
        &self,
        source_run_id: Option<i64>,
        mode: &str,
    ) -> ImprovementReport {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let loop_id = format!(
            "{ts}-{}",
            source_run_id.map(|id| id.to_string()).unwrap_or_else(|| "manual".to_string())
        );

        let tuning_before = self.load_tuning();
        let subset = select_golden_subset(&self.golden_dir);
        let before = self.run_subset(&subset).await;

        // Critic: weak rewards get more process weight, otherwise shave the
        // cost multiplier.
        let mut tuning_after = tuning_before;
        if before.avg_reward < 0.35 {
            tuning_after.process_multiplier = (tuning_after.process_multiplier + 0.05).min(1.5);
        } else {
            tuning_after.cost_multiplier = (tuning_after.cost_multiplier - 0.05).max(0.5);
        }

        let live = mode == "live";
        let mut applied = false;
        if live {
            match self.write_tuning(&tuning_after) {
                Ok(()) => applied = true,
                Err(e) => warn!("tuning write failed: {e}"),
            }
        }

        let after = self.run_subset(&subset).await;
        let delta = after.avg_reward - before.avg_reward;

        let cost_ratio_ok = if before.avg_cost > 0.0 {
            after.avg_cost <= self.config.cost_ratio_max * before.avg_cost
        } else {
            true
        };
        let pass_rate_ok = after.pass_rate >= self.config.golden_pass_rate_target;
        let delta_ok = delta >= self.config.delta_reward_min;
        let accepted = delta_ok && cost_ratio_ok && pass_rate_ok;

        let mut reject_reasons = Vec::new();
        if !delta_ok {
            reject_reasons.push("delta_too_small".to_string());
        }
        if !cost_ratio_ok {
            reject_reasons.push("cost_too_high".to_string());
        }
        if !pass_rate_ok {
            reject_reasons.push("pass_rate_low".to_string());
        }

        if applied && !accepted {
            if let Err(e) = self.write_tuning(&tuning_before) {
                warn!("tuning revert failed: {e}");
            }
        }

        let report = ImprovementReport {
            loop_id: loop_id.clone(),
            source_run_id,
            mode: mode.to_string(),
            before,
            after,
            delta_total_reward: delta,
            tuning_before,
            tuning_after,
            applied,
            accepted,
            reject_reasons,
        };

        // Persist the loop artifact alongside run artifacts.
        let artifact_dir = self.runs_dir.join(ts.to_string());
        if std::fs::create_dir_all(&artifact_dir).is_ok() {
            let payload = json!({
                "loop": report,
                "thresholds": {
                    "delta_reward_min": self.config.delta_reward_min,
                    "cost_ratio_max": self.config.cost_ratio_max,
                    "golden_pass_rate_target": self.config.golden_pass_rate_target,
                },
                "subset_size": subset.len(),
            });
            let _ = std::fs::write(
                artifact_dir.join("code_loop.json"),
                serde_json::to_string_pretty(&payload).unwrap_or_default(),
            );
        }

        info!(
            loop_id = %loop_id,
            accepted = report.accepted,
            delta = report.delta_total_reward,
            "improvement cycle finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sme::shadow::GoldenRunMetrics;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Rewards improve once the tuning file carries a lowered cost
    /// multiplier, approximating a critic change that helps.
    struct TuningAwarePipeline {
        tuning_path: PathBuf,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl GoldenPipeline for TuningAwarePipeline {
        async fn run_item(
            &self,
            _item: &GoldenItem,
            _shadow_root: Option<&Path>,
        ) -> anyhow::Result<GoldenRunMetrics> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let tuning: Tuning = std::fs::read_to_string(&self.tuning_path)
                .ok()
                .and_then(|raw| serde_json::from_str(&raw).ok())
                .unwrap_or_default();
            let improved = tuning.cost_multiplier < 1.0;
            Ok(GoldenRunMetrics {
                reward: Some(if improved { 0.95 } else { 0.5 }),
                cost_penalty: if improved { 0.05 } else { 0.1 },
                error_rate: 0.0,
                latency_ms: 20.0,
            })
        }
    }

    fn seed_golden(dir: &Path, n: usize) {
        std::fs::create_dir_all(dir).unwrap();
        for i in 0..n {
            let item = json!({
                "id": format!("g{i}"),
                "task_class": "code",
                "task": "do the thing",
                "task_type": format!("type{}", i % 3),
            });
            std::fs::write(dir.join(format!("g{i}.json")), item.to_string()).unwrap();
        }
    }

    fn worker(root: &Path, mode: &str, max_per_hour: usize) -> Arc<ImprovementWorker> {
        let golden = root.join("golden");
        seed_golden(&golden, 6);
        let tuning = root.join("tuning.json");
        let pipeline = Arc::new(TuningAwarePipeline {
            tuning_path: tuning.clone(),
            calls: AtomicUsize::new(0),
        });
        let config = CodeLoopConfig {
            mode: mode.to_string(),
            timeout_seconds: 30,
            max_per_hour,
            delta_reward_min: 0.05,
            cost_ratio_max: 0.9,
            golden_pass_rate_target: 0.8,
        };
        Arc::new(ImprovementWorker::new(
            pipeline,
            Arc::new(ResourceMonitor::new(100.0, 0, false)),
            config,
            golden,
            tuning,
            root.join("runs"),
        ))
    }

    #[tokio::test]
    async fn accepted_improvement_keeps_tuning_change() {
        let dir = tempfile::tempdir().unwrap();
        let w = worker(dir.path(), "live", 3);
        let report = w.run_improvement(Some(1), "live").await;

        // Baseline 0.5 → critic lowers cost multiplier → rewards jump.
        assert!(report.accepted, "reasons: {:?}", report.reject_reasons);
        assert!(report.applied);
        let tuning: Tuning =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("tuning.json")).unwrap())
                .unwrap();
        assert!(tuning.cost_multiplier < 1.0);
    }

    #[tokio::test]
    async fn dry_run_never_writes_tuning() {
        let dir = tempfile::tempdir().unwrap();
        let w = worker(dir.path(), "dry_run", 3);
        let report = w.run_improvement(Some(1), "dry_run").await;
        assert!(!report.applied);
        assert!(!dir.path().join("tuning.json").exists());
    }

    #[tokio::test]
    async fn improvement_writes_loop_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let w = worker(dir.path(), "live", 3);
        w.run_improvement(Some(7), "live").await;
        let runs: Vec<_> = std::fs::read_dir(dir.path().join("runs"))
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(runs.len(), 1);
        assert!(runs[0].path().join("code_loop.json").exists());
    }

    #[tokio::test]
    async fn idempotency_set_rejects_duplicate_run_ids() {
        let dir = tempfile::tempdir().unwrap();
        let w = worker(dir.path(), "dry_run", 10);
        assert!(w.maybe_enqueue(42, None));
        assert!(!w.maybe_enqueue(42, None));
        // Let the spawned drain task finish.
        tokio::time::sleep(Duration::from_millis(300)).await;
    }

    #[tokio::test]
    async fn rate_limit_caps_enqueues_per_hour() {
        let dir = tempfile::tempdir().unwrap();
        let w = worker(dir.path(), "dry_run", 1);
        assert!(w.maybe_enqueue(1, None));
        // Wait for the first job to complete and record its start.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!w.maybe_enqueue(2, None));
    }
}
