//! Self-modification cycle
//!
//! Drives one full outer-loop pass: propose patches, dry-run each in an
//! isolated worktree, shadow-evaluate the survivors against the Golden Set,
//! filter through guards, rank, and act on the winner: start a canary,
//! commit, or stop at reporting.

use std::sync::Arc;

use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::applier::DryRunApplier;
use super::canary::CanaryManager;
use super::commit::{CommitManager, CommitOutcome};
use super::proposer::Proposer;
use super::resources::ResourceMonitor;
use super::selector::{rank_and_pick, SelectionResult};
use super::shadow::{ShadowEvalResult, ShadowEvaluator};
use super::types::{ApplyResult, MetaPatch, ProposalResponse};
use crate::config::SmeConfig;

/// What to do with a selected winner.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleMode {
    /// Stop after selection; nothing touches live traffic or the repo.
    Evaluate,
    /// Route a live traffic share through the winner.
    Canary { traffic_share: f64 },
    /// Commit the winner to the repository.
    Commit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleAction {
    None,
    CanaryStarted { patch_id: String },
    Committed { patch_id: String, commit_sha: Option<String> },
    Rejected { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleReport {
    pub proposals: ProposalResponse,
    pub dry_run_results: Vec<ApplyResult>,
    pub shadow_results: Vec<ShadowEvalResult>,
    pub selection: Option<SelectionResult>,
    pub action: CycleAction,
    pub commit: Option<CommitOutcome>,
}

pub struct SelfModEngine {
    proposer: Proposer,
    applier: DryRunApplier,
    shadow: ShadowEvaluator,
    canary: Arc<CanaryManager>,
    commit: CommitManager,
    resources: Arc<ResourceMonitor>,
    config: SmeConfig,
}

impl SelfModEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        proposer: Proposer,
        applier: DryRunApplier,
        shadow: ShadowEvaluator,
        canary: Arc<CanaryManager>,
        commit: CommitManager,
        resources: Arc<ResourceMonitor>,
        config: SmeConfig,
    ) -> Self {
        Self {
            proposer,
            applier,
            shadow,
            canary,
            commit,
            resources,
            config,
        }
    }

    pub fn canary_manager(&self) -> &Arc<CanaryManager> {
        &self.canary
    }

    /// One outer-loop pass. Admission is refused when the host is under
    /// resource pressure.
    pub async fn run_cycle(
        &self,
        n_proposals: usize,
        mode: CycleMode,
        rng: &mut StdRng,
    ) -> CycleReport {
        let mut report = CycleReport {
            proposals: ProposalResponse::default(),
            dry_run_results: Vec::new(),
            shadow_results: Vec::new(),
            selection: None,
            action: CycleAction::None,
            commit: None,
        };

        let (admitted, violations, _) = self.resources.check();
        if !admitted {
            let reasons: Vec<String> = violations.into_iter().map(|v| v.reason).collect();
            report.action = CycleAction::Rejected {
                reason: format!("resource guards: {}", reasons.join("; ")),
            };
            return report;
        }

        // Propose
        report.proposals = self.proposer.generate(n_proposals, rng).await;
        if report.proposals.patches.is_empty() {
            report.action = CycleAction::Rejected {
                reason: "no valid proposals".to_string(),
            };
            return report;
        }

        // Dry-run each candidate; only fully validated patches move on.
        let mut validated: Vec<MetaPatch> = Vec::new();
        for patch in &mut report.proposals.patches {
            match self.applier.try_patch(patch, true).await {
                Ok(result) => {
                    if result.success {
                        validated.push(patch.clone());
                    }
                    report.dry_run_results.push(result);
                }
                Err(e) => warn!(patch_id = %patch.id, "dry-run errored: {e}"),
            }
        }
        if validated.is_empty() {
            report.action = CycleAction::Rejected {
                reason: "no patch survived dry-run".to_string(),
            };
            return report;
        }

        // Shadow-evaluate survivors sequentially.
        for patch in &validated {
            report.shadow_results.push(self.shadow.evaluate(patch).await);
        }

        // Guard-filter and rank.
        let require_positive = !matches!(mode, CycleMode::Evaluate);
        let selection = rank_and_pick(
            report.shadow_results.clone(),
            &self.config.fail_guards,
            require_positive,
        );
        let winner_id = selection
            .winner
            .as_ref()
            .map(|w| w.shadow_result.patch_id.clone());
        report.selection = Some(selection);

        let Some(winner_id) = winner_id else {
            report.action = CycleAction::Rejected {
                reason: "no safe candidate after guards".to_string(),
            };
            return report;
        };
        let Some(winner_patch) = validated.iter().find(|p| p.id == winner_id) else {
            report.action = CycleAction::Rejected {
                reason: "winner not among validated patches".to_string(),
            };
            return report;
        };
        let winner_shadow = report
            .shadow_results
            .iter()
            .find(|s| s.patch_id == winner_id)
            .cloned();

        match mode {
            CycleMode::Evaluate => {
                info!(patch_id = %winner_id, "cycle finished in evaluate mode");
            }
            CycleMode::Canary { traffic_share } => {
                self.canary.start_canary(
                    &winner_id,
                    traffic_share,
                    self.config.canary_runs as u64,
                );
                report.action = CycleAction::CanaryStarted {
                    patch_id: winner_id,
                };
            }
            CycleMode::Commit => {
                let outcome = self
                    .commit
                    .commit_patch(winner_patch, winner_shadow.as_ref())
                    .await;
                report.action = CycleAction::Committed {
                    patch_id: winner_id,
                    commit_sha: outcome.commit_sha.clone(),
                };
                report.commit = Some(outcome);
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GuardThresholds;
    use crate::engine::EngineError;
    use crate::judge::{JudgeBackend, JudgeRotation};
    use crate::sme::golden::GoldenItem;
    use crate::sme::shadow::{GoldenPipeline, GoldenRunMetrics};
    use crate::sme::storage::PatchStorage;
    use async_trait::async_trait;
    use rand::SeedableRng;
    use std::path::Path;

    struct OneShotBackend {
        payload: String,
    }

    #[async_trait]
    impl JudgeBackend for OneShotBackend {
        async fn complete(
            &self,
            _system: &str,
            _user: &str,
            _model: &str,
        ) -> Result<String, EngineError> {
            Ok(self.payload.clone())
        }
    }

    struct ImprovingPipeline;

    #[async_trait]
    impl GoldenPipeline for ImprovingPipeline {
        async fn run_item(
            &self,
            _item: &GoldenItem,
            shadow_root: Option<&Path>,
        ) -> anyhow::Result<GoldenRunMetrics> {
            Ok(GoldenRunMetrics {
                reward: Some(if shadow_root.is_some() { 0.8 } else { 0.6 }),
                cost_penalty: 0.05,
                error_rate: 0.0,
                latency_ms: 10.0,
            })
        }
    }

    fn seed_repo(root: &Path) {
        std::fs::create_dir_all(root.join("src/meta")).unwrap();
        std::fs::write(root.join("src/meta/bandit.rs"), "line one\nline two\nline three\n")
            .unwrap();
        let golden = root.join("storage/golden");
        std::fs::create_dir_all(&golden).unwrap();
        std::fs::write(
            golden.join("g0.json"),
            serde_json::json!({"id": "g0", "task_class": "code", "task": "t"}).to_string(),
        )
        .unwrap();
    }

    fn engine_for(root: &Path) -> SelfModEngine {
        let config = SmeConfig {
            fail_guards: GuardThresholds::default(),
            ..SmeConfig::from_env()
        };
        let payload = serde_json::json!({
            "area": "bandit",
            "rationale": "tiny tweak",
            "diff": "--- a/src/meta/bandit.rs\n+++ b/src/meta/bandit.rs\n@@ -1,3 +1,4 @@\n line one\n+inserted\n line two\n line three\n"
        })
        .to_string();

        let proposer = Proposer::new(
            Some(Arc::new(OneShotBackend { payload })),
            Arc::new(JudgeRotation::new()),
            config.allowed_areas.clone(),
            config.max_loc_delta,
            root.to_path_buf(),
        );
        let applier = DryRunApplier::new(root, false).with_commands(
            vec!["true".to_string()],
            vec!["true".to_string()],
            vec!["true".to_string()],
        );
        let shadow = ShadowEvaluator::new(
            Arc::new(ImprovingPipeline),
            root,
            root.join("storage/golden"),
            5,
            1,
            60,
        );
        let canary = Arc::new(CanaryManager::new(config.fail_guards.clone()));
        let storage_dir = root.join("patch_artifacts");
        let commit = CommitManager::new(
            root,
            false,
            false,
            PatchStorage::new(storage_dir).unwrap(),
        );
        SelfModEngine::new(
            proposer,
            applier,
            shadow,
            canary,
            commit,
            Arc::new(ResourceMonitor::new(100.0, 0, false)),
            config,
        )
    }

    #[tokio::test]
    async fn full_cycle_selects_and_starts_canary() {
        let dir = tempfile::tempdir().unwrap();
        seed_repo(dir.path());
        let engine = engine_for(dir.path());
        let mut rng = StdRng::seed_from_u64(21);

        let report = engine
            .run_cycle(1, CycleMode::Canary { traffic_share: 1.0 }, &mut rng)
            .await;

        assert_eq!(report.proposals.patches.len(), 1);
        assert_eq!(report.dry_run_results.len(), 1);
        assert!(report.dry_run_results[0].success);
        assert_eq!(report.shadow_results.len(), 1);
        assert!((report.shadow_results[0].reward_delta.unwrap() - 0.2).abs() < 1e-9);

        let CycleAction::CanaryStarted { patch_id } = &report.action else {
            panic!("expected canary, got {:?}", report.action);
        };
        let canary = engine.canary_manager().get(patch_id).unwrap();
        assert_eq!(canary.traffic_share, 1.0);
    }

    #[tokio::test]
    async fn evaluate_mode_stops_before_action() {
        let dir = tempfile::tempdir().unwrap();
        seed_repo(dir.path());
        let engine = engine_for(dir.path());
        let mut rng = StdRng::seed_from_u64(22);

        let report = engine.run_cycle(1, CycleMode::Evaluate, &mut rng).await;
        assert!(matches!(report.action, CycleAction::None));
        assert!(report.selection.unwrap().winner.is_some());
        assert!(engine.canary_manager().active().is_none());
    }

    #[tokio::test]
    async fn commit_mode_fails_closed_when_commits_disabled() {
        let dir = tempfile::tempdir().unwrap();
        seed_repo(dir.path());
        let engine = engine_for(dir.path());
        let mut rng = StdRng::seed_from_u64(23);

        let report = engine.run_cycle(1, CycleMode::Commit, &mut rng).await;
        let commit = report.commit.expect("commit attempted");
        assert_eq!(commit.status, "failed");
        assert!(commit.error.unwrap().contains("disabled"));
    }
}
