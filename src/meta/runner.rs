//! Evolution runner
//!
//! One run = n iterations of: select operator, build plan, gather contexts,
//! generate locally, score through the judge panel and reward pipeline,
//! persist, publish, update bandit state. After the loop: promotion policy,
//! safety probes, artifacts, episodic-memory feedback, and the optional
//! pairwise judge pass.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use super::bandit::{Bandit, EpsilonGreedy, StatsMap, Ucb};
use super::event_log;
use super::operators::{self, ContextBundle, Recipe};
use super::probes::{promotion_gate, write_eval_artifact, PromotionGate};
use super::rewards::{default_baseline, ExecutionContext, RewardBreakdown, RewardModel};
use super::store::{MetaStore, NewVariant, StoredRecipe};
use crate::config::{groups_for_operator, BanditStrategy, Config};
use crate::embed::{estimate_tokens, EmbeddingProvider};
use crate::engine::{EngineGateway, EngineKind, GenOptions};
use crate::judge::QualityJudge;
use crate::memory::{build_memory_primer, Experience, MemoryStore};
use crate::realtime::{JudgeInfo, JudgeScore, RealtimeHub, RewardBreakdownEvent, RunEvent};
use crate::tools::{stitch_context, Retriever, WebProvider};

const PROMOTION_DELTA_MIN: f64 = 0.05;
const AUTO_APPROVE_DELTA: f64 = 0.15;
const PROMOTION_COST_RATIO: f64 = 0.9;
const BASELINE_COST_PENALTY: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JudgeMode {
    #[serde(rename = "off")]
    Off,
    #[serde(rename = "pairwise_groq")]
    PairwiseRemote,
}

/// Per-run knobs; defaults come from configuration.
#[derive(Debug, Clone)]
pub struct RunFlags {
    pub n: u32,
    pub memory_k: usize,
    pub rag_k: usize,
    pub web_k: usize,
    pub operators: Option<Vec<String>>,
    pub eps: f64,
    pub bandit_algorithm: BanditStrategy,
    pub framework_mask: Option<Vec<String>>,
    pub test_cmd: Option<String>,
    pub test_weight: f64,
    pub judge_mode: JudgeMode,
    pub seed: Option<u64>,
    pub session_id: Option<i64>,
    pub publish_events: bool,
    pub allow_memory_writes: bool,
    pub ucb_c: f64,
    pub warm_start_min_pulls: u32,
    pub stratified_explore: bool,
    /// Override the live tuning file; shadow runs point this at the patched
    /// worktree so file-driven behavior changes take effect there.
    pub tuning_path: Option<PathBuf>,
}

impl RunFlags {
    pub fn from_config(config: &Config) -> Self {
        Self {
            n: config.evo.n,
            memory_k: config.evo.memory_k,
            rag_k: config.evo.rag_k,
            web_k: config.evo.web_k,
            operators: None,
            eps: config.evo.eps,
            bandit_algorithm: config.evo.strategy,
            framework_mask: None,
            test_cmd: None,
            test_weight: 0.0,
            judge_mode: JudgeMode::Off,
            seed: None,
            session_id: None,
            publish_events: true,
            allow_memory_writes: true,
            ucb_c: config.evo.ucb_c,
            warm_start_min_pulls: config.evo.warm_start_min_pulls,
            stratified_explore: config.evo.stratified_explore,
            tuning_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionOutcome {
    pub eligible: bool,
    pub reasons: Vec<String>,
    pub recipe_id: Option<i64>,
    pub approved: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: i64,
    pub task_class: String,
    pub task: String,
    pub assertions: Vec<String>,
    pub best_score: Option<f64>,
    pub best_total_reward: Option<f64>,
    pub best_variant_id: Option<i64>,
    pub best_recipe: Option<Recipe>,
    pub best_output: Option<String>,
    pub best_reward_breakdown: Option<Value>,
    pub operator_sequence: Vec<String>,
    pub operator_stats: StatsMap,
    pub baseline: f64,
    pub improvement: f64,
    pub total_reward_improvement: f64,
    pub steps_to_best: u32,
    pub promotion: PromotionOutcome,
    pub judge: Option<Value>,
    pub eval: Option<PromotionGate>,
    pub artifacts_dir: PathBuf,
    pub timestamp: u64,
}

struct BestVariant {
    variant_id: i64,
    score: f64,
    total_reward: f64,
    step_index: u32,
    recipe: Recipe,
    prompt: String,
    system: String,
    output: String,
    breakdown: RewardBreakdown,
}

/// Long-lived service owning the engine gateway, stores, judge, context
/// sources and realtime hub. All mutable state lives here rather than in
/// globals so instances stay independent and testable.
pub struct EvolutionService {
    config: Config,
    gateway: Arc<EngineGateway>,
    judge: Arc<QualityJudge>,
    embedder: Arc<dyn EmbeddingProvider>,
    meta_store: MetaStore,
    memory_store: Option<MemoryStore>,
    retriever: Arc<dyn Retriever>,
    web: Arc<dyn WebProvider>,
    realtime: Arc<RealtimeHub>,
    reward_model: RewardModel,
}

impl EvolutionService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        gateway: Arc<EngineGateway>,
        judge: Arc<QualityJudge>,
        embedder: Arc<dyn EmbeddingProvider>,
        meta_store: MetaStore,
        memory_store: Option<MemoryStore>,
        retriever: Arc<dyn Retriever>,
        web: Arc<dyn WebProvider>,
        realtime: Arc<RealtimeHub>,
    ) -> Self {
        let reward_model = RewardModel::new(
            config.layout.tuning_file(),
            config.layout.artifacts_dir.clone(),
        );
        Self {
            config,
            gateway,
            judge,
            embedder,
            meta_store,
            memory_store,
            retriever,
            web,
            realtime,
            reward_model,
        }
    }

    pub fn realtime(&self) -> &Arc<RealtimeHub> {
        &self.realtime
    }

    pub fn meta_store(&self) -> &MetaStore {
        &self.meta_store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn build_bandit(&self, flags: &RunFlags) -> Box<dyn Bandit> {
        match flags.bandit_algorithm {
            BanditStrategy::Ucb => Box::new(Ucb::new(
                flags.ucb_c,
                flags.warm_start_min_pulls as u64,
                flags.stratified_explore,
            )),
            BanditStrategy::EpsilonGreedy => Box::new(EpsilonGreedy::new(flags.eps)),
        }
    }

    fn masked_operators(&self, flags: &RunFlags) -> Vec<String> {
        let base = flags
            .operators
            .clone()
            .unwrap_or_else(crate::config::default_operators);
        match &flags.framework_mask {
            Some(mask) => {
                let filtered: Vec<String> = base
                    .iter()
                    .filter(|op| groups_for_operator(op).iter().any(|g| mask.contains(g)))
                    .cloned()
                    .collect();
                if filtered.is_empty() {
                    base
                } else {
                    filtered
                }
            }
            None => base,
        }
    }

    fn stored_to_recipe(stored: &StoredRecipe) -> Recipe {
        Recipe {
            engine: EngineKind::Ollama,
            system: stored.system.clone(),
            nudge: stored.nudge.clone(),
            params: stored.params.clone(),
            ..Default::default()
        }
    }

    async fn approved_base_recipe(&self, task_class: &str) -> (Option<Recipe>, f64) {
        match self.meta_store.top_recipes(task_class, 5).await {
            Ok(recipes) => {
                let baseline = recipes.first().map(|r| r.avg_score).unwrap_or(0.0);
                let base = recipes
                    .iter()
                    .find(|r| r.approved)
                    .map(Self::stored_to_recipe);
                (base, baseline)
            }
            Err(e) => {
                warn!("recipe lookup failed: {e}");
                (None, 0.0)
            }
        }
    }

    async fn gather_memory_primer(
        &self,
        run_id: i64,
        task_class: &str,
        task: &str,
        flags: &RunFlags,
    ) -> (String, usize, usize) {
        let Some(store) = &self.memory_store else {
            return (String::new(), 0, 0);
        };
        if !self.config.flags.memory || flags.memory_k == 0 {
            return (String::new(), 0, 0);
        }

        let query_embedding = self.embedder.embed(task);
        let experiences = store
            .search(
                &query_embedding,
                task_class,
                flags.memory_k,
                self.config.memory.reward_floor,
            )
            .await;
        let hits = experiences.len();
        let (primer, tokens) = if experiences.is_empty() {
            (String::new(), 0)
        } else {
            build_memory_primer(&experiences, self.config.memory.primer_tokens_max)
        };

        if flags.publish_events {
            self.realtime.publish(
                run_id,
                RunEvent::MemoryUpdate {
                    run_id,
                    hits,
                    primer_tokens: tokens,
                    store_size: store.count().await,
                },
            );
        }
        (primer, tokens, hits)
    }

    async fn gather_contexts(
        &self,
        plan: &Recipe,
        task_class: &str,
        task: &str,
        memory_primer: &str,
        flags: &RunFlags,
    ) -> ContextBundle {
        let mut bundle = ContextBundle {
            task: task.to_string(),
            ..Default::default()
        };

        if self.config.memory.injection_mode == "system_prepend" {
            bundle.memory_primer = memory_primer.to_string();
        }

        if plan.use_rag {
            match self.retriever.query(task, flags.rag_k).await {
                Ok(hits) => {
                    let snippets: Vec<String> = hits
                        .iter()
                        .map(|h| h.chunk.chars().take(200).collect())
                        .collect();
                    bundle.rag_context = stitch_context(&snippets, &[], &[]);
                }
                Err(e) => warn!("rag retrieval failed: {e}"),
            }
        }

        if plan.use_memory {
            if let Some(store) = &self.memory_store {
                let embedding = self.embedder.embed(task);
                let experiences = store
                    .search(&embedding, task_class, flags.memory_k.max(1), 0.0)
                    .await;
                let snippets: Vec<String> = experiences
                    .iter()
                    .map(|e| e.output_text.chars().take(200).collect())
                    .collect();
                bundle.memory_context = stitch_context(&[], &snippets, &[]);
            }
        }

        if plan.use_web {
            match self.web.search(task, flags.web_k).await {
                Ok(hits) => {
                    let snippets: Vec<String> = hits
                        .iter()
                        .map(|h| {
                            let snippet: String = h.snippet.chars().take(100).collect();
                            format!("{}: {snippet}", h.title)
                        })
                        .collect();
                    bundle.web_context = stitch_context(&[], &[], &snippets);
                }
                Err(e) => warn!("web search failed: {e}"),
            }
        }

        bundle
    }

    fn judge_info_from_metadata(metadata: &Value, fallback_score: f64) -> JudgeInfo {
        let panel = &metadata["panel_metadata"];
        let judges = panel["judge_results"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|j| {
                j["score"].as_f64().map(|score| JudgeScore {
                    model: j["model"].as_str().unwrap_or("unknown").to_string(),
                    score,
                })
            })
            .collect();
        JudgeInfo {
            judges,
            tie_breaker_used: panel["needed_tie_breaker"].as_bool().unwrap_or(false),
            final_score: panel["final_score"].as_f64().unwrap_or(fallback_score),
        }
    }

    /// Spawn a run as a detached worker task. Multiple runs may proceed
    /// concurrently; operator stats serialize through the store.
    pub fn run_detached(
        self: &Arc<Self>,
        task_class: String,
        task: String,
        assertions: Vec<String>,
        flags: RunFlags,
    ) -> tokio::task::JoinHandle<Result<RunResult>> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            service
                .run(&task_class, &task, &assertions, flags)
                .await
        })
    }

    /// Run the full evolution cycle. Per-iteration failures are recovered;
    /// the run record is always finalized.
    pub async fn run(
        &self,
        task_class: &str,
        task: &str,
        assertions: &[String],
        flags: RunFlags,
    ) -> Result<RunResult> {
        let operators = self.masked_operators(&flags);
        anyhow::ensure!(!operators.is_empty(), "no operators available");

        let shadow_reward_model;
        let reward_model: &RewardModel = match &flags.tuning_path {
            Some(path) => {
                shadow_reward_model = RewardModel::new(
                    path.clone(),
                    self.config.layout.artifacts_dir.clone(),
                );
                &shadow_reward_model
            }
            None => &self.reward_model,
        };

        let mut rng = match flags.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut bandit = self.build_bandit(&flags);
        let mut operator_stats = self.meta_store.list_operator_stats().await?;

        let (base_recipe, baseline) = self.approved_base_recipe(task_class).await;

        let run_config = json!({
            "n": flags.n,
            "memory_k": flags.memory_k,
            "rag_k": flags.rag_k,
            "operators": operators,
            "eps": flags.eps,
            "bandit_algorithm": format!("{:?}", flags.bandit_algorithm),
            "framework_mask": flags.framework_mask,
            "test_weight": flags.test_weight,
            "judge_mode": format!("{:?}", flags.judge_mode),
        });
        let run_id = self
            .meta_store
            .save_run_start(task_class, task, assertions, run_config.clone())
            .await?;
        event_log::log_run_start(
            &self.config.layout.logs_dir,
            run_id,
            task_class,
            task,
            &run_config,
        );

        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let artifacts_dir = self.config.layout.runs_dir.join(timestamp.to_string());
        std::fs::create_dir_all(&artifacts_dir)
            .with_context(|| format!("cannot create {}", artifacts_dir.display()))?;

        info!(run_id, task_class, n = flags.n, "evolution run started");

        let task_baseline = default_baseline(task);
        let (memory_primer, primer_tokens, memory_hits) = self
            .gather_memory_primer(run_id, task_class, task, &flags)
            .await;

        let mut best: Option<BestVariant> = None;
        let mut operator_sequence: Vec<String> = Vec::new();

        for i in 0..flags.n {
            let selected_op = bandit.select(&operators, &operator_stats, &mut rng);
            let groups = groups_for_operator(&selected_op);

            let mut plan = operators::build_plan(&selected_op, base_recipe.as_ref(), &mut rng);
            // Expanded voices override the plain library when enabled.
            if self.config.flags.systems_v2 && selected_op == "change_system" {
                if let Some(voice) = operators::weighted_system_for_task(task_class, &mut rng) {
                    plan.system = voice;
                }
            }
            // Generation is local no matter what the recipe says.
            plan.engine = EngineKind::Ollama;

            let bundle = self
                .gather_contexts(&plan, task_class, task, &memory_primer, &flags)
                .await;
            let execution = operators::apply(&plan, &bundle);

            let gen_start = Instant::now();
            let generation = self
                .gateway
                .call(
                    EngineKind::Ollama,
                    &execution.prompt,
                    Some(&execution.system),
                    &execution.options,
                )
                .await;
            let generation_time_ms = gen_start.elapsed().as_millis() as u64;

            let (output, model_id) = match generation {
                Ok(result) => result,
                Err(e) => {
                    error!(run_id, iteration = i, "generation failed, skipping: {e}");
                    continue;
                }
            };

            // Outcome via the judge panel, with optional external test blend.
            let judge_outcome = self.judge.evaluate(task, assertions, &output, &mut rng).await;
            let mut outcome = judge_outcome.score;
            let mut outcome_metadata = judge_outcome.metadata.clone();
            if let Some(cmd) = &flags.test_cmd {
                let (blended, test_score, test_error) = reward_model
                    .blend_test_command(outcome, &output, cmd, flags.test_weight)
                    .await;
                outcome = blended;
                outcome_metadata["test_applied"] = json!(test_score.is_some());
                if let Some(score) = test_score {
                    outcome_metadata["test_score"] = json!(score);
                }
                if let Some(err) = test_error {
                    outcome_metadata["test_error"] = json!(err);
                }
            }

            let execution_context = ExecutionContext {
                tool_success_rate: 1.0,
                tool_calls: 0,
                tokens_in: task.split_whitespace().count() as f64 * 1.3,
                tokens_out: output.split_whitespace().count() as f64 * 1.3,
            };
            let process = reward_model.process_reward(&output, &execution_context, &selected_op);
            let cost = reward_model.cost_penalty(
                generation_time_ms as f64,
                &execution_context,
                &task_baseline,
                judge_outcome.evaluation_overhead_ms,
            );
            let breakdown = reward_model.compose(outcome, process, cost, outcome_metadata);

            let semantic_score = breakdown.outcome_metadata["semantic_score"]
                .as_f64()
                .unwrap_or(breakdown.outcome_reward);

            let variant_id = match self
                .meta_store
                .save_variant(NewVariant {
                    run_id,
                    system: execution.system.clone(),
                    nudge: plan.nudge.clone(),
                    params: plan.params.clone(),
                    prompt: execution.prompt.clone(),
                    output: output.clone(),
                    score: semantic_score,
                    operator_name: selected_op.clone(),
                    groups: groups.clone(),
                    execution_time_ms: generation_time_ms,
                    model_id: model_id.clone(),
                    total_reward: breakdown.total_reward,
                    outcome_reward: breakdown.outcome_reward,
                    process_reward: breakdown.process_reward,
                    cost_penalty: breakdown.cost_penalty,
                    reward_metadata: breakdown.outcome_metadata.clone(),
                })
                .await
            {
                Ok(id) => id,
                Err(e) => {
                    error!(run_id, iteration = i, "variant save failed, skipping: {e}");
                    continue;
                }
            };
            operator_sequence.push(selected_op.clone());

            if flags.publish_events {
                self.realtime.publish(
                    run_id,
                    RunEvent::Iter {
                        run_id,
                        i,
                        operator: selected_op.clone(),
                        engine: EngineKind::Ollama.as_str().to_string(),
                        model_id: model_id.clone(),
                        score: semantic_score,
                        total_reward: breakdown.total_reward,
                        reward_breakdown: RewardBreakdownEvent {
                            outcome: breakdown.outcome_reward,
                            process: breakdown.process_reward,
                            cost: breakdown.cost_penalty,
                        },
                        judge_info: Self::judge_info_from_metadata(
                            &breakdown.outcome_metadata,
                            breakdown.outcome_reward,
                        ),
                        duration_ms: generation_time_ms,
                        timestamp: timestamp as f64,
                        variant_id,
                        output: output.clone(),
                    },
                );
            }

            let is_best = best
                .as_ref()
                .map(|b| breakdown.total_reward > b.total_reward)
                .unwrap_or(true);
            if is_best {
                best = Some(BestVariant {
                    variant_id,
                    score: semantic_score,
                    total_reward: breakdown.total_reward,
                    step_index: i,
                    recipe: plan.clone(),
                    prompt: execution.prompt.clone(),
                    system: execution.system.clone(),
                    output: output.clone(),
                    breakdown: breakdown.clone(),
                });
            }

            bandit.update(&selected_op, breakdown.total_reward, &mut operator_stats);
            if let Err(e) = self
                .meta_store
                .upsert_operator_stat(&selected_op, breakdown.total_reward, generation_time_ms)
                .await
            {
                warn!("operator stat upsert failed: {e}");
            }
            if let Err(e) = self
                .meta_store
                .upsert_operator_engine_stat(
                    &selected_op,
                    EngineKind::Ollama.as_str(),
                    breakdown.total_reward,
                    generation_time_ms,
                )
                .await
            {
                warn!("operator engine stat upsert failed: {e}");
            }

            // Iteration artifact with a bandit snapshot for analytics.
            let ucb_scores = bandit.scores(&operators, &operator_stats);
            let bandit_state = json!({
                "chosen_op": {
                    "mean_payoff": operator_stats.get(&selected_op).map(|s| s.mean_payoff),
                    "plays": operator_stats.get(&selected_op).map(|s| s.pulls),
                    "ucb_score": ucb_scores.get(&selected_op).copied().filter(|s| s.is_finite()),
                },
                "snapshot": operators.iter().map(|op| json!({
                    "operator": op,
                    "mean_payoff": operator_stats.get(op).map(|s| s.mean_payoff),
                    "plays": operator_stats.get(op).map(|s| s.pulls),
                    "ucb_score": ucb_scores.get(op).copied().filter(|s| s.is_finite()),
                })).collect::<Vec<_>>(),
            });
            let iteration_data = json!({
                "iteration": i,
                "operator": selected_op,
                "groups": groups,
                "plan": plan,
                "score": semantic_score,
                "reward": breakdown.total_reward,
                "reward_breakdown": {
                    "outcome_reward": breakdown.outcome_reward,
                    "process_reward": breakdown.process_reward,
                    "cost_penalty": breakdown.cost_penalty,
                    "total_reward": breakdown.total_reward,
                },
                "bandit_state": bandit_state,
                "duration_ms": generation_time_ms,
                "output_preview": output,
            });
            let iteration_path = artifacts_dir.join(format!("iteration_{i:02}.json"));
            if let Err(e) = std::fs::write(
                &iteration_path,
                serde_json::to_string_pretty(&iteration_data).unwrap_or_default(),
            ) {
                warn!("iteration artifact write failed: {e}");
            }

            if self.config.flags.trajectory_log {
                self.append_trajectory(&artifacts_dir, run_id, &iteration_data);
            }
        }

        // Finalize the run record no matter how the loop went.
        let best_score = best.as_ref().map(|b| b.score);
        let best_total_reward = best.as_ref().map(|b| b.total_reward);
        let total_reward_improvement = best_total_reward.unwrap_or(0.0);
        self.meta_store
            .save_run_finish(
                run_id,
                best.as_ref().map(|b| b.variant_id),
                best_score,
                &operator_sequence,
                best_total_reward,
                total_reward_improvement,
            )
            .await?;

        // Safety probes over the best output.
        let eval = if self.config.flags.eval_gate {
            best.as_ref().map(|b| {
                let gate = promotion_gate(&b.output);
                if let Err(e) = write_eval_artifact(&artifacts_dir, &gate) {
                    warn!("eval artifact write failed: {e}");
                }
                gate
            })
        } else {
            None
        };

        let promotion = self
            .apply_promotion_policy(task_class, best.as_ref(), eval.as_ref())
            .await;

        // Optional pairwise judge pass against a remote challenger.
        let judge_report = match (flags.judge_mode, best.as_ref()) {
            (JudgeMode::PairwiseRemote, Some(b)) if self.gateway.remote_available() => {
                let report = self.pairwise_judge(task, assertions, b, &mut rng).await;
                if flags.publish_events {
                    self.realtime.publish(
                        run_id,
                        RunEvent::Judge {
                            run_id,
                            judge: report.clone(),
                        },
                    );
                }
                Some(report)
            }
            _ => None,
        };

        let steps_to_best = best
            .as_ref()
            .map(|b| b.step_index + 1)
            .unwrap_or(flags.n);
        let eval_metrics = json!({
            "best_total_reward": best_total_reward,
            "best_score": best_score,
            "steps_to_best": steps_to_best,
            "cost_penalty_avg": best.as_ref().map(|b| b.breakdown.cost_penalty),
            "promotion": promotion,
        });
        if let Err(e) = std::fs::write(
            artifacts_dir.join("eval_report.json"),
            serde_json::to_string_pretty(&json!({ "metrics": eval_metrics })).unwrap_or_default(),
        ) {
            warn!("eval report write failed: {e}");
        }

        let result = RunResult {
            run_id,
            task_class: task_class.to_string(),
            task: task.to_string(),
            assertions: assertions.to_vec(),
            best_score,
            best_total_reward,
            best_variant_id: best.as_ref().map(|b| b.variant_id),
            best_recipe: best.as_ref().map(|b| b.recipe.clone()),
            best_output: best.as_ref().map(|b| b.output.clone()),
            best_reward_breakdown: best.as_ref().map(|b| {
                json!({
                    "outcome_reward": b.breakdown.outcome_reward,
                    "process_reward": b.breakdown.process_reward,
                    "cost_penalty": b.breakdown.cost_penalty,
                    "total_reward": b.breakdown.total_reward,
                    "outcome_metadata": b.breakdown.outcome_metadata,
                })
            }),
            operator_sequence: operator_sequence.clone(),
            operator_stats: operator_stats.clone(),
            baseline,
            improvement: best_score.map(|s| s - baseline).unwrap_or(0.0),
            total_reward_improvement,
            steps_to_best,
            promotion,
            judge: judge_report,
            eval,
            artifacts_dir: artifacts_dir.clone(),
            timestamp,
        };

        if let Err(e) = std::fs::write(
            artifacts_dir.join("results.json"),
            serde_json::to_string_pretty(&result).unwrap_or_default(),
        ) {
            warn!("results artifact write failed: {e}");
        }

        if flags.publish_events {
            self.realtime.publish(
                run_id,
                RunEvent::Done {
                    run_id,
                    result: serde_json::to_value(&result).unwrap_or(Value::Null),
                },
            );
        }

        self.store_best_experience(run_id, task_class, task, &result, memory_hits, &flags)
            .await;

        event_log::log_run_finish(
            &self.config.layout.logs_dir,
            run_id,
            best_score,
            operator_sequence.len(),
        );
        info!(
            run_id,
            best_total_reward = ?best_total_reward,
            iterations = operator_sequence.len(),
            primer_tokens,
            "evolution run finished"
        );
        Ok(result)
    }

    fn append_trajectory(&self, artifacts_dir: &std::path::Path, run_id: i64, entry: &Value) {
        let path = artifacts_dir.join("trajectory.json");
        let mut trajectory: Vec<Value> = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
            .and_then(|v| v["trajectory"].as_array().cloned())
            .unwrap_or_default();
        trajectory.push(entry.clone());
        let payload = json!({ "run_id": run_id, "trajectory": trajectory });
        if let Err(e) = std::fs::write(
            &path,
            serde_json::to_string_pretty(&payload).unwrap_or_default(),
        ) {
            warn!("trajectory write failed: {e}");
        }
    }

    /// Promotion: reward must clear the delta floor, cost must undercut the
    /// baseline, and the safety probes must pass. Exceptional deltas are
    /// auto-approved.
    async fn apply_promotion_policy(
        &self,
        task_class: &str,
        best: Option<&BestVariant>,
        eval: Option<&PromotionGate>,
    ) -> PromotionOutcome {
        let mut outcome = PromotionOutcome {
            eligible: false,
            reasons: Vec::new(),
            recipe_id: None,
            approved: false,
        };
        let Some(best) = best else {
            outcome.reasons.push("no completed iterations".to_string());
            return outcome;
        };

        let baseline_total_reward = 0.0;
        let delta = best.total_reward - baseline_total_reward;
        if delta <= PROMOTION_DELTA_MIN {
            outcome.reasons.push(format!(
                "insufficient total_reward improvement: {delta:.3} <= {PROMOTION_DELTA_MIN}"
            ));
            return outcome;
        }

        let cost_after = best.breakdown.cost_penalty;
        let cost_cap = PROMOTION_COST_RATIO * BASELINE_COST_PENALTY;
        if cost_after > cost_cap {
            outcome
                .reasons
                .push(format!("cost too high: {cost_after:.3} > {cost_cap:.3}"));
            return outcome;
        }

        if let Some(gate) = eval {
            if !gate.eligible {
                outcome.reasons.push(format!(
                    "safety probes failed: {}",
                    gate.safety.matches.join(", ")
                ));
                return outcome;
            }
        }

        outcome.eligible = true;
        outcome
            .reasons
            .push(format!("total_reward improvement: {delta:.3}"));
        outcome
            .reasons
            .push(format!("cost efficiency: {cost_after:.3} <= {cost_cap:.3}"));

        let engine_confidence = (0.5 + delta * 2.0).min(1.0);
        match self
            .meta_store
            .save_recipe(
                task_class,
                &best.recipe.system,
                &best.recipe.nudge,
                &best.recipe.params,
                best.score,
                EngineKind::Ollama.as_str(),
                engine_confidence,
            )
            .await
        {
            Ok(recipe_id) => {
                outcome.recipe_id = Some(recipe_id);
                if delta > AUTO_APPROVE_DELTA {
                    if let Err(e) = self.meta_store.approve_recipe(recipe_id, true).await {
                        warn!("recipe approval failed: {e}");
                    } else {
                        outcome.approved = true;
                        outcome
                            .reasons
                            .push("auto-approved for exceptional performance".to_string());
                    }
                }
            }
            Err(e) => {
                outcome.eligible = false;
                outcome.reasons.push(format!("recipe save failed: {e}"));
            }
        }
        outcome
    }

    async fn pairwise_judge(
        &self,
        task: &str,
        assertions: &[String],
        best: &BestVariant,
        rng: &mut StdRng,
    ) -> Value {
        let options = GenOptions {
            temperature: Some(best.recipe.params.temperature),
            top_k: Some(best.recipe.params.top_k),
            ..Default::default()
        };
        match self
            .gateway
            .call(EngineKind::Groq, &best.prompt, Some(&best.system), &options)
            .await
        {
            Ok((challenger_output, challenger_model)) => {
                let verdict = self
                    .judge
                    .judge_pair(task, assertions, &best.output, &challenger_output, rng)
                    .await;
                json!({
                    "mode": "pairwise_remote",
                    "verdict": { "winner": verdict.winner, "rationale": verdict.rationale },
                    "challenger_model": challenger_model,
                })
            }
            Err(e) => json!({ "mode": "pairwise_remote", "error": e.to_string() }),
        }
    }

    /// Offer the best output to episodic memory when it clears the floors.
    async fn store_best_experience(
        &self,
        run_id: i64,
        task_class: &str,
        task: &str,
        result: &RunResult,
        memory_hits: usize,
        flags: &RunFlags,
    ) {
        let Some(store) = &self.memory_store else {
            return;
        };
        if !self.config.flags.memory || !flags.allow_memory_writes {
            return;
        }
        let (Some(best_output), Some(best_total_reward), Some(recipe)) = (
            result.best_output.as_ref(),
            result.best_total_reward,
            result.best_recipe.as_ref(),
        ) else {
            return;
        };

        let confidence = result
            .best_reward_breakdown
            .as_ref()
            .and_then(|b| b["outcome_metadata"]["panel_metadata"]["successful_initial_judges"].as_u64())
            .map(|n| if n >= 2 { 0.9 } else { 0.6 })
            .unwrap_or(0.8);
        let judge_ai = result
            .best_reward_breakdown
            .as_ref()
            .and_then(|b| b["outcome_reward"].as_f64())
            .unwrap_or(0.0);
        let judge_semantic = result
            .best_reward_breakdown
            .as_ref()
            .and_then(|b| b["outcome_metadata"]["semantic_score"].as_f64())
            .unwrap_or(0.0);

        let embedding = self.embedder.embed(task);
        let experience = Experience::new(
            task_class,
            task,
            serde_json::to_value(recipe).unwrap_or(Value::Null),
            result
                .operator_sequence
                .last()
                .map(|s| s.as_str())
                .unwrap_or("unknown"),
            best_output,
            best_total_reward,
            confidence,
            judge_ai,
            judge_semantic,
            estimate_tokens(task) as i64,
            estimate_tokens(best_output) as i64,
            0,
            embedding,
            self.config.memory.baseline_reward,
        );

        let accepted = store.add(experience).await;
        let reward_delta = result.total_reward_improvement;
        let lift_source = if memory_hits > 0 && reward_delta > 0.05 {
            "memory"
        } else {
            "none"
        };
        if flags.publish_events {
            self.realtime.publish(
                run_id,
                RunEvent::MemoryResult {
                    run_id,
                    reward: best_total_reward,
                    reward_delta,
                    lift_source: lift_source.to_string(),
                },
            );
        }
        info!(run_id, accepted, lift_source, "post-run experience offered");
    }
}

/// Adapter running Golden items through the service with reduced
/// iterations and no user-visible side effects. When a shadow root is
/// given, file-driven behavior (the live tuning file) is read from the
/// patched worktree; compiled-code changes are validated earlier by the
/// dry-run applier's lint and test stages.
pub struct ServiceGoldenPipeline {
    service: Arc<EvolutionService>,
}

impl ServiceGoldenPipeline {
    pub fn new(service: Arc<EvolutionService>) -> Self {
        Self { service }
    }
}

#[async_trait::async_trait]
impl crate::sme::GoldenPipeline for ServiceGoldenPipeline {
    async fn run_item(
        &self,
        item: &crate::sme::GoldenItem,
        shadow_root: Option<&std::path::Path>,
    ) -> Result<crate::sme::GoldenRunMetrics> {
        let mut flags = RunFlags::from_config(self.service.config());
        flags.n = 2;
        flags.session_id = None;
        flags.publish_events = false;
        flags.allow_memory_writes = false;
        flags.judge_mode = JudgeMode::Off;
        flags.memory_k = item.flags.memory_k.unwrap_or(0);
        flags.rag_k = item.flags.rag_k.unwrap_or(0);
        flags.seed = item.seed;
        let mut mask = vec!["SEAL".to_string(), "SAMPLING".to_string()];
        if item.flags.web.unwrap_or(false) {
            mask.push("WEB".to_string());
        }
        flags.framework_mask = Some(mask);
        flags.tuning_path = shadow_root.map(|root| root.join("storage/tuning.json"));

        let requested = flags.n;
        let start = Instant::now();
        let result = self
            .service
            .run(&item.task_class, &item.task, &item.assertions, flags)
            .await?;
        let completed = result.operator_sequence.len() as f64;
        let error_rate = if requested == 0 {
            0.0
        } else {
            1.0 - completed / requested as f64
        };
        Ok(crate::sme::GoldenRunMetrics {
            reward: result.best_total_reward,
            cost_penalty: result
                .best_reward_breakdown
                .as_ref()
                .and_then(|b| b["cost_penalty"].as_f64())
                .unwrap_or(0.0),
            error_rate,
            latency_ms: start.elapsed().as_millis() as f64,
        })
    }
}
