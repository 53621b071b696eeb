//! Judge panel
//!
//! Outcome scoring: two independent AI judges drawn by inverse-frequency
//! rotation, a third tie-breaker when they disagree by ≥0.3, and a 0.9/0.1
//! blend with semantic similarity. Every failure mode is recorded in the
//! returned metadata; when the AI path is out entirely, the semantic score
//! stands alone.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;
use rand::distributions::WeightedIndex;
use rand::prelude::Distribution;
use rand::rngs::StdRng;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::embed::{cosine_similarity, EmbeddingProvider};
use crate::engine::remote::{ChatTurn, RemoteEngine};
use crate::engine::EngineError;

pub const DISAGREEMENT_THRESHOLD: f64 = 0.3;
pub const SEMANTIC_WEIGHT: f64 = 0.1;
pub const AI_WEIGHT: f64 = 0.9;
const OUTPUT_EMBED_CHARS: usize = 1500;

/// Fixed judge pool rotated by inverse frequency.
pub const JUDGE_MODELS: &[&str] = &[
    "llama-3.3-70b-versatile",
    "openai/gpt-oss-120b",
    "openai/gpt-oss-20b",
    "llama-3.1-8b-instant",
    "groq/compound",
    "groq/compound-mini",
    "meta-llama/llama-4-maverick-17b-128e-instruct",
    "meta-llama/llama-4-scout-17b-16e-instruct",
    "qwen/qwen3-32b",
    "moonshotai/kimi-k2-instruct",
];

const QUALITY_JUDGE_SYSTEM: &str = "You are an expert evaluator. Rate the quality of an AI response for the given task.\n\n\
Consider:\n\
- Accuracy and correctness\n\
- Completeness and thoroughness\n\
- Clarity and coherence\n\
- Relevance to the task\n\
- Practical usefulness\n\n\
Return ONLY a JSON object with:\n\
{\n  \"score\": <float 0.0-1.0>,\n  \"reasoning\": \"<brief explanation>\",\n  \"strengths\": [\"<strength1>\", \"<strength2>\"],\n  \"weaknesses\": [\"<weakness1>\", \"<weakness2>\"]\n}";

const TIE_BREAKER_SYSTEM: &str = "You are an expert evaluator resolving a disagreement between two other judges.\n\n\
Two AI evaluators have scored the same response but gave significantly different scores. Your job is to:\n\
1. Review the original task and response\n\
2. Consider both previous evaluations\n\
3. Make a final, definitive judgment\n\n\
Be decisive and explain why you agree more with one judge or why you chose a middle ground.\n\n\
Return ONLY a JSON object with:\n\
{\n  \"score\": <float 0.0-1.0>,\n  \"reasoning\": \"<explanation of your decision>\",\n  \"agrees_with\": \"<judge1|judge2|neither>\",\n  \"final_verdict\": \"<brief summary>\"\n}";

const PAIRWISE_JUDGE_SYSTEM: &str = "You are a strict evaluator. Compare two candidate answers for the given task and criteria.\n\
Return ONLY JSON with fields:\n{\"winner\":\"A|B|tie\", \"rationale\":\"brief reason\"}";

/// The chat surface judges run against. The remote engine implements it in
/// production; tests script it.
#[async_trait]
pub trait JudgeBackend: Send + Sync {
    async fn complete(
        &self,
        system: &str,
        user: &str,
        model_id: &str,
    ) -> Result<String, EngineError>;
}

#[async_trait]
impl JudgeBackend for RemoteEngine {
    async fn complete(
        &self,
        system: &str,
        user: &str,
        model_id: &str,
    ) -> Result<String, EngineError> {
        let messages = vec![ChatTurn::system(system), ChatTurn::user(user)];
        self.chat_complete(&messages, model_id, Some(0.1), Some(1024))
            .await
    }
}

/// Inverse-frequency weighted sampling without replacement over the pool.
pub struct JudgeRotation {
    usage: Mutex<HashMap<String, u64>>,
    pool: Vec<String>,
}

impl Default for JudgeRotation {
    fn default() -> Self {
        Self::new()
    }
}

impl JudgeRotation {
    pub fn new() -> Self {
        Self {
            usage: Mutex::new(HashMap::new()),
            pool: JUDGE_MODELS.iter().map(|m| m.to_string()).collect(),
        }
    }

    pub fn with_pool(pool: Vec<String>) -> Self {
        Self {
            usage: Mutex::new(HashMap::new()),
            pool,
        }
    }

    /// Draw up to `n` distinct models; weight = 1 / (1 + usage_count).
    pub fn select(&self, n: usize, rng: &mut StdRng) -> Vec<String> {
        let mut usage = match self.usage.lock() {
            Ok(u) => u,
            Err(_) => return Vec::new(),
        };
        let mut available = self.pool.clone();
        let mut selected = Vec::new();

        for _ in 0..n.min(self.pool.len()) {
            if available.is_empty() {
                break;
            }
            let weights: Vec<f64> = available
                .iter()
                .map(|m| 1.0 / (1.0 + *usage.get(m).unwrap_or(&0) as f64))
                .collect();
            let Ok(dist) = WeightedIndex::new(&weights) else {
                break;
            };
            let idx = dist.sample(rng);
            let model = available.remove(idx);
            *usage.entry(model.clone()).or_insert(0) += 1;
            selected.push(model);
        }
        selected
    }

    pub fn usage_count(&self, model: &str) -> u64 {
        self.usage
            .lock()
            .map(|u| *u.get(model).unwrap_or(&0))
            .unwrap_or(0)
    }
}

/// Outcome of a panel evaluation.
#[derive(Debug, Clone)]
pub struct JudgeOutcome {
    pub score: f64,
    pub metadata: Value,
    pub evaluation_overhead_ms: f64,
}

/// Pairwise verdict for judge mode.
#[derive(Debug, Clone, PartialEq)]
pub struct PairVerdict {
    pub winner: String,
    pub rationale: String,
}

pub struct QualityJudge {
    backend: Option<Arc<dyn JudgeBackend>>,
    embedder: Arc<dyn EmbeddingProvider>,
    rotation: JudgeRotation,
}

impl QualityJudge {
    pub fn new(
        backend: Option<Arc<dyn JudgeBackend>>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self {
            backend,
            embedder,
            rotation: JudgeRotation::new(),
        }
    }

    pub fn with_rotation(mut self, rotation: JudgeRotation) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn rotation(&self) -> &JudgeRotation {
        &self.rotation
    }

    pub fn ai_available(&self) -> bool {
        self.backend.is_some()
    }

    /// Semantic similarity: task↔output plus mean assertion coverage.
    pub fn semantic_score(&self, task: &str, assertions: &[String], output: &str) -> f64 {
        let task_vec = self.embedder.embed(task);
        let truncated: String = output.chars().take(OUTPUT_EMBED_CHARS).collect();
        let out_vec = self.embedder.embed(&truncated);
        let mut score = 0.5 * cosine_similarity(&task_vec, &out_vec) as f64;

        if !assertions.is_empty() {
            let coverage: f64 = assertions
                .iter()
                .map(|a| cosine_similarity(&out_vec, &self.embedder.embed(a)) as f64)
                .sum::<f64>()
                / assertions.len() as f64;
            score += 0.5 * coverage;
        }
        score
    }

    fn quality_prompt(task: &str, assertions: &[String], output: &str) -> String {
        let mut prompt = format!("Task: {task}\n\n");
        if !assertions.is_empty() {
            let bullets: Vec<String> = assertions.iter().map(|a| format!("• {a}")).collect();
            prompt.push_str(&format!("Requirements:\n{}\n\n", bullets.join("\n")));
        }
        prompt.push_str(&format!(
            "AI Response to Evaluate:\n{output}\n\nPlease evaluate this response's quality."
        ));
        prompt
    }

    fn tie_breaker_prompt(
        task: &str,
        assertions: &[String],
        output: &str,
        judge1: &Value,
        judge2: &Value,
    ) -> String {
        let mut prompt = format!("Original Task: {task}\n\n");
        if !assertions.is_empty() {
            let bullets: Vec<String> = assertions.iter().map(|a| format!("• {a}")).collect();
            prompt.push_str(&format!("Requirements:\n{}\n\n", bullets.join("\n")));
        }
        prompt.push_str(&format!(
            "AI Response Being Evaluated:\n{output}\n\n\
             JUDGE 1 ({}) - Score: {}\nReasoning: {}\n\n\
             JUDGE 2 ({}) - Score: {}\nReasoning: {}\n\n\
             The judges disagree significantly. Please make the final decision.",
            judge1["model"].as_str().unwrap_or("unknown"),
            judge1["score"],
            judge1["reasoning"].as_str().unwrap_or("N/A"),
            judge2["model"].as_str().unwrap_or("unknown"),
            judge2["score"],
            judge2["reasoning"].as_str().unwrap_or("N/A"),
        ));
        prompt
    }

    fn parse_score_reply(reply: &str) -> Option<Value> {
        let trimmed = reply.trim();
        if !trimmed.starts_with('{') {
            return None;
        }
        serde_json::from_str::<Value>(trimmed).ok()
    }

    /// Two-judge panel with tie-breaker. Returns the panel score, metadata
    /// (all failure modes explicit), and evaluation overhead.
    async fn panel_score(
        &self,
        task: &str,
        assertions: &[String],
        output: &str,
        rng: &mut StdRng,
    ) -> JudgeOutcome {
        let Some(backend) = &self.backend else {
            return JudgeOutcome {
                score: 0.0,
                metadata: json!({ "error": "ai_judges_unavailable" }),
                evaluation_overhead_ms: 0.0,
            };
        };

        let initial_judges = self.rotation.select(2, rng);
        let mut judge_results: Vec<Value> = Vec::new();
        let mut successful: Vec<f64> = Vec::new();
        let mut overhead_ms = 0.0;
        let user_prompt = Self::quality_prompt(task, assertions, output);

        for model in &initial_judges {
            let role = format!("judge_{}", judge_results.len() + 1);
            let start = Instant::now();
            match backend.complete(QUALITY_JUDGE_SYSTEM, &user_prompt, model).await {
                Ok(reply) => {
                    let elapsed = start.elapsed().as_millis() as f64;
                    overhead_ms += elapsed;
                    match Self::parse_score_reply(&reply) {
                        Some(data) => {
                            let score = data["score"].as_f64().unwrap_or(0.0).clamp(0.0, 1.0);
                            judge_results.push(json!({
                                "model": model,
                                "score": score,
                                "reasoning": data["reasoning"],
                                "strengths": data["strengths"],
                                "weaknesses": data["weaknesses"],
                                "duration_ms": elapsed,
                                "role": role,
                            }));
                            successful.push(score);
                        }
                        None => {
                            judge_results.push(json!({
                                "model": model,
                                "error": "invalid_json",
                                "raw_response": reply,
                                "duration_ms": elapsed,
                                "role": role,
                            }));
                        }
                    }
                }
                Err(e) => {
                    overhead_ms += start.elapsed().as_millis() as f64;
                    warn!(model = %model, "judge call failed: {e}");
                    judge_results.push(json!({
                        "model": model,
                        "error": e.to_string(),
                        "role": role,
                    }));
                }
            }
        }

        let score_difference = if successful.len() == 2 {
            Some((successful[0] - successful[1]).abs())
        } else {
            None
        };
        let need_tie_breaker = score_difference
            .map(|d| d >= DISAGREEMENT_THRESHOLD)
            .unwrap_or(false);

        let mut tie_breaker_result: Option<Value> = None;
        let mut final_score = if successful.is_empty() {
            0.0
        } else {
            successful.iter().sum::<f64>() / successful.len() as f64
        };

        if need_tie_breaker {
            let tie_breaker_model = self
                .rotation
                .select(1, rng)
                .into_iter()
                .next()
                .unwrap_or_else(|| "unknown".to_string());
            let parsed: Vec<&Value> = judge_results
                .iter()
                .filter(|r| r["score"].is_f64() || r["score"].is_number())
                .collect();
            if parsed.len() == 2 {
                let tb_prompt =
                    Self::tie_breaker_prompt(task, assertions, output, parsed[0], parsed[1]);
                let start = Instant::now();
                match backend
                    .complete(TIE_BREAKER_SYSTEM, &tb_prompt, &tie_breaker_model)
                    .await
                {
                    Ok(reply) => {
                        let elapsed = start.elapsed().as_millis() as f64;
                        overhead_ms += elapsed;
                        match Self::parse_score_reply(&reply) {
                            Some(data) => {
                                let tb_score =
                                    data["score"].as_f64().unwrap_or(0.0).clamp(0.0, 1.0);
                                final_score = tb_score;
                                tie_breaker_result = Some(json!({
                                    "model": tie_breaker_model,
                                    "score": tb_score,
                                    "reasoning": data["reasoning"],
                                    "agrees_with": data["agrees_with"],
                                    "final_verdict": data["final_verdict"],
                                    "duration_ms": elapsed,
                                    "role": "tie_breaker",
                                }));
                            }
                            None => {
                                tie_breaker_result = Some(json!({
                                    "model": tie_breaker_model,
                                    "error": "invalid_json",
                                    "raw_response": reply,
                                    "role": "tie_breaker",
                                }));
                            }
                        }
                    }
                    Err(e) => {
                        overhead_ms += start.elapsed().as_millis() as f64;
                        tie_breaker_result = Some(json!({
                            "model": tie_breaker_model,
                            "error": e.to_string(),
                            "role": "tie_breaker",
                        }));
                    }
                }
            }
        }

        let mut metadata = json!({
            "method": "two_judge_plus_tiebreaker",
            "disagreement_threshold": DISAGREEMENT_THRESHOLD,
            "needed_tie_breaker": need_tie_breaker,
            "successful_initial_judges": successful.len(),
            "score_difference": score_difference,
            "final_score": final_score,
            "initial_scores": successful,
            "judge_results": judge_results,
        });
        if let Some(tbr) = tie_breaker_result {
            metadata["tie_breaker_result"] = tbr;
        }
        if successful.is_empty() {
            metadata["error"] = json!("no_successful_evaluations");
        }

        JudgeOutcome {
            score: final_score,
            metadata,
            evaluation_overhead_ms: overhead_ms,
        }
    }

    /// Full hybrid evaluation: semantic + panel blend with fallback.
    pub async fn evaluate(
        &self,
        task: &str,
        assertions: &[String],
        output: &str,
        rng: &mut StdRng,
    ) -> JudgeOutcome {
        let semantic = self.semantic_score(task, assertions, output);
        let panel = self.panel_score(task, assertions, output, rng).await;

        let ai_failed = panel.metadata.get("error").is_some();
        let (final_score, method) = if ai_failed {
            (semantic, "semantic_fallback")
        } else {
            (
                SEMANTIC_WEIGHT * semantic + AI_WEIGHT * panel.score,
                "hybrid_two_judge",
            )
        };
        debug!(method, final_score, "outcome evaluated");

        JudgeOutcome {
            score: final_score,
            metadata: json!({
                "method": method,
                "semantic_score": semantic,
                "semantic_weight": SEMANTIC_WEIGHT,
                "ai_score": panel.score,
                "ai_weight": AI_WEIGHT,
                "panel_metadata": panel.metadata,
                "final_score": final_score,
                "evaluation_overhead_ms": panel.evaluation_overhead_ms,
            }),
            evaluation_overhead_ms: panel.evaluation_overhead_ms,
        }
    }

    /// Pairwise A/B verdict; semantic comparison when the panel is out.
    pub async fn judge_pair(
        &self,
        task: &str,
        assertions: &[String],
        out_a: &str,
        out_b: &str,
        rng: &mut StdRng,
    ) -> PairVerdict {
        if let Some(backend) = &self.backend {
            if let Some(model) = self.rotation.select(1, rng).into_iter().next() {
                let criteria: Vec<String> = assertions.iter().map(|a| format!("- {a}")).collect();
                let criteria_block = if criteria.is_empty() {
                    "No explicit criteria; judge closeness to task intent.".to_string()
                } else {
                    criteria.join("\n")
                };
                let user = format!(
                    "Task:\n{task}\n\nCriteria:\n{criteria_block}\n\nCandidate A:\n{out_a}\n\nCandidate B:\n{out_b}\n\nReturn JSON only."
                );
                if let Ok(reply) = backend.complete(PAIRWISE_JUDGE_SYSTEM, &user, &model).await {
                    let trimmed = reply.trim();
                    let start = trimmed.find('{');
                    let end = trimmed.rfind('}');
                    if let (Some(s), Some(e)) = (start, end) {
                        if let Ok(data) = serde_json::from_str::<Value>(&trimmed[s..=e]) {
                            let winner = match data["winner"]
                                .as_str()
                                .unwrap_or("tie")
                                .to_lowercase()
                                .chars()
                                .next()
                            {
                                Some('a') => "A",
                                Some('b') => "B",
                                _ => "tie",
                            };
                            return PairVerdict {
                                winner: winner.to_string(),
                                rationale: data["rationale"].as_str().unwrap_or("").to_string(),
                            };
                        }
                    }
                }
            }
        }

        // Semantic fallback
        let sa = self.semantic_score(task, assertions, out_a);
        let sb = self.semantic_score(task, assertions, out_b);
        if (sa - sb).abs() < 1e-6 {
            PairVerdict {
                winner: "tie".to_string(),
                rationale: "semantic scores equal".to_string(),
            }
        } else {
            PairVerdict {
                winner: if sa > sb { "A" } else { "B" }.to_string(),
                rationale: format!("semantic {sa:.3} vs {sb:.3}"),
            }
        }
    }
}
