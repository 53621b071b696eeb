//! Compound reward
//!
//! `total_reward = outcome + process·m_proc − cost·m_cost`. Outcome comes
//! from the judge panel (see `judge`); this module owns the process
//! heuristics, the cost model, the tuning multipliers and the composition.

use std::path::PathBuf;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, warn};

pub const PROCESS_REWARD_CAP: f64 = 0.5;
pub const COST_PENALTY_CAP: f64 = 1.0;
const TEST_CMD_TIMEOUT_SECS: u64 = 30;

/// Per-task-class resource baselines used by the cost penalty.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TaskBaseline {
    pub time_ms: f64,
    pub tokens: f64,
}

/// Baseline selection from task wording: code tasks run long, analysis
/// medium, everything else short.
pub fn default_baseline(task: &str) -> TaskBaseline {
    let task_lower = task.to_lowercase();
    let code_keywords = ["code", "function", "class", "implement", "python", "javascript"];
    let analysis_keywords = ["analyze", "review", "explain", "compare"];

    if code_keywords.iter().any(|k| task_lower.contains(k)) {
        TaskBaseline {
            time_ms: 45_000.0,
            tokens: 3000.0,
        }
    } else if analysis_keywords.iter().any(|k| task_lower.contains(k)) {
        TaskBaseline {
            time_ms: 35_000.0,
            tokens: 2500.0,
        }
    } else {
        TaskBaseline {
            time_ms: 25_000.0,
            tokens: 1500.0,
        }
    }
}

/// Runtime facts about one generation feeding the process/cost terms.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub tool_success_rate: f64,
    pub tool_calls: u32,
    pub tokens_in: f64,
    pub tokens_out: f64,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self {
            tool_success_rate: 1.0,
            tool_calls: 0,
            tokens_in: 0.0,
            tokens_out: 0.0,
        }
    }
}

/// Live tuning multipliers, re-read from disk on every composition so edits
/// take effect without a restart.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Tuning {
    #[serde(default = "one")]
    pub process_multiplier: f64,
    #[serde(default = "one")]
    pub cost_multiplier: f64,
}

fn one() -> f64 {
    1.0
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            process_multiplier: 1.0,
            cost_multiplier: 1.0,
        }
    }
}

/// Reward components for one variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardBreakdown {
    pub outcome_reward: f64,
    pub process_reward: f64,
    pub cost_penalty: f64,
    pub total_reward: f64,
    pub outcome_metadata: Value,
}

/// Replace non-finite intermediates with zero, logging the occurrence.
pub fn finite_or_zero(value: f64, label: &str) -> f64 {
    if value.is_finite() {
        value
    } else {
        warn!(label, "non-finite reward intermediate treated as zero");
        0.0
    }
}

struct ProcessSignals {
    reasoning: Vec<Regex>,
    fn_def_py: Regex,
    fn_def_js: Regex,
}

impl ProcessSignals {
    fn new() -> Self {
        Self {
            reasoning: vec![
                Regex::new(r"(?i)(?:first|second|third|next|then|finally)").unwrap(),
                Regex::new(r"(?i)(?:because|since|therefore|thus|hence)").unwrap(),
                Regex::new(r"(?i)(?:step \d+|phase \d+|\d+\))").unwrap(),
                Regex::new(r"(?i)(?:consider|note that|important)").unwrap(),
            ],
            fn_def_py: Regex::new(r"def\s+\w+\s*\([^)]*\)\s*:").unwrap(),
            fn_def_js: Regex::new(r"function\s+\w+\s*\([^)]*\)\s*\{").unwrap(),
        }
    }
}

pub struct RewardModel {
    tuning_path: PathBuf,
    artifacts_dir: PathBuf,
    signals: ProcessSignals,
}

impl RewardModel {
    pub fn new(tuning_path: PathBuf, artifacts_dir: PathBuf) -> Self {
        Self {
            tuning_path,
            artifacts_dir,
            signals: ProcessSignals::new(),
        }
    }

    pub fn load_tuning(&self) -> Tuning {
        match std::fs::read_to_string(&self.tuning_path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(_) => Tuning::default(),
        }
    }

    /// Process reward: structure, code-quality and operator-specific
    /// bonuses, capped at 0.5 so outcome stays dominant.
    pub fn process_reward(&self, output: &str, ctx: &ExecutionContext, operator: &str) -> f64 {
        let mut reward = 0.0;

        if self.has_structured_reasoning(output) {
            reward += 0.1;
        }

        if is_code_related(output) {
            if self.has_proper_functions(output) {
                reward += 0.1;
            }
            if has_error_handling(output) {
                reward += 0.05;
            }
            if has_documentation(output) {
                reward += 0.05;
            }
        }

        reward += ctx.tool_success_rate.clamp(0.0, 1.0) * 0.1;

        match operator {
            "add_fewshot" if has_examples(output) => reward += 0.05,
            "inject_rag" if has_references(output) => reward += 0.05,
            "toggle_web" if has_web_context(output) => reward += 0.05,
            "raise_temp" | "lower_temp" if has_creativity_balance(output) => reward += 0.03,
            _ => {}
        }

        reward.min(PROCESS_REWARD_CAP)
    }

    /// Cost penalty against the task baseline, including evaluation
    /// overhead, capped at 1.0.
    pub fn cost_penalty(
        &self,
        execution_time_ms: f64,
        ctx: &ExecutionContext,
        baseline: &TaskBaseline,
        evaluation_overhead_ms: f64,
    ) -> f64 {
        let mut penalty = 0.0;

        if execution_time_ms > baseline.time_ms && baseline.time_ms > 0.0 {
            let time_ratio = execution_time_ms / baseline.time_ms;
            penalty += (time_ratio - 1.0).min(2.0) * 0.1;
        }

        let total_tokens = ctx.tokens_in + ctx.tokens_out;
        if total_tokens > baseline.tokens && baseline.tokens > 0.0 {
            let token_ratio = total_tokens / baseline.tokens;
            penalty += (token_ratio - 1.0).min(3.0) * 0.05;
        }

        penalty += ctx.tool_calls as f64 * 0.01;

        if evaluation_overhead_ms > 0.0 {
            penalty += (evaluation_overhead_ms / baseline.time_ms.max(1.0)).min(1.0) * 0.1;
        }

        finite_or_zero(penalty, "cost_penalty").min(COST_PENALTY_CAP)
    }

    /// External test-command blend: write the output to the artifact path,
    /// run the command with a hard timeout, fold exit status into outcome.
    /// Returns (blended outcome, test score, error text).
    pub async fn blend_test_command(
        &self,
        outcome: f64,
        output: &str,
        test_cmd: &str,
        test_weight: f64,
    ) -> (f64, Option<f64>, Option<String>) {
        if test_weight <= 0.0 {
            return (outcome, None, None);
        }

        let out_path = self.artifacts_dir.join("out.txt");
        if let Err(e) = std::fs::create_dir_all(&self.artifacts_dir)
            .and_then(|_| std::fs::write(&out_path, output))
        {
            return (outcome, None, Some(format!("artifact write failed: {e}")));
        }

        let run = Command::new("sh").arg("-c").arg(test_cmd).output();
        let result = tokio::time::timeout(
            std::time::Duration::from_secs(TEST_CMD_TIMEOUT_SECS),
            run,
        )
        .await;

        match result {
            Ok(Ok(status)) => {
                let test_score = if status.status.success() { 1.0 } else { 0.0 };
                let blended = (1.0 - test_weight) * outcome + test_weight * test_score;
                debug!(test_score, "test command applied");
                (blended, Some(test_score), None)
            }
            Ok(Err(e)) => (outcome, None, Some(format!("test command failed: {e}"))),
            Err(_) => (
                outcome,
                None,
                Some(format!("test command timed out after {TEST_CMD_TIMEOUT_SECS}s")),
            ),
        }
    }

    /// Human-rating modifier: 1..4 maps linearly to 0.2..0.8, 5 is neutral,
    /// 6..10 maps linearly to 1.2..2.0. Result clamps to [0, 1].
    pub fn apply_human_rating(outcome: f64, human_score: f64) -> (f64, f64) {
        let modifier = if human_score < 5.0 {
            0.2 + (human_score - 1.0) * 0.2
        } else if human_score == 5.0 {
            1.0
        } else {
            1.0 + (human_score - 5.0) * 0.2
        };
        ((outcome * modifier).clamp(0.0, 1.0), modifier)
    }

    /// Fold components into the total reward under the live multipliers.
    pub fn compose(
        &self,
        outcome_reward: f64,
        process_reward: f64,
        cost_penalty: f64,
        outcome_metadata: Value,
    ) -> RewardBreakdown {
        let tuning = self.load_tuning();
        let outcome = finite_or_zero(outcome_reward, "outcome_reward");
        let process = finite_or_zero(process_reward, "process_reward") * tuning.process_multiplier;
        let cost = finite_or_zero(cost_penalty, "cost_penalty") * tuning.cost_multiplier;
        RewardBreakdown {
            outcome_reward: outcome,
            process_reward: process,
            cost_penalty: cost,
            total_reward: outcome + process - cost,
            outcome_metadata,
        }
    }

    fn has_structured_reasoning(&self, output: &str) -> bool {
        self.signals
            .reasoning
            .iter()
            .filter(|p| p.is_match(output))
            .count()
            >= 2
    }

    fn has_proper_functions(&self, output: &str) -> bool {
        self.signals.fn_def_py.is_match(output) || self.signals.fn_def_js.is_match(output)
    }
}

fn is_code_related(output: &str) -> bool {
    const INDICATORS: &[&str] = &[
        "def ", "function", "class ", "import ", "from ", "{", "}", "()", "[]",
    ];
    INDICATORS.iter().filter(|i| output.contains(*i)).count() >= 2
}

fn has_error_handling(output: &str) -> bool {
    const PATTERNS: &[&str] = &["try:", "except", "catch", "throw", "raise", "error handling"];
    let lower = output.to_lowercase();
    PATTERNS.iter().any(|p| lower.contains(p))
}

fn has_documentation(output: &str) -> bool {
    const PATTERNS: &[&str] = &["\"\"\"", "'''", "//", "#", "/**", "*/", "Args:", "Returns:"];
    PATTERNS.iter().filter(|p| output.contains(*p)).count() >= 2
}

fn has_examples(output: &str) -> bool {
    const PATTERNS: &[&str] = &["example", "for instance", "e.g.", "such as", "like this"];
    let lower = output.to_lowercase();
    PATTERNS.iter().any(|p| lower.contains(p))
}

fn has_references(output: &str) -> bool {
    const PATTERNS: &[&str] = &["according to", "based on", "reference", "source", "documented"];
    let lower = output.to_lowercase();
    PATTERNS.iter().any(|p| lower.contains(p))
}

fn has_creativity_balance(output: &str) -> bool {
    const CREATIVE: &[&str] = &["innovative", "creative", "unique", "novel", "original"];
    const STRUCTURED: &[&str] = &["systematic", "structured", "organized", "methodical"];
    let lower = output.to_lowercase();
    let creative = CREATIVE.iter().any(|w| lower.contains(w));
    let structured = STRUCTURED.iter().any(|w| lower.contains(w));
    creative && structured
}

fn has_web_context(output: &str) -> bool {
    const SIGNALS: &[&str] = &[
        "according to",
        "based on",
        "research shows",
        "studies indicate",
        "current",
        "recent",
        "latest",
        "up-to-date",
        "as of",
        "source:",
        "reference:",
        "cited",
        "documentation",
        "web search",
        "online",
        "internet",
        "website",
        "url",
        "found that",
        "reported",
        "published",
        "article",
        "paper",
    ];
    let lower = output.to_lowercase();
    SIGNALS.iter().filter(|s| lower.contains(*s)).count() >= 2
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> RewardModel {
        RewardModel::new(
            PathBuf::from("/nonexistent/tuning.json"),
            PathBuf::from("/tmp/metaevolve-test-artifacts"),
        )
    }

    #[test]
    fn baselines_by_task_class() {
        assert_eq!(default_baseline("implement a function").time_ms, 45_000.0);
        assert_eq!(default_baseline("analyze these logs").time_ms, 35_000.0);
        assert_eq!(default_baseline("say hello").time_ms, 25_000.0);
    }

    #[test]
    fn process_reward_is_capped() {
        let m = model();
        let output = "First, consider the design. Therefore:\n\
                      def solve(x):\n    # handle errors\n    try:\n        pass\n    except ValueError:\n        raise\n\
                      \"\"\"docs\"\"\" Returns: value. For example, such as this.";
        let ctx = ExecutionContext {
            tool_success_rate: 1.0,
            ..Default::default()
        };
        let reward = m.process_reward(output, &ctx, "add_fewshot");
        assert!(reward <= PROCESS_REWARD_CAP);
        assert!(reward > 0.3);
    }

    #[test]
    fn plain_output_earns_only_tool_bonus() {
        let m = model();
        let ctx = ExecutionContext {
            tool_success_rate: 1.0,
            ..Default::default()
        };
        let reward = m.process_reward("hello", &ctx, "change_system");
        assert!((reward - 0.1).abs() < 1e-9);
    }

    #[test]
    fn cost_penalty_zero_under_baseline() {
        let m = model();
        let baseline = TaskBaseline {
            time_ms: 30_000.0,
            tokens: 2000.0,
        };
        let ctx = ExecutionContext {
            tokens_in: 100.0,
            tokens_out: 100.0,
            ..Default::default()
        };
        assert_eq!(m.cost_penalty(10_000.0, &ctx, &baseline, 0.0), 0.0);
    }

    #[test]
    fn cost_penalty_caps_components() {
        let m = model();
        let baseline = TaskBaseline {
            time_ms: 1_000.0,
            tokens: 100.0,
        };
        let ctx = ExecutionContext {
            tokens_in: 10_000.0,
            tokens_out: 10_000.0,
            tool_calls: 200,
            ..Default::default()
        };
        let penalty = m.cost_penalty(1_000_000.0, &ctx, &baseline, 1_000_000.0);
        assert_eq!(penalty, COST_PENALTY_CAP);
    }

    #[test]
    fn total_reward_monotone_in_outcome_and_antitone_in_cost() {
        let m = model();
        let low = m.compose(0.4, 0.2, 0.1, Value::Null);
        let high = m.compose(0.8, 0.2, 0.1, Value::Null);
        assert!(high.total_reward > low.total_reward);

        let cheap = m.compose(0.5, 0.2, 0.05, Value::Null);
        let costly = m.compose(0.5, 0.2, 0.5, Value::Null);
        assert!(cheap.total_reward > costly.total_reward);
    }

    #[test]
    fn non_finite_components_become_zero() {
        let m = model();
        let breakdown = m.compose(f64::NAN, f64::INFINITY, 0.2, Value::Null);
        assert_eq!(breakdown.outcome_reward, 0.0);
        assert_eq!(breakdown.process_reward, 0.0);
        assert!((breakdown.total_reward + 0.2).abs() < 1e-9);
    }

    #[test]
    fn human_rating_scale() {
        assert_eq!(RewardModel::apply_human_rating(0.5, 1.0).1, 0.2);
        let (_, m4) = RewardModel::apply_human_rating(0.5, 4.0);
        assert!((m4 - 0.8).abs() < 1e-9);
        assert_eq!(RewardModel::apply_human_rating(0.5, 5.0).1, 1.0);
        let (_, m6) = RewardModel::apply_human_rating(0.5, 6.0);
        assert!((m6 - 1.2).abs() < 1e-9);
        assert_eq!(RewardModel::apply_human_rating(0.5, 10.0).1, 2.0);
        // Boosted scores clamp at 1.0
        let (boosted, _) = RewardModel::apply_human_rating(0.9, 10.0);
        assert_eq!(boosted, 1.0);
    }

    #[tokio::test]
    async fn test_command_blends_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let m = RewardModel::new(
            dir.path().join("tuning.json"),
            dir.path().join("artifacts"),
        );
        let (blended, score, err) = m.blend_test_command(0.5, "output", "true", 0.4).await;
        assert_eq!(err, None);
        assert_eq!(score, Some(1.0));
        assert!((blended - 0.7).abs() < 1e-9);

        let (blended, score, _) = m.blend_test_command(0.5, "output", "false", 0.4).await;
        assert_eq!(score, Some(0.0));
        assert!((blended - 0.3).abs() < 1e-9);
    }

    #[test]
    fn tuning_multipliers_apply() {
        let dir = tempfile::tempdir().unwrap();
        let tuning_path = dir.path().join("tuning.json");
        std::fs::write(
            &tuning_path,
            r#"{"process_multiplier": 2.0, "cost_multiplier": 0.5}"#,
        )
        .unwrap();
        let m = RewardModel::new(tuning_path, dir.path().to_path_buf());
        let breakdown = m.compose(0.5, 0.2, 0.2, Value::Null);
        assert!((breakdown.process_reward - 0.4).abs() < 1e-9);
        assert!((breakdown.cost_penalty - 0.1).abs() < 1e-9);
        assert!((breakdown.total_reward - 0.8).abs() < 1e-9);
    }
}
