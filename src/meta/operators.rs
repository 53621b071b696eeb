//! Operator library
//!
//! Pure recipe mutations plus plan assembly. Every operator produces a new
//! recipe from a base; numeric mutations draw from bounded ranges, library
//! mutations pick from the fixed voice/nudge/few-shot sets.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::engine::{EngineKind, GenOptions};

pub const TEMP_MIN: f64 = 0.1;
pub const TEMP_MAX: f64 = 1.5;
pub const TOP_K_MIN: u32 = 1;
pub const TOP_K_MAX: u32 = 100;

pub const SYSTEMS: &[&str] = &[
    "You are a concise senior engineer. Return precise, directly usable output.",
    "You are a careful analyst. Explain steps briefly and verify constraints.",
    "You are a creative optimizer. Offer improved alternatives and rationale.",
    "You are a detail-oriented specialist. Focus on accuracy and completeness.",
    "You are an experienced architect. Design robust and scalable solutions.",
];

pub const NUDGES: &[&str] = &[
    "Respond in bullet points.",
    "Prioritize correctness and include one test example.",
    "Add a short checklist at the end.",
    "Use concise, technical language.",
    "Provide step-by-step reasoning.",
    "Include potential edge cases.",
    "Format as structured sections.",
];

pub const FEWSHOT_EXAMPLES: &[(&str, &str)] = &[
    (
        "code",
        "Example: Write a function to reverse a string.\ndef reverse_string(s): return s[::-1]",
    ),
    (
        "analysis",
        "Example: Analyze this data pattern.\nPattern shows 20% increase in usage during peak hours, suggesting need for scaling.",
    ),
    (
        "debug",
        "Example: Fix this bug.\nIssue: IndexError on line 42. Solution: Add bounds checking before array access.",
    ),
    (
        "design",
        "Example: Design a user login system.\nComponents: Authentication service, session management, password hashing, rate limiting.",
    ),
];

/// Expanded voice set used when the systems-v2 flag is on.
pub const VOICES_V2: &[(&str, &str)] = &[
    (
        "Engineer",
        "You are a concise senior engineer. Return minimal, directly usable code or config.",
    ),
    (
        "Analyst",
        "You are a careful analyst. Trace reasoning in brief steps and confirm assumptions are valid.",
    ),
    (
        "Optimizer",
        "You are a creative optimizer. Generate alternatives, compare tradeoffs, and justify the best option.",
    ),
    (
        "Specialist",
        "You are a detail-oriented specialist. Ensure correctness, compliance, and complete coverage of edge cases.",
    ),
    (
        "Architect",
        "You are an experienced architect. Design robust, extensible systems with long-term maintainability.",
    ),
    (
        "Product Strategist",
        "You are a pragmatic product strategist. Frame solutions in terms of user value, business impact, and constraints.",
    ),
    (
        "Experimenter",
        "You are a rapid prototyper. Propose small, low-risk tests to validate ideas quickly.",
    ),
    (
        "Skeptic",
        "You are a rigorous skeptic. Stress-test assumptions and highlight potential failures.",
    ),
];

/// Sampling parameters carried by a recipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: f64,
    pub top_k: u32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_k: 40,
        }
    }
}

/// A parameterized description of how to prompt the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    pub engine: EngineKind,
    pub system: String,
    pub nudge: String,
    pub params: SamplingParams,
    pub use_rag: bool,
    pub use_memory: bool,
    pub use_web: bool,
    pub fewshot: Option<String>,
}

impl Default for Recipe {
    fn default() -> Self {
        Self {
            engine: EngineKind::Ollama,
            system: SYSTEMS[0].to_string(),
            nudge: NUDGES[0].to_string(),
            params: SamplingParams::default(),
            use_rag: false,
            use_memory: false,
            use_web: false,
            fewshot: None,
        }
    }
}

/// Apply one named operator to a base recipe, producing the mutated plan.
/// Unrecognized names leave the recipe unchanged.
pub fn build_plan(operator: &str, base: Option<&Recipe>, rng: &mut StdRng) -> Recipe {
    let mut plan = base.cloned().unwrap_or_default();

    match operator {
        "change_system" => {
            if let Some(system) = SYSTEMS.choose(rng) {
                plan.system = system.to_string();
            }
        }
        "change_nudge" => {
            if let Some(nudge) = NUDGES.choose(rng) {
                plan.nudge = nudge.to_string();
            }
        }
        "raise_temp" => {
            let bump = rng.gen_range(0.1..=0.3);
            plan.params.temperature = (plan.params.temperature + bump).min(TEMP_MAX);
        }
        "lower_temp" => {
            let drop = rng.gen_range(0.1..=0.3);
            plan.params.temperature = (plan.params.temperature - drop).max(TEMP_MIN);
        }
        "raise_top_k" => {
            let bump = rng.gen_range(5..=15);
            plan.params.top_k = (plan.params.top_k + bump).min(TOP_K_MAX);
        }
        "lower_top_k" => {
            let drop = rng.gen_range(5..=15);
            plan.params.top_k = plan.params.top_k.saturating_sub(drop).max(TOP_K_MIN);
        }
        "inject_rag" => plan.use_rag = true,
        "inject_memory" => plan.use_memory = true,
        "toggle_web" => plan.use_web = !plan.use_web,
        "add_fewshot" => {
            if let Some((_, example)) = FEWSHOT_EXAMPLES.choose(rng) {
                plan.fewshot = Some(example.to_string());
            }
        }
        _ => {}
    }

    plan
}

/// Task-class-weighted voice pick, active only under the systems-v2 flag.
pub fn weighted_system_for_task(task_class: &str, rng: &mut StdRng) -> Option<String> {
    let choices: &[(&str, u32)] = match task_class.trim().to_lowercase().as_str() {
        "code" => &[
            ("Engineer", 3),
            ("Analyst", 2),
            ("Specialist", 2),
            ("Architect", 2),
            ("Optimizer", 1),
            ("Experimenter", 1),
            ("Skeptic", 1),
            ("Product Strategist", 1),
        ],
        "analysis" => &[
            ("Analyst", 3),
            ("Skeptic", 2),
            ("Optimizer", 2),
            ("Engineer", 1),
            ("Architect", 1),
        ],
        "writing" => &[
            ("Experimenter", 3),
            ("Optimizer", 2),
            ("Specialist", 1),
            ("Analyst", 1),
            ("Skeptic", 1),
        ],
        "business" => &[
            ("Product Strategist", 3),
            ("Architect", 2),
            ("Optimizer", 2),
            ("Skeptic", 1),
            ("Analyst", 1),
        ],
        "research" => &[
            ("Analyst", 3),
            ("Specialist", 2),
            ("Skeptic", 2),
            ("Optimizer", 1),
        ],
        _ => &[
            ("Analyst", 2),
            ("Optimizer", 2),
            ("Engineer", 1),
            ("Experimenter", 1),
            ("Skeptic", 1),
            ("Product Strategist", 1),
        ],
    };

    let population: Vec<&str> = choices
        .iter()
        .flat_map(|(name, w)| std::iter::repeat(*name).take((*w).max(1) as usize))
        .collect();
    let pick = population.choose(rng)?;
    VOICES_V2
        .iter()
        .find(|(name, _)| name == pick)
        .map(|(_, voice)| voice.to_string())
}

/// Context gathered for one iteration before plan application.
#[derive(Debug, Clone, Default)]
pub struct ContextBundle {
    pub task: String,
    pub memory_primer: String,
    pub rag_context: String,
    pub memory_context: String,
    pub web_context: String,
}

/// The fully realized prompt for one generation.
#[derive(Debug, Clone)]
pub struct PlanExecution {
    pub prompt: String,
    pub system: String,
    pub options: GenOptions,
}

/// Realize a recipe against gathered context. Assembly order: few-shot,
/// RAG, memory, web, then the task and the nudge as constraints. A non-empty
/// memory primer is prepended to the system text.
pub fn apply(plan: &Recipe, context: &ContextBundle) -> PlanExecution {
    let mut parts = Vec::new();
    if let Some(fewshot) = &plan.fewshot {
        parts.push(format!("Examples:\n{fewshot}"));
    }
    if plan.use_rag && !context.rag_context.is_empty() {
        parts.push(format!("RAG Context:\n{}", context.rag_context));
    }
    if plan.use_memory && !context.memory_context.is_empty() {
        parts.push(format!("Memory Context:\n{}", context.memory_context));
    }
    if plan.use_web && !context.web_context.is_empty() {
        parts.push(format!("Web Context:\n{}", context.web_context));
    }

    let prompt = if parts.is_empty() {
        format!("{}\n\nConstraints:\n{}", context.task, plan.nudge)
    } else {
        format!(
            "{}\n\nContext:\n{}\n\nConstraints:\n{}",
            context.task,
            parts.join("\n\n"),
            plan.nudge
        )
    };

    let system = if context.memory_primer.is_empty() {
        plan.system.clone()
    } else {
        format!("{}\n\n{}", context.memory_primer, plan.system)
    };

    PlanExecution {
        prompt,
        system,
        options: GenOptions {
            temperature: Some(plan.params.temperature),
            top_k: Some(plan.params.top_k),
            ..Default::default()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    #[test]
    fn raise_temp_stays_within_bounds() {
        let mut rng = rng();
        let mut plan = Recipe::default();
        for _ in 0..50 {
            plan = build_plan("raise_temp", Some(&plan), &mut rng);
            assert!(plan.params.temperature <= TEMP_MAX);
        }
        assert!((plan.params.temperature - TEMP_MAX).abs() < 1e-9);
    }

    #[test]
    fn lower_temp_stays_within_bounds() {
        let mut rng = rng();
        let mut plan = Recipe::default();
        for _ in 0..50 {
            plan = build_plan("lower_temp", Some(&plan), &mut rng);
            assert!(plan.params.temperature >= TEMP_MIN);
        }
    }

    #[test]
    fn top_k_mutations_clamp() {
        let mut rng = rng();
        let mut plan = Recipe::default();
        for _ in 0..30 {
            plan = build_plan("raise_top_k", Some(&plan), &mut rng);
        }
        assert_eq!(plan.params.top_k, TOP_K_MAX);
        for _ in 0..30 {
            plan = build_plan("lower_top_k", Some(&plan), &mut rng);
        }
        assert_eq!(plan.params.top_k, TOP_K_MIN);
    }

    #[test]
    fn toggle_web_flips() {
        let mut rng = rng();
        let plan = build_plan("toggle_web", None, &mut rng);
        assert!(plan.use_web);
        let plan = build_plan("toggle_web", Some(&plan), &mut rng);
        assert!(!plan.use_web);
    }

    #[test]
    fn inject_flags_are_sticky() {
        let mut rng = rng();
        let plan = build_plan("inject_rag", None, &mut rng);
        assert!(plan.use_rag);
        let plan = build_plan("inject_memory", Some(&plan), &mut rng);
        assert!(plan.use_rag && plan.use_memory);
    }

    #[test]
    fn unknown_operator_is_identity() {
        let mut rng = rng();
        let base = Recipe::default();
        let plan = build_plan("warp_reality", Some(&base), &mut rng);
        assert_eq!(plan, base);
    }

    #[test]
    fn apply_orders_context_blocks() {
        let mut plan = Recipe {
            use_rag: true,
            use_web: true,
            fewshot: Some("Example: x".to_string()),
            ..Default::default()
        };
        plan.nudge = "Be terse.".to_string();
        let context = ContextBundle {
            task: "Summarize the design".to_string(),
            rag_context: "doc snippet".to_string(),
            web_context: "web snippet".to_string(),
            ..Default::default()
        };
        let execution = apply(&plan, &context);
        let examples = execution.prompt.find("Examples:").unwrap();
        let rag = execution.prompt.find("RAG Context:").unwrap();
        let web = execution.prompt.find("Web Context:").unwrap();
        let constraints = execution.prompt.find("Constraints:").unwrap();
        assert!(examples < rag && rag < web && web < constraints);
        assert!(execution.prompt.starts_with("Summarize the design"));
    }

    #[test]
    fn memory_primer_prepends_to_system() {
        let plan = Recipe::default();
        let context = ContextBundle {
            task: "t".to_string(),
            memory_primer: "seed lines".to_string(),
            ..Default::default()
        };
        let execution = apply(&plan, &context);
        assert!(execution.system.starts_with("seed lines"));
        assert!(execution.system.ends_with(SYSTEMS[0]));
    }

    #[test]
    fn weighted_voice_respects_task_class() {
        let mut rng = rng();
        for _ in 0..20 {
            let voice = weighted_system_for_task("code", &mut rng).unwrap();
            assert!(VOICES_V2.iter().any(|(_, v)| *v == voice));
        }
    }
}
