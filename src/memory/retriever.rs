//! Memory primer assembly
//!
//! Turns retrieved experiences into a compact "evolutionary seed" block for
//! the system prompt. Entries are added best-reward-first until the token
//! budget would be exceeded; the closing instruction is always present.

use serde_json::Value;

use super::store::Experience;
use crate::embed::estimate_tokens;

const PLAN_EXCERPT_CHARS: usize = 150;
const OUTPUT_EXCERPT_CHARS: usize = 200;

const EVOLUTION_INSTRUCTION: &str = "\nObjective: Evolve a new approach that improves on these strengths and avoids the weaknesses listed above. \nDo not copy verbatim - use these as evolutionary seeds to inspire novel improvements.";

/// Build the primer and its estimated token count.
pub fn build_memory_primer(experiences: &[Experience], tokens_max: usize) -> (String, usize) {
    if experiences.is_empty() {
        return (String::new(), 0);
    }

    let mut sorted: Vec<&Experience> = experiences.iter().collect();
    sorted.sort_by(|a, b| {
        b.reward
            .partial_cmp(&a.reward)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut parts = vec![
        "Evolutionary seeds from similar past cases (higher reward is better):".to_string(),
    ];

    for (i, exp) in sorted.iter().enumerate() {
        let entry = format!(
            "\n{}. Reward:{:.2} Δ:{:.2} Conf:{:.2} Op:{}\n   Plan excerpt: {}\n   Output excerpt: {}\n   Known weaknesses: {}",
            i + 1,
            exp.reward,
            exp.improvement_delta,
            exp.confidence_score,
            exp.operator_used,
            plan_excerpt(&exp.plan),
            output_excerpt(&exp.output_text),
            infer_weaknesses(exp),
        );
        parts.push(entry);

        let candidate = format!("{}\n{}", parts.join("\n"), EVOLUTION_INSTRUCTION);
        if estimate_tokens(&candidate) > tokens_max {
            parts.pop();
            break;
        }
    }

    parts.push(EVOLUTION_INSTRUCTION.to_string());
    let primer = parts.join("\n");
    let tokens = estimate_tokens(&primer);
    (primer, tokens)
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}

fn plan_excerpt(plan: &Value) -> String {
    if plan.is_null() {
        return "N/A".to_string();
    }
    for field in ["system", "nudge", "strategy", "approach", "method", "plan"] {
        if let Some(text) = plan.get(field).and_then(|v| v.as_str()) {
            if !text.is_empty() {
                return truncate(text, PLAN_EXCERPT_CHARS);
            }
        }
    }
    truncate(&plan.to_string(), PLAN_EXCERPT_CHARS)
}

fn output_excerpt(output: &str) -> String {
    let cleaned = output.trim();
    if cleaned.is_empty() {
        return "N/A".to_string();
    }
    match cleaned.lines().map(str::trim).find(|l| !l.is_empty()) {
        Some(first_line) => truncate(first_line, OUTPUT_EXCERPT_CHARS),
        None => truncate(cleaned, OUTPUT_EXCERPT_CHARS),
    }
}

/// Heuristic weakness annotations from experience metadata.
fn infer_weaknesses(exp: &Experience) -> String {
    let mut weaknesses: Vec<&str> = Vec::new();

    if exp.confidence_score < 0.7 {
        weaknesses.push("low judge confidence");
    }
    if exp.reward < 0.8 && exp.judge_ai > 0.0 && exp.judge_semantic > 0.0 {
        if exp.judge_ai < exp.judge_semantic {
            weaknesses.push("AI judge scored lower than semantic");
        } else if exp.judge_semantic < 0.5 {
            weaknesses.push("poor semantic match");
        }
    }
    if exp.latency_ms > 10_000 {
        weaknesses.push("slow execution");
    }
    if exp.tokens_out > exp.tokens_in * 3 {
        weaknesses.push("overly verbose output");
    }
    match exp.operator_used.as_str() {
        "raise_temp" | "lower_temp" if exp.reward < 0.6 => {
            weaknesses.push("temperature adjustment ineffective");
        }
        "add_fewshot" if exp.reward < 0.7 => {
            weaknesses.push("examples may not be relevant");
        }
        _ => {}
    }

    if weaknesses.is_empty() {
        "N/A".to_string()
    } else {
        weaknesses.join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn experience(input: &str, reward: f64) -> Experience {
        Experience::new(
            "code",
            input,
            serde_json::json!({"system": "You are a concise senior engineer."}),
            "change_system",
            "fn main() { println!(\"hello\"); }",
            reward,
            0.9,
            0.8,
            0.6,
            100,
            150,
            1200,
            vec![0.5; 8],
            0.5,
        )
    }

    #[test]
    fn empty_input_yields_empty_primer() {
        let (primer, tokens) = build_memory_primer(&[], 200);
        assert!(primer.is_empty());
        assert_eq!(tokens, 0);
    }

    #[test]
    fn primer_orders_by_reward_desc() {
        let experiences = vec![experience("a", 0.7), experience("b", 0.95)];
        let (primer, _) = build_memory_primer(&experiences, 500);
        let first = primer.find("Reward:0.95").unwrap();
        let second = primer.find("Reward:0.70").unwrap();
        assert!(first < second);
    }

    #[test]
    fn primer_always_ends_with_instruction() {
        let experiences = vec![experience("a", 0.9)];
        let (primer, _) = build_memory_primer(&experiences, 500);
        assert!(primer.contains("evolutionary seeds to inspire novel improvements"));
    }

    #[test]
    fn primer_truncates_to_token_budget() {
        let experiences: Vec<Experience> = (0..10)
            .map(|i| experience(&format!("input number {i}"), 0.9 - i as f64 * 0.01))
            .collect();
        let (primer, tokens) = build_memory_primer(&experiences, 120);
        assert!(tokens <= 140, "primer should stay near the budget, got {tokens}");
        // A contiguous prefix of entries: entry 1 present, entry 10 dropped.
        assert!(primer.contains("\n1. Reward:"));
        assert!(!primer.contains("\n10. Reward:"));
        assert!(primer.contains("evolutionary seeds"));
    }

    #[test]
    fn weaknesses_reflect_metadata() {
        let mut exp = experience("slow one", 0.65);
        exp.latency_ms = 20_000;
        exp.confidence_score = 0.5;
        let text = infer_weaknesses(&exp);
        assert!(text.contains("low judge confidence"));
        assert!(text.contains("slow execution"));
    }

    #[test]
    fn plan_excerpt_prefers_named_fields() {
        let plan = serde_json::json!({"nudge": "Respond in bullet points."});
        assert_eq!(plan_excerpt(&plan), "Respond in bullet points.");
        assert_eq!(plan_excerpt(&serde_json::Value::Null), "N/A");
    }

    #[test]
    fn output_excerpt_takes_first_substantial_line() {
        assert_eq!(output_excerpt("\n\n  first line\nsecond"), "first line");
        assert_eq!(output_excerpt(""), "N/A");
    }
}
