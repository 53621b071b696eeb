//! Self-modification data types
//!
//! MetaPatch and friends, the diff safety filter, and the closed area
//! allow-list with its path-prefix table.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Hard cap on diff size regardless of LOC budget.
pub const MAX_DIFF_LINES: usize = 500;

/// Substrings that disqualify a diff outright.
pub const FORBIDDEN_TOKENS: &[&str] = &[
    "auth",
    "secret",
    "password",
    "token",
    "key",
    "billing",
    "schema",
    "migration",
    "model_weights",
    "external_client",
    "security",
    "crypto",
    "payment",
    "user_data",
    "admin",
];

/// Paths a patch may never touch.
pub const FORBIDDEN_PATHS: &[&str] = &[
    ".env",
    "config/secrets",
    "auth/",
    "billing/",
    "admin/",
    "migrations/",
    "schema/",
    "weights/",
    "keys/",
];

/// Closed area set with the path prefixes each area may modify.
pub const AREA_PATH_PREFIXES: &[(&str, &[&str])] = &[
    ("prompts", &["src/meta/operators.rs", "prompts/"]),
    ("bandit", &["src/meta/bandit.rs", "src/config.rs"]),
    ("asi_lite", &["src/sme/guards.rs", "src/meta/probes.rs"]),
    ("rag", &["src/tools/rag.rs"]),
    ("memory_policy", &["src/memory/", "src/config.rs"]),
    ("ui_metrics", &["ui/", "src/metrics/"]),
];

/// Infer the area from the first modified path in a diff.
pub fn infer_area_from_diff(diff: &str) -> Option<String> {
    let path = first_modified_path(diff)?;
    AREA_PATH_PREFIXES
        .iter()
        .find(|(_, prefixes)| prefixes.iter().any(|p| path.starts_with(p)))
        .map(|(area, _)| area.to_string())
}

/// Paths named by `+++ b/...` (or `--- a/...`) headers.
pub fn modified_paths(diff: &str) -> Vec<String> {
    let mut paths = Vec::new();
    for line in diff.lines() {
        let path = if let Some(rest) = line.strip_prefix("+++ b/") {
            Some(rest)
        } else if let Some(rest) = line.strip_prefix("--- a/") {
            Some(rest)
        } else {
            None
        };
        if let Some(path) = path {
            let path = path.trim().to_string();
            if !path.is_empty() && path != "/dev/null" && !paths.contains(&path) {
                paths.push(path);
            }
        }
    }
    paths
}

pub fn first_modified_path(diff: &str) -> Option<String> {
    modified_paths(diff).into_iter().next()
}

/// Do every modified path fall inside the area's allow-list?
pub fn paths_allowed_for_area(area: &str, diff: &str) -> bool {
    let Some((_, prefixes)) = AREA_PATH_PREFIXES.iter().find(|(a, _)| *a == area) else {
        return false;
    };
    let paths = modified_paths(diff);
    !paths.is_empty() && paths.iter().all(|p| prefixes.iter().any(|pre| p.starts_with(pre)))
}

/// `loc_delta` = additions + deletions, headers excluded.
pub fn calculate_loc_delta(diff: &str) -> usize {
    let mut additions = 0;
    let mut deletions = 0;
    for line in diff.lines() {
        if line.starts_with('+') && !line.starts_with("+++") {
            additions += 1;
        } else if line.starts_with('-') && !line.starts_with("---") {
            deletions += 1;
        }
    }
    additions + deletions
}

/// Safety filter: forbidden tokens, forbidden paths, size cap.
pub fn is_safe_diff(diff: &str) -> Result<(), String> {
    let diff_lower = diff.to_lowercase();
    for pattern in FORBIDDEN_TOKENS {
        if diff_lower.contains(pattern) {
            return Err(format!("contains forbidden pattern: {pattern}"));
        }
    }
    for path in FORBIDDEN_PATHS {
        if diff_lower.contains(path) {
            return Err(format!("modifies restricted path: {path}"));
        }
    }
    if diff.lines().count() > MAX_DIFF_LINES {
        return Err(format!("diff too large (>{MAX_DIFF_LINES} lines)"));
    }
    Ok(())
}

/// A proposed, bounded modification to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaPatch {
    pub id: String,
    pub area: String,
    pub origin: String,
    pub notes: String,
    pub diff: String,
    pub loc_delta: usize,
    pub apply_ok: Option<bool>,
    pub lint_ok: Option<bool>,
    pub tests_ok: Option<bool>,
    pub stdout_snippet: String,
}

impl MetaPatch {
    pub fn create(area: &str, origin: &str, notes: &str, diff: &str, loc_delta: usize) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            area: area.to_string(),
            origin: origin.to_string(),
            notes: notes.to_string(),
            diff: diff.to_string(),
            loc_delta,
            apply_ok: None,
            lint_ok: None,
            tests_ok: None,
            stdout_snippet: String::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.apply_ok == Some(true) && self.lint_ok == Some(true) && self.tests_ok == Some(true)
    }

    pub fn summary(&self) -> Value {
        serde_json::json!({
            "id": self.id,
            "area": self.area,
            "origin": self.origin,
            "notes": self.notes,
            "loc_delta": self.loc_delta,
            "apply_ok": self.apply_ok,
            "lint_ok": self.lint_ok,
            "tests_ok": self.tests_ok,
        })
    }
}

/// Why a proposal was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    BadJson,
    BadArea,
    BadDiffFormat,
    PathNotAllowed,
    LocDeltaExceeded,
    Safety,
    GitApplyCheck,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::BadJson => "bad_json",
            RejectReason::BadArea => "bad_area",
            RejectReason::BadDiffFormat => "bad_diff_format",
            RejectReason::PathNotAllowed => "path_not_allowed",
            RejectReason::LocDeltaExceeded => "loc_delta_exceeded",
            RejectReason::Safety => "safety",
            RejectReason::GitApplyCheck => "git_apply_check",
        }
    }
}

/// Rejection record carried in proposal responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rejection {
    pub reason: RejectReason,
    pub detail: String,
    pub origin: String,
    pub area: String,
}

/// Result of one proposal generation batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProposalResponse {
    pub patches: Vec<MetaPatch>,
    pub rejected: Vec<Rejection>,
    pub total_generated: usize,
    pub execution_time_ms: u64,
    pub smoke_patch_injected: bool,
}

/// Result of applying a patch in dry-run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyResult {
    pub patch_id: String,
    pub success: bool,
    pub apply_ok: bool,
    pub lint_ok: bool,
    pub tests_ok: bool,
    pub repair_attempted: bool,
    pub repair_successful: bool,
    pub stdout: String,
    pub stderr: String,
    pub files_modified: Vec<String>,
    pub execution_time_ms: u64,
}

impl ApplyResult {
    pub fn new(patch_id: &str) -> Self {
        Self {
            patch_id: patch_id.to_string(),
            success: false,
            apply_ok: false,
            lint_ok: false,
            tests_ok: false,
            repair_attempted: false,
            repair_successful: false,
            stdout: String::new(),
            stderr: String::new(),
            files_modified: Vec::new(),
            execution_time_ms: 0,
        }
    }

    pub fn stdout_snippet(&self) -> String {
        if self.stdout.chars().count() <= 200 {
            self.stdout.clone()
        } else {
            let cut: String = self.stdout.chars().take(200).collect();
            format!("{cut}...")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_DIFF: &str = "--- a/src/meta/bandit.rs\n+++ b/src/meta/bandit.rs\n@@ -1,3 +1,4 @@\n line\n+added\n line2\n line3\n";

    #[test]
    fn loc_delta_counts_changes_not_headers() {
        assert_eq!(calculate_loc_delta(SAMPLE_DIFF), 1);
        let diff = "--- a/f\n+++ b/f\n@@ -1,2 +1,2 @@\n-old\n+new\n";
        assert_eq!(calculate_loc_delta(diff), 2);
        assert_eq!(calculate_loc_delta(""), 0);
    }

    #[test]
    fn safety_filter_catches_forbidden_tokens() {
        let diff = "--- a/f\n+++ b/f\n@@ -1,1 +1,1 @@\n+let password = 1;\n";
        let err = is_safe_diff(diff).unwrap_err();
        assert!(err.contains("password"));
    }

    #[test]
    fn safety_filter_catches_forbidden_paths() {
        let diff = "--- a/billing/invoice.rs\n+++ b/billing/invoice.rs\n@@ -1,1 +1,1 @@\n+x\n";
        assert!(is_safe_diff(diff).is_err());
    }

    #[test]
    fn safety_filter_caps_size() {
        let big = format!(
            "--- a/f\n+++ b/f\n@@ -1,1 +1,501 @@\n{}",
            "+line\n".repeat(510)
        );
        let err = is_safe_diff(&big).unwrap_err();
        assert!(err.contains("too large"));
    }

    #[test]
    fn clean_diff_passes_safety() {
        assert!(is_safe_diff(SAMPLE_DIFF).is_ok());
    }

    #[test]
    fn area_inference_from_path_prefix() {
        assert_eq!(infer_area_from_diff(SAMPLE_DIFF), Some("bandit".to_string()));
        let rag = "--- a/src/tools/rag.rs\n+++ b/src/tools/rag.rs\n@@ -1,1 +1,1 @@\n+x\n";
        assert_eq!(infer_area_from_diff(rag), Some("rag".to_string()));
        let elsewhere = "--- a/src/main.rs\n+++ b/src/main.rs\n@@ -1,1 +1,1 @@\n+x\n";
        assert_eq!(infer_area_from_diff(elsewhere), None);
    }

    #[test]
    fn area_path_enforcement() {
        assert!(paths_allowed_for_area("bandit", SAMPLE_DIFF));
        assert!(!paths_allowed_for_area("rag", SAMPLE_DIFF));
        assert!(!paths_allowed_for_area("nonexistent", SAMPLE_DIFF));
    }

    #[test]
    fn patch_validity_requires_all_three_flags() {
        let mut patch = MetaPatch::create("bandit", "model-x", "tweak", SAMPLE_DIFF, 1);
        assert!(!patch.is_valid());
        patch.apply_ok = Some(true);
        patch.lint_ok = Some(true);
        patch.tests_ok = Some(true);
        assert!(patch.is_valid());
        patch.tests_ok = Some(false);
        assert!(!patch.is_valid());
    }

    #[test]
    fn reject_reason_codes_are_stable() {
        assert_eq!(RejectReason::Safety.as_str(), "safety");
        assert_eq!(RejectReason::GitApplyCheck.as_str(), "git_apply_check");
        let json = serde_json::to_string(&RejectReason::BadJson).unwrap();
        assert_eq!(json, "\"bad_json\"");
    }
}
