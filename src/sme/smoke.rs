//! Smoke patch
//!
//! A deterministic, pre-validated minimal patch injected when a proposal
//! batch produces nothing valid, so the downstream stages can still be
//! exercised end-to-end. New-file diffs need no context, so they apply
//! cleanly against any worktree.

use super::types::{calculate_loc_delta, is_safe_diff, paths_allowed_for_area};

pub const SMOKE_ORIGIN: &str = "smoke";
const SMOKE_MAX_LOC: usize = 10;

pub struct SmokePatch {
    pub area: String,
    pub notes: String,
    pub diff: String,
}

pub fn make_smoke_patch() -> SmokePatch {
    let diff = "--- /dev/null\n\
                +++ b/ui/smoke_metric.json\n\
                @@ -0,0 +1,1 @@\n\
                +{\"id\": \"pipeline_smoke\", \"label\": \"Pipeline Smoke\", \"value\": 0}\n";
    SmokePatch {
        area: "ui_metrics".to_string(),
        notes: "Add pipeline smoke-check metric tile".to_string(),
        diff: diff.to_string(),
    }
}

/// Belt-and-braces validation run before injection.
pub fn validate_smoke_patch(patch: &SmokePatch) -> Result<(), String> {
    if !patch.diff.starts_with("---") || !patch.diff.contains("+++") {
        return Err("not a unified diff".to_string());
    }
    is_safe_diff(&patch.diff)?;
    if !paths_allowed_for_area(&patch.area, &patch.diff) {
        return Err(format!("smoke patch escapes area '{}'", patch.area));
    }
    let loc = calculate_loc_delta(&patch.diff);
    if loc > SMOKE_MAX_LOC {
        return Err(format!("smoke patch too large: {loc} LOC"));
    }
    Ok(())
}
