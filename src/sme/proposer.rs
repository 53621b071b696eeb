//! Patch proposer
//!
//! Asks a rotation of evaluation models for one minimal unified-diff change
//! confined to the allowed areas, enforces format and safety, and retries
//! once with the rejection reason folded back into the prompt. A batch that
//! ends empty gets the deterministic smoke patch so the pipeline downstream
//! still runs.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use rand::rngs::StdRng;
use tracing::{info, warn};

use super::enforcer::{self, PatchFormatError};
use super::smoke::{make_smoke_patch, validate_smoke_patch, SMOKE_ORIGIN};
use super::types::{
    calculate_loc_delta, first_modified_path, infer_area_from_diff, is_safe_diff,
    paths_allowed_for_area, MetaPatch, ProposalResponse, RejectReason, Rejection,
};
use crate::judge::{JudgeBackend, JudgeRotation};

const PROPOSER_SYSTEM: &str = "You are a system improvement engine. You propose one minimal, reversible source change at a time and reply with strict JSON only.";

struct Attempt {
    area: String,
    rationale: String,
    diff: String,
}

struct Rejected {
    reason: RejectReason,
    detail: String,
    area: String,
}

pub struct Proposer {
    backend: Option<Arc<dyn JudgeBackend>>,
    rotation: Arc<JudgeRotation>,
    default_model: String,
    allowed_areas: Vec<String>,
    max_loc_delta: usize,
    repo_root: PathBuf,
}

impl Proposer {
    pub fn new(
        backend: Option<Arc<dyn JudgeBackend>>,
        rotation: Arc<JudgeRotation>,
        allowed_areas: Vec<String>,
        max_loc_delta: usize,
        repo_root: PathBuf,
    ) -> Self {
        Self {
            backend,
            rotation,
            default_model: "local-default".to_string(),
            allowed_areas,
            max_loc_delta,
            repo_root,
        }
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    fn make_prompt(&self, rejection_note: Option<&str>) -> String {
        let areas = self.allowed_areas.join(", ");
        let mut prompt = format!(
            "Propose ONE minimal, reversible change to this system.\n\n\
             REQUIREMENTS:\n\
             - Choose area from: {areas}\n\
             - Maximum {} lines of code change\n\
             - The change must be safe, reversible, and minimal\n\n\
             Reply with ONLY a JSON object of exactly this shape:\n\
             {{\"area\": \"<area>\", \"rationale\": \"<one line>\", \"diff\": \"<unified diff with --- a/ and +++ b/ headers>\"}}\n",
            self.max_loc_delta
        );
        if let Some(note) = rejection_note {
            prompt.push_str(&format!(
                "\nYour previous attempt was rejected: {note}\nFix that problem this time.\n"
            ));
        }
        prompt
    }

    fn pick_model(&self, rng: &mut StdRng) -> String {
        self.rotation
            .select(1, rng)
            .into_iter()
            .next()
            .unwrap_or_else(|| self.default_model.clone())
    }

    fn parse_and_enforce(&self, response: &str, origin: &str) -> Result<Attempt, Rejected> {
        let obj = enforcer::loose_json_parse(response).map_err(|e| Rejected {
            reason: RejectReason::BadJson,
            detail: e.to_string(),
            area: "unknown".to_string(),
        })?;

        let raw_lines = enforcer::to_diff_lines(&obj).map_err(|e| Rejected {
            reason: RejectReason::BadDiffFormat,
            detail: e.to_string(),
            area: obj["area"].as_str().unwrap_or("unknown").to_string(),
        })?;
        let raw_diff = raw_lines.join("\n");

        let path = first_modified_path(&raw_diff).ok_or_else(|| Rejected {
            reason: RejectReason::BadDiffFormat,
            detail: "no modified path in diff headers".to_string(),
            area: obj["area"].as_str().unwrap_or("unknown").to_string(),
        })?;

        // Re-anchor against the real file when it exists in the repo.
        let file_text = std::fs::read_to_string(self.repo_root.join(&path)).unwrap_or_default();
        let sanitized = enforcer::enforce_and_sanitize(response, &path, &file_text)
            .map_err(|e| Rejected {
                reason: match e {
                    PatchFormatError::BadJson(_) => RejectReason::BadJson,
                    _ => RejectReason::BadDiffFormat,
                },
                detail: e.to_string(),
                area: obj["area"].as_str().unwrap_or("unknown").to_string(),
            })?;
        let diff = sanitized.join("\n");

        // Area: declared if valid, else inferred from the touched path.
        let declared = obj["area"].as_str().unwrap_or("");
        let area = if self.allowed_areas.iter().any(|a| a == declared) {
            declared.to_string()
        } else {
            match infer_area_from_diff(&diff) {
                Some(inferred) if self.allowed_areas.contains(&inferred) => inferred,
                _ => {
                    return Err(Rejected {
                        reason: RejectReason::BadArea,
                        detail: format!("area '{declared}' not in allow-list and not inferable"),
                        area: declared.to_string(),
                    })
                }
            }
        };

        if !paths_allowed_for_area(&area, &diff) {
            return Err(Rejected {
                reason: RejectReason::PathNotAllowed,
                detail: format!("paths outside '{area}' allow-list"),
                area,
            });
        }

        let loc_delta = calculate_loc_delta(&diff);
        if loc_delta > self.max_loc_delta {
            return Err(Rejected {
                reason: RejectReason::LocDeltaExceeded,
                detail: format!("{loc_delta} > {}", self.max_loc_delta),
                area,
            });
        }

        if let Err(detail) = is_safe_diff(&diff) {
            return Err(Rejected {
                reason: RejectReason::Safety,
                detail,
                area,
            });
        }

        let rationale = obj["rationale"].as_str().unwrap_or("").to_string();
        info!(origin, area = %area, loc_delta, "proposal validated");
        Ok(Attempt {
            area,
            rationale,
            diff,
        })
    }

    async fn generate_one(
        &self,
        rng: &mut StdRng,
    ) -> Result<MetaPatch, Rejection> {
        let Some(backend) = &self.backend else {
            return Err(Rejection {
                reason: RejectReason::BadJson,
                detail: "no proposer backend configured".to_string(),
                origin: "none".to_string(),
                area: "unknown".to_string(),
            });
        };

        let mut rejection_note: Option<String> = None;
        let mut last: Option<Rejection> = None;

        // One fresh attempt plus one retry with the rejection summarized.
        for _ in 0..2 {
            let model = self.pick_model(rng);
            let prompt = self.make_prompt(rejection_note.as_deref());
            let response = match backend.complete(PROPOSER_SYSTEM, &prompt, &model).await {
                Ok(r) => r,
                Err(e) => {
                    let rejection = Rejection {
                        reason: RejectReason::BadJson,
                        detail: format!("model call failed: {e}"),
                        origin: model.clone(),
                        area: "unknown".to_string(),
                    };
                    rejection_note = Some(rejection.detail.clone());
                    last = Some(rejection);
                    continue;
                }
            };

            match self.parse_and_enforce(&response, &model) {
                Ok(attempt) => {
                    let loc_delta = calculate_loc_delta(&attempt.diff);
                    return Ok(MetaPatch::create(
                        &attempt.area,
                        &model,
                        &attempt.rationale,
                        &attempt.diff,
                        loc_delta,
                    ));
                }
                Err(rejected) => {
                    warn!(
                        model,
                        reason = rejected.reason.as_str(),
                        "proposal rejected: {}",
                        rejected.detail
                    );
                    rejection_note =
                        Some(format!("{}: {}", rejected.reason.as_str(), rejected.detail));
                    last = Some(Rejection {
                        reason: rejected.reason,
                        detail: rejected.detail,
                        origin: model,
                        area: rejected.area,
                    });
                }
            }
        }

        Err(last.unwrap_or(Rejection {
            reason: RejectReason::BadJson,
            detail: "no attempts made".to_string(),
            origin: "none".to_string(),
            area: "unknown".to_string(),
        }))
    }

    /// Generate `n` proposals; inject the smoke patch when nothing survives.
    pub async fn generate(&self, n: usize, rng: &mut StdRng) -> ProposalResponse {
        let start = Instant::now();
        let mut response = ProposalResponse {
            total_generated: n,
            ..Default::default()
        };

        for i in 0..n {
            match self.generate_one(rng).await {
                Ok(patch) => {
                    info!(index = i + 1, total = n, patch_id = %patch.id, "proposal accepted");
                    response.patches.push(patch);
                }
                Err(rejection) => {
                    info!(index = i + 1, total = n, reason = rejection.reason.as_str(), "proposal rejected");
                    response.rejected.push(rejection);
                }
            }
        }

        if response.patches.is_empty() && n > 0 {
            let smoke = make_smoke_patch();
            match validate_smoke_patch(&smoke) {
                Ok(()) => {
                    let loc = calculate_loc_delta(&smoke.diff);
                    response.patches.push(MetaPatch::create(
                        &smoke.area,
                        SMOKE_ORIGIN,
                        &smoke.notes,
                        &smoke.diff,
                        loc,
                    ));
                    response.smoke_patch_injected = true;
                    info!("smoke patch injected into empty batch");
                }
                Err(e) => warn!("smoke patch failed validation: {e}"),
            }
        }

        response.execution_time_ms = start.elapsed().as_millis() as u64;
        response
    }
}
