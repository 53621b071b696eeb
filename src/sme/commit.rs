//! Commit & rollback
//!
//! Applies a selected patch to the live repository on a short-lived branch,
//! optionally running tests first, then fast-forwards the base branch and
//! persists the artifact. Rollback reverts by SHA. Both paths try hard to
//! leave the working tree on the original branch when anything fails, and
//! git operations are serialized at the repo level.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::shadow::ShadowEvalResult;
use super::storage::PatchStorage;
use super::types::MetaPatch;

const GIT_TIMEOUT_SECS: u64 = 30;
const TEST_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitOutcome {
    pub patch_id: String,
    pub status: String,
    pub commit_sha: Option<String>,
    pub branch: Option<String>,
    pub test_results: Option<Value>,
    pub error: Option<String>,
    pub artifact_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackOutcome {
    pub commit_sha: String,
    pub rollback_sha: Option<String>,
    pub status: String,
    pub error: Option<String>,
}

async fn git(repo: &Path, args: &[&str]) -> Result<String> {
    let output = tokio::time::timeout(
        std::time::Duration::from_secs(GIT_TIMEOUT_SECS),
        Command::new("git")
            .args(args)
            .current_dir(repo)
            .kill_on_drop(true)
            .output(),
    )
    .await
    .map_err(|_| anyhow::anyhow!("git {} timed out", args.join(" ")))?
    .with_context(|| format!("failed to spawn git {}", args.join(" ")))?;

    if !output.status.success() {
        bail!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

pub struct CommitManager {
    repo_root: PathBuf,
    allow_commits: bool,
    test_before_commit: bool,
    storage: PatchStorage,
    // Only one commit/rollback may run at a time.
    git_lock: Mutex<()>,
}

impl CommitManager {
    pub fn new(
        repo_root: impl Into<PathBuf>,
        allow_commits: bool,
        test_before_commit: bool,
        storage: PatchStorage,
    ) -> Self {
        Self {
            repo_root: repo_root.into(),
            allow_commits,
            test_before_commit,
            storage,
            git_lock: Mutex::new(()),
        }
    }

    pub fn storage(&self) -> &PatchStorage {
        &self.storage
    }

    async fn run_tests(&self) -> Value {
        let result = tokio::time::timeout(
            std::time::Duration::from_secs(TEST_TIMEOUT_SECS),
            Command::new("cargo")
                .args(["test", "-q"])
                .current_dir(&self.repo_root)
                .kill_on_drop(true)
                .output(),
        )
        .await;
        match result {
            Ok(Ok(output)) => {
                let text = String::from_utf8_lossy(&output.stdout);
                let snippet: String = text.chars().take(500).collect();
                json!({
                    "passed": output.status.success(),
                    "output": snippet,
                    "return_code": output.status.code(),
                })
            }
            Ok(Err(e)) => json!({ "passed": false, "output": e.to_string() }),
            Err(_) => json!({ "passed": false, "output": "tests timed out" }),
        }
    }

    /// Commit a patch. Requires commits to be enabled and a clean index.
    pub async fn commit_patch(
        &self,
        patch: &MetaPatch,
        shadow_result: Option<&ShadowEvalResult>,
    ) -> CommitOutcome {
        let mut outcome = CommitOutcome {
            patch_id: patch.id.clone(),
            status: "pending".to_string(),
            commit_sha: None,
            branch: None,
            test_results: None,
            error: None,
            artifact_path: None,
        };

        if !self.allow_commits {
            outcome.status = "failed".to_string();
            outcome.error = Some("live commits disabled".to_string());
            return outcome;
        }

        let _guard = self.git_lock.lock().await;
        let repo = self.repo_root.clone();

        let original_branch = match git(&repo, &["rev-parse", "--abbrev-ref", "HEAD"]).await {
            Ok(branch) => branch,
            Err(e) => {
                outcome.status = "failed".to_string();
                outcome.error = Some(e.to_string());
                return outcome;
            }
        };

        match self.commit_inner(patch, shadow_result, &repo, &original_branch, &mut outcome).await {
            Ok(()) => outcome,
            Err(e) => {
                error!(patch_id = %patch.id, "commit failed: {e}");
                outcome.status = "failed".to_string();
                outcome.error = Some(e.to_string());
                // Leave the tree on the original branch and drop the temp
                // branch if it was created.
                let _ = git(&repo, &["checkout", &original_branch]).await;
                if let Some(branch) = &outcome.branch {
                    let _ = git(&repo, &["branch", "-D", branch]).await;
                }
                outcome
            }
        }
    }

    async fn commit_inner(
        &self,
        patch: &MetaPatch,
        shadow_result: Option<&ShadowEvalResult>,
        repo: &Path,
        original_branch: &str,
        outcome: &mut CommitOutcome,
    ) -> Result<()> {
        // Clean index required before branching.
        let dirty = git(repo, &["status", "--porcelain", "--untracked-files=no"]).await?;
        if !dirty.is_empty() {
            bail!("working tree not clean");
        }

        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let short_id = &patch.id[..8.min(patch.id.len())];
        let branch = format!("dgm-patch-{short_id}-{ts}");
        git(repo, &["checkout", "-b", &branch]).await?;
        outcome.branch = Some(branch.clone());
        info!(branch = %branch, "created commit branch");

        // Apply through a temp patch file.
        let patch_file = repo.join(format!(".commit_{short_id}.diff"));
        std::fs::write(&patch_file, &patch.diff).context("patch write failed")?;
        let apply = git(repo, &["apply", &patch_file.display().to_string()]).await;
        let _ = std::fs::remove_file(&patch_file);
        apply.context("patch application failed")?;

        if self.test_before_commit {
            info!("running tests before commit");
            let tests = self.run_tests().await;
            let passed = tests["passed"].as_bool().unwrap_or(false);
            outcome.test_results = Some(tests);
            if !passed {
                bail!("tests failed before commit");
            }
        }

        git(repo, &["add", "-A"]).await?;
        let reward_note = shadow_result
            .and_then(|s| s.reward_delta)
            .map(|d| format!(" reward_delta={d:+.3}"))
            .unwrap_or_default();
        let message = format!(
            "[self-mod] {short_id} {}{reward_note}\n\n{}",
            patch.area, patch.notes
        );
        git(repo, &["commit", "-m", &message]).await?;
        let sha = git(repo, &["rev-parse", "HEAD"]).await?;
        outcome.commit_sha = Some(sha.clone());
        info!(sha = %&sha[..8.min(sha.len())], "patch committed");

        // Fast-forward the base branch, falling back to a regular merge.
        git(repo, &["checkout", original_branch]).await?;
        if git(repo, &["merge", "--ff-only", &branch]).await.is_err() {
            git(repo, &["merge", "--no-edit", &branch]).await?;
        }
        git(repo, &["branch", "-d", &branch]).await?;

        match self.storage.save_artifact(
            patch,
            shadow_result,
            &sha,
            outcome.test_results.clone(),
        ) {
            Ok(path) => outcome.artifact_path = Some(path),
            Err(e) => warn!("artifact save failed: {e}"),
        }

        outcome.status = "committed".to_string();
        Ok(())
    }

    /// Revert a previously committed patch by SHA.
    pub async fn rollback_commit(&self, commit_sha: &str) -> RollbackOutcome {
        let mut outcome = RollbackOutcome {
            commit_sha: commit_sha.to_string(),
            rollback_sha: None,
            status: "pending".to_string(),
            error: None,
        };

        if !self.allow_commits {
            outcome.status = "failed".to_string();
            outcome.error = Some("rollback disabled".to_string());
            return outcome;
        }

        let _guard = self.git_lock.lock().await;
        let repo = self.repo_root.clone();

        // Verify the target exists before touching the tree.
        if git(&repo, &["rev-parse", "--verify", commit_sha]).await.is_err() {
            outcome.status = "failed".to_string();
            outcome.error = Some(format!("commit {commit_sha} not found"));
            return outcome;
        }

        match git(&repo, &["revert", "--no-edit", commit_sha]).await {
            Ok(_) => match git(&repo, &["rev-parse", "HEAD"]).await {
                Ok(rollback_sha) => {
                    info!(
                        reverted = %&commit_sha[..8.min(commit_sha.len())],
                        with = %&rollback_sha[..8.min(rollback_sha.len())],
                        "commit rolled back"
                    );
                    outcome.rollback_sha = Some(rollback_sha.clone());
                    outcome.status = "rolled_back".to_string();

                    // Best-effort artifact bookkeeping.
                    let artifact = self
                        .storage
                        .list_artifacts(None)
                        .into_iter()
                        .find(|a| a.commit_sha == commit_sha);
                    if let Some(artifact) = artifact {
                        if let Err(e) = self.storage.update_status(
                            &artifact.patch_id,
                            "rolled_back",
                            Some(&rollback_sha),
                        ) {
                            warn!("artifact status update failed: {e}");
                        }
                    }
                    outcome
                }
                Err(e) => {
                    outcome.status = "failed".to_string();
                    outcome.error = Some(e.to_string());
                    outcome
                }
            },
            Err(e) => {
                let _ = git(&repo, &["revert", "--abort"]).await;
                outcome.status = "failed".to_string();
                outcome.error = Some(e.to_string());
                outcome
            }
        }
    }
}
