//! Dry-run applier
//!
//! Applies a patch inside an isolated worktree copy, lints, runs a bounded
//! test subset and records the three validation flags. The worktree is a
//! scoped temp directory released on every exit path; dry-run never touches
//! the live repo. Live application fails closed unless commits are enabled.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::enforcer::reanchor_hunk;
use super::types::{first_modified_path, modified_paths, ApplyResult, MetaPatch};

const APPLY_TIMEOUT_SECS: u64 = 10;
const LINT_TIMEOUT_SECS: u64 = 30;
const TEST_TIMEOUT_SECS: u64 = 60;
const MAX_TEST_FILES: usize = 5;
const OUTPUT_CAP_CHARS: usize = 4000;

/// Directories never copied into a worktree.
const COPY_EXCLUDES: &[&str] = &[".git", "target", "node_modules", "logs", "runs", "__pycache__"];

/// Scoped worktree: the temp directory is deleted when this drops.
pub struct Worktree {
    _dir: TempDir,
    root: PathBuf,
}

impl Worktree {
    pub fn path(&self) -> &Path {
        &self.root
    }
}

fn cap(text: &str) -> String {
    if text.chars().count() <= OUTPUT_CAP_CHARS {
        text.to_string()
    } else {
        text.chars().take(OUTPUT_CAP_CHARS).collect()
    }
}

fn copy_dir_filtered(src: &Path, dst: &Path) -> Result<()> {
    for entry in WalkDir::new(src).min_depth(1).into_iter().filter_entry(|e| {
        let name = e.file_name().to_string_lossy();
        !COPY_EXCLUDES.contains(&name.as_ref())
    }) {
        let entry = entry?;
        let rel = entry.path().strip_prefix(src)?;
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            // Database files hold live state and are never part of a patch.
            if entry.path().extension().and_then(|e| e.to_str()) == Some("db") {
                continue;
            }
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

async fn run_command(
    program: &str,
    args: &[String],
    cwd: &Path,
    timeout_secs: u64,
) -> (bool, String, String) {
    let result = tokio::time::timeout(
        Duration::from_secs(timeout_secs),
        Command::new(program)
            .args(args)
            .current_dir(cwd)
            .kill_on_drop(true)
            .output(),
    )
    .await;

    match result {
        Ok(Ok(output)) => (
            output.status.success(),
            cap(&String::from_utf8_lossy(&output.stdout)),
            cap(&String::from_utf8_lossy(&output.stderr)),
        ),
        Ok(Err(e)) => (false, String::new(), format!("spawn failed: {e}")),
        Err(_) => (
            false,
            String::new(),
            format!("command timed out after {timeout_secs}s"),
        ),
    }
}

pub struct DryRunApplier {
    repo_root: PathBuf,
    allow_live: bool,
    lint_primary: Vec<String>,
    lint_fallback: Vec<String>,
    test_runner: Vec<String>,
}

impl DryRunApplier {
    pub fn new(repo_root: impl Into<PathBuf>, allow_live: bool) -> Self {
        Self {
            repo_root: repo_root.into(),
            allow_live,
            lint_primary: vec!["cargo".into(), "clippy".into(), "-q".into(), "--no-deps".into()],
            lint_fallback: vec!["cargo".into(), "check".into(), "-q".into()],
            test_runner: vec!["cargo".into(), "test".into(), "-q".into(), "--test".into()],
        }
    }

    pub fn with_commands(
        mut self,
        lint_primary: Vec<String>,
        lint_fallback: Vec<String>,
        test_runner: Vec<String>,
    ) -> Self {
        self.lint_primary = lint_primary;
        self.lint_fallback = lint_fallback;
        self.test_runner = test_runner;
        self
    }

    /// Copy the repo into a fresh temp worktree, excluding VCS metadata,
    /// build caches, logs, run artifacts and database files.
    pub fn create_worktree(&self) -> Result<Worktree> {
        let dir = TempDir::with_prefix("sme_apply_").context("failed to create temp dir")?;
        let root = dir.path().join("repo");
        std::fs::create_dir_all(&root)?;
        copy_dir_filtered(&self.repo_root, &root)
            .context("failed to copy repo into worktree")?;
        debug!(worktree = %root.display(), "worktree created");
        Ok(Worktree { _dir: dir, root })
    }

    /// `git apply --check`, one re-anchor repair pass on failure, then the
    /// real apply. Returns (apply_ok, repair_attempted, repair_ok, out, err).
    async fn apply_patch(
        &self,
        diff: &str,
        worktree: &Path,
    ) -> (bool, bool, bool, String, String) {
        let patch_file = worktree.join(".sme_patch.diff");
        let mut diff_text = diff.to_string();
        if let Err(e) = std::fs::write(&patch_file, &diff_text) {
            return (false, false, false, String::new(), format!("patch write failed: {e}"));
        }

        let check_args = vec![
            "apply".to_string(),
            "--check".to_string(),
            patch_file.display().to_string(),
        ];
        let (mut check_ok, mut out, mut err) =
            run_command("git", &check_args, worktree, APPLY_TIMEOUT_SECS).await;

        let mut repair_attempted = false;
        let mut repair_successful = false;

        if !check_ok {
            // Repair pass: recompute the hunk header from the file as it
            // exists in this worktree.
            if let Some(path) = first_modified_path(&diff_text) {
                if let Ok(file_text) = std::fs::read_to_string(worktree.join(&path)) {
                    repair_attempted = true;
                    let lines: Vec<String> =
                        diff_text.split('\n').map(|l| l.to_string()).collect();
                    let repaired = reanchor_hunk(&lines, &file_text).join("\n");
                    if repaired != diff_text {
                        diff_text = repaired;
                        if std::fs::write(&patch_file, &diff_text).is_ok() {
                            let (ok, o, e) =
                                run_command("git", &check_args, worktree, APPLY_TIMEOUT_SECS)
                                    .await;
                            check_ok = ok;
                            out = o;
                            err = e;
                            repair_successful = ok;
                        }
                    }
                }
            }
        }

        if !check_ok {
            let _ = std::fs::remove_file(&patch_file);
            return (false, repair_attempted, repair_successful, out, err);
        }

        let apply_args = vec!["apply".to_string(), patch_file.display().to_string()];
        let (apply_ok, apply_out, apply_err) =
            run_command("git", &apply_args, worktree, APPLY_TIMEOUT_SECS).await;
        let _ = std::fs::remove_file(&patch_file);
        (apply_ok, repair_attempted, repair_successful, apply_out, apply_err)
    }

    async fn run_lint(&self, worktree: &Path) -> (bool, String, String) {
        let (program, args) = match self.lint_primary.split_first() {
            Some((p, a)) => (p.clone(), a.to_vec()),
            None => return (true, "no linter configured".to_string(), String::new()),
        };
        let (ok, out, err) = run_command(&program, &args, worktree, LINT_TIMEOUT_SECS).await;
        if ok {
            return (true, out, err);
        }
        // Missing tool falls back to the secondary linter.
        if err.contains("spawn failed") || err.contains("not found") {
            if let Some((p, a)) = self.lint_fallback.split_first() {
                return run_command(p, &a.to_vec(), worktree, LINT_TIMEOUT_SECS).await;
            }
        }
        (ok, out, err)
    }

    fn discover_test_files(&self, worktree: &Path) -> Vec<String> {
        let tests_dir = worktree.join("tests");
        let mut stems: Vec<String> = WalkDir::new(tests_dir)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| {
                let path = e.path();
                if path.extension().and_then(|x| x.to_str()) == Some("rs") {
                    path.file_stem().and_then(|s| s.to_str()).map(String::from)
                } else {
                    None
                }
            })
            .collect();
        stems.sort();
        stems.truncate(MAX_TEST_FILES);
        stems
    }

    async fn run_tests(&self, worktree: &Path) -> (bool, String, String) {
        let test_files = self.discover_test_files(worktree);
        if test_files.is_empty() {
            return (true, "no test files found - skipping".to_string(), String::new());
        }
        let Some((program, base_args)) = self.test_runner.split_first() else {
            return (true, "no test runner configured".to_string(), String::new());
        };

        let mut all_out = String::new();
        let mut all_err = String::new();
        for stem in test_files {
            let mut args = base_args.to_vec();
            args.push(stem.clone());
            let (ok, out, err) = run_command(program, &args, worktree, TEST_TIMEOUT_SECS).await;
            all_out.push_str(&out);
            all_err.push_str(&err);
            if !ok {
                return (false, cap(&all_out), cap(&all_err));
            }
        }
        (true, cap(&all_out), cap(&all_err))
    }

    /// Apply (with repair) into an existing worktree without lint/tests.
    /// Used by shadow evaluation, which owns the worktree lifecycle.
    pub async fn try_apply_only(&self, patch: &mut MetaPatch, worktree: &Path) -> Result<bool> {
        let (apply_ok, _, _, _, err) = self.apply_patch(&patch.diff, worktree).await;
        patch.apply_ok = Some(apply_ok);
        if !apply_ok {
            debug!(patch_id = %patch.id, "shadow apply failed: {err}");
        }
        Ok(apply_ok)
    }

    /// Full dry-run validation of one patch. The worktree is gone by the
    /// time this returns, success or not.
    pub async fn try_patch(&self, patch: &mut MetaPatch, dry_run: bool) -> Result<ApplyResult> {
        if !dry_run && !self.allow_live {
            anyhow::bail!("live application disabled; enable commits to allow it");
        }

        let start = Instant::now();
        let mut result = ApplyResult::new(&patch.id);
        result.files_modified = modified_paths(&patch.diff);

        info!(patch_id = %patch.id, area = %patch.area, "dry-run applying patch");

        let worktree = self.create_worktree()?;

        let (apply_ok, repair_attempted, repair_successful, apply_out, apply_err) =
            self.apply_patch(&patch.diff, worktree.path()).await;
        result.apply_ok = apply_ok;
        result.repair_attempted = repair_attempted;
        result.repair_successful = repair_successful;

        if !apply_ok {
            result.stdout = apply_out;
            result.stderr = apply_err;
            result.execution_time_ms = start.elapsed().as_millis() as u64;
            patch.apply_ok = Some(false);
            warn!(patch_id = %patch.id, "patch failed to apply: {}", result.stderr);
            return Ok(result);
        }

        let (lint_ok, lint_out, lint_err) = self.run_lint(worktree.path()).await;
        result.lint_ok = lint_ok;

        let (tests_ok, test_out, test_err) = self.run_tests(worktree.path()).await;
        result.tests_ok = tests_ok;

        result.stdout = cap(&format!(
            "APPLY: {apply_out}\nLINT: {lint_out}\nTESTS: {test_out}"
        ));
        result.stderr = cap(&format!(
            "APPLY: {apply_err}\nLINT: {lint_err}\nTESTS: {test_err}"
        ));
        result.success = apply_ok && lint_ok && tests_ok;
        result.execution_time_ms = start.elapsed().as_millis() as u64;

        patch.apply_ok = Some(apply_ok);
        patch.lint_ok = Some(lint_ok);
        patch.tests_ok = Some(tests_ok);
        patch.stdout_snippet = result.stdout_snippet();

        info!(
            patch_id = %patch.id,
            apply_ok, lint_ok, tests_ok,
            "patch validation finished"
        );
        Ok(result)
    }
}
