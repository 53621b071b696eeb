//! Patch artifact storage
//!
//! Each committed (or attempted) patch lands under a timestamped directory
//! as a `.diff` plus a `.json` metadata record, with a central `index.json`
//! carrying status counters. Index writes are serialized under a file lock
//! since commits and rollbacks can race.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use super::shadow::ShadowEvalResult;
use super::types::MetaPatch;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitArtifact {
    pub patch_id: String,
    pub commit_sha: String,
    pub timestamp: f64,
    pub area: String,
    pub origin: String,
    pub notes: String,
    pub diff: String,
    pub loc_delta: usize,
    pub reward_delta: Option<f64>,
    pub error_rate_delta: Option<f64>,
    pub latency_p95_delta: Option<f64>,
    pub commit_message: String,
    pub test_results: Option<Value>,
    pub rollback_sha: Option<String>,
    pub status: String,
}

pub struct PatchStorage {
    storage_path: PathBuf,
}

impl PatchStorage {
    pub fn new(storage_path: impl Into<PathBuf>) -> Result<Self> {
        let storage_path = storage_path.into();
        std::fs::create_dir_all(&storage_path).context("failed to create patch storage")?;
        Ok(Self { storage_path })
    }

    pub fn root(&self) -> &Path {
        &self.storage_path
    }

    fn timestamp_dir(&self) -> PathBuf {
        let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        self.storage_path.join(stamp)
    }

    /// Persist diff + metadata under a fresh timestamped directory and fold
    /// the entry into the central index.
    pub fn save_artifact(
        &self,
        patch: &MetaPatch,
        shadow_result: Option<&ShadowEvalResult>,
        commit_sha: &str,
        test_results: Option<Value>,
    ) -> Result<PathBuf> {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        let artifact = CommitArtifact {
            patch_id: patch.id.clone(),
            commit_sha: commit_sha.to_string(),
            timestamp: now,
            area: patch.area.clone(),
            origin: patch.origin.clone(),
            notes: patch.notes.clone(),
            diff: patch.diff.clone(),
            loc_delta: patch.loc_delta,
            reward_delta: shadow_result.and_then(|s| s.reward_delta),
            error_rate_delta: shadow_result.and_then(|s| s.error_rate_delta),
            latency_p95_delta: shadow_result.and_then(|s| s.latency_p95_delta),
            commit_message: format!(
                "[self-mod] {} {} - {}",
                &patch.id[..8.min(patch.id.len())],
                patch.area,
                patch.notes
            ),
            test_results,
            rollback_sha: None,
            status: if commit_sha.is_empty() {
                "pending".to_string()
            } else {
                "committed".to_string()
            },
        };

        let dir = self.timestamp_dir();
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(format!("{}.diff", patch.id)), &patch.diff)?;
        std::fs::write(
            dir.join(format!("{}.json", patch.id)),
            serde_json::to_string_pretty(&artifact)?,
        )?;

        self.update_index(&artifact)?;
        info!(patch_id = %patch.id, dir = %dir.display(), "patch artifact saved");
        Ok(dir)
    }

    fn with_index_lock<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock_path = self.storage_path.join("index.lock");
        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .context("failed to open index lock")?;
        lock_file
            .lock_exclusive()
            .context("failed to lock patch index")?;
        let result = f();
        let _ = fs2::FileExt::unlock(&lock_file);
        result
    }

    fn update_index(&self, artifact: &CommitArtifact) -> Result<()> {
        let index_path = self.storage_path.join("index.json");
        self.with_index_lock(|| {
            let mut index: Value = match std::fs::read_to_string(&index_path) {
                Ok(raw) => serde_json::from_str(&raw)
                    .unwrap_or_else(|_| json!({"patches": [], "stats": {}})),
                Err(_) => json!({"patches": [], "stats": {}}),
            };

            let entry = json!({
                "patch_id": artifact.patch_id,
                "timestamp": artifact.timestamp,
                "area": artifact.area,
                "commit_sha": artifact.commit_sha,
                "reward_delta": artifact.reward_delta,
                "status": artifact.status,
            });

            let patches = index["patches"].as_array().cloned().unwrap_or_default();
            let mut patches: Vec<Value> = patches
                .into_iter()
                .filter(|p| p["patch_id"] != artifact.patch_id.as_str())
                .collect();
            patches.push(entry);

            let committed = patches.iter().filter(|p| p["status"] == "committed").count();
            let rolled_back = patches
                .iter()
                .filter(|p| p["status"] == "rolled_back")
                .count();
            index["stats"] = json!({
                "total_patches": patches.len(),
                "committed_patches": committed,
                "rolled_back_patches": rolled_back,
                "last_updated": artifact.timestamp,
            });
            index["patches"] = Value::Array(patches);

            std::fs::write(&index_path, serde_json::to_string_pretty(&index)?)?;
            Ok(())
        })
    }

    pub fn get_artifact(&self, patch_id: &str) -> Option<CommitArtifact> {
        let entries = std::fs::read_dir(&self.storage_path).ok()?;
        for entry in entries.filter_map(|e| e.ok()) {
            if !entry.path().is_dir() {
                continue;
            }
            let meta_path = entry.path().join(format!("{patch_id}.json"));
            if meta_path.exists() {
                let raw = std::fs::read_to_string(&meta_path).ok()?;
                return serde_json::from_str(&raw).ok();
            }
        }
        None
    }

    pub fn list_artifacts(&self, status_filter: Option<&str>) -> Vec<CommitArtifact> {
        let Ok(entries) = std::fs::read_dir(&self.storage_path) else {
            return Vec::new();
        };
        let mut artifacts = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            if !entry.path().is_dir() {
                continue;
            }
            let Ok(files) = std::fs::read_dir(entry.path()) else {
                continue;
            };
            for file in files.filter_map(|f| f.ok()) {
                if file.path().extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let Ok(raw) = std::fs::read_to_string(file.path()) else {
                    continue;
                };
                match serde_json::from_str::<CommitArtifact>(&raw) {
                    Ok(artifact) => {
                        if status_filter.map(|s| artifact.status == s).unwrap_or(true) {
                            artifacts.push(artifact);
                        }
                    }
                    Err(e) => warn!(path = %file.path().display(), "unreadable artifact: {e}"),
                }
            }
        }
        artifacts.sort_by(|a, b| {
            b.timestamp
                .partial_cmp(&a.timestamp)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        artifacts
    }

    /// Update an artifact's status (and optionally its rollback SHA) both in
    /// its metadata file and in the index.
    pub fn update_status(
        &self,
        patch_id: &str,
        status: &str,
        rollback_sha: Option<&str>,
    ) -> Result<()> {
        let Some(mut artifact) = self.get_artifact(patch_id) else {
            anyhow::bail!("artifact not found: {patch_id}");
        };
        artifact.status = status.to_string();
        if let Some(sha) = rollback_sha {
            artifact.rollback_sha = Some(sha.to_string());
        }

        // Rewrite the metadata file in place.
        let Ok(entries) = std::fs::read_dir(&self.storage_path) else {
            anyhow::bail!("storage unreadable");
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let meta_path = entry.path().join(format!("{patch_id}.json"));
            if meta_path.exists() {
                std::fs::write(&meta_path, serde_json::to_string_pretty(&artifact)?)?;
                break;
            }
        }

        self.update_index(&artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patch() -> MetaPatch {
        MetaPatch::create(
            "bandit",
            "model-x",
            "tweak constant",
            "--- a/src/meta/bandit.rs\n+++ b/src/meta/bandit.rs\n@@ -1,1 +1,2 @@\n ctx\n+new\n",
            1,
        )
    }

    #[test]
    fn artifact_round_trips_through_storage() {
        let dir = tempfile::tempdir().unwrap();
        let storage = PatchStorage::new(dir.path()).unwrap();
        let p = patch();
        let artifact_dir = storage.save_artifact(&p, None, "abc123", None).unwrap();

        assert!(artifact_dir.join(format!("{}.diff", p.id)).exists());
        let loaded = storage.get_artifact(&p.id).unwrap();
        assert_eq!(loaded.commit_sha, "abc123");
        assert_eq!(loaded.status, "committed");
        assert_eq!(loaded.diff, p.diff);
    }

    #[test]
    fn index_tracks_status_counters() {
        let dir = tempfile::tempdir().unwrap();
        let storage = PatchStorage::new(dir.path()).unwrap();
        let p1 = patch();
        let p2 = patch();
        storage.save_artifact(&p1, None, "sha1", None).unwrap();
        storage.save_artifact(&p2, None, "", None).unwrap();

        let raw = std::fs::read_to_string(dir.path().join("index.json")).unwrap();
        let index: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(index["stats"]["total_patches"], 2);
        assert_eq!(index["stats"]["committed_patches"], 1);
    }

    #[test]
    fn status_update_reaches_file_and_index() {
        let dir = tempfile::tempdir().unwrap();
        let storage = PatchStorage::new(dir.path()).unwrap();
        let p = patch();
        storage.save_artifact(&p, None, "sha1", None).unwrap();
        storage
            .update_status(&p.id, "rolled_back", Some("revert-sha"))
            .unwrap();

        let loaded = storage.get_artifact(&p.id).unwrap();
        assert_eq!(loaded.status, "rolled_back");
        assert_eq!(loaded.rollback_sha.as_deref(), Some("revert-sha"));

        let raw = std::fs::read_to_string(dir.path().join("index.json")).unwrap();
        let index: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(index["stats"]["rolled_back_patches"], 1);
    }

    #[test]
    fn list_filters_by_status() {
        let dir = tempfile::tempdir().unwrap();
        let storage = PatchStorage::new(dir.path()).unwrap();
        let p1 = patch();
        storage.save_artifact(&p1, None, "sha1", None).unwrap();
        let p2 = patch();
        storage.save_artifact(&p2, None, "", None).unwrap();

        assert_eq!(storage.list_artifacts(None).len(), 2);
        assert_eq!(storage.list_artifacts(Some("committed")).len(), 1);
        assert_eq!(storage.list_artifacts(Some("pending")).len(), 1);
        assert!(storage.list_artifacts(Some("failed")).is_empty());
    }

    #[test]
    fn shadow_metrics_flow_into_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let storage = PatchStorage::new(dir.path()).unwrap();
        let p = patch();
        let shadow = ShadowEvalResult {
            patch_id: p.id.clone(),
            status: "completed".to_string(),
            avg_reward_before: Some(0.5),
            avg_reward_after: Some(0.6),
            error_rate_before: Some(0.0),
            error_rate_after: Some(0.0),
            latency_p95_before: Some(100.0),
            latency_p95_after: Some(120.0),
            reward_delta: Some(0.1),
            error_rate_delta: Some(0.0),
            latency_p95_delta: Some(20.0),
            tests_run: 3,
            baseline_samples: 1,
            execution_time_ms: 10,
            error_message: None,
        };
        storage.save_artifact(&p, Some(&shadow), "sha", None).unwrap();
        let loaded = storage.get_artifact(&p.id).unwrap();
        assert_eq!(loaded.reward_delta, Some(0.1));
        assert_eq!(loaded.latency_p95_delta, Some(20.0));
    }
}
