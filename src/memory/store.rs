//! Experience store (sqlite)
//!
//! Insertion is guarded against pollution: reward and confidence floors,
//! duplicate input hashes, and a per-task-class size cap enforced by LRU on
//! `coalesce(last_used_at, created_at)`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::task;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::MemoryConfig;
use crate::embed::cosine_similarity;

/// Canonical task classes plus the alias map feeding them.
pub fn normalize_task_class(task_class: &str) -> String {
    let normalized = task_class.trim().to_lowercase();
    match normalized.as_str() {
        "code" | "analysis" | "writing" | "business" | "research" | "general" => normalized,
        "coding" | "programming" => "code".to_string(),
        "analyze" | "review" => "analysis".to_string(),
        "creative" | "write" => "writing".to_string(),
        "strategy" => "business".to_string(),
        "lookup" => "research".to_string(),
        _ => "general".to_string(),
    }
}

/// One stored learning experience.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experience {
    pub id: String,
    pub task_class: String,
    pub task_class_norm: String,
    pub input_hash: String,
    pub input_text: String,
    pub plan: serde_json::Value,
    pub operator_used: String,
    pub output_text: String,
    pub reward: f64,
    pub improvement_delta: f64,
    pub confidence_score: f64,
    pub judge_ai: f64,
    pub judge_semantic: f64,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub latency_ms: i64,
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl Experience {
    /// Construct with computed id, hash, normalization and delta.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task_class: &str,
        input_text: &str,
        plan: serde_json::Value,
        operator_used: &str,
        output_text: &str,
        reward: f64,
        confidence_score: f64,
        judge_ai: f64,
        judge_semantic: f64,
        tokens_in: i64,
        tokens_out: i64,
        latency_ms: i64,
        embedding: Vec<f32>,
        baseline_reward: f64,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(input_text.as_bytes());
        let digest = hasher.finalize();
        let input_hash: String = digest.iter().map(|b| format!("{b:02x}")).collect::<String>()
            [..16]
            .to_string();

        Self {
            id: Uuid::new_v4().to_string(),
            task_class: task_class.to_string(),
            task_class_norm: normalize_task_class(task_class),
            input_hash,
            input_text: input_text.to_string(),
            plan,
            operator_used: operator_used.to_string(),
            output_text: output_text.to_string(),
            reward,
            improvement_delta: reward - baseline_reward,
            confidence_score,
            judge_ai,
            judge_semantic,
            tokens_in,
            tokens_out,
            latency_ms,
            embedding,
            created_at: Utc::now(),
            last_used_at: None,
        }
    }
}

#[derive(Clone)]
pub struct MemoryStore {
    db_path: PathBuf,
    config: Arc<MemoryConfig>,
}

impl MemoryStore {
    pub async fn open(db_path: impl AsRef<Path>, config: MemoryConfig) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        let path_clone = path.clone();

        task::spawn_blocking(move || {
            if let Some(parent) = path_clone.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let conn = Connection::open(&path_clone)?;
            let _ = conn.pragma_update(None, "journal_mode", "WAL");

            conn.execute(
                r#"
                CREATE TABLE IF NOT EXISTS experiences (
                    id TEXT PRIMARY KEY,
                    task_class TEXT NOT NULL,
                    task_class_norm TEXT NOT NULL,
                    input_hash TEXT NOT NULL,
                    input_text TEXT NOT NULL,
                    plan_json TEXT NOT NULL,
                    operator_used TEXT NOT NULL,
                    output_text TEXT NOT NULL,
                    reward REAL NOT NULL,
                    improvement_delta REAL NOT NULL,
                    confidence_score REAL NOT NULL,
                    judge_ai REAL NOT NULL,
                    judge_semantic REAL NOT NULL,
                    tokens_in INTEGER DEFAULT 0,
                    tokens_out INTEGER DEFAULT 0,
                    latency_ms INTEGER DEFAULT 0,
                    embedding_json TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    last_used_at TEXT
                )
                "#,
                [],
            )?;

            for sql in [
                "CREATE INDEX IF NOT EXISTS idx_exp_task_class ON experiences(task_class)",
                "CREATE INDEX IF NOT EXISTS idx_exp_task_class_norm ON experiences(task_class_norm)",
                "CREATE INDEX IF NOT EXISTS idx_exp_reward ON experiences(reward DESC)",
                "CREATE INDEX IF NOT EXISTS idx_exp_input_hash ON experiences(input_hash)",
                // Second index keyed the way eviction scans, so LRU deletes
                // are bounded rather than full scans.
                "CREATE INDEX IF NOT EXISTS idx_exp_lru ON experiences(task_class_norm, COALESCE(last_used_at, created_at))",
            ] {
                conn.execute(sql, [])?;
            }

            Ok::<_, anyhow::Error>(())
        })
        .await??;

        Ok(Self {
            db_path: path,
            config: Arc::new(config),
        })
    }

    fn conn(&self) -> rusqlite::Result<Connection> {
        Connection::open(&self.db_path)
    }

    /// Insert with pollution guards. Returns whether the experience was
    /// accepted; failures degrade to `false` rather than erroring the run.
    pub async fn add(&self, experience: Experience) -> bool {
        let store = self.clone();
        let result = task::spawn_blocking(move || store.add_blocking(experience)).await;
        match result {
            Ok(Ok(accepted)) => accepted,
            Ok(Err(e)) => {
                error!("failed to add experience: {e}");
                false
            }
            Err(e) => {
                error!("experience insert task failed: {e}");
                false
            }
        }
    }

    fn add_blocking(&self, experience: Experience) -> Result<bool> {
        if self.config.pollution_guard {
            if experience.reward < self.config.reward_floor
                || experience.confidence_score < self.config.min_confidence
            {
                debug!(
                    reward = experience.reward,
                    confidence = experience.confidence_score,
                    "skipping low-quality experience"
                );
                return Ok(false);
            }
            if self.is_duplicate_blocking(&experience.input_hash)? {
                debug!(hash = %experience.input_hash, "skipping duplicate experience");
                return Ok(false);
            }
        }

        self.enforce_size_limit_blocking(&experience.task_class_norm)?;

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO experiences (
                id, task_class, task_class_norm, input_hash, input_text, plan_json,
                operator_used, output_text, reward, improvement_delta, confidence_score,
                judge_ai, judge_semantic, tokens_in, tokens_out, latency_ms,
                embedding_json, created_at, last_used_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
            params![
                experience.id,
                experience.task_class,
                experience.task_class_norm,
                experience.input_hash,
                experience.input_text,
                experience.plan.to_string(),
                experience.operator_used,
                experience.output_text,
                experience.reward,
                experience.improvement_delta,
                experience.confidence_score,
                experience.judge_ai,
                experience.judge_semantic,
                experience.tokens_in,
                experience.tokens_out,
                experience.latency_ms,
                serde_json::to_string(&experience.embedding)?,
                experience.created_at.to_rfc3339(),
                experience.last_used_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        info!(
            id = %&experience.id[..8],
            task_class = %experience.task_class,
            reward = experience.reward,
            "experience stored"
        );
        Ok(true)
    }

    fn is_duplicate_blocking(&self, input_hash: &str) -> Result<bool> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT 1 FROM experiences WHERE input_hash = ?1 LIMIT 1")?;
        Ok(stmt.exists(params![input_hash])?)
    }

    fn enforce_size_limit_blocking(&self, task_class_norm: &str) -> Result<()> {
        let cap = self.config.per_class_cap();
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM experiences WHERE task_class_norm = ?1",
            params![task_class_norm],
            |row| row.get(0),
        )?;
        if count as usize >= cap {
            let to_remove = count as usize - cap + 1;
            conn.execute(
                "DELETE FROM experiences
                 WHERE task_class_norm = ?1
                   AND id IN (
                       SELECT id FROM experiences
                       WHERE task_class_norm = ?1
                       ORDER BY COALESCE(last_used_at, created_at) ASC
                       LIMIT ?2
                   )",
                params![task_class_norm, to_remove as i64],
            )?;
            info!(task_class_norm, evicted = to_remove, "evicted LRU experiences");
        }
        Ok(())
    }

    /// Multi-factor search: candidates by class (fuzzy when enabled), score
    /// `(α·cos + (1−α)·reward_norm)·exp(−Δdays/decay)`, floor on reward,
    /// top-K returned and touched.
    pub async fn search(
        &self,
        query_embedding: &[f32],
        task_class: &str,
        k: usize,
        reward_floor: f64,
    ) -> Vec<Experience> {
        let store = self.clone();
        let query = query_embedding.to_vec();
        let task_class = task_class.to_string();
        let result = task::spawn_blocking(move || {
            store.search_blocking(&query, &task_class, k, reward_floor)
        })
        .await;
        match result {
            Ok(Ok(hits)) => hits,
            Ok(Err(e)) => {
                error!("memory search failed: {e}");
                Vec::new()
            }
            Err(e) => {
                error!("memory search task failed: {e}");
                Vec::new()
            }
        }
    }

    fn search_blocking(
        &self,
        query_embedding: &[f32],
        task_class: &str,
        k: usize,
        reward_floor: f64,
    ) -> Result<Vec<Experience>> {
        let candidates = self.candidates_blocking(task_class)?;
        if candidates.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let alpha = 1.0 - self.config.reward_weight;
        let mut scored: Vec<(f64, Experience)> = Vec::new();

        for exp in candidates {
            if exp.reward < reward_floor {
                continue;
            }
            let similarity = cosine_similarity(query_embedding, &exp.embedding) as f64;
            let reward_norm = exp.reward.clamp(0.0, 1.0);
            let age_factor = if self.config.time_decay {
                let days_old = (now - exp.created_at).num_days().max(0) as f64;
                (-days_old / self.config.decay_days).exp()
            } else {
                1.0
            };
            let score =
                (similarity * alpha + reward_norm * self.config.reward_weight) * age_factor;
            scored.push((score, exp));
        }

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        let results: Vec<Experience> = scored.into_iter().take(k).map(|(_, e)| e).collect();

        if !results.is_empty() {
            let ids: Vec<String> = results.iter().map(|e| e.id.clone()).collect();
            self.touch_blocking(&ids)?;
        }
        debug!(hits = results.len(), task_class, "memory search");
        Ok(results)
    }

    fn candidates_blocking(&self, task_class: &str) -> Result<Vec<Experience>> {
        let conn = self.conn()?;
        let mut out = Vec::new();
        if self.config.task_class_fuzzy {
            let norm = normalize_task_class(task_class);
            let mut stmt = conn.prepare(
                "SELECT * FROM experiences WHERE task_class = ?1 OR task_class_norm = ?2
                 ORDER BY reward DESC, created_at DESC LIMIT 100",
            )?;
            let rows = stmt.query_map(params![task_class, norm], row_to_experience)?;
            for row in rows {
                if let Ok(Some(exp)) = row {
                    out.push(exp);
                }
            }
        } else {
            let mut stmt = conn.prepare(
                "SELECT * FROM experiences WHERE task_class = ?1
                 ORDER BY reward DESC, created_at DESC LIMIT 100",
            )?;
            let rows = stmt.query_map(params![task_class], row_to_experience)?;
            for row in rows {
                if let Ok(Some(exp)) = row {
                    out.push(exp);
                }
            }
        }
        Ok(out)
    }

    fn touch_blocking(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let conn = self.conn()?;
        let placeholders: Vec<String> = (2..ids.len() + 2).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "UPDATE experiences SET last_used_at = ?1 WHERE id IN ({})",
            placeholders.join(",")
        );
        let mut stmt = conn.prepare(&sql)?;
        let now = Utc::now().to_rfc3339();
        let mut bind: Vec<&dyn rusqlite::ToSql> = vec![&now];
        for id in ids {
            bind.push(id);
        }
        stmt.execute(bind.as_slice())?;
        Ok(())
    }

    pub async fn count(&self) -> usize {
        let store = self.clone();
        let result = task::spawn_blocking(move || {
            let conn = store.conn()?;
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM experiences", [], |row| row.get(0))?;
            Ok::<_, anyhow::Error>(count as usize)
        })
        .await;
        match result {
            Ok(Ok(n)) => n,
            _ => 0,
        }
    }

    pub async fn count_for_class(&self, task_class_norm: &str) -> usize {
        let store = self.clone();
        let norm = task_class_norm.to_string();
        let result = task::spawn_blocking(move || {
            let conn = store.conn()?;
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM experiences WHERE task_class_norm = ?1",
                params![norm],
                |row| row.get(0),
            )?;
            Ok::<_, anyhow::Error>(count as usize)
        })
        .await;
        match result {
            Ok(Ok(n)) => n,
            _ => 0,
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }
}

fn row_to_experience(row: &rusqlite::Row<'_>) -> rusqlite::Result<Option<Experience>> {
    let plan_json: String = row.get("plan_json")?;
    let embedding_json: String = row.get("embedding_json")?;
    let created_at: String = row.get("created_at")?;
    let last_used_at: Option<String> = row.get("last_used_at")?;

    let Ok(plan) = serde_json::from_str(&plan_json) else {
        return Ok(None);
    };
    let Ok(embedding) = serde_json::from_str::<Vec<f32>>(&embedding_json) else {
        return Ok(None);
    };
    let Ok(created_at) = DateTime::parse_from_rfc3339(&created_at) else {
        return Ok(None);
    };

    Ok(Some(Experience {
        id: row.get("id")?,
        task_class: row.get("task_class")?,
        task_class_norm: row.get("task_class_norm")?,
        input_hash: row.get("input_hash")?,
        input_text: row.get("input_text")?,
        plan,
        operator_used: row.get("operator_used")?,
        output_text: row.get("output_text")?,
        reward: row.get("reward")?,
        improvement_delta: row.get("improvement_delta")?,
        confidence_score: row.get("confidence_score")?,
        judge_ai: row.get("judge_ai")?,
        judge_semantic: row.get("judge_semantic")?,
        tokens_in: row.get("tokens_in")?,
        tokens_out: row.get("tokens_out")?,
        latency_ms: row.get("latency_ms")?,
        embedding,
        created_at: created_at.with_timezone(&Utc),
        last_used_at: last_used_at
            .and_then(|t| DateTime::parse_from_rfc3339(&t).ok())
            .map(|t| t.with_timezone(&Utc)),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> MemoryConfig {
        MemoryConfig {
            k: 3,
            reward_floor: 0.6,
            min_confidence: 0.5,
            baseline_reward: 0.5,
            store_max_size: 50,
            task_class_fuzzy: true,
            reward_weight: 0.3,
            time_decay: true,
            decay_days: 30.0,
            pollution_guard: true,
            primer_tokens_max: 200,
            injection_mode: "system_prepend".to_string(),
            embedder: "hash".to_string(),
        }
    }

    fn experience(task_class: &str, input: &str, reward: f64, confidence: f64) -> Experience {
        Experience::new(
            task_class,
            input,
            serde_json::json!({"system": "sys"}),
            "change_system",
            "output text",
            reward,
            confidence,
            0.7,
            0.5,
            100,
            200,
            1500,
            vec![1.0, 0.0, 0.0],
            0.5,
        )
    }

    async fn store() -> (tempfile::TempDir, MemoryStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::open(dir.path().join("memory.db"), test_config())
            .await
            .unwrap();
        (dir, store)
    }

    #[test]
    fn normalization_is_idempotent_and_closed() {
        for input in ["coding", "Code", "creative", "strategy", "lookup", "weird"] {
            let once = normalize_task_class(input);
            assert_eq!(normalize_task_class(&once), once);
            assert!(
                ["code", "analysis", "writing", "business", "research", "general"]
                    .contains(&once.as_str())
            );
        }
        assert_eq!(normalize_task_class("coding"), "code");
        assert_eq!(normalize_task_class("strategy"), "business");
        assert_eq!(normalize_task_class("whatever"), "general");
    }

    #[tokio::test]
    async fn pollution_guard_rejects_low_reward_and_confidence() {
        let (_dir, store) = store().await;
        assert!(!store.add(experience("code", "low reward", 0.3, 0.9)).await);
        assert!(!store.add(experience("code", "low conf", 0.9, 0.1)).await);
        assert!(store.add(experience("code", "good", 0.9, 0.9)).await);
        assert_eq!(store.count().await, 1);
    }

    #[tokio::test]
    async fn duplicates_by_input_hash_are_rejected() {
        let (_dir, store) = store().await;
        assert!(store.add(experience("code", "same input", 0.9, 0.9)).await);
        assert!(!store.add(experience("code", "same input", 0.95, 0.9)).await);
        assert_eq!(store.count().await, 1);
    }

    #[tokio::test]
    async fn per_class_cap_evicts_lru() {
        let (_dir, store) = store().await;
        // cap = 50 / 10 = 5
        for i in 0..5 {
            assert!(store.add(experience("code", &format!("input {i}"), 0.9, 0.9)).await);
        }
        assert_eq!(store.count_for_class("code").await, 5);
        assert!(store.add(experience("code", "overflow", 0.9, 0.9)).await);
        assert_eq!(store.count_for_class("code").await, 5);
    }

    #[tokio::test]
    async fn search_filters_floor_and_touches() {
        let (_dir, store) = store().await;
        store.add(experience("code", "alpha", 0.9, 0.9)).await;
        store.add(experience("code", "beta", 0.65, 0.9)).await;

        let hits = store.search(&[1.0, 0.0, 0.0], "code", 5, 0.8).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].input_text, "alpha");

        // Touched rows carry last_used_at on the next read.
        let hits = store.search(&[1.0, 0.0, 0.0], "code", 5, 0.6).await;
        assert!(hits.iter().any(|e| e.last_used_at.is_some()));
    }

    #[tokio::test]
    async fn fuzzy_matching_reaches_aliases() {
        let (_dir, store) = store().await;
        store.add(experience("coding", "aliased input", 0.9, 0.9)).await;
        let hits = store.search(&[1.0, 0.0, 0.0], "code", 5, 0.6).await;
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn stored_experiences_respect_floors_invariant() {
        let (_dir, store) = store().await;
        store.add(experience("code", "a", 0.9, 0.9)).await;
        store.add(experience("code", "b", 0.1, 0.9)).await;
        let hits = store.search(&[1.0, 0.0, 0.0], "code", 10, 0.0).await;
        for exp in hits {
            assert!(exp.reward >= store.config().reward_floor);
            assert!(exp.confidence_score >= store.config().min_confidence);
        }
    }
}
