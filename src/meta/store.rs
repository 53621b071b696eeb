//! Meta store (sqlite)
//!
//! Runs, variants, promoted recipes, operator statistics and human ratings.
//! Connections are short-lived and opened inside `spawn_blocking`; the write
//! path is a handful of single-row statements so contention stays in sqlite.

use std::path::{Path, PathBuf};

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tokio::task;

use super::bandit::{OperatorStats, StatsMap};
use super::operators::SamplingParams;

/// NaN/±∞ are stored as NULL so nothing non-finite ever surfaces.
fn finite(v: f64) -> Option<f64> {
    v.is_finite().then_some(v)
}

fn now_ts() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// A promoted recipe row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRecipe {
    pub id: i64,
    pub task_class: String,
    pub system: String,
    pub nudge: String,
    pub params: SamplingParams,
    pub avg_score: f64,
    pub uses: i64,
    pub approved: bool,
    pub engine: String,
    pub engine_confidence: f64,
}

/// A finished run row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: i64,
    pub task_class: String,
    pub task: String,
    pub started_at: f64,
    pub finished_at: Option<f64>,
    pub best_variant_id: Option<i64>,
    pub best_score: Option<f64>,
    pub best_total_reward: Option<f64>,
    pub operator_sequence: Vec<String>,
}

/// Everything persisted for one variant.
#[derive(Debug, Clone)]
pub struct NewVariant {
    pub run_id: i64,
    pub system: String,
    pub nudge: String,
    pub params: SamplingParams,
    pub prompt: String,
    pub output: String,
    pub score: f64,
    pub operator_name: String,
    pub groups: Vec<String>,
    pub execution_time_ms: u64,
    pub model_id: String,
    pub total_reward: f64,
    pub outcome_reward: f64,
    pub process_reward: f64,
    pub cost_penalty: f64,
    pub reward_metadata: serde_json::Value,
}

#[derive(Clone)]
pub struct MetaStore {
    db_path: PathBuf,
}

impl MetaStore {
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        let path_clone = path.clone();

        task::spawn_blocking(move || {
            if let Some(parent) = path_clone.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let conn = Connection::open(&path_clone)?;
            let _ = conn.pragma_update(None, "journal_mode", "WAL");
            let _ = conn.pragma_update(None, "synchronous", "NORMAL");

            conn.execute(
                r#"
                CREATE TABLE IF NOT EXISTS recipes(
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    task_class TEXT,
                    system TEXT,
                    nudge TEXT,
                    params_json TEXT,
                    created_at REAL,
                    avg_score REAL DEFAULT 0,
                    uses INTEGER DEFAULT 0,
                    approved INTEGER DEFAULT 0,
                    updated_at REAL DEFAULT 0,
                    engine TEXT DEFAULT 'ollama',
                    engine_confidence REAL DEFAULT 0.5
                )
                "#,
                [],
            )?;

            conn.execute(
                r#"
                CREATE TABLE IF NOT EXISTS runs(
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    task_class TEXT,
                    task TEXT,
                    assertions_json TEXT,
                    started_at REAL,
                    finished_at REAL,
                    best_variant_id INTEGER,
                    best_score REAL,
                    best_total_reward REAL,
                    total_reward_improvement REAL,
                    operator_names_json TEXT,
                    config_json TEXT
                )
                "#,
                [],
            )?;

            conn.execute(
                r#"
                CREATE TABLE IF NOT EXISTS variants(
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id INTEGER,
                    system TEXT,
                    nudge TEXT,
                    params_json TEXT,
                    prompt TEXT,
                    output TEXT,
                    score REAL,
                    created_at REAL,
                    operator_name TEXT,
                    groups_json TEXT,
                    execution_time_ms INTEGER DEFAULT 0,
                    model_id TEXT,
                    total_reward REAL,
                    outcome_reward REAL,
                    process_reward REAL,
                    cost_penalty REAL,
                    reward_metadata TEXT,
                    FOREIGN KEY (run_id) REFERENCES runs(id)
                )
                "#,
                [],
            )?;

            conn.execute(
                r#"
                CREATE TABLE IF NOT EXISTS operator_stats(
                    name TEXT PRIMARY KEY,
                    n INTEGER DEFAULT 0,
                    avg_reward REAL DEFAULT 0,
                    mean_payoff REAL DEFAULT 0,
                    total_time_ms INTEGER DEFAULT 0,
                    last_used_at REAL DEFAULT 0
                )
                "#,
                [],
            )?;

            conn.execute(
                r#"
                CREATE TABLE IF NOT EXISTS operator_engine_stats(
                    operator_name TEXT,
                    engine TEXT,
                    n INTEGER DEFAULT 0,
                    avg_reward REAL DEFAULT 0,
                    total_time_ms INTEGER DEFAULT 0,
                    last_used_at REAL DEFAULT 0,
                    PRIMARY KEY (operator_name, engine)
                )
                "#,
                [],
            )?;

            conn.execute(
                r#"
                CREATE TABLE IF NOT EXISTS human_ratings(
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    variant_id INTEGER,
                    human_score INTEGER,
                    feedback TEXT,
                    created_at REAL
                )
                "#,
                [],
            )?;

            for sql in [
                "CREATE INDEX IF NOT EXISTS idx_runs_task_class ON runs(task_class)",
                "CREATE INDEX IF NOT EXISTS idx_variants_run_id ON variants(run_id)",
                "CREATE INDEX IF NOT EXISTS idx_variants_operator ON variants(operator_name)",
                "CREATE INDEX IF NOT EXISTS idx_recipes_task_class ON recipes(task_class)",
                "CREATE INDEX IF NOT EXISTS idx_human_ratings_variant ON human_ratings(variant_id)",
            ] {
                conn.execute(sql, [])?;
            }

            Ok::<_, anyhow::Error>(())
        })
        .await??;

        Ok(Self { db_path: path })
    }

    fn conn(&self) -> rusqlite::Result<Connection> {
        Connection::open(&self.db_path)
    }

    pub async fn save_run_start(
        &self,
        task_class: &str,
        task: &str,
        assertions: &[String],
        config: serde_json::Value,
    ) -> Result<i64> {
        let store = self.clone();
        let task_class = task_class.to_string();
        let task = task.to_string();
        let assertions_json = serde_json::to_string(assertions)?;
        let config_json = config.to_string();

        task::spawn_blocking(move || {
            let conn = store.conn()?;
            conn.execute(
                "INSERT INTO runs (task_class, task, assertions_json, started_at, config_json)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![task_class, task, assertions_json, now_ts(), config_json],
            )?;
            Ok::<_, anyhow::Error>(conn.last_insert_rowid())
        })
        .await?
    }

    pub async fn save_run_finish(
        &self,
        run_id: i64,
        best_variant_id: Option<i64>,
        best_score: Option<f64>,
        operator_sequence: &[String],
        best_total_reward: Option<f64>,
        total_reward_improvement: f64,
    ) -> Result<()> {
        let store = self.clone();
        let ops_json = serde_json::to_string(operator_sequence)?;
        let best_score = best_score.and_then(finite);
        let best_total_reward = best_total_reward.and_then(finite);
        let improvement = finite(total_reward_improvement);

        task::spawn_blocking(move || {
            let conn = store.conn()?;
            conn.execute(
                "UPDATE runs SET finished_at = ?1, best_variant_id = ?2, best_score = ?3,
                        best_total_reward = ?4, total_reward_improvement = ?5,
                        operator_names_json = ?6
                 WHERE id = ?7",
                params![
                    now_ts(),
                    best_variant_id,
                    best_score,
                    best_total_reward,
                    improvement,
                    ops_json,
                    run_id
                ],
            )?;
            Ok::<_, anyhow::Error>(())
        })
        .await?
    }

    pub async fn get_run(&self, run_id: i64) -> Result<Option<RunRecord>> {
        let store = self.clone();
        task::spawn_blocking(move || {
            let conn = store.conn()?;
            let record = conn
                .query_row(
                    "SELECT id, task_class, task, started_at, finished_at, best_variant_id,
                            best_score, best_total_reward, operator_names_json
                     FROM runs WHERE id = ?1",
                    params![run_id],
                    |row| {
                        let ops_json: Option<String> = row.get(8)?;
                        Ok(RunRecord {
                            id: row.get(0)?,
                            task_class: row.get(1)?,
                            task: row.get(2)?,
                            started_at: row.get(3)?,
                            finished_at: row.get(4)?,
                            best_variant_id: row.get(5)?,
                            best_score: row.get(6)?,
                            best_total_reward: row.get(7)?,
                            operator_sequence: ops_json
                                .and_then(|j| serde_json::from_str(&j).ok())
                                .unwrap_or_default(),
                        })
                    },
                )
                .optional()?;
            Ok::<_, anyhow::Error>(record)
        })
        .await?
    }

    pub async fn save_variant(&self, variant: NewVariant) -> Result<i64> {
        let store = self.clone();
        let params_json = serde_json::to_string(&variant.params)?;
        let groups_json = serde_json::to_string(&variant.groups)?;
        let metadata_json = variant.reward_metadata.to_string();

        task::spawn_blocking(move || {
            let conn = store.conn()?;
            conn.execute(
                "INSERT INTO variants (run_id, system, nudge, params_json, prompt, output, score,
                        created_at, operator_name, groups_json, execution_time_ms, model_id,
                        total_reward, outcome_reward, process_reward, cost_penalty, reward_metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                params![
                    variant.run_id,
                    variant.system,
                    variant.nudge,
                    params_json,
                    variant.prompt,
                    variant.output,
                    finite(variant.score),
                    now_ts(),
                    variant.operator_name,
                    groups_json,
                    variant.execution_time_ms as i64,
                    variant.model_id,
                    finite(variant.total_reward),
                    finite(variant.outcome_reward),
                    finite(variant.process_reward),
                    finite(variant.cost_penalty),
                    metadata_json,
                ],
            )?;
            Ok::<_, anyhow::Error>(conn.last_insert_rowid())
        })
        .await?
    }

    pub async fn count_variants(&self, run_id: i64) -> Result<i64> {
        let store = self.clone();
        task::spawn_blocking(move || {
            let conn = store.conn()?;
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM variants WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )?;
            Ok::<_, anyhow::Error>(count)
        })
        .await?
    }

    /// Load the persisted per-operator stats into a bandit stats map.
    pub async fn list_operator_stats(&self) -> Result<StatsMap> {
        let store = self.clone();
        task::spawn_blocking(move || {
            let conn = store.conn()?;
            let mut stmt =
                conn.prepare("SELECT name, n, avg_reward, mean_payoff FROM operator_stats")?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    OperatorStats {
                        pulls: row.get::<_, i64>(1)? as u64,
                        avg_reward: row.get(2)?,
                        mean_payoff: row.get(3)?,
                    },
                ))
            })?;
            let mut map = StatsMap::new();
            for row in rows {
                let (name, stats) = row?;
                map.insert(name, stats);
            }
            Ok::<_, anyhow::Error>(map)
        })
        .await?
    }

    /// Fold one observation into the persistent per-operator stats.
    pub async fn upsert_operator_stat(
        &self,
        name: &str,
        reward: f64,
        execution_time_ms: u64,
    ) -> Result<()> {
        let store = self.clone();
        let name = name.to_string();
        let reward = finite(reward).unwrap_or(0.0);

        task::spawn_blocking(move || {
            let conn = store.conn()?;
            conn.execute(
                "INSERT INTO operator_stats (name, n, avg_reward, mean_payoff, total_time_ms, last_used_at)
                 VALUES (?1, 1, ?2, ?2, ?3, ?4)
                 ON CONFLICT(name) DO UPDATE SET
                    avg_reward = (avg_reward * n + ?2) / (n + 1),
                    mean_payoff = (mean_payoff * n + ?2) / (n + 1),
                    n = n + 1,
                    total_time_ms = total_time_ms + ?3,
                    last_used_at = ?4",
                params![name, reward, execution_time_ms as i64, now_ts()],
            )?;
            Ok::<_, anyhow::Error>(())
        })
        .await?
    }

    pub async fn upsert_operator_engine_stat(
        &self,
        name: &str,
        engine: &str,
        reward: f64,
        execution_time_ms: u64,
    ) -> Result<()> {
        let store = self.clone();
        let name = name.to_string();
        let engine = engine.to_string();
        let reward = finite(reward).unwrap_or(0.0);

        task::spawn_blocking(move || {
            let conn = store.conn()?;
            conn.execute(
                "INSERT INTO operator_engine_stats (operator_name, engine, n, avg_reward, total_time_ms, last_used_at)
                 VALUES (?1, ?2, 1, ?3, ?4, ?5)
                 ON CONFLICT(operator_name, engine) DO UPDATE SET
                    avg_reward = (avg_reward * n + ?3) / (n + 1),
                    n = n + 1,
                    total_time_ms = total_time_ms + ?4,
                    last_used_at = ?5",
                params![name, engine, reward, execution_time_ms as i64, now_ts()],
            )?;
            Ok::<_, anyhow::Error>(())
        })
        .await?
    }

    /// Best approved-or-not recipes for a task class, highest score first.
    pub async fn top_recipes(&self, task_class: &str, limit: usize) -> Result<Vec<StoredRecipe>> {
        let store = self.clone();
        let task_class = task_class.to_string();
        task::spawn_blocking(move || {
            let conn = store.conn()?;
            let mut stmt = conn.prepare(
                "SELECT id, task_class, system, nudge, params_json, avg_score, uses, approved,
                        engine, engine_confidence
                 FROM recipes WHERE task_class = ?1
                 ORDER BY avg_score DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![task_class, limit as i64], |row| {
                let params_json: String = row.get(4)?;
                Ok(StoredRecipe {
                    id: row.get(0)?,
                    task_class: row.get(1)?,
                    system: row.get(2)?,
                    nudge: row.get(3)?,
                    params: serde_json::from_str(&params_json).unwrap_or_default(),
                    avg_score: row.get(5)?,
                    uses: row.get(6)?,
                    approved: row.get::<_, i64>(7)? != 0,
                    engine: row.get(8)?,
                    engine_confidence: row.get(9)?,
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok::<_, anyhow::Error>(out)
        })
        .await?
    }

    pub async fn save_recipe(
        &self,
        task_class: &str,
        system: &str,
        nudge: &str,
        sampling: &SamplingParams,
        avg_score: f64,
        engine: &str,
        engine_confidence: f64,
    ) -> Result<i64> {
        let store = self.clone();
        let task_class = task_class.to_string();
        let system = system.to_string();
        let nudge = nudge.to_string();
        let params_json = serde_json::to_string(sampling)?;
        let engine = engine.to_string();
        let avg_score = finite(avg_score).unwrap_or(0.0);

        task::spawn_blocking(move || {
            let conn = store.conn()?;
            conn.execute(
                "INSERT INTO recipes (task_class, system, nudge, params_json, created_at,
                        avg_score, uses, approved, updated_at, engine, engine_confidence)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 0, ?5, ?7, ?8)",
                params![
                    task_class,
                    system,
                    nudge,
                    params_json,
                    now_ts(),
                    avg_score,
                    engine,
                    engine_confidence
                ],
            )?;
            Ok::<_, anyhow::Error>(conn.last_insert_rowid())
        })
        .await?
    }

    pub async fn approve_recipe(&self, recipe_id: i64, approved: bool) -> Result<()> {
        let store = self.clone();
        task::spawn_blocking(move || {
            let conn = store.conn()?;
            conn.execute(
                "UPDATE recipes SET approved = ?1, updated_at = ?2 WHERE id = ?3",
                params![approved as i64, now_ts(), recipe_id],
            )?;
            Ok::<_, anyhow::Error>(())
        })
        .await?
    }

    pub async fn add_human_rating(
        &self,
        variant_id: i64,
        human_score: i64,
        feedback: Option<&str>,
    ) -> Result<()> {
        let store = self.clone();
        let feedback = feedback.map(|f| f.to_string());
        task::spawn_blocking(move || {
            let conn = store.conn()?;
            conn.execute(
                "INSERT INTO human_ratings (variant_id, human_score, feedback, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![variant_id, human_score, feedback, now_ts()],
            )?;
            Ok::<_, anyhow::Error>(())
        })
        .await?
    }

    pub async fn latest_human_rating(&self, variant_id: i64) -> Result<Option<f64>> {
        let store = self.clone();
        task::spawn_blocking(move || {
            let conn = store.conn()?;
            let score: Option<i64> = conn
                .query_row(
                    "SELECT human_score FROM human_ratings WHERE variant_id = ?1
                     ORDER BY created_at DESC LIMIT 1",
                    params![variant_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok::<_, anyhow::Error>(score.map(|s| s as f64))
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (tempfile::TempDir, MetaStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MetaStore::open(dir.path().join("meta.db")).await.unwrap();
        (dir, store)
    }

    fn variant(run_id: i64) -> NewVariant {
        NewVariant {
            run_id,
            system: "sys".into(),
            nudge: "nudge".into(),
            params: SamplingParams::default(),
            prompt: "p".into(),
            output: "o".into(),
            score: 0.5,
            operator_name: "change_system".into(),
            groups: vec!["SEAL".into()],
            execution_time_ms: 120,
            model_id: "local:test".into(),
            total_reward: 0.6,
            outcome_reward: 0.5,
            process_reward: 0.2,
            cost_penalty: 0.1,
            reward_metadata: serde_json::json!({"method": "semantic_fallback"}),
        }
    }

    #[tokio::test]
    async fn run_lifecycle_round_trips() {
        let (_dir, store) = store().await;
        let run_id = store
            .save_run_start("code", "write tests", &["compiles".into()], serde_json::json!({}))
            .await
            .unwrap();
        let variant_id = store.save_variant(variant(run_id)).await.unwrap();
        store
            .save_run_finish(
                run_id,
                Some(variant_id),
                Some(0.5),
                &["change_system".into()],
                Some(0.6),
                0.6,
            )
            .await
            .unwrap();

        let record = store.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(record.best_variant_id, Some(variant_id));
        assert_eq!(record.operator_sequence, vec!["change_system".to_string()]);
        assert!(record.finished_at.is_some());
        assert_eq!(store.count_variants(run_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn non_finite_rewards_persist_as_null() {
        let (_dir, store) = store().await;
        let run_id = store
            .save_run_start("code", "t", &[], serde_json::json!({}))
            .await
            .unwrap();
        store
            .save_run_finish(run_id, None, Some(f64::NAN), &[], Some(f64::NEG_INFINITY), 0.0)
            .await
            .unwrap();
        let record = store.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(record.best_score, None);
        assert_eq!(record.best_total_reward, None);
    }

    #[tokio::test]
    async fn operator_stats_running_mean_matches_observations() {
        let (_dir, store) = store().await;
        store.upsert_operator_stat("raise_temp", 1.0, 10).await.unwrap();
        store.upsert_operator_stat("raise_temp", 0.0, 10).await.unwrap();
        store.upsert_operator_stat("raise_temp", 0.5, 10).await.unwrap();

        let stats = store.list_operator_stats().await.unwrap();
        let s = &stats["raise_temp"];
        assert_eq!(s.pulls, 3);
        assert!((s.mean_payoff - 0.5).abs() < 1e-9);
        assert!((s.avg_reward - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn recipes_rank_by_score_and_approve() {
        let (_dir, store) = store().await;
        let p = SamplingParams::default();
        store.save_recipe("code", "s1", "n1", &p, 0.4, "ollama", 0.5).await.unwrap();
        let best = store.save_recipe("code", "s2", "n2", &p, 0.9, "ollama", 0.8).await.unwrap();
        store.approve_recipe(best, true).await.unwrap();

        let top = store.top_recipes("code", 1).await.unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].id, best);
        assert!(top[0].approved);
        assert!(store.top_recipes("writing", 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn latest_human_rating_wins() {
        let (_dir, store) = store().await;
        store.add_human_rating(5, 3, None).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.add_human_rating(5, 9, Some("better")).await.unwrap();
        assert_eq!(store.latest_human_rating(5).await.unwrap(), Some(9.0));
        assert_eq!(store.latest_human_rating(404).await.unwrap(), None);
    }
}
