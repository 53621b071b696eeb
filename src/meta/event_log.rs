//! Structured event log
//!
//! Run-level lifecycle events mirrored to `logs/` as individual JSON
//! artifacts, timestamped for post-hoc analysis. Write failures are logged
//! and swallowed; the event log never blocks a run.

use std::path::Path;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::warn;

fn write_event(logs_dir: &Path, artifact_type: &str, data: Value) {
    let now = Utc::now();
    let entry = json!({
        "artifact_type": artifact_type,
        "timestamp": now.to_rfc3339(),
        "unix_timestamp": now.timestamp_millis() as f64 / 1000.0,
        "data": data,
    });
    let filename = format!("{artifact_type}_{}.json", now.format("%Y%m%d_%H%M%S_%3f"));
    let result = std::fs::create_dir_all(logs_dir)
        .and_then(|_| std::fs::write(logs_dir.join(&filename), entry.to_string()));
    if let Err(e) = result {
        warn!(artifact_type, "event log write failed: {e}");
    }
}

pub fn log_run_start(logs_dir: &Path, run_id: i64, task_class: &str, task: &str, config: &Value) {
    write_event(
        logs_dir,
        "meta_run_start",
        json!({
            "run_id": run_id,
            "task_class": task_class,
            "task": task,
            "config": config,
        }),
    );
}

pub fn log_run_finish(logs_dir: &Path, run_id: i64, best_score: Option<f64>, iterations: usize) {
    write_event(
        logs_dir,
        "meta_run_finish",
        json!({
            "run_id": run_id,
            "best_score": best_score,
            "iterations": iterations,
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_land_as_json_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        log_run_start(dir.path(), 1, "code", "a task", &json!({"n": 3}));
        log_run_finish(dir.path(), 1, Some(0.5), 3);

        let files: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(files.len(), 2);
        for file in files {
            let raw = std::fs::read_to_string(file.path()).unwrap();
            let value: Value = serde_json::from_str(&raw).unwrap();
            assert!(value["artifact_type"].is_string());
            assert_eq!(value["data"]["run_id"], 1);
        }
    }
}
