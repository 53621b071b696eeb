//! Golden Set
//!
//! A curated, deterministic task corpus used as the held-out regression
//! suite for shadow evaluation and the post-run improvement loop. One JSON
//! file per task; ordering is by file name.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GoldenFlags {
    #[serde(default)]
    pub memory_k: Option<usize>,
    #[serde(default)]
    pub rag_k: Option<usize>,
    #[serde(default)]
    pub web: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoldenItem {
    #[serde(default)]
    pub id: String,
    pub task_class: String,
    pub task: String,
    #[serde(default)]
    pub assertions: Vec<String>,
    #[serde(default)]
    pub flags: GoldenFlags,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub task_type: Option<String>,
}

impl GoldenItem {
    pub fn effective_type(&self) -> &str {
        self.task_type.as_deref().unwrap_or(&self.task_class)
    }
}

/// Load up to `max_items` golden items in file-name order. Unreadable files
/// are skipped with a warning.
pub fn load_golden_items(golden_dir: &Path, max_items: usize) -> Vec<GoldenItem> {
    let Ok(entries) = std::fs::read_dir(golden_dir) else {
        return Vec::new();
    };
    let mut paths: Vec<_> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
        .collect();
    paths.sort();

    let mut items = Vec::new();
    for path in paths.into_iter().take(max_items) {
        match std::fs::read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|raw| serde_json::from_str::<GoldenItem>(&raw).map_err(|e| e.to_string()))
        {
            Ok(mut item) => {
                if item.id.is_empty() {
                    item.id = path
                        .file_stem()
                        .and_then(|s| s.to_str())
                        .unwrap_or("golden")
                        .to_string();
                }
                items.push(item);
            }
            Err(e) => warn!(path = %path.display(), "skipping golden item: {e}"),
        }
    }
    items
}

/// Diverse subset for the improvement loop: admit items that introduce a new
/// task type (or while the subset is still small), stopping once there are
/// at least 5 items covering at least 3 distinct types.
pub fn select_golden_subset(golden_dir: &Path) -> Vec<GoldenItem> {
    let all = load_golden_items(golden_dir, usize::MAX);
    let mut subset: Vec<GoldenItem> = Vec::new();
    let mut seen_types: std::collections::HashSet<String> = std::collections::HashSet::new();

    for item in all {
        let ttype = item.effective_type().to_string();
        if !seen_types.contains(&ttype) || subset.len() < 3 {
            seen_types.insert(ttype);
            subset.push(item);
        }
        if subset.len() >= 5 && seen_types.len() >= 3 {
            break;
        }
    }
    subset
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_item(dir: &Path, name: &str, task_class: &str, task_type: Option<&str>) {
        let item = serde_json::json!({
            "id": name,
            "task_class": task_class,
            "task": format!("task for {name}"),
            "assertions": ["works"],
            "task_type": task_type,
            "seed": 123,
        });
        std::fs::write(dir.join(format!("{name}.json")), item.to_string()).unwrap();
    }

    #[test]
    fn loads_in_file_name_order() {
        let dir = tempfile::tempdir().unwrap();
        write_item(dir.path(), "b_second", "code", None);
        write_item(dir.path(), "a_first", "analysis", None);
        let items = load_golden_items(dir.path(), 10);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, "a_first");
        assert_eq!(items[1].id, "b_second");
    }

    #[test]
    fn max_items_truncates() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..6 {
            write_item(dir.path(), &format!("item{i}"), "code", None);
        }
        assert_eq!(load_golden_items(dir.path(), 4).len(), 4);
    }

    #[test]
    fn missing_dir_is_empty() {
        assert!(load_golden_items(Path::new("/no/such/dir"), 5).is_empty());
    }

    #[test]
    fn malformed_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.json"), "{not json").unwrap();
        write_item(dir.path(), "good", "code", None);
        let items = load_golden_items(dir.path(), 10);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "good");
    }

    #[test]
    fn subset_requires_five_items_and_three_types() {
        let dir = tempfile::tempdir().unwrap();
        write_item(dir.path(), "a", "code", Some("code"));
        write_item(dir.path(), "b", "code", Some("analysis"));
        write_item(dir.path(), "c", "code", Some("writing"));
        write_item(dir.path(), "d", "code", Some("code"));
        write_item(dir.path(), "e", "code", Some("analysis"));
        write_item(dir.path(), "f", "code", Some("research"));

        let subset = select_golden_subset(dir.path());
        assert!(subset.len() >= 5);
        let types: std::collections::HashSet<_> =
            subset.iter().map(|i| i.effective_type().to_string()).collect();
        assert!(types.len() >= 3);
    }

    #[test]
    fn subset_of_single_type_takes_what_exists() {
        let dir = tempfile::tempdir().unwrap();
        write_item(dir.path(), "a", "code", None);
        write_item(dir.path(), "b", "code", None);
        let subset = select_golden_subset(dir.path());
        // Only the small-subset admission path applies.
        assert_eq!(subset.len(), 2);
    }
}
