//! End-to-end evolution runs against a scripted engine.

mod common;

use std::sync::Arc;

use common::{build_service, ConstantJudge, FixedEngine};
use metaevolve::config::BanditStrategy;
use metaevolve::meta::{JudgeMode, RunFlags};
use metaevolve::realtime::RunEvent;

fn flags_for(service: &metaevolve::meta::EvolutionService) -> RunFlags {
    RunFlags::from_config(service.config())
}

#[tokio::test]
async fn ucb_warm_start_pulls_each_operator_once() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(FixedEngine::new("a plain answer"));
    let service = build_service(dir.path(), engine, None).await;

    let mut flags = flags_for(&service);
    flags.n = 3;
    flags.operators = Some(vec![
        "change_system".to_string(),
        "raise_temp".to_string(),
        "lower_temp".to_string(),
    ]);
    flags.bandit_algorithm = BanditStrategy::Ucb;
    flags.warm_start_min_pulls = 1;
    flags.stratified_explore = true;
    flags.seed = Some(7);

    let result = service
        .run("code", "Write is_prime(n)", &[], flags)
        .await
        .unwrap();

    // Stratified first pass: the three iterations are a permutation.
    let mut sequence = result.operator_sequence.clone();
    sequence.sort();
    assert_eq!(
        sequence,
        vec![
            "change_system".to_string(),
            "lower_temp".to_string(),
            "raise_temp".to_string()
        ]
    );
    for op in &result.operator_sequence {
        assert_eq!(result.operator_stats[op].pulls, 1);
    }
}

#[tokio::test]
async fn sequence_length_matches_variant_count() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(FixedEngine::new("steady output"));
    let service = build_service(dir.path(), engine.clone(), None).await;

    let mut flags = flags_for(&service);
    flags.n = 4;
    flags.seed = Some(11);

    let result = service.run("analysis", "explain the tradeoff", &[], flags).await.unwrap();
    assert_eq!(result.operator_sequence.len(), 4);
    assert_eq!(engine.call_count(), 4);
    let variants = service
        .meta_store()
        .count_variants(result.run_id)
        .await
        .unwrap();
    assert_eq!(variants, 4);

    // Persisted mean payoff equals the running mean of observations.
    let stats = service.meta_store().list_operator_stats().await.unwrap();
    let total_pulls: u64 = stats.values().map(|s| s.pulls).sum();
    assert_eq!(total_pulls, 4);
}

#[tokio::test]
async fn zero_iteration_run_finalizes_empty() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(FixedEngine::new("unused"));
    let service = build_service(dir.path(), engine, None).await;

    let mut flags = flags_for(&service);
    flags.n = 0;

    let result = service.run("code", "noop task", &[], flags).await.unwrap();
    assert_eq!(result.best_score, None);
    assert_eq!(result.best_total_reward, None);
    assert!(result.operator_sequence.is_empty());
    assert_eq!(
        service.meta_store().count_variants(result.run_id).await.unwrap(),
        0
    );
    assert!(service.meta_store().list_operator_stats().await.unwrap().is_empty());

    // The run record itself is finalized.
    let record = service.meta_store().get_run(result.run_id).await.unwrap().unwrap();
    assert!(record.finished_at.is_some());
}

#[tokio::test]
async fn modest_improvement_promotes_without_approval() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(FixedEngine::new("plain words entirely unrelated"));
    // Judges agree on zero quality; total reward lands between the
    // promotion floor (0.05) and the auto-approve bar (0.15).
    let judge = Arc::new(ConstantJudge { score: 0.0 });
    let service = build_service(dir.path(), engine, Some(judge)).await;

    let mut flags = flags_for(&service);
    flags.n = 2;
    flags.seed = Some(3);

    let result = service.run("writing", "compose a haiku", &[], flags).await.unwrap();
    assert!(result.promotion.eligible, "reasons: {:?}", result.promotion.reasons);
    assert!(!result.promotion.approved);
    let recipe_id = result.promotion.recipe_id.unwrap();

    let recipes = service.meta_store().top_recipes("writing", 5).await.unwrap();
    let saved = recipes.iter().find(|r| r.id == recipe_id).unwrap();
    assert!(!saved.approved);
}

#[tokio::test]
async fn strong_improvement_auto_approves() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(FixedEngine::new("a thorough answer"));
    let judge = Arc::new(ConstantJudge { score: 0.9 });
    let service = build_service(dir.path(), engine, Some(judge)).await;

    let mut flags = flags_for(&service);
    flags.n = 2;
    flags.seed = Some(5);

    let result = service.run("writing", "compose a haiku", &[], flags).await.unwrap();
    assert!(result.promotion.eligible);
    assert!(result.promotion.approved);

    let recipes = service.meta_store().top_recipes("writing", 5).await.unwrap();
    assert!(recipes.iter().any(|r| r.approved));
}

#[tokio::test]
async fn all_judges_failing_records_semantic_fallback() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(FixedEngine::new("some output"));
    // No judge backend at all: the AI path is out, semantic carries.
    let service = build_service(dir.path(), engine, None).await;

    let mut flags = flags_for(&service);
    flags.n = 1;
    flags.seed = Some(9);

    let result = service.run("code", "write a function", &[], flags).await.unwrap();
    let breakdown = result.best_reward_breakdown.unwrap();
    assert_eq!(breakdown["outcome_metadata"]["method"], "semantic_fallback");
}

#[tokio::test]
async fn iteration_events_stream_to_subscribers() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(FixedEngine::new("streamed output"));
    let service = build_service(dir.path(), engine, None).await;

    // Subscribing before the run requires knowing the run id; subscribe to
    // the next id the store will hand out.
    let probe_id = {
        let id = service
            .meta_store()
            .save_run_start("code", "probe", &[], serde_json::json!({}))
            .await
            .unwrap();
        id + 1
    };
    let (_token, mut rx) = service.realtime().subscribe(probe_id);

    let mut flags = flags_for(&service);
    flags.n = 2;
    flags.seed = Some(1);
    let result = service.run("code", "streamed task", &[], flags).await.unwrap();
    assert_eq!(result.run_id, probe_id);

    let mut iter_events = 0;
    let mut saw_done = false;
    while let Ok(event) = rx.try_recv() {
        match event {
            RunEvent::Iter { run_id, .. } => {
                assert_eq!(run_id, probe_id);
                iter_events += 1;
            }
            RunEvent::Done { .. } => saw_done = true,
            _ => {}
        }
    }
    assert_eq!(iter_events, 2);
    assert!(saw_done);
}

#[tokio::test]
async fn artifacts_are_written_per_iteration_and_run() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(FixedEngine::new("artifact output"));
    let service = build_service(dir.path(), engine, None).await;

    let mut flags = flags_for(&service);
    flags.n = 2;
    flags.seed = Some(2);

    let result = service.run("code", "artifact task", &[], flags).await.unwrap();
    assert!(result.artifacts_dir.join("iteration_00.json").exists());
    assert!(result.artifacts_dir.join("iteration_01.json").exists());
    assert!(result.artifacts_dir.join("trajectory.json").exists());
    assert!(result.artifacts_dir.join("results.json").exists());
    assert!(result.artifacts_dir.join("eval.json").exists());
    assert!(result.artifacts_dir.join("eval_report.json").exists());

    let results_raw = std::fs::read_to_string(result.artifacts_dir.join("results.json")).unwrap();
    let value: serde_json::Value = serde_json::from_str(&results_raw).unwrap();
    assert_eq!(value["run_id"], result.run_id);
}

#[tokio::test]
async fn judge_mode_without_remote_engine_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(FixedEngine::new("contender"));
    let service = build_service(dir.path(), engine, None).await;

    let mut flags = flags_for(&service);
    flags.n = 1;
    flags.judge_mode = JudgeMode::PairwiseRemote;
    flags.seed = Some(4);

    let result = service.run("code", "compare me", &[], flags).await.unwrap();
    // No remote engine configured: the pairwise pass cannot run.
    assert!(result.judge.is_none());
}

#[tokio::test]
async fn high_reward_run_feeds_episodic_memory() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(FixedEngine::new("a keeper of an answer"));
    let judge = Arc::new(ConstantJudge { score: 0.95 });
    let service = build_service(dir.path(), engine, Some(judge)).await;

    let mut flags = flags_for(&service);
    flags.n = 1;
    flags.seed = Some(6);

    service.run("code", "memorable task", &[], flags).await.unwrap();

    // A second identical run retrieves the stored experience as a primer.
    let mut flags = flags_for(&service);
    flags.n = 1;
    flags.seed = Some(6);
    let second = service.run("code", "memorable task two", &[], flags).await.unwrap();
    assert!(second.best_total_reward.is_some());
}

#[tokio::test]
async fn concurrent_detached_runs_both_finalize() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(FixedEngine::new("concurrent output"));
    let service = build_service(dir.path(), engine, None).await;

    let mut flags_a = flags_for(&service);
    flags_a.n = 2;
    flags_a.seed = Some(31);
    let mut flags_b = flags_for(&service);
    flags_b.n = 2;
    flags_b.seed = Some(32);

    let handle_a = service.run_detached("code".into(), "task a".into(), vec![], flags_a);
    let handle_b = service.run_detached("code".into(), "task b".into(), vec![], flags_b);

    let result_a = handle_a.await.unwrap().unwrap();
    let result_b = handle_b.await.unwrap().unwrap();
    assert_ne!(result_a.run_id, result_b.run_id);
    assert_eq!(result_a.operator_sequence.len(), 2);
    assert_eq!(result_b.operator_sequence.len(), 2);

    // Four observations land in the shared operator stats.
    let stats = service.meta_store().list_operator_stats().await.unwrap();
    let total_pulls: u64 = stats.values().map(|s| s.pulls).sum();
    assert_eq!(total_pulls, 4);
}
