//! CLI entry point: run one evolution cycle against the local engine, or
//! probe engine health. The HTTP surface lives elsewhere; this binary is the
//! direct way to exercise the engine.

use std::sync::Arc;

use anyhow::{Context, Result};
use metaevolve::config::Config;
use metaevolve::embed;
use metaevolve::engine::{EngineGateway, EngineKind, OllamaEngine, RemoteEngine};
use metaevolve::judge::{JudgeBackend, QualityJudge};
use metaevolve::memory::MemoryStore;
use metaevolve::meta::{EvolutionService, MetaStore, RunFlags};
use metaevolve::realtime::RealtimeHub;
use metaevolve::tools::{ChunkIndex, HttpWebSearch};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn print_usage() {
    eprintln!("usage:");
    eprintln!("  metaevolve run <task_class> <task> [n]");
    eprintln!("  metaevolve health");
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = Config::from_env();

    let local = Arc::new(OllamaEngine::from_env());
    let remote = RemoteEngine::from_env().map(Arc::new);
    let gateway = Arc::new(EngineGateway::new(
        local,
        remote
            .clone()
            .map(|r| r as Arc<dyn metaevolve::engine::GenerationEngine>),
    ));

    match args.first().map(|s| s.as_str()) {
        Some("health") => {
            let local_health = gateway.health(EngineKind::Ollama).await;
            let remote_health = gateway.health(EngineKind::Groq).await;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "ollama": local_health,
                    "groq": remote_health,
                }))?
            );
            Ok(())
        }
        Some("run") => {
            let task_class = args.get(1).context("missing task_class")?.clone();
            let task = args.get(2).context("missing task")?.clone();
            let n: u32 = args
                .get(3)
                .map(|s| s.parse())
                .transpose()
                .context("n must be an integer")?
                .unwrap_or(config.evo.n);

            let embedder = embed::provider_from_config(&config.memory.embedder)?;
            let judge_backend =
                remote.map(|r| r as Arc<dyn JudgeBackend>);
            let judge = Arc::new(QualityJudge::new(judge_backend, embedder.clone()));

            let meta_store = MetaStore::open(config.layout.meta_db()).await?;
            let memory_store = if config.flags.memory {
                Some(MemoryStore::open(config.layout.memory_db(), config.memory.clone()).await?)
            } else {
                None
            };
            let retriever = Arc::new(ChunkIndex::build(
                std::path::Path::new("data"),
                embedder.clone(),
            ));
            let web = Arc::new(HttpWebSearch::from_env());
            let realtime = Arc::new(RealtimeHub::new());

            let service = EvolutionService::new(
                config.clone(),
                gateway,
                judge,
                embedder,
                meta_store,
                memory_store,
                retriever,
                web,
                realtime,
            );

            let mut flags = RunFlags::from_config(&config);
            flags.n = n;
            info!(task_class = %task_class, n, "starting evolution run");
            let result = service.run(&task_class, &task, &[], flags).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        _ => {
            print_usage();
            Ok(())
        }
    }
}
