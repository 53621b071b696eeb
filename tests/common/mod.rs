//! Shared fixtures: a scripted local engine, a scripted judge backend, and
//! a fully wired service over temp storage. Nothing here touches the
//! network.
#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use metaevolve::config::{
    BanditStrategy, CodeLoopConfig, Config, EvoDefaults, FeatureFlags, MemoryConfig, RewardConfig,
    SmeConfig, StorageLayout,
};
use metaevolve::embed::HashEmbedder;
use metaevolve::engine::{
    EngineError, EngineGateway, EngineHealth, GenOptions, GenerationEngine,
};
use metaevolve::judge::{JudgeBackend, QualityJudge};
use metaevolve::memory::MemoryStore;
use metaevolve::meta::{EvolutionService, MetaStore};
use metaevolve::realtime::RealtimeHub;
use metaevolve::tools::rag::ChunkIndex;
use metaevolve::tools::web::NullWebSearch;

/// Local engine returning a fixed completion.
pub struct FixedEngine {
    output: String,
    calls: AtomicUsize,
}

impl FixedEngine {
    pub fn new(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            calls: AtomicUsize::new(0),
        }
    }

    #[allow(dead_code)]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationEngine for FixedEngine {
    async fn generate(
        &self,
        _prompt: &str,
        _system: Option<&str>,
        _options: &GenOptions,
    ) -> Result<(String, String), EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok((self.output.clone(), "local:fixed".to_string()))
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        system: Option<&str>,
        options: &GenOptions,
    ) -> Result<BoxStream<'static, Result<String, EngineError>>, EngineError> {
        let (text, _) = self.generate(prompt, system, options).await?;
        Ok(Box::pin(futures_util::stream::iter(vec![Ok(text)])))
    }

    async fn health(&self) -> EngineHealth {
        EngineHealth::ok()
    }

    fn model_id(&self) -> String {
        "local:fixed".to_string()
    }
}

/// Judge backend replying with the same JSON score for every call.
pub struct ConstantJudge {
    pub score: f64,
}

#[async_trait]
impl JudgeBackend for ConstantJudge {
    async fn complete(
        &self,
        _system: &str,
        _user: &str,
        _model: &str,
    ) -> Result<String, EngineError> {
        Ok(format!(
            r#"{{"score": {}, "reasoning": "scripted", "strengths": [], "weaknesses": []}}"#,
            self.score
        ))
    }
}

pub fn test_config(root: &Path) -> Config {
    Config {
        evo: EvoDefaults {
            n: 4,
            memory_k: 3,
            rag_k: 3,
            web_k: 3,
            eps: 0.1,
            strategy: BanditStrategy::Ucb,
            ucb_c: 2.0,
            warm_start_min_pulls: 1,
            stratified_explore: true,
        },
        flags: FeatureFlags {
            trajectory_log: true,
            eval_gate: true,
            code_loop: false,
            systems_v2: false,
            memory: true,
        },
        reward: RewardConfig {
            alpha: 1.0,
            beta_process: 0.2,
            gamma_cost: -0.0005,
        },
        memory: MemoryConfig {
            embedder: "hash".to_string(),
            ..MemoryConfig::from_env()
        },
        code_loop: CodeLoopConfig::from_env(),
        sme: SmeConfig::from_env(),
        layout: StorageLayout::rooted_at(root),
    }
}

/// Wire a service over temp storage with the given engine and an optional
/// judge backend.
pub async fn build_service(
    root: &Path,
    engine: Arc<dyn GenerationEngine>,
    judge_backend: Option<Arc<dyn JudgeBackend>>,
) -> Arc<EvolutionService> {
    let config = test_config(root);
    let embedder = Arc::new(HashEmbedder::new(64));
    let gateway = Arc::new(EngineGateway::new(engine, None));
    let judge = Arc::new(QualityJudge::new(judge_backend, embedder.clone()));
    let meta_store = MetaStore::open(config.layout.meta_db()).await.unwrap();
    let memory_store = MemoryStore::open(config.layout.memory_db(), config.memory.clone())
        .await
        .unwrap();

    Arc::new(EvolutionService::new(
        config,
        gateway,
        judge,
        embedder.clone(),
        meta_store,
        Some(memory_store),
        Arc::new(ChunkIndex::empty(embedder)),
        Arc::new(NullWebSearch),
        Arc::new(RealtimeHub::new()),
    ))
}
