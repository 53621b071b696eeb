//! Remote evaluation backend (OpenAI-compatible chat completions).
//!
//! Used exclusively for judging, tie-breaking, proposal generation and the
//! optional challenger pass. Never used for primary generation.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

use super::{EngineError, EngineHealth, GenOptions, GenerationEngine};

const MODELS_CACHE_TTL: Duration = Duration::from_secs(300);

/// One chat message in the remote wire format.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub role: &'static str,
    pub content: String,
}

impl ChatTurn {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system",
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user",
            content: content.into(),
        }
    }
}

pub struct RemoteEngine {
    client: Client,
    base_url: String,
    api_key: String,
    model_override: Option<String>,
    models_cache: Mutex<Option<(Vec<String>, Instant)>>,
}

impl RemoteEngine {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model_override: None,
            models_cache: Mutex::new(None),
        }
    }

    /// Build from `GROQ_API_KEY` / `GROQ_MODEL_ID`; None when no key is set.
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("GROQ_API_KEY").ok()?;
        if api_key.is_empty() {
            return None;
        }
        let mut engine = Self::new(api_key, "https://api.groq.com/openai/v1");
        engine.model_override = std::env::var("GROQ_MODEL_ID").ok().filter(|m| !m.is_empty());
        Some(engine)
    }

    pub async fn list_models(&self) -> Result<Vec<String>, EngineError> {
        if let Ok(cache) = self.models_cache.lock() {
            if let Some((models, fetched_at)) = cache.as_ref() {
                if fetched_at.elapsed() < MODELS_CACHE_TTL {
                    return Ok(models.clone());
                }
            }
        }

        let url = format!("{}/models", self.base_url);
        let body: Value = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| EngineError::Request(format!("model list failed: {e}")))?
            .error_for_status()
            .map_err(|e| EngineError::Request(format!("model list rejected: {e}")))?
            .json()
            .await
            .map_err(|e| EngineError::Parse(format!("model list body: {e}")))?;

        let models: Vec<String> = body["data"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|m| m["id"].as_str().map(|s| s.to_string()))
            .collect();

        if let Ok(mut cache) = self.models_cache.lock() {
            *cache = Some((models.clone(), Instant::now()));
        }
        Ok(models)
    }

    async fn resolve_model(&self) -> Result<String, EngineError> {
        if let Some(model) = &self.model_override {
            return Ok(model.clone());
        }
        let models = self.list_models().await?;
        models
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::Unavailable("no remote models available".to_string()))
    }

    /// Raw chat completion against a specific model. Judges call this
    /// directly so model rotation stays in their hands.
    pub async fn chat_complete(
        &self,
        messages: &[ChatTurn],
        model_id: &str,
        temperature: Option<f64>,
        max_tokens: Option<u32>,
    ) -> Result<String, EngineError> {
        let wire_messages: Vec<Value> = messages
            .iter()
            .map(|m| json!({ "role": m.role, "content": m.content }))
            .collect();

        let mut body = json!({
            "model": model_id,
            "messages": wire_messages,
            "stream": false,
        });
        if let Some(t) = temperature {
            body["temperature"] = json!(t);
        }
        if let Some(n) = max_tokens {
            body["max_tokens"] = json!(n);
        }

        debug!(model = model_id, "remote chat completion");
        let url = format!("{}/chat/completions", self.base_url);
        let response: Value = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::Request(format!("chat completion failed: {e}")))?
            .error_for_status()
            .map_err(|e| EngineError::Request(format!("chat completion rejected: {e}")))?
            .json()
            .await
            .map_err(|e| EngineError::Parse(format!("chat completion body: {e}")))?;

        response["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| EngineError::Parse("missing choices[0].message.content".to_string()))
    }
}

#[async_trait]
impl GenerationEngine for RemoteEngine {
    async fn generate(
        &self,
        prompt: &str,
        system: Option<&str>,
        options: &GenOptions,
    ) -> Result<(String, String), EngineError> {
        let model = self.resolve_model().await?;
        let mut messages = Vec::new();
        if let Some(sys) = system {
            messages.push(ChatTurn::system(sys));
        }
        messages.push(ChatTurn::user(prompt));
        let text = self
            .chat_complete(&messages, &model, options.temperature, options.max_tokens)
            .await?;
        Ok((text, model))
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        system: Option<&str>,
        options: &GenOptions,
    ) -> Result<BoxStream<'static, Result<String, EngineError>>, EngineError> {
        // Remote calls are evaluation-only; a single-chunk stream is enough.
        let (text, _) = self.generate(prompt, system, options).await?;
        Ok(Box::pin(futures_util::stream::iter(vec![Ok(text)])))
    }

    async fn health(&self) -> EngineHealth {
        match self.list_models().await {
            Ok(models) if !models.is_empty() => EngineHealth::ok(),
            Ok(_) => EngineHealth::down("no models listed"),
            Err(e) => EngineHealth::down(e.to_string()),
        }
    }

    fn model_id(&self) -> String {
        self.model_override
            .clone()
            .unwrap_or_else(|| "remote:auto".to_string())
    }
}
