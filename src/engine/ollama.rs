//! Local generation backend over the Ollama API.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use ollama_rs::generation::chat::{request::ChatMessageRequest, ChatMessage};
use ollama_rs::models::ModelOptions;
use ollama_rs::Ollama;
use tracing::debug;

use super::{EngineError, EngineHealth, GenOptions, GenerationEngine};

pub struct OllamaEngine {
    client: Ollama,
    model_id: String,
}

impl OllamaEngine {
    pub fn new(client: Ollama, model_id: impl Into<String>) -> Self {
        Self {
            client,
            model_id: model_id.into(),
        }
    }

    /// Build from `OLLAMA_HOST` / `MODEL_ID`, defaulting to localhost:11434.
    pub fn from_env() -> Self {
        let client = match std::env::var("OLLAMA_HOST") {
            Ok(url) => Ollama::try_new(url).unwrap_or_default(),
            Err(_) => Ollama::default(),
        };
        let model_id = std::env::var("MODEL_ID").unwrap_or_else(|_| "qwen3:4b".to_string());
        Self::new(client, model_id)
    }

    fn build_request(
        &self,
        prompt: &str,
        system: Option<&str>,
        options: &GenOptions,
    ) -> ChatMessageRequest {
        let mut messages = Vec::new();
        if let Some(sys) = system {
            messages.push(ChatMessage::system(sys.to_string()));
        }
        messages.push(ChatMessage::user(prompt.to_string()));

        let mut model_options = ModelOptions::default();
        if let Some(t) = options.temperature {
            model_options = model_options.temperature(t as f32);
        }
        if let Some(k) = options.top_k {
            model_options = model_options.top_k(k);
        }
        if let Some(n) = options.num_predict {
            model_options = model_options.num_predict(n as i32);
        }

        ChatMessageRequest::new(self.model_id.clone(), messages).options(model_options)
    }
}

#[async_trait]
impl GenerationEngine for OllamaEngine {
    async fn generate(
        &self,
        prompt: &str,
        system: Option<&str>,
        options: &GenOptions,
    ) -> Result<(String, String), EngineError> {
        let request = self.build_request(prompt, system, options);
        debug!(model = %self.model_id, "local generation request");
        let response = self
            .client
            .send_chat_messages(request)
            .await
            .map_err(|e| EngineError::Request(format!("ollama generate failed: {e}")))?;
        Ok((response.message.content, self.model_id.clone()))
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        system: Option<&str>,
        options: &GenOptions,
    ) -> Result<BoxStream<'static, Result<String, EngineError>>, EngineError> {
        let request = self.build_request(prompt, system, options);
        let stream = self
            .client
            .send_chat_messages_stream(request)
            .await
            .map_err(|e| EngineError::Request(format!("ollama stream failed: {e}")))?;

        let mapped = stream.map(|chunk| match chunk {
            Ok(res) => Ok(res.message.content),
            Err(_) => Err(EngineError::Request("ollama stream interrupted".to_string())),
        });
        Ok(Box::pin(mapped))
    }

    async fn health(&self) -> EngineHealth {
        match self.client.list_local_models().await {
            Ok(models) => {
                if models.iter().any(|m| m.name == self.model_id) {
                    EngineHealth::ok()
                } else {
                    EngineHealth::down(format!("model '{}' not pulled", self.model_id))
                }
            }
            Err(e) => EngineHealth::down(format!("failed to query local models: {e}")),
        }
    }

    fn model_id(&self) -> String {
        self.model_id.clone()
    }
}
