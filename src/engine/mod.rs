//! LM Gateway
//!
//! Uniform access to the local generation engine and the remote evaluation
//! engine. The gateway owns option normalization (token-cap naming,
//! temperature clamping) so callers never talk to a backend directly.
//! Generation always runs locally; the remote engine exists for judging and
//! evaluation only.

pub mod ollama;
pub mod remote;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use ollama::OllamaEngine;
pub use remote::RemoteEngine;

/// Which backend a call is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Ollama,
    Groq,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Ollama => "ollama",
            EngineKind::Groq => "groq",
        }
    }
}

impl std::str::FromStr for EngineKind {
    type Err = EngineError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ollama" => Ok(EngineKind::Ollama),
            "groq" => Ok(EngineKind::Groq),
            other => Err(EngineError::UnknownEngine(other.to_string())),
        }
    }
}

/// Sampling options accepted by the gateway. Token caps may arrive under
/// either name; `normalize_for` reconciles them per backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_predict: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl GenOptions {
    /// Normalize options for the target backend: the remote engine speaks
    /// `max_tokens` (default 4096, hard cap 8192), the local engine speaks
    /// `num_predict` (cap 2048). Temperature is clamped to [0, 2].
    pub fn normalize_for(mut self, kind: EngineKind) -> Self {
        match kind {
            EngineKind::Groq => {
                let cap = self.max_tokens.or(self.num_predict).unwrap_or(4096);
                self.max_tokens = Some(cap.min(8192));
                self.num_predict = None;
            }
            EngineKind::Ollama => {
                let cap = self.num_predict.or(self.max_tokens).unwrap_or(2048);
                self.num_predict = Some(cap.min(2048));
                self.max_tokens = None;
            }
        }
        if let Some(t) = self.temperature {
            self.temperature = Some(t.clamp(0.0, 2.0));
        }
        self
    }
}

/// Gateway-level failures. Generation iterations treat these as skippable.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown engine: {0}")]
    UnknownEngine(String),
    #[error("engine unavailable: {0}")]
    Unavailable(String),
    #[error("engine request failed: {0}")]
    Request(String),
    #[error("engine response malformed: {0}")]
    Parse(String),
}

/// Health report for one backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineHealth {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl EngineHealth {
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
            detail: None,
        }
    }

    pub fn down(detail: impl Into<String>) -> Self {
        Self {
            status: "down".to_string(),
            detail: Some(detail.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// One generation backend. Implementations must be cheap to clone behind an
/// `Arc` and safe to call concurrently.
#[async_trait]
pub trait GenerationEngine: Send + Sync {
    /// Generate a completion; returns the text and the resolved model id.
    async fn generate(
        &self,
        prompt: &str,
        system: Option<&str>,
        options: &GenOptions,
    ) -> Result<(String, String), EngineError>;

    /// Token stream for a completion. Finite and not restartable.
    async fn generate_stream(
        &self,
        prompt: &str,
        system: Option<&str>,
        options: &GenOptions,
    ) -> Result<BoxStream<'static, Result<String, EngineError>>, EngineError>;

    async fn health(&self) -> EngineHealth;

    /// Model id this backend resolves to by default.
    fn model_id(&self) -> String;
}

/// Routes calls to the right backend and applies the normalization rules.
pub struct EngineGateway {
    local: std::sync::Arc<dyn GenerationEngine>,
    remote: Option<std::sync::Arc<dyn GenerationEngine>>,
}

impl EngineGateway {
    pub fn new(
        local: std::sync::Arc<dyn GenerationEngine>,
        remote: Option<std::sync::Arc<dyn GenerationEngine>>,
    ) -> Self {
        Self { local, remote }
    }

    fn backend(
        &self,
        kind: EngineKind,
    ) -> Result<&std::sync::Arc<dyn GenerationEngine>, EngineError> {
        match kind {
            EngineKind::Ollama => Ok(&self.local),
            EngineKind::Groq => self
                .remote
                .as_ref()
                .ok_or_else(|| EngineError::Unavailable("remote engine not configured".to_string())),
        }
    }

    pub fn remote_available(&self) -> bool {
        self.remote.is_some()
    }

    /// `call(engine, prompt, system?, options) -> (text, resolved_model_id)`.
    pub async fn call(
        &self,
        kind: EngineKind,
        prompt: &str,
        system: Option<&str>,
        options: &GenOptions,
    ) -> Result<(String, String), EngineError> {
        let options = options.clone().normalize_for(kind);
        let backend = self.backend(kind)?;
        let (text, model) = backend.generate(prompt, system, &options).await?;
        let resolved = match kind {
            EngineKind::Groq => format!("groq:{model}"),
            EngineKind::Ollama => model,
        };
        Ok((text, resolved))
    }

    pub async fn stream(
        &self,
        kind: EngineKind,
        prompt: &str,
        system: Option<&str>,
        options: &GenOptions,
    ) -> Result<BoxStream<'static, Result<String, EngineError>>, EngineError> {
        let options = options.clone().normalize_for(kind);
        self.backend(kind)?
            .generate_stream(prompt, system, &options)
            .await
    }

    pub async fn health(&self, kind: EngineKind) -> EngineHealth {
        match self.backend(kind) {
            Ok(backend) => backend.health().await,
            Err(e) => EngineHealth::down(e.to_string()),
        }
    }

    pub fn local_model_id(&self) -> String {
        self.local.model_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_converts_token_caps_for_local() {
        let opts = GenOptions {
            max_tokens: Some(4096),
            ..Default::default()
        }
        .normalize_for(EngineKind::Ollama);
        assert_eq!(opts.num_predict, Some(2048));
        assert_eq!(opts.max_tokens, None);
    }

    #[test]
    fn normalize_caps_remote_tokens() {
        let opts = GenOptions {
            max_tokens: Some(100_000),
            ..Default::default()
        }
        .normalize_for(EngineKind::Groq);
        assert_eq!(opts.max_tokens, Some(8192));
    }

    #[test]
    fn normalize_defaults_when_unset() {
        let local = GenOptions::default().normalize_for(EngineKind::Ollama);
        assert_eq!(local.num_predict, Some(2048));
        let remote = GenOptions::default().normalize_for(EngineKind::Groq);
        assert_eq!(remote.max_tokens, Some(4096));
    }

    #[test]
    fn normalize_clamps_temperature() {
        let opts = GenOptions {
            temperature: Some(9.0),
            ..Default::default()
        }
        .normalize_for(EngineKind::Ollama);
        assert_eq!(opts.temperature, Some(2.0));
    }

    #[test]
    fn engine_kind_round_trips() {
        assert_eq!("ollama".parse::<EngineKind>().unwrap(), EngineKind::Ollama);
        assert_eq!("groq".parse::<EngineKind>().unwrap(), EngineKind::Groq);
        assert!("claude".parse::<EngineKind>().is_err());
    }
}
