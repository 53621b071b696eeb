//! Web search provider
//!
//! Thin interface over an external JSON search API. Absent a configured
//! provider, searches degrade to empty results so `toggle_web` runs stay
//! harmless offline.

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct WebHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

#[async_trait]
pub trait WebProvider: Send + Sync {
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<WebHit>>;
}

/// JSON search API client (`WEB_SEARCH_API_KEY` / `WEB_SEARCH_URL`).
pub struct HttpWebSearch {
    client: Client,
    api_key: Option<String>,
    endpoint: String,
}

impl HttpWebSearch {
    pub fn from_env() -> Self {
        Self {
            client: Client::new(),
            api_key: std::env::var("WEB_SEARCH_API_KEY").ok().filter(|k| !k.is_empty()),
            endpoint: std::env::var("WEB_SEARCH_URL")
                .unwrap_or_else(|_| "https://api.tavily.com/search".to_string()),
        }
    }
}

#[async_trait]
impl WebProvider for HttpWebSearch {
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<WebHit>> {
        let Some(key) = &self.api_key else {
            debug!("web search skipped: no api key configured");
            return Ok(Vec::new());
        };

        let body = json!({
            "api_key": key,
            "query": query,
            "max_results": top_k,
        });
        let response: Value = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .timeout(std::time::Duration::from_secs(5))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let hits = response["results"]
            .as_array()
            .into_iter()
            .flatten()
            .take(top_k)
            .map(|item| {
                let snippet: String = item["content"].as_str().unwrap_or("").chars().take(300).collect();
                WebHit {
                    title: item["title"].as_str().unwrap_or("").to_string(),
                    url: item["url"].as_str().unwrap_or("").to_string(),
                    snippet,
                }
            })
            .collect();
        Ok(hits)
    }
}

/// Always-empty provider for offline runs and tests.
pub struct NullWebSearch;

#[async_trait]
impl WebProvider for NullWebSearch {
    async fn search(&self, _query: &str, _top_k: usize) -> Result<Vec<WebHit>> {
        Ok(Vec::new())
    }
}
