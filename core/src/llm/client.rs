//! Model provider boundary and the default HTTP client.
//!
//! The engine only ever talks to a `ModelClient`; the bundled implementation
//! speaks the OpenAI-compatible chat completions dialect so any conformant
//! gateway can serve it. Tests substitute scripted clients.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error};

/// Model failure split by recoverability: transient errors are retried with
/// backoff, fatal ones terminate the turn immediately.
#[derive(Debug, Clone, Error)]
pub enum ModelError {
    #[error("transient model error: {0}")]
    Transient(String),
    #[error("fatal model error: {0}")]
    Fatal(String),
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u32,
    pub output: u32,
}

#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub model: String,
    pub system: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub text: String,
    pub model: String,
    pub usage: TokenUsage,
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn generate(&self, req: &ModelRequest) -> Result<ModelResponse, ModelError>;
}

/// Configuration for the bundled HTTP client, loaded from the environment.
#[derive(Debug, Clone)]
pub struct HttpModelConfig {
    pub base_url: String,
    pub api_key: Option<String>,
}

impl Default for HttpModelConfig {
    fn default() -> Self {
        Self {
            base_url: std::env::var("CHANCERY_MODEL_BASE_URL")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "http://localhost:8000/v1".to_string()),
            api_key: std::env::var("CHANCERY_MODEL_API_KEY")
                .ok()
                .filter(|s| !s.is_empty()),
        }
    }
}

/// OpenAI-compatible chat completions client.
pub struct HttpModelClient {
    http: Client,
    cfg: HttpModelConfig,
}

impl HttpModelClient {
    pub fn new(cfg: HttpModelConfig) -> Result<Self, ModelError> {
        let http = Client::builder()
            .build()
            .map_err(|e| ModelError::Fatal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, cfg })
    }

    pub fn from_env() -> Result<Self, ModelError> {
        Self::new(HttpModelConfig::default())
    }
}

#[async_trait]
impl ModelClient for HttpModelClient {
    async fn generate(&self, req: &ModelRequest) -> Result<ModelResponse, ModelError> {
        let url = format!(
            "{}/chat/completions",
            self.cfg.base_url.trim_end_matches('/')
        );
        debug!(target: "llm_client", %url, model = %req.model, "POST chat completions");

        let mut request = self
            .http
            .post(&url)
            .timeout(req.timeout)
            .header("content-type", "application/json");
        if let Some(key) = &self.cfg.api_key {
            request = request.bearer_auth(key);
        }

        let body = json!({
            "model": req.model,
            "messages": [
                {"role": "system", "content": req.system},
                {"role": "user", "content": req.prompt},
            ],
            "max_tokens": req.max_tokens,
            "temperature": req.temperature,
        });

        let resp = request.json(&body).send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                ModelError::Transient(format!("transport: {e}"))
            } else {
                ModelError::Fatal(format!("request: {e}"))
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let transient = status == StatusCode::REQUEST_TIMEOUT
                || status == StatusCode::TOO_MANY_REQUESTS
                || status.is_server_error();
            error!(target: "llm_client", %status, body = %text, "Model call failed");
            return if transient {
                Err(ModelError::Transient(format!("status {status}")))
            } else {
                Err(ModelError::Fatal(format!("status {status}: {text}")))
            };
        }

        let val: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ModelError::Fatal(format!("malformed response JSON: {e}")))?;

        let text = val
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|t| t.as_str())
            .ok_or_else(|| ModelError::Fatal("missing choices[0].message.content".to_string()))?
            .to_string();

        let usage = TokenUsage {
            input: val
                .pointer("/usage/prompt_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or_else(|| estimate_tokens(&req.prompt) + estimate_tokens(&req.system))
                as u32,
            output: val
                .pointer("/usage/completion_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or_else(|| estimate_tokens(&text)) as u32,
        };

        Ok(ModelResponse {
            text,
            model: val
                .get("model")
                .and_then(|m| m.as_str())
                .unwrap_or(&req.model)
                .to_string(),
            usage,
        })
    }
}

/// Rough token estimate when the provider omits usage (~4 bytes per token).
fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64 / 4).max(1)
}
