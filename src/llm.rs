use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ConfigError, GenerationError};
use crate::matcher::embedding::Embedder;

/// Black-box text completion.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, GenerationError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

pub struct LlmClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    embedding_model: String,
    api_key: Option<String>,
    temperature: f32,
    max_tokens: u32,
}

impl LlmClient {
    pub fn from_env() -> Result<Self, ConfigError> {
        let base_url = dotenv::var("LLM_BASE_URL")
            .unwrap_or_else(|_| "http://localhost:1234/v1".to_string());
        let model =
            dotenv::var("LLM_MODEL").unwrap_or_else(|_| "llama-3.1-8b-instant".to_string());
        let embedding_model = dotenv::var("LLM_EMBEDDING_MODEL")
            .unwrap_or_else(|_| "text-embedding-3-small".to_string());
        let api_key = dotenv::var("LLM_API_KEY").ok().filter(|k| !k.is_empty());
        let timeout_secs: u64 = parse_var("LLM_TIMEOUT_SECS", 60)?;
        let temperature: f32 = parse_var("LLM_TEMPERATURE", 0.2)?;
        let max_tokens: u32 = parse_var("LLM_MAX_TOKENS", 350)?;

        if model.trim().is_empty() {
            return Err(ConfigError::Invalid {
                var: "LLM_MODEL",
                value: model,
                reason: "model name must not be empty".to_string(),
            });
        }
        let url = reqwest::Url::parse(&base_url).map_err(|e| ConfigError::Invalid {
            var: "LLM_BASE_URL",
            value: base_url.clone(),
            reason: e.to_string(),
        })?;
        if api_key.is_none() && !is_loopback(&url) {
            return Err(ConfigError::MissingCredentials { base_url });
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url,
            model,
            embedding_model,
            api_key,
            temperature,
            max_tokens,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn http(&self) -> reqwest::Client {
        self.client.clone()
    }

    /// Resolve an OpenAI-style endpoint (`chat/completions`, `embeddings`)
    /// from the base URL.
    fn endpoint(&self, path: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        let base = base
            .strip_suffix("/chat/completions")
            .or_else(|| base.strip_suffix("/embeddings"))
            .unwrap_or(base);
        if base.ends_with("/v1") {
            format!("{}/{}", base, path)
        } else {
            format!("{}/v1/{}", base, path)
        }
    }

    async fn post(&self, path: &str, body: &serde_json::Value) -> Result<serde_json::Value, GenerationError> {
        let mut req = self.client.post(self.endpoint(path)).json(body);
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                GenerationError::Transient("Error: generator request timed out".to_string())
            } else {
                GenerationError::Transient(format!("Error: generator request failed: {}", e))
            }
        })?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            warn!(status = status.as_u16(), body = %text, "generator auth error");
            return Err(GenerationError::Unauthorized {
                status: status.as_u16(),
                model: self.model.clone(),
            });
        }
        if !status.is_success() {
            warn!(status = status.as_u16(), body = %text, "generator error");
            return Err(GenerationError::Transient(format!(
                "Error: generator returned status {}",
                status.as_u16()
            )));
        }

        serde_json::from_str(&text).map_err(|e| {
            warn!(error = %e, body = %text, "generator JSON parsing error");
            GenerationError::Transient("Error: failed to parse generator response".to_string())
        })
    }

    /// Non-streaming chat completion.
    pub async fn chat(&self, messages: &[Message]) -> Result<String, GenerationError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });
        let json = self.post("chat/completions", &body).await?;

        json["choices"]
            .get(0)
            .and_then(|c| c["message"]["content"].as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                GenerationError::Transient("Error: generator response had no content".to_string())
            })
    }
}

#[async_trait]
impl Generator for LlmClient {
    async fn complete(&self, prompt: &str) -> Result<String, GenerationError> {
        let messages = vec![Message {
            role: "user".to_string(),
            content: prompt.to_string(),
        }];
        let started = std::time::Instant::now();
        let out = self.chat(&messages).await;
        debug!(
            prompt_len = prompt.len(),
            ok = out.is_ok(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "generator call"
        );
        out
    }
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    embedding: Vec<f32>,
}

#[async_trait]
impl Embedder for LlmClient {
    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.embedding_model,
            "input": texts,
        });
        let json = self.post("embeddings", &body).await?;
        let parsed: EmbeddingResponse = serde_json::from_value(json)?;
        if parsed.data.len() != texts.len() {
            anyhow::bail!(
                "embedding count mismatch: sent {}, got {}",
                texts.len(),
                parsed.data.len()
            );
        }
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

fn is_loopback(url: &reqwest::Url) -> bool {
    matches!(
        url.host_str(),
        Some("localhost") | Some("127.0.0.1") | Some("[::1]") | Some("::1")
    )
}

/// Read an env var, falling back to `default` when unset.
pub(crate) fn parse_var<T>(var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match dotenv::var(var) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
                var,
                value: raw.clone(),
                reason: e.to_string(),
            })
        }
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base_url: &str) -> LlmClient {
        LlmClient {
            client: reqwest::Client::new(),
            base_url: base_url.to_string(),
            model: "m".to_string(),
            embedding_model: "e".to_string(),
            api_key: None,
            temperature: 0.2,
            max_tokens: 350,
        }
    }

    #[test]
    fn test_endpoint_resolution() {
        assert_eq!(
            client("http://localhost:1234/v1").endpoint("chat/completions"),
            "http://localhost:1234/v1/chat/completions"
        );
        assert_eq!(
            client("https://api.groq.com/openai/v1/chat/completions/").endpoint("embeddings"),
            "https://api.groq.com/openai/v1/embeddings"
        );
        assert_eq!(
            client("http://localhost:11434").endpoint("chat/completions"),
            "http://localhost:11434/v1/chat/completions"
        );
    }

    #[test]
    fn test_loopback_detection() {
        assert!(is_loopback(&reqwest::Url::parse("http://localhost:1234/v1").unwrap()));
        assert!(is_loopback(&reqwest::Url::parse("http://127.0.0.1/v1").unwrap()));
        assert!(!is_loopback(&reqwest::Url::parse("https://api.groq.com/openai/v1").unwrap()));
    }

    #[test]
    fn test_generation_error_fatality() {
        let auth = GenerationError::Unauthorized {
            status: 401,
            model: "m".to_string(),
        };
        assert!(auth.is_fatal());
        assert!(auth.to_string().contains("verify LLM_API_KEY"));
        assert!(!GenerationError::Transient("Error: boom".to_string()).is_fatal());
    }
}
