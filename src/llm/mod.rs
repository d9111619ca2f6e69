//! LLM adapter contract and provider dispatch (spec §6, §9).
//!
//! Modeled as a sum type `Provider` with a single `chat` trait; the core
//! never branches on provider identity except inside this module. Grounded
//! on the teacher's `ApiProvider`/`ExternalProvider` dispatch shape
//! (`llm/external.rs`) and on the original system's confirmation that OCI
//! (Oracle Cloud Infrastructure GenAI) is a real, named provider
//! (`oci_llm.py`) rather than a hypothetical one. Provider wire protocols
//! beyond a minimal OpenAI-compatible chat completion are out of scope.

use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Oci,
    OpenAi,
    Bedrock,
    Ollama,
    None,
}

/// `chat(question, context, provider?, max_tokens?, temperature?) -> string|null`.
/// Returns `Ok(None)` on any failure; the caller treats that as "no LLM
/// available, fall back to raw context" — never an error.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn chat(
        &self,
        question: &str,
        context: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Option<String>;
}

/// An HTTP-backed provider speaking an OpenAI-compatible chat completion
/// wire format, the same shape the teacher's `openai_compatible_generate`
/// uses for every OpenAI-compatible backend (OpenAI, Ollama, OCI's
/// OpenAI-compatible Generative AI endpoint).
pub struct HttpChatProvider {
    provider: Provider,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    client: reqwest::Client,
}

impl HttpChatProvider {
    pub fn new(provider: Provider, endpoint: String, api_key: Option<String>, model: String) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(90))
            .build()
            .unwrap_or_default();
        Self {
            provider,
            endpoint,
            api_key,
            model,
            client,
        }
    }
}

#[async_trait]
impl LlmProvider for HttpChatProvider {
    async fn chat(
        &self,
        question: &str,
        context: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Option<String> {
        if self.provider == Provider::None {
            return None;
        }
        let prompt = format!(
            "Answer the question using only the context below.\n\nContext:\n{context}\n\nQuestion: {question}"
        );
        let body = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "max_tokens": max_tokens,
            "temperature": temperature,
            "stream": false,
        });

        let mut req = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {key}"));
        }

        let resp = req.send().await.ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let parsed: serde_json::Value = resp.json().await.ok()?;
        parsed["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
    }
}

/// A provider that never answers — used when `Provider::None` is configured
/// or no API key is present; every caller falls back to raw context.
pub struct NoLlm;

#[async_trait]
impl LlmProvider for NoLlm {
    async fn chat(&self, _question: &str, _context: &str, _max_tokens: u32, _temperature: f32) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_llm_always_returns_none() {
        let provider = NoLlm;
        assert!(provider.chat("q", "ctx", 100, 0.2).await.is_none());
    }

    #[tokio::test]
    async fn provider_none_short_circuits_before_any_http_call() {
        let provider = HttpChatProvider::new(
            Provider::None,
            "http://localhost:1".to_string(),
            None,
            "model".to_string(),
        );
        assert!(provider.chat("q", "ctx", 100, 0.2).await.is_none());
    }
}
