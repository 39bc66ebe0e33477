// =============================================================================
// LLM Collaborator — OpenAI-compatible chat-completions client
// =============================================================================
//
// A thin client around the chat-completions wire format shared by every
// major hosted LLM provider. Credentials are hot-swappable (`reload`) so
// the manager can apply a config update without restarting the trader.
// =============================================================================

use std::time::Instant;

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::config::AiProviderConfig;

/// Reply from a single chat-completion call, with the latency the trader
/// loop reports alongside the decision.
pub struct LlmReply {
    pub content: String,
    pub latency_ms: u64,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

pub struct LlmClient {
    client: reqwest::Client,
    base_url: String,
    model_name: String,
    api_key: String,
}

impl LlmClient {
    pub fn new(config: &AiProviderConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .expect("failed to build reqwest client for LlmClient");

        debug!(provider = %config.provider, base_url = %config.base_url, "LlmClient initialised");

        Self {
            client,
            base_url: config.base_url.clone(),
            model_name: config.model_name.clone(),
            api_key: config.api_key.clone(),
        }
    }

    /// Swap in a fresh provider config in place, without recreating the
    /// trader task. Used by the manager's `reload_ai_config`.
    pub fn reload(&mut self, config: &AiProviderConfig) {
        self.base_url = config.base_url.clone();
        self.model_name = config.model_name.clone();
        self.api_key = config.api_key.clone();
    }

    #[instrument(skip(self, system_prompt, user_prompt), name = "llm::complete")]
    pub async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<LlmReply> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));

        let mut headers = HeaderMap::new();
        let auth_value = format!("Bearer {}", self.api_key);
        if let Ok(val) = HeaderValue::from_str(&auth_value) {
            headers.insert(AUTHORIZATION, val);
        }

        let body = ChatRequest {
            model: &self.model_name,
            messages: vec![
                ChatMessage { role: "system", content: system_prompt },
                ChatMessage { role: "user", content: user_prompt },
            ],
            temperature: 0.3,
        };

        let started = Instant::now();
        let resp = self
            .client
            .post(&url)
            .headers(headers)
            .json(&body)
            .send()
            .await
            .context("LLM chat-completions request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("LLM endpoint returned {status}: {text}");
        }

        let parsed: ChatResponse = resp.json().await.context("failed to parse LLM chat-completions response")?;
        let latency_ms = started.elapsed().as_millis() as u64;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .context("LLM response contained no choices")?;

        debug!(latency_ms, reply_len = content.len(), "LLM reply received");
        Ok(LlmReply { content, latency_ms })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reload_replaces_credentials_in_place() {
        let config = AiProviderConfig {
            provider: "openai".to_string(),
            api_key: "k1".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            model_name: "gpt-4o".to_string(),
        };
        let mut client = LlmClient::new(&config);

        let updated = AiProviderConfig {
            provider: "openai".to_string(),
            api_key: "k2".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            model_name: "gpt-4o-mini".to_string(),
        };
        client.reload(&updated);
        assert_eq!(client.api_key, "k2");
        assert_eq!(client.model_name, "gpt-4o-mini");
    }
}
