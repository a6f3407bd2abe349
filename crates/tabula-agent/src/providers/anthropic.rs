//! Anthropic Messages API client

use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::time::Duration;

use crate::llm::{LLMChatClient, LLMChatCompletion};

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone)]
pub struct AnthropicClient {
    api_key: String,
    base_url: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    http_client: reqwest::Client,
}

impl AnthropicClient {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: model.into(),
            temperature: 0.0,
            max_tokens: 2048,
            http_client: reqwest::Client::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        if let Ok(client) = reqwest::Client::builder().timeout(timeout).build() {
            self.http_client = client;
        }
        self
    }

    fn url(&self) -> String {
        format!("{}/v1/messages", self.base_url)
    }

    fn body(&self, system_prompt: &str, user_prompt: &str) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": user_prompt }],
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
        });
        if !system_prompt.is_empty() {
            body["system"] = Value::String(system_prompt.to_string());
        }
        body
    }
}

/// Concatenated text blocks and total token usage of a Messages response
fn read_response(response: &Value) -> (String, u32) {
    let content = response["content"]
        .as_array()
        .map(|blocks| {
            blocks
                .iter()
                .filter(|block| block["type"] == "text")
                .filter_map(|block| block["text"].as_str())
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    let usage = &response["usage"];
    let tokens = usage["input_tokens"].as_u64().unwrap_or(0) + usage["output_tokens"].as_u64().unwrap_or(0);
    (content, tokens as u32)
}

#[async_trait::async_trait]
impl LLMChatClient for AnthropicClient {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn chat_completion(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<LLMChatCompletion> {
        let response = self
            .http_client
            .post(self.url())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("Content-Type", "application/json")
            .json(&self.body(system_prompt, user_prompt))
            .send()
            .await
            .context("Failed to send Anthropic request")?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("Anthropic API error ({}): {}", status, error_text);
        }

        let json: Value = response
            .json()
            .await
            .context("Failed to parse Anthropic response")?;
        let (content, token_cost) = read_response(&json);

        Ok(LLMChatCompletion {
            llm_name: format!("anthropic/{}", self.model),
            content,
            token_cost,
        })
    }
}
