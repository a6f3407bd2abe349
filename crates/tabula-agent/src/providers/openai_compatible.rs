use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::llm::{LLMChatClient, LLMChatCompletion};

/// How the API key is sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStyle {
    /// `Authorization: Bearer <key>`
    Bearer,
    /// `api-key: <key>` (Azure OpenAI)
    ApiKeyHeader,
}

/// Client for OpenAI, Azure OpenAI, Ollama and any server speaking the
/// `/chat/completions` protocol
#[derive(Debug, Clone)]
pub struct OpenAICompatibleClient {
    pub name: String,
    api_key: Option<String>,
    endpoint: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    auth: AuthStyle,
    headers: HashMap<String, String>,
    http_client: reqwest::Client,
}

impl OpenAICompatibleClient {
    pub fn new(
        name: impl Into<String>,
        api_key: Option<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        let base_url = base_url.into();
        Self {
            name: name.into(),
            api_key,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            model: model.into(),
            temperature: 0.0,
            max_tokens: 2048,
            auth: AuthStyle::Bearer,
            headers: HashMap::new(),
            http_client: reqwest::Client::new(),
        }
    }

    /// Azure routes by deployment and API version instead of model name
    pub fn azure(
        api_key: String,
        endpoint: &str,
        deployment: &str,
        api_version: &str,
        model: impl Into<String>,
    ) -> Self {
        let mut client = Self::new("azure_openai", Some(api_key), endpoint, model);
        client.endpoint = format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            endpoint.trim_end_matches('/'),
            deployment,
            api_version
        );
        client.auth = AuthStyle::ApiKeyHeader;
        client
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Transport-level timeout; the inference timeout still applies on top
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        if let Ok(client) = reqwest::Client::builder().timeout(timeout).build() {
            self.http_client = client;
        }
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn auth_style(&self) -> AuthStyle {
        self.auth
    }

    fn request_body(&self, system_prompt: &str, user_prompt: &str) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system_prompt.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user_prompt.to_string(),
                },
            ],
            max_tokens: Some(self.max_tokens),
            temperature: Some(self.temperature),
        }
    }

    async fn request_completion(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<(String, u32)> {
        let request = self.request_body(system_prompt, user_prompt);

        let mut builder = self
            .http_client
            .post(&self.endpoint)
            .header("Content-Type", "application/json");

        if let Some(api_key) = &self.api_key {
            builder = match self.auth {
                AuthStyle::Bearer => builder.header("Authorization", format!("Bearer {}", api_key)),
                AuthStyle::ApiKeyHeader => builder.header("api-key", api_key),
            };
        }

        for (key, value) in &self.headers {
            builder = builder.header(key, value);
        }

        let response = builder
            .json(&request)
            .send()
            .await
            .with_context(|| format!("Failed to send {} request", self.name))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("{} API error ({}): {}", self.name, status, error_text);
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .with_context(|| format!("Failed to parse {} response", self.name))?;

        let content = completion
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        let tokens = completion
            .usage
            .as_ref()
            .and_then(|u| u.total_tokens)
            .unwrap_or(0);

        Ok((content, tokens))
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    usage: Option<UsageInfo>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsageInfo {
    total_tokens: Option<u32>,
}

#[async_trait::async_trait]
impl LLMChatClient for OpenAICompatibleClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat_completion(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<LLMChatCompletion> {
        let (content, tokens) = self.request_completion(system_prompt, user_prompt).await?;
        Ok(LLMChatCompletion {
            llm_name: self.name.clone(),
            content,
            token_cost: tokens,
        })
    }
}
