//! Chat-completion clients and the inference capability built on them

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use tabula_core::{InferenceCapability, InferenceError, InferenceRequest, ResponseSchema};

use crate::parser::{extract_json_object, strip_code_fence};

/// Chat completion result
#[derive(Debug, Clone)]
pub struct LLMChatCompletion {
    pub llm_name: String,
    pub content: String,
    pub token_cost: u32,
}

/// Minimal chat completion trait implemented by every provider
#[async_trait]
pub trait LLMChatClient: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    async fn chat_completion(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<LLMChatCompletion>;
}

/// [`InferenceCapability`] over a chat client.
///
/// The response schema is described at the end of the system prompt, the reply
/// is parsed (JSON object or plain text) and validated before it is returned.
#[derive(Debug, Clone)]
pub struct LlmInference {
    client: Arc<dyn LLMChatClient>,
    timeout: Duration,
}

impl LlmInference {
    pub fn new(client: Arc<dyn LLMChatClient>, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    pub fn provider(&self) -> &str {
        self.client.name()
    }

    fn system_prompt(system: &str, schema: &ResponseSchema) -> String {
        if system.trim().is_empty() {
            schema.describe()
        } else {
            format!("{}\n\n{}", system.trim_end(), schema.describe())
        }
    }

    fn parse_reply(schema: &ResponseSchema, content: &str) -> Result<Value, InferenceError> {
        if content.trim().is_empty() {
            return Err(InferenceError::EmptyResponse);
        }

        let value = if schema.expects_json() {
            extract_json_object(content).ok_or_else(|| {
                let preview: String = content.chars().take(120).collect();
                InferenceError::MalformedOutput(format!("no JSON object in reply: {}", preview))
            })?
        } else {
            Value::String(strip_code_fence(content))
        };

        schema.validate(&value)?;
        Ok(value)
    }
}

#[async_trait]
impl InferenceCapability for LlmInference {
    async fn infer(&self, request: InferenceRequest) -> Result<Value, InferenceError> {
        let system = Self::system_prompt(&request.prompt.system, &request.schema);
        let call = self.client.chat_completion(&system, &request.prompt.user);

        let completion = match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(completion)) => completion,
            Ok(Err(err)) => {
                return Err(InferenceError::Provider {
                    provider: self.client.name().to_string(),
                    message: format!("{:#}", err),
                })
            }
            Err(_) => {
                warn!(
                    provider = self.client.name(),
                    stage = %request.stage,
                    "Inference timed out"
                );
                return Err(InferenceError::Timeout(self.timeout.as_millis() as u64));
            }
        };

        debug!(
            provider = %completion.llm_name,
            stage = %request.stage,
            tokens = completion.token_cost,
            "Inference completed"
        );

        Self::parse_reply(&request.schema, &completion.content)
    }
}
