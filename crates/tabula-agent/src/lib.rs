//! # Tabula Agent
//!
//! Language-model backends for Tabula. Each provider implements
//! [`LLMChatClient`]; [`LlmInference`] turns any of them into the
//! [`InferenceCapability`](tabula_core::InferenceCapability) the workflow needs.

pub mod llm;
pub mod parser;
pub mod providers;

use anyhow::Result;
use std::sync::Arc;

use tabula_core::LlmSettings;

pub use llm::{LLMChatClient, LLMChatCompletion, LlmInference};
pub use parser::extract_json_object;
pub use providers::build_chat_client;

/// Inference capability for `settings`, with API keys read from the process environment
pub fn inference_from_settings(settings: &LlmSettings) -> Result<Arc<LlmInference>> {
    let client = build_chat_client(settings, |key| std::env::var(key).ok())?;
    Ok(Arc::new(LlmInference::new(client, settings.request_timeout())))
}
