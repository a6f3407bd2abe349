use anyhow::{Context, Result};
use std::sync::Arc;

use tabula_core::{LlmProviderKind, LlmSettings};

use crate::llm::LLMChatClient;
use crate::providers::anthropic::AnthropicClient;
use crate::providers::openai_compatible::OpenAICompatibleClient;

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const OLLAMA_BASE_URL: &str = "http://localhost:11434/v1";
const AZURE_API_VERSION: &str = "2024-02-01";

/// Build the chat client for `settings`. `lookup` reads environment variables
/// so tests can supply their own.
pub fn build_chat_client<F>(settings: &LlmSettings, lookup: F) -> Result<Arc<dyn LLMChatClient>>
where
    F: Fn(&str) -> Option<String>,
{
    let timeout = settings.request_timeout();
    let client: Arc<dyn LLMChatClient> = match settings.provider {
        LlmProviderKind::Openai => {
            let api_key = resolve_api_key(&lookup, &settings.api_key_env, "OPENAI_API_KEY")?;
            let base_url = settings.base_url.as_deref().unwrap_or(OPENAI_BASE_URL);
            Arc::new(
                OpenAICompatibleClient::new("openai", Some(api_key), base_url, &settings.model)
                    .with_temperature(settings.temperature)
                    .with_max_tokens(settings.max_tokens)
                    .with_request_timeout(timeout),
            )
        }
        LlmProviderKind::AzureOpenai => {
            let api_key = resolve_api_key(&lookup, &settings.api_key_env, "AZURE_OPENAI_API_KEY")?;
            let endpoint = settings
                .base_url
                .clone()
                .or_else(|| lookup("AZURE_OPENAI_ENDPOINT"))
                .context("Azure OpenAI needs llm.base_url or AZURE_OPENAI_ENDPOINT")?;
            let deployment = settings
                .deployment
                .clone()
                .or_else(|| lookup("AZURE_OPENAI_DEPLOYMENT"))
                .context("Azure OpenAI needs llm.deployment or AZURE_OPENAI_DEPLOYMENT")?;
            let api_version = settings
                .api_version
                .clone()
                .or_else(|| lookup("AZURE_OPENAI_API_VERSION"))
                .unwrap_or_else(|| AZURE_API_VERSION.to_string());

            Arc::new(
                OpenAICompatibleClient::azure(
                    api_key,
                    &endpoint,
                    &deployment,
                    &api_version,
                    &settings.model,
                )
                .with_temperature(settings.temperature)
                .with_max_tokens(settings.max_tokens)
                .with_request_timeout(timeout),
            )
        }
        LlmProviderKind::Anthropic => {
            let api_key = resolve_api_key(&lookup, &settings.api_key_env, "ANTHROPIC_API_KEY")?;
            let mut client = AnthropicClient::new(api_key, &settings.model)
                .with_temperature(settings.temperature)
                .with_max_tokens(settings.max_tokens)
                .with_request_timeout(timeout);
            if let Some(base_url) = &settings.base_url {
                client = client.with_base_url(base_url.clone());
            }
            Arc::new(client)
        }
        LlmProviderKind::Ollama => {
            let base_url = settings
                .base_url
                .clone()
                .or_else(|| lookup("OLLAMA_HOST").map(|host| format!("{}/v1", host.trim_end_matches('/'))))
                .unwrap_or_else(|| OLLAMA_BASE_URL.to_string());
            let api_key = resolve_api_key_optional(&lookup, &settings.api_key_env, "OLLAMA_API_KEY");
            Arc::new(
                OpenAICompatibleClient::new("ollama", api_key, base_url, &settings.model)
                    .with_temperature(settings.temperature)
                    .with_max_tokens(settings.max_tokens)
                    .with_request_timeout(timeout),
            )
        }
        LlmProviderKind::OpenaiCompatible => {
            let base_url = settings
                .base_url
                .clone()
                .context("openai_compatible provider needs llm.base_url")?;
            let api_key = resolve_api_key_optional(&lookup, &settings.api_key_env, "LLM_API_KEY");
            Arc::new(
                OpenAICompatibleClient::new("openai_compatible", api_key, base_url, &settings.model)
                    .with_temperature(settings.temperature)
                    .with_max_tokens(settings.max_tokens)
                    .with_request_timeout(timeout),
            )
        }
    };

    tracing::info!(provider = %settings.provider, model = %settings.model, "Configured LLM provider");
    Ok(client)
}

fn resolve_api_key<F>(lookup: &F, env_hint: &Option<String>, default_env: &str) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    resolve_api_key_optional(lookup, env_hint, default_env)
        .with_context(|| format!("Missing required API key env var {}", env_name(env_hint, default_env)))
}

fn resolve_api_key_optional<F>(lookup: &F, env_hint: &Option<String>, default_env: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(env_name) = env_hint {
        if let Some(value) = lookup(env_name).filter(|v| !v.trim().is_empty()) {
            return Some(value);
        }
    }
    lookup(default_env).filter(|v| !v.trim().is_empty())
}

fn env_name<'a>(env_hint: &'a Option<String>, default_env: &'a str) -> &'a str {
    env_hint.as_deref().unwrap_or(default_env)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_openai_requires_key() {
        let settings = LlmSettings::default();
        let err = build_chat_client(&settings, env(&[])).unwrap_err();
        assert!(err.to_string().contains("OPENAI_API_KEY"));

        let client = build_chat_client(&settings, env(&[("OPENAI_API_KEY", "sk-test")])).unwrap();
        assert_eq!(client.name(), "openai");
    }

    #[test]
    fn test_key_env_hint_wins() {
        let settings = LlmSettings {
            api_key_env: Some("TEAM_OPENAI_KEY".to_string()),
            ..LlmSettings::default()
        };
        assert!(build_chat_client(&settings, env(&[("TEAM_OPENAI_KEY", "sk-team")])).is_ok());

        let err = build_chat_client(&settings, env(&[])).unwrap_err();
        assert!(err.to_string().contains("TEAM_OPENAI_KEY"));
    }

    #[test]
    fn test_azure_needs_endpoint_and_deployment() {
        let settings = LlmSettings {
            provider: LlmProviderKind::AzureOpenai,
            ..LlmSettings::default()
        };
        let err = build_chat_client(&settings, env(&[("AZURE_OPENAI_API_KEY", "k")])).unwrap_err();
        assert!(err.to_string().contains("AZURE_OPENAI_ENDPOINT"));

        let client = build_chat_client(
            &settings,
            env(&[
                ("AZURE_OPENAI_API_KEY", "k"),
                ("AZURE_OPENAI_ENDPOINT", "https://acme.openai.azure.com"),
                ("AZURE_OPENAI_DEPLOYMENT", "gpt4o"),
            ]),
        )
        .unwrap();
        assert_eq!(client.name(), "azure_openai");
    }

    #[test]
    fn test_ollama_needs_no_key() {
        let settings = LlmSettings {
            provider: LlmProviderKind::Ollama,
            model: "llama3.2".to_string(),
            ..LlmSettings::default()
        };
        let client = build_chat_client(&settings, env(&[])).unwrap();
        assert_eq!(client.name(), "ollama");
    }

    #[test]
    fn test_compatible_needs_base_url() {
        let settings = LlmSettings {
            provider: LlmProviderKind::OpenaiCompatible,
            ..LlmSettings::default()
        };
        assert!(build_chat_client(&settings, env(&[])).is_err());

        let settings = LlmSettings {
            base_url: Some("http://localhost:8000/v1".to_string()),
            ..settings
        };
        assert_eq!(
            build_chat_client(&settings, env(&[])).unwrap().name(),
            "openai_compatible"
        );
    }

    #[test]
    fn test_anthropic_client() {
        let settings = LlmSettings {
            provider: LlmProviderKind::Anthropic,
            model: "claude-3-5-haiku-latest".to_string(),
            ..LlmSettings::default()
        };
        let client = build_chat_client(&settings, env(&[("ANTHROPIC_API_KEY", "k")])).unwrap();
        assert_eq!(client.name(), "anthropic");
    }
}
