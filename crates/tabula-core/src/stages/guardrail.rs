//! Guardrail stage
//!
//! Empty questions and well-known attack phrases are rejected locally without an
//! inference call. Everything else is classified by the model.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

use super::Guardrail;
use crate::capability::{
    FieldKind, InferenceCapability, InferenceRequest, PromptRenderer, ResponseSchema, SchemaField,
};
use crate::error::{InferenceError, Result};
use crate::prompts::TemplateId;
use crate::types::{GuardrailCategory, GuardrailVerdict, StageKind};

/// Longest model-written block message shown to users verbatim
pub const MAX_MODEL_REASON_LEN: usize = 300;

const INJECTION_PATTERNS: &[&str] = &[
    "ignore previous",
    "ignore all previous",
    "ignore your instructions",
    "disregard your",
    "forget your instructions",
    "you are now",
    "pretend you are",
    "act as if",
    "new instructions:",
    "system prompt:",
    "override:",
    "jailbreak",
    "dan mode",
    "developer mode",
];

const SQL_PATTERNS: &[&str] = &[
    "drop table",
    "delete from",
    "truncate table",
    "update set",
    "insert into",
    "; --",
    "' or '1'='1",
    "union select",
];

/// Local screening: returns a block verdict for empty questions and obvious attacks
pub fn screen_question(question: &str, domain: &str) -> Option<GuardrailVerdict> {
    if question.trim().is_empty() {
        return Some(GuardrailVerdict::block(
            GuardrailCategory::Empty,
            block_message(GuardrailCategory::Empty, domain),
        ));
    }

    let lowered = question.to_lowercase();
    if INJECTION_PATTERNS.iter().any(|p| lowered.contains(p)) {
        return Some(GuardrailVerdict::block(
            GuardrailCategory::PromptInjection,
            block_message(GuardrailCategory::PromptInjection, domain),
        ));
    }
    if SQL_PATTERNS.iter().any(|p| lowered.contains(p)) {
        return Some(GuardrailVerdict::block(
            GuardrailCategory::SqlInjection,
            block_message(GuardrailCategory::SqlInjection, domain),
        ));
    }
    None
}

/// Canned user-facing message for a blocked category
pub fn block_message(category: GuardrailCategory, domain: &str) -> String {
    match category {
        GuardrailCategory::Empty => {
            format!("Please enter a question about {}.", domain)
        }
        GuardrailCategory::PromptInjection => format!(
            "Your message contains instructions I can't follow. I'm here to answer questions about {}.",
            domain
        ),
        GuardrailCategory::SqlInjection => format!(
            "I can only read data, not change it. Try asking a question in plain language about {}, \
             for example \"Which ten customers bought the most last quarter?\"",
            domain
        ),
        GuardrailCategory::MedicalAdvice => format!(
            "I can't give medical advice, but I can help you explore {}.",
            domain
        ),
        GuardrailCategory::PersonalData => format!(
            "I can't share personal details about individuals. I can answer aggregate questions about {}.",
            domain
        ),
        GuardrailCategory::Harmful => "I can't help with that request.".to_string(),
        GuardrailCategory::OffTopic | GuardrailCategory::OnTopic => format!(
            "That question is outside what I can help with. I answer questions about {}.",
            domain
        ),
    }
}

#[derive(Debug, Deserialize)]
struct RawVerdict {
    decision: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    user_response: Option<String>,
}

/// Guardrail backed by the inference capability
#[derive(Debug, Clone)]
pub struct InferenceGuardrail {
    inference: Arc<dyn InferenceCapability>,
    renderer: Arc<dyn PromptRenderer>,
    domain: String,
}

impl InferenceGuardrail {
    pub fn new(
        inference: Arc<dyn InferenceCapability>,
        renderer: Arc<dyn PromptRenderer>,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            inference,
            renderer,
            domain: domain.into(),
        }
    }

    pub fn response_schema() -> ResponseSchema {
        ResponseSchema::Object {
            name: "guardrail_verdict",
            fields: vec![
                SchemaField::required("decision", FieldKind::String, "\"allow\" or \"block\""),
                SchemaField::optional("category", FieldKind::String, "classification label"),
                SchemaField::optional("reasoning", FieldKind::String, "one-line justification"),
                SchemaField::optional(
                    "user_response",
                    FieldKind::String,
                    "friendly message shown to the user when blocked",
                ),
            ],
        }
    }

    fn interpret(&self, raw: RawVerdict) -> std::result::Result<GuardrailVerdict, InferenceError> {
        let allowed = match raw.decision.trim().to_ascii_lowercase().as_str() {
            "allow" | "allowed" | "pass" | "yes" => true,
            "block" | "blocked" | "deny" | "reject" | "no" => false,
            other => {
                return Err(InferenceError::SchemaViolation {
                    schema: "guardrail_verdict".to_string(),
                    reason: format!("unknown decision `{}`", other),
                })
            }
        };

        if allowed {
            return Ok(GuardrailVerdict::allow());
        }

        let category = raw
            .category
            .as_deref()
            .and_then(GuardrailCategory::from_label)
            .filter(|c| *c != GuardrailCategory::OnTopic)
            .unwrap_or(GuardrailCategory::OffTopic);

        let reason = match raw.user_response.as_deref().map(str::trim) {
            Some(text) if !text.is_empty() && text.chars().count() <= MAX_MODEL_REASON_LEN => {
                text.to_string()
            }
            _ => block_message(category, &self.domain),
        };

        if let Some(reasoning) = raw.reasoning.as_deref() {
            debug!(?category, reasoning, "Guardrail block rationale");
        }
        Ok(GuardrailVerdict::block(category, reason))
    }
}

#[async_trait]
impl Guardrail for InferenceGuardrail {
    async fn evaluate(&self, question: &str) -> Result<GuardrailVerdict> {
        if let Some(verdict) = screen_question(question, &self.domain) {
            warn!(category = ?verdict.category, "Question rejected by local screening");
            return Ok(verdict);
        }

        let prompt = self.renderer.render(
            TemplateId::Guardrail,
            &json!({ "domain": self.domain, "question": question }),
        )?;
        let value = self
            .inference
            .infer(InferenceRequest {
                stage: StageKind::Guardrail,
                prompt,
                schema: Self::response_schema(),
            })
            .await?;

        let raw: RawVerdict =
            serde_json::from_value(value).map_err(|e| InferenceError::SchemaViolation {
                schema: "guardrail_verdict".to_string(),
                reason: e.to_string(),
            })?;

        Ok(self.interpret(raw)?)
    }
}
