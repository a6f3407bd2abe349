//! Planner stage

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

use super::sanitize::PlanSanitizer;
use super::Planner;
use crate::capability::{
    FieldKind, InferenceCapability, InferenceRequest, PromptRenderer, ResponseSchema, SchemaField,
};
use crate::error::{InferenceError, Result};
use crate::prompts::TemplateId;
use crate::types::{Complexity, PlanResult, StageKind};

lazy_static! {
    static ref FIRST_NUMBER: Regex = Regex::new(r"\d+").unwrap();
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct RawPlan {
    #[serde(default, alias = "user_intent")]
    intent: String,
    #[serde(default)]
    instructions: String,
    #[serde(default)]
    output_requirements: Vec<String>,
    #[serde(default, alias = "sorting_preference")]
    sort_preference: Option<String>,
    #[serde(default)]
    limit_preference: Option<Value>,
    #[serde(default)]
    assumptions: Vec<String>,
    #[serde(default)]
    complexity: Option<String>,
    #[serde(default = "default_true")]
    expects_results: bool,
}

/// Accepts `10`, `"10"`, `"top 10"`; anything else (or zero) means no limit
pub fn parse_limit(value: Option<&Value>) -> Option<u32> {
    let limit = match value? {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f as u64))?,
        Value::String(s) => FIRST_NUMBER.find(s)?.as_str().parse::<u64>().ok()?,
        _ => return None,
    };
    u32::try_from(limit).ok().filter(|l| *l > 0)
}

/// Planner backed by the inference capability
#[derive(Debug, Clone)]
pub struct InferencePlanner {
    inference: Arc<dyn InferenceCapability>,
    renderer: Arc<dyn PromptRenderer>,
    sanitizer: PlanSanitizer,
    domain: String,
    schema_context: String,
}

impl InferencePlanner {
    pub fn new(
        inference: Arc<dyn InferenceCapability>,
        renderer: Arc<dyn PromptRenderer>,
        domain: impl Into<String>,
        schema_context: impl Into<String>,
    ) -> Self {
        Self {
            inference,
            renderer,
            sanitizer: PlanSanitizer::new(),
            domain: domain.into(),
            schema_context: schema_context.into(),
        }
    }

    pub fn with_sanitizer(mut self, sanitizer: PlanSanitizer) -> Self {
        self.sanitizer = sanitizer;
        self
    }

    pub fn response_schema() -> ResponseSchema {
        ResponseSchema::Object {
            name: "plan",
            fields: vec![
                SchemaField::required("intent", FieldKind::String, "what the user wants to know")
                    .with_aliases(&["user_intent"]),
                SchemaField::required(
                    "instructions",
                    FieldKind::String,
                    "plain-language description of the data to retrieve",
                ),
                SchemaField::required(
                    "output_requirements",
                    FieldKind::StringList,
                    "information the answer must include",
                ),
                SchemaField::optional("sort_preference", FieldKind::String, "expected ordering")
                    .with_aliases(&["sorting_preference"]),
                SchemaField::optional("limit_preference", FieldKind::Scalar, "number of results"),
                SchemaField::optional("assumptions", FieldKind::StringList, "interpretations made"),
                SchemaField::optional("complexity", FieldKind::String, "low, medium or high"),
                SchemaField::optional(
                    "expects_results",
                    FieldKind::Boolean,
                    "false only if an empty answer is legitimate",
                ),
            ],
        }
    }

    fn to_plan(&self, raw: RawPlan) -> std::result::Result<PlanResult, InferenceError> {
        if raw.instructions.trim().is_empty() {
            return Err(InferenceError::SchemaViolation {
                schema: "plan".to_string(),
                reason: "instructions are empty".to_string(),
            });
        }

        let plan = PlanResult {
            intent: raw.intent.trim().to_string(),
            instructions: raw.instructions.trim().to_string(),
            output_requirements: raw
                .output_requirements
                .into_iter()
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty())
                .collect(),
            sort_preference: raw
                .sort_preference
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("none")),
            limit_preference: parse_limit(raw.limit_preference.as_ref()),
            assumptions: raw.assumptions,
            complexity: raw
                .complexity
                .as_deref()
                .map(Complexity::from_label)
                .unwrap_or_default(),
            expects_results: raw.expects_results,
        };

        Ok(self.sanitizer.sanitize_plan(plan))
    }
}

#[async_trait]
impl Planner for InferencePlanner {
    async fn plan(&self, question: &str) -> Result<PlanResult> {
        let prompt = self.renderer.render(
            TemplateId::Planner,
            &json!({
                "domain": self.domain,
                "question": question,
                "schema": self.schema_context,
            }),
        )?;

        let value = self
            .inference
            .infer(InferenceRequest {
                stage: StageKind::Planner,
                prompt,
                schema: Self::response_schema(),
            })
            .await?;

        let raw: RawPlan =
            serde_json::from_value(value).map_err(|e| InferenceError::SchemaViolation {
                schema: "plan".to_string(),
                reason: e.to_string(),
            })?;
        let plan = self.to_plan(raw)?;

        debug!(
            intent = %plan.intent,
            requirements = plan.output_requirements.len(),
            limit = ?plan.limit_preference,
            complexity = ?plan.complexity,
            "Plan generated"
        );
        Ok(plan)
    }
}
