//! External capabilities the workflow depends on
//!
//! The engine never talks to a model provider, a database or a template store
//! directly. Each is reached through one of the traits below so deployments and
//! tests can substitute their own implementations.

use async_trait::async_trait;
use serde_json::Value;
use std::fmt::Debug;

use crate::error::{ExecutionError, InferenceError, Result};
use crate::prompts::TemplateId;
use crate::types::{RowSet, StageKind};

/// A prompt split into its system and user parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPrompt {
    pub system: String,
    pub user: String,
}

/// Expected JSON type of a response field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Boolean,
    StringList,
    /// Number or string; coerced by the stage
    Scalar,
}

impl FieldKind {
    fn matches(&self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::StringList => value
                .as_array()
                .map(|items| items.iter().all(Value::is_string))
                .unwrap_or(false),
            FieldKind::Scalar => value.is_string() || value.is_number(),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Boolean => "boolean",
            FieldKind::StringList => "array of strings",
            FieldKind::Scalar => "number or string",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaField {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
    pub description: &'static str,
    /// Alternate keys a provider may use for this field
    pub aliases: &'static [&'static str],
}

impl SchemaField {
    pub const fn required(name: &'static str, kind: FieldKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            required: true,
            description,
            aliases: &[],
        }
    }

    pub const fn optional(name: &'static str, kind: FieldKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            required: false,
            description,
            aliases: &[],
        }
    }

    pub fn with_aliases(mut self, aliases: &'static [&'static str]) -> Self {
        self.aliases = aliases;
        self
    }

    fn lookup<'a>(&self, object: &'a serde_json::Map<String, Value>) -> Option<&'a Value> {
        std::iter::once(self.name)
            .chain(self.aliases.iter().copied())
            .filter_map(|key| object.get(key))
            .find(|value| !value.is_null())
    }
}

/// Shape an inference response must have
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseSchema {
    /// A JSON object with the listed fields. Nulls count as absent.
    Object {
        name: &'static str,
        fields: Vec<SchemaField>,
    },
    /// Free text, returned as a JSON string
    Text,
}

impl ResponseSchema {
    pub fn name(&self) -> &str {
        match self {
            ResponseSchema::Object { name, .. } => name,
            ResponseSchema::Text => "text",
        }
    }

    pub fn expects_json(&self) -> bool {
        matches!(self, ResponseSchema::Object { .. })
    }

    /// Check `value` against the schema
    pub fn validate(&self, value: &Value) -> std::result::Result<(), InferenceError> {
        match self {
            ResponseSchema::Text => match value.as_str() {
                Some(text) if !text.trim().is_empty() => Ok(()),
                Some(_) => Err(InferenceError::EmptyResponse),
                None => Err(self.violation("expected a text response")),
            },
            ResponseSchema::Object { fields, .. } => {
                let object = value
                    .as_object()
                    .ok_or_else(|| self.violation("expected a JSON object"))?;

                for field in fields {
                    match field.lookup(object) {
                        None if field.required => {
                            return Err(
                                self.violation(format!("missing required field `{}`", field.name))
                            );
                        }
                        None => {}
                        Some(found) if !field.kind.matches(found) => {
                            return Err(self.violation(format!(
                                "field `{}` must be a {}",
                                field.name,
                                field.kind.label()
                            )));
                        }
                        Some(_) => {}
                    }
                }
                Ok(())
            }
        }
    }

    /// Human-readable description appended to prompts by inference backends
    pub fn describe(&self) -> String {
        match self {
            ResponseSchema::Text => "Respond with plain text only.".to_string(),
            ResponseSchema::Object { fields, .. } => {
                let mut out = String::from(
                    "Respond with a single JSON object and nothing else. Fields:\n",
                );
                for field in fields {
                    out.push_str(&format!(
                        "- \"{}\" ({}{}): {}\n",
                        field.name,
                        field.kind.label(),
                        if field.required { ", required" } else { ", optional" },
                        field.description
                    ));
                }
                out
            }
        }
    }

    fn violation(&self, reason: impl Into<String>) -> InferenceError {
        InferenceError::SchemaViolation {
            schema: self.name().to_string(),
            reason: reason.into(),
        }
    }
}

/// One structured inference call
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub stage: StageKind,
    pub prompt: RenderedPrompt,
    pub schema: ResponseSchema,
}

/// Calls a language model and returns a value conforming to the request schema
#[async_trait]
pub trait InferenceCapability: Send + Sync + Debug {
    /// Fails with `InferenceError` on transport failure, timeout or a response
    /// that cannot be coerced to the schema
    async fn infer(&self, request: InferenceRequest) -> std::result::Result<Value, InferenceError>;
}

/// Runs a read-only statement against the dataset
#[async_trait]
pub trait QueryExecutor: Send + Sync + Debug {
    async fn execute(&self, statement: &str) -> std::result::Result<RowSet, ExecutionError>;
}

/// Produces the prompt for a stage from a JSON context
pub trait PromptRenderer: Send + Sync + Debug {
    fn render(&self, template: TemplateId, context: &Value) -> Result<RenderedPrompt>;
}
