//! Prompt templates per stage
//!
//! Templates are plain text with `{{ dotted.path }}` placeholders resolved against
//! a JSON context. A line containing only [`USER_SEPARATOR`] splits the template
//! into its system and user parts.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

use crate::capability::{PromptRenderer, RenderedPrompt};
use crate::error::{Result, TabulaError};

/// Line separating the system part of a template from the user part
pub const USER_SEPARATOR: &str = "=== USER ===";

/// Stage templates known to the renderer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TemplateId {
    Guardrail,
    Planner,
    QueryGeneration,
    Writer,
}

impl TemplateId {
    pub const ALL: [TemplateId; 4] = [
        TemplateId::Guardrail,
        TemplateId::Planner,
        TemplateId::QueryGeneration,
        TemplateId::Writer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateId::Guardrail => "guardrail",
            TemplateId::Planner => "planner",
            TemplateId::QueryGeneration => "query_generation",
            TemplateId::Writer => "writer",
        }
    }

    fn builtin(&self) -> &'static str {
        match self {
            TemplateId::Guardrail => include_str!("../templates/guardrail.txt"),
            TemplateId::Planner => include_str!("../templates/planner.txt"),
            TemplateId::QueryGeneration => include_str!("../templates/query_generation.txt"),
            TemplateId::Writer => include_str!("../templates/writer.txt"),
        }
    }
}

impl fmt::Display for TemplateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Template store with built-in defaults
#[derive(Debug, Clone)]
pub struct TemplateRenderer {
    templates: HashMap<TemplateId, String>,
}

impl TemplateRenderer {
    pub fn new() -> Self {
        let templates = TemplateId::ALL
            .iter()
            .map(|id| (*id, id.builtin().to_string()))
            .collect();
        Self { templates }
    }

    /// Replace one template
    pub fn with_template(mut self, id: TemplateId, template: impl Into<String>) -> Self {
        self.templates.insert(id, template.into());
        self
    }

    pub fn get_template(&self, id: TemplateId) -> Option<&str> {
        self.templates.get(&id).map(String::as_str)
    }
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptRenderer for TemplateRenderer {
    fn render(&self, template: TemplateId, context: &Value) -> Result<RenderedPrompt> {
        let source = self
            .get_template(template)
            .ok_or_else(|| TabulaError::Template(format!("no template registered for `{}`", template)))?;

        let rendered = render_placeholders(source, |token| {
            let path: Vec<&str> = token.split('.').collect();
            resolve_json_path(context, &path)
                .map(value_to_text)
                .ok_or_else(|| {
                    TabulaError::Template(format!(
                        "template `{}` references missing value `{}`",
                        template, token
                    ))
                })
        })?;

        Ok(split_prompt(&rendered))
    }
}

fn resolve_json_path<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut current = value;
    for segment in path {
        current = current.as_object()?.get(*segment)?;
    }
    Some(current)
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Array(items) => items
            .iter()
            .map(|item| format!("- {}", value_to_text(item)))
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

fn render_placeholders<F>(template: &str, mut resolve: F) -> Result<String>
where
    F: FnMut(&str) -> Result<String>,
{
    let mut rendered = String::with_capacity(template.len());
    let mut cursor = template;

    while let Some(start) = cursor.find("{{") {
        rendered.push_str(&cursor[..start]);
        let after_open = &cursor[start + 2..];
        let Some(close_offset) = after_open.find("}}") else {
            return Err(TabulaError::Template(
                "unclosed placeholder in template".to_string(),
            ));
        };
        let token = after_open[..close_offset].trim();
        if token.is_empty() {
            return Err(TabulaError::Template(
                "empty placeholder in template".to_string(),
            ));
        }
        rendered.push_str(&resolve(token)?);
        cursor = &after_open[close_offset + 2..];
    }

    rendered.push_str(cursor);
    Ok(rendered)
}

fn split_prompt(rendered: &str) -> RenderedPrompt {
    let mut system = Vec::new();
    let mut user = Vec::new();
    let mut in_user = false;

    for line in rendered.lines() {
        if !in_user && line.trim() == USER_SEPARATOR {
            in_user = true;
            continue;
        }
        if in_user {
            user.push(line);
        } else {
            system.push(line);
        }
    }

    RenderedPrompt {
        system: system.join("\n").trim().to_string(),
        user: user.join("\n").trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtin_templates_have_both_parts() {
        let renderer = TemplateRenderer::new();
        for id in TemplateId::ALL {
            let source = renderer.get_template(id).unwrap();
            assert!(
                source.lines().any(|line| line.trim() == USER_SEPARATOR),
                "{} has no user section",
                id
            );
        }
    }

    #[test]
    fn test_render_resolves_nested_paths() {
        let renderer = TemplateRenderer::new().with_template(
            TemplateId::Writer,
            "You answer about {{ domain }}.\n=== USER ===\nIntent: {{plan.intent}}\n{{ plan.needs }}",
        );
        let prompt = renderer
            .render(
                TemplateId::Writer,
                &json!({
                    "domain": "sales",
                    "plan": {"intent": "rank regions", "needs": ["region", "total"]}
                }),
            )
            .unwrap();

        assert_eq!(prompt.system, "You answer about sales.");
        assert_eq!(prompt.user, "Intent: rank regions\n- region\n- total");
    }

    #[test]
    fn test_missing_value_is_template_error() {
        let renderer =
            TemplateRenderer::new().with_template(TemplateId::Planner, "{{ question }} {{ nope }}");
        let err = renderer
            .render(TemplateId::Planner, &json!({"question": "q"}))
            .unwrap_err();
        assert!(matches!(err, TabulaError::Template(ref msg) if msg.contains("nope")));
    }

    #[test]
    fn test_unclosed_placeholder() {
        let renderer = TemplateRenderer::new().with_template(TemplateId::Planner, "hello {{ world");
        assert!(renderer.render(TemplateId::Planner, &json!({})).is_err());
    }

    #[test]
    fn test_without_separator_everything_is_system() {
        let prompt = split_prompt("line one\nline two");
        assert_eq!(prompt.system, "line one\nline two");
        assert!(prompt.user.is_empty());
    }
}
