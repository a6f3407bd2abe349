//! Writer stage

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

use super::{WriteRequest, Writer};
use crate::capability::{InferenceCapability, InferenceRequest, PromptRenderer, ResponseSchema};
use crate::error::{InferenceError, Result};
use crate::prompts::TemplateId;
use crate::types::{Row, StageKind, WriteMode};

fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.replace('|', "\\|").replace('\n', " "),
        other => other.to_string(),
    }
}

/// Render rows as a markdown table, keeping at most `max_rows` rows
pub fn format_rows_markdown(columns: &[String], rows: &[Row], max_rows: usize) -> String {
    if columns.is_empty() {
        return "(no columns)".to_string();
    }
    if rows.is_empty() {
        return "(no rows)".to_string();
    }

    let header: Vec<String> = columns.iter().map(|c| c.replace('|', "\\|")).collect();
    let mut out = format!("| {} |\n", header.join(" | "));
    out.push_str(&format!("|{}\n", " --- |".repeat(columns.len())));

    for row in rows.iter().take(max_rows) {
        let cells: Vec<String> = (0..columns.len())
            .map(|idx| row.get(idx).map(cell_text).unwrap_or_default())
            .collect();
        out.push_str(&format!("| {} |\n", cells.join(" | ")));
    }

    if rows.len() > max_rows {
        out.push_str(&format!("… and {} more rows\n", rows.len() - max_rows));
    }
    out.trim_end().to_string()
}

/// Writer backed by the inference capability
#[derive(Debug, Clone)]
pub struct InferenceWriter {
    inference: Arc<dyn InferenceCapability>,
    renderer: Arc<dyn PromptRenderer>,
    domain: String,
    max_rows: usize,
}

impl InferenceWriter {
    pub fn new(
        inference: Arc<dyn InferenceCapability>,
        renderer: Arc<dyn PromptRenderer>,
        domain: impl Into<String>,
        max_rows: usize,
    ) -> Self {
        Self {
            inference,
            renderer,
            domain: domain.into(),
            max_rows: max_rows.max(1),
        }
    }

    fn context(&self, request: &WriteRequest<'_>) -> Value {
        let result = request.result;
        let table = format_rows_markdown(&result.columns, &result.rows, self.max_rows);

        let truncation_note = if result.truncated {
            "The data was cut off at the row cap; say that the list may be incomplete."
        } else {
            ""
        };

        let validation_notes = if request.validation.issues.is_empty() {
            String::new()
        } else {
            let mut notes = String::from("Known limitations of this data:\n");
            for issue in &request.validation.issues {
                notes.push_str(&format!("- {}\n", issue));
            }
            notes
        };

        let mode_note = match request.mode {
            WriteMode::Confident => "",
            WriteMode::BestEffort => {
                "This data could not be fully verified against the question. Answer as well as the data allows and say plainly what may be missing or uncertain."
            }
        };

        json!({
            "domain": self.domain,
            "question": request.question,
            "intent": request.plan.intent,
            "row_count": result.rows.len(),
            "table": table,
            "truncation_note": truncation_note,
            "validation_notes": validation_notes,
            "mode_note": mode_note,
        })
    }
}

#[async_trait]
impl Writer for InferenceWriter {
    async fn write(&self, request: WriteRequest<'_>) -> Result<String> {
        let prompt = self
            .renderer
            .render(TemplateId::Writer, &self.context(&request))?;

        let value = self
            .inference
            .infer(InferenceRequest {
                stage: StageKind::Writer,
                prompt,
                schema: ResponseSchema::Text,
            })
            .await?;

        let text = value
            .as_str()
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .ok_or(InferenceError::EmptyResponse)?;

        debug!(chars = text.len(), mode = ?request.mode, "Answer written");
        Ok(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompts::TemplateRenderer;
    use crate::types::{Complexity, PlanResult, QueryResult, RowSet, ValidationResult};
    use std::sync::Mutex;

    #[derive(Debug)]
    struct EchoInference {
        reply: Value,
        last_user_prompt: Mutex<Option<String>>,
    }

    #[async_trait]
    impl InferenceCapability for EchoInference {
        async fn infer(
            &self,
            request: InferenceRequest,
        ) -> std::result::Result<Value, InferenceError> {
            assert_eq!(request.schema, ResponseSchema::Text);
            *self.last_user_prompt.lock().unwrap() = Some(request.prompt.user);
            Ok(self.reply.clone())
        }
    }

    fn plan() -> PlanResult {
        PlanResult {
            intent: "find the top region".to_string(),
            instructions: "total sales per region".to_string(),
            output_requirements: vec!["region".to_string()],
            sort_preference: None,
            limit_preference: None,
            assumptions: Vec::new(),
            complexity: Complexity::Low,
            expects_results: true,
        }
    }

    #[test]
    fn test_format_rows_markdown_caps_rows() {
        let columns = vec!["region".to_string(), "total".to_string()];
        let rows: Vec<Row> = (0..5)
            .map(|i| vec![json!(format!("R{}", i)), json!(i * 10)])
            .collect();

        let table = format_rows_markdown(&columns, &rows, 2);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines[0], "| region | total |");
        assert_eq!(lines[1], "| --- | --- |");
        assert_eq!(lines[2], "| R0 | 0 |");
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[4], "… and 3 more rows");
    }

    #[test]
    fn test_format_rows_escapes_pipes_and_nulls() {
        let table = format_rows_markdown(
            &["name".to_string(), "note".to_string()],
            &[vec![json!("a|b"), Value::Null]],
            10,
        );
        assert!(table.contains("| a\\|b |  |"));
    }

    #[tokio::test]
    async fn test_write_returns_trimmed_text() {
        let inference = Arc::new(EchoInference {
            reply: json!("  North leads with 300 units.  "),
            last_user_prompt: Mutex::new(None),
        });
        let writer =
            InferenceWriter::new(inference.clone(), Arc::new(TemplateRenderer::new()), "sales", 10);
        let result = QueryResult::success(
            "SELECT region, total FROM t",
            RowSet {
                columns: vec!["region".to_string(), "total".to_string()],
                rows: vec![vec![json!("North"), json!(300)]],
                truncated: false,
            },
        );
        let validation = ValidationResult {
            confidence: 0.9,
            is_acceptable: true,
            issues: vec!["no column appears to provide \"growth\"".to_string()],
            hard_failure: false,
        };

        let answer = writer
            .write(WriteRequest {
                question: "Which region sold most?",
                plan: &plan(),
                result: &result,
                validation: &validation,
                mode: WriteMode::Confident,
            })
            .await
            .unwrap();

        assert_eq!(answer, "North leads with 300 units.");
        let prompt = inference.last_user_prompt.lock().unwrap().clone().unwrap();
        assert!(prompt.contains("Which region sold most?"));
        assert!(prompt.contains("| North | 300 |"));
        assert!(prompt.contains("growth"));
        assert!(!prompt.contains("SELECT"));
    }

    #[tokio::test]
    async fn test_blank_answer_is_error() {
        let inference = Arc::new(EchoInference {
            reply: json!("   "),
            last_user_prompt: Mutex::new(None),
        });
        let writer = InferenceWriter::new(inference, Arc::new(TemplateRenderer::new()), "sales", 10);
        let result = QueryResult::success("SELECT 1", RowSet::default());
        let validation = ValidationResult {
            confidence: 1.0,
            is_acceptable: true,
            issues: Vec::new(),
            hard_failure: false,
        };

        let err = writer
            .write(WriteRequest {
                question: "q",
                plan: &plan(),
                result: &result,
                validation: &validation,
                mode: WriteMode::BestEffort,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "inference");
    }
}
