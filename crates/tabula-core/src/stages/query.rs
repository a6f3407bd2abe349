//! Query stage: statement generation and execution
//!
//! The model turns a plan into one read-only statement, which is cleaned up,
//! checked and handed to the [`QueryExecutor`]. Execution failures become part of
//! the [`QueryResult`] so the Validator can reject them and the next attempt can
//! see what went wrong. On the final attempt there is no next attempt, so the
//! failure propagates instead.

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

use super::QueryGenerator;
use crate::capability::{
    FieldKind, InferenceCapability, InferenceRequest, PromptRenderer, QueryExecutor,
    ResponseSchema, SchemaField,
};
use crate::error::{ExecutionError, InferenceError, Result, TabulaError};
use crate::prompts::TemplateId;
use crate::types::{AttemptBudget, PlanResult, PriorAttempt, QueryResult, StageKind};

const DIALECT: &str = "SQLite";

lazy_static! {
    static ref CODE_FENCE: Regex = Regex::new(r"(?s)^```[A-Za-z0-9_-]*\s*(.*?)\s*```$").unwrap();
    static ref LEADING_KEYWORD: Regex = Regex::new(r"(?i)^(select|with)\b").unwrap();
}

/// Strip markdown fences, surrounding whitespace and trailing semicolons
pub fn normalize_statement(raw: &str) -> String {
    let trimmed = raw.trim();
    let unfenced = CODE_FENCE
        .captures(trimmed)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
        .unwrap_or(trimmed);
    unfenced
        .trim()
        .trim_end_matches(|c: char| c == ';' || c.is_whitespace())
        .to_string()
}

/// Accept only a single SELECT or WITH statement
pub fn ensure_read_only(statement: &str) -> std::result::Result<(), ExecutionError> {
    if statement.trim().is_empty() {
        return Err(ExecutionError::Unsafe(
            "no statement was generated".to_string(),
        ));
    }
    if has_statement_separator(statement) {
        return Err(ExecutionError::Unsafe(
            "multiple statements are not allowed".to_string(),
        ));
    }
    if !LEADING_KEYWORD.is_match(statement.trim_start()) {
        return Err(ExecutionError::Unsafe(
            "only SELECT or WITH queries are allowed".to_string(),
        ));
    }
    Ok(())
}

/// True if a `;` appears outside string literals, quoted identifiers and comments
fn has_statement_separator(statement: &str) -> bool {
    #[derive(PartialEq)]
    enum Scan {
        Code,
        Single,
        Double,
        LineComment,
        BlockComment,
    }

    let chars: Vec<char> = statement.chars().collect();
    let mut state = Scan::Code;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match state {
            Scan::Code => match c {
                ';' => return true,
                '\'' => state = Scan::Single,
                '"' => state = Scan::Double,
                '-' if next == Some('-') => {
                    state = Scan::LineComment;
                    i += 1;
                }
                '/' if next == Some('*') => {
                    state = Scan::BlockComment;
                    i += 1;
                }
                _ => {}
            },
            Scan::Single if c == '\'' => state = Scan::Code,
            Scan::Double if c == '"' => state = Scan::Code,
            Scan::LineComment if c == '\n' => state = Scan::Code,
            Scan::BlockComment if c == '*' && next == Some('/') => {
                state = Scan::Code;
                i += 1;
            }
            _ => {}
        }
        i += 1;
    }
    false
}

fn retry_context(prior: Option<&PriorAttempt>) -> String {
    let Some(prior) = prior else {
        return String::new();
    };
    let mut out = String::from("\nA previous attempt was rejected.\nPrevious statement:\n");
    out.push_str(&prior.statement);
    out.push_str("\nProblems found:\n");
    for issue in &prior.issues {
        out.push_str("- ");
        out.push_str(issue);
        out.push('\n');
    }
    out.push_str("Write a corrected statement that fixes these problems.");
    out
}

#[derive(Debug, Deserialize)]
struct RawStatement {
    #[serde(alias = "statement", alias = "query")]
    sql_query: String,
    #[serde(default)]
    reasoning: Option<String>,
}

/// Query stage backed by the inference and execution capabilities
#[derive(Debug, Clone)]
pub struct InferenceQueryGenerator {
    inference: Arc<dyn InferenceCapability>,
    renderer: Arc<dyn PromptRenderer>,
    executor: Arc<dyn QueryExecutor>,
    schema_context: String,
}

impl InferenceQueryGenerator {
    pub fn new(
        inference: Arc<dyn InferenceCapability>,
        renderer: Arc<dyn PromptRenderer>,
        executor: Arc<dyn QueryExecutor>,
        schema_context: impl Into<String>,
    ) -> Self {
        Self {
            inference,
            renderer,
            executor,
            schema_context: schema_context.into(),
        }
    }

    pub fn response_schema() -> ResponseSchema {
        ResponseSchema::Object {
            name: "statement",
            fields: vec![
                SchemaField::required("sql_query", FieldKind::String, "the read-only statement")
                    .with_aliases(&["statement", "query"]),
                SchemaField::optional("reasoning", FieldKind::String, "short explanation"),
            ],
        }
    }

    async fn generate(
        &self,
        plan: &PlanResult,
        prior_attempt: Option<&PriorAttempt>,
    ) -> Result<String> {
        let prompt = self.renderer.render(
            TemplateId::QueryGeneration,
            &json!({
                "dialect": DIALECT,
                "schema": self.schema_context,
                "plan": {
                    "intent": plan.intent,
                    "instructions": plan.instructions,
                    "output_requirements": plan.output_requirements,
                    "sort_preference": plan.sort_preference.as_deref().unwrap_or("none"),
                    "limit_preference": plan
                        .limit_preference
                        .map(|l| l.to_string())
                        .unwrap_or_else(|| "none".to_string()),
                },
                "retry_context": retry_context(prior_attempt),
            }),
        )?;

        let value = self
            .inference
            .infer(InferenceRequest {
                stage: StageKind::Query,
                prompt,
                schema: Self::response_schema(),
            })
            .await?;

        let raw: RawStatement =
            serde_json::from_value(value).map_err(|e| InferenceError::SchemaViolation {
                schema: "statement".to_string(),
                reason: e.to_string(),
            })?;
        if let Some(reasoning) = raw.reasoning.as_deref() {
            debug!(reasoning, "Statement rationale");
        }
        Ok(normalize_statement(&raw.sql_query))
    }
}

#[async_trait]
impl QueryGenerator for InferenceQueryGenerator {
    async fn generate_and_execute(
        &self,
        plan: &PlanResult,
        prior_attempt: Option<&PriorAttempt>,
        budget: AttemptBudget,
    ) -> Result<QueryResult> {
        let statement = self.generate(plan, prior_attempt).await?;
        debug!(attempt = budget.attempt, %statement, "Statement generated");

        let outcome = match ensure_read_only(&statement) {
            Ok(()) => self.executor.execute(&statement).await,
            Err(rejected) => Err(rejected),
        };

        match outcome {
            Ok(rows) => {
                debug!(
                    rows = rows.rows.len(),
                    columns = rows.columns.len(),
                    truncated = rows.truncated,
                    "Statement executed"
                );
                Ok(QueryResult::success(statement, rows))
            }
            Err(err) if budget.is_final() => Err(TabulaError::from(err).context(format!(
                "query attempt {} of {}",
                budget.attempt + 1,
                budget.max_attempts
            ))),
            Err(err) => {
                warn!(attempt = budget.attempt, error = %err, "Statement failed, handing error to validation");
                Ok(QueryResult::failed(statement, err.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompts::TemplateRenderer;
    use crate::types::{Complexity, RowSet};
    use serde_json::Value;
    use std::sync::Mutex;

    #[derive(Debug)]
    struct StatementInference {
        statement: String,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl InferenceCapability for StatementInference {
        async fn infer(
            &self,
            request: InferenceRequest,
        ) -> std::result::Result<Value, InferenceError> {
            self.prompts.lock().unwrap().push(request.prompt.user.clone());
            Ok(json!({ "sql_query": self.statement }))
        }
    }

    #[derive(Debug)]
    struct FailingExecutor;

    #[async_trait]
    impl QueryExecutor for FailingExecutor {
        async fn execute(&self, _statement: &str) -> std::result::Result<RowSet, ExecutionError> {
            Err(ExecutionError::Syntax("no such column: revenue".to_string()))
        }
    }

    #[derive(Debug)]
    struct OneRowExecutor;

    #[async_trait]
    impl QueryExecutor for OneRowExecutor {
        async fn execute(&self, _statement: &str) -> std::result::Result<RowSet, ExecutionError> {
            Ok(RowSet {
                columns: vec!["region".to_string()],
                rows: vec![vec![json!("North")]],
                truncated: false,
            })
        }
    }

    fn plan() -> PlanResult {
        PlanResult {
            intent: "list regions".to_string(),
            instructions: "List every region".to_string(),
            output_requirements: vec!["region".to_string()],
            sort_preference: None,
            limit_preference: None,
            assumptions: Vec::new(),
            complexity: Complexity::Low,
            expects_results: true,
        }
    }

    fn stage(
        statement: &str,
        executor: Arc<dyn QueryExecutor>,
    ) -> (InferenceQueryGenerator, Arc<StatementInference>) {
        let inference = Arc::new(StatementInference {
            statement: statement.to_string(),
            prompts: Mutex::new(Vec::new()),
        });
        let stage = InferenceQueryGenerator::new(
            inference.clone(),
            Arc::new(TemplateRenderer::new()),
            executor,
            "regions(name)",
        );
        (stage, inference)
    }

    #[test]
    fn test_normalize_statement() {
        assert_eq!(
            normalize_statement("```sql\nSELECT * FROM sales;\n```"),
            "SELECT * FROM sales"
        );
        assert_eq!(normalize_statement("  select 1 ;; "), "select 1");
    }

    #[test]
    fn test_ensure_read_only() {
        assert!(ensure_read_only("SELECT * FROM t").is_ok());
        assert!(ensure_read_only("with x as (select 1) select * from x").is_ok());
        assert!(ensure_read_only("SELECT ';' AS sep").is_ok());
        assert!(ensure_read_only("SELECT 1 -- trailing; comment").is_ok());

        assert!(ensure_read_only("DELETE FROM t").is_err());
        assert!(ensure_read_only("SELECT 1; DROP TABLE t").is_err());
        assert!(ensure_read_only("").is_err());
    }

    #[tokio::test]
    async fn test_success_carries_rows() {
        let (stage, _) = stage("SELECT name AS region FROM regions", Arc::new(OneRowExecutor));
        let result = stage
            .generate_and_execute(&plan(), None, AttemptBudget::new(0, 3))
            .await
            .unwrap();
        assert!(result.succeeded());
        assert_eq!(result.row_count(), 1);
        assert_eq!(result.statement, "SELECT name AS region FROM regions");
    }

    #[tokio::test]
    async fn test_execution_error_captured_before_final_attempt() {
        let (stage, _) = stage("SELECT revenue FROM regions", Arc::new(FailingExecutor));
        let result = stage
            .generate_and_execute(&plan(), None, AttemptBudget::new(1, 3))
            .await
            .unwrap();
        assert!(!result.succeeded());
        assert!(result.execution_error.unwrap().contains("revenue"));
    }

    #[tokio::test]
    async fn test_execution_error_propagates_on_final_attempt() {
        let (stage, _) = stage("SELECT revenue FROM regions", Arc::new(FailingExecutor));
        let err = stage
            .generate_and_execute(&plan(), None, AttemptBudget::new(2, 3))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "execution");
    }

    #[tokio::test]
    async fn test_unsafe_statement_never_reaches_executor() {
        let (stage, _) = stage("DROP TABLE regions", Arc::new(OneRowExecutor));
        let result = stage
            .generate_and_execute(&plan(), None, AttemptBudget::new(0, 3))
            .await
            .unwrap();
        assert!(result.execution_error.unwrap().contains("only SELECT or WITH"));
    }

    #[tokio::test]
    async fn test_retry_prompt_includes_prior_attempt() {
        let (stage, inference) = stage("SELECT name FROM regions", Arc::new(OneRowExecutor));
        let prior = PriorAttempt {
            statement: "SELECT revenue FROM regions".to_string(),
            issues: vec!["no such column: revenue".to_string()],
        };
        stage
            .generate_and_execute(&plan(), Some(&prior), AttemptBudget::new(1, 3))
            .await
            .unwrap();

        let prompts = inference.prompts.lock().unwrap();
        assert!(prompts[0].contains("SELECT revenue FROM regions"));
        assert!(prompts[0].contains("- no such column: revenue"));
    }
}
