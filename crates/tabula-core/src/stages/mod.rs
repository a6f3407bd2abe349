//! Pipeline stages
//!
//! Each stage is a trait so the orchestrator can be assembled from any mix of
//! inference-backed and scripted implementations. Stages receive only the data
//! they need and return typed results; none of them touches the workflow state.

pub mod guardrail;
pub mod planner;
pub mod query;
pub mod sanitize;
pub mod validator;
pub mod writer;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{
    AttemptBudget, GuardrailVerdict, PlanResult, PriorAttempt, QueryResult, ValidationResult,
    WriteMode,
};

pub use guardrail::InferenceGuardrail;
pub use planner::InferencePlanner;
pub use query::InferenceQueryGenerator;
pub use validator::RuleValidator;
pub use writer::InferenceWriter;

/// Classifies a question as allowed or blocked
#[async_trait]
pub trait Guardrail: Send + Sync {
    async fn evaluate(&self, question: &str) -> Result<GuardrailVerdict>;
}

/// Turns a question into a schema-free plan
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, question: &str) -> Result<PlanResult>;
}

/// Generates a statement for a plan and runs it
#[async_trait]
pub trait QueryGenerator: Send + Sync {
    /// Execution failures are returned inside the result so they can be
    /// validated and retried, except on the final attempt where they propagate.
    async fn generate_and_execute(
        &self,
        plan: &PlanResult,
        prior_attempt: Option<&PriorAttempt>,
        budget: AttemptBudget,
    ) -> Result<QueryResult>;
}

/// Scores a result against its plan
pub trait Validator: Send + Sync {
    fn validate(&self, plan: &PlanResult, result: &QueryResult) -> ValidationResult;
}

/// Everything the Writer may see
#[derive(Debug, Clone, Copy)]
pub struct WriteRequest<'a> {
    pub question: &'a str,
    pub plan: &'a PlanResult,
    pub result: &'a QueryResult,
    pub validation: &'a ValidationResult,
    pub mode: WriteMode,
}

/// Composes the user-facing answer
#[async_trait]
pub trait Writer: Send + Sync {
    async fn write(&self, request: WriteRequest<'_>) -> Result<String>;
}
