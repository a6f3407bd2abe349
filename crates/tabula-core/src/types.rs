//! Core types for Tabula
//!
//! The values each stage produces, plus the phase enum the orchestrator's state
//! machine moves through.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Workflow phase. Terminal phases end the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Start,
    Guardrail,
    Planning,
    Querying,
    Validating,
    Retry,
    Writing,
    Done,
    Blocked,
    Exhausted,
    Failed,
    Cancelled,
}

impl Phase {
    pub fn can_transition_to(self, next: Phase) -> bool {
        use Phase::*;
        match (self, next) {
            (_, Failed) | (_, Cancelled) => !self.is_terminal(),
            (Start, Guardrail) => true,
            (Guardrail, Blocked) | (Guardrail, Planning) => true,
            (Planning, Querying) => true,
            (Querying, Validating) => true,
            (Validating, Writing) | (Validating, Retry) | (Validating, Exhausted) => true,
            (Retry, Querying) => true,
            (Writing, Done) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Phase::Done | Phase::Blocked | Phase::Exhausted | Phase::Failed | Phase::Cancelled
        )
    }

    /// Reason recorded when the pipeline ends in this phase without an answer
    pub fn terminated_reason(self) -> Option<TerminatedReason> {
        match self {
            Phase::Blocked => Some(TerminatedReason::Blocked),
            Phase::Exhausted => Some(TerminatedReason::MaxRetriesExhausted),
            Phase::Failed => Some(TerminatedReason::FatalError),
            Phase::Cancelled => Some(TerminatedReason::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Phase::Start => "start",
            Phase::Guardrail => "guardrail",
            Phase::Planning => "planning",
            Phase::Querying => "querying",
            Phase::Validating => "validating",
            Phase::Retry => "retry",
            Phase::Writing => "writing",
            Phase::Done => "done",
            Phase::Blocked => "blocked",
            Phase::Exhausted => "exhausted",
            Phase::Failed => "failed",
            Phase::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Why a pipeline ended without reaching the Writer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminatedReason {
    Blocked,
    MaxRetriesExhausted,
    FatalError,
    Cancelled,
}

/// The stage issuing an inference call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Guardrail,
    Planner,
    Query,
    Writer,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StageKind::Guardrail => "guardrail",
            StageKind::Planner => "planner",
            StageKind::Query => "query",
            StageKind::Writer => "writer",
        };
        f.write_str(label)
    }
}

/// Guardrail classification of a question
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailCategory {
    OnTopic,
    OffTopic,
    PromptInjection,
    SqlInjection,
    MedicalAdvice,
    PersonalData,
    Harmful,
    Empty,
}

impl GuardrailCategory {
    /// Lenient parse of a model-provided category label
    pub fn from_label(label: &str) -> Option<Self> {
        let normalized = label.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "on_topic" | "relevant" | "allowed" | "valid" => Some(Self::OnTopic),
            "off_topic" | "irrelevant" | "unrelated" => Some(Self::OffTopic),
            "prompt_injection" | "injection" | "jailbreak" | "instruction_override" => {
                Some(Self::PromptInjection)
            }
            "sql_injection" | "data_manipulation" => Some(Self::SqlInjection),
            "medical_advice" | "medical" => Some(Self::MedicalAdvice),
            "personal_data" | "pii" | "privacy" | "restricted_data" => Some(Self::PersonalData),
            "harmful" | "harmful_content" | "unsafe" => Some(Self::Harmful),
            "empty" | "empty_query" => Some(Self::Empty),
            _ => None,
        }
    }
}

/// Outcome of the guardrail stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailVerdict {
    pub allowed: bool,

    /// User-displayable explanation; empty when allowed
    pub reason: String,

    pub category: GuardrailCategory,
}

impl GuardrailVerdict {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: String::new(),
            category: GuardrailCategory::OnTopic,
        }
    }

    pub fn block(category: GuardrailCategory, reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            category,
        }
    }
}

/// Estimated difficulty of a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Low,
    #[default]
    Medium,
    High,
}

impl Complexity {
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "low" | "simple" | "easy" => Complexity::Low,
            "high" | "complex" | "hard" => Complexity::High,
            _ => Complexity::Medium,
        }
    }
}

/// Schema-free description of what data answers the question
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanResult {
    pub intent: String,
    pub instructions: String,
    pub output_requirements: Vec<String>,
    pub sort_preference: Option<String>,
    pub limit_preference: Option<u32>,
    pub assumptions: Vec<String>,
    pub complexity: Complexity,

    /// Whether an empty result would be a wrong answer
    pub expects_results: bool,
}

/// One result row, positionally aligned with the column list
pub type Row = Vec<Value>;

/// Columns and rows returned by the execution capability
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,

    /// Set when the engine stopped reading at the configured row cap
    #[serde(default)]
    pub truncated: bool,
}

/// Output of one Query Stage attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub statement: String,
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    pub truncated: bool,

    /// Execution failure carried forward as a validation input
    pub execution_error: Option<String>,
}

impl QueryResult {
    pub fn success(statement: impl Into<String>, row_set: RowSet) -> Self {
        Self {
            statement: statement.into(),
            columns: row_set.columns,
            rows: row_set.rows,
            truncated: row_set.truncated,
            execution_error: None,
        }
    }

    pub fn failed(statement: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            statement: statement.into(),
            columns: Vec::new(),
            rows: Vec::new(),
            truncated: false,
            execution_error: Some(error.into()),
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn succeeded(&self) -> bool {
        self.execution_error.is_none()
    }
}

/// The previous attempt handed back to the Query Stage on retry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorAttempt {
    pub statement: String,
    pub issues: Vec<String>,
}

/// Validator verdict on one attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// In [0, 1]
    pub confidence: f64,
    pub is_acceptable: bool,
    pub issues: Vec<String>,

    /// True when at least one issue is disqualifying regardless of confidence
    pub hard_failure: bool,
}

/// Position within the attempt budget, passed to the Query Stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptBudget {
    /// Zero-based index of the current attempt
    pub attempt: u32,
    pub max_attempts: u32,
}

impl AttemptBudget {
    pub fn new(attempt: u32, max_attempts: u32) -> Self {
        Self {
            attempt,
            max_attempts,
        }
    }

    /// No retry can follow this attempt
    pub fn is_final(&self) -> bool {
        self.attempt.saturating_add(1) >= self.max_attempts
    }
}

/// How the Writer should frame its answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// The result passed validation
    Confident,
    /// The attempt budget ran out; answer from the last attempt with caveats
    BestEffort,
}
