//! Per-question workflow state
//!
//! A [`WorkflowState`] is created for each question and owned by the orchestrator
//! for the lifetime of the pipeline. Stages never see it mutably: they receive the
//! fields they need and return typed results, which the orchestrator records here.
//! Observers and the details API get a shared reference or a [`WorkflowDetails`]
//! snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, TabulaError};
use crate::types::{
    GuardrailVerdict, Phase, PlanResult, PriorAttempt, QueryResult, TerminatedReason,
    ValidationResult,
};

/// Returned when the attempt budget runs out under the explicit-failure policy
pub const EXHAUSTED_MESSAGE: &str = "I couldn't produce an answer I'm confident in for that question. \
Try rephrasing it or narrowing it down, for example to a specific period, product or region.";

/// Returned for any unrecoverable capability or engine failure
pub const SERVICE_FAILURE_MESSAGE: &str =
    "Something went wrong while answering your question. Please try again in a moment.";

/// Returned when the caller cancels or the question deadline passes
pub const CANCELLED_MESSAGE: &str = "The question was cancelled before an answer was produced.";

/// Prefixed to a best-effort answer
pub const BEST_EFFORT_CAVEAT: &str =
    "Note: this answer could not be fully verified against the question and may be incomplete.";

/// One recorded phase change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub from: Phase,
    pub to: Phase,
    pub attempt: u32,
    pub at: DateTime<Utc>,
}

/// Failure diagnostics kept for logs and the details API, never shown to users
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub phase: Phase,
    pub kind: String,
    pub message: String,
}

/// State of one question moving through the pipeline
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowState {
    question_id: Uuid,
    question: String,
    phase: Phase,
    guardrail: Option<GuardrailVerdict>,
    plan: Option<PlanResult>,
    query: Option<QueryResult>,
    validation: Option<ValidationResult>,
    attempt_count: u32,
    final_response: Option<String>,
    best_effort_response: Option<String>,
    terminated_reason: Option<TerminatedReason>,
    failure: Option<FailureRecord>,
    history: Vec<Transition>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl WorkflowState {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question_id: Uuid::new_v4(),
            question: question.into(),
            phase: Phase::Start,
            guardrail: None,
            plan: None,
            query: None,
            validation: None,
            attempt_count: 0,
            final_response: None,
            best_effort_response: None,
            terminated_reason: None,
            failure: None,
            history: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn question_id(&self) -> Uuid {
        self.question_id
    }

    pub fn question(&self) -> &str {
        &self.question
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn guardrail(&self) -> Option<&GuardrailVerdict> {
        self.guardrail.as_ref()
    }

    pub fn plan(&self) -> Option<&PlanResult> {
        self.plan.as_ref()
    }

    pub fn query(&self) -> Option<&QueryResult> {
        self.query.as_ref()
    }

    pub fn validation(&self) -> Option<&ValidationResult> {
        self.validation.as_ref()
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn final_response(&self) -> Option<&str> {
        self.final_response.as_deref()
    }

    pub fn best_effort_response(&self) -> Option<&str> {
        self.best_effort_response.as_deref()
    }

    pub fn terminated_reason(&self) -> Option<TerminatedReason> {
        self.terminated_reason
    }

    pub fn failure(&self) -> Option<&FailureRecord> {
        self.failure.as_ref()
    }

    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// The statement and issues of the last validated attempt, for a retry prompt
    pub fn prior_attempt(&self) -> Option<PriorAttempt> {
        let query = self.query.as_ref()?;
        let validation = self.validation.as_ref()?;
        Some(PriorAttempt {
            statement: query.statement.clone(),
            issues: validation.issues.clone(),
        })
    }

    /// The text returned to the user for the current outcome
    pub fn user_response(&self) -> String {
        if let Some(response) = &self.final_response {
            return response.clone();
        }
        match self.terminated_reason {
            Some(TerminatedReason::Blocked) => self
                .guardrail
                .as_ref()
                .map(|verdict| verdict.reason.clone())
                .unwrap_or_else(|| SERVICE_FAILURE_MESSAGE.to_string()),
            Some(TerminatedReason::MaxRetriesExhausted) => match &self.best_effort_response {
                Some(answer) => format!("{}\n\n{}", BEST_EFFORT_CAVEAT, answer),
                None => EXHAUSTED_MESSAGE.to_string(),
            },
            Some(TerminatedReason::Cancelled) => CANCELLED_MESSAGE.to_string(),
            Some(TerminatedReason::FatalError) | None => SERVICE_FAILURE_MESSAGE.to_string(),
        }
    }

    /// Snapshot for the details API
    pub fn details(&self) -> WorkflowDetails {
        WorkflowDetails {
            question_id: self.question_id,
            question: self.question.clone(),
            response: self.user_response(),
            phase: self.phase,
            terminated_reason: self.terminated_reason,
            guardrail: self.guardrail.clone(),
            plan: self.plan.clone(),
            statement: self.query.as_ref().map(|q| q.statement.clone()),
            columns: self
                .query
                .as_ref()
                .map(|q| q.columns.clone())
                .unwrap_or_default(),
            row_count: self.query.as_ref().map(QueryResult::row_count),
            truncated: self.query.as_ref().map(|q| q.truncated).unwrap_or(false),
            validation: self.validation.clone(),
            attempt_count: self.attempt_count,
            best_effort: self.best_effort_response.is_some(),
            failure_kind: self.failure.as_ref().map(|f| f.kind.clone()),
            history: self.history.clone(),
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }

    /// Move to `next`, recording the transition and any terminal reason
    pub(crate) fn advance(&mut self, next: Phase) -> Result<()> {
        if !self.phase.can_transition_to(next) {
            return Err(TabulaError::InvalidState(format!(
                "illegal transition {} -> {}",
                self.phase, next
            )));
        }
        self.history.push(Transition {
            from: self.phase,
            to: next,
            attempt: self.attempt_count,
            at: Utc::now(),
        });
        self.phase = next;

        if next.is_terminal() {
            self.terminated_reason = next.terminated_reason();
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    pub(crate) fn record_guardrail(&mut self, verdict: GuardrailVerdict) -> Result<()> {
        if self.guardrail.is_some() {
            return Err(TabulaError::InvalidState(
                "guardrail verdict already recorded".to_string(),
            ));
        }
        self.guardrail = Some(verdict);
        Ok(())
    }

    pub(crate) fn record_plan(&mut self, plan: PlanResult) -> Result<()> {
        if self.plan.is_some() {
            return Err(TabulaError::InvalidState(
                "plan already recorded".to_string(),
            ));
        }
        self.plan = Some(plan);
        Ok(())
    }

    /// Replaces the previous attempt's result and clears its validation
    pub(crate) fn record_query(&mut self, result: QueryResult) {
        self.query = Some(result);
        self.validation = None;
    }

    pub(crate) fn record_validation(&mut self, validation: ValidationResult) {
        self.validation = Some(validation);
    }

    pub(crate) fn begin_retry(&mut self) {
        self.attempt_count += 1;
    }

    pub(crate) fn record_final_response(&mut self, response: String) -> Result<()> {
        if self.final_response.is_some() {
            return Err(TabulaError::InvalidState(
                "final response already recorded".to_string(),
            ));
        }
        self.final_response = Some(response);
        Ok(())
    }

    pub(crate) fn record_best_effort(&mut self, response: String) {
        self.best_effort_response = Some(response);
    }

    pub(crate) fn record_failure(&mut self, error: &TabulaError) {
        self.failure = Some(FailureRecord {
            phase: self.phase,
            kind: error.kind().to_string(),
            message: error.to_string(),
        });
    }
}

/// Serializable view of a finished (or in-flight) question
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDetails {
    pub question_id: Uuid,
    pub question: String,

    /// Final answer, block reason or fixed notice
    pub response: String,

    pub phase: Phase,
    pub terminated_reason: Option<TerminatedReason>,
    pub guardrail: Option<GuardrailVerdict>,
    pub plan: Option<PlanResult>,
    pub statement: Option<String>,
    pub columns: Vec<String>,
    pub row_count: Option<usize>,
    pub truncated: bool,
    pub validation: Option<ValidationResult>,
    pub attempt_count: u32,
    pub best_effort: bool,
    pub failure_kind: Option<String>,
    pub history: Vec<Transition>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}
