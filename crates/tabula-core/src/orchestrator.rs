//! Workflow orchestrator: drives a question through the pipeline
//!
//! An explicit state machine over [`Phase`]. Every step either records a stage
//! result and names the next phase, or fails; failures are classified once,
//! here, into the terminal outcomes. Every capability call races the question's
//! cancellation token, so a cancelled question issues no further calls.

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::capability::{InferenceCapability, PromptRenderer, QueryExecutor};
use crate::config::{ExhaustionPolicy, Settings, WorkflowConfig};
use crate::error::{Result, TabulaError};
use crate::prompts::TemplateRenderer;
use crate::stages::sanitize::PlanSanitizer;
use crate::stages::{
    Guardrail, InferenceGuardrail, InferencePlanner, InferenceQueryGenerator, InferenceWriter,
    Planner, QueryGenerator, RuleValidator, Validator, WriteRequest, Writer,
};
use crate::state::{WorkflowDetails, WorkflowState};
use crate::storage::DatasetSchema;
use crate::types::{AttemptBudget, Phase, WriteMode};

/// Notified after every phase change with a read-only view of the state
pub trait WorkflowObserver: Send + Sync {
    fn on_transition(&self, state: &WorkflowState);
}

/// The five stages the orchestrator drives
#[derive(Clone)]
pub struct StageSet {
    pub guardrail: Arc<dyn Guardrail>,
    pub planner: Arc<dyn Planner>,
    pub query: Arc<dyn QueryGenerator>,
    pub validator: Arc<dyn Validator>,
    pub writer: Arc<dyn Writer>,
}

impl StageSet {
    /// Inference-backed stages over the given capabilities
    pub fn from_capabilities(
        settings: &Settings,
        inference: Arc<dyn InferenceCapability>,
        executor: Arc<dyn QueryExecutor>,
        renderer: Arc<dyn PromptRenderer>,
        schema: &DatasetSchema,
    ) -> Self {
        let domain = settings.database.domain.clone();
        let schema_context = schema.render_context();

        let planner = InferencePlanner::new(
            inference.clone(),
            renderer.clone(),
            domain.clone(),
            schema_context.clone(),
        )
        .with_sanitizer(PlanSanitizer::with_known_identifiers(schema.identifiers()));

        Self {
            guardrail: Arc::new(InferenceGuardrail::new(
                inference.clone(),
                renderer.clone(),
                domain.clone(),
            )),
            planner: Arc::new(planner),
            query: Arc::new(InferenceQueryGenerator::new(
                inference.clone(),
                renderer.clone(),
                executor,
                schema_context,
            )),
            validator: Arc::new(RuleValidator::new(settings.workflow.confidence_threshold)),
            writer: Arc::new(InferenceWriter::new(
                inference,
                renderer,
                domain,
                settings.workflow.writer_max_rows,
            )),
        }
    }
}

/// Resolves to `Cancelled` as soon as the token fires
async fn cancellable<T, F>(cancel: &CancellationToken, work: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TabulaError::Cancelled),
        outcome = work => outcome,
    }
}

/// Shared, immutable workflow engine. Cheap to clone; each question gets its
/// own [`WorkflowState`].
#[derive(Clone)]
pub struct WorkflowOrchestrator {
    stages: StageSet,
    config: Arc<WorkflowConfig>,
    observer: Option<Arc<dyn WorkflowObserver>>,
}

impl WorkflowOrchestrator {
    pub fn new(stages: StageSet, config: WorkflowConfig) -> Self {
        Self {
            stages,
            config: Arc::new(config),
            observer: None,
        }
    }

    /// Orchestrator over inference-backed stages with the built-in templates
    pub fn from_capabilities(
        settings: &Settings,
        inference: Arc<dyn InferenceCapability>,
        executor: Arc<dyn QueryExecutor>,
        schema: &DatasetSchema,
    ) -> Self {
        let renderer: Arc<dyn PromptRenderer> = Arc::new(TemplateRenderer::new());
        let stages = StageSet::from_capabilities(settings, inference, executor, renderer, schema);
        Self::new(stages, settings.workflow.clone())
    }

    pub fn with_observer(mut self, observer: Arc<dyn WorkflowObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    /// Answer a question: the final answer, the block reason or a fixed notice
    pub async fn ask(&self, question: &str) -> String {
        self.ask_with_details(question).await.response
    }

    pub async fn ask_with_details(&self, question: &str) -> WorkflowDetails {
        self.run(question, CancellationToken::new()).await.details()
    }

    pub async fn ask_with_cancellation(
        &self,
        question: &str,
        cancel: CancellationToken,
    ) -> WorkflowDetails {
        self.run(question, cancel).await.details()
    }

    /// Upper bound on transitions for one question. Reaching it means a bug.
    fn transition_budget(&self) -> usize {
        6 + 3 * self.config.max_attempts as usize
    }

    /// Run the pipeline to a terminal phase and return the final state
    pub async fn run(&self, question: &str, cancel: CancellationToken) -> WorkflowState {
        let state = WorkflowState::new(question);
        let span = info_span!("question", question_id = %state.question_id());

        let token = cancel.child_token();
        let deadline = self.config.question_timeout().map(|limit| {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                warn!(timeout_secs = limit.as_secs(), "Question deadline reached");
                token.cancel();
            })
        });

        let state = self.drive(state, &token).instrument(span).await;

        if let Some(handle) = deadline {
            handle.abort();
        }
        state
    }

    async fn drive(&self, mut state: WorkflowState, cancel: &CancellationToken) -> WorkflowState {
        info!(chars = state.question().len(), "Question received");
        debug!(question = %state.question(), "Question text");

        let budget = self.transition_budget();
        let mut steps = 0usize;

        while !state.is_terminal() {
            if steps >= budget {
                let err = TabulaError::InvalidState(format!(
                    "transition budget of {} exhausted in phase {}",
                    budget,
                    state.phase()
                ));
                error!(error = %err, "Workflow aborted");
                state.record_failure(&err);
                if state.advance(Phase::Failed).is_err() {
                    break;
                }
                self.notify(&state);
                break;
            }
            steps += 1;

            let outcome = if cancel.is_cancelled() {
                Err(TabulaError::Cancelled)
            } else {
                self.step(&mut state, cancel).await
            };

            let next = match outcome {
                Ok(next) => next,
                Err(err) if err.is_cancelled() => {
                    warn!(phase = %state.phase(), "Question cancelled");
                    Phase::Cancelled
                }
                Err(err) => {
                    error!(
                        phase = %state.phase(),
                        kind = err.kind(),
                        error = %err,
                        "Stage failed"
                    );
                    state.record_failure(&err);
                    Phase::Failed
                }
            };

            let from = state.phase();
            match state.advance(next) {
                Ok(()) => info!(
                    from = %from,
                    to = %next,
                    attempt = state.attempt_count(),
                    "Transition"
                ),
                Err(err) => {
                    error!(error = %err, "Illegal transition");
                    state.record_failure(&err);
                    if state.advance(Phase::Failed).is_err() {
                        break;
                    }
                }
            }
            self.notify(&state);
        }

        info!(
            outcome = %state.phase(),
            attempts = state.attempt_count() + 1,
            "Question finished"
        );
        state
    }

    fn notify(&self, state: &WorkflowState) {
        if let Some(observer) = &self.observer {
            observer.on_transition(state);
        }
    }

    async fn step(&self, state: &mut WorkflowState, cancel: &CancellationToken) -> Result<Phase> {
        match state.phase() {
            Phase::Start => Ok(Phase::Guardrail),

            Phase::Guardrail => {
                let verdict =
                    cancellable(cancel, self.stages.guardrail.evaluate(state.question())).await?;
                let allowed = verdict.allowed;
                if !allowed {
                    warn!(category = ?verdict.category, "Question blocked");
                }
                state.record_guardrail(verdict)?;
                Ok(if allowed { Phase::Planning } else { Phase::Blocked })
            }

            Phase::Planning => {
                let plan = cancellable(cancel, self.stages.planner.plan(state.question())).await?;
                state.record_plan(plan)?;
                Ok(Phase::Querying)
            }

            Phase::Querying => {
                let budget = AttemptBudget::new(state.attempt_count(), self.config.max_attempts);
                let prior = if budget.attempt > 0 {
                    state.prior_attempt()
                } else {
                    None
                };
                let plan = state
                    .plan()
                    .ok_or_else(|| TabulaError::InvalidState("querying without a plan".into()))?;

                let result = cancellable(
                    cancel,
                    self.stages
                        .query
                        .generate_and_execute(plan, prior.as_ref(), budget),
                )
                .await?;
                state.record_query(result);
                Ok(Phase::Validating)
            }

            Phase::Validating => {
                let plan = state
                    .plan()
                    .ok_or_else(|| TabulaError::InvalidState("validating without a plan".into()))?;
                let result = state.query().ok_or_else(|| {
                    TabulaError::InvalidState("validating without a query result".into())
                })?;

                let validation = self.stages.validator.validate(plan, result);
                let acceptable = validation.is_acceptable;
                if acceptable {
                    debug!(confidence = validation.confidence, "Result accepted");
                } else {
                    warn!(
                        confidence = validation.confidence,
                        hard_failure = validation.hard_failure,
                        issues = ?validation.issues,
                        "Result rejected"
                    );
                }
                state.record_validation(validation);

                if acceptable {
                    Ok(Phase::Writing)
                } else if state.attempt_count() + 1 < self.config.max_attempts {
                    Ok(Phase::Retry)
                } else {
                    self.handle_exhaustion(state, cancel).await?;
                    Ok(Phase::Exhausted)
                }
            }

            Phase::Retry => {
                state.begin_retry();
                Ok(Phase::Querying)
            }

            Phase::Writing => {
                let response = self.write(state, cancel, WriteMode::Confident).await?;
                state.record_final_response(response)?;
                Ok(Phase::Done)
            }

            terminal => Err(TabulaError::InvalidState(format!(
                "no step from terminal phase {}",
                terminal
            ))),
        }
    }

    /// Under the best-effort policy, ask the Writer for a caveated answer from
    /// the last attempt. A failed best-effort write still ends as exhausted.
    async fn handle_exhaustion(
        &self,
        state: &mut WorkflowState,
        cancel: &CancellationToken,
    ) -> Result<()> {
        warn!(max_attempts = self.config.max_attempts, "Attempt budget exhausted");
        if self.config.exhaustion_policy != ExhaustionPolicy::BestEffort {
            return Ok(());
        }

        match self.write(state, cancel, WriteMode::BestEffort).await {
            Ok(answer) => state.record_best_effort(answer),
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) => warn!(error = %err, "Best-effort answer failed"),
        }
        Ok(())
    }

    async fn write(
        &self,
        state: &WorkflowState,
        cancel: &CancellationToken,
        mode: WriteMode,
    ) -> Result<String> {
        let missing = |what: &str| TabulaError::InvalidState(format!("writing without {}", what));
        let request = WriteRequest {
            question: state.question(),
            plan: state.plan().ok_or_else(|| missing("a plan"))?,
            result: state.query().ok_or_else(|| missing("a query result"))?,
            validation: state.validation().ok_or_else(|| missing("a validation"))?,
            mode,
        };
        cancellable(cancel, self.stages.writer.write(request)).await
    }
}
