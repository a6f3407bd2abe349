//! # Tabula Core
//!
//! Answers natural-language analytical questions over a relational dataset by
//! running each question through a fixed pipeline:
//!
//! ```text
//! Guardrail -> Planner -> Query <-> Validator (bounded retry) -> Writer
//! ```
//!
//! The engine depends on three capabilities supplied by the caller: inference
//! ([`InferenceCapability`]), query execution ([`QueryExecutor`]) and prompt
//! rendering ([`PromptRenderer`]). A read-only SQLite executor and a built-in
//! template renderer are included.

pub mod capability;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod prompts;
pub mod stages;
pub mod state;
pub mod storage;
pub mod types;

pub use capability::{
    FieldKind, InferenceCapability, InferenceRequest, PromptRenderer, QueryExecutor,
    RenderedPrompt, ResponseSchema, SchemaField,
};
pub use config::{
    DatabaseSettings, ExhaustionPolicy, LlmProviderKind, LlmSettings, Settings, WorkflowConfig,
};
pub use error::{ConfigError, ExecutionError, InferenceError, Result, ResultExt, TabulaError};
pub use orchestrator::{StageSet, WorkflowObserver, WorkflowOrchestrator};
pub use prompts::{TemplateId, TemplateRenderer};
pub use state::{WorkflowDetails, WorkflowState};
pub use storage::{DatasetSchema, SqliteExecutor};
pub use types::{
    AttemptBudget, Complexity, GuardrailCategory, GuardrailVerdict, Phase, PlanResult,
    PriorAttempt, QueryResult, RowSet, StageKind, TerminatedReason, ValidationResult, WriteMode,
};

pub use tokio_util::sync::CancellationToken;
