//! Error types for Tabula Core
//!
//! This module defines the error taxonomy used by the workflow engine.
//! We use `thiserror` for ergonomic error definitions with automatic Display/Error implementations.
//!
//! A blocked question is not an error: it is a valid terminal outcome recorded on
//! the [`WorkflowState`](crate::state::WorkflowState). Everything here is a failure
//! of a capability or of the engine itself.

use thiserror::Error;

/// Result type alias for Tabula operations
pub type Result<T> = std::result::Result<T, TabulaError>;

/// Main error type for Tabula operations
#[derive(Error, Debug)]
pub enum TabulaError {
    /// The inference capability failed
    #[error("Inference error: {0}")]
    Inference(#[from] InferenceError),

    /// The query execution capability failed
    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    /// Configuration could not be loaded or validated
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A prompt template could not be rendered
    #[error("Template error: {0}")]
    Template(String),

    /// A stage was entered without a field it requires
    #[error("Invalid workflow state: {0}")]
    InvalidState(String),

    /// The caller abandoned the question
    #[error("Question was cancelled")]
    Cancelled,

    /// Generic error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        source: Box<TabulaError>,
    },
}

/// Failures of the inference capability
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InferenceError {
    #[error("provider `{provider}` request failed: {message}")]
    Provider { provider: String, message: String },

    #[error("inference timed out after {0}ms")]
    Timeout(u64),

    #[error("could not extract a structured value from the response: {0}")]
    MalformedOutput(String),

    #[error("response for `{schema}` violates its schema: {reason}")]
    SchemaViolation { schema: String, reason: String },

    #[error("provider returned an empty response")]
    EmptyResponse,
}

/// Failures of the query execution capability
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("failed to open dataset: {0}")]
    Open(String),

    #[error("statement rejected by the engine: {0}")]
    Syntax(String),

    #[error("statement is not a single read-only query: {0}")]
    Unsafe(String),

    #[error("execution failed: {0}")]
    Engine(String),

    #[error("execution timed out after {0}ms")]
    Timeout(u64),

    #[error("execution was interrupted")]
    Interrupted,
}

/// Configuration loading and validation failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("invalid toml in {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("invalid value for `{key}`: {reason}")]
    InvalidValue { key: String, reason: String },
}

impl TabulaError {
    /// Add context to an error
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Strip any context wrappers and return the underlying error
    pub fn root(&self) -> &TabulaError {
        match self {
            Self::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// Short, stable classification used in diagnostics
    pub fn kind(&self) -> &'static str {
        match self.root() {
            Self::Inference(_) => "inference",
            Self::Execution(_) => "execution",
            Self::Config(_) => "config",
            Self::Template(_) => "template",
            Self::InvalidState(_) => "invalid_state",
            Self::Cancelled => "cancelled",
            Self::WithContext { .. } => "unknown",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), Self::Cancelled)
    }
}

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to a Result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add lazy context to a Result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_context() {
        let err = TabulaError::from(InferenceError::EmptyResponse);
        let err = err.context("Planner generation failed");

        assert!(err.to_string().contains("Planner generation failed"));
        assert_eq!(err.kind(), "inference");
    }

    #[test]
    fn test_result_ext() {
        let result: Result<()> = Err(ExecutionError::Interrupted.into());
        let result = result.with_context(|| "Query attempt 2".to_string());

        let err = result.unwrap_err();
        assert!(err.to_string().contains("Query attempt 2"));
        assert!(matches!(
            err.root(),
            TabulaError::Execution(ExecutionError::Interrupted)
        ));
    }

    #[test]
    fn test_cancelled_survives_context() {
        let err = TabulaError::Cancelled.context("writer");
        assert!(err.is_cancelled());
        assert_eq!(err.kind(), "cancelled");
    }
}
