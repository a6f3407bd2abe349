//! Runtime configuration
//!
//! Settings are layered: built-in defaults, then an optional TOML file, then
//! environment variables. The CLI applies its flags last. The result is
//! validated once and shared read-only across concurrent questions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Environment variable naming a config file
pub const CONFIG_PATH_ENV: &str = "TABULA_CONFIG";

/// Config file picked up from the working directory when present
pub const DEFAULT_CONFIG_FILE: &str = "tabula.toml";

/// Top-level settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Orchestration settings
    pub workflow: WorkflowConfig,

    /// Dataset settings
    pub database: DatabaseSettings,

    /// Inference provider settings
    pub llm: LlmSettings,
}

/// What to do when every attempt fails validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    /// Return a fixed notice without calling the Writer
    #[default]
    ExplicitFailure,
    /// Let the Writer answer from the last attempt, with a caveat
    BestEffort,
}

impl FromStr for ExhaustionPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "explicit_failure" | "fail" => Ok(Self::ExplicitFailure),
            "best_effort" => Ok(Self::BestEffort),
            other => Err(ConfigError::InvalidValue {
                key: "workflow.exhaustion_policy".to_string(),
                reason: format!("unknown policy `{}`", other),
            }),
        }
    }
}

/// Orchestrator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Query + validation cycles allowed per question
    pub max_attempts: u32,

    /// Minimum validator confidence for an acceptable result
    pub confidence_threshold: f64,

    /// Behavior after the last rejected attempt
    pub exhaustion_policy: ExhaustionPolicy,

    /// Deadline for a whole question; unset means no deadline
    pub question_timeout_ms: Option<u64>,

    /// Rows shown to the Writer
    pub writer_max_rows: usize,

    /// Rows read from the engine before truncating
    pub max_result_rows: usize,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            confidence_threshold: 0.6,
            exhaustion_policy: ExhaustionPolicy::ExplicitFailure,
            question_timeout_ms: None,
            writer_max_rows: 50,
            max_result_rows: 1000,
        }
    }
}

impl WorkflowConfig {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_confidence_threshold(mut self, threshold: f64) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    pub fn with_exhaustion_policy(mut self, policy: ExhaustionPolicy) -> Self {
        self.exhaustion_policy = policy;
        self
    }

    pub fn with_question_timeout(mut self, timeout: Duration) -> Self {
        self.question_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn question_timeout(&self) -> Option<Duration> {
        self.question_timeout_ms.map(Duration::from_millis)
    }
}

/// Dataset settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// SQLite database file
    pub path: PathBuf,

    /// What the dataset covers, in one line
    pub domain: String,

    /// Include sample rows in the schema context
    pub include_samples: bool,

    /// Sample rows per table
    pub sample_rows: usize,

    /// How long to wait on a locked database
    pub busy_timeout_ms: u64,

    /// Per-statement execution limit
    pub statement_timeout_ms: u64,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tabula.db"),
            domain: "the business dataset: sales, customers, products, regions and activities"
                .to_string(),
            include_samples: true,
            sample_rows: 2,
            busy_timeout_ms: 5000,
            statement_timeout_ms: 30_000,
        }
    }
}

impl DatabaseSettings {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn statement_timeout(&self) -> Duration {
        Duration::from_millis(self.statement_timeout_ms)
    }
}

/// Supported inference backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProviderKind {
    #[default]
    Openai,
    AzureOpenai,
    Anthropic,
    Ollama,
    OpenaiCompatible,
}

impl LlmProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Openai => "openai",
            Self::AzureOpenai => "azure_openai",
            Self::Anthropic => "anthropic",
            Self::Ollama => "ollama",
            Self::OpenaiCompatible => "openai_compatible",
        }
    }
}

impl fmt::Display for LlmProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LlmProviderKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "openai" => Ok(Self::Openai),
            "azure" | "azure_openai" => Ok(Self::AzureOpenai),
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "ollama" => Ok(Self::Ollama),
            "openai_compatible" | "compatible" => Ok(Self::OpenaiCompatible),
            other => Err(ConfigError::InvalidValue {
                key: "llm.provider".to_string(),
                reason: format!("unknown provider `{}`", other),
            }),
        }
    }
}

/// Inference provider settings. API keys are never stored here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub provider: LlmProviderKind,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,

    /// Overrides the provider's default endpoint
    pub base_url: Option<String>,

    /// Environment variable holding the API key
    pub api_key_env: Option<String>,

    pub request_timeout_secs: u64,

    /// Azure deployment name
    pub deployment: Option<String>,

    /// Azure API version
    pub api_version: Option<String>,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider: LlmProviderKind::Openai,
            model: "gpt-4o-mini".to_string(),
            temperature: 0.0,
            max_tokens: 2048,
            base_url: None,
            api_key_env: None,
            request_timeout_secs: 60,
            deployment: None,
            api_version: None,
        }
    }
}

impl LlmSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse settings from TOML text; missing keys keep their defaults
    pub fn from_toml_str(content: &str, origin: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: origin.to_string(),
            reason: e.to_string(),
        })
    }

    /// Load configuration from a file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&content, &path.display().to_string())
    }

    /// Full load: explicit file, else `TABULA_CONFIG`, else `./tabula.toml` if it
    /// exists, else defaults; then process environment overrides, then validation
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let env_path = std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from);
        let local = PathBuf::from(DEFAULT_CONFIG_FILE);

        let mut settings = match explicit.map(Path::to_path_buf).or(env_path) {
            Some(path) => Self::from_file(path)?,
            None if local.is_file() => Self::from_file(&local)?,
            None => Self::default(),
        };
        settings.apply_env(|key| std::env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    /// Apply environment overrides through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("TABULA_DB_PATH") {
            self.database.path = PathBuf::from(path);
        }
        if let Some(domain) = lookup("TABULA_DOMAIN") {
            self.database.domain = domain;
        }
        if let Some(provider) = lookup("LLM_PROVIDER") {
            self.llm.provider = provider.parse()?;
        }
        if let Some(model) = lookup("LLM_MODEL") {
            self.llm.model = model;
        }
        if let Some(temperature) = lookup("LLM_TEMPERATURE") {
            self.llm.temperature = parse_value("LLM_TEMPERATURE", &temperature)?;
        }
        if let Some(max_tokens) = lookup("LLM_MAX_TOKENS") {
            self.llm.max_tokens = parse_value("LLM_MAX_TOKENS", &max_tokens)?;
        }
        if let Some(base_url) = lookup("LLM_BASE_URL") {
            self.llm.base_url = Some(base_url);
        }
        if let Some(deployment) = lookup("AZURE_OPENAI_DEPLOYMENT") {
            self.llm.deployment = Some(deployment);
        }
        if let Some(api_version) = lookup("AZURE_OPENAI_API_VERSION") {
            self.llm.api_version = Some(api_version);
        }
        if let Some(retries) = lookup("MAX_RETRIES") {
            self.workflow.max_attempts = parse_value("MAX_RETRIES", &retries)?;
        }
        if let Some(threshold) = lookup("CONFIDENCE_THRESHOLD") {
            self.workflow.confidence_threshold = parse_value("CONFIDENCE_THRESHOLD", &threshold)?;
        }
        if let Some(policy) = lookup("EXHAUSTION_POLICY") {
            self.workflow.exhaustion_policy = policy.parse()?;
        }
        Ok(())
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workflow.max_attempts == 0 {
            return Err(invalid("workflow.max_attempts", "must be at least 1"));
        }
        let threshold = self.workflow.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) || threshold.is_nan() {
            return Err(invalid(
                "workflow.confidence_threshold",
                "must be within [0, 1]",
            ));
        }
        if self.workflow.question_timeout_ms == Some(0) {
            return Err(invalid(
                "workflow.question_timeout_ms",
                "must be positive when set",
            ));
        }
        if self.workflow.writer_max_rows == 0 {
            return Err(invalid("workflow.writer_max_rows", "must be at least 1"));
        }
        if self.workflow.max_result_rows == 0 {
            return Err(invalid("workflow.max_result_rows", "must be at least 1"));
        }
        if self.database.path.as_os_str().is_empty() {
            return Err(invalid("database.path", "must not be empty"));
        }
        if self.llm.model.trim().is_empty() {
            return Err(invalid("llm.model", "must not be empty"));
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(invalid("llm.temperature", "must be within [0, 2]"));
        }
        if self.llm.max_tokens == 0 {
            return Err(invalid("llm.max_tokens", "must be at least 1"));
        }
        if self.llm.request_timeout_secs == 0 {
            return Err(invalid("llm.request_timeout_secs", "must be at least 1"));
        }
        if self.llm.provider == LlmProviderKind::AzureOpenai && self.llm.deployment.is_none() {
            return Err(invalid(
                "llm.deployment",
                "required for the azure_openai provider",
            ));
        }
        Ok(())
    }
}

fn invalid(key: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        reason: format!("cannot parse `{}`", raw),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.workflow.max_attempts, 3);
        assert_eq!(
            settings.workflow.exhaustion_policy,
            ExhaustionPolicy::ExplicitFailure
        );
        assert_eq!(settings.llm.model, "gpt-4o-mini");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let settings = Settings::from_toml_str(
            r#"
            [workflow]
            max_attempts = 5
            exhaustion_policy = "best_effort"

            [llm]
            provider = "anthropic"
            model = "claude-3-5-haiku-latest"
            "#,
            "inline",
        )
        .unwrap();

        assert_eq!(settings.workflow.max_attempts, 5);
        assert_eq!(settings.workflow.exhaustion_policy, ExhaustionPolicy::BestEffort);
        assert_eq!(settings.workflow.confidence_threshold, 0.6);
        assert_eq!(settings.llm.provider, LlmProviderKind::Anthropic);
        assert_eq!(settings.database.sample_rows, 2);
    }

    #[test]
    fn test_bad_toml_is_parse_error() {
        let err = Settings::from_toml_str("[workflow\nmax_attempts = ", "broken.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { ref path, .. } if path == "broken.toml"));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("TABULA_DB_PATH", "/data/sales.db"),
            ("LLM_PROVIDER", "ollama"),
            ("LLM_TEMPERATURE", "0.2"),
            ("MAX_RETRIES", "4"),
        ]
        .into_iter()
        .collect();

        let mut settings = Settings::default();
        settings
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(settings.database.path, PathBuf::from("/data/sales.db"));
        assert_eq!(settings.llm.provider, LlmProviderKind::Ollama);
        assert_eq!(settings.llm.temperature, 0.2);
        assert_eq!(settings.workflow.max_attempts, 4);
    }

    #[test]
    fn test_env_rejects_garbage() {
        let mut settings = Settings::default();
        let err = settings
            .apply_env(|key| (key == "MAX_RETRIES").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "MAX_RETRIES"));
    }

    #[test]
    fn test_question_timeout_keeps_millisecond_precision() {
        let config = WorkflowConfig::default().with_question_timeout(Duration::from_millis(250));
        assert_eq!(config.question_timeout_ms, Some(250));
        assert_eq!(config.question_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(WorkflowConfig::default().question_timeout(), None);

        let settings =
            Settings::from_toml_str("[workflow]\nquestion_timeout_ms = 1500\n", "inline").unwrap();
        assert_eq!(
            settings.workflow.question_timeout(),
            Some(Duration::from_millis(1500))
        );
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let mut settings = Settings::default();
        settings.workflow.max_attempts = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.workflow.confidence_threshold = 1.5;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.workflow = settings.workflow.with_question_timeout(Duration::ZERO);
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.llm.provider = LlmProviderKind::AzureOpenai;
        assert!(settings.validate().is_err());
        settings.llm.deployment = Some("gpt4o".to_string());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tabula.toml");
        std::fs::write(&path, "[database]\npath = \"warehouse.db\"\n").unwrap();

        let settings = Settings::from_file(&path).unwrap();
        assert_eq!(settings.database.path, PathBuf::from("warehouse.db"));

        let missing = Settings::from_file(dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::Read { .. }));
    }
}
