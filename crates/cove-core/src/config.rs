use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::service::Stage;
use crate::{CoveError, SecretValue, require_env};

const DEFAULT_CONFIG_PATH: &str = "cove.toml";
const CONFIG_PATH_ENV: &str = "COVE_CONFIG";

/// Immutable run configuration. Built once, then shared by reference with every component.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub dataset: DatasetConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Resolve the credential for every stage. Any missing key is fatal before work starts.
    pub fn require_credentials(&self) -> Result<Vec<(Stage, SecretValue)>, CoveError> {
        Stage::ALL
            .iter()
            .map(|stage| {
                let secret = require_env(&self.models.for_stage(*stage).api_key_env)?;
                Ok::<_, CoveError>((*stage, secret))
            })
            .collect()
    }
}

/// Helper to load configuration with guard rails.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a provided path or discoverable defaults.
    ///
    /// Resolution order:
    /// 1. Explicit `path` argument.
    /// 2. `COVE_CONFIG` environment variable.
    /// 3. `cove.toml` in the current working directory, if present.
    ///
    /// Without any file the built-in defaults apply.
    pub fn load(path: Option<PathBuf>) -> Result<Config, CoveError> {
        let config = match resolve_path(path) {
            Some(candidate) => {
                let raw = fs::read_to_string(&candidate)
                    .map_err(|err| CoveError::config_io(candidate.clone(), err))?;
                Self::parse(&raw)?
            }
            None => Config::default(),
        };

        Self::validate(&config)?;
        Ok(config)
    }

    pub fn parse(raw: &str) -> Result<Config, CoveError> {
        let config: Config =
            toml::from_str(raw).map_err(|err| CoveError::InvalidConfiguration(err.to_string()))?;
        Self::validate(&config)?;
        Ok(config)
    }

    pub fn validate(config: &Config) -> Result<(), CoveError> {
        if config.batch.concurrency == 0 {
            return Err(CoveError::InvalidConfiguration(
                "batch.concurrency must be at least 1".into(),
            ));
        }
        if config.retry.max_retries == 0 {
            return Err(CoveError::InvalidConfiguration(
                "retry.max_retries must be at least 1".into(),
            ));
        }
        if config.pipeline.react_step_budget == 0 {
            return Err(CoveError::InvalidConfiguration(
                "pipeline.react_step_budget must be at least 1".into(),
            ));
        }
        if config.pipeline.questions_per_batch == Some(0) {
            return Err(CoveError::InvalidConfiguration(
                "pipeline.questions_per_batch must be at least 1 when set".into(),
            ));
        }
        for stage in Stage::ALL {
            let model = config.models.for_stage(stage);
            if model.api_key_env.trim().is_empty() {
                return Err(CoveError::InvalidConfiguration(format!(
                    "models.{}.api_key_env must reference an environment variable",
                    stage.as_str()
                )));
            }
            if let Some(effort) = &model.reasoning_effort
                && !matches!(effort.as_str(), "low" | "medium" | "high")
            {
                return Err(CoveError::InvalidConfiguration(format!(
                    "models.{}.reasoning_effort must be low, medium or high (got {effort})",
                    stage.as_str()
                )));
            }
        }
        Ok(())
    }
}

fn resolve_path(path: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(path) = path {
        return Some(path);
    }

    if let Ok(from_env) = env::var(CONFIG_PATH_ENV)
        && !from_env.trim().is_empty()
    {
        return Some(PathBuf::from(from_env));
    }

    let default = Path::new(DEFAULT_CONFIG_PATH);
    default.exists().then(|| default.to_path_buf())
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelsConfig {
    #[serde(default = "ModelConfig::small")]
    pub questions: ModelConfig,
    #[serde(default = "ModelConfig::reasoning")]
    pub react: ModelConfig,
    #[serde(default = "ModelConfig::reasoning")]
    pub assessment: ModelConfig,
    #[serde(default = "ModelConfig::reasoning")]
    pub aggregation: ModelConfig,
}

impl ModelsConfig {
    pub fn for_stage(&self, stage: Stage) -> &ModelConfig {
        match stage {
            Stage::Questions => &self.questions,
            Stage::Verification => &self.react,
            Stage::Assessment => &self.assessment,
            Stage::Aggregation => &self.aggregation,
        }
    }
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            questions: ModelConfig::small(),
            react: ModelConfig::reasoning(),
            assessment: ModelConfig::reasoning(),
            aggregation: ModelConfig::reasoning(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "ModelConfig::default_provider")]
    pub provider: String,
    pub model: String,
    #[serde(default = "ModelConfig::default_base_url")]
    pub base_url: String,
    #[serde(default = "ModelConfig::default_api_key_env")]
    pub api_key_env: String,
    #[serde(default)]
    pub reasoning_effort: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default = "ModelConfig::default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self::reasoning()
    }
}

impl ModelConfig {
    fn named(model: &str) -> Self {
        Self {
            provider: Self::default_provider(),
            model: model.to_string(),
            base_url: Self::default_base_url(),
            api_key_env: Self::default_api_key_env(),
            reasoning_effort: None,
            temperature: None,
            request_timeout_secs: Self::default_request_timeout_secs(),
        }
    }

    fn small() -> Self {
        Self::named("gpt-4o-mini")
    }

    fn reasoning() -> Self {
        Self::named("o3-mini")
    }

    fn default_provider() -> String {
        "openai".to_string()
    }

    fn default_base_url() -> String {
        "https://api.openai.com/v1".to_string()
    }

    fn default_api_key_env() -> String {
        "OPENAI_API_KEY".to_string()
    }

    const fn default_request_timeout_secs() -> u64 {
        180
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "PipelineConfig::default_max_questions")]
    pub max_questions: usize,
    #[serde(default = "PipelineConfig::default_react_step_budget")]
    pub react_step_budget: usize,
    /// Split an item's questions into batches of this size; `None` sends them all at once.
    #[serde(default)]
    pub questions_per_batch: Option<usize>,
    #[serde(default)]
    pub prompts_dir: Option<PathBuf>,
}

impl PipelineConfig {
    const fn default_max_questions() -> usize {
        5
    }

    const fn default_react_step_budget() -> usize {
        30
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_questions: Self::default_max_questions(),
            react_step_budget: Self::default_react_step_budget(),
            questions_per_batch: None,
            prompts_dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Total attempts made against an overloaded service before giving up.
    #[serde(default = "RetryConfig::default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "RetryConfig::default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl RetryConfig {
    const fn default_max_retries() -> u32 {
        3
    }

    const fn default_retry_delay_ms() -> u64 {
        2_000
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: Self::default_max_retries(),
            retry_delay_ms: Self::default_retry_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "BatchConfig::default_concurrency")]
    pub concurrency: usize,
}

impl BatchConfig {
    const fn default_concurrency() -> usize {
        5
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            concurrency: Self::default_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatasetConfig {
    #[serde(default = "DatasetConfig::default_timestamp_column")]
    pub timestamp_column: String,
    #[serde(default = "DatasetConfig::default_evidence_column")]
    pub evidence_column: String,
    /// Reference data the analysis tool runs code against.
    #[serde(default)]
    pub reference: Option<PathBuf>,
}

impl DatasetConfig {
    fn default_timestamp_column() -> String {
        "timestamp".to_string()
    }

    fn default_evidence_column() -> String {
        "found_evidence".to_string()
    }
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            timestamp_column: Self::default_timestamp_column(),
            evidence_column: Self::default_evidence_column(),
            reference: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxBackend {
    #[default]
    Local,
    Docker,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SandboxConfig {
    #[serde(default)]
    pub backend: SandboxBackend,
    #[serde(default = "SandboxConfig::default_image")]
    pub image: String,
    #[serde(default = "SandboxConfig::default_python")]
    pub python_binary: String,
    #[serde(default = "SandboxConfig::default_timeout_secs")]
    pub timeout_secs: u64,
}

impl SandboxConfig {
    fn default_image() -> String {
        "cove-python-sandbox:latest".to_string()
    }

    fn default_python() -> String {
        "python3".to_string()
    }

    const fn default_timeout_secs() -> u64 {
        60
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: SandboxBackend::default(),
            image: Self::default_image(),
            python_binary: Self::default_python(),
            timeout_secs: Self::default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = ConfigLoader::parse("").expect("defaults are valid");
        assert_eq!(config.batch.concurrency, 5);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.retry_delay_ms, 2_000);
        assert_eq!(config.pipeline.react_step_budget, 30);
        assert_eq!(config.models.questions.model, "gpt-4o-mini");
        assert_eq!(config.models.aggregation.model, "o3-mini");
        assert_eq!(config.dataset.evidence_column, "found_evidence");
    }

    #[test]
    fn per_stage_models_are_routed() {
        let raw = r#"
            [models.react]
            model = "claude-3-5-haiku"
            provider = "anthropic"
            base_url = "https://proxy.local/v1"
            api_key_env = "ANTHROPIC_API_KEY"

            [pipeline]
            max_questions = 3
            questions_per_batch = 2
        "#;
        let config = ConfigLoader::parse(raw).expect("valid config");
        let react = config.models.for_stage(Stage::Verification);
        assert_eq!(react.model, "claude-3-5-haiku");
        assert_eq!(react.api_key_env, "ANTHROPIC_API_KEY");
        assert_eq!(config.models.for_stage(Stage::Questions).model, "gpt-4o-mini");
        assert_eq!(config.pipeline.questions_per_batch, Some(2));
    }

    #[test]
    fn rejects_zero_concurrency() {
        let err = ConfigLoader::parse("[batch]\nconcurrency = 0").unwrap_err();
        assert!(matches!(err, CoveError::InvalidConfiguration(_)));
    }

    #[test]
    fn rejects_unknown_reasoning_effort() {
        let raw = "[models.assessment]\nmodel = \"o3-mini\"\nreasoning_effort = \"extreme\"";
        let err = ConfigLoader::parse(raw).unwrap_err();
        assert!(err.to_string().contains("reasoning_effort"));
    }
}
