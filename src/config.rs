use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Settings for the judge LLM backend
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JudgeConfig {
    /// OpenAI-compatible API endpoint
    #[serde(default = "default_api_endpoint")]
    pub api_endpoint: String,
    /// Environment variable name containing the API key
    #[serde(default = "default_env_var_api_key")]
    pub env_var_api_key: String,
    /// Model used for all judge calls
    #[serde(default = "default_model")]
    pub model: String,
    /// Temperature for judge calls; low keeps grading stable
    #[serde(default)]
    pub temperature: f64,
    /// Maximum tokens for judge responses
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Deadline for one judge call in seconds; a timeout counts as an
    /// invalid result, not an error
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            api_endpoint: default_api_endpoint(),
            env_var_api_key: default_env_var_api_key(),
            model: default_model(),
            temperature: 0.0,
            max_tokens: default_max_tokens(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_api_endpoint() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_env_var_api_key() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_timeout_secs() -> u64 {
    30
}

/// Service configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Directory holding one JSON file per response record
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Directory holding custom evaluator definitions
    #[serde(default = "default_evaluators_dir")]
    pub evaluators_dir: String,
    /// Base URI of the experiment tracking store
    #[serde(default = "default_tracking_uri")]
    pub tracking_uri: String,
    /// Base URI of the run registry service
    #[serde(default = "default_registry_uri")]
    pub registry_uri: String,
    /// Seconds between reconciler sweeps
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Delete record files once both phases reach success
    #[serde(default)]
    pub remove_completed: bool,
    /// Keywords extracted per text
    #[serde(default = "default_keyword_top_n")]
    pub keyword_top_n: usize,
    #[serde(default)]
    pub judge: JudgeConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            evaluators_dir: default_evaluators_dir(),
            tracking_uri: default_tracking_uri(),
            registry_uri: default_registry_uri(),
            sweep_interval_secs: default_sweep_interval_secs(),
            remove_completed: false,
            keyword_top_n: default_keyword_top_n(),
            judge: JudgeConfig::default(),
        }
    }
}

fn default_data_dir() -> String {
    "data/responses".to_string()
}

fn default_evaluators_dir() -> String {
    "data/custom_evaluators".to_string()
}

fn default_tracking_uri() -> String {
    "http://localhost:5000".to_string()
}

fn default_registry_uri() -> String {
    "http://localhost:3000".to_string()
}

fn default_sweep_interval_secs() -> u64 {
    15
}

fn default_keyword_top_n() -> usize {
    10
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config: {}", path.display()))
    }
}
