use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VendflowError};

/// Top-level vendflow configuration. Every section is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub tasks: TasksConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Deadline for a whole execution. Default: 900 (15 minutes)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Per-attempt bound on a single task invocation.
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    /// Abort when a stage is entered more often than this in one run.
    #[serde(default = "default_max_stage_visits")]
    pub max_stage_visits: usize,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            task_timeout_secs: default_task_timeout_secs(),
            max_stage_visits: default_max_stage_visits(),
        }
    }
}

fn default_timeout_secs() -> u64 { 900 }
fn default_task_timeout_secs() -> u64 { 120 }
fn default_max_stage_visits() -> usize { 3 }

/// Retry policy for stages wrapping external task calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Randomize each backoff between 0.8x and 1.2x.
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

fn default_max_attempts() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }
fn default_multiplier() -> f64 { 2.0 }
fn default_jitter() -> bool { true }

/// HTTP task endpoint used by the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TasksConfig {
    /// Tasks are POSTed to `{base_url}/{task_name}`.
    #[serde(default = "default_tasks_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_task_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            base_url: default_tasks_base_url(),
            api_key: None,
            timeout_secs: default_task_timeout_secs(),
        }
    }
}

fn default_tasks_base_url() -> String { "http://127.0.0.1:8080/tasks".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database holding stored results.
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String { "vendflow.db".to_string() }

/// JSONL run logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable run logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: logs
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    /// 1 = run summary only, 2 = per-stage, 3 = per-attempt (default: 2).
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            level: default_log_level(),
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_dir() -> String { "logs".to_string() }
fn default_log_level() -> u8 { 2 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| VendflowError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| VendflowError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(VendflowError::Config(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.retry.multiplier < 1.0 {
            return Err(VendflowError::Config(
                "retry.multiplier must be >= 1.0".into(),
            ));
        }
        if self.workflow.timeout_secs == 0 {
            return Err(VendflowError::Config(
                "workflow.timeout_secs must be positive".into(),
            ));
        }
        if self.workflow.max_stage_visits == 0 {
            return Err(VendflowError::Config(
                "workflow.max_stage_visits must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}
