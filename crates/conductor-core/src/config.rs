use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ConductorError, Result};

/// Engine-wide settings shared by every run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Run-wide retry budget for steps that do not set their own.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Timeout applied to steps without an explicit `timeout_secs`.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Step outputs longer than this are truncated when substituted.
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,
    /// Characters kept from the end of a truncated output.
    #[serde(default = "default_truncation_suffix_chars")]
    pub truncation_suffix_chars: usize,
    /// Depth limit for sub-workflows that do not set their own.
    #[serde(default = "default_max_recursion_depth")]
    pub max_recursion_depth: usize,
    /// Maximum number of steps of one fan-out running at the same time.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Delay before the first in-place retry, doubled for each further one.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Upper bound for the retry delay.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// JSONL run logging.
    #[serde(default)]
    pub log: Option<LogConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            default_timeout_secs: default_timeout_secs(),
            max_output_chars: default_max_output_chars(),
            truncation_suffix_chars: default_truncation_suffix_chars(),
            max_recursion_depth: default_max_recursion_depth(),
            max_concurrency: default_max_concurrency(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            log: None,
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_max_output_chars() -> usize {
    20_000
}

fn default_truncation_suffix_chars() -> usize {
    1_000
}

fn default_max_recursion_depth() -> usize {
    5
}

fn default_max_concurrency() -> usize {
    8
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    30000
}

/// JSONL run logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable run logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: ./logs
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    /// Verbosity: 1 = run summary, 2 = + step results and routes,
    /// 3 = + step starts.
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

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_log_level() -> u8 {
    2
}

impl LogConfig {
    /// Resolve the log directory (expand ~).
    pub fn log_dir(&self) -> PathBuf {
        if let Some(rest) = self.log_dir.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return home.join(rest);
            }
        }
        PathBuf::from(&self.log_dir)
    }
}

impl EngineConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| ConductorError::ConfigNotFound(path.display().to_string()))?;
        Self::from_toml_str(&content)
    }

    /// Parse config from TOML text, expanding `${ENV_VAR}` references first.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self =
            toml::from_str(&expanded).map_err(|e| ConductorError::Config(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(ConductorError::Config(
                "max_concurrency must be at least 1".into(),
            ));
        }
        if self.truncation_suffix_chars >= self.max_output_chars {
            return Err(ConductorError::Config(format!(
                "truncation_suffix_chars ({}) must be smaller than max_output_chars ({})",
                self.truncation_suffix_chars, self.max_output_chars
            )));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(ConductorError::Config(format!(
                "initial_backoff_ms ({}) must not exceed max_backoff_ms ({})",
                self.initial_backoff_ms, self.max_backoff_ms
            )));
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
            chars.next();
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

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
