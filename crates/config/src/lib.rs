//! Configuration loading, validation, and management for Cadence.
//!
//! Loads configuration from `~/.cadence/config.toml` with environment
//! variable overrides. Every field has a default, so an absent file or an
//! empty section is valid. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.cadence/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Model request settings
    #[serde(default)]
    pub model: ModelConfig,

    /// Conversation loop settings
    #[serde(default)]
    pub agent: AgentConfig,

    /// Streamed response collection
    #[serde(default)]
    pub stream: StreamConfig,

    /// Tool execution and worker pool
    #[serde(default)]
    pub tools: ToolsConfig,

    /// History compaction
    #[serde(default)]
    pub compaction: CompactionConfig,

    /// Static permission policy
    #[serde(default)]
    pub permissions: PermissionsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_model")]
    pub name: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

fn default_model() -> String {
    "gpt-4o".into()
}
fn default_temperature() -> f32 {
    0.7
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: default_model(),
            temperature: default_temperature(),
            max_tokens: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Hard cap on model calls per turn
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Replaces the built-in system prompt entirely
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt_override: Option<String>,

    /// Run multi-call responses through the worker pool
    #[serde(default = "default_true")]
    pub parallel_tool_calls: bool,
}

fn default_max_iterations() -> u32 {
    25
}
fn default_true() -> bool {
    true
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            system_prompt_override: None,
            parallel_tool_calls: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Wall-clock limit on one streamed exchange
    #[serde(default = "default_stream_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_stream_retries")]
    pub max_retries: u32,

    /// Base backoff; attempt `n` waits `n * retry_delay_ms`
    #[serde(default = "default_stream_retry_delay")]
    pub retry_delay_ms: u64,
}

fn default_stream_timeout() -> u64 {
    300
}
fn default_stream_retries() -> u32 {
    2
}
fn default_stream_retry_delay() -> u64 {
    1000
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_stream_timeout(),
            max_retries: default_stream_retries(),
            retry_delay_ms: default_stream_retry_delay(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_tool_retries")]
    pub max_retries: u32,

    #[serde(default = "default_tool_retry_delay")]
    pub retry_delay_ms: u64,

    /// Strings longer than this are truncated in formatted results
    #[serde(default = "default_max_result_chars")]
    pub max_result_chars: usize,

    #[serde(default = "default_core_workers")]
    pub core_workers: usize,

    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Idle workers exit after this long
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

fn default_tool_retries() -> u32 {
    1
}
fn default_tool_retry_delay() -> u64 {
    500
}
fn default_max_result_chars() -> usize {
    5000
}
fn default_core_workers() -> usize {
    4
}
fn default_max_workers() -> usize {
    8
}
fn default_keep_alive() -> u64 {
    60
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            max_retries: default_tool_retries(),
            retry_delay_ms: default_tool_retry_delay(),
            max_result_chars: default_max_result_chars(),
            core_workers: default_core_workers(),
            max_workers: default_max_workers(),
            keep_alive_secs: default_keep_alive(),
        }
    }
}

/// Which compaction path runs between loop iterations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionStrategy {
    /// Turn-start model summary plus structural trimming between iterations
    Summarize,
    /// Structural trimming only; never calls the model
    Structural,
    /// Never compact
    Off,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    #[serde(default = "default_strategy")]
    pub strategy: CompactionStrategy,

    /// Model context window, in estimated tokens
    #[serde(default = "default_context_window")]
    pub context_window: usize,

    /// Fraction of the window that triggers compaction
    #[serde(default = "default_threshold")]
    pub threshold: f64,

    /// Fewer messages than this are never summarized
    #[serde(default = "default_min_messages")]
    pub min_messages: usize,

    /// Per-message cut-off in the summarization transcript
    #[serde(default = "default_transcript_chars")]
    pub transcript_chars: usize,

    #[serde(default = "default_keep_head")]
    pub keep_head: usize,

    #[serde(default = "default_keep_tail")]
    pub keep_tail: usize,
}

fn default_strategy() -> CompactionStrategy {
    CompactionStrategy::Summarize
}
fn default_context_window() -> usize {
    128_000
}
fn default_threshold() -> f64 {
    0.8
}
fn default_min_messages() -> usize {
    6
}
fn default_transcript_chars() -> usize {
    500
}
fn default_keep_head() -> usize {
    2
}
fn default_keep_tail() -> usize {
    8
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            context_window: default_context_window(),
            threshold: default_threshold(),
            min_messages: default_min_messages(),
            transcript_chars: default_transcript_chars(),
            keep_head: default_keep_head(),
            keep_tail: default_keep_tail(),
        }
    }
}

/// Fallback decision for tools not named in either list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultDecision {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionsConfig {
    /// Tool names always allowed. `["*"]` = allow all.
    #[serde(default)]
    pub allow: Vec<String>,

    /// Tool names always denied. Takes precedence over `allow`.
    #[serde(default)]
    pub deny: Vec<String>,

    #[serde(default = "default_decision")]
    pub default: DefaultDecision,
}

fn default_decision() -> DefaultDecision {
    DefaultDecision::Allow
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        Self {
            allow: vec![],
            deny: vec![],
            default: default_decision(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.cadence/config.toml).
    ///
    /// Environment overrides (highest priority):
    /// - `CADENCE_MODEL`
    /// - `CADENCE_MAX_ITERATIONS`
    /// - `CADENCE_CONTEXT_WINDOW`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup (the process environment in
    /// production, a map in tests).
    pub fn apply_env_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(model) = lookup("CADENCE_MODEL") {
            self.model.name = model;
        }
        if let Some(raw) = lookup("CADENCE_MAX_ITERATIONS") {
            self.agent.max_iterations = raw.parse().map_err(|_| {
                ConfigError::ValidationError(format!("CADENCE_MAX_ITERATIONS is not a number: {raw}"))
            })?;
        }
        if let Some(raw) = lookup("CADENCE_CONTEXT_WINDOW") {
            self.compaction.context_window = raw.parse().map_err(|_| {
                ConfigError::ValidationError(format!("CADENCE_CONTEXT_WINDOW is not a number: {raw}"))
            })?;
        }
        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".cadence")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.temperature < 0.0 || self.model.temperature > 2.0 {
            return Err(ConfigError::ValidationError(
                "model.temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.agent.max_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "agent.max_iterations must be at least 1".into(),
            ));
        }

        if self.tools.core_workers == 0 || self.tools.core_workers > self.tools.max_workers {
            return Err(ConfigError::ValidationError(
                "tools.core_workers must be between 1 and tools.max_workers".into(),
            ));
        }

        if !(self.compaction.threshold > 0.0 && self.compaction.threshold <= 1.0) {
            return Err(ConfigError::ValidationError(
                "compaction.threshold must be in (0.0, 1.0]".into(),
            ));
        }

        if self.compaction.context_window == 0 {
            return Err(ConfigError::ValidationError(
                "compaction.context_window must be > 0".into(),
            ));
        }

        if self.compaction.keep_tail == 0 {
            return Err(ConfigError::ValidationError(
                "compaction.keep_tail must be at least 1".into(),
            ));
        }

        Ok(())
    }

    /// Generate a default config TOML string (for `onboard`).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
