//! Configuration loading, validation, and management for troupe.
//!
//! Loads configuration from `~/.troupe/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use troupe_core::AgentDef;

/// The root configuration structure.
///
/// Maps directly to `~/.troupe/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Dispatch runtime settings
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Agent definitions, built through the factory registry
    #[serde(default)]
    pub agents: Vec<AgentDef>,

    /// Per-pattern defaults
    #[serde(default)]
    pub patterns: PatternsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Inbound buffer size per registered agent
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Global limit on concurrent `call`s. Unset means unlimited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,

    /// Worker-pool width for `call_parallel` when no global limit is set
    #[serde(default = "default_parallel_width")]
    pub parallel_width: usize,

    /// How long `send` waits for buffer space
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,

    /// Buffer occupancy ratio above which `send` logs a backpressure warning
    #[serde(default = "default_backpressure_ratio")]
    pub backpressure_ratio: f64,
}

fn default_channel_capacity() -> usize {
    100
}
fn default_parallel_width() -> usize {
    8
}
fn default_send_timeout_ms() -> u64 {
    5_000
}
fn default_backpressure_ratio() -> f64 {
    0.8
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            max_concurrency: None,
            parallel_width: default_parallel_width(),
            send_timeout_ms: default_send_timeout_ms(),
            backpressure_ratio: default_backpressure_ratio(),
        }
    }
}

impl RuntimeConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// Width of the fan-out worker pool: the global limit if one is set.
    pub fn fan_out_width(&self) -> usize {
        self.max_concurrency.unwrap_or(self.parallel_width)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatternsConfig {
    #[serde(default)]
    pub parallel: ParallelConfig,

    #[serde(default)]
    pub sequential: SequentialConfig,

    #[serde(default)]
    pub map_reduce: MapReduceConfig,

    #[serde(default)]
    pub ensemble: EnsembleConfig,

    #[serde(default)]
    pub reflection: ReflectionConfig,

    #[serde(default)]
    pub hierarchical: HierarchicalConfig,

    #[serde(default)]
    pub swarm: SwarmConfig,

    #[serde(default)]
    pub rag: RagConfig,

    #[serde(default)]
    pub planning: PlanningConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelConfig {
    /// Abort on the first agent error
    #[serde(default)]
    pub fail_fast: bool,

    /// "merge", "concat", "first" or "majority"
    #[serde(default = "default_aggregation")]
    pub aggregation: String,
}

fn default_aggregation() -> String {
    "merge".into()
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            fail_fast: false,
            aggregation: default_aggregation(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequentialConfig {
    /// "stop" or "continue"
    #[serde(default = "default_error_strategy")]
    pub error_strategy: String,
}

fn default_error_strategy() -> String {
    "stop".into()
}

impl Default for SequentialConfig {
    fn default() -> Self {
        Self {
            error_strategy: default_error_strategy(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapReduceConfig {
    /// Maximum chunks mapped at once
    #[serde(default = "default_map_concurrency")]
    pub concurrency: usize,
}

fn default_map_concurrency() -> usize {
    4
}

impl Default for MapReduceConfig {
    fn default() -> Self {
        Self {
            concurrency: default_map_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleConfig {
    /// "majority", "unanimous", "weighted" or "confidence"
    #[serde(default = "default_strategy")]
    pub strategy: String,

    /// Minimum agreement score in [0, 1]
    #[serde(default = "default_min_agreement")]
    pub min_agreement: f64,
}

fn default_strategy() -> String {
    "majority".into()
}
fn default_min_agreement() -> f64 {
    0.5
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            min_agreement: default_min_agreement(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectionConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Stop once the critic scores at or above this value
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f64,

    /// Number of recent scores inspected for convergence
    #[serde(default = "default_convergence_window")]
    pub convergence_window: usize,

    /// Spread below which the recent scores count as converged
    #[serde(default = "default_convergence_epsilon")]
    pub convergence_epsilon: f64,
}

fn default_max_iterations() -> usize {
    3
}
fn default_quality_threshold() -> f64 {
    0.8
}
fn default_convergence_window() -> usize {
    3
}
fn default_convergence_epsilon() -> f64 {
    0.05
}

impl Default for ReflectionConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            quality_threshold: default_quality_threshold(),
            convergence_window: default_convergence_window(),
            convergence_epsilon: default_convergence_epsilon(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HierarchicalConfig {
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

fn default_max_depth() -> usize {
    3
}

impl Default for HierarchicalConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmConfig {
    #[serde(default = "default_max_handoffs")]
    pub max_handoffs: usize,
}

fn default_max_handoffs() -> usize {
    5
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            max_handoffs: default_max_handoffs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagConfig {
    /// Documents kept after fusion
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Reciprocal-rank-fusion constant
    #[serde(default = "default_rrf_k")]
    pub rrf_k: u32,

    /// Recent turns folded into a conversational query
    #[serde(default = "default_history_window")]
    pub history_window: usize,

    /// Turns retained in conversation history
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    /// Query variants retrieved in multi-query mode (original included)
    #[serde(default = "default_max_queries")]
    pub max_queries: usize,
}

fn default_top_k() -> usize {
    5
}
fn default_rrf_k() -> u32 {
    60
}
fn default_history_window() -> usize {
    5
}
fn default_history_capacity() -> usize {
    100
}
fn default_max_queries() -> usize {
    4
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            rrf_k: default_rrf_k(),
            history_window: default_history_window(),
            history_capacity: default_history_capacity(),
            max_queries: default_max_queries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanningConfig {
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,

    /// Record failed or skipped steps instead of aborting the plan
    #[serde(default)]
    pub continue_on_error: bool,

    /// Ask the planner for a new plan after a failure
    #[serde(default)]
    pub replan_on_failure: bool,

    #[serde(default = "default_max_replan_attempts")]
    pub max_replan_attempts: usize,
}

fn default_max_steps() -> usize {
    10
}
fn default_max_replan_attempts() -> usize {
    2
}

impl Default for PlanningConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            continue_on_error: false,
            replan_on_failure: false,
            max_replan_attempts: default_max_replan_attempts(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.troupe/config.toml).
    ///
    /// Environment overrides:
    /// - `TROUPE_MAX_CONCURRENCY`
    /// - `TROUPE_CHANNEL_CAPACITY`
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

    /// Apply overrides from an environment-style lookup.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("TROUPE_MAX_CONCURRENCY") {
            let limit = parse_env_usize("TROUPE_MAX_CONCURRENCY", &raw)?;
            self.runtime.max_concurrency = Some(limit);
        }
        if let Some(raw) = lookup("TROUPE_CHANNEL_CAPACITY") {
            self.runtime.channel_capacity = parse_env_usize("TROUPE_CHANNEL_CAPACITY", &raw)?;
        }
        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".troupe")
    }

    /// Find an agent definition by name.
    pub fn agent(&self, name: &str) -> Option<&AgentDef> {
        self.agents.iter().find(|a| a.name == name)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let rt = &self.runtime;
        if rt.channel_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "runtime.channel_capacity must be > 0".into(),
            ));
        }
        if rt.parallel_width == 0 || rt.max_concurrency == Some(0) {
            return Err(ConfigError::ValidationError(
                "runtime concurrency limits must be > 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&rt.backpressure_ratio) {
            return Err(ConfigError::ValidationError(
                "runtime.backpressure_ratio must be between 0.0 and 1.0".into(),
            ));
        }

        let p = &self.patterns;
        check_unit("patterns.ensemble.min_agreement", p.ensemble.min_agreement)?;
        check_unit(
            "patterns.reflection.quality_threshold",
            p.reflection.quality_threshold,
        )?;
        if p.reflection.max_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "patterns.reflection.max_iterations must be > 0".into(),
            ));
        }
        if p.map_reduce.concurrency == 0 {
            return Err(ConfigError::ValidationError(
                "patterns.map_reduce.concurrency must be > 0".into(),
            ));
        }
        if p.rag.top_k == 0 || p.rag.max_queries == 0 {
            return Err(ConfigError::ValidationError(
                "patterns.rag.top_k and max_queries must be > 0".into(),
            ));
        }
        if p.planning.max_steps == 0 {
            return Err(ConfigError::ValidationError(
                "patterns.planning.max_steps must be > 0".into(),
            ));
        }

        let mut seen = HashSet::new();
        for agent in &self.agents {
            if agent.name.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "agent names must not be empty".into(),
                ));
            }
            if !seen.insert(agent.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate agent name '{}'",
                    agent.name
                )));
            }
        }

        Ok(())
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

fn check_unit(field: &str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::ValidationError(format!(
            "{field} must be between 0.0 and 1.0"
        )))
    }
}

fn parse_env_usize(key: &str, raw: &str) -> Result<usize, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::ValidationError(format!("{key} must be an integer, got '{raw}'")))
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

impl From<ConfigError> for troupe_core::Error {
    fn from(err: ConfigError) -> Self {
        troupe_core::Error::config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.runtime.channel_capacity, 100);
        assert_eq!(config.runtime.fan_out_width(), 8);
        assert_eq!(config.runtime.send_timeout(), Duration::from_secs(5));
        assert_eq!(config.patterns.rag.rrf_k, 60);
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.runtime.channel_capacity, config.runtime.channel_capacity);
        assert_eq!(parsed.patterns.swarm.max_handoffs, 5);
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let config = AppConfig::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.patterns.ensemble.strategy, "majority");
    }

    #[test]
    fn agents_and_patterns_parse() {
        let toml_str = r#"
[runtime]
max_concurrency = 4

[[agents]]
name = "drafter"
role = "echo"
prompt = "Draft an answer"

[[agents]]
name = "judge"
role = "critic"
factory = "score"
score = 0.9

[patterns.ensemble]
strategy = "weighted"
min_agreement = 0.6
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.runtime.fan_out_width(), 4);
        assert_eq!(config.agents.len(), 2);
        let judge = config.agent("judge").unwrap();
        assert_eq!(judge.factory_name(), "score");
        assert_eq!(judge.extra_f64("score"), Some(0.9));
        assert_eq!(config.patterns.ensemble.strategy, "weighted");
        // Untouched sections keep their defaults
        assert_eq!(config.patterns.reflection.max_iterations, 3);
    }

    #[test]
    fn duplicate_agent_names_rejected() {
        let mut config = AppConfig::default();
        config.agents.push(AgentDef::new("a", "echo"));
        config.agents.push(AgentDef::new("a", "upper"));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn out_of_range_threshold_rejected() {
        let mut config = AppConfig::default();
        config.patterns.ensemble.min_agreement = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_capacity_rejected() {
        let mut config = AppConfig::default();
        config.runtime.channel_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = AppConfig::default();
        config
            .apply_env_overrides(|key| match key {
                "TROUPE_MAX_CONCURRENCY" => Some("3".into()),
                "TROUPE_CHANNEL_CAPACITY" => Some(" 16 ".into()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.runtime.max_concurrency, Some(3));
        assert_eq!(config.runtime.channel_capacity, 16);
    }

    #[test]
    fn bad_env_override_rejected() {
        let mut config = AppConfig::default();
        let err = config
            .apply_env_overrides(|key| (key == "TROUPE_MAX_CONCURRENCY").then(|| "lots".into()))
            .unwrap_err();
        assert!(err.to_string().contains("TROUPE_MAX_CONCURRENCY"));
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[patterns.swarm]\nmax_handoffs = 2").unwrap();
        let config = AppConfig::load_from(file.path()).unwrap();
        assert_eq!(config.patterns.swarm.max_handoffs, 2);
    }

    #[test]
    fn unparsable_file_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[runtime\nbroken").unwrap();
        let err = AppConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = AppConfig::default_toml();
        assert!(toml_str.contains("channel_capacity"));
        assert!(toml_str.contains("majority"));
    }
}
