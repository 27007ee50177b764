//! Configuration loading, validation, and management for ctxguard.
//!
//! Loads configuration from `~/.ctxguard/config.toml` with environment
//! variable overrides. Validates all settings before an engine is built.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.ctxguard/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Overall resistance posture; picks the default strategy
    #[serde(default)]
    pub resistance_level: ResistanceLevel,

    /// Snapshot every resisted context and fall back to emergency
    /// protection when a pass fails
    #[serde(default = "default_true")]
    pub enable_emergency_recovery: bool,

    /// Upper bound of the recovery-point list
    #[serde(default = "default_max_recovery_points")]
    pub max_recovery_points: usize,

    /// Upper bound of the reconstruction cache
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// Process memory budget used for pressure decisions
    #[serde(default = "default_memory_budget_mb")]
    pub memory_budget_mb: u64,

    /// Fraction of the budget above which `lowMemory` is selected
    #[serde(default = "default_memory_pressure_threshold")]
    pub memory_pressure_threshold: f64,

    /// Mean importance above which `highImportance` is selected
    #[serde(default = "default_high_importance_threshold")]
    pub high_importance_threshold: f64,

    /// Bound of the exported feature log
    #[serde(default = "default_feature_log_capacity")]
    pub feature_log_capacity: usize,

    /// Capacity of the lifecycle event channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Scoring weights
    #[serde(default)]
    pub scoring: ScoringConfig,

    /// Critical-data classifier settings
    #[serde(default)]
    pub classifier: ClassifierConfig,

    /// Background memory monitor
    #[serde(default)]
    pub monitor: MonitorConfig,
}

/// Overall resistance posture.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResistanceLevel {
    #[default]
    Balanced,
    Aggressive,
}

impl std::str::FromStr for ResistanceLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "balanced" => Ok(Self::Balanced),
            "aggressive" => Ok(Self::Aggressive),
            other => Err(ConfigError::ValidationError(format!(
                "unknown resistance level '{other}' (expected balanced or aggressive)"
            ))),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_max_recovery_points() -> usize {
    10
}
fn default_cache_capacity() -> usize {
    100
}
fn default_memory_budget_mb() -> u64 {
    512
}
fn default_memory_pressure_threshold() -> f64 {
    0.8
}
fn default_high_importance_threshold() -> f64 {
    0.7
}
fn default_feature_log_capacity() -> usize {
    1000
}
fn default_event_capacity() -> usize {
    256
}

/// Base weights of the six importance factors.
///
/// The defaults sum to 1.0. Nothing renormalizes them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    #[serde(default = "default_frequency_weight")]
    pub frequency: f64,

    #[serde(default = "default_recency_weight")]
    pub recency: f64,

    #[serde(default = "default_dependency_weight")]
    pub dependency: f64,

    #[serde(default = "default_semantic_weight")]
    pub semantic: f64,

    #[serde(default = "default_flag_weight")]
    pub user_marked: f64,

    #[serde(default = "default_flag_weight")]
    pub system_critical: f64,
}

fn default_frequency_weight() -> f64 {
    0.25
}
fn default_recency_weight() -> f64 {
    0.20
}
fn default_dependency_weight() -> f64 {
    0.20
}
fn default_semantic_weight() -> f64 {
    0.15
}
fn default_flag_weight() -> f64 {
    0.10
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            frequency: default_frequency_weight(),
            recency: default_recency_weight(),
            dependency: default_dependency_weight(),
            semantic: default_semantic_weight(),
            user_marked: default_flag_weight(),
            system_critical: default_flag_weight(),
        }
    }
}

impl ScoringConfig {
    pub fn total(&self) -> f64 {
        self.frequency
            + self.recency
            + self.dependency
            + self.semantic
            + self.user_marked
            + self.system_critical
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Additional sensitive-name patterns (regular expressions, matched
    /// case-insensitively) on top of the built-in set
    #[serde(default)]
    pub extra_patterns: Vec<String>,

    /// Branches with a `priority` above this are critical
    #[serde(default = "default_priority_threshold")]
    pub priority_threshold: f64,
}

fn default_priority_threshold() -> f64 {
    8.0
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            extra_patterns: vec![],
            priority_threshold: default_priority_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_monitor_interval")]
    pub interval_secs: u64,

    /// Used/budget ratio above which a memory-pressure event is published
    #[serde(default = "default_pressure_ratio")]
    pub pressure_ratio: f64,
}

fn default_monitor_interval() -> u64 {
    5
}
fn default_pressure_ratio() -> f64 {
    0.7
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_monitor_interval(),
            pressure_ratio: default_pressure_ratio(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from the default path (~/.ctxguard/config.toml).
    ///
    /// Environment variables override file values:
    /// - `CTXGUARD_RESISTANCE_LEVEL`
    /// - `CTXGUARD_MEMORY_BUDGET_MB`
    /// - `CTXGUARD_EMERGENCY_RECOVERY`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
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
    /// [`EngineConfig::load`]).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup("CTXGUARD_RESISTANCE_LEVEL") {
            self.resistance_level = level.parse()?;
        }

        if let Some(budget) = lookup("CTXGUARD_MEMORY_BUDGET_MB") {
            self.memory_budget_mb = budget.trim().parse().map_err(|_| {
                ConfigError::ValidationError(format!(
                    "CTXGUARD_MEMORY_BUDGET_MB must be an integer, got '{budget}'"
                ))
            })?;
        }

        if let Some(flag) = lookup("CTXGUARD_EMERGENCY_RECOVERY") {
            self.enable_emergency_recovery = match flag.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => {
                    return Err(ConfigError::ValidationError(format!(
                        "CTXGUARD_EMERGENCY_RECOVERY must be a boolean, got '{other}'"
                    )));
                }
            };
        }

        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".ctxguard")
    }

    /// Memory budget in bytes.
    pub fn memory_budget_bytes(&self) -> u64 {
        self.memory_budget_mb.saturating_mul(1024 * 1024)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_recovery_points == 0 {
            return Err(ConfigError::ValidationError(
                "max_recovery_points must be at least 1".into(),
            ));
        }

        if self.cache_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "cache_capacity must be at least 1".into(),
            ));
        }

        if self.memory_budget_mb == 0 {
            return Err(ConfigError::ValidationError(
                "memory_budget_mb must be > 0".into(),
            ));
        }

        for (name, value) in [
            ("memory_pressure_threshold", self.memory_pressure_threshold),
            ("high_importance_threshold", self.high_importance_threshold),
            ("monitor.pressure_ratio", self.monitor.pressure_ratio),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::ValidationError(format!(
                    "{name} must be between 0.0 and 1.0"
                )));
            }
        }

        let weights = [
            self.scoring.frequency,
            self.scoring.recency,
            self.scoring.dependency,
            self.scoring.semantic,
            self.scoring.user_marked,
            self.scoring.system_critical,
        ];
        if weights.iter().any(|w| *w < 0.0 || !w.is_finite()) {
            return Err(ConfigError::ValidationError(
                "scoring weights must be finite and non-negative".into(),
            ));
        }
        if self.scoring.total() <= 0.0 {
            return Err(ConfigError::ValidationError(
                "scoring weights must not all be zero".into(),
            ));
        }

        if self.monitor.interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "monitor.interval_secs must be at least 1".into(),
            ));
        }

        Ok(())
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            resistance_level: ResistanceLevel::default(),
            enable_emergency_recovery: true,
            max_recovery_points: default_max_recovery_points(),
            cache_capacity: default_cache_capacity(),
            memory_budget_mb: default_memory_budget_mb(),
            memory_pressure_threshold: default_memory_pressure_threshold(),
            high_importance_threshold: default_high_importance_threshold(),
            feature_log_capacity: default_feature_log_capacity(),
            event_capacity: default_event_capacity(),
            scoring: ScoringConfig::default(),
            classifier: ClassifierConfig::default(),
            monitor: MonitorConfig::default(),
        }
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
