//! Configuration management
//!
//! This module handles loading, validation, and management of the Foreman
//! configuration. Configuration is stored in TOML format at
//! ~/.foreman/config.toml.
//!
//! # Configuration Sections
//!
//! - **core**: Data directory, log level
//! - **session**: Iteration, time, budget, and retry limits
//! - **approval**: Approval timeout and cost threshold
//! - **hooks**: Pre-step rate limit window
//!
//! # Path Expansion
//!
//! The configuration system automatically expands ~ to the user's home
//! directory and creates the data directory if it doesn't exist. The ledger
//! document, audit trail, and memory store all live under the data directory.

use sdk::errors::ControllerError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
///
/// Only thresholds are configurable. Hook ordering and the stop decision
/// rule order are fixed in code; see the hooks and decision modules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Core controller settings
    pub core: CoreConfig,

    /// Session limit settings
    #[serde(default)]
    pub session: SessionConfig,

    /// Approval settings
    #[serde(default)]
    pub approval: ApprovalConfig,

    /// Hook pipeline thresholds
    #[serde(default)]
    pub hooks: HooksConfig,
}

/// Core controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Data directory path (supports ~ expansion)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Session limit configuration
///
/// `iteration_count` and `budget_spent` never decrease within a session;
/// these caps bound them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Maximum loop iterations before hard termination
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Maximum session wall time in seconds
    #[serde(default = "default_max_time_secs")]
    pub max_time_secs: u64,

    /// Session budget cap, in budget units
    #[serde(default = "default_budget_cap")]
    pub budget_cap: f64,

    /// Per-task retry cap before escalation
    #[serde(default = "default_retry_cap")]
    pub retry_cap: u32,

    /// Per-step execution timeout in seconds
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,

    /// Grace period given to in-flight steps on cancellation, in seconds
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,

    /// When true, a pending approval suspends the whole session instead of
    /// only the dependent steps
    #[serde(default)]
    pub all_blocking_approval: bool,
}

/// Approval configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// Seconds before a pending approval resolves to TimedOut
    #[serde(default = "default_approval_timeout_secs")]
    pub timeout_secs: u64,

    /// Estimated step cost at or above which approval is required
    #[serde(default = "default_cost_threshold")]
    pub cost_threshold: f64,
}

/// Hook pipeline thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HooksConfig {
    /// Maximum capability invocations per rate window
    #[serde(default = "default_rate_limit_max_calls")]
    pub rate_limit_max_calls: u32,

    /// Rate window length in seconds
    #[serde(default = "default_rate_limit_window_secs")]
    pub rate_limit_window_secs: u64,
}

// Default value functions
fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.foreman")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_iterations() -> u32 {
    20
}

fn default_max_time_secs() -> u64 {
    600
}

fn default_budget_cap() -> f64 {
    10.0
}

fn default_retry_cap() -> u32 {
    3
}

fn default_step_timeout_secs() -> u64 {
    120
}

fn default_cancel_grace_secs() -> u64 {
    5
}

fn default_approval_timeout_secs() -> u64 {
    300
}

fn default_cost_threshold() -> f64 {
    1.0
}

fn default_rate_limit_max_calls() -> u32 {
    30
}

fn default_rate_limit_window_secs() -> u64 {
    60
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_time_secs: default_max_time_secs(),
            budget_cap: default_budget_cap(),
            retry_cap: default_retry_cap(),
            step_timeout_secs: default_step_timeout_secs(),
            cancel_grace_secs: default_cancel_grace_secs(),
            all_blocking_approval: false,
        }
    }
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_approval_timeout_secs(),
            cost_threshold: default_cost_threshold(),
        }
    }
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            rate_limit_max_calls: default_rate_limit_max_calls(),
            rate_limit_window_secs: default_rate_limit_window_secs(),
        }
    }
}

impl Config {
    /// Load configuration from the default location (~/.foreman/config.toml)
    ///
    /// If the configuration file doesn't exist, creates a default one.
    /// Validates the configuration after loading.
    pub fn load_or_create() -> Result<Self, ControllerError> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            Self::create_default(&config_path)
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, ControllerError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| ControllerError::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: Config = toml::from_str(&contents)
            .map_err(|e| ControllerError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate_and_process()?;

        Ok(config)
    }

    /// Create default configuration and save to path
    fn create_default(path: &Path) -> Result<Self, ControllerError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                ControllerError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let mut config = Self::default_config();
        config.validate_and_process()?;

        let toml_string = toml::to_string_pretty(&config)
            .map_err(|e| ControllerError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| ControllerError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(config)
    }

    /// Get the default configuration file path (~/.foreman/config.toml)
    fn default_config_path() -> Result<PathBuf, ControllerError> {
        let home = dirs::home_dir().ok_or_else(|| {
            ControllerError::Config("Could not determine home directory".to_string())
        })?;

        Ok(home.join(".foreman").join("config.toml"))
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            core: CoreConfig {
                data_dir: default_data_dir(),
                log_level: default_log_level(),
            },
            session: SessionConfig::default(),
            approval: ApprovalConfig::default(),
            hooks: HooksConfig::default(),
        }
    }

    /// Validate and process configuration
    ///
    /// Validates thresholds, expands ~ in the data directory, and creates
    /// the data directory if it doesn't exist.
    fn validate_and_process(&mut self) -> Result<(), ControllerError> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(ControllerError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        if self.session.max_iterations == 0 {
            return Err(ControllerError::Config(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        if self.session.budget_cap <= 0.0 {
            return Err(ControllerError::Config(
                "budget_cap must be positive".to_string(),
            ));
        }
        if self.session.retry_cap == 0 {
            return Err(ControllerError::Config(
                "retry_cap must be at least 1".to_string(),
            ));
        }
        if self.approval.cost_threshold < 0.0 {
            return Err(ControllerError::Config(
                "cost_threshold must not be negative".to_string(),
            ));
        }
        if self.hooks.rate_limit_max_calls == 0 || self.hooks.rate_limit_window_secs == 0 {
            return Err(ControllerError::Config(
                "rate limit window and call count must be at least 1".to_string(),
            ));
        }

        self.core.data_dir = expand_path(&self.core.data_dir)?;

        if !self.core.data_dir.exists() {
            fs::create_dir_all(&self.core.data_dir).map_err(|e| {
                ControllerError::Config(format!("Failed to create data directory: {}", e))
            })?;
        }

        Ok(())
    }

    /// Path of the persisted ledger document
    pub fn ledger_path(&self) -> PathBuf {
        self.core.data_dir.join("to-do.md")
    }

    /// Path of the append-only audit trail
    pub fn audit_path(&self) -> PathBuf {
        self.core.data_dir.join("audit.log")
    }

    /// Path of the persisted memory store
    pub fn memory_path(&self) -> PathBuf {
        self.core.data_dir.join("memory.json")
    }

    /// Per-step execution timeout
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.session.step_timeout_secs)
    }

    /// Maximum session wall time
    pub fn max_time(&self) -> Duration {
        Duration::from_secs(self.session.max_time_secs)
    }
}

/// Expand ~ in path to user's home directory
fn expand_path(path: &Path) -> Result<PathBuf, ControllerError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| ControllerError::Config("Invalid UTF-8 in path".to_string()))?;

    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir().ok_or_else(|| {
            ControllerError::Config("Could not determine home directory".to_string())
        })?;

        Ok(home.join(rest))
    } else if path_str == "~" {
        dirs::home_dir().ok_or_else(|| {
            ControllerError::Config("Could not determine home directory".to_string())
        })
    } else {
        Ok(path.to_path_buf())
    }
}
