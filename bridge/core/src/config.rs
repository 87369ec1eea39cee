//! TOML Configuration File Support
//!
//! Configuration for the bridge, loaded from
//! `~/.config/command-bridge/bridge.toml` when present.
//!
//! # Configuration Priority
//!
//! Values are loaded with the following priority (highest first):
//! 1. CLI arguments (via [`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [registry]
//! id_allocation = "sequential"
//! max_allocation_attempts = 128
//!
//! [events]
//! listen_command = "plugin:event|listen"
//! unlisten_command = "plugin:event|unlisten"
//! emit_command = "plugin:event|emit"
//!
//! [host]
//! history_limit = 512
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::listener::EventCommands;
use crate::registry::{CallbackRegistry, IdAllocation};

/// Default number of requests the in-process host remembers
pub const DEFAULT_HISTORY_LIMIT: usize = 256;

const ENV_ID_ALLOCATION: &str = "BRIDGE_ID_ALLOCATION";
const ENV_MAX_ALLOCATION_ATTEMPTS: &str = "BRIDGE_MAX_ALLOCATION_ATTEMPTS";
const ENV_LISTEN_COMMAND: &str = "BRIDGE_LISTEN_COMMAND";
const ENV_UNLISTEN_COMMAND: &str = "BRIDGE_UNLISTEN_COMMAND";
const ENV_EMIT_COMMAND: &str = "BRIDGE_EMIT_COMMAND";
const ENV_HISTORY_LIMIT: &str = "BRIDGE_HISTORY_LIMIT";

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[registry]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryToml {
    /// `"random"` or `"sequential"`
    pub id_allocation: Option<IdAllocation>,

    /// Attempts before allocation reports exhaustion
    pub max_allocation_attempts: Option<u32>,
}

/// `[events]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsToml {
    /// Command registering an event listener
    pub listen_command: Option<String>,

    /// Command unregistering an event listener
    pub unlisten_command: Option<String>,

    /// Command emitting an event
    pub emit_command: Option<String>,
}

/// `[host]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostToml {
    /// Requests kept by the in-process host (0 disables history)
    pub history_limit: Option<usize>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeToml {
    /// Registry section
    pub registry: RegistryToml,

    /// Events section
    pub events: EventsToml,

    /// Host section
    pub host: HostToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Resolved bridge configuration
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    /// Callback id allocation strategy
    pub id_allocation: IdAllocation,

    /// Attempts before allocation reports exhaustion
    pub max_allocation_attempts: u32,

    /// Event facility command names
    pub events: EventCommands,

    /// Requests kept by the in-process host
    pub history_limit: usize,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    source: ConfigSource,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            id_allocation: IdAllocation::default(),
            max_allocation_attempts: CallbackRegistry::DEFAULT_MAX_ATTEMPTS,
            events: EventCommands::default(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl BridgeConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Check values that would make the bridge unusable
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_allocation_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "max_allocation_attempts must be at least 1".to_string(),
            ));
        }
        for (key, value) in [
            ("listen_command", &self.events.listen),
            ("unlisten_command", &self.events.unlisten),
            ("emit_command", &self.events.emit),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!("{key} must not be empty")));
            }
        }
        Ok(())
    }

    /// A registry built from these settings
    #[must_use]
    pub fn build_registry(&self) -> CallbackRegistry {
        CallbackRegistry::new(self.id_allocation, self.max_allocation_attempts)
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/command-bridge/bridge.toml` or the platform
/// equivalent.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("command-bridge").join("bridge.toml"))
}

/// Load configuration from the default path, environment and defaults
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or the
/// result fails validation. A missing config file is not an error.
pub fn load_config() -> Result<BridgeConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// If `path` is `None`, only defaults and environment variables are used.
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed,
/// or the result fails validation.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<BridgeConfig, ConfigError> {
    let mut config = BridgeConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: BridgeToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config);
    config.validate()?;

    Ok(config)
}

fn apply_toml_config(config: &mut BridgeConfig, toml: &BridgeToml) {
    if let Some(strategy) = toml.registry.id_allocation {
        config.id_allocation = strategy;
    }
    if let Some(attempts) = toml.registry.max_allocation_attempts {
        config.max_allocation_attempts = attempts;
    }

    if let Some(ref cmd) = toml.events.listen_command {
        config.events.listen = cmd.clone();
    }
    if let Some(ref cmd) = toml.events.unlisten_command {
        config.events.unlisten = cmd.clone();
    }
    if let Some(ref cmd) = toml.events.emit_command {
        config.events.emit = cmd.clone();
    }

    if let Some(limit) = toml.host.history_limit {
        config.history_limit = limit;
    }
}

fn apply_env_config(config: &mut BridgeConfig) {
    apply_env_vars(config, |key| std::env::var(key).ok());
}

fn apply_env_vars(config: &mut BridgeConfig, var: impl Fn(&str) -> Option<String>) {
    if let Some(value) = var(ENV_ID_ALLOCATION) {
        match value.parse::<IdAllocation>() {
            Ok(strategy) => {
                config.id_allocation = strategy;
                config.source = ConfigSource::Env;
            }
            Err(e) => tracing::warn!(var = ENV_ID_ALLOCATION, error = %e, "Ignoring invalid value"),
        }
    }
    if let Some(attempts) = var(ENV_MAX_ALLOCATION_ATTEMPTS) {
        if let Ok(n) = attempts.parse::<u32>() {
            config.max_allocation_attempts = n;
            config.source = ConfigSource::Env;
        }
    }

    if let Some(cmd) = var(ENV_LISTEN_COMMAND) {
        config.events.listen = cmd;
        config.source = ConfigSource::Env;
    }
    if let Some(cmd) = var(ENV_UNLISTEN_COMMAND) {
        config.events.unlisten = cmd;
        config.source = ConfigSource::Env;
    }
    if let Some(cmd) = var(ENV_EMIT_COMMAND) {
        config.events.emit = cmd;
        config.source = ConfigSource::Env;
    }

    if let Some(limit) = var(ENV_HISTORY_LIMIT) {
        if let Ok(n) = limit.parse::<usize>() {
            config.history_limit = n;
            config.source = ConfigSource::Env;
        }
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Allocation strategy override
    pub id_allocation: Option<IdAllocation>,

    /// Allocation attempts override
    pub max_allocation_attempts: Option<u32>,

    /// History limit override
    pub history_limit: Option<usize>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set allocation strategy override
    #[must_use]
    pub fn with_id_allocation(mut self, strategy: IdAllocation) -> Self {
        self.id_allocation = Some(strategy);
        self
    }

    /// Set allocation attempts override
    #[must_use]
    pub fn with_max_allocation_attempts(mut self, attempts: u32) -> Self {
        self.max_allocation_attempts = Some(attempts);
        self
    }

    /// Set history limit override
    #[must_use]
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = Some(limit);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut BridgeConfig) {
        if self.id_allocation.is_some()
            || self.max_allocation_attempts.is_some()
            || self.history_limit.is_some()
        {
            config.source = ConfigSource::Cli;
        }

        if let Some(strategy) = self.id_allocation {
            config.id_allocation = strategy;
        }
        if let Some(attempts) = self.max_allocation_attempts {
            config.max_allocation_attempts = attempts;
        }
        if let Some(limit) = self.history_limit {
            config.history_limit = limit;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
