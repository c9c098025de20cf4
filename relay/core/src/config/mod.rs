//! TOML Configuration File Support
//!
//! Loads the engine configuration from `~/.config/relay/relay.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (via [`ConfigOverrides`])
//! 2. Environment variables (`RELAY_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # XDG Base Directory Compliance
//!
//! - `$XDG_CONFIG_HOME/relay/relay.toml` (typically `~/.config/relay/relay.toml`)
//!
//! # Example Configuration
//!
//! ```toml
//! [registry]
//! max_connections_per_user = 5
//! connection_timeout_secs = 300
//! cleanup_interval_secs = 60
//!
//! [batcher]
//! batch_size = 5
//! batch_timeout_ms = 50
//! max_buffer_size = 100
//! adaptive = true
//! min_batch_size = 1
//! max_batch_size = 20
//! adaptation_interval = 10
//!
//! [estimator]
//! estimated_tokens = 500
//! history_window = 10
//! update_interval_ms = 500
//!
//! [estimator.profiles.my-model]
//! avg_tokens = 900
//! variance = 250
//! rate_profile = "gradual"
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::batching::{AdaptiveConfig, BatcherConfig};
use crate::progress::{CompletionHistory, ModelProfile, ModelProfiles, ProgressEstimatorConfig};
use crate::registry::RegistryConfig;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading or validating configuration
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

// =============================================================================
// Configuration Source Tracking
// =============================================================================

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

/// Registry section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryToml {
    /// Concurrent streams allowed per user
    pub max_connections_per_user: Option<usize>,

    /// Idle time before a stream is swept, in seconds
    pub connection_timeout_secs: Option<u64>,

    /// Seconds between cleanup sweeps
    pub cleanup_interval_secs: Option<u64>,
}

/// Batcher section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BatcherToml {
    /// Tokens per batch
    pub batch_size: Option<usize>,

    /// Delayed-flush timeout in milliseconds
    pub batch_timeout_ms: Option<u64>,

    /// Hard cap on buffered tokens
    pub max_buffer_size: Option<usize>,

    /// Whether the batch size adapts to observed latency
    pub adaptive: Option<bool>,

    /// Adaptive lower bound
    pub min_batch_size: Option<usize>,

    /// Adaptive upper bound
    pub max_batch_size: Option<usize>,

    /// Batches between adaptive adjustments
    pub adaptation_interval: Option<usize>,
}

/// Estimator section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorToml {
    /// Initial estimate of the total tokens
    pub estimated_tokens: Option<u64>,

    /// Snapshot and rate ring capacity
    pub history_window: Option<usize>,

    /// Minimum milliseconds between progress reports
    pub update_interval_ms: Option<u64>,

    /// Per-model profiles, merged over the built-in table
    pub profiles: HashMap<String, ModelProfile>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayToml {
    /// Registry configuration section
    pub registry: RegistryToml,

    /// Batcher configuration section
    pub batcher: BatcherToml,

    /// Estimator configuration section
    pub estimator: EstimatorToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Combined configuration for every engine component
///
/// Use [`load_config`] to load it with proper priority handling.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Connection registry configuration
    pub registry: RegistryConfig,

    /// Token batcher configuration
    pub batcher: BatcherConfig,

    /// Progress estimator configuration
    pub estimator: ProgressEstimatorConfig,

    /// Model profile table
    pub profiles: ModelProfiles,

    /// Totals of completed streams, shared by every clone of this config
    pub history: CompletionHistory,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            batcher: BatcherConfig::default(),
            estimator: ProgressEstimatorConfig::default(),
            profiles: ModelProfiles::builtin(),
            history: CompletionHistory::new(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl RelayConfig {
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

    /// Validate every section
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError::ValidationError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.registry.validate()?;
        self.batcher.validate()?;
        self.estimator.validate()?;
        self.profiles.validate()
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/relay/relay.toml` or
/// `~/.config/relay/relay.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("relay").join("relay.toml"))
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if the
/// merged configuration is invalid. A missing config file is not an error.
pub fn load_config() -> Result<RelayConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path, reading the process environment
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed, or
/// if the merged configuration is invalid.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<RelayConfig, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

/// Load configuration from a specific path with a custom environment lookup
///
/// # Errors
///
/// Same as [`load_config_from_path`].
pub fn load_config_with_env(
    path: Option<PathBuf>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<RelayConfig, ConfigError> {
    let mut config = RelayConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: RelayToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, toml_config);
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

    apply_env_config(&mut config, env);
    config.validate()?;

    Ok(config)
}

fn apply_adaptive_toggle(batcher: &mut BatcherConfig, enabled: bool) {
    if !enabled {
        batcher.adaptive = None;
    } else if batcher.adaptive.is_none() {
        batcher.adaptive = Some(AdaptiveConfig::default());
    }
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut RelayConfig, toml: RelayToml) {
    // Registry settings
    if let Some(max) = toml.registry.max_connections_per_user {
        config.registry.max_connections_per_user = max;
    }
    if let Some(secs) = toml.registry.connection_timeout_secs {
        config.registry.connection_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = toml.registry.cleanup_interval_secs {
        config.registry.cleanup_interval = Duration::from_secs(secs);
    }

    // Batcher settings
    if let Some(size) = toml.batcher.batch_size {
        config.batcher.batch_size = size;
    }
    if let Some(ms) = toml.batcher.batch_timeout_ms {
        config.batcher.batch_timeout = Duration::from_millis(ms);
    }
    if let Some(size) = toml.batcher.max_buffer_size {
        config.batcher.max_buffer_size = size;
    }
    if let Some(enabled) = toml.batcher.adaptive {
        apply_adaptive_toggle(&mut config.batcher, enabled);
    }
    if let Some(adaptive) = config.batcher.adaptive.as_mut() {
        if let Some(min) = toml.batcher.min_batch_size {
            adaptive.min_batch_size = min;
        }
        if let Some(max) = toml.batcher.max_batch_size {
            adaptive.max_batch_size = max;
        }
        if let Some(interval) = toml.batcher.adaptation_interval {
            adaptive.adaptation_interval = interval;
        }
    }

    // Estimator settings
    if let Some(tokens) = toml.estimator.estimated_tokens {
        config.estimator.estimated_tokens = tokens;
    }
    if let Some(window) = toml.estimator.history_window {
        config.estimator.history_window = window;
    }
    if let Some(ms) = toml.estimator.update_interval_ms {
        config.estimator.update_interval = Duration::from_millis(ms);
    }
    config.profiles.extend(toml.estimator.profiles);
}

/// Parse `key` from the environment, recording the source when it is used
fn env_value<T: std::str::FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
    source: &mut ConfigSource,
) -> Option<T> {
    let raw = env(key)?;
    match raw.parse::<T>() {
        Ok(value) => {
            *source = ConfigSource::Env;
            Some(value)
        }
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparseable environment override");
            None
        }
    }
}

/// Apply environment variable overrides to the config
fn apply_env_config(config: &mut RelayConfig, env: impl Fn(&str) -> Option<String>) {
    let source = &mut config.source;

    // Registry settings from environment
    if let Some(n) = env_value(&env, "RELAY_MAX_CONNECTIONS_PER_USER", source) {
        config.registry.max_connections_per_user = n;
    }
    if let Some(secs) = env_value(&env, "RELAY_CONNECTION_TIMEOUT", source) {
        config.registry.connection_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = env_value(&env, "RELAY_CLEANUP_INTERVAL", source) {
        config.registry.cleanup_interval = Duration::from_secs(secs);
    }

    // Batcher settings from environment
    if let Some(size) = env_value(&env, "RELAY_BATCH_SIZE", source) {
        config.batcher.batch_size = size;
    }
    if let Some(ms) = env_value(&env, "RELAY_BATCH_TIMEOUT_MS", source) {
        config.batcher.batch_timeout = Duration::from_millis(ms);
    }
    if let Some(size) = env_value(&env, "RELAY_MAX_BUFFER_SIZE", source) {
        config.batcher.max_buffer_size = size;
    }
    if let Some(enabled) = env("RELAY_ADAPTIVE") {
        let enabled = enabled != "0" && enabled.to_lowercase() != "false";
        apply_adaptive_toggle(&mut config.batcher, enabled);
        *source = ConfigSource::Env;
    }

    // Estimator settings from environment
    if let Some(tokens) = env_value(&env, "RELAY_ESTIMATED_TOKENS", source) {
        config.estimator.estimated_tokens = tokens;
    }
    if let Some(ms) = env_value(&env, "RELAY_UPDATE_INTERVAL_MS", source) {
        config.estimator.update_interval = Duration::from_millis(ms);
    }
}

// =============================================================================
// CLI Overrides
// =============================================================================

/// Configuration values supplied on the command line
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Per-user stream limit override
    pub max_connections_per_user: Option<usize>,

    /// Batch size override
    pub batch_size: Option<usize>,

    /// Batch timeout override (milliseconds)
    pub batch_timeout_ms: Option<u64>,

    /// Adaptive batching override
    pub adaptive: Option<bool>,

    /// Estimate seed override
    pub estimated_tokens: Option<u64>,

    /// Report throttle override (milliseconds)
    pub update_interval_ms: Option<u64>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set per-user stream limit override
    #[must_use]
    pub fn with_max_connections_per_user(mut self, max: usize) -> Self {
        self.max_connections_per_user = Some(max);
        self
    }

    /// Set batch size override
    #[must_use]
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    /// Set batch timeout override
    #[must_use]
    pub fn with_batch_timeout_ms(mut self, ms: u64) -> Self {
        self.batch_timeout_ms = Some(ms);
        self
    }

    /// Set adaptive batching override
    #[must_use]
    pub fn with_adaptive(mut self, enabled: bool) -> Self {
        self.adaptive = Some(enabled);
        self
    }

    /// Set estimate seed override
    #[must_use]
    pub fn with_estimated_tokens(mut self, tokens: u64) -> Self {
        self.estimated_tokens = Some(tokens);
        self
    }

    /// Set report throttle override
    #[must_use]
    pub fn with_update_interval_ms(mut self, ms: u64) -> Self {
        self.update_interval_ms = Some(ms);
        self
    }

    /// Whether any override is set
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.max_connections_per_user.is_none()
            && self.batch_size.is_none()
            && self.batch_timeout_ms.is_none()
            && self.adaptive.is_none()
            && self.estimated_tokens.is_none()
            && self.update_interval_ms.is_none()
    }

    /// Apply overrides to a configuration
    ///
    /// Call [`RelayConfig::validate`] afterwards.
    pub fn apply(&self, config: &mut RelayConfig) {
        if !self.is_empty() {
            config.source = ConfigSource::Cli;
        }

        if let Some(max) = self.max_connections_per_user {
            config.registry.max_connections_per_user = max;
        }
        if let Some(size) = self.batch_size {
            config.batcher.batch_size = size;
        }
        if let Some(ms) = self.batch_timeout_ms {
            config.batcher.batch_timeout = Duration::from_millis(ms);
        }
        if let Some(enabled) = self.adaptive {
            apply_adaptive_toggle(&mut config.batcher, enabled);
        }
        if let Some(tokens) = self.estimated_tokens {
            config.estimator.estimated_tokens = tokens;
        }
        if let Some(ms) = self.update_interval_ms {
            config.estimator.update_interval = Duration::from_millis(ms);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::RateProfile;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    fn write_toml(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    // =========================================================================
    // Default Configuration Tests
    // =========================================================================

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();

        assert_eq!(config.registry.max_connections_per_user, 5);
        assert_eq!(config.registry.connection_timeout, Duration::from_secs(300));
        assert_eq!(config.registry.cleanup_interval, Duration::from_secs(60));
        assert_eq!(config.batcher.batch_size, 5);
        assert_eq!(config.batcher.batch_timeout, Duration::from_millis(50));
        assert_eq!(config.batcher.max_buffer_size, 100);
        assert_eq!(config.batcher.adaptive, Some(AdaptiveConfig::default()));
        assert_eq!(config.estimator.estimated_tokens, 500);
        assert_eq!(config.estimator.history_window, 10);
        assert_eq!(config.estimator.update_interval, Duration::from_millis(500));
        assert!(!config.profiles.is_empty());
        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_config_path() {
        if let Some(p) = default_config_path() {
            assert!(p.ends_with("relay/relay.toml"));
        }
    }

    // =========================================================================
    // TOML Parsing Tests
    // =========================================================================

    #[test]
    fn test_parse_valid_toml() {
        let file = write_toml(
            r#"
[registry]
max_connections_per_user = 2
connection_timeout_secs = 30
cleanup_interval_secs = 5

[batcher]
batch_size = 8
batch_timeout_ms = 25
max_buffer_size = 64
min_batch_size = 4
max_batch_size = 16
adaptation_interval = 3

[estimator]
estimated_tokens = 750
history_window = 6
update_interval_ms = 250

[estimator.profiles.house-model]
avg_tokens = 900
variance = 250
rate_profile = "gradual"
"#,
        );

        let config = load_config_with_env(Some(file.path().to_path_buf()), no_env).unwrap();

        assert_eq!(config.registry.max_connections_per_user, 2);
        assert_eq!(config.registry.connection_timeout, Duration::from_secs(30));
        assert_eq!(config.registry.cleanup_interval, Duration::from_secs(5));

        assert_eq!(config.batcher.batch_size, 8);
        assert_eq!(config.batcher.batch_timeout, Duration::from_millis(25));
        assert_eq!(config.batcher.max_buffer_size, 64);
        assert_eq!(
            config.batcher.adaptive,
            Some(AdaptiveConfig {
                min_batch_size: 4,
                max_batch_size: 16,
                adaptation_interval: 3,
            })
        );

        assert_eq!(config.estimator.estimated_tokens, 750);
        assert_eq!(config.estimator.history_window, 6);
        assert_eq!(config.estimator.update_interval, Duration::from_millis(250));

        let profile = config.profiles.get("house-model").unwrap();
        assert_eq!(profile.rate_profile, RateProfile::Gradual);
        // Built-ins are kept
        assert!(config.profiles.get("gpt-4").is_some());

        assert_eq!(config.source(), ConfigSource::File);
        assert_eq!(config.config_file_path, Some(file.path().to_path_buf()));
    }

    #[test]
    fn test_parse_partial_toml() {
        let file = write_toml("[batcher]\nbatch_size = 3\n");
        let config = load_config_with_env(Some(file.path().to_path_buf()), no_env).unwrap();

        assert_eq!(config.batcher.batch_size, 3);
        assert_eq!(config.batcher.max_buffer_size, 100);
        assert_eq!(config.registry.max_connections_per_user, 5);
    }

    #[test]
    fn test_adaptive_disabled_in_file() {
        let file = write_toml("[batcher]\nadaptive = false\nbatch_size = 50\n");
        let config = load_config_with_env(Some(file.path().to_path_buf()), no_env).unwrap();

        assert_eq!(config.batcher.adaptive, None);
        assert_eq!(config.batcher.batch_size, 50);
    }

    #[test]
    fn test_parse_empty_toml() {
        let file = write_toml("");
        let config = load_config_with_env(Some(file.path().to_path_buf()), no_env).unwrap();
        assert_eq!(config.batcher, BatcherConfig::default());
        assert_eq!(config.source(), ConfigSource::File);
    }

    #[test]
    fn test_missing_file_graceful() {
        let path = PathBuf::from("/nonexistent/relay/relay.toml");
        let config = load_config_with_env(Some(path), no_env).unwrap();
        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.config_file_path.is_none());
    }

    #[test]
    fn test_malformed_toml_error() {
        let file = write_toml("[registry\nmax_connections_per_user = ");
        let result = load_config_with_env(Some(file.path().to_path_buf()), no_env);
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let file = write_toml("[registry]\nmax_connections_per_user = 0\n");
        let result = load_config_with_env(Some(file.path().to_path_buf()), no_env);
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));

        // batch_size outside the adaptive bounds
        let file = write_toml("[batcher]\nbatch_size = 50\n");
        let result = load_config_with_env(Some(file.path().to_path_buf()), no_env);
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_oversized_values_rejected() {
        let file = write_toml("[batcher]\nadaptive = false\nmax_buffer_size = 1152921504606846976\n");
        let result = load_config_with_env(Some(file.path().to_path_buf()), no_env);
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));

        let env = env_from(&[
            ("RELAY_ADAPTIVE", "false"),
            ("RELAY_BATCH_SIZE", "1152921504606846976"),
        ]);
        let result = load_config_with_env(None, env);
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));

        let file = write_toml("[estimator]\nhistory_window = 100000\n");
        let result = load_config_with_env(Some(file.path().to_path_buf()), no_env);
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    // =========================================================================
    // Priority Ordering Tests
    // =========================================================================

    #[test]
    fn test_env_overrides_file() {
        let file = write_toml("[registry]\nmax_connections_per_user = 2\n\n[batcher]\nbatch_size = 8\n");
        let env = env_from(&[
            ("RELAY_MAX_CONNECTIONS_PER_USER", "9"),
            ("RELAY_CONNECTION_TIMEOUT", "45"),
            ("RELAY_BATCH_TIMEOUT_MS", "20"),
            ("RELAY_UPDATE_INTERVAL_MS", "100"),
        ]);

        let config = load_config_with_env(Some(file.path().to_path_buf()), env).unwrap();

        assert_eq!(config.registry.max_connections_per_user, 9);
        assert_eq!(config.registry.connection_timeout, Duration::from_secs(45));
        assert_eq!(config.batcher.batch_size, 8);
        assert_eq!(config.batcher.batch_timeout, Duration::from_millis(20));
        assert_eq!(config.estimator.update_interval, Duration::from_millis(100));
        assert_eq!(config.source(), ConfigSource::Env);
    }

    #[test]
    fn test_env_adaptive_toggle() {
        let config =
            load_config_with_env(None, env_from(&[("RELAY_ADAPTIVE", "false")])).unwrap();
        assert_eq!(config.batcher.adaptive, None);

        let config = load_config_with_env(None, env_from(&[("RELAY_ADAPTIVE", "1")])).unwrap();
        assert_eq!(config.batcher.adaptive, Some(AdaptiveConfig::default()));
    }

    #[test]
    fn test_unparseable_env_ignored() {
        let config =
            load_config_with_env(None, env_from(&[("RELAY_BATCH_SIZE", "lots")])).unwrap();
        assert_eq!(config.batcher.batch_size, 5);
        assert_eq!(config.source(), ConfigSource::Default);
    }

    #[test]
    fn test_cli_overrides_env() {
        let mut config =
            load_config_with_env(None, env_from(&[("RELAY_BATCH_SIZE", "7")])).unwrap();
        assert_eq!(config.source(), ConfigSource::Env);

        ConfigOverrides::new().with_batch_size(3).apply(&mut config);

        assert_eq!(config.batcher.batch_size, 3);
        assert_eq!(config.source(), ConfigSource::Cli);
    }

    // =========================================================================
    // ConfigOverrides Tests
    // =========================================================================

    #[test]
    fn test_config_overrides_apply() {
        let mut config = RelayConfig::default();
        ConfigOverrides::new()
            .with_max_connections_per_user(1)
            .with_batch_timeout_ms(10)
            .with_adaptive(false)
            .with_estimated_tokens(50)
            .with_update_interval_ms(0)
            .apply(&mut config);

        assert_eq!(config.registry.max_connections_per_user, 1);
        assert_eq!(config.batcher.batch_timeout, Duration::from_millis(10));
        assert_eq!(config.batcher.adaptive, None);
        assert_eq!(config.estimator.estimated_tokens, 50);
        assert_eq!(config.estimator.update_interval, Duration::ZERO);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_overrides_empty_no_change() {
        let mut config = RelayConfig::default();
        let overrides = ConfigOverrides::new();
        assert!(overrides.is_empty());
        overrides.apply(&mut config);
        assert_eq!(config.source(), ConfigSource::Default);
    }

    // =========================================================================
    // ConfigSource / Serialization / Error Tests
    // =========================================================================

    #[test]
    fn test_config_source_display() {
        assert_eq!(format!("{}", ConfigSource::Cli), "CLI");
        assert_eq!(format!("{}", ConfigSource::Env), "environment");
        assert_eq!(format!("{}", ConfigSource::File), "config file");
        assert_eq!(format!("{}", ConfigSource::Default), "default");
    }

    #[test]
    fn test_toml_round_trip() {
        let mut original = RelayToml::default();
        original.registry.max_connections_per_user = Some(3);
        original.batcher.adaptive = Some(false);
        original.estimator.profiles.insert(
            "tiny".to_string(),
            ModelProfile::new(50, 10, RateProfile::Burst),
        );

        let toml_string = toml::to_string(&original).unwrap();
        let parsed: RelayToml = toml::from_str(&toml_string).unwrap();

        assert_eq!(parsed.registry.max_connections_per_user, Some(3));
        assert_eq!(parsed.batcher.adaptive, Some(false));
        assert_eq!(
            parsed.estimator.profiles.get("tiny"),
            Some(&ModelProfile::new(50, 10, RateProfile::Burst))
        );
    }

    #[test]
    fn test_config_error_display() {
        let read_err = ConfigError::ReadError {
            path: PathBuf::from("/test/path"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
        };
        let msg = format!("{read_err}");
        assert!(msg.contains("/test/path"));
        assert!(msg.contains("Failed to read"));

        let msg = format!("{}", ConfigError::ValidationError("invalid value".to_string()));
        assert!(msg.contains("invalid value"));
    }
}
