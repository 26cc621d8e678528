//! SDK configuration
//!
//! All knobs live in one [`TelemetryConfig`] tree, loadable from YAML with
//! environment variable expansion or built in code. Every field has a
//! default; a config file only states what differs.
//!
//! # Example
//!
//! ```yaml
//! enabled: true
//! endpoint: "https://ingest.example.com/v1"
//! service_key: "${KODAMA_SERVICE_KEY}"
//! service_name: "checkout"
//! environment: "production"
//! sample_rate: 0.25
//! buffer:
//!   size_threshold: 50
//!   flush_interval_millis: 5000
//! transport:
//!   max_attempts: 3
//!   base_delay_millis: 1000
//! ```

mod loader;

pub use loader::ConfigLoader;

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::propagation::PropagationFormat;

/// Expand environment variables in a string.
///
/// Supports two syntaxes:
/// - `${VAR_NAME}` - Simple expansion, keeps placeholder if var not found
/// - `${VAR_NAME:-default}` - Expansion with default value
///
/// Variable names must start with a letter or underscore and contain only
/// uppercase letters, digits, and underscores.
fn expand_env_vars(s: &str) -> String {
    // Regex to capture ${VAR} or ${VAR:-default}
    let re = regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]+))?\}").unwrap();
    let mut last_match = 0;
    let mut result = String::with_capacity(s.len());

    for cap in re.captures_iter(s) {
        let full_match = cap.get(0).unwrap();
        let var_name = cap.get(1).unwrap().as_str();

        result.push_str(&s[last_match..full_match.start()]);

        let value = match std::env::var(var_name) {
            Ok(val) => val,
            Err(_) => {
                if let Some(default) = cap.get(2) {
                    default.as_str().to_string()
                } else {
                    // No env var and no default. Keep the original placeholder.
                    full_match.as_str().to_string()
                }
            }
        };
        result.push_str(&value);

        last_match = full_match.end();
    }

    result.push_str(&s[last_match..]);

    result
}

/// Custom deserializer for strings with environment variable expansion.
///
/// Used with serde's `deserialize_with` attribute so secret-bearing fields
/// expand even when the config is parsed from a string instead of loaded
/// through [`ConfigLoader`].
fn deserialize_with_env<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::de::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    Ok(expand_env_vars(&s))
}

/// Validate that a URL starts with http:// or https://
fn is_valid_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Root SDK configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Master switch. When false every SDK operation is a no-op.
    /// Default: true
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Ingest endpoint base URL, channel paths are appended.
    /// Supports ${VAR} and ${VAR:-default} expansion.
    #[serde(default, deserialize_with = "deserialize_with_env")]
    pub endpoint: String,

    /// Service key sent as a bearer token. Supports ${VAR} expansion.
    #[serde(default, deserialize_with = "deserialize_with_env")]
    pub service_key: String,

    /// Name reported for this service. Default: "kodama-service"
    #[serde(
        default = "default_service_name",
        deserialize_with = "deserialize_with_env"
    )]
    pub service_name: String,

    /// Deployment environment name. Default: "development"
    #[serde(
        default = "default_environment",
        deserialize_with = "deserialize_with_env"
    )]
    pub environment: String,

    /// Reported hostname. Default: taken from $HOSTNAME at startup
    #[serde(default)]
    pub hostname: Option<String>,

    /// Fraction of fresh traces to record (0.0 to 1.0). Default: 1.0
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,

    /// Header propagation options
    #[serde(default)]
    pub propagation: PropagationConfig,

    /// Delivery buffer options
    #[serde(default)]
    pub buffer: BufferConfig,

    /// Transport client options
    #[serde(default)]
    pub transport: TransportConfig,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            endpoint: String::new(),
            service_key: String::new(),
            service_name: default_service_name(),
            environment: default_environment(),
            hostname: None,
            sample_rate: default_sample_rate(),
            propagation: PropagationConfig::default(),
            buffer: BufferConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

impl TelemetryConfig {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        ConfigLoader::load(path)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled {
            if self.endpoint.is_empty() {
                return Err(ConfigError::ValidationError(
                    "endpoint must be set when telemetry is enabled".into(),
                ));
            }
            if !is_valid_http_url(&self.endpoint) {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid endpoint '{}': must start with http:// or https://",
                    self.endpoint
                )));
            }
            if self.service_key.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "service_key must be set when telemetry is enabled".into(),
                ));
            }
            if self.service_name.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "service_name cannot be empty when telemetry is enabled".into(),
                ));
            }
        }

        if self.sample_rate < 0.0 || self.sample_rate > 1.0 {
            return Err(ConfigError::ValidationError(format!(
                "Invalid sample_rate {}: must be between 0.0 and 1.0",
                self.sample_rate
            )));
        }

        if self.buffer.size_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "buffer.size_threshold must be at least 1".into(),
            ));
        }
        if self.buffer.flush_interval_millis == 0 {
            return Err(ConfigError::ValidationError(
                "buffer.flush_interval_millis must be at least 1".into(),
            ));
        }

        if self.transport.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "transport.max_attempts must be at least 1".into(),
            ));
        }
        if self.transport.connect_timeout_secs == 0 || self.transport.request_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "transport timeouts must be at least 1 second".into(),
            ));
        }

        Ok(())
    }
}

fn default_enabled() -> bool {
    true
}

fn default_service_name() -> String {
    "kodama-service".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_sample_rate() -> f64 {
    1.0
}

/// Header propagation configuration
///
/// # Example
///
/// ```yaml
/// propagation:
///   inject_format: "all"  # w3c, b3, or all
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PropagationConfig {
    /// Format written by inject. Extraction always accepts both.
    /// Default: "w3c"
    #[serde(default)]
    pub inject_format: PropagationFormat,
}

/// Delivery buffer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Entry count that triggers a synchronous flush. Default: 50
    #[serde(default = "default_size_threshold")]
    pub size_threshold: usize,

    /// Background flush period in milliseconds. Default: 5000
    #[serde(default = "default_flush_interval_millis")]
    pub flush_interval_millis: u64,

    /// Breadcrumbs kept per execution context. Default: 100
    #[serde(default = "default_max_breadcrumbs")]
    pub max_breadcrumbs: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            size_threshold: default_size_threshold(),
            flush_interval_millis: default_flush_interval_millis(),
            max_breadcrumbs: default_max_breadcrumbs(),
        }
    }
}

fn default_size_threshold() -> usize {
    50
}

fn default_flush_interval_millis() -> u64 {
    5000
}

fn default_max_breadcrumbs() -> usize {
    100
}

/// Transport client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Delivery attempts per batch, including the first. Default: 3
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base retry delay in milliseconds; the delay before attempt n+1 is
    /// base * n. Default: 1000
    #[serde(default = "default_base_delay_millis")]
    pub base_delay_millis: u64,

    /// TCP connect timeout in seconds. Default: 5
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Whole-request timeout in seconds. Default: 10
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_millis: default_base_delay_millis(),
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_millis() -> u64 {
    1000
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_request_timeout_secs() -> u64 {
    10
}
