//! Listener configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via CERTSWAP_CONFIG)
//! 3. Environment variables

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Listener configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network configuration.
    pub network: NetworkConfig,
    /// TLS configuration.
    pub tls: TlsConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("CERTSWAP_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.tls.apply_env_overrides();
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.network.validate()?;
        self.tls.validate()
    }
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Hostname or address to bind to.
    pub hostname: String,
    /// Port to bind to. Port 0 asks the OS for an ephemeral port.
    pub port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            hostname: "127.0.0.1".to_string(),
            port: 8443,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("CERTSWAP_HOST") {
            self.hostname = host;
        }

        if let Ok(port) = std::env::var("CERTSWAP_PORT") {
            if let Ok(parsed) = port.parse() {
                self.port = parsed;
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.hostname.is_empty() {
            return Err(ConfigError::ValidationError(
                "hostname must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// TLS configuration.
///
/// TLS is enabled when both `cert_path` and `key_path` are set. The files
/// are watched for changes while the listener runs; a change triggers a
/// debounced rebuild of the TLS context after `rotation_delay_secs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Path to PEM-encoded server certificate chain file.
    #[serde(default)]
    pub cert_path: Option<PathBuf>,
    /// Path to PEM-encoded private key file.
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    /// Quiet period between a certificate file change and the context
    /// rebuild. Certificate managers write the cert and key as separate
    /// operations; the delay lets both land before a single rebuild.
    pub rotation_delay_secs: u64,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_path: None,
            key_path: None,
            rotation_delay_secs: 10,
        }
    }
}

impl TlsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("CERTSWAP_TLS_CERT") {
            self.cert_path = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("CERTSWAP_TLS_KEY") {
            self.key_path = Some(PathBuf::from(path));
        }
        if let Ok(delay) = std::env::var("CERTSWAP_ROTATION_DELAY_SECS") {
            if let Ok(secs) = delay.parse() {
                self.rotation_delay_secs = secs;
            }
        }
    }

    /// Returns whether TLS is configured.
    pub fn enabled(&self) -> bool {
        self.cert_path.is_some() && self.key_path.is_some()
    }

    /// Returns the certificate and key paths when both are configured.
    pub fn paths(&self) -> Option<(&Path, &Path)> {
        match (&self.cert_path, &self.key_path) {
            (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
            _ => None,
        }
    }

    /// Returns the rotation debounce delay as Duration.
    pub fn rotation_delay(&self) -> Duration {
        Duration::from_secs(self.rotation_delay_secs)
    }

    /// Validates TLS configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match (&self.cert_path, &self.key_path) {
            (Some(_), None) => Err(ConfigError::ValidationError(
                "cert_path set but key_path not set".to_string(),
            )),
            (None, Some(_)) => Err(ConfigError::ValidationError(
                "key_path set but cert_path not set".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
