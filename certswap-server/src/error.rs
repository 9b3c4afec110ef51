//! Server error types.

use crate::config::ConfigError;
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    #[error("file watch error: {0}")]
    Watch(String),
}

impl ServerError {
    /// Returns whether the error leaves the listener in a usable state.
    ///
    /// Rotation and per-connection failures are recoverable: the listener
    /// keeps serving with its previous TLS context. Config errors are not.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ServerError::Config(_))
    }
}
