//! # certswap-server
//!
//! TCP/TLS listener with live certificate rotation.
//!
//! This crate provides:
//! - A protocol-agnostic listener that terminates TLS or serves plain TCP
//! - Certificate/key file watching with atomic-replace (inode) detection
//! - Debounced, hot-swapped TLS context rebuilds that never drop the socket
//! - Connection tracking with optional force-close on shutdown
//! - Fallback to plain TCP when the initial TLS context cannot be built

pub mod config;
pub mod error;
pub mod handler;
pub mod listener;
pub mod stream;
pub mod tls;
pub mod watcher;

pub use config::{Config, ConfigError, NetworkConfig, TlsConfig};
pub use error::ServerError;
pub use handler::{ConnectionHandler, EchoHandler};
pub use listener::SecureListener;
pub use stream::MaybeTlsStream;
pub use watcher::{FileEvent, FileIdentity, FileWatcher};
