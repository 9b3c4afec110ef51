//! Connection handler seam.
//!
//! The listener is protocol-agnostic above the transport: it accepts and
//! tracks connections, terminates TLS, and hands the stream to a
//! [`ConnectionHandler`] supplied by the application.

use crate::error::ServerError;
use crate::stream::MaybeTlsStream;
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Handles one accepted connection.
///
/// The handler owns the stream until it returns; returning (with or without
/// an error) closes the connection and removes it from the tracked set.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    async fn handle(&self, stream: MaybeTlsStream, addr: SocketAddr) -> Result<(), ServerError>;
}

/// Echoes received bytes back to the client until EOF.
///
/// Default handler for the certswap binary; also exercises both transport
/// modes in tests.
pub struct EchoHandler;

#[async_trait]
impl ConnectionHandler for EchoHandler {
    async fn handle(&self, mut stream: MaybeTlsStream, _addr: SocketAddr) -> Result<(), ServerError> {
        let mut buf = [0u8; 8192];
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            stream.write_all(&buf[..n]).await?;
            stream.flush().await?;
        }
    }
}
