//! Stream abstraction over plain TCP and TLS-terminated connections.
//!
//! The listener hands every accepted connection to its handler as a
//! [`MaybeTlsStream`], so handlers stay agnostic of the transport mode.

use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream as ServerTlsStream;

pin_project! {
    /// An accepted connection, either plain TCP or TLS-terminated.
    #[project = MaybeTlsStreamProj]
    pub enum MaybeTlsStream {
        Plain { #[pin] stream: TcpStream },
        Secure { #[pin] stream: ServerTlsStream<TcpStream> },
    }
}

impl MaybeTlsStream {
    /// Returns whether this stream is TLS-terminated.
    pub fn is_secure(&self) -> bool {
        matches!(self, MaybeTlsStream::Secure { .. })
    }

    /// Protocol label for log lines.
    pub fn protocol(&self) -> &'static str {
        match self {
            MaybeTlsStream::Plain { .. } => "tcp",
            MaybeTlsStream::Secure { .. } => "tls",
        }
    }

    /// Returns the peer address of the underlying TCP stream.
    pub fn peer_addr(&self) -> io::Result<std::net::SocketAddr> {
        match self {
            MaybeTlsStream::Plain { stream } => stream.peer_addr(),
            MaybeTlsStream::Secure { stream } => stream.get_ref().0.peer_addr(),
        }
    }
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            MaybeTlsStreamProj::Plain { stream } => stream.poll_read(cx, buf),
            MaybeTlsStreamProj::Secure { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            MaybeTlsStreamProj::Plain { stream } => stream.poll_write(cx, buf),
            MaybeTlsStreamProj::Secure { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            MaybeTlsStreamProj::Plain { stream } => stream.poll_flush(cx),
            MaybeTlsStreamProj::Secure { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            MaybeTlsStreamProj::Plain { stream } => stream.poll_shutdown(cx),
            MaybeTlsStreamProj::Secure { stream } => stream.poll_shutdown(cx),
        }
    }
}
