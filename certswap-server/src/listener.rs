//! TCP/TLS listener with live certificate rotation.
//!
//! The listener binds once and keeps the socket for its whole lifetime.
//! In TLS mode the certificate and key files are watched; changes are
//! debounced into a single context rebuild that is hot-swapped into the
//! acceptor. Handshakes negotiated before a swap keep their old context.

use crate::config::Config;
use crate::error::ServerError;
use crate::handler::ConnectionHandler;
use crate::stream::MaybeTlsStream;
use crate::tls;
use crate::watcher::{FileEvent, FileIdentity, FileWatcher};
use arc_swap::ArcSwap;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;

/// Capacity of the watcher-to-listener change channel.
const CHANGE_EVENT_BUFFER: usize = 16;

/// Transport mode, fixed at construction.
enum ListenerMode {
    /// Plain TCP; certificate rotation is inert.
    Plain,
    /// TLS termination. New handshakes read the context cell; rotation
    /// stores a fresh context into it.
    Secure {
        context: Arc<ArcSwap<rustls::ServerConfig>>,
    },
}

/// Debounce state for certificate rotation.
///
/// The delay is measured from the first change since the last rebuild;
/// further changes while pending are coalesced and do not reset the timer.
#[derive(Debug, Clone, Copy)]
enum RebuildState {
    Idle,
    Pending { deadline: Instant },
}

/// State that exists only while the listener is running.
struct Active {
    local_addr: SocketAddr,
    shutdown: broadcast::Sender<()>,
    accept_task: JoinHandle<()>,
    watchers: Vec<FileWatcher>,
}

/// A TCP listener with optional TLS termination and live certificate
/// rotation.
///
/// `start` and `stop` are idempotent and may be called repeatedly; the
/// transport mode is decided once at construction and never changes.
pub struct SecureListener {
    config: Config,
    mode: ListenerMode,
    handler: Arc<dyn ConnectionHandler>,
    connections: Arc<DashMap<u64, AbortHandle>>,
    next_conn_id: Arc<AtomicU64>,
    rotations: Arc<AtomicU64>,
    active: Option<Active>,
}

impl SecureListener {
    /// Creates a new listener.
    ///
    /// If TLS paths are configured but the initial context cannot be built,
    /// the listener logs the failure and falls back to plain TCP for the
    /// rest of its lifetime; TLS is not retried.
    pub fn new(config: Config, handler: Arc<dyn ConnectionHandler>) -> Result<Self, ServerError> {
        config.validate()?;

        let mode = match config.tls.paths() {
            Some((cert_path, key_path)) => match tls::build_server_config(cert_path, key_path) {
                Ok(server_config) => ListenerMode::Secure {
                    context: Arc::new(ArcSwap::from_pointee(server_config)),
                },
                Err(e) => {
                    tracing::error!("{}", e);
                    tracing::warn!("could not create TLS listener, switching to plain TCP");
                    ListenerMode::Plain
                }
            },
            None => ListenerMode::Plain,
        };

        Ok(Self {
            config,
            mode,
            handler,
            connections: Arc::new(DashMap::new()),
            next_conn_id: Arc::new(AtomicU64::new(0)),
            rotations: Arc::new(AtomicU64::new(0)),
            active: None,
        })
    }

    /// Starts watching certificate files (TLS mode) and listening.
    ///
    /// No-op when already listening.
    pub async fn start(&mut self) -> Result<(), ServerError> {
        if self.active.is_some() {
            tracing::debug!("listener already running");
            return Ok(());
        }

        let (change_tx, change_rx) = mpsc::channel(CHANGE_EVENT_BUFFER);

        let mut watchers = Vec::new();
        let mut rotation = None;
        if let ListenerMode::Secure { context } = &self.mode {
            if let Some((cert_path, key_path)) = self.config.tls.paths() {
                let identity = FileIdentity::detect();
                watchers.push(FileWatcher::spawn(cert_path, identity, change_tx.clone())?);
                watchers.push(FileWatcher::spawn(key_path, identity, change_tx.clone())?);
                rotation = Some(Rotation {
                    context: context.clone(),
                    cert_path: cert_path.to_path_buf(),
                    key_path: key_path.to_path_buf(),
                    delay: self.config.tls.rotation_delay(),
                });
            }
        }
        drop(change_tx);

        let listener = TcpListener::bind((
            self.config.network.hostname.as_str(),
            self.config.network.port,
        ))
        .await?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let accept_loop = AcceptLoop {
            listener,
            rotation,
            handler: self.handler.clone(),
            connections: self.connections.clone(),
            next_conn_id: self.next_conn_id.clone(),
            rotations: self.rotations.clone(),
            changes: change_rx,
            shutdown: shutdown_rx,
        };
        let accept_task = tokio::spawn(accept_loop.run());

        let mode = if self.is_secure() { "TLS" } else { "plain" };
        tracing::info!("listener running on {} ({})", local_addr, mode);

        self.active = Some(Active {
            local_addr,
            shutdown: shutdown_tx,
            accept_task,
            watchers,
        });

        Ok(())
    }

    /// Stops watching, stops accepting, and optionally force-closes every
    /// tracked connection.
    ///
    /// No-op when not listening. With `close_all_connections` false,
    /// established connections drain naturally and stay tracked until they
    /// close on their own.
    pub async fn stop(&mut self, close_all_connections: bool) {
        let Some(mut active) = self.active.take() else {
            tracing::debug!("listener already stopped");
            return;
        };

        for watcher in &mut active.watchers {
            watcher.close();
        }

        // A pending debounce dies with the accept task; a rebuild that is
        // already reading files runs to completion before the task observes
        // the signal.
        let _ = active.shutdown.send(());
        let _ = active.accept_task.await;

        if close_all_connections {
            let closed = self.connections.len();
            for entry in self.connections.iter() {
                entry.value().abort();
            }
            self.connections.clear();
            if closed > 0 {
                tracing::info!("force-closed {} connection(s)", closed);
            }
        }

        tracing::info!("listener stopped");
    }

    /// Returns whether the listener is currently accepting connections.
    pub fn is_listening(&self) -> bool {
        self.active.is_some()
    }

    /// Returns whether the listener terminates TLS.
    pub fn is_secure(&self) -> bool {
        matches!(self.mode, ListenerMode::Secure { .. })
    }

    /// Returns the bound address while listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.active.as_ref().map(|active| active.local_addr)
    }

    /// Number of currently tracked (open) connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of successful certificate rotations since construction.
    pub fn rotation_count(&self) -> u64 {
        self.rotations.load(Ordering::Relaxed)
    }

    /// Snapshot of the active TLS context, if any. Successive calls return
    /// the same `Arc` until a rotation succeeds.
    pub fn tls_context(&self) -> Option<Arc<rustls::ServerConfig>> {
        match &self.mode {
            ListenerMode::Secure { context } => Some(context.load_full()),
            ListenerMode::Plain => None,
        }
    }
}

/// Rotation inputs owned by the accept loop.
struct Rotation {
    context: Arc<ArcSwap<rustls::ServerConfig>>,
    cert_path: PathBuf,
    key_path: PathBuf,
    delay: Duration,
}

/// The accept loop: one task multiplexing accepts, certificate change
/// events, the rotation deadline, and shutdown.
struct AcceptLoop {
    listener: TcpListener,
    rotation: Option<Rotation>,
    handler: Arc<dyn ConnectionHandler>,
    connections: Arc<DashMap<u64, AbortHandle>>,
    next_conn_id: Arc<AtomicU64>,
    rotations: Arc<AtomicU64>,
    changes: mpsc::Receiver<FileEvent>,
    shutdown: broadcast::Receiver<()>,
}

impl AcceptLoop {
    async fn run(self) {
        let AcceptLoop {
            listener,
            rotation,
            handler,
            connections,
            next_conn_id,
            rotations,
            mut changes,
            mut shutdown,
        } = self;

        let mut rebuild = RebuildState::Idle;
        let mut watching = rotation.is_some();

        loop {
            let deadline = match rebuild {
                RebuildState::Pending { deadline } => Some(deadline),
                RebuildState::Idle => None,
            };

            tokio::select! {
                result = listener.accept() => match result {
                    Ok((tcp, addr)) => {
                        let context = rotation.as_ref().map(|r| r.context.clone());
                        spawn_connection(
                            tcp,
                            addr,
                            context,
                            handler.clone(),
                            connections.clone(),
                            &next_conn_id,
                        );
                    }
                    Err(e) => {
                        // Transient accept failures must not stop the listener.
                        tracing::error!("accept error: {}", e);
                    }
                },

                event = changes.recv(), if watching => match event {
                    Some(FileEvent::Changed(path)) => {
                        tracing::debug!("certificate file changed: {}", path.display());
                        if let (RebuildState::Idle, Some(rotation)) = (rebuild, &rotation) {
                            rebuild = RebuildState::Pending {
                                deadline: Instant::now() + rotation.delay,
                            };
                            tracing::info!(
                                "TLS context rebuild scheduled in {:?}",
                                rotation.delay
                            );
                        }
                    }
                    Some(FileEvent::Lost(path, e)) => {
                        tracing::error!("lost watch on {}: {}", path.display(), e);
                    }
                    None => watching = false,
                },

                _ = sleep_until_deadline(deadline), if deadline.is_some() => {
                    rebuild = RebuildState::Idle;
                    if let Some(rotation) = &rotation {
                        rebuild_context(rotation, &rotations).await;
                    }
                },

                _ = shutdown.recv() => break,
            }
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Reads both certificate files and swaps in a fresh context on success.
/// On failure the previous context stays active; the next file change
/// schedules another attempt.
async fn rebuild_context(rotation: &Rotation, rotations: &AtomicU64) {
    let cert_path = rotation.cert_path.clone();
    let key_path = rotation.key_path.clone();

    // File reads and parsing happen off the event loop thread.
    let result =
        tokio::task::spawn_blocking(move || tls::build_server_config(&cert_path, &key_path)).await;

    match result {
        Ok(Ok(server_config)) => {
            rotation.context.store(Arc::new(server_config));
            rotations.fetch_add(1, Ordering::Relaxed);
            tracing::info!("TLS context updated");
        }
        Ok(Err(e)) => {
            tracing::error!("{}", e);
            tracing::warn!("could not update TLS context, keeping previous one");
        }
        Err(e) => {
            tracing::error!("TLS context rebuild task failed: {}", e);
        }
    }
}

fn spawn_connection(
    tcp: TcpStream,
    addr: SocketAddr,
    context: Option<Arc<ArcSwap<rustls::ServerConfig>>>,
    handler: Arc<dyn ConnectionHandler>,
    connections: Arc<DashMap<u64, AbortHandle>>,
    next_conn_id: &AtomicU64,
) {
    let id = next_conn_id.fetch_add(1, Ordering::Relaxed);
    let (registered_tx, registered_rx) = oneshot::channel();

    let task_connections = connections.clone();
    let task = tokio::spawn(async move {
        // Wait until the accept loop has tracked this connection so the
        // set never misses a removal.
        let _ = registered_rx.await;
        handle_connection(tcp, addr, context, handler).await;
        task_connections.remove(&id);
    });

    connections.insert(id, task.abort_handle());
    let _ = registered_tx.send(());
}

async fn handle_connection(
    tcp: TcpStream,
    addr: SocketAddr,
    context: Option<Arc<ArcSwap<rustls::ServerConfig>>>,
    handler: Arc<dyn ConnectionHandler>,
) {
    let stream = match context {
        Some(context) => {
            // Each handshake snapshots the current context; connections
            // negotiated earlier keep the context they started with.
            let acceptor = TlsAcceptor::from(context.load_full());
            match acceptor.accept(tcp).await {
                Ok(stream) => MaybeTlsStream::Secure { stream },
                Err(e) => {
                    let e = ServerError::TlsHandshake(e.to_string());
                    tracing::warn!("[{}] {}", addr, e);
                    return;
                }
            }
        }
        None => MaybeTlsStream::Plain { stream: tcp },
    };

    tracing::info!("[{}] client connected ({})", addr, stream.protocol());

    if let Err(e) = handler.handle(stream, addr).await {
        if e.is_recoverable() {
            tracing::debug!("[{}] connection error: {}", addr, e);
        } else {
            tracing::error!("[{}] connection error: {}", addr, e);
        }
    }

    tracing::info!("[{}] client disconnected", addr);
}
