//! Single-file change watching with atomic-replace detection.
//!
//! Certificate managers typically renew by writing a new file and renaming
//! it over the old path. On inotify-class platforms the native watch follows
//! the old inode and goes silent after such a replacement, so the watcher
//! re-stats the path on every event and re-establishes the native watch
//! whenever the file identity changed.

use crate::error::ServerError;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Capacity of the bridge channel between notify's callback thread and the
/// watcher task. Bursts beyond this are dropped; the consumer debounces
/// anyway.
const RAW_EVENT_BUFFER: usize = 16;

/// Whether file identity (inode) is checked on change events.
///
/// Passed in at construction so callers and tests pick the behavior
/// explicitly instead of consulting platform state at event time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileIdentity {
    /// Stat the file on every native event and re-watch when the inode
    /// changed (the file was replaced under the same path).
    Tracked,
    /// Forward every native event without identity checks.
    Ignored,
}

impl FileIdentity {
    /// Detects the capability for the current platform. Inode numbers are
    /// only treated as reliable on Linux.
    pub fn detect() -> Self {
        if cfg!(target_os = "linux") {
            FileIdentity::Tracked
        } else {
            FileIdentity::Ignored
        }
    }
}

/// Logical event delivered to the watcher's consumer.
#[derive(Debug)]
pub enum FileEvent {
    /// The watched file's content or identity changed.
    Changed(PathBuf),
    /// The watcher can no longer observe the path (e.g. it was deleted
    /// without replacement). The watcher stops after sending this; the
    /// consumer decides whether to recreate it.
    Lost(PathBuf, ServerError),
}

/// Watches one file path and forwards logical change events.
pub struct FileWatcher {
    task: Option<JoinHandle<()>>,
}

impl FileWatcher {
    /// Starts watching `path`, delivering [`FileEvent`]s on `tx`.
    ///
    /// Fails if the path cannot be watched or (with [`FileIdentity::Tracked`])
    /// cannot be stat'ed.
    pub fn spawn(
        path: impl AsRef<Path>,
        identity: FileIdentity,
        tx: mpsc::Sender<FileEvent>,
    ) -> Result<Self, ServerError> {
        let path = path.as_ref().to_path_buf();

        let inode = match identity {
            FileIdentity::Tracked => Some(stat_inode(&path)?),
            FileIdentity::Ignored => None,
        };

        let (raw_tx, raw_rx) = mpsc::channel::<()>(RAW_EVENT_BUFFER);
        let native = native_watch(&path, raw_tx.clone())?;

        let task = tokio::spawn(run(path, identity, inode, native, raw_tx, raw_rx, tx));

        Ok(Self { task: Some(task) })
    }

    /// Stops watching. Idempotent; also runs on drop.
    pub fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.close();
    }
}

/// Watcher event loop: bridges native events into logical change events,
/// re-watching whenever the file identity changes.
async fn run(
    path: PathBuf,
    identity: FileIdentity,
    mut inode: Option<u64>,
    native: RecommendedWatcher,
    raw_tx: mpsc::Sender<()>,
    mut raw_rx: mpsc::Receiver<()>,
    tx: mpsc::Sender<FileEvent>,
) {
    // Holding the native watcher here keeps the watch registered; it is
    // replaced in-place when the file identity changes.
    let mut native = native;

    while raw_rx.recv().await.is_some() {
        if identity == FileIdentity::Tracked {
            let current = match stat_inode(&path) {
                Ok(ino) => ino,
                Err(e) => {
                    let _ = tx.send(FileEvent::Lost(path.clone(), e)).await;
                    return;
                }
            };

            if Some(current) != inode {
                // The file was replaced; the old native watch points at the
                // dead inode and would stop delivering events.
                tracing::debug!(
                    "file {} replaced (inode {:?} -> {}), re-establishing watch",
                    path.display(),
                    inode,
                    current
                );
                match native_watch(&path, raw_tx.clone()) {
                    Ok(watcher) => {
                        native = watcher;
                        inode = Some(current);
                    }
                    Err(e) => {
                        let _ = tx.send(FileEvent::Lost(path.clone(), e)).await;
                        return;
                    }
                }
            }
        }

        if tx.send(FileEvent::Changed(path.clone())).await.is_err() {
            // Consumer gone, nothing left to notify.
            return;
        }
    }

    drop(native);
}

/// Establishes a native watch on `path`, forwarding relevant events as unit
/// signals on `raw_tx`.
fn native_watch(path: &Path, raw_tx: mpsc::Sender<()>) -> Result<RecommendedWatcher, ServerError> {
    let mut watcher = RecommendedWatcher::new(
        move |result: notify::Result<Event>| match result {
            Ok(event) => {
                if is_relevant(&event.kind) {
                    // Runs on notify's thread; drop events past capacity.
                    let _ = raw_tx.try_send(());
                }
            }
            Err(e) => {
                tracing::warn!("file watch backend error: {}", e);
            }
        },
        notify::Config::default(),
    )
    .map_err(|e| ServerError::Watch(format!("cannot create watcher: {}", e)))?;

    watcher
        .watch(path, RecursiveMode::NonRecursive)
        .map_err(|e| ServerError::Watch(format!("cannot watch {}: {}", path.display(), e)))?;

    Ok(watcher)
}

fn is_relevant(kind: &EventKind) -> bool {
    // Access events fire on reads (including our own) and carry no change.
    !matches!(kind, EventKind::Access(_))
}

#[cfg(unix)]
fn stat_inode(path: &Path) -> Result<u64, ServerError> {
    use std::os::unix::fs::MetadataExt;
    let metadata = std::fs::metadata(path)
        .map_err(|e| ServerError::Watch(format!("cannot stat {}: {}", path.display(), e)))?;
    Ok(metadata.ino())
}

#[cfg(not(unix))]
fn stat_inode(path: &Path) -> Result<u64, ServerError> {
    // No usable identity token; pretend the identity never changes.
    std::fs::metadata(path)
        .map_err(|e| ServerError::Watch(format!("cannot stat {}: {}", path.display(), e)))?;
    Ok(0)
}
