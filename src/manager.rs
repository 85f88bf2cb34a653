//! Tail manager: turns directory events into per-file tailer tasks.
//!
//! The registration table lives inside [`TailManager::run`] and is only ever
//! touched from that loop. Everything else (the directory watcher, shutdown,
//! status queries) reaches it through [`TailManagerHandle`].

use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::delivery::DeliveryError;
use crate::tail::{FileTailer, StartPosition};

#[derive(Debug, Error)]
pub enum TailError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to watch {path}: {source}")]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    #[error("delivery of a line from {path} failed: {source}")]
    Delivery {
        path: PathBuf,
        #[source]
        source: DeliveryError,
    },

    #[error("tail manager is no longer running")]
    ManagerStopped,
}

/// Receives every line read by every tailer, in per-file order.
#[async_trait]
pub trait LineHandler: Send + Sync {
    async fn handle(&self, path: &Path, line: String) -> Result<(), DeliveryError>;
}

#[derive(Debug, Clone)]
pub struct TailSettings {
    pub dir: PathBuf,
    pub suffix: String,
    pub poll_interval: Duration,
}

impl TailSettings {
    fn matches(&self, path: &Path) -> bool {
        path.parent() == Some(self.dir.as_path())
            && path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.ends_with(&self.suffix))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirEvent {
    Created(PathBuf),
    Removed(PathBuf),
}

#[derive(Debug)]
pub enum ManagerCommand {
    Dir(DirEvent),
    Tracked(oneshot::Sender<Vec<PathBuf>>),
    Shutdown,
}

#[derive(Clone)]
pub struct TailManagerHandle {
    tx: mpsc::UnboundedSender<ManagerCommand>,
}

impl TailManagerHandle {
    pub fn notify(&self, event: DirEvent) -> Result<(), mpsc::error::SendError<ManagerCommand>> {
        self.tx.send(ManagerCommand::Dir(event))
    }

    /// Paths that currently have a registered tailer, sorted.
    pub async fn tracked(&self) -> Result<Vec<PathBuf>, TailError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(ManagerCommand::Tracked(response_tx))
            .map_err(|_| TailError::ManagerStopped)?;
        response_rx.await.map_err(|_| TailError::ManagerStopped)
    }

    pub fn shutdown(&self) -> Result<(), mpsc::error::SendError<ManagerCommand>> {
        self.tx.send(ManagerCommand::Shutdown)
    }
}

struct Registration {
    id: u64,
    start: StartPosition,
    cancel: CancellationToken,
}

type TailerOutcome = (PathBuf, u64, Result<(), TailError>);

pub struct TailManager {
    settings: TailSettings,
    handler: Arc<dyn LineHandler>,
    rx: mpsc::UnboundedReceiver<ManagerCommand>,
    tailers: HashMap<PathBuf, Registration>,
    tasks: JoinSet<TailerOutcome>,
    next_id: u64,
}

impl TailManager {
    pub fn new(settings: TailSettings, handler: Arc<dyn LineHandler>) -> (Self, TailManagerHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = Self {
            settings,
            handler,
            rx,
            tailers: HashMap::new(),
            tasks: JoinSet::new(),
            next_id: 0,
        };
        (manager, TailManagerHandle { tx })
    }

    /// Scans the directory, then serves commands until shutdown. Returns an
    /// error if the scan fails or any tailer exhausts its delivery attempts.
    ///
    /// Create events queued before the scan (the watch is usually installed
    /// first) decide the start position of the files they name.
    pub async fn run(mut self) -> Result<(), TailError> {
        let (announced, backlog) = self.drain_backlog();
        if let Err(e) = self.scan_existing(&announced).await {
            self.stop_all().await;
            return Err(e);
        }
        debug!(dir = %self.settings.dir.display(), "tail manager started");

        let mut stopped = false;
        for command in backlog {
            if self.on_command(Some(command)).await.is_break() {
                stopped = true;
                break;
            }
        }

        let result = loop {
            if stopped {
                break Ok(());
            }
            tokio::select! {
                command = self.rx.recv() => {
                    stopped = self.on_command(command).await.is_break();
                }
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = self.on_tailer_exit(joined) {
                        break Err(e);
                    }
                }
            }
        };

        self.stop_all().await;
        debug!("tail manager stopped");
        result
    }

    async fn on_command(&mut self, command: Option<ManagerCommand>) -> ControlFlow<()> {
        match command {
            Some(ManagerCommand::Dir(event)) => self.on_dir_event(event).await,
            Some(ManagerCommand::Tracked(response_tx)) => {
                let mut paths: Vec<PathBuf> = self.tailers.keys().cloned().collect();
                paths.sort();
                if response_tx.send(paths).is_err() {
                    error!("Failed to send tracked response - receiver dropped");
                }
            }
            Some(ManagerCommand::Shutdown) | None => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    /// Takes every command already queued. Directory events are folded into
    /// the set of paths created since the watch began; the scan reflects
    /// their current state, so they are not replayed.
    fn drain_backlog(&mut self) -> (HashSet<PathBuf>, Vec<ManagerCommand>) {
        let mut announced = HashSet::new();
        let mut backlog = Vec::new();
        while let Ok(command) = self.rx.try_recv() {
            match command {
                ManagerCommand::Dir(DirEvent::Created(path)) => {
                    announced.insert(path);
                }
                ManagerCommand::Dir(DirEvent::Removed(path)) => {
                    announced.remove(&path);
                }
                other => backlog.push(other),
            }
        }
        (announced, backlog)
    }

    async fn scan_existing(&mut self, announced: &HashSet<PathBuf>) -> Result<(), TailError> {
        let dir = self.settings.dir.clone();
        let io_err = |source| TailError::Io {
            path: dir.clone(),
            source,
        };
        let mut entries = tokio::fs::read_dir(&dir).await.map_err(io_err)?;
        let mut found = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let path = entry.path();
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            if is_file && self.settings.matches(&path) {
                found.push(path);
            }
        }
        found.sort();
        for path in found {
            let start = if announced.contains(&path) {
                StartPosition::Beginning
            } else {
                StartPosition::End
            };
            self.start_tailer(path, start).await;
        }
        Ok(())
    }

    async fn on_dir_event(&mut self, event: DirEvent) {
        match event {
            DirEvent::Created(path) => {
                if !self.settings.matches(&path) {
                    return;
                }
                if tokio::fs::metadata(&path).await.is_ok_and(|m| m.is_dir()) {
                    return;
                }
                if let Some(registration) = self.tailers.get(&path) {
                    if registration.start == StartPosition::Beginning {
                        warn!(path = %path.display(), "create event for a file that is already tailed, ignoring");
                        return;
                    }
                    // The scan picked it up at its end, but the file is newer
                    // than the watch, so all of its content is unsent.
                    info!(path = %path.display(), "file created during startup scan, reading from the start");
                    if let Some(stale) = self.tailers.remove(&path) {
                        stale.cancel.cancel();
                    }
                }
                self.start_tailer(path, StartPosition::Beginning).await;
            }
            DirEvent::Removed(path) => {
                if let Some(registration) = self.tailers.remove(&path) {
                    info!(path = %path.display(), "file removed, stopping tailer");
                    registration.cancel.cancel();
                }
            }
        }
    }

    /// Opens the file before registering it, so the start position is fixed
    /// at the moment the file is discovered.
    async fn start_tailer(&mut self, path: PathBuf, start: StartPosition) {
        let tailer = match FileTailer::open(&path, start, self.settings.poll_interval).await {
            Ok(tailer) => tailer,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to open file for tailing");
                return;
            }
        };
        let id = self.next_id;
        self.next_id += 1;
        let cancel = CancellationToken::new();
        self.tailers.insert(
            path.clone(),
            Registration {
                id,
                start,
                cancel: cancel.clone(),
            },
        );

        let handler = Arc::clone(&self.handler);
        self.tasks.spawn(async move {
            let result = tail_file(tailer, handler, cancel).await;
            (path, id, result)
        });
    }

    fn on_tailer_exit(
        &mut self,
        joined: Result<TailerOutcome, tokio::task::JoinError>,
    ) -> Result<(), TailError> {
        let (path, id, result) = match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "tailer task panicked");
                return Ok(());
            }
        };
        // Only drop the entry if it still belongs to this tailer; the path may
        // have been removed and recreated since.
        if self.tailers.get(&path).is_some_and(|r| r.id == id) {
            self.tailers.remove(&path);
        }
        match result {
            Ok(()) => {
                debug!(path = %path.display(), "tailer finished");
                Ok(())
            }
            Err(e @ TailError::Delivery { .. }) => Err(e),
            Err(e) => {
                warn!(error = %e, "tailer stopped");
                Ok(())
            }
        }
    }

    async fn stop_all(&mut self) {
        for (_, registration) in self.tailers.drain() {
            registration.cancel.cancel();
        }
        // Tailers already delivering a line finish that line before exiting.
        while let Some(joined) = self.tasks.join_next().await {
            if let Ok((path, _, Err(e))) = joined {
                warn!(path = %path.display(), error = %e, "tailer ended with error during shutdown");
            }
        }
    }
}

async fn tail_file(
    mut tailer: FileTailer,
    handler: Arc<dyn LineHandler>,
    cancel: CancellationToken,
) -> Result<(), TailError> {
    let path = tailer.path().to_path_buf();
    loop {
        let line = match tailer.next_line(&cancel).await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(source) => return Err(TailError::Io { path, source }),
        };
        if let Err(source) = handler.handle(&path, line).await {
            return Err(TailError::Delivery { path, source });
        }
    }
    drop(tailer);
    debug!(path = %path.display(), "tailer released file");
    Ok(())
}

/// Translates raw watcher events into create/remove notifications. Renames
/// become a remove of the old name and a create of the new one.
pub fn dir_events(event: &Event) -> Vec<DirEvent> {
    match &event.kind {
        EventKind::Create(_) => event.paths.iter().cloned().map(DirEvent::Created).collect(),
        EventKind::Remove(_) => event.paths.iter().cloned().map(DirEvent::Removed).collect(),
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::From => event.paths.iter().cloned().map(DirEvent::Removed).collect(),
            RenameMode::To => event.paths.iter().cloned().map(DirEvent::Created).collect(),
            // Backends that pair both halves also report them as From and To.
            RenameMode::Both => Vec::new(),
            _ => event
                .paths
                .iter()
                .map(|path| {
                    if path.exists() {
                        DirEvent::Created(path.clone())
                    } else {
                        DirEvent::Removed(path.clone())
                    }
                })
                .collect(),
        },
        _ => Vec::new(),
    }
}

/// Starts a non-recursive watch on `dir` that feeds the manager. The watch
/// stops when the returned watcher is dropped.
pub fn watch_directory(dir: &Path, handle: TailManagerHandle) -> Result<RecommendedWatcher, TailError> {
    let watch_err = |source| TailError::Watch {
        path: dir.to_path_buf(),
        source,
    };
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            for dir_event in dir_events(&event) {
                if handle.notify(dir_event).is_err() {
                    debug!("tail manager gone, dropping directory event");
                }
            }
        }
        Err(e) => warn!(error = %e, "directory watch error"),
    })
    .map_err(watch_err)?;
    watcher
        .watch(dir, RecursiveMode::NonRecursive)
        .map_err(watch_err)?;
    info!(dir = %dir.display(), "watching directory");
    Ok(watcher)
}
