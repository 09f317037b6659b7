//! Filesystem watcher for session transcripts.
//!
//! Watches the projects directory for `.jsonl` changes and classifies them
//! against a known-session set: an unknown path that appears or grows is
//! [`SessionEvent::Added`], a known path that grows is
//! [`SessionEvent::Changed`], and a deleted path is
//! [`SessionEvent::Removed`]. The known set is seeded from a directory scan
//! taken before the watch subscription starts, so pre-existing transcripts
//! never replay as additions.
//!
//! The notify callback stays lightweight: it filters by extension and
//! forwards paths over a channel. Classification, debouncing, and
//! [`SessionInfo`] construction happen on a dedicated async task. Bursts of
//! writes to one file are coalesced by a keyed [`Debouncer`] so downstream
//! sees at most one event per file per quiet interval.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{
    event::{CreateKind, ModifyKind, RemoveKind},
    Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};

use crate::scanner::{self, SessionInfo};
use crate::utils::Debouncer;

/// Errors that can occur while setting up or running the watcher.
#[derive(Error, Debug)]
pub enum WatcherError {
    /// Failed to initialize the filesystem watcher.
    #[error("failed to create watcher: {0}")]
    Init(#[from] notify::Error),

    /// The projects directory does not exist.
    #[error("watch directory does not exist: {0}")]
    DirectoryNotFound(PathBuf),

    /// The downstream event channel is closed.
    #[error("event channel closed")]
    ChannelClosed,
}

/// Lifecycle state of a [`SessionWatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    /// Created but not started.
    Idle,
    /// Watching and emitting events.
    Running,
    /// Stopped; a stopped watcher is not restartable.
    Stopped,
}

/// A classified change to the session population.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A transcript appeared that was not in the known set.
    Added(SessionInfo),
    /// A known transcript grew or was rewritten.
    Changed(SessionInfo),
    /// A known transcript was deleted; carries the session id.
    Removed(String),
}

/// Raw change kind forwarded from the notify callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RawChange {
    Created,
    Modified,
    Removed,
}

/// Watches the projects directory and emits [`SessionEvent`]s.
pub struct SessionWatcher {
    projects_dir: PathBuf,
    debounce: Duration,
    state: WatcherState,
    // Dropping the notify handle cancels the subscription.
    notify_handle: Option<RecommendedWatcher>,
    stop_tx: Option<watch::Sender<bool>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl SessionWatcher {
    pub fn new(projects_dir: PathBuf, debounce: Duration) -> Self {
        Self {
            projects_dir,
            debounce,
            state: WatcherState::Idle,
            notify_handle: None,
            stop_tx: None,
            task: None,
        }
    }

    pub fn state(&self) -> WatcherState {
        self.state
    }

    pub fn projects_dir(&self) -> &Path {
        &self.projects_dir
    }

    /// Starts watching, emitting events on `events`.
    ///
    /// The known-session baseline is captured before the subscription
    /// begins, so anything already on disk is treated as pre-existing.
    pub fn start(&mut self, events: mpsc::Sender<SessionEvent>) -> Result<(), WatcherError> {
        if self.state != WatcherState::Idle {
            return Ok(());
        }
        if !self.projects_dir.exists() {
            return Err(WatcherError::DirectoryNotFound(self.projects_dir.clone()));
        }

        let known: HashSet<PathBuf> = scanner::scan_sessions(&self.projects_dir)
            .into_iter()
            .map(|s| s.path)
            .collect();
        debug!(baseline = known.len(), "captured session baseline");

        let (raw_tx, raw_rx) = mpsc::channel::<(PathBuf, RawChange)>(1024);
        let (stop_tx, stop_rx) = watch::channel(false);

        let task = tokio::spawn(watch_task(
            known,
            self.debounce,
            raw_rx,
            stop_rx,
            events,
        ));

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| forward_notify_event(res, &raw_tx),
            Config::default(),
        )?;
        watcher.watch(&self.projects_dir, RecursiveMode::Recursive)?;
        info!(dir = %self.projects_dir.display(), "session watcher started");

        self.notify_handle = Some(watcher);
        self.stop_tx = Some(stop_tx);
        self.task = Some(task);
        self.state = WatcherState::Running;
        Ok(())
    }

    /// Stops the watcher and waits for its task to finish.
    pub async fn stop(&mut self) {
        if self.state != WatcherState::Running {
            self.state = WatcherState::Stopped;
            return;
        }
        // Cancel the subscription first so no new raw events arrive.
        self.notify_handle = None;
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(true);
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "watcher task did not shut down cleanly");
            }
        }
        self.state = WatcherState::Stopped;
        info!("session watcher stopped");
    }
}

/// Filters and forwards one notify event onto the raw channel. Runs on the
/// notify thread, so it must not block.
fn forward_notify_event(
    res: Result<Event, notify::Error>,
    raw_tx: &mpsc::Sender<(PathBuf, RawChange)>,
) {
    let event = match res {
        Ok(event) => event,
        Err(e) => {
            error!(error = %e, "filesystem watch error");
            return;
        }
    };

    for path in &event.paths {
        if path.extension().and_then(|ext| ext.to_str()) != Some("jsonl") {
            continue;
        }
        let change = match event.kind {
            EventKind::Create(CreateKind::File) | EventKind::Create(CreateKind::Any) => {
                RawChange::Created
            }
            EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any) => {
                RawChange::Modified
            }
            EventKind::Remove(RemoveKind::File) | EventKind::Remove(RemoveKind::Any) => {
                RawChange::Removed
            }
            _ => {
                trace!(kind = ?event.kind, "ignoring event kind");
                continue;
            }
        };
        // Missing a raw event under pressure beats blocking the notify thread.
        if raw_tx.try_send((path.clone(), change)).is_err() {
            warn!(path = %path.display(), "raw event channel full, dropping event");
        }
    }
}

/// Classification task: debounces raw changes per path, then resolves them
/// against the known-session set.
async fn watch_task(
    mut known: HashSet<PathBuf>,
    debounce: Duration,
    mut raw_rx: mpsc::Receiver<(PathBuf, RawChange)>,
    mut stop_rx: watch::Receiver<bool>,
    events: mpsc::Sender<SessionEvent>,
) {
    let (deb_tx, mut deb_rx) = mpsc::channel::<(PathBuf, RawChange)>(1024);
    let debouncer = Debouncer::new(debounce, deb_tx);

    loop {
        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
            raw = raw_rx.recv() => match raw {
                Some((path, change)) => {
                    // Removal coalesces over any earlier create/modify for
                    // the same path; the reverse (recreate after remove)
                    // also resolves correctly since only the last change
                    // within the window survives.
                    if debouncer.send(path, change).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            settled = deb_rx.recv() => match settled {
                Some((path, change)) => {
                    if let Some(event) = classify(&mut known, path, change) {
                        if events.send(event).await.is_err() {
                            debug!("event receiver dropped, stopping watch task");
                            break;
                        }
                    }
                }
                None => break,
            },
        }
    }
}

/// Resolves one settled change against the known set.
fn classify(
    known: &mut HashSet<PathBuf>,
    path: PathBuf,
    change: RawChange,
) -> Option<SessionEvent> {
    match change {
        RawChange::Removed => {
            if !known.remove(&path) {
                return None;
            }
            let session_id = path.file_stem()?.to_string_lossy().into_owned();
            Some(SessionEvent::Removed(session_id))
        }
        RawChange::Created | RawChange::Modified => {
            let info = scanner::session_info_for(&path)?;
            if known.insert(path) {
                Some(SessionEvent::Added(info))
            } else {
                Some(SessionEvent::Changed(info))
            }
        }
    }
}
