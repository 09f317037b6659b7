//! Coordination between discovery, parsing, liveness, and the store.
//!
//! The [`Monitor`] owns a cache of parsed snapshots keyed by transcript
//! path. Initial load does a full scan and full parses; after that,
//! watcher events drive incremental parses against the cache, and a
//! periodic refresh re-checks liveness against the process table.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::parser::{self, SessionSnapshot};
use crate::process::{self, ActivitySnapshot, ProcessInspector};
use crate::scanner::{self, SessionInfo};
use crate::store::SessionStore;
use crate::watcher::SessionEvent;

/// Drives the session store from filesystem and process observations.
pub struct Monitor {
    config: Config,
    store: Arc<SessionStore>,
    inspector: Arc<dyn ProcessInspector>,
    snapshots: Mutex<HashMap<PathBuf, SessionSnapshot>>,
}

impl Monitor {
    pub fn new(config: Config, store: Arc<SessionStore>, inspector: Arc<dyn ProcessInspector>) -> Self {
        Self {
            config,
            store,
            inspector,
            snapshots: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Scans and parses every transcript on disk, reconciling each into the
    /// store. One process snapshot covers the whole batch. Returns the
    /// number of sessions loaded; unreadable transcripts are skipped.
    pub async fn load_initial(&self) -> usize {
        let activity = self.inspector.snapshot().await;
        let sessions = scanner::scan_sessions(&self.config.projects_dir);
        let mut loaded = 0;

        for info in sessions {
            match parser::parse_full(&info.path) {
                Ok(Some(snapshot)) => {
                    self.reconcile(&info, snapshot, &activity).await;
                    loaded += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(path = %info.path.display(), error = %e, "skipping unreadable transcript");
                }
            }
        }

        info!(loaded, "initial session load complete");
        loaded
    }

    /// Applies one watcher event.
    ///
    /// Changed transcripts with a cached snapshot are parsed incrementally
    /// from the cursor; anything else gets a full parse. A removal evicts
    /// the snapshot cache but leaves the store record in place, so finished
    /// sessions stay visible after their transcript is cleaned up.
    pub async fn process_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::Added(info) | SessionEvent::Changed(info) => {
                let cached = {
                    let mut snapshots = self.snapshots.lock().await;
                    snapshots.remove(&info.path)
                };

                let snapshot = match cached {
                    Some(mut snapshot) => {
                        match parser::parse_incremental(&info.path, snapshot.cursor) {
                            Ok((entries, cursor)) => {
                                for entry in &entries {
                                    snapshot.apply(entry);
                                }
                                snapshot.cursor = cursor;
                                Some(snapshot)
                            }
                            Err(e) => {
                                warn!(path = %info.path.display(), error = %e, "incremental parse failed");
                                None
                            }
                        }
                    }
                    None => match parser::parse_full(&info.path) {
                        Ok(snapshot) => snapshot,
                        Err(e) => {
                            warn!(path = %info.path.display(), error = %e, "full parse failed");
                            None
                        }
                    },
                };

                if let Some(snapshot) = snapshot {
                    let activity = self.inspector.snapshot().await;
                    self.reconcile(&info, snapshot, &activity).await;
                }
            }
            SessionEvent::Removed(session_id) => {
                // The transcript is gone but the session's history is not:
                // the store record stays until removed explicitly.
                let mut snapshots = self.snapshots.lock().await;
                snapshots.retain(|path, _| {
                    path.file_stem()
                        .map(|stem| stem.to_string_lossy() != session_id)
                        .unwrap_or(true)
                });
                debug!(session = %session_id, "transcript removed, record retained");
            }
        }
    }

    /// Re-evaluates liveness for every known session against a fresh
    /// process snapshot, reconciling any whose activity state changed.
    pub async fn refresh_liveness(&self) {
        let activity = self.inspector.snapshot().await;

        for info in scanner::scan_sessions(&self.config.projects_dir) {
            let is_active = process::is_active(&info, self.config.activity_window, &activity);
            if let Some(record) = self.store.session(&info.session_id) {
                if record.is_active != is_active {
                    let snapshots = self.snapshots.lock().await;
                    if let Some(snapshot) = snapshots.get(&info.path) {
                        self.store.reconcile(snapshot, is_active);
                    }
                }
            }
        }
    }

    /// Spawns the periodic liveness refresh. Sending `true` on the returned
    /// channel, or dropping it, stops the loop.
    pub fn spawn_refresh_loop(self: &Arc<Self>) -> watch::Sender<bool> {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(monitor.config.refresh_interval) => {
                        monitor.refresh_liveness().await;
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("refresh loop stopped");
        });
        stop_tx
    }

    async fn reconcile(
        &self,
        info: &SessionInfo,
        snapshot: SessionSnapshot,
        activity: &ActivitySnapshot,
    ) {
        let is_active = process::is_active(info, self.config.activity_window, activity);
        self.store.reconcile(&snapshot, is_active);
        let mut snapshots = self.snapshots.lock().await;
        snapshots.insert(info.path.clone(), snapshot);
    }
}
