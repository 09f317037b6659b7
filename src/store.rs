//! In-memory store of sessions and agents.
//!
//! The store is the single writer-reconciled view the rest of the system
//! reads from. Parsed snapshots are folded in through [`SessionStore::reconcile`];
//! observers registered with [`SessionStore::observe`] are told about every
//! insert, update, and removal after the data lock has been released.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Local};
use tracing::{debug, warn};

use crate::parser::{SessionSnapshot, ToolStatus, ToolUseRecord};

/// Most recent tool invocations kept per agent.
pub const MAX_TOOL_HISTORY: usize = 20;

/// Lifecycle status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    /// Actively producing transcript entries.
    Running,
    /// Finished without error.
    Completed,
    /// Finished with an error.
    Failed,
    /// Blocked on user input.
    WaitingInput,
}

/// One agent within a session. Every session has a root agent; subagents
/// carry a `parent_id`.
#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub id: String,
    pub session_id: String,
    pub parent_id: Option<String>,
    pub agent_kind: String,
    pub description: String,
    pub status: AgentStatus,
    pub started_at: DateTime<Local>,
    pub tool_uses: Vec<ToolUseRecord>,
}

/// One session as the store presents it.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: String,
    pub cwd: Option<PathBuf>,
    pub slug: String,
    pub git_branch: Option<String>,
    pub summary: String,
    pub started_at: DateTime<Local>,
    pub last_activity: DateTime<Local>,
    pub is_active: bool,
    pub message_count: usize,
    pub root_agent_id: String,
    pub path: PathBuf,
}

/// Aggregate counters across the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreCounts {
    pub agents: usize,
    pub running_agents: usize,
    pub pending_inputs: usize,
}

/// A change notification delivered to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    /// A session was seen for the first time.
    Added(String),
    /// An existing session was reconciled.
    Updated(String),
    /// A session was removed from the store.
    Removed(String),
}

/// Handle returned by [`SessionStore::observe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type ObserverFn = Box<dyn Fn(&StoreChange) + Send + Sync>;

#[derive(Default)]
struct StoreData {
    sessions: HashMap<String, SessionRecord>,
    agents: HashMap<String, AgentRecord>,
}

struct Observers {
    next_id: u64,
    callbacks: Vec<(ObserverId, ObserverFn)>,
}

/// Thread-safe store of sessions and their agents.
///
/// Data and observer registration live behind separate locks so a callback
/// can read the store without deadlocking.
pub struct SessionStore {
    data: Mutex<StoreData>,
    observers: Mutex<Observers>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(StoreData::default()),
            observers: Mutex::new(Observers {
                next_id: 0,
                callbacks: Vec::new(),
            }),
        }
    }

    /// Registers a change observer. Observers run in registration order
    /// after each mutation, outside the data lock.
    pub fn observe(&self, callback: impl Fn(&StoreChange) + Send + Sync + 'static) -> ObserverId {
        let mut observers = self.observers.lock().unwrap_or_else(|e| e.into_inner());
        let id = ObserverId(observers.next_id);
        observers.next_id += 1;
        observers.callbacks.push((id, Box::new(callback)));
        id
    }

    /// Removes a previously registered observer. Unknown ids are ignored.
    pub fn unobserve(&self, id: ObserverId) {
        let mut observers = self.observers.lock().unwrap_or_else(|e| e.into_inner());
        observers.callbacks.retain(|(oid, _)| *oid != id);
    }

    /// Folds a parsed snapshot into the store and notifies observers.
    pub fn reconcile(&self, snapshot: &SessionSnapshot, is_active: bool) {
        let change = {
            let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
            let root_id = root_agent_id(&snapshot.session_id);

            if let Some(existing) = data.sessions.get_mut(&snapshot.session_id) {
                existing.last_activity = snapshot.last_activity;
                existing.summary = snapshot.summary().to_string();
                existing.message_count = snapshot.message_count;
                existing.is_active = is_active;
                if existing.git_branch.is_none() {
                    existing.git_branch = snapshot.git_branch.clone();
                }
                if existing.cwd.is_none() {
                    existing.cwd = snapshot.cwd.clone();
                }

                if let Some(agent) = data.agents.get_mut(&root_id) {
                    merge_tool_uses(&mut agent.tool_uses, &snapshot.tool_uses);
                    agent.status = root_status(is_active, &agent.tool_uses);
                }
                debug!(session = %snapshot.session_id, "session updated");
                StoreChange::Updated(snapshot.session_id.clone())
            } else {
                let mut tool_uses = Vec::new();
                merge_tool_uses(&mut tool_uses, &snapshot.tool_uses);
                let status = root_status(is_active, &tool_uses);

                data.agents.insert(
                    root_id.clone(),
                    AgentRecord {
                        id: root_id.clone(),
                        session_id: snapshot.session_id.clone(),
                        parent_id: None,
                        agent_kind: "root".to_string(),
                        description: snapshot.summary().to_string(),
                        status,
                        started_at: snapshot.started_at,
                        tool_uses,
                    },
                );
                data.sessions.insert(
                    snapshot.session_id.clone(),
                    SessionRecord {
                        id: snapshot.session_id.clone(),
                        cwd: snapshot.cwd.clone(),
                        slug: snapshot.slug.clone(),
                        git_branch: snapshot.git_branch.clone(),
                        summary: snapshot.summary().to_string(),
                        started_at: snapshot.started_at,
                        last_activity: snapshot.last_activity,
                        is_active,
                        message_count: snapshot.message_count,
                        root_agent_id: root_id,
                        path: snapshot.path.clone(),
                    },
                );
                debug!(session = %snapshot.session_id, "session added");
                StoreChange::Added(snapshot.session_id.clone())
            }
        };
        self.notify(&change);
    }

    /// Removes a session and its agents. A no-op for unknown ids.
    pub fn remove_session(&self, session_id: &str) {
        let removed = {
            let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
            let removed = data.sessions.remove(session_id).is_some();
            data.agents.retain(|_, agent| agent.session_id != session_id);
            removed
        };
        if removed {
            self.notify(&StoreChange::Removed(session_id.to_string()));
        }
    }

    /// All sessions, most recent activity first.
    pub fn sessions(&self) -> Vec<SessionRecord> {
        let data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        let mut sessions: Vec<_> = data.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        sessions
    }

    /// Active sessions only, most recent activity first.
    pub fn active_sessions(&self) -> Vec<SessionRecord> {
        self.sessions().into_iter().filter(|s| s.is_active).collect()
    }

    pub fn session(&self, session_id: &str) -> Option<SessionRecord> {
        let data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        data.sessions.get(session_id).cloned()
    }

    /// Agents belonging to one session, root first.
    pub fn agents_for_session(&self, session_id: &str) -> Vec<AgentRecord> {
        let data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        let mut agents: Vec<_> = data
            .agents
            .values()
            .filter(|a| a.session_id == session_id)
            .cloned()
            .collect();
        agents.sort_by_key(|a| (a.parent_id.is_some(), a.started_at));
        agents
    }

    /// Direct children of an agent.
    pub fn children_of(&self, agent_id: &str) -> Vec<AgentRecord> {
        let data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        let mut children: Vec<_> = data
            .agents
            .values()
            .filter(|a| a.parent_id.as_deref() == Some(agent_id))
            .cloned()
            .collect();
        children.sort_by_key(|a| a.started_at);
        children
    }

    /// Aggregate counters for status surfaces.
    pub fn counts(&self) -> StoreCounts {
        let data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        StoreCounts {
            agents: data.agents.len(),
            running_agents: data
                .agents
                .values()
                .filter(|a| a.status == AgentStatus::Running)
                .count(),
            pending_inputs: data
                .agents
                .values()
                .filter(|a| a.status == AgentStatus::WaitingInput)
                .count(),
        }
    }

    fn notify(&self, change: &StoreChange) {
        let observers = self.observers.lock().unwrap_or_else(|e| e.into_inner());
        for (id, callback) in &observers.callbacks {
            // One panicking observer must not take down the rest.
            if catch_unwind(AssertUnwindSafe(|| callback(change))).is_err() {
                warn!(observer = ?id, "observer panicked");
            }
        }
    }
}

fn root_agent_id(session_id: &str) -> String {
    format!("{session_id}:root")
}

fn root_status(is_active: bool, tool_uses: &[ToolUseRecord]) -> AgentStatus {
    if !is_active {
        return match tool_uses.last().map(|t| t.status) {
            Some(ToolStatus::Failed) => AgentStatus::Failed,
            _ => AgentStatus::Completed,
        };
    }
    AgentStatus::Running
}

/// Merges newly parsed tool uses into an agent's history by invocation id.
/// Known invocations take the parsed status and result; records past the
/// last known one are appended. Parsed records that fell out of the history
/// window stay out. The history keeps only the most recent
/// [`MAX_TOOL_HISTORY`] entries in transcript order.
fn merge_tool_uses(existing: &mut Vec<ToolUseRecord>, parsed: &[ToolUseRecord]) {
    let append_from = existing
        .last()
        .and_then(|tail| parsed.iter().position(|t| t.id == tail.id))
        .map(|pos| pos + 1)
        .unwrap_or(0);

    for (index, record) in parsed.iter().enumerate() {
        if let Some(known) = existing.iter_mut().find(|t| t.id == record.id) {
            known.status = record.status;
            known.result_preview = record.result_preview.clone();
            known.error_message = record.error_message.clone();
        } else if index >= append_from {
            existing.push(record.clone());
        }
    }
    if existing.len() > MAX_TOOL_HISTORY {
        let excess = existing.len() - MAX_TOOL_HISTORY;
        existing.drain(..excess);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{ToolCategory, ToolUseRecord};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn snapshot(id: &str) -> SessionSnapshot {
        SessionSnapshot::new(
            id.to_string(),
            PathBuf::from(format!("/tmp/{id}.jsonl")),
            Local::now(),
        )
    }

    fn tool(id: &str, status: ToolStatus) -> ToolUseRecord {
        ToolUseRecord {
            id: id.to_string(),
            name: "Bash".to_string(),
            category: ToolCategory::Builtin,
            parameters: HashMap::new(),
            status,
            started_at: Local::now(),
            preview: "ls".to_string(),
            result_preview: None,
            error_message: None,
        }
    }

    #[test]
    fn first_reconcile_adds_session_and_root_agent() {
        let store = SessionStore::new();
        store.reconcile(&snapshot("s1"), true);

        let sessions = store.sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, "s1");
        assert!(sessions[0].is_active);

        let agents = store.agents_for_session("s1");
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].id, "s1:root");
        assert_eq!(agents[0].status, AgentStatus::Running);
    }

    #[test]
    fn second_reconcile_updates_in_place() {
        let store = SessionStore::new();
        store.reconcile(&snapshot("s1"), true);
        store.reconcile(&snapshot("s1"), false);

        let sessions = store.sessions();
        assert_eq!(sessions.len(), 1);
        assert!(!sessions[0].is_active);
        assert_eq!(
            store.agents_for_session("s1")[0].status,
            AgentStatus::Completed
        );
    }

    #[test]
    fn inactive_session_with_failed_last_tool_is_failed() {
        let store = SessionStore::new();
        let mut snap = snapshot("s1");
        snap.tool_uses.push(tool("t1", ToolStatus::Failed));
        store.reconcile(&snap, false);

        assert_eq!(store.agents_for_session("s1")[0].status, AgentStatus::Failed);
    }

    #[test]
    fn tool_history_keeps_most_recent_twenty_in_order() {
        let store = SessionStore::new();
        for i in 0..25 {
            let mut snap = snapshot("s1");
            for j in 0..=i {
                snap.tool_uses.push(tool(&format!("t{j}"), ToolStatus::Completed));
            }
            store.reconcile(&snap, true);
        }

        let agent = &store.agents_for_session("s1")[0];
        assert_eq!(agent.tool_uses.len(), MAX_TOOL_HISTORY);
        let ids: Vec<&str> = agent.tool_uses.iter().map(|t| t.id.as_str()).collect();
        let expected: Vec<String> = (5..25).map(|i| format!("t{i}")).collect();
        assert_eq!(ids, expected.iter().map(String::as_str).collect::<Vec<_>>());
    }

    #[test]
    fn merge_updates_status_of_known_invocation() {
        let store = SessionStore::new();
        let mut snap = snapshot("s1");
        snap.tool_uses.push(tool("t1", ToolStatus::Running));
        store.reconcile(&snap, true);

        let mut snap = snapshot("s1");
        let mut done = tool("t1", ToolStatus::Completed);
        done.result_preview = Some("ok".to_string());
        snap.tool_uses.push(done);
        store.reconcile(&snap, true);

        let agent = &store.agents_for_session("s1")[0];
        assert_eq!(agent.tool_uses.len(), 1);
        assert_eq!(agent.tool_uses[0].status, ToolStatus::Completed);
        assert_eq!(agent.tool_uses[0].result_preview.as_deref(), Some("ok"));
    }

    #[test]
    fn sessions_sorted_by_recency() {
        let store = SessionStore::new();
        let mut older = snapshot("old");
        older.last_activity = Local::now() - chrono::Duration::hours(2);
        store.reconcile(&older, false);
        store.reconcile(&snapshot("new"), true);

        let sessions = store.sessions();
        assert_eq!(sessions[0].id, "new");
        assert_eq!(sessions[1].id, "old");
    }

    #[test]
    fn active_sessions_filters_inactive() {
        let store = SessionStore::new();
        store.reconcile(&snapshot("a"), true);
        store.reconcile(&snapshot("b"), false);

        let active = store.active_sessions();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "a");
    }

    #[test]
    fn counts_track_running_agents() {
        let store = SessionStore::new();
        store.reconcile(&snapshot("a"), true);
        store.reconcile(&snapshot("b"), false);

        let counts = store.counts();
        assert_eq!(counts.agents, 2);
        assert_eq!(counts.running_agents, 1);
        assert_eq!(counts.pending_inputs, 0);
    }

    #[test]
    fn remove_session_drops_agents_too() {
        let store = SessionStore::new();
        store.reconcile(&snapshot("s1"), true);
        store.remove_session("s1");

        assert!(store.sessions().is_empty());
        assert!(store.agents_for_session("s1").is_empty());

        // Removing again is a no-op.
        store.remove_session("s1");
    }

    #[test]
    fn observers_see_add_update_remove() {
        let store = SessionStore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);
        store.observe(move |change| {
            seen_cb.lock().unwrap().push(change.clone());
        });

        store.reconcile(&snapshot("s1"), true);
        store.reconcile(&snapshot("s1"), true);
        store.remove_session("s1");

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                StoreChange::Added("s1".to_string()),
                StoreChange::Updated("s1".to_string()),
                StoreChange::Removed("s1".to_string()),
            ]
        );
    }

    #[test]
    fn unobserve_stops_notifications() {
        let store = SessionStore::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_cb = Arc::clone(&count);
        let id = store.observe(move |_| {
            count_cb.fetch_add(1, Ordering::SeqCst);
        });

        store.reconcile(&snapshot("s1"), true);
        store.unobserve(id);
        store.reconcile(&snapshot("s1"), true);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_observer_does_not_block_others() {
        let store = SessionStore::new();
        let count = Arc::new(AtomicUsize::new(0));
        store.observe(|_| panic!("bad observer"));
        let count_cb = Arc::clone(&count);
        store.observe(move |_| {
            count_cb.fetch_add(1, Ordering::SeqCst);
        });

        store.reconcile(&snapshot("s1"), true);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn observer_can_read_store_without_deadlock() {
        let store = Arc::new(SessionStore::new());
        let store_cb = Arc::clone(&store);
        let counts = Arc::new(Mutex::new(Vec::new()));
        let counts_cb = Arc::clone(&counts);
        store.observe(move |_| {
            counts_cb.lock().unwrap().push(store_cb.sessions().len());
        });

        store.reconcile(&snapshot("s1"), true);
        assert_eq!(*counts.lock().unwrap(), vec![1]);
    }
}
