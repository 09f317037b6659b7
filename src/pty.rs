//! Embedded pseudo-terminal sessions for spawning agents.
//!
//! A [`PtySession`] runs the agent binary under a real PTY so the agent
//! behaves exactly as it would in a user terminal. Output is read on a
//! dedicated thread, split into lines, and forwarded as [`PtyEvent`]s over
//! a channel; input goes through the session handle. Shutdown has two
//! levels: a graceful exit request with a bounded wait, and an escalating
//! force path ending in a kill.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Exit-request line written to the agent for a graceful shutdown.
const EXIT_COMMAND: &str = "/exit\n";

/// How long a graceful shutdown waits for the process to exit.
const GRACEFUL_WAIT: Duration = Duration::from_secs(5);

/// Poll step while waiting for the process to exit.
const EXIT_POLL: Duration = Duration::from_millis(100);

/// Pause between escalation steps in a force shutdown.
const FORCE_STEP: Duration = Duration::from_millis(500);

/// Window after which the interrupt counter resets.
const INTERRUPT_RESET: Duration = Duration::from_secs(2);

/// ETX, what Ctrl-C writes on a terminal.
const CTRL_C: &[u8] = b"\x03";

#[derive(Error, Debug)]
pub enum PtyError {
    /// The agent binary is not on `PATH`.
    #[error("binary not found on PATH: {0}")]
    BinaryNotFound(String),

    /// The PTY layer failed to open or spawn.
    #[error("pty failure: {0}")]
    Pty(String),

    /// I/O against the PTY master failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Events emitted by a running PTY session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    /// The child process started.
    Started { pid: u32 },
    /// One line of terminal output, trimmed, non-empty.
    OutputLine(String),
    /// The child exited. Unknown exit codes report as -1.
    Ended { exit_code: i32 },
}

/// Outcome of an interrupt request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptOutcome {
    /// A single Ctrl-C was written.
    Sent,
    /// Repeated interrupts within the reset window; the caller should
    /// consider a force shutdown.
    Escalated,
}

/// Counts rapid repeated interrupts so a stuck agent can be escalated.
///
/// The counter resets once interrupts stop arriving for
/// [`INTERRUPT_RESET`].
#[derive(Debug, Default)]
struct InterruptTracker {
    count: u32,
    last: Option<Instant>,
}

impl InterruptTracker {
    /// Registers an interrupt at `now`, returning the streak length.
    fn register(&mut self, now: Instant) -> u32 {
        if let Some(last) = self.last {
            if now.duration_since(last) > INTERRUPT_RESET {
                self.count = 0;
            }
        }
        self.count += 1;
        self.last = Some(now);
        self.count
    }
}

/// Locates a binary by searching `PATH`.
pub(crate) fn resolve_binary(name: &str) -> Result<PathBuf, PtyError> {
    let candidate = Path::new(name);
    if candidate.is_absolute() {
        if candidate.is_file() {
            return Ok(candidate.to_path_buf());
        }
        return Err(PtyError::BinaryNotFound(name.to_string()));
    }

    let path_var = std::env::var_os("PATH").unwrap_or_default();
    for dir in std::env::split_paths(&path_var) {
        let full = dir.join(name);
        if full.is_file() {
            return Ok(full);
        }
    }
    Err(PtyError::BinaryNotFound(name.to_string()))
}

/// A running agent under an embedded pseudo-terminal.
pub struct PtySession {
    master: Box<dyn MasterPty + Send>,
    writer: Mutex<Box<dyn Write + Send>>,
    child: Arc<Mutex<Box<dyn Child + Send + Sync>>>,
    running: Arc<AtomicBool>,
    interrupts: Mutex<InterruptTracker>,
    pid: Option<u32>,
}

impl PtySession {
    /// Spawns `binary` with `args` in `cwd` under a PTY of the given size.
    ///
    /// The binary is resolved against `PATH` before anything is allocated,
    /// so a missing install fails fast with [`PtyError::BinaryNotFound`].
    /// Output lines and lifecycle events arrive on `events`.
    pub fn spawn(
        binary: &str,
        args: &[String],
        cwd: &Path,
        rows: u16,
        cols: u16,
        events: mpsc::Sender<PtyEvent>,
    ) -> Result<Self, PtyError> {
        let resolved = resolve_binary(binary)?;

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Pty(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&resolved);
        cmd.args(args);
        cmd.cwd(cwd);
        cmd.env("TERM", "xterm-256color");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::Pty(e.to_string()))?;
        // The slave side belongs to the child now.
        drop(pair.slave);

        let pid = child.process_id();
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::Pty(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::Pty(e.to_string()))?;

        let child = Arc::new(Mutex::new(child));
        let running = Arc::new(AtomicBool::new(true));

        let reader_child = Arc::clone(&child);
        let reader_running = Arc::clone(&running);
        std::thread::spawn(move || {
            if let Some(pid) = pid {
                let _ = events.blocking_send(PtyEvent::Started { pid });
            }

            let mut carry = String::new();
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        carry.push_str(&String::from_utf8_lossy(&buf[..n]));
                        for line in drain_lines(&mut carry) {
                            if events.blocking_send(PtyEvent::OutputLine(line)).is_err() {
                                return;
                            }
                        }
                    }
                    Err(_) => break,
                }
            }

            // EOF: the child is gone or closed its terminal. It can take a
            // moment to become waitable after the terminal closes.
            reader_running.store(false, Ordering::SeqCst);
            let mut exit_code = -1;
            for _ in 0..50 {
                let status = reader_child
                    .lock()
                    .map(|mut child| child.try_wait())
                    .unwrap_or_else(|e| e.into_inner().try_wait());
                match status {
                    Ok(Some(status)) => {
                        exit_code = status.exit_code() as i32;
                        break;
                    }
                    Ok(None) => std::thread::sleep(Duration::from_millis(10)),
                    Err(_) => break,
                }
            }
            let _ = events.blocking_send(PtyEvent::Ended { exit_code });
        });

        info!(binary = %resolved.display(), cwd = %cwd.display(), pid, "spawned agent pty");
        Ok(Self {
            master: pair.master,
            writer: Mutex::new(writer),
            child,
            running,
            interrupts: Mutex::new(InterruptTracker::default()),
            pid,
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Writes input to the agent's terminal. A no-op once the session has
    /// ended; write failures mark the session as ended rather than erroring.
    pub fn send(&self, input: &str) {
        if !self.is_running() {
            return;
        }
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = writer.write_all(input.as_bytes()).and_then(|()| writer.flush()) {
            warn!(error = %e, "pty write failed, marking session ended");
            self.running.store(false, Ordering::SeqCst);
        }
    }

    /// Writes a single Ctrl-C.
    pub fn interrupt(&self) {
        if !self.is_running() {
            return;
        }
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = writer.write_all(CTRL_C).and_then(|()| writer.flush()) {
            warn!(error = %e, "pty interrupt write failed");
            self.running.store(false, Ordering::SeqCst);
        }
    }

    /// Interrupts the agent and tracks the streak: a second interrupt within
    /// the reset window reports [`InterruptOutcome::Escalated`] so the
    /// caller can fall back to [`force_shutdown`](Self::force_shutdown).
    /// Well-separated single interrupts always report `Sent`.
    pub fn request_interrupt(&self) -> InterruptOutcome {
        self.interrupt();
        let streak = {
            let mut tracker = self.interrupts.lock().unwrap_or_else(|e| e.into_inner());
            tracker.register(Instant::now())
        };
        if streak >= 2 {
            debug!(streak, "interrupt streak escalated");
            InterruptOutcome::Escalated
        } else {
            InterruptOutcome::Sent
        }
    }

    /// Resizes the terminal.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Pty(e.to_string()))
    }

    /// Asks the agent to exit and waits up to five seconds.
    ///
    /// Returns whether the process actually exited; callers should follow a
    /// `false` with [`force_shutdown`](Self::force_shutdown).
    pub async fn graceful_shutdown(&self) -> bool {
        if !self.is_running() {
            return true;
        }
        self.send(EXIT_COMMAND);

        let deadline = Instant::now() + GRACEFUL_WAIT;
        while Instant::now() < deadline {
            if self.reap() {
                info!("agent exited gracefully");
                return true;
            }
            tokio::time::sleep(EXIT_POLL).await;
        }
        warn!("agent ignored exit request");
        false
    }

    /// Escalating shutdown: two interrupts half a second apart, then a kill.
    pub async fn force_shutdown(&self) {
        if !self.is_running() {
            return;
        }

        for _ in 0..2 {
            self.interrupt();
            tokio::time::sleep(FORCE_STEP).await;
            if self.reap() {
                return;
            }
        }

        {
            let mut child = self.child.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = child.kill() {
                warn!(error = %e, "kill failed");
            }
        }
        let deadline = Instant::now() + GRACEFUL_WAIT;
        while Instant::now() < deadline {
            if self.reap() {
                return;
            }
            tokio::time::sleep(EXIT_POLL).await;
        }
        warn!("agent survived kill; abandoning");
    }

    /// Checks whether the child has exited, updating the running flag.
    fn reap(&self) -> bool {
        let mut child = self.child.lock().unwrap_or_else(|e| e.into_inner());
        match child.try_wait() {
            Ok(Some(_)) => {
                self.running.store(false, Ordering::SeqCst);
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(error = %e, "try_wait failed");
                false
            }
        }
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        if self.is_running() {
            let mut child = self.child.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = child.kill() {
                warn!(error = %e, "kill on drop failed");
            }
        }
    }
}

/// Splits complete lines out of `carry`, leaving a trailing partial line in
/// place. Lines are trimmed; blank lines are dropped.
fn drain_lines(carry: &mut String) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = carry.find('\n') {
        let line: String = carry.drain(..=pos).collect();
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            lines.push(trimmed.to_string());
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[test]
    fn missing_binary_fails_fast() {
        let (tx, _rx) = mpsc::channel(16);
        let result = PtySession::spawn(
            "definitely-not-a-real-binary-zz",
            &[],
            Path::new("/tmp"),
            24,
            80,
            tx,
        );
        match result {
            Err(PtyError::BinaryNotFound(name)) => {
                assert_eq!(name, "definitely-not-a-real-binary-zz");
            }
            other => panic!("expected BinaryNotFound, got {:?}", other.err()),
        }
    }

    #[test]
    fn interrupt_tracker_counts_and_resets() {
        let mut tracker = InterruptTracker::default();
        let start = Instant::now();
        assert_eq!(tracker.register(start), 1);
        assert_eq!(tracker.register(start + Duration::from_millis(300)), 2);
        assert_eq!(tracker.register(start + Duration::from_millis(600)), 3);

        // A long pause starts a new streak.
        assert_eq!(tracker.register(start + Duration::from_secs(10)), 1);
    }

    #[test]
    fn drain_lines_splits_and_carries() {
        let mut carry = String::from("first\nsecond\npart");
        assert_eq!(drain_lines(&mut carry), vec!["first", "second"]);
        assert_eq!(carry, "part");

        carry.push_str("ial\n");
        assert_eq!(drain_lines(&mut carry), vec!["partial"]);
        assert!(carry.is_empty());
    }

    #[test]
    fn drain_lines_drops_blank_lines() {
        let mut carry = String::from("\n  \nreal\n");
        assert_eq!(drain_lines(&mut carry), vec!["real"]);
    }

    #[cfg(unix)]
    mod unix {
        use super::*;

        async fn collect_until_ended(rx: &mut mpsc::Receiver<PtyEvent>) -> (Vec<String>, i32) {
            let mut lines = Vec::new();
            loop {
                let event = timeout(Duration::from_secs(10), rx.recv())
                    .await
                    .expect("event within timeout")
                    .expect("channel open");
                match event {
                    PtyEvent::Started { .. } => {}
                    PtyEvent::OutputLine(line) => lines.push(line),
                    PtyEvent::Ended { exit_code } => return (lines, exit_code),
                }
            }
        }

        #[tokio::test]
        async fn echo_output_arrives_as_lines() {
            let (tx, mut rx) = mpsc::channel(64);
            let session = PtySession::spawn(
                "sh",
                &["-c".to_string(), "echo hello pty".to_string()],
                Path::new("/tmp"),
                24,
                80,
                tx,
            )
            .expect("spawn sh");

            let (lines, exit_code) = collect_until_ended(&mut rx).await;
            assert!(lines.iter().any(|l| l.contains("hello pty")));
            assert_eq!(exit_code, 0);
            assert!(!session.is_running());
        }

        #[tokio::test]
        async fn started_event_carries_pid() {
            let (tx, mut rx) = mpsc::channel(64);
            let session = PtySession::spawn(
                "sh",
                &["-c".to_string(), "sleep 0.1".to_string()],
                Path::new("/tmp"),
                24,
                80,
                tx,
            )
            .expect("spawn sh");

            let event = timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("event")
                .expect("channel open");
            match event {
                PtyEvent::Started { pid } => assert_eq!(Some(pid), session.pid()),
                other => panic!("expected Started first, got {other:?}"),
            }
        }

        #[tokio::test]
        async fn send_reaches_the_child() {
            let (tx, mut rx) = mpsc::channel(64);
            let session = PtySession::spawn(
                "sh",
                &["-c".to_string(), "read line; echo got:$line".to_string()],
                Path::new("/tmp"),
                24,
                80,
                tx,
            )
            .expect("spawn sh");

            session.send("ping\n");
            let (lines, _) = collect_until_ended(&mut rx).await;
            assert!(lines.iter().any(|l| l.contains("got:ping")));
        }

        #[tokio::test]
        async fn force_shutdown_kills_ignoring_child() {
            let (tx, mut rx) = mpsc::channel(64);
            // SIG_IGN survives exec, so the sleep ignores both interrupts.
            let session = PtySession::spawn(
                "sh",
                &["-c".to_string(), "trap '' INT; exec sleep 60".to_string()],
                Path::new("/tmp"),
                24,
                80,
                tx,
            )
            .expect("spawn sh");

            session.force_shutdown().await;
            assert!(!session.is_running());

            let (_, exit_code) = collect_until_ended(&mut rx).await;
            assert_ne!(exit_code, 0);
        }

        #[tokio::test]
        async fn second_rapid_interrupt_escalates() {
            let (tx, _rx) = mpsc::channel(64);
            let session = PtySession::spawn(
                "sh",
                &["-c".to_string(), "trap '' INT; exec sleep 60".to_string()],
                Path::new("/tmp"),
                24,
                80,
                tx,
            )
            .expect("spawn sh");

            assert_eq!(session.request_interrupt(), InterruptOutcome::Sent);
            assert_eq!(session.request_interrupt(), InterruptOutcome::Escalated);

            session.force_shutdown().await;
        }

        #[tokio::test]
        async fn graceful_shutdown_times_out_on_unresponsive_child() {
            let (tx, _rx) = mpsc::channel(64);
            let session = PtySession::spawn(
                "sh",
                &["-c".to_string(), "sleep 60".to_string()],
                Path::new("/tmp"),
                24,
                80,
                tx,
            )
            .expect("spawn sh");

            // A sleeping child never reads the exit request.
            assert!(!session.graceful_shutdown().await);
            assert!(session.is_running());

            session.force_shutdown().await;
            assert!(!session.is_running());
        }

        #[tokio::test]
        async fn force_shutdown_tries_two_interrupts_before_killing() {
            let (tx, mut rx) = mpsc::channel(64);
            let session = PtySession::spawn(
                "sh",
                &[
                    "-c".to_string(),
                    "trap 'echo CAUGHT' INT; while true; do sleep 1; done".to_string(),
                ],
                Path::new("/tmp"),
                24,
                80,
                tx,
            )
            .expect("spawn sh");

            // Give the shell a moment to install the trap.
            tokio::time::sleep(Duration::from_millis(300)).await;
            session.force_shutdown().await;

            let (lines, _) = collect_until_ended(&mut rx).await;
            let caught = lines.iter().filter(|l| l.contains("CAUGHT")).count();
            assert_eq!(caught, 2);
        }

        #[tokio::test]
        async fn resize_succeeds_while_running() {
            let (tx, _rx) = mpsc::channel(64);
            let session = PtySession::spawn(
                "sh",
                &["-c".to_string(), "sleep 1".to_string()],
                Path::new("/tmp"),
                24,
                80,
                tx,
            )
            .expect("spawn sh");

            session.resize(40, 120).expect("resize");
        }
    }
}
