//! Keyed debouncing for filesystem event storms.
//!
//! Editors and agents touch transcript files in bursts. The [`Debouncer`]
//! holds each key's latest value for up to the configured interval after
//! the key's first event, then emits one `(key, value)` pair downstream.
//! Later values for a pending key replace earlier ones without extending
//! the deadline, so a file written continuously still yields one event per
//! interval instead of going silent. Distinct keys are independent.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Default quiet interval before a key's value is emitted.
pub const DEFAULT_DEBOUNCE_MS: u64 = 500;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DebounceError {
    /// The background task is gone and can no longer accept events.
    #[error("debouncer task stopped")]
    TaskStopped,
}

/// Coalesces rapid per-key events into single emissions.
///
/// A background task owns the pending map; the handle only feeds it. When
/// the handle is dropped the task flushes whatever is still pending and
/// exits.
#[derive(Debug)]
pub struct Debouncer<K, V> {
    input_tx: mpsc::Sender<(K, V)>,
}

impl<K, V> Debouncer<K, V>
where
    K: Clone + Eq + Hash + Send + 'static,
    V: Send + 'static,
{
    pub fn new(interval: Duration, output_tx: mpsc::Sender<(K, V)>) -> Self {
        let (input_tx, input_rx) = mpsc::channel(1024);
        tokio::spawn(debounce_task(interval, input_rx, output_tx));
        Self { input_tx }
    }

    /// Queues an event, replacing any pending value for the same key.
    pub async fn send(&self, key: K, value: V) -> Result<(), DebounceError> {
        self.input_tx
            .send((key, value))
            .await
            .map_err(|_| DebounceError::TaskStopped)
    }
}

async fn debounce_task<K, V>(
    interval: Duration,
    mut input_rx: mpsc::Receiver<(K, V)>,
    output_tx: mpsc::Sender<(K, V)>,
) where
    K: Clone + Eq + Hash,
{
    let mut pending: HashMap<K, (V, Instant)> = HashMap::new();
    debug!(interval_ms = interval.as_millis(), "debouncer started");

    loop {
        // With nothing pending there is no deadline to honor; park far out
        // and let an incoming event wake us.
        let wake_at = pending
            .values()
            .map(|(_, deadline)| *deadline)
            .min()
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            received = input_rx.recv() => match received {
                Some((key, value)) => {
                    // The first event for a key sets its deadline; later
                    // events only refresh the value. Extending the deadline
                    // would starve keys that never go quiet.
                    let deadline = match pending.get(&key) {
                        Some((_, deadline)) => *deadline,
                        None => Instant::now() + interval,
                    };
                    pending.insert(key, (value, deadline));
                }
                None => break,
            },
            _ = tokio::time::sleep_until(wake_at) => {
                let now = Instant::now();
                let ripe: Vec<K> = pending
                    .iter()
                    .filter(|(_, (_, deadline))| *deadline <= now)
                    .map(|(key, _)| key.clone())
                    .collect();
                for key in ripe {
                    if let Some((value, _)) = pending.remove(&key) {
                        trace!("emitting debounced event");
                        if output_tx.send((key, value)).await.is_err() {
                            warn!("downstream closed, dropping debounced event");
                        }
                    }
                }
            }
        }
    }

    // Handle dropped: flush whatever never went quiet.
    for (key, (value, _)) in pending.drain() {
        trace!("flushing pending event on shutdown");
        if output_tx.send((key, value)).await.is_err() {
            warn!("downstream closed during flush");
            break;
        }
    }
    debug!("debouncer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tokio::time::{sleep, timeout};

    fn debouncer(interval_ms: u64) -> (Debouncer<PathBuf, u32>, mpsc::Receiver<(PathBuf, u32)>) {
        let (tx, rx) = mpsc::channel(64);
        (Debouncer::new(Duration::from_millis(interval_ms), tx), rx)
    }

    #[tokio::test]
    async fn burst_collapses_to_last_value() {
        let (deb, mut rx) = debouncer(40);
        let path = PathBuf::from("/p/s.jsonl");

        for value in 1..=5 {
            deb.send(path.clone(), value).await.unwrap();
        }

        let (key, value) = timeout(Duration::from_millis(300), rx.recv())
            .await
            .expect("emission within interval")
            .expect("channel open");
        assert_eq!(key, path);
        assert_eq!(value, 5);

        assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn keys_debounce_independently() {
        let (deb, mut rx) = debouncer(40);
        deb.send(PathBuf::from("/a"), 1).await.unwrap();
        deb.send(PathBuf::from("/b"), 2).await.unwrap();

        let mut got = Vec::new();
        for _ in 0..2 {
            let (key, value) = timeout(Duration::from_millis(300), rx.recv())
                .await
                .expect("emission")
                .expect("channel open");
            got.push((key, value));
        }
        got.sort();
        assert_eq!(
            got,
            vec![(PathBuf::from("/a"), 1), (PathBuf::from("/b"), 2)]
        );
    }

    #[tokio::test]
    async fn later_event_replaces_value_without_extending_deadline() {
        let (deb, mut rx) = debouncer(100);
        let path = PathBuf::from("/p");

        deb.send(path.clone(), 1).await.unwrap();
        sleep(Duration::from_millis(50)).await;
        deb.send(path.clone(), 2).await.unwrap();

        // Deadline is still ~100ms after the first event, well inside the
        // 250ms budget; only the latest value comes out.
        let (_, value) = timeout(Duration::from_millis(250), rx.recv())
            .await
            .expect("emission by the first event's deadline")
            .expect("channel open");
        assert_eq!(value, 2);
    }

    #[tokio::test]
    async fn sustained_writes_still_emit_every_interval() {
        let (deb, mut rx) = debouncer(80);
        let path = PathBuf::from("/p/live.jsonl");

        // Write faster than the interval for five full windows, the shape
        // of an actively appended transcript.
        for value in 1..=10u32 {
            deb.send(path.clone(), value).await.unwrap();
            sleep(Duration::from_millis(40)).await;
        }

        let mut emissions = Vec::new();
        while let Ok(Some((_, value))) = timeout(Duration::from_millis(200), rx.recv()).await {
            emissions.push(value);
        }

        // One emission per elapsed window rather than silence until the
        // writer stops; the final value always makes it out.
        assert!(emissions.len() >= 2, "got {emissions:?}");
        assert_eq!(emissions.last(), Some(&10));
    }

    #[tokio::test]
    async fn nothing_emitted_before_interval() {
        let (deb, mut rx) = debouncer(200);
        deb.send(PathBuf::from("/p"), 1).await.unwrap();
        assert!(timeout(Duration::from_millis(50), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn drop_flushes_pending() {
        let (tx, mut rx) = mpsc::channel(64);
        let deb: Debouncer<PathBuf, u32> = Debouncer::new(Duration::from_secs(60), tx);
        deb.send(PathBuf::from("/p"), 7).await.unwrap();
        drop(deb);

        let (_, value) = timeout(Duration::from_millis(300), rx.recv())
            .await
            .expect("flush on drop")
            .expect("channel open");
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn send_after_receiver_dropped_still_accepted() {
        let (tx, rx) = mpsc::channel::<(PathBuf, u32)>(1);
        let deb = Debouncer::new(Duration::from_millis(20), tx);
        drop(rx);

        // The input side stays open; the task logs and drops the emission.
        assert!(deb.send(PathBuf::from("/p"), 1).await.is_ok());
        sleep(Duration::from_millis(60)).await;
    }

    #[test]
    fn error_display() {
        assert_eq!(DebounceError::TaskStopped.to_string(), "debouncer task stopped");
    }
}
