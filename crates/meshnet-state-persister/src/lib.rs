//! State Persister (spec.md §4.8): write-coalescing, atomically-renamed
//! JSON snapshots.
//!
//! Grounded in `bin-shared::device_id`'s use of `atomicwrites::AtomicFile`
//! for crash-safe single-file writes; the coalescing debounce on top of it
//! has no teacher precedent (firezone's device id is written once, not
//! continuously), so that part is plain `tokio::sync::Notify` plumbing.

use atomicwrites::{AtomicFile, OverwriteBehavior};
use parking_lot::Mutex;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Debounce window: additional snapshots queued while a flush is pending
/// replace the pending one rather than scheduling another flush
/// (spec.md §4.8 "write coalescing").
const COALESCE_WINDOW: Duration = Duration::from_millis(100);

struct Shared {
    path: PathBuf,
    pending: Mutex<Option<Vec<u8>>>,
    notify: Notify,
}

/// Queues JSON snapshots for background, debounced, crash-safe writes.
///
/// Cloning shares the same background flush task and pending slot; the
/// task exits when the last clone (and the persister returned by `new`)
/// is dropped.
#[derive(Clone)]
pub struct StatePersister {
    shared: Arc<Shared>,
}

impl StatePersister {
    /// Spawns the background flush task writing snapshots to `path`.
    /// Must be called from within a Tokio runtime.
    pub fn spawn(path: PathBuf) -> Self {
        let shared = Arc::new(Shared {
            path,
            pending: Mutex::new(None),
            notify: Notify::new(),
        });

        tokio::spawn(flush_loop(shared.clone()));

        Self { shared }
    }

    /// Queues `value` to be written as the next snapshot. Never blocks on
    /// I/O and never returns an error to the caller: persistence failures
    /// are logged, not propagated (spec.md §4.8, §7).
    pub fn queue_snapshot<T: serde::Serialize>(&self, value: &T) {
        match serde_json::to_vec_pretty(value) {
            Ok(bytes) => {
                *self.shared.pending.lock() = Some(bytes);
                self.shared.notify.notify_one();
            }
            Err(error) => {
                tracing::warn!(%error, "failed to serialize state snapshot, dropping it");
            }
        }
    }

    /// Flushes any pending snapshot immediately, bypassing the coalescing
    /// window. Used on shutdown (spec.md §4.8 "shutdown flushes pending
    /// writes").
    pub async fn flush_now(&self) {
        flush_pending(&self.shared);
    }
}

async fn flush_loop(shared: Arc<Shared>) {
    loop {
        shared.notify.notified().await;
        tokio::time::sleep(COALESCE_WINDOW).await;
        flush_pending(&shared);
    }
}

fn flush_pending(shared: &Shared) {
    let Some(bytes) = shared.pending.lock().take() else {
        return;
    };

    let file = AtomicFile::new(&shared.path, OverwriteBehavior::AllowOverwrite);
    if let Err(error) = file.write(|f| f.write_all(&bytes)) {
        tracing::warn!(path = %shared.path.display(), %error, "failed to persist state snapshot");
    }
}

/// Loads a previously persisted snapshot, if the file exists and parses.
pub fn load_snapshot<T: serde::de::DeserializeOwned>(path: &std::path::Path) -> Option<T> {
    let content = std::fs::read(path).ok()?;
    match serde_json::from_slice(&content) {
        Ok(value) => Some(value),
        Err(error) => {
            tracing::warn!(path = %path.display(), %error, "failed to parse persisted state snapshot");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Snapshot {
        counter: u32,
    }

    #[tokio::test(start_paused = true)]
    async fn coalesces_rapid_writes_into_one_file_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        let persister = StatePersister::spawn(path.clone());

        persister.queue_snapshot(&Snapshot { counter: 1 });
        persister.queue_snapshot(&Snapshot { counter: 2 });
        persister.queue_snapshot(&Snapshot { counter: 3 });

        tokio::time::sleep(Duration::from_millis(150)).await;

        let loaded: Snapshot = load_snapshot(&path).unwrap();
        assert_eq!(loaded, Snapshot { counter: 3 });
    }

    #[tokio::test]
    async fn flush_now_writes_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        let persister = StatePersister::spawn(path.clone());

        persister.queue_snapshot(&Snapshot { counter: 42 });
        persister.flush_now().await;

        let loaded: Snapshot = load_snapshot(&path).unwrap();
        assert_eq!(loaded, Snapshot { counter: 42 });
    }

    #[test]
    fn load_snapshot_of_missing_file_is_none() {
        let loaded: Option<Snapshot> = load_snapshot(std::path::Path::new("/nonexistent/path.json"));
        assert!(loaded.is_none());
    }
}
