//! Ledger persistence.
//!
//! The hot path never touches storage. A background task snapshots the
//! ledger on an interval when it is dirty and hands the write to a blocking
//! thread. Saves are best-effort: a failed save re-marks the ledger dirty and
//! is retried on the next tick.

use crate::LedgerError;
use crate::ledger::{CostTracker, LedgerSnapshot};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Durable home for ledger snapshots.
pub trait LedgerStore: Send + Sync {
    /// `Ok(None)` when nothing has been saved yet.
    fn load(&self) -> Result<Option<LedgerSnapshot>, LedgerError>;
    fn save(&self, snapshot: &LedgerSnapshot) -> Result<(), LedgerError>;
}

/// JSON file store with atomic replace and owner-only permissions.
#[derive(Debug, Clone)]
pub struct FileLedgerStore {
    path: PathBuf,
}

impl FileLedgerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LedgerStore for FileLedgerStore {
    fn load(&self) -> Result<Option<LedgerSnapshot>, LedgerError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&self.path)?;
        let snapshot = serde_json::from_str(&data)?;
        debug!(path = %self.path.display(), "Loaded ledger");
        Ok(Some(snapshot))
    }

    fn save(&self, snapshot: &LedgerSnapshot) -> Result<(), LedgerError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(snapshot)?;
        let tmp_path = self.path.with_extension("json.tmp");
        write_private(&tmp_path, json.as_bytes())?;
        std::fs::rename(&tmp_path, &self.path)?;

        debug!(path = %self.path.display(), identities = snapshot.identities.len(), "Saved ledger");
        Ok(())
    }
}

/// Create (or truncate) `path` readable by the owner only, then write and sync.
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;

    // A pre-existing temp file keeps its old mode; force it.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }

    file.write_all(bytes)?;
    file.sync_all()
}

/// In-memory store for tests and ephemeral deployments.
#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    saved: Mutex<Option<LedgerSnapshot>>,
    saves: Mutex<usize>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful saves.
    pub fn save_count(&self) -> usize {
        *self.saves.lock()
    }
}

impl LedgerStore for MemoryLedgerStore {
    fn load(&self) -> Result<Option<LedgerSnapshot>, LedgerError> {
        Ok(self.saved.lock().clone())
    }

    fn save(&self, snapshot: &LedgerSnapshot) -> Result<(), LedgerError> {
        *self.saved.lock() = Some(snapshot.clone());
        *self.saves.lock() += 1;
        Ok(())
    }
}

/// Load a persisted snapshot (if any) into `tracker`.
pub fn restore(tracker: &CostTracker, store: &dyn LedgerStore) -> Result<bool, LedgerError> {
    match store.load()? {
        Some(snapshot) => {
            tracker.merge(&snapshot)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Save once if the ledger changed. Returns whether a save happened.
pub async fn flush(tracker: &Arc<CostTracker>, store: &Arc<dyn LedgerStore>) -> Result<bool, LedgerError> {
    if !tracker.take_dirty() {
        return Ok(false);
    }

    let snapshot = tracker.snapshot();
    let writer = Arc::clone(store);
    let result = tokio::task::spawn_blocking(move || writer.save(&snapshot))
        .await
        .map_err(|e| LedgerError::Task(e.to_string()))
        .and_then(|r| r);

    if result.is_err() {
        tracker.mark_dirty();
    }
    result.map(|_| true)
}

/// Periodically flush the ledger until the returned handle is aborted.
pub fn spawn_flush_task(tracker: Arc<CostTracker>, store: Arc<dyn LedgerStore>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = flush(&tracker, &store).await {
                warn!(error = %e, "Ledger flush failed, will retry");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LedgerSettings;
    use tollgate_core::{CapabilityRecord, Identity, PermissionLevel};

    fn busy_tracker() -> Arc<CostTracker> {
        let tracker = Arc::new(CostTracker::new(LedgerSettings::default()));
        let caps = CapabilityRecord::builtin(PermissionLevel::Standard);
        let id = tracker
            .reserve(&Identity::trusted("alice", "slack"), &caps, 0.5)
            .unwrap();
        tracker.reconcile(&id, 0.25);
        tracker
    }

    #[test]
    fn file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileLedgerStore::new(dir.path().join("nested").join("ledger.json"));
        assert!(store.load().unwrap().is_none());

        let tracker = busy_tracker();
        store.save(&tracker.snapshot()).unwrap();

        let fresh = CostTracker::new(LedgerSettings::default());
        assert!(restore(&fresh, &store).unwrap());
        let usage = fresh.usage_by_key("slack:alice", 0.0, 0.0, chrono::Utc::now());
        assert!((usage.daily.spent - 0.25).abs() < 1e-10);
        assert!((fresh.global_usage().monthly.spent - 0.25).abs() < 1e-10);
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[cfg(unix)]
    #[test]
    fn file_store_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = FileLedgerStore::new(dir.path().join("ledger.json"));
        store.save(&LedgerSnapshot::default()).unwrap();
        let mode = std::fs::metadata(store.path()).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        std::fs::write(&path, "{not json").unwrap();
        let store = FileLedgerStore::new(path);
        assert!(matches!(store.load(), Err(LedgerError::Serialization(_))));
    }

    #[tokio::test]
    async fn flush_only_when_dirty() {
        let tracker = busy_tracker();
        let memory = Arc::new(MemoryLedgerStore::new());
        let store: Arc<dyn LedgerStore> = memory.clone();

        assert!(flush(&tracker, &store).await.unwrap());
        assert!(!flush(&tracker, &store).await.unwrap());
        assert_eq!(memory.save_count(), 1);
        assert!(memory.load().unwrap().unwrap().identities.contains_key("slack:alice"));
    }

    #[tokio::test]
    async fn failed_save_keeps_ledger_dirty() {
        struct Broken;
        impl LedgerStore for Broken {
            fn load(&self) -> Result<Option<LedgerSnapshot>, LedgerError> {
                Ok(None)
            }
            fn save(&self, _: &LedgerSnapshot) -> Result<(), LedgerError> {
                Err(LedgerError::Io(std::io::Error::other("disk full")))
            }
        }

        let tracker = busy_tracker();
        let store: Arc<dyn LedgerStore> = Arc::new(Broken);
        assert!(flush(&tracker, &store).await.is_err());
        assert!(tracker.is_dirty());
    }

    #[tokio::test(start_paused = true)]
    async fn flush_task_saves_on_interval() {
        let tracker = busy_tracker();
        let memory = Arc::new(MemoryLedgerStore::new());
        let handle = spawn_flush_task(tracker.clone(), memory.clone(), Duration::from_secs(30));

        tokio::time::sleep(Duration::from_secs(31)).await;
        // spawn_blocking runs on a real thread; give it a moment to land.
        for _ in 0..100 {
            if memory.save_count() > 0 {
                break;
            }
            tokio::task::yield_now().await;
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(memory.save_count(), 1);
        handle.abort();
    }
}
