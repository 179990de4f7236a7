//! Transcript persistence.
//!
//! The registry never does I/O. Instead:
//! - [`MessageStore`] loads and saves the column id → messages map
//! - [`restore`] applies a loaded map on startup
//! - [`PersistenceScheduler`] watches registry revisions, debounces, saves
//!   on a blocking thread and flushes once more on shutdown
//!
//! # Example
//!
//! ```ignore
//! use gateway_client::persistence::{JsonFileStore, PersistenceScheduler};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let store = Arc::new(JsonFileStore::new("/var/lib/gw/messages.json"));
//! gateway_client::persistence::restore(&registry, store.as_ref())?;
//! let scheduler = PersistenceScheduler::spawn(registry.clone(), store, Duration::from_secs(1));
//! // ...
//! scheduler.shutdown().await;
//! ```

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{GatewayError, Result};
use crate::registry::{self, ChatMessage, SharedRegistry};

/// Persisted form: column id → transcript.
pub type MessageMap = HashMap<String, Vec<ChatMessage>>;

/// Default debounce between the last change and a save.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// Load/save collaborator for column transcripts.
pub trait MessageStore: Send + Sync + 'static {
    /// Previously saved transcripts; empty when nothing was saved yet.
    fn load(&self) -> Result<MessageMap>;

    /// Replace the saved transcripts.
    fn save(&self, messages: &MessageMap) -> Result<()>;
}

/// JSON file store with atomic replace (temp file, fsync, rename).
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl MessageStore for JsonFileStore {
    fn load(&self) -> Result<MessageMap> {
        if !self.path.exists() {
            return Ok(MessageMap::new());
        }
        let content = fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(MessageMap::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    fn save(&self, messages: &MessageMap) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let content = serde_json::to_vec_pretty(messages)?;
        let tmp = self.temp_path();
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&content)?;
            file.sync_all()?;
        }
        if let Err(e) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }
}

/// Load saved transcripts into the registry's existing columns. Returns
/// the number of columns restored.
pub fn restore(registry: &SharedRegistry, store: &dyn MessageStore) -> Result<usize> {
    let saved = store.load()?;
    let restored = registry::lock(registry).restore_messages(saved);
    tracing::debug!("Restored transcripts of {} column(s)", restored);
    Ok(restored)
}

/// Debounced writer of registry snapshots.
#[derive(Debug)]
pub struct PersistenceScheduler {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PersistenceScheduler {
    /// Start watching `registry`. Every change restarts the `debounce`
    /// timer; when it fires the snapshot is saved.
    pub fn spawn(
        registry: SharedRegistry,
        store: Arc<dyn MessageStore>,
        debounce: Duration,
    ) -> Self {
        let revisions = registry::lock(&registry).subscribe();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(schedule_loop(
            registry,
            store,
            debounce,
            revisions,
            cancel.clone(),
        ));
        Self { cancel, task }
    }

    /// Stop watching, saving pending changes first.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::error!("Persistence task failed: {}", e);
        }
    }
}

async fn schedule_loop(
    registry: SharedRegistry,
    store: Arc<dyn MessageStore>,
    debounce: Duration,
    mut revisions: watch::Receiver<u64>,
    cancel: CancellationToken,
) {
    let mut dirty = false;

    loop {
        if dirty {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = revisions.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(debounce) => {
                    if let Err(e) = flush(&registry, &store).await {
                        tracing::warn!("Saving transcripts failed: {}", e);
                    }
                    dirty = false;
                }
            }
        } else {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = revisions.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    dirty = true;
                }
            }
        }
    }

    if dirty || revisions.has_changed().unwrap_or(false) {
        if let Err(e) = flush(&registry, &store).await {
            tracing::error!("Final transcript save failed: {}", e);
        }
    }
}

async fn flush(registry: &SharedRegistry, store: &Arc<dyn MessageStore>) -> Result<()> {
    let snapshot = registry::lock(registry).message_snapshot();
    let store = store.clone();
    tokio::task::spawn_blocking(move || store.save(&snapshot))
        .await
        .map_err(|e| GatewayError::Io(std::io::Error::other(e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SessionRegistry;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryStore {
        saves: Mutex<Vec<MessageMap>>,
    }

    impl MemoryStore {
        fn save_count(&self) -> usize {
            self.saves.lock().unwrap().len()
        }
    }

    impl MessageStore for MemoryStore {
        fn load(&self) -> Result<MessageMap> {
            Ok(self.saves.lock().unwrap().last().cloned().unwrap_or_default())
        }

        fn save(&self, messages: &MessageMap) -> Result<()> {
            self.saves.lock().unwrap().push(messages.clone());
            Ok(())
        }
    }

    fn shared_with(columns: &[&str]) -> SharedRegistry {
        let mut registry = SessionRegistry::new();
        for id in columns {
            registry.add_column(id, "main");
        }
        registry.shared()
    }

    #[test]
    fn test_json_store_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("messages.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_json_store_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("nested").join("messages.json"));

        let mut map = MessageMap::new();
        map.insert("col-a".into(), vec![ChatMessage::user("hello")]);
        store.save(&map).unwrap();

        assert_eq!(store.load().unwrap(), map);
        assert!(!store.temp_path().exists());
    }

    #[test]
    fn test_json_store_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("messages.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            JsonFileStore::new(path).load(),
            Err(GatewayError::Json(_))
        ));
    }

    #[test]
    fn test_restore_into_registry() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("messages.json"));
        let mut map = MessageMap::new();
        map.insert("col-a".into(), vec![ChatMessage::user("saved")]);
        map.insert("removed".into(), vec![ChatMessage::user("stale")]);
        store.save(&map).unwrap();

        let registry = shared_with(&["col-a"]);
        assert_eq!(restore(&registry, &store).unwrap(), 1);
        assert_eq!(
            registry::lock(&registry).column("col-a").unwrap().messages[0].text,
            "saved"
        );
    }

    #[tokio::test]
    async fn test_changes_are_debounced() {
        let registry = shared_with(&["col-a"]);
        let store = Arc::new(MemoryStore::default());
        let scheduler =
            PersistenceScheduler::spawn(registry.clone(), store.clone(), Duration::from_millis(50));

        for i in 0..3 {
            registry::lock(&registry).push_message("col-a", ChatMessage::user(format!("m{i}")));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert_eq!(store.save_count(), 1);
        assert_eq!(store.load().unwrap()["col-a"].len(), 3);

        scheduler.shutdown().await;
        // Nothing pending: no extra save.
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_pending_changes() {
        let registry = shared_with(&["col-a"]);
        let store = Arc::new(MemoryStore::default());
        let scheduler =
            PersistenceScheduler::spawn(registry.clone(), store.clone(), Duration::from_secs(60));

        registry::lock(&registry).push_message("col-a", ChatMessage::user("last words"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.save_count(), 0);

        scheduler.shutdown().await;
        assert_eq!(store.save_count(), 1);
        assert_eq!(store.load().unwrap()["col-a"][0].text, "last words");
    }
}
