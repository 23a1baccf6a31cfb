//! File persistent storage
//!
//! Keeps the key space in memory and rewrites a JSON snapshot on every
//! mutation. A mutation becomes visible only after its snapshot has been
//! synced and atomically renamed into place, so a crash never exposes a value
//! (or a counter) that was not durable.
//!
//! Several stores may open the same data directory, in one process or in
//! several. Writers serialise on a lock file and always apply their change to
//! the snapshot currently on disk. Readers re-read the snapshot and decode it
//! again whenever its bytes differ from the ones they last decoded.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::{KvState, Revision, StoreError, StoreResult, TopologyStore, Versioned};

const SNAPSHOT_FILE: &str = "topology.json";
const LOCK_FILE: &str = "topology.lock";

/// A lock file older than this belongs to a writer that died
const LOCK_STALE_AFTER: Duration = Duration::from_secs(10);
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(2);

#[derive(Debug, Default)]
struct Loaded {
    state: KvState,
    /// Snapshot bytes `state` was decoded from, `None` if there was none
    raw: Option<Vec<u8>>,
}

/// File-backed store
pub struct FileStore {
    /// Snapshot file path
    snapshot_path: PathBuf,
    lock_path: PathBuf,
    loaded: Mutex<Loaded>,
}

impl FileStore {
    /// Open the store in `data_dir`, loading the existing snapshot if any
    pub async fn open<P: AsRef<Path>>(data_dir: P) -> StoreResult<Self> {
        let data_dir = data_dir.as_ref();

        if !data_dir.exists() {
            fs::create_dir_all(data_dir).await?;
            info!("Created data directory: {:?}", data_dir);
        }

        let store = Self {
            snapshot_path: data_dir.join(SNAPSHOT_FILE),
            lock_path: data_dir.join(LOCK_FILE),
            loaded: Mutex::new(Loaded::default()),
        };

        let loaded = store.current().await?;
        if loaded.raw.is_some() {
            info!(
                "Loaded topology snapshot from {:?}: {} keys",
                store.snapshot_path,
                loaded.state.len()
            );
        } else {
            info!(
                "No topology snapshot at {:?}, starting empty",
                store.snapshot_path
            );
        }
        drop(loaded);

        Ok(store)
    }

    /// Bring `loaded` in line with the snapshot on disk
    async fn reload(&self, loaded: &mut Loaded) -> StoreResult<()> {
        let raw = match fs::read(&self.snapshot_path).await {
            Ok(content) => Some(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        if raw == loaded.raw {
            return Ok(());
        }

        loaded.state = match &raw {
            Some(content) => serde_json::from_slice(content)
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            None => KvState::default(),
        };
        loaded.raw = raw;
        debug!("Reloaded topology snapshot: {} keys", loaded.state.len());
        Ok(())
    }

    /// The in-memory state, reloaded first if the snapshot changed on disk
    async fn current(&self) -> StoreResult<MutexGuard<'_, Loaded>> {
        let mut loaded = self.loaded.lock().await;
        self.reload(&mut loaded).await?;
        Ok(loaded)
    }

    async fn persist(&self, state: &KvState) -> StoreResult<Vec<u8>> {
        // Write to temp file first, then atomically rename
        let temp_path = self.snapshot_path.with_extension("json.tmp");
        let content =
            serde_json::to_vec(state).map_err(|e| StoreError::Serialization(e.to_string()))?;

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(&content).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, &self.snapshot_path).await?;

        debug!("Persisted topology snapshot: {} bytes", content.len());
        Ok(content)
    }

    /// Apply `op` to the snapshot on disk and publish it once durable
    async fn mutate<R>(
        &self,
        op: impl FnOnce(&mut KvState) -> StoreResult<R> + Send,
    ) -> StoreResult<R> {
        let mut loaded = self.loaded.lock().await;
        let _lock = WriterLock::acquire(&self.lock_path).await?;
        self.reload(&mut loaded).await?;

        let mut next = loaded.state.clone();
        let out = op(&mut next)?;
        let content = self.persist(&next).await?;
        loaded.state = next;
        loaded.raw = Some(content);
        Ok(out)
    }
}

/// Exclusive right to rewrite the snapshot, held as a lock file
struct WriterLock {
    path: PathBuf,
}

impl WriterLock {
    async fn acquire(path: &Path) -> StoreResult<Self> {
        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
                .await
            {
                Ok(mut file) => {
                    file.write_all(std::process::id().to_string().as_bytes())
                        .await?;
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if Self::is_stale(path).await {
                        warn!("Removing stale topology lock {:?}", path);
                        let _ = fs::remove_file(path).await;
                        continue;
                    }
                    tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn is_stale(path: &Path) -> bool {
        let Ok(meta) = fs::metadata(path).await else {
            return false;
        };
        meta.modified()
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .map_or(false, |age| age > LOCK_STALE_AFTER)
    }
}

impl Drop for WriterLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to release topology lock {:?}: {}", self.path, e);
        }
    }
}

#[async_trait]
impl TopologyStore for FileStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Versioned>> {
        Ok(self.current().await?.state.get(key))
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, Versioned)>> {
        Ok(self.current().await?.state.scan_prefix(prefix))
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<Revision>,
        value: serde_json::Value,
    ) -> StoreResult<Revision> {
        self.mutate(|state| state.compare_and_set(key, expected, value))
            .await
    }

    async fn compare_and_delete(&self, key: &str, expected: Revision) -> StoreResult<()> {
        self.mutate(|state| state.compare_and_delete(key, expected))
            .await
    }

    async fn increment(&self, key: &str) -> StoreResult<u64> {
        self.mutate(|state| state.increment(key)).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_reopen_keeps_values_and_counters() {
        let dir = tempfile::tempdir().unwrap();

        let store = FileStore::open(dir.path()).await.unwrap();
        let rev = store
            .compare_and_set("/clusters/c", None, json!({"name": "c"}))
            .await
            .unwrap();
        assert_eq!(store.increment("/counters/x").await.unwrap(), 1);
        assert_eq!(store.increment("/counters/x").await.unwrap(), 2);
        drop(store);

        // Reloading should get same data
        let store = FileStore::open(dir.path()).await.unwrap();
        let loaded = store.get("/clusters/c").await.unwrap().unwrap();
        assert_eq!(loaded.revision, rev);
        assert_eq!(loaded.value, json!({"name": "c"}));
        assert_eq!(store.increment("/counters/x").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_rejected_write_is_not_persisted() {
        let dir = tempfile::tempdir().unwrap();

        let store = FileStore::open(dir.path()).await.unwrap();
        store.compare_and_set("/k", None, json!(1)).await.unwrap();
        assert!(store.compare_and_set("/k", None, json!(2)).await.is_err());
        drop(store);

        let store = FileStore::open(dir.path()).await.unwrap();
        assert_eq!(store.get("/k").await.unwrap().unwrap().value, json!(1));
    }

    #[tokio::test]
    async fn test_stores_on_one_directory_see_each_other() {
        let dir = tempfile::tempdir().unwrap();
        let first = FileStore::open(dir.path()).await.unwrap();
        let second = FileStore::open(dir.path()).await.unwrap();

        let rev = first.compare_and_set("/k", None, json!(1)).await.unwrap();
        assert_eq!(second.get("/k").await.unwrap().unwrap().revision, rev);

        // The second store must not overwrite a key it has not seen change
        assert!(second.compare_and_set("/k", None, json!(2)).await.is_err());
        let next = second.compare_and_set("/k", Some(rev), json!(2)).await.unwrap();

        assert_eq!(first.get("/k").await.unwrap().unwrap().value, json!(2));
        assert!(first.compare_and_set("/k", Some(rev), json!(3)).await.is_err());
        first.compare_and_delete("/k", next).await.unwrap();
        assert!(second.scan_prefix("/").await.unwrap().is_empty());

        assert_eq!(first.increment("/n").await.unwrap(), 1);
        assert_eq!(second.increment("/n").await.unwrap(), 2);
        assert!(!dir.path().join(LOCK_FILE).exists());
    }

    #[tokio::test]
    async fn test_stale_writer_lock_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();

        let lock = std::fs::File::create(dir.path().join(LOCK_FILE)).unwrap();
        lock.set_modified(SystemTime::now() - LOCK_STALE_AFTER * 2)
            .unwrap();
        drop(lock);

        store.compare_and_set("/k", None, json!(1)).await.unwrap();
    }
}
