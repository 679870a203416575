use crate::config::Config;
use anyhow::{Context, Result, anyhow};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;

/// Disk-backed master and result caches. A cache hit is a plain
/// existence check; entries are never expired or evicted.
#[derive(Clone)]
pub struct CacheStore {
    pub master_dir: PathBuf,
    pub result_dir: PathBuf,
}

impl CacheStore {
    pub fn new(config: &Config) -> Result<Self> {
        ensure_dir(&config.master_dir)?;
        ensure_dir(&config.result_dir)?;
        Ok(Self {
            master_dir: config.master_dir.clone(),
            result_dir: config.result_dir.clone(),
        })
    }

    /// Local path of the master copy for a source path. Separators are
    /// flattened so every master lives directly under the master dir.
    pub fn master_path(&self, source_path: &str) -> PathBuf {
        self.master_dir.join(master_filename(source_path))
    }

    /// Local path of the transformed result for a fingerprint. The hex
    /// string is the filename; there is no extension.
    pub fn result_path(&self, fingerprint: &str) -> PathBuf {
        self.result_dir.join(fingerprint)
    }

    pub async fn is_cached(&self, path: &Path) -> bool {
        tokio::fs::metadata(path).await.is_ok()
    }

    /// Write bytes to a temp file in the target directory and rename it
    /// into place, so a concurrent existence check never observes a
    /// partially written entry. The temp file is removed on any failure.
    pub async fn store_file(&self, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("cache");
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_nanos())
            .unwrap_or(0);
        let temp_path = parent.join(format!(".{file_name}.tmp-{nonce}"));
        if let Err(err) = tokio::fs::write(&temp_path, bytes).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(err);
        }
        if let Err(err) = tokio::fs::rename(&temp_path, path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(err);
        }
        Ok(())
    }
}

pub fn master_filename(source_path: &str) -> String {
    source_path.replace('/', "_")
}

fn ensure_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("create cache directory {}", dir.display()))?;
    let metadata = std::fs::metadata(dir)
        .with_context(|| format!("stat cache directory {}", dir.display()))?;
    if !metadata.is_dir() {
        return Err(anyhow!("'{}' is not a directory", dir.display()));
    }
    Ok(())
}

/// Keyed in-flight-request registry. The first acquirer for a key leads
/// and does the work; later acquirers wait for the leader to finish and
/// then re-check the cache instead of duplicating the pipeline.
#[derive(Clone)]
pub struct Singleflight {
    inner: Arc<DashMap<String, Arc<Notify>>>,
}

impl Singleflight {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
        }
    }

    pub fn acquire(&self, key: &str) -> SingleflightPermit {
        match self.inner.entry(key.to_string()) {
            Entry::Occupied(entry) => {
                SingleflightPermit::waiter(self.inner.clone(), entry.get().clone(), key.to_string())
            }
            Entry::Vacant(entry) => {
                let notify = Arc::new(Notify::new());
                entry.insert(notify.clone());
                SingleflightPermit::leader(self.inner.clone(), notify, key.to_string())
            }
        }
    }
}

pub struct SingleflightPermit {
    key: String,
    notify: Arc<Notify>,
    is_leader: bool,
    inner: Arc<DashMap<String, Arc<Notify>>>,
}

impl SingleflightPermit {
    fn leader(inner: Arc<DashMap<String, Arc<Notify>>>, notify: Arc<Notify>, key: String) -> Self {
        Self {
            key,
            notify,
            is_leader: true,
            inner,
        }
    }

    fn waiter(inner: Arc<DashMap<String, Arc<Notify>>>, notify: Arc<Notify>, key: String) -> Self {
        Self {
            key,
            notify,
            is_leader: false,
            inner,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader
    }

    /// Wait until the leader drops its permit, or the timeout elapses.
    /// Returns true if the leader finished inside the window.
    pub async fn wait_result(self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.notify.notified())
            .await
            .is_ok()
    }
}

impl Drop for SingleflightPermit {
    fn drop(&mut self) {
        if !self.is_leader {
            return;
        }
        if let Some((_, notify)) = self.inner.remove(&self.key) {
            notify.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store(dir: &Path) -> CacheStore {
        CacheStore {
            master_dir: dir.join("master"),
            result_dir: dir.join("result"),
        }
    }

    #[test]
    fn master_filename_flattens_separators() {
        assert_eq!(master_filename("/images/cat.jpg"), "_images_cat.jpg");
        assert_eq!(master_filename("/a/b/c/deep.png"), "_a_b_c_deep.png");
    }

    #[test]
    fn ensure_dir_rejects_files() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("occupied");
        std::fs::write(&file, b"x").unwrap();
        assert!(ensure_dir(&file).is_err());
        assert!(ensure_dir(&dir.path().join("fresh")).is_ok());
    }

    #[tokio::test]
    async fn store_file_leaves_no_temp_behind() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        std::fs::create_dir_all(&store.result_dir).unwrap();
        let target = store.result_path("abc123");
        store.store_file(&target, b"payload").await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"payload");
        let leftovers = std::fs::read_dir(&store.result_dir)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with('.'))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn is_cached_is_an_existence_check() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        std::fs::create_dir_all(&store.master_dir).unwrap();
        let path = store.master_path("/images/cat.jpg");
        assert!(!store.is_cached(&path).await);
        std::fs::write(&path, b"bytes").unwrap();
        assert!(store.is_cached(&path).await);
    }

    #[tokio::test]
    async fn second_acquire_is_a_waiter_until_leader_drops() {
        let singleflight = Singleflight::new();
        let leader = singleflight.acquire("key");
        assert!(leader.is_leader());
        let waiter = singleflight.acquire("key");
        assert!(!waiter.is_leader());
        drop(leader);
        assert!(waiter.wait_result(Duration::from_secs(1)).await);
        let next = singleflight.acquire("key");
        assert!(next.is_leader());
    }
}
