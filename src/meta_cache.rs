//! Metadata revision cache.
//!
//! Caches small upstream responses (repo info JSON, branch → commit
//! resolution, tree listings) as whole blobs on disk with a soft TTL.
//! Expired entries are still served when upstream is unreachable or offline
//! mode is on. Concurrent fetches for the same key coalesce so upstream sees
//! one request.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, trace, warn};

use crate::cache::RepoType;
use crate::error::ProxyError;
use crate::offline::OfflineGuard;

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetaKind {
    /// `/api/{type}s/{org}/{name}[/revision/{rev}]` JSON.
    ApiRepoInfo,
    /// Resolved file head for a (revision, path): commit, size, etag, digest.
    ResolveHead,
    /// Tree listing JSON.
    TreeListing,
}

impl MetaKind {
    fn dir_name(&self) -> &'static str {
        match self {
            MetaKind::ApiRepoInfo => "info",
            MetaKind::ResolveHead => "resolve",
            MetaKind::TreeListing => "tree",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetaKey {
    pub kind: MetaKind,
    pub repo_type: RepoType,
    pub org: String,
    pub name: String,
    /// Revision, or revision + listing path, depending on kind.
    pub extra: String,
}

impl MetaKey {
    pub fn new(
        kind: MetaKind,
        repo_type: RepoType,
        org: impl Into<String>,
        name: impl Into<String>,
        extra: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            repo_type,
            org: org.into(),
            name: name.into(),
            extra: extra.into(),
        }
    }

    /// Stable file name: repo type and extra are hashed together so a model
    /// and a dataset sharing `org/name` never collide.
    fn key_hash(&self) -> String {
        let digest = Sha256::digest(format!("{}:{}", self.repo_type, self.extra));
        hex::encode(&digest[..8])
    }
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// What a fetcher hands back on success.
#[derive(Debug, Clone)]
pub struct FetchedMeta {
    pub bytes: Bytes,
    pub etag: Option<String>,
}

/// What `get_or_fetch` returns.
#[derive(Debug, Clone)]
pub struct MetaEntry {
    pub bytes: Bytes,
    pub etag: Option<String>,
    /// True when the entry was past its TTL but served anyway (upstream
    /// unreachable or offline).
    pub stale: bool,
}

#[derive(Debug, Clone, Default)]
struct EntryState {
    fetched_at: i64,
    etag: Option<String>,
}

// ---------------------------------------------------------------------------
// MetaCache
// ---------------------------------------------------------------------------

pub struct MetaCache {
    root: PathBuf,
    offline: Arc<OfflineGuard>,
    state: Mutex<HashMap<MetaKey, EntryState>>,
    inflight: Mutex<HashMap<MetaKey, Arc<AsyncMutex<()>>>>,
}

impl MetaCache {
    pub fn new(repos_path: &Path, offline: Arc<OfflineGuard>) -> Self {
        Self {
            root: repos_path.join("api"),
            offline,
            state: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    fn entry_path(&self, key: &MetaKey) -> PathBuf {
        self.root
            .join(key.kind.dir_name())
            .join(&key.org)
            .join(&key.name)
            .join(format!("{}.json", key.key_hash()))
    }

    /// Seconds since the entry was fetched, from the in-memory record or the
    /// file's mtime after a restart. `None` when the entry does not exist.
    fn age_secs(&self, key: &MetaKey, path: &Path) -> Option<i64> {
        let now = chrono::Utc::now().timestamp();
        if let Some(state) = self.state.lock().unwrap().get(key) {
            return Some(now - state.fetched_at);
        }
        let modified = path.metadata().ok()?.modified().ok()?;
        let fetched_at = chrono::DateTime::<chrono::Utc>::from(modified).timestamp();
        Some(now - fetched_at)
    }

    fn read_entry(&self, key: &MetaKey, path: &Path, stale: bool) -> Option<MetaEntry> {
        let bytes = std::fs::read(path).ok()?;
        let etag = self
            .state
            .lock()
            .unwrap()
            .get(key)
            .and_then(|s| s.etag.clone());
        Some(MetaEntry {
            bytes: Bytes::from(bytes),
            etag,
            stale,
        })
    }

    fn store_entry(&self, key: &MetaKey, path: &Path, fetched: &FetchedMeta) -> Result<(), ProxyError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(ProxyError::from_io)?;
        }
        std::fs::write(path, &fetched.bytes).map_err(ProxyError::from_io)?;
        self.state.lock().unwrap().insert(
            key.clone(),
            EntryState {
                fetched_at: chrono::Utc::now().timestamp(),
                etag: fetched.etag.clone(),
            },
        );
        Ok(())
    }

    fn lock_for(&self, key: &MetaKey) -> Arc<AsyncMutex<()>> {
        let mut inflight = self.inflight.lock().unwrap();
        Arc::clone(inflight.entry(key.clone()).or_default())
    }

    /// Return the cached value if fresh, otherwise fetch and store.
    ///
    /// Failure handling: a failed fetch falls back to a stale entry when one
    /// exists (logged); offline mode never calls the fetcher at all.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &MetaKey,
        ttl_secs: u64,
        fetcher: F,
    ) -> Result<MetaEntry, ProxyError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<FetchedMeta, ProxyError>>,
    {
        let path = self.entry_path(key);

        let fresh = |age: i64| age >= 0 && (age as u64) < ttl_secs;

        // Fast path without the single-flight lock.
        if let Some(age) = self.age_secs(key, &path) {
            if fresh(age) && !self.offline.is_offline() {
                if let Some(entry) = self.read_entry(key, &path, false) {
                    trace!(kind = ?key.kind, org = %key.org, name = %key.name, "meta cache hit");
                    return Ok(entry);
                }
            }
        }

        let lock = self.lock_for(key);
        let _guard = lock.lock().await;

        // Re-check: another task may have refreshed while we waited.
        if let Some(age) = self.age_secs(key, &path) {
            if fresh(age) && !self.offline.is_offline() {
                if let Some(entry) = self.read_entry(key, &path, false) {
                    return Ok(entry);
                }
            }
        }

        if self.offline.is_offline() {
            return match self.read_entry(key, &path, true) {
                Some(entry) => {
                    debug!(org = %key.org, name = %key.name, "serving stale metadata (offline)");
                    Ok(entry)
                }
                None => Err(ProxyError::OfflineMiss),
            };
        }

        match fetcher().await {
            Ok(fetched) => {
                self.store_entry(key, &path, &fetched)?;
                Ok(MetaEntry {
                    bytes: fetched.bytes,
                    etag: fetched.etag,
                    stale: false,
                })
            }
            Err(err) => match self.read_entry(key, &path, true) {
                Some(entry) => {
                    warn!(
                        org = %key.org,
                        name = %key.name,
                        error = %err,
                        "metadata fetch failed, serving stale entry"
                    );
                    Ok(entry)
                }
                None => Err(err),
            },
        }
    }

    /// Drop the entry from memory and disk.
    pub fn invalidate(&self, key: &MetaKey) {
        self.state.lock().unwrap().remove(key);
        let _ = std::fs::remove_file(self.entry_path(key));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn meta_key(extra: &str) -> MetaKey {
        MetaKey::new(MetaKind::ResolveHead, RepoType::Model, "org", "name", extra)
    }

    fn fetched(body: &str) -> FetchedMeta {
        FetchedMeta {
            bytes: Bytes::from(body.to_string()),
            etag: Some("\"abc\"".to_string()),
        }
    }

    #[tokio::test]
    async fn fetches_then_serves_from_cache() {
        let dir = tempdir().unwrap();
        let cache = MetaCache::new(dir.path(), Arc::new(OfflineGuard::new(false)));
        let key = meta_key("main");
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let entry = cache
                .get_or_fetch(&key, 600, || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok(fetched("{\"sha\":\"x\"}")) }
                })
                .await
                .unwrap();
            assert_eq!(&entry.bytes[..], b"{\"sha\":\"x\"}");
            assert!(!entry.stale);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_entry_is_refetched() {
        let dir = tempdir().unwrap();
        let cache = MetaCache::new(dir.path(), Arc::new(OfflineGuard::new(false)));
        let key = meta_key("main");

        cache
            .get_or_fetch(&key, 0, || async { Ok(fetched("v1")) })
            .await
            .unwrap();
        // ttl 0 means immediately stale
        let entry = cache
            .get_or_fetch(&key, 0, || async { Ok(fetched("v2")) })
            .await
            .unwrap();
        assert_eq!(&entry.bytes[..], b"v2");
    }

    #[tokio::test]
    async fn failed_refresh_serves_stale() {
        let dir = tempdir().unwrap();
        let cache = MetaCache::new(dir.path(), Arc::new(OfflineGuard::new(false)));
        let key = meta_key("main");

        cache
            .get_or_fetch(&key, 0, || async { Ok(fetched("old")) })
            .await
            .unwrap();
        let entry = cache
            .get_or_fetch(&key, 0, || async {
                Err::<FetchedMeta, _>(ProxyError::UpstreamTimeout)
            })
            .await
            .unwrap();
        assert_eq!(&entry.bytes[..], b"old");
        assert!(entry.stale);
    }

    #[tokio::test]
    async fn failed_fetch_without_stale_propagates() {
        let dir = tempdir().unwrap();
        let cache = MetaCache::new(dir.path(), Arc::new(OfflineGuard::new(false)));
        let result = cache
            .get_or_fetch(&meta_key("main"), 600, || async {
                Err::<FetchedMeta, _>(ProxyError::UpstreamHttp(404))
            })
            .await;
        assert!(matches!(result, Err(ProxyError::UpstreamHttp(404))));
    }

    #[tokio::test]
    async fn offline_serves_stale_and_never_fetches() {
        let dir = tempdir().unwrap();
        let offline = Arc::new(OfflineGuard::new(false));
        let cache = MetaCache::new(dir.path(), Arc::clone(&offline));
        let key = meta_key("main");

        cache
            .get_or_fetch(&key, 600, || async { Ok(fetched("kept")) })
            .await
            .unwrap();

        offline.set_offline(crate::offline::OfflineReason::Runtime);
        let calls = AtomicUsize::new(0);
        let entry = cache
            .get_or_fetch(&key, 600, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(fetched("nope")) }
            })
            .await
            .unwrap();
        assert_eq!(&entry.bytes[..], b"kept");

        // A key never cached fails with OfflineMiss.
        let miss = cache
            .get_or_fetch(&meta_key("other"), 600, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(fetched("nope")) }
            })
            .await;
        assert!(matches!(miss, Err(ProxyError::OfflineMiss)));
        assert_eq!(calls.load(Ordering::SeqCst), 0, "fetcher must not run offline");
    }

    #[tokio::test]
    async fn invalidate_forces_refetch() {
        let dir = tempdir().unwrap();
        let cache = MetaCache::new(dir.path(), Arc::new(OfflineGuard::new(false)));
        let key = meta_key("main");
        let calls = AtomicUsize::new(0);

        for _ in 0..2 {
            cache
                .get_or_fetch(&key, 600, || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok(fetched("x")) }
                })
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        cache.invalidate(&key);
        cache
            .get_or_fetch(&key, 600, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(fetched("x")) }
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn distinct_repo_types_get_distinct_paths() {
        let dir = tempdir().unwrap();
        let cache = MetaCache::new(dir.path(), Arc::new(OfflineGuard::new(false)));
        let model = MetaKey::new(MetaKind::ResolveHead, RepoType::Model, "o", "n", "main");
        let dataset = MetaKey::new(MetaKind::ResolveHead, RepoType::Dataset, "o", "n", "main");
        assert_ne!(cache.entry_path(&model), cache.entry_path(&dataset));
    }
}
