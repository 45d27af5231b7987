//! Process-wide manager over [`BlockFile`]s.
//!
//! Resolves a [`CacheKey`] to its on-disk location
//! (`{repos_path}/{repo_type}/{org}/{name}/blocks/{commit}/{path}.bin`),
//! keeps a refcounted registry of open files, and coordinates concurrent
//! fills so that at most one upstream fetch per (key, block) is ever in
//! flight. A second request for an overlapping range joins the first
//! request's fetches instead of duplicating them.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use std::future::Future;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::cache::block_file::BlockFile;
use crate::cache::key::CacheKey;
use crate::error::ProxyError;

type SlotKey = (CacheKey, u32);
type SlotMap = Arc<Mutex<HashMap<SlotKey, watch::Sender<bool>>>>;

struct OpenEntry {
    file: Arc<BlockFile>,
    refs: usize,
}

// ---------------------------------------------------------------------------
// ChunkCache
// ---------------------------------------------------------------------------

pub struct ChunkCache {
    repos_path: PathBuf,
    tmp_path: PathBuf,
    block_size: u64,
    open_files: Mutex<HashMap<CacheKey, OpenEntry>>,
    slots: SlotMap,
}

impl ChunkCache {
    pub fn new(repos_path: PathBuf, block_size: u64) -> Self {
        let tmp_path = repos_path.join("tmp");
        Self {
            repos_path,
            tmp_path,
            block_size,
            open_files: Mutex::new(HashMap::new()),
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn repos_path(&self) -> &PathBuf {
        &self.repos_path
    }

    /// On-disk data/sidecar paths for a key. Directory separators inside
    /// `key.path` are preserved.
    pub fn entry_paths(&self, key: &CacheKey) -> (PathBuf, PathBuf) {
        let base = self
            .repos_path
            .join(key.repo_type.plural())
            .join(&key.org)
            .join(&key.name)
            .join("blocks")
            .join(&key.commit)
            .join(&key.path);
        let data = base.with_file_name(format!(
            "{}.bin",
            base.file_name().unwrap_or_default().to_string_lossy()
        ));
        let meta = base.with_file_name(format!(
            "{}.meta",
            base.file_name().unwrap_or_default().to_string_lossy()
        ));
        (data, meta)
    }

    // -- handle lifecycle ---------------------------------------------------

    /// Open or create the BlockFile for `key` and return a refcounted handle.
    ///
    /// If the key is already open but its geometry disagrees with the
    /// authoritative upstream values (size shrink, digest change), the stale
    /// entry is invalidated — poisoning live handles — and a fresh one is
    /// created.
    pub fn acquire(
        self: &Arc<Self>,
        key: CacheKey,
        total_size: u64,
        digest: Option<[u8; 32]>,
        etag: &str,
    ) -> Result<CacheHandle, ProxyError> {
        let mut open_files = self.open_files.lock().unwrap();

        if let Some(entry) = open_files.get_mut(&key) {
            let file = &entry.file;
            let digest_conflict = matches!(
                (file.digest(), digest),
                (Some(stored), Some(expected)) if stored != expected
            );
            if file.total_size() == total_size && !digest_conflict {
                entry.refs += 1;
                return Ok(CacheHandle {
                    cache: Arc::clone(self),
                    key,
                    file: Arc::clone(&entry.file),
                });
            }
            warn!(key = %key, "geometry changed for open entry, invalidating");
            entry.file.invalidate();
            open_files.remove(&key);
        }

        let (data_path, meta_path) = self.entry_paths(&key);
        let file = Arc::new(BlockFile::open_or_create(
            data_path,
            meta_path,
            &self.tmp_path,
            total_size,
            self.block_size,
            digest,
            etag,
        )?);
        open_files.insert(
            key.clone(),
            OpenEntry {
                file: Arc::clone(&file),
                refs: 1,
            },
        );
        Ok(CacheHandle {
            cache: Arc::clone(self),
            key,
            file,
        })
    }

    fn release(&self, key: &CacheKey) {
        let mut open_files = self.open_files.lock().unwrap();
        if let Some(entry) = open_files.get_mut(key) {
            entry.refs -= 1;
            if entry.refs == 0 {
                open_files.remove(key);
                trace!(key = %key, "closed cache entry");
            }
        }
    }

    /// Drop the registry entry and delete the on-disk files. Live handles
    /// are poisoned.
    pub fn invalidate(&self, key: &CacheKey) {
        let mut open_files = self.open_files.lock().unwrap();
        if let Some(entry) = open_files.remove(key) {
            entry.file.invalidate();
        } else {
            let (data_path, meta_path) = self.entry_paths(key);
            let _ = std::fs::remove_file(&meta_path);
            let _ = std::fs::remove_file(&data_path);
        }
    }

    /// Data paths of currently-open entries; eviction must not touch these.
    pub fn open_data_paths(&self) -> HashSet<PathBuf> {
        self.open_files
            .lock()
            .unwrap()
            .values()
            .map(|entry| entry.file.data_path().to_path_buf())
            .collect()
    }

    // -- single-flight fill -------------------------------------------------

    /// Ensure every block intersecting `[off, off + len)` is present,
    /// fetching missing ones via `fetcher(block_off, block_len)`.
    ///
    /// Blocks are filled in ascending order; each missing block is fetched by
    /// exactly one task process-wide, with other callers awaiting its
    /// completion signal.
    pub async fn fill_range<F, Fut>(
        self: &Arc<Self>,
        handle: &CacheHandle,
        off: u64,
        len: u64,
        fetcher: F,
    ) -> Result<(), ProxyError>
    where
        F: Fn(u64, u64) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes, ProxyError>> + Send + 'static,
    {
        let Some((first, last)) = handle.file.blocks_for_range(off, len) else {
            return Ok(());
        };
        for index in first..=last {
            self.ensure_block(handle, index, fetcher.clone()).await?;
        }
        Ok(())
    }

    /// Single-flight fill of one block.
    pub async fn ensure_block<F, Fut>(
        self: &Arc<Self>,
        handle: &CacheHandle,
        index: u32,
        fetcher: F,
    ) -> Result<(), ProxyError>
    where
        F: Fn(u64, u64) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes, ProxyError>> + Send + 'static,
    {
        let file = &handle.file;
        loop {
            if file.has_block(index) {
                return Ok(());
            }
            file.check_valid()?;

            let slot_key = (handle.key.clone(), index);
            // Either join the in-flight fetch for this block or become its
            // fetcher. Subscribing under the lock guarantees we never miss
            // the completion signal.
            let waiter = {
                let mut slots = self.slots.lock().unwrap();
                match slots.get(&slot_key) {
                    Some(tx) => Some(tx.subscribe()),
                    None => {
                        let (tx, rx) = watch::channel(false);
                        slots.insert(slot_key.clone(), tx);
                        // Our own receiver comes from run_fetch, which
                        // subscribes before spawning the fetch task.
                        drop(rx);
                        None
                    }
                }
            };

            match waiter {
                Some(mut rx) => {
                    if *rx.borrow_and_update() {
                        continue;
                    }
                    // Ok: fetch completed. Err: fetcher failed and dropped
                    // its sender — re-check the bitmap and take over.
                    let _ = rx.changed().await;
                    trace!(key = %handle.key, index, "woke from block wait");
                    continue;
                }
                None => {
                    let result = self.run_fetch(handle, index, slot_key, fetcher.clone()).await;
                    match result {
                        Ok(()) => return Ok(()),
                        Err(ProxyError::Cancelled) => continue,
                        Err(err) => return Err(err),
                    }
                }
            }
        }
    }

    /// Spawn the fetch for `(key, index)` as its own task so that a client
    /// disconnect does not abort a transfer other waiters depend on, then
    /// await it. The task itself clears the slot and signals waiters.
    async fn run_fetch<F, Fut>(
        self: &Arc<Self>,
        handle: &CacheHandle,
        index: u32,
        slot_key: SlotKey,
        fetcher: F,
    ) -> Result<(), ProxyError>
    where
        F: Fn(u64, u64) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes, ProxyError>> + Send + 'static,
    {
        let slots = Arc::clone(&self.slots);
        let file = Arc::clone(&handle.file);
        let key = handle.key.clone();

        // Hold a receiver while we await so the fetch task can tell whether
        // anyone still wants this block.
        let owner_rx = {
            let slots = self.slots.lock().unwrap();
            slots.get(&slot_key).map(|tx| tx.subscribe())
        };

        let task = tokio::spawn(async move {
            let result = async {
                let tx_alive = {
                    let slots = slots.lock().unwrap();
                    slots
                        .get(&slot_key)
                        .map(|tx| tx.receiver_count() > 0)
                        .unwrap_or(false)
                };
                if !tx_alive {
                    // Everyone who wanted this block is gone; don't bother
                    // upstream.
                    return Err(ProxyError::Cancelled);
                }

                file.check_valid()?;
                let off = u64::from(index) * file.block_size();
                let len = file.block_len(index);
                let bytes = fetcher(off, len).await?;
                if bytes.len() as u64 != len {
                    return Err(ProxyError::UpstreamNetwork(format!(
                        "block fetch returned {} bytes, expected {len}",
                        bytes.len()
                    )));
                }
                file.check_valid()?;
                file.write_block(index, &bytes)
            }
            .await;

            let tx = slots.lock().unwrap().remove(&slot_key);
            match (&result, tx) {
                (Ok(()), Some(tx)) => {
                    let _ = tx.send(true);
                }
                // Error path: dropping the sender closes the channel, which
                // wakes waiters so one of them can retry.
                _ => {}
            }
            if let Err(ref err) = result {
                if !matches!(err, ProxyError::Cancelled) {
                    debug!(key = %key, index, error = %err, "block fetch failed");
                }
            }
            result
        });

        // Keep owner_rx alive across the await: it is this request's claim
        // on the fetch.
        let result = task.await;
        drop(owner_rx);
        match result {
            Ok(inner) => inner,
            Err(join_err) => Err(ProxyError::Unexpected(anyhow::anyhow!(
                "block fetch task panicked: {join_err}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// CacheHandle
// ---------------------------------------------------------------------------

/// Refcounted handle to an open BlockFile. Dropping it releases the registry
/// reference; the last drop closes the entry (making it evictable).
pub struct CacheHandle {
    cache: Arc<ChunkCache>,
    key: CacheKey,
    file: Arc<BlockFile>,
}

impl CacheHandle {
    pub fn file(&self) -> &Arc<BlockFile> {
        &self.file
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }
}

impl Drop for CacheHandle {
    fn drop(&mut self) {
        self.cache.release(&self.key);
    }
}
