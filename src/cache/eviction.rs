//! Background cache eviction.
//!
//! An hourly sweep scans the chunked cache, accounts actual allocated bytes
//! (sparse files are charged for their populated blocks only), and when
//! usage exceeds the configured budget removes entries by the configured
//! policy until it fits. Entries with live handles are never touched.

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::cache::chunk_cache::ChunkCache;
use crate::config::EvictionPolicy;

/// Interval between eviction sweeps.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// One evictable cache entry (a `.bin` data file plus its sidecar).
#[derive(Debug, Clone)]
pub struct CacheEntryStat {
    pub data_path: PathBuf,
    /// Bytes actually allocated on disk, not the sparse logical length.
    pub allocated_bytes: u64,
    /// Last access time (seconds); falls back to mtime on filesystems
    /// mounted noatime.
    pub accessed_at: i64,
    /// Creation-ish time: the sidecar never moves after promotion, so its
    /// ctime orders entries by arrival.
    pub created_at: i64,
}

/// Walk the cache and collect every finished entry.
pub fn scan_entries(repos_path: &Path) -> Result<Vec<CacheEntryStat>> {
    let mut entries = Vec::new();
    for kind in ["models", "datasets", "spaces"] {
        let root = repos_path.join(kind);
        if !root.exists() {
            continue;
        }
        collect_bins(&root, &mut entries)?;
    }
    Ok(entries)
}

fn collect_bins(dir: &Path, out: &mut Vec<CacheEntryStat>) -> Result<()> {
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let read_dir = match std::fs::read_dir(&current) {
            Ok(read_dir) => read_dir,
            Err(_) => continue,
        };
        for entry in read_dir.flatten() {
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(_) => continue,
            };
            let path = entry.path();
            if metadata.is_dir() {
                stack.push(path);
            } else if path.extension().is_some_and(|ext| ext == "bin") {
                let sidecar = path.with_extension("meta");
                let created_at = sidecar
                    .metadata()
                    .map(|m| m.ctime())
                    .unwrap_or_else(|_| metadata.ctime());
                out.push(CacheEntryStat {
                    allocated_bytes: metadata.blocks() * 512,
                    accessed_at: metadata.atime().max(0),
                    created_at,
                    data_path: path,
                });
            }
        }
    }
    Ok(())
}

/// Order entries most-evictable-first for the given policy.
pub fn order_victims(entries: &mut [CacheEntryStat], policy: EvictionPolicy) {
    match policy {
        EvictionPolicy::Lru => entries.sort_by_key(|e| e.accessed_at),
        EvictionPolicy::Fifo => entries.sort_by_key(|e| e.created_at),
        EvictionPolicy::LargeFirst => {
            entries.sort_by(|a, b| b.allocated_bytes.cmp(&a.allocated_bytes))
        }
    }
}

/// Result of one eviction sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub evicted: usize,
    /// Allocated bytes remaining after the sweep.
    pub total_bytes: u64,
}

/// One sweep over the whole cache.
pub fn run_sweep(
    cache: &ChunkCache,
    limit_bytes: u64,
    policy: EvictionPolicy,
) -> Result<SweepStats> {
    let mut entries = scan_entries(cache.repos_path())?;
    let mut total: u64 = entries.iter().map(|e| e.allocated_bytes).sum();
    if total <= limit_bytes {
        debug!(total, limit_bytes, "cache within budget");
        return Ok(SweepStats {
            evicted: 0,
            total_bytes: total,
        });
    }

    order_victims(&mut entries, policy);
    let open = cache.open_data_paths();

    let mut evicted = 0usize;
    for entry in &entries {
        if total <= limit_bytes {
            break;
        }
        if open.contains(&entry.data_path) {
            debug!(path = %entry.data_path.display(), "skipping eviction: entry in use");
            continue;
        }
        let sidecar = entry.data_path.with_extension("meta");
        // Sidecar first so a partial removal leaves unreachable data rather
        // than a sidecar pointing at nothing.
        if let Err(err) = std::fs::remove_file(&sidecar) {
            warn!(path = %sidecar.display(), error = %err, "failed to evict sidecar");
            continue;
        }
        if let Err(err) = std::fs::remove_file(&entry.data_path) {
            warn!(path = %entry.data_path.display(), error = %err, "failed to evict data file");
        }
        total = total.saturating_sub(entry.allocated_bytes);
        evicted += 1;
        debug!(path = %entry.data_path.display(), freed = entry.allocated_bytes, "evicted cache entry");
    }

    if evicted > 0 {
        info!(evicted, remaining_bytes = total, "eviction sweep finished");
    }
    Ok(SweepStats {
        evicted,
        total_bytes: total,
    })
}

/// Long-running eviction loop, spawned at startup when a cache budget is
/// configured.
pub async fn run_eviction_loop(
    cache: Arc<ChunkCache>,
    limit_bytes: u64,
    policy: EvictionPolicy,
    metrics: crate::metrics::MetricsRegistry,
) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let cache = Arc::clone(&cache);
        let result =
            tokio::task::spawn_blocking(move || run_sweep(&cache, limit_bytes, policy)).await;
        match result {
            Ok(Ok(stats)) => {
                metrics
                    .metrics
                    .evictions_total
                    .inc_by(stats.evicted as u64);
                metrics.metrics.cache_size_bytes.set(stats.total_bytes as i64);
            }
            Ok(Err(err)) => warn!(error = %err, "eviction sweep failed"),
            Err(err) => warn!(error = %err, "eviction task panicked"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::key::{CacheKey, RepoType};
    use tempfile::tempdir;

    fn key(name: &str, path: &str) -> CacheKey {
        CacheKey::new(
            RepoType::Model,
            "org",
            name,
            "0123456789abcdef0123456789abcdef01234567",
            path,
        )
    }

    fn populate(cache: &Arc<ChunkCache>, name: &str, blocks: usize) -> PathBuf {
        let k = key(name, "file");
        let total = blocks as u64 * 4096;
        let handle = cache.acquire(k.clone(), total, None, "\"e\"").unwrap();
        for index in 0..blocks {
            handle
                .file()
                .write_block(index as u32, &vec![0x5a; 4096])
                .unwrap();
        }
        cache.entry_paths(&k).0
    }

    #[tokio::test]
    async fn sweep_noop_under_budget() {
        let dir = tempdir().unwrap();
        let cache = Arc::new(ChunkCache::new(dir.path().to_path_buf(), 4096));
        populate(&cache, "small", 1);
        let stats = run_sweep(&cache, u64::MAX, EvictionPolicy::Lru).unwrap();
        assert_eq!(stats.evicted, 0);
        assert!(stats.total_bytes > 0);
    }

    #[tokio::test]
    async fn sweep_removes_largest_first() {
        let dir = tempdir().unwrap();
        let cache = Arc::new(ChunkCache::new(dir.path().to_path_buf(), 4096));
        let big = populate(&cache, "big", 8);
        let small = populate(&cache, "small", 1);

        // Budget below total but above the small entry alone: only the big
        // entry goes.
        let stats = run_sweep(&cache, 3 * 4096, EvictionPolicy::LargeFirst).unwrap();
        assert_eq!(stats.evicted, 1);
        assert!(!big.exists());
        assert!(small.exists());
        assert!(!big.with_extension("meta").exists());
    }

    #[tokio::test]
    async fn sweep_refuses_open_entries() {
        let dir = tempdir().unwrap();
        let cache = Arc::new(ChunkCache::new(dir.path().to_path_buf(), 4096));
        let k = key("pinned", "file");
        let handle = cache.acquire(k.clone(), 4096, None, "\"e\"").unwrap();
        handle.file().write_block(0, &vec![1u8; 4096]).unwrap();

        let stats = run_sweep(&cache, 0, EvictionPolicy::Lru).unwrap();
        assert_eq!(stats.evicted, 0);
        assert!(cache.entry_paths(&k).0.exists());

        drop(handle);
        let stats = run_sweep(&cache, 0, EvictionPolicy::Lru).unwrap();
        assert_eq!(stats.evicted, 1);
        assert!(!cache.entry_paths(&k).0.exists());
    }

    #[test]
    fn ordering_policies() {
        let mk = |allocated, accessed, created| CacheEntryStat {
            data_path: PathBuf::from("x"),
            allocated_bytes: allocated,
            accessed_at: accessed,
            created_at: created,
        };
        let mut entries = vec![mk(10, 3, 1), mk(30, 1, 3), mk(20, 2, 2)];

        order_victims(&mut entries, EvictionPolicy::Lru);
        assert_eq!(entries[0].accessed_at, 1);

        order_victims(&mut entries, EvictionPolicy::Fifo);
        assert_eq!(entries[0].created_at, 1);

        order_victims(&mut entries, EvictionPolicy::LargeFirst);
        assert_eq!(entries[0].allocated_bytes, 30);
    }
}
