//! Chunked on-disk cache: block files, the process-wide manager, and
//! background eviction.

pub mod bitmap;
pub mod block_file;
pub mod chunk_cache;
pub mod eviction;
pub mod key;

pub use block_file::{BlockFile, RangeStatus};
pub use chunk_cache::{CacheHandle, ChunkCache};
pub use key::{is_commit_hash, CacheKey, RepoType};
