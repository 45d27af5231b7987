//! Sparse data file plus sidecar header/bitmap for one cached upstream file.
//!
//! On disk a cached file is `<path>.bin` (sparse data) next to `<path>.meta`.
//! The sidecar starts with a fixed 64-byte little-endian header:
//!
//! ```text
//! offset  size  field
//!      0     4  magic "HBCH"
//!      4     1  version (1)
//!      5     3  reserved
//!      8     8  block_size (u64)
//!     16     8  total_size (u64)
//!     24    32  content digest (SHA-256, zero-filled when unknown)
//!     56     8  etag length (u64)
//! ```
//!
//! followed by the ETag bytes and `ceil(blocks/8)` bitmap bytes. A bitmap bit
//! is set only after the block's bytes are durably in the data file, so a
//! crash can lose blocks but never fabricate them.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::cache::bitmap::Bitmap;
use crate::error::ProxyError;

const MAGIC: &[u8; 4] = b"HBCH";
const VERSION: u8 = 1;
const HEADER_LEN: usize = 64;

/// Presence of a byte range in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeStatus {
    /// Every block intersecting the range is present.
    Complete,
    /// Some blocks are present; the listed inclusive block-index intervals
    /// are missing.
    Partial(Vec<(u32, u32)>),
    /// No block intersecting the range is present.
    Empty,
}

// ---------------------------------------------------------------------------
// BlockFile
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct BlockFile {
    data_path: PathBuf,
    meta_path: PathBuf,
    block_size: u64,
    total_size: u64,
    digest: Mutex<Option<[u8; 32]>>,
    etag: String,
    data: File,
    meta: File,
    bitmap: Mutex<Bitmap>,
    /// Set when the entry was invalidated (size/digest change) while handles
    /// were still live; in-flight readers and writers bail out on it.
    invalidated: AtomicBool,
}

impl BlockFile {
    // -- construction -------------------------------------------------------

    /// Open the BlockFile at `data_path`/`meta_path` or create it.
    ///
    /// An existing sidecar whose size, block size or (known) digest disagrees
    /// with the expected values is deleted and recreated, as is one that
    /// fails to parse. New files are staged under `tmp_dir` and renamed into
    /// place, sidecar last, so a crash mid-creation leaves no half-valid
    /// cache entry.
    pub fn open_or_create(
        data_path: PathBuf,
        meta_path: PathBuf,
        tmp_dir: &Path,
        total_size: u64,
        block_size: u64,
        digest: Option<[u8; 32]>,
        etag: &str,
    ) -> Result<Self, ProxyError> {
        if meta_path.exists() {
            match Self::open_existing(&data_path, &meta_path, total_size, block_size, digest) {
                Ok(file) => return Ok(file),
                Err(err) => {
                    warn!(
                        meta = %meta_path.display(),
                        error = %err,
                        "invalidating cache entry"
                    );
                    remove_pair(&data_path, &meta_path);
                }
            }
        }
        Self::create(
            data_path, meta_path, tmp_dir, total_size, block_size, digest, etag,
        )
    }

    fn open_existing(
        data_path: &Path,
        meta_path: &Path,
        total_size: u64,
        block_size: u64,
        digest: Option<[u8; 32]>,
    ) -> Result<Self, ProxyError> {
        let mut meta = OpenOptions::new()
            .read(true)
            .write(true)
            .open(meta_path)
            .map_err(ProxyError::from_io)?;

        let mut header = [0u8; HEADER_LEN];
        meta.read_exact(&mut header)
            .map_err(|_| ProxyError::BitmapCorrupt("sidecar too short for header".into()))?;

        if &header[0..4] != MAGIC {
            return Err(ProxyError::BitmapCorrupt("bad magic".into()));
        }
        if header[4] != VERSION {
            return Err(ProxyError::BitmapCorrupt(format!(
                "unsupported sidecar version {}",
                header[4]
            )));
        }

        let stored_block_size = u64::from_le_bytes(header[8..16].try_into().unwrap());
        let stored_total_size = u64::from_le_bytes(header[16..24].try_into().unwrap());
        let mut stored_digest = [0u8; 32];
        stored_digest.copy_from_slice(&header[24..56]);
        let stored_digest = if stored_digest == [0u8; 32] {
            None
        } else {
            Some(stored_digest)
        };
        let etag_len = u64::from_le_bytes(header[56..64].try_into().unwrap()) as usize;

        if stored_block_size != block_size {
            return Err(ProxyError::SizeMismatch);
        }
        if stored_total_size != total_size {
            return Err(ProxyError::SizeMismatch);
        }
        if let (Some(stored), Some(expected)) = (stored_digest, digest) {
            if stored != expected {
                return Err(ProxyError::DigestMismatch);
            }
        }
        if etag_len > 4096 {
            return Err(ProxyError::BitmapCorrupt("etag length implausible".into()));
        }

        let mut etag_bytes = vec![0u8; etag_len];
        meta.read_exact(&mut etag_bytes)
            .map_err(|_| ProxyError::BitmapCorrupt("sidecar truncated in etag".into()))?;
        let etag = String::from_utf8(etag_bytes)
            .map_err(|_| ProxyError::BitmapCorrupt("etag is not UTF-8".into()))?;

        let blocks = block_count(total_size, block_size);
        let mut bitmap_bytes = vec![0u8; (blocks as usize).div_ceil(8)];
        meta.read_exact(&mut bitmap_bytes)
            .map_err(|_| ProxyError::BitmapCorrupt("sidecar truncated in bitmap".into()))?;
        let bitmap = Bitmap::from_bytes(blocks as usize, &bitmap_bytes)
            .ok_or_else(|| ProxyError::BitmapCorrupt("bitmap length/padding invalid".into()))?;

        let data = OpenOptions::new()
            .read(true)
            .write(true)
            .open(data_path)
            .map_err(ProxyError::from_io)?;
        let data_len = data.metadata().map_err(ProxyError::from_io)?.len();
        if data_len != total_size {
            return Err(ProxyError::SizeMismatch);
        }

        let mut file = Self {
            data_path: data_path.to_path_buf(),
            meta_path: meta_path.to_path_buf(),
            block_size,
            total_size,
            digest: Mutex::new(stored_digest),
            etag,
            data,
            meta,
            bitmap: Mutex::new(bitmap),
            invalidated: AtomicBool::new(false),
        };

        // Upstream learned a digest the stored header predates: record it so
        // finalize can verify.
        if stored_digest.is_none() {
            if let Some(expected) = digest {
                file.store_digest(expected)?;
            }
        }

        debug!(data = %file.data_path.display(), "opened cache entry");
        Ok(file)
    }

    #[allow(clippy::too_many_arguments)]
    fn create(
        data_path: PathBuf,
        meta_path: PathBuf,
        tmp_dir: &Path,
        total_size: u64,
        block_size: u64,
        digest: Option<[u8; 32]>,
        etag: &str,
    ) -> Result<Self, ProxyError> {
        std::fs::create_dir_all(tmp_dir).map_err(ProxyError::from_io)?;
        if let Some(parent) = data_path.parent() {
            std::fs::create_dir_all(parent).map_err(ProxyError::from_io)?;
        }

        let stem = tmp_name();
        let tmp_data_path = tmp_dir.join(format!("{stem}.bin"));
        let tmp_meta_path = tmp_dir.join(format!("{stem}.meta"));

        let data = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&tmp_data_path)
            .map_err(ProxyError::from_io)?;
        // Sparse allocation: unwritten regions read as zeros but occupy no
        // disk blocks until filled.
        data.set_len(total_size).map_err(ProxyError::from_io)?;

        let blocks = block_count(total_size, block_size);
        let bitmap = Bitmap::new(blocks as usize);

        let mut meta = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&tmp_meta_path)
            .map_err(ProxyError::from_io)?;
        let mut header = [0u8; HEADER_LEN];
        header[0..4].copy_from_slice(MAGIC);
        header[4] = VERSION;
        header[8..16].copy_from_slice(&block_size.to_le_bytes());
        header[16..24].copy_from_slice(&total_size.to_le_bytes());
        if let Some(digest) = digest {
            header[24..56].copy_from_slice(&digest);
        }
        header[56..64].copy_from_slice(&(etag.len() as u64).to_le_bytes());
        meta.write_all(&header).map_err(ProxyError::from_io)?;
        meta.write_all(etag.as_bytes()).map_err(ProxyError::from_io)?;
        meta.write_all(bitmap.as_bytes())
            .map_err(ProxyError::from_io)?;
        meta.sync_all().map_err(ProxyError::from_io)?;
        data.sync_all().map_err(ProxyError::from_io)?;

        // Promote: data first, sidecar last. The sidecar's presence is the
        // commit point for the whole entry.
        std::fs::rename(&tmp_data_path, &data_path).map_err(ProxyError::from_io)?;
        std::fs::rename(&tmp_meta_path, &meta_path).map_err(ProxyError::from_io)?;

        debug!(
            data = %data_path.display(),
            total_size,
            block_size,
            blocks,
            "created cache entry"
        );

        Ok(Self {
            data_path,
            meta_path,
            block_size,
            total_size,
            digest: Mutex::new(digest),
            etag: etag.to_string(),
            data,
            meta,
            bitmap: Mutex::new(bitmap),
            invalidated: AtomicBool::new(false),
        })
    }

    // -- geometry -----------------------------------------------------------

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn block_count(&self) -> u32 {
        block_count(self.total_size, self.block_size)
    }

    /// Byte length of block `index` (the last block may be short).
    pub fn block_len(&self, index: u32) -> u64 {
        let start = u64::from(index) * self.block_size;
        self.block_size.min(self.total_size - start)
    }

    pub fn etag(&self) -> &str {
        &self.etag
    }

    pub fn digest(&self) -> Option<[u8; 32]> {
        *self.digest.lock().unwrap()
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    /// Inclusive block index range covering `[off, off + len)`.
    pub fn blocks_for_range(&self, off: u64, len: u64) -> Option<(u32, u32)> {
        if len == 0 || off >= self.total_size {
            return None;
        }
        let end = (off + len).min(self.total_size);
        let first = (off / self.block_size) as u32;
        let last = ((end - 1) / self.block_size) as u32;
        Some((first, last))
    }

    // -- presence -----------------------------------------------------------

    pub fn has_block(&self, index: u32) -> bool {
        self.bitmap.lock().unwrap().test(index as usize)
    }

    pub fn is_complete(&self) -> bool {
        self.bitmap.lock().unwrap().is_full()
    }

    pub fn complete_blocks(&self) -> u32 {
        self.bitmap.lock().unwrap().count() as u32
    }

    /// Presence of `[off, off + len)`, with missing blocks reported as
    /// inclusive index intervals clipped to the range.
    pub fn has_range(&self, off: u64, len: u64) -> RangeStatus {
        let Some((first, last)) = self.blocks_for_range(off, len) else {
            return RangeStatus::Complete;
        };
        let bitmap = self.bitmap.lock().unwrap();

        let mut missing: Vec<(u32, u32)> = Vec::new();
        let mut present = false;
        for index in first..=last {
            if bitmap.test(index as usize) {
                present = true;
            } else {
                match missing.last_mut() {
                    Some((_, end)) if *end + 1 == index => *end = index,
                    _ => missing.push((index, index)),
                }
            }
        }

        if missing.is_empty() {
            RangeStatus::Complete
        } else if present {
            RangeStatus::Partial(missing)
        } else {
            RangeStatus::Empty
        }
    }

    // -- I/O ----------------------------------------------------------------

    /// Read exactly `len` bytes at `off`. The caller must have established
    /// completeness of the covered blocks first.
    pub fn read_range(&self, off: u64, len: u64) -> Result<Bytes, ProxyError> {
        debug_assert!(off + len <= self.total_size);
        let mut buf = vec![0u8; len as usize];
        self.data
            .read_exact_at(&mut buf, off)
            .map_err(ProxyError::from_io)?;
        Ok(Bytes::from(buf))
    }

    /// Write one complete block and mark it present.
    ///
    /// `bytes` must be exactly the block's length. Re-writing a block whose
    /// bit is already set is a no-op: block content is immutable for a given
    /// commit and path. Ordering is write → flush data → set bit → persist
    /// bitmap, so a bit is never durable before its bytes.
    pub fn write_block(&self, index: u32, bytes: &[u8]) -> Result<(), ProxyError> {
        if index >= self.block_count() {
            return Err(ProxyError::Unexpected(anyhow::anyhow!(
                "block index {index} out of range (count {})",
                self.block_count()
            )));
        }
        let expected = self.block_len(index);
        if bytes.len() as u64 != expected {
            return Err(ProxyError::Unexpected(anyhow::anyhow!(
                "block {index} write of {} bytes, expected {expected}",
                bytes.len()
            )));
        }
        if self.has_block(index) {
            return Ok(());
        }

        let off = u64::from(index) * self.block_size;
        self.data
            .write_all_at(bytes, off)
            .map_err(ProxyError::from_io)?;
        self.data.sync_data().map_err(ProxyError::from_io)?;

        let mut bitmap = self.bitmap.lock().unwrap();
        // A racing writer may have set the bit while we wrote identical
        // bytes; both orders leave the same content on disk.
        if !bitmap.test(index as usize) {
            bitmap.set(index as usize);
            self.persist_bitmap(&bitmap)?;
        }
        Ok(())
    }

    fn bitmap_offset(&self) -> u64 {
        (HEADER_LEN + self.etag.len()) as u64
    }

    fn persist_bitmap(&self, bitmap: &Bitmap) -> Result<(), ProxyError> {
        self.meta
            .write_all_at(bitmap.as_bytes(), self.bitmap_offset())
            .map_err(ProxyError::from_io)?;
        self.meta.sync_data().map_err(ProxyError::from_io)
    }

    fn store_digest(&mut self, digest: [u8; 32]) -> Result<(), ProxyError> {
        self.meta
            .write_all_at(&digest, 24)
            .map_err(ProxyError::from_io)?;
        self.meta.sync_data().map_err(ProxyError::from_io)?;
        *self.digest.lock().unwrap() = Some(digest);
        Ok(())
    }

    /// Fsync both files; when a content digest is known, verify the complete
    /// file hashes to it.
    pub fn finalize(&self) -> Result<(), ProxyError> {
        self.data.sync_all().map_err(ProxyError::from_io)?;
        self.meta.sync_all().map_err(ProxyError::from_io)?;

        let Some(expected) = self.digest() else {
            return Ok(());
        };
        if !self.is_complete() {
            return Err(ProxyError::Unexpected(anyhow::anyhow!(
                "finalize called on incomplete file"
            )));
        }

        let mut hasher = Sha256::new();
        let mut off = 0u64;
        let mut buf = vec![0u8; self.block_size.min(1 << 20) as usize];
        while off < self.total_size {
            let take = buf.len().min((self.total_size - off) as usize);
            self.data
                .read_exact_at(&mut buf[..take], off)
                .map_err(ProxyError::from_io)?;
            hasher.update(&buf[..take]);
            off += take as u64;
        }
        let actual: [u8; 32] = hasher.finalize().into();
        if actual != expected {
            return Err(ProxyError::DigestMismatch);
        }
        Ok(())
    }

    /// Remove both files from disk. The in-memory handle becomes inert.
    pub fn delete(&self) {
        remove_pair(&self.data_path, &self.meta_path);
    }

    /// Delete the entry and poison live handles: subsequent `check_valid`
    /// calls fail so in-flight responses abort instead of serving a mix of
    /// old and new content.
    pub fn invalidate(&self) {
        self.invalidated.store(true, Ordering::Release);
        self.delete();
    }

    pub fn check_valid(&self) -> Result<(), ProxyError> {
        if self.invalidated.load(Ordering::Acquire) {
            Err(ProxyError::SizeMismatch)
        } else {
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub fn block_count(total_size: u64, block_size: u64) -> u32 {
    total_size.div_ceil(block_size) as u32
}

fn remove_pair(data_path: &Path, meta_path: &Path) {
    // Sidecar first: without it the data file is unreachable garbage, never
    // a half-valid entry.
    let _ = std::fs::remove_file(meta_path);
    let _ = std::fs::remove_file(data_path);
}

fn tmp_name() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("blockfile-{}-{n}", std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn paths(dir: &Path, name: &str) -> (PathBuf, PathBuf) {
        (
            dir.join(format!("{name}.bin")),
            dir.join(format!("{name}.meta")),
        )
    }

    fn open(
        dir: &Path,
        name: &str,
        total: u64,
        block: u64,
        digest: Option<[u8; 32]>,
    ) -> BlockFile {
        let (data, meta) = paths(dir, name);
        BlockFile::open_or_create(data, meta, &dir.join("tmp"), total, block, digest, "\"etag\"")
            .unwrap()
    }

    #[test]
    fn create_write_read_round_trip() {
        let dir = tempdir().unwrap();
        let file = open(dir.path(), "f", 10, 4, None);
        assert_eq!(file.block_count(), 3);
        assert_eq!(file.block_len(0), 4);
        assert_eq!(file.block_len(2), 2);

        file.write_block(0, b"aaaa").unwrap();
        file.write_block(2, b"cc").unwrap();
        assert!(file.has_block(0));
        assert!(!file.has_block(1));
        assert!(file.has_block(2));

        assert_eq!(&file.read_range(0, 4).unwrap()[..], b"aaaa");
        assert_eq!(&file.read_range(8, 2).unwrap()[..], b"cc");
    }

    #[test]
    fn reopen_preserves_bitmap_and_content() {
        let dir = tempdir().unwrap();
        {
            let file = open(dir.path(), "f", 10, 4, None);
            file.write_block(1, b"bbbb").unwrap();
        }
        let file = open(dir.path(), "f", 10, 4, None);
        assert!(!file.has_block(0));
        assert!(file.has_block(1));
        assert_eq!(&file.read_range(4, 4).unwrap()[..], b"bbbb");
        assert_eq!(file.etag(), "\"etag\"");
    }

    #[test]
    fn size_mismatch_invalidates() {
        let dir = tempdir().unwrap();
        {
            let file = open(dir.path(), "f", 1000, 256, None);
            file.write_block(0, &[1u8; 256]).unwrap();
        }
        // Upstream now reports 800 bytes for the same entry.
        let file = open(dir.path(), "f", 800, 256, None);
        assert_eq!(file.total_size(), 800);
        assert_eq!(file.complete_blocks(), 0);
    }

    #[test]
    fn digest_mismatch_on_open_invalidates() {
        let dir = tempdir().unwrap();
        {
            let file = open(dir.path(), "f", 8, 4, Some([1u8; 32]));
            file.write_block(0, &[0u8; 4]).unwrap();
        }
        let file = open(dir.path(), "f", 8, 4, Some([2u8; 32]));
        assert_eq!(file.complete_blocks(), 0);
        assert_eq!(file.digest(), Some([2u8; 32]));
    }

    #[test]
    fn late_digest_is_recorded() {
        let dir = tempdir().unwrap();
        {
            let file = open(dir.path(), "f", 8, 4, None);
            file.write_block(0, &[7u8; 4]).unwrap();
        }
        let file = open(dir.path(), "f", 8, 4, Some([9u8; 32]));
        // Existing blocks survive; digest is now pinned in the sidecar.
        assert_eq!(file.complete_blocks(), 1);
        assert_eq!(file.digest(), Some([9u8; 32]));

        drop(file);
        let file = open(dir.path(), "f", 8, 4, None);
        assert_eq!(file.digest(), Some([9u8; 32]));
    }

    #[test]
    fn rewrite_of_complete_block_is_noop() {
        let dir = tempdir().unwrap();
        let file = open(dir.path(), "f", 4, 4, None);
        file.write_block(0, b"good").unwrap();
        file.write_block(0, b"evil").unwrap();
        assert_eq!(&file.read_range(0, 4).unwrap()[..], b"good");
    }

    #[test]
    fn wrong_length_write_is_rejected() {
        let dir = tempdir().unwrap();
        let file = open(dir.path(), "f", 10, 4, None);
        assert!(file.write_block(0, b"abc").is_err());
        assert!(file.write_block(2, b"toolong").is_err());
        assert!(file.write_block(9, b"aaaa").is_err());
    }

    #[test]
    fn has_range_reports_missing_intervals() {
        let dir = tempdir().unwrap();
        let file = open(dir.path(), "f", 20, 4, None);
        file.write_block(1, b"bbbb").unwrap();
        file.write_block(3, b"dddd").unwrap();

        assert_eq!(file.has_range(4, 4), RangeStatus::Complete);
        assert_eq!(
            file.has_range(0, 20),
            RangeStatus::Partial(vec![(0, 0), (2, 2), (4, 4)])
        );
        assert_eq!(file.has_range(16, 4), RangeStatus::Empty);
        // Zero-length range is vacuously complete.
        assert_eq!(file.has_range(5, 0), RangeStatus::Complete);
    }

    #[test]
    fn zero_length_file_is_complete_immediately() {
        let dir = tempdir().unwrap();
        let file = open(dir.path(), "f", 0, 4, None);
        assert_eq!(file.block_count(), 0);
        assert!(file.is_complete());
        assert_eq!(file.has_range(0, 0), RangeStatus::Complete);
        file.finalize().unwrap();
    }

    #[test]
    fn finalize_verifies_digest() {
        let dir = tempdir().unwrap();
        let payload = b"hello world!";
        let digest: [u8; 32] = Sha256::digest(payload).into();

        let file = open(dir.path(), "good", payload.len() as u64, 8, Some(digest));
        file.write_block(0, &payload[..8]).unwrap();
        file.write_block(1, &payload[8..]).unwrap();
        file.finalize().unwrap();

        let file = open(dir.path(), "bad", payload.len() as u64, 8, Some([0xab; 32]));
        file.write_block(0, &payload[..8]).unwrap();
        file.write_block(1, &payload[8..]).unwrap();
        assert!(matches!(file.finalize(), Err(ProxyError::DigestMismatch)));
    }

    #[test]
    fn delete_removes_both_files() {
        let dir = tempdir().unwrap();
        let file = open(dir.path(), "f", 4, 4, None);
        let (data, meta) = paths(dir.path(), "f");
        assert!(data.exists() && meta.exists());
        file.delete();
        assert!(!data.exists() && !meta.exists());
    }

    #[test]
    fn truncated_sidecar_is_recreated() {
        let dir = tempdir().unwrap();
        let (data, meta) = paths(dir.path(), "f");
        {
            let file = open(dir.path(), "f", 12, 4, None);
            file.write_block(0, b"aaaa").unwrap();
        }
        std::fs::write(&meta, b"HBCH").unwrap();
        let file = BlockFile::open_or_create(
            data,
            meta,
            &dir.path().join("tmp"),
            12,
            4,
            None,
            "\"etag\"",
        )
        .unwrap();
        assert_eq!(file.complete_blocks(), 0);
    }

    #[test]
    fn blocks_for_range_clips_to_file() {
        let dir = tempdir().unwrap();
        let file = open(dir.path(), "f", 10, 4, None);
        assert_eq!(file.blocks_for_range(0, 10), Some((0, 2)));
        assert_eq!(file.blocks_for_range(3, 2), Some((0, 1)));
        assert_eq!(file.blocks_for_range(4, 4), Some((1, 1)));
        assert_eq!(file.blocks_for_range(9, 100), Some((2, 2)));
        assert_eq!(file.blocks_for_range(10, 1), None);
        assert_eq!(file.blocks_for_range(0, 0), None);
    }
}
