//! The per-request file-serving state machine.
//!
//! For a (repo, revision, path, byte-range) request this module resolves the
//! revision to a commit, checks policy, opens the chunked cache entry, and
//! streams the response block by block: complete blocks come from disk,
//! missing ones are fetched from upstream through the single-flight
//! coordinator and teed into the cache on the way through. With caching
//! disabled (policy or full disk) the request degrades to a pass-through
//! proxy of the upstream body.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::ReaderStream;
use tracing::{debug, instrument, warn};

use crate::cache::{is_commit_hash, CacheHandle, CacheKey, RepoType};
use crate::error::ProxyError;
use crate::http::range::{parse_range, ByteRange};
use crate::meta_cache::{FetchedMeta, MetaKey, MetaKind};
use crate::metrics::{CacheLabels, CacheOutcome};
use crate::upstream::{
    forward_headers, FileStat, HEADER_LINKED_ETAG, HEADER_LINKED_SIZE, HEADER_REPO_COMMIT,
};
use crate::AppState;

/// How the file is addressed upstream: `resolve` serves real content, `raw`
/// serves the repository blob (an LFS pointer for large files).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchKind {
    Resolve,
    Raw,
}

/// A classified file request from the router.
#[derive(Debug)]
pub struct FileRequest {
    pub repo_type: RepoType,
    pub org: String,
    pub name: String,
    pub revision: String,
    pub path: String,
    pub kind: FetchKind,
    pub method: Method,
    pub headers: HeaderMap,
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Serve `/{org}/{name}/{resolve|raw}/{rev}/{path}`.
#[instrument(skip(state, request), fields(repo = %format!("{}/{}", request.org, request.name), path = %request.path, rev = %request.revision))]
pub async fn serve_file(
    state: &Arc<AppState>,
    request: FileRequest,
) -> Result<Response, ProxyError> {
    validate_path(&request.path)?;
    let slug = format!("{}/{}", request.org, request.name);

    if !state.policy.proxy_allowed(&slug) {
        return Err(ProxyError::ProxyDenied(slug));
    }

    // Pre-cloned mirrors take precedence over upstream.
    if let Some(response) = try_serve_mirror(state, &request).await? {
        return Ok(response);
    }

    let (commit, stat) = resolve_file_stat(state, &request).await?;

    // LFS files: upstream answered the resolve HEAD with a redirect to its
    // CDN. Hand the client a location on this mirror; the CDN route serves
    // (and caches) the bytes.
    if request.kind == FetchKind::Resolve {
        if let Some(location) = &stat.redirect_location {
            let rewritten = state.upstream.rewrite_lfs_location(location);
            debug!(location = %rewritten, "redirecting LFS file to mirror CDN path");
            let mut response = StatusCode::FOUND.into_response();
            let headers = response.headers_mut();
            headers.insert(header::LOCATION, header_value(&rewritten));
            headers.insert(HEADER_REPO_COMMIT, header_value(&commit));
            if let Some(linked_etag) = &stat.linked_etag {
                headers.insert(HEADER_LINKED_ETAG, header_value(linked_etag));
            }
            if let Some(linked_size) = stat.linked_size {
                headers.insert(HEADER_LINKED_SIZE, header_value(&linked_size.to_string()));
            }
            return Ok(response);
        }
    }

    let path_namespace = match request.kind {
        FetchKind::Resolve => request.path.clone(),
        FetchKind::Raw => format!(".raw/{}", request.path),
    };
    let key = CacheKey::new(
        request.repo_type,
        &request.org,
        &request.name,
        &commit,
        path_namespace,
    );

    // Policy decides whether the chunk cache participates at all; offline
    // mode is enforced further down, where a missing block's fetch fails
    // with `OfflineMiss` while present blocks still serve from disk.
    let plan = ServePlan {
        key,
        meta_key: resolve_meta_key(&request),
        commit: Some(commit),
        stat,
        cache_enabled: state.policy.cache_allowed(&slug),
        head: request.method == Method::HEAD,
    };
    respond(state, plan, &request.headers).await
}

/// Serve an opaque LFS CDN path (`/repos/...` or a rewritten upstream CDN
/// location). These URLs are content-addressed, so the cache key is derived
/// from the path itself rather than a commit.
#[instrument(skip(state, headers))]
pub async fn serve_cdn(
    state: &Arc<AppState>,
    tail: String,
    method: Method,
    headers: HeaderMap,
) -> Result<Response, ProxyError> {
    // The tail is an absolute path (plus query) on the CDN host.
    if tail.contains("..") || tail.contains('\0') || !tail.starts_with('/') {
        return Err(ProxyError::BadRequest(format!("invalid LFS path: {tail}")));
    }
    let upstream_url = state.upstream.lfs_url(&tail);

    let stat = resolve_cdn_stat(state, &tail, &upstream_url, &headers).await?;
    let pseudo_commit = pseudo_commit_for(&tail);

    let file_name = tail
        .rsplit('/')
        .next()
        .unwrap_or("object")
        .split('?')
        .next()
        .unwrap_or("object")
        .to_string();
    let key = CacheKey::new(RepoType::Model, "lfs", "cdn", pseudo_commit, file_name);

    let plan = ServePlan {
        key,
        meta_key: cdn_meta_key(&tail),
        commit: None,
        stat,
        cache_enabled: true,
        head: method == Method::HEAD,
    };
    respond(state, plan, &headers).await
}

// ---------------------------------------------------------------------------
// Revision resolution
// ---------------------------------------------------------------------------

/// Resolve (revision, path) to the authoritative commit and file geometry,
/// through the metadata cache. Entries keyed by a commit hash never expire;
/// branch-keyed entries honour the configured TTL.
/// Metadata-cache key for a file's resolved head.
fn resolve_meta_key(request: &FileRequest) -> MetaKey {
    MetaKey::new(
        MetaKind::ResolveHead,
        request.repo_type,
        &request.org,
        &request.name,
        format!("{}:{}:{:?}", request.revision, request.path, request.kind),
    )
}

fn cdn_meta_key(tail: &str) -> MetaKey {
    MetaKey::new(
        MetaKind::ResolveHead,
        RepoType::Model,
        "lfs",
        "cdn",
        tail.to_string(),
    )
}

async fn resolve_file_stat(
    state: &Arc<AppState>,
    request: &FileRequest,
) -> Result<(String, FileStat), ProxyError> {
    let meta_key = resolve_meta_key(request);
    let ttl = if is_commit_hash(&request.revision) {
        u64::MAX
    } else {
        state.config.ttl.resolve_secs
    };

    let url = match request.kind {
        FetchKind::Resolve => state.upstream.resolve_url(
            request.repo_type,
            &request.org,
            &request.name,
            &request.revision,
            &request.path,
        ),
        FetchKind::Raw => state.upstream.raw_url(
            request.repo_type,
            &request.org,
            &request.name,
            &request.revision,
            &request.path,
        ),
    };

    let upstream = Arc::clone(&state.upstream);
    let headers = request.headers.clone();
    let entry = state
        .meta_cache
        .get_or_fetch(&meta_key, ttl, || async move {
            let stat = upstream.head_file(&url, &headers).await?;
            let bytes = serde_json::to_vec(&stat)
                .map_err(|e| ProxyError::Unexpected(anyhow::anyhow!("encoding file stat: {e}")))?;
            Ok(FetchedMeta {
                bytes: Bytes::from(bytes),
                etag: stat.etag.clone(),
            })
        })
        .await?;
    if entry.stale {
        state.metrics.metrics.meta_stale_served.inc();
    }

    let stat: FileStat = serde_json::from_slice(&entry.bytes)
        .map_err(|e| ProxyError::Unexpected(anyhow::anyhow!("decoding cached file stat: {e}")))?;

    let commit = stat
        .commit
        .clone()
        .or_else(|| is_commit_hash(&request.revision).then(|| request.revision.clone()))
        // Degraded: upstream never told us the commit (offline bootstrap) —
        // fall back to the revision so the entry is at least addressable.
        .unwrap_or_else(|| request.revision.clone());
    Ok((commit, stat))
}

/// HEAD the CDN URL (through the metadata cache) to learn its size and tags.
async fn resolve_cdn_stat(
    state: &Arc<AppState>,
    tail: &str,
    upstream_url: &str,
    headers: &HeaderMap,
) -> Result<FileStat, ProxyError> {
    let meta_key = cdn_meta_key(tail);
    // CDN objects are content-addressed and immutable.
    let ttl = u64::MAX;

    let upstream = Arc::clone(&state.upstream);
    let url = upstream_url.to_string();
    let headers = headers.clone();
    let entry = state
        .meta_cache
        .get_or_fetch(&meta_key, ttl, || async move {
            let stat = upstream.head_file(&url, &headers).await?;
            let bytes = serde_json::to_vec(&stat)
                .map_err(|e| ProxyError::Unexpected(anyhow::anyhow!("encoding file stat: {e}")))?;
            Ok(FetchedMeta {
                bytes: Bytes::from(bytes),
                etag: stat.etag.clone(),
            })
        })
        .await?;

    serde_json::from_slice(&entry.bytes)
        .map_err(|e| ProxyError::Unexpected(anyhow::anyhow!("decoding cached file stat: {e}")))
}

/// Stable 40-hex pseudo-commit for content-addressed CDN paths.
fn pseudo_commit_for(tail: &str) -> String {
    let digest = Sha256::digest(tail.as_bytes());
    hex::encode(&digest[..20])
}

// ---------------------------------------------------------------------------
// The serve plan
// ---------------------------------------------------------------------------

struct ServePlan {
    key: CacheKey,
    /// Resolve-head entry to drop if upstream turns out to have reshaped the
    /// file (416 mid-fetch).
    meta_key: MetaKey,
    commit: Option<String>,
    stat: FileStat,
    cache_enabled: bool,
    head: bool,
}

async fn respond(
    state: &Arc<AppState>,
    plan: ServePlan,
    inbound: &HeaderMap,
) -> Result<Response, ProxyError> {
    let size = plan.stat.size;
    let etag = strong_etag(&plan.key.commit, &plan.key.path);

    // Zero-length files: the bitmap is empty and any request is a trivial
    // 200.
    if size == 0 {
        let mut response = Response::new(Body::empty());
        set_common_headers(response.headers_mut(), &plan, &etag, 0, None);
        return Ok(response);
    }

    if plan.head {
        let mut response = Response::new(Body::empty());
        set_common_headers(response.headers_mut(), &plan, &etag, size, None);
        return Ok(response);
    }

    let range_header = inbound
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let range = parse_range(range_header.as_deref(), size)?;

    // Open the cache entry; a full disk downgrades the request to
    // pass-through rather than failing it.
    let (handle, cache_enabled) = if plan.cache_enabled {
        match state.chunk_cache.acquire(
            plan.key.clone(),
            size,
            plan.stat.digest_bytes(),
            plan.stat.etag.as_deref().unwrap_or(""),
        ) {
            Ok(handle) => (Some(handle), true),
            Err(ProxyError::DiskFull) => {
                warn!(key = %plan.key, "disk full, serving pass-through without tee");
                (None, false)
            }
            Err(err) => return Err(err),
        }
    } else {
        (None, false)
    };

    let status = if range.partial {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };
    let content_range = range.partial.then(|| range.content_range(size));

    // Bounded channel between the block producer and the client: at most a
    // couple of blocks are ever buffered, so a slow client throttles the
    // whole pipeline.
    let (tx, rx) = mpsc::channel::<Result<Bytes, ProxyError>>(2);
    let producer_state = Arc::clone(state);
    let fetch_url = plan.stat.fetch_url.clone();
    let producer_headers = forward_headers(inbound);
    let key = plan.key.clone();
    let meta_key = plan.meta_key.clone();
    tokio::spawn(async move {
        let result = if let (Some(handle), true) = (&handle, cache_enabled) {
            stream_blocks(
                &producer_state,
                handle,
                &fetch_url,
                range,
                &producer_headers,
                &tx,
            )
            .await
        } else {
            stream_passthrough(&producer_state, &fetch_url, range, &producer_headers, &tx).await
        };

        match result {
            Ok(()) => {}
            Err(ProxyError::SizeMismatch) => {
                // Upstream shrank or reshaped the file mid-flight: drop both
                // the blocks and the cached head so the next request re-HEADs
                // and rebuilds at the new geometry.
                producer_state.metrics.metrics.cache_invalidations_total.inc();
                producer_state.chunk_cache.invalidate(&key);
                producer_state.meta_cache.invalidate(&meta_key);
                let _ = tx.send(Err(ProxyError::SizeMismatch)).await;
            }
            Err(err) => {
                let _ = tx.send(Err(err)).await;
            }
        }
    });

    let mut response = Response::new(Body::from_stream(ReceiverStream::new(rx)));
    *response.status_mut() = status;
    set_common_headers(
        response.headers_mut(),
        &plan,
        &etag,
        range.len,
        content_range.as_deref(),
    );
    Ok(response)
}

fn set_common_headers(
    headers: &mut HeaderMap,
    plan: &ServePlan,
    etag: &str,
    content_length: u64,
    content_range: Option<&str>,
) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, header_value(&content_length.to_string()));
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(header::ETAG, header_value(etag));
    if let Some(content_range) = content_range {
        headers.insert(header::CONTENT_RANGE, header_value(content_range));
    }
    if let Some(commit) = &plan.commit {
        headers.insert(HEADER_REPO_COMMIT, header_value(commit));
    }
    if let Some(linked_etag) = &plan.stat.linked_etag {
        headers.insert(HEADER_LINKED_ETAG, header_value(linked_etag));
    }
    if let Some(linked_size) = plan.stat.linked_size {
        headers.insert(HEADER_LINKED_SIZE, header_value(&linked_size.to_string()));
    }
}

/// Strong ETag for a served file: derived from the immutable commit and
/// path, never from upstream's weak tags.
fn strong_etag(commit: &str, path: &str) -> String {
    let path_digest = Sha256::digest(path.as_bytes());
    format!("\"{commit}-{}\"", hex::encode(&path_digest[..4]))
}

fn header_value(value: &str) -> HeaderValue {
    HeaderValue::from_str(value).unwrap_or_else(|_| HeaderValue::from_static("invalid"))
}

// ---------------------------------------------------------------------------
// Block streaming
// ---------------------------------------------------------------------------

/// Walk the blocks intersecting `range` in order: fill missing ones through
/// the single-flight coordinator, then stream each block's slice from disk.
async fn stream_blocks(
    state: &Arc<AppState>,
    handle: &CacheHandle,
    fetch_url: &str,
    range: ByteRange,
    upstream_headers: &HeaderMap,
    tx: &mpsc::Sender<Result<Bytes, ProxyError>>,
) -> Result<(), ProxyError> {
    let file = handle.file();
    let Some((first, last)) = file.blocks_for_range(range.off, range.len) else {
        return Ok(());
    };
    let was_complete = file.is_complete();
    let mut finalized = false;

    for index in first..=last {
        let metrics = &state.metrics.metrics;
        if file.has_block(index) {
            metrics
                .block_reads_total
                .get_or_create(&CacheLabels {
                    outcome: CacheOutcome::Hit,
                })
                .inc();
        } else {
            metrics
                .block_reads_total
                .get_or_create(&CacheLabels {
                    outcome: CacheOutcome::Miss,
                })
                .inc();
            let upstream = Arc::clone(&state.upstream);
            let url = fetch_url.to_string();
            let headers = upstream_headers.clone();
            let fetcher = move |off: u64, len: u64| {
                let upstream = Arc::clone(&upstream);
                let url = url.clone();
                let headers = headers.clone();
                async move { upstream.fetch_block(&url, off, len, &headers).await }
            };
            match state.chunk_cache.ensure_block(handle, index, fetcher).await {
                Ok(()) => {
                    metrics.blocks_written_total.inc();
                }
                Err(ProxyError::DiskFull) => {
                    // Out of space: stop teeing and serve the rest of the
                    // range straight from upstream.
                    warn!(key = %handle.key(), "disk full mid-stream, degrading to pass-through");
                    let block_start = u64::from(index) * file.block_size();
                    let rest_off = range.off.max(block_start);
                    let rest = ByteRange {
                        off: rest_off,
                        len: range.end() - rest_off,
                        partial: range.partial,
                    };
                    return stream_passthrough(state, fetch_url, rest, upstream_headers, tx).await;
                }
                Err(err) => return Err(err),
            }
        }

        // The request that fills the last missing block verifies the digest
        // before its bytes reach the client.
        if !was_complete && !finalized && file.is_complete() {
            finalized = true;
            if let Err(err) = file.finalize() {
                warn!(key = %handle.key(), error = %err, "finalize failed, dropping entry");
                state.chunk_cache.invalidate(handle.key());
                return Err(err);
            }
        }

        let block_start = u64::from(index) * file.block_size();
        let block_end = block_start + file.block_len(index);
        let read_off = range.off.max(block_start);
        let read_len = range.end().min(block_end) - read_off;
        let bytes = file.read_range(read_off, read_len)?;
        state
            .metrics
            .metrics
            .bytes_served_total
            .inc_by(bytes.len() as u64);
        if tx.send(Ok(bytes)).await.is_err() {
            // Client went away; block fetches already in flight finish on
            // their own.
            return Ok(());
        }
    }
    Ok(())
}

/// Caching disabled: stream the upstream body straight through.
async fn stream_passthrough(
    state: &Arc<AppState>,
    fetch_url: &str,
    range: ByteRange,
    upstream_headers: &HeaderMap,
    tx: &mpsc::Sender<Result<Bytes, ProxyError>>,
) -> Result<(), ProxyError> {
    state
        .metrics
        .metrics
        .block_reads_total
        .get_or_create(&CacheLabels {
            outcome: CacheOutcome::Bypass,
        })
        .inc();
    let mut stream = state
        .upstream
        .get_range(fetch_url, range.off, range.len, upstream_headers)
        .await?;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        state
            .metrics
            .metrics
            .bytes_served_total
            .inc_by(chunk.len() as u64);
        if tx.send(Ok(chunk)).await.is_err() {
            return Ok(());
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Mirrors directory
// ---------------------------------------------------------------------------

/// Serve the file verbatim from the pre-cloned mirrors directory when one is
/// configured and holds it.
async fn try_serve_mirror(
    state: &Arc<AppState>,
    request: &FileRequest,
) -> Result<Option<Response>, ProxyError> {
    let Some(mirrors_path) = &state.config.storage.mirrors_path else {
        return Ok(None);
    };
    let path = mirrors_path
        .join(request.repo_type.plural())
        .join(&request.org)
        .join(&request.name)
        .join(&request.path);
    let metadata = match tokio::fs::metadata(&path).await {
        Ok(metadata) if metadata.is_file() => metadata,
        _ => return Ok(None),
    };
    let size = metadata.len();
    debug!(path = %path.display(), size, "serving from mirrors directory");

    let range_header = request
        .headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let range = if size == 0 {
        ByteRange::whole(0)
    } else {
        parse_range(range_header.as_deref(), size)?
    };

    let status = if range.partial {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };

    let mut response = if request.method == Method::HEAD || size == 0 {
        Response::new(Body::empty())
    } else {
        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(ProxyError::from_io)?;
        file.seek(std::io::SeekFrom::Start(range.off))
            .await
            .map_err(ProxyError::from_io)?;
        Response::new(Body::from_stream(ReaderStream::new(file.take(range.len))))
    };
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, header_value(&range.len.to_string()));
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if range.partial {
        headers.insert(
            header::CONTENT_RANGE,
            header_value(&range.content_range(size)),
        );
    }
    Ok(Some(response))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Reject path traversal and control characters in client-supplied paths.
pub fn validate_path(path: &str) -> Result<(), ProxyError> {
    if path.is_empty() {
        return Err(ProxyError::BadRequest("empty file path".into()));
    }
    if path.contains('\0') || path.contains("..") || path.starts_with('/') {
        return Err(ProxyError::BadRequest(format!("invalid file path: {path}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_path_accepts_nested() {
        assert!(validate_path("config.json").is_ok());
        assert!(validate_path("sub/dir/weights.safetensors").is_ok());
    }

    #[test]
    fn validate_path_rejects_traversal() {
        assert!(validate_path("../../etc/passwd").is_err());
        assert!(validate_path("a/../b").is_err());
        assert!(validate_path("/absolute").is_err());
        assert!(validate_path("nul\0byte").is_err());
        assert!(validate_path("").is_err());
    }

    #[test]
    fn strong_etag_is_stable_and_path_sensitive() {
        let a = strong_etag("abc123", "config.json");
        let b = strong_etag("abc123", "config.json");
        let c = strong_etag("abc123", "other.json");
        let d = strong_etag("def456", "config.json");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert!(a.starts_with("\"abc123-"));
        assert!(a.ends_with('"'));
    }

    #[test]
    fn pseudo_commit_is_40_hex() {
        let commit = pseudo_commit_for("/repos/ab/cd/hash/file?sig=1");
        assert_eq!(commit.len(), 40);
        assert!(is_commit_hash(&commit));
        assert_eq!(commit, pseudo_commit_for("/repos/ab/cd/hash/file?sig=1"));
        assert_ne!(commit, pseudo_commit_for("/repos/ab/cd/hash/other"));
    }
}
