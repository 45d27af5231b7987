//! HTTP client for the upstream hub and its LFS CDN.
//!
//! Redirects are followed manually (bounded) so the CDN location can be
//! captured; range GETs tolerate upstreams that answer `200 OK` to a ranged
//! request by slicing client-side; transient failures and 5xx are retried
//! with exponential backoff and jitter. Every entry point checks the offline
//! guard before leaving the process. Outbound proxies (`HTTP_PROXY` /
//! `HTTPS_PROXY`) are honoured by the underlying client.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, RANGE, USER_AGENT};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::config::{MirrorConfig, RetryConfig, UpstreamConfig};
use crate::error::ProxyError;
use crate::metrics::Metrics;
use crate::offline::OfflineGuard;

/// Upstream commit hash header.
pub const HEADER_REPO_COMMIT: &str = "x-repo-commit";
/// ETag of the linked (LFS) artifact.
pub const HEADER_LINKED_ETAG: &str = "x-linked-etag";
/// Size of the linked (LFS) artifact.
pub const HEADER_LINKED_SIZE: &str = "x-linked-size";

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ProxyError>> + Send>>;

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// Outcome of a file HEAD, after following redirects.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileStat {
    /// Authoritative byte size of the file.
    pub size: u64,
    /// Upstream ETag (of the final response, or the linked artifact).
    pub etag: Option<String>,
    /// Commit hash reported by the hub.
    pub commit: Option<String>,
    /// SHA-256 content digest (64 hex chars) when upstream exposed one.
    pub digest: Option<String>,
    pub linked_etag: Option<String>,
    pub linked_size: Option<u64>,
    /// URL the bytes actually live at (the CDN after an LFS redirect,
    /// otherwise the resolve URL itself).
    pub fetch_url: String,
    /// First redirect target as upstream sent it, present for LFS files.
    pub redirect_location: Option<String>,
}

impl FileStat {
    pub fn digest_bytes(&self) -> Option<[u8; 32]> {
        let hex_digest = self.digest.as_deref()?;
        let raw = hex::decode(hex_digest).ok()?;
        raw.try_into().ok()
    }
}

/// Outcome of a metadata GET.
#[derive(Debug, Clone)]
pub struct MetaResponse {
    pub status: u16,
    pub bytes: Bytes,
    pub etag: Option<String>,
    pub cache_control: Option<String>,
    pub commit: Option<String>,
}

// ---------------------------------------------------------------------------
// UpstreamClient
// ---------------------------------------------------------------------------

pub struct UpstreamClient {
    http: reqwest::Client,
    hub_base: String,
    lfs_base: String,
    mirror_lfs_base: String,
    retry: RetryConfig,
    offline: Arc<OfflineGuard>,
    metrics: Arc<Metrics>,
}

impl UpstreamClient {
    pub fn new(
        upstream: &UpstreamConfig,
        mirror: &MirrorConfig,
        retry: &RetryConfig,
        offline: Arc<OfflineGuard>,
        metrics: Arc<Metrics>,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("hubcache/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_secs(retry.timeout_secs))
            .build()
            .context("failed to build reqwest client")?;
        Ok(Self {
            http,
            hub_base: upstream.hub_base(),
            lfs_base: upstream.lfs_base(),
            mirror_lfs_base: mirror.lfs_base(),
            retry: retry.clone(),
            offline,
            metrics,
        })
    }

    pub fn hub_base(&self) -> &str {
        &self.hub_base
    }

    /// Upstream URL of a `resolve` path. Models omit the type prefix.
    pub fn resolve_url(
        &self,
        repo_type: crate::cache::RepoType,
        org: &str,
        name: &str,
        revision: &str,
        path: &str,
    ) -> String {
        format!(
            "{}/{}{}/{}/resolve/{}/{}",
            self.hub_base,
            repo_type.url_prefix(),
            org,
            name,
            revision,
            path
        )
    }

    /// Upstream URL of a `raw` path (repository blob; an LFS pointer for
    /// large files).
    pub fn raw_url(
        &self,
        repo_type: crate::cache::RepoType,
        org: &str,
        name: &str,
        revision: &str,
        path: &str,
    ) -> String {
        format!(
            "{}/{}{}/{}/raw/{}/{}",
            self.hub_base,
            repo_type.url_prefix(),
            org,
            name,
            revision,
            path
        )
    }

    /// Upstream CDN URL for an opaque LFS path (path + query, no host).
    pub fn lfs_url(&self, tail: &str) -> String {
        format!("{}{}", self.lfs_base, tail)
    }

    /// Rewrite an upstream CDN location so the client comes back to this
    /// mirror for the bytes.
    pub fn rewrite_lfs_location(&self, location: &str) -> String {
        format!("{}{}", self.mirror_lfs_base, url_tail(location))
    }

    // -- HEAD ---------------------------------------------------------------

    /// HEAD a file URL, following up to the configured number of redirects,
    /// and distil the answers into a [`FileStat`].
    pub async fn head_file(
        &self,
        url: &str,
        inbound: &HeaderMap,
    ) -> Result<FileStat, ProxyError> {
        self.offline.ensure_online()?;
        let forward = forward_headers(inbound);

        let mut stat = FileStat::default();
        let mut current = url.to_string();

        for hop in 0..=self.retry.max_redirects {
            let response = self
                .with_retries("head", || async {
                    let response = self
                        .http
                        .head(&current)
                        .headers(forward.clone())
                        .send()
                        .await
                        .map_err(ProxyError::from_reqwest)?;
                    if response.status().is_server_error() {
                        return Err(ProxyError::UpstreamHttp(response.status().as_u16()));
                    }
                    Ok(response)
                })
                .await?;

            merge_stat_headers(&mut stat, response.headers());
            let status = response.status();

            if status.is_redirection() {
                let location = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| {
                        ProxyError::UpstreamNetwork("redirect without Location".into())
                    })?;
                if stat.redirect_location.is_none() {
                    stat.redirect_location = Some(location.to_string());
                }
                current = absolutize(location, &current);
                trace!(hop, location = %current, "following upstream redirect");
                continue;
            }

            if status.is_success() {
                if let Some(length) = content_length(response.headers()) {
                    stat.size = length;
                }
                if stat.size == 0 {
                    if let Some(linked) = stat.linked_size {
                        stat.size = linked;
                    }
                }
                stat.fetch_url = current.clone();
                debug!(url, size = stat.size, commit = ?stat.commit, "resolved file head");
                return Ok(stat);
            }

            return Err(ProxyError::UpstreamHttp(status.as_u16()));
        }

        Err(ProxyError::UpstreamNetwork(format!(
            "redirect limit ({}) exceeded for {url}",
            self.retry.max_redirects
        )))
    }

    // -- ranged GET ---------------------------------------------------------

    /// GET `[off, off + len)` of `url` as a byte stream.
    ///
    /// A `206` body streams through unchanged; a `200` body is treated as the
    /// whole file and sliced; a `416` signals that upstream shrank the file.
    pub async fn get_range(
        &self,
        url: &str,
        off: u64,
        len: u64,
        inbound: &HeaderMap,
    ) -> Result<ByteStream, ProxyError> {
        if len == 0 {
            return Ok(Box::pin(futures::stream::empty()));
        }
        let response = self
            .with_retries("get range", || self.request_range(url, off, len, inbound))
            .await?;
        self.range_body(response, off, len, url)
    }

    /// One attempt at establishing a ranged GET; retry policy lives in the
    /// callers.
    async fn request_range(
        &self,
        url: &str,
        off: u64,
        len: u64,
        inbound: &HeaderMap,
    ) -> Result<reqwest::Response, ProxyError> {
        self.offline.ensure_online()?;
        let mut forward = forward_headers(inbound);
        let range_value = format!("bytes={off}-{}", off + len - 1);
        forward.insert(RANGE, HeaderValue::from_str(&range_value).unwrap());

        let response = self
            .http
            .get(url)
            .headers(forward)
            .send()
            .await
            .map_err(ProxyError::from_reqwest)?;
        let status = response.status();
        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            return Err(ProxyError::SizeMismatch);
        }
        if status.is_server_error() {
            return Err(ProxyError::UpstreamHttp(status.as_u16()));
        }
        if status != StatusCode::PARTIAL_CONTENT && status != StatusCode::OK {
            return Err(ProxyError::UpstreamHttp(status.as_u16()));
        }
        Ok(response)
    }

    fn range_body(
        &self,
        response: reqwest::Response,
        off: u64,
        len: u64,
        url: &str,
    ) -> Result<ByteStream, ProxyError> {
        let status = response.status();
        let body_length = content_length(response.headers());
        let stream = response
            .bytes_stream()
            .map(|item| item.map_err(ProxyError::from_reqwest));

        if status == StatusCode::PARTIAL_CONTENT {
            if let Some(length) = body_length {
                if length != len {
                    return Err(ProxyError::UpstreamNetwork(format!(
                        "ranged response advertises {length} bytes, expected {len}"
                    )));
                }
            }
            Ok(Box::pin(stream))
        } else {
            // Upstream ignored the Range header: slice the whole-file body.
            warn!(url, "upstream ignored Range header, slicing 200 response");
            Ok(Box::pin(slice_stream(stream, off, len)))
        }
    }

    /// Fetch one block into a single buffer of exactly `len` bytes. The
    /// whole transfer retries on transient failure since nothing has been
    /// persisted yet.
    pub async fn fetch_block(
        &self,
        url: &str,
        off: u64,
        len: u64,
        inbound: &HeaderMap,
    ) -> Result<Bytes, ProxyError> {
        if len == 0 {
            return Ok(Bytes::new());
        }
        self.with_retries("fetch block", || async {
            let response = self.request_range(url, off, len, inbound).await?;
            let mut stream = self.range_body(response, off, len, url)?;
            let mut buf = BytesMut::with_capacity(len as usize);
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                if buf.len() + chunk.len() > len as usize {
                    return Err(ProxyError::UpstreamNetwork(format!(
                        "block fetch overran: got more than {len} bytes"
                    )));
                }
                buf.extend_from_slice(&chunk);
            }
            if buf.len() != len as usize {
                return Err(ProxyError::UpstreamNetwork(format!(
                    "block fetch truncated: got {} of {len} bytes",
                    buf.len()
                )));
            }
            Ok(buf.freeze())
        })
        .await
    }

    // -- metadata GET -------------------------------------------------------

    /// GET a small metadata document (`/api/...`) and buffer it whole.
    pub async fn get_metadata(
        &self,
        url: &str,
        inbound: &HeaderMap,
    ) -> Result<MetaResponse, ProxyError> {
        self.offline.ensure_online()?;
        let forward = forward_headers(inbound);

        self.with_retries("get metadata", || async {
            let response = self
                .http
                .get(url)
                .headers(forward.clone())
                .send()
                .await
                .map_err(ProxyError::from_reqwest)?;
            let status = response.status();
            if status.is_server_error() {
                return Err(ProxyError::UpstreamHttp(status.as_u16()));
            }
            if !status.is_success() {
                return Err(ProxyError::UpstreamHttp(status.as_u16()));
            }

            let etag = header_string(response.headers(), "etag");
            let cache_control = header_string(response.headers(), "cache-control");
            let commit = header_string(response.headers(), HEADER_REPO_COMMIT);
            let bytes = response.bytes().await.map_err(ProxyError::from_reqwest)?;
            Ok(MetaResponse {
                status: status.as_u16(),
                bytes,
                etag,
                cache_control,
                commit,
            })
        })
        .await
    }

    /// Lightweight reachability probe for the health loop. Single attempt,
    /// no retries.
    pub async fn probe(&self) -> bool {
        if self.offline.is_offline() {
            return false;
        }
        match self.http.head(&self.hub_base).send().await {
            Ok(response) => {
                response.status().is_success() || response.status().is_redirection()
            }
            Err(_) => false,
        }
    }

    // -- retry loop ---------------------------------------------------------

    async fn with_retries<T, F, Fut>(&self, op: &str, mut attempt_fn: F) -> Result<T, ProxyError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProxyError>>,
    {
        let mut delay_ms = self.retry.base_delay_ms;
        let mut attempt = 1u32;
        loop {
            self.metrics.upstream_requests_total.inc();
            match attempt_fn().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.retry.max_attempts => {
                    self.metrics.upstream_retries_total.inc();
                    let jitter = rand::random::<u64>() % (delay_ms / 2 + 1);
                    warn!(
                        op,
                        attempt,
                        error = %err,
                        backoff_ms = delay_ms + jitter,
                        "transient upstream failure, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = delay_ms.saturating_mul(2);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Header plumbing
// ---------------------------------------------------------------------------

/// Headers forwarded verbatim to upstream. Everything else — notably Host
/// and the hop-by-hop set — is dropped.
pub fn forward_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for name in [AUTHORIZATION, USER_AGENT, ACCEPT] {
        if let Some(value) = inbound.get(&name) {
            out.insert(name, value.clone());
        }
    }
    out
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    header_string(headers, "content-length").and_then(|v| v.parse().ok())
}

fn merge_stat_headers(stat: &mut FileStat, headers: &HeaderMap) {
    if stat.commit.is_none() {
        stat.commit = header_string(headers, HEADER_REPO_COMMIT);
    }
    if stat.linked_etag.is_none() {
        stat.linked_etag = header_string(headers, HEADER_LINKED_ETAG);
    }
    if stat.linked_size.is_none() {
        stat.linked_size = header_string(headers, HEADER_LINKED_SIZE).and_then(|v| v.parse().ok());
    }
    if let Some(etag) = header_string(headers, "etag") {
        stat.etag = Some(etag);
    }
    let digest_source = stat.linked_etag.as_deref().or(stat.etag.as_deref());
    if stat.digest.is_none() {
        stat.digest = digest_source.and_then(parse_sha256_etag);
    }
}

/// Extract a SHA-256 hex digest from an ETag-shaped value
/// (`"<64 hex>"`, `W/"..."`, or `sha256:<hex>`).
pub fn parse_sha256_etag(etag: &str) -> Option<String> {
    let trimmed = etag
        .trim()
        .trim_start_matches("W/")
        .trim_matches('"')
        .trim_start_matches("sha256:");
    if trimmed.len() == 64 && trimmed.bytes().all(|b| b.is_ascii_hexdigit()) {
        Some(trimmed.to_ascii_lowercase())
    } else {
        None
    }
}

/// Path + query of a URL, used when rehoming a location onto this mirror.
pub fn url_tail(url: &str) -> &str {
    let without_scheme = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"));
    match without_scheme {
        Some(rest) => match rest.find('/') {
            Some(index) => &rest[index..],
            None => "/",
        },
        // Already relative.
        None => url,
    }
}

/// Resolve a possibly-relative redirect location against the request URL.
fn absolutize(location: &str, base: &str) -> String {
    if location.starts_with("http://") || location.starts_with("https://") {
        return location.to_string();
    }
    // Scheme + host of the base, then the absolute path.
    let (scheme_host, _) = match base.find("://").map(|i| i + 3) {
        Some(host_start) => match base[host_start..].find('/') {
            Some(path_start) => base.split_at(host_start + path_start),
            None => (base, ""),
        },
        None => (base, ""),
    };
    if location.starts_with('/') {
        format!("{scheme_host}{location}")
    } else {
        format!("{scheme_host}/{location}")
    }
}

// ---------------------------------------------------------------------------
// Stream slicing
// ---------------------------------------------------------------------------

/// Drop `skip` bytes from the front of `stream`, then pass through exactly
/// `take` bytes and end.
pub fn slice_stream<S>(stream: S, skip: u64, take: u64) -> impl Stream<Item = Result<Bytes, ProxyError>>
where
    S: Stream<Item = Result<Bytes, ProxyError>>,
{
    stream
        .scan((skip, take), |(skip, take), item| {
            let step = match item {
                Err(err) => Some(Some(Err(err))),
                Ok(mut chunk) => {
                    if *take == 0 {
                        None
                    } else if (*skip as usize) >= chunk.len() {
                        *skip -= chunk.len() as u64;
                        Some(None)
                    } else {
                        let mut body = chunk.split_off(*skip as usize);
                        *skip = 0;
                        if (body.len() as u64) > *take {
                            body.truncate(*take as usize);
                        }
                        *take -= body.len() as u64;
                        Some(Some(Ok(body)))
                    }
                }
            };
            futures::future::ready(step)
        })
        .filter_map(futures::future::ready)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn collect(chunks: Vec<&'static [u8]>, skip: u64, take: u64) -> Vec<u8> {
        let input = stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok::<_, ProxyError>(Bytes::from_static(c))),
        );
        let sliced = slice_stream(input, skip, take);
        futures::executor::block_on(async {
            let parts: Vec<_> = sliced.collect().await;
            parts
                .into_iter()
                .flat_map(|r| r.unwrap().to_vec())
                .collect()
        })
    }

    #[test]
    fn slice_stream_passes_through_aligned() {
        assert_eq!(collect(vec![b"hello", b"world"], 0, 10), b"helloworld");
    }

    #[test]
    fn slice_stream_skips_and_truncates() {
        assert_eq!(collect(vec![b"hello", b"world"], 2, 5), b"llowo");
        assert_eq!(collect(vec![b"hello", b"world"], 5, 5), b"world");
        assert_eq!(collect(vec![b"hello", b"world"], 9, 1), b"d");
    }

    #[test]
    fn slice_stream_skip_spans_chunks() {
        assert_eq!(collect(vec![b"ab", b"cd", b"ef"], 3, 2), b"de");
    }

    #[test]
    fn slice_stream_ends_when_satisfied() {
        // A shorter-than-promised upstream just ends the stream early.
        assert_eq!(collect(vec![b"abc"], 0, 100), b"abc");
    }

    #[test]
    fn parse_sha256_etag_variants() {
        let digest = "a".repeat(64);
        assert_eq!(
            parse_sha256_etag(&format!("\"{digest}\"")).as_deref(),
            Some(digest.as_str())
        );
        assert_eq!(
            parse_sha256_etag(&format!("W/\"{digest}\"")).as_deref(),
            Some(digest.as_str())
        );
        assert_eq!(
            parse_sha256_etag(&format!("sha256:{digest}")).as_deref(),
            Some(digest.as_str())
        );
        // Short weak etags are not digests.
        assert_eq!(parse_sha256_etag("\"abc123-10\""), None);
    }

    #[test]
    fn url_tail_strips_scheme_and_host() {
        assert_eq!(
            url_tail("https://cdn.example.com/repos/ab/cd/x?sig=1"),
            "/repos/ab/cd/x?sig=1"
        );
        assert_eq!(url_tail("https://cdn.example.com"), "/");
        assert_eq!(url_tail("/already/relative"), "/already/relative");
    }

    #[test]
    fn absolutize_handles_relative_locations() {
        assert_eq!(
            absolutize("/x/y", "https://hub.example.com/a/b"),
            "https://hub.example.com/x/y"
        );
        assert_eq!(
            absolutize("https://cdn.example.com/z", "https://hub.example.com/a"),
            "https://cdn.example.com/z"
        );
    }

    #[test]
    fn forward_headers_keeps_allowlist_only() {
        let mut inbound = HeaderMap::new();
        inbound.insert(AUTHORIZATION, HeaderValue::from_static("Bearer tok"));
        inbound.insert(USER_AGENT, HeaderValue::from_static("test-agent"));
        inbound.insert(ACCEPT, HeaderValue::from_static("*/*"));
        inbound.insert("host", HeaderValue::from_static("mirror.local"));
        inbound.insert("connection", HeaderValue::from_static("keep-alive"));
        inbound.insert("range", HeaderValue::from_static("bytes=0-1"));

        let out = forward_headers(&inbound);
        assert_eq!(out.len(), 3);
        assert!(out.contains_key(AUTHORIZATION));
        assert!(out.contains_key(USER_AGENT));
        assert!(out.contains_key(ACCEPT));
        assert!(!out.contains_key("host"));
        assert!(!out.contains_key("connection"));
        assert!(!out.contains_key("range"));
    }

    #[test]
    fn merge_stat_prefers_first_commit_and_latest_etag() {
        let mut stat = FileStat::default();
        let mut hop1 = HeaderMap::new();
        hop1.insert(HEADER_REPO_COMMIT, HeaderValue::from_static("commit-a"));
        hop1.insert("etag", HeaderValue::from_static("\"weak-1\""));
        merge_stat_headers(&mut stat, &hop1);

        let digest = "b".repeat(64);
        let mut hop2 = HeaderMap::new();
        hop2.insert(
            "etag",
            HeaderValue::from_str(&format!("\"{digest}\"")).unwrap(),
        );
        merge_stat_headers(&mut stat, &hop2);

        assert_eq!(stat.commit.as_deref(), Some("commit-a"));
        assert_eq!(stat.etag.as_deref(), Some(format!("\"{digest}\"").as_str()));
        assert_eq!(stat.digest.as_deref(), Some(digest.as_str()));
    }

    #[test]
    fn file_stat_digest_round_trip() {
        let stat = FileStat {
            digest: Some("ab".repeat(32)),
            ..FileStat::default()
        };
        let bytes = stat.digest_bytes().unwrap();
        assert_eq!(bytes, [0xabu8; 32]);
        let json = serde_json::to_string(&stat).unwrap();
        let back: FileStat = serde_json::from_str(&json).unwrap();
        assert_eq!(back.digest, stat.digest);
    }
}
