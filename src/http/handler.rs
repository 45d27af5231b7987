//! Main axum router and HTTP request handlers for the mirror.
//!
//! Routes:
//! - `GET  /api/{type}/{org}/{name}`                    - repo metadata (default branch)
//! - `GET  /api/{type}/{org}/{name}/revision/{rev}`     - repo metadata at a revision
//! - `GET  /api/{type}/{org}/{name}/tree/{rev}/{path}`  - tree listing
//! - `GET/HEAD /{org}/{name}/resolve/{rev}/{path}`      - file content (models)
//! - `GET/HEAD /{type}/{org}/{name}/resolve/{rev}/{path}` - file content (typed)
//! - `GET/HEAD /{org}/{name}/raw/{rev}/{path}`          - raw blob
//! - `GET/HEAD /{type}/{org}/{name}/raw/{rev}/{path}`   - raw blob (typed)
//! - `GET/HEAD /repos/{d1}/{d2}/{hash_repo}/{path}`     - LFS CDN objects
//! - `GET  /healthz`                                    - health check
//! - `GET  /metrics`                                    - Prometheus metrics
//!
//! Anything else is a 404 with a JSON error body.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use serde_json::Value;
use tracing::instrument;

use crate::cache::RepoType;
use crate::error::ProxyError;
use crate::http::file_handler::{serve_cdn, serve_file, FetchKind, FileRequest};
use crate::meta_cache::{FetchedMeta, MetaKey, MetaKind};
use crate::metrics::{Endpoint, RequestLabels};
use crate::upstream::HEADER_REPO_COMMIT;
use crate::AppState;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Hub API metadata
        .route("/api/{repo_type}/{org}/{name}", get(handle_repo_meta_default))
        .route(
            "/api/{repo_type}/{org}/{name}/revision/{rev}",
            get(handle_repo_meta),
        )
        .route(
            "/api/{repo_type}/{org}/{name}/tree/{rev}/{*path}",
            get(handle_tree),
        )
        // File content
        .route(
            "/{org}/{name}/resolve/{rev}/{*path}",
            get(handle_resolve_model).head(handle_resolve_model),
        )
        .route(
            "/{repo_type}/{org}/{name}/resolve/{rev}/{*path}",
            get(handle_resolve_typed).head(handle_resolve_typed),
        )
        .route(
            "/{org}/{name}/raw/{rev}/{*path}",
            get(handle_raw_model).head(handle_raw_model),
        )
        .route(
            "/{repo_type}/{org}/{name}/raw/{rev}/{*path}",
            get(handle_raw_typed).head(handle_raw_typed),
        )
        // LFS CDN objects
        .route(
            "/repos/{d1}/{d2}/{hash_repo}/{*path}",
            get(handle_lfs).head(handle_lfs),
        )
        // Operational endpoints
        .route("/healthz", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .fallback(handle_unmatched)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Metadata handlers
// ---------------------------------------------------------------------------

async fn handle_repo_meta_default(
    State(state): State<Arc<AppState>>,
    Path((repo_type, org, name)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<Response, ProxyError> {
    serve_repo_meta(&state, &repo_type, &org, &name, "main", &headers).await
}

async fn handle_repo_meta(
    State(state): State<Arc<AppState>>,
    Path((repo_type, org, name, rev)): Path<(String, String, String, String)>,
    headers: HeaderMap,
) -> Result<Response, ProxyError> {
    serve_repo_meta(&state, &repo_type, &org, &name, &rev, &headers).await
}

/// `GET /api/{type}/{org}/{name}[/revision/{rev}]`
///
/// Proxies the hub's repo-info JSON through the metadata cache; the resolved
/// commit hash is surfaced in `X-Repo-Commit`.
#[instrument(skip(state, headers), fields(%org, %name, %rev))]
async fn serve_repo_meta(
    state: &Arc<AppState>,
    repo_type: &str,
    org: &str,
    name: &str,
    rev: &str,
    headers: &HeaderMap,
) -> Result<Response, ProxyError> {
    let started = Instant::now();
    let metrics = &state.metrics.metrics;
    metrics
        .requests_total
        .get_or_create(&RequestLabels {
            endpoint: Endpoint::Meta,
        })
        .inc();

    let repo_type = RepoType::from_plural(repo_type).ok_or(ProxyError::NotFound)?;
    let slug = format!("{org}/{name}");
    if !state.policy.proxy_allowed(&slug) {
        return Err(ProxyError::ProxyDenied(slug));
    }

    let meta_key = MetaKey::new(MetaKind::ApiRepoInfo, repo_type, org, name, rev);
    let url = format!(
        "{}/api/{}/{}/{}/revision/{}",
        state.upstream.hub_base(),
        repo_type.plural(),
        org,
        name,
        rev
    );
    let entry = fetch_meta(state, &meta_key, state.config.ttl.repo_info_secs, url, headers).await?;

    let commit = serde_json::from_slice::<Value>(&entry.bytes)
        .ok()
        .and_then(|value| value.get("sha").and_then(Value::as_str).map(String::from));

    let mut response = Response::new(Body::from(entry.bytes));
    let response_headers = response.headers_mut();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    if let Some(etag) = entry.etag.as_deref().and_then(|e| HeaderValue::from_str(e).ok()) {
        response_headers.insert(header::ETAG, etag);
    }
    if let Some(commit) = commit.as_deref().and_then(|c| HeaderValue::from_str(c).ok()) {
        response_headers.insert(HEADER_REPO_COMMIT, commit);
    }

    metrics
        .request_duration_seconds
        .get_or_create(&RequestLabels {
            endpoint: Endpoint::Meta,
        })
        .observe(started.elapsed().as_secs_f64());
    Ok(response)
}

/// `GET /api/{type}/{org}/{name}/tree/{rev}/{path}`
#[instrument(skip(state, headers), fields(%org, %name, %rev, %path))]
async fn serve_tree(
    state: &Arc<AppState>,
    repo_type: &str,
    org: &str,
    name: &str,
    rev: &str,
    path: &str,
    headers: &HeaderMap,
) -> Result<Response, ProxyError> {
    state
        .metrics
        .metrics
        .requests_total
        .get_or_create(&RequestLabels {
            endpoint: Endpoint::Meta,
        })
        .inc();

    let repo_type = RepoType::from_plural(repo_type).ok_or(ProxyError::NotFound)?;
    let slug = format!("{org}/{name}");
    if !state.policy.proxy_allowed(&slug) {
        return Err(ProxyError::ProxyDenied(slug));
    }

    let meta_key = MetaKey::new(
        MetaKind::TreeListing,
        repo_type,
        org,
        name,
        format!("{rev}:{path}"),
    );
    let url = format!(
        "{}/api/{}/{}/{}/tree/{}/{}",
        state.upstream.hub_base(),
        repo_type.plural(),
        org,
        name,
        rev,
        path
    );
    let entry = fetch_meta(state, &meta_key, state.config.ttl.tree_secs, url, headers).await?;

    let mut response = Response::new(Body::from(entry.bytes));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    Ok(response)
}

async fn handle_tree(
    State(state): State<Arc<AppState>>,
    Path((repo_type, org, name, rev, path)): Path<(String, String, String, String, String)>,
    headers: HeaderMap,
) -> Result<Response, ProxyError> {
    serve_tree(&state, &repo_type, &org, &name, &rev, &path, &headers).await
}

/// Shared metadata fetch: hub GET through the metadata cache.
async fn fetch_meta(
    state: &Arc<AppState>,
    meta_key: &MetaKey,
    ttl: u64,
    url: String,
    headers: &HeaderMap,
) -> Result<crate::meta_cache::MetaEntry, ProxyError> {
    let upstream = Arc::clone(&state.upstream);
    let headers = headers.clone();
    let entry = state
        .meta_cache
        .get_or_fetch(meta_key, ttl, || async move {
            let response = upstream.get_metadata(&url, &headers).await?;
            Ok(FetchedMeta {
                bytes: response.bytes,
                etag: response.etag,
            })
        })
        .await?;
    let metrics = &state.metrics.metrics;
    if entry.stale {
        metrics.meta_stale_served.inc();
    }
    Ok(entry)
}

// ---------------------------------------------------------------------------
// File handlers
// ---------------------------------------------------------------------------

async fn handle_resolve_model(
    State(state): State<Arc<AppState>>,
    Path((org, name, rev, path)): Path<(String, String, String, String)>,
    method: Method,
    headers: HeaderMap,
) -> Result<Response, ProxyError> {
    dispatch_file(&state, RepoType::Model, org, name, rev, path, FetchKind::Resolve, method, headers)
        .await
}

async fn handle_resolve_typed(
    State(state): State<Arc<AppState>>,
    Path((repo_type, org, name, rev, path)): Path<(String, String, String, String, String)>,
    method: Method,
    headers: HeaderMap,
) -> Result<Response, ProxyError> {
    let repo_type = RepoType::from_plural(&repo_type).ok_or(ProxyError::NotFound)?;
    dispatch_file(&state, repo_type, org, name, rev, path, FetchKind::Resolve, method, headers)
        .await
}

async fn handle_raw_model(
    State(state): State<Arc<AppState>>,
    Path((org, name, rev, path)): Path<(String, String, String, String)>,
    method: Method,
    headers: HeaderMap,
) -> Result<Response, ProxyError> {
    dispatch_file(&state, RepoType::Model, org, name, rev, path, FetchKind::Raw, method, headers)
        .await
}

async fn handle_raw_typed(
    State(state): State<Arc<AppState>>,
    Path((repo_type, org, name, rev, path)): Path<(String, String, String, String, String)>,
    method: Method,
    headers: HeaderMap,
) -> Result<Response, ProxyError> {
    let repo_type = RepoType::from_plural(&repo_type).ok_or(ProxyError::NotFound)?;
    dispatch_file(&state, repo_type, org, name, rev, path, FetchKind::Raw, method, headers).await
}

#[allow(clippy::too_many_arguments)]
async fn dispatch_file(
    state: &Arc<AppState>,
    repo_type: RepoType,
    org: String,
    name: String,
    revision: String,
    path: String,
    kind: FetchKind,
    method: Method,
    headers: HeaderMap,
) -> Result<Response, ProxyError> {
    let started = Instant::now();
    let metrics = &state.metrics.metrics;
    metrics
        .requests_total
        .get_or_create(&RequestLabels {
            endpoint: Endpoint::File,
        })
        .inc();

    let response = serve_file(
        state,
        FileRequest {
            repo_type,
            org,
            name,
            revision,
            path,
            kind,
            method,
            headers,
        },
    )
    .await?;

    metrics
        .request_duration_seconds
        .get_or_create(&RequestLabels {
            endpoint: Endpoint::File,
        })
        .observe(started.elapsed().as_secs_f64());
    Ok(response)
}

/// `GET/HEAD /repos/{d1}/{d2}/{hash_repo}/{path}` — opaque CDN objects.
async fn handle_lfs(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    method: Method,
    headers: HeaderMap,
) -> Result<Response, ProxyError> {
    state
        .metrics
        .metrics
        .requests_total
        .get_or_create(&RequestLabels {
            endpoint: Endpoint::Lfs,
        })
        .inc();

    let tail = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());
    serve_cdn(&state, tail, method, headers).await
}

// ---------------------------------------------------------------------------
// Operational handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    offline: bool,
    upstream_reachable: bool,
}

/// `GET /healthz`. 200 as long as the process serves; `upstream_reachable`
/// reflects the last background probe.
async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let offline = state.offline.is_offline();
    let upstream_reachable =
        !offline && state.upstream_reachable.load(std::sync::atomic::Ordering::Relaxed);
    let status = if offline || upstream_reachable {
        "ok"
    } else {
        "degraded"
    };
    Json(HealthResponse {
        status,
        offline,
        upstream_reachable,
    })
}

/// `GET /metrics` — Prometheus metrics collected by the mirror.
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, ProxyError> {
    let mut buf = String::new();
    prometheus_client::encoding::text::encode(&mut buf, &state.metrics.registry)
        .map_err(|e| ProxyError::Unexpected(anyhow::anyhow!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

/// Anything the route table does not recognise.
async fn handle_unmatched(State(state): State<Arc<AppState>>) -> Response {
    state
        .metrics
        .metrics
        .requests_total
        .get_or_create(&RequestLabels {
            endpoint: Endpoint::Other,
        })
        .inc();
    ProxyError::NotFound.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ChunkCache;
    use crate::config::{Config, RuleConfig};
    use crate::meta_cache::MetaCache;
    use crate::metrics::MetricsRegistry;
    use crate::offline::{OfflineGuard, OfflineReason};
    use crate::policy::PolicyEngine;
    use crate::upstream::UpstreamClient;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    const COMMIT: &str = "0123456789abcdef0123456789abcdef01234567";

    /// In-process stand-in for the upstream hub.
    struct Upstream {
        body: Vec<u8>,
        gets: AtomicUsize,
    }

    async fn fake_resolve(
        State(fx): State<Arc<Upstream>>,
        method: Method,
        headers: HeaderMap,
    ) -> Response {
        if method == Method::GET {
            fx.gets.fetch_add(1, Ordering::SeqCst);
        }
        let total = fx.body.len();

        let (status, slice, content_range) = match headers
            .get(header::RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("bytes="))
            .and_then(|v| v.split_once('-'))
        {
            Some((start, end)) => {
                // The mirror always sends explicit block-aligned ranges.
                let start: usize = start.parse().unwrap_or(0);
                let end: usize = end
                    .parse::<usize>()
                    .map(|e| e.min(total - 1))
                    .unwrap_or(total - 1);
                (
                    StatusCode::PARTIAL_CONTENT,
                    fx.body[start..=end].to_vec(),
                    Some(format!("bytes {start}-{end}/{total}")),
                )
            }
            None => (StatusCode::OK, fx.body.clone(), None),
        };

        let mut response = Response::new(Body::from(slice.clone()));
        *response.status_mut() = status;
        let h = response.headers_mut();
        h.insert(
            header::CONTENT_LENGTH,
            HeaderValue::from_str(&slice.len().to_string()).unwrap(),
        );
        h.insert(HEADER_REPO_COMMIT, HeaderValue::from_static(COMMIT));
        h.insert(header::ETAG, HeaderValue::from_static("\"upstream-weak\""));
        if let Some(content_range) = content_range {
            h.insert(
                header::CONTENT_RANGE,
                HeaderValue::from_str(&content_range).unwrap(),
            );
        }
        response
    }

    async fn fake_repo_info() -> Response {
        let mut response = Response::new(Body::from(format!("{{\"sha\":\"{COMMIT}\"}}")));
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        response
    }

    async fn spawn(router: Router) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    async fn spawn_upstream(body: &[u8]) -> (std::net::SocketAddr, Arc<Upstream>) {
        let fx = Arc::new(Upstream {
            body: body.to_vec(),
            gets: AtomicUsize::new(0),
        });
        let router = Router::new()
            .route("/{org}/{name}/resolve/{rev}/{*path}", get(fake_resolve))
            .route(
                "/api/models/{org}/{name}/revision/{rev}",
                get(fake_repo_info),
            )
            .with_state(Arc::clone(&fx));
        (spawn(router).await, fx)
    }

    async fn spawn_mirror(
        upstream: std::net::SocketAddr,
        repos: &TempDir,
        proxy_rules: Vec<RuleConfig>,
    ) -> (String, Arc<AppState>) {
        let mut config = Config::default();
        config.upstream.hf_scheme = "http".into();
        config.upstream.hf_netloc = upstream.to_string();
        config.upstream.hf_lfs_netloc = upstream.to_string();
        config.storage.repos_path = repos.path().to_path_buf();
        config.storage.block_size = 4096;
        config.rules.proxy = proxy_rules;
        let config = Arc::new(config);

        let offline = Arc::new(OfflineGuard::new(false));
        let metrics = MetricsRegistry::new();
        let policy =
            Arc::new(PolicyEngine::new(&config.rules.proxy, &config.rules.cache).unwrap());
        let upstream_client = Arc::new(
            UpstreamClient::new(
                &config.upstream,
                &config.mirror,
                &config.retry,
                Arc::clone(&offline),
                Arc::clone(&metrics.metrics),
            )
            .unwrap(),
        );
        let state = Arc::new(AppState {
            chunk_cache: Arc::new(ChunkCache::new(
                config.storage.repos_path.clone(),
                config.storage.block_size,
            )),
            meta_cache: Arc::new(MetaCache::new(
                &config.storage.repos_path,
                Arc::clone(&offline),
            )),
            upstream: upstream_client,
            policy,
            offline,
            metrics,
            config,
            upstream_reachable: Arc::new(AtomicBool::new(true)),
        });
        let addr = spawn(create_router(Arc::clone(&state))).await;
        (format!("http://{addr}"), state)
    }

    #[tokio::test]
    async fn cold_small_file_populates_cache() {
        let body = b"hello cold file body".to_vec();
        let (upstream, fx) = spawn_upstream(&body).await;
        let repos = TempDir::new().unwrap();
        let (mirror, _state) = spawn_mirror(upstream, &repos, vec![]).await;

        let response = reqwest::get(format!("{mirror}/org/model/resolve/main/README.md"))
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(
            response.headers()["x-repo-commit"].to_str().unwrap(),
            COMMIT
        );
        let etag = response.headers()["etag"].to_str().unwrap().to_string();
        assert!(etag.starts_with(&format!("\"{COMMIT}-")));
        assert_eq!(response.bytes().await.unwrap().to_vec(), body);
        assert_eq!(fx.gets.load(Ordering::SeqCst), 1);

        // Idempotence: the repeat comes from disk with the same etag.
        let response = reqwest::get(format!("{mirror}/org/model/resolve/main/README.md"))
            .await
            .unwrap();
        assert_eq!(response.headers()["etag"].to_str().unwrap(), etag);
        assert_eq!(response.bytes().await.unwrap().to_vec(), body);
        assert_eq!(fx.gets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn warm_range_is_served_offline() {
        let body = b"hello world, cached once and ranged later.".to_vec();
        let (upstream, fx) = spawn_upstream(&body).await;
        let repos = TempDir::new().unwrap();
        let (mirror, state) = spawn_mirror(upstream, &repos, vec![]).await;
        let url = format!("{mirror}/org/model/resolve/main/data.bin");

        assert_eq!(
            reqwest::get(&url).await.unwrap().bytes().await.unwrap(),
            body
        );
        let gets_after_warmup = fx.gets.load(Ordering::SeqCst);

        state.offline.set_offline(OfflineReason::Runtime);
        let client = reqwest::Client::new();
        let response = client
            .get(&url)
            .header(header::RANGE, "bytes=0-4")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 206);
        assert_eq!(
            response.headers()["content-range"].to_str().unwrap(),
            format!("bytes 0-4/{}", body.len())
        );
        assert_eq!(&response.bytes().await.unwrap()[..], b"hello");
        assert_eq!(fx.gets.load(Ordering::SeqCst), gets_after_warmup);
    }

    #[tokio::test]
    async fn proxy_denied_repo_is_forbidden_without_upstream_contact() {
        let (upstream, fx) = spawn_upstream(b"secret").await;
        let repos = TempDir::new().unwrap();
        let rules = vec![RuleConfig {
            repo: "adept/*".into(),
            allow: false,
            use_regex: false,
        }];
        let (mirror, _state) = spawn_mirror(upstream, &repos, rules).await;

        let response = reqwest::get(format!(
            "{mirror}/adept/fuyu-8b/resolve/main/config.json"
        ))
        .await
        .unwrap();
        assert_eq!(response.status(), 403);
        let json: serde_json::Value = response.json().await.unwrap();
        assert_eq!(json["error"], "proxy_denied");
        assert_eq!(fx.gets.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn ranges_spanning_blocks_concatenate_to_the_whole_file() {
        // Three 4 KiB blocks plus a short tail.
        let body: Vec<u8> = (0..13_000u32).map(|i| (i % 251) as u8).collect();
        let (upstream, _fx) = spawn_upstream(&body).await;
        let repos = TempDir::new().unwrap();
        let (mirror, _state) = spawn_mirror(upstream, &repos, vec![]).await;
        let url = format!("{mirror}/org/model/resolve/main/weights.bin");

        let client = reqwest::Client::new();
        let mut reassembled = Vec::new();
        for (range, expected_len) in [
            ("bytes=0-4999", 5000usize),
            ("bytes=5000-5000", 1),
            ("bytes=5001-12000", 7000),
            ("bytes=-999", 999),
        ] {
            let response = client
                .get(&url)
                .header(header::RANGE, range)
                .send()
                .await
                .unwrap();
            assert_eq!(response.status(), 206, "range {range}");
            let chunk = response.bytes().await.unwrap();
            assert_eq!(chunk.len(), expected_len, "range {range}");
            reassembled.extend_from_slice(&chunk);
        }
        assert_eq!(reassembled, body);

        let unsatisfiable = client
            .get(&url)
            .header(header::RANGE, "bytes=999999-")
            .send()
            .await
            .unwrap();
        assert_eq!(unsatisfiable.status(), 416);
    }

    #[tokio::test]
    async fn head_reports_size_without_body() {
        let body = b"just some bytes".to_vec();
        let (upstream, fx) = spawn_upstream(&body).await;
        let repos = TempDir::new().unwrap();
        let (mirror, _state) = spawn_mirror(upstream, &repos, vec![]).await;

        let client = reqwest::Client::new();
        let response = client
            .head(format!("{mirror}/org/model/resolve/main/f.txt"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(
            response.headers()["content-length"].to_str().unwrap(),
            body.len().to_string()
        );
        assert_eq!(
            response.headers()["accept-ranges"].to_str().unwrap(),
            "bytes"
        );
        // HEAD must not populate the block cache with file bytes.
        assert_eq!(fx.gets.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn repo_metadata_round_trips_with_commit_header() {
        let (upstream, _fx) = spawn_upstream(b"").await;
        let repos = TempDir::new().unwrap();
        let (mirror, _state) = spawn_mirror(upstream, &repos, vec![]).await;

        let response = reqwest::get(format!("{mirror}/api/models/org/model/revision/main"))
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(
            response.headers()["x-repo-commit"].to_str().unwrap(),
            COMMIT
        );
        let json: serde_json::Value = response.json().await.unwrap();
        assert_eq!(json["sha"], COMMIT);
    }

    #[tokio::test]
    async fn unknown_paths_get_json_404() {
        let (upstream, _fx) = spawn_upstream(b"").await;
        let repos = TempDir::new().unwrap();
        let (mirror, _state) = spawn_mirror(upstream, &repos, vec![]).await;

        let response = reqwest::get(format!("{mirror}/totally/unknown"))
            .await
            .unwrap();
        assert_eq!(response.status(), 404);
        let json: serde_json::Value = response.json().await.unwrap();
        assert_eq!(json["error"], "not_found");
    }
}
