// The cache and client modules expose their full operation surface (range
// queries, fill/stream primitives, response metadata) even where the HTTP
// layer composes them differently. Allow dead_code crate-wide rather than
// annotating each entry point.
#![allow(dead_code)]

mod cache;
mod config;
mod error;
mod http;
mod meta_cache;
mod metrics;
mod offline;
mod policy;
mod upstream;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::cache::ChunkCache;
use crate::config::{Config, Overrides};
use crate::meta_cache::MetaCache;
use crate::metrics::MetricsRegistry;
use crate::offline::OfflineGuard;
use crate::policy::PolicyEngine;
use crate::upstream::UpstreamClient;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "hubcache",
    about = "Self-hosted chunked caching mirror for HuggingFace-compatible hubs"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Listen address.
    #[arg(long)]
    host: Option<String>,
    /// Listen port.
    #[arg(long)]
    port: Option<u16>,
    /// TLS key path (consumed by the fronting TLS terminator).
    #[arg(long = "ssl-key")]
    ssl_key: Option<String>,
    /// TLS certificate path (consumed by the fronting TLS terminator).
    #[arg(long = "ssl-cert")]
    ssl_cert: Option<String>,
    /// Root directory of the on-disk cache.
    #[arg(long = "repos-path")]
    repos_path: Option<String>,
    /// Directory of pre-cloned repositories served verbatim.
    #[arg(long = "mirrors-path")]
    mirrors_path: Option<String>,
    /// Scheme of the upstream hub (http or https).
    #[arg(long = "hf-scheme")]
    hf_scheme: Option<String>,
    /// Host of the upstream hub.
    #[arg(long = "hf-netloc")]
    hf_netloc: Option<String>,
    /// Host of the upstream LFS CDN.
    #[arg(long = "hf-lfs-netloc")]
    hf_lfs_netloc: Option<String>,
    /// Public scheme of this mirror.
    #[arg(long = "mirror-scheme")]
    mirror_scheme: Option<String>,
    /// Public host of this mirror.
    #[arg(long = "mirror-netloc")]
    mirror_netloc: Option<String>,
    /// Public LFS host of this mirror.
    #[arg(long = "mirror-lfs-netloc")]
    mirror_lfs_netloc: Option<String>,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        let mut overrides = Overrides::new();
        let mut push = |key: &'static str, value: Option<String>| {
            if let Some(value) = value {
                overrides.insert(key, value);
            }
        };
        push("host", self.host.clone());
        push("port", self.port.map(|p| p.to_string()));
        push("ssl-key", self.ssl_key.clone());
        push("ssl-cert", self.ssl_cert.clone());
        push("repos-path", self.repos_path.clone());
        push("mirrors-path", self.mirrors_path.clone());
        push("hf-scheme", self.hf_scheme.clone());
        push("hf-netloc", self.hf_netloc.clone());
        push("hf-lfs-netloc", self.hf_lfs_netloc.clone());
        push("mirror-scheme", self.mirror_scheme.clone());
        push("mirror-netloc", self.mirror_netloc.clone());
        push("mirror-lfs-netloc", self.mirror_lfs_netloc.clone());
        overrides
    }
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Long-lived services shared by all request handlers and background tasks.
/// Constructed once at startup; the offline guard is the only mutable piece.
pub struct AppState {
    pub config: Arc<Config>,
    pub metrics: MetricsRegistry,
    pub chunk_cache: Arc<ChunkCache>,
    pub meta_cache: Arc<MetaCache>,
    pub upstream: Arc<UpstreamClient>,
    pub policy: Arc<PolicyEngine>,
    pub offline: Arc<OfflineGuard>,
    /// Result of the last background connectivity probe.
    pub upstream_reachable: Arc<AtomicBool>,
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: Arc<AppState>) -> Result<()> {
    let app = http::handler::create_router(Arc::clone(&state));

    let listen_addr: std::net::SocketAddr =
        format!("{}:{}", state.config.server.host, state.config.server.port)
            .parse()
            .context("invalid listen address")?;

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

/// Probe upstream reachability once a minute so `/healthz` can report it
/// without touching the network per request.
async fn run_connectivity_probe(state: Arc<AppState>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(60));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if state.offline.is_offline() {
            continue;
        }
        let reachable = state.upstream.probe().await;
        let previous = state
            .upstream_reachable
            .swap(reachable, Ordering::Relaxed);
        if previous != reachable {
            if reachable {
                tracing::info!("upstream hub is reachable again");
            } else {
                tracing::warn!("upstream hub is unreachable");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config (exit code 2 on parse/validation errors) ----
    let config = match config::load_config(cli.config.as_deref(), &cli.overrides()) {
        Ok(config) => Arc::new(config),
        Err(err) => {
            eprintln!("configuration error: {err:#}");
            std::process::exit(2);
        }
    };

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        upstream = %config.upstream.hub_base(),
        repos_path = %config.storage.repos_path.display(),
        offline = config.offline,
        "starting hubcache"
    );

    // ---- Cache directories ----
    tokio::fs::create_dir_all(&config.storage.repos_path)
        .await
        .with_context(|| {
            format!(
                "failed to create cache dir: {}",
                config.storage.repos_path.display()
            )
        })?;
    tokio::fs::create_dir_all(config.storage.repos_path.join("tmp"))
        .await
        .context("failed to create cache tmp dir")?;

    // ---- Services ----
    let offline = Arc::new(OfflineGuard::new(config.offline));

    let policy = match PolicyEngine::new(&config.rules.proxy, &config.rules.cache) {
        Ok(policy) => Arc::new(policy),
        Err(err) => {
            eprintln!("configuration error: {err:#}");
            std::process::exit(2);
        }
    };

    let metrics = MetricsRegistry::new();
    metrics
        .metrics
        .offline_mode
        .set(if config.offline { 1 } else { 0 });

    let upstream = Arc::new(UpstreamClient::new(
        &config.upstream,
        &config.mirror,
        &config.retry,
        Arc::clone(&offline),
        Arc::clone(&metrics.metrics),
    )?);

    let chunk_cache = Arc::new(ChunkCache::new(
        config.storage.repos_path.clone(),
        config.storage.block_size,
    ));
    let meta_cache = Arc::new(MetaCache::new(
        &config.storage.repos_path,
        Arc::clone(&offline),
    ));

    // ---- App state ----
    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        metrics,
        chunk_cache: Arc::clone(&chunk_cache),
        meta_cache,
        upstream,
        policy,
        offline,
        upstream_reachable: Arc::new(AtomicBool::new(false)),
    });

    // ---- Background tasks ----
    if config.storage.cache_limit_bytes > 0 {
        tokio::spawn(cache::eviction::run_eviction_loop(
            chunk_cache,
            config.storage.cache_limit_bytes,
            config.storage.eviction_policy,
            state.metrics.clone(),
        ));
    }
    tokio::spawn(run_connectivity_probe(Arc::clone(&state)));

    // ---- Serve ----
    run_http_server(state).await?;

    tracing::info!("hubcache shut down cleanly");
    Ok(())
}
