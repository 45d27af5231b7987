//! Configuration loading and validation.
//!
//! Settings come from an optional TOML file (`-c config.toml`) with CLI flags
//! taking precedence. Everything recognised is enumerated here once; the
//! resulting [`Config`] is frozen at startup — the only runtime-mutable knob
//! is the offline guard, which lives elsewhere as an atomic.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub mirror: MirrorConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub ttl: TtlConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Start in offline mode: no outbound network calls, cache-only serving.
    #[serde(default)]
    pub offline: bool,
    #[serde(default)]
    pub rules: RulesConfig,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// TLS key path, handed to the fronting TLS terminator. Unused in-process.
    #[serde(default)]
    pub ssl_key: Option<String>,
    /// TLS certificate path, handed to the fronting TLS terminator.
    #[serde(default)]
    pub ssl_cert: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            ssl_key: None,
            ssl_cert: None,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8090
}

// ---------------------------------------------------------------------------
// Upstream hub
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfig {
    #[serde(default = "default_hf_scheme")]
    pub hf_scheme: String,
    /// Host (and optional port) of the upstream hub.
    #[serde(default = "default_hf_netloc")]
    pub hf_netloc: String,
    /// Host of the upstream LFS CDN.
    #[serde(default = "default_hf_lfs_netloc")]
    pub hf_lfs_netloc: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            hf_scheme: default_hf_scheme(),
            hf_netloc: default_hf_netloc(),
            hf_lfs_netloc: default_hf_lfs_netloc(),
        }
    }
}

impl UpstreamConfig {
    pub fn hub_base(&self) -> String {
        format!("{}://{}", self.hf_scheme, self.hf_netloc)
    }

    pub fn lfs_base(&self) -> String {
        format!("{}://{}", self.hf_scheme, self.hf_lfs_netloc)
    }
}

fn default_hf_scheme() -> String {
    "https".to_string()
}

fn default_hf_netloc() -> String {
    "huggingface.co".to_string()
}

fn default_hf_lfs_netloc() -> String {
    "cdn-lfs.huggingface.co".to_string()
}

// ---------------------------------------------------------------------------
// Mirror identity (how we rewrite redirects that point back at us)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MirrorConfig {
    #[serde(default = "default_mirror_scheme")]
    pub mirror_scheme: String,
    /// Public host of this mirror, used when rewriting upstream `Location`
    /// headers so that clients come back to us.
    #[serde(default = "default_mirror_netloc")]
    pub mirror_netloc: String,
    /// Public host of this mirror's LFS endpoint.
    #[serde(default = "default_mirror_netloc")]
    pub mirror_lfs_netloc: String,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            mirror_scheme: default_mirror_scheme(),
            mirror_netloc: default_mirror_netloc(),
            mirror_lfs_netloc: default_mirror_netloc(),
        }
    }
}

impl MirrorConfig {
    pub fn lfs_base(&self) -> String {
        format!("{}://{}", self.mirror_scheme, self.mirror_lfs_netloc)
    }
}

fn default_mirror_scheme() -> String {
    "http".to_string()
}

fn default_mirror_netloc() -> String {
    "localhost:8090".to_string()
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Root of the chunked cache and metadata store.
    #[serde(default = "default_repos_path")]
    pub repos_path: PathBuf,
    /// Optional directory of pre-cloned repositories served verbatim.
    #[serde(default)]
    pub mirrors_path: Option<PathBuf>,
    /// Block size in bytes for newly created cache files. Power of two.
    #[serde(default = "default_block_size")]
    pub block_size: u64,
    /// Total on-disk cache budget in bytes. `0` disables eviction.
    #[serde(default)]
    pub cache_limit_bytes: u64,
    #[serde(default = "default_eviction_policy")]
    pub eviction_policy: EvictionPolicy,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            repos_path: default_repos_path(),
            mirrors_path: None,
            block_size: default_block_size(),
            cache_limit_bytes: 0,
            eviction_policy: default_eviction_policy(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    Lru,
    Fifo,
    LargeFirst,
}

fn default_repos_path() -> PathBuf {
    PathBuf::from("./repos")
}

fn default_block_size() -> u64 {
    1024 * 1024
}

fn default_eviction_policy() -> EvictionPolicy {
    EvictionPolicy::Lru
}

// ---------------------------------------------------------------------------
// Metadata cache TTLs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TtlConfig {
    /// TTL (seconds) for cached repo info responses.
    #[serde(default = "default_repo_info_ttl")]
    pub repo_info_secs: u64,
    /// TTL (seconds) for branch → commit resolution entries.
    #[serde(default = "default_resolve_ttl")]
    pub resolve_secs: u64,
    /// TTL (seconds) for tree listings.
    #[serde(default = "default_tree_ttl")]
    pub tree_secs: u64,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            repo_info_secs: default_repo_info_ttl(),
            resolve_secs: default_resolve_ttl(),
            tree_secs: default_tree_ttl(),
        }
    }
}

fn default_repo_info_ttl() -> u64 {
    600
}

fn default_resolve_ttl() -> u64 {
    600
}

fn default_tree_ttl() -> u64 {
    600
}

// ---------------------------------------------------------------------------
// Upstream retry behaviour
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Maximum attempts per upstream request (first try included).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base backoff delay in milliseconds; doubles per attempt plus jitter.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Maximum redirect hops followed when resolving a file location.
    #[serde(default = "default_max_redirects")]
    pub max_redirects: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            timeout_secs: default_timeout_secs(),
            max_redirects: default_max_redirects(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_timeout_secs() -> u64 {
    15
}

fn default_max_redirects() -> u32 {
    5
}

// ---------------------------------------------------------------------------
// Access rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RulesConfig {
    /// Ordered proxy allow/deny rules; first match wins, default allow.
    #[serde(default)]
    pub proxy: Vec<RuleConfig>,
    /// Ordered cache allow/deny rules; first match wins, default allow.
    #[serde(default)]
    pub cache: Vec<RuleConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
    /// Pattern matched against `org/name`.
    pub repo: String,
    pub allow: bool,
    /// Interpret `repo` as an anchored regex instead of a glob.
    #[serde(default)]
    pub use_regex: bool,
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// CLI overrides applied on top of the file config. Keys are flag names.
pub type Overrides = HashMap<&'static str, String>;

/// Load a [`Config`] from an optional TOML file, apply CLI overrides, then
/// validate.
pub fn load_config(path: Option<&Path>, overrides: &Overrides) -> Result<Config> {
    let mut config = match path {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file: {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("failed to parse config file: {}", path.display()))?
        }
        None => Config::default(),
    };

    apply_overrides(&mut config, overrides)?;
    validate_config(&config)?;
    Ok(config)
}

fn apply_overrides(config: &mut Config, overrides: &Overrides) -> Result<()> {
    for (key, value) in overrides {
        match *key {
            "host" => config.server.host = value.clone(),
            "port" => {
                config.server.port = value
                    .parse()
                    .with_context(|| format!("invalid --port value: {value}"))?
            }
            "ssl-key" => config.server.ssl_key = Some(value.clone()),
            "ssl-cert" => config.server.ssl_cert = Some(value.clone()),
            "repos-path" => config.storage.repos_path = PathBuf::from(value),
            "mirrors-path" => config.storage.mirrors_path = Some(PathBuf::from(value)),
            "hf-scheme" => config.upstream.hf_scheme = value.clone(),
            "hf-netloc" => config.upstream.hf_netloc = value.clone(),
            "hf-lfs-netloc" => config.upstream.hf_lfs_netloc = value.clone(),
            "mirror-scheme" => config.mirror.mirror_scheme = value.clone(),
            "mirror-netloc" => config.mirror.mirror_netloc = value.clone(),
            "mirror-lfs-netloc" => config.mirror.mirror_lfs_netloc = value.clone(),
            other => anyhow::bail!("unknown config override: {other}"),
        }
    }
    Ok(())
}

/// Sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        config.storage.block_size.is_power_of_two(),
        "storage.block_size must be a power of two, got {}",
        config.storage.block_size
    );
    anyhow::ensure!(
        config.storage.block_size >= 4096,
        "storage.block_size must be at least 4 KiB"
    );
    anyhow::ensure!(
        config.retry.max_attempts >= 1,
        "retry.max_attempts must be >= 1"
    );
    anyhow::ensure!(
        !config.upstream.hf_netloc.is_empty(),
        "upstream.hf_netloc must not be empty"
    );
    for scheme in [&config.upstream.hf_scheme, &config.mirror.mirror_scheme] {
        anyhow::ensure!(
            scheme == "http" || scheme == "https",
            "scheme must be http or https, got {scheme}"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        validate_config(&config).unwrap();
        assert_eq!(config.storage.block_size, 1024 * 1024);
        assert_eq!(config.retry.max_attempts, 5);
        assert!(!config.offline);
    }

    #[test]
    fn parses_full_toml() {
        let toml_src = r#"
            offline = true

            [server]
            host = "127.0.0.1"
            port = 9000

            [upstream]
            hf_scheme = "https"
            hf_netloc = "hub.example.com"
            hf_lfs_netloc = "cdn.example.com"

            [storage]
            repos_path = "/var/cache/hubcache"
            block_size = 4194304
            cache_limit_bytes = 1000000000
            eviction_policy = "large_first"

            [[rules.proxy]]
            repo = "secret/*"
            allow = false

            [[rules.cache]]
            repo = "^big-org/.*$"
            allow = false
            use_regex = true
        "#;

        let config: Config = toml::from_str(toml_src).unwrap();
        validate_config(&config).unwrap();
        assert!(config.offline);
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.upstream.hub_base(), "https://hub.example.com");
        assert_eq!(config.storage.block_size, 4 * 1024 * 1024);
        assert_eq!(config.storage.eviction_policy, EvictionPolicy::LargeFirst);
        assert_eq!(config.rules.proxy.len(), 1);
        assert!(!config.rules.proxy[0].allow);
        assert!(config.rules.cache[0].use_regex);
    }

    #[test]
    fn rejects_non_power_of_two_block_size() {
        let mut config = Config::default();
        config.storage.block_size = 1000;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn overrides_take_precedence() {
        let mut overrides = Overrides::new();
        overrides.insert("host", "10.0.0.1".to_string());
        overrides.insert("port", "1234".to_string());
        overrides.insert("hf-netloc", "hub.internal".to_string());
        let config = load_config(None, &overrides).unwrap();
        assert_eq!(config.server.host, "10.0.0.1");
        assert_eq!(config.server.port, 1234);
        assert_eq!(config.upstream.hf_netloc, "hub.internal");
    }

    #[test]
    fn rejects_bad_port_override() {
        let mut overrides = Overrides::new();
        overrides.insert("port", "not-a-port".to_string());
        assert!(load_config(None, &overrides).is_err());
    }
}
