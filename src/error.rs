//! Error taxonomy for the proxy core.
//!
//! Every failure that can surface from a request handler is a [`ProxyError`]
//! variant; the [`IntoResponse`] impl maps each variant to its HTTP status
//! and a short JSON body of the form `{"error": "...", "detail": "..."}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

// ---------------------------------------------------------------------------
// ProxyError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ProxyError {
    // -- inbound --
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not found")]
    NotFound,
    #[error("range not satisfiable: {0}")]
    RangeNotSatisfiable(String),

    // -- policy --
    #[error("proxying denied for repository {0}")]
    ProxyDenied(String),
    #[error("caching denied for repository {0}")]
    CacheDenied(String),

    // -- upstream --
    #[error("upstream request timed out")]
    UpstreamTimeout,
    #[error("upstream returned HTTP {0}")]
    UpstreamHttp(u16),
    #[error("upstream network error: {0}")]
    UpstreamNetwork(String),

    // -- cache integrity --
    #[error("cached size differs from upstream size")]
    SizeMismatch,
    #[error("content digest mismatch on finalize")]
    DigestMismatch,
    #[error("cache sidecar bitmap is corrupt: {0}")]
    BitmapCorrupt(String),
    #[error("disk full while writing cache")]
    DiskFull,

    // -- coordination --
    #[error("offline mode: required block not cached")]
    OfflineMiss,
    #[error("request cancelled")]
    Cancelled,

    // -- bug class --
    #[error("unexpected internal error: {0}")]
    Unexpected(#[from] anyhow::Error),
}

impl ProxyError {
    /// Short machine-readable kind used in JSON error bodies and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::BadRequest(_) => "bad_request",
            ProxyError::Forbidden(_) => "forbidden",
            ProxyError::NotFound => "not_found",
            ProxyError::RangeNotSatisfiable(_) => "range_not_satisfiable",
            ProxyError::ProxyDenied(_) => "proxy_denied",
            ProxyError::CacheDenied(_) => "cache_denied",
            ProxyError::UpstreamTimeout => "upstream_timeout",
            ProxyError::UpstreamHttp(_) => "upstream_http",
            ProxyError::UpstreamNetwork(_) => "upstream_network",
            ProxyError::SizeMismatch => "size_mismatch",
            ProxyError::DigestMismatch => "digest_mismatch",
            ProxyError::BitmapCorrupt(_) => "bitmap_corrupt",
            ProxyError::DiskFull => "disk_full",
            ProxyError::OfflineMiss => "offline_miss",
            ProxyError::Cancelled => "cancelled",
            ProxyError::Unexpected(_) => "unexpected",
        }
    }

    /// HTTP status this error maps to when it reaches the client.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::Forbidden(_) | ProxyError::ProxyDenied(_) | ProxyError::CacheDenied(_) => {
                StatusCode::FORBIDDEN
            }
            ProxyError::NotFound => StatusCode::NOT_FOUND,
            ProxyError::RangeNotSatisfiable(_) => StatusCode::RANGE_NOT_SATISFIABLE,
            // Upstream failures surface as 502 regardless of the status the
            // hub returned; the original code is preserved in the variant
            // for the error body and logs.
            ProxyError::UpstreamHttp(_) => StatusCode::BAD_GATEWAY,
            ProxyError::UpstreamNetwork(_)
            | ProxyError::SizeMismatch
            | ProxyError::DigestMismatch
            | ProxyError::BitmapCorrupt(_) => StatusCode::BAD_GATEWAY,
            ProxyError::UpstreamTimeout | ProxyError::OfflineMiss => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::DiskFull | ProxyError::Unexpected(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether a retry against upstream may succeed (used by the client's
    /// backoff loop).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProxyError::UpstreamTimeout
                | ProxyError::UpstreamNetwork(_)
                | ProxyError::UpstreamHttp(500..=599)
        )
    }

    /// Classify a `reqwest` transport error.
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProxyError::UpstreamTimeout
        } else {
            ProxyError::UpstreamNetwork(err.to_string())
        }
    }

    /// Classify an I/O error from the cache layer.
    pub fn from_io(err: std::io::Error) -> Self {
        if err.raw_os_error() == Some(libc_enospc()) {
            ProxyError::DiskFull
        } else {
            ProxyError::Unexpected(anyhow::Error::new(err).context("cache I/O"))
        }
    }
}

/// ENOSPC without pulling in libc.
const fn libc_enospc() -> i32 {
    28
}

// ---------------------------------------------------------------------------
// HTTP mapping
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    detail: String,
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Cancellation is not an error condition worth a stack of logs;
        // everything 5xx-shaped is.
        match &self {
            ProxyError::Cancelled => {}
            ProxyError::Unexpected(err) => error!(error = %err, "internal error"),
            e if status.is_server_error() => warn!(error = %e, "request failed"),
            _ => {}
        }

        let body = ErrorBody {
            error: self.kind(),
            detail: redact(&self.to_string()),
        };
        (status, Json(body)).into_response()
    }
}

/// Strip anything that looks like a credential from a detail string before it
/// is sent to the client.
fn redact(detail: &str) -> String {
    let mut out = String::with_capacity(detail.len());
    for word in detail.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        let lower = word.to_ascii_lowercase();
        if lower.starts_with("bearer") || lower.starts_with("basic") || lower.contains("token") {
            out.push_str("<redacted>");
        } else {
            out.push_str(word);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_follows_taxonomy() {
        assert_eq!(ProxyError::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ProxyError::ProxyDenied("a/b".into()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(ProxyError::OfflineMiss.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(ProxyError::UpstreamTimeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(ProxyError::UpstreamHttp(404).status(), StatusCode::BAD_GATEWAY);
        assert_eq!(ProxyError::UpstreamHttp(503).status(), StatusCode::BAD_GATEWAY);
        assert_eq!(ProxyError::SizeMismatch.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(ProxyError::DigestMismatch.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            ProxyError::RangeNotSatisfiable("bytes=9-".into()).status(),
            StatusCode::RANGE_NOT_SATISFIABLE
        );
    }

    #[test]
    fn transient_classification() {
        assert!(ProxyError::UpstreamTimeout.is_transient());
        assert!(ProxyError::UpstreamHttp(502).is_transient());
        assert!(!ProxyError::UpstreamHttp(404).is_transient());
        assert!(!ProxyError::NotFound.is_transient());
    }

    #[test]
    fn redact_strips_credentials() {
        let redacted = redact("upstream rejected Bearer abc123");
        assert!(!redacted.contains("abc123"));
        assert!(redacted.contains("<redacted>"));
    }
}
