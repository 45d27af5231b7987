//! Global offline toggle.
//!
//! All upstream calls check this guard before leaving the process. When
//! offline, metadata is served from the metadata cache only and block fetches
//! fail with `OfflineMiss`; blocks already on disk serve normally.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::ProxyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfflineReason {
    /// Online; upstream calls allowed.
    Online,
    /// Operator forced offline via config.
    Configured,
    /// Flipped offline at runtime (admin action or probe).
    Runtime,
}

impl OfflineReason {
    fn as_u8(self) -> u8 {
        match self {
            OfflineReason::Online => 0,
            OfflineReason::Configured => 1,
            OfflineReason::Runtime => 2,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => OfflineReason::Configured,
            2 => OfflineReason::Runtime,
            _ => OfflineReason::Online,
        }
    }
}

/// Single boolean plus a reason, packed into one atomic so readers never
/// observe a torn state.
#[derive(Debug)]
pub struct OfflineGuard {
    state: AtomicU8,
}

impl OfflineGuard {
    pub fn new(configured_offline: bool) -> Self {
        let reason = if configured_offline {
            OfflineReason::Configured
        } else {
            OfflineReason::Online
        };
        Self {
            state: AtomicU8::new(reason.as_u8()),
        }
    }

    pub fn is_offline(&self) -> bool {
        self.reason() != OfflineReason::Online
    }

    pub fn reason(&self) -> OfflineReason {
        OfflineReason::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_offline(&self, reason: OfflineReason) {
        self.state.store(reason.as_u8(), Ordering::Release);
    }

    pub fn set_online(&self) {
        self.state
            .store(OfflineReason::Online.as_u8(), Ordering::Release);
    }

    /// Gate for outbound calls: `Err(OfflineMiss)` when offline.
    pub fn ensure_online(&self) -> Result<(), ProxyError> {
        if self.is_offline() {
            Err(ProxyError::OfflineMiss)
        } else {
            Ok(())
        }
    }
}
