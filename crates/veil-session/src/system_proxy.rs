//! OS proxy settings
//!
//! Toggling the system proxy is platform shell work (gsettings, networksetup,
//! the registry) and lives outside this crate. The session only talks to the
//! [`SystemProxy`] trait and never lets a failure here affect the connection.

use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SystemProxyError {
    #[error("System proxy is not supported on this platform")]
    Unsupported,

    #[error("System proxy command failed: {0}")]
    Command(String),
}

/// OS-level proxy switch
pub trait SystemProxy: Send + Sync {
    /// Point the OS at the local mixed and HTTP ports
    fn enable(&self, socks_port: u16, http_port: u16) -> Result<(), SystemProxyError>;

    /// Restore direct access; `force` clears settings this process did not set
    fn disable(&self, force: bool) -> Result<(), SystemProxyError>;

    fn is_enabled(&self) -> bool;
}

/// Tracks the requested state without touching the OS
#[derive(Debug, Default)]
pub struct NoopSystemProxy {
    enabled: AtomicBool,
}

impl NoopSystemProxy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SystemProxy for NoopSystemProxy {
    fn enable(&self, socks_port: u16, http_port: u16) -> Result<(), SystemProxyError> {
        info!(
            "System proxy requested (socks 127.0.0.1:{}, http 127.0.0.1:{})",
            socks_port, http_port
        );
        self.enabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn disable(&self, force: bool) -> Result<(), SystemProxyError> {
        if self.enabled.swap(false, Ordering::SeqCst) || force {
            info!("System proxy cleared");
        }
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}
