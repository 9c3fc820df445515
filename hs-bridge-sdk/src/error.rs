use std::time::Duration;
use thiserror::Error;

/// Server-side error text prefix that marks a permission failure on an
/// otherwise healthy session. Calls failing with it are retried exactly once
/// after a forced reconnect before being surfaced.
pub const PERMISSION_ERR_PREFIX: &str = "proj::PermissionErr";

/// Bridge-wide error taxonomy.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// The server instance is disabled; no network I/O was attempted.
    #[error("instance disabled")]
    Disabled,
    /// Transport-level failure; the connection manager tears down and retries.
    #[error("network error: {0}")]
    Network(String),
    /// HTTP-level failure; 3xx codes are retried transparently.
    #[error("http {code}: {message}")]
    Http { code: u16, message: String },
    /// Error grid returned by the server for one call.
    #[error("call error: {0}")]
    Call(String),
    /// Response the client could not interpret; surfaced, never retried.
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("session error: {0}")]
    Session(String),
    #[error("subscription error: {0}")]
    Subscription(String),
    /// The open watch was invalidated (server-side expiry or close).
    #[error("watch closed")]
    WatchClosed,
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
}

impl BridgeError {
    /// Failures that invalidate the whole session and feed the retry loop.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Timeout(_) | Self::WatchClosed
        )
    }

    /// Redirect-class HTTP failures, retried transparently after reconnect.
    pub fn is_redirect(&self) -> bool {
        matches!(self, Self::Http { code, .. } if (300..400).contains(code))
    }

    /// Permission failure on a single call, retried once after reconnect.
    pub fn is_permission(&self) -> bool {
        matches!(self, Self::Call(msg) if msg.starts_with(PERMISSION_ERR_PREFIX))
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;
