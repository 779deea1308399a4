//! Error types shared by the orchestration layer

use std::net::IpAddr;
use std::time::Duration;

/// Longest raw-payload excerpt carried by [`Error::Decode`]
pub const EXCERPT_LEN: usize = 200;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("Proxy on {address} did not register within {timeout:?}")]
    RegistrationTimeout { address: IpAddr, timeout: Duration },

    #[error("Could not auto-detect a local address: {0}")]
    AutoDetectFailure(String),

    #[error("No registered proxy peer")]
    PeerNotRegistered,

    #[error("Request {method} timed out after {timeout:?}")]
    RequestTimeout { method: String, timeout: Duration },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Failed to decode response ({reason}): {excerpt}")]
    Decode { reason: String, excerpt: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Scan timeout: {0}")]
    ScanTimeout(String),

    #[error("Proxy error: {0}")]
    Engine(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl Error {
    /// Build a decode error from the raw bytes that failed to parse
    pub fn decode(reason: impl ToString, raw: &[u8]) -> Self {
        Error::Decode {
            reason: reason.to_string(),
            excerpt: excerpt(raw),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Transport(format!("payload encoding failed: {}", err))
    }
}

impl From<bacscan_ipc::IpcError> for Error {
    fn from(err: bacscan_ipc::IpcError) -> Self {
        Error::Transport(err.to_string())
    }
}

/// Lossy, char-boundary-safe prefix of a raw payload for diagnostics
pub fn excerpt(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    match text.char_indices().nth(EXCERPT_LEN) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.into_owned(),
    }
}
