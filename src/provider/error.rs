//! Error types for the provider socket

/// WebSocket connection timeout in seconds
pub(super) const WS_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Errors that can occur on the provider socket
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Connection timeout - provider did not respond within {WS_CONNECT_TIMEOUT_SECS} seconds")]
    ConnectionTimeout,
}
