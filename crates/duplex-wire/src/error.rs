//! Error types for the wire layer

use thiserror::Error;

/// Result type alias for wire operations
pub type WireResult<T> = Result<T, WireError>;

/// Errors raised by the codec and the session transport.
///
/// `Protocol` is fatal only to the frame that produced it; `ConnectionClosed` is fatal to
/// the session and must be handled by whoever owns reconnection.
#[derive(Error, Debug)]
pub enum WireError {
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Session error {code}: {message}")]
    Session { code: u32, message: String },

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("No active session (request dropped)")]
    SessionInactive,

    #[error("Timed out waiting for {0}")]
    AckTimeout(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WireError {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        WireError::Protocol(msg.into())
    }

    /// True for errors that end the connection (the supervisor has to reconnect).
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            WireError::ConnectionClosed(_) | WireError::Handshake(_) | WireError::Io(_)
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for WireError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                WireError::ConnectionClosed("websocket closed".to_string())
            }
            WsError::Io(e) => WireError::ConnectionClosed(e.to_string()),
            other => WireError::ConnectionClosed(other.to_string()),
        }
    }
}
