//! Overlay error types

use thiserror::Error;

/// Errors from the overlay layer
#[derive(Debug, Error)]
pub enum OverlayError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket transport error
    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    /// TLS configuration error
    #[error("TLS error: {0}")]
    Tls(String),

    /// Cryptographic failure
    #[error("crypto error: {0}")]
    Crypto(#[from] ringnet_crypto::CryptoError),

    /// Malformed or unexpected wire frame
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// No trusted peer with the given signature
    #[error("peer not found: {0}")]
    PeerNotFound(String),

    /// Service already running
    #[error("overlay already running")]
    AlreadyRunning,

    /// Service not running
    #[error("overlay not running")]
    NotRunning,

    /// Outbound channel to a connection closed
    #[error("connection channel closed")]
    ChannelClosed,
}

/// Result type for overlay operations
pub type OverlayResult<T> = Result<T, OverlayError>;
