//! Bus-level error types.

use thiserror::Error;

/// Errors surfaced by the message bus and connection factory.
///
/// Expected protocol conditions (unroutable frames, duplicate
/// unsubscribes) are not errors and never appear here; asynchronous socket
/// failures reach callers through the registered close/error callbacks
/// instead.
#[derive(Debug, Error)]
pub enum BusError {
    /// The WebSocket dial or handshake failed.
    #[error("websocket connection failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),

    /// The computed connection URL was not parseable.
    #[error("connection url is invalid: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The bus configuration cannot produce a usable URL.
    #[error("invalid bus config: {0}")]
    Config(String),

    /// An outgoing frame could not be encoded.
    #[error("frame could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),

    /// The bus is closed; no further wire traffic is possible.
    #[error("message bus is closed")]
    Closed,
}
