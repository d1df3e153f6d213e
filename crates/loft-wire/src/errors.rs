//! Wire-level error types.

use thiserror::Error;

/// Errors raised while decoding wire frames.
#[derive(Debug, Error)]
pub enum WireError {
    /// An inbound text message was not a valid JSON frame.
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] serde_json::Error),
}
