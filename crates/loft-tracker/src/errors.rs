//! Tracker error types.

use loft_bus::BusError;
use thiserror::Error;

/// Errors surfaced by the workspace tracker.
#[derive(Debug, Error)]
pub enum TrackerError {
    /// A bus operation failed underneath the tracker.
    #[error(transparent)]
    Bus(#[from] BusError),

    /// The tracked workspace was dropped while a wait was outstanding.
    #[error("workspace is no longer tracked; the wait cannot resolve")]
    Abandoned,
}
