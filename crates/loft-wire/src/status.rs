//! Workspace status vocabulary and the push events that drive it.
//!
//! The server pushes [`StatusEvent`]s on per-workspace channels. Most event
//! types are wire-native statuses; two are not and map to derived local
//! statuses: `SNAPSHOT_CREATING` means a running workspace entered
//! `SNAPSHOTTING`, and `SNAPSHOT_CREATED` puts it back to `RUNNING`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event type announcing that a snapshot started (derived status source).
pub const SNAPSHOT_CREATING: &str = "SNAPSHOT_CREATING";

/// Event type announcing that a snapshot finished (derived status source).
pub const SNAPSHOT_CREATED: &str = "SNAPSHOT_CREATED";

/// Closed enumeration of workspace statuses.
///
/// `Snapshotting` is never sent by the server verbatim; it is derived from
/// the snapshot event pair. There is no terminal state; a workspace stays
/// tracked indefinitely once subscribed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkspaceStatus {
    /// Workspace is starting up.
    Starting,
    /// Workspace is running.
    Running,
    /// Workspace is shutting down.
    Stopping,
    /// Workspace is stopped.
    Stopped,
    /// Workspace is paused.
    Paused,
    /// Workspace is in an error state.
    Error,
    /// A snapshot is being taken (derived, only meaningful while running).
    Snapshotting,
}

impl WorkspaceStatus {
    /// Wire string for this status.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
            Self::Paused => "PAUSED",
            Self::Error => "ERROR",
            Self::Snapshotting => "SNAPSHOTTING",
        }
    }

    /// Parse a wire-native status string (the six core statuses).
    ///
    /// `SNAPSHOTTING` is not wire-native and is deliberately rejected here;
    /// it only arises through [`WorkspaceStatus::from_event`].
    #[must_use]
    pub fn parse_wire(value: &str) -> Option<Self> {
        match value {
            "STARTING" => Some(Self::Starting),
            "RUNNING" => Some(Self::Running),
            "STOPPING" => Some(Self::Stopping),
            "STOPPED" => Some(Self::Stopped),
            "PAUSED" => Some(Self::Paused),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }

    /// Map a push event to the local status it implies, if any.
    ///
    /// An event carrying an `error` field always means `Error`. The
    /// snapshot event pair maps to the derived statuses; core statuses map
    /// verbatim; anything else implies no status change.
    #[must_use]
    pub fn from_event(event: &StatusEvent) -> Option<Self> {
        if event.error.is_some() {
            return Some(Self::Error);
        }
        match event.event_type.as_str() {
            SNAPSHOT_CREATING => Some(Self::Snapshotting),
            SNAPSHOT_CREATED => Some(Self::Running),
            other => Self::parse_wire(other),
        }
    }
}

impl std::fmt::Display for WorkspaceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status push event delivered on a per-workspace channel.
///
/// Only `eventType` and `error` are interpreted; every other field rides
/// along untouched so waiters receive the full server payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    /// Wire event type (core status or snapshot event).
    pub event_type: String,
    /// Server-side error description, if the transition failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Remaining payload fields, preserved verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl StatusEvent {
    /// Build a plain event of the given type (no error, no extras).
    #[must_use]
    pub fn of_type(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            error: None,
            extra: serde_json::Map::new(),
        }
    }
}
