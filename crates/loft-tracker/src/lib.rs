//! # loft-tracker
//!
//! Per-workspace status tracking over the message bus.
//!
//! A [`tracker::WorkspaceTracker`] subscribes each tracked workspace to its
//! `entity:<id>` channel, folds inbound status events into a local status
//! (including the derived `SNAPSHOTTING`/`RUNNING` pair), and resolves
//! [`tracker::StatusWait`] futures when a workspace reaches the status a
//! caller is waiting for.

#![deny(unsafe_code)]

pub mod errors;
pub mod tracker;

pub use errors::TrackerError;
pub use tracker::{status_channel, StatusWait, WorkspaceTracker, STATUS_CHANNEL_PREFIX};
