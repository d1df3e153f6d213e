//! # loft-wire
//!
//! Wire-level vocabulary for the Loft realtime protocol.
//!
//! Everything that crosses the WebSocket is a [`frame::Frame`]: one JSON
//! text message carrying a correlation uuid, an ordered header list, and a
//! string body. Control frames (subscribe, unsubscribe, ping) are built
//! through [`frame::FrameBuilder`]; inbound routing is resolved through
//! [`frame::Frame::routing_channel`].
//!
//! The crate also owns the workspace status vocabulary:
//!
//! - **[`status::WorkspaceStatus`]**: closed status enumeration
//! - **[`status::StatusEvent`]**: the push event shape delivered on
//!   per-workspace channels
//!
//! ## Crate Position
//!
//! Foundation crate. Depended on by `loft-bus` and `loft-tracker`.

#![deny(unsafe_code)]

pub mod errors;
pub mod frame;
pub mod status;

pub use errors::WireError;
pub use frame::{Frame, FrameBuilder, Header};
pub use status::{StatusEvent, WorkspaceStatus};
