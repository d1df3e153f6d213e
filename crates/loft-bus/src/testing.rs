//! In-memory bus construction for tests.
//!
//! Gated behind the `test-support` feature so downstream crates can
//! exercise bus consumers without opening a socket.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::bus::MessageBus;

/// Bus whose outgoing wire traffic lands on the returned receiver.
///
/// Inbound traffic is injected with [`MessageBus::handle_message`]; no
/// keepalive task runs, so paused-clock tests control timing themselves.
#[must_use]
pub fn channel_bus() -> (Arc<MessageBus>, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(MessageBus::new(tx)), rx)
}
