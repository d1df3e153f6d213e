//! # loft-bus
//!
//! One WebSocket connection, many logical channels.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `bus` | Subscription table, inbound dispatch, keepalive, reply correlation |
//! | `transport` | tokio-tungstenite glue: read/write loops around a [`bus::MessageBus`] |
//! | `factory` | Connection URL building, lazy default/remote bus cache |
//! | `config` | [`config::BusConfig`] with compiled defaults and `LOFT_*` env overrides |
//! | `errors` | [`errors::BusError`] |
//!
//! ## Data Flow
//!
//! [`factory::BusFactory`] dials a socket and wraps it via
//! [`transport::attach`]; consumers subscribe to named channels on the
//! returned [`bus::MessageBus`]. Wire subscribe/unsubscribe frames go out
//! only on the first subscribe / last unsubscribe per channel; inbound
//! frames fan out to that channel's subscribers in registration order.
//!
//! There is no automatic reconnect: a closed bus stays closed, and the
//! factory builds a fresh one on the next request.

#![deny(unsafe_code)]

pub mod bus;
pub mod config;
pub mod errors;
pub mod factory;
pub mod transport;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use bus::{MessageBus, Payload, SubscriptionId, KEEPALIVE_PERIOD};
pub use config::BusConfig;
pub use errors::BusError;
pub use factory::BusFactory;
pub use transport::{attach, connect};
