//! Protocol frames and the builder that produces them.
//!
//! One frame per WebSocket text message. Outgoing control frames carry an
//! `x-everrest-websocket-message-type` header (`subscribe-channel`,
//! `unsubscribe-channel`, `ping`); inbound frames are routed by the
//! `x-everrest-websocket-channel` header. Headers are an ordered list, not
//! a map: duplicate names are legal and lookups are **last match wins**,
//! which some servers rely on.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::errors::WireError;

/// Header carrying the message type of an outgoing control frame.
pub const MESSAGE_TYPE_HEADER: &str = "x-everrest-websocket-message-type";

/// Header carrying the target channel of an inbound frame.
pub const CHANNEL_HEADER: &str = "x-everrest-websocket-channel";

/// Message type value for channel subscription.
pub const SUBSCRIBE_CHANNEL: &str = "subscribe-channel";

/// Message type value for channel unsubscription.
pub const UNSUBSCRIBE_CHANNEL: &str = "unsubscribe-channel";

/// Message type value for keepalive pings.
pub const PING: &str = "ping";

/// One name/value pair in a frame's ordered header list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Header name.
    pub name: String,
    /// Header value.
    pub value: String,
}

/// One JSON-encoded protocol message.
///
/// Immutable after construction. The `uuid` is a correlation token only,
/// never an authorization token.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Correlation id, v4-shaped.
    pub uuid: String,
    /// Request method, `POST` for every control frame.
    pub method: String,
    /// Request path, `null` for control frames.
    pub path: Option<String>,
    /// Ordered header list. Duplicates allowed.
    #[serde(default)]
    pub headers: Vec<Header>,
    /// Body as a JSON-encoded string (may be empty).
    #[serde(default)]
    pub body: String,
}

impl Frame {
    /// Build a subscribe control frame for `channel`.
    #[must_use]
    pub fn subscribe(channel: &str) -> Self {
        FrameBuilder::new()
            .header(MESSAGE_TYPE_HEADER, SUBSCRIBE_CHANNEL)
            .body(channel_body(channel))
            .build()
    }

    /// Build an unsubscribe control frame for `channel`.
    #[must_use]
    pub fn unsubscribe(channel: &str) -> Self {
        FrameBuilder::new()
            .header(MESSAGE_TYPE_HEADER, UNSUBSCRIBE_CHANNEL)
            .body(channel_body(channel))
            .build()
    }

    /// Build a keepalive ping frame (empty body).
    #[must_use]
    pub fn ping() -> Self {
        FrameBuilder::new().header(MESSAGE_TYPE_HEADER, PING).build()
    }

    /// Parse a frame from one inbound text message.
    pub fn parse(raw: &str) -> Result<Self, WireError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Serialize to the wire text representation.
    pub fn serialize(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Look up a header value by name.
    ///
    /// Scans the whole ordered list; when duplicates exist the **last**
    /// occurrence wins.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        let mut found = None;
        for header in &self.headers {
            if header.name == name {
                found = Some(header.value.as_str());
            }
        }
        found
    }

    /// Resolve the channel this inbound frame is addressed to.
    ///
    /// The `x-everrest-websocket-channel` header wins when present. A frame
    /// with no channel header but exactly one message-type header (raw
    /// ping-style frames) routes to that header's value. Anything else is
    /// unroutable and yields `None`.
    #[must_use]
    pub fn routing_channel(&self) -> Option<&str> {
        if let Some(channel) = self.header(CHANNEL_HEADER) {
            return Some(channel);
        }
        let mut type_headers = self.headers.iter().filter(|h| h.name == MESSAGE_TYPE_HEADER);
        match (type_headers.next(), type_headers.next()) {
            (Some(only), None) => Some(only.value.as_str()),
            _ => None,
        }
    }
}

/// Fluent builder for [`Frame`] values.
///
/// Assigns a fresh correlation uuid on `build`; everything else defaults to
/// the control-frame shape (`POST`, null path, empty body).
#[derive(Debug, Default)]
pub struct FrameBuilder {
    path: Option<String>,
    headers: Vec<Header>,
    body: String,
}

impl FrameBuilder {
    /// Start a builder with the control-frame defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the request path.
    #[must_use]
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Append a header (duplicates preserved in order).
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(Header {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    /// Set the body string.
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Build a request frame addressed to `path` with a JSON body,
    /// suitable for uuid-correlated request/reply.
    #[must_use]
    pub fn request(path: impl Into<String>, body: impl Into<String>) -> Frame {
        Self::new()
            .path(path)
            .header("content-type", "application/json")
            .body(body)
            .build()
    }

    /// Finalize into an immutable [`Frame`] with a fresh uuid.
    #[must_use]
    pub fn build(self) -> Frame {
        Frame {
            uuid: frame_id(),
            method: "POST".into(),
            path: self.path,
            headers: self.headers,
            body: self.body,
        }
    }
}

/// Generate a v4-shaped correlation id.
///
/// Deliberately not a cryptographic uuid: the id only correlates requests
/// with replies, matching the original protocol's generator.
#[must_use]
pub fn frame_id() -> String {
    const TEMPLATE: &[u8] = b"xxxxxxxx-xxxx-4xxx-yxxx-xxxxxxxxxxxx";
    let mut rng = rand::rng();
    TEMPLATE
        .iter()
        .map(|&c| match c {
            b'x' => char::from_digit(rng.random_range(0..16_u32), 16).unwrap_or('0'),
            b'y' => char::from_digit(rng.random_range(8..12_u32), 16).unwrap_or('8'),
            other => char::from(other),
        })
        .collect()
}

fn channel_body(channel: &str) -> String {
    serde_json::json!({ "channel": channel }).to_string()
}
