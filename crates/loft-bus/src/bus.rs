//! The multiplexing message bus: one live socket, many named channels.
//!
//! Subscriptions are ref-counted per channel: the wire subscribe frame goes
//! out exactly once when a channel gains its first subscriber, and the wire
//! unsubscribe frame exactly once when the last subscriber leaves. Inbound
//! frames fan out to a channel's subscribers in registration order, one
//! frame at a time.
//!
//! Liveness is a single keepalive timer per bus: any inbound frame restarts
//! it, so pings are only sent across true idle periods.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use loft_wire::Frame;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{Notify, mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::errors::BusError;

/// Idle period after which a keepalive ping is sent.
pub const KEEPALIVE_PERIOD: Duration = Duration::from_secs(50);

/// Handle identifying one registered subscriber on one channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Body of an inbound frame as delivered to subscribers.
///
/// Bodies are best-effort JSON: a body that fails to parse is delivered as
/// the raw string rather than dropped.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    /// Parsed JSON body.
    Json(Value),
    /// Raw body text (JSON parse failed).
    Text(String),
}

type Subscriber = Arc<dyn Fn(&Payload) + Send + Sync>;
type CloseHandler = Arc<dyn Fn() + Send + Sync>;
type ErrorHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Multiplexes logical channels over one WebSocket connection.
///
/// Constructed by the transport layer (see [`crate::transport::attach`]);
/// all methods are callable from any task. The `closed` flag is set exactly
/// once, when the underlying socket closes, after which the owning factory
/// drops its cached reference so the next request builds a fresh bus.
pub struct MessageBus {
    outbound: mpsc::UnboundedSender<String>,
    subscriptions: Mutex<HashMap<String, Vec<(SubscriptionId, Subscriber)>>>,
    replies: Mutex<HashMap<String, oneshot::Sender<String>>>,
    close_handlers: Mutex<Vec<CloseHandler>>,
    error_handlers: Mutex<Vec<ErrorHandler>>,
    next_subscription: AtomicU64,
    closed: AtomicBool,
    /// Pinged by every inbound frame; restarts the keepalive timer.
    activity: Notify,
    /// Stops the keepalive task on close.
    shutdown: Notify,
}

impl MessageBus {
    /// Build a bus whose outgoing text frames go to `outbound`.
    pub(crate) fn new(outbound: mpsc::UnboundedSender<String>) -> Self {
        Self {
            outbound,
            subscriptions: Mutex::new(HashMap::new()),
            replies: Mutex::new(HashMap::new()),
            close_handlers: Mutex::new(Vec::new()),
            error_handlers: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            activity: Notify::new(),
            shutdown: Notify::new(),
        }
    }

    /// Register `callback` for `channel`.
    ///
    /// The first subscriber on a channel triggers exactly one wire
    /// subscribe frame; later subscribers piggyback on the existing wire
    /// subscription. Callbacks for one channel run in registration order.
    pub fn subscribe(
        &self,
        channel: &str,
        callback: impl Fn(&Payload) + Send + Sync + 'static,
    ) -> Result<SubscriptionId, BusError> {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        let first = {
            let mut subs = self.subscriptions.lock();
            let list = subs.entry(channel.to_owned()).or_default();
            list.push((id, Arc::new(callback)));
            list.len() == 1
        };
        if first {
            self.send(&Frame::subscribe(channel))?;
            debug!(channel, "subscribed channel on the wire");
        } else {
            trace!(channel, "added subscriber to existing channel");
        }
        Ok(id)
    }

    /// Remove one subscriber from `channel`.
    ///
    /// When the last subscriber leaves, the channel entry is dropped and
    /// exactly one wire unsubscribe frame is sent. Unknown channel or id is
    /// a no-op. Returns whether a wire unsubscribe frame went out.
    pub fn unsubscribe(&self, channel: &str, id: SubscriptionId) -> bool {
        let last = {
            let mut subs = self.subscriptions.lock();
            let Some(list) = subs.get_mut(channel) else {
                return false;
            };
            let before = list.len();
            list.retain(|(sub_id, _)| *sub_id != id);
            if list.len() == before {
                return false;
            }
            if list.is_empty() {
                let _ = subs.remove(channel);
                true
            } else {
                false
            }
        };
        if last {
            // The socket may already be gone; client-side cleanup stands.
            if let Err(e) = self.send(&Frame::unsubscribe(channel)) {
                debug!(channel, error = %e, "wire unsubscribe not sent");
            } else {
                debug!(channel, "unsubscribed channel on the wire");
            }
        }
        last
    }

    /// Number of subscribers currently registered for `channel`.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.subscriptions.lock().get(channel).map_or(0, Vec::len)
    }

    /// Serialize `frame` and hand it to the write half.
    pub fn send(&self, frame: &Frame) -> Result<(), BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        let text = frame.serialize()?;
        self.outbound.send(text).map_err(|_| BusError::Closed)
    }

    /// Send `frame` and wait for the reply frame bearing the same uuid.
    ///
    /// The reply is correlated by uuid on inbound frames that carry no
    /// routing channel. Fails with [`BusError::Closed`] if the connection
    /// closes before the reply arrives.
    pub async fn request(&self, frame: Frame) -> Result<String, BusError> {
        let (tx, rx) = oneshot::channel();
        let uuid = frame.uuid.clone();
        let _ = self.replies.lock().insert(uuid.clone(), tx);
        if let Err(e) = self.send(&frame) {
            let _ = self.replies.lock().remove(&uuid);
            return Err(e);
        }
        rx.await.map_err(|_| BusError::Closed)
    }

    /// Process one inbound text message.
    ///
    /// Restarts the keepalive timer, parses the frame, and routes it:
    /// channel frames fan out to subscribers, channel-less frames resolve a
    /// pending reply by uuid, and anything else is dropped silently.
    pub fn handle_message(&self, raw: &str) {
        self.activity.notify_one();
        let frame = match Frame::parse(raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "dropping malformed inbound frame");
                return;
            }
        };
        if let Some(channel) = frame.routing_channel().map(str::to_owned) {
            self.dispatch(&channel, &frame.body);
        } else if let Some(reply) = self.replies.lock().remove(&frame.uuid) {
            let _ = reply.send(frame.body);
        } else {
            debug!(uuid = %frame.uuid, "dropping unroutable inbound frame");
        }
    }

    /// Send a keepalive ping frame.
    pub fn ping(&self) -> Result<(), BusError> {
        trace!("sending keepalive ping");
        self.send(&Frame::ping())
    }

    /// Register a callback fired once when the underlying socket closes.
    pub fn on_close(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.close_handlers.lock().push(Arc::new(callback));
    }

    /// Register a callback fired on socket-level errors.
    pub fn on_error(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        self.error_handlers.lock().push(Arc::new(callback));
    }

    /// Whether the underlying socket has closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Fan the frame body out to every subscriber of `channel`, in
    /// registration order. Subscribers run outside the table lock so they
    /// may subscribe/unsubscribe re-entrantly.
    fn dispatch(&self, channel: &str, body: &str) {
        let subscribers: Vec<Subscriber> = self
            .subscriptions
            .lock()
            .get(channel)
            .map(|list| list.iter().map(|(_, s)| Arc::clone(s)).collect())
            .unwrap_or_default();
        if subscribers.is_empty() {
            debug!(channel, "no subscribers for inbound frame");
            return;
        }
        let payload = match serde_json::from_str::<Value>(body) {
            Ok(value) => Payload::Json(value),
            Err(_) => Payload::Text(body.to_owned()),
        };
        trace!(channel, subscribers = subscribers.len(), "dispatching inbound frame");
        for subscriber in subscribers {
            subscriber(&payload);
        }
    }

    /// Mark the bus closed (idempotent) and fire close callbacks.
    ///
    /// Stops the keepalive task, fails all pending replies, then invokes
    /// every registered close handler.
    pub(crate) fn mark_closed(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.notify_one();
        self.replies.lock().clear();
        debug!("message bus closed");
        let handlers: Vec<CloseHandler> = self.close_handlers.lock().iter().map(Arc::clone).collect();
        for handler in handlers {
            handler();
        }
    }

    /// Fire error callbacks with a socket-level error description.
    pub(crate) fn fire_error(&self, message: &str) {
        warn!(error = message, "socket error");
        let handlers: Vec<ErrorHandler> = self.error_handlers.lock().iter().map(Arc::clone).collect();
        for handler in handlers {
            handler(message);
        }
    }
}

/// Keepalive loop: ping after [`KEEPALIVE_PERIOD`] of inbound silence.
///
/// Each inbound frame restarts the countdown; the loop exits when the bus
/// closes so no timer outlives its connection.
pub(crate) async fn keepalive_loop(bus: Arc<MessageBus>) {
    loop {
        if bus.is_closed() {
            break;
        }
        tokio::select! {
            () = bus.activity.notified() => {}
            () = bus.shutdown.notified() => break,
            () = tokio::time::sleep(KEEPALIVE_PERIOD) => {
                if bus.ping().is_err() {
                    break;
                }
            }
        }
    }
    trace!("keepalive task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::channel_bus;
    use assert_matches::assert_matches;
    use loft_wire::frame::{CHANNEL_HEADER, MESSAGE_TYPE_HEADER, PING, SUBSCRIBE_CHANNEL, UNSUBSCRIBE_CHANNEL};
    use loft_wire::FrameBuilder;
    use serde_json::json;

    /// Wire frame addressed to `channel` carrying `body`.
    fn inbound(channel: &str, body: &str) -> String {
        FrameBuilder::new()
            .header(CHANNEL_HEADER, channel)
            .body(body)
            .build()
            .serialize()
            .unwrap()
    }

    fn frame_type(raw: &str) -> Option<String> {
        Frame::parse(raw).unwrap().header(MESSAGE_TYPE_HEADER).map(str::to_owned)
    }

    #[tokio::test]
    async fn first_subscribe_sends_one_wire_frame() {
        let (bus, mut rx) = channel_bus();
        let _a = bus.subscribe("entity:w1", |_| {}).unwrap();
        let _b = bus.subscribe("entity:w1", |_| {}).unwrap();

        let sent = rx.try_recv().unwrap();
        assert_eq!(frame_type(&sent).as_deref(), Some(SUBSCRIBE_CHANNEL));
        let body: Value = serde_json::from_str(&Frame::parse(&sent).unwrap().body).unwrap();
        assert_eq!(body["channel"], "entity:w1");
        // second subscriber produced no additional traffic
        assert!(rx.try_recv().is_err());
        assert_eq!(bus.subscriber_count("entity:w1"), 2);
    }

    #[tokio::test]
    async fn distinct_channels_subscribe_independently() {
        let (bus, mut rx) = channel_bus();
        let _a = bus.subscribe("entity:w1", |_| {}).unwrap();
        let _b = bus.subscribe("entity:w2", |_| {}).unwrap();
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_is_ref_counted() {
        let (bus, mut rx) = channel_bus();
        let a = bus.subscribe("entity:w1", |_| {}).unwrap();
        let b = bus.subscribe("entity:w1", |_| {}).unwrap();
        let _subscribe_frame = rx.try_recv().unwrap();

        // removing one of two subscribers sends nothing
        assert!(!bus.unsubscribe("entity:w1", a));
        assert!(rx.try_recv().is_err());
        assert_eq!(bus.subscriber_count("entity:w1"), 1);

        // removing the last sends exactly one unsubscribe frame
        assert!(bus.unsubscribe("entity:w1", b));
        let sent = rx.try_recv().unwrap();
        assert_eq!(frame_type(&sent).as_deref(), Some(UNSUBSCRIBE_CHANNEL));
        assert!(rx.try_recv().is_err());
        assert_eq!(bus.subscriber_count("entity:w1"), 0);
    }

    #[tokio::test]
    async fn unsubscribe_unknown_channel_is_noop() {
        let (bus, mut rx) = channel_bus();
        let id = bus.subscribe("entity:w1", |_| {}).unwrap();
        let _subscribe_frame = rx.try_recv().unwrap();

        assert!(!bus.unsubscribe("no-such-channel", id));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_stale_id_is_noop() {
        let (bus, mut rx) = channel_bus();
        let id = bus.subscribe("entity:w1", |_| {}).unwrap();
        let _subscribe_frame = rx.try_recv().unwrap();

        assert!(bus.unsubscribe("entity:w1", id));
        let _unsubscribe_frame = rx.try_recv().unwrap();
        // id no longer registered anywhere
        assert!(!bus.unsubscribe("entity:w1", id));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dispatch_fans_out_in_registration_order() {
        let (bus, _rx) = channel_bus();
        let calls = Arc::new(Mutex::new(Vec::new()));

        let c1 = Arc::clone(&calls);
        let _a = bus.subscribe("entity:w1", move |p| c1.lock().push((1, p.clone()))).unwrap();
        let c2 = Arc::clone(&calls);
        let _b = bus.subscribe("entity:w1", move |p| c2.lock().push((2, p.clone()))).unwrap();

        bus.handle_message(&inbound("entity:w1", r#"{"eventType":"RUNNING"}"#));

        let calls = calls.lock();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, 1);
        assert_eq!(calls[1].0, 2);
        assert_eq!(calls[0].1, Payload::Json(json!({"eventType": "RUNNING"})));
        assert_eq!(calls[0].1, calls[1].1);
    }

    #[tokio::test]
    async fn dispatch_skips_other_channels() {
        let (bus, _rx) = channel_bus();
        let calls = Arc::new(Mutex::new(0_u32));
        let c = Arc::clone(&calls);
        let _a = bus.subscribe("entity:w1", move |_| *c.lock() += 1).unwrap();

        bus.handle_message(&inbound("entity:w2", "{}"));
        assert_eq!(*calls.lock(), 0);

        bus.handle_message(&inbound("entity:w1", "{}"));
        assert_eq!(*calls.lock(), 1);
    }

    #[tokio::test]
    async fn unparseable_body_delivered_as_raw_text() {
        let (bus, _rx) = channel_bus();
        let seen = Arc::new(Mutex::new(None));
        let s = Arc::clone(&seen);
        let _a = bus.subscribe("entity:w1", move |p| *s.lock() = Some(p.clone())).unwrap();

        bus.handle_message(&inbound("entity:w1", "not { json"));
        assert_eq!(*seen.lock(), Some(Payload::Text("not { json".into())));
    }

    #[tokio::test]
    async fn duplicate_channel_headers_route_to_last() {
        let (bus, _rx) = channel_bus();
        let calls = Arc::new(Mutex::new(0_u32));
        let c = Arc::clone(&calls);
        let _a = bus.subscribe("fresh", move |_| *c.lock() += 1).unwrap();

        let raw = FrameBuilder::new()
            .header(CHANNEL_HEADER, "stale")
            .header(CHANNEL_HEADER, "fresh")
            .body("{}")
            .build()
            .serialize()
            .unwrap();
        bus.handle_message(&raw);
        assert_eq!(*calls.lock(), 1);
    }

    #[tokio::test]
    async fn single_type_header_routes_as_channel() {
        let (bus, _rx) = channel_bus();
        let calls = Arc::new(Mutex::new(0_u32));
        let c = Arc::clone(&calls);
        let _a = bus.subscribe(PING, move |_| *c.lock() += 1).unwrap();

        let raw = FrameBuilder::new()
            .header(MESSAGE_TYPE_HEADER, PING)
            .build()
            .serialize()
            .unwrap();
        bus.handle_message(&raw);
        assert_eq!(*calls.lock(), 1);
    }

    #[tokio::test]
    async fn malformed_and_unroutable_frames_are_dropped() {
        let (bus, _rx) = channel_bus();
        let calls = Arc::new(Mutex::new(0_u32));
        let c = Arc::clone(&calls);
        let _a = bus.subscribe("entity:w1", move |_| *c.lock() += 1).unwrap();

        bus.handle_message("not a frame at all");
        let unroutable = FrameBuilder::new()
            .header("content-type", "application/json")
            .build()
            .serialize()
            .unwrap();
        bus.handle_message(&unroutable);
        assert_eq!(*calls.lock(), 0);
    }

    #[tokio::test]
    async fn subscriber_may_unsubscribe_reentrantly() {
        let (bus, _rx) = channel_bus();
        let bus2 = Arc::clone(&bus);
        let slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));
        let slot2 = Arc::clone(&slot);
        let id = bus
            .subscribe("entity:w1", move |_| {
                if let Some(id) = slot2.lock().take() {
                    let _ = bus2.unsubscribe("entity:w1", id);
                }
            })
            .unwrap();
        *slot.lock() = Some(id);

        bus.handle_message(&inbound("entity:w1", "{}"));
        assert_eq!(bus.subscriber_count("entity:w1"), 0);
    }

    #[tokio::test]
    async fn request_resolves_on_matching_uuid() {
        let (bus, mut rx) = channel_bus();
        let frame = FrameBuilder::request("/api/workspace", "{}");
        let uuid = frame.uuid.clone();

        let bus2 = Arc::clone(&bus);
        let pending = tokio::spawn(async move { bus2.request(frame).await });
        tokio::task::yield_now().await;
        // request frame went out on the wire
        assert_eq!(Frame::parse(&rx.try_recv().unwrap()).unwrap().uuid, uuid);

        // an unrelated reply does not resolve it
        let unrelated = Frame {
            uuid: "someone-else".into(),
            method: "POST".into(),
            path: None,
            headers: vec![],
            body: "{}".into(),
        };
        bus.handle_message(&unrelated.serialize().unwrap());
        assert!(!pending.is_finished());

        let reply = Frame {
            uuid,
            method: "POST".into(),
            path: None,
            headers: vec![],
            body: r#"{"id":"w1"}"#.into(),
        };
        bus.handle_message(&reply.serialize().unwrap());
        let body = pending.await.unwrap().unwrap();
        assert_eq!(body, r#"{"id":"w1"}"#);
    }

    #[tokio::test]
    async fn request_fails_when_bus_closes() {
        let (bus, _rx) = channel_bus();
        let frame = FrameBuilder::request("/api/workspace", "{}");
        let bus2 = Arc::clone(&bus);
        let pending = tokio::spawn(async move { bus2.request(frame).await });
        tokio::task::yield_now().await;

        bus.mark_closed();
        assert_matches!(pending.await.unwrap(), Err(BusError::Closed));
    }

    #[tokio::test]
    async fn send_after_close_is_rejected() {
        let (bus, _rx) = channel_bus();
        bus.mark_closed();
        assert_matches!(bus.send(&Frame::ping()), Err(BusError::Closed));
        assert_matches!(bus.ping(), Err(BusError::Closed));
    }

    #[tokio::test]
    async fn close_is_observable_and_idempotent() {
        let (bus, _rx) = channel_bus();
        assert!(!bus.is_closed());

        let fired = Arc::new(Mutex::new(0_u32));
        let f = Arc::clone(&fired);
        bus.on_close(move || *f.lock() += 1);

        bus.mark_closed();
        bus.mark_closed();
        assert!(bus.is_closed());
        assert_eq!(*fired.lock(), 1);
    }

    #[tokio::test]
    async fn error_handlers_receive_description() {
        let (bus, _rx) = channel_bus();
        let seen = Arc::new(Mutex::new(None));
        let s = Arc::clone(&seen);
        bus.on_error(move |msg| *s.lock() = Some(msg.to_owned()));

        bus.fire_error("connection reset by peer");
        assert_eq!(seen.lock().as_deref(), Some("connection reset by peer"));
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_pings_after_idle_period() {
        let (bus, mut rx) = channel_bus();
        let task = tokio::spawn(keepalive_loop(Arc::clone(&bus)));
        tokio::task::yield_now().await;

        tokio::time::advance(KEEPALIVE_PERIOD).await;
        tokio::task::yield_now().await;

        let sent = rx.try_recv().unwrap();
        assert_eq!(frame_type(&sent).as_deref(), Some(PING));
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_restarts_on_inbound_frame() {
        let (bus, mut rx) = channel_bus();
        let task = tokio::spawn(keepalive_loop(Arc::clone(&bus)));
        tokio::task::yield_now().await;

        // 30s of idle, then an inbound frame restarts the countdown
        tokio::time::advance(Duration::from_secs(30)).await;
        tokio::task::yield_now().await;
        bus.handle_message(&inbound("entity:w1", "{}"));
        tokio::task::yield_now().await;

        // 50s from bus start but only 30s since the frame: no ping yet
        tokio::time::advance(Duration::from_secs(30)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());

        // a full idle period after the frame: ping goes out
        tokio::time::advance(Duration::from_secs(25)).await;
        tokio::task::yield_now().await;
        let sent = rx.try_recv().unwrap();
        assert_eq!(frame_type(&sent).as_deref(), Some(PING));
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_stops_on_close() {
        let (bus, mut rx) = channel_bus();
        let task = tokio::spawn(keepalive_loop(Arc::clone(&bus)));
        tokio::task::yield_now().await;

        bus.mark_closed();
        tokio::task::yield_now().await;
        assert!(task.is_finished());

        tokio::time::advance(KEEPALIVE_PERIOD).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }
}
