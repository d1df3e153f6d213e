//! tokio-tungstenite glue around a [`MessageBus`].
//!
//! [`attach`] takes any WebSocket stream, splits it, and spawns the three
//! tasks a live bus needs: a writer draining the outbound queue, a reader
//! feeding inbound text into [`MessageBus::handle_message`], and the
//! keepalive timer. The reader owns teardown: whatever ends the stream,
//! it marks the bus closed on the way out.

use std::sync::Arc;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, trace};

use crate::bus::{keepalive_loop, MessageBus};
use crate::errors::BusError;

/// Wrap an already-established WebSocket stream in a [`MessageBus`].
///
/// Works for both client and server ends; the caller keeps responsibility
/// for whatever handshake produced the stream.
pub fn attach<S>(stream: S) -> Arc<MessageBus>
where
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin + Send + 'static,
{
    let (mut sink, mut source) = stream.split();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    let bus = Arc::new(MessageBus::new(outbound));

    let writer_bus = Arc::clone(&bus);
    let _ = tokio::spawn(async move {
        while let Some(text) = outbound_rx.recv().await {
            if let Err(e) = sink.send(Message::text(text)).await {
                writer_bus.fire_error(&e.to_string());
                break;
            }
        }
        trace!("write task stopped");
    });

    let reader_bus = Arc::clone(&bus);
    let _ = tokio::spawn(async move {
        while let Some(next) = source.next().await {
            match next {
                Ok(Message::Text(text)) => reader_bus.handle_message(text.as_str()),
                Ok(Message::Close(_)) => {
                    debug!("peer closed the websocket");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    reader_bus.fire_error(&e.to_string());
                    break;
                }
            }
        }
        reader_bus.mark_closed();
        trace!("read task stopped");
    });

    let _ = tokio::spawn(keepalive_loop(Arc::clone(&bus)));

    bus
}

/// Dial `url` and wrap the resulting socket in a [`MessageBus`].
pub async fn connect(url: &str) -> Result<Arc<MessageBus>, BusError> {
    debug!(url, "connecting websocket");
    let (stream, _response) = connect_async(url).await?;
    Ok(attach(stream))
}
