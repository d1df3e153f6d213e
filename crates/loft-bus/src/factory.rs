//! Lazy connection factory for the default and remote message buses.
//!
//! Buses are created on first request and cached while live. When a cached
//! bus closes, its close callback clears the cache slot, so the next
//! request dials a fresh connection instead of handing out a dead bus.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::bus::MessageBus;
use crate::config::BusConfig;
use crate::errors::BusError;
use crate::transport;

type Slot = Arc<Mutex<Option<Arc<MessageBus>>>>;

/// Produces and caches [`MessageBus`] instances.
///
/// One slot holds the default bus (URL derived from [`BusConfig`]); a
/// second holds the most recently requested remote bus. Cloning the
/// factory shares both slots.
#[derive(Clone)]
pub struct BusFactory {
    config: BusConfig,
    default_slot: Slot,
    remote_slot: Arc<Mutex<Option<(String, Arc<MessageBus>)>>>,
}

impl BusFactory {
    /// Factory connecting per `config`.
    #[must_use]
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            default_slot: Arc::new(Mutex::new(None)),
            remote_slot: Arc::new(Mutex::new(None)),
        }
    }

    /// The configuration this factory dials with.
    #[must_use]
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// WebSocket URL the default bus connects to.
    pub fn default_url(&self) -> Result<String, BusError> {
        Ok(self.config.url()?.to_string())
    }

    /// The default bus, dialing it first if none is live.
    ///
    /// Concurrent callers racing past an empty slot may dial twice; the
    /// later connection wins the slot and the loser is dropped, closing
    /// its socket.
    pub async fn get_bus(&self) -> Result<Arc<MessageBus>, BusError> {
        if let Some(bus) = self.default_slot.lock().as_ref() {
            if !bus.is_closed() {
                return Ok(Arc::clone(bus));
            }
        }
        let url = self.default_url()?;
        debug!(url, "dialing default bus");
        let bus = transport::connect(&url).await?;
        self.install(&bus);
        Ok(bus)
    }

    /// A bus for an explicit remote `url`, dialing it first if needed.
    ///
    /// Only the most recent remote URL is cached: asking for a different
    /// URL dials a new bus and replaces the cached one without closing it.
    pub async fn get_remote_bus(&self, url: &str) -> Result<Arc<MessageBus>, BusError> {
        if let Some((cached_url, bus)) = self.remote_slot.lock().as_ref() {
            if cached_url == url && !bus.is_closed() {
                return Ok(Arc::clone(bus));
            }
        }
        debug!(url, "dialing remote bus");
        let bus = transport::connect(url).await?;
        {
            let slot = Arc::clone(&self.remote_slot);
            let weak = Arc::downgrade(&bus);
            bus.on_close(move || {
                let mut guard = slot.lock();
                let ours = matches!(
                    (&*guard, weak.upgrade()),
                    (Some((_, cached)), Some(bus)) if Arc::ptr_eq(cached, &bus)
                );
                if ours {
                    *guard = None;
                }
            });
        }
        let evicted = self.remote_slot.lock().replace((url.to_owned(), Arc::clone(&bus)));
        if let Some((old_url, _)) = evicted {
            warn!(old_url, "evicting previous remote bus from cache");
        }
        Ok(bus)
    }

    /// Wrap an externally-established WebSocket stream in a bus.
    ///
    /// The result is not cached; the caller owns its lifecycle.
    pub fn get_existing_bus<S>(&self, stream: S) -> Arc<MessageBus>
    where
        S: futures::Stream<Item = Result<tokio_tungstenite::tungstenite::Message, tokio_tungstenite::tungstenite::Error>>
            + futures::Sink<tokio_tungstenite::tungstenite::Message, Error = tokio_tungstenite::tungstenite::Error>
            + Unpin
            + Send
            + 'static,
    {
        transport::attach(stream)
    }

    /// Cache `bus` as the default and arrange for its slot to empty on
    /// close. The close hook compares identities so it never evicts a
    /// replacement bus installed after this one died.
    pub(crate) fn install(&self, bus: &Arc<MessageBus>) {
        let slot = Arc::clone(&self.default_slot);
        let weak = Arc::downgrade(bus);
        bus.on_close(move || {
            let mut guard = slot.lock();
            let ours = matches!(
                (&*guard, weak.upgrade()),
                (Some(cached), Some(bus)) if Arc::ptr_eq(cached, &bus)
            );
            if ours {
                *guard = None;
            }
        });
        *self.default_slot.lock() = Some(Arc::clone(bus));
    }

    #[cfg(test)]
    fn cached_default(&self) -> Option<Arc<MessageBus>> {
        self.default_slot.lock().clone()
    }
}
