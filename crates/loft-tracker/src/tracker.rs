//! Workspace status tracking and status-wait futures.
//!
//! Tracking a workspace subscribes its `entity:<id>` channel on the bus.
//! Each inbound status event is folded into a local status through
//! [`WorkspaceStatus::from_event`], and every waiter registered for that
//! derived status resolves with the full event payload. Waiters are
//! one-shot: resolving a status clears its waiter list.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use loft_bus::{MessageBus, Payload, SubscriptionId};
use loft_wire::{StatusEvent, WorkspaceStatus};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::errors::TrackerError;

/// Channel name prefix for per-workspace status channels.
pub const STATUS_CHANNEL_PREFIX: &str = "entity:";

/// Bus channel carrying status events for the given workspace.
#[must_use]
pub fn status_channel(workspace_id: &str) -> String {
    format!("{STATUS_CHANNEL_PREFIX}{workspace_id}")
}

struct TrackedWorkspace {
    status: Option<WorkspaceStatus>,
    subscription: Option<SubscriptionId>,
    waiters: HashMap<WorkspaceStatus, Vec<oneshot::Sender<StatusEvent>>>,
}

impl TrackedWorkspace {
    fn new(initial: Option<WorkspaceStatus>) -> Self {
        Self {
            status: initial,
            subscription: None,
            waiters: HashMap::new(),
        }
    }
}

type State = Arc<Mutex<HashMap<String, TrackedWorkspace>>>;

/// Tracks workspace statuses over a shared message bus.
///
/// Clones share the same tracking table and bus. Workspaces stay tracked
/// until [`WorkspaceTracker::stop_tracking`]; there is no terminal status.
#[derive(Clone)]
pub struct WorkspaceTracker {
    bus: Arc<MessageBus>,
    state: State,
}

impl WorkspaceTracker {
    /// Tracker multiplexing over `bus`.
    #[must_use]
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self {
            bus,
            state: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start tracking `workspace_id`, seeding its local status with
    /// `initial` when known.
    ///
    /// Idempotent: tracking an already-tracked workspace changes nothing
    /// and produces no wire traffic. The record is registered before the
    /// channel subscription so an event arriving mid-call finds it.
    pub fn track(
        &self,
        workspace_id: &str,
        initial: Option<WorkspaceStatus>,
    ) -> Result<(), TrackerError> {
        {
            let mut state = self.state.lock();
            if state.contains_key(workspace_id) {
                trace!(workspace_id, "already tracked");
                return Ok(());
            }
            let _ = state.insert(workspace_id.to_owned(), TrackedWorkspace::new(initial));
        }

        let channel = status_channel(workspace_id);
        let handler_state = Arc::clone(&self.state);
        let handler_id = workspace_id.to_owned();
        let subscription = match self.bus.subscribe(&channel, move |payload| {
            on_status_payload(&handler_state, &handler_id, payload);
        }) {
            Ok(id) => id,
            Err(e) => {
                let _ = self.state.lock().remove(workspace_id);
                return Err(e.into());
            }
        };

        if let Some(record) = self.state.lock().get_mut(workspace_id) {
            record.subscription = Some(subscription);
        }
        debug!(workspace_id, channel, "tracking workspace");
        Ok(())
    }

    /// Stop tracking `workspace_id`.
    ///
    /// Drops the channel subscription and fails any outstanding waits with
    /// [`TrackerError::Abandoned`]. Returns whether the workspace was
    /// tracked. No-op for unknown ids.
    pub fn stop_tracking(&self, workspace_id: &str) -> bool {
        let Some(record) = self.state.lock().remove(workspace_id) else {
            return false;
        };
        if let Some(subscription) = record.subscription {
            let _ = self.bus.unsubscribe(&status_channel(workspace_id), subscription);
        }
        debug!(workspace_id, "stopped tracking workspace");
        // dropping the record drops its waiter senders, failing the waits
        true
    }

    /// Whether `workspace_id` is currently tracked.
    #[must_use]
    pub fn is_tracking(&self, workspace_id: &str) -> bool {
        self.state.lock().contains_key(workspace_id)
    }

    /// Last known status of `workspace_id`, if tracked and seen.
    #[must_use]
    pub fn status(&self, workspace_id: &str) -> Option<WorkspaceStatus> {
        self.state.lock().get(workspace_id).and_then(|r| r.status)
    }

    /// Wait until `workspace_id` reaches `target`.
    ///
    /// Resolves immediately (without an event payload) when the workspace
    /// is already at `target`; otherwise the wait resolves with the status
    /// event that caused the transition. Waiting on an untracked workspace
    /// fails with [`TrackerError::Abandoned`], as does stopping tracking
    /// while the wait is outstanding.
    #[must_use]
    pub fn wait_for_status(&self, workspace_id: &str, target: WorkspaceStatus) -> StatusWait {
        let mut state = self.state.lock();
        let Some(record) = state.get_mut(workspace_id) else {
            warn!(workspace_id, "status wait on untracked workspace");
            return StatusWait(WaitInner::Untracked);
        };
        if record.status == Some(target) {
            return StatusWait(WaitInner::AlreadyThere);
        }
        let (tx, rx) = oneshot::channel();
        record.waiters.entry(target).or_default().push(tx);
        trace!(workspace_id, target = %target, "registered status waiter");
        StatusWait(WaitInner::Pending(rx))
    }
}

/// Fold one inbound payload into the tracking table and resolve waiters.
fn on_status_payload(state: &State, workspace_id: &str, payload: &Payload) {
    let Payload::Json(value) = payload else {
        warn!(workspace_id, "ignoring non-json status payload");
        return;
    };
    let event: StatusEvent = match serde_json::from_value(value.clone()) {
        Ok(event) => event,
        Err(e) => {
            warn!(workspace_id, error = %e, "ignoring malformed status event");
            return;
        }
    };
    let Some(status) = WorkspaceStatus::from_event(&event) else {
        trace!(workspace_id, event_type = %event.event_type, "event implies no status change");
        return;
    };

    let resolved = {
        let mut state = state.lock();
        let Some(record) = state.get_mut(workspace_id) else {
            // unsubscribe raced the last event; nothing to update
            return;
        };
        record.status = Some(status);
        record.waiters.remove(&status).unwrap_or_default()
    };
    debug!(workspace_id, status = %status, waiters = resolved.len(), "workspace status updated");
    for waiter in resolved {
        let _ = waiter.send(event.clone());
    }
}

enum WaitInner {
    /// The workspace was already at the target status.
    AlreadyThere,
    /// The workspace was not tracked when the wait was created.
    Untracked,
    /// Waiting for the transition event.
    Pending(oneshot::Receiver<StatusEvent>),
}

/// Future returned by [`WorkspaceTracker::wait_for_status`].
///
/// Yields the transition event, or `None` when the workspace was already
/// at the target status at wait time.
pub struct StatusWait(WaitInner);

impl Future for StatusWait {
    type Output = Result<Option<StatusEvent>, TrackerError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.0 {
            WaitInner::AlreadyThere => Poll::Ready(Ok(None)),
            WaitInner::Untracked => Poll::Ready(Err(TrackerError::Abandoned)),
            WaitInner::Pending(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(event)) => Poll::Ready(Ok(Some(event))),
                Poll::Ready(Err(_)) => Poll::Ready(Err(TrackerError::Abandoned)),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}
