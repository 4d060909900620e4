//! Events, asynchronous callbacks, and the event generator contract.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::MediaResult;
use crate::value::Value;

/// Event type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Error,
    NonFatalError,

    // Session
    SessionTopologySet,
    SessionTopologiesCleared,
    SessionTopologyStatus,
    SessionStarted,
    SessionPaused,
    SessionStopped,
    SessionClosed,
    SessionEnded,
    SessionRateChanged,
    SessionCapabilitiesChanged,

    // Source
    SourceStarted,
    SourceSeeked,
    SourcePaused,
    SourceStopped,
    EndOfPresentation,
    NewStream,
}

/// Progress of a topology through the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopologyStatus {
    Invalid,
    /// Resolved and ready to start.
    Ready,
    /// Playback of this topology has begun.
    StartedSource,
    /// Every source of this topology has ended.
    Ended,
}

/// One queued event: type, extended type, status, payload.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub extended_type: Uuid,
    pub status: MediaResult<()>,
    pub value: Value,
    /// Set on `SessionTopologyStatus` events.
    pub topology_status: Option<TopologyStatus>,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            extended_type: Uuid::nil(),
            status: Ok(()),
            value: Value::Empty,
            topology_status: None,
        }
    }

    pub fn with_status(mut self, status: MediaResult<()>) -> Self {
        self.status = status;
        self
    }

    pub fn with_value(mut self, value: impl Into<Value>) -> Self {
        self.value = value.into();
        self
    }

    pub fn with_extended_type(mut self, extended_type: Uuid) -> Self {
        self.extended_type = extended_type;
        self
    }

    pub fn with_topology_status(mut self, status: TopologyStatus) -> Self {
        self.topology_status = Some(status);
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }
}

// =============================================================================
// ASYNC CALLBACKS
// =============================================================================

/// Opaque caller state handed back with an [`AsyncResult`]. Compared by identity.
pub type CallbackState = Arc<dyn Any + Send + Sync>;

/// Receiver of asynchronous completions.
///
/// Invocations happen on a dispatcher thread, never on the thread that
/// triggered them. An implementation must not call back into the synchronous
/// `get_event` of the queue that invoked it.
pub trait AsyncCallback: Send + Sync {
    fn invoke(&self, result: AsyncResult);
}

impl<F> AsyncCallback for F
where
    F: Fn(AsyncResult) + Send + Sync,
{
    fn invoke(&self, result: AsyncResult) {
        self(result)
    }
}

/// Handle passed to a callback and redeemed with `end_get_event`.
#[derive(Clone)]
pub struct AsyncResult {
    pub(crate) queue_id: u64,
    pub(crate) ticket: u64,
    callback: Arc<dyn AsyncCallback>,
    state: Option<CallbackState>,
}

impl AsyncResult {
    pub(crate) fn new(
        queue_id: u64,
        ticket: u64,
        callback: Arc<dyn AsyncCallback>,
        state: Option<CallbackState>,
    ) -> Self {
        Self {
            queue_id,
            ticket,
            callback,
            state,
        }
    }

    pub fn state(&self) -> Option<&CallbackState> {
        self.state.as_ref()
    }

    /// Downcast the caller state.
    pub fn state_as<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.state.as_ref()?.downcast_ref::<T>()
    }

    pub fn callback(&self) -> &Arc<dyn AsyncCallback> {
        &self.callback
    }
}

impl fmt::Debug for AsyncResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncResult")
            .field("queue_id", &self.queue_id)
            .field("ticket", &self.ticket)
            .field("has_state", &self.state.is_some())
            .finish()
    }
}

pub(crate) fn same_callback(a: &Arc<dyn AsyncCallback>, b: &Arc<dyn AsyncCallback>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

pub(crate) fn same_state(a: &Option<CallbackState>, b: &Option<CallbackState>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const (),
        _ => false,
    }
}

/// Successful outcomes of `begin_get_event`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeginOutcome {
    Registered,
    /// The identical callback and state were already registered; the earlier
    /// registration stands.
    AlreadyRegistered,
}

/// How `get_event` behaves on an empty queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GetEventFlags {
    #[default]
    Blocking,
    NoWait,
}

/// Anything that hands out events through an [`EventQueue`](crate::EventQueue).
pub trait MediaEventGenerator: Send + Sync {
    fn begin_get_event(
        &self,
        callback: Arc<dyn AsyncCallback>,
        state: Option<CallbackState>,
    ) -> MediaResult<BeginOutcome>;

    fn end_get_event(&self, result: &AsyncResult) -> MediaResult<Event>;

    fn get_event(&self, flags: GetEventFlags) -> MediaResult<Event>;

    fn queue_event(&self, event: Event) -> MediaResult<()>;
}
