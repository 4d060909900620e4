//! Error type shared by every mediaweave object.
//!
//! Each variant is a distinguishable outcome callers are expected to match on.
//! Synchronous contract and sequencing failures come back from the call itself;
//! negotiation and runtime failures travel in an [`Event`](crate::Event)'s status.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MediaError {
    // === Contract and sequencing ===
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("request is not valid in the current state")]
    InvalidRequest,

    #[error("object has been shut down")]
    Shutdown,

    #[error("operation not implemented")]
    NotImplemented,

    // === Event queue ===
    #[error("no events available")]
    NoEventsAvailable,

    #[error("callback already registered with a different state")]
    MultipleBegin,

    #[error("a different callback is already registered")]
    MultipleSubscribers,

    // === Clock and rate ===
    #[error("clock has no time source")]
    NoTimeSource,

    #[error("clock is already in the requested state")]
    ClockStateAlreadySet,

    #[error("thinning is not supported")]
    ThinningUnsupported,

    #[error("rate not supported, nearest supported rate is {nearest}")]
    UnsupportedRate { nearest: f32 },

    #[error("no presentation clock")]
    NoClock,

    // === Media types ===
    #[error("media type handler is not initialized")]
    NotInitialized,

    #[error("media type not set")]
    TypeNotSet,

    #[error("invalid media type")]
    InvalidMediaType,

    #[error("no more types")]
    NoMoreTypes,

    // === Topology ===
    #[error("topology node {0} has no source")]
    TopoMissingSource(Uuid),

    #[error("topology node {0} has no presentation or stream descriptor")]
    TopoMissingDescriptor(Uuid),

    #[error("topology node {0} has no sink")]
    TopoMissingSink(Uuid),

    #[error("stream on node {0} is not selected")]
    StreamNotSelected(Uuid),

    #[error("topology is not supported: {0}")]
    TopoUnsupported(&'static str),

    #[error("no transform can connect the requested types")]
    TopoCodecNotFound,

    #[error("node not found: {0}")]
    NodeNotFound(Uuid),

    #[error("edge not found between {from} and {to}")]
    EdgeNotFound { from: Uuid, to: Uuid },

    #[error("cycle detected in topology")]
    CycleDetected,

    // === Playback ===
    #[error("position is out of range")]
    OutOfRange,

    #[error("time format not supported")]
    UnsupportedTimeFormat,

    #[error("source failed: {0}")]
    SourceFailed(String),
}

pub type MediaResult<T> = std::result::Result<T, MediaError>;
