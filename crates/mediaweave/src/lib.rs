//! Mediaweave: media pipeline orchestration
//!
//! The control core of a media pipeline. It does not touch samples; it
//! decides which objects talk to each other and when.
//!
//! - **Event queues**: per-object FIFO of typed events with one async
//!   subscriber or synchronous readers
//! - **Presentation clock**: transport state, rate and timers over a
//!   pluggable time source, fanned out to clock state sinks
//! - **Topology**: graph of source streams, transforms, tees and outputs,
//!   validated and resolved by negotiating media types
//! - **Session**: serialized command processing for set topology, start,
//!   pause, stop, close and shutdown, with every outcome posted as an event

pub mod clock;
pub mod descriptor;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod event_queue;
pub mod media_type;
pub mod rate;
pub mod resolver;
pub mod session;
pub mod sink;
pub mod source;
pub mod time;
pub mod topology;
pub mod transform;
pub mod value;

pub use clock::{
    ClockCharacteristics, ClockProperties, ClockState, ClockStateSink, PresentationClock,
    PresentationTimeSource, ShutdownStatus, SystemTimeSource, TimerFlags, TimerKey,
};
pub use descriptor::{
    MediaTypeHandler, PresentationDescriptor, StreamDescriptor, StreamTypeHandler,
};
pub use dispatch::Dispatcher;
pub use error::{MediaError, MediaResult};
pub use event::{
    AsyncCallback, AsyncResult, BeginOutcome, CallbackState, Event, EventKind, GetEventFlags,
    MediaEventGenerator, TopologyStatus,
};
pub use event_queue::EventQueue;
pub use media_type::{AttrValue, MatchFlags, MediaType};
pub use rate::{BoundedRateSupport, RateControl, RateDirection, RateSupport};
pub use resolver::TopologyResolver;
pub use session::{Session, SessionCapabilities, SessionState, SetTopologyFlags};
pub use sink::{MediaSink, SinkCharacteristics, StreamSink};
pub use source::{MediaSource, SourceCharacteristics};
pub use time::{MediaTime, StartPosition, TimeFormat};
pub use topology::{
    ConnectMethod, Edge, NodeKind, NodeObject, Topology, TopologyNode, TopologySnapshot,
};
pub use transform::{
    TableTransform, Transform, TransformCategory, TransformFactory, TransformRegistration,
    TransformRegistry, TypeInfo,
};
pub use value::Value;
