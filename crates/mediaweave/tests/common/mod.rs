//! Fake collaborators shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use mediaweave::media_type::{attr, subtype};
use mediaweave::{
    AsyncCallback, AsyncResult, AttrValue, BeginOutcome, CallbackState, ClockStateSink, Event, EventKind,
    EventQueue, GetEventFlags, MediaError, MediaEventGenerator, MediaResult, MediaSink,
    MediaSource, MediaTime, MediaType, MediaTypeHandler, PresentationClock,
    PresentationDescriptor, RateSupport, Session, SinkCharacteristics, SourceCharacteristics,
    StartPosition, StreamDescriptor, StreamSink, StreamTypeHandler, TimeFormat, Topology,
    TopologyNode,
};
use parking_lot::Mutex;

// =============================================================================
// SOURCE
// =============================================================================

/// How a [`FakeSource`] answers requests.
#[derive(Debug, Clone, Default)]
pub struct SourceBehavior {
    /// `start` fails synchronously with this error.
    pub refuse_start: Option<MediaError>,
    /// `SourceStarted` carries this failure status.
    pub start_status: Option<MediaError>,
    /// `begin_get_event` fails with invalid request.
    pub refuse_subscribe: bool,
    /// Post `EndOfPresentation` right after starting.
    pub end_after_start: bool,
    /// Never acknowledge `pause`.
    pub silent_pause: bool,
    /// Never acknowledge `start`.
    pub silent_start: bool,
}

/// Source with one stream that acknowledges transport requests through its
/// event queue.
pub struct FakeSource {
    events: EventQueue,
    descriptor: Arc<PresentationDescriptor>,
    characteristics: SourceCharacteristics,
    pub behavior: Mutex<SourceBehavior>,
    pub starts: AtomicUsize,
    pub pauses: AtomicUsize,
    pub stops: AtomicUsize,
}

impl FakeSource {
    pub fn new(media_type: MediaType) -> Arc<Self> {
        Self::with_characteristics(
            media_type,
            SourceCharacteristics::CAN_SEEK | SourceCharacteristics::CAN_PAUSE,
        )
    }

    pub fn with_characteristics(media_type: MediaType, characteristics: SourceCharacteristics) -> Arc<Self> {
        let stream = StreamDescriptor::new(1, Arc::new(StreamTypeHandler::with_current(media_type)));
        let descriptor = PresentationDescriptor::new(vec![stream]);
        descriptor.select_stream(0).unwrap();
        Arc::new(Self {
            events: EventQueue::new().unwrap(),
            descriptor: Arc::new(descriptor),
            characteristics,
            behavior: Mutex::new(SourceBehavior::default()),
            starts: AtomicUsize::new(0),
            pauses: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        })
    }

    pub fn descriptor(&self) -> Arc<PresentationDescriptor> {
        Arc::clone(&self.descriptor)
    }

    pub fn set_duration(&self, duration: MediaTime) {
        self.descriptor.set_duration(Some(duration));
    }

    pub fn behave(&self, behavior: SourceBehavior) {
        *self.behavior.lock() = behavior;
    }
}

impl MediaEventGenerator for FakeSource {
    fn begin_get_event(
        &self,
        callback: Arc<dyn AsyncCallback>,
        state: Option<CallbackState>,
    ) -> MediaResult<BeginOutcome> {
        if self.behavior.lock().refuse_subscribe {
            return Err(MediaError::InvalidRequest);
        }
        self.events.begin_get_event(callback, state)
    }

    fn end_get_event(&self, result: &AsyncResult) -> MediaResult<Event> {
        self.events.end_get_event(result)
    }

    fn get_event(&self, flags: GetEventFlags) -> MediaResult<Event> {
        self.events.get_event(flags)
    }

    fn queue_event(&self, event: Event) -> MediaResult<()> {
        self.events.queue_event(event)
    }
}

impl MediaSource for FakeSource {
    fn characteristics(&self) -> MediaResult<SourceCharacteristics> {
        Ok(self.characteristics)
    }

    fn create_presentation_descriptor(&self) -> MediaResult<Arc<PresentationDescriptor>> {
        Ok(Arc::new(self.descriptor.clone_descriptor()))
    }

    fn start(
        &self,
        _descriptor: &PresentationDescriptor,
        _time_format: TimeFormat,
        position: StartPosition,
    ) -> MediaResult<()> {
        let behavior = self.behavior.lock().clone();
        if let Some(e) = behavior.refuse_start {
            return Err(e);
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        if behavior.silent_start {
            return Ok(());
        }

        let kind = match position {
            StartPosition::Current => EventKind::SourceStarted,
            StartPosition::At(_) => EventKind::SourceSeeked,
        };
        let status = match behavior.start_status {
            Some(e) => Err(e),
            None => Ok(()),
        };
        self.events.queue_event(Event::new(kind).with_status(status))?;
        if behavior.end_after_start {
            self.events.queue_event(Event::new(EventKind::EndOfPresentation))?;
        }
        Ok(())
    }

    fn stop(&self) -> MediaResult<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.events.queue_event(Event::new(EventKind::SourceStopped))
    }

    fn pause(&self) -> MediaResult<()> {
        self.pauses.fetch_add(1, Ordering::SeqCst);
        if self.behavior.lock().silent_pause {
            return Ok(());
        }
        self.events.queue_event(Event::new(EventKind::SourcePaused))
    }

    fn shutdown(&self) -> MediaResult<()> {
        self.events.shutdown();
        Ok(())
    }
}

// =============================================================================
// SINK
// =============================================================================

/// Single-stream sink recording what the session and clock did to it.
pub struct FakeSink {
    this: Weak<FakeSink>,
    handler: Arc<dyn MediaTypeHandler>,
    rate_support: Option<Arc<dyn RateSupport>>,
    clock: Mutex<Option<Arc<PresentationClock>>>,
    pub notifications: Mutex<Vec<&'static str>>,
    pub shutdowns: AtomicUsize,
}

impl FakeSink {
    pub fn accepting(types: Vec<MediaType>) -> Arc<Self> {
        Self::with_handler(Arc::new(StreamTypeHandler::new(types)), None)
    }

    pub fn with_handler(
        handler: Arc<dyn MediaTypeHandler>,
        rate_support: Option<Arc<dyn RateSupport>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            handler,
            rate_support,
            clock: Mutex::new(None),
            notifications: Mutex::new(Vec::new()),
            shutdowns: AtomicUsize::new(0),
        })
    }

    pub fn handler(&self) -> Arc<dyn MediaTypeHandler> {
        Arc::clone(&self.handler)
    }

    pub fn clock(&self) -> Option<Arc<PresentationClock>> {
        self.clock.lock().clone()
    }

    pub fn notifications(&self) -> Vec<&'static str> {
        self.notifications.lock().clone()
    }

    fn arc(&self) -> MediaResult<Arc<FakeSink>> {
        self.this.upgrade().ok_or(MediaError::Shutdown)
    }

    fn note(&self, what: &'static str) -> MediaResult<()> {
        self.notifications.lock().push(what);
        Ok(())
    }
}

impl StreamSink for FakeSink {
    fn media_sink(&self) -> MediaResult<Arc<dyn MediaSink>> {
        Ok(self.arc()?)
    }

    fn media_type_handler(&self) -> MediaResult<Arc<dyn MediaTypeHandler>> {
        Ok(Arc::clone(&self.handler))
    }

    fn identifier(&self) -> MediaResult<u32> {
        Ok(0)
    }
}

impl MediaSink for FakeSink {
    fn characteristics(&self) -> MediaResult<SinkCharacteristics> {
        Ok(SinkCharacteristics::FIXED_STREAMS)
    }

    fn stream_sink_count(&self) -> MediaResult<usize> {
        Ok(1)
    }

    fn stream_sink_by_index(&self, index: usize) -> MediaResult<Arc<dyn StreamSink>> {
        if index != 0 {
            return Err(MediaError::InvalidArgument("one stream"));
        }
        Ok(self.arc()?)
    }

    fn stream_sink_by_id(&self, identifier: u32) -> MediaResult<Arc<dyn StreamSink>> {
        self.stream_sink_by_index(identifier as usize)
    }

    fn set_presentation_clock(&self, clock: Option<Arc<PresentationClock>>) -> MediaResult<()> {
        *self.clock.lock() = clock;
        Ok(())
    }

    fn clock_state_sink(&self) -> Option<Arc<dyn ClockStateSink>> {
        self.this.upgrade().map(|sink| sink as Arc<dyn ClockStateSink>)
    }

    fn rate_support(&self) -> Option<Arc<dyn RateSupport>> {
        self.rate_support.clone()
    }

    fn shutdown(&self) -> MediaResult<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl ClockStateSink for FakeSink {
    fn on_clock_start(&self, _system_time: MediaTime, _start: StartPosition) -> MediaResult<()> {
        self.note("start")
    }

    fn on_clock_stop(&self, _system_time: MediaTime) -> MediaResult<()> {
        self.note("stop")
    }

    fn on_clock_pause(&self, _system_time: MediaTime) -> MediaResult<()> {
        self.note("pause")
    }

    fn on_clock_restart(&self, _system_time: MediaTime) -> MediaResult<()> {
        self.note("restart")
    }

    fn on_clock_set_rate(&self, _system_time: MediaTime, _rate: f32) -> MediaResult<()> {
        self.note("rate")
    }
}

// =============================================================================
// COUNTING HANDLER
// =============================================================================

/// Type handler that counts how often a current type is set or its
/// candidates are enumerated, and can be told to refuse types.
pub struct CountingHandler {
    inner: StreamTypeHandler,
    /// Accept any type not refused, even with nothing listed.
    accept_any: bool,
    refused: Mutex<Vec<MediaType>>,
    /// Number of upcoming `set_current_media_type` calls to reject.
    reject_sets: AtomicUsize,
    pub sets: AtomicUsize,
    pub enumerations: AtomicUsize,
}

impl CountingHandler {
    pub fn new(types: Vec<MediaType>) -> Arc<Self> {
        Self::build(types, false)
    }

    /// Handler listing nothing that takes any type it does not refuse.
    pub fn open() -> Arc<Self> {
        Self::build(Vec::new(), true)
    }

    fn build(types: Vec<MediaType>, accept_any: bool) -> Arc<Self> {
        Arc::new(Self {
            inner: StreamTypeHandler::new(types),
            accept_any,
            refused: Mutex::new(Vec::new()),
            reject_sets: AtomicUsize::new(0),
            sets: AtomicUsize::new(0),
            enumerations: AtomicUsize::new(0),
        })
    }

    /// Refuse `media_type` and any variant of it.
    pub fn refuse(&self, media_type: MediaType) {
        self.refused.lock().push(media_type);
    }

    pub fn reject_next_sets(&self, count: usize) {
        self.reject_sets.store(count, Ordering::SeqCst);
    }

    pub fn set_count(&self) -> usize {
        self.sets.load(Ordering::SeqCst)
    }

    pub fn enumeration_count(&self) -> usize {
        self.enumerations.load(Ordering::SeqCst)
    }
}

impl MediaTypeHandler for CountingHandler {
    fn is_media_type_supported(&self, media_type: &MediaType) -> MediaResult<()> {
        if self.refused.lock().iter().any(|r| r.matches_items(media_type)) {
            return Err(MediaError::InvalidMediaType);
        }
        if self.accept_any {
            return Ok(());
        }
        self.inner.is_media_type_supported(media_type)
    }

    fn media_type_count(&self) -> MediaResult<usize> {
        self.enumerations.fetch_add(1, Ordering::SeqCst);
        self.inner.media_type_count()
    }

    fn media_type_by_index(&self, index: usize) -> MediaResult<MediaType> {
        self.enumerations.fetch_add(1, Ordering::SeqCst);
        self.inner.media_type_by_index(index)
    }

    fn set_current_media_type(&self, media_type: &MediaType) -> MediaResult<()> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        let rejected = self
            .reject_sets
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(MediaError::InvalidMediaType);
        }
        self.inner.set_current_media_type(media_type)
    }

    fn current_media_type(&self) -> MediaResult<MediaType> {
        self.inner.current_media_type()
    }
}

// =============================================================================
// HELPERS
// =============================================================================

pub fn pcm() -> MediaType {
    MediaType::audio(subtype::PCM)
}

pub fn float() -> MediaType {
    MediaType::audio(subtype::FLOAT)
}

/// 16-bit PCM at `rate` Hz.
pub fn pcm_at(rate: u32) -> MediaType {
    pcm().with_attr(attr::SAMPLE_RATE, AttrValue::UInt32(rate))
}

/// `source` stream 0 feeding `sink`.
pub fn simple_topology(source: &Arc<FakeSource>, sink: &Arc<FakeSink>) -> Topology {
    let descriptor = source.descriptor();
    let (_, stream) = descriptor.stream_by_index(0).unwrap();

    let mut topology = Topology::new();
    let source_node = topology.add_node(
        TopologyNode::source_stream("source")
            .with_source(Arc::clone(source) as Arc<dyn MediaSource>)
            .with_descriptors(descriptor, stream),
    );
    let output_node = topology.add_node(
        TopologyNode::output("output").with_sink(Arc::clone(sink) as Arc<dyn StreamSink>),
    );
    topology.connect(source_node, 0, output_node, 0).unwrap();
    topology
}

/// Next event of `kind` from `session`, skipping any other kinds. Panics
/// after a few seconds.
pub fn wait_for(session: &Session, kind: EventKind) -> Event {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match session.get_event(GetEventFlags::NoWait) {
            Ok(event) if event.kind == kind => return event,
            Ok(_) => {}
            Err(MediaError::NoEventsAvailable) => {
                assert!(Instant::now() < deadline, "timed out waiting for {:?}", kind);
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(e) => panic!("event queue failed while waiting for {:?}: {}", kind, e),
        }
    }
}

/// Every event currently queued, without waiting.
pub fn drain(session: &Session) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = session.get_event(GetEventFlags::NoWait) {
        events.push(event);
    }
    events
}
