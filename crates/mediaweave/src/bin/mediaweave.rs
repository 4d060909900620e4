//! Mediaweave demo binary
//!
//! Builds a synthetic topology (float audio source into a PCM-only sink),
//! lets the resolver insert a converter, then drives the session through
//! start, pause, resume, stop, close and shutdown while logging every event.
//!
//! Usage: `mediaweave [config.toml]`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use mediaweave::media_type::{attr, major, subtype};
use mediaweave::{
    AsyncCallback, AsyncResult, AttrValue, BeginOutcome, CallbackState, ClockStateSink,
    Dispatcher, Event, EventKind, EventQueue, GetEventFlags, MediaError, MediaEventGenerator,
    MediaResult, MediaSink, MediaSource, MediaTime, MediaType, MediaTypeHandler,
    PresentationClock, PresentationDescriptor, Session, SetTopologyFlags, SinkCharacteristics,
    SourceCharacteristics, StartPosition, StreamDescriptor, StreamSink, StreamTypeHandler,
    TableTransform, TimeFormat, Topology, TopologyNode, TopologyResolver, Transform,
    TransformCategory, TransformRegistration, TransformRegistry, TypeInfo,
};
use parking_lot::Mutex;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use weaveconf::WeaveConfig;

// =============================================================================
// SYNTHETIC SOURCE
// =============================================================================

/// Source with one float audio stream that acknowledges transport requests
/// immediately.
struct ToneSource {
    events: EventQueue,
    descriptor: Arc<PresentationDescriptor>,
}

impl ToneSource {
    fn new() -> MediaResult<Self> {
        let tone = MediaType::audio(subtype::FLOAT)
            .with_attr(attr::SAMPLE_RATE, AttrValue::UInt32(48_000))
            .with_attr(attr::CHANNELS, AttrValue::UInt32(2));
        let stream = StreamDescriptor::new(1, Arc::new(StreamTypeHandler::with_current(tone)));
        let descriptor = PresentationDescriptor::new(vec![stream]);
        descriptor.select_stream(0)?;
        descriptor.set_duration(Some(MediaTime::from_secs_f64(30.0)));
        Ok(Self {
            events: EventQueue::new()?,
            descriptor: Arc::new(descriptor),
        })
    }
}

impl MediaEventGenerator for ToneSource {
    fn begin_get_event(
        &self,
        callback: Arc<dyn AsyncCallback>,
        state: Option<CallbackState>,
    ) -> MediaResult<BeginOutcome> {
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

impl MediaSource for ToneSource {
    fn characteristics(&self) -> MediaResult<SourceCharacteristics> {
        Ok(SourceCharacteristics::CAN_SEEK | SourceCharacteristics::CAN_PAUSE)
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
        let kind = match position {
            StartPosition::Current => EventKind::SourceStarted,
            StartPosition::At(_) => EventKind::SourceSeeked,
        };
        self.events.queue_event(Event::new(kind))
    }

    fn stop(&self) -> MediaResult<()> {
        self.events.queue_event(Event::new(EventKind::SourceStopped))
    }

    fn pause(&self) -> MediaResult<()> {
        self.events.queue_event(Event::new(EventKind::SourcePaused))
    }

    fn shutdown(&self) -> MediaResult<()> {
        self.events.shutdown();
        Ok(())
    }
}

// =============================================================================
// LOGGING SINK
// =============================================================================

/// Sink that accepts 16-bit PCM only and logs clock transitions.
struct LogSink {
    this: std::sync::Weak<LogSink>,
    handler: Arc<StreamTypeHandler>,
    clock: Mutex<Option<Arc<PresentationClock>>>,
}

impl LogSink {
    fn new() -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            handler: Arc::new(StreamTypeHandler::new(vec![MediaType::audio(subtype::PCM)])),
            clock: Mutex::new(None),
        })
    }

    fn arc(&self) -> MediaResult<Arc<LogSink>> {
        self.this.upgrade().ok_or(MediaError::Shutdown)
    }
}

impl StreamSink for LogSink {
    fn media_sink(&self) -> MediaResult<Arc<dyn MediaSink>> {
        Ok(self.arc()?)
    }

    fn media_type_handler(&self) -> MediaResult<Arc<dyn MediaTypeHandler>> {
        Ok(Arc::clone(&self.handler) as Arc<dyn MediaTypeHandler>)
    }

    fn identifier(&self) -> MediaResult<u32> {
        Ok(0)
    }
}

impl MediaSink for LogSink {
    fn characteristics(&self) -> MediaResult<SinkCharacteristics> {
        Ok(SinkCharacteristics::FIXED_STREAMS)
    }

    fn stream_sink_count(&self) -> MediaResult<usize> {
        Ok(1)
    }

    fn stream_sink_by_index(&self, index: usize) -> MediaResult<Arc<dyn StreamSink>> {
        if index != 0 {
            return Err(MediaError::InvalidArgument("sink has one stream"));
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

    fn shutdown(&self) -> MediaResult<()> {
        self.clock.lock().take();
        info!("Sink shut down");
        Ok(())
    }
}

impl ClockStateSink for LogSink {
    fn on_clock_start(&self, system_time: MediaTime, position: StartPosition) -> MediaResult<()> {
        info!("Sink saw clock start at {} (system {})", position, system_time);
        Ok(())
    }

    fn on_clock_stop(&self, _system_time: MediaTime) -> MediaResult<()> {
        info!("Sink saw clock stop");
        Ok(())
    }

    fn on_clock_pause(&self, _system_time: MediaTime) -> MediaResult<()> {
        info!("Sink saw clock pause");
        Ok(())
    }

    fn on_clock_restart(&self, _system_time: MediaTime) -> MediaResult<()> {
        info!("Sink saw clock restart");
        Ok(())
    }

    fn on_clock_set_rate(&self, _system_time: MediaTime, rate: f32) -> MediaResult<()> {
        info!("Sink saw rate {}", rate);
        Ok(())
    }
}

// =============================================================================
// MAIN
// =============================================================================

fn converters() -> Arc<TransformRegistry> {
    let registry = TransformRegistry::new();
    registry.register(TransformRegistration::new(
        "float-to-pcm",
        TransformCategory::Converter,
        vec![TypeInfo::new(major::AUDIO, subtype::FLOAT)],
        vec![TypeInfo::new(major::AUDIO, subtype::PCM)],
        Arc::new(|| {
            Ok(Arc::new(TableTransform::new(
                vec![MediaType::audio(subtype::FLOAT)],
                vec![MediaType::audio(subtype::PCM)],
            )) as Arc<dyn Transform>)
        }),
    ));
    Arc::new(registry)
}

/// Block on the session's queue until `kind` arrives, logging everything seen.
fn wait_for(session: &Session, kind: EventKind) -> Result<Event> {
    loop {
        let event = session
            .get_event(GetEventFlags::Blocking)
            .with_context(|| format!("waiting for {:?}", kind))?;
        match &event.status {
            Ok(()) => info!("Event {:?} value {:?}", event.kind, event.value),
            Err(e) => warn!("Event {:?} failed: {}", event.kind, e),
        }
        if event.kind == kind {
            if let Err(e) = &event.status {
                bail!("{:?} failed: {}", kind, e);
            }
            return Ok(event);
        }
    }
}

fn build_topology() -> Result<Topology> {
    let source = Arc::new(ToneSource::new()?);
    let descriptor = source.create_presentation_descriptor()?;
    let (_, stream) = descriptor.stream_by_index(0)?;

    let mut topology = Topology::new();
    let source_node = topology.add_node(
        TopologyNode::source_stream("tone")
            .with_source(source)
            .with_descriptors(descriptor, stream),
    );
    let output_node = topology.add_node(TopologyNode::output("speaker").with_sink(LogSink::new()));
    topology.connect(source_node, 0, output_node, 0)?;
    Ok(topology)
}

fn main() -> Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = WeaveConfig::load_from(config_path.as_deref()).context("loading configuration")?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.telemetry.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("mediaweave {} starting", env!("CARGO_PKG_VERSION"));
    if !Dispatcher::configure_shared(&config.dispatch)? {
        warn!("Dispatchers were already running; configured sizes ignored");
    }

    let session = Session::with_parts(
        config.session.clone(),
        TopologyResolver::with_registry(converters()),
    )?;

    let topology = Arc::new(build_topology()?);
    info!(
        "Partial topology: {}",
        serde_json::to_string(&topology.snapshot())?
    );

    session.set_topology(SetTopologyFlags::empty(), topology)?;
    let set = wait_for(&session, EventKind::SessionTopologySet)?;
    if let Some(resolved) = set.value.as_topology() {
        info!(
            "Resolved topology: {}",
            serde_json::to_string(&resolved.snapshot())?
        );
    }

    session.start(TimeFormat::Default, StartPosition::At(MediaTime::zero()))?;
    wait_for(&session, EventKind::SessionStarted)?;

    let clock = session.clock()?;
    std::thread::sleep(Duration::from_millis(250));
    info!("Presentation time {}", clock.time()?);

    session.pause()?;
    wait_for(&session, EventKind::SessionPaused)?;
    info!("Paused at {}", clock.time()?);

    session.set_rate(false, 2.0)?;
    wait_for(&session, EventKind::SessionRateChanged)?;

    session.start(TimeFormat::Default, StartPosition::Current)?;
    wait_for(&session, EventKind::SessionStarted)?;
    std::thread::sleep(Duration::from_millis(250));
    info!("Presentation time {} at double rate", clock.time()?);

    session.stop()?;
    wait_for(&session, EventKind::SessionStopped)?;

    session.close()?;
    wait_for(&session, EventKind::SessionClosed)?;

    session.shutdown()?;
    info!("mediaweave shutdown complete");
    Ok(())
}
