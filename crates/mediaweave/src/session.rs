//! Media session
//!
//! Top-level orchestrator. Command methods check sequencing synchronously,
//! then hand the command to a per-session serial worker and return. The
//! worker drives sources and the presentation clock and reports every
//! outcome as an event on the session's own [`EventQueue`].
//!
//! A presentation (sources, sinks and one presentation clock) is built each
//! time a topology becomes current and torn down when it is replaced,
//! cleared, closed or shut down. Clocks are never reused across topologies.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bitflags::bitflags;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};
use weaveconf::{SessionConfig, WeaveConfig};

use crate::clock::{ClockStateSink, PresentationClock, ShutdownStatus, SystemTimeSource};
use crate::descriptor::PresentationDescriptor;
use crate::dispatch::Dispatcher;
use crate::error::{MediaError, MediaResult};
use crate::event::{
    AsyncCallback, AsyncResult, BeginOutcome, CallbackState, Event, EventKind, GetEventFlags,
    MediaEventGenerator, TopologyStatus,
};
use crate::event_queue::EventQueue;
use crate::rate::{RateControl, RateDirection, RateSupport};
use crate::resolver::TopologyResolver;
use crate::sink::{same_media_sink, MediaSink};
use crate::source::{same_source, MediaSource, SourceCharacteristics};
use crate::time::{StartPosition, TimeFormat};
use crate::topology::Topology;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SetTopologyFlags: u32 {
        /// Replace the current presentation now, stopping it if it runs.
        const IMMEDIATE = 0x1;
        /// Publish the topology as given; no validation or type negotiation.
        const NO_RESOLUTION = 0x2;
        /// Drop queued topologies before adding this one.
        const CLEAR_CURRENT = 0x4;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SessionCapabilities: u32 {
        const START = 0x1;
        const SEEK = 0x2;
        const PAUSE = 0x4;
        const RATE_FORWARD = 0x10;
        const RATE_REVERSE = 0x20;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SessionState {
    #[default]
    Idle,
    TopologySet,
    Started,
    Paused,
    Stopped,
    Closed,
    ShutDown,
}

// =============================================================================
// INTERNAL STATE
// =============================================================================

enum Command {
    SetTopology {
        op: u64,
        flags: SetTopologyFlags,
        topology: Arc<Topology>,
    },
    ClearTopologies {
        op: u64,
    },
    Start {
        op: u64,
        format: TimeFormat,
        position: StartPosition,
    },
    Pause {
        op: u64,
    },
    Stop {
        op: u64,
    },
    Close {
        op: u64,
    },
    SetRate {
        op: u64,
        thin: bool,
        rate: f32,
    },
    EndOfPresentation {
        generation: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransitionKind {
    Start,
    Pause,
    Stop,
}

/// Sources still expected to report the transition in progress.
struct Transition {
    kind: TransitionKind,
    awaiting: HashSet<usize>,
    failure: Option<MediaError>,
}

/// A source taking part in the current presentation.
#[derive(Clone)]
struct PresentedSource {
    source: Arc<dyn MediaSource>,
    descriptor: Arc<PresentationDescriptor>,
    pump: Arc<dyn AsyncCallback>,
    token: CallbackState,
}

impl PresentedSource {
    fn subscribe(&self) -> MediaResult<BeginOutcome> {
        self.source
            .begin_get_event(Arc::clone(&self.pump), Some(Arc::clone(&self.token)))
    }
}

struct Presentation {
    generation: u64,
    topology: Arc<Topology>,
    sources: Vec<PresentedSource>,
    ended: Vec<bool>,
    sinks: Vec<Arc<dyn MediaSink>>,
    clock_sinks: Vec<Arc<dyn ClockStateSink>>,
    clock: Arc<PresentationClock>,
    started_once: bool,
}

impl Presentation {
    fn capabilities(&self, allow_reverse: bool) -> SessionCapabilities {
        let mut caps = SessionCapabilities::START | SessionCapabilities::RATE_FORWARD;
        let all = |flag: SourceCharacteristics| {
            self.sources.iter().all(|s| {
                s.source
                    .characteristics()
                    .map(|c| c.contains(flag))
                    .unwrap_or(false)
            })
        };
        if all(SourceCharacteristics::CAN_SEEK) {
            caps |= SessionCapabilities::SEEK;
        }
        if all(SourceCharacteristics::CAN_PAUSE) {
            caps |= SessionCapabilities::PAUSE;
        }
        if allow_reverse {
            caps |= SessionCapabilities::RATE_REVERSE;
        }
        caps
    }

    /// Stop sources and clock without waiting for sources to confirm.
    fn halt(&self) {
        for source in &self.sources {
            if let Err(e) = source.source.stop() {
                debug!("Source refused stop during teardown: {}", e);
            }
        }
        if let Err(e) = self.clock.stop() {
            debug!("Clock stop during teardown: {}", e);
        }
    }

    /// Detach sinks from the clock and retire it. Sinks in `shutdown_sinks`
    /// are shut down as well.
    fn teardown(self, shutdown_sinks: &[Arc<dyn MediaSink>]) {
        for clock_sink in &self.clock_sinks {
            if let Err(e) = self.clock.remove_clock_state_sink(clock_sink) {
                debug!("Clock sink removal failed: {}", e);
            }
        }
        for sink in &self.sinks {
            if let Err(e) = sink.set_presentation_clock(None) {
                debug!("Sink refused clock reset: {}", e);
            }
        }
        for sink in shutdown_sinks {
            if let Err(e) = sink.shutdown() {
                warn!("Sink shutdown failed: {}", e);
            }
        }
        self.clock.shutdown();
        debug!("Presentation {} torn down", self.generation);
    }
}

struct Shared {
    /// State the worker has reached.
    state: SessionState,
    /// State once every submitted command has run; used for sync checks.
    requested: SessionState,
    shutdown: ShutdownStatus,
    topology_ever_set: bool,
    next_op: u64,
    /// Submitted commands not yet completed, with the event each will post.
    pending: Vec<(u64, EventKind)>,
    queued: VecDeque<Arc<Topology>>,
    presentation: Option<Presentation>,
    transition: Option<Transition>,
    capabilities: SessionCapabilities,
    rate: f32,
    commands: Option<UnboundedSender<Command>>,
}

impl Shared {
    fn ensure_live(&self) -> MediaResult<()> {
        if self.shutdown != ShutdownStatus::NotInitiated {
            return Err(MediaError::Shutdown);
        }
        Ok(())
    }

    fn ensure_open(&self) -> MediaResult<()> {
        self.ensure_live()?;
        if self.requested == SessionState::Closed {
            return Err(MediaError::InvalidRequest);
        }
        Ok(())
    }

    fn is_live(&self) -> bool {
        self.shutdown == ShutdownStatus::NotInitiated
    }
}

struct SessionInner {
    this: Weak<SessionInner>,
    shared: Mutex<Shared>,
    progress: Condvar,
    events: EventQueue,
    resolver: TopologyResolver,
    config: SessionConfig,
    next_generation: AtomicU64,
}

// =============================================================================
// SESSION
// =============================================================================

/// Drives playback of topologies. Cheap to clone; clones share one session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Session with default limits and a resolver without transforms.
    pub fn new() -> MediaResult<Self> {
        Self::with_parts(SessionConfig::default(), TopologyResolver::new())
    }

    pub fn with_config(config: &WeaveConfig) -> MediaResult<Self> {
        Self::with_parts(config.session.clone(), TopologyResolver::new())
    }

    pub fn with_parts(config: SessionConfig, resolver: TopologyResolver) -> MediaResult<Self> {
        let workers = Dispatcher::shared_workers()?;
        let (sender, receiver) = mpsc::unbounded_channel();

        let inner = Arc::new_cyclic(|this| SessionInner {
            this: this.clone(),
            shared: Mutex::new(Shared {
                state: SessionState::Idle,
                requested: SessionState::Idle,
                shutdown: ShutdownStatus::NotInitiated,
                topology_ever_set: false,
                next_op: 1,
                pending: Vec::new(),
                queued: VecDeque::new(),
                presentation: None,
                transition: None,
                capabilities: SessionCapabilities::empty(),
                rate: 1.0,
                commands: Some(sender),
            }),
            progress: Condvar::new(),
            events: EventQueue::with_dispatcher(Arc::clone(&workers)),
            resolver,
            config,
            next_generation: AtomicU64::new(1),
        });

        spawn_worker(&workers, &inner, receiver);
        debug!("Session created");
        Ok(Self { inner })
    }

    // === Commands ===

    /// Queue `topology` for playback. Structural problems are reported here;
    /// type negotiation happens later and is reported by `SessionTopologySet`.
    pub fn set_topology(&self, flags: SetTopologyFlags, topology: Arc<Topology>) -> MediaResult<()> {
        if topology.is_empty() {
            return Err(MediaError::InvalidArgument("topology has no nodes"));
        }
        if !flags.contains(SetTopologyFlags::NO_RESOLUTION) {
            self.inner.resolver.validate(&topology)?;
        }

        self.submit(EventKind::SessionTopologySet, |shared| {
            shared.ensure_open()?;
            shared.topology_ever_set = true;
            if shared.requested == SessionState::Idle {
                shared.requested = SessionState::TopologySet;
            }
            Ok(())
        }, |op| Command::SetTopology { op, flags, topology })
    }

    /// Drop every topology not in use. Invalid before any topology was ever
    /// set.
    pub fn clear_topologies(&self) -> MediaResult<()> {
        self.submit(EventKind::SessionTopologiesCleared, |shared| {
            shared.ensure_open()?;
            if !shared.topology_ever_set {
                return Err(MediaError::InvalidRequest);
            }
            if matches!(shared.requested, SessionState::TopologySet | SessionState::Stopped) {
                shared.requested = SessionState::Idle;
            }
            Ok(())
        }, |op| Command::ClearTopologies { op })
    }

    pub fn start(&self, format: TimeFormat, position: StartPosition) -> MediaResult<()> {
        self.submit(EventKind::SessionStarted, |shared| {
            shared.ensure_open()?;
            match shared.requested {
                SessionState::TopologySet
                | SessionState::Started
                | SessionState::Paused
                | SessionState::Stopped => {
                    shared.requested = SessionState::Started;
                    Ok(())
                }
                _ => Err(MediaError::InvalidRequest),
            }
        }, |op| Command::Start { op, format, position })
    }

    pub fn pause(&self) -> MediaResult<()> {
        self.submit(EventKind::SessionPaused, |shared| {
            shared.ensure_open()?;
            if shared.requested != SessionState::Started {
                return Err(MediaError::InvalidRequest);
            }
            shared.requested = SessionState::Paused;
            Ok(())
        }, |op| Command::Pause { op })
    }

    pub fn stop(&self) -> MediaResult<()> {
        self.submit(EventKind::SessionStopped, |shared| {
            shared.ensure_open()?;
            if !matches!(shared.requested, SessionState::Started | SessionState::Paused) {
                return Err(MediaError::InvalidRequest);
            }
            shared.requested = SessionState::Stopped;
            Ok(())
        }, |op| Command::Stop { op })
    }

    /// Stop everything and release the presentation. Posts `SessionClosed`
    /// once; later calls succeed without doing anything.
    pub fn close(&self) -> MediaResult<()> {
        {
            let shared = self.inner.shared.lock();
            shared.ensure_live()?;
            if shared.requested == SessionState::Closed {
                return Ok(());
            }
        }
        self.submit(EventKind::SessionClosed, |shared| {
            shared.ensure_live()?;
            shared.requested = SessionState::Closed;
            Ok(())
        }, |op| Command::Close { op })
    }

    /// Terminal. Commands in flight complete with a shutdown status; the
    /// event queue keeps handing out what was already queued and then
    /// reports shutdown.
    ///
    /// The callback last registered with `begin_get_event` stays referenced
    /// by the session's queue until the session itself is dropped.
    pub fn shutdown(&self) -> MediaResult<()> {
        let presentation = {
            let mut shared = self.inner.shared.lock();
            shared.ensure_live()?;
            shared.shutdown = ShutdownStatus::Initiated;
            shared.state = SessionState::ShutDown;
            shared.requested = SessionState::ShutDown;
            shared.transition = None;
            shared.queued.clear();
            shared.commands = None;

            for (_, kind) in std::mem::take(&mut shared.pending) {
                let event = Event::new(kind).with_status(Err(MediaError::Shutdown));
                if let Err(e) = self.inner.events.queue_event(event) {
                    debug!("Could not post {:?} during shutdown: {}", kind, e);
                }
            }
            self.inner.progress.notify_all();
            shared.presentation.take()
        };

        if let Some(presentation) = presentation {
            presentation.halt();
            let sinks = presentation.sinks.clone();
            presentation.teardown(&sinks);
        }

        self.inner.events.shutdown_after_drain();
        self.inner.shared.lock().shutdown = ShutdownStatus::Completed;
        info!("Session shut down");
        Ok(())
    }

    fn submit(
        &self,
        kind: EventKind,
        check: impl FnOnce(&mut Shared) -> MediaResult<()>,
        command: impl FnOnce(u64) -> Command,
    ) -> MediaResult<()> {
        let mut shared = self.inner.shared.lock();
        shared.ensure_live()?;
        // Checks may update the requested state, so restore it on failure
        let requested = shared.requested;
        let ever_set = shared.topology_ever_set;
        check(&mut *shared)?;

        let op = shared.next_op;
        let sent = shared
            .commands
            .as_ref()
            .map(|commands| commands.send(command(op)).is_ok())
            .unwrap_or(false);
        if !sent {
            shared.requested = requested;
            shared.topology_ever_set = ever_set;
            return Err(MediaError::Shutdown);
        }
        shared.next_op += 1;
        shared.pending.push((op, kind));
        Ok(())
    }

    // === Queries ===

    pub fn state(&self) -> SessionState {
        self.inner.shared.lock().state
    }

    pub fn shutdown_status(&self) -> ShutdownStatus {
        self.inner.shared.lock().shutdown
    }

    /// Clock of the current presentation.
    pub fn clock(&self) -> MediaResult<Arc<PresentationClock>> {
        let shared = self.inner.shared.lock();
        shared.ensure_live()?;
        shared
            .presentation
            .as_ref()
            .map(|p| Arc::clone(&p.clock))
            .ok_or(MediaError::NoClock)
    }

    /// Current resolved topology.
    pub fn full_topology(&self) -> MediaResult<Arc<Topology>> {
        let shared = self.inner.shared.lock();
        shared.ensure_live()?;
        shared
            .presentation
            .as_ref()
            .map(|p| Arc::clone(&p.topology))
            .ok_or(MediaError::InvalidRequest)
    }

    pub fn capabilities(&self) -> MediaResult<SessionCapabilities> {
        let shared = self.inner.shared.lock();
        shared.ensure_live()?;
        Ok(shared.capabilities)
    }

    pub fn set_rate(&self, thin: bool, rate: f32) -> MediaResult<()> {
        self.submit(EventKind::SessionRateChanged, |shared| shared.ensure_open(), |op| {
            Command::SetRate { op, thin, rate }
        })
    }

    pub fn rate(&self) -> MediaResult<(bool, f32)> {
        let shared = self.inner.shared.lock();
        shared.ensure_live()?;
        match &shared.presentation {
            Some(presentation) => Ok(presentation.clock.rate()),
            None => Ok((false, shared.rate)),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.inner.shared.lock();
        f.debug_struct("Session")
            .field("state", &shared.state)
            .field("shutdown", &shared.shutdown)
            .field("pending", &shared.pending.len())
            .finish()
    }
}

impl MediaEventGenerator for Session {
    fn begin_get_event(
        &self,
        callback: Arc<dyn AsyncCallback>,
        state: Option<CallbackState>,
    ) -> MediaResult<BeginOutcome> {
        self.inner.events.begin_get_event(callback, state)
    }

    fn end_get_event(&self, result: &AsyncResult) -> MediaResult<Event> {
        self.inner.events.end_get_event(result)
    }

    fn get_event(&self, flags: GetEventFlags) -> MediaResult<Event> {
        self.inner.events.get_event(flags)
    }

    fn queue_event(&self, event: Event) -> MediaResult<()> {
        self.inner.events.queue_event(event)
    }
}

// =============================================================================
// RATE
// =============================================================================

impl Session {
    fn sink_rate_supports(&self) -> Vec<Arc<dyn RateSupport>> {
        let shared = self.inner.shared.lock();
        shared
            .presentation
            .iter()
            .flat_map(|p| p.sinks.iter())
            .filter_map(|sink| sink.rate_support())
            .collect()
    }
}

impl RateSupport for Session {
    fn slowest_rate(&self, direction: RateDirection, thin: bool) -> MediaResult<f32> {
        self.inner.shared.lock().ensure_live()?;
        if direction == RateDirection::Reverse && !self.inner.config.allow_reverse {
            return Err(MediaError::UnsupportedRate { nearest: 0.0 });
        }
        let mut slowest = 0.0f32;
        for support in self.sink_rate_supports() {
            let rate = support.slowest_rate(direction, thin)?;
            if rate.abs() > slowest.abs() {
                slowest = rate;
            }
        }
        Ok(slowest)
    }

    fn fastest_rate(&self, direction: RateDirection, thin: bool) -> MediaResult<f32> {
        self.inner.shared.lock().ensure_live()?;
        if direction == RateDirection::Reverse && !self.inner.config.allow_reverse {
            return Err(MediaError::UnsupportedRate { nearest: 0.0 });
        }
        let mut fastest = self.inner.config.max_rate;
        for support in self.sink_rate_supports() {
            fastest = fastest.min(support.fastest_rate(direction, thin)?.abs());
        }
        Ok(match direction {
            RateDirection::Forward => fastest,
            RateDirection::Reverse => -fastest,
        })
    }

    fn is_rate_supported(&self, thin: bool, rate: f32) -> MediaResult<f32> {
        self.inner.shared.lock().ensure_live()?;
        if thin {
            return Err(MediaError::ThinningUnsupported);
        }
        if rate < 0.0 && !self.inner.config.allow_reverse {
            return Err(MediaError::UnsupportedRate { nearest: 0.0 });
        }
        let max = self.inner.config.max_rate;
        if rate.abs() > max {
            return Err(MediaError::UnsupportedRate {
                nearest: max.copysign(rate),
            });
        }
        for support in self.sink_rate_supports() {
            support.is_rate_supported(thin, rate)?;
        }
        Ok(rate)
    }
}

impl RateControl for Session {
    fn set_rate(&self, thin: bool, rate: f32) -> MediaResult<()> {
        Session::set_rate(self, thin, rate)
    }

    fn rate(&self) -> MediaResult<(bool, f32)> {
        Session::rate(self)
    }
}

// =============================================================================
// WORKER
// =============================================================================

fn spawn_worker(
    workers: &Dispatcher,
    inner: &Arc<SessionInner>,
    mut receiver: UnboundedReceiver<Command>,
) {
    let session = Arc::downgrade(inner);
    workers.put_work_item(move || {
        while let Some(command) = receiver.blocking_recv() {
            let Some(inner) = session.upgrade() else {
                break;
            };
            inner.execute(command);
        }
        debug!("Session worker exiting");
    });
}

impl SessionInner {
    fn execute(&self, command: Command) {
        match command {
            Command::SetTopology { op, flags, topology } => self.handle_set_topology(op, flags, topology),
            Command::ClearTopologies { op } => self.handle_clear_topologies(op),
            Command::Start { op, format, position } => self.handle_start(op, format, position),
            Command::Pause { op } => self.handle_pause(op),
            Command::Stop { op } => self.handle_stop(op),
            Command::Close { op } => self.handle_close(op),
            Command::SetRate { op, thin, rate } => self.handle_set_rate(op, thin, rate),
            Command::EndOfPresentation { generation } => self.handle_end_of_presentation(generation),
        }
    }

    /// Post the completion event of `op`, unless shutdown already did.
    fn complete(&self, shared: &mut Shared, op: u64, event: Event) {
        if !shared.is_live() {
            return;
        }
        shared.pending.retain(|(id, _)| *id != op);
        self.post(shared, event);
    }

    fn fail(&self, shared: &mut Shared, op: u64, kind: EventKind, error: MediaError) {
        self.complete(shared, op, Event::new(kind).with_status(Err(error)));
    }

    fn post(&self, shared: &Shared, event: Event) {
        if !shared.is_live() {
            return;
        }
        let kind = event.kind;
        if let Err(e) = self.events.queue_event(event) {
            warn!("Could not post {:?}: {}", kind, e);
        }
    }

    // === Topologies ===

    fn handle_set_topology(&self, op: u64, flags: SetTopologyFlags, topology: Arc<Topology>) {
        let resolved = if flags.contains(SetTopologyFlags::NO_RESOLUTION) {
            Ok(Arc::clone(&topology))
        } else {
            self.resolver.resolve(&topology).map(Arc::new)
        };

        let mut shared = self.shared.lock();
        let resolved = match resolved {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!("Topology {} failed to resolve: {}", topology.id(), e);
                let event = Event::new(EventKind::SessionTopologySet)
                    .with_status(Err(e))
                    .with_value(topology);
                self.complete(&mut shared, op, event);
                return;
            }
        };

        if flags.contains(SetTopologyFlags::CLEAR_CURRENT) {
            shared.queued.clear();
        }

        let active = matches!(shared.state, SessionState::Started | SessionState::Paused);
        if active && !flags.contains(SetTopologyFlags::IMMEDIATE) {
            info!("Topology {} queued behind the running presentation", resolved.id());
            shared.queued.push_back(Arc::clone(&resolved));
            let event = Event::new(EventKind::SessionTopologySet).with_value(resolved);
            self.complete(&mut shared, op, event);
            return;
        }

        if active {
            if let Some(presentation) = &shared.presentation {
                presentation.halt();
            }
            shared.state = SessionState::Stopped;
            if matches!(shared.requested, SessionState::Started | SessionState::Paused) {
                shared.requested = SessionState::Stopped;
            }
        }

        match self.make_current(&mut shared, Arc::clone(&resolved)) {
            Ok(()) => {
                let event = Event::new(EventKind::SessionTopologySet).with_value(Arc::clone(&resolved));
                self.complete(&mut shared, op, event);
                self.announce_ready(&mut shared, resolved);
            }
            Err(e) => {
                warn!("Topology {} could not be presented: {}", resolved.id(), e);
                let event = Event::new(EventKind::SessionTopologySet)
                    .with_status(Err(e))
                    .with_value(resolved);
                self.complete(&mut shared, op, event);
            }
        }
    }

    fn announce_ready(&self, shared: &mut Shared, topology: Arc<Topology>) {
        let status = Event::new(EventKind::SessionTopologyStatus)
            .with_topology_status(TopologyStatus::Ready)
            .with_value(topology);
        self.post(shared, status);

        let caps = shared
            .presentation
            .as_ref()
            .map(|p| p.capabilities(self.config.allow_reverse))
            .unwrap_or_default();
        if caps != shared.capabilities {
            shared.capabilities = caps;
            let event = Event::new(EventKind::SessionCapabilitiesChanged).with_value(caps.bits() as i64);
            self.post(shared, event);
        }
    }

    /// Replace the presentation with one built for `topology`.
    fn make_current(&self, shared: &mut Shared, topology: Arc<Topology>) -> MediaResult<()> {
        // Old first: sinks shared with the new topology must end up on the new clock
        if let Some(old) = shared.presentation.take() {
            let retired = exclusive_sinks(&old.sinks, &[topology.as_ref()]);
            old.teardown(&retired);
        }

        match self.build_presentation(Arc::clone(&topology), shared.rate) {
            Ok(presentation) => shared.presentation = Some(presentation),
            Err(e) => {
                if shared.state != SessionState::Closed {
                    shared.state = SessionState::Idle;
                }
                return Err(e);
            }
        }
        if matches!(shared.state, SessionState::Idle | SessionState::Closed) {
            shared.state = SessionState::TopologySet;
        }
        info!("Topology {} is now current", topology.id());
        Ok(())
    }

    fn build_presentation(&self, topology: Arc<Topology>, rate: f32) -> MediaResult<Presentation> {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);

        let mut sources: Vec<PresentedSource> = Vec::new();
        for id in topology.source_nodes() {
            let Some(node) = topology.node(id) else { continue };
            let (Some(source), Some(descriptor), Some(stream)) =
                (node.source(), node.presentation(), node.stream())
            else {
                continue;
            };
            if !descriptor.is_selected(stream.identifier()) {
                continue;
            }
            if sources.iter().any(|s| same_source(&s.source, source)) {
                continue;
            }
            let index = sources.len();
            sources.push(PresentedSource {
                source: Arc::clone(source),
                descriptor: Arc::clone(descriptor),
                pump: Arc::new(SourcePump {
                    session: self.this.clone(),
                    generation,
                    index,
                }),
                token: Arc::new(index),
            });
        }

        let mut sinks: Vec<Arc<dyn MediaSink>> = Vec::new();
        for id in topology.output_nodes() {
            let Some(stream_sink) = topology.node(id).and_then(|n| n.sink()) else {
                continue;
            };
            let sink = stream_sink.media_sink()?;
            if !sinks.iter().any(|s| same_media_sink(s, &sink)) {
                sinks.push(sink);
            }
        }

        let clock = Arc::new(PresentationClock::new()?);
        clock.set_time_source(Arc::new(SystemTimeSource::new()))?;
        if rate != 1.0 {
            clock.set_rate(false, rate)?;
        }

        let mut clock_sinks = Vec::new();
        for sink in &sinks {
            sink.set_presentation_clock(Some(Arc::clone(&clock)))?;
            if let Some(clock_sink) = sink.clock_state_sink() {
                clock.add_clock_state_sink(Arc::clone(&clock_sink))?;
                clock_sinks.push(clock_sink);
            }
        }

        debug!(
            "Presentation {} built with {} sources and {} sinks",
            generation,
            sources.len(),
            sinks.len()
        );
        Ok(Presentation {
            generation,
            topology,
            ended: vec![false; sources.len()],
            sources,
            sinks,
            clock_sinks,
            clock,
            started_once: false,
        })
    }

    /// Make the next queued topology current, if any.
    fn promote_queued(&self, shared: &mut Shared) {
        while let Some(next) = shared.queued.pop_front() {
            match self.make_current(shared, Arc::clone(&next)) {
                Ok(()) => {
                    self.announce_ready(shared, next);
                    return;
                }
                Err(e) => warn!("Queued topology {} could not be presented: {}", next.id(), e),
            }
        }
    }

    fn handle_clear_topologies(&self, op: u64) {
        let mut shared = self.shared.lock();
        if !shared.is_live() {
            return;
        }

        let cleared: Vec<Arc<Topology>> = shared.queued.drain(..).collect();
        let active = matches!(shared.state, SessionState::Started | SessionState::Paused);

        if active {
            // The running topology stays; only sinks exclusive to queued ones go
            if let Some(presentation) = &shared.presentation {
                let keep = [presentation.topology.as_ref()];
                let candidates = topology_sinks(cleared.iter().map(|t| t.as_ref()));
                for sink in exclusive_sinks(&candidates, &keep) {
                    if let Err(e) = sink.shutdown() {
                        warn!("Sink shutdown failed: {}", e);
                    }
                }
            }
        } else {
            let mut sinks = topology_sinks(cleared.iter().map(|t| t.as_ref()));
            if let Some(presentation) = shared.presentation.take() {
                sinks.extend(presentation.sinks.iter().cloned());
                let retired = exclusive_sinks(&sinks, &[]);
                presentation.teardown(&retired);
            } else {
                for sink in exclusive_sinks(&sinks, &[]) {
                    if let Err(e) = sink.shutdown() {
                        warn!("Sink shutdown failed: {}", e);
                    }
                }
            }
            if shared.state != SessionState::Closed {
                shared.state = SessionState::Idle;
            }
            shared.capabilities = SessionCapabilities::empty();
        }

        info!("Topologies cleared");
        self.complete(&mut shared, op, Event::new(EventKind::SessionTopologiesCleared));
    }

    // === Transport ===

    fn handle_start(&self, op: u64, format: TimeFormat, position: StartPosition) {
        let (sources, clock) = {
            let mut shared = self.shared.lock();
            if !shared.is_live() {
                return;
            }
            let startable = matches!(
                shared.state,
                SessionState::TopologySet | SessionState::Stopped | SessionState::Started | SessionState::Paused
            );
            if shared.presentation.is_none() || !startable {
                self.fail(&mut shared, op, EventKind::SessionStarted, MediaError::InvalidRequest);
                settle(&mut shared);
                return;
            }

            if shared.state == SessionState::Started && position == StartPosition::Current {
                self.complete(&mut shared, op, Event::new(EventKind::SessionStarted));
                return;
            }

            let beyond = position.time().is_some_and(|at| {
                shared
                    .presentation
                    .iter()
                    .flat_map(|p| p.sources.iter())
                    .any(|s| s.descriptor.duration().is_some_and(|d| at > d))
            });
            if beyond {
                self.fail(&mut shared, op, EventKind::SessionStarted, MediaError::OutOfRange);
                settle(&mut shared);
                return;
            }

            match shared.presentation.as_mut() {
                Some(p) => {
                    p.ended.iter_mut().for_each(|e| *e = false);
                    (p.sources.clone(), Arc::clone(&p.clock))
                }
                None => return,
            }
        };

        let outcome = self.drive_sources(TransitionKind::Start, &sources, |s| {
            s.source.start(&s.descriptor, format, position)
        });
        let Some(outcome) = outcome else { return };

        let outcome = outcome.and_then(|()| match clock.start(position) {
            Err(MediaError::ClockStateAlreadySet) => Ok(()),
            other => other,
        });

        let mut shared = self.shared.lock();
        match outcome {
            Ok(()) => {
                shared.state = SessionState::Started;
                let first = shared
                    .presentation
                    .as_mut()
                    .map(|p| !std::mem::replace(&mut p.started_once, true))
                    .unwrap_or(false);
                if first {
                    let topology = shared.presentation.as_ref().map(|p| Arc::clone(&p.topology));
                    let mut status = Event::new(EventKind::SessionTopologyStatus)
                        .with_topology_status(TopologyStatus::StartedSource);
                    if let Some(topology) = topology {
                        status = status.with_value(topology);
                    }
                    self.post(&shared, status);
                }
                info!("Session started at {}", position);
                self.complete(&mut shared, op, Event::new(EventKind::SessionStarted));
            }
            Err(e) => {
                warn!("Session start failed: {}", e);
                self.fail(&mut shared, op, EventKind::SessionStarted, e);
                settle(&mut shared);
            }
        }
    }

    fn handle_pause(&self, op: u64) {
        let (sources, clock) = match self.transport_snapshot(op, EventKind::SessionPaused, &[SessionState::Started]) {
            Some(snapshot) => snapshot,
            None => return,
        };

        let outcome = self.drive_sources(TransitionKind::Pause, &sources, |s| s.source.pause());
        let Some(outcome) = outcome else { return };
        let outcome = outcome.and_then(|()| clock.pause());

        let mut shared = self.shared.lock();
        let event = match outcome {
            Ok(()) => {
                shared.state = SessionState::Paused;
                info!("Session paused");
                Event::new(EventKind::SessionPaused)
            }
            Err(e) => {
                warn!("Session pause failed: {}", e);
                Event::new(EventKind::SessionPaused).with_status(Err(e))
            }
        };
        self.complete(&mut shared, op, event);
        settle(&mut shared);
    }

    fn handle_stop(&self, op: u64) {
        let (sources, clock) = match self.transport_snapshot(
            op,
            EventKind::SessionStopped,
            &[SessionState::Started, SessionState::Paused],
        ) {
            Some(snapshot) => snapshot,
            None => return,
        };

        let outcome = self.drive_sources(TransitionKind::Stop, &sources, |s| s.source.stop());
        let Some(outcome) = outcome else { return };
        let outcome = outcome.and_then(|()| match clock.stop() {
            Err(MediaError::ClockStateAlreadySet) => Ok(()),
            other => other,
        });

        let mut shared = self.shared.lock();
        match outcome {
            Ok(()) => {
                shared.state = SessionState::Stopped;
                info!("Session stopped");
                self.complete(&mut shared, op, Event::new(EventKind::SessionStopped));
                self.promote_queued(&mut shared);
            }
            Err(e) => {
                warn!("Session stop failed: {}", e);
                self.fail(&mut shared, op, EventKind::SessionStopped, e);
                settle(&mut shared);
            }
        }
    }

    /// Sources and clock for a pause or stop, or None after posting the
    /// failure when the session is not in one of `allowed`.
    fn transport_snapshot(
        &self,
        op: u64,
        kind: EventKind,
        allowed: &[SessionState],
    ) -> Option<(Vec<PresentedSource>, Arc<PresentationClock>)> {
        let mut shared = self.shared.lock();
        if !shared.is_live() {
            return None;
        }
        let snapshot = shared
            .presentation
            .as_ref()
            .filter(|_| allowed.contains(&shared.state))
            .map(|p| (p.sources.clone(), Arc::clone(&p.clock)));
        if snapshot.is_none() {
            self.fail(&mut shared, op, kind, MediaError::InvalidRequest);
            settle(&mut shared);
        }
        snapshot
    }

    /// Ask every source for a transition and wait until all of them report
    /// it. A source that fails to subscribe or refuses the request fails the
    /// whole transition. None when the session shut down meanwhile.
    fn drive_sources(
        &self,
        kind: TransitionKind,
        sources: &[PresentedSource],
        request: impl Fn(&PresentedSource) -> MediaResult<()>,
    ) -> Option<MediaResult<()>> {
        {
            let mut shared = self.shared.lock();
            if !shared.is_live() {
                return None;
            }
            shared.transition = Some(Transition {
                kind,
                awaiting: (0..sources.len()).collect(),
                failure: None,
            });
        }

        for (index, source) in sources.iter().enumerate() {
            if let Err(e) = source.subscribe().and_then(|_| request(source)) {
                warn!("Source {} refused {:?}: {}", index, kind, e);
                self.shared.lock().transition = None;
                return Some(Err(e));
            }
        }

        let mut shared = self.shared.lock();
        loop {
            if !shared.is_live() {
                return None;
            }
            let Some(transition) = shared.transition.as_mut() else {
                return None;
            };
            if let Some(failure) = transition.failure.take() {
                shared.transition = None;
                return Some(Err(failure));
            }
            if transition.awaiting.is_empty() {
                shared.transition = None;
                return Some(Ok(()));
            }
            self.progress.wait(&mut shared);
        }
    }

    fn handle_close(&self, op: u64) {
        let mut shared = self.shared.lock();
        if !shared.is_live() {
            return;
        }
        shared.queued.clear();
        if let Some(presentation) = shared.presentation.take() {
            presentation.halt();
            let sinks = presentation.sinks.clone();
            presentation.teardown(&sinks);
        }
        shared.state = SessionState::Closed;
        shared.capabilities = SessionCapabilities::empty();
        info!("Session closed");
        self.complete(&mut shared, op, Event::new(EventKind::SessionClosed));
    }

    fn handle_set_rate(&self, op: u64, thin: bool, rate: f32) {
        let session = match self.this.upgrade() {
            Some(inner) => Session { inner },
            None => return,
        };
        let outcome = RateSupport::is_rate_supported(&session, thin, rate).and_then(|_| {
            let clock = session.clock().ok();
            match clock {
                Some(clock) => clock.set_rate(thin, rate),
                None => Ok(()),
            }
        });

        let mut shared = self.shared.lock();
        let event = match outcome {
            Ok(()) => {
                shared.rate = rate;
                info!("Session rate set to {}", rate);
                Event::new(EventKind::SessionRateChanged).with_value(rate as f64)
            }
            Err(e) => Event::new(EventKind::SessionRateChanged)
                .with_status(Err(e))
                .with_value(rate as f64),
        };
        self.complete(&mut shared, op, event);
    }

    // === Source events ===

    fn on_source_event(&self, generation: u64, index: usize, event: &Event) {
        let mut shared = self.shared.lock();
        let current = shared
            .presentation
            .as_ref()
            .is_some_and(|p| p.generation == generation);
        if !current {
            return;
        }

        let reported = match event.kind {
            EventKind::SourceStarted | EventKind::SourceSeeked => Some(TransitionKind::Start),
            EventKind::SourcePaused => Some(TransitionKind::Pause),
            EventKind::SourceStopped => Some(TransitionKind::Stop),
            EventKind::EndOfPresentation => {
                self.on_end_of_presentation(&mut shared, generation, index);
                None
            }
            other => {
                debug!("Source {} event {:?}", index, other);
                None
            }
        };

        if let Some(kind) = reported {
            if let Some(transition) = shared.transition.as_mut().filter(|t| t.kind == kind) {
                transition.awaiting.remove(&index);
                if let Err(e) = &event.status {
                    transition.failure.get_or_insert_with(|| e.clone());
                }
                self.progress.notify_all();
            }
        }
    }

    fn on_end_of_presentation(&self, shared: &mut Shared, generation: u64, index: usize) {
        let Some(presentation) = shared.presentation.as_mut() else {
            return;
        };
        if let Some(ended) = presentation.ended.get_mut(index) {
            *ended = true;
        }
        if presentation.ended.iter().all(|e| *e) {
            if let Some(commands) = &shared.commands {
                if commands.send(Command::EndOfPresentation { generation }).is_err() {
                    debug!("Session worker gone before end of presentation");
                }
            }
        }
    }

    fn handle_end_of_presentation(&self, generation: u64) {
        let clock = {
            let shared = self.shared.lock();
            match &shared.presentation {
                Some(p) if p.generation == generation && shared.state == SessionState::Started => {
                    Arc::clone(&p.clock)
                }
                _ => return,
            }
        };

        if let Err(e) = clock.stop() {
            debug!("Clock stop at end of presentation: {}", e);
        }

        let mut shared = self.shared.lock();
        shared.state = SessionState::Stopped;
        if shared.requested == SessionState::Started {
            shared.requested = SessionState::Stopped;
        }
        let topology = shared.presentation.as_ref().map(|p| Arc::clone(&p.topology));
        let mut status = Event::new(EventKind::SessionTopologyStatus).with_topology_status(TopologyStatus::Ended);
        if let Some(topology) = topology {
            status = status.with_value(topology);
        }
        self.post(&shared, status);
        info!("Presentation ended");
        self.post(&shared, Event::new(EventKind::SessionEnded));
        self.promote_queued(&mut shared);
    }
}

// =============================================================================
// SOURCE EVENT PUMP
// =============================================================================

/// Receives one source's events and re-subscribes after each.
struct SourcePump {
    session: Weak<SessionInner>,
    generation: u64,
    index: usize,
}

impl AsyncCallback for SourcePump {
    fn invoke(&self, result: AsyncResult) {
        let Some(inner) = self.session.upgrade() else {
            return;
        };
        let source = {
            let shared = inner.shared.lock();
            if !shared.is_live() {
                return;
            }
            match &shared.presentation {
                Some(p) if p.generation == self.generation => p.sources.get(self.index).cloned(),
                _ => None,
            }
        };
        let Some(source) = source else { return };

        match source.source.end_get_event(&result) {
            Ok(event) => inner.on_source_event(self.generation, self.index, &event),
            Err(e) => {
                debug!("Source {} event retrieval failed: {}", self.index, e);
                return;
            }
        }

        if let Err(e) = source.subscribe() {
            debug!("Source {} stopped delivering events: {}", self.index, e);
        }
    }
}

// =============================================================================
// HELPERS
// =============================================================================

/// After a failed transport command with nothing else in flight, the
/// requested state falls back to the one actually reached.
fn settle(shared: &mut Shared) {
    if shared.is_live() && shared.pending.is_empty() && shared.requested != SessionState::Closed {
        shared.requested = shared.state;
    }
}

fn topology_sinks<'a>(topologies: impl IntoIterator<Item = &'a Topology>) -> Vec<Arc<dyn MediaSink>> {
    let mut sinks: Vec<Arc<dyn MediaSink>> = Vec::new();
    for topology in topologies {
        for id in topology.output_nodes() {
            let Some(stream_sink) = topology.node(id).and_then(|n| n.sink()) else {
                continue;
            };
            match stream_sink.media_sink() {
                Ok(sink) if !sinks.iter().any(|s| same_media_sink(s, &sink)) => sinks.push(sink),
                Ok(_) => {}
                Err(e) => debug!("Stream sink without media sink: {}", e),
            }
        }
    }
    sinks
}

/// Distinct sinks of `sinks` that none of `keep` uses.
fn exclusive_sinks(sinks: &[Arc<dyn MediaSink>], keep: &[&Topology]) -> Vec<Arc<dyn MediaSink>> {
    let kept = topology_sinks(keep.iter().copied());
    let mut result: Vec<Arc<dyn MediaSink>> = Vec::new();
    for sink in sinks {
        let in_use = kept.iter().any(|k| same_media_sink(k, sink));
        let listed = result.iter().any(|r| same_media_sink(r, sink));
        if !in_use && !listed {
            result.push(Arc::clone(sink));
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn next_event(session: &Session) -> Event {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match session.get_event(GetEventFlags::NoWait) {
                Ok(event) => return event,
                Err(MediaError::NoEventsAvailable) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(e) => panic!("no event: {}", e),
            }
        }
    }

    #[test]
    fn test_commands_need_a_topology() {
        let session = Session::new().unwrap();

        assert_eq!(
            session.start(TimeFormat::Default, StartPosition::Current).unwrap_err(),
            MediaError::InvalidRequest
        );
        assert_eq!(session.pause().unwrap_err(), MediaError::InvalidRequest);
        assert_eq!(session.stop().unwrap_err(), MediaError::InvalidRequest);
        assert_eq!(session.clear_topologies().unwrap_err(), MediaError::InvalidRequest);
        assert_eq!(session.clock().unwrap_err(), MediaError::NoClock);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_empty_topology_rejected() {
        let session = Session::new().unwrap();
        assert!(matches!(
            session.set_topology(SetTopologyFlags::empty(), Arc::new(Topology::new())),
            Err(MediaError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_close_posts_once() {
        let session = Session::new().unwrap();

        session.close().unwrap();
        session.close().unwrap();
        let event = next_event(&session);
        assert_eq!(event.kind, EventKind::SessionClosed);
        assert!(event.is_ok());

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(
            session.get_event(GetEventFlags::NoWait).unwrap_err(),
            MediaError::NoEventsAvailable
        );
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(
            session.set_rate(false, 1.0).unwrap_err(),
            MediaError::InvalidRequest
        );
    }

    #[test]
    fn test_shutdown_is_terminal() {
        let session = Session::new().unwrap();

        session.shutdown().unwrap();
        assert_eq!(session.shutdown().unwrap_err(), MediaError::Shutdown);
        assert_eq!(session.close().unwrap_err(), MediaError::Shutdown);
        assert_eq!(
            session.start(TimeFormat::Default, StartPosition::Current).unwrap_err(),
            MediaError::Shutdown
        );
        assert_eq!(session.clock().unwrap_err(), MediaError::Shutdown);
        assert_eq!(session.shutdown_status(), ShutdownStatus::Completed);
        assert_eq!(session.state(), SessionState::ShutDown);
        assert_eq!(
            session.get_event(GetEventFlags::NoWait).unwrap_err(),
            MediaError::Shutdown
        );
    }

    #[test]
    fn test_rate_limits_without_presentation() {
        let session = Session::new().unwrap();

        assert_eq!(session.fastest_rate(RateDirection::Forward, false).unwrap(), 8.0);
        assert_eq!(session.is_rate_supported(false, 2.0).unwrap(), 2.0);
        assert_eq!(
            session.is_rate_supported(false, 16.0).unwrap_err(),
            MediaError::UnsupportedRate { nearest: 8.0 }
        );
        assert!(session.is_rate_supported(false, -1.0).is_err());
        assert_eq!(
            session.is_rate_supported(true, 1.0).unwrap_err(),
            MediaError::ThinningUnsupported
        );

        session.set_rate(false, 2.0).unwrap();
        let event = next_event(&session);
        assert_eq!(event.kind, EventKind::SessionRateChanged);
        assert_eq!(event.value.as_double(), Some(2.0));
        assert_eq!(session.rate().unwrap(), (false, 2.0));
    }
}
