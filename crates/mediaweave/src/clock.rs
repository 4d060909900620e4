//! Presentation clock
//!
//! Derives presentation time from a pluggable [`PresentationTimeSource`]. The
//! clock keeps an anchor pair (presentation time, raw time) recaptured at every
//! state transition and rate change, so the presentation time
//! `anchor + (raw - anchor_raw) * rate` is continuous across both.
//!
//! Every legal transition is announced to the time source first and then to
//! each registered [`ClockStateSink`], synchronously, before the transition
//! call returns.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bitflags::bitflags;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::dispatch::Dispatcher;
use crate::error::{MediaError, MediaResult};
use crate::time::{MediaTime, StartPosition, UNITS_PER_SECOND};

// =============================================================================
// STATES AND CONTRACTS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ClockState {
    /// Never started.
    #[default]
    Invalid,
    Running,
    Paused,
    Stopped,
}

/// Progress of an object's shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ShutdownStatus {
    #[default]
    NotInitiated,
    Initiated,
    Completed,
}

/// Receives clock transitions. Implemented by sinks and time sources.
pub trait ClockStateSink: Send + Sync {
    fn on_clock_start(&self, system_time: MediaTime, start_offset: StartPosition)
        -> MediaResult<()>;

    fn on_clock_stop(&self, system_time: MediaTime) -> MediaResult<()>;

    fn on_clock_pause(&self, system_time: MediaTime) -> MediaResult<()>;

    /// Paused to running at the current position.
    fn on_clock_restart(&self, system_time: MediaTime) -> MediaResult<()>;

    fn on_clock_set_rate(&self, system_time: MediaTime, rate: f32) -> MediaResult<()>;
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ClockCharacteristics: u32 {
        const FREQUENCY_10MHZ = 0x2;
        const ALWAYS_RUNNING = 0x4;
        const IS_SYSTEM_CLOCK = 0x8;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockProperties {
    /// Raw ticks per second of the correlation clock.
    pub correlation_rate: u64,
    /// Ticks per second of the clock itself.
    pub clock_frequency: u64,
    pub tolerance_ppm: u32,
    pub jitter: u32,
}

impl Default for ClockProperties {
    fn default() -> Self {
        Self {
            correlation_rate: UNITS_PER_SECOND as u64,
            clock_frequency: UNITS_PER_SECOND as u64,
            tolerance_ppm: 50,
            jitter: 1,
        }
    }
}

/// Raw monotonic time plus its own run state, kept in step by the clock's
/// notifications.
pub trait PresentationTimeSource: ClockStateSink {
    fn raw_time(&self) -> MediaTime;

    fn state(&self) -> ClockState;

    fn characteristics(&self) -> ClockCharacteristics;

    fn properties(&self) -> ClockProperties {
        ClockProperties::default()
    }
}

// =============================================================================
// SYSTEM TIME SOURCE
// =============================================================================

#[derive(Debug)]
struct SystemSourceState {
    state: ClockState,
    rate: f32,
}

/// Time source backed by the monotonic system clock.
#[derive(Debug)]
pub struct SystemTimeSource {
    inner: Mutex<SystemSourceState>,
}

impl SystemTimeSource {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SystemSourceState {
                state: ClockState::Invalid,
                rate: 1.0,
            }),
        }
    }

    pub fn rate(&self) -> f32 {
        self.inner.lock().rate
    }
}

impl Default for SystemTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockStateSink for SystemTimeSource {
    fn on_clock_start(&self, _system_time: MediaTime, _offset: StartPosition) -> MediaResult<()> {
        self.inner.lock().state = ClockState::Running;
        Ok(())
    }

    fn on_clock_stop(&self, _system_time: MediaTime) -> MediaResult<()> {
        self.inner.lock().state = ClockState::Stopped;
        Ok(())
    }

    fn on_clock_pause(&self, _system_time: MediaTime) -> MediaResult<()> {
        self.inner.lock().state = ClockState::Paused;
        Ok(())
    }

    fn on_clock_restart(&self, _system_time: MediaTime) -> MediaResult<()> {
        self.inner.lock().state = ClockState::Running;
        Ok(())
    }

    fn on_clock_set_rate(&self, _system_time: MediaTime, rate: f32) -> MediaResult<()> {
        let mut inner = self.inner.lock();
        // The system clock cannot stand still
        if rate == 0.0 {
            return Err(MediaError::UnsupportedRate { nearest: inner.rate });
        }
        inner.rate = rate;
        Ok(())
    }
}

impl PresentationTimeSource for SystemTimeSource {
    fn raw_time(&self) -> MediaTime {
        MediaTime::system_now()
    }

    fn state(&self) -> ClockState {
        self.inner.lock().state
    }

    fn characteristics(&self) -> ClockCharacteristics {
        ClockCharacteristics::FREQUENCY_10MHZ
            | ClockCharacteristics::IS_SYSTEM_CLOCK
            | ClockCharacteristics::ALWAYS_RUNNING
    }
}

// =============================================================================
// TIMERS
// =============================================================================

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TimerFlags: u32 {
        /// Due time is relative to the current presentation time.
        const RELATIVE = 0x1;
    }
}

#[derive(Debug)]
struct TimerShared {
    done: AtomicBool,
    abort: Mutex<Option<AbortHandle>>,
}

impl TimerShared {
    fn cancel(&self) -> bool {
        let was_pending = !self.done.swap(true, Ordering::SeqCst);
        if let Some(handle) = self.abort.lock().take() {
            handle.abort();
        }
        was_pending
    }
}

/// Armed timer. Dropping the key cancels the timer unless it already fired
/// or was [detached](TimerKey::detach).
#[must_use = "dropping a TimerKey cancels the timer"]
#[derive(Debug)]
pub struct TimerKey {
    shared: Arc<TimerShared>,
    detached: bool,
}

impl TimerKey {
    /// Cancel; returns false if the timer already fired or was cancelled.
    pub fn cancel(mut self) -> bool {
        self.detached = true;
        self.shared.cancel()
    }

    pub fn is_pending(&self) -> bool {
        !self.shared.done.load(Ordering::SeqCst)
    }

    /// Let the timer fire without holding the key.
    pub fn detach(mut self) {
        self.detached = true;
    }
}

impl Drop for TimerKey {
    fn drop(&mut self) {
        if !self.detached {
            self.shared.cancel();
        }
    }
}

// =============================================================================
// PRESENTATION CLOCK
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum Transition {
    Start(StartPosition),
    Stop,
    Pause,
}

#[derive(Debug, Clone, Copy)]
enum Notification {
    Start(StartPosition),
    Restart,
    Stop,
    Pause,
}

struct ClockInner {
    time_source: Option<Arc<dyn PresentationTimeSource>>,
    sinks: Vec<Arc<dyn ClockStateSink>>,
    state: ClockState,
    rate: f32,
    /// Rate set while Invalid, announced with the first start.
    rate_pending: bool,
    anchor_time: i64,
    anchor_raw: i64,
    shutdown: ShutdownStatus,
    timers: Vec<Weak<TimerShared>>,
}

impl ClockInner {
    fn ensure_live(&self) -> MediaResult<()> {
        if self.shutdown != ShutdownStatus::NotInitiated {
            return Err(MediaError::Shutdown);
        }
        Ok(())
    }

    fn time_source(&self) -> MediaResult<Arc<dyn PresentationTimeSource>> {
        self.time_source.clone().ok_or(MediaError::NoTimeSource)
    }

    fn time_at(&self, raw: MediaTime) -> i64 {
        match self.state {
            ClockState::Running => {
                self.anchor_time + ((raw.0 - self.anchor_raw) as f64 * self.rate as f64) as i64
            }
            ClockState::Paused => self.anchor_time,
            ClockState::Invalid | ClockState::Stopped => 0,
        }
    }

    fn check(&self, transition: Transition) -> MediaResult<Notification> {
        use ClockState::*;
        match (transition, self.state) {
            (Transition::Pause, Invalid | Stopped) => Err(MediaError::InvalidRequest),
            (Transition::Pause, Paused) | (Transition::Stop, Stopped) => {
                Err(MediaError::ClockStateAlreadySet)
            }
            (Transition::Start(StartPosition::Current), Running) => {
                Err(MediaError::ClockStateAlreadySet)
            }
            (Transition::Start(StartPosition::Current), Paused) => Ok(Notification::Restart),
            (Transition::Start(position), _) => Ok(Notification::Start(position)),
            (Transition::Stop, _) => Ok(Notification::Stop),
            (Transition::Pause, _) => Ok(Notification::Pause),
        }
    }

    fn apply(&mut self, notification: Notification, raw: MediaTime) {
        let now = self.time_at(raw);
        let (state, anchor) = match notification {
            Notification::Start(StartPosition::At(position)) => (ClockState::Running, position.0),
            Notification::Start(StartPosition::Current) => (ClockState::Running, now),
            Notification::Restart => (ClockState::Running, now),
            Notification::Pause => (ClockState::Paused, now),
            Notification::Stop => (ClockState::Stopped, 0),
        };
        self.state = state;
        self.anchor_time = anchor;
        self.anchor_raw = raw.0;
    }
}

/// Shared presentation timeline for one topology generation.
pub struct PresentationClock {
    /// Serializes state changes; held across sink notifications.
    transition: Mutex<()>,
    inner: Mutex<ClockInner>,
    timer_dispatcher: Arc<Dispatcher>,
}

impl PresentationClock {
    /// Clock whose timers run on the shared timer pool.
    pub fn new() -> MediaResult<Self> {
        Ok(Self::with_timer_dispatcher(Dispatcher::shared_timers()?))
    }

    pub fn with_timer_dispatcher(timer_dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            transition: Mutex::new(()),
            inner: Mutex::new(ClockInner {
                time_source: None,
                sinks: Vec::new(),
                state: ClockState::Invalid,
                rate: 1.0,
                rate_pending: false,
                anchor_time: 0,
                anchor_raw: 0,
                shutdown: ShutdownStatus::NotInitiated,
                timers: Vec::new(),
            }),
            timer_dispatcher,
        }
    }

    // === Time source ===

    pub fn set_time_source(&self, time_source: Arc<dyn PresentationTimeSource>) -> MediaResult<()> {
        let _serial = self.transition.lock();
        let mut inner = self.inner.lock();
        inner.ensure_live()?;
        inner.time_source = Some(time_source);
        Ok(())
    }

    pub fn time_source(&self) -> MediaResult<Arc<dyn PresentationTimeSource>> {
        self.inner.lock().time_source()
    }

    // === Time queries ===

    /// Current presentation time.
    pub fn time(&self) -> MediaResult<MediaTime> {
        self.correlated_time().map(|(time, _)| time)
    }

    /// Presentation time together with the raw time it was derived from.
    pub fn correlated_time(&self) -> MediaResult<(MediaTime, MediaTime)> {
        let inner = self.inner.lock();
        let source = inner.time_source()?;
        let raw = source.raw_time();
        Ok((MediaTime(inner.time_at(raw)), raw))
    }

    pub fn state(&self) -> ClockState {
        self.inner.lock().state
    }

    pub fn characteristics(&self) -> MediaResult<ClockCharacteristics> {
        Ok(self.inner.lock().time_source()?.characteristics())
    }

    pub fn properties(&self) -> MediaResult<ClockProperties> {
        Ok(self.inner.lock().time_source()?.properties())
    }

    /// Key identifying this clock's continuity. Never changes.
    pub fn continuity_key(&self) -> u32 {
        0
    }

    pub fn shutdown_status(&self) -> ShutdownStatus {
        self.inner.lock().shutdown
    }

    // === Sinks ===

    /// Register a sink. The clock holds it until it is removed.
    pub fn add_clock_state_sink(&self, sink: Arc<dyn ClockStateSink>) -> MediaResult<()> {
        let _serial = self.transition.lock();
        let mut inner = self.inner.lock();
        inner.ensure_live()?;
        if inner.sinks.iter().any(|s| same_sink(s, &sink)) {
            return Err(MediaError::InvalidArgument("sink already registered"));
        }
        inner.sinks.push(sink);
        Ok(())
    }

    /// Unregister a sink. Unknown sinks are ignored.
    pub fn remove_clock_state_sink(&self, sink: &Arc<dyn ClockStateSink>) -> MediaResult<()> {
        let _serial = self.transition.lock();
        let mut inner = self.inner.lock();
        inner.ensure_live()?;
        inner.sinks.retain(|s| !same_sink(s, sink));
        Ok(())
    }

    pub fn sink_count(&self) -> usize {
        self.inner.lock().sinks.len()
    }

    // === Transport ===

    pub fn start(&self, position: StartPosition) -> MediaResult<()> {
        self.change_state(Transition::Start(position))
    }

    pub fn stop(&self) -> MediaResult<()> {
        self.change_state(Transition::Stop)
    }

    pub fn pause(&self) -> MediaResult<()> {
        self.change_state(Transition::Pause)
    }

    fn change_state(&self, transition: Transition) -> MediaResult<()> {
        let _serial = self.transition.lock();

        let (source, sinks, notification, raw, pending_rate) = {
            let inner = self.inner.lock();
            inner.ensure_live()?;
            let source = inner.time_source()?;
            let notification = inner.check(transition)?;
            let pending_rate = inner.rate_pending.then_some(inner.rate);
            let raw = source.raw_time();
            (source, inner.sinks.clone(), notification, raw, pending_rate)
        };

        if let Some(rate) = pending_rate {
            announce_rate(source.as_ref(), &sinks, raw, rate);
        }

        notify(source.as_ref(), notification, raw)?;

        {
            let mut inner = self.inner.lock();
            inner.apply(notification, raw);
            inner.rate_pending = false;
            debug!("clock {:?} at raw {}", notification, raw);
        }

        for sink in &sinks {
            if let Err(e) = notify(sink.as_ref(), notification, raw) {
                warn!("clock sink rejected {:?}: {}", notification, e);
            }
        }
        Ok(())
    }

    // === Rate ===

    /// Change the playback rate. Thinning is never supported by the clock.
    pub fn set_rate(&self, thin: bool, rate: f32) -> MediaResult<()> {
        let _serial = self.transition.lock();

        let (source, sinks, raw) = {
            let mut inner = self.inner.lock();
            inner.ensure_live()?;
            if thin {
                return Err(MediaError::ThinningUnsupported);
            }
            let source = inner.time_source()?;

            if inner.state == ClockState::Invalid {
                inner.rate = rate;
                inner.rate_pending = true;
                debug!("clock rate {} cached until first start", rate);
                return Ok(());
            }

            let raw = source.raw_time();
            let now = inner.time_at(raw);
            inner.anchor_time = now;
            inner.anchor_raw = raw.0;
            inner.rate = rate;
            (source, inner.sinks.clone(), raw)
        };

        info!("clock rate set to {}", rate);
        announce_rate(source.as_ref(), &sinks, raw, rate);
        Ok(())
    }

    /// Current rate and whether thinning is on (never).
    pub fn rate(&self) -> (bool, f32) {
        (false, self.inner.lock().rate)
    }

    // === Timers ===

    /// Arm a one-shot timer. The wall-clock delay is computed from the rate
    /// in effect now; later rate changes do not move an armed timer.
    pub fn set_timer<F>(&self, flags: TimerFlags, due: MediaTime, callback: F) -> MediaResult<TimerKey>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut inner = self.inner.lock();
        inner.ensure_live()?;
        let source = inner.time_source()?;
        if inner.rate == 0.0 {
            return Err(MediaError::InvalidRequest);
        }

        let now = inner.time_at(source.raw_time());
        let remaining = if flags.contains(TimerFlags::RELATIVE) {
            due.0
        } else {
            due.0 - now
        };
        // Tiny rates stretch long spans past i64; clamp before converting
        let scaled = remaining as f64 / inner.rate.abs() as f64;
        let wall = MediaTime(scaled.clamp(0.0, i64::MAX as f64) as i64).to_duration();

        let shared = Arc::new(TimerShared {
            done: AtomicBool::new(false),
            abort: Mutex::new(None),
        });
        let fired = Arc::clone(&shared);
        let handle = self.timer_dispatcher.spawn(async move {
            tokio::time::sleep(wall).await;
            if !fired.done.swap(true, Ordering::SeqCst) {
                callback();
            }
        });
        *shared.abort.lock() = Some(handle.abort_handle());

        inner.timers.retain(|t| t.strong_count() > 0);
        inner.timers.push(Arc::downgrade(&shared));
        debug!("timer armed for {:?} wall time", wall);

        Ok(TimerKey {
            shared,
            detached: false,
        })
    }

    /// Cancel a timer; false if it already fired.
    pub fn cancel_timer(&self, key: TimerKey) -> bool {
        key.cancel()
    }

    // === Shutdown ===

    /// Cancel armed timers and refuse every further mutation. Queries keep
    /// working.
    pub fn shutdown(&self) {
        let _serial = self.transition.lock();
        let timers = {
            let mut inner = self.inner.lock();
            if inner.shutdown != ShutdownStatus::NotInitiated {
                return;
            }
            inner.shutdown = ShutdownStatus::Initiated;
            std::mem::take(&mut inner.timers)
        };

        for timer in timers.iter().filter_map(Weak::upgrade) {
            timer.cancel();
        }

        self.inner.lock().shutdown = ShutdownStatus::Completed;
        debug!("clock shut down");
    }
}

impl std::fmt::Debug for PresentationClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("PresentationClock")
            .field("state", &inner.state)
            .field("rate", &inner.rate)
            .field("sinks", &inner.sinks.len())
            .field("shutdown", &inner.shutdown)
            .finish()
    }
}

fn same_sink(a: &Arc<dyn ClockStateSink>, b: &Arc<dyn ClockStateSink>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

fn notify<S: ClockStateSink + ?Sized>(
    sink: &S,
    notification: Notification,
    raw: MediaTime,
) -> MediaResult<()> {
    match notification {
        Notification::Start(position) => sink.on_clock_start(raw, position),
        Notification::Restart => sink.on_clock_restart(raw),
        Notification::Stop => sink.on_clock_stop(raw),
        Notification::Pause => sink.on_clock_pause(raw),
    }
}

fn announce_rate(
    source: &dyn PresentationTimeSource,
    sinks: &[Arc<dyn ClockStateSink>],
    raw: MediaTime,
    rate: f32,
) {
    if let Err(e) = source.on_clock_set_rate(raw, rate) {
        debug!("time source kept its rate for {}: {}", rate, e);
    }
    for sink in sinks {
        if let Err(e) = sink.on_clock_set_rate(raw, rate) {
            warn!("clock sink rejected rate {}: {}", rate, e);
        }
    }
}
