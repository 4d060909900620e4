//! FIFO event queue with single-subscriber asynchronous delivery.
//!
//! Subscription is one-shot: a registered callback is scheduled once when an
//! event is (or already was) available, and the registration is cleared at
//! that moment. The callback redeems its [`AsyncResult`] with
//! [`EventQueue::end_get_event`] to receive the oldest event and must call
//! `begin_get_event` again to hear about the next one.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::dispatch::Dispatcher;
use crate::error::{MediaError, MediaResult};
use crate::event::{
    same_callback, same_state, AsyncCallback, AsyncResult, BeginOutcome, CallbackState, Event,
    GetEventFlags, MediaEventGenerator,
};

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueMode {
    Open,
    /// No new events accepted; consumers may still drain what is queued.
    Draining,
    Shutdown,
}

struct Subscriber {
    callback: Arc<dyn AsyncCallback>,
    state: Option<CallbackState>,
}

struct QueueState {
    events: VecDeque<Event>,
    subscriber: Option<Subscriber>,
    /// Tickets handed to callbacks and not yet redeemed.
    outstanding: HashSet<u64>,
    next_ticket: u64,
    mode: QueueMode,
    /// Registration still held when the queue shut down. Kept alive until the
    /// queue itself is dropped.
    retained: Option<Subscriber>,
}

/// FIFO event queue used by every event-generating object.
pub struct EventQueue {
    id: u64,
    state: Mutex<QueueState>,
    available: Condvar,
    dispatcher: Arc<Dispatcher>,
}

impl EventQueue {
    /// Queue delivering callbacks on the shared worker pool.
    pub fn new() -> MediaResult<Self> {
        Ok(Self::with_dispatcher(Dispatcher::shared_workers()?))
    }

    pub fn with_dispatcher(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            id: NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(QueueState {
                events: VecDeque::new(),
                subscriber: None,
                outstanding: HashSet::new(),
                next_ticket: 1,
                mode: QueueMode::Open,
                retained: None,
            }),
            available: Condvar::new(),
            dispatcher,
        }
    }

    /// Append an event and wake whoever is waiting for one.
    pub fn queue_event(&self, event: Event) -> MediaResult<()> {
        let mut state = self.state.lock();
        if state.mode != QueueMode::Open {
            return Err(MediaError::Shutdown);
        }

        trace!("queue {}: {:?} ({:?})", self.id, event.kind, event.status);
        state.events.push_back(event);
        self.available.notify_one();
        self.notify_subscriber(&mut state);
        Ok(())
    }

    /// Register for one asynchronous delivery.
    ///
    /// Re-registering the identical callback and state is harmless and reports
    /// [`BeginOutcome::AlreadyRegistered`]. The same callback with a different
    /// state fails with [`MediaError::MultipleBegin`]; any other callback fails
    /// with [`MediaError::MultipleSubscribers`]. None of these disturb the
    /// registration already in place.
    pub fn begin_get_event(
        &self,
        callback: Arc<dyn AsyncCallback>,
        state: Option<CallbackState>,
    ) -> MediaResult<BeginOutcome> {
        let mut queue = self.state.lock();
        self.check_readable(&queue)?;

        if let Some(existing) = &queue.subscriber {
            if !same_callback(&existing.callback, &callback) {
                return Err(MediaError::MultipleSubscribers);
            }
            if !same_state(&existing.state, &state) {
                return Err(MediaError::MultipleBegin);
            }
            return Ok(BeginOutcome::AlreadyRegistered);
        }

        queue.subscriber = Some(Subscriber { callback, state });
        self.notify_subscriber(&mut queue);
        Ok(BeginOutcome::Registered)
    }

    /// Redeem a delivery and pop the oldest event.
    pub fn end_get_event(&self, result: &AsyncResult) -> MediaResult<Event> {
        let mut state = self.state.lock();
        if result.queue_id != self.id {
            return Err(MediaError::InvalidArgument("result belongs to another queue"));
        }
        self.check_readable(&state)?;
        if !state.outstanding.remove(&result.ticket) {
            return Err(MediaError::InvalidArgument("result was not issued or already redeemed"));
        }

        let event = state.events.pop_front().ok_or(MediaError::NoEventsAvailable)?;
        self.finish_drain(&mut state);
        Ok(event)
    }

    /// Synchronous retrieval. Not allowed while an asynchronous subscriber is
    /// registered.
    pub fn get_event(&self, flags: GetEventFlags) -> MediaResult<Event> {
        let mut state = self.state.lock();
        loop {
            self.check_readable(&state)?;
            if state.subscriber.is_some() {
                return Err(MediaError::MultipleSubscribers);
            }

            if let Some(event) = state.events.pop_front() {
                self.finish_drain(&mut state);
                return Ok(event);
            }

            match flags {
                GetEventFlags::NoWait => return Err(MediaError::NoEventsAvailable),
                GetEventFlags::Blocking => self.available.wait(&mut state),
            }
        }
    }

    /// Terminal. Queued events are dropped and every later call, including
    /// redeeming results already handed out, fails with
    /// [`MediaError::Shutdown`]. A callback still registered at this point is
    /// retained, not released, for as long as the queue lives.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        if state.mode == QueueMode::Shutdown {
            return;
        }
        self.shut(&mut state);
    }

    /// Stop accepting events but let consumers drain what is queued. Once the
    /// queue is empty it behaves exactly as after [`shutdown`](Self::shutdown).
    pub fn shutdown_after_drain(&self) {
        let mut state = self.state.lock();
        if state.mode != QueueMode::Open {
            return;
        }
        state.mode = QueueMode::Draining;
        debug!("queue {} draining {} events", self.id, state.events.len());
        self.finish_drain(&mut state);
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.lock().mode == QueueMode::Shutdown
    }

    /// Number of events waiting.
    pub fn len(&self) -> usize {
        self.state.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_readable(&self, state: &QueueState) -> MediaResult<()> {
        match state.mode {
            QueueMode::Shutdown => Err(MediaError::Shutdown),
            QueueMode::Draining if state.events.is_empty() => Err(MediaError::Shutdown),
            _ => Ok(()),
        }
    }

    /// Hand the registered callback its one delivery if there is something to
    /// deliver.
    fn notify_subscriber(&self, state: &mut QueueState) {
        if state.events.is_empty() {
            return;
        }
        let Some(subscriber) = state.subscriber.take() else {
            return;
        };

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.outstanding.insert(ticket);

        let callback = Arc::clone(&subscriber.callback);
        let result = AsyncResult::new(self.id, ticket, subscriber.callback, subscriber.state);
        self.dispatcher.put_work_item(move || callback.invoke(result));
    }

    fn finish_drain(&self, state: &mut QueueState) {
        if state.mode == QueueMode::Draining && state.events.is_empty() {
            self.shut(state);
        }
    }

    fn shut(&self, state: &mut QueueState) {
        state.mode = QueueMode::Shutdown;
        state.events.clear();
        state.outstanding.clear();
        state.retained = state.subscriber.take();
        self.available.notify_all();
        debug!("queue {} shut down", self.id);
    }
}

impl MediaEventGenerator for EventQueue {
    fn begin_get_event(
        &self,
        callback: Arc<dyn AsyncCallback>,
        state: Option<CallbackState>,
    ) -> MediaResult<BeginOutcome> {
        EventQueue::begin_get_event(self, callback, state)
    }

    fn end_get_event(&self, result: &AsyncResult) -> MediaResult<Event> {
        EventQueue::end_get_event(self, result)
    }

    fn get_event(&self, flags: GetEventFlags) -> MediaResult<Event> {
        EventQueue::get_event(self, flags)
    }

    fn queue_event(&self, event: Event) -> MediaResult<()> {
        EventQueue::queue_event(self, event)
    }
}

impl std::fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("EventQueue")
            .field("id", &self.id)
            .field("events", &state.events.len())
            .field("subscribed", &state.subscriber.is_some())
            .field("mode", &state.mode)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use std::sync::mpsc;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(2);

    fn channel_callback() -> (Arc<dyn AsyncCallback>, mpsc::Receiver<AsyncResult>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let callback: Arc<dyn AsyncCallback> = Arc::new(move |result: AsyncResult| {
            let _ = tx.lock().send(result);
        });
        (callback, rx)
    }

    fn state_of(tag: &'static str) -> Option<CallbackState> {
        Some(Arc::new(tag))
    }

    #[test]
    fn test_get_is_fifo() {
        let queue = EventQueue::new().unwrap();
        queue.queue_event(Event::new(EventKind::SourceStarted)).unwrap();
        queue.queue_event(Event::new(EventKind::SourcePaused)).unwrap();

        assert_eq!(queue.get_event(GetEventFlags::NoWait).unwrap().kind, EventKind::SourceStarted);
        assert_eq!(queue.get_event(GetEventFlags::NoWait).unwrap().kind, EventKind::SourcePaused);
        assert_eq!(
            queue.get_event(GetEventFlags::NoWait).unwrap_err(),
            MediaError::NoEventsAvailable
        );
    }

    #[test]
    fn test_blocking_get_waits_for_event() {
        let queue = Arc::new(EventQueue::new().unwrap());
        let producer = Arc::clone(&queue);

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            producer.queue_event(Event::new(EventKind::SessionStarted)).unwrap();
        });

        let event = queue.get_event(GetEventFlags::Blocking).unwrap();
        assert_eq!(event.kind, EventKind::SessionStarted);
        handle.join().unwrap();
    }

    #[test]
    fn test_blocking_get_released_by_shutdown() {
        let queue = Arc::new(EventQueue::new().unwrap());
        let closer = Arc::clone(&queue);

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            closer.shutdown();
        });

        assert_eq!(
            queue.get_event(GetEventFlags::Blocking).unwrap_err(),
            MediaError::Shutdown
        );
        handle.join().unwrap();
    }

    #[test]
    fn test_async_delivery_is_one_shot() {
        let queue = EventQueue::new().unwrap();
        let (callback, rx) = channel_callback();

        assert_eq!(
            queue.begin_get_event(Arc::clone(&callback), None).unwrap(),
            BeginOutcome::Registered
        );
        queue.queue_event(Event::new(EventKind::SourceStarted)).unwrap();
        queue.queue_event(Event::new(EventKind::SourceStopped)).unwrap();

        let result = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(queue.end_get_event(&result).unwrap().kind, EventKind::SourceStarted);

        // No second delivery without a new registration
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        queue.begin_get_event(Arc::clone(&callback), None).unwrap();
        let result = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(queue.end_get_event(&result).unwrap().kind, EventKind::SourceStopped);
    }

    #[test]
    fn test_callback_runs_on_dispatcher_thread() {
        let queue = EventQueue::new().unwrap();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let callback: Arc<dyn AsyncCallback> = Arc::new(move |_result: AsyncResult| {
            let _ = tx.lock().send(std::thread::current().id());
        });

        queue.begin_get_event(callback, None).unwrap();
        queue.queue_event(Event::new(EventKind::NewStream)).unwrap();

        let thread = rx.recv_timeout(WAIT).unwrap();
        assert_ne!(thread, std::thread::current().id());
    }

    #[test]
    fn test_duplicate_begin_variants() {
        let queue = EventQueue::new().unwrap();
        let (callback, rx) = channel_callback();
        let (other, other_rx) = channel_callback();
        let state = state_of("first");

        queue.begin_get_event(Arc::clone(&callback), state.clone()).unwrap();

        assert_eq!(
            queue.begin_get_event(Arc::clone(&callback), state.clone()).unwrap(),
            BeginOutcome::AlreadyRegistered
        );
        assert_eq!(
            queue
                .begin_get_event(Arc::clone(&callback), state_of("second"))
                .unwrap_err(),
            MediaError::MultipleBegin
        );
        assert_eq!(
            queue.begin_get_event(Arc::clone(&other), state.clone()).unwrap_err(),
            MediaError::MultipleSubscribers
        );

        // The original registration still gets exactly one delivery
        queue.queue_event(Event::new(EventKind::SessionStarted)).unwrap();
        let result = rx.recv_timeout(WAIT).unwrap();
        assert!(same_state(&result.state().cloned(), &state));
        assert_eq!(queue.end_get_event(&result).unwrap().kind, EventKind::SessionStarted);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert!(other_rx.recv_timeout(Duration::from_millis(10)).is_err());
    }

    #[test]
    fn test_begin_with_queued_event_delivers_immediately() {
        let queue = EventQueue::new().unwrap();
        queue.queue_event(Event::new(EventKind::SessionClosed)).unwrap();

        let (callback, rx) = channel_callback();
        queue.begin_get_event(callback, None).unwrap();

        let result = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(queue.end_get_event(&result).unwrap().kind, EventKind::SessionClosed);
    }

    #[test]
    fn test_end_rejects_foreign_and_reused_results() {
        let queue = EventQueue::new().unwrap();
        let foreign = EventQueue::new().unwrap();
        let (callback, rx) = channel_callback();

        foreign.begin_get_event(Arc::clone(&callback), None).unwrap();
        foreign.queue_event(Event::new(EventKind::SourceStarted)).unwrap();
        let foreign_result = rx.recv_timeout(WAIT).unwrap();

        assert!(matches!(
            queue.end_get_event(&foreign_result),
            Err(MediaError::InvalidArgument(_))
        ));

        foreign.end_get_event(&foreign_result).unwrap();
        assert!(matches!(
            foreign.end_get_event(&foreign_result),
            Err(MediaError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_sync_get_refused_while_subscribed() {
        let queue = EventQueue::new().unwrap();
        let (callback, _rx) = channel_callback();
        queue.begin_get_event(callback, None).unwrap();

        assert_eq!(
            queue.get_event(GetEventFlags::NoWait).unwrap_err(),
            MediaError::MultipleSubscribers
        );
    }

    #[test]
    fn test_shutdown_is_terminal() {
        let queue = EventQueue::new().unwrap();
        let (callback, rx) = channel_callback();

        queue.begin_get_event(Arc::clone(&callback), None).unwrap();
        queue.queue_event(Event::new(EventKind::SourceStarted)).unwrap();
        let pending = rx.recv_timeout(WAIT).unwrap();

        queue.shutdown();
        queue.shutdown();

        assert_eq!(queue.end_get_event(&pending).unwrap_err(), MediaError::Shutdown);
        assert_eq!(
            queue.queue_event(Event::new(EventKind::SourceStopped)).unwrap_err(),
            MediaError::Shutdown
        );
        assert_eq!(
            queue.begin_get_event(callback, None).unwrap_err(),
            MediaError::Shutdown
        );
        assert_eq!(
            queue.get_event(GetEventFlags::NoWait).unwrap_err(),
            MediaError::Shutdown
        );
        assert!(queue.is_shutdown());
    }

    #[test]
    fn test_shutdown_retains_registered_callback() {
        let queue = EventQueue::new().unwrap();
        let (callback, _rx) = channel_callback();

        queue.begin_get_event(Arc::clone(&callback), None).unwrap();
        queue.shutdown();
        assert_eq!(Arc::strong_count(&callback), 2);

        drop(queue);
        assert_eq!(Arc::strong_count(&callback), 1);
    }

    #[test]
    fn test_drain_then_shutdown() {
        let queue = EventQueue::new().unwrap();
        queue.queue_event(Event::new(EventKind::SessionStarted)).unwrap();
        queue.shutdown_after_drain();

        assert_eq!(
            queue.queue_event(Event::new(EventKind::SessionStopped)).unwrap_err(),
            MediaError::Shutdown
        );
        assert_eq!(
            queue.get_event(GetEventFlags::NoWait).unwrap().kind,
            EventKind::SessionStarted
        );
        assert!(queue.is_shutdown());
        assert_eq!(
            queue.get_event(GetEventFlags::Blocking).unwrap_err(),
            MediaError::Shutdown
        );
    }
}
