use std::any::{Any, TypeId};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Select};

use super::{BusEvent, EventBus, Timeout};
use crate::Result;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Result of a single [`Dispatcher::dispatch_once`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A message was delivered to the handler of the named topic.
    Handled(&'static str),
    /// A message arrived on a listened topic that has no handler.
    Discarded(&'static str),
    /// Nothing arrived within the timeout.
    TimedOut,
}

/// Counters reported when a dispatcher thread stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub handled: u64,
    pub discarded: u64,
}

type Handler<T> = Box<dyn FnMut(&T) + Send>;

trait Route: Send {
    fn event_type(&self) -> TypeId;
    fn register<'a>(&'a self, select: &mut Select<'a>) -> usize;
    /// `None` when the readiness report was stale and nothing was taken.
    fn deliver(&mut self) -> Option<DispatchOutcome>;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

struct TypedRoute<T: BusEvent> {
    rx: Receiver<T>,
    handler: Option<Handler<T>>,
}

impl<T: BusEvent> Route for TypedRoute<T> {
    fn event_type(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn register<'a>(&'a self, select: &mut Select<'a>) -> usize {
        select.recv(&self.rx)
    }

    fn deliver(&mut self) -> Option<DispatchOutcome> {
        // Readiness can be stale when another consumer shares the topic.
        let msg = self.rx.try_recv().ok()?;
        Some(match self.handler.as_mut() {
            Some(handler) => {
                handler(&msg);
                DispatchOutcome::Handled(T::TOPIC)
            }
            None => DispatchOutcome::Discarded(T::TOPIC),
        })
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Single consumer that waits on a set of topics and runs one handler per
/// event type.
///
/// Handlers execute on the dispatching thread, one at a time.
pub struct Dispatcher {
    name: &'static str,
    bus: Arc<EventBus>,
    routes: Vec<Box<dyn Route>>,
    poll_interval: Duration,
    stats: DispatchStats,
}

impl Dispatcher {
    pub fn new(name: &'static str, bus: Arc<EventBus>) -> Self {
        Self {
            name,
            bus,
            routes: Vec::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            stats: DispatchStats::default(),
        }
    }

    /// Sets how long the worker thread waits before re-checking its running
    /// flag.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Adds the topic of `T` to the wait-set without a handler. Messages on
    /// it are consumed and discarded until a handler is registered.
    pub fn listen<T: BusEvent>(&mut self) -> &mut Self {
        self.route_mut::<T>();
        self
    }

    /// Registers (or replaces) the handler for `T`.
    pub fn on<T, F>(&mut self, handler: F) -> &mut Self
    where
        T: BusEvent,
        F: FnMut(&T) + Send + 'static,
    {
        self.route_mut::<T>().handler = Some(Box::new(handler));
        self
    }

    /// Removes the handler for `T`; the topic stays in the wait-set.
    pub fn unsubscribe<T: BusEvent>(&mut self) {
        if let Some(route) = self.find_route_mut::<T>() {
            route.handler = None;
        }
    }

    pub fn handles<T: BusEvent>(&self) -> bool {
        self.routes
            .iter()
            .any(|route| route.event_type() == TypeId::of::<T>())
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    /// Waits for the next message on any listened topic and delivers it.
    pub fn dispatch_once(&mut self, timeout: Timeout) -> DispatchOutcome {
        if self.routes.is_empty() {
            if let Timeout::After(limit) = timeout {
                thread::sleep(limit);
            }
            return DispatchOutcome::TimedOut;
        }

        let deadline = match timeout {
            Timeout::After(limit) => Instant::now().checked_add(limit),
            _ => None,
        };
        let outcome = loop {
            let ready = {
                let mut select = Select::new();
                for route in &self.routes {
                    route.register(&mut select);
                }
                match (timeout, deadline) {
                    (Timeout::NoWait, _) => select.try_ready().ok(),
                    (Timeout::After(_), Some(deadline)) => select.ready_deadline(deadline).ok(),
                    (Timeout::Forever, _) | (Timeout::After(_), None) => Some(select.ready()),
                }
            };
            let Some(index) = ready else {
                break DispatchOutcome::TimedOut;
            };
            // A stale report waits again for whatever time is left.
            if let Some(outcome) = self.routes[index].deliver() {
                break outcome;
            }
        };
        match outcome {
            DispatchOutcome::Handled(_) => self.stats.handled += 1,
            DispatchOutcome::Discarded(topic) => {
                self.stats.discarded += 1;
                tracing::trace!(dispatcher = self.name, topic, "no handler, message discarded");
            }
            DispatchOutcome::TimedOut => {}
        }
        outcome
    }

    /// Delivers everything currently pending without waiting.
    pub fn drain(&mut self) -> usize {
        let mut delivered = 0;
        while self.dispatch_once(Timeout::NoWait) != DispatchOutcome::TimedOut {
            delivered += 1;
        }
        delivered
    }

    /// Moves the dispatcher onto its own thread. The loop runs until the
    /// returned handle is stopped.
    pub fn spawn(mut self) -> Result<DispatcherHandle> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let name = self.name;
        let thread = thread::Builder::new()
            .name(format!("dispatch-{name}"))
            .spawn(move || {
                tracing::info!(dispatcher = name, "dispatcher started");
                let poll = Timeout::After(self.poll_interval);
                while flag.load(Ordering::Acquire) {
                    self.dispatch_once(poll);
                }
                tracing::info!(dispatcher = name, stats = ?self.stats, "dispatcher stopped");
                self.stats
            })?;
        Ok(DispatcherHandle {
            name,
            running,
            thread: Some(thread),
        })
    }

    fn find_route_mut<T: BusEvent>(&mut self) -> Option<&mut TypedRoute<T>> {
        self.routes
            .iter_mut()
            .find(|route| route.event_type() == TypeId::of::<T>())
            .and_then(|route| route.as_any_mut().downcast_mut::<TypedRoute<T>>())
    }

    fn route_mut<T: BusEvent>(&mut self) -> &mut TypedRoute<T> {
        if !self.handles::<T>() {
            let rx = self.bus.topic::<T>().receiver().clone();
            self.routes.push(Box::new(TypedRoute::<T> { rx, handler: None }));
        }
        self.find_route_mut::<T>()
            .expect("route for event type was registered above")
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("name", &self.name)
            .field("routes", &self.routes.len())
            .field("poll_interval", &self.poll_interval)
            .field("stats", &self.stats)
            .finish()
    }
}

/// Owner of a running dispatcher thread. Dropping it stops the thread.
pub struct DispatcherHandle {
    name: &'static str,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<DispatchStats>>,
}

impl DispatcherHandle {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Clears the running flag and waits for the current iteration to end.
    pub fn stop(mut self) -> DispatchStats {
        self.shutdown()
    }

    fn shutdown(&mut self) -> DispatchStats {
        self.running.store(false, Ordering::Release);
        match self.thread.take().map(JoinHandle::join) {
            Some(Ok(stats)) => stats,
            Some(Err(_)) => {
                tracing::error!(dispatcher = self.name, "dispatcher thread panicked");
                DispatchStats::default()
            }
            None => DispatchStats::default(),
        }
    }
}

impl Drop for DispatcherHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.shutdown();
        }
    }
}

impl fmt::Debug for DispatcherHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatcherHandle")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::config::QueueConfig;
    use crate::events::{BeatEvent, TickEvent, Timestamp};

    fn bus() -> Arc<EventBus> {
        let bus = Arc::new(EventBus::new(QueueConfig::default()).unwrap());
        bus.initialize();
        bus
    }

    fn beat(ms: u64) -> BeatEvent {
        BeatEvent {
            ts: Timestamp::from_millis(ms),
            bands: [true, false],
        }
    }

    #[test]
    fn delivers_to_registered_handler() {
        let bus = bus();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = Dispatcher::new("test", bus.clone());
        {
            let seen = seen.clone();
            dispatcher.on::<BeatEvent, _>(move |event| seen.lock().unwrap().push(event.ts));
        }

        bus.publish_now(beat(1));
        bus.publish_now(beat(2));

        assert_eq!(dispatcher.dispatch_once(Timeout::NoWait), DispatchOutcome::Handled("BEAT_EVENT"));
        assert_eq!(dispatcher.dispatch_once(Timeout::NoWait), DispatchOutcome::Handled("BEAT_EVENT"));
        assert_eq!(dispatcher.dispatch_once(Timeout::NoWait), DispatchOutcome::TimedOut);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Timestamp::from_millis(1), Timestamp::from_millis(2)]
        );
    }

    #[test]
    fn discards_messages_without_handler() {
        let bus = bus();
        let mut dispatcher = Dispatcher::new("test", bus.clone());
        dispatcher.listen::<TickEvent>();

        bus.publish_now(TickEvent::default());
        assert_eq!(dispatcher.dispatch_once(Timeout::NoWait), DispatchOutcome::Discarded("TICK_EVENT"));
        assert_eq!(bus.topic::<TickEvent>().pending(), 0);
        assert_eq!(dispatcher.stats().discarded, 1);
    }

    #[test]
    fn unsubscribe_keeps_listening() {
        let bus = bus();
        let mut dispatcher = Dispatcher::new("test", bus.clone());
        dispatcher.on::<BeatEvent, _>(|_| {});
        dispatcher.unsubscribe::<BeatEvent>();
        assert!(dispatcher.handles::<BeatEvent>());

        bus.publish_now(beat(5));
        assert_eq!(dispatcher.dispatch_once(Timeout::NoWait), DispatchOutcome::Discarded("BEAT_EVENT"));
    }

    #[test]
    fn waits_across_several_topics() {
        let bus = bus();
        let mut dispatcher = Dispatcher::new("test", bus.clone());
        let ticks = Arc::new(Mutex::new(0));
        let beats = Arc::new(Mutex::new(0));
        {
            let ticks = ticks.clone();
            dispatcher.on::<TickEvent, _>(move |_| *ticks.lock().unwrap() += 1);
        }
        {
            let beats = beats.clone();
            dispatcher.on::<BeatEvent, _>(move |_| *beats.lock().unwrap() += 1);
        }

        bus.publish_now(TickEvent::default());
        bus.publish_now(beat(1));
        bus.publish_now(TickEvent::default());

        assert_eq!(dispatcher.drain(), 3);
        assert_eq!(*ticks.lock().unwrap(), 2);
        assert_eq!(*beats.lock().unwrap(), 1);
    }

    #[test]
    fn drain_outlasts_a_competing_consumer() {
        let bus = bus();
        let beats = Arc::new(Mutex::new(0));
        let mut dispatcher = Dispatcher::new("test", bus.clone());
        {
            let beats = beats.clone();
            dispatcher.on::<BeatEvent, _>(move |_| *beats.lock().unwrap() += 1);
        }
        dispatcher.listen::<TickEvent>();

        let depth = bus.topic::<BeatEvent>().capacity();
        for ms in 0..depth as u64 {
            assert!(bus.publish_now(beat(ms)));
        }

        // Ticks appear and vanish under the dispatcher, so some readiness
        // reports it sees are stale.
        let rival = {
            let bus = bus.clone();
            thread::spawn(move || {
                for _ in 0..20_000 {
                    bus.publish_now(TickEvent::default());
                    let _ = bus.try_subscribe::<TickEvent>();
                }
            })
        };
        loop {
            dispatcher.drain();
            assert_eq!(bus.topic::<BeatEvent>().pending(), 0);
            if rival.is_finished() {
                break;
            }
        }
        rival.join().unwrap();

        assert_eq!(*beats.lock().unwrap(), depth);
        assert_eq!(dispatcher.stats().handled, depth as u64);
    }

    #[test]
    fn stale_readiness_is_not_a_delivery() {
        let bus = bus();
        let mut route = TypedRoute::<TickEvent> {
            rx: bus.topic::<TickEvent>().receiver().clone(),
            handler: None,
        };
        assert_eq!(route.deliver(), None);
        bus.publish_now(TickEvent::default());
        assert_eq!(route.deliver(), Some(DispatchOutcome::Discarded("TICK_EVENT")));
    }

    #[test]
    fn empty_dispatcher_times_out() {
        let mut dispatcher = Dispatcher::new("idle", bus());
        assert_eq!(
            dispatcher.dispatch_once(Timeout::from_millis(1)),
            DispatchOutcome::TimedOut
        );
    }

    #[test]
    fn spawned_dispatcher_stops_cooperatively() {
        let bus = bus();
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut dispatcher =
            Dispatcher::new("threaded", bus.clone()).with_poll_interval(Duration::from_millis(5));
        dispatcher.on::<BeatEvent, _>(move |event| {
            let _ = tx.send(event.ts);
        });

        let handle = dispatcher.spawn().unwrap();
        assert!(bus.publish_now(beat(7)));
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            Timestamp::from_millis(7)
        );

        let stats = handle.stop();
        assert_eq!(stats.handled, 1);
    }
}
