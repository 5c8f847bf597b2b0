use crate::panic_message;
use crate::runtime::clock::Clock;
use crate::runtime::event_driver::{
    BindError, EventQueue, IoDriver, MonitorError, QueueDriver, Readiness, ScheduleError,
    TimerDriver, TimerEntry, TimerId, Watch,
};
use derive_builder::Builder;
use enum_as_inner::EnumAsInner;
use serde_json::Value;
use std::io;
use std::os::fd::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const EVENT_BUFFER_CAPACITY: usize = 64;

/// Execution mode for the reactor loop.
///
/// Spin mode never parks the thread; it polls with a zero timeout and
/// trades high cpu usage for the lowest possible latency.
///
/// Park mode blocks the thread until an event arrives or the nearest timer
/// deadline is due. This trades latency for energy usage and is the right
/// choice for isolate worker threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumAsInner)]
pub enum ExecutionMode {
    Spin,
    Park,
}

/// Lifecycle of the reactor loop.
///
/// `Stopping` is observed between a stop request and the top of the next
/// loop iteration; in-flight callbacks always run to completion first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumAsInner)]
pub enum ReactorState {
    Stopped,
    Running,
    Stopping,
}

#[derive(Debug, thiserror::Error)]
pub enum ReactorError {
    #[error("reactor is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Reactor configuration options.
#[derive(Builder)]
pub struct ReactorConfig {
    #[builder(default = 1024)]
    pub io_capacity: usize,
    #[builder(default = "ExecutionMode::Park")]
    pub mode: ExecutionMode,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        ReactorConfigBuilder::default()
            .build()
            .expect("expected default builder")
    }
}

/// Thread-safe handle for requesting a reactor stop from another thread.
///
/// Sets the stop flag and wakes the blocked poll so the request is observed
/// promptly rather than at the next natural wakeup.
#[derive(Clone)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<mio::Waker>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.flag.store(true, Ordering::Release);
        self.waker.wake().ok();
    }
}

/// The single-threaded scheduler at the core of the runtime.
///
/// A reactor multiplexes three event sources into ordered callback
/// dispatch:
/// - **Timers**: fired in ascending `(deadline, registration)` order
/// - **Monitored descriptors**: poll-style readiness callbacks
/// - **Event queues**: cross-thread payloads drained in FIFO order
///
/// Each loop iteration blocks on the platform poll primitive (bounded by
/// the nearest timer deadline), then dispatches expired timers first and
/// ready descriptors second, in the order the platform reported them. A
/// panic inside any one callback is caught, logged, and never terminates
/// the loop; only a failure of the poll primitive itself is fatal.
pub struct Reactor {
    io: IoDriver,
    timers: TimerDriver,
    queues: QueueDriver,
    stop: Arc<AtomicBool>,
    stop_waker: Arc<mio::Waker>,
    state: ReactorState,
    mode: ExecutionMode,

    /// Time snapshot of the current cycle; timer deadlines are computed
    /// against this, never against a raw `Instant::now()`, so tests driven
    /// by a manual clock stay deterministic.
    current: Instant,

    event_buffer: Vec<(usize, Readiness)>,
    timer_buffer: Vec<TimerEntry>,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        Self::with_config(ReactorConfig::default())
    }

    pub fn with_config(cfg: ReactorConfig) -> io::Result<Self> {
        let mut io = IoDriver::with_capacity(cfg.io_capacity);
        let stop_waker = io.register_waker(Watch::Waker)?;
        Ok(Self {
            io,
            timers: TimerDriver::new(),
            queues: QueueDriver::new(),
            stop: Arc::new(AtomicBool::new(false)),
            stop_waker,
            state: ReactorState::Stopped,
            mode: cfg.mode,
            current: Instant::now(),
            event_buffer: Vec::with_capacity(EVENT_BUFFER_CAPACITY),
            timer_buffer: Vec::with_capacity(EVENT_BUFFER_CAPACITY),
        })
    }

    /// Schedules `callback` to fire once, `delay_ms` milliseconds from the
    /// current cycle time. Returns the timer's id immediately; the callback
    /// is never invoked synchronously. Negative delays are rejected.
    pub fn schedule(
        &mut self,
        delay_ms: i64,
        args: Vec<Value>,
        callback: impl FnOnce(&mut Reactor, Vec<Value>) + 'static,
    ) -> Result<TimerId, ScheduleError> {
        self.timers
            .register_timer(self.current, delay_ms, args, Box::new(callback))
    }

    /// Cancels a pending timer. Idempotent: unknown and already-fired ids
    /// are a no-op, never an error.
    pub fn cancel(&mut self, id: TimerId) {
        self.timers.deregister_timer(id);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Registers `callback` for readiness events on `fd`, replacing any
    /// existing callback for the same descriptor.
    pub fn monitor(
        &mut self,
        fd: RawFd,
        callback: impl FnMut(&mut Reactor, RawFd, Readiness) + 'static,
    ) -> Result<(), MonitorError> {
        self.io.monitor(fd, Box::new(callback))
    }

    /// Stops monitoring `fd`. Idempotent.
    pub fn unmonitor(&mut self, fd: RawFd) {
        self.io.unmonitor(fd);
    }

    pub fn is_monitored(&self, fd: RawFd) -> bool {
        self.io.is_monitored(fd)
    }

    /// Claims `queue` for this reactor and installs its dispatch callback.
    ///
    /// The queue stays associated with this reactor for its whole lifetime;
    /// binding it to a second reactor fails. Payloads pushed before the
    /// bind are drained on the next cycle.
    pub fn bind_queue<T: Send + 'static>(
        &mut self,
        queue: &EventQueue<T>,
        dispatch: impl FnMut(&mut Reactor, T) + 'static,
    ) -> Result<(), BindError> {
        self.queues
            .bind(&mut self.io, queue, Box::new(dispatch))
            .map(|_| ())
    }

    /// Requests a stop from within a callback. Takes effect at the top of
    /// the next loop iteration; the current iteration's callbacks run to
    /// completion.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }

    /// A cloneable cross-thread stop handle for this reactor.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            flag: self.stop.clone(),
            waker: self.stop_waker.clone(),
        }
    }

    pub fn state(&self) -> ReactorState {
        if self.state.is_running() && self.stop.load(Ordering::Acquire) {
            ReactorState::Stopping
        } else {
            self.state
        }
    }

    /// The monotonic time snapshot of the current cycle.
    pub const fn now(&self) -> Instant {
        self.current
    }

    pub const fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Wires SIGINT/SIGTERM to the stop flag so the loop winds down
    /// gracefully on process signals.
    #[cfg(feature = "signals")]
    pub fn enable_graceful_shutdown(&self) -> io::Result<()> {
        #[cfg(unix)]
        {
            use signal_hook::consts::{SIGINT, SIGTERM};
            use signal_hook::flag;
            flag::register(SIGINT, self.stop.clone())?;
            flag::register(SIGTERM, self.stop.clone())?;
            Ok(())
        }

        #[cfg(not(unix))]
        {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "signal handling is only supported on unix platforms",
            ))
        }
    }

    /// Runs the loop until a stop request is observed.
    ///
    /// Fails with `AlreadyRunning` when re-entered (e.g. from within a
    /// callback). A poll-primitive failure other than benign interruption
    /// aborts the loop and propagates out.
    pub fn run(&mut self, clock: &mut impl Clock) -> Result<(), ReactorError> {
        if !self.state.is_stopped() {
            return Err(ReactorError::AlreadyRunning);
        }
        self.state = ReactorState::Running;

        let result = loop {
            if self.stop.load(Ordering::Acquire) {
                break Ok(());
            }
            let timeout = match self.mode {
                ExecutionMode::Spin => Some(Duration::ZERO),
                ExecutionMode::Park => None,
            };
            if let Err(err) = self.cycle(clock, timeout) {
                break Err(ReactorError::Io(err));
            }
        };

        self.state = ReactorState::Stopped;
        self.stop.store(false, Ordering::Release);
        result
    }

    /// Executes one loop iteration: block on the poll primitive (bounded by
    /// `timeout` and the nearest timer deadline), then fire expired timers
    /// in deadline order, then dispatch ready descriptors and queues in the
    /// order the platform reported them.
    pub fn cycle(&mut self, clock: &mut impl Clock, timeout: Option<Duration>) -> io::Result<()> {
        let before = clock.cycle_time().now();
        self.current = before;

        let effective = self.effective_timeout(timeout, before);
        self.io.poll(effective)?;

        // Refresh the snapshot after the (possibly long) block so timers
        // that became due while parked are seen as expired.
        let now = clock.cycle_time().now();
        self.current = now;

        let mut timers = std::mem::take(&mut self.timer_buffer);
        timers.clear();
        self.timers.pop_expired_into(now, &mut timers);
        for entry in timers.drain(..) {
            let TimerEntry { id, callback, args } = entry;
            let result = catch_unwind(AssertUnwindSafe(|| callback(&mut *self, args)));
            if let Err(payload) = result {
                log::error!(
                    "timer {:?} callback panicked: {}",
                    id,
                    panic_message(payload.as_ref())
                );
            }
        }
        self.timer_buffer = timers;

        let mut events = std::mem::take(&mut self.event_buffer);
        events.clear();
        self.io.collect_events_into(&mut events);
        for (token, readiness) in events.drain(..) {
            match self.io.watch(token) {
                // Stop waker only exists to interrupt the poll; the stale
                // `None` arm covers tokens unmonitored earlier this cycle
                Some(Watch::Waker) | None => {}
                Some(Watch::Queue(qid)) => {
                    if let Some(mut slot) = self.queues.take_slot(qid) {
                        slot.drain(self);
                        self.queues.restore_slot(qid, slot);
                    }
                }
                Some(Watch::Fd(fd)) => {
                    if let Some(mut callback) = self.io.take_fd_callback(fd) {
                        let result =
                            catch_unwind(AssertUnwindSafe(|| callback(&mut *self, fd, readiness)));
                        if let Err(payload) = result {
                            log::error!(
                                "descriptor {} callback panicked: {}",
                                fd,
                                panic_message(payload.as_ref())
                            );
                        }
                        self.io.restore_fd_callback(fd, callback);
                    }
                }
            }
        }
        self.event_buffer = events;
        Ok(())
    }

    fn effective_timeout(&self, timeout: Option<Duration>, now: Instant) -> Option<Duration> {
        match (self.timers.next_deadline(), timeout) {
            (None, timeout) => timeout,
            (Some(deadline), None) => Some(deadline.saturating_duration_since(now)),
            (Some(deadline), Some(timeout)) => {
                Some(timeout.min(deadline.saturating_duration_since(now)))
            }
        }
    }
}


#[cfg(test)]
mod integration_tests {
    use super::*;
    use crate::runtime::clock::PrecisionClock;
    use std::thread;

    #[test]
    fn test_stop_handle_wakes_parked_reactor() {
        let mut reactor = Reactor::new().unwrap();
        let mut clock = PrecisionClock::new();
        let handle = reactor.stop_handle();

        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            handle.stop();
        });

        // Park mode with no timers: blocks until the stop handle wakes it
        let started = Instant::now();
        reactor.run(&mut clock).unwrap();
        stopper.join().unwrap();

        assert!(started.elapsed() >= Duration::from_millis(40));
        assert!(reactor.state().is_stopped());
    }

    #[test]
    fn test_parked_reactor_wakes_for_timer_deadline() {
        let mut reactor = Reactor::new().unwrap();
        let mut clock = PrecisionClock::new();

        reactor
            .schedule(30, vec![], |reactor, _| reactor.stop())
            .unwrap();

        let started = Instant::now();
        reactor.run(&mut clock).unwrap();
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_millis(25), "{:?}", elapsed);
        assert!(elapsed < Duration::from_secs(2), "{:?}", elapsed);
    }

    #[test]
    fn test_cross_thread_queue_wakes_parked_reactor() {
        let mut reactor = Reactor::new().unwrap();
        let mut clock = PrecisionClock::new();

        let queue = EventQueue::new();
        reactor
            .bind_queue(&queue, |reactor, item: u32| {
                assert_eq!(item, 99);
                reactor.stop();
            })
            .unwrap();

        let producer = queue.clone();
        let pusher = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.push(99).unwrap();
        });

        reactor.run(&mut clock).unwrap();
        pusher.join().unwrap();
    }
}
