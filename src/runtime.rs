//! Single-threaded cooperative event loop runtime.
//!
//! The `runtime` module provides the scheduling core every other part of
//! the crate builds on: a reactor that multiplexes descriptor readiness,
//! timer expiry, and cross-thread event queues into ordered callback
//! dispatch on one thread.
//!
//! # Architecture Overview
//!
//! ## Execution Model
//! - **Cooperative scheduling**: a running callback always runs to
//!   completion; there is no preemption and no intra-loop parallelism
//! - **Deterministic dispatch**: each iteration fires expired timers in
//!   `(deadline, registration)` order, then ready descriptors in the order
//!   the platform reported them
//! - **Fault isolation**: a panic in one callback is caught and logged at
//!   the loop boundary; it never terminates the loop or leaks across a
//!   thread boundary
//!
//! ## Core Components
//!
//! ### [`Reactor`]
//! The event loop itself: descriptor monitoring, timer registry, event
//! queue binding, and the `run`/`stop` lifecycle.
//!
//! ### [`EventQueue<T>`]
//! A lock-protected FIFO bridging any number of producer threads to the
//! one reactor that bound it, signalled through the reactor's waker.
//!
//! ### [`Runtime<C>`]
//! Reactor plus clock: the realtime flavor drives the loop off the wall
//! clock, the test flavor advances time manually for deterministic tests.
//!
//! # Usage
//! ```rust,ignore
//! let mut runtime = RealtimeRuntime::new(ExecutionMode::Park)?;
//! let reactor = runtime.reactor();
//!
//! reactor.schedule(250, vec![], |reactor, _| {
//!     println!("fired");
//!     reactor.stop();
//! })?;
//!
//! runtime.run()?;
//! ```

pub mod clock;
pub mod event_driver;
pub mod reactor;

use std::io;

pub use clock::*;
pub use event_driver::{
    BindError, EventQueue, FdCallback, MonitorError, QueueDetached, Readiness, ScheduleError,
    TimerCallback, TimerId, WeakQueue,
};
pub use reactor::*;

/// A complete runtime instance combining a reactor with its time source.
pub struct Runtime<C: Clock> {
    reactor: Reactor,
    clock: C,
}

pub type RealtimeRuntime = Runtime<PrecisionClock>;

#[cfg(any(test, feature = "testing"))]
pub type TestRuntime = Runtime<TestClock>;

impl<C: Clock> Runtime<C> {
    pub fn reactor(&mut self) -> &mut Reactor {
        &mut self.reactor
    }

    /// Runs the reactor loop until stopped.
    pub fn run(&mut self) -> Result<(), ReactorError> {
        self.reactor.run(&mut self.clock)
    }
}

impl RealtimeRuntime {
    pub fn new(mode: ExecutionMode) -> io::Result<Self> {
        let cfg = ReactorConfigBuilder::default()
            .mode(mode)
            .build()
            .expect("expected default builder");
        Self::with_config(cfg)
    }

    pub fn with_config(cfg: ReactorConfig) -> io::Result<Self> {
        Ok(Self {
            reactor: Reactor::with_config(cfg)?,
            clock: PrecisionClock::new(),
        })
    }
}

#[cfg(any(test, feature = "testing"))]
impl TestRuntime {
    pub fn new() -> Self {
        Self {
            reactor: Reactor::new().expect("failed to create reactor"),
            clock: TestClock::new(),
        }
    }

    /// Executes exactly one loop iteration with a zero poll timeout.
    pub fn run_one_cycle(&mut self) {
        self.reactor
            .cycle(&mut self.clock, Some(std::time::Duration::ZERO))
            .expect("cycle failed");
    }

    pub fn advance_clock(&mut self, duration: std::time::Duration) {
        self.clock.advance(duration);
    }
}

#[cfg(any(test, feature = "testing"))]
impl Default for TestRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    #[test]
    fn test_runtime_cycle_with_manual_clock() {
        let mut runtime = TestRuntime::new();
        let fired = Rc::new(RefCell::new(false));

        // Align the reactor's time snapshot with the test clock baseline
        runtime.run_one_cycle();

        let fired_inner = fired.clone();
        runtime
            .reactor()
            .schedule(100, Vec::<Value>::new(), move |_, _| {
                *fired_inner.borrow_mut() = true;
            })
            .unwrap();

        runtime.run_one_cycle();
        assert!(!*fired.borrow());

        runtime.advance_clock(Duration::from_millis(150));
        runtime.run_one_cycle();
        assert!(*fired.borrow());
    }

    #[test]
    fn test_realtime_runtime_runs_to_stop() {
        let mut runtime = RealtimeRuntime::new(ExecutionMode::Park).unwrap();
        runtime
            .reactor()
            .schedule(5, vec![], |reactor, _| reactor.stop())
            .unwrap();
        runtime.run().unwrap();
    }
}
