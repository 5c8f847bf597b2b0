use crate::runtime::reactor::Reactor;
use ahash::AHashMap;
use mio::unix::SourceFd;
use mio::{Interest, Token};
use slab::Slab;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

/// Callback invoked when a monitored descriptor reports readiness.
pub type FdCallback = Box<dyn FnMut(&mut Reactor, RawFd, Readiness)>;

/// Poll-style readiness bitmask delivered to descriptor callbacks.
///
/// The mapping from the platform's native event flags to these bits is an
/// internal detail of the driver; callers only ever see this mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness(u8);

impl Readiness {
    pub const READABLE: Readiness = Readiness(0b0001);
    pub const WRITABLE: Readiness = Readiness(0b0010);
    pub const ERROR: Readiness = Readiness(0b0100);
    pub const HANGUP: Readiness = Readiness(0b1000);

    pub(crate) fn from_event(event: &mio::event::Event) -> Self {
        let mut bits = 0;
        if event.is_readable() {
            bits |= Self::READABLE.0;
        }
        if event.is_writable() {
            bits |= Self::WRITABLE.0;
        }
        if event.is_error() {
            bits |= Self::ERROR.0;
        }
        if event.is_read_closed() || event.is_write_closed() {
            bits |= Self::HANGUP.0;
        }
        Readiness(bits)
    }

    pub const fn contains(&self, other: Readiness) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_readable(&self) -> bool {
        self.contains(Self::READABLE)
    }

    pub const fn is_writable(&self) -> bool {
        self.contains(Self::WRITABLE)
    }

    pub const fn is_error(&self) -> bool {
        self.contains(Self::ERROR)
    }

    pub const fn is_hangup(&self) -> bool {
        self.contains(Self::HANGUP)
    }
}

impl std::ops::BitOr for Readiness {
    type Output = Readiness;

    fn bitor(self, rhs: Readiness) -> Readiness {
        Readiness(self.0 | rhs.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(RawFd),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// What a poll token resolves to during dispatch.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Watch {
    /// A monitored raw descriptor
    Fd(RawFd),
    /// A bound event queue's readiness waker
    Queue(usize),
    /// The reactor's own stop/wake waker
    Waker,
}

struct FdWatch {
    token: usize,
    /// Taken out while the callback is being invoked so the callback can
    /// re-register or unmonitor its own descriptor.
    callback: Option<FdCallback>,
}

/// Owns the platform poll primitive and the descriptor watch table.
///
/// One entry per descriptor; re-registering the same descriptor replaces
/// its callback but keeps the existing poll registration. Wakers for event
/// queues and the stop handle share the same token space.
pub struct IoDriver {
    poller: mio::Poll,
    events: mio::Events,
    slots: Slab<Watch>,
    fds: AHashMap<RawFd, FdWatch>,
}

impl IoDriver {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            poller: mio::Poll::new().expect("failed to create mio poll"),
            events: mio::Events::with_capacity(capacity),
            slots: Slab::with_capacity(capacity),
            fds: AHashMap::new(),
        }
    }

    /// Registers `callback` for readiness on `fd`, replacing any callback
    /// already registered for the same descriptor.
    pub(crate) fn monitor(&mut self, fd: RawFd, callback: FdCallback) -> Result<(), MonitorError> {
        if fd < 0 {
            return Err(MonitorError::InvalidDescriptor(fd));
        }

        if let Some(watch) = self.fds.get_mut(&fd) {
            watch.callback = Some(callback);
            return Ok(());
        }

        let entry = self.slots.vacant_entry();
        let token = Token(entry.key());
        self.poller
            .registry()
            .register(&mut SourceFd(&fd), token, Interest::READABLE)?;
        entry.insert(Watch::Fd(fd));
        self.fds.insert(
            fd,
            FdWatch {
                token: token.0,
                callback: Some(callback),
            },
        );
        Ok(())
    }

    /// Removes the watch for `fd`. Idempotent: unknown descriptors are a
    /// no-op, and a descriptor already closed by the caller is tolerated.
    pub(crate) fn unmonitor(&mut self, fd: RawFd) {
        if let Some(watch) = self.fds.remove(&fd) {
            // Deregistration fails if the fd was closed first; the kernel
            // has already dropped it from the interest set in that case.
            self.poller
                .registry()
                .deregister(&mut SourceFd(&fd))
                .ok();
            self.slots.remove(watch.token);
        }
    }

    pub(crate) fn is_monitored(&self, fd: RawFd) -> bool {
        self.fds.contains_key(&fd)
    }

    /// Allocates a token for a wake-only source and creates its waker.
    pub(crate) fn register_waker(&mut self, watch: Watch) -> io::Result<Arc<mio::Waker>> {
        let entry = self.slots.vacant_entry();
        let waker = Arc::new(mio::Waker::new(self.poller.registry(), Token(entry.key()))?);
        entry.insert(watch);
        Ok(waker)
    }

    pub(crate) fn watch(&self, token: usize) -> Option<Watch> {
        self.slots.get(token).copied()
    }

    pub(crate) fn take_fd_callback(&mut self, fd: RawFd) -> Option<FdCallback> {
        self.fds.get_mut(&fd).and_then(|watch| watch.callback.take())
    }

    /// Puts a callback taken with `take_fd_callback` back, unless the
    /// callback replaced itself or unmonitored its descriptor while running.
    pub(crate) fn restore_fd_callback(&mut self, fd: RawFd, callback: FdCallback) {
        if let Some(watch) = self.fds.get_mut(&fd) {
            if watch.callback.is_none() {
                watch.callback = Some(callback);
            }
        }
    }

    /// Blocks on the poll primitive for up to `timeout`.
    ///
    /// Benign interruptions are retried transparently; any other error is
    /// fatal and propagates to the caller.
    pub(crate) fn poll(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.events.clear();
        loop {
            match self.poller.poll(&mut self.events, timeout) {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                    log::trace!("poll interrupted, retrying");
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Copies the tokens and readiness of the last poll into `out`, in the
    /// order the platform reported them.
    pub(crate) fn collect_events_into(&self, out: &mut Vec<(usize, Readiness)>) {
        for event in self.events.iter() {
            out.push((event.token().0, Readiness::from_event(event)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;

    fn noop() -> FdCallback {
        Box::new(|_, _, _| {})
    }

    #[test]
    fn test_negative_descriptor_rejected() {
        let mut driver = IoDriver::with_capacity(64);
        match driver.monitor(-1, noop()) {
            Err(MonitorError::InvalidDescriptor(fd)) => assert_eq!(fd, -1),
            other => panic!("expected InvalidDescriptor, got {:?}", other),
        }
    }

    #[test]
    fn test_monitor_and_unmonitor() -> io::Result<()> {
        let mut driver = IoDriver::with_capacity(64);
        let (_tx, rx) = mio::unix::pipe::new()?;
        let fd = rx.as_raw_fd();

        driver.monitor(fd, noop()).unwrap();
        assert!(driver.is_monitored(fd));

        driver.unmonitor(fd);
        assert!(!driver.is_monitored(fd));

        // Idempotent
        driver.unmonitor(fd);
        driver.unmonitor(12345);
        Ok(())
    }

    #[test]
    fn test_reregister_replaces_callback_keeps_token() -> io::Result<()> {
        let mut driver = IoDriver::with_capacity(64);
        let (_tx, rx) = mio::unix::pipe::new()?;
        let fd = rx.as_raw_fd();

        driver.monitor(fd, noop()).unwrap();
        let token_before = driver.fds[&fd].token;

        driver.monitor(fd, noop()).unwrap();
        let token_after = driver.fds[&fd].token;

        assert_eq!(token_before, token_after);
        assert_eq!(driver.slots.len(), 1);
        Ok(())
    }

    #[test]
    fn test_take_and_restore_callback() -> io::Result<()> {
        let mut driver = IoDriver::with_capacity(64);
        let (_tx, rx) = mio::unix::pipe::new()?;
        let fd = rx.as_raw_fd();

        driver.monitor(fd, noop()).unwrap();

        let taken = driver.take_fd_callback(fd);
        assert!(taken.is_some());
        assert!(driver.take_fd_callback(fd).is_none());

        driver.restore_fd_callback(fd, taken.unwrap());
        assert!(driver.take_fd_callback(fd).is_some());
        Ok(())
    }

    #[test]
    fn test_restore_does_not_clobber_replacement() -> io::Result<()> {
        let mut driver = IoDriver::with_capacity(64);
        let (_tx, rx) = mio::unix::pipe::new()?;
        let fd = rx.as_raw_fd();

        driver.monitor(fd, noop()).unwrap();
        let old = driver.take_fd_callback(fd).unwrap();

        // A callback re-registering its own descriptor mid-dispatch
        driver.monitor(fd, noop()).unwrap();
        driver.restore_fd_callback(fd, old);

        // The replacement must survive; the old callback is dropped
        assert!(driver.fds[&fd].callback.is_some());
        Ok(())
    }

    #[test]
    fn test_readiness_bits() {
        let mask = Readiness::READABLE | Readiness::HANGUP;
        assert!(mask.is_readable());
        assert!(mask.is_hangup());
        assert!(!mask.is_writable());
        assert!(!mask.is_error());
        assert!(mask.contains(Readiness::READABLE));
        assert!(!mask.contains(Readiness::WRITABLE));
    }

    #[test]
    fn test_pipe_readability_reported() -> io::Result<()> {
        let mut driver = IoDriver::with_capacity(64);
        let (mut tx, rx) = mio::unix::pipe::new()?;
        let fd = rx.as_raw_fd();

        driver.monitor(fd, noop()).unwrap();

        // Nothing written yet: a zero-timeout poll reports no events
        driver.poll(Some(Duration::ZERO))?;
        let mut events = Vec::new();
        driver.collect_events_into(&mut events);
        assert!(events.is_empty());

        tx.write_all(b"x")?;
        driver.poll(Some(Duration::from_millis(100)))?;
        driver.collect_events_into(&mut events);

        assert_eq!(events.len(), 1);
        let (token, readiness) = events[0];
        assert!(matches!(driver.watch(token), Some(Watch::Fd(f)) if f == fd));
        assert!(readiness.is_readable());
        Ok(())
    }

    #[test]
    fn test_waker_wakes_poll() -> io::Result<()> {
        let mut driver = IoDriver::with_capacity(64);
        let waker = driver.register_waker(Watch::Waker)?;

        waker.wake()?;
        driver.poll(Some(Duration::from_millis(100)))?;

        let mut events = Vec::new();
        driver.collect_events_into(&mut events);
        assert_eq!(events.len(), 1);
        assert!(matches!(driver.watch(events[0].0), Some(Watch::Waker)));
        Ok(())
    }
}
