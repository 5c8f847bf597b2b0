use crate::fifo::Fifo;
use crate::panic_message;
use crate::runtime::event_driver::io_driver::{IoDriver, Watch};
use crate::runtime::reactor::Reactor;
use crossbeam_utils::Backoff;
use parking_lot::Mutex;
use slab::Slab;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Callback invoked by the owning reactor for each drained payload.
pub type QueueDispatch<T> = Box<dyn FnMut(&mut Reactor, T)>;

/// The queue's consumer is gone; the payload is handed back to the caller.
#[derive(Debug, thiserror::Error)]
#[error("event queue detached")]
pub struct QueueDetached<T>(pub T);

#[derive(Debug, thiserror::Error)]
pub enum BindError {
    #[error("event queue is already bound to a reactor")]
    AlreadyBound,
    #[error(transparent)]
    Io(#[from] io::Error),
}

struct Shared<T> {
    items: Mutex<Fifo<T>>,
    /// Set exactly once, when the consuming reactor binds the queue. The
    /// queue stays associated with that reactor's waker for its lifetime.
    waker: Mutex<Option<Arc<mio::Waker>>>,
    detached: AtomicBool,
}

/// Thread-safe FIFO handing payloads from any number of producer threads to
/// exactly one consuming reactor.
///
/// `push` signals the consumer's readiness waker once per
/// empty-to-nonempty transition; the reactor fully empties the queue on
/// every wake, so the edge signal is sufficient to never lose a payload.
pub struct EventQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for EventQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Default for EventQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventQueue<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                items: Mutex::new(Fifo::new()),
                waker: Mutex::new(None),
                detached: AtomicBool::new(false),
            }),
        }
    }

    /// Appends a payload and wakes the consuming reactor if the queue was
    /// empty. Safe to call from any thread, including the consumer's own.
    #[inline(always)]
    pub fn push(&self, item: T) -> Result<(), QueueDetached<T>> {
        if self.shared.detached.load(Ordering::Acquire) {
            return Err(QueueDetached(item));
        }

        let was_empty = {
            let mut items = self.shared.items.lock();
            let was_empty = items.is_empty();
            items.push(item);
            was_empty
        };

        if was_empty {
            if let Some(waker) = self.shared.waker.lock().clone() {
                let backoff = Backoff::new();
                while waker.wake().is_err() {
                    backoff.snooze(); // transient error, retry
                }
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.shared.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.items.lock().is_empty()
    }

    /// Whether a reactor has claimed this queue as its consumer.
    pub fn is_bound(&self) -> bool {
        self.shared.waker.lock().is_some()
    }

    pub fn is_detached(&self) -> bool {
        self.shared.detached.load(Ordering::Acquire)
    }

    pub fn downgrade(&self) -> WeakQueue<T> {
        WeakQueue(Arc::downgrade(&self.shared))
    }
}

/// Non-owning handle to an event queue; used for back-references (a child
/// isolate's link to its parent) so queues never form ownership cycles.
pub struct WeakQueue<T>(Weak<Shared<T>>);

impl<T> Clone for WeakQueue<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> WeakQueue<T> {
    pub fn upgrade(&self) -> Option<EventQueue<T>> {
        self.0.upgrade().map(|shared| EventQueue { shared })
    }
}

/// Consumer half of a bound queue, type-erased so the reactor can hold
/// queues of different payload types in one table.
pub(crate) trait QueueSlot {
    fn drain(&mut self, reactor: &mut Reactor);
}

struct BoundQueue<T> {
    shared: Arc<Shared<T>>,
    dispatch: QueueDispatch<T>,
}

impl<T> QueueSlot for BoundQueue<T> {
    fn drain(&mut self, reactor: &mut Reactor) {
        // Swap the fifo out under the lock and dispatch outside it, so
        // producers are never blocked on a running callback and a dispatch
        // that pushes back into this queue cannot deadlock.
        let mut batch = std::mem::take(&mut *self.shared.items.lock());
        while let Some(item) = batch.pop() {
            let result = catch_unwind(AssertUnwindSafe(|| (self.dispatch)(&mut *reactor, item)));
            if let Err(payload) = result {
                // One bad event must not starve the rest of the queue
                log::error!(
                    "event queue dispatch panicked: {}",
                    panic_message(payload.as_ref())
                );
            }
        }
    }
}

impl<T> Drop for BoundQueue<T> {
    fn drop(&mut self) {
        self.shared.detached.store(true, Ordering::Release);
    }
}

/// The reactor-side table of bound queues.
pub(crate) struct QueueDriver {
    slots: Slab<Option<Box<dyn QueueSlot>>>,
}

impl QueueDriver {
    pub(crate) fn new() -> Self {
        Self { slots: Slab::new() }
    }

    /// Claims `queue` for the reactor owning `io` and installs its dispatch
    /// callback. Fails if another reactor already bound the queue.
    pub(crate) fn bind<T: Send + 'static>(
        &mut self,
        io: &mut IoDriver,
        queue: &EventQueue<T>,
        dispatch: QueueDispatch<T>,
    ) -> Result<usize, BindError> {
        let mut waker_slot = queue.shared.waker.lock();
        if waker_slot.is_some() {
            return Err(BindError::AlreadyBound);
        }

        let entry = self.slots.vacant_entry();
        let qid = entry.key();
        let waker = io.register_waker(Watch::Queue(qid))?;
        *waker_slot = Some(waker.clone());
        drop(waker_slot);

        entry.insert(Some(Box::new(BoundQueue {
            shared: queue.shared.clone(),
            dispatch,
        })));

        // Payloads pushed before the bind have no waker signal behind them;
        // schedule an immediate drain for them.
        if !queue.shared.items.lock().is_empty() {
            waker.wake().ok();
        }
        Ok(qid)
    }

    pub(crate) fn take_slot(&mut self, qid: usize) -> Option<Box<dyn QueueSlot>> {
        self.slots.get_mut(qid).and_then(|slot| slot.take())
    }

    pub(crate) fn restore_slot(&mut self, qid: usize, consumer: Box<dyn QueueSlot>) {
        if let Some(slot) = self.slots.get_mut(qid) {
            if slot.is_none() {
                *slot = Some(consumer);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_len() {
        let queue = EventQueue::new();
        assert!(queue.is_empty());

        queue.push(1).unwrap();
        queue.push(2).unwrap();
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_unbound_queue_accepts_pushes() {
        // Producers may race ahead of the consumer's bind; payloads are
        // retained and drained on the first cycle after binding.
        let queue = EventQueue::new();
        queue.push("early").unwrap();
        assert!(!queue.is_bound());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_double_bind_rejected() {
        let mut io = IoDriver::with_capacity(8);
        let mut driver = QueueDriver::new();
        let queue: EventQueue<u32> = EventQueue::new();

        driver
            .bind(&mut io, &queue, Box::new(|_, _| {}))
            .unwrap();
        assert!(queue.is_bound());

        match driver.bind(&mut io, &queue, Box::new(|_, _| {})) {
            Err(BindError::AlreadyBound) => {}
            other => panic!("expected AlreadyBound, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_detached_push_returns_payload() {
        let mut io = IoDriver::with_capacity(8);
        let mut driver = QueueDriver::new();
        let queue: EventQueue<u32> = EventQueue::new();

        let qid = driver
            .bind(&mut io, &queue, Box::new(|_, _| {}))
            .unwrap();

        // Dropping the consumer detaches the queue
        let slot = driver.take_slot(qid).unwrap();
        drop(slot);

        let err = queue.push(7).unwrap_err();
        assert_eq!(err.0, 7);
        assert!(queue.is_detached());
    }

    #[test]
    fn test_weak_queue_upgrade() {
        let queue: EventQueue<u32> = EventQueue::new();
        let weak = queue.downgrade();
        assert!(weak.upgrade().is_some());

        drop(queue);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_multi_producer_pushes_all_arrive() {
        let queue = EventQueue::new();
        let mut handles = Vec::new();
        for t in 0..4 {
            let producer = queue.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..100 {
                    producer.push((t, i)).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(queue.len(), 400);
    }
}
