//! Worker-thread isolates.
//!
//! An isolate is an independently scheduled worker thread hosting its own
//! reactor, inbound event queue, and method table. Isolates exchange
//! requests and notifications through the RPC envelope: `execute` is a
//! synchronous cross-isolate call with a timeout, `notify` is
//! fire-and-forget. Parent and child isolates hold only non-owning links to
//! each other, so tearing one down never leaves an ownership cycle behind.
//!
//! The code an isolate runs is a [`Program`]: a host closure handed an
//! [`IsolateScope`] for registering handlers, scheduling reactor work, and
//! spawning children. Loading programs from a path is delegated to the
//! [`ProgramLoader`] boundary; this crate never interprets source text
//! itself.

mod manager;

use crate::rpc::{HandlerError, Request, Response, Value};
use crate::runtime::event_driver::WeakQueue;
use crate::runtime::reactor::Reactor;
use enum_as_inner::EnumAsInner;
use std::cell::RefCell;
use std::io;
use std::path::Path;
use std::rc::Rc;
use std::sync::mpsc::SyncSender;

pub use manager::{IsolateHandle, IsolateManager};

/// Code executed on an isolate's own thread, given scoped access to the
/// isolate's reactor and method table.
pub type Program = Box<dyn FnOnce(&mut IsolateScope<'_>) + Send + 'static>;

/// Boundary to the module loader: resolves a path to a runnable program.
pub trait ProgramLoader: Send + Sync {
    fn load(&self, path: &Path) -> io::Result<Program>;
}

/// Lifecycle of an isolate's worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumAsInner)]
pub enum IsolateState {
    Created,
    Running,
    Joined,
}

/// Failure modes of a cross-isolate `execute` call.
///
/// `TimedOut` is a caller-side condition: the target may still complete the
/// call later, and its late reply is discarded. The other variants are
/// responses from (or about) the target.
#[derive(Debug, thiserror::Error, EnumAsInner)]
pub enum CallError {
    #[error("call timed out")]
    TimedOut,
    #[error("{0}")]
    MethodNotFound(String),
    #[error("{0}")]
    Internal(String),
    #[error("isolate is no longer accepting events")]
    Disconnected,
    #[error("cannot execute against the calling isolate's own thread")]
    SelfCall,
}

/// Payloads carried by an isolate's inbound event queue.
pub(crate) enum IsolateEvent {
    /// Correlated call: the reply lands on a per-call channel. If the
    /// caller timed out and went away, the send fails and the reply is
    /// discarded.
    Call {
        request: Request,
        reply: SyncSender<Response>,
    },
    Notify {
        request: Request,
    },
    Run {
        program: Program,
    },
}

/// Non-owning link for pushing notifications into another isolate's queue.
///
/// Holds only a weak reference: if the target isolate is gone, the
/// notification is dropped silently.
pub struct IsolateNotifier {
    queue: WeakQueue<IsolateEvent>,
}

impl Clone for IsolateNotifier {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
        }
    }
}

impl IsolateNotifier {
    pub(crate) fn new(queue: WeakQueue<IsolateEvent>) -> Self {
        Self { queue }
    }

    /// Fire-and-forget notification; no acknowledgement, no error surfaced.
    pub fn notify(&self, method: impl Into<String>, params: Value) {
        if let Some(queue) = self.queue.upgrade() {
            queue
                .push(IsolateEvent::Notify {
                    request: Request::notification(method, params),
                })
                .ok();
        }
    }
}

/// In-isolate view handed to a running [`Program`].
///
/// The scope is how a program wires itself up: named handlers and the
/// wildcard go into the isolate's method table, reactor access covers
/// timers, descriptor monitoring, and queues, and `spawn` creates child
/// isolates that hold a back-link to this one.
pub struct IsolateScope<'a> {
    reactor: &'a mut Reactor,
    table: &'a Rc<RefCell<crate::rpc::DispatchTable>>,
    manager: &'a IsolateManager,
    parent: Option<&'a IsolateNotifier>,
    self_link: &'a IsolateNotifier,
}

impl<'a> IsolateScope<'a> {
    pub(crate) fn new(
        reactor: &'a mut Reactor,
        table: &'a Rc<RefCell<crate::rpc::DispatchTable>>,
        manager: &'a IsolateManager,
        parent: Option<&'a IsolateNotifier>,
        self_link: &'a IsolateNotifier,
    ) -> Self {
        Self {
            reactor,
            table,
            manager,
            parent,
            self_link,
        }
    }

    /// The isolate's own reactor, for timers, descriptor monitoring, and
    /// queue binding.
    pub fn reactor(&mut self) -> &mut Reactor {
        self.reactor
    }

    /// Registers a named handler in the isolate's method table.
    pub fn on(
        &self,
        method: impl Into<String>,
        handler: impl FnMut(&str, &Value) -> Result<Value, HandlerError> + 'static,
    ) {
        self.table.borrow_mut().register(method, handler);
    }

    /// Registers the wildcard handler invoked when no named handler
    /// matches an incoming method.
    pub fn on_any(
        &self,
        handler: impl FnMut(&str, &Value) -> Result<Value, HandlerError> + 'static,
    ) {
        self.table.borrow_mut().register_wildcard(handler);
    }

    /// Link to the parent isolate, if this isolate was spawned by one.
    pub fn parent(&self) -> Option<&IsolateNotifier> {
        self.parent
    }

    /// Notifies the parent isolate; dropped silently when there is none.
    pub fn notify_parent(&self, method: impl Into<String>, params: Value) {
        if let Some(parent) = self.parent {
            parent.notify(method, params);
        }
    }

    pub fn manager(&self) -> &IsolateManager {
        self.manager
    }

    /// Spawns a child isolate whose parent link points back to this one.
    pub fn spawn(&self, program: Program) -> io::Result<IsolateHandle> {
        self.manager
            .spawn_with_parent(program, Some(self.self_link.clone()))
    }

    /// Requests this isolate's loop to stop after the current iteration.
    pub fn stop(&mut self) {
        self.reactor.stop();
    }
}
