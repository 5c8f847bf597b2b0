//! eddy — a single-threaded cooperative event loop runtime with
//! worker-thread isolates and a shared RPC dispatch core.
//!
//! The crate is organized around three layers:
//!
//! - [`runtime`]: the reactor — descriptor monitoring, a timer registry,
//!   and thread-safe event queues multiplexed into ordered callback
//!   dispatch on one thread.
//! - [`isolate`]: worker threads each hosting an independent reactor and
//!   method table, exchanging synchronous calls and fire-and-forget
//!   notifications through their inbound queues, with a coordinated
//!   process shutdown path.
//! - [`rpc`]: the request/response envelope and lookup-and-invoke dispatch
//!   logic shared by isolate calls, native bridges, and any wire
//!   transport.
//!
//! Parallelism exists only *across* isolates. Within one, a running
//! callback always completes before the next is dispatched, and faults are
//! contained at the dispatch boundary: one failing callback costs a log
//! line, never the loop.

pub mod fifo;
pub mod isolate;
pub mod rpc;
pub mod runtime;

use std::any::Any;

/// Best-effort extraction of a panic payload's message for logging and
/// error responses.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

pub mod prelude {
    pub use crate::fifo::Fifo;
    pub use crate::isolate::{
        CallError, IsolateHandle, IsolateManager, IsolateNotifier, IsolateScope, IsolateState,
        Program, ProgramLoader,
    };
    pub use crate::rpc::{
        DispatchTable, ErrorObject, Handler, HandlerError, Request, Response, Value,
    };
    pub use crate::runtime::*;
}
