use crate::isolate::{
    CallError, IsolateEvent, IsolateNotifier, IsolateScope, IsolateState, Program, ProgramLoader,
};
use crate::rpc::{DispatchTable, Request, Value, METHOD_NOT_FOUND};
use crate::runtime::clock::PrecisionClock;
use crate::runtime::event_driver::EventQueue;
use crate::runtime::reactor::{Reactor, StopHandle};
use parking_lot::Mutex;
use std::cell::RefCell;
use std::io;
use std::path::Path;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{mpsc, Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

const STATE_CREATED: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_JOINED: u8 = 2;

struct IsolateShared {
    name: String,
    queue: EventQueue<IsolateEvent>,
    state: AtomicU8,
    stop: OnceLock<StopHandle>,
    /// Bridges a stop request arriving before the worker has published its
    /// stop handle.
    stop_requested: AtomicBool,
    thread_id: OnceLock<ThreadId>,
    thread: Mutex<Option<JoinHandle<()>>>,
    call_sequence: AtomicU64,
}

/// Cloneable handle to a spawned isolate.
///
/// All operations are safe from any thread. The handle never owns the
/// isolate's reactor or method table — those live on the worker thread and
/// die with it.
#[derive(Clone)]
pub struct IsolateHandle {
    shared: Arc<IsolateShared>,
}

impl IsolateHandle {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> IsolateState {
        match self.shared.state.load(Ordering::Acquire) {
            STATE_RUNNING => IsolateState::Running,
            STATE_JOINED => IsolateState::Joined,
            _ => IsolateState::Created,
        }
    }

    /// Synchronous cross-isolate call.
    ///
    /// Serializes `{method, params}` into the target's inbound queue and
    /// blocks the calling thread until the reply arrives or `timeout_ms`
    /// elapses. On timeout the in-flight call is *not* cancelled: the
    /// target may still run it, and its late reply is discarded without
    /// affecting later calls.
    ///
    /// A `timeout_ms` of 0 disables the timeout entirely and blocks until
    /// the isolate replies or terminates — against an unresponsive handler
    /// this blocks the calling thread indefinitely, so prefer a bounded
    /// timeout.
    pub fn execute(
        &self,
        method: impl Into<String>,
        params: Value,
        timeout_ms: u64,
    ) -> Result<Value, CallError> {
        if self.shared.thread_id.get() == Some(&thread::current().id()) {
            return Err(CallError::SelfCall);
        }

        let id = self.shared.call_sequence.fetch_add(1, Ordering::Relaxed);
        let (reply, response) = mpsc::sync_channel(1);
        self.shared
            .queue
            .push(IsolateEvent::Call {
                request: Request::call(id, method, params),
                reply,
            })
            .map_err(|_| CallError::Disconnected)?;

        let response = if timeout_ms == 0 {
            response.recv().map_err(|_| CallError::Disconnected)?
        } else {
            match response.recv_timeout(Duration::from_millis(timeout_ms)) {
                Ok(response) => response,
                Err(mpsc::RecvTimeoutError::Timeout) => return Err(CallError::TimedOut),
                Err(mpsc::RecvTimeoutError::Disconnected) => return Err(CallError::Disconnected),
            }
        };

        match response.into_result() {
            Ok(value) => Ok(value),
            Err(err) if err.code == METHOD_NOT_FOUND => Err(CallError::MethodNotFound(err.message)),
            Err(err) => Err(CallError::Internal(err.message)),
        }
    }

    /// Fire-and-forget notification. Returns immediately; no
    /// acknowledgement, and no error surfaced even if the method is
    /// unknown to the target.
    pub fn notify(&self, method: impl Into<String>, params: Value) {
        let pushed = self.shared.queue.push(IsolateEvent::Notify {
            request: Request::notification(method, params),
        });
        if pushed.is_err() {
            log::trace!("notification to terminated isolate '{}' dropped", self.shared.name);
        }
    }

    /// Queues `program` for execution on the isolate's thread.
    /// Asynchronous: the calling thread does not wait for it to run.
    pub fn run_program(&self, program: Program) -> Result<(), CallError> {
        self.shared
            .queue
            .push(IsolateEvent::Run { program })
            .map_err(|_| CallError::Disconnected)
    }

    /// Loads a program from `path` through the module-loader boundary and
    /// queues it for execution.
    pub fn run_path(&self, loader: &dyn ProgramLoader, path: &Path) -> io::Result<()> {
        let program = loader.load(path)?;
        self.run_program(program)
            .map_err(|err| io::Error::new(io::ErrorKind::BrokenPipe, err))
    }

    /// A non-owning notifier for this isolate.
    pub fn notifier(&self) -> IsolateNotifier {
        IsolateNotifier::new(self.shared.queue.downgrade())
    }

    /// Requests the isolate's event loop to stop. The worker thread then
    /// winds down; pair with `join` to reclaim it.
    pub fn stop(&self) {
        self.shared.stop_requested.store(true, Ordering::SeqCst);
        if let Some(stop) = self.shared.stop.get() {
            stop.stop();
        }
    }

    /// Blocks until the isolate's worker thread terminates. Idempotent
    /// after the first successful join.
    pub fn join(&self) {
        let handle = self.shared.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("isolate '{}' worker thread panicked", self.shared.name);
            }
            self.shared.state.store(STATE_JOINED, Ordering::Release);
        }
    }
}

struct ManagerInner {
    isolates: Vec<IsolateHandle>,
    hooks: Vec<Box<dyn FnOnce() + Send>>,
    spawn_sequence: u64,
}

/// Creates, tracks, and joins worker-thread isolates.
///
/// The manager is the process-wide context object for the isolate
/// subsystem: construct one explicitly and clone it wherever isolates are
/// spawned. Cleanup hooks registered here run during the coordinated
/// shutdown sequence, between stopping the loops and joining the threads.
#[derive(Clone)]
pub struct IsolateManager {
    inner: Arc<Mutex<ManagerInner>>,
}

impl Default for IsolateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl IsolateManager {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ManagerInner {
                isolates: Vec::new(),
                hooks: Vec::new(),
                spawn_sequence: 0,
            })),
        }
    }

    /// Spawns a new isolate running `program`.
    ///
    /// Returns as soon as the worker thread exists; it does not wait for
    /// the isolate to reach `Running`. Thread-spawn failure propagates.
    pub fn spawn(&self, program: Program) -> io::Result<IsolateHandle> {
        self.spawn_with_parent(program, None)
    }

    /// Spawns an empty isolate: it serves its event loop immediately and
    /// receives its program later via `run_program`/`run_path`.
    pub fn create(&self) -> io::Result<IsolateHandle> {
        self.spawn(Box::new(|_| {}))
    }

    pub(crate) fn spawn_with_parent(
        &self,
        program: Program,
        parent: Option<IsolateNotifier>,
    ) -> io::Result<IsolateHandle> {
        let name = {
            let mut inner = self.inner.lock();
            inner.spawn_sequence += 1;
            format!("isolate-{}", inner.spawn_sequence)
        };

        let shared = Arc::new(IsolateShared {
            name: name.clone(),
            queue: EventQueue::new(),
            state: AtomicU8::new(STATE_CREATED),
            stop: OnceLock::new(),
            stop_requested: AtomicBool::new(false),
            thread_id: OnceLock::new(),
            thread: Mutex::new(None),
            call_sequence: AtomicU64::new(0),
        });
        let handle = IsolateHandle {
            shared: shared.clone(),
        };

        let manager = self.clone();
        let thread = thread::Builder::new()
            .name(name)
            .spawn(move || isolate_main(shared, manager, parent, program))?;

        *handle.shared.thread.lock() = Some(thread);
        self.inner.lock().isolates.push(handle.clone());
        Ok(handle)
    }

    /// Registers a hook to run during `shutdown`, after every isolate has
    /// been told to stop and before the threads are joined.
    pub fn register_cleanup(&self, hook: impl FnOnce() + Send + 'static) {
        self.inner.lock().hooks.push(Box::new(hook));
    }

    /// Number of isolates whose worker threads have not been joined yet.
    pub fn live_isolates(&self) -> usize {
        self.inner
            .lock()
            .isolates
            .iter()
            .filter(|handle| !handle.state().is_joined())
            .count()
    }

    /// Coordinated shutdown: signal every isolate's loop to stop, run the
    /// registered cleanup hooks, then join every worker thread. When this
    /// returns, no isolate thread is left alive.
    ///
    /// Must be called from outside the isolates being shut down — an
    /// isolate cannot join itself.
    pub fn shutdown(&self) {
        let (handles, hooks) = {
            let mut inner = self.inner.lock();
            let hooks: Vec<_> = inner.hooks.drain(..).collect();
            (inner.isolates.clone(), hooks)
        };

        for handle in &handles {
            handle.stop();
        }
        for hook in hooks {
            hook();
        }
        for handle in &handles {
            handle.join();
        }
    }

    /// Shuts down every isolate, then terminates the process with `code`.
    ///
    /// The exit path never leaves threads unjoined: `shutdown` completes
    /// before the process terminates.
    pub fn exit(&self, code: i32) -> ! {
        self.shutdown();
        std::process::exit(code);
    }
}

/// Worker-thread entry point: builds the isolate's reactor and method
/// table, wires the inbound queue, runs the initial program, then parks in
/// the event loop until stopped.
fn isolate_main(
    shared: Arc<IsolateShared>,
    manager: IsolateManager,
    parent: Option<IsolateNotifier>,
    program: Program,
) {
    let mut reactor = Reactor::new().expect("failed to create isolate reactor");

    let stop_handle = reactor.stop_handle();
    shared.stop.set(stop_handle.clone()).ok();
    shared.thread_id.set(thread::current().id()).ok();

    // A stop requested before the handle was published lands here
    if shared.stop_requested.load(Ordering::SeqCst) {
        stop_handle.stop();
    }

    let table = Rc::new(RefCell::new(DispatchTable::new()));
    let self_link = IsolateNotifier::new(shared.queue.downgrade());

    {
        let table = table.clone();
        let manager = manager.clone();
        let parent = parent.clone();
        let self_link = self_link.clone();
        reactor
            .bind_queue(&shared.queue, move |reactor, event: IsolateEvent| {
                match event {
                    IsolateEvent::Call { request, reply } => {
                        let response = table.borrow_mut().dispatch(&request);
                        // A caller that timed out dropped its receiver; the
                        // late reply is discarded here
                        reply.try_send(response).ok();
                    }
                    IsolateEvent::Notify { request } => {
                        table.borrow_mut().dispatch_notification(&request);
                    }
                    IsolateEvent::Run { program } => {
                        let mut scope = IsolateScope::new(
                            reactor,
                            &table,
                            &manager,
                            parent.as_ref(),
                            &self_link,
                        );
                        program(&mut scope);
                    }
                }
            })
            .expect("failed to bind isolate inbound queue");
    }

    {
        let mut scope =
            IsolateScope::new(&mut reactor, &table, &manager, parent.as_ref(), &self_link);
        program(&mut scope);
    }

    shared.state.store(STATE_RUNNING, Ordering::Release);
    let mut clock = PrecisionClock::new();
    if let Err(err) = reactor.run(&mut clock) {
        log::error!("isolate '{}' event loop failed: {}", shared.name, err);
    }
}
