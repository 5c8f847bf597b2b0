mod io_driver;
mod queue_driver;
mod timer_driver;

pub use io_driver::{FdCallback, MonitorError, Readiness};
pub(crate) use io_driver::{IoDriver, Watch};
pub use queue_driver::{BindError, EventQueue, QueueDetached, QueueDispatch, WeakQueue};
pub(crate) use queue_driver::QueueDriver;
pub use timer_driver::{ScheduleError, TimerCallback, TimerId};
pub(crate) use timer_driver::{TimerDriver, TimerEntry};
