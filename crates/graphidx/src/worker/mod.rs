pub mod pool;
pub mod runner;

pub use pool::{Scheduler, SchedulerSettings};
pub use runner::{INTERRUPTED_MESSAGE, LEASE_EXPIRED_MESSAGE, SHUTDOWN_MESSAGE};
