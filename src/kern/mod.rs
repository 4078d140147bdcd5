//! Kern subsystem - collaborators the IPC layer is built on
//!
//! The IPC layer does not own scheduling or task lifecycle; it consumes them
//! through the interfaces declared here. A hosted scheduler backed by std
//! threads is available with the `std` feature.

pub mod assert;
pub mod counters;
#[cfg(any(test, feature = "std"))]
pub mod host_sched;
pub mod sched_prim;
pub mod task;

pub use counters::{IpcCounter, IpcStats, StatsSnapshot};
#[cfg(any(test, feature = "std"))]
pub use host_sched::HostScheduler;
pub use sched_prim::{Scheduler, WaitList, WaitResult};
pub use task::Task;
