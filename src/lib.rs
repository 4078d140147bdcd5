//! Mach_R IPC - synchronous port/channel message passing
//!
//! This crate is the port/channel subsystem of the Mach_R microkernel:
//! the mechanism that lets isolated tasks exchange messages across
//! address-space boundaries.
//!
//! ## Layout
//!
//! - [`ipc`]: buffer descriptors, messages, ports, channels, the port
//!   control protocol and poll
//! - [`kern`]: scheduling, task and statistics collaborators
//! - [`vm`]: page references and the user-memory pinning collaborator
//! - [`syscall`]: the syscall-equivalent entry points returning signed status
//!
//! All process-wide state lives in an explicitly constructed
//! [`ipc::IpcKernel`]; nothing is reached through globals.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
// Kernel IPC types carry specialized constructors that don't fit Default
#![allow(clippy::new_without_default)]

extern crate alloc;

pub mod config;
pub mod ipc;
pub mod kern;
pub mod libc;
pub mod syscall;
pub mod types;
pub mod vm;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::IpcConfig;
pub use ipc::{IpcError, IpcKernel, IpcResult};
pub use types::{ChannelId, MessageId, PortId, TaskId, ThreadId};

/// Crate version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Subsystem name
pub const NAME: &str = "Mach_R IPC";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(NAME, "Mach_R IPC");
        assert!(!VERSION.is_empty());
    }
}
