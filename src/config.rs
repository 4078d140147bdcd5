//! IPC configuration
//!
//! Limits handed to [`IpcKernel::new`](crate::ipc::IpcKernel::new). The
//! defaults match a small Mach_R system; boot code may override them from
//! the machine description before constructing the kernel.

use crate::ipc::{IpcError, IpcResult};

/// Hard ceiling on the number of queued messages a single port may hold
pub const MAX_PORT_CAPACITY: usize = 1024;

/// Platform limit on scatter/gather vectors per buffer
pub const IOV_MAX: usize = 1024;

/// Maximum number of objects a single poll may wait on
pub const POLL_MAX: usize = 64;

/// Default queued-message limit for a new port
pub const DEFAULT_PORT_CAPACITY: usize = 16;

/// Default scatter/gather vector limit per buffer
pub const DEFAULT_MAX_IOVECS: usize = 16;

/// Tunable limits of the IPC layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpcConfig {
    /// Queued-message limit used when `install` is not given one
    pub port_capacity: usize,
    /// Maximum scatter/gather vectors accepted by `BufferDescriptor::build`,
    /// and maximum number of extras stacked on one message by APPEND
    pub max_iovecs: usize,
    /// Maximum live ports owned by one task
    pub max_ports_per_task: usize,
    /// Maximum live channels owned by one task
    pub max_channels_per_task: usize,
}

impl IpcConfig {
    /// Create the default configuration
    pub const fn new() -> Self {
        Self {
            port_capacity: DEFAULT_PORT_CAPACITY,
            max_iovecs: DEFAULT_MAX_IOVECS,
            max_ports_per_task: 64,
            max_channels_per_task: 256,
        }
    }

    pub const fn with_port_capacity(mut self, capacity: usize) -> Self {
        self.port_capacity = capacity;
        self
    }

    pub const fn with_max_iovecs(mut self, max: usize) -> Self {
        self.max_iovecs = max;
        self
    }

    pub const fn with_max_ports_per_task(mut self, max: usize) -> Self {
        self.max_ports_per_task = max;
        self
    }

    pub const fn with_max_channels_per_task(mut self, max: usize) -> Self {
        self.max_channels_per_task = max;
        self
    }

    /// Check every limit against the platform ceilings
    pub fn validate(&self) -> IpcResult<()> {
        if self.port_capacity == 0 || self.port_capacity > MAX_PORT_CAPACITY {
            return Err(IpcError::InvalidArgument);
        }
        if self.max_iovecs == 0 || self.max_iovecs > IOV_MAX {
            return Err(IpcError::InvalidArgument);
        }
        if self.max_ports_per_task == 0 || self.max_channels_per_task == 0 {
            return Err(IpcError::InvalidArgument);
        }
        Ok(())
    }
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self::new()
    }
}
