//! Mach-style synchronous Inter-Process Communication
//!
//! This is the core of the microkernel - all communication between tasks
//! happens through ports and the channels bound to them.
//!
//! ## Components (leaves first)
//!
//! - [`buffer`]: page-chunked scatter/gather descriptors and the copy engine
//! - [`message`]: one request with its send/receive descriptors and reply slot
//! - [`mqueue`]: blocking / non-blocking queue strategies
//! - [`port`]: the receiving endpoint owned by one task
//! - [`channel`]: reference-counted sending handle bound to a port
//! - [`port_ctl`]: FORWARD / APPEND / CUT / REPLY on in-flight messages
//! - [`poll`]: waiting on readiness of several ports and channels
//! - [`space`]: the [`IpcKernel`] owning every table and collaborator

use crate::vm::VmError;

pub mod buffer;
pub mod channel;
pub mod message;
pub mod mqueue;
pub mod poll;
pub mod port;
pub mod port_ctl;
pub mod space;

pub use buffer::{transfer, BufferDescriptor, Direction, IoVec, Side};
pub use channel::{Channel, ChannelCmd, ChannelFlags};
pub use message::{Delivery, Message, MessageFlags, MessageState, SendOutcome};
pub use mqueue::{MessageQueue, QueueStrategy};
pub use poll::{PollEntry, PollEvents, PollObject, PollReady};
pub use port::{Port, PortFlags};
pub use port_ctl::{PortCtl, PortCtlCmd};
pub use space::{IpcKernel, PortRef, TaskEntry};

/// IPC error types
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IpcError {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("no such port, channel or message")]
    NotFound,
    #[error("peer port has shut down")]
    PipeClosed,
    #[error("operation not supported by this port")]
    NotSupported,
    #[error("resource exhausted")]
    ResourceExhausted,
    #[error("user memory fault during transfer")]
    Fault,
    #[error("blocked thread cancelled by task termination")]
    Cancelled,
}

impl From<VmError> for IpcError {
    /// Memory errors seen while copying. Build-time pinning failures are
    /// mapped to `InvalidArgument` by the descriptor builder instead.
    fn from(_: VmError) -> Self {
        IpcError::Fault
    }
}

/// Result type for IPC operations
pub type IpcResult<T> = Result<T, IpcError>;
