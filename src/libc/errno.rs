//! POSIX errno.h - error codes returned (negated) by IPC syscalls

use crate::ipc::IpcError;

// Standard errno values
pub const ENOENT: i32 = 2; // No such file or directory
pub const EINTR: i32 = 4; // Interrupted system call
pub const EAGAIN: i32 = 11; // Try again
pub const ENOMEM: i32 = 12; // Out of memory
pub const EFAULT: i32 = 14; // Bad address
pub const EINVAL: i32 = 22; // Invalid argument
pub const EPIPE: i32 = 32; // Broken pipe
pub const ENOSYS: i32 = 38; // Function not implemented
pub const EOPNOTSUPP: i32 = 95; // Operation not supported on transport endpoint

impl IpcError {
    /// Convert IpcError to POSIX errno value
    pub fn to_errno(&self) -> i32 {
        match self {
            IpcError::InvalidArgument => EINVAL,  // Invalid argument
            IpcError::NotFound => ENOENT,         // No live object with that name
            IpcError::PipeClosed => EPIPE,        // Peer endpoint shut down
            IpcError::NotSupported => EOPNOTSUPP, // Transport not implemented
            IpcError::ResourceExhausted => ENOMEM, // Out of memory / over limit
            IpcError::Fault => EFAULT,            // Bad user address
            IpcError::Cancelled => EINTR,         // Task terminated while blocked
        }
    }

    /// Map a negated errno back to an IpcError
    pub fn from_errno(errno: i32) -> Option<Self> {
        match errno {
            EINVAL => Some(IpcError::InvalidArgument),
            ENOENT => Some(IpcError::NotFound),
            EPIPE => Some(IpcError::PipeClosed),
            EOPNOTSUPP => Some(IpcError::NotSupported),
            ENOMEM => Some(IpcError::ResourceExhausted),
            EFAULT => Some(IpcError::Fault),
            EINTR => Some(IpcError::Cancelled),
            _ => None,
        }
    }
}
