//! Common types used across Mach_R IPC
//!
//! This module defines the identifier newtypes shared by every subsystem
//! to avoid circular dependencies.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

/// Declare a `u64` identifier newtype with a process-unique generator.
macro_rules! kernel_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name(pub u64);

        impl $name {
            /// Create a new identifier with a unique auto-incremented value
            pub fn new() -> Self {
                static COUNTER: AtomicU64 = AtomicU64::new(1);
                $name(COUNTER.fetch_add(1, Ordering::Relaxed))
            }

            /// Get the raw u64 value
            pub fn as_u64(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

kernel_id!(
    /// Task identifier
    TaskId,
    "task#"
);

kernel_id!(
    /// Thread identifier
    ThreadId,
    "thread#"
);

kernel_id!(
    /// Unique port identifier
    PortId,
    "port#"
);

kernel_id!(
    /// Unique channel identifier
    ChannelId,
    "chan#"
);

kernel_id!(
    /// Unique message identifier, valid while the message is pending
    MessageId,
    "msg#"
);
