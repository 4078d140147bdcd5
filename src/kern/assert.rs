//! Structural invariant checks
//!
//! IPC errors are always reported to the caller. The only path to a fatal
//! stop is a broken structural invariant (reference-count underflow, a
//! message owned by two queues), which is a kernel programming error: it is
//! logged and then routed into the panic handler, which halts the CPU.

/// Halt the kernel if a structural IPC invariant does not hold.
macro_rules! ipc_invariant {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            log::error!("IPC invariant violated: {}", format_args!($($arg)+));
            panic!("IPC invariant violated: {}", format_args!($($arg)+));
        }
    };
}

pub(crate) use ipc_invariant;
