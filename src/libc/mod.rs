//! POSIX compatibility constants for the Mach_R IPC syscall surface
//!
//! Only the errno table is needed: every IPC entry point reports failure
//! as a negated errno value.

pub mod errno;
