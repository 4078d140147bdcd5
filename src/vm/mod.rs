//! VM collaborator interface
//!
//! The IPC layer never walks page tables. It asks the memory subsystem to
//! pin a user virtual range into an ordered list of physical page
//! references ([`UserMemory::pin`]) and then copies page by page through
//! those references.
//!
//! [`sim::SimMemory`] is a self-contained implementation with per-task page
//! maps, used by hosted builds and the test suite.

pub mod page;
pub mod sim;

use alloc::vec::Vec;

use crate::types::TaskId;

pub use page::{PageRef, PhysPage, PAGE_SHIFT, PAGE_SIZE};
pub use sim::SimMemory;

/// Access a pinned range must allow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// The kernel will read from the pages (send-side data)
    Read,
    /// The kernel will write into the pages (receive-side data)
    Write,
}

/// Memory subsystem failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VmError {
    #[error("address {addr:#x} is not mapped")]
    Unmapped { addr: usize },
    #[error("address {addr:#x} does not allow the requested access")]
    Protection { addr: usize },
    #[error("range wraps the address space")]
    Overflow,
    #[error("access outside a physical page")]
    OutOfBounds,
    #[error("unknown task")]
    NoSuchTask,
}

/// Memory capability consumed by the IPC layer
pub trait UserMemory: Send + Sync {
    /// Pin `[addr, addr + len)` of `task`'s address space.
    ///
    /// Returns one page reference per virtual page touched by the range, in
    /// address order. A zero-length range pins nothing.
    fn pin(&self, task: TaskId, addr: usize, len: usize, access: Access)
        -> Result<Vec<PageRef>, VmError>;
}

/// Round an address down to its page boundary
#[inline]
pub const fn trunc_page(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Offset of an address inside its page
#[inline]
pub const fn page_offset(addr: usize) -> usize {
    addr & (PAGE_SIZE - 1)
}

/// Number of pages touched by `[addr, addr + len)`
pub fn pages_spanned(addr: usize, len: usize) -> Result<usize, VmError> {
    if len == 0 {
        return Ok(0);
    }
    let last = addr.checked_add(len - 1).ok_or(VmError::Overflow)?;
    Ok(((last >> PAGE_SHIFT) - (addr >> PAGE_SHIFT)) + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_math() {
        assert_eq!(trunc_page(0x1fff), 0x1000);
        assert_eq!(page_offset(0x1fff), 0xfff);
        assert_eq!(pages_spanned(0x1000, 0), Ok(0));
        assert_eq!(pages_spanned(0x1000, PAGE_SIZE), Ok(1));
        assert_eq!(pages_spanned(0x1fff, 2), Ok(2));
        assert_eq!(pages_spanned(usize::MAX, 2), Err(VmError::Overflow));
    }
}
