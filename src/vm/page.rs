//! Physical Page References
//!
//! Based on Mach4 vm/vm_page.h
//!
//! A [`PhysPage`] is one frame of physical memory. Pinned frames are shared
//! through [`PageRef`] (`Arc<PhysPage>`), so a frame stays valid for as long
//! as any buffer descriptor refers to it, even if the owning task unmaps it.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use spin::Mutex;

use super::VmError;

// ============================================================================
// Constants
// ============================================================================

/// Page size (4KB on most platforms)
pub const PAGE_SIZE: usize = 4096;

/// Page shift (log2 of PAGE_SIZE)
pub const PAGE_SHIFT: usize = 12;

/// Shared reference to a pinned physical page
pub type PageRef = Arc<PhysPage>;

// ============================================================================
// Physical Page
// ============================================================================

/// One physical frame
///
/// The frame contents sit behind the kernel staging-window lock: each
/// `read`/`write` corresponds to one map/copy/unmap of the frame.
#[derive(Debug)]
pub struct PhysPage {
    data: Mutex<Box<[u8]>>,
}

impl PhysPage {
    /// Allocate a zero-filled frame
    pub fn alloc() -> PageRef {
        Arc::new(Self {
            data: Mutex::new(vec![0u8; PAGE_SIZE].into_boxed_slice()),
        })
    }

    fn check(offset: usize, len: usize) -> Result<(), VmError> {
        match offset.checked_add(len) {
            Some(end) if end <= PAGE_SIZE => Ok(()),
            _ => Err(VmError::OutOfBounds),
        }
    }

    /// Copy `dst.len()` bytes out of the frame starting at `offset`
    pub fn read(&self, offset: usize, dst: &mut [u8]) -> Result<(), VmError> {
        Self::check(offset, dst.len())?;
        let data = self.data.lock();
        dst.copy_from_slice(&data[offset..offset + dst.len()]);
        Ok(())
    }

    /// Copy `src` into the frame starting at `offset`
    pub fn write(&self, offset: usize, src: &[u8]) -> Result<(), VmError> {
        Self::check(offset, src.len())?;
        let mut data = self.data.lock();
        data[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write() {
        let page = PhysPage::alloc();
        page.write(100, b"mach").unwrap();

        let mut out = [0u8; 4];
        page.read(100, &mut out).unwrap();
        assert_eq!(&out, b"mach");
    }

    #[test]
    fn test_bounds() {
        let page = PhysPage::alloc();
        let mut out = [0u8; 8];
        assert_eq!(page.read(PAGE_SIZE - 4, &mut out), Err(VmError::OutOfBounds));
        assert_eq!(page.write(usize::MAX, b"x"), Err(VmError::OutOfBounds));
    }
}
