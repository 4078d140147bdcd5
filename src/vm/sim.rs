//! Simulated user address spaces
//!
//! Per-task page maps with read/write protection, backed by [`PhysPage`]
//! frames. Used as the [`UserMemory`] collaborator by hosted builds and
//! the test suite; the kernel proper plugs in its pmap-backed pinning.

use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use super::page::{PageRef, PhysPage, PAGE_SHIFT, PAGE_SIZE};
use super::{page_offset, pages_spanned, Access, UserMemory, VmError};
use crate::types::TaskId;

/// One virtual page mapping
#[derive(Debug, Clone)]
struct Mapping {
    page: PageRef,
    writable: bool,
}

/// Virtual page number -> mapping
type PageMap = BTreeMap<usize, Mapping>;

/// Simulated memory for a set of tasks
#[derive(Debug, Default)]
pub struct SimMemory {
    spaces: Mutex<BTreeMap<TaskId, PageMap>>,
}

impl SimMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map zero-filled pages covering `[addr, addr + len)`.
    ///
    /// Pages already mapped keep their frame; only the protection changes.
    pub fn map(
        &self,
        task: TaskId,
        addr: usize,
        len: usize,
        writable: bool,
    ) -> Result<(), VmError> {
        let count = pages_spanned(addr, len)?;
        let first = addr >> PAGE_SHIFT;
        let mut spaces = self.spaces.lock();
        let space = spaces.entry(task).or_default();
        for vpn in first..first + count {
            space
                .entry(vpn)
                .and_modify(|m| m.writable = writable)
                .or_insert_with(|| Mapping {
                    page: PhysPage::alloc(),
                    writable,
                });
        }
        Ok(())
    }

    /// Remove every mapping covering `[addr, addr + len)`
    pub fn unmap(&self, task: TaskId, addr: usize, len: usize) -> Result<(), VmError> {
        let count = pages_spanned(addr, len)?;
        let first = addr >> PAGE_SHIFT;
        let mut spaces = self.spaces.lock();
        if let Some(space) = spaces.get_mut(&task) {
            for vpn in first..first + count {
                space.remove(&vpn);
            }
        }
        Ok(())
    }

    /// Drop a task's whole address space
    pub fn destroy(&self, task: TaskId) {
        self.spaces.lock().remove(&task);
    }

    /// Store bytes as the task itself would (protection is not checked)
    pub fn write_bytes(&self, task: TaskId, addr: usize, bytes: &[u8]) -> Result<(), VmError> {
        let pages = self.lookup(task, addr, bytes.len(), None)?;
        let mut done = 0;
        let mut offset = page_offset(addr);
        for page in pages {
            let n = (PAGE_SIZE - offset).min(bytes.len() - done);
            page.write(offset, &bytes[done..done + n])?;
            done += n;
            offset = 0;
        }
        Ok(())
    }

    /// Load bytes as the task itself would
    pub fn read_bytes(&self, task: TaskId, addr: usize, len: usize) -> Result<Vec<u8>, VmError> {
        let pages = self.lookup(task, addr, len, None)?;
        let mut out = vec![0u8; len];
        let mut done = 0;
        let mut offset = page_offset(addr);
        for page in pages {
            let n = (PAGE_SIZE - offset).min(len - done);
            page.read(offset, &mut out[done..done + n])?;
            done += n;
            offset = 0;
        }
        Ok(out)
    }

    fn lookup(
        &self,
        task: TaskId,
        addr: usize,
        len: usize,
        access: Option<Access>,
    ) -> Result<Vec<PageRef>, VmError> {
        let count = pages_spanned(addr, len)?;
        if count == 0 {
            return Ok(Vec::new());
        }
        let first = addr >> PAGE_SHIFT;
        let spaces = self.spaces.lock();
        let space = spaces.get(&task).ok_or(VmError::NoSuchTask)?;
        let mut pages = Vec::with_capacity(count);
        for vpn in first..first + count {
            let va = vpn << PAGE_SHIFT;
            let mapping = space
                .get(&vpn)
                .ok_or(VmError::Unmapped { addr: va.max(addr) })?;
            if access == Some(Access::Write) && !mapping.writable {
                return Err(VmError::Protection { addr: va.max(addr) });
            }
            pages.push(mapping.page.clone());
        }
        Ok(pages)
    }
}

impl UserMemory for SimMemory {
    fn pin(
        &self,
        task: TaskId,
        addr: usize,
        len: usize,
        access: Access,
    ) -> Result<Vec<PageRef>, VmError> {
        self.lookup(task, addr, len, Some(access))
    }
}
