//! Buffer Descriptors - page-chunked scatter/gather views
//!
//! A [`BufferDescriptor`] turns a user scatter/gather list into an ordered
//! sequence of `(page, offset, len)` chunks by pinning every page through
//! the [`UserMemory`] collaborator. It is built once per message side and
//! never changes afterwards.
//!
//! [`transfer`] walks two descriptors in lockstep and copies at most one
//! page per step, so neither side needs a contiguous virtual range and the
//! kernel working set per step stays bounded to a single page.

use alloc::vec::Vec;

use super::{IpcError, IpcResult};
use crate::types::TaskId;
use crate::vm::{page_offset, Access, PageRef, UserMemory, PAGE_SIZE};

// ============================================================================
// User Vectors
// ============================================================================

/// One user scatter/gather element (like `struct iovec`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct IoVec {
    /// User virtual address
    pub base: usize,
    /// Length in bytes
    pub len: usize,
}

impl IoVec {
    pub const fn new(base: usize, len: usize) -> Self {
        Self { base, len }
    }
}

/// Which way data flows through a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Data is read out of these pages (message payload, reply data)
    Send,
    /// Data is written into these pages (receive area, reply area)
    Receive,
}

impl Side {
    fn access(self) -> Access {
        match self {
            Side::Send => Access::Read,
            Side::Receive => Access::Write,
        }
    }
}

/// Copy direction for [`transfer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Message descriptor -> buffer descriptor (request leg)
    ToBuffer,
    /// Buffer descriptor -> message descriptor (reply leg)
    FromBuffer,
}

// ============================================================================
// Buffer Descriptor
// ============================================================================

/// A byte range inside one pinned page
#[derive(Debug, Clone)]
struct Chunk {
    page: PageRef,
    offset: usize,
    len: usize,
}

/// Ordered page chunks covering a scatter/gather region
#[derive(Debug, Clone, Default)]
pub struct BufferDescriptor {
    chunks: Vec<Chunk>,
    /// Total bytes covered
    len: usize,
    /// Intra-page offset of the first byte
    offset: usize,
}

impl BufferDescriptor {
    /// A descriptor covering nothing
    pub fn empty() -> Self {
        Self::default()
    }

    /// Pin `iovecs` in `task`'s address space and chunk them by page.
    ///
    /// Fails with `InvalidArgument` when there are more than `max_iovecs`
    /// vectors, when the total length overflows, or when any vector touches
    /// memory that is unmapped or lacks the access `side` needs.
    pub fn build(
        memory: &dyn UserMemory,
        task: TaskId,
        iovecs: &[IoVec],
        side: Side,
        max_iovecs: usize,
    ) -> IpcResult<Self> {
        if iovecs.len() > max_iovecs {
            return Err(IpcError::InvalidArgument);
        }

        let mut desc = Self::empty();
        for iov in iovecs.iter().filter(|iov| iov.len != 0) {
            let pages = memory
                .pin(task, iov.base, iov.len, side.access())
                .map_err(|err| {
                    log::trace!("buffer build: {} vector {:?}: {}", task, iov, err);
                    IpcError::InvalidArgument
                })?;

            let mut remaining = iov.len;
            let mut offset = page_offset(iov.base);
            if desc.chunks.is_empty() {
                desc.offset = offset;
            }
            for page in pages {
                let len = (PAGE_SIZE - offset).min(remaining);
                desc.chunks.push(Chunk { page, offset, len });
                remaining -= len;
                offset = 0;
            }
            desc.len = desc
                .len
                .checked_add(iov.len)
                .ok_or(IpcError::InvalidArgument)?;
        }
        Ok(desc)
    }

    /// Total bytes covered
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Intra-page offset of the first byte
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Number of page chunks
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
}

// ============================================================================
// Chunk Cursor
// ============================================================================

/// Position inside a chunk sequence
struct Cursor<'a> {
    chunks: &'a [Chunk],
    index: usize,
    within: usize,
}

impl<'a> Cursor<'a> {
    fn new(desc: &'a BufferDescriptor) -> Self {
        Self {
            chunks: &desc.chunks,
            index: 0,
            within: 0,
        }
    }

    /// Skip `n` bytes
    fn seek(&mut self, mut n: usize) {
        while n > 0 && self.index < self.chunks.len() {
            let step = self.span().min(n);
            self.advance(step);
            n -= step;
        }
    }

    /// Bytes left in the current chunk
    fn span(&self) -> usize {
        self.chunks
            .get(self.index)
            .map_or(0, |chunk| chunk.len - self.within)
    }

    fn current(&self) -> Option<(&'a PageRef, usize)> {
        self.chunks
            .get(self.index)
            .map(|chunk| (&chunk.page, chunk.offset + self.within))
    }

    fn advance(&mut self, n: usize) {
        self.within += n;
        if self.index < self.chunks.len() && self.within == self.chunks[self.index].len {
            self.index += 1;
            self.within = 0;
        }
    }
}

// ============================================================================
// Transfer
// ============================================================================

/// Copy between a message-side and a buffer-side descriptor.
///
/// With [`Direction::ToBuffer`] the message bytes land in `buffer` starting
/// `offset` bytes in; with [`Direction::FromBuffer`] the buffer bytes land in
/// `message` starting `offset` bytes in. The destination span is checked
/// before the first byte moves; an `offset` past the destination end is a
/// `Fault` with nothing copied. Returns the number of bytes moved, which is
/// the smaller of the source length and the destination room.
pub fn transfer(
    message: &BufferDescriptor,
    buffer: &BufferDescriptor,
    offset: usize,
    direction: Direction,
) -> IpcResult<usize> {
    let (src, dst) = match direction {
        Direction::ToBuffer => (message, buffer),
        Direction::FromBuffer => (buffer, message),
    };
    if offset > dst.len {
        return Err(IpcError::Fault);
    }
    let total = src.len.min(dst.len - offset);

    let mut from = Cursor::new(src);
    let mut to = Cursor::new(dst);
    to.seek(offset);

    let mut bounce = [0u8; PAGE_SIZE];
    let mut moved = 0;
    while moved < total {
        let step = from.span().min(to.span()).min(total - moved).min(PAGE_SIZE);
        let ((src_page, src_off), (dst_page, dst_off)) = match (from.current(), to.current()) {
            (Some(s), Some(d)) if step > 0 => (s, d),
            _ => return Err(IpcError::Fault),
        };
        src_page.read(src_off, &mut bounce[..step])?;
        dst_page.write(dst_off, &bounce[..step])?;
        from.advance(step);
        to.advance(step);
        moved += step;
    }
    Ok(moved)
}
