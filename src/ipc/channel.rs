//! Channel - reference-counted sending handle bound to a port
//!
//! A channel is created with one handle. Clones add handles and alias the
//! same binding; closes drop them, and a close beyond the handle count is
//! refused. Operations that use the binding (send, poll) pin the channel
//! for their duration without adding a handle.
//!
//! `refs` counts handles plus pins. The thread whose release takes it from
//! one to zero is the only one allowed to detach the channel from its port
//! and free it: `fetch_sub` hands that role to exactly one caller, and the
//! detach itself swaps the binding out under the channel lock so a second
//! attempt finds nothing to do.

use alloc::sync::Arc;
use core::mem;
use core::sync::atomic::{AtomicUsize, Ordering};

use bitflags::bitflags;
use spin::Mutex;

use super::port::Port;
use super::{IpcError, IpcResult};
use crate::kern::assert::ipc_invariant;
use crate::types::{ChannelId, PortId, TaskId};

bitflags! {
    /// Channel mode bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ChannelFlags: u32 {
        /// Synchronous (blocking) send mode
        const SYNC = 1 << 0;
        /// Receiver may read the sender's pages directly
        const DIRECT_READ = 1 << 1;
        /// Receiver may write the reply directly
        const DIRECT_WRITE = 1 << 2;
    }
}

// Raw channel_control command numbers
pub const CHANNEL_QUERY_SYNC: u32 = 1;
pub const CHANNEL_SET_SYNC: u32 = 2;
pub const CHANNEL_QUERY_PORT: u32 = 3;
pub const CHANNEL_QUERY_REFS: u32 = 4;

/// Channel control commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelCmd {
    /// 1 if the channel is in synchronous mode, else 0
    QuerySync,
    /// Enter or leave synchronous mode
    SetSync(bool),
    /// Id of the bound port
    QueryPort,
    /// Current reference count
    QueryRefs,
}

impl ChannelCmd {
    /// Decode a raw `(cmd, arg)` pair
    pub fn from_raw(cmd: u32, arg: u64) -> IpcResult<Self> {
        match cmd {
            CHANNEL_QUERY_SYNC => Ok(ChannelCmd::QuerySync),
            CHANNEL_SET_SYNC => match arg {
                0 => Ok(ChannelCmd::SetSync(false)),
                1 => Ok(ChannelCmd::SetSync(true)),
                _ => Err(IpcError::InvalidArgument),
            },
            CHANNEL_QUERY_PORT => Ok(ChannelCmd::QueryPort),
            CHANNEL_QUERY_REFS => Ok(ChannelCmd::QueryRefs),
            _ => Err(IpcError::InvalidArgument),
        }
    }
}

#[derive(Debug)]
enum Binding {
    Unbound,
    Bound(Arc<Port>),
    /// Last reference dropped
    Detached,
}

#[derive(Debug)]
struct ChannelInner {
    flags: ChannelFlags,
    binding: Binding,
}

/// A sending endpoint
#[derive(Debug)]
pub struct Channel {
    id: ChannelId,
    owner: TaskId,
    /// Handles plus in-flight pins
    refs: AtomicUsize,
    /// Handles held by the owner
    handles: AtomicUsize,
    inner: Mutex<ChannelInner>,
}

impl Channel {
    /// Create an unbound channel holding one handle
    pub fn new(owner: TaskId, flags: ChannelFlags) -> Self {
        Self {
            id: ChannelId::new(),
            owner,
            refs: AtomicUsize::new(1),
            handles: AtomicUsize::new(1),
            inner: Mutex::new(ChannelInner {
                flags,
                binding: Binding::Unbound,
            }),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn owner(&self) -> TaskId {
        self.owner
    }

    pub fn flags(&self) -> ChannelFlags {
        self.inner.lock().flags
    }

    pub fn refs(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    pub fn handles(&self) -> usize {
        self.handles.load(Ordering::Acquire)
    }

    // ========================================================================
    // Reference counting
    // ========================================================================

    /// Add a reference unless the count already reached zero
    pub fn try_acquire(&self) -> bool {
        step_nonzero(&self.refs, |n| n + 1).is_some()
    }

    /// Add a handle unless the last one is already closed. The caller must
    /// hold a reference taken with [`try_acquire`](Self::try_acquire) for
    /// the new handle.
    pub fn try_add_handle(&self) -> bool {
        step_nonzero(&self.handles, |n| n + 1).is_some()
    }

    /// Close one handle. Returns the handles left, or `None` if every
    /// handle was already closed. The caller then drops the handle's
    /// reference with [`release`](Self::release).
    pub fn drop_handle(&self) -> Option<usize> {
        step_nonzero(&self.handles, |n| n - 1).map(|prev| prev - 1)
    }

    /// Drop a reference. Returns true for the single caller that took the
    /// count to zero; that caller must [`detach`](Self::detach).
    pub fn release(&self) -> bool {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        ipc_invariant!(prev > 0, "{} reference count underflow", self.id);
        prev == 1
    }

    // ========================================================================
    // Binding
    // ========================================================================

    /// Bind to `port`. Fails if already bound or if the port shut down.
    pub fn bind(&self, port: Arc<Port>) -> IpcResult<()> {
        let mut inner = self.inner.lock();
        if !matches!(inner.binding, Binding::Unbound) {
            return Err(IpcError::InvalidArgument);
        }
        port.bind(self.id)?;
        inner.binding = Binding::Bound(port);
        Ok(())
    }

    /// The bound port, if it is still accepting messages
    pub fn port(&self) -> IpcResult<Arc<Port>> {
        match &self.inner.lock().binding {
            Binding::Bound(port) if port.is_shutdown() => Err(IpcError::PipeClosed),
            Binding::Bound(port) => Ok(port.clone()),
            Binding::Detached => Err(IpcError::PipeClosed),
            Binding::Unbound => Err(IpcError::InvalidArgument),
        }
    }

    /// Id of the bound port, live or not
    pub fn port_id(&self) -> Option<PortId> {
        match &self.inner.lock().binding {
            Binding::Bound(port) => Some(port.id()),
            _ => None,
        }
    }

    pub fn is_detached(&self) -> bool {
        matches!(self.inner.lock().binding, Binding::Detached)
    }

    /// Drop the binding after the last release. Returns the port it was
    /// bound to; a second call returns `None`.
    pub fn detach(&self) -> Option<Arc<Port>> {
        let old = mem::replace(&mut self.inner.lock().binding, Binding::Detached);
        match old {
            Binding::Bound(port) => {
                port.unbind(self.id);
                Some(port)
            }
            _ => None,
        }
    }

    // ========================================================================
    // Control
    // ========================================================================

    pub fn control(&self, cmd: ChannelCmd) -> IpcResult<i64> {
        match cmd {
            ChannelCmd::QuerySync => Ok(i64::from(self.flags().contains(ChannelFlags::SYNC))),
            ChannelCmd::SetSync(on) => {
                self.inner.lock().flags.set(ChannelFlags::SYNC, on);
                Ok(0)
            }
            ChannelCmd::QueryPort => self
                .port_id()
                .map(|id| id.as_u64() as i64)
                .ok_or(IpcError::InvalidArgument),
            ChannelCmd::QueryRefs => Ok(self.handles() as i64),
        }
    }
}

/// Apply `f` to a counter that is not zero; returns the previous value
fn step_nonzero(counter: &AtomicUsize, f: impl Fn(usize) -> usize) -> Option<usize> {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n != 0).then(|| f(n)))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::port::PortFlags;
    use crate::kern::host_sched::HostScheduler;
    use crate::kern::task::Task;

    #[test]
    fn test_refcount_hand_off() {
        let chan = Channel::new(TaskId(1), ChannelFlags::SYNC);
        assert_eq!(chan.refs(), 1);
        assert!(chan.try_acquire());
        assert!(!chan.release());
        assert!(chan.release());
        assert!(!chan.try_acquire());
    }

    #[test]
    fn test_handles_are_counted_apart_from_pins() {
        let chan = Channel::new(TaskId(1), ChannelFlags::empty());
        assert!(chan.try_acquire());
        assert!(chan.try_add_handle());
        assert!(chan.try_acquire());
        assert_eq!((chan.handles(), chan.refs()), (2, 3));

        assert_eq!(chan.drop_handle(), Some(1));
        assert!(!chan.release());
        assert_eq!(chan.drop_handle(), Some(0));
        assert!(!chan.release());
        assert_eq!(chan.drop_handle(), None);
        assert!(!chan.try_add_handle());
        assert_eq!(chan.control(ChannelCmd::QueryRefs), Ok(0));

        // The pin is the last reference
        assert!(chan.release());
    }

    #[test]
    #[should_panic(expected = "underflow")]
    fn test_release_underflow_halts() {
        let chan = Channel::new(TaskId(1), ChannelFlags::empty());
        chan.release();
        chan.release();
    }

    #[test]
    fn test_bind_and_detach() {
        let owner = Arc::new(Task::new());
        let port = Port::install(&owner, PortFlags::empty(), 4).unwrap();
        let chan = Channel::new(TaskId(2), ChannelFlags::empty());

        assert_eq!(chan.port().err(), Some(IpcError::InvalidArgument));
        chan.bind(port.clone()).unwrap();
        assert_eq!(chan.bind(port.clone()), Err(IpcError::InvalidArgument));
        assert!(port.is_bound(chan.id()));
        assert_eq!(chan.port_id(), Some(port.id()));

        assert_eq!(chan.detach().map(|p| p.id()), Some(port.id()));
        assert!(chan.detach().is_none());
        assert!(chan.is_detached());
        assert!(!port.is_bound(chan.id()));
    }

    #[test]
    fn test_port_shutdown_reports_pipe_closed() {
        let sched = HostScheduler::new();
        let owner = Arc::new(Task::new());
        let port = Port::install(&owner, PortFlags::empty(), 4).unwrap();
        let chan = Channel::new(TaskId(2), ChannelFlags::empty());
        chan.bind(port.clone()).unwrap();

        port.shutdown(&sched);
        assert_eq!(chan.port().err(), Some(IpcError::PipeClosed));
        assert_eq!(chan.port_id(), Some(port.id()));
        assert!(chan.release());
        assert!(chan.detach().is_some());
    }

    #[test]
    fn test_control_commands() {
        let chan = Channel::new(TaskId(3), ChannelFlags::SYNC);
        assert_eq!(chan.control(ChannelCmd::QuerySync), Ok(1));
        assert_eq!(chan.control(ChannelCmd::SetSync(false)), Ok(0));
        assert_eq!(chan.control(ChannelCmd::QuerySync), Ok(0));
        assert_eq!(chan.control(ChannelCmd::QueryRefs), Ok(1));
        assert_eq!(
            chan.control(ChannelCmd::QueryPort),
            Err(IpcError::InvalidArgument)
        );

        assert_eq!(ChannelCmd::from_raw(CHANNEL_SET_SYNC, 1), Ok(ChannelCmd::SetSync(true)));
        assert_eq!(ChannelCmd::from_raw(CHANNEL_SET_SYNC, 7), Err(IpcError::InvalidArgument));
        assert_eq!(ChannelCmd::from_raw(99, 0), Err(IpcError::InvalidArgument));
    }

    #[test]
    fn test_concurrent_release_frees_once() {
        let chan = Channel::new(TaskId(4), ChannelFlags::empty());
        for _ in 0..7 {
            assert!(chan.try_acquire());
        }
        let last = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8).map(|_| s.spawn(|| chan.release())).collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|was_last| *was_last)
                .count()
        });
        assert_eq!(last, 1);
        assert_eq!(chan.refs(), 0);
    }
}
