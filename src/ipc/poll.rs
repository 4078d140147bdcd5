//! Poll - wait for readiness on several ports and channels
//!
//! The caller registers as a poller on every target, then checks
//! readiness, and only then suspends. Any state change that can make a
//! target ready (a message queued, a receiver starting to wait, a
//! shutdown) wakes the port's pollers, so a change between the check and
//! the suspend leaves a pending wake instead of being lost.
//!
//! Readiness is re-evaluated after every wakeup. Another thread may have
//! drained a target in between; that case simply loops or, at the
//! deadline, returns an empty set.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::time::Duration;

use bitflags::bitflags;

use super::port::Port;
use super::space::{IpcKernel, PortRef};
use super::{IpcError, IpcResult};
use crate::config::POLL_MAX;
use crate::kern::sched_prim::WaitResult;
use crate::types::{ChannelId, PortId, TaskId, ThreadId};

bitflags! {
    /// Readiness bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PollEvents: u32 {
        /// A port has queued messages
        const READABLE = 1 << 0;
        /// A send on the channel would rendezvous at once
        const WRITABLE = 1 << 1;
        /// The port (or the channel's port) shut down; always reported
        const HANGUP = 1 << 2;
    }
}

/// Object being polled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollObject {
    Port(PortId),
    Channel(ChannelId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollEntry {
    pub object: PollObject,
    pub interest: PollEvents,
}

impl PollEntry {
    pub fn port(id: PortId, interest: PollEvents) -> Self {
        Self {
            object: PollObject::Port(id),
            interest,
        }
    }

    pub fn channel(id: ChannelId, interest: PollEvents) -> Self {
        Self {
            object: PollObject::Channel(id),
            interest,
        }
    }
}

/// One ready entry: its index in the request and the events seen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollReady {
    pub index: usize,
    pub events: PollEvents,
}

/// A resolved poll target
enum Target<'k> {
    Port(Arc<Port>),
    Channel(PortRef<'k>),
    /// Channel whose port already shut down
    Hungup,
}

impl Target<'_> {
    fn port(&self) -> Option<&Port> {
        match self {
            Target::Port(port) => Some(port.as_ref()),
            Target::Channel(port) => Some(&**port),
            Target::Hungup => None,
        }
    }

    fn events(&self) -> PollEvents {
        let mut events = PollEvents::empty();
        match self {
            Target::Port(port) => {
                let status = port.status();
                events.set(PollEvents::HANGUP, status.shutdown);
                events.set(PollEvents::READABLE, status.queued > 0);
            }
            Target::Channel(port) => {
                let status = port.status();
                events.set(PollEvents::HANGUP, status.shutdown);
                events.set(
                    PollEvents::WRITABLE,
                    !status.shutdown && !status.full && status.receiver_waiting,
                );
            }
            Target::Hungup => events.insert(PollEvents::HANGUP),
        }
        events
    }
}

type Targets<'k> = heapless::Vec<Target<'k>, POLL_MAX>;

fn collect(entries: &[PollEntry], targets: &Targets<'_>) -> Vec<PollReady> {
    entries
        .iter()
        .zip(targets.iter())
        .enumerate()
        .filter_map(|(index, (entry, target))| {
            let seen = target.events();
            let events = (seen & entry.interest) | (seen & PollEvents::HANGUP);
            (!events.is_empty()).then_some(PollReady { index, events })
        })
        .collect()
}

fn register(targets: &Targets<'_>, thread: ThreadId) {
    for port in targets.iter().filter_map(Target::port) {
        port.register_poller(thread);
    }
}

fn unregister(targets: &Targets<'_>, thread: ThreadId) {
    for port in targets.iter().filter_map(Target::port) {
        port.unregister_poller(thread);
    }
}

impl IpcKernel {
    /// Wait until at least one entry is ready or `timeout` passes.
    ///
    /// `None` waits forever; `Some(Duration::ZERO)` never suspends. Ports
    /// must be owned by `caller` and channels held by it. The result lists
    /// only ready entries.
    pub fn poll(
        &self,
        caller: TaskId,
        entries: &[PollEntry],
        timeout: Option<Duration>,
    ) -> IpcResult<Vec<PollReady>> {
        if entries.len() > POLL_MAX {
            return Err(IpcError::InvalidArgument);
        }
        let entered = self.enter_task(caller)?;
        let me = entered.thread();
        self.stats().polls.inc();

        let mut targets: Targets<'_> = heapless::Vec::new();
        for entry in entries {
            let target = match entry.object {
                PollObject::Port(id) => Target::Port(self.owned_port(caller, id)?),
                PollObject::Channel(id) => match self.get_bound_port(caller, id) {
                    Ok(port) => Target::Channel(port),
                    Err(IpcError::PipeClosed) => Target::Hungup,
                    Err(err) => return Err(err),
                },
            };
            targets
                .push(target)
                .map_err(|_| IpcError::InvalidArgument)?;
        }

        let sched = self.scheduler();
        let deadline = timeout.and_then(|t| sched.now().checked_add(t));
        loop {
            register(&targets, me);
            let ready = collect(entries, &targets);
            if !ready.is_empty() || timeout == Some(Duration::ZERO) {
                unregister(&targets, me);
                if ready.is_empty() {
                    self.stats().poll_timeouts.inc();
                }
                return Ok(ready);
            }

            match sched.suspend(deadline) {
                WaitResult::Normal => continue,
                WaitResult::TimedOut => {
                    unregister(&targets, me);
                    let ready = collect(entries, &targets);
                    if ready.is_empty() {
                        self.stats().poll_timeouts.inc();
                    }
                    return Ok(ready);
                }
                WaitResult::Interrupted => {
                    unregister(&targets, me);
                    return Err(IpcError::Cancelled);
                }
            }
        }
    }
}
