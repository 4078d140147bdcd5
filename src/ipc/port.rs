//! Port implementation - the receiving IPC endpoint
//!
//! Based on Mach4 ipc/ipc_port.h/c
//!
//! A port is owned by exactly one task, referenced weakly: when the owner
//! is reaped the port behaves as shut down. It holds a bounded queue of
//! pending messages, the table of delivered-but-unanswered messages, and
//! three wait lists (receivers, senders waiting for space, pollers).
//!
//! Locking: the port lock guards structural fields only. It is never held
//! across a suspend or a payload copy, and waiters are woken after it is
//! released. When the message lock is needed too, it nests inside.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::mem;

use bitflags::bitflags;
use spin::Mutex;

use super::buffer::BufferDescriptor;
use super::message::{Delivery, Message, MessageFlags, SendOutcome};
use super::mqueue::{InsertError, MessageQueue, QueueStrategy};
use super::{IpcError, IpcResult};
use crate::config::MAX_PORT_CAPACITY;
use crate::kern::counters::IpcStats;
use crate::kern::sched_prim::{wake_all, Scheduler, WaitList, WaitResult};
use crate::kern::task::Task;
use crate::types::{ChannelId, MessageId, PortId, TaskId, ThreadId};

bitflags! {
    /// Port mode and state bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PortFlags: u32 {
        /// Use the non-blocking transport
        const NONBLOCK = 1 << 0;
        /// No longer accepting messages or bindings
        const SHUTDOWN = 1 << 1;
    }
}

/// Snapshot of the readiness-relevant port fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortStatus {
    pub shutdown: bool,
    pub queued: usize,
    pub full: bool,
    /// At least one receiver is blocked waiting for a message
    pub receiver_waiting: bool,
    /// Pollers registered for a change
    pub pollers: usize,
}

#[derive(Debug)]
struct PortInner {
    flags: PortFlags,
    queue: MessageQueue,
    /// Delivered messages awaiting reply, forward or discard
    processing: BTreeMap<MessageId, Arc<Message>>,
    receivers: WaitList,
    senders: WaitList,
    pollers: WaitList,
    /// Channels currently bound here
    channels: BTreeSet<ChannelId>,
}

/// A receiving endpoint
#[derive(Debug)]
pub struct Port {
    id: PortId,
    owner: Weak<Task>,
    owner_id: TaskId,
    inner: Mutex<PortInner>,
}

impl Port {
    /// Create a port owned by `owner` with room for `capacity` queued
    /// messages. The queue strategy follows `PortFlags::NONBLOCK`.
    pub fn install(owner: &Arc<Task>, flags: PortFlags, capacity: usize) -> IpcResult<Arc<Self>> {
        if flags.contains(PortFlags::SHUTDOWN) || capacity == 0 || capacity > MAX_PORT_CAPACITY {
            return Err(IpcError::InvalidArgument);
        }
        let strategy = if flags.contains(PortFlags::NONBLOCK) {
            QueueStrategy::NonBlocking
        } else {
            QueueStrategy::Blocking
        };
        let queue = MessageQueue::init(strategy, capacity)?;
        let port = Arc::new(Self {
            id: PortId::new(),
            owner: Arc::downgrade(owner),
            owner_id: owner.id(),
            inner: Mutex::new(PortInner {
                flags,
                queue,
                processing: BTreeMap::new(),
                receivers: WaitList::new(),
                senders: WaitList::new(),
                pollers: WaitList::new(),
                channels: BTreeSet::new(),
            }),
        });
        log::debug!(
            "port install: {} owner={} {:?} capacity={}",
            port.id,
            port.owner_id,
            strategy,
            capacity
        );
        Ok(port)
    }

    pub fn id(&self) -> PortId {
        self.id
    }

    /// Owning task id (still reported after the task is gone)
    pub fn owner_id(&self) -> TaskId {
        self.owner_id
    }

    /// Owning task, if not yet reaped
    pub fn owner(&self) -> Option<Arc<Task>> {
        self.owner.upgrade()
    }

    pub fn flags(&self) -> PortFlags {
        self.inner.lock().flags
    }

    fn closed(&self, inner: &PortInner) -> bool {
        inner.flags.contains(PortFlags::SHUTDOWN) || self.owner.strong_count() == 0
    }

    pub fn is_shutdown(&self) -> bool {
        self.closed(&self.inner.lock())
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().queue.limit()
    }

    /// Messages waiting in the queue
    pub fn queued(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Messages delivered but not yet answered
    pub fn processing_count(&self) -> usize {
        self.inner.lock().processing.len()
    }

    pub fn status(&self) -> PortStatus {
        let inner = self.inner.lock();
        PortStatus {
            shutdown: self.closed(&inner),
            queued: inner.queue.len(),
            full: inner.queue.is_full(),
            receiver_waiting: !inner.receivers.is_empty(),
            pollers: inner.pollers.len(),
        }
    }

    // ========================================================================
    // Channel bindings
    // ========================================================================

    /// Record a channel binding; refused once shut down
    pub fn bind(&self, channel: ChannelId) -> IpcResult<()> {
        let mut inner = self.inner.lock();
        if self.closed(&inner) {
            return Err(IpcError::PipeClosed);
        }
        inner.channels.insert(channel);
        Ok(())
    }

    pub fn unbind(&self, channel: ChannelId) -> bool {
        self.inner.lock().channels.remove(&channel)
    }

    pub fn is_bound(&self, channel: ChannelId) -> bool {
        self.inner.lock().channels.contains(&channel)
    }

    pub fn bound_count(&self) -> usize {
        self.inner.lock().channels.len()
    }

    // ========================================================================
    // Send
    // ========================================================================

    /// Enqueue `msg` and block until its reply slot is filled.
    ///
    /// A full queue suspends the sender until a receiver makes room, unless
    /// the message is `NONBLOCK`. Shutdown wakes the sender with
    /// `PipeClosed`; task termination wakes it with `Cancelled`.
    pub fn send(
        &self,
        sched: &dyn Scheduler,
        stats: &IpcStats,
        msg: Arc<Message>,
    ) -> IpcResult<SendOutcome> {
        let me = msg.sender_thread();
        self.enqueue_blocking(sched, stats, &msg, me)?;
        log::trace!("port send: {} queued on {}", msg.id(), self.id);

        loop {
            if let Some(outcome) = msg.outcome() {
                return outcome;
            }
            if sched.suspend(None) == WaitResult::Interrupted {
                if !msg.abandon() {
                    // The reply raced ahead of the cancellation
                    if let Some(outcome) = msg.outcome() {
                        return outcome;
                    }
                }
                // A forwarded message is reaped by whoever resolves its holder
                if msg.port() == Some(self.id) {
                    self.reap(sched, msg.id());
                }
                log::trace!("port send: {} abandoned", msg.id());
                return Err(IpcError::Cancelled);
            }
        }
    }

    fn enqueue_blocking(
        &self,
        sched: &dyn Scheduler,
        stats: &IpcStats,
        msg: &Arc<Message>,
        me: ThreadId,
    ) -> IpcResult<()> {
        loop {
            let mut inner = self.inner.lock();
            if self.closed(&inner) {
                inner.senders.remove(me);
                return Err(IpcError::PipeClosed);
            }
            if inner.queue.strategy() == QueueStrategy::NonBlocking {
                return Err(IpcError::NotSupported);
            }
            if !inner.queue.is_full() {
                inner.senders.remove(me);
                msg.set_port(self.id);
                let wake = Self::insert_locked(&mut inner, msg.clone()).map_err(|(err, _)| err)?;
                drop(inner);
                wake_all(sched, wake);
                return Ok(());
            }
            if msg.flags().contains(MessageFlags::NONBLOCK) {
                return Err(IpcError::ResourceExhausted);
            }
            inner.senders.enqueue(me);
            drop(inner);

            stats.send_blocks.inc();
            if sched.suspend(None) == WaitResult::Interrupted {
                let mut inner = self.inner.lock();
                inner.senders.remove(me);
                let next = if inner.queue.is_full() {
                    None
                } else {
                    inner.senders.pop_one()
                };
                drop(inner);
                wake_all(sched, next);
                return Err(IpcError::Cancelled);
            }
        }
    }

    /// Insert under the lock; returns the threads to wake afterwards
    fn insert_locked(
        inner: &mut PortInner,
        msg: Arc<Message>,
    ) -> Result<Vec<ThreadId>, InsertError> {
        inner.queue.insert(msg)?;
        let mut wake = inner.pollers.pop_all();
        wake.extend(inner.receivers.pop_one());
        Ok(wake)
    }

    /// Requeue a processing message taken from another port (FORWARD).
    ///
    /// Never blocks: a full target fails with `ResourceExhausted`, a shut
    /// down one with `PipeClosed`. On failure the message is handed back
    /// still in processing state.
    pub fn forward_in(&self, sched: &dyn Scheduler, msg: Arc<Message>) -> Result<(), InsertError> {
        let mut inner = self.inner.lock();
        if self.closed(&inner) {
            return Err((IpcError::PipeClosed, msg));
        }
        if inner.queue.strategy() == QueueStrategy::NonBlocking {
            return Err((IpcError::NotSupported, msg));
        }
        if inner.queue.is_full() {
            return Err((IpcError::ResourceExhausted, msg));
        }
        if !msg.requeue(self.id) {
            return Err((IpcError::NotFound, msg));
        }
        match Self::insert_locked(&mut inner, msg) {
            Ok(wake) => {
                drop(inner);
                wake_all(sched, wake);
                Ok(())
            }
            Err((err, msg)) => {
                msg.mark_processing();
                Err((err, msg))
            }
        }
    }

    // ========================================================================
    // Receive
    // ========================================================================

    /// Dequeue the head message, suspending while the queue is empty, and
    /// copy its payload into `buffer` outside the port lock.
    pub fn receive(
        &self,
        sched: &dyn Scheduler,
        stats: &IpcStats,
        buffer: &BufferDescriptor,
    ) -> IpcResult<(Arc<Message>, Delivery)> {
        let msg = self.dequeue(sched, stats)?;

        let copied = match msg.copy_payload(buffer) {
            Ok(n) => n,
            Err(err) => {
                self.inner.lock().processing.remove(&msg.id());
                if msg.discard(err) {
                    sched.wake(msg.sender_thread());
                }
                return Err(err);
            }
        };
        stats.bytes_transferred.add(copied as u64);

        let delivery = Delivery {
            message: msg.id(),
            sender: msg.sender(),
            copied,
            total: msg.payload_len(),
        };
        log::trace!(
            "port receive: {} from {} on {} ({}/{} bytes)",
            delivery.message,
            delivery.sender,
            self.id,
            copied,
            delivery.total
        );
        Ok((msg, delivery))
    }

    fn dequeue(&self, sched: &dyn Scheduler, stats: &IpcStats) -> IpcResult<Arc<Message>> {
        let me = sched.current_thread();
        loop {
            let mut inner = self.inner.lock();
            if self.closed(&inner) {
                inner.receivers.remove(me);
                return Err(IpcError::PipeClosed);
            }
            if inner.queue.strategy() == QueueStrategy::NonBlocking {
                return Err(IpcError::NotSupported);
            }
            if let Some(msg) = Self::pop_live(&mut inner) {
                inner.receivers.remove(me);
                inner.processing.insert(msg.id(), msg.clone());
                let sender = inner.senders.pop_one();
                drop(inner);
                wake_all(sched, sender);
                return Ok(msg);
            }
            // A waiting receiver makes bound channels writable
            inner.receivers.enqueue(me);
            let pollers = inner.pollers.pop_all();
            drop(inner);
            wake_all(sched, pollers);

            stats.receive_blocks.inc();
            if sched.suspend(None) == WaitResult::Interrupted {
                let mut inner = self.inner.lock();
                inner.receivers.remove(me);
                let next = if inner.queue.is_empty() {
                    None
                } else {
                    inner.receivers.pop_one()
                };
                drop(inner);
                wake_all(sched, next);
                return Err(IpcError::Cancelled);
            }
        }
    }

    /// Pop the first message whose sender is still waiting
    fn pop_live(inner: &mut PortInner) -> Option<Arc<Message>> {
        while let Some(msg) = inner.queue.remove() {
            if msg.mark_processing() {
                return Some(msg);
            }
            log::trace!("port receive: skipping abandoned {}", msg.id());
        }
        None
    }

    // ========================================================================
    // Processing table
    // ========================================================================

    /// Take a delivered message out of the processing table
    pub fn take_processing(&self, id: MessageId) -> Option<Arc<Message>> {
        self.inner.lock().processing.remove(&id)
    }

    /// Put back a message taken with [`take_processing`](Self::take_processing).
    /// A message abandoned in the meantime is dropped instead.
    pub fn restore_processing(&self, msg: Arc<Message>) {
        let mut inner = self.inner.lock();
        if self.closed(&inner) {
            drop(inner);
            msg.discard(IpcError::PipeClosed);
            return;
        }
        if msg.is_abandoned() {
            return;
        }
        msg.set_port(self.id);
        inner.processing.insert(msg.id(), msg);
    }

    /// Remove an abandoned message from the queue or the processing table.
    /// Freeing a queue slot wakes one blocked sender.
    pub fn reap(&self, sched: &dyn Scheduler, id: MessageId) -> bool {
        let mut inner = self.inner.lock();
        if inner.queue.remove_id(id).is_some() {
            let next = inner.senders.pop_one();
            drop(inner);
            wake_all(sched, next);
            return true;
        }
        inner.processing.remove(&id).is_some()
    }

    /// Look up a delivered message without removing it
    pub fn processing(&self, id: MessageId) -> Option<Arc<Message>> {
        self.inner.lock().processing.get(&id).cloned()
    }

    // ========================================================================
    // Poll registration
    // ========================================================================

    pub fn register_poller(&self, thread: ThreadId) {
        self.inner.lock().pollers.enqueue(thread);
    }

    pub fn unregister_poller(&self, thread: ThreadId) {
        self.inner.lock().pollers.remove(thread);
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Stop accepting messages. Every queued or processing message is
    /// discarded with `PipeClosed` and its sender woken; every blocked
    /// receiver, sender and poller is woken. Returns false if the port was
    /// already shut down.
    pub fn shutdown(&self, sched: &dyn Scheduler) -> bool {
        let mut inner = self.inner.lock();
        if inner.flags.contains(PortFlags::SHUTDOWN) {
            return false;
        }
        inner.flags.insert(PortFlags::SHUTDOWN);

        let mut dropped = inner.queue.free();
        dropped.extend(mem::take(&mut inner.processing).into_values());
        let mut wake = inner.receivers.pop_all();
        wake.extend(inner.senders.pop_all());
        wake.extend(inner.pollers.pop_all());
        drop(inner);

        for msg in &dropped {
            if msg.discard(IpcError::PipeClosed) {
                wake.push(msg.sender_thread());
            }
        }
        log::debug!(
            "port shutdown: {} discarded={} woken={}",
            self.id,
            dropped.len(),
            wake.len()
        );
        wake_all(sched, wake);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::host_sched::HostScheduler;

    fn message(sender: &Arc<Task>, thread: ThreadId, flags: MessageFlags) -> Arc<Message> {
        Arc::new(Message::new(
            sender.id(),
            thread,
            flags,
            BufferDescriptor::empty(),
            BufferDescriptor::empty(),
        ))
    }

    #[test]
    fn test_install_validates() {
        let owner = Arc::new(Task::new());
        assert_eq!(
            Port::install(&owner, PortFlags::empty(), 0).err(),
            Some(IpcError::InvalidArgument)
        );
        assert_eq!(
            Port::install(&owner, PortFlags::SHUTDOWN, 4).err(),
            Some(IpcError::InvalidArgument)
        );
        assert_eq!(
            Port::install(&owner, PortFlags::empty(), MAX_PORT_CAPACITY + 1).err(),
            Some(IpcError::InvalidArgument)
        );
        let port = Port::install(&owner, PortFlags::empty(), 4).unwrap();
        assert_eq!(port.capacity(), 4);
        assert_eq!(port.owner_id(), owner.id());
        assert!(!port.is_shutdown());
    }

    #[test]
    fn test_dead_owner_means_shutdown() {
        let owner = Arc::new(Task::new());
        let port = Port::install(&owner, PortFlags::empty(), 4).unwrap();
        drop(owner);
        assert!(port.is_shutdown());
        assert_eq!(port.bind(ChannelId(1)), Err(IpcError::PipeClosed));
    }

    #[test]
    fn test_non_blocking_port_is_unsupported() {
        let sched = HostScheduler::new();
        let stats = IpcStats::new();
        let owner = Arc::new(Task::new());
        let port = Port::install(&owner, PortFlags::NONBLOCK, 4).unwrap();
        let msg = message(&owner, sched.current_thread(), MessageFlags::empty());

        assert_eq!(
            port.send(&sched, &stats, msg).err(),
            Some(IpcError::NotSupported)
        );
        assert_eq!(
            port.receive(&sched, &stats, &BufferDescriptor::empty()).err(),
            Some(IpcError::NotSupported)
        );
    }

    #[test]
    fn test_full_queue_with_nonblock_message() {
        let sched = HostScheduler::new();
        let stats = IpcStats::new();
        let owner = Arc::new(Task::new());
        let port = Port::install(&owner, PortFlags::empty(), 1).unwrap();

        let first = message(&owner, ThreadId(100), MessageFlags::empty());
        let (err, first) = port.forward_in(&sched, first).unwrap_err();
        assert_eq!(err, IpcError::NotFound);
        assert!(first.mark_processing());
        port.forward_in(&sched, first).unwrap();
        assert_eq!(port.queued(), 1);

        let second = message(&owner, sched.current_thread(), MessageFlags::NONBLOCK);
        assert_eq!(
            port.send(&sched, &stats, second).err(),
            Some(IpcError::ResourceExhausted)
        );
    }

    #[test]
    fn test_rendezvous_and_reply() {
        let sched = HostScheduler::new();
        let stats = IpcStats::new();
        let server = Arc::new(Task::new());
        let client = Arc::new(Task::new());
        let port = Port::install(&server, PortFlags::empty(), 1).unwrap();

        std::thread::scope(|s| {
            let sender = s.spawn(|| {
                let msg = message(&client, sched.current_thread(), MessageFlags::empty());
                port.send(&sched, &stats, msg)
            });

            let (msg, delivery) = port
                .receive(&sched, &stats, &BufferDescriptor::empty())
                .unwrap();
            assert_eq!(delivery.sender, client.id());
            assert_eq!(port.processing_count(), 1);

            let taken = port.take_processing(msg.id()).unwrap();
            assert!(taken.complete(7, 0));
            sched.wake(taken.sender_thread());

            let outcome = sender.join().unwrap().unwrap();
            assert_eq!(outcome.code, 7);
        });
    }

    #[test]
    fn test_shutdown_discards_and_wakes() {
        let sched = HostScheduler::new();
        let stats = IpcStats::new();
        let server = Arc::new(Task::new());
        let client = Arc::new(Task::new());
        let port = Port::install(&server, PortFlags::empty(), 4).unwrap();

        std::thread::scope(|s| {
            let sender = s.spawn(|| {
                let msg = message(&client, sched.current_thread(), MessageFlags::empty());
                port.send(&sched, &stats, msg)
            });
            while port.queued() == 0 {
                std::thread::yield_now();
            }
            assert!(port.shutdown(&sched));
            assert!(!port.shutdown(&sched));
            assert_eq!(sender.join().unwrap(), Err(IpcError::PipeClosed));
        });

        assert!(port.is_shutdown());
        assert_eq!(port.queued(), 0);
        assert_eq!(
            port.receive(&sched, &stats, &BufferDescriptor::empty()).err(),
            Some(IpcError::PipeClosed)
        );
    }

    #[test]
    fn test_shutdown_wakes_blocked_receiver() {
        let sched = HostScheduler::new();
        let stats = IpcStats::new();
        let server = Arc::new(Task::new());
        let port = Port::install(&server, PortFlags::empty(), 4).unwrap();

        std::thread::scope(|s| {
            let receiver =
                s.spawn(|| port.receive(&sched, &stats, &BufferDescriptor::empty()).err());
            while !port.status().receiver_waiting {
                std::thread::yield_now();
            }
            port.shutdown(&sched);
            assert_eq!(receiver.join().unwrap(), Some(IpcError::PipeClosed));
        });
    }

    #[test]
    fn test_cancelled_sender_abandons_message() {
        let sched = HostScheduler::new();
        let stats = IpcStats::new();
        let server = Arc::new(Task::new());
        let client = Arc::new(Task::new());
        let port = Port::install(&server, PortFlags::empty(), 4).unwrap();

        std::thread::scope(|s| {
            let (tx, rx) = std::sync::mpsc::channel();
            let sender = s.spawn(|| {
                let tx = tx;
                tx.send(sched.current_thread()).unwrap();
                let msg = message(&client, sched.current_thread(), MessageFlags::empty());
                port.send(&sched, &stats, msg)
            });
            let thread = rx.recv().unwrap();
            while port.queued() == 0 {
                std::thread::yield_now();
            }
            sched.cancel(thread);
            assert_eq!(sender.join().unwrap(), Err(IpcError::Cancelled));
        });
        assert_eq!(port.queued(), 0);
    }
}
