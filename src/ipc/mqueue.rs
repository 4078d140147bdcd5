//! IPC Message Queue - Port message queue strategies
//!
//! Based on Mach4 ipc/ipc_mqueue.c
//!
//! Each port owns one [`MessageQueue`]. The queue is a tagged variant over
//! two strategies sharing the [`QueueOps`] interface:
//!
//! - [`BlockingQueue`]: bounded FIFO, storage reserved up front at install
//! - [`NonBlockingQueue`]: placeholder transport; every insert fails with
//!   `NotSupported`
//!
//! Queues hold no locks of their own; the owning port's lock covers them.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use super::message::Message;
use super::{IpcError, IpcResult};
use crate::types::MessageId;

/// A rejected insert hands the message back to the caller
pub type InsertError = (IpcError, Arc<Message>);

// ============================================================================
// Strategy Interface
// ============================================================================

/// Which queue implementation a port uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStrategy {
    Blocking,
    NonBlocking,
}

/// Operations every queue strategy provides
pub trait QueueOps: Sized {
    /// Allocate storage for `limit` messages
    fn init(limit: usize) -> IpcResult<Self>;

    /// Append at the tail
    fn insert(&mut self, msg: Arc<Message>) -> Result<(), InsertError>;

    /// Pop the head
    fn remove(&mut self) -> Option<Arc<Message>>;

    /// Take a specific message out of the queue
    fn remove_id(&mut self, id: MessageId) -> Option<Arc<Message>>;

    /// Drain every message (shutdown)
    fn free(&mut self) -> Vec<Arc<Message>>;

    fn len(&self) -> usize;

    fn limit(&self) -> usize;
}

// ============================================================================
// Blocking Strategy
// ============================================================================

/// Bounded FIFO of pending messages
#[derive(Debug)]
pub struct BlockingQueue {
    messages: VecDeque<Arc<Message>>,
    limit: usize,
}

impl QueueOps for BlockingQueue {
    fn init(limit: usize) -> IpcResult<Self> {
        let mut messages = VecDeque::new();
        messages
            .try_reserve_exact(limit)
            .map_err(|_| IpcError::ResourceExhausted)?;
        Ok(Self { messages, limit })
    }

    fn insert(&mut self, msg: Arc<Message>) -> Result<(), InsertError> {
        if self.messages.len() >= self.limit {
            return Err((IpcError::ResourceExhausted, msg));
        }
        self.messages.push_back(msg);
        Ok(())
    }

    fn remove(&mut self) -> Option<Arc<Message>> {
        self.messages.pop_front()
    }

    fn remove_id(&mut self, id: MessageId) -> Option<Arc<Message>> {
        let pos = self.messages.iter().position(|m| m.id() == id)?;
        self.messages.remove(pos)
    }

    fn free(&mut self) -> Vec<Arc<Message>> {
        self.messages.drain(..).collect()
    }

    fn len(&self) -> usize {
        self.messages.len()
    }

    fn limit(&self) -> usize {
        self.limit
    }
}

// ============================================================================
// Non-blocking Strategy
// ============================================================================

/// Transport without rendezvous; not implemented
#[derive(Debug)]
pub struct NonBlockingQueue {
    limit: usize,
}

impl QueueOps for NonBlockingQueue {
    fn init(limit: usize) -> IpcResult<Self> {
        Ok(Self { limit })
    }

    fn insert(&mut self, msg: Arc<Message>) -> Result<(), InsertError> {
        Err((IpcError::NotSupported, msg))
    }

    fn remove(&mut self) -> Option<Arc<Message>> {
        None
    }

    fn remove_id(&mut self, _id: MessageId) -> Option<Arc<Message>> {
        None
    }

    fn free(&mut self) -> Vec<Arc<Message>> {
        Vec::new()
    }

    fn len(&self) -> usize {
        0
    }

    fn limit(&self) -> usize {
        self.limit
    }
}

// ============================================================================
// Message Queue
// ============================================================================

/// Queue of a port, dispatched on its strategy
#[derive(Debug)]
pub enum MessageQueue {
    Blocking(BlockingQueue),
    NonBlocking(NonBlockingQueue),
}

impl MessageQueue {
    /// Allocate a queue of the given strategy
    pub fn init(strategy: QueueStrategy, limit: usize) -> IpcResult<Self> {
        Ok(match strategy {
            QueueStrategy::Blocking => MessageQueue::Blocking(BlockingQueue::init(limit)?),
            QueueStrategy::NonBlocking => {
                MessageQueue::NonBlocking(NonBlockingQueue::init(limit)?)
            }
        })
    }

    pub fn strategy(&self) -> QueueStrategy {
        match self {
            MessageQueue::Blocking(_) => QueueStrategy::Blocking,
            MessageQueue::NonBlocking(_) => QueueStrategy::NonBlocking,
        }
    }

    pub fn insert(&mut self, msg: Arc<Message>) -> Result<(), InsertError> {
        match self {
            MessageQueue::Blocking(q) => q.insert(msg),
            MessageQueue::NonBlocking(q) => q.insert(msg),
        }
    }

    pub fn remove(&mut self) -> Option<Arc<Message>> {
        match self {
            MessageQueue::Blocking(q) => q.remove(),
            MessageQueue::NonBlocking(q) => q.remove(),
        }
    }

    pub fn remove_id(&mut self, id: MessageId) -> Option<Arc<Message>> {
        match self {
            MessageQueue::Blocking(q) => q.remove_id(id),
            MessageQueue::NonBlocking(q) => q.remove_id(id),
        }
    }

    pub fn free(&mut self) -> Vec<Arc<Message>> {
        match self {
            MessageQueue::Blocking(q) => q.free(),
            MessageQueue::NonBlocking(q) => q.free(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            MessageQueue::Blocking(q) => q.len(),
            MessageQueue::NonBlocking(q) => q.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn limit(&self) -> usize {
        match self {
            MessageQueue::Blocking(q) => q.limit(),
            MessageQueue::NonBlocking(q) => q.limit(),
        }
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.limit()
    }
}
