//! IPC Message - one synchronous request and its reply slot
//!
//! Based on Mach4 ipc/ipc_kmsg.h
//!
//! A message is created by the sender before a blocking send. It carries
//! the sender's identity, a send-side descriptor (the request payload) and
//! a receive-side descriptor (where the reply lands). While queued it
//! belongs to exactly one port queue; once dequeued it sits in the port's
//! processing table until the control protocol replies, forwards or
//! discards it.
//!
//! State machine:
//!
//! ```text
//! Queued -> Processing -> Replied | Discarded
//!   ^           |
//!   +-- forward-+
//! Queued | Processing -> Abandoned (sending thread cancelled)
//! ```

use alloc::vec::Vec;
use bitflags::bitflags;
use spin::Mutex;

use super::buffer::{transfer, BufferDescriptor, Direction};
use super::{IpcError, IpcResult};
use crate::types::{MessageId, PortId, TaskId, ThreadId};

// ============================================================================
// Flags and States
// ============================================================================

bitflags! {
    /// Per-message delivery flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MessageFlags: u32 {
        /// Fail with ResourceExhausted instead of waiting for queue space
        const NONBLOCK = 1 << 0;
    }
}

/// Lifecycle state of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    /// Waiting in a port queue
    Queued,
    /// Delivered to a receiver, awaiting a control command
    Processing,
    /// Reply slot filled
    Replied { code: i64, reply_len: usize },
    /// Dropped without a reply
    Discarded(IpcError),
    /// The sending thread gave up waiting
    Abandoned,
}

impl MessageState {
    /// Whether the sender can collect a result
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            MessageState::Replied { .. } | MessageState::Discarded(_)
        )
    }
}

/// What a blocking send returns once the reply slot is filled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOutcome {
    /// Return code supplied by the server (always >= 0)
    pub code: i64,
    /// Bytes written into the sender's receive buffer
    pub reply_len: usize,
}

/// What a receive hands to the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    /// Handle for later control commands
    pub message: MessageId,
    /// Task that sent the request
    pub sender: TaskId,
    /// Bytes copied into the receive buffer
    pub copied: usize,
    /// Full payload length (larger than `copied` when truncated)
    pub total: usize,
}

// ============================================================================
// Message
// ============================================================================

#[derive(Debug)]
struct MessageInner {
    state: MessageState,
    /// Port whose queue or processing table holds the message
    port: Option<PortId>,
    /// Extra payload stacked by APPEND, oldest first
    extras: Vec<BufferDescriptor>,
}

/// One in-flight IPC request
#[derive(Debug)]
pub struct Message {
    id: MessageId,
    sender: TaskId,
    sender_thread: ThreadId,
    flags: MessageFlags,
    send_buf: BufferDescriptor,
    recv_buf: BufferDescriptor,
    inner: Mutex<MessageInner>,
}

impl Message {
    pub fn new(
        sender: TaskId,
        sender_thread: ThreadId,
        flags: MessageFlags,
        send_buf: BufferDescriptor,
        recv_buf: BufferDescriptor,
    ) -> Self {
        Self {
            id: MessageId::new(),
            sender,
            sender_thread,
            flags,
            send_buf,
            recv_buf,
            inner: Mutex::new(MessageInner {
                state: MessageState::Queued,
                port: None,
                extras: Vec::new(),
            }),
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Sending task (preserved across forwards)
    pub fn sender(&self) -> TaskId {
        self.sender
    }

    /// Thread blocked on the reply slot
    pub fn sender_thread(&self) -> ThreadId {
        self.sender_thread
    }

    pub fn flags(&self) -> MessageFlags {
        self.flags
    }

    /// Request payload
    pub fn send_buf(&self) -> &BufferDescriptor {
        &self.send_buf
    }

    /// Reply area
    pub fn recv_buf(&self) -> &BufferDescriptor {
        &self.recv_buf
    }

    pub fn state(&self) -> MessageState {
        self.inner.lock().state
    }

    /// Queued -> Processing. False if the sender abandoned it.
    pub fn mark_processing(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == MessageState::Queued {
            inner.state = MessageState::Processing;
            true
        } else {
            false
        }
    }

    /// Processing -> Queued, for a forward into `port`
    pub fn requeue(&self, port: PortId) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == MessageState::Processing {
            inner.state = MessageState::Queued;
            inner.port = Some(port);
            true
        } else {
            false
        }
    }

    /// Fill the reply slot. False if the message was not in processing.
    pub fn complete(&self, code: i64, reply_len: usize) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == MessageState::Processing {
            inner.state = MessageState::Replied { code, reply_len };
            true
        } else {
            false
        }
    }

    /// Drop without a reply. False if the message already reached a final
    /// state or was abandoned.
    pub fn discard(&self, err: IpcError) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            MessageState::Queued | MessageState::Processing => {
                inner.state = MessageState::Discarded(err);
                true
            }
            _ => false,
        }
    }

    /// The sender stops waiting. Returns false when a result is already
    /// available, in which case the sender should collect it instead.
    pub fn abandon(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state.is_final() {
            return false;
        }
        inner.state = MessageState::Abandoned;
        true
    }

    /// Record the port that holds the message
    pub fn set_port(&self, port: PortId) {
        self.inner.lock().port = Some(port);
    }

    /// The port holding the message, once it has been queued
    pub fn port(&self) -> Option<PortId> {
        self.inner.lock().port
    }

    pub fn is_abandoned(&self) -> bool {
        self.inner.lock().state == MessageState::Abandoned
    }

    /// Result of the send, once the reply slot is filled
    pub fn outcome(&self) -> Option<IpcResult<SendOutcome>> {
        match self.inner.lock().state {
            MessageState::Replied { code, reply_len } => Some(Ok(SendOutcome { code, reply_len })),
            MessageState::Discarded(err) => Some(Err(err)),
            _ => None,
        }
    }

    // ========================================================================
    // Extra payload (APPEND / CUT)
    // ========================================================================

    /// Stack extra payload after the request. Only while processing.
    pub fn append(&self, extra: BufferDescriptor, max_extras: usize) -> IpcResult<()> {
        let mut inner = self.inner.lock();
        if inner.state != MessageState::Processing {
            return Err(IpcError::NotFound);
        }
        if inner.extras.len() >= max_extras {
            return Err(IpcError::ResourceExhausted);
        }
        inner.extras.push(extra);
        Ok(())
    }

    /// Remove the most recently appended extra payload
    pub fn cut(&self) -> IpcResult<BufferDescriptor> {
        let mut inner = self.inner.lock();
        if inner.state != MessageState::Processing {
            return Err(IpcError::NotFound);
        }
        inner.extras.pop().ok_or(IpcError::InvalidArgument)
    }

    pub fn extra_count(&self) -> usize {
        self.inner.lock().extras.len()
    }

    /// Request payload plus every appended extra
    pub fn payload_len(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .extras
            .iter()
            .fold(self.send_buf.len(), |acc, extra| acc.saturating_add(extra.len()))
    }

    /// Copy the payload (request then extras) into `dst`, truncating at
    /// its end. The message lock is only held to snapshot the extras.
    pub fn copy_payload(&self, dst: &BufferDescriptor) -> IpcResult<usize> {
        let extras = self.inner.lock().extras.clone();
        let mut copied = transfer(&self.send_buf, dst, 0, Direction::ToBuffer)?;
        for extra in &extras {
            if copied >= dst.len() {
                break;
            }
            copied += transfer(extra, dst, copied, Direction::ToBuffer)?;
        }
        Ok(copied)
    }
}
