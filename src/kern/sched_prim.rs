//! Scheduling Primitives - Suspend/Wake interface consumed by IPC
//!
//! Based on Mach4 kern/sched_prim.h/c
//!
//! The IPC layer never touches run queues. It asks the scheduler to
//! suspend the calling thread and to wake a specific thread, through the
//! [`Scheduler`] trait. Implementations must remember a wake that arrives
//! before the target thread suspends (the Mach `wake_pending` contract),
//! so the IPC layer can register a waiter under an object lock, drop the
//! lock, and only then suspend without losing a wakeup.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::time::Duration;

use crate::types::ThreadId;

// ============================================================================
// Wait Results
// ============================================================================

/// Result of a suspend operation (from Mach4)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum WaitResult {
    /// Thread was awakened normally
    Normal = 0,
    /// Wait deadline passed
    TimedOut = 3,
    /// Thread was cancelled (its task is terminating)
    Interrupted = 2,
}

// ============================================================================
// Scheduler Interface
// ============================================================================

/// Scheduling capability consumed by the IPC layer
pub trait Scheduler: Send + Sync {
    /// Identity of the calling thread
    fn current_thread(&self) -> ThreadId;

    /// Monotonic time since scheduler start
    fn now(&self) -> Duration;

    /// Suspend the calling thread until woken, cancelled, or `deadline`
    /// (absolute, on the [`now`](Self::now) clock) passes.
    ///
    /// A pending wake is consumed and returns [`WaitResult::Normal`]
    /// immediately. Cancellation is sticky: once a thread is cancelled,
    /// every later suspend returns [`WaitResult::Interrupted`].
    fn suspend(&self, deadline: Option<Duration>) -> WaitResult;

    /// Wake a specific thread (or leave a pending wake for it)
    fn wake(&self, thread: ThreadId);

    /// Cancel a thread: it wakes with [`WaitResult::Interrupted`]
    fn cancel(&self, thread: ThreadId);

    /// Withdraw a cancellation. Called when a thread leaves the task that
    /// cancelled it, so later calls on behalf of other tasks can block.
    fn clear_cancel(&self, thread: ThreadId);
}

// ============================================================================
// Wait List
// ============================================================================

/// FIFO of threads blocked on one condition of an IPC object
///
/// Always manipulated under the owning object's lock. Waking is split in
/// two: `pop_*` under the lock, then [`wake_all`] after it is released.
#[derive(Debug, Default)]
pub struct WaitList {
    threads: VecDeque<ThreadId>,
}

impl WaitList {
    pub const fn new() -> Self {
        Self {
            threads: VecDeque::new(),
        }
    }

    /// Register a waiter once; a thread re-registering after a spurious
    /// wakeup keeps its original position.
    pub fn enqueue(&mut self, thread: ThreadId) {
        if !self.threads.contains(&thread) {
            self.threads.push_back(thread);
        }
    }

    /// Remove a waiter (on any exit path other than being popped)
    pub fn remove(&mut self, thread: ThreadId) -> bool {
        match self.threads.iter().position(|t| *t == thread) {
            Some(pos) => {
                self.threads.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Pop the longest-waiting thread
    pub fn pop_one(&mut self) -> Option<ThreadId> {
        self.threads.pop_front()
    }

    /// Pop every waiting thread
    pub fn pop_all(&mut self) -> Vec<ThreadId> {
        self.threads.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }
}

/// Wake every thread in `threads`
pub fn wake_all(sched: &dyn Scheduler, threads: impl IntoIterator<Item = ThreadId>) {
    for thread in threads {
        sched.wake(thread);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_list_fifo() {
        let mut list = WaitList::new();
        list.enqueue(ThreadId(1));
        list.enqueue(ThreadId(2));
        list.enqueue(ThreadId(1));
        assert_eq!(list.len(), 2);

        assert_eq!(list.pop_one(), Some(ThreadId(1)));
        assert_eq!(list.pop_one(), Some(ThreadId(2)));
        assert!(list.is_empty());
    }

    #[test]
    fn test_wait_list_remove() {
        let mut list = WaitList::new();
        list.enqueue(ThreadId(1));
        list.enqueue(ThreadId(2));
        assert!(list.remove(ThreadId(1)));
        assert!(!list.remove(ThreadId(1)));
        assert_eq!(list.pop_all(), alloc::vec![ThreadId(2)]);
    }
}
