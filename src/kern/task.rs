//! Task Management
//!
//! Based on Mach4 kern/task.h/c by Avadis Tevanian, Jr.
//!
//! The IPC layer only needs a small slice of a task: its identity, whether
//! it is still alive, and which threads belong to it (so termination can
//! cancel the ones blocked in IPC). A thread belongs to a task only while
//! it is inside an IPC entry point acting for it. Ports refer to their owner through a
//! `Weak<Task>`; once the task is reaped, the weak reference dies and the
//! port behaves as shut down.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

use super::sched_prim::Scheduler;
use crate::types::{TaskId, ThreadId};

/// A task as seen by the IPC layer
#[derive(Debug)]
pub struct Task {
    id: TaskId,
    /// Cleared once termination has started
    alive: AtomicBool,
    /// Threads attached to this task
    threads: Mutex<Vec<ThreadId>>,
}

impl Task {
    /// Create a new live task
    pub fn new() -> Self {
        Self::with_id(TaskId::new())
    }

    /// Create a task with a caller-chosen identifier
    pub fn with_id(id: TaskId) -> Self {
        Self {
            id,
            alive: AtomicBool::new(true),
            threads: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Start termination; returns true for the caller that flipped the flag
    pub fn mark_terminated(&self) -> bool {
        self.alive.swap(false, Ordering::AcqRel)
    }

    /// Attach a thread to this task. Returns false if it was already
    /// attached.
    pub fn attach_thread(&self, thread: ThreadId) -> bool {
        let mut threads = self.threads.lock();
        if threads.contains(&thread) {
            return false;
        }
        threads.push(thread);
        true
    }

    /// Detach a thread and withdraw any cancellation this task issued to
    /// it. Runs under the thread list lock, so it cannot interleave with
    /// [`cancel_threads`](Self::cancel_threads).
    pub fn detach_thread(&self, thread: ThreadId, sched: &dyn Scheduler) {
        let mut threads = self.threads.lock();
        let before = threads.len();
        threads.retain(|t| *t != thread);
        if threads.len() != before {
            sched.clear_cancel(thread);
        }
    }

    /// Cancel every attached thread; returns how many were cancelled
    pub fn cancel_threads(&self, sched: &dyn Scheduler) -> usize {
        let threads = self.threads.lock();
        for thread in threads.iter() {
            sched.cancel(*thread);
        }
        threads.len()
    }

}
