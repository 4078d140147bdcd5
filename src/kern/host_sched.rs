//! Hosted scheduler backed by std threads
//!
//! Every OS thread that enters the IPC layer is lazily given a
//! [`ThreadId`] and a parker (mutex + condvar). `wake` and `cancel` set
//! sticky bits on the parker, so a wake that races ahead of `suspend` is
//! never lost.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::sched_prim::{Scheduler, WaitResult};
use crate::types::ThreadId;

thread_local! {
    static CURRENT: Cell<Option<ThreadId>> = const { Cell::new(None) };
}

#[derive(Debug, Default)]
struct ParkState {
    pending: bool,
    cancelled: bool,
}

#[derive(Debug, Default)]
struct Parker {
    state: Mutex<ParkState>,
    cv: Condvar,
}

impl Parker {
    fn lock(&self) -> MutexGuard<'_, ParkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Scheduler for hosted builds and the test suite
#[derive(Debug)]
pub struct HostScheduler {
    epoch: Instant,
    parkers: Mutex<HashMap<ThreadId, Arc<Parker>>>,
}

impl HostScheduler {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            parkers: Mutex::new(HashMap::new()),
        }
    }

    fn parker(&self, thread: ThreadId) -> Arc<Parker> {
        self.parkers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(thread)
            .or_default()
            .clone()
    }
}

impl Default for HostScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for HostScheduler {
    fn current_thread(&self) -> ThreadId {
        CURRENT.with(|current| match current.get() {
            Some(id) => id,
            None => {
                let id = ThreadId::new();
                current.set(Some(id));
                id
            }
        })
    }

    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }

    fn suspend(&self, deadline: Option<Duration>) -> WaitResult {
        let parker = self.parker(self.current_thread());
        let mut state = parker.lock();
        loop {
            if state.cancelled {
                return WaitResult::Interrupted;
            }
            if state.pending {
                state.pending = false;
                return WaitResult::Normal;
            }
            match deadline {
                Some(deadline) => {
                    let now = self.now();
                    if now >= deadline {
                        return WaitResult::TimedOut;
                    }
                    state = parker
                        .cv
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
                None => {
                    state = parker.cv.wait(state).unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    fn wake(&self, thread: ThreadId) {
        let parker = self.parker(thread);
        parker.lock().pending = true;
        parker.cv.notify_all();
    }

    fn cancel(&self, thread: ThreadId) {
        let parker = self.parker(thread);
        parker.lock().cancelled = true;
        parker.cv.notify_all();
    }

    fn clear_cancel(&self, thread: ThreadId) {
        self.parker(thread).lock().cancelled = false;
    }
}
