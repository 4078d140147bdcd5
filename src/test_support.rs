//! Shared fixtures for unit tests

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::config::IpcConfig;
use crate::ipc::{ChannelFlags, IoVec, IpcKernel, PortFlags};
use crate::kern::host_sched::HostScheduler;
use crate::types::{ChannelId, PortId, TaskId};
use crate::vm::{SimMemory, PAGE_SIZE};

/// Server task with one port, client task with one channel bound to it
#[derive(Debug, Clone, Copy)]
pub struct Pair {
    pub server: TaskId,
    pub client: TaskId,
    pub port: PortId,
    pub channel: ChannelId,
}

pub struct Fixture {
    pub kernel: IpcKernel,
    pub memory: Arc<SimMemory>,
    pub sched: Arc<HostScheduler>,
    next_va: AtomicUsize,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(IpcConfig::default())
    }

    pub fn with_config(config: IpcConfig) -> Self {
        let memory = Arc::new(SimMemory::new());
        let sched = Arc::new(HostScheduler::new());
        let kernel = IpcKernel::new(config, sched.clone(), memory.clone()).unwrap();
        Self {
            kernel,
            memory,
            sched,
            next_va: AtomicUsize::new(0x1000_0000),
        }
    }

    pub fn pair(&self, capacity: usize) -> Pair {
        let server = self.kernel.task_create();
        let client = self.kernel.task_create();
        let port = self
            .kernel
            .install_port(server, PortFlags::empty(), Some(capacity))
            .unwrap();
        let channel = self
            .kernel
            .open_channel(client, server, port, ChannelFlags::SYNC)
            .unwrap();
        Pair {
            server,
            client,
            port,
            channel,
        }
    }

    /// Map a fresh writable region of `len` bytes in `task`
    pub fn scratch(&self, task: TaskId, len: usize) -> IoVec {
        let span = len.div_ceil(PAGE_SIZE).max(1) * PAGE_SIZE;
        let base = self.next_va.fetch_add(span + PAGE_SIZE, Ordering::Relaxed);
        self.memory.map(task, base, span, true).unwrap();
        IoVec::new(base, len)
    }

    /// Map a fresh region in `task` holding `bytes`
    pub fn buffer(&self, task: TaskId, bytes: &[u8]) -> IoVec {
        let iov = self.scratch(task, bytes.len());
        self.memory.write_bytes(task, iov.base, bytes).unwrap();
        iov
    }

    /// First `len` bytes of `iov` as `task` sees them
    pub fn read(&self, task: TaskId, iov: IoVec, len: usize) -> Vec<u8> {
        self.memory.read_bytes(task, iov.base, len).unwrap()
    }
}
