//! Hosted IPC world shared by the integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use mach_r_ipc::ipc::{ChannelFlags, IoVec, PortFlags};
use mach_r_ipc::kern::HostScheduler;
use mach_r_ipc::vm::{SimMemory, PAGE_SIZE};
use mach_r_ipc::{ChannelId, IpcConfig, IpcKernel, PortId, TaskId};

/// Server task owning a port, client task holding a channel to it
#[derive(Debug, Clone, Copy)]
pub struct Pair {
    pub server: TaskId,
    pub client: TaskId,
    pub port: PortId,
    pub channel: ChannelId,
}

pub struct World {
    pub kernel: IpcKernel,
    pub memory: Arc<SimMemory>,
    next_va: AtomicUsize,
}

impl World {
    pub fn new() -> Self {
        Self::with_config(IpcConfig::default())
    }

    pub fn with_config(config: IpcConfig) -> Self {
        let memory = Arc::new(SimMemory::new());
        let kernel = IpcKernel::new(config, Arc::new(HostScheduler::new()), memory.clone())
            .expect("valid config");
        Self {
            kernel,
            memory,
            next_va: AtomicUsize::new(0x4000_0000),
        }
    }

    pub fn pair(&self, capacity: usize) -> Pair {
        let server = self.kernel.task_create();
        let client = self.kernel.task_create();
        let port = self
            .kernel
            .install_port(server, PortFlags::empty(), Some(capacity))
            .expect("install");
        let channel = self
            .kernel
            .open_channel(client, server, port, ChannelFlags::SYNC)
            .expect("open");
        Pair {
            server,
            client,
            port,
            channel,
        }
    }

    /// Reserve `pages` pages of fresh, writable address space in `task`
    pub fn region(&self, task: TaskId, pages: usize) -> usize {
        let base = self
            .next_va
            .fetch_add((pages + 1) * PAGE_SIZE, Ordering::Relaxed);
        self.memory
            .map(task, base, pages * PAGE_SIZE, true)
            .expect("map");
        base
    }

    pub fn scratch(&self, task: TaskId, len: usize) -> IoVec {
        let base = self.region(task, len.div_ceil(PAGE_SIZE).max(1));
        IoVec::new(base, len)
    }

    pub fn buffer(&self, task: TaskId, bytes: &[u8]) -> IoVec {
        let iov = self.scratch(task, bytes.len());
        self.memory
            .write_bytes(task, iov.base, bytes)
            .expect("write");
        iov
    }

    pub fn read(&self, task: TaskId, iov: IoVec, len: usize) -> Vec<u8> {
        self.memory.read_bytes(task, iov.base, len).expect("read")
    }

    /// Spin until `port` has `n` queued messages
    pub fn wait_queued(&self, port: PortId, n: usize) {
        let port = self.kernel.port(port).expect("port");
        while port.queued() < n {
            std::thread::yield_now();
        }
    }
}
