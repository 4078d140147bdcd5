//! IPC Statistics Block
//!
//! Based on the Mach4 kern/counters.h/c counter scheme
//!
//! Counters are grouped in an [`IpcStats`] block owned by the
//! [`IpcKernel`](crate::ipc::IpcKernel) that updates them. There is no
//! global counter table: whoever constructs the kernel owns the block and
//! reads it through [`IpcStats::snapshot`].

use core::sync::atomic::{AtomicU64, Ordering};

// ============================================================================
// Counter Type
// ============================================================================

/// Named counter (atomically updated)
#[derive(Debug)]
pub struct IpcCounter {
    value: AtomicU64,
    name: &'static str,
}

impl IpcCounter {
    /// Create a new counter
    pub const fn new(name: &'static str) -> Self {
        Self {
            value: AtomicU64::new(0),
            name,
        }
    }

    /// Increment counter by 1
    #[inline]
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment counter by n
    #[inline]
    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Get current value
    #[inline]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Reset to zero
    #[inline]
    pub fn reset(&self) {
        self.value.store(0, Ordering::Relaxed);
    }

    /// Get counter name
    pub fn name(&self) -> &'static str {
        self.name
    }
}

// ============================================================================
// Statistics Block
// ============================================================================

/// Statistics for one IPC kernel instance
#[derive(Debug)]
pub struct IpcStats {
    pub sends: IpcCounter,
    pub send_blocks: IpcCounter,
    pub receives: IpcCounter,
    pub receive_blocks: IpcCounter,
    pub replies: IpcCounter,
    pub forwards: IpcCounter,
    pub appends: IpcCounter,
    pub cuts: IpcCounter,
    pub bytes_transferred: IpcCounter,
    pub ports_installed: IpcCounter,
    pub ports_shutdown: IpcCounter,
    pub channels_opened: IpcCounter,
    pub channels_released: IpcCounter,
    pub polls: IpcCounter,
    pub poll_timeouts: IpcCounter,
}

impl IpcStats {
    pub const fn new() -> Self {
        Self {
            sends: IpcCounter::new("ipc_sends"),
            send_blocks: IpcCounter::new("ipc_send_blocks"),
            receives: IpcCounter::new("ipc_receives"),
            receive_blocks: IpcCounter::new("ipc_receive_blocks"),
            replies: IpcCounter::new("ipc_replies"),
            forwards: IpcCounter::new("ipc_forwards"),
            appends: IpcCounter::new("ipc_appends"),
            cuts: IpcCounter::new("ipc_cuts"),
            bytes_transferred: IpcCounter::new("ipc_bytes_transferred"),
            ports_installed: IpcCounter::new("ipc_ports_installed"),
            ports_shutdown: IpcCounter::new("ipc_ports_shutdown"),
            channels_opened: IpcCounter::new("ipc_channels_opened"),
            channels_released: IpcCounter::new("ipc_channels_released"),
            polls: IpcCounter::new("ipc_polls"),
            poll_timeouts: IpcCounter::new("ipc_poll_timeouts"),
        }
    }

    fn all(&self) -> [&IpcCounter; 15] {
        [
            &self.sends,
            &self.send_blocks,
            &self.receives,
            &self.receive_blocks,
            &self.replies,
            &self.forwards,
            &self.appends,
            &self.cuts,
            &self.bytes_transferred,
            &self.ports_installed,
            &self.ports_shutdown,
            &self.channels_opened,
            &self.channels_released,
            &self.polls,
            &self.poll_timeouts,
        ]
    }

    /// Look a counter up by name
    pub fn by_name(&self, name: &str) -> Option<u64> {
        self.all()
            .into_iter()
            .find(|c| c.name() == name)
            .map(IpcCounter::get)
    }

    /// Reset every counter
    pub fn reset(&self) {
        for counter in self.all() {
            counter.reset();
        }
    }

    /// Copy every counter out
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sends: self.sends.get(),
            send_blocks: self.send_blocks.get(),
            receives: self.receives.get(),
            receive_blocks: self.receive_blocks.get(),
            replies: self.replies.get(),
            forwards: self.forwards.get(),
            appends: self.appends.get(),
            cuts: self.cuts.get(),
            bytes_transferred: self.bytes_transferred.get(),
            ports_installed: self.ports_installed.get(),
            ports_shutdown: self.ports_shutdown.get(),
            channels_opened: self.channels_opened.get(),
            channels_released: self.channels_released.get(),
            polls: self.polls.get(),
            poll_timeouts: self.poll_timeouts.get(),
        }
    }
}

impl Default for IpcStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`IpcStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub sends: u64,
    pub send_blocks: u64,
    pub receives: u64,
    pub receive_blocks: u64,
    pub replies: u64,
    pub forwards: u64,
    pub appends: u64,
    pub cuts: u64,
    pub bytes_transferred: u64,
    pub ports_installed: u64,
    pub ports_shutdown: u64,
    pub channels_opened: u64,
    pub channels_released: u64,
    pub polls: u64,
    pub poll_timeouts: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_operations() {
        let counter = IpcCounter::new("test_counter");
        assert_eq!(counter.get(), 0);

        counter.inc();
        assert_eq!(counter.get(), 1);

        counter.add(10);
        assert_eq!(counter.get(), 11);

        counter.reset();
        assert_eq!(counter.get(), 0);
    }

    #[test]
    fn test_snapshot_and_lookup() {
        let stats = IpcStats::new();
        stats.sends.inc();
        stats.bytes_transferred.add(4096);

        let snap = stats.snapshot();
        assert_eq!(snap.sends, 1);
        assert_eq!(snap.bytes_transferred, 4096);
        assert_eq!(stats.by_name("ipc_bytes_transferred"), Some(4096));
        assert_eq!(stats.by_name("nonexistent"), None);

        stats.reset();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }
}
