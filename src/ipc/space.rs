//! IPC Kernel - task, port and channel tables
//!
//! Based on Mach4 ipc/ipc_space.h and ipc/ipc_init.c
//!
//! [`IpcKernel`] is the explicitly constructed process-wide state of the
//! IPC layer: the task, port and channel tables, the statistics block, the
//! configured limits, and the scheduling and memory collaborators. Nothing
//! is reached through globals; whoever builds the kernel owns it and tears
//! it down with [`IpcKernel::shutdown_all`].
//!
//! The port control protocol and poll add their entry points to this type
//! from `port_ctl.rs` and `poll.rs`.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::Deref;
use spin::Mutex;

use super::buffer::{BufferDescriptor, IoVec, Side};
use super::channel::{Channel, ChannelCmd, ChannelFlags};
use super::message::{Delivery, Message, MessageFlags, SendOutcome};
use super::port::{Port, PortFlags};
use super::{IpcError, IpcResult};
use crate::config::IpcConfig;
use crate::kern::counters::IpcStats;
use crate::kern::sched_prim::Scheduler;
use crate::kern::task::Task;
use crate::types::{ChannelId, MessageId, PortId, TaskId, ThreadId};
use crate::vm::UserMemory;

// ============================================================================
// Bound Port Reference
// ============================================================================

/// A channel's bound port, pinned for the caller's use.
///
/// Holding a `PortRef` pins the channel without adding a handle, so the
/// channel cannot be detached and the port cannot be freed even if every
/// handle is closed or the owning task exits concurrently. Dropping it
/// releases the pin.
pub struct PortRef<'k> {
    kernel: &'k IpcKernel,
    channel: Arc<Channel>,
    port: Arc<Port>,
}

impl PortRef<'_> {
    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub fn port(&self) -> &Arc<Port> {
        &self.port
    }
}

impl Deref for PortRef<'_> {
    type Target = Port;

    fn deref(&self) -> &Port {
        &self.port
    }
}

impl Drop for PortRef<'_> {
    fn drop(&mut self) {
        self.kernel.release_channel(&self.channel);
    }
}

impl core::fmt::Debug for PortRef<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PortRef")
            .field("channel", &self.channel.id())
            .field("port", &self.port.id())
            .finish()
    }
}

// ============================================================================
// Task Entry
// ============================================================================

/// The calling thread acting for a task.
///
/// While the entry lives, terminating the task cancels the thread. Dropping
/// it detaches the thread and withdraws any cancellation the task issued.
pub struct TaskEntry<'k> {
    kernel: &'k IpcKernel,
    task: Arc<Task>,
    thread: ThreadId,
    attached: bool,
}

impl TaskEntry<'_> {
    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    pub fn task_id(&self) -> TaskId {
        self.task.id()
    }
}

impl Drop for TaskEntry<'_> {
    fn drop(&mut self) {
        // A nested entry for the same task leaves detaching to the outer one
        if self.attached {
            self.task.detach_thread(self.thread, &*self.kernel.sched);
        }
    }
}

impl core::fmt::Debug for TaskEntry<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TaskEntry")
            .field("task", &self.task.id())
            .field("thread", &self.thread)
            .finish()
    }
}

// ============================================================================
// IPC Kernel
// ============================================================================

/// Process-wide IPC state
pub struct IpcKernel {
    config: IpcConfig,
    sched: Arc<dyn Scheduler>,
    memory: Arc<dyn UserMemory>,
    tasks: Mutex<BTreeMap<TaskId, Arc<Task>>>,
    ports: Mutex<BTreeMap<PortId, Arc<Port>>>,
    channels: Mutex<BTreeMap<ChannelId, Arc<Channel>>>,
    stats: IpcStats,
}

impl IpcKernel {
    /// Build the IPC layer around its collaborators
    pub fn new(
        config: IpcConfig,
        sched: Arc<dyn Scheduler>,
        memory: Arc<dyn UserMemory>,
    ) -> IpcResult<Self> {
        config.validate()?;
        log::debug!("ipc init: {:?}", config);
        Ok(Self {
            config,
            sched,
            memory,
            tasks: Mutex::new(BTreeMap::new()),
            ports: Mutex::new(BTreeMap::new()),
            channels: Mutex::new(BTreeMap::new()),
            stats: IpcStats::new(),
        })
    }

    pub fn config(&self) -> &IpcConfig {
        &self.config
    }

    pub fn stats(&self) -> &IpcStats {
        &self.stats
    }

    pub fn scheduler(&self) -> &dyn Scheduler {
        &*self.sched
    }

    pub fn memory(&self) -> &dyn UserMemory {
        &*self.memory
    }

    // ========================================================================
    // Tasks
    // ========================================================================

    /// Register a new live task
    pub fn task_create(&self) -> TaskId {
        let task = Arc::new(Task::new());
        let id = task.id();
        self.tasks.lock().insert(id, task);
        id
    }

    /// Look up a live task
    pub fn task(&self, id: TaskId) -> IpcResult<Arc<Task>> {
        match self.tasks.lock().get(&id) {
            Some(task) if task.is_alive() => Ok(task.clone()),
            _ => Err(IpcError::InvalidArgument),
        }
    }

    /// Attach the calling thread to `task` for the life of the returned
    /// entry, so termination can cancel it while it blocks.
    pub fn enter_task(&self, task: TaskId) -> IpcResult<TaskEntry<'_>> {
        let task = self.task(task)?;
        let thread = self.sched.current_thread();
        let attached = task.attach_thread(thread);
        Ok(TaskEntry {
            kernel: self,
            task,
            thread,
            attached,
        })
    }

    /// Terminate a task: cancel its threads, shut down its ports, drop its
    /// channels and reap it. Once reaped the id is unknown (InvalidArgument).
    pub fn terminate_task(&self, id: TaskId) -> IpcResult<()> {
        let task = self
            .tasks
            .lock()
            .get(&id)
            .cloned()
            .ok_or(IpcError::InvalidArgument)?;
        if !task.mark_terminated() {
            return Ok(());
        }

        let cancelled = task.cancel_threads(&*self.sched);

        let ports: Vec<_> = {
            let mut table = self.ports.lock();
            let owned: Vec<PortId> = table
                .values()
                .filter(|p| p.owner_id() == id)
                .map(|p| p.id())
                .collect();
            owned.iter().filter_map(|pid| table.remove(pid)).collect()
        };
        for port in &ports {
            if port.shutdown(&*self.sched) {
                self.stats.ports_shutdown.inc();
            }
        }

        let channels: Vec<_> = {
            let mut table = self.channels.lock();
            let owned: Vec<ChannelId> = table
                .values()
                .filter(|c| c.owner() == id)
                .map(|c| c.id())
                .collect();
            owned.iter().filter_map(|cid| table.remove(cid)).collect()
        };
        // Transient PortRef holders still release their own reference;
        // the handle references die with the task.
        for channel in &channels {
            channel.detach();
            self.stats.channels_released.inc();
        }

        self.tasks.lock().remove(&id);
        log::debug!(
            "task terminate: {} cancelled={} ports={} channels={}",
            id,
            cancelled,
            ports.len(),
            channels.len()
        );
        Ok(())
    }

    /// Teardown: shut down every port and drop every channel
    pub fn shutdown_all(&self) {
        let ports: Vec<_> = core::mem::take(&mut *self.ports.lock()).into_values().collect();
        for port in &ports {
            if port.shutdown(&*self.sched) {
                self.stats.ports_shutdown.inc();
            }
        }
        let channels: Vec<_> = core::mem::take(&mut *self.channels.lock())
            .into_values()
            .collect();
        for channel in &channels {
            channel.detach();
            self.stats.channels_released.inc();
        }
        log::debug!(
            "ipc shutdown: ports={} channels={}",
            ports.len(),
            channels.len()
        );
    }

    // ========================================================================
    // Ports
    // ========================================================================

    /// Install a receiving port owned by `owner`. `capacity` defaults to
    /// the configured port capacity.
    pub fn install_port(
        &self,
        owner: TaskId,
        flags: PortFlags,
        capacity: Option<usize>,
    ) -> IpcResult<PortId> {
        let task = self.task(owner)?;
        let mut ports = self.ports.lock();
        let owned = ports.values().filter(|p| p.owner_id() == owner).count();
        if owned >= self.config.max_ports_per_task {
            return Err(IpcError::ResourceExhausted);
        }
        let port = Port::install(&task, flags, capacity.unwrap_or(self.config.port_capacity))?;
        let id = port.id();
        ports.insert(id, port);
        self.stats.ports_installed.inc();
        Ok(id)
    }

    /// Look up a port by id
    pub fn port(&self, id: PortId) -> IpcResult<Arc<Port>> {
        self.ports.lock().get(&id).cloned().ok_or(IpcError::NotFound)
    }

    /// Look up a port that `owner` owns
    pub fn owned_port(&self, owner: TaskId, id: PortId) -> IpcResult<Arc<Port>> {
        let port = self.port(id)?;
        if port.owner_id() != owner {
            return Err(IpcError::NotFound);
        }
        Ok(port)
    }

    /// Every port `owner` owns
    pub(crate) fn ports_owned_by(&self, owner: TaskId) -> Vec<Arc<Port>> {
        self.ports
            .lock()
            .values()
            .filter(|p| p.owner_id() == owner)
            .cloned()
            .collect()
    }

    /// Shut down and remove a port
    pub fn close_port(&self, owner: TaskId, id: PortId) -> IpcResult<()> {
        let port = self.owned_port(owner, id)?;
        self.ports.lock().remove(&id);
        if port.shutdown(&*self.sched) {
            self.stats.ports_shutdown.inc();
        }
        Ok(())
    }

    // ========================================================================
    // Channels
    // ========================================================================

    fn check_channel_flags(flags: ChannelFlags) -> IpcResult<()> {
        if ChannelFlags::from_bits(flags.bits()).is_none() {
            return Err(IpcError::InvalidArgument);
        }
        Ok(())
    }

    /// A live port owned by `server`, or `NotFound`
    fn server_port(&self, server: TaskId, port_id: PortId) -> IpcResult<Arc<Port>> {
        let port = self.owned_port(server, port_id)?;
        if port.is_shutdown() {
            return Err(IpcError::NotFound);
        }
        Ok(port)
    }

    fn insert_channel(&self, channel: Arc<Channel>) -> IpcResult<ChannelId> {
        let mut table = self.channels.lock();
        let owned = table.values().filter(|c| c.owner() == channel.owner()).count();
        if owned >= self.config.max_channels_per_task {
            return Err(IpcError::ResourceExhausted);
        }
        let id = channel.id();
        table.insert(id, channel);
        self.stats.channels_opened.inc();
        Ok(id)
    }

    /// Create an unbound channel
    pub fn create_channel(&self, owner: TaskId, flags: ChannelFlags) -> IpcResult<ChannelId> {
        Self::check_channel_flags(flags)?;
        self.task(owner)?;
        let id = self.insert_channel(Arc::new(Channel::new(owner, flags)))?;
        log::debug!("channel create: {} owner={}", id, owner);
        Ok(id)
    }

    /// Open a channel bound to `server`'s port `port_id`
    pub fn open_channel(
        &self,
        owner: TaskId,
        server: TaskId,
        port_id: PortId,
        flags: ChannelFlags,
    ) -> IpcResult<ChannelId> {
        Self::check_channel_flags(flags)?;
        self.task(owner)?;
        let port = self.server_port(server, port_id)?;

        let channel = Arc::new(Channel::new(owner, flags));
        channel.bind(port).map_err(|err| match err {
            IpcError::PipeClosed => IpcError::NotFound,
            other => other,
        })?;
        let id = self.insert_channel(channel.clone()).inspect_err(|_| {
            channel.detach();
        })?;
        log::debug!("channel open: {} owner={} -> {}", id, owner, port_id);
        Ok(id)
    }

    /// Bind a channel created with [`create_channel`](Self::create_channel)
    pub fn bind_channel(
        &self,
        owner: TaskId,
        id: ChannelId,
        server: TaskId,
        port_id: PortId,
    ) -> IpcResult<()> {
        let channel = self.channel(owner, id)?;
        let port = self.server_port(server, port_id)?;
        channel.bind(port)
    }

    /// Look up a channel that `owner` holds
    pub fn channel(&self, owner: TaskId, id: ChannelId) -> IpcResult<Arc<Channel>> {
        match self.channels.lock().get(&id) {
            Some(channel) if channel.owner() == owner => Ok(channel.clone()),
            _ => Err(IpcError::InvalidArgument),
        }
    }

    /// Add a handle to a channel; the clone aliases the same id
    pub fn clone_channel(&self, owner: TaskId, id: ChannelId) -> IpcResult<ChannelId> {
        let channel = self.channel(owner, id)?;
        if !channel.try_acquire() {
            return Err(IpcError::InvalidArgument);
        }
        if !channel.try_add_handle() {
            self.release_channel(&channel);
            return Err(IpcError::InvalidArgument);
        }
        Ok(id)
    }

    /// Close one handle. The last handle removes the id from the table;
    /// the channel is detached once in-flight operations have let go.
    pub fn close_channel(&self, owner: TaskId, id: ChannelId) -> IpcResult<()> {
        let channel = self.channel(owner, id)?;
        let left = channel.drop_handle().ok_or(IpcError::InvalidArgument)?;
        if left == 0 {
            let removed = {
                let mut table = self.channels.lock();
                table.get(&id).is_some_and(|c| Arc::ptr_eq(c, &channel))
                    && table.remove(&id).is_some()
            };
            // Channels reaped with their task were already counted
            if removed {
                self.stats.channels_released.inc();
            }
        }
        self.release_channel(&channel);
        Ok(())
    }

    /// Drop one reference; the last one detaches the channel from its port
    pub(crate) fn release_channel(&self, channel: &Arc<Channel>) {
        if !channel.release() {
            return;
        }
        let port = channel.detach();
        log::debug!(
            "channel release: {} detached from {:?}",
            channel.id(),
            port.map(|p| p.id())
        );
    }

    /// Pin the port a channel is bound to.
    ///
    /// Fails with `PipeClosed` if the port shut down and `InvalidArgument`
    /// if the channel was never bound or its last handle is closed; in
    /// every case the pin taken here is released before returning.
    pub fn get_bound_port(&self, owner: TaskId, id: ChannelId) -> IpcResult<PortRef<'_>> {
        let channel = self.channel(owner, id)?;
        if !channel.try_acquire() {
            return Err(IpcError::InvalidArgument);
        }
        let port = if channel.handles() == 0 {
            Err(IpcError::InvalidArgument)
        } else {
            channel.port()
        };
        match port {
            Ok(port) => Ok(PortRef {
                kernel: self,
                channel,
                port,
            }),
            Err(err) => {
                self.release_channel(&channel);
                Err(err)
            }
        }
    }

    /// Channel control command; returns the command's value
    pub fn channel_control(
        &self,
        caller: TaskId,
        id: ChannelId,
        cmd: ChannelCmd,
    ) -> IpcResult<i64> {
        self.channel(caller, id)?.control(cmd)
    }

    // ========================================================================
    // Messaging
    // ========================================================================

    /// Synchronous send: deliver `send` through `channel` and block until
    /// the server replies into `recv`.
    pub fn port_send(
        &self,
        sender: TaskId,
        channel: ChannelId,
        send: &[IoVec],
        recv: &[IoVec],
        flags: MessageFlags,
    ) -> IpcResult<SendOutcome> {
        if MessageFlags::from_bits(flags.bits()).is_none() {
            return Err(IpcError::InvalidArgument);
        }
        let entered = self.enter_task(sender)?;
        let port = self.get_bound_port(sender, channel)?;

        let max = self.config.max_iovecs;
        let send_buf = BufferDescriptor::build(&*self.memory, sender, send, Side::Send, max)?;
        let recv_buf = BufferDescriptor::build(&*self.memory, sender, recv, Side::Receive, max)?;
        let msg = Arc::new(Message::new(sender, entered.thread(), flags, send_buf, recv_buf));

        self.stats.sends.inc();
        log::trace!("port_send: {} via {} -> {}", msg.id(), channel, port.id());
        let result = port.send(&*self.sched, &self.stats, msg.clone());
        if matches!(result, Err(IpcError::Cancelled)) {
            self.reap_abandoned(&msg);
        }
        result
    }

    /// Drop an abandoned message from whichever port holds it now
    fn reap_abandoned(&self, msg: &Message) {
        let Some(holder) = msg.port().and_then(|id| self.port(id).ok()) else {
            return;
        };
        if holder.reap(&*self.sched, msg.id()) {
            log::trace!("port_send: reaped abandoned {} on {}", msg.id(), holder.id());
        }
    }

    /// Receive the next message on `port_id` into `buffer`
    pub fn port_receive(
        &self,
        owner: TaskId,
        port_id: PortId,
        buffer: &[IoVec],
    ) -> IpcResult<Delivery> {
        let _entered = self.enter_task(owner)?;
        let port = self.owned_port(owner, port_id)?;
        let buf = BufferDescriptor::build(
            &*self.memory,
            owner,
            buffer,
            Side::Receive,
            self.config.max_iovecs,
        )?;
        let (_, delivery) = port.receive(&*self.sched, &self.stats, &buf)?;
        self.stats.receives.inc();
        Ok(delivery)
    }

    /// Find a delivered message in one of `owner`'s ports
    pub(crate) fn find_processing(
        &self,
        owner: TaskId,
        id: MessageId,
    ) -> Option<(Arc<Port>, Arc<Message>)> {
        self.ports_owned_by(owner)
            .into_iter()
            .find_map(|port| port.processing(id).map(|msg| (port, msg)))
    }
}

impl core::fmt::Debug for IpcKernel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IpcKernel")
            .field("config", &self.config)
            .field("tasks", &self.tasks.lock().len())
            .field("ports", &self.ports.lock().len())
            .field("channels", &self.channels.lock().len())
            .finish()
    }
}
