//! IPC System Calls - signed-status entry points
//!
//! Each function decodes raw trap arguments, calls into [`IpcKernel`], and
//! folds the result into one `isize`: a non-negative value on success, or
//! the negated errno of the [`IpcError`](crate::ipc::IpcError) on failure.
//! User vectors arrive as `IoVec` slices already copied in by the trap
//! handler.

use alloc::vec::Vec;
use core::time::Duration;

use crate::ipc::channel::ChannelCmd;
use crate::ipc::port_ctl::{
    PORT_CTL_APPEND, PORT_CTL_CUT, PORT_CTL_FORWARD, PORT_CTL_REPLY, PORT_CTL_REPLY_RETCODE,
};
use crate::ipc::{
    ChannelFlags, IoVec, IpcError, IpcKernel, IpcResult, MessageFlags, PollEntry, PollEvents,
    PollObject, PortCtl, PortCtlCmd, PortFlags,
};
use crate::types::{ChannelId, MessageId, PortId, TaskId};

/// `RawPollEntry::kind` for a port
pub const POLL_KIND_PORT: u32 = 0;
/// `RawPollEntry::kind` for a channel
pub const POLL_KIND_CHANNEL: u32 = 1;

/// Receive result written back to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct RecvInfo {
    pub message: u64,
    pub sender: u64,
    pub copied: usize,
    pub total: usize,
}

/// One poll request slot; `revents` is filled in on return
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct RawPollEntry {
    pub kind: u32,
    pub id: u64,
    pub events: u32,
    pub revents: u32,
}

fn to_status(value: u64) -> isize {
    isize::try_from(value).unwrap_or(isize::MAX)
}

fn finish<T>(name: &str, result: IpcResult<T>, value: impl FnOnce(T) -> isize) -> isize {
    match result {
        Ok(v) => value(v),
        Err(err) => {
            log::trace!("{}: {}", name, err);
            -(err.to_errno() as isize)
        }
    }
}

/// Install a port; `capacity == 0` selects the configured default.
/// Returns the port id.
pub fn sys_port_install(kernel: &IpcKernel, owner: u64, flags: u32, capacity: usize) -> isize {
    let result = PortFlags::from_bits(flags)
        .ok_or(IpcError::InvalidArgument)
        .and_then(|flags| {
            kernel.install_port(TaskId(owner), flags, (capacity != 0).then_some(capacity))
        });
    finish("sys_port_install", result, |id| to_status(id.as_u64()))
}

pub fn sys_port_close(kernel: &IpcKernel, owner: u64, port: u64) -> isize {
    finish(
        "sys_port_close",
        kernel.close_port(TaskId(owner), PortId(port)),
        |_| 0,
    )
}

/// Open a channel to `server`'s port. Returns the channel id.
pub fn sys_open_channel(
    kernel: &IpcKernel,
    owner: u64,
    server: u64,
    port: u64,
    flags: u32,
) -> isize {
    let result = ChannelFlags::from_bits(flags)
        .ok_or(IpcError::InvalidArgument)
        .and_then(|flags| {
            kernel.open_channel(TaskId(owner), TaskId(server), PortId(port), flags)
        });
    finish("sys_open_channel", result, |id| to_status(id.as_u64()))
}

pub fn sys_close_channel(kernel: &IpcKernel, owner: u64, channel: u64) -> isize {
    finish(
        "sys_close_channel",
        kernel.close_channel(TaskId(owner), ChannelId(channel)),
        |_| 0,
    )
}

pub fn sys_clone_channel(kernel: &IpcKernel, owner: u64, channel: u64) -> isize {
    finish(
        "sys_clone_channel",
        kernel.clone_channel(TaskId(owner), ChannelId(channel)),
        |id| to_status(id.as_u64()),
    )
}

pub fn sys_channel_control(
    kernel: &IpcKernel,
    caller: u64,
    channel: u64,
    cmd: u32,
    arg: u64,
) -> isize {
    let result = ChannelCmd::from_raw(cmd, arg)
        .and_then(|cmd| kernel.channel_control(TaskId(caller), ChannelId(channel), cmd));
    finish("sys_channel_control", result, |v| v as isize)
}

/// Blocking send. Returns the server's reply code.
pub fn sys_port_send(
    kernel: &IpcKernel,
    sender: u64,
    channel: u64,
    send: &[IoVec],
    recv: &[IoVec],
    flags: u32,
) -> isize {
    let result = MessageFlags::from_bits(flags)
        .ok_or(IpcError::InvalidArgument)
        .and_then(|flags| {
            kernel.port_send(TaskId(sender), ChannelId(channel), send, recv, flags)
        });
    finish("sys_port_send", result, |outcome| outcome.code as isize)
}

/// Blocking receive into `buffer`. Returns the bytes copied; `info`
/// receives the message handle and the full payload length.
pub fn sys_port_receive(
    kernel: &IpcKernel,
    owner: u64,
    port: u64,
    buffer: &[IoVec],
    info: &mut RecvInfo,
) -> isize {
    let result = kernel.port_receive(TaskId(owner), PortId(port), buffer);
    finish("sys_port_receive", result, |d| {
        *info = RecvInfo {
            message: d.message.as_u64(),
            sender: d.sender.as_u64(),
            copied: d.copied,
            total: d.total,
        };
        to_status(d.copied as u64)
    })
}

/// Port control. `arg` is the target channel for FORWARD and the reply
/// code for REPLY_RETCODE/REPLY; `iovecs` carries APPEND and REPLY data.
pub fn sys_port_control(
    kernel: &IpcKernel,
    caller: u64,
    message: u64,
    cmd: u32,
    arg: u64,
    iovecs: &[IoVec],
) -> isize {
    let code = i64::try_from(arg).map_err(|_| IpcError::InvalidArgument);
    let cmd = match cmd {
        PORT_CTL_FORWARD => Ok(PortCtlCmd::Forward(ChannelId(arg))),
        PORT_CTL_APPEND => Ok(PortCtlCmd::Append(iovecs.to_vec())),
        PORT_CTL_CUT => Ok(PortCtlCmd::Cut),
        PORT_CTL_REPLY_RETCODE => code.map(PortCtlCmd::ReplyRetcode),
        PORT_CTL_REPLY => code.map(|code| PortCtlCmd::Reply {
            data: iovecs.to_vec(),
            code,
        }),
        _ => Err(IpcError::InvalidArgument),
    };
    let result = cmd.and_then(|cmd| {
        kernel.port_control(TaskId(caller), PortCtl::new(MessageId(message), cmd))
    });
    finish("sys_port_control", result, |v| v as isize)
}

/// Poll. `timeout_ms < 0` waits forever. Fills every slot's `revents`
/// and returns the number of ready slots.
pub fn sys_poll(
    kernel: &IpcKernel,
    caller: u64,
    slots: &mut [RawPollEntry],
    timeout_ms: i64,
) -> isize {
    let entries: IpcResult<Vec<PollEntry>> = slots
        .iter()
        .map(|slot| {
            let object = match slot.kind {
                POLL_KIND_PORT => PollObject::Port(PortId(slot.id)),
                POLL_KIND_CHANNEL => PollObject::Channel(ChannelId(slot.id)),
                _ => return Err(IpcError::InvalidArgument),
            };
            let interest = PollEvents::from_bits(slot.events).ok_or(IpcError::InvalidArgument)?;
            Ok(PollEntry { object, interest })
        })
        .collect();
    let timeout = u64::try_from(timeout_ms).ok().map(Duration::from_millis);

    let result = entries.and_then(|entries| kernel.poll(TaskId(caller), &entries, timeout));
    finish("sys_poll", result, |ready| {
        for slot in slots.iter_mut() {
            slot.revents = 0;
        }
        for r in &ready {
            if let Some(slot) = slots.get_mut(r.index) {
                slot.revents = r.events.bits();
            }
        }
        to_status(ready.len() as u64)
    })
}
