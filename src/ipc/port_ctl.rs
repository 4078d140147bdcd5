//! Port Control Protocol - commands on delivered messages
//!
//! A server that received a message may, before answering it:
//!
//! - FORWARD it to another channel, keeping the original sender
//! - APPEND extra payload that the next receiver gets after the request
//! - CUT the most recently appended payload
//! - REPLY_RETCODE: wake the sender with a code, no data
//! - REPLY: copy reply data into the sender's receive buffer, then wake it
//!
//! The message is addressed by id and must sit in the processing table of
//! a port the caller owns. Every command is transactional: on failure the
//! message stays in processing exactly as it was.

use alloc::sync::Arc;
use alloc::vec::Vec;

use super::buffer::{transfer, BufferDescriptor, Direction, IoVec, Side};
use super::message::Message;
use super::port::Port;
use super::space::IpcKernel;
use super::{IpcError, IpcResult};
use crate::types::{ChannelId, MessageId, TaskId};

// Raw port_control command numbers
pub const PORT_CTL_FORWARD: u32 = 1;
pub const PORT_CTL_APPEND: u32 = 2;
pub const PORT_CTL_CUT: u32 = 3;
pub const PORT_CTL_REPLY_RETCODE: u32 = 4;
pub const PORT_CTL_REPLY: u32 = 5;

/// Command applied to a delivered message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortCtlCmd {
    /// Requeue on the port bound to this (caller-held) channel
    Forward(ChannelId),
    /// Stack extra payload read from the caller's memory
    Append(Vec<IoVec>),
    /// Drop the most recently appended payload
    Cut,
    /// Complete with a code and no data
    ReplyRetcode(i64),
    /// Copy `data` into the sender's receive buffer and complete with `code`
    Reply { data: Vec<IoVec>, code: i64 },
}

/// Port control descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortCtl {
    pub message: MessageId,
    pub cmd: PortCtlCmd,
}

impl PortCtl {
    pub fn new(message: MessageId, cmd: PortCtlCmd) -> Self {
        Self { message, cmd }
    }
}

impl IpcKernel {
    /// Apply a control command to a message in one of `caller`'s ports.
    ///
    /// Returns the number of extras after APPEND/CUT, the reply length
    /// after a reply, and 0 after a forward.
    pub fn port_control(&self, caller: TaskId, ctl: PortCtl) -> IpcResult<i64> {
        self.task(caller)?;
        let Some((port, msg)) = self.find_processing(caller, ctl.message) else {
            log::warn!("port_control: {} not pending for {}", ctl.message, caller);
            return Err(IpcError::NotFound);
        };
        if msg.is_abandoned() {
            port.take_processing(msg.id());
            log::trace!("port_control: dropping abandoned {}", msg.id());
            return Err(IpcError::NotFound);
        }

        match ctl.cmd {
            PortCtlCmd::Forward(channel) => self.forward(caller, &port, &msg, channel),
            PortCtlCmd::Append(iovecs) => {
                let max = self.config().max_iovecs;
                let extra =
                    BufferDescriptor::build(self.memory(), caller, &iovecs, Side::Send, max)?;
                msg.append(extra, max)?;
                self.stats().appends.inc();
                Ok(msg.extra_count() as i64)
            }
            PortCtlCmd::Cut => {
                msg.cut()?;
                self.stats().cuts.inc();
                Ok(msg.extra_count() as i64)
            }
            PortCtlCmd::ReplyRetcode(code) => self.reply(&port, &msg, None, code),
            PortCtlCmd::Reply { data, code } => {
                let data = BufferDescriptor::build(
                    self.memory(),
                    caller,
                    &data,
                    Side::Send,
                    self.config().max_iovecs,
                )?;
                self.reply(&port, &msg, Some(&data), code)
            }
        }
    }

    fn forward(
        &self,
        caller: TaskId,
        source: &Port,
        msg: &Arc<Message>,
        channel: ChannelId,
    ) -> IpcResult<i64> {
        let target = self.get_bound_port(caller, channel)?;
        let taken = source.take_processing(msg.id()).ok_or(IpcError::NotFound)?;
        if let Err((err, back)) = target.forward_in(self.scheduler(), taken) {
            source.restore_processing(back);
            return Err(err);
        }
        self.stats().forwards.inc();
        log::debug!(
            "port_control: forward {} from {} to {} (sender {})",
            msg.id(),
            source.id(),
            target.id(),
            msg.sender()
        );
        Ok(0)
    }

    fn reply(
        &self,
        port: &Port,
        msg: &Arc<Message>,
        data: Option<&BufferDescriptor>,
        code: i64,
    ) -> IpcResult<i64> {
        if code < 0 {
            return Err(IpcError::InvalidArgument);
        }
        let taken = port.take_processing(msg.id()).ok_or(IpcError::NotFound)?;

        let reply_len = match data {
            Some(data) => match transfer(taken.recv_buf(), data, 0, Direction::FromBuffer) {
                Ok(n) => n,
                Err(err) => {
                    port.restore_processing(taken);
                    return Err(err);
                }
            },
            None => 0,
        };
        if !taken.complete(code, reply_len) {
            return Err(IpcError::NotFound);
        }
        self.scheduler().wake(taken.sender_thread());

        self.stats().replies.inc();
        self.stats().bytes_transferred.add(reply_len as u64);
        log::trace!(
            "port_control: reply {} code={} len={}",
            taken.id(),
            code,
            reply_len
        );
        Ok(reply_len as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::channel::ChannelFlags;
    use crate::ipc::message::MessageFlags;
    use crate::ipc::port::PortFlags;
    use crate::test_support::Fixture;

    #[test]
    fn test_reply_retcode_wakes_sender() {
        let fx = Fixture::new();
        let pair = fx.pair(1);
        let req = fx.buffer(pair.client, b"PING");
        let inbox = fx.scratch(pair.server, 16);

        std::thread::scope(|s| {
            let sender = s.spawn(|| {
                fx.kernel
                    .port_send(pair.client, pair.channel, &[req], &[], MessageFlags::empty())
            });
            let d = fx.kernel.port_receive(pair.server, pair.port, &[inbox]).unwrap();
            assert_eq!(fx.read(pair.server, inbox, d.copied), b"PING");

            assert_eq!(
                fx.kernel.port_control(
                    pair.server,
                    PortCtl::new(d.message, PortCtlCmd::ReplyRetcode(-1)),
                ),
                Err(IpcError::InvalidArgument)
            );
            fx.kernel
                .port_control(pair.server, PortCtl::new(d.message, PortCtlCmd::ReplyRetcode(7)))
                .unwrap();
            assert_eq!(sender.join().unwrap().unwrap().code, 7);

            assert_eq!(
                fx.kernel.port_control(
                    pair.server,
                    PortCtl::new(d.message, PortCtlCmd::ReplyRetcode(0)),
                ),
                Err(IpcError::NotFound)
            );
        });
    }

    #[test]
    fn test_reply_with_data() {
        let fx = Fixture::new();
        let pair = fx.pair(4);
        let req = fx.buffer(pair.client, b"GET /");
        let reply_area = fx.scratch(pair.client, 8);
        let inbox = fx.scratch(pair.server, 16);
        let answer = fx.buffer(pair.server, b"200 OK, long body");

        std::thread::scope(|s| {
            let sender = s.spawn(|| {
                fx.kernel.port_send(
                    pair.client,
                    pair.channel,
                    &[req],
                    &[reply_area],
                    MessageFlags::empty(),
                )
            });
            let d = fx.kernel.port_receive(pair.server, pair.port, &[inbox]).unwrap();
            let n = fx
                .kernel
                .port_control(
                    pair.server,
                    PortCtl::new(
                        d.message,
                        PortCtlCmd::Reply {
                            data: alloc::vec![answer],
                            code: 0,
                        },
                    ),
                )
                .unwrap();
            assert_eq!(n, 8);

            let outcome = sender.join().unwrap().unwrap();
            assert_eq!(outcome.reply_len, 8);
        });
        assert_eq!(fx.read(pair.client, reply_area, 8), b"200 OK, ");
    }

    #[test]
    fn test_append_and_cut_then_forward() {
        let fx = Fixture::new();
        let front = fx.pair(4);
        let backend = fx.kernel.task_create();
        let backend_port = fx
            .kernel
            .install_port(backend, PortFlags::empty(), None)
            .unwrap();
        let relay = fx
            .kernel
            .open_channel(front.server, backend, backend_port, Default::default())
            .unwrap();

        let req = fx.buffer(front.client, b"req");
        let inbox = fx.scratch(front.server, 16);
        let first = fx.buffer(front.server, b"+one");
        let second = fx.buffer(front.server, b"+two");
        let backend_inbox = fx.scratch(backend, 32);

        std::thread::scope(|s| {
            let sender = s.spawn(|| {
                fx.kernel
                    .port_send(front.client, front.channel, &[req], &[], MessageFlags::empty())
            });
            let d = fx.kernel.port_receive(front.server, front.port, &[inbox]).unwrap();
            let ctl = |cmd| fx.kernel.port_control(front.server, PortCtl::new(d.message, cmd));

            assert_eq!(ctl(PortCtlCmd::Append(alloc::vec![first])), Ok(1));
            assert_eq!(ctl(PortCtlCmd::Append(alloc::vec![second])), Ok(2));
            assert_eq!(ctl(PortCtlCmd::Cut), Ok(1));
            assert_eq!(ctl(PortCtlCmd::Forward(relay)), Ok(0));
            assert_eq!(ctl(PortCtlCmd::Cut), Err(IpcError::NotFound));

            let fwd = fx
                .kernel
                .port_receive(backend, backend_port, &[backend_inbox])
                .unwrap();
            assert_eq!(fwd.message, d.message);
            assert_eq!(fwd.sender, front.client);
            assert_eq!(fwd.total, 7);
            assert_eq!(fx.read(backend, backend_inbox, fwd.copied), b"req+one");

            fx.kernel
                .port_control(backend, PortCtl::new(fwd.message, PortCtlCmd::ReplyRetcode(3)))
                .unwrap();
            assert_eq!(sender.join().unwrap().unwrap().code, 3);
        });
        assert_eq!(fx.kernel.stats().forwards.get(), 1);
    }

    #[test]
    fn test_forward_to_closed_port_keeps_message() {
        let fx = Fixture::new();
        let front = fx.pair(4);
        let backend = fx.pair(4);
        let relay = fx
            .kernel
            .open_channel(front.server, backend.server, backend.port, Default::default())
            .unwrap();
        fx.kernel.close_port(backend.server, backend.port).unwrap();

        let req = fx.buffer(front.client, b"x");
        let inbox = fx.scratch(front.server, 4);

        std::thread::scope(|s| {
            let sender = s.spawn(|| {
                fx.kernel
                    .port_send(front.client, front.channel, &[req], &[], MessageFlags::empty())
            });
            let d = fx.kernel.port_receive(front.server, front.port, &[inbox]).unwrap();
            assert_eq!(
                fx.kernel.port_control(
                    front.server,
                    PortCtl::new(d.message, PortCtlCmd::Forward(relay)),
                ),
                Err(IpcError::PipeClosed)
            );
            fx.kernel
                .port_control(front.server, PortCtl::new(d.message, PortCtlCmd::ReplyRetcode(1)))
                .unwrap();
            assert_eq!(sender.join().unwrap().unwrap().code, 1);
        });
    }

    #[test]
    fn test_control_requires_owning_port() {
        let fx = Fixture::new();
        let pair = fx.pair(4);
        let req = fx.buffer(pair.client, b"x");
        let inbox = fx.scratch(pair.server, 4);

        std::thread::scope(|s| {
            let sender = s.spawn(|| {
                fx.kernel
                    .port_send(pair.client, pair.channel, &[req], &[], MessageFlags::empty())
            });
            let d = fx.kernel.port_receive(pair.server, pair.port, &[inbox]).unwrap();
            assert_eq!(
                fx.kernel.port_control(
                    pair.client,
                    PortCtl::new(d.message, PortCtlCmd::ReplyRetcode(0)),
                ),
                Err(IpcError::NotFound)
            );
            fx.kernel
                .port_control(pair.server, PortCtl::new(d.message, PortCtlCmd::ReplyRetcode(0)))
                .unwrap();
            sender.join().unwrap().unwrap();
        });
    }

    #[test]
    fn test_cancelled_sender_reaps_processing_message() {
        let fx = Fixture::new();
        let pair = fx.pair(4);
        let port = fx.kernel.port(pair.port).unwrap();
        let req = fx.buffer(pair.client, b"gone");
        let inbox = fx.scratch(pair.server, 16);

        std::thread::scope(|s| {
            let sender = s.spawn(|| {
                fx.kernel
                    .port_send(pair.client, pair.channel, &[req], &[], MessageFlags::empty())
            });
            let d = fx.kernel.port_receive(pair.server, pair.port, &[inbox]).unwrap();
            assert_eq!(port.processing_count(), 1);
            fx.kernel.terminate_task(pair.client).unwrap();
            assert_eq!(sender.join().unwrap(), Err(IpcError::Cancelled));
            assert_eq!(port.processing_count(), 0);
            assert_eq!(
                fx.kernel.port_control(
                    pair.server,
                    PortCtl::new(d.message, PortCtlCmd::ReplyRetcode(0)),
                ),
                Err(IpcError::NotFound)
            );
        });
    }

    #[test]
    fn test_cancelled_sender_reaps_forwarded_message() {
        let fx = Fixture::new();
        let front = fx.pair(4);
        let back = fx.kernel.task_create();
        let back_port = fx
            .kernel
            .install_port(back, PortFlags::empty(), Some(4))
            .unwrap();
        let relay = fx
            .kernel
            .open_channel(front.server, back, back_port, ChannelFlags::empty())
            .unwrap();
        let source = fx.kernel.port(front.port).unwrap();
        let target = fx.kernel.port(back_port).unwrap();
        let req = fx.buffer(front.client, b"relay me");
        let inbox = fx.scratch(front.server, 16);

        std::thread::scope(|s| {
            let sender = s.spawn(|| {
                fx.kernel
                    .port_send(front.client, front.channel, &[req], &[], MessageFlags::empty())
            });
            let d = fx.kernel.port_receive(front.server, front.port, &[inbox]).unwrap();
            fx.kernel
                .port_control(front.server, PortCtl::new(d.message, PortCtlCmd::Forward(relay)))
                .unwrap();
            assert_eq!(target.queued(), 1);

            fx.kernel.terminate_task(front.client).unwrap();
            assert_eq!(sender.join().unwrap(), Err(IpcError::Cancelled));
        });
        assert_eq!(target.queued(), 0);
        assert_eq!(source.processing_count(), 0);
    }
}
