/*
 * Reply Redirector
 *
 * Every handler receives a `ReplyContext` describing where its answer
 * goes. The context is created by whoever dispatches the request and
 * passed down explicitly, so nested dispatch on the same thread cannot
 * redirect a reply into the wrong frame.
 *
 * Routes:
 * - Kernel:   BC_REPLY to the arbiter (two-way kernel transactions)
 * - Redirect: copy into a fixed-capacity scratch buffer that the waiting
 *             in-process caller picks up (anonymous two-way calls)
 * - Detached: nobody is waiting (one-way calls, death notices)
 *
 * `send_reply` always releases the request's kernel buffer first, on
 * every route.
 */

use std::sync::Arc;

use heapless::Vec as Scratch;

use crate::driver::numbers::BC_REPLY;
use crate::ipc::channel::Channel;
use crate::ipc::error::{IpcError, Result};
use crate::ipc::identity::SvcIdentity;
use crate::ipc::io::{IPC_IO_HEADER_SIZE, IpcIo, MAX_IO_OBJECTS, MAX_IO_SIZE};
use crate::ipc::message::IpcMsg;
use crate::ipc::protocol::TransactionFlags;

const SCRATCH_SIZE: usize = MAX_IO_SIZE + IPC_IO_HEADER_SIZE;
const SCRATCH_OBJECTS: usize = MAX_IO_OBJECTS + 1;

/// Redirected reply in wire form
struct RedirectBuffer {
    data: Scratch<u8, SCRATCH_SIZE>,
    offsets: Scratch<u64, SCRATCH_OBJECTS>,
}

enum Route {
    Kernel { channel: Arc<Channel>, one_way: bool },
    Redirect(Box<RedirectBuffer>),
    Detached,
}

pub struct ReplyContext {
    route: Route,
    replied: bool,
}

impl ReplyContext {
    pub(crate) fn kernel(channel: Arc<Channel>, one_way: bool) -> Self {
        Self { route: Route::Kernel { channel, one_way }, replied: false }
    }

    pub(crate) fn redirect() -> Self {
        let buffer = Box::new(RedirectBuffer { data: Scratch::new(), offsets: Scratch::new() });
        Self { route: Route::Redirect(buffer), replied: false }
    }

    pub(crate) fn detached() -> Self {
        Self { route: Route::Detached, replied: false }
    }

    /// A caller is waiting for an answer
    pub fn expects_reply(&self) -> bool {
        match self.route {
            Route::Kernel { one_way, .. } => !one_way,
            Route::Redirect(_) => true,
            Route::Detached => false,
        }
    }

    pub fn replied(&self) -> bool {
        self.replied
    }

    /// Answer the request `msg` with `reply`
    ///
    /// Fails with `InvalidArgument` when nobody waits for an answer, when
    /// an answer was already sent, or when `reply` does not validate.
    pub fn send_reply(&mut self, msg: &mut IpcMsg, reply: &IpcIo) -> Result<()> {
        if let Err(e) = msg.free_buffer() {
            log::error!("reply: releasing request buffer failed: {}", e);
        }
        if self.replied || !self.expects_reply() {
            log::warn!("reply: no caller waiting for code {} reply", msg.code());
            return Err(IpcError::InvalidArgument);
        }
        reply.validate()?;

        let wire = IpcIo::with_header(0, &SvcIdentity::NULL, reply)?;
        match &mut self.route {
            Route::Kernel { channel, .. } => {
                channel.write_transaction(BC_REPLY, 0, 0, TransactionFlags::empty(), &wire)?;
            }
            Route::Redirect(buffer) => {
                buffer.data.clear();
                buffer.offsets.clear();
                buffer
                    .data
                    .extend_from_slice(wire.data())
                    .map_err(|_| IpcError::InvalidArgument)?;
                buffer
                    .offsets
                    .extend_from_slice(wire.offsets())
                    .map_err(|_| IpcError::InvalidArgument)?;
            }
            Route::Detached => return Err(IpcError::InvalidArgument),
        }
        self.replied = true;
        Ok(())
    }

    /// Status-only reply for a two-way request its handler did not answer
    pub(crate) fn reply_status(&mut self, status: i32) -> Result<()> {
        let Route::Kernel { channel, one_way: false } = &self.route else {
            return Ok(());
        };
        if self.replied {
            return Ok(());
        }
        let mut wire = IpcIo::new(4);
        wire.push_i32(status)?;
        channel.write_transaction(BC_REPLY, 0, 0, TransactionFlags::STATUS_CODE, &wire)?;
        self.replied = true;
        Ok(())
    }

    /// Redirected reply as a read cursor positioned after the header
    pub(crate) fn take_redirected(&mut self) -> Result<Option<IpcIo>> {
        let Route::Redirect(buffer) = &mut self.route else {
            return Ok(None);
        };
        if !self.replied {
            return Ok(None);
        }
        let mut io = IpcIo::from_raw(buffer.data.to_vec(), buffer.offsets.to_vec());
        buffer.data.clear();
        buffer.offsets.clear();
        io.pop_header().ok_or(IpcError::Internal)?;
        Ok(Some(io))
    }
}
