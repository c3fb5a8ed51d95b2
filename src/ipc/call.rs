/*
 * Call Engine
 *
 * `send_request` issues one transaction and, for two-way calls, blocks
 * the calling thread in its own read loop until the answer arrives.
 *
 * Paths:
 * - Anonymous target (handle 0): resolved in the callback registry and
 *   run on the caller's thread, with the reply redirected in memory.
 *   The arbiter is never involved.
 * - Remote target: BC_TRANSACTION to the arbiter, then wait for
 *   TRANSACTION_COMPLETE (one-way) or a reply-class record (two-way).
 *
 * Results:
 * - Ok(None):      one-way call accepted
 * - Ok(Some(io)):  two-way reply, cursor positioned after the header
 * - Err(Status):   the handler answered with a non-zero status
 * - Err(Failed) / Err(DeadObject): delivery failed / the peer is gone
 *
 * At most one two-way call may be outstanding per thread.
 */

use std::sync::Arc;

use crate::driver::numbers::BC_TRANSACTION;
use crate::ipc::channel::Channel;
use crate::ipc::error::{IpcError, Result};
use crate::ipc::identity::SvcIdentity;
use crate::ipc::io::IpcIo;
use crate::ipc::looper::WaitMode;
use crate::ipc::message::{IpcMsg, MsgType};
use crate::ipc::protocol::TransactionFlags;
use crate::ipc::reply::ReplyContext;

impl Channel {
    /// Send `data` to `target` with operation `code`
    pub fn send_request(
        self: &Arc<Self>,
        target: &SvcIdentity,
        code: u32,
        data: &IpcIo,
        flags: TransactionFlags,
    ) -> Result<Option<IpcIo>> {
        data.validate()?;
        if target.is_local() {
            return self.send_local(target, code, data, flags);
        }

        self.ensure_looper()?;
        let wire = IpcIo::with_header(target.token, target, data)?;
        log::debug!("call: code {} to {} ({} bytes)", code, target, wire.len());
        self.write_transaction(BC_TRANSACTION, target.handle as u64, code, flags, &wire)?;

        let mode = if flags.contains(TransactionFlags::ONE_WAY) {
            WaitMode::OneWay
        } else {
            WaitMode::Reply
        };
        self.wait_for_response(mode)
    }

    fn send_local(&self, target: &SvcIdentity, code: u32, data: &IpcIo, flags: TransactionFlags) -> Result<Option<IpcIo>> {
        let Some(handler) = self.callbacks.lookup(target.token) else {
            log::warn!("call: no anonymous service {}", target);
            return Err(IpcError::InvalidArgument);
        };

        let (bytes, offsets) = IpcIo::with_header(target.token, target, data)?.into_parts();
        let mut io = IpcIo::from_raw(bytes.clone(), offsets.clone());
        let (token, decoded) = io.pop_header().ok_or(IpcError::Internal)?;

        let msg = IpcMsg {
            kind: MsgType::Request,
            target: decoded,
            code,
            flags,
            token,
            pid: std::process::id() as i32,
            uid: unsafe { libc::getuid() },
            gid: Some(unsafe { libc::getgid() }),
            data: bytes,
            offsets,
            buffer: None,
        };

        let one_way = flags.contains(TransactionFlags::ONE_WAY);
        let mut ctx = if one_way { ReplyContext::detached() } else { ReplyContext::redirect() };
        log::debug!("call: code {} to {} in process", code, target);
        let ret = handler(&mut ctx, msg, &mut io);

        if one_way {
            return match ret {
                0 => Ok(None),
                status => Err(IpcError::Status(status)),
            };
        }
        match ctx.take_redirected()? {
            Some(reply) => Ok(Some(reply)),
            None if ret == 0 => Ok(Some(IpcIo::from_raw(Vec::new(), Vec::new()))),
            None => Err(IpcError::Status(ret)),
        }
    }
}
