/*
 * Dispatch Loop (Looper)
 *
 * Reads batches of BR_* records from the arbiter and acts on each one.
 * The state lives in the record tag; nothing is persisted between
 * batches.
 *
 * Wait modes:
 * - Loop:    process-wide looper, runs until quit or a driver failure
 * - OneWay:  caller of a one-way transaction, done at TRANSACTION_COMPLETE
 * - Reply:   caller of a two-way transaction, done at REPLY, FAILED_REPLY
 *            or DEAD_REPLY
 *
 * A whole batch is always processed; a terminal record only decides what
 * the wait returns once the batch is done.
 *
 * Incoming transaction routing (first match wins):
 * 1. anonymous registry, by the target identity's token (local targets)
 * 2. anonymous registry, by the leading token
 * 3. anonymous registry, by the record cookie
 * 4. handler tracked for the receiving thread
 * 5. handler of the process-wide looper
 */

use core::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use crate::driver::numbers::{
    BC_ACQUIRE_DONE, BC_DEAD_BINDER_DONE, BC_ENTER_LOOPER, BC_EXIT_LOOPER, BC_INCREFS_DONE,
    BC_REGISTER_LOOPER,
};
use crate::ipc::IpcMsgHandler;
use crate::ipc::channel::Channel;
use crate::ipc::error::{IpcError, Result};
use crate::ipc::identity::SvcIdentity;
use crate::ipc::io::IpcIo;
use crate::ipc::message::{IpcMsg, KernelBuffer, MsgType};
use crate::ipc::protocol::{CommandWriter, Return, ReturnReader, TransactionData, TransactionFlags};
use crate::ipc::reply::ReplyContext;

/// Bytes read from the arbiter per batch
pub(crate) const READ_BUFFER_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitMode {
    Loop,
    OneWay,
    Reply,
}

#[derive(Debug)]
pub(crate) enum Outcome {
    Continue,
    TransactionComplete,
    Reply(IpcIo),
}

impl Channel {
    /// Run the process-wide dispatch loop on the calling thread
    ///
    /// Returns once `stop_loop` is called (observed after the next batch)
    /// or the driver fails.
    pub fn join_work_thread<F>(self: &Arc<Self>, handler: F) -> Result<()>
    where
        F: Fn(&mut ReplyContext, IpcMsg, &mut IpcIo) -> i32 + Send + Sync + 'static,
    {
        let handler: IpcMsgHandler = Arc::new(handler);
        *self.main_handler.lock() = Some(handler.clone());
        self.looper_started.store(true, Ordering::Release);
        log::info!("looper: main loop joined by {:?}", thread::current().name());
        self.run_looper(Some(handler), BC_ENTER_LOOPER)
    }

    /// Ask every looper of this channel to exit
    pub fn stop_loop(&self) {
        log::info!("looper: stop requested");
        self.quit.store(true, Ordering::Release);
    }

    /// Start a background looper the first time the kernel path is used
    pub(crate) fn ensure_looper(self: &Arc<Self>) -> Result<()> {
        if self.looper_started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.spawn_looper(None, BC_ENTER_LOOPER)
    }

    fn spawn_looper(self: &Arc<Self>, handler: Option<IpcMsgHandler>, entry: u32) -> Result<()> {
        let index = self.spawned.fetch_add(1, Ordering::Relaxed);
        let channel = Arc::clone(self);
        thread::Builder::new()
            .name(format!("liteipc-looper-{}", index))
            .spawn(move || {
                if let Err(e) = channel.run_looper(handler, entry) {
                    log::warn!("looper: exited with {}", e);
                }
            })
            .map_err(|e| {
                log::error!("looper: spawn failed: {}", e);
                IpcError::Internal
            })?;
        Ok(())
    }

    pub(crate) fn run_looper(self: &Arc<Self>, handler: Option<IpcMsgHandler>, entry: u32) -> Result<()> {
        let me = thread::current().id();
        if let Some(handler) = handler {
            self.workers.track(me, handler);
        }

        let result = self.looper_body(entry);

        let mut cmd = CommandWriter::new();
        cmd.command(BC_EXIT_LOOPER);
        if let Err(e) = self.write(&cmd) {
            log::debug!("looper: exit notification not delivered: {}", e);
        }
        self.workers.untrack(me);
        result
    }

    fn looper_body(self: &Arc<Self>, entry: u32) -> Result<()> {
        let mut cmd = CommandWriter::new();
        cmd.command(entry);
        self.write(&cmd)?;

        let mut buf = [0u8; READ_BUFFER_SIZE];
        while !self.quit.load(Ordering::Acquire) {
            let done = self.write_read(&[], &mut buf)?;
            match self.parse_returns(&buf[..done.read_consumed], WaitMode::Loop) {
                Ok(_) => {}
                Err(e @ IpcError::Driver(_)) => return Err(e),
                Err(e) => log::warn!("looper: batch failed: {}", e),
            }
        }
        Ok(())
    }

    /// Block the calling thread until its transaction completes
    pub(crate) fn wait_for_response(self: &Arc<Self>, mode: WaitMode) -> Result<Option<IpcIo>> {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        loop {
            let done = self.write_read(&[], &mut buf)?;
            match self.parse_returns(&buf[..done.read_consumed], mode)? {
                Outcome::Continue => {}
                Outcome::TransactionComplete => return Ok(None),
                Outcome::Reply(io) => return Ok(Some(io)),
            }
        }
    }

    /// Act on one batch of return records
    pub(crate) fn parse_returns(self: &Arc<Self>, buf: &[u8], mode: WaitMode) -> Result<Outcome> {
        let mut outcome: Option<Result<Outcome>> = None;

        for record in ReturnReader::new(buf) {
            match record? {
                Return::Noop | Return::Ok | Return::Finished => {}
                Return::TransactionComplete => {
                    if mode == WaitMode::OneWay && outcome.is_none() {
                        outcome = Some(Ok(Outcome::TransactionComplete));
                    }
                }
                Return::IncRefs { ptr, cookie } => {
                    log::debug!("looper: increfs {:#x}", ptr);
                    let mut cmd = CommandWriter::new();
                    cmd.ptr_cookie(BC_INCREFS_DONE, ptr, cookie);
                    self.write(&cmd)?;
                }
                Return::Acquire { ptr, cookie } => {
                    log::debug!("looper: acquire {:#x}", ptr);
                    let mut cmd = CommandWriter::new();
                    cmd.ptr_cookie(BC_ACQUIRE_DONE, ptr, cookie);
                    self.write(&cmd)?;
                }
                Return::Release { ptr, .. } => log::debug!("looper: release {:#x}", ptr),
                Return::DecRefs { ptr, .. } => log::debug!("looper: decrefs {:#x}", ptr),
                Return::AttemptAcquire { ptr, .. } => log::debug!("looper: attempt acquire {:#x} ignored", ptr),
                Return::AcquireResult(result) => log::debug!("looper: acquire result {}", result),
                Return::SpawnLooper => {
                    let handler = self
                        .workers
                        .lookup(thread::current().id())
                        .or_else(|| self.main_handler.lock().clone());
                    self.spawn_looper(handler, BC_REGISTER_LOOPER)?;
                }
                Return::Transaction(record) => {
                    if let Err(e) = self.dispatch_transaction(&record) {
                        log::error!("looper: transaction code {} dropped: {}", record.code, e);
                    }
                }
                Return::Reply(record) => {
                    let reply = self.decode_reply(&record);
                    if mode == WaitMode::Reply && outcome.is_none() {
                        outcome = Some(reply.map(Outcome::Reply));
                    } else {
                        log::warn!("looper: unexpected reply discarded");
                    }
                }
                Return::DeadBinder { cookie } => self.notify_death(cookie)?,
                Return::ClearDeathNotificationDone { cookie } => {
                    log::debug!("looper: death notification {} cleared", cookie);
                }
                Return::FailedReply => {
                    if mode != WaitMode::Loop && outcome.is_none() {
                        outcome = Some(Err(IpcError::Failed));
                    } else {
                        log::warn!("looper: stray failed reply");
                    }
                }
                Return::DeadReply => {
                    if mode != WaitMode::Loop && outcome.is_none() {
                        outcome = Some(Err(IpcError::DeadObject));
                    } else {
                        log::warn!("looper: stray dead reply");
                    }
                }
                Return::Error(code) => {
                    log::error!("looper: arbiter error {}", code);
                    return Err(IpcError::Driver(code));
                }
                Return::Unknown(tag) => {
                    log::error!("looper: unknown return {:#x}", tag);
                    return Err(IpcError::Internal);
                }
            }
        }

        outcome.unwrap_or(Ok(Outcome::Continue))
    }

    fn read_offsets(&self, record: &TransactionData) -> Result<Vec<u64>> {
        let raw = self.read_buffer(record.offsets, record.offsets_count() * core::mem::size_of::<u64>())?;
        Ok(raw
            .chunks_exact(core::mem::size_of::<u64>())
            .map(|c| {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(c);
                u64::from_ne_bytes(bytes)
            })
            .collect())
    }

    fn guard(self: &Arc<Self>, record: &TransactionData) -> Option<KernelBuffer> {
        (record.buffer != 0).then(|| KernelBuffer::new(Arc::clone(self), record.buffer))
    }

    /// Copy a reply out of the receive region and release its buffer
    fn decode_reply(self: &Arc<Self>, record: &TransactionData) -> Result<IpcIo> {
        let mut buffer = self.guard(record);
        let data = self.read_buffer(record.buffer, record.data_size as usize)?;

        if record.flags.contains(TransactionFlags::STATUS_CODE) {
            if let Some(buffer) = buffer.as_mut() {
                buffer.release()?;
            }
            let status = data
                .get(..4)
                .and_then(|b| b.try_into().ok())
                .map(i32::from_ne_bytes)
                .ok_or(IpcError::Internal)?;
            return match status {
                0 => Ok(IpcIo::from_raw(Vec::new(), Vec::new())),
                code => Err(IpcError::Status(code)),
            };
        }

        let offsets = self.read_offsets(record)?;
        if let Some(buffer) = buffer.as_mut() {
            buffer.release()?;
        }
        let mut io = IpcIo::from_raw(data, offsets);
        if io.pop_header().is_none() {
            log::error!("looper: reply of {} bytes has no header", io.len());
            return Err(IpcError::Internal);
        }
        Ok(io)
    }

    fn resolve_handler(&self, target: &SvcIdentity, token: usize, cookie: u64) -> Option<IpcMsgHandler> {
        let by_target = target.is_local().then(|| self.callbacks.lookup(target.token)).flatten();
        by_target
            .or_else(|| self.callbacks.lookup(token))
            .or_else(|| self.callbacks.lookup(cookie as usize))
            .or_else(|| self.workers.lookup(thread::current().id()))
            .or_else(|| self.main_handler.lock().clone())
    }

    fn dispatch_transaction(self: &Arc<Self>, record: &TransactionData) -> Result<()> {
        let buffer = self.guard(record);
        let one_way = record.flags.contains(TransactionFlags::ONE_WAY);
        let mut ctx = ReplyContext::kernel(Arc::clone(self), one_way);

        let payload = self
            .read_buffer(record.buffer, record.data_size as usize)
            .and_then(|data| Ok((data, self.read_offsets(record)?)));
        let (data, offsets) = match payload {
            Ok(parts) => parts,
            Err(e) => {
                log::warn!("looper: transaction code {} unreadable: {}", record.code, e);
                drop(buffer);
                ctx.reply_status(IpcError::Failed.errno())?;
                return Err(e);
            }
        };
        let mut io = IpcIo::from_raw(data.clone(), offsets.clone());
        let Some((token, target)) = io.pop_header() else {
            log::warn!("looper: protocol violation, transaction code {} without header", record.code);
            drop(buffer);
            ctx.reply_status(IpcError::Failed.errno())?;
            return Err(IpcError::Internal);
        };

        let msg = IpcMsg {
            kind: MsgType::Request,
            target,
            code: record.code,
            flags: record.flags,
            token,
            pid: record.sender_pid,
            uid: record.sender_euid,
            gid: None,
            data,
            offsets,
            buffer,
        };

        let Some(handler) = self.resolve_handler(&target, token, record.cookie) else {
            log::warn!("looper: protocol violation, no handler for {} code {}", target, record.code);
            drop(msg);
            ctx.reply_status(IpcError::Failed.errno())?;
            return Ok(());
        };

        log::debug!("looper: dispatch code {} to {}", record.code, target);
        let ret = handler(&mut ctx, msg, &mut io);
        if ctx.expects_reply() && !ctx.replied() {
            ctx.reply_status(ret)?;
        }
        Ok(())
    }

    fn notify_death(self: &Arc<Self>, cookie: u64) -> Result<()> {
        match self.deaths.begin_notify(cookie) {
            Some(notice) => {
                let target = SvcIdentity::remote(notice.handle);
                log::info!("looper: {} died, {} callbacks", target, notice.handlers.len());
                for handler in &notice.handlers {
                    let mut ctx = ReplyContext::detached();
                    let mut io = IpcIo::from_raw(Vec::new(), Vec::new());
                    handler(&mut ctx, IpcMsg::death_notice(target), &mut io);
                }
                self.deaths.finish_notify(cookie);
            }
            None => log::warn!("looper: death notice for unknown cookie {}", cookie),
        }

        let mut cmd = CommandWriter::new();
        cmd.command(BC_DEAD_BINDER_DONE).put_u64(cookie);
        self.write(&cmd)
    }
}
