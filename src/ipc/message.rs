/*
 * Wire Messages
 *
 * `IpcMsg` is what a handler receives: the routing metadata of one
 * transaction (target, code, flags, sender credentials, leading token)
 * plus the raw wire payload.
 *
 * Design:
 * - Messages materialized from a kernel BR_TRANSACTION own the kernel
 *   buffer through a `KernelBuffer` guard
 * - The guard issues BC_FREE_BUFFER exactly once, either explicitly
 *   (`free_buffer`) or when the message is dropped
 * - In-process (anonymous) and synthesized death notices carry no guard
 */

use std::sync::Arc;

use crate::ipc::channel::Channel;
use crate::ipc::error::Result;
use crate::ipc::identity::SvcIdentity;
use crate::ipc::protocol::{CommandWriter, TransactionFlags};

/// Message type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    Request,
    Reply,
    DeathNotify,
}

/// Kernel-owned transaction buffer, exclusively owned until released
pub(crate) struct KernelBuffer {
    channel: Arc<Channel>,
    ptr: Option<u64>,
}

impl KernelBuffer {
    pub(crate) fn new(channel: Arc<Channel>, ptr: u64) -> Self {
        Self { channel, ptr: Some(ptr) }
    }

    /// Hand the buffer back to the arbiter; later calls are no-ops
    pub(crate) fn release(&mut self) -> Result<()> {
        let Some(ptr) = self.ptr.take() else {
            return Ok(());
        };
        log::debug!("ipc: free buffer {:#x}", ptr);
        let mut cmd = CommandWriter::new();
        cmd.free_buffer(ptr);
        self.channel.write(&cmd)
    }
}

impl Drop for KernelBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::error!("ipc: failed to free kernel buffer: {}", e);
        }
    }
}

impl core::fmt::Debug for KernelBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.ptr {
            Some(ptr) => write!(f, "KernelBuffer({:#x})", ptr),
            None => write!(f, "KernelBuffer(released)"),
        }
    }
}

/// One received (or synthesized) transaction
#[derive(Debug)]
pub struct IpcMsg {
    pub(crate) kind: MsgType,
    pub(crate) target: SvcIdentity,
    pub(crate) code: u32,
    pub(crate) flags: TransactionFlags,
    pub(crate) token: usize,
    pub(crate) pid: i32,
    pub(crate) uid: u32,
    pub(crate) gid: Option<u32>,
    /// Full wire payload, transport header included
    pub(crate) data: Vec<u8>,
    pub(crate) offsets: Vec<u64>,
    pub(crate) buffer: Option<KernelBuffer>,
}

impl IpcMsg {
    /// Death notice for a remote service, delivered to subscription handlers
    pub(crate) fn death_notice(target: SvcIdentity) -> Self {
        Self {
            kind: MsgType::DeathNotify,
            target,
            code: 0,
            flags: TransactionFlags::ONE_WAY,
            token: 0,
            pid: 0,
            uid: 0,
            gid: None,
            data: Vec::new(),
            offsets: Vec::new(),
            buffer: None,
        }
    }

    pub fn msg_type(&self) -> MsgType {
        self.kind
    }

    /// Identity the sender addressed
    pub fn target(&self) -> SvcIdentity {
        self.target
    }

    /// Operation code
    pub fn code(&self) -> u32 {
        self.code
    }

    /// Leading token written by the sender
    pub fn token(&self) -> usize {
        self.token
    }

    pub fn flags(&self) -> TransactionFlags {
        self.flags
    }

    pub fn is_one_way(&self) -> bool {
        self.flags.contains(TransactionFlags::ONE_WAY)
    }

    pub fn calling_pid(&self) -> i32 {
        self.pid
    }

    pub fn calling_uid(&self) -> u32 {
        self.uid
    }

    /// Sender group id; the arbiter does not report it for remote senders
    pub fn calling_gid(&self) -> Option<u32> {
        self.gid
    }

    /// Raw wire payload
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn offsets(&self) -> &[u64] {
        &self.offsets
    }

    /// Kernel buffer still held by this message
    pub fn holds_buffer(&self) -> bool {
        self.buffer.as_ref().is_some_and(|b| b.ptr.is_some())
    }

    /// Release the kernel buffer now instead of on drop
    pub fn free_buffer(&mut self) -> Result<()> {
        match self.buffer.as_mut() {
            Some(buffer) => buffer.release(),
            None => Ok(()),
        }
    }
}
