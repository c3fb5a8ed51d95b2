/*
 * Arbiter Wire Records
 *
 * This module defines the record formats exchanged with the arbiter and
 * the helpers that build command streams and walk return streams.
 *
 * Transaction record layout (64 bytes, native endian):
 * - Offset 0-7:   target (u32 handle, or u64 local pointer on delivery)
 * - Offset 8-15:  cookie (u64)
 * - Offset 16-19: code (u32) - Operation code
 * - Offset 20-23: flags (u32) - TransactionFlags
 * - Offset 24-27: sender_pid (i32)
 * - Offset 28-31: sender_euid (u32)
 * - Offset 32-39: data_size (u64)
 * - Offset 40-47: offsets_size (u64)
 * - Offset 48-55: buffer (u64) - Payload pointer
 * - Offset 56-63: offsets (u64) - Offsets array pointer
 *
 * Flat object layout (24 bytes):
 * - Offset 0-3:   type (u32) - BINDER_TYPE_*
 * - Offset 4-7:   flags (u32)
 * - Offset 8-15:  binder pointer (local) or handle (remote, low 32 bits)
 * - Offset 16-23: cookie (u64)
 */

use bitflags::bitflags;

use crate::driver::numbers::*;
use crate::ipc::error::{IpcError, Result};

bitflags! {
    /// Transaction flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TransactionFlags: u32 {
        /// Fire-and-forget, no reply expected
        const ONE_WAY = 0x01;
        const ROOT_OBJECT = 0x04;
        /// Payload is a single i32 status code
        const STATUS_CODE = 0x08;
        const ACCEPT_FDS = 0x10;
    }
}

#[inline]
fn get_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_ne_bytes(raw)
}

#[inline]
fn get_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_ne_bytes(raw)
}

/// struct binder_transaction_data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransactionData {
    pub target: u64,
    pub cookie: u64,
    pub code: u32,
    pub flags: TransactionFlags,
    pub sender_pid: i32,
    pub sender_euid: u32,
    pub data_size: u64,
    pub offsets_size: u64,
    pub buffer: u64,
    pub offsets: u64,
}

impl TransactionData {
    pub const SIZE: usize = TRANSACTION_DATA_SIZE;

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.target.to_ne_bytes());
        out.extend_from_slice(&self.cookie.to_ne_bytes());
        out.extend_from_slice(&self.code.to_ne_bytes());
        out.extend_from_slice(&self.flags.bits().to_ne_bytes());
        out.extend_from_slice(&self.sender_pid.to_ne_bytes());
        out.extend_from_slice(&self.sender_euid.to_ne_bytes());
        out.extend_from_slice(&self.data_size.to_ne_bytes());
        out.extend_from_slice(&self.offsets_size.to_ne_bytes());
        out.extend_from_slice(&self.buffer.to_ne_bytes());
        out.extend_from_slice(&self.offsets.to_ne_bytes());
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            target: get_u64(bytes, 0),
            cookie: get_u64(bytes, 8),
            code: get_u32(bytes, 16),
            flags: TransactionFlags::from_bits_retain(get_u32(bytes, 20)),
            sender_pid: get_u32(bytes, 24) as i32,
            sender_euid: get_u32(bytes, 28),
            data_size: get_u64(bytes, 32),
            offsets_size: get_u64(bytes, 40),
            buffer: get_u64(bytes, 48),
            offsets: get_u64(bytes, 56),
        })
    }

    /// Number of entries in the offsets array
    pub fn offsets_count(&self) -> usize {
        self.offsets_size as usize / core::mem::size_of::<u64>()
    }
}

/// struct flat_binder_object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlatObject {
    pub kind: u32,
    pub flags: u32,
    pub binder: u64,
    pub cookie: u64,
}

impl FlatObject {
    pub const SIZE: usize = FLAT_OBJECT_SIZE;

    pub fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.kind.to_ne_bytes());
        out[4..8].copy_from_slice(&self.flags.to_ne_bytes());
        out[8..16].copy_from_slice(&self.binder.to_ne_bytes());
        out[16..24].copy_from_slice(&self.cookie.to_ne_bytes());
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            kind: get_u32(bytes, 0),
            flags: get_u32(bytes, 4),
            binder: get_u64(bytes, 8),
            cookie: get_u64(bytes, 16),
        })
    }

    /// Local object with a null pointer (never listed in the offsets array)
    pub fn is_null(&self) -> bool {
        matches!(self.kind, BINDER_TYPE_BINDER | BINDER_TYPE_WEAK_BINDER) && self.binder == 0
    }
}

/// Command stream builder
///
/// Accumulates BC_* records for one BINDER_WRITE_READ.
#[derive(Debug, Default)]
pub struct CommandWriter {
    buf: Vec<u8>,
}

impl CommandWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn command(&mut self, tag: u32) -> &mut Self {
        self.buf.extend_from_slice(&tag.to_ne_bytes());
        self
    }

    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_ne_bytes());
        self
    }

    pub fn put_u64(&mut self, value: u64) -> &mut Self {
        self.buf.extend_from_slice(&value.to_ne_bytes());
        self
    }

    /// BC_TRANSACTION / BC_REPLY (or BR_* when scripting the arbiter side)
    pub fn transaction(&mut self, tag: u32, data: &TransactionData) -> &mut Self {
        self.command(tag);
        data.encode(&mut self.buf);
        self
    }

    pub fn free_buffer(&mut self, buffer: u64) -> &mut Self {
        self.command(BC_FREE_BUFFER).put_u64(buffer)
    }

    /// Records carrying a handle: BC_ACQUIRE, BC_RELEASE, BC_INCREFS, BC_DECREFS
    pub fn handle(&mut self, tag: u32, handle: u32) -> &mut Self {
        self.command(tag).put_u32(handle)
    }

    /// Records carrying a (ptr, cookie) pair
    pub fn ptr_cookie(&mut self, tag: u32, ptr: u64, cookie: u64) -> &mut Self {
        self.command(tag).put_u64(ptr).put_u64(cookie)
    }

    /// Records carrying a packed (handle, cookie) pair
    pub fn handle_cookie(&mut self, tag: u32, handle: u32, cookie: u64) -> &mut Self {
        self.command(tag).put_u32(handle).put_u64(cookie)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// One parsed BR_* record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Return {
    Noop,
    Ok,
    Finished,
    TransactionComplete,
    IncRefs { ptr: u64, cookie: u64 },
    Acquire { ptr: u64, cookie: u64 },
    Release { ptr: u64, cookie: u64 },
    DecRefs { ptr: u64, cookie: u64 },
    AttemptAcquire { ptr: u64, cookie: u64 },
    AcquireResult(i32),
    SpawnLooper,
    Transaction(TransactionData),
    Reply(TransactionData),
    DeadBinder { cookie: u64 },
    ClearDeathNotificationDone { cookie: u64 },
    FailedReply,
    DeadReply,
    Error(i32),
    Unknown(u32),
}

/// Walks a BR_* return stream record by record
pub struct ReturnReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ReturnReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet parsed
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn decode(tag: u32, payload: &[u8]) -> Return {
        match tag {
            BR_NOOP => Return::Noop,
            BR_OK => Return::Ok,
            BR_FINISHED => Return::Finished,
            BR_TRANSACTION_COMPLETE => Return::TransactionComplete,
            BR_INCREFS => Return::IncRefs { ptr: get_u64(payload, 0), cookie: get_u64(payload, 8) },
            BR_ACQUIRE => Return::Acquire { ptr: get_u64(payload, 0), cookie: get_u64(payload, 8) },
            BR_RELEASE => Return::Release { ptr: get_u64(payload, 0), cookie: get_u64(payload, 8) },
            BR_DECREFS => Return::DecRefs { ptr: get_u64(payload, 0), cookie: get_u64(payload, 8) },
            BR_ATTEMPT_ACQUIRE => Return::AttemptAcquire {
                ptr: get_u64(payload, 8),
                cookie: get_u64(payload, 16),
            },
            BR_ACQUIRE_RESULT => Return::AcquireResult(get_u32(payload, 0) as i32),
            BR_SPAWN_LOOPER => Return::SpawnLooper,
            BR_DEAD_BINDER => Return::DeadBinder { cookie: get_u64(payload, 0) },
            BR_CLEAR_DEATH_NOTIFICATION_DONE => {
                Return::ClearDeathNotificationDone { cookie: get_u64(payload, 0) }
            }
            BR_FAILED_REPLY => Return::FailedReply,
            BR_DEAD_REPLY => Return::DeadReply,
            BR_ERROR => Return::Error(get_u32(payload, 0) as i32),
            // Payload length was checked against ioc_size(tag) by the caller
            BR_TRANSACTION => match TransactionData::decode(payload) {
                Some(data) => Return::Transaction(data),
                None => Return::Unknown(tag),
            },
            BR_REPLY => match TransactionData::decode(payload) {
                Some(data) => Return::Reply(data),
                None => Return::Unknown(tag),
            },
            other => Return::Unknown(other),
        }
    }
}

impl Iterator for ReturnReader<'_> {
    type Item = Result<Return>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining() == 0 {
            return None;
        }
        if self.remaining() < 4 {
            log::error!("protocol: {} trailing bytes in return stream", self.remaining());
            self.pos = self.buf.len();
            return Some(Err(IpcError::Internal));
        }

        let tag = get_u32(self.buf, self.pos);
        let size = ioc_size(tag);
        let start = self.pos + 4;
        if self.buf.len() - start < size {
            log::error!("protocol: truncated record {:#x} ({} of {} bytes)", tag, self.buf.len() - start, size);
            self.pos = self.buf.len();
            return Some(Err(IpcError::Internal));
        }

        self.pos = start + size;
        Some(Ok(Self::decode(tag, &self.buf[start..start + size])))
    }
}
