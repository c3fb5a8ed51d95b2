/*
 * Wire Codec (IpcIo)
 *
 * `IpcIo` is the flat payload of one transaction: a byte buffer plus a
 * parallel offsets array marking where embedded objects (service
 * identities) sit inside the buffer, so the arbiter can translate them.
 *
 * Encoding rules:
 * - Native endian, every item padded to IPC_IO_ALIGN (4) bytes
 * - Strings and flat blobs are u32 length-prefixed
 * - Service identities are flat objects recorded in the offsets array,
 *   except the null identity which is never listed
 *
 * Transport header (written by the call engine, stripped before a handler
 * or caller sees the cursor):
 * - Offset 0-7:   leading token (u64)
 * - Offset 8-31:  target identity (flat object)
 *
 * A cursor must pass `validate()` before it is sent: total size (bytes
 * plus 8 per offset) may not exceed MAX_IO_SIZE. Bigger payloads need an
 * out-of-band bulk path.
 */

use bitflags::bitflags;

use crate::driver::numbers::BINDER_TYPE_BINDER;
use crate::ipc::error::{IpcError, Result};
use crate::ipc::identity::SvcIdentity;
use crate::ipc::message::IpcMsg;
use crate::ipc::protocol::FlatObject;

/// Maximum inline transaction size (data bytes + offsets array)
pub const MAX_IO_SIZE: usize = 8192;

/// Alignment unit of every pushed item
pub const IPC_IO_ALIGN: usize = 4;

/// Upper bound on embedded objects in one payload
pub const MAX_IO_OBJECTS: usize = MAX_IO_SIZE / FlatObject::SIZE;

/// Leading token plus target identity
pub const IPC_IO_HEADER_SIZE: usize = 8 + FlatObject::SIZE;

const OFFSET_ENTRY_SIZE: usize = core::mem::size_of::<u64>();

bitflags! {
    /// Cursor state flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IoFlags: u8 {
        /// A push did not fit; the cursor must not be sent
        const OVERFLOW = 0x01;
        /// At least one object is listed in the offsets array
        const OBJECTS = 0x02;
    }
}

#[inline]
const fn align(len: usize) -> usize {
    (len + IPC_IO_ALIGN - 1) & !(IPC_IO_ALIGN - 1)
}

/// Transaction payload cursor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcIo {
    data: Vec<u8>,
    capacity: usize,
    pos: usize,
    offsets: Vec<u64>,
    offsets_pos: usize,
    flag: IoFlags,
}

impl IpcIo {
    /// Empty cursor accepting up to `capacity` data bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity.min(MAX_IO_SIZE)),
            capacity,
            pos: 0,
            offsets: Vec::new(),
            offsets_pos: 0,
            flag: IoFlags::empty(),
        }
    }

    /// Read cursor over an already encoded payload
    pub fn from_raw(data: Vec<u8>, offsets: Vec<u64>) -> Self {
        let flag = if offsets.is_empty() { IoFlags::empty() } else { IoFlags::OBJECTS };
        Self {
            capacity: data.len(),
            data,
            pos: 0,
            offsets,
            offsets_pos: 0,
            flag,
        }
    }

    /// Read cursor over a received message, positioned after the header
    ///
    /// Death notices carry no payload and yield an empty cursor.
    pub fn from_message(msg: &IpcMsg) -> Result<Self> {
        if msg.data.is_empty() {
            return Ok(Self::from_raw(Vec::new(), Vec::new()));
        }
        let mut io = Self::from_raw(msg.data.clone(), msg.offsets.clone());
        io.pop_header().ok_or(IpcError::Internal)?;
        Ok(io)
    }

    /// Wire form of `payload`: transport header followed by the payload
    pub(crate) fn with_header(token: usize, target: &SvcIdentity, payload: &IpcIo) -> Result<Self> {
        let mut wire = IpcIo::new(IPC_IO_HEADER_SIZE + payload.data.len());
        wire.push_u64(token as u64)?;
        wire.push_svc(target)?;

        let base = wire.data.len() as u64;
        wire.data.extend_from_slice(&payload.data);
        wire.offsets.extend(payload.offsets.iter().map(|off| off + base));
        wire.flag |= payload.flag & IoFlags::OBJECTS;
        Ok(wire)
    }

    /// Decode the transport header, leaving the cursor on the payload
    pub(crate) fn pop_header(&mut self) -> Option<(usize, SvcIdentity)> {
        let token = self.pop_u64()? as usize;
        let target = self.pop_svc()?;
        Some((token, target))
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn offsets(&self) -> &[u64] {
        &self.offsets
    }

    pub fn flags(&self) -> IoFlags {
        self.flag
    }

    /// Encoded data bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Data bytes not yet popped
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    /// Bytes this payload occupies in a transaction (data + offsets array)
    pub fn total_size(&self) -> usize {
        self.data.len() + self.offsets.len() * OFFSET_ENTRY_SIZE
    }

    /// Cursor is consistent and no push overflowed
    pub fn available(&self) -> bool {
        !self.flag.contains(IoFlags::OVERFLOW)
            && self.pos <= self.data.len()
            && self.offsets_pos <= self.offsets.len()
            && self.data.len() <= self.capacity
    }

    /// Mandatory check before a payload is handed to the arbiter
    pub fn validate(&self) -> Result<()> {
        if !self.available() {
            log::warn!("ipc_io: cursor unusable (flags {:?})", self.flag);
            return Err(IpcError::InvalidArgument);
        }
        if self.total_size() > MAX_IO_SIZE {
            log::warn!("ipc_io: {} bytes exceeds max transaction size {}", self.total_size(), MAX_IO_SIZE);
            return Err(IpcError::InvalidArgument);
        }
        for &off in &self.offsets {
            let in_bounds = usize::try_from(off)
                .ok()
                .and_then(|start| start.checked_add(FlatObject::SIZE))
                .is_some_and(|end| end <= self.data.len());
            if off % IPC_IO_ALIGN as u64 != 0 || !in_bounds {
                log::warn!("ipc_io: object offset {} out of bounds", off);
                return Err(IpcError::InvalidArgument);
            }
        }
        Ok(())
    }

    /// Restart reading from the beginning
    pub fn rewind(&mut self) {
        self.pos = 0;
        self.offsets_pos = 0;
    }

    pub(crate) fn into_parts(self) -> (Vec<u8>, Vec<u64>) {
        (self.data, self.offsets)
    }

    fn reserve(&mut self, len: usize) -> Result<usize> {
        let padded = align(len);
        if self.data.len() + padded > self.capacity {
            self.flag |= IoFlags::OVERFLOW;
            return Err(IpcError::CapacityExceeded);
        }
        let start = self.data.len();
        self.data.resize(start + padded, 0);
        Ok(start)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let start = self.reserve(bytes.len())?;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn take(&mut self, len: usize) -> Option<&[u8]> {
        let padded = align(len);
        if padded > self.remaining() {
            return None;
        }
        let start = self.pos;
        self.pos += padded;
        Some(&self.data[start..start + len])
    }

    pub fn push_u32(&mut self, value: u32) -> Result<()> {
        self.write(&value.to_ne_bytes())
    }

    pub fn push_i32(&mut self, value: i32) -> Result<()> {
        self.write(&value.to_ne_bytes())
    }

    pub fn push_u64(&mut self, value: u64) -> Result<()> {
        self.write(&value.to_ne_bytes())
    }

    pub fn push_i64(&mut self, value: i64) -> Result<()> {
        self.write(&value.to_ne_bytes())
    }

    pub fn push_bool(&mut self, value: bool) -> Result<()> {
        self.push_u32(value as u32)
    }

    /// Length-prefixed blob
    pub fn push_flat_obj(&mut self, bytes: &[u8]) -> Result<()> {
        let len = u32::try_from(bytes.len()).map_err(|_| IpcError::InvalidArgument)?;
        if self.data.len() + 4 + align(bytes.len()) > self.capacity {
            self.flag |= IoFlags::OVERFLOW;
            return Err(IpcError::CapacityExceeded);
        }
        self.push_u32(len)?;
        self.write(bytes)
    }

    pub fn push_string(&mut self, value: &str) -> Result<()> {
        self.push_flat_obj(value.as_bytes())
    }

    /// Embed a service identity, listing it in the offsets array
    pub fn push_svc(&mut self, svc: &SvcIdentity) -> Result<()> {
        let start = self.reserve(FlatObject::SIZE)?;
        let obj = if svc.is_null() {
            FlatObject { kind: BINDER_TYPE_BINDER, ..Default::default() }
        } else {
            svc.to_flat()
        };
        obj.encode(&mut self.data[start..start + FlatObject::SIZE]);
        if !svc.is_null() {
            self.offsets.push(start as u64);
            self.flag |= IoFlags::OBJECTS;
        }
        Ok(())
    }

    pub fn pop_u32(&mut self) -> Option<u32> {
        let bytes = self.take(4)?;
        Some(u32::from_ne_bytes(bytes.try_into().ok()?))
    }

    pub fn pop_i32(&mut self) -> Option<i32> {
        self.pop_u32().map(|v| v as i32)
    }

    pub fn pop_u64(&mut self) -> Option<u64> {
        let bytes = self.take(8)?;
        Some(u64::from_ne_bytes(bytes.try_into().ok()?))
    }

    pub fn pop_i64(&mut self) -> Option<i64> {
        self.pop_u64().map(|v| v as i64)
    }

    pub fn pop_bool(&mut self) -> Option<bool> {
        self.pop_u32().map(|v| v != 0)
    }

    pub fn pop_flat_obj(&mut self) -> Option<Vec<u8>> {
        let start = self.pos;
        let len = self.pop_u32()? as usize;
        match self.take(len) {
            Some(bytes) => Some(bytes.to_vec()),
            None => {
                self.pos = start;
                None
            }
        }
    }

    pub fn pop_string(&mut self) -> Option<String> {
        let start = self.pos;
        let bytes = self.pop_flat_obj()?;
        match String::from_utf8(bytes) {
            Ok(value) => Some(value),
            Err(_) => {
                self.pos = start;
                None
            }
        }
    }

    /// Decode an embedded identity
    ///
    /// The object must be the next entry of the offsets array, unless it is
    /// the null identity (which is never listed).
    pub fn pop_svc(&mut self) -> Option<SvcIdentity> {
        let start = self.pos;
        let obj = FlatObject::decode(self.take(FlatObject::SIZE)?)?;

        let listed = self.offsets.get(self.offsets_pos) == Some(&(start as u64));
        if listed {
            self.offsets_pos += 1;
        } else if obj.is_null() {
            return Some(SvcIdentity::NULL);
        } else {
            log::warn!("ipc_io: object at {} missing from offsets", start);
            self.pos = start;
            return None;
        }

        match SvcIdentity::from_flat(&obj) {
            Some(svc) => Some(svc),
            None => {
                self.pos = start;
                self.offsets_pos -= 1;
                None
            }
        }
    }
}

impl Default for IpcIo {
    fn default() -> Self {
        Self::new(MAX_IO_SIZE)
    }
}
