/*
 * Arbiter Protocol Numbers
 *
 * This module defines the command and return tags understood by the
 * kernel IPC arbiter, encoded the same way the Linux binder uapi header
 * encodes them (_IO/_IOW/_IOR over the 'c', 'r' and 'b' types).
 *
 * Command Mechanism:
 * - Every record in a write or read buffer starts with a u32 tag
 * - The tag carries its payload size in bits [16:29] (_IOC_SIZE)
 * - Payload follows the tag immediately, native endian
 *
 * Why these numbers:
 * - Bit-exact compatibility with the 64-bit binder protocol (version 8)
 * - The payload size can be recovered from any tag, so unknown records
 *   can still be skipped while parsing
 */

// ioctl encoding (asm-generic/ioctl.h)
const IOC_NRSHIFT: u32 = 0;
const IOC_TYPESHIFT: u32 = 8;
const IOC_SIZESHIFT: u32 = 16;
const IOC_DIRSHIFT: u32 = 30;
const IOC_SIZEMASK: u32 = 0x3fff;

const IOC_NONE: u32 = 0;
const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

const fn ioc(dir: u32, ty: u8, nr: u32, size: usize) -> u32 {
    (dir << IOC_DIRSHIFT) | ((ty as u32) << IOC_TYPESHIFT) | (nr << IOC_NRSHIFT) | ((size as u32) << IOC_SIZESHIFT)
}

const fn io(ty: u8, nr: u32) -> u32 {
    ioc(IOC_NONE, ty, nr, 0)
}

const fn iow(ty: u8, nr: u32, size: usize) -> u32 {
    ioc(IOC_WRITE, ty, nr, size)
}

const fn ior(ty: u8, nr: u32, size: usize) -> u32 {
    ioc(IOC_READ, ty, nr, size)
}

const fn iowr(ty: u8, nr: u32, size: usize) -> u32 {
    ioc(IOC_READ | IOC_WRITE, ty, nr, size)
}

/// Payload size carried by a command or return tag
#[inline]
pub const fn ioc_size(tag: u32) -> usize {
    ((tag >> IOC_SIZESHIFT) & IOC_SIZEMASK) as usize
}

/// Record payload sizes (64-bit binder_uintptr_t layout)
pub const TRANSACTION_DATA_SIZE: usize = 64;
pub const PTR_COOKIE_SIZE: usize = 16;
pub const HANDLE_COOKIE_SIZE: usize = 12; // packed: u32 handle + u64 cookie
pub const PRI_PTR_COOKIE_SIZE: usize = 24;
pub const WRITE_READ_SIZE: usize = 48;
pub const FLAT_OBJECT_SIZE: usize = 24;

/// Protocol version expected from BINDER_VERSION
pub const CURRENT_PROTOCOL_VERSION: i32 = 8;

/// ioctl requests on the device file
pub const BINDER_WRITE_READ: u32 = iowr(b'b', 1, WRITE_READ_SIZE);
pub const BINDER_SET_MAX_THREADS: u32 = iow(b'b', 5, 4);
pub const BINDER_VERSION: u32 = iowr(b'b', 9, 4);

/// Commands sent to the arbiter (BC_*)
pub const BC_TRANSACTION: u32 = iow(b'c', 0, TRANSACTION_DATA_SIZE);
pub const BC_REPLY: u32 = iow(b'c', 1, TRANSACTION_DATA_SIZE);
pub const BC_FREE_BUFFER: u32 = iow(b'c', 3, 8);
pub const BC_INCREFS: u32 = iow(b'c', 4, 4);
pub const BC_ACQUIRE: u32 = iow(b'c', 5, 4);
pub const BC_RELEASE: u32 = iow(b'c', 6, 4);
pub const BC_DECREFS: u32 = iow(b'c', 7, 4);
pub const BC_INCREFS_DONE: u32 = iow(b'c', 8, PTR_COOKIE_SIZE);
pub const BC_ACQUIRE_DONE: u32 = iow(b'c', 9, PTR_COOKIE_SIZE);
pub const BC_REGISTER_LOOPER: u32 = io(b'c', 11);
pub const BC_ENTER_LOOPER: u32 = io(b'c', 12);
pub const BC_EXIT_LOOPER: u32 = io(b'c', 13);
pub const BC_REQUEST_DEATH_NOTIFICATION: u32 = iow(b'c', 14, HANDLE_COOKIE_SIZE);
pub const BC_CLEAR_DEATH_NOTIFICATION: u32 = iow(b'c', 15, HANDLE_COOKIE_SIZE);
pub const BC_DEAD_BINDER_DONE: u32 = iow(b'c', 16, 8);

/// Returns read from the arbiter (BR_*)
pub const BR_ERROR: u32 = ior(b'r', 0, 4);
pub const BR_OK: u32 = io(b'r', 1);
pub const BR_TRANSACTION: u32 = ior(b'r', 2, TRANSACTION_DATA_SIZE);
pub const BR_REPLY: u32 = ior(b'r', 3, TRANSACTION_DATA_SIZE);
pub const BR_ACQUIRE_RESULT: u32 = ior(b'r', 4, 4);
pub const BR_DEAD_REPLY: u32 = io(b'r', 5);
pub const BR_TRANSACTION_COMPLETE: u32 = io(b'r', 6);
pub const BR_INCREFS: u32 = ior(b'r', 7, PTR_COOKIE_SIZE);
pub const BR_ACQUIRE: u32 = ior(b'r', 8, PTR_COOKIE_SIZE);
pub const BR_RELEASE: u32 = ior(b'r', 9, PTR_COOKIE_SIZE);
pub const BR_DECREFS: u32 = ior(b'r', 10, PTR_COOKIE_SIZE);
pub const BR_ATTEMPT_ACQUIRE: u32 = ior(b'r', 11, PRI_PTR_COOKIE_SIZE);
pub const BR_NOOP: u32 = io(b'r', 12);
pub const BR_SPAWN_LOOPER: u32 = io(b'r', 13);
pub const BR_FINISHED: u32 = io(b'r', 14);
pub const BR_DEAD_BINDER: u32 = ior(b'r', 15, 8);
pub const BR_CLEAR_DEATH_NOTIFICATION_DONE: u32 = ior(b'r', 16, 8);
pub const BR_FAILED_REPLY: u32 = io(b'r', 17);

/// Flat object types (B_PACK_CHARS(c1, c2, c3, B_TYPE_LARGE))
const fn pack_chars(c1: u8, c2: u8, c3: u8, c4: u8) -> u32 {
    ((c1 as u32) << 24) | ((c2 as u32) << 16) | ((c3 as u32) << 8) | (c4 as u32)
}
const B_TYPE_LARGE: u8 = 0x85;

pub const BINDER_TYPE_BINDER: u32 = pack_chars(b's', b'b', b'*', B_TYPE_LARGE);
pub const BINDER_TYPE_WEAK_BINDER: u32 = pack_chars(b'w', b'b', b'*', B_TYPE_LARGE);
pub const BINDER_TYPE_HANDLE: u32 = pack_chars(b's', b'h', b'*', B_TYPE_LARGE);
pub const BINDER_TYPE_WEAK_HANDLE: u32 = pack_chars(b'w', b'h', b'*', B_TYPE_LARGE);

/// Flat object flags
pub const FLAT_BINDER_FLAG_PRIORITY_MASK: u32 = 0xff;
pub const FLAT_BINDER_FLAG_ACCEPTS_FDS: u32 = 0x100;

/// Maximum size of the mapped receive region
pub const MAX_MAP_SIZE: usize = 4 * 1024 * 1024;

/// POSIX errno values surfaced as negative status codes
pub const EINVAL: i32 = 22; // Invalid argument
pub const EIO: i32 = 5; // I/O error
pub const ENOMEM: i32 = 12; // Out of memory
pub const ENOSPC: i32 = 28; // No space left (fixed capacity exhausted)
pub const EPIPE: i32 = 32; // Broken pipe (peer is gone)
pub const EBADMSG: i32 = 74; // Bad message (failed reply)
pub const EBADF: i32 = 9; // Bad file descriptor
