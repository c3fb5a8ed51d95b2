/*
 * Arbiter Driver Abstraction
 *
 * The transport never touches the character device directly. Everything
 * goes through the `Driver` trait, which mirrors the three ioctls the
 * protocol needs plus access to the mapped receive region.
 *
 * Implementations:
 * - `binder::BinderDevice`: the real device file (open/mmap/ioctl via libc)
 * - test drivers that script the arbiter's side of the conversation
 */

pub mod binder;
pub mod numbers;

pub use binder::BinderDevice;

use crate::ipc::error::Result;

/// Bytes consumed by one write/read round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteRead {
    pub write_consumed: usize,
    pub read_consumed: usize,
}

/// Kernel arbiter device
///
/// `write_read` performs a single BINDER_WRITE_READ: the arbiter consumes
/// `write` first, then (if `read` is non-empty) blocks until at least one
/// return record is available and fills `read` with whole records.
pub trait Driver: Send + Sync {
    /// One write/read round trip with the arbiter
    fn write_read(&self, write: &[u8], read: &mut [u8]) -> Result<WriteRead>;

    /// Configure the maximum number of looper threads the arbiter may request
    fn set_max_threads(&self, count: u32) -> Result<()>;

    /// Protocol version spoken by the arbiter
    fn version(&self) -> Result<i32> {
        Ok(numbers::CURRENT_PROTOCOL_VERSION)
    }

    /// Copy `len` bytes of a kernel-owned buffer out of the receive region
    ///
    /// Fails with `InvalidArgument` if the range is not inside the region.
    fn read_buffer(&self, ptr: u64, len: usize) -> Result<Vec<u8>>;

    /// Wake blocked readers; called once when the channel closes
    fn shutdown(&self) {}
}
