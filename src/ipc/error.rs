/*
 * IPC Error Types
 *
 * Every transport operation reports failures through `IpcError`.
 * C-style callers that need an integer status use `IpcError::errno()`,
 * which maps each variant to a negative POSIX errno.
 */

use crate::driver::numbers::{EBADMSG, EINVAL, EIO, ENOMEM, ENOSPC, EPIPE};

/// IPC error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcError {
    /// Null/malformed argument, oversized payload, unknown anonymous token
    InvalidArgument,
    /// Device open/mmap/ioctl failure (positive OS errno)
    Driver(i32),
    /// Allocation failure or inconsistent internal state
    Internal,
    /// The peer process owning the target is gone
    DeadObject,
    /// The arbiter could not deliver the transaction or its reply
    Failed,
    /// A fixed-capacity table is full
    CapacityExceeded,
    /// The remote handler answered with a non-zero status code
    Status(i32),
}

impl IpcError {
    /// Negative integer status for this error
    pub fn errno(&self) -> i32 {
        match self {
            IpcError::InvalidArgument => -EINVAL,
            IpcError::Driver(0) => -EIO,
            IpcError::Driver(errno) => errno.checked_abs().map_or(-EIO, |e| -e),
            IpcError::Internal => -ENOMEM,
            IpcError::DeadObject => -EPIPE,
            IpcError::Failed => -EBADMSG,
            IpcError::CapacityExceeded => -ENOSPC,
            IpcError::Status(code) => *code,
        }
    }

    /// Errors after which retrying the same target is pointless
    pub fn is_fatal(&self) -> bool {
        matches!(self, IpcError::DeadObject)
    }

    /// Error from the last failed libc call on this thread
    pub(crate) fn last_os_error() -> Self {
        IpcError::Driver(std::io::Error::last_os_error().raw_os_error().unwrap_or(EIO))
    }
}

impl core::fmt::Display for IpcError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            IpcError::InvalidArgument => write!(f, "Invalid argument"),
            IpcError::Driver(errno) => write!(f, "Driver error (errno {})", errno),
            IpcError::Internal => write!(f, "Internal error"),
            IpcError::DeadObject => write!(f, "Peer object is dead"),
            IpcError::Failed => write!(f, "Transaction failed"),
            IpcError::CapacityExceeded => write!(f, "Capacity exceeded"),
            IpcError::Status(code) => write!(f, "Remote status {}", code),
        }
    }
}

impl std::error::Error for IpcError {}

pub type Result<T> = core::result::Result<T, IpcError>;
