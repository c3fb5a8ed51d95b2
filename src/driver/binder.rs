/*
 * Binder Character Device
 *
 * Production `Driver` backed by the arbiter's device file.
 *
 * Setup order (unwound in reverse on failure):
 * 1. open(2) the device            -> OwnedFd closes it on drop
 * 2. BINDER_VERSION sanity check
 * 3. mmap(2) the receive region    -> Mapping unmaps it on drop
 *
 * Field order in `OpenDevice` matters: the mapping is declared before
 * the file descriptor so it is dropped (unmapped) first.
 *
 * `shutdown` releases both at once. Calls already inside the kernel keep
 * the state alive until they return; every later call fails with EBADF.
 */

use std::ffi::CString;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Arc;

use spin::Mutex;

use super::numbers::{
    BINDER_SET_MAX_THREADS, BINDER_VERSION, BINDER_WRITE_READ, CURRENT_PROTOCOL_VERSION, EBADF,
    EINVAL, MAX_MAP_SIZE,
};
use super::{Driver, WriteRead};
use crate::ipc::error::{IpcError, Result};

/// struct binder_write_read
#[repr(C)]
#[derive(Default)]
struct BinderWriteRead {
    write_size: u64,
    write_consumed: u64,
    write_buffer: u64,
    read_size: u64,
    read_consumed: u64,
    read_buffer: u64,
}

/// Read-only mapping of the receive region
struct Mapping {
    addr: *mut libc::c_void,
    len: usize,
}

// The region is written only by the kernel and never mutated from user space
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    fn contains(&self, ptr: u64, len: usize) -> bool {
        let base = self.addr as u64;
        let Some(end) = ptr.checked_add(len as u64) else {
            return false;
        };
        ptr >= base && end <= base + self.len as u64
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.addr, self.len);
        }
    }
}

/// Device file with its mapped receive region
struct OpenDevice {
    mapping: Mapping,
    fd: OwnedFd,
}

/// Arbiter device; empty once shut down
pub struct BinderDevice {
    state: Mutex<Option<Arc<OpenDevice>>>,
}

impl BinderDevice {
    /// Open `path` and map `map_size` bytes of receive region
    ///
    /// Rejects a zero or oversized region before touching the device.
    pub fn open(path: &str, map_size: usize) -> Result<Self> {
        if map_size == 0 || map_size > MAX_MAP_SIZE {
            log::error!("binder: invalid map size {}", map_size);
            return Err(IpcError::InvalidArgument);
        }
        let c_path = CString::new(path).map_err(|_| IpcError::InvalidArgument)?;

        let raw = unsafe { libc::open(c_path.as_ptr(), libc::O_RDWR | libc::O_CLOEXEC) };
        if raw < 0 {
            let err = IpcError::last_os_error();
            log::error!("binder: open {} failed: {}", path, err);
            return Err(err);
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut version: i32 = 0;
        let ret = unsafe { libc::ioctl(fd.as_raw_fd(), BINDER_VERSION as _, &mut version as *mut i32) };
        if ret < 0 {
            let err = IpcError::last_os_error();
            log::error!("binder: version query failed: {}", err);
            return Err(err);
        }
        if version != CURRENT_PROTOCOL_VERSION {
            log::error!(
                "binder: protocol version {} (expected {})",
                version,
                CURRENT_PROTOCOL_VERSION
            );
            return Err(IpcError::Driver(EINVAL));
        }

        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_size,
                libc::PROT_READ,
                libc::MAP_PRIVATE | libc::MAP_NORESERVE,
                fd.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            let err = IpcError::last_os_error();
            log::error!("binder: mmap of {} bytes failed: {}", map_size, err);
            return Err(err);
        }

        log::info!("binder: opened {} with {} byte receive region", path, map_size);
        Ok(Self::from_parts(fd, Mapping { addr, len: map_size }))
    }

    fn from_parts(fd: OwnedFd, mapping: Mapping) -> Self {
        Self { state: Mutex::new(Some(Arc::new(OpenDevice { mapping, fd }))) }
    }

    fn state(&self) -> Result<Arc<OpenDevice>> {
        self.state.lock().clone().ok_or(IpcError::Driver(EBADF))
    }
}

impl Driver for BinderDevice {
    fn write_read(&self, write: &[u8], read: &mut [u8]) -> Result<WriteRead> {
        let dev = self.state()?;
        let mut bwr = BinderWriteRead {
            write_size: write.len() as u64,
            write_buffer: write.as_ptr() as u64,
            read_size: read.len() as u64,
            read_buffer: read.as_mut_ptr() as u64,
            ..Default::default()
        };

        loop {
            let ret = unsafe { libc::ioctl(dev.fd.as_raw_fd(), BINDER_WRITE_READ as _, &mut bwr as *mut BinderWriteRead) };
            if ret >= 0 {
                break;
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                return Err(IpcError::Driver(err.raw_os_error().unwrap_or(EINVAL)));
            }
        }

        Ok(WriteRead {
            write_consumed: bwr.write_consumed as usize,
            read_consumed: bwr.read_consumed as usize,
        })
    }

    fn set_max_threads(&self, count: u32) -> Result<()> {
        let dev = self.state()?;
        let mut count = count;
        let ret = unsafe { libc::ioctl(dev.fd.as_raw_fd(), BINDER_SET_MAX_THREADS as _, &mut count as *mut u32) };
        if ret < 0 {
            return Err(IpcError::last_os_error());
        }
        Ok(())
    }

    fn version(&self) -> Result<i32> {
        let dev = self.state()?;
        let mut version: i32 = 0;
        let ret = unsafe { libc::ioctl(dev.fd.as_raw_fd(), BINDER_VERSION as _, &mut version as *mut i32) };
        if ret < 0 {
            return Err(IpcError::last_os_error());
        }
        Ok(version)
    }

    fn read_buffer(&self, ptr: u64, len: usize) -> Result<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let dev = self.state()?;
        if !dev.mapping.contains(ptr, len) {
            log::error!("binder: buffer {:#x}+{} outside receive region", ptr, len);
            return Err(IpcError::InvalidArgument);
        }
        // Range checked against the live mapping above
        let bytes = unsafe { std::slice::from_raw_parts(ptr as *const u8, len) };
        Ok(bytes.to_vec())
    }

    fn shutdown(&self) {
        let Some(dev) = self.state.lock().take() else {
            return;
        };
        // Closing any descriptor of the device flushes it, waking blocked loopers
        let dup = unsafe { libc::fcntl(dev.fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, 0) };
        if dup >= 0 {
            unsafe {
                libc::close(dup);
            }
        } else {
            log::warn!("binder: flush on shutdown failed: {}", IpcError::last_os_error());
        }
        log::info!("binder: device released");
    }
}
