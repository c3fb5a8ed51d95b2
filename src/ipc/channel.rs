/*
 * IPC Channel
 *
 * A channel is this process's connection to the kernel arbiter: the open
 * driver (device fd + mapped receive region) together with the
 * process-wide state every other component works through.
 *
 * Design:
 * - Shared as `Arc<Channel>`; loopers, kernel buffer guards and reply
 *   contexts each hold a reference
 * - Registries (anonymous callbacks, death subscriptions, worker threads)
 *   are owned here, each behind its own lock
 * - The receive region is read-only after setup and needs no lock
 * - `close()` is idempotent: it stops loopers, shuts the driver down
 *   (unmapping and closing the device) and drops the channel's reference
 *   to it; every later command fails with EBADF
 */

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use spin::Mutex;

use crate::config::ChannelConfig;
use crate::driver::numbers::{
    BC_ACQUIRE, BC_CLEAR_DEATH_NOTIFICATION, BC_RELEASE, BC_REQUEST_DEATH_NOTIFICATION,
    CURRENT_PROTOCOL_VERSION, EBADF, EINVAL, MAX_MAP_SIZE,
};
use crate::driver::{BinderDevice, Driver, WriteRead};
use crate::ipc::error::{IpcError, Result};
use crate::ipc::identity::SvcIdentity;
use crate::ipc::io::IpcIo;
use crate::ipc::message::IpcMsg;
use crate::ipc::protocol::{CommandWriter, TransactionData, TransactionFlags};
use crate::ipc::reply::ReplyContext;
use crate::ipc::IpcMsgHandler;
use crate::registry::{CallbackRegistry, DeathRegistry, Subscribed, Unsubscribed, WorkerPool};

pub struct Channel {
    /// Taken by `close`; calls in flight hold their own reference
    driver: Mutex<Option<Arc<dyn Driver>>>,
    config: ChannelConfig,
    pub(crate) callbacks: CallbackRegistry,
    pub(crate) deaths: DeathRegistry,
    pub(crate) workers: WorkerPool,
    /// A process-wide looper is running (or has been requested)
    pub(crate) looper_started: AtomicBool,
    pub(crate) quit: AtomicBool,
    closed: AtomicBool,
    /// Handler of the thread that called `join_work_thread`
    pub(crate) main_handler: Mutex<Option<IpcMsgHandler>>,
    pub(crate) spawned: AtomicUsize,
}

fn check_map_size(map_size: usize) -> Result<()> {
    if map_size == 0 || map_size > MAX_MAP_SIZE {
        log::error!("channel: invalid receive region size {}", map_size);
        return Err(IpcError::InvalidArgument);
    }
    Ok(())
}

impl Channel {
    /// Open the arbiter device described by `config`
    pub fn open(config: ChannelConfig) -> Result<Arc<Self>> {
        check_map_size(config.map_size)?;
        let device = BinderDevice::open(&config.device, config.map_size)?;
        Self::with_driver(Box::new(device), config)
    }

    /// Build a channel over an already opened driver
    pub fn with_driver(driver: Box<dyn Driver>, config: ChannelConfig) -> Result<Arc<Self>> {
        check_map_size(config.map_size)?;
        let version = driver.version()?;
        if version != CURRENT_PROTOCOL_VERSION {
            log::error!("channel: arbiter speaks protocol {} (expected {})", version, CURRENT_PROTOCOL_VERSION);
            return Err(IpcError::Driver(EINVAL));
        }
        driver.set_max_threads(config.max_threads).inspect_err(|e| {
            log::error!("channel: set max threads {} failed: {}", config.max_threads, e);
        })?;

        log::info!(
            "channel: ready on {} ({} byte region, {} max threads)",
            config.device,
            config.map_size,
            config.max_threads
        );
        Ok(Arc::new(Self {
            driver: Mutex::new(Some(Arc::from(driver))),
            config,
            callbacks: CallbackRegistry::new(),
            deaths: DeathRegistry::new(),
            workers: WorkerPool::new(),
            looper_started: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            main_handler: Mutex::new(None),
            spawned: AtomicUsize::new(0),
        }))
    }

    /// Stop loopers and shut the driver down
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.quit.store(true, Ordering::Release);
        let driver = self.driver.lock().take();
        if let Some(driver) = driver {
            driver.shutdown();
        }
        log::info!("channel: closed {}", self.config.device);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    fn driver(&self) -> Result<Arc<dyn Driver>> {
        self.driver.lock().clone().ok_or(IpcError::Driver(EBADF))
    }

    pub(crate) fn write_read(&self, write: &[u8], read: &mut [u8]) -> Result<WriteRead> {
        if self.is_closed() {
            return Err(IpcError::Driver(EBADF));
        }
        self.driver()?.write_read(write, read)
    }

    pub(crate) fn read_buffer(&self, ptr: u64, len: usize) -> Result<Vec<u8>> {
        self.driver()?.read_buffer(ptr, len)
    }

    /// Hand a command stream to the arbiter without reading anything back
    pub fn write(&self, cmd: &CommandWriter) -> Result<()> {
        if cmd.is_empty() {
            return Ok(());
        }
        let done = self.write_read(cmd.as_bytes(), &mut [])?;
        if done.write_consumed < cmd.len() {
            log::error!("channel: arbiter consumed {} of {} command bytes", done.write_consumed, cmd.len());
            return Err(IpcError::Internal);
        }
        Ok(())
    }

    /// BC_TRANSACTION / BC_REPLY pointing at `wire`
    pub(crate) fn write_transaction(&self, tag: u32, target: u64, code: u32, flags: TransactionFlags, wire: &IpcIo) -> Result<()> {
        let record = TransactionData {
            target,
            code,
            flags,
            data_size: wire.len() as u64,
            offsets_size: (wire.offsets().len() * core::mem::size_of::<u64>()) as u64,
            buffer: wire.data().as_ptr() as u64,
            offsets: wire.offsets().as_ptr() as u64,
            ..Default::default()
        };
        let mut cmd = CommandWriter::new();
        cmd.transaction(tag, &record);
        self.write(&cmd)
    }

    /// Release a received message's kernel buffer now
    pub fn free_buffer(&self, msg: &mut IpcMsg) -> Result<()> {
        msg.free_buffer()
    }

    /// Register an anonymous in-process service
    pub fn register_callback<F>(&self, handler: F) -> SvcIdentity
    where
        F: Fn(&mut ReplyContext, IpcMsg, &mut IpcIo) -> i32 + Send + Sync + 'static,
    {
        self.callbacks.register(Arc::new(handler))
    }

    /// Remove an anonymous service; unknown identities are ignored
    pub fn unregister_callback(&self, svc: &SvcIdentity) {
        if !self.callbacks.unregister(svc) {
            log::debug!("channel: unregister of unknown service {}", svc);
        }
    }

    /// Run `handler` when the process behind `target` dies
    ///
    /// Returns the slot id to pass to `unregister_death_callback`.
    pub fn register_death_callback<F>(&self, target: &SvcIdentity, handler: F) -> Result<usize>
    where
        F: Fn(&mut ReplyContext, IpcMsg, &mut IpcIo) -> i32 + Send + Sync + 'static,
    {
        if target.is_local() {
            log::warn!("channel: death notification requested for local {}", target);
            return Err(IpcError::InvalidArgument);
        }

        match self.deaths.register(target.handle, Arc::new(handler))? {
            Subscribed::Existing { slot } => Ok(slot),
            Subscribed::New { slot, cookie } => {
                let mut cmd = CommandWriter::new();
                cmd.handle_cookie(BC_REQUEST_DEATH_NOTIFICATION, target.handle, cookie);
                if let Err(e) = self.write(&cmd) {
                    log::error!("channel: death notification request for {} failed: {}", target, e);
                    self.deaths.discard(target.handle);
                    return Err(e);
                }
                Ok(slot)
            }
        }
    }

    pub fn unregister_death_callback(&self, target: &SvcIdentity, slot: usize) -> Result<()> {
        match self.deaths.unregister(target.handle, slot) {
            Unsubscribed::Cleared | Unsubscribed::Deferred => Ok(()),
            Unsubscribed::Unknown => Err(IpcError::InvalidArgument),
            Unsubscribed::Emptied { cookie } => {
                let mut cmd = CommandWriter::new();
                cmd.handle_cookie(BC_CLEAR_DEATH_NOTIFICATION, target.handle, cookie);
                self.write(&cmd)
            }
        }
    }

    /// Take a strong reference on a remote handle
    pub fn acquire(&self, svc: &SvcIdentity) -> Result<()> {
        self.ref_command(BC_ACQUIRE, svc)
    }

    /// Drop a strong reference taken with `acquire`
    pub fn release(&self, svc: &SvcIdentity) -> Result<()> {
        self.ref_command(BC_RELEASE, svc)
    }

    fn ref_command(&self, tag: u32, svc: &SvcIdentity) -> Result<()> {
        if svc.is_local() {
            return Err(IpcError::InvalidArgument);
        }
        let mut cmd = CommandWriter::new();
        cmd.handle(tag, svc.handle);
        self.write(&cmd)
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}
