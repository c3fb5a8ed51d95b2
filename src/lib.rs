/*
 * liteipc - User-Space IPC Transport
 *
 * This crate is the protocol engine between service code and the kernel
 * IPC arbiter (a binder-style character device). It lets processes on one
 * device call operations on services hosted by other processes.
 *
 * Key features:
 * - Two-way (request/reply) and one-way transactions
 * - Anonymous in-process services answered without a kernel round trip
 * - Death notification when the process behind a remote handle exits
 * - Looper threads spawned on the arbiter's request
 * - Reference counting of remote handles through the arbiter
 *
 * Process-wide usage:
 *   let channel = liteipc::open()?;
 *   let svc = channel.register_callback(handler);
 *   channel.join_work_thread(handler)?;
 *   liteipc::close();
 *
 * `open` creates the channel on first use and counts references; the
 * last `close` tears it down.
 */

use std::sync::Arc;

use spin::Mutex;

pub mod config;
pub mod driver;
pub mod ipc;
pub mod registry;
pub mod utils;

#[cfg(test)]
mod tests;

pub use config::ChannelConfig;
pub use ipc::{
    Channel, IoFlags, IpcError, IpcIo, IpcMsg, IpcMsgHandler, MsgType, ReplyContext, Result,
    SvcIdentity, TransactionFlags, handler,
};

/// Process-wide channel and its open count
static GLOBAL: Mutex<Option<(Arc<Channel>, usize)>> = Mutex::new(None);

/// Open (or share) the process-wide channel with the default configuration
pub fn open() -> Result<Arc<Channel>> {
    open_with(&config::DEFAULT_CONFIG)
}

/// Open (or share) the process-wide channel
///
/// `config` only applies when this call creates the channel.
pub fn open_with(config: &ChannelConfig) -> Result<Arc<Channel>> {
    open_shared(|| Channel::open(config.clone()))
}

/// Share the installed channel, or install the one `create` builds
///
/// `create` runs without the lock held; if another thread installed a
/// channel meanwhile, that one is shared and the new one is closed.
fn open_shared<F>(create: F) -> Result<Arc<Channel>>
where
    F: FnOnce() -> Result<Arc<Channel>>,
{
    if let Some(channel) = share(&mut GLOBAL.lock()) {
        return Ok(channel);
    }
    let channel = create()?;

    let mut global = GLOBAL.lock();
    if let Some(existing) = share(&mut global) {
        drop(global);
        log::debug!("liteipc: channel opened concurrently, sharing the installed one");
        channel.close();
        return Ok(existing);
    }
    *global = Some((Arc::clone(&channel), 1));
    Ok(channel)
}

fn share(global: &mut Option<(Arc<Channel>, usize)>) -> Option<Arc<Channel>> {
    let (channel, count) = global.as_mut()?;
    *count += 1;
    Some(Arc::clone(channel))
}

/// Drop one reference to the process-wide channel
///
/// Closing without a matching `open` is a no-op.
pub fn close() {
    let mut global = GLOBAL.lock();
    let last = match global.as_mut() {
        Some((_, count)) if *count > 1 => {
            *count -= 1;
            false
        }
        Some(_) => true,
        None => false,
    };
    if last {
        if let Some((channel, _)) = global.take() {
            channel.close();
        }
    }
}

/// The process-wide channel, if open
pub fn current() -> Option<Arc<Channel>> {
    GLOBAL.lock().as_ref().map(|(channel, _)| Arc::clone(channel))
}
