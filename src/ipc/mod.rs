/*
 * IPC Transport
 *
 * User-space protocol engine for the kernel IPC arbiter:
 * - protocol: BC_/BR_ record formats and stream helpers
 * - io:       payload codec (IpcIo)
 * - channel:  driver ownership, registries, lifecycle
 * - looper:   dispatch loop and wait loops
 * - call:     request issuance
 * - reply:    reply routing (kernel or in-process redirect)
 */

use std::sync::Arc;

pub mod call;
pub mod channel;
pub mod error;
pub mod identity;
pub mod io;
pub mod looper;
pub mod message;
pub mod protocol;
pub mod reply;

pub use channel::Channel;
pub use error::{IpcError, Result};
pub use identity::SvcIdentity;
pub use io::{IoFlags, IpcIo, MAX_IO_SIZE};
pub use message::{IpcMsg, MsgType};
pub use protocol::TransactionFlags;
pub use reply::ReplyContext;

/// Service handler: returns 0 on success or a status code
///
/// Two-way requests that return without calling `send_reply` are answered
/// with the returned value as a status-only reply.
pub type IpcMsgHandler = Arc<dyn Fn(&mut ReplyContext, IpcMsg, &mut IpcIo) -> i32 + Send + Sync>;

/// Box a closure as an `IpcMsgHandler`
pub fn handler<F>(f: F) -> IpcMsgHandler
where
    F: Fn(&mut ReplyContext, IpcMsg, &mut IpcIo) -> i32 + Send + Sync + 'static,
{
    Arc::new(f)
}
