// Echo service: answers requests on the process-wide looper
//
// Operations:
//   ECHO=1     reply with the request payload (u32 + string)
//   COUNT=2    reply with the number of requests served so far
//   WATCH=3    subscribe to the death of the remote service sent in the payload

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use liteipc::{Channel, IpcIo, IpcMsg, ReplyContext, TransactionFlags};
use log::LevelFilter;

const OP_ECHO: u32 = 1;
const OP_COUNT: u32 = 2;
const OP_WATCH: u32 = 3;

const EINVAL: i32 = -22;

struct EchoServer {
    channel: Arc<Channel>,
    served: AtomicU32,
}

impl EchoServer {
    fn new(channel: Arc<Channel>) -> Self {
        Self { channel, served: AtomicU32::new(0) }
    }

    fn handle_request(&self, ctx: &mut ReplyContext, mut msg: IpcMsg, io: &mut IpcIo) -> i32 {
        let served = self.served.fetch_add(1, Ordering::Relaxed) + 1;
        log::debug!("[echo] code {} from pid {} uid {}", msg.code(), msg.calling_pid(), msg.calling_uid());

        let mut reply = IpcIo::default();
        let built = match msg.code() {
            OP_ECHO => Self::handle_echo(io, &mut reply),
            OP_COUNT => reply.push_u32(served).is_ok(),
            OP_WATCH => return self.handle_watch(io),
            other => {
                log::warn!("[echo] unknown operation {}", other);
                return EINVAL;
            }
        };
        if !built {
            return EINVAL;
        }
        if !ctx.expects_reply() {
            return 0;
        }
        match ctx.send_reply(&mut msg, &reply) {
            Ok(()) => 0,
            Err(e) => e.errno(),
        }
    }

    fn handle_echo(io: &mut IpcIo, reply: &mut IpcIo) -> bool {
        let (Some(value), Some(text)) = (io.pop_u32(), io.pop_string()) else {
            return false;
        };
        reply.push_u32(value).is_ok() && reply.push_string(&text).is_ok()
    }

    fn handle_watch(&self, io: &mut IpcIo) -> i32 {
        let Some(peer) = io.pop_svc() else {
            return EINVAL;
        };
        let result = self.channel.register_death_callback(&peer, move |_, _, _| {
            log::info!("[echo] watched service {} died", peer);
            0
        });
        match result {
            Ok(slot) => {
                log::info!("[echo] watching {} (slot {})", peer, slot);
                0
            }
            Err(e) => e.errno(),
        }
    }
}

/// Exercise the in-process path before serving remote callers
fn self_test(channel: &Arc<Channel>, server: &Arc<EchoServer>) -> liteipc::Result<()> {
    let local = {
        let server = server.clone();
        channel.register_callback(move |ctx, msg, io| server.handle_request(ctx, msg, io))
    };

    let mut request = IpcIo::default();
    request.push_u32(7)?;
    request.push_string("ping")?;
    let reply = channel.send_request(&local, OP_ECHO, &request, TransactionFlags::empty())?;
    channel.unregister_callback(&local);

    let mut reply = reply.ok_or(liteipc::IpcError::Internal)?;
    match (reply.pop_u32(), reply.pop_string()) {
        (Some(7), Some(text)) if text == "ping" => {
            log::info!("[echo] self test passed");
            Ok(())
        }
        other => {
            log::error!("[echo] self test got {:?}", other);
            Err(liteipc::IpcError::Internal)
        }
    }
}

fn main() {
    if let Err(e) = liteipc::utils::logger::init(LevelFilter::Info) {
        eprintln!("[echo] logger init failed: {}", e);
    }
    log::info!("[echo] starting echo service...");

    let channel = match liteipc::open() {
        Ok(channel) => channel,
        Err(e) => {
            log::error!("[echo] failed to open channel: {}", e);
            std::process::exit(1);
        }
    };
    let server = Arc::new(EchoServer::new(channel.clone()));

    if let Err(e) = self_test(&channel, &server) {
        log::error!("[echo] self test failed: {}", e);
        liteipc::close();
        std::process::exit(1);
    }

    log::info!("[echo] serving on {}", channel.config().device);
    let handler = {
        let server = server.clone();
        move |ctx: &mut ReplyContext, msg: IpcMsg, io: &mut IpcIo| server.handle_request(ctx, msg, io)
    };
    if let Err(e) = channel.join_work_thread(handler) {
        log::error!("[echo] looper exited: {}", e);
    }
    liteipc::close();
}
