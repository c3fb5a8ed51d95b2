/*
 * Transport Scenario Tests
 *
 * End-to-end tests of the channel against the scripted arbiter in `mock`.
 *
 * ## Lifecycle
 * - `zero_sized_region_fails_before_driver_use()` - capacity 0 is rejected, nothing leaks
 * - `oversized_region_is_rejected()` / `channel_configures_max_threads()`
 * - `close_is_idempotent_and_fails_later_commands()`
 * - `global_channel_is_built_outside_the_lock()` - concurrent opener shares
 * - `close_drops_driver_while_channel_is_shared()`
 * - `close_releases_driver_under_blocked_looper()` - shutdown wakes nobody
 *
 * ## Anonymous services
 * - `anonymous_one_way_runs_on_caller_thread()` - no kernel write
 * - `anonymous_two_way_reply_is_redirected()`
 * - `anonymous_status_without_reply()`
 * - `unregistered_callback_no_longer_resolves()`
 * - `oversized_payload_is_rejected_before_dispatch()`
 *
 * ## Kernel calls
 * - `two_way_reply_strips_header()` - N byte reply yields N minus header
 * - `status_reply_is_an_error()` / `failed_and_dead_replies()`
 * - `one_way_completes_on_transaction_complete()`
 * - `first_kernel_call_starts_background_looper()`
 *
 * ## Dispatch loop
 * - `incoming_transaction_reaches_anonymous_handler()`
 * - `handler_without_reply_sends_status()` / `unroutable_transaction_is_refused()`
 * - `one_way_incoming_gets_no_reply()`
 * - `unreadable_transaction_is_refused()` - payload outside the receive region
 * - `explicit_free_releases_buffer_once()`
 * - `ref_counting_commands_are_acknowledged()`
 * - `arbiter_error_and_unknown_records_fail_the_batch()`
 * - `spawn_looper_starts_registered_thread()`
 * - `main_loop_exits_on_stop()`
 *
 * ## Death notification
 * - `dead_binder_fires_each_subscription_once()`
 * - `death_capacity_is_enforced()`
 * - `death_request_rolls_back_on_write_failure()`
 * - `last_death_unregister_clears_notification()`
 * - `remote_references_are_written()`
 */


use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::ChannelConfig;
use crate::driver::numbers::*;
use crate::driver::{Driver, WriteRead};
use crate::ipc::channel::Channel;
use crate::ipc::error::IpcError;
use crate::ipc::identity::SvcIdentity;
use crate::ipc::io::{IPC_IO_HEADER_SIZE, IpcIo};
use crate::ipc::looper::WaitMode;
use crate::ipc::message::MsgType;
use crate::ipc::protocol::{TransactionData, TransactionFlags};
use mock::{MockHandle, Written, batch, mock};

/// ===============================
///  FIXTURE
/// ===============================

/// Channel over the scripted arbiter, background looper suppressed
fn channel() -> (Arc<Channel>, MockHandle) {
    let (driver, handle) = mock();
    let channel = Channel::with_driver(driver, ChannelConfig::default()).unwrap();
    channel.looper_started.store(true, Ordering::Release);
    (channel, handle)
}

fn payload_u32(value: u32) -> IpcIo {
    let mut io = IpcIo::new(16);
    io.push_u32(value).unwrap();
    io
}

/// Reply record carrying `payload` behind the transport header
fn reply_batch(mock: &MockHandle, payload: &IpcIo) -> Vec<u8> {
    let wire = IpcIo::with_header(0, &SvcIdentity::NULL, payload).unwrap();
    let record = mock.stage_payload(wire, TransactionData::default());
    let mut b = batch();
    b.command(BR_TRANSACTION_COMPLETE).transaction(BR_REPLY, &record);
    b.as_bytes().to_vec()
}

/// Incoming BR_TRANSACTION addressed to `target`
fn incoming(mock: &MockHandle, target: &SvcIdentity, code: u32, flags: TransactionFlags, payload: &IpcIo) -> (Vec<u8>, u64) {
    let wire = IpcIo::with_header(target.token, target, payload).unwrap();
    let template = TransactionData {
        target: target.token as u64,
        cookie: target.cookie as u64,
        code,
        flags,
        sender_pid: 321,
        sender_euid: 1000,
        ..Default::default()
    };
    let record = mock.stage_payload(wire, template);
    let mut b = batch();
    b.transaction(BR_TRANSACTION, &record);
    (b.as_bytes().to_vec(), record.buffer)
}

fn count(mock: &MockHandle, pred: impl Fn(&Written) -> bool) -> usize {
    mock.written().iter().filter(|w| pred(w)).count()
}

fn wait_until(pred: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    pred()
}

/// Arbiter whose reads block until the test opens the gate
///
/// `shutdown` only records the call; it wakes nobody.
#[derive(Clone, Default)]
struct StuckDriver {
    gate: Arc<(Mutex<bool>, Condvar)>,
    blocked: Arc<AtomicUsize>,
    shut: Arc<AtomicBool>,
    dropped: Arc<AtomicBool>,
}

impl StuckDriver {
    fn open_gate(&self) {
        let (lock, cvar) = &*self.gate;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
    }
}

impl Driver for StuckDriver {
    fn write_read(&self, write: &[u8], read: &mut [u8]) -> crate::Result<WriteRead> {
        if !read.is_empty() {
            self.blocked.fetch_add(1, Ordering::SeqCst);
            let (lock, cvar) = &*self.gate;
            let mut open = lock.lock().unwrap();
            while !*open {
                open = cvar.wait(open).unwrap();
            }
        }
        Ok(WriteRead { write_consumed: write.len(), read_consumed: 0 })
    }

    fn set_max_threads(&self, _count: u32) -> crate::Result<()> {
        Ok(())
    }

    fn read_buffer(&self, _ptr: u64, _len: usize) -> crate::Result<Vec<u8>> {
        Err(IpcError::InvalidArgument)
    }

    fn shutdown(&self) {
        self.shut.store(true, Ordering::SeqCst);
    }
}

impl Drop for StuckDriver {
    fn drop(&mut self) {
        self.dropped.store(true, Ordering::SeqCst);
    }
}

/// ===============================
///  LIFECYCLE
/// ===============================

#[test]
fn zero_sized_region_fails_before_driver_use() {
    let (driver, mock) = mock();
    let result = Channel::with_driver(driver, ChannelConfig::with_map_size(0));
    assert!(matches!(result, Err(IpcError::InvalidArgument)));
    assert!(mock.written().is_empty());
    assert_eq!(mock.max_threads(), None);
}

#[test]
fn oversized_region_is_rejected() {
    let (driver, mock) = mock();
    let result = Channel::with_driver(driver, ChannelConfig::with_map_size(MAX_MAP_SIZE + 1));
    assert!(matches!(result, Err(IpcError::InvalidArgument)));
    assert_eq!(mock.max_threads(), None);
}

#[test]
fn channel_configures_max_threads() {
    let (driver, mock) = mock();
    let config = ChannelConfig { max_threads: 9, ..ChannelConfig::default() };
    let channel = Channel::with_driver(driver, config).unwrap();
    assert_eq!(mock.max_threads(), Some(9));
    assert_eq!(channel.config().max_threads, 9);
}

#[test]
fn close_is_idempotent_and_fails_later_commands() {
    let (channel, _mock) = channel();
    channel.close();
    channel.close();
    assert!(channel.is_closed());
    assert_eq!(channel.acquire(&SvcIdentity::remote(1)), Err(IpcError::Driver(EBADF)));
}

// The only test touching the process-wide channel
#[test]
fn global_channel_is_built_outside_the_lock() {
    let config = ChannelConfig { device: "/nonexistent/liteipc".to_string(), ..ChannelConfig::default() };
    assert!(matches!(crate::open_with(&config), Err(IpcError::Driver(_))));
    assert!(crate::current().is_none());
    crate::close();

    // A second opener wins while the first is still building its channel
    let (late_driver, _) = mock();
    let late = Channel::with_driver(late_driver, ChannelConfig::default()).unwrap();
    let late_in = late.clone();
    let shared = crate::open_shared(move || {
        assert!(crate::current().is_none());
        let (driver, _) = mock();
        let first = crate::open_shared(|| Channel::with_driver(driver, ChannelConfig::default())).unwrap();
        assert!(crate::current().is_some());
        drop(first);
        Ok(late_in)
    })
    .unwrap();

    assert!(late.is_closed());
    assert!(!shared.is_closed());
    assert!(crate::current().is_some_and(|c| Arc::ptr_eq(&c, &shared)));

    crate::close();
    assert!(crate::current().is_some());
    crate::close();
    assert!(crate::current().is_none());
    assert!(shared.is_closed());
}

#[test]
fn close_drops_driver_while_channel_is_shared() {
    let driver = StuckDriver::default();
    let channel = Channel::with_driver(Box::new(driver.clone()), ChannelConfig::default()).unwrap();
    let shared = channel.clone();

    channel.close();
    assert!(driver.shut.load(Ordering::SeqCst));
    assert!(driver.dropped.load(Ordering::SeqCst));
    assert_eq!(shared.acquire(&SvcIdentity::remote(1)), Err(IpcError::Driver(EBADF)));
}

#[test]
fn close_releases_driver_under_blocked_looper() {
    let driver = StuckDriver::default();
    let channel = Channel::with_driver(Box::new(driver.clone()), ChannelConfig::default()).unwrap();
    channel.ensure_looper().unwrap();
    assert!(wait_until(|| driver.blocked.load(Ordering::SeqCst) > 0));

    channel.close();
    assert!(driver.shut.load(Ordering::SeqCst));
    assert_eq!(channel.read_buffer(0x1000, 4), Err(IpcError::Driver(EBADF)));

    // The looper's read still holds the driver until it returns
    assert!(!driver.dropped.load(Ordering::SeqCst));
    drop(channel);
    driver.open_gate();
    assert!(wait_until(|| driver.dropped.load(Ordering::SeqCst)));
}

/// ===============================
///  ANONYMOUS SERVICES
/// ===============================

#[test]
fn anonymous_one_way_runs_on_caller_thread() {
    let (channel, mock) = channel();
    let caller = thread::current().id();
    let seen = Arc::new(AtomicUsize::new(0));

    let seen_in = seen.clone();
    let svc = channel.register_callback(move |_ctx, msg, io| {
        assert_eq!(thread::current().id(), caller);
        assert_eq!(msg.code(), 3);
        assert!(msg.is_one_way());
        assert_eq!(msg.calling_pid(), std::process::id() as i32);
        assert!(msg.calling_gid().is_some());
        assert_eq!(io.pop_u32(), Some(99));
        seen_in.fetch_add(1, Ordering::SeqCst);
        0
    });

    let result = channel.send_request(&svc, 3, &payload_u32(99), TransactionFlags::ONE_WAY);
    assert_eq!(result, Ok(None));
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert!(mock.written().is_empty());
}

#[test]
fn anonymous_two_way_reply_is_redirected() {
    let (channel, mock) = channel();
    let svc = channel.register_callback(|ctx, mut msg, io| {
        let value = io.pop_u32().unwrap_or(0);
        let mut reply = IpcIo::new(32);
        reply.push_u32(value * 2).unwrap();
        reply.push_string("done").unwrap();
        ctx.send_reply(&mut msg, &reply).map_or(-1, |_| 0)
    });

    let mut reply = channel
        .send_request(&svc, 1, &payload_u32(21), TransactionFlags::empty())
        .unwrap()
        .unwrap();
    assert_eq!(reply.pop_u32(), Some(42));
    assert_eq!(reply.pop_string().as_deref(), Some("done"));
    assert!(mock.written().is_empty());
}

#[test]
fn anonymous_status_without_reply() {
    let (channel, _mock) = channel();
    let ok = channel.register_callback(|_, _, _| 0);
    let failing = channel.register_callback(|_, _, _| 4);

    let empty = channel.send_request(&ok, 1, &IpcIo::new(0), TransactionFlags::empty()).unwrap();
    assert_eq!(empty.map(|io| io.remaining()), Some(0));
    assert_eq!(
        channel.send_request(&failing, 1, &IpcIo::new(0), TransactionFlags::empty()),
        Err(IpcError::Status(4))
    );
    assert_eq!(
        channel.send_request(&failing, 1, &IpcIo::new(0), TransactionFlags::ONE_WAY),
        Err(IpcError::Status(4))
    );
}

#[test]
fn unregistered_callback_no_longer_resolves() {
    let (channel, mock) = channel();
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_in = calls.clone();
    let svc = channel.register_callback(move |_, _, _| {
        calls_in.fetch_add(1, Ordering::SeqCst);
        0
    });

    channel.unregister_callback(&svc);
    let result = channel.send_request(&svc, 1, &payload_u32(1), TransactionFlags::ONE_WAY);
    assert_eq!(result, Err(IpcError::InvalidArgument));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(mock.written().is_empty());

    // Second unregister is a no-op
    channel.unregister_callback(&svc);
}

#[test]
fn oversized_payload_is_rejected_before_dispatch() {
    let (channel, mock) = channel();
    let svc = channel.register_callback(|_, _, _| 0);
    let big = IpcIo::from_raw(vec![0; crate::ipc::MAX_IO_SIZE + 4], Vec::new());
    assert_eq!(channel.send_request(&svc, 1, &big, TransactionFlags::ONE_WAY), Err(IpcError::InvalidArgument));
    assert_eq!(
        channel.send_request(&SvcIdentity::remote(2), 1, &big, TransactionFlags::empty()),
        Err(IpcError::InvalidArgument)
    );
    assert!(mock.written().is_empty());
}

/// ===============================
///  KERNEL CALLS
/// ===============================

#[test]
fn two_way_reply_strips_header() {
    let (channel, mock) = channel();
    let body: Vec<u8> = (0..40).collect();
    let mut payload = IpcIo::new(64);
    payload.push_flat_obj(&body).unwrap();
    let total = IPC_IO_HEADER_SIZE + payload.len();

    let reply_payload = payload.clone();
    mock.respond_with(move |mock, cmd| match cmd {
        Written::Transaction { code: 7, .. } => Some(reply_batch(mock, &reply_payload)),
        _ => None,
    });

    let mut reply = channel
        .send_request(&SvcIdentity::remote(5), 7, &payload_u32(1), TransactionFlags::empty())
        .unwrap()
        .unwrap();
    assert_eq!(reply.remaining(), total - IPC_IO_HEADER_SIZE);
    assert_eq!(reply.pop_flat_obj(), Some(body));

    // Sent record: handle target, header then payload
    let sent = mock.written();
    let Written::Transaction { target, data, offsets, .. } = &sent[0] else {
        panic!("expected transaction, got {:?}", sent);
    };
    assert_eq!(*target, 5);
    assert_eq!(data.len(), IPC_IO_HEADER_SIZE + 4);
    assert_eq!(offsets, &vec![8]);

    // Reply buffer released exactly once
    assert_eq!(mock.freed().len(), 1);
}

#[test]
fn status_reply_is_an_error() {
    let (channel, mock) = channel();
    mock.respond_with(|mock, _| {
        let record = mock.stage_payload(
            payload_u32(3),
            TransactionData { flags: TransactionFlags::STATUS_CODE, ..Default::default() },
        );
        let mut b = batch();
        b.transaction(BR_REPLY, &record);
        Some(b.as_bytes().to_vec())
    });

    let result = channel.send_request(&SvcIdentity::remote(2), 1, &IpcIo::new(0), TransactionFlags::empty());
    assert_eq!(result, Err(IpcError::Status(3)));
    assert_eq!(mock.freed().len(), 1);
}

#[test]
fn failed_and_dead_replies() {
    let (channel, mock) = channel();
    mock.respond_with(|_, cmd| {
        let tag = match cmd {
            Written::Transaction { code: 1, .. } => BR_FAILED_REPLY,
            _ => BR_DEAD_REPLY,
        };
        let mut b = batch();
        b.command(BR_NOOP).command(tag);
        Some(b.as_bytes().to_vec())
    });

    let target = SvcIdentity::remote(6);
    let failed = channel.send_request(&target, 1, &IpcIo::new(0), TransactionFlags::empty());
    let dead = channel.send_request(&target, 2, &IpcIo::new(0), TransactionFlags::empty());
    assert_eq!(failed, Err(IpcError::Failed));
    assert_eq!(dead, Err(IpcError::DeadObject));
    assert!(dead.unwrap_err().is_fatal());
}

#[test]
fn one_way_completes_on_transaction_complete() {
    let (channel, mock) = channel();
    mock.respond_with(|_, _| {
        let mut b = batch();
        b.command(BR_TRANSACTION_COMPLETE);
        Some(b.as_bytes().to_vec())
    });

    let result = channel.send_request(&SvcIdentity::remote(3), 4, &payload_u32(8), TransactionFlags::ONE_WAY);
    assert_eq!(result, Ok(None));
    let flags = mock.written().iter().find_map(|w| match w {
        Written::Transaction { flags, .. } => Some(*flags),
        _ => None,
    });
    assert_eq!(flags, Some(TransactionFlags::ONE_WAY));
}

#[test]
fn first_kernel_call_starts_background_looper() {
    let (driver, mock) = mock();
    let channel = Channel::with_driver(driver, ChannelConfig::default()).unwrap();
    mock.respond_with(|_, _| {
        let mut b = batch();
        b.command(BR_TRANSACTION_COMPLETE);
        Some(b.as_bytes().to_vec())
    });

    for _ in 0..2 {
        channel
            .send_request(&SvcIdentity::remote(3), 1, &IpcIo::new(0), TransactionFlags::ONE_WAY)
            .unwrap();
    }
    assert!(mock.wait_for(|w| *w == Written::EnterLooper));
    assert_eq!(count(&mock, |w| *w == Written::EnterLooper), 1);
    channel.close();
}

/// ===============================
///  DISPATCH LOOP
/// ===============================

#[test]
fn incoming_transaction_reaches_anonymous_handler() {
    let (channel, mock) = channel();
    let svc = channel.register_callback(|ctx, mut msg, io| {
        assert_eq!(msg.msg_type(), MsgType::Request);
        assert_eq!(msg.calling_pid(), 321);
        assert_eq!(msg.calling_uid(), 1000);
        assert_eq!(msg.calling_gid(), None);
        let mut reply = IpcIo::new(16);
        reply.push_u32(io.pop_u32().unwrap_or(0) + 1).unwrap();
        ctx.send_reply(&mut msg, &reply).map_or(-1, |_| 0)
    });

    let (record, buffer) = incoming(&mock, &svc, 11, TransactionFlags::empty(), &payload_u32(41));
    channel.parse_returns(&record, WaitMode::Loop).unwrap();

    let replies: Vec<Written> = mock
        .written()
        .into_iter()
        .filter(|w| matches!(w, Written::Reply { .. }))
        .collect();
    assert_eq!(replies.len(), 1);
    let Written::Reply { flags, data, offsets } = &replies[0] else { unreachable!() };
    assert!(!flags.contains(TransactionFlags::STATUS_CODE));
    let mut io = IpcIo::from_raw(data.clone(), offsets.clone());
    assert_eq!(io.pop_header(), Some((0, SvcIdentity::NULL)));
    assert_eq!(io.pop_u32(), Some(42));

    // Buffer released before the reply, exactly once
    assert_eq!(mock.freed(), vec![buffer]);
    let written = mock.written();
    let free_at = written.iter().position(|w| *w == Written::FreeBuffer(buffer)).unwrap();
    let reply_at = written.iter().position(|w| matches!(w, Written::Reply { .. })).unwrap();
    assert!(free_at < reply_at);
}

#[test]
fn handler_without_reply_sends_status() {
    let (channel, mock) = channel();
    let svc = channel.register_callback(|_, _, _| 5);

    let (record, buffer) = incoming(&mock, &svc, 1, TransactionFlags::empty(), &IpcIo::new(0));
    channel.parse_returns(&record, WaitMode::Loop).unwrap();

    let status = mock.written().into_iter().find_map(|w| match w {
        Written::Reply { flags, data, .. } => Some((flags, data)),
        _ => None,
    });
    assert_eq!(status, Some((TransactionFlags::STATUS_CODE, 5i32.to_ne_bytes().to_vec())));
    assert_eq!(mock.freed(), vec![buffer]);
}

#[test]
fn one_way_incoming_gets_no_reply() {
    let (channel, mock) = channel();
    let svc = channel.register_callback(|_, _, _| 5);
    let (record, buffer) = incoming(&mock, &svc, 1, TransactionFlags::ONE_WAY, &IpcIo::new(0));
    channel.parse_returns(&record, WaitMode::Loop).unwrap();
    assert_eq!(count(&mock, |w| matches!(w, Written::Reply { .. })), 0);
    assert_eq!(mock.freed(), vec![buffer]);
}

#[test]
fn unroutable_transaction_is_refused() {
    let (channel, mock) = channel();
    let stranger = SvcIdentity::local(0xdead_0000);
    let (record, buffer) = incoming(&mock, &stranger, 1, TransactionFlags::empty(), &IpcIo::new(0));
    channel.parse_returns(&record, WaitMode::Loop).unwrap();

    let status = mock.written().into_iter().find_map(|w| match w {
        Written::Reply { flags, data, .. } => Some((flags, data)),
        _ => None,
    });
    let failed = IpcError::Failed.errno().to_ne_bytes().to_vec();
    assert_eq!(status, Some((TransactionFlags::STATUS_CODE, failed)));
    assert_eq!(mock.freed(), vec![buffer]);
}

#[test]
fn unreadable_transaction_is_refused() {
    let (channel, mock) = channel();
    let mut record = TransactionData { code: 4, data_size: 64, buffer: 0x1234_0000, ..Default::default() };
    let mut b = batch();
    b.transaction(BR_TRANSACTION, &record);
    channel.parse_returns(b.as_bytes(), WaitMode::Loop).unwrap();

    let status = mock.written().into_iter().find_map(|w| match w {
        Written::Reply { flags, data, .. } => Some((flags, data)),
        _ => None,
    });
    let failed = IpcError::Failed.errno().to_ne_bytes().to_vec();
    assert_eq!(status, Some((TransactionFlags::STATUS_CODE, failed)));
    assert_eq!(mock.freed(), vec![0x1234_0000]);

    // One-way senders wait for nothing
    record.flags = TransactionFlags::ONE_WAY;
    let mut b = batch();
    b.transaction(BR_TRANSACTION, &record);
    channel.parse_returns(b.as_bytes(), WaitMode::Loop).unwrap();
    assert_eq!(count(&mock, |w| matches!(w, Written::Reply { .. })), 1);
}

#[test]
fn explicit_free_releases_buffer_once() {
    let (channel, mock) = channel();
    let svc = channel.register_callback(|_, mut msg, _| {
        assert!(msg.holds_buffer());
        msg.free_buffer().unwrap();
        assert!(!msg.holds_buffer());
        msg.free_buffer().unwrap();
        0
    });

    let (record, buffer) = incoming(&mock, &svc, 1, TransactionFlags::ONE_WAY, &IpcIo::new(0));
    channel.parse_returns(&record, WaitMode::Loop).unwrap();
    assert_eq!(mock.freed(), vec![buffer]);
}

#[test]
fn ref_counting_commands_are_acknowledged() {
    let (channel, mock) = channel();
    let mut b = batch();
    b.ptr_cookie(BR_INCREFS, 0x10, 0x20)
        .ptr_cookie(BR_ACQUIRE, 0x30, 0x40)
        .ptr_cookie(BR_RELEASE, 0x30, 0x40)
        .ptr_cookie(BR_DECREFS, 0x10, 0x20);
    channel.parse_returns(b.as_bytes(), WaitMode::Loop).unwrap();

    assert_eq!(
        mock.written(),
        vec![
            Written::IncRefsDone { ptr: 0x10, cookie: 0x20 },
            Written::AcquireDone { ptr: 0x30, cookie: 0x40 },
        ]
    );
}

#[test]
fn arbiter_error_and_unknown_records_fail_the_batch() {
    let (channel, _mock) = channel();
    let mut b = batch();
    b.command(BR_ERROR).put_u32(71);
    assert!(matches!(channel.parse_returns(b.as_bytes(), WaitMode::Loop), Err(IpcError::Driver(71))));

    let mut b = batch();
    b.command(0x0000_72ff);
    assert!(matches!(channel.parse_returns(b.as_bytes(), WaitMode::Loop), Err(IpcError::Internal)));
}

#[test]
fn spawn_looper_starts_registered_thread() {
    let (channel, mock) = channel();
    let mut b = batch();
    b.command(BR_SPAWN_LOOPER);
    channel.parse_returns(b.as_bytes(), WaitMode::Loop).unwrap();

    assert!(mock.wait_for(|w| *w == Written::RegisterLooper));
    channel.close();
}

#[test]
fn main_loop_exits_on_stop() {
    let (channel, mock) = channel();
    let hits = Arc::new(AtomicUsize::new(0));

    let looper = {
        let channel = channel.clone();
        let hits = hits.clone();
        thread::spawn(move || {
            channel.join_work_thread(move |_, _, _| {
                hits.fetch_add(1, Ordering::SeqCst);
                0
            })
        })
    };
    assert!(mock.wait_for(|w| *w == Written::EnterLooper));

    // Unroutable by registry: falls through to the main handler
    let target = SvcIdentity::local(0x5000);
    let (record, buffer) = incoming(&mock, &target, 2, TransactionFlags::ONE_WAY, &IpcIo::new(0));
    mock.push_process(record);
    assert!(mock.wait_for(|w| *w == Written::FreeBuffer(buffer)));

    channel.stop_loop();
    let mut wake = batch();
    wake.command(BR_NOOP);
    mock.push_process(wake.as_bytes().to_vec());

    assert_eq!(looper.join().unwrap(), Ok(()));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(count(&mock, |w| *w == Written::ExitLooper), 1);
    assert!(channel.workers.is_empty());
}

/// ===============================
///  DEATH NOTIFICATION
/// ===============================

#[test]
fn dead_binder_fires_each_subscription_once() {
    let (channel, mock) = channel();
    let target = SvcIdentity::remote(9);
    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));

    for counter in [first.clone(), second.clone()] {
        channel
            .register_death_callback(&target, move |_, msg, _| {
                assert_eq!(msg.msg_type(), MsgType::DeathNotify);
                assert_eq!(msg.target().handle, 9);
                counter.fetch_add(1, Ordering::SeqCst);
                0
            })
            .unwrap();
    }

    let requests: Vec<u64> = mock
        .written()
        .into_iter()
        .filter_map(|w| match w {
            Written::RequestDeath { handle: 9, cookie } => Some(cookie),
            _ => None,
        })
        .collect();
    assert_eq!(requests.len(), 1);
    let cookie = requests[0];

    let mut b = batch();
    b.command(BR_DEAD_BINDER).put_u64(cookie);
    channel.parse_returns(b.as_bytes(), WaitMode::Loop).unwrap();

    assert_eq!(first.load(Ordering::SeqCst), 1);
    assert_eq!(second.load(Ordering::SeqCst), 1);
    assert!(channel.deaths.is_empty());
    assert_eq!(count(&mock, |w| *w == Written::DeadBinderDone(cookie)), 1);

    // A repeated notice finds nothing to run
    channel.parse_returns(b.as_bytes(), WaitMode::Loop).unwrap();
    assert_eq!(first.load(Ordering::SeqCst), 1);
}

#[test]
fn death_capacity_is_enforced() {
    let (channel, _mock) = channel();
    let target = SvcIdentity::remote(4);
    for _ in 0..crate::registry::MAX_DEATH_CALLBACKS {
        channel.register_death_callback(&target, |_, _, _| 0).unwrap();
    }
    assert_eq!(
        channel.register_death_callback(&target, |_, _, _| 0),
        Err(IpcError::CapacityExceeded)
    );
    assert_eq!(channel.deaths.live_count(4), Some(crate::registry::MAX_DEATH_CALLBACKS));
    assert_eq!(
        channel.register_death_callback(&SvcIdentity::local(0x10), |_, _, _| 0),
        Err(IpcError::InvalidArgument)
    );
}

#[test]
fn death_request_rolls_back_on_write_failure() {
    let (channel, mock) = channel();
    mock.fail_writes(true);
    let result = channel.register_death_callback(&SvcIdentity::remote(8), |_, _, _| 0);
    assert_eq!(result, Err(IpcError::Driver(EIO)));
    assert!(channel.deaths.is_empty());
}

#[test]
fn last_death_unregister_clears_notification() {
    let (channel, mock) = channel();
    let target = SvcIdentity::remote(12);
    let a = channel.register_death_callback(&target, |_, _, _| 0).unwrap();
    let b = channel.register_death_callback(&target, |_, _, _| 0).unwrap();

    channel.unregister_death_callback(&target, a).unwrap();
    assert_eq!(count(&mock, |w| matches!(w, Written::ClearDeath { .. })), 0);
    channel.unregister_death_callback(&target, b).unwrap();
    assert_eq!(count(&mock, |w| matches!(w, Written::ClearDeath { handle: 12, .. })), 1);
    assert_eq!(channel.unregister_death_callback(&target, b), Err(IpcError::InvalidArgument));
}

#[test]
fn remote_references_are_written() {
    let (channel, mock) = channel();
    channel.acquire(&SvcIdentity::remote(5)).unwrap();
    channel.release(&SvcIdentity::remote(5)).unwrap();
    assert_eq!(channel.acquire(&SvcIdentity::local(0x99)), Err(IpcError::InvalidArgument));
    assert_eq!(mock.written(), vec![Written::Acquire(5), Written::Release(5)]);
}
