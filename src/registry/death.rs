/*
 * Death Subscription Registry
 *
 * Tracks "tell me when this remote handle dies" subscriptions. Each
 * remote handle has at most one subscription with the arbiter, shared by
 * up to MAX_DEATH_CALLBACKS local handlers.
 *
 * Design:
 * - Subscriptions are keyed by handle for registration and by a
 *   process-unique cookie for BR_DEAD_BINDER delivery
 * - Slots live in a fixed-capacity array; a full array is an error,
 *   never a reallocation
 * - Freed slots are reused before new ones are appended
 * - The `running` flag is set and cleared under the registry lock while
 *   handlers run outside it; unregistration during that window is a
 *   no-op so an executing handler is never pulled out from under itself
 *
 * The registry only does bookkeeping. Writing BC_REQUEST_DEATH_NOTIFICATION
 * and BC_CLEAR_DEATH_NOTIFICATION is up to the channel, driven by the
 * `Subscribed` / `Unsubscribed` results.
 */

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use heapless::Vec as SlotVec;
use spin::Mutex;

use crate::ipc::IpcMsgHandler;
use crate::ipc::error::{IpcError, Result};

/// Per-handle callback capacity
pub const MAX_DEATH_CALLBACKS: usize = 3;

struct DeathSlot {
    handler: Option<IpcMsgHandler>,
}

struct DeathSubscription {
    handle: u32,
    cookie: u64,
    slots: SlotVec<DeathSlot, MAX_DEATH_CALLBACKS>,
    live: usize,
    running: AtomicBool,
}

impl DeathSubscription {
    fn claim(&mut self, handler: IpcMsgHandler) -> Result<usize> {
        if let Some(index) = self.slots.iter().position(|s| s.handler.is_none()) {
            self.slots[index].handler = Some(handler);
            self.live += 1;
            return Ok(index);
        }
        let index = self.slots.len();
        self.slots
            .push(DeathSlot { handler: Some(handler) })
            .map_err(|_| IpcError::CapacityExceeded)?;
        self.live += 1;
        Ok(index)
    }
}

/// Outcome of a successful registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subscribed {
    /// Slot added to an existing subscription
    Existing { slot: usize },
    /// First subscription for the handle; the arbiter must be told
    New { slot: usize, cookie: u64 },
}

/// Outcome of an unregistration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unsubscribed {
    /// Slot cleared, other handlers remain
    Cleared,
    /// Last slot cleared and subscription removed; the arbiter must be told
    Emptied { cookie: u64 },
    /// Handlers are running; nothing changed
    Deferred,
    /// No such handle or slot
    Unknown,
}

/// Handlers to run for one BR_DEAD_BINDER
pub struct DeathNotice {
    pub handle: u32,
    pub handlers: Vec<IpcMsgHandler>,
}

pub struct DeathRegistry {
    subs: Mutex<Vec<DeathSubscription>>,
    next_cookie: AtomicU64,
}

impl DeathRegistry {
    pub fn new() -> Self {
        Self {
            subs: Mutex::new(Vec::new()),
            next_cookie: AtomicU64::new(1),
        }
    }

    /// Add `handler` for `handle`, creating the subscription if needed
    pub fn register(&self, handle: u32, handler: IpcMsgHandler) -> Result<Subscribed> {
        let mut subs = self.subs.lock();

        if let Some(sub) = subs.iter_mut().find(|s| s.handle == handle) {
            let slot = sub.claim(handler).inspect_err(|_| {
                log::warn!("death: handle {} already has {} callbacks", handle, MAX_DEATH_CALLBACKS);
            })?;
            return Ok(Subscribed::Existing { slot });
        }

        let cookie = self.next_cookie.fetch_add(1, Ordering::Relaxed);
        let mut sub = DeathSubscription {
            handle,
            cookie,
            slots: SlotVec::new(),
            live: 0,
            running: AtomicBool::new(false),
        };
        let slot = sub.claim(handler)?;
        subs.push(sub);
        log::debug!("death: new subscription for handle {} (cookie {})", handle, cookie);
        Ok(Subscribed::New { slot, cookie })
    }

    /// Drop a subscription that the arbiter never accepted
    pub fn discard(&self, handle: u32) {
        self.subs.lock().retain(|s| s.handle != handle);
    }

    pub fn unregister(&self, handle: u32, slot: usize) -> Unsubscribed {
        let mut subs = self.subs.lock();
        let Some(index) = subs.iter().position(|s| s.handle == handle) else {
            return Unsubscribed::Unknown;
        };

        let sub = &mut subs[index];
        if sub.running.load(Ordering::Acquire) {
            log::warn!("death: handle {} callbacks running, unregister ignored", handle);
            return Unsubscribed::Deferred;
        }
        match sub.slots.get_mut(slot) {
            Some(entry) if entry.handler.is_some() => {
                entry.handler = None;
                sub.live -= 1;
            }
            _ => return Unsubscribed::Unknown,
        }

        if sub.live > 0 {
            return Unsubscribed::Cleared;
        }
        let cookie = sub.cookie;
        subs.swap_remove(index);
        log::debug!("death: subscription for handle {} emptied", handle);
        Unsubscribed::Emptied { cookie }
    }

    /// Mark the subscription for `cookie` running and collect its handlers
    pub fn begin_notify(&self, cookie: u64) -> Option<DeathNotice> {
        let subs = self.subs.lock();
        let sub = subs.iter().find(|s| s.cookie == cookie)?;
        sub.running.store(true, Ordering::Release);
        Some(DeathNotice {
            handle: sub.handle,
            handlers: sub.slots.iter().filter_map(|s| s.handler.clone()).collect(),
        })
    }

    /// Clear the running flag and remove the subscription; the handle is gone
    pub fn finish_notify(&self, cookie: u64) -> Option<u32> {
        let mut subs = self.subs.lock();
        let index = subs.iter().position(|s| s.cookie == cookie)?;
        subs[index].running.store(false, Ordering::Release);
        let sub = subs.swap_remove(index);
        Some(sub.handle)
    }

    /// Live callbacks for `handle`
    pub fn live_count(&self, handle: u32) -> Option<usize> {
        self.subs.lock().iter().find(|s| s.handle == handle).map(|s| s.live)
    }

    pub fn is_running(&self, handle: u32) -> bool {
        self.subs
            .lock()
            .iter()
            .any(|s| s.handle == handle && s.running.load(Ordering::Acquire))
    }

    pub fn len(&self) -> usize {
        self.subs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DeathRegistry {
    fn default() -> Self {
        Self::new()
    }
}
