/*
 * Anonymous Callback Registry
 *
 * Anonymous services are endpoints with no arbiter handle. They are
 * addressed by a token derived from the storage address of their entry
 * and resolved purely in-process.
 *
 * Design:
 * - One lock covers lookup, insert and removal
 * - Entries are reference counted: a handler running on another thread
 *   keeps its entry alive after unregistration
 * - Unregistering an unknown identity is a no-op
 */

use std::sync::Arc;

use spin::Mutex;

use crate::ipc::IpcMsgHandler;
use crate::ipc::identity::SvcIdentity;

/// Registered anonymous endpoint
pub(crate) struct CallbackEntry {
    handler: IpcMsgHandler,
}

pub struct CallbackRegistry {
    entries: Mutex<Vec<Arc<CallbackEntry>>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self { entries: Mutex::new(Vec::new()) }
    }

    /// Add an endpoint and return its identity (handle 0)
    pub fn register(&self, handler: IpcMsgHandler) -> SvcIdentity {
        let entry = Arc::new(CallbackEntry { handler });
        let token = Arc::as_ptr(&entry) as usize;
        self.entries.lock().push(entry);
        log::debug!("callback: registered anonymous service {:#x}", token);
        SvcIdentity::local(token)
    }

    /// Remove the endpoint named by `svc`; returns whether one was found
    pub fn unregister(&self, svc: &SvcIdentity) -> bool {
        if !svc.is_local() || svc.token == 0 {
            return false;
        }
        let mut entries = self.entries.lock();
        match entries.iter().position(|e| Arc::as_ptr(e) as usize == svc.token) {
            Some(index) => {
                entries.swap_remove(index);
                log::debug!("callback: unregistered anonymous service {:#x}", svc.token);
                true
            }
            None => false,
        }
    }

    /// Handler registered under `token`
    pub fn lookup(&self, token: usize) -> Option<IpcMsgHandler> {
        if token == 0 {
            return None;
        }
        self.entries
            .lock()
            .iter()
            .find(|e| Arc::as_ptr(e) as usize == token)
            .map(|e| e.handler.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}
