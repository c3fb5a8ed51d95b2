/*
 * Worker Pool Tracker
 *
 * Maps each looper thread to the dispatch handler it runs. Threads spawned
 * on BR_SPAWN_LOOPER inherit the spawning thread's handler through this
 * table, and incoming transactions with no registry match are routed to
 * the handler of the thread that received them.
 */

use std::thread::ThreadId;

use spin::Mutex;

use crate::ipc::IpcMsgHandler;

struct WorkerEntry {
    thread: ThreadId,
    handler: IpcMsgHandler,
}

pub struct WorkerPool {
    entries: Mutex<Vec<WorkerEntry>>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self { entries: Mutex::new(Vec::new()) }
    }

    /// Insert or update the entry for `thread`
    pub fn track(&self, thread: ThreadId, handler: IpcMsgHandler) {
        let mut entries = self.entries.lock();
        match entries.iter_mut().find(|e| e.thread == thread) {
            Some(entry) => entry.handler = handler,
            None => entries.push(WorkerEntry { thread, handler }),
        }
    }

    pub fn lookup(&self, thread: ThreadId) -> Option<IpcMsgHandler> {
        self.entries
            .lock()
            .iter()
            .find(|e| e.thread == thread)
            .map(|e| e.handler.clone())
    }

    pub fn untrack(&self, thread: ThreadId) {
        self.entries.lock().retain(|e| e.thread != thread);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}
