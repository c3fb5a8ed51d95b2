/*
 * Service Identity
 *
 * A service is addressed either by a kernel-assigned handle (remote,
 * reference counted by the arbiter) or by a token naming an anonymous
 * callback registered in this process (handle 0).
 */

use crate::driver::numbers::{
    BINDER_TYPE_BINDER, BINDER_TYPE_HANDLE, BINDER_TYPE_WEAK_BINDER, BINDER_TYPE_WEAK_HANDLE,
    FLAT_BINDER_FLAG_ACCEPTS_FDS, FLAT_BINDER_FLAG_PRIORITY_MASK,
};
use crate::ipc::protocol::FlatObject;

/// Minimum scheduling priority requested for calls into local objects
const LOCAL_OBJECT_PRIORITY: u32 = 0x7f;

/// Service identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SvcIdentity {
    /// Kernel handle, 0 for anonymous/local services
    pub handle: u32,
    /// Opaque token (storage address of a local callback entry)
    pub token: usize,
    /// Cookie the arbiter hands back with transactions for this object
    pub cookie: usize,
}

impl SvcIdentity {
    /// The null identity, encoded as a null local object
    pub const NULL: SvcIdentity = SvcIdentity { handle: 0, token: 0, cookie: 0 };

    /// Identity of a remote service reached through the arbiter
    pub const fn remote(handle: u32) -> Self {
        Self { handle, token: 0, cookie: 0 }
    }

    /// Identity of an anonymous callback in this process
    pub const fn local(token: usize) -> Self {
        Self { handle: 0, token, cookie: token }
    }

    /// Handle 0: resolved through the in-process registries
    pub fn is_local(&self) -> bool {
        self.handle == 0
    }

    pub fn is_null(&self) -> bool {
        self.handle == 0 && self.token == 0
    }

    /// Flat object representing this identity on the wire
    ///
    /// Local identities travel as binder objects (the arbiter turns them
    /// into handles for the receiver); remote ones as handle objects.
    pub(crate) fn to_flat(&self) -> FlatObject {
        if self.is_local() {
            FlatObject {
                kind: BINDER_TYPE_BINDER,
                flags: FLAT_BINDER_FLAG_ACCEPTS_FDS | (LOCAL_OBJECT_PRIORITY & FLAT_BINDER_FLAG_PRIORITY_MASK),
                binder: self.token as u64,
                cookie: self.cookie as u64,
            }
        } else {
            FlatObject {
                kind: BINDER_TYPE_HANDLE,
                flags: FLAT_BINDER_FLAG_ACCEPTS_FDS,
                binder: self.handle as u64,
                cookie: 0,
            }
        }
    }

    pub(crate) fn from_flat(obj: &FlatObject) -> Option<Self> {
        match obj.kind {
            BINDER_TYPE_BINDER | BINDER_TYPE_WEAK_BINDER => Some(Self {
                handle: 0,
                token: obj.binder as usize,
                cookie: obj.cookie as usize,
            }),
            BINDER_TYPE_HANDLE | BINDER_TYPE_WEAK_HANDLE => Some(Self {
                handle: obj.binder as u32,
                token: 0,
                cookie: obj.cookie as usize,
            }),
            _ => None,
        }
    }
}

impl core::fmt::Display for SvcIdentity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_local() {
            write!(f, "Svc(local {:#x})", self.token)
        } else {
            write!(f, "Svc(handle {})", self.handle)
        }
    }
}
