//! Routing from a hooked slot back to the component that owns it.
//!
//! Hook entry points are plain `extern` functions shared by every engine in the process. A
//! hook finds its owner through the table the call came in on: the `this` argument of every
//! JIT interface call is an object whose first word is the hooked table.
//!
//! Entries outlive the hooks. A host thread that loaded the hook pointer from the slot just
//! before the hook was removed still needs the original function, so removal only drops the
//! owner and keeps the original address.

use std::sync::{Arc, Weak};

use dashmap::DashMap;

use crate::engine::HookSite;

struct Dispatch<T> {
    owner: Weak<T>,
    original: usize,
}

/// Where a hooked call goes.
pub(crate) struct Route<T> {
    /// The live owner, `None` once the hook was removed
    pub owner: Option<Arc<T>>,
    /// The function the slot held before hooking
    pub original: usize,
}

pub(crate) struct DispatchTable<T> {
    entries: DashMap<(usize, HookSite), Dispatch<T>>,
}

impl<T> DispatchTable<T> {
    pub fn new() -> Self {
        DispatchTable {
            entries: DashMap::new(),
        }
    }

    pub fn register(&self, table: usize, site: HookSite, owner: Weak<T>, original: usize) {
        self.entries
            .insert((table, site), Dispatch { owner, original });
    }

    pub fn release(&self, table: usize, site: HookSite) {
        if let Some(mut entry) = self.entries.get_mut(&(table, site)) {
            entry.owner = Weak::new();
        }
    }

    pub fn route(&self, table: usize, site: HookSite) -> Option<Route<T>> {
        self.entries.get(&(table, site)).map(|entry| Route {
            owner: entry.owner.upgrade(),
            original: entry.original,
        })
    }
}
