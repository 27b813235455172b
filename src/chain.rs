//! Ordered, concurrently mutable callback registries.
//!
//! Resolvers, token resolvers, string resolvers and call interceptors are all kept in a
//! [`CallbackChain`]. Registration order is execution order. Hooks take a snapshot before
//! running the chain, so callbacks added or removed while a chain runs take effect with the
//! next invocation.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
};

/// Stable identifier handed out on registration, used to unregister.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResolverId(u64);

impl ResolverId {
    /// The raw identifier
    #[must_use]
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ResolverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResolverId({})", self.0)
    }
}

/// A registration-ordered list of shared callbacks.
///
/// # Examples
///
/// ```rust
/// use jitscope::CallbackChain;
/// use std::sync::Arc;
///
/// let chain: CallbackChain<dyn Fn(u32) -> u32 + Send + Sync> = CallbackChain::new();
/// let double = chain.add(Arc::new(|value: u32| value * 2));
/// chain.add(Arc::new(|value: u32| value + 1));
///
/// let results: Vec<u32> = chain.snapshot().iter().map(|callback| callback(5)).collect();
/// assert_eq!(results, vec![10, 6]);
///
/// assert!(chain.remove(double));
/// assert_eq!(chain.len(), 1);
/// ```
pub struct CallbackChain<T: ?Sized> {
    entries: RwLock<Vec<(ResolverId, Arc<T>)>>,
    next_id: AtomicU64,
}

impl<T: ?Sized> CallbackChain<T> {
    /// An empty chain.
    #[must_use]
    pub fn new() -> Self {
        CallbackChain {
            entries: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Appends a callback; it runs after every callback registered before it.
    pub fn add(&self, callback: Arc<T>) -> ResolverId {
        let id = ResolverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        write_lock!(self.entries).push((id, callback));
        id
    }

    /// Unregisters a callback. Returns `false` if the id is unknown.
    pub fn remove(&self, id: ResolverId) -> bool {
        let mut entries = write_lock!(self.entries);
        let before = entries.len();
        entries.retain(|(entry, _)| *entry != id);
        entries.len() != before
    }

    /// The callbacks in execution order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        read_lock!(self.entries)
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect()
    }

    /// Number of registered callbacks.
    #[must_use]
    pub fn len(&self) -> usize {
        read_lock!(self.entries).len()
    }

    /// Returns `true` if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        read_lock!(self.entries).is_empty()
    }

    /// Removes every callback.
    pub fn clear(&self) {
        write_lock!(self.entries).clear();
    }
}

impl<T: ?Sized> Default for CallbackChain<T> {
    fn default() -> Self {
        Self::new()
    }
}
