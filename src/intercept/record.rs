use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex, Weak,
};

use crossbeam_skiplist::SkipMap;
use tracing::debug;

use crate::{
    host::{ClassHandle, MethodHandle},
    intercept::{CallManager, ShimShape},
    Error, Result,
};

/// Interception state of one function.
///
/// Records are created the first time a function is chosen for call interception and are
/// never freed: the shim embeds the record's address as a constant and the host may run the
/// shim for as long as the process lives.
#[derive(Debug)]
pub struct InterceptRecord {
    method: MethodHandle,
    shape: ShimShape,
    generic_arguments: Vec<ClassHandle>,
    primary: AtomicUsize,
    secondary: AtomicUsize,
    enabled: AtomicBool,
    manager: Weak<CallManager>,
}

impl InterceptRecord {
    /// The intercepted function.
    #[must_use]
    pub fn method(&self) -> MethodHandle {
        self.method
    }

    /// The calling convention of the shim.
    #[must_use]
    pub fn shape(&self) -> &ShimShape {
        &self.shape
    }

    /// Type arguments of the instantiation the record was created for.
    #[must_use]
    pub fn generic_arguments(&self) -> &[ClassHandle] {
        &self.generic_arguments
    }

    /// Entry of the compiled shim, 0 until the shim is compiled.
    #[must_use]
    pub fn primary(&self) -> usize {
        self.primary.load(Ordering::Acquire)
    }

    /// Entry of the real implementation.
    #[must_use]
    pub fn secondary(&self) -> usize {
        self.secondary.load(Ordering::Acquire)
    }

    pub(crate) fn set_primary(&self, entry: usize) {
        self.primary.store(entry, Ordering::Release);
    }

    pub(crate) fn set_secondary(&self, entry: usize) {
        self.secondary.store(entry, Ordering::Release);
    }

    /// Returns `false` while interceptors are bypassed.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// The manager that runs the interceptors of this function.
    pub(crate) fn manager(&self) -> Option<Arc<CallManager>> {
        self.manager.upgrade()
    }

    /// The address the shim passes to the call manager.
    #[must_use]
    pub fn address(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as usize
    }
}

/// All intercepted functions of one call manager.
pub struct InterceptTable {
    manager: Weak<CallManager>,
    records: SkipMap<MethodHandle, Arc<InterceptRecord>>,
    mutation: Mutex<()>,
}

impl InterceptTable {
    pub(crate) fn new(manager: Weak<CallManager>) -> Self {
        InterceptTable {
            manager,
            records: SkipMap::new(),
            mutation: Mutex::new(()),
        }
    }

    /// The record of `method`, if it was ever intercepted.
    #[must_use]
    pub fn record(&self, method: MethodHandle) -> Option<Arc<InterceptRecord>> {
        self.records.get(&method).map(|entry| Arc::clone(entry.value()))
    }

    /// The record of `method`, created enabled if it does not exist yet.
    ///
    /// The shape and instantiation of an existing record are kept.
    pub fn get_or_insert(
        &self,
        method: MethodHandle,
        shape: ShimShape,
        generic_arguments: Vec<ClassHandle>,
    ) -> Arc<InterceptRecord> {
        if let Some(record) = self.record(method) {
            return record;
        }

        let _guard = lock!(self.mutation);
        if let Some(record) = self.record(method) {
            return record;
        }

        let record = Arc::new(InterceptRecord {
            method,
            shape,
            generic_arguments,
            primary: AtomicUsize::new(0),
            secondary: AtomicUsize::new(0),
            enabled: AtomicBool::new(true),
            manager: self.manager.clone(),
        });
        // Leaked on purpose, shims hold the raw address
        let _ = Arc::into_raw(Arc::clone(&record));
        self.records.insert(method, Arc::clone(&record));
        debug!(%method, "created intercept record");
        record
    }

    fn set_enabled(&self, method: MethodHandle, enabled: bool) -> Result<()> {
        let record = self.record(method).ok_or(Error::NotIntercepted(method))?;
        record.enabled.store(enabled, Ordering::Release);
        debug!(%method, enabled, "changed interception state");
        Ok(())
    }

    /// Runs the interceptor chain again for calls of `method`.
    ///
    /// # Errors
    /// Returns [`crate::Error::NotIntercepted`] if `method` has no record.
    pub fn enable(&self, method: MethodHandle) -> Result<()> {
        self.set_enabled(method, true)
    }

    /// Lets calls of `method` go straight to the original function.
    ///
    /// # Errors
    /// Returns [`crate::Error::NotIntercepted`] if `method` has no record.
    pub fn disable(&self, method: MethodHandle) -> Result<()> {
        self.set_enabled(method, false)
    }

    /// Returns `true` if `method` is intercepted and enabled.
    #[must_use]
    pub fn is_enabled(&self, method: MethodHandle) -> bool {
        self.record(method).is_some_and(|record| record.is_enabled())
    }

    /// Number of intercepted functions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns `true` if no function was intercepted yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
