//! Side tables shared by the hooks of one engine.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use crossbeam_skiplist::SkipMap;
use tokio::sync::Notify;
use tracing::trace;

use crate::{
    host::{HostLayout, HostServices, MethodHandle},
    memory::ExecutableRegion,
    Error, Result,
};

/// Native code the host produced (or was handed) for a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompiledMethod {
    /// Entry address
    pub entry: usize,
    /// Code size in bytes
    pub size: u32,
}

/// State owned by an engine and shared by all of its hooks.
///
/// Reads go straight to lock-free skip lists and may observe slightly stale data. Mutations
/// that must not interleave, like check-then-insert on the token source map, take the single
/// coarse mutation lock.
pub struct EngineContext {
    layout: HostLayout,
    host: Arc<dyn HostServices>,
    mutation: Mutex<()>,
    /// compiled function -> function whose compilation referenced it
    token_sources: SkipMap<MethodHandle, MethodHandle>,
    compiled: SkipMap<MethodHandle, CompiledMethod>,
    compiled_signal: Notify,
    /// Code of native replacements; never released, the host may call it at any time
    regions: boxcar::Vec<ExecutableRegion>,
}

impl EngineContext {
    /// Creates empty tables for a host with the given layout.
    #[must_use]
    pub fn new(layout: HostLayout, host: Arc<dyn HostServices>) -> Self {
        EngineContext {
            layout,
            host,
            mutation: Mutex::new(()),
            token_sources: SkipMap::new(),
            compiled: SkipMap::new(),
            compiled_signal: Notify::new(),
            regions: boxcar::Vec::new(),
        }
    }

    /// The structure layout of the host.
    #[must_use]
    pub fn layout(&self) -> &HostLayout {
        &self.layout
    }

    /// The host services.
    #[must_use]
    pub fn host(&self) -> Arc<dyn HostServices> {
        Arc::clone(&self.host)
    }

    /// Records that compiling `source` referenced `target`.
    ///
    /// The first source seen for a target is kept. Returns `true` if the entry was added.
    pub fn record_token_source(&self, target: MethodHandle, source: MethodHandle) -> bool {
        if target.is_null() || source.is_null() || self.token_sources.contains_key(&target) {
            return false;
        }

        let _guard = lock!(self.mutation);
        if self.token_sources.contains_key(&target) {
            return false;
        }
        self.token_sources.insert(target, source);
        trace!(%target, %source, "recorded token source");
        true
    }

    /// The function whose compilation first referenced `target`.
    #[must_use]
    pub fn token_source(&self, target: MethodHandle) -> Option<MethodHandle> {
        self.token_sources.get(&target).map(|entry| *entry.value())
    }

    /// Number of recorded token sources.
    #[must_use]
    pub fn token_source_count(&self) -> usize {
        self.token_sources.len()
    }

    /// Records the final native code of `method` and wakes anyone waiting for it.
    pub fn record_compiled(&self, method: MethodHandle, compiled: CompiledMethod) {
        if method.is_null() || compiled.entry == 0 {
            return;
        }

        {
            let _guard = lock!(self.mutation);
            self.compiled.insert(method, compiled);
        }
        self.compiled_signal.notify_waiters();
    }

    /// The last recorded native code of `method`.
    #[must_use]
    pub fn compiled(&self, method: MethodHandle) -> Option<CompiledMethod> {
        self.compiled.get(&method).map(|entry| *entry.value())
    }

    /// Waits until `method` has been compiled, at most `timeout`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Timeout`] if the function was not compiled in time.
    pub async fn wait_for_compiled(
        &self,
        method: MethodHandle,
        timeout: Duration,
    ) -> Result<CompiledMethod> {
        let wait = async {
            loop {
                let notified = self.compiled_signal.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if let Some(compiled) = self.compiled(method) {
                    return compiled;
                }
                notified.await;
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::Timeout(timeout))
    }

    /// Keeps `region` alive for the lifetime of the engine and returns its entry address.
    pub fn retain_region(&self, region: ExecutableRegion) -> usize {
        let address = region.address();
        self.regions.push(region);
        address
    }

    /// Number of native replacement regions created so far.
    #[must_use]
    pub fn region_count(&self) -> usize {
        self.regions.count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{host::HostVersion, test::FakeHost};

    fn context() -> Arc<EngineContext> {
        let layout = *HostLayout::for_version(HostVersion::new(8, 0, 0)).unwrap();
        Arc::new(EngineContext::new(layout, Arc::new(FakeHost::new())))
    }

    #[test]
    fn first_token_source_wins() {
        let context = context();
        assert!(context.record_token_source(MethodHandle(0x20), MethodHandle(0x10)));
        assert!(!context.record_token_source(MethodHandle(0x20), MethodHandle(0x30)));
        assert!(!context.record_token_source(MethodHandle::NULL, MethodHandle(0x30)));

        assert_eq!(context.token_source(MethodHandle(0x20)), Some(MethodHandle(0x10)));
        assert_eq!(context.token_source(MethodHandle(0x10)), None);
        assert_eq!(context.token_source_count(), 1);
    }

    #[test]
    fn compiled_cache_keeps_last_entry() {
        let context = context();
        let method = MethodHandle(0x40);
        context.record_compiled(method, CompiledMethod { entry: 0x1000, size: 8 });
        context.record_compiled(method, CompiledMethod { entry: 0x2000, size: 16 });
        context.record_compiled(MethodHandle(0x50), CompiledMethod { entry: 0, size: 0 });

        assert_eq!(
            context.compiled(method),
            Some(CompiledMethod { entry: 0x2000, size: 16 })
        );
        assert_eq!(context.compiled(MethodHandle(0x50)), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn wait_for_compiled_wakes_up() {
        let context = context();
        let method = MethodHandle(0x60);

        let writer = Arc::clone(&context);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.record_compiled(method, CompiledMethod { entry: 0x3000, size: 4 });
        });

        let compiled = context
            .wait_for_compiled(method, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(compiled.entry, 0x3000);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn wait_for_compiled_times_out() {
        let context = context();
        let outcome = context
            .wait_for_compiled(MethodHandle(0x70), Duration::from_millis(10))
            .await;
        assert!(matches!(outcome, Err(Error::Timeout(_))));
    }
}
