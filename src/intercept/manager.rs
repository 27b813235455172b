use std::{
    cell::Cell,
    ffi::c_void,
    future::Future,
    panic::{self, AssertUnwindSafe},
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    task::{Context, Poll},
};

use tokio::runtime::Runtime;
use tracing::{error, trace, warn};

use crate::{
    chain::{CallbackChain, ResolverId},
    host::{HostServices, ReturnShape, ValueShape},
    intercept::{BoxedRef, CallContext, CallInterceptor, InterceptRecord, InterceptTable},
    utils::CompletionSemaphore,
    Error, Result,
};

tokio::task_local! {
    /// Set while an interceptor chain runs on the current task.
    static CHAIN_ACTIVE: bool;
}

static NEXT_MANAGER_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    /// Id of the manager whose runtime started the current thread, 0 on foreign threads.
    static RUNTIME_OWNER: Cell<usize> = const { Cell::new(0) };
}

/// Signature of [`call_manager_entry`].
pub type CallManagerEntryFn = unsafe extern "C" fn(
    record: usize,
    args: *const *mut c_void,
    count: i32,
    ret: *mut c_void,
    generic_context: usize,
) -> i32;

/// Releases a permit when the chain task finishes or is dropped.
struct ReleaseOnDrop(Arc<CompletionSemaphore>);

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// Turns a panic while polling the inner future into an error value.
struct CatchUnwind<F>(F);

impl<F: Future + Unpin> Future for CatchUnwind<F> {
    type Output = std::thread::Result<F::Output>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let inner = &mut self.0;
        match panic::catch_unwind(AssertUnwindSafe(|| Pin::new(&mut *inner).poll(cx))) {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(output)) => Poll::Ready(Ok(output)),
            Err(payload) => Poll::Ready(Err(payload)),
        }
    }
}

async fn run_chain(mut context: CallContext, chain: Vec<Arc<dyn CallInterceptor>>) -> bool {
    for interceptor in chain {
        let outcome = CatchUnwind(Box::pin(async { interceptor.intercept(&mut context).await })).await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(error)) => warn!(method = %context.method(), %error, "call interceptor failed"),
            Err(_) => warn!(method = %context.method(), "call interceptor panicked"),
        }
        if !context.proceed() {
            trace!(method = %context.method(), "original call skipped");
            break;
        }
    }
    context.proceed()
}

/// Runs the interceptor chain for calls arriving from shims.
///
/// The manager owns a multi-threaded tokio runtime. A shim thread packages its arguments
/// into a [`CallContext`], spawns the chain on the runtime and blocks on a
/// [`CompletionSemaphore`] until the chain is done; the chain's proceed flag becomes the
/// shim's branch condition.
pub struct CallManager {
    id: usize,
    host: Arc<dyn HostServices>,
    runtime: Option<Runtime>,
    interceptors: CallbackChain<dyn CallInterceptor>,
    table: Arc<InterceptTable>,
}

impl CallManager {
    /// Starts a manager with `worker_threads` interceptor threads.
    ///
    /// # Errors
    /// Returns [`crate::Error::Interceptor`] if the runtime cannot be started.
    pub fn new(host: Arc<dyn HostServices>, worker_threads: usize) -> Result<Arc<Self>> {
        let id = NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name("jitscope-intercept")
            .on_thread_start(move || RUNTIME_OWNER.with(|owner| owner.set(id)))
            .enable_time()
            .build()
            .map_err(|error| Error::Interceptor(format!("cannot start interceptor runtime: {error}")))?;

        Ok(Arc::new_cyclic(|this| CallManager {
            id,
            host,
            runtime: Some(runtime),
            interceptors: CallbackChain::new(),
            table: Arc::new(InterceptTable::new(this.clone())),
        }))
    }

    /// Registers a call interceptor.
    pub fn add_interceptor(&self, interceptor: Arc<dyn CallInterceptor>) -> ResolverId {
        self.interceptors.add(interceptor)
    }

    /// Unregisters a call interceptor.
    pub fn remove_interceptor(&self, id: ResolverId) -> bool {
        self.interceptors.remove(id)
    }

    /// The intercepted functions.
    #[must_use]
    pub fn table(&self) -> &Arc<InterceptTable> {
        &self.table
    }

    /// Address of the entry shims call.
    #[must_use]
    pub fn entry_point() -> usize {
        call_manager_entry as CallManagerEntryFn as *const () as usize
    }

    /// Runs the chain for one call of `record`'s function and returns the proceed flag.
    ///
    /// # Safety
    /// `args` must point to `count` argument addresses laid out as the record's shape
    /// describes and `ret` must be null or point to the return slot; all of them must stay
    /// valid until this returns.
    pub unsafe fn enter(
        &self,
        record: &InterceptRecord,
        args: *const *mut c_void,
        count: usize,
        ret: *mut c_void,
        generic_context: usize,
    ) -> bool {
        let method = record.method();
        if !record.is_enabled() {
            trace!(%method, "interception disabled");
            return true;
        }
        if CHAIN_ACTIVE.try_with(|active| *active).unwrap_or(false) {
            trace!(%method, "call from inside an interceptor proceeds directly");
            return true;
        }

        let chain: Vec<_> = self
            .interceptors
            .snapshot()
            .into_iter()
            .filter(|interceptor| interceptor.applies_to(method))
            .collect();
        if chain.is_empty() {
            return true;
        }

        let shape = record.shape();
        if count != shape.parameters.len() || (count > 0 && args.is_null()) {
            warn!(
                %method,
                expected = shape.parameters.len(),
                count,
                "shim passed unexpected arguments"
            );
            return true;
        }

        let parameters = shape
            .parameters
            .iter()
            .enumerate()
            .map(|(index, value)| BoxedRef::new(*args.add(index), *value))
            .collect();
        let return_value = match shape.return_shape {
            _ if ret.is_null() => None,
            ReturnShape::Void => None,
            ReturnShape::Value(value) => Some(BoxedRef::new(ret, value)),
            ReturnShape::Task => Some(BoxedRef::new(ret, ValueShape::ObjectRef)),
        };

        let mut generic_arguments = if generic_context == 0 {
            Vec::new()
        } else {
            self.host.generic_arguments(generic_context)
        };
        if generic_arguments.is_empty() {
            generic_arguments = record.generic_arguments().to_vec();
        }

        let context = CallContext::new(
            method,
            shape.has_this,
            parameters,
            return_value,
            generic_arguments,
        );
        self.dispatch(context, chain)
    }

    fn owns_current_thread(&self) -> bool {
        RUNTIME_OWNER.with(Cell::get) == self.id
    }

    fn dispatch(&self, context: CallContext, chain: Vec<Arc<dyn CallInterceptor>>) -> bool {
        let Some(runtime) = &self.runtime else {
            return true;
        };
        let method = context.method();

        let done = Arc::new(CompletionSemaphore::new(0));
        let outcome = Arc::new(Mutex::new(None));
        let release = ReleaseOnDrop(Arc::clone(&done));
        let slot = Arc::clone(&outcome);
        runtime.spawn(CHAIN_ACTIVE.scope(true, async move {
            let _release = release;
            let proceed = run_chain(context, chain).await;
            *lock!(slot) = Some(proceed);
        }));

        if self.owns_current_thread() {
            // One of our workers, e.g. a task an interceptor spawned. Its core moves to
            // another thread while it waits so the chain can still be scheduled.
            trace!(%method, "waiting on an interceptor worker");
            tokio::task::block_in_place(|| done.acquire());
        } else {
            done.acquire();
        }

        let proceed = lock!(outcome).take();
        proceed.unwrap_or_else(|| {
            warn!(%method, "interceptor chain did not complete");
            true
        })
    }
}

impl Drop for CallManager {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// The entry every shim calls before the real implementation.
///
/// Returns 1 if the real implementation should run and 0 if it is skipped.
///
/// # Safety
/// `record` must be 0 or the address of a live [`InterceptRecord`]; the other arguments
/// follow [`CallManager::enter`].
pub unsafe extern "C" fn call_manager_entry(
    record: usize,
    args: *const *mut c_void,
    count: i32,
    ret: *mut c_void,
    generic_context: usize,
) -> i32 {
    if record == 0 {
        return 1;
    }
    let record = &*(record as *const InterceptRecord);
    let Some(manager) = record.manager() else {
        return 1;
    };
    let count = usize::try_from(count).unwrap_or(0);

    panic::catch_unwind(AssertUnwindSafe(|| {
        manager.enter(record, args, count, ret, generic_context)
    }))
    .map_or_else(
        |_| {
            error!(method = %record.method(), "panic in call manager");
            1
        },
        i32::from,
    )
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{
        host::MethodHandle,
        intercept::{FnInterceptor, InterceptFuture, ShimShape},
        test::FakeHost,
    };

    fn sum_shape() -> ShimShape {
        ShimShape {
            has_this: false,
            generic_context: false,
            parameters: vec![ValueShape::I4, ValueShape::I4],
            return_shape: ReturnShape::Value(ValueShape::I4),
        }
    }

    fn manager() -> Arc<CallManager> {
        CallManager::new(Arc::new(FakeHost::new()), 1).unwrap()
    }

    #[test]
    fn interceptors_mutate_arguments() {
        let manager = manager();
        let method = MethodHandle(0x700);
        let record = manager.table().get_or_insert(method, sum_shape(), Vec::new());
        manager.add_interceptor(Arc::new(
            FnInterceptor::new(|context: &mut CallContext| {
                let first: i32 = context.get_parameter(0)?;
                context.set_parameter(0, first * 2)
            })
            .for_method(method),
        ));

        let mut a = 2i32;
        let mut b = 5i32;
        let mut result = 0i32;
        let args = [(&mut a as *mut i32).cast::<c_void>(), (&mut b as *mut i32).cast()];
        let proceed = unsafe {
            call_manager_entry(
                record.address(),
                args.as_ptr(),
                2,
                (&mut result as *mut i32).cast(),
                0,
            )
        };

        assert_eq!(proceed, 1);
        assert_eq!(a, 4);
        assert_eq!(b, 5);
    }

    #[test]
    fn skipping_ends_the_chain() {
        let manager = manager();
        let method = MethodHandle(0x710);
        let record = manager.table().get_or_insert(method, sum_shape(), Vec::new());
        let later = Arc::new(AtomicUsize::new(0));

        manager.add_interceptor(Arc::new(FnInterceptor::new(|_: &mut CallContext| {
            panic!("interceptor bug")
        })));
        manager.add_interceptor(Arc::new(FnInterceptor::new(|context: &mut CallContext| {
            context.set_return_value(11i32)?;
            context.skip_original();
            Ok(())
        })));
        let counter = Arc::clone(&later);
        manager.add_interceptor(Arc::new(FnInterceptor::new(move |_: &mut CallContext| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })));

        let mut a = 2i32;
        let mut b = 5i32;
        let mut result = 0i32;
        let args = [(&mut a as *mut i32).cast::<c_void>(), (&mut b as *mut i32).cast()];
        let proceed = unsafe {
            manager.enter(&record, args.as_ptr(), 2, (&mut result as *mut i32).cast(), 0)
        };

        assert!(!proceed);
        assert_eq!(result, 11);
        assert_eq!(later.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn disabled_and_nested_calls_proceed() {
        let manager = manager();
        let method = MethodHandle(0x720);
        let record = manager.table().get_or_insert(method, sum_shape(), Vec::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        manager.add_interceptor(Arc::new(FnInterceptor::new(move |context: &mut CallContext| {
            counter.fetch_add(1, Ordering::SeqCst);
            context.skip_original();
            Ok(())
        })));

        let mut a = 1i32;
        let mut b = 1i32;
        let args = [(&mut a as *mut i32).cast::<c_void>(), (&mut b as *mut i32).cast()];

        manager.table().disable(method).unwrap();
        assert!(unsafe { manager.enter(&record, args.as_ptr(), 2, std::ptr::null_mut(), 0) });

        manager.table().enable(method).unwrap();
        let nested = CHAIN_ACTIVE.sync_scope(true, || unsafe {
            manager.enter(&record, args.as_ptr(), 2, std::ptr::null_mut(), 0)
        });
        assert!(nested);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert!(!unsafe { manager.enter(&record, args.as_ptr(), 2, std::ptr::null_mut(), 0) });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn argument_count_mismatch_proceeds() {
        let manager = manager();
        let record = manager
            .table()
            .get_or_insert(MethodHandle(0x730), sum_shape(), Vec::new());
        manager.add_interceptor(Arc::new(FnInterceptor::new(|context: &mut CallContext| {
            context.skip_original();
            Ok(())
        })));

        assert!(unsafe { manager.enter(&record, std::ptr::null(), 1, std::ptr::null_mut(), 0) });
    }

    fn no_arguments() -> ShimShape {
        ShimShape {
            has_this: false,
            generic_context: false,
            parameters: Vec::new(),
            return_shape: ReturnShape::Void,
        }
    }

    /// Calls another intercepted function from a task it spawns on the runtime.
    struct SpawnsCall {
        method: MethodHandle,
        callee: usize,
        proceeded: Arc<AtomicUsize>,
    }

    impl CallInterceptor for SpawnsCall {
        fn applies_to(&self, method: MethodHandle) -> bool {
            method == self.method
        }

        fn intercept<'a>(&'a self, _context: &'a mut CallContext) -> InterceptFuture<'a> {
            let callee = self.callee;
            Box::pin(async move {
                let proceed = tokio::spawn(async move {
                    unsafe { call_manager_entry(callee, std::ptr::null(), 0, std::ptr::null_mut(), 0) }
                })
                .await
                .map_err(|error| Error::Interceptor(error.to_string()))?;
                self.proceeded.store(proceed as usize, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    #[test]
    fn spawned_calls_do_not_starve_a_single_worker() {
        let manager = manager();
        let outer = MethodHandle(0x740);
        let inner = MethodHandle(0x750);
        let outer_record = manager.table().get_or_insert(outer, no_arguments(), Vec::new());
        let inner_record = manager.table().get_or_insert(inner, no_arguments(), Vec::new());

        let inner_calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&inner_calls);
        manager.add_interceptor(Arc::new(
            FnInterceptor::new(move |_: &mut CallContext| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .for_method(inner),
        ));
        let proceeded = Arc::new(AtomicUsize::new(0));
        manager.add_interceptor(Arc::new(SpawnsCall {
            method: outer,
            callee: inner_record.address(),
            proceeded: Arc::clone(&proceeded),
        }));

        let proceed =
            unsafe { manager.enter(&outer_record, std::ptr::null(), 0, std::ptr::null_mut(), 0) };

        assert!(proceed);
        assert_eq!(inner_calls.load(Ordering::SeqCst), 1);
        assert_eq!(proceeded.load(Ordering::SeqCst), 1);
    }
}
