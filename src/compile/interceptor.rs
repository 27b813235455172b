//! The primary compile hook.

use std::{
    ffi::c_void,
    panic::{self, AssertUnwindSafe},
    ptr,
    sync::{Arc, LazyLock, Mutex, Weak},
};

use tracing::{debug, error, trace, warn};

use crate::{
    chain::{CallbackChain, ResolverId},
    compile::{
        dispatch::DispatchTable, MethodContext, MethodResolver, Resolution,
        TokenResolutionInterceptor,
    },
    engine::{CompiledMethod, EngineContext, HookSite, InitPhase, ReentrancyGuard, TwoPhaseInit},
    host::{CorJitResult, HostServices, MethodHandle, MethodInfoBlock, MethodInfoOptions},
    intercept::{CallInterceptionBuilder, ShimRequest},
    memory::ExecutableRegion,
    vtable::{HookRecord, VTable, VTableHookManager},
    Error, Result,
};

/// `ICorJitCompiler::compileMethod`
pub type CompileMethodFn = unsafe extern "system" fn(
    this: *mut c_void,
    comp: *mut c_void,
    info: *mut c_void,
    flags: u32,
    entry: *mut *mut u8,
    size: *mut u32,
) -> i32;

static ROUTES: LazyLock<DispatchTable<CompilationInterceptor>> =
    LazyLock::new(DispatchTable::new);

/// The arguments of one `compileMethod` call.
#[derive(Debug, Clone, Copy)]
pub struct CompileCall {
    /// The compiler object
    pub this: *mut c_void,
    /// The compiler's callback object (`ICorJitInfo`)
    pub comp: *mut c_void,
    /// The method info block
    pub info: *mut c_void,
    /// Compilation flags
    pub flags: u32,
    /// Out: entry address
    pub entry: *mut *mut u8,
    /// Out: code size
    pub size: *mut u32,
}

impl CompileCall {
    /// Calls `original` with these arguments.
    ///
    /// # Safety
    /// `original` must be the host's compile entry and the arguments those the host passed.
    pub unsafe fn forward(&self, original: CompileMethodFn) -> i32 {
        original(self.this, self.comp, self.info, self.flags, self.entry, self.size)
    }

    /// Calls `original` with these arguments but separate output slots.
    ///
    /// # Safety
    /// See [`CompileCall::forward`].
    pub unsafe fn forward_into(&self, original: CompileMethodFn, entry: &mut *mut u8, size: &mut u32) -> i32 {
        original(self.this, self.comp, self.info, self.flags, entry, size)
    }

    /// What the output slots currently hold.
    ///
    /// # Safety
    /// The output pointers must be null or valid for reads.
    pub unsafe fn output(&self) -> CompiledMethod {
        CompiledMethod {
            entry: if self.entry.is_null() { 0 } else { *self.entry as usize },
            size: if self.size.is_null() { 0 } else { *self.size },
        }
    }

    /// Overwrites the output slots.
    ///
    /// # Safety
    /// The output pointers must be null or valid for writes.
    pub unsafe fn set_output(&self, compiled: CompiledMethod) {
        if !self.entry.is_null() {
            *self.entry = compiled.entry as *mut u8;
        }
        if !self.size.is_null() {
            *self.size = compiled.size;
        }
    }
}

/// Owner of the compile hook and the method resolver chain.
pub struct CompilationInterceptor {
    this: Weak<Self>,
    context: Arc<EngineContext>,
    hooks: Arc<VTableHookManager>,
    tokens: Arc<TokenResolutionInterceptor>,
    builder: CallInterceptionBuilder,
    resolvers: CallbackChain<dyn MethodResolver>,
    primary: Mutex<Option<Arc<HookRecord>>>,
    secondary: TwoPhaseInit,
}

impl CompilationInterceptor {
    /// Creates a detached interceptor.
    #[must_use]
    pub fn new(
        context: Arc<EngineContext>,
        hooks: Arc<VTableHookManager>,
        tokens: Arc<TokenResolutionInterceptor>,
        builder: CallInterceptionBuilder,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| CompilationInterceptor {
            this: this.clone(),
            context,
            hooks,
            tokens,
            builder,
            resolvers: CallbackChain::new(),
            primary: Mutex::new(None),
            secondary: TwoPhaseInit::new(),
        })
    }

    /// Registers a method resolver.
    pub fn add_resolver(&self, resolver: Arc<dyn MethodResolver>) -> ResolverId {
        self.resolvers.add(resolver)
    }

    /// Unregisters a method resolver.
    pub fn remove_resolver(&self, id: ResolverId) -> bool {
        self.resolvers.remove(id)
    }

    /// Returns `true` while the compile hook is installed.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        lock!(self.primary).is_some()
    }

    /// Phase of the lazily installed token and string hooks.
    #[must_use]
    pub fn secondary_phase(&self) -> InitPhase {
        self.secondary.phase()
    }

    /// Hooks the compile entry of `compiler`.
    ///
    /// # Errors
    /// Returns [`crate::Error::AlreadyInstalled`] if the hook is already installed and the
    /// hook manager's error if the slot cannot be hooked.
    ///
    /// # Safety
    /// `compiler` must be the live vtable of the host's JIT compiler.
    pub unsafe fn attach(&self, compiler: VTable) -> Result<()> {
        let mut primary = lock!(self.primary);
        if primary.is_some() {
            return Err(Error::AlreadyInstalled);
        }

        let slot = compiler.slot(self.context.layout().slots.compile_method);
        let hook = compile_method_hook as CompileMethodFn as *const () as usize;
        let record = self.hooks.install(slot, hook)?;
        ROUTES.register(
            compiler.base(),
            HookSite::Compile,
            self.this.clone(),
            record.original_function(),
        );
        debug!(table = format_args!("0x{:x}", compiler.base()), "attached compile hook");
        *primary = Some(record);
        Ok(())
    }

    /// Removes the compile hook and the token and string hooks.
    ///
    /// # Errors
    /// Returns [`crate::Error::NotInstalled`] if nothing is attached, otherwise the first
    /// removal error.
    ///
    /// # Safety
    /// The hooked tables must still be alive.
    pub unsafe fn detach(&self) -> Result<()> {
        let record = lock!(self.primary).take().ok_or(Error::NotInstalled)?;
        ROUTES.release(record.slot().table(), HookSite::Compile);
        let mut outcome = self.hooks.remove(record);

        if self.tokens.is_attached() {
            let detached = self.tokens.detach();
            if outcome.is_ok() {
                outcome = detached;
            }
        }
        self.secondary.reset();
        debug!("detached compile hook");
        outcome
    }

    /// The installed hook, held by the caller for as long as it may jump through the
    /// record's trampoline.
    fn hook(&self) -> Option<Arc<HookRecord>> {
        lock!(self.primary).clone()
    }

    /// Handles one `compileMethod` call.
    ///
    /// # Safety
    /// `call` must hold the arguments the host passed to the hooked entry; `fallback` must
    /// be the original entry.
    pub unsafe fn compile(&self, call: CompileCall, fallback: CompileMethodFn) -> i32 {
        // Removal frees the trampoline with the last handle, so `hook` lives until we return.
        let hook = self.hook();
        let original = match &hook {
            Some(record) => std::mem::transmute::<usize, CompileMethodFn>(record.original()),
            None => fallback,
        };

        let guard = ReentrancyGuard::enter(HookSite::Compile);
        if guard.is_nested() {
            return call.forward(original);
        }

        let Some(info) = MethodInfoBlock::from_raw(call.info, self.context.layout().method_info)
        else {
            trace!(error = %Error::FunctionNotResolvable(0), "compile without method info");
            return call.forward(original);
        };
        let method = info.method();
        if method.is_null() {
            trace!(
                error = %Error::FunctionNotResolvable(call.info as usize),
                "compile without function identity"
            );
            return call.forward(original);
        }

        self.bootstrap(call.comp);

        let result = match self.resolve(&info, method) {
            None => call.forward(original),
            Some(resolution) => self.apply(call, original, &info, method, resolution),
        };

        if CorJitResult::is_ok(result) {
            self.context.record_compiled(method, call.output());
        }
        result
    }

    fn bootstrap(&self, comp: *mut c_void) {
        if comp.is_null() || self.secondary.phase() != InitPhase::Uninitialized {
            return;
        }

        let tokens = &self.tokens;
        match self
            .secondary
            .run(|| unsafe { tokens.attach(VTable::of_instance(comp)) })
        {
            Ok(true) => debug!("token and string hooks active"),
            Ok(false) => {}
            Err(error) => warn!(%error, "token and string hooks unavailable"),
        }
    }

    fn resolve(&self, info: &MethodInfoBlock, method: MethodHandle) -> Option<Resolution> {
        if self.resolvers.is_empty() {
            return None;
        }

        let mut context = MethodContext::new(
            method,
            info.module(),
            self.context.token_source(method),
            info.il(),
            self.context.host(),
        );
        for resolver in self.resolvers.snapshot() {
            match panic::catch_unwind(AssertUnwindSafe(|| resolver.resolve(&mut context))) {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    warn!(%method, %error, "method resolver failed");
                    context.reset();
                    return None;
                }
                Err(_) => {
                    warn!(%method, "method resolver panicked");
                    context.reset();
                    return None;
                }
            }
            if context.is_resolved() {
                break;
            }
        }

        let resolution = context.into_resolution();
        if let Some(resolution) = &resolution {
            trace!(%method, state = %resolution.state(), "resolved");
        }
        resolution
    }

    unsafe fn apply(
        &self,
        call: CompileCall,
        original: CompileMethodFn,
        info: &MethodInfoBlock,
        method: MethodHandle,
        resolution: Resolution,
    ) -> i32 {
        match resolution {
            Resolution::IL(body) => {
                let snapshot = info.snapshot();
                info.apply_body(&body);
                let result = call.forward(original);
                info.restore(&snapshot);
                result
            }
            Resolution::Native(code) => {
                let result = call.forward(original);
                if !CorJitResult::is_ok(result) {
                    return result;
                }
                match ExecutableRegion::from_code(&code) {
                    Ok(region) => {
                        let size = u32::try_from(region.len()).unwrap_or(u32::MAX);
                        let entry = self.context.retain_region(region);
                        call.set_output(CompiledMethod { entry, size });
                        trace!(%method, entry = format_args!("0x{entry:x}"), "installed native code");
                    }
                    Err(error) => warn!(%method, %error, "native replacement dropped"),
                }
                result
            }
            Resolution::Entry { address, size } => {
                let result = call.forward(original);
                if CorJitResult::is_ok(result) {
                    let size = size.unwrap_or_else(|| call.output().size);
                    call.set_output(CompiledMethod {
                        entry: address,
                        size,
                    });
                }
                result
            }
            Resolution::Intercept => self.intercept(call, original, info, method),
        }
    }

    unsafe fn intercept(
        &self,
        call: CompileCall,
        original: CompileMethodFn,
        info: &MethodInfoBlock,
        method: MethodHandle,
    ) -> i32 {
        let host = self.context.host();
        let Some(descriptor) = host.describe_method(method) else {
            debug!(%method, "no descriptor, compiling without call interception");
            return call.forward(original);
        };

        let result = call.forward(original);
        if !CorJitResult::is_ok(result) {
            return result;
        }

        let generic_context = match generic_context(host.as_ref(), info, method) {
            Ok(context) => context,
            Err(error) => {
                warn!(%method, %error, "call interception failed, keeping the real entry");
                return result;
            }
        };
        let mut instantiation = info.class_instantiation();
        instantiation.extend(info.method_instantiation());

        let request = ShimRequest {
            descriptor: &descriptor,
            module: info.module(),
            real: call.output(),
            instantiation,
            generic_context,
        };
        let shim = self.builder.build(&request, |body| {
            let snapshot = info.snapshot();
            info.apply_body(body);
            let mut entry: *mut u8 = ptr::null_mut();
            let mut size = 0u32;
            let code = call.forward_into(original, &mut entry, &mut size);
            info.restore(&snapshot);

            if !CorJitResult::is_ok(code) {
                return Err(Error::Shim(format!("host rejected the shim with result {code:#x}")));
            }
            Ok(CompiledMethod {
                entry: entry as usize,
                size,
            })
        });

        match shim {
            Ok(compiled) => call.set_output(compiled),
            Err(error) => warn!(%method, %error, "call interception failed, keeping the real entry"),
        }
        result
    }
}

/// The hidden instantiation argument the real implementation expects, if any.
fn generic_context(
    host: &dyn HostServices,
    info: &MethodInfoBlock,
    method: MethodHandle,
) -> Result<Option<usize>> {
    let options = info.options();
    if options.contains(MethodInfoOptions::GENERICS_CONTEXT_FROM_METHOD_DESC) {
        return Ok(Some(method.raw()));
    }
    if options.contains(MethodInfoOptions::GENERICS_CONTEXT_FROM_METHOD_TABLE) {
        return host
            .declaring_class(method)
            .map(|class| Some(class.raw()))
            .ok_or_else(|| Error::Shim(format!("no declaring class for shared code of {method}")));
    }
    Ok(None)
}

unsafe extern "system" fn compile_method_hook(
    this: *mut c_void,
    comp: *mut c_void,
    info: *mut c_void,
    flags: u32,
    entry: *mut *mut u8,
    size: *mut u32,
) -> i32 {
    if this.is_null() {
        return CorJitResult::InternalError as i32;
    }
    let table = VTable::of_instance(this).base();
    let Some(route) = ROUTES.route(table, HookSite::Compile) else {
        error!(table = format_args!("0x{table:x}"), "compile hook without route");
        return CorJitResult::InternalError as i32;
    };
    let fallback = std::mem::transmute::<usize, CompileMethodFn>(route.original);
    let call = CompileCall {
        this,
        comp,
        info,
        flags,
        entry,
        size,
    };

    match route.owner {
        Some(owner) => panic::catch_unwind(AssertUnwindSafe(|| owner.compile(call, fallback)))
            .unwrap_or_else(|_| {
                error!("panic in compile hook");
                call.forward(fallback)
            }),
        None => call.forward(fallback),
    }
}
