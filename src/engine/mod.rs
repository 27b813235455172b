//! The interception engine and the state its hooks share.
//!
//! An [`Engine`] wires the components together for one host: it selects the host's
//! structure layout once, owns the [`EngineContext`] side tables, the hook manager, the
//! compile and token interceptors and the call manager, and exposes the registration API
//! embedders use.
//!
//! # Key Components
//!
//! - [`Engine`] - Construction, install/uninstall and registration
//! - [`EngineContext`] - Token sources, compiled code and native replacement regions
//! - [`ReentrancyGuard`] - Per-thread nesting depth of each hook
//! - [`TwoPhaseInit`] - The lazy installation state of the token and string hooks
//!
//! # Examples
//!
//! ```rust,no_run
//! use jitscope::prelude::*;
//! use std::sync::Arc;
//!
//! # fn example(host: Arc<dyn HostServices>, compiler: VTable) -> jitscope::Result<()> {
//! let engine = Engine::new(EngineConfig::from_env()?, host)?;
//! engine.add_resolver(Arc::new(|context: &mut MethodContext| -> jitscope::Result<()> {
//!     if context.is("App.License", "IsValid") {
//!         context.resolve_il(MethodBody::new(vec![0x17, 0x2A]))?;
//!     }
//!     Ok(())
//! }));
//!
//! unsafe { engine.install(compiler)? };
//! // ... host compiles and runs code ...
//! unsafe { engine.uninstall()? };
//! # Ok(())
//! # }
//! ```

mod context;
mod reentrancy;
mod state;

pub use context::{CompiledMethod, EngineContext};
pub use reentrancy::{current_depth, HookSite, ReentrancyGuard};
pub use state::{InitPhase, TwoPhaseInit};

use std::{
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use tracing::debug;

use crate::{
    chain::ResolverId,
    compile::{
        CompilationInterceptor, MethodResolver, StringResolver, TokenResolutionInterceptor,
        TokenResolver,
    },
    config::EngineConfig,
    host::{HostLayout, HostServices, MethodHandle},
    intercept::{CallInterceptionBuilder, CallInterceptor, CallManager, InterceptTable},
    patch::NativeCodePatcher,
    vtable::{VTable, VTableHookManager},
    Error, Result,
};

static ACTIVE: Mutex<Weak<Engine>> = Mutex::new(Weak::new());

/// One interception engine for one host runtime.
pub struct Engine {
    this: Weak<Self>,
    config: EngineConfig,
    context: Arc<EngineContext>,
    tokens: Arc<TokenResolutionInterceptor>,
    compiler: Arc<CompilationInterceptor>,
    calls: Arc<CallManager>,
}

impl Engine {
    /// Creates an engine for `host`.
    ///
    /// The structure layout is taken from `config` if set, otherwise looked up for the
    /// configured or reported host version. A configured log level installs the global
    /// subscriber.
    ///
    /// # Errors
    /// - [`crate::Error::InvalidConfiguration`] for an inconsistent `config`
    /// - [`crate::Error::UnsupportedHostVersion`] if the version is unknown or has no layout
    /// - [`crate::Error::UnsupportedArchitecture`] on targets without trampolines
    pub fn new(config: EngineConfig, host: Arc<dyn HostServices>) -> Result<Arc<Self>> {
        config.validate()?;
        if config.log_level.is_some() {
            crate::logging::init(config.log_level.as_deref());
        }

        let layout = match config.layout {
            Some(layout) => layout,
            None => {
                let version = config
                    .host_version
                    .or_else(|| host.runtime_version())
                    .ok_or_else(|| Error::UnsupportedHostVersion("unknown".to_string()))?;
                *HostLayout::for_version(version)?
            }
        };

        let context = Arc::new(EngineContext::new(layout, Arc::clone(&host)));
        let hooks = Arc::new(VTableHookManager::new()?);
        let tokens = TokenResolutionInterceptor::new(Arc::clone(&context), Arc::clone(&hooks));
        let calls = CallManager::new(Arc::clone(&host), config.interceptor_threads)?;

        let mut builder = CallInterceptionBuilder::new(host, Arc::clone(calls.table()));
        if config.patch_native_checks {
            builder = builder.with_patcher(Arc::new(NativeCodePatcher::new()));
        }
        let compiler = CompilationInterceptor::new(
            Arc::clone(&context),
            hooks,
            Arc::clone(&tokens),
            builder,
        );

        debug!(family = layout.family, "engine created");
        Ok(Arc::new_cyclic(|this| Engine {
            this: this.clone(),
            config,
            context,
            tokens,
            compiler,
            calls,
        }))
    }

    /// The engine installed last in this process, if it is still installed.
    #[must_use]
    pub fn active() -> Option<Arc<Engine>> {
        lock!(ACTIVE)
            .upgrade()
            .filter(|engine| engine.is_installed())
    }

    /// Hooks the compile entry of `compiler` and publishes this engine as the active one.
    ///
    /// The token and string hooks are installed lazily by the first compilation.
    ///
    /// # Errors
    /// Returns [`crate::Error::AlreadyInstalled`] if this engine is installed, or the hook
    /// manager's error.
    ///
    /// # Safety
    /// `compiler` must be the live vtable of the host's JIT compiler and stay alive until
    /// [`Engine::uninstall`].
    pub unsafe fn install(&self, compiler: VTable) -> Result<()> {
        self.compiler.attach(compiler)?;
        *lock!(ACTIVE) = self.this.clone();
        debug!(table = format_args!("0x{:x}", compiler.base()), "engine installed");
        Ok(())
    }

    /// Removes every hook this engine installed.
    ///
    /// # Errors
    /// Returns [`crate::Error::NotInstalled`] if the engine is not installed, or the first
    /// removal error.
    ///
    /// # Safety
    /// The hooked tables must still be alive.
    pub unsafe fn uninstall(&self) -> Result<()> {
        let outcome = self.compiler.detach();
        let mut active = lock!(ACTIVE);
        if Weak::ptr_eq(&active, &self.this) {
            *active = Weak::new();
        }
        if outcome.is_ok() {
            debug!("engine uninstalled");
        }
        outcome
    }

    /// Returns `true` while the compile hook is installed.
    #[must_use]
    pub fn is_installed(&self) -> bool {
        self.compiler.is_attached()
    }

    /// Installation state of the token and string hooks.
    #[must_use]
    pub fn secondary_phase(&self) -> InitPhase {
        self.compiler.secondary_phase()
    }

    /// Registers a method resolver; resolvers run in registration order.
    pub fn add_resolver(&self, resolver: Arc<dyn MethodResolver>) -> ResolverId {
        self.compiler.add_resolver(resolver)
    }

    /// Unregisters a method resolver.
    pub fn remove_resolver(&self, id: ResolverId) -> bool {
        self.compiler.remove_resolver(id)
    }

    /// Registers a token resolver.
    pub fn add_token_resolver(&self, resolver: Arc<dyn TokenResolver>) -> ResolverId {
        self.tokens.add_resolver(resolver)
    }

    /// Unregisters a token resolver.
    pub fn remove_token_resolver(&self, id: ResolverId) -> bool {
        self.tokens.remove_resolver(id)
    }

    /// Registers a string literal resolver.
    pub fn add_string_resolver(&self, resolver: Arc<dyn StringResolver>) -> ResolverId {
        self.tokens.add_string_resolver(resolver)
    }

    /// Unregisters a string literal resolver.
    pub fn remove_string_resolver(&self, id: ResolverId) -> bool {
        self.tokens.remove_string_resolver(id)
    }

    /// Registers a call interceptor; interceptors run in registration order.
    pub fn add_interceptor(&self, interceptor: Arc<dyn CallInterceptor>) -> ResolverId {
        self.calls.add_interceptor(interceptor)
    }

    /// Unregisters a call interceptor.
    pub fn remove_interceptor(&self, id: ResolverId) -> bool {
        self.calls.remove_interceptor(id)
    }

    /// Records of the functions whose calls are intercepted.
    #[must_use]
    pub fn intercept_table(&self) -> &Arc<InterceptTable> {
        self.calls.table()
    }

    /// The last native code the host published for `method`.
    #[must_use]
    pub fn compiled(&self, method: MethodHandle) -> Option<CompiledMethod> {
        self.context.compiled(method)
    }

    /// Waits until `method` has been compiled, at most `timeout` or the configured default.
    ///
    /// # Errors
    /// Returns [`crate::Error::Timeout`] if the function was not compiled in time.
    pub async fn wait_for_compiled(
        &self,
        method: MethodHandle,
        timeout: Option<Duration>,
    ) -> Result<CompiledMethod> {
        self.context
            .wait_for_compiled(method, timeout.unwrap_or(self.config.wait_timeout))
            .await
    }

    /// The side tables shared by the hooks.
    #[must_use]
    pub fn context(&self) -> &Arc<EngineContext> {
        &self.context
    }

    /// The configuration the engine was created with.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use std::{ffi::c_void, ptr};

    use super::*;
    use crate::{
        compile::CompileMethodFn,
        host::{HostVersion, MethodHandle},
        test::{FakeHost, FakeObject},
    };

    unsafe extern "system" fn compile(
        _this: *mut c_void,
        _comp: *mut c_void,
        _info: *mut c_void,
        _flags: u32,
        entry: *mut *mut u8,
        size: *mut u32,
    ) -> i32 {
        *entry = 0x1234 as *mut u8;
        *size = 7;
        0
    }

    fn engine(host: FakeHost) -> Result<Arc<Engine>> {
        Engine::new(EngineConfig::default().with_interceptor_threads(1), Arc::new(host))
    }

    #[test]
    fn layout_follows_the_host_version() {
        let net8 = engine(FakeHost::new()).unwrap();
        assert_eq!(net8.context().layout().family, "net8");
        assert_eq!(net8.context().layout().slots.resolve_token, 27);

        let host = FakeHost::new();
        host.set_version(Some(HostVersion::new(6, 0, 25)));
        let net6 = engine(host).unwrap();
        assert_eq!(net6.context().layout().family, "net6");
    }

    #[test]
    fn unknown_versions_are_rejected() {
        let host = FakeHost::new();
        host.set_version(None);
        assert!(matches!(engine(host), Err(Error::UnsupportedHostVersion(_))));

        let host = FakeHost::new();
        host.set_version(Some(HostVersion::new(2, 1, 0)));
        assert!(matches!(engine(host), Err(Error::UnsupportedHostVersion(_))));
    }

    #[test]
    fn configured_version_wins() {
        let host = FakeHost::new();
        host.set_version(None);
        let config = EngineConfig::default()
            .with_interceptor_threads(1)
            .with_host_version(HostVersion::new(7, 0, 0));
        let engine = Engine::new(config, Arc::new(host)).unwrap();
        assert_eq!(engine.context().layout().family, "net7");
    }

    #[test]
    fn install_round_trip() {
        let compiler = FakeObject::new(vec![compile as CompileMethodFn as *const () as usize]);
        let engine = engine(FakeHost::new()).unwrap();

        unsafe { engine.install(compiler.vtable()) }.unwrap();
        assert!(engine.is_installed());
        assert_ne!(compiler.slot(0), compile as CompileMethodFn as *const () as usize);
        assert!(matches!(
            unsafe { engine.install(compiler.vtable()) },
            Err(Error::AlreadyInstalled)
        ));

        unsafe { engine.uninstall() }.unwrap();
        assert!(!engine.is_installed());
        assert_eq!(compiler.slot(0), compile as CompileMethodFn as *const () as usize);
        assert!(matches!(unsafe { engine.uninstall() }, Err(Error::NotInstalled)));
    }

    #[test]
    fn hooked_call_without_method_info_is_forwarded() {
        let compiler = FakeObject::new(vec![compile as CompileMethodFn as *const () as usize]);
        let engine = engine(FakeHost::new()).unwrap();
        unsafe { engine.install(compiler.vtable()) }.unwrap();

        let hooked: CompileMethodFn = unsafe { std::mem::transmute(compiler.slot(0)) };
        let mut entry = ptr::null_mut();
        let mut size = 0;
        let result = unsafe {
            hooked(
                compiler.this(),
                ptr::null_mut(),
                ptr::null_mut(),
                0,
                &mut entry,
                &mut size,
            )
        };

        assert_eq!(result, 0);
        assert_eq!(entry as usize, 0x1234);
        assert_eq!(size, 7);
        assert_eq!(engine.secondary_phase(), InitPhase::Uninitialized);
        assert!(engine.compiled(MethodHandle(0x1000)).is_none());

        unsafe { engine.uninstall() }.unwrap();
    }

    #[test]
    fn wait_times_out() {
        let engine = engine(FakeHost::new()).unwrap();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let outcome = runtime.block_on(
            engine.wait_for_compiled(MethodHandle(0x1000), Some(Duration::from_millis(10))),
        );
        assert!(matches!(outcome, Err(Error::Timeout(_))));
    }
}
