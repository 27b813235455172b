//! Hooks on the compiler's callback interface.
//!
//! While compiling a function the JIT asks the host to resolve every token the IL refers to.
//! The resolved token block names both the requesting function (its token context) and the
//! resolved target, which gives the engine the caller of every function that is compiled
//! later. The same callback table also constructs string literals, which string resolvers
//! can replace.

use std::{
    collections::HashMap,
    ffi::c_void,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, LazyLock, Mutex, Weak},
};

use tracing::{debug, error, trace, warn};
use widestring::{U16Str, U16String};

use crate::{
    chain::{CallbackChain, ResolverId},
    compile::dispatch::DispatchTable,
    engine::{EngineContext, HookSite, ReentrancyGuard},
    host::{ClassHandle, FieldHandle, MethodHandle, ModuleHandle, ResolvedTokenBlock, Token},
    vtable::{HookRecord, VTable, VTableHookManager},
    Error, Result,
};

/// `ICorJitInfo::resolveToken`
pub type ResolveTokenFn = unsafe extern "system" fn(this: *mut c_void, resolved_token: *mut c_void);

/// `ICorJitInfo::constructStringLiteral`, returning an `InfoAccessType`
pub type ConstructStringLiteralFn = unsafe extern "system" fn(
    this: *mut c_void,
    module: *mut c_void,
    token: u32,
    value: *mut *mut c_void,
) -> i32;

static ROUTES: LazyLock<DispatchTable<TokenResolutionInterceptor>> =
    LazyLock::new(DispatchTable::new);

/// Handles replacing what the host resolved a reference to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenOverride {
    /// Replacement class handle
    pub class: Option<ClassHandle>,
    /// Replacement method handle
    pub method: Option<MethodHandle>,
    /// Replacement field handle
    pub field: Option<FieldHandle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenDecision {
    Redirect { scope: ModuleHandle, token: Token },
    Override(TokenOverride),
}

/// A reference the compiler is about to resolve.
pub struct TokenContext {
    source: Option<MethodHandle>,
    scope: ModuleHandle,
    token: Token,
    token_type: u32,
    decision: Option<TokenDecision>,
}

impl TokenContext {
    /// Creates an unresolved context.
    #[must_use]
    pub fn new(source: Option<MethodHandle>, scope: ModuleHandle, token: Token, token_type: u32) -> Self {
        TokenContext {
            source,
            scope,
            token,
            token_type,
            decision: None,
        }
    }

    /// The function whose IL contains the reference, if known.
    #[must_use]
    pub fn source(&self) -> Option<MethodHandle> {
        self.source
    }

    /// Module the token belongs to.
    #[must_use]
    pub fn scope(&self) -> ModuleHandle {
        self.scope
    }

    /// The token being resolved.
    #[must_use]
    pub fn token(&self) -> Token {
        self.token
    }

    /// The host's `CorInfoTokenKind` of the request.
    #[must_use]
    pub fn token_type(&self) -> u32 {
        self.token_type
    }

    /// Returns `true` once a resolver took a decision.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.decision.is_some()
    }

    fn decide(&mut self, decision: TokenDecision) -> Result<()> {
        if self.decision.is_some() {
            return Err(malformed_error!("Reference {} was already resolved", self.token));
        }
        self.decision = Some(decision);
        Ok(())
    }

    /// Resolve `token` in `scope` instead of the original reference.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the reference was already resolved.
    pub fn redirect(&mut self, scope: ModuleHandle, token: Token) -> Result<()> {
        self.decide(TokenDecision::Redirect { scope, token })
    }

    /// Let the host resolve the reference, then replace the resulting handles.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the reference was already resolved.
    pub fn override_result(&mut self, handles: TokenOverride) -> Result<()> {
        self.decide(TokenDecision::Override(handles))
    }
}

impl fmt::Debug for TokenContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenContext")
            .field("source", &self.source)
            .field("scope", &self.scope)
            .field("token", &self.token)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

/// Redirects or overrides references while a function is compiled.
///
/// Token resolvers run in registration order; the first one that resolves the context ends
/// the chain. Errors and panics are logged and leave the reference untouched.
pub trait TokenResolver: Send + Sync {
    /// Inspects, and possibly resolves, `context`.
    ///
    /// # Errors
    /// Any error leaves the reference to the host.
    fn resolve(&self, context: &mut TokenContext) -> Result<()>;
}

impl<F> TokenResolver for F
where
    F: Fn(&mut TokenContext) -> Result<()> + Send + Sync,
{
    fn resolve(&self, context: &mut TokenContext) -> Result<()> {
        self(context)
    }
}

/// A string literal the compiler is about to embed.
#[derive(Debug)]
pub struct StringContext {
    module: ModuleHandle,
    token: Token,
    replacement: Option<U16String>,
}

impl StringContext {
    /// Creates a context without replacement.
    #[must_use]
    pub fn new(module: ModuleHandle, token: Token) -> Self {
        StringContext {
            module,
            token,
            replacement: None,
        }
    }

    /// Module of the literal.
    #[must_use]
    pub fn module(&self) -> ModuleHandle {
        self.module
    }

    /// `UserString` token of the literal.
    #[must_use]
    pub fn token(&self) -> Token {
        self.token
    }

    /// Embed `value` instead of the original literal.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if a replacement was already supplied.
    pub fn replace(&mut self, value: U16String) -> Result<()> {
        if self.replacement.is_some() {
            return Err(malformed_error!("Literal {} already has a replacement", self.token));
        }
        self.replacement = Some(value);
        Ok(())
    }

    /// Embed `value` instead of the original literal.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if a replacement was already supplied.
    pub fn replace_str(&mut self, value: &str) -> Result<()> {
        self.replace(U16String::from_str(value))
    }

    /// The replacement, if any.
    #[must_use]
    pub fn replacement(&self) -> Option<&U16Str> {
        self.replacement.as_deref()
    }
}

/// Replaces string literals while a function is compiled.
pub trait StringResolver: Send + Sync {
    /// Inspects, and possibly replaces, the literal of `context`.
    ///
    /// # Errors
    /// Any error keeps the original literal.
    fn resolve(&self, context: &mut StringContext) -> Result<()>;
}

impl<F> StringResolver for F
where
    F: Fn(&mut StringContext) -> Result<()> + Send + Sync,
{
    fn resolve(&self, context: &mut StringContext) -> Result<()> {
        self(context)
    }
}

/// Owner of the token resolution and string literal hooks.
pub struct TokenResolutionInterceptor {
    this: Weak<Self>,
    context: Arc<EngineContext>,
    hooks: Arc<VTableHookManager>,
    resolvers: CallbackChain<dyn TokenResolver>,
    strings: CallbackChain<dyn StringResolver>,
    installed: Mutex<HashMap<HookSite, Arc<HookRecord>>>,
}

impl TokenResolutionInterceptor {
    /// Creates a detached interceptor.
    #[must_use]
    pub fn new(context: Arc<EngineContext>, hooks: Arc<VTableHookManager>) -> Arc<Self> {
        Arc::new_cyclic(|this| TokenResolutionInterceptor {
            this: this.clone(),
            context,
            hooks,
            resolvers: CallbackChain::new(),
            strings: CallbackChain::new(),
            installed: Mutex::new(HashMap::new()),
        })
    }

    /// Registers a token resolver.
    pub fn add_resolver(&self, resolver: Arc<dyn TokenResolver>) -> ResolverId {
        self.resolvers.add(resolver)
    }

    /// Unregisters a token resolver.
    pub fn remove_resolver(&self, id: ResolverId) -> bool {
        self.resolvers.remove(id)
    }

    /// Registers a string resolver.
    pub fn add_string_resolver(&self, resolver: Arc<dyn StringResolver>) -> ResolverId {
        self.strings.add(resolver)
    }

    /// Unregisters a string resolver.
    pub fn remove_string_resolver(&self, id: ResolverId) -> bool {
        self.strings.remove(id)
    }

    /// Returns `true` while the hooks are installed.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        !lock!(self.installed).is_empty()
    }

    /// Hooks token resolution and string construction on the compiler's callback table.
    ///
    /// # Errors
    /// Returns the hook manager's error; nothing stays installed on failure.
    ///
    /// # Safety
    /// `jit_info` must be the live callback table of the host's compiler, laid out as the
    /// engine's host layout describes.
    pub unsafe fn attach(&self, jit_info: VTable) -> Result<()> {
        let slots = self.context.layout().slots;
        let mut installed = lock!(self.installed);
        if !installed.is_empty() {
            return Err(Error::AlreadyInstalled);
        }

        let resolve = self
            .hooks
            .install(
                jit_info.slot(slots.resolve_token),
                resolve_token_hook as *const () as usize,
            )?;
        ROUTES.register(
            jit_info.base(),
            HookSite::ResolveToken,
            self.this.clone(),
            resolve.original_function(),
        );

        let strings = match self.hooks.install(
            jit_info.slot(slots.construct_string_literal),
            construct_string_literal_hook as *const () as usize,
        ) {
            Ok(record) => record,
            Err(error) => {
                ROUTES.release(jit_info.base(), HookSite::ResolveToken);
                self.hooks.remove(resolve)?;
                return Err(error);
            }
        };
        ROUTES.register(
            jit_info.base(),
            HookSite::StringLiteral,
            self.this.clone(),
            strings.original_function(),
        );

        installed.insert(HookSite::ResolveToken, resolve);
        installed.insert(HookSite::StringLiteral, strings);
        debug!(table = format_args!("0x{:x}", jit_info.base()), "attached token hooks");
        Ok(())
    }

    /// Removes the hooks installed by [`TokenResolutionInterceptor::attach`].
    ///
    /// # Errors
    /// Returns the first removal error; the remaining hooks are still removed.
    ///
    /// # Safety
    /// The callback table the hooks were installed on must still be alive.
    pub unsafe fn detach(&self) -> Result<()> {
        let records: Vec<_> = lock!(self.installed).drain().collect();
        let mut outcome = Ok(());
        for (site, record) in records {
            ROUTES.release(record.slot().table(), site);
            if let Err(error) = self.hooks.remove(record) {
                warn!(%site, %error, "failed to remove token hook");
                if outcome.is_ok() {
                    outcome = Err(error);
                }
            }
        }
        outcome
    }

    fn hook(&self, site: HookSite) -> Option<Arc<HookRecord>> {
        lock!(self.installed).get(&site).cloned()
    }

    fn run_resolvers(&self, context: &mut TokenContext) {
        for resolver in self.resolvers.snapshot() {
            match panic::catch_unwind(AssertUnwindSafe(|| resolver.resolve(context))) {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    warn!(token = %context.token(), %error, "token resolver failed");
                    context.decision = None;
                    return;
                }
                Err(_) => {
                    warn!(token = %context.token(), "token resolver panicked");
                    context.decision = None;
                    return;
                }
            }
            if context.is_resolved() {
                return;
            }
        }
    }

    /// Handles one `resolveToken` call.
    ///
    /// # Safety
    /// Arguments must be those the host passed to the hooked entry; `fallback` must be the
    /// original entry.
    pub unsafe fn resolve_token(&self, this: *mut c_void, block: *mut c_void, fallback: ResolveTokenFn) {
        let hook = self.hook(HookSite::ResolveToken);
        let original: ResolveTokenFn = match &hook {
            Some(record) => std::mem::transmute::<usize, ResolveTokenFn>(record.original()),
            None => fallback,
        };

        let guard = ReentrancyGuard::enter(HookSite::ResolveToken);
        if guard.is_nested() {
            original(this, block);
            return;
        }

        let Some(view) = ResolvedTokenBlock::from_raw(block, self.context.layout().resolved_token)
        else {
            original(this, block);
            return;
        };

        let raw_context = view.context();
        let source = self.context.host().method_from_token_context(raw_context);
        if source.is_none() {
            trace!(
                error = %Error::TokenResolutionFailed { context: raw_context },
                "reference without source function"
            );
        }

        let mut decision = None;
        if !self.resolvers.is_empty() {
            let mut context = TokenContext::new(source, view.scope(), view.token(), view.token_type());
            self.run_resolvers(&mut context);
            decision = context.decision;
        }

        if let Some(TokenDecision::Redirect { scope, token }) = decision {
            trace!(from = %view.token(), to = %token, "redirecting reference");
            view.set_scope(scope);
            view.set_token(token);
        }

        original(this, block);

        if let Some(TokenDecision::Override(handles)) = decision {
            if let Some(class) = handles.class {
                view.set_class(class);
            }
            if let Some(method) = handles.method {
                view.set_method(method);
            }
            if let Some(field) = handles.field {
                view.set_field(field);
            }
        }

        if let Some(source) = source {
            self.context.record_token_source(view.method(), source);
        }
    }

    /// Handles one `constructStringLiteral` call.
    ///
    /// # Safety
    /// Arguments must be those the host passed to the hooked entry; `fallback` must be the
    /// original entry.
    pub unsafe fn construct_string_literal(
        &self,
        this: *mut c_void,
        module: *mut c_void,
        token: u32,
        value: *mut *mut c_void,
        fallback: ConstructStringLiteralFn,
    ) -> i32 {
        let hook = self.hook(HookSite::StringLiteral);
        let original: ConstructStringLiteralFn = match &hook {
            Some(record) => std::mem::transmute::<usize, ConstructStringLiteralFn>(record.original()),
            None => fallback,
        };

        let guard = ReentrancyGuard::enter(HookSite::StringLiteral);
        if guard.is_nested() || self.strings.is_empty() || value.is_null() {
            return original(this, module, token, value);
        }

        let module_handle = ModuleHandle(module as usize);
        let mut context = StringContext::new(module_handle, Token(token));
        for resolver in self.strings.snapshot() {
            match panic::catch_unwind(AssertUnwindSafe(|| resolver.resolve(&mut context))) {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    warn!(token = %context.token(), %error, "string resolver failed");
                    context.replacement = None;
                    break;
                }
                Err(_) => {
                    warn!(token = %context.token(), "string resolver panicked");
                    context.replacement = None;
                    break;
                }
            }
            if context.replacement.is_some() {
                break;
            }
        }

        let Some(replacement) = context.replacement() else {
            return original(this, module, token, value);
        };

        match self.context.host().materialize_string(module_handle, replacement) {
            Some(literal) => {
                trace!(token = %context.token(), "replaced string literal");
                *value = literal.value as *mut c_void;
                literal.access as i32
            }
            None => {
                debug!(token = %context.token(), "host could not materialize replacement literal");
                original(this, module, token, value)
            }
        }
    }
}

unsafe extern "system" fn resolve_token_hook(this: *mut c_void, block: *mut c_void) {
    if this.is_null() {
        return;
    }
    let table = VTable::of_instance(this).base();
    let Some(route) = ROUTES.route(table, HookSite::ResolveToken) else {
        error!(table = format_args!("0x{table:x}"), "resolveToken hook without route");
        return;
    };
    let fallback = std::mem::transmute::<usize, ResolveTokenFn>(route.original);

    match route.owner {
        Some(owner) => {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                owner.resolve_token(this, block, fallback);
            }));
            if outcome.is_err() {
                error!("panic in resolveToken hook");
            }
        }
        None => fallback(this, block),
    }
}

unsafe extern "system" fn construct_string_literal_hook(
    this: *mut c_void,
    module: *mut c_void,
    token: u32,
    value: *mut *mut c_void,
) -> i32 {
    if this.is_null() {
        return crate::host::InfoAccessType::Value as i32;
    }
    let table = VTable::of_instance(this).base();
    let Some(route) = ROUTES.route(table, HookSite::StringLiteral) else {
        error!(table = format_args!("0x{table:x}"), "constructStringLiteral hook without route");
        return crate::host::InfoAccessType::Value as i32;
    };
    let fallback = std::mem::transmute::<usize, ConstructStringLiteralFn>(route.original);

    match route.owner {
        Some(owner) => panic::catch_unwind(AssertUnwindSafe(|| {
            owner.construct_string_literal(this, module, token, value, fallback)
        }))
        .unwrap_or_else(|_| {
            error!("panic in constructStringLiteral hook");
            fallback(this, module, token, value)
        }),
        None => fallback(this, module, token, value),
    }
}
