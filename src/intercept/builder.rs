use std::sync::Arc;

use tracing::{debug, trace};

use crate::{
    compile::MethodBody,
    engine::CompiledMethod,
    host::{ClassHandle, HostServices, MethodDescriptor, MethodHandle, ModuleHandle},
    intercept::{
        CallManager, CanonicalSharing, CilShimEmitter, GenericSharingPolicy, InterceptTable,
        ShimEmitter, ShimProgram, ShimShape,
    },
    patch::NativeCodePatcher,
    Error, Result,
};

/// What the builder needs to know about the compilation it replaces.
#[derive(Debug, Clone)]
pub struct ShimRequest<'a> {
    /// The intercepted function
    pub descriptor: &'a MethodDescriptor,
    /// Module the shim's tokens must be valid in
    pub module: ModuleHandle,
    /// The real implementation, compiled from the original body
    pub real: CompiledMethod,
    /// Class and method instantiation of the compilation, in that order
    pub instantiation: Vec<ClassHandle>,
    /// Instantiation argument for code shared between instantiations
    pub generic_context: Option<usize>,
}

/// Turns a compiled function into an intercepted one.
///
/// The builder records the real entry, synthesizes the shim, lets the caller compile it
/// (the host has to compile the shim in the same compile call, with the same method info
/// block) and finally removes caller-identity checks from the shim's machine code.
pub struct CallInterceptionBuilder {
    host: Arc<dyn HostServices>,
    table: Arc<InterceptTable>,
    emitter: Box<dyn ShimEmitter>,
    policy: Box<dyn GenericSharingPolicy>,
    patcher: Option<Arc<NativeCodePatcher>>,
}

impl CallInterceptionBuilder {
    /// A builder emitting CIL shims with canonical generic sharing and no native patching.
    #[must_use]
    pub fn new(host: Arc<dyn HostServices>, table: Arc<InterceptTable>) -> Self {
        CallInterceptionBuilder {
            emitter: Box::new(CilShimEmitter::new(Arc::clone(&host))),
            host,
            table,
            policy: Box::new(CanonicalSharing),
            patcher: None,
        }
    }

    /// Replaces the shim emitter.
    #[must_use]
    pub fn with_emitter(mut self, emitter: Box<dyn ShimEmitter>) -> Self {
        self.emitter = emitter;
        self
    }

    /// Replaces the generic sharing policy.
    #[must_use]
    pub fn with_policy(mut self, policy: Box<dyn GenericSharingPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Enables removal of caller-identity checks from compiled shims.
    #[must_use]
    pub fn with_patcher(mut self, patcher: Arc<NativeCodePatcher>) -> Self {
        self.patcher = Some(patcher);
        self
    }

    /// The records of intercepted functions.
    #[must_use]
    pub fn table(&self) -> &Arc<InterceptTable> {
        &self.table
    }

    /// Builds and compiles the shim for `request`.
    ///
    /// `compile` receives the shim body and returns the code the host produced for it.
    ///
    /// # Errors
    /// Returns the emitter's or `compile`'s error, or [`crate::Error::Shim`] if the host
    /// produced no code. The record keeps its previous primary entry in that case.
    pub fn build<F>(&self, request: &ShimRequest<'_>, compile: F) -> Result<CompiledMethod>
    where
        F: FnOnce(&MethodBody) -> Result<CompiledMethod>,
    {
        let descriptor = request.descriptor;
        let method = descriptor.handle;

        let instantiation = if descriptor.generic_arguments.is_empty() {
            request.instantiation.clone()
        } else {
            self.policy
                .canonicalize(&descriptor.generic_arguments, self.host.canonical_placeholder())
        };
        let shape = ShimShape::from_descriptor(descriptor, request.generic_context.is_some());
        let record = self.table.get_or_insert(method, shape, instantiation);
        record.set_secondary(request.real.entry);

        let program = ShimProgram::build(
            method,
            record.shape(),
            record.address(),
            CallManager::entry_point(),
            request.real.entry,
            request.generic_context,
        );
        let body = self.emitter.emit(&program, request.module)?;
        trace!(%method, il = body.il.len(), "emitted shim");

        let compiled = compile(&body)?;
        if compiled.entry == 0 {
            return Err(Error::Shim(format!(
                "host produced no code for the shim of {}",
                descriptor.full_name()
            )));
        }
        record.set_primary(compiled.entry);
        self.strip_access_checks(method, compiled);

        debug!(
            %method,
            name = %descriptor.full_name(),
            real = format_args!("0x{:x}", request.real.entry),
            shim = format_args!("0x{:x}", compiled.entry),
            "intercepting calls"
        );
        Ok(compiled)
    }

    fn strip_access_checks(&self, method: MethodHandle, compiled: CompiledMethod) {
        let Some(patcher) = &self.patcher else {
            return;
        };
        let targets = self.host.access_check_targets(method);
        if targets.is_empty() || compiled.size == 0 {
            return;
        }

        let own = method.raw() as u64;
        match unsafe { patcher.patch(compiled.entry, compiled.size as usize, own, &targets) } {
            Ok(site) => trace!(%method, start = site.start, resume = site.resume, "patched shim"),
            Err(Error::PatchPatternNotFound) => trace!(%method, "shim has no access check"),
            Err(error) => debug!(%method, %error, "shim left unpatched"),
        }
    }
}
