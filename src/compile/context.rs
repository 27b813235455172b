use std::{
    fmt,
    sync::{Arc, OnceLock},
};

use strum::Display;

use crate::{
    host::{HostServices, MethodDescriptor, MethodHandle, ModuleHandle, Token},
    Error, Result,
};

/// Resolution state of a [`MethodContext`].
///
/// Every state other than [`ResolutionState::Unresolved`] is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ResolutionState {
    /// No resolver has decided anything
    Unresolved,
    /// The IL body is replaced before compilation
    ResolvedIL,
    /// The compiled code is replaced by caller-supplied machine code
    ResolvedNative,
    /// The entry point is redirected to an existing address
    ResolvedEntry,
    /// Calls go through an interception shim
    ResolvedIntercept,
}

/// The locals signature of a replacement body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalsSignature {
    /// `StandAloneSig` token of the signature, valid in the function's module
    pub token: Token,
    /// The encoded `LocalVarSig` blob
    pub blob: Vec<u8>,
    /// Number of locals
    pub count: u16,
}

impl LocalsSignature {
    /// Creates a locals signature
    #[must_use]
    pub fn new(token: Token, blob: Vec<u8>, count: u16) -> Self {
        LocalsSignature { token, blob, count }
    }
}

/// A replacement IL body.
///
/// # Examples
///
/// ```rust
/// use jitscope::compile::MethodBody;
///
/// // ldc.i4.s 42; ret
/// let body = MethodBody::new(vec![0x1F, 0x2A, 0x2A]).with_max_stack(1);
/// assert_eq!(body.max_stack, Some(1));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodBody {
    /// The IL bytes
    pub il: Vec<u8>,
    /// Maximum stack depth; the original value is kept when `None`
    pub max_stack: Option<u32>,
    /// Locals; the original signature is kept when `None`
    pub locals: Option<LocalsSignature>,
    /// Number of exception clauses the host will ask for
    pub exception_clauses: u32,
    /// Whether locals are zero-initialized
    pub init_locals: bool,
}

impl MethodBody {
    /// A body with no exception clauses and zero-initialized locals.
    #[must_use]
    pub fn new(il: Vec<u8>) -> Self {
        MethodBody {
            il,
            max_stack: None,
            locals: None,
            exception_clauses: 0,
            init_locals: true,
        }
    }

    /// Sets the maximum stack depth.
    #[must_use]
    pub fn with_max_stack(mut self, max_stack: u32) -> Self {
        self.max_stack = Some(max_stack);
        self
    }

    /// Sets the locals signature.
    #[must_use]
    pub fn with_locals(mut self, locals: LocalsSignature) -> Self {
        self.locals = Some(locals);
        self
    }

    /// Declares exception clauses the host resolves against the original metadata.
    #[must_use]
    pub fn with_exception_clauses(mut self, count: u32) -> Self {
        self.exception_clauses = count;
        self
    }
}

/// The terminal decision of a resolver chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Replace the IL body
    IL(MethodBody),
    /// Replace the compiled code
    Native(Vec<u8>),
    /// Redirect the entry point
    Entry {
        /// New entry address
        address: usize,
        /// New code size, the compiled size is kept when `None`
        size: Option<u32>,
    },
    /// Route calls through an interception shim
    Intercept,
}

impl Resolution {
    /// The state this resolution corresponds to.
    #[must_use]
    pub fn state(&self) -> ResolutionState {
        match self {
            Resolution::IL(_) => ResolutionState::ResolvedIL,
            Resolution::Native(_) => ResolutionState::ResolvedNative,
            Resolution::Entry { .. } => ResolutionState::ResolvedEntry,
            Resolution::Intercept => ResolutionState::ResolvedIntercept,
        }
    }
}

/// Per-compilation state handed to every method resolver.
///
/// A context starts [`ResolutionState::Unresolved`]. The first `resolve_*` call moves it to
/// a terminal state; any further call fails with [`crate::Error::ResolutionConflict`] and
/// leaves the first decision in place.
pub struct MethodContext {
    method: MethodHandle,
    module: ModuleHandle,
    source: Option<MethodHandle>,
    il: Vec<u8>,
    host: Arc<dyn HostServices>,
    descriptor: OnceLock<Option<MethodDescriptor>>,
    resolution: Option<Resolution>,
}

impl MethodContext {
    /// Creates an unresolved context.
    #[must_use]
    pub fn new(
        method: MethodHandle,
        module: ModuleHandle,
        source: Option<MethodHandle>,
        il: Vec<u8>,
        host: Arc<dyn HostServices>,
    ) -> Self {
        MethodContext {
            method,
            module,
            source,
            il,
            host,
            descriptor: OnceLock::new(),
            resolution: None,
        }
    }

    /// The function being compiled.
    #[must_use]
    pub fn method(&self) -> MethodHandle {
        self.method
    }

    /// The module the function belongs to.
    #[must_use]
    pub fn module(&self) -> ModuleHandle {
        self.module
    }

    /// The function whose compilation referenced this one, if known.
    #[must_use]
    pub fn source(&self) -> Option<MethodHandle> {
        self.source
    }

    /// The original IL body.
    #[must_use]
    pub fn il(&self) -> &[u8] {
        &self.il
    }

    /// Host description of the function, fetched on first use.
    pub fn descriptor(&self) -> Option<&MethodDescriptor> {
        self.descriptor
            .get_or_init(|| self.host.describe_method(self.method))
            .as_ref()
    }

    /// Returns `true` if the function is `type_name::method_name`.
    pub fn is(&self, type_name: &str, method_name: &str) -> bool {
        self.descriptor()
            .is_some_and(|descriptor| descriptor.matches(type_name, method_name))
    }

    /// The current state.
    #[must_use]
    pub fn state(&self) -> ResolutionState {
        self.resolution
            .as_ref()
            .map_or(ResolutionState::Unresolved, Resolution::state)
    }

    /// Returns `true` once a terminal state is set.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }

    /// The decision taken, if any.
    #[must_use]
    pub fn resolution(&self) -> Option<&Resolution> {
        self.resolution.as_ref()
    }

    fn set(&mut self, resolution: Resolution) -> Result<()> {
        if let Some(current) = &self.resolution {
            return Err(Error::ResolutionConflict {
                current: current.state(),
                requested: resolution.state(),
            });
        }
        self.resolution = Some(resolution);
        Ok(())
    }

    /// Compile `body` instead of the original IL.
    ///
    /// # Errors
    /// Returns [`crate::Error::ResolutionConflict`] if the context is already resolved and
    /// [`crate::Error::Malformed`] for an empty body.
    pub fn resolve_il(&mut self, body: MethodBody) -> Result<()> {
        if body.il.is_empty() {
            return Err(malformed_error!("Replacement IL for {} is empty", self.method));
        }
        self.set(Resolution::IL(body))
    }

    /// Use `code` as the function's machine code.
    ///
    /// # Errors
    /// Returns [`crate::Error::ResolutionConflict`] if the context is already resolved and
    /// [`crate::Error::Malformed`] for empty code.
    pub fn resolve_native(&mut self, code: Vec<u8>) -> Result<()> {
        if code.is_empty() {
            return Err(malformed_error!("Native code for {} is empty", self.method));
        }
        self.set(Resolution::Native(code))
    }

    /// Point the function's entry at `address`.
    ///
    /// # Errors
    /// Returns [`crate::Error::ResolutionConflict`] if the context is already resolved and
    /// [`crate::Error::Malformed`] for a null address.
    pub fn resolve_entry(&mut self, address: usize, size: Option<u32>) -> Result<()> {
        if address == 0 {
            return Err(malformed_error!("Entry address for {} is null", self.method));
        }
        self.set(Resolution::Entry { address, size })
    }

    /// Route every call of the function through the interceptor chain.
    ///
    /// # Errors
    /// Returns [`crate::Error::ResolutionConflict`] if the context is already resolved.
    pub fn intercept_calls(&mut self) -> Result<()> {
        self.set(Resolution::Intercept)
    }

    /// Consumes the context, yielding the decision.
    #[must_use]
    pub fn into_resolution(self) -> Option<Resolution> {
        self.resolution
    }

    /// Drops any decision, e.g. after the resolver that took it failed.
    pub(crate) fn reset(&mut self) {
        self.resolution = None;
    }
}

impl fmt::Debug for MethodContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodContext")
            .field("method", &self.method)
            .field("module", &self.module)
            .field("source", &self.source)
            .field("il_len", &self.il.len())
            .field("state", &self.state())
            .finish()
    }
}
