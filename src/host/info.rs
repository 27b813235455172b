//! Typed views over the raw structures the JIT interface passes by pointer.

use std::ffi::c_void;

use bitflags::bitflags;

use crate::{
    compile::MethodBody,
    host::{
        ClassHandle, FieldHandle, MethodHandle, MethodInfoLayout, ModuleHandle,
        ResolvedTokenLayout, Token,
    },
};

bitflags! {
    /// `CorInfoOptions` carried in the method info block.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MethodInfoOptions: u32 {
        /// Zero-initialize locals
        const INIT_LOCALS = 0x10;
        /// Generic context comes from the method handle argument
        const GENERICS_CONTEXT_FROM_METHOD_DESC = 0x20;
        /// Generic context comes from the method table argument
        const GENERICS_CONTEXT_FROM_METHOD_TABLE = 0x40;
        /// The generic context must be kept alive
        const GENERICS_CONTEXT_KEEP_ALIVE = 0x80;
    }
}

impl MethodInfoOptions {
    /// Any flag that marks a hidden instantiation argument.
    pub const GENERICS_CONTEXT_MASK: Self = Self::GENERICS_CONTEXT_FROM_METHOD_DESC
        .union(Self::GENERICS_CONTEXT_FROM_METHOD_TABLE);
}

unsafe fn read_at<T: Copy>(base: *mut u8, offset: usize) -> T {
    std::ptr::read_unaligned(base.add(offset) as *const T)
}

unsafe fn write_at<T: Copy>(base: *mut u8, offset: usize, value: T) {
    std::ptr::write_unaligned(base.add(offset) as *mut T, value);
}

/// The fields of a method info block that substituting a body overwrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodBodySnapshot {
    il_code: usize,
    il_code_size: u32,
    max_stack: u32,
    eh_count: u32,
    options: u32,
    locals_packed: u32,
    locals_sig: usize,
    locals_sig_size: u32,
    locals_token: u32,
}

/// A view over the host's per-compilation method info block.
///
/// The block belongs to the host and lives for the duration of one compile call; the view
/// must not outlive it.
pub struct MethodInfoBlock {
    base: *mut u8,
    layout: MethodInfoLayout,
}

impl MethodInfoBlock {
    /// Wraps a raw block pointer; `None` if it is null.
    ///
    /// # Safety
    /// `base` must point to a method info block laid out as `layout` describes, valid for
    /// reads and writes for as long as the view is used.
    #[must_use]
    pub unsafe fn from_raw(base: *mut c_void, layout: MethodInfoLayout) -> Option<Self> {
        if base.is_null() {
            return None;
        }
        Some(MethodInfoBlock {
            base: base as *mut u8,
            layout,
        })
    }

    /// The raw block pointer.
    #[must_use]
    pub fn as_ptr(&self) -> *mut c_void {
        self.base as *mut c_void
    }

    /// The function being compiled.
    #[must_use]
    pub fn method(&self) -> MethodHandle {
        MethodHandle(unsafe { read_at(self.base, self.layout.method) })
    }

    /// The module the function's body was read from.
    #[must_use]
    pub fn module(&self) -> ModuleHandle {
        ModuleHandle(unsafe { read_at(self.base, self.layout.scope) })
    }

    /// Address of the IL buffer.
    #[must_use]
    pub fn il_code(&self) -> usize {
        unsafe { read_at(self.base, self.layout.il_code) }
    }

    /// Length of the IL buffer.
    #[must_use]
    pub fn il_code_size(&self) -> u32 {
        unsafe { read_at(self.base, self.layout.il_code_size) }
    }

    /// A copy of the IL bytes.
    #[must_use]
    pub fn il(&self) -> Vec<u8> {
        let code = self.il_code();
        let size = self.il_code_size() as usize;
        if code == 0 || size == 0 {
            return Vec::new();
        }
        unsafe { std::slice::from_raw_parts(code as *const u8, size) }.to_vec()
    }

    /// Maximum evaluation stack depth.
    #[must_use]
    pub fn max_stack(&self) -> u32 {
        unsafe { read_at(self.base, self.layout.max_stack) }
    }

    /// Number of exception handling clauses.
    #[must_use]
    pub fn eh_count(&self) -> u32 {
        unsafe { read_at(self.base, self.layout.eh_count) }
    }

    /// Compilation options.
    #[must_use]
    pub fn options(&self) -> MethodInfoOptions {
        MethodInfoOptions::from_bits_retain(unsafe { read_at(self.base, self.layout.options) })
    }

    /// Stand-alone signature token of the locals.
    #[must_use]
    pub fn locals_token(&self) -> Token {
        Token(unsafe { read_at(self.base, self.layout.locals + self.layout.sig.token) })
    }

    /// Number of declared arguments, not counting `this`.
    #[must_use]
    pub fn arg_count(&self) -> u16 {
        unsafe { read_at(self.base, self.layout.args + self.layout.sig.num_args()) }
    }

    fn handles(&self, count_offset: usize, array_offset: usize) -> Vec<ClassHandle> {
        let sig = self.layout.args;
        let count: u32 = unsafe { read_at(self.base, sig + count_offset) };
        let array: usize = unsafe { read_at(self.base, sig + array_offset) };
        if count == 0 || array == 0 {
            return Vec::new();
        }

        (0..count as usize)
            .map(|index| ClassHandle(unsafe { read_at(array as *mut u8, index * std::mem::size_of::<usize>()) }))
            .collect()
    }

    /// Type arguments of the declaring type's instantiation.
    #[must_use]
    pub fn class_instantiation(&self) -> Vec<ClassHandle> {
        let sig = self.layout.sig;
        self.handles(sig.class_inst_count, sig.class_inst)
    }

    /// Type arguments of the method's own instantiation.
    #[must_use]
    pub fn method_instantiation(&self) -> Vec<ClassHandle> {
        let sig = self.layout.sig;
        self.handles(sig.meth_inst_count, sig.meth_inst)
    }

    /// Captures the fields [`MethodInfoBlock::apply_body`] overwrites.
    #[must_use]
    pub fn snapshot(&self) -> MethodBodySnapshot {
        let layout = self.layout;
        let locals = layout.locals;
        unsafe {
            MethodBodySnapshot {
                il_code: read_at(self.base, layout.il_code),
                il_code_size: read_at(self.base, layout.il_code_size),
                max_stack: read_at(self.base, layout.max_stack),
                eh_count: read_at(self.base, layout.eh_count),
                options: read_at(self.base, layout.options),
                locals_packed: read_at(self.base, locals + layout.sig.packed),
                locals_sig: read_at(self.base, locals + layout.sig.sig),
                locals_sig_size: read_at(self.base, locals + layout.sig.sig_size),
                locals_token: read_at(self.base, locals + layout.sig.token),
            }
        }
    }

    /// Points the block at a replacement body.
    ///
    /// The block refers to `body`'s buffers afterwards, so `body` must stay alive until the
    /// block is restored or the compile call returns.
    pub fn apply_body(&self, body: &MethodBody) {
        let layout = self.layout;
        unsafe {
            write_at(self.base, layout.il_code, body.il.as_ptr() as usize);
            write_at(self.base, layout.il_code_size, body.il.len() as u32);
            if let Some(max_stack) = body.max_stack {
                write_at(self.base, layout.max_stack, max_stack);
            }
            write_at(self.base, layout.eh_count, body.exception_clauses);

            let mut options = self.options();
            options.set(MethodInfoOptions::INIT_LOCALS, body.init_locals);
            write_at(self.base, layout.options, options.bits());

            if let Some(locals) = &body.locals {
                let sig = layout.locals;
                write_at(self.base, sig + layout.sig.num_args(), locals.count);
                write_at(self.base, sig + layout.sig.sig, locals.blob.as_ptr() as usize);
                write_at(self.base, sig + layout.sig.sig_size, locals.blob.len() as u32);
                write_at(self.base, sig + layout.sig.token, locals.token.value());
            }
        }
    }

    /// Writes back the fields captured by [`MethodInfoBlock::snapshot`].
    pub fn restore(&self, snapshot: &MethodBodySnapshot) {
        let layout = self.layout;
        let locals = layout.locals;
        unsafe {
            write_at(self.base, layout.il_code, snapshot.il_code);
            write_at(self.base, layout.il_code_size, snapshot.il_code_size);
            write_at(self.base, layout.max_stack, snapshot.max_stack);
            write_at(self.base, layout.eh_count, snapshot.eh_count);
            write_at(self.base, layout.options, snapshot.options);
            write_at(self.base, locals + layout.sig.packed, snapshot.locals_packed);
            write_at(self.base, locals + layout.sig.sig, snapshot.locals_sig);
            write_at(self.base, locals + layout.sig.sig_size, snapshot.locals_sig_size);
            write_at(self.base, locals + layout.sig.token, snapshot.locals_token);
        }
    }
}

/// A view over the host's resolved token block.
pub struct ResolvedTokenBlock {
    base: *mut u8,
    layout: ResolvedTokenLayout,
}

impl ResolvedTokenBlock {
    /// Wraps a raw block pointer; `None` if it is null.
    ///
    /// # Safety
    /// `base` must point to a resolved token block laid out as `layout` describes, valid
    /// for reads and writes for as long as the view is used.
    #[must_use]
    pub unsafe fn from_raw(base: *mut c_void, layout: ResolvedTokenLayout) -> Option<Self> {
        if base.is_null() {
            return None;
        }
        Some(ResolvedTokenBlock {
            base: base as *mut u8,
            layout,
        })
    }

    /// `tokenContext`: a method handle, or a class handle with the low bit set.
    #[must_use]
    pub fn context(&self) -> usize {
        unsafe { read_at(self.base, self.layout.context) }
    }

    /// The module the token belongs to.
    #[must_use]
    pub fn scope(&self) -> ModuleHandle {
        ModuleHandle(unsafe { read_at(self.base, self.layout.scope) })
    }

    /// Redirects resolution to another module.
    pub fn set_scope(&self, scope: ModuleHandle) {
        unsafe { write_at(self.base, self.layout.scope, scope.raw()) };
    }

    /// The token being resolved.
    #[must_use]
    pub fn token(&self) -> Token {
        Token(unsafe { read_at(self.base, self.layout.token) })
    }

    /// Redirects resolution to another token.
    pub fn set_token(&self, token: Token) {
        unsafe { write_at(self.base, self.layout.token, token.value()) };
    }

    /// The kind of resolution requested (`CorInfoTokenKind`).
    #[must_use]
    pub fn token_type(&self) -> u32 {
        unsafe { read_at(self.base, self.layout.token_type) }
    }

    /// The resolved class.
    #[must_use]
    pub fn class(&self) -> ClassHandle {
        ClassHandle(unsafe { read_at(self.base, self.layout.class) })
    }

    /// Overrides the resolved class.
    pub fn set_class(&self, class: ClassHandle) {
        unsafe { write_at(self.base, self.layout.class, class.raw()) };
    }

    /// The resolved method, null for non-method tokens.
    #[must_use]
    pub fn method(&self) -> MethodHandle {
        MethodHandle(unsafe { read_at(self.base, self.layout.method) })
    }

    /// Overrides the resolved method.
    pub fn set_method(&self, method: MethodHandle) {
        unsafe { write_at(self.base, self.layout.method, method.raw()) };
    }

    /// The resolved field, null for non-field tokens.
    #[must_use]
    pub fn field(&self) -> FieldHandle {
        FieldHandle(unsafe { read_at(self.base, self.layout.field) })
    }

    /// Overrides the resolved field.
    pub fn set_field(&self, field: FieldHandle) {
        unsafe { write_at(self.base, self.layout.field, field.raw()) };
    }
}
