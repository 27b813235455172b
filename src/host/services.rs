//! The embedder's side of the contract.
//!
//! The engine never parses metadata or walks host objects itself. Whatever it needs to know
//! about a function beyond its handle comes from a [`HostServices`] implementation, which is
//! typically backed by the host's reflection API or an IL reader library.

use widestring::U16Str;

use crate::{
    host::{ClassHandle, HostVersion, InfoAccessType, MethodHandle, ModuleHandle, Token},
    Result,
};

/// Storage shape of a value passed to or returned from a function.
///
/// The shape is all the call interception machinery needs to expose a value by address:
/// its size, and for structs the type token the locals signature refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueShape {
    /// `bool`
    Boolean,
    /// `char`
    Char,
    /// `sbyte`
    I1,
    /// `byte`
    U1,
    /// `short`
    I2,
    /// `ushort`
    U2,
    /// `int`
    I4,
    /// `uint`
    U4,
    /// `long`
    I8,
    /// `ulong`
    U8,
    /// `float`
    R4,
    /// `double`
    R8,
    /// `nint`
    NativeInt,
    /// `nuint`
    NativeUInt,
    /// Any object reference
    ObjectRef,
    /// A managed pointer (`ref T`), exposed as its address
    ByRef,
    /// A value type
    Struct {
        /// Size in bytes
        size: u32,
        /// `TypeDef`/`TypeRef`/`TypeSpec` token of the type
        token: Token,
    },
}

impl ValueShape {
    /// Size of the value in bytes.
    #[must_use]
    pub const fn size(&self) -> usize {
        match self {
            ValueShape::Boolean | ValueShape::I1 | ValueShape::U1 => 1,
            ValueShape::Char | ValueShape::I2 | ValueShape::U2 => 2,
            ValueShape::I4 | ValueShape::U4 | ValueShape::R4 => 4,
            ValueShape::I8 | ValueShape::U8 | ValueShape::R8 => 8,
            ValueShape::NativeInt
            | ValueShape::NativeUInt
            | ValueShape::ObjectRef
            | ValueShape::ByRef => std::mem::size_of::<usize>(),
            ValueShape::Struct { size, .. } => *size as usize,
        }
    }
}

/// What a function returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReturnShape {
    /// Nothing
    Void,
    /// A value of the given shape
    Value(ValueShape),
    /// A task object; when the original is skipped the shim returns a completed task
    Task,
}

/// One type argument of a generic instantiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GenericArgument {
    /// The type
    pub class: ClassHandle,
    /// `true` for reference types, which share code under the canonical placeholder
    pub is_reference_type: bool,
}

/// Everything the engine needs to know about a function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    /// The function
    pub handle: MethodHandle,
    /// Its definition token
    pub token: Token,
    /// The module defining it
    pub module: ModuleHandle,
    /// Simple name, e.g. `Sum`
    pub name: String,
    /// Full name of the declaring type, e.g. `App.Calculator`
    pub declaring_type: String,
    /// `false` for instance functions, which receive `this` as parameter 0
    pub is_static: bool,
    /// Declared parameters, not counting `this`
    pub parameters: Vec<ValueShape>,
    /// Return shape
    pub return_shape: ReturnShape,
    /// Type arguments of the instantiation being compiled
    pub generic_arguments: Vec<GenericArgument>,
}

impl MethodDescriptor {
    /// `Type::Name`
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}::{}", self.declaring_type, self.name)
    }

    /// Returns `true` if the function is `type_name::method_name`.
    #[must_use]
    pub fn matches(&self, type_name: &str, method_name: &str) -> bool {
        self.declaring_type == type_name && self.name == method_name
    }

    /// Returns `true` for generic instantiations.
    #[must_use]
    pub fn is_generic(&self) -> bool {
        !self.generic_arguments.is_empty()
    }
}

/// A stand-alone signature a call interception shim needs a token for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureRequest {
    /// `unmanaged cdecl int32(native int, native int, int32, native int, native int)`,
    /// the signature of the call manager entry
    ManagerEntry,
    /// The managed signature used to call the real implementation indirectly
    RealCall {
        /// The intercepted function
        method: MethodHandle,
        /// Whether the callee takes `this`
        has_this: bool,
        /// Whether a hidden instantiation argument leads the argument list
        generic_context: bool,
        /// Declared parameters
        parameters: Vec<ValueShape>,
        /// Return shape
        return_shape: ReturnShape,
    },
    /// The locals signature of the shim
    Locals {
        /// Encoded `LocalVarSig` blob
        blob: Vec<u8>,
    },
}

/// A string object the host materialized for a literal replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StringLiteral {
    /// Value written to the caller's out slot
    pub value: usize,
    /// How the JIT has to dereference `value`
    pub access: InfoAccessType,
}

/// Services the host integration provides to the engine.
///
/// Only [`HostServices::runtime_version`] and [`HostServices::describe_method`] are needed
/// for plain compilation interception. Call interception additionally needs
/// [`HostServices::signature_token`]; everything else has a conservative default.
pub trait HostServices: Send + Sync {
    /// The version of the running host, used to select the structure layout.
    fn runtime_version(&self) -> Option<HostVersion>;

    /// Describes a function, or `None` if the handle is unknown.
    fn describe_method(&self, method: MethodHandle) -> Option<MethodDescriptor>;

    /// Maps the `tokenContext` of a resolved token block to the function that requested it.
    ///
    /// The default follows the host convention: a context with the low bit clear is a method
    /// handle, one with the low bit set is a class handle and identifies no function.
    fn method_from_token_context(&self, context: usize) -> Option<MethodHandle> {
        if context == 0 || context & 1 != 0 {
            return None;
        }
        Some(MethodHandle(context))
    }

    /// A stand-alone signature token for a shim, valid in `module`.
    ///
    /// # Errors
    /// Implementations return an error when the signature cannot be created; the function is
    /// then compiled without call interception.
    fn signature_token(&self, module: ModuleHandle, request: &SignatureRequest) -> Result<Token>;

    /// Token of the getter returning a completed task, valid in `module`.
    fn completed_task_getter(&self, _module: ModuleHandle) -> Option<Token> {
        None
    }

    /// The canonical placeholder type reference-type arguments share code under.
    fn canonical_placeholder(&self) -> Option<ClassHandle> {
        None
    }

    /// The class that declares `method`, used as the instantiation argument of code shared
    /// through the method table.
    fn declaring_class(&self, _method: MethodHandle) -> Option<ClassHandle> {
        None
    }

    /// Type arguments encoded by a runtime instantiation handle.
    fn generic_arguments(&self, _context: usize) -> Vec<ClassHandle> {
        Vec::new()
    }

    /// Identities the JIT embeds in caller-identity checks when `method` is compiled.
    ///
    /// An empty list disables native patching for the function.
    fn access_check_targets(&self, _method: MethodHandle) -> Vec<u64> {
        Vec::new()
    }

    /// Creates a string object for a literal replacement.
    fn materialize_string(&self, _module: ModuleHandle, _value: &U16Str) -> Option<StringLiteral> {
        None
    }
}
