//! The host runtime as seen from inside its JIT interface.
//!
//! Nothing in this module knows the host's object model. Handles are opaque addresses, the
//! data blocks the JIT interface passes around are read through a version-keyed offset
//! table, and everything that needs real knowledge of the host (method names, signatures,
//! string objects) is asked of a [`HostServices`] implementation supplied by the embedder.
//!
//! # Key Components
//!
//! - [`MethodHandle`], [`ModuleHandle`], [`ClassHandle`], [`FieldHandle`] - Opaque identities
//! - [`Token`] - Metadata tokens
//! - [`HostVersion`] / [`HostLayout`] - Version-keyed offsets of the JIT interface structures
//! - [`MethodInfoBlock`] / [`ResolvedTokenBlock`] - Typed views over raw host structures
//! - [`HostServices`] - The embedder's side of the contract
//! - [`CorJitResult`] - Result codes of the compile entry point

mod info;
mod services;
mod token;
mod version;

pub use info::{MethodBodySnapshot, MethodInfoBlock, MethodInfoOptions, ResolvedTokenBlock};
pub use services::{
    GenericArgument, HostServices, MethodDescriptor, ReturnShape, SignatureRequest, StringLiteral,
    ValueShape,
};
pub use token::Token;
pub use version::{
    HostLayout, HostVersion, JitInterfaceSlots, MethodInfoLayout, ResolvedTokenLayout,
    SigInfoLayout,
};

use std::fmt;

use strum::{Display, EnumIter};

macro_rules! define_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name(pub usize);

        impl $name {
            /// The null handle
            pub const NULL: Self = $name(0);

            /// Wraps a raw handle value
            #[must_use]
            pub const fn new(raw: usize) -> Self {
                $name(raw)
            }

            /// The raw handle value
            #[must_use]
            pub const fn raw(&self) -> usize {
                self.0
            }

            /// `true` for the null handle
            #[must_use]
            pub const fn is_null(&self) -> bool {
                self.0 == 0
            }

            /// The handle as a pointer
            #[must_use]
            pub fn as_ptr(&self) -> *mut std::ffi::c_void {
                self.0 as *mut std::ffi::c_void
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "(0x{:x})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{:x}", self.0)
            }
        }
    };
}

define_handle!(
    /// Identity of a function known to the host.
    ///
    /// Equality and hashing use the raw address; the handle is the key of every side table.
    MethodHandle
);
define_handle!(
    /// Identity of a loaded module (metadata scope).
    ModuleHandle
);
define_handle!(
    /// Identity of a type known to the host.
    ClassHandle
);
define_handle!(
    /// Identity of a field known to the host.
    FieldHandle
);

/// Result codes of the host compile entry point.
///
/// Codes the host returns that are not listed here are passed through untouched; this type
/// is only used to name the ones the engine produces or inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
#[repr(i32)]
pub enum CorJitResult {
    /// Compilation succeeded
    Ok = 0,
    /// The IL is invalid
    BadCode = 0x8000_0001_u32 as i32,
    /// Out of memory
    OutOfMemory = 0x8000_0002_u32 as i32,
    /// Internal compiler failure
    InternalError = 0x8000_0003_u32 as i32,
    /// The compiler declined to compile the function
    Skipped = 0x8000_0004_u32 as i32,
    /// Recoverable failure; the host may retry with different settings
    RecoverableError = 0x8000_0005_u32 as i32,
    /// An implementation limit was hit
    ImplLimitation = 0x8000_0006_u32 as i32,
}

impl CorJitResult {
    /// Maps a raw code to a known result.
    #[must_use]
    pub fn from_raw(raw: i32) -> Option<Self> {
        use strum::IntoEnumIterator;
        Self::iter().find(|result| *result as i32 == raw)
    }

    /// Returns `true` if `raw` is the success code.
    #[must_use]
    pub fn is_ok(raw: i32) -> bool {
        raw == CorJitResult::Ok as i32
    }
}

/// How the value written by a host lookup has to be dereferenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[repr(i32)]
pub enum InfoAccessType {
    /// The value is the result itself
    Value = 0,
    /// The value points to the result
    PointerToValue = 1,
    /// The value points to a pointer to the result
    PointerToPointer = 2,
}
