//! # jitscope Prelude
//!
//! This module provides a convenient prelude for the most commonly used types and traits
//! from the jitscope library. Import this module to get quick access to everything an
//! embedder needs to create an engine, register resolvers and interceptors, and install it.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all jitscope operations
pub use crate::Error;

/// The result type used throughout jitscope
pub use crate::Result;

// ================================================================================================
// Main Entry Points
// ================================================================================================

/// The interception engine and its configuration
pub use crate::{Engine, EngineConfig};

/// Handles returned by every registration
pub use crate::ResolverId;

/// Function pointer tables the engine is installed on
pub use crate::vtable::VTable;

// ================================================================================================
// Host Contract
// ================================================================================================

/// Opaque identities and metadata tokens
pub use crate::host::{ClassHandle, FieldHandle, MethodHandle, ModuleHandle, Token};

/// What the embedder provides about the host
pub use crate::host::{
    GenericArgument, HostServices, HostVersion, MethodDescriptor, ReturnShape, SignatureRequest,
    StringLiteral, ValueShape,
};

// ================================================================================================
// Compilation Interception
// ================================================================================================

/// Per-compilation decisions
pub use crate::compile::{MethodBody, MethodContext, MethodResolver, Resolution, ResolutionState};

/// Token and string literal callbacks
pub use crate::compile::{StringContext, StringResolver, TokenContext, TokenResolver};

// ================================================================================================
// Call Interception
// ================================================================================================

/// Interceptors and what they see of a call
pub use crate::intercept::{BoxedRef, CallContext, CallInterceptor, FnInterceptor};

/// Records of intercepted functions
pub use crate::intercept::{InterceptRecord, InterceptTable};

/// Compiled code as recorded by the engine
pub use crate::engine::CompiledMethod;
