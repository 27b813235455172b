//! Interception of the host's compilation pipeline.
//!
//! The host compiles a function by calling the compile entry of its JIT compiler object
//! with a method info block describing the function. [`CompilationInterceptor`] sits in that
//! entry: it builds a [`MethodContext`] for the function, runs the registered
//! [`MethodResolver`]s, and applies their decision around the call to the original compiler.
//!
//! The compiler calls back into the host while it works. [`TokenResolutionInterceptor`]
//! hooks two of those callbacks: token resolution, which reveals which function referenced
//! which, and string literal construction.
//!
//! # Key Components
//!
//! - [`MethodContext`] / [`Resolution`] - Per-compilation state and the resolver's decision
//! - [`MethodResolver`] - The callback trait resolvers implement
//! - [`CompilationInterceptor`] - The compile hook
//! - [`TokenResolutionInterceptor`] - The token resolution and string literal hooks
//!
//! # Resolution Flow
//!
//! ```text
//! host ── compileMethod ──▶ hook ── nested? ──────────────▶ original
//!                            │
//!                            ├─ resolvers (first terminal decision wins)
//!                            ├─ IL:        swap body ──▶ original ──▶ restore body
//!                            ├─ Native:    original ──▶ entry := copied code
//!                            ├─ Entry:     original ──▶ entry := address
//!                            └─ Intercept: original ──▶ shim body ──▶ original ──▶ entry := shim
//! ```

mod context;
pub(crate) mod dispatch;
mod interceptor;
mod resolver;
mod token;

pub use context::{LocalsSignature, MethodBody, MethodContext, Resolution, ResolutionState};
pub use interceptor::{CompilationInterceptor, CompileCall, CompileMethodFn};
pub use resolver::MethodResolver;
pub use token::{
    ConstructStringLiteralFn, ResolveTokenFn, StringContext, StringResolver, TokenContext,
    TokenOverride, TokenResolutionInterceptor, TokenResolver,
};
