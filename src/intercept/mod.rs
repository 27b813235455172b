//! Call interception: shims, the call manager and the interceptor chain.
//!
//! A function a resolver chose for call interception is compiled twice within the same
//! compile call. The original body yields the real implementation; a synthesized shim body
//! yields the entry the host publishes. Every call then runs through the shim, which hands
//! the call to the [`CallManager`] and only continues to the real implementation if the
//! interceptor chain lets it.
//!
//! # Key Components
//!
//! - [`CallInterceptionBuilder`] - Builds, compiles and patches the shim of a function
//! - [`shim`] - The shim IR and the CIL emitter
//! - [`CallManager`] / [`call_manager_entry`] - The runtime side of every shim
//! - [`CallContext`] / [`BoxedRef`] - What interceptors see of a call
//! - [`CallInterceptor`] - The callback trait interceptors implement
//! - [`InterceptTable`] - Per-function records, enable and disable
//! - [`GenericSharingPolicy`] - How generic instantiations map to shims
//!
//! # Examples
//!
//! ```rust,no_run
//! use jitscope::intercept::{CallContext, FnInterceptor};
//! use jitscope::prelude::*;
//! use std::sync::Arc;
//!
//! # fn example(engine: &Engine) -> jitscope::Result<()> {
//! engine.add_resolver(Arc::new(|context: &mut MethodContext| -> jitscope::Result<()> {
//!     if context.is("App.Calculator", "Sum") {
//!         context.intercept_calls()?;
//!     }
//!     Ok(())
//! }));
//!
//! engine.add_interceptor(Arc::new(FnInterceptor::new(|call: &mut CallContext| {
//!     let a: i32 = call.get_parameter(0)?;
//!     call.set_parameter(0, a * 2)
//! })));
//! # Ok(())
//! # }
//! ```

mod boxed;
mod builder;
mod context;
mod interceptor;
mod manager;
mod policy;
mod record;
pub mod shim;

pub use boxed::BoxedRef;
pub use builder::{CallInterceptionBuilder, ShimRequest};
pub use context::CallContext;
pub use interceptor::{CallInterceptor, FnInterceptor, InterceptFuture};
pub use manager::{call_manager_entry, CallManager, CallManagerEntryFn};
pub use policy::{CanonicalSharing, ExactInstantiation, GenericSharingPolicy};
pub use record::{InterceptRecord, InterceptTable};
pub use shim::{CilShimEmitter, ShimEmitter, ShimLabel, ShimOp, ShimProgram, ShimShape};
