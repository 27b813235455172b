// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(clippy::too_many_arguments)]

//! # jitscope
//!
//! In-process interception of a managed runtime's JIT compiler.
//!
//! `jitscope` sits between a CLR-style host and its JIT compiler. It hooks the compiler's
//! function pointer tables from inside the host process and lets the embedder decide, per
//! function and at compile time, what the host ends up executing: a different IL body,
//! caller-supplied machine code, an arbitrary entry address, or the original code routed
//! through a chain of asynchronous call interceptors.
//!
//! ## Features
//!
//! - **Vtable hooks with trampolines** - Slot hooks that keep the original reachable
//! - **Resolver chains** - Ordered, first-decision-wins callbacks on every compilation
//! - **Token and string hooks** - Which function referenced which, literal replacement
//! - **Call interception** - Synthesized CIL shims hand every call to async interceptors
//! - **Native patching** - Removal of caller-identity checks from compiled shims (x86-64)
//! - **Version-keyed layouts** - One offset table per supported host release
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use jitscope::prelude::*;
//! use std::sync::Arc;
//!
//! # fn example(host: Arc<dyn HostServices>, compiler: VTable) -> jitscope::Result<()> {
//! jitscope::logging::init(Some("info"));
//!
//! let engine = Engine::new(EngineConfig::default(), host)?;
//! engine.add_resolver(Arc::new(|context: &mut MethodContext| -> jitscope::Result<()> {
//!     if context.is("App.Calculator", "Sum") {
//!         context.intercept_calls()?;
//!     }
//!     Ok(())
//! }));
//! unsafe { engine.install(compiler)? };
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! host ── compileMethod ──▶ compile::CompilationInterceptor ──▶ resolvers
//!   │                              │                                │
//!   │                              ├─ compile::TokenResolutionInterceptor (lazy)
//!   │                              └─ intercept::CallInterceptionBuilder ── shim
//!   │                                                                    │
//!   └─────────── calls ──▶ shim ──▶ intercept::CallManager ──▶ interceptors
//! ```
//!
//! ## Safety
//!
//! Hooking writes to memory the host owns. Installation and removal are `unsafe` and only
//! sound with the live tables of the host the engine was created for. Every hook catches
//! panics and callback errors and falls back to the original behavior, so a failing
//! resolver degrades to an unmodified compilation rather than a crashed host.

#[macro_use]
pub(crate) mod macros;

#[macro_use]
pub(crate) mod error;

/// Shared functionality which is used in unit- and integration-tests
#[cfg(test)]
pub(crate) mod test;

/// Convenient re-exports of the most commonly used types and traits.
///
/// # Example
///
/// ```rust,no_run
/// use jitscope::prelude::*;
///
/// let config = EngineConfig::default().with_interceptor_threads(4);
/// assert!(config.validate().is_ok());
/// ```
pub mod prelude;

/// Ordered callback registries shared by all resolver and interceptor chains.
pub mod chain;

/// Engine configuration, in code or from `JITSCOPE_*` environment variables.
pub mod config;

/// Interception of the host's compile entry and of the compiler's callbacks.
pub mod compile;

/// The engine facade and the state its hooks share.
pub mod engine;

/// The host runtime as seen through its JIT interface.
pub mod host;

/// Call interception: shims, the call manager and the interceptor chain.
pub mod intercept;

/// Subscriber setup for the crate's `tracing` output.
pub mod logging;

/// Executable and writable process memory.
pub mod memory;

/// Removal of caller-identity checks from compiled machine code.
pub mod patch;

/// Jump stubs back to hooked functions.
pub mod trampoline;

/// Little-endian byte access and blocking synchronization helpers.
pub mod utils;

/// Function pointer tables and slot hooks.
pub mod vtable;

/// `jitscope` Result type
///
/// A type alias for `std::result::Result<T, Error>` where the error type is always [`Error`].
///
/// # Example
///
/// ```rust
/// use jitscope::{Result, Error};
///
/// fn validate(threads: usize) -> Result<usize> {
///     if threads == 0 {
///         return Err(Error::InvalidConfiguration("no threads".to_string()));
///     }
///     Ok(threads)
/// }
/// # assert!(validate(0).is_err());
/// ```
pub type Result<T> = std::result::Result<T, Error>;

/// `jitscope` Error type
///
/// The main error type for all operations in this crate. Failures inside hooks never reach
/// the host; they are logged and the affected compilation or call falls back to the
/// original behavior. Only installation, registration-time validation and explicit queries
/// surface errors to the caller.
///
/// # Example
///
/// ```rust,no_run
/// use jitscope::{Engine, EngineConfig, Error};
/// # use std::sync::Arc;
/// # fn example(host: Arc<dyn jitscope::host::HostServices>) {
/// match Engine::new(EngineConfig::default(), host) {
///     Ok(_) => println!("engine ready"),
///     Err(Error::UnsupportedHostVersion(version)) => println!("unsupported host {version}"),
///     Err(e) => println!("Error: {e}"),
/// }
/// # }
/// ```
pub use error::Error;

/// The interception engine and its configuration.
pub use config::EngineConfig;
pub use engine::Engine;

/// Ordered registries and their handles.
pub use chain::{CallbackChain, ResolverId};

/// Low-level parsing and synchronization utilities.
///
/// [`Parser`] decodes little-endian instruction streams such as the machine code the
/// native patcher scans.
///
/// # Example
///
/// ```rust
/// use jitscope::Parser;
///
/// let code = [0x48, 0xB8, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
/// let mut parser = Parser::new(&code);
/// assert_eq!(parser.read_le::<u16>()?, 0xB848);
/// assert_eq!(parser.read_le::<u64>()?, 1);
/// # Ok::<(), jitscope::Error>(())
/// ```
pub use utils::{CompletionSemaphore, Parser};
