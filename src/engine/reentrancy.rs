//! Per-thread nesting counters for the hooks.
//!
//! Compiling a function can make the host compile another one on the same thread (a
//! resolver touching a type whose static constructor has not run yet, for example). Each
//! hook site counts how deep the current thread is inside it; only the outermost entry does
//! any processing, nested entries forward straight to the original.

use std::{cell::Cell, marker::PhantomData};

use strum::Display;

thread_local! {
    static COMPILE: Cell<u32> = const { Cell::new(0) };
    static RESOLVE_TOKEN: Cell<u32> = const { Cell::new(0) };
    static STRING_LITERAL: Cell<u32> = const { Cell::new(0) };
}

/// A hook entry point with its own nesting counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum HookSite {
    /// The primary compile hook
    Compile,
    /// The token resolution hook
    ResolveToken,
    /// The string literal hook
    StringLiteral,
}

impl HookSite {
    fn with<R>(self, f: impl FnOnce(&Cell<u32>) -> R) -> R {
        match self {
            HookSite::Compile => COMPILE.with(f),
            HookSite::ResolveToken => RESOLVE_TOKEN.with(f),
            HookSite::StringLiteral => STRING_LITERAL.with(f),
        }
    }
}

/// Current nesting depth of `site` on this thread.
#[must_use]
pub fn current_depth(site: HookSite) -> u32 {
    site.with(Cell::get)
}

/// Increments a site counter for the lifetime of the guard.
///
/// The guard is not `Send`: it must be dropped on the thread that created it.
pub struct ReentrancyGuard {
    site: HookSite,
    depth: u32,
    _thread: PhantomData<*const ()>,
}

impl ReentrancyGuard {
    /// Enters `site` on the current thread.
    #[must_use]
    pub fn enter(site: HookSite) -> Self {
        let depth = site.with(|counter| {
            let depth = counter.get().saturating_add(1);
            counter.set(depth);
            depth
        });
        ReentrancyGuard {
            site,
            depth,
            _thread: PhantomData,
        }
    }

    /// Depth including this entry; 1 for the outermost.
    #[must_use]
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Returns `true` if this entry is nested inside another one of the same site.
    #[must_use]
    pub fn is_nested(&self) -> bool {
        self.depth > 1
    }
}

impl Drop for ReentrancyGuard {
    fn drop(&mut self) {
        self.site
            .with(|counter| counter.set(counter.get().saturating_sub(1)));
    }
}
