use crate::{compile::MethodContext, Result};

/// Decides what happens to a function about to be compiled.
///
/// Resolvers run in registration order on every outermost compilation. A resolver that does
/// not care about the function returns `Ok(())` without touching the context; the first one
/// that moves the context to a terminal state ends the chain.
///
/// Returning an error (or panicking) discards any decision taken for the function, which is
/// then compiled unmodified.
///
/// Closures taking `&mut MethodContext` implement this trait:
///
/// ```rust
/// use jitscope::compile::{MethodContext, MethodResolver};
///
/// fn forty_two(context: &mut MethodContext) -> jitscope::Result<()> {
///     if context.is("App.Answers", "Get") {
///         // mov eax, 42; ret
///         context.resolve_native(vec![0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3])?;
///     }
///     Ok(())
/// }
///
/// fn accepts(_resolver: impl MethodResolver) {}
/// accepts(forty_two);
/// ```
pub trait MethodResolver: Send + Sync {
    /// Inspects, and possibly resolves, `context`.
    ///
    /// # Errors
    /// Any error aborts the chain and the function is compiled unmodified.
    fn resolve(&self, context: &mut MethodContext) -> Result<()>;
}

impl<F> MethodResolver for F
where
    F: Fn(&mut MethodContext) -> Result<()> + Send + Sync,
{
    fn resolve(&self, context: &mut MethodContext) -> Result<()> {
        self(context)
    }
}
