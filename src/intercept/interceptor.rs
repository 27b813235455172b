use std::{future::Future, pin::Pin};

use crate::{host::MethodHandle, intercept::CallContext, Result};

/// The future an interceptor returns.
pub type InterceptFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// Observes or replaces calls to intercepted functions.
///
/// Interceptors run on the call manager's runtime, one after the other in registration
/// order, while the calling thread waits. An interceptor that clears the proceed flag ends
/// the chain and suppresses the original function. Errors and panics are logged and the
/// chain continues with the next interceptor.
pub trait CallInterceptor: Send + Sync {
    /// Returns `true` if the interceptor wants calls of `method`.
    fn applies_to(&self, _method: MethodHandle) -> bool {
        true
    }

    /// Handles one call.
    fn intercept<'a>(&'a self, context: &'a mut CallContext) -> InterceptFuture<'a>;
}

/// A [`CallInterceptor`] backed by a synchronous closure.
///
/// # Examples
///
/// ```rust
/// use jitscope::intercept::{CallContext, FnInterceptor};
/// use jitscope::host::MethodHandle;
///
/// let doubling = FnInterceptor::new(|context: &mut CallContext| {
///     let value: i32 = context.get_parameter(0)?;
///     context.set_parameter(0, value * 2)
/// })
/// .for_method(MethodHandle(0x1000));
/// # let _ = doubling;
/// ```
pub struct FnInterceptor<F> {
    callback: F,
    method: Option<MethodHandle>,
}

impl<F> FnInterceptor<F>
where
    F: Fn(&mut CallContext) -> Result<()> + Send + Sync,
{
    /// Wraps `callback`, applying to every intercepted function.
    pub fn new(callback: F) -> Self {
        FnInterceptor {
            callback,
            method: None,
        }
    }

    /// Restricts the interceptor to calls of `method`.
    #[must_use]
    pub fn for_method(mut self, method: MethodHandle) -> Self {
        self.method = Some(method);
        self
    }
}

impl<F> CallInterceptor for FnInterceptor<F>
where
    F: Fn(&mut CallContext) -> Result<()> + Send + Sync,
{
    fn applies_to(&self, method: MethodHandle) -> bool {
        self.method.is_none_or(|filter| filter == method)
    }

    fn intercept<'a>(&'a self, context: &'a mut CallContext) -> InterceptFuture<'a> {
        Box::pin(std::future::ready((self.callback)(context)))
    }
}
