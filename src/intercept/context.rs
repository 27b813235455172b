use crate::{
    host::{ClassHandle, MethodHandle},
    intercept::BoxedRef,
    Error, Result,
};

/// One intercepted call, as seen by the interceptor chain.
///
/// Parameters are in call order with the receiver first for instance functions. Writes
/// through [`CallContext::set_parameter`] are visible to the original function when the
/// call proceeds; writes through [`CallContext::set_return_value`] are what the caller gets
/// when it does not.
#[derive(Debug)]
pub struct CallContext {
    method: MethodHandle,
    has_this: bool,
    parameters: Vec<BoxedRef>,
    return_value: Option<BoxedRef>,
    generic_arguments: Vec<ClassHandle>,
    proceed: bool,
}

impl CallContext {
    /// Creates a context that proceeds to the original function.
    #[must_use]
    pub fn new(
        method: MethodHandle,
        has_this: bool,
        parameters: Vec<BoxedRef>,
        return_value: Option<BoxedRef>,
        generic_arguments: Vec<ClassHandle>,
    ) -> Self {
        CallContext {
            method,
            has_this,
            parameters,
            return_value,
            generic_arguments,
            proceed: true,
        }
    }

    /// The intercepted function.
    #[must_use]
    pub fn method(&self) -> MethodHandle {
        self.method
    }

    /// Returns `true` if parameter 0 is the receiver.
    #[must_use]
    pub fn has_this(&self) -> bool {
        self.has_this
    }

    /// Number of parameters, including the receiver.
    #[must_use]
    pub fn parameter_count(&self) -> usize {
        self.parameters.len()
    }

    /// The boxed parameter at `index`.
    #[must_use]
    pub fn parameter(&self, index: usize) -> Option<&BoxedRef> {
        self.parameters.get(index)
    }

    /// Reads parameter `index` as `T`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] for a bad index and the unboxing error of
    /// [`BoxedRef::get`] otherwise.
    pub fn get_parameter<T: Copy>(&self, index: usize) -> Result<T> {
        self.parameters.get(index).ok_or(Error::OutOfBounds)?.get()
    }

    /// Overwrites parameter `index`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] for a bad index and the boxing error of
    /// [`BoxedRef::set`] otherwise.
    pub fn set_parameter<T: Copy>(&mut self, index: usize, value: T) -> Result<()> {
        self.parameters.get(index).ok_or(Error::OutOfBounds)?.set(value)
    }

    /// The boxed return slot; `None` for functions returning nothing.
    #[must_use]
    pub fn return_value(&self) -> Option<&BoxedRef> {
        self.return_value.as_ref()
    }

    /// Reads the return slot as `T`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the function returns nothing or `T` does not
    /// fit the return shape.
    pub fn get_return_value<T: Copy>(&self) -> Result<T> {
        self.return_slot()?.get()
    }

    /// Overwrites the return slot.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the function returns nothing or `T` does not
    /// fit the return shape.
    pub fn set_return_value<T: Copy>(&mut self, value: T) -> Result<()> {
        self.return_slot()?.set(value)
    }

    fn return_slot(&self) -> Result<&BoxedRef> {
        self.return_value
            .as_ref()
            .ok_or_else(|| malformed_error!("{} has no return value", self.method))
    }

    /// Type arguments of the invoked instantiation, empty for non-generic functions.
    #[must_use]
    pub fn generic_arguments(&self) -> &[ClassHandle] {
        &self.generic_arguments
    }

    /// Whether the original function runs after the chain.
    #[must_use]
    pub fn proceed(&self) -> bool {
        self.proceed
    }

    /// Skips the original function and every later interceptor.
    pub fn skip_original(&mut self) {
        self.proceed = false;
    }

    /// Sets the proceed flag.
    pub fn set_proceed(&mut self, proceed: bool) {
        self.proceed = proceed;
    }
}
