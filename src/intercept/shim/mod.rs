//! Synthesis of call interception shims.
//!
//! A shim replaces the body of an intercepted function. It exposes every argument and its
//! return slot to the call manager by address, asks the manager whether to proceed, calls
//! the real implementation through its entry address if so, and returns whatever ended up
//! in the return slot:
//!
//! ```text
//! args[i] = &arg_i                              for every parameter
//! proceed = manager(record, args, n, &result, context)
//! if proceed { result = real(arg_0, .., arg_n) }
//! return result                                 (a completed task if it is still null)
//! ```
//!
//! The shim is first described as a [`ShimProgram`], a short list of [`ShimOp`]s that knows
//! nothing about the host's instruction set, and then lowered by a [`ShimEmitter`]. The
//! emitter shipped with the crate is [`CilShimEmitter`].

mod cil;
mod opcodes;

use crate::{
    compile::MethodBody,
    host::{MethodDescriptor, MethodHandle, ModuleHandle, ReturnShape, ValueShape},
    Result,
};

pub use cil::CilShimEmitter;

/// Calling convention of an intercepted function as the shim sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShimShape {
    /// Whether parameter 0 is the receiver
    pub has_this: bool,
    /// Whether the real implementation takes a hidden instantiation argument
    pub generic_context: bool,
    /// Every parameter in call order, the receiver first
    pub parameters: Vec<ValueShape>,
    /// Return shape
    pub return_shape: ReturnShape,
}

impl ShimShape {
    /// The shape of `descriptor`. Receivers are exposed as object references.
    #[must_use]
    pub fn from_descriptor(descriptor: &MethodDescriptor, generic_context: bool) -> Self {
        let has_this = !descriptor.is_static;
        let mut parameters = Vec::with_capacity(descriptor.parameters.len() + 1);
        if has_this {
            parameters.push(ValueShape::ObjectRef);
        }
        parameters.extend_from_slice(&descriptor.parameters);

        ShimShape {
            has_this,
            generic_context,
            parameters,
            return_shape: descriptor.return_shape,
        }
    }

    /// Returns `true` if the shim has a return slot.
    #[must_use]
    pub fn returns_value(&self) -> bool {
        !matches!(self.return_shape, ReturnShape::Void)
    }

    /// The declared parameters, without the receiver.
    #[must_use]
    pub fn declared_parameters(&self) -> &[ValueShape] {
        &self.parameters[usize::from(self.has_this)..]
    }
}

/// A branch target inside a [`ShimProgram`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShimLabel(pub u16);

/// One step of a shim.
///
/// Values named "native int" are pointer-sized integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShimOp {
    /// Allocate the frame-local array of `count` argument addresses
    AllocateArgumentArray {
        /// Number of entries
        count: u16,
    },
    /// `array[slot] = &argument`
    StoreArgumentAddress {
        /// Argument index, the receiver being 0
        argument: u16,
        /// Array index
        slot: u16,
    },
    /// Push the argument array address
    LoadArgumentArray,
    /// Push a native int constant
    LoadConstant(u64),
    /// Push an `int32` constant
    LoadInt32(i32),
    /// Push the address of the return slot
    LoadResultAddress,
    /// Push a null native int
    LoadNull,
    /// Call the call manager entry with the five values on the stack, pushing the proceed flag
    CallManager {
        /// Entry address
        target: u64,
    },
    /// Pop the proceed flag and jump to the label if it is zero
    BranchIfFalse(ShimLabel),
    /// Push argument `n` by value
    LoadArgument(u16),
    /// Call the real implementation with the values on the stack
    CallReal {
        /// Entry address
        target: u64,
    },
    /// Pop into the return slot
    StoreResult,
    /// Bind a label here
    Mark(ShimLabel),
    /// Push the return slot
    LoadResult,
    /// Replace a null task on the stack with a completed one
    CompletedMarker,
    /// Return
    Return,
}

/// The abstract body of one shim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShimProgram {
    /// The intercepted function
    pub method: MethodHandle,
    /// Its calling convention
    pub shape: ShimShape,
    /// Instantiation argument passed to the real implementation
    pub generic_context: Option<usize>,
    /// The steps
    pub ops: Vec<ShimOp>,
}

impl ShimProgram {
    /// Label of the common exit.
    pub const EXIT: ShimLabel = ShimLabel(0);

    /// Describes the shim of `method`.
    ///
    /// `record` is the address of the intercept record, `manager` the call manager entry,
    /// `real` the entry of the real implementation. `generic_context` is only used when the
    /// shape takes a hidden instantiation argument.
    #[must_use]
    pub fn build(
        method: MethodHandle,
        shape: &ShimShape,
        record: usize,
        manager: usize,
        real: usize,
        generic_context: Option<usize>,
    ) -> Self {
        let generic_context = generic_context.filter(|_| shape.generic_context);
        let count = u16::try_from(shape.parameters.len()).unwrap_or(u16::MAX);
        let returns_value = shape.returns_value();
        let mut ops = Vec::with_capacity(usize::from(count) * 2 + 16);

        if count > 0 {
            ops.push(ShimOp::AllocateArgumentArray { count });
            ops.extend((0..count).map(|index| ShimOp::StoreArgumentAddress {
                argument: index,
                slot: index,
            }));
        }

        ops.push(ShimOp::LoadConstant(record as u64));
        ops.push(if count > 0 {
            ShimOp::LoadArgumentArray
        } else {
            ShimOp::LoadNull
        });
        ops.push(ShimOp::LoadInt32(i32::from(count)));
        ops.push(if returns_value {
            ShimOp::LoadResultAddress
        } else {
            ShimOp::LoadNull
        });
        ops.push(match generic_context {
            Some(context) => ShimOp::LoadConstant(context as u64),
            None => ShimOp::LoadNull,
        });
        ops.push(ShimOp::CallManager {
            target: manager as u64,
        });
        ops.push(ShimOp::BranchIfFalse(Self::EXIT));

        // Hidden instantiation argument goes after the receiver
        let receiver = u16::from(shape.has_this).min(count);
        ops.extend((0..receiver).map(ShimOp::LoadArgument));
        if let Some(context) = generic_context {
            ops.push(ShimOp::LoadConstant(context as u64));
        }
        ops.extend((receiver..count).map(ShimOp::LoadArgument));
        ops.push(ShimOp::CallReal {
            target: real as u64,
        });
        if returns_value {
            ops.push(ShimOp::StoreResult);
        }

        ops.push(ShimOp::Mark(Self::EXIT));
        if returns_value {
            ops.push(ShimOp::LoadResult);
        }
        if shape.return_shape == ReturnShape::Task {
            ops.push(ShimOp::CompletedMarker);
        }
        ops.push(ShimOp::Return);

        ShimProgram {
            method,
            shape: shape.clone(),
            generic_context,
            ops,
        }
    }

    /// Number of values the real implementation is called with.
    #[must_use]
    pub fn real_argument_count(&self) -> usize {
        self.shape.parameters.len() + usize::from(self.generic_context.is_some())
    }
}

/// Lowers a [`ShimProgram`] to a body the host can compile.
pub trait ShimEmitter: Send + Sync {
    /// Emits the body of `program`, using tokens valid in `module`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Shim`] if the program cannot be expressed.
    fn emit(&self, program: &ShimProgram, module: ModuleHandle) -> Result<MethodBody>;
}
