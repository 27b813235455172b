use std::time::Duration;

use thiserror::Error;

use crate::{compile::ResolutionState, host::MethodHandle};

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

macro_rules! decode_error {
    ($offset:expr, $msg:expr) => {
        crate::Error::Decode {
            offset: $offset,
            message: $msg.to_string(),
        }
    };

    ($offset:expr, $fmt:expr, $($arg:tt)*) => {
        crate::Error::Decode {
            offset: $offset,
            message: format!($fmt, $($arg)*),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// The variants fall into three groups, which differ in how they are treated by the
/// interception pipeline:
///
/// ## Fatal, surfaced to the caller
/// - [`Error::HookAlreadyInstalled`] / [`Error::HookNotFound`] - vtable hook bookkeeping
/// - [`Error::MemoryProtectionFailed`] / [`Error::AllocationFailed`] - the OS refused a memory operation
/// - [`Error::UnsupportedHostVersion`] / [`Error::UnsupportedArchitecture`] - startup checks
///
/// ## Non-fatal, logged and swallowed inside hooks
/// - [`Error::FunctionNotResolvable`] - the function compiles uninstrumented
/// - [`Error::TokenResolutionFailed`] - the token source is simply not recorded
/// - [`Error::PatchPatternNotFound`] / [`Error::Decode`] - the check stays in place
///
/// ## Callback contract violations
/// - [`Error::ResolutionConflict`] - a resolver tried to set a second outcome
/// - [`Error::Interceptor`] / [`Error::Shim`] - call interception failures
///
/// # Examples
///
/// ```rust
/// use jitscope::Error;
///
/// fn describe(error: &Error) -> &'static str {
///     match error {
///         Error::HookAlreadyInstalled { .. } => "slot already hooked",
///         Error::HookNotFound { .. } => "hook was not installed",
///         _ => "other",
///     }
/// }
/// assert_eq!(describe(&Error::HookNotFound { slot: 0x1000 }), "hook was not installed");
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// A hook is already installed on the requested vtable slot.
    ///
    /// At most one hook may be active per slot; remove the existing hook first.
    #[error("A hook is already installed on slot 0x{slot:x}")]
    HookAlreadyInstalled {
        /// Address of the slot
        slot: usize,
    },

    /// The hook record passed to a removal request is not installed.
    #[error("No hook is installed on slot 0x{slot:x}")]
    HookNotFound {
        /// Address of the slot
        slot: usize,
    },

    /// The function being compiled could not be identified.
    ///
    /// The function is compiled as if no interception were present.
    #[error("Function handle 0x{0:x} could not be resolved")]
    FunctionNotResolvable(usize),

    /// The function that requested a token resolution could not be identified.
    #[error("Token context 0x{context:x} does not identify a function")]
    TokenResolutionFailed {
        /// Raw token context value read from the resolved token block
        context: usize,
    },

    /// The native code patcher did not find the caller-identity check.
    #[error("Access check pattern not found in native code")]
    PatchPatternNotFound,

    /// Changing the protection of a memory range failed.
    ///
    /// This is fatal for the operation that requested it, since continuing would
    /// either fault or leave memory in an unknown state.
    #[error("Failed to change protection of 0x{address:x} (+{len}): {source}")]
    MemoryProtectionFailed {
        /// Start of the range
        address: usize,
        /// Length of the range
        len: usize,
        /// OS error
        source: std::io::Error,
    },

    /// The OS refused to allocate executable memory.
    #[error("Failed to allocate {size} bytes of executable memory: {source}")]
    AllocationFailed {
        /// Requested size
        size: usize,
        /// OS error
        source: std::io::Error,
    },

    /// The running host version has no entry in the layout table.
    #[error("Unsupported host runtime version - {0}")]
    UnsupportedHostVersion(String),

    /// No trampoline encoding exists for the target architecture.
    #[error("Unsupported architecture - {0}")]
    UnsupportedArchitecture(&'static str),

    /// A resolver attempted to set a second terminal resolution.
    #[error("Method context is already {current}, cannot switch to {requested}")]
    ResolutionConflict {
        /// The resolution already set
        current: ResolutionState,
        /// The resolution that was rejected
        requested: ResolutionState,
    },

    /// The method has no call interception record.
    #[error("Method {0} is not intercepted")]
    NotIntercepted(MethodHandle),

    /// An instruction could not be decoded.
    #[error("Decode error at offset {offset}: {message}")]
    Decode {
        /// Offset of the offending instruction
        offset: usize,
        /// Description of the failure
        message: String,
    },

    /// Building or compiling a call interception shim failed.
    #[error("Shim synthesis failed - {0}")]
    Shim(String),

    /// A call interceptor reported a failure.
    #[error("Interceptor failed - {0}")]
    Interceptor(String),

    /// A bounded wait expired.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// The engine is not installed into a host.
    #[error("The interception engine is not installed")]
    NotInstalled,

    /// The engine is already installed into a host.
    #[error("The interception engine is already installed")]
    AlreadyInstalled,

    /// A configuration value could not be parsed.
    #[error("Invalid configuration - {0}")]
    InvalidConfiguration(String),

    /// A host data structure did not have the expected shape.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted while reading code or host data.
    #[error("Out of Bound read would have occurred!")]
    OutOfBounds,

    /// Failed to lock target.
    #[error("Failed to lock target")]
    LockError,

    /// Generic error for miscellaneous failures.
    #[error("{0}")]
    Error(String),
}
