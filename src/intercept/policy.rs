use crate::host::{ClassHandle, GenericArgument};

/// Decides which instantiation a shim is built for.
///
/// Hosts share one body between instantiations whose reference-type arguments differ; the
/// shared body is compiled once, for the canonical instantiation, and receives the exact
/// instantiation as a hidden argument. A policy maps the instantiation being compiled to
/// the one the shim is keyed on.
pub trait GenericSharingPolicy: Send + Sync {
    /// The instantiation for `arguments`, given the host's canonical placeholder type.
    fn canonicalize(
        &self,
        arguments: &[GenericArgument],
        placeholder: Option<ClassHandle>,
    ) -> Vec<ClassHandle>;
}

/// Reference-type arguments collapse to the placeholder; value types stay exact.
///
/// This is the sharing rule of the reference host. Without a placeholder the arguments are
/// kept as they are.
#[derive(Debug, Clone, Copy, Default)]
pub struct CanonicalSharing;

impl GenericSharingPolicy for CanonicalSharing {
    fn canonicalize(
        &self,
        arguments: &[GenericArgument],
        placeholder: Option<ClassHandle>,
    ) -> Vec<ClassHandle> {
        arguments
            .iter()
            .map(|argument| match placeholder {
                Some(placeholder) if argument.is_reference_type => placeholder,
                _ => argument.class,
            })
            .collect()
    }
}

/// Every instantiation gets its own shim.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactInstantiation;

impl GenericSharingPolicy for ExactInstantiation {
    fn canonicalize(
        &self,
        arguments: &[GenericArgument],
        _placeholder: Option<ClassHandle>,
    ) -> Vec<ClassHandle> {
        arguments.iter().map(|argument| argument.class).collect()
    }
}
