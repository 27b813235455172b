//! Version-keyed layouts of the JIT interface structures.
//!
//! The compile hook receives raw pointers to host structures (`CORINFO_METHOD_INFO`,
//! `CORINFO_RESOLVED_TOKEN`) and the host's callback interface as a bare function table.
//! Field offsets and slot indices shift between host releases, so they are looked up once,
//! at engine construction, from the table in this module. No host introspection happens at
//! runtime.
//!
//! All offsets are derived from the pointer width of the build, since the host process and
//! this library always share it.

use std::{fmt, str::FromStr};

use crate::{Error, Result};

const P: usize = std::mem::size_of::<usize>();

const fn align(value: usize, to: usize) -> usize {
    (value + to - 1) & !(to - 1)
}

/// A host runtime release, `major.minor.patch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostVersion {
    /// Major version
    pub major: u16,
    /// Minor version
    pub minor: u16,
    /// Patch version
    pub patch: u16,
}

impl HostVersion {
    /// Creates a version from its parts
    #[must_use]
    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        HostVersion {
            major,
            minor,
            patch,
        }
    }
}

impl FromStr for HostVersion {
    type Err = Error;

    /// Parses `major.minor[.patch][-suffix]`, e.g. `8.0.4` or `7.0.0-rc.2`.
    fn from_str(value: &str) -> Result<Self> {
        let numeric = value
            .trim()
            .split(['-', '+'])
            .next()
            .unwrap_or_default();

        let mut parts = numeric.split('.').map(str::parse::<u16>);
        let invalid = || Error::UnsupportedHostVersion(value.to_string());

        let major = parts.next().ok_or_else(invalid)?.map_err(|_| invalid())?;
        let minor = parts.next().ok_or_else(invalid)?.map_err(|_| invalid())?;
        let patch = match parts.next() {
            Some(patch) => patch.map_err(|_| invalid())?,
            None => 0,
        };

        Ok(HostVersion::new(major, minor, patch))
    }
}

impl fmt::Display for HostVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Offsets inside `CORINFO_SIG_INFO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigInfoLayout {
    /// `retType`, `flags` and `numArgs` packed into one 32-bit word
    pub packed: usize,
    /// `sigInst.classInstCount`
    pub class_inst_count: usize,
    /// `sigInst.classInst`
    pub class_inst: usize,
    /// `sigInst.methInstCount`
    pub meth_inst_count: usize,
    /// `sigInst.methInst`
    pub meth_inst: usize,
    /// `pSig`
    pub sig: usize,
    /// `cbSig`
    pub sig_size: usize,
    /// `scope`
    pub scope: usize,
    /// `token`
    pub token: usize,
    /// Size of the whole structure
    pub size: usize,
}

impl SigInfoLayout {
    /// `numArgs` lives in the upper half of the packed word.
    pub const fn num_args(&self) -> usize {
        self.packed + 2
    }

    const fn new(with_method_signature: bool) -> Self {
        let packed = 3 * P;
        let sig_inst = align(packed + 4, P);
        let args = sig_inst + 4 * P;
        let sig = args + P;
        let sig_size = sig + P;
        let after = align(sig_size + 4, P);
        let scope = if with_method_signature { after + P } else { after };
        let token = scope + P;

        SigInfoLayout {
            packed,
            class_inst_count: sig_inst,
            class_inst: sig_inst + P,
            meth_inst_count: sig_inst + 2 * P,
            meth_inst: sig_inst + 3 * P,
            sig,
            sig_size,
            scope,
            token,
            size: align(token + 4, P),
        }
    }
}

/// Offsets inside `CORINFO_METHOD_INFO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodInfoLayout {
    /// `ftn`, the method handle
    pub method: usize,
    /// `scope`, the module handle
    pub scope: usize,
    /// `ILCode`
    pub il_code: usize,
    /// `ILCodeSize`
    pub il_code_size: usize,
    /// `maxStack`
    pub max_stack: usize,
    /// `EHcount`
    pub eh_count: usize,
    /// `options`
    pub options: usize,
    /// `regionKind`
    pub region_kind: usize,
    /// `args`
    pub args: usize,
    /// `locals`
    pub locals: usize,
    /// Layout of the embedded signatures
    pub sig: SigInfoLayout,
}

impl MethodInfoLayout {
    const fn new(with_method_signature: bool) -> Self {
        let sig = SigInfoLayout::new(with_method_signature);
        let args = align(3 * P + 20, P);

        MethodInfoLayout {
            method: 0,
            scope: P,
            il_code: 2 * P,
            il_code_size: 3 * P,
            max_stack: 3 * P + 4,
            eh_count: 3 * P + 8,
            options: 3 * P + 12,
            region_kind: 3 * P + 16,
            args,
            locals: args + sig.size,
            sig,
        }
    }

    /// Number of bytes a fake or copied block must have.
    pub const fn size(&self) -> usize {
        self.locals + self.sig.size
    }
}

/// Offsets inside `CORINFO_RESOLVED_TOKEN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedTokenLayout {
    /// `tokenContext`
    pub context: usize,
    /// `tokenScope`
    pub scope: usize,
    /// `token`
    pub token: usize,
    /// `tokenType`
    pub token_type: usize,
    /// `hClass`
    pub class: usize,
    /// `hMethod`
    pub method: usize,
    /// `hField`
    pub field: usize,
    /// Size of the whole structure
    pub size: usize,
}

impl ResolvedTokenLayout {
    const fn new() -> Self {
        ResolvedTokenLayout {
            context: 0,
            scope: P,
            token: 2 * P,
            token_type: 2 * P + 4,
            class: 3 * P,
            method: 4 * P,
            field: 5 * P,
            size: 10 * P,
        }
    }
}

/// Slot indices of the hooked entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JitInterfaceSlots {
    /// `ICorJitCompiler::compileMethod`
    pub compile_method: usize,
    /// `ICorJitInfo::resolveToken`
    pub resolve_token: usize,
    /// `ICorJitInfo::constructStringLiteral`
    pub construct_string_literal: usize,
}

/// Everything version-dependent about the JIT interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostLayout {
    /// Short name of the runtime family, for logging
    pub family: &'static str,
    /// `CORINFO_METHOD_INFO`
    pub method_info: MethodInfoLayout,
    /// `CORINFO_RESOLVED_TOKEN`
    pub resolved_token: ResolvedTokenLayout,
    /// Hooked slot indices
    pub slots: JitInterfaceSlots,
}

impl HostLayout {
    /// Builds a layout entry.
    #[must_use]
    pub const fn new(
        family: &'static str,
        with_method_signature: bool,
        resolve_token: usize,
        construct_string_literal: usize,
    ) -> Self {
        HostLayout {
            family,
            method_info: MethodInfoLayout::new(with_method_signature),
            resolved_token: ResolvedTokenLayout::new(),
            slots: JitInterfaceSlots {
                compile_method: 0,
                resolve_token,
                construct_string_literal,
            },
        }
    }

    /// The layout for `version`.
    ///
    /// # Errors
    /// Returns [`crate::Error::UnsupportedHostVersion`] if no entry covers the version.
    pub fn for_version(version: HostVersion) -> Result<&'static HostLayout> {
        LAYOUTS
            .iter()
            .find(|(first, last, _)| *first <= version && version <= *last)
            .map(|(_, _, layout)| layout)
            .ok_or_else(|| Error::UnsupportedHostVersion(version.to_string()))
    }
}

/// Inclusive version ranges and their layouts.
static LAYOUTS: &[(HostVersion, HostVersion, HostLayout)] = &[
    (
        HostVersion::new(3, 0, 0),
        HostVersion::new(3, 1, u16::MAX),
        HostLayout::new("netcore3", false, 28, 151),
    ),
    (
        HostVersion::new(5, 0, 0),
        HostVersion::new(5, 0, u16::MAX),
        HostLayout::new("net5", false, 28, 157),
    ),
    (
        HostVersion::new(6, 0, 0),
        HostVersion::new(6, 0, u16::MAX),
        HostLayout::new("net6", false, 28, 159),
    ),
    (
        HostVersion::new(7, 0, 0),
        HostVersion::new(7, 0, u16::MAX),
        HostLayout::new("net7", true, 27, 163),
    ),
    (
        HostVersion::new(8, 0, 0),
        HostVersion::new(8, 0, u16::MAX),
        HostLayout::new("net8", true, 27, 166),
    ),
];
