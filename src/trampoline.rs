//! Executable stubs that jump to a fixed absolute address.
//!
//! When a vtable slot is hooked, the function it pointed to must stay reachable. The
//! [`TrampolineCodeGenerator`] writes a tiny unconditional jump to that function into fresh
//! executable memory; the hook calls the original through the stub's address.
//!
//! # Encodings
//!
//! | Architecture | Bytes | Instruction(s) |
//! |--------------|-------|----------------|
//! | x86-64 | 12 | `mov rax, imm64` (`48 B8 imm64`); `jmp rax` (`FF E0`) |
//! | x86 | 5 | `jmp rel32` (`E9 rel32`), relative to the end of the jump |
//! | AArch64 | 16 | `ldr x16, #8`; `br x16`; `imm64` |
//!
//! # Examples
//!
//! ```rust
//! use jitscope::trampoline::{encode, Architecture};
//!
//! let bytes = encode(Architecture::X64, 0x1000, 0x1122_3344_5566_7788)?;
//! assert_eq!(bytes[..2], [0x48, 0xB8]);
//! assert_eq!(bytes[10..], [0xFF, 0xE0]);
//! # Ok::<(), jitscope::Error>(())
//! ```

use strum::{Display, EnumIter};
use tracing::trace;

use crate::{memory::RawRegion, Error, Result};

/// Instruction set a trampoline is encoded for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum Architecture {
    /// 32-bit x86
    #[strum(serialize = "x86")]
    X86,
    /// x86-64
    #[strum(serialize = "x86-64")]
    X64,
    /// AArch64
    #[strum(serialize = "aarch64")]
    Arm64,
}

impl Architecture {
    /// The architecture this crate was compiled for, if trampolines exist for it.
    #[must_use]
    pub const fn current() -> Option<Self> {
        if cfg!(target_arch = "x86_64") {
            Some(Architecture::X64)
        } else if cfg!(target_arch = "x86") {
            Some(Architecture::X86)
        } else if cfg!(target_arch = "aarch64") {
            Some(Architecture::Arm64)
        } else {
            None
        }
    }

    /// Size of one trampoline in bytes.
    #[must_use]
    pub const fn trampoline_size(self) -> usize {
        match self {
            Architecture::X86 => 5,
            Architecture::X64 => 12,
            Architecture::Arm64 => 16,
        }
    }
}

/// Encodes a jump to `target` for a trampoline placed at `at`.
///
/// Only the x86 encoding depends on `at`; the others load the absolute target.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] if an x86 target does not fit in a 32-bit address space.
pub fn encode(arch: Architecture, at: usize, target: usize) -> Result<Vec<u8>> {
    let mut code = Vec::with_capacity(arch.trampoline_size());

    match arch {
        Architecture::X64 => {
            code.extend_from_slice(&[0x48, 0xB8]);
            code.extend_from_slice(&(target as u64).to_le_bytes());
            code.extend_from_slice(&[0xFF, 0xE0]);
        }
        Architecture::X86 => {
            let (Ok(at), Ok(target)) = (u32::try_from(at), u32::try_from(target)) else {
                return Err(malformed_error!(
                    "x86 trampoline addresses must be 32-bit - at 0x{:x}, target 0x{:x}",
                    at,
                    target
                ));
            };
            let rel = target.wrapping_sub(at.wrapping_add(5));
            code.push(0xE9);
            code.extend_from_slice(&rel.to_le_bytes());
        }
        Architecture::Arm64 => {
            // ldr x16, #8
            code.extend_from_slice(&0x5800_0050u32.to_le_bytes());
            // br x16
            code.extend_from_slice(&0xD61F_0200u32.to_le_bytes());
            code.extend_from_slice(&(target as u64).to_le_bytes());
        }
    }

    Ok(code)
}

/// An emitted jump stub.
///
/// The executable memory is released when the value is dropped, after which the address
/// must not be called.
pub struct Trampoline {
    region: RawRegion,
    target: usize,
    arch: Architecture,
}

impl Trampoline {
    /// Address to call instead of the target.
    #[must_use]
    pub fn address(&self) -> usize {
        self.region.address()
    }

    /// The function the stub jumps to.
    #[must_use]
    pub fn target(&self) -> usize {
        self.target
    }

    /// The encoding used.
    #[must_use]
    pub fn architecture(&self) -> Architecture {
        self.arch
    }
}

impl std::fmt::Debug for Trampoline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trampoline")
            .field("address", &format_args!("0x{:x}", self.address()))
            .field("target", &format_args!("0x{:x}", self.target))
            .field("arch", &self.arch)
            .finish()
    }
}

/// Writes trampolines into freshly allocated executable memory.
#[derive(Debug, Clone, Copy)]
pub struct TrampolineCodeGenerator {
    arch: Architecture,
}

impl TrampolineCodeGenerator {
    /// A generator for the architecture this crate runs on.
    ///
    /// # Errors
    /// Returns [`crate::Error::UnsupportedArchitecture`] on targets without an encoding.
    pub fn new() -> Result<Self> {
        let arch = Architecture::current()
            .ok_or(Error::UnsupportedArchitecture(std::env::consts::ARCH))?;
        Ok(Self { arch })
    }

    /// A generator for an explicit architecture.
    ///
    /// Stubs for a foreign architecture can be inspected but not executed.
    #[must_use]
    pub fn with_architecture(arch: Architecture) -> Self {
        Self { arch }
    }

    /// The architecture stubs are encoded for.
    #[must_use]
    pub fn architecture(&self) -> Architecture {
        self.arch
    }

    /// Emits a stub that jumps to `target`.
    ///
    /// # Errors
    /// Returns [`crate::Error::AllocationFailed`] if no executable memory is available.
    pub fn emit(&self, target: usize) -> Result<Trampoline> {
        let mut region = RawRegion::allocate(self.arch.trampoline_size())?;
        let code = encode(self.arch, region.address(), target)?;
        region.write(&code)?;

        trace!(
            address = format_args!("0x{:x}", region.address()),
            target = format_args!("0x{target:x}"),
            arch = %self.arch,
            "emitted trampoline"
        );
        Ok(Trampoline {
            region,
            target,
            arch: self.arch,
        })
    }

    /// Releases a stub's memory.
    pub fn free(&self, trampoline: Trampoline) {
        drop(trampoline);
    }
}
