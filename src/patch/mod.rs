//! Removal of caller-identity checks from freshly compiled code.
//!
//! When the host compiles a shim that calls a function it would normally refuse to let the
//! shim's identity call (a non-public function of another type, say), it emits a runtime
//! access check into the shim's machine code:
//!
//! ```text
//! mov  rcx, <own identity>        ; the function being compiled
//! mov  rdx, <validation target>   ; the function whose access is checked
//! call <access check routine>
//! ```
//!
//! [`NativeCodePatcher`] finds that sequence and overwrites the first instruction with a jump
//! past the call. The routine address is learned from the first match and every later match
//! must call the same routine.
//!
//! Patching is best-effort. Anything the decoder does not understand aborts patching of
//! that function, and code without a recognizable sequence is left untouched.

pub mod x86;

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::{
    memory::{flush_instruction_cache, WritableScope},
    patch::x86::{CallTarget, DecodedInstruction, X86Instruction, X86Register},
    trampoline::Architecture,
    Error, Result,
};

/// A located access check and the bytes that disable it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchSite {
    /// Offset of the identity load the jump replaces
    pub start: usize,
    /// Offset of the instruction after the check call
    pub resume: usize,
    /// Address (or, for `call [rip+disp]`, cell address) of the check routine
    pub routine: u64,
    /// The jump written at `start`
    pub jump: Vec<u8>,
}

/// Finds and disables caller-identity checks in x86-64 code.
pub struct NativeCodePatcher {
    routine: AtomicU64,
    window: usize,
}

impl NativeCodePatcher {
    /// Maximum number of instructions between the identity load, the target load and the call.
    pub const DEFAULT_WINDOW: usize = 4;

    /// A patcher that has not seen a check routine yet.
    #[must_use]
    pub fn new() -> Self {
        Self::with_window(Self::DEFAULT_WINDOW)
    }

    /// A patcher accepting up to `window` instructions between the parts of a check.
    #[must_use]
    pub fn with_window(window: usize) -> Self {
        NativeCodePatcher {
            routine: AtomicU64::new(0),
            window: window.max(1),
        }
    }

    /// The check routine learned so far.
    #[must_use]
    pub fn routine(&self) -> Option<u64> {
        match self.routine.load(Ordering::Acquire) {
            0 => None,
            routine => Some(routine),
        }
    }

    /// Locates the access check in `code`, which is mapped at `base`, without modifying it.
    ///
    /// `own` is the identity of the compiled function, `targets` the identities that may be
    /// checked against it.
    ///
    /// # Errors
    /// - [`crate::Error::Decode`] if any part of `code` cannot be decoded, even after a check
    /// - [`crate::Error::PatchPatternNotFound`] if the code has no check
    pub fn scan(&self, code: &[u8], base: u64, own: u64, targets: &[u64]) -> Result<PatchSite> {
        let instructions = x86::decode_all(code, base)?;

        let learned = self.routine();
        for (index, decoded) in instructions.iter().enumerate() {
            if !matches!(decoded.instruction, X86Instruction::MovImm { value, .. } if value == own) {
                continue;
            }
            if let Some(site) = self.match_at(&instructions, index, targets, learned) {
                return Ok(site);
            }
        }

        Err(Error::PatchPatternNotFound)
    }

    fn match_at(
        &self,
        instructions: &[DecodedInstruction],
        start: usize,
        targets: &[u64],
        learned: Option<u64>,
    ) -> Option<PatchSite> {
        let window = |from: usize| (from + 1)..instructions.len().min(from + 1 + self.window);

        let target_load = window(start).find(|&index| {
            matches!(instructions[index].instruction,
                X86Instruction::MovImm { value, .. } if targets.contains(&value))
        })?;

        let call = window(target_load)
            .find(|&index| matches!(instructions[index].instruction, X86Instruction::Call(_)))?;

        let X86Instruction::Call(target) = instructions[call].instruction else {
            return None;
        };
        let routine = match target {
            CallTarget::Relative(address) | CallTarget::RipIndirect(address) => address,
            CallTarget::Register(register) => register_value(&instructions[..call], register)?,
            CallTarget::Indirect => return None,
        };
        if learned.is_some_and(|learned| learned != routine) {
            return None;
        }

        let from = instructions[start].offset;
        let resume = instructions[call].end();
        Some(PatchSite {
            start: from,
            resume,
            routine,
            jump: encode_jump(from, resume),
        })
    }

    /// Locates the access check in the code at `address` and jumps over it.
    ///
    /// # Errors
    /// - [`crate::Error::UnsupportedArchitecture`] on hosts other than x86-64
    /// - the errors of [`NativeCodePatcher::scan`]
    /// - [`crate::Error::MemoryProtectionFailed`] if the code cannot be made writable
    ///
    /// # Safety
    /// `address..address + size` must be live machine code that no thread executes while it
    /// is patched.
    pub unsafe fn patch(&self, address: usize, size: usize, own: u64, targets: &[u64]) -> Result<PatchSite> {
        if Architecture::current() != Some(Architecture::X64) {
            return Err(Error::UnsupportedArchitecture("native code patching requires x86-64"));
        }
        if address == 0 || size == 0 || targets.is_empty() {
            return Err(Error::PatchPatternNotFound);
        }

        let code = std::slice::from_raw_parts(address as *const u8, size);
        let site = self.scan(code, address as u64, own, targets)?;

        let at = address + site.start;
        {
            let _writable = WritableScope::new(at, site.jump.len())?;
            std::ptr::copy_nonoverlapping(site.jump.as_ptr(), at as *mut u8, site.jump.len());
        }
        flush_instruction_cache(at, site.jump.len());

        let _ = self
            .routine
            .compare_exchange(0, site.routine, Ordering::AcqRel, Ordering::Acquire);
        debug!(
            code = format_args!("0x{address:x}"),
            start = site.start,
            resume = site.resume,
            routine = format_args!("0x{:x}", site.routine),
            "disabled access check"
        );
        Ok(site)
    }
}

impl Default for NativeCodePatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn register_value(instructions: &[DecodedInstruction], register: X86Register) -> Option<u64> {
    instructions.iter().rev().find_map(|decoded| match decoded.instruction {
        X86Instruction::MovImm {
            register: loaded,
            value,
        } if loaded == register => Some(value),
        _ => None,
    })
}

fn encode_jump(from: usize, to: usize) -> Vec<u8> {
    let short = to as i64 - (from as i64 + 2);
    if let Ok(displacement) = i8::try_from(short) {
        return vec![0xEB, displacement as u8];
    }

    let near = (to as i64 - (from as i64 + 5)) as i32;
    let mut jump = vec![0xE9];
    jump.extend_from_slice(&near.to_le_bytes());
    jump
}
