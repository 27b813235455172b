//! Minimal x86-64 instruction decoder.
//!
//! The patcher only has to walk freshly generated code one instruction at a time and
//! recognize three shapes: constant loads into registers, calls, and unconditional jumps.
//! Every other instruction is decoded for its length only. The decoder understands legacy
//! prefixes, REX, VEX and EVEX encodings, the one-, two- and three-byte opcode maps, ModRM,
//! SIB, displacements and immediates, which covers what a JIT emits.
//!
//! # Example
//!
//! ```rust
//! use jitscope::patch::x86::{decode, X86Instruction, X86Register};
//!
//! // mov rcx, 0x1122334455667788
//! let code = [0x48, 0xB9, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11];
//! let decoded = decode(&code, 0, 0x1000)?;
//! assert_eq!(decoded.length, 10);
//! assert_eq!(
//!     decoded.instruction,
//!     X86Instruction::MovImm { register: X86Register::Rcx, value: 0x1122_3344_5566_7788 }
//! );
//! # Ok::<(), jitscope::Error>(())
//! ```

use crate::{Parser, Result};

/// 64-bit general purpose register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum X86Register {
    /// RAX
    Rax,
    /// RCX
    Rcx,
    /// RDX
    Rdx,
    /// RBX
    Rbx,
    /// RSP
    Rsp,
    /// RBP
    Rbp,
    /// RSI
    Rsi,
    /// RDI
    Rdi,
    /// R8
    R8,
    /// R9
    R9,
    /// R10
    R10,
    /// R11
    R11,
    /// R12
    R12,
    /// R13
    R13,
    /// R14
    R14,
    /// R15
    R15,
}

impl X86Register {
    /// The register with hardware number `index` (0-15).
    #[must_use]
    pub fn from_index(index: u8) -> Option<Self> {
        const REGISTERS: [X86Register; 16] = [
            X86Register::Rax,
            X86Register::Rcx,
            X86Register::Rdx,
            X86Register::Rbx,
            X86Register::Rsp,
            X86Register::Rbp,
            X86Register::Rsi,
            X86Register::Rdi,
            X86Register::R8,
            X86Register::R9,
            X86Register::R10,
            X86Register::R11,
            X86Register::R12,
            X86Register::R13,
            X86Register::R14,
            X86Register::R15,
        ];
        REGISTERS.get(index as usize).copied()
    }
}

/// Where a call goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallTarget {
    /// `call rel32`, resolved to an absolute address
    Relative(u64),
    /// `call [rip+disp32]`, the absolute address of the memory cell
    RipIndirect(u64),
    /// `call reg`
    Register(X86Register),
    /// Any other memory operand
    Indirect,
}

/// The instruction shapes the patcher cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum X86Instruction {
    /// A constant loaded into a full register (`mov r64, imm64`, `mov r32, imm32`,
    /// `mov r/m64, simm32` with a register operand)
    MovImm {
        /// Destination
        register: X86Register,
        /// Value the register holds afterwards
        value: u64,
    },
    /// A call
    Call(CallTarget),
    /// An unconditional relative jump, resolved to an absolute address
    Jmp(u64),
    /// `ret`
    Ret,
    /// Anything else
    Other,
}

/// An instruction with its position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedInstruction {
    /// Offset of the first byte in the decoded buffer
    pub offset: usize,
    /// Length in bytes
    pub length: usize,
    /// The instruction
    pub instruction: X86Instruction,
}

impl DecodedInstruction {
    /// Offset of the next instruction.
    #[must_use]
    pub fn end(&self) -> usize {
        self.offset + self.length
    }
}

#[derive(Clone, Copy)]
enum Immediate {
    None,
    Byte,
    Word,
    /// 2 or 4 bytes depending on the operand size prefix
    Z,
    /// 2, 4 or 8 bytes (`mov r, imm`)
    V,
    /// `enter`: imm16 + imm8
    Enter,
    /// `mov al, moffs`: address sized
    Offset,
}

#[derive(Clone, Copy)]
struct Operands {
    modrm: bool,
    immediate: Immediate,
}

const fn ops(modrm: bool, immediate: Immediate) -> Operands {
    Operands { modrm, immediate }
}

fn one_byte(opcode: u8) -> Option<Operands> {
    let operands = match opcode {
        // ALU blocks: r/m,r / r,r/m / al,imm8 / eax,imm
        0x00..=0x3F => match opcode & 0x07 {
            0..=3 => ops(true, Immediate::None),
            4 => ops(false, Immediate::Byte),
            5 => ops(false, Immediate::Z),
            _ => return None,
        },
        0x50..=0x5F => ops(false, Immediate::None),
        0x63 => ops(true, Immediate::None),
        0x68 => ops(false, Immediate::Z),
        0x69 => ops(true, Immediate::Z),
        0x6A => ops(false, Immediate::Byte),
        0x6B => ops(true, Immediate::Byte),
        0x6C..=0x6F => ops(false, Immediate::None),
        0x70..=0x7F => ops(false, Immediate::Byte),
        0x80 | 0x83 => ops(true, Immediate::Byte),
        0x81 => ops(true, Immediate::Z),
        0x84..=0x8F => ops(true, Immediate::None),
        0x90..=0x99 | 0x9B..=0x9F => ops(false, Immediate::None),
        0xA0..=0xA3 => ops(false, Immediate::Offset),
        0xA4..=0xA7 | 0xAA..=0xAF => ops(false, Immediate::None),
        0xA8 => ops(false, Immediate::Byte),
        0xA9 => ops(false, Immediate::Z),
        0xB0..=0xB7 => ops(false, Immediate::Byte),
        0xB8..=0xBF => ops(false, Immediate::V),
        0xC0 | 0xC1 | 0xC6 => ops(true, Immediate::Byte),
        0xC2 | 0xCA => ops(false, Immediate::Word),
        0xC3 | 0xC9 | 0xCB | 0xCC | 0xCF => ops(false, Immediate::None),
        0xC7 => ops(true, Immediate::Z),
        0xC8 => ops(false, Immediate::Enter),
        0xCD => ops(false, Immediate::Byte),
        0xD0..=0xD3 | 0xD8..=0xDF => ops(true, Immediate::None),
        0xD7 => ops(false, Immediate::None),
        0xE0..=0xE7 | 0xEB => ops(false, Immediate::Byte),
        0xE8 | 0xE9 => ops(false, Immediate::Z),
        0xEC..=0xEF | 0xF1 | 0xF4 | 0xF5 | 0xF8..=0xFD => ops(false, Immediate::None),
        // F6/F7 immediates depend on ModRM.reg, handled by the caller
        0xF6 | 0xF7 | 0xFE | 0xFF => ops(true, Immediate::None),
        _ => return None,
    };
    Some(operands)
}

fn two_byte(opcode: u8) -> Operands {
    match opcode {
        0x05..=0x09 | 0x0B | 0x0E | 0x30..=0x37 | 0x77 | 0xA0..=0xA2 | 0xA8..=0xAA => {
            ops(false, Immediate::None)
        }
        0xC8..=0xCF => ops(false, Immediate::None),
        0x80..=0x8F => ops(false, Immediate::Z),
        0x0F | 0x70..=0x73 | 0xA4 | 0xAC | 0xBA | 0xC2 | 0xC4..=0xC6 => ops(true, Immediate::Byte),
        _ => ops(true, Immediate::None),
    }
}

/// Opcode maps reachable through escapes and VEX/EVEX prefixes.
#[derive(Clone, Copy, PartialEq, Eq)]
enum OpcodeMap {
    Primary,
    Secondary,
    Map0F38,
    Map0F3A,
}

fn operands_in(map: OpcodeMap, opcode: u8) -> Option<Operands> {
    match map {
        OpcodeMap::Primary => one_byte(opcode),
        OpcodeMap::Secondary => Some(two_byte(opcode)),
        OpcodeMap::Map0F38 => Some(ops(true, Immediate::None)),
        OpcodeMap::Map0F3A => Some(ops(true, Immediate::Byte)),
    }
}

fn byte(parser: &mut Parser<'_>, start: usize) -> Result<u8> {
    parser
        .read_le::<u8>()
        .map_err(|_| decode_error!(start, "truncated instruction"))
}

fn skip(parser: &mut Parser<'_>, start: usize, count: usize) -> Result<()> {
    parser
        .advance_by(count)
        .map_err(|_| decode_error!(start, "truncated instruction"))
}

/// Decodes the instruction at `offset` of `code`, which is mapped at `base`.
///
/// # Errors
/// Returns [`crate::Error::Decode`] for invalid or truncated instructions.
pub fn decode(code: &[u8], offset: usize, base: u64) -> Result<DecodedInstruction> {
    let mut parser = Parser::new(code);
    parser
        .seek(offset)
        .map_err(|_| decode_error!(offset, "offset outside of code"))?;

    let mut operand_size_override = false;
    let mut address_size_override = false;
    let mut rex = 0u8;

    let mut opcode = loop {
        let value = byte(&mut parser, offset)?;
        match value {
            0x66 => operand_size_override = true,
            0x67 => address_size_override = true,
            0xF0 | 0xF2 | 0xF3 | 0x2E | 0x36 | 0x3E | 0x26 | 0x64 | 0x65 => {}
            _ => break value,
        }
    };

    if (0x40..=0x4F).contains(&opcode) {
        rex = opcode;
        opcode = byte(&mut parser, offset)?;
    }
    let rex_w = rex & 0x08 != 0;
    let rex_b = (rex & 0x01) << 3;

    let mut map = OpcodeMap::Primary;
    match opcode {
        0x0F => {
            opcode = byte(&mut parser, offset)?;
            map = OpcodeMap::Secondary;
            if opcode == 0x38 {
                opcode = byte(&mut parser, offset)?;
                map = OpcodeMap::Map0F38;
            } else if opcode == 0x3A {
                opcode = byte(&mut parser, offset)?;
                map = OpcodeMap::Map0F3A;
            }
        }
        0xC5 => {
            skip(&mut parser, offset, 1)?;
            opcode = byte(&mut parser, offset)?;
            map = OpcodeMap::Secondary;
        }
        0xC4 | 0x62 => {
            let selector = byte(&mut parser, offset)?;
            skip(&mut parser, offset, if opcode == 0x62 { 2 } else { 1 })?;
            map = match selector & if opcode == 0x62 { 0x03 } else { 0x1F } {
                1 => OpcodeMap::Secondary,
                2 => OpcodeMap::Map0F38,
                3 => OpcodeMap::Map0F3A,
                _ => return Err(decode_error!(offset, "unsupported opcode map")),
            };
            opcode = byte(&mut parser, offset)?;
        }
        _ => {}
    }

    let operands = operands_in(map, opcode)
        .ok_or_else(|| decode_error!(offset, "invalid opcode 0x{:02x}", opcode))?;

    let mut modrm = None;
    let mut displacement = 0i64;
    if operands.modrm {
        let value = byte(&mut parser, offset)?;
        let mode = value >> 6;
        let rm = value & 0x07;
        if mode != 3 && rm == 4 {
            let sib = byte(&mut parser, offset)?;
            if mode == 0 && sib & 0x07 == 5 {
                displacement = i64::from(read::<i32>(&mut parser, offset)?);
            }
        }
        match mode {
            0 if rm == 5 => displacement = i64::from(read::<i32>(&mut parser, offset)?),
            1 => displacement = i64::from(read::<i8>(&mut parser, offset)?),
            2 => displacement = i64::from(read::<i32>(&mut parser, offset)?),
            _ => {}
        }
        modrm = Some(value);
    }

    let reg_field = modrm.map(|value| (value >> 3) & 0x07);
    let word_or_dword = if operand_size_override { 2 } else { 4 };
    let mut immediate = 0u64;
    match operands.immediate {
        Immediate::None => {
            if map == OpcodeMap::Primary && matches!(reg_field, Some(0 | 1)) {
                if opcode == 0xF6 {
                    immediate = u64::from(read::<u8>(&mut parser, offset)?);
                } else if opcode == 0xF7 {
                    skip(&mut parser, offset, word_or_dword)?;
                }
            }
        }
        Immediate::Byte => immediate = read::<i8>(&mut parser, offset)? as i64 as u64,
        Immediate::Word => skip(&mut parser, offset, 2)?,
        Immediate::Enter => skip(&mut parser, offset, 3)?,
        Immediate::Offset => skip(&mut parser, offset, if address_size_override { 4 } else { 8 })?,
        Immediate::Z => {
            immediate = if operand_size_override {
                read::<i16>(&mut parser, offset)? as i64 as u64
            } else {
                read::<i32>(&mut parser, offset)? as i64 as u64
            }
        }
        Immediate::V => {
            immediate = if rex_w {
                read::<u64>(&mut parser, offset)?
            } else if operand_size_override {
                u64::from(read::<u16>(&mut parser, offset)?)
            } else {
                u64::from(read::<u32>(&mut parser, offset)?)
            }
        }
    }

    let end = parser.pos();
    let next = base.wrapping_add(end as u64);
    let instruction = match (map, opcode) {
        (OpcodeMap::Primary, 0xB8..=0xBF) if !operand_size_override => X86Register::from_index((opcode - 0xB8) | rex_b)
            .map_or(X86Instruction::Other, |register| X86Instruction::MovImm {
                register,
                value: immediate,
            }),
        (OpcodeMap::Primary, 0xC7) if rex_w && modrm.is_some_and(|value| value >> 6 == 3 && (value >> 3) & 0x07 == 0) => {
            let rm = modrm.map_or(0, |value| value & 0x07);
            X86Register::from_index(rm | rex_b).map_or(X86Instruction::Other, |register| {
                X86Instruction::MovImm {
                    register,
                    value: immediate,
                }
            })
        }
        (OpcodeMap::Primary, 0xE8) => {
            X86Instruction::Call(CallTarget::Relative(next.wrapping_add(immediate)))
        }
        (OpcodeMap::Primary, 0xE9 | 0xEB) => X86Instruction::Jmp(next.wrapping_add(immediate)),
        (OpcodeMap::Primary, 0xC3) => X86Instruction::Ret,
        (OpcodeMap::Primary, 0xFF) if reg_field == Some(2) => {
            let value = modrm.unwrap_or_default();
            let target = match (value >> 6, value & 0x07) {
                (3, rm) => X86Register::from_index(rm | rex_b)
                    .map_or(CallTarget::Indirect, CallTarget::Register),
                (0, 5) => CallTarget::RipIndirect(next.wrapping_add(displacement as u64)),
                _ => CallTarget::Indirect,
            };
            X86Instruction::Call(target)
        }
        _ => X86Instruction::Other,
    };

    Ok(DecodedInstruction {
        offset,
        length: end - offset,
        instruction,
    })
}

fn read<T: crate::utils::CodeIO>(parser: &mut Parser<'_>, start: usize) -> Result<T> {
    parser
        .read_le::<T>()
        .map_err(|_| decode_error!(start, "truncated instruction"))
}

/// Decodes `code` linearly until its end or the first undecodable byte.
///
/// # Errors
/// Returns the error of the first instruction that fails to decode.
pub fn decode_all(code: &[u8], base: u64) -> Result<Vec<DecodedInstruction>> {
    let mut instructions = Vec::new();
    let mut offset = 0;
    while offset < code.len() {
        let decoded = decode(code, offset, base)?;
        offset = decoded.end();
        instructions.push(decoded);
    }
    Ok(instructions)
}
