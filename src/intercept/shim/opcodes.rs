//! CIL opcode byte constants (ECMA-335) used by the shim emitter.
//!
//! Single-byte opcodes are named after their mnemonic. Two-byte opcodes that use the `0xFE`
//! prefix have their second byte stored with an `FE_` prefix.
#![allow(missing_docs)]

// Arguments and locals
pub const LDARG_0: u8 = 0x02;
pub const LDARG_1: u8 = 0x03;
pub const LDARG_2: u8 = 0x04;
pub const LDARG_3: u8 = 0x05;
pub const LDLOC_0: u8 = 0x06;
pub const LDLOC_1: u8 = 0x07;
pub const LDLOC_2: u8 = 0x08;
pub const LDLOC_3: u8 = 0x09;
pub const STLOC_0: u8 = 0x0A;
pub const STLOC_1: u8 = 0x0B;
pub const STLOC_2: u8 = 0x0C;
pub const STLOC_3: u8 = 0x0D;
pub const LDARG_S: u8 = 0x0E;
pub const LDARGA_S: u8 = 0x0F;
pub const LDLOC_S: u8 = 0x11;
pub const LDLOCA_S: u8 = 0x12;
pub const STLOC_S: u8 = 0x13;

// Constants
pub const LDC_I4_0: u8 = 0x16;
pub const LDC_I4_S: u8 = 0x1F;
pub const LDC_I4: u8 = 0x20;
pub const LDC_I8: u8 = 0x21;

// Stack
pub const DUP: u8 = 0x25;
pub const POP: u8 = 0x26;

// Calls
pub const CALL: u8 = 0x28;
pub const CALLI: u8 = 0x29;
pub const RET: u8 = 0x2A;

// Branches
pub const BRFALSE: u8 = 0x39;
pub const BRTRUE: u8 = 0x3A;

// Arithmetic and conversion
pub const ADD: u8 = 0x58;
pub const CONV_I: u8 = 0xD3;
pub const STIND_I: u8 = 0xDF;
pub const CONV_U: u8 = 0xE0;

// Two-byte opcodes
pub const FE_PREFIX: u8 = 0xFE;
pub const FE_LDARG: u8 = 0x09;
pub const FE_LDARGA: u8 = 0x0A;
pub const FE_LDLOC: u8 = 0x0C;
pub const FE_LDLOCA: u8 = 0x0D;
pub const FE_STLOC: u8 = 0x0E;
pub const FE_LOCALLOC: u8 = 0x0F;
