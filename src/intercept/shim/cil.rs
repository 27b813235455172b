use std::{collections::HashMap, sync::Arc};

use crate::{
    compile::{LocalsSignature, MethodBody},
    host::{HostServices, ModuleHandle, ReturnShape, SignatureRequest, Token, ValueShape},
    intercept::shim::{opcodes::*, ShimEmitter, ShimLabel, ShimOp, ShimProgram},
    utils::{write_compressed_uint, write_le_at},
    Error, Result,
};

const LOCAL_SIG: u8 = 0x07;
const ELEMENT_TYPE_VALUETYPE: u8 = 0x11;

/// Label of the null check inside a completed marker.
const MARKER_DONE: ShimLabel = ShimLabel(u16::MAX);

fn element_type(shape: ValueShape, blob: &mut Vec<u8>) -> Result<()> {
    let element = match shape {
        ValueShape::Boolean => 0x02,
        ValueShape::Char => 0x03,
        ValueShape::I1 => 0x04,
        ValueShape::U1 => 0x05,
        ValueShape::I2 => 0x06,
        ValueShape::U2 => 0x07,
        ValueShape::I4 => 0x08,
        ValueShape::U4 => 0x09,
        ValueShape::I8 => 0x0A,
        ValueShape::U8 => 0x0B,
        ValueShape::R4 => 0x0C,
        ValueShape::R8 => 0x0D,
        // Returned managed pointers live in the slot as plain addresses
        ValueShape::NativeInt | ValueShape::ByRef => 0x18,
        ValueShape::NativeUInt => 0x19,
        ValueShape::ObjectRef => 0x1C,
        ValueShape::Struct { token, .. } => {
            let coded = token.type_def_or_ref_coded().ok_or_else(|| {
                Error::Shim(format!("{token} cannot be used as a local type"))
            })?;
            blob.push(ELEMENT_TYPE_VALUETYPE);
            return write_compressed_uint(coded, blob);
        }
    };
    blob.push(element);
    Ok(())
}

/// Local variable indices of a shim.
#[derive(Debug, Clone, Copy)]
struct Locals {
    arguments: Option<u16>,
    result: Option<u16>,
}

impl Locals {
    fn of(program: &ShimProgram) -> Self {
        let arguments = (!program.shape.parameters.is_empty()).then_some(0);
        let result = program
            .shape
            .returns_value()
            .then_some(u16::from(arguments.is_some()));
        Locals { arguments, result }
    }

    fn count(&self) -> u16 {
        u16::from(self.arguments.is_some()) + u16::from(self.result.is_some())
    }

    fn blob(&self, program: &ShimProgram) -> Result<Vec<u8>> {
        let mut blob = vec![LOCAL_SIG];
        write_compressed_uint(u32::from(self.count()), &mut blob)?;
        if self.arguments.is_some() {
            element_type(ValueShape::NativeInt, &mut blob)?;
        }
        match program.shape.return_shape {
            ReturnShape::Void => {}
            ReturnShape::Value(shape) => element_type(shape, &mut blob)?,
            ReturnShape::Task => element_type(ValueShape::ObjectRef, &mut blob)?,
        }
        Ok(blob)
    }
}

/// Byte-level CIL writer with short-form selection, label fixups and stack tracking.
struct Encoder {
    code: Vec<u8>,
    depth: u32,
    max_depth: u32,
    labels: HashMap<ShimLabel, usize>,
    fixups: Vec<(usize, ShimLabel)>,
    branch_depths: HashMap<ShimLabel, u32>,
}

impl Encoder {
    fn new() -> Self {
        Encoder {
            code: Vec::with_capacity(128),
            depth: 0,
            max_depth: 0,
            labels: HashMap::new(),
            fixups: Vec::new(),
            branch_depths: HashMap::new(),
        }
    }

    fn stack(&mut self, pop: u32, push: u32) -> Result<()> {
        self.depth = self.depth.checked_sub(pop).ok_or_else(|| {
            Error::Shim(format!(
                "stack underflow at IL_{:04x}: {} values, {} popped",
                self.code.len(),
                self.depth,
                pop
            ))
        })?;
        self.depth += push;
        self.max_depth = self.max_depth.max(self.depth);
        Ok(())
    }

    fn op(&mut self, opcode: u8, pop: u32, push: u32) -> Result<()> {
        self.code.push(opcode);
        self.stack(pop, push)
    }

    fn op_fe(&mut self, opcode: u8, pop: u32, push: u32) -> Result<()> {
        self.code.extend_from_slice(&[FE_PREFIX, opcode]);
        self.stack(pop, push)
    }

    fn with_token(&mut self, opcode: u8, token: Token, pop: u32, push: u32) -> Result<()> {
        self.op(opcode, pop, push)?;
        self.code.extend_from_slice(&token.value().to_le_bytes());
        Ok(())
    }

    /// `short`, `short.s` or the two-byte long form, depending on `index`.
    fn indexed(&mut self, index: u16, short: [u8; 4], short_s: u8, long: u8, pop: u32, push: u32) -> Result<()> {
        match index {
            0..=3 => self.op(short[usize::from(index)], pop, push),
            #[allow(clippy::cast_possible_truncation)]
            4..=255 => {
                self.op(short_s, pop, push)?;
                self.code.push(index as u8);
                Ok(())
            }
            _ => {
                self.op_fe(long, pop, push)?;
                self.code.extend_from_slice(&index.to_le_bytes());
                Ok(())
            }
        }
    }

    fn ldarg(&mut self, index: u16) -> Result<()> {
        self.indexed(index, [LDARG_0, LDARG_1, LDARG_2, LDARG_3], LDARG_S, FE_LDARG, 0, 1)
    }

    fn ldloc(&mut self, index: u16) -> Result<()> {
        self.indexed(index, [LDLOC_0, LDLOC_1, LDLOC_2, LDLOC_3], LDLOC_S, FE_LDLOC, 0, 1)
    }

    fn stloc(&mut self, index: u16) -> Result<()> {
        self.indexed(index, [STLOC_0, STLOC_1, STLOC_2, STLOC_3], STLOC_S, FE_STLOC, 1, 0)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn ldarga(&mut self, index: u16) -> Result<()> {
        if index <= 255 {
            self.op(LDARGA_S, 0, 1)?;
            self.code.push(index as u8);
            Ok(())
        } else {
            self.op_fe(FE_LDARGA, 0, 1)?;
            self.code.extend_from_slice(&index.to_le_bytes());
            Ok(())
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn ldloca(&mut self, index: u16) -> Result<()> {
        if index <= 255 {
            self.op(LDLOCA_S, 0, 1)?;
            self.code.push(index as u8);
            Ok(())
        } else {
            self.op_fe(FE_LDLOCA, 0, 1)?;
            self.code.extend_from_slice(&index.to_le_bytes());
            Ok(())
        }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn ldc_i4(&mut self, value: i32) -> Result<()> {
        match value {
            -1..=8 => self.op((i32::from(LDC_I4_0) + value) as u8, 0, 1),
            -128..=127 => {
                self.op(LDC_I4_S, 0, 1)?;
                self.code.push(value as i8 as u8);
                Ok(())
            }
            _ => {
                self.op(LDC_I4, 0, 1)?;
                self.code.extend_from_slice(&value.to_le_bytes());
                Ok(())
            }
        }
    }

    /// Pushes a native int constant.
    fn native(&mut self, value: u64) -> Result<()> {
        match i32::try_from(value) {
            Ok(small) => self.ldc_i4(small)?,
            Err(_) => {
                self.op(LDC_I8, 0, 1)?;
                self.code.extend_from_slice(&value.to_le_bytes());
            }
        }
        self.op(CONV_I, 1, 1)
    }

    fn branch(&mut self, opcode: u8, label: ShimLabel) -> Result<()> {
        self.op(opcode, 1, 0)?;
        self.fixups.push((self.code.len(), label));
        self.code.extend_from_slice(&[0; 4]);

        match self.branch_depths.insert(label, self.depth) {
            Some(depth) if depth != self.depth => Err(Error::Shim(format!(
                "stack depth mismatch on branches to {label:?}: {depth} and {}",
                self.depth
            ))),
            _ => Ok(()),
        }
    }

    fn mark(&mut self, label: ShimLabel) -> Result<()> {
        if self.labels.contains_key(&label) {
            return Err(Error::Shim(format!("{label:?} is bound twice")));
        }
        if let Some(&expected) = self.branch_depths.get(&label) {
            if expected != self.depth {
                return Err(Error::Shim(format!(
                    "stack depth mismatch at {label:?}: expected {expected}, got {}",
                    self.depth
                )));
            }
        }
        self.labels.insert(label, self.code.len());
        Ok(())
    }

    fn finish(mut self) -> Result<(Vec<u8>, u32)> {
        for (position, label) in std::mem::take(&mut self.fixups) {
            let target = *self
                .labels
                .get(&label)
                .ok_or_else(|| Error::Shim(format!("{label:?} is never bound")))?;
            #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
            let relative = target as i32 - (position + 4) as i32;
            let mut offset = position;
            write_le_at(&mut self.code, &mut offset, relative)?;
        }
        if self.depth != 0 {
            return Err(Error::Shim(format!("{} values left on the stack", self.depth)));
        }
        Ok((self.code, self.max_depth))
    }
}

/// Encodes shims as CIL.
///
/// Arguments are exposed through a `localloc`ed array of `conv.u`-converted argument
/// addresses; both calls go through `calli` with stand-alone signatures the host creates.
///
/// ```text
/// ldc.i4   n * size_of::<usize>()
/// conv.u
/// localloc
/// stloc.0                    // argument address array
/// ldloc.0 / ldc.i4 8 / add / ldarga.s 1 / conv.u / stind.i
/// ...
/// ldc.i8   <record>  conv.i
/// ldloc.0 / ldc.i4 n / ldloca.s 1 conv.u / ldc.i4.0 conv.i
/// ldc.i8   <manager> conv.i
/// calli    unmanaged cdecl int32(...)
/// brfalse  EXIT
/// ldarg.0 ... ldarg.n
/// ldc.i8   <real> conv.i
/// calli    <real signature>
/// stloc.1
/// EXIT: ldloc.1
/// ret
/// ```
pub struct CilShimEmitter {
    host: Arc<dyn HostServices>,
    pointer_size: u16,
}

impl CilShimEmitter {
    /// An emitter for pointers of the running process.
    #[must_use]
    pub fn new(host: Arc<dyn HostServices>) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let pointer_size = std::mem::size_of::<usize>() as u16;
        CilShimEmitter { host, pointer_size }
    }

    fn signature(&self, module: ModuleHandle, request: &SignatureRequest) -> Result<Token> {
        self.host
            .signature_token(module, request)
            .map_err(|error| Error::Shim(format!("no signature token for {request:?}: {error}")))
    }

    fn lower(
        &self,
        encoder: &mut Encoder,
        program: &ShimProgram,
        locals: Locals,
        module: ModuleHandle,
        op: ShimOp,
    ) -> Result<()> {
        let arguments = || {
            locals
                .arguments
                .ok_or_else(|| Error::Shim("argument array used without parameters".to_string()))
        };
        let result = || {
            locals
                .result
                .ok_or_else(|| Error::Shim("return slot used in a void shim".to_string()))
        };

        match op {
            ShimOp::AllocateArgumentArray { count } => {
                encoder.ldc_i4(i32::from(count) * i32::from(self.pointer_size))?;
                encoder.op(CONV_U, 1, 1)?;
                encoder.op_fe(FE_LOCALLOC, 1, 1)?;
                encoder.stloc(arguments()?)
            }
            ShimOp::StoreArgumentAddress { argument, slot } => {
                encoder.ldloc(arguments()?)?;
                if slot > 0 {
                    encoder.ldc_i4(i32::from(slot) * i32::from(self.pointer_size))?;
                    encoder.op(ADD, 2, 1)?;
                }
                encoder.ldarga(argument)?;
                encoder.op(CONV_U, 1, 1)?;
                encoder.op(STIND_I, 2, 0)
            }
            ShimOp::LoadArgumentArray => encoder.ldloc(arguments()?),
            ShimOp::LoadConstant(value) => encoder.native(value),
            ShimOp::LoadInt32(value) => encoder.ldc_i4(value),
            ShimOp::LoadResultAddress => {
                encoder.ldloca(result()?)?;
                encoder.op(CONV_U, 1, 1)
            }
            ShimOp::LoadNull => {
                encoder.ldc_i4(0)?;
                encoder.op(CONV_I, 1, 1)
            }
            ShimOp::CallManager { target } => {
                let token = self.signature(module, &SignatureRequest::ManagerEntry)?;
                encoder.native(target)?;
                encoder.with_token(CALLI, token, 6, 1)
            }
            ShimOp::BranchIfFalse(label) => encoder.branch(BRFALSE, label),
            ShimOp::LoadArgument(index) => encoder.ldarg(index),
            ShimOp::CallReal { target } => {
                let shape = &program.shape;
                let token = self.signature(
                    module,
                    &SignatureRequest::RealCall {
                        method: program.method,
                        has_this: shape.has_this,
                        generic_context: program.generic_context.is_some(),
                        parameters: shape.declared_parameters().to_vec(),
                        return_shape: shape.return_shape,
                    },
                )?;
                #[allow(clippy::cast_possible_truncation)]
                let pop = program.real_argument_count() as u32 + 1;
                encoder.native(target)?;
                encoder.with_token(CALLI, token, pop, u32::from(shape.returns_value()))
            }
            ShimOp::StoreResult => encoder.stloc(result()?),
            ShimOp::Mark(label) => encoder.mark(label),
            ShimOp::LoadResult => encoder.ldloc(result()?),
            ShimOp::CompletedMarker => {
                let getter = self.host.completed_task_getter(module).ok_or_else(|| {
                    Error::Shim(format!("no completed task getter in {module}"))
                })?;
                encoder.op(DUP, 1, 2)?;
                encoder.branch(BRTRUE, MARKER_DONE)?;
                encoder.op(POP, 1, 0)?;
                encoder.with_token(CALL, getter, 0, 1)?;
                encoder.mark(MARKER_DONE)
            }
            ShimOp::Return => encoder.op(RET, u32::from(program.shape.returns_value()), 0),
        }
    }
}

impl ShimEmitter for CilShimEmitter {
    fn emit(&self, program: &ShimProgram, module: ModuleHandle) -> Result<MethodBody> {
        let locals = Locals::of(program);
        let mut encoder = Encoder::new();
        for op in &program.ops {
            self.lower(&mut encoder, program, locals, module, *op)?;
        }
        let (il, max_stack) = encoder.finish()?;

        let mut body = MethodBody::new(il).with_max_stack(max_stack);
        if locals.count() > 0 {
            let blob = locals.blob(program)?;
            let token = self.signature(module, &SignatureRequest::Locals { blob: blob.clone() })?;
            body = body.with_locals(LocalsSignature::new(token, blob, locals.count()));
        }
        Ok(body)
    }
}
