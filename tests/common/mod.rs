//! A fake host and a fake JIT compiler for driving the hooks end to end.
#![allow(dead_code)]

use std::{
    collections::HashMap,
    ffi::c_void,
    ptr,
    sync::{
        atomic::{AtomicI32, AtomicU32, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use jitscope::{
    compile::{CompileMethodFn, ConstructStringLiteralFn, ResolveTokenFn},
    engine::{current_depth, HookSite},
    host::{
        ClassHandle, HostLayout, HostServices, HostVersion, InfoAccessType, MethodDescriptor,
        MethodHandle, ModuleHandle, ReturnShape, SignatureRequest, StringLiteral, Token,
        ValueShape,
    },
    vtable::VTable,
    Engine, EngineConfig, Result,
};
use widestring::U16Str;

pub const MODULE: ModuleHandle = ModuleHandle(0x2000);

/// Number of slots of the fake callback table
const INFO_SLOTS: usize = 200;

pub fn layout() -> HostLayout {
    *HostLayout::for_version(HostVersion::new(8, 0, 0)).unwrap()
}

pub fn engine(host: Arc<TestHost>) -> Arc<Engine> {
    let config = EngineConfig::default()
        .with_interceptor_threads(1)
        .with_native_patching(false);
    Engine::new(config, host).unwrap()
}

unsafe fn read<T: Copy>(base: *const u8, offset: usize) -> T {
    ptr::read_unaligned(base.add(offset) as *const T)
}

unsafe fn write<T: Copy>(base: *mut u8, offset: usize, value: T) {
    ptr::write_unaligned(base.add(offset) as *mut T, value);
}

// ------------------------------------------------------------------------------------------------
// Host services
// ------------------------------------------------------------------------------------------------

pub struct TestHost {
    methods: Mutex<HashMap<MethodHandle, MethodDescriptor>>,
    next_token: AtomicU32,
    strings: Mutex<Vec<String>>,
}

impl TestHost {
    pub fn new() -> Arc<Self> {
        Arc::new(TestHost {
            methods: Mutex::new(HashMap::new()),
            next_token: AtomicU32::new(1),
            strings: Mutex::new(Vec::new()),
        })
    }

    pub fn define(
        &self,
        handle: MethodHandle,
        declaring_type: &str,
        name: &str,
        parameters: Vec<ValueShape>,
        return_shape: ReturnShape,
    ) {
        self.methods.lock().unwrap().insert(
            handle,
            MethodDescriptor {
                handle,
                token: Token::new(0x0600_0000 | (handle.raw() as u32 & 0xFFFF)),
                module: MODULE,
                name: name.to_string(),
                declaring_type: declaring_type.to_string(),
                is_static: true,
                parameters,
                return_shape,
                generic_arguments: Vec::new(),
            },
        );
    }

    pub fn strings(&self) -> Vec<String> {
        self.strings.lock().unwrap().clone()
    }
}

impl HostServices for TestHost {
    fn runtime_version(&self) -> Option<HostVersion> {
        Some(HostVersion::new(8, 0, 4))
    }

    fn describe_method(&self, method: MethodHandle) -> Option<MethodDescriptor> {
        self.methods.lock().unwrap().get(&method).cloned()
    }

    fn signature_token(&self, _module: ModuleHandle, _request: &SignatureRequest) -> Result<Token> {
        Ok(Token::new(
            0x1100_0000 | self.next_token.fetch_add(1, Ordering::Relaxed),
        ))
    }

    fn completed_task_getter(&self, _module: ModuleHandle) -> Option<Token> {
        Some(Token::new(0x0A00_0100))
    }

    fn materialize_string(&self, _module: ModuleHandle, value: &U16Str) -> Option<StringLiteral> {
        self.strings.lock().unwrap().push(value.to_string_lossy());
        Some(StringLiteral {
            value: 0x7777_0000,
            access: InfoAccessType::PointerToValue,
        })
    }
}

// ------------------------------------------------------------------------------------------------
// Method info blocks
// ------------------------------------------------------------------------------------------------

/// A method info block owning its IL and instantiation arrays.
pub struct FakeMethodInfo {
    block: Vec<u64>,
    il: Vec<u8>,
    method_instantiation: Vec<usize>,
}

impl FakeMethodInfo {
    pub fn new(method: MethodHandle, il: Vec<u8>) -> Self {
        let layout = layout().method_info;
        let info = FakeMethodInfo {
            block: vec![0u64; layout.size() / 8 + 1],
            il,
            method_instantiation: Vec::new(),
        };
        let base = info.base();
        unsafe {
            write(base, layout.method, method.raw());
            write(base, layout.scope, MODULE.raw());
            write(base, layout.il_code, info.il.as_ptr() as usize);
            write(base, layout.il_code_size, info.il.len() as u32);
            write(base, layout.max_stack, 8u32);
        }
        info
    }

    pub fn with_options(self, options: u32) -> Self {
        unsafe { write(self.base(), layout().method_info.options, options) };
        self
    }

    pub fn with_method_instantiation(mut self, arguments: &[ClassHandle]) -> Self {
        self.method_instantiation = arguments.iter().map(ClassHandle::raw).collect();
        let layout = layout().method_info;
        let base = self.base();
        unsafe {
            write(base, layout.args + layout.sig.meth_inst_count, arguments.len() as u32);
            write(
                base,
                layout.args + layout.sig.meth_inst,
                self.method_instantiation.as_ptr() as usize,
            );
        }
        self
    }

    fn base(&self) -> *mut u8 {
        self.block.as_ptr() as *mut u8
    }

    pub fn as_ptr(&self) -> *mut c_void {
        self.base() as *mut c_void
    }

    /// The IL pointer and size currently in the block.
    pub fn il_fields(&self) -> (usize, u32) {
        let layout = layout().method_info;
        unsafe {
            (
                read(self.base(), layout.il_code),
                read(self.base(), layout.il_code_size),
            )
        }
    }

    pub fn original_il(&self) -> (usize, u32) {
        (self.il.as_ptr() as usize, self.il.len() as u32)
    }
}

// ------------------------------------------------------------------------------------------------
// The fake JIT
// ------------------------------------------------------------------------------------------------

/// One call the fake compiler received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileEvent {
    pub method: MethodHandle,
    pub il: Vec<u8>,
    pub depth: u32,
    pub entry: usize,
}

struct FakeJitState {
    next_entry: AtomicUsize,
    result: AtomicI32,
    events: Mutex<Vec<CompileEvent>>,
    /// compiling method -> (token, resolved target)
    references: Mutex<HashMap<MethodHandle, Vec<(Token, MethodHandle)>>>,
    /// compiling method -> literal tokens
    literals: Mutex<HashMap<MethodHandle, Vec<Token>>>,
    literal_values: Mutex<Vec<(usize, i32)>>,
    /// compiling method -> method compiled from inside its compilation
    nested: Mutex<HashMap<MethodHandle, MethodHandle>>,
    resolved: Mutex<Vec<MethodHandle>>,
}

/// The first two words of both fake interface objects.
#[repr(C)]
struct FakeInterface {
    vtable: usize,
    state: *const FakeJitState,
}

unsafe fn state<'a>(this: *mut c_void) -> &'a FakeJitState {
    &*(*(this as *const FakeInterface)).state
}

unsafe extern "system" fn fake_compile(
    this: *mut c_void,
    comp: *mut c_void,
    info: *mut c_void,
    flags: u32,
    entry: *mut *mut u8,
    size: *mut u32,
) -> i32 {
    let state = state(this);
    let layout = layout();
    let block = info as *const u8;
    let method = MethodHandle(read(block, layout.method_info.method));
    let il_code: usize = read(block, layout.method_info.il_code);
    let il_size: u32 = read(block, layout.method_info.il_code_size);
    let il = std::slice::from_raw_parts(il_code as *const u8, il_size as usize).to_vec();
    let depth = current_depth(HookSite::Compile);

    if !comp.is_null() {
        let callbacks = VTable::of_instance(comp);
        let references = state
            .references
            .lock()
            .unwrap()
            .get(&method)
            .cloned()
            .unwrap_or_default();
        for (token, _) in references {
            let tokens = layout.resolved_token;
            let mut resolved = vec![0u8; tokens.size];
            let raw = resolved.as_mut_ptr();
            write(raw, tokens.context, method.raw());
            write(raw, tokens.scope, MODULE.raw());
            write(raw, tokens.token, token.value());
            write(raw, tokens.token_type, 1u32);

            let resolve: ResolveTokenFn =
                std::mem::transmute(callbacks.read(layout.slots.resolve_token));
            resolve(comp, raw as *mut c_void);
        }

        let literals = state
            .literals
            .lock()
            .unwrap()
            .get(&method)
            .cloned()
            .unwrap_or_default();
        for token in literals {
            let construct: ConstructStringLiteralFn =
                std::mem::transmute(callbacks.read(layout.slots.construct_string_literal));
            let mut value: *mut c_void = ptr::null_mut();
            let access = construct(comp, MODULE.as_ptr(), token.value(), &mut value);
            state
                .literal_values
                .lock()
                .unwrap()
                .push((value as usize, access));
        }
    }

    let nested = state.nested.lock().unwrap().get(&method).copied();
    if let Some(inner) = nested {
        let inner_info = FakeMethodInfo::new(inner, vec![0x2A]);
        let hooked: CompileMethodFn = std::mem::transmute(VTable::of_instance(this).read(0));
        let mut inner_entry = ptr::null_mut();
        let mut inner_size = 0;
        hooked(this, comp, inner_info.as_ptr(), flags, &mut inner_entry, &mut inner_size);
    }

    let result = state.result.load(Ordering::Acquire);
    if result != 0 {
        return result;
    }

    let address = state.next_entry.fetch_add(0x100, Ordering::AcqRel);
    *entry = address as *mut u8;
    *size = il.len() as u32;
    state.events.lock().unwrap().push(CompileEvent {
        method,
        il,
        depth,
        entry: address,
    });
    0
}

unsafe extern "system" fn fake_resolve_token(this: *mut c_void, block: *mut c_void) {
    let state = state(this);
    let tokens = layout().resolved_token;
    let raw = block as *mut u8;
    let source = MethodHandle(read(raw, tokens.context));
    let token = Token::new(read(raw, tokens.token));

    let target = state
        .references
        .lock()
        .unwrap()
        .get(&source)
        .and_then(|references| references.iter().find(|(t, _)| *t == token).map(|(_, m)| *m));
    if let Some(target) = target {
        write(raw, tokens.method, target.raw());
        state.resolved.lock().unwrap().push(target);
    }
}

unsafe extern "system" fn fake_construct_string_literal(
    _this: *mut c_void,
    _module: *mut c_void,
    token: u32,
    value: *mut *mut c_void,
) -> i32 {
    *value = (0xAB00_0000 | (token as usize & 0xFFFF)) as *mut c_void;
    InfoAccessType::Value as i32
}

unsafe extern "system" fn unused_slot() {}

/// A fake compiler object and the callback object it compiles with.
pub struct FakeJit {
    state: Arc<FakeJitState>,
    compiler_table: Box<[usize]>,
    compiler: Box<FakeInterface>,
    info_table: Box<[usize]>,
    info: Box<FakeInterface>,
}

impl FakeJit {
    pub fn new() -> Self {
        let state = Arc::new(FakeJitState {
            next_entry: AtomicUsize::new(0x10_0000),
            result: AtomicI32::new(0),
            events: Mutex::new(Vec::new()),
            references: Mutex::new(HashMap::new()),
            literals: Mutex::new(HashMap::new()),
            literal_values: Mutex::new(Vec::new()),
            nested: Mutex::new(HashMap::new()),
            resolved: Mutex::new(Vec::new()),
        });
        let slots = layout().slots;

        let compiler_table = vec![
            fake_compile as CompileMethodFn as *const () as usize,
            unused_slot as *const () as usize,
        ]
        .into_boxed_slice();
        let mut info_table = vec![unused_slot as *const () as usize; INFO_SLOTS].into_boxed_slice();
        info_table[slots.resolve_token] = fake_resolve_token as ResolveTokenFn as *const () as usize;
        info_table[slots.construct_string_literal] =
            fake_construct_string_literal as ConstructStringLiteralFn as *const () as usize;

        let compiler = Box::new(FakeInterface {
            vtable: compiler_table.as_ptr() as usize,
            state: Arc::as_ptr(&state),
        });
        let info = Box::new(FakeInterface {
            vtable: info_table.as_ptr() as usize,
            state: Arc::as_ptr(&state),
        });

        FakeJit {
            state,
            compiler_table,
            compiler,
            info_table,
            info,
        }
    }

    pub fn compiler_vtable(&self) -> VTable {
        VTable::from_base(self.compiler_table.as_ptr() as usize)
    }

    pub fn info_vtable(&self) -> VTable {
        VTable::from_base(self.info_table.as_ptr() as usize)
    }

    pub fn original_compile() -> usize {
        fake_compile as CompileMethodFn as *const () as usize
    }

    pub fn compile_slot(&self) -> usize {
        unsafe { self.compiler_vtable().read(0) }
    }

    pub fn info_slot(&self, index: usize) -> usize {
        unsafe { self.info_vtable().read(index) }
    }

    /// Compiles through whatever the compile slot currently holds.
    pub fn compile(&self, info: &FakeMethodInfo) -> (i32, usize, u32) {
        let entry_point: CompileMethodFn = unsafe { std::mem::transmute(self.compile_slot()) };
        let mut entry = ptr::null_mut();
        let mut size = 0;
        let result = unsafe {
            entry_point(
                &*self.compiler as *const FakeInterface as *mut c_void,
                &*self.info as *const FakeInterface as *mut c_void,
                info.as_ptr(),
                0,
                &mut entry,
                &mut size,
            )
        };
        (result, entry as usize, size)
    }

    pub fn set_result(&self, result: i32) {
        self.state.result.store(result, Ordering::Release);
    }

    pub fn add_reference(&self, source: MethodHandle, token: Token, target: MethodHandle) {
        self.state
            .references
            .lock()
            .unwrap()
            .entry(source)
            .or_default()
            .push((token, target));
    }

    pub fn add_literal(&self, method: MethodHandle, token: Token) {
        self.state
            .literals
            .lock()
            .unwrap()
            .entry(method)
            .or_default()
            .push(token);
    }

    pub fn add_nested(&self, outer: MethodHandle, inner: MethodHandle) {
        self.state.nested.lock().unwrap().insert(outer, inner);
    }

    pub fn events(&self) -> Vec<CompileEvent> {
        self.state.events.lock().unwrap().clone()
    }

    pub fn literal_values(&self) -> Vec<(usize, i32)> {
        self.state.literal_values.lock().unwrap().clone()
    }

    pub fn resolved(&self) -> Vec<MethodHandle> {
        self.state.resolved.lock().unwrap().clone()
    }
}
