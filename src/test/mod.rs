use std::{
    collections::HashMap,
    ffi::c_void,
    sync::Mutex,
};

use widestring::U16Str;

use crate::{
    host::{
        ClassHandle, HostServices, HostVersion, InfoAccessType, MethodDescriptor, MethodHandle,
        ModuleHandle, ReturnShape, SignatureRequest, StringLiteral, Token, ValueShape,
    },
    vtable::VTable,
    Result,
};

// Helper function to create a method descriptor in module 0x2000
pub fn create_descriptor(
    handle: MethodHandle,
    declaring_type: &str,
    name: &str,
    is_static: bool,
    parameters: Vec<ValueShape>,
    return_shape: ReturnShape,
) -> MethodDescriptor {
    MethodDescriptor {
        handle,
        token: Token::new(0x0600_0000 | (handle.raw() as u32 & 0xFFFF)),
        module: ModuleHandle(0x2000),
        name: name.to_string(),
        declaring_type: declaring_type.to_string(),
        is_static,
        parameters,
        return_shape,
        generic_arguments: Vec::new(),
    }
}

/// In-memory host: descriptors and answers are whatever the test defined.
pub struct FakeHost {
    version: Mutex<Option<HostVersion>>,
    methods: Mutex<HashMap<MethodHandle, MethodDescriptor>>,
    classes: Mutex<HashMap<MethodHandle, ClassHandle>>,
    access_targets: Mutex<HashMap<MethodHandle, Vec<u64>>>,
    requests: Mutex<Vec<SignatureRequest>>,
    completed_getter: Mutex<Option<Token>>,
    placeholder: Mutex<Option<ClassHandle>>,
    strings: Mutex<Vec<Vec<u16>>>,
}

impl FakeHost {
    pub fn new() -> Self {
        FakeHost {
            version: Mutex::new(Some(HostVersion::new(8, 0, 0))),
            methods: Mutex::new(HashMap::new()),
            classes: Mutex::new(HashMap::new()),
            access_targets: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            completed_getter: Mutex::new(None),
            placeholder: Mutex::new(None),
            strings: Mutex::new(Vec::new()),
        }
    }

    pub fn set_version(&self, version: Option<HostVersion>) {
        *self.version.lock().unwrap() = version;
    }

    pub fn define(&self, descriptor: MethodDescriptor) {
        self.methods
            .lock()
            .unwrap()
            .insert(descriptor.handle, descriptor);
    }

    pub fn define_static(&self, handle: MethodHandle, declaring_type: &str, name: &str) {
        self.define(create_descriptor(
            handle,
            declaring_type,
            name,
            true,
            Vec::new(),
            ReturnShape::Void,
        ));
    }

    pub fn set_declaring_class(&self, method: MethodHandle, class: ClassHandle) {
        self.classes.lock().unwrap().insert(method, class);
    }

    pub fn set_access_check_targets(&self, method: MethodHandle, targets: Vec<u64>) {
        self.access_targets.lock().unwrap().insert(method, targets);
    }

    pub fn set_completed_task_getter(&self, token: Token) {
        *self.completed_getter.lock().unwrap() = Some(token);
    }

    pub fn set_canonical_placeholder(&self, class: ClassHandle) {
        *self.placeholder.lock().unwrap() = Some(class);
    }

    pub fn signature_requests(&self) -> Vec<SignatureRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn materialized_strings(&self) -> Vec<String> {
        self.strings
            .lock()
            .unwrap()
            .iter()
            .map(|value| String::from_utf16_lossy(value))
            .collect()
    }
}

impl HostServices for FakeHost {
    fn runtime_version(&self) -> Option<HostVersion> {
        *self.version.lock().unwrap()
    }

    fn describe_method(&self, method: MethodHandle) -> Option<MethodDescriptor> {
        self.methods.lock().unwrap().get(&method).cloned()
    }

    fn signature_token(&self, _module: ModuleHandle, request: &SignatureRequest) -> Result<Token> {
        let mut requests = self.requests.lock().unwrap();
        requests.push(request.clone());
        Ok(Token::new(0x1100_0000 + requests.len() as u32))
    }

    fn completed_task_getter(&self, _module: ModuleHandle) -> Option<Token> {
        *self.completed_getter.lock().unwrap()
    }

    fn canonical_placeholder(&self) -> Option<ClassHandle> {
        *self.placeholder.lock().unwrap()
    }

    fn declaring_class(&self, method: MethodHandle) -> Option<ClassHandle> {
        self.classes.lock().unwrap().get(&method).copied()
    }

    fn access_check_targets(&self, method: MethodHandle) -> Vec<u64> {
        self.access_targets
            .lock()
            .unwrap()
            .get(&method)
            .cloned()
            .unwrap_or_default()
    }

    fn materialize_string(&self, _module: ModuleHandle, value: &U16Str) -> Option<StringLiteral> {
        let mut strings = self.strings.lock().unwrap();
        strings.push(value.as_slice().to_vec());
        Some(StringLiteral {
            value: 0x5000_0000 + strings.len(),
            access: InfoAccessType::Value,
        })
    }
}

/// A heap object whose first word points at a function pointer table.
pub struct FakeObject {
    table: Box<[usize]>,
    object: Box<usize>,
}

impl FakeObject {
    pub fn new(slots: Vec<usize>) -> Self {
        let mut table = slots.into_boxed_slice();
        let object = Box::new(table.as_mut_ptr() as usize);
        FakeObject { table, object }
    }

    pub fn this(&self) -> *mut c_void {
        &*self.object as *const usize as *mut c_void
    }

    pub fn vtable(&self) -> VTable {
        VTable::from_base(self.table.as_ptr() as usize)
    }

    pub fn slot(&self, index: usize) -> usize {
        unsafe { self.vtable().read(index) }
    }
}
