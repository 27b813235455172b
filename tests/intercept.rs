mod common;

use std::{
    ffi::c_void,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use common::{engine, FakeJit, FakeMethodInfo, TestHost};
use jitscope::{
    host::{ClassHandle, MethodHandle, MethodInfoOptions, ReturnShape, ValueShape},
    intercept::{call_manager_entry, InterceptFuture},
    prelude::*,
};

const SUM: MethodHandle = MethodHandle(0x1000);
const SUM_IL: [u8; 4] = [0x02, 0x03, 0x58, 0x2A];

/// The real implementation the shim would continue to
fn sum(a: i32, b: i32) -> i32 {
    a + b
}

fn intercepted(options: u32) -> (FakeJit, Arc<Engine>) {
    let jit = FakeJit::new();
    let host = TestHost::new();
    host.define(
        SUM,
        "App.Calculator",
        "Sum",
        vec![ValueShape::I4, ValueShape::I4],
        ReturnShape::Value(ValueShape::I4),
    );
    let engine = engine(host);
    engine.add_resolver(Arc::new(|context: &mut MethodContext| -> Result<()> {
        if context.is("App.Calculator", "Sum") {
            context.intercept_calls()?;
        }
        Ok(())
    }));
    unsafe { engine.install(jit.compiler_vtable()) }.unwrap();

    let info = FakeMethodInfo::new(SUM, SUM_IL.to_vec()).with_options(options);
    let (result, _, _) = jit.compile(&info);
    assert_eq!(result, 0);
    assert_eq!(info.il_fields(), info.original_il());
    (jit, engine)
}

/// Plays the shim: hands the arguments to the call manager and runs the real
/// implementation if it may proceed.
fn call_through_shim(
    engine: &Engine,
    a: i32,
    b: i32,
    original_runs: &AtomicUsize,
) -> (i32, i32, i32) {
    let record = engine.intercept_table().record(SUM).unwrap();
    let mut first = a;
    let mut second = b;
    let mut ret = 0i32;
    let args = [
        &mut first as *mut i32 as *mut c_void,
        &mut second as *mut i32 as *mut c_void,
    ];

    let proceed = unsafe {
        call_manager_entry(
            record.address(),
            args.as_ptr(),
            2,
            &mut ret as *mut i32 as *mut c_void,
            0,
        )
    };
    if proceed == 1 {
        original_runs.fetch_add(1, Ordering::SeqCst);
        ret = sum(first, second);
    }
    (first, second, ret)
}

#[test]
fn shim_replaces_the_published_entry() {
    let (jit, engine) = intercepted(0);

    let events = jit.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].il, SUM_IL.to_vec());
    let shim = &events[1].il;
    assert_eq!(shim.last(), Some(&0x2A));
    assert!(shim.contains(&0x29));

    let record = engine.intercept_table().record(SUM).unwrap();
    assert_eq!(record.secondary(), events[0].entry);
    assert_eq!(record.primary(), events[1].entry);
    assert_eq!(engine.compiled(SUM).map(|compiled| compiled.entry), Some(events[1].entry));
    assert!(!record.shape().generic_context);

    unsafe { engine.uninstall() }.unwrap();
}

#[test]
fn interceptor_rewrites_arguments() {
    let (_jit, engine) = intercepted(0);
    engine.add_interceptor(Arc::new(
        FnInterceptor::new(|call: &mut CallContext| {
            let a: i32 = call.get_parameter(0)?;
            let b: i32 = call.get_parameter(1)?;
            call.set_parameter(0, a + b)
        })
        .for_method(SUM),
    ));

    let runs = AtomicUsize::new(0);
    assert_eq!(call_through_shim(&engine, 2, 5, &runs), (7, 5, 12));
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    unsafe { engine.uninstall() }.unwrap();
}

#[test]
fn interceptor_skips_the_original() {
    let (_jit, engine) = intercepted(0);
    engine.add_interceptor(Arc::new(FnInterceptor::new(|call: &mut CallContext| {
        call.set_return_value(11i32)?;
        call.skip_original();
        Ok(())
    })));
    let after_skip = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&after_skip);
    engine.add_interceptor(Arc::new(FnInterceptor::new(move |_: &mut CallContext| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })));

    let runs = AtomicUsize::new(0);
    let (_, _, ret) = call_through_shim(&engine, 2, 5, &runs);
    assert_eq!(ret, 11);
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert_eq!(after_skip.load(Ordering::SeqCst), 0);

    unsafe { engine.uninstall() }.unwrap();
}

struct Recording {
    seen: Arc<Mutex<Vec<i32>>>,
}

impl CallInterceptor for Recording {
    fn intercept<'a>(&'a self, call: &'a mut CallContext) -> InterceptFuture<'a> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            let value: i32 = call.get_parameter(0)?;
            self.seen.lock().unwrap().push(value);
            Ok::<(), Error>(())
        })
    }
}

#[test]
fn interceptors_run_in_order_and_may_suspend() {
    let (_jit, engine) = intercepted(0);
    let seen = Arc::new(Mutex::new(Vec::new()));
    engine.add_interceptor(Arc::new(Recording {
        seen: Arc::clone(&seen),
    }));
    engine.add_interceptor(Arc::new(FnInterceptor::new(|call: &mut CallContext| {
        let value: i32 = call.get_parameter(0)?;
        call.set_parameter(0, value * 10)
    })));
    engine.add_interceptor(Arc::new(Recording {
        seen: Arc::clone(&seen),
    }));
    engine.add_interceptor(Arc::new(FnInterceptor::new(|_: &mut CallContext| {
        Err(Error::Interceptor("ignored".to_string()))
    })));

    let runs = AtomicUsize::new(0);
    assert_eq!(call_through_shim(&engine, 3, 1, &runs), (30, 1, 31));
    assert_eq!(*seen.lock().unwrap(), vec![3, 30]);

    unsafe { engine.uninstall() }.unwrap();
}

#[test]
fn disabled_records_proceed_without_interceptors() {
    let (_jit, engine) = intercepted(0);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    engine.add_interceptor(Arc::new(FnInterceptor::new(move |call: &mut CallContext| {
        counter.fetch_add(1, Ordering::SeqCst);
        call.skip_original();
        Ok(())
    })));

    let table = engine.intercept_table();
    table.disable(SUM).unwrap();
    let runs = AtomicUsize::new(0);
    assert_eq!(call_through_shim(&engine, 1, 2, &runs).2, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    table.enable(SUM).unwrap();
    assert_eq!(call_through_shim(&engine, 1, 2, &runs).2, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    assert!(matches!(
        table.disable(MethodHandle(0x7777)),
        Err(Error::NotIntercepted(_))
    ));

    unsafe { engine.uninstall() }.unwrap();
}

#[test]
fn shared_code_gets_the_instantiation_argument() {
    let (jit, engine) = intercepted(MethodInfoOptions::GENERICS_CONTEXT_FROM_METHOD_DESC.bits());

    assert_eq!(jit.events().len(), 2);
    let record = engine.intercept_table().record(SUM).unwrap();
    assert!(record.shape().generic_context);

    unsafe { engine.uninstall() }.unwrap();
}

#[test]
fn unknown_declaring_class_keeps_the_real_entry() {
    let jit = FakeJit::new();
    let host = TestHost::new();
    host.define(SUM, "App.Calculator", "Sum", Vec::new(), ReturnShape::Void);
    let engine = engine(host);
    engine.add_resolver(Arc::new(|context: &mut MethodContext| -> Result<()> {
        context.intercept_calls()
    }));
    unsafe { engine.install(jit.compiler_vtable()) }.unwrap();

    let info = FakeMethodInfo::new(SUM, vec![0x2A])
        .with_options(MethodInfoOptions::GENERICS_CONTEXT_FROM_METHOD_TABLE.bits())
        .with_method_instantiation(&[ClassHandle(0x44)]);
    let (result, entry, _) = jit.compile(&info);

    assert_eq!(result, 0);
    assert_eq!(jit.events().len(), 1);
    assert_eq!(entry, jit.events()[0].entry);
    assert!(engine.intercept_table().record(SUM).is_none());

    unsafe { engine.uninstall() }.unwrap();
}

#[test]
fn instantiation_is_recorded() {
    let jit = FakeJit::new();
    let host = TestHost::new();
    host.define(SUM, "App.Box", "Get", Vec::new(), ReturnShape::Value(ValueShape::I8));
    let engine = engine(host);
    engine.add_resolver(Arc::new(|context: &mut MethodContext| -> Result<()> {
        context.intercept_calls()
    }));
    unsafe { engine.install(jit.compiler_vtable()) }.unwrap();

    let info = FakeMethodInfo::new(SUM, vec![0x16, 0x6A, 0x2A])
        .with_method_instantiation(&[ClassHandle(0x44)]);
    jit.compile(&info);

    let record = engine.intercept_table().record(SUM).unwrap();
    assert_eq!(record.generic_arguments(), &[ClassHandle(0x44)]);

    unsafe { engine.uninstall() }.unwrap();
}

#[test]
fn undescribed_functions_compile_normally() {
    let jit = FakeJit::new();
    let engine = engine(TestHost::new());
    engine.add_resolver(Arc::new(|context: &mut MethodContext| -> Result<()> {
        context.intercept_calls()
    }));
    unsafe { engine.install(jit.compiler_vtable()) }.unwrap();

    let (result, entry, _) = jit.compile(&FakeMethodInfo::new(SUM, SUM_IL.to_vec()));
    assert_eq!(result, 0);
    assert_eq!(jit.events().len(), 1);
    assert_eq!(entry, jit.events()[0].entry);

    unsafe { engine.uninstall() }.unwrap();
}
