mod common;

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Weak,
};

use common::{engine, FakeJit, FakeMethodInfo, TestHost};
use jitscope::{
    engine::InitPhase,
    host::{CorJitResult, MethodHandle, ReturnShape, Token, ValueShape},
    prelude::*,
};

const ADD: MethodHandle = MethodHandle(0x1000);
const HELPER: MethodHandle = MethodHandle(0x1100);

fn installed() -> (FakeJit, Arc<TestHost>, Arc<Engine>) {
    let jit = FakeJit::new();
    let host = TestHost::new();
    host.define(
        ADD,
        "App.Calculator",
        "Add",
        vec![ValueShape::I4, ValueShape::I4],
        ReturnShape::Value(ValueShape::I4),
    );
    let engine = engine(Arc::clone(&host));
    unsafe { engine.install(jit.compiler_vtable()) }.unwrap();
    (jit, host, engine)
}

#[test]
fn unselected_functions_compile_unchanged() {
    let reference = FakeJit::new();
    let info = FakeMethodInfo::new(ADD, vec![0x02, 0x03, 0x58, 0x2A]);
    let expected = reference.compile(&info);

    let (jit, _host, engine) = installed();
    engine.add_resolver(Arc::new(|_: &mut MethodContext| -> Result<()> { Ok(()) }));
    let info = FakeMethodInfo::new(ADD, vec![0x02, 0x03, 0x58, 0x2A]);
    let hooked = jit.compile(&info);

    assert_eq!(hooked, expected);
    assert_eq!(jit.events()[0].il, reference.events()[0].il);
    assert_eq!(info.il_fields(), info.original_il());
    assert_eq!(
        engine.compiled(ADD),
        Some(CompiledMethod {
            entry: hooked.1,
            size: hooked.2
        })
    );

    unsafe { engine.uninstall() }.unwrap();
}

#[test]
fn install_remove_round_trip() {
    let (jit, _host, engine) = installed();
    assert_ne!(jit.compile_slot(), FakeJit::original_compile());
    assert!(matches!(
        unsafe { engine.install(jit.compiler_vtable()) },
        Err(Error::AlreadyInstalled)
    ));

    let info = FakeMethodInfo::new(ADD, vec![0x2A]);
    jit.compile(&info);
    assert_eq!(engine.secondary_phase(), InitPhase::Active);
    let resolve_slot = common::layout().slots.resolve_token;
    let hooked_resolve = jit.info_slot(resolve_slot);

    unsafe { engine.uninstall() }.unwrap();
    assert_eq!(jit.compile_slot(), FakeJit::original_compile());
    assert_ne!(jit.info_slot(resolve_slot), hooked_resolve);
    assert_eq!(engine.secondary_phase(), InitPhase::Uninitialized);
    assert!(Engine::active().map_or(true, |active| !Arc::ptr_eq(&active, &engine)));

    // Unhooked compilation behaves as before
    let (result, _, size) = jit.compile(&FakeMethodInfo::new(ADD, vec![0x16, 0x2A]));
    assert_eq!(result, 0);
    assert_eq!(size, 2);
    assert!(matches!(unsafe { engine.uninstall() }, Err(Error::NotInstalled)));
}

#[test]
fn replacement_il_is_compiled_and_block_restored() {
    let (jit, _host, engine) = installed();
    engine.add_resolver(Arc::new(|context: &mut MethodContext| -> Result<()> {
        if context.is("App.Calculator", "Add") {
            context.resolve_il(MethodBody::new(vec![0x1F, 42, 0x2A]).with_max_stack(1))?;
        }
        Ok(())
    }));

    let info = FakeMethodInfo::new(ADD, vec![0x02, 0x03, 0x58, 0x2A]);
    let (result, _, size) = jit.compile(&info);

    assert_eq!(result, 0);
    assert_eq!(size, 3);
    assert_eq!(jit.events()[0].il, vec![0x1F, 42, 0x2A]);
    assert_eq!(info.il_fields(), info.original_il());

    unsafe { engine.uninstall() }.unwrap();
}

#[test]
fn entry_replacement_keeps_compiled_size() {
    let (jit, _host, engine) = installed();
    engine.add_resolver(Arc::new(|context: &mut MethodContext| -> Result<()> {
        context.resolve_entry(0xDEAD_0000, None)
    }));

    let (result, entry, size) = jit.compile(&FakeMethodInfo::new(ADD, vec![0x16, 0x2A]));
    assert_eq!(result, 0);
    assert_eq!(entry, 0xDEAD_0000);
    assert_eq!(size, 2);
    assert_eq!(engine.compiled(ADD).map(|compiled| compiled.entry), Some(0xDEAD_0000));

    unsafe { engine.uninstall() }.unwrap();
}

#[test]
fn failing_resolvers_leave_compilation_untouched() {
    let (jit, _host, engine) = installed();
    let failing = engine.add_resolver(Arc::new(|context: &mut MethodContext| -> Result<()> {
        context.resolve_entry(0xDEAD_0000, None)?;
        Err(Error::Error("resolver gave up".to_string()))
    }));

    let (result, entry, _) = jit.compile(&FakeMethodInfo::new(ADD, vec![0x2A]));
    assert_eq!(result, 0);
    assert_eq!(entry, jit.events()[0].entry);
    assert!(engine.remove_resolver(failing));

    let panicking = engine.add_resolver(Arc::new(|_: &mut MethodContext| -> Result<()> {
        panic!("resolver bug")
    }));
    let (result, entry, _) = jit.compile(&FakeMethodInfo::new(ADD, vec![0x2A]));
    assert_eq!(result, 0);
    assert_eq!(entry, jit.events()[1].entry);
    assert!(engine.remove_resolver(panicking));

    unsafe { engine.uninstall() }.unwrap();
}

#[test]
fn host_failures_pass_through() {
    let (jit, _host, engine) = installed();
    engine.add_resolver(Arc::new(|context: &mut MethodContext| -> Result<()> {
        context.resolve_native(vec![0xC3])
    }));
    jit.set_result(CorJitResult::BadCode as i32);

    let (result, entry, _) = jit.compile(&FakeMethodInfo::new(ADD, vec![0x2A]));
    assert_eq!(result, CorJitResult::BadCode as i32);
    assert_eq!(entry, 0);
    assert!(engine.compiled(ADD).is_none());
    assert_eq!(engine.context().region_count(), 0);

    unsafe { engine.uninstall() }.unwrap();
}

#[test]
fn nested_compilation_is_forwarded() {
    let (jit, _host, engine) = installed();
    jit.add_nested(ADD, HELPER);

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    engine.add_resolver(Arc::new(move |context: &mut MethodContext| -> Result<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        context.resolve_il(MethodBody::new(vec![0x17, 0x2A]))
    }));

    jit.compile(&FakeMethodInfo::new(ADD, vec![0x16, 0x2A]));

    let events = jit.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].method, HELPER);
    assert_eq!(events[0].depth, 2);
    assert_eq!(events[0].il, vec![0x2A]);
    assert_eq!(events[1].method, ADD);
    assert_eq!(events[1].depth, 1);
    assert_eq!(events[1].il, vec![0x17, 0x2A]);
    assert!(events.iter().all(|event| event.depth <= 2));
    assert_eq!(seen.load(Ordering::SeqCst), 1);

    unsafe { engine.uninstall() }.unwrap();
}

#[cfg(target_arch = "x86_64")]
#[test]
fn native_code_is_executed() {
    let (jit, _host, engine) = installed();
    engine.add_resolver(Arc::new(|context: &mut MethodContext| -> Result<()> {
        if context.is("App.Calculator", "Add") {
            // mov eax, 42; ret
            context.resolve_native(vec![0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3])?;
        }
        Ok(())
    }));

    let info = FakeMethodInfo::new(ADD, vec![0x02, 0x03, 0x58, 0x2A]);
    let (result, entry, size) = jit.compile(&info);
    assert_eq!(result, 0);
    assert_eq!(size, 6);
    assert_ne!(entry, jit.events()[0].entry);
    assert_eq!(engine.context().region_count(), 1);

    let add: extern "C" fn(i32, i32) -> i32 = unsafe { std::mem::transmute(entry) };
    assert_eq!(add(3, 4), 42);

    unsafe { engine.uninstall() }.unwrap();
}

#[test]
fn later_resolvers_see_undecided_contexts() {
    let (jit, _host, engine) = installed();
    let first_calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&first_calls);
    engine.add_resolver(Arc::new(move |_: &mut MethodContext| -> Result<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }));
    engine.add_resolver(Arc::new(|context: &mut MethodContext| -> Result<()> {
        context.resolve_il(MethodBody::new(vec![0x18, 0x2A]))
    }));
    let third_calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&third_calls);
    engine.add_resolver(Arc::new(move |context: &mut MethodContext| -> Result<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        context.resolve_il(MethodBody::new(vec![0x19, 0x2A]))
    }));

    jit.compile(&FakeMethodInfo::new(ADD, vec![0x16, 0x2A]));

    assert_eq!(jit.events()[0].il, vec![0x18, 0x2A]);
    assert_eq!(first_calls.load(Ordering::SeqCst), 1);
    assert_eq!(third_calls.load(Ordering::SeqCst), 0);

    unsafe { engine.uninstall() }.unwrap();
}

#[test]
fn references_map_back_to_their_source() {
    let (jit, _host, engine) = installed();
    jit.add_reference(ADD, Token::new(0x0A00_0007), HELPER);

    let sources = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen = Arc::clone(&sources);
    engine.add_resolver(Arc::new(move |context: &mut MethodContext| -> Result<()> {
        seen.lock().unwrap().push((context.method(), context.source()));
        Ok(())
    }));

    jit.compile(&FakeMethodInfo::new(ADD, vec![0x28, 0x07, 0x00, 0x00, 0x0A, 0x2A]));
    assert_eq!(jit.resolved(), vec![HELPER]);
    assert_eq!(engine.context().token_source(HELPER), Some(ADD));

    jit.compile(&FakeMethodInfo::new(HELPER, vec![0x2A]));
    assert_eq!(
        *sources.lock().unwrap(),
        vec![(ADD, None), (HELPER, Some(ADD))]
    );

    unsafe { engine.uninstall() }.unwrap();
}

#[test]
fn token_resolvers_override_results() {
    let (jit, _host, engine) = installed();
    jit.add_reference(ADD, Token::new(0x0A00_0007), HELPER);
    engine.add_token_resolver(Arc::new(|context: &mut TokenContext| -> Result<()> {
        if context.token() == Token::new(0x0A00_0007) {
            context.override_result(jitscope::compile::TokenOverride {
                method: Some(MethodHandle(0x9999)),
                ..Default::default()
            })?;
        }
        Ok(())
    }));

    jit.compile(&FakeMethodInfo::new(ADD, vec![0x2A]));
    // The host resolved the original target; the override applies after it
    assert_eq!(jit.resolved(), vec![HELPER]);
    assert_eq!(engine.context().token_source(MethodHandle(0x9999)), Some(ADD));
    assert_eq!(engine.context().token_source(HELPER), None);

    unsafe { engine.uninstall() }.unwrap();
}

#[test]
fn string_literals_can_be_replaced() {
    let (jit, host, engine) = installed();
    jit.add_literal(ADD, Token::new(0x7000_0001));
    jit.add_literal(ADD, Token::new(0x7000_0002));
    engine.add_string_resolver(Arc::new(|context: &mut StringContext| -> Result<()> {
        if context.token() == Token::new(0x7000_0002) {
            context.replace_str("patched")?;
        }
        Ok(())
    }));

    jit.compile(&FakeMethodInfo::new(ADD, vec![0x2A]));

    assert_eq!(
        jit.literal_values(),
        vec![(0xAB00_0001, 0), (0x7777_0000, 1)]
    );
    assert_eq!(host.strings(), vec!["patched".to_string()]);

    unsafe { engine.uninstall() }.unwrap();
}

/// Removes the engine on another thread and waits until removal has finished.
fn uninstall_elsewhere(engine: &Weak<Engine>, removed: &AtomicUsize) {
    let Some(engine) = engine.upgrade() else {
        return;
    };
    let outcome = std::thread::spawn(move || unsafe { engine.uninstall() }).join();
    if matches!(outcome, Ok(Ok(()))) {
        removed.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn uninstall_while_a_resolver_runs() {
    let (jit, _host, engine) = installed();
    let removed = Arc::new(AtomicUsize::new(0));
    let (weak, counter) = (Arc::downgrade(&engine), Arc::clone(&removed));
    engine.add_resolver(Arc::new(move |_: &mut MethodContext| -> Result<()> {
        uninstall_elsewhere(&weak, &counter);
        Ok(())
    }));

    let info = FakeMethodInfo::new(ADD, vec![0x02, 0x03, 0x58, 0x2A]);
    let (result, entry, size) = jit.compile(&info);

    assert_eq!(removed.load(Ordering::SeqCst), 1);
    assert_eq!(result, 0);
    assert_eq!(size, 4);
    assert_eq!(jit.events().len(), 1);
    assert_eq!(entry, jit.events()[0].entry);
    assert!(!engine.is_installed());
    assert_eq!(jit.compile_slot(), FakeJit::original_compile());

    let (result, _, size) = jit.compile(&FakeMethodInfo::new(ADD, vec![0x16, 0x2A]));
    assert_eq!(result, 0);
    assert_eq!(size, 2);
    assert_eq!(removed.load(Ordering::SeqCst), 1);
}

#[test]
fn uninstall_while_a_token_resolver_runs() {
    let (jit, _host, engine) = installed();
    jit.add_reference(ADD, Token::new(0x0A00_0007), HELPER);
    jit.compile(&FakeMethodInfo::new(HELPER, vec![0x2A]));
    let resolve_slot = common::layout().slots.resolve_token;
    let hooked_resolve = jit.info_slot(resolve_slot);

    let removed = Arc::new(AtomicUsize::new(0));
    let (weak, counter) = (Arc::downgrade(&engine), Arc::clone(&removed));
    engine.add_token_resolver(Arc::new(move |_: &mut TokenContext| -> Result<()> {
        uninstall_elsewhere(&weak, &counter);
        Ok(())
    }));

    let (result, _, _) = jit.compile(&FakeMethodInfo::new(ADD, vec![0x2A]));

    assert_eq!(removed.load(Ordering::SeqCst), 1);
    assert_eq!(result, 0);
    assert_eq!(jit.resolved(), vec![HELPER]);
    assert_eq!(engine.context().token_source(HELPER), Some(ADD));
    assert_ne!(jit.info_slot(resolve_slot), hooked_resolve);
    assert_eq!(jit.compile_slot(), FakeJit::original_compile());
}

#[test]
fn uninstall_while_a_string_resolver_runs() {
    let (jit, host, engine) = installed();
    jit.add_literal(ADD, Token::new(0x7000_0001));
    jit.compile(&FakeMethodInfo::new(HELPER, vec![0x2A]));
    let literal_slot = common::layout().slots.construct_string_literal;
    let hooked_literal = jit.info_slot(literal_slot);

    let removed = Arc::new(AtomicUsize::new(0));
    let (weak, counter) = (Arc::downgrade(&engine), Arc::clone(&removed));
    engine.add_string_resolver(Arc::new(move |_: &mut StringContext| -> Result<()> {
        uninstall_elsewhere(&weak, &counter);
        Ok(())
    }));

    let (result, _, _) = jit.compile(&FakeMethodInfo::new(ADD, vec![0x2A]));

    assert_eq!(removed.load(Ordering::SeqCst), 1);
    assert_eq!(result, 0);
    assert_eq!(jit.literal_values(), vec![(0xAB00_0001, 0)]);
    assert!(host.strings().is_empty());
    assert_ne!(jit.info_slot(literal_slot), hooked_literal);
    assert_eq!(jit.compile_slot(), FakeJit::original_compile());
}
