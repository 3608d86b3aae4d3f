mod common;

use abi_bridge::hooks::trampoline::TrampolineArena;
use abi_bridge::hooks::HookTableBuilder;
use core::ffi::{c_char, CStr};
use rstest::rstest;
use std::sync::Mutex;

#[rstest]
fn table_resolves_registered_names() {
    common::init_logging();
    let mut builder = HookTableBuilder::empty();
    builder.hook("open", 0x1000).hook("close", 0x2000);
    let table = builder.build();
    assert_eq!(table.lookup("open"), Some(0x1000));
    assert_eq!(table.lookup("close"), Some(0x2000));
    assert_eq!(table.lookup("read"), None);
    assert_eq!(table.len(), 2);
}

#[rstest]
fn later_registration_replaces_earlier() {
    let mut builder = HookTableBuilder::empty();
    builder.hook("open", 0x1000).hook("open", 0x3000);
    let table = builder.build();
    assert_eq!(table.lookup("open"), Some(0x3000));
    assert_eq!(table.len(), 1);
}

fn claim_everything_odd(name: &str) -> Option<usize> {
    (name.len() % 2 == 1).then_some(0xCAFE)
}

#[rstest]
fn callback_wins_over_table_entries() {
    let mut builder = HookTableBuilder::empty();
    builder.hook("abc", 0x1000).hook("abcd", 0x2000);
    builder.callback(claim_everything_odd);
    let table = builder.build();
    assert_eq!(table.lookup("abc"), Some(0xCAFE));
    assert_eq!(table.lookup("abcd"), Some(0x2000));
    // The callback can claim names the table never registered.
    assert_eq!(table.lookup("xyz"), Some(0xCAFE));
}

#[rstest]
fn tracing_toggle_selects_traced_variant() {
    let mut builder = HookTableBuilder::empty();
    builder.hook_traced("open", 0x1000, 0x1100);
    builder.hook("close", 0x2000);
    let table = builder.build();

    assert_eq!(table.lookup("open"), Some(0x1000));
    table.set_tracing(true);
    assert_eq!(table.lookup("open"), Some(0x1100));
    // Entries without a traced variant keep their direct one.
    assert_eq!(table.lookup("close"), Some(0x2000));
    table.set_tracing(false);
    assert_eq!(table.lookup("open"), Some(0x1000));
}

#[rstest]
fn base_hooks_cover_the_runtime_minimum() {
    let table = HookTableBuilder::with_base_hooks().build();
    for name in [
        "property_get",
        "property_set",
        "__system_property_get",
        "printf",
        "getenv",
        "setenv",
        "__cxa_atexit",
        "__cxa_finalize",
        "__get_tls_hooks",
    ] {
        assert!(table.lookup(name).is_some(), "missing base hook {name}");
    }
}

static TRACE_LOG: Mutex<Vec<(String, usize, usize)>> = Mutex::new(Vec::new());

unsafe extern "C" fn recording_tracer(name: *const c_char, regs: *const usize, target: usize) {
    let name = unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned();
    let first_arg = unsafe { regs.read() };
    TRACE_LOG.lock().unwrap().push((name, first_arg, target));
}

extern "C" fn add_one(x: usize) -> usize {
    x + 1
}

#[cfg(unix)]
#[rstest]
fn trampoline_traces_and_forwards() {
    let arena = TrampolineArena::new();
    let entry = arena
        .create("add_one", add_one as usize, recording_tracer)
        .unwrap();

    let f: extern "C" fn(usize) -> usize = unsafe { core::mem::transmute(entry) };
    assert_eq!(f(41), 42);

    // The log is shared with concurrently running tests, so match on the
    // argument as well.
    let log = TRACE_LOG.lock().unwrap();
    let (_, _, target) = log
        .iter()
        .find(|(name, first_arg, _)| name == "add_one" && *first_arg == 41)
        .unwrap();
    assert_eq!(*target, add_one as usize);
}

unsafe extern "C" fn quiet_tracer(_name: *const c_char, _regs: *const usize, _target: usize) {}

#[cfg(unix)]
#[rstest]
fn published_trampolines_survive_later_instantiation() {
    let arena = TrampolineArena::new();
    let first = arena
        .create("add_one_live", add_one as usize, quiet_tracer)
        .unwrap();
    let f: extern "C" fn(usize) -> usize = unsafe { core::mem::transmute(first) };

    // Keep calling the published trampoline while more are instantiated on
    // the same page.
    std::thread::scope(|s| {
        let caller = s.spawn(|| {
            for i in 0..5000usize {
                assert_eq!(f(i), i + 1);
            }
        });
        for _ in 0..16 {
            arena
                .create("filler", add_one as usize, quiet_tracer)
                .unwrap();
        }
        caller.join().unwrap();
    });
}

#[cfg(unix)]
#[rstest]
fn trampolines_share_pages_and_stay_distinct() {
    let arena = TrampolineArena::new();
    let first = arena
        .create("add_one", add_one as usize, recording_tracer)
        .unwrap();
    let second = arena
        .create("add_one_again", add_one as usize, recording_tracer)
        .unwrap();
    assert_ne!(first, second);

    let f: extern "C" fn(usize) -> usize = unsafe { core::mem::transmute(first) };
    let g: extern "C" fn(usize) -> usize = unsafe { core::mem::transmute(second) };
    assert_eq!(f(1), 2);
    assert_eq!(g(10), 11);

    let log = TRACE_LOG.lock().unwrap();
    let names: Vec<_> = log.iter().map(|(name, ..)| name.as_str()).collect();
    assert!(names.contains(&"add_one"));
    assert!(names.contains(&"add_one_again"));
}
