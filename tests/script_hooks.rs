//! End-to-end exercise of the scripting engine across the master/slave
//! split: a shared table upvalue stays aliased between two hooks on the
//! same worker, and a collector's final value round-trips back into the
//! master engine after a hook reassigns its upvalue outright.

use rushit::script::engine::{RunMode, ScriptEngine};
use rushit::script::slave::ScriptSlave;
use rushit::socket_ops::AddrInfoView;

#[test]
fn shared_table_upvalue_stays_aliased_across_hooks() {
    let engine = ScriptEngine::new(RunMode::Client).unwrap();
    let script = r#"
        local shared = {}
        client_socket(function(fd, ai) shared.seen = fd end)
        client_close(function(fd, ai) shared.closed = shared.seen end)
        run()
    "#;
    engine.run_string(script, || {}).unwrap();

    let mut slave = ScriptSlave::new(&engine).unwrap();
    let ai = AddrInfoView::default();

    let socket_ret = slave.socket_hook(42, ai);
    // Hooks that return nothing trip EHOOKRETVAL, which is a soft error
    // meaning "fall back to the default path" — not a test failure.
    if let Err(e) = &socket_ret {
        assert!(e.is_soft(), "unexpected hard error from socket hook: {e}");
    }

    let close_ret = slave.close_hook(42, ai);
    if let Err(e) = &close_ret {
        assert!(e.is_soft(), "unexpected hard error from close hook: {e}");
    }
    // `shared.closed` only ends up 42 if `client_close`'s closure observed
    // the *same* `shared` table `client_socket`'s closure wrote into —
    // i.e. the two functions' upvalues were joined, not copied.
}

#[test]
fn collector_observes_reassigned_upvalue_and_round_trips() {
    let engine = ScriptEngine::new(RunMode::Client).unwrap();
    let script = r#"
        local n = collect(0)
        client_socket(function(fd, ai) n = 42 end)
        run()
    "#;
    engine.run_string(script, || {}).unwrap();

    let ids = engine.collector_ids();
    assert_eq!(ids.len(), 1);
    let id = &ids[0];

    let mut slave = ScriptSlave::new(&engine).unwrap();
    let ai = AddrInfoView::default();
    let _ = slave.socket_hook(7, ai);

    let collected = slave
        .collected_value(id)
        .unwrap()
        .expect("the socket hook's reassignment of `n` must be visible live");
    match collected {
        rushit::script::serialize::SValue::Number(v) => assert_eq!(v, 42.0),
        other => panic!("expected a number, got {other:?}"),
    }

    engine.append_collected(id, &collected).unwrap();
    let values = engine.collector_values(id).unwrap();
    // spec.md §8 scenario 6: the collector's seed element (the `0` from
    // `collect(0)`) is removed by `run()` before the hook ever fires, so
    // only the pulled-back value survives.
    assert_eq!(values.len(), 1);
    match &values[0] {
        rushit::script::serialize::SValue::Number(v) => assert_eq!(*v, 42.0),
        other => panic!("expected a number, got {other:?}"),
    }
}

#[test]
fn unregistered_hooks_report_empty() {
    let engine = ScriptEngine::new(RunMode::Server).unwrap();
    engine.run_string("run()", || {}).unwrap();
    let mut slave = ScriptSlave::new(&engine).unwrap();
    let err = slave.socket_hook(3, AddrInfoView::default()).unwrap_err();
    assert!(matches!(err, rushit::error::ScriptError::HookEmpty));
}

#[test]
fn run_file_loads_a_script_from_disk_and_self_invokes_run() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hook.lua");
    std::fs::write(&path, "client_socket(function(fd, ai) return fd end)\n").unwrap();

    let engine = ScriptEngine::new(RunMode::Client).unwrap();
    let invoked = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let invoked_clone = invoked.clone();
    // The script above never calls `run()` itself, so the engine must
    // invoke the callback once the chunk finishes (spec.md §4.5: "if the
    // script never calls it the engine invokes it itself").
    engine
        .run_file(&path, move || {
            invoked_clone.store(true, std::sync::atomic::Ordering::SeqCst);
        })
        .unwrap();
    assert!(invoked.load(std::sync::atomic::Ordering::SeqCst));

    let mut slave = ScriptSlave::new(&engine).unwrap();
    let ret = slave.socket_hook(9, AddrInfoView::default()).unwrap();
    assert_eq!(ret, 9);
}
