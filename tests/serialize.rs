//! Direct tests of the cross-`Lua`-state value/function serialization that
//! backs the scripting engine, independent of the hook machinery.

use mlua::Lua;

use rushit::script::serialize::{
    deserialize_function, deserialize_value, serialize_function, serialize_value, UpvalueCache,
};

#[test]
fn shared_upvalue_is_joined_not_copied() {
    let source = Lua::new();
    let dest = Lua::new();

    source
        .load(
            r#"
            local shared = { count = 0 }
            function inc() shared.count = shared.count + 1 end
            function peek() return shared.count end
            "#,
        )
        .exec()
        .unwrap();

    let inc: mlua::Function = source.globals().get("inc").unwrap();
    let peek: mlua::Function = source.globals().get("peek").unwrap();

    let s_inc = serialize_function(&source, "inc", &inc).unwrap();
    let s_peek = serialize_function(&source, "peek", &peek).unwrap();

    let mut cache = UpvalueCache::new();
    let d_inc = deserialize_function(&dest, &mut cache, &s_inc).unwrap();
    let d_peek = deserialize_function(&dest, &mut cache, &s_peek).unwrap();

    d_inc.call::<()>(()).unwrap();
    d_inc.call::<()>(()).unwrap();
    let count: i64 = d_peek.call(()).unwrap();
    assert_eq!(
        count, 2,
        "peek() must observe inc()'s writes through the joined upvalue"
    );
}

#[test]
fn reassigning_a_primitive_upvalue_is_visible_through_the_other_function() {
    let source = Lua::new();
    let dest = Lua::new();

    source
        .load(
            r#"
            local n = 0
            function set(v) n = v end
            function get() return n end
            "#,
        )
        .exec()
        .unwrap();

    let set: mlua::Function = source.globals().get("set").unwrap();
    let get: mlua::Function = source.globals().get("get").unwrap();

    let s_set = serialize_function(&source, "set", &set).unwrap();
    let s_get = serialize_function(&source, "get", &get).unwrap();

    let mut cache = UpvalueCache::new();
    let d_set = deserialize_function(&dest, &mut cache, &s_set).unwrap();
    let d_get = deserialize_function(&dest, &mut cache, &s_get).unwrap();

    d_set.call::<()>(99i64).unwrap();
    let v: i64 = d_get.call(()).unwrap();
    assert_eq!(v, 99, "whole-value reassignment, not just table mutation, must cross the join");
}

#[test]
fn table_value_round_trips() {
    let source = Lua::new();
    let dest = Lua::new();

    let table = source
        .load(
            r#"
            return { ok = true, count = 3, label = "hi", nested = { 1, 2 } }
            "#,
        )
        .eval::<mlua::Table>()
        .unwrap();

    let sv = serialize_value(&source, mlua::Value::Table(table)).unwrap();
    let mut cache = UpvalueCache::new();
    let value = deserialize_value(&dest, &mut cache, &sv).unwrap();

    let mlua::Value::Table(t) = value else {
        panic!("expected a table");
    };
    let ok: bool = t.get("ok").unwrap();
    let count: i64 = t.get("count").unwrap();
    let label: String = t.get("label").unwrap();
    assert!(ok);
    assert_eq!(count, 3);
    assert_eq!(label, "hi");
    let nested: mlua::Table = t.get("nested").unwrap();
    let n1: i64 = nested.get(1).unwrap();
    let n2: i64 = nested.get(2).unwrap();
    assert_eq!(n1, 1);
    assert_eq!(n2, 2);
}
