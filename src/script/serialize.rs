//! Transferring Lua values between Lua states.
//!
//! Ports `serialize.h`/`serialize.c`. The original walks the raw C API
//! (`lua_dump`/`lua_load`, `lua_getupvalue`/`lua_setupvalue`,
//! `lua_upvaluejoin`) to move a function's bytecode and upvalues from one
//! `lua_State` to another while keeping shared upvalues aliased. mlua's
//! safe surface doesn't expose those primitives directly, but Lua's own
//! `debug` library does the same job (`debug.getupvalue`,
//! `debug.setupvalue`, `debug.upvaluejoin`) — this module drives that
//! library instead of reaching for raw pointers. `upvaluejoin` in
//! particular is what makes upvalue sharing a real joined cell rather
//! than two independent copies of the same starting value: a later
//! reassignment through one deserialized function is then visible
//! through the other, not just a mutation of a shared table.
//!
//! Object identity (for the upvalue cache) is derived from `tostring(v)`
//! of the upvalue's *current value* rather than `debug.upvalueid`'s cell
//! address, which for tables/functions embeds the object's address
//! (`"table: 0x...`"`). Using the value's identity instead of the cell's
//! is what lets a collector table's id line up with the same id
//! `register_collector__` computed on the master side (also a
//! `tostring(table)`), since the two are never the same storage cell.

use std::collections::HashMap;

use mlua::{Lua, MultiValue, Table, Value};

use crate::error::ScriptError;

/// A serialized Lua value. Mirrors `struct l_object`. Tables are deep
/// copies of their entries; only upvalues carry the `id` that makes
/// aliasing possible (see [`UpvalueCache`]).
#[derive(Debug, Clone)]
pub enum SValue {
    Nil,
    Boolean(bool),
    Number(f64),
    Str(String),
    Function(Box<SFunction>),
    Table(Vec<(SValue, SValue)>),
}

/// A serialized Lua function: stripped bytecode plus its upvalues.
/// Mirrors the pairing of `dump_function_bytecode()` and the
/// `struct l_upvalue` list built around a hook in `script.c::store_hook`.
#[derive(Debug, Clone)]
pub struct SFunction {
    pub name: String,
    pub bytecode: Vec<u8>,
    pub upvalues: Vec<SUpvalue>,
}

/// One captured upvalue slot. `id` is the source object's identity string;
/// two upvalues with the same `id` must end up pointing at the same
/// deserialized value (mirrors `lua_upvalueid` equality in the original).
#[derive(Debug, Clone)]
pub struct SUpvalue {
    pub index: i32,
    pub id: String,
    pub value: SValue,
}

/// Remembers, per upvalue identity, the first `(function, slot)` pair that
/// materialized it on this slave. Mirrors `struct upvalue_cache` /
/// `upvalue_cache_new()`.
///
/// The second and later functions sharing that identity don't get their
/// own independent copy of the value — [`deserialize_function`] joins
/// their upvalue slot to this owner's via `debug.upvaluejoin`, so the two
/// functions end up sharing one storage cell exactly as the source
/// functions did (spec.md §4.4.2 "Upvalue sharing is restored by
/// joining"). This is also what lets a collector read back the *current*
/// value of an upvalue after a hook has reassigned it (spec.md §8
/// scenario 6): [`UpvalueCache::get_live`] reads live off the owner's
/// cell via `debug.getupvalue`, not a snapshot taken at materialization
/// time.
#[derive(Default)]
pub struct UpvalueCache {
    owner: HashMap<String, (mlua::RegistryKey, i32)>,
}

impl UpvalueCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the function/slot a given identity was first materialized
    /// into. A no-op if this identity already has an owner.
    fn remember_owner(&mut self, lua: &Lua, id: String, func: &mlua::Function, slot: i32) -> mlua::Result<()> {
        if self.owner.contains_key(&id) {
            return Ok(());
        }
        let key = lua.create_registry_value(func.clone())?;
        self.owner.insert(id, (key, slot));
        Ok(())
    }

    /// The `(function, slot)` that owns upvalue `id`'s storage cell, if
    /// any function on this slave has already materialized it.
    fn owner_function(&self, lua: &Lua, id: &str) -> mlua::Result<Option<(mlua::Function, i32)>> {
        match self.owner.get(id) {
            Some((key, slot)) => Ok(Some((lua.registry_value(key)?, *slot))),
            None => Ok(None),
        }
    }

    /// Fetches the *current* value of the upvalue identified by `id`, via
    /// `debug.getupvalue` on whichever function owns its cell — live, not
    /// a snapshot. Returns `None` if no upvalue with this identity was
    /// ever materialized on this slave.
    pub fn get_live(&self, lua: &Lua, id: &str) -> mlua::Result<Option<Value>> {
        let Some((key, slot)) = self.owner.get(id) else {
            return Ok(None);
        };
        let func: mlua::Function = lua.registry_value(key)?;
        let debug = debug_table(lua)?;
        let getupvalue: mlua::Function = debug.get("getupvalue")?;
        let result: MultiValue = getupvalue.call((func, *slot))?;
        Ok(result.into_iter().nth(1))
    }
}

fn debug_table(lua: &Lua) -> mlua::Result<Table> {
    lua.globals().get("debug")
}

/// Identity string for a table/function value, used as an upvalue cache
/// key. Primitives get a type-tagged value instead since they have no
/// stable address to key on (and don't need aliasing anyway).
fn identity(lua: &Lua, value: &Value) -> mlua::Result<String> {
    match value {
        Value::Table(_) | Value::Function(_) => {
            let tostring: mlua::Function = lua.globals().get("tostring")?;
            tostring.call(value.clone())
        }
        Value::Nil => Ok("nil".to_string()),
        Value::Boolean(b) => Ok(format!("boolean:{b}")),
        Value::Integer(i) => Ok(format!("integer:{i}")),
        Value::Number(n) => Ok(format!("number:{n}")),
        Value::String(s) => Ok(format!("string:{}", s.to_str()?)),
        other => Ok(format!("other:{other:?}")),
    }
}

pub fn serialize_value(lua: &Lua, value: Value) -> Result<SValue, ScriptError> {
    match value {
        Value::Nil => Ok(SValue::Nil),
        Value::Boolean(b) => Ok(SValue::Boolean(b)),
        Value::Integer(i) => Ok(SValue::Number(i as f64)),
        Value::Number(n) => Ok(SValue::Number(n)),
        Value::String(s) => Ok(SValue::Str(s.to_str()?.to_string())),
        Value::Function(f) => Ok(SValue::Function(Box::new(serialize_function(
            lua, "<anonymous>", &f,
        )?))),
        Value::Table(t) => {
            let mut entries = Vec::new();
            for pair in t.pairs::<Value, Value>() {
                let (k, v) = pair.map_err(ScriptError::from)?;
                let sk = serialize_value(lua, k)?;
                let sv = serialize_value(lua, v)?;
                entries.push((sk, sv));
            }
            Ok(SValue::Table(entries))
        }
        Value::LightUserData(_) => Ok(SValue::Nil),
        other => Err(ScriptError::UnsupportedType(type_name(&other))),
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::UserData(_) => "userdata",
        Value::LightUserData(_) => "lightuserdata",
        Value::Thread(_) => "thread",
        Value::Error(_) => "error",
        _ => "unknown",
    }
}

pub fn deserialize_value(
    lua: &Lua,
    cache: &mut UpvalueCache,
    sv: &SValue,
) -> Result<Value, ScriptError> {
    match sv {
        SValue::Nil => Ok(Value::Nil),
        SValue::Boolean(b) => Ok(Value::Boolean(*b)),
        SValue::Number(n) => Ok(Value::Number(*n)),
        SValue::Str(s) => Ok(Value::String(lua.create_string(s)?)),
        SValue::Function(sf) => Ok(Value::Function(deserialize_function(lua, cache, sf)?)),
        SValue::Table(entries) => {
            let t = lua.create_table()?;
            for (k, v) in entries {
                let key = deserialize_value(lua, cache, k)?;
                let val = deserialize_value(lua, cache, v)?;
                t.raw_set(key, val)?;
            }
            Ok(Value::Table(t))
        }
    }
}

/// Dumps a function's bytecode and walks its upvalues via `debug.*`.
/// Mirrors `serialize_function()` from `script.c` (called from
/// `store_hook` while the hook is still on top of the master's stack).
pub fn serialize_function(
    lua: &Lua,
    name: &str,
    func: &mlua::Function,
) -> Result<SFunction, ScriptError> {
    let bytecode = func.dump(true);
    let debug = debug_table(lua)?;
    let getupvalue: mlua::Function = debug.get("getupvalue")?;

    let mut upvalues = Vec::new();
    let mut i = 1i32;
    loop {
        let result: MultiValue = getupvalue.call((func.clone(), i))?;
        let mut it = result.into_iter();
        let Some(Value::String(_)) = it.next() else {
            break;
        };
        let value = it.next().unwrap_or(Value::Nil);
        // Identity is the upvalue's *current value*, not `debug.upvalueid`'s
        // cell address. This is what lets a collector table's id
        // (`register_collector__` keys on `tostring(table)`, also a value
        // identity) line up with the id an upvalue carrying that same
        // table gets here, so `UpvalueCache` can find it later even though
        // the two never share a `lua_upvalueid`-style cell.
        let id = identity(lua, &value)?;
        let sv = serialize_value(lua, value)?;
        upvalues.push(SUpvalue {
            index: i,
            id,
            value: sv,
        });
        i += 1;
    }

    Ok(SFunction {
        name: name.to_string(),
        bytecode,
        upvalues,
    })
}

/// Loads stripped bytecode into a new state. Mirrors
/// `load_function_bytecode()`.
pub fn load_function_bytecode(
    lua: &Lua,
    bytecode: &[u8],
    name: &str,
) -> mlua::Result<mlua::Function> {
    lua.load(bytecode.to_vec()).set_name(name).into_function()
}

/// Loads a function and rebinds each upvalue, consulting `cache` so
/// upvalues that shared identity on the source side share one storage
/// cell here too. Mirrors `deserialize_function()` + `set_shared_upvalue()`.
///
/// The first function to materialize a given upvalue identity gets a
/// freshly deserialized value via `debug.setupvalue` and becomes that
/// identity's owner; every later function sharing the identity is joined
/// to the owner's cell via `debug.upvaluejoin` instead of receiving an
/// independent copy — a write through either is then visible through the
/// other, matching spec.md §4.4.2.
pub fn deserialize_function(
    lua: &Lua,
    cache: &mut UpvalueCache,
    sf: &SFunction,
) -> Result<mlua::Function, ScriptError> {
    let func = load_function_bytecode(lua, &sf.bytecode, &sf.name)?;
    let debug = debug_table(lua)?;
    let setupvalue: mlua::Function = debug.get("setupvalue")?;
    let upvaluejoin: mlua::Function = debug.get("upvaluejoin")?;

    for uv in &sf.upvalues {
        match cache.owner_function(lua, &uv.id)? {
            Some((owner_func, owner_slot)) => {
                upvaluejoin.call::<()>((func.clone(), uv.index, owner_func, owner_slot))?;
            }
            None => {
                let value = deserialize_value(lua, cache, &uv.value)?;
                setupvalue.call::<()>((func.clone(), uv.index, value))?;
                cache.remember_owner(lua, uv.id.clone(), &func, uv.index)?;
            }
        }
    }

    Ok(func)
}
