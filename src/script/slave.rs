//! Per-worker-thread script state.
//!
//! Ports `struct script_slave` / `script_slave_create` / the
//! `run_socket_hook`/`run_packet_hook`/`push_hook`/`load_hook` family from
//! `script.c`. Each worker thread owns one `ScriptSlave` with its own Lua
//! state; hooks are deserialized lazily, on first call, and cached after
//! that (mirrors `ss->hook_keys[hid]`).

use std::collections::HashMap;

use mlua::{Lua, Value};

use crate::error::ScriptError;
use crate::script::engine::{HookId, RunMode, ScriptEngine};
use crate::script::serialize::{deserialize_function, serialize_value, SFunction, UpvalueCache};
use crate::socket_ops::AddrInfoView;

const PRELUDE: &str = include_str!("prelude.lua");

pub struct ScriptSlave {
    lua: Lua,
    run_mode: RunMode,
    hooks: HashMap<HookId, SFunction>,
    loaded: HashMap<HookId, mlua::Function>,
    upvalues: UpvalueCache,
}

impl ScriptSlave {
    pub fn new(engine: &ScriptEngine) -> Result<Self, ScriptError> {
        let lua = Lua::new();
        lua.load(PRELUDE).set_name("script_prelude").exec()?;

        Ok(ScriptSlave {
            lua,
            run_mode: engine.run_mode(),
            hooks: engine.hooks_for_slave(),
            loaded: HashMap::new(),
            upvalues: UpvalueCache::new(),
        })
    }

    fn ensure_loaded(&mut self, hid: HookId) -> Result<Option<mlua::Function>, ScriptError> {
        if let Some(f) = self.loaded.get(&hid) {
            return Ok(Some(f.clone()));
        }
        let Some(sf) = self.hooks.get(&hid) else {
            return Ok(None);
        };
        let f = deserialize_function(&self.lua, &mut self.upvalues, sf)?;
        self.loaded.insert(hid, f.clone());
        Ok(Some(f))
    }

    fn addr_info_table(&self, ai: AddrInfoView) -> mlua::Result<mlua::Table> {
        let t = self.lua.create_table()?;
        if let Some(a) = ai.local {
            t.set("local", a.to_string())?;
        }
        if let Some(a) = ai.peer {
            t.set("peer", a.to_string())?;
        }
        Ok(t)
    }

    fn run_socket_hook(&mut self, hid: HookId, fd: i32, ai: AddrInfoView) -> Result<i32, ScriptError> {
        let Some(func) = self.ensure_loaded(hid)? else {
            return Err(ScriptError::HookEmpty);
        };
        let ai_table = self.addr_info_table(ai)?;
        let ret: Value = func.call((fd, ai_table))?;
        as_retval(ret)
    }

    fn run_packet_hook(
        &mut self,
        hid: HookId,
        fd: i32,
        len: usize,
        flags: i32,
    ) -> Result<i32, ScriptError> {
        let Some(func) = self.ensure_loaded(hid)? else {
            return Err(ScriptError::HookEmpty);
        };
        let ret: Value = func.call((fd, len as i64, flags))?;
        as_retval(ret)
    }

    pub fn socket_hook(&mut self, fd: i32, ai: AddrInfoView) -> Result<i32, ScriptError> {
        self.run_socket_hook(HookId::Socket, fd, ai)
    }

    pub fn close_hook(&mut self, fd: i32, ai: AddrInfoView) -> Result<i32, ScriptError> {
        self.run_socket_hook(HookId::Close, fd, ai)
    }

    pub fn sendmsg_hook(&mut self, fd: i32, len: usize, flags: i32) -> Result<i32, ScriptError> {
        self.run_packet_hook(HookId::Sendmsg, fd, len, flags)
    }

    pub fn recvmsg_hook(&mut self, fd: i32, len: usize, flags: i32) -> Result<i32, ScriptError> {
        self.run_packet_hook(HookId::Recvmsg, fd, len, flags)
    }

    pub fn recverr_hook(&mut self, fd: i32, len: usize, flags: i32) -> Result<i32, ScriptError> {
        self.run_packet_hook(HookId::Recverr, fd, len, flags)
    }

    pub fn run_mode(&self) -> RunMode {
        self.run_mode
    }

    /// Serializes whatever this slave's collector upvalue currently holds
    /// for `collector_id`, for the engine to fold into the master-side
    /// collector table. Mirrors `get_collected_value()`. Reads the *live*
    /// value via `debug.getupvalue` rather than the snapshot taken when
    /// the upvalue was first materialized, so a hook that reassigns its
    /// collector upvalue (e.g. `n = 42`) is observed correctly. Returns
    /// `None` if no hook on this thread ever captured that id as an
    /// upvalue.
    pub fn collected_value(
        &self,
        collector_id: &str,
    ) -> Result<Option<crate::script::serialize::SValue>, ScriptError> {
        match self.upvalues.get_live(&self.lua, collector_id)? {
            Some(v) => Ok(Some(serialize_value(&self.lua, v)?)),
            None => Ok(None),
        }
    }
}

fn as_retval(ret: Value) -> Result<i32, ScriptError> {
    match ret {
        Value::Integer(i) => Ok(i as i32),
        Value::Number(n) => Ok(n as i32),
        _ => Err(ScriptError::HookRetval),
    }
}
