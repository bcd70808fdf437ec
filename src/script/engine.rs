//! The master script engine: one per process, owns the Lua state that
//! runs the user's script and collects hook registrations out of it.
//!
//! Ports `struct script_engine` and the `*_cb` Lua-to-C callbacks from
//! `script.c`.
//!
//! Uses mlua's `send` feature so a [`ScriptEngine`] can be shared (via
//! `Arc`) with worker threads that each build their own
//! [`crate::script::slave::ScriptSlave`] from it — every worker touches
//! its own Lua state only, but the engine itself must be `Send + Sync` to
//! cross the thread-spawn boundary.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};

use mlua::Lua;

use crate::error::ScriptError;
use crate::script::serialize::{
    deserialize_value, serialize_function, serialize_value, SFunction, SValue, UpvalueCache,
};

const PRELUDE: &str = include_str!("prelude.lua");

/// Which side of the connection a script engine drives. Hooks registered
/// for the other side are silently ignored, mirroring `store_hook()`'s
/// `se->run_mode == run_mode` check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Client,
    Server,
}

/// Mirrors `enum script_hook_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookId {
    Socket,
    Close,
    Sendmsg,
    Recvmsg,
    Recverr,
}

impl HookId {
    pub const ALL: [HookId; 5] = [
        HookId::Socket,
        HookId::Close,
        HookId::Sendmsg,
        HookId::Recvmsg,
        HookId::Recverr,
    ];

    pub fn name(self, mode: RunMode) -> &'static str {
        match (mode, self) {
            (RunMode::Client, HookId::Socket) => "client_socket",
            (RunMode::Client, HookId::Close) => "client_close",
            (RunMode::Client, HookId::Sendmsg) => "client_sendmsg",
            (RunMode::Client, HookId::Recvmsg) => "client_recvmsg",
            (RunMode::Client, HookId::Recverr) => "client_recverr",
            (RunMode::Server, HookId::Socket) => "server_socket",
            (RunMode::Server, HookId::Close) => "server_close",
            (RunMode::Server, HookId::Sendmsg) => "server_sendmsg",
            (RunMode::Server, HookId::Recvmsg) => "server_recvmsg",
            (RunMode::Server, HookId::Recverr) => "server_recverr",
        }
    }
}

struct Shared {
    run_mode: RunMode,
    hooks: HashMap<HookId, SFunction>,
    collectors: Vec<(String, mlua::RegistryKey)>,
    run_func: Option<Box<dyn FnOnce() + Send>>,
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("run_mode", &self.run_mode)
            .field("hooks", &self.hooks.keys().collect::<Vec<_>>())
            .field("collectors", &self.collectors.len())
            .finish()
    }
}

/// The master side of the scripting engine (spec.md §4.4): loads and runs
/// the user's script once, then hands its hook registrations to one
/// [`crate::script::slave::ScriptSlave`] per worker thread.
pub struct ScriptEngine {
    lua: Lua,
    shared: Arc<Mutex<Shared>>,
    /// Upvalue cache used only while folding workers' collected values
    /// back into the master state (`pull_data`), kept separate from any
    /// per-hook cache since it outlives a single slave.
    pull_cache: Mutex<UpvalueCache>,
}

// SAFETY: `lua` is only ever touched from the thread that owns the
// `ScriptEngine` (script loading happens before workers start;
// `append_collected` runs only after they've all joined). Every field
// worker threads actually reach through a shared reference — `shared`,
// `pull_cache` — is already synchronized with a `Mutex`.
unsafe impl Sync for ScriptEngine {}

impl ScriptEngine {
    pub fn new(run_mode: RunMode) -> Result<Self, ScriptError> {
        let lua = Lua::new();
        let shared = Arc::new(Mutex::new(Shared {
            run_mode,
            hooks: HashMap::new(),
            collectors: Vec::new(),
            run_func: None,
        }));

        register_callbacks(&lua, &shared)?;
        lua.load(PRELUDE).set_name("script_prelude").exec()?;

        Ok(ScriptEngine {
            lua,
            shared,
            pull_cache: Mutex::new(UpvalueCache::new()),
        })
    }

    pub fn run_mode(&self) -> RunMode {
        self.shared.lock().unwrap().run_mode
    }

    /// Runs `script`, then invokes `run_func` either because the script
    /// called `run()` itself or, if it didn't, as a fallback once the
    /// chunk finishes — mirroring `run_script()`'s "if run() hasn't been
    /// called from the script, do it now".
    pub fn run_string(
        &self,
        script: &str,
        run_func: impl FnOnce() + Send + 'static,
    ) -> Result<(), ScriptError> {
        self.shared.lock().unwrap().run_func = Some(Box::new(run_func));
        self.lua.load(script).exec()?;
        self.run_if_needed();
        Ok(())
    }

    pub fn run_file(
        &self,
        path: &Path,
        run_func: impl FnOnce() + Send + 'static,
    ) -> Result<(), ScriptError> {
        let source = std::fs::read_to_string(path)
            .map_err(|e| ScriptError::HookErr(format!("{}: {e}", path.display())))?;
        self.shared.lock().unwrap().run_func = Some(Box::new(run_func));
        self.lua
            .load(&source)
            .set_name(path.display().to_string())
            .exec()?;
        self.run_if_needed();
        Ok(())
    }

    fn run_if_needed(&self) {
        let f = self.shared.lock().unwrap().run_func.take();
        if let Some(f) = f {
            self.clear_collectors();
            f();
        }
    }

    /// Empties every registered collector table (spec.md §4.5: "Before
    /// invocation, `run()` empties every registered collector — removes
    /// the single element the engine placed there so the slaves can
    /// accumulate a fresh one"). Called immediately before `run_func`
    /// fires, whichever of the two paths (explicit script `run()` call,
    /// or the engine's own fallback once the chunk returns) triggers it.
    fn clear_collectors(&self) {
        let _ = clear_collectors_locked(&self.lua, &self.shared);
    }

    /// Snapshot of registered hooks, handed to a new slave at thread
    /// startup. Mirrors `script_engine_push_data()`.
    pub fn hooks_for_slave(&self) -> HashMap<HookId, SFunction> {
        self.shared.lock().unwrap().hooks.clone()
    }

    pub fn collector_ids(&self) -> Vec<String> {
        self.shared
            .lock()
            .unwrap()
            .collectors
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Appends one worker's collected value for `collector_id` onto the
    /// master-side collector table. Mirrors `add_collected_value()`: the
    /// value was serialized out of a worker's Lua state, so it has to be
    /// deserialized into this one before it can be stored.
    pub fn append_collected(&self, collector_id: &str, value: &SValue) -> Result<(), ScriptError> {
        let shared = self.shared.lock().unwrap();
        let Some((_, key)) = shared.collectors.iter().find(|(id, _)| id == collector_id) else {
            return Ok(());
        };
        let table: mlua::Table = self.lua.registry_value(key)?;
        drop(shared);
        let mut cache = self.pull_cache.lock().unwrap();
        let deserialized = deserialize_value(&self.lua, &mut cache, value)?;
        let n = table.raw_len();
        table.raw_set(n + 1, deserialized)?;
        Ok(())
    }

    /// Reads back every element currently stored in the collector
    /// identified by `collector_id`, for reporting once a run has
    /// finished pulling every slave's contribution in via
    /// [`ScriptEngine::append_collected`]. Returns an empty vector if no
    /// collector was registered under that id (spec.md §3 "Collector":
    /// engine-side accumulator, one element appended per worker pull).
    pub fn collector_values(&self, collector_id: &str) -> Result<Vec<SValue>, ScriptError> {
        let shared = self.shared.lock().unwrap();
        let Some((_, key)) = shared.collectors.iter().find(|(id, _)| id == collector_id) else {
            return Ok(Vec::new());
        };
        let table: mlua::Table = self.lua.registry_value(key)?;
        drop(shared);
        let mut values = Vec::with_capacity(table.raw_len());
        for pair in table.pairs::<i64, mlua::Value>() {
            let (_, v) = pair.map_err(ScriptError::from)?;
            values.push(serialize_value(&self.lua, v)?);
        }
        Ok(values)
    }

    pub fn lua(&self) -> &Lua {
        &self.lua
    }
}

/// Empties every registered collector table in place (spec.md §4.5). A
/// free function (rather than a `ScriptEngine` method) so it can be
/// called from inside the `run` Lua closure built in
/// [`register_callbacks`], before a [`ScriptEngine`] value exists to hang
/// a method off of.
fn clear_collectors_locked(lua: &Lua, shared: &Arc<Mutex<Shared>>) -> mlua::Result<()> {
    let shared = shared.lock().unwrap();
    for (_, key) in &shared.collectors {
        let table: mlua::Table = lua.registry_value(key)?;
        let len = table.raw_len();
        for i in 1..=len {
            table.raw_set(i, mlua::Value::Nil)?;
        }
    }
    Ok(())
}

fn register_callbacks(lua: &Lua, shared: &Arc<Mutex<Shared>>) -> mlua::Result<()> {
    let globals = lua.globals();

    for mode in [RunMode::Client, RunMode::Server] {
        for hid in HookId::ALL {
            let name = hid.name(mode);
            let shared = shared.clone();
            let f = lua.create_function(move |lua, func: mlua::Function| {
                let mut sh = shared.lock().unwrap();
                if sh.run_mode == mode {
                    if sh.hooks.contains_key(&hid) {
                        return Err(mlua::Error::RuntimeError(format!(
                            "hook {} already set",
                            hid.name(mode)
                        )));
                    }
                    let sf = serialize_function(lua, hid.name(mode), &func)
                        .map_err(|e| mlua::Error::RuntimeError(e.to_string()))?;
                    sh.hooks.insert(hid, sf);
                }
                Ok(())
            })?;
            globals.set(name, f)?;
        }
    }

    {
        let shared = shared.clone();
        let f =
            lua.create_function(move |_, ()| Ok(shared.lock().unwrap().run_mode == RunMode::Client))?;
        globals.set("is_client", f)?;
    }
    {
        let shared = shared.clone();
        let f =
            lua.create_function(move |_, ()| Ok(shared.lock().unwrap().run_mode == RunMode::Server))?;
        globals.set("is_server", f)?;
    }
    {
        let shared = shared.clone();
        let f = lua.create_function(move |lua, table: mlua::Table| {
            let tostring: mlua::Function = lua.globals().get("tostring")?;
            let id: String = tostring.call(table.clone())?;
            let key = lua.create_registry_value(table)?;
            shared.lock().unwrap().collectors.push((id, key));
            Ok(())
        })?;
        globals.set("register_collector__", f)?;
    }
    {
        let shared = shared.clone();
        let f = lua.create_function(move |lua, ()| {
            let f = shared.lock().unwrap().run_func.take();
            if let Some(f) = f {
                clear_collectors_locked(lua, &shared)?;
                f();
            }
            Ok(())
        })?;
        globals.set("run", f)?;
    }
    {
        // tid_iter is a no-op: the original's thread-iteration sugar has
        // no Rust counterpart here, see SPEC_FULL.md's Open Questions.
        let f = lua.create_function(move |_, ()| Ok(()))?;
        globals.set("tid_iter", f)?;
    }

    Ok(())
}
