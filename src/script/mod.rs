//! Embedded Lua scripting (spec.md §4.4–§4.6): a master [`engine`] that
//! runs the user's script once and a per-worker-thread [`slave`] that
//! replays its hooks, connected by a value-transfer layer in
//! [`serialize`].

pub mod engine;
pub mod serialize;
pub mod slave;
