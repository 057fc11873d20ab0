//! Lua plugin runtime implementation.
//!
//! This module provides a Lua scripting runtime using mlua (Lua 5.4).
//! Every bundle is evaluated in its own `Lua` state with a restricted
//! stdlib and a `bench` host table.

mod bindings;
mod runtime;

pub use runtime::LuaRuntime;
