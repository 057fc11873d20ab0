//! Rhai plugin runtime implementation.
//!
//! This module provides a Rhai scripting runtime as an alternative to Lua.
//! A bundle script ends with an object map (or an array of maps) whose
//! `start` and `stop` entries are function pointers.

mod runtime;

pub use runtime::RhaiRuntime;
