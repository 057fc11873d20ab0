//! Host API exposed to Lua bundles, and sandbox enforcement on the stdlib.

use std::path::Path;

use mlua::{Lua, Table, Value as LuaValue};

use crate::sandbox::{Permission, SandboxConfig};

/// Remove globals the sandbox does not allow.
pub fn restrict_stdlib(lua: &Lua, sandbox: &SandboxConfig) -> mlua::Result<()> {
    let globals = lua.globals();

    // Bundles are single files; no loading code from disk.
    for name in ["loadfile", "dofile", "require", "package", "debug"] {
        globals.set(name, LuaValue::Nil)?;
    }

    if let LuaValue::Table(os) = globals.get::<LuaValue>("os")? {
        os.set("exit", LuaValue::Nil)?;
        if !sandbox.has_permission(Permission::Execute) {
            os.set("execute", LuaValue::Nil)?;
        }
        if !sandbox.has_permission(Permission::Write) {
            for name in ["remove", "rename", "tmpname"] {
                os.set(name, LuaValue::Nil)?;
            }
        }
        if !sandbox.has_permission(Permission::Environment) {
            os.set("getenv", LuaValue::Nil)?;
        }
    }

    // `io` opens any path in any mode. Reads go through `bench.fs`, which
    // checks the read policy.
    if !sandbox.has_permission(Permission::Write) {
        globals.set("io", LuaValue::Nil)?;
    } else if !sandbox.has_permission(Permission::Execute) {
        if let LuaValue::Table(io) = globals.get::<LuaValue>("io")? {
            io.set("popen", LuaValue::Nil)?;
        }
    }

    Ok(())
}

/// Create the `bench` namespace for one bundle.
pub fn create_bench_api(lua: &Lua, bundle_id: &str, sandbox: &SandboxConfig) -> mlua::Result<Table> {
    let bench = lua.create_table()?;
    bench.set("version", env!("CARGO_PKG_VERSION"))?;
    bench.set("bundle", bundle_id)?;

    let id = bundle_id.to_string();
    bench.set(
        "log_info",
        lua.create_function(move |_, msg: String| {
            tracing::info!(target: "plugin", bundle = %id, "{}", msg);
            Ok(())
        })?,
    )?;

    let id = bundle_id.to_string();
    bench.set(
        "log_warn",
        lua.create_function(move |_, msg: String| {
            tracing::warn!(target: "plugin", bundle = %id, "{}", msg);
            Ok(())
        })?,
    )?;

    let id = bundle_id.to_string();
    bench.set(
        "log_error",
        lua.create_function(move |_, msg: String| {
            tracing::error!(target: "plugin", bundle = %id, "{}", msg);
            Ok(())
        })?,
    )?;

    if sandbox.has_permission(Permission::Notify) {
        let id = bundle_id.to_string();
        bench.set(
            "notify",
            lua.create_function(move |_, (msg, level): (String, Option<String>)| {
                let level = level.unwrap_or_else(|| "info".to_string());
                tracing::info!(target: "plugin_notify", bundle = %id, level = %level, "{}", msg);
                Ok(())
            })?,
        )?;
    }

    if sandbox.has_permission(Permission::Read) {
        bench.set("fs", create_fs_api(lua, sandbox)?)?;
    }

    Ok(bench)
}

/// Create the read-only `bench.fs` namespace.
fn create_fs_api(lua: &Lua, sandbox: &SandboxConfig) -> mlua::Result<Table> {
    let fs = lua.create_table()?;

    let policy = sandbox.clone();
    fs.set(
        "exists",
        lua.create_function(move |_, path: String| {
            let path = Path::new(&path);
            Ok(policy.can_read(path) && path.exists())
        })?,
    )?;

    // fs.read(path) -> string | nil, truncated at the sandbox read limit
    let policy = sandbox.clone();
    fs.set(
        "read",
        lua.create_function(move |lua, path: String| {
            let path = Path::new(&path);
            if !policy.can_read(path) {
                return Err(mlua::Error::external(format!(
                    "read denied: {}",
                    path.display()
                )));
            }
            if !path.is_file() {
                return Ok(LuaValue::Nil);
            }

            let content = std::fs::read(path).map_err(mlua::Error::external)?;
            let end = content.len().min(policy.max_read_size);
            Ok(LuaValue::String(lua.create_string(&content[..end])?))
        })?,
    )?;

    Ok(fs)
}
