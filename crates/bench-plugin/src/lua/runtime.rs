//! Lua runtime implementation.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mlua::{HookTriggers, Lua, RegistryKey, Table, Value as LuaValue};

use crate::contract::Capability;
use crate::runtime::PluginRuntime;
use crate::sandbox::{DEADLINE_MESSAGE, Deadline, SandboxConfig};
use crate::types::{LoadError, PluginError, PluginResult};

use super::bindings;

/// Lua plugin runtime.
///
/// Stateless: every bundle gets its own `Lua` state, created in
/// [`PluginRuntime::load_bundle`].
#[derive(Debug, Default)]
pub struct LuaRuntime;

impl LuaRuntime {
    /// Create a new Lua runtime.
    pub fn new() -> Self {
        Self
    }
}

/// The private interpreter state of one bundle.
struct LuaBundle {
    id: String,
    lua: Lua,
    deadline: Deadline,
    hard_limit: Duration,
    /// Serializes calls so one call cannot re-arm another's deadline.
    calls: Mutex<()>,
}

impl LuaBundle {
    fn new(id: &str, sandbox: &SandboxConfig) -> mlua::Result<Self> {
        let lua = Lua::new();

        if sandbox.max_memory > 0 {
            let _ = lua.set_memory_limit(sandbox.max_memory);
        }

        bindings::restrict_stdlib(&lua, sandbox)?;
        let bench = bindings::create_bench_api(&lua, id, sandbox)?;
        lua.globals().set("bench", bench)?;

        let deadline = Deadline::new();
        let check = deadline.clone();
        lua.set_hook(
            HookTriggers::new().every_nth_instruction(1000),
            move |_lua, _debug| {
                if check.expired() {
                    return Err(mlua::Error::external(DEADLINE_MESSAGE));
                }
                Ok(mlua::VmState::Continue)
            },
        )?;

        Ok(Self {
            id: id.to_string(),
            lua,
            deadline,
            hard_limit: sandbox.hard_limit(),
            calls: Mutex::new(()),
        })
    }

    /// Evaluate the bundle source and return the value it produces.
    fn eval(&self, code: &str) -> mlua::Result<LuaValue> {
        let _serial = self.calls.lock().unwrap_or_else(|e| e.into_inner());
        let _deadline = self.deadline.arm(self.hard_limit);
        self.lua.load(code).set_name(self.id.as_str()).eval()
    }

    /// Call `module[method](module)`. A missing optional method is a no-op.
    fn call(&self, module: &RegistryKey, name: &str, method: &str, required: bool) -> PluginResult<()> {
        let _serial = self.calls.lock().unwrap_or_else(|e| e.into_inner());
        let _deadline = self.deadline.arm(self.hard_limit);

        let table: Table = self
            .lua
            .registry_value(module)
            .map_err(|e| PluginError::execution(name, e))?;

        match table
            .get::<LuaValue>(method)
            .map_err(|e| PluginError::execution(name, e))?
        {
            LuaValue::Function(func) => func
                .call::<()>(table)
                .map_err(|e| PluginError::execution(name, e)),
            LuaValue::Nil if !required => Ok(()),
            _ => Err(PluginError::execution(
                name,
                format!("'{method}' is not a function"),
            )),
        }
    }

    /// Validate one definition table and register it as a capability.
    fn capability(self: &Arc<Self>, index: usize, def: Table) -> Result<LuaCapability, LoadError> {
        let invalid = |what: &str| LoadError::new(&self.id, format!("plugin #{}: {what}", index + 1));

        let name = match def.get::<LuaValue>("name") {
            Ok(LuaValue::String(s)) if !s.as_bytes().is_empty() => s.to_string_lossy(),
            _ => return Err(invalid("'name' must be a non-empty string")),
        };
        if !matches!(def.get::<LuaValue>("start"), Ok(LuaValue::Function(_))) {
            return Err(invalid("'start' must be a function"));
        }
        if !matches!(
            def.get::<LuaValue>("stop"),
            Ok(LuaValue::Nil | LuaValue::Function(_))
        ) {
            return Err(invalid("'stop' must be a function when present"));
        }

        let module = self
            .lua
            .create_registry_value(def)
            .map_err(|e| LoadError::new(&self.id, e.to_string()))?;

        Ok(LuaCapability {
            bundle: Arc::clone(self),
            name,
            module,
        })
    }
}

/// One plugin implementation declared by a Lua bundle.
struct LuaCapability {
    bundle: Arc<LuaBundle>,
    name: String,
    module: RegistryKey,
}

impl Capability for LuaCapability {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self) -> PluginResult<()> {
        self.bundle.call(&self.module, &self.name, "start", true)
    }

    fn stop(&self) -> PluginResult<()> {
        self.bundle.call(&self.module, &self.name, "stop", false)
    }
}

/// A table is a single definition if it carries `name` or `start`;
/// otherwise it is treated as a list of definitions.
fn is_definition(table: &Table) -> bool {
    table.contains_key("name").unwrap_or(false) || table.contains_key("start").unwrap_or(false)
}

impl PluginRuntime for LuaRuntime {
    fn name(&self) -> &'static str {
        "lua"
    }

    fn file_extensions(&self) -> &'static [&'static str] {
        &["lua"]
    }

    fn load_bundle(
        &self,
        bundle_id: &str,
        source: &Path,
        sandbox: &SandboxConfig,
    ) -> PluginResult<Vec<Arc<dyn Capability>>> {
        let code = std::fs::read_to_string(source)?;
        let load_error = |e: mlua::Error| LoadError::new(bundle_id, e.to_string());

        let bundle = Arc::new(LuaBundle::new(bundle_id, sandbox).map_err(load_error)?);
        let root = match bundle.eval(&code).map_err(load_error)? {
            LuaValue::Table(table) => table,
            other => {
                return Err(LoadError::new(
                    bundle_id,
                    format!(
                        "bundle must return a plugin table or a list of them, got {}",
                        other.type_name()
                    ),
                )
                .into());
            }
        };

        let definitions: Vec<Table> = if is_definition(&root) {
            vec![root]
        } else {
            root.sequence_values::<Table>()
                .collect::<mlua::Result<_>>()
                .map_err(load_error)?
        };

        let mut capabilities: Vec<Arc<dyn Capability>> = Vec::with_capacity(definitions.len());
        for (index, def) in definitions.into_iter().enumerate() {
            capabilities.push(Arc::new(bundle.capability(index, def)?));
        }

        tracing::debug!(
            bundle = bundle_id,
            count = capabilities.len(),
            "Resolved Lua plugins"
        );
        Ok(capabilities)
    }
}
