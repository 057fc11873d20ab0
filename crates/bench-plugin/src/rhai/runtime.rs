//! Rhai runtime implementation.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rhai::module_resolvers::DummyModuleResolver;
use rhai::{AST, Dynamic, Engine, EvalAltResult, FnPtr, Map, Scope};

use crate::contract::Capability;
use crate::runtime::PluginRuntime;
use crate::sandbox::{DEADLINE_MESSAGE, Deadline, Permission, SandboxConfig};
use crate::types::{LoadError, PluginError, PluginResult};

/// Rhai plugin runtime.
#[derive(Debug, Default)]
pub struct RhaiRuntime;

impl RhaiRuntime {
    /// Create a new Rhai runtime.
    pub fn new() -> Self {
        Self
    }
}

/// Build an engine for one bundle, with limits and the host API.
fn build_engine(bundle_id: &str, sandbox: &SandboxConfig, deadline: &Deadline) -> Engine {
    let mut engine = Engine::new();

    // Configure safety limits
    engine.set_max_expr_depths(64, 64);
    engine.set_max_call_levels(64);
    engine.set_max_string_size(1024 * 1024); // 1MB strings
    engine.set_max_array_size(10_000);
    engine.set_max_map_size(10_000);
    engine.set_module_resolver(DummyModuleResolver::new());

    let check = deadline.clone();
    engine.on_progress(move |_ops| {
        if check.expired() {
            Some(Dynamic::from(DEADLINE_MESSAGE))
        } else {
            None
        }
    });

    let id = bundle_id.to_string();
    engine.on_print(move |msg| tracing::info!(target: "plugin", bundle = %id, "{}", msg));
    let id = bundle_id.to_string();
    engine.on_debug(move |msg, _src, _pos| tracing::debug!(target: "plugin", bundle = %id, "{}", msg));

    register_api(&mut engine, bundle_id, sandbox);
    engine
}

fn register_api(engine: &mut Engine, bundle_id: &str, sandbox: &SandboxConfig) {
    engine.register_fn("bench_version", || env!("CARGO_PKG_VERSION").to_string());
    let id = bundle_id.to_string();
    engine.register_fn("bench_bundle", move || id.clone());

    let id = bundle_id.to_string();
    engine.register_fn("log_info", move |msg: &str| {
        tracing::info!(target: "plugin", bundle = %id, "{}", msg);
    });
    let id = bundle_id.to_string();
    engine.register_fn("log_warn", move |msg: &str| {
        tracing::warn!(target: "plugin", bundle = %id, "{}", msg);
    });
    let id = bundle_id.to_string();
    engine.register_fn("log_error", move |msg: &str| {
        tracing::error!(target: "plugin", bundle = %id, "{}", msg);
    });

    if sandbox.has_permission(Permission::Notify) {
        let id = bundle_id.to_string();
        engine.register_fn("notify", move |msg: &str| {
            tracing::info!(target: "plugin_notify", bundle = %id, "{}", msg);
        });
    }

    if !sandbox.has_permission(Permission::Read) {
        return;
    }

    let policy = sandbox.clone();
    engine.register_fn("fs_exists", move |path: &str| -> bool {
        let path = Path::new(path);
        policy.can_read(path) && path.exists()
    });

    let policy = sandbox.clone();
    engine.register_fn(
        "fs_read",
        move |path: &str| -> Result<Dynamic, Box<EvalAltResult>> {
            let p = Path::new(path);
            if !policy.can_read(p) {
                return Err(format!("read denied: {path}").into());
            }
            match std::fs::read(p) {
                Ok(content) => {
                    let end = content.len().min(policy.max_read_size);
                    Ok(Dynamic::from(String::from_utf8_lossy(&content[..end]).into_owned()))
                }
                Err(_) => Ok(Dynamic::UNIT),
            }
        },
    );
}

/// Whether an evaluation error came from the deadline.
fn is_terminated(err: &EvalAltResult) -> bool {
    match err {
        EvalAltResult::ErrorTerminated(..) => true,
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => is_terminated(inner),
        _ => false,
    }
}

fn describe(err: &EvalAltResult) -> String {
    if is_terminated(err) {
        DEADLINE_MESSAGE.to_string()
    } else {
        err.to_string()
    }
}

/// The private engine and compiled script of one bundle.
struct RhaiBundle {
    id: String,
    engine: Engine,
    ast: AST,
    deadline: Deadline,
    hard_limit: Duration,
    calls: Mutex<()>,
}

impl RhaiBundle {
    /// Call a function pointer with no arguments.
    fn call(&self, name: &str, func: &FnPtr) -> PluginResult<()> {
        let _serial = self.calls.lock().unwrap_or_else(|e| e.into_inner());
        let _deadline = self.deadline.arm(self.hard_limit);

        func.call::<Dynamic>(&self.engine, &self.ast, ())
            .map(|_| ())
            .map_err(|e| PluginError::execution(name, describe(&e)))
    }

    fn capability(self: &Arc<Self>, index: usize, value: Dynamic) -> Result<RhaiCapability, LoadError> {
        let invalid = |what: &str| LoadError::new(&self.id, format!("plugin #{}: {what}", index + 1));

        let Some(def) = value.try_cast::<Map>() else {
            return Err(invalid("expected an object map"));
        };

        let name = def
            .get("name")
            .and_then(|v| v.clone().into_string().ok())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| invalid("'name' must be a non-empty string"))?;

        let start = def
            .get("start")
            .and_then(|v| v.clone().try_cast::<FnPtr>())
            .ok_or_else(|| invalid("'start' must be a function pointer"))?;

        let stop = match def.get("stop") {
            None => None,
            Some(v) if v.is_unit() => None,
            Some(v) => Some(
                v.clone()
                    .try_cast::<FnPtr>()
                    .ok_or_else(|| invalid("'stop' must be a function pointer when present"))?,
            ),
        };

        Ok(RhaiCapability {
            bundle: Arc::clone(self),
            name,
            start,
            stop,
        })
    }
}

/// One plugin implementation declared by a Rhai bundle.
struct RhaiCapability {
    bundle: Arc<RhaiBundle>,
    name: String,
    start: FnPtr,
    stop: Option<FnPtr>,
}

impl Capability for RhaiCapability {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self) -> PluginResult<()> {
        self.bundle.call(&self.name, &self.start)
    }

    fn stop(&self) -> PluginResult<()> {
        match &self.stop {
            Some(func) => self.bundle.call(&self.name, func),
            None => Ok(()),
        }
    }
}

impl PluginRuntime for RhaiRuntime {
    fn name(&self) -> &'static str {
        "rhai"
    }

    fn file_extensions(&self) -> &'static [&'static str] {
        &["rhai"]
    }

    fn load_bundle(
        &self,
        bundle_id: &str,
        source: &Path,
        sandbox: &SandboxConfig,
    ) -> PluginResult<Vec<Arc<dyn Capability>>> {
        let code = std::fs::read_to_string(source)?;

        let deadline = Deadline::new();
        let engine = build_engine(bundle_id, sandbox, &deadline);
        let ast = engine
            .compile(&code)
            .map_err(|e| LoadError::new(bundle_id, e.to_string()))?;

        let value = {
            let _deadline = deadline.arm(sandbox.hard_limit());
            let mut scope = Scope::new();
            engine
                .eval_ast_with_scope::<Dynamic>(&mut scope, &ast)
                .map_err(|e| LoadError::new(bundle_id, describe(&e)))?
        };

        let definitions = if value.is_map() {
            vec![value]
        } else if value.is_array() {
            value.cast::<rhai::Array>()
        } else {
            return Err(LoadError::new(
                bundle_id,
                format!(
                    "bundle must end with a plugin map or an array of them, got {}",
                    value.type_name()
                ),
            )
            .into());
        };

        let bundle = Arc::new(RhaiBundle {
            id: bundle_id.to_string(),
            engine,
            ast,
            deadline,
            hard_limit: sandbox.hard_limit(),
            calls: Mutex::new(()),
        });

        let mut capabilities: Vec<Arc<dyn Capability>> = Vec::with_capacity(definitions.len());
        for (index, value) in definitions.into_iter().enumerate() {
            capabilities.push(Arc::new(bundle.capability(index, value)?));
        }

        tracing::debug!(
            bundle = bundle_id,
            count = capabilities.len(),
            "Resolved Rhai plugins"
        );
        Ok(capabilities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn load(code: &str, sandbox: &SandboxConfig) -> PluginResult<Vec<Arc<dyn Capability>>> {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.rhai");
        std::fs::write(&path, code).unwrap();
        RhaiRuntime::new().load_bundle("test.rhai", &path, sandbox)
    }

    #[test]
    fn test_single_map() {
        let caps = load(
            r#"
            fn announce() { log_info("started " + bench_bundle()); }
            #{ name: "weather", start: Fn("announce") }
            "#,
            &SandboxConfig::default(),
        )
        .unwrap();

        assert_eq!(caps.len(), 1);
        assert_eq!(caps[0].name(), "weather");
        caps[0].start().unwrap();
        caps[0].stop().unwrap();
    }

    #[test]
    fn test_array_of_maps_with_closures() {
        let caps = load(
            r#"
            [
                #{ name: "news", start: || log_info("news") },
                #{ name: "cinema", start: || log_info("cinema"), stop: || log_info("bye") },
            ]
            "#,
            &SandboxConfig::default(),
        )
        .unwrap();

        let names: Vec<&str> = caps.iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["news", "cinema"]);
        for cap in &caps {
            cap.start().unwrap();
            cap.stop().unwrap();
        }
    }

    #[test]
    fn test_parse_error_is_load_error() {
        let err = load("#{ name: ", &SandboxConfig::default()).unwrap_err();
        assert!(matches!(err, PluginError::Load(ref e) if e.bundle_id == "test.rhai"));
    }

    #[test]
    fn test_wrong_result_type_is_load_error() {
        let err = load("42", &SandboxConfig::default()).unwrap_err();
        assert!(err.to_string().contains("plugin map"));
    }

    #[test]
    fn test_missing_start_is_load_error() {
        let err = load(r#"#{ name: "x" }"#, &SandboxConfig::default()).unwrap_err();
        assert!(err.to_string().contains("'start'"));
    }

    #[test]
    fn test_start_error_is_execution_error() {
        let caps = load(
            r#"
            fn boom() { throw "no network"; }
            #{ name: "bad", start: Fn("boom") }
            "#,
            &SandboxConfig::default(),
        )
        .unwrap();

        let err = caps[0].start().unwrap_err();
        assert!(matches!(err, PluginError::Execution { ref name, .. } if name == "bad"));
    }

    #[test]
    fn test_runaway_start_is_interrupted() {
        let sandbox = SandboxConfig::default().with_timeout(50).with_grace(0);
        let caps = load(
            r#"
            fn spin() { loop { } }
            #{ name: "spin", start: Fn("spin") }
            "#,
            &sandbox,
        )
        .unwrap();

        let err = caps[0].start().unwrap_err();
        assert!(err.to_string().contains(DEADLINE_MESSAGE));
    }

    #[test]
    fn test_fs_functions_require_read_permission() {
        let code = r#"
            fn peek() { fs_exists("/"); }
            #{ name: "peek", start: Fn("peek") }
        "#;

        let caps = load(code, &SandboxConfig::default()).unwrap();
        assert!(caps[0].start().is_err());

        let caps = load(code, &SandboxConfig::default().grant(Permission::Read)).unwrap();
        assert!(caps[0].start().is_ok());
    }

    #[test]
    fn test_import_is_rejected() {
        let err = load(
            r#"
            import "other" as other;
            #{ name: "x", start: || () }
            "#,
            &SandboxConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, PluginError::Load(_)));
    }
}
