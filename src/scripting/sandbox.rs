/// `scripting/sandbox.rs` - guarded environment and artifact execution.
///
/// Every invocation gets a fresh VM holding only table, string, math, utf8
/// and os. Script code never sees the VM globals: its chunk runs against a
/// separate environment table built by `api::register_all`, overlaid with the
/// bound names, and closed by a metatable that reports undefined names.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use mlua::{ChunkMode, Function, Lua, LuaOptions, MultiValue, StdLib, Table, Value};
use serde_json::Value as Json;

use crate::config::ScriptingConfig;
use crate::error::ScriptError;
use crate::host::HostValue;
use crate::security::SecurityManager;

use super::api::{self, ApiContext, PrintBuffer};
use super::compiler::{rewrite_runtime_locations, CompiledArtifact, CHUNK_NAME};

/// Libraries opened in the VM; the environment copies from these.
fn vm_libs() -> StdLib {
    StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8 | StdLib::OS
}

/// Creates a new Lua VM able to load binary chunks.
pub fn create_vm(config: &ScriptingConfig) -> mlua::Result<Lua> {
    // SAFETY: only bytecode produced by `compiler::compile` in this process,
    // or loaded after its digest and version stamps were checked, is loaded.
    let lua = unsafe { Lua::unsafe_new_with(vm_libs(), LuaOptions::new()) };
    if let Some(limit) = config.memory_limit_bytes {
        lua.set_memory_limit(limit)?;
    }
    Ok(lua)
}

/// One call of a compiled script.
pub struct Execution<'a> {
    pub script_id: &'a str,
    pub artifact: &'a CompiledArtifact,
    pub bound_names: &'a HashMap<String, HostValue>,
    /// Arguments already arranged by `Signature::bind`.
    pub arguments: Vec<Json>,
    pub filepath: String,
}

/// Build the environment `register_all` + bound names + diagnostics entries.
fn build_env(
    lua: &Lua,
    exec: &Execution<'_>,
    config: &ScriptingConfig,
    security: &Arc<SecurityManager>,
    printed: &PrintBuffer,
) -> mlua::Result<Table> {
    let env = lua.create_table()?;
    api::register_all(
        lua,
        &env,
        &ApiContext {
            security: Arc::clone(security),
            allowed_modules: config.allowed_modules.clone(),
            printed: Arc::clone(printed),
        },
    )?;

    for (name, value) in exec.bound_names {
        env.set(name.as_str(), api::host_value_to_lua(lua, value.clone(), security)?)?;
    }

    let supplement = lua.create_table()?;
    supplement.set("script", exec.script_id)?;
    supplement.set("line", -1)?;
    env.set("__traceback_supplement__", supplement)?;
    env.set("__file__", exec.filepath.as_str())?;

    let meta = lua.create_table()?;
    let printed = Arc::clone(printed);
    meta.set(
        "__index",
        lua.create_function(move |lua, (_env, key): (Table, Value)| {
            let name = match &key {
                Value::String(s) => s.to_string_lossy(),
                other => format!("{other:?}"),
            };
            if name == "printed" {
                return Ok(Value::String(lua.create_string(api::read_printed(&printed))?));
            }
            Err(mlua::Error::runtime(format!("name '{name}' is not defined")))
        })?,
    )?;
    let setmetatable: Function = lua.globals().get("setmetatable")?;
    setmetatable.call::<()>((env.clone(), meta))?;
    Ok(env)
}

fn results_to_json(values: MultiValue) -> Json {
    let mut values = values.into_vec();
    match values.len() {
        0 => Json::Null,
        1 => api::lua_value_to_json(values.remove(0)),
        _ => Json::Array(values.into_iter().map(api::lua_value_to_json).collect()),
    }
}

fn run(
    lua: &Lua,
    exec: &Execution<'_>,
    config: &ScriptingConfig,
    security: &Arc<SecurityManager>,
    printed: &PrintBuffer,
) -> mlua::Result<Json> {
    let env = build_env(lua, exec, config, security, printed)?;
    let chunk = lua
        .load(&exec.artifact.bytecode[..])
        .set_mode(ChunkMode::Binary)
        .set_name(CHUNK_NAME)
        .set_environment(env)
        .into_function()?;
    let function: Function = chunk.call(())?;
    let args = exec
        .arguments
        .iter()
        .map(|a| api::json_to_lua_value(lua, a))
        .collect::<mlua::Result<Vec<Value>>>()?;
    let results: MultiValue = function.call(MultiValue::from_vec(args))?;
    Ok(results_to_json(results))
}

/// Materialize the artifact in a fresh VM and call it.
pub fn execute(
    exec: Execution<'_>,
    config: &ScriptingConfig,
    security: &Arc<SecurityManager>,
) -> Result<Json, ScriptError> {
    let lua = create_vm(config)?;
    let printed: PrintBuffer = Arc::new(Mutex::new(String::new()));
    run(&lua, &exec, config, security, &printed).map_err(|e| {
        api::classify_error(e, |msg| rewrite_runtime_locations(msg, exec.script_id))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::SimpleObject;
    use crate::scripting::compiler::compile;
    use crate::security::Principal;
    use serde_json::json;

    fn run_body(params: &str, body: &str, args: Vec<Json>) -> Result<Json, ScriptError> {
        let out = compile(params, body, "t", &["context".to_string()]);
        let artifact = out.artifact.expect("compiles");
        let mut bound = HashMap::new();
        bound.insert(
            "context".to_string(),
            HostValue::Object(SimpleObject::new("Folder", &["site"]).into_shared()),
        );
        let security = SecurityManager::with_roles(Principal::anonymous());
        let arguments = artifact.signature.bind("t", &args, &serde_json::Map::new())?;
        execute(
            Execution {
                script_id: "t",
                artifact: &artifact,
                bound_names: &bound,
                arguments,
                filepath: "Script (Lua):/site/t".to_string(),
            },
            &ScriptingConfig::default(),
            &security,
        )
    }

    #[test]
    fn results_follow_return_arity() {
        assert_eq!(run_body("", "", vec![]).unwrap(), Json::Null);
        assert_eq!(run_body("x", "return x", vec![json!("txt")]).unwrap(), json!("txt"));
        assert_eq!(
            run_body("x,y", "return x,y", vec![json!("one"), json!("two")]).unwrap(),
            json!(["one", "two"])
        );
    }

    #[test]
    fn bound_names_and_closures() {
        let body = "local function twice(f) return function(v) return f(f(v)) end end\n\
                    return twice(function(v) return v .. '!' end)(context.id)";
        assert_eq!(run_body("", body, vec![]).unwrap(), json!("site!!"));
    }

    #[test]
    fn printed_collects_print_output() {
        let body = "print('hello', 42)\nreturn printed";
        assert_eq!(run_body("", body, vec![]).unwrap(), json!("hello\t42\n"));
    }

    #[test]
    fn undefined_names_raise() {
        match run_body("", "return nothing_here", vec![]).unwrap_err() {
            ScriptError::Runtime(msg) => {
                assert!(msg.contains("name 'nothing_here' is not defined"), "{msg}")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn script_errors_point_at_body_lines() {
        match run_body("", "local a = 1\nerror('boom')", vec![]).unwrap_err() {
            ScriptError::Runtime(msg) => assert_eq!(msg, "Script \"t\", line 2: boom"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn nested_errors_carry_no_traceback() {
        let body = "local function inner()\n  error('deep')\nend\ninner()";
        match run_body("", body, vec![]).unwrap_err() {
            ScriptError::Runtime(msg) => assert_eq!(msg, "Script \"t\", line 2: deep"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn exit_is_converted() {
        assert!(matches!(
            run_body("", "os.exit(0)", vec![]).unwrap_err(),
            ScriptError::Value(_)
        ));
    }

    #[test]
    fn defaults_are_applied() {
        assert_eq!(run_body("a, b=2", "return a + b", vec![json!(1)]).unwrap(), json!(3));
        assert_eq!(
            run_body("*rest", "return #rest", vec![json!(1), json!(2)]).unwrap(),
            json!(2)
        );
        assert_eq!(
            run_body("*rest", "return rest.n, rest[2]", vec![Json::Null, json!(2)]).unwrap(),
            json!([2, 2])
        );
    }
}
