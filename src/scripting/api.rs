/// `scripting/api.rs` - globals of the guarded environment.
///
/// Provides the restricted surface every script sees:
///   safe base functions, string/table/math/utf8 copies, a reduced os,
///   print + printed, require, getattr/hasattr, guarded host objects

use std::sync::{Arc, Mutex, PoisonError};

use mlua::{
    Lua, MetaMethod, MultiValue, Result as LuaResult, Table, UserData, UserDataMethods, Value,
    Variadic,
};
use serde_json::Value as Json;

use crate::error::ScriptError;
use crate::host::{describe, HostObject, HostValue};
use crate::security::SecurityManager;

use super::standard;

/// Text written by `print` during one invocation.
pub type PrintBuffer = Arc<Mutex<String>>;

const MODULES_KEY: &str = "restricted_modules";

const SAFE_BASE: [&str; 11] = [
    "assert", "error", "ipairs", "next", "pairs", "pcall", "select", "tonumber", "tostring",
    "type", "xpcall",
];
const SAFE_OS: [&str; 4] = ["clock", "date", "difftime", "time"];

/// Everything the registered globals close over.
pub struct ApiContext {
    pub security: Arc<SecurityManager>,
    pub allowed_modules: Vec<String>,
    pub printed: PrintBuffer,
}

/// Install the restricted globals into `env`.
pub fn register_all(lua: &Lua, env: &Table, ctx: &ApiContext) -> LuaResult<()> {
    register_base(lua, env)?;
    register_libraries(lua, env)?;
    register_print(lua, env, Arc::clone(&ctx.printed))?;
    register_modules(lua, env, &ctx.allowed_modules)?;
    register_getattr(lua, env)?;
    Ok(())
}

// ── base ──────────────────────────────────────────────────────────────────────

fn register_base(lua: &Lua, env: &Table) -> LuaResult<()> {
    let globals = lua.globals();
    for name in SAFE_BASE {
        env.set(name, globals.get::<Value>(name)?)?;
    }
    Ok(())
}

fn copy_table(lua: &Lua, source: &Table, skip: &[&str]) -> LuaResult<Table> {
    let copy = lua.create_table()?;
    for pair in source.clone().pairs::<Value, Value>() {
        let (k, v) = pair?;
        if let Value::String(s) = &k {
            if skip.contains(&s.to_string_lossy().as_str()) {
                continue;
            }
        }
        copy.raw_set(k, v)?;
    }
    Ok(copy)
}

// ── libraries ─────────────────────────────────────────────────────────────────

/// Marker raised by `os.exit`; never allowed to end the process.
#[derive(Debug)]
pub struct SystemExit;

impl std::fmt::Display for SystemExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SystemExit")
    }
}

impl std::error::Error for SystemExit {}

fn register_libraries(lua: &Lua, env: &Table) -> LuaResult<()> {
    let globals = lua.globals();

    // string methods reach the real library through the string metatable
    let string: Table = globals.get("string")?;
    string.raw_set("dump", Value::Nil)?;
    env.set("string", copy_table(lua, &string, &[])?)?;

    for lib in ["table", "math", "utf8"] {
        env.set(lib, copy_table(lua, &globals.get::<Table>(lib)?, &[])?)?;
    }

    let os: Table = globals.get("os")?;
    let safe_os = lua.create_table()?;
    for name in SAFE_OS {
        safe_os.set(name, os.get::<Value>(name)?)?;
    }
    safe_os.set(
        "exit",
        lua.create_function(|_, _code: Variadic<Value>| -> LuaResult<()> {
            Err(mlua::Error::external(SystemExit))
        })?,
    )?;
    env.set("os", safe_os)?;
    Ok(())
}

// ── print ─────────────────────────────────────────────────────────────────────

fn register_print(lua: &Lua, env: &Table, printed: PrintBuffer) -> LuaResult<()> {
    let print = lua.create_function(move |lua, args: Variadic<Value>| {
        let tostring: mlua::Function = lua.globals().get("tostring")?;
        let mut parts = Vec::with_capacity(args.len());
        for arg in args {
            parts.push(tostring.call::<String>(arg)?);
        }
        let mut out = printed.lock().unwrap_or_else(PoisonError::into_inner);
        out.push_str(&parts.join("\t"));
        out.push('\n');
        Ok(())
    })?;
    env.set("print", print)?;
    Ok(())
}

pub fn read_printed(printed: &PrintBuffer) -> String {
    printed.lock().unwrap_or_else(PoisonError::into_inner).clone()
}

// ── require ───────────────────────────────────────────────────────────────────

fn register_modules(lua: &Lua, env: &Table, allowed: &[String]) -> LuaResult<()> {
    let modules = lua.create_table()?;
    for name in allowed {
        let module = match name.as_str() {
            "string" | "table" | "math" | "utf8" | "os" => env.get::<Value>(name.as_str())?,
            "standard" => Value::Table(standard::create_module(lua)?),
            _ => continue,
        };
        modules.set(name.as_str(), module)?;
    }
    lua.set_named_registry_value(MODULES_KEY, modules)?;

    let require = lua.create_function(|lua, name: String| {
        let modules: Table = lua.named_registry_value(MODULES_KEY)?;
        match modules.get::<Value>(name.as_str())? {
            Value::Nil => Err(mlua::Error::external(ScriptError::Unauthorized(format!(
                "import of '{name}' is unauthorized"
            )))),
            module => Ok(module),
        }
    })?;
    env.set("require", require)?;
    Ok(())
}

// ── guarded getattr ───────────────────────────────────────────────────────────

/// Attribute read that applies the access rules of one value category.
///
/// `Ok(None)` means the attribute does not exist.
pub trait GuardedGetattr {
    fn guarded_getattr(&self, lua: &Lua, name: &str) -> LuaResult<Option<Value>>;
}

fn refuse_private(name: &str) -> LuaResult<()> {
    if name.starts_with('_') {
        return Err(mlua::Error::external(ScriptError::Unauthorized(format!(
            "'{name}' is not accessible because it starts with \"_\""
        ))));
    }
    Ok(())
}

/// A host object as scripts see it.
#[derive(Clone)]
pub struct GuardedObject {
    pub object: Arc<dyn HostObject>,
    pub security: Arc<SecurityManager>,
}

impl GuardedObject {
    pub fn new(object: Arc<dyn HostObject>, security: Arc<SecurityManager>) -> Self {
        Self { object, security }
    }

    fn method(&self, lua: &Lua, name: &str) -> LuaResult<Value> {
        let this = self.clone();
        let name = name.to_string();
        let f = lua.create_function(move |lua, args: MultiValue| {
            let mut args = args.into_vec();
            // obj:method(...) passes the object first
            if matches!(args.first(), Some(Value::UserData(ud)) if ud.is::<GuardedObject>()) {
                args.remove(0);
            }
            let args: Vec<Json> = args.into_iter().map(lua_value_to_json).collect();
            match this.object.call_method(&name, args) {
                Ok(value) => host_value_to_lua(lua, value, &this.security),
                Err(msg) => Err(mlua::Error::external(ScriptError::Runtime(msg))),
            }
        })?;
        Ok(Value::Function(f))
    }
}

impl GuardedGetattr for GuardedObject {
    fn guarded_getattr(&self, lua: &Lua, name: &str) -> LuaResult<Option<Value>> {
        refuse_private(name)?;
        let Some(value) = self.object.attribute(name) else {
            return Ok(None);
        };
        self.security
            .validate(self.object.as_ref(), name)
            .map_err(mlua::Error::external)?;
        match value {
            HostValue::Method => self.method(lua, name).map(Some),
            other => host_value_to_lua(lua, other, &self.security).map(Some),
        }
    }
}

impl GuardedGetattr for Table {
    fn guarded_getattr(&self, _lua: &Lua, name: &str) -> LuaResult<Option<Value>> {
        refuse_private(name)?;
        match self.raw_get::<Value>(name)? {
            Value::Nil => Ok(None),
            v => Ok(Some(v)),
        }
    }
}

impl GuardedGetattr for mlua::String {
    fn guarded_getattr(&self, lua: &Lua, name: &str) -> LuaResult<Option<Value>> {
        refuse_private(name)?;
        let string: Table = lua.globals().get("string")?;
        match string.raw_get::<Value>(name)? {
            Value::Nil => Ok(None),
            v => Ok(Some(v)),
        }
    }
}

impl UserData for GuardedObject {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::Index, |lua, this, name: String| {
            Ok(this.guarded_getattr(lua, &name)?.unwrap_or(Value::Nil))
        });
        methods.add_meta_method(
            MetaMethod::NewIndex,
            |_, this, (name, _value): (String, Value)| -> LuaResult<()> {
                Err(mlua::Error::external(ScriptError::Unauthorized(format!(
                    "attribute '{name}' of {} is read-only",
                    describe(this.object.as_ref())
                ))))
            },
        );
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            Ok(describe(this.object.as_ref()))
        });
    }
}

fn dispatch_getattr(lua: &Lua, target: &Value, name: &str) -> LuaResult<Option<Value>> {
    match target {
        Value::UserData(ud) if ud.is::<GuardedObject>() => {
            ud.borrow::<GuardedObject>()?.guarded_getattr(lua, name)
        }
        Value::Table(t) => t.guarded_getattr(lua, name),
        Value::String(s) => s.guarded_getattr(lua, name),
        _ => {
            refuse_private(name)?;
            Ok(None)
        }
    }
}

fn register_getattr(lua: &Lua, env: &Table) -> LuaResult<()> {
    let getattr = lua.create_function(
        |lua, (target, name, default): (Value, String, Variadic<Value>)| {
            match dispatch_getattr(lua, &target, &name)? {
                Some(v) => Ok(v),
                None if !default.is_empty() => Ok(default[0].clone()),
                None => Err(mlua::Error::external(ScriptError::Runtime(format!(
                    "'{}' object has no attribute '{name}'",
                    target.type_name()
                )))),
            }
        },
    )?;
    let hasattr = lua.create_function(|lua, (target, name): (Value, String)| {
        Ok(matches!(dispatch_getattr(lua, &target, &name), Ok(Some(_))))
    })?;
    env.set("getattr", getattr)?;
    env.set("hasattr", hasattr)?;
    Ok(())
}

// ── errors ────────────────────────────────────────────────────────────────────

fn external_cause(err: &mlua::Error) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
    match err {
        mlua::Error::ExternalError(e) => Some(e.as_ref()),
        mlua::Error::CallbackError { cause, .. } | mlua::Error::WithContext { cause, .. } => {
            external_cause(cause)
        }
        _ => None,
    }
}

/// Innermost message of a Lua error, without tracebacks.
fn root_message(err: &mlua::Error) -> String {
    let message = match err {
        mlua::Error::CallbackError { cause, .. } | mlua::Error::WithContext { cause, .. } => {
            return root_message(cause);
        }
        mlua::Error::RuntimeError(msg) => msg.clone(),
        other => other.to_string(),
    };
    match message.split_once("\nstack traceback:") {
        Some((head, _)) => head.to_string(),
        None => message,
    }
}

/// Map a failure of the script body back onto the error taxonomy.
///
/// `rewrite` turns chunk locations into script locations.
pub fn classify_error(err: mlua::Error, rewrite: impl Fn(&str) -> String) -> ScriptError {
    if let Some(cause) = external_cause(&err) {
        if cause.is::<SystemExit>() {
            return ScriptError::Value("SystemExit cannot be raised within a script".to_string());
        }
        if let Some(e) = cause.downcast_ref::<ScriptError>() {
            match e {
                ScriptError::Unauthorized(m) => return ScriptError::Unauthorized(m.clone()),
                ScriptError::Forbidden(m) => return ScriptError::Forbidden(m.clone()),
                ScriptError::Value(m) => return ScriptError::Value(m.clone()),
                ScriptError::Signature(m) => return ScriptError::Signature(m.clone()),
                ScriptError::Runtime(m) => return ScriptError::Runtime(m.clone()),
                _ => {}
            }
        }
    }
    ScriptError::Runtime(rewrite(&root_message(&err)))
}

// ── Helpers ───────────────────────────────────────────────────────────────────

const MAX_DEPTH: usize = 64;
const MAX_PACKED_LEN: usize = 1 << 16;

pub fn lua_value_to_json(val: Value) -> Json {
    to_json(val, 0)
}

fn to_json(val: Value, depth: usize) -> Json {
    if depth > MAX_DEPTH {
        return Json::Null;
    }
    match val {
        Value::Nil => Json::Null,
        Value::Boolean(b) => Json::Bool(b),
        Value::Integer(i) => serde_json::json!(i),
        Value::Number(n) => serde_json::Number::from_f64(n).map_or(Json::Null, Json::Number),
        Value::String(s) => Json::String(s.to_string_lossy()),
        Value::Table(t) => {
            let pairs: Vec<_> = t.clone().pairs::<Value, Value>().filter_map(|p| p.ok()).collect();
            // a table whose keys are exactly 1..n is an array, or 1..n plus a
            // count field `n` when some entries are nil
            let (len, is_array) = match explicit_length(&t, &pairs) {
                Some(n) => (n, true),
                None => (t.raw_len(), pairs.len() == t.raw_len()),
            };
            if is_array {
                let items = (1..=len)
                    .map(|i| to_json(t.raw_get::<Value>(i).unwrap_or(Value::Nil), depth + 1))
                    .collect();
                Json::Array(items)
            } else {
                let mut map = serde_json::Map::new();
                for (k, v) in pairs {
                    let key = match k {
                        Value::String(ks) => ks.to_string_lossy(),
                        Value::Integer(i) => i.to_string(),
                        _ => continue,
                    };
                    map.insert(key, to_json(v, depth + 1));
                }
                Json::Object(map)
            }
        }
        Value::UserData(ud) => match ud.borrow::<GuardedObject>() {
            Ok(obj) => Json::String(describe(obj.object.as_ref())),
            Err(_) => Json::Null,
        },
        _ => Json::Null,
    }
}

/// Length of a `table.pack`-style table: integer keys within `1..=n` and the
/// `n` field itself.
fn explicit_length(t: &Table, pairs: &[(Value, Value)]) -> Option<usize> {
    let n = match t.raw_get::<Value>("n") {
        Ok(Value::Integer(n)) if n > 0 && n as usize <= MAX_PACKED_LEN => n as usize,
        _ => return None,
    };
    let mut indexed = false;
    for (key, _) in pairs {
        match key {
            Value::Integer(i) if *i >= 1 && *i as usize <= n => indexed = true,
            Value::String(s) if s.to_string_lossy() == "n" => {}
            _ => return None,
        }
    }
    indexed.then_some(n)
}

/// Arrays containing `null` carry an explicit `n` so scripts can see their
/// real length despite the holes.
pub fn json_to_lua_value(lua: &Lua, val: &Json) -> LuaResult<Value> {
    match val {
        Json::Null => Ok(Value::Nil),
        Json::Bool(b) => Ok(Value::Boolean(*b)),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::Integer(i))
            } else {
                Ok(Value::Number(n.as_f64().unwrap_or(0.0)))
            }
        }
        Json::String(s) => Ok(Value::String(lua.create_string(s.as_str())?)),
        Json::Array(arr) => {
            let t = lua.create_table()?;
            for (i, v) in arr.iter().enumerate() {
                t.set(i + 1, json_to_lua_value(lua, v)?)?;
            }
            if arr.iter().any(Json::is_null) {
                t.set("n", arr.len())?;
            }
            Ok(Value::Table(t))
        }
        Json::Object(obj) => {
            let t = lua.create_table()?;
            for (k, v) in obj {
                t.set(k.as_str(), json_to_lua_value(lua, v)?)?;
            }
            Ok(Value::Table(t))
        }
    }
}

pub fn host_value_to_lua(lua: &Lua, value: HostValue, security: &Arc<SecurityManager>) -> LuaResult<Value> {
    match value {
        HostValue::Data(json) => json_to_lua_value(lua, &json),
        HostValue::Object(object) => {
            let ud = lua.create_userdata(GuardedObject::new(object, Arc::clone(security)))?;
            Ok(Value::UserData(ud))
        }
        HostValue::Method => Ok(Value::Nil),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::SimpleObject;
    use crate::security::{Principal, MANAGER};
    use serde_json::json;

    fn setup(roles: &[&str]) -> (Lua, Table, PrintBuffer) {
        let lua = Lua::new();
        let env = lua.create_table().unwrap();
        let printed: PrintBuffer = Arc::new(Mutex::new(String::new()));
        let ctx = ApiContext {
            security: SecurityManager::with_roles(Principal::new("tester", roles)),
            allowed_modules: vec!["math".to_string(), "standard".to_string()],
            printed: Arc::clone(&printed),
        };
        register_all(&lua, &env, &ctx).unwrap();
        let folder = SimpleObject::new("Folder", &["site"])
            .with_attribute("title", json!("Site"))
            .with_protected_attribute("secret", json!("s3"), &[MANAGER])
            .with_method("add", |args| {
                let sum: i64 = args.iter().filter_map(Json::as_i64).sum();
                Ok(HostValue::Data(json!(sum)))
            })
            .into_shared();
        let ud = host_value_to_lua(&lua, HostValue::Object(folder), &ctx.security).unwrap();
        env.set("folder", ud).unwrap();
        (lua, env, printed)
    }

    fn eval(lua: &Lua, env: &Table, code: &str) -> LuaResult<Json> {
        let v: Value = lua.load(code).set_environment(env.clone()).eval()?;
        Ok(lua_value_to_json(v))
    }

    #[test]
    fn guarded_reads_and_methods() {
        let (lua, env, _) = setup(&[]);
        assert_eq!(eval(&lua, &env, "return folder.title").unwrap(), json!("Site"));
        assert_eq!(eval(&lua, &env, "return folder:add(1, 2, 3)").unwrap(), json!(6));
        assert_eq!(eval(&lua, &env, "return folder.add(4)").unwrap(), json!(4));
        assert_eq!(eval(&lua, &env, "return tostring(folder)").unwrap(), json!("<Folder at /site>"));
        assert_eq!(eval(&lua, &env, "return folder").unwrap(), json!("<Folder at /site>"));
        assert_eq!(eval(&lua, &env, "return folder.missing").unwrap(), Json::Null);
    }

    #[test]
    fn protected_attribute_needs_role() {
        let (lua, env, _) = setup(&[]);
        let err = eval(&lua, &env, "return folder.secret").unwrap_err();
        assert!(matches!(classify_error(err, str::to_string), ScriptError::Unauthorized(_)));

        let (lua, env, _) = setup(&[MANAGER]);
        assert_eq!(eval(&lua, &env, "return folder.secret").unwrap(), json!("s3"));
    }

    #[test]
    fn writes_and_private_names_are_refused() {
        let (lua, env, _) = setup(&[MANAGER]);
        let err = eval(&lua, &env, "folder.title = 'x'").unwrap_err();
        assert!(classify_error(err, str::to_string).is_authorization());
        let err = eval(&lua, &env, "return getattr(folder, '_p_jar')").unwrap_err();
        assert!(classify_error(err, str::to_string).is_authorization());
    }

    #[test]
    fn getattr_and_hasattr() {
        let (lua, env, _) = setup(&[]);
        assert_eq!(eval(&lua, &env, "return getattr(folder, 'title')").unwrap(), json!("Site"));
        assert_eq!(eval(&lua, &env, "return getattr(folder, 'nope', 7)").unwrap(), json!(7));
        assert_eq!(eval(&lua, &env, "return getattr({a = 1}, 'a')").unwrap(), json!(1));
        assert_eq!(eval(&lua, &env, "return getattr('abc', 'upper')('abc')").unwrap(), json!("ABC"));
        assert_eq!(eval(&lua, &env, "return hasattr(folder, 'secret')").unwrap(), json!(false));
        assert_eq!(eval(&lua, &env, "return hasattr(folder, 'title')").unwrap(), json!(true));
        assert!(eval(&lua, &env, "return getattr(folder, 'nope')").is_err());
    }

    #[test]
    fn require_honours_allowlist() {
        let (lua, env, _) = setup(&[]);
        assert_eq!(eval(&lua, &env, "return require('math').floor(2.5)").unwrap(), json!(2));
        assert_eq!(
            eval(&lua, &env, "return require('standard').html_quote('<b>')").unwrap(),
            json!("&lt;b&gt;")
        );
        let err = eval(&lua, &env, "return require('string')").unwrap_err();
        match classify_error(err, str::to_string) {
            ScriptError::Unauthorized(msg) => assert!(msg.contains("'string'")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn print_collects_output() {
        let (lua, env, printed) = setup(&[]);
        eval(&lua, &env, "print('a', 1) print(folder)").unwrap();
        assert_eq!(read_printed(&printed), "a\t1\n<Folder at /site>\n");
    }

    #[test]
    fn exit_becomes_value_error() {
        let (lua, env, _) = setup(&[]);
        let err = eval(&lua, &env, "os.exit(1)").unwrap_err();
        match classify_error(err, str::to_string) {
            ScriptError::Value(msg) => assert_eq!(msg, "SystemExit cannot be raised within a script"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn dangerous_globals_are_absent() {
        let (lua, env, _) = setup(&[]);
        for name in ["load", "dofile", "rawset", "setmetatable", "debug", "io"] {
            let code = format!("return {name}");
            assert_eq!(eval(&lua, &env, &code).unwrap(), Json::Null, "{name}");
        }
        assert_eq!(eval(&lua, &env, "return string.dump").unwrap(), Json::Null);
        assert_eq!(eval(&lua, &env, "return os.execute").unwrap(), Json::Null);
    }

    #[test]
    fn json_conversion_of_tables() {
        let lua = Lua::new();
        let v: Value = lua.load("return {1, 2, {a = true}}").eval().unwrap();
        assert_eq!(lua_value_to_json(v), json!([1, 2, {"a": true}]));
        let v = json_to_lua_value(&lua, &json!({"k": [1, "x"]})).unwrap();
        assert_eq!(lua_value_to_json(v), json!({"k": [1, "x"]}));
    }

    #[test]
    fn arrays_with_nulls_keep_their_length() {
        let lua = Lua::new();
        let v = json_to_lua_value(&lua, &json!([null, 2, null])).unwrap();
        let Value::Table(t) = &v else { panic!("expected a table") };
        assert_eq!(t.get::<i64>("n").unwrap(), 3);
        assert_eq!(t.get::<i64>(2).unwrap(), 2);
        assert_eq!(lua_value_to_json(v), json!([null, 2, null]));

        let v: Value = lua.load("return table.pack(1, nil, 3)").eval().unwrap();
        assert_eq!(lua_value_to_json(v), json!([1, null, 3]));
        let v: Value = lua.load("return {n = 2, label = 'x'}").eval().unwrap();
        assert_eq!(lua_value_to_json(v), json!({"n": 2, "label": "x"}));
        let v = json_to_lua_value(&lua, &json!([1, 2])).unwrap();
        let Value::Table(t) = v else { panic!("expected a table") };
        assert!(t.get::<Option<i64>>("n").unwrap().is_none());
    }

    #[test]
    fn tracebacks_are_cut_from_messages() {
        let err = mlua::Error::RuntimeError(
            "<string>:3: boom\nstack traceback:\n\t[C]: in function 'error'".to_string(),
        );
        match classify_error(err, str::to_string) {
            ScriptError::Runtime(msg) => assert_eq!(msg, "<string>:3: boom"),
            other => panic!("unexpected {other:?}"),
        }

        let (lua, env, _) = setup(&[]);
        let err = eval(&lua, &env, "local function f() error('deep') end f()").unwrap_err();
        match classify_error(err, str::to_string) {
            ScriptError::Runtime(msg) => {
                assert!(msg.ends_with("deep"), "{msg}");
                assert!(!msg.contains("stack traceback"), "{msg}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
