/// `scripting/engine.rs` - script registry
///
/// `ScriptEngine` owns every loaded `Script`, the shared result cache and the
/// version guard used when scripts come back from the database.
/// Each invocation still runs in its own isolated Lua VM.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use sqlx::sqlite::SqlitePool;

use crate::config::ScriptingConfig;
use crate::db::local as db;
use crate::error::{ScriptError, ScriptResult};
use crate::security::{SecurityManager, MANAGER};

use super::{
    cache::{CacheManager, RamCache},
    script::{Cacheable, Invocation, Script},
    version::VersionGuard,
};

/// Id of the throwaway script behind `restricted_exec`.
const ADHOC_ID: &str = "restricted_exec";

// ── Script run result ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptRunResult {
    pub success: bool,
    pub value: Option<Json>,
    pub error: Option<String>,
    pub error_line: Option<u32>,
}

impl ScriptRunResult {
    fn from_result(result: ScriptResult<Json>) -> Self {
        match result {
            Ok(value) => Self {
                success: true,
                value: Some(value),
                error: None,
                error_line: None,
            },
            Err(e) => {
                let error = e.to_string();
                Self {
                    success: false,
                    value: None,
                    error_line: parse_error_line(&error),
                    error: Some(error),
                }
            }
        }
    }

    fn failed(error: String) -> Self {
        Self {
            success: false,
            value: None,
            error: Some(error),
            error_line: None,
        }
    }
}

/// Last run of a script, kept for operators.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunInfo {
    pub last_run_at: Option<i64>,
    pub last_error: Option<String>,
}

// ── ScriptEngine ──────────────────────────────────────────────────────────────

/// Shared handle; clones see the same registry.
#[derive(Clone)]
pub struct ScriptEngine {
    scripts: Arc<RwLock<HashMap<String, Arc<Script>>>>,
    runs: Arc<Mutex<HashMap<String, RunInfo>>>,
    config: Arc<ScriptingConfig>,
    cache: Arc<dyn CacheManager>,
    guard: Arc<VersionGuard>,
}

impl ScriptEngine {
    pub fn new(config: ScriptingConfig) -> Self {
        Self::with_guard(config, VersionGuard::shared())
    }

    pub fn with_guard(config: ScriptingConfig, guard: Arc<VersionGuard>) -> Self {
        let cache: Arc<dyn CacheManager> = Arc::new(RamCache::new(config.max_cache_entries));
        Self {
            scripts: Arc::new(RwLock::new(HashMap::new())),
            runs: Arc::new(Mutex::new(HashMap::new())),
            config: Arc::new(config),
            cache,
            guard,
        }
    }

    pub fn config(&self) -> &ScriptingConfig {
        &self.config
    }

    // ── Registry ──────────────────────────────────────────────────────────

    /// Create a script; without `source` it gets the configured example text.
    /// An existing script with the same id is replaced.
    pub fn add_script(
        &self,
        id: &str,
        source: Option<&str>,
        security: &SecurityManager,
    ) -> ScriptResult<Arc<Script>> {
        let script = Script::new(id)?;
        script.write(source.unwrap_or(&self.config.default_source), security)?;
        let script = Arc::new(script);

        let previous = self
            .scripts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string(), Arc::clone(&script));
        if let Some(old) = previous {
            log::info!("[script] replaced {id}");
            old.invalidate_cache();
        }
        Ok(script)
    }

    pub fn get_script(&self, id: &str) -> Option<Arc<Script>> {
        self.scripts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// All scripts ordered by id.
    pub fn get_scripts(&self) -> Vec<Arc<Script>> {
        let mut scripts: Vec<Arc<Script>> = self
            .scripts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        scripts.sort_by(|a, b| a.id().cmp(b.id()));
        scripts
    }

    pub fn delete_script(&self, id: &str) -> Option<Arc<Script>> {
        let removed = self
            .scripts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        self.cache.invalidate(id);
        self.runs.lock().unwrap_or_else(PoisonError::into_inner).remove(id);
        removed
    }

    /// Attach or detach the shared result cache.
    pub fn set_caching(&self, id: &str, enabled: bool) -> ScriptResult<()> {
        let script = self.require(id)?;
        script.set_cache_manager(enabled.then(|| Arc::clone(&self.cache)));
        Ok(())
    }

    pub fn last_run(&self, id: &str) -> Option<RunInfo> {
        self.runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn require(&self, id: &str) -> ScriptResult<Arc<Script>> {
        self.get_script(id)
            .ok_or_else(|| ScriptError::NotFound(id.to_string()))
    }

    // ── Script execution ──────────────────────────────────────────────────

    pub fn invoke(
        &self,
        id: &str,
        security: &Arc<SecurityManager>,
        invocation: &Invocation,
    ) -> ScriptResult<Json> {
        self.require(id)?.invoke(&self.config, security, invocation)
    }

    /// Run a script off the async runtime and remember the outcome.
    pub async fn run_script(
        &self,
        id: &str,
        security: Arc<SecurityManager>,
        invocation: Invocation,
    ) -> ScriptRunResult {
        let script = match self.get_script(id) {
            Some(s) => s,
            None => return ScriptRunResult::failed(ScriptError::NotFound(id.to_string()).to_string()),
        };
        let config = Arc::clone(&self.config);

        // Lua is sync
        let result = tokio::task::spawn_blocking(move || {
            ScriptRunResult::from_result(script.invoke(&config, &security, &invocation))
        })
        .await
        .unwrap_or_else(|e| ScriptRunResult::failed(format!("Script task panicked: {e}")));

        self.runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id.to_string(),
                RunInfo {
                    last_run_at: Some(chrono::Utc::now().timestamp()),
                    last_error: result.error.clone(),
                },
            );
        result
    }

    /// Execute `body` once with the keys of `varmap` as parameters.
    ///
    /// The default bindings stay active and are filled from `invocation`,
    /// whose own arguments are replaced by the varmap values. A key that
    /// shadows a bound name is a compile error.
    pub fn restricted_exec(
        &self,
        body: &str,
        varmap: &Map<String, Json>,
        invocation: &Invocation,
        security: &Arc<SecurityManager>,
    ) -> ScriptResult<Json> {
        let script = Script::new(ADHOC_ID)?;
        let params = varmap.keys().map(String::as_str).collect::<Vec<_>>().join(", ");
        script.edit(&params, body, security)?;
        if !script.is_executable() {
            return Err(ScriptError::Compile(script.errors()));
        }

        let invocation = Invocation {
            args: varmap.values().cloned().collect(),
            kwargs: Map::new(),
            ..invocation.clone()
        };
        script.invoke(&self.config, security, &invocation)
    }

    // ── Persistence ───────────────────────────────────────────────────────

    /// Load every stored script; stale artifacts are rebuilt on the way in.
    pub async fn load_from_db(&self, pool: &SqlitePool) -> ScriptResult<usize> {
        let states = db::load_scripts(pool).await?;
        let mut loaded = Vec::with_capacity(states.len());
        for state in states {
            let script = Script::from_state(state, &self.guard)?;
            loaded.push((script.id().to_string(), Arc::new(script)));
        }
        let count = loaded.len();
        self.scripts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(loaded);
        log::info!("[scripts_db] loaded {count} scripts");
        Ok(count)
    }

    pub async fn save_script(&self, pool: &SqlitePool, id: &str) -> ScriptResult<()> {
        let script = self.require(id)?;
        db::save_script(pool, &script.to_state()).await?;
        script.mark_clean();
        Ok(())
    }

    /// Persist every script rebuilt at load time. Managers only.
    pub async fn recompile(
        &self,
        pool: &SqlitePool,
        security: &SecurityManager,
    ) -> ScriptResult<String> {
        let principal = security.principal();
        if !principal.has_role(MANAGER) {
            return Err(ScriptError::Unauthorized(format!(
                "{} may not recompile scripts",
                principal.name
            )));
        }

        let mut names = Vec::new();
        for script in self.get_scripts() {
            if script.is_dirty() {
                self.save_script(pool, script.id()).await?;
                names.push(script.id().to_string());
            }
        }
        if names.is_empty() {
            return Ok("No scripts were found that required recompilation.".to_string());
        }
        log::info!("[scripts_db] recompiled {} scripts", names.len());
        Ok(format!(
            "The following scripts were recompiled:\n{}",
            names.join("\n")
        ))
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Line number from a script diagnostic (`Script "x", line 5: ...` or `Line 5: ...`).
fn parse_error_line(err: &str) -> Option<u32> {
    let lower = err.to_ascii_lowercase();
    let start = lower.find("line ")? + "line ".len();
    let digits: String = err[start..].chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}
