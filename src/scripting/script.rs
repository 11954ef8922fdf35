/// `scripting/script.rs` - the persisted script entity.
///
/// A `Script` owns its source, its compiled artifact and its diagnostics.
/// All source changes go through the authorized write path: proxy roles are
/// validated, the text is parsed, and only a real change of parameters, body
/// or bindings recompiles. Compilation happens under the entity's write lock;
/// invocation only holds the read lock long enough to clone what it needs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::config::{ScriptingConfig, TextEncoding};
use crate::error::{ScriptError, ScriptResult};
use crate::host::{HostObject, HostValue};
use crate::security::{SecurityManager, ANONYMOUS};

use super::bindings::{is_reserved_id, BindingAssignments, BindingSlot};
use super::cache::{fingerprint, CacheKey, CacheManager, KeyParts};
use super::compiler::{self, code_digest, CompiledArtifact};
use super::directives::{self, Directive, RenderSource};
use super::proxy::{validate_proxy, validate_proxy_change};
use super::sandbox::{self, Execution};
use super::signature::{self, Signature};
use super::version::{VersionGuard, VersionStamps};

pub const META_TYPE: &str = "Script (Lua)";

/// Revisions kept in memory per script.
const MAX_REVISIONS: usize = 50;

// ── Persisted state ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptState {
    pub id: String,
    pub title: String,
    pub params: String,
    pub body: String,
    pub bindings: BindingAssignments,
    pub proxy_roles: Vec<String>,
    pub code: Option<Vec<u8>>,
    pub signature: Option<Signature>,
    pub code_digest: Option<String>,
    pub stamps: Option<VersionStamps>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub modified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    pub serial: usize,
    pub saved_at: DateTime<Utc>,
    /// `read()` text at the time of the change.
    pub source: String,
}

// ── Invocation ────────────────────────────────────────────────────────────────

/// Values for one call: binding slot values plus the arguments.
#[derive(Clone, Default)]
pub struct Invocation {
    pub context: Option<Arc<dyn HostObject>>,
    pub container: Option<Arc<dyn HostObject>>,
    pub namespace: Option<Json>,
    pub subpath: Vec<String>,
    pub args: Vec<Json>,
    pub kwargs: Map<String, Json>,
}

impl Invocation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_context(mut self, context: Arc<dyn HostObject>) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_container(mut self, container: Arc<dyn HostObject>) -> Self {
        self.container = Some(container);
        self
    }

    pub fn with_namespace(mut self, namespace: Json) -> Self {
        self.namespace = Some(namespace);
        self
    }

    pub fn with_subpath(mut self, subpath: &[&str]) -> Self {
        self.subpath = subpath.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn arg(mut self, value: Json) -> Self {
        self.args.push(value);
        self
    }

    pub fn kwarg(mut self, name: &str, value: Json) -> Self {
        self.kwargs.insert(name.to_string(), value);
        self
    }

    /// Physical path of the object holding the script.
    pub fn container_path(&self) -> Vec<String> {
        self.container
            .as_ref()
            .map(|c| c.physical_path())
            .unwrap_or_default()
    }

    fn bound_names(
        &self,
        bindings: &BindingAssignments,
        script: Arc<dyn HostObject>,
    ) -> HashMap<String, HostValue> {
        let mut names = HashMap::new();
        for slot in BindingSlot::ALL {
            let Some(name) = bindings.name_for(slot) else {
                continue;
            };
            let value = match slot {
                BindingSlot::Context => self.context.clone().map(HostValue::Object),
                BindingSlot::Container => self.container.clone().map(HostValue::Object),
                BindingSlot::Script => Some(HostValue::Object(Arc::clone(&script))),
                BindingSlot::Namespace => Some(HostValue::Data(
                    self.namespace.clone().unwrap_or_else(|| Json::Object(Map::new())),
                )),
                BindingSlot::Subpath => Some(HostValue::Data(Json::from(self.subpath.clone()))),
            };
            if let Some(value) = value {
                names.insert(name.to_string(), value);
            }
        }
        names
    }
}

/// Read-only view of a script bound into its own scope.
struct ScriptHandle {
    id: String,
    title: String,
    params: String,
    path: Vec<String>,
}

impl HostObject for ScriptHandle {
    fn meta_type(&self) -> &str {
        META_TYPE
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn physical_path(&self) -> Vec<String> {
        self.path.clone()
    }

    fn roles(&self) -> Vec<String> {
        vec![ANONYMOUS.to_string()]
    }

    fn attribute(&self, name: &str) -> Option<HostValue> {
        let value = match name {
            "id" => self.id.as_str(),
            "title" => self.title.as_str(),
            "meta_type" => META_TYPE,
            "params" => self.params.as_str(),
            _ => return None,
        };
        Some(HostValue::Data(Json::String(value.to_string())))
    }
}

// ── Capability interfaces ─────────────────────────────────────────────────────

/// Participation in a result cache.
pub trait Cacheable {
    fn set_cache_manager(&self, manager: Option<Arc<dyn CacheManager>>);
    fn is_caching_enabled(&self) -> bool;
    fn invalidate_cache(&self);
}

/// Proxy role management guarded by the caller's own roles.
pub trait ProxyProtected {
    fn proxy_roles(&self) -> Vec<String>;
    fn have_proxy(&self, role: &str) -> bool;
    fn validate_proxy(&self, security: &SecurityManager) -> ScriptResult<()>;
    fn set_proxy_roles(&self, roles: Vec<String>, security: &SecurityManager) -> ScriptResult<()>;
}

/// In-memory revision history of the source text.
pub trait Historical {
    fn revisions(&self) -> Vec<Revision>;
    /// Restore a revision through the authorized write path.
    fn restore_revision(&self, serial: usize, security: &SecurityManager) -> ScriptResult<()>;
}

// ── Script ────────────────────────────────────────────────────────────────────

struct ScriptInner {
    title: String,
    params: String,
    body: String,
    bindings: BindingAssignments,
    proxy_roles: Vec<String>,
    code: Option<Arc<CompiledArtifact>>,
    stamps: Option<VersionStamps>,
    errors: Vec<String>,
    warnings: Vec<String>,
    /// Artifact rebuilt at load time and not yet persisted.
    dirty: bool,
    /// Loaded from a stale state; the next write recompiles even when the
    /// source is unchanged.
    needs_rebuild: bool,
    cache: Option<Arc<dyn CacheManager>>,
    modified_at: DateTime<Utc>,
    revisions: Vec<Revision>,
    next_serial: usize,
}

impl ScriptInner {
    fn empty() -> Self {
        Self {
            title: String::new(),
            params: String::new(),
            body: String::new(),
            bindings: BindingAssignments::default(),
            proxy_roles: Vec::new(),
            code: None,
            stamps: None,
            errors: Vec::new(),
            warnings: Vec::new(),
            dirty: false,
            needs_rebuild: false,
            cache: None,
            modified_at: Utc::now(),
            revisions: Vec::new(),
            next_serial: 1,
        }
    }

    fn invalidate_cache(&self, id: &str) {
        if let Some(cache) = &self.cache {
            cache.invalidate(id);
        }
    }
}

pub struct Script {
    id: String,
    inner: RwLock<ScriptInner>,
    compiles: AtomicUsize,
}

impl Script {
    /// An empty script; compiles immediately.
    pub fn new(id: &str) -> ScriptResult<Self> {
        let script = Self::with_inner(id, ScriptInner::empty())?;
        {
            let mut inner = script.write_inner();
            script.compile_locked(&mut inner);
        }
        Ok(script)
    }

    fn with_inner(id: &str, inner: ScriptInner) -> ScriptResult<Self> {
        if is_reserved_id(id) {
            return Err(ScriptError::ReservedId(id.to_string()));
        }
        Ok(Self {
            id: id.to_string(),
            inner: RwLock::new(inner),
            compiles: AtomicUsize::new(0),
        })
    }

    fn read_inner(&self) -> RwLockReadGuard<'_, ScriptInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_inner(&self) -> RwLockWriteGuard<'_, ScriptInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn meta_type(&self) -> &'static str {
        META_TYPE
    }

    fn compile_locked(&self, inner: &mut ScriptInner) {
        self.compiles.fetch_add(1, Ordering::SeqCst);
        inner.invalidate_cache(&self.id);

        let globals = inner.bindings.assigned_names_in_order();
        let out = compiler::compile(&inner.params, &inner.body, &self.id, &globals);
        inner.warnings = out.warnings;
        match out.artifact {
            Some(artifact) => {
                inner.code = Some(artifact);
                inner.errors.clear();
                inner.stamps = Some(VersionStamps::current());
                inner.needs_rebuild = false;
            }
            None => {
                if let Some(first) = out.errors.first() {
                    log::warn!("[script] {} failed to compile: {}", self.id, first);
                }
                inner.code = None;
                inner.errors = out.errors;
            }
        }
    }

    fn record_revision(&self, inner: &mut ScriptInner) {
        let source = self.render(inner);
        let serial = inner.next_serial;
        inner.next_serial += 1;
        inner.revisions.push(Revision {
            serial,
            saved_at: Utc::now(),
            source,
        });
        if inner.revisions.len() > MAX_REVISIONS {
            inner.revisions.remove(0);
        }
    }

    // ── Authorized write path ─────────────────────────────────────────────

    /// Replace the script from `read()`-style text.
    pub fn write(&self, text: &str, security: &SecurityManager) -> ScriptResult<()> {
        let mut inner = self.write_inner();
        validate_proxy(&self.id, &inner.proxy_roles, security)?;
        self.apply_source(&mut inner, text, None)
    }

    /// Binary input is decoded with `encoding` first.
    pub fn write_bytes(
        &self,
        bytes: &[u8],
        encoding: TextEncoding,
        security: &SecurityManager,
    ) -> ScriptResult<()> {
        let text = match encoding {
            TextEncoding::Utf8 => String::from_utf8(bytes.to_vec())
                .map_err(|_| ScriptError::Encoding(encoding.as_str().to_string()))?,
            TextEncoding::Latin1 => bytes.iter().map(|&b| b as char).collect(),
        };
        self.write(&text, security)
    }

    /// Set parameters and body directly.
    pub fn edit(&self, params: &str, body: &str, security: &SecurityManager) -> ScriptResult<()> {
        let mut inner = self.write_inner();
        validate_proxy(&self.id, &inner.proxy_roles, security)?;
        self.apply_source(&mut inner, body, Some(params.trim()))
    }

    fn apply_source(
        &self,
        inner: &mut ScriptInner,
        text: &str,
        params: Option<&str>,
    ) -> ScriptResult<()> {
        let mut new_params = params.unwrap_or(&inner.params).to_string();
        let current = directives::metadata_map(&inner.title, &new_params, &inner.bindings);
        let parsed = directives::parse(text, &current).inspect_err(|e| {
            log::error!("[script] write failed for {}: {e}", self.id);
        })?;

        let mut title = inner.title.clone();
        let mut bindings = inner.bindings.clone();
        for (directive, value) in parsed.changes {
            match directive {
                Directive::Title => title = value,
                Directive::Parameters => new_params = value,
                Directive::Bind(slot) => bindings.assign(slot, &value),
            }
        }

        let code_changed =
            new_params != inner.params || parsed.body != inner.body || bindings != inner.bindings;
        let title_changed = title != inner.title;
        if !code_changed && !title_changed && !inner.needs_rebuild {
            return Ok(());
        }

        inner.title = title;
        inner.params = new_params;
        inner.body = parsed.body;
        inner.bindings = bindings;
        if code_changed || inner.needs_rebuild {
            self.compile_locked(inner);
        } else {
            inner.invalidate_cache(&self.id);
        }
        inner.modified_at = Utc::now();
        self.record_revision(inner);
        Ok(())
    }

    pub fn set_title(&self, title: &str, security: &SecurityManager) -> ScriptResult<()> {
        let mut inner = self.write_inner();
        validate_proxy(&self.id, &inner.proxy_roles, security)?;
        if inner.title != title {
            inner.title = title.to_string();
            inner.invalidate_cache(&self.id);
            inner.modified_at = Utc::now();
            self.record_revision(&mut inner);
        }
        Ok(())
    }

    pub fn set_bindings(
        &self,
        bindings: BindingAssignments,
        security: &SecurityManager,
    ) -> ScriptResult<()> {
        if let Some((_, name)) = bindings
            .iter()
            .find(|(_, name)| !name.is_empty() && !signature::is_identifier(name))
        {
            return Err(ScriptError::DirectiveParse(format!("Invalid binding name {name:?}")));
        }
        let mut inner = self.write_inner();
        validate_proxy(&self.id, &inner.proxy_roles, security)?;
        if inner.bindings != bindings {
            inner.bindings = bindings;
            self.compile_locked(&mut inner);
            inner.modified_at = Utc::now();
            self.record_revision(&mut inner);
        }
        Ok(())
    }

    // ── Accessors ─────────────────────────────────────────────────────────

    fn render(&self, inner: &ScriptInner) -> String {
        let metadata = directives::metadata_map(&inner.title, &inner.params, &inner.bindings);
        directives::render(&RenderSource {
            meta_type: META_TYPE,
            id: &self.id,
            metadata: &metadata,
            errors: &inner.errors,
            warnings: &inner.warnings,
            body: &inner.body,
        })
    }

    /// Source text with the full header.
    pub fn read(&self) -> String {
        self.render(&self.read_inner())
    }

    pub fn size(&self) -> usize {
        self.read().len()
    }

    pub fn title(&self) -> String {
        self.read_inner().title.clone()
    }

    pub fn params(&self) -> String {
        self.read_inner().params.clone()
    }

    pub fn body(&self) -> String {
        self.read_inner().body.clone()
    }

    pub fn bindings(&self) -> BindingAssignments {
        self.read_inner().bindings.clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.read_inner().errors.clone()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.read_inner().warnings.clone()
    }

    pub fn modified_at(&self) -> DateTime<Utc> {
        self.read_inner().modified_at
    }

    /// Signature of the compiled function; `None` while it has errors.
    pub fn signature(&self) -> Option<Signature> {
        self.read_inner().code.as_ref().map(|c| c.signature.clone())
    }

    pub fn is_executable(&self) -> bool {
        self.read_inner().code.is_some()
    }

    /// Text searched by catalog-style indexes.
    pub fn search_source(&self) -> String {
        let inner = self.read_inner();
        format!("{}\n{}", inner.params, inner.body)
    }

    pub fn try_params(&self) -> Vec<String> {
        signature::try_params(&self.read_inner().params)
    }

    pub fn filepath(&self, container_path: &[String]) -> String {
        let mut path: Vec<&str> = container_path
            .iter()
            .map(String::as_str)
            .filter(|s| !s.is_empty())
            .collect();
        path.push(&self.id);
        format!("{META_TYPE}:/{}", path.join("/"))
    }

    pub fn is_dirty(&self) -> bool {
        self.read_inner().dirty
    }

    pub fn mark_clean(&self) {
        self.write_inner().dirty = false;
    }

    /// Number of compiles run on this instance.
    pub fn compile_count(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }

    // ── Invocation ────────────────────────────────────────────────────────

    pub fn invoke(
        &self,
        config: &ScriptingConfig,
        security: &Arc<SecurityManager>,
        invocation: &Invocation,
    ) -> ScriptResult<Json> {
        let (code, bindings, proxy_roles, cache, handle) = {
            let inner = self.read_inner();
            let handle = ScriptHandle {
                id: self.id.clone(),
                title: inner.title.clone(),
                params: inner.params.clone(),
                path: {
                    let mut p = invocation.container_path();
                    p.push(self.id.clone());
                    p
                },
            };
            (
                inner.code.clone(),
                inner.bindings.clone(),
                inner.proxy_roles.clone(),
                inner.cache.clone(),
                handle,
            )
        };

        let Some(code) = code else {
            return Err(ScriptError::NotExecutable { id: self.id.clone() });
        };

        let cache_key = cache.as_ref().map(|_| CacheKey {
            script_id: self.id.clone(),
            fingerprint: self.fingerprint(config, &bindings, invocation),
        });
        if let (Some(cache), Some(key)) = (&cache, &cache_key) {
            if let Some(hit) = cache.get(key) {
                log::debug!("[script] cache hit for {}", self.id);
                return Ok(hit);
            }
        }

        let arguments = code.signature.bind(&self.id, &invocation.args, &invocation.kwargs)?;
        let bound_names = invocation.bound_names(&bindings, Arc::new(handle));
        let filepath = self.filepath(&invocation.container_path());

        let result = {
            let _ctx = security.add_context(&self.id, &proxy_roles);
            sandbox::execute(
                Execution {
                    script_id: &self.id,
                    artifact: &code,
                    bound_names: &bound_names,
                    arguments,
                    filepath,
                },
                config,
                security,
            )?
        };

        if let (Some(cache), Some(key)) = (cache, cache_key) {
            cache.set(key, result.clone());
        }
        Ok(result)
    }

    fn fingerprint(
        &self,
        config: &ScriptingConfig,
        bindings: &BindingAssignments,
        invocation: &Invocation,
    ) -> String {
        let parts = KeyParts {
            context: bindings
                .name_for(BindingSlot::Context)
                .map(|name| (name, invocation.container_path())),
            subpath: bindings
                .name_for(BindingSlot::Subpath)
                .map(|name| (name, invocation.subpath.clone())),
            namespace: bindings
                .name_for(BindingSlot::Namespace)
                .filter(|_| config.cache_key_includes_namespace)
                .map(|name| (name, invocation.namespace.clone().unwrap_or(Json::Null))),
            args: &invocation.args,
        };
        fingerprint(&invocation.kwargs, parts)
    }

    // ── Persistence ───────────────────────────────────────────────────────

    pub fn to_state(&self) -> ScriptState {
        let inner = self.read_inner();
        ScriptState {
            id: self.id.clone(),
            title: inner.title.clone(),
            params: inner.params.clone(),
            body: inner.body.clone(),
            bindings: inner.bindings.clone(),
            proxy_roles: inner.proxy_roles.clone(),
            code: inner.code.as_ref().map(|c| c.bytecode.clone()),
            signature: inner.code.as_ref().map(|c| c.signature.clone()),
            code_digest: inner.code.as_ref().map(|c| c.digest()),
            stamps: inner.stamps.clone(),
            errors: inner.errors.clone(),
            warnings: inner.warnings.clone(),
            modified_at: inner.modified_at,
        }
    }

    /// Restore a persisted script, rebuilding stale artifacts.
    pub fn from_state(state: ScriptState, guard: &VersionGuard) -> ScriptResult<Self> {
        let digest_ok = match (&state.code, &state.code_digest) {
            (Some(code), Some(digest)) => code_digest(code) == *digest,
            (None, _) => true,
            (Some(_), None) => false,
        };
        let stale = !guard.is_current(state.stamps.as_ref()) || !digest_ok;

        let mut inner = ScriptInner::empty();
        inner.title = state.title;
        inner.params = state.params;
        inner.body = state.body;
        inner.bindings = state.bindings;
        inner.proxy_roles = state.proxy_roles;
        inner.stamps = state.stamps;
        inner.errors = state.errors;
        inner.warnings = state.warnings;
        inner.modified_at = state.modified_at;

        let script = Self::with_inner(&state.id, inner)?;
        {
            let mut inner = script.write_inner();
            match (stale, state.code, state.signature) {
                (false, Some(bytecode), Some(signature)) => {
                    inner.code = Some(Arc::new(CompiledArtifact { bytecode, signature }));
                }
                (false, None, _) => inner.code = None,
                _ => {
                    guard.complain_once();
                    inner.body = directives::normalize_body(&inner.body);
                    script.compile_locked(&mut inner);
                    inner.dirty = true;
                    inner.needs_rebuild = true;
                }
            }
        }
        Ok(script)
    }
}

impl Cacheable for Script {
    fn set_cache_manager(&self, manager: Option<Arc<dyn CacheManager>>) {
        let mut inner = self.write_inner();
        inner.invalidate_cache(&self.id);
        inner.cache = manager;
    }

    fn is_caching_enabled(&self) -> bool {
        self.read_inner().cache.is_some()
    }

    fn invalidate_cache(&self) {
        self.read_inner().invalidate_cache(&self.id);
    }
}

impl ProxyProtected for Script {
    fn proxy_roles(&self) -> Vec<String> {
        self.read_inner().proxy_roles.clone()
    }

    fn have_proxy(&self, role: &str) -> bool {
        self.read_inner().proxy_roles.iter().any(|r| r == role)
    }

    fn validate_proxy(&self, security: &SecurityManager) -> ScriptResult<()> {
        validate_proxy(&self.id, &self.read_inner().proxy_roles, security)
    }

    fn set_proxy_roles(&self, roles: Vec<String>, security: &SecurityManager) -> ScriptResult<()> {
        let mut inner = self.write_inner();
        validate_proxy_change(&self.id, &inner.proxy_roles, &roles, security)?;
        inner.invalidate_cache(&self.id);
        inner.proxy_roles = roles;
        inner.modified_at = Utc::now();
        Ok(())
    }
}

impl Historical for Script {
    fn revisions(&self) -> Vec<Revision> {
        self.read_inner().revisions.clone()
    }

    fn restore_revision(&self, serial: usize, security: &SecurityManager) -> ScriptResult<()> {
        let source = self
            .read_inner()
            .revisions
            .iter()
            .find(|r| r.serial == serial)
            .map(|r| r.source.clone())
            .ok_or_else(|| ScriptError::NotFound(format!("{} revision {serial}", self.id)))?;
        self.write(&source, security)
    }
}
