/// `host.rs` - host objects handed to scripts (context, container, ...).
///
/// Scripts never see host objects directly. Each one is wrapped in a guarded
/// userdata whose attribute reads consult the [`SecurityPolicy`] first, so
/// implementors only describe what exists and which roles may see it.
///
/// [`SecurityPolicy`]: crate::security::SecurityPolicy

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value as Json;

/// A value a host object (or a binding slot) exposes to script code.
#[derive(Clone)]
pub enum HostValue {
    /// Plain data, converted to Lua tables/strings/numbers.
    Data(Json),
    /// Another guarded host object.
    Object(Arc<dyn HostObject>),
    /// A callable member; calls go through [`HostObject::call_method`].
    Method,
}

impl fmt::Debug for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data(v) => write!(f, "Data({v})"),
            Self::Object(o) => write!(f, "Object({})", describe(o.as_ref())),
            Self::Method => f.write_str("Method"),
        }
    }
}

impl From<Json> for HostValue {
    fn from(v: Json) -> Self {
        Self::Data(v)
    }
}

/// An object of the surrounding host hierarchy.
pub trait HostObject: Send + Sync {
    fn meta_type(&self) -> &str;

    fn id(&self) -> &str;

    /// Path segments from the root, ending with this object's id.
    fn physical_path(&self) -> Vec<String>;

    /// Roles allowed to read this object's attributes.
    fn roles(&self) -> Vec<String>;

    /// Per-attribute override of [`HostObject::roles`].
    fn attribute_roles(&self, _name: &str) -> Option<Vec<String>> {
        None
    }

    fn attribute(&self, name: &str) -> Option<HostValue>;

    fn call_method(&self, name: &str, _args: Vec<Json>) -> Result<HostValue, String> {
        Err(format!("'{}' object attribute '{name}' is not callable", self.meta_type()))
    }
}

/// `<Folder at /a/b>` rendering used for `tostring` and JSON results.
pub fn describe(object: &dyn HostObject) -> String {
    let path: Vec<String> = object
        .physical_path()
        .into_iter()
        .filter(|segment| !segment.is_empty())
        .collect();
    format!("<{} at /{}>", object.meta_type(), path.join("/"))
}

pub type MethodFn = Arc<dyn Fn(Vec<Json>) -> Result<HostValue, String> + Send + Sync>;

/// General purpose host object, enough for folders and simple records.
#[derive(Clone)]
pub struct SimpleObject {
    meta_type: String,
    id: String,
    path: Vec<String>,
    roles: Vec<String>,
    attributes: BTreeMap<String, HostValue>,
    attribute_roles: BTreeMap<String, Vec<String>>,
    methods: BTreeMap<String, MethodFn>,
}

impl SimpleObject {
    pub fn new(meta_type: &str, path: &[&str]) -> Self {
        let path: Vec<String> = path.iter().map(|s| s.to_string()).collect();
        let id = path.last().cloned().unwrap_or_default();
        let mut attributes = BTreeMap::new();
        attributes.insert("id".to_string(), HostValue::Data(Json::String(id.clone())));
        Self {
            meta_type: meta_type.to_string(),
            id,
            path,
            roles: vec![crate::security::ANONYMOUS.to_string()],
            attributes,
            attribute_roles: BTreeMap::new(),
            methods: BTreeMap::new(),
        }
    }

    pub fn with_roles(mut self, roles: &[&str]) -> Self {
        self.roles = roles.iter().map(|r| r.to_string()).collect();
        self
    }

    pub fn with_attribute(mut self, name: &str, value: impl Into<HostValue>) -> Self {
        self.attributes.insert(name.to_string(), value.into());
        self
    }

    pub fn with_protected_attribute(
        mut self,
        name: &str,
        value: impl Into<HostValue>,
        roles: &[&str],
    ) -> Self {
        self.attributes.insert(name.to_string(), value.into());
        self.attribute_roles
            .insert(name.to_string(), roles.iter().map(|r| r.to_string()).collect());
        self
    }

    pub fn with_method<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(Vec<Json>) -> Result<HostValue, String> + Send + Sync + 'static,
    {
        self.attributes.insert(name.to_string(), HostValue::Method);
        self.methods.insert(name.to_string(), Arc::new(f));
        self
    }

    pub fn into_shared(self) -> Arc<dyn HostObject> {
        Arc::new(self)
    }
}

impl HostObject for SimpleObject {
    fn meta_type(&self) -> &str {
        &self.meta_type
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn physical_path(&self) -> Vec<String> {
        self.path.clone()
    }

    fn roles(&self) -> Vec<String> {
        self.roles.clone()
    }

    fn attribute_roles(&self, name: &str) -> Option<Vec<String>> {
        self.attribute_roles.get(name).cloned()
    }

    fn attribute(&self, name: &str) -> Option<HostValue> {
        self.attributes.get(name).cloned()
    }

    fn call_method(&self, name: &str, args: Vec<Json>) -> Result<HostValue, String> {
        match self.methods.get(name) {
            Some(f) => f(args),
            None => Err(format!("'{}' object attribute '{name}' is not callable", self.meta_type)),
        }
    }
}
