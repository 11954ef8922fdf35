/// `config.rs` - scripting configuration (persisted as JSON like other configs).

use serde::{Deserialize, Serialize};

/// Text encoding used to decode binary `write()` input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TextEncoding {
    #[default]
    #[serde(rename = "utf-8")]
    Utf8,
    #[serde(rename = "latin-1")]
    Latin1,
}

impl TextEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Utf8 => "utf-8",
            Self::Latin1 => "latin-1",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptingConfig {
    /// Module names a script may `require`.
    pub allowed_modules: Vec<String>,
    pub default_encoding: TextEncoding,
    /// Interpreter memory limit per invocation; `None` leaves it unbounded.
    pub memory_limit_bytes: Option<usize>,
    /// Whether the namespace binding participates in result cache keys.
    pub cache_key_includes_namespace: bool,
    /// Capacity of the in-memory cache manager.
    pub max_cache_entries: usize,
    /// Source written into a script created without one.
    pub default_source: String,
}

pub const DEFAULT_SOURCE: &str = "\
-- Example code:

-- Every attribute read on context and container is checked
-- against the caller's roles.
return \"This is the \" .. script.id .. \" script in \" .. container.id
";

impl Default for ScriptingConfig {
    fn default() -> Self {
        Self {
            allowed_modules: ["string", "table", "math", "utf8", "standard"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            default_encoding: TextEncoding::Utf8,
            memory_limit_bytes: Some(32 * 1024 * 1024),
            cache_key_includes_namespace: false,
            max_cache_entries: 1000,
            default_source: DEFAULT_SOURCE.to_string(),
        }
    }
}

impl ScriptingConfig {
    /// Parse a stored config. Missing fields fall back to their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn is_module_allowed(&self, name: &str) -> bool {
        self.allowed_modules.iter().any(|m| m == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg = ScriptingConfig::from_json(r#"{"allowed_modules":["math"]}"#).unwrap();
        assert_eq!(cfg.allowed_modules, vec!["math".to_string()]);
        assert_eq!(cfg.max_cache_entries, 1000);
        assert!(!cfg.cache_key_includes_namespace);
        assert!(cfg.is_module_allowed("math"));
        assert!(!cfg.is_module_allowed("string"));
    }

    #[test]
    fn encoding_uses_wire_names() {
        let cfg = ScriptingConfig {
            default_encoding: TextEncoding::Latin1,
            ..Default::default()
        };
        let json = cfg.to_json().unwrap();
        assert!(json.contains("\"latin-1\""));
        assert_eq!(ScriptingConfig::from_json(&json).unwrap(), cfg);
    }
}
