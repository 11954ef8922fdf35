/// `scripting/signature.rs` - parameter declarations and argument binding.
///
/// Declarations look like `a, b=1, *rest, **options`. Defaults are literals
/// only. Binding positional and keyword arguments follows the rules of a
/// native function of the same signature; the result is the ordered argument
/// list of the generated Lua function, where `*rest` arrives as an array
/// table and `**options` as a table.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::error::ScriptError;

const LUA_KEYWORDS: [&str; 22] = [
    "and", "break", "do", "else", "elseif", "end", "false", "for", "function", "goto", "if", "in",
    "local", "nil", "not", "or", "repeat", "return", "then", "true", "until", "while",
];

pub fn is_keyword(name: &str) -> bool {
    LUA_KEYWORDS.contains(&name)
}

/// A Lua name that is not a keyword.
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_') && !is_keyword(name)
}

/// Default value of a parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Literal {
    Nil,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    String(String),
}

impl Literal {
    fn parse(text: &str) -> Option<Self> {
        match text {
            "nil" | "None" => return Some(Self::Nil),
            "true" | "True" => return Some(Self::Boolean(true)),
            "false" | "False" => return Some(Self::Boolean(false)),
            _ => {}
        }
        if let Some(s) = parse_quoted(text) {
            return Some(Self::String(s));
        }
        if let Ok(i) = text.parse::<i64>() {
            return Some(Self::Integer(i));
        }
        text.parse::<f64>()
            .ok()
            .filter(|n| n.is_finite())
            .map(Self::Number)
    }

    pub fn to_json(&self) -> Json {
        match self {
            Self::Nil => Json::Null,
            Self::Boolean(b) => Json::Bool(*b),
            Self::Integer(i) => Json::from(*i),
            Self::Number(n) => serde_json::Number::from_f64(*n).map_or(Json::Null, Json::Number),
            Self::String(s) => Json::String(s.clone()),
        }
    }
}

fn parse_quoted(text: &str) -> Option<String> {
    let quote = text.chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let inner = text.strip_prefix(quote)?.strip_suffix(quote)?;
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next()? {
                'n' => out.push('\n'),
                't' => out.push('\t'),
                'r' => out.push('\r'),
                other => out.push(other),
            },
            c if c == quote => return None,
            c => out.push(c),
        }
    }
    Some(out)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub default: Option<Literal>,
}

/// Parsed parameter list of a script.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    pub params: Vec<Parameter>,
    pub varargs: Option<String>,
    pub varkw: Option<String>,
}

/// Split on commas outside of quotes.
fn split_top_level(text: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        match quote {
            Some(_) if escaped => escaped = false,
            Some(_) if c == '\\' => escaped = true,
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '"' || c == '\'' => quote = Some(c),
            None if c == ',' => {
                parts.push(&text[start..i]);
                start = i + 1;
            }
            None => {}
        }
    }
    parts.push(&text[start..]);
    parts
}

fn check_name(name: &str) -> Result<(), String> {
    if name.starts_with('_') && name.len() > 1 {
        return Err(format!(
            "\"{name}\" is an invalid variable name because it starts with \"_\""
        ));
    }
    if !is_identifier(name) {
        return Err(format!("invalid parameter name \"{name}\""));
    }
    Ok(())
}

impl Signature {
    /// Parse a declaration; the error is a single diagnostic line.
    pub fn parse(text: &str) -> Result<Self, String> {
        let mut sig = Signature::default();
        if text.trim().is_empty() {
            return Ok(sig);
        }
        for part in split_top_level(text) {
            let part = part.trim();
            if part.is_empty() {
                return Err("Line 1: invalid syntax in parameter list".to_string());
            }
            if sig.varkw.is_some() {
                return Err(format!("Line 1: parameter \"{part}\" follows **{}", sig.varkw.as_deref().unwrap_or_default()));
            }
            if let Some(name) = part.strip_prefix("**") {
                let name = name.trim();
                check_name(name).map_err(|e| format!("Line 1: {e}"))?;
                sig.ensure_unique(name)?;
                sig.varkw = Some(name.to_string());
                continue;
            }
            if let Some(name) = part.strip_prefix('*') {
                let name = name.trim();
                if sig.varargs.is_some() {
                    return Err("Line 1: only one *name parameter is allowed".to_string());
                }
                check_name(name).map_err(|e| format!("Line 1: {e}"))?;
                sig.ensure_unique(name)?;
                sig.varargs = Some(name.to_string());
                continue;
            }
            if sig.varargs.is_some() {
                return Err(format!("Line 1: parameter \"{part}\" follows *{}", sig.varargs.as_deref().unwrap_or_default()));
            }
            let (name, default) = match part.split_once('=') {
                Some((name, value)) => {
                    let value = value.trim();
                    let literal = Literal::parse(value)
                        .ok_or_else(|| format!("Line 1: default value {value} is not a literal"))?;
                    (name.trim(), Some(literal))
                }
                None => (part, None),
            };
            check_name(name).map_err(|e| format!("Line 1: {e}"))?;
            sig.ensure_unique(name)?;
            if default.is_none() && sig.params.iter().any(|p| p.default.is_some()) {
                return Err(format!(
                    "Line 1: non-default argument \"{name}\" follows default argument"
                ));
            }
            sig.params.push(Parameter {
                name: name.to_string(),
                default,
            });
        }
        Ok(sig)
    }

    fn ensure_unique(&self, name: &str) -> Result<(), String> {
        if self.varnames().iter().any(|n| n == name) {
            return Err(format!("Line 1: duplicate argument '{name}' in function definition"));
        }
        Ok(())
    }

    /// Number of regular (non-star) parameters.
    pub fn argcount(&self) -> usize {
        self.params.len()
    }

    /// Regular parameters, then `*name`, then `**name`.
    pub fn varnames(&self) -> Vec<String> {
        self.params
            .iter()
            .map(|p| p.name.clone())
            .chain(self.varargs.clone())
            .chain(self.varkw.clone())
            .collect()
    }

    /// Defaults of the trailing parameters that have one.
    pub fn defaults(&self) -> Vec<Literal> {
        self.params.iter().filter_map(|p| p.default.clone()).collect()
    }

    /// Parameter list of the generated Lua function.
    pub fn lua_parameter_list(&self) -> String {
        self.varnames().join(", ")
    }

    /// Arrange `args` and `kwargs` in the order of [`Signature::varnames`].
    pub fn bind(&self, name: &str, args: &[Json], kwargs: &Map<String, Json>) -> Result<Vec<Json>, ScriptError> {
        let argcount = self.argcount();
        if args.len() > argcount && self.varargs.is_none() {
            return Err(ScriptError::Signature(format!(
                "{name}() takes {argcount} positional argument{} but {} {} given",
                if argcount == 1 { "" } else { "s" },
                args.len(),
                if args.len() == 1 { "was" } else { "were" },
            )));
        }

        let mut slots: Vec<Option<Json>> = vec![None; argcount];
        for (slot, value) in slots.iter_mut().zip(args) {
            *slot = Some(value.clone());
        }

        let mut extra_kw = Map::new();
        for (key, value) in kwargs {
            match self.params.iter().position(|p| &p.name == key) {
                Some(i) if slots[i].is_some() => {
                    return Err(ScriptError::Signature(format!(
                        "{name}() got multiple values for argument '{key}'"
                    )))
                }
                Some(i) => slots[i] = Some(value.clone()),
                None if self.varkw.is_some() => {
                    extra_kw.insert(key.clone(), value.clone());
                }
                None => {
                    return Err(ScriptError::Signature(format!(
                        "{name}() got an unexpected keyword argument '{key}'"
                    )))
                }
            }
        }

        let mut bound = Vec::with_capacity(argcount + 2);
        for (param, slot) in self.params.iter().zip(slots) {
            match (slot, &param.default) {
                (Some(value), _) => bound.push(value),
                (None, Some(default)) => bound.push(default.to_json()),
                (None, None) => {
                    return Err(ScriptError::Signature(format!(
                        "{name}() missing required argument: '{}'",
                        param.name
                    )))
                }
            }
        }
        if self.varargs.is_some() {
            bound.push(Json::Array(args.iter().skip(argcount).cloned().collect()));
        }
        if self.varkw.is_some() {
            bound.push(Json::Object(extra_kw));
        }
        Ok(bound)
    }
}

/// Plain parameter names suitable for a test form; works on malformed text.
pub fn try_params(text: &str) -> Vec<String> {
    text.split(',')
        .map(str::trim)
        .filter(|p| {
            p.chars()
                .next()
                .is_some_and(|c| c != '*' && (c.is_alphanumeric() || c == '_'))
        })
        .map(|p| p.split('=').next().unwrap_or(p).trim().to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_full_declaration() {
        let sig = Signature::parse("a, b='x,y', c=2.5, *rest, **opts").unwrap();
        assert_eq!(sig.argcount(), 3);
        assert_eq!(sig.varnames(), vec!["a", "b", "c", "rest", "opts"]);
        assert_eq!(
            sig.defaults(),
            vec![Literal::String("x,y".to_string()), Literal::Number(2.5)]
        );
        assert_eq!(sig.lua_parameter_list(), "a, b, c, rest, opts");
    }

    #[test]
    fn rejects_malformed_declarations() {
        for bad in ["a, a", "a=1, b", "_x", "end", "a b", "*r, x", "a=foo()", "a,,b", "**k, a"] {
            assert!(Signature::parse(bad).is_err(), "{bad} should be rejected");
        }
        assert!(Signature::parse("  ").unwrap().varnames().is_empty());
    }

    #[test]
    fn binds_like_a_native_function() {
        let sig = Signature::parse("x, y=10, *rest, **kw").unwrap();
        let mut kwargs = Map::new();
        kwargs.insert("z".into(), json!(3));
        let bound = sig.bind("f", &[json!(1), json!(2), json!(5)], &kwargs).unwrap();
        assert_eq!(bound, vec![json!(1), json!(2), json!([5]), json!({"z": 3})]);

        let bound = sig.bind("f", &[json!(1)], &Map::new()).unwrap();
        assert_eq!(bound, vec![json!(1), json!(10), json!([]), json!({})]);
    }

    #[test]
    fn binding_errors_are_signature_errors() {
        let sig = Signature::parse("x").unwrap();
        let err = sig.bind("f", &[json!(1), json!(2)], &Map::new()).unwrap_err();
        assert_eq!(err.to_string(), "TypeError: f() takes 1 positional argument but 2 were given");

        let mut kwargs = Map::new();
        kwargs.insert("x".into(), json!(1));
        let err = sig.bind("f", &[json!(1)], &kwargs).unwrap_err();
        assert!(err.to_string().contains("multiple values for argument 'x'"));

        let mut kwargs = Map::new();
        kwargs.insert("q".into(), json!(1));
        let err = sig.bind("f", &[], &kwargs).unwrap_err();
        assert!(err.to_string().contains("unexpected keyword argument 'q'"));

        let err = sig.bind("f", &[], &Map::new()).unwrap_err();
        assert!(err.to_string().contains("missing required argument: 'x'"));
    }

    #[test]
    fn try_params_skips_star_names() {
        assert_eq!(try_params("a, b=1, *args, **kw"), vec!["a", "b"]);
        assert!(try_params("").is_empty());
    }
}
