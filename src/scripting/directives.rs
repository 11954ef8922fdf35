/// `scripting/directives.rs` - `##key=value` header lines in front of a body.
///
/// `parse` turns a `read()`-style text into metadata changes plus the body;
/// `render` produces that text again. Values equal to the current ones are
/// dropped at parse time, so writing back an unmodified `read()` changes
/// nothing.

use std::collections::BTreeMap;

use crate::error::ScriptError;

use super::bindings::{BindingAssignments, BindingSlot};
use super::signature::is_identifier;

/// Two-character marker of a header line.
pub const MARKER: &str = "##";

/// A recognized header key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    Title,
    Parameters,
    Bind(BindingSlot),
}

impl Directive {
    pub fn key(&self) -> String {
        match self {
            Self::Title => "title".to_string(),
            Self::Parameters => "parameters".to_string(),
            Self::Bind(slot) => format!("bind {}", slot.as_str()),
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "title" => Some(Self::Title),
            "parameters" => Some(Self::Parameters),
            _ => key
                .strip_prefix("bind ")
                .and_then(|slot| BindingSlot::from_name(slot.trim()))
                .map(Self::Bind),
        }
    }
}

/// Current rendered value of every recognized key.
pub fn metadata_map(
    title: &str,
    params: &str,
    bindings: &BindingAssignments,
) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    map.insert(Directive::Title.key(), title.to_string());
    map.insert(Directive::Parameters.key(), params.to_string());
    for (slot, name) in bindings.iter() {
        map.insert(Directive::Bind(slot).key(), name.to_string());
    }
    map
}

/// Outcome of parsing `write()` input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSource {
    /// Only keys whose value differs from the current one, in input order.
    pub changes: Vec<(Directive, String)>,
    pub body: String,
}

impl ParsedSource {
    pub fn binds_changed(&self) -> bool {
        self.changes
            .iter()
            .any(|(d, _)| matches!(d, Directive::Bind(_)))
    }
}

/// Right-trim and terminate with a single newline; empty stays empty.
pub fn normalize_body(body: &str) -> String {
    let body = body.trim_end();
    if body.is_empty() {
        String::new()
    } else {
        format!("{body}\n")
    }
}

pub fn parse(text: &str, current: &BTreeMap<String, String>) -> Result<ParsedSource, ScriptError> {
    let mut changes = Vec::new();
    let mut body = "";
    let mut offset = 0;

    for raw in text.split_inclusive('\n') {
        let start = offset;
        offset += raw.len();
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if !line.starts_with(MARKER) {
            body = &text[start..];
            break;
        }
        if line.len() == MARKER.len() || line.as_bytes()[MARKER.len()] == b' ' || !line.contains('=') {
            // alignment or comment line
            continue;
        }
        let Some((key, value)) = line[MARKER.len()..].split_once('=') else {
            continue;
        };
        let key = key.trim().to_lowercase();
        let value = value.trim();
        let directive = match (current.get(&key), Directive::from_key(&key)) {
            (Some(_), Some(directive)) => directive,
            _ => {
                return Err(ScriptError::DirectiveParse(format!(
                    "Unrecognized header line \"{line}\""
                )))
            }
        };
        if current.get(&key).map(String::as_str) == Some(value) {
            continue;
        }
        if let Directive::Bind(_) = directive {
            if !value.is_empty() && !is_identifier(value) {
                return Err(ScriptError::DirectiveParse(format!(
                    "Invalid binding name in header line \"{line}\""
                )));
            }
        }
        changes.push((directive, value.to_string()));
    }

    Ok(ParsedSource {
        changes,
        body: normalize_body(body),
    })
}

/// Leading spaces of the first non-blank body line.
fn first_indent(body: &str) -> &str {
    for line in body.lines() {
        let rest = line.trim_start_matches(' ');
        if !rest.is_empty() {
            return &line[..line.len() - rest.len()];
        }
    }
    ""
}

/// Everything `read()` needs to know about a script.
pub struct RenderSource<'a> {
    pub meta_type: &'a str,
    pub id: &'a str,
    pub metadata: &'a BTreeMap<String, String>,
    pub errors: &'a [String],
    pub warnings: &'a [String],
    pub body: &'a str,
}

pub fn render(src: &RenderSource<'_>) -> String {
    let prefix = format!("{}{MARKER}", first_indent(src.body));

    let mut lines = vec![format!("{prefix} {} \"{}\"", src.meta_type, src.id)];
    lines.extend(src.metadata.iter().map(|(k, v)| format!("{k}={v}")));
    for (label, block) in [(" Errors:", src.errors), (" Warnings:", src.warnings)] {
        if block.is_empty() {
            continue;
        }
        lines.push(String::new());
        lines.push(label.to_string());
        lines.extend(block.iter().map(|l| format!("  {l}")));
    }
    lines.push(String::new());

    format!("{}\n{}", lines.join(&format!("\n{prefix}")), src.body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn current() -> BTreeMap<String, String> {
        metadata_map("", "", &BindingAssignments::default())
    }

    #[test]
    fn headers_and_body_are_split() {
        let text = "## Script (Lua) \"x\"\n##title=Hello\n##parameters=a, b=1\n##\nreturn a\n\n\n";
        let parsed = parse(text, &current()).unwrap();
        assert_eq!(
            parsed.changes,
            vec![
                (Directive::Title, "Hello".to_string()),
                (Directive::Parameters, "a, b=1".to_string()),
            ]
        );
        assert_eq!(parsed.body, "return a\n");
        assert!(!parsed.binds_changed());
    }

    #[test]
    fn unchanged_values_are_skipped() {
        let text = "##bind context=context\n##bind namespace=\nreturn 1";
        let parsed = parse(text, &current()).unwrap();
        assert!(parsed.changes.is_empty());
        assert_eq!(parsed.body, "return 1\n");
    }

    #[test]
    fn unknown_key_is_rejected() {
        let err = parse("##unknownkey=value\nreturn 1\n", &current()).unwrap_err();
        assert_eq!(err.to_string(), "Unrecognized header line \"##unknownkey=value\"");
    }

    #[test]
    fn bind_requires_identifier() {
        assert!(parse("##bind context=not valid\n", &current()).is_err());
        let parsed = parse("##BIND Namespace = ns\n", &current()).unwrap();
        assert_eq!(parsed.changes, vec![(Directive::Bind(BindingSlot::Namespace), "ns".to_string())]);
        assert!(parsed.binds_changed());
        assert_eq!(parsed.body, "");
    }

    #[test]
    fn comment_lines_in_body_are_kept() {
        let parsed = parse("-- note\nreturn 1\n", &current()).unwrap();
        assert_eq!(parsed.body, "-- note\nreturn 1\n");
    }

    #[test]
    fn render_follows_body_indentation() {
        let meta = current();
        let errors = vec!["Line 1: oops".to_string()];
        let text = render(&RenderSource {
            meta_type: "Script (Lua)",
            id: "s",
            metadata: &meta,
            errors: &errors,
            warnings: &[],
            body: "  return 1\n",
        });
        assert!(text.starts_with("  ## Script (Lua) \"s\"\n  ##bind container=container\n"));
        assert!(text.contains("\n  ## Errors:\n  ##  Line 1: oops\n  ##\n  return 1\n"));
        // rendering is accepted back without changes
        let parsed = parse(&text, &meta).unwrap();
        assert!(parsed.changes.is_empty());
        assert_eq!(parsed.body, "  return 1\n");
    }
}
