/// `scripting/compiler.rs` - restricted compile of (parameters, body).
///
/// The body is checked on its own first, so it cannot close the generated
/// `function ... end` wrapper early. A token scan then enforces the naming
/// rules, and the wrapped chunk is dumped as bytecode. The artifact is the
/// chunk `return function(<params>) <body> end`; loading it yields the
/// function itself.

use std::sync::Arc;

use mlua::Lua;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::signature::Signature;

/// Name every chunk is compiled under.
pub const CHUNK_NAME: &str = "=<string>";
const LOCATION: &str = "<string>:";
const FILESTRING: &str = "  File \"<string>\",";

/// Opaque compiled form plus what is needed to call it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledArtifact {
    pub bytecode: Vec<u8>,
    pub signature: Signature,
}

impl CompiledArtifact {
    /// Hex SHA-256 of the bytecode, stored next to it.
    pub fn digest(&self) -> String {
        code_digest(&self.bytecode)
    }
}

pub fn code_digest(bytecode: &[u8]) -> String {
    hex::encode(Sha256::digest(bytecode))
}

#[derive(Debug, Default)]
pub struct CompileOutput {
    pub artifact: Option<Arc<CompiledArtifact>>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl CompileOutput {
    fn failed(errors: Vec<String>, warnings: Vec<String>) -> Self {
        Self {
            artifact: None,
            errors,
            warnings,
        }
    }
}

/// Compile a script. `globalize` lists the names bound into the body's scope.
pub fn compile(params: &str, body: &str, script_id: &str, globalize: &[String]) -> CompileOutput {
    let signature = match Signature::parse(params) {
        Ok(sig) => sig,
        Err(e) => return CompileOutput::failed(vec![e], Vec::new()),
    };

    let collisions: Vec<String> = signature
        .varnames()
        .into_iter()
        .filter(|name| globalize.contains(name))
        .map(|name| format!("Line 1: name '{name}' is parameter and global"))
        .collect();
    if !collisions.is_empty() {
        return CompileOutput::failed(collisions, Vec::new());
    }

    let lua = Lua::new();
    if let Err(e) = lua.load(body).set_name(CHUNK_NAME).into_function() {
        return CompileOutput::failed(localize(vec![syntax_diagnostic(&e, 0)], script_id), Vec::new());
    }

    let scan = scan(body);
    if !scan.errors.is_empty() {
        return CompileOutput::failed(scan.errors, scan.warnings);
    }

    let wrapped = wrap(&signature, body);
    let function = match lua.load(wrapped.as_str()).set_name(CHUNK_NAME).into_function() {
        Ok(f) => f,
        Err(e) => {
            return CompileOutput::failed(localize(vec![syntax_diagnostic(&e, 1)], script_id), scan.warnings)
        }
    };

    CompileOutput {
        artifact: Some(Arc::new(CompiledArtifact {
            bytecode: function.dump(false),
            signature,
        })),
        errors: Vec::new(),
        warnings: scan.warnings,
    }
}

fn wrap(signature: &Signature, body: &str) -> String {
    format!("return function({})\n{body}\nend\n", signature.lua_parameter_list())
}

/// `<string>:N: msg` -> `  File "<string>", line N: msg`, shifted by `offset`.
fn syntax_diagnostic(err: &mlua::Error, offset: usize) -> String {
    let message = match err {
        mlua::Error::SyntaxError { message, .. } => message.clone(),
        other => other.to_string(),
    };
    match split_location(&message) {
        Some((line, rest)) => format!("{FILESTRING} line {}: {rest}", line.saturating_sub(offset)),
        None => format!("{FILESTRING} {message}"),
    }
}

fn localize(errors: Vec<String>, script_id: &str) -> Vec<String> {
    let replacement = format!("  Script \"{script_id}\",");
    errors
        .into_iter()
        .map(|e| {
            if e.starts_with(FILESTRING) {
                e.replacen(FILESTRING, &replacement, 1)
            } else {
                e
            }
        })
        .collect()
}

/// Line number and message after the first `<string>:N:` marker.
fn split_location(message: &str) -> Option<(usize, &str)> {
    let at = message.find(LOCATION)?;
    let rest = &message[at + LOCATION.len()..];
    let (digits, tail) = rest.split_once(':')?;
    Some((digits.parse().ok()?, tail.trim_start()))
}

/// Rewrite runtime locations of the wrapped chunk to body lines.
pub fn rewrite_runtime_locations(message: &str, script_id: &str) -> String {
    let mut out = String::with_capacity(message.len());
    let mut rest = message;
    while let Some(at) = rest.find(LOCATION) {
        out.push_str(&rest[..at]);
        let after = &rest[at + LOCATION.len()..];
        match after.split_once(':').and_then(|(d, t)| d.parse::<usize>().ok().map(|n| (n, t))) {
            Some((line, tail)) => {
                out.push_str(&format!("Script \"{script_id}\", line {}:", line.saturating_sub(1)));
                rest = tail;
            }
            None => {
                out.push_str(LOCATION);
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

// ── Restriction scan ──────────────────────────────────────────────────────────

#[derive(Debug, Default, PartialEq)]
pub struct ScanReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Clone, Copy, PartialEq)]
enum Prev {
    Member,
    Other,
}

struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    line: usize,
}

impl<'a> Lexer<'a> {
    fn peek(&self, ahead: usize) -> Option<u8> {
        self.src.get(self.pos + ahead).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let c = self.peek(0)?;
        self.pos += 1;
        if c == b'\n' {
            self.line += 1;
        }
        Some(c)
    }

    /// Level of a long bracket `[==[` at the cursor.
    fn long_bracket_level(&self) -> Option<usize> {
        if self.peek(0) != Some(b'[') {
            return None;
        }
        let mut level = 0;
        while self.peek(1 + level) == Some(b'=') {
            level += 1;
        }
        (self.peek(1 + level) == Some(b'[')).then_some(level)
    }

    fn skip_long_bracket(&mut self, level: usize) {
        self.pos += level + 2;
        while let Some(c) = self.bump() {
            if c == b']'
                && (0..level).all(|i| self.peek(i) == Some(b'='))
                && self.peek(level) == Some(b']')
            {
                self.pos += level + 1;
                return;
            }
        }
    }

    fn skip_string(&mut self, quote: u8) {
        while let Some(c) = self.bump() {
            match c {
                b'\\' => {
                    self.bump();
                }
                b'\n' => return,
                c if c == quote => return,
                _ => {}
            }
        }
    }

    fn skip_number(&mut self) {
        while let Some(c) = self.peek(0) {
            let exponent = matches!(c, b'e' | b'E' | b'p' | b'P');
            if c.is_ascii_alphanumeric() || c == b'.' {
                self.pos += 1;
                if exponent && matches!(self.peek(0), Some(b'+' | b'-')) {
                    self.pos += 1;
                }
            } else {
                break;
            }
        }
    }
}

/// Token scan of a body that already parses.
pub fn scan(body: &str) -> ScanReport {
    let mut lx = Lexer {
        src: body.as_bytes(),
        pos: 0,
        line: 1,
    };
    let mut report = ScanReport::default();
    let mut prev = Prev::Other;
    let mut first_print = None;
    let mut first_printed = None;

    while let Some(c) = lx.peek(0) {
        match c {
            b'-' if lx.peek(1) == Some(b'-') => {
                lx.pos += 2;
                match lx.long_bracket_level() {
                    Some(level) => lx.skip_long_bracket(level),
                    None => {
                        while lx.peek(0).is_some_and(|c| c != b'\n') {
                            lx.pos += 1;
                        }
                    }
                }
                continue;
            }
            b'"' | b'\'' => {
                lx.pos += 1;
                lx.skip_string(c);
            }
            b'[' if lx.long_bracket_level().is_some() => {
                let level = lx.long_bracket_level().unwrap_or_default();
                lx.skip_long_bracket(level);
            }
            b'0'..=b'9' => lx.skip_number(),
            b'.' if lx.peek(1).is_some_and(|c| c.is_ascii_digit()) => lx.skip_number(),
            b'.' => {
                let dots = (0..3).take_while(|i| lx.peek(*i) == Some(b'.')).count();
                lx.pos += dots;
                prev = if dots == 1 { Prev::Member } else { Prev::Other };
                continue;
            }
            b':' => {
                let double = lx.peek(1) == Some(b':');
                lx.pos += if double { 2 } else { 1 };
                prev = if double { Prev::Other } else { Prev::Member };
                continue;
            }
            c if c.is_ascii_alphabetic() || c == b'_' => {
                let start = lx.pos;
                while lx.peek(0).is_some_and(|c| c.is_ascii_alphanumeric() || c == b'_') {
                    lx.pos += 1;
                }
                let name = &body[start..lx.pos];
                let line = lx.line;
                if name.len() > 1 && name.starts_with('_') {
                    report.errors.push(if prev == Prev::Member {
                        format!("Line {line}: \"{name}\" is an invalid attribute name because it starts with \"_\".")
                    } else {
                        format!("Line {line}: \"{name}\" is an invalid variable name because it starts with \"_\"")
                    });
                } else if prev != Prev::Member {
                    match name {
                        "print" => {
                            first_print.get_or_insert(line);
                        }
                        "printed" => {
                            first_printed.get_or_insert(line);
                        }
                        _ => {}
                    }
                }
            }
            _ => {
                lx.bump();
            }
        }
        prev = Prev::Other;
    }

    match (first_print, first_printed) {
        (Some(line), None) => report
            .warnings
            .push(format!("Line {line}: Prints, but never reads 'printed' variable.")),
        (None, Some(line)) => report
            .warnings
            .push(format!("Line {line}: Doesn't print, but reads 'printed' variable.")),
        _ => {}
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn globals() -> Vec<String> {
        vec!["context".to_string(), "container".to_string()]
    }

    #[test]
    fn empty_body_compiles() {
        let out = compile("", "", "s", &globals());
        assert!(out.errors.is_empty());
        assert!(out.artifact.is_some());
    }

    #[test]
    fn syntax_errors_name_the_script() {
        let out = compile("", "x = 1\nreturn = 2\n", "broken", &[]);
        assert!(out.artifact.is_none());
        assert_eq!(out.errors.len(), 1);
        assert!(out.errors[0].starts_with("  Script \"broken\", line 2:"), "{}", out.errors[0]);
    }

    #[test]
    fn wrapper_errors_use_body_lines() {
        // the main chunk accepts `...`, a fixed-arity function does not
        let out = compile("a", "x = 1\nreturn ...\n", "va", &[]);
        assert!(out.artifact.is_none());
        assert!(out.errors[0].starts_with("  Script \"va\", line 2:"), "{}", out.errors[0]);
    }

    #[test]
    fn body_cannot_close_the_wrapper() {
        let out = compile("", "end\nos.exit()\nfunction f()", "esc", &[]);
        assert!(out.artifact.is_none());
    }

    #[test]
    fn underscore_names_are_rejected() {
        let out = compile("", "local _x = 1\nreturn string._y, _ENV\n", "u", &[]);
        assert_eq!(
            out.errors,
            vec![
                "Line 1: \"_x\" is an invalid variable name because it starts with \"_\"".to_string(),
                "Line 2: \"_y\" is an invalid attribute name because it starts with \"_\".".to_string(),
                "Line 2: \"_ENV\" is an invalid variable name because it starts with \"_\"".to_string(),
            ]
        );
    }

    #[test]
    fn strings_and_comments_are_not_scanned() {
        let report = scan("-- _hidden\nlocal s = \"_x\" .. [[_y\n]] --[==[ _z ]==]\nreturn s:upper(), 1.5e-3, _\n");
        assert_eq!(report, ScanReport::default());
    }

    #[test]
    fn print_warnings() {
        let report = scan("x = 1\nprint(x)\n");
        assert_eq!(report.warnings, vec!["Line 2: Prints, but never reads 'printed' variable."]);
        let report = scan("return printed\n");
        assert_eq!(report.warnings, vec!["Line 1: Doesn't print, but reads 'printed' variable."]);
        assert!(scan("print(1)\nreturn printed\n").warnings.is_empty());
        assert!(scan("return string.print\n").warnings.is_empty());
    }

    #[test]
    fn parameter_colliding_with_binding() {
        let out = compile("context", "return 1", "c", &globals());
        assert_eq!(out.errors, vec!["Line 1: name 'context' is parameter and global"]);
    }

    #[test]
    fn bad_parameters_are_diagnostics() {
        let out = compile("a=1, b", "return a", "p", &[]);
        assert!(out.artifact.is_none());
        assert!(out.errors[0].contains("non-default argument"));
    }

    #[test]
    fn runtime_locations_are_rewritten() {
        let msg = "<string>:3: attempt to index a nil value";
        assert_eq!(
            rewrite_runtime_locations(msg, "s"),
            "Script \"s\", line 2: attempt to index a nil value"
        );
        assert_eq!(rewrite_runtime_locations("plain", "s"), "plain");
    }
}
