/// `scripting/standard.rs` - helper module available as `require("standard")`.

use mlua::{Lua, Result as LuaResult, Table, Value};

pub fn html_quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            c => out.push(c),
        }
    }
    out
}

/// Percent-encode, leaving `/` alone.
pub fn url_quote(s: &str) -> String {
    urlencoding::encode(s).replace("%2F", "/")
}

/// Percent-encode with spaces as `+`.
pub fn url_quote_plus(s: &str) -> String {
    urlencoding::encode(s).replace("%20", "+")
}

pub fn url_unquote(s: &str) -> Result<String, String> {
    urlencoding::decode(s)
        .map(|c| c.into_owned())
        .map_err(|e| format!("cannot unquote {s:?}: {e}"))
}

pub fn url_unquote_plus(s: &str) -> Result<String, String> {
    url_unquote(&s.replace('+', " "))
}

pub fn newline_to_br(s: &str) -> String {
    s.replace('\r', "").replace('\n', "<br />\n")
}

/// Insert commas into the first run of digits: `1234567.5` -> `1,234,567.5`.
pub fn thousands_commas(s: &str) -> String {
    let Some(start) = s.find(|c: char| c.is_ascii_digit()) else {
        return s.to_string();
    };
    let end = s[start..]
        .find(|c: char| !c.is_ascii_digit())
        .map_or(s.len(), |i| start + i);
    let digits = &s[start..end];
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    format!("{}{grouped}{}", &s[..start], &s[end..])
}

pub fn whole_dollars(v: f64) -> String {
    format!("${}", v.trunc() as i64)
}

pub fn dollars_and_cents(v: f64) -> String {
    format!("${v:.2}")
}

/// Double single quotes and drop NUL bytes for SQL string literals.
pub fn sql_quote(s: &str) -> String {
    s.replace('\0', "").replace('\'', "''")
}

pub fn urlencode(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", url_quote_plus(k), url_quote_plus(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn display(value: &Value) -> LuaResult<String> {
    match value {
        Value::Integer(i) => Ok(i.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        Value::String(s) => Ok(s.to_str()?.to_string()),
        other => Err(mlua::Error::runtime(format!(
            "expected a string or number, got {}",
            other.type_name()
        ))),
    }
}

fn number(value: &Value) -> LuaResult<f64> {
    match value {
        Value::Integer(i) => Ok(*i as f64),
        Value::Number(n) => Ok(*n),
        Value::String(s) => s
            .to_str()?
            .trim()
            .parse()
            .map_err(|_| mlua::Error::runtime("expected a number")),
        other => Err(mlua::Error::runtime(format!("expected a number, got {}", other.type_name()))),
    }
}

/// Build the module table for one sandbox.
pub fn create_module(lua: &Lua) -> LuaResult<Table> {
    let tbl = lua.create_table()?;

    macro_rules! string_fn {
        ($name:literal, $f:expr) => {
            tbl.set($name, lua.create_function(|_, s: String| Ok($f(&s)))?)?;
        };
    }
    string_fn!("html_quote", html_quote);
    string_fn!("url_quote", url_quote);
    string_fn!("url_quote_plus", url_quote_plus);
    string_fn!("newline_to_br", newline_to_br);
    string_fn!("sql_quote", sql_quote);

    tbl.set("url_unquote", lua.create_function(|_, s: String| {
        url_unquote(&s).map_err(mlua::Error::runtime)
    })?)?;
    tbl.set("url_unquote_plus", lua.create_function(|_, s: String| {
        url_unquote_plus(&s).map_err(mlua::Error::runtime)
    })?)?;
    tbl.set("thousands_commas", lua.create_function(|_, v: Value| {
        Ok(thousands_commas(&display(&v)?))
    })?)?;
    tbl.set("whole_dollars", lua.create_function(|_, v: Value| {
        Ok(whole_dollars(number(&v)?))
    })?)?;
    tbl.set("dollars_and_cents", lua.create_function(|_, v: Value| {
        Ok(dollars_and_cents(number(&v)?))
    })?)?;

    // keys are sorted; table order is not meaningful
    tbl.set("urlencode", lua.create_function(|_, t: Table| {
        let mut pairs = Vec::new();
        for pair in t.pairs::<Value, Value>() {
            let (k, v) = pair?;
            pairs.push((display(&k)?, display(&v)?));
        }
        pairs.sort();
        Ok(urlencode(&pairs))
    })?)?;

    // copy without keys starting with "_"
    tbl.set("Object", lua.create_function(|lua, t: Option<Table>| {
        let copy = lua.create_table()?;
        if let Some(t) = t {
            for pair in t.pairs::<Value, Value>() {
                let (k, v) = pair?;
                if let Value::String(s) = &k {
                    if s.to_string_lossy().starts_with('_') {
                        continue;
                    }
                }
                copy.raw_set(k, v)?;
            }
        }
        Ok(copy)
    })?)?;

    Ok(tbl)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting_helpers() {
        assert_eq!(html_quote("<a href=\"x\">&</a>"), "&lt;a href=&quot;x&quot;&gt;&amp;&lt;/a&gt;");
        assert_eq!(url_quote("/a b/c?d"), "/a%20b/c%3Fd");
        assert_eq!(url_quote_plus("a b/c"), "a+b%2Fc");
        assert_eq!(url_unquote("a%20b").unwrap(), "a b");
        assert_eq!(url_unquote_plus("a+b%2B").unwrap(), "a b+");
        assert_eq!(sql_quote("it's\0"), "it''s");
        assert_eq!(newline_to_br("a\r\nb"), "a<br />\nb");
    }

    #[test]
    fn number_formatting() {
        assert_eq!(thousands_commas("1234567.891"), "1,234,567.891");
        assert_eq!(thousands_commas("$999"), "$999");
        assert_eq!(thousands_commas("n/a"), "n/a");
        assert_eq!(whole_dollars(1234.99), "$1234");
        assert_eq!(dollars_and_cents(3.5), "$3.50");
    }

    #[test]
    fn module_from_lua() {
        let lua = Lua::new();
        lua.globals().set("standard", create_module(&lua).unwrap()).unwrap();
        let s: String = lua
            .load("return standard.urlencode({b = 'x y', a = 1})")
            .eval()
            .unwrap();
        assert_eq!(s, "a=1&b=x+y");
        let n: i64 = lua
            .load("local o = standard.Object({a = 1, _b = 2}); local n = 0; for _ in pairs(o) do n = n + 1 end; return n")
            .eval()
            .unwrap();
        assert_eq!(n, 1);
        let s: String = lua.load("return standard.thousands_commas(1234567)").eval().unwrap();
        assert_eq!(s, "1,234,567");
    }
}
