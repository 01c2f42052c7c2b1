//! Template grammar for secret-backed fields: ``[[ secret `name/key` ]]``.
//!
//! Parsing is pure; resolution against a secret store lives in `apiary-admission`.

use serde_json::Value as Json;

use crate::{ApiaryError, ApiaryResult};

const OPEN: &str = "[[";
const CLOSE: &str = "]]";

/// Reference to one key of a secret, relative to the owning object's namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SecretPath {
    pub name: String,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment<'a> {
    Literal(&'a str),
    Secret(SecretPath),
}

pub fn is_templated(s: &str) -> bool { s.contains(OPEN) }

/// Split a field into literal text and secret expressions.
pub fn parse(input: &str) -> ApiaryResult<Vec<Segment<'_>>> {
    let mut out = Vec::new();
    let mut rest = input;
    while let Some(start) = rest.find(OPEN) {
        if start > 0 { out.push(Segment::Literal(&rest[..start])); }
        let after = &rest[start + OPEN.len()..];
        let end = after
            .find(CLOSE)
            .ok_or_else(|| ApiaryError::Validation(format!("unterminated template expression in {:?}", input)))?;
        out.push(Segment::Secret(parse_expr(after[..end].trim())?));
        rest = &after[end + CLOSE.len()..];
    }
    if !rest.is_empty() { out.push(Segment::Literal(rest)); }
    Ok(out)
}

fn parse_expr(expr: &str) -> ApiaryResult<SecretPath> {
    let (func, arg) = expr
        .split_once(char::is_whitespace)
        .ok_or_else(|| ApiaryError::Validation(format!("invalid template expression [[ {} ]]", expr)))?;
    if func != "secret" {
        return Err(ApiaryError::Validation(format!("unknown template function {:?}", func)));
    }
    let path = arg
        .trim()
        .strip_prefix('`')
        .and_then(|s| s.strip_suffix('`'))
        .ok_or_else(|| ApiaryError::Validation(format!("secret path must be backquoted: {}", arg.trim())))?;
    match path.split_once('/') {
        Some((name, key)) if !name.is_empty() && !key.is_empty() && !key.contains('/') => {
            Ok(SecretPath { name: name.to_string(), key: key.to_string() })
        }
        _ => Err(ApiaryError::Validation(format!("secret path {:?} must look like name/key", path))),
    }
}

/// Visit every string leaf of a JSON document together with its dotted path.
pub fn walk_strings<'a>(value: &'a Json, path: &mut String, f: &mut dyn FnMut(&str, &'a str)) {
    match value {
        Json::String(s) => f(path, s),
        Json::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                let len = path.len();
                path.push_str(&format!("[{}]", i));
                walk_strings(v, path, f);
                path.truncate(len);
            }
        }
        Json::Object(map) => {
            for (k, v) in map.iter() {
                let len = path.len();
                if !path.is_empty() { path.push('.'); }
                path.push_str(k);
                walk_strings(v, path, f);
                path.truncate(len);
            }
        }
        _ => {}
    }
}

/// Paths of every templated string in the document, in document order.
pub fn templated_fields(value: &Json) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut path = String::new();
    walk_strings(value, &mut path, &mut |p, s| {
        if is_templated(s) { out.push((p.to_string(), s.to_string())); }
    });
    out
}

/// Secrets named by well-formed expressions. Malformed ones are left to admission.
pub fn secret_refs(value: &Json) -> Vec<SecretPath> {
    let mut out: Vec<SecretPath> = Vec::new();
    for (_, raw) in templated_fields(value) {
        if let Ok(segments) = parse(&raw) {
            for seg in segments {
                if let Segment::Secret(p) = seg {
                    if !out.contains(&p) { out.push(p); }
                }
            }
        }
    }
    out
}
