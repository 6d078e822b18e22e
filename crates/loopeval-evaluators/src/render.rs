//! `{{field}}` substitution for prompt messages and request templates.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

fn placeholder() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z0-9_\-]+(?:\.[A-Za-z0-9_\-]+)*)\s*\}\}").ok())
        .as_ref()
}

/// Names referenced by a template, in order of first appearance.
pub fn placeholders(template: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let Some(re) = placeholder() else {
        return out;
    };
    for cap in re.captures_iter(template) {
        let name = cap[1].to_string();
        if !out.contains(&name) {
            out.push(name);
        }
    }
    out
}

/// Text form of a value: strings verbatim, everything else as compact JSON.
pub fn as_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Replaces each `{{name}}` (or `{{name.path}}`) with the variable's text.
/// Unknown variables render as the empty string.
pub fn render<'a, F>(template: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<&'a Value>,
{
    let Some(re) = placeholder() else {
        return template.to_string();
    };
    re.replace_all(template, |cap: &regex::Captures<'_>| {
        let mut parts = cap[1].split('.');
        let head = parts.next().unwrap_or_default();
        let mut cur = lookup(head);
        for p in parts {
            cur = cur.and_then(|v| match v {
                Value::Object(m) => m.get(p),
                Value::Array(a) => p.parse::<usize>().ok().and_then(|i| a.get(i)),
                _ => None,
            });
        }
        cur.map(as_text).unwrap_or_default()
    })
    .into_owned()
}

/// Renders every string leaf of a JSON template.
pub fn render_json<'a, F>(template: &Value, lookup: &F) -> Value
where
    F: Fn(&str) -> Option<&'a Value>,
{
    match template {
        // A string that is exactly one placeholder keeps the variable's JSON type.
        Value::String(s) => {
            let names = placeholders(s);
            let whole = names.len() == 1 && s.trim() == format!("{{{{{}}}}}", names[0]);
            if whole && !names[0].contains('.') {
                if let Some(v) = lookup(&names[0]) {
                    return v.clone();
                }
            }
            Value::String(render(s, lookup))
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| render_json(v, lookup)).collect()),
        Value::Object(m) => Value::Object(m.iter().map(|(k, v)| (k.clone(), render_json(v, lookup))).collect()),
        other => other.clone(),
    }
}
