//! `$name` references inside step parameters.
//!
//! Grammar: a reference is `$` followed by an identifier
//! (`[A-Za-z_][A-Za-z0-9_]*`), optionally wrapped in braces as `{$name}` to
//! delimit it from surrounding text.  Resolution is one left-to-right pass:
//!
//! * a string that is exactly one reference is replaced by the captured
//!   value itself, keeping its JSON type (arrays, objects, numbers);
//! * references embedded in longer strings are replaced by the value's
//!   text (strings without quotes, everything else as JSON);
//! * names that were never captured are left untouched.
//!
//! Arrays and objects are resolved recursively; other values pass through.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::Value;

static REFERENCE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"\{\$([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)").ok()
});

static IDENTIFIER: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").ok());

/// Whether `name` can be referenced as `$name`.
pub fn is_identifier(name: &str) -> bool {
    IDENTIFIER.as_ref().is_some_and(|re| re.is_match(name))
}

/// Resolve every reference in `value` against `vars`.
pub fn resolve(value: &Value, vars: &BTreeMap<String, Value>) -> Value {
    match value {
        Value::String(s) => resolve_str(s, vars),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve(v, vars)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve(v, vars)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn reference_name<'h>(caps: &Captures<'h>) -> &'h str {
    caps.get(1)
        .or_else(|| caps.get(2))
        .map_or("", |m| m.as_str())
}

fn resolve_str(s: &str, vars: &BTreeMap<String, Value>) -> Value {
    let Some(re) = REFERENCE.as_ref() else {
        return Value::String(s.to_string());
    };

    if let Some(caps) = re.captures(s)
        && let Some(whole) = caps.get(0)
        && whole.start() == 0
        && whole.end() == s.len()
        && let Some(v) = vars.get(reference_name(&caps))
    {
        return v.clone();
    }

    let replaced = re.replace_all(s, |caps: &Captures<'_>| match vars.get(reference_name(caps)) {
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
        None => caps[0].to_string(),
    });
    Value::String(replaced.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars() -> BTreeMap<String, Value> {
        BTreeMap::from([
            ("iv_data".to_string(), json!({ "results": [1, 2], "aborted": false })),
            ("pixel".to_string(), json!(3)),
            ("label".to_string(), json!("dark")),
        ])
    }

    #[test]
    fn whole_string_reference_keeps_type() {
        assert_eq!(
            resolve(&json!("$iv_data"), &vars()),
            json!({ "results": [1, 2], "aborted": false })
        );
        assert_eq!(resolve(&json!("{$pixel}"), &vars()), json!(3));
    }

    #[test]
    fn embedded_references_are_interpolated() {
        assert_eq!(
            resolve(&json!("iv_{$label}_px$pixel"), &vars()),
            json!("iv_dark_px3")
        );
        assert_eq!(resolve(&json!("$label-$label"), &vars()), json!("dark-dark"));
    }

    #[test]
    fn unknown_names_stay_literal() {
        assert_eq!(resolve(&json!("$missing"), &vars()), json!("$missing"));
        assert_eq!(
            resolve(&json!("run_{$missing}_$pixel"), &vars()),
            json!("run_{$missing}_3")
        );
        assert_eq!(resolve(&json!("cost: $5"), &vars()), json!("cost: $5"));
    }

    #[test]
    fn nested_containers_are_resolved() {
        let params = json!({
            "data": "$iv_data",
            "meta": { "tags": ["$label", 7, null] },
        });
        let out = resolve(&params, &vars());
        assert_eq!(out["data"]["results"], json!([1, 2]));
        assert_eq!(out["meta"]["tags"], json!(["dark", 7, null]));
    }

    #[test]
    fn identifiers() {
        assert!(is_identifier("iv_data"));
        assert!(is_identifier("_x1"));
        assert!(!is_identifier("1x"));
        assert!(!is_identifier("iv data"));
        assert!(!is_identifier(""));
    }
}
