//! Resolution of `{{ }}` fragments inside step inputs, conditions and loop sources

use super::errors::ExpressionError;
use super::eval::{Scope, evaluate, is_truthy, to_text};
use super::parser::parse_expression;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;

static FRAGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\{\{(.*?)\}\}").expect("fragment pattern compiles"));

/// Whether a string contains at least one `{{ }}` fragment
pub fn has_fragment(source: &str) -> bool {
    FRAGMENT.is_match(source)
}

/// Inner expression text of every fragment, in order
pub fn fragments(source: &str) -> impl Iterator<Item = &str> {
    FRAGMENT
        .captures_iter(source)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().trim()))
}

/// The inner text when the whole string is exactly one fragment
fn single_fragment(source: &str) -> Option<&str> {
    let m = FRAGMENT.find(source)?;
    if m.start() == 0 && m.end() == source.len() {
        Some(source[2..source.len() - 2].trim())
    } else {
        None
    }
}

/// Resolve one string; `None` means it resolved to `undefined`
///
/// A lone fragment keeps the type of its value. Anything else becomes a
/// string with every fragment substituted.
pub fn resolve_str(source: &str, scope: &dyn Scope) -> Result<Option<Value>, ExpressionError> {
    if let Some(inner) = single_fragment(source) {
        let expr = parse_expression(inner)?;
        return Ok(evaluate(&expr, scope));
    }

    let mut out = String::with_capacity(source.len());
    let mut last = 0;
    for caps in FRAGMENT.captures_iter(source) {
        let (Some(whole), Some(inner)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        out.push_str(&source[last..whole.start()]);
        let expr = parse_expression(inner.as_str().trim())?;
        out.push_str(&substitution_text(evaluate(&expr, scope).as_ref()));
        last = whole.end();
    }
    out.push_str(&source[last..]);

    Ok(Some(Value::String(out)))
}

/// Text substituted for a fragment embedded in surrounding text
fn substitution_text(value: Option<&Value>) -> String {
    match value {
        None => String::new(),
        Some(Value::Null) => "null".to_string(),
        other => to_text(other),
    }
}

/// Deep-resolve a structured value, walking every string leaf
///
/// Mapping entries that resolve to `undefined` are dropped; sequence
/// elements that resolve to `undefined` become `null`.
pub fn resolve_value(value: &Value, scope: &dyn Scope) -> Result<Value, ExpressionError> {
    Ok(resolve_node(value, scope)?.unwrap_or(Value::Null))
}

fn resolve_node(value: &Value, scope: &dyn Scope) -> Result<Option<Value>, ExpressionError> {
    match value {
        Value::String(s) if has_fragment(s) => resolve_str(s, scope),
        Value::Array(items) => {
            let resolved = items
                .iter()
                .map(|item| Ok(resolve_node(item, scope)?.unwrap_or(Value::Null)))
                .collect::<Result<Vec<_>, ExpressionError>>()?;
            Ok(Some(Value::Array(resolved)))
        }
        Value::Object(map) => {
            let mut resolved = Map::with_capacity(map.len());
            for (key, entry) in map {
                if let Some(v) = resolve_node(entry, scope)? {
                    resolved.insert(key.clone(), v);
                }
            }
            Ok(Some(Value::Object(resolved)))
        }
        other => Ok(Some(other.clone())),
    }
}

/// Evaluate a condition or loop source
///
/// Strings with fragments resolve as templates; strings without any are
/// parsed as a bare expression.
pub fn evaluate_source(source: &str, scope: &dyn Scope) -> Result<Option<Value>, ExpressionError> {
    if has_fragment(source) {
        resolve_str(source, scope)
    } else {
        let expr = parse_expression(source.trim())?;
        Ok(evaluate(&expr, scope))
    }
}

/// Whether a step condition holds
pub fn condition_holds(source: &str, scope: &dyn Scope) -> Result<bool, ExpressionError> {
    let value = evaluate_source(source, scope)?;
    Ok(match &value {
        Some(Value::String(s)) if s.trim() == "false" => false,
        other => is_truthy(other.as_ref()),
    })
}

/// Check that a condition or loop source parses
pub fn validate_source(source: &str) -> Result<(), ExpressionError> {
    if has_fragment(source) {
        fragments(source).try_for_each(|inner| parse_expression(inner).map(|_| ()))
    } else {
        parse_expression(source.trim()).map(|_| ())
    }
}

/// Check that every fragment inside a structured value parses
pub fn validate_value(value: &Value) -> Result<(), ExpressionError> {
    match value {
        Value::String(s) => {
            fragments(s).try_for_each(|inner| parse_expression(inner).map(|_| ()))
        }
        Value::Array(items) => items.iter().try_for_each(validate_value),
        Value::Object(map) => map.values().try_for_each(validate_value),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> Value {
        json!({
            "inputs": {"query": "rust", "limit": 3},
            "search": {"status": "completed", "output": {"results": [1, 2, 3], "meta": null}},
        })
    }

    #[test]
    fn test_values_without_fragments_are_unchanged() {
        let value = json!({"a": "plain", "b": [1, true, null], "c": {"d": 2.5}});
        assert_eq!(resolve_value(&value, &ctx()).unwrap(), value);
    }

    #[test]
    fn test_single_fragment_preserves_type() {
        let scope = ctx();
        assert_eq!(
            resolve_str("{{ search.output.results }}", &scope).unwrap(),
            Some(json!([1, 2, 3]))
        );
        assert_eq!(resolve_str("{{inputs.limit}}", &scope).unwrap(), Some(json!(3)));
        assert_eq!(resolve_str("{{ missing }}", &scope).unwrap(), None);
    }

    #[test]
    fn test_mixed_text_is_always_a_string() {
        let scope = ctx();
        assert_eq!(
            resolve_str("q={{ inputs.query }}&n={{ inputs.limit }}", &scope).unwrap(),
            Some(json!("q=rust&n=3"))
        );
        assert_eq!(
            resolve_str("[{{ missing }}]", &scope).unwrap(),
            Some(json!("[]"))
        );
        assert_eq!(
            resolve_str("meta={{ search.output.meta }}", &scope).unwrap(),
            Some(json!("meta=null"))
        );
        assert_eq!(
            resolve_str("r={{ search.output.results }}", &scope).unwrap(),
            Some(json!("r=[1,2,3]"))
        );
        assert_eq!(
            resolve_str("{{ inputs.query }}{{ inputs.limit }}", &scope).unwrap(),
            Some(json!("rust3"))
        );
    }

    #[test]
    fn test_deep_resolution() {
        let value = json!({
            "query": "{{ inputs.query }}",
            "limit": "{{ inputs.limit }}",
            "dropped": "{{ missing }}",
            "list": ["{{ missing }}", "{{ inputs.query || 'x' }}"],
        });
        let resolved = resolve_value(&value, &ctx()).unwrap();
        assert_eq!(
            resolved,
            json!({"query": "rust", "limit": 3, "list": [null, "rust"]})
        );
    }

    #[test]
    fn test_syntax_errors_surface() {
        let scope = ctx();
        assert!(resolve_str("{{ search.1st }}", &scope).is_err());
        assert!(resolve_value(&json!({"a": ["{{ a = b }}"]}), &scope).is_err());
        assert!(validate_value(&json!({"x": "{{ }}"})).is_err());
        assert!(validate_value(&json!({"x": "{{ ok.path }}"})).is_ok());
    }

    #[test]
    fn test_conditions() {
        let scope = ctx();
        assert!(condition_holds("{{ search.output.results.length >= 1 }}", &scope).unwrap());
        assert!(condition_holds("search.output.results.length > 2", &scope).unwrap());
        assert!(!condition_holds("{{ missing }}", &scope).unwrap());
        assert!(condition_holds("is {{ search.output.meta == null }}", &scope).unwrap());
        assert!(!condition_holds("{{ inputs.limit > 5 }}", &scope).unwrap());
        assert!(!condition_holds(" {{ inputs.limit > 5 }}", &scope).unwrap());
    }

    #[test]
    fn test_validate_source() {
        assert!(validate_source("{{ a || b }}").is_ok());
        assert!(validate_source("a.b && !c").is_ok());
        assert!(validate_source("a.").is_err());
    }

    #[test]
    fn test_fragments() {
        let found: Vec<&str> = fragments("{{ a }} and {{b.c}}").collect();
        assert_eq!(found, vec!["a", "b.c"]);
        assert!(has_fragment("x {{ y }}"));
        assert!(!has_fragment("plain"));
    }
}
