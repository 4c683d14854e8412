//! Extraction of root identifiers referenced by fragments

use super::parser::{Token, parse_expression, tokenize};
use super::template::{fragments, has_fragment};
use serde_json::Value;
use std::collections::BTreeSet;

/// Names that never refer to a step
pub const RESERVED_NAMES: &[&str] = &["inputs", "defaults", "item", "index"];

const LITERALS: &[&str] = &["true", "false", "null", "undefined"];

/// Distinct root identifiers referenced anywhere inside a structured value
pub fn extract_dependencies(value: &Value, reserved: &[&str]) -> BTreeSet<String> {
    let mut roots = BTreeSet::new();
    collect_value(value, reserved, &mut roots);
    roots
}

/// Roots referenced by a condition or loop source, which may be a bare
/// expression
pub fn extract_expression_dependencies(source: &str, reserved: &[&str]) -> BTreeSet<String> {
    let mut roots = BTreeSet::new();
    if has_fragment(source) {
        for inner in fragments(source) {
            collect_roots(inner, reserved, &mut roots);
        }
    } else {
        collect_roots(source.trim(), reserved, &mut roots);
    }
    roots
}

fn collect_value(value: &Value, reserved: &[&str], roots: &mut BTreeSet<String>) {
    match value {
        Value::String(s) => {
            for inner in fragments(s) {
                collect_roots(inner, reserved, roots);
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_value(v, reserved, roots)),
        Value::Object(map) => map.values().for_each(|v| collect_value(v, reserved, roots)),
        _ => {}
    }
}

fn collect_roots(source: &str, reserved: &[&str], roots: &mut BTreeSet<String>) {
    let keep = |name: &str| !reserved.contains(&name) && !LITERALS.contains(&name);

    match parse_expression(source) {
        Ok(expr) => {
            for root in expr.roots() {
                if keep(root) {
                    roots.insert(root.to_string());
                }
            }
        }
        // Malformed fragments are reported by validation; still pick up the
        // identifiers that are not member accesses so the graph stays useful
        Err(_) => {
            let Ok(tokens) = tokenize(source) else {
                return;
            };
            let mut previous: Option<&Token> = None;
            for spanned in &tokens {
                if let Token::Ident(name) = &spanned.token {
                    if previous != Some(&Token::Dot) && keep(name) {
                        roots.insert(name.clone());
                    }
                }
                previous = Some(&spanned.token);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_extracts_roots_from_nested_inputs() {
        let inputs = json!({
            "query": "{{ inputs.query }}",
            "context": ["{{ search.output.results[0] }}", {"deep": "x {{ rerank.output }} y"}],
            "count": 3,
        });
        assert_eq!(
            extract_dependencies(&inputs, RESERVED_NAMES),
            set(&["rerank", "search"])
        );
    }

    #[test]
    fn test_operators_do_not_hide_roots() {
        let deps = extract_expression_dependencies(
            "{{ !check.output || check.output.score >= defaults.threshold && other.ok }}",
            RESERVED_NAMES,
        );
        assert_eq!(deps, set(&["check", "other"]));
    }

    #[test]
    fn test_reserved_names_and_literals_are_excluded() {
        let deps = extract_dependencies(
            &json!("{{ item.x + index + inputs.a + defaults.b + true + null + undefined + false }}"),
            RESERVED_NAMES,
        );
        assert!(deps.is_empty());
    }

    #[test]
    fn test_bare_expression_sources() {
        let deps = extract_expression_dependencies("search.output.results.length > 0", RESERVED_NAMES);
        assert_eq!(deps, set(&["search"]));
    }

    #[test]
    fn test_member_names_are_not_roots() {
        let deps = extract_dependencies(&json!("{{ a.b.c }} {{ d[0].e }}"), RESERVED_NAMES);
        assert_eq!(deps, set(&["a", "d"]));
    }

    #[test]
    fn test_malformed_fragment_falls_back_to_token_scan() {
        let deps = extract_dependencies(&json!("{{ fetch.output fmt.x }}"), RESERVED_NAMES);
        assert_eq!(deps, set(&["fetch", "fmt"]));

        let deps = extract_dependencies(&json!("{{ 'unterminated }}"), RESERVED_NAMES);
        assert!(deps.is_empty());
    }

    #[test]
    fn test_custom_reserved_set() {
        let deps = extract_dependencies(&json!("{{ env.HOME }} {{ step.output }}"), &["env"]);
        assert_eq!(deps, set(&["step"]));
    }
}
