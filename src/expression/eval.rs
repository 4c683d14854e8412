//! Evaluation of parsed expressions against a scope of named values
//!
//! Evaluation never fails. A missing key, an out-of-range index or an
//! index into a non-sequence all resolve to `undefined`, represented as
//! `None` throughout this module.

use super::parser::{BinaryOp, Expr, Path, Segment};
use serde_json::{Map, Number, Value};
use std::cmp::Ordering;

/// Source of root identifiers for path resolution
pub trait Scope: Send + Sync {
    fn lookup(&self, name: &str) -> Option<&Value>;
}

impl Scope for Map<String, Value> {
    fn lookup(&self, name: &str) -> Option<&Value> {
        self.get(name)
    }
}

impl Scope for Value {
    fn lookup(&self, name: &str) -> Option<&Value> {
        self.as_object().and_then(|map| map.get(name))
    }
}

/// Scope for one loop iteration: `item`, `index` and the outputs of earlier
/// body steps shadow the enclosing scope
pub struct LoopScope<'a> {
    parent: &'a dyn Scope,
    item: &'a Value,
    index: Value,
    locals: Option<&'a Map<String, Value>>,
}

impl<'a> LoopScope<'a> {
    pub fn new(parent: &'a dyn Scope, item: &'a Value, index: usize) -> Self {
        Self {
            parent,
            item,
            index: Value::from(index),
            locals: None,
        }
    }

    /// Attach the per-iteration outputs of body steps
    pub fn with_locals(mut self, locals: &'a Map<String, Value>) -> Self {
        self.locals = Some(locals);
        self
    }
}

impl Scope for LoopScope<'_> {
    fn lookup(&self, name: &str) -> Option<&Value> {
        match name {
            "item" => Some(self.item),
            "index" => Some(&self.index),
            _ => self
                .locals
                .and_then(|locals| locals.get(name))
                .or_else(|| self.parent.lookup(name)),
        }
    }
}

/// Evaluate an expression; `None` means `undefined`
pub fn evaluate(expr: &Expr, scope: &dyn Scope) -> Option<Value> {
    match expr {
        Expr::Undefined => None,
        Expr::Literal(value) => Some(value.clone()),
        Expr::Path(path) => resolve_path(path, scope),
        Expr::Not(inner) => Some(Value::Bool(!is_truthy(evaluate(inner, scope).as_ref()))),
        Expr::Binary { op, left, right } => {
            let lhs = evaluate(left, scope);
            match op {
                BinaryOp::Or => {
                    if is_present(lhs.as_ref()) {
                        lhs
                    } else {
                        evaluate(right, scope)
                    }
                }
                BinaryOp::And => {
                    if is_truthy(lhs.as_ref()) {
                        evaluate(right, scope)
                    } else {
                        lhs
                    }
                }
                BinaryOp::Concat => {
                    let rhs = evaluate(right, scope);
                    let mut text = to_text(lhs.as_ref());
                    text.push_str(&to_text(rhs.as_ref()));
                    Some(Value::String(text))
                }
                _ => {
                    let rhs = evaluate(right, scope);
                    Some(Value::Bool(compare(*op, lhs.as_ref(), rhs.as_ref())))
                }
            }
        }
    }
}

fn resolve_path(path: &Path, scope: &dyn Scope) -> Option<Value> {
    let mut current = scope.lookup(&path.root)?;

    for (i, segment) in path.segments.iter().enumerate() {
        let is_last = i + 1 == path.segments.len();
        current = match (segment, current) {
            (Segment::Key(key), Value::Object(map)) => map.get(key)?,
            (Segment::Key(key), Value::Array(items)) if key == "length" && is_last => {
                return Some(Value::from(items.len()));
            }
            (Segment::Key(key), Value::String(s)) if key == "length" && is_last => {
                return Some(Value::from(s.chars().count()));
            }
            (Segment::Index(index), Value::Array(items)) => items.get(*index)?,
            _ => return None,
        };
    }

    Some(current.clone())
}

fn compare(op: BinaryOp, lhs: Option<&Value>, rhs: Option<&Value>) -> bool {
    match op {
        BinaryOp::LooseEq => loose_eq(lhs, rhs),
        BinaryOp::LooseNe => !loose_eq(lhs, rhs),
        BinaryOp::StrictEq => strict_eq(lhs, rhs),
        BinaryOp::StrictNe => !strict_eq(lhs, rhs),
        BinaryOp::Lt => ordering(lhs, rhs) == Some(Ordering::Less),
        BinaryOp::Le => matches!(ordering(lhs, rhs), Some(Ordering::Less | Ordering::Equal)),
        BinaryOp::Gt => ordering(lhs, rhs) == Some(Ordering::Greater),
        BinaryOp::Ge => matches!(
            ordering(lhs, rhs),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        BinaryOp::Or | BinaryOp::And | BinaryOp::Concat => false,
    }
}

fn loose_eq(lhs: Option<&Value>, rhs: Option<&Value>) -> bool {
    match (lhs, rhs) {
        (None | Some(Value::Null), None | Some(Value::Null)) => true,
        (None | Some(Value::Null), _) | (_, None | Some(Value::Null)) => false,
        (Some(Value::Number(a)), Some(Value::Number(b))) => a.as_f64() == b.as_f64(),
        (Some(Value::Number(n)), Some(Value::String(s)))
        | (Some(Value::String(s)), Some(Value::Number(n))) => {
            s.trim().parse::<f64>().ok() == n.as_f64()
        }
        (Some(Value::Bool(b)), Some(other)) | (Some(other), Some(Value::Bool(b))) => {
            let as_number = Value::from(u8::from(*b));
            match other {
                Value::Bool(o) => b == o,
                _ => loose_eq(Some(&as_number), Some(other)),
            }
        }
        (Some(a), Some(b)) => a == b,
    }
}

fn strict_eq(lhs: Option<&Value>, rhs: Option<&Value>) -> bool {
    match (lhs, rhs) {
        (Some(Value::Number(a)), Some(Value::Number(b))) => a.as_f64() == b.as_f64(),
        _ => lhs == rhs,
    }
}

fn ordering(lhs: Option<&Value>, rhs: Option<&Value>) -> Option<Ordering> {
    match (lhs?, rhs?) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Truthiness used by `!`, `&&` and step conditions
pub fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(_) | Value::Object(_)) => true,
    }
}

/// Whether `||` accepts an operand: anything except undefined, null,
/// `false` and the empty string
fn is_present(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) | Some(Value::Bool(false)) => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

/// Text form used by `+`; null and undefined become the empty string
pub(crate) fn to_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => format_number(n),
        Some(Value::Bool(b)) => b.to_string(),
        Some(structured) => serde_json::to_string(structured).unwrap_or_default(),
    }
}

/// Integral floats print without a fractional part (`3.0` -> `3`)
pub(crate) fn format_number(n: &Number) -> String {
    match n.as_f64() {
        Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
        _ => n.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::parser::parse_expression;
    use serde_json::json;

    fn eval(src: &str, scope: &Value) -> Option<Value> {
        evaluate(&parse_expression(src).unwrap(), scope)
    }

    fn scope() -> Value {
        json!({
            "inputs": {"query": "rust", "limit": 5, "empty": ""},
            "search": {
                "status": "completed",
                "output": {"results": [{"title": "first"}, {"title": "second"}]}
            },
            "check": {"status": "completed", "output": {"found": false, "score": 0.97}}
        })
    }

    #[test]
    fn test_path_resolution() {
        let ctx = scope();
        assert_eq!(eval("inputs.query", &ctx), Some(json!("rust")));
        assert_eq!(
            eval("search.output.results[1].title", &ctx),
            Some(json!("second"))
        );
        assert_eq!(eval("search.output.results.length", &ctx), Some(json!(2)));
        assert_eq!(eval("inputs.query.length", &ctx), Some(json!(4)));
    }

    #[test]
    fn test_missing_data_is_undefined() {
        let ctx = scope();
        assert_eq!(eval("nothing", &ctx), None);
        assert_eq!(eval("search.output.missing.deeper", &ctx), None);
        assert_eq!(eval("search.output.results[9]", &ctx), None);
        assert_eq!(eval("inputs.query[0]", &ctx), None);
        assert_eq!(eval("search.output.results.length.more", &ctx), None);
    }

    #[test]
    fn test_or_returns_first_present_operand() {
        let ctx = scope();
        assert_eq!(eval("'' || 'default'", &ctx), Some(json!("default")));
        assert_eq!(eval("false || 0", &ctx), Some(json!(0)));
        assert_eq!(eval("missing || null", &ctx), Some(Value::Null));
        assert_eq!(eval("inputs.empty || inputs.query", &ctx), Some(json!("rust")));
        assert_eq!(eval("missing || undefined", &ctx), None);
    }

    #[test]
    fn test_and_returns_first_falsy_operand() {
        let ctx = scope();
        assert_eq!(eval("inputs.query && inputs.limit", &ctx), Some(json!(5)));
        assert_eq!(eval("0 && inputs.limit", &ctx), Some(json!(0)));
    }

    #[test]
    fn test_concat_coercion() {
        let ctx = scope();
        assert_eq!(eval("'q=' + inputs.query", &ctx), Some(json!("q=rust")));
        assert_eq!(eval("'n=' + inputs.limit", &ctx), Some(json!("n=5")));
        assert_eq!(eval("'x' + missing + null", &ctx), Some(json!("x")));
        assert_eq!(
            eval("'' + search.output.results[0]", &ctx),
            Some(json!("{\"title\":\"first\"}"))
        );
        assert_eq!(eval("'v' + 2.0", &ctx), Some(json!("v2")));
    }

    #[test]
    fn test_negation_and_comparisons() {
        let ctx = scope();
        assert_eq!(eval("!check.output.found", &ctx), Some(json!(true)));
        assert_eq!(eval("check.output.score > 0.85", &ctx), Some(json!(true)));
        assert_eq!(eval("search.output.results.length >= 1", &ctx), Some(json!(true)));
        assert_eq!(eval("inputs.query < 5", &ctx), Some(json!(false)));
        assert_eq!(eval("'a' < 'b'", &ctx), Some(json!(true)));
    }

    #[test]
    fn test_equality() {
        let ctx = scope();
        assert_eq!(eval("missing == null", &ctx), Some(json!(true)));
        assert_eq!(eval("missing === null", &ctx), Some(json!(false)));
        assert_eq!(eval("inputs.limit == '5'", &ctx), Some(json!(true)));
        assert_eq!(eval("inputs.limit === '5'", &ctx), Some(json!(false)));
        assert_eq!(eval("inputs.limit === 5.0", &ctx), Some(json!(true)));
        assert_eq!(eval("search.status != 'error'", &ctx), Some(json!(true)));
        assert_eq!(eval("true == 1", &ctx), Some(json!(true)));
    }

    #[test]
    fn test_truthiness() {
        assert!(!is_truthy(None));
        assert!(!is_truthy(Some(&json!(null))));
        assert!(!is_truthy(Some(&json!(0))));
        assert!(!is_truthy(Some(&json!(""))));
        assert!(is_truthy(Some(&json!([]))));
        assert!(is_truthy(Some(&json!("false"))));
    }

    #[test]
    fn test_loop_scope_shadows_parent() {
        let ctx = scope();
        let item = json!({"name": "doc"});
        let mut locals = Map::new();
        locals.insert("chunk".into(), json!({"output": [1, 2]}));
        let loop_scope = LoopScope::new(&ctx, &item, 3).with_locals(&locals);

        let expr = parse_expression("item.name + '-' + index").unwrap();
        assert_eq!(evaluate(&expr, &loop_scope), Some(json!("doc-3")));

        let expr = parse_expression("chunk.output.length").unwrap();
        assert_eq!(evaluate(&expr, &loop_scope), Some(json!(2)));

        let expr = parse_expression("inputs.query").unwrap();
        assert_eq!(evaluate(&expr, &loop_scope), Some(json!("rust")));
    }
}
