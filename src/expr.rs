//! Pipeline and function-call expression language.
//!
//! Expressions appear inside template placeholders and come in two layers:
//! a seed term (`Name`, `'literal'`, `42`, `sum(Items[].Total)`) followed by
//! zero or more pipe steps applied left to right (`| upper() | prefix('X-')`).
//!
//! The engine is deliberately forgiving: missing paths resolve to null,
//! unknown function names yield null, and unknown pipe steps pass their input
//! through unchanged. Evaluation never raises.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::tree::{split_path, PathSegment};

/// Accepts letters, digits, underscore, dot and array brackets only.
static SIMPLE_PATH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.\[\]]+$").expect("valid pattern"));

/// One node of a parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    /// Quoted string or numeric literal
    Literal(Value),
    /// Dotted/bracketed path resolved against the tree
    Path(String),
    /// Function call with ordered arguments
    Call { name: String, args: Vec<Term> },
}

/// One step of a pipeline, with its raw (unevaluated) arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct PipeStep {
    pub name: String,
    pub args: Vec<String>,
}

/// A seed term plus the ordered pipe steps that consume it.
#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    pub seed: Term,
    pub steps: Vec<PipeStep>,
}

impl Term {
    /// Parse a single term. Never fails; unrecognized shapes become paths,
    /// which resolve to null when they match nothing.
    pub fn parse(text: &str) -> Term {
        let t = text.trim();
        if t.len() >= 2
            && ((t.starts_with('\'') && t.ends_with('\''))
                || (t.starts_with('"') && t.ends_with('"')))
        {
            return Term::Literal(Value::String(t[1..t.len() - 1].to_string()));
        }
        if let Ok(n) = t.parse::<f64>() {
            return Term::Literal(number_value(n));
        }
        if let Some((name, inner)) = call_parts(t) {
            let args = if inner.trim().is_empty() {
                Vec::new()
            } else {
                split_top_level(inner, ',')
                    .iter()
                    .map(|a| Term::parse(a))
                    .collect()
            };
            return Term::Call {
                name: name.to_string(),
                args,
            };
        }
        Term::Path(t.to_string())
    }
}

impl PipeStep {
    fn parse(text: &str) -> PipeStep {
        let t = text.trim();
        match call_parts(t) {
            Some((name, inner)) => {
                let args = if inner.trim().is_empty() {
                    Vec::new()
                } else {
                    split_top_level(inner, ',')
                        .into_iter()
                        .map(|a| a.trim().to_string())
                        .collect()
                };
                PipeStep {
                    name: name.to_string(),
                    args,
                }
            }
            None => PipeStep {
                name: t.to_string(),
                args: Vec::new(),
            },
        }
    }
}

impl Pipeline {
    /// Split an expression on top-level pipes and parse each part.
    pub fn parse(expr: &str) -> Pipeline {
        let parts = split_top_level(expr, '|');
        let seed = Term::parse(&parts[0]);
        let steps = parts[1..].iter().map(|p| PipeStep::parse(p)).collect();
        Pipeline { seed, steps }
    }
}

/// Evaluate a pipeline expression against the tree.
///
/// When `seed` is given and the first term is a bare path, the seed is used
/// directly and the term is skipped - a captured value is authoritative and
/// is not re-derived from the tree. Remaining steps apply left to right.
pub fn evaluate_pipeline(expr: &str, tree: &Value, seed: Option<&str>) -> Value {
    let pipeline = Pipeline::parse(expr);
    let mut value = match (&pipeline.seed, seed) {
        (Term::Path(_), Some(captured)) => Value::String(captured.to_string()),
        (term, _) => evaluate_term(term, tree),
    };
    for step in &pipeline.steps {
        value = apply_step(value, step, tree);
    }
    value
}

/// Evaluate a single term against the tree.
pub fn evaluate_term(term: &Term, tree: &Value) -> Value {
    match term {
        Term::Literal(v) => v.clone(),
        Term::Path(path) => value_at(tree, path),
        Term::Call { name, args } => call_function(name, args, tree),
    }
}

fn call_function(name: &str, args: &[Term], tree: &Value) -> Value {
    match name.to_ascii_lowercase().as_str() {
        "coalesce" => {
            for arg in args {
                let v = evaluate_term(arg, tree);
                if !is_blank(&v) {
                    return v;
                }
            }
            Value::Null
        }
        "concat" => {
            let joined: String = args
                .iter()
                .map(|a| display_value(&evaluate_term(a, tree)))
                .collect();
            Value::String(joined)
        }
        "sum" => {
            let evaluated: Vec<Value> = args.iter().map(|a| evaluate_term(a, tree)).collect();
            if evaluated.len() == 1 {
                if let Value::Array(items) = &evaluated[0] {
                    let total: f64 = items.iter().filter_map(numeric).sum();
                    return number_value(total);
                }
            }
            let total: f64 = evaluated.iter().filter_map(numeric).sum();
            number_value(total)
        }
        "count" => match args.first().map(|a| evaluate_term(a, tree)) {
            Some(Value::Array(items)) => Value::from(items.len() as i64),
            Some(Value::Null) | None => Value::from(0i64),
            Some(_) => Value::from(1i64),
        },
        "valueof" => args
            .first()
            .map(|a| evaluate_term(a, tree))
            .unwrap_or(Value::Null),
        "join" => {
            let sep = args
                .get(1)
                .map(|a| display_value(&evaluate_term(a, tree)))
                .unwrap_or_else(|| ", ".to_string());
            match args.first().map(|a| evaluate_term(a, tree)) {
                Some(Value::Array(items)) => {
                    let joined = items
                        .iter()
                        .map(display_value)
                        .collect::<Vec<_>>()
                        .join(&sep);
                    Value::String(joined)
                }
                Some(v) => Value::String(display_value(&v)),
                None => Value::Null,
            }
        }
        _ => Value::Null,
    }
}

fn apply_step(value: Value, step: &PipeStep, tree: &Value) -> Value {
    match step.name.to_ascii_lowercase().as_str() {
        "upper" => map_string(value, |s| s.to_uppercase()),
        "lower" => map_string(value, |s| s.to_lowercase()),
        "trim" => map_string(value, |s| s.trim().to_string()),
        "replace" => {
            let old = step_arg(step, 0, tree);
            let new = step_arg(step, 1, tree);
            match (old, new) {
                (Some(old), Some(new)) => map_string(value, |s| s.replace(&old, &new)),
                _ => value,
            }
        }
        "suffix" | "concat" => match step_arg(step, 0, tree) {
            Some(text) if !value.is_null() => {
                Value::String(format!("{}{}", display_value(&value), text))
            }
            _ => value,
        },
        "prefix" => match step_arg(step, 0, tree) {
            Some(text) if !value.is_null() => {
                Value::String(format!("{}{}", text, display_value(&value)))
            }
            _ => value,
        },
        "default" | "coalesce" => {
            if is_blank(&value) {
                match step.args.first() {
                    Some(raw) => evaluate_term(&Term::parse(raw), tree),
                    None => value,
                }
            } else {
                value
            }
        }
        "tonumber" => match numeric(&value) {
            Some(n) => number_value(n),
            None => value,
        },
        "toint" => match numeric(&value) {
            Some(n) => Value::from(n.trunc() as i64),
            None => value,
        },
        "dateformat" | "format" => {
            let fmt = match step_arg(step, 0, tree) {
                Some(f) => f,
                None => return value,
            };
            let text = display_value(&value);
            match crate::coerce::parse_datetime_general(text.trim()) {
                Some(dt) => {
                    let strf = crate::coerce::format_to_strftime(&fmt);
                    Value::String(dt.format(&strf).to_string())
                }
                None => value,
            }
        }
        _ => value,
    }
}

/// Resolve a path against the tree, never failing.
///
/// An array-marker segment selects the named array. When the path continues
/// past the marker, the remainder is projected across every element and
/// elements where the projection fails are skipped - `Items[].Total` over a
/// row array yields the array of totals.
pub fn value_at(tree: &Value, path: &str) -> Value {
    let segments = split_path(path);
    if segments.is_empty() {
        return Value::Null;
    }
    resolve(tree, &segments)
}

fn resolve(cur: &Value, segments: &[PathSegment]) -> Value {
    let (seg, rest) = match segments.split_first() {
        Some(parts) => parts,
        None => return cur.clone(),
    };
    let map = match cur {
        Value::Object(map) => map,
        _ => return Value::Null,
    };
    let child = map.get(&seg.key).or_else(|| {
        map.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(&seg.key))
            .map(|(_, v)| v)
    });
    let child = match child {
        Some(v) => v,
        None => return Value::Null,
    };
    if seg.array {
        match child {
            Value::Array(items) => {
                if rest.is_empty() {
                    child.clone()
                } else {
                    let projected: Vec<Value> = items
                        .iter()
                        .map(|item| resolve(item, rest))
                        .filter(|v| !v.is_null())
                        .collect();
                    Value::Array(projected)
                }
            }
            _ => Value::Null,
        }
    } else {
        resolve(child, rest)
    }
}

/// Split on `sep`, ignoring occurrences inside parentheses, brackets, or
/// quoted strings. Always returns at least one part.
pub fn split_top_level(text: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut cur = String::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    for c in text.chars() {
        if let Some(q) = quote {
            cur.push(c);
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => {
                quote = Some(c);
                cur.push(c);
            }
            '(' | '[' => {
                depth += 1;
                cur.push(c);
            }
            ')' | ']' => {
                depth = depth.saturating_sub(1);
                cur.push(c);
            }
            _ if c == sep && depth == 0 => parts.push(std::mem::take(&mut cur)),
            _ => cur.push(c),
        }
    }
    parts.push(cur);
    parts
}

/// True when the expression is a bare path with no pipes, calls, or literals.
pub fn is_simple_path(expr: &str) -> bool {
    SIMPLE_PATH_RE.is_match(expr.trim())
}

/// True when the expression has at least one top-level pipe step.
pub fn has_pipe(expr: &str) -> bool {
    split_top_level(expr, '|').len() > 1
}

/// Render a value as the string a pipeline step operates on. Null is empty.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

/// Null, or a string that trims to nothing.
pub fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Prefer an integer representation for fraction-free values.
pub(crate) fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        Value::from(n)
    }
}

/// Resolve a pipe-step argument: quoted literals lose their delimiters,
/// paths resolve against the tree, and an unresolvable bare word falls back
/// to its own text.
fn step_arg(step: &PipeStep, idx: usize, tree: &Value) -> Option<String> {
    let raw = step.args.get(idx)?;
    let term = Term::parse(raw);
    let resolved = evaluate_term(&term, tree);
    match (&term, &resolved) {
        (Term::Path(p), Value::Null) => Some(p.clone()),
        _ => Some(display_value(&resolved)),
    }
}

fn map_string<F: FnOnce(&str) -> String>(value: Value, op: F) -> Value {
    if value.is_null() {
        return value;
    }
    Value::String(op(&display_value(&value)))
}

fn call_parts(text: &str) -> Option<(&str, &str)> {
    if !text.ends_with(')') {
        return None;
    }
    let open = text.find('(')?;
    let name = text[..open].trim();
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return None;
    }
    Some((name, &text[open + 1..text.len() - 1]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_quoted_and_numeric_literals() {
        assert_eq!(
            Term::parse("'hello'"),
            Term::Literal(Value::String("hello".to_string()))
        );
        assert_eq!(Term::parse("42"), Term::Literal(json!(42)));
        assert_eq!(Term::parse("4.5"), Term::Literal(json!(4.5)));
    }

    #[test]
    fn test_parse_function_call_with_nested_commas() {
        let term = Term::parse("coalesce(concat(a, b), Fallback)");
        match term {
            Term::Call { name, args } => {
                assert_eq!(name, "coalesce");
                assert_eq!(args.len(), 2);
                assert!(matches!(&args[0], Term::Call { name, .. } if name == "concat"));
                assert_eq!(args[1], Term::Path("Fallback".to_string()));
            }
            other => panic!("expected call, got {:?}", other),
        }
    }

    #[test]
    fn test_split_top_level_respects_quotes_and_parens() {
        let parts = split_top_level("replace('a|b', c) | upper()", '|');
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].trim(), "replace('a|b', c)");
        assert_eq!(parts[1].trim(), "upper()");
    }

    #[test]
    fn test_pipeline_left_to_right() {
        let tree = json!({});
        let result = evaluate_pipeline("Name | upper() | prefix('X-')", &tree, Some("abc"));
        assert_eq!(result, json!("X-ABC"));
    }

    #[test]
    fn test_seed_skips_bare_path_only() {
        let tree = json!({"Name": "from-tree"});
        // Bare path seed: captured text wins.
        assert_eq!(
            evaluate_pipeline("Name", &tree, Some("captured")),
            json!("captured")
        );
        // Function seed: evaluated from scratch even with a seed present.
        assert_eq!(
            evaluate_pipeline("valueof(Name)", &tree, Some("captured")),
            json!("from-tree")
        );
    }

    #[test]
    fn test_coalesce_first_non_blank() {
        let tree = json!({"A": "", "B": "value"});
        assert_eq!(evaluate_pipeline("coalesce(A, B)", &tree, None), json!("value"));
        let tree = json!({"A": "first", "B": "value"});
        assert_eq!(evaluate_pipeline("coalesce(A, B)", &tree, None), json!("first"));
    }

    #[test]
    fn test_sum_and_count_over_projection() {
        let tree = json!({"Items": [
            {"Total": 136}, {"Total": 110}, {"Other": 1}
        ]});
        assert_eq!(evaluate_pipeline("sum(Items[].Total)", &tree, None), json!(246));
        assert_eq!(evaluate_pipeline("count(Items[])", &tree, None), json!(3));
        assert_eq!(evaluate_pipeline("sum(1, 2, 3)", &tree, None), json!(6));
    }

    #[test]
    fn test_join_with_separator() {
        let tree = json!({"Items": [{"Name": "a"}, {"Name": "b"}]});
        assert_eq!(
            evaluate_pipeline("join(Items[].Name, '; ')", &tree, None),
            json!("a; b")
        );
        assert_eq!(
            evaluate_pipeline("join(Items[].Name)", &tree, None),
            json!("a, b")
        );
    }

    #[test]
    fn test_unknown_names_never_raise() {
        let tree = json!({"X": "keep"});
        assert_eq!(evaluate_pipeline("mystery(X)", &tree, None), Value::Null);
        assert_eq!(
            evaluate_pipeline("X | sideways()", &tree, None),
            json!("keep")
        );
    }

    #[test]
    fn test_function_names_case_insensitive() {
        let tree = json!({"Items": [{"Total": 2}]});
        assert_eq!(evaluate_pipeline("SUM(Items[].Total)", &tree, None), json!(2));
        assert_eq!(
            evaluate_pipeline("Name | UPPER", &tree, Some("ab")),
            json!("AB")
        );
    }

    #[test]
    fn test_default_substitutes_blank() {
        let tree = json!({});
        assert_eq!(
            evaluate_pipeline("Missing | default('n/a')", &tree, None),
            json!("n/a")
        );
        assert_eq!(
            evaluate_pipeline("Missing | default('n/a')", &tree, Some("present")),
            json!("present")
        );
    }

    #[test]
    fn test_tonumber_leaves_unparsable_unchanged() {
        let tree = json!({});
        assert_eq!(evaluate_pipeline("V | tonumber", &tree, Some("34.5")), json!(34.5));
        assert_eq!(evaluate_pipeline("V | toint", &tree, Some("34.5")), json!(34));
        assert_eq!(
            evaluate_pipeline("V | tonumber", &tree, Some("n/a")),
            json!("n/a")
        );
    }

    #[test]
    fn test_value_at_missing_yields_null() {
        let tree = json!({"A": {"B": 1}});
        assert_eq!(value_at(&tree, "A.B"), json!(1));
        assert_eq!(value_at(&tree, "A.C"), Value::Null);
        assert_eq!(value_at(&tree, "Z.B"), Value::Null);
    }

    #[test]
    fn test_value_at_projection_skips_failures() {
        let tree = json!({"Items": [{"T": 1}, {"X": 9}, {"T": 3}]});
        assert_eq!(value_at(&tree, "Items[].T"), json!([1, 3]));
        assert_eq!(value_at(&tree, "items[].t"), json!([1, 3]));
    }

    #[test]
    fn test_is_simple_path() {
        assert!(is_simple_path("Items[].Total"));
        assert!(is_simple_path("Invoice.Number"));
        assert!(is_simple_path("Items[abc]"));
        assert!(!is_simple_path("sum(Items[].Total)"));
        assert!(!is_simple_path("Name | upper"));
    }
}
