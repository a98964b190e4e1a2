//! JSON path evaluation for `JSON_PATH` queries.
//!
//! Supports the navigation subset used by configuration clients: an optional
//! leading `$`, dot members (`$.a.b`), bracket members (`$['a']`, `$["a"]`)
//! and bracket indexes (`$[0]`). Expressions are applied to a parsed
//! `serde_json::Value`; a missing member or index yields no match rather
//! than an error, while a malformed expression is rejected up front.

use serde_json::Value;

use crate::errors::{Result, StoreError};

#[derive(Debug, PartialEq)]
enum Step {
    Member(String),
    Index(usize),
}

fn syntax_error(expr: &str, detail: &str) -> StoreError {
    StoreError::InvalidArgument(format!("invalid JSON path `{expr}`: {detail}"))
}

/// Parse an expression into navigation steps.
fn parse(expr: &str) -> Result<Vec<Step>> {
    let trimmed = expr.trim();
    if trimmed.is_empty() {
        return Err(syntax_error(expr, "empty expression"));
    }
    let mut rest = trimmed.strip_prefix('$').unwrap_or(trimmed);
    let mut steps = Vec::new();
    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix('.') {
            if after.starts_with('.') {
                return Err(syntax_error(expr, "recursive descent is not supported"));
            }
            let end = after
                .find(|c| c == '.' || c == '[')
                .unwrap_or(after.len());
            if end == 0 {
                return Err(syntax_error(expr, "empty member name"));
            }
            steps.push(Step::Member(after[..end].to_string()));
            rest = &after[end..];
        } else if let Some(after) = rest.strip_prefix('[') {
            let close = after
                .find(']')
                .ok_or_else(|| syntax_error(expr, "unterminated bracket"))?;
            let inner = &after[..close];
            if let Some(quoted) = inner
                .strip_prefix('\'')
                .and_then(|s| s.strip_suffix('\''))
                .or_else(|| inner.strip_prefix('"').and_then(|s| s.strip_suffix('"')))
            {
                steps.push(Step::Member(quoted.to_string()));
            } else {
                let index: usize = inner
                    .parse()
                    .map_err(|_| syntax_error(expr, "bracket must hold an index or a quoted name"))?;
                steps.push(Step::Index(index));
            }
            rest = &after[close + 1..];
        } else if steps.is_empty() {
            // Bare `a.b` form without a leading `$.`.
            let end = rest.find(|c| c == '.' || c == '[').unwrap_or(rest.len());
            steps.push(Step::Member(rest[..end].to_string()));
            rest = &rest[end..];
        } else {
            return Err(syntax_error(expr, "expected `.` or `[`"));
        }
    }
    Ok(steps)
}

/// Evaluate one expression against a value. `Ok(None)` means the expression
/// is well-formed but selects nothing.
pub fn evaluate(value: &Value, expr: &str) -> Result<Option<Value>> {
    let steps = parse(expr)?;
    let mut current = value;
    for step in &steps {
        match (step, current) {
            (Step::Member(name), Value::Object(map)) => match map.get(name) {
                Some(next) => current = next,
                None => return Ok(None),
            },
            (Step::Index(i), Value::Array(items)) => match items.get(*i) {
                Some(next) => current = next,
                None => return Ok(None),
            },
            _ => return Ok(None),
        }
    }
    Ok(Some(current.clone()))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn doc() -> Value {
        json!({
            "a": {"b": [10, {"c": "deep"}]},
            "k": "v",
        })
    }

    #[test]
    fn test_dot_navigation() {
        assert_eq!(evaluate(&doc(), "$.k").unwrap(), Some(json!("v")));
        assert_eq!(evaluate(&doc(), "k").unwrap(), Some(json!("v")));
        assert_eq!(
            evaluate(&doc(), "$.a.b").unwrap(),
            Some(json!([10, {"c": "deep"}]))
        );
    }

    #[test]
    fn test_bracket_navigation() {
        assert_eq!(evaluate(&doc(), "$.a.b[0]").unwrap(), Some(json!(10)));
        assert_eq!(
            evaluate(&doc(), "$['a']['b'][1].c").unwrap(),
            Some(json!("deep"))
        );
        assert_eq!(
            evaluate(&doc(), "$[\"a\"][\"b\"][1][\"c\"]").unwrap(),
            Some(json!("deep"))
        );
    }

    #[test]
    fn test_root_expression() {
        assert_eq!(evaluate(&doc(), "$").unwrap(), Some(doc()));
    }

    #[test]
    fn test_no_match() {
        assert_eq!(evaluate(&doc(), "$.missing").unwrap(), None);
        assert_eq!(evaluate(&doc(), "$.a.b[9]").unwrap(), None);
        assert_eq!(evaluate(&doc(), "$.k.nested").unwrap(), None);
    }

    #[test]
    fn test_syntax_errors() {
        assert!(evaluate(&doc(), "").is_err());
        assert!(evaluate(&doc(), "$..k").is_err());
        assert!(evaluate(&doc(), "$.a[").is_err());
        assert!(evaluate(&doc(), "$.a[x]").is_err());
        assert!(evaluate(&doc(), "$.").is_err());
    }
}
