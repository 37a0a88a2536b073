//! In-memory predicate evaluation: the second evaluator of a compiled
//! expression, running over a row's raw lookup values with SQL comparison
//! semantics (null never compares true).

use crate::entity::row::Row;
use crate::error::{DbError, DbResult};
use crate::query::{CExpr, CLeaf, CmpOp};
use sqlent_driver::Value;
use std::cmp::Ordering;
use std::collections::HashMap;

pub(crate) fn eval(expr: &CExpr, row: &Row, params: &HashMap<String, Value>) -> DbResult<bool> {
    Ok(match expr {
        CExpr::All(parts) => {
            for part in parts {
                if !eval(part, row, params)? {
                    return Ok(false);
                }
            }
            true
        }
        CExpr::Any(parts) => {
            if parts.is_empty() {
                return Ok(true);
            }
            for part in parts {
                if eval(part, row, params)? {
                    return Ok(true);
                }
            }
            false
        }
        CExpr::IsNull(leaf) => leaf_value(leaf, row, params)?.is_null(),
        CExpr::IsNotNull(leaf) => !leaf_value(leaf, row, params)?.is_null(),
        CExpr::Cmp(op, a, b) => {
            let a = leaf_value(a, row, params)?;
            let b = leaf_value(b, row, params)?;
            match sql_cmp(&a, &b) {
                None => false,
                Some(ord) => match op {
                    CmpOp::Gt => ord == Ordering::Greater,
                    CmpOp::Ge => ord != Ordering::Less,
                    CmpOp::Lt => ord == Ordering::Less,
                    CmpOp::Le => ord != Ordering::Greater,
                    CmpOp::Eq => ord == Ordering::Equal,
                    CmpOp::Ne => ord != Ordering::Equal,
                },
            }
        }
    })
}

fn leaf_value(leaf: &CLeaf, row: &Row, params: &HashMap<String, Value>) -> DbResult<Value> {
    match leaf {
        CLeaf::Field(name) => row.raw(name),
        #[cfg(feature = "json")]
        CLeaf::JsonPath(field, path) => json_path_value(row, field, path),
        CLeaf::Param(name) => params
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::value(format!("missing parameter ':{name}'"))),
        CLeaf::Const(value) => Ok(value.clone()),
    }
}

/// Navigates a decoded JSON value the way `json_extract` would.
#[cfg(feature = "json")]
fn json_path_value(row: &Row, field: &str, path: &[String]) -> DbResult<Value> {
    use crate::entity::row::Fetched;

    let decoded = match row.get(field)? {
        Fetched::Json(v) => v,
        _ => return Ok(Value::Null),
    };
    let mut current = &decoded;
    for part in path {
        current = match current {
            serde_json::Value::Object(map) => match map.get(part) {
                Some(v) => v,
                None => return Ok(Value::Null),
            },
            serde_json::Value::Array(items) => match part.parse::<usize>().ok().and_then(|i| items.get(i)) {
                Some(v) => v,
                None => return Ok(Value::Null),
            },
            _ => return Ok(Value::Null),
        };
    }
    Ok(json_scalar(current))
}

#[cfg(feature = "json")]
fn json_scalar(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Integer(i64::from(*b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Integer(i)
            } else {
                Value::Real(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => Value::Text(s.clone()),
        // json_extract renders composites back to JSON text.
        other => Value::Text(other.to_string()),
    }
}

/// SQL ordering over values: null is incomparable, numbers sort before
/// text, text before blobs, numeric comparison crosses integer and real.
fn sql_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Integer(_) | Value::Real(_) => 1,
            Value::Text(_) => 2,
            Value::Blob(_) => 3,
        }
    }

    if a.is_null() || b.is_null() {
        return None;
    }
    match (a, b) {
        (Value::Integer(x), Value::Integer(y)) => Some(x.cmp(y)),
        (Value::Integer(_) | Value::Real(_), Value::Integer(_) | Value::Real(_)) => {
            match (a.as_real(), b.as_real()) {
                (Some(x), Some(y)) => x.partial_cmp(&y),
                _ => None,
            }
        }
        (Value::Text(x), Value::Text(y)) => Some(x.cmp(y)),
        (Value::Blob(x), Value::Blob(y)) => Some(x.cmp(y)),
        _ => Some(rank(a).cmp(&rank(b))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_never_compares() {
        assert!(sql_cmp(&Value::Null, &Value::Integer(1)).is_none());
        assert!(sql_cmp(&Value::Null, &Value::Null).is_none());
    }

    #[test]
    fn cross_numeric_comparison() {
        assert_eq!(
            sql_cmp(&Value::Integer(2), &Value::Real(2.0)),
            Some(Ordering::Equal)
        );
        assert_eq!(
            sql_cmp(&Value::Real(1.5), &Value::Integer(2)),
            Some(Ordering::Less)
        );
    }

    #[test]
    fn storage_class_ordering() {
        assert_eq!(
            sql_cmp(&Value::Integer(999), &Value::Text("a".into())),
            Some(Ordering::Less)
        );
        assert_eq!(
            sql_cmp(&Value::Blob(vec![0]), &Value::Text("z".into())),
            Some(Ordering::Greater)
        );
    }
}
