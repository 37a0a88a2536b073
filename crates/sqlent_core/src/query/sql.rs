//! SQL emission: one of the two evaluators of a compiled expression.

use crate::query::{CExpr, CLeaf};
use sqlent_driver::Value;

/// Renders a compiled expression to a SQL condition, appending auto-named
/// constants (`:_1`, `:_2`, ...) to `consts` in emission order.
pub(crate) fn emit(expr: &CExpr, consts: &mut Vec<(String, Value)>) -> String {
    match expr {
        CExpr::All(parts) => join(parts, " AND ", consts),
        CExpr::Any(parts) => join(parts, " OR ", consts),
        CExpr::IsNull(leaf) => format!("({} IS NULL)", leaf_sql(leaf, consts)),
        CExpr::IsNotNull(leaf) => format!("({} IS NOT NULL)", leaf_sql(leaf, consts)),
        CExpr::Cmp(op, a, b) => format!(
            "({} {} {})",
            leaf_sql(a, consts),
            op.sql(),
            leaf_sql(b, consts)
        ),
    }
}

fn join(parts: &[CExpr], sep: &str, consts: &mut Vec<(String, Value)>) -> String {
    if parts.is_empty() {
        // An empty aggregate matches everything.
        return "1".to_string();
    }
    let rendered: Vec<String> = parts.iter().map(|p| emit(p, consts)).collect();
    format!("({})", rendered.join(sep))
}

fn leaf_sql(leaf: &CLeaf, consts: &mut Vec<(String, Value)>) -> String {
    match leaf {
        CLeaf::Field(name) => format!("\"{name}\""),
        #[cfg(feature = "json")]
        CLeaf::JsonPath(field, path) => {
            format!("json_extract(\"{field}\", '$.{}')", path.join("."))
        }
        CLeaf::Param(name) => format!(":{name}"),
        CLeaf::Const(value) => {
            let name = format!(":_{}", consts.len() + 1);
            consts.push((name.clone(), value.clone()));
            name
        }
    }
}
