//! The query compiler: one expression tree, two evaluators.
//!
//! An expression compiles into parameterized SQL (plus an auto-named
//! constants map) for the database, and into an equivalent predicate over a
//! row's raw values for the dirty set. Running a query merges both result
//! sources so reads stay consistent while changes are pending.

mod eval;
mod sql;

use crate::entity::row::Row;
use crate::entity::Entity;
use crate::error::{DbError, DbResult};
use crate::schema::field::FieldKind;
use sqlent_driver::Value;
use std::collections::{HashMap, HashSet};

/// Comparison operators of the expression DSL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `=`
    Eq,
    /// `~=`
    Ne,
}

impl CmpOp {
    fn from_token(token: &str) -> Option<Self> {
        Some(match token {
            ">" => CmpOp::Gt,
            ">=" => CmpOp::Ge,
            "<" => CmpOp::Lt,
            "<=" => CmpOp::Le,
            "=" => CmpOp::Eq,
            "~=" => CmpOp::Ne,
            _ => return None,
        })
    }

    fn sql(self) -> &'static str {
        match self {
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Eq => "=",
            CmpOp::Ne => "<>",
        }
    }
}

/// An operand of a comparison.
///
/// Tokens are classified at compile time against the target entity: a field
/// reference, a JSON path (`field.sub.sub`), a parameter (`:name`), a quoted
/// constant (`'text'`), or a bare constant. A [`Operand::Value`] is a
/// wrapped constant used verbatim.
#[derive(Debug, Clone)]
pub enum Operand {
    /// A token, classified at compile time.
    Token(String),
    /// A constant value, used as-is.
    Value(Value),
}

impl From<&str> for Operand {
    fn from(s: &str) -> Self {
        Operand::Token(s.to_string())
    }
}

impl From<String> for Operand {
    fn from(s: String) -> Self {
        Operand::Token(s)
    }
}

impl From<Value> for Operand {
    fn from(v: Value) -> Self {
        Operand::Value(v)
    }
}

impl From<i64> for Operand {
    fn from(v: i64) -> Self {
        Operand::Value(Value::Integer(v))
    }
}

impl From<f64> for Operand {
    fn from(v: f64) -> Self {
        Operand::Value(Value::Real(v))
    }
}

/// A query expression tree.
#[derive(Debug, Clone)]
pub enum Expr {
    /// Every sub-expression matches.
    All(Vec<Expr>),
    /// At least one sub-expression matches.
    Any(Vec<Expr>),
    /// The operand is null.
    IsNull(Operand),
    /// The operand is not null.
    IsNotNull(Operand),
    /// A binary comparison.
    Cmp(CmpOp, Operand, Operand),
}

impl Expr {
    /// AND of sub-expressions.
    #[must_use]
    pub fn all(parts: Vec<Expr>) -> Self {
        Expr::All(parts)
    }

    /// OR of sub-expressions.
    #[must_use]
    pub fn any(parts: Vec<Expr>) -> Self {
        Expr::Any(parts)
    }

    /// `a = b`
    pub fn eq(a: impl Into<Operand>, b: impl Into<Operand>) -> Self {
        Expr::Cmp(CmpOp::Eq, a.into(), b.into())
    }

    /// `a ~= b`
    pub fn ne(a: impl Into<Operand>, b: impl Into<Operand>) -> Self {
        Expr::Cmp(CmpOp::Ne, a.into(), b.into())
    }

    /// `a > b`
    pub fn gt(a: impl Into<Operand>, b: impl Into<Operand>) -> Self {
        Expr::Cmp(CmpOp::Gt, a.into(), b.into())
    }

    /// `a >= b`
    pub fn ge(a: impl Into<Operand>, b: impl Into<Operand>) -> Self {
        Expr::Cmp(CmpOp::Ge, a.into(), b.into())
    }

    /// `a < b`
    pub fn lt(a: impl Into<Operand>, b: impl Into<Operand>) -> Self {
        Expr::Cmp(CmpOp::Lt, a.into(), b.into())
    }

    /// `a <= b`
    pub fn le(a: impl Into<Operand>, b: impl Into<Operand>) -> Self {
        Expr::Cmp(CmpOp::Le, a.into(), b.into())
    }

    /// The operand is null.
    pub fn is_null(op: impl Into<Operand>) -> Self {
        Expr::IsNull(op.into())
    }

    /// The operand is not null.
    pub fn is_not_null(op: impl Into<Operand>) -> Self {
        Expr::IsNotNull(op.into())
    }

    /// Parses the whitespace-split string convenience form.
    ///
    /// Accepts operator-first (`"> age :min"`) and infix (`"age > :min"`)
    /// orderings for comparisons, and `"age is_null"` / `"is_null age"` for
    /// the unary tests.
    pub fn parse(s: &str) -> DbResult<Expr> {
        let tokens: Vec<&str> = s.split_whitespace().collect();
        let unary = |op: &str, operand: &str| -> Option<Expr> {
            match op {
                "is_null" => Some(Expr::is_null(operand)),
                "is_not_null" => Some(Expr::is_not_null(operand)),
                _ => None,
            }
        };
        match tokens.as_slice() {
            [a, b] => unary(a, b)
                .or_else(|| unary(b, a))
                .ok_or_else(|| DbError::query_compile(format!("cannot parse expression '{s}'"))),
            [a, b, c] => {
                if let Some(op) = CmpOp::from_token(a) {
                    Ok(Expr::Cmp(op, (*b).into(), (*c).into()))
                } else if let Some(op) = CmpOp::from_token(b) {
                    Ok(Expr::Cmp(op, (*a).into(), (*c).into()))
                } else {
                    Err(DbError::query_compile(format!(
                        "no operator in expression '{s}'"
                    )))
                }
            }
            _ => Err(DbError::query_compile(format!(
                "expected 2 or 3 tokens in expression '{s}'"
            ))),
        }
    }
}

/// A compiled expression: leaves resolved against the target entity.
#[derive(Debug, Clone)]
pub(crate) enum CExpr {
    All(Vec<CExpr>),
    Any(Vec<CExpr>),
    IsNull(CLeaf),
    IsNotNull(CLeaf),
    Cmp(CmpOp, CLeaf, CLeaf),
}

#[derive(Debug, Clone)]
pub(crate) enum CLeaf {
    Field(String),
    #[cfg(feature = "json")]
    JsonPath(String, Vec<String>),
    Param(String),
    Const(Value),
}

/// A compiled query over one entity.
///
/// Holds the SQL text with its auto-named constants and the equivalent
/// in-memory predicate. Obtained from [`Entity::query`]; executed with
/// [`Query::run`].
pub struct Query {
    entity: Entity,
    sql: String,
    consts: Vec<(String, Value)>,
    params_used: Vec<String>,
    root: CExpr,
}

impl Query {
    pub(crate) fn compile(entity: Entity, mut terms: Vec<Expr>) -> DbResult<Self> {
        // Multiple top-level terms are an implicit AND.
        let expr = if terms.len() == 1 {
            terms.remove(0)
        } else {
            Expr::All(terms)
        };
        let root = lower(&entity, &expr)?;

        let mut params_used = Vec::new();
        collect_params(&root, &mut params_used);

        let mut consts = Vec::new();
        let cond = sql::emit(&root, &mut consts);
        let sql = format!("{} WHERE {cond}", entity.select_sql());

        Ok(Self {
            entity,
            sql,
            consts,
            params_used,
            root,
        })
    }

    /// The target entity.
    #[must_use]
    pub fn entity(&self) -> Entity {
        self.entity.clone()
    }

    /// The compiled SQL text.
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Evaluates the in-memory predicate against one row.
    pub fn test(&self, row: &Row, params: &[(&str, Value)]) -> DbResult<bool> {
        let params = self.eval_params(params)?;
        eval::eval(&self.root, row, &params)
    }

    /// Runs the query: database results merged with matching dirty rows.
    ///
    /// Rejected while a transaction is active, since the SQL side cannot see
    /// uncommitted overlay writes.
    pub fn run(&self, params: &[(&str, Value)]) -> DbResult<Vec<Row>> {
        let db = self.entity.db()?;
        db.ensure_open()?;
        if db.transaction_active() {
            return Err(DbError::QueryInTransaction);
        }

        let eval_params = self.eval_params(params)?;

        let mut named: Vec<(String, Value)> = Vec::new();
        for name in &self.params_used {
            let value = eval_params
                .get(name)
                .cloned()
                .ok_or_else(|| DbError::value(format!("missing parameter ':{name}'")))?;
            named.push((format!(":{name}"), value));
        }
        for (name, value) in &self.consts {
            named.push((name.clone(), value.clone()));
        }

        // Materialize through the identity map; repeats dedupe.
        let fetched = db.query_all_retry(&self.sql, &named)?;
        let mut seen: HashSet<u64> = HashSet::new();
        let mut results: Vec<Row> = Vec::new();
        for values in fetched {
            let row = self.entity.row_from_db(&db, values)?;
            if seen.insert(row.serial()) {
                results.push(row);
            }
        }

        // Merge the dirty set: matching rows join, stale ones drop out.
        let dirty = self.entity.cache().dirty_rows();
        for row in dirty {
            if row.deleted() {
                if seen.remove(&row.serial()) {
                    results.retain(|r| r.serial() != row.serial());
                }
            } else if eval::eval(&self.root, &row, &eval_params)? {
                if seen.insert(row.serial()) {
                    results.push(row);
                }
            } else if seen.remove(&row.serial()) {
                results.retain(|r| r.serial() != row.serial());
            }
        }

        Ok(results)
    }

    /// Lowercases caller parameters and checks the used set is covered.
    fn eval_params(&self, params: &[(&str, Value)]) -> DbResult<HashMap<String, Value>> {
        let mut map = HashMap::new();
        for (name, value) in params {
            let name = name.trim_start_matches(':').to_lowercase();
            if name.starts_with('_') {
                return Err(DbError::query_compile(format!(
                    "parameter name ':{name}' uses the reserved ':_' prefix"
                )));
            }
            map.insert(name, value.clone());
        }
        for used in &self.params_used {
            if !map.contains_key(used) {
                return Err(DbError::value(format!("missing parameter ':{used}'")));
            }
        }
        Ok(map)
    }
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("entity", &self.entity.name())
            .field("sql", &self.sql)
            .finish_non_exhaustive()
    }
}

/// Resolves operand tokens against the entity's fields.
fn lower(entity: &Entity, expr: &Expr) -> DbResult<CExpr> {
    Ok(match expr {
        Expr::All(parts) => CExpr::All(
            parts
                .iter()
                .map(|p| lower(entity, p))
                .collect::<DbResult<_>>()?,
        ),
        Expr::Any(parts) => CExpr::Any(
            parts
                .iter()
                .map(|p| lower(entity, p))
                .collect::<DbResult<_>>()?,
        ),
        Expr::IsNull(op) => CExpr::IsNull(classify(entity, op)?),
        Expr::IsNotNull(op) => CExpr::IsNotNull(classify(entity, op)?),
        Expr::Cmp(op, a, b) => CExpr::Cmp(*op, classify(entity, a)?, classify(entity, b)?),
    })
}

fn classify(entity: &Entity, operand: &Operand) -> DbResult<CLeaf> {
    let token = match operand {
        Operand::Value(v) => return Ok(CLeaf::Const(v.clone())),
        Operand::Token(t) => t.trim(),
    };

    if let Some(rest) = token.strip_prefix(':') {
        let name = rest.to_lowercase();
        if name.is_empty() {
            return Err(DbError::query_compile("empty parameter name"));
        }
        if name.starts_with('_') {
            return Err(DbError::query_compile(format!(
                "parameter name ':{name}' uses the reserved ':_' prefix"
            )));
        }
        return Ok(CLeaf::Param(name));
    }

    if token.len() >= 2 && token.starts_with('\'') && token.ends_with('\'') {
        return Ok(CLeaf::Const(Value::Text(
            token[1..token.len() - 1].to_string(),
        )));
    }

    let lower = token.to_lowercase();
    if let Ok(def) = entity.field(&lower) {
        if def.is_virtual() {
            return Err(DbError::query_compile(format!(
                "virtual field '{lower}' cannot be queried"
            )));
        }
        return Ok(CLeaf::Field(lower));
    }

    if let Some((head, rest)) = lower.split_once('.') {
        if let Ok(def) = entity.field(head) {
            if def.kind() != FieldKind::Json {
                return Err(DbError::query_compile(format!(
                    "path '{lower}' on non-json field '{head}'"
                )));
            }
            #[cfg(feature = "json")]
            {
                let path: Vec<String> = rest.split('.').map(str::to_string).collect();
                return Ok(CLeaf::JsonPath(head.to_string(), path));
            }
            #[cfg(not(feature = "json"))]
            {
                return Err(DbError::json(format!(
                    "json codec is not available; cannot compile path '{lower}'"
                )));
            }
        }
    }

    // Bare constant.
    if let Ok(i) = token.parse::<i64>() {
        return Ok(CLeaf::Const(Value::Integer(i)));
    }
    if let Ok(r) = token.parse::<f64>() {
        return Ok(CLeaf::Const(Value::Real(r)));
    }
    Ok(CLeaf::Const(Value::Text(token.to_string())))
}

fn collect_params(expr: &CExpr, out: &mut Vec<String>) {
    match expr {
        CExpr::All(parts) | CExpr::Any(parts) => {
            for part in parts {
                collect_params(part, out);
            }
        }
        CExpr::IsNull(leaf) | CExpr::IsNotNull(leaf) => collect_param_leaf(leaf, out),
        CExpr::Cmp(_, a, b) => {
            collect_param_leaf(a, out);
            collect_param_leaf(b, out);
        }
    }
}

fn collect_param_leaf(leaf: &CLeaf, out: &mut Vec<String>) {
    if let CLeaf::Param(name) = leaf {
        if !out.contains(name) {
            out.push(name.clone());
        }
    }
}
