//! # sqlent
//!
//! An in-process entity manager layered over embedded SQLite.
//!
//! Applications declare related tables at runtime, fetch and mutate rows as
//! identity-mapped objects with typed fields and foreign-key navigation, and
//! defer all writes into a single atomic [`Database::flush`] that respects
//! cross-table dependency order.
//!
//! The load-bearing pieces:
//! - an identity-mapped row cache with weak indexes and a strong dirty set;
//! - a two-phase flush that tolerates forward foreign-key references;
//! - transaction-scoped overlays with full in-memory rollback;
//! - a dual-evaluator query engine producing SQL for the database and an
//!   equivalent predicate over pending in-memory rows.
//!
//! ```rust,ignore
//! use sqlent_core::{Database, EntityOptions, Key, text};
//!
//! let db = Database::open_in_memory()?;
//! let maps = db.entity(
//!     "map",
//!     Key::Name("key".into()),
//!     vec![("key", text().into()), ("value", text().into())],
//!     EntityOptions::default(),
//! )?;
//! maps.create()?;
//!
//! maps.new(vec![("key", "a".into()), ("value", "b".into())], false)?;
//! db.flush()?;
//!
//! let row = maps.get("a")?.expect("persisted");
//! assert_eq!(row.get("value")?.as_value().unwrap().as_text(), Some("b"));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod database;
mod ddl;
mod entity;
mod error;
mod flush;
mod query;
mod schema;
mod transaction;
mod types;

pub use database::Database;
pub use entity::row::{Fetched, Row, SetValue};
pub use entity::Entity;
pub use error::{DbError, DbResult};
pub use query::{CmpOp, Expr, Operand, Query};
pub use schema::field::{blob, fkey, id, int, numeric, real, text, FieldDef, FieldKind, FieldSpec};
pub use schema::{EntityOptions, Key};
pub use types::{OnChange, Retry};

#[cfg(feature = "json")]
pub use entity::row::JsonMut;
#[cfg(feature = "json")]
pub use schema::field::json;

pub use sqlent_driver::{Driver, Value};

/// Library version as a `(major, minor, patch)` triple.
pub const VERSION: (u32, u32, u32) = (0, 3, 0);

/// Human-readable version string.
#[must_use]
pub fn version_string() -> String {
    format!("sqlent {}", env!("CARGO_PKG_VERSION"))
}
