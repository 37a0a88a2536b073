//! Connection handle over the embedded SQL engine.

use crate::error::{DriverError, DriverResult};
use crate::value::Value;
use parking_lot::RwLock;
use rusqlite::{params_from_iter, Connection, ToSql};
use std::path::Path;
use tracing::debug;

/// A handle to one SQLite connection.
///
/// The driver is the entity manager's only route to the database. It keeps
/// every statement path behind [`Connection::prepare_cached`], so repeated
/// statements are prepared once and re-prepared transparently after an
/// engine-level invalidation.
///
/// The connection lives behind a lock only so `close` works while shared
/// handles exist; the manager itself is single-threaded.
pub struct Driver {
    conn: RwLock<Option<Connection>>,
}

impl Driver {
    /// Opens a database at `path`, or an in-memory database when `None`.
    ///
    /// Foreign-key enforcement is switched on for the connection.
    pub fn open(path: Option<&Path>) -> DriverResult<Self> {
        let conn = match path {
            Some(p) => Connection::open(p)?,
            None => Connection::open_in_memory()?,
        };
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        debug!(path = ?path, "opened database");
        Ok(Self {
            conn: RwLock::new(Some(conn)),
        })
    }

    /// Opens a fresh in-memory database.
    pub fn open_in_memory() -> DriverResult<Self> {
        Self::open(None)
    }

    /// Closes the connection. Subsequent operations fail with
    /// [`DriverError::Closed`]. Closing twice is a no-op.
    pub fn close(&self) -> DriverResult<()> {
        let mut guard = self.conn.write();
        if let Some(conn) = guard.take() {
            conn.close().map_err(|(_, e)| DriverError::Sqlite(e))?;
        }
        Ok(())
    }

    /// Returns true if the connection is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.conn.read().is_some()
    }

    /// Runs a closure against the open connection.
    pub fn with_conn<R>(&self, f: impl FnOnce(&Connection) -> DriverResult<R>) -> DriverResult<R> {
        let guard = self.conn.read();
        match guard.as_ref() {
            Some(conn) => f(conn),
            None => Err(DriverError::Closed),
        }
    }

    /// Executes one or more SQL statements that take no parameters.
    pub fn exec(&self, sql: &str) -> DriverResult<()> {
        self.with_conn(|conn| {
            conn.execute_batch(sql)?;
            Ok(())
        })
    }

    /// Executes a cached statement with positional parameters.
    ///
    /// Returns the number of affected rows.
    pub fn execute_cached(&self, sql: &str, params: &[Value]) -> DriverResult<usize> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(sql)?;
            Ok(stmt.execute(params_from_iter(params.iter()))?)
        })
    }

    /// Runs a cached query with positional parameters, expecting at most one
    /// row. Returns its columns, or `None` when the query matched nothing.
    pub fn query_row_cached(&self, sql: &str, params: &[Value]) -> DriverResult<Option<Vec<Value>>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(sql)?;
            let mut rows = stmt.query(params_from_iter(params.iter()))?;
            match rows.next()? {
                Some(row) => Ok(Some(row_values(row)?)),
                None => Ok(None),
            }
        })
    }

    /// Runs a cached query with named parameters, returning every row.
    ///
    /// Parameter names must carry their leading `:`.
    pub fn query_all_named(
        &self,
        sql: &str,
        params: &[(String, Value)],
    ) -> DriverResult<Vec<Vec<Value>>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(sql)?;
            let bound: Vec<(&str, &dyn ToSql)> = params
                .iter()
                .map(|(name, value)| (name.as_str(), value as &dyn ToSql))
                .collect();
            let mut rows = stmt.query(bound.as_slice())?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_values(row)?);
            }
            Ok(out)
        })
    }

    /// Returns the rowid of the most recent successful INSERT.
    pub fn last_insert_rowid(&self) -> DriverResult<i64> {
        self.with_conn(|conn| Ok(conn.last_insert_rowid()))
    }
}

fn row_values(row: &rusqlite::Row<'_>) -> DriverResult<Vec<Value>> {
    let n = row.as_ref().column_count();
    let mut values = Vec::with_capacity(n);
    for i in 0..n {
        values.push(row.get::<_, Value>(i)?);
    }
    Ok(values)
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("is_open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_with_table() -> Driver {
        let driver = Driver::open_in_memory().unwrap();
        driver
            .exec("CREATE TABLE t (name TEXT, n INTEGER)")
            .unwrap();
        driver
    }

    #[test]
    fn open_and_close() {
        let driver = Driver::open_in_memory().unwrap();
        assert!(driver.is_open());
        driver.close().unwrap();
        assert!(!driver.is_open());
        assert!(matches!(
            driver.exec("SELECT 1"),
            Err(DriverError::Closed)
        ));
    }

    #[test]
    fn close_twice_is_noop() {
        let driver = Driver::open_in_memory().unwrap();
        driver.close().unwrap();
        driver.close().unwrap();
    }

    #[test]
    fn execute_and_query_positional() {
        let driver = open_with_table();
        let n = driver
            .execute_cached(
                "INSERT INTO t (name, n) VALUES (?1, ?2)",
                &[Value::Text("a".into()), Value::Integer(1)],
            )
            .unwrap();
        assert_eq!(n, 1);

        let row = driver
            .query_row_cached("SELECT name, n FROM t WHERE name = ?1", &[Value::Text("a".into())])
            .unwrap()
            .unwrap();
        assert_eq!(row, vec![Value::Text("a".into()), Value::Integer(1)]);

        let missing = driver
            .query_row_cached("SELECT name FROM t WHERE name = ?1", &[Value::Text("z".into())])
            .unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn query_named() {
        let driver = open_with_table();
        for i in 0..3 {
            driver
                .execute_cached(
                    "INSERT INTO t (name, n) VALUES (?1, ?2)",
                    &[Value::Text(format!("row{i}")), Value::Integer(i)],
                )
                .unwrap();
        }

        let rows = driver
            .query_all_named(
                "SELECT name FROM t WHERE n >= :min ORDER BY n",
                &[(":min".to_string(), Value::Integer(1))],
            )
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][0], Value::Text("row1".into()));
    }

    #[test]
    fn last_insert_rowid() {
        let driver = open_with_table();
        driver
            .execute_cached(
                "INSERT INTO t (name, n) VALUES (?1, ?2)",
                &[Value::Text("a".into()), Value::Integer(1)],
            )
            .unwrap();
        assert_eq!(driver.last_insert_rowid().unwrap(), 1);
    }

    #[test]
    fn null_round_trip() {
        let driver = open_with_table();
        driver
            .execute_cached(
                "INSERT INTO t (name, n) VALUES (?1, ?2)",
                &[Value::Null, Value::Integer(9)],
            )
            .unwrap();
        let row = driver
            .query_row_cached("SELECT name FROM t WHERE n = ?1", &[Value::Integer(9)])
            .unwrap()
            .unwrap();
        assert_eq!(row[0], Value::Null);
    }
}
