//! The database facade: connection lifecycle, registers, transaction
//! control, and whole-manager flushing.

use crate::entity::row::{Row, RowState};
use crate::entity::Entity;
use crate::error::{DbError, DbResult};
use crate::flush;
use crate::schema::field::FieldSpec;
use crate::schema::{self, EntityOptions, Key, Registry};
use crate::transaction::{self, TxnState};
use crate::types::{OnChange, Retry};
use parking_lot::{Mutex, RwLock};
use sqlent_driver::{Driver, Value};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

pub(crate) struct DatabaseInner {
    pub(crate) driver: Driver,
    pub(crate) registry: RwLock<Registry>,
    txn: Mutex<Option<TxnState>>,
    pending: Mutex<bool>,
    on_change: RwLock<Option<OnChange>>,
    default_key: RwLock<Option<String>>,
    retry: RwLock<Retry>,
    serial: AtomicU64,
}

impl DatabaseInner {
    pub(crate) fn ensure_open(&self) -> DbResult<()> {
        if self.driver.is_open() {
            Ok(())
        } else {
            Err(DbError::DatabaseClosed)
        }
    }

    pub(crate) fn next_serial(&self) -> u64 {
        self.serial.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn transaction_active(&self) -> bool {
        self.txn.lock().is_some()
    }

    /// Registers a row with the open transaction, if any.
    pub(crate) fn txn_touch(&self, row: &Row, state: &RowState, field: Option<(&str, Value)>) {
        if let Some(txn) = self.txn.lock().as_mut() {
            txn.touch(row, state, field);
        }
    }

    /// Marks a row as loaded inside the open transaction, if any.
    ///
    /// Takes the row lock before the transaction lock, matching the order
    /// every other path uses.
    pub(crate) fn txn_mark_loaded(&self, row: &Row) {
        let state = row.state();
        if let Some(txn) = self.txn.lock().as_mut() {
            txn.touch(row, &state, None);
            txn.set_loaded(row.serial());
        }
    }

    /// Flags the clean-to-dirty transition and fires `on_change` once.
    pub(crate) fn note_change(&self) {
        let transitioned = {
            let mut pending = self.pending.lock();
            if *pending {
                false
            } else {
                *pending = true;
                true
            }
        };
        if transitioned {
            if let Some(callback) = self.on_change.read().as_ref() {
                callback();
            }
        }
    }

    pub(crate) fn clear_pending(&self) {
        *self.pending.lock() = false;
    }

    pub(crate) fn pending(&self) -> bool {
        *self.pending.lock()
    }

    pub(crate) fn default_key(&self) -> Option<String> {
        self.default_key.read().clone()
    }

    pub(crate) fn get_entity(&self, name: &str) -> DbResult<Entity> {
        self.registry
            .read()
            .get(&name.to_lowercase())
            .cloned()
            .ok_or_else(|| DbError::EntityNotFound {
                name: name.to_string(),
            })
    }

    pub(crate) fn entities_ordered(&self) -> Vec<Entity> {
        self.registry.read().ordered()
    }

    /// Runs a driver call, retrying BUSY per the retry register. Disabled
    /// while a transaction is active: transactions never retry.
    fn with_retry<T>(
        &self,
        mut f: impl FnMut() -> sqlent_driver::DriverResult<T>,
    ) -> DbResult<T> {
        let mut attempts = 0u32;
        loop {
            match f() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_busy() && !self.transaction_active() => {
                    let again = self.retry.read().should_retry(attempts);
                    attempts += 1;
                    if !again {
                        return Err(e.into());
                    }
                    debug!(attempts, "retrying busy statement");
                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub(crate) fn execute_retry(&self, sql: &str, params: &[Value]) -> DbResult<usize> {
        self.with_retry(|| self.driver.execute_cached(sql, params))
    }

    pub(crate) fn query_row_retry(
        &self,
        sql: &str,
        params: &[Value],
    ) -> DbResult<Option<Vec<Value>>> {
        self.with_retry(|| self.driver.query_row_cached(sql, params))
    }

    pub(crate) fn query_all_retry(
        &self,
        sql: &str,
        params: &[(String, Value)],
    ) -> DbResult<Vec<Vec<Value>>> {
        self.with_retry(|| self.driver.query_all_named(sql, params))
    }
}

/// The entity manager.
///
/// Owns the driver connection, the schema registry, the pending-change flag,
/// the retry/default-key/on-change registers, and the single open
/// transaction. Cloning shares the same manager.
///
/// # Example
///
/// ```rust,ignore
/// use sqlent_core::{Database, Key, EntityOptions, text};
///
/// let db = Database::open_in_memory()?;
/// let maps = db.entity(
///     "map",
///     Key::Name("key".into()),
///     vec![("key", text().into()), ("value", text().into())],
///     EntityOptions::default(),
/// )?;
/// maps.create()?;
/// maps.new(vec![("key", "a".into()), ("value", "b".into())], false)?;
/// db.flush()?;
/// ```
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl Database {
    /// Opens a database file, creating it when missing.
    pub fn open(path: impl AsRef<Path>) -> DbResult<Self> {
        Self::from_driver(Driver::open(Some(path.as_ref()))?)
    }

    /// Opens a fresh in-memory database.
    pub fn open_in_memory() -> DbResult<Self> {
        Self::from_driver(Driver::open_in_memory()?)
    }

    fn from_driver(driver: Driver) -> DbResult<Self> {
        Ok(Self {
            inner: Arc::new(DatabaseInner {
                driver,
                registry: RwLock::new(Registry::new()),
                txn: Mutex::new(None),
                pending: Mutex::new(false),
                on_change: RwLock::new(None),
                default_key: RwLock::new(None),
                retry: RwLock::new(Retry::Never),
                serial: AtomicU64::new(1),
            }),
        })
    }

    /// Closes the underlying connection. Rows and entities remain readable
    /// in memory but every database operation fails afterwards.
    pub fn close(&self) -> DbResult<()> {
        self.inner.driver.close()?;
        Ok(())
    }

    /// True while the connection is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.driver.is_open()
    }

    /// The underlying driver handle.
    #[must_use]
    pub fn driver(&self) -> &Driver {
        &self.inner.driver
    }

    // ------------------------------------------------------------------
    // Schema
    // ------------------------------------------------------------------

    /// Declares an entity.
    ///
    /// `key` selects the primary key; `fields` is the ordered declaration
    /// list, each entry a built [`crate::FieldDef`] or a string shorthand.
    /// Registration is rejected for duplicate names, invalid fields, and
    /// circular required foreign keys.
    pub fn entity(
        &self,
        name: &str,
        key: Key,
        fields: Vec<(&str, FieldSpec)>,
        options: EntityOptions,
    ) -> DbResult<Entity> {
        schema::register(&self.inner, name, key, fields, options)
    }

    /// Looks up a registered entity by name.
    pub fn get(&self, name: &str) -> DbResult<Entity> {
        self.inner.get_entity(name)
    }

    /// Every registered entity, in registration order.
    #[must_use]
    pub fn entities(&self) -> Vec<Entity> {
        self.inner.entities_ordered()
    }

    /// Number of registered entities.
    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.inner.registry.read().len()
    }

    // ------------------------------------------------------------------
    // Registers
    // ------------------------------------------------------------------

    /// Sets the default primary-key name consulted by [`Key::Default`].
    pub fn set_default_key(&self, key: Option<&str>) {
        *self.inner.default_key.write() = key.map(|k| k.to_lowercase());
    }

    /// The current default primary-key register.
    #[must_use]
    pub fn default_key(&self) -> Option<String> {
        self.inner.default_key()
    }

    /// Sets (or clears) the callback fired once per clean-to-dirty
    /// transition of the whole manager.
    pub fn set_on_change(&self, callback: Option<OnChange>) {
        *self.inner.on_change.write() = callback;
    }

    /// Sets the BUSY retry policy.
    pub fn set_retry(&self, retry: impl Into<Retry>) {
        *self.inner.retry.write() = retry.into();
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Begins a transaction, or deepens the open one.
    ///
    /// With `strict`, an already-open transaction is an error.
    pub fn begin(&self, strict: bool) -> DbResult<()> {
        self.inner.ensure_open()?;
        let mut txn = self.inner.txn.lock();
        match txn.as_mut() {
            Some(state) => {
                if strict {
                    return Err(DbError::TransactionActive);
                }
                state.depth += 1;
            }
            None => {
                self.inner.driver.exec("BEGIN")?;
                *txn = Some(TxnState::new());
            }
        }
        Ok(())
    }

    /// Commits the transaction.
    ///
    /// Decrements the depth; only at zero (or when forced) is the engine
    /// COMMIT issued and every registered row's overlay promoted.
    pub fn commit(&self, force: bool) -> DbResult<()> {
        self.inner.ensure_open()?;
        let state = {
            let mut txn = self.inner.txn.lock();
            let Some(state) = txn.as_mut() else {
                return Err(DbError::NoTransaction);
            };
            state.depth -= 1;
            if state.depth > 0 && !force {
                return Ok(());
            }
            match txn.take() {
                Some(state) => state,
                None => return Err(DbError::NoTransaction),
            }
        };
        self.inner.driver.exec("COMMIT")?;
        transaction::commit_rows(state.into_rows());
        Ok(())
    }

    /// Rolls the transaction back unconditionally.
    ///
    /// Issues the engine ROLLBACK, discards overlays, and restores the
    /// in-memory state of every row touched under the transaction.
    pub fn rollback(&self) -> DbResult<()> {
        self.inner.ensure_open()?;
        let state = {
            let mut txn = self.inner.txn.lock();
            match txn.take() {
                Some(state) => state,
                None => return Err(DbError::NoTransaction),
            }
        };
        self.inner.driver.exec("ROLLBACK")?;
        transaction::rollback_rows(&self.inner, state.into_rows())
    }

    /// True while a transaction is open.
    #[must_use]
    pub fn transaction(&self) -> bool {
        self.inner.transaction_active()
    }

    // ------------------------------------------------------------------
    // Flushing
    // ------------------------------------------------------------------

    /// True since the first dirty mark after the last successful
    /// whole-manager flush.
    #[must_use]
    pub fn pending_changes(&self) -> bool {
        self.inner.pending()
    }

    /// Drains every entity's dirty set inside a strict transaction; any
    /// error rolls back and re-raises.
    pub fn flush(&self) -> DbResult<()> {
        self.begin(true)?;
        match flush::raw_flush(&self.inner) {
            Ok(()) => self.commit(false),
            Err(e) => {
                let _ = self.rollback();
                Err(e)
            }
        }
    }

    /// Drains every entity's dirty set without transaction wrapping.
    pub fn raw_flush(&self) -> DbResult<()> {
        self.inner.ensure_open()?;
        flush::raw_flush(&self.inner)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("is_open", &self.is_open())
            .field("entities", &self.entity_count())
            .field("pending_changes", &self.pending_changes())
            .field("transaction", &self.transaction())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::field::text;
    use sqlent_driver::Value as V;
    use std::sync::atomic::AtomicU32;

    fn with_map() -> (Database, Entity) {
        let db = Database::open_in_memory().unwrap();
        let map = db
            .entity(
                "map",
                Key::Name("key".into()),
                vec![("key", text().into()), ("value", text().into())],
                EntityOptions { auto_create: true },
            )
            .unwrap();
        (db, map)
    }

    #[test]
    fn open_and_close() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.is_open());
        db.close().unwrap();
        assert!(!db.is_open());
        assert!(matches!(
            db.entity("m", Key::Default, vec![("v", text().into())], EntityOptions::default()),
            Err(DbError::DatabaseClosed)
        ));
    }

    #[test]
    fn persists_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");

        {
            let db = Database::open(&path).unwrap();
            let map = db
                .entity(
                    "map",
                    Key::Name("key".into()),
                    vec![("key", text().into()), ("value", text().into())],
                    EntityOptions { auto_create: true },
                )
                .unwrap();
            map.new(vec![("key", "a".into()), ("value", "b".into())], false)
                .unwrap();
            db.flush().unwrap();
            db.close().unwrap();
        }

        let db = Database::open(&path).unwrap();
        let map = db
            .entity(
                "map",
                Key::Name("key".into()),
                vec![("key", text().into()), ("value", text().into())],
                EntityOptions::default(),
            )
            .unwrap();
        let row = map.get("a").unwrap().unwrap();
        assert_eq!(row.raw("value").unwrap(), V::Text("b".into()));
    }

    #[test]
    fn begin_commit_depth() {
        let (db, _) = with_map();
        db.begin(false).unwrap();
        db.begin(false).unwrap();
        assert!(db.transaction());
        db.commit(false).unwrap();
        assert!(db.transaction());
        db.commit(false).unwrap();
        assert!(!db.transaction());
    }

    #[test]
    fn strict_begin_rejects_nesting() {
        let (db, _) = with_map();
        db.begin(false).unwrap();
        assert!(matches!(db.begin(true), Err(DbError::TransactionActive)));
        db.rollback().unwrap();
    }

    #[test]
    fn forced_commit_closes_nested() {
        let (db, _) = with_map();
        db.begin(false).unwrap();
        db.begin(false).unwrap();
        db.commit(true).unwrap();
        assert!(!db.transaction());
    }

    #[test]
    fn commit_without_transaction_fails() {
        let (db, _) = with_map();
        assert!(matches!(db.commit(false), Err(DbError::NoTransaction)));
        assert!(matches!(db.rollback(), Err(DbError::NoTransaction)));
    }

    #[test]
    fn pending_changes_lifecycle() {
        let (db, map) = with_map();
        assert!(!db.pending_changes());
        map.new(vec![("key", "a".into())], false).unwrap();
        assert!(db.pending_changes());
        db.flush().unwrap();
        assert!(!db.pending_changes());
    }

    #[test]
    fn on_change_fires_once_per_cycle() {
        let (db, map) = with_map();
        let count = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&count);
        db.set_on_change(Some(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        map.new(vec![("key", "a".into())], false).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        map.new(vec![("key", "b".into())], false).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        db.flush().unwrap();
        map.new(vec![("key", "c".into())], false).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn flush_clears_dirty_sets() {
        let (db, map) = with_map();
        map.new(vec![("key", "a".into())], false).unwrap();
        map.new(vec![("key", "b".into())], false).unwrap();
        db.flush().unwrap();
        assert_eq!(map.flush(false).unwrap(), 0);
        // Flushing a clean manager is a no-op.
        db.flush().unwrap();
    }

    #[test]
    fn overlay_masks_committed_until_commit() {
        let (db, map) = with_map();
        map.new(vec![("key", "a".into()), ("value", "1".into())], false)
            .unwrap();
        db.flush().unwrap();

        let row = map.get("a").unwrap().unwrap();
        db.begin(false).unwrap();
        row.set("value", "2").unwrap();
        assert_eq!(row.raw("value").unwrap(), V::Text("2".into()));
        db.commit(false).unwrap();
        assert_eq!(row.raw("value").unwrap(), V::Text("2".into()));
        // Still dirty: the write itself has not been flushed.
        assert!(row.dirty());
    }

    #[test]
    fn rollback_restores_committed_values() {
        let (db, map) = with_map();
        map.new(vec![("key", "a".into()), ("value", "1".into())], false)
            .unwrap();
        db.flush().unwrap();

        db.begin(false).unwrap();
        let row = map.get("a").unwrap().unwrap();
        row.set("value", "2").unwrap();
        assert_eq!(row.raw("value").unwrap(), V::Text("2".into()));
        db.rollback().unwrap();

        assert_eq!(row.raw("value").unwrap(), V::Text("1".into()));
    }

    #[test]
    fn rollback_rescinds_rowids_flushed_in_transaction() {
        let (db, map) = with_map();
        let row = map
            .new(vec![("key", "a".into()), ("value", "1".into())], false)
            .unwrap();

        db.begin(false).unwrap();
        db.raw_flush().unwrap();
        assert!(row.rowid().is_some());
        db.rollback().unwrap();

        // Insert undone: pending again, no rowid.
        assert!(row.rowid().is_none());
        assert!(row.dirty());
        assert!(db.pending_changes());

        db.flush().unwrap();
        assert!(map.get("a").unwrap().is_some());
    }

    #[test]
    fn rollback_discards_rows_created_in_transaction() {
        let (db, map) = with_map();
        db.begin(false).unwrap();
        let row = map
            .new(vec![("key", "a".into()), ("value", "1".into())], false)
            .unwrap();
        db.rollback().unwrap();

        assert!(!row.dirty());
        db.flush().unwrap();
        assert!(map.get("a").unwrap().is_none());
    }

    #[test]
    fn flush_failure_rolls_back() {
        let (db, map) = with_map();
        // Two rows with the same key: the second INSERT violates the
        // primary key at the engine level.
        map.new(vec![("key", "a".into()), ("value", "1".into())], false)
            .unwrap();
        map.new(vec![("key", "a".into()), ("value", "2".into())], true)
            .unwrap();

        assert!(db.flush().is_err());
        assert!(!db.transaction());
    }

    #[test]
    fn debug_snapshot_renders_state() {
        let (db, map) = with_map();
        let row = map
            .new(vec![("key", "a".into()), ("value", "b".into())], false)
            .unwrap();
        let snapshot = row.debug_snapshot();
        assert!(snapshot.contains("map"), "{snapshot}");
        assert!(snapshot.contains("dirty=true"), "{snapshot}");
        assert!(snapshot.contains("key = a"), "{snapshot}");
        db.flush().unwrap();
        assert!(row.debug_snapshot().contains("dirty=false"));
    }

    #[test]
    fn version_is_exposed() {
        assert_eq!(crate::VERSION.0, 0);
        assert!(crate::version_string().starts_with("sqlent "));
    }
}
