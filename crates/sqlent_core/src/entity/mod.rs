//! Entity handles: identity-mapped access to one table.

pub(crate) mod cache;
pub mod row;

use crate::database::DatabaseInner;
use crate::ddl;
use crate::entity::cache::IdentityCache;
use crate::entity::row::{Fetched, Row, RowState, SetValue, Stored};
use crate::error::{DbError, DbResult};
use crate::query::{Expr, Operand, Query};
use crate::schema::field::{FieldDef, FieldKind, ResolvedLink};
use parking_lot::{Mutex, MutexGuard};
use sqlent_driver::Value;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};
use tracing::debug;

/// Lazily built SQL texts for one entity.
///
/// Only the text is cached here; statement preparation and re-preparation
/// after engine-level invalidation are the driver's concern.
#[derive(Default)]
pub(crate) struct Statements {
    insert: OnceLock<String>,
    update: OnceLock<String>,
    delete: OnceLock<String>,
    get: OnceLock<String>,
    reread: OnceLock<String>,
    exists: Mutex<HashMap<String, String>>,
}

pub(crate) struct EntityInner {
    pub(crate) name: String,
    /// Primary-key field name, or the `"rowid"` sentinel.
    pub(crate) key: String,
    /// Persisted fields in declaration order.
    pub(crate) field_order: Vec<String>,
    /// Every field, virtual ones included.
    pub(crate) fields: HashMap<String, FieldDef>,
    pub(crate) unique_fields: Vec<String>,
    pub(crate) db: Weak<DatabaseInner>,
    statements: Statements,
    cache: Mutex<IdentityCache>,
}

/// A registered entity: one table plus its row caches and dirty set.
///
/// Entities are created by [`crate::Database::entity`] and live for the
/// manager's lifetime. Cloning is cheap and shares the underlying state.
#[derive(Clone)]
pub struct Entity {
    pub(crate) inner: Arc<EntityInner>,
}

impl Entity {
    pub(crate) fn build(
        db: &Arc<DatabaseInner>,
        name: String,
        key: String,
        field_order: Vec<String>,
        fields: HashMap<String, FieldDef>,
    ) -> Self {
        let unique_fields: Vec<String> = field_order
            .iter()
            .filter(|f| fields[f.as_str()].is_unique())
            .cloned()
            .collect();
        Self {
            inner: Arc::new(EntityInner {
                name,
                key,
                field_order,
                fields,
                cache: Mutex::new(IdentityCache::new(&unique_fields)),
                unique_fields,
                db: Arc::downgrade(db),
                statements: Statements::default(),
            }),
        }
    }

    /// The entity's (table) name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The primary-key field name, or `"rowid"`.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Every field definition, persisted and virtual, in declaration order.
    #[must_use]
    pub fn fields(&self) -> Vec<FieldDef> {
        self.field_names()
            .iter()
            .map(|f| self.inner.fields[f.as_str()].clone())
            .collect()
    }

    /// Field names: persisted first, then virtual.
    #[must_use]
    pub fn field_names(&self) -> Vec<String> {
        let mut names = self.inner.field_order.clone();
        for (name, def) in &self.inner.fields {
            if def.is_virtual() {
                names.push(name.clone());
            }
        }
        names
    }

    /// Looks up a field definition. Names are expected lowercased.
    pub(crate) fn field(&self, name: &str) -> DbResult<&FieldDef> {
        self.inner
            .fields
            .get(name)
            .ok_or_else(|| DbError::unknown_field(&self.inner.name, name))
    }

    pub(crate) fn db(&self) -> DbResult<Arc<DatabaseInner>> {
        self.inner.db.upgrade().ok_or(DbError::DatabaseClosed)
    }

    pub(crate) fn cache(&self) -> MutexGuard<'_, IdentityCache> {
        self.inner.cache.lock()
    }

    // ------------------------------------------------------------------
    // Row construction and lookup
    // ------------------------------------------------------------------

    /// Creates a new row from field values.
    ///
    /// The row joins the dirty set immediately and is inserted at the next
    /// flush. With `skip_check` the unique-existence probes and the
    /// required-fields check are skipped; coercion never is.
    pub fn new(&self, data: Vec<(&str, SetValue)>, skip_check: bool) -> DbResult<Row> {
        let db = self.db()?;
        db.ensure_open()?;
        let row = Row::create(self.clone(), db.next_serial());

        let filled = (|| -> DbResult<()> {
            for (name, value) in data {
                row.set_checked(name, value, !skip_check)?;
            }
            if !skip_check {
                for name in &self.inner.field_order {
                    let def = &self.inner.fields[name.as_str()];
                    if !def.is_required() {
                        continue;
                    }
                    let state = row.state();
                    let present = match state.stored(name) {
                        Some(Stored::Value(v)) => !v.is_null(),
                        Some(_) => true,
                        None => false,
                    };
                    if !present {
                        return Err(DbError::required(&self.inner.name, name));
                    }
                }
            }
            // A row with no field data is still a pending insert.
            let mut state = row.state();
            if !state.dirty && db.transaction_active() {
                db.txn_touch(&row, &state, None);
            }
            row.mark_dirty_locked(&db, &mut state);
            Ok(())
        })();

        if let Err(e) = filled {
            let mut state = row.state();
            state.dirty = false;
            let mut cache = self.cache();
            cache.purge(&row, &state);
            cache.remove_dirty(row.serial());
            return Err(e);
        }
        Ok(row)
    }

    /// Fetches a row by primary key, consulting the identity cache first.
    pub fn get(&self, key: impl Into<Value>) -> DbResult<Option<Row>> {
        let db = self.db()?;
        db.ensure_open()?;
        let key = key.into();

        let lookup = if self.inner.key == "rowid" {
            let rowid = coerce_rowid(&self.inner.name, &key)?;
            if let Some(row) = self.cache().get_rowid(rowid) {
                return Ok(Some(row));
            }
            Value::Integer(rowid)
        } else {
            let def = self.field(&self.inner.key)?;
            let (_, lookup) = def.transform(&self.inner.name, SetValue::Value(key))?;
            if let Some(row) = self.cache().get_unique(&self.inner.key, &lookup) {
                return Ok(Some(row));
            }
            lookup
        };

        match db.query_row_retry(self.get_sql(), &[lookup])? {
            Some(values) => {
                let row = self.row_from_db(&db, values)?;
                if db.transaction_active() {
                    db.txn_mark_loaded(&row);
                }
                Ok(Some(row))
            }
            None => Ok(None),
        }
    }

    /// True if a row with this primary key exists, in memory or on disk.
    pub fn has(&self, key: impl Into<Value>) -> DbResult<bool> {
        let db = self.db()?;
        db.ensure_open()?;
        let key = key.into();

        if self.inner.key == "rowid" {
            let rowid = coerce_rowid(&self.inner.name, &key)?;
            if self.cache().get_rowid(rowid).is_some() {
                return Ok(true);
            }
            let sql = self.exists_sql("rowid");
            return Ok(db
                .query_row_retry(&sql, &[Value::Integer(rowid)])?
                .is_some());
        }

        let def = self.field(&self.inner.key)?;
        let (_, lookup) = def.transform(&self.inner.name, SetValue::Value(key))?;
        if self.cache().get_unique(&self.inner.key, &lookup).is_some() {
            return Ok(true);
        }
        let sql = self.exists_sql(&self.inner.key);
        Ok(db.query_row_retry(&sql, &[lookup])?.is_some())
    }

    /// Materializes a fetched row through the identity map.
    ///
    /// `values` holds the persisted fields in order plus the rowid last. A
    /// live cached row for the same rowid wins; the database copy is
    /// discarded so pending in-memory changes stay authoritative.
    pub(crate) fn row_from_db(
        &self,
        db: &Arc<DatabaseInner>,
        mut values: Vec<Value>,
    ) -> DbResult<Row> {
        let expected = self.inner.field_order.len() + 1;
        if values.len() != expected {
            return Err(DbError::Driver(sqlent_driver::DriverError::unexpected(
                format!(
                    "'{}' row has {} columns, expected {expected}",
                    self.inner.name,
                    values.len()
                ),
            )));
        }
        let rowid = values
            .pop()
            .and_then(|v| v.as_integer())
            .ok_or_else(|| DbError::value(format!("'{}' rowid is not an integer", self.inner.name)))?;

        let mut cache = self.cache();
        if let Some(existing) = cache.get_rowid(rowid) {
            return Ok(existing);
        }

        let row = Row::create(self.clone(), db.next_serial());
        {
            let mut state = row.state();
            state.rowid = Some(rowid);
            for (name, value) in self.inner.field_order.iter().zip(values) {
                state.lookups.insert(name.clone(), value.clone());
                state.committed.insert(name.clone(), Stored::Value(value));
            }
            cache.reinsert(&row, &state);
        }
        Ok(row)
    }

    // ------------------------------------------------------------------
    // Uniqueness
    // ------------------------------------------------------------------

    /// Rejects `lookup` on a unique field when another row already holds it,
    /// in the cache or in the database.
    pub(crate) fn check_unique(
        &self,
        db: &Arc<DatabaseInner>,
        field: &str,
        lookup: &Value,
        this: &Row,
    ) -> DbResult<()> {
        if let Some(existing) = self.cache().get_unique(field, lookup) {
            if existing != *this {
                return Err(DbError::unique(&self.inner.name, field, lookup.to_string()));
            }
            return Ok(());
        }
        let sql = self.exists_sql(field);
        if db.query_row_retry(&sql, &[lookup.clone()])?.is_some() {
            return Err(DbError::unique(&self.inner.name, field, lookup.to_string()));
        }
        Ok(())
    }

    pub(crate) fn swap_unique(&self, field: &str, old: &Value, new: &Value, row: &Row) {
        self.cache().swap_unique(field, old, new, row);
    }

    pub(crate) fn add_dirty(&self, row: &Row) {
        self.cache().add_dirty(row);
    }

    // ------------------------------------------------------------------
    // Flushing
    // ------------------------------------------------------------------

    /// Flushes this entity's dirty set once.
    ///
    /// Returns how many rows are still dirty afterwards: rows waiting on an
    /// uninserted referent, including partially flushed ones.
    pub fn flush(&self, skip_fkeys: bool) -> DbResult<usize> {
        let rows = self.cache().dirty_rows();
        for row in &rows {
            self.flush_row(row, skip_fkeys)?;
        }
        let remaining = self.cache().dirty_len();
        if !rows.is_empty() {
            debug!(
                entity = %self.inner.name,
                flushed = rows.len() - remaining,
                remaining,
                "flush pass"
            );
        }
        Ok(remaining)
    }

    /// Flushes one row. Returns true when the row came out clean.
    pub(crate) fn flush_row(&self, row: &Row, skip_fkeys: bool) -> DbResult<bool> {
        let db = self.db()?;
        db.ensure_open()?;
        let mut state = row.state();
        if !state.dirty {
            return Ok(true);
        }
        let in_txn = db.transaction_active();

        if state.deleted {
            if in_txn {
                db.txn_touch(row, &state, None);
            }
            if let Some(rowid) = state.rowid {
                db.execute_retry(self.delete_sql(), &[Value::Integer(rowid)])?;
                if in_txn {
                    state.txn_dirty = true;
                }
            }
            let mut cache = self.cache();
            cache.purge(row, &state);
            cache.remove_dirty(row.serial());
            state.dirty = false;
            return Ok(true);
        }

        let mut values = Vec::with_capacity(self.inner.field_order.len() + 1);
        let mut partial = false;
        for name in &self.inner.field_order {
            let def = &self.inner.fields[name.as_str()];

            let pending = match state.stored(name) {
                Some(Stored::Ref(referent)) => Some(referent.clone()),
                _ => None,
            };
            if let Some(referent) = pending {
                let pk = if Arc::ptr_eq(&referent.inner, &row.inner) {
                    self_pk(&self.inner.key, &state)
                } else {
                    referent.pk_lookup()
                };
                match pk {
                    Some(pk) => {
                        // Referent got inserted; resolve the reference.
                        if in_txn {
                            db.txn_touch(row, &state, Some((name.as_str(), Value::Null)));
                        }
                        if def.is_unique() {
                            self.swap_unique(name, &Value::Null, &pk, row);
                        }
                        let slot = if state.overlay.contains_key(name.as_str()) {
                            state.overlay.get_mut(name.as_str())
                        } else {
                            state.committed.get_mut(name.as_str())
                        };
                        if let Some(slot) = slot {
                            *slot = Stored::Value(pk.clone());
                        }
                        state.lookups.insert(name.clone(), pk.clone());
                        values.push(pk);
                    }
                    None if def.is_required() => return Ok(false),
                    None if skip_fkeys => {
                        values.push(Value::Null);
                        partial = true;
                    }
                    None => return Ok(false),
                }
                continue;
            }

            match state.stored(name) {
                #[cfg(feature = "json")]
                Some(Stored::Json(_)) => {
                    let in_overlay =
                        matches!(state.overlay.get(name.as_str()), Some(Stored::Json(_)));
                    let encoded = {
                        let slot = if in_overlay {
                            state.overlay.get_mut(name.as_str())
                        } else {
                            state.committed.get_mut(name.as_str())
                        };
                        match slot {
                            Some(Stored::Json(cell)) => cell.ensure_encoded()?.to_string(),
                            _ => unreachable!("stored() said json"),
                        }
                    };
                    state
                        .lookups
                        .insert(name.clone(), Value::Text(encoded.clone()));
                    values.push(Value::Text(encoded));
                }
                Some(Stored::Value(v)) => {
                    if v.is_null() && def.is_required() {
                        return Err(DbError::required(&self.inner.name, name));
                    }
                    values.push(v.clone());
                }
                None => {
                    if def.is_required() {
                        return Err(DbError::required(&self.inner.name, name));
                    }
                    values.push(Value::Null);
                }
                #[allow(unreachable_patterns)]
                Some(_) => unreachable!("pending refs handled above"),
            }
        }

        if in_txn {
            db.txn_touch(row, &state, None);
        }

        if let Some(rowid) = state.rowid {
            values.push(Value::Integer(rowid));
            db.execute_retry(self.update_sql(), &values)?;
        } else {
            db.execute_retry(self.insert_sql(), &values)?;
            let rowid = db.driver.last_insert_rowid()?;
            state.rowid = Some(rowid);
            self.cache().insert_rowid(rowid, row);

            // Merge protocol: an ID primary key takes the assigned rowid.
            let key = self.inner.key.clone();
            if key != "rowid" && self.inner.fields[key.as_str()].kind() == FieldKind::Id {
                let old = state.lookups.get(&key).cloned().unwrap_or(Value::Null);
                let assigned = Value::Integer(rowid);
                if in_txn {
                    db.txn_touch(row, &state, Some((key.as_str(), old.clone())));
                    state
                        .overlay
                        .insert(key.clone(), Stored::Value(assigned.clone()));
                } else {
                    state
                        .committed
                        .insert(key.clone(), Stored::Value(assigned.clone()));
                }
                self.swap_unique(&key, &old, &assigned, row);
                state.lookups.insert(key, assigned);
            }
        }

        if in_txn {
            state.txn_dirty = true;
        }

        // Clear dirty iff the row now has a rowid and nothing was deferred.
        if !partial && state.rowid.is_some() {
            state.dirty = false;
            self.cache().remove_dirty(row.serial());
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Re-fetches committed values from the database, overwriting the
    /// committed map. Used by rollback for rows loaded inside the
    /// transaction. A row that vanished from the database is left alone.
    pub(crate) fn reread_committed(&self, row: &Row) -> DbResult<()> {
        let db = self.db()?;
        let rowid = match row.state().rowid {
            Some(r) => r,
            None => return Ok(()),
        };
        let values = match db.query_row_retry(self.reread_sql(), &[Value::Integer(rowid)])? {
            Some(v) => v,
            None => return Ok(()),
        };
        let mut state = row.state();
        for (name, value) in self.inner.field_order.iter().zip(values) {
            let def = &self.inner.fields[name.as_str()];
            let old = state.lookups.get(name).cloned().unwrap_or(Value::Null);
            if def.is_unique() && old != value {
                self.swap_unique(name, &old, &value, row);
            }
            state.lookups.insert(name.clone(), value.clone());
            state.committed.insert(name.clone(), Stored::Value(value));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Virtual foreign keys
    // ------------------------------------------------------------------

    /// Resolves a virtual-fkey read on `row`.
    pub(crate) fn resolve_nav(&self, row: &Row, name: &str) -> DbResult<Fetched> {
        let db = self.db()?;
        let def = self.field(name)?;
        let link = match def.resolved.get() {
            Some(link) => link.clone(),
            None => {
                let link = self.resolve_link(&db, def)?;
                let _ = def.resolved.set(link.clone());
                link
            }
        };

        let child = db.get_entity(&link.child_entity)?;
        let parent_pk = match row.pk_lookup() {
            Some(pk) => pk,
            None => {
                // Uninserted parent: nothing can reference it by value yet.
                return Ok(if link.multi {
                    Fetched::Rows(Vec::new())
                } else {
                    Fetched::Value(Value::Null)
                });
            }
        };

        if !link.multi {
            if let Some(hit) = child.cache().get_unique(&link.child_field, &parent_pk) {
                if !hit.deleted() {
                    return Ok(Fetched::Row(hit));
                }
            }
        }

        let query = child.query(vec![Expr::eq(
            Operand::Token(link.child_field.clone()),
            Operand::Value(parent_pk),
        )])?;
        let mut rows = query.run(&[])?;
        if link.multi {
            Ok(Fetched::Rows(rows))
        } else if rows.is_empty() {
            Ok(Fetched::Value(Value::Null))
        } else {
            Ok(Fetched::Row(rows.remove(0)))
        }
    }

    /// Locates the child-side field a virtual fkey navigates through and
    /// infers its multiplicity.
    fn resolve_link(&self, db: &Arc<DatabaseInner>, def: &FieldDef) -> DbResult<ResolvedLink> {
        let target = def
            .references()
            .ok_or_else(|| DbError::schema(format!("virtual field '{}' has no target", def.name())))?;
        let child = db.get_entity(target)?;

        let candidates: Vec<&FieldDef> = child
            .inner
            .field_order
            .iter()
            .map(|f| &child.inner.fields[f.as_str()])
            .filter(|f| f.kind() == FieldKind::Entity && f.references() == Some(&self.inner.name))
            .collect();

        let chosen = if let Some(wanted) = &def.child_field {
            candidates
                .iter()
                .find(|f| f.name() == wanted)
                .ok_or_else(|| {
                    DbError::schema(format!(
                        "'{target}' has no foreign key '{wanted}' back to '{}'",
                        self.inner.name
                    ))
                })?
        } else if candidates.len() == 1 {
            &candidates[0]
        } else {
            // Several fkeys point here; pick the one named like this entity.
            candidates
                .iter()
                .find(|f| f.name() == self.inner.name)
                .ok_or_else(|| {
                    DbError::schema(format!(
                        "ambiguous virtual fkey '{}': '{target}' has {} foreign keys to '{}'",
                        def.name(),
                        candidates.len(),
                        self.inner.name
                    ))
                })?
        };

        let multi = !chosen.is_unique();
        if let Some(declared) = def.multi {
            if declared != multi {
                return Err(DbError::schema(format!(
                    "virtual fkey '{}' declared multi={declared} but '{target}.{}' implies multi={multi}",
                    def.name(),
                    chosen.name()
                )));
            }
        }
        Ok(ResolvedLink {
            child_entity: child.inner.name.clone(),
            child_field: chosen.name().to_string(),
            multi,
        })
    }

    // ------------------------------------------------------------------
    // Queries and DDL
    // ------------------------------------------------------------------

    /// Compiles a query against this entity. Multiple terms are implicitly
    /// wrapped in an AND.
    pub fn query(&self, terms: Vec<Expr>) -> DbResult<Query> {
        Query::compile(self.clone(), terms)
    }

    /// Issues this entity's `CREATE TABLE IF NOT EXISTS`.
    pub fn create(&self) -> DbResult<()> {
        let db = self.db()?;
        db.ensure_open()?;
        let sql = self.create_sql()?;
        db.driver.exec(&sql)?;
        Ok(())
    }

    /// The `CREATE TABLE` statement for this entity.
    pub fn create_sql(&self) -> DbResult<String> {
        let db = self.db()?;
        ddl::create_sql(self, &db)
    }

    // ------------------------------------------------------------------
    // Statement texts
    // ------------------------------------------------------------------

    pub(crate) fn insert_sql(&self) -> &str {
        self.inner.statements.insert.get_or_init(|| {
            let fields: Vec<String> = self
                .inner
                .field_order
                .iter()
                .map(|f| format!("\"{f}\""))
                .collect();
            let binds: Vec<String> = (1..=fields.len()).map(|i| format!("?{i}")).collect();
            format!(
                "INSERT INTO \"{}\" ({}) VALUES ({})",
                self.inner.name,
                fields.join(", "),
                binds.join(", ")
            )
        })
    }

    pub(crate) fn update_sql(&self) -> &str {
        self.inner.statements.update.get_or_init(|| {
            let sets: Vec<String> = self
                .inner
                .field_order
                .iter()
                .enumerate()
                .map(|(i, f)| format!("\"{f}\" = ?{}", i + 1))
                .collect();
            format!(
                "UPDATE \"{}\" SET {} WHERE rowid = ?{}",
                self.inner.name,
                sets.join(", "),
                self.inner.field_order.len() + 1
            )
        })
    }

    pub(crate) fn delete_sql(&self) -> &str {
        self.inner
            .statements
            .delete
            .get_or_init(|| format!("DELETE FROM \"{}\" WHERE rowid = ?1", self.inner.name))
    }

    pub(crate) fn get_sql(&self) -> &str {
        self.inner.statements.get.get_or_init(|| {
            let key = if self.inner.key == "rowid" {
                "rowid".to_string()
            } else {
                format!("\"{}\"", self.inner.key)
            };
            format!(
                "{} WHERE {key} = ?1",
                select_prefix(&self.inner.name, &self.inner.field_order)
            )
        })
    }

    pub(crate) fn reread_sql(&self) -> &str {
        self.inner.statements.reread.get_or_init(|| {
            format!(
                "{} WHERE rowid = ?1",
                select_prefix(&self.inner.name, &self.inner.field_order)
            )
        })
    }

    /// The SELECT prefix queries build on: all fields plus the rowid.
    pub(crate) fn select_sql(&self) -> String {
        select_prefix(&self.inner.name, &self.inner.field_order)
    }

    /// The EXISTS probe for one unique field (or `rowid`).
    ///
    /// With a single unique field this is also the any-unique probe; with
    /// several, the any-unique OR form is cached under `"*"` and used when
    /// `field` is empty.
    pub(crate) fn exists_sql(&self, field: &str) -> String {
        let mut cached = self.inner.statements.exists.lock();
        let key = if field.is_empty() || (field != "rowid" && self.inner.unique_fields.len() == 1) {
            "*"
        } else {
            field
        };
        if let Some(sql) = cached.get(key) {
            return sql.clone();
        }
        let sql = if key == "*" {
            let clauses: Vec<String> = self
                .inner
                .unique_fields
                .iter()
                .map(|f| format!("\"{f}\" = ?1"))
                .collect();
            format!(
                "SELECT 1 FROM \"{}\" WHERE {} LIMIT 1",
                self.inner.name,
                clauses.join(" OR ")
            )
        } else {
            let column = if key == "rowid" {
                "rowid".to_string()
            } else {
                format!("\"{key}\"")
            };
            format!(
                "SELECT 1 FROM \"{}\" WHERE {column} = ?1 LIMIT 1",
                self.inner.name
            )
        };
        cached.insert(key.to_string(), sql.clone());
        sql
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Entity {}

impl std::fmt::Debug for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entity")
            .field("name", &self.inner.name)
            .field("key", &self.inner.key)
            .field("fields", &self.inner.field_order)
            .field("dirty", &self.cache().dirty_len())
            .finish()
    }
}

fn select_prefix(table: &str, fields: &[String]) -> String {
    let cols: Vec<String> = fields.iter().map(|f| format!("\"{f}\"")).collect();
    format!("SELECT {}, rowid FROM \"{table}\"", cols.join(", "))
}

/// The row's own pk scalar, from an already-locked state.
fn self_pk(key: &str, state: &RowState) -> Option<Value> {
    let rowid = state.rowid?;
    if key == "rowid" {
        Some(Value::Integer(rowid))
    } else {
        Some(
            state
                .lookups
                .get(key)
                .cloned()
                .unwrap_or(Value::Integer(rowid)),
        )
    }
}

fn coerce_rowid(entity: &str, key: &Value) -> DbResult<i64> {
    match key {
        Value::Integer(i) => Ok(*i),
        Value::Real(r) => Ok(r.floor() as i64),
        Value::Text(s) => s
            .trim()
            .parse::<f64>()
            .map(|r| r.floor() as i64)
            .map_err(|_| DbError::value(format!("cannot coerce '{s}' to a rowid for '{entity}'"))),
        other => Err(DbError::value(format!(
            "cannot coerce {} to a rowid for '{entity}'",
            other.type_name()
        ))),
    }
}
