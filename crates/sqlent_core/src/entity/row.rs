//! The row object: committed/overlay value maps, accessors, dirty tracking.

use crate::entity::Entity;
use crate::error::{DbError, DbResult};
use crate::schema::field::FieldKind;
use parking_lot::{Mutex, MutexGuard};
use sqlent_driver::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A value being written into a row field.
///
/// Only scalars, row references, and (with the `json` feature) structured
/// JSON values can enter a row; everything else is unrepresentable and
/// therefore rejected by construction.
#[derive(Debug, Clone)]
pub enum SetValue {
    /// A scalar.
    Value(Value),
    /// A row of the referenced entity, for ENTITY fields.
    Row(Row),
    /// A structured JSON value.
    #[cfg(feature = "json")]
    Json(serde_json::Value),
}

impl SetValue {
    /// Short description for error messages.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            SetValue::Value(v) => v.type_name().to_string(),
            SetValue::Row(r) => format!("a row of '{}'", r.entity_name()),
            #[cfg(feature = "json")]
            SetValue::Json(_) => "a json value".to_string(),
        }
    }
}

impl From<Value> for SetValue {
    fn from(v: Value) -> Self {
        SetValue::Value(v)
    }
}

impl From<i64> for SetValue {
    fn from(v: i64) -> Self {
        SetValue::Value(Value::Integer(v))
    }
}

impl From<i32> for SetValue {
    fn from(v: i32) -> Self {
        SetValue::Value(Value::Integer(i64::from(v)))
    }
}

impl From<f64> for SetValue {
    fn from(v: f64) -> Self {
        SetValue::Value(Value::Real(v))
    }
}

impl From<bool> for SetValue {
    fn from(v: bool) -> Self {
        SetValue::Value(Value::Integer(i64::from(v)))
    }
}

impl From<&str> for SetValue {
    fn from(v: &str) -> Self {
        SetValue::Value(Value::Text(v.to_string()))
    }
}

impl From<String> for SetValue {
    fn from(v: String) -> Self {
        SetValue::Value(Value::Text(v))
    }
}

impl From<Vec<u8>> for SetValue {
    fn from(v: Vec<u8>) -> Self {
        SetValue::Value(Value::Blob(v))
    }
}

impl From<Row> for SetValue {
    fn from(r: Row) -> Self {
        SetValue::Row(r)
    }
}

impl From<&Row> for SetValue {
    fn from(r: &Row) -> Self {
        SetValue::Row(r.clone())
    }
}

#[cfg(feature = "json")]
impl From<serde_json::Value> for SetValue {
    fn from(v: serde_json::Value) -> Self {
        SetValue::Json(v)
    }
}

/// A stored field value: scalar, pending row reference, or JSON cell.
#[derive(Debug, Clone)]
pub(crate) enum Stored {
    /// A primitive, equal to the lookup value.
    Value(Value),
    /// A referent that has not been inserted yet; lookup is null until the
    /// flush engine resolves it.
    Ref(Row),
    /// A structured JSON value with a lazily maintained encoded form.
    #[cfg(feature = "json")]
    Json(JsonCell),
}

/// Decoded JSON value plus its invalidatable encoded text.
#[cfg(feature = "json")]
#[derive(Debug, Clone)]
pub(crate) struct JsonCell {
    pub value: serde_json::Value,
    pub encoded: Option<String>,
}

#[cfg(feature = "json")]
impl JsonCell {
    pub(crate) fn from_value(value: serde_json::Value) -> Self {
        Self {
            value,
            encoded: None,
        }
    }

    pub(crate) fn from_encoded(value: serde_json::Value, encoded: String) -> Self {
        Self {
            value,
            encoded: Some(encoded),
        }
    }

    /// Returns the encoded text, producing and caching it if needed.
    pub(crate) fn ensure_encoded(&mut self) -> DbResult<&str> {
        if self.encoded.is_none() {
            let text = serde_json::to_string(&self.value)
                .map_err(|e| DbError::json(format!("encode failed: {e}")))?;
            self.encoded = Some(text);
        }
        Ok(self.encoded.as_deref().unwrap_or_default())
    }
}

/// The result of a resolved field read.
#[derive(Debug, Clone)]
pub enum Fetched {
    /// A scalar (or null).
    Value(Value),
    /// A referent row, or a singular virtual-fkey match.
    Row(Row),
    /// The matches of a plural virtual fkey, in insertion order.
    Rows(Vec<Row>),
    /// A decoded JSON value.
    #[cfg(feature = "json")]
    Json(serde_json::Value),
}

impl Fetched {
    /// True for a null scalar (including an absent singular navigation).
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Fetched::Value(Value::Null))
    }

    /// The scalar value, if any.
    #[must_use]
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Fetched::Value(v) => Some(v),
            _ => None,
        }
    }

    /// The row, if this resolved to a single row.
    #[must_use]
    pub fn as_row(&self) -> Option<&Row> {
        match self {
            Fetched::Row(r) => Some(r),
            _ => None,
        }
    }

    /// Consumes into a row, if this resolved to a single row.
    #[must_use]
    pub fn into_row(self) -> Option<Row> {
        match self {
            Fetched::Row(r) => Some(r),
            _ => None,
        }
    }

    /// Consumes into the row sequence of a plural navigation.
    #[must_use]
    pub fn into_rows(self) -> Vec<Row> {
        match self {
            Fetched::Rows(rows) => rows,
            Fetched::Row(r) => vec![r],
            _ => Vec::new(),
        }
    }

    /// The decoded JSON value, if any.
    #[cfg(feature = "json")]
    #[must_use]
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Fetched::Json(v) => Some(v),
            _ => None,
        }
    }
}

/// Mutable state of one row.
pub(crate) struct RowState {
    /// Engine rowid, assigned at first successful insert.
    pub rowid: Option<i64>,
    /// Values known to match the database.
    pub committed: HashMap<String, Stored>,
    /// Transaction-local writes masking `committed`.
    pub overlay: HashMap<String, Stored>,
    /// Per-field primitive lookup values.
    pub lookups: HashMap<String, Value>,
    /// Delete pending.
    pub deleted: bool,
    /// Member of the entity's dirty set.
    pub dirty: bool,
    /// Flushed under the open transaction, not yet committed.
    pub txn_dirty: bool,
}

impl RowState {
    fn new() -> Self {
        Self {
            rowid: None,
            committed: HashMap::new(),
            overlay: HashMap::new(),
            lookups: HashMap::new(),
            deleted: false,
            dirty: false,
            txn_dirty: false,
        }
    }

    /// The effective stored value of a field: overlay masks committed.
    pub(crate) fn stored(&self, name: &str) -> Option<&Stored> {
        self.overlay.get(name).or_else(|| self.committed.get(name))
    }
}

pub(crate) struct RowInner {
    pub(crate) entity: Entity,
    pub(crate) serial: u64,
    pub(crate) state: Mutex<RowState>,
}

/// An identity-mapped row.
///
/// At most one live `Row` exists per (entity, rowid) and per (entity,
/// unique field, lookup value); clones share the same object. Reads resolve
/// ENTITY fields to their referent rows and decode JSON fields; writes go
/// through [`Row::set`], which coerces, enforces uniqueness, and marks the
/// row dirty for the next flush.
#[derive(Clone)]
pub struct Row {
    pub(crate) inner: Arc<RowInner>,
}

impl Row {
    pub(crate) fn create(entity: Entity, serial: u64) -> Self {
        Self {
            inner: Arc::new(RowInner {
                entity,
                serial,
                state: Mutex::new(RowState::new()),
            }),
        }
    }

    /// The entity this row belongs to.
    #[must_use]
    pub fn entity(&self) -> Entity {
        self.inner.entity.clone()
    }

    pub(crate) fn entity_name(&self) -> &str {
        self.inner.entity.name()
    }

    pub(crate) fn serial(&self) -> u64 {
        self.inner.serial
    }

    /// The engine rowid, if the row has been inserted.
    #[must_use]
    pub fn rowid(&self) -> Option<i64> {
        self.inner.state.lock().rowid
    }

    /// True once [`Row::delete`] has been called.
    #[must_use]
    pub fn deleted(&self) -> bool {
        self.inner.state.lock().deleted
    }

    /// True while the row has pending database effects.
    #[must_use]
    pub fn dirty(&self) -> bool {
        self.inner.state.lock().dirty
    }

    /// The field names of this row's entity, persisted and virtual.
    #[must_use]
    pub fn fields(&self) -> Vec<String> {
        self.inner.entity.field_names()
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, RowState> {
        self.inner.state.lock()
    }

    /// The primary-key scalar of this row, or `None` while uninserted.
    ///
    /// This is the value foreign keys store and caches look up by.
    pub(crate) fn pk_lookup(&self) -> Option<Value> {
        let state = self.inner.state.lock();
        let rowid = state.rowid?;
        let key = self.inner.entity.key();
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

    /// Reads a field, resolving ENTITY referents, virtual fkeys, and JSON.
    ///
    /// Field names are case-insensitive. A leading underscore reads the raw
    /// lookup value instead: `row.get("_owner")` is `row.raw("owner")`.
    pub fn get(&self, name: &str) -> DbResult<Fetched> {
        let name = name.to_lowercase();
        if let Some(stripped) = name.strip_prefix('_') {
            return self.raw(stripped).map(Fetched::Value);
        }

        let entity = self.inner.entity.clone();
        let def = entity.field(&name)?;
        if def.is_virtual() {
            return entity.resolve_nav(self, &name);
        }

        let stored = {
            let state = self.inner.state.lock();
            state.stored(&name).cloned()
        };

        match stored {
            Some(Stored::Ref(referent)) => Ok(Fetched::Row(referent)),
            #[cfg(feature = "json")]
            Some(Stored::Json(cell)) => Ok(Fetched::Json(cell.value)),
            #[cfg(feature = "json")]
            Some(Stored::Value(Value::Text(s))) if def.kind() == FieldKind::Json => {
                // Fetched from the database as text; decode on read.
                let decoded: serde_json::Value = serde_json::from_str(&s)
                    .map_err(|e| DbError::json(format!("invalid json content: {e}")))?;
                Ok(Fetched::Json(decoded))
            }
            Some(Stored::Value(v)) => {
                if def.kind() == FieldKind::Entity && !v.is_null() {
                    let target = def.references().unwrap_or_default().to_string();
                    let referenced = entity.db()?.get_entity(&target)?;
                    match referenced.get(v)? {
                        Some(row) => Ok(Fetched::Row(row)),
                        None => Ok(Fetched::Value(Value::Null)),
                    }
                } else {
                    Ok(Fetched::Value(v))
                }
            }
            None => Ok(Fetched::Value(Value::Null)),
        }
    }

    /// Reads a field's raw lookup value: the primitive used for equality
    /// against the database. For ENTITY fields this is the referent's
    /// primary key, null while the referent is uninserted.
    pub fn raw(&self, name: &str) -> DbResult<Value> {
        let name = name.to_lowercase();
        let name = name.strip_prefix('_').unwrap_or(&name);
        let def = self.inner.entity.field(name)?;
        if def.is_virtual() {
            return Err(DbError::value(format!(
                "virtual field '{name}' of '{}' has no raw value",
                self.entity_name()
            )));
        }

        let mut state = self.inner.state.lock();
        #[cfg(feature = "json")]
        {
            // JSON lookups are re-encoded on demand; mutation through the
            // guard invalidates the cached text.
            let needs_encode = matches!(state.stored(name), Some(Stored::Json(_)));
            if needs_encode {
                let in_overlay = matches!(state.overlay.get(name), Some(Stored::Json(_)));
                let encoded = {
                    let slot = if in_overlay {
                        state.overlay.get_mut(name)
                    } else {
                        state.committed.get_mut(name)
                    };
                    match slot {
                        Some(Stored::Json(cell)) => cell.ensure_encoded()?.to_string(),
                        _ => unreachable!("stored() said json"),
                    }
                };
                let lookup = Value::Text(encoded);
                state.lookups.insert(name.to_string(), lookup.clone());
                return Ok(lookup);
            }
        }
        Ok(state.lookups.get(name).cloned().unwrap_or(Value::Null))
    }

    /// Writes a field.
    ///
    /// Rejects unknown fields and uncoercible values; enforces uniqueness
    /// against the in-memory cache and the database; swaps the unique-cache
    /// entry; records the value into the transaction overlay when one is
    /// active, else into the committed map; marks the row dirty.
    ///
    /// Writing a value equal to the field's current one leaves the row
    /// untouched.
    pub fn set(&self, name: &str, value: impl Into<SetValue>) -> DbResult<()> {
        self.set_checked(name, value.into(), true)
    }

    pub(crate) fn set_checked(&self, name: &str, value: SetValue, check: bool) -> DbResult<()> {
        let name = name.to_lowercase();
        let entity = self.inner.entity.clone();
        let def = entity.field(&name)?.clone();
        if def.is_virtual() {
            return Err(DbError::value(format!(
                "cannot set virtual field '{name}' of '{}'",
                self.entity_name()
            )));
        }

        // Coerce before taking the state lock; ENTITY coercion reads the
        // referent's state.
        let (stored, lookup) = def.transform(entity.name(), value)?;

        let db = entity.db()?;
        db.ensure_open()?;
        let mut state = self.inner.state.lock();
        let old_lookup = state.lookups.get(&name).cloned().unwrap_or(Value::Null);

        // No-op writes keep the row clean. JSON fields compare decoded
        // values: a fresh coercion always yields a cell, while a row loaded
        // from the database still holds the encoded text.
        let noop = match (state.stored(&name), &stored) {
            (Some(Stored::Value(current)), Stored::Value(new)) => {
                current == new && old_lookup == lookup
            }
            #[cfg(feature = "json")]
            (Some(Stored::Json(current)), Stored::Json(new)) => current.value == new.value,
            #[cfg(feature = "json")]
            (Some(Stored::Value(Value::Text(current))), Stored::Json(new)) => {
                serde_json::from_str::<serde_json::Value>(current)
                    .map_or(false, |decoded| decoded == new.value)
            }
            _ => false,
        };
        if noop {
            return Ok(());
        }

        if check && def.is_unique() && lookup != old_lookup && !lookup.is_null() {
            entity.check_unique(&db, &name, &lookup, self)?;
        }

        let in_txn = db.transaction_active();
        if in_txn {
            db.txn_touch(self, &state, Some((name.as_str(), old_lookup.clone())));
        }
        if def.is_unique() {
            entity.swap_unique(&name, &old_lookup, &lookup, self);
        }
        if in_txn {
            state.overlay.insert(name.clone(), stored);
        } else {
            state.committed.insert(name.clone(), stored);
        }
        state.lookups.insert(name, lookup);
        self.mark_dirty_locked(&db, &mut state);
        Ok(())
    }

    /// Marks the row for deletion at the next flush.
    pub fn delete(&self) -> DbResult<()> {
        let db = self.inner.entity.db()?;
        db.ensure_open()?;
        let mut state = self.inner.state.lock();
        if state.deleted {
            return Ok(());
        }
        if db.transaction_active() {
            db.txn_touch(self, &state, None);
        }
        state.deleted = true;
        self.mark_dirty_locked(&db, &mut state);
        Ok(())
    }

    /// Flushes this row alone. Returns true when the row came out clean,
    /// false when it must wait for an uninserted referent.
    pub fn flush(&self, skip_fkeys: bool) -> DbResult<bool> {
        self.inner.entity.flush_row(self, skip_fkeys)
    }

    /// Obtains a mutation guard over a JSON field's decoded value.
    ///
    /// Dropping the guard re-marks the row dirty and invalidates the cached
    /// encoded form; callers never write the value back explicitly.
    #[cfg(feature = "json")]
    pub fn json_mut(&self, name: &str) -> DbResult<JsonMut<'_>> {
        let name = name.to_lowercase();
        let entity = self.inner.entity.clone();
        let def = entity.field(&name)?;
        if def.kind() != FieldKind::Json {
            return Err(DbError::value(format!(
                "field '{name}' of '{}' is not json",
                self.entity_name()
            )));
        }
        let db = entity.db()?;
        let mut state = self.inner.state.lock();
        let in_txn = db.transaction_active();
        if in_txn {
            let old_lookup = state.lookups.get(&name).cloned().unwrap_or(Value::Null);
            db.txn_touch(self, &state, Some((name.as_str(), old_lookup)));
            // Copy-on-write into the overlay so rollback can discard it.
            if !state.overlay.contains_key(&name) {
                if let Some(cell) = state.committed.get(&name).cloned() {
                    state.overlay.insert(name.clone(), cell);
                }
            }
        }

        // Normalize the mutable slot to a decoded cell: absent fields start
        // at null, text loaded from the database is decoded in place.
        let normalized = match state.stored(&name) {
            Some(Stored::Json(_)) => None,
            Some(Stored::Value(Value::Text(s))) => {
                let decoded: serde_json::Value = serde_json::from_str(s)
                    .map_err(|e| DbError::json(format!("invalid json content: {e}")))?;
                Some(Stored::Json(JsonCell::from_encoded(decoded, s.clone())))
            }
            Some(Stored::Value(Value::Null)) | None => {
                Some(Stored::Json(JsonCell::from_value(serde_json::Value::Null)))
            }
            Some(_) => {
                return Err(DbError::json(format!(
                    "field '{name}' of '{}' does not hold json",
                    self.entity_name()
                )))
            }
        };
        if let Some(cell) = normalized {
            if in_txn || state.overlay.contains_key(&name) {
                state.overlay.insert(name.clone(), cell);
            } else {
                state.committed.insert(name.clone(), cell);
            }
        }

        Ok(JsonMut {
            row: self,
            db,
            state,
            field: name,
        })
    }

    /// Marks dirty under an already-held state lock.
    pub(crate) fn mark_dirty_locked(
        &self,
        db: &Arc<crate::database::DatabaseInner>,
        state: &mut RowState,
    ) {
        if !state.dirty {
            state.dirty = true;
            self.inner.entity.add_dirty(self);
            db.note_change();
        }
    }

    /// A rendering of the row's internal state, for diagnostics.
    #[must_use]
    pub fn debug_snapshot(&self) -> String {
        let state = self.inner.state.lock();
        let mut names: Vec<&String> = state.lookups.keys().collect();
        names.sort();
        let mut out = format!(
            "{}(rowid={:?} dirty={} deleted={} txn_dirty={})",
            self.entity_name(),
            state.rowid,
            state.dirty,
            state.deleted,
            state.txn_dirty
        );
        for name in names {
            let overlaid = if state.overlay.contains_key(name.as_str()) {
                "*"
            } else {
                ""
            };
            out.push_str(&format!(
                "\n  {}{} = {}",
                name,
                overlaid,
                state.lookups.get(name).unwrap_or(&Value::Null)
            ));
        }
        out
    }
}

impl PartialEq for Row {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Row {}

impl fmt::Debug for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Row")
            .field("entity", &self.entity_name())
            .field("rowid", &state.rowid)
            .field("dirty", &state.dirty)
            .field("deleted", &state.deleted)
            .finish_non_exhaustive()
    }
}

/// Guard for in-place mutation of a JSON field.
///
/// Dereferences to the decoded [`serde_json::Value`]; on drop the cached
/// encoded form is invalidated and the owning row is marked dirty.
#[cfg(feature = "json")]
pub struct JsonMut<'a> {
    row: &'a Row,
    db: Arc<crate::database::DatabaseInner>,
    state: MutexGuard<'a, RowState>,
    field: String,
}

#[cfg(feature = "json")]
impl JsonMut<'_> {
    fn cell(&mut self) -> &mut JsonCell {
        let cell = if self.state.overlay.contains_key(&self.field) {
            self.state.overlay.get_mut(&self.field)
        } else {
            self.state.committed.get_mut(&self.field)
        };
        match cell {
            Some(Stored::Json(cell)) => cell,
            _ => unreachable!("json_mut guards only json cells"),
        }
    }
}

#[cfg(feature = "json")]
impl std::ops::Deref for JsonMut<'_> {
    type Target = serde_json::Value;

    fn deref(&self) -> &Self::Target {
        let cell = if self.state.overlay.contains_key(&self.field) {
            self.state.overlay.get(&self.field)
        } else {
            self.state.committed.get(&self.field)
        };
        match cell {
            Some(Stored::Json(cell)) => &cell.value,
            _ => unreachable!("json_mut guards only json cells"),
        }
    }
}

#[cfg(feature = "json")]
impl std::ops::DerefMut for JsonMut<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.cell().value
    }
}

#[cfg(feature = "json")]
impl Drop for JsonMut<'_> {
    fn drop(&mut self) {
        self.cell().encoded = None;
        self.state.lookups.remove(&self.field);
        let row = self.row.clone();
        let db = Arc::clone(&self.db);
        row.mark_dirty_locked(&db, &mut self.state);
    }
}
