//! Weak identity caches and the strong dirty set.

use crate::entity::row::{Row, RowInner, RowState};
use sqlent_driver::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

/// Per-entity row caches.
///
/// Rows are indexed weakly by rowid and by each unique field's lookup value,
/// so cold rows are reclaimed as soon as the application drops them. The
/// dirty set holds strong references: a row with pending database effects
/// must survive until flushed.
pub(crate) struct IdentityCache {
    by_rowid: HashMap<i64, Weak<RowInner>>,
    unique: HashMap<String, HashMap<Value, Weak<RowInner>>>,
    // BTreeMap keyed by serial: flush and query-merge walk rows in creation
    // order, which keeps results deterministic.
    dirty: BTreeMap<u64, Row>,
}

impl IdentityCache {
    pub(crate) fn new(unique_fields: &[String]) -> Self {
        Self {
            by_rowid: HashMap::new(),
            unique: unique_fields
                .iter()
                .map(|f| (f.clone(), HashMap::new()))
                .collect(),
            dirty: BTreeMap::new(),
        }
    }

    pub(crate) fn get_rowid(&mut self, rowid: i64) -> Option<Row> {
        match self.by_rowid.get(&rowid).and_then(Weak::upgrade) {
            Some(inner) => Some(Row { inner }),
            None => {
                // Drop the dead entry, if any.
                self.by_rowid.remove(&rowid);
                None
            }
        }
    }

    pub(crate) fn insert_rowid(&mut self, rowid: i64, row: &Row) {
        self.by_rowid.insert(rowid, Arc::downgrade(&row.inner));
    }

    pub(crate) fn remove_rowid(&mut self, rowid: i64) {
        self.by_rowid.remove(&rowid);
    }

    pub(crate) fn get_unique(&mut self, field: &str, lookup: &Value) -> Option<Row> {
        let map = self.unique.get_mut(field)?;
        match map.get(lookup).and_then(Weak::upgrade) {
            Some(inner) => Some(Row { inner }),
            None => {
                map.remove(lookup);
                None
            }
        }
    }

    /// Moves a row's cache entry from `old` to `new` on one unique field.
    ///
    /// The old entry is only dropped when it still points at this row (or at
    /// a dead one); null lookups are never cached.
    pub(crate) fn swap_unique(&mut self, field: &str, old: &Value, new: &Value, row: &Row) {
        let Some(map) = self.unique.get_mut(field) else {
            return;
        };
        if !old.is_null() {
            let stale = map.get(old).map_or(false, |w| {
                w.upgrade()
                    .map_or(true, |inner| Arc::ptr_eq(&inner, &row.inner))
            });
            if stale {
                map.remove(old);
            }
        }
        if !new.is_null() {
            map.insert(new.clone(), Arc::downgrade(&row.inner));
        }
    }

    /// Re-inserts a row into every cache, from its current state. Used when
    /// a rollback revives a flushed delete.
    pub(crate) fn reinsert(&mut self, row: &Row, state: &RowState) {
        if let Some(rowid) = state.rowid {
            self.by_rowid.insert(rowid, Arc::downgrade(&row.inner));
        }
        for (field, map) in self.unique.iter_mut() {
            if let Some(lookup) = state.lookups.get(field) {
                if !lookup.is_null() {
                    map.insert(lookup.clone(), Arc::downgrade(&row.inner));
                }
            }
        }
    }

    /// Drops every cache entry pointing at this row.
    pub(crate) fn purge(&mut self, row: &Row, state: &RowState) {
        if let Some(rowid) = state.rowid {
            self.by_rowid.remove(&rowid);
        }
        for map in self.unique.values_mut() {
            map.retain(|_, weak| {
                weak.upgrade()
                    .map_or(false, |inner| !Arc::ptr_eq(&inner, &row.inner))
            });
        }
    }

    pub(crate) fn add_dirty(&mut self, row: &Row) {
        self.dirty.insert(row.serial(), row.clone());
    }

    pub(crate) fn remove_dirty(&mut self, serial: u64) {
        self.dirty.remove(&serial);
    }

    /// Snapshot of the dirty set in serial order.
    pub(crate) fn dirty_rows(&self) -> Vec<Row> {
        self.dirty.values().cloned().collect()
    }

    pub(crate) fn dirty_len(&self) -> usize {
        self.dirty.len()
    }
}
