//! Transaction state: depth counting and per-row commit/rollback hooks.

use crate::database::DatabaseInner;
use crate::entity::row::{Row, RowState};
use crate::error::{DbError, DbResult};
use sqlent_driver::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// The manager's single open transaction.
///
/// `begin` increments the depth, `commit` decrements it; only the outermost
/// commit (or a forced one) touches the engine. Every row written, deleted,
/// flushed, or loaded while the transaction is open registers here with a
/// first-touch snapshot, so commit can promote overlays and rollback can
/// restore the pre-transaction in-memory state.
pub(crate) struct TxnState {
    pub(crate) depth: u32,
    rows: Vec<TxnRow>,
    index: HashMap<u64, usize>,
}

/// First-touch snapshot of one row under the open transaction.
pub(crate) struct TxnRow {
    row: Row,
    was_dirty: bool,
    was_deleted: bool,
    had_rowid: Option<i64>,
    /// Row came into existence inside this transaction.
    created: bool,
    /// Row was fetched from the database inside this transaction; rollback
    /// rereads its committed values.
    loaded: bool,
    /// Pre-transaction lookup value of each field overlaid so far.
    saved_lookups: HashMap<String, Value>,
}

impl TxnState {
    pub(crate) fn new() -> Self {
        Self {
            depth: 1,
            rows: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Registers a row on first touch; subsequently records per-field
    /// pre-transaction lookups.
    pub(crate) fn touch(&mut self, row: &Row, state: &RowState, field: Option<(&str, Value)>) {
        let serial = row.serial();
        let idx = match self.index.get(&serial) {
            Some(idx) => *idx,
            None => {
                self.rows.push(TxnRow {
                    row: row.clone(),
                    was_dirty: state.dirty,
                    was_deleted: state.deleted,
                    had_rowid: state.rowid,
                    created: state.rowid.is_none() && !state.dirty && state.committed.is_empty(),
                    loaded: false,
                    saved_lookups: HashMap::new(),
                });
                let idx = self.rows.len() - 1;
                self.index.insert(serial, idx);
                idx
            }
        };
        if let Some((name, old)) = field {
            self.rows[idx]
                .saved_lookups
                .entry(name.to_string())
                .or_insert(old);
        }
    }

    /// Marks an already-touched row as fetched inside this transaction.
    pub(crate) fn set_loaded(&mut self, serial: u64) {
        if let Some(idx) = self.index.get(&serial) {
            self.rows[*idx].loaded = true;
        }
    }

    pub(crate) fn into_rows(self) -> Vec<TxnRow> {
        self.rows
    }
}

/// Promotes overlays into committed state after the engine COMMIT.
pub(crate) fn commit_rows(rows: Vec<TxnRow>) {
    debug!(rows = rows.len(), "committing transaction");
    for tr in rows {
        let mut state = tr.row.state();
        let overlay: Vec<_> = state.overlay.drain().collect();
        for (name, stored) in overlay {
            state.committed.insert(name, stored);
        }
        state.txn_dirty = false;
    }
}

/// Restores in-memory row state after the engine ROLLBACK.
///
/// Overlays are discarded; lookup values and unique-cache positions revert;
/// rows flushed under the transaction re-enter the dirty set (rescinding
/// rowids assigned inside it); rows loaded inside the transaction reread
/// their committed values.
pub(crate) fn rollback_rows(db: &Arc<DatabaseInner>, rows: Vec<TxnRow>) -> DbResult<()> {
    debug!(rows = rows.len(), "rolling back transaction");
    let mut first_error: Option<DbError> = None;

    for tr in &rows {
        let entity = tr.row.entity();
        {
            let mut state = tr.row.state();
            state.overlay.clear();

            for (name, old) in &tr.saved_lookups {
                let current = state.lookups.get(name).cloned().unwrap_or(Value::Null);
                let unique = entity
                    .field(name)
                    .map(|def| def.is_unique())
                    .unwrap_or(false);
                if unique && current != *old {
                    entity.swap_unique(name, &current, old, &tr.row);
                }
                state.lookups.insert(name.clone(), old.clone());
            }

            if tr.created {
                // Born inside the transaction: nothing to restore, the row
                // simply ceases to be pending.
                state.deleted = tr.was_deleted;
                state.txn_dirty = false;
                state.dirty = false;
                let mut cache = entity.cache();
                cache.purge(&tr.row, &state);
                cache.remove_dirty(tr.row.serial());
                state.rowid = None;
                continue;
            }

            let flushed_delete = state.txn_dirty && state.deleted;
            state.deleted = tr.was_deleted;
            if state.txn_dirty {
                state.txn_dirty = false;
                if flushed_delete {
                    // The DELETE was rolled back; the row is back in the
                    // database and its delete is pending again.
                    entity.cache().reinsert(&tr.row, &state);
                } else if tr.had_rowid.is_none() {
                    if let Some(rowid) = state.rowid.take() {
                        entity.cache().remove_rowid(rowid);
                    }
                }
                if tr.was_dirty && !state.dirty {
                    state.dirty = true;
                    entity.add_dirty(&tr.row);
                    db.note_change();
                }
            }
        }

        if tr.loaded {
            if let Err(e) = entity.reread_committed(&tr.row) {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
