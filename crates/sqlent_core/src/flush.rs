//! Topological two-phase drain of dirty rows across all entities.

use crate::database::DatabaseInner;
use crate::error::{DbError, DbResult};
use std::sync::Arc;
use tracing::{debug, trace};

/// Drains every entity's dirty set.
///
/// The protocol is intentionally agnostic of declared dependency order,
/// which is incomplete for non-required foreign keys:
///
/// 1. Passes alternate the `skip_fkeys` flag, starting with it on: rows
///    whose optional references are still uninserted go in with NULL and
///    stay dirty, required ones wait for a later pass.
/// 2. Progress is measured on `skip_fkeys=false` passes; a pass that leaves
///    as many rows dirty as the previous one proves a cycle of required
///    references and aborts.
pub(crate) fn raw_flush(db: &Arc<DatabaseInner>) -> DbResult<()> {
    let mut to_flush = db.entities_ordered();
    let mut skip_fkeys = false;
    let mut last_total: Option<usize> = None;

    loop {
        skip_fkeys = !skip_fkeys;
        let mut total = 0usize;
        let mut still_dirty = Vec::new();
        for entity in &to_flush {
            let remaining = entity.flush(skip_fkeys)?;
            if remaining > 0 {
                still_dirty.push(entity.clone());
            }
            total += remaining;
        }
        trace!(skip_fkeys, remaining = total, "flush pass");

        if !skip_fkeys {
            if total == 0 {
                break;
            }
            if last_total == Some(total) {
                debug!(remaining = total, "flush stalled");
                return Err(DbError::UnresolvedFlush { remaining: total });
            }
            last_total = Some(total);
        }
        to_flush = still_dirty;
    }

    db.clear_pending();
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::database::Database;
    use crate::error::DbError;
    use crate::schema::field::text;
    use crate::schema::{EntityOptions, Key};

    #[test]
    fn stalls_on_unsatisfiable_required_reference() {
        let db = Database::open_in_memory().unwrap();
        let parent = db
            .entity(
                "parent",
                Key::Name("key".into()),
                vec![("key", text().into())],
                EntityOptions { auto_create: true },
            )
            .unwrap();
        let child = db
            .entity(
                "child",
                Key::Default,
                vec![("parent", "parent!".into())],
                EntityOptions { auto_create: true },
            )
            .unwrap();

        let p = parent.new(vec![("key", "a".into())], false).unwrap();
        child.new(vec![("parent", (&p).into())], false).unwrap();
        // The referent disappears before it was ever inserted; the child's
        // required reference can never resolve.
        p.delete().unwrap();

        let result = db.flush();
        assert!(matches!(result, Err(DbError::UnresolvedFlush { .. })));
        assert!(!db.transaction());
    }

    #[test]
    fn forward_reference_resolves_across_passes() {
        let db = Database::open_in_memory().unwrap();
        // Child registered (and therefore flushed) before its parent.
        let child = db
            .entity(
                "child",
                Key::Default,
                vec![("parent", "parent!".into()), ("tag", text().into())],
                EntityOptions::default(),
            )
            .unwrap();
        let parent = db
            .entity(
                "parent",
                Key::Name("key".into()),
                vec![("key", text().into())],
                EntityOptions { auto_create: true },
            )
            .unwrap();
        child.create().unwrap();

        let p = parent.new(vec![("key", "a".into())], false).unwrap();
        let c = child
            .new(vec![("parent", (&p).into()), ("tag", "t".into())], false)
            .unwrap();

        db.flush().unwrap();
        assert!(c.rowid().is_some());
        assert_eq!(
            c.raw("parent").unwrap(),
            sqlent_driver::Value::Text("a".into())
        );
    }
}
