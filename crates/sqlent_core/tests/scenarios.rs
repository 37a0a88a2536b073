//! End-to-end scenarios across the whole manager.

use sqlent_core::{
    blob, int, numeric, real, text, Database, EntityOptions, Expr, Key, Value,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

fn open() -> Database {
    Database::open_in_memory().unwrap()
}

fn auto_create() -> EntityOptions {
    EntityOptions { auto_create: true }
}

#[test]
fn simple_insert_and_fetch() {
    let db = open();
    let map = db
        .entity(
            "map",
            Key::Name("key".into()),
            vec![("key", text().into()), ("value", text().into())],
            auto_create(),
        )
        .unwrap();

    let row = map
        .new(vec![("key", "a".into()), ("value", "b".into())], false)
        .unwrap();
    db.flush().unwrap();

    // Drop the only strong reference; the weak caches release the row.
    drop(row);

    let fetched = map.get("a").unwrap().expect("row persisted");
    assert_eq!(fetched.raw("key").unwrap(), Value::Text("a".into()));
    assert_eq!(fetched.raw("value").unwrap(), Value::Text("b".into()));
}

#[test]
fn identity_map_returns_same_object() {
    let db = open();
    let map = db
        .entity(
            "map",
            Key::Name("key".into()),
            vec![("key", text().into()), ("value", text().into())],
            auto_create(),
        )
        .unwrap();
    map.new(vec![("key", "a".into())], false).unwrap();
    db.flush().unwrap();

    let first = map.get("a").unwrap().unwrap();
    let second = map.get("a").unwrap().unwrap();
    assert_eq!(first, second);
}

#[test]
fn fkey_navigation_and_reparenting() {
    let db = open();
    let parent = db
        .entity(
            "parent",
            Key::Name("key".into()),
            vec![
                ("key", text().into()),
                ("name", text().into()),
                ("child", "child*".into()),
            ],
            auto_create(),
        )
        .unwrap();
    let child = db
        .entity(
            "child",
            Key::Name("data".into()),
            // Required and unique: each parent has at most one child.
            vec![("parent", "parent!?".into()), ("data", text().into())],
            auto_create(),
        )
        .unwrap();

    let a = parent
        .new(vec![("key", "a".into()), ("name", "first".into())], false)
        .unwrap();
    let b = parent
        .new(vec![("key", "b".into()), ("name", "second".into())], false)
        .unwrap();
    let kid = child
        .new(vec![("parent", (&a).into()), ("data", "blah".into())], false)
        .unwrap();
    db.flush().unwrap();

    let a_child = a.get("child").unwrap().into_row().expect("a has a child");
    assert_eq!(a_child.raw("data").unwrap(), Value::Text("blah".into()));
    assert!(b.get("child").unwrap().is_null());

    // Reparent in memory only.
    kid.set("parent", &b).unwrap();
    assert!(a.get("child").unwrap().is_null());
    let b_child = b.get("child").unwrap().into_row().expect("b has the child");
    assert_eq!(b_child, kid);
}

#[test]
fn data_type_coercion() {
    let db = open();
    let entity = db
        .entity(
            "types",
            Key::Id("id".into()),
            vec![
                ("text", text().into()),
                ("numeric", numeric().into()),
                ("int", int().into()),
                ("real", real().into()),
                ("blob", blob().into()),
            ],
            auto_create(),
        )
        .unwrap();

    let row = entity.new(vec![], false).unwrap();
    row.set("numeric", "7.1").unwrap();
    assert_eq!(row.raw("numeric").unwrap(), Value::Real(7.1));
    row.set("int", "5.2").unwrap();
    assert_eq!(row.raw("int").unwrap(), Value::Integer(5));
    row.set("real", "9.7").unwrap();
    assert_eq!(row.raw("real").unwrap(), Value::Real(9.7));
    row.set("text", 42i64).unwrap();
    assert_eq!(row.raw("text").unwrap(), Value::Text("42".into()));

    for field in ["numeric", "int", "real"] {
        assert!(row.set(field, "blah").is_err(), "{field} accepted 'blah'");
    }

    // Composite values are rejected on every scalar field.
    #[cfg(feature = "json")]
    assert!(row.set("text", serde_json::json!({"a": 1})).is_err());
    assert!(row.set("int", row.clone()).is_err());

    db.flush().unwrap();
    // An ID primary key equals its rowid after the first flush.
    assert_eq!(
        row.raw("id").unwrap(),
        Value::Integer(row.rowid().unwrap())
    );
}

#[test]
fn dirty_rows_merge_into_query_results() {
    let db = open();
    let parent = db
        .entity(
            "parent",
            Key::Name("key".into()),
            vec![("key", text().into()), ("children", "child*".into())],
            auto_create(),
        )
        .unwrap();
    let child = db
        .entity(
            "child",
            Key::Id("id".into()),
            vec![("parent", "parent!".into())],
            auto_create(),
        )
        .unwrap();

    let a = parent.new(vec![("key", "a".into())], false).unwrap();
    let b = parent.new(vec![("key", "b".into())], false).unwrap();
    let mut kids = Vec::new();
    for _ in 0..5 {
        kids.push(
            child
                .new(vec![("parent", (&a).into())], false)
                .unwrap(),
        );
    }
    db.flush().unwrap();

    // A sixth child in memory only, and the first reparented to b.
    let kid6 = child.new(vec![("parent", (&a).into())], false).unwrap();
    kids[0].set("parent", &b).unwrap();

    let a_children = a.get("children").unwrap().into_rows();
    assert_eq!(a_children.len(), 5); // four remaining plus the in-memory sixth
    assert!(a_children.contains(&kid6));
    assert!(!a_children.contains(&kids[0]));

    let b_children = b.get("children").unwrap().into_rows();
    assert_eq!(b_children, vec![kids[0].clone()]);

    kid6.set("parent", &b).unwrap();
    let b_children = b.get("children").unwrap().into_rows();
    assert_eq!(b_children.len(), 2);
    assert!(b_children.contains(&kids[0]));
    assert!(b_children.contains(&kid6));
}

#[test]
fn on_change_counts_dirty_transitions() {
    let db = open();
    let map = db
        .entity(
            "map",
            Key::Name("key".into()),
            vec![("key", text().into())],
            auto_create(),
        )
        .unwrap();

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
fn mutual_required_fkeys_rejected() {
    let db = open();
    db.entity(
        "alpha",
        Key::Default,
        vec![("beta", "beta!".into())],
        EntityOptions::default(),
    )
    .unwrap();
    let result = db.entity(
        "beta",
        Key::Default,
        vec![("alpha", "alpha!".into())],
        EntityOptions::default(),
    );
    assert!(result.is_err());
}

#[test]
fn optional_mutual_fkeys_flush_in_two_phases() {
    let db = open();
    // Mutually referencing, but neither side required: the skip-fkeys pass
    // inserts with NULLs and the follow-up pass patches the references.
    let left = db
        .entity(
            "left",
            Key::Id("id".into()),
            vec![("other", "right".into()), ("tag", text().into())],
            EntityOptions::default(),
        )
        .unwrap();
    let right = db
        .entity(
            "right",
            Key::Id("id".into()),
            vec![("other", "left".into()), ("tag", text().into())],
            EntityOptions::default(),
        )
        .unwrap();
    left.create().unwrap();
    right.create().unwrap();

    let l = left.new(vec![("tag", "l".into())], false).unwrap();
    let r = right.new(vec![("tag", "r".into()), ("other", (&l).into())], false).unwrap();
    l.set("other", &r).unwrap();

    db.flush().unwrap();

    assert_eq!(l.raw("other").unwrap(), Value::Integer(r.rowid().unwrap()));
    assert_eq!(r.raw("other").unwrap(), Value::Integer(l.rowid().unwrap()));

    // Navigating resolves back to the identical objects.
    assert_eq!(l.get("other").unwrap().into_row().unwrap(), r);
    assert_eq!(r.get("other").unwrap().into_row().unwrap(), l);
}

#[test]
fn unique_violations_rejected_in_memory_and_database() {
    let db = open();
    let map = db
        .entity(
            "map",
            Key::Name("key".into()),
            vec![("key", text().into())],
            auto_create(),
        )
        .unwrap();

    let first = map.new(vec![("key", "a".into())], false).unwrap();
    // In-memory collision against the unique cache.
    assert!(map.new(vec![("key", "a".into())], false).is_err());

    db.flush().unwrap();
    drop(first);

    // Database collision after the cached row is gone.
    assert!(map.new(vec![("key", "a".into())], false).is_err());
}

#[test]
fn set_raw_value_back_keeps_row_clean() {
    let db = open();
    let map = db
        .entity(
            "map",
            Key::Name("key".into()),
            vec![("key", text().into()), ("value", text().into())],
            auto_create(),
        )
        .unwrap();
    map.new(vec![("key", "a".into()), ("value", "b".into())], false)
        .unwrap();
    db.flush().unwrap();

    let row = map.get("a").unwrap().unwrap();
    let value = row.raw("value").unwrap();
    row.set("value", value).unwrap();
    assert!(!row.dirty());
    assert!(!db.pending_changes());
}

#[test]
fn underscore_prefix_reads_raw() {
    let db = open();
    let parent = db
        .entity(
            "parent",
            Key::Name("key".into()),
            vec![("key", text().into())],
            auto_create(),
        )
        .unwrap();
    let child = db
        .entity(
            "child",
            Key::Id("id".into()),
            vec![("parent", "parent!".into())],
            auto_create(),
        )
        .unwrap();

    let a = parent.new(vec![("key", "a".into())], false).unwrap();
    let kid = child.new(vec![("parent", (&a).into())], false).unwrap();
    db.flush().unwrap();

    // Resolved read yields the referent row; raw read yields its key.
    assert_eq!(kid.get("parent").unwrap().into_row().unwrap(), a);
    assert_eq!(
        kid.get("_parent").unwrap().as_value().unwrap(),
        &Value::Text("a".into())
    );
    // Case-insensitive field names.
    assert_eq!(
        kid.get("_PARENT").unwrap().as_value().unwrap(),
        &Value::Text("a".into())
    );
}

#[test]
fn delete_round_trip() {
    let db = open();
    let map = db
        .entity(
            "map",
            Key::Name("key".into()),
            vec![("key", text().into())],
            auto_create(),
        )
        .unwrap();
    let row = map.new(vec![("key", "a".into())], false).unwrap();
    db.flush().unwrap();

    row.delete().unwrap();
    assert!(row.deleted());
    db.flush().unwrap();

    assert!(map.get("a").unwrap().is_none());
    assert!(!map.has("a").unwrap());
}

#[test]
fn rollback_restores_loaded_rows() {
    let db = open();
    let map = db
        .entity(
            "map",
            Key::Name("key".into()),
            vec![("key", text().into()), ("value", text().into())],
            auto_create(),
        )
        .unwrap();
    map.new(vec![("key", "a".into()), ("value", "one".into())], false)
        .unwrap();
    db.flush().unwrap();

    db.begin(false).unwrap();
    let row = map.get("a").unwrap().unwrap();
    row.set("value", "two").unwrap();
    db.rollback().unwrap();

    assert_eq!(row.raw("value").unwrap(), Value::Text("one".into()));
}

#[test]
fn queries_see_database_and_pending_rows_consistently() {
    let db = open();
    let map = db
        .entity(
            "nums",
            Key::Id("id".into()),
            vec![("n", int().into())],
            auto_create(),
        )
        .unwrap();
    for i in 0..4 {
        map.new(vec![("n", (i as i64).into())], false).unwrap();
    }
    db.flush().unwrap();
    map.new(vec![("n", 9i64.into())], false).unwrap();

    let query = map.query(vec![Expr::ge("n", ":min")]).unwrap();
    let rows = query.run(&[("min", Value::Integer(2))]).unwrap();

    // Every result passes the predicate, and no row is duplicated.
    for row in &rows {
        assert!(query.test(row, &[("min", Value::Integer(2))]).unwrap());
    }
    let unique: std::collections::HashSet<i64> = rows
        .iter()
        .map(|r| r.raw("n").unwrap().as_integer().unwrap())
        .collect();
    assert_eq!(unique.len(), rows.len());
    assert_eq!(rows.len(), 3);
}

#[cfg(feature = "json")]
mod json_scenarios {
    use super::*;
    use sqlent_core::json;

    #[test]
    fn json_round_trip_through_flush() {
        let db = open();
        let docs = db
            .entity(
                "docs",
                Key::Id("id".into()),
                vec![("data", json().into())],
                auto_create(),
            )
            .unwrap();

        let payload = serde_json::json!({"name": "deep", "tags": ["a", "b"], "meta": {"depth": 3}});
        let row = docs
            .new(vec![("data", payload.clone().into())], false)
            .unwrap();
        db.flush().unwrap();
        let id = row.rowid().unwrap();
        drop(row);

        let fetched = docs.get(id).unwrap().unwrap();
        let decoded = fetched.get("data").unwrap();
        assert_eq!(decoded.as_json().unwrap(), &payload);
    }

    #[test]
    fn json_mutation_marks_dirty_without_writeback() {
        let db = open();
        let docs = db
            .entity(
                "docs",
                Key::Id("id".into()),
                vec![("data", json().into())],
                auto_create(),
            )
            .unwrap();
        let row = docs
            .new(
                vec![("data", serde_json::json!({"count": 1}).into())],
                false,
            )
            .unwrap();
        db.flush().unwrap();
        assert!(!row.dirty());

        {
            let mut data = row.json_mut("data").unwrap();
            data["count"] = serde_json::json!(2);
        }
        assert!(row.dirty());
        db.flush().unwrap();

        let id = row.rowid().unwrap();
        drop(row);
        let fetched = docs.get(id).unwrap().unwrap();
        assert_eq!(
            fetched.get("data").unwrap().as_json().unwrap()["count"],
            serde_json::json!(2)
        );
    }

    #[test]
    fn setting_raw_json_back_keeps_row_clean() {
        let db = open();
        let docs = db
            .entity(
                "docs",
                Key::Id("id".into()),
                vec![("data", json().into())],
                auto_create(),
            )
            .unwrap();
        let row = docs
            .new(
                vec![("data", serde_json::json!({"a": [1, 2]}).into())],
                false,
            )
            .unwrap();
        db.flush().unwrap();
        let id = row.rowid().unwrap();
        drop(row);

        // Freshly fetched: the field still holds the encoded text.
        let fetched = docs.get(id).unwrap().unwrap();
        let raw = fetched.raw("data").unwrap();
        fetched.set("data", raw).unwrap();
        assert!(!fetched.dirty());
        assert!(!db.pending_changes());

        // A structurally equal value is a no-op too.
        fetched
            .set("data", serde_json::json!({"a": [1, 2]}))
            .unwrap();
        assert!(!fetched.dirty());
    }

    #[test]
    fn json_path_queries_both_evaluators() {
        let db = open();
        let docs = db
            .entity(
                "docs",
                Key::Id("id".into()),
                vec![("data", json().into())],
                auto_create(),
            )
            .unwrap();
        docs.new(
            vec![("data", serde_json::json!({"meta": {"depth": 3}}).into())],
            false,
        )
        .unwrap();
        db.flush().unwrap();
        // In memory only.
        docs.new(
            vec![("data", serde_json::json!({"meta": {"depth": 7}}).into())],
            false,
        )
        .unwrap();

        let query = docs.query(vec![Expr::gt("data.meta.depth", 2i64)]).unwrap();
        assert!(query.sql().contains("json_extract(\"data\", '$.meta.depth')"));
        assert_eq!(query.run(&[]).unwrap().len(), 2);

        let deep = docs.query(vec![Expr::gt("data.meta.depth", 5i64)]).unwrap();
        assert_eq!(deep.run(&[]).unwrap().len(), 1);
    }
}
