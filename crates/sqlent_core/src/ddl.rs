//! CREATE TABLE generation from the field model.

use crate::database::DatabaseInner;
use crate::entity::Entity;
use crate::error::{DbError, DbResult};
use crate::schema::field::FieldKind;
use std::sync::Arc;

/// Emits `CREATE TABLE IF NOT EXISTS` for an entity.
///
/// ENTITY columns adopt the referenced primary key's SQL type and gain a
/// cascading foreign-key clause; virtual fields are omitted; the PRIMARY KEY
/// clause is omitted for rowid-keyed tables.
pub(crate) fn create_sql(entity: &Entity, db: &Arc<DatabaseInner>) -> DbResult<String> {
    let inner = &entity.inner;
    let mut lines = Vec::new();
    let mut fkeys = Vec::new();

    for name in &inner.field_order {
        let def = &inner.fields[name.as_str()];
        let sql_type = match def.kind() {
            FieldKind::Entity => {
                let target_name = def.references().ok_or_else(|| {
                    DbError::schema(format!("field '{name}' of '{}' has no target", inner.name))
                })?;
                let target = db.get_entity(target_name)?;
                let (ref_column, sql_type) = if target.key() == "rowid" {
                    ("rowid".to_string(), "INTEGER")
                } else {
                    let pk = target.field(target.key())?;
                    let sql_type = match pk.kind() {
                        FieldKind::Entity => "INTEGER",
                        kind => kind.sql_type(),
                    };
                    (format!("\"{}\"", target.key()), sql_type)
                };
                fkeys.push(format!(
                    "FOREIGN KEY(\"{name}\") REFERENCES \"{}\"({ref_column}) \
                     ON UPDATE CASCADE ON DELETE CASCADE",
                    target.name()
                ));
                sql_type
            }
            kind => kind.sql_type(),
        };

        let mut line = format!("\"{name}\" {sql_type}");
        if def.is_required() {
            line.push_str(" NOT NULL");
        }
        // The PRIMARY KEY clause already implies uniqueness for the key.
        if def.is_unique() && *name != inner.key {
            line.push_str(" UNIQUE");
        }
        lines.push(line);
    }

    lines.extend(fkeys);
    if inner.key != "rowid" {
        lines.push(format!("PRIMARY KEY(\"{}\")", inner.key));
    }

    Ok(format!(
        "CREATE TABLE IF NOT EXISTS \"{}\" ({})",
        inner.name,
        lines.join(", ")
    ))
}

#[cfg(test)]
mod tests {
    use crate::database::Database;
    use crate::schema::field::{blob, int, numeric, real, text};
    use crate::schema::{EntityOptions, Key};

    fn db() -> Database {
        Database::open_in_memory().unwrap()
    }

    #[test]
    fn scalar_table() {
        let db = db();
        let entity = db
            .entity(
                "things",
                Key::Name("key".into()),
                vec![
                    ("key", text().into()),
                    ("count", int().required().into()),
                    ("weight", real().into()),
                    ("score", numeric().into()),
                    ("payload", blob().into()),
                ],
                EntityOptions::default(),
            )
            .unwrap();
        let sql = entity.create_sql().unwrap();
        assert_eq!(
            sql,
            "CREATE TABLE IF NOT EXISTS \"things\" (\
             \"key\" TEXT, \
             \"count\" INTEGER NOT NULL, \
             \"weight\" REAL, \
             \"score\" REAL, \
             \"payload\" BLOB, \
             PRIMARY KEY(\"key\"))"
        );
        entity.create().unwrap();
    }

    #[test]
    fn rowid_table_omits_primary_key() {
        let db = db();
        let entity = db
            .entity(
                "plain",
                Key::Default,
                vec![("v", text().into())],
                EntityOptions::default(),
            )
            .unwrap();
        let sql = entity.create_sql().unwrap();
        assert!(!sql.contains("PRIMARY KEY"), "{sql}");
        entity.create().unwrap();
    }

    #[test]
    fn id_key_is_integer() {
        let db = db();
        let entity = db
            .entity(
                "items",
                Key::Id("id".into()),
                vec![("v", text().into())],
                EntityOptions::default(),
            )
            .unwrap();
        let sql = entity.create_sql().unwrap();
        assert!(sql.contains("\"id\" INTEGER"), "{sql}");
        assert!(sql.contains("PRIMARY KEY(\"id\")"), "{sql}");
        entity.create().unwrap();
    }

    #[test]
    fn fkey_adopts_referenced_type_and_cascades() {
        let db = db();
        db.entity(
            "parent",
            Key::Name("key".into()),
            vec![("key", text().into())],
            EntityOptions::default(),
        )
        .unwrap();
        let child = db
            .entity(
                "child",
                Key::Default,
                vec![("parent", "parent!".into()), ("v", text().into())],
                EntityOptions::default(),
            )
            .unwrap();
        let sql = child.create_sql().unwrap();
        assert!(sql.contains("\"parent\" TEXT NOT NULL"), "{sql}");
        assert!(
            sql.contains(
                "FOREIGN KEY(\"parent\") REFERENCES \"parent\"(\"key\") \
                 ON UPDATE CASCADE ON DELETE CASCADE"
            ),
            "{sql}"
        );
    }

    #[test]
    fn unique_fields_emit_unique() {
        let db = db();
        let entity = db
            .entity(
                "users",
                Key::Id("id".into()),
                vec![("email", "text!?".into()), ("name", text().into())],
                EntityOptions::default(),
            )
            .unwrap();
        let sql = entity.create_sql().unwrap();
        assert!(sql.contains("\"email\" TEXT NOT NULL UNIQUE"), "{sql}");
        // The primary key relies on its PRIMARY KEY clause alone.
        assert!(!sql.contains("\"id\" INTEGER UNIQUE"), "{sql}");
    }

    #[test]
    fn unregistered_reference_fails() {
        let db = db();
        let entity = db
            .entity(
                "orphan",
                Key::Default,
                vec![("target", "ghost".into())],
                EntityOptions::default(),
            )
            .unwrap();
        assert!(entity.create_sql().is_err());
    }

    #[cfg(feature = "json")]
    #[test]
    fn json_stores_text() {
        let db = db();
        let entity = db
            .entity(
                "docs",
                Key::Id("id".into()),
                vec![("data", crate::schema::field::json().into())],
                EntityOptions::default(),
            )
            .unwrap();
        let sql = entity.create_sql().unwrap();
        assert!(sql.contains("\"data\" TEXT"), "{sql}");
    }
}
