//! Entity registration: key resolution, shorthand expansion, validation,
//! and the required-fkey closure check.

pub mod field;

use crate::database::DatabaseInner;
use crate::entity::Entity;
use crate::error::{DbError, DbResult};
use crate::schema::field::{id, FieldDef, FieldKind, FieldSpec};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// The primary-key specifier of a declaration.
#[derive(Debug, Clone)]
pub enum Key {
    /// Consult the manager's `default_key` register; rowid when unset.
    Default,
    /// Use the named declared field (`"rowid"` selects the implicit key).
    Name(String),
    /// Synthesize an ID field with this name as the primary key.
    Id(String),
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::Name(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::Name(s)
    }
}

/// Options accepted at entity registration.
#[derive(Debug, Clone, Default)]
pub struct EntityOptions {
    /// Issue `CREATE TABLE IF NOT EXISTS` immediately. Requires every
    /// referenced entity to be registered already.
    pub auto_create: bool,
}

/// All registered entities, in registration order.
pub(crate) struct Registry {
    map: HashMap<String, Entity>,
    order: Vec<String>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            map: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub(crate) fn get(&self, name: &str) -> Option<&Entity> {
        self.map.get(name)
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    pub(crate) fn insert(&mut self, entity: Entity) {
        self.order.push(entity.name().to_string());
        self.map.insert(entity.name().to_string(), entity);
    }

    pub(crate) fn ordered(&self) -> Vec<Entity> {
        self.order
            .iter()
            .filter_map(|name| self.map.get(name).cloned())
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }
}

/// Declares an entity: validates the field set, resolves the key, rejects
/// circular required foreign keys, and registers the result.
pub(crate) fn register(
    db: &Arc<DatabaseInner>,
    name: &str,
    key: Key,
    fields: Vec<(&str, FieldSpec)>,
    options: EntityOptions,
) -> DbResult<Entity> {
    db.ensure_open()?;
    let name = name.trim().to_lowercase();
    if name.is_empty() {
        return Err(DbError::schema("entity name is empty"));
    }
    if db.registry.read().contains(&name) {
        return Err(DbError::schema(format!("entity '{name}' already registered")));
    }

    // Expand and normalize the declared fields.
    let mut order: Vec<String> = Vec::new();
    let mut map: HashMap<String, FieldDef> = HashMap::new();
    for (field_name, spec) in fields {
        let field_name = field_name.trim().to_lowercase();
        if field_name.is_empty() {
            return Err(DbError::schema(format!("empty field name on '{name}'")));
        }
        if field_name == "rowid" {
            return Err(DbError::schema(format!(
                "field name 'rowid' is reserved ('{name}')"
            )));
        }
        if map.contains_key(&field_name) {
            return Err(DbError::schema(format!(
                "duplicate field '{field_name}' on '{name}'"
            )));
        }
        let mut def = spec.into_def()?;
        def.name = field_name.clone();
        if def.is_virtual() && def.references().is_none() {
            return Err(DbError::schema(format!(
                "virtual field '{field_name}' of '{name}' must reference an entity"
            )));
        }
        #[cfg(not(feature = "json"))]
        if def.kind() == FieldKind::Json {
            return Err(DbError::json(format!(
                "json codec is not available; cannot declare field '{field_name}'"
            )));
        }
        order.push(field_name.clone());
        map.insert(field_name, def);
    }

    // Key resolution.
    let key_name = match key {
        Key::Name(k) => {
            let k = k.trim().to_lowercase();
            if k == "rowid" {
                k
            } else if map.contains_key(&k) {
                k
            } else {
                return Err(DbError::schema(format!(
                    "missing key field '{k}' on '{name}'"
                )));
            }
        }
        Key::Id(k) => {
            let k = k.trim().to_lowercase();
            if map.contains_key(&k) {
                return Err(DbError::schema(format!(
                    "key field '{k}' of '{name}' is already declared"
                )));
            }
            let mut def = id();
            def.name = k.clone();
            order.insert(0, k.clone());
            map.insert(k.clone(), def);
            k
        }
        Key::Default => match db.default_key() {
            Some(k) => {
                let k = k.to_lowercase();
                if !map.contains_key(&k) {
                    let mut def = id();
                    def.name = k.clone();
                    order.insert(0, k.clone());
                    map.insert(k.clone(), def);
                }
                k
            }
            None => "rowid".to_string(),
        },
    };

    // Validations over the full field set.
    for (field_name, def) in &map {
        if def.kind() == FieldKind::Id && *field_name != key_name {
            return Err(DbError::schema(format!(
                "ID field '{field_name}' of '{name}' is only valid as the primary key"
            )));
        }
        if def.is_virtual() && def.kind() != FieldKind::Entity {
            return Err(DbError::schema(format!(
                "virtual field '{field_name}' of '{name}' must be an entity reference"
            )));
        }
    }
    if key_name != "rowid" {
        match map.get_mut(&key_name) {
            Some(def) if def.is_virtual() => {
                return Err(DbError::schema(format!(
                    "virtual field '{key_name}' cannot be the primary key of '{name}'"
                )))
            }
            Some(def) => def.unique = true,
            None => {
                return Err(DbError::schema(format!(
                    "missing key field '{key_name}' on '{name}'"
                )))
            }
        }
    }

    // Virtual fkeys are navigation metadata, not columns.
    let field_order: Vec<String> = order
        .iter()
        .filter(|f| !map[f.as_str()].is_virtual())
        .cloned()
        .collect();
    if field_order.is_empty() {
        return Err(DbError::schema(format!(
            "entity '{name}' has no persisted fields"
        )));
    }

    closure_check(db, &name, &map)?;

    let entity = Entity::build(db, name.clone(), key_name, field_order, map);
    db.registry.write().insert(entity.clone());
    debug!(entity = %name, "registered entity");

    if options.auto_create {
        entity.create()?;
    }
    Ok(entity)
}

/// Walks required ENTITY references transitively; reaching the new entity's
/// own name proves an unsatisfiable insert order.
fn closure_check(
    db: &Arc<DatabaseInner>,
    name: &str,
    fields: &HashMap<String, FieldDef>,
) -> DbResult<()> {
    let mut stack: Vec<String> = required_targets(fields.values());
    let mut visited: HashSet<String> = HashSet::new();
    let registry = db.registry.read();

    while let Some(target) = stack.pop() {
        if target == name {
            return Err(DbError::CircularDependency {
                entity: name.to_string(),
            });
        }
        if !visited.insert(target.clone()) {
            continue;
        }
        if let Some(entity) = registry.get(&target) {
            stack.extend(required_targets(entity.fields().iter()));
        }
    }
    Ok(())
}

fn required_targets<'a>(fields: impl Iterator<Item = &'a FieldDef>) -> Vec<String> {
    fields
        .filter(|def| def.kind() == FieldKind::Entity && def.is_required() && !def.is_virtual())
        .filter_map(|def| def.references().map(str::to_string))
        .collect()
}
