//! Typed field taxonomy and per-kind value coercion.

use crate::entity::row::{SetValue, Stored};
use crate::error::{DbError, DbResult};
use sqlent_driver::Value;
use std::sync::OnceLock;

/// The closed set of field kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// UTF-8 text.
    Text,
    /// Arbitrary-precision numeric, stored REAL.
    Numeric,
    /// Integer, floored on coercion.
    Int,
    /// 64-bit float.
    Real,
    /// Raw bytes.
    Blob,
    /// Integer primary key assigned by the engine.
    Id,
    /// Foreign-key reference to another entity.
    Entity,
    /// Structured value stored as TEXT.
    Json,
}

impl FieldKind {
    /// The SQL column type this kind stores as.
    ///
    /// ENTITY is resolved against the referenced entity's key by the DDL
    /// generator and never answers here.
    #[must_use]
    pub fn sql_type(self) -> &'static str {
        match self {
            FieldKind::Text | FieldKind::Json => "TEXT",
            FieldKind::Numeric | FieldKind::Real => "REAL",
            FieldKind::Int | FieldKind::Id => "INTEGER",
            FieldKind::Blob => "BLOB",
            FieldKind::Entity => "ENTITY",
        }
    }

    /// Maps a shorthand tag to a built-in kind.
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        Some(match tag {
            "text" => FieldKind::Text,
            "numeric" => FieldKind::Numeric,
            "int" => FieldKind::Int,
            "real" => FieldKind::Real,
            "blob" => FieldKind::Blob,
            "id" => FieldKind::Id,
            "json" => FieldKind::Json,
            _ => return None,
        })
    }
}

/// A virtual foreign key resolved to its child-side field.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedLink {
    /// Child entity name.
    pub child_entity: String,
    /// The child's ENTITY field pointing back here.
    pub child_field: String,
    /// True when the navigation yields a sequence.
    pub multi: bool,
}

/// Definition of one field on an entity.
///
/// Built through the kind factories ([`text`], [`int`], [`fkey`], ...) or
/// expanded from a `"<tag><flags>"` shorthand with flags drawn from
/// `{?, !, *}` (`!` required, `?` unique, `*` virtual).
#[derive(Debug, Clone)]
pub struct FieldDef {
    /// Lowercased field name, assigned at registration.
    pub(crate) name: String,
    /// The field's kind.
    pub(crate) kind: FieldKind,
    /// Null values are rejected when set.
    pub(crate) required: bool,
    /// Lookup values must be unique in cache and database.
    pub(crate) unique: bool,
    /// Navigation-only; never persisted.
    pub(crate) is_virtual: bool,
    /// Referenced entity name, for ENTITY fields and virtual fkeys.
    pub(crate) references: Option<String>,
    /// Explicit child-side field for virtual fkeys.
    pub(crate) child_field: Option<String>,
    /// Explicit multiplicity for virtual fkeys.
    pub(crate) multi: Option<bool>,
    /// Cached virtual-fkey resolution.
    pub(crate) resolved: OnceLock<ResolvedLink>,
}

impl FieldDef {
    fn new(kind: FieldKind) -> Self {
        Self {
            name: String::new(),
            kind,
            required: false,
            unique: kind == FieldKind::Id,
            is_virtual: false,
            references: None,
            child_field: None,
            multi: None,
            resolved: OnceLock::new(),
        }
    }

    /// Marks the field required: null values are rejected.
    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Marks the field unique: enforced on set and on new, against both the
    /// in-memory cache and the database.
    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Turns a foreign-key field into a virtual navigation field.
    #[must_use]
    pub fn virtual_fkey(mut self) -> Self {
        self.is_virtual = true;
        self
    }

    /// Names the child-side field a virtual fkey navigates through.
    #[must_use]
    pub fn child_field(mut self, name: impl Into<String>) -> Self {
        self.child_field = Some(name.into().to_lowercase());
        self
    }

    /// Declares the multiplicity of a virtual fkey explicitly. Must agree
    /// with the child-side field's uniqueness when resolved.
    #[must_use]
    pub fn multi(mut self, multi: bool) -> Self {
        self.multi = Some(multi);
        self
    }

    /// The field's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The field's kind.
    #[must_use]
    pub fn kind(&self) -> FieldKind {
        self.kind
    }

    /// True when null values are rejected.
    #[must_use]
    pub fn is_required(&self) -> bool {
        self.required
    }

    /// True when lookup values must be unique.
    #[must_use]
    pub fn is_unique(&self) -> bool {
        self.unique
    }

    /// True for navigation-only fields.
    #[must_use]
    pub fn is_virtual(&self) -> bool {
        self.is_virtual
    }

    /// The referenced entity, for ENTITY fields and virtual fkeys.
    #[must_use]
    pub fn references(&self) -> Option<&str> {
        self.references.as_deref()
    }

    /// Expands a `"<tag><flags>"` shorthand into a definition.
    ///
    /// The tag is matched against the built-in kind names first and falls
    /// back to a foreign-key reference. Flags: `!` required, `?` unique,
    /// `*` virtual (only meaningful on references).
    pub fn parse_shorthand(spec: &str) -> DbResult<Self> {
        let spec = spec.trim();
        let tag_end = spec
            .char_indices()
            .find(|(_, c)| matches!(c, '?' | '!' | '*'))
            .map_or(spec.len(), |(i, _)| i);
        let (tag, flags) = spec.split_at(tag_end);
        let tag = tag.trim().to_lowercase();
        if tag.is_empty() {
            return Err(DbError::schema(format!("empty field shorthand '{spec}'")));
        }

        let mut def = match FieldKind::from_tag(&tag) {
            Some(kind) => Self::new(kind),
            None => fkey(&tag),
        };
        for flag in flags.chars() {
            match flag {
                '!' => def.required = true,
                '?' => def.unique = true,
                '*' => def.is_virtual = true,
                _ => {
                    return Err(DbError::schema(format!(
                        "invalid flag '{flag}' in field shorthand '{spec}'"
                    )))
                }
            }
        }
        if def.is_virtual && def.references.is_none() {
            return Err(DbError::schema(format!(
                "virtual flag is only valid on entity references: '{spec}'"
            )));
        }
        Ok(def)
    }

    /// Coerces a caller-supplied value into `(stored, lookup)` form.
    ///
    /// The lookup value is the primitive used for equality against the
    /// database; for ENTITY fields whose referent is not yet inserted the
    /// stored value keeps the row object and the lookup is null, which the
    /// flush engine observes.
    pub(crate) fn transform(&self, entity: &str, value: SetValue) -> DbResult<(Stored, Value)> {
        // Null policy is kind-independent.
        if matches!(value, SetValue::Value(Value::Null)) {
            if self.required {
                return Err(DbError::required(entity, &self.name));
            }
            return Ok((Stored::Value(Value::Null), Value::Null));
        }

        match self.kind {
            FieldKind::Text => {
                let text = match value {
                    SetValue::Value(Value::Text(s)) => s,
                    SetValue::Value(Value::Integer(i)) => i.to_string(),
                    SetValue::Value(Value::Real(r)) => r.to_string(),
                    SetValue::Value(Value::Blob(b)) => String::from_utf8(b).map_err(|_| {
                        DbError::value(format!(
                            "blob is not valid utf-8 for field '{}' of '{entity}'",
                            self.name
                        ))
                    })?,
                    other => return Err(self.reject(entity, &other)),
                };
                Ok((Stored::Value(Value::Text(text.clone())), Value::Text(text)))
            }
            FieldKind::Blob => {
                let bytes = match value {
                    SetValue::Value(Value::Blob(b)) => b,
                    SetValue::Value(Value::Text(s)) => s.into_bytes(),
                    SetValue::Value(Value::Integer(i)) => i.to_string().into_bytes(),
                    SetValue::Value(Value::Real(r)) => r.to_string().into_bytes(),
                    other => return Err(self.reject(entity, &other)),
                };
                Ok((Stored::Value(Value::Blob(bytes.clone())), Value::Blob(bytes)))
            }
            FieldKind::Numeric | FieldKind::Real => {
                let n = self.parse_number(entity, value)?;
                Ok((Stored::Value(Value::Real(n)), Value::Real(n)))
            }
            FieldKind::Int | FieldKind::Id => {
                let n = self.parse_number(entity, value)?.floor() as i64;
                Ok((Stored::Value(Value::Integer(n)), Value::Integer(n)))
            }
            FieldKind::Entity => match value {
                SetValue::Row(row) => {
                    let target = self.references.as_deref().unwrap_or_default();
                    if row.entity_name() != target {
                        return Err(DbError::value(format!(
                            "field '{}' of '{entity}' references '{target}', got a row of '{}'",
                            self.name,
                            row.entity_name()
                        )));
                    }
                    match row.pk_lookup() {
                        Some(pk) => Ok((Stored::Value(pk.clone()), pk)),
                        // Referent not yet inserted: hold the row itself.
                        None => Ok((Stored::Ref(row), Value::Null)),
                    }
                }
                SetValue::Value(v) => Ok((Stored::Value(v.clone()), v)),
                #[cfg(feature = "json")]
                other => Err(self.reject(entity, &other)),
            },
            FieldKind::Json => self.transform_json(entity, value),
        }
    }

    #[cfg(feature = "json")]
    fn transform_json(&self, entity: &str, value: SetValue) -> DbResult<(Stored, Value)> {
        use crate::entity::row::JsonCell;
        match value {
            SetValue::Json(v) => {
                let cell = JsonCell::from_value(v);
                Ok((Stored::Json(cell), Value::Null))
            }
            SetValue::Value(Value::Text(s)) => {
                let decoded: serde_json::Value = serde_json::from_str(&s)
                    .map_err(|e| DbError::json(format!("invalid json content: {e}")))?;
                let lookup = Value::Text(s.clone());
                Ok((Stored::Json(JsonCell::from_encoded(decoded, s)), lookup))
            }
            other => Err(self.reject(entity, &other)),
        }
    }

    #[cfg(not(feature = "json"))]
    fn transform_json(&self, _entity: &str, _value: SetValue) -> DbResult<(Stored, Value)> {
        Err(DbError::json("json codec is not available"))
    }

    fn parse_number(&self, entity: &str, value: SetValue) -> DbResult<f64> {
        match value {
            SetValue::Value(Value::Integer(i)) => Ok(i as f64),
            SetValue::Value(Value::Real(r)) => Ok(r),
            SetValue::Value(Value::Text(s)) => s.trim().parse::<f64>().map_err(|_| {
                DbError::value(format!(
                    "cannot coerce '{s}' to {:?} for field '{}' of '{entity}'",
                    self.kind, self.name
                ))
            }),
            other => Err(self.reject(entity, &other)),
        }
    }

    fn reject(&self, entity: &str, value: &SetValue) -> DbError {
        DbError::value(format!(
            "cannot store {} in {:?} field '{}' of '{entity}'",
            value.describe(),
            self.kind,
            self.name
        ))
    }
}

/// A TEXT field.
#[must_use]
pub fn text() -> FieldDef {
    FieldDef::new(FieldKind::Text)
}

/// A NUMERIC field (stored REAL).
#[must_use]
pub fn numeric() -> FieldDef {
    FieldDef::new(FieldKind::Numeric)
}

/// An INT field.
#[must_use]
pub fn int() -> FieldDef {
    FieldDef::new(FieldKind::Int)
}

/// A REAL field.
#[must_use]
pub fn real() -> FieldDef {
    FieldDef::new(FieldKind::Real)
}

/// A BLOB field.
#[must_use]
pub fn blob() -> FieldDef {
    FieldDef::new(FieldKind::Blob)
}

/// An ID field: an engine-assigned integer primary key. Always unique.
#[must_use]
pub fn id() -> FieldDef {
    FieldDef::new(FieldKind::Id)
}

/// A foreign-key field referencing `target`.
#[must_use]
pub fn fkey(target: &str) -> FieldDef {
    let mut def = FieldDef::new(FieldKind::Entity);
    def.references = Some(target.to_lowercase());
    def
}

/// A JSON field. Stored as TEXT, presented as a structured value.
#[cfg(feature = "json")]
#[must_use]
pub fn json() -> FieldDef {
    FieldDef::new(FieldKind::Json)
}

/// A field declaration: either a built definition or a string shorthand.
#[derive(Debug, Clone)]
pub enum FieldSpec {
    /// A fully built definition.
    Def(FieldDef),
    /// A `"<tag><flags>"` shorthand, expanded at registration.
    Shorthand(String),
}

impl FieldSpec {
    pub(crate) fn into_def(self) -> DbResult<FieldDef> {
        match self {
            FieldSpec::Def(def) => Ok(def),
            FieldSpec::Shorthand(s) => FieldDef::parse_shorthand(&s),
        }
    }
}

impl From<FieldDef> for FieldSpec {
    fn from(def: FieldDef) -> Self {
        FieldSpec::Def(def)
    }
}

impl From<&str> for FieldSpec {
    fn from(s: &str) -> Self {
        FieldSpec::Shorthand(s.to_string())
    }
}

impl From<String> for FieldSpec {
    fn from(s: String) -> Self {
        FieldSpec::Shorthand(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(mut def: FieldDef, name: &str) -> FieldDef {
        def.name = name.to_string();
        def
    }

    #[test]
    fn shorthand_builtin_kinds() {
        let def = FieldDef::parse_shorthand("text!").unwrap();
        assert_eq!(def.kind(), FieldKind::Text);
        assert!(def.is_required());
        assert!(!def.is_unique());

        let def = FieldDef::parse_shorthand("int?").unwrap();
        assert_eq!(def.kind(), FieldKind::Int);
        assert!(def.is_unique());
    }

    #[test]
    fn shorthand_fkey() {
        let def = FieldDef::parse_shorthand("parent!?").unwrap();
        assert_eq!(def.kind(), FieldKind::Entity);
        assert_eq!(def.references(), Some("parent"));
        assert!(def.is_required());
        assert!(def.is_unique());
    }

    #[test]
    fn shorthand_virtual() {
        let def = FieldDef::parse_shorthand("child*").unwrap();
        assert!(def.is_virtual());
        assert_eq!(def.references(), Some("child"));
    }

    #[test]
    fn shorthand_virtual_on_builtin_rejected() {
        assert!(FieldDef::parse_shorthand("text*").is_err());
    }

    #[test]
    fn shorthand_empty_rejected() {
        assert!(FieldDef::parse_shorthand("!").is_err());
        assert!(FieldDef::parse_shorthand("  ").is_err());
    }

    #[test]
    fn text_coercion() {
        let def = named(text(), "t");
        let (stored, lookup) = def
            .transform("e", SetValue::Value(Value::Integer(42)))
            .unwrap();
        assert_eq!(lookup, Value::Text("42".into()));
        assert!(matches!(stored, Stored::Value(Value::Text(_))));
    }

    #[test]
    fn numeric_coercion() {
        let def = named(numeric(), "n");
        let (_, lookup) = def
            .transform("e", SetValue::Value(Value::Text("7.1".into())))
            .unwrap();
        assert_eq!(lookup, Value::Real(7.1));

        assert!(def
            .transform("e", SetValue::Value(Value::Text("blah".into())))
            .is_err());
    }

    #[test]
    fn int_floors() {
        let def = named(int(), "i");
        let (_, lookup) = def
            .transform("e", SetValue::Value(Value::Text("5.2".into())))
            .unwrap();
        assert_eq!(lookup, Value::Integer(5));
    }

    #[test]
    fn null_respects_required() {
        let optional = named(text(), "t");
        let (_, lookup) = optional
            .transform("e", SetValue::Value(Value::Null))
            .unwrap();
        assert_eq!(lookup, Value::Null);

        let req = named(text().required(), "t");
        assert!(matches!(
            req.transform("e", SetValue::Value(Value::Null)),
            Err(DbError::RequiredField { .. })
        ));
    }

    #[test]
    fn text_and_blob_convert_both_ways() {
        let text_def = named(text(), "t");
        let (_, lookup) = text_def
            .transform("e", SetValue::Value(Value::Blob(b"hi".to_vec())))
            .unwrap();
        assert_eq!(lookup, Value::Text("hi".into()));
        assert!(text_def
            .transform("e", SetValue::Value(Value::Blob(vec![0xff, 0xfe])))
            .is_err());

        let blob_def = named(blob(), "b");
        let (_, lookup) = blob_def
            .transform("e", SetValue::Value(Value::Text("hi".into())))
            .unwrap();
        assert_eq!(lookup, Value::Blob(b"hi".to_vec()));
    }

    #[test]
    fn blob_rejects_composites() {
        let def = named(blob(), "b");
        #[cfg(feature = "json")]
        assert!(def
            .transform("e", SetValue::Json(serde_json::json!({"a": 1})))
            .is_err());
        let (_, lookup) = def
            .transform("e", SetValue::Value(Value::Text("xy".into())))
            .unwrap();
        assert_eq!(lookup, Value::Blob(b"xy".to_vec()));
    }

    #[cfg(feature = "json")]
    #[test]
    fn json_from_text_validates() {
        let def = named(json(), "j");
        assert!(def
            .transform("e", SetValue::Value(Value::Text("{not json".into())))
            .is_err());
        let (stored, lookup) = def
            .transform("e", SetValue::Value(Value::Text("{\"a\":1}".into())))
            .unwrap();
        assert_eq!(lookup, Value::Text("{\"a\":1}".into()));
        assert!(matches!(stored, Stored::Json(_)));
    }

    #[test]
    fn id_is_unique() {
        assert!(id().is_unique());
    }
}
