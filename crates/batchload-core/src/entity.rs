use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::record::{KeyError, PrimaryKey, RawRow, Record, RowError};
use crate::value::{CoercionError, FieldKind, Value};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    #[serde(flatten)]
    pub kind: FieldKind,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default)]
    pub autoincrement: bool,
}

fn default_nullable() -> bool {
    true
}

impl FieldDef {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            nullable: true,
            autoincrement: false,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn autoincrement(mut self) -> Self {
        self.autoincrement = true;
        self
    }

    fn coerce(&self, raw: Option<&JsonValue>) -> Result<Value, CoercionError> {
        let value = match raw {
            Some(raw) => self.kind.coerce(raw)?,
            None => Value::Null,
        };
        if value.is_null() && !self.nullable && !self.autoincrement {
            return Err(CoercionError::NullNotAllowed);
        }
        Ok(value)
    }
}

#[derive(Debug, Error)]
pub enum EntityError {
    #[error("`{0}` is not a valid identifier")]
    InvalidIdentifier(String),
    #[error("entity `{entity}` declares field `{field}` twice")]
    DuplicateField { entity: String, field: String },
    #[error("entity `{0}` has no primary key")]
    EmptyPrimaryKey(String),
    #[error("entity `{entity}`: primary key field `{field}` is not a declared field")]
    UnknownKeyField { entity: String, field: String },
    #[error("entity `{entity}`: field `{field}` of type {kind} cannot be part of a primary key")]
    UnsupportedKeyType {
        entity: String,
        field: String,
        kind: &'static str,
    },
    #[error("entity `{entity}`: only integer fields can autoincrement (`{field}`)")]
    InvalidAutoincrement { entity: String, field: String },
    #[error("entity `{entity}`: autoincrement field `{field}` must be the whole primary key")]
    AutoincrementInCompositeKey { entity: String, field: String },
    #[error("entity `{0}` is defined twice with different schemas")]
    DuplicateEntity(String),
    #[error("no entity mapped to table `{0}`")]
    UnknownEntity(String),
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing entity registry: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, Deserialize)]
struct EntityDefSpec {
    name: String,
    fields: Vec<FieldDef>,
    primary_key: Vec<String>,
}

impl TryFrom<EntityDefSpec> for EntityDef {
    type Error = EntityError;

    fn try_from(spec: EntityDefSpec) -> Result<Self, Self::Error> {
        EntityDef::new(spec.name, spec.fields, spec.primary_key)
    }
}

/// Schema of one table: ordered fields plus the primary-key subset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "EntityDefSpec")]
pub struct EntityDef {
    name: String,
    fields: Vec<FieldDef>,
    primary_key: Vec<String>,
}

pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl EntityDef {
    pub fn new(
        name: impl Into<String>,
        fields: Vec<FieldDef>,
        primary_key: Vec<String>,
    ) -> Result<Self, EntityError> {
        let name = name.into();
        if !is_identifier(&name) {
            return Err(EntityError::InvalidIdentifier(name));
        }
        let mut seen = HashSet::new();
        for field in &fields {
            if !is_identifier(&field.name) {
                return Err(EntityError::InvalidIdentifier(field.name.clone()));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(EntityError::DuplicateField {
                    entity: name,
                    field: field.name.clone(),
                });
            }
            if field.autoincrement && field.kind != FieldKind::Integer {
                return Err(EntityError::InvalidAutoincrement {
                    entity: name,
                    field: field.name.clone(),
                });
            }
        }
        if primary_key.is_empty() {
            return Err(EntityError::EmptyPrimaryKey(name));
        }
        for key in &primary_key {
            let Some(field) = fields.iter().find(|f| &f.name == key) else {
                return Err(EntityError::UnknownKeyField {
                    entity: name,
                    field: key.clone(),
                });
            };
            if !field.kind.can_be_key() {
                return Err(EntityError::UnsupportedKeyType {
                    entity: name,
                    field: key.clone(),
                    kind: field.kind.label(),
                });
            }
            if field.autoincrement && primary_key.len() > 1 {
                return Err(EntityError::AutoincrementInCompositeKey {
                    entity: name,
                    field: key.clone(),
                });
            }
        }
        Ok(Self {
            name,
            fields,
            primary_key,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn primary_key_names(&self) -> &[String] {
        &self.primary_key
    }

    pub fn primary_key_fields(&self) -> impl Iterator<Item = &FieldDef> + '_ {
        self.primary_key
            .iter()
            .filter_map(move |name| self.field(name))
    }

    /// True when the key is a single store-assigned integer column, in which
    /// case key-based duplicate detection does not apply. Autoincrement
    /// fields are never part of a composite key.
    pub fn is_auto_pkey(&self) -> bool {
        let mut keys = self.primary_key_fields();
        matches!(
            (keys.next(), keys.next()),
            (Some(field), None) if field.autoincrement && field.kind == FieldKind::Integer
        )
    }

    pub fn primary_key_of(&self, row: &RawRow) -> Result<PrimaryKey, KeyError> {
        let mut values = Vec::with_capacity(self.primary_key.len());
        for field in self.primary_key_fields() {
            let raw = match row.get(&field.name) {
                Some(raw) if !raw.is_null() => raw,
                _ => {
                    return Err(KeyError::Missing {
                        field: field.name.clone(),
                    })
                }
            };
            let value = field.kind.coerce_key(raw).map_err(|source| KeyError::Coercion {
                field: field.name.clone(),
                source,
            })?;
            values.push(value);
        }
        Ok(PrimaryKey::new(values))
    }

    pub fn key_of_record(&self, record: &Record) -> Option<PrimaryKey> {
        self.primary_key
            .iter()
            .map(|name| record.get(name).and_then(Value::as_key))
            .collect::<Option<Vec<_>>>()
            .map(PrimaryKey::new)
    }

    /// Validate and coerce a candidate row. Autoincrement columns are always
    /// assigned by the store, so any supplied value is discarded.
    pub fn record_from_row(&self, row: &RawRow) -> Result<Record, RowError> {
        if let Some(unknown) = row.keys().find(|k| self.field(k).is_none()) {
            return Err(RowError::UnknownField(unknown.clone()));
        }
        let mut record = Record::new();
        for field in &self.fields {
            let value = if field.autoincrement {
                Value::Null
            } else {
                field.coerce(row.get(&field.name)).map_err(|source| RowError::Field {
                    field: field.name.clone(),
                    source,
                })?
            };
            record.set(field.name.clone(), value);
        }
        Ok(record)
    }

    /// Parse a comma separated key such as `42` or `gb,2019-01-01`.
    pub fn parse_key(&self, text: &str) -> Result<PrimaryKey, KeyError> {
        let parts = text.split(',').map(str::trim).collect::<Vec<_>>();
        if parts.len() != self.primary_key.len() {
            return Err(KeyError::Arity {
                expected: self.primary_key.len(),
                found: parts.len(),
            });
        }
        let row = self
            .primary_key
            .iter()
            .zip(parts)
            .map(|(name, part)| (name.clone(), JsonValue::String(part.to_string())))
            .collect::<RawRow>();
        self.primary_key_of(&row)
    }
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    entities: Vec<EntityDef>,
}

/// Entity definitions keyed by table name, loaded once at start-up.
#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
    entities: BTreeMap<String, EntityDef>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, EntityError> {
        let file: RegistryFile = serde_yaml::from_str(text)?;
        let mut registry = Self::new();
        for entity in file.entities {
            registry.insert(entity)?;
        }
        Ok(registry)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, EntityError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| EntityError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn insert(&mut self, entity: EntityDef) -> Result<(), EntityError> {
        match self.entities.get(entity.name()) {
            Some(existing) if existing == &entity => Ok(()),
            Some(_) => Err(EntityError::DuplicateEntity(entity.name().to_string())),
            None => {
                self.entities.insert(entity.name().to_string(), entity);
                Ok(())
            }
        }
    }

    /// Combine registries kept in separate files into one.
    pub fn merge(mut self, other: EntityRegistry) -> Result<Self, EntityError> {
        for entity in other.entities.into_values() {
            self.insert(entity)?;
        }
        Ok(self)
    }

    pub fn get(&self, table: &str) -> Result<&EntityDef, EntityError> {
        self.entities
            .get(table)
            .ok_or_else(|| EntityError::UnknownEntity(table.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntityDef> {
        self.entities.values()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::KeyValue;
    use serde_json::json;
    use std::io::Write;

    fn row(value: JsonValue) -> RawRow {
        value.as_object().cloned().unwrap()
    }

    fn orgs() -> EntityDef {
        EntityDef::new(
            "organizations",
            vec![
                FieldDef::new("id", FieldKind::Text { max_length: Some(8) }),
                FieldDef::new("name", FieldKind::Text { max_length: None }).not_null(),
                FieldDef::new("founded", FieldKind::Timestamp),
            ],
            vec!["id".into()],
        )
        .unwrap()
    }

    #[test]
    fn key_extraction_reports_missing_fields() {
        let entity = orgs();
        assert_eq!(
            entity.primary_key_of(&row(json!({"name": "x"}))),
            Err(KeyError::Missing { field: "id".into() })
        );
        assert_eq!(
            entity.primary_key_of(&row(json!({"id": null}))),
            Err(KeyError::Missing { field: "id".into() })
        );
    }

    #[test]
    fn key_extraction_truncates_like_the_column() {
        let entity = orgs();
        let a = entity.primary_key_of(&row(json!({"id": "abcdefgh-1"}))).unwrap();
        let b = entity.primary_key_of(&row(json!({"id": "abcdefgh-2"}))).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, PrimaryKey::from(KeyValue::Text("abcdefgh".into())));
    }

    #[test]
    fn record_construction_validates_fields() {
        let entity = orgs();
        let record = entity
            .record_from_row(&row(json!({"id": "a", "name": "Acme"})))
            .unwrap();
        assert_eq!(record.get("founded"), Some(&Value::Null));
        assert_eq!(record.len(), 3);

        assert_eq!(
            entity.record_from_row(&row(json!({"id": "a", "name": "Acme", "extra": 1}))),
            Err(RowError::UnknownField("extra".into()))
        );
        assert!(matches!(
            entity.record_from_row(&row(json!({"id": "a"}))),
            Err(RowError::Field { field, source: CoercionError::NullNotAllowed }) if field == "name"
        ));
        assert!(matches!(
            entity.record_from_row(&row(json!({"id": "a", "name": "n", "founded": "soon"}))),
            Err(RowError::Field { field, .. }) if field == "founded"
        ));
    }

    #[test]
    fn definitions_are_validated() {
        let id = FieldDef::new("id", FieldKind::Integer);
        assert!(matches!(
            EntityDef::new("t", vec![id.clone()], vec![]),
            Err(EntityError::EmptyPrimaryKey(_))
        ));
        assert!(matches!(
            EntityDef::new("t", vec![id.clone()], vec!["nope".into()]),
            Err(EntityError::UnknownKeyField { .. })
        ));
        assert!(matches!(
            EntityDef::new("t", vec![FieldDef::new("v", FieldKind::Json)], vec!["v".into()]),
            Err(EntityError::UnsupportedKeyType { .. })
        ));
        assert!(matches!(
            EntityDef::new("bad name", vec![id.clone()], vec!["id".into()]),
            Err(EntityError::InvalidIdentifier(_))
        ));
        assert!(matches!(
            EntityDef::new("t", vec![id.clone(), id.clone()], vec!["id".into()]),
            Err(EntityError::DuplicateField { .. })
        ));
        assert!(matches!(
            EntityDef::new(
                "t",
                vec![FieldDef::new("id", FieldKind::Text { max_length: None }).autoincrement()],
                vec!["id".into()]
            ),
            Err(EntityError::InvalidAutoincrement { .. })
        ));
    }

    #[test]
    fn auto_pkey_requires_single_autoincrement_integer() {
        let auto = EntityDef::new(
            "events",
            vec![
                FieldDef::new("id", FieldKind::Integer).autoincrement(),
                FieldDef::new("body", FieldKind::Json),
            ],
            vec!["id".into()],
        )
        .unwrap();
        assert!(auto.is_auto_pkey());
        assert!(!orgs().is_auto_pkey());

        let record = auto
            .record_from_row(&row(json!({"id": 99, "body": {"a": 1}})))
            .unwrap();
        assert_eq!(record.get("id"), Some(&Value::Null));
    }

    #[test]
    fn autoincrement_cannot_share_a_composite_key() {
        let err = EntityDef::new(
            "tagged",
            vec![
                FieldDef::new("id", FieldKind::Integer).autoincrement(),
                FieldDef::new("tag", FieldKind::Text { max_length: None }),
            ],
            vec!["id".into(), "tag".into()],
        )
        .unwrap_err();
        assert!(matches!(
            err,
            EntityError::AutoincrementInCompositeKey { ref field, .. } if field == "id"
        ));

        let text = "entities:\n  - name: tagged\n    primary_key: [tag, id]\n    fields:\n      - { name: id, type: integer, autoincrement: true }\n      - { name: tag, type: text }\n";
        assert!(EntityRegistry::from_yaml_str(text).is_err());
    }

    #[test]
    fn composite_keys_parse_from_text() {
        let entity = EntityDef::new(
            "indicators",
            vec![
                FieldDef::new("country", FieldKind::Text { max_length: Some(3) }),
                FieldDef::new("year", FieldKind::Integer),
            ],
            vec!["country".into(), "year".into()],
        )
        .unwrap();
        let key = entity.parse_key("gbr, 2019").unwrap();
        assert_eq!(
            key.values(),
            &[KeyValue::Text("gbr".into()), KeyValue::Integer(2019)]
        );
        assert_eq!(
            entity.parse_key("gbr"),
            Err(KeyError::Arity { expected: 2, found: 1 })
        );
    }

    #[test]
    fn registry_loads_merges_and_looks_up() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
entities:
  - name: countries
    primary_key: [alpha2]
    fields:
      - {{ name: alpha2, type: text, max_length: 2, nullable: false }}
      - {{ name: continent, type: text }}
"#
        )
        .unwrap();
        let registry = EntityRegistry::load(file.path()).unwrap();
        let countries = registry.get("countries").unwrap();
        assert_eq!(
            countries.field("alpha2").unwrap().kind,
            FieldKind::Text { max_length: Some(2) }
        );
        assert!(!countries.field("alpha2").unwrap().nullable);
        assert!(matches!(registry.get("missing"), Err(EntityError::UnknownEntity(_))));

        let mut other = EntityRegistry::new();
        other.insert(orgs()).unwrap();
        let merged = registry.clone().merge(other).unwrap();
        assert_eq!(merged.len(), 2);

        let mut clash = EntityRegistry::new();
        clash
            .insert(
                EntityDef::new(
                    "countries",
                    vec![FieldDef::new("alpha2", FieldKind::Integer)],
                    vec!["alpha2".into()],
                )
                .unwrap(),
            )
            .unwrap();
        assert!(matches!(
            registry.merge(clash),
            Err(EntityError::DuplicateEntity(_))
        ));
    }

    #[test]
    fn bundled_registry_is_valid() {
        let registry = EntityRegistry::from_yaml_str(include_str!("../../../entities.yaml")).unwrap();
        assert!(registry.get("fetch_events").unwrap().is_auto_pkey());
        assert_eq!(
            registry.get("indicators").unwrap().primary_key_names(),
            &["country_code".to_string(), "year".to_string()]
        );
    }

    #[test]
    fn invalid_registry_entries_fail_to_load() {
        let text = "entities:\n  - name: t\n    primary_key: [missing]\n    fields:\n      - { name: id, type: integer }\n";
        assert!(EntityRegistry::from_yaml_str(text).is_err());
    }
}
