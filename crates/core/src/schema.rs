//! Object schema description and structural diffing
//!
//! A [`Schema`] is the set of object types a realm file is expected to
//! contain. Each [`ObjectSchema`] maps to one table and each [`Property`]
//! to one column. The storage engine assigns column indices; those are
//! carried in [`Property::column`] once a schema has been applied to a file.
//!
//! ## Structural comparison
//!
//! Two schemas are structurally equal when [`Schema::diff`] yields no
//! changes. Column indices, property order and default values are not part
//! of the structure.
//!
//! Object types present in the persisted schema but absent from the target
//! are left alone: a target schema may describe a subset of the file.

use crate::value::{PropertyType, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A single property (column) of an object type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    /// Property name, unique within its object type
    pub name: String,
    /// Declared column type
    #[serde(rename = "type")]
    pub kind: PropertyType,
    /// Whether `Null` is a legal value
    #[serde(default)]
    pub nullable: bool,
    /// Whether the column carries a search index
    #[serde(default)]
    pub indexed: bool,
    /// Value used for rows that predate the property and for objects
    /// created without it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Engine-assigned column index (None until applied to a file)
    #[serde(skip)]
    pub column: Option<usize>,
}

impl Property {
    /// Create a non-nullable, unindexed property
    pub fn new(name: impl Into<String>, kind: PropertyType) -> Self {
        Self {
            name: name.into(),
            kind,
            nullable: false,
            indexed: false,
            default: None,
            column: None,
        }
    }

    /// Mark the property nullable
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Mark the property indexed
    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    /// Set the default value
    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Value to backfill into existing rows when this property is added
    pub fn fill_value(&self) -> Value {
        match &self.default {
            Some(value) => value.clone(),
            None if self.nullable => Value::Null,
            None => self.kind.zero_value(),
        }
    }
}

/// Description of one object type (one table)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectSchema {
    /// Object type name, also the table name
    pub name: String,
    /// Properties in declaration order
    #[serde(default)]
    pub properties: Vec<Property>,
    /// Name of the primary key property, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<String>,
}

impl ObjectSchema {
    /// Create an object schema from its properties
    pub fn new(name: impl Into<String>, properties: Vec<Property>) -> Self {
        Self {
            name: name.into(),
            properties,
            primary_key: None,
        }
    }

    /// Set the primary key property
    pub fn with_primary_key(mut self, property: impl Into<String>) -> Self {
        self.primary_key = Some(property.into());
        self
    }

    /// Look up a property by name
    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Look up a property by name, mutably
    pub fn property_mut(&mut self, name: &str) -> Option<&mut Property> {
        self.properties.iter_mut().find(|p| p.name == name)
    }

    /// The primary key property, if declared and present
    pub fn primary_key_property(&self) -> Option<&Property> {
        self.primary_key.as_deref().and_then(|pk| self.property(pk))
    }
}

/// A single structural difference between two schemas
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaChange {
    /// The target declares an object type the current schema lacks
    AddObjectType {
        /// Object type name
        object_type: String,
    },
    /// The target declares a new property
    AddProperty {
        /// Object type name
        object_type: String,
        /// Property name
        property: String,
    },
    /// The target no longer declares a property
    RemoveProperty {
        /// Object type name
        object_type: String,
        /// Property name
        property: String,
    },
    /// A property changed column type
    ChangePropertyType {
        /// Object type name
        object_type: String,
        /// Property name
        property: String,
        /// Current type
        from: PropertyType,
        /// Target type
        to: PropertyType,
    },
    /// A property changed nullability
    ChangeNullability {
        /// Object type name
        object_type: String,
        /// Property name
        property: String,
        /// Target nullability
        nullable: bool,
    },
    /// A property gained an index
    AddIndex {
        /// Object type name
        object_type: String,
        /// Property name
        property: String,
    },
    /// A property lost its index
    RemoveIndex {
        /// Object type name
        object_type: String,
        /// Property name
        property: String,
    },
    /// The primary key designation changed
    ChangePrimaryKey {
        /// Object type name
        object_type: String,
        /// Current primary key
        from: Option<String>,
        /// Target primary key
        to: Option<String>,
    },
}

impl SchemaChange {
    /// Whether this change can be applied without touching existing data
    ///
    /// Additive changes never need a migration callback.
    pub fn is_additive(&self) -> bool {
        matches!(
            self,
            SchemaChange::AddObjectType { .. }
                | SchemaChange::AddProperty { .. }
                | SchemaChange::AddIndex { .. }
                | SchemaChange::RemoveIndex { .. }
        )
    }

    /// Object type the change applies to
    pub fn object_type(&self) -> &str {
        match self {
            SchemaChange::AddObjectType { object_type }
            | SchemaChange::AddProperty { object_type, .. }
            | SchemaChange::RemoveProperty { object_type, .. }
            | SchemaChange::ChangePropertyType { object_type, .. }
            | SchemaChange::ChangeNullability { object_type, .. }
            | SchemaChange::AddIndex { object_type, .. }
            | SchemaChange::RemoveIndex { object_type, .. }
            | SchemaChange::ChangePrimaryKey { object_type, .. } => object_type,
        }
    }
}

impl fmt::Display for SchemaChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaChange::AddObjectType { object_type } => {
                write!(f, "object type '{}' added", object_type)
            }
            SchemaChange::AddProperty {
                object_type,
                property,
            } => write!(f, "property '{}.{}' added", object_type, property),
            SchemaChange::RemoveProperty {
                object_type,
                property,
            } => write!(f, "property '{}.{}' removed", object_type, property),
            SchemaChange::ChangePropertyType {
                object_type,
                property,
                from,
                to,
            } => write!(
                f,
                "property '{}.{}' changed type from {} to {}",
                object_type, property, from, to
            ),
            SchemaChange::ChangeNullability {
                object_type,
                property,
                nullable,
            } => write!(
                f,
                "property '{}.{}' became {}",
                object_type,
                property,
                if *nullable { "nullable" } else { "required" }
            ),
            SchemaChange::AddIndex {
                object_type,
                property,
            } => write!(f, "index added on '{}.{}'", object_type, property),
            SchemaChange::RemoveIndex {
                object_type,
                property,
            } => write!(f, "index removed from '{}.{}'", object_type, property),
            SchemaChange::ChangePrimaryKey {
                object_type,
                from,
                to,
            } => write!(
                f,
                "primary key of '{}' changed from {:?} to {:?}",
                object_type, from, to
            ),
        }
    }
}

/// Whether every change in the list is additive
pub fn is_additive(changes: &[SchemaChange]) -> bool {
    changes.iter().all(SchemaChange::is_additive)
}

/// Set of object types, keyed by name
///
/// Serialized as a list of object schemas so it reads naturally as
/// `[[schema]]` tables in TOML.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<ObjectSchema>", into = "Vec<ObjectSchema>")]
pub struct Schema {
    object_types: BTreeMap<String, ObjectSchema>,
}

impl From<Vec<ObjectSchema>> for Schema {
    fn from(list: Vec<ObjectSchema>) -> Self {
        list.into_iter().collect()
    }
}

impl From<Schema> for Vec<ObjectSchema> {
    fn from(schema: Schema) -> Self {
        schema.object_types.into_values().collect()
    }
}

impl FromIterator<ObjectSchema> for Schema {
    fn from_iter<I: IntoIterator<Item = ObjectSchema>>(iter: I) -> Self {
        let mut schema = Schema::new();
        for object_schema in iter {
            schema.insert(object_schema);
        }
        schema
    }
}

impl Schema {
    /// Create an empty schema
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an object type
    pub fn insert(&mut self, object_schema: ObjectSchema) {
        self.object_types
            .insert(object_schema.name.clone(), object_schema);
    }

    /// Look up an object type
    pub fn get(&self, name: &str) -> Option<&ObjectSchema> {
        self.object_types.get(name)
    }

    /// Look up an object type, mutably
    pub fn get_mut(&mut self, name: &str) -> Option<&mut ObjectSchema> {
        self.object_types.get_mut(name)
    }

    /// Iterate object types in name order
    pub fn iter(&self) -> impl Iterator<Item = &ObjectSchema> {
        self.object_types.values()
    }

    /// Number of object types
    pub fn len(&self) -> usize {
        self.object_types.len()
    }

    /// Whether the schema declares no object types
    pub fn is_empty(&self) -> bool {
        self.object_types.is_empty()
    }

    /// Structural differences needed to turn `self` into `target`
    pub fn diff(&self, target: &Schema) -> Vec<SchemaChange> {
        let mut changes = Vec::new();

        for wanted in target.iter() {
            let object_type = &wanted.name;
            let Some(current) = self.get(object_type) else {
                changes.push(SchemaChange::AddObjectType {
                    object_type: object_type.clone(),
                });
                continue;
            };

            for existing in &current.properties {
                if wanted.property(&existing.name).is_none() {
                    changes.push(SchemaChange::RemoveProperty {
                        object_type: object_type.clone(),
                        property: existing.name.clone(),
                    });
                }
            }

            for property in &wanted.properties {
                let Some(existing) = current.property(&property.name) else {
                    changes.push(SchemaChange::AddProperty {
                        object_type: object_type.clone(),
                        property: property.name.clone(),
                    });
                    continue;
                };

                if existing.kind != property.kind {
                    changes.push(SchemaChange::ChangePropertyType {
                        object_type: object_type.clone(),
                        property: property.name.clone(),
                        from: existing.kind,
                        to: property.kind,
                    });
                    continue;
                }
                if existing.nullable != property.nullable {
                    changes.push(SchemaChange::ChangeNullability {
                        object_type: object_type.clone(),
                        property: property.name.clone(),
                        nullable: property.nullable,
                    });
                }
                match (existing.indexed, property.indexed) {
                    (false, true) => changes.push(SchemaChange::AddIndex {
                        object_type: object_type.clone(),
                        property: property.name.clone(),
                    }),
                    (true, false) => changes.push(SchemaChange::RemoveIndex {
                        object_type: object_type.clone(),
                        property: property.name.clone(),
                    }),
                    _ => {}
                }
            }

            if current.primary_key != wanted.primary_key {
                changes.push(SchemaChange::ChangePrimaryKey {
                    object_type: object_type.clone(),
                    from: current.primary_key.clone(),
                    to: wanted.primary_key.clone(),
                });
            }
        }

        changes
    }

    /// Whether `self` and `other` describe the same structure
    pub fn is_structurally_equal(&self, other: &Schema) -> bool {
        self.diff(other).is_empty() && other.diff(self).is_empty()
    }

    /// Copy column indices from `persisted` onto matching properties
    ///
    /// Properties without a persisted counterpart keep `column = None`.
    pub fn adopt_columns(&mut self, persisted: &Schema) {
        for object_schema in self.object_types.values_mut() {
            let source = persisted.get(&object_schema.name);
            for property in &mut object_schema.properties {
                property.column = source
                    .and_then(|s| s.property(&property.name))
                    .and_then(|p| p.column);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person() -> ObjectSchema {
        ObjectSchema::new(
            "Person",
            vec![
                Property::new("name", PropertyType::String),
                Property::new("age", PropertyType::Int),
            ],
        )
    }

    #[test]
    fn test_identical_schemas_have_no_diff() {
        let a: Schema = vec![person()].into();
        let b: Schema = vec![person()].into();
        assert!(a.diff(&b).is_empty());
        assert!(a.is_structurally_equal(&b));
    }

    #[test]
    fn test_column_and_default_are_not_structural() {
        let a: Schema = vec![person()].into();
        let mut other = person();
        other.properties[0].column = Some(7);
        other.properties[1].default = Some(Value::Int(18));
        let b: Schema = vec![other].into();
        assert!(a.is_structurally_equal(&b));
    }

    #[test]
    fn test_new_object_type_is_additive() {
        let current = Schema::new();
        let target: Schema = vec![person()].into();
        let changes = current.diff(&target);
        assert_eq!(
            changes,
            vec![SchemaChange::AddObjectType {
                object_type: "Person".into()
            }]
        );
        assert!(is_additive(&changes));
    }

    #[test]
    fn test_added_property_is_additive() {
        let current: Schema = vec![person()].into();
        let mut extended = person();
        extended
            .properties
            .push(Property::new("email", PropertyType::String).nullable());
        let target: Schema = vec![extended].into();

        let changes = current.diff(&target);
        assert_eq!(changes.len(), 1);
        assert!(matches!(changes[0], SchemaChange::AddProperty { .. }));
        assert!(is_additive(&changes));
    }

    #[test]
    fn test_removed_property_is_destructive() {
        let current: Schema = vec![person()].into();
        let mut reduced = person();
        reduced.properties.pop();
        let target: Schema = vec![reduced].into();

        let changes = current.diff(&target);
        assert!(matches!(
            changes.as_slice(),
            [SchemaChange::RemoveProperty { property, .. }] if property == "age"
        ));
        assert!(!is_additive(&changes));
    }

    #[test]
    fn test_type_change_is_destructive() {
        let current: Schema = vec![person()].into();
        let mut changed = person();
        changed.properties[1].kind = PropertyType::String;
        let target: Schema = vec![changed].into();

        let changes = current.diff(&target);
        assert!(matches!(
            changes.as_slice(),
            [SchemaChange::ChangePropertyType {
                from: PropertyType::Int,
                to: PropertyType::String,
                ..
            }]
        ));
        assert!(!is_additive(&changes));
    }

    #[test]
    fn test_index_changes_are_additive() {
        let current: Schema = vec![person()].into();
        let mut indexed = person();
        indexed.properties[0].indexed = true;
        let target: Schema = vec![indexed].into();

        let changes = current.diff(&target);
        assert!(matches!(changes.as_slice(), [SchemaChange::AddIndex { .. }]));
        assert!(is_additive(&changes));
        assert!(is_additive(&target.diff(&current)));
    }

    #[test]
    fn test_primary_key_change_is_destructive() {
        let current: Schema = vec![person()].into();
        let target: Schema = vec![person().with_primary_key("name")].into();
        let changes = current.diff(&target);
        assert!(matches!(
            changes.as_slice(),
            [SchemaChange::ChangePrimaryKey { to: Some(pk), .. }] if pk == "name"
        ));
        assert!(!is_additive(&changes));
    }

    #[test]
    fn test_object_types_missing_from_target_are_ignored() {
        let dog = ObjectSchema::new("Dog", vec![Property::new("name", PropertyType::String)]);
        let current: Schema = vec![person(), dog].into();
        let target: Schema = vec![person()].into();
        assert!(current.diff(&target).is_empty());
        // but the reverse direction sees the missing type
        assert!(!current.is_structurally_equal(&target));
    }

    #[test]
    fn test_adopt_columns() {
        let mut persisted: Schema = vec![person()].into();
        for (i, p) in persisted
            .get_mut("Person")
            .unwrap()
            .properties
            .iter_mut()
            .enumerate()
        {
            p.column = Some(i);
        }

        let mut extended = person();
        extended
            .properties
            .insert(0, Property::new("email", PropertyType::String));
        let mut target: Schema = vec![extended].into();
        target.adopt_columns(&persisted);

        let person = target.get("Person").unwrap();
        assert_eq!(person.property("email").unwrap().column, None);
        assert_eq!(person.property("name").unwrap().column, Some(0));
        assert_eq!(person.property("age").unwrap().column, Some(1));
    }

    #[test]
    fn test_fill_value() {
        assert_eq!(
            Property::new("n", PropertyType::Int)
                .with_default(5i64)
                .fill_value(),
            Value::Int(5)
        );
        assert_eq!(
            Property::new("n", PropertyType::Int).nullable().fill_value(),
            Value::Null
        );
        assert_eq!(
            Property::new("n", PropertyType::Int).fill_value(),
            Value::Int(0)
        );
    }
}
