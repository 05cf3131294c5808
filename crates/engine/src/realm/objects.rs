//! Minimal object access
//!
//! Enough to make transactions observable: create (or upsert by primary
//! key), list and count objects of a declared type. Objects are exchanged as
//! `property name -> value` maps. Creating objects never changes the schema.

use super::transactions::TransactionState;
use super::Realm;
use shoal_core::{ObjectSchema, RealmError, RealmResult, Value};
use shoal_storage::Table;
use std::collections::BTreeMap;

/// One object as `property name -> value`
pub type Object = BTreeMap<String, Value>;

impl Realm {
    /// Create an object of `object_type` from `values`
    ///
    /// Missing properties take their default, or `Null` when nullable. With
    /// `update` set and a primary key declared, an existing object with the
    /// same key is updated in place (only the given properties change).
    /// Returns the object's row index.
    ///
    /// # Errors
    ///
    /// - `InvalidTransaction` outside a write transaction
    /// - `ObjectTypeNotFound` if the type is not in the schema
    /// - `MissingPropertyValue` for a required property without default
    /// - `InvalidValue` for an unknown property, a mistyped value or a
    ///   duplicate primary key
    pub fn create_object(&self, object_type: &str, values: Object, update: bool) -> RealmResult<usize> {
        self.verify_thread()?;
        let object_schema = self.object_schema(object_type)?;

        let mut state = self.state.lock();
        if state.tx_state != TransactionState::InTransaction {
            return Err(RealmError::invalid_transaction(
                "objects can only be created inside a write transaction",
            ));
        }
        let table = state.connection(&self.path)?.group_mut()?.table_mut(object_type)?;

        for name in values.keys() {
            if object_schema.property(name).is_none() {
                return Err(RealmError::InvalidValue {
                    object_type: object_type.to_string(),
                    property: name.clone(),
                    message: "no such property".to_string(),
                });
            }
        }

        if let Some(existing) = find_by_primary_key(table, &object_schema, &values)? {
            if !update {
                return Err(RealmError::InvalidValue {
                    object_type: object_type.to_string(),
                    property: object_schema.primary_key.clone().unwrap_or_default(),
                    message: "an object with this primary key already exists".to_string(),
                });
            }
            for (name, value) in values {
                if let Some(column) = table.column_index(&name) {
                    table.set(existing, column, value)?;
                }
            }
            return Ok(existing);
        }

        let mut row = Vec::with_capacity(table.columns().len());
        for column in table.columns() {
            let value = match values.get(&column.name) {
                Some(value) => value.clone(),
                None => {
                    let property = object_schema.property(&column.name);
                    match property.and_then(|p| p.default.clone()) {
                        Some(default) => default,
                        None if column.nullable => Value::Null,
                        None => {
                            return Err(RealmError::MissingPropertyValue {
                                object_type: object_type.to_string(),
                                property: column.name.clone(),
                            })
                        }
                    }
                }
            };
            row.push(value);
        }
        Ok(table.add_row(row)?)
    }

    /// All objects of `object_type` in the current view
    pub fn objects(&self, object_type: &str) -> RealmResult<Vec<Object>> {
        self.verify_thread()?;
        self.object_schema(object_type)?;
        let mut state = self.state.lock();
        let group = state.connection(&self.path)?.group()?;
        Ok(group.table(object_type).map(to_objects).unwrap_or_default())
    }

    /// Number of objects of `object_type` in the current view
    pub fn object_count(&self, object_type: &str) -> RealmResult<usize> {
        self.verify_thread()?;
        self.object_schema(object_type)?;
        let mut state = self.state.lock();
        let group = state.connection(&self.path)?.group()?;
        Ok(group.table(object_type).map_or(0, Table::row_count))
    }

    fn object_schema(&self, object_type: &str) -> RealmResult<ObjectSchema> {
        self.config
            .lock()
            .schema
            .as_ref()
            .and_then(|s| s.get(object_type))
            .cloned()
            .ok_or_else(|| RealmError::ObjectTypeNotFound(object_type.to_string()))
    }
}

fn find_by_primary_key(
    table: &Table,
    object_schema: &ObjectSchema,
    values: &Object,
) -> RealmResult<Option<usize>> {
    let Some(key) = object_schema.primary_key.as_deref() else {
        return Ok(None);
    };
    let Some(value) = values.get(key) else {
        return Ok(None);
    };
    let column = table.column_index(key).ok_or_else(|| RealmError::InvalidValue {
        object_type: object_schema.name.clone(),
        property: key.to_string(),
        message: "primary key column missing".to_string(),
    })?;
    Ok(table.find_first(column, value))
}

fn to_objects(table: &Table) -> Vec<Object> {
    table
        .rows()
        .map(|row| {
            table
                .columns()
                .iter()
                .zip(row)
                .map(|(c, v)| (c.name.clone(), v.clone()))
                .collect()
        })
        .collect()
}
