//! Schema versioning and migration
//!
//! [`Realm::update_schema`] moves the file from its persisted schema and
//! version to a target schema and version. Migrations only go forward. A
//! target at the persisted version may only add to the schema; anything
//! else needs a version bump and a migration callback.
//!
//! The whole migration runs in one write transaction: structural additions,
//! the callback, column removals and the version stamp commit together or
//! not at all.
//!
//! While the callback runs, the realm's connection is checked out of its
//! state and no lock is held; other operations on the same realm fail with
//! `InvalidTransaction` until the migration finishes.

use super::transactions::TransactionState;
use super::{MigrationFn, Realm};
use crate::notification::RealmEvent;
use shoal_core::{is_additive, ObjectSchema, RealmError, RealmResult, Schema, SchemaChange, Value};
use shoal_storage::{Column, Connection, Group, StorageResult};
use tracing::{debug, info, warn};

/// Context handed to a migration callback
///
/// Gives read access to the data as it was before the migration and
/// read/write access to the data being migrated. Rows keep their positions
/// between the two until the callback moves them.
pub struct Migration<'a> {
    old_schema: &'a Schema,
    new_schema: &'a Schema,
    old_version: Option<u64>,
    new_version: u64,
    old_group: &'a Group,
    group: &'a mut Group,
}

impl Migration<'_> {
    /// Schema persisted before the migration
    pub fn old_schema(&self) -> &Schema {
        self.old_schema
    }

    /// Schema being migrated to
    pub fn new_schema(&self) -> &Schema {
        self.new_schema
    }

    /// Version persisted before the migration (`None` if unversioned)
    pub fn old_version(&self) -> Option<u64> {
        self.old_version
    }

    /// Version being migrated to
    pub fn new_version(&self) -> u64 {
        self.new_version
    }

    /// Pre-migration data
    pub fn old_group(&self) -> &Group {
        self.old_group
    }

    /// Data being migrated
    pub fn group_mut(&mut self) -> &mut Group {
        self.group
    }

    /// Number of objects of `object_type` being migrated
    pub fn object_count(&self, object_type: &str) -> usize {
        self.group.table(object_type).map_or(0, |t| t.row_count())
    }

    /// Value of `property` on row `row` before the migration
    pub fn old_value(&self, object_type: &str, row: usize, property: &str) -> Option<&Value> {
        let table = self.old_group.table(object_type)?;
        table.get(row, table.column_index(property)?)
    }

    /// Current value of `property` on row `row`
    pub fn value(&self, object_type: &str, row: usize, property: &str) -> Option<&Value> {
        let table = self.group.table(object_type)?;
        table.get(row, table.column_index(property)?)
    }

    /// Overwrite `property` on row `row`
    ///
    /// # Errors
    ///
    /// `ObjectTypeNotFound` for an unknown type, `InvalidValue` for an
    /// unknown property or a value of the wrong type.
    pub fn set_value(
        &mut self,
        object_type: &str,
        row: usize,
        property: &str,
        value: impl Into<Value>,
    ) -> RealmResult<()> {
        let table = self.group.table_mut(object_type)?;
        let column = table
            .column_index(property)
            .ok_or_else(|| RealmError::InvalidValue {
                object_type: object_type.to_string(),
                property: property.to_string(),
                message: "no such property".to_string(),
            })?;
        table.set(row, column, value.into())?;
        Ok(())
    }
}

/// Outcome of comparing the persisted state with the target
#[derive(Debug)]
enum Plan {
    /// Already there
    Current,
    /// Needs a migration transaction applying `changes`
    Migrate { changes: Vec<SchemaChange> },
}

/// Decide what `update_schema` must do, or why it cannot
fn plan(
    persisted: &Schema,
    persisted_version: Option<u64>,
    target: &Schema,
    version: u64,
    read_only: bool,
    has_callback: bool,
) -> RealmResult<Plan> {
    if let Some(current) = persisted_version {
        if version < current {
            return Err(RealmError::invalid_schema_version(format!(
                "provided schema version {} is less than last set version {}",
                version, current
            )));
        }
    }

    let changes = persisted.diff(target);
    let same_version = persisted_version == Some(version);
    if same_version && changes.is_empty() {
        return Ok(Plan::Current);
    }
    if read_only {
        return Err(RealmError::invalid_schema_version(
            "a read-only realm cannot be migrated",
        ));
    }
    let additive = is_additive(&changes);
    if same_version && !additive {
        return Err(RealmError::invalid_schema_version(format!(
            "schema changed without bumping version {}: {}",
            version,
            describe(&changes)
        )));
    }
    if !additive && !has_callback {
        return Err(RealmError::invalid_schema_version(format!(
            "migration required for version {} but no migration callback was provided: {}",
            version,
            describe(&changes)
        )));
    }
    Ok(Plan::Migrate { changes })
}

fn describe(changes: &[SchemaChange]) -> String {
    changes
        .iter()
        .filter(|c| !c.is_additive())
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn column_for(object_schema: &ObjectSchema, property: &str) -> RealmResult<(Column, Value)> {
    let prop = object_schema
        .property(property)
        .ok_or_else(|| RealmError::InvalidValue {
            object_type: object_schema.name.clone(),
            property: property.to_string(),
            message: "property missing from target schema".to_string(),
        })?;
    let column = Column {
        name: prop.name.clone(),
        kind: prop.kind,
        nullable: prop.nullable,
        indexed: prop.indexed,
    };
    Ok((column, prop.fill_value()))
}

fn target_object<'s>(target: &'s Schema, object_type: &str) -> RealmResult<&'s ObjectSchema> {
    target
        .get(object_type)
        .ok_or_else(|| RealmError::ObjectTypeNotFound(object_type.to_string()))
}

fn column_index(group: &mut Group, object_type: &str, property: &str) -> RealmResult<usize> {
    group
        .table_mut(object_type)?
        .column_index(property)
        .ok_or_else(|| RealmError::InvalidValue {
            object_type: object_type.to_string(),
            property: property.to_string(),
            message: "no such column".to_string(),
        })
}

/// Apply every change except property removal
fn apply_structure(group: &mut Group, target: &Schema, changes: &[SchemaChange]) -> RealmResult<()> {
    for change in changes {
        match change {
            SchemaChange::AddObjectType { object_type } => {
                let object_schema = target_object(target, object_type)?;
                let table = group.get_or_add_table(object_type);
                for prop in &object_schema.properties {
                    let (column, fill) = column_for(object_schema, &prop.name)?;
                    table.add_column(column, fill)?;
                }
                table.set_primary_key(object_schema.primary_key.clone())?;
            }
            SchemaChange::AddProperty {
                object_type,
                property,
            } => {
                let (column, fill) = column_for(target_object(target, object_type)?, property)?;
                group.table_mut(object_type)?.add_column(column, fill)?;
            }
            SchemaChange::RemoveProperty { .. } => {}
            SchemaChange::ChangePropertyType {
                object_type,
                property,
                to,
                ..
            } => {
                let (column, fill) = column_for(target_object(target, object_type)?, property)?;
                let idx = column_index(group, object_type, property)?;
                group
                    .table_mut(object_type)?
                    .retype_column(idx, *to, column.nullable, fill)?;
            }
            SchemaChange::ChangeNullability {
                object_type,
                property,
                nullable,
            } => {
                let (_, fill) = column_for(target_object(target, object_type)?, property)?;
                let idx = column_index(group, object_type, property)?;
                group
                    .table_mut(object_type)?
                    .set_nullable(idx, *nullable, fill)?;
            }
            SchemaChange::AddIndex {
                object_type,
                property,
            }
            | SchemaChange::RemoveIndex {
                object_type,
                property,
            } => {
                let indexed = matches!(change, SchemaChange::AddIndex { .. });
                let idx = column_index(group, object_type, property)?;
                group.table_mut(object_type)?.set_indexed(idx, indexed)?;
            }
            SchemaChange::ChangePrimaryKey {
                object_type, to, ..
            } => {
                group.table_mut(object_type)?.set_primary_key(to.clone())?;
            }
        }
    }
    Ok(())
}

/// Drop the columns the target no longer declares
fn remove_properties(group: &mut Group, changes: &[SchemaChange]) -> RealmResult<()> {
    for change in changes {
        if let SchemaChange::RemoveProperty {
            object_type,
            property,
        } = change
        {
            let table = group.table_mut(object_type)?;
            // The callback may already have dropped it.
            if let Some(idx) = table.column_index(property) {
                table.remove_column(idx)?;
            }
        }
    }
    Ok(())
}

/// Body of the migration write transaction; the caller commits or rolls back
fn migrate(
    conn: &mut dyn Connection,
    target: &Schema,
    version: u64,
    changes: &[SchemaChange],
    callback: Option<&MigrationFn>,
) -> RealmResult<()> {
    let old_group = conn.group()?.clone();
    let old_schema = old_group.schema();
    let group = conn.group_mut()?;

    apply_structure(group, target, changes)?;
    if let Some(callback) = callback {
        let mut migration = Migration {
            old_schema: &old_schema,
            new_schema: target,
            old_version: old_group.schema_version(),
            new_version: version,
            old_group: &old_group,
            group: &mut *group,
        };
        callback(&mut migration)?;
    }
    remove_properties(group, changes)?;
    group.set_schema_version(version);
    Ok(())
}

impl Realm {
    /// Migrate the file to `schema` at `version`
    ///
    /// Returns `false` without opening a write transaction when the file is
    /// already at `version` with an identical schema. Otherwise runs the
    /// migration transaction, adopts the resulting schema (with column
    /// indices) into this realm's config, sends the commit notifications and
    /// returns `true`.
    ///
    /// # Errors
    ///
    /// - `IncorrectThread` off the affinity thread
    /// - `InvalidTransaction` while a write transaction is open
    /// - `InvalidSchemaVersion` for a backwards version, a non-additive
    ///   change without a version bump or without a migration callback, or
    ///   any change on a read-only realm
    /// - any error returned by the callback; the file keeps its prior version
    pub fn update_schema(&self, schema: Schema, version: u64) -> RealmResult<bool> {
        self.verify_thread()?;
        let callback = self.config.lock().migration.clone();

        let (mut conn, changes) = {
            let mut state = self.state.lock();
            if state.tx_state == TransactionState::InTransaction {
                return Err(RealmError::invalid_transaction(
                    "cannot update the schema while a write transaction is open",
                ));
            }
            let conn = state.connection(&self.path)?;
            let persisted = conn.group()?.schema();
            let persisted_version = conn.schema_version()?;
            let planned = plan(
                &persisted,
                persisted_version,
                &schema,
                version,
                self.read_only,
                callback.is_some(),
            )?;
            if let Plan::Current = planned {
                drop(state);
                self.adopt_schema(schema, version, &persisted);
                debug!(target: "shoal::migration", path = %self.path.display(), version, "Schema already current");
                return Ok(false);
            }

            // Re-plan against the latest commit, which begin_write moves to.
            conn.begin_write()?;
            let latest = conn.group()?.schema();
            let latest_version = conn.group()?.schema_version();
            let replanned = plan(
                &latest,
                latest_version,
                &schema,
                version,
                self.read_only,
                callback.is_some(),
            );
            let changes = match replanned {
                Ok(Plan::Migrate { changes }) => changes,
                Ok(Plan::Current) => {
                    conn.rollback()?;
                    drop(state);
                    self.adopt_schema(schema, version, &latest);
                    return Ok(false);
                }
                Err(e) => {
                    conn.rollback()?;
                    return Err(e);
                }
            };

            state.tx_state = TransactionState::InTransaction;
            let Some(conn) = state.connection.take() else {
                return Err(RealmError::invalid_transaction("connection unavailable"));
            };
            (conn, changes)
        };

        info!(
            target: "shoal::migration",
            path = %self.path.display(),
            version,
            changes = changes.len(),
            "Migrating schema"
        );

        let outcome = migrate(conn.as_mut(), &schema, version, &changes, callback.as_ref())
            .and_then(|()| Ok(conn.commit()?));
        if outcome.is_err() && conn.is_in_write() {
            if let Err(e) = conn.rollback() {
                warn!(target: "shoal::migration", error = %e, "Rollback after failed migration failed");
            }
        }
        let applied: StorageResult<Schema> = match &outcome {
            Ok(_) => conn.group().map(Group::schema),
            Err(_) => Ok(Schema::new()),
        };

        {
            let mut state = self.state.lock();
            state.connection = Some(conn);
            state.tx_state = TransactionState::Idle;
        }

        if let Err(e) = outcome {
            warn!(target: "shoal::migration", path = %self.path.display(), version, error = %e, "Migration failed");
            return Err(e);
        }
        self.adopt_schema(schema, version, &applied?);
        info!(target: "shoal::migration", path = %self.path.display(), version, "Migration committed");

        self.notifications.send_external();
        self.notifications.send_local(RealmEvent::DidChange);
        Ok(true)
    }

    fn adopt_schema(&self, mut schema: Schema, version: u64, persisted: &Schema) {
        schema.adopt_columns(persisted);
        let mut config = self.config.lock();
        config.schema = Some(schema);
        config.schema_version = Some(version);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_core::{Property, PropertyType};

    fn person(props: Vec<Property>) -> Schema {
        vec![ObjectSchema::new("Person", props)].into()
    }

    fn base() -> Schema {
        person(vec![Property::new("name", PropertyType::String)])
    }

    #[test]
    fn plan_current() {
        assert!(matches!(
            plan(&base(), Some(1), &base(), 1, false, false).unwrap(),
            Plan::Current
        ));
    }

    #[test]
    fn plan_rejects_backwards() {
        let err = plan(&base(), Some(3), &base(), 2, false, true).unwrap_err();
        assert_eq!(err.kind(), shoal_core::ErrorKind::InvalidSchemaVersion);
    }

    #[test]
    fn plan_additive_same_version() {
        let target = person(vec![
            Property::new("name", PropertyType::String),
            Property::new("age", PropertyType::Int),
        ]);
        assert!(matches!(
            plan(&base(), Some(1), &target, 1, false, false).unwrap(),
            Plan::Migrate { .. }
        ));
    }

    #[test]
    fn plan_destructive_needs_bump_and_callback() {
        let target = person(vec![Property::new("name", PropertyType::Int)]);
        assert!(plan(&base(), Some(1), &target, 1, false, true).is_err());
        assert!(plan(&base(), Some(1), &target, 2, false, false).is_err());
        assert!(matches!(
            plan(&base(), Some(1), &target, 2, false, true).unwrap(),
            Plan::Migrate { .. }
        ));
    }

    #[test]
    fn plan_read_only_cannot_migrate() {
        let err = plan(&Schema::new(), None, &base(), 1, true, true).unwrap_err();
        assert!(err.to_string().contains("read-only"));
    }

    #[test]
    fn structure_applied_with_fill_values() {
        let mut group = Group::new();
        apply_structure(
            &mut group,
            &base(),
            &Schema::new().diff(&base()),
        )
        .unwrap();
        group
            .table_mut("Person")
            .unwrap()
            .add_row(vec![Value::from("alice")])
            .unwrap();

        let target = person(vec![
            Property::new("name", PropertyType::String),
            Property::new("age", PropertyType::Int).with_default(18i64),
            Property::new("nick", PropertyType::String).nullable(),
            Property::new("score", PropertyType::Float),
        ]);
        let changes = group.schema().diff(&target);
        apply_structure(&mut group, &target, &changes).unwrap();

        let table = group.table("Person").unwrap();
        assert_eq!(
            table.row(0).unwrap(),
            &[
                Value::from("alice"),
                Value::Int(18),
                Value::Null,
                Value::Float(0.0)
            ]
        );
    }

    #[test]
    fn removal_deferred_until_after_callback() {
        let mut group = Group::new();
        let two = person(vec![
            Property::new("name", PropertyType::String),
            Property::new("legacy", PropertyType::Int),
        ]);
        apply_structure(&mut group, &two, &Schema::new().diff(&two)).unwrap();

        let changes = group.schema().diff(&base());
        apply_structure(&mut group, &base(), &changes).unwrap();
        assert!(group.table("Person").unwrap().column_index("legacy").is_some());

        remove_properties(&mut group, &changes).unwrap();
        assert!(group.table("Person").unwrap().column_index("legacy").is_none());
    }
}
