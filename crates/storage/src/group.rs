//! In-memory image of a database file
//!
//! A [`Group`] is the unit a connection reads and writes: a set of named
//! [`Table`]s plus the persisted schema version. Readers share an immutable
//! `Arc<Group>` snapshot; a write transaction works on a private clone that
//! replaces the shared snapshot on commit.
//!
//! Tables are column-oriented in description and row-oriented in storage:
//! every row holds exactly one value per column, in column order.

use crate::error::{StorageError, StorageResult};
use serde::{Deserialize, Serialize};
use shoal_core::{ObjectSchema, Property, PropertyType, Schema, Value};
use std::collections::BTreeMap;

/// Column description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    /// Column name
    pub name: String,
    /// Column type
    pub kind: PropertyType,
    /// Whether the column accepts `Null`
    pub nullable: bool,
    /// Whether the column carries a search index
    pub indexed: bool,
}

/// A table: ordered columns and rows of values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    name: String,
    columns: Vec<Column>,
    rows: Vec<Vec<Value>>,
    primary_key: Option<String>,
}

impl Table {
    /// Create an empty table
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Table name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Columns in index order
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Index of the named column
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Primary key column name
    pub fn primary_key(&self) -> Option<&str> {
        self.primary_key.as_deref()
    }

    /// Set or clear the primary key column
    pub fn set_primary_key(&mut self, column: Option<String>) -> StorageResult<()> {
        if let Some(name) = &column {
            self.require_column(name)?;
        }
        self.primary_key = column;
        Ok(())
    }

    /// Append a column, backfilling `fill` into every existing row
    ///
    /// Returns the new column's index.
    pub fn add_column(&mut self, column: Column, fill: Value) -> StorageResult<usize> {
        if self.column_index(&column.name).is_some() {
            return Err(StorageError::ColumnType {
                table: self.name.clone(),
                column: column.name,
                message: "column already exists".to_string(),
            });
        }
        self.check_value(&column, &fill)?;
        for row in &mut self.rows {
            row.push(fill.clone());
        }
        self.columns.push(column);
        Ok(self.columns.len() - 1)
    }

    /// Remove a column and its values from every row
    pub fn remove_column(&mut self, index: usize) -> StorageResult<Column> {
        if index >= self.columns.len() {
            return Err(StorageError::InvalidState(format!(
                "column index {} out of range for table '{}'",
                index, self.name
            )));
        }
        for row in &mut self.rows {
            row.remove(index);
        }
        let column = self.columns.remove(index);
        if self.primary_key.as_deref() == Some(column.name.as_str()) {
            self.primary_key = None;
        }
        Ok(column)
    }

    /// Redefine a column's type and nullability, resetting every value to `fill`
    pub fn retype_column(
        &mut self,
        index: usize,
        kind: PropertyType,
        nullable: bool,
        fill: Value,
    ) -> StorageResult<()> {
        let column = self.column_at(index)?.clone();
        let redefined = Column {
            kind,
            nullable,
            ..column
        };
        self.check_value(&redefined, &fill)?;
        for row in &mut self.rows {
            row[index] = fill.clone();
        }
        self.columns[index] = redefined;
        Ok(())
    }

    /// Change nullability, replacing nulls with `fill` when becoming required
    pub fn set_nullable(&mut self, index: usize, nullable: bool, fill: Value) -> StorageResult<()> {
        let column = self.column_at(index)?.clone();
        if !nullable {
            self.check_value(
                &Column {
                    nullable: false,
                    ..column
                },
                &fill,
            )?;
            for row in &mut self.rows {
                if row[index].is_null() {
                    row[index] = fill.clone();
                }
            }
        }
        self.columns[index].nullable = nullable;
        Ok(())
    }

    /// Add or remove the column's index flag
    pub fn set_indexed(&mut self, index: usize, indexed: bool) -> StorageResult<()> {
        self.column_at(index)?;
        self.columns[index].indexed = indexed;
        Ok(())
    }

    /// Number of rows
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Borrow a row
    pub fn row(&self, index: usize) -> Option<&[Value]> {
        self.rows.get(index).map(Vec::as_slice)
    }

    /// Iterate rows
    pub fn rows(&self) -> impl Iterator<Item = &[Value]> {
        self.rows.iter().map(Vec::as_slice)
    }

    /// Read one cell
    pub fn get(&self, row: usize, column: usize) -> Option<&Value> {
        self.rows.get(row).and_then(|r| r.get(column))
    }

    /// Overwrite one cell
    ///
    /// A primary-key cell may not take a value held by another row.
    pub fn set(&mut self, row: usize, column: usize, value: Value) -> StorageResult<()> {
        let col = self.column_at(column)?;
        self.check_value(col, &value)?;
        if self.primary_key.as_deref() == Some(col.name.as_str()) {
            if let Some(other) = self.find_first(column, &value).filter(|&r| r != row) {
                return Err(StorageError::ColumnType {
                    table: self.name.clone(),
                    column: col.name.clone(),
                    message: format!("duplicate primary key value {:?} (row {})", value, other),
                });
            }
        }
        let row_count = self.rows.len();
        let slot = self
            .rows
            .get_mut(row)
            .ok_or_else(|| {
                StorageError::InvalidState(format!(
                    "row {} out of range ({} rows)",
                    row, row_count
                ))
            })?;
        slot[column] = value;
        Ok(())
    }

    /// Append a row; values must be given in column order
    pub fn add_row(&mut self, values: Vec<Value>) -> StorageResult<usize> {
        if values.len() != self.columns.len() {
            return Err(StorageError::InvalidState(format!(
                "table '{}' has {} columns, row has {} values",
                self.name,
                self.columns.len(),
                values.len()
            )));
        }
        for (column, value) in self.columns.iter().zip(&values) {
            self.check_value(column, value)?;
        }
        self.rows.push(values);
        Ok(self.rows.len() - 1)
    }

    /// Remove a row
    pub fn remove_row(&mut self, index: usize) -> Option<Vec<Value>> {
        (index < self.rows.len()).then(|| self.rows.remove(index))
    }

    /// First row whose `column` equals `value`
    pub fn find_first(&self, column: usize, value: &Value) -> Option<usize> {
        self.rows.iter().position(|r| r.get(column) == Some(value))
    }

    /// Release spare capacity
    pub fn optimize(&mut self) {
        for row in &mut self.rows {
            row.shrink_to_fit();
        }
        self.rows.shrink_to_fit();
        self.columns.shrink_to_fit();
    }

    /// Describe this table as an object schema, with column indices
    pub fn object_schema(&self) -> ObjectSchema {
        let properties = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, c)| Property {
                name: c.name.clone(),
                kind: c.kind,
                nullable: c.nullable,
                indexed: c.indexed,
                default: None,
                column: Some(i),
            })
            .collect();
        ObjectSchema {
            name: self.name.clone(),
            properties,
            primary_key: self.primary_key.clone(),
        }
    }

    fn column_at(&self, index: usize) -> StorageResult<&Column> {
        self.columns.get(index).ok_or_else(|| {
            StorageError::InvalidState(format!(
                "column index {} out of range for table '{}'",
                index, self.name
            ))
        })
    }

    fn require_column(&self, name: &str) -> StorageResult<usize> {
        self.column_index(name)
            .ok_or_else(|| StorageError::NoSuchColumn {
                table: self.name.clone(),
                column: name.to_string(),
            })
    }

    fn check_value(&self, column: &Column, value: &Value) -> StorageResult<()> {
        if value.matches(column.kind, column.nullable) {
            return Ok(());
        }
        Err(StorageError::ColumnType {
            table: self.name.clone(),
            column: column.name.clone(),
            message: format!(
                "expected {}{}, got {}",
                column.kind,
                if column.nullable { "?" } else { "" },
                value.type_name()
            ),
        })
    }
}

/// All tables of one database file plus its schema version
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Group {
    schema_version: Option<u64>,
    tables: BTreeMap<String, Table>,
}

impl Group {
    /// Create an empty, unversioned group
    pub fn new() -> Self {
        Self::default()
    }

    /// Persisted schema version; `None` until a schema has been applied
    pub fn schema_version(&self) -> Option<u64> {
        self.schema_version
    }

    /// Record a new schema version
    pub fn set_schema_version(&mut self, version: u64) {
        self.schema_version = Some(version);
    }

    /// Whether a table exists
    pub fn has_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    /// Borrow a table
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    /// Borrow a table mutably
    pub fn table_mut(&mut self, name: &str) -> StorageResult<&mut Table> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| StorageError::NoSuchTable(name.to_string()))
    }

    /// Create a table, or return the existing one
    pub fn get_or_add_table(&mut self, name: &str) -> &mut Table {
        self.tables
            .entry(name.to_string())
            .or_insert_with(|| Table::new(name))
    }

    /// Table names in order
    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    /// Release spare capacity in every table
    pub fn optimize(&mut self) {
        for table in self.tables.values_mut() {
            table.optimize();
        }
    }

    /// Schema described by the tables, with engine column indices
    pub fn schema(&self) -> Schema {
        self.tables.values().map(Table::object_schema).collect()
    }
}
