//! Value types for Shoal
//!
//! This module defines:
//! - Value: the cell value stored in a table column
//! - PropertyType: the column type a property is declared with
//!
//! ## Type Rules
//!
//! - No implicit type coercions: `Int(1)` never satisfies a `Float` column
//! - `Bytes` are not `String`
//! - `Null` only satisfies nullable columns
//! - Float uses IEEE-754 equality: `NaN != NaN`, `-0.0 == 0.0`

use serde::{Deserialize, Serialize};
use std::fmt;

/// Declared type of a schema property / table column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    /// Boolean column
    Bool,
    /// 64-bit signed integer column
    Int,
    /// 64-bit floating point column
    Float,
    /// UTF-8 string column
    String,
    /// Raw bytes column
    Bytes,
}

impl PropertyType {
    /// Value a non-nullable column of this type holds when nothing else is known
    pub fn zero_value(self) -> Value {
        match self {
            PropertyType::Bool => Value::Bool(false),
            PropertyType::Int => Value::Int(0),
            PropertyType::Float => Value::Float(0.0),
            PropertyType::String => Value::String(String::new()),
            PropertyType::Bytes => Value::Bytes(Vec::new()),
        }
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PropertyType::Bool => "bool",
            PropertyType::Int => "int",
            PropertyType::Float => "float",
            PropertyType::String => "string",
            PropertyType::Bytes => "bytes",
        };
        f.write_str(name)
    }
}

/// Cell value stored in a table
///
/// Different variants are never equal, even when they carry the "same"
/// number: `Int(1) != Float(1.0)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    /// Null value
    Null,
    /// Boolean value
    Bool(bool),
    /// 64-bit signed integer
    Int(i64),
    /// 64-bit floating point (IEEE-754)
    Float(f64),
    /// UTF-8 string
    String(String),
    /// Raw bytes
    Bytes(Vec<u8>),
}

// Custom PartialEq implementation for IEEE-754 float semantics
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            _ => false,
        }
    }
}

impl Value {
    /// Get the type name as a string
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "Null",
            Value::Bool(_) => "Bool",
            Value::Int(_) => "Int",
            Value::Float(_) => "Float",
            Value::String(_) => "String",
            Value::Bytes(_) => "Bytes",
        }
    }

    /// Check if this is a null value
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The property type this value belongs to, `None` for `Null`
    pub fn property_type(&self) -> Option<PropertyType> {
        match self {
            Value::Null => None,
            Value::Bool(_) => Some(PropertyType::Bool),
            Value::Int(_) => Some(PropertyType::Int),
            Value::Float(_) => Some(PropertyType::Float),
            Value::String(_) => Some(PropertyType::String),
            Value::Bytes(_) => Some(PropertyType::Bytes),
        }
    }

    /// Whether this value may be stored in a column of `kind`
    pub fn matches(&self, kind: PropertyType, nullable: bool) -> bool {
        match self.property_type() {
            None => nullable,
            Some(own) => own == kind,
        }
    }

    /// Get as i64 if this is an Int value
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Get as &str if this is a String value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get as bool if this is a Bool value
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}
