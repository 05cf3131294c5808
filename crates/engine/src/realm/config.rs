//! Realm configuration
//!
//! A [`RealmConfig`] is built programmatically or loaded from a TOML file.
//! Callbacks and the storage engine can only be attached programmatically,
//! so the TOML form covers the declarative part: path, access mode, schema
//! and version.
//!
//! # Example
//!
//! ```toml
//! path = "data/people.shoal"
//! read_only = false
//! in_memory = false
//! open_mode = "open_or_create"
//! schema_version = 2
//!
//! [[schema]]
//! name = "Person"
//! primary_key = "id"
//!
//! [[schema.properties]]
//! name = "id"
//! type = "int"
//!
//! [[schema.properties]]
//! name = "nickname"
//! type = "string"
//! nullable = true
//! ```

use super::migration::Migration;
use serde::Deserialize;
use shoal_core::{ObjectSchema, RealmError, RealmResult, Schema};
use shoal_storage::{default_engine, EngineOptions, OpenMode, StorageEngine};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Required length of an encryption key, in bytes
pub const ENCRYPTION_KEY_LEN: usize = 64;

/// Migration callback run inside the migration write transaction
pub type MigrationFn = Arc<dyn Fn(&mut Migration<'_>) -> RealmResult<()> + Send + Sync>;

/// Parameters describing which file to open and to what schema
#[derive(Clone)]
pub struct RealmConfig {
    /// File path; the cache identity key, used as given
    pub path: PathBuf,
    /// Open without write access
    pub read_only: bool,
    /// Keep the data in process memory only
    pub in_memory: bool,
    /// Key the file is bound to
    pub encryption_key: Option<Vec<u8>>,
    /// Creation policy
    pub open_mode: OpenMode,
    /// Target schema; `None` adopts whatever the file holds
    pub schema: Option<Schema>,
    /// Target schema version; `None` means not versioned
    pub schema_version: Option<u64>,
    /// Callback for non-additive schema changes
    pub migration: Option<MigrationFn>,
    /// Storage engine the handle opens its connection through
    pub engine: Arc<dyn StorageEngine>,
}

impl fmt::Debug for RealmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealmConfig")
            .field("path", &self.path)
            .field("read_only", &self.read_only)
            .field("in_memory", &self.in_memory)
            .field("encryption_key", &self.encryption_key.as_ref().map(|_| "<redacted>"))
            .field("open_mode", &self.open_mode)
            .field("schema", &self.schema)
            .field("schema_version", &self.schema_version)
            .field("migration", &self.migration.as_ref().map(|_| "<callback>"))
            .finish_non_exhaustive()
    }
}

impl RealmConfig {
    /// Configuration for `path` with default options
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            read_only: false,
            in_memory: false,
            encryption_key: None,
            open_mode: OpenMode::default(),
            schema: None,
            schema_version: None,
            migration: None,
            engine: default_engine(),
        }
    }

    /// Set read-only mode
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Set in-memory mode
    pub fn in_memory(mut self, in_memory: bool) -> Self {
        self.in_memory = in_memory;
        self
    }

    /// Bind the file to an encryption key
    pub fn encryption_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.encryption_key = Some(key.into());
        self
    }

    /// Set the creation policy
    pub fn open_mode(mut self, mode: OpenMode) -> Self {
        self.open_mode = mode;
        self
    }

    /// Set the target schema
    pub fn schema(mut self, schema: Schema) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Set the target schema version
    pub fn schema_version(mut self, version: u64) -> Self {
        self.schema_version = Some(version);
        self
    }

    /// Attach a migration callback
    pub fn migration<F>(mut self, callback: F) -> Self
    where
        F: Fn(&mut Migration<'_>) -> RealmResult<()> + Send + Sync + 'static,
    {
        self.migration = Some(Arc::new(callback));
        self
    }

    /// Use a specific storage engine
    pub fn engine(mut self, engine: Arc<dyn StorageEngine>) -> Self {
        self.engine = engine;
        self
    }

    /// Check the configuration on its own, before any file is touched
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for an empty path, an in-memory read-only
    /// combination, or an encryption key that is not 64 bytes long.
    pub fn validate(&self) -> RealmResult<()> {
        if self.path.as_os_str().is_empty() {
            return Err(RealmError::InvalidConfig("path must not be empty".to_string()));
        }
        if self.in_memory && self.read_only {
            return Err(RealmError::InvalidConfig(
                "in-memory realms cannot be read-only".to_string(),
            ));
        }
        if let Some(key) = &self.encryption_key {
            if key.len() != ENCRYPTION_KEY_LEN {
                return Err(RealmError::InvalidConfig(format!(
                    "encryption key must be {} bytes, got {}",
                    ENCRYPTION_KEY_LEN,
                    key.len()
                )));
            }
        }
        Ok(())
    }

    /// Options passed to the storage engine
    pub(crate) fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            read_only: self.read_only,
            in_memory: self.in_memory,
            open_mode: self.open_mode,
            encryption_key: self.encryption_key.clone(),
        }
    }

    /// Parse a TOML configuration
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the text is not valid TOML for a config.
    pub fn from_toml_str(content: &str) -> RealmResult<Self> {
        let file: ConfigFile = toml::from_str(content)
            .map_err(|e| RealmError::InvalidConfig(format!("failed to parse config: {}", e)))?;
        Ok(file.into_config())
    }

    /// Read and parse a TOML configuration file
    ///
    /// A relative `path` inside the file is resolved against the directory
    /// holding the config file.
    ///
    /// # Errors
    ///
    /// Returns `FileAccessError` if the file cannot be read, `InvalidConfig`
    /// if it cannot be parsed.
    pub fn from_file(path: &Path) -> RealmResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| RealmError::FileAccessError {
            path: path.to_path_buf(),
            message: format!("failed to read config file: {}", e),
            source: Some(e),
        })?;
        let mut config = Self::from_toml_str(&content).map_err(|e| match e {
            RealmError::InvalidConfig(msg) => {
                RealmError::InvalidConfig(format!("'{}': {}", path.display(), msg))
            }
            other => other,
        })?;
        if config.path.is_relative() {
            if let Some(dir) = path.parent() {
                config.path = dir.join(&config.path);
            }
        }
        Ok(config)
    }
}

/// Declarative subset of [`RealmConfig`] as stored in TOML
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    path: PathBuf,
    #[serde(default)]
    read_only: bool,
    #[serde(default)]
    in_memory: bool,
    #[serde(default)]
    open_mode: OpenMode,
    #[serde(default)]
    schema_version: Option<u64>,
    #[serde(default)]
    schema: Option<Vec<ObjectSchema>>,
}

impl ConfigFile {
    fn into_config(self) -> RealmConfig {
        let mut config = RealmConfig::new(self.path)
            .read_only(self.read_only)
            .in_memory(self.in_memory)
            .open_mode(self.open_mode);
        config.schema_version = self.schema_version;
        config.schema = self.schema.map(Schema::from);
        config
    }
}
