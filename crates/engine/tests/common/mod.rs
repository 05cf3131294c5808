//! Shared test utilities for the engine integration suites.
//!
//! Import via `mod common;` from any test file.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Once};

use parking_lot::Mutex;
pub use shoal_core::{ErrorKind, ObjectSchema, Property, PropertyType, Schema, Value};
pub use shoal_engine::{Listener, Object, Realm, RealmConfig};
use shoal_storage::{
    default_engine, Connection, EngineOptions, Group, StorageEngine, StorageError, StorageResult,
};
use tempfile::TempDir;

// ============================================================================
// Initialization
// ============================================================================

static INIT_TRACING: Once = Once::new();

/// Install a test-writer fmt subscriber once per test binary
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    });
}

// ============================================================================
// Fixtures
// ============================================================================

/// Temp directory plus a database path inside it
pub struct TestDir {
    pub dir: TempDir,
    pub path: PathBuf,
}

impl TestDir {
    pub fn new() -> Self {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.shoal");
        Self { dir, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> RealmConfig {
        RealmConfig::new(&self.path)
    }
}

/// `Person { name: string, age: int }`, primary key `name`
pub fn person_schema() -> Schema {
    vec![ObjectSchema::new(
        "Person",
        vec![
            Property::new("name", PropertyType::String),
            Property::new("age", PropertyType::Int),
        ],
    )
    .with_primary_key("name")]
    .into()
}

pub fn person(name: &str, age: i64) -> Object {
    let mut values = Object::new();
    values.insert("name".to_string(), Value::from(name));
    values.insert("age".to_string(), Value::Int(age));
    values
}

/// Write one person in its own transaction
pub fn add_person(realm: &Realm, name: &str, age: i64) {
    realm.begin_transaction().unwrap();
    realm.create_object("Person", person(name, age), false).unwrap();
    realm.commit_transaction().unwrap();
}

/// Listener that records every event name it receives
pub fn recorder() -> (Listener, Arc<Mutex<Vec<String>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let listener: Listener = Arc::new(move |name: &str| sink.lock().push(name.to_string()));
    (listener, events)
}

// ============================================================================
// Instrumented engine
// ============================================================================

/// Counters and fault switches shared by an [`InstrumentedEngine`]
#[derive(Default)]
pub struct Probe {
    pub begin_writes: AtomicUsize,
    pub commits: AtomicUsize,
    pub rollbacks: AtomicUsize,
    pub fail_begin_write: AtomicBool,
    pub fail_commit: AtomicBool,
}

impl Probe {
    pub fn begin_writes(&self) -> usize {
        self.begin_writes.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }
}

/// Engine wrapping the default engine, counting and optionally failing
/// write operations
pub struct InstrumentedEngine {
    inner: Arc<dyn StorageEngine>,
    pub probe: Arc<Probe>,
}

impl InstrumentedEngine {
    pub fn new() -> (Arc<Self>, Arc<Probe>) {
        let probe = Arc::new(Probe::default());
        let engine = Arc::new(Self {
            inner: default_engine(),
            probe: Arc::clone(&probe),
        });
        (engine, probe)
    }
}

impl StorageEngine for InstrumentedEngine {
    fn open(&self, path: &Path, options: &EngineOptions) -> StorageResult<Box<dyn Connection>> {
        Ok(Box::new(InstrumentedConnection {
            inner: self.inner.open(path, options)?,
            probe: Arc::clone(&self.probe),
        }))
    }
}

struct InstrumentedConnection {
    inner: Box<dyn Connection>,
    probe: Arc<Probe>,
}

impl Connection for InstrumentedConnection {
    fn path(&self) -> &Path {
        self.inner.path()
    }

    fn begin_read(&mut self) -> StorageResult<()> {
        self.inner.begin_read()
    }

    fn end_read(&mut self) {
        self.inner.end_read()
    }

    fn has_changed(&self) -> bool {
        self.inner.has_changed()
    }

    fn advance_read(&mut self) -> StorageResult<bool> {
        self.inner.advance_read()
    }

    fn begin_write(&mut self) -> StorageResult<()> {
        self.probe.begin_writes.fetch_add(1, Ordering::SeqCst);
        if self.probe.fail_begin_write.load(Ordering::SeqCst) {
            return Err(StorageError::InvalidState("injected begin_write failure".into()));
        }
        self.inner.begin_write()
    }

    fn commit(&mut self) -> StorageResult<u64> {
        if self.probe.fail_commit.load(Ordering::SeqCst) {
            self.inner.rollback()?;
            return Err(StorageError::InvalidState("injected commit failure".into()));
        }
        self.probe.commits.fetch_add(1, Ordering::SeqCst);
        self.inner.commit()
    }

    fn rollback(&mut self) -> StorageResult<()> {
        self.probe.rollbacks.fetch_add(1, Ordering::SeqCst);
        self.inner.rollback()
    }

    fn is_in_write(&self) -> bool {
        self.inner.is_in_write()
    }

    fn group(&mut self) -> StorageResult<&Group> {
        self.inner.group()
    }

    fn group_mut(&mut self) -> StorageResult<&mut Group> {
        self.inner.group_mut()
    }

    fn compact(&mut self) -> StorageResult<bool> {
        self.inner.compact()
    }
}
