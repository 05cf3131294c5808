//! Default single-file storage engine
//!
//! All connections to one file within the process share a [`SharedFile`]:
//! the latest committed snapshot, the commit counter and the single-writer
//! gate. The registry holds weak references only, so a file's shared state
//! lives exactly as long as some connection to it.
//!
//! On-disk files are rewritten in full on every commit (see
//! [`crate::format`]). In-memory files never touch the filesystem and
//! vanish with their last connection.
//!
//! Changes committed by other processes are not observed until the file is
//! reopened; cross-process change detection is outside this engine.

use crate::engine::{Connection, EngineOptions, OpenMode, StorageEngine};
use crate::error::{StorageError, StorageResult};
use crate::format::{self, key_fingerprint, FileImage};
use crate::group::Group;
use crate::lock::LockFile;
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tracing::{debug, info};

/// Registry of files open in this process (path -> weak shared state)
static SHARED_FILES: Lazy<Mutex<HashMap<PathBuf, Weak<SharedFile>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Latest committed state of a file
#[derive(Debug, Clone)]
struct Snapshot {
    version: u64,
    group: Arc<Group>,
}

/// State shared by every connection to one file
#[derive(Debug)]
struct SharedFile {
    path: PathBuf,
    in_memory: bool,
    key_fingerprint: u64,
    latest: Mutex<Snapshot>,
    /// true while some connection holds the write transaction
    writer_active: Mutex<bool>,
    writer_released: Condvar,
}

impl SharedFile {
    fn new(path: PathBuf, in_memory: bool, image: FileImage) -> Self {
        Self {
            path,
            in_memory,
            key_fingerprint: image.key_fingerprint,
            latest: Mutex::new(Snapshot {
                version: image.commit_version,
                group: Arc::new(image.group),
            }),
            writer_active: Mutex::new(false),
            writer_released: Condvar::new(),
        }
    }

    fn latest(&self) -> Snapshot {
        self.latest.lock().clone()
    }

    fn acquire_writer(&self) {
        let mut active = self.writer_active.lock();
        while *active {
            self.writer_released.wait(&mut active);
        }
        *active = true;
    }

    fn release_writer(&self) {
        *self.writer_active.lock() = false;
        self.writer_released.notify_one();
    }

    fn publish(&self, group: Group) -> StorageResult<u64> {
        let version = self.latest.lock().version + 1;
        if !self.in_memory {
            format::write_file(
                &self.path,
                &FileImage {
                    commit_version: version,
                    key_fingerprint: self.key_fingerprint,
                    group: group.clone(),
                },
            )?;
        }
        *self.latest.lock() = Snapshot {
            version,
            group: Arc::new(group),
        };
        Ok(version)
    }
}

static DEFAULT_ENGINE: Lazy<Arc<dyn StorageEngine>> = Lazy::new(|| Arc::new(FileEngine));

/// Shared instance of the default engine
pub fn default_engine() -> Arc<dyn StorageEngine> {
    Arc::clone(&DEFAULT_ENGINE)
}

/// The default engine: one file (or in-memory image) per path
#[derive(Debug, Default, Clone, Copy)]
pub struct FileEngine;

impl FileEngine {
    /// Create the engine
    pub fn new() -> Self {
        FileEngine
    }

    /// Number of connections currently open to `path` in this process
    pub fn connection_count(path: &Path) -> usize {
        let key = registry_key(path, false);
        SHARED_FILES
            .lock()
            .get(&key)
            .map(Weak::strong_count)
            .unwrap_or(0)
    }

    fn shared_file(path: &Path, options: &EngineOptions) -> StorageResult<Arc<SharedFile>> {
        let key = registry_key(path, options.in_memory);
        let fingerprint = key_fingerprint(options.encryption_key.as_deref());

        // Held across the load so two first-openers cannot both read the file.
        let mut registry = SHARED_FILES.lock();
        registry.retain(|_, weak| weak.strong_count() > 0);

        if let Some(shared) = registry.get(&key).and_then(Weak::upgrade) {
            if shared.in_memory != options.in_memory {
                return Err(StorageError::InvalidState(format!(
                    "'{}' is already open {}",
                    path.display(),
                    if shared.in_memory {
                        "in memory"
                    } else {
                        "on disk"
                    }
                )));
            }
            if options.open_mode == OpenMode::CreateNew {
                return Err(StorageError::FileExists {
                    path: path.to_path_buf(),
                });
            }
            if shared.key_fingerprint != fingerprint {
                return Err(StorageError::EncryptionKeyMismatch {
                    path: path.to_path_buf(),
                });
            }
            debug!(target: "shoal::storage", path = %path.display(), "Joined open file");
            return Ok(shared);
        }

        let image = if options.in_memory {
            if options.read_only || options.open_mode == OpenMode::MustExist {
                return Err(StorageError::FileNotFound {
                    path: path.to_path_buf(),
                });
            }
            empty_image(fingerprint)
        } else {
            load_or_create(path, options, fingerprint)?
        };

        if image.key_fingerprint != fingerprint {
            return Err(StorageError::EncryptionKeyMismatch {
                path: path.to_path_buf(),
            });
        }

        info!(
            target: "shoal::storage",
            path = %path.display(),
            in_memory = options.in_memory,
            commit_version = image.commit_version,
            "Opened database file"
        );

        let shared = Arc::new(SharedFile::new(path.to_path_buf(), options.in_memory, image));
        registry.insert(key, Arc::downgrade(&shared));
        Ok(shared)
    }
}

impl StorageEngine for FileEngine {
    fn open(&self, path: &Path, options: &EngineOptions) -> StorageResult<Box<dyn Connection>> {
        // Lock first so an incompatible process is detected before reading.
        let lock = if options.in_memory {
            None
        } else {
            Some(LockFile::acquire(path)?)
        };
        let shared = Self::shared_file(path, options)?;
        Ok(Box::new(FileConnection {
            shared,
            path: path.to_path_buf(),
            read_only: options.read_only,
            read_view: None,
            write: None,
            _lock: lock,
        }))
    }
}

fn empty_image(key_fingerprint: u64) -> FileImage {
    FileImage {
        commit_version: 0,
        key_fingerprint,
        group: Group::new(),
    }
}

fn load_or_create(path: &Path, options: &EngineOptions, fingerprint: u64) -> StorageResult<FileImage> {
    let exists = path.exists();

    if exists && options.open_mode == OpenMode::CreateNew {
        return Err(StorageError::FileExists {
            path: path.to_path_buf(),
        });
    }
    if !exists && (options.read_only || options.open_mode == OpenMode::MustExist) {
        return Err(StorageError::FileNotFound {
            path: path.to_path_buf(),
        });
    }

    if exists {
        // Probe the access mode before reading so permission problems are
        // reported as such rather than as a generic read failure.
        OpenOptions::new()
            .read(true)
            .write(!options.read_only)
            .open(path)
            .map_err(|e| StorageError::from_io(path, e))?;
        return format::read_file(path);
    }

    let image = empty_image(fingerprint);
    format::write_file(path, &image)?;
    Ok(image)
}

/// Registry key: the parent directory is canonicalized so different
/// spellings of one path share state even before the file exists
fn registry_key(path: &Path, in_memory: bool) -> PathBuf {
    if in_memory {
        return path.to_path_buf();
    }
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    match (parent.canonicalize(), path.file_name()) {
        (Ok(dir), Some(name)) => dir.join(name),
        _ => path.to_path_buf(),
    }
}

/// A connection produced by [`FileEngine`]
#[derive(Debug)]
pub struct FileConnection {
    shared: Arc<SharedFile>,
    path: PathBuf,
    read_only: bool,
    read_view: Option<Snapshot>,
    write: Option<Group>,
    _lock: Option<LockFile>,
}

impl Connection for FileConnection {
    fn path(&self) -> &Path {
        &self.path
    }

    fn begin_read(&mut self) -> StorageResult<()> {
        if self.read_view.is_none() {
            self.read_view = Some(self.shared.latest());
        }
        Ok(())
    }

    fn end_read(&mut self) {
        if self.write.is_none() {
            self.read_view = None;
        }
    }

    fn has_changed(&self) -> bool {
        match &self.read_view {
            Some(view) => view.version != self.shared.latest.lock().version,
            None => false,
        }
    }

    fn advance_read(&mut self) -> StorageResult<bool> {
        if self.write.is_some() {
            return Err(StorageError::InvalidState(
                "cannot advance the read view inside a write transaction".to_string(),
            ));
        }
        let latest = self.shared.latest();
        let moved = self
            .read_view
            .as_ref()
            .map_or(false, |view| view.version != latest.version);
        self.read_view = Some(latest);
        Ok(moved)
    }

    fn begin_write(&mut self) -> StorageResult<()> {
        if self.read_only {
            return Err(StorageError::ReadOnly {
                path: self.path.clone(),
            });
        }
        if self.write.is_some() {
            return Err(StorageError::InvalidState(
                "write transaction already open".to_string(),
            ));
        }
        self.shared.acquire_writer();
        let latest = self.shared.latest();
        self.write = Some((*latest.group).clone());
        self.read_view = Some(latest);
        Ok(())
    }

    fn commit(&mut self) -> StorageResult<u64> {
        let Some(group) = self.write.take() else {
            return Err(StorageError::InvalidState(
                "cannot commit outside a write transaction".to_string(),
            ));
        };
        let result = self.shared.publish(group);
        self.shared.release_writer();
        let version = result?;
        self.read_view = Some(self.shared.latest());
        debug!(target: "shoal::storage", path = %self.path.display(), version, "Committed");
        Ok(version)
    }

    fn rollback(&mut self) -> StorageResult<()> {
        if self.write.take().is_none() {
            return Err(StorageError::InvalidState(
                "cannot roll back outside a write transaction".to_string(),
            ));
        }
        self.shared.release_writer();
        Ok(())
    }

    fn is_in_write(&self) -> bool {
        self.write.is_some()
    }

    fn group(&mut self) -> StorageResult<&Group> {
        if self.write.is_none() {
            self.begin_read()?;
        }
        if let Some(group) = &self.write {
            return Ok(group);
        }
        match &self.read_view {
            Some(view) => Ok(&view.group),
            None => Err(StorageError::InvalidState("no read view".into())),
        }
    }

    fn group_mut(&mut self) -> StorageResult<&mut Group> {
        self.write.as_mut().ok_or_else(|| {
            StorageError::InvalidState("cannot modify data outside a write transaction".into())
        })
    }

    fn compact(&mut self) -> StorageResult<bool> {
        if self.write.is_some() {
            return Err(StorageError::InvalidState(
                "cannot compact inside a write transaction".to_string(),
            ));
        }
        if Arc::strong_count(&self.shared) > 1 {
            return Ok(false);
        }
        if self.shared.in_memory {
            return Ok(true);
        }

        self.shared.acquire_writer();
        let latest = self.shared.latest();
        let mut group = (*latest.group).clone();
        group.optimize();
        let result = format::write_file(
            &self.path,
            &FileImage {
                commit_version: latest.version,
                key_fingerprint: self.shared.key_fingerprint,
                group,
            },
        );
        self.shared.release_writer();
        result?;
        self.read_view = Some(latest);
        info!(target: "shoal::storage", path = %self.path.display(), "Compacted database file");
        Ok(true)
    }
}

impl Drop for FileConnection {
    fn drop(&mut self) {
        if self.write.take().is_some() {
            self.shared.release_writer();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::Column;
    use shoal_core::{PropertyType, Value};
    use tempfile::TempDir;

    fn open(path: &Path) -> Box<dyn Connection> {
        FileEngine::new()
            .open(path, &EngineOptions::default())
            .unwrap()
    }

    fn open_err(engine: &FileEngine, path: &Path, options: &EngineOptions) -> StorageError {
        match engine.open(path, options) {
            Ok(_) => panic!("open of {} succeeded", path.display()),
            Err(e) => e,
        }
    }

    fn write_person(conn: &mut dyn Connection, name: &str) {
        conn.begin_write().unwrap();
        let group = conn.group_mut().unwrap();
        let table = group.get_or_add_table("Person");
        if table.columns().is_empty() {
            table
                .add_column(
                    Column {
                        name: "name".into(),
                        kind: PropertyType::String,
                        nullable: false,
                        indexed: false,
                    },
                    "".into(),
                )
                .unwrap();
        }
        table.add_row(vec![Value::from(name)]).unwrap();
        conn.commit().unwrap();
    }

    #[test]
    fn test_open_creates_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.shoal");
        let mut conn = open(&path);
        assert!(path.exists());
        assert_eq!(conn.schema_version().unwrap(), None);
    }

    #[test]
    fn test_commit_visible_to_other_connection_after_advance() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.shoal");
        let mut writer = open(&path);
        let mut reader = open(&path);
        reader.begin_read().unwrap();

        write_person(writer.as_mut(), "alice");

        assert!(reader.has_changed());
        assert!(reader.group().unwrap().table("Person").is_none());
        assert!(reader.advance_read().unwrap());
        assert_eq!(
            reader.group().unwrap().table("Person").unwrap().row_count(),
            1
        );
        assert!(!reader.has_changed());
        assert!(!reader.advance_read().unwrap());
    }

    #[test]
    fn test_rollback_discards_changes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.shoal");
        let mut conn = open(&path);
        conn.begin_write().unwrap();
        conn.group_mut().unwrap().set_schema_version(5);
        conn.rollback().unwrap();
        assert_eq!(conn.schema_version().unwrap(), None);
        assert!(!conn.is_in_write());
    }

    #[test]
    fn test_data_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.shoal");
        {
            let mut conn = open(&path);
            write_person(conn.as_mut(), "alice");
        }
        assert_eq!(FileEngine::connection_count(&path), 0);
        let mut conn = open(&path);
        assert_eq!(
            conn.group().unwrap().table("Person").unwrap().row_count(),
            1
        );
    }

    #[test]
    fn test_open_modes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.shoal");
        let engine = FileEngine::new();

        let must_exist = EngineOptions {
            open_mode: OpenMode::MustExist,
            ..Default::default()
        };
        assert!(matches!(
            open_err(&engine, &path, &must_exist),
            StorageError::FileNotFound { .. }
        ));

        let read_only = EngineOptions {
            read_only: true,
            ..Default::default()
        };
        assert!(matches!(
            open_err(&engine, &path, &read_only),
            StorageError::FileNotFound { .. }
        ));

        drop(open(&path));
        let create_new = EngineOptions {
            open_mode: OpenMode::CreateNew,
            ..Default::default()
        };
        assert!(matches!(
            open_err(&engine, &path, &create_new),
            StorageError::FileExists { .. }
        ));
    }

    #[test]
    fn test_read_only_connection_rejects_writes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.shoal");
        drop(open(&path));
        let mut conn = FileEngine::new()
            .open(
                &path,
                &EngineOptions {
                    read_only: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(matches!(
            conn.begin_write().unwrap_err(),
            StorageError::ReadOnly { .. }
        ));
    }

    #[test]
    fn test_encryption_key_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.shoal");
        let keyed = EngineOptions {
            encryption_key: Some(vec![1u8; 64]),
            ..Default::default()
        };
        drop(FileEngine::new().open(&path, &keyed).unwrap());

        let other_key = EngineOptions {
            encryption_key: Some(vec![2u8; 64]),
            ..Default::default()
        };
        assert!(matches!(
            open_err(&FileEngine::new(), &path, &other_key),
            StorageError::EncryptionKeyMismatch { .. }
        ));
        assert!(FileEngine::new().open(&path, &keyed).is_ok());
    }

    #[test]
    fn test_in_memory_state_shared_then_dropped() {
        let path = PathBuf::from("memory-only-test.shoal");
        let mem = EngineOptions {
            in_memory: true,
            ..Default::default()
        };
        {
            let mut a = FileEngine::new().open(&path, &mem).unwrap();
            let mut b = FileEngine::new().open(&path, &mem).unwrap();
            write_person(a.as_mut(), "alice");
            assert_eq!(
                b.group().unwrap().table("Person").unwrap().row_count(),
                1
            );
        }
        assert!(!path.exists());
        let mut fresh = FileEngine::new().open(&path, &mem).unwrap();
        assert!(fresh.group().unwrap().table("Person").is_none());
    }

    #[test]
    fn test_compact_refused_with_other_connections() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.shoal");
        let mut a = open(&path);
        write_person(a.as_mut(), "alice");

        let b = open(&path);
        assert!(!a.compact().unwrap());
        drop(b);
        assert!(a.compact().unwrap());
        assert_eq!(a.group().unwrap().table("Person").unwrap().row_count(), 1);
    }

    #[test]
    fn test_writers_are_serialized() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.shoal");
        drop(open(&path));

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let mut conn = open(&path);
                    for j in 0..10 {
                        write_person(conn.as_mut(), &format!("t{}-{}", i, j));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let mut conn = open(&path);
        assert_eq!(
            conn.group().unwrap().table("Person").unwrap().row_count(),
            40
        );
    }
}
