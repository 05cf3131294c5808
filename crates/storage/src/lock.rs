//! Lock file guarding a database file
//!
//! Every connection to an on-disk database holds a shared `fs2` lock on
//! `<file>.lock` for its whole lifetime. The lock file records the layout
//! tag of the process that created it; a process whose tag differs (pointer
//! width, endianness or lock format) cannot share the file and gets
//! `IncompatibleLockFile`.
//!
//! The first opener (the one able to take the lock exclusively) rewrites
//! the tag, then downgrades to a shared lock.

use crate::error::{StorageError, StorageResult};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Lock format version, part of the layout tag
pub const LOCK_FORMAT_VERSION: u32 = 1;

/// Layout tag written by this build
pub fn layout_tag() -> String {
    let endian = if cfg!(target_endian = "little") {
        "le"
    } else {
        "be"
    };
    format!("shoal-lock/{}/{}/{}", LOCK_FORMAT_VERSION, usize::BITS, endian)
}

/// Path of the lock file for a database file
pub fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

/// Held shared lock; released on drop
#[derive(Debug)]
pub struct LockFile {
    file: File,
    path: PathBuf,
}

impl LockFile {
    /// Acquire the lock file for the database at `db_path`
    pub fn acquire(db_path: &Path) -> StorageResult<Self> {
        let path = lock_path(db_path);
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| StorageError::from_io(&path, e))?;

        let expected = layout_tag();

        if FileExt::try_lock_exclusive(&file).is_ok() {
            // Nobody else has the file open: stamp our layout.
            let stamped = stamp(&mut file, &expected);
            let _ = FileExt::unlock(&file);
            stamped.map_err(|e| StorageError::from_io(&path, e))?;
            debug!(target: "shoal::storage", path = %path.display(), "Stamped lock file");
        }

        FileExt::lock_shared(&file).map_err(|e| StorageError::from_io(&path, e))?;

        let found = read_tag(&mut file).map_err(|e| StorageError::from_io(&path, e))?;
        if found != expected {
            let _ = FileExt::unlock(&file);
            return Err(StorageError::IncompatibleLockFile {
                path,
                found,
                expected,
            });
        }

        Ok(Self { file, path })
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn stamp(file: &mut File, tag: &str) -> std::io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(tag.as_bytes())?;
    file.sync_all()
}

fn read_tag(file: &mut File) -> std::io::Result<String> {
    let mut content = String::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_string(&mut content)?;
    Ok(content.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lock_path_appends_suffix() {
        assert_eq!(
            lock_path(Path::new("/tmp/a.shoal")),
            PathBuf::from("/tmp/a.shoal.lock")
        );
    }

    #[test]
    fn test_acquire_stamps_layout() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("a.shoal");
        let lock = LockFile::acquire(&db).unwrap();
        let content = std::fs::read_to_string(lock.path()).unwrap();
        assert_eq!(content, layout_tag());
    }

    #[test]
    fn test_two_holders_share_the_lock() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("a.shoal");
        let first = LockFile::acquire(&db).unwrap();
        let second = LockFile::acquire(&db).unwrap();
        assert_eq!(first.path(), second.path());
    }

    #[test]
    fn test_foreign_layout_rejected_while_held() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("a.shoal");
        let lock_file_path = lock_path(&db);
        std::fs::write(&lock_file_path, "shoal-lock/1/16/be").unwrap();

        // Simulate the foreign process still holding its shared lock.
        let foreign = File::open(&lock_file_path).unwrap();
        FileExt::lock_shared(&foreign).unwrap();

        let err = LockFile::acquire(&db).unwrap_err();
        assert!(matches!(err, StorageError::IncompatibleLockFile { .. }));

        FileExt::unlock(&foreign).unwrap();
    }

    #[test]
    fn test_stale_foreign_layout_is_restamped() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("a.shoal");
        std::fs::write(lock_path(&db), "shoal-lock/1/16/be").unwrap();

        // No holder: the stale tag is overwritten.
        let lock = LockFile::acquire(&db).unwrap();
        assert_eq!(std::fs::read_to_string(lock.path()).unwrap(), layout_tag());
    }
}
