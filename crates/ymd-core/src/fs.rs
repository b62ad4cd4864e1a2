//! File system abstraction for testability.
//!
//! The place stage and the cleanup pass go through [`FileSystem`] so that
//! collisions, exclusive reservations and cross-device moves can be tested
//! without touching a real disk.
//!
//! # Example
//!
//! ```rust,ignore
//! use ymd_core::fs::{FileSystem, RealFileSystem};
//!
//! let fs = RealFileSystem::new();
//! fs.create_dir_all(Path::new("/music/Rock/Queen"))?;
//! fs.create_new(Path::new("/music/Rock/Queen/Queen - Bohemian Rhapsody.mp3"))?;
//! ```

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{Error, FileSystemError, Result};

/// `EXDEV` on Linux and macOS.
#[cfg(unix)]
const CROSS_DEVICE_OS_ERROR: i32 = 18;

/// `ERROR_NOT_SAME_DEVICE` on Windows.
#[cfg(windows)]
const CROSS_DEVICE_OS_ERROR: i32 = 17;

fn read_error(path: &Path, e: io::Error) -> Error {
    Error::FileSystem(FileSystemError::ReadFailed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn write_error(path: &Path, e: io::Error) -> Error {
    Error::FileSystem(FileSystemError::WriteFailed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn create_dir_error(path: &Path, e: io::Error) -> Error {
    Error::FileSystem(FileSystemError::CreateDirFailed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn delete_error(path: &Path, e: io::Error) -> Error {
    Error::FileSystem(FileSystemError::DeleteFailed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn copy_error(src: &Path, dst: &Path, e: io::Error) -> Error {
    Error::FileSystem(FileSystemError::CopyFailed {
        source_path: src.to_path_buf(),
        destination: dst.to_path_buf(),
        reason: e.to_string(),
    })
}

fn rename_error(from: &Path, to: &Path, e: io::Error) -> Error {
    let cross_device = is_cross_device(&e);
    Error::FileSystem(FileSystemError::RenameFailed {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        reason: e.to_string(),
        cross_device,
    })
}

#[cfg(any(unix, windows))]
fn is_cross_device(e: &io::Error) -> bool {
    e.raw_os_error() == Some(CROSS_DEVICE_OS_ERROR)
}

#[cfg(not(any(unix, windows)))]
const fn is_cross_device(_e: &io::Error) -> bool {
    false
}

/// Abstraction over the file system operations used by placement and cleanup.
#[cfg_attr(test, mockall::automock)]
pub trait FileSystem: Send + Sync {
    /// Whether a path exists.
    fn exists(&self, path: &Path) -> bool;

    /// Whether a path is a regular file.
    fn is_file(&self, path: &Path) -> bool;

    /// Whether a path is a directory.
    fn is_dir(&self, path: &Path) -> bool;

    /// Create a directory and all missing parents.
    fn create_dir_all(&self, path: &Path) -> Result<()>;

    /// Create an empty file, failing with [`FileSystemError::AlreadyExists`]
    /// if anything is already at `path`. Atomic with respect to other callers.
    fn create_new(&self, path: &Path) -> Result<()>;

    /// Read a file's contents.
    fn read(&self, path: &Path) -> Result<Vec<u8>>;

    /// Write bytes to a file, replacing it.
    fn write_bytes(&self, path: &Path, contents: &[u8]) -> Result<()>;

    /// Rename within one storage device, replacing `to` if it is a file.
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    /// Copy a file, replacing `dst` if it is a file.
    fn copy(&self, src: &Path, dst: &Path) -> Result<u64>;

    /// Remove a file.
    fn remove_file(&self, path: &Path) -> Result<()>;

    /// Remove an empty directory.
    fn remove_dir(&self, path: &Path) -> Result<()>;

    /// Remove a directory and its contents.
    fn remove_dir_all(&self, path: &Path) -> Result<()>;

    /// Direct children of a directory.
    fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>>;
}

/// Real file system implementation using `std::fs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealFileSystem;

impl RealFileSystem {
    /// Create a new real file system instance.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl FileSystem for RealFileSystem {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_file(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path).map_err(|e| create_dir_error(path, e))
    }

    fn create_new(&self, path: &Path) -> Result<()> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(Error::FileSystem(FileSystemError::AlreadyExists {
                    path: path.to_path_buf(),
                }))
            }
            Err(e) => Err(write_error(path, e)),
        }
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        fs::read(path).map_err(|e| read_error(path, e))
    }

    fn write_bytes(&self, path: &Path, contents: &[u8]) -> Result<()> {
        fs::write(path, contents).map_err(|e| write_error(path, e))
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        fs::rename(from, to).map_err(|e| rename_error(from, to, e))
    }

    fn copy(&self, src: &Path, dst: &Path) -> Result<u64> {
        fs::copy(src, dst).map_err(|e| copy_error(src, dst, e))
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        fs::remove_file(path).map_err(|e| delete_error(path, e))
    }

    fn remove_dir(&self, path: &Path) -> Result<()> {
        fs::remove_dir(path).map_err(|e| delete_error(path, e))
    }

    fn remove_dir_all(&self, path: &Path) -> Result<()> {
        fs::remove_dir_all(path).map_err(|e| delete_error(path, e))
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let entries = fs::read_dir(path).map_err(|e| read_error(path, e))?;
        Ok(entries.flatten().map(|e| e.path()).collect())
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
pub mod mock {
    //! In-memory file system with fault injection.

    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::{Arc, RwLock};

    /// In-memory file system. Clones share state.
    #[derive(Debug, Clone, Default)]
    pub struct MemoryFileSystem {
        files: Arc<RwLock<HashMap<PathBuf, Vec<u8>>>>,
        dirs: Arc<RwLock<HashSet<PathBuf>>>,
        faults: Arc<RwLock<Faults>>,
    }

    #[derive(Debug, Default)]
    struct Faults {
        cross_device_renames: bool,
        failing_renames: bool,
        failing_copies: bool,
        failing_dirs: HashSet<PathBuf>,
    }

    impl MemoryFileSystem {
        /// Create an empty file system.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Add a file, creating parents.
        pub fn add_file(&self, path: impl AsRef<Path>, contents: &[u8]) {
            let path = path.as_ref().to_path_buf();
            if let Some(parent) = path.parent() {
                self.add_dir(parent);
            }
            self.files
                .write()
                .expect("lock poisoned")
                .insert(path, contents.to_vec());
        }

        /// Add a directory and its ancestors.
        pub fn add_dir(&self, path: impl AsRef<Path>) {
            let mut dirs = self.dirs.write().expect("lock poisoned");
            for ancestor in path.as_ref().ancestors() {
                if ancestor.as_os_str().is_empty() {
                    break;
                }
                dirs.insert(ancestor.to_path_buf());
            }
        }

        /// Every rename fails as if crossing devices.
        pub fn fail_renames_cross_device(&self) {
            self.faults.write().expect("lock poisoned").cross_device_renames = true;
        }

        /// Every rename fails with a plain error.
        pub fn fail_renames(&self) {
            self.faults.write().expect("lock poisoned").failing_renames = true;
        }

        /// Every copy fails.
        pub fn fail_copies(&self) {
            self.faults.write().expect("lock poisoned").failing_copies = true;
        }

        /// Creating `path` as a directory fails.
        pub fn fail_create_dir(&self, path: impl AsRef<Path>) {
            self.faults
                .write()
                .expect("lock poisoned")
                .failing_dirs
                .insert(path.as_ref().to_path_buf());
        }

        /// All file paths, sorted.
        #[must_use]
        pub fn list_all_files(&self) -> Vec<PathBuf> {
            let mut files: Vec<PathBuf> = self
                .files
                .read()
                .expect("lock poisoned")
                .keys()
                .cloned()
                .collect();
            files.sort();
            files
        }

        fn not_found(path: &Path) -> Error {
            Error::FileSystem(FileSystemError::NotFound {
                path: path.to_path_buf(),
            })
        }
    }

    impl FileSystem for MemoryFileSystem {
        fn exists(&self, path: &Path) -> bool {
            self.is_file(path) || self.is_dir(path)
        }

        fn is_file(&self, path: &Path) -> bool {
            self.files.read().expect("lock poisoned").contains_key(path)
        }

        fn is_dir(&self, path: &Path) -> bool {
            self.dirs.read().expect("lock poisoned").contains(path)
        }

        fn create_dir_all(&self, path: &Path) -> Result<()> {
            let failing = self
                .faults
                .read()
                .expect("lock poisoned")
                .failing_dirs
                .contains(path);
            if failing {
                return Err(Error::FileSystem(FileSystemError::CreateDirFailed {
                    path: path.to_path_buf(),
                    reason: "permission denied".to_string(),
                }));
            }
            self.add_dir(path);
            Ok(())
        }

        fn create_new(&self, path: &Path) -> Result<()> {
            let dirs = self.dirs.read().expect("lock poisoned");
            let mut files = self.files.write().expect("lock poisoned");
            if files.contains_key(path) || dirs.contains(path) {
                return Err(Error::FileSystem(FileSystemError::AlreadyExists {
                    path: path.to_path_buf(),
                }));
            }
            if let Some(parent) = path.parent()
                && !dirs.contains(parent)
            {
                return Err(Self::not_found(parent));
            }
            files.insert(path.to_path_buf(), Vec::new());
            Ok(())
        }

        fn read(&self, path: &Path) -> Result<Vec<u8>> {
            self.files
                .read()
                .expect("lock poisoned")
                .get(path)
                .cloned()
                .ok_or_else(|| Self::not_found(path))
        }

        fn write_bytes(&self, path: &Path, contents: &[u8]) -> Result<()> {
            self.add_file(path, contents);
            Ok(())
        }

        fn rename(&self, from: &Path, to: &Path) -> Result<()> {
            {
                let faults = self.faults.read().expect("lock poisoned");
                if faults.cross_device_renames || faults.failing_renames {
                    return Err(Error::FileSystem(FileSystemError::RenameFailed {
                        from: from.to_path_buf(),
                        to: to.to_path_buf(),
                        reason: "rename refused".to_string(),
                        cross_device: faults.cross_device_renames,
                    }));
                }
            }
            let contents = self
                .files
                .write()
                .expect("lock poisoned")
                .remove(from)
                .ok_or_else(|| Self::not_found(from))?;
            self.add_file(to, &contents);
            Ok(())
        }

        fn copy(&self, src: &Path, dst: &Path) -> Result<u64> {
            if self.faults.read().expect("lock poisoned").failing_copies {
                return Err(Error::FileSystem(FileSystemError::CopyFailed {
                    source_path: src.to_path_buf(),
                    destination: dst.to_path_buf(),
                    reason: "device full".to_string(),
                }));
            }
            let contents = self.read(src)?;
            self.add_file(dst, &contents);
            Ok(contents.len() as u64)
        }

        fn remove_file(&self, path: &Path) -> Result<()> {
            self.files
                .write()
                .expect("lock poisoned")
                .remove(path)
                .map(|_| ())
                .ok_or_else(|| Self::not_found(path))
        }

        fn remove_dir(&self, path: &Path) -> Result<()> {
            if !self.read_dir(path)?.is_empty() {
                return Err(Error::FileSystem(FileSystemError::DeleteFailed {
                    path: path.to_path_buf(),
                    reason: "directory not empty".to_string(),
                }));
            }
            self.dirs.write().expect("lock poisoned").remove(path);
            Ok(())
        }

        fn remove_dir_all(&self, path: &Path) -> Result<()> {
            self.files
                .write()
                .expect("lock poisoned")
                .retain(|p, _| !p.starts_with(path));
            self.dirs
                .write()
                .expect("lock poisoned")
                .retain(|p| !p.starts_with(path));
            Ok(())
        }

        fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
            if !self.is_dir(path) {
                return Err(Self::not_found(path));
            }
            let files = self.files.read().expect("lock poisoned");
            let dirs = self.dirs.read().expect("lock poisoned");
            let mut entries: Vec<PathBuf> = files
                .keys()
                .chain(dirs.iter())
                .filter(|p| p.parent() == Some(path) && p.as_path() != path)
                .cloned()
                .collect();
            entries.sort();
            entries.dedup();
            Ok(entries)
        }
    }
}
