//! Atomic file replacement and cross-process file locks.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use fs2::FileExt;
use tempfile::NamedTempFile;

/// Write `contents` to `path` so readers see either the old file or the new
/// one, never a partial write.
///
/// The data goes to a hidden temp file in the same directory, is synced, and
/// is then renamed over the target.
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let parent = parent_dir(path);
    std::fs::create_dir_all(parent)?;

    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

/// Exclusive advisory lock on `<target>.lock`, released on drop.
///
/// Every process sharing a snapshot file takes this lock around its
/// read-modify-write cycle.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Block until the lock for `target` is held.
    pub fn acquire(target: &Path) -> io::Result<Self> {
        let path = lock_path_for(target);
        std::fs::create_dir_all(parent_dir(&path))?;
        let file = OpenOptions::new().read(true).write(true).create(true).open(&path)?;
        file.lock_exclusive()?;
        Ok(Self { file, path })
    }

    /// Take the lock only if no one else holds it.
    pub fn try_acquire(target: &Path) -> io::Result<Option<Self>> {
        let path = lock_path_for(target);
        std::fs::create_dir_all(parent_dir(&path))?;
        let file = OpenOptions::new().read(true).write(true).create(true).open(&path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { file, path })),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // The lock file itself stays; removing it would race other lockers.
        let _ = FileExt::unlock(&self.file);
    }
}

fn lock_path_for(target: &Path) -> PathBuf {
    let mut name = target.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".lock");
    target.with_file_name(name)
}

/// Identity of a file's current contents, cheap to compare.
///
/// Atomic replacement gives each write a new inode on unix, so two writes in
/// the same mtime tick still differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    len: u64,
    modified: Option<SystemTime>,
    inode: u64,
}

impl FileStamp {
    /// Stamp of `path`, or `None` if it does not exist.
    pub fn of(path: &Path) -> io::Result<Option<Self>> {
        let meta = match std::fs::metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        #[cfg(unix)]
        let inode = std::os::unix::fs::MetadataExt::ino(&meta);
        #[cfg(not(unix))]
        let inode = 0;

        Ok(Some(Self {
            len: meta.len(),
            modified: meta.modified().ok(),
            inode,
        }))
    }
}
