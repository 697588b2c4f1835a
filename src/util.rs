//! Byte-level I/O helpers
//!
//! Atomic write-temp-then-rename, permission cloning, numeric pointer
//! files, and RAII advisory file locks.  Everything here reports errors
//! with the offending path attached.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::{FsError, Result};

/// Read a whole file into memory.
pub fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| FsError::io(path, e))
}

/// Read a whole file as UTF-8 text.
pub fn read_text_file(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| FsError::io(path, e))
}

/// Create a file with the given contents, failing if it already exists.
pub fn create_file(path: &Path, contents: &[u8]) -> Result<()> {
    let mut f = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| FsError::io(path, e))?;
    f.write_all(contents).map_err(|e| FsError::io(path, e))?;
    Ok(())
}

/// Atomically replace `path` with `contents`: write a sibling temp file,
/// fsync it, rename into place.  If `perms_from` is given, the new file
/// borrows that file's permissions.
pub fn write_atomic(path: &Path, contents: &[u8], perms_from: Option<&Path>) -> Result<()> {
    // Append rather than replace an "extension": dotted names such as
    // `node._1.0` must not collapse onto each other's temp files.
    let mut tmp_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    {
        let mut f = File::create(&tmp_path).map_err(|e| FsError::io(&tmp_path, e))?;
        f.write_all(contents).map_err(|e| FsError::io(&tmp_path, e))?;
        f.sync_all().map_err(|e| FsError::io(&tmp_path, e))?;
    }
    if let Some(src) = perms_from {
        copy_perms(src, &tmp_path)?;
    }
    fs::rename(&tmp_path, path).map_err(|e| FsError::io(path, e))?;
    Ok(())
}

/// Move `from` into place as `to`, borrowing permissions from
/// `perms_from` when it exists.  The rename is the commit point.
pub fn move_into_place(from: &Path, to: &Path, perms_from: Option<&Path>) -> Result<()> {
    if let Some(src) = perms_from {
        if src.exists() {
            copy_perms(src, from)?;
        }
    }
    fs::rename(from, to).map_err(|e| FsError::io(to, e))?;
    // Make the rename durable: fsync the containing directory.
    if let Some(parent) = to.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

/// Clone the permission bits of `src` onto `dst`.
pub fn copy_perms(src: &Path, dst: &Path) -> Result<()> {
    let meta = fs::metadata(src).map_err(|e| FsError::io(src, e))?;
    fs::set_permissions(dst, meta.permissions()).map_err(|e| FsError::io(dst, e))?;
    Ok(())
}

/// Create a directory if it does not exist yet, cloning the permissions
/// of `perms_from` when the directory is new.
pub fn ensure_dir(path: &Path, perms_from: Option<&Path>) -> Result<bool> {
    match fs::create_dir(path) {
        Ok(()) => {
            if let Some(src) = perms_from {
                copy_perms(src, path)?;
            }
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(FsError::io(path, e)),
    }
}

pub fn ensure_dir_all(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| FsError::io(path, e))
}

/// Copy a single regular file, replacing any existing destination.
pub fn copy_file(src: &Path, dst: &Path) -> Result<()> {
    fs::copy(src, dst).map_err(|e| FsError::io(dst, e))?;
    Ok(())
}

/// Skip-copy helper for hot-copy: recopy only when `(size, mtime)` of an
/// existing destination differ from the source.
pub fn copy_file_unless_same(src: &Path, dst: &Path) -> Result<()> {
    if let (Ok(sm), Ok(dm)) = (fs::metadata(src), fs::metadata(dst)) {
        if sm.is_file()
            && dm.is_file()
            && sm.len() == dm.len()
            && sm.modified().ok() == dm.modified().ok()
        {
            return Ok(());
        }
    }
    copy_file(src, dst)
}

/// Recursively copy a directory tree (regular files and directories).
pub fn copy_dir_recursively(src: &Path, dst: &Path) -> Result<()> {
    ensure_dir_all(dst)?;
    for entry in fs::read_dir(src).map_err(|e| FsError::io(src, e))? {
        let entry = entry.map_err(|e| FsError::io(src, e))?;
        let ty = entry.file_type().map_err(|e| FsError::io(entry.path(), e))?;
        let target = dst.join(entry.file_name());
        if ty.is_dir() {
            copy_dir_recursively(&entry.path(), &target)?;
        } else if ty.is_file() {
            copy_file_unless_same(&entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Read a file holding a single decimal number followed by a newline.
pub fn read_number_file(path: &Path) -> Result<u64> {
    let text = read_text_file(path)?;
    text.trim()
        .parse::<u64>()
        .map_err(|_| FsError::corrupt(format!("Malformed number file '{}'", path.display())))
}

/// Atomically overwrite a single-number pointer file.
pub fn write_number_file(path: &Path, value: u64, perms_from: Option<&Path>) -> Result<()> {
    write_atomic(path, format!("{}\n", value).as_bytes(), perms_from)
}

/// Current length of an open file.
pub fn file_len(file: &File, path: &Path) -> Result<u64> {
    Ok(file
        .metadata()
        .map_err(|e| FsError::io(path, e))?
        .len())
}

/// RAII advisory lock on a filesystem path.  The lock file is created on
/// demand; dropping the guard releases the OS lock.
pub struct PathLock {
    file: File,
    path: PathBuf,
}

impl PathLock {
    fn open_lockfile(path: &Path) -> Result<File> {
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| FsError::io(path, e))
    }

    /// Take an exclusive lock, waiting for any current holder.
    pub fn exclusive(path: &Path) -> Result<Self> {
        let file = Self::open_lockfile(path)?;
        file.lock_exclusive().map_err(|e| FsError::io(path, e))?;
        Ok(PathLock {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Try to take an exclusive lock without blocking.  Returns `None`
    /// when another process holds it.
    pub fn try_exclusive(path: &Path) -> Result<Option<Self>> {
        let file = Self::open_lockfile(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(PathLock {
                file,
                path: path.to_path_buf(),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(FsError::io(path, e)),
        }
    }
}

impl Drop for PathLock {
    fn drop(&mut self) {
        if let Err(err) = self.file.unlock() {
            tracing::error!(path = %self.path.display(), "unlock error: {}", err);
        }
    }
}
