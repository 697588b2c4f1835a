//! Path-lock store
//!
//! User-visible locks on paths, kept under the `locks/` tree.  Each
//! locked path gets a digest-named file holding the lock fields as a
//! hash block; every ancestor directory gets (or extends) an index file
//! listing the digests of its locked descendants, which is what makes
//! recursive queries cheap.  Commit-time lock verification walks this
//! store.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use md5::{Digest, Md5};

use crate::error::{FsError, Result};
use crate::props::{self, PropList};

pub const LOCKS_DIR: &str = "locks";

const KEY_PATH: &str = "path";
const KEY_TOKEN: &str = "token";
const KEY_OWNER: &str = "owner";
const KEY_COMMENT: &str = "comment";
const KEY_CREATION_DATE: &str = "creation-date";
const KEY_EXPIRATION_DATE: &str = "expiration-date";
const KEY_CHILDREN: &str = "children";

/// One lock on one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SvnLock {
    pub path: String,
    pub token: String,
    pub owner: String,
    pub comment: Option<String>,
    pub creation_date: String,
    pub expiration_date: Option<String>,
}

fn digest_of(path: &str) -> String {
    hex::encode(Md5::digest(path.as_bytes()))
}

fn digest_file(fs_path: &Path, digest: &str) -> PathBuf {
    fs_path.join(LOCKS_DIR).join(&digest[..3]).join(digest)
}

fn canonical(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

fn parent_of(path: &str) -> Option<String> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/".to_string()),
        Some(i) => Some(path[..i].to_string()),
        None => None,
    }
}

/// Entry read from a digest file: possibly a lock, possibly an index of
/// children, possibly both.
struct DigestEntry {
    lock: Option<SvnLock>,
    children: BTreeSet<String>,
}

fn read_digest_entry(fs_path: &Path, digest: &str) -> Result<DigestEntry> {
    let file = digest_file(fs_path, digest);
    if !file.exists() {
        return Ok(DigestEntry {
            lock: None,
            children: BTreeSet::new(),
        });
    }
    let map = props::parse_hash_block(&crate::util::read_file(&file)?)?;
    let get = |key: &str| -> Option<String> {
        map.get(key)
            .map(|v| String::from_utf8_lossy(v).into_owned())
    };
    let children = get(KEY_CHILDREN)
        .map(|v| v.split('\n').filter(|s| !s.is_empty()).map(String::from).collect())
        .unwrap_or_default();
    let lock = match (get(KEY_PATH), get(KEY_TOKEN), get(KEY_OWNER)) {
        (Some(path), Some(token), Some(owner)) => Some(SvnLock {
            path,
            token,
            owner,
            comment: get(KEY_COMMENT),
            creation_date: get(KEY_CREATION_DATE).unwrap_or_default(),
            expiration_date: get(KEY_EXPIRATION_DATE),
        }),
        _ => None,
    };
    Ok(DigestEntry { lock, children })
}

fn write_digest_entry(fs_path: &Path, digest: &str, entry: &DigestEntry) -> Result<()> {
    let file = digest_file(fs_path, digest);
    if entry.lock.is_none() && entry.children.is_empty() {
        match std::fs::remove_file(&file) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(FsError::io(&file, e)),
        }
    }
    let mut map = PropList::new();
    if let Some(lock) = &entry.lock {
        map.insert(KEY_PATH.into(), lock.path.clone().into_bytes());
        map.insert(KEY_TOKEN.into(), lock.token.clone().into_bytes());
        map.insert(KEY_OWNER.into(), lock.owner.clone().into_bytes());
        if let Some(comment) = &lock.comment {
            map.insert(KEY_COMMENT.into(), comment.clone().into_bytes());
        }
        map.insert(
            KEY_CREATION_DATE.into(),
            lock.creation_date.clone().into_bytes(),
        );
        if let Some(exp) = &lock.expiration_date {
            map.insert(KEY_EXPIRATION_DATE.into(), exp.clone().into_bytes());
        }
    }
    if !entry.children.is_empty() {
        let joined = entry
            .children
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join("\n");
        map.insert(KEY_CHILDREN.into(), joined.into_bytes());
    }
    crate::util::ensure_dir_all(file.parent().expect("digest file has parent"))?;
    crate::util::write_atomic(&file, &props::write_hash_block(&map), None)
}

fn lock_is_expired(lock: &SvnLock) -> bool {
    match &lock.expiration_date {
        None => false,
        Some(exp) => match props::parse_date(exp) {
            Ok(when) => when <= chrono::Utc::now(),
            Err(_) => false,
        },
    }
}

/// Store a lock on `path`.  The caller must hold the repository write
/// lock.  An existing unexpired lock is only displaced when `steal` is
/// set.
pub fn set_lock(
    fs_path: &Path,
    path: &str,
    token: Option<String>,
    owner: &str,
    comment: Option<String>,
    expiration_date: Option<String>,
    steal: bool,
) -> Result<SvnLock> {
    let path = canonical(path);
    let digest = digest_of(&path);
    let mut entry = read_digest_entry(fs_path, &digest)?;

    if let Some(existing) = &entry.lock {
        if !lock_is_expired(existing) && !steal {
            return Err(FsError::LockVerification {
                path: path.clone(),
                reason: format!("path is already locked by user '{}'", existing.owner),
            });
        }
    }

    let lock = SvnLock {
        path: path.clone(),
        token: token.unwrap_or_else(|| format!("opaquelocktoken:{}", uuid::Uuid::new_v4())),
        owner: owner.to_string(),
        comment,
        creation_date: props::date_now(),
        expiration_date,
    };
    entry.lock = Some(lock.clone());
    write_digest_entry(fs_path, &digest, &entry)?;

    // Thread the digest into every ancestor's index.
    let mut child_digest = digest;
    let mut current = path;
    while let Some(parent) = parent_of(&current) {
        let parent_digest = digest_of(&parent);
        let mut parent_entry = read_digest_entry(fs_path, &parent_digest)?;
        parent_entry.children.insert(child_digest.clone());
        write_digest_entry(fs_path, &parent_digest, &parent_entry)?;
        child_digest = parent_digest;
        current = parent;
    }

    Ok(lock)
}

/// Remove the lock on `path`.  Without `break_lock` the presented token
/// must match.  The caller must hold the repository write lock.
pub fn remove_lock(fs_path: &Path, path: &str, token: Option<&str>, break_lock: bool) -> Result<()> {
    let path = canonical(path);
    let digest = digest_of(&path);
    let mut entry = read_digest_entry(fs_path, &digest)?;
    let lock = entry.lock.take().ok_or_else(|| FsError::LockVerification {
        path: path.clone(),
        reason: "no lock on path".into(),
    })?;
    if !break_lock && token != Some(lock.token.as_str()) {
        return Err(FsError::LockVerification {
            path: path.clone(),
            reason: "lock token does not match".into(),
        });
    }
    write_digest_entry(fs_path, &digest, &entry)?;

    // Unthread empty index entries from the ancestors.
    let mut child_digest = digest;
    let mut current = path;
    while let Some(parent) = parent_of(&current) {
        let parent_digest = digest_of(&parent);
        let mut parent_entry = read_digest_entry(fs_path, &parent_digest)?;
        let child_entry = read_digest_entry(fs_path, &child_digest)?;
        if child_entry.lock.is_none() && child_entry.children.is_empty() {
            parent_entry.children.remove(&child_digest);
            write_digest_entry(fs_path, &parent_digest, &parent_entry)?;
        }
        child_digest = parent_digest;
        current = parent;
    }
    Ok(())
}

/// Current lock on exactly `path`, dropping expired ones lazily.
pub fn get_lock(fs_path: &Path, path: &str) -> Result<Option<SvnLock>> {
    let path = canonical(path);
    let entry = read_digest_entry(fs_path, &digest_of(&path))?;
    match entry.lock {
        Some(lock) if lock_is_expired(&lock) => {
            remove_lock(fs_path, &path, None, true)?;
            Ok(None)
        }
        other => Ok(other),
    }
}

/// All locks on or below `path`.
pub fn get_locks(fs_path: &Path, path: &str) -> Result<Vec<SvnLock>> {
    let path = canonical(path);
    let mut out = Vec::new();
    collect_locks(fs_path, &digest_of(&path), &mut out)?;
    Ok(out)
}

fn collect_locks(fs_path: &Path, digest: &str, out: &mut Vec<SvnLock>) -> Result<()> {
    let entry = read_digest_entry(fs_path, digest)?;
    if let Some(lock) = entry.lock {
        if !lock_is_expired(&lock) {
            out.push(lock);
        }
    }
    for child in entry.children {
        collect_locks(fs_path, &child, out)?;
    }
    Ok(())
}

/// Verify that `username` (with `tokens`) may touch `path`; with
/// `recurse`, also every locked path below it.
pub fn allow_locked_operation(
    fs_path: &Path,
    path: &str,
    username: Option<&str>,
    tokens: &BTreeSet<String>,
    recurse: bool,
) -> Result<()> {
    let check = |lock: &SvnLock| -> Result<()> {
        if lock_is_expired(lock) {
            return Ok(());
        }
        match username {
            None => Err(FsError::LockVerification {
                path: lock.path.clone(),
                reason: "no username available for lock check".into(),
            }),
            Some(user) if user != lock.owner => Err(FsError::LockVerification {
                path: lock.path.clone(),
                reason: format!("lock is held by user '{}'", lock.owner),
            }),
            Some(_) if !tokens.contains(&lock.token) => Err(FsError::LockVerification {
                path: lock.path.clone(),
                reason: "lock token not supplied".into(),
            }),
            Some(_) => Ok(()),
        }
    };

    if recurse {
        for lock in get_locks(fs_path, path)? {
            check(&lock)?;
        }
    } else if let Some(lock) = get_lock(fs_path, path)? {
        check(&lock)?;
    }
    Ok(())
}
