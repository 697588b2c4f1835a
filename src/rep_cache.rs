//! Rep-sharing index
//!
//! A small SQLite database (`rep-cache.db`) mapping fulltext SHA-1 to
//! the committed representation holding those bytes.  The cache is an
//! optimization: it is only consulted when rep sharing is enabled, and
//! every failure here is reconstructible, so callers downgrade errors
//! to warnings rather than failing commits.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{FsError, Result};
use crate::id::Revnum;
use crate::rep::Representation;

pub const REP_CACHE_DB_NAME: &str = "rep-cache.db";

const SCHEMA: &str = "\
    PRAGMA auto_vacuum = 1;
    CREATE TABLE IF NOT EXISTS rep_cache (
        hash TEXT NOT NULL PRIMARY KEY,
        revision INTEGER NOT NULL,
        offset INTEGER NOT NULL,
        size INTEGER NOT NULL,
        expanded_size INTEGER NOT NULL
    );";

/// Handle on a repository's rep-cache database.
pub struct RepCache {
    conn: Mutex<Connection>,
}

impl RepCache {
    /// Open (creating if necessary) the rep-cache of the filesystem at
    /// `fs_path`.
    pub fn open(fs_path: &Path) -> Result<RepCache> {
        let db_path = fs_path.join(REP_CACHE_DB_NAME);
        let conn = Connection::open(&db_path)?;
        conn.busy_timeout(std::time::Duration::from_secs(10))?;
        conn.execute_batch(SCHEMA)?;
        Ok(RepCache {
            conn: Mutex::new(conn),
        })
    }

    pub fn db_path(fs_path: &Path) -> PathBuf {
        fs_path.join(REP_CACHE_DB_NAME)
    }

    /// Look up a representation by fulltext SHA-1.
    pub fn get(&self, sha1: &[u8; 20]) -> Result<Option<Representation>> {
        let conn = self.conn.lock().expect("rep-cache mutex poisoned");
        let row = conn
            .query_row(
                "SELECT revision, offset, size, expanded_size \
                 FROM rep_cache WHERE hash = ?1",
                params![hex::encode(sha1)],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;
        Ok(row.map(|(revision, offset, size, expanded_size)| Representation {
            revision: Some(revision as Revnum),
            offset: offset as u64,
            size: size as u64,
            expanded_size: expanded_size as u64,
            md5: [0; 16],
            sha1: Some(*sha1),
            txn_id: None,
            uniquifier: None,
        }))
    }

    /// Insert the given committed representations in one database
    /// transaction.  Existing rows win: a parallel commit may have
    /// inserted the same hash first, and both point at valid bytes.
    pub fn set_batch(&self, reps: &[Representation]) -> Result<()> {
        let mut conn = self.conn.lock().expect("rep-cache mutex poisoned");
        let tx = conn.transaction()?;
        for rep in reps {
            let sha1 = match &rep.sha1 {
                Some(sha1) => sha1,
                None => continue,
            };
            let revision = rep.revision.ok_or_else(|| {
                FsError::RepCache("refusing to cache an uncommitted representation".into())
            })?;
            tx.execute(
                "INSERT OR IGNORE INTO rep_cache \
                 (hash, revision, offset, size, expanded_size) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    hex::encode(sha1),
                    revision as i64,
                    rep.offset as i64,
                    rep.size as i64,
                    rep.expanded_size as i64
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Number of cached rows; used by tests and verification tooling.
    pub fn count(&self) -> Result<u64> {
        let conn = self.conn.lock().expect("rep-cache mutex poisoned");
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM rep_cache", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// Consistent copy of a (possibly live) rep-cache database, via the
    /// SQLite online-backup API.
    pub fn hotcopy_db(src_db: &Path, dst_db: &Path) -> Result<()> {
        let src = Connection::open(src_db)?;
        let mut dst = Connection::open(dst_db)?;
        let backup = rusqlite::backup::Backup::new(&src, &mut dst)?;
        backup.run_to_completion(64, std::time::Duration::from_millis(25), None)?;
        Ok(())
    }

    /// Drop every row whose revision is younger than `youngest`.  Used
    /// after hot-copy, where the destination may have received cache
    /// rows for revisions it does not hold yet.
    pub fn delete_newer_than(&self, youngest: Revnum) -> Result<()> {
        let conn = self.conn.lock().expect("rep-cache mutex poisoned");
        conn.execute(
            "DELETE FROM rep_cache WHERE revision > ?1",
            params![youngest as i64],
        )?;
        Ok(())
    }
}
