//! Error taxonomy for the FSFS storage engine
//!
//! Every failure carries a categorized kind so callers can distinguish
//! corruption (fatal, no local recovery) from retryable conditions such
//! as an out-of-date transaction base.

use std::path::PathBuf;

/// Result type for filesystem operations
pub type Result<T> = std::result::Result<T, FsError>;

/// Errors that can occur during filesystem operations
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    /// Malformed on-disk data: bad trailer, invalid identifier syntax,
    /// predecessor-count mismatch, invalid change ordering, truncated
    /// proto-revision, and friends.
    #[error("Corrupt filesystem: {0}")]
    Corrupt(String),

    /// The transaction's base revision is no longer the youngest.
    #[error("Transaction out of date")]
    TxnOutOfDate,

    /// Another writer holds the proto-revision lock of this transaction.
    #[error("Cannot write to the prototype revision file of transaction '{0}' because a previous representation is currently being written")]
    RepBeingWritten(String),

    /// A changed path is covered by a lock the committer does not hold.
    #[error("Lock verification failed for '{path}': {reason}")]
    LockVerification { path: String, reason: String },

    /// Query refers to a revision beyond `current` or otherwise invalid.
    #[error("No such revision {0}")]
    NoSuchRevision(i64),

    /// The transaction directory is missing.
    #[error("No transaction named '{0}'")]
    NoSuchTransaction(String),

    /// Path lookup failed inside a revision tree.
    #[error("File not found: '{0}'")]
    NotFound(String),

    /// The path exists but has the wrong node kind for the operation.
    #[error("'{0}' is not a directory")]
    NotDirectory(String),

    #[error("'{0}' is not a file")]
    NotFile(String),

    /// Format stamp outside the supported range or blacklisted.
    #[error("Unsupported filesystem format: {0}")]
    UnsupportedFormat(String),

    /// Optimistic revprop update found a different stored value.
    #[error("Revision property '{name}' of r{revision} does not match the expected base value")]
    PropBaseMismatch { revision: u64, name: String },

    /// Legacy transaction-directory creation retried beyond its bound.
    #[error("Unable to create transaction directory in '{0}' for revision {1}")]
    UniqueNameExhausted(PathBuf, u64),

    /// The operation was cancelled through the caller's token.
    #[error("Operation cancelled")]
    Cancelled,

    /// Hot-copy needs to be restarted because the source packed the
    /// assumed head revision while the copy was in progress.
    #[error("The assumed HEAD revision ({0}) of the hotcopy source has been packed while the hotcopy was in progress; please restart the hotcopy operation")]
    HotcopyRestart(u64),

    /// Source and destination are incompatible for (incremental) hot-copy.
    #[error("Hotcopy precondition failed: {0}")]
    HotcopyMismatch(String),

    /// Failure from the underlying OS, wrapped with path context.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Rep-cache (SQLite) trouble.  Callers in the commit path degrade
    /// this to a warning; elsewhere it propagates.
    #[error("Rep-cache error: {0}")]
    RepCache(String),
}

impl FsError {
    pub fn corrupt(msg: impl Into<String>) -> Self {
        FsError::Corrupt(msg.into())
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        FsError::Io {
            path: path.into(),
            source,
        }
    }

    /// True for the categories a reconstructible cache layer may swallow.
    pub fn is_cache_degradable(&self) -> bool {
        matches!(self, FsError::RepCache(_))
    }
}

impl From<rusqlite::Error> for FsError {
    fn from(e: rusqlite::Error) -> Self {
        FsError::RepCache(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_carries_context() {
        let err = FsError::io("/tmp/repo/current", std::io::Error::other("boom"));
        let msg = err.to_string();
        assert!(msg.contains("/tmp/repo/current"));
        assert!(msg.contains("boom"));
    }

    #[test]
    fn test_rep_cache_errors_are_degradable() {
        assert!(FsError::RepCache("locked".into()).is_cache_degradable());
        assert!(!FsError::TxnOutOfDate.is_cache_degradable());
        assert!(!FsError::corrupt("bad trailer").is_cache_degradable());
    }
}
