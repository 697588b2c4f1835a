//! FSFS versioned-filesystem storage engine
//!
//! An append-only, content-addressed, copy-on-write object store that
//! maps a sequence of committed revisions to immutable trees of
//! directories, files, and properties.  Storage is shared across
//! revisions via skip-delta chains and SHA-1-keyed representation
//! sharing; commits are serialized by a repository-wide write lock
//! while readers run concurrently, and hot-copy produces a usable
//! replica of a repository that keeps accepting writes.
//!
//! - On-disk formats: revision files, node-revision records,
//!   representations, changed-path lists, revision properties
//! - Transactions: the private mutable staging area of a commit
//! - Commit pipeline: id rewriting, deltification, the atomic
//!   `current` bump
//! - Sharding, packing, and incremental hot-copy
//! - History navigation: dated-revision search, deleted-revision
//!   bisection, file-revision enumeration

pub mod changes;
pub mod config;
pub mod error;
pub mod format;
pub mod history;
pub mod hotcopy;
pub mod id;
pub mod locks;
pub mod noderev;
pub mod pack;
pub mod props;
pub mod rep;
pub mod rep_cache;
pub mod repository;
pub mod revision;
pub mod svndiff;
pub mod tree;
pub mod txn;
pub mod util;

mod commit;

pub use changes::{Change, ChangeKind, ChangedPaths, PathChange};
pub use commit::commit;
pub use config::FsConfig;
pub use error::{FsError, Result};
pub use format::{Format, FORMAT_NUMBER};
pub use history::{dated_revision, deleted_rev, file_rev_delta, file_revs, FileRevision};
pub use hotcopy::hotcopy;
pub use id::{NodeRevId, Revnum};
pub use locks::SvnLock;
pub use noderev::{NodeKind, NodeRevision};
pub use pack::pack;
pub use props::PropList;
pub use rep::Representation;
pub use repository::{AccessContext, CancelToken, OpenOptions, Repository, WarningSink};
pub use revision::RevisionRoot;
pub use tree::{DirEntries, DirEntry};
pub use txn::Transaction;
