//! Top-level filesystem object
//!
//! Opens or creates an FSFS repository directory, discovers its format,
//! and shares mutexes and caches between all handles opened on the same
//! path within this process.  Mutating entry points funnel through the
//! repository-wide write lock; readers never block writers.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use once_cell::sync::Lazy;

use crate::config::FsConfig;
use crate::error::{FsError, Result};
use crate::format::{self, Format};
use crate::id::Revnum;
use crate::noderev::{NodeKind, NodeRevision};
use crate::props::{self, PropList};
use crate::rep::Representation;
use crate::rep_cache::RepCache;
use crate::tree::DirEntries;
use crate::util::{self, PathLock};

pub const PATH_FORMAT: &str = "format";
pub const PATH_UUID: &str = "uuid";
pub const PATH_CURRENT: &str = "current";
pub const PATH_WRITE_LOCK: &str = "write-lock";
pub const PATH_TXN_CURRENT: &str = "txn-current";
pub const PATH_TXN_CURRENT_LOCK: &str = "txn-current-lock";
pub const PATH_MIN_UNPACKED_REV: &str = "min-unpacked-rev";
pub const PATH_REVPROP_GENERATION: &str = "revprop-generation";
pub const PATH_REVS_DIR: &str = "revs";
pub const PATH_REVPROPS_DIR: &str = "revprops";
pub const PATH_TXNS_DIR: &str = "transactions";
pub const PATH_TXN_PROTOS_DIR: &str = "txn-protorevs";
pub const PATH_NODE_ORIGINS_DIR: &str = "node-origins";
pub const PACKED_SHARD_EXT: &str = ".pack";

/// Cancellation token polled at coarse boundaries of long operations.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn check(&self) -> Result<()> {
        if self.0.load(Ordering::Relaxed) {
            Err(FsError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Structured diagnostic channel for reconstructible-cache trouble.
pub trait WarningSink: Send + Sync {
    fn warn(&self, kind: &str, message: &str);
}

/// Default sink: forward to the tracing subscriber.
struct TracingSink;

impl WarningSink for TracingSink {
    fn warn(&self, kind: &str, message: &str) {
        tracing::warn!(kind, "{}", message);
    }
}

/// Caller identity consulted by commit-time lock verification.
#[derive(Debug, Clone, Default)]
pub struct AccessContext {
    pub username: Option<String>,
    pub lock_tokens: BTreeSet<String>,
}

/// In-process record of one in-flight transaction.
#[derive(Default)]
pub(crate) struct SharedTxnData {
    pub being_written: bool,
}

/// State shared by every handle opened on the same repository path in
/// this process.
pub(crate) struct SharedFsData {
    /// Serializes write-lock acquisition between threads; the on-disk
    /// advisory lock serializes between processes.
    pub write_lock: Mutex<()>,
    pub txn_current_lock: Mutex<()>,
    /// Registry of in-flight transactions and their `being_written`
    /// flags.
    pub txn_list: Mutex<HashMap<String, SharedTxnData>>,
    /// Directory-listing cache keyed by unparsed node-rev id.
    pub dir_cache: Mutex<HashMap<String, Arc<DirEntries>>>,
}

static SHARED_REGISTRY: Lazy<Mutex<HashMap<PathBuf, Weak<SharedFsData>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn shared_for(path: &Path) -> Arc<SharedFsData> {
    let key = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let mut registry = SHARED_REGISTRY.lock().expect("shared registry poisoned");
    if let Some(existing) = registry.get(&key).and_then(Weak::upgrade) {
        return existing;
    }
    let fresh = Arc::new(SharedFsData {
        write_lock: Mutex::new(()),
        txn_current_lock: Mutex::new(()),
        txn_list: Mutex::new(HashMap::new()),
        dir_cache: Mutex::new(HashMap::new()),
    });
    registry.insert(key, Arc::downgrade(&fresh));
    fresh
}

pub(crate) struct RepoInner {
    pub path: PathBuf,
    pub format: Format,
    pub uuid: String,
    pub config: FsConfig,
    pub shared: Arc<SharedFsData>,
    pub youngest_cache: Mutex<Option<Revnum>>,
    pub min_unpacked_cache: Mutex<Option<Revnum>>,
    rep_cache: Mutex<Option<Arc<RepCache>>>,
    pub warning: Box<dyn WarningSink>,
    pub cancel: CancelToken,
    pub access: Mutex<AccessContext>,
}

/// An open FSFS filesystem.  Cheap to clone; clones share caches and
/// mutexes.
#[derive(Clone)]
pub struct Repository {
    pub(crate) inner: Arc<RepoInner>,
}

/// Options for `Repository::open_with`.
pub struct OpenOptions {
    pub warning: Box<dyn WarningSink>,
    pub cancel: CancelToken,
}

impl Default for OpenOptions {
    fn default() -> Self {
        OpenOptions {
            warning: Box::new(TracingSink),
            cancel: CancelToken::new(),
        }
    }
}

impl Repository {
    /// Create a new repository at `path` with the current format and
    /// the default sharded layout, ending with revision 0 in place.
    pub fn create(path: &Path) -> Result<Repository> {
        Self::create_with_format(
            path,
            Format {
                number: format::FORMAT_NUMBER,
                max_files_per_dir: format::DEFAULT_MAX_FILES_PER_DIR,
            },
        )
    }

    pub fn create_with_format(path: &Path, fmt: Format) -> Result<Repository> {
        format::check_format(fmt.number)?;
        util::ensure_dir_all(path)?;

        // Revision data and revprop directories, shard 0 when sharded.
        if fmt.sharded() {
            util::ensure_dir_all(&path.join(PATH_REVS_DIR).join("0"))?;
            util::ensure_dir_all(&path.join(PATH_REVPROPS_DIR).join("0"))?;
        } else {
            util::ensure_dir_all(&path.join(PATH_REVS_DIR))?;
            util::ensure_dir_all(&path.join(PATH_REVPROPS_DIR))?;
        }
        util::ensure_dir_all(&path.join(PATH_TXNS_DIR))?;
        if fmt.number >= format::MIN_PROTOREVS_DIR_FORMAT {
            util::ensure_dir_all(&path.join(PATH_TXN_PROTOS_DIR))?;
        }

        let current = if fmt.number >= format::MIN_NO_GLOBAL_IDS_FORMAT {
            "0\n"
        } else {
            "0 1 1\n"
        };
        util::create_file(&path.join(PATH_CURRENT), current.as_bytes())?;
        util::create_file(&path.join(PATH_WRITE_LOCK), b"")?;

        let uuid = uuid::Uuid::new_v4().to_string();
        util::write_atomic(&path.join(PATH_UUID), format!("{}\n", uuid).as_bytes(), None)?;

        write_revision_zero(path, &fmt)?;

        if fmt.number >= format::MIN_CONFIG_FILE_FORMAT {
            FsConfig::write_default(path)?;
        }
        if fmt.number >= format::MIN_PACKED_FORMAT {
            util::create_file(&path.join(PATH_MIN_UNPACKED_REV), b"0\n")?;
        }
        if fmt.number >= format::MIN_TXN_CURRENT_FORMAT {
            util::create_file(&path.join(PATH_TXN_CURRENT), b"0\n")?;
            util::create_file(&path.join(PATH_TXN_CURRENT_LOCK), b"")?;
        }

        // The filesystem is ready; stamp it with a format number.
        format::write_format(&path.join(PATH_FORMAT), fmt, false)?;

        Self::open(path)
    }

    pub fn open(path: &Path) -> Result<Repository> {
        Self::open_with(path, OpenOptions::default())
    }

    pub fn open_with(path: &Path, options: OpenOptions) -> Result<Repository> {
        let fmt = format::read_format(&path.join(PATH_FORMAT))?;
        let uuid = util::read_text_file(&path.join(PATH_UUID))?
            .trim()
            .to_string();
        // `current` must exist for this to be a usable repository; a
        // hot-copy interrupted before its format stamp has neither.
        let _ = util::read_text_file(&path.join(PATH_CURRENT))?;
        let config = FsConfig::read(path, fmt.number)?;
        Ok(Self::assemble(path, fmt, uuid, config, options))
    }

    /// Handle on a hot-copy destination that has not been stamped with
    /// a format file yet.  Never exposed to callers.
    pub(crate) fn open_unstamped(
        path: &Path,
        fmt: Format,
        uuid: String,
        config: FsConfig,
    ) -> Repository {
        Self::assemble(path, fmt, uuid, config, OpenOptions::default())
    }

    fn assemble(
        path: &Path,
        fmt: Format,
        uuid: String,
        config: FsConfig,
        options: OpenOptions,
    ) -> Repository {
        Repository {
            inner: Arc::new(RepoInner {
                path: path.to_path_buf(),
                format: fmt,
                uuid,
                config,
                shared: shared_for(path),
                youngest_cache: Mutex::new(None),
                min_unpacked_cache: Mutex::new(None),
                rep_cache: Mutex::new(None),
                warning: options.warning,
                cancel: options.cancel,
                access: Mutex::new(AccessContext::default()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn uuid(&self) -> &str {
        &self.inner.uuid
    }

    pub fn format(&self) -> Format {
        self.inner.format
    }

    pub fn config(&self) -> &FsConfig {
        &self.inner.config
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.inner.cancel.clone()
    }

    pub(crate) fn check_cancel(&self) -> Result<()> {
        self.inner.cancel.check()
    }

    pub(crate) fn warn(&self, kind: &str, message: &str) {
        self.inner.warning.warn(kind, message);
    }

    /// Install the caller identity used by lock verification.
    pub fn set_access(&self, access: AccessContext) {
        *self.inner.access.lock().expect("access mutex poisoned") = access;
    }

    pub(crate) fn access(&self) -> AccessContext {
        self.inner.access.lock().expect("access mutex poisoned").clone()
    }

    // ==================== Paths ====================

    pub(crate) fn shard_of(&self, rev: Revnum) -> u64 {
        rev / self.inner.format.max_files_per_dir.max(1)
    }

    pub(crate) fn path_rev_shard(&self, rev: Revnum) -> PathBuf {
        self.inner
            .path
            .join(PATH_REVS_DIR)
            .join(self.shard_of(rev).to_string())
    }

    /// Path of the unpacked revision file.
    pub fn path_rev(&self, rev: Revnum) -> PathBuf {
        if self.inner.format.sharded() {
            self.path_rev_shard(rev).join(rev.to_string())
        } else {
            self.inner.path.join(PATH_REVS_DIR).join(rev.to_string())
        }
    }

    pub(crate) fn path_rev_packed_shard(&self, rev: Revnum) -> PathBuf {
        self.inner
            .path
            .join(PATH_REVS_DIR)
            .join(format!("{}{}", self.shard_of(rev), PACKED_SHARD_EXT))
    }

    pub(crate) fn path_rev_pack_file(&self, rev: Revnum) -> PathBuf {
        self.path_rev_packed_shard(rev).join("pack")
    }

    pub(crate) fn path_rev_pack_manifest(&self, rev: Revnum) -> PathBuf {
        self.path_rev_packed_shard(rev).join("manifest")
    }

    pub(crate) fn path_revprops_shard(&self, rev: Revnum) -> PathBuf {
        self.inner
            .path
            .join(PATH_REVPROPS_DIR)
            .join(self.shard_of(rev).to_string())
    }

    /// Path of the unpacked revision-properties file.
    pub fn path_revprops(&self, rev: Revnum) -> PathBuf {
        if self.inner.format.sharded() {
            self.path_revprops_shard(rev).join(rev.to_string())
        } else {
            self.inner
                .path
                .join(PATH_REVPROPS_DIR)
                .join(rev.to_string())
        }
    }

    pub(crate) fn path_revprops_packed_shard(&self, rev: Revnum) -> PathBuf {
        self.inner
            .path
            .join(PATH_REVPROPS_DIR)
            .join(format!("{}{}", self.shard_of(rev), PACKED_SHARD_EXT))
    }

    pub(crate) fn path_txn_dir(&self, txn_id: &str) -> PathBuf {
        self.inner
            .path
            .join(PATH_TXNS_DIR)
            .join(format!("{}.txn", txn_id))
    }

    pub(crate) fn path_txn_proto_rev(&self, txn_id: &str) -> PathBuf {
        if self.inner.format.number >= format::MIN_PROTOREVS_DIR_FORMAT {
            self.inner
                .path
                .join(PATH_TXN_PROTOS_DIR)
                .join(format!("{}.rev", txn_id))
        } else {
            self.path_txn_dir(txn_id).join("rev")
        }
    }

    pub(crate) fn path_txn_proto_rev_lock(&self, txn_id: &str) -> PathBuf {
        if self.inner.format.number >= format::MIN_PROTOREVS_DIR_FORMAT {
            self.inner
                .path
                .join(PATH_TXN_PROTOS_DIR)
                .join(format!("{}.rev-lock", txn_id))
        } else {
            self.path_txn_dir(txn_id).join("rev-lock")
        }
    }

    // ==================== current / youngest ====================

    /// Read `current`, returning youngest and (legacy formats only) the
    /// next node and copy ids.
    pub(crate) fn read_current(&self) -> Result<(Revnum, Option<(String, String)>)> {
        let path = self.inner.path.join(PATH_CURRENT);
        let text = util::read_text_file(&path)?;
        let mut tokens = text.split_whitespace();
        let youngest = tokens
            .next()
            .and_then(|t| t.parse::<Revnum>().ok())
            .ok_or_else(|| FsError::corrupt("Corrupt 'current' file"))?;
        if self.inner.format.number < format::MIN_NO_GLOBAL_IDS_FORMAT {
            let node_id = tokens
                .next()
                .ok_or_else(|| FsError::corrupt("Corrupt 'current' file"))?;
            let copy_id = tokens
                .next()
                .ok_or_else(|| FsError::corrupt("Corrupt 'current' file"))?;
            Ok((youngest, Some((node_id.to_string(), copy_id.to_string()))))
        } else {
            Ok((youngest, None))
        }
    }

    /// Atomically advance `current`.
    pub(crate) fn write_current(
        &self,
        rev: Revnum,
        next_ids: Option<(String, String)>,
    ) -> Result<()> {
        let contents = match next_ids {
            Some((node, copy)) => format!("{} {} {}\n", rev, node, copy),
            None => format!("{}\n", rev),
        };
        util::write_atomic(
            &self.inner.path.join(PATH_CURRENT),
            contents.as_bytes(),
            None,
        )?;
        *self
            .inner
            .youngest_cache
            .lock()
            .expect("youngest cache poisoned") = Some(rev);
        Ok(())
    }

    /// The youngest revision, freshly read from disk.
    pub fn youngest_rev(&self) -> Result<Revnum> {
        let (youngest, _) = self.read_current()?;
        *self
            .inner
            .youngest_cache
            .lock()
            .expect("youngest cache poisoned") = Some(youngest);
        Ok(youngest)
    }

    /// The youngest revision, allowing a previously cached value.
    pub fn youngest_rev_cached(&self) -> Result<Revnum> {
        if let Some(cached) = *self
            .inner
            .youngest_cache
            .lock()
            .expect("youngest cache poisoned")
        {
            return Ok(cached);
        }
        self.youngest_rev()
    }

    /// Fail unless `rev` has become visible.
    pub fn ensure_revision_exists(&self, rev: Revnum) -> Result<()> {
        let cached = self.youngest_rev_cached()?;
        if rev <= cached {
            return Ok(());
        }
        // The cache may be stale; check disk once before giving up.
        if rev <= self.youngest_rev()? {
            return Ok(());
        }
        Err(FsError::NoSuchRevision(rev as i64))
    }

    // ==================== min-unpacked-rev ====================

    pub fn min_unpacked_rev(&self) -> Result<Revnum> {
        if self.inner.format.number < format::MIN_PACKED_FORMAT {
            return Ok(0);
        }
        if let Some(cached) = *self
            .inner
            .min_unpacked_cache
            .lock()
            .expect("min-unpacked cache poisoned")
        {
            return Ok(cached);
        }
        self.refresh_min_unpacked_rev()
    }

    /// Re-read `min-unpacked-rev` from disk.
    pub fn refresh_min_unpacked_rev(&self) -> Result<Revnum> {
        if self.inner.format.number < format::MIN_PACKED_FORMAT {
            return Ok(0);
        }
        let value = util::read_number_file(&self.inner.path.join(PATH_MIN_UNPACKED_REV))?;
        *self
            .inner
            .min_unpacked_cache
            .lock()
            .expect("min-unpacked cache poisoned") = Some(value);
        Ok(value)
    }

    pub(crate) fn write_min_unpacked_rev(&self, value: Revnum) -> Result<()> {
        util::write_number_file(&self.inner.path.join(PATH_MIN_UNPACKED_REV), value, None)?;
        *self
            .inner
            .min_unpacked_cache
            .lock()
            .expect("min-unpacked cache poisoned") = Some(value);
        Ok(())
    }

    /// Whether `rev` lives in a pack file (as of the cached
    /// min-unpacked-rev).
    pub fn is_packed_rev(&self, rev: Revnum) -> Result<bool> {
        Ok(self.inner.format.number >= format::MIN_PACKED_FORMAT
            && rev < self.min_unpacked_rev()?)
    }

    // ==================== Locks ====================

    /// Run `body` under the repository-wide write lock.  While the lock
    /// is held, youngest and min-unpacked-rev are refreshed once and no
    /// other writer can invalidate them.
    pub(crate) fn with_write_lock<T>(&self, body: impl FnOnce() -> Result<T>) -> Result<T> {
        let _thread_guard = self
            .inner
            .shared
            .write_lock
            .lock()
            .expect("write lock mutex poisoned");
        let _file_guard = PathLock::exclusive(&self.inner.path.join(PATH_WRITE_LOCK))?;
        self.youngest_rev()?;
        if self.inner.format.number >= format::MIN_PACKED_FORMAT {
            self.refresh_min_unpacked_rev()?;
        }
        body()
    }

    /// Run `body` while holding the `txn-current` lock.
    pub(crate) fn with_txn_current_lock<T>(&self, body: impl FnOnce() -> Result<T>) -> Result<T> {
        let _thread_guard = self
            .inner
            .shared
            .txn_current_lock
            .lock()
            .expect("txn-current mutex poisoned");
        let _file_guard = PathLock::exclusive(&self.inner.path.join(PATH_TXN_CURRENT_LOCK))?;
        body()
    }

    // ==================== Revision properties ====================

    /// Read the property list of revision `rev`.  Revprops of packed
    /// revisions come from the pack: a stale unpacked file (left by an
    /// interrupted pack or incremental hot-copy) never shadows it.
    pub fn revision_proplist(&self, rev: Revnum) -> Result<PropList> {
        self.ensure_revision_exists(rev)?;
        if rev > 0
            && self.inner.format.number >= format::MIN_PACKED_REVPROP_FORMAT
            && self.is_packed_rev(rev)?
            && self
                .path_revprops_packed_shard(rev)
                .join("manifest")
                .exists()
        {
            return crate::pack::read_packed_revprops(self, rev);
        }
        props::parse_hash_block(&util::read_file(&self.path_revprops(rev))?)
    }

    pub fn revision_prop(&self, rev: Revnum, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.revision_proplist(rev)?.get(name).cloned())
    }

    /// Replace the whole property list of `rev`.  Requires the write
    /// lock to keep packed rewrites atomic with respect to each other.
    pub fn set_revision_proplist(&self, rev: Revnum, proplist: &PropList) -> Result<()> {
        self.with_write_lock(|| {
            self.ensure_revision_exists(rev)?;
            self.set_revision_proplist_unlocked(rev, proplist)
        })
    }

    pub(crate) fn set_revision_proplist_unlocked(
        &self,
        rev: Revnum,
        proplist: &PropList,
    ) -> Result<()> {
        self.bump_revprop_generation()?;
        // Mirror the read side: packed revisions update their pack.
        let packed = rev > 0
            && self.inner.format.number >= format::MIN_PACKED_REVPROP_FORMAT
            && self.is_packed_rev(rev)?
            && self
                .path_revprops_packed_shard(rev)
                .join("manifest")
                .exists();
        let result = if packed {
            crate::pack::write_packed_revprop(self, rev, proplist)
        } else {
            util::write_atomic(
                &self.path_revprops(rev),
                &props::write_hash_block(proplist),
                None,
            )
        };
        self.bump_revprop_generation()?;
        result
    }

    /// Change one revision property, optionally guarded by the expected
    /// previous value (`None` = property absent).
    pub fn change_rev_prop(
        &self,
        rev: Revnum,
        name: &str,
        expected_old: Option<Option<&[u8]>>,
        value: Option<&[u8]>,
    ) -> Result<()> {
        self.with_write_lock(|| {
            self.ensure_revision_exists(rev)?;
            let mut proplist = self.revision_proplist(rev)?;
            if let Some(expected) = expected_old {
                let stored = proplist.get(name).map(|v| v.as_slice());
                if stored != expected {
                    return Err(FsError::PropBaseMismatch {
                        revision: rev,
                        name: name.to_string(),
                    });
                }
            }
            match value {
                Some(v) => proplist.insert(name.to_string(), v.to_vec()),
                None => proplist.remove(name),
            };
            self.set_revision_proplist_unlocked(rev, &proplist)
        })
    }

    /// Bump the revprop generation counter (lazily created; only kept
    /// for formats with packed revprops).
    fn bump_revprop_generation(&self) -> Result<()> {
        if self.inner.format.number < format::MIN_PACKED_REVPROP_FORMAT {
            return Ok(());
        }
        let path = self.inner.path.join(PATH_REVPROP_GENERATION);
        let current = if path.exists() {
            util::read_number_file(&path)?
        } else {
            0
        };
        util::write_number_file(&path, current + 1, None)
    }

    // ==================== Rep cache ====================

    /// The rep-cache handle, opened lazily.  Failures are reported
    /// through the warning channel and yield `None`: rep sharing then
    /// degrades to "no sharing".
    pub fn rep_cache(&self) -> Option<Arc<RepCache>> {
        if !self.inner.config.rep_sharing_allowed {
            return None;
        }
        let mut slot = self.inner.rep_cache.lock().expect("rep cache slot poisoned");
        if slot.is_none() {
            match RepCache::open(&self.inner.path) {
                Ok(cache) => *slot = Some(Arc::new(cache)),
                Err(e) => {
                    self.warn("rep-cache", &format!("could not open rep-cache: {}", e));
                    return None;
                }
            }
        }
        slot.clone()
    }

    /// Rep-cache lookup by SHA-1; degrades to a miss on cache trouble.
    pub(crate) fn rep_cache_get(&self, sha1: &[u8; 20]) -> Option<Representation> {
        let cache = self.rep_cache()?;
        match cache.get(sha1) {
            Ok(hit) => hit,
            Err(e) => {
                self.warn("rep-cache", &format!("rep-cache lookup failed: {}", e));
                None
            }
        }
    }

    // ==================== Shared txn registry ====================

    pub(crate) fn with_txn_list<T>(
        &self,
        body: impl FnOnce(&mut HashMap<String, SharedTxnData>) -> T,
    ) -> T {
        let mut list = self
            .inner
            .shared
            .txn_list
            .lock()
            .expect("txn list mutex poisoned");
        body(&mut list)
    }

    pub(crate) fn dir_cache_get(&self, id_key: &str) -> Option<Arc<DirEntries>> {
        self.inner
            .shared
            .dir_cache
            .lock()
            .expect("dir cache mutex poisoned")
            .get(id_key)
            .cloned()
    }

    pub(crate) fn dir_cache_put(&self, id_key: String, entries: Arc<DirEntries>) {
        self.inner
            .shared
            .dir_cache
            .lock()
            .expect("dir cache mutex poisoned")
            .insert(id_key, entries);
    }

    // ==================== Path locks ====================

    /// Lock `path` for the user in the access context.
    pub fn lock_path(
        &self,
        path: &str,
        comment: Option<String>,
        expiration_date: Option<String>,
        steal: bool,
    ) -> Result<crate::locks::SvnLock> {
        let access = self.access();
        let owner = access.username.ok_or_else(|| FsError::LockVerification {
            path: path.to_string(),
            reason: "no username available to own the lock".into(),
        })?;
        self.with_write_lock(|| {
            crate::locks::set_lock(
                &self.inner.path,
                path,
                None,
                &owner,
                comment.clone(),
                expiration_date.clone(),
                steal,
            )
        })
    }

    /// Release the lock on `path`.  Without `break_lock` the access
    /// context must hold the lock's token.
    pub fn unlock_path(&self, path: &str, token: Option<&str>, break_lock: bool) -> Result<()> {
        self.with_write_lock(|| crate::locks::remove_lock(&self.inner.path, path, token, break_lock))
    }

    /// Current lock on `path`, if any.
    pub fn get_lock(&self, path: &str) -> Result<Option<crate::locks::SvnLock>> {
        crate::locks::get_lock(&self.inner.path, path)
    }

    /// All locks on or below `path`.
    pub fn get_locks(&self, path: &str) -> Result<Vec<crate::locks::SvnLock>> {
        crate::locks::get_locks(&self.inner.path, path)
    }

    // ==================== Node origins ====================

    fn path_node_origin(&self, node_id: &str) -> PathBuf {
        let key = if node_id.len() == 1 {
            "0"
        } else {
            &node_id[..node_id.len() - 1]
        };
        self.inner.path.join(PATH_NODE_ORIGINS_DIR).join(key)
    }

    /// First committed node-rev id of the node line `node_id`, if the
    /// lazy cache knows it.
    pub fn node_origin(&self, node_id: &str) -> Result<Option<crate::id::NodeRevId>> {
        let path = self.path_node_origin(node_id);
        if !path.exists() {
            return Ok(None);
        }
        let map = props::parse_hash_block(&util::read_file(&path)?)?;
        match map.get(node_id) {
            Some(value) => {
                let text = std::str::from_utf8(value)
                    .map_err(|_| FsError::corrupt("Malformed node-origins entry"))?;
                Ok(Some(crate::id::NodeRevId::parse(text)?))
            }
            None => Ok(None),
        }
    }

    /// Record a node origin.  The cache is reconstructible, so failures
    /// degrade to a warning.
    pub fn set_node_origin(&self, node_id: &str, origin: &crate::id::NodeRevId) -> Result<()> {
        let path = self.path_node_origin(node_id);
        let write = || -> Result<()> {
            util::ensure_dir_all(&self.inner.path.join(PATH_NODE_ORIGINS_DIR))?;
            let mut map = if path.exists() {
                props::parse_hash_block(&util::read_file(&path)?)?
            } else {
                PropList::new()
            };
            map.insert(node_id.to_string(), origin.to_string().into_bytes());
            util::write_atomic(&path, &props::write_hash_block(&map), None)
        };
        if let Err(e) = write() {
            self.warn("node-origins", &format!("could not store node origin: {}", e));
        }
        Ok(())
    }

    // ==================== Recovery & upgrade ====================

    /// Rebuild `current` by scanning the revision tree for the largest
    /// revision file actually present.
    pub fn recover(&self) -> Result<Revnum> {
        self.with_write_lock(|| {
            let mut youngest = self.min_unpacked_rev()?.saturating_sub(1);
            // Packed shards end just below min-unpacked-rev; walk the
            // unpacked files upward from there.
            let mut rev = self.min_unpacked_rev()?;
            while self.path_rev(rev).exists() {
                youngest = rev;
                rev += 1;
            }
            let next_ids = if self.inner.format.number < format::MIN_NO_GLOBAL_IDS_FORMAT {
                let (_, ids) = self.read_current()?;
                ids
            } else {
                None
            };
            self.write_current(youngest, next_ids)?;
            Ok(youngest)
        })
    }

    /// Upgrade the repository to the newest format in place.  Never
    /// downgrades.
    pub fn upgrade(&self) -> Result<()> {
        self.with_write_lock(|| {
            let old = self.inner.format;
            if old.number == format::FORMAT_NUMBER {
                return Ok(());
            }

            if old.number < format::MIN_TXN_CURRENT_FORMAT {
                let txn_current = self.inner.path.join(PATH_TXN_CURRENT);
                if !txn_current.exists() {
                    util::create_file(&txn_current, b"0\n")?;
                    util::create_file(&self.inner.path.join(PATH_TXN_CURRENT_LOCK), b"")?;
                }
            }
            if old.number < format::MIN_PROTOREVS_DIR_FORMAT {
                util::ensure_dir_all(&self.inner.path.join(PATH_TXN_PROTOS_DIR))?;
            }
            if old.number < format::MIN_PACKED_FORMAT {
                let min_unpacked = self.inner.path.join(PATH_MIN_UNPACKED_REV);
                if !min_unpacked.exists() {
                    util::create_file(&min_unpacked, b"0\n")?;
                }
            }
            if old.number < format::MIN_CONFIG_FILE_FORMAT
                && !self.inner.path.join(crate::config::CONFIG_FILENAME).exists()
            {
                FsConfig::write_default(&self.inner.path)?;
            }

            // Legacy `current` files carry next-id tokens the new
            // format does not use.
            let (youngest, _) = self.read_current()?;

            // The new layout packs revprops alongside revs; bring the
            // already-packed shards over before stamping.
            let packed_revprops = if old.number >= format::MIN_PACKED_FORMAT {
                crate::pack::collect_packed_revprop_shards(self)?
            } else {
                Vec::new()
            };

            format::write_format(
                &self.inner.path.join(PATH_FORMAT),
                Format {
                    number: format::FORMAT_NUMBER,
                    max_files_per_dir: old.max_files_per_dir,
                },
                true,
            )?;

            if old.number < format::MIN_NO_GLOBAL_IDS_FORMAT {
                self.write_current(youngest, None)?;
            }

            // Only after the stamp do the redundant unpacked revprop
            // files go away.
            crate::pack::remove_unpacked_revprops(&packed_revprops)?;
            Ok(())
        })
    }
}

/// Write the generated revision-0 file: an empty root directory, plus a
/// dated revprops file.
fn write_revision_zero(path: &Path, fmt: &Format) -> Result<()> {
    let empty_dir = crate::tree::unparse_dir_entries(&DirEntries::new());
    let mut body = Vec::new();
    body.extend_from_slice(b"PLAIN\n");
    let rep_offset = 0u64;
    let payload_len = empty_dir.len() as u64;
    let md5: [u8; 16] = {
        use md5::{Digest, Md5};
        Md5::digest(&empty_dir).into()
    };
    body.extend_from_slice(&empty_dir);
    body.extend_from_slice(crate::rep::ENDREP);

    let root_offset = body.len() as u64;
    let root = NodeRevision {
        id: crate::id::NodeRevId::committed("0", "0", 0, root_offset),
        kind: NodeKind::Dir,
        predecessor_id: None,
        predecessor_count: 0,
        created_path: "/".to_string(),
        copyroot_rev: Some(0),
        copyroot_path: "/".to_string(),
        copyfrom: None,
        data_rep: Some(Representation {
            revision: Some(0),
            offset: rep_offset,
            size: payload_len,
            expanded_size: payload_len,
            md5,
            sha1: None,
            txn_id: None,
            uniquifier: None,
        }),
        prop_rep: None,
        is_fresh_txn_root: false,
        mergeinfo_count: 0,
        has_mergeinfo: false,
    };
    root.write(&mut body, fmt.supports_mergeinfo());

    let changes_offset = body.len() as u64;
    body.extend_from_slice(format!("\n{} {}\n", root_offset, changes_offset).as_bytes());

    let rev_path = if fmt.sharded() {
        path.join(PATH_REVS_DIR).join("0").join("0")
    } else {
        path.join(PATH_REVS_DIR).join("0")
    };
    util::create_file(&rev_path, &body)?;

    let mut revprops = PropList::new();
    revprops.insert(
        props::PROP_REVISION_DATE.to_string(),
        props::date_now().into_bytes(),
    );
    let revprops_path = if fmt.sharded() {
        path.join(PATH_REVPROPS_DIR).join("0").join("0")
    } else {
        path.join(PATH_REVPROPS_DIR).join("0")
    };
    util::create_file(&revprops_path, &props::write_hash_block(&revprops))?;
    Ok(())
}
