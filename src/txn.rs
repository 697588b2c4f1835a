//! Transactions: the mutable staging area of a commit
//!
//! A transaction owns a directory of mutable node-rev files, a
//! proto-revision append file guarded by an exclusive writer lock, a
//! changes log, and per-node children/property files.  All mutation
//! entry points live here; the commit pipeline consumes the staged
//! state.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;

use crate::changes::{self, Change, ChangeKind, ChangedPaths};
use crate::error::{FsError, Result};
use crate::format;
use crate::id::{self, NodeRevId, Revnum};
use crate::noderev::{NodeKind, NodeRevision};
use crate::props::{self, PropList};
use crate::rep::{self, RepHeader, Representation};
use crate::repository::Repository;
use crate::revision::{self, RevisionRoot};
use crate::tree::{self, DirEntry};
use crate::util::{self, PathLock};

/// Transaction property marking an out-of-date check request.
pub const PROP_TXN_CHECK_OOD: &str = "svn:check-ood";
/// Transaction property marking a lock check request.
pub const PROP_TXN_CHECK_LOCKS: &str = "svn:check-locks";

/// Bound on name probing when creating transaction directories in
/// formats without a `txn-current` sequence file.
const LEGACY_TXN_NAME_ATTEMPTS: u64 = 99;

pub(crate) fn path_txn_node_rev(repo: &Repository, txn_id: &str, id: &NodeRevId) -> PathBuf {
    repo.path_txn_dir(txn_id)
        .join(format!("node.{}.{}", id.node_id, id.copy_id))
}

pub(crate) fn path_txn_node_props(repo: &Repository, txn_id: &str, id: &NodeRevId) -> PathBuf {
    repo.path_txn_dir(txn_id)
        .join(format!("node.{}.{}.props", id.node_id, id.copy_id))
}

pub(crate) fn path_txn_node_children(repo: &Repository, txn_id: &str, id: &NodeRevId) -> PathBuf {
    repo.path_txn_dir(txn_id)
        .join(format!("node.{}.{}.children", id.node_id, id.copy_id))
}

pub(crate) fn path_txn_changes(repo: &Repository, txn_id: &str) -> PathBuf {
    repo.path_txn_dir(txn_id).join("changes")
}

pub(crate) fn path_txn_props(repo: &Repository, txn_id: &str) -> PathBuf {
    repo.path_txn_dir(txn_id).join("props")
}

pub(crate) fn path_txn_next_ids(repo: &Repository, txn_id: &str) -> PathBuf {
    repo.path_txn_dir(txn_id).join("next-ids")
}

pub(crate) fn path_txn_sha1(repo: &Repository, txn_id: &str, sha1: &[u8; 20]) -> PathBuf {
    repo.path_txn_dir(txn_id).join(hex::encode(sha1))
}

/// Store a mutable node revision into its transaction file.
pub(crate) fn put_node_revision(repo: &Repository, noderev: &NodeRevision) -> Result<()> {
    let txn_id = noderev
        .id
        .txn_id
        .as_deref()
        .ok_or_else(|| FsError::corrupt("Attempted to write a non-transaction node revision"))?;
    let mut block = Vec::new();
    noderev.write(&mut block, repo.format().supports_mergeinfo());
    util::write_atomic(&path_txn_node_rev(repo, txn_id, &noderev.id), &block, None)
}

/// Exclusive hold on a transaction's proto-revision file.  Dropping the
/// guard clears the in-process `being_written` flag and releases the
/// OS lock.
pub(crate) struct ProtoRevGuard {
    repo: Repository,
    txn_id: String,
    _lock: PathLock,
    pub file: File,
    path: PathBuf,
}

impl ProtoRevGuard {
    pub fn len(&self) -> Result<u64> {
        util::file_len(&self.file, &self.path)
    }

    pub fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.file
            .write_all(data)
            .map_err(|e| FsError::io(&self.path, e))
    }

    pub fn truncate_to(&mut self, offset: u64) -> Result<()> {
        self.file
            .set_len(offset)
            .map_err(|e| FsError::io(&self.path, e))?;
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| FsError::io(&self.path, e))?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all().map_err(|e| FsError::io(&self.path, e))
    }
}

impl Drop for ProtoRevGuard {
    fn drop(&mut self) {
        self.repo.with_txn_list(|list| {
            if let Some(entry) = list.get_mut(&self.txn_id) {
                entry.being_written = false;
            }
        });
    }
}

/// Lock the proto-revision file of `txn_id` for writing and open it
/// positioned at its end.  Surfaces `RepBeingWritten` immediately
/// instead of blocking when any other writer holds it.
pub(crate) fn get_writable_proto_rev(repo: &Repository, txn_id: &str) -> Result<ProtoRevGuard> {
    let lock_path = repo.path_txn_proto_rev_lock(txn_id);
    let lock = repo.with_txn_list(|list| -> Result<PathLock> {
        let entry = list.entry(txn_id.to_string()).or_default();
        if entry.being_written {
            return Err(FsError::RepBeingWritten(txn_id.to_string()));
        }
        let lock = match PathLock::try_exclusive(&lock_path)? {
            Some(lock) => lock,
            None => return Err(FsError::RepBeingWritten(txn_id.to_string())),
        };
        entry.being_written = true;
        Ok(lock)
    })?;

    let path = repo.path_txn_proto_rev(txn_id);
    let open = OpenOptions::new().write(true).open(&path);
    let mut file = match open {
        Ok(f) => f,
        Err(e) => {
            repo.with_txn_list(|list| {
                if let Some(entry) = list.get_mut(txn_id) {
                    entry.being_written = false;
                }
            });
            return Err(FsError::io(&path, e));
        }
    };
    if let Err(e) = file.seek(SeekFrom::End(0)) {
        repo.with_txn_list(|list| {
            if let Some(entry) = list.get_mut(txn_id) {
                entry.being_written = false;
            }
        });
        return Err(FsError::io(&path, e));
    }
    Ok(ProtoRevGuard {
        repo: repo.clone(),
        txn_id: txn_id.to_string(),
        _lock: lock,
        file,
        path,
    })
}

/// An in-progress commit rooted at `base_rev`.
pub struct Transaction {
    pub(crate) repo: Repository,
    pub(crate) id: String,
    pub(crate) base_rev: Revnum,
}

impl Transaction {
    /// Begin a transaction against `base_rev`, staging a copy of that
    /// revision's root node-rev.
    pub fn begin(repo: &Repository, base_rev: Revnum) -> Result<Transaction> {
        Self::begin_with_props(repo, base_rev, PropList::new())
    }

    /// Like `begin`, with initial transaction properties (commit
    /// message, author, check markers) staged in the same step.
    pub fn begin_with_props(
        repo: &Repository,
        base_rev: Revnum,
        initial_props: PropList,
    ) -> Result<Transaction> {
        repo.ensure_revision_exists(base_rev)?;
        let txn_id = allocate_txn_id(repo, base_rev)?;

        util::create_file(&repo.path_txn_proto_rev(&txn_id), b"")?;
        util::create_file(&repo.path_txn_proto_rev_lock(&txn_id), b"")?;
        util::create_file(&path_txn_changes(repo, &txn_id), b"")?;
        util::create_file(&path_txn_next_ids(repo, &txn_id), b"0 0\n")?;

        // Stage the base root as this transaction's root.
        let base_root = RevisionRoot::open(repo, base_rev)?;
        let base_noderev = base_root.root_noderev()?;
        let mut root = base_noderev.clone();
        root.predecessor_id = Some(base_noderev.id.clone());
        root.predecessor_count += 1;
        root.copyfrom = None;
        root.is_fresh_txn_root = true;
        root.id = NodeRevId::txn("0", "0", &txn_id);
        put_node_revision(repo, &root)?;

        let mut txn_props = initial_props;
        txn_props.insert(
            props::PROP_REVISION_DATE.to_string(),
            props::date_now().into_bytes(),
        );
        util::write_atomic(
            &path_txn_props(repo, &txn_id),
            &props::write_hash_block(&txn_props),
            None,
        )?;

        repo.with_txn_list(|list| {
            list.entry(txn_id.clone()).or_default();
        });

        Ok(Transaction {
            repo: repo.clone(),
            id: txn_id,
            base_rev,
        })
    }

    /// Reopen an existing transaction by id.
    pub fn open(repo: &Repository, txn_id: &str) -> Result<Transaction> {
        if !repo.path_txn_dir(txn_id).is_dir() {
            return Err(FsError::NoSuchTransaction(txn_id.to_string()));
        }
        let base_rev = txn_id
            .split('-')
            .next()
            .and_then(|t| t.parse::<Revnum>().ok())
            .ok_or_else(|| FsError::corrupt(format!("Malformed transaction id '{}'", txn_id)))?;
        repo.with_txn_list(|list| {
            list.entry(txn_id.to_string()).or_default();
        });
        Ok(Transaction {
            repo: repo.clone(),
            id: txn_id.to_string(),
            base_rev,
        })
    }

    /// Names of all in-progress transactions.
    pub fn list(repo: &Repository) -> Result<Vec<String>> {
        let txns_dir = repo.path().join(crate::repository::PATH_TXNS_DIR);
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&txns_dir).map_err(|e| FsError::io(&txns_dir, e))? {
            let entry = entry.map_err(|e| FsError::io(&txns_dir, e))?;
            if let Some(name) = entry.file_name().to_str() {
                if let Some(id) = name.strip_suffix(".txn") {
                    out.push(id.to_string());
                }
            }
        }
        out.sort();
        Ok(out)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn base_rev(&self) -> Revnum {
        self.base_rev
    }

    pub fn root_id(&self) -> NodeRevId {
        NodeRevId::txn("0", "0", &self.id)
    }

    /// Abort: remove the staging area and the in-process record.
    pub fn abort(self) -> Result<()> {
        purge_txn(&self.repo, &self.id)
    }

    // ==================== Node lookup ====================

    pub fn node_rev(&self, path: &str) -> Result<NodeRevision> {
        let mut node = revision::get_node_revision(&self.repo, &self.root_id())?;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            let entries = revision::dir_entries_of(&self.repo, &node)?;
            let entry = entries
                .get(component)
                .ok_or_else(|| FsError::NotFound(path.to_string()))?;
            node = revision::get_node_revision(&self.repo, &entry.id)?;
        }
        Ok(node)
    }

    pub fn path_exists(&self, path: &str) -> Result<bool> {
        match self.node_rev(path) {
            Ok(_) => Ok(true),
            Err(FsError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Staged fulltext of a file in this transaction.
    pub fn file_contents(&self, path: &str) -> Result<bytes::Bytes> {
        let node = self.node_rev(path)?;
        if node.kind != NodeKind::File {
            return Err(FsError::NotFile(path.to_string()));
        }
        match &node.data_rep {
            Some(rep) => Ok(bytes::Bytes::from(revision::read_rep_fulltext(
                &self.repo, rep,
            )?)),
            None => Ok(bytes::Bytes::new()),
        }
    }

    pub fn node_proplist(&self, path: &str) -> Result<PropList> {
        let node = self.node_rev(path)?;
        node_proplist_of(&self.repo, &node)
    }

    // ==================== Tree mutation ====================

    fn split_parent(path: &str) -> Result<(String, String)> {
        let trimmed = path.trim_matches('/');
        if trimmed.is_empty() {
            return Err(FsError::corrupt("The root directory cannot be replaced"));
        }
        match trimmed.rfind('/') {
            Some(i) => Ok((format!("/{}", &trimmed[..i]), trimmed[i + 1..].to_string())),
            None => Ok(("/".to_string(), trimmed.to_string())),
        }
    }

    /// Return the mutable node revision at `path`, cloning it (and any
    /// ancestors) into the transaction on first touch.
    fn mutable_node(&self, path: &str) -> Result<NodeRevision> {
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        let mut node = revision::get_node_revision(&self.repo, &self.root_id())?;
        let mut walked = String::new();
        for component in components {
            walked.push('/');
            walked.push_str(component);
            let entries = revision::dir_entries_of(&self.repo, &node)?;
            let entry = entries
                .get(component)
                .ok_or_else(|| FsError::NotFound(path.to_string()))?
                .clone();
            let child = revision::get_node_revision(&self.repo, &entry.id)?;
            if child.id.in_txn(&self.id) {
                node = child;
                continue;
            }

            // First touch: clone the child into the transaction.
            let mut clone = child.clone();
            clone.predecessor_id = Some(child.id.clone());
            clone.predecessor_count += 1;
            clone.copyfrom = None;
            clone.created_path = walked.clone();
            clone.is_fresh_txn_root = false;
            clone.id = NodeRevId::txn(&child.id.node_id, &child.id.copy_id, &self.id);
            put_node_revision(&self.repo, &clone)?;
            self.set_entry(
                &node,
                component,
                Some(DirEntry {
                    kind: clone.kind,
                    id: clone.id.clone(),
                }),
            )?;
            node = clone;
        }
        Ok(node)
    }

    /// Write (or delete) one entry of a mutable directory.  Dumps the
    /// directory's committed entries to its children file on first
    /// mutation, then appends one incremental record.
    fn set_entry(&self, parent: &NodeRevision, name: &str, entry: Option<DirEntry>) -> Result<()> {
        let mut parent = parent.clone();
        if !parent.id.in_txn(&self.id) {
            return Err(FsError::corrupt(
                "Can't set entry in an immutable directory",
            ));
        }
        let children_path = path_txn_node_children(&self.repo, &self.id, &parent.id);
        let rep_is_mutable = parent
            .data_rep
            .as_ref()
            .map_or(false, |rep| rep.txn_id.as_deref() == Some(self.id.as_str()));
        if !rep_is_mutable {
            let current = revision::dir_entries_of(&self.repo, &parent)?;
            util::write_atomic(&children_path, &tree::unparse_dir_entries(&current), None)?;
            parent.data_rep = Some(Representation::mutable(&self.id));
            put_node_revision(&self.repo, &parent)?;
        }
        let mut file = OpenOptions::new()
            .append(true)
            .open(&children_path)
            .map_err(|e| FsError::io(&children_path, e))?;
        file.write_all(&tree::unparse_child_mutation(name, entry.as_ref()))
            .map_err(|e| FsError::io(&children_path, e))?;
        Ok(())
    }

    /// Create an empty file node at `path`.
    pub fn make_file(&self, path: &str) -> Result<NodeRevId> {
        self.make_node(path, NodeKind::File)
    }

    /// Create an empty directory node at `path`.
    pub fn make_dir(&self, path: &str) -> Result<NodeRevId> {
        self.make_node(path, NodeKind::Dir)
    }

    fn make_node(&self, path: &str, kind: NodeKind) -> Result<NodeRevId> {
        let (parent_path, name) = Self::split_parent(path)?;
        let parent = self.mutable_node(&parent_path)?;
        if revision::dir_entries_of(&self.repo, &parent)?.contains_key(&name) {
            return Err(FsError::corrupt(format!("Path '{}' already exists", path)));
        }
        let node_id = format!("_{}", self.allocate_node_id()?);
        let id = NodeRevId::txn(&node_id, &parent.id.copy_id, &self.id);
        let created_path = canonical_path(path);
        let noderev = NodeRevision {
            id: id.clone(),
            kind,
            predecessor_id: None,
            predecessor_count: 0,
            created_path: created_path.clone(),
            copyroot_rev: None,
            copyroot_path: created_path.clone(),
            copyfrom: None,
            data_rep: None,
            prop_rep: None,
            is_fresh_txn_root: false,
            mergeinfo_count: 0,
            has_mergeinfo: false,
        };
        put_node_revision(&self.repo, &noderev)?;
        self.set_entry(&parent, &name, Some(DirEntry { kind, id: id.clone() }))?;
        self.add_change(&Change {
            path: created_path,
            noderev_id: Some(id.clone()),
            kind: ChangeKind::Add,
            text_mod: false,
            prop_mod: false,
            node_kind: Some(kind),
            copyfrom: None,
        })?;
        Ok(id)
    }

    /// Delete the entry at `path`.
    pub fn delete(&self, path: &str) -> Result<()> {
        let (parent_path, name) = Self::split_parent(path)?;
        let parent = self.mutable_node(&parent_path)?;
        let entries = revision::dir_entries_of(&self.repo, &parent)?;
        let entry = entries
            .get(&name)
            .ok_or_else(|| FsError::NotFound(path.to_string()))?
            .clone();
        self.set_entry(&parent, &name, None)?;
        self.add_change(&Change {
            path: canonical_path(path),
            noderev_id: Some(entry.id),
            kind: ChangeKind::Delete,
            text_mod: false,
            prop_mod: false,
            node_kind: Some(entry.kind),
            copyfrom: None,
        })?;
        Ok(())
    }

    /// Cheap copy: stage `from_path@from_root` at `to_path`, minting a
    /// fresh copy-id so the new node line is distinguishable from its
    /// source.
    pub fn copy(&self, from_root: &RevisionRoot, from_path: &str, to_path: &str) -> Result<NodeRevId> {
        let src = from_root.node_rev(from_path)?;
        let (parent_path, name) = Self::split_parent(to_path)?;
        let parent = self.mutable_node(&parent_path)?;
        let replaced = revision::dir_entries_of(&self.repo, &parent)?.contains_key(&name);

        let copy_id = format!("_{}", self.allocate_copy_id()?);
        let id = NodeRevId::txn(&src.id.node_id, &copy_id, &self.id);
        let created_path = canonical_path(to_path);
        let mut copy = src.clone();
        copy.predecessor_id = Some(src.id.clone());
        copy.predecessor_count += 1;
        copy.copyfrom = Some((from_root.revision(), canonical_path(from_path)));
        copy.created_path = created_path.clone();
        copy.copyroot_rev = None;
        copy.copyroot_path = created_path.clone();
        copy.is_fresh_txn_root = false;
        copy.id = id.clone();
        put_node_revision(&self.repo, &copy)?;
        self.set_entry(
            &parent,
            &name,
            Some(DirEntry {
                kind: copy.kind,
                id: id.clone(),
            }),
        )?;
        self.add_change(&Change {
            path: created_path,
            noderev_id: Some(id.clone()),
            kind: if replaced {
                ChangeKind::Replace
            } else {
                ChangeKind::Add
            },
            text_mod: false,
            prop_mod: false,
            node_kind: Some(copy.kind),
            copyfrom: copy.copyfrom.clone(),
        })?;
        Ok(id)
    }

    /// Replace the contents of the file at `path`, writing the new
    /// representation into the proto-revision file.
    pub fn apply_text(&self, path: &str, data: &[u8]) -> Result<()> {
        let mut noderev = self.mutable_node(path)?;
        if noderev.kind != NodeKind::File {
            return Err(FsError::NotFile(path.to_string()));
        }

        let base = rep::choose_delta_base(
            &noderev,
            false,
            self.repo.config(),
            |id| revision::get_node_revision(&self.repo, id),
            |rep| revision::rep_chain_length(&self.repo, rep),
        )?;

        let mut proto = get_writable_proto_rev(&self.repo, &self.id)?;
        let rep_offset = proto.len()?;
        let result = self.write_file_rep(&mut proto, rep_offset, &mut noderev, base.as_ref(), data);
        if result.is_err() {
            // Unwind: drop the partial representation from the
            // proto-revision before releasing the writer lock.
            let _ = proto.truncate_to(rep_offset);
            return result;
        }
        drop(proto);

        self.add_change(&Change {
            path: canonical_path(path),
            noderev_id: Some(noderev.id.clone()),
            kind: ChangeKind::Modify,
            text_mod: true,
            prop_mod: false,
            node_kind: Some(NodeKind::File),
            copyfrom: None,
        })
    }

    fn write_file_rep(
        &self,
        proto: &mut ProtoRevGuard,
        rep_offset: u64,
        noderev: &mut NodeRevision,
        base: Option<&Representation>,
        data: &[u8],
    ) -> Result<()> {
        let header = match base {
            Some(b) => RepHeader::Delta {
                base_rev: b.revision.ok_or_else(|| {
                    FsError::corrupt("Delta base representation is not committed")
                })?,
                base_offset: b.offset,
                base_length: b.size,
            },
            None => RepHeader::Plain,
        };
        proto.write_all(header.unparse().as_bytes())?;

        let payload = match base {
            Some(b) => {
                let base_text = revision::read_rep_fulltext(&self.repo, b)?;
                crate::svndiff::encode_delta(&base_text, data)
            }
            None => data.to_vec(),
        };
        proto.write_all(&payload)?;

        let mut sums = rep::RepChecksums::new();
        sums.update(data);
        let (md5, sha1) = sums.finish();
        let uniquifier = format!("{}/_{}", self.id, self.allocate_node_id()?);
        let new_rep = Representation {
            revision: None,
            offset: rep_offset,
            size: payload.len() as u64,
            expanded_size: data.len() as u64,
            md5,
            sha1: Some(sha1),
            txn_id: Some(self.id.clone()),
            uniquifier: Some(uniquifier),
        };

        match get_shared_rep(&self.repo, Some(&self.id), &new_rep, None)? {
            Some(old_rep) => {
                // Identical bytes already exist: give the space back.
                proto.truncate_to(rep_offset)?;
                noderev.data_rep = Some(old_rep);
            }
            None => {
                proto.write_all(rep::ENDREP)?;
                store_sha1_rep_mapping(&self.repo, &self.id, &new_rep)?;
                noderev.data_rep = Some(new_rep);
            }
        }
        put_node_revision(&self.repo, noderev)
    }

    /// Set (or with `None`, remove) one versioned property of the node
    /// at `path`.
    pub fn change_node_prop(&self, path: &str, name: &str, value: Option<&[u8]>) -> Result<()> {
        let mut noderev = self.mutable_node(path)?;
        let mut proplist = node_proplist_of(&self.repo, &noderev)?;
        match value {
            Some(v) => proplist.insert(name.to_string(), v.to_vec()),
            None => proplist.remove(name),
        };
        util::write_atomic(
            &path_txn_node_props(&self.repo, &self.id, &noderev.id),
            &props::write_hash_block(&proplist),
            None,
        )?;

        if name == "svn:mergeinfo" {
            let present = value.is_some();
            if present != noderev.has_mergeinfo {
                noderev.has_mergeinfo = present;
                noderev.mergeinfo_count = if present { 1 } else { 0 };
            }
        }
        let rep_is_mutable = noderev
            .prop_rep
            .as_ref()
            .map_or(false, |rep| rep.txn_id.as_deref() == Some(self.id.as_str()));
        if !rep_is_mutable {
            noderev.prop_rep = Some(Representation::mutable(&self.id));
        }
        put_node_revision(&self.repo, &noderev)?;

        self.add_change(&Change {
            path: canonical_path(path),
            noderev_id: Some(noderev.id.clone()),
            kind: ChangeKind::Modify,
            text_mod: false,
            prop_mod: true,
            node_kind: Some(noderev.kind),
            copyfrom: None,
        })
    }

    // ==================== Changes log ====================

    pub(crate) fn add_change(&self, change: &Change) -> Result<()> {
        let path = path_txn_changes(&self.repo, &self.id);
        let mut out = Vec::new();
        changes::write_change(
            &mut out,
            change,
            self.repo.format().number >= format::MIN_KIND_IN_CHANGED_FORMAT,
        );
        let mut file = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|e| FsError::io(&path, e))?;
        file.write_all(&out).map_err(|e| FsError::io(&path, e))?;
        Ok(())
    }

    /// The folded change list of this transaction (descendants of
    /// deleted directories pruned).
    pub fn changed_paths(&self) -> Result<ChangedPaths> {
        let data = util::read_file(&path_txn_changes(&self.repo, &self.id))?;
        let raw = changes::parse_changes(&data)?;
        changes::process_changes(&raw, false)
    }

    // ==================== Transaction properties ====================

    pub fn proplist(&self) -> Result<PropList> {
        props::parse_hash_block(&util::read_file(&path_txn_props(&self.repo, &self.id))?)
    }

    pub fn change_txn_prop(&self, name: &str, value: Option<&[u8]>) -> Result<()> {
        let mut proplist = self.proplist()?;
        match value {
            Some(v) => proplist.insert(name.to_string(), v.to_vec()),
            None => proplist.remove(name),
        };
        util::write_atomic(
            &path_txn_props(&self.repo, &self.id),
            &props::write_hash_block(&proplist),
            None,
        )
    }

    // ==================== Per-transaction counters ====================

    fn read_next_ids(&self) -> Result<(u64, u64)> {
        let text = util::read_text_file(&path_txn_next_ids(&self.repo, &self.id))?;
        let mut tokens = text.split_whitespace();
        let node = tokens
            .next()
            .and_then(|t| id::base36_parse(t).ok())
            .ok_or_else(|| FsError::corrupt("Corrupt 'next-ids' file"))?;
        let copy = tokens
            .next()
            .and_then(|t| id::base36_parse(t).ok())
            .ok_or_else(|| FsError::corrupt("Corrupt 'next-ids' file"))?;
        Ok((node, copy))
    }

    fn write_next_ids(&self, node: u64, copy: u64) -> Result<()> {
        util::write_atomic(
            &path_txn_next_ids(&self.repo, &self.id),
            format!("{} {}\n", id::base36_unparse(node), id::base36_unparse(copy)).as_bytes(),
            None,
        )
    }

    pub(crate) fn allocate_node_id(&self) -> Result<String> {
        let (node, copy) = self.read_next_ids()?;
        self.write_next_ids(node + 1, copy)?;
        Ok(id::base36_unparse(node))
    }

    pub(crate) fn allocate_copy_id(&self) -> Result<String> {
        let (node, copy) = self.read_next_ids()?;
        self.write_next_ids(node, copy + 1)?;
        Ok(id::base36_unparse(copy))
    }

    pub(crate) fn next_ids(&self) -> Result<(u64, u64)> {
        self.read_next_ids()
    }
}

fn canonical_path(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", trimmed)
    }
}

/// Properties of a node, mutable file or committed rep alike.
pub(crate) fn node_proplist_of(repo: &Repository, noderev: &NodeRevision) -> Result<PropList> {
    match &noderev.prop_rep {
        Some(rep) if rep.txn_id.is_some() => {
            let txn_id = rep.txn_id.as_deref().expect("mutable rep has txn");
            let path = path_txn_node_props(repo, txn_id, &noderev.id);
            props::parse_hash_block(&util::read_file(&path)?)
        }
        Some(rep) => props::parse_hash_block(&revision::read_rep_fulltext(repo, rep)?),
        None => Ok(PropList::new()),
    }
}

/// Allocate a transaction id.  Formats with `txn-current` increment the
/// repository-wide base-36 counter under its lock; older formats probe
/// `<base-rev>-<n>` names with a bounded retry loop.
fn allocate_txn_id(repo: &Repository, base_rev: Revnum) -> Result<String> {
    if repo.format().number >= format::MIN_TXN_CURRENT_FORMAT {
        let txn_id = repo.with_txn_current_lock(|| {
            let path = repo.path().join(crate::repository::PATH_TXN_CURRENT);
            let counter = util::read_text_file(&path)?;
            let counter = counter.trim();
            let next = id::base36_next(counter)?;
            util::write_atomic(&path, format!("{}\n", next).as_bytes(), None)?;
            Ok(format!("{}-{}", base_rev, counter))
        })?;
        let dir = repo.path_txn_dir(&txn_id);
        match std::fs::create_dir(&dir) {
            Ok(()) => Ok(txn_id),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(FsError::corrupt(
                format!("Transaction id '{}' already in use", txn_id),
            )),
            Err(e) => Err(FsError::io(&dir, e)),
        }
    } else {
        for n in 1..=LEGACY_TXN_NAME_ATTEMPTS {
            let txn_id = format!("{}-{}", base_rev, id::base36_unparse(n));
            let dir = repo.path_txn_dir(&txn_id);
            match std::fs::create_dir(&dir) {
                Ok(()) => return Ok(txn_id),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(FsError::io(&dir, e)),
            }
        }
        Err(FsError::UniqueNameExhausted(
            repo.path().join(crate::repository::PATH_TXNS_DIR),
            base_rev,
        ))
    }
}

/// Remove a transaction's directory, proto-revision, lock file, and
/// in-process record.
pub(crate) fn purge_txn(repo: &Repository, txn_id: &str) -> Result<()> {
    let dir = repo.path_txn_dir(txn_id);
    if !dir.exists() {
        return Err(FsError::NoSuchTransaction(txn_id.to_string()));
    }
    std::fs::remove_dir_all(&dir).map_err(|e| FsError::io(&dir, e))?;
    if repo.format().number >= format::MIN_PROTOREVS_DIR_FORMAT {
        for path in [
            repo.path_txn_proto_rev(txn_id),
            repo.path_txn_proto_rev_lock(txn_id),
        ] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(FsError::io(&path, e)),
            }
        }
    }
    repo.with_txn_list(|list| {
        list.remove(txn_id);
    });
    Ok(())
}

/// Rep-sharing lookup for a just-written representation: the commit's
/// in-memory hash first, then this transaction's SHA-1 sidecars, then
/// the repository-level rep-cache.  Cache trouble degrades to a miss.
pub(crate) fn get_shared_rep(
    repo: &Repository,
    txn_id: Option<&str>,
    rep: &Representation,
    reps_hash: Option<&std::collections::HashMap<[u8; 20], Representation>>,
) -> Result<Option<Representation>> {
    if !repo.config().rep_sharing_allowed {
        return Ok(None);
    }
    let sha1 = match &rep.sha1 {
        Some(sha1) => *sha1,
        None => return Ok(None),
    };

    let mut old_rep = reps_hash.and_then(|hash| hash.get(&sha1).cloned());

    if old_rep.is_none() {
        if let Some(txn_id) = txn_id {
            let sidecar = path_txn_sha1(repo, txn_id, &sha1);
            if sidecar.exists() {
                let text = util::read_text_file(&sidecar)?;
                old_rep = Some(Representation::parse(text.trim(), Some(txn_id), false)?);
            }
        }
    }

    if old_rep.is_none() {
        if let Some(hit) = repo.rep_cache_get(&sha1) {
            // A cache row pointing past youngest means the cache is
            // from the future: corruption, not a miss.
            if let Some(rev) = hit.revision {
                if repo.ensure_revision_exists(rev).is_err() {
                    return Err(FsError::corrupt(
                        "Representation cache refers to an unknown revision",
                    ));
                }
            }
            old_rep = Some(hit);
        }
    }

    Ok(old_rep.map(|mut old| {
        old.md5 = rep.md5;
        old.uniquifier = rep.uniquifier.clone();
        old
    }))
}

/// Remember a freshly written data rep under its SHA-1 so retries
/// within this transaction can find it.
pub(crate) fn store_sha1_rep_mapping(
    repo: &Repository,
    txn_id: &str,
    rep: &Representation,
) -> Result<()> {
    if !repo.config().rep_sharing_allowed {
        return Ok(());
    }
    if let Some(sha1) = &rep.sha1 {
        util::write_atomic(
            &path_txn_sha1(repo, txn_id, sha1),
            rep.unparse(false).as_bytes(),
            None,
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fresh_repo() -> (TempDir, Repository) {
        let tmp = TempDir::new().unwrap();
        let repo = Repository::create(&tmp.path().join("db")).unwrap();
        (tmp, repo)
    }

    #[test]
    fn test_begin_creates_staging_area() {
        let (_tmp, repo) = fresh_repo();
        let txn = Transaction::begin(&repo, 0).unwrap();
        assert_eq!(txn.base_rev(), 0);
        assert!(repo.path_txn_dir(txn.id()).is_dir());
        assert!(repo.path_txn_proto_rev(txn.id()).exists());
        assert!(path_txn_changes(&repo, txn.id()).exists());
        assert_eq!(
            util::read_text_file(&path_txn_next_ids(&repo, txn.id())).unwrap(),
            "0 0\n"
        );

        let root = txn.node_rev("/").unwrap();
        assert!(root.is_fresh_txn_root);
        assert_eq!(root.predecessor_count, 1);
        assert!(root.id.in_txn(txn.id()));
    }

    #[test]
    fn test_txn_ids_are_sequential() {
        let (_tmp, repo) = fresh_repo();
        let t1 = Transaction::begin(&repo, 0).unwrap();
        let t2 = Transaction::begin(&repo, 0).unwrap();
        assert_eq!(t1.id(), "0-0");
        assert_eq!(t2.id(), "0-1");
        assert_eq!(Transaction::list(&repo).unwrap(), vec!["0-0", "0-1"]);
    }

    #[test]
    fn test_make_file_and_read_back() {
        let (_tmp, repo) = fresh_repo();
        let txn = Transaction::begin(&repo, 0).unwrap();
        txn.make_file("/iota").unwrap();
        txn.apply_text("/iota", b"This is iota.\n").unwrap();
        assert_eq!(txn.file_contents("/iota").unwrap(), &b"This is iota.\n"[..]);

        let node = txn.node_rev("/iota").unwrap();
        assert_eq!(node.kind, NodeKind::File);
        assert_eq!(node.predecessor_count, 0);
        let rep = node.data_rep.unwrap();
        assert_eq!(rep.expanded_size, 14);
        assert!(rep.txn_id.is_some());
    }

    #[test]
    fn test_mkdir_and_nested_files() {
        let (_tmp, repo) = fresh_repo();
        let txn = Transaction::begin(&repo, 0).unwrap();
        txn.make_dir("/A").unwrap();
        txn.make_dir("/A/B").unwrap();
        txn.make_file("/A/B/pi").unwrap();
        assert!(txn.path_exists("/A/B/pi").unwrap());
        assert!(!txn.path_exists("/A/C").unwrap());
        let node = txn.node_rev("/A").unwrap();
        assert_eq!(node.kind, NodeKind::Dir);
    }

    #[test]
    fn test_delete_stages_removal() {
        let (_tmp, repo) = fresh_repo();
        let txn = Transaction::begin(&repo, 0).unwrap();
        txn.make_file("/doomed").unwrap();
        txn.delete("/doomed").unwrap();
        assert!(!txn.path_exists("/doomed").unwrap());
        // Added then deleted in the same transaction folds away.
        assert!(txn.changed_paths().unwrap().is_empty());
    }

    #[test]
    fn test_change_log_folds() {
        let (_tmp, repo) = fresh_repo();
        let txn = Transaction::begin(&repo, 0).unwrap();
        txn.make_file("/f").unwrap();
        txn.apply_text("/f", b"v1").unwrap();
        let folded = txn.changed_paths().unwrap();
        assert_eq!(folded.len(), 1);
        let change = &folded["/f"];
        assert_eq!(change.kind, ChangeKind::Add);
        assert!(change.text_mod);
    }

    #[test]
    fn test_proto_rev_lock_excludes_writers() {
        let (_tmp, repo) = fresh_repo();
        let txn = Transaction::begin(&repo, 0).unwrap();
        let guard = get_writable_proto_rev(&repo, txn.id()).unwrap();
        match get_writable_proto_rev(&repo, txn.id()) {
            Err(FsError::RepBeingWritten(id)) => assert_eq!(id, txn.id()),
            other => panic!("expected RepBeingWritten, got {:?}", other.map(|_| ())),
        }
        drop(guard);
        get_writable_proto_rev(&repo, txn.id()).unwrap();
    }

    #[test]
    fn test_intra_txn_rep_sharing_truncates_proto_rev() {
        let (_tmp, repo) = fresh_repo();
        let txn = Transaction::begin(&repo, 0).unwrap();
        txn.make_file("/a").unwrap();
        txn.make_file("/b").unwrap();
        txn.apply_text("/a", b"payload").unwrap();
        let len_after_first = util::file_len(
            &File::open(repo.path_txn_proto_rev(txn.id())).unwrap(),
            &repo.path_txn_proto_rev(txn.id()),
        )
        .unwrap();
        txn.apply_text("/b", b"payload").unwrap();
        let len_after_second = util::file_len(
            &File::open(repo.path_txn_proto_rev(txn.id())).unwrap(),
            &repo.path_txn_proto_rev(txn.id()),
        )
        .unwrap();
        // The duplicate bytes were truncated away again.
        assert_eq!(len_after_first, len_after_second);

        let a = txn.node_rev("/a").unwrap().data_rep.unwrap();
        let b = txn.node_rev("/b").unwrap().data_rep.unwrap();
        assert_eq!(a.offset, b.offset);
        assert_eq!(txn.file_contents("/b").unwrap(), &b"payload"[..]);
    }

    #[test]
    fn test_node_props_staging() {
        let (_tmp, repo) = fresh_repo();
        let txn = Transaction::begin(&repo, 0).unwrap();
        txn.make_file("/f").unwrap();
        txn.change_node_prop("/f", "svn:mime-type", Some(b"text/plain"))
            .unwrap();
        let proplist = txn.node_proplist("/f").unwrap();
        assert_eq!(proplist["svn:mime-type"], b"text/plain");
        txn.change_node_prop("/f", "svn:mime-type", None).unwrap();
        assert!(txn.node_proplist("/f").unwrap().is_empty());
    }

    #[test]
    fn test_txn_props() {
        let (_tmp, repo) = fresh_repo();
        let txn = Transaction::begin(&repo, 0).unwrap();
        // svn:date is staged at begin.
        assert!(txn.proplist().unwrap().contains_key(props::PROP_REVISION_DATE));
        txn.change_txn_prop("svn:log", Some(b"a message")).unwrap();
        assert_eq!(txn.proplist().unwrap()["svn:log"], b"a message");
    }

    #[test]
    fn test_abort_removes_everything() {
        let (_tmp, repo) = fresh_repo();
        let txn = Transaction::begin(&repo, 0).unwrap();
        let id = txn.id().to_string();
        txn.make_file("/f").unwrap();
        Transaction::open(&repo, &id).unwrap();
        let proto = repo.path_txn_proto_rev(&id);
        Transaction::open(&repo, &id).unwrap().abort().unwrap();
        assert!(!repo.path_txn_dir(&id).exists());
        assert!(!proto.exists());
        assert!(matches!(
            Transaction::open(&repo, &id),
            Err(FsError::NoSuchTransaction(_))
        ));
    }

    #[test]
    fn test_copy_mints_new_copy_id() {
        let (_tmp, repo) = fresh_repo();
        // Build r1 with a file to copy.
        let txn = Transaction::begin(&repo, 0).unwrap();
        txn.make_file("/src").unwrap();
        txn.apply_text("/src", b"contents").unwrap();
        let rev = crate::commit::commit(&txn).unwrap();
        assert_eq!(rev, 1);

        let root = RevisionRoot::open(&repo, 1).unwrap();
        let txn2 = Transaction::begin(&repo, 1).unwrap();
        let copy_id = txn2.copy(&root, "/src", "/dst").unwrap();
        let src_id = root.node_id("/src").unwrap();
        assert_eq!(copy_id.node_id, src_id.node_id);
        assert_ne!(copy_id.copy_id, src_id.copy_id);

        let copied = txn2.node_rev("/dst").unwrap();
        assert_eq!(copied.copyfrom, Some((1, "/src".to_string())));
        assert_eq!(copied.predecessor_count, 1);
        let folded = txn2.changed_paths().unwrap();
        assert_eq!(folded["/dst"].copyfrom, Some((1, "/src".to_string())));
    }
}
