//! Commit pipeline
//!
//! Turns a transaction into the next revision under the repository
//! write lock: verify the base is still youngest, re-verify path locks,
//! rewrite the node-rev tree into committed form while deltifying
//! mutable representations, serialize the folded change list, append
//! the trailer, move the proto-revision into place, finalize revprops,
//! and bump `current`.  The `current` bump is the linearization point;
//! rep-cache bookkeeping after it can only produce warnings.

use std::collections::HashMap;

use crate::changes::ChangeKind;
use crate::error::{FsError, Result};
use crate::format;
use crate::id::{self, NodeRevId, Revnum};
use crate::locks;
use crate::noderev::{NodeKind, NodeRevision};
use crate::props;
use crate::rep::{self, RepHeader, Representation};
use crate::repository::Repository;
use crate::revision::{self, RevisionRoot};
use crate::tree;
use crate::txn::{self, ProtoRevGuard, Transaction};
use crate::util;

/// Scratch state threaded through the tree rewrite.
struct CommitContext<'a> {
    repo: &'a Repository,
    txn_id: &'a str,
    new_rev: Revnum,
    /// Legacy formats: base values the txn-local counters add onto.
    start_node_id: Option<String>,
    start_copy_id: Option<String>,
    /// Proto-rev length before this commit started appending; used to
    /// detect truncated proto-rev files.
    initial_offset: u64,
    /// New representations to insert into the rep-cache once the
    /// commit is durable.
    reps_to_cache: Vec<Representation>,
    /// In-commit SHA-1 index for prop/dir rep sharing.
    reps_hash: HashMap<[u8; 20], Representation>,
    /// Txn-form id -> committed id, for change-list rewriting.
    new_ids: HashMap<String, NodeRevId>,
}

/// Commit `txn`, returning the new revision number.
pub fn commit(txn: &Transaction) -> Result<Revnum> {
    let repo = txn.repo.clone();
    let (new_rev, reps_to_cache) = repo.with_write_lock(|| commit_body(&repo, txn))?;

    // The revision is durable and visible; rep-cache trouble from here
    // on is reported, never raised.
    if !reps_to_cache.is_empty() {
        if let Some(cache) = repo.rep_cache() {
            if let Err(e) = cache.set_batch(&reps_to_cache) {
                repo.warn("rep-cache", &format!("could not cache representations: {}", e));
            }
        }
    }
    Ok(new_rev)
}

fn commit_body(repo: &Repository, txn: &Transaction) -> Result<(Revnum, Vec<Representation>)> {
    let old_rev = repo.youngest_rev()?;
    if txn.base_rev() != old_rev {
        return Err(FsError::TxnOutOfDate);
    }

    verify_locks(repo, txn)?;

    let (start_node_id, start_copy_id) =
        if repo.format().number < format::MIN_NO_GLOBAL_IDS_FORMAT {
            let (_, ids) = repo.read_current()?;
            let (node, copy) =
                ids.ok_or_else(|| FsError::corrupt("Corrupt 'current' file"))?;
            (Some(node), Some(copy))
        } else {
            (None, None)
        };

    let new_rev = old_rev + 1;

    let mut proto = txn::get_writable_proto_rev(repo, txn.id())?;
    let initial_offset = proto.len()?;

    let mut ctx = CommitContext {
        repo,
        txn_id: txn.id(),
        new_rev,
        start_node_id,
        start_copy_id,
        initial_offset,
        reps_to_cache: Vec::new(),
        reps_hash: HashMap::new(),
        new_ids: HashMap::new(),
    };

    // Rewrite the node-rev tree, children before parents.
    let root_id = txn.root_id();
    let (new_root_id, _) = write_final_rev(&mut ctx, &mut proto, &root_id, true)?
        .ok_or_else(|| FsError::corrupt("Transaction has no root node"))?;

    // Serialize the folded change list.
    let changes_offset = proto.len()?;
    write_final_changed_path_info(&ctx, &mut proto, txn)?;

    // Trailer, then make the bytes durable.
    proto.write_all(format!("\n{} {}\n", new_root_id.offset, changes_offset).as_bytes())?;
    proto.sync()?;

    // Shard directories for the new revision, when it opens a shard.
    let sharded = repo.format().sharded();
    if sharded && new_rev % repo.format().max_files_per_dir == 0 {
        util::ensure_dir(
            &repo.path_rev_shard(new_rev),
            Some(&repo.path().join(crate::repository::PATH_REVS_DIR)),
        )?;
        util::ensure_dir(
            &repo.path_revprops_shard(new_rev),
            Some(&repo.path().join(crate::repository::PATH_REVPROPS_DIR)),
        )?;
    }

    // Move the finished rev file into place.  The proto-rev lock stays
    // held until the file is out of the way.
    let old_rev_path = repo.path_rev(old_rev);
    util::move_into_place(
        &repo.path_txn_proto_rev(txn.id()),
        &repo.path_rev(new_rev),
        Some(&old_rev_path),
    )?;
    drop(proto);

    // Final revprops: drop the commit-check markers, refresh svn:date
    // so datestamps stay monotone, and move the file into place.
    let mut revprops = txn.proplist()?;
    revprops.remove(txn::PROP_TXN_CHECK_OOD);
    revprops.remove(txn::PROP_TXN_CHECK_LOCKS);
    revprops.insert(
        props::PROP_REVISION_DATE.to_string(),
        props::date_now().into_bytes(),
    );
    util::write_atomic(
        &txn::path_txn_props(repo, txn.id()),
        &props::write_hash_block(&revprops),
        None,
    )?;
    util::move_into_place(
        &txn::path_txn_props(repo, txn.id()),
        &repo.path_revprops(new_rev),
        Some(&old_rev_path),
    )?;

    // Advance `current`: the linearization point.
    let next_ids = match (&ctx.start_node_id, &ctx.start_copy_id) {
        (Some(start_node), Some(start_copy)) => {
            let (txn_node, txn_copy) = txn.next_ids()?;
            Some((
                id::base36_add(start_node, &id::base36_unparse(txn_node))?,
                id::base36_add(start_copy, &id::base36_unparse(txn_copy))?,
            ))
        }
        _ => None,
    };
    repo.write_current(new_rev, next_ids)?;

    // The commit has succeeded; cleanup failures are warnings only.
    if let Err(e) = txn::purge_txn(repo, txn.id()) {
        repo.warn("txn-cleanup", &format!("could not purge transaction: {}", e));
    }

    Ok((new_rev, ctx.reps_to_cache))
}

/// Order paths parents-first with each parent's children consecutive,
/// the order lock verification wants.
fn compare_paths(a: &str, b: &str) -> std::cmp::Ordering {
    let split = |p: &str| -> Vec<String> {
        p.split('/')
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect()
    };
    split(a).cmp(&split(b))
}

fn is_below(parent: &str, child: &str) -> bool {
    let parent = parent.trim_end_matches('/');
    if parent.is_empty() {
        return true;
    }
    child.len() > parent.len() + 1
        && child.starts_with(parent)
        && child.as_bytes()[parent.len()] == b'/'
}

/// Re-verify every changed path against the lock store.  Modifications
/// need the path's own lock; adds, deletes and replaces need the whole
/// subtree, so a recursive check at an ancestor lets its descendants be
/// skipped.
fn verify_locks(repo: &Repository, txn: &Transaction) -> Result<()> {
    let changes = txn.changed_paths()?;
    let mut paths: Vec<&String> = changes.keys().collect();
    paths.sort_by(|a, b| compare_paths(a, b));

    let access = repo.access();
    let mut last_recursed: Option<String> = None;
    for path in paths {
        repo.check_cancel()?;
        if let Some(ancestor) = &last_recursed {
            if is_below(ancestor, path) {
                continue;
            }
        }
        let change = &changes[path.as_str()];
        let recurse = change.kind != ChangeKind::Modify;
        locks::allow_locked_operation(
            repo.path(),
            path,
            access.username.as_deref(),
            &access.lock_tokens,
            recurse,
        )?;
        if recurse {
            last_recursed = Some(path.clone());
        }
    }
    Ok(())
}

/// Recursively rewrite the node-rev graph reachable from `id` into
/// committed form, appending node-rev records to the proto-rev file.
/// Returns the committed id and the subtree mergeinfo count, or `None`
/// when the node was not part of this transaction.
fn write_final_rev(
    ctx: &mut CommitContext<'_>,
    proto: &mut ProtoRevGuard,
    id: &NodeRevId,
    at_root: bool,
) -> Result<Option<(NodeRevId, u64)>> {
    if !id.in_txn(ctx.txn_id) {
        return Ok(None);
    }
    ctx.repo.check_cancel()?;
    let mut noderev = revision::get_node_revision(ctx.repo, id)?;
    let track_mergeinfo = ctx.repo.format().supports_mergeinfo();
    let mut subtree_mergeinfo = u64::from(noderev.has_mergeinfo);

    if noderev.kind == NodeKind::Dir {
        // Children first, in deterministic lexicographic order.
        let entries = revision::dir_entries_of(ctx.repo, &noderev)?;
        let mut entries = (*entries).clone();
        for (_, entry) in entries.iter_mut() {
            match write_final_rev(ctx, proto, &entry.id, false)? {
                Some((new_id, child_minfo)) => {
                    entry.id = new_id;
                    subtree_mergeinfo += child_minfo;
                }
                None => {
                    if track_mergeinfo {
                        let child = revision::get_node_revision(ctx.repo, &entry.id)?;
                        subtree_mergeinfo += child.mergeinfo_count;
                    }
                }
            }
        }

        if rep_is_mutable(&noderev.data_rep, ctx.txn_id) {
            let data = tree::unparse_dir_entries(&entries);
            let deltify = ctx.repo.config().deltify_directories;
            let rep = write_container_rep(ctx, proto, &noderev, &data, false, deltify)?;
            noderev.data_rep = Some(rep);
        }
    } else if rep_is_mutable(&noderev.data_rep, ctx.txn_id) {
        // File contents already sit in the proto-rev; stamp the rep
        // with its revision.
        let rep = noderev.data_rep.as_mut().expect("mutable rep present");
        if rep.offset.saturating_add(rep.size) > ctx.initial_offset {
            return Err(FsError::corrupt("Truncated protorev file detected"));
        }
        rep.txn_id = None;
        rep.revision = Some(ctx.new_rev);
    }

    if rep_is_mutable(&noderev.prop_rep, ctx.txn_id) {
        let proplist = txn::node_proplist_of(ctx.repo, &noderev)?;
        let data = props::write_hash_block(&proplist);
        let deltify = ctx.repo.config().deltify_properties;
        let rep = write_container_rep(ctx, proto, &noderev, &data, true, deltify)?;
        noderev.prop_rep = Some(rep);
    }

    if track_mergeinfo && noderev.kind == NodeKind::Dir {
        noderev.mergeinfo_count = subtree_mergeinfo;
    }

    // Rewrite the temporary id into permanent form.
    let my_offset = proto.len()?;
    let node_id = finalize_key(&noderev.id.node_id, ctx.start_node_id.as_deref(), ctx.new_rev)?;
    let copy_id = finalize_key(&noderev.id.copy_id, ctx.start_copy_id.as_deref(), ctx.new_rev)?;
    if noderev.copyroot_rev.is_none() {
        noderev.copyroot_rev = Some(ctx.new_rev);
    }
    let new_id = NodeRevId::committed(&node_id, &copy_id, ctx.new_rev, my_offset);
    let old_key = noderev.id.to_string();
    let had_predecessor = noderev.predecessor_id.is_some();
    noderev.id = new_id.clone();

    if ctx.repo.config().rep_sharing_allowed {
        if let Some(rep) = &noderev.data_rep {
            if noderev.kind == NodeKind::File && rep.revision == Some(ctx.new_rev) {
                ctx.reps_to_cache.push(rep.clone());
            }
        }
        if let Some(rep) = &noderev.prop_rep {
            if rep.revision == Some(ctx.new_rev) {
                ctx.reps_to_cache.push(rep.clone());
                if let Some(sha1) = rep.sha1 {
                    ctx.reps_hash.insert(sha1, rep.clone());
                }
            }
        }
    }

    // SHA-1 of dir and prop reps is never persisted.
    if noderev.kind == NodeKind::Dir {
        if let Some(rep) = &mut noderev.data_rep {
            rep.sha1 = None;
        }
    }
    if let Some(rep) = &mut noderev.prop_rep {
        rep.sha1 = None;
    }

    noderev.is_fresh_txn_root = false;

    if at_root {
        validate_root_noderev(ctx.repo, &noderev, ctx.new_rev)?;
    }

    let mut block = Vec::new();
    noderev.write(&mut block, track_mergeinfo);
    proto.write_all(&block)?;

    // Fresh node lines get their origin recorded.
    if !had_predecessor {
        ctx.repo.set_node_origin(&node_id, &new_id)?;
    }

    ctx.new_ids.insert(old_key, new_id.clone());
    Ok(Some((new_id, subtree_mergeinfo)))
}

fn rep_is_mutable(rep: &Option<Representation>, txn_id: &str) -> bool {
    rep.as_ref()
        .map_or(false, |rep| rep.txn_id.as_deref() == Some(txn_id))
}

/// Turn a (possibly `_`-prefixed) transaction-local key into its
/// committed form.
fn finalize_key(key: &str, start: Option<&str>, rev: Revnum) -> Result<String> {
    match key.strip_prefix('_') {
        None => Ok(key.to_string()),
        Some(local) => match start {
            None => Ok(format!("{}-{}", local, rev)),
            Some(start) => id::base36_add(start, local),
        },
    }
}

/// Serialize a directory or property container into the proto-rev,
/// PLAIN or deltified against the chosen base, with rep sharing.
fn write_container_rep(
    ctx: &mut CommitContext<'_>,
    proto: &mut ProtoRevGuard,
    noderev: &NodeRevision,
    data: &[u8],
    props: bool,
    deltify: bool,
) -> Result<Representation> {
    let base = if deltify {
        rep::choose_delta_base(
            noderev,
            props,
            ctx.repo.config(),
            |id| revision::get_node_revision(ctx.repo, id),
            |rep| revision::rep_chain_length(ctx.repo, rep),
        )?
    } else {
        None
    };

    let offset = proto.len()?;
    let header = match &base {
        Some(b) => RepHeader::Delta {
            base_rev: b
                .revision
                .ok_or_else(|| FsError::corrupt("Delta base representation is not committed"))?,
            base_offset: b.offset,
            base_length: b.size,
        },
        None => RepHeader::Plain,
    };
    proto.write_all(header.unparse().as_bytes())?;
    let payload = match &base {
        Some(b) => {
            let base_text = revision::read_rep_fulltext(ctx.repo, b)?;
            crate::svndiff::encode_delta(&base_text, data)
        }
        None => data.to_vec(),
    };
    proto.write_all(&payload)?;

    let mut sums = rep::RepChecksums::new();
    sums.update(data);
    let (md5, sha1) = sums.finish();
    let new_rep = Representation {
        revision: Some(ctx.new_rev),
        offset,
        size: payload.len() as u64,
        expanded_size: data.len() as u64,
        md5,
        sha1: Some(sha1),
        txn_id: None,
        uniquifier: None,
    };

    match txn::get_shared_rep(ctx.repo, Some(ctx.txn_id), &new_rep, Some(&ctx.reps_hash))? {
        Some(old_rep) => {
            proto.truncate_to(offset)?;
            Ok(old_rep)
        }
        None => {
            proto.write_all(rep::ENDREP)?;
            Ok(new_rep)
        }
    }
}

/// The root of revision N must extend the root of revision N-1 by
/// exactly one predecessor.
fn validate_root_noderev(
    repo: &Repository,
    root_noderev: &NodeRevision,
    rev: Revnum,
) -> Result<()> {
    let head_root = RevisionRoot::open(repo, rev - 1)?.root_noderev()?;
    if root_noderev.predecessor_count != head_root.predecessor_count + 1 {
        return Err(FsError::corrupt(format!(
            "predecessor count for the root node-revision is wrong: found ({}+{} != {}), committing r{}",
            head_root.predecessor_count,
            1,
            root_noderev.predecessor_count,
            rev
        )));
    }
    Ok(())
}

/// Write the folded change list with txn-form ids swapped for their
/// committed counterparts.  Deletes may keep a dangling temporary id;
/// nothing ever dereferences them.
fn write_final_changed_path_info(
    ctx: &CommitContext<'_>,
    proto: &mut ProtoRevGuard,
    txn: &Transaction,
) -> Result<()> {
    let mut changes = txn.changed_paths()?;
    for change in changes.values_mut() {
        if let Some(id) = &change.noderev_id {
            if id.is_txn() && change.kind != ChangeKind::Delete {
                if let Some(new_id) = ctx.new_ids.get(&id.to_string()) {
                    change.noderev_id = Some(new_id.clone());
                }
            }
        }
    }
    let mut out = Vec::new();
    crate::changes::write_changed_paths(
        &mut out,
        &changes,
        ctx.repo.format().number >= format::MIN_KIND_IN_CHANGED_FORMAT,
    );
    proto.write_all(&out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::Repository;
    use tempfile::TempDir;

    fn fresh_repo() -> (TempDir, Repository) {
        let tmp = TempDir::new().unwrap();
        let repo = Repository::create(&tmp.path().join("db")).unwrap();
        (tmp, repo)
    }

    fn commit_file(repo: &Repository, base: Revnum, path: &str, data: &[u8]) -> Revnum {
        let txn = Transaction::begin(repo, base).unwrap();
        if !txn.path_exists(path).unwrap() {
            txn.make_file(path).unwrap();
        }
        txn.apply_text(path, data).unwrap();
        commit(&txn).unwrap()
    }

    #[test]
    fn test_single_file_commit() {
        let (_tmp, repo) = fresh_repo();
        let rev = commit_file(&repo, 0, "/a", b"hello\n");
        assert_eq!(rev, 1);
        assert_eq!(repo.youngest_rev().unwrap(), 1);

        let root = RevisionRoot::open(&repo, 1).unwrap();
        assert_eq!(root.file_contents("/a").unwrap(), &b"hello\n"[..]);

        let node = root.node_rev("/a").unwrap();
        let rep = node.data_rep.unwrap();
        assert_eq!(rep.expanded_size, 6);
        assert_eq!(hex::encode(rep.md5), "b1946ac92492d2347c6235b4d2611184");
        assert_eq!(rep.revision, Some(1));
        // Chain root: stored as PLAIN.
        assert_eq!(crate::revision::rep_chain_length(&repo, &rep).unwrap(), 0);
    }

    #[test]
    fn test_out_of_date_rejection() {
        let (_tmp, repo) = fresh_repo();
        let t1 = Transaction::begin(&repo, 0).unwrap();
        let t2 = Transaction::begin(&repo, 0).unwrap();
        t1.make_file("/one").unwrap();
        t2.make_file("/two").unwrap();
        assert_eq!(commit(&t1).unwrap(), 1);
        assert!(matches!(commit(&t2), Err(FsError::TxnOutOfDate)));
        assert_eq!(repo.youngest_rev().unwrap(), 1);
    }

    #[test]
    fn test_commit_purges_transaction() {
        let (_tmp, repo) = fresh_repo();
        let txn = Transaction::begin(&repo, 0).unwrap();
        let id = txn.id().to_string();
        txn.make_file("/f").unwrap();
        commit(&txn).unwrap();
        assert!(!repo.path_txn_dir(&id).exists());
        assert!(!repo.path_txn_proto_rev(&id).exists());
        assert!(Transaction::list(&repo).unwrap().is_empty());
    }

    #[test]
    fn test_changed_paths_of_committed_revision() {
        let (_tmp, repo) = fresh_repo();
        let txn = Transaction::begin(&repo, 0).unwrap();
        txn.make_dir("/d").unwrap();
        txn.make_file("/d/f").unwrap();
        txn.apply_text("/d/f", b"data").unwrap();
        let rev = commit(&txn).unwrap();

        let changed = RevisionRoot::open(&repo, rev)
            .unwrap()
            .changed_paths()
            .unwrap();
        assert_eq!(changed.len(), 2);
        assert_eq!(changed["/d"].kind, ChangeKind::Add);
        assert_eq!(changed["/d/f"].kind, ChangeKind::Add);
        assert!(changed["/d/f"].text_mod);
        // Committed ids replace the temporary ones.
        assert!(!changed["/d/f"].noderev_id.as_ref().unwrap().is_txn());
    }

    #[test]
    fn test_successive_commits_chain_predecessors() {
        let (_tmp, repo) = fresh_repo();
        commit_file(&repo, 0, "/f", b"v1");
        commit_file(&repo, 1, "/f", b"v2");
        commit_file(&repo, 2, "/f", b"v3");

        let root = RevisionRoot::open(&repo, 3).unwrap();
        assert_eq!(root.file_contents("/f").unwrap(), &b"v3"[..]);
        let node = root.node_rev("/f").unwrap();
        assert_eq!(node.predecessor_count, 2);

        // Root node line stays 0.0 and counts every revision.
        let rev_root = root.root_noderev().unwrap();
        assert_eq!(rev_root.id.node_id, "0");
        assert_eq!(rev_root.predecessor_count, 3);
    }

    #[test]
    fn test_rep_sharing_across_revisions() {
        let (_tmp, repo) = fresh_repo();
        commit_file(&repo, 0, "/a", b"payload");
        let txn = Transaction::begin(&repo, 1).unwrap();
        txn.make_file("/b").unwrap();
        txn.apply_text("/b", b"payload").unwrap();
        commit(&txn).unwrap();

        let r1 = RevisionRoot::open(&repo, 1).unwrap();
        let r2 = RevisionRoot::open(&repo, 2).unwrap();
        let rep_a = r1.node_rev("/a").unwrap().data_rep.unwrap();
        let rep_b = r2.node_rev("/b").unwrap().data_rep.unwrap();
        assert!(rep_a.same_location(&rep_b));
        assert_eq!(rep_a.size, rep_b.size);
        assert_eq!(repo.rep_cache().unwrap().count().unwrap(), 1);
        assert_eq!(r2.file_contents("/b").unwrap(), &b"payload"[..]);
    }

    #[test]
    fn test_delta_chain_against_predecessor() {
        let (_tmp, repo) = fresh_repo();
        commit_file(&repo, 0, "/f", b"aaaaaaaaaaaaaaaa");
        commit_file(&repo, 1, "/f", b"aaaaaaaaaaaaaaaab");

        let root = RevisionRoot::open(&repo, 2).unwrap();
        let rep = root.node_rev("/f").unwrap().data_rep.unwrap();
        // One hop back to the PLAIN base in r1.
        assert_eq!(crate::revision::rep_chain_length(&repo, &rep).unwrap(), 1);
        assert_eq!(root.file_contents("/f").unwrap(), &b"aaaaaaaaaaaaaaaab"[..]);
    }

    #[test]
    fn test_lock_verification_blocks_commit() {
        let (_tmp, repo) = fresh_repo();
        commit_file(&repo, 0, "/f", b"v1");
        locks::set_lock(repo.path(), "/f", None, "alice", None, None, false).unwrap();

        // Bob's commit trips over Alice's lock.
        let txn = Transaction::begin(&repo, 1).unwrap();
        txn.apply_text("/f", b"v2").unwrap();
        repo.set_access(crate::repository::AccessContext {
            username: Some("bob".into()),
            lock_tokens: Default::default(),
        });
        assert!(matches!(
            commit(&txn),
            Err(FsError::LockVerification { .. })
        ));

        // Alice with her token gets through.
        let lock = locks::get_lock(repo.path(), "/f").unwrap().unwrap();
        let mut tokens = std::collections::BTreeSet::new();
        tokens.insert(lock.token);
        repo.set_access(crate::repository::AccessContext {
            username: Some("alice".into()),
            lock_tokens: tokens,
        });
        let txn = Transaction::begin(&repo, 1).unwrap();
        txn.apply_text("/f", b"v2").unwrap();
        assert_eq!(commit(&txn).unwrap(), 2);
    }

    #[test]
    fn test_txn_props_become_revprops_without_check_markers() {
        let (_tmp, repo) = fresh_repo();
        let mut initial = crate::props::PropList::new();
        initial.insert("svn:log".into(), b"a message".to_vec());
        initial.insert(txn::PROP_TXN_CHECK_LOCKS.into(), b"true".to_vec());
        let txn = Transaction::begin_with_props(&repo, 0, initial).unwrap();
        txn.make_file("/f").unwrap();
        let rev = commit(&txn).unwrap();
        assert_eq!(
            repo.revision_prop(rev, "svn:log").unwrap().unwrap(),
            b"a message"
        );
        // The commit-check markers never reach the revprops.
        assert!(repo
            .revision_prop(rev, txn::PROP_TXN_CHECK_LOCKS)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_commit_sets_monotone_date() {
        let (_tmp, repo) = fresh_repo();
        commit_file(&repo, 0, "/f", b"x");
        let d0 = repo.revision_prop(0, props::PROP_REVISION_DATE).unwrap().unwrap();
        let d1 = repo.revision_prop(1, props::PROP_REVISION_DATE).unwrap().unwrap();
        let t0 = props::parse_date(std::str::from_utf8(&d0).unwrap()).unwrap();
        let t1 = props::parse_date(std::str::from_utf8(&d1).unwrap()).unwrap();
        assert!(t1 >= t0);
    }

    #[test]
    fn test_commit_preserves_node_props() {
        let (_tmp, repo) = fresh_repo();
        let txn = Transaction::begin(&repo, 0).unwrap();
        txn.make_file("/f").unwrap();
        txn.change_node_prop("/f", "svn:eol-style", Some(b"native"))
            .unwrap();
        let rev = commit(&txn).unwrap();

        let root = RevisionRoot::open(&repo, rev).unwrap();
        let proplist = root.node_proplist("/f").unwrap();
        assert_eq!(proplist["svn:eol-style"], b"native");
        // Prop reps never persist a SHA-1.
        let node = root.node_rev("/f").unwrap();
        assert!(node.prop_rep.unwrap().sha1.is_none());
    }

    #[test]
    fn test_mergeinfo_flag_propagates_to_ancestors() {
        let (_tmp, repo) = fresh_repo();
        let txn = Transaction::begin(&repo, 0).unwrap();
        txn.make_dir("/branches").unwrap();
        txn.make_dir("/branches/b1").unwrap();
        txn.change_node_prop("/branches/b1", "svn:mergeinfo", Some(b"/trunk:1-3"))
            .unwrap();
        let rev = commit(&txn).unwrap();

        let root = RevisionRoot::open(&repo, rev).unwrap();
        assert!(root.node_rev("/branches/b1").unwrap().has_mergeinfo);
        assert_eq!(root.node_rev("/branches").unwrap().mergeinfo_count, 1);
        assert_eq!(root.root_noderev().unwrap().mergeinfo_count, 1);
        assert!(!root.root_noderev().unwrap().has_mergeinfo);
    }

    #[test]
    fn test_empty_file_commit() {
        let (_tmp, repo) = fresh_repo();
        let txn = Transaction::begin(&repo, 0).unwrap();
        txn.make_file("/empty").unwrap();
        txn.apply_text("/empty", b"").unwrap();
        let rev = commit(&txn).unwrap();

        let root = RevisionRoot::open(&repo, rev).unwrap();
        assert_eq!(root.file_contents("/empty").unwrap().len(), 0);
        let rep = root.node_rev("/empty").unwrap().data_rep.unwrap();
        assert_eq!(rep.expanded_size, 0);
        assert_eq!(
            rep.sha1.map(hex::encode).unwrap(),
            "da39a3ee5e6b4b0d3255bfef95601890afd80709"
        );
    }
}
