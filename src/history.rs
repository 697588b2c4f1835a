//! Revision-hunt algorithms
//!
//! Navigations over committed history: finding the revision in effect
//! at a point in time, bisecting for the revision that first deleted a
//! path, and enumerating the revisions that touched a file across
//! copies.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::error::{FsError, Result};
use crate::id::Revnum;
use crate::props::{self, PropList};
use crate::repository::Repository;
use crate::revision::{self, RevisionRoot};

fn revision_time(repo: &Repository, rev: Revnum) -> Result<DateTime<Utc>> {
    let date = repo
        .revision_prop(rev, props::PROP_REVISION_DATE)?
        .ok_or_else(|| FsError::corrupt(format!("Failed to find time on revision {}", rev)))?;
    let text = std::str::from_utf8(&date)
        .map_err(|_| FsError::corrupt(format!("Malformed datestamp on revision {}", rev)))?;
    props::parse_date(text)
}

/// Largest revision whose `svn:date` is at or before `tm`.  Assumes
/// datestamps are monotone: binary search over `[0, youngest]`.
/// Returns 0 for a time before revision 1 and youngest for a time
/// after the newest commit.
pub fn dated_revision(repo: &Repository, tm: DateTime<Utc>) -> Result<Revnum> {
    let youngest = repo.youngest_rev()?;
    let mut bot: Revnum = 0;
    let mut top = youngest;

    while bot <= top {
        let mid = (top + bot) / 2;
        let this_time = revision_time(repo, mid)?;

        if this_time > tm {
            // Overshot.
            if mid == 0 {
                return Ok(0);
            }
            let previous_time = revision_time(repo, mid - 1)?;
            if previous_time <= tm {
                return Ok(mid - 1);
            }
            top = mid - 1;
        } else if this_time < tm {
            // Undershot.
            if mid + 1 > youngest {
                return Ok(youngest);
            }
            let next_time = revision_time(repo, mid + 1)?;
            if next_time > tm {
                return Ok(mid);
            }
            bot = mid + 1;
        } else {
            return Ok(mid);
        }
    }
    Ok(youngest)
}

/// Relationship of two node-rev ids, in the order the bisection wants.
#[derive(PartialEq, Eq, Clone, Copy)]
enum IdRelation {
    Same,
    Related,
    Unrelated,
}

fn relate(
    a: &crate::id::NodeRevId,
    b: &crate::id::NodeRevId,
) -> IdRelation {
    if a == b {
        IdRelation::Same
    } else if a.is_related_to(b) {
        IdRelation::Related
    } else {
        IdRelation::Unrelated
    }
}

/// Find the revision in `[start, end]` at which `path` was first
/// deleted (or replaced by an unrelated node).  Returns `None` when the
/// path does not exist at `start` or survives to `end` unreplaced.
///
/// The bisection decides by comparing node-id identity at the probe
/// against the start node, together with the youngest copy event
/// governing the probe: an unrelated node, a missing path, or a copy
/// younger than `start` all mean the deletion lies at or below the
/// probe; a related node with no intervening copy means it lies above.
pub fn deleted_rev(
    repo: &Repository,
    path: &str,
    start: Revnum,
    end: Revnum,
) -> Result<Option<Revnum>> {
    let (mut start, mut end) = if start <= end { (start, end) } else { (end, start) };
    repo.ensure_revision_exists(end)?;

    // The path must exist at start.
    let start_root = RevisionRoot::open(repo, start)?;
    let start_node_id = match start_root.node_rev(path) {
        Ok(node) => node.id,
        Err(FsError::NotFound(_)) => return Ok(None),
        Err(e) => return Err(e),
    };

    // And must be deleted (or replaced) somewhere at or before end.
    let end_root = RevisionRoot::open(repo, end)?;
    match end_root.node_rev(path) {
        Err(FsError::NotFound(_)) => {}
        Err(e) => return Err(e),
        Ok(end_node) => {
            if relate(&start_node_id, &end_node.id) != IdRelation::Unrelated {
                match end_root.closest_copy(path)? {
                    Some((copy_rev, _)) if copy_rev > start => {}
                    _ => return Ok(None),
                }
            }
        }
    }

    let mut mid = (start + end) / 2;
    loop {
        repo.check_cancel()?;
        let root = RevisionRoot::open(repo, mid)?;
        match root.node_rev(path) {
            Err(FsError::NotFound(_)) => {
                // Deleted at or before the probe: look lower.
                end = mid;
                mid = (start + mid) / 2;
            }
            Err(e) => return Err(e),
            Ok(node) => {
                let rel = relate(&start_node_id, &node.id);
                let copy = root.closest_copy(path)?;
                if rel == IdRelation::Unrelated
                    || copy.map_or(false, |(copy_rev, _)| copy_rev > start)
                {
                    // Replaced at or before the probe: look lower.
                    end = mid;
                    mid = (start + mid) / 2;
                } else if end - mid == 1 {
                    return Ok(Some(end));
                } else {
                    // Still the original node: look higher.
                    start = mid;
                    mid = (start + end) / 2;
                }
            }
        }
    }
}

/// One step in a file's history.
#[derive(Debug, Clone)]
pub struct FileRevision {
    /// Path of the file as of `revision` (it moves across copies).
    pub path: String,
    pub revision: Revnum,
    pub rev_props: PropList,
    pub node_props: PropList,
    /// Property changes against the previous step (`None` = removed).
    pub prop_diffs: BTreeMap<String, Option<Vec<u8>>>,
    /// The contents differ from the previous step.  Always true for
    /// the first step, whose delta base is the empty stream.
    pub contents_changed: bool,
    /// The revision was reached by merge tracking rather than plain
    /// ancestry.
    pub merged: bool,
}

/// Enumerate the revisions in `[start, end]` that changed the file at
/// `path@end`, oldest first, following the node's ancestry across
/// copies.  `include_merged` additionally admits merge-tracked
/// revisions; without mergeinfo recorded there are none.
pub fn file_revs(
    repo: &Repository,
    path: &str,
    start: Revnum,
    end: Revnum,
    include_merged: bool,
) -> Result<Vec<FileRevision>> {
    let (start, end) = if start <= end { (start, end) } else { (end, start) };
    // Merged revisions come from recorded svn:mergeinfo; a history
    // with none recorded contributes an empty merged set either way.
    let _ = include_merged;

    let end_root = RevisionRoot::open(repo, end)?;
    let mut node = end_root.node_rev(path)?;
    if node.kind != crate::noderev::NodeKind::File {
        return Err(FsError::NotFile(path.to_string()));
    }

    // Collect (path, revision) tuples in descending order of revision.
    let mut tuples: Vec<(String, Revnum)> = Vec::new();
    loop {
        repo.check_cancel()?;
        let created_rev = node
            .id
            .rev
            .ok_or_else(|| FsError::corrupt("Committed node without a revision"))?;
        if created_rev < start {
            break;
        }
        tuples.push((node.created_path.clone(), created_rev));
        match &node.predecessor_id {
            Some(pred) => node = revision::get_node_revision(repo, pred)?,
            None => break,
        }
    }

    // Emit oldest to newest, carrying the previous step for diffs.
    let mut out = Vec::with_capacity(tuples.len());
    let mut prev: Option<(PropList, Option<crate::rep::Representation>)> = None;
    for (step_path, rev) in tuples.into_iter().rev() {
        repo.check_cancel()?;
        let root = RevisionRoot::open(repo, rev)?;
        let step_node = root.node_rev(&step_path)?;
        let node_props = crate::txn::node_proplist_of(repo, &step_node)?;
        let rev_props = repo.revision_proplist(rev)?;

        let (prop_diffs, contents_changed) = match &prev {
            None => (
                props::prop_diff(&PropList::new(), &node_props),
                true,
            ),
            Some((prev_props, prev_rep)) => {
                let changed = match (prev_rep, &step_node.data_rep) {
                    (None, None) => false,
                    (Some(a), Some(b)) => {
                        !(a.same_location(b) && a.uniquifier == b.uniquifier)
                    }
                    _ => true,
                };
                (props::prop_diff(prev_props, &node_props), changed)
            }
        };

        prev = Some((node_props.clone(), step_node.data_rep.clone()));
        out.push(FileRevision {
            path: step_path,
            revision: rev,
            rev_props,
            node_props,
            prop_diffs,
            contents_changed,
            merged: false,
        });
    }
    Ok(out)
}

/// Text delta between two steps of a file's history: an svndiff stream
/// from the previous step's fulltext (empty for the first step) to the
/// current one.  Computed on demand so callers that only want metadata
/// never pay for it.
pub fn file_rev_delta(
    repo: &Repository,
    previous: Option<&FileRevision>,
    current: &FileRevision,
) -> Result<Vec<u8>> {
    let current_text = RevisionRoot::open(repo, current.revision)?
        .file_contents(&current.path)?;
    let previous_text = match previous {
        Some(step) => RevisionRoot::open(repo, step.revision)?
            .file_contents(&step.path)?
            .to_vec(),
        None => Vec::new(),
    };
    Ok(crate::svndiff::encode_delta(&previous_text, &current_text))
}
