//! Changed-path records and folding
//!
//! Each transaction appends raw change entries to its changes log; the
//! commit folds them into one record per path before writing the final
//! revision, and readers fold again (without descendant pruning, since
//! the committed stream is already folded).

use std::collections::BTreeMap;

use crate::error::{FsError, Result};
use crate::id::{NodeRevId, Revnum};
use crate::noderev::NodeKind;

const ACTION_MODIFY: &str = "modify";
const ACTION_ADD: &str = "add";
const ACTION_DELETE: &str = "delete";
const ACTION_REPLACE: &str = "replace";
const ACTION_RESET: &str = "reset";
const FLAG_TRUE: &str = "true";
const FLAG_FALSE: &str = "false";

/// What happened to a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Modify,
    Add,
    Delete,
    Replace,
    /// Internal: cancels any accumulated change for the path.
    Reset,
}

impl ChangeKind {
    fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Modify => ACTION_MODIFY,
            ChangeKind::Add => ACTION_ADD,
            ChangeKind::Delete => ACTION_DELETE,
            ChangeKind::Replace => ACTION_REPLACE,
            ChangeKind::Reset => ACTION_RESET,
        }
    }

    fn parse(s: &str) -> Result<ChangeKind> {
        match s {
            ACTION_MODIFY => Ok(ChangeKind::Modify),
            ACTION_ADD => Ok(ChangeKind::Add),
            ACTION_DELETE => Ok(ChangeKind::Delete),
            ACTION_REPLACE => Ok(ChangeKind::Replace),
            ACTION_RESET => Ok(ChangeKind::Reset),
            _ => Err(FsError::corrupt("Invalid change kind in rev file")),
        }
    }
}

/// One raw entry of a changes log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub path: String,
    /// Absent only for resets.
    pub noderev_id: Option<NodeRevId>,
    pub kind: ChangeKind,
    pub text_mod: bool,
    pub prop_mod: bool,
    pub node_kind: Option<NodeKind>,
    pub copyfrom: Option<(Revnum, String)>,
}

/// A folded per-path change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathChange {
    pub noderev_id: Option<NodeRevId>,
    pub kind: ChangeKind,
    pub text_mod: bool,
    pub prop_mod: bool,
    pub node_kind: Option<NodeKind>,
    pub copyfrom: Option<(Revnum, String)>,
}

/// Folded map, lexicographic by path.
pub type ChangedPaths = BTreeMap<String, PathChange>;

/// Merge one raw change into the folded map, enforcing the ordering
/// sanity rules.
pub fn fold_change(changes: &mut ChangedPaths, change: &Change) -> Result<()> {
    if let Some(old) = changes.get_mut(&change.path) {
        // Only a reset may omit the node revision id.
        if change.noderev_id.is_none() && change.kind != ChangeKind::Reset {
            return Err(FsError::corrupt("Missing required node revision ID"));
        }
        // The id must continue the previous record's node line unless
        // that record was a deletion.
        if let Some(new_id) = &change.noderev_id {
            if old.noderev_id.as_ref() != Some(new_id) && old.kind != ChangeKind::Delete {
                return Err(FsError::corrupt(
                    "Invalid change ordering: new node revision ID without delete",
                ));
            }
        }
        // Only add, replace, or reset may follow a deletion.
        if old.kind == ChangeKind::Delete
            && !matches!(
                change.kind,
                ChangeKind::Add | ChangeKind::Replace | ChangeKind::Reset
            )
        {
            return Err(FsError::corrupt(
                "Invalid change ordering: non-add change on deleted path",
            ));
        }
        // An add may only follow a delete or reset.
        if change.kind == ChangeKind::Add
            && old.kind != ChangeKind::Delete
            && old.kind != ChangeKind::Reset
        {
            return Err(FsError::corrupt(
                "Invalid change ordering: add change on preexisting path",
            ));
        }

        match change.kind {
            ChangeKind::Reset => {
                changes.remove(&change.path);
            }
            ChangeKind::Delete => {
                if old.kind == ChangeKind::Add {
                    // Added and deleted within the same transaction:
                    // drop the path altogether.
                    changes.remove(&change.path);
                } else {
                    old.kind = ChangeKind::Delete;
                    old.text_mod = change.text_mod;
                    old.prop_mod = change.prop_mod;
                    old.copyfrom = None;
                    old.node_kind = change.node_kind;
                }
            }
            ChangeKind::Add | ChangeKind::Replace => {
                // An add here follows a delete, so it becomes a replace.
                old.kind = ChangeKind::Replace;
                old.noderev_id = change.noderev_id.clone();
                old.text_mod = change.text_mod;
                old.prop_mod = change.prop_mod;
                old.copyfrom = change.copyfrom.clone();
                old.node_kind = change.node_kind;
            }
            ChangeKind::Modify => {
                old.text_mod |= change.text_mod;
                old.prop_mod |= change.prop_mod;
                old.node_kind = change.node_kind;
            }
        }
    } else if change.kind != ChangeKind::Reset {
        changes.insert(
            change.path.clone(),
            PathChange {
                noderev_id: change.noderev_id.clone(),
                kind: change.kind,
                text_mod: change.text_mod,
                prop_mod: change.prop_mod,
                node_kind: change.node_kind,
                copyfrom: change.copyfrom.clone(),
            },
        );
    }
    Ok(())
}

/// True when `child` lies strictly below `parent` (separator-based).
fn is_child_path(parent: &str, child: &str) -> bool {
    if parent.is_empty() || parent == "/" {
        return !child.is_empty() && child != "/" && child != parent;
    }
    let parent = parent.trim_end_matches('/');
    child.len() > parent.len() + 1
        && child.starts_with(parent)
        && child.as_bytes()[parent.len()] == b'/'
}

/// Fold a sequence of raw changes.  When `prefolded` is false (the
/// transaction-log case) a delete or replace of a directory discards
/// all accumulated changes strictly below it; the committed stream is
/// already folded, so readers pass `prefolded = true` and skip the
/// pruning.
pub fn process_changes(changes: &[Change], prefolded: bool) -> Result<ChangedPaths> {
    let mut folded = ChangedPaths::new();
    for change in changes {
        fold_change(&mut folded, change)?;

        if !prefolded && matches!(change.kind, ChangeKind::Delete | ChangeKind::Replace) {
            let doomed: Vec<String> = folded
                .keys()
                .filter(|path| is_child_path(&change.path, path))
                .cloned()
                .collect();
            for path in doomed {
                folded.remove(&path);
            }
        }
    }
    Ok(folded)
}

/// Parse a changes stream: two-line records terminated by a blank line
/// (or end of input).
pub fn parse_changes(data: &[u8]) -> Result<Vec<Change>> {
    let text = std::str::from_utf8(data)
        .map_err(|_| FsError::corrupt("Changes list is not UTF-8"))?;
    let mut lines = text.split('\n');
    let mut changes = Vec::new();
    loop {
        let line = match lines.next() {
            None => break,
            Some("") => break,
            Some(l) => l,
        };
        let bad = || FsError::corrupt("Invalid changes line in rev-file");

        let (id_str, rest) = line.split_once(' ').ok_or_else(bad)?;
        let (action_str, rest) = rest.split_once(' ').ok_or_else(bad)?;
        let (text_str, rest) = rest.split_once(' ').ok_or_else(bad)?;
        let (prop_str, path) = rest.split_once(' ').ok_or_else(bad)?;

        // The action may carry a `-<kind>` suffix in newer formats.
        let (action_str, node_kind) = match action_str.split_once('-') {
            Some((action, kind)) => (action, Some(NodeKind::parse(kind)?)),
            None => (action_str, None),
        };
        let kind = ChangeKind::parse(action_str)?;
        let noderev_id = if id_str == ACTION_RESET && kind == ChangeKind::Reset {
            None
        } else {
            Some(NodeRevId::parse(id_str)?)
        };

        let text_mod = match text_str {
            FLAG_TRUE => true,
            FLAG_FALSE => false,
            _ => return Err(FsError::corrupt("Invalid text-mod flag in rev-file")),
        };
        let prop_mod = match prop_str {
            FLAG_TRUE => true,
            FLAG_FALSE => false,
            _ => return Err(FsError::corrupt("Invalid prop-mod flag in rev-file")),
        };

        // The second line of the record holds the copyfrom source, and
        // is empty when the change is not a copy.
        let copy_line = lines.next().ok_or_else(bad)?;
        let copyfrom = if copy_line.is_empty() {
            None
        } else {
            let (rev_str, from_path) = copy_line.split_once(' ').ok_or_else(bad)?;
            let rev = rev_str.parse::<Revnum>().map_err(|_| bad())?;
            Some((rev, from_path.to_string()))
        };

        changes.push(Change {
            path: path.to_string(),
            noderev_id,
            kind,
            text_mod,
            prop_mod,
            node_kind,
            copyfrom,
        });
    }
    Ok(changes)
}

/// Serialize one raw change entry (two lines).
pub fn write_change(out: &mut Vec<u8>, change: &Change, include_node_kind: bool) {
    let id_str = match &change.noderev_id {
        Some(id) => id.to_string(),
        None => ACTION_RESET.to_string(),
    };
    let kind_suffix = match (include_node_kind, change.node_kind) {
        (true, Some(kind)) => format!("-{}", kind.as_str()),
        _ => String::new(),
    };
    out.extend_from_slice(
        format!(
            "{} {}{} {} {} {}\n",
            id_str,
            change.kind.as_str(),
            kind_suffix,
            if change.text_mod { FLAG_TRUE } else { FLAG_FALSE },
            if change.prop_mod { FLAG_TRUE } else { FLAG_FALSE },
            change.path
        )
        .as_bytes(),
    );
    if let Some((rev, path)) = &change.copyfrom {
        out.extend_from_slice(format!("{} {}", rev, path).as_bytes());
    }
    out.push(b'\n');
}

/// Serialize a folded map in its canonical (lexicographic) order.
pub fn write_changed_paths(out: &mut Vec<u8>, changes: &ChangedPaths, include_node_kind: bool) {
    for (path, pc) in changes {
        write_change(
            out,
            &Change {
                path: path.clone(),
                noderev_id: pc.noderev_id.clone(),
                kind: pc.kind,
                text_mod: pc.text_mod,
                prop_mod: pc.prop_mod,
                node_kind: pc.node_kind,
                copyfrom: pc.copyfrom.clone(),
            },
            include_node_kind,
        );
    }
}
