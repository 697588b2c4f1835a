//! Node-revision records
//!
//! One node revision describes one version of one filesystem entity.
//! On disk it is a block of `name: value` header lines terminated by a
//! blank line, embedded in a revision file or stored as its own file in
//! a transaction directory.

use crate::error::{FsError, Result};
use crate::id::{NodeRevId, Revnum};
use crate::rep::Representation;

const HEADER_ID: &str = "id";
const HEADER_TYPE: &str = "type";
const HEADER_COUNT: &str = "count";
const HEADER_PROPS: &str = "props";
const HEADER_TEXT: &str = "text";
const HEADER_CPATH: &str = "cpath";
const HEADER_PRED: &str = "pred";
const HEADER_COPYFROM: &str = "copyfrom";
const HEADER_COPYROOT: &str = "copyroot";
const HEADER_FRESHTXNRT: &str = "is-fresh-txn-root";
const HEADER_MINFO_CNT: &str = "minfo-cnt";
const HEADER_MINFO_HERE: &str = "minfo-here";

/// Kind of a versioned node.  Symlinks are files carrying the
/// `svn:special` property; they never appear as a distinct kind on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Dir,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::File => "file",
            NodeKind::Dir => "dir",
        }
    }

    pub fn parse(s: &str) -> Result<NodeKind> {
        match s {
            "file" => Ok(NodeKind::File),
            "dir" => Ok(NodeKind::Dir),
            _ => Err(FsError::corrupt(format!("Unknown node kind '{}'", s))),
        }
    }
}

/// An immutable record describing one version of one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRevision {
    pub id: NodeRevId,
    pub kind: NodeKind,
    pub predecessor_id: Option<NodeRevId>,
    /// Exact length of the predecessor chain back to the node's origin.
    pub predecessor_count: u64,
    /// Canonical path at which this node revision came into being.
    pub created_path: String,
    /// Revision of the nearest copy ancestor; `None` until commit fills
    /// in the new revision number.
    pub copyroot_rev: Option<Revnum>,
    pub copyroot_path: String,
    pub copyfrom: Option<(Revnum, String)>,
    pub data_rep: Option<Representation>,
    pub prop_rep: Option<Representation>,
    /// Set only on the root node-rev freshly minted by `begin_txn`;
    /// stripped when the commit writes the final record.
    pub is_fresh_txn_root: bool,
    /// Number of nodes in this subtree carrying mergeinfo.
    pub mergeinfo_count: u64,
    /// This node itself carries mergeinfo.
    pub has_mergeinfo: bool,
}

impl NodeRevision {
    /// Parse one header block.  `data` must start at the `id:` line and
    /// contain the terminating blank line.
    pub fn parse(data: &[u8]) -> Result<NodeRevision> {
        let mut headers: Vec<(String, String)> = Vec::new();
        let mut pos = 0;
        loop {
            let nl = data[pos..]
                .iter()
                .position(|&b| b == b'\n')
                .ok_or_else(|| FsError::corrupt("Unterminated node-rev header block"))?;
            let line = &data[pos..pos + nl];
            pos += nl + 1;
            if line.is_empty() {
                break;
            }
            let line = std::str::from_utf8(line)
                .map_err(|_| FsError::corrupt("Node-rev header is not UTF-8"))?;
            let (name, value) = line.split_once(": ").ok_or_else(|| {
                FsError::corrupt(format!("Found malformed header '{}' in revision file", line))
            })?;
            headers.push((name.to_string(), value.to_string()));
        }
        Self::from_headers(&headers)
    }

    fn from_headers(headers: &[(String, String)]) -> Result<NodeRevision> {
        let get = |name: &str| {
            headers
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.as_str())
        };

        let id_str = get(HEADER_ID)
            .ok_or_else(|| FsError::corrupt("Missing id field in node-rev"))?;
        let id = NodeRevId::parse(id_str)?;

        let kind = NodeKind::parse(get(HEADER_TYPE).ok_or_else(|| {
            FsError::corrupt(format!("Missing kind field in node-rev '{}'", id_str))
        })?)?;

        let predecessor_count = match get(HEADER_COUNT) {
            Some(v) => v.parse::<u64>().map_err(|_| {
                FsError::corrupt(format!("Malformed count in node-rev '{}'", id_str))
            })?,
            None => 0,
        };

        let prop_rep = get(HEADER_PROPS)
            .map(|v| Representation::parse(v, id.txn_id.as_deref(), true))
            .transpose()?;
        let data_rep = get(HEADER_TEXT)
            .map(|v| Representation::parse(v, id.txn_id.as_deref(), kind == NodeKind::Dir))
            .transpose()?;

        let created_path = get(HEADER_CPATH)
            .ok_or_else(|| {
                FsError::corrupt(format!("Missing cpath field in node-rev '{}'", id_str))
            })?
            .to_string();

        let predecessor_id = get(HEADER_PRED).map(NodeRevId::parse).transpose()?;

        let (copyroot_rev, copyroot_path) = match get(HEADER_COPYROOT) {
            None => (id.rev, created_path.clone()),
            Some(v) => {
                let (rev_str, path) = v.split_once(' ').ok_or_else(|| {
                    FsError::corrupt(format!("Malformed copyroot line in node-rev '{}'", id_str))
                })?;
                let rev = rev_str.parse::<Revnum>().map_err(|_| {
                    FsError::corrupt(format!("Malformed copyroot line in node-rev '{}'", id_str))
                })?;
                (Some(rev), path.to_string())
            }
        };

        let copyfrom = match get(HEADER_COPYFROM) {
            None => None,
            Some(v) => {
                let (rev_str, path) = v.split_once(' ').ok_or_else(|| {
                    FsError::corrupt(format!("Malformed copyfrom line in node-rev '{}'", id_str))
                })?;
                let rev = rev_str.parse::<Revnum>().map_err(|_| {
                    FsError::corrupt(format!("Malformed copyfrom line in node-rev '{}'", id_str))
                })?;
                Some((rev, path.to_string()))
            }
        };

        let mergeinfo_count = match get(HEADER_MINFO_CNT) {
            Some(v) => v.parse::<u64>().map_err(|_| {
                FsError::corrupt(format!("Malformed minfo-cnt in node-rev '{}'", id_str))
            })?,
            None => 0,
        };

        Ok(NodeRevision {
            id,
            kind,
            predecessor_id,
            predecessor_count,
            created_path,
            copyroot_rev,
            copyroot_path,
            copyfrom,
            data_rep,
            prop_rep,
            is_fresh_txn_root: get(HEADER_FRESHTXNRT).is_some(),
            mergeinfo_count,
            has_mergeinfo: get(HEADER_MINFO_HERE).is_some(),
        })
    }

    /// Serialize the record, including the terminating blank line.
    /// Mergeinfo headers are only emitted when the filesystem format
    /// supports them.
    pub fn write(&self, out: &mut Vec<u8>, include_mergeinfo: bool) {
        let mut line = |s: String| {
            out.extend_from_slice(s.as_bytes());
        };
        line(format!("{}: {}\n", HEADER_ID, self.id));
        line(format!("{}: {}\n", HEADER_TYPE, self.kind.as_str()));
        if let Some(pred) = &self.predecessor_id {
            line(format!("{}: {}\n", HEADER_PRED, pred));
        }
        line(format!("{}: {}\n", HEADER_COUNT, self.predecessor_count));
        if let Some(rep) = &self.data_rep {
            line(format!(
                "{}: {}\n",
                HEADER_TEXT,
                rep.unparse(self.kind == NodeKind::Dir)
            ));
        }
        if let Some(rep) = &self.prop_rep {
            line(format!("{}: {}\n", HEADER_PROPS, rep.unparse(true)));
        }
        line(format!("{}: {}\n", HEADER_CPATH, self.created_path));
        if let Some((rev, path)) = &self.copyfrom {
            line(format!("{}: {} {}\n", HEADER_COPYFROM, rev, path));
        }
        if self.copyroot_rev != self.id.rev || self.copyroot_path != self.created_path {
            line(format!(
                "{}: {} {}\n",
                HEADER_COPYROOT,
                self.copyroot_rev.unwrap_or(0),
                self.copyroot_path
            ));
        }
        if self.is_fresh_txn_root {
            line(format!("{}: y\n", HEADER_FRESHTXNRT));
        }
        if include_mergeinfo {
            if self.mergeinfo_count > 0 {
                line(format!("{}: {}\n", HEADER_MINFO_CNT, self.mergeinfo_count));
            }
            if self.has_mergeinfo {
                line(format!("{}: y\n", HEADER_MINFO_HERE));
            }
        }
        out.push(b'\n');
    }
}
