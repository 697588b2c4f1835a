//! Node-revision identifiers and base-36 key arithmetic
//!
//! Every node revision is addressed by `node-id.copy-id.suffix` where the
//! suffix is `r<rev>/<offset>` once committed or `t<txn>` while a commit
//! is in flight.  Node and copy ids are base-36 strings; ids minted inside
//! a transaction carry a `_` prefix until the commit rewrites them.

use std::fmt;

use crate::error::{FsError, Result};

/// Revision number.  Revision 0 always exists.
pub type Revnum = u64;

/// Identifier of one node revision.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeRevId {
    pub node_id: String,
    pub copy_id: String,
    /// `Some` while the node revision lives in a transaction.
    pub txn_id: Option<String>,
    /// Revision and byte offset of the committed record.
    pub rev: Option<Revnum>,
    pub offset: u64,
}

impl NodeRevId {
    /// Id of a node revision inside transaction `txn_id`.
    pub fn txn(node_id: &str, copy_id: &str, txn_id: &str) -> Self {
        NodeRevId {
            node_id: node_id.to_string(),
            copy_id: copy_id.to_string(),
            txn_id: Some(txn_id.to_string()),
            rev: None,
            offset: 0,
        }
    }

    /// Id of a committed node revision located at `offset` in `rev`.
    pub fn committed(node_id: &str, copy_id: &str, rev: Revnum, offset: u64) -> Self {
        NodeRevId {
            node_id: node_id.to_string(),
            copy_id: copy_id.to_string(),
            txn_id: None,
            rev: Some(rev),
            offset,
        }
    }

    pub fn is_txn(&self) -> bool {
        self.txn_id.is_some()
    }

    /// True if the id belongs to the given transaction.
    pub fn in_txn(&self, txn_id: &str) -> bool {
        self.txn_id.as_deref() == Some(txn_id)
    }

    /// Two ids are related iff they share a node line.  Transaction-local
    /// node ids (`_` prefixed) only relate within the same transaction.
    pub fn is_related_to(&self, other: &NodeRevId) -> bool {
        if self == other {
            return true;
        }
        if self.node_id.starts_with('_')
            && self.txn_id.is_some()
            && other.txn_id.is_some()
            && self.txn_id != other.txn_id
        {
            return false;
        }
        self.node_id == other.node_id
    }

    /// Parse the `node.copy.[r<rev>/<off>|t<txn>]` form.
    pub fn parse(s: &str) -> Result<Self> {
        let bad = || FsError::corrupt(format!("Malformed node revision id '{}'", s));
        let mut parts = s.splitn(3, '.');
        let node_id = parts.next().filter(|p| !p.is_empty()).ok_or_else(bad)?;
        let copy_id = parts.next().filter(|p| !p.is_empty()).ok_or_else(bad)?;
        let tail = parts.next().filter(|p| !p.is_empty()).ok_or_else(bad)?;
        match tail.as_bytes()[0] {
            b'r' => {
                let mut nums = tail[1..].splitn(2, '/');
                let rev = nums
                    .next()
                    .and_then(|t| t.parse::<Revnum>().ok())
                    .ok_or_else(bad)?;
                let offset = nums
                    .next()
                    .and_then(|t| t.parse::<u64>().ok())
                    .ok_or_else(bad)?;
                Ok(NodeRevId::committed(node_id, copy_id, rev, offset))
            }
            b't' => Ok(NodeRevId::txn(node_id, copy_id, &tail[1..])),
            _ => Err(bad()),
        }
    }
}

impl fmt::Display for NodeRevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.txn_id {
            Some(txn) => write!(f, "{}.{}.t{}", self.node_id, self.copy_id, txn),
            None => write!(
                f,
                "{}.{}.r{}/{}",
                self.node_id,
                self.copy_id,
                self.rev.unwrap_or(0),
                self.offset
            ),
        }
    }
}

/// Parse a base-36 key ("0"-"9","a"-"z" digits, lowest base first in value
/// but written most-significant first, like ordinary numerals).
pub fn base36_parse(s: &str) -> Result<u64> {
    if s.is_empty() {
        return Err(FsError::corrupt("Empty base-36 key"));
    }
    let mut val: u64 = 0;
    for c in s.chars() {
        let digit = match c {
            '0'..='9' => c as u64 - '0' as u64,
            'a'..='z' => c as u64 - 'a' as u64 + 10,
            _ => return Err(FsError::corrupt(format!("Invalid base-36 key '{}'", s))),
        };
        val = val
            .checked_mul(36)
            .and_then(|v| v.checked_add(digit))
            .ok_or_else(|| FsError::corrupt(format!("Base-36 key '{}' out of range", s)))?;
    }
    Ok(val)
}

/// Render a number as a base-36 key.
pub fn base36_unparse(mut val: u64) -> String {
    if val == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while val > 0 {
        let d = (val % 36) as u8;
        digits.push(if d < 10 { b'0' + d } else { b'a' + d - 10 });
        val /= 36;
    }
    digits.reverse();
    String::from_utf8(digits).expect("base-36 digits are ASCII")
}

/// Successor of a base-36 key.
pub fn base36_next(s: &str) -> Result<String> {
    Ok(base36_unparse(base36_parse(s)? + 1))
}

/// Sum of two base-36 keys, used when rewriting transaction-local ids to
/// global ones in legacy-format repositories.
pub fn base36_add(a: &str, b: &str) -> Result<String> {
    Ok(base36_unparse(base36_parse(a)? + base36_parse(b)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_committed_id() {
        let id = NodeRevId::parse("3-2.0.r7/1204").unwrap();
        assert_eq!(id.node_id, "3-2");
        assert_eq!(id.copy_id, "0");
        assert_eq!(id.rev, Some(7));
        assert_eq!(id.offset, 1204);
        assert!(!id.is_txn());
        assert_eq!(id.to_string(), "3-2.0.r7/1204");
    }

    #[test]
    fn test_parse_txn_id() {
        let id = NodeRevId::parse("_5.0.t12-4").unwrap();
        assert_eq!(id.node_id, "_5");
        assert_eq!(id.txn_id.as_deref(), Some("12-4"));
        assert_eq!(id.to_string(), "_5.0.t12-4");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in ["", "a.b", "a.b.x9", "a.b.r7", "a.b.r7/x", "..t1"] {
            assert!(NodeRevId::parse(bad).is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_relatedness() {
        let a = NodeRevId::parse("4.0.r1/100").unwrap();
        let b = NodeRevId::parse("4.0.r9/2000").unwrap();
        let c = NodeRevId::parse("5.0.r9/2100").unwrap();
        assert!(a.is_related_to(&b));
        assert!(!a.is_related_to(&c));

        // txn-local node lines never relate across transactions
        let t1 = NodeRevId::parse("_3.0.t2-1").unwrap();
        let t2 = NodeRevId::parse("_3.0.t2-2").unwrap();
        assert!(!t1.is_related_to(&t2));
        assert!(t1.is_related_to(&t1.clone()));
    }

    #[test]
    fn test_base36_roundtrip() {
        for v in [0u64, 1, 35, 36, 1295, 46655, 1_000_000] {
            assert_eq!(base36_parse(&base36_unparse(v)).unwrap(), v);
        }
        assert_eq!(base36_unparse(35), "z");
        assert_eq!(base36_unparse(36), "10");
        assert_eq!(base36_next("z").unwrap(), "10");
        assert_eq!(base36_add("z", "1").unwrap(), "10");
    }
}
