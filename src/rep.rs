//! Representation descriptors and the skip-delta base selector
//!
//! A representation names a byte stream stored in some revision (or
//! proto-revision) file: header line, payload, `ENDREP` marker.  The
//! descriptor itself travels inside node-rev records as a single
//! space-separated line.

use md5::{Digest, Md5};
use sha1::Sha1;

use crate::config::FsConfig;
use crate::error::{FsError, Result};
use crate::id::{NodeRevId, Revnum};
use crate::noderev::NodeRevision;

/// Location and checksums of one stored byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Representation {
    /// Revision whose file holds the representation; `None` while the
    /// representation is still mutable inside a transaction.
    pub revision: Option<Revnum>,
    /// Byte offset of the representation header within that file.
    pub offset: u64,
    /// On-disk payload length (svndiff or fulltext bytes, excluding the
    /// header line and `ENDREP`).
    pub size: u64,
    /// Fulltext length after expansion.
    pub expanded_size: u64,
    pub md5: [u8; 16],
    pub sha1: Option<[u8; 20]>,
    /// Owning transaction while mutable.
    pub txn_id: Option<String>,
    /// `<txn-id>/<counter>` disambiguating identical reps minted by the
    /// same transaction.
    pub uniquifier: Option<String>,
}

impl Representation {
    /// Fresh, empty descriptor for a representation being written by
    /// `txn_id`.
    pub fn mutable(txn_id: &str) -> Representation {
        Representation {
            revision: None,
            offset: 0,
            size: 0,
            expanded_size: 0,
            md5: [0; 16],
            sha1: None,
            txn_id: Some(txn_id.to_string()),
            uniquifier: None,
        }
    }

    /// Parse a descriptor line from a node-rev header.  `txn_id` is the
    /// transaction of the surrounding node-rev, adopted when the line
    /// marks the rep mutable (`-1` revision).  For prop and directory
    /// reps (`mutable_truncated`) a mutable line carries nothing else.
    pub fn parse(s: &str, txn_id: Option<&str>, mutable_truncated: bool) -> Result<Representation> {
        let bad = || FsError::corrupt("Malformed text representation offset line in node-rev");
        let mut tokens = s.split(' ');
        let rev_str = tokens.next().ok_or_else(bad)?;

        let mut rep = Representation {
            revision: None,
            offset: 0,
            size: 0,
            expanded_size: 0,
            md5: [0; 16],
            sha1: None,
            txn_id: None,
            uniquifier: None,
        };

        if rev_str == "-1" {
            rep.txn_id = txn_id.map(str::to_string);
            if mutable_truncated {
                return Ok(rep);
            }
        } else {
            rep.revision = Some(rev_str.parse::<Revnum>().map_err(|_| bad())?);
        }

        rep.offset = tokens
            .next()
            .and_then(|t| t.parse().ok())
            .ok_or_else(bad)?;
        rep.size = tokens
            .next()
            .and_then(|t| t.parse().ok())
            .ok_or_else(bad)?;
        rep.expanded_size = tokens
            .next()
            .and_then(|t| t.parse().ok())
            .ok_or_else(bad)?;

        let md5_hex = tokens.next().ok_or_else(bad)?;
        let md5_bytes = hex::decode(md5_hex).map_err(|_| bad())?;
        rep.md5 = md5_bytes.try_into().map_err(|_| bad())?;

        // SHA-1 and uniquifier only appear in rep-sharing formats.
        if let Some(sha1_hex) = tokens.next() {
            let sha1_bytes = hex::decode(sha1_hex).map_err(|_| bad())?;
            rep.sha1 = Some(sha1_bytes.try_into().map_err(|_| bad())?);
            rep.uniquifier = Some(tokens.next().ok_or_else(bad)?.to_string());
        }

        Ok(rep)
    }

    /// Render the descriptor line.  A mutable prop/dir rep collapses to
    /// `-1`.
    pub fn unparse(&self, mutable_truncated: bool) -> String {
        if self.txn_id.is_some() && mutable_truncated {
            return "-1".to_string();
        }
        let rev = match self.revision {
            Some(rev) => rev.to_string(),
            None => "-1".to_string(),
        };
        let mut s = format!(
            "{} {} {} {} {}",
            rev,
            self.offset,
            self.size,
            self.expanded_size,
            hex::encode(self.md5)
        );
        if let Some(sha1) = &self.sha1 {
            s.push(' ');
            s.push_str(&hex::encode(sha1));
            s.push(' ');
            s.push_str(self.uniquifier.as_deref().unwrap_or(""));
        }
        s
    }

    /// True when two committed descriptors name the same on-disk bytes.
    pub fn same_location(&self, other: &Representation) -> bool {
        self.revision == other.revision && self.offset == other.offset
    }
}

/// Header line introducing a representation body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepHeader {
    /// Raw fulltext follows.
    Plain,
    /// svndiff against the empty stream (written by older formats; this
    /// engine emits `Plain` for chain roots).
    SelfDelta,
    /// svndiff against the representation at the given location.
    Delta {
        base_rev: Revnum,
        base_offset: u64,
        base_length: u64,
    },
}

impl RepHeader {
    pub fn parse(line: &str) -> Result<RepHeader> {
        if line == "PLAIN" {
            return Ok(RepHeader::Plain);
        }
        if line == "DELTA" {
            return Ok(RepHeader::SelfDelta);
        }
        if let Some(rest) = line.strip_prefix("DELTA ") {
            let mut tokens = rest.split(' ');
            let bad = || FsError::corrupt("Malformed representation header");
            let base_rev = tokens
                .next()
                .and_then(|t| t.parse().ok())
                .ok_or_else(bad)?;
            let base_offset = tokens
                .next()
                .and_then(|t| t.parse().ok())
                .ok_or_else(bad)?;
            let base_length = tokens
                .next()
                .and_then(|t| t.parse().ok())
                .ok_or_else(bad)?;
            return Ok(RepHeader::Delta {
                base_rev,
                base_offset,
                base_length,
            });
        }
        Err(FsError::corrupt("Malformed representation header"))
    }

    pub fn unparse(&self) -> String {
        match self {
            RepHeader::Plain => "PLAIN\n".to_string(),
            RepHeader::SelfDelta => "DELTA\n".to_string(),
            RepHeader::Delta {
                base_rev,
                base_offset,
                base_length,
            } => format!("DELTA {} {} {}\n", base_rev, base_offset, base_length),
        }
    }
}

/// Cosmetic end-of-representation marker.
pub const ENDREP: &[u8] = b"ENDREP\n";

/// Incremental MD5 + SHA-1 of a fulltext stream.
pub struct RepChecksums {
    md5: Md5,
    sha1: Sha1,
    pub len: u64,
}

impl RepChecksums {
    pub fn new() -> Self {
        RepChecksums {
            md5: Md5::new(),
            sha1: Sha1::new(),
            len: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.md5.update(data);
        self.sha1.update(data);
        self.len += data.len() as u64;
    }

    pub fn finish(self) -> ([u8; 16], [u8; 20]) {
        (self.md5.finalize().into(), self.sha1.finalize().into())
    }
}

impl Default for RepChecksums {
    fn default() -> Self {
        Self::new()
    }
}

/// Pick the delta base for the next representation of `noderev`.
///
/// The predecessor count `p` is split into a skip-delta part and a
/// linear tail: clearing the low-order set bit of `p` names the
/// skip-delta target, but within `max_linear_deltification` steps of
/// HEAD the immediate predecessor is used instead.  Walks longer than
/// `max_deltification_walk` abandon deltification, and a base whose rep
/// is shared from a newer revision is re-measured so shared reps cannot
/// splice chains into unbounded linear runs.
///
/// `lookup` resolves node revisions by id; `chain_length` measures a
/// representation's delta chain.  Returns `None` when the new rep
/// should be stored PLAIN.
pub fn choose_delta_base<L, C>(
    noderev: &NodeRevision,
    props: bool,
    config: &FsConfig,
    lookup: L,
    chain_length: C,
) -> Result<Option<Representation>>
where
    L: Fn(&NodeRevId) -> Result<NodeRevision>,
    C: Fn(&Representation) -> Result<u64>,
{
    let p = noderev.predecessor_count;
    if p == 0 {
        return Ok(None);
    }

    // Clear the low-order set bit to find the skip-delta target.
    let mut count = p & (p - 1);
    let walk = p - count;
    if walk < config.max_linear_deltification {
        count = p - 1;
    }
    if walk > config.max_deltification_walk {
        return Ok(None);
    }

    let mut base = noderev.clone();
    let mut maybe_shared_rep = false;
    let mut steps = count;
    while steps < p {
        let pred_id = base
            .predecessor_id
            .clone()
            .ok_or_else(|| FsError::corrupt("Predecessor chain shorter than its count"))?;
        base = lookup(&pred_id)?;
        let rep = if props { &base.prop_rep } else { &base.data_rep };
        if let (Some(rep), Some(rev)) = (rep, base.id.rev) {
            if rep.revision.map_or(false, |rep_rev| rev > rep_rev) {
                maybe_shared_rep = true;
            }
        }
        steps += 1;
    }

    let rep = if props {
        base.prop_rep.clone()
    } else {
        base.data_rep.clone()
    };

    if let Some(rep) = &rep {
        if maybe_shared_rep {
            // A shared rep's own chain may differ from the node's
            // predecessor chain; keep the combined length bounded.
            let len = chain_length(rep)?;
            if len >= 2 * config.max_linear_deltification + 2 {
                return Ok(None);
            }
        }
    }

    Ok(rep)
}
