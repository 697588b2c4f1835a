//! Revision reader
//!
//! Random access into committed revision files (packed or unpacked):
//! locating the root node-rev and changes list through the trailer,
//! walking directory trees, and reassembling representation fulltext by
//! chasing delta chains back to their PLAIN root.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;

use crate::changes::{self, ChangedPaths};
use crate::error::{FsError, Result};
use crate::id::{NodeRevId, Revnum};
use crate::noderev::{NodeKind, NodeRevision};
use crate::rep::{RepHeader, Representation};
use crate::repository::Repository;
use crate::svndiff;
use crate::tree::{self, DirEntries};
use crate::util;

/// Upper bound on delta-chain length accepted before declaring the
/// chain cyclic.
const MAX_CHAIN_LENGTH: u64 = 10_000;

/// An open view of one revision's bytes: the containing file plus the
/// span `[start, end)` holding this revision.
pub(crate) struct RevFile {
    file: File,
    path: PathBuf,
    start: u64,
    end: u64,
}

impl RevFile {
    /// Open revision `rev`, from its pack if the shard is packed.
    /// Handles the race where a concurrent pack removes the unpacked
    /// file mid-open by refreshing `min-unpacked-rev` and retrying once.
    pub(crate) fn open(repo: &Repository, rev: Revnum) -> Result<RevFile> {
        if repo.is_packed_rev(rev)? {
            return Self::open_packed(repo, rev);
        }
        let path = repo.path_rev(rev);
        match File::open(&path) {
            Ok(file) => {
                let end = util::file_len(&file, &path)?;
                Ok(RevFile {
                    file,
                    path,
                    start: 0,
                    end,
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                repo.refresh_min_unpacked_rev()?;
                if repo.is_packed_rev(rev)? {
                    Self::open_packed(repo, rev)
                } else {
                    Err(FsError::io(&path, e))
                }
            }
            Err(e) => Err(FsError::io(&path, e)),
        }
    }

    fn open_packed(repo: &Repository, rev: Revnum) -> Result<RevFile> {
        let manifest = crate::pack::read_manifest(&repo.path_rev_pack_manifest(rev))?;
        let shard_size = repo.format().max_files_per_dir;
        let index = (rev % shard_size) as usize;
        let start = *manifest.get(index).ok_or_else(|| {
            FsError::corrupt(format!("Manifest too short for revision {}", rev))
        })?;
        let path = repo.path_rev_pack_file(rev);
        let file = File::open(&path).map_err(|e| FsError::io(&path, e))?;
        let end = match manifest.get(index + 1) {
            Some(next) => *next,
            None => util::file_len(&file, &path)?,
        };
        Ok(RevFile {
            file,
            path,
            start,
            end,
        })
    }

    /// Open the proto-revision file of a transaction.
    pub(crate) fn open_proto(repo: &Repository, txn_id: &str) -> Result<RevFile> {
        let path = repo.path_txn_proto_rev(txn_id);
        let file = File::open(&path).map_err(|e| FsError::io(&path, e))?;
        let end = util::file_len(&file, &path)?;
        Ok(RevFile {
            file,
            path,
            start: 0,
            end,
        })
    }

    fn len(&self) -> u64 {
        self.end - self.start
    }

    fn seek_to(&mut self, offset: u64) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(self.start + offset))
            .map_err(|e| FsError::io(&self.path, e))?;
        Ok(())
    }

    fn read_exact_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        if offset + len as u64 > self.len() {
            return Err(FsError::corrupt(format!(
                "Read past end of revision span in '{}'",
                self.path.display()
            )));
        }
        self.seek_to(offset)?;
        let mut buf = vec![0; len];
        self.file
            .read_exact(&mut buf)
            .map_err(|e| FsError::io(&self.path, e))?;
        Ok(buf)
    }

    /// Read from `offset` up to the end of the span.
    fn read_to_span_end(&mut self, offset: u64) -> Result<Vec<u8>> {
        let len = self.len().checked_sub(offset).ok_or_else(|| {
            FsError::corrupt(format!(
                "Offset beyond revision span in '{}'",
                self.path.display()
            ))
        })?;
        self.read_exact_at(offset, len as usize)
    }

    /// Read a `\n`-terminated line starting at `offset`, returning the
    /// line without its terminator and the offset just past it.
    fn read_line_at(&mut self, offset: u64) -> Result<(String, u64)> {
        self.seek_to(offset)?;
        let mut reader = BufReader::new(&mut self.file);
        let mut buf = Vec::new();
        reader
            .read_until(b'\n', &mut buf)
            .map_err(|e| FsError::io(&self.path, e))?;
        if buf.last() != Some(&b'\n') {
            return Err(FsError::corrupt(format!(
                "Unterminated line in '{}'",
                self.path.display()
            )));
        }
        let next = offset + buf.len() as u64;
        buf.pop();
        let line = String::from_utf8(buf)
            .map_err(|_| FsError::corrupt("Non-UTF-8 header line in revision file"))?;
        Ok((line, next))
    }

    /// Read a node-rev header block starting at `offset` (through its
    /// terminating blank line).
    fn read_noderev_block(&mut self, offset: u64) -> Result<Vec<u8>> {
        self.seek_to(offset)?;
        let mut reader = BufReader::new(&mut self.file);
        let mut block = Vec::new();
        loop {
            let mut line = Vec::new();
            reader
                .read_until(b'\n', &mut line)
                .map_err(|e| FsError::io(&self.path, e))?;
            if line.is_empty() {
                return Err(FsError::corrupt("Unterminated node-rev header block"));
            }
            let done = line == b"\n";
            block.extend_from_slice(&line);
            if done {
                return Ok(block);
            }
        }
    }

    /// Parse the trailer line: `<root-offset> SP <changes-offset> LF`,
    /// at most 64 bytes from the end of the span.
    fn read_trailer(&mut self, rev: Revnum) -> Result<(u64, u64)> {
        let tail_len = self.len().min(64);
        let tail = self.read_exact_at(self.len() - tail_len, tail_len as usize)?;
        if tail.last() != Some(&b'\n') {
            return Err(FsError::corrupt(format!(
                "Revision file (r{}) lacks trailing newline",
                rev
            )));
        }
        let body = &tail[..tail.len() - 1];
        let line_start = match body.iter().rposition(|&b| b == b'\n') {
            Some(i) => i + 1,
            None if self.len() <= 64 => 0,
            None => {
                return Err(FsError::corrupt(format!(
                    "Final line in revision file (r{}) longer than 64 characters",
                    rev
                )))
            }
        };
        let line = std::str::from_utf8(&body[line_start..])
            .map_err(|_| FsError::corrupt(format!("Malformed trailer in revision file r{}", rev)))?;
        let (root_str, changes_str) = line.split_once(' ').ok_or_else(|| {
            FsError::corrupt(format!("Final line in revision file r{} missing space", rev))
        })?;
        let root_offset = root_str.parse::<u64>().map_err(|_| {
            FsError::corrupt(format!("Malformed trailer in revision file r{}", rev))
        })?;
        let changes_offset = changes_str.parse::<u64>().map_err(|_| {
            FsError::corrupt(format!("Malformed trailer in revision file r{}", rev))
        })?;
        Ok((root_offset, changes_offset))
    }
}

/// Fetch a node revision by id, from a revision file or a transaction's
/// node file.
pub fn get_node_revision(repo: &Repository, id: &NodeRevId) -> Result<NodeRevision> {
    match (&id.txn_id, id.rev) {
        (Some(txn_id), _) => {
            let path = crate::txn::path_txn_node_rev(repo, txn_id, id);
            if !path.exists() {
                return Err(FsError::NoSuchTransaction(txn_id.clone()));
            }
            NodeRevision::parse(&util::read_file(&path)?)
        }
        (None, Some(rev)) => {
            let mut file = RevFile::open(repo, rev)?;
            let block = file.read_noderev_block(id.offset)?;
            NodeRevision::parse(&block)
        }
        (None, None) => Err(FsError::corrupt("Node revision id has no location")),
    }
}

fn open_rep_file(repo: &Repository, revision: Option<Revnum>, txn_id: Option<&str>) -> Result<RevFile> {
    match (revision, txn_id) {
        (Some(rev), _) => RevFile::open(repo, rev),
        (None, Some(txn)) => RevFile::open_proto(repo, txn),
        (None, None) => Err(FsError::corrupt("Representation has no location")),
    }
}

/// Number of delta hops from `rep` back to its PLAIN root.
pub fn rep_chain_length(repo: &Repository, rep: &Representation) -> Result<u64> {
    let mut hops = 0u64;
    let mut location = (rep.revision, rep.txn_id.clone(), rep.offset);
    loop {
        let (revision, txn_id, offset) = location;
        let mut file = open_rep_file(repo, revision, txn_id.as_deref())?;
        let (line, _) = file.read_line_at(offset)?;
        match RepHeader::parse(&line)? {
            RepHeader::Plain | RepHeader::SelfDelta => return Ok(hops),
            RepHeader::Delta {
                base_rev,
                base_offset,
                ..
            } => {
                hops += 1;
                if hops > MAX_CHAIN_LENGTH {
                    return Err(FsError::corrupt("Representation delta chain does not terminate"));
                }
                location = (Some(base_rev), None, base_offset);
            }
        }
    }
}

/// Reassemble the fulltext of a representation by walking its chain to
/// the PLAIN root and applying the svndiff windows root-to-leaf.
pub fn read_rep_fulltext(repo: &Repository, rep: &Representation) -> Result<Vec<u8>> {
    struct Link {
        header: RepHeader,
        payload: Vec<u8>,
    }

    let mut chain = Vec::new();
    let mut location = (rep.revision, rep.txn_id.clone(), rep.offset, rep.size);
    loop {
        let (revision, txn_id, offset, size) = location;
        let mut file = open_rep_file(repo, revision, txn_id.as_deref())?;
        let (line, payload_start) = file.read_line_at(offset)?;
        let header = RepHeader::parse(&line)?;
        let payload = file.read_exact_at(payload_start, size as usize)?;
        let next = match header {
            RepHeader::Plain | RepHeader::SelfDelta => None,
            RepHeader::Delta {
                base_rev,
                base_offset,
                base_length,
            } => Some((Some(base_rev), None, base_offset, base_length)),
        };
        chain.push(Link { header, payload });
        if chain.len() as u64 > MAX_CHAIN_LENGTH {
            return Err(FsError::corrupt("Representation delta chain does not terminate"));
        }
        match next {
            Some(loc) => location = loc,
            None => break,
        }
    }

    let mut text: Vec<u8> = Vec::new();
    for link in chain.iter().rev() {
        text = match link.header {
            RepHeader::Plain => link.payload.clone(),
            RepHeader::SelfDelta => svndiff::apply(&link.payload, &[])?,
            RepHeader::Delta { .. } => svndiff::apply(&link.payload, &text)?,
        };
    }

    // Old PLAIN representations may record a zero expanded size.
    let expect = if rep.expanded_size == 0 && rep.size != 0 && matches!(chain[0].header, RepHeader::Plain)
    {
        rep.size
    } else {
        rep.expanded_size
    };
    if text.len() as u64 != expect {
        return Err(FsError::corrupt(format!(
            "Representation expanded to {} bytes, expected {}",
            text.len(),
            expect
        )));
    }
    #[cfg(debug_assertions)]
    {
        use md5::{Digest, Md5};
        let md5: [u8; 16] = Md5::digest(&text).into();
        if rep.md5 != [0; 16] && md5 != rep.md5 {
            return Err(FsError::corrupt("Representation MD5 does not match fulltext"));
        }
    }
    Ok(text)
}

/// A read-only view of one committed revision's tree.
pub struct RevisionRoot {
    repo: Repository,
    rev: Revnum,
    root_offset: u64,
    changes_offset: u64,
}

impl RevisionRoot {
    pub fn open(repo: &Repository, rev: Revnum) -> Result<RevisionRoot> {
        repo.ensure_revision_exists(rev)?;
        let mut file = RevFile::open(repo, rev)?;
        let (root_offset, changes_offset) = file.read_trailer(rev)?;
        Ok(RevisionRoot {
            repo: repo.clone(),
            rev,
            root_offset,
            changes_offset,
        })
    }

    pub fn revision(&self) -> Revnum {
        self.rev
    }

    pub fn root_noderev(&self) -> Result<NodeRevision> {
        get_node_revision(
            &self.repo,
            &NodeRevId::committed("0", "0", self.rev, self.root_offset),
        )
    }

    /// List a directory node, going through the per-process cache for
    /// committed directories.
    pub fn dir_entries(&self, noderev: &NodeRevision) -> Result<Arc<DirEntries>> {
        if noderev.kind != NodeKind::Dir {
            return Err(FsError::NotDirectory(noderev.created_path.clone()));
        }
        dir_entries_of(&self.repo, noderev)
    }

    /// Walk `path` from the root, returning the node revision there.
    pub fn node_rev(&self, path: &str) -> Result<NodeRevision> {
        Ok(self.walk(path)?.0)
    }

    pub fn node_id(&self, path: &str) -> Result<NodeRevId> {
        Ok(self.node_rev(path)?.id)
    }

    pub fn path_exists(&self, path: &str) -> Result<bool> {
        match self.node_rev(path) {
            Ok(_) => Ok(true),
            Err(FsError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Node revision plus the youngest copy root seen along the walk.
    fn walk(&self, path: &str) -> Result<(NodeRevision, (Revnum, String))> {
        let mut node = self.root_noderev()?;
        let mut youngest_copyroot: (Revnum, String) = (
            node.copyroot_rev.unwrap_or(0),
            node.copyroot_path.clone(),
        );
        for component in path.split('/').filter(|c| !c.is_empty()) {
            let entries = dir_entries_of(&self.repo, &node)?;
            let entry = entries
                .get(component)
                .ok_or_else(|| FsError::NotFound(path.to_string()))?;
            node = get_node_revision(&self.repo, &entry.id)?;
            let croot_rev = node.copyroot_rev.unwrap_or(0);
            if croot_rev >= youngest_copyroot.0 {
                youngest_copyroot = (croot_rev, node.copyroot_path.clone());
            }
        }
        Ok((node, youngest_copyroot))
    }

    /// Directory listing at a path.
    pub fn dir_entries_at(&self, path: &str) -> Result<Arc<DirEntries>> {
        let node = self.node_rev(path)?;
        self.dir_entries(&node)
    }

    /// Fulltext of the file at `path`.
    pub fn file_contents(&self, path: &str) -> Result<Bytes> {
        let node = self.node_rev(path)?;
        if node.kind != NodeKind::File {
            return Err(FsError::NotFile(path.to_string()));
        }
        match &node.data_rep {
            Some(rep) => Ok(Bytes::from(read_rep_fulltext(&self.repo, rep)?)),
            None => Ok(Bytes::new()),
        }
    }

    pub fn file_length(&self, path: &str) -> Result<u64> {
        let node = self.node_rev(path)?;
        Ok(node.data_rep.as_ref().map_or(0, |rep| rep.expanded_size))
    }

    /// Properties of the node at `path`.
    pub fn node_proplist(&self, path: &str) -> Result<crate::props::PropList> {
        let node = self.node_rev(path)?;
        match &node.prop_rep {
            Some(rep) => crate::props::parse_hash_block(&read_rep_fulltext(&self.repo, rep)?),
            None => Ok(crate::props::PropList::new()),
        }
    }

    /// The folded changed-paths list of this revision.  The committed
    /// stream was folded at commit time, so no descendant pruning
    /// happens here.
    pub fn changed_paths(&self) -> Result<ChangedPaths> {
        let mut file = RevFile::open(&self.repo, self.rev)?;
        let data = file.read_to_span_end(self.changes_offset)?;
        let raw = changes::parse_changes(&data)?;
        changes::process_changes(&raw, true)
    }

    /// Find the nearest copy event governing `path`: the revision root
    /// and path where that copy created the node's ancestry, or `None`
    /// when the node was never copied.
    pub fn closest_copy(&self, path: &str) -> Result<Option<(Revnum, String)>> {
        let (node, (copy_dst_rev, copy_dst_path)) = self.walk(path)?;
        if copy_dst_rev == 0 {
            return Ok(None);
        }

        // The path must exist in the copy-destination revision and
        // still be related to our node.
        let copy_root = RevisionRoot::open(&self.repo, copy_dst_rev)?;
        let dst_node = match copy_root.node_rev(path) {
            Ok(n) => n,
            Err(FsError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        if !dst_node.id.is_related_to(&node.id) {
            return Ok(None);
        }

        // A node freshly created (not copied) in that revision is not a
        // copy event.
        if dst_node.id.rev == Some(copy_dst_rev) && dst_node.copyfrom.is_none() {
            return Ok(None);
        }
        Ok(Some((copy_dst_rev, copy_dst_path)))
    }
}

/// Shared directory-listing fetch used by both revision and transaction
/// reads.  Committed listings go through the per-process cache.
pub(crate) fn dir_entries_of(repo: &Repository, noderev: &NodeRevision) -> Result<Arc<DirEntries>> {
    if noderev.kind != NodeKind::Dir {
        return Err(FsError::NotDirectory(noderev.created_path.clone()));
    }
    let rep = match &noderev.data_rep {
        Some(rep) => rep,
        None => return Ok(Arc::new(DirEntries::new())),
    };

    if rep.txn_id.is_some() {
        // Mutable directory: entries live in the children file.
        let txn_id = rep.txn_id.as_deref().expect("mutable rep has txn");
        let path = crate::txn::path_txn_node_children(repo, txn_id, &noderev.id);
        return Ok(Arc::new(tree::parse_children_file(&util::read_file(
            &path,
        )?)?));
    }

    // Only committed listings are worth caching; transaction-form ids
    // die with their transaction.
    if noderev.id.is_txn() {
        return Ok(Arc::new(tree::parse_dir_entries(&read_rep_fulltext(
            repo, rep,
        )?)?));
    }
    let key = noderev.id.to_string();
    if let Some(cached) = repo.dir_cache_get(&key) {
        return Ok(cached);
    }
    let entries = Arc::new(tree::parse_dir_entries(&read_rep_fulltext(repo, rep)?)?);
    repo.dir_cache_put(key, entries.clone());
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::Repository;
    use tempfile::TempDir;

    #[test]
    fn test_revision_zero_reader() {
        let tmp = TempDir::new().unwrap();
        let repo = Repository::create(&tmp.path().join("db")).unwrap();
        let root = RevisionRoot::open(&repo, 0).unwrap();

        let node = root.root_noderev().unwrap();
        assert_eq!(node.kind, NodeKind::Dir);
        assert_eq!(node.predecessor_count, 0);
        assert_eq!(node.created_path, "/");

        assert!(root.dir_entries_at("/").unwrap().is_empty());
        assert!(root.changed_paths().unwrap().is_empty());
        assert!(!root.path_exists("/nonexistent").unwrap());
    }

    #[test]
    fn test_open_beyond_youngest_fails() {
        let tmp = TempDir::new().unwrap();
        let repo = Repository::create(&tmp.path().join("db")).unwrap();
        assert!(matches!(
            RevisionRoot::open(&repo, 1),
            Err(FsError::NoSuchRevision(1))
        ));
    }

    #[test]
    fn test_listing_twice_is_equal_and_cached() {
        let tmp = TempDir::new().unwrap();
        let repo = Repository::create(&tmp.path().join("db")).unwrap();
        let root = RevisionRoot::open(&repo, 0).unwrap();
        let first = root.dir_entries_at("/").unwrap();
        let second = root.dir_entries_at("/").unwrap();
        assert_eq!(*first, *second);
        // Same Arc the second time round: served from the cache.
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_trailer_corruption_detected() {
        let tmp = TempDir::new().unwrap();
        let repo = Repository::create(&tmp.path().join("db")).unwrap();
        let rev0 = repo.path_rev(0);
        let mut data = std::fs::read(&rev0).unwrap();
        data.pop(); // strip the trailing newline
        std::fs::write(&rev0, &data).unwrap();
        assert!(matches!(
            RevisionRoot::open(&repo, 0),
            Err(FsError::Corrupt(_))
        ));
    }
}
