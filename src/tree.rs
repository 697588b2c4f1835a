//! Directory-entry serialization
//!
//! A directory's data representation is a hash block mapping entry name
//! to `<kind> <node-rev-id>`.  While a directory is mutable inside a
//! transaction its entries live in a children file: a PLAIN dump of the
//! base entries followed by incremental `K`/`V` additions and `D`
//! deletions appended one mutation at a time.

use std::collections::BTreeMap;

use crate::error::{FsError, Result};
use crate::id::NodeRevId;
use crate::noderev::NodeKind;
use crate::props::{self, PropList};

/// One directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub kind: NodeKind,
    pub id: NodeRevId,
}

/// Name -> entry mapping with deterministic order.
pub type DirEntries = BTreeMap<String, DirEntry>;

fn parse_entry_value(name: &str, value: &[u8]) -> Result<DirEntry> {
    let text = std::str::from_utf8(value)
        .map_err(|_| FsError::corrupt(format!("Directory entry '{}' is not text", name)))?;
    let (kind_str, id_str) = text.split_once(' ').ok_or_else(|| {
        FsError::corrupt(format!("Directory entry '{}' is malformed", name))
    })?;
    let kind = NodeKind::parse(kind_str)?;
    let id = NodeRevId::parse(id_str)?;
    Ok(DirEntry { kind, id })
}

fn unparse_entry_value(entry: &DirEntry) -> Vec<u8> {
    format!("{} {}", entry.kind.as_str(), entry.id).into_bytes()
}

/// Parse a PLAIN directory representation.
pub fn parse_dir_entries(data: &[u8]) -> Result<DirEntries> {
    hash_to_entries(props::parse_hash_block(data)?)
}

/// Parse a mutable children file: PLAIN dump plus incremental edits.
/// The file is a concatenation of terminated blocks; each block after
/// the first holds exactly one mutation.
pub fn parse_children_file(data: &[u8]) -> Result<DirEntries> {
    let mut map = PropList::new();
    let mut pos = 0;
    while pos < data.len() {
        let (merged, consumed) = parse_one_block(&data[pos..], map)?;
        map = merged;
        pos += consumed;
    }
    hash_to_entries(map)
}

/// Parse a single terminated incremental block, returning the merged
/// map and the byte count consumed.
fn parse_one_block(data: &[u8], base: PropList) -> Result<(PropList, usize)> {
    // Find the END terminator by scanning entries; reuse the
    // incremental parser on the prefix up to and including it.
    let end = find_block_end(data)?;
    let merged = props::parse_incremental_hash_block(&data[..end], base)?;
    Ok((merged, end))
}

fn find_block_end(data: &[u8]) -> Result<usize> {
    let mut pos = 0;
    loop {
        let line_start = pos;
        let nl = data[pos..]
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| FsError::corrupt("Unterminated children file"))?;
        let line = &data[pos..pos + nl];
        pos += nl + 1;
        if line == b"END" {
            return Ok(pos);
        }
        let len: usize = std::str::from_utf8(&line[2.min(line.len())..])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                FsError::corrupt(format!(
                    "Malformed children file line at byte {}",
                    line_start
                ))
            })?;
        // Skip the sized payload and its newline.
        if pos + len + 1 > data.len() {
            return Err(FsError::corrupt("Truncated children file"));
        }
        pos += len + 1;
    }
}

fn hash_to_entries(map: PropList) -> Result<DirEntries> {
    let mut entries = DirEntries::new();
    for (name, value) in map {
        let entry = parse_entry_value(&name, &value)?;
        entries.insert(name, entry);
    }
    Ok(entries)
}

/// Serialize entries as a PLAIN hash block, names in sorted order.
pub fn unparse_dir_entries(entries: &DirEntries) -> Vec<u8> {
    let map: PropList = entries
        .iter()
        .map(|(name, entry)| (name.clone(), unparse_entry_value(entry)))
        .collect();
    props::write_hash_block(&map)
}

/// One incremental mutation block for a children file: a set when
/// `entry` is given, a deletion otherwise.
pub fn unparse_child_mutation(name: &str, entry: Option<&DirEntry>) -> Vec<u8> {
    let mut out = Vec::new();
    match entry {
        Some(e) => props::write_set_entry(&mut out, name, &unparse_entry_value(e)),
        None => props::write_delete_entry(&mut out, name),
    }
    out.extend_from_slice(b"END\n");
    out
}
