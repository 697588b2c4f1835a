//! Property lists and the hash-block wire format
//!
//! Properties, directory listings, lock records, and the node-origins
//! cache all serialize as the same text block:
//!
//! ```text
//! K <keylen>\n<key>\nV <vallen>\n<value>\n ... END\n
//! ```
//!
//! The incremental variant additionally allows `D <keylen>\n<key>\n`
//! lines that remove an entry, which is how mutable directory files
//! record deletions.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::{FsError, Result};

/// Revision datestamp property.
pub const PROP_REVISION_DATE: &str = "svn:date";
/// Revision author property.
pub const PROP_REVISION_AUTHOR: &str = "svn:author";
/// Revision log message property.
pub const PROP_REVISION_LOG: &str = "svn:log";

/// An ordered name -> value property list.  Ordering keeps serialized
/// blocks deterministic.
pub type PropList = BTreeMap<String, Vec<u8>>;

/// One entry parsed from an (incremental) hash block.
enum HashEntry {
    Set(String, Vec<u8>),
    Delete(String),
}

fn read_sized_line<'a>(data: &'a [u8], pos: &mut usize, what: &str) -> Result<&'a [u8]> {
    let rest = &data[*pos..];
    let nl = rest
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| FsError::corrupt(format!("Unterminated {} line in hash block", what)))?;
    let line = &rest[..nl];
    *pos += nl + 1;
    Ok(line)
}

fn parse_count(line: &[u8], prefix: u8, what: &str) -> Result<usize> {
    if line.len() < 3 || line[0] != prefix || line[1] != b' ' {
        return Err(FsError::corrupt(format!("Malformed {} header in hash block", what)));
    }
    std::str::from_utf8(&line[2..])
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(|| FsError::corrupt(format!("Malformed {} length in hash block", what)))
}

fn take_exact<'a>(data: &'a [u8], pos: &mut usize, len: usize, what: &str) -> Result<&'a [u8]> {
    if *pos + len + 1 > data.len() || data[*pos + len] != b'\n' {
        return Err(FsError::corrupt(format!("Truncated {} in hash block", what)));
    }
    let out = &data[*pos..*pos + len];
    *pos += len + 1;
    Ok(out)
}

fn read_entries(data: &[u8], incremental: bool) -> Result<Vec<HashEntry>> {
    let mut entries = Vec::new();
    let mut pos = 0;
    loop {
        let line = read_sized_line(data, &mut pos, "header")?;
        if line == b"END" {
            return Ok(entries);
        }
        match line.first() {
            Some(b'K') => {
                let klen = parse_count(line, b'K', "key")?;
                let key = take_exact(data, &mut pos, klen, "key")?;
                let vline = read_sized_line(data, &mut pos, "value header")?;
                let vlen = parse_count(vline, b'V', "value")?;
                let value = take_exact(data, &mut pos, vlen, "value")?;
                let key = String::from_utf8(key.to_vec())
                    .map_err(|_| FsError::corrupt("Non-UTF-8 key in hash block"))?;
                entries.push(HashEntry::Set(key, value.to_vec()));
            }
            Some(b'D') if incremental => {
                let klen = parse_count(line, b'D', "deleted key")?;
                let key = take_exact(data, &mut pos, klen, "deleted key")?;
                let key = String::from_utf8(key.to_vec())
                    .map_err(|_| FsError::corrupt("Non-UTF-8 key in hash block"))?;
                entries.push(HashEntry::Delete(key));
            }
            _ => {
                return Err(FsError::corrupt(format!(
                    "Unexpected line in hash block: {:?}",
                    String::from_utf8_lossy(line)
                )))
            }
        }
    }
}

/// Parse a terminated hash block.
pub fn parse_hash_block(data: &[u8]) -> Result<PropList> {
    let mut map = PropList::new();
    for entry in read_entries(data, false)? {
        if let HashEntry::Set(k, v) = entry {
            map.insert(k, v);
        }
    }
    Ok(map)
}

/// Parse a block that may contain interleaved deletions, applying them
/// in order on top of `base`.
pub fn parse_incremental_hash_block(data: &[u8], mut base: PropList) -> Result<PropList> {
    for entry in read_entries(data, true)? {
        match entry {
            HashEntry::Set(k, v) => {
                base.insert(k, v);
            }
            HashEntry::Delete(k) => {
                base.remove(&k);
            }
        }
    }
    Ok(base)
}

/// Serialize a terminated hash block.
pub fn write_hash_block(map: &PropList) -> Vec<u8> {
    let mut out = Vec::new();
    for (key, value) in map {
        write_set_entry(&mut out, key, value);
    }
    out.extend_from_slice(b"END\n");
    out
}

/// One incremental `K`/`V` pair, without a terminator.
pub fn write_set_entry(out: &mut Vec<u8>, key: &str, value: &[u8]) {
    out.extend_from_slice(format!("K {}\n", key.len()).as_bytes());
    out.extend_from_slice(key.as_bytes());
    out.push(b'\n');
    out.extend_from_slice(format!("V {}\n", value.len()).as_bytes());
    out.extend_from_slice(value);
    out.push(b'\n');
}

/// One incremental `D` deletion line, without a terminator.
pub fn write_delete_entry(out: &mut Vec<u8>, key: &str) {
    out.extend_from_slice(format!("D {}\n", key.len()).as_bytes());
    out.extend_from_slice(key.as_bytes());
    out.push(b'\n');
}

/// Current time in the `svn:date` wire form
/// (`2026-08-02T12:34:56.123456Z`).
pub fn date_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an `svn:date` value.
pub fn parse_date(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|_| FsError::corrupt(format!("Malformed datestamp '{}'", value)))
}

/// Compute the property diff `from` -> `to`: changed and added names map
/// to the new value, removed names map to `None`.
pub fn prop_diff(from: &PropList, to: &PropList) -> BTreeMap<String, Option<Vec<u8>>> {
    let mut diff = BTreeMap::new();
    for (name, value) in to {
        if from.get(name) != Some(value) {
            diff.insert(name.clone(), Some(value.clone()));
        }
    }
    for name in from.keys() {
        if !to.contains_key(name) {
            diff.insert(name.clone(), None);
        }
    }
    diff
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> PropList {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
            .collect()
    }

    #[test]
    fn test_hash_block_roundtrip() {
        let map = props(&[("svn:log", "first commit\n"), ("svn:author", "alice")]);
        let block = write_hash_block(&map);
        assert_eq!(parse_hash_block(&block).unwrap(), map);
    }

    #[test]
    fn test_hash_block_exact_bytes() {
        let map = props(&[("a", "xy")]);
        assert_eq!(write_hash_block(&map), b"K 1\na\nV 2\nxy\nEND\n");
    }

    #[test]
    fn test_binary_value_with_newlines() {
        let mut map = PropList::new();
        map.insert("blob".into(), vec![0, b'\n', 255, b'\n']);
        let block = write_hash_block(&map);
        assert_eq!(parse_hash_block(&block).unwrap(), map);
    }

    #[test]
    fn test_incremental_block_applies_deletions() {
        let base = props(&[("keep", "1"), ("drop", "2")]);
        let mut block = Vec::new();
        write_delete_entry(&mut block, "drop");
        write_set_entry(&mut block, "new", b"3");
        block.extend_from_slice(b"END\n");
        let merged = parse_incremental_hash_block(&block, base).unwrap();
        assert_eq!(merged, props(&[("keep", "1"), ("new", "3")]));
    }

    #[test]
    fn test_plain_parse_rejects_deletions() {
        let mut block = Vec::new();
        write_delete_entry(&mut block, "x");
        block.extend_from_slice(b"END\n");
        assert!(parse_hash_block(&block).is_err());
    }

    #[test]
    fn test_truncated_block_is_corrupt() {
        let block = write_hash_block(&props(&[("a", "b")]));
        assert!(parse_hash_block(&block[..block.len() - 4]).is_err());
        assert!(parse_hash_block(b"K 5\nab\nV 1\nx\nEND\n").is_err());
    }

    #[test]
    fn test_date_roundtrip_is_monotonic_parseable() {
        let d1 = date_now();
        let parsed = parse_date(&d1).unwrap();
        assert_eq!(
            parsed.to_rfc3339_opts(SecondsFormat::Micros, true),
            d1
        );
        assert!(parse_date("not a date").is_err());
    }

    #[test]
    fn test_prop_diff() {
        let from = props(&[("same", "v"), ("changed", "old"), ("gone", "x")]);
        let to = props(&[("same", "v"), ("changed", "new"), ("added", "y")]);
        let diff = prop_diff(&from, &to);
        assert_eq!(diff.len(), 3);
        assert_eq!(diff["changed"], Some(b"new".to_vec()));
        assert_eq!(diff["added"], Some(b"y".to_vec()));
        assert_eq!(diff["gone"], None);
        assert!(!diff.contains_key("same"));
    }
}
