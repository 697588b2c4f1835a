//! Shard packing
//!
//! A completed shard of revision files can be consolidated into a
//! single `<N>.pack/pack` file plus a `manifest` giving each revision's
//! byte offset, one decimal per line.  On formats with packed revprops,
//! the shard's revision properties are grouped into size-capped files
//! under `revprops/<N>.pack/` with their own manifest
//! (`<rev> <file> <offset> <size>` per line) and optional zstd
//! compression.  Packed and unpacked revisions coexist; the boundary is
//! `min-unpacked-rev`.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{FsError, Result};
use crate::format;
use crate::id::Revnum;
use crate::props::{self, PropList};
use crate::repository::Repository;
use crate::util;

/// Parse a revs-pack manifest: ascending offsets, one per revision.
pub(crate) fn read_manifest(path: &Path) -> Result<Vec<u64>> {
    let text = util::read_text_file(path)?;
    let mut offsets = Vec::new();
    for line in text.lines() {
        let offset = line.parse::<u64>().map_err(|_| {
            FsError::corrupt(format!("Malformed pack manifest '{}'", path.display()))
        })?;
        if let Some(last) = offsets.last() {
            if offset < *last {
                return Err(FsError::corrupt(format!(
                    "Pack manifest '{}' offsets not ascending",
                    path.display()
                )));
            }
        }
        offsets.push(offset);
    }
    Ok(offsets)
}

/// One entry of a revprops-pack manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RevpropEntry {
    rev: Revnum,
    file: String,
    offset: u64,
    size: u64,
}

fn read_revprop_manifest(path: &Path) -> Result<Vec<RevpropEntry>> {
    let text = util::read_text_file(path)?;
    let mut entries = Vec::new();
    for line in text.lines() {
        let mut tokens = line.split(' ');
        let bad = || FsError::corrupt(format!("Malformed revprop manifest '{}'", path.display()));
        let rev = tokens.next().and_then(|t| t.parse().ok()).ok_or_else(bad)?;
        let file = tokens.next().ok_or_else(bad)?.to_string();
        let offset = tokens.next().and_then(|t| t.parse().ok()).ok_or_else(bad)?;
        let size = tokens.next().and_then(|t| t.parse().ok()).ok_or_else(bad)?;
        entries.push(RevpropEntry {
            rev,
            file,
            offset,
            size,
        });
    }
    Ok(entries)
}

fn write_revprop_manifest(path: &Path, entries: &[RevpropEntry]) -> Result<()> {
    let mut out = Vec::new();
    for e in entries {
        out.extend_from_slice(format!("{} {} {} {}\n", e.rev, e.file, e.offset, e.size).as_bytes());
    }
    util::write_atomic(path, &out, None)
}

fn read_group_data(dir: &Path, file: &str) -> Result<Vec<u8>> {
    let path = dir.join(file);
    let raw = util::read_file(&path)?;
    if file.ends_with(".z") {
        zstd::stream::decode_all(&raw[..])
            .map_err(|e| FsError::corrupt(format!("Corrupt packed revprops: {}", e)))
    } else {
        Ok(raw)
    }
}

fn write_group_data(dir: &Path, file: &str, data: &[u8]) -> Result<()> {
    let path = dir.join(file);
    if file.ends_with(".z") {
        let compressed =
            zstd::stream::encode_all(data, 3).map_err(|e| FsError::io(&path, e))?;
        util::write_atomic(&path, &compressed, None)
    } else {
        util::write_atomic(&path, data, None)
    }
}

/// Read the revprops of a packed revision.
pub(crate) fn read_packed_revprops(repo: &Repository, rev: Revnum) -> Result<PropList> {
    let dir = repo.path_revprops_packed_shard(rev);
    let entries = read_revprop_manifest(&dir.join("manifest"))?;
    let entry = entries
        .iter()
        .find(|e| e.rev == rev)
        .ok_or_else(|| FsError::NoSuchRevision(rev as i64))?;
    let data = read_group_data(&dir, &entry.file)?;
    let start = entry.offset as usize;
    let end = start + entry.size as usize;
    if end > data.len() {
        return Err(FsError::corrupt("Packed revprops shorter than manifest"));
    }
    props::parse_hash_block(&data[start..end])
}

/// Rewrite the revprops of one packed revision in place: its group file
/// is rebuilt and the manifest offsets of that group updated.
pub(crate) fn write_packed_revprop(
    repo: &Repository,
    rev: Revnum,
    proplist: &PropList,
) -> Result<()> {
    let dir = repo.path_revprops_packed_shard(rev);
    let manifest_path = dir.join("manifest");
    let mut entries = read_revprop_manifest(&manifest_path)?;
    let target = entries
        .iter()
        .position(|e| e.rev == rev)
        .ok_or_else(|| FsError::NoSuchRevision(rev as i64))?;
    let file = entries[target].file.clone();
    let old_data = read_group_data(&dir, &file)?;

    // Reassemble the group with the new block substituted.
    let mut new_data = Vec::new();
    let mut group_indices = Vec::new();
    for (i, entry) in entries.iter().enumerate() {
        if entry.file != file {
            continue;
        }
        group_indices.push(i);
    }
    let mut rebuilt = Vec::with_capacity(group_indices.len());
    for &i in &group_indices {
        let entry = &entries[i];
        let block = if entry.rev == rev {
            props::write_hash_block(proplist)
        } else {
            let start = entry.offset as usize;
            let end = start + entry.size as usize;
            if end > old_data.len() {
                return Err(FsError::corrupt("Packed revprops shorter than manifest"));
            }
            old_data[start..end].to_vec()
        };
        rebuilt.push((i, new_data.len() as u64, block.len() as u64));
        new_data.extend_from_slice(&block);
    }
    write_group_data(&dir, &file, &new_data)?;
    for (i, offset, size) in rebuilt {
        entries[i].offset = offset;
        entries[i].size = size;
    }
    write_revprop_manifest(&manifest_path, &entries)
}

/// Pack every completed shard below youngest, advancing
/// `min-unpacked-rev` after each shard so readers keep up.
pub fn pack(repo: &Repository) -> Result<()> {
    if repo.format().number < format::MIN_PACKED_FORMAT || !repo.format().sharded() {
        return Ok(());
    }
    repo.with_write_lock(|| {
        let shard_size = repo.format().max_files_per_dir;
        let youngest = repo.youngest_rev_cached()?;
        let completed_shards = (youngest + 1) / shard_size;
        let mut shard = repo.min_unpacked_rev()? / shard_size;
        while shard < completed_shards {
            repo.check_cancel()?;
            pack_shard(repo, shard)?;
            shard += 1;
        }
        Ok(())
    })
}

fn pack_shard(repo: &Repository, shard: u64) -> Result<()> {
    let shard_size = repo.format().max_files_per_dir;
    let first_rev = shard * shard_size;
    let pack_dir = repo.path_rev_packed_shard(first_rev);
    util::ensure_dir_all(&pack_dir)?;

    // Concatenate the shard's revision files, recording offsets.
    let pack_path = pack_dir.join("pack");
    let manifest_path = pack_dir.join("manifest");
    let mut pack_file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&pack_path)
        .map_err(|e| FsError::io(&pack_path, e))?;
    let mut manifest = Vec::new();
    let mut offset = 0u64;
    for rev in first_rev..first_rev + shard_size {
        let data = util::read_file(&repo.path_rev(rev))?;
        manifest.extend_from_slice(format!("{}\n", offset).as_bytes());
        pack_file
            .write_all(&data)
            .map_err(|e| FsError::io(&pack_path, e))?;
        offset += data.len() as u64;
    }
    pack_file
        .sync_all()
        .map_err(|e| FsError::io(&pack_path, e))?;
    util::write_atomic(&manifest_path, &manifest, None)?;

    // Group the shard's revprops, where the format packs them.
    let mut redundant_revprops = Vec::new();
    if repo.format().number >= format::MIN_PACKED_REVPROP_FORMAT {
        redundant_revprops = pack_revprop_shard(repo, shard)?;
    }

    // The pack is complete: move the boundary, then drop the unpacked
    // originals.
    repo.write_min_unpacked_rev(first_rev + shard_size)?;

    let shard_dir = repo.path_rev_shard(first_rev);
    std::fs::remove_dir_all(&shard_dir).map_err(|e| FsError::io(&shard_dir, e))?;
    for path in redundant_revprops {
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(FsError::io(&path, e)),
        }
    }
    // The revprop shard dir may still hold revision 0's file.
    let revprop_shard_dir = repo.path_revprops_shard(first_rev);
    let _ = std::fs::remove_dir(&revprop_shard_dir);
    Ok(())
}

/// Write the packed revprops of one shard.  Returns the unpacked files
/// that are now redundant.  Revision 0's revprops are never packed.
fn pack_revprop_shard(repo: &Repository, shard: u64) -> Result<Vec<PathBuf>> {
    let shard_size = repo.format().max_files_per_dir;
    let first_rev = shard * shard_size;
    let cap = repo.config().revprop_pack_size.max(1);
    let compress = repo.config().compress_packed_revprops;

    let dir = repo.path_revprops_packed_shard(first_rev);
    util::ensure_dir_all(&dir)?;

    let mut entries: Vec<RevpropEntry> = Vec::new();
    let mut redundant = Vec::new();
    let mut group: Vec<(Revnum, Vec<u8>)> = Vec::new();
    let mut group_len = 0u64;

    let flush_group = |group: &mut Vec<(Revnum, Vec<u8>)>,
                       entries: &mut Vec<RevpropEntry>|
     -> Result<()> {
        if group.is_empty() {
            return Ok(());
        }
        let file = if compress {
            format!("{}.z", group[0].0)
        } else {
            group[0].0.to_string()
        };
        let mut data = Vec::new();
        for (rev, block) in group.iter() {
            entries.push(RevpropEntry {
                rev: *rev,
                file: file.clone(),
                offset: data.len() as u64,
                size: block.len() as u64,
            });
            data.extend_from_slice(block);
        }
        write_group_data(&dir, &file, &data)?;
        group.clear();
        Ok(())
    };

    for rev in first_rev..first_rev + shard_size {
        if rev == 0 {
            continue;
        }
        let unpacked = repo.path_revprops(rev);
        let block = util::read_file(&unpacked)?;
        if group_len > 0 && group_len + block.len() as u64 > cap {
            flush_group(&mut group, &mut entries)?;
            group_len = 0;
        }
        group_len += block.len() as u64;
        group.push((rev, block));
        redundant.push(unpacked);
    }
    flush_group(&mut group, &mut entries)?;
    write_revprop_manifest(&dir.join("manifest"), &entries)?;
    Ok(redundant)
}

/// For upgrades: pack the revprops of every shard whose revisions are
/// already packed, returning the now-redundant unpacked files (removed
/// only after the new format stamp is in place).
pub(crate) fn collect_packed_revprop_shards(repo: &Repository) -> Result<Vec<PathBuf>> {
    if !repo.format().sharded() {
        return Ok(Vec::new());
    }
    let shard_size = repo.format().max_files_per_dir;
    let min_unpacked = repo.refresh_min_unpacked_rev()?;
    let mut redundant = Vec::new();
    for shard in 0..min_unpacked / shard_size {
        let first_rev = shard * shard_size;
        if repo
            .path_revprops_packed_shard(first_rev)
            .join("manifest")
            .exists()
        {
            continue;
        }
        redundant.extend(pack_revprop_shard(repo, shard)?);
    }
    Ok(redundant)
}

pub(crate) fn remove_unpacked_revprops(files: &[PathBuf]) -> Result<()> {
    for path in files {
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(FsError::io(path, e)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit;
    use crate::format::Format;
    use crate::repository::Repository;
    use crate::revision::RevisionRoot;
    use crate::txn::Transaction;
    use tempfile::TempDir;

    /// Repository with a tiny shard size so packing kicks in quickly.
    fn small_shard_repo() -> (TempDir, Repository) {
        let tmp = TempDir::new().unwrap();
        let repo = Repository::create_with_format(
            &tmp.path().join("db"),
            Format {
                number: 6,
                max_files_per_dir: 4,
            },
        )
        .unwrap();
        (tmp, repo)
    }

    fn commit_rev(repo: &Repository, base: u64, marker: &str) -> u64 {
        let txn = Transaction::begin(repo, base).unwrap();
        let path = format!("/f-{}", marker);
        txn.make_file(&path).unwrap();
        txn.apply_text(&path, marker.as_bytes()).unwrap();
        let rev = commit::commit(&txn).unwrap();
        repo.change_rev_prop(rev, "svn:log", None, Some(marker.as_bytes()))
            .unwrap();
        rev
    }

    #[test]
    fn test_pack_consolidates_completed_shards() {
        let (_tmp, repo) = small_shard_repo();
        for i in 1..=9u64 {
            commit_rev(&repo, i - 1, &format!("r{}", i));
        }
        pack(&repo).unwrap();

        // Shards 0 and 1 (revs 0..8) are complete and packed; shard 2
        // is still open.
        assert_eq!(repo.min_unpacked_rev().unwrap(), 8);
        assert!(repo.path_rev_pack_file(0).exists());
        assert!(repo.path_rev_pack_file(4).exists());
        assert!(!repo.path_rev_shard(0).exists());
        assert!(repo.path_rev(8).exists());

        let manifest = read_manifest(&repo.path_rev_pack_manifest(0)).unwrap();
        assert_eq!(manifest.len(), 4);
        assert_eq!(manifest[0], 0);
    }

    #[test]
    fn test_packed_revisions_remain_readable() {
        let (_tmp, repo) = small_shard_repo();
        for i in 1..=9u64 {
            commit_rev(&repo, i - 1, &format!("r{}", i));
        }
        pack(&repo).unwrap();

        for rev in 1..=9u64 {
            let root = RevisionRoot::open(&repo, rev).unwrap();
            let contents = root.file_contents(&format!("/f-r{}", rev)).unwrap();
            assert_eq!(contents, format!("r{}", rev).as_bytes());
        }
        // Revision 0 still lists an empty root.
        assert!(RevisionRoot::open(&repo, 0)
            .unwrap()
            .dir_entries_at("/")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_packed_revprops_roundtrip() {
        let (_tmp, repo) = small_shard_repo();
        for i in 1..=5u64 {
            commit_rev(&repo, i - 1, &format!("r{}", i));
        }
        pack(&repo).unwrap();
        assert_eq!(repo.min_unpacked_rev().unwrap(), 4);

        // Revisions 1..3 now read their revprops from the pack.
        for rev in 1..=3u64 {
            let log = repo.revision_prop(rev, "svn:log").unwrap().unwrap();
            assert_eq!(log, format!("r{}", rev).into_bytes());
            assert!(!repo.path_revprops(rev).exists());
        }
        // Revision 0's revprops are never packed.
        assert!(repo.path_revprops(0).exists());
    }

    #[test]
    fn test_packed_revprop_rewrite_in_place() {
        let (_tmp, repo) = small_shard_repo();
        for i in 1..=5u64 {
            commit_rev(&repo, i - 1, &format!("r{}", i));
        }
        pack(&repo).unwrap();

        repo.change_rev_prop(2, "svn:log", None, Some(b"rewritten message"))
            .unwrap();
        assert_eq!(
            repo.revision_prop(2, "svn:log").unwrap().unwrap(),
            b"rewritten message"
        );
        // Neighbors in the same group are untouched.
        assert_eq!(repo.revision_prop(1, "svn:log").unwrap().unwrap(), b"r1");
        assert_eq!(repo.revision_prop(3, "svn:log").unwrap().unwrap(), b"r3");
    }

    #[test]
    fn test_manifest_rejects_unsorted_offsets() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("manifest");
        std::fs::write(&path, "0\n100\n50\n").unwrap();
        assert!(read_manifest(&path).is_err());
        std::fs::write(&path, "0\nbogus\n").unwrap();
        assert!(read_manifest(&path).is_err());
    }
}
