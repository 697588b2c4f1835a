//! Hot-copy
//!
//! Produces a usable replica of a repository that keeps accepting
//! writes.  The destination's write lock is held throughout; readers of
//! the destination see revisions appear in order because `current` is
//! only bumped after the files backing it are in place.  The format
//! stamp is written last, so an interrupted destination never opens as
//! a valid repository.

use std::path::Path;

use crate::error::{FsError, Result};
use crate::format;
use crate::id::Revnum;
use crate::locks;
use crate::rep_cache::{self, RepCache};
use crate::repository::{
    Repository, PATH_CURRENT, PATH_FORMAT, PATH_MIN_UNPACKED_REV, PATH_NODE_ORIGINS_DIR,
    PATH_REVPROPS_DIR, PATH_REVPROP_GENERATION, PATH_REVS_DIR, PATH_TXNS_DIR, PATH_TXN_CURRENT,
    PATH_TXN_CURRENT_LOCK, PATH_TXN_PROTOS_DIR, PATH_UUID, PATH_WRITE_LOCK,
};
use crate::util;

/// Hot-copy `src` to `dst_path`.  With `incremental`, the destination
/// must already hold a previous hot-copy of the same source; otherwise
/// it must be absent or empty.
pub fn hotcopy(src: &Repository, dst_path: &Path, incremental: bool) -> Result<()> {
    let dst = if incremental {
        let dst = Repository::open(dst_path)?;
        check_incremental_preconditions(src, &dst)?;
        dst
    } else {
        create_empty_dest(src, dst_path)?
    };

    dst.with_write_lock(|| hotcopy_body(src, &dst, incremental))
}

/// Incremental hot-copy only works between identical layouts of the
/// same repository.
fn check_incremental_preconditions(src: &Repository, dst: &Repository) -> Result<()> {
    if src.format().number != dst.format().number {
        return Err(FsError::HotcopyMismatch(format!(
            "the FSFS format ({}) of the hotcopy source does not match the FSFS format ({}) of the hotcopy destination",
            src.format().number,
            dst.format().number
        )));
    }
    if src.uuid() != dst.uuid() {
        return Err(FsError::HotcopyMismatch(
            "the UUID of the hotcopy source does not match the UUID of the hotcopy destination"
                .into(),
        ));
    }
    if src.format().max_files_per_dir != dst.format().max_files_per_dir {
        return Err(FsError::HotcopyMismatch(
            "the sharding layout configuration of the hotcopy source does not match the hotcopy destination".into(),
        ));
    }
    Ok(())
}

/// Lay out an empty destination with the source's configuration.  No
/// revisions yet, not even revision zero, and no format stamp.
fn create_empty_dest(src: &Repository, dst_path: &Path) -> Result<Repository> {
    let fmt = src.format();
    util::ensure_dir_all(dst_path)?;

    if fmt.sharded() {
        util::ensure_dir_all(&dst_path.join(PATH_REVS_DIR).join("0"))?;
        util::ensure_dir_all(&dst_path.join(PATH_REVPROPS_DIR).join("0"))?;
    } else {
        util::ensure_dir_all(&dst_path.join(PATH_REVS_DIR))?;
        util::ensure_dir_all(&dst_path.join(PATH_REVPROPS_DIR))?;
    }
    util::ensure_dir_all(&dst_path.join(PATH_TXNS_DIR))?;
    if fmt.number >= format::MIN_PROTOREVS_DIR_FORMAT {
        util::ensure_dir_all(&dst_path.join(PATH_TXN_PROTOS_DIR))?;
    }

    let current = if fmt.number >= format::MIN_NO_GLOBAL_IDS_FORMAT {
        "0\n".to_string()
    } else {
        "0 1 1\n".to_string()
    };
    util::create_file(&dst_path.join(PATH_CURRENT), current.as_bytes())?;
    util::create_file(&dst_path.join(PATH_WRITE_LOCK), b"")?;
    util::write_atomic(
        &dst_path.join(PATH_UUID),
        format!("{}\n", src.uuid()).as_bytes(),
        None,
    )?;
    if fmt.number >= format::MIN_PACKED_FORMAT {
        util::create_file(&dst_path.join(PATH_MIN_UNPACKED_REV), b"0\n")?;
    }
    if fmt.number >= format::MIN_TXN_CURRENT_FORMAT {
        util::create_file(&dst_path.join(PATH_TXN_CURRENT), b"0\n")?;
        util::create_file(&dst_path.join(PATH_TXN_CURRENT_LOCK), b"")?;
    }

    Ok(Repository::open_unstamped(
        dst_path,
        fmt,
        src.uuid().to_string(),
        src.config().clone(),
    ))
}

/// Copy one unpacked revision or revprop file, shard-aware.
fn copy_shard_file(
    src_subdir: &Path,
    dst_subdir: &Path,
    rev: Revnum,
    max_files_per_dir: u64,
) -> Result<()> {
    let (src_dir, dst_dir) = if max_files_per_dir > 0 {
        let shard = (rev / max_files_per_dir).to_string();
        let dst_shard = dst_subdir.join(&shard);
        util::ensure_dir_all(&dst_shard)?;
        (src_subdir.join(&shard), dst_shard)
    } else {
        (src_subdir.to_path_buf(), dst_subdir.to_path_buf())
    };
    util::copy_file_unless_same(&src_dir.join(rev.to_string()), &dst_dir.join(rev.to_string()))
}

/// Copy the packed shard containing `rev` plus its revprops, bumping
/// the destination's min-unpacked-rev.
fn copy_packed_shard(
    dst_min_unpacked: &mut Revnum,
    src: &Repository,
    dst: &Repository,
    rev: Revnum,
) -> Result<()> {
    let shard_size = src.format().max_files_per_dir;

    util::copy_dir_recursively(
        &src.path_rev_packed_shard(rev),
        &dst.path_rev_packed_shard(rev),
    )?;

    let src_revprop_pack = src.path_revprops_packed_shard(rev);
    if src.format().number >= format::MIN_PACKED_REVPROP_FORMAT && src_revprop_pack.is_dir() {
        // Revision 0's revprops are never packed.
        if rev == 0 {
            copy_shard_file(
                &src.path().join(PATH_REVPROPS_DIR),
                &dst.path().join(PATH_REVPROPS_DIR),
                0,
                shard_size,
            )?;
        }
        util::copy_dir_recursively(&src_revprop_pack, &dst.path_revprops_packed_shard(rev))?;
    } else {
        for revprop_rev in rev..rev + shard_size {
            copy_shard_file(
                &src.path().join(PATH_REVPROPS_DIR),
                &dst.path().join(PATH_REVPROPS_DIR),
                revprop_rev,
                shard_size,
            )?;
        }
    }

    if *dst_min_unpacked < rev + shard_size {
        *dst_min_unpacked = rev + shard_size;
        util::write_number_file(
            &dst.path().join(PATH_MIN_UNPACKED_REV),
            *dst_min_unpacked,
            None,
        )?;
    }
    Ok(())
}

/// Bump the destination's `current` once `new_youngest` is fully in
/// place, so destination readers see progress.
fn update_current(
    dst_youngest: &mut Revnum,
    src: &Repository,
    dst: &Repository,
    new_youngest: Revnum,
) -> Result<()> {
    if *dst_youngest >= new_youngest {
        return Ok(());
    }
    let next_ids = if dst.format().number < format::MIN_NO_GLOBAL_IDS_FORMAT {
        // The source's counters bound everything the copied revisions
        // use.
        let (_, ids) = src.read_current()?;
        ids
    } else {
        None
    };
    dst.write_current(new_youngest, next_ids)?;
    *dst_youngest = new_youngest;
    Ok(())
}

/// Remove unpacked revision files `[start_rev, end_rev)` from the
/// destination after their shard arrived packed, along with revprop
/// files that moved into a revprops pack.
fn remove_rev_files(dst: &Repository, start_rev: Revnum, end_rev: Revnum) -> Result<()> {
    let revprops_packed = dst.format().number >= format::MIN_PACKED_REVPROP_FORMAT
        && dst
            .path_revprops_packed_shard(start_rev)
            .join("manifest")
            .exists();
    for rev in start_rev..end_rev {
        let mut doomed = vec![dst.path_rev(rev)];
        if revprops_packed && rev > 0 {
            doomed.push(dst.path_revprops(rev));
        }
        for path in doomed {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(FsError::io(&path, e)),
            }
        }
    }
    Ok(())
}

fn hotcopy_body(src: &Repository, dst: &Repository, incremental: bool) -> Result<()> {
    let shard_size = src.format().max_files_per_dir;

    // The config travels first: a destination that fails later is at
    // least diagnosable.
    if src.format().number >= format::MIN_CONFIG_FILE_FORMAT {
        let config_src = src.path().join(crate::config::CONFIG_FILENAME);
        if config_src.exists() {
            util::copy_file(
                &config_src,
                &dst.path().join(crate::config::CONFIG_FILENAME),
            )?;
        }
    }
    src.check_cancel()?;

    let src_youngest = src.youngest_rev()?;
    let mut dst_youngest = if incremental {
        let y = dst.youngest_rev()?;
        if src_youngest < y {
            return Err(FsError::HotcopyMismatch(format!(
                "the hotcopy destination already contains more revisions ({}) than the hotcopy source ({}); are source and destination swapped?",
                y, src_youngest
            )));
        }
        y
    } else {
        0
    };

    let (src_min_unpacked, mut dst_min_unpacked) =
        if src.format().number >= format::MIN_PACKED_FORMAT {
            let src_min = src.refresh_min_unpacked_rev()?;
            let dst_min = dst.refresh_min_unpacked_rev()?;
            if src_min < dst_min {
                return Err(FsError::HotcopyMismatch(format!(
                    "the hotcopy destination already contains more packed revisions ({}) than the hotcopy source ({})",
                    dst_min.saturating_sub(1),
                    src_min.saturating_sub(1)
                )));
            }
            util::copy_file(
                &src.path().join(PATH_MIN_UNPACKED_REV),
                &dst.path().join(PATH_MIN_UNPACKED_REV),
            )?;
            (src_min, dst_min)
        } else {
            (0, 0)
        };
    src.check_cancel()?;

    // Packed shards first.
    let mut rev: Revnum = 0;
    while rev < src_min_unpacked {
        src.check_cancel()?;
        copy_packed_shard(&mut dst_min_unpacked, src, dst, rev)?;

        // Readers of the destination may use this pack right away.
        update_current(&mut dst_youngest, src, dst, rev + shard_size - 1)?;

        if incremental {
            remove_rev_files(dst, rev, rev + shard_size)?;
        }
        // The unpacked shard directory is gone once it is empty; a
        // shard shared with unpacked newer revs stays.
        let _ = std::fs::remove_dir(dst.path_rev_shard(rev));

        rev += shard_size;
    }

    // Unpacked revisions, rev and revprops pairwise.
    while rev <= src_youngest {
        src.check_cancel()?;
        match copy_shard_file(
            &src.path().join(PATH_REVS_DIR),
            &dst.path().join(PATH_REVS_DIR),
            rev,
            shard_size,
        ) {
            Ok(()) => {}
            Err(FsError::Io { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound
                    && src.format().number >= format::MIN_PACKED_FORMAT =>
            {
                // The source packed this shard while we were copying.
                let now_min_unpacked = src.refresh_min_unpacked_rev()?;
                if rev < now_min_unpacked {
                    if src_youngest < now_min_unpacked {
                        return Err(FsError::HotcopyRestart(src_youngest));
                    }
                    copy_packed_shard(&mut dst_min_unpacked, src, dst, rev)?;
                    if incremental {
                        remove_rev_files(dst, rev, dst_min_unpacked)?;
                    }
                    rev = dst_min_unpacked;
                    continue;
                }
                return Err(FsError::corrupt(format!(
                    "Revision {} disappeared from the hotcopy source while hotcopy was in progress",
                    rev
                )));
            }
            Err(e) => return Err(e),
        }

        copy_shard_file(
            &src.path().join(PATH_REVPROPS_DIR),
            &dst.path().join(PATH_REVPROPS_DIR),
            rev,
            shard_size,
        )?;

        // After completing a shard, let destination readers advance.
        if shard_size > 0 && rev % shard_size == 0 {
            update_current(&mut dst_youngest, src, dst, rev)?;
        }
        rev += 1;
    }
    src.check_cancel()?;

    update_current(&mut dst_youngest, src, dst, src_youngest)?;

    // Replace the locks tree wholesale; readers may briefly see stale
    // locks, which beats keeping deleted ones.
    let dst_locks = dst.path().join(locks::LOCKS_DIR);
    if dst_locks.exists() {
        std::fs::remove_dir_all(&dst_locks).map_err(|e| FsError::io(&dst_locks, e))?;
    }
    let src_locks = src.path().join(locks::LOCKS_DIR);
    if src_locks.is_dir() {
        util::copy_dir_recursively(&src_locks, &dst_locks)?;
    }

    let src_origins = src.path().join(PATH_NODE_ORIGINS_DIR);
    if src_origins.is_dir() {
        util::copy_dir_recursively(&src_origins, &dst.path().join(PATH_NODE_ORIGINS_DIR))?;
    }

    // Rep-cache rows beyond the destination's youngest would point at
    // revisions it does not have.
    if dst.format().number >= format::MIN_REP_SHARING_FORMAT {
        let src_db = RepCache::db_path(src.path());
        if src_db.is_file() {
            rep_cache::RepCache::hotcopy_db(&src_db, &RepCache::db_path(dst.path()))?;
            RepCache::open(dst.path())?.delete_newer_than(dst_youngest)?;
        }
    }

    if dst.format().number >= format::MIN_TXN_CURRENT_FORMAT {
        util::copy_file(
            &src.path().join(PATH_TXN_CURRENT),
            &dst.path().join(PATH_TXN_CURRENT),
        )?;
    }

    // A fresh destination starts its revprop generation from scratch.
    if src.path().join(PATH_REVPROP_GENERATION).is_file() {
        util::write_number_file(&dst.path().join(PATH_REVPROP_GENERATION), 0, None)?;
    }

    // The destination is complete; stamp it.
    format::write_format(&dst.path().join(PATH_FORMAT), dst.format(), true)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit;
    use crate::revision::RevisionRoot;
    use crate::txn::Transaction;
    use tempfile::TempDir;

    fn commit_rev(repo: &Repository, base: Revnum, marker: &str) -> Revnum {
        let txn = Transaction::begin(repo, base).unwrap();
        let path = format!("/f-{}", marker);
        txn.make_file(&path).unwrap();
        txn.apply_text(&path, marker.as_bytes()).unwrap();
        commit::commit(&txn).unwrap()
    }

    fn assert_rev_files_identical(src: &Repository, dst: &Repository, youngest: Revnum) {
        for rev in 0..=youngest {
            if src.is_packed_rev(rev).unwrap() {
                continue;
            }
            let a = std::fs::read(src.path_rev(rev)).unwrap();
            let b = std::fs::read(dst.path_rev(rev)).unwrap();
            assert_eq!(a, b, "rev file {} differs", rev);
        }
    }

    #[test]
    fn test_fresh_hotcopy() {
        let tmp = TempDir::new().unwrap();
        let src = Repository::create(&tmp.path().join("src")).unwrap();
        for i in 1..=3u64 {
            commit_rev(&src, i - 1, &format!("r{}", i));
        }

        let dst_path = tmp.path().join("dst");
        hotcopy(&src, &dst_path, false).unwrap();

        let dst = Repository::open(&dst_path).unwrap();
        assert_eq!(dst.youngest_rev().unwrap(), 3);
        assert_eq!(dst.uuid(), src.uuid());
        assert_rev_files_identical(&src, &dst, 3);
        let root = RevisionRoot::open(&dst, 2).unwrap();
        assert_eq!(root.file_contents("/f-r2").unwrap(), &b"r2"[..]);
    }

    #[test]
    fn test_incremental_catch_up() {
        let tmp = TempDir::new().unwrap();
        let src = Repository::create(&tmp.path().join("src")).unwrap();
        for i in 1..=2u64 {
            commit_rev(&src, i - 1, &format!("r{}", i));
        }
        let dst_path = tmp.path().join("dst");
        hotcopy(&src, &dst_path, false).unwrap();

        for i in 3..=5u64 {
            commit_rev(&src, i - 1, &format!("r{}", i));
        }
        hotcopy(&src, &dst_path, true).unwrap();

        let dst = Repository::open(&dst_path).unwrap();
        assert_eq!(dst.youngest_rev().unwrap(), 5);
        assert_rev_files_identical(&src, &dst, 5);
        assert_eq!(
            std::fs::read_to_string(dst_path.join("current")).unwrap(),
            "5\n"
        );
    }

    #[test]
    fn test_swapped_arguments_rejected() {
        let tmp = TempDir::new().unwrap();
        let src = Repository::create(&tmp.path().join("src")).unwrap();
        commit_rev(&src, 0, "r1");
        let dst_path = tmp.path().join("dst");
        hotcopy(&src, &dst_path, false).unwrap();
        commit_rev(&src, 1, "r2");
        hotcopy(&src, &dst_path, true).unwrap();

        // Copying the (now older) source into the newer destination
        // with the roles swapped fails.
        let dst = Repository::open(&dst_path).unwrap();
        commit_rev(&dst, 2, "dst-only");
        assert!(matches!(
            hotcopy(&src, &dst_path, true),
            Err(FsError::HotcopyMismatch(_))
        ));
    }

    #[test]
    fn test_incremental_into_unrelated_repo_rejected() {
        let tmp = TempDir::new().unwrap();
        let src = Repository::create(&tmp.path().join("src")).unwrap();
        let other = Repository::create(&tmp.path().join("other")).unwrap();
        commit_rev(&src, 0, "r1");
        let _ = other;
        assert!(matches!(
            hotcopy(&src, &tmp.path().join("other"), true),
            Err(FsError::HotcopyMismatch(_))
        ));
    }

    #[test]
    fn test_hotcopy_with_packed_shards() {
        let tmp = TempDir::new().unwrap();
        let src = Repository::create_with_format(
            &tmp.path().join("src"),
            crate::format::Format {
                number: 6,
                max_files_per_dir: 4,
            },
        )
        .unwrap();
        for i in 1..=9u64 {
            commit_rev(&src, i - 1, &format!("r{}", i));
        }
        crate::pack::pack(&src).unwrap();

        let dst_path = tmp.path().join("dst");
        hotcopy(&src, &dst_path, false).unwrap();
        let dst = Repository::open(&dst_path).unwrap();
        assert_eq!(dst.youngest_rev().unwrap(), 9);
        assert_eq!(dst.min_unpacked_rev().unwrap(), 8);
        for rev in 1..=9u64 {
            let root = RevisionRoot::open(&dst, rev).unwrap();
            assert_eq!(
                root.file_contents(&format!("/f-r{}", rev)).unwrap(),
                format!("r{}", rev).as_bytes()
            );
        }
    }

    #[test]
    fn test_locks_replace_and_format_stamped_last() {
        let tmp = TempDir::new().unwrap();
        let src = Repository::create(&tmp.path().join("src")).unwrap();
        commit_rev(&src, 0, "r1");
        locks::set_lock(src.path(), "/f-r1", None, "alice", None, None, false).unwrap();

        let dst_path = tmp.path().join("dst");
        hotcopy(&src, &dst_path, false).unwrap();
        let lock = locks::get_lock(&dst_path, "/f-r1").unwrap().unwrap();
        assert_eq!(lock.owner, "alice");
        assert!(dst_path.join("format").exists());
    }
}
