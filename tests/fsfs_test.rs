//! End-to-end storage engine tests
//!
//! Each test starts from a freshly created repository and drives the
//! public surface the way a repository layer would: transactions,
//! commits, readers, hot-copy, packing, and the history hunts.

use rsvn_fsfs::{
    commit, dated_revision, deleted_rev, file_revs, hotcopy, pack, ChangeKind, FsConfig, FsError,
    Repository, RevisionRoot, Revnum, Transaction,
};
use tempfile::TempDir;

fn create_repo(tmp: &TempDir) -> Repository {
    Repository::create(&tmp.path().join("db")).unwrap()
}

fn commit_file(repo: &Repository, base: Revnum, path: &str, data: &[u8]) -> Revnum {
    let txn = Transaction::begin(repo, base).unwrap();
    if !txn.path_exists(path).unwrap() {
        txn.make_file(path).unwrap();
    }
    txn.apply_text(path, data).unwrap();
    commit(&txn).unwrap()
}

#[test]
fn test_empty_init() {
    let tmp = TempDir::new().unwrap();
    let repo = create_repo(&tmp);

    let format_text = std::fs::read_to_string(tmp.path().join("db/format")).unwrap();
    assert!(format_text.starts_with(&format!("{}\n", rsvn_fsfs::FORMAT_NUMBER)));
    assert_eq!(
        std::fs::read_to_string(tmp.path().join("db/current")).unwrap(),
        "0\n"
    );
    assert_eq!(repo.youngest_rev().unwrap(), 0);

    let root = RevisionRoot::open(&repo, 0).unwrap();
    assert!(root.dir_entries_at("/").unwrap().is_empty());
    assert!(repo.revision_prop(0, "svn:date").unwrap().is_some());
}

#[test]
fn test_single_file_commit() {
    let tmp = TempDir::new().unwrap();
    let repo = create_repo(&tmp);

    let rev = commit_file(&repo, 0, "/a", b"hello\n");
    assert_eq!(rev, 1);
    assert_eq!(repo.youngest_rev().unwrap(), 1);

    let root = RevisionRoot::open(&repo, 1).unwrap();
    assert_eq!(root.file_contents("/a").unwrap(), &b"hello\n"[..]);

    let rep = root.node_rev("/a").unwrap().data_rep.unwrap();
    assert_eq!(rep.expanded_size, 6);
    assert_eq!(hex::encode(rep.md5), "b1946ac92492d2347c6235b4d2611184");
}

#[test]
fn test_rep_sharing_across_commits() {
    let tmp = TempDir::new().unwrap();
    let repo = create_repo(&tmp);

    commit_file(&repo, 0, "/a", b"payload");
    commit_file(&repo, 1, "/b", b"payload");

    let rep_a = RevisionRoot::open(&repo, 1)
        .unwrap()
        .node_rev("/a")
        .unwrap()
        .data_rep
        .unwrap();
    let rep_b = RevisionRoot::open(&repo, 2)
        .unwrap()
        .node_rev("/b")
        .unwrap()
        .data_rep
        .unwrap();
    assert_eq!(rep_a.revision, rep_b.revision);
    assert_eq!(rep_a.offset, rep_b.offset);
    assert_eq!(rep_a.size, rep_b.size);
    // Exactly one rep-cache row for the shared SHA-1.
    assert_eq!(repo.rep_cache().unwrap().count().unwrap(), 1);
}

#[test]
fn test_write_read_roundtrip_binary() {
    let tmp = TempDir::new().unwrap();
    let repo = create_repo(&tmp);

    let blob: Vec<u8> = (0..100_000u32).map(|i| (i * 31 % 251) as u8).collect();
    commit_file(&repo, 0, "/blob", &blob);
    let read_back = RevisionRoot::open(&repo, 1)
        .unwrap()
        .file_contents("/blob")
        .unwrap();
    assert_eq!(read_back.as_ref(), blob.as_slice());
}

#[test]
fn test_zero_byte_file() {
    let tmp = TempDir::new().unwrap();
    let repo = create_repo(&tmp);

    let rev = commit_file(&repo, 0, "/empty", b"");
    let root = RevisionRoot::open(&repo, rev).unwrap();
    assert_eq!(root.file_contents("/empty").unwrap().len(), 0);
    let rep = root.node_rev("/empty").unwrap().data_rep.unwrap();
    assert_eq!(
        rep.sha1.map(hex::encode).unwrap(),
        "da39a3ee5e6b4b0d3255bfef95601890afd80709"
    );
}

#[test]
fn test_predecessor_chain_matches_count() {
    let tmp = TempDir::new().unwrap();
    let repo = create_repo(&tmp);

    for i in 1..=8u64 {
        commit_file(&repo, i - 1, "/f", format!("v{}", i).as_bytes());
    }

    let root = RevisionRoot::open(&repo, 8).unwrap();
    let node = root.node_rev("/f").unwrap();
    assert_eq!(node.predecessor_count, 7);

    // Walking the chain greedily reaches the origin in exactly
    // `predecessor_count` hops.
    let mut hops = 0;
    let mut cursor = node;
    while let Some(pred) = cursor.predecessor_id.clone() {
        cursor = rsvn_fsfs::revision::get_node_revision(&repo, &pred).unwrap();
        hops += 1;
    }
    assert_eq!(hops, 7);
}

#[test]
fn test_skip_delta_chains_are_bounded() {
    let tmp = TempDir::new().unwrap();
    let repo = create_repo(&tmp);

    // 20 successive single-byte-appended revisions.
    let mut contents = Vec::new();
    for i in 1..=20u64 {
        contents.push(b'a');
        commit_file(&repo, i - 1, "/f", &contents);
    }

    let config = repo.config();
    let bound = 2 * config.max_linear_deltification + 2 + 64;
    for rev in 1..=20u64 {
        let root = RevisionRoot::open(&repo, rev).unwrap();
        let node = root.node_rev("/f").unwrap();
        assert_eq!(node.predecessor_count, rev - 1);
        let rep = node.data_rep.unwrap();
        let chain = rsvn_fsfs::revision::rep_chain_length(&repo, &rep).unwrap();
        assert!(chain <= bound, "chain {} too long at r{}", chain, rev);
        // Every revision reassembles to its exact contents.
        assert_eq!(
            root.file_contents("/f").unwrap().len() as u64,
            rev,
            "wrong length at r{}",
            rev
        );
    }
}

#[test]
fn test_out_of_date_transaction_rejected() {
    let tmp = TempDir::new().unwrap();
    let repo = create_repo(&tmp);
    for i in 1..=5u64 {
        commit_file(&repo, i - 1, "/base", format!("v{}", i).as_bytes());
    }

    let t1 = Transaction::begin(&repo, 5).unwrap();
    let t2 = Transaction::begin(&repo, 5).unwrap();
    t1.make_file("/one").unwrap();
    t2.make_file("/two").unwrap();
    assert_eq!(commit(&t1).unwrap(), 6);
    assert!(matches!(commit(&t2), Err(FsError::TxnOutOfDate)));
    assert_eq!(repo.youngest_rev().unwrap(), 6);
}

#[test]
fn test_changed_paths_fold_and_order() {
    let tmp = TempDir::new().unwrap();
    let repo = create_repo(&tmp);

    let txn = Transaction::begin(&repo, 0).unwrap();
    txn.make_dir("/d").unwrap();
    txn.make_file("/d/f").unwrap();
    txn.apply_text("/d/f", b"x").unwrap();
    txn.make_file("/a").unwrap();
    let rev = commit(&txn).unwrap();

    let changed = RevisionRoot::open(&repo, rev).unwrap().changed_paths().unwrap();
    let paths: Vec<&str> = changed.keys().map(|p| p.as_str()).collect();
    assert_eq!(paths, vec!["/a", "/d", "/d/f"]);
    assert_eq!(changed["/a"].kind, ChangeKind::Add);

    // Folding the committed list again yields the same list.
    let refolded = RevisionRoot::open(&repo, rev).unwrap().changed_paths().unwrap();
    assert_eq!(changed, refolded);
}

#[test]
fn test_deleted_rev_bisection_scenario() {
    let tmp = TempDir::new().unwrap();
    let repo = create_repo(&tmp);

    // /x exists from r1; deleted in r20; history runs to r50.
    commit_file(&repo, 0, "/x", b"content");
    for i in 2..=19u64 {
        commit_file(&repo, i - 1, "/noise", format!("v{}", i).as_bytes());
    }
    let txn = Transaction::begin(&repo, 19).unwrap();
    txn.delete("/x").unwrap();
    assert_eq!(commit(&txn).unwrap(), 20);
    for i in 21..=50u64 {
        commit_file(&repo, i - 1, "/noise", format!("v{}", i).as_bytes());
    }

    assert_eq!(deleted_rev(&repo, "/x", 1, 50).unwrap(), Some(20));
}

#[test]
fn test_dated_revision_boundaries() {
    let tmp = TempDir::new().unwrap();
    let repo = create_repo(&tmp);
    for i in 1..=3u64 {
        commit_file(&repo, i - 1, "/f", format!("v{}", i).as_bytes());
        repo.change_rev_prop(
            i,
            "svn:date",
            None,
            Some(format!("2026-02-0{}T10:00:00.000000Z", i).as_bytes()),
        )
        .unwrap();
    }
    repo.change_rev_prop(0, "svn:date", None, Some(b"2026-01-01T00:00:00.000000Z"))
        .unwrap();

    let at = |s: &str| {
        dated_revision(&repo, rsvn_fsfs::props::parse_date(s).unwrap()).unwrap()
    };
    assert_eq!(at("2025-06-01T00:00:00.000000Z"), 0);
    assert_eq!(at("2026-02-02T10:00:00.000000Z"), 2);
    assert_eq!(at("2026-02-02T23:00:00.000000Z"), 2);
    assert_eq!(at("2030-01-01T00:00:00.000000Z"), 3);
}

#[test]
fn test_hotcopy_incremental_catch_up() {
    let tmp = TempDir::new().unwrap();
    let repo = create_repo(&tmp);
    for i in 1..=10u64 {
        commit_file(&repo, i - 1, &format!("/f{}", i), format!("v{}", i).as_bytes());
    }

    let dst_path = tmp.path().join("replica");
    hotcopy(&repo, &dst_path, false).unwrap();

    for i in 11..=15u64 {
        commit_file(&repo, i - 1, &format!("/f{}", i), format!("v{}", i).as_bytes());
    }
    hotcopy(&repo, &dst_path, true).unwrap();

    let dst = Repository::open(&dst_path).unwrap();
    assert_eq!(dst.youngest_rev().unwrap(), 15);
    assert_eq!(
        std::fs::read_to_string(dst_path.join("current")).unwrap(),
        std::fs::read_to_string(tmp.path().join("db/current")).unwrap()
    );
    for rev in 1..=15u64 {
        let src_bytes = std::fs::read(repo.path_rev(rev)).unwrap();
        let dst_bytes = std::fs::read(dst.path_rev(rev)).unwrap();
        assert_eq!(src_bytes, dst_bytes, "rev {} differs", rev);
        // Revprops are logically equivalent.
        assert_eq!(
            repo.revision_proplist(rev).unwrap(),
            dst.revision_proplist(rev).unwrap()
        );
    }
}

#[test]
fn test_incremental_then_fresh_hotcopy_agree() {
    let tmp = TempDir::new().unwrap();
    let repo = create_repo(&tmp);
    for i in 1..=4u64 {
        commit_file(&repo, i - 1, "/f", format!("v{}", i).as_bytes());
    }
    let incr_path = tmp.path().join("incr");
    hotcopy(&repo, &incr_path, false).unwrap();
    for i in 5..=8u64 {
        commit_file(&repo, i - 1, "/f", format!("v{}", i).as_bytes());
    }
    hotcopy(&repo, &incr_path, true).unwrap();

    let fresh_path = tmp.path().join("fresh");
    hotcopy(&repo, &fresh_path, false).unwrap();

    let incr = Repository::open(&incr_path).unwrap();
    let fresh = Repository::open(&fresh_path).unwrap();
    assert_eq!(incr.youngest_rev().unwrap(), fresh.youngest_rev().unwrap());
    for rev in 0..=8u64 {
        assert_eq!(
            std::fs::read(incr.path_rev(rev)).unwrap(),
            std::fs::read(fresh.path_rev(rev)).unwrap(),
            "rev {} differs between the replicas",
            rev
        );
    }
}

#[test]
fn test_plain_everywhere_when_walk_disabled() {
    let tmp = TempDir::new().unwrap();
    let fs_path = tmp.path().join("db");
    Repository::create(&fs_path).unwrap();
    std::fs::write(
        fs_path.join("fsfs.conf"),
        "[deltification]\nmax-deltification-walk = 0\n",
    )
    .unwrap();
    let repo = Repository::open(&fs_path).unwrap();
    assert_eq!(repo.config().max_deltification_walk, 0);

    for i in 1..=6u64 {
        commit_file(&repo, i - 1, "/f", format!("version {}", i).as_bytes());
    }
    for rev in 1..=6u64 {
        let rep = RevisionRoot::open(&repo, rev)
            .unwrap()
            .node_rev("/f")
            .unwrap()
            .data_rep
            .unwrap();
        assert_eq!(
            rsvn_fsfs::revision::rep_chain_length(&repo, &rep).unwrap(),
            0,
            "r{} not PLAIN",
            rev
        );
    }
}

#[test]
fn test_directory_copy_preserves_tree() {
    let tmp = TempDir::new().unwrap();
    let repo = create_repo(&tmp);

    let txn = Transaction::begin(&repo, 0).unwrap();
    txn.make_dir("/trunk").unwrap();
    txn.make_file("/trunk/a").unwrap();
    txn.apply_text("/trunk/a", b"alpha").unwrap();
    txn.make_dir("/trunk/sub").unwrap();
    txn.make_file("/trunk/sub/b").unwrap();
    txn.apply_text("/trunk/sub/b", b"beta").unwrap();
    commit(&txn).unwrap();

    let r1 = RevisionRoot::open(&repo, 1).unwrap();
    let txn = Transaction::begin(&repo, 1).unwrap();
    txn.make_dir("/branches").unwrap();
    txn.copy(&r1, "/trunk", "/branches/b1").unwrap();
    let rev = commit(&txn).unwrap();

    let root = RevisionRoot::open(&repo, rev).unwrap();
    assert_eq!(root.file_contents("/branches/b1/a").unwrap(), &b"alpha"[..]);
    assert_eq!(
        root.file_contents("/branches/b1/sub/b").unwrap(),
        &b"beta"[..]
    );
    let copied = root.node_rev("/branches/b1").unwrap();
    assert_eq!(copied.copyfrom, Some((1, "/trunk".to_string())));
    // The copy and its source share their directory representation.
    let src_rep = r1.node_rev("/trunk").unwrap().data_rep.unwrap();
    let dst_rep = copied.data_rep.unwrap();
    assert_eq!(src_rep.revision, dst_rep.revision);
    assert_eq!(src_rep.offset, dst_rep.offset);
}

#[test]
fn test_file_history_spans_copies() {
    let tmp = TempDir::new().unwrap();
    let repo = create_repo(&tmp);

    commit_file(&repo, 0, "/f", b"one");
    commit_file(&repo, 1, "/f", b"two");
    let r2 = RevisionRoot::open(&repo, 2).unwrap();
    let txn = Transaction::begin(&repo, 2).unwrap();
    txn.copy(&r2, "/f", "/g").unwrap();
    commit(&txn).unwrap();
    commit_file(&repo, 3, "/g", b"three");

    let revs = file_revs(&repo, "/g", 0, 4, false).unwrap();
    let trail: Vec<_> = revs.iter().map(|r| (r.path.as_str(), r.revision)).collect();
    assert_eq!(trail, vec![("/f", 1), ("/f", 2), ("/g", 3), ("/g", 4)]);
}

#[test]
fn test_pack_then_commit_then_hotcopy() {
    let tmp = TempDir::new().unwrap();
    let repo = Repository::create_with_format(
        &tmp.path().join("db"),
        rsvn_fsfs::Format {
            number: 6,
            max_files_per_dir: 4,
        },
    )
    .unwrap();

    for i in 1..=9u64 {
        commit_file(&repo, i - 1, &format!("/f{}", i), format!("v{}", i).as_bytes());
    }
    pack(&repo).unwrap();
    assert_eq!(repo.min_unpacked_rev().unwrap(), 8);

    // Commits keep working after packing.
    commit_file(&repo, 9, "/f10", b"v10");
    assert_eq!(repo.youngest_rev().unwrap(), 10);

    // Hot-copy carries packs and unpacked tails alike.
    let dst_path = tmp.path().join("replica");
    hotcopy(&repo, &dst_path, false).unwrap();
    let dst = Repository::open(&dst_path).unwrap();
    assert_eq!(dst.youngest_rev().unwrap(), 10);
    for rev in 1..=10u64 {
        let root = RevisionRoot::open(&dst, rev).unwrap();
        assert_eq!(
            root.file_contents(&format!("/f{}", rev)).unwrap(),
            format!("v{}", rev).as_bytes()
        );
    }
}

#[test]
fn test_reopen_sees_committed_revisions() {
    let tmp = TempDir::new().unwrap();
    let fs_path = tmp.path().join("db");
    {
        let repo = Repository::create(&fs_path).unwrap();
        commit_file(&repo, 0, "/persisted", b"it stays");
    }
    let repo = Repository::open(&fs_path).unwrap();
    assert!(repo.youngest_rev().unwrap() >= 1);
    assert_eq!(
        RevisionRoot::open(&repo, 1)
            .unwrap()
            .file_contents("/persisted")
            .unwrap(),
        &b"it stays"[..]
    );
}

#[test]
fn test_recover_rebuilds_current() {
    let tmp = TempDir::new().unwrap();
    let repo = create_repo(&tmp);
    for i in 1..=3u64 {
        commit_file(&repo, i - 1, "/f", format!("v{}", i).as_bytes());
    }
    std::fs::write(tmp.path().join("db/current"), "0\n").unwrap();

    let repo = Repository::open(&tmp.path().join("db")).unwrap();
    assert_eq!(repo.recover().unwrap(), 3);
    assert_eq!(repo.youngest_rev().unwrap(), 3);
}

#[test]
fn test_default_config_written_at_create() {
    let tmp = TempDir::new().unwrap();
    create_repo(&tmp);
    let config = FsConfig::read(&tmp.path().join("db"), 6).unwrap();
    assert!(config.rep_sharing_allowed);
    assert!(!config.deltify_directories);
    assert_eq!(config.max_linear_deltification, 16);
}
