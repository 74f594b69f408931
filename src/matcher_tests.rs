//! Planner tests: the seed scenarios plus end-to-end execution against
//! real directories.

use std::collections::BTreeSet;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::PlanImpossible;
use crate::matcher::{SyncCmd, TreePairMatcher};
use crate::proptree::PropertyTree;
use crate::test_utils::{hard_link, open_tree, tmp_root, write_file};

fn plan_between(src: &Utf8Path, tgt: &Utf8Path) -> (PropertyTree, PropertyTree, Vec<SyncCmd>) {
    let mut src_tree = open_tree(src);
    let mut tgt_tree = open_tree(tgt);
    let mut matcher = TreePairMatcher::new(&mut src_tree, &mut tgt_tree).unwrap();
    let cmds = matcher.plan(&tgt_tree).unwrap();
    (src_tree, tgt_tree, cmds)
}

/// All paths of all files in a tree, as one set.
fn path_set(tree: &mut PropertyTree) -> BTreeSet<Utf8PathBuf> {
    tree.walk_files()
        .unwrap()
        .into_iter()
        .flat_map(|id| tree.tree().file(id).unwrap().paths.clone())
        .collect()
}

#[test]
fn rename_only() {
    let (_s, src) = tmp_root();
    let (_t, tgt) = tmp_root();
    write_file(&src, "a/x", b"X-content");
    write_file(&tgt, "a/y", b"X-content");

    let (_src_tree, mut tgt_tree, cmds) = plan_between(&src, &tgt);
    assert_eq!(
        cmds,
        vec![SyncCmd::Mv {
            from: "a/y".into(),
            to: "a/x".into()
        }]
    );

    tgt_tree.exec_cmds(&cmds).unwrap();
    assert!(tgt.join("a/x").is_file());
    assert!(!tgt.join("a/y").exists());
}

#[test]
fn hard_link_propagation() {
    let (_s, src) = tmp_root();
    let (_t, tgt) = tmp_root();
    write_file(&src, "a", b"shared");
    hard_link(&src, "a", "b");
    write_file(&tgt, "a", b"shared");

    let (_src_tree, mut tgt_tree, cmds) = plan_between(&src, &tgt);
    assert_eq!(
        cmds,
        vec![SyncCmd::Ln {
            existing: "a".into(),
            new: "b".into()
        }]
    );

    tgt_tree.exec_cmds(&cmds).unwrap();
    let id_a = tgt_tree.file_at(Utf8Path::new("a")).unwrap().unwrap();
    let id_b = tgt_tree.file_at(Utf8Path::new("b")).unwrap().unwrap();
    assert_eq!(id_a, id_b, "same file on disk after ln");
}

#[test]
fn swap_is_rejected_as_impossible() {
    let (_s, src) = tmp_root();
    let (_t, tgt) = tmp_root();
    // Same length, different content: a straight pairing is a 2-cycle.
    write_file(&src, "p", b"XX");
    write_file(&src, "q", b"YY");
    write_file(&tgt, "p", b"YY");
    write_file(&tgt, "q", b"XX");

    let mut src_tree = open_tree(&src);
    let mut tgt_tree = open_tree(&tgt);
    let mut matcher = TreePairMatcher::new(&mut src_tree, &mut tgt_tree).unwrap();
    let err = matcher.plan(&tgt_tree).unwrap_err();
    assert!(err.downcast_ref::<PlanImpossible>().is_some());
}

#[test]
fn already_synced_plans_nothing() {
    let (_s, src) = tmp_root();
    let (_t, tgt) = tmp_root();
    for root in [&src, &tgt] {
        write_file(root, "a/x", b"one");
        write_file(root, "b/y", b"two-two");
        write_file(root, "z", b"three-three");
    }
    let mut src_tree = open_tree(&src);
    let mut tgt_tree = open_tree(&tgt);
    let mut matcher = TreePairMatcher::new(&mut src_tree, &mut tgt_tree).unwrap();
    let cmds = matcher.plan(&tgt_tree).unwrap();
    assert!(cmds.is_empty());
    assert!(matcher.is_noop());
}

#[test]
fn extra_target_link_is_unlinked_with_witness() {
    let (_s, src) = tmp_root();
    let (_t, tgt) = tmp_root();
    write_file(&src, "a", b"content");
    write_file(&tgt, "a", b"content");
    hard_link(&tgt, "a", "b");

    let (_src_tree, mut tgt_tree, cmds) = plan_between(&src, &tgt);
    assert_eq!(
        cmds,
        vec![SyncCmd::Rm {
            path: "b".into(),
            witness: "a".into()
        }]
    );
    tgt_tree.exec_cmds(&cmds).unwrap();
    assert!(!tgt.join("b").exists());
    assert!(tgt.join("a").is_file());
}

#[test]
fn unique_content_is_left_alone() {
    let (_s, src) = tmp_root();
    let (_t, tgt) = tmp_root();
    write_file(&src, "only-in-source", b"sss");
    write_file(&tgt, "only-in-target", b"tttt");

    let (_src_tree, _tgt_tree, cmds) = plan_between(&src, &tgt);
    assert!(cmds.is_empty(), "no common signatures, nothing to do");
    assert!(tgt.join("only-in-target").is_file());
}

#[test]
fn mixed_scenario_reaches_source_layout() {
    let (_s, src) = tmp_root();
    let (_t, tgt) = tmp_root();
    // Source: X linked at two paths, Y at one.
    write_file(&src, "d1/x", b"X-data");
    hard_link(&src, "d1/x", "d2/x-alias");
    write_file(&src, "y", b"Y-data");
    // Target: same content, all in the wrong places.
    write_file(&tgt, "old/x", b"X-data");
    write_file(&tgt, "d1/y-misplaced", b"Y-data");

    let (mut src_tree, mut tgt_tree, cmds) = plan_between(&src, &tgt);
    assert!(!cmds.is_empty());
    tgt_tree.exec_cmds(&cmds).unwrap();

    assert_eq!(path_set(&mut tgt_tree), path_set(&mut src_tree));

    // And on disk, via a completely fresh scan.
    let mut rescanned = open_tree(&tgt);
    assert_eq!(path_set(&mut rescanned), path_set(&mut src_tree));
}

#[test]
fn unlink_then_move_into_freed_path() {
    let (_s, src) = tmp_root();
    let (_t, tgt) = tmp_root();
    // Source wants X at p only, Y at q.
    write_file(&src, "p", b"XXXX");
    write_file(&src, "q", b"YYYY");
    // Target has X at x1 AND q (extra link), Y at y1: the mv of y1 to q
    // needs q freed first, so its rm must be emitted in advance.
    write_file(&tgt, "x1", b"XXXX");
    hard_link(&tgt, "x1", "q");
    write_file(&tgt, "y1", b"YYYY");

    let (mut src_tree, mut tgt_tree, cmds) = plan_between(&src, &tgt);
    tgt_tree.exec_cmds(&cmds).unwrap();
    assert_eq!(path_set(&mut tgt_tree), path_set(&mut src_tree));

    // The freed path was removed before anything was written over it.
    let rm_pos = cmds
        .iter()
        .position(|c| matches!(c, SyncCmd::Rm { path, .. } if path == "q"));
    let mv_pos = cmds
        .iter()
        .position(|c| matches!(c, SyncCmd::Mv { to, .. } if to == "q"));
    if let (Some(rm), Some(mv)) = (rm_pos, mv_pos) {
        assert!(rm < mv, "rm of q must precede mv onto q");
    }
}

#[test]
fn content_preserved_across_any_plan() {
    let (_s, src) = tmp_root();
    let (_t, tgt) = tmp_root();
    write_file(&src, "a/f1", b"11");
    write_file(&src, "b/f2", b"22");
    write_file(&src, "c/f3", b"33");
    write_file(&tgt, "x/f1", b"11");
    write_file(&tgt, "y/f2", b"22");
    write_file(&tgt, "z/other", b"unique-content");

    let (_src_tree, mut tgt_tree, cmds) = plan_between(&src, &tgt);
    let before: BTreeSet<i64> = tgt_tree.walk_files().unwrap().into_iter().collect();
    tgt_tree.exec_cmds(&cmds).unwrap();
    let after: BTreeSet<i64> = tgt_tree.walk_files().unwrap().into_iter().collect();
    assert_eq!(before, after, "no file lost or gained by the plan");
}

#[test]
fn executed_plan_reverses_to_original_state() {
    let (_s, src) = tmp_root();
    let (_t, tgt) = tmp_root();
    write_file(&src, "new/name", b"move-me");
    write_file(&src, "linked", b"link-me");
    hard_link(&src, "linked", "linked-alias");
    write_file(&tgt, "old/name", b"move-me");
    write_file(&tgt, "linked", b"link-me");

    let (_src_tree, mut tgt_tree, cmds) = plan_between(&src, &tgt);
    let before = path_set(&mut tgt_tree);
    tgt_tree.exec_cmds(&cmds).unwrap();
    tgt_tree.exec_cmds_reverse(cmds.iter()).unwrap();
    assert_eq!(path_set(&mut tgt_tree), before);

    let mut rescanned = open_tree(&tgt);
    assert_eq!(path_set(&mut rescanned), before);
}

#[test]
fn overlapping_online_trees_are_rejected() {
    let (_t, root) = tmp_root();
    write_file(&root, "sub/f", b"data");
    std::fs::create_dir_all(root.join("sub/inner").as_std_path()).unwrap();

    let mut outer = open_tree(&root);
    let mut inner = open_tree(&root.join("sub"));
    assert!(TreePairMatcher::new(&mut outer, &mut inner).is_err());
}

#[test]
fn offline_source_plans_against_online_target() {
    let (_s, src) = tmp_root();
    let (_t, tgt) = tmp_root();
    write_file(&src, "wanted/name", b"payload");
    write_file(&tgt, "stray", b"payload");

    // Freeze the source and plan from the snapshot alone.
    let (_snap_tmp, snap_root) = tmp_root();
    let snapshot = snap_root.join("src.db");
    let mut src_online = open_tree(&src);
    src_online.bulk_update().unwrap();
    src_online.freeze_offline(&snapshot, None).unwrap();
    drop(src_online);

    let mut src_tree = PropertyTree::open_offline(
        &snapshot,
        Box::new(crate::hasher::XxHash64Hasher),
        crate::proptree::TreeConfig::default(),
    )
    .unwrap();
    let mut tgt_tree = open_tree(&tgt);
    let mut matcher = TreePairMatcher::new(&mut src_tree, &mut tgt_tree).unwrap();
    let cmds = matcher.plan(&tgt_tree).unwrap();
    assert_eq!(
        cmds,
        vec![SyncCmd::Mv {
            from: "stray".into(),
            to: "wanted/name".into()
        }]
    );
    tgt_tree.exec_cmds(&cmds).unwrap();
    assert!(tgt.join("wanted/name").is_file());
}

#[test]
fn target_must_be_online() {
    let (_s, src) = tmp_root();
    write_file(&src, "f", b"x");
    let (_snap_tmp, snap_root) = tmp_root();
    let snapshot = snap_root.join("t.db");
    let mut online = open_tree(&src);
    online.bulk_update().unwrap();
    online.freeze_offline(&snapshot, None).unwrap();
    drop(online);

    let mut offline = PropertyTree::open_offline(
        &snapshot,
        Box::new(crate::hasher::XxHash64Hasher),
        crate::proptree::TreeConfig::default(),
    )
    .unwrap();
    let mut src_tree = open_tree(&src);
    assert!(TreePairMatcher::new(&mut src_tree, &mut offline).is_err());
}
