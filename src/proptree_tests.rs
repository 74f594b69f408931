//! Tests for cache-aware fingerprinting over real directories.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

use crate::cachedb::CacheStore;
use crate::error::CacheError;
use crate::hasher::{Fingerprint, HashEngine, Hasher, XxHash64Hasher};
use crate::proptree::{PropertyTree, TreeConfig};
use crate::test_utils::{hard_link, open_tree, open_tree_with, tmp_root, write_file};

/// Wraps the real hasher and counts how often file content is read.
struct CountingHasher {
    inner: XxHash64Hasher,
    calls: Arc<AtomicUsize>,
}

impl Hasher for CountingHasher {
    fn fingerprint_file(&self, path: &Utf8Path) -> std::io::Result<Fingerprint> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.fingerprint_file(path)
    }

    fn fingerprint_bytes(&self, data: &[u8]) -> Fingerprint {
        self.inner.fingerprint_bytes(data)
    }

    fn engine(&self) -> Box<dyn HashEngine> {
        self.inner.engine()
    }

    fn depends_on_size(&self) -> bool {
        true
    }
}

fn counting_tree(root: &Utf8Path, calls: Arc<AtomicUsize>) -> PropertyTree {
    PropertyTree::open_online(
        root,
        Box::new(CountingHasher {
            inner: XxHash64Hasher,
            calls,
        }),
        TreeConfig::default(),
    )
    .unwrap()
}

#[test]
fn scan_indexes_files_and_hard_links() {
    let (_tmp, root) = tmp_root();
    write_file(&root, "a/one.txt", b"alpha");
    write_file(&root, "a/b/two.txt", b"beta-beta");
    hard_link(&root, "a/one.txt", "one-alias.txt");

    let mut tree = open_tree(&root);
    let files = tree.walk_files().unwrap();
    assert_eq!(files.len(), 2, "hard link is not a third file");

    let id = tree.file_at(Utf8Path::new("a/one.txt")).unwrap().unwrap();
    let alias = tree.file_at(Utf8Path::new("one-alias.txt")).unwrap().unwrap();
    assert_eq!(id, alias);
    assert_eq!(tree.tree().file(id).unwrap().paths.len(), 2);

    assert_eq!(tree.size_to_files(5).unwrap(), vec![id]);
}

#[test]
fn fingerprint_cached_in_memory_and_store() {
    let (_tmp, root) = tmp_root();
    write_file(&root, "f.txt", b"some content");
    let calls = Arc::new(AtomicUsize::new(0));

    let mut tree = counting_tree(&root, calls.clone());
    let id = tree.file_at(Utf8Path::new("f.txt")).unwrap().unwrap();
    let fp1 = tree.get_fingerprint(id).unwrap();
    let fp2 = tree.get_fingerprint(id).unwrap();
    assert_eq!(fp1, fp2);
    assert_eq!(calls.load(Ordering::SeqCst), 1, "second hit from memory");
    drop(tree);

    // A fresh tree instance hits the store row, not the hasher.
    let mut tree = counting_tree(&root, calls.clone());
    let id = tree.file_at(Utf8Path::new("f.txt")).unwrap().unwrap();
    assert_eq!(tree.get_fingerprint(id).unwrap(), fp1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn stale_stamp_forces_recompute() {
    let (_tmp, root) = tmp_root();
    write_file(&root, "f.txt", b"version one");
    let mut tree = open_tree(&root);
    let id = tree.file_at(Utf8Path::new("f.txt")).unwrap().unwrap();
    let fp1 = tree.get_fingerprint(id).unwrap();
    drop(tree);

    // Same size, different content; bump mtime past timestamp granularity.
    write_file(&root, "f.txt", b"version two");
    let file = std::fs::File::options()
        .write(true)
        .open(root.join("f.txt").as_std_path())
        .unwrap();
    file.set_modified(std::time::SystemTime::now() + std::time::Duration::from_secs(10))
        .unwrap();
    drop(file);

    let mut tree = open_tree(&root);
    let id = tree.file_at(Utf8Path::new("f.txt")).unwrap().unwrap();
    let fp2 = tree.get_fingerprint(id).unwrap();
    assert_ne!(fp1, fp2);
}

#[test]
fn recheck_detects_unchanged_and_does_not_update() {
    let (_tmp, root) = tmp_root();
    write_file(&root, "f.txt", b"constant");
    let mut tree = open_tree(&root);
    let id = tree.file_at(Utf8Path::new("f.txt")).unwrap().unwrap();
    tree.get_fingerprint(id).unwrap();
    assert!(tree.recheck_fingerprint(id).unwrap());
}

#[test]
fn bulk_update_reports_counts() {
    let (_tmp, root) = tmp_root();
    write_file(&root, "a.txt", b"aaa");
    write_file(&root, "sub/b.txt", b"bbbb");

    let mut tree = open_tree(&root);
    let report = tree.bulk_update().unwrap();
    assert_eq!(report.updated, 2);
    assert_eq!(report.up_to_date, 0);
    assert!(report.errors.is_empty());
    drop(tree);

    let mut tree = open_tree(&root);
    let report = tree.bulk_update().unwrap();
    assert_eq!(report.updated, 0);
    assert_eq!(report.up_to_date, 2);
}

#[test]
fn cache_file_is_never_scanned() {
    let (_tmp, root) = tmp_root();
    write_file(&root, "real.txt", b"data");
    let mut tree = open_tree(&root);
    // Opening created the cache db inside the root.
    for id in tree.walk_files().unwrap() {
        for path in &tree.tree().file(id).unwrap().paths {
            assert!(!path.as_str().ends_with(".db"), "cache file scanned: {path}");
        }
    }
}

#[test]
fn exclude_patterns_classify_entries() {
    let (_tmp, root) = tmp_root();
    write_file(&root, "keep.txt", b"k");
    write_file(&root, "skip.tmp", b"s");
    write_file(&root, "build/out.bin", b"o");

    let mut tree = open_tree_with(
        &root,
        TreeConfig {
            exclude: vec!["*.tmp".into(), "/build/".into()],
            ..TreeConfig::default()
        },
    );
    let files = tree.walk_files().unwrap();
    assert_eq!(files.len(), 1);
    let id = files[0];
    assert_eq!(tree.tree().file(id).unwrap().paths[0], Utf8PathBuf::from("keep.txt"));
}

#[test]
fn skip_empty_and_max_size_policies() {
    let (_tmp, root) = tmp_root();
    write_file(&root, "empty", b"");
    write_file(&root, "small", b"123");
    write_file(&root, "large", &vec![7u8; 4096]);

    let mut tree = open_tree_with(
        &root,
        TreeConfig {
            skip_empty: true,
            max_size: Some(1024),
            ..TreeConfig::default()
        },
    );
    let files = tree.walk_files().unwrap();
    assert_eq!(files.len(), 1);
}

#[test]
fn purge_stale_drops_rows_for_missing_ids() {
    let (_tmp, root) = tmp_root();
    write_file(&root, "f.txt", b"payload");

    // Seed the cache with a row for an id no scan will ever produce.
    {
        let mut store = CacheStore::open_online(&root, "lnsync-").unwrap();
        store
            .put_prop(
                i64::MIN + 123,
                42,
                crate::filetree::Stamp {
                    size: 1,
                    mtime: 1,
                    ctime: 1,
                },
            )
            .unwrap();
    }

    let mut tree = open_tree(&root);
    let id = tree.file_at(Utf8Path::new("f.txt")).unwrap().unwrap();
    tree.get_fingerprint(id).unwrap();
    tree.purge_stale().unwrap();
    drop(tree);

    let store = CacheStore::open_online(&root, "lnsync-").unwrap();
    assert!(store.get_prop(i64::MIN + 123).unwrap().is_none());
    assert!(store.get_prop(id).unwrap().is_some(), "live row kept");
}

#[test]
fn freeze_offline_roundtrip() {
    let (_tmp, root) = tmp_root();
    write_file(&root, "a/one.txt", b"alpha");
    write_file(&root, "a/b/two.txt", b"beta-beta");
    hard_link(&root, "a/one.txt", "alias.txt");

    let (_snap_tmp, snap_root) = tmp_root();
    let snapshot = snap_root.join("frozen.db");

    let mut online = open_tree(&root);
    online.bulk_update().unwrap();
    let one_id = online.file_at(Utf8Path::new("a/one.txt")).unwrap().unwrap();
    let one_fp = online.get_fingerprint(one_id).unwrap();
    online.freeze_offline(&snapshot, None).unwrap();
    drop(online);

    // The snapshot answers structure and fingerprints with no disk tree.
    let mut offline = PropertyTree::open_offline(
        &snapshot,
        Box::new(XxHash64Hasher),
        TreeConfig::default(),
    )
    .unwrap();
    assert!(!offline.is_online());
    let files = offline.walk_files().unwrap();
    assert_eq!(files.len(), 2);

    let id = offline.file_at(Utf8Path::new("a/one.txt")).unwrap().unwrap();
    assert_eq!(id, one_id);
    assert_eq!(offline.get_fingerprint(id).unwrap(), one_fp);
    let paths = &offline.tree().file(id).unwrap().paths;
    assert_eq!(paths.len(), 2, "hard links frozen");
}

#[test]
fn freeze_offline_filter_drops_files() {
    let (_tmp, root) = tmp_root();
    write_file(&root, "kept.txt", b"kkk");
    write_file(&root, "dropped.txt", b"dddd");

    let mut online = open_tree(&root);
    online.bulk_update().unwrap();
    let dropped = online.file_at(Utf8Path::new("dropped.txt")).unwrap().unwrap();

    let (_snap_tmp, snap_root) = tmp_root();
    let snapshot = snap_root.join("part.db");
    let filter = move |id| id != dropped;
    online.freeze_offline(&snapshot, Some(&filter)).unwrap();
    drop(online);

    let mut offline = PropertyTree::open_offline(
        &snapshot,
        Box::new(XxHash64Hasher),
        TreeConfig::default(),
    )
    .unwrap();
    assert!(offline.file_at(Utf8Path::new("dropped.txt")).unwrap().is_none());
    assert!(offline.file_at(Utf8Path::new("kept.txt")).unwrap().is_some());
}

#[test]
fn offline_miss_and_stale_are_typed_errors() {
    let (_tmp, root) = tmp_root();
    write_file(&root, "f.txt", b"content");

    let (_snap_tmp, snap_root) = tmp_root();
    let snapshot = snap_root.join("s.db");
    let mut online = open_tree(&root);
    online.bulk_update().unwrap();
    let id = online.file_at(Utf8Path::new("f.txt")).unwrap().unwrap();
    online.freeze_offline(&snapshot, None).unwrap();
    drop(online);

    // Corrupt the stamp in the metadata table: the prop row goes stale.
    {
        let mut store = CacheStore::open_offline(&snapshot).unwrap();
        store
            .put_offline_metadata(
                id,
                crate::filetree::Stamp {
                    size: 7,
                    mtime: 999999,
                    ctime: 0,
                },
            )
            .unwrap();
    }
    let mut offline = PropertyTree::open_offline(
        &snapshot,
        Box::new(XxHash64Hasher),
        TreeConfig::default(),
    )
    .unwrap();
    let id = offline.file_at(Utf8Path::new("f.txt")).unwrap().unwrap();
    let err = offline.get_fingerprint(id).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<CacheError>(),
        Some(CacheError::Stale { .. })
    ));
}

#[cfg(unix)]
#[test]
fn symlinks_are_never_files() {
    let (_tmp, root) = tmp_root();
    write_file(&root, "real.txt", b"data");
    std::os::unix::fs::symlink(
        root.join("real.txt").as_std_path(),
        root.join("link.txt").as_std_path(),
    )
    .unwrap();

    let mut tree = open_tree(&root);
    assert_eq!(tree.walk_files().unwrap().len(), 1);
    assert!(matches!(
        tree.path_to_item(Utf8Path::new("link.txt")).unwrap(),
        Some(crate::filetree::ItemRef::Other)
    ));
}
