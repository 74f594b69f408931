//! Shared test utilities and macros.

use camino::{Utf8Path, Utf8PathBuf};

use crate::hasher::XxHash64Hasher;
use crate::proptree::{PropertyTree, TreeConfig};

/// Asserts that a Result is Ok, printing the error if not.
#[macro_export]
macro_rules! assert_ok {
    ($result:expr) => {
        assert!($result.is_ok(), "Expected Ok, got Err: {:#?}", $result);
    };
}

/// Asserts that a Result is Err, printing the value if not.
#[macro_export]
macro_rules! assert_err {
    ($result:expr) => {
        assert!($result.is_err(), "Expected Err, got Ok: {:#?}", $result);
    };
}

pub fn tmp_root() -> (tempfile::TempDir, Utf8PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
    (dir, root)
}

/// Write a small file, creating intermediate directories.
pub fn write_file(root: &Utf8Path, rel: &str, content: &[u8]) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent.as_std_path()).unwrap();
    }
    std::fs::write(path.as_std_path(), content).unwrap();
}

pub fn hard_link(root: &Utf8Path, existing: &str, new: &str) {
    let new_path = root.join(new);
    if let Some(parent) = new_path.parent() {
        std::fs::create_dir_all(parent.as_std_path()).unwrap();
    }
    std::fs::hard_link(root.join(existing).as_std_path(), new_path.as_std_path()).unwrap();
}

/// An online tree with writeback enabled, default config otherwise.
pub fn open_tree(root: &Utf8Path) -> PropertyTree {
    open_tree_with(root, TreeConfig {
        writeback: true,
        ..TreeConfig::default()
    })
}

pub fn open_tree_with(root: &Utf8Path, config: TreeConfig) -> PropertyTree {
    PropertyTree::open_online(root, Box::new(XxHash64Hasher), config).unwrap()
}
