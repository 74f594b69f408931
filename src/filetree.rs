//! In-memory file tree with hard-link support.
//!
//! Because hard links are supported, files are distinct from file paths: a
//! file has one or more tree-relative paths and a stable 64-bit id. The tree
//! is an arena — directories live in a `Vec` addressed by [`DirIx`], files in
//! an id-keyed map — so there are no parent/child reference cycles; a child
//! holds its parent's index.
//!
//! Directory contents are filled in by whoever drives scanning (see
//! `proptree`): entries are classified File / Dir / Other / Excluded, and
//! `Other` covers symlinks, special files, and unreadable entries, which
//! occupy a name in their directory but are skipped by every walker and
//! index. Files are indexed by id and by size; the size index is complete
//! once every discovered directory has been scanned.
//!
//! Path operations (move, link, unlink, rmdir) mutate only the in-memory
//! structure here. Mirroring them to disk is the property tree's business.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;

use crate::error::TreeError;
use crate::fileid::FileId;

pub type DirId = i64;

/// Arena index of a directory. The root is always `DirIx(0)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DirIx(pub usize);

pub const ROOT: DirIx = DirIx(0);

/// File metadata stamp. Two stamps are equal when size and mtime agree;
/// ctime is carried along but never compared.
#[derive(Clone, Copy, Debug)]
pub struct Stamp {
    pub size: u64,
    pub mtime: i64,
    pub ctime: i64,
}

impl PartialEq for Stamp {
    fn eq(&self, other: &Self) -> bool {
        self.size == other.size && self.mtime == other.mtime
    }
}

impl std::fmt::Display for Stamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "md[{};{};{}]", self.size, self.mtime, self.ctime)
    }
}

/// What a directory entry points at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ItemRef {
    File(FileId),
    Dir(DirIx),
    /// Symlink, special file, or permission-denied entry. Never indexed.
    Other,
    /// Matched by an exclude pattern. Never indexed.
    Excluded,
}

#[derive(Debug)]
pub struct FileEntry {
    pub id: FileId,
    pub stamp: Stamp,
    /// Tree-relative paths, one per hard link. Never empty while the file
    /// is in the tree.
    pub paths: Vec<Utf8PathBuf>,
}

#[derive(Debug)]
pub struct DirNode {
    pub id: DirId,
    pub parent: Option<DirIx>,
    pub relpath: Utf8PathBuf,
    pub entries: IndexMap<String, ItemRef>,
    scanned: bool,
}

impl DirNode {
    pub fn was_scanned(&self) -> bool {
        self.scanned
    }
}

pub struct FileTree {
    dirs: Vec<DirNode>,
    files: HashMap<FileId, FileEntry>,
    size_index: HashMap<u64, Vec<FileId>>,
    next_dir_id: DirId,
    unscanned_dirs: usize,
    fully_scanned: bool,
    /// Drop zero-length files at scan time.
    pub skip_empty: bool,
    /// Drop files larger than this at scan time.
    pub max_size: Option<u64>,
}

impl FileTree {
    pub fn new(skip_empty: bool, max_size: Option<u64>) -> Self {
        let root = DirNode {
            id: 0,
            parent: None,
            relpath: Utf8PathBuf::new(),
            entries: IndexMap::new(),
            scanned: false,
        };
        FileTree {
            dirs: vec![root],
            files: HashMap::new(),
            size_index: HashMap::new(),
            next_dir_id: 1,
            unscanned_dirs: 1,
            fully_scanned: false,
            skip_empty,
            max_size,
        }
    }

    pub fn dir(&self, ix: DirIx) -> &DirNode {
        &self.dirs[ix.0]
    }

    pub fn file(&self, id: FileId) -> Option<&FileEntry> {
        self.files.get(&id)
    }

    pub fn file_ids(&self) -> impl Iterator<Item = FileId> + '_ {
        self.files.keys().copied()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// True once every discovered directory has been scanned, which is when
    /// the size index is complete.
    pub fn fully_scanned(&self) -> bool {
        self.fully_scanned
    }

    pub fn mark_scanned(&mut self, ix: DirIx) {
        let node = &mut self.dirs[ix.0];
        if !node.scanned {
            node.scanned = true;
            self.unscanned_dirs -= 1;
            if self.unscanned_dirs == 0 {
                self.fully_scanned = true;
            }
        }
    }

    // ------------------------------------------------------------------
    // Scan-side construction
    // ------------------------------------------------------------------

    /// Add a subdirectory entry. `id` comes from an offline store when
    /// present; otherwise the tree assigns the next free id. `scanned` is
    /// true only for directories synthesized by path operations, which have
    /// no on-disk contents to scan.
    pub fn add_dir(&mut self, parent: DirIx, name: &str, id: Option<DirId>, scanned: bool) -> DirIx {
        let id = match id {
            Some(id) => {
                self.next_dir_id = self.next_dir_id.max(id + 1);
                id
            }
            None => {
                let id = self.next_dir_id;
                self.next_dir_id += 1;
                id
            }
        };
        let relpath = self.dirs[parent.0].relpath.join(name);
        let ix = DirIx(self.dirs.len());
        self.dirs.push(DirNode {
            id,
            parent: Some(parent),
            relpath,
            entries: IndexMap::new(),
            scanned,
        });
        if !scanned {
            self.unscanned_dirs += 1;
            self.fully_scanned = false;
        }
        let prev = self.dirs[parent.0].entries.insert(name.to_string(), ItemRef::Dir(ix));
        debug_assert!(prev.is_none(), "duplicate dir entry {name}");
        ix
    }

    /// Add a file path found by a scan. The first path registers the file in
    /// the id and size indices; later paths are hard links. Returns false if
    /// the file was dropped by the skip-empty / max-size policy.
    pub fn add_scanned_file(&mut self, parent: DirIx, name: &str, id: FileId, stamp: Stamp) -> bool {
        if !self.files.contains_key(&id) {
            if self.skip_empty && stamp.size == 0 {
                tracing::debug!(path = %self.dirs[parent.0].relpath.join(name), "ignored empty file");
                return false;
            }
            if self.max_size.is_some_and(|max| stamp.size > max) {
                tracing::debug!(path = %self.dirs[parent.0].relpath.join(name), "ignored large file");
                return false;
            }
        }
        self.add_path_at(parent, name, id, stamp);
        true
    }

    pub fn add_other(&mut self, parent: DirIx, name: &str) {
        self.dirs[parent.0].entries.insert(name.to_string(), ItemRef::Other);
    }

    pub fn add_excluded(&mut self, parent: DirIx, name: &str) {
        self.dirs[parent.0].entries.insert(name.to_string(), ItemRef::Excluded);
    }

    fn add_path_at(&mut self, parent: DirIx, name: &str, id: FileId, stamp: Stamp) {
        let relpath = self.dirs[parent.0].relpath.join(name);
        if !self.files.contains_key(&id) {
            self.size_index.entry(stamp.size).or_default().push(id);
            self.files.insert(
                id,
                FileEntry {
                    id,
                    stamp,
                    paths: Vec::new(),
                },
            );
        }
        self.files.get_mut(&id).expect("just inserted").paths.push(relpath);
        self.dirs[parent.0].entries.insert(name.to_string(), ItemRef::File(id));
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    /// Resolve a relative path against already-scanned structure. Dotted and
    /// empty components are skipped. Returns None for paths through
    /// non-directories or missing entries.
    pub fn resolve(&self, relpath: &Utf8Path) -> Option<ItemRef> {
        let mut cur = ItemRef::Dir(ROOT);
        for comp in relpath.components().map(|c| c.as_str()) {
            if comp == "." || comp.is_empty() {
                continue;
            }
            let ItemRef::Dir(ix) = cur else { return None };
            cur = *self.dirs[ix.0].entries.get(comp)?;
        }
        Some(cur)
    }

    /// Directory index for a relative path, if it names a scanned-in dir.
    pub fn resolve_dir(&self, relpath: &Utf8Path) -> Option<DirIx> {
        match self.resolve(relpath)? {
            ItemRef::Dir(ix) => Some(ix),
            _ => None,
        }
    }

    /// File at a relative path, if any.
    pub fn file_at(&self, relpath: &Utf8Path) -> Option<&FileEntry> {
        match self.resolve(relpath)? {
            ItemRef::File(id) => self.files.get(&id),
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Size index
    // ------------------------------------------------------------------

    /// Files of a given size. Only complete once the tree is fully scanned.
    pub fn size_to_files(&self, size: u64) -> Vec<FileId> {
        self.size_index.get(&size).cloned().unwrap_or_default()
    }

    pub fn all_sizes(&self) -> Vec<u64> {
        self.size_index.keys().copied().collect()
    }

    // ------------------------------------------------------------------
    // Walkers
    // ------------------------------------------------------------------

    /// Every file under `top`, exactly once regardless of hard links.
    pub fn walk_files(&self, top: DirIx) -> Vec<FileId> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let mut stack = vec![top];
        while let Some(ix) = stack.pop() {
            for item in self.dirs[ix.0].entries.values() {
                match item {
                    ItemRef::File(id) => {
                        if seen.insert(*id) {
                            out.push(*id);
                        }
                    }
                    ItemRef::Dir(sub) => stack.push(*sub),
                    ItemRef::Other | ItemRef::Excluded => {}
                }
            }
        }
        out
    }

    /// Every distinct file/dir path under `top`, as (item, parent, relpath).
    /// `top` itself is never yielded. In bottom-up mode subdirectories come
    /// before their parent, which is what staged rmdir passes need.
    pub fn walk_paths(&self, top: DirIx, opts: WalkOptions) -> Vec<(ItemRef, DirIx, Utf8PathBuf)> {
        let mut out = Vec::new();
        if !opts.recurse {
            self.emit_dir_contents(top, opts, &mut out);
            return out;
        }
        if opts.top_down {
            let mut stack = vec![top];
            while let Some(ix) = stack.pop() {
                if ix != top && opts.dirs {
                    let node = &self.dirs[ix.0];
                    out.push((ItemRef::Dir(ix), node.parent.unwrap(), node.relpath.clone()));
                }
                self.emit_files(ix, opts, &mut out);
                for item in self.dirs[ix.0].entries.values() {
                    if let ItemRef::Dir(sub) = item {
                        stack.push(*sub);
                    }
                }
            }
        } else {
            let mut order = Vec::new();
            let mut stack = vec![top];
            while let Some(ix) = stack.pop() {
                order.push(ix);
                for item in self.dirs[ix.0].entries.values() {
                    if let ItemRef::Dir(sub) = item {
                        stack.push(*sub);
                    }
                }
            }
            for &ix in order.iter().rev() {
                if ix != top && opts.dirs {
                    let node = &self.dirs[ix.0];
                    out.push((ItemRef::Dir(ix), node.parent.unwrap(), node.relpath.clone()));
                }
                self.emit_files(ix, opts, &mut out);
            }
        }
        out
    }

    fn emit_dir_contents(&self, ix: DirIx, opts: WalkOptions, out: &mut Vec<(ItemRef, DirIx, Utf8PathBuf)>) {
        self.emit_files(ix, opts, out);
        if opts.dirs {
            for item in self.dirs[ix.0].entries.values() {
                if let ItemRef::Dir(sub) = item {
                    let node = &self.dirs[sub.0];
                    out.push((ItemRef::Dir(*sub), ix, node.relpath.clone()));
                }
            }
        }
    }

    fn emit_files(&self, ix: DirIx, opts: WalkOptions, out: &mut Vec<(ItemRef, DirIx, Utf8PathBuf)>) {
        if !opts.files {
            return;
        }
        let node = &self.dirs[ix.0];
        for (name, item) in &node.entries {
            if let ItemRef::File(id) = item {
                out.push((ItemRef::File(*id), ix, node.relpath.join(name)));
            }
        }
    }

    // ------------------------------------------------------------------
    // Path operations (in-memory side)
    // ------------------------------------------------------------------

    /// Add a new hard-link path to a file already in the tree. Re-linking a
    /// file whose every path was unlinked is forbidden: its stamp is gone
    /// from the indices and nothing on disk backs the link source.
    pub fn add_link(&mut self, id: FileId, to: &Utf8Path) -> Result<()> {
        let file = self
            .files
            .get(&id)
            .ok_or_else(|| TreeError::new(format!("cannot link file id {id}: not in tree")))?;
        if file.paths.is_empty() {
            return Err(TreeError::new(format!("cannot link file id {id}: no paths left")).into());
        }
        let stamp = file.stamp;
        let parent = self.create_dirs_for(parent_of(to))?;
        self.add_path_at(parent, basename_of(to)?, id, stamp);
        Ok(())
    }

    /// Unlink one path of a file. Removing the last path drops the file
    /// from the id and size indices.
    pub fn unlink_path(&mut self, id: FileId, at: &Utf8Path) -> Result<()> {
        let parent = self
            .resolve_dir(parent_of(at))
            .ok_or_else(|| TreeError::new(format!("no directory at {}", parent_of(at))))?;
        let name = basename_of(at)?;
        match self.dirs[parent.0].entries.shift_remove(name) {
            Some(ItemRef::File(found)) if found == id => {}
            _ => return Err(TreeError::new(format!("no file id {id} at {at}")).into()),
        }
        let file = self.files.get_mut(&id).expect("indexed file");
        file.paths.retain(|p| p != at);
        if file.paths.is_empty() {
            let size = file.stamp.size;
            self.files.remove(&id);
            if let Some(ids) = self.size_index.get_mut(&size) {
                ids.retain(|&f| f != id);
                if ids.is_empty() {
                    self.size_index.remove(&size);
                }
            }
        }
        Ok(())
    }

    /// Rename one of a file's paths.
    pub fn move_path(&mut self, id: FileId, from: &Utf8Path, to: &Utf8Path) -> Result<()> {
        if from == to {
            return Ok(());
        }
        let stamp = self
            .files
            .get(&id)
            .ok_or_else(|| TreeError::new(format!("cannot move file id {id}: not in tree")))?
            .stamp;
        let to_parent = self.create_dirs_for(parent_of(to))?;
        self.add_path_at(to_parent, basename_of(to)?, id, stamp);
        self.unlink_path(id, from)
    }

    /// Remove an empty, non-root directory.
    pub fn rmdir(&mut self, ix: DirIx) -> Result<()> {
        let node = &self.dirs[ix.0];
        let Some(parent) = node.parent else {
            return Err(TreeError::new("cannot remove the tree root").into());
        };
        if !node.entries.is_empty() {
            return Err(TreeError::new(format!("directory not empty: {}", node.relpath)).into());
        }
        let relpath = node.relpath.clone();
        let name = basename_of(&relpath)?.to_string();
        self.dirs[parent.0].entries.shift_remove(&name);
        // The arena slot stays allocated; nothing references it anymore.
        Ok(())
    }

    /// Directory for `relpath`, creating intermediate directories as needed.
    /// Created directories are born scanned (they have no disk contents yet).
    pub fn create_dirs_for(&mut self, relpath: &Utf8Path) -> Result<DirIx> {
        let mut cur = ROOT;
        for comp in relpath.components().map(|c| c.as_str()) {
            if comp == "." || comp.is_empty() {
                continue;
            }
            cur = match self.dirs[cur.0].entries.get(comp) {
                Some(ItemRef::Dir(ix)) => *ix,
                Some(_) => {
                    return Err(TreeError::new(format!(
                        "cannot create directory over non-directory at {relpath}"
                    ))
                    .into())
                }
                None => self.add_dir(cur, comp, None, true),
            };
        }
        Ok(cur)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct WalkOptions {
    pub recurse: bool,
    pub dirs: bool,
    pub files: bool,
    pub top_down: bool,
}

impl Default for WalkOptions {
    fn default() -> Self {
        WalkOptions {
            recurse: true,
            dirs: false,
            files: true,
            top_down: true,
        }
    }
}

pub(crate) fn parent_of(path: &Utf8Path) -> &Utf8Path {
    path.parent().unwrap_or(Utf8Path::new(""))
}

pub(crate) fn basename_of(path: &Utf8Path) -> Result<&str> {
    path.file_name()
        .ok_or_else(|| TreeError::new(format!("path has no basename: {path}")).into())
}
