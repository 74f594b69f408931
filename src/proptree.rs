//! A file tree with a persistent fingerprint for every file.
//!
//! `PropertyTree` composes the in-memory [`FileTree`] with a [`CacheStore`]
//! and a pluggable [`Hasher`]. A fingerprint request checks, in order: the
//! in-memory memo, the store row (valid only while its (size, mtime) stamp
//! matches the file), and finally the hasher. Online trees recompute and
//! write back on a miss; offline trees have no source to recompute from and
//! surface `StaleCached` / `NotCachedOffline` instead.
//!
//! The backend is an explicit sum type. Online trees scan real directories
//! and can mirror path operations back to disk; offline trees scan the
//! directory image stored in the cache file and never touch a filesystem.

use std::collections::{HashMap, HashSet};
use std::fs;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};

use crate::cachedb::{CacheStore, DirEntryRecord, DEFAULT_DB_PREFIX};
use crate::error::{CacheError, FingerprintError, TreeError, WritebackError};
use crate::filetree::{
    basename_of, parent_of, DirIx, FileEntry, FileTree, ItemRef, Stamp, WalkOptions, ROOT,
};
use crate::fileid::{make_id_provider, FileId, FileIdProvider};
use crate::glob_matcher::GlobMatcher;
use crate::hasher::{Fingerprint, Hasher};
use crate::matcher::SyncCmd;

/// Construction-time knobs. The defaults match the command-line defaults.
pub struct TreeConfig {
    pub exclude: Vec<String>,
    pub skip_empty: bool,
    pub max_size: Option<u64>,
    /// Mirror path operations to disk ("apply" mode).
    pub writeback: bool,
    pub db_prefix: String,
    /// Directory holding the online cache file, when not the tree root.
    pub db_dir: Option<Utf8PathBuf>,
}

impl Default for TreeConfig {
    fn default() -> Self {
        TreeConfig {
            exclude: Vec::new(),
            skip_empty: false,
            max_size: None,
            writeback: false,
            db_prefix: DEFAULT_DB_PREFIX.to_string(),
            db_dir: None,
        }
    }
}

pub enum Backend {
    Online {
        root: Utf8PathBuf,
        id_provider: Box<dyn FileIdProvider>,
        writeback: bool,
    },
    Offline,
}

/// One directory entry as reported by a scan source, before it is folded
/// into the tree.
enum ScannedEntry {
    File { name: String, id: FileId, stamp: Stamp },
    Dir { name: String, id: Option<i64> },
    Other { name: String },
    Excluded { name: String },
}

pub struct PropertyTree {
    tree: FileTree,
    store: CacheStore,
    backend: Backend,
    hasher: Box<dyn Hasher>,
    /// In-memory fingerprint memo, first stop for `get_fingerprint`.
    fingerprints: HashMap<FileId, Fingerprint>,
    /// Exclude matchers for directories discovered but not yet scanned.
    matchers: HashMap<DirIx, GlobMatcher>,
}

#[derive(Debug, Default)]
pub struct UpdateReport {
    pub up_to_date: usize,
    pub updated: usize,
    pub errors: Vec<(Utf8PathBuf, String)>,
}

impl PropertyTree {
    // ------------------------------------------------------------------
    // Construction
    // ------------------------------------------------------------------

    pub fn open_online(
        root: &Utf8Path,
        hasher: Box<dyn Hasher>,
        config: TreeConfig,
    ) -> Result<PropertyTree> {
        let root = root
            .canonicalize_utf8()
            .map_err(|e| TreeError::new(format!("not a usable tree root {root}: {e}")))?;
        if !root.is_dir() {
            return Err(TreeError::new(format!("tree root is not a directory: {root}")).into());
        }
        let db_dir = config.db_dir.clone().unwrap_or_else(|| root.clone());
        let store = CacheStore::open_online(&db_dir, &config.db_prefix)?;

        // Ids follow the cache location: a cache kept outside the tree keys
        // files relative to its own directory's filesystem.
        let id_provider = if db_dir == root {
            make_id_provider(&root)?
        } else {
            make_id_provider(&db_dir)?
        };

        // Never scan the cache file itself.
        let mut exclude = config.exclude.clone();
        if db_dir == root {
            exclude.push(format!("/{}", basename_of(store.path())?));
        }

        let mut this = PropertyTree {
            tree: FileTree::new(config.skip_empty, config.max_size),
            store,
            backend: Backend::Online {
                root,
                id_provider,
                writeback: config.writeback,
            },
            hasher,
            fingerprints: HashMap::new(),
            matchers: HashMap::new(),
        };
        this.install_root_matcher(&exclude)?;
        Ok(this)
    }

    pub fn open_offline(
        db_path: &Utf8Path,
        hasher: Box<dyn Hasher>,
        config: TreeConfig,
    ) -> Result<PropertyTree> {
        let store = CacheStore::open_offline(db_path)?;
        let mut this = PropertyTree {
            tree: FileTree::new(config.skip_empty, config.max_size),
            store,
            backend: Backend::Offline,
            hasher,
            fingerprints: HashMap::new(),
            matchers: HashMap::new(),
        };
        this.install_root_matcher(&config.exclude)?;
        Ok(this)
    }

    fn install_root_matcher(&mut self, patterns: &[String]) -> Result<()> {
        if !patterns.is_empty() {
            self.matchers.insert(ROOT, GlobMatcher::new(patterns)?);
        }
        Ok(())
    }

    pub fn is_online(&self) -> bool {
        matches!(self.backend, Backend::Online { .. })
    }

    pub fn root_path(&self) -> Option<&Utf8Path> {
        match &self.backend {
            Backend::Online { root, .. } => Some(root),
            Backend::Offline => None,
        }
    }

    pub fn tree(&self) -> &FileTree {
        &self.tree
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn hasher(&self) -> &dyn Hasher {
        self.hasher.as_ref()
    }

    /// Printable location: the root directory online, the store file in
    /// braces offline.
    pub fn printable_path(&self, rel: &Utf8Path) -> String {
        match &self.backend {
            Backend::Online { root, .. } => root.join(rel).to_string(),
            Backend::Offline => format!("{{{}}}{}", self.store.path(), rel),
        }
    }

    /// One representative path for error messages, with a hint when the
    /// file has more links.
    pub fn path_digest(&self, id: FileId) -> String {
        match self.tree.file(id) {
            Some(file) if file.paths.len() > 1 => {
                format!("[{}, ...]", self.printable_path(&file.paths[0]))
            }
            Some(file) => self.printable_path(&file.paths[0]),
            None => format!("<id:{id}>"),
        }
    }

    // ------------------------------------------------------------------
    // Scanning
    // ------------------------------------------------------------------

    /// Scan one directory if it has not been scanned yet.
    pub fn scan_dir(&mut self, ix: DirIx) -> Result<()> {
        if self.tree.dir(ix).was_scanned() {
            return Ok(());
        }
        let matcher = self.matchers.remove(&ix);
        let relpath = self.tree.dir(ix).relpath.clone();
        tracing::trace!(dir = %relpath, "scanning");
        let entries = match &mut self.backend {
            Backend::Online {
                root, id_provider, ..
            } => scan_disk_dir(root, &relpath, matcher.as_ref(), id_provider.as_mut())?,
            Backend::Offline => {
                scan_store_dir(&self.store, self.tree.dir(ix).id, matcher.as_ref())?
            }
        };
        for entry in entries {
            match entry {
                ScannedEntry::File { name, id, stamp } => {
                    self.tree.add_scanned_file(ix, &name, id, stamp);
                }
                ScannedEntry::Dir { name, id } => {
                    let sub = self.tree.add_dir(ix, &name, id, false);
                    if let Some(m) = matcher.as_ref().and_then(|m| m.descend(&name)) {
                        self.matchers.insert(sub, m);
                    }
                }
                ScannedEntry::Other { name } => self.tree.add_other(ix, &name),
                ScannedEntry::Excluded { name } => self.tree.add_excluded(ix, &name),
            }
        }
        self.tree.mark_scanned(ix);
        Ok(())
    }

    /// Recursively scan everything under `start`.
    pub fn scan_subtree(&mut self, start: DirIx) -> Result<()> {
        let mut stack = vec![start];
        while let Some(ix) = stack.pop() {
            self.scan_dir(ix)?;
            for item in self.tree.dir(ix).entries.values() {
                if let ItemRef::Dir(sub) = item {
                    stack.push(*sub);
                }
            }
        }
        Ok(())
    }

    fn ensure_fully_scanned(&mut self) -> Result<()> {
        if !self.tree.fully_scanned() {
            self.scan_subtree(ROOT)?;
        }
        Ok(())
    }

    /// Item at a relative path, scanning directories along the way.
    pub fn path_to_item(&mut self, relpath: &Utf8Path) -> Result<Option<ItemRef>> {
        let mut cur = ROOT;
        let comps: Vec<&str> = relpath
            .components()
            .map(|c| c.as_str())
            .filter(|c| *c != "." && !c.is_empty())
            .collect();
        if comps.is_empty() {
            return Ok(Some(ItemRef::Dir(ROOT)));
        }
        for (i, comp) in comps.iter().enumerate() {
            self.scan_dir(cur)?;
            match self.tree.dir(cur).entries.get(*comp) {
                None => return Ok(None),
                Some(ItemRef::Dir(sub)) => {
                    if i + 1 == comps.len() {
                        return Ok(Some(ItemRef::Dir(*sub)));
                    }
                    cur = *sub;
                }
                Some(item) => {
                    if i + 1 == comps.len() {
                        return Ok(Some(*item));
                    }
                    return Ok(None);
                }
            }
        }
        unreachable!("loop returns on last component");
    }

    /// File at a relative path, scanning as needed.
    pub fn file_at(&mut self, relpath: &Utf8Path) -> Result<Option<FileId>> {
        match self.path_to_item(relpath)? {
            Some(ItemRef::File(id)) => Ok(Some(id)),
            _ => Ok(None),
        }
    }

    // ------------------------------------------------------------------
    // Size and walk queries (full scan on demand)
    // ------------------------------------------------------------------

    pub fn all_sizes(&mut self) -> Result<Vec<u64>> {
        self.ensure_fully_scanned()?;
        Ok(self.tree.all_sizes())
    }

    pub fn size_to_files(&mut self, size: u64) -> Result<Vec<FileId>> {
        self.ensure_fully_scanned()?;
        Ok(self.tree.size_to_files(size))
    }

    /// Files of a given size, or every file when `size` is None (the case
    /// for hashers whose value does not determine size).
    pub fn files_of_size(&mut self, size: Option<u64>) -> Result<Vec<FileId>> {
        match size {
            Some(s) => self.size_to_files(s),
            None => self.walk_files(),
        }
    }

    pub fn walk_files(&mut self) -> Result<Vec<FileId>> {
        self.ensure_fully_scanned()?;
        Ok(self.tree.walk_files(ROOT))
    }

    pub fn file_count(&mut self) -> Result<usize> {
        self.ensure_fully_scanned()?;
        Ok(self.tree.file_count())
    }

    // ------------------------------------------------------------------
    // Fingerprints
    // ------------------------------------------------------------------

    /// Fingerprint of a file: memory, then a stamp-checked store row, then
    /// (online) a fresh computation written back to the store.
    pub fn get_fingerprint(&mut self, id: FileId) -> Result<Fingerprint> {
        if let Some(fp) = self.fingerprints.get(&id) {
            return Ok(*fp);
        }
        let stamp = self.file_ref(id)?.stamp;
        match self.store.get_prop(id)? {
            Some(rec) if rec.stamp == stamp => {
                self.fingerprints.insert(id, rec.fingerprint);
                return Ok(rec.fingerprint);
            }
            Some(rec) => {
                tracing::debug!(
                    file_id = id,
                    stored = %rec.stamp,
                    current = %stamp,
                    "stamp changed since caching"
                );
                if self.is_online() {
                    self.store.delete_ids([id])?;
                } else {
                    return Err(CacheError::Stale { file_id: id }.into());
                }
            }
            None => {
                if !self.is_online() {
                    return Err(CacheError::NotCachedOffline { file_id: id }.into());
                }
            }
        }
        let fp = self.fingerprint_from_source(id)?;
        if let Err(e) = self.store.put_prop(id, fp, stamp) {
            tracing::error!(file_id = id, path = %self.path_digest(id), "cannot save fingerprint: {e}");
        }
        self.fingerprints.insert(id, fp);
        Ok(fp)
    }

    /// Recompute from source and compare with the cached value. The cache
    /// is not updated, even on mismatch.
    pub fn recheck_fingerprint(&mut self, id: FileId) -> Result<bool> {
        let stamp = self.file_ref(id)?.stamp;
        let cached = match self.store.get_prop(id)? {
            Some(rec) if rec.stamp == stamp => rec.fingerprint,
            Some(_) => return Err(CacheError::Stale { file_id: id }.into()),
            None => return Err(CacheError::NotCachedOffline { file_id: id }.into()),
        };
        let live = self.fingerprint_from_source(id)?;
        Ok(cached == live)
    }

    fn fingerprint_from_source(&mut self, id: FileId) -> Result<Fingerprint> {
        let Backend::Online { root, .. } = &self.backend else {
            return Err(CacheError::NotCachedOffline { file_id: id }.into());
        };
        let relpath = self.file_ref(id)?.paths[0].clone();
        let abspath = root.join(&relpath);
        self.hasher.fingerprint_file(&abspath).map_err(|source| {
            FingerprintError {
                path: abspath,
                source,
            }
            .into()
        })
    }

    fn file_ref(&self, id: FileId) -> Result<&FileEntry> {
        self.tree
            .file(id)
            .ok_or_else(|| TreeError::new(format!("no file with id {id} in tree")).into())
    }

    /// Bring the whole cache up to date: scan everything, find files whose
    /// stored stamp is missing or stale, recompute them. Fingerprint
    /// failures are collected, not fatal; everything is committed at the
    /// end in one transaction.
    pub fn bulk_update(&mut self) -> Result<UpdateReport> {
        self.ensure_fully_scanned()?;
        let mut report = UpdateReport::default();
        let mut pending: Vec<FileId> = Vec::new();
        let mut broken: Vec<FileId> = Vec::new();

        for id in self.tree.walk_files(ROOT) {
            let stamp = self.file_ref(id)?.stamp;
            match self.store.get_prop(id) {
                Ok(Some(rec)) if rec.stamp == stamp => report.up_to_date += 1,
                Ok(Some(_)) => {
                    self.store.delete_ids([id])?;
                    pending.push(id);
                }
                Ok(None) => pending.push(id),
                Err(e) => {
                    tracing::error!(file_id = id, "cache lookup failed: {e}");
                    report
                        .errors
                        .push((self.first_path(id), e.to_string()));
                    broken.push(id);
                }
            }
        }
        // Files the cache cannot even be asked about are dropped from the
        // tree so later passes skip them.
        for id in broken {
            self.remove_file(id);
        }

        self.store.begin()?;
        let total = pending.len();
        for (index, id) in pending.into_iter().enumerate() {
            tracing::debug!("updating {}/{total}", index + 1);
            match self.get_fingerprint(id) {
                Ok(_) => report.updated += 1,
                Err(e) => {
                    tracing::error!(path = %self.path_digest(id), "computing fingerprint: {e}");
                    report.errors.push((self.first_path(id), e.to_string()));
                }
            }
        }
        self.store.commit()?;
        Ok(report)
    }

    fn first_path(&self, id: FileId) -> Utf8PathBuf {
        self.tree
            .file(id)
            .and_then(|f| f.paths.first().cloned())
            .unwrap_or_default()
    }

    fn remove_file(&mut self, id: FileId) {
        let paths = match self.tree.file(id) {
            Some(f) => f.paths.clone(),
            None => return,
        };
        for path in paths {
            let _ = self.tree.unlink_path(id, &path);
        }
        self.fingerprints.remove(&id);
    }

    /// Delete cache rows for ids no longer present in the tree.
    pub fn purge_stale(&mut self) -> Result<()> {
        self.ensure_fully_scanned()?;
        let keep: HashSet<FileId> = self.tree.file_ids().collect();
        self.store.delete_ids_except(&keep)?;
        Ok(())
    }

    /// Write a portable offline snapshot of this tree into a fresh store
    /// file: fingerprints, per-file metadata, and the directory structure,
    /// all in a single transaction.
    pub fn freeze_offline(
        &mut self,
        target_path: &Utf8Path,
        filter: Option<&dyn Fn(FileId) -> bool>,
    ) -> Result<()> {
        self.ensure_fully_scanned()?;

        let live: HashSet<FileId> = self.tree.file_ids().collect();
        let keep = |id: FileId| live.contains(&id) && filter.map_or(true, |f| f(id));

        let mut metadata: Vec<(FileId, Stamp)> = Vec::new();
        for id in self.tree.file_ids() {
            if keep(id) {
                metadata.push((id, self.tree.file(id).expect("live id").stamp));
            }
        }

        let mut dir_entries: Vec<(i64, String, i64, bool)> = Vec::new();
        let walk = self.tree.walk_paths(
            ROOT,
            WalkOptions {
                recurse: true,
                dirs: true,
                files: true,
                top_down: true,
            },
        );
        for (item, parent, relpath) in walk {
            let parent_id = self.tree.dir(parent).id;
            let name = basename_of(&relpath)?.to_string();
            match item {
                ItemRef::File(id) if keep(id) => dir_entries.push((parent_id, name, id, true)),
                ItemRef::File(_) => {}
                ItemRef::Dir(ix) => {
                    dir_entries.push((parent_id, name, self.tree.dir(ix).id, false))
                }
                ItemRef::Other | ItemRef::Excluded => {}
            }
        }

        let mut target = CacheStore::create_offline(target_path)?;
        target.snapshot_from(self.store.path(), keep, &metadata, &dir_entries)?;
        tracing::info!(target = %target_path, files = metadata.len(), "offline snapshot written");
        Ok(())
    }

    /// Compact the cache file.
    pub fn compact_store(&mut self) -> Result<()> {
        self.store.compact()
    }

    /// Drop the offline tables from the store, keeping fingerprints.
    pub fn clear_offline_tables(&mut self) -> Result<()> {
        self.store.clear_offline()
    }

    // ------------------------------------------------------------------
    // Writeback path operations
    // ------------------------------------------------------------------

    /// Execute one planner command against this (online) tree: in-memory
    /// first, then mirrored to disk when writeback is on. A disk failure is
    /// surfaced as `WritebackError` without rolling back the in-memory
    /// side; the caller must stop issuing commands.
    pub fn exec_cmd(&mut self, cmd: &SyncCmd) -> Result<()> {
        match cmd {
            SyncCmd::Mv { from, to } => {
                let id = self.expect_file_at(from)?;
                if self.path_to_item(to)?.is_some() {
                    return Err(TreeError::new(format!("mv destination occupied: {to}")).into());
                }
                self.tree.move_path(id, from, to)?;
                self.mirror(|root| {
                    mkdir_all(root, parent_of(to))?;
                    fs::rename(root.join(from).as_std_path(), root.join(to).as_std_path())
                        .map_err(|e| wb("rename", to, e))
                })?;
            }
            SyncCmd::Ln { existing, new } => {
                let id = self.expect_file_at(existing)?;
                if self.path_to_item(new)?.is_some() {
                    return Err(TreeError::new(format!("ln destination occupied: {new}")).into());
                }
                self.tree.add_link(id, new)?;
                self.mirror(|root| {
                    mkdir_all(root, parent_of(new))?;
                    fs::hard_link(
                        root.join(existing).as_std_path(),
                        root.join(new).as_std_path(),
                    )
                    .map_err(|e| wb("link", new, e))
                })?;
            }
            SyncCmd::Rm { path, witness: _ } => {
                let id = self.expect_file_at(path)?;
                // Unlinking a file's last path would destroy content; the
                // planner never asks for it and the executor refuses it.
                if self.file_ref(id)?.paths.len() < 2 {
                    return Err(TreeError::new(format!(
                        "refusing to unlink the last path of a file: {path}"
                    ))
                    .into());
                }
                self.tree.unlink_path(id, path)?;
                self.fingerprint_forget_if_gone(id);
                self.mirror(|root| {
                    fs::remove_file(root.join(path).as_std_path()).map_err(|e| wb("unlink", path, e))
                })?;
            }
        }
        Ok(())
    }

    pub fn exec_cmds<'a>(&mut self, cmds: impl IntoIterator<Item = &'a SyncCmd>) -> Result<()> {
        for cmd in cmds {
            self.exec_cmd(cmd)?;
        }
        Ok(())
    }

    /// Undo one command: mv swaps its arguments, ln is undone by rm with
    /// the link source as witness, rm is undone by linking back from its
    /// witness path.
    pub fn exec_cmd_reverse(&mut self, cmd: &SyncCmd) -> Result<()> {
        let reverse = match cmd {
            SyncCmd::Mv { from, to } => SyncCmd::Mv {
                from: to.clone(),
                to: from.clone(),
            },
            SyncCmd::Ln { existing, new } => SyncCmd::Rm {
                path: new.clone(),
                witness: existing.clone(),
            },
            SyncCmd::Rm { path, witness } => {
                if self.file_at(witness)?.is_none() {
                    return Err(TreeError::new(format!(
                        "cannot undo rm: witness {witness} is gone"
                    ))
                    .into());
                }
                SyncCmd::Ln {
                    existing: witness.clone(),
                    new: path.clone(),
                }
            }
        };
        self.exec_cmd(&reverse)
    }

    pub fn exec_cmds_reverse<'a>(
        &mut self,
        cmds: impl DoubleEndedIterator<Item = &'a SyncCmd>,
    ) -> Result<()> {
        for cmd in cmds.rev() {
            self.exec_cmd_reverse(cmd)?;
        }
        Ok(())
    }

    /// Remove an empty directory, mirrored to disk in writeback mode.
    pub fn rmdir(&mut self, relpath: &Utf8Path) -> Result<()> {
        let Some(ItemRef::Dir(ix)) = self.path_to_item(relpath)? else {
            return Err(TreeError::new(format!("not a directory: {relpath}")).into());
        };
        self.scan_dir(ix)?;
        self.tree.rmdir(ix)?;
        self.mirror(|root| {
            fs::remove_dir(root.join(relpath).as_std_path()).map_err(|e| wb("rmdir", relpath, e))
        })?;
        Ok(())
    }

    fn expect_file_at(&mut self, relpath: &Utf8Path) -> Result<FileId> {
        self.file_at(relpath)?
            .ok_or_else(|| TreeError::new(format!("expected a file at {relpath}")).into())
    }

    fn fingerprint_forget_if_gone(&mut self, id: FileId) {
        if self.tree.file(id).is_none() {
            self.fingerprints.remove(&id);
        }
    }

    fn mirror(&self, op: impl FnOnce(&Utf8Path) -> Result<()>) -> Result<()> {
        match &self.backend {
            Backend::Online {
                root,
                writeback: true,
                ..
            } => op(root),
            _ => Ok(()),
        }
    }
}

fn wb(op: &'static str, path: &Utf8Path, source: std::io::Error) -> anyhow::Error {
    WritebackError {
        op,
        path: path.to_owned(),
        source,
    }
    .into()
}

fn mkdir_all(root: &Utf8Path, rel: &Utf8Path) -> Result<()> {
    if rel.as_str().is_empty() {
        return Ok(());
    }
    fs::create_dir_all(root.join(rel).as_std_path()).map_err(|e| wb("mkdir", rel, e))
}

// ----------------------------------------------------------------------
// Scan sources
// ----------------------------------------------------------------------

/// Enumerate one on-disk directory. Symlinks are classified before
/// anything else and never followed; unreadable files and non-rx
/// directories become Other, exactly like special files.
fn scan_disk_dir(
    root: &Utf8Path,
    dir_relpath: &Utf8Path,
    matcher: Option<&GlobMatcher>,
    id_provider: &mut dyn FileIdProvider,
) -> Result<Vec<ScannedEntry>> {
    let abs_dir = root.join(dir_relpath);
    let mut out = Vec::new();
    let read = fs::read_dir(abs_dir.as_std_path())
        .map_err(|e| TreeError::new(format!("cannot read directory {abs_dir}: {e}")))?;
    for entry in read {
        let entry = entry.map_err(|e| TreeError::new(format!("readdir {abs_dir}: {e}")))?;
        let os_name = entry.file_name();
        let Some(name) = os_name.to_str().map(str::to_string) else {
            tracing::warn!(dir = %abs_dir, "ignored non-UTF-8 entry");
            out.push(ScannedEntry::Other {
                name: os_name.to_string_lossy().into_owned(),
            });
            continue;
        };
        let abspath = abs_dir.join(&name);
        let excluded_as_file = matcher.is_some_and(|m| m.exclude_file(&name));

        let meta = match fs::symlink_metadata(abspath.as_std_path()) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(path = %abspath, "ignored unstattable entry: {e}");
                out.push(ScannedEntry::Other { name });
                continue;
            }
        };

        if meta.is_symlink() {
            if excluded_as_file {
                tracing::debug!(path = %abspath, "excluded symlink");
                out.push(ScannedEntry::Excluded { name });
            } else {
                tracing::debug!(path = %abspath, "ignored symlink");
                out.push(ScannedEntry::Other { name });
            }
        } else if meta.is_file() {
            if excluded_as_file {
                tracing::debug!(path = %abspath, "excluded file");
                out.push(ScannedEntry::Excluded { name });
            } else if !access_ok(&abspath, libc::R_OK) {
                tracing::debug!(path = %abspath, "ignored no-read-access file");
                out.push(ScannedEntry::Other { name });
            } else {
                let relpath = dir_relpath.join(&name);
                let stamp = stamp_of(&meta);
                let id = id_provider
                    .get_id(&relpath, Some(&meta))
                    .map_err(|e| TreeError::new(format!("file id for {relpath}: {e}")))?;
                out.push(ScannedEntry::File { name, id, stamp });
            }
        } else if meta.is_dir() {
            if matcher.is_some_and(|m| m.exclude_dir(&name)) {
                tracing::debug!(path = %abspath, "excluded dir");
                out.push(ScannedEntry::Excluded { name });
            } else if !access_ok(&abspath, libc::R_OK | libc::X_OK) {
                tracing::debug!(path = %abspath, "ignored no-rx-access dir");
                out.push(ScannedEntry::Other { name });
            } else {
                out.push(ScannedEntry::Dir { name, id: None });
            }
        } else {
            if excluded_as_file {
                tracing::debug!(path = %abspath, "excluded special file");
                out.push(ScannedEntry::Excluded { name });
            } else {
                tracing::debug!(path = %abspath, "ignored special file");
                out.push(ScannedEntry::Other { name });
            }
        }
    }
    Ok(out)
}

/// Enumerate one directory out of the offline store image.
fn scan_store_dir(
    store: &CacheStore,
    dir_id: i64,
    matcher: Option<&GlobMatcher>,
) -> Result<Vec<ScannedEntry>> {
    let mut out = Vec::new();
    for DirEntryRecord {
        basename,
        child_id,
        is_file,
    } in store.get_dir_entries(dir_id)?
    {
        if is_file {
            if matcher.is_some_and(|m| m.exclude_file(&basename)) {
                tracing::info!(name = %basename, "excluded file");
                out.push(ScannedEntry::Excluded { name: basename });
                continue;
            }
            let stamp = store.get_offline_metadata(child_id)?.ok_or_else(|| {
                CacheError::Corrupt {
                    path: store.path().to_owned(),
                    reason: format!("no metadata row for file id {child_id}"),
                }
            })?;
            out.push(ScannedEntry::File {
                name: basename,
                id: child_id,
                stamp,
            });
        } else if matcher.is_some_and(|m| m.exclude_dir(&basename)) {
            tracing::info!(name = %basename, "excluded dir");
            out.push(ScannedEntry::Excluded { name: basename });
        } else {
            out.push(ScannedEntry::Dir {
                name: basename,
                id: Some(child_id),
            });
        }
    }
    Ok(out)
}

fn stamp_of(meta: &fs::Metadata) -> Stamp {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        Stamp {
            size: meta.len(),
            mtime: meta.mtime(),
            ctime: meta.ctime(),
        }
    }
    #[cfg(not(unix))]
    {
        use std::time::UNIX_EPOCH;
        let secs = |t: std::io::Result<std::time::SystemTime>| {
            t.ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0)
        };
        Stamp {
            size: meta.len(),
            mtime: secs(meta.modified()),
            ctime: 0,
        }
    }
}

#[cfg(unix)]
fn access_ok(path: &Utf8Path, mode: libc::c_int) -> bool {
    let Ok(cpath) = std::ffi::CString::new(path.as_str()) else {
        return false;
    };
    unsafe { libc::access(cpath.as_ptr(), mode) == 0 }
}

#[cfg(not(unix))]
fn access_ok(_path: &Utf8Path, _mode: i32) -> bool {
    true
}
