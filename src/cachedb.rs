//! Persistent fingerprint cache, one SQLite file per tree.
//!
//! An online store lives inside the tree it caches (basename
//! `<prefix>NNN.db`) and holds only the `prop` table. An offline store is a
//! portable snapshot: `prop` plus the whole directory structure
//! (`dir_contents`) and per-file metadata (`metadata`), so the tree can be
//! queried with the original disk long gone.
//!
//! Concurrent use of one store by two processes is not supported: opening
//! probes an exclusive transaction with a zero busy timeout and fails fast
//! if anything else holds the file. Bulk mutations run inside explicit
//! transactions so an interrupt leaves the cache either committed or
//! untouched; between transactions locks are released, which is what lets
//! `merge_from` reference two stores through a single connection via ATTACH.

use std::collections::HashSet;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use rand::Rng;
use rusqlite::{params, Connection, OpenFlags};

use crate::error::CacheError;
use crate::filetree::Stamp;
use crate::fileid::FileId;
use crate::hasher::Fingerprint;

pub const CACHE_DB_VERSION: i64 = 1;
pub const DEFAULT_DB_PREFIX: &str = "lnsync-";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreMode {
    Online,
    Offline,
}

#[derive(Clone, Copy, Debug)]
pub struct PropRecord {
    pub fingerprint: Fingerprint,
    pub stamp: Stamp,
}

#[derive(Clone, Debug)]
pub struct DirEntryRecord {
    pub basename: String,
    pub child_id: i64,
    pub is_file: bool,
}

#[derive(Debug)]
pub struct CacheStore {
    conn: Connection,
    path: Utf8PathBuf,
    mode: StoreMode,
}

/// Find or invent the cache basename in a directory: exactly one existing
/// file matching `<prefix>[0-9]*.db` is reused, none means a fresh name with
/// a random 3-digit suffix, several is ambiguous and an error.
pub fn pick_db_basename(dir: &Utf8Path, prefix: &str) -> Result<String> {
    let prefix = prefix.strip_suffix(".db").unwrap_or(prefix);
    let mut candidates = Vec::new();
    for entry in dir.read_dir_utf8().map_err(|e| CacheError::Unavailable {
        path: dir.to_owned(),
        reason: e.to_string(),
    })? {
        let entry = entry.map_err(|e| CacheError::Unavailable {
            path: dir.to_owned(),
            reason: e.to_string(),
        })?;
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let name = entry.file_name();
        let Some(middle) = name
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_suffix(".db"))
        else {
            continue;
        };
        if middle.chars().all(|c| c.is_ascii_digit()) {
            candidates.push(name.to_string());
        }
    }
    match candidates.len() {
        1 => Ok(candidates.pop().expect("one candidate")),
        0 => {
            let suffix: u32 = rand::thread_rng().gen_range(0..1000);
            Ok(format!("{prefix}{suffix:03}.db"))
        }
        _ => Err(CacheError::Ambiguous {
            dir: dir.to_owned(),
            prefix: prefix.to_string(),
        }
        .into()),
    }
}

impl CacheStore {
    /// Open (creating if needed) the online store for a tree, given the
    /// directory holding the cache file.
    pub fn open_online(db_dir: &Utf8Path, prefix: &str) -> Result<CacheStore> {
        let basename = pick_db_basename(db_dir, prefix)?;
        Self::open_at(&db_dir.join(basename), StoreMode::Online)
    }

    /// Open an existing offline store file.
    pub fn open_offline(path: &Utf8Path) -> Result<CacheStore> {
        if !path.is_file() {
            return Err(CacheError::Unavailable {
                path: path.to_owned(),
                reason: "offline store file does not exist".into(),
            }
            .into());
        }
        Self::open_at(path, StoreMode::Offline)
    }

    /// Create a fresh offline store file. Refuses to overwrite.
    pub fn create_offline(path: &Utf8Path) -> Result<CacheStore> {
        if path.exists() {
            return Err(CacheError::Unavailable {
                path: path.to_owned(),
                reason: "output file already exists".into(),
            }
            .into());
        }
        Self::open_at(path, StoreMode::Offline)
    }

    fn open_at(path: &Utf8Path, mode: StoreMode) -> Result<CacheStore> {
        if !path.exists() {
            Self::create_empty(path, mode)?;
        }
        let version = Self::read_version(path)?;
        if version < CACHE_DB_VERSION {
            return Err(CacheError::WrongVersion {
                path: path.to_owned(),
                found: version,
                need: CACHE_DB_VERSION,
            }
            .into());
        }
        let conn = Connection::open(path.as_std_path()).map_err(|e| CacheError::Unavailable {
            path: path.to_owned(),
            reason: e.to_string(),
        })?;
        conn.busy_timeout(std::time::Duration::ZERO)?;
        // Fail fast if another process holds this store.
        conn.execute_batch("BEGIN EXCLUSIVE; COMMIT;")
            .map_err(|e| CacheError::Unavailable {
                path: path.to_owned(),
                reason: format!("locked by another process: {e}"),
            })?;
        let store = CacheStore {
            conn,
            path: path.to_owned(),
            mode,
        };
        if mode == StoreMode::Offline {
            store.check_offline_tables()?;
        }
        Ok(store)
    }

    fn create_empty(path: &Utf8Path, mode: StoreMode) -> Result<()> {
        let conn = Connection::open(path.as_std_path()).map_err(|e| CacheError::Unavailable {
            path: path.to_owned(),
            reason: format!("cannot create: {e}"),
        })?;
        conn.execute_batch(PROP_SCHEMA)?;
        if mode == StoreMode::Offline {
            conn.execute_batch(OFFLINE_SCHEMA)?;
        }
        conn.pragma_update(None, "user_version", CACHE_DB_VERSION)?;
        Ok(())
    }

    fn read_version(path: &Utf8Path) -> Result<i64> {
        let conn = Connection::open_with_flags(
            path.as_std_path(),
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| CacheError::Unavailable {
            path: path.to_owned(),
            reason: e.to_string(),
        })?;
        let version = conn
            .query_row("PRAGMA user_version;", [], |row| row.get::<_, i64>(0))
            .map_err(|e| CacheError::Corrupt {
                path: path.to_owned(),
                reason: e.to_string(),
            })?;
        Ok(version)
    }

    fn check_offline_tables(&self) -> Result<()> {
        let count: i64 = self.conn.query_row(
            "SELECT count(*) FROM sqlite_master \
             WHERE type = 'table' AND name IN ('dir_contents', 'metadata')",
            [],
            |row| row.get(0),
        )?;
        if count != 2 {
            return Err(CacheError::Corrupt {
                path: self.path.clone(),
                reason: "offline tables missing".into(),
            }
            .into());
        }
        Ok(())
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn mode(&self) -> StoreMode {
        self.mode
    }

    /// Run `body` inside one transaction; roll back if it errors.
    pub fn with_txn<T>(&mut self, body: impl FnOnce(&mut CacheStore) -> Result<T>) -> Result<T> {
        self.begin()?;
        match body(self) {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(e) => {
                self.rollback();
                Err(e)
            }
        }
    }

    pub fn begin(&mut self) -> Result<()> {
        self.conn.execute_batch("BEGIN IMMEDIATE;")?;
        Ok(())
    }

    pub fn commit(&mut self) -> Result<()> {
        self.conn.execute_batch("COMMIT;")?;
        Ok(())
    }

    pub fn rollback(&mut self) {
        let _ = self.conn.execute_batch("ROLLBACK;");
    }

    // ------------------------------------------------------------------
    // prop table
    // ------------------------------------------------------------------

    pub fn get_prop(&self, file_id: FileId) -> Result<Option<PropRecord>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT value, size, mtime, ctime FROM prop WHERE file_id = ?1")?;
        let mut rows = stmt.query(params![file_id])?;
        if let Some(row) = rows.next()? {
            let size: i64 = row.get(1)?;
            Ok(Some(PropRecord {
                fingerprint: row.get(0)?,
                stamp: Stamp {
                    size: size as u64,
                    mtime: row.get(2)?,
                    ctime: row.get(3)?,
                },
            }))
        } else {
            Ok(None)
        }
    }

    pub fn put_prop(&mut self, file_id: FileId, fingerprint: Fingerprint, stamp: Stamp) -> Result<()> {
        self.conn
            .prepare_cached(
                "INSERT OR REPLACE INTO prop (file_id, value, size, mtime, ctime) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?
            .execute(params![
                file_id,
                fingerprint,
                stamp.size as i64,
                stamp.mtime,
                stamp.ctime
            ])?;
        Ok(())
    }

    pub fn delete_ids(&mut self, file_ids: impl IntoIterator<Item = FileId>) -> Result<()> {
        let mut stmt = self.conn.prepare_cached("DELETE FROM prop WHERE file_id = ?1")?;
        for id in file_ids {
            stmt.execute(params![id])?;
        }
        Ok(())
    }

    /// Delete every prop row whose id is not in `keep`. Expensive.
    pub fn delete_ids_except(&mut self, keep: &HashSet<FileId>) -> Result<()> {
        let stale: Vec<FileId> = {
            let mut stmt = self.conn.prepare("SELECT file_id FROM prop")?;
            let ids = stmt.query_map([], |row| row.get::<_, i64>(0))?;
            let mut stale = Vec::new();
            for id in ids {
                let id = id?;
                if !keep.contains(&id) {
                    stale.push(id);
                }
            }
            stale
        };
        tracing::debug!(count = stale.len(), "pruning stale cache rows");
        self.with_txn(|store| store.delete_ids(stale))
    }

    pub fn prop_count(&self) -> Result<i64> {
        Ok(self.conn.query_row("SELECT count(*) FROM prop", [], |row| row.get(0))?)
    }

    // ------------------------------------------------------------------
    // offline tables
    // ------------------------------------------------------------------

    pub fn get_dir_entries(&self, parent_id: i64) -> Result<Vec<DirEntryRecord>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT basename, obj_id, obj_is_file FROM dir_contents WHERE parent_id = ?1",
        )?;
        let rows = stmt.query_map(params![parent_id], |row| {
            Ok(DirEntryRecord {
                basename: row.get(0)?,
                child_id: row.get(1)?,
                is_file: row.get::<_, i64>(2)? != 0,
            })
        })?;
        let mut entries = Vec::new();
        for record in rows {
            entries.push(record?);
        }
        Ok(entries)
    }

    pub fn put_dir_entry(
        &mut self,
        parent_id: i64,
        basename: &str,
        child_id: i64,
        is_file: bool,
    ) -> Result<()> {
        self.conn
            .prepare_cached(
                "INSERT INTO dir_contents (parent_id, basename, obj_id, obj_is_file) \
                 VALUES (?1, ?2, ?3, ?4)",
            )?
            .execute(params![parent_id, basename, child_id, is_file as i64])?;
        Ok(())
    }

    pub fn get_offline_metadata(&self, file_id: FileId) -> Result<Option<Stamp>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT size, mtime, ctime FROM metadata WHERE file_id = ?1")?;
        let mut rows = stmt.query(params![file_id])?;
        if let Some(row) = rows.next()? {
            let size: i64 = row.get(0)?;
            Ok(Some(Stamp {
                size: size as u64,
                mtime: row.get(1)?,
                ctime: row.get(2)?,
            }))
        } else {
            Ok(None)
        }
    }

    pub fn put_offline_metadata(&mut self, file_id: FileId, stamp: Stamp) -> Result<()> {
        self.conn
            .prepare_cached(
                "INSERT OR REPLACE INTO metadata (file_id, size, mtime, ctime) \
                 VALUES (?1, ?2, ?3, ?4)",
            )?
            .execute(params![file_id, stamp.size as i64, stamp.mtime, stamp.ctime])?;
        Ok(())
    }

    /// Drop and recreate the offline tables, keeping prop rows.
    pub fn clear_offline(&mut self) -> Result<()> {
        self.conn.execute_batch(
            "DROP TABLE IF EXISTS dir_contents; DROP TABLE IF EXISTS metadata;",
        )?;
        self.conn.execute_batch(OFFLINE_SCHEMA)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // maintenance
    // ------------------------------------------------------------------

    /// Copy prop rows out of another store file into this one, skipping ids
    /// already present and ids rejected by the filter. Both stores are
    /// referenced by this connection for the duration (ATTACH); the copy
    /// itself is one transaction. ATTACH must happen outside it.
    pub fn merge_from(
        &mut self,
        other: &Utf8Path,
        filter: impl FnMut(FileId) -> bool,
    ) -> Result<()> {
        self.conn
            .execute("ATTACH DATABASE ?1 AS source", params![other.as_str()])?;
        let merge = self.with_txn(|store| store.copy_attached_props(filter));
        let detach = self.conn.execute_batch("DETACH DATABASE source;");
        merge?;
        detach?;
        Ok(())
    }

    /// Write a complete offline snapshot into this (freshly created) store:
    /// filtered prop rows pulled from `source_db`, plus the metadata and
    /// directory rows describing the frozen tree. All rows land in a single
    /// transaction, so an interrupted freeze leaves nothing behind.
    pub fn snapshot_from(
        &mut self,
        source_db: &Utf8Path,
        filter: impl FnMut(FileId) -> bool,
        metadata: &[(FileId, Stamp)],
        dir_entries: &[(i64, String, i64, bool)],
    ) -> Result<()> {
        self.conn
            .execute("ATTACH DATABASE ?1 AS source", params![source_db.as_str()])?;
        let snapshot = self.with_txn(|store| {
            store.copy_attached_props(filter)?;
            for &(file_id, stamp) in metadata {
                store.put_offline_metadata(file_id, stamp)?;
            }
            for (parent_id, basename, child_id, is_file) in dir_entries {
                store.put_dir_entry(*parent_id, basename, *child_id, *is_file)?;
            }
            Ok(())
        });
        let detach = self.conn.execute_batch("DETACH DATABASE source;");
        snapshot?;
        detach?;
        Ok(())
    }

    fn copy_attached_props(&mut self, mut filter: impl FnMut(FileId) -> bool) -> Result<()> {
        let incoming: Vec<(i64, i64, i64, i64, i64)> = {
            let mut stmt = self.conn.prepare(
                "SELECT s.file_id, s.value, s.size, s.mtime, s.ctime FROM source.prop s \
                 WHERE s.file_id NOT IN (SELECT file_id FROM main.prop)",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
            })?;
            let mut incoming = Vec::new();
            for row in rows {
                incoming.push(row?);
            }
            incoming
        };
        let mut stmt = self.conn.prepare_cached(
            "INSERT OR IGNORE INTO main.prop (file_id, value, size, mtime, ctime) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for (file_id, value, size, mtime, ctime) in incoming {
            if filter(file_id) {
                stmt.execute(params![file_id, value, size, mtime, ctime])?;
            }
        }
        Ok(())
    }

    /// Reclaim space.
    pub fn compact(&mut self) -> Result<()> {
        self.conn.execute_batch("VACUUM;")?;
        Ok(())
    }
}

const PROP_SCHEMA: &str = "
CREATE TABLE prop (
    file_id  INT8 PRIMARY KEY,
    value    INT8,
    size     INT8,
    mtime    INT8,
    ctime    INT8);
CREATE INDEX prop_file_id_idx ON prop (file_id);
";

const OFFLINE_SCHEMA: &str = "
CREATE TABLE dir_contents (
    parent_id    INT8,
    basename     TEXT,
    obj_id       INT8,
    obj_is_file  INT,
    PRIMARY KEY (parent_id, basename));
CREATE INDEX dir_contents_idx ON dir_contents (obj_id, obj_is_file);
CREATE TABLE metadata (
    file_id INT8 PRIMARY KEY,
    size    INT8,
    mtime   INT8,
    ctime   INT8);
";

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_store(mode: StoreMode) -> (tempfile::TempDir, CacheStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().join("cache.db")).unwrap();
        let store = CacheStore::open_at(&path, mode).unwrap();
        (dir, store)
    }

    fn stamp(size: u64, mtime: i64, ctime: i64) -> Stamp {
        Stamp { size, mtime, ctime }
    }

    #[test]
    fn put_get_roundtrip() {
        let (_dir, mut store) = tmp_store(StoreMode::Online);
        store.put_prop(7, 0xAAA, stamp(10, 100, 100)).unwrap();
        let rec = store.get_prop(7).unwrap().unwrap();
        assert_eq!(rec.fingerprint, 0xAAA);
        assert_eq!(rec.stamp, stamp(10, 100, 100));
        assert!(store.get_prop(8).unwrap().is_none());
    }

    #[test]
    fn stamp_equality_ignores_ctime() {
        let (_dir, mut store) = tmp_store(StoreMode::Online);
        store.put_prop(7, 0xAAA, stamp(10, 100, 100)).unwrap();
        let rec = store.get_prop(7).unwrap().unwrap();
        assert_ne!(rec.stamp, stamp(10, 101, 100)); // mtime differs: miss
        assert_eq!(rec.stamp, stamp(10, 100, 200)); // ctime differs: hit
    }

    #[test]
    fn delete_ids_except_keeps_only_given() {
        let (_dir, mut store) = tmp_store(StoreMode::Online);
        for id in 1..=5 {
            store.put_prop(id, id * 100, stamp(1, 1, 1)).unwrap();
        }
        let keep: HashSet<i64> = [2, 4].into_iter().collect();
        store.delete_ids_except(&keep).unwrap();
        for id in 1..=5 {
            let present = store.get_prop(id).unwrap().is_some();
            assert_eq!(present, keep.contains(&id), "id {id}");
        }
    }

    #[test]
    fn upsert_overwrites() {
        let (_dir, mut store) = tmp_store(StoreMode::Online);
        store.put_prop(1, 10, stamp(5, 5, 5)).unwrap();
        store.put_prop(1, 20, stamp(6, 6, 6)).unwrap();
        let rec = store.get_prop(1).unwrap().unwrap();
        assert_eq!(rec.fingerprint, 20);
        assert_eq!(rec.stamp.size, 6);
    }

    #[test]
    fn offline_tables_roundtrip() {
        let (_dir, mut store) = tmp_store(StoreMode::Offline);
        store.put_dir_entry(0, "sub", 1, false).unwrap();
        store.put_dir_entry(0, "file.txt", 42, true).unwrap();
        store.put_offline_metadata(42, stamp(9, 8, 7)).unwrap();

        let mut entries = store.get_dir_entries(0).unwrap();
        entries.sort_by(|a, b| a.basename.cmp(&b.basename));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].basename, "file.txt");
        assert!(entries[0].is_file);
        assert_eq!(entries[1].basename, "sub");
        assert!(!entries[1].is_file);

        assert_eq!(store.get_offline_metadata(42).unwrap().unwrap(), stamp(9, 8, 7));
        assert!(store.get_offline_metadata(1).unwrap().is_none());

        store.clear_offline().unwrap();
        assert!(store.get_dir_entries(0).unwrap().is_empty());
    }

    #[test]
    fn merge_from_filters_and_skips_present() {
        let dir = tempfile::tempdir().unwrap();
        let path_a = Utf8PathBuf::try_from(dir.path().join("a.db")).unwrap();
        let path_b = Utf8PathBuf::try_from(dir.path().join("b.db")).unwrap();

        {
            let mut b = CacheStore::open_at(&path_b, StoreMode::Online).unwrap();
            b.put_prop(1, 111, stamp(1, 1, 1)).unwrap();
            b.put_prop(2, 222, stamp(2, 2, 2)).unwrap();
            b.put_prop(3, 333, stamp(3, 3, 3)).unwrap();
        }

        let mut a = CacheStore::open_at(&path_a, StoreMode::Online).unwrap();
        a.put_prop(1, 999, stamp(9, 9, 9)).unwrap();
        a.merge_from(&path_b, |id| id != 3).unwrap();

        // Existing row wins, filtered row is absent, the rest came over.
        assert_eq!(a.get_prop(1).unwrap().unwrap().fingerprint, 999);
        assert_eq!(a.get_prop(2).unwrap().unwrap().fingerprint, 222);
        assert!(a.get_prop(3).unwrap().is_none());
    }

    #[test]
    fn old_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().join("old.db")).unwrap();
        {
            let conn = Connection::open(path.as_std_path()).unwrap();
            conn.execute_batch(PROP_SCHEMA).unwrap();
            conn.pragma_update(None, "user_version", 0).unwrap();
        }
        let err = CacheStore::open_at(&path, StoreMode::Online).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CacheError>(),
            Some(CacheError::WrongVersion { .. })
        ));
    }

    #[test]
    fn pick_basename_rules() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();

        // None: a fresh name with a 3-digit suffix.
        let fresh = pick_db_basename(&root, "lnsync-").unwrap();
        assert!(fresh.starts_with("lnsync-") && fresh.ends_with(".db"));
        assert_eq!(fresh.len(), "lnsync-".len() + 3 + 3);

        // Exactly one: reused.
        std::fs::write(root.join("lnsync-042.db").as_std_path(), b"").unwrap();
        assert_eq!(pick_db_basename(&root, "lnsync-").unwrap(), "lnsync-042.db");

        // A non-digit infix never matches.
        std::fs::write(root.join("lnsync-backup.db").as_std_path(), b"").unwrap();
        assert_eq!(pick_db_basename(&root, "lnsync-").unwrap(), "lnsync-042.db");

        // More than one is ambiguous.
        std::fs::write(root.join("lnsync-7.db").as_std_path(), b"").unwrap();
        let err = pick_db_basename(&root, "lnsync-").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CacheError>(),
            Some(CacheError::Ambiguous { .. })
        ));
    }
}
