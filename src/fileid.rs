//! Stable per-file serial numbers.
//!
//! Every file in a tree gets a signed 64-bit id that is the same for every
//! path to the same underlying file (hard links) and distinct between
//! different files. On filesystems with real inodes the id is the inode and
//! survives unmounts. On filesystems without stable inodes (FAT family,
//! iso9660) the id is derived from the path components between the mount
//! point and the file plus the file size, with collisions resolved by
//! increment; those ids are only stable within a run.

use std::collections::HashMap;
use std::fs;
use std::io;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};

use crate::anyhow_loc;
use crate::function_name;
use crate::hasher::{Hasher, XxHash64Hasher};

pub type FileId = i64;

/// Whether the filesystem under a path has inodes usable as persistent
/// file ids.
enum InodeSupport {
    Stable,
    None,
    Unknown(String),
}

pub trait FileIdProvider {
    /// Id for the file at `rel_path` (relative to the tree root). A
    /// pre-fetched stat record avoids a second stat call. Deterministic
    /// within one provider instance.
    fn get_id(&mut self, rel_path: &Utf8Path, meta: Option<&fs::Metadata>) -> io::Result<FileId>;

    /// True if re-rooting the tree at a deeper directory leaves ids
    /// unchanged (inodes yes, path hashes no).
    fn subdir_invariant(&self) -> bool;
}

/// Pick the provider matching the filesystem the tree root lives on.
pub fn make_id_provider(root: &Utf8Path) -> Result<Box<dyn FileIdProvider>> {
    let support = inode_support_of(root)
        .map_err(|e| anyhow_loc!("cannot probe filesystem at [{}]: {}", root, e))?;
    match support {
        InodeSupport::Stable => Ok(Box::new(InodeProvider::new(root))),
        InodeSupport::None => {
            let mount_point = mount_point_of(root)?;
            tracing::warn!(%root, "no stable inodes; using path-hash file ids");
            Ok(Box::new(PathHashProvider::new(root, &mount_point)))
        }
        InodeSupport::Unknown(fstype) => Err(anyhow_loc!(
            "no file id scheme for filesystem type [{}] at [{}]",
            fstype,
            root
        )),
    }
}

/// id = st_ino.
pub struct InodeProvider {
    root: Utf8PathBuf,
}

impl InodeProvider {
    pub fn new(root: &Utf8Path) -> Self {
        InodeProvider {
            root: root.to_owned(),
        }
    }
}

impl FileIdProvider for InodeProvider {
    fn get_id(&mut self, rel_path: &Utf8Path, meta: Option<&fs::Metadata>) -> io::Result<FileId> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            let ino = match meta {
                Some(m) => m.ino(),
                None => fs::metadata(self.root.join(rel_path).as_std_path())?.ino(),
            };
            Ok(ino as i64)
        }
        #[cfg(not(unix))]
        {
            let _ = (rel_path, meta);
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "inode file ids require a unix filesystem",
            ))
        }
    }

    fn subdir_invariant(&self) -> bool {
        true
    }
}

/// id = sum of hashes of parent path components from the mount point, plus
/// file size, wrapped to i64. Collisions bump the id and record the claimed
/// path so the same path always maps back to the same id.
pub struct PathHashProvider {
    root: Utf8PathBuf,
    mount_to_root: Utf8PathBuf,
    hasher: XxHash64Hasher,
    claimed: HashMap<FileId, Utf8PathBuf>,
}

impl PathHashProvider {
    pub fn new(root: &Utf8Path, mount_point: &Utf8Path) -> Self {
        let mount_to_root = root
            .strip_prefix(mount_point)
            .map(|p| p.to_owned())
            .unwrap_or_default();
        PathHashProvider {
            root: root.to_owned(),
            mount_to_root,
            hasher: XxHash64Hasher,
            claimed: HashMap::new(),
        }
    }
}

impl FileIdProvider for PathHashProvider {
    fn get_id(&mut self, rel_path: &Utf8Path, meta: Option<&fs::Metadata>) -> io::Result<FileId> {
        let size = match meta {
            Some(m) => m.len(),
            None => fs::metadata(self.root.join(rel_path).as_std_path())?.len(),
        };
        let path_from_mount = self.mount_to_root.join(rel_path);

        // Hash the parent components only: all links to a file share them
        // only when the links live in one directory, but size plus the
        // collision map keeps ids unique regardless.
        let mut acc: u64 = 0;
        let components: Vec<&str> = path_from_mount
            .components()
            .map(|c| c.as_str())
            .collect();
        for component in &components[..components.len().saturating_sub(1)] {
            acc = acc.wrapping_add(self.hasher.fingerprint_bytes(component.as_bytes()) as u64);
        }
        acc = acc.wrapping_add(size);

        let mut id = acc as i64;
        loop {
            match self.claimed.get(&id) {
                Some(path) if path == &path_from_mount => return Ok(id),
                Some(_) => id = id.wrapping_add(1),
                None => {
                    self.claimed.insert(id, path_from_mount);
                    return Ok(id);
                }
            }
        }
    }

    fn subdir_invariant(&self) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// Filesystem probing
// ---------------------------------------------------------------------------

#[cfg(target_os = "linux")]
fn inode_support_of(path: &Utf8Path) -> io::Result<InodeSupport> {
    use std::mem::MaybeUninit;

    let c_path = std::ffi::CString::new(path.as_str())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let mut buf = MaybeUninit::<libc::statfs>::uninit();
    let ret = unsafe { libc::statfs(c_path.as_ptr(), buf.as_mut_ptr()) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    let stat = unsafe { buf.assume_init() };

    // Filesystem magic numbers (from linux/magic.h).
    // Compare as u32: f_type is __fsword_t which is i32 on 32-bit arches
    // and i64 on 64-bit. All magic numbers fit in 32 bits, so truncating
    // from i64 is lossless, and interpreting i32 as u32 is bitwise correct.
    const EXT234_SUPER_MAGIC: u32 = 0xEF53;
    const BTRFS_SUPER_MAGIC: u32 = 0x9123683E;
    const XFS_SUPER_MAGIC: u32 = 0x58465342;
    const ZFS_SUPER_MAGIC: u32 = 0x2FC12FC1;
    const F2FS_SUPER_MAGIC: u32 = 0xF2F52010;
    const NTFS_SB_MAGIC: u32 = 0x5346544E;
    const TMPFS_MAGIC: u32 = 0x01021994;
    const OVERLAYFS_SUPER_MAGIC: u32 = 0x794C7630;
    const ECRYPTFS_SUPER_MAGIC: u32 = 0xF15F;
    // fuseblk and fuse-based filesystems (encfs, virtiofs) share this.
    const FUSE_SUPER_MAGIC: u32 = 0x65735546;
    const V9FS_MAGIC: u32 = 0x01021997;

    const MSDOS_SUPER_MAGIC: u32 = 0x4D44; // vfat, fat, msdos
    const EXFAT_SUPER_MAGIC: u32 = 0x2011BAB0;
    const ISOFS_SUPER_MAGIC: u32 = 0x9660;

    let ftype = stat.f_type as u32;
    if matches!(
        ftype,
        EXT234_SUPER_MAGIC
            | BTRFS_SUPER_MAGIC
            | XFS_SUPER_MAGIC
            | ZFS_SUPER_MAGIC
            | F2FS_SUPER_MAGIC
            | NTFS_SB_MAGIC
            | TMPFS_MAGIC
            | OVERLAYFS_SUPER_MAGIC
            | ECRYPTFS_SUPER_MAGIC
            | FUSE_SUPER_MAGIC
            | V9FS_MAGIC
    ) {
        Ok(InodeSupport::Stable)
    } else if matches!(
        ftype,
        MSDOS_SUPER_MAGIC | EXFAT_SUPER_MAGIC | ISOFS_SUPER_MAGIC
    ) {
        Ok(InodeSupport::None)
    } else {
        Ok(InodeSupport::Unknown(format!("{ftype:#x}")))
    }
}

#[cfg(target_os = "macos")]
fn inode_support_of(path: &Utf8Path) -> io::Result<InodeSupport> {
    use std::mem::MaybeUninit;

    let c_path = std::ffi::CString::new(path.as_str())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let mut buf = MaybeUninit::<libc::statfs>::uninit();
    let ret = unsafe { libc::statfs(c_path.as_ptr(), buf.as_mut_ptr()) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    let stat = unsafe { buf.assume_init() };

    // f_fstypename is a C string on macOS
    let fstypename = unsafe {
        std::ffi::CStr::from_ptr(stat.f_fstypename.as_ptr())
            .to_string_lossy()
    };

    match fstypename.as_ref() {
        "apfs" | "hfs" | "ufs" => Ok(InodeSupport::Stable),
        "msdos" | "exfat" | "cd9660" => Ok(InodeSupport::None),
        other => Ok(InodeSupport::Unknown(other.to_string())),
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn inode_support_of(_path: &Utf8Path) -> io::Result<InodeSupport> {
    // No statfs to ask on unknown platforms; assume inodes work. If this
    // is wrong, ids change across runs and cached fingerprints are merely
    // recomputed.
    Ok(InodeSupport::Stable)
}

/// Mount point of the filesystem holding `path`: walk parents until the
/// device id changes.
#[cfg(unix)]
pub fn mount_point_of(path: &Utf8Path) -> Result<Utf8PathBuf> {
    use std::os::unix::fs::MetadataExt;

    let mut cur = path
        .canonicalize_utf8()
        .map_err(|e| anyhow_loc!("cannot resolve [{}]: {}", path, e))?;
    let dev = fs::metadata(cur.as_std_path())
        .map_err(|e| anyhow_loc!("cannot stat [{}]: {}", cur, e))?
        .dev();
    loop {
        let Some(parent) = cur.parent().map(|p| p.to_owned()) else {
            return Ok(cur);
        };
        let parent_dev = fs::metadata(parent.as_std_path())
            .map_err(|e| anyhow_loc!("cannot stat [{}]: {}", parent, e))?
            .dev();
        if parent_dev != dev {
            return Ok(cur);
        }
        cur = parent;
    }
}

#[cfg(not(unix))]
pub fn mount_point_of(path: &Utf8Path) -> Result<Utf8PathBuf> {
    path.canonicalize_utf8()
        .map_err(|e| anyhow_loc!("cannot resolve [{}]: {}", path, e))
}
