use camino::Utf8PathBuf;

#[macro_export]
macro_rules! function_name {
    () => {{
        fn f() {}
        fn type_name_of<T>(_: T) -> &'static str {
            std::any::type_name::<T>()
        }
        type_name_of(f)
            .rsplit("::")
            .find(|&part| part != "f" && part != "{{closure}}")
            .expect("Short function name")
    }};
}

#[macro_export]
macro_rules! bail_loc {
    ($msg:expr) => {
        anyhow::bail!("[{}:{} - {}] {}", file!(), function_name!(), line!(), $msg)
    };
    ($fmt:expr, $($arg:tt)*) => {
        anyhow::bail!("[{}:{} - {}] {}", file!(), function_name!(), line!(), format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! anyhow_loc {
    ($msg:expr) => {
        anyhow::anyhow!("[{}:{} - {}] {}", file!(), function_name!(), line!(), $msg)
    };
    ($fmt:expr, $($arg:tt)*) => {
        anyhow::anyhow!("[{}:{} - {}] {}", file!(), function_name!(), line!(), format!($fmt, $($arg)*))
    };
}

/// Fingerprint cache store failures.
///
/// `Unavailable`-class errors are fatal for write paths; query paths may
/// degrade and continue without the cache.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache unavailable at {path}: {reason}")]
    Unavailable { path: Utf8PathBuf, reason: String },

    #[error("cache at {path} has version {found}, need at least {need}")]
    WrongVersion {
        path: Utf8PathBuf,
        found: i64,
        need: i64,
    },

    #[error("more than one cache file matching {prefix}[0-9]*.db in {dir}")]
    Ambiguous { dir: Utf8PathBuf, prefix: String },

    #[error("cache corrupt at {path}: {reason}")]
    Corrupt { path: Utf8PathBuf, reason: String },

    /// Offline lookup found a row whose (size, mtime) stamp no longer
    /// matches the file. Online stores delete the row instead.
    #[error("stale cached value for file id {file_id}")]
    Stale { file_id: i64 },

    #[error("no cached value for file id {file_id} in offline store")]
    NotCachedOffline { file_id: i64 },
}

/// Tree lookup and structure failures: path does not exist, is not a file
/// when a file was expected, an id cannot be resolved.
#[derive(Debug, thiserror::Error)]
#[error("{msg}")]
pub struct TreeError {
    pub msg: String,
}

impl TreeError {
    pub fn new(msg: impl Into<String>) -> Self {
        TreeError { msg: msg.into() }
    }
}

/// The hasher could not read a file. Batch operations log these and
/// continue; the file stays in the tree for the caller to decide.
#[derive(Debug, thiserror::Error)]
#[error("could not fingerprint {path}: {source}")]
pub struct FingerprintError {
    pub path: Utf8PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// The move graph cannot be made acyclic for the given trees. No partial
/// plan is returned and nothing has been written back.
#[derive(Debug, thiserror::Error)]
#[error("no acyclic rename plan exists for these trees")]
pub struct PlanImpossible;

/// An on-disk rename/link/unlink/mkdir/rmdir failed. The in-memory tree is
/// consistent up to and including the failing operation; further writeback
/// must not be attempted.
#[derive(Debug, thiserror::Error)]
#[error("writeback {op} failed at {path}: {source}")]
pub struct WritebackError {
    pub op: &'static str,
    pub path: Utf8PathBuf,
    #[source]
    pub source: std::io::Error,
}
