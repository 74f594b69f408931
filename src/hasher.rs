//! Content fingerprinting.
//!
//! A fingerprint is a signed 64-bit value derived from file content. It is
//! opaque to every consumer: the rest of the crate only ever compares
//! fingerprints for equality. The built-in algorithm is xxHash64 with the
//! unsigned digest reinterpreted as two's-complement i64.
//!
//! Small files are hashed on the calling thread in 4 MiB blocks. Files at or
//! above 512 MiB go through a two-thread pipeline: a reader thread fills
//! 16 MiB blocks and hands them to the hashing thread over a one-slot bounded
//! channel, so the disk and the hash loop overlap without unbounded memory.

use std::fs::File;
use std::io::{self, Read};

use camino::Utf8Path;
use crossbeam::channel;

pub type Fingerprint = i64;

/// Files at or above this size are hashed with the reader/hasher pipeline.
pub const PIPELINE_SIZE_THRESHOLD: u64 = 512 * (1 << 20);
/// Block size for single-threaded hashing.
pub const SYNC_BLOCK_SIZE: usize = 4 * (1 << 20);
/// Block size for pipelined hashing.
pub const PIPELINE_BLOCK_SIZE: usize = 16 * (1 << 20);

/// Incremental hashing engine.
pub trait HashEngine: Send {
    fn reset(&mut self);
    fn update(&mut self, data: &[u8]);
    fn digest(&self) -> Fingerprint;
}

/// A pluggable file fingerprinting algorithm.
pub trait Hasher {
    /// Fingerprint a complete file on disk.
    fn fingerprint_file(&self, path: &Utf8Path) -> io::Result<Fingerprint>;

    /// One-shot fingerprint of a byte slice.
    fn fingerprint_bytes(&self, data: &[u8]) -> Fingerprint;

    /// Fresh streaming engine for this algorithm.
    fn engine(&self) -> Box<dyn HashEngine>;

    /// True if the fingerprint depends on the full content, so files of
    /// different sizes necessarily fingerprint differently. Perceptual
    /// hashers would return false, and size then gives no pre-filter.
    fn depends_on_size(&self) -> bool;
}

/// The default content hasher: streaming xxHash64.
pub struct XxHash64Hasher;

struct Xxh64Engine(xxhash_rust::xxh64::Xxh64);

impl HashEngine for Xxh64Engine {
    fn reset(&mut self) {
        self.0.reset(0);
    }

    fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    fn digest(&self) -> Fingerprint {
        self.0.digest() as i64
    }
}

impl Hasher for XxHash64Hasher {
    fn fingerprint_file(&self, path: &Utf8Path) -> io::Result<Fingerprint> {
        let file = File::open(path.as_std_path())?;
        let size = file.metadata()?.len();
        let mut engine = self.engine();
        if size >= PIPELINE_SIZE_THRESHOLD {
            hash_file_pipelined(file, engine.as_mut())?;
        } else {
            hash_file_blocks(file, engine.as_mut())?;
        }
        Ok(engine.digest())
    }

    fn fingerprint_bytes(&self, data: &[u8]) -> Fingerprint {
        xxhash_rust::xxh64::xxh64(data, 0) as i64
    }

    fn engine(&self) -> Box<dyn HashEngine> {
        Box::new(Xxh64Engine(xxhash_rust::xxh64::Xxh64::new(0)))
    }

    fn depends_on_size(&self) -> bool {
        true
    }
}

/// Single-threaded block loop.
fn hash_file_blocks(mut file: File, engine: &mut dyn HashEngine) -> io::Result<()> {
    let mut buf = vec![0u8; SYNC_BLOCK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        engine.update(&buf[..n]);
    }
    Ok(())
}

/// Reader thread + hashing thread over a one-slot bounded channel.
///
/// End-of-stream is the channel closing: the reader drops its sender at EOF
/// and the hash loop drains out. Read errors travel through the channel; if
/// the consumer bails early, dropping the receiver makes the reader's next
/// send fail and it exits, so both sides always wind down cleanly.
fn hash_file_pipelined(mut file: File, engine: &mut dyn HashEngine) -> io::Result<()> {
    let (tx, rx) = channel::bounded::<io::Result<Vec<u8>>>(1);

    std::thread::scope(|scope| {
        scope.spawn(move || loop {
            let mut buf = vec![0u8; PIPELINE_BLOCK_SIZE];
            match file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    buf.truncate(n);
                    if tx.send(Ok(buf)).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e));
                    break;
                }
            }
        });

        for block in rx {
            engine.update(&block?);
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_tmp(data: &[u8]) -> (tempfile::TempDir, camino::Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = camino::Utf8PathBuf::try_from(dir.path().join("f.bin")).unwrap();
        std::fs::File::create(&path).unwrap().write_all(data).unwrap();
        (dir, path)
    }

    #[test]
    fn file_and_bytes_agree() {
        let data = b"the quick brown fox".repeat(1000);
        let (_dir, path) = write_tmp(&data);
        let hasher = XxHash64Hasher;
        assert_eq!(
            hasher.fingerprint_file(&path).unwrap(),
            hasher.fingerprint_bytes(&data)
        );
    }

    #[test]
    fn engine_matches_oneshot() {
        let hasher = XxHash64Hasher;
        let mut engine = hasher.engine();
        engine.update(b"hello ");
        engine.update(b"world");
        assert_eq!(engine.digest(), hasher.fingerprint_bytes(b"hello world"));
    }

    #[test]
    fn engine_reset_starts_over() {
        let hasher = XxHash64Hasher;
        let mut engine = hasher.engine();
        engine.update(b"junk");
        engine.reset();
        engine.update(b"abc");
        assert_eq!(engine.digest(), hasher.fingerprint_bytes(b"abc"));
    }

    #[test]
    fn pipelined_matches_sync() {
        // Exercise the pipeline directly; a real >=512 MiB file would be
        // unreasonable in a unit test.
        let data = vec![0xA7u8; 3 * SYNC_BLOCK_SIZE + 17];
        let (_dir, path) = write_tmp(&data);
        let hasher = XxHash64Hasher;

        let mut engine = hasher.engine();
        hash_file_pipelined(File::open(path.as_std_path()).unwrap(), engine.as_mut()).unwrap();
        assert_eq!(engine.digest(), hasher.fingerprint_bytes(&data));
    }

    #[test]
    fn missing_file_errors() {
        let hasher = XxHash64Hasher;
        assert!(hasher
            .fingerprint_file(Utf8Path::new("/no/such/file"))
            .is_err());
    }
}
