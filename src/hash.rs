//! Content digests
//!
//! The engine only needs a strong, collision-resistant digest rendered as a
//! lowercase hex string. [`ContentHasher`] is the seam; [`Sha256Hasher`] is
//! the default implementation.

use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Buffer size used when streaming content through a hasher
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// A pluggable content digest
///
/// Implementations must be deterministic and return the same string for
/// the same bytes, whether hashed from a file, a reader or a slice.
pub trait ContentHasher: Send + Sync + fmt::Debug {
    /// Short algorithm name, for logs
    fn algorithm(&self) -> &'static str;

    /// Hash everything `reader` yields
    ///
    /// Returns the hex digest and the number of bytes consumed.
    fn hash_reader(&self, reader: &mut dyn Read) -> io::Result<(String, u64)>;

    /// Hash a file's content
    fn hash_file(&self, path: &Path) -> io::Result<(String, u64)> {
        let mut file = File::open(path)?;
        self.hash_reader(&mut file)
    }

    /// Hash an in-memory buffer
    fn hash_bytes(&self, data: &[u8]) -> String {
        let mut reader = data;
        // Reading from a slice cannot fail
        self.hash_reader(&mut reader)
            .map(|(hash, _)| hash)
            .unwrap_or_default()
    }
}

/// SHA-256, hex encoded (64 characters)
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Hasher;

impl ContentHasher for Sha256Hasher {
    fn algorithm(&self) -> &'static str {
        "sha256"
    }

    fn hash_reader(&self, reader: &mut dyn Read) -> io::Result<(String, u64)> {
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
        let mut total = 0u64;

        loop {
            let bytes_read = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            hasher.update(&buffer[..bytes_read]);
            total += bytes_read as u64;
        }

        Ok((hex::encode(hasher.finalize()), total))
    }
}
