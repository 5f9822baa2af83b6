// src/core/cache.rs

use anyhow::{Context, Result};
use log::debug;
use std::{fs, path::Path, time::SystemTime};

const HASH_TRUNCATE_LENGTH: usize = 16; // 16 bytes = 32 hex characters

/// Truncated blake3 hash of `bytes`, hex-encoded.
pub fn content_hash(bytes: &[u8]) -> String {
    let hash = blake3::hash(bytes);
    hex::encode(hash.as_bytes().get(..HASH_TRUNCATE_LENGTH).unwrap_or_default())
}

/// Incremental hasher for the composed hash of an environment.
#[derive(Debug, Default)]
pub struct ComposedHasher {
    hasher: blake3::Hasher,
}

impl ComposedHasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one labeled part. Labels keep `("ab", "c")` and `("a", "bc")` apart.
    pub fn update(&mut self, label: &str, bytes: &[u8]) -> &mut Self {
        self.hasher.update(label.as_bytes());
        self.hasher.update(&(bytes.len() as u64).to_le_bytes());
        self.hasher.update(bytes);
        self
    }

    pub fn finish(&self) -> String {
        let hash = self.hasher.finalize();
        hex::encode(hash.as_bytes().get(..HASH_TRUNCATE_LENGTH).unwrap_or_default())
    }
}

/// The validation metadata of a watched file.
/// Events whose file still has the same data are dropped as spurious.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFingerprint {
    pub timestamp: SystemTime,
    pub file_size: u64,
    pub content_hash: String,
}

impl FileFingerprint {
    /// Same size and content; timestamps alone do not count as a change.
    pub fn same_content(&self, other: &Self) -> bool {
        self.file_size == other.file_size && self.content_hash == other.content_hash
    }
}

/// Calculates the fingerprint for a given file path.
///
/// # Errors
/// Returns an I/O error if the file cannot be read or its metadata cannot be accessed.
pub fn calculate_fingerprint(path: &Path) -> Result<FileFingerprint> {
    let metadata = fs::metadata(path)
        .with_context(|| format!("Failed to read metadata for file '{}'", path.display()))?;
    let timestamp = metadata.modified()?;
    let file_size = metadata.len();

    let content = fs::read(path)
        .with_context(|| format!("Failed to read content of file '{}'", path.display()))?;
    let content_hash = content_hash(&content);

    debug!(
        "Fingerprint for '{}': size={}, hash={}",
        path.display(),
        file_size,
        content_hash
    );

    Ok(FileFingerprint {
        timestamp,
        file_size,
        content_hash,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_calculate_fingerprint_success() {
        // --- Setup ---
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"hello world").unwrap();
        temp_file.flush().unwrap();

        // --- Execute ---
        let data = calculate_fingerprint(temp_file.path()).unwrap();

        // --- Assert ---
        assert_eq!(data.file_size, 11);
        // blake3("hello world"), truncated to 16 bytes.
        assert_eq!(data.content_hash, "d74981efa70a0c880b8d8c1985d075db");

        let difference = SystemTime::now().duration_since(data.timestamp).unwrap();
        assert!(difference.as_secs() < 5);
    }

    #[test]
    fn test_calculate_fingerprint_file_not_found() {
        let result = calculate_fingerprint(Path::new("non_existent_file_for_test.tmp"));
        assert!(result.is_err());
    }

    #[test]
    fn test_composed_hash_is_label_sensitive() {
        let a = ComposedHasher::new().update("x", b"ab").update("y", b"c").finish();
        let b = ComposedHasher::new().update("x", b"a").update("y", b"bc").finish();
        assert_ne!(a, b);
        let again = ComposedHasher::new().update("x", b"ab").update("y", b"c").finish();
        assert_eq!(a, again);
    }

    #[test]
    fn test_same_content_ignores_timestamp() {
        let a = FileFingerprint {
            timestamp: SystemTime::UNIX_EPOCH,
            file_size: 1,
            content_hash: "aa".to_string(),
        };
        let b = FileFingerprint {
            timestamp: SystemTime::now(),
            ..a.clone()
        };
        assert!(a.same_content(&b));
    }
}
