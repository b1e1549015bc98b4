use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{HubError, HubResult};

/// SHA-256 hex digest of a file, read in 1 MiB chunks so multi-gigabyte
/// shards never sit in memory at once.
pub fn sha256_file(path: &Path) -> HubResult<String> {
    let mut reader = BufReader::new(File::open(path).map_err(HubError::Io)?);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1 << 20];
    loop {
        let n = reader.read(&mut buf).map_err(HubError::Io)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Check `path` against an expected hex digest (case-insensitive).
pub fn verify_integrity(path: &Path, expected_sha256: &str) -> HubResult<()> {
    let actual = sha256_file(path)?;
    debug!(path = %path.display(), expected = expected_sha256, actual = %actual, "Verifying file integrity");
    if actual.eq_ignore_ascii_case(expected_sha256) {
        Ok(())
    } else {
        Err(HubError::IntegrityMismatch {
            file: path.to_string_lossy().to_string(),
            expected: expected_sha256.to_string(),
            actual,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const HELLO_SHA: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    fn write(dir: &TempDir, contents: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join("blob");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_sha256_known_value() {
        let dir = TempDir::new().unwrap();
        assert_eq!(sha256_file(&write(&dir, b"hello")).unwrap(), HELLO_SHA);
    }

    #[test]
    fn test_sha256_empty_file() {
        let dir = TempDir::new().unwrap();
        assert_eq!(
            sha256_file(&write(&dir, b"")).unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_verify_integrity_case_insensitive() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, b"hello");
        assert!(verify_integrity(&path, HELLO_SHA).is_ok());
        assert!(verify_integrity(&path, &HELLO_SHA.to_uppercase()).is_ok());
    }

    #[test]
    fn test_verify_integrity_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, b"hello");
        let result = verify_integrity(&path, &"0".repeat(64));
        assert!(matches!(result, Err(HubError::IntegrityMismatch { .. })));
    }
}
