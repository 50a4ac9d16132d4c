//! SHA-256 content hashing for downloaded artifacts.

use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use super::error::{AcquisitionError, AcquisitionResult};

/// Buffer size for reading files during checksum calculation (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// Lowercase hex SHA-256 of an in-memory buffer.
pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Returns true if `value` is a 64-character hex SHA-256 digest.
pub fn is_sha256_hex(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Calculate the SHA-256 checksum of a file.
///
/// Returns the lowercase hexadecimal digest of the file contents.
pub async fn calculate_file_checksum(path: &Path) -> AcquisitionResult<String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| AcquisitionError::ReadFailed {
            path: path.to_path_buf(),
            source: e,
        })?;

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];

    loop {
        let bytes_read = file
            .read(&mut buffer)
            .await
            .map_err(|e| AcquisitionError::ReadFailed {
                path: path.to_path_buf(),
                source: e,
            })?;

        if bytes_read == 0 {
            break;
        }

        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Verify that a file matches an expected checksum.
///
/// The comparison is case-insensitive. On success the actual digest is
/// returned so callers can record it without hashing twice.
pub async fn verify_checksum(path: &Path, expected: &str) -> AcquisitionResult<String> {
    let actual = calculate_file_checksum(path).await?;
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(AcquisitionError::ChecksumMismatch {
            filename: path
                .file_name()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string(),
            expected: expected.to_ascii_lowercase(),
            actual,
        });
    }
    Ok(actual)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const HELLO_WORLD_SHA: &str =
        "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[tokio::test]
    async fn test_calculate_file_checksum() {
        let temp = TempDir::new().unwrap();
        let file_path = temp.path().join("test.txt");
        std::fs::write(&file_path, b"hello world").unwrap();

        let checksum = calculate_file_checksum(&file_path).await.unwrap();
        assert_eq!(checksum, HELLO_WORLD_SHA);
    }

    #[tokio::test]
    async fn test_calculate_empty_file() {
        let temp = TempDir::new().unwrap();
        let file_path = temp.path().join("empty.txt");
        std::fs::write(&file_path, b"").unwrap();

        let checksum = calculate_file_checksum(&file_path).await.unwrap();
        assert_eq!(
            checksum,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[tokio::test]
    async fn test_calculate_nonexistent_file() {
        let result = calculate_file_checksum(Path::new("/nonexistent/file.txt")).await;
        assert!(matches!(result, Err(AcquisitionError::ReadFailed { .. })));
    }

    #[tokio::test]
    async fn test_file_checksum_matches_buffer_checksum_across_chunks() {
        let temp = TempDir::new().unwrap();
        let file_path = temp.path().join("large.bin");
        let data = vec![0xABu8; BUFFER_SIZE * 2 + 17];
        std::fs::write(&file_path, &data).unwrap();

        let from_file = calculate_file_checksum(&file_path).await.unwrap();
        assert_eq!(from_file, sha256_hex(&data));
    }

    #[tokio::test]
    async fn test_verify_checksum_case_insensitive() {
        let temp = TempDir::new().unwrap();
        let file_path = temp.path().join("test.txt");
        std::fs::write(&file_path, b"hello world").unwrap();

        let actual = verify_checksum(&file_path, &HELLO_WORLD_SHA.to_uppercase())
            .await
            .unwrap();
        assert_eq!(actual, HELLO_WORLD_SHA);
    }

    #[tokio::test]
    async fn test_verify_checksum_mismatch() {
        let temp = TempDir::new().unwrap();
        let file_path = temp.path().join("test.txt");
        std::fs::write(&file_path, b"hello world").unwrap();

        match verify_checksum(&file_path, "abc123").await {
            Err(AcquisitionError::ChecksumMismatch {
                filename, expected, ..
            }) => {
                assert_eq!(filename, "test.txt");
                assert_eq!(expected, "abc123");
            }
            other => panic!("Expected ChecksumMismatch error, got {:?}", other),
        }
    }

    #[test]
    fn test_is_sha256_hex() {
        assert!(is_sha256_hex(HELLO_WORLD_SHA));
        assert!(is_sha256_hex(&HELLO_WORLD_SHA.to_uppercase()));
        assert!(!is_sha256_hex("abc123"));
        assert!(!is_sha256_hex(&"g".repeat(64)));
    }
}
