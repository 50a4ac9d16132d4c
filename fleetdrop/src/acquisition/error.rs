//! Error types for payload acquisition.

use std::io;
use std::path::PathBuf;

/// Result type for acquisition operations.
pub type AcquisitionResult<T> = Result<T, AcquisitionError>;

/// Errors that can occur while fetching, verifying or publishing a payload.
///
/// None of these escape a refresh cycle: the engine logs them and treats the
/// cycle as "no change".
#[derive(Debug)]
pub enum AcquisitionError {
    /// Failed to read a file or directory.
    ReadFailed { path: PathBuf, source: io::Error },

    /// Failed to write a file or directory.
    WriteFailed { path: PathBuf, source: io::Error },

    /// Failed to create a directory.
    CreateDirFailed { path: PathBuf, source: io::Error },

    /// The URL could not be parsed.
    InvalidUrl(String),

    /// Transport-level failure (connect, TLS, body read).
    Network { url: String, reason: String },

    /// Connecting or reading stalled for longer than the fetcher timeout.
    Timeout { url: String, timeout_secs: u64 },

    /// Redirect chain exceeded the hop limit.
    TooManyRedirects { url: String, max_redirects: usize },

    /// Server answered with a non-2xx, non-redirect status.
    HttpStatus { url: String, status: u16 },

    /// Downloaded bytes do not match the declared hash.
    ChecksumMismatch {
        filename: String,
        expected: String,
        actual: String,
    },

    /// The remote declared a hash that is not a SHA-256 hex digest.
    MalformedChecksum { source_name: String, value: String },

    /// Remote config document or persisted state could not be parsed.
    ConfigParse { source_name: String, reason: String },
}

impl AcquisitionError {
    /// Returns true for failures that the next scheduled cycle may resolve.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            Self::Network { .. }
                | Self::Timeout { .. }
                | Self::TooManyRedirects { .. }
                | Self::HttpStatus { .. }
        )
    }

    /// Returns true when the downloaded artifact failed verification.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            Self::ChecksumMismatch { .. } | Self::MalformedChecksum { .. }
        )
    }
}

impl std::fmt::Display for AcquisitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed { path, source } => {
                write!(f, "failed to read {}: {}", path.display(), source)
            }
            Self::WriteFailed { path, source } => {
                write!(f, "failed to write {}: {}", path.display(), source)
            }
            Self::CreateDirFailed { path, source } => {
                write!(
                    f,
                    "failed to create directory {}: {}",
                    path.display(),
                    source
                )
            }
            Self::InvalidUrl(url) => write!(f, "invalid URL: {}", url),
            Self::Network { url, reason } => {
                write!(f, "request to {} failed: {}", url, reason)
            }
            Self::Timeout { url, timeout_secs } => {
                write!(f, "request to {} stalled for {}s", url, timeout_secs)
            }
            Self::TooManyRedirects { url, max_redirects } => {
                write!(
                    f,
                    "too many redirects for {} (limit {})",
                    url, max_redirects
                )
            }
            Self::HttpStatus { url, status } => write!(f, "HTTP {} from {}", status, url),
            Self::ChecksumMismatch {
                filename,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "checksum mismatch for {}: expected {}, got {}",
                    filename, expected, actual
                )
            }
            Self::MalformedChecksum { source_name, value } => {
                write!(
                    f,
                    "{} declares an invalid sha256 '{}'; refusing unverifiable download",
                    source_name, value
                )
            }
            Self::ConfigParse {
                source_name,
                reason,
            } => {
                write!(f, "failed to parse {}: {}", source_name, reason)
            }
        }
    }
}

impl std::error::Error for AcquisitionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ReadFailed { source, .. } => Some(source),
            Self::WriteFailed { source, .. } => Some(source),
            Self::CreateDirFailed { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_mismatch_display() {
        let err = AcquisitionError::ChecksumMismatch {
            filename: "bundle.zip".to_string(),
            expected: "abc123".to_string(),
            actual: "def456".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("checksum mismatch"));
        assert!(text.contains("abc123"));
        assert!(text.contains("def456"));
        assert!(err.is_integrity());
        assert!(!err.is_network());
    }

    #[test]
    fn test_malformed_checksum_is_integrity_failure() {
        let err = AcquisitionError::MalformedChecksum {
            source_name: "https://cdn/config.json".to_string(),
            value: "abc123".to_string(),
        };
        assert!(err.is_integrity());
        assert!(!err.is_network());
        assert!(err.to_string().contains("abc123"));
    }

    #[test]
    fn test_network_classification() {
        let errors = [
            AcquisitionError::Network {
                url: "http://a".to_string(),
                reason: "refused".to_string(),
            },
            AcquisitionError::Timeout {
                url: "http://a".to_string(),
                timeout_secs: 30,
            },
            AcquisitionError::TooManyRedirects {
                url: "http://a".to_string(),
                max_redirects: 4,
            },
            AcquisitionError::HttpStatus {
                url: "http://a".to_string(),
                status: 503,
            },
        ];
        for err in errors {
            assert!(err.is_network(), "{} should be a network error", err);
        }
    }

    #[test]
    fn test_http_status_display() {
        let err = AcquisitionError::HttpStatus {
            url: "http://example.com/x".to_string(),
            status: 404,
        };
        assert_eq!(err.to_string(), "HTTP 404 from http://example.com/x");
    }

    #[test]
    fn test_io_errors_expose_source() {
        use std::error::Error;
        let err = AcquisitionError::WriteFailed {
            path: PathBuf::from("/tmp/x"),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(err.source().is_some());
    }
}
