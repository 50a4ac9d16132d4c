//! Remote payload configuration document.
//!
//! The remote source publishes a small JSON object describing the current
//! bundle. Several historical spellings exist for the same field; the first
//! non-empty candidate wins:
//!
//! | field     | candidates (in priority order)                            |
//! |-----------|-----------------------------------------------------------|
//! | file name | `assetFile`, `bundleName`                                 |
//! | version   | `assetVersion`, `bundleVersion`, `payloadVersion`, `version` |
//! | hash      | `assetSha256`, `bundleSha256`, `sha256`                   |
//! | enabled   | `autoUpdate`, `autoUpdateEnabled` (explicit `false` disables) |
//!
//! A declared hash that is not 64 hex characters is kept in
//! [`RemoteConfig::invalid_sha256`] so the engine can refuse the cycle
//! instead of installing an unverified artifact.

use serde::Deserialize;
use serde_json::Value;

use super::checksum::is_sha256_hex;
use super::error::{AcquisitionError, AcquisitionResult};
use super::fetch::RequestHeaders;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRemoteConfig {
    download_url: Option<Value>,
    asset_file: Option<Value>,
    bundle_name: Option<Value>,
    asset_version: Option<Value>,
    bundle_version: Option<Value>,
    payload_version: Option<Value>,
    version: Option<Value>,
    asset_sha256: Option<Value>,
    bundle_sha256: Option<Value>,
    sha256: Option<Value>,
    auto_update: Option<Value>,
    auto_update_enabled: Option<Value>,
    download_headers: Option<Value>,
}

/// Normalised view of the remote configuration document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteConfig {
    /// Where to download the bundle from.
    pub download_url: Option<String>,
    /// File name the bundle should be published under.
    pub asset_file: Option<String>,
    /// Opaque version tag.
    pub version: Option<String>,
    /// Expected lowercase hex SHA-256 of the bundle.
    pub sha256: Option<String>,
    /// Declared hash that failed validation, verbatim.
    pub invalid_sha256: Option<String>,
    /// False only when the document explicitly disables auto-update.
    pub auto_update: bool,
    /// Extra headers for the artifact download request.
    pub download_headers: RequestHeaders,
}

impl RemoteConfig {
    /// Parse the remote document.
    ///
    /// `source_name` is used in the error message (usually the config URL).
    pub fn parse(bytes: &[u8], source_name: &str) -> AcquisitionResult<Self> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| AcquisitionError::ConfigParse {
                source_name: source_name.to_string(),
                reason: e.to_string(),
            })?;

        if !value.is_object() {
            return Err(AcquisitionError::ConfigParse {
                source_name: source_name.to_string(),
                reason: "expected a JSON object".to_string(),
            });
        }

        // Every field is optional and loosely typed, so a type mismatch on one
        // field must not reject the whole document.
        let raw: RawRemoteConfig =
            serde_json::from_value(value).map_err(|e| AcquisitionError::ConfigParse {
                source_name: source_name.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self::from_raw(raw))
    }

    fn from_raw(raw: RawRemoteConfig) -> Self {
        let asset_file = first_non_empty([raw.asset_file.as_ref(), raw.bundle_name.as_ref()]);
        let version = first_non_empty([
            raw.asset_version.as_ref(),
            raw.bundle_version.as_ref(),
            raw.payload_version.as_ref(),
            raw.version.as_ref(),
        ]);
        let declared_sha256 = first_non_empty([
            raw.asset_sha256.as_ref(),
            raw.bundle_sha256.as_ref(),
            raw.sha256.as_ref(),
        ]);
        let (sha256, invalid_sha256) = match declared_sha256 {
            Some(hash) if is_sha256_hex(&hash) => (Some(hash.to_ascii_lowercase()), None),
            Some(hash) => (None, Some(hash)),
            None => (None, None),
        };

        let explicitly_disabled = [raw.auto_update.as_ref(), raw.auto_update_enabled.as_ref()]
            .into_iter()
            .flatten()
            .any(|v| v == &Value::Bool(false));

        let download_headers = match raw.download_headers {
            Some(Value::Object(map)) => map
                .into_iter()
                .filter_map(|(k, v)| header_value_string(&v).map(|v| (k, v)))
                .collect(),
            _ => RequestHeaders::new(),
        };

        Self {
            download_url: first_non_empty([raw.download_url.as_ref()]),
            asset_file,
            version,
            sha256,
            invalid_sha256,
            auto_update: !explicitly_disabled,
            download_headers,
        }
    }
}

fn first_non_empty<'a, const N: usize>(candidates: [Option<&'a Value>; N]) -> Option<String> {
    candidates
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

fn header_value_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
