//! Durable artifact state.
//!
//! One small JSON record per managed payload, stored next to the artifact as
//! [`STATE_FILENAME`]. Writes go to a sibling temp file and are renamed over
//! the published path, and are skipped entirely when the serialized form is
//! byte-identical to the last one read or written.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::error::{AcquisitionError, AcquisitionResult};

/// File name of the persisted state record inside the asset directory.
pub const STATE_FILENAME: &str = ".auto-updater.json";

/// Persisted record describing the currently published artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactState {
    /// File name of the published artifact within the asset directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_file: Option<String>,

    /// Lowercase hex SHA-256 of the published artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,

    /// Opaque remote-supplied version tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Download URL the current artifact was fetched from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// When the current artifact was installed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downloaded_at: Option<DateTime<Utc>>,

    /// When the remote source was last consulted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<DateTime<Utc>>,
}

impl ArtifactState {
    /// Parse a state record from its JSON form.
    pub fn from_json(raw: &str) -> AcquisitionResult<Self> {
        serde_json::from_str(raw).map_err(|e| AcquisitionError::ConfigParse {
            source_name: STATE_FILENAME.to_string(),
            reason: e.to_string(),
        })
    }

    /// Serialize to the on-disk form (pretty-printed JSON).
    pub fn to_json(&self) -> String {
        // Plain struct of strings and timestamps; serialization cannot fail.
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

#[derive(Debug, Default)]
struct Cached {
    state: Option<ArtifactState>,
    raw: Option<String>,
}

/// Reads and writes the [`ArtifactState`] for one asset directory.
///
/// The last-known-good serialization is cached so unchanged state is never
/// rewritten.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    cached: Mutex<Cached>,
}

impl StateStore {
    /// Create a store for the state file inside `asset_dir`.
    pub fn new(asset_dir: &Path) -> Self {
        Self {
            path: asset_dir.join(STATE_FILENAME),
            cached: Mutex::new(Cached::default()),
        }
    }

    /// Path of the persisted state file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Most recently loaded or saved state, without touching the disk.
    pub fn current(&self) -> Option<ArtifactState> {
        self.cached.lock().state.clone()
    }

    /// Load the persisted state.
    ///
    /// Returns the cached copy when one exists. A missing file yields `None`;
    /// a malformed file is logged and also yields `None`, so the next
    /// successful cycle overwrites it.
    pub async fn load(&self) -> Option<ArtifactState> {
        if let Some(state) = self.current() {
            return Some(state);
        }

        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Unable to read payload state");
                return None;
            }
        };

        match ArtifactState::from_json(&raw) {
            Ok(state) => {
                let mut cached = self.cached.lock();
                cached.state = Some(state.clone());
                cached.raw = Some(raw);
                Some(state)
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Ignoring malformed payload state");
                None
            }
        }
    }

    /// Persist `state` if it differs from the last-known-good serialization.
    ///
    /// Returns `Ok(true)` when the file was written.
    pub async fn save(&self, state: &ArtifactState) -> AcquisitionResult<bool> {
        let raw = state.to_json();
        if self.cached.lock().raw.as_deref() == Some(raw.as_str()) {
            return Ok(false);
        }

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                AcquisitionError::CreateDirFailed {
                    path: parent.to_path_buf(),
                    source: e,
                }
            })?;
        }

        let tmp_path = temp_path_for(&self.path);
        tokio::fs::write(&tmp_path, raw.as_bytes())
            .await
            .map_err(|e| AcquisitionError::WriteFailed {
                path: tmp_path.clone(),
                source: e,
            })?;
        if let Err(e) = tokio::fs::rename(&tmp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(AcquisitionError::WriteFailed {
                path: self.path.clone(),
                source: e,
            });
        }

        debug!(path = %self.path.display(), "Persisted payload state");
        let mut cached = self.cached.lock();
        cached.state = Some(state.clone());
        cached.raw = Some(raw);
        Ok(true)
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}
