//! Cached metadata for the published artifact.
//!
//! Hashing the artifact on every request would be wasteful, so the
//! [`ArtifactCatalog`] keeps the last computed metadata and recomputes only
//! when the file's name, size or modification time changed, or when forced.
//! It also tracks which file name is current: when the configured name is
//! missing on disk the first `*.zip` in the asset directory takes over.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use super::checksum::calculate_file_checksum;
use super::engine::{InstalledAsset, UpdateObserver};
use super::error::{AcquisitionError, AcquisitionResult};
use super::resolve::PayloadSettings;
use super::state::{ArtifactState, StateStore};

/// Display view of the published artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactMetadata {
    /// False when no artifact exists.
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub downloaded_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<DateTime<Utc>>,
}

impl ArtifactMetadata {
    /// Metadata for a missing artifact.
    pub fn unavailable() -> Self {
        Self::default()
    }

    /// First eight characters of the hash, used as a short display tag.
    pub fn short_hash(&self) -> Option<&str> {
        self.sha256.as_deref().map(|s| &s[..s.len().min(8)])
    }
}

/// File facts the cache is keyed on.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FileFingerprint {
    name: String,
    size: u64,
    modified: SystemTime,
}

#[derive(Debug, Clone)]
struct CachedHash {
    fingerprint: FileFingerprint,
    sha256: String,
}

#[derive(Debug, Default)]
struct CatalogInner {
    asset_name: String,
    cached: Option<CachedHash>,
    state: Option<ArtifactState>,
}

/// A resolved artifact on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAsset {
    pub name: String,
    pub path: PathBuf,
}

/// Tracks the current artifact and its metadata for one payload.
#[derive(Debug)]
pub struct ArtifactCatalog {
    asset_dir: PathBuf,
    static_version: Option<String>,
    static_source: Option<String>,
    inner: Mutex<CatalogInner>,
}

impl ArtifactCatalog {
    /// Create a catalog for the payload described by `settings`.
    pub fn new(settings: &PayloadSettings) -> Self {
        Self {
            asset_dir: settings.asset_dir.clone(),
            static_version: settings.version.clone(),
            static_source: settings.download_url.clone(),
            inner: Mutex::new(CatalogInner {
                asset_name: settings.default_asset.clone(),
                ..Default::default()
            }),
        }
    }

    /// Create a catalog seeded with the state persisted in the asset
    /// directory, so the recorded artifact wins over any other `*.zip`
    /// before the first refresh cycle has run.
    pub async fn open(settings: &PayloadSettings) -> Self {
        let catalog = Self::new(settings);
        catalog.reload_state().await;
        catalog
    }

    /// Re-read the persisted state file.
    pub async fn reload_state(&self) {
        let state = StateStore::new(&self.asset_dir).load().await;
        if let Some(state) = &state {
            debug!(
                dir = %self.asset_dir.display(),
                asset = ?state.asset_file,
                "Loaded persisted payload state"
            );
        }
        self.set_state(state);
    }

    /// Directory artifacts are published in.
    pub fn asset_dir(&self) -> &Path {
        &self.asset_dir
    }

    /// File name currently considered the artifact.
    pub fn asset_name(&self) -> String {
        self.inner.lock().asset_name.clone()
    }

    /// Switch to a new artifact name and drop cached metadata.
    pub fn set_asset_name(&self, name: &str) {
        let mut inner = self.inner.lock();
        if inner.asset_name != name {
            inner.asset_name = name.to_string();
            inner.cached = None;
        }
    }

    /// Replace the state record shown alongside file metadata.
    pub fn set_state(&self, state: Option<ArtifactState>) {
        let mut inner = self.inner.lock();
        if let Some(name) = state.as_ref().and_then(|s| s.asset_file.as_deref()) {
            if inner.asset_name != name {
                inner.asset_name = name.to_string();
                inner.cached = None;
            }
        }
        inner.state = state;
    }

    /// Drop cached metadata so the next query rehashes.
    pub fn invalidate(&self) {
        self.inner.lock().cached = None;
    }

    /// Locate the artifact on disk.
    ///
    /// Falls back to the first `*.zip` (by name) when the current name is
    /// missing; the fallback then becomes the current name.
    pub async fn resolve_asset(&self) -> Option<ResolvedAsset> {
        let name = self.asset_name();
        let path = self.asset_dir.join(&name);
        if is_file(&path).await {
            return Some(ResolvedAsset { name, path });
        }

        let fallback = match first_zip(&self.asset_dir).await {
            Ok(found) => found?,
            Err(e) => {
                warn!(
                    dir = %self.asset_dir.display(),
                    error = %e,
                    "Unable to enumerate asset directory"
                );
                return None;
            }
        };
        debug!(
            configured = %name,
            fallback = %fallback,
            "Configured asset missing; using fallback"
        );
        self.set_asset_name(&fallback);
        Some(ResolvedAsset {
            path: self.asset_dir.join(&fallback),
            name: fallback,
        })
    }

    /// Current artifact metadata.
    ///
    /// The hash is recomputed only when the file changed or `force` is set.
    /// Any I/O failure is logged and reported as an unavailable artifact.
    pub async fn metadata(&self, force: bool) -> ArtifactMetadata {
        match self.compute(force).await {
            Ok(meta) => meta,
            Err(e) => {
                warn!(error = %e, "Failed to compute asset metadata");
                self.invalidate();
                ArtifactMetadata::unavailable()
            }
        }
    }

    async fn compute(&self, force: bool) -> AcquisitionResult<ArtifactMetadata> {
        let Some(asset) = self.resolve_asset().await else {
            self.invalidate();
            return Ok(ArtifactMetadata::unavailable());
        };

        let stat = tokio::fs::metadata(&asset.path)
            .await
            .map_err(|e| AcquisitionError::ReadFailed {
                path: asset.path.clone(),
                source: e,
            })?;
        let modified = stat.modified().map_err(|e| AcquisitionError::ReadFailed {
            path: asset.path.clone(),
            source: e,
        })?;
        let fingerprint = FileFingerprint {
            name: asset.name.clone(),
            size: stat.len(),
            modified,
        };

        let cached = {
            let inner = self.inner.lock();
            inner
                .cached
                .as_ref()
                .filter(|c| !force && c.fingerprint == fingerprint)
                .map(|c| c.sha256.clone())
        };

        let sha256 = match cached {
            Some(sha) => sha,
            None => {
                let sha = calculate_file_checksum(&asset.path).await?;
                debug!(asset = %asset.name, sha256 = %sha, "Computed asset metadata");
                self.inner.lock().cached = Some(CachedHash {
                    fingerprint: fingerprint.clone(),
                    sha256: sha.clone(),
                });
                sha
            }
        };

        let state = self.inner.lock().state.clone().unwrap_or_default();
        Ok(ArtifactMetadata {
            available: true,
            name: Some(asset.name),
            size: Some(fingerprint.size),
            modified: Some(DateTime::<Utc>::from(fingerprint.modified)),
            sha256: Some(sha256),
            version: state.version.or_else(|| self.static_version.clone()),
            source: state.source.or_else(|| self.static_source.clone()),
            downloaded_at: state.downloaded_at,
            last_checked: state.last_checked,
        })
    }
}

impl UpdateObserver for ArtifactCatalog {
    fn on_state_updated(&self, state: &ArtifactState) {
        let mut inner = self.inner.lock();
        let changed = inner.state.as_ref().map_or(true, |prev| {
            prev.asset_file != state.asset_file
                || prev.sha256 != state.sha256
                || prev.downloaded_at != state.downloaded_at
        });
        if let Some(name) = state.asset_file.as_deref() {
            inner.asset_name = name.to_string();
        }
        if changed {
            inner.cached = None;
        }
        inner.state = Some(state.clone());
    }

    fn on_asset_ready(&self, asset: &InstalledAsset) {
        let mut inner = self.inner.lock();
        inner.asset_name = asset.asset_file.clone();
        inner.cached = None;
        inner.state = Some(asset.state.clone());
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

async fn first_zip(dir: &Path) -> std::io::Result<Option<String>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let mut zips = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.to_lowercase().ends_with(".zip") && entry.file_type().await?.is_file() {
            zips.push(name);
        }
    }
    zips.sort();
    Ok(zips.into_iter().next())
}
