//! Layered configuration for one acquisition cycle.
//!
//! Four layers feed every cycle, highest precedence first:
//!
//! 1. environment overrides ([`EnvOverrides`])
//! 2. the remote configuration document ([`RemoteConfig`])
//! 3. the persisted [`ArtifactState`]
//! 4. static [`PayloadSettings`]
//!
//! [`ResolvedSettings::resolve`] collapses them field by field so the engine
//! never has to walk fallback chains itself.

use std::path::PathBuf;
use std::time::Duration;

use super::fetch::RequestHeaders;
use super::overrides::EnvOverrides;
use super::remote::RemoteConfig;
use super::state::ArtifactState;

/// Default artifact file name when nothing else names one.
pub const DEFAULT_ASSET_NAME: &str = "bundle.zip";

/// Default refresh period (1 hour).
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Lower bound for the refresh period.
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Static settings for one managed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadSettings {
    /// Short name, used for env scoping and log fields.
    pub name: String,
    /// Directory the artifact and state file live in.
    pub asset_dir: PathBuf,
    /// Artifact file name used when neither remote nor state names one.
    pub default_asset: String,
    /// Remote configuration document URL.
    pub config_url: Option<String>,
    /// Fallback download URL.
    pub download_url: Option<String>,
    /// Version shown when state has none.
    pub version: Option<String>,
    /// Refresh period; clamped to [`MIN_REFRESH_INTERVAL`] when used.
    pub refresh_interval: Duration,
}

impl PayloadSettings {
    /// Create settings for `name` publishing into `asset_dir`.
    pub fn new(name: impl Into<String>, asset_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into().to_lowercase(),
            asset_dir: asset_dir.into(),
            default_asset: DEFAULT_ASSET_NAME.to_string(),
            config_url: None,
            download_url: None,
            version: None,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
        }
    }

    /// Set the default artifact file name.
    pub fn with_default_asset(mut self, name: impl Into<String>) -> Self {
        self.default_asset = name.into();
        self
    }

    /// Set the remote configuration URL.
    pub fn with_config_url(mut self, url: impl Into<String>) -> Self {
        self.config_url = Some(url.into());
        self
    }

    /// Set the fallback download URL.
    pub fn with_download_url(mut self, url: impl Into<String>) -> Self {
        self.download_url = Some(url.into());
        self
    }

    /// Set the display version.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Set the refresh period.
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Refresh period with the lower bound applied.
    pub fn effective_interval(&self) -> Duration {
        self.refresh_interval.max(MIN_REFRESH_INTERVAL)
    }

    /// Config URL after environment overrides.
    pub fn effective_config_url(&self, env: &EnvOverrides) -> Option<String> {
        env.config_url
            .clone()
            .or_else(|| self.config_url.clone().filter(|u| !u.trim().is_empty()))
    }
}

/// Fully resolved inputs for one refresh cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSettings {
    /// False when any layer disables auto-update.
    pub enabled: bool,
    /// Artifact source; `None` means the cycle is idle.
    pub download_url: Option<String>,
    /// File name to publish under.
    pub asset_file: String,
    /// Version tag to record.
    pub version: Option<String>,
    /// Hash the download must match, if the remote declares one.
    pub expected_sha256: Option<String>,
    /// Declared hash that is not a valid digest; no download can satisfy it.
    pub invalid_sha256: Option<String>,
    /// Headers for the remote config request.
    pub request_headers: RequestHeaders,
    /// Headers for the artifact download.
    pub download_headers: RequestHeaders,
}

impl ResolvedSettings {
    /// Collapse all layers into one value.
    pub fn resolve(
        settings: &PayloadSettings,
        persisted: Option<&ArtifactState>,
        remote: Option<&RemoteConfig>,
        env: &EnvOverrides,
    ) -> Self {
        let enabled = !env.is_disabled() && remote.map_or(true, |r| r.auto_update);

        let download_url = env
            .download_url
            .clone()
            .or_else(|| remote.and_then(|r| r.download_url.clone()))
            .or_else(|| settings.download_url.clone().filter(|u| !u.trim().is_empty()));

        let asset_file = remote
            .and_then(|r| r.asset_file.as_deref())
            .and_then(safe_file_name)
            .or_else(|| {
                persisted
                    .and_then(|s| s.asset_file.as_deref())
                    .and_then(safe_file_name)
            })
            .unwrap_or_else(|| settings.default_asset.clone());

        let version = remote
            .and_then(|r| r.version.clone())
            .or_else(|| {
                persisted
                    .and_then(|s| s.version.as_deref())
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(str::to_string)
            });

        let request_headers = env.base_headers();
        let mut download_headers = request_headers.clone();
        if let Some(remote) = remote {
            download_headers.extend(
                remote
                    .download_headers
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone())),
            );
        }

        Self {
            enabled,
            download_url,
            asset_file,
            version,
            expected_sha256: remote.and_then(|r| r.sha256.clone()),
            invalid_sha256: remote.and_then(|r| r.invalid_sha256.clone()),
            request_headers,
            download_headers,
        }
    }

    /// Decide whether the artifact must be downloaded again.
    ///
    /// True when the artifact is missing, or when the remote-declared
    /// version, hash, file name or source differs from what was persisted.
    pub fn needs_download(&self, persisted: Option<&ArtifactState>, asset_exists: bool) -> bool {
        if !asset_exists {
            return true;
        }
        let Some(state) = persisted else {
            // An artifact with no record: only re-fetch when the remote
            // declares something to compare against.
            return self.expected_sha256.is_some() || self.version.is_some();
        };

        if let Some(version) = &self.version {
            if state.version.as_ref() != Some(version) {
                return true;
            }
        }
        if let Some(sha) = &self.expected_sha256 {
            if state.sha256.as_ref() != Some(sha) {
                return true;
            }
        }
        if let Some(file) = &state.asset_file {
            if file != &self.asset_file {
                return true;
            }
        }
        if let (Some(source), Some(url)) = (&state.source, &self.download_url) {
            if source != url {
                return true;
            }
        }
        false
    }
}

/// Reduce a file name to its final path component.
///
/// Returns `None` for empty names and for `.`/`..`.
pub fn safe_file_name(name: &str) -> Option<String> {
    let trimmed = name.trim();
    let base = trimmed.rsplit(['/', '\\']).next()?;
    match base {
        "" | "." | ".." => None,
        _ => Some(base.to_string()),
    }
}
