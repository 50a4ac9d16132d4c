//! Payload acquisition engine.
//!
//! The [`PayloadUpdater`] keeps one published artifact per managed payload in
//! sync with its remote source. Each cycle:
//!
//! ```text
//! load state ─► fetch remote config (optional, non-fatal)
//!            ─► resolve layers ─► idle? ─► record lastChecked
//!            ─► needs download? ─► no ─► record version/source/lastChecked
//!                   │ yes
//!                   ▼
//!            <asset>.download ─► sha256 ─► mismatch? ─► abort, nothing changes
//!                   │ ok
//!                   ▼
//!            rename over <asset> ─► save state ─► notify observers
//! ```
//!
//! Every failure is logged and folded into "no change this cycle". At most
//! one cycle runs at a time; overlapping calls return
//! [`RefreshOutcome::Skipped`] instead of queueing.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::checksum::{calculate_file_checksum, verify_checksum};
use super::error::{AcquisitionError, AcquisitionResult};
use super::fetch::{Fetcher, RequestHeaders};
use super::overrides::EnvOverrides;
use super::remote::RemoteConfig;
use super::resolve::{PayloadSettings, ResolvedSettings};
use super::state::{ArtifactState, StateStore};

/// Suffix of the temporary file a download is streamed into.
pub const DOWNLOAD_SUFFIX: &str = ".download";

/// Details of a freshly installed artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledAsset {
    /// Published file name.
    pub asset_file: String,
    /// Full path of the published file.
    pub path: PathBuf,
    /// Content hash of the new artifact.
    pub sha256: String,
    /// Recorded version tag.
    pub version: Option<String>,
    /// URL the artifact was downloaded from.
    pub source: String,
    /// State record written alongside the swap.
    pub state: ArtifactState,
}

/// Result of one [`PayloadUpdater::refresh_once`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Another cycle was running, or the updater is stopped.
    Skipped,
    /// Disabled by an environment toggle or the remote document.
    Disabled,
    /// No download URL is configured anywhere.
    Idle,
    /// The published artifact is current.
    Unchanged,
    /// A new artifact was published.
    Installed(InstalledAsset),
    /// The cycle failed; the previous artifact and state are untouched.
    Failed(String),
}

/// Receives updater events.
///
/// Both methods default to no-ops so observers implement only what they need.
pub trait UpdateObserver: Send + Sync {
    /// Called after every completed cycle with the current state.
    fn on_state_updated(&self, _state: &ArtifactState) {}

    /// Called only when a new artifact has been published.
    fn on_asset_ready(&self, _asset: &InstalledAsset) {}
}

type EnvSource = Arc<dyn Fn() -> EnvOverrides + Send + Sync>;

/// Keeps one payload artifact in sync with its remote source.
pub struct PayloadUpdater {
    settings: PayloadSettings,
    fetcher: Arc<dyn Fetcher>,
    store: StateStore,
    env_source: EnvSource,
    observers: Vec<Arc<dyn UpdateObserver>>,
    running: AtomicBool,
    stopped: AtomicBool,
    shutdown: CancellationToken,
}

/// Clears the re-entrancy flag when a cycle ends, whatever the exit path.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl PayloadUpdater {
    /// Create an updater reading overrides from the process environment.
    pub fn new(settings: PayloadSettings, fetcher: Arc<dyn Fetcher>) -> Self {
        let name = settings.name.clone();
        let store = StateStore::new(&settings.asset_dir);
        Self {
            settings,
            fetcher,
            store,
            env_source: Arc::new(move || EnvOverrides::from_env(&name)),
            observers: Vec::new(),
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// Replace the environment override source.
    pub fn with_env_source<F>(mut self, source: F) -> Self
    where
        F: Fn() -> EnvOverrides + Send + Sync + 'static,
    {
        self.env_source = Arc::new(source);
        self
    }

    /// Register an observer.
    pub fn with_observer(mut self, observer: Arc<dyn UpdateObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Static settings this updater was built with.
    pub fn settings(&self) -> &PayloadSettings {
        &self.settings
    }

    /// Durable state store.
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Last known state without touching the disk.
    pub fn state(&self) -> Option<ArtifactState> {
        self.store.current()
    }

    /// True once [`stop`](Self::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Run one acquisition cycle.
    pub async fn refresh_once(&self) -> RefreshOutcome {
        if self.is_stopped() {
            return RefreshOutcome::Skipped;
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(payload = %self.settings.name, "Refresh already in progress; skipping");
            return RefreshOutcome::Skipped;
        }
        let _guard = RunningGuard(&self.running);

        let env = (self.env_source)();
        if env.globally_disabled {
            debug!(payload = %self.settings.name, "Auto-update disabled globally");
            return RefreshOutcome::Disabled;
        }
        if env.payload_disabled {
            debug!(payload = %self.settings.name, "Auto-update disabled for payload");
            return RefreshOutcome::Disabled;
        }

        let outcome = match self.run_cycle(&env).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if e.is_integrity() {
                    error!(
                        payload = %self.settings.name,
                        error = %e,
                        "Payload integrity check failed"
                    );
                } else if e.is_network() {
                    warn!(payload = %self.settings.name, error = %e, "Payload refresh failed");
                } else {
                    error!(payload = %self.settings.name, error = %e, "Payload refresh failed");
                }
                RefreshOutcome::Failed(e.to_string())
            }
        };

        self.notify(&outcome);
        outcome
    }

    async fn run_cycle(&self, env: &EnvOverrides) -> AcquisitionResult<RefreshOutcome> {
        let persisted = self.store.load().await;
        ensure_dir(&self.settings.asset_dir).await?;

        let base_headers = env.base_headers();
        let config_url = self.settings.effective_config_url(env);
        let remote = match &config_url {
            Some(url) => match self.fetch_remote(url, &base_headers).await {
                Ok(remote) => Some(remote),
                Err(e) => {
                    warn!(
                        payload = %self.settings.name,
                        url = %url,
                        error = %e,
                        "Unable to fetch remote config"
                    );
                    None
                }
            },
            None => None,
        };

        let resolved =
            ResolvedSettings::resolve(&self.settings, persisted.as_ref(), remote.as_ref(), env);
        if !resolved.enabled {
            debug!(payload = %self.settings.name, "Remote configuration disabled auto-updates");
            return Ok(RefreshOutcome::Disabled);
        }

        let now = Utc::now();
        let mut next = persisted.clone().unwrap_or_default();
        next.last_checked = Some(now);

        let Some(download_url) = resolved.download_url.clone() else {
            debug!(payload = %self.settings.name, "No download URL defined; auto-update idle");
            self.persist(&next).await;
            return Ok(RefreshOutcome::Idle);
        };

        if let Some(value) = &resolved.invalid_sha256 {
            return Err(AcquisitionError::MalformedChecksum {
                source_name: config_url.unwrap_or_default(),
                value: value.clone(),
            });
        }

        let asset_path = self.settings.asset_dir.join(&resolved.asset_file);
        let asset_exists = tokio::fs::try_exists(&asset_path).await.unwrap_or(false);

        if !resolved.needs_download(persisted.as_ref(), asset_exists) {
            if let Some(version) = &resolved.version {
                next.version = Some(version.clone());
            }
            next.source = Some(download_url);
            if next.asset_file.is_none() {
                next.asset_file = Some(resolved.asset_file.clone());
            }
            self.persist(&next).await;
            return Ok(RefreshOutcome::Unchanged);
        }

        info!(
            payload = %self.settings.name,
            url = %download_url,
            asset = %resolved.asset_file,
            "Downloading payload"
        );
        let sha256 = self.install(&resolved, &download_url, &asset_path).await?;

        next.sha256 = Some(sha256.clone());
        next.downloaded_at = Some(now);
        next.asset_file = Some(resolved.asset_file.clone());
        next.source = Some(download_url.clone());
        if resolved.version.is_some() {
            next.version = resolved.version.clone();
        }
        self.persist(&next).await;

        info!(
            payload = %self.settings.name,
            asset = %resolved.asset_file,
            sha256 = %sha256,
            "Payload updated"
        );

        Ok(RefreshOutcome::Installed(InstalledAsset {
            asset_file: resolved.asset_file,
            path: asset_path,
            sha256,
            version: next.version.clone(),
            source: download_url,
            state: next,
        }))
    }

    async fn fetch_remote(
        &self,
        url: &str,
        headers: &RequestHeaders,
    ) -> AcquisitionResult<RemoteConfig> {
        let fetched = self.fetcher.fetch_bytes(url, headers).await?;
        if fetched.body.is_empty() {
            return Err(AcquisitionError::ConfigParse {
                source_name: url.to_string(),
                reason: "empty response".to_string(),
            });
        }
        RemoteConfig::parse(&fetched.body, url)
    }

    /// Download, verify and publish. Returns the new content hash.
    ///
    /// The temp file is always removed on failure; the published path is
    /// only touched once the download has been verified.
    async fn install(
        &self,
        resolved: &ResolvedSettings,
        url: &str,
        asset_path: &Path,
    ) -> AcquisitionResult<String> {
        let temp_path = download_path_for(asset_path);

        let result: AcquisitionResult<String> = async {
            self.fetcher
                .fetch_to_file(url, &resolved.download_headers, &temp_path)
                .await?;
            let sha256 = match &resolved.expected_sha256 {
                Some(expected) => verify_checksum(&temp_path, expected).await?,
                None => calculate_file_checksum(&temp_path).await?,
            };
            publish(&temp_path, asset_path).await?;
            Ok(sha256)
        }
        .await;

        if result.is_err() {
            remove_if_exists(&temp_path).await;
        }
        result
    }

    async fn persist(&self, state: &ArtifactState) {
        if let Err(e) = self.store.save(state).await {
            error!(payload = %self.settings.name, error = %e, "Failed to persist payload state");
        }
    }

    fn notify(&self, outcome: &RefreshOutcome) {
        if matches!(outcome, RefreshOutcome::Skipped) {
            return;
        }
        let state = self.store.current().unwrap_or_default();
        for observer in &self.observers {
            observer.on_state_updated(&state);
            if let RefreshOutcome::Installed(asset) = outcome {
                observer.on_asset_ready(asset);
            }
        }
    }

    /// Start periodic refreshes.
    ///
    /// The first cycle runs immediately; later cycles follow the configured
    /// interval (never shorter than one minute). The task ends when
    /// [`stop`](Self::stop) is called and does not hold the runtime open.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let updater = Arc::clone(self);
        let period = self.settings.effective_interval();
        info!(
            payload = %self.settings.name,
            interval_secs = period.as_secs(),
            "Starting payload updater"
        );

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;

                    _ = updater.shutdown.cancelled() => {
                        debug!(payload = %updater.settings.name, "Payload updater stopped");
                        break;
                    }

                    _ = ticker.tick() => {
                        updater.refresh_once().await;
                    }
                }
            }
        })
    }

    /// Stop scheduling cycles. An in-flight cycle runs to completion.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.shutdown.cancel();
    }
}

/// Temporary download path next to `asset_path`.
pub fn download_path_for(asset_path: &Path) -> PathBuf {
    let mut name = asset_path.file_name().unwrap_or_default().to_os_string();
    name.push(DOWNLOAD_SUFFIX);
    asset_path.with_file_name(name)
}

async fn ensure_dir(dir: &Path) -> AcquisitionResult<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| AcquisitionError::CreateDirFailed {
            path: dir.to_path_buf(),
            source: e,
        })
}

/// Move `temp_path` over `asset_path`.
///
/// Rename replaces the target in one step where the platform allows it;
/// otherwise the old file is removed first.
async fn publish(temp_path: &Path, asset_path: &Path) -> AcquisitionResult<()> {
    if tokio::fs::rename(temp_path, asset_path).await.is_ok() {
        return Ok(());
    }
    remove_if_exists(asset_path).await;
    tokio::fs::rename(temp_path, asset_path)
        .await
        .map_err(|e| AcquisitionError::WriteFailed {
            path: asset_path.to_path_buf(),
            source: e,
        })
}

async fn remove_if_exists(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Unable to remove file");
        }
    }
}
