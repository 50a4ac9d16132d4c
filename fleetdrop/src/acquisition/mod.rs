//! Payload acquisition.
//!
//! Keeps the published artifact for a managed payload in sync with a remote
//! source, verifies downloads, and persists what was installed so restarts
//! pick up where they left off.
//!
//! # Architecture
//!
//! ```text
//! EnvOverrides ─┐
//! RemoteConfig ─┼─► ResolvedSettings ─► PayloadUpdater ─► <asset_dir>/<asset>
//! ArtifactState ┤                            │               .auto-updater.json
//! PayloadSettings                            ▼
//!                                      UpdateObserver ─► ArtifactCatalog
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use fleetdrop::acquisition::{ArtifactCatalog, HttpFetcher, PayloadSettings, PayloadUpdater};
//!
//! let settings = PayloadSettings::new("stfdeploy", "/srv/fleetdrop/stfdeploy")
//!     .with_config_url("https://example.com/stfdeploy.json");
//! let catalog = Arc::new(ArtifactCatalog::open(&settings).await);
//! let updater = Arc::new(
//!     PayloadUpdater::new(settings, Arc::new(HttpFetcher::new()?)).with_observer(catalog.clone()),
//! );
//!
//! let task = updater.start();
//! // ...
//! updater.stop();
//! task.await?;
//! ```

mod checksum;
mod engine;
mod error;
mod fetch;
mod metadata;
mod overrides;
mod remote;
mod resolve;
mod state;

pub use checksum::{calculate_file_checksum, is_sha256_hex, sha256_hex, verify_checksum};
pub use engine::{
    download_path_for, InstalledAsset, PayloadUpdater, RefreshOutcome, UpdateObserver,
    DOWNLOAD_SUFFIX,
};
pub use error::{AcquisitionError, AcquisitionResult};
pub use fetch::{
    build_header_map, FetchedBody, Fetcher, HttpFetcher, RequestHeaders, DEFAULT_TIMEOUT_SECS,
    DEFAULT_USER_AGENT, MAX_REDIRECTS,
};
pub use metadata::{ArtifactCatalog, ArtifactMetadata, ResolvedAsset};
pub use overrides::{is_falsey_toggle, normalize_auth, scope_name, EnvOverrides, ENV_PREFIX};
pub use remote::RemoteConfig;
pub use resolve::{
    safe_file_name, PayloadSettings, ResolvedSettings, DEFAULT_ASSET_NAME,
    DEFAULT_REFRESH_INTERVAL, MIN_REFRESH_INTERVAL,
};
pub use state::{ArtifactState, StateStore, STATE_FILENAME};
