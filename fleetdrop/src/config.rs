//! INI configuration file.
//!
//! Lives at `~/.fleetdrop/config.ini`. A missing file means defaults; a
//! present but malformed value is an error naming the offending key.
//!
//! ```ini
//! [payload]
//! name = stfdeploy
//! asset_dir = /srv/fleetdrop/stfdeploy
//! config_url = https://example.com/stfdeploy.json
//! interval_secs = 3600
//!
//! [dispatch]
//! job_timeout_secs = 300
//! busy_retry_delay_secs = 4
//! max_busy_retries = 3
//!
//! [server]
//! bind = 127.0.0.1:8088
//! public_origin = https://mesh.example.com
//!
//! [logging]
//! directory = /var/log/fleetdrop
//! filter = fleetdrop=debug
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use ini::Ini;
use thiserror::Error;

use crate::acquisition::{PayloadSettings, DEFAULT_ASSET_NAME, DEFAULT_REFRESH_INTERVAL};
use crate::dispatch::{
    BusyRetryPolicy, DispatchConfig, DEFAULT_BUSY_RETRY_DELAY_SECS, DEFAULT_JOB_TIMEOUT_SECS,
    DEFAULT_MAX_BUSY_RETRIES,
};
use crate::serve::{default_asset_route, ServeConfig, DEFAULT_BIND};

/// Configuration directory name under the home directory.
pub const CONFIG_DIR_NAME: &str = ".fleetdrop";

/// Configuration file name.
pub const CONFIG_FILE_NAME: &str = "config.ini";

/// Payload name used when none is configured.
pub const DEFAULT_PAYLOAD_NAME: &str = "fleetdrop";

/// Errors from loading, saving, or editing the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("unknown configuration key '{0}'")]
    UnknownKey(String),
}

/// `~/.fleetdrop`, or `./.fleetdrop` when there is no home directory.
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_DIR_NAME)
}

/// Path of the configuration file.
pub fn config_file_path() -> PathBuf {
    config_dir().join(CONFIG_FILE_NAME)
}

// =============================================================================
// Sections
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadSection {
    pub name: String,
    pub asset_dir: Option<PathBuf>,
    pub default_asset: String,
    pub config_url: Option<String>,
    pub download_url: Option<String>,
    pub version: Option<String>,
    pub interval_secs: u64,
}

impl Default for PayloadSection {
    fn default() -> Self {
        Self {
            name: DEFAULT_PAYLOAD_NAME.to_string(),
            asset_dir: None,
            default_asset: DEFAULT_ASSET_NAME.to_string(),
            config_url: None,
            download_url: None,
            version: None,
            interval_secs: DEFAULT_REFRESH_INTERVAL.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchSection {
    pub job_timeout_secs: u64,
    pub busy_retry_delay_secs: u64,
    pub max_busy_retries: u32,
    pub correlation_prefix: Option<String>,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            job_timeout_secs: DEFAULT_JOB_TIMEOUT_SECS,
            busy_retry_delay_secs: DEFAULT_BUSY_RETRY_DELAY_SECS,
            max_busy_retries: DEFAULT_MAX_BUSY_RETRIES,
            correlation_prefix: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSection {
    pub bind: SocketAddr,
    pub asset_route: Option<String>,
    pub public_origin: Option<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8088)),
            asset_route: None,
            public_origin: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoggingSection {
    pub directory: Option<PathBuf>,
    pub filter: Option<String>,
}

/// The whole configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigFile {
    pub payload: PayloadSection,
    pub dispatch: DispatchSection,
    pub server: ServerSection,
    pub logging: LoggingSection,
}

impl ConfigFile {
    /// Load from [`config_file_path`].
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&config_file_path())
    }

    /// Load from `path`; a missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let ini = Ini::load_from_file(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let mut config = Self::default();
        for key in ConfigKey::all() {
            if let Some(value) = ini.get_from(Some(key.section()), key.key_name()) {
                key.set(&mut config, value)?;
            }
        }
        Ok(config)
    }

    /// Save to [`config_file_path`].
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&config_file_path())
    }

    /// Write every non-empty setting to `path`, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }

        let mut ini = Ini::new();
        for key in ConfigKey::all() {
            let value = key.get(self);
            if !value.is_empty() {
                ini.with_section(Some(key.section())).set(key.key_name(), value);
            }
        }
        ini.write_to_file(path).map_err(write_err)
    }

    /// Directory the payload's artifacts are published in.
    pub fn asset_dir(&self) -> PathBuf {
        self.payload
            .asset_dir
            .clone()
            .unwrap_or_else(|| config_dir().join("assets").join(&self.payload.name))
    }

    pub fn payload_settings(&self) -> PayloadSettings {
        let p = &self.payload;
        let mut settings = PayloadSettings::new(&p.name, self.asset_dir())
            .with_default_asset(&p.default_asset)
            .with_refresh_interval(Duration::from_secs(p.interval_secs));
        if let Some(url) = &p.config_url {
            settings = settings.with_config_url(url);
        }
        if let Some(url) = &p.download_url {
            settings = settings.with_download_url(url);
        }
        if let Some(version) = &p.version {
            settings = settings.with_version(version);
        }
        settings
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        let d = &self.dispatch;
        DispatchConfig::default()
            .with_job_timeout(Duration::from_secs(d.job_timeout_secs))
            .with_busy_retry(BusyRetryPolicy::new(
                d.max_busy_retries,
                Duration::from_secs(d.busy_retry_delay_secs),
            ))
            .with_correlation_prefix(
                d.correlation_prefix
                    .clone()
                    .unwrap_or_else(|| self.payload.name.clone()),
            )
    }

    pub fn serve_config(&self) -> ServeConfig {
        let route = self
            .server
            .asset_route
            .clone()
            .unwrap_or_else(|| default_asset_route(&self.payload.name));
        let config = ServeConfig::new(self.server.bind, route);
        match &self.server.public_origin {
            Some(origin) => config.with_public_origin(origin),
            None => config,
        }
    }
}

// =============================================================================
// Keys
// =============================================================================

/// Every settable key, addressed as `section.key`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKey {
    PayloadName,
    PayloadAssetDir,
    PayloadDefaultAsset,
    PayloadConfigUrl,
    PayloadDownloadUrl,
    PayloadVersion,
    PayloadIntervalSecs,
    DispatchJobTimeoutSecs,
    DispatchBusyRetryDelaySecs,
    DispatchMaxBusyRetries,
    DispatchCorrelationPrefix,
    ServerBind,
    ServerAssetRoute,
    ServerPublicOrigin,
    LoggingDirectory,
    LoggingFilter,
}

impl ConfigKey {
    pub fn all() -> &'static [ConfigKey] {
        use ConfigKey::*;
        &[
            PayloadName,
            PayloadAssetDir,
            PayloadDefaultAsset,
            PayloadConfigUrl,
            PayloadDownloadUrl,
            PayloadVersion,
            PayloadIntervalSecs,
            DispatchJobTimeoutSecs,
            DispatchBusyRetryDelaySecs,
            DispatchMaxBusyRetries,
            DispatchCorrelationPrefix,
            ServerBind,
            ServerAssetRoute,
            ServerPublicOrigin,
            LoggingDirectory,
            LoggingFilter,
        ]
    }

    pub fn section(&self) -> &'static str {
        use ConfigKey::*;
        match self {
            PayloadName | PayloadAssetDir | PayloadDefaultAsset | PayloadConfigUrl
            | PayloadDownloadUrl | PayloadVersion | PayloadIntervalSecs => "payload",
            DispatchJobTimeoutSecs
            | DispatchBusyRetryDelaySecs
            | DispatchMaxBusyRetries
            | DispatchCorrelationPrefix => "dispatch",
            ServerBind | ServerAssetRoute | ServerPublicOrigin => "server",
            LoggingDirectory | LoggingFilter => "logging",
        }
    }

    pub fn key_name(&self) -> &'static str {
        use ConfigKey::*;
        match self {
            PayloadName => "name",
            PayloadAssetDir => "asset_dir",
            PayloadDefaultAsset => "default_asset",
            PayloadConfigUrl => "config_url",
            PayloadDownloadUrl => "download_url",
            PayloadVersion => "version",
            PayloadIntervalSecs => "interval_secs",
            DispatchJobTimeoutSecs => "job_timeout_secs",
            DispatchBusyRetryDelaySecs => "busy_retry_delay_secs",
            DispatchMaxBusyRetries => "max_busy_retries",
            DispatchCorrelationPrefix => "correlation_prefix",
            ServerBind => "bind",
            ServerAssetRoute => "asset_route",
            ServerPublicOrigin => "public_origin",
            LoggingDirectory => "directory",
            LoggingFilter => "filter",
        }
    }

    /// `section.key`
    pub fn name(&self) -> String {
        format!("{}.{}", self.section(), self.key_name())
    }

    /// Current value as text; empty when unset.
    pub fn get(&self, config: &ConfigFile) -> String {
        use ConfigKey::*;
        let opt = |v: &Option<String>| v.clone().unwrap_or_default();
        let path = |v: &Option<PathBuf>| {
            v.as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default()
        };
        match self {
            PayloadName => config.payload.name.clone(),
            PayloadAssetDir => path(&config.payload.asset_dir),
            PayloadDefaultAsset => config.payload.default_asset.clone(),
            PayloadConfigUrl => opt(&config.payload.config_url),
            PayloadDownloadUrl => opt(&config.payload.download_url),
            PayloadVersion => opt(&config.payload.version),
            PayloadIntervalSecs => config.payload.interval_secs.to_string(),
            DispatchJobTimeoutSecs => config.dispatch.job_timeout_secs.to_string(),
            DispatchBusyRetryDelaySecs => config.dispatch.busy_retry_delay_secs.to_string(),
            DispatchMaxBusyRetries => config.dispatch.max_busy_retries.to_string(),
            DispatchCorrelationPrefix => opt(&config.dispatch.correlation_prefix),
            ServerBind => config.server.bind.to_string(),
            ServerAssetRoute => opt(&config.server.asset_route),
            ServerPublicOrigin => opt(&config.server.public_origin),
            LoggingDirectory => path(&config.logging.directory),
            LoggingFilter => opt(&config.logging.filter),
        }
    }

    /// Parse and store `value`. Empty values clear optional settings.
    pub fn set(&self, config: &mut ConfigFile, value: &str) -> Result<(), ConfigError> {
        use ConfigKey::*;
        let value = value.trim();
        let opt = || (!value.is_empty()).then(|| value.to_string());
        match self {
            PayloadName => config.payload.name = self.non_empty(value)?.to_ascii_lowercase(),
            PayloadAssetDir => config.payload.asset_dir = opt().map(PathBuf::from),
            PayloadDefaultAsset => config.payload.default_asset = self.non_empty(value)?,
            PayloadConfigUrl => config.payload.config_url = opt(),
            PayloadDownloadUrl => config.payload.download_url = opt(),
            PayloadVersion => config.payload.version = opt(),
            PayloadIntervalSecs => config.payload.interval_secs = self.parse(value)?,
            DispatchJobTimeoutSecs => {
                let secs: u64 = self.parse(value)?;
                if secs == 0 {
                    return Err(self.invalid(value, "must be greater than zero"));
                }
                config.dispatch.job_timeout_secs = secs;
            }
            DispatchBusyRetryDelaySecs => {
                config.dispatch.busy_retry_delay_secs = self.parse(value)?;
            }
            DispatchMaxBusyRetries => config.dispatch.max_busy_retries = self.parse(value)?,
            DispatchCorrelationPrefix => config.dispatch.correlation_prefix = opt(),
            ServerBind => {
                config.server.bind = if value.is_empty() {
                    self.parse(DEFAULT_BIND)?
                } else {
                    self.parse(value)?
                }
            }
            ServerAssetRoute => config.server.asset_route = opt(),
            ServerPublicOrigin => config.server.public_origin = opt(),
            LoggingDirectory => config.logging.directory = opt().map(PathBuf::from),
            LoggingFilter => config.logging.filter = opt(),
        }
        Ok(())
    }

    fn parse<T>(&self, value: &str) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        value
            .parse()
            .map_err(|e: T::Err| self.invalid(value, &e.to_string()))
    }

    fn non_empty(&self, value: &str) -> Result<String, ConfigError> {
        if value.is_empty() {
            Err(self.invalid(value, "must not be empty"))
        } else {
            Ok(value.to_string())
        }
    }

    fn invalid(&self, value: &str, reason: &str) -> ConfigError {
        ConfigError::InvalidValue {
            key: self.name(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl FromStr for ConfigKey {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        ConfigKey::all()
            .iter()
            .copied()
            .find(|key| key.name() == wanted)
            .ok_or_else(|| ConfigError::UnknownKey(s.to_string()))
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}
