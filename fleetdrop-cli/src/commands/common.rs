//! Common helpers shared across CLI commands.

use fleetdrop::config::{ConfigFile, ConfigKey};

use crate::error::CliError;
use crate::PayloadArgs;

/// Apply command-line payload overrides on top of the loaded config.
///
/// CLI takes precedence over config.ini.
pub fn resolve_config(config: &ConfigFile, args: &PayloadArgs) -> Result<ConfigFile, CliError> {
    let mut resolved = config.clone();
    if let Some(name) = &args.payload {
        ConfigKey::PayloadName.set(&mut resolved, name)?;
    }
    if let Some(dir) = &args.asset_dir {
        resolved.payload.asset_dir = Some(dir.clone());
    }
    if let Some(url) = &args.config_url {
        ConfigKey::PayloadConfigUrl.set(&mut resolved, url)?;
    }
    if let Some(url) = &args.download_url {
        ConfigKey::PayloadDownloadUrl.set(&mut resolved, url)?;
    }
    Ok(resolved)
}

/// Build the multi-threaded runtime commands run on.
pub fn runtime() -> Result<tokio::runtime::Runtime, CliError> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(CliError::Runtime)
}

/// Human-readable byte count.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_cli_overrides_config() {
        let config = ConfigFile::default();
        let args = PayloadArgs {
            payload: Some("STFDeploy".to_string()),
            download_url: Some("https://example.com/b.zip".to_string()),
            ..Default::default()
        };
        let resolved = resolve_config(&config, &args).unwrap();
        assert_eq!(resolved.payload.name, "stfdeploy");
        assert_eq!(
            resolved.payload.download_url.as_deref(),
            Some("https://example.com/b.zip")
        );
        assert_eq!(resolved.payload.config_url, None);
    }
}
