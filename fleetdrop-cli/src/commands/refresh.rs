//! Refresh command - run one acquisition cycle.

use std::sync::Arc;

use fleetdrop::acquisition::{HttpFetcher, PayloadUpdater, RefreshOutcome};
use fleetdrop::config::ConfigFile;

use super::common::{resolve_config, runtime};
use crate::error::CliError;
use crate::PayloadArgs;

/// Run the refresh command.
pub fn run(config: &ConfigFile, args: &PayloadArgs) -> Result<(), CliError> {
    let config = resolve_config(config, args)?;
    let settings = config.payload_settings();

    println!("Payload:   {}", settings.name);
    println!("Asset dir: {}", settings.asset_dir.display());
    println!();

    let fetcher = Arc::new(HttpFetcher::new()?);
    let updater = PayloadUpdater::new(settings, fetcher);
    let outcome = runtime()?.block_on(updater.refresh_once());

    match outcome {
        RefreshOutcome::Installed(asset) => {
            println!("Installed {}", asset.path.display());
            println!("  SHA-256: {}", asset.sha256);
            if let Some(version) = &asset.version {
                println!("  Version: {}", version);
            }
            println!("  Source:  {}", asset.source);
            Ok(())
        }
        RefreshOutcome::Unchanged => {
            println!("Artifact is up to date.");
            Ok(())
        }
        RefreshOutcome::Idle => {
            println!("No download URL configured; nothing to fetch.");
            Ok(())
        }
        RefreshOutcome::Disabled => {
            println!("Auto-update is disabled.");
            Ok(())
        }
        RefreshOutcome::Skipped => {
            println!("Another refresh is already running.");
            Ok(())
        }
        RefreshOutcome::Failed(reason) => Err(CliError::Refresh(reason)),
    }
}
