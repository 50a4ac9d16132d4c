//! Info command - show the published artifact.

use fleetdrop::acquisition::ArtifactCatalog;
use fleetdrop::config::ConfigFile;

use super::common::{format_size, resolve_config, runtime};
use crate::error::CliError;
use crate::PayloadArgs;

/// Run the info command.
pub fn run(
    config: &ConfigFile,
    args: &PayloadArgs,
    json: bool,
    rehash: bool,
) -> Result<(), CliError> {
    let config = resolve_config(config, args)?;
    let settings = config.payload_settings();
    let meta = runtime()?.block_on(async {
        ArtifactCatalog::open(&settings).await.metadata(rehash).await
    });

    if json {
        let text = serde_json::to_string_pretty(&meta)
            .map_err(|e| CliError::Config(e.to_string()))?;
        println!("{}", text);
        return Ok(());
    }

    println!("Payload: {}", settings.name);
    println!("=========={}", "=".repeat(settings.name.len()));
    if !meta.available {
        println!("No artifact published in {}", settings.asset_dir.display());
        return Ok(());
    }

    let show = |label: &str, value: Option<String>| {
        println!("  {:<14} {}", label, value.unwrap_or_else(|| "(unknown)".to_string()));
    };
    show("File:", meta.name.clone());
    show("Size:", meta.size.map(format_size));
    show("SHA-256:", meta.sha256.clone());
    show("Version:", meta.version.clone());
    show("Source:", meta.source.clone());
    show("Modified:", meta.modified.map(|t| t.to_rfc3339()));
    show("Downloaded:", meta.downloaded_at.map(|t| t.to_rfc3339()));
    show("Last checked:", meta.last_checked.map(|t| t.to_rfc3339()));
    Ok(())
}
