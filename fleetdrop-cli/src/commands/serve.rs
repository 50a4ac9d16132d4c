//! Serve command - keep the artifact fresh and serve it until Ctrl-C.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use fleetdrop::acquisition::{ArtifactCatalog, HttpFetcher, PayloadUpdater};
use fleetdrop::config::{ConfigFile, ConfigKey};
use fleetdrop::serve::{router, serve};

use super::common::{resolve_config, runtime};
use crate::error::CliError;
use crate::PayloadArgs;

/// Arguments for the serve command.
pub struct ServeArgs {
    pub payload: PayloadArgs,
    pub bind: Option<String>,
    pub no_refresh: bool,
}

/// Run the serve command.
pub fn run(config: &ConfigFile, args: ServeArgs) -> Result<(), CliError> {
    let mut config = resolve_config(config, &args.payload)?;
    if let Some(bind) = &args.bind {
        ConfigKey::ServerBind.set(&mut config, bind)?;
    }

    let settings = config.payload_settings();
    let serve_config = config.serve_config();

    println!("Fleetdrop {}", fleetdrop::VERSION);
    println!("  Payload:   {}", settings.name);
    println!("  Asset dir: {}", settings.asset_dir.display());
    println!(
        "  Listening: http://{}{}/<file>",
        serve_config.bind, serve_config.asset_route
    );
    if let Some(origin) = &serve_config.public_origin {
        println!("  Public:    {}", origin);
    }
    println!();
    println!("Press Ctrl-C to stop.");

    runtime()?.block_on(async move {
        let catalog = Arc::new(ArtifactCatalog::open(&settings).await);
        let shutdown = CancellationToken::new();

        let updater = if args.no_refresh {
            None
        } else {
            let fetcher = Arc::new(HttpFetcher::new()?);
            let updater = Arc::new(
                PayloadUpdater::new(settings, fetcher).with_observer(catalog.clone()),
            );
            let task = updater.start();
            Some((updater, task))
        };

        let signal_token = shutdown.clone();
        ctrlc::set_handler(move || {
            println!();
            println!("Received shutdown signal, stopping...");
            info!("Shutdown requested");
            signal_token.cancel();
        })
        .map_err(|e| CliError::Config(format!("Failed to set signal handler: {}", e)))?;

        let result = serve(router(catalog, &serve_config), &serve_config, shutdown).await;

        if let Some((updater, task)) = updater {
            updater.stop();
            if let Err(e) = task.await {
                warn!(error = %e, "Refresh task ended abnormally");
            }
        }
        result.map_err(CliError::from)
    })
}
