//! `fleetdrop config` - inspect and edit config.ini.
//!
//! `list` also reports the `FLEETDROP_*` environment overrides that are in
//! effect for the configured payload, since those shadow the file at
//! refresh time.

use clap::Subcommand;
use fleetdrop::acquisition::{EnvOverrides, ENV_PREFIX};
use fleetdrop::config::{config_file_path, ConfigFile, ConfigKey};

use crate::error::CliError;

#[derive(Debug, Subcommand)]
pub enum ConfigCommands {
    /// Print one value
    Get {
        /// Key as section.key (e.g. payload.config_url, dispatch.max_busy_retries)
        key: String,
    },

    /// Write one value to config.ini
    Set {
        /// Key as section.key
        key: String,

        /// New value
        value: String,
    },

    /// Reset a key to its default
    Unset {
        /// Key as section.key
        key: String,
    },

    /// Show effective settings and active environment overrides
    List {
        /// Only show one section (payload, dispatch, server, logging)
        #[arg(long)]
        section: Option<String>,
    },

    /// Print the config.ini location
    Path,
}

pub fn run(command: ConfigCommands) -> Result<(), CliError> {
    match command {
        ConfigCommands::Get { key } => {
            let config = ConfigFile::load()?;
            let value = parse_key(&key)?.get(&config);
            println!("{}", display_value(&value));
            Ok(())
        }
        ConfigCommands::Set { key, value } => update(&key, &value),
        ConfigCommands::Unset { key } => update(&key, ""),
        ConfigCommands::List { section } => list(section.as_deref()),
        ConfigCommands::Path => {
            println!("{}", config_file_path().display());
            Ok(())
        }
    }
}

fn parse_key(key: &str) -> Result<ConfigKey, CliError> {
    key.parse().map_err(|_| {
        CliError::Config(format!(
            "Unknown configuration key '{}'. Run 'fleetdrop config list' for the full set.",
            key
        ))
    })
}

fn update(key: &str, value: &str) -> Result<(), CliError> {
    let config_key = parse_key(key)?;
    let mut config = ConfigFile::load()?;
    config_key.set(&mut config, value)?;
    config.save()?;

    println!(
        "{} = {}",
        config_key.name(),
        display_value(&config_key.get(&config))
    );
    Ok(())
}

fn list(section: Option<&str>) -> Result<(), CliError> {
    let keys = keys_in_section(section)?;
    let config = ConfigFile::load()?;

    println!("{}", config_file_path().display());

    let mut current = "";
    for key in keys {
        if key.section() != current {
            current = key.section();
            println!();
            println!("[{}]", current);
        }
        println!(
            "  {:<22} {}",
            key.key_name(),
            display_value(&key.get(&config))
        );
    }

    if section.is_none() || section == Some("payload") {
        let rows = override_rows(&EnvOverrides::from_env(&config.payload.name));
        if !rows.is_empty() {
            println!();
            println!("Environment overrides ({}_*)", ENV_PREFIX);
            for (name, value) in rows {
                println!("  {:<22} {}", name, value);
            }
        }
    }
    Ok(())
}

fn display_value(value: &str) -> &str {
    if value.is_empty() {
        "(not set)"
    } else {
        value
    }
}

fn keys_in_section(section: Option<&str>) -> Result<Vec<ConfigKey>, CliError> {
    let keys: Vec<ConfigKey> = ConfigKey::all()
        .iter()
        .copied()
        .filter(|k| section.map_or(true, |s| k.section().eq_ignore_ascii_case(s)))
        .collect();
    if keys.is_empty() {
        return Err(CliError::Config(format!(
            "Unknown section '{}'. Sections: payload, dispatch, server, logging.",
            section.unwrap_or_default()
        )));
    }
    Ok(keys)
}

/// Overrides that will shadow config.ini on the next refresh.
fn override_rows(env: &EnvOverrides) -> Vec<(&'static str, String)> {
    let mut rows = Vec::new();
    if env.globally_disabled {
        rows.push(("autoupdate", "off (global kill switch)".to_string()));
    } else if env.payload_disabled {
        rows.push(("autoupdate", "off".to_string()));
    }
    if let Some(url) = &env.config_url {
        rows.push(("payload.config_url", url.clone()));
    }
    if let Some(url) = &env.download_url {
        rows.push(("payload.download_url", url.clone()));
    }
    if let Some(auth) = &env.authorization {
        rows.push(("authorization", redact_auth(auth)));
    }
    if !env.headers.is_empty() {
        let names: Vec<&str> = env.headers.keys().map(String::as_str).collect();
        rows.push(("headers", names.join(", ")));
    }
    rows
}

fn redact_auth(value: &str) -> String {
    match value.split_once(' ') {
        Some((scheme, _)) => format!("{} ****", scheme),
        None => "****".to_string(),
    }
}
