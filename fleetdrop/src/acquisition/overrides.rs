//! Environment overrides for payload acquisition.
//!
//! Every key is looked up first under a payload-scoped name and then under
//! the unscoped global name:
//!
//! ```text
//! FLEETDROP_<PAYLOAD>_<KEY>   e.g. FLEETDROP_STFDEPLOY_DOWNLOAD_URL
//! FLEETDROP_<KEY>             e.g. FLEETDROP_DOWNLOAD_URL
//! ```
//!
//! Keys: `AUTOUPDATE`, `CONFIG_URL`, `DOWNLOAD_URL`, `TOKEN`, `HEADERS`.
//! `FLEETDROP_AUTOUPDATE` is also a global kill switch that a scoped value
//! cannot re-enable.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use tracing::warn;

use super::fetch::RequestHeaders;

/// Prefix shared by all environment override names.
pub const ENV_PREFIX: &str = "FLEETDROP";

static FALSEY_TOGGLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(0|false|no|off)$").expect("valid toggle regex"));

static AUTH_SCHEME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(token|basic|bearer)\s+").expect("valid scheme regex"));

/// Overrides read from the process environment for one managed payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    /// Global kill switch is off.
    pub globally_disabled: bool,
    /// Payload-scoped (or global fallback) toggle is off.
    pub payload_disabled: bool,
    /// Replacement remote config URL.
    pub config_url: Option<String>,
    /// Replacement download URL.
    pub download_url: Option<String>,
    /// Normalised `Authorization` header value.
    pub authorization: Option<String>,
    /// Extra request headers.
    pub headers: RequestHeaders,
}

impl EnvOverrides {
    /// Read overrides for `payload` from the process environment.
    pub fn from_env(payload: &str) -> Self {
        Self::from_lookup(payload, |name| std::env::var(name).ok())
    }

    /// Read overrides through an arbitrary lookup function.
    pub fn from_lookup<F>(payload: &str, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let scoped_prefix = format!("{}_{}_", ENV_PREFIX, scope_name(payload));
        let get = |key: &str| {
            lookup(&format!("{}{}", scoped_prefix, key))
                .or_else(|| lookup(&format!("{}_{}", ENV_PREFIX, key)))
        };
        let non_empty = |key: &str| {
            get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let global_toggle = lookup(&format!("{}_AUTOUPDATE", ENV_PREFIX));

        Self {
            globally_disabled: global_toggle.as_deref().is_some_and(is_falsey_toggle),
            payload_disabled: get("AUTOUPDATE").as_deref().is_some_and(is_falsey_toggle),
            config_url: non_empty("CONFIG_URL"),
            download_url: non_empty("DOWNLOAD_URL"),
            authorization: non_empty("TOKEN").map(|t| normalize_auth(&t)),
            headers: non_empty("HEADERS")
                .map(|raw| parse_headers(&raw))
                .unwrap_or_default(),
        }
    }

    /// True if either toggle disables auto-update.
    pub fn is_disabled(&self) -> bool {
        self.globally_disabled || self.payload_disabled
    }

    /// Base request headers: authorization plus custom headers.
    pub fn base_headers(&self) -> RequestHeaders {
        let mut headers = RequestHeaders::new();
        if let Some(auth) = &self.authorization {
            headers.insert("Authorization".to_string(), auth.clone());
        }
        headers.extend(self.headers.iter().map(|(k, v)| (k.clone(), v.clone())));
        headers
    }
}

/// Environment-safe upper-case form of a payload short name.
pub fn scope_name(payload: &str) -> String {
    payload
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Returns true for `0`, `false`, `no` or `off` (case-insensitive, trimmed).
pub fn is_falsey_toggle(value: &str) -> bool {
    FALSEY_TOGGLE.is_match(value.trim())
}

/// Prefix bare tokens with the `token` scheme.
pub fn normalize_auth(token: &str) -> String {
    let trimmed = token.trim();
    if AUTH_SCHEME.is_match(trimmed) {
        trimmed.to_string()
    } else {
        format!("token {}", trimmed)
    }
}

fn parse_headers(raw: &str) -> RequestHeaders {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map
            .into_iter()
            .filter_map(|(k, v)| match v {
                Value::String(s) => Some((k, s)),
                Value::Number(n) => Some((k, n.to_string())),
                Value::Bool(b) => Some((k, b.to_string())),
                _ => None,
            })
            .collect(),
        Ok(_) => {
            warn!("Custom headers override is not a JSON object; ignoring");
            RequestHeaders::new()
        }
        Err(e) => {
            warn!(error = %e, "Failed to parse custom headers JSON; ignoring");
            RequestHeaders::new()
        }
    }
}
