//! Endpoint identifiers.
//!
//! Endpoints are addressed by namespaced node identifiers of the form
//! `node/<domain>/<id>`. The domain segment may be empty (the default
//! domain), the id may not.

use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};

use super::error::DispatchError;

/// Namespace every endpoint identifier starts with.
pub const NODE_PREFIX: &str = "node/";

/// A structurally validated endpoint identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(String);

impl EndpointId {
    /// Validate and wrap a raw identifier.
    pub fn parse(raw: &str) -> Result<Self, DispatchError> {
        let invalid = || DispatchError::InvalidEndpoint(raw.to_string());

        let rest = raw.strip_prefix(NODE_PREFIX).ok_or_else(invalid)?;
        let (_domain, id) = rest.split_once('/').ok_or_else(invalid)?;
        if id.is_empty() || raw.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(invalid());
        }
        Ok(Self(raw.to_string()))
    }

    /// Domain segment (may be empty).
    pub fn domain(&self) -> &str {
        self.0[NODE_PREFIX.len()..]
            .split_once('/')
            .map(|(domain, _)| domain)
            .unwrap_or_default()
    }

    /// The full identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for EndpointId {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for EndpointId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Serialize for EndpointId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}
