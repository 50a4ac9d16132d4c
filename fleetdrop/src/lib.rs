//! Fleetdrop - payload distribution for managed endpoint fleets
//!
//! This library keeps a deployment artifact in sync with a remote source and
//! dispatches commands to remote agents, one at a time per endpoint.
//!
//! - [`acquisition`]: download, verify and publish the current artifact
//! - [`dispatch`]: per-endpoint FIFO command queue with reply correlation
//! - [`serve`]: HTTP route endpoints download the artifact from
//! - [`service`]: caller actions (deploy, undeploy, status, info, custom)

pub mod acquisition;
pub mod config;
pub mod dispatch;
pub mod logging;
pub mod serve;
pub mod service;

/// Crate version, also sent in the fetcher's `User-Agent`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
