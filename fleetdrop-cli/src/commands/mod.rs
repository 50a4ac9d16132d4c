//! CLI subcommands.

pub mod common;
pub mod config;
pub mod info;
pub mod refresh;
pub mod serve;
