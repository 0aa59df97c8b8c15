//! CLI command implementations.

use anyhow::{Context, Result};
use std::io::Write;

use crate::config::ClientConfig;

pub mod config;
mod fetch;

pub use fetch::{FetchSpec, fetch, parse_header_pair, parse_query_pair};

/// Prints the effective configuration as JSON.
pub fn show_config<W: Write>(config: &ClientConfig, out: &mut W) -> Result<()> {
    serde_json::to_writer_pretty(&mut *out, config).context("Failed to serialize configuration")?;
    writeln!(out).context("Failed to write output")?;
    Ok(())
}
