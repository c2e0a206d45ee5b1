//! CLI command implementations.

pub mod check_config;
pub mod serve;
pub mod version;

use std::path::Path;

use anyhow::{Context, Result};
use weft_config::{ConfigLoader, WeftConfig};

/// Loads layered configuration from `dir`, or the current directory.
fn load_config(dir: Option<&Path>) -> Result<WeftConfig> {
    let loader = match dir {
        Some(dir) => ConfigLoader::new().with_project_dir(dir),
        None => ConfigLoader::new(),
    };
    loader.load().context("failed to load configuration")
}
