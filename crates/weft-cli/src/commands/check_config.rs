//! Check-config command - validates layered configuration without serving.

use std::path::Path;

use anyhow::{Context, Result};

use super::load_config;

pub fn run(dir: Option<&Path>) -> Result<()> {
    let config = load_config(dir)?;
    config.validate()?;

    let rendered = toml::to_string_pretty(&config).context("failed to render configuration")?;
    println!("Configuration OK.");
    println!();
    print!("{rendered}");
    Ok(())
}
