//! Configuration loader with multi-source merging

use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::{Paths, WeftConfig};

/// Builds a [`WeftConfig`] from defaults, files and the environment.
pub struct ConfigLoader {
    project_dir: PathBuf,
    env_prefix: String,
    include_user_config: bool,
    env_source: Option<config::Map<String, String>>,
}

impl ConfigLoader {
    /// Uses the current directory as the project directory.
    pub fn new() -> Self {
        Self {
            project_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env_prefix: "WEFT".to_string(),
            include_user_config: true,
            env_source: None,
        }
    }

    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.project_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Sets the environment variable prefix (default: "WEFT").
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Skips `~/.config/weft/config.toml`.
    pub fn without_user_config(mut self) -> Self {
        self.include_user_config = false;
        self
    }

    /// Reads variables from `vars` instead of the process environment.
    pub fn with_env_source(mut self, vars: config::Map<String, String>) -> Self {
        self.env_source = Some(vars);
        self
    }

    /// Loads configuration from all sources with proper precedence, then
    /// resolves relative certificate paths against the project directory.
    pub fn load(self) -> Result<WeftConfig> {
        let mut builder = config::Config::builder();

        // 1. Built-in defaults
        let defaults = WeftConfig::default();
        builder = builder.add_source(config::Config::try_from(&defaults)?);

        // 2. User config
        if self.include_user_config {
            if let Ok(user_config_file) = Paths::new().user_config_file() {
                if user_config_file.exists() {
                    builder = builder.add_source(toml_file(user_config_file));
                }
            }
        }

        // 3. Project config (weft.toml)
        let project_config_file = Paths::project_config_file(&self.project_dir);
        if project_config_file.exists() {
            builder = builder.add_source(toml_file(project_config_file));
        }

        // 4. Local overrides (weft.local.toml)
        let local_config_file = Paths::local_config_file(&self.project_dir);
        if local_config_file.exists() {
            builder = builder.add_source(toml_file(local_config_file));
        }

        // 5. Environment (WEFT_SERVER__MAX_CONNECTIONS)
        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .source(self.env_source),
        );

        let config = builder.build().context("failed to build configuration")?;

        let mut weft_config: WeftConfig = config
            .try_deserialize()
            .context("failed to deserialize configuration")?;

        weft_config.resolve_paths(&self.project_dir);

        Ok(weft_config)
    }

    /// Falls back to defaults when any source is unreadable.
    pub fn load_or_default(self) -> WeftConfig {
        self.load().unwrap_or_default()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn toml_file(path: PathBuf) -> impl config::Source + Send + Sync + 'static {
    config::File::from(path)
        .required(false)
        .format(config::FileFormat::Toml)
}
