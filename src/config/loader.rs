use super::types::ComplianceConfig;
use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use std::path::{Path, PathBuf};

const ENV_PREFIX: &str = "PRIVACY";

/// Configuration loader with builder pattern
pub struct ConfigLoader {
    config_file: Option<PathBuf>,
    load_env: bool,
    region_table: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self {
            config_file: None,
            load_env: false,
            region_table: None,
        }
    }

    /// Load configuration from file
    pub fn load_from_file(mut self, path: Option<&Path>) -> Self {
        self.config_file = path.map(Path::to_path_buf);
        self
    }

    /// Load configuration from environment variables (`PRIVACY__ENGINE__REMOTE_TIMEOUT_MS`, ...)
    pub fn load_from_env(mut self) -> Self {
        self.load_env = true;
        self
    }

    /// Override the region table path, e.g. from a CLI flag
    pub fn with_region_table(mut self, path: Option<&Path>) -> Self {
        self.region_table = path.map(Path::to_path_buf);
        self
    }

    /// Build the final configuration
    pub fn build(self) -> Result<ComplianceConfig> {
        let mut builder =
            Config::builder().add_source(Config::try_from(&ComplianceConfig::default())?);

        if let Some(config_path) = &self.config_file {
            // an explicit path must exist
            builder = builder.add_source(
                File::from(config_path.as_path())
                    .format(FileFormat::Toml)
                    .required(true),
            );
        } else {
            builder = builder
                .add_source(File::with_name("privacy-compliance").required(false))
                .add_source(File::with_name("config/privacy-compliance").required(false));
        }

        if self.load_env {
            builder = builder.add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let mut config: ComplianceConfig = builder
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        if let Some(table) = self.region_table {
            config.policy.region_table = Some(table);
        }

        Ok(config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
