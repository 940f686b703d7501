//! Configuration file loading for sketchrun
//!
//! Handles loading and parsing configuration files using the config crate.

use std::path::Path;

use config::{Config as ConfigBuilder, Environment, File, FileFormat};

use crate::config::{Config, ConfigError, ENV_PREFIX, EXAMPLE_CONFIG};

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let config = ConfigBuilder::builder()
            .add_source(File::from(path))
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config = ConfigBuilder::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load the layered service configuration.
    ///
    /// Layers, lowest precedence first: the embedded example, the file at
    /// `path` (if given), then `SKETCHRUN__SECTION__KEY` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder =
            ConfigBuilder::builder().add_source(File::from_str(EXAMPLE_CONFIG, FileFormat::Toml));
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let config = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    fn validate(&self) -> Result<(), ConfigError> {
        if self.toolchain.command.is_empty() {
            return Err(ConfigError::Invalid(
                "toolchain has empty compile command".to_owned(),
            ));
        }
        if self.toolchain.source_name == self.toolchain.output_name {
            return Err(ConfigError::Invalid(format!(
                "toolchain source and output share the name '{}'",
                self.toolchain.source_name
            )));
        }
        if self.pool.workers == 0 {
            return Err(ConfigError::Invalid(
                "pool needs at least one worker".to_owned(),
            ));
        }
        if self.harness.loop_iterations == 0 {
            return Err(ConfigError::Invalid(
                "harness loop_iterations must be at least 1".to_owned(),
            ));
        }
        if !(self.server.request_timeout.is_finite() && self.server.request_timeout > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "server request_timeout must be positive, got {}",
                self.server.request_timeout
            )));
        }
        self.server.bind_addr()?;

        for (phase, limits) in [
            ("compile", self.toolchain.effective_limits()),
            ("run", self.run.effective_limits()),
        ] {
            if limits.wall_time().is_none() {
                return Err(ConfigError::Invalid(format!(
                    "{phase} limits need a positive wall_time_limit"
                )));
            }
        }

        for path in &self.confinement.bind {
            if !path.is_absolute() || path.parent().is_none() {
                return Err(ConfigError::Invalid(format!(
                    "confinement bind '{}' must be an absolute path below /",
                    path.display()
                )));
            }
        }

        if self.run.group.is_some() && self.run.user.is_none() {
            return Err(ConfigError::Invalid(
                "run.group requires run.user".to_owned(),
            ));
        }

        Ok(())
    }
}
