//! Configuration loading via `ortho-config`.

use std::str::FromStr;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Harness settings derived from defaults, configuration files and
/// `TERRASTAGE_*` environment variables.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "TERRASTAGE",
    discovery(
        app_name = "terrastage",
        env_var = "TERRASTAGE_CONFIG_PATH",
        config_file_name = "terrastage.toml",
        dotfile_name = ".terrastage.toml",
        project_file_name = "terrastage.toml"
    )
)]
pub struct HarnessConfig {
    /// Provisioning executable. Defaults to `terraform`; set `tofu` to drive
    /// OpenTofu instead.
    #[ortho_config(default = "terraform".to_owned())]
    pub terraform_bin: String,
    /// AWS command line executable used for key pair management.
    #[ortho_config(default = "aws".to_owned())]
    pub aws_bin: String,
    /// Retries allowed after a transient provisioning failure.
    #[ortho_config(default = 3)]
    pub max_retries: u32,
    /// Seconds to wait between provisioning attempts.
    #[ortho_config(default = 5)]
    pub retry_interval_secs: u32,
    /// Log level used when `RUST_LOG` is unset.
    #[ortho_config(default = "info".to_owned())]
    pub log_level: String,
    /// Log output format: `pretty`, `compact` or `json`.
    #[ortho_config(default = "pretty".to_owned())]
    pub log_format: String,
}

impl HarnessConfig {
    /// Returns the built-in defaults without consulting any source.
    #[must_use]
    pub fn built_in() -> Self {
        Self {
            terraform_bin: String::from("terraform"),
            aws_bin: String::from("aws"),
            max_retries: 3,
            retry_interval_secs: 5,
            log_level: String::from("info"),
            log_format: String::from("pretty"),
        }
    }
}

/// Output formats supported by the log subscriber.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogFormat {
    /// Multi-line human readable output.
    Pretty,
    /// Single-line human readable output.
    Compact,
    /// Newline-delimited JSON.
    Json,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::InvalidField(format!(
                "unsupported log format '{other}': set TERRASTAGE_LOG_FORMAT or log_format \
                 in terrastage.toml to pretty, compact or json"
            ))),
        }
    }
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }
}

impl HarnessConfig {
    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: set {} or add {} to terrastage.toml",
                metadata.description, metadata.env_var, metadata.toml_key
            )));
        }
        Ok(())
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// merge defaults, configuration files and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("terrastage")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Returns the parsed log format.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidField`] for unknown formats.
    pub fn parsed_log_format(&self) -> Result<LogFormat, ConfigError> {
        self.log_format.parse()
    }

    /// Performs semantic validation. Error messages explain how to supply
    /// the value via environment variables or the configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty
    /// and [`ConfigError::InvalidField`] when the log format is unknown.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_field(
            &self.terraform_bin,
            &FieldMetadata::new(
                "provisioning executable",
                "TERRASTAGE_TERRAFORM_BIN",
                "terraform_bin",
            ),
        )?;
        Self::require_field(
            &self.aws_bin,
            &FieldMetadata::new("AWS CLI executable", "TERRASTAGE_AWS_BIN", "aws_bin"),
        )?;
        Self::require_field(
            &self.log_level,
            &FieldMetadata::new("log level", "TERRASTAGE_LOG_LEVEL", "log_level"),
        )?;
        self.parsed_log_format()?;
        Ok(())
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a configuration field holds an unsupported value.
    #[error("invalid configuration field: {0}")]
    InvalidField(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
