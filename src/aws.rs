//! AWS helpers used by the setup and teardown stages.
//!
//! Region selection is local. Key pair management shells out to the `aws`
//! command line tool so the harness needs no SDK and reuses whatever
//! credentials the developer or CI job already configured.

use std::io::Write;

use rand::Rng;
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::command::{CommandError, CommandOutput, CommandRunner, CommandSpec, ProcessCommandRunner};
use crate::config::HarnessConfig;
use crate::key_pair::{KeyPair, KeyPairError, RegisteredKeyPair};

/// Default AWS CLI binary name.
pub const DEFAULT_AWS_BIN: &str = "aws";

/// Regions with broad service coverage and a long track record.
pub const STABLE_REGIONS: &[&str] = &[
    "us-east-1",
    "us-east-2",
    "us-west-1",
    "us-west-2",
    "eu-west-1",
    "eu-west-2",
    "eu-west-3",
    "eu-central-1",
    "ap-southeast-1",
    "ap-southeast-2",
    "ap-northeast-1",
    "ap-northeast-2",
    "ap-south-1",
    "ca-central-1",
    "sa-east-1",
];

/// Errors returned by the AWS helpers.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum AwsError {
    /// Raised when the forbidden list excludes every candidate region.
    #[error("no region left to choose from {candidates} candidates after excluding {forbidden:?}")]
    NoRegionAvailable {
        /// Number of candidate regions considered.
        candidates: usize,
        /// Regions that were excluded.
        forbidden: Vec<String>,
    },
    /// Raised when `aws` returns a non-zero exit status.
    #[error("{program} exited with status {status_text}: {stderr}")]
    CommandFailure {
        /// Program that failed.
        program: String,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the command.
        stderr: String,
    },
    /// Raised when JSON output from the CLI cannot be parsed.
    #[error("failed to parse {operation} output: {message}")]
    Parse {
        /// CLI operation whose output was parsed.
        operation: String,
        /// Parser error message.
        message: String,
    },
    /// Raised when the public key cannot be staged for the CLI.
    #[error("failed to stage public key material: {message}")]
    Material {
        /// I/O error message.
        message: String,
    },
    /// Raised when key material cannot be generated.
    #[error(transparent)]
    KeyPair(#[from] KeyPairError),
    /// Raised when command execution fails.
    #[error(transparent)]
    Runner(#[from] CommandError),
}

/// Picks a region uniformly at random.
///
/// Candidates are `approved`, or [`STABLE_REGIONS`] when `approved` is
/// empty, minus every region in `forbidden`.
///
/// # Errors
///
/// Returns [`AwsError::NoRegionAvailable`] when no candidate remains.
pub fn random_stable_region(approved: &[&str], forbidden: &[&str]) -> Result<String, AwsError> {
    let candidates = if approved.is_empty() {
        STABLE_REGIONS
    } else {
        approved
    };
    let allowed: Vec<&str> = candidates
        .iter()
        .copied()
        .filter(|region| !forbidden.contains(region))
        .collect();

    let picked = if allowed.is_empty() {
        None
    } else {
        allowed.get(rand::rng().random_range(0..allowed.len()))
    };
    picked
        .map(|region| (*region).to_owned())
        .ok_or_else(|| AwsError::NoRegionAvailable {
            candidates: candidates.len(),
            forbidden: forbidden.iter().map(|region| (*region).to_owned()).collect(),
        })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ImportKeyPairResponse {
    key_name: String,
    #[serde(default)]
    key_pair_id: Option<String>,
}

/// Registers and deletes EC2 key pairs by shelling out to `aws`.
#[derive(Clone, Debug)]
pub struct AwsKeyPairs<R: CommandRunner> {
    aws_bin: String,
    runner: R,
}

impl AwsKeyPairs<ProcessCommandRunner> {
    /// Creates a client wired to the real process runner.
    #[must_use]
    pub fn with_process_runner(config: &HarnessConfig) -> Self {
        Self::new(config.aws_bin.clone(), ProcessCommandRunner)
    }
}

impl<R: CommandRunner> AwsKeyPairs<R> {
    /// Creates a client invoking `aws_bin` through `runner`.
    #[must_use]
    pub fn new(aws_bin: impl Into<String>, runner: R) -> Self {
        Self {
            aws_bin: aws_bin.into(),
            runner,
        }
    }

    /// Returns the underlying runner.
    #[must_use]
    pub const fn runner(&self) -> &R {
        &self.runner
    }

    /// Imports the public half of `key_pair` under `name`.
    ///
    /// The OpenSSH public key line is handed to the CLI through a
    /// `fileb://` temporary file, which both major CLI versions upload
    /// verbatim.
    ///
    /// # Errors
    ///
    /// Returns [`AwsError`] when the CLI fails or its output cannot be
    /// parsed.
    pub fn import(
        &self,
        region: &str,
        name: &str,
        key_pair: KeyPair,
    ) -> Result<RegisteredKeyPair, AwsError> {
        let material = stage_public_key(&key_pair)?;
        let material_arg = format!("fileb://{}", material.path().display());
        let output = self.run(
            CommandSpec::new(self.aws_bin.as_str()).args([
                "ec2",
                "import-key-pair",
                "--region",
                region,
                "--key-name",
                name,
                "--public-key-material",
                material_arg.as_str(),
                "--output",
                "json",
            ]),
        )?;
        drop(material);
        let response: ImportKeyPairResponse =
            serde_json::from_str(&output.stdout).map_err(|err| AwsError::Parse {
                operation: String::from("import-key-pair"),
                message: err.to_string(),
            })?;

        info!(region, name = %response.key_name, "imported EC2 key pair");
        Ok(RegisteredKeyPair {
            name: response.key_name,
            region: region.to_owned(),
            key_pair_id: response.key_pair_id,
            key_pair,
        })
    }

    /// Generates a fresh key pair and imports it under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`AwsError`] when key generation or the import fails.
    pub fn create_and_import(
        &self,
        region: &str,
        name: &str,
    ) -> Result<RegisteredKeyPair, AwsError> {
        let key_pair = KeyPair::generate()?;
        self.import(region, name, key_pair)
    }

    /// Deletes a previously imported key pair.
    ///
    /// # Errors
    ///
    /// Returns [`AwsError`] when the CLI fails.
    pub fn delete(&self, key_pair: &RegisteredKeyPair) -> Result<(), AwsError> {
        self.run(CommandSpec::new(self.aws_bin.as_str()).args([
            "ec2",
            "delete-key-pair",
            "--region",
            key_pair.region.as_str(),
            "--key-name",
            key_pair.name.as_str(),
        ]))?;
        info!(region = %key_pair.region, name = %key_pair.name, "deleted EC2 key pair");
        Ok(())
    }

    fn run(&self, spec: CommandSpec) -> Result<CommandOutput, AwsError> {
        let output = self.runner.run(&spec)?;
        if output.is_success() {
            return Ok(output);
        }
        Err(AwsError::CommandFailure {
            program: spec.program,
            status_text: output.status_text(),
            stderr: output.stderr.trim().to_owned(),
        })
    }
}

fn stage_public_key(key_pair: &KeyPair) -> Result<tempfile::NamedTempFile, AwsError> {
    let to_error = |err: std::io::Error| AwsError::Material {
        message: err.to_string(),
    };
    let mut file = tempfile::Builder::new()
        .prefix("terrastage-key-")
        .suffix(".pub")
        .tempfile()
        .map_err(to_error)?;
    file.write_all(key_pair.public_key.as_bytes())
        .map_err(to_error)?;
    file.flush().map_err(to_error)?;
    Ok(file)
}
