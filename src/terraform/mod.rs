//! Provisioning driver.
//!
//! [`Terraform`] turns [`TerraformOptions`] into command lines for the
//! provisioning executable and runs them through a [`CommandRunner`].
//! Failures whose output matches one of the configured retryable patterns
//! are retried after a pause; anything else fails immediately.

mod options;

use std::thread;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::command::{CommandError, CommandRunner, CommandSpec, ProcessCommandRunner};
use crate::plan::{Plan, PlanError, parse_plan};

pub use options::{
    DEFAULT_MAX_RETRIES, DEFAULT_RETRYABLE_ERRORS, DEFAULT_TERRAFORM_BINARY,
    DEFAULT_TIME_BETWEEN_RETRIES, TerraformOptions,
};

/// Errors raised by [`Terraform`].
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TerraformError {
    /// The executable could not be started.
    #[error(transparent)]
    Spawn(#[from] CommandError),
    /// The command failed with output that matched no retryable pattern.
    #[error("`{command}` failed with status {status}: {stderr}")]
    CommandFailed {
        /// Command line that failed.
        command: String,
        /// Exit status text.
        status: String,
        /// Captured standard error.
        stderr: String,
    },
    /// Every attempt failed with a retryable error.
    #[error("`{command}` still failing after {attempts} attempts ({reason}): {stderr}")]
    RetriesExhausted {
        /// Command line that failed.
        command: String,
        /// Attempts made, including the first.
        attempts: u32,
        /// Description of the last matched retryable error.
        reason: String,
        /// Standard error of the last attempt.
        stderr: String,
    },
    /// A retryable error pattern is not a valid regular expression.
    #[error("invalid retryable error pattern '{pattern}': {message}")]
    InvalidRetryPattern {
        /// Offending pattern.
        pattern: String,
        /// Regex compiler message.
        message: String,
    },
    /// An output value was not valid JSON.
    #[error("output '{name}' is not valid JSON: {message}")]
    InvalidOutput {
        /// Output name.
        name: String,
        /// Decoder error message.
        message: String,
    },
    /// A plan operation was requested without a plan file.
    #[error("no plan file configured for {dir}; set plan_file on the options")]
    MissingPlanFile {
        /// Configuration directory.
        dir: String,
    },
    /// The plan export could not be decoded.
    #[error(transparent)]
    Plan(#[from] PlanError),
}

/// Drives the provisioning executable.
#[derive(Clone, Debug)]
pub struct Terraform<R: CommandRunner = ProcessCommandRunner> {
    runner: R,
}

impl Terraform<ProcessCommandRunner> {
    /// Creates a driver that spawns real processes.
    #[must_use]
    pub const fn with_process_runner() -> Self {
        Self::new(ProcessCommandRunner)
    }
}

impl<R: CommandRunner> Terraform<R> {
    /// Creates a driver using `runner`.
    #[must_use]
    pub const fn new(runner: R) -> Self {
        Self { runner }
    }

    /// Returns the underlying runner.
    #[must_use]
    pub const fn runner(&self) -> &R {
        &self.runner
    }

    /// Runs `init` without upgrading providers.
    ///
    /// # Errors
    ///
    /// Returns [`TerraformError`] when the command fails.
    pub fn init(&self, options: &TerraformOptions) -> Result<String, TerraformError> {
        let mut args = vec![String::from("init"), String::from("-upgrade=false")];
        args.extend(options.backend_args());
        push_no_color(&mut args, options);
        self.run(options, args)
    }

    /// Runs `apply` non-interactively.
    ///
    /// # Errors
    ///
    /// Returns [`TerraformError`] when the command fails.
    pub fn apply(&self, options: &TerraformOptions) -> Result<String, TerraformError> {
        let mut args = strings(&["apply", "-input=false", "-auto-approve", "-lock=false"]);
        args.extend(options.var_args());
        push_no_color(&mut args, options);
        self.run(options, args)
    }

    /// Runs `init` then `apply`.
    ///
    /// # Errors
    ///
    /// Returns [`TerraformError`] when either command fails.
    pub fn init_and_apply(&self, options: &TerraformOptions) -> Result<String, TerraformError> {
        self.init(options)?;
        self.apply(options)
    }

    /// Runs `destroy` non-interactively.
    ///
    /// # Errors
    ///
    /// Returns [`TerraformError`] when the command fails.
    pub fn destroy(&self, options: &TerraformOptions) -> Result<String, TerraformError> {
        let mut args = strings(&["destroy", "-auto-approve", "-input=false", "-lock=false"]);
        args.extend(options.var_args());
        push_no_color(&mut args, options);
        self.run(options, args)
    }

    /// Reads an output value. Strings are returned as-is; any other value
    /// is rendered as compact JSON.
    ///
    /// # Errors
    ///
    /// Returns [`TerraformError`] when the output does not exist or the
    /// command fails.
    pub fn output(&self, options: &TerraformOptions, name: &str) -> Result<String, TerraformError> {
        Ok(match self.output_json(options, name)? {
            Value::String(text) => text,
            other => other.to_string(),
        })
    }

    /// Reads an output value as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`TerraformError`] when the output does not exist, the
    /// command fails or the value is not JSON.
    pub fn output_json(
        &self,
        options: &TerraformOptions,
        name: &str,
    ) -> Result<Value, TerraformError> {
        let args = vec![
            String::from("output"),
            String::from("-no-color"),
            String::from("-json"),
            name.to_owned(),
        ];
        let stdout = self.run(options, args)?;
        serde_json::from_str(stdout.trim()).map_err(|err| TerraformError::InvalidOutput {
            name: name.to_owned(),
            message: err.to_string(),
        })
    }

    /// Runs `plan`, writing the plan file configured on `options`.
    ///
    /// # Errors
    ///
    /// Returns [`TerraformError::MissingPlanFile`] when no plan file is
    /// configured, or another [`TerraformError`] when the command fails.
    pub fn plan(&self, options: &TerraformOptions) -> Result<String, TerraformError> {
        let plan_file = require_plan_file(options)?;
        let mut args = strings(&["plan", "-input=false", "-lock=false"]);
        args.push(format!("-out={plan_file}"));
        args.extend(options.var_args());
        push_no_color(&mut args, options);
        self.run(options, args)
    }

    /// Exports the configured plan file as JSON and decodes it.
    ///
    /// # Errors
    ///
    /// Returns [`TerraformError`] when no plan file is configured, the
    /// command fails or the export cannot be decoded.
    pub fn show_plan(&self, options: &TerraformOptions) -> Result<Plan, TerraformError> {
        let plan_file = require_plan_file(options)?;
        let args = vec![
            String::from("show"),
            String::from("-json"),
            plan_file.to_owned(),
        ];
        let stdout = self.run(options, args)?;
        Ok(parse_plan(&stdout)?)
    }

    /// Runs `init`, `plan` and `show`, returning the decoded plan.
    ///
    /// # Errors
    ///
    /// Returns [`TerraformError`] when any step fails.
    pub fn init_and_plan_and_show(
        &self,
        options: &TerraformOptions,
    ) -> Result<Plan, TerraformError> {
        require_plan_file(options)?;
        self.init(options)?;
        self.plan(options)?;
        self.show_plan(options)
    }

    fn run(&self, options: &TerraformOptions, args: Vec<String>) -> Result<String, TerraformError> {
        let patterns = compile_retry_patterns(options)?;
        let mut spec = CommandSpec::new(options.terraform_binary.as_str())
            .args(args)
            .working_dir(options.terraform_dir.clone());
        spec.env = options.env_overlay();

        let command = spec.display();
        let attempts = options.max_retries.saturating_add(1);
        let mut attempt = 1;
        loop {
            info!(command = %command, dir = %options.terraform_dir, attempt, "running terraform");
            let output = self.runner.run(&spec)?;
            if output.is_success() {
                return Ok(output.stdout);
            }

            let combined = format!("{}\n{}", output.stdout, output.stderr);
            let Some((_, reason)) = patterns.iter().find(|(regex, _)| regex.is_match(&combined))
            else {
                return Err(TerraformError::CommandFailed {
                    command,
                    status: output.status_text(),
                    stderr: output.stderr.trim().to_owned(),
                });
            };

            if attempt >= attempts {
                return Err(TerraformError::RetriesExhausted {
                    command,
                    attempts,
                    reason: (*reason).to_owned(),
                    stderr: output.stderr.trim().to_owned(),
                });
            }

            warn!(
                command = %command,
                attempt,
                max_retries = options.max_retries,
                reason = %reason,
                wait_secs = options.time_between_retries.as_secs_f64(),
                "retrying terraform after transient failure"
            );
            thread::sleep(options.time_between_retries);
            attempt += 1;
        }
    }
}

fn compile_retry_patterns(options: &TerraformOptions) -> Result<Vec<(Regex, &str)>, TerraformError> {
    options
        .retryable_errors
        .iter()
        .map(|(pattern, description)| {
            Regex::new(pattern)
                .map(|regex| (regex, description.as_str()))
                .map_err(|err| TerraformError::InvalidRetryPattern {
                    pattern: pattern.clone(),
                    message: err.to_string(),
                })
        })
        .collect()
}

fn require_plan_file(options: &TerraformOptions) -> Result<&str, TerraformError> {
    options
        .plan_file
        .as_ref()
        .map(|path| path.as_str())
        .ok_or_else(|| TerraformError::MissingPlanFile {
            dir: options.terraform_dir.to_string(),
        })
}

fn push_no_color(args: &mut Vec<String>, options: &TerraformOptions) {
    if options.no_color {
        args.push(String::from("-no-color"));
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| (*value).to_owned()).collect()
}

#[cfg(test)]
mod tests;
