//! Inputs for provisioning runs.

use std::collections::BTreeMap;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::HarnessConfig;
use crate::ssh_agent::AgentEndpoint;

/// Default provisioning executable.
pub const DEFAULT_TERRAFORM_BINARY: &str = "terraform";

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default pause between attempts.
pub const DEFAULT_TIME_BETWEEN_RETRIES: Duration = Duration::from_secs(5);

/// Transient failures seen when talking to provider registries and plugins.
pub const DEFAULT_RETRYABLE_ERRORS: &[(&str, &str)] = &[
    (
        ".*read: connection reset by peer.*",
        "Failed to reach helm charts repository.",
    ),
    (
        ".*transport is closing.*",
        "Failed to reach Kubernetes API.",
    ),
    (
        ".*unable to verify signature.*",
        "Failed to retrieve plugin due to transient network error.",
    ),
    (
        ".*unable to verify checksum.*",
        "Failed to retrieve plugin due to transient network error.",
    ),
    (
        ".*no provider exists with the given name.*",
        "Failed to retrieve plugin due to transient network error.",
    ),
    (
        ".*registry service is unreachable.*",
        "Failed to retrieve plugin due to transient network error.",
    ),
    (
        ".*Error installing provider.*",
        "Failed to retrieve plugin due to transient network error.",
    ),
    (
        ".*Failed to query available provider packages.*",
        "Failed to retrieve plugin due to transient network error.",
    ),
    (
        ".*timeout while waiting for plugin to start.*",
        "Failed to retrieve plugin due to transient network error.",
    ),
    (
        ".*timed out waiting for server handshake.*",
        "Failed to retrieve plugin due to transient network error.",
    ),
    (
        "could not query provider registry for",
        "Failed to retrieve plugin due to transient network error.",
    ),
    (
        ".*Provider produced inconsistent result after apply.*",
        "Provider eventual consistency error.",
    ),
];

/// Everything needed to drive one configuration directory.
///
/// Persisted between stages by the state store. The agent endpoint is not
/// persisted: the socket only lives as long as the process that started it.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct TerraformOptions {
    /// Directory holding the configuration.
    pub terraform_dir: Utf8PathBuf,
    /// Executable to invoke.
    #[serde(default = "default_terraform_binary")]
    pub terraform_binary: String,
    /// Input variables passed with `-var`.
    #[serde(default)]
    pub vars: BTreeMap<String, Value>,
    /// Variable files passed with `-var-file`.
    #[serde(default)]
    pub var_files: Vec<Utf8PathBuf>,
    /// Extra environment for every invocation.
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
    /// Backend settings passed to `init` with `-backend-config`.
    #[serde(default)]
    pub backend_config: BTreeMap<String, Value>,
    /// Output patterns (regular expressions) that mark a failure as
    /// transient, mapped to a description used in logs.
    #[serde(default)]
    pub retryable_errors: BTreeMap<String, String>,
    /// Retries allowed after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Pause between attempts.
    #[serde(default = "default_time_between_retries")]
    pub time_between_retries: Duration,
    /// Adds `-no-color` to commands that accept it.
    #[serde(default)]
    pub no_color: bool,
    /// Plan file written by `plan` and read by `show`.
    #[serde(default)]
    pub plan_file: Option<Utf8PathBuf>,
    /// Agent exported to child processes.
    #[serde(skip)]
    pub ssh_agent: Option<AgentEndpoint>,
}

fn default_terraform_binary() -> String {
    String::from(DEFAULT_TERRAFORM_BINARY)
}

const fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

const fn default_time_between_retries() -> Duration {
    DEFAULT_TIME_BETWEEN_RETRIES
}

impl TerraformOptions {
    /// Creates options for `terraform_dir` with default settings and no
    /// retryable errors.
    #[must_use]
    pub fn new(terraform_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            terraform_dir: terraform_dir.into(),
            terraform_binary: default_terraform_binary(),
            vars: BTreeMap::new(),
            var_files: Vec::new(),
            env_vars: BTreeMap::new(),
            backend_config: BTreeMap::new(),
            retryable_errors: BTreeMap::new(),
            max_retries: DEFAULT_MAX_RETRIES,
            time_between_retries: DEFAULT_TIME_BETWEEN_RETRIES,
            no_color: false,
            plan_file: None,
            ssh_agent: None,
        }
    }

    /// Creates options for `terraform_dir` that retry the usual transient
    /// registry and plugin failures.
    #[must_use]
    pub fn with_default_retryable_errors(terraform_dir: impl Into<Utf8PathBuf>) -> Self {
        let mut options = Self::new(terraform_dir);
        options.retryable_errors = DEFAULT_RETRYABLE_ERRORS
            .iter()
            .map(|(pattern, description)| ((*pattern).to_owned(), (*description).to_owned()))
            .collect();
        options
    }

    /// Creates options using the executable and retry settings from
    /// `config`, plus the default retryable errors.
    #[must_use]
    pub fn from_config(config: &HarnessConfig, terraform_dir: impl Into<Utf8PathBuf>) -> Self {
        let mut options = Self::with_default_retryable_errors(terraform_dir);
        options.terraform_binary.clone_from(&config.terraform_bin);
        options.max_retries = config.max_retries;
        options.time_between_retries = Duration::from_secs(u64::from(config.retry_interval_secs));
        options
    }

    /// Sets an input variable.
    #[must_use]
    pub fn var(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    /// Adds a variable file.
    #[must_use]
    pub fn var_file(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.var_files.push(path.into());
        self
    }

    /// Sets an environment variable for every invocation.
    #[must_use]
    pub fn env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(key.into(), value.into());
        self
    }

    /// Sets a backend configuration value.
    #[must_use]
    pub fn backend(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.backend_config.insert(key.into(), value.into());
        self
    }

    /// Marks failures whose output matches `pattern` as transient.
    #[must_use]
    pub fn retryable_error(
        mut self,
        pattern: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        self.retryable_errors
            .insert(pattern.into(), description.into());
        self
    }

    /// Sets the retry budget.
    #[must_use]
    pub const fn retries(mut self, max_retries: u32, time_between_retries: Duration) -> Self {
        self.max_retries = max_retries;
        self.time_between_retries = time_between_retries;
        self
    }

    /// Sets the plan file path.
    #[must_use]
    pub fn plan_file(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.plan_file = Some(path.into());
        self
    }

    /// Exports `endpoint` to every invocation.
    #[must_use]
    pub fn ssh_agent(mut self, endpoint: AgentEndpoint) -> Self {
        self.ssh_agent = Some(endpoint);
        self
    }

    /// Returns the configuration directory.
    #[must_use]
    pub fn dir(&self) -> &Utf8Path {
        &self.terraform_dir
    }

    /// Returns the environment overlay for child processes: `env_vars`
    /// followed by the agent endpoint, which wins on conflict.
    #[must_use]
    pub fn env_overlay(&self) -> BTreeMap<String, String> {
        let mut env = self.env_vars.clone();
        if let Some(endpoint) = &self.ssh_agent {
            env.insert(endpoint.var.clone(), endpoint.socket.to_string());
        }
        env
    }

    pub(crate) fn var_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(self.vars.len() * 2 + self.var_files.len() * 2);
        for (key, value) in &self.vars {
            args.push(String::from("-var"));
            args.push(format!("{key}={}", render_value(value)));
        }
        for file in &self.var_files {
            args.push(String::from("-var-file"));
            args.push(file.to_string());
        }
        args
    }

    pub(crate) fn backend_args(&self) -> Vec<String> {
        self.backend_config
            .iter()
            .map(|(key, value)| format!("-backend-config={key}={}", render_value(value)))
            .collect()
    }
}

/// Strings pass through unquoted; every other value is rendered as JSON,
/// which the tool's variable parser accepts as an HCL expression.
pub(crate) fn render_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
