//! Named, independently skippable test stages.
//!
//! A stage is a caller-supplied body run under a name such as `setup`,
//! `validate` or `teardown`. Setting `SKIP_<NAME>` to a truthy value in the
//! environment snapshot suppresses the stage, which lets a developer rerun
//! validation against infrastructure that an earlier process provisioned.
//!
//! The controller runs one body at a time and never chains stages.
//! Guaranteed teardown is composed by the caller with [`DeferredStage`],
//! which runs its body when dropped, including while unwinding from a
//! failed stage.

use std::error::Error as StdError;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::thread;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::environment::{EnvSnapshot, Flag};

/// Prefix applied to every skip directive.
pub const SKIP_PREFIX: &str = "SKIP_";

/// Boxed error returned by fallible stage bodies.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Derives the skip directive key for `stage`.
///
/// The name is uppercased, every run of non-alphanumeric characters becomes
/// a single `_`, and leading or trailing underscores are dropped, so
/// `"deploy app"` maps to `SKIP_DEPLOY_APP`.
#[must_use]
pub fn skip_directive_key(stage: &str) -> String {
    let mut key = String::from(SKIP_PREFIX);
    let mut pending_separator = false;
    for ch in stage.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_separator && key.len() > SKIP_PREFIX.len() {
                key.push('_');
            }
            pending_separator = false;
            key.push(ch.to_ascii_uppercase());
        } else {
            pending_separator = true;
        }
    }
    key
}

/// What happened when a stage was requested.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StageOutcome {
    /// The skip directive was set; the body did not run.
    Skipped,
    /// The body ran to completion.
    Completed,
}

/// A stage body returned an error.
#[derive(Debug, Error)]
#[error("stage '{stage}' failed: {source}")]
pub struct StageError {
    /// Name of the failed stage.
    pub stage: String,
    /// Error returned by the stage body.
    #[source]
    pub source: BoxError,
}

/// Runs stages against an environment snapshot.
#[derive(Clone, Debug, Default)]
pub struct StageController {
    env: EnvSnapshot,
}

impl StageController {
    /// Creates a controller reading skip directives from `env`.
    #[must_use]
    pub const fn new(env: EnvSnapshot) -> Self {
        Self { env }
    }

    /// Creates a controller from a snapshot of the process environment.
    #[must_use]
    pub fn from_process_env() -> Self {
        Self::new(EnvSnapshot::from_process())
    }

    /// Returns the environment snapshot used for skip directives.
    #[must_use]
    pub const fn env(&self) -> &EnvSnapshot {
        &self.env
    }

    /// Reports whether the skip directive for `stage` is set.
    ///
    /// Values other than `true`, `1` or `yes` leave the stage enabled and
    /// are logged so a mistyped directive does not go unnoticed.
    #[must_use]
    pub fn is_skipped(&self, stage: &str) -> bool {
        let key = skip_directive_key(stage);
        match self.env.flag(&key) {
            Flag::Enabled => true,
            Flag::Unset => false,
            Flag::Disabled(value) => {
                warn!(
                    stage,
                    directive = %key,
                    value = %value,
                    "skip directive value not recognised; running stage"
                );
                false
            }
        }
    }

    /// Runs `body` as stage `name` unless its skip directive is set.
    ///
    /// Panics raised by `body` propagate to the caller untouched; they are
    /// the test framework's failure signal.
    pub fn run_stage<F>(&self, name: &str, body: F) -> StageOutcome
    where
        F: FnOnce(),
    {
        if self.is_skipped(name) {
            log_skip(name);
            return StageOutcome::Skipped;
        }

        info!(stage = name, "running stage");
        body();
        info!(stage = name, "stage completed");
        StageOutcome::Completed
    }

    /// Runs a fallible `body` as stage `name` unless its skip directive is
    /// set.
    ///
    /// # Errors
    ///
    /// Returns [`StageError`] naming the stage when `body` fails.
    pub fn try_stage<F, E>(&self, name: &str, body: F) -> Result<StageOutcome, StageError>
    where
        F: FnOnce() -> Result<(), E>,
        E: Into<BoxError>,
    {
        if self.is_skipped(name) {
            log_skip(name);
            return Ok(StageOutcome::Skipped);
        }

        info!(stage = name, "running stage");
        match body() {
            Ok(()) => {
                info!(stage = name, "stage completed");
                Ok(StageOutcome::Completed)
            }
            Err(err) => {
                let source = err.into();
                error!(stage = name, error = %source, "stage failed");
                Err(StageError {
                    stage: name.to_owned(),
                    source,
                })
            }
        }
    }

    /// Registers `body` to run as stage `name` when the returned guard is
    /// dropped.
    ///
    /// Bind the guard to a named variable (`let _teardown = ...`); binding
    /// it to `_` drops it, and so runs the stage, immediately.
    #[must_use = "the stage runs as soon as the guard is dropped"]
    pub fn defer_stage<F>(&self, name: &str, body: F) -> DeferredStage<F>
    where
        F: FnOnce(),
    {
        DeferredStage {
            controller: self.clone(),
            name: name.to_owned(),
            body: Some(body),
        }
    }
}

fn log_skip(stage: &str) {
    info!(
        stage,
        directive = %skip_directive_key(stage),
        "stage skipped"
    );
}

/// Scope guard that runs a stage when dropped.
pub struct DeferredStage<F>
where
    F: FnOnce(),
{
    controller: StageController,
    name: String,
    body: Option<F>,
}

impl<F> DeferredStage<F>
where
    F: FnOnce(),
{
    /// Returns the stage name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs the stage now instead of at scope exit.
    pub fn run_now(mut self) -> StageOutcome {
        self.fire().unwrap_or(StageOutcome::Skipped)
    }

    /// Cancels the stage; the body never runs.
    pub fn disarm(mut self) {
        if self.body.take().is_some() {
            info!(stage = %self.name, "deferred stage disarmed");
        }
    }

    fn fire(&mut self) -> Option<StageOutcome> {
        let body = self.body.take()?;
        if !thread::panicking() {
            return Some(self.controller.run_stage(&self.name, body));
        }

        // Already unwinding from an earlier failure: a second panic would
        // abort the process and hide the first one.
        let controller = &self.controller;
        let name = self.name.as_str();
        let result = panic::catch_unwind(AssertUnwindSafe(|| controller.run_stage(name, body)));
        match result {
            Ok(outcome) => Some(outcome),
            Err(payload) => {
                error!(
                    stage = name,
                    panic = %panic_message(payload.as_ref()),
                    "deferred stage failed while unwinding from an earlier failure"
                );
                None
            }
        }
    }
}

impl<F> Drop for DeferredStage<F>
where
    F: FnOnce(),
{
    fn drop(&mut self) {
        self.fire();
    }
}

impl<F> fmt::Debug for DeferredStage<F>
where
    F: FnOnce(),
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredStage")
            .field("name", &self.name)
            .field("armed", &self.body.is_some())
            .finish_non_exhaustive()
    }
}

/// Extracts a printable message from a panic payload.
#[must_use]
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_owned();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    String::from("non-string panic payload")
}

/// Collects the results of fallible stages so later failures are reported
/// alongside earlier ones rather than replacing them.
#[derive(Debug, Default)]
pub struct StageReport {
    outcomes: Vec<(String, StageOutcome)>,
    failures: Vec<StageError>,
}

impl StageReport {
    /// Creates an empty report.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs a fallible stage through `controller` and records its result.
    pub fn run<F, E>(&mut self, controller: &StageController, name: &str, body: F)
    where
        F: FnOnce() -> Result<(), E>,
        E: Into<BoxError>,
    {
        match controller.try_stage(name, body) {
            Ok(outcome) => self.outcomes.push((name.to_owned(), outcome)),
            Err(err) => self.failures.push(err),
        }
    }

    /// Returns `true` when any recorded stage failed.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    /// Returns the names of stages that were skipped.
    #[must_use]
    pub fn skipped(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| *outcome == StageOutcome::Skipped)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Consumes the report.
    ///
    /// # Errors
    ///
    /// Returns [`StageFailures`] listing every failed stage in the order
    /// they ran.
    pub fn finish(self) -> Result<(), StageFailures> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(StageFailures {
                failures: self.failures,
            })
        }
    }
}

/// One or more stages failed.
#[derive(Debug)]
pub struct StageFailures {
    failures: Vec<StageError>,
}

impl StageFailures {
    /// Returns the individual stage failures in the order they occurred.
    #[must_use]
    pub fn failures(&self) -> &[StageError] {
        &self.failures
    }

    /// Returns the names of the failed stages.
    #[must_use]
    pub fn stages(&self) -> Vec<&str> {
        self.failures.iter().map(|err| err.stage.as_str()).collect()
    }
}

impl fmt::Display for StageFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut failures = self.failures.iter();
        let Some(first) = failures.next() else {
            return write!(f, "no stage failures recorded");
        };
        write!(f, "{first}")?;
        for later in failures {
            write!(f, " (also: {later})")?;
        }
        Ok(())
    }
}

impl StdError for StageFailures {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.failures
            .first()
            .map(|first| first as &(dyn StdError + 'static))
    }
}
