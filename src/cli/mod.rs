//! Command-line interface definitions for the `terrastage` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Top-level CLI for the `terrastage` binary.
#[derive(Debug, Parser)]
#[command(
    name = "terrastage",
    about = "Inspect and reset the state shared between staged infrastructure tests",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Inspect or reset a test directory's persisted stage state.
    #[command(subcommand)]
    State(StateCommand),
    /// Print the environment variable that skips a stage.
    #[command(
        name = "skip-directive",
        about = "Print the environment variable that skips a stage"
    )]
    SkipDirective(SkipDirectiveCommand),
}

/// Actions of the `terrastage state` subcommand.
#[derive(Debug, Subcommand)]
pub(crate) enum StateCommand {
    /// List the values stored for a test directory.
    #[command(name = "list", about = "List the values stored for a test directory")]
    List {
        /// Test directory holding a `.test-data` directory.
        #[arg(value_name = "DIR")]
        dir: PathBuf,
    },
    /// Print one stored value. Private keys are redacted.
    #[command(name = "show", about = "Print one stored value with secrets redacted")]
    Show {
        /// Test directory holding a `.test-data` directory.
        #[arg(value_name = "DIR")]
        dir: PathBuf,
        /// Logical name of the value (for example `terraform-options`).
        #[arg(value_name = "NAME")]
        name: String,
    },
    /// Delete every stored value so the next run starts from setup.
    #[command(name = "clear", about = "Delete every stored value for a test directory")]
    Clear {
        /// Test directory holding a `.test-data` directory.
        #[arg(value_name = "DIR")]
        dir: PathBuf,
    },
}

/// Arguments for the `terrastage skip-directive` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct SkipDirectiveCommand {
    /// Stage name as passed to the stage controller (for example `validate`).
    #[arg(value_name = "STAGE")]
    pub(crate) stage: String,
}
