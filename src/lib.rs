//! Staged end-to-end infrastructure testing.
//!
//! A test is split into named stages (setup, validate, teardown) that can be
//! skipped individually through `SKIP_<STAGE>` environment variables, so a
//! developer can provision once and re-run validation many times. State that
//! later stages need is persisted per test directory by the
//! [`StateStore`]. An in-process [`SshAgent`] serves the test's throwaway
//! key pair to the provisioning tool, which is driven through [`Terraform`].

pub mod aws;
pub mod command;
pub mod config;
pub mod environment;
pub mod key_pair;
pub mod logging;
pub mod plan;
pub mod random;
pub mod ssh_agent;
pub mod stage;
pub mod state_store;
pub mod terraform;
pub mod test_support;

pub use aws::{AwsError, AwsKeyPairs, STABLE_REGIONS, random_stable_region};
pub use command::{CommandError, CommandOutput, CommandRunner, CommandSpec, ProcessCommandRunner};
pub use config::{ConfigError, HarnessConfig, LogFormat};
pub use environment::{EnvSnapshot, Flag};
pub use key_pair::{KeyPair, KeyPairError, RegisteredKeyPair};
pub use logging::{LoggingError, init_logging};
pub use plan::{
    Change, InstanceIndex, Module, Plan, PlanError, PriorState, RelevantAttribute, Resource,
    ResourceChange, StateValues, parse_plan,
};
pub use random::{resource_name, unique_id, unique_id_with_len};
pub use ssh_agent::{AgentEndpoint, AgentError, SSH_AUTH_SOCK_ENV, SshAgent};
pub use stage::{
    DeferredStage, StageController, StageError, StageFailures, StageOutcome, StageReport,
    skip_directive_key,
};
pub use state_store::{KEY_PAIR_KEY, OPTIONS_KEY, StateStore, StoreError};
pub use terraform::{Terraform, TerraformError, TerraformOptions};
