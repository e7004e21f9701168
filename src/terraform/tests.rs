//! Tests for the provisioning driver.

use std::ffi::OsString;
use std::time::Duration;

use camino::Utf8PathBuf;
use rstest::{fixture, rstest};
use serde_json::json;

use super::*;
use crate::config::HarnessConfig;
use crate::key_pair::KeyPair;
use crate::ssh_agent::{AgentEndpoint, SSH_AUTH_SOCK_ENV, SshAgent};
use crate::test_support::{ScriptedRunner, capture_logs, sample_plan_json};

#[fixture]
fn options() -> TerraformOptions {
    TerraformOptions::with_default_retryable_errors("/work/remote-exec")
        .retries(2, Duration::ZERO)
}

#[fixture]
fn driver() -> Terraform<ScriptedRunner> {
    Terraform::new(ScriptedRunner::new())
}

fn args_of(spec: &CommandSpec) -> Vec<String> {
    spec.args
        .iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect()
}

fn only_invocation(driver: &Terraform<ScriptedRunner>) -> CommandSpec {
    let invocations = driver.runner().invocations();
    assert_eq!(invocations.len(), 1, "invocations: {invocations:?}");
    invocations
        .into_iter()
        .next()
        .unwrap_or_else(|| panic!("expected one invocation"))
}

#[rstest]
fn init_passes_backend_config_and_runs_in_the_configuration_dir(
    driver: Terraform<ScriptedRunner>,
    options: TerraformOptions,
) {
    driver.runner().push_success();
    let options = options.backend("bucket", "state-bucket").backend("encrypt", true);

    driver
        .init(&options)
        .unwrap_or_else(|err| panic!("init: {err}"));

    let spec = only_invocation(&driver);
    assert_eq!(spec.program, "terraform");
    assert_eq!(
        args_of(&spec),
        vec![
            "init",
            "-upgrade=false",
            "-backend-config=bucket=state-bucket",
            "-backend-config=encrypt=true",
        ]
    );
    assert_eq!(spec.working_dir, Some(Utf8PathBuf::from("/work/remote-exec")));
}

#[rstest]
fn apply_renders_variables_in_key_order(
    driver: Terraform<ScriptedRunner>,
    options: TerraformOptions,
) {
    driver.runner().push_success();
    let options = options
        .var("instance_name", "terrastage-abc123")
        .var("aws_region", "eu-west-1")
        .var("instance_count", 2)
        .var("tags", json!({"team": "infra"}))
        .var_file("extra.tfvars");

    driver
        .apply(&options)
        .unwrap_or_else(|err| panic!("apply: {err}"));

    let spec = only_invocation(&driver);
    assert_eq!(
        args_of(&spec),
        vec![
            "apply",
            "-input=false",
            "-auto-approve",
            "-lock=false",
            "-var",
            "aws_region=eu-west-1",
            "-var",
            "instance_count=2",
            "-var",
            "instance_name=terrastage-abc123",
            "-var",
            "tags={\"team\":\"infra\"}",
            "-var-file",
            "extra.tfvars",
        ]
    );
}

#[rstest]
fn no_color_is_appended_when_requested(
    driver: Terraform<ScriptedRunner>,
    mut options: TerraformOptions,
) {
    driver.runner().push_success();
    options.no_color = true;

    driver
        .destroy(&options)
        .unwrap_or_else(|err| panic!("destroy: {err}"));

    let spec = only_invocation(&driver);
    assert_eq!(
        args_of(&spec),
        vec!["destroy", "-auto-approve", "-input=false", "-lock=false", "-no-color"]
    );
}

#[rstest]
fn init_and_apply_runs_both_commands(
    driver: Terraform<ScriptedRunner>,
    options: TerraformOptions,
) {
    driver.runner().push_success();
    driver.runner().push_stdout("Apply complete!");

    let stdout = driver
        .init_and_apply(&options)
        .unwrap_or_else(|err| panic!("init_and_apply: {err}"));

    assert_eq!(stdout, "Apply complete!");
    let lines = driver.runner().command_lines();
    assert_eq!(lines.len(), 2);
    assert!(lines.first().is_some_and(|line| line.starts_with("terraform init")));
    assert!(lines.get(1).is_some_and(|line| line.starts_with("terraform apply")));
}

#[rstest]
fn failed_init_stops_before_apply(driver: Terraform<ScriptedRunner>, options: TerraformOptions) {
    driver.runner().push_failure(1, "Error: Invalid backend configuration");

    let err = driver
        .init_and_apply(&options)
        .expect_err("init failure should propagate");

    assert!(matches!(err, TerraformError::CommandFailed { .. }), "{err}");
    assert_eq!(driver.runner().invocations().len(), 1);
}

#[rstest]
fn environment_overlay_carries_env_vars_and_agent(
    driver: Terraform<ScriptedRunner>,
    options: TerraformOptions,
) {
    driver.runner().push_success();
    let options = options
        .env_var("AWS_DEFAULT_REGION", "eu-west-1")
        .env_var(SSH_AUTH_SOCK_ENV, "/tmp/stale.sock")
        .ssh_agent(AgentEndpoint::new("/tmp/agent/agent.sock"));

    driver
        .apply(&options)
        .unwrap_or_else(|err| panic!("apply: {err}"));

    let spec = only_invocation(&driver);
    assert_eq!(
        spec.env.get("AWS_DEFAULT_REGION").map(String::as_str),
        Some("eu-west-1")
    );
    assert_eq!(
        spec.env.get(SSH_AUTH_SOCK_ENV).map(String::as_str),
        Some("/tmp/agent/agent.sock")
    );
}

#[rstest]
fn retryable_failure_is_retried_until_success(
    driver: Terraform<ScriptedRunner>,
    options: TerraformOptions,
) {
    driver
        .runner()
        .push_failure(1, "Error installing provider \"aws\": timeout");
    driver.runner().push_success();

    let (result, logs) = capture_logs(|| driver.init(&options));

    result.unwrap_or_else(|err| panic!("init should succeed on retry: {err}"));
    assert_eq!(driver.runner().invocations().len(), 2);
    assert!(logs.contains("retrying terraform"), "logs: {logs}");
}

#[rstest]
fn retryable_pattern_matches_stdout_too(
    driver: Terraform<ScriptedRunner>,
    options: TerraformOptions,
) {
    driver.runner().push_output(
        Some(1),
        "Provider produced inconsistent result after apply",
        "",
    );
    driver.runner().push_success();

    driver
        .apply(&options)
        .unwrap_or_else(|err| panic!("apply should succeed on retry: {err}"));
    assert_eq!(driver.runner().pending(), 0);
}

#[rstest]
fn non_retryable_failure_fails_immediately(
    driver: Terraform<ScriptedRunner>,
    options: TerraformOptions,
) {
    driver
        .runner()
        .push_failure(1, "Error: Unsupported argument");
    driver.runner().push_success();

    let err = driver
        .apply(&options)
        .expect_err("non-retryable failure should not be retried");

    let TerraformError::CommandFailed { status, stderr, .. } = err else {
        panic!("expected CommandFailed, got {err:?}");
    };
    assert_eq!(status, "1");
    assert_eq!(stderr, "Error: Unsupported argument");
    assert_eq!(driver.runner().pending(), 1);
}

#[rstest]
fn retries_stop_after_the_configured_budget(
    driver: Terraform<ScriptedRunner>,
    options: TerraformOptions,
) {
    for _ in 0..3 {
        driver
            .runner()
            .push_failure(1, "registry service is unreachable");
    }
    driver.runner().push_success();

    let err = driver
        .init(&options)
        .expect_err("retries should be exhausted");

    let TerraformError::RetriesExhausted {
        attempts, reason, ..
    } = err
    else {
        panic!("expected RetriesExhausted, got {err:?}");
    };
    assert_eq!(attempts, 3);
    assert_eq!(
        reason,
        "Failed to retrieve plugin due to transient network error."
    );
    assert_eq!(driver.runner().pending(), 1);
}

#[rstest]
fn options_without_patterns_never_retry(driver: Terraform<ScriptedRunner>) {
    driver
        .runner()
        .push_failure(1, "registry service is unreachable");
    let options = TerraformOptions::new("/work").retries(5, Duration::ZERO);

    let err = driver.init(&options).expect_err("should fail");
    assert!(matches!(err, TerraformError::CommandFailed { .. }));
    assert_eq!(driver.runner().invocations().len(), 1);
}

#[rstest]
fn invalid_retry_pattern_is_rejected_before_running(
    driver: Terraform<ScriptedRunner>,
    options: TerraformOptions,
) {
    let options = options.retryable_error("(unclosed", "broken");

    let err = driver.apply(&options).expect_err("pattern should not compile");

    assert!(
        matches!(err, TerraformError::InvalidRetryPattern { ref pattern, .. } if pattern == "(unclosed"),
        "{err}"
    );
    assert!(driver.runner().invocations().is_empty());
}

#[rstest]
#[case::string("\"203.0.113.10\"\n", "203.0.113.10")]
#[case::number("42\n", "42")]
#[case::list("[\"a\", \"b\"]\n", "[\"a\",\"b\"]")]
#[case::map("{\"x\": 1}\n", "{\"x\":1}")]
fn output_returns_strings_raw_and_other_values_as_json(
    driver: Terraform<ScriptedRunner>,
    options: TerraformOptions,
    #[case] stdout: &str,
    #[case] expected: &str,
) {
    driver.runner().push_stdout(stdout);

    let value = driver
        .output(&options, "public_instance_ip")
        .unwrap_or_else(|err| panic!("output: {err}"));

    assert_eq!(value, expected);
    let spec = only_invocation(&driver);
    assert_eq!(
        args_of(&spec),
        vec!["output", "-no-color", "-json", "public_instance_ip"]
    );
}

#[rstest]
fn missing_output_is_an_error(driver: Terraform<ScriptedRunner>, options: TerraformOptions) {
    driver.runner().push_failure(
        1,
        "Error: Output \"nope\" not found\n\nThe output variable requested could not be found",
    );

    let err = driver
        .output(&options, "nope")
        .expect_err("missing output should fail");
    assert!(err.to_string().contains("not found"), "{err}");
}

#[rstest]
fn output_json_rejects_garbage(driver: Terraform<ScriptedRunner>, options: TerraformOptions) {
    driver.runner().push_stdout("Warning: no outputs");

    let err = driver
        .output_json(&options, "anything")
        .expect_err("garbage is not JSON");
    assert!(matches!(err, TerraformError::InvalidOutput { ref name, .. } if name == "anything"));
}

#[rstest]
fn plan_requires_a_plan_file(driver: Terraform<ScriptedRunner>, options: TerraformOptions) {
    let err = driver
        .init_and_plan_and_show(&options)
        .expect_err("plan file is required");

    assert!(matches!(err, TerraformError::MissingPlanFile { .. }), "{err}");
    assert!(driver.runner().invocations().is_empty());
}

#[rstest]
fn init_and_plan_and_show_decodes_the_plan(
    driver: Terraform<ScriptedRunner>,
    options: TerraformOptions,
) {
    let options = options.plan_file("tfplan").var("instance_name", "demo");
    driver.runner().push_success();
    driver.runner().push_stdout("Plan: 2 to add");
    driver.runner().push_stdout(sample_plan_json());

    let plan = driver
        .init_and_plan_and_show(&options)
        .unwrap_or_else(|err| panic!("plan: {err}"));

    assert!(plan.planned_resource("aws_instance.example[0]").is_some());
    let invocations = driver.runner().invocations();
    let plan_args = invocations
        .get(1)
        .map(args_of)
        .unwrap_or_else(|| panic!("missing plan invocation"));
    assert_eq!(
        plan_args,
        vec![
            "plan",
            "-input=false",
            "-lock=false",
            "-out=tfplan",
            "-var",
            "instance_name=demo",
        ]
    );
    let show_args = invocations
        .get(2)
        .map(args_of)
        .unwrap_or_else(|| panic!("missing show invocation"));
    assert_eq!(show_args, vec!["show", "-json", "tfplan"]);
}

#[rstest]
fn options_follow_harness_config() {
    let config = HarnessConfig {
        terraform_bin: String::from("tofu"),
        max_retries: 7,
        retry_interval_secs: 0,
        ..HarnessConfig::built_in()
    };

    let options = TerraformOptions::from_config(&config, "/work");

    assert_eq!(options.terraform_binary, "tofu");
    assert_eq!(options.max_retries, 7);
    assert_eq!(options.time_between_retries, Duration::ZERO);
    assert_eq!(options.retryable_errors.len(), DEFAULT_RETRYABLE_ERRORS.len());
}

#[rstest]
fn new_options_use_documented_defaults() {
    let options = TerraformOptions::new("/work");

    assert_eq!(options.terraform_binary, DEFAULT_TERRAFORM_BINARY);
    assert_eq!(options.max_retries, 3);
    assert_eq!(options.time_between_retries, Duration::from_secs(5));
    assert!(options.retryable_errors.is_empty());
    assert!(options.ssh_agent.is_none());
}

#[rstest]
fn agent_endpoint_is_not_persisted() {
    let options = TerraformOptions::new("/work")
        .var("aws_region", "us-east-2")
        .ssh_agent(AgentEndpoint::new("/tmp/agent.sock"));

    let rendered =
        serde_json::to_string(&options).unwrap_or_else(|err| panic!("serialise: {err}"));
    let decoded: TerraformOptions =
        serde_json::from_str(&rendered).unwrap_or_else(|err| panic!("decode: {err}"));

    assert!(!rendered.contains("agent.sock"));
    assert_eq!(decoded.ssh_agent, None);
    assert_eq!(decoded.vars, options.vars);
}

#[rstest]
fn real_process_receives_the_agent_socket() {
    use std::os::unix::fs::PermissionsExt;

    let tmp = tempfile::TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let script = tmp.path().join("fake-terraform");
    std::fs::write(&script, "#!/bin/sh\nprintf '\"%s\"' \"$SSH_AUTH_SOCK\"\n")
        .unwrap_or_else(|err| panic!("write script: {err}"));
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
        .unwrap_or_else(|err| panic!("chmod: {err}"));
    let dir = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
        .unwrap_or_else(|path| panic!("temp dir should be utf8: {}", path.display()));

    let key_pair = KeyPair::generate().unwrap_or_else(|err| panic!("generate: {err}"));
    let agent = SshAgent::start(&key_pair).unwrap_or_else(|err| panic!("agent: {err}"));
    let mut options = TerraformOptions::new(dir).ssh_agent(agent.endpoint());
    options.terraform_binary = OsString::from(script.as_os_str())
        .into_string()
        .unwrap_or_else(|path| panic!("script path should be utf8: {path:?}"));

    let value = Terraform::with_process_runner()
        .output(&options, "socket")
        .unwrap_or_else(|err| panic!("output: {err}"));

    assert_eq!(value, agent.socket_path().as_str());
}
