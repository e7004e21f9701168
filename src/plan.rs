//! Typed view of the provisioning tool's JSON plan export (`show -json`).
//!
//! Only the parts tests commonly assert on are typed. Provider schemas,
//! configuration and resource attribute values stay as raw JSON. Instance
//! index keys are kept opaque: a number for `count` resources, a string for
//! `for_each` resources, decoded by the caller.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Raised when a plan document cannot be decoded.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum PlanError {
    /// The document is not a valid plan export.
    #[error("failed to parse plan JSON: {message}")]
    Parse {
        /// Decoder error message.
        message: String,
    },
}

/// Parses a plan export.
///
/// # Errors
///
/// Returns [`PlanError::Parse`] when `json` is not a plan document.
pub fn parse_plan(json: &str) -> Result<Plan, PlanError> {
    serde_json::from_str(json).map_err(|err| PlanError::Parse {
        message: err.to_string(),
    })
}

/// A plan export.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Plan {
    /// Export format version.
    #[serde(default)]
    pub format_version: String,
    /// Tool version that produced the plan.
    #[serde(default)]
    pub terraform_version: Option<String>,
    /// Input variables keyed by name.
    #[serde(default)]
    pub variables: BTreeMap<String, PlanVariable>,
    /// State the plan would produce.
    #[serde(default)]
    pub planned_values: Option<StateValues>,
    /// Per-resource changes.
    #[serde(default)]
    pub resource_changes: Vec<ResourceChange>,
    /// Per-output changes.
    #[serde(default)]
    pub output_changes: BTreeMap<String, Change>,
    /// Changes made outside the tool since the last apply.
    #[serde(default)]
    pub resource_drift: Vec<ResourceChange>,
    /// Attributes that contributed to the planned changes.
    #[serde(default)]
    pub relevant_attributes: Vec<RelevantAttribute>,
    /// State before the plan, when there was one.
    #[serde(default)]
    pub prior_state: Option<PriorState>,
    /// Configuration summary, left undecoded.
    #[serde(default)]
    pub configuration: Option<Value>,
}

/// An input variable value.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct PlanVariable {
    /// Variable value.
    #[serde(default)]
    pub value: Value,
}

/// The state document a plan was computed against.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct PriorState {
    /// State format version.
    #[serde(default)]
    pub format_version: String,
    /// Tool version that wrote the state.
    #[serde(default)]
    pub terraform_version: Option<String>,
    /// Recorded values.
    #[serde(default)]
    pub values: Option<StateValues>,
}

/// One attribute path of a resource that the plan depends on.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct RelevantAttribute {
    /// Resource address.
    pub resource: String,
    /// Attribute path steps (names and keys).
    #[serde(default)]
    pub attribute: Vec<Value>,
}

/// Values of a (planned or prior) state.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct StateValues {
    /// Outputs keyed by name.
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
    /// Root module.
    #[serde(default)]
    pub root_module: Module,
}

/// A module and its resources.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Module {
    /// Module address; empty for the root module.
    #[serde(default)]
    pub address: String,
    /// Resources declared directly in this module.
    #[serde(default)]
    pub resources: Vec<Resource>,
    /// Nested modules.
    #[serde(default)]
    pub child_modules: Vec<Module>,
}

impl Module {
    fn collect<'a>(&'a self, into: &mut Vec<&'a Resource>) {
        into.extend(self.resources.iter());
        for child in &self.child_modules {
            child.collect(into);
        }
    }
}

/// A resource instance in a state.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Resource {
    /// Absolute resource address including any instance key.
    pub address: String,
    /// `managed` or `data`.
    #[serde(default)]
    pub mode: String,
    /// Resource type.
    #[serde(default, rename = "type")]
    pub resource_type: String,
    /// Resource name.
    #[serde(default)]
    pub name: String,
    /// Instance key, when the resource uses `count` or `for_each`.
    #[serde(default)]
    pub index: Option<InstanceIndex>,
    /// Provider that manages the resource.
    #[serde(default)]
    pub provider_name: String,
    /// Schema version of `values`.
    #[serde(default)]
    pub schema_version: u64,
    /// Attribute values.
    #[serde(default)]
    pub values: Value,
    /// Mask of sensitive attribute values.
    #[serde(default)]
    pub sensitive_values: Value,
}

/// A planned change to one resource instance.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ResourceChange {
    /// Absolute resource address including any instance key.
    pub address: String,
    /// Address of the containing module, absent for the root module.
    #[serde(default)]
    pub module_address: Option<String>,
    /// `managed` or `data`.
    #[serde(default)]
    pub mode: String,
    /// Resource type.
    #[serde(default, rename = "type")]
    pub resource_type: String,
    /// Resource name.
    #[serde(default)]
    pub name: String,
    /// Instance key, when the resource uses `count` or `for_each`.
    #[serde(default)]
    pub index: Option<InstanceIndex>,
    /// Provider that manages the resource.
    #[serde(default)]
    pub provider_name: String,
    /// The change itself.
    pub change: Change,
    /// Why the tool chose this action, when it says.
    #[serde(default)]
    pub action_reason: Option<String>,
}

/// Before and after values for a resource or output.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Change {
    /// Actions such as `create`, `update`, `delete` or `no-op`.
    #[serde(default)]
    pub actions: Vec<String>,
    /// Value before the change.
    #[serde(default)]
    pub before: Value,
    /// Value after the change, with unknowns omitted.
    #[serde(default)]
    pub after: Value,
    /// Mask of values only known after apply.
    #[serde(default)]
    pub after_unknown: Value,
    /// Mask of sensitive values before the change.
    #[serde(default)]
    pub before_sensitive: Value,
    /// Mask of sensitive values after the change.
    #[serde(default)]
    pub after_sensitive: Value,
    /// Attribute paths that force replacement.
    #[serde(default)]
    pub replace_paths: Vec<Value>,
}

impl Change {
    /// Returns `true` when the actions are exactly `actions`.
    #[must_use]
    pub fn is(&self, actions: &[&str]) -> bool {
        self.actions.iter().map(String::as_str).eq(actions.iter().copied())
    }

    /// Returns `true` when the change deletes and recreates the object.
    #[must_use]
    pub fn is_replace(&self) -> bool {
        self.is(&["delete", "create"]) || self.is(&["create", "delete"])
    }
}

/// Opaque instance key of a `count` or `for_each` resource.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(transparent)]
pub struct InstanceIndex(Value);

impl InstanceIndex {
    /// Wraps a raw JSON key.
    #[must_use]
    pub const fn new(raw: Value) -> Self {
        Self(raw)
    }

    /// Returns the raw JSON key.
    #[must_use]
    pub const fn raw(&self) -> &Value {
        &self.0
    }

    /// Consumes the wrapper, returning the raw JSON key.
    #[must_use]
    pub fn into_raw(self) -> Value {
        self.0
    }
}

impl Plan {
    /// Every planned resource instance, root module first, then child
    /// modules depth first.
    #[must_use]
    pub fn planned_resources(&self) -> Vec<&Resource> {
        let mut resources = Vec::new();
        if let Some(values) = &self.planned_values {
            values.root_module.collect(&mut resources);
        }
        resources
    }

    /// Finds a planned resource instance by address.
    #[must_use]
    pub fn planned_resource(&self, address: &str) -> Option<&Resource> {
        self.planned_resources()
            .into_iter()
            .find(|resource| resource.address == address)
    }

    /// Finds the change for a resource instance by address.
    #[must_use]
    pub fn resource_change(&self, address: &str) -> Option<&ResourceChange> {
        self.resource_changes
            .iter()
            .find(|change| change.address == address)
    }

    /// Finds drift detected on a resource instance by address.
    #[must_use]
    pub fn drift(&self, address: &str) -> Option<&ResourceChange> {
        self.resource_drift
            .iter()
            .find(|change| change.address == address)
    }

    /// Every resource instance recorded in the prior state.
    #[must_use]
    pub fn prior_resources(&self) -> Vec<&Resource> {
        let mut resources = Vec::new();
        if let Some(values) = self
            .prior_state
            .as_ref()
            .and_then(|state| state.values.as_ref())
        {
            values.root_module.collect(&mut resources);
        }
        resources
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sample_plan_json;
    use rstest::{fixture, rstest};
    use serde_json::json;

    #[fixture]
    fn plan() -> Plan {
        parse_plan(&sample_plan_json()).unwrap_or_else(|err| panic!("parse plan: {err}"))
    }

    #[rstest]
    fn parses_header_and_variables(plan: Plan) {
        assert_eq!(plan.format_version, "1.2");
        assert_eq!(plan.terraform_version.as_deref(), Some("1.6.6"));
        let name = plan
            .variables
            .get("instance_name")
            .unwrap_or_else(|| panic!("missing variable"));
        assert_eq!(name.value, json!("terrastage-abc123"));
    }

    #[rstest]
    fn planned_resources_walk_child_modules(plan: Plan) {
        let addresses: Vec<&str> = plan
            .planned_resources()
            .into_iter()
            .map(|resource| resource.address.as_str())
            .collect();
        assert_eq!(
            addresses,
            vec!["aws_instance.example[0]", "module.network.aws_subnet.private[\"a\"]"]
        );
    }

    #[rstest]
    #[case::count("aws_instance.example[0]", json!(0))]
    #[case::for_each("module.network.aws_subnet.private[\"a\"]", json!("a"))]
    fn instance_index_keeps_raw_json(plan: Plan, #[case] address: &str, #[case] expected: Value) {
        let resource = plan
            .planned_resource(address)
            .unwrap_or_else(|| panic!("missing {address}"));
        let index = resource
            .index
            .clone()
            .unwrap_or_else(|| panic!("{address} should carry an index"));
        assert_eq!(index.raw(), &expected);
        assert_eq!(index.into_raw(), expected);
    }

    #[rstest]
    fn resource_change_exposes_actions_and_reason(plan: Plan) {
        let created = plan
            .resource_change("aws_instance.example[0]")
            .unwrap_or_else(|| panic!("missing instance change"));
        assert!(created.change.is(&["create"]));
        assert_eq!(created.change.after_unknown["public_ip"], json!(true));
        assert_eq!(created.module_address, None);

        let replaced = plan
            .resource_change("module.network.aws_subnet.private[\"a\"]")
            .unwrap_or_else(|| panic!("missing subnet change"));
        assert!(replaced.change.is_replace());
        assert_eq!(replaced.module_address.as_deref(), Some("module.network"));
        assert_eq!(
            replaced.action_reason.as_deref(),
            Some("replace_because_cannot_update")
        );
        assert_eq!(replaced.change.replace_paths, vec![json!(["cidr_block"])]);
    }

    #[rstest]
    fn output_changes_are_keyed_by_name(plan: Plan) {
        let output = plan
            .output_changes
            .get("public_instance_ip")
            .unwrap_or_else(|| panic!("missing output change"));
        assert!(output.is(&["create"]));
        assert_eq!(output.after_unknown, json!(true));
    }

    #[rstest]
    fn unknown_addresses_are_absent(plan: Plan) {
        assert!(plan.planned_resource("aws_instance.missing").is_none());
        assert!(plan.resource_change("aws_instance.missing").is_none());
    }

    #[rstest]
    fn instance_index_serialises_transparently() {
        let index = InstanceIndex::new(json!("blue"));
        let rendered = serde_json::to_string(&index)
            .unwrap_or_else(|err| panic!("serialise: {err}"));
        assert_eq!(rendered, "\"blue\"");
    }

    #[fixture]
    fn drifted_plan() -> Plan {
        let json = json!({
            "format_version": "1.2",
            "prior_state": {
                "format_version": "1.0",
                "terraform_version": "1.6.6",
                "values": {
                    "outputs": { "db_password": { "sensitive": true, "value": "hunter2" } },
                    "root_module": {
                        "resources": [{
                            "address": "aws_db_instance.main",
                            "mode": "managed",
                            "type": "aws_db_instance",
                            "name": "main",
                            "values": { "instance_class": "db.t3.micro" }
                        }]
                    }
                }
            },
            "resource_drift": [{
                "address": "aws_db_instance.main",
                "mode": "managed",
                "type": "aws_db_instance",
                "name": "main",
                "change": {
                    "actions": ["update"],
                    "before": { "instance_class": "db.t3.micro" },
                    "after": { "instance_class": "db.t3.small" }
                }
            }],
            "relevant_attributes": [
                { "resource": "aws_db_instance.main", "attribute": ["instance_class"] }
            ],
            "resource_changes": [{
                "address": "aws_db_instance.main",
                "mode": "managed",
                "type": "aws_db_instance",
                "name": "main",
                "change": {
                    "actions": ["update"],
                    "before": { "password": "old" },
                    "after": { "password": "new" },
                    "before_sensitive": { "password": true },
                    "after_sensitive": { "password": true }
                }
            }]
        });
        serde_json::from_value(json).unwrap_or_else(|err| panic!("decode plan: {err}"))
    }

    #[rstest]
    fn sensitivity_masks_are_exposed(drifted_plan: Plan) {
        let change = drifted_plan
            .resource_change("aws_db_instance.main")
            .unwrap_or_else(|| panic!("missing change"));
        assert_eq!(change.change.before_sensitive, json!({ "password": true }));
        assert_eq!(change.change.after_sensitive, json!({ "password": true }));
    }

    #[rstest]
    fn drift_and_relevant_attributes_are_typed(drifted_plan: Plan) {
        let drift = drifted_plan
            .drift("aws_db_instance.main")
            .unwrap_or_else(|| panic!("missing drift"));
        assert!(drift.change.is(&["update"]));
        assert_eq!(drift.change.after, json!({ "instance_class": "db.t3.small" }));
        assert!(drifted_plan.drift("aws_instance.missing").is_none());

        assert_eq!(
            drifted_plan.relevant_attributes,
            vec![RelevantAttribute {
                resource: String::from("aws_db_instance.main"),
                attribute: vec![json!("instance_class")],
            }]
        );
    }

    #[rstest]
    fn prior_state_values_are_typed(drifted_plan: Plan) {
        let prior = drifted_plan
            .prior_state
            .as_ref()
            .unwrap_or_else(|| panic!("missing prior state"));
        assert_eq!(prior.terraform_version.as_deref(), Some("1.6.6"));
        let addresses: Vec<&str> = drifted_plan
            .prior_resources()
            .into_iter()
            .map(|resource| resource.address.as_str())
            .collect();
        assert_eq!(addresses, vec!["aws_db_instance.main"]);
    }

    #[rstest]
    fn plans_without_prior_state_have_no_prior_resources(plan: Plan) {
        assert!(plan.prior_state.is_none());
        assert!(plan.prior_resources().is_empty());
        assert!(plan.resource_drift.is_empty());
    }

    #[rstest]
    fn rejects_non_plan_documents() {
        let err = parse_plan("[1, 2, 3]").expect_err("array is not a plan");
        assert!(err.to_string().starts_with("failed to parse plan JSON"));
    }

    #[rstest]
    fn empty_object_is_an_empty_plan() {
        let plan = parse_plan("{}").unwrap_or_else(|err| panic!("parse: {err}"));
        assert!(plan.planned_resources().is_empty());
        assert!(plan.resource_changes.is_empty());
    }
}
