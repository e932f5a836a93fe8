use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Action type for a rule item.  Only command execution is defined today.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum RuleActionType {
    #[default]
    #[serde(rename = "command")]
    Command,
}

/// A single command to run in pods matched by the rule item's selector.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RuleAction {
    #[serde(default, rename = "type")]
    pub action_type: RuleActionType,

    /// Keep the command running until the hook runner is told to terminate
    /// it (e.g. a filesystem freeze held across the snapshot trigger).
    #[serde(default)]
    pub background: bool,

    /// The command itself.
    pub value: String,
}

/// One item of a rule: a pod selector plus the actions to run in the
/// matching pods.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RuleItem {
    #[serde(default)]
    pub pod_selector: BTreeMap<String, String>,

    pub actions: Vec<RuleAction>,
}

/// Rule holds pre/post hook commands referenced by name from
/// GroupVolumeSnapshot specs.  Execution is delegated to the external
/// RuleExecutor; the controllers only validate existence and hand rules over.
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "snapshot-operator.io",
    version = "v1alpha1",
    kind = "Rule",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct RuleSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<RuleItem>,
}
