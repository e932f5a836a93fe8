use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::shared::SnapshotCondition;

// ── CRD ───────────────────────────────────────────────────────────────────────

/// GroupVolumeSnapshot requests a crash-consistent point-in-time snapshot of
/// every PersistentVolumeClaim matched by the selector, taken as a single
/// group by the owning volume driver.
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "snapshot-operator.io",
    version = "v1alpha1",
    kind = "GroupVolumeSnapshot",
    shortname = "gvs",
    namespaced,
    status = "GroupVolumeSnapshotStatus",
    printcolumn = r#"{"name": "Stage", "type": "string", "jsonPath": ".status.stage"}"#,
    printcolumn = r#"{"name": "Status", "type": "string", "jsonPath": ".status.status"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct GroupVolumeSnapshotSpec {
    /// Selector over the PVCs to snapshot.  Only matchLabels is supported;
    /// matchExpressions fails validation.
    pub pvc_selector: LabelSelector,

    /// Name of a Rule to run before the snapshot is triggered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_exec_rule: Option<String>,

    /// Name of a Rule to run after the snapshot completes (or fails).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_exec_rule: Option<String>,

    /// How many times a failed group snapshot is restarted before the
    /// resource is marked Failed.  0 disables retries.
    #[serde(default)]
    pub max_retries: i32,

    /// Namespaces granted restore access to the resulting snapshots.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub restore_namespaces: Vec<String>,
}

// ── Status ────────────────────────────────────────────────────────────────────

/// Coarse-grained workflow phase, persisted durably.  Advances monotonically
/// except for the retry path, which re-enters Snapshot.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum GroupSnapshotStage {
    #[default]
    Initial,
    PreChecks,
    PreSnapshot,
    Snapshot,
    PostSnapshot,
    Final,
}

impl std::fmt::Display for GroupSnapshotStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Initial => "Initial",
            Self::PreChecks => "PreChecks",
            Self::PreSnapshot => "PreSnapshot",
            Self::Snapshot => "Snapshot",
            Self::PostSnapshot => "PostSnapshot",
            Self::Final => "Final",
        };
        write!(f, "{s}")
    }
}

/// Fine-grained outcome within a stage.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum GroupSnapshotStatus {
    #[default]
    Pending,
    InProgress,
    Successful,
    Failed,
}

impl std::fmt::Display for GroupSnapshotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "Pending",
            Self::InProgress => "InProgress",
            Self::Successful => "Successful",
            Self::Failed => "Failed",
        };
        write!(f, "{s}")
    }
}

/// Per-volume snapshot record reported by the driver and enriched with the
/// derived child object name once materialized.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotRecord {
    /// Volume (or claim) id the snapshot was taken from.
    pub parent_volume_id: String,

    /// Driver-side task id for this snapshot, used in failure reporting.
    #[serde(default)]
    pub task_id: String,

    /// Driver-reported conditions, latest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<SnapshotCondition>,

    /// Name of the derived VolumeSnapshot child object, set once created.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub volume_snapshot_name: String,

    /// Driver-specific data-source payload carried into the child
    /// VolumeSnapshotData object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_source: Option<serde_json::Value>,
}

/// GroupVolumeSnapshotStatus is the controller's sole durable memory between
/// reconciliations.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GroupVolumeSnapshotStatus {
    #[serde(default)]
    pub stage: GroupSnapshotStage,

    #[serde(default)]
    pub status: GroupSnapshotStatus,

    #[serde(default)]
    pub num_retries: i32,

    // Always serialized so a merge patch can clear it on retry.
    #[serde(default)]
    pub volume_snapshots: Vec<VolumeSnapshotRecord>,
}

impl GroupVolumeSnapshot {
    /// Current stage, defaulting to Initial when status is unset.
    pub fn stage(&self) -> GroupSnapshotStage {
        self.status.as_ref().map(|s| s.stage).unwrap_or_default()
    }

    /// Current status, defaulting to Pending when status is unset.
    pub fn overall_status(&self) -> GroupSnapshotStatus {
        self.status.as_ref().map(|s| s.status).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_defaults_to_initial_pending() {
        let status: GroupVolumeSnapshotStatus = serde_json::from_str("{}").unwrap();
        assert_eq!(status.stage, GroupSnapshotStage::Initial);
        assert_eq!(status.status, GroupSnapshotStatus::Pending);
        assert_eq!(status.num_retries, 0);
        assert!(status.volume_snapshots.is_empty());
    }

    #[test]
    fn spec_uses_camel_case_wire_names() {
        let spec: GroupVolumeSnapshotSpec = serde_json::from_value(serde_json::json!({
            "pvcSelector": {"matchLabels": {"app": "db"}},
            "preExecRule": "freeze",
            "maxRetries": 2,
            "restoreNamespaces": ["other"],
        }))
        .unwrap();
        assert_eq!(spec.pre_exec_rule.as_deref(), Some("freeze"));
        assert_eq!(spec.max_retries, 2);
        assert_eq!(spec.restore_namespaces, vec!["other".to_string()]);
    }
}
