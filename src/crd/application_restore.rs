use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::shared::ObjectInfo;

// ── Spec sub-types ────────────────────────────────────────────────────────────

/// Governs what happens when a restored object already exists at the
/// destination: leave it untouched (Retain) or delete it first (Delete).
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum ReplacePolicy {
    #[default]
    Retain,
    Delete,
}

// ── CRD ───────────────────────────────────────────────────────────────────────

/// ApplicationRestore restores the resources and volumes captured by an
/// ApplicationBackup into a (possibly remapped) set of namespaces.
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "snapshot-operator.io",
    version = "v1alpha1",
    kind = "ApplicationRestore",
    shortname = "apprestore",
    namespaced,
    status = "ApplicationRestoreStatus",
    printcolumn = r#"{"name": "Backup", "type": "string", "jsonPath": ".spec.backupName"}"#,
    printcolumn = r#"{"name": "Stage", "type": "string", "jsonPath": ".status.stage"}"#,
    printcolumn = r#"{"name": "Status", "type": "string", "jsonPath": ".status.status"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationRestoreSpec {
    /// Name of the ApplicationBackup to restore from (same namespace).
    pub backup_name: String,

    /// Name of the BackupLocation holding the backup payloads.
    pub backup_location: String,

    /// Source namespace → destination namespace.  Empty means identity
    /// mapping over the backup's namespace set.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub namespace_mapping: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replace_policy: Option<ReplacePolicy>,

    /// When non-empty, only the listed resources are restored.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_resources: Vec<ObjectInfo>,

    /// Also restore resource types the collector treats as optional.
    #[serde(default)]
    pub include_optional_resource_types: bool,
}

// ── Status ────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum RestoreStage {
    #[default]
    Initial,
    Volumes,
    Applications,
    Final,
}

impl std::fmt::Display for RestoreStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Initial => "Initial",
            Self::Volumes => "Volumes",
            Self::Applications => "Applications",
            Self::Final => "Final",
        };
        write!(f, "{s}")
    }
}

/// Outcome classification shared by the overall restore, its per-volume
/// records and its per-resource records.  Retained only ever appears on
/// per-resource records.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum RestoreStatus {
    #[default]
    Initial,
    Pending,
    InProgress,
    Successful,
    PartialSuccess,
    Retained,
    Failed,
}

impl std::fmt::Display for RestoreStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Initial => "Initial",
            Self::Pending => "Pending",
            Self::InProgress => "InProgress",
            Self::Successful => "Successful",
            Self::PartialSuccess => "PartialSuccess",
            Self::Retained => "Retained",
            Self::Failed => "Failed",
        };
        write!(f, "{s}")
    }
}

/// Per-volume restore record.  The owning driver is authoritative: each
/// status poll overwrites these wholesale.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreVolumeInfo {
    #[serde(default)]
    pub persistent_volume_claim: String,
    #[serde(default)]
    pub source_namespace: String,
    #[serde(default)]
    pub source_volume: String,
    #[serde(default)]
    pub restore_volume: String,
    #[serde(default)]
    pub driver_name: String,
    #[serde(default)]
    pub status: RestoreStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub total_size: u64,
}

/// Per-resource restore record, keyed by the normalized ObjectInfo tuple.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreResourceInfo {
    #[serde(flatten)]
    pub object: ObjectInfo,
    #[serde(default)]
    pub status: RestoreStatus,
    #[serde(default)]
    pub reason: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationRestoreStatus {
    #[serde(default)]
    pub stage: RestoreStage,

    #[serde(default)]
    pub status: RestoreStatus,

    // These are overwritten wholesale by status patches, so they always
    // serialize even when empty.
    #[serde(default)]
    pub reason: String,

    #[serde(default)]
    pub volumes: Vec<RestoreVolumeInfo>,

    #[serde(default)]
    pub resources: Vec<RestoreResourceInfo>,

    /// Cumulative restored bytes, summed over volume records on success.
    #[serde(default)]
    pub total_size: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_timestamp: Option<Time>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_timestamp: Option<Time>,
}

impl ApplicationRestore {
    pub fn stage(&self) -> RestoreStage {
        self.status.as_ref().map(|s| s.stage).unwrap_or_default()
    }
}
