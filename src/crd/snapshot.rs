//! Child object types materialized for each completed volume snapshot in a
//! group: a namespaced VolumeSnapshot referencing a cluster-scoped
//! VolumeSnapshotData that carries the driver payload.  These follow the
//! external-storage snapshot CRD shapes so existing tooling can consume them.

use k8s_openapi::api::core::v1::ObjectReference;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::shared::SnapshotCondition;

// ── VolumeSnapshot ────────────────────────────────────────────────────────────

/// VolumeSnapshot is the user-visible handle for a single volume's snapshot,
/// owned by the GroupVolumeSnapshot that produced it.
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "volumesnapshot.external-storage.k8s.io",
    version = "v1",
    kind = "VolumeSnapshot",
    namespaced,
    status = "VolumeSnapshotObjectStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotSpec {
    /// Name of the bound VolumeSnapshotData object.
    pub snapshot_data_name: String,

    /// Claim the snapshot was taken from.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub persistent_volume_claim_name: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotObjectStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<SnapshotCondition>,
}

// ── VolumeSnapshotData ────────────────────────────────────────────────────────

/// VolumeSnapshotData holds the driver-specific payload needed to restore
/// from the snapshot.  Cluster-scoped, like PersistentVolume.
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "volumesnapshot.external-storage.k8s.io",
    version = "v1",
    kind = "VolumeSnapshotData",
    status = "VolumeSnapshotDataObjectStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotDataSpec {
    /// Back-reference to the VolumeSnapshot bound to this data object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_snapshot_ref: Option<ObjectReference>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_ref: Option<ObjectReference>,

    /// Driver-specific data-source payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_source: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotDataObjectStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<SnapshotCondition>,
}
