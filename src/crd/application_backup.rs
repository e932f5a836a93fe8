use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// ApplicationBackup is produced by the backup side of the pipeline and is a
/// read-only input here: the restore controller reads its namespace set, its
/// per-volume records and the object-store path of its payloads.
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "snapshot-operator.io",
    version = "v1alpha1",
    kind = "ApplicationBackup",
    shortname = "appbackup",
    namespaced,
    status = "ApplicationBackupStatus",
    printcolumn = r#"{"name": "Location", "type": "string", "jsonPath": ".spec.backupLocation"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationBackupSpec {
    /// Name of the BackupLocation the payloads were written to.
    pub backup_location: String,

    /// Namespaces captured by this backup.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<String>,
}

/// Volume captured by the backup.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupVolumeInfo {
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub persistent_volume_claim: String,
    /// Backing volume id.
    #[serde(default)]
    pub volume: String,
    /// Driver that owns this volume.  Empty means the default driver.
    #[serde(default)]
    pub driver_name: String,
    #[serde(default)]
    pub total_size: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationBackupStatus {
    /// Object-store prefix under which this backup's payloads live.
    #[serde(default)]
    pub backup_path: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<BackupVolumeInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_timestamp: Option<Time>,
}
