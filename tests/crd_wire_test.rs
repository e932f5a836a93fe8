//! Wire-format coverage for the custom resource types: defaults, camelCase
//! field names, and the spec-equality semantics the child-object
//! replacement path relies on.

use serde_json::json;

use snapshot_operator::crd::application_restore::{
    ApplicationRestoreSpec, ApplicationRestoreStatus, ReplacePolicy, RestoreStage, RestoreStatus,
};
use snapshot_operator::crd::group_volume_snapshot::{
    GroupSnapshotStage, GroupSnapshotStatus, GroupVolumeSnapshotStatus,
};
use snapshot_operator::crd::snapshot::{VolumeSnapshotDataSpec, VolumeSnapshotSpec};

#[test]
fn restore_spec_parses_camel_case_fields() {
    let spec: ApplicationRestoreSpec = serde_json::from_value(json!({
        "backupName": "nightly",
        "backupLocation": "primary",
        "namespaceMapping": {"src": "dest"},
        "replacePolicy": "Delete",
        "includeOptionalResourceTypes": true,
        "includeResources": [
            {"group": "apps", "version": "v1", "kind": "Deployment", "namespace": "src", "name": "web"}
        ],
    }))
    .unwrap();

    assert_eq!(spec.backup_name, "nightly");
    assert_eq!(spec.replace_policy, Some(ReplacePolicy::Delete));
    assert_eq!(spec.namespace_mapping.get("src").map(String::as_str), Some("dest"));
    assert_eq!(spec.include_resources.len(), 1);
    assert!(spec.include_optional_resource_types);
}

#[test]
fn minimal_restore_spec_uses_defaults() {
    let spec: ApplicationRestoreSpec = serde_json::from_value(json!({
        "backupName": "nightly",
        "backupLocation": "primary",
    }))
    .unwrap();

    assert!(spec.namespace_mapping.is_empty());
    assert_eq!(spec.replace_policy, None);
    assert!(spec.include_resources.is_empty());
    assert!(!spec.include_optional_resource_types);
}

#[test]
fn empty_statuses_decode_to_initial_state() {
    let group: GroupVolumeSnapshotStatus = serde_json::from_str("{}").unwrap();
    assert_eq!(group.stage, GroupSnapshotStage::Initial);
    assert_eq!(group.status, GroupSnapshotStatus::Pending);

    let restore: ApplicationRestoreStatus = serde_json::from_str("{}").unwrap();
    assert_eq!(restore.stage, RestoreStage::Initial);
    assert_eq!(restore.status, RestoreStatus::Initial);
    assert!(restore.finish_timestamp.is_none());
}

#[test]
fn cleared_snapshot_records_survive_a_merge_patch() {
    // The retry path clears volumeSnapshots through a merge patch; that only
    // works if the empty list is actually on the wire.
    let status = GroupVolumeSnapshotStatus {
        stage: GroupSnapshotStage::Snapshot,
        status: GroupSnapshotStatus::Pending,
        num_retries: 1,
        volume_snapshots: Vec::new(),
    };
    let value = serde_json::to_value(&status).unwrap();
    assert_eq!(value["volumeSnapshots"], json!([]));
}

#[test]
fn snapshot_spec_equality_detects_drift() {
    let a = VolumeSnapshotSpec {
        snapshot_data_name: "grp-pvc-uid".into(),
        persistent_volume_claim_name: "pvc".into(),
    };
    let mut b = a.clone();
    assert_eq!(a, b);
    b.persistent_volume_claim_name = "other".into();
    assert_ne!(a, b);
}

#[test]
fn snapshot_data_spec_equality_covers_the_payload() {
    let a = VolumeSnapshotDataSpec {
        volume_snapshot_ref: None,
        persistent_volume_ref: None,
        data_source: Some(json!({"snapshotId": "abc"})),
    };
    let mut b = a.clone();
    assert_eq!(a, b);
    b.data_source = Some(json!({"snapshotId": "def"}));
    assert_ne!(a, b);
}
