//! Materialization of per-volume child objects for a completed group
//! snapshot: one namespaced VolumeSnapshot plus one cluster-scoped
//! VolumeSnapshotData per record.  Creation is optimistic with a
//! compare-and-replace fallback, and any partial batch is rolled back so a
//! failed group never leaves orphaned children behind.

use std::time::Duration;

use k8s_openapi::api::core::v1::{ObjectReference, PersistentVolume};
use kube::api::{Api, DeleteParams, ObjectMeta, PostParams, Resource, ResourceExt};
use tracing::{info, warn};

use crate::crd::group_volume_snapshot::{GroupVolumeSnapshot, VolumeSnapshotRecord};
use crate::crd::shared::RESTORE_NAMESPACES_ANNOTATION;
use crate::crd::snapshot::{
    VolumeSnapshot, VolumeSnapshotData, VolumeSnapshotDataObjectStatus, VolumeSnapshotDataSpec,
    VolumeSnapshotObjectStatus, VolumeSnapshotSpec,
};
use crate::error::{is_already_exists, is_not_found, Error, Result};

use super::group_snapshot::Context;
use super::helpers::controller_owner_ref;

/// Fixed delay between delete attempts when reverting a partial batch.
const REVERT_RETRY_DELAY: Duration = Duration::from_secs(2);
/// Delete attempts per object before the revert gives up on it.
const REVERT_RETRY_STEPS: u32 = 60;

/// Deterministic child name: redeliveries regenerate the same name instead
/// of piling up duplicates.
pub fn child_snapshot_name(parent_name: &str, pvc_or_volume_id: &str, parent_uid: &str) -> String {
    format!("{parent_name}-{pvc_or_volume_id}-{parent_uid}")
}

/// Create the VolumeSnapshot + VolumeSnapshotData pair for every record in
/// the group.  Returns the records with their child names filled in.  On any
/// failure the children created so far are reverted and the error is
/// propagated so the whole batch can be regenerated later.
pub async fn create_snapshot_and_data_objects(
    ctx: &Context,
    parent: &GroupVolumeSnapshot,
    records: Vec<VolumeSnapshotRecord>,
) -> Result<Vec<VolumeSnapshotRecord>> {
    let parent_name = parent.name_any();
    let parent_uid = parent.metadata.uid.clone().unwrap_or_default();
    let ns = parent.namespace().unwrap_or_default();

    let snapshots: Api<VolumeSnapshot> = Api::namespaced(ctx.client.clone(), &ns);
    let snapshot_data: Api<VolumeSnapshotData> = Api::all(ctx.client.clone());

    let mut created: Vec<String> = Vec::new();
    let mut updated = Vec::with_capacity(records.len());

    for mut record in records {
        let pvc_or_vol_id = pvc_name_for_volume(ctx, &record.parent_volume_id).await;
        let child_name = child_snapshot_name(&parent_name, &pvc_or_vol_id, &parent_uid);

        let data = build_snapshot_data(parent, &child_name, &ns, &record);
        if let Err(e) = create_or_replace_data(&snapshot_data, &data).await {
            revert_snapshot_objects(&snapshots, &snapshot_data, &created).await;
            return Err(e);
        }

        let snap = build_volume_snapshot(parent, &child_name, &ns, &pvc_or_vol_id, &record);
        if let Err(e) = create_or_replace_snapshot(&snapshots, &snap).await {
            // The data object for this record has no snapshot bound to it
            // now, remove it along with the rest of the batch.
            delete_with_retry(&snapshot_data, &child_name).await;
            revert_snapshot_objects(&snapshots, &snapshot_data, &created).await;
            return Err(e);
        }

        created.push(child_name.clone());
        record.volume_snapshot_name = child_name;
        updated.push(record);
    }

    info!(parent = %parent_name, count = created.len(), "created child snapshot objects");
    Ok(updated)
}

/// Resolve the PVC name behind a driver volume id so child names stay
/// human-readable.  Falls back to the raw volume id when any step of the
/// chain fails.
async fn pvc_name_for_volume(ctx: &Context, volume_id: &str) -> String {
    let resolved: Result<String> = async {
        let driver = ctx.drivers.get("")?;
        let info = driver.inspect_volume(volume_id).await?;
        let pvs: Api<PersistentVolume> = Api::all(ctx.client.clone());
        let pv = pvs.get(&info.volume_name).await?;
        pv.spec
            .as_ref()
            .and_then(|s| s.claim_ref.as_ref())
            .and_then(|r| r.name.clone())
            .ok_or_else(|| Error::NotFound(format!("claimRef for PV {}", info.volume_name)))
    }
    .await;

    match resolved {
        Ok(pvc_name) => pvc_name,
        Err(e) => {
            warn!(%volume_id, %e, "could not resolve PVC name, using volume id in child name");
            volume_id.to_string()
        }
    }
}

fn build_snapshot_data(
    parent: &GroupVolumeSnapshot,
    name: &str,
    ns: &str,
    record: &VolumeSnapshotRecord,
) -> VolumeSnapshotData {
    let labels = parent.labels().clone();
    let annotations = parent.annotations().clone();
    VolumeSnapshotData {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: (!labels.is_empty()).then_some(labels),
            annotations: (!annotations.is_empty()).then_some(annotations),
            ..Default::default()
        },
        spec: VolumeSnapshotDataSpec {
            volume_snapshot_ref: Some(ObjectReference {
                kind: Some(VolumeSnapshot::kind(&()).to_string()),
                name: Some(format!("{ns}/{name}")),
                ..Default::default()
            }),
            persistent_volume_ref: None,
            data_source: record.data_source.clone(),
        },
        // The data object carries only the latest condition.
        status: Some(VolumeSnapshotDataObjectStatus {
            conditions: record.conditions.first().cloned().into_iter().collect(),
        }),
    }
}

fn build_volume_snapshot(
    parent: &GroupVolumeSnapshot,
    name: &str,
    ns: &str,
    pvc_name: &str,
    record: &VolumeSnapshotRecord,
) -> VolumeSnapshot {
    let labels = parent.labels().clone();
    let mut annotations = parent.annotations().clone();
    if !parent.spec.restore_namespaces.is_empty() {
        annotations.insert(
            RESTORE_NAMESPACES_ANNOTATION.to_string(),
            parent.spec.restore_namespaces.join(","),
        );
    }
    VolumeSnapshot {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(ns.to_string()),
            owner_references: Some(vec![controller_owner_ref(parent)]),
            labels: (!labels.is_empty()).then_some(labels),
            annotations: (!annotations.is_empty()).then_some(annotations),
            ..Default::default()
        },
        spec: VolumeSnapshotSpec {
            snapshot_data_name: name.to_string(),
            persistent_volume_claim_name: pvc_name.to_string(),
        },
        status: Some(VolumeSnapshotObjectStatus {
            conditions: record.conditions.clone(),
        }),
    }
}

/// Optimistic create; on AlreadyExists, keep a spec-identical leftover from
/// a previous attempt, otherwise delete and recreate it.
async fn create_or_replace_data(
    api: &Api<VolumeSnapshotData>,
    desired: &VolumeSnapshotData,
) -> Result<()> {
    let name = desired.name_any();
    match api.create(&PostParams::default(), desired).await {
        Ok(_) => Ok(()),
        Err(e) if is_already_exists(&e) => {
            let existing = api.get(&name).await?;
            if existing.spec == desired.spec {
                return Ok(());
            }
            info!(%name, "replacing stale VolumeSnapshotData");
            api.delete(&name, &DeleteParams::default()).await?;
            api.create(&PostParams::default(), desired).await?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn create_or_replace_snapshot(
    api: &Api<VolumeSnapshot>,
    desired: &VolumeSnapshot,
) -> Result<()> {
    let name = desired.name_any();
    match api.create(&PostParams::default(), desired).await {
        Ok(_) => Ok(()),
        Err(e) if is_already_exists(&e) => {
            let existing = api.get(&name).await?;
            if existing.spec == desired.spec {
                return Ok(());
            }
            info!(%name, "replacing stale VolumeSnapshot");
            api.delete(&name, &DeleteParams::default()).await?;
            api.create(&PostParams::default(), desired).await?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Best-effort removal of every child pair created so far.  Failures are
/// logged, never propagated, so the caller's original error survives.
async fn revert_snapshot_objects(
    snapshots: &Api<VolumeSnapshot>,
    snapshot_data: &Api<VolumeSnapshotData>,
    names: &[String],
) {
    if names.is_empty() {
        return;
    }
    warn!(count = names.len(), "reverting partially created child snapshot objects");
    for name in names {
        delete_with_retry(snapshots, name).await;
        delete_with_retry(snapshot_data, name).await;
    }
}

/// Delete with a fixed 2s delay between attempts; NotFound counts as done.
async fn delete_with_retry<K>(api: &Api<K>, name: &str)
where
    K: Resource + Clone + std::fmt::Debug + serde::de::DeserializeOwned,
{
    for _ in 0..REVERT_RETRY_STEPS {
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => return,
            Err(e) if is_not_found(&e) => return,
            Err(e) => {
                warn!(%name, %e, "delete failed, retrying");
                tokio::time::sleep(REVERT_RETRY_DELAY).await;
            }
        }
    }
    warn!(%name, "giving up on deleting child snapshot object");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::group_volume_snapshot::GroupVolumeSnapshotSpec;
    use crate::crd::shared::{SnapshotCondition, SnapshotConditionType};
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn parent() -> GroupVolumeSnapshot {
        GroupVolumeSnapshot {
            metadata: ObjectMeta {
                name: Some("nightly".into()),
                namespace: Some("apps".into()),
                uid: Some("uid-123".into()),
                labels: Some(BTreeMap::from([("app".to_string(), "db".to_string())])),
                annotations: Some(BTreeMap::from([(
                    "owner".to_string(),
                    "team-a".to_string(),
                )])),
                ..Default::default()
            },
            spec: GroupVolumeSnapshotSpec {
                restore_namespaces: vec!["dev".into(), "staging".into()],
                ..Default::default()
            },
            status: None,
        }
    }

    fn record_with_conditions() -> VolumeSnapshotRecord {
        VolumeSnapshotRecord {
            data_source: Some(serde_json::json!({"snapshotId": "abc"})),
            conditions: vec![
                SnapshotCondition {
                    condition_type: SnapshotConditionType::Ready,
                    status: "True".into(),
                    message: "snapshot ready".into(),
                },
                SnapshotCondition {
                    condition_type: SnapshotConditionType::Pending,
                    status: "False".into(),
                    message: String::new(),
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn child_names_are_deterministic() {
        let a = child_snapshot_name("nightly", "data-pvc", "uid-123");
        let b = child_snapshot_name("nightly", "data-pvc", "uid-123");
        assert_eq!(a, b);
        assert_eq!(a, "nightly-data-pvc-uid-123");
    }

    #[test]
    fn child_snapshot_carries_owner_and_restore_namespaces() {
        let record = record_with_conditions();
        let snap = build_volume_snapshot(
            &parent(),
            "nightly-data-pvc-uid-123",
            "apps",
            "data-pvc",
            &record,
        );
        let owners = snap.metadata.owner_references.as_ref().unwrap();
        assert_eq!(owners[0].uid, "uid-123");
        assert_eq!(owners[0].controller, Some(true));
        assert_eq!(
            snap.metadata
                .annotations
                .as_ref()
                .unwrap()
                .get(RESTORE_NAMESPACES_ANNOTATION)
                .map(String::as_str),
            Some("dev,staging")
        );
        assert_eq!(snap.spec.snapshot_data_name, "nightly-data-pvc-uid-123");
        assert_eq!(snap.spec.persistent_volume_claim_name, "data-pvc");
    }

    #[test]
    fn children_inherit_parent_labels_and_annotations() {
        let record = record_with_conditions();
        let snap = build_volume_snapshot(&parent(), "n", "apps", "pvc", &record);
        let data = build_snapshot_data(&parent(), "n", "apps", &record);

        for metadata in [&snap.metadata, &data.metadata] {
            assert_eq!(
                metadata.labels.as_ref().unwrap().get("app").map(String::as_str),
                Some("db")
            );
            assert_eq!(
                metadata
                    .annotations
                    .as_ref()
                    .unwrap()
                    .get("owner")
                    .map(String::as_str),
                Some("team-a")
            );
        }
    }

    #[test]
    fn child_snapshot_carries_full_condition_list() {
        let record = record_with_conditions();
        let snap = build_volume_snapshot(&parent(), "n", "apps", "pvc", &record);
        let conditions = &snap.status.as_ref().unwrap().conditions;
        assert_eq!(conditions.len(), 2);
        assert_eq!(conditions[0].condition_type, SnapshotConditionType::Ready);
    }

    #[test]
    fn snapshot_data_carries_latest_condition_and_payload() {
        let record = record_with_conditions();
        let data = build_snapshot_data(&parent(), "nightly-data-pvc-uid-123", "apps", &record);

        let sref = data.spec.volume_snapshot_ref.as_ref().unwrap();
        assert_eq!(sref.name.as_deref(), Some("apps/nightly-data-pvc-uid-123"));
        assert_eq!(data.spec.data_source, record.data_source);

        let conditions = &data.status.as_ref().unwrap().conditions;
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].condition_type, SnapshotConditionType::Ready);
        assert_eq!(conditions[0].status, "True");
    }

    #[test]
    fn bare_parent_and_empty_restore_namespaces_add_no_metadata() {
        let mut p = parent();
        p.metadata.labels = None;
        p.metadata.annotations = None;
        p.spec.restore_namespaces.clear();
        let snap = build_volume_snapshot(&p, "n", "apps", "pvc", &VolumeSnapshotRecord::default());
        assert!(snap.metadata.annotations.is_none());
        assert!(snap.metadata.labels.is_none());
    }
}
