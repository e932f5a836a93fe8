//! Application-stage resource restore: registers the backed-up CRDs,
//! downloads the manifest set, filters and remaps it through the collector,
//! applies it under the replace policy and records a per-resource outcome
//! for every object touched.

use std::collections::{HashMap, HashSet};

use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceDefinition, JSONSchemaProps,
};
use kube::api::{Api, GroupVersionKind, PostParams, ResourceExt};
use kube::core::{ApiResource, DynamicObject};
use tracing::{debug, info, warn};

use crate::crd::application_restore::{
    ApplicationRestore, ApplicationRestoreStatus, ReplacePolicy, RestoreResourceInfo,
    RestoreStage, RestoreStatus, RestoreVolumeInfo,
};
use crate::crd::application_backup::ApplicationBackup;
use crate::crd::backup_location::BackupLocation;
use crate::crd::shared::{create_objects_map, ObjectInfo};
use crate::drivers::{DriverRegistry, CSI_DRIVER_NAME};
use crate::error::{is_already_exists, Error, Result};
use crate::objectstore::{self, CRDS_OBJECT};

use super::application_restore::{
    effective_namespace_mapping, effective_replace_policy, Context,
};

/// Reason recorded on resources left in place under the Retain policy.
pub const RETAINED_REASON: &str =
    "Resource restore skipped as it was already present and ReplacePolicy is set to Retain";

// ── CRD registration ──────────────────────────────────────────────────────────

/// Register the CustomResourceDefinitions captured alongside the backup so
/// the manifest set can be applied.  Registration is best-effort for legacy
/// v1beta1 definitions, which modern API servers no longer serve.
pub async fn register_backup_crds(
    ctx: &Context,
    location: &BackupLocation,
    backup_path: &str,
) -> Result<()> {
    let Some(data) = objectstore::download_object(
        ctx.object_store.as_ref(),
        location,
        backup_path,
        CRDS_OBJECT,
        true,
    )
    .await?
    else {
        return Ok(());
    };

    let raw: Vec<serde_json::Value> = serde_json::from_slice(&data)?;
    for value in raw {
        let api_version = value
            .get("apiVersion")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        match api_version {
            "apiextensions.k8s.io/v1" => {
                let crd: CustomResourceDefinition = serde_json::from_value(value)?;
                register_v1_crd(ctx, crd).await?;
            }
            "apiextensions.k8s.io/v1beta1" => {
                // Best effort only: some clusters still serve the legacy
                // endpoint, most reject it.
                if let Err(e) = register_legacy_crd(ctx, value).await {
                    warn!(%e, "skipping legacy v1beta1 CRD registration");
                }
            }
            other => {
                warn!(api_version = %other, "unrecognized CRD payload entry");
            }
        }
    }
    Ok(())
}

async fn register_v1_crd(ctx: &Context, mut crd: CustomResourceDefinition) -> Result<()> {
    let name = crd.name_any();
    crd.metadata.resource_version = None;

    // Backed-up definitions may predate structural schemas; make every
    // version schema permissive so the captured objects round-trip.
    for version in &mut crd.spec.versions {
        let schema = version.schema.get_or_insert_with(Default::default);
        let props = schema.open_api_v3_schema.get_or_insert_with(|| JSONSchemaProps {
            type_: Some("object".to_string()),
            ..Default::default()
        });
        props.x_kubernetes_preserve_unknown_fields = Some(true);
    }
    crd.spec.preserve_unknown_fields = None;

    let crds: Api<CustomResourceDefinition> = Api::all(ctx.client.clone());
    match crds.create(&PostParams::default(), &crd).await {
        Ok(_) => info!(%name, "registered CRD from backup"),
        Err(e) if is_already_exists(&e) => debug!(%name, "CRD already registered"),
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

async fn register_legacy_crd(ctx: &Context, value: serde_json::Value) -> Result<()> {
    let gvk = GroupVersionKind::gvk("apiextensions.k8s.io", "v1beta1", "CustomResourceDefinition");
    let resource = ApiResource::from_gvk_with_plural(&gvk, "customresourcedefinitions");
    let object: DynamicObject = serde_json::from_value(value)?;
    let api: Api<DynamicObject> = Api::all_with(ctx.client.clone(), &resource);
    match api.create(&PostParams::default(), &object).await {
        Ok(_) => Ok(()),
        Err(e) if is_already_exists(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

// ── Object identity ───────────────────────────────────────────────────────────

/// Identity tuple of a manifest, used for include-filter lookups and status
/// records.
pub fn object_info_for(object: &DynamicObject) -> ObjectInfo {
    let (group, version) = object
        .types
        .as_ref()
        .map(|t| {
            match t.api_version.split_once('/') {
                Some((g, v)) => (g.to_string(), v.to_string()),
                None => (String::new(), t.api_version.clone()),
            }
        })
        .unwrap_or_default();
    ObjectInfo {
        group,
        version,
        kind: object
            .types
            .as_ref()
            .map(|t| t.kind.clone())
            .unwrap_or_default(),
        namespace: object.metadata.namespace.clone().unwrap_or_default(),
        name: object.metadata.name.clone().unwrap_or_default(),
    }
}

// ── CSI special-casing ────────────────────────────────────────────────────────

/// Strip the PV/PVC manifests belonging to generic-CSI volumes from the
/// apply set.  Those volumes are re-provisioned by the driver restore, so
/// applying the captured objects on top of them would fight the provisioner.
/// Ownership is decided by inspecting each captured PV's provisioner through
/// the driver registry; claims are matched through their bound PV name.
pub fn remove_csi_volumes_before_apply(
    drivers: &DriverRegistry,
    objects: Vec<DynamicObject>,
) -> Result<Vec<DynamicObject>> {
    let mut csi_pv_names: HashSet<String> = HashSet::new();
    for object in &objects {
        let info = object_info_for(object);
        if info.kind != "PersistentVolume" {
            continue;
        }
        let pv: PersistentVolume = serde_json::from_value(serde_json::to_value(object)?)?;
        if drivers.driver_name_for_pv(&pv)? == CSI_DRIVER_NAME {
            csi_pv_names.insert(info.name);
        }
    }
    if csi_pv_names.is_empty() {
        return Ok(objects);
    }

    Ok(objects
        .into_iter()
        .filter(|object| {
            let info = object_info_for(object);
            match info.kind.as_str() {
                "PersistentVolume" => !csi_pv_names.contains(&info.name),
                "PersistentVolumeClaim" => {
                    let bound = object
                        .data
                        .get("spec")
                        .and_then(|s| s.get("volumeName"))
                        .and_then(|v| v.as_str())
                        .unwrap_or_default();
                    !csi_pv_names.contains(bound)
                }
                _ => true,
            }
        })
        .collect())
}

// ── Status records ────────────────────────────────────────────────────────────

/// Record an outcome for one resource, replacing any earlier record with the
/// same normalized identity so redeliveries never duplicate entries.
pub fn update_resource_status(
    resources: &mut Vec<RestoreResourceInfo>,
    object: ObjectInfo,
    status: RestoreStatus,
    reason: impl Into<String>,
) {
    let key = object.normalized();
    if let Some(existing) = resources
        .iter_mut()
        .find(|r| r.object.normalized() == key)
    {
        existing.status = status;
        existing.reason = reason.into();
        return;
    }
    resources.push(RestoreResourceInfo {
        object,
        status,
        reason: reason.into(),
    });
}

/// Any resource that did not restore cleanly (failed, or merely retained in
/// place) downgrades the whole restore to PartialSuccess, never to Failed:
/// everything that could be applied was.
pub fn classify_resource_records(resources: &[RestoreResourceInfo]) -> RestoreStatus {
    if resources.iter().any(|r| r.status != RestoreStatus::Successful) {
        RestoreStatus::PartialSuccess
    } else {
        RestoreStatus::Successful
    }
}

/// Human-readable summary matching the aggregate outcome.
pub fn resource_outcome_reason(status: RestoreStatus) -> &'static str {
    match status {
        RestoreStatus::Successful => "Volumes and resources were restored successfully",
        _ => "Volumes were restored successfully. Some existing resources were not replaced",
    }
}

/// Run every object through the collector's transform (namespace remap, PV
/// rename, include filter), dropping the ones it says to skip.
pub(super) async fn prepare_objects_for_apply(
    collector: &dyn crate::collector::ResourceCollector,
    objects: Vec<DynamicObject>,
    all_objects: &[DynamicObject],
    include_filter: &HashMap<ObjectInfo, bool>,
    namespace_mapping: &std::collections::BTreeMap<String, String>,
    pv_name_mapping: Option<&HashMap<String, String>>,
    include_optional_resource_types: bool,
) -> Result<Vec<DynamicObject>> {
    let mut prepared = Vec::with_capacity(objects.len());
    for mut object in objects {
        let skip = collector
            .prepare_resource_for_apply(
                &mut object,
                all_objects,
                include_filter,
                namespace_mapping,
                pv_name_mapping,
                include_optional_resource_types,
            )
            .await?;
        if !skip {
            prepared.push(object);
        }
    }
    Ok(prepared)
}

// ── Entry point ───────────────────────────────────────────────────────────────

/// Run the whole application stage and leave `status` at Final with the
/// aggregate outcome filled in.  The caller persists.
pub async fn restore_resources(
    ctx: &Context,
    restore: &ApplicationRestore,
    backup: &ApplicationBackup,
    location: &BackupLocation,
    status: &mut ApplicationRestoreStatus,
) -> Result<()> {
    let name = restore.name_any();
    let backup_path = backup
        .status
        .as_ref()
        .map(|s| s.backup_path.clone())
        .unwrap_or_default();

    register_backup_crds(ctx, location, &backup_path).await?;
    let objects = objectstore::download_resource_objects(
        ctx.object_store.as_ref(),
        location,
        &backup_path,
    )
    .await?;

    let include_filter = create_objects_map(&restore.spec.include_resources);
    let mapping =
        effective_namespace_mapping(&restore.spec.namespace_mapping, &backup.spec.namespaces);
    let policy = effective_replace_policy(restore.spec.replace_policy);

    // Volume ids changed during the volume stage; manifests referencing the
    // old PV names get rewritten on the way in.
    let pv_name_mapping: HashMap<String, String> = status
        .volumes
        .iter()
        .filter(|v| !v.source_volume.is_empty() && !v.restore_volume.is_empty())
        .map(|v| (v.source_volume.clone(), v.restore_volume.clone()))
        .collect();

    let objects = remove_csi_volumes_before_apply(&ctx.drivers, objects)?;

    let all_objects = objects.clone();
    let prepared = prepare_objects_for_apply(
        ctx.collector.as_ref(),
        objects,
        &all_objects,
        &include_filter,
        &mapping,
        Some(&pv_name_mapping),
        restore.spec.include_optional_resource_types,
    )
    .await?;

    if policy == ReplacePolicy::Delete {
        ctx.collector.delete_resources(&prepared).await?;
    }

    for object in &prepared {
        let info = object_info_for(object);
        match ctx.collector.apply_resource(object).await {
            Ok(()) => update_resource_status(
                &mut status.resources,
                info,
                RestoreStatus::Successful,
                "Resource restored successfully",
            ),
            Err(Error::Kube(e)) if is_already_exists(&e) && policy == ReplacePolicy::Retain => {
                update_resource_status(
                    &mut status.resources,
                    info,
                    RestoreStatus::Retained,
                    RETAINED_REASON,
                )
            }
            Err(e) => {
                warn!(%name, object = ?info, %e, "failed to apply resource");
                update_resource_status(
                    &mut status.resources,
                    info,
                    RestoreStatus::Failed,
                    e.to_string(),
                )
            }
        }
    }

    add_csi_volume_records(ctx, &mapping, status).await?;

    status.status = classify_resource_records(&status.resources);
    status.stage = RestoreStage::Final;
    status.reason = resource_outcome_reason(status.status).to_string();
    Ok(())
}

/// Generic-CSI volumes were re-provisioned rather than re-applied, so their
/// PV/PVC objects show up in the status from the live cluster instead.
async fn add_csi_volume_records(
    ctx: &Context,
    mapping: &std::collections::BTreeMap<String, String>,
    status: &mut ApplicationRestoreStatus,
) -> Result<()> {
    let pvs: Api<PersistentVolume> = Api::all(ctx.client.clone());

    let csi_volumes: Vec<RestoreVolumeInfo> = status
        .volumes
        .iter()
        .filter(|v| v.driver_name == CSI_DRIVER_NAME)
        .cloned()
        .collect();

    for volume in csi_volumes {
        let dest_ns = mapping
            .get(&volume.source_namespace)
            .cloned()
            .unwrap_or_else(|| volume.source_namespace.clone());

        let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(ctx.client.clone(), &dest_ns);
        let pvc = pvcs.get(&volume.persistent_volume_claim).await?;
        let pv = pvs.get(&volume.restore_volume).await?;

        update_resource_status(
            &mut status.resources,
            ObjectInfo {
                group: "core".into(),
                version: "v1".into(),
                kind: "PersistentVolumeClaim".into(),
                namespace: dest_ns.clone(),
                name: pvc.name_any(),
            },
            RestoreStatus::Successful,
            "Resource restored successfully",
        );
        update_resource_status(
            &mut status.resources,
            ObjectInfo {
                group: "core".into(),
                version: "v1".into(),
                kind: "PersistentVolume".into(),
                namespace: String::new(),
                name: pv.name_any(),
            },
            RestoreStatus::Successful,
            "Resource restored successfully",
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::TypeMeta;

    fn dynamic(kind: &str, api_version: &str, ns: Option<&str>, name: &str) -> DynamicObject {
        let mut object = DynamicObject {
            types: Some(TypeMeta {
                api_version: api_version.to_string(),
                kind: kind.to_string(),
            }),
            metadata: Default::default(),
            data: serde_json::json!({}),
        };
        object.metadata.name = Some(name.to_string());
        object.metadata.namespace = ns.map(str::to_string);
        object
    }

    #[test]
    fn object_info_splits_group_and_version() {
        let info = object_info_for(&dynamic("Deployment", "apps/v1", Some("ns1"), "web"));
        assert_eq!(info.group, "apps");
        assert_eq!(info.version, "v1");
        assert_eq!(info.kind, "Deployment");

        let core = object_info_for(&dynamic("Service", "v1", Some("ns1"), "svc"));
        assert_eq!(core.group, "");
        assert_eq!(core.version, "v1");
    }

    fn csi_pv(name: &str) -> DynamicObject {
        let mut pv = dynamic("PersistentVolume", "v1", None, name);
        pv.data = serde_json::json!({
            "spec": {
                "csi": {"driver": "ebs.csi.aws.com", "volumeHandle": "vol-abc"}
            }
        });
        pv
    }

    fn bound_pvc(ns: &str, name: &str, volume_name: &str) -> DynamicObject {
        let mut pvc = dynamic("PersistentVolumeClaim", "v1", Some(ns), name);
        pvc.data = serde_json::json!({"spec": {"volumeName": volume_name}});
        pvc
    }

    struct OwnsEverything;

    #[async_trait::async_trait]
    impl crate::drivers::VolumeDriver for OwnsEverything {
        fn name(&self) -> &str {
            "native"
        }
        async fn create_group_snapshot(
            &self,
            _: &crate::crd::group_volume_snapshot::GroupVolumeSnapshot,
        ) -> Result<Vec<crate::crd::group_volume_snapshot::VolumeSnapshotRecord>> {
            unimplemented!()
        }
        async fn get_group_snapshot_status(
            &self,
            _: &crate::crd::group_volume_snapshot::GroupVolumeSnapshot,
        ) -> Result<Vec<crate::crd::group_volume_snapshot::VolumeSnapshotRecord>> {
            unimplemented!()
        }
        async fn delete_group_snapshot(
            &self,
            _: &crate::crd::group_volume_snapshot::GroupVolumeSnapshot,
        ) -> Result<()> {
            unimplemented!()
        }
        async fn inspect_volume(&self, _: &str) -> Result<crate::drivers::VolumeInfo> {
            unimplemented!()
        }
        async fn start_restore(
            &self,
            _: &ApplicationRestore,
            _: &[crate::crd::application_backup::BackupVolumeInfo],
        ) -> Result<Vec<RestoreVolumeInfo>> {
            unimplemented!()
        }
        async fn get_restore_status(
            &self,
            _: &ApplicationRestore,
        ) -> Result<Vec<RestoreVolumeInfo>> {
            unimplemented!()
        }
        async fn cancel_restore(&self, _: &ApplicationRestore) -> Result<()> {
            unimplemented!()
        }
        async fn get_pre_restore_resources(
            &self,
            _: &ApplicationBackup,
            _: &[DynamicObject],
        ) -> Result<Vec<DynamicObject>> {
            unimplemented!()
        }
        fn owns_pv(&self, _: &PersistentVolume) -> bool {
            true
        }
    }

    struct RemapCollector;

    #[async_trait::async_trait]
    impl crate::collector::ResourceCollector for RemapCollector {
        async fn prepare_resource_for_apply(
            &self,
            object: &mut DynamicObject,
            _all_objects: &[DynamicObject],
            include_filter: &HashMap<ObjectInfo, bool>,
            namespace_mapping: &std::collections::BTreeMap<String, String>,
            _pv_name_mapping: Option<&HashMap<String, String>>,
            _include_optional_resource_types: bool,
        ) -> Result<bool> {
            let info = object_info_for(object);
            if !include_filter.is_empty() && !include_filter.contains_key(&info.normalized()) {
                return Ok(true);
            }
            match namespace_mapping.get(&info.namespace) {
                Some(dest) => {
                    object.metadata.namespace = Some(dest.clone());
                    Ok(false)
                }
                None => Ok(true),
            }
        }

        async fn apply_resource(&self, _: &DynamicObject) -> Result<()> {
            unimplemented!()
        }

        async fn delete_resources(&self, _: &[DynamicObject]) -> Result<()> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn prepared_objects_are_remapped_and_filtered() {
        let objects = vec![
            dynamic("ConfigMap", "v1", Some("ns1"), "cfg"),
            dynamic("ConfigMap", "v1", Some("ns2"), "dropped"),
        ];
        let mapping = std::collections::BTreeMap::from([("ns1".to_string(), "dest".to_string())]);
        let prepared = prepare_objects_for_apply(
            &RemapCollector,
            objects.clone(),
            &objects,
            &HashMap::new(),
            &mapping,
            None,
            false,
        )
        .await
        .expect("prepare should succeed");
        assert_eq!(prepared.len(), 1);
        assert_eq!(prepared[0].metadata.name.as_deref(), Some("cfg"));
        assert_eq!(prepared[0].metadata.namespace.as_deref(), Some("dest"));
    }

    #[test]
    fn csi_pv_and_pvc_are_stripped_from_apply_set() {
        let objects = vec![
            csi_pv("pv-1"),
            bound_pvc("ns1", "data", "pv-1"),
            bound_pvc("ns1", "other", "pv-2"),
            dynamic("ConfigMap", "v1", Some("ns1"), "cfg"),
        ];
        // No registered driver claims the PV, so its csi source routes it to
        // the generic CSI path.
        let kept = remove_csi_volumes_before_apply(&DriverRegistry::new(), objects)
            .expect("stripping should succeed");
        let names: Vec<_> = kept
            .iter()
            .map(|o| o.metadata.name.clone().unwrap_or_default())
            .collect();
        assert_eq!(names, vec!["other".to_string(), "cfg".to_string()]);
    }

    #[test]
    fn claimed_volumes_strip_nothing() {
        let mut registry = DriverRegistry::new();
        registry.register(std::sync::Arc::new(OwnsEverything));
        let objects = vec![csi_pv("pv-1"), bound_pvc("ns1", "data", "pv-1")];
        let kept = remove_csi_volumes_before_apply(&registry, objects)
            .expect("stripping should succeed");
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn unclaimed_non_csi_pv_fails_the_strip() {
        let objects = vec![dynamic("PersistentVolume", "v1", None, "pv-1")];
        assert!(remove_csi_volumes_before_apply(&DriverRegistry::new(), objects).is_err());
    }

    #[test]
    fn resource_status_dedupes_by_normalized_identity() {
        let mut resources = Vec::new();
        // Core group written as "" on the first pass and "core" on the
        // second must land on the same record.
        update_resource_status(
            &mut resources,
            ObjectInfo {
                group: String::new(),
                version: "v1".into(),
                kind: "Service".into(),
                namespace: "ns1".into(),
                name: "svc".into(),
            },
            RestoreStatus::Failed,
            "apply failed",
        );
        update_resource_status(
            &mut resources,
            ObjectInfo {
                group: "core".into(),
                version: "v1".into(),
                kind: "Service".into(),
                namespace: "ns1".into(),
                name: "svc".into(),
            },
            RestoreStatus::Successful,
            "Resource restored successfully",
        );
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].status, RestoreStatus::Successful);
    }

    #[test]
    fn any_failed_resource_is_partial_success() {
        let mut resources = Vec::new();
        update_resource_status(
            &mut resources,
            ObjectInfo {
                kind: "Service".into(),
                name: "a".into(),
                ..Default::default()
            },
            RestoreStatus::Successful,
            "",
        );
        assert_eq!(classify_resource_records(&resources), RestoreStatus::Successful);

        update_resource_status(
            &mut resources,
            ObjectInfo {
                kind: "Service".into(),
                name: "b".into(),
                ..Default::default()
            },
            RestoreStatus::Failed,
            "boom",
        );
        assert_eq!(
            classify_resource_records(&resources),
            RestoreStatus::PartialSuccess
        );
    }

    #[test]
    fn outcome_reason_reflects_aggregate_status() {
        assert_eq!(
            resource_outcome_reason(RestoreStatus::Successful),
            "Volumes and resources were restored successfully"
        );
        assert_eq!(
            resource_outcome_reason(RestoreStatus::PartialSuccess),
            "Volumes were restored successfully. Some existing resources were not replaced"
        );
    }

    #[test]
    fn retained_resources_downgrade_to_partial_success() {
        let resources = vec![RestoreResourceInfo {
            status: RestoreStatus::Retained,
            reason: RETAINED_REASON.into(),
            ..Default::default()
        }];
        assert_eq!(
            classify_resource_records(&resources),
            RestoreStatus::PartialSuccess
        );
    }
}
