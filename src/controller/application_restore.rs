//! ApplicationRestore controller.
//!
//! Initial → Volumes → Applications → Final.  The volume stage fans out to
//! the owning drivers and polls them to completion; the application stage
//! re-applies the backed-up manifests through the resource collector.  All
//! durable progress lives in status; driver work is cancelled through the
//! finalizer when the resource is deleted.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams, ResourceExt};
use kube::core::DynamicObject;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::events::{EventType, Reporter};
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::Client;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::collector::ResourceCollector;
use crate::crd::application_backup::{ApplicationBackup, BackupVolumeInfo};
use crate::crd::application_restore::{
    ApplicationRestore, ApplicationRestoreStatus, ReplacePolicy, RestoreStage, RestoreStatus,
    RestoreVolumeInfo,
};
use crate::crd::backup_location::BackupLocation;
use crate::crd::shared::{create_objects_map, ObjectInfo};
use crate::drivers::{DriverRegistry, CSI_DRIVER_NAME};
use crate::error::{is_already_exists, Error, Result};
use crate::objectstore::{self, ObjectStore};

use super::helpers::{publish_event, FIELD_MANAGER, FINALIZER_CLEANUP};
use super::restore_resources;

const RESYNC: Duration = Duration::from_secs(10);
const ERROR_REQUEUE: Duration = Duration::from_secs(30);

const REASON_FAILED: &str = "RestoreFailed";
const REASON_COMPLETED: &str = "RestoreCompleted";
const REASON_PARTIAL: &str = "RestorePartialSuccess";

// ── Shared context ────────────────────────────────────────────────────────────

pub struct Context {
    pub client: Client,
    pub drivers: DriverRegistry,
    pub collector: Arc<dyn ResourceCollector>,
    pub object_store: Arc<dyn ObjectStore>,
    pub reporter: Reporter,

    /// Namespace from which restores may target arbitrary namespaces.
    /// Restores created anywhere else are confined to their own namespace.
    pub admin_namespace: String,
}

// ── Controller entry point ────────────────────────────────────────────────────

pub async fn run(ctx: Arc<Context>) {
    let restores: Api<ApplicationRestore> = Api::all(ctx.client.clone());

    Controller::new(restores, WatcherConfig::default())
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((_obj, _action)) => {}
                Err(e) => {
                    let msg = format!("{e:?}");
                    if msg.contains("ObjectNotFound") {
                        debug!("reconcile: object already deleted");
                    } else {
                        warn!("reconcile failed: {msg}");
                    }
                }
            }
        })
        .await;
}

async fn reconcile(restore: Arc<ApplicationRestore>, ctx: Arc<Context>) -> Result<Action> {
    let ns = restore.namespace().unwrap_or_default();
    let api: Api<ApplicationRestore> = Api::namespaced(ctx.client.clone(), &ns);

    finalizer(&api, FINALIZER_CLEANUP, restore, |event| async {
        match event {
            FinalizerEvent::Apply(restore) => handle(&restore, &ctx, &api).await,
            FinalizerEvent::Cleanup(restore) => handle_delete(&restore, &ctx).await,
        }
    })
    .await
    .map_err(|e| Error::Finalizer(Box::new(e)))
}

fn error_policy(restore: Arc<ApplicationRestore>, error: &Error, _ctx: Arc<Context>) -> Action {
    let name = restore.name_any();
    if matches!(error, Error::Finalizer(e) if e.to_string().contains("ObjectNotFound")) {
        debug!(%name, "object already deleted, skipping requeue");
        return Action::await_change();
    }
    warn!(%name, %error, "reconcile error, requeuing in 30s");
    Action::requeue(ERROR_REQUEUE)
}

// ── Stage dispatch ────────────────────────────────────────────────────────────

async fn handle(
    restore: &ApplicationRestore,
    ctx: &Context,
    api: &Api<ApplicationRestore>,
) -> Result<Action> {
    let result = run_stage(restore, ctx, api).await;

    match result {
        Ok(action) => Ok(action),
        Err(e) => {
            publish_event(
                &ctx.client,
                &ctx.reporter,
                restore,
                EventType::Warning,
                REASON_FAILED,
                "Reconcile",
                Some(e.to_string()),
            )
            .await;
            Err(e)
        }
    }
}

pub(super) async fn persist_status(
    api: &Api<ApplicationRestore>,
    name: &str,
    status: &mut ApplicationRestoreStatus,
) -> Result<()> {
    status.last_update_timestamp = Some(Time(Utc::now()));
    let patch = json!({ "status": status });
    api.patch_status(
        name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

/// Resolve the backup and its backup location.  The location named in the
/// restore spec wins over the one recorded in the backup.
async fn fetch_backup_and_location(
    restore: &ApplicationRestore,
    ctx: &Context,
) -> Result<(ApplicationBackup, BackupLocation)> {
    let ns = restore.namespace().unwrap_or_default();
    let backups: Api<ApplicationBackup> = Api::namespaced(ctx.client.clone(), &ns);
    let backup = backups.get(&restore.spec.backup_name).await.map_err(|e| {
        Error::NotFound(format!("backup {:?}: {e}", restore.spec.backup_name))
    })?;

    let locations: Api<BackupLocation> = Api::namespaced(ctx.client.clone(), &ns);
    let location = locations
        .get(&restore.spec.backup_location)
        .await
        .map_err(|e| {
            Error::NotFound(format!(
                "backup location {:?}: {e}",
                restore.spec.backup_location
            ))
        })?;

    Ok((backup, location))
}

// ── Effective spec defaults ───────────────────────────────────────────────────

/// An empty mapping in the spec means the identity mapping over everything
/// the backup captured.
pub fn effective_namespace_mapping(
    spec_mapping: &BTreeMap<String, String>,
    backup_namespaces: &[String],
) -> BTreeMap<String, String> {
    if !spec_mapping.is_empty() {
        return spec_mapping.clone();
    }
    backup_namespaces
        .iter()
        .map(|ns| (ns.clone(), ns.clone()))
        .collect()
}

pub fn effective_replace_policy(spec_policy: Option<ReplacePolicy>) -> ReplacePolicy {
    spec_policy.unwrap_or_default()
}

/// A restore outside the admin namespace may only target its own namespace.
pub fn namespace_restore_allowed(
    restore_namespace: &str,
    admin_namespace: &str,
    mapping: &BTreeMap<String, String>,
) -> bool {
    if restore_namespace == admin_namespace {
        return true;
    }
    mapping.values().all(|dest| dest == restore_namespace)
}

async fn run_stage(
    restore: &ApplicationRestore,
    ctx: &Context,
    api: &Api<ApplicationRestore>,
) -> Result<Action> {
    if restore.stage() == RestoreStage::Final {
        return Ok(Action::await_change());
    }

    let mut status = restore.status.clone().unwrap_or_default();
    let Some((backup, location)) = pre_stage_gate(restore, ctx, api, &mut status).await? else {
        return Ok(Action::requeue(RESYNC));
    };

    match restore.stage() {
        RestoreStage::Initial => handle_initial(restore, api, &mut status).await,
        RestoreStage::Volumes => {
            handle_volumes(restore, ctx, api, &backup, &location, &mut status).await
        }
        RestoreStage::Applications => {
            run_applications(restore, ctx, api, &backup, &location, &mut status).await
        }
        RestoreStage::Final => Ok(Action::await_change()),
    }
}

// ── Pre-stage gate ────────────────────────────────────────────────────────────

/// Checks that must hold on every pass, not just the first: the backup has
/// payloads, the restore is allowed to target its namespaces, and the
/// destination namespaces exist.  Namespaces are mutable external state and
/// can disappear between reconciliations, so this runs ahead of every stage.
/// Returns None while the backup is still being written.
async fn pre_stage_gate(
    restore: &ApplicationRestore,
    ctx: &Context,
    api: &Api<ApplicationRestore>,
    status: &mut ApplicationRestoreStatus,
) -> Result<Option<(ApplicationBackup, BackupLocation)>> {
    let name = restore.name_any();
    let ns = restore.namespace().unwrap_or_default();

    let (backup, location) = fetch_backup_and_location(restore, ctx).await?;

    let backup_path = backup
        .status
        .as_ref()
        .map(|s| s.backup_path.clone())
        .unwrap_or_default();
    if backup_path.is_empty() {
        info!(%name, backup = %restore.spec.backup_name, "backup has no payloads yet, waiting");
        status.status = RestoreStatus::Pending;
        persist_status(api, &name, status).await?;
        return Ok(None);
    }

    let mapping = effective_namespace_mapping(&restore.spec.namespace_mapping, &backup.spec.namespaces);
    if !namespace_restore_allowed(&ns, &ctx.admin_namespace, &mapping) {
        status.status = RestoreStatus::Failed;
        status.stage = RestoreStage::Final;
        status.reason = format!(
            "Restores created outside of namespace {} can only restore into their own namespace",
            ctx.admin_namespace
        );
        status.finish_timestamp = Some(Time(Utc::now()));
        persist_status(api, &name, status).await?;
        return Err(Error::validation(status.reason.clone()));
    }

    create_destination_namespaces(ctx, &location, &backup_path, &mapping).await?;

    Ok(Some((backup, location)))
}

// ── Initial ───────────────────────────────────────────────────────────────────

async fn handle_initial(
    restore: &ApplicationRestore,
    api: &Api<ApplicationRestore>,
    status: &mut ApplicationRestoreStatus,
) -> Result<Action> {
    let name = restore.name_any();
    status.status = RestoreStatus::InProgress;
    status.stage = RestoreStage::Volumes;
    persist_status(api, &name, status).await?;
    info!(%name, "restore pre-checks passed, starting volume restore");
    Ok(Action::requeue(Duration::ZERO))
}

/// Make every destination namespace exist, carrying forward the captured
/// labels and annotations when the backup includes a namespaces payload.
async fn create_destination_namespaces(
    ctx: &Context,
    location: &BackupLocation,
    backup_path: &str,
    mapping: &BTreeMap<String, String>,
) -> Result<()> {
    let namespaces: Api<Namespace> = Api::all(ctx.client.clone());

    let captured: Vec<Namespace> = match objectstore::download_object(
        ctx.object_store.as_ref(),
        location,
        backup_path,
        objectstore::NAMESPACES_OBJECT,
        true,
    )
    .await?
    {
        Some(data) => serde_json::from_slice(&data)?,
        None => Vec::new(),
    };
    let captured_by_name: HashMap<String, &Namespace> = captured
        .iter()
        .filter_map(|n| n.metadata.name.clone().map(|name| (name, n)))
        .collect();

    for (source, dest) in mapping {
        let source_meta = captured_by_name.get(source).map(|n| &n.metadata);
        let desired = Namespace {
            metadata: ObjectMeta {
                name: Some(dest.clone()),
                labels: source_meta.and_then(|m| m.labels.clone()),
                annotations: source_meta.and_then(|m| m.annotations.clone()),
                ..Default::default()
            },
            ..Default::default()
        };

        match namespaces.create(&PostParams::default(), &desired).await {
            Ok(_) => info!(namespace = %dest, "created destination namespace"),
            Err(e) if is_already_exists(&e) => {
                // Keep an existing namespace but sync the captured metadata
                // onto it.
                if source_meta.is_some() {
                    let patch = json!({
                        "metadata": {
                            "labels": desired.metadata.labels,
                            "annotations": desired.metadata.annotations,
                        }
                    });
                    namespaces
                        .patch(dest, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
                        .await?;
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

// ── Volumes ───────────────────────────────────────────────────────────────────

/// Group the backup's volumes by owning driver, honoring the namespace
/// mapping (a volume whose source namespace has no destination is not
/// restored) and the restore's include filter (keyed on the source PVC).
pub fn volumes_to_restore(
    backup_volumes: &[BackupVolumeInfo],
    mapping: &BTreeMap<String, String>,
    include_filter: &HashMap<ObjectInfo, bool>,
) -> BTreeMap<String, Vec<BackupVolumeInfo>> {
    let mut grouped: BTreeMap<String, Vec<BackupVolumeInfo>> = BTreeMap::new();
    for volume in backup_volumes {
        if !mapping.contains_key(&volume.namespace) {
            continue;
        }
        if !include_filter.is_empty() {
            let key = ObjectInfo {
                group: String::new(),
                version: "v1".into(),
                kind: "PersistentVolumeClaim".into(),
                namespace: volume.namespace.clone(),
                name: volume.persistent_volume_claim.clone(),
            }
            .normalized();
            if !include_filter.contains_key(&key) {
                continue;
            }
        }
        let driver = if volume.driver_name.is_empty() {
            crate::drivers::DEFAULT_DRIVER_NAME.to_string()
        } else {
            volume.driver_name.clone()
        };
        grouped.entry(driver).or_default().push(volume.clone());
    }
    grouped
}

/// Outcome of one pass over the per-volume records.
#[derive(Debug, PartialEq, Eq)]
pub enum VolumeClassification {
    Failed { reasons: Vec<String> },
    InProgress,
    Done { total_size: u64 },
}

pub fn classify_volume_records(records: &[RestoreVolumeInfo]) -> VolumeClassification {
    let mut reasons = Vec::new();
    for record in records {
        if record.status == RestoreStatus::Failed {
            reasons.push(format!(
                "Volume restore failed for PVC {}/{}: {}",
                record.source_namespace, record.persistent_volume_claim, record.reason
            ));
        }
    }
    if !reasons.is_empty() {
        return VolumeClassification::Failed { reasons };
    }
    if records
        .iter()
        .any(|r| r.status != RestoreStatus::Successful)
    {
        return VolumeClassification::InProgress;
    }
    VolumeClassification::Done {
        total_size: records.iter().map(|r| r.total_size).sum(),
    }
}

async fn handle_volumes(
    restore: &ApplicationRestore,
    ctx: &Context,
    api: &Api<ApplicationRestore>,
    backup: &ApplicationBackup,
    location: &BackupLocation,
    status: &mut ApplicationRestoreStatus,
) -> Result<Action> {
    let name = restore.name_any();

    if status.volumes.is_empty() {
        return start_volume_restore(restore, ctx, api, backup, location, status).await;
    }

    // Poll every implicated driver; its record set is authoritative.
    let mut drivers_in_flight: Vec<String> = status
        .volumes
        .iter()
        .map(|v| v.driver_name.clone())
        .collect();
    drivers_in_flight.sort();
    drivers_in_flight.dedup();

    let mut refreshed: Vec<RestoreVolumeInfo> = Vec::new();
    for driver_name in &drivers_in_flight {
        let driver = ctx.drivers.get(driver_name)?;
        refreshed.extend(driver.get_restore_status(restore).await?);
    }
    status.volumes = refreshed;

    match classify_volume_records(&status.volumes) {
        VolumeClassification::Failed { reasons } => {
            status.status = RestoreStatus::Failed;
            status.stage = RestoreStage::Final;
            status.reason = reasons.join("; ");
            status.finish_timestamp = Some(Time(Utc::now()));
            persist_status(api, &name, status).await?;
            warn!(%name, reason = %status.reason, "volume restore failed");
            Err(Error::reconcile(status.reason.clone()))
        }
        VolumeClassification::InProgress => {
            persist_status(api, &name, status).await?;
            debug!(%name, "volume restore still in progress");
            Ok(Action::requeue(RESYNC))
        }
        VolumeClassification::Done { total_size } => {
            status.total_size = total_size;
            status.status = RestoreStatus::InProgress;
            status.stage = RestoreStage::Applications;
            persist_status(api, &name, status).await?;
            info!(%name, total_size, "all volumes restored, applying resources");
            // Nothing external to wait for any more, so run the application
            // stage in this same pass instead of burning a requeue.
            run_applications(restore, ctx, api, backup, location, status).await
        }
    }
}

async fn start_volume_restore(
    restore: &ApplicationRestore,
    ctx: &Context,
    api: &Api<ApplicationRestore>,
    backup: &ApplicationBackup,
    location: &BackupLocation,
    status: &mut ApplicationRestoreStatus,
) -> Result<Action> {
    let name = restore.name_any();
    let backup_path = backup
        .status
        .as_ref()
        .map(|s| s.backup_path.clone())
        .unwrap_or_default();

    let include_filter = create_objects_map(&restore.spec.include_resources);
    let mapping =
        effective_namespace_mapping(&restore.spec.namespace_mapping, &backup.spec.namespaces);
    let policy = effective_replace_policy(restore.spec.replace_policy);

    let backup_volumes = backup
        .status
        .as_ref()
        .map(|s| s.volumes.clone())
        .unwrap_or_default();
    let grouped = volumes_to_restore(&backup_volumes, &mapping, &include_filter);

    if grouped.is_empty() {
        info!(%name, "no volumes selected, skipping straight to resources");
        status.status = RestoreStatus::InProgress;
        status.stage = RestoreStage::Applications;
        persist_status(api, &name, status).await?;
        return Ok(Action::requeue(Duration::ZERO));
    }

    // CRDs must exist before the manifest set can be deserialized into
    // anything applyable.
    restore_resources::register_backup_crds(ctx, location, &backup_path).await?;
    let objects = objectstore::download_resource_objects(
        ctx.object_store.as_ref(),
        location,
        &backup_path,
    )
    .await?;

    let mut started: Vec<RestoreVolumeInfo> = Vec::new();
    for (driver_name, volumes) in &grouped {
        let driver = ctx.drivers.get(driver_name)?;

        // Pre-restore resources go through the same remap and filter as the
        // application stage so they land in the destination namespaces.
        let pre_restore = driver.get_pre_restore_resources(backup, &objects).await?;
        let pre_restore = restore_resources::prepare_objects_for_apply(
            ctx.collector.as_ref(),
            pre_restore,
            &objects,
            &include_filter,
            &mapping,
            None,
            restore.spec.include_optional_resource_types,
        )
        .await?;
        for object in &pre_restore {
            match ctx.collector.apply_resource(object).await {
                Ok(()) => {}
                Err(Error::Kube(e)) if is_already_exists(&e) => {}
                Err(e) => return Err(e),
            }
        }

        // The generic CSI path restores claims by re-provisioning them, so
        // under the Delete policy everything about to be restored has to go
        // first.  PVs are left alone, the claim deletion releases them.
        if driver_name == CSI_DRIVER_NAME && policy == ReplacePolicy::Delete {
            let stale = csi_pre_delete_objects(&objects, &mapping, &include_filter);
            ctx.collector.delete_resources(&stale).await?;
        }

        match driver.start_restore(restore, volumes).await {
            Ok(records) => started.extend(records),
            Err(e) => {
                // A driver refusing to start is not a transient condition.
                status.status = RestoreStatus::Failed;
                status.stage = RestoreStage::Final;
                status.reason = format!("Error starting restore for driver {driver_name}: {e}");
                status.finish_timestamp = Some(Time(Utc::now()));
                persist_status(api, &name, status).await?;
                return Err(e);
            }
        }
    }

    status.volumes = started;
    status.status = RestoreStatus::InProgress;
    status.stage = RestoreStage::Volumes;
    // Persist before returning so a crash can't lose track of driver work
    // that has already started.
    persist_status(api, &name, status).await?;
    info!(%name, count = status.volumes.len(), "volume restore started");
    Ok(Action::requeue(RESYNC))
}

/// Destination-side view of every namespaced object about to be restored,
/// suitable for handing to the collector's delete path.  PersistentVolumes
/// are excluded: deleting the claims releases them.
pub fn csi_pre_delete_objects(
    objects: &[DynamicObject],
    mapping: &BTreeMap<String, String>,
    include_filter: &HashMap<ObjectInfo, bool>,
) -> Vec<DynamicObject> {
    objects
        .iter()
        .filter_map(|object| {
            let info = restore_resources::object_info_for(object);
            if info.kind == "PersistentVolume" || info.namespace.is_empty() {
                return None;
            }
            let dest_ns = mapping.get(&info.namespace)?;
            if !include_filter.is_empty() && !include_filter.contains_key(&info.normalized()) {
                return None;
            }
            let mut object = object.clone();
            object.metadata.namespace = Some(dest_ns.clone());
            Some(object)
        })
        .collect()
}

// ── Applications ──────────────────────────────────────────────────────────────

async fn run_applications(
    restore: &ApplicationRestore,
    ctx: &Context,
    api: &Api<ApplicationRestore>,
    backup: &ApplicationBackup,
    location: &BackupLocation,
    status: &mut ApplicationRestoreStatus,
) -> Result<Action> {
    let name = restore.name_any();
    restore_resources::restore_resources(ctx, restore, backup, location, status).await?;

    status.finish_timestamp = Some(Time(Utc::now()));
    persist_status(api, &name, status).await?;

    let (event_type, reason) = if status.status == RestoreStatus::PartialSuccess {
        (EventType::Warning, REASON_PARTIAL)
    } else {
        (EventType::Normal, REASON_COMPLETED)
    };
    publish_event(
        &ctx.client,
        &ctx.reporter,
        restore,
        event_type,
        reason,
        "Reconcile",
        Some(format!("Restore finished with status {}", status.status)),
    )
    .await;
    info!(%name, status = %status.status, "restore finished");
    Ok(Action::await_change())
}

// ── Delete ────────────────────────────────────────────────────────────────────

/// Cancel any driver work when the restore is deleted.  This runs whatever
/// stage the restore reached: cancelling an already finished restore is a
/// no-op on the driver side, and a restore that failed at Final may still
/// have driver state worth cleaning up.
async fn handle_delete(restore: &ApplicationRestore, ctx: &Context) -> Result<Action> {
    let name = restore.name_any();
    info!(%name, "cancelling restore driver work");

    let mut drivers: Vec<String> = restore
        .status
        .as_ref()
        .map(|s| s.volumes.iter().map(|v| v.driver_name.clone()).collect())
        .unwrap_or_default();
    drivers.sort();
    drivers.dedup();

    for driver_name in &drivers {
        let driver = ctx.drivers.get(driver_name)?;
        driver.cancel_restore(restore).await?;
    }
    Ok(Action::await_change())
}
