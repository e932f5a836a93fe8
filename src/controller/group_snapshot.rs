//! GroupVolumeSnapshot controller.
//!
//! Drives a group snapshot through PreChecks → PreSnapshot → Snapshot →
//! PostSnapshot → Final.  Every reconciliation performs one unit of forward
//! progress, persists status, and returns; polling is expressed as requeues.
//! Stage never regresses except the retry path, which re-enters Snapshot
//! with the per-volume records cleared.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::api::{Api, ListParams, Patch, PatchParams, ResourceExt};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::events::{EventType, Reporter};
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::Client;
use serde_json::json;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::crd::group_volume_snapshot::{
    GroupSnapshotStage, GroupSnapshotStatus, GroupVolumeSnapshot, GroupVolumeSnapshotStatus,
    VolumeSnapshotRecord,
};
use crate::crd::rule::Rule;
use crate::crd::shared::SnapshotConditionType;
use crate::drivers::DriverRegistry;
use crate::error::{Error, Result};
use crate::rules::{RuleExecutor, RulePhase};

use super::helpers::{publish_event, version_floor_allows, FIELD_MANAGER, FINALIZER_CLEANUP};
use super::snapshot_objects;

/// Resync interval driving the polling stages.
const RESYNC: Duration = Duration::from_secs(10);
/// Backoff applied by the error policy.
const ERROR_REQUEUE: Duration = Duration::from_secs(30);

/// Event reason used for every warning emitted by this controller.
const REASON_FAILED: &str = "GroupSnapshotFailed";

// ── Shared context ────────────────────────────────────────────────────────────

pub struct Context {
    pub client: Client,
    pub drivers: DriverRegistry,
    pub rule_executor: Arc<dyn RuleExecutor>,
    pub reporter: Reporter,

    /// Termination handles for background pre-hook commands, keyed by
    /// resource UID.  Process-local: rebuilt empty on restart, which only
    /// costs duplicate-suppression, never correctness.
    bg_channels: Mutex<HashMap<String, oneshot::Sender<()>>>,

    /// Lowest resource version accepted per UID, bumped on every status
    /// write to suppress stale resync deliveries.  Process-local as above.
    min_resource_versions: Mutex<HashMap<String, String>>,
}

impl Context {
    pub fn new(
        client: Client,
        drivers: DriverRegistry,
        rule_executor: Arc<dyn RuleExecutor>,
        reporter: Reporter,
    ) -> Self {
        Self {
            client,
            drivers,
            rule_executor,
            reporter,
            bg_channels: Mutex::new(HashMap::new()),
            min_resource_versions: Mutex::new(HashMap::new()),
        }
    }

    fn record_floor(&self, snap: &GroupVolumeSnapshot) {
        if let (Some(uid), Some(rv)) = (
            snap.metadata.uid.clone(),
            snap.metadata.resource_version.clone(),
        ) {
            self.min_resource_versions.lock().unwrap().insert(uid, rv);
        }
    }

    fn floor_for(&self, uid: &str) -> Option<String> {
        self.min_resource_versions.lock().unwrap().get(uid).cloned()
    }
}

// ── Controller entry point ────────────────────────────────────────────────────

/// Start the GroupVolumeSnapshot controller.  Returns a future that runs
/// forever.
pub async fn run(ctx: Arc<Context>) {
    let snapshots: Api<GroupVolumeSnapshot> = Api::all(ctx.client.clone());

    Controller::new(snapshots, WatcherConfig::default())
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

async fn reconcile(snap: Arc<GroupVolumeSnapshot>, ctx: Arc<Context>) -> Result<Action> {
    let ns = snap.namespace().unwrap_or_default();
    let api: Api<GroupVolumeSnapshot> = Api::namespaced(ctx.client.clone(), &ns);

    finalizer(&api, FINALIZER_CLEANUP, snap, |event| async {
        match event {
            FinalizerEvent::Apply(snap) => handle(&snap, &ctx, &api).await,
            FinalizerEvent::Cleanup(snap) => handle_delete(&snap, &ctx).await,
        }
    })
    .await
    .map_err(|e| Error::Finalizer(Box::new(e)))
}

fn error_policy(snap: Arc<GroupVolumeSnapshot>, error: &Error, _ctx: Arc<Context>) -> Action {
    let name = snap.name_any();
    if matches!(error, Error::Finalizer(e) if e.to_string().contains("ObjectNotFound")) {
        debug!(%name, "object already deleted, skipping requeue");
        return Action::await_change();
    }
    warn!(%name, %error, "reconcile error, requeuing in 30s");
    Action::requeue(ERROR_REQUEUE)
}

// ── Stage dispatch ────────────────────────────────────────────────────────────

async fn handle(
    snap: &GroupVolumeSnapshot,
    ctx: &Context,
    api: &Api<GroupVolumeSnapshot>,
) -> Result<Action> {
    let name = snap.name_any();
    let uid = snap.metadata.uid.clone().unwrap_or_default();

    // Stale-delivery guard: resync windows can overlap an in-flight handle,
    // redelivering a version we already superseded with our own write.
    if let (Some(floor), Some(incoming)) =
        (ctx.floor_for(&uid), snap.metadata.resource_version.as_deref())
    {
        match version_floor_allows(&floor, incoming) {
            Ok(true) => {}
            Ok(false) => {
                info!(%name, %floor, %incoming, "skipping stale group snapshot event");
                return Ok(Action::requeue(RESYNC));
            }
            Err(e) => {
                warn_event(ctx, snap, &e.to_string()).await;
                return Err(e);
            }
        }
    }

    let result = match snap.stage() {
        GroupSnapshotStage::Initial | GroupSnapshotStage::PreChecks => {
            handle_initial(snap, ctx, api).await
        }
        GroupSnapshotStage::PreSnapshot => handle_pre_snapshot(snap, ctx, api).await,
        GroupSnapshotStage::Snapshot => handle_snapshot(snap, ctx, api).await,
        GroupSnapshotStage::PostSnapshot => handle_post_snapshot(snap, ctx, api).await,
        GroupSnapshotStage::Final => handle_final(snap, ctx).await,
    };

    match result {
        Ok(action) => Ok(action),
        Err(e) => {
            warn_event(ctx, snap, &e.to_string()).await;
            Err(e)
        }
    }
}

async fn warn_event(ctx: &Context, snap: &GroupVolumeSnapshot, note: &str) {
    publish_event(
        &ctx.client,
        &ctx.reporter,
        snap,
        EventType::Warning,
        REASON_FAILED,
        "Reconcile",
        Some(note.to_string()),
    )
    .await;
}

/// Persist a new status and bump the version floor so the resync window
/// can't feed us back the superseded object.
async fn persist_status(
    ctx: &Context,
    api: &Api<GroupVolumeSnapshot>,
    name: &str,
    status: &GroupVolumeSnapshotStatus,
) -> Result<GroupVolumeSnapshot> {
    let patch = json!({ "status": status });
    let updated = api
        .patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
    ctx.record_floor(&updated);
    Ok(updated)
}

// ── Initial / PreChecks ───────────────────────────────────────────────────────

/// Validate the selector against the equality-only contract.  Returns the
/// matchLabels map on success.
pub fn validate_pvc_selector(
    selector: &k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector,
) -> Result<std::collections::BTreeMap<String, String>> {
    if selector
        .match_expressions
        .as_ref()
        .is_some_and(|e| !e.is_empty())
    {
        return Err(Error::validation(
            "matchExpressions are not supported in the PVC selector, use matchLabels",
        ));
    }
    match selector.match_labels.as_ref() {
        Some(labels) if !labels.is_empty() => Ok(labels.clone()),
        _ => Err(Error::validation(
            "matchLabels are required for group snapshots",
        )),
    }
}

async fn handle_initial(
    snap: &GroupVolumeSnapshot,
    ctx: &Context,
    api: &Api<GroupVolumeSnapshot>,
) -> Result<Action> {
    let name = snap.name_any();
    let ns = snap.namespace().unwrap_or_default();
    let mut status = snap.status.clone().unwrap_or_default();

    let labels = match validate_pvc_selector(&snap.spec.pvc_selector) {
        Ok(labels) => labels,
        Err(e) => {
            // Bad spec is terminal: no driver is ever called for it.
            status.status = GroupSnapshotStatus::Failed;
            status.stage = GroupSnapshotStage::Final;
            persist_status(ctx, api, &name, &status).await?;
            return Err(e);
        }
    };

    let selector = labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",");
    let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(ctx.client.clone(), &ns);
    let matched = pvcs
        .list(&ListParams::default().labels(&selector))
        .await?
        .items;

    if matched.is_empty() {
        // The claim set may not exist yet; stay Pending and let the resync
        // retry, this is not a failure.
        if snap.overall_status() != GroupSnapshotStatus::Pending
            || snap.stage() != GroupSnapshotStage::PreChecks
        {
            status.status = GroupSnapshotStatus::Pending;
            status.stage = GroupSnapshotStage::PreChecks;
            persist_status(ctx, api, &name, &status).await?;
        }
        info!(%name, %selector, "no PVCs matched yet, staying in PreChecks");
        return Ok(Action::requeue(RESYNC));
    }

    // Referenced rules must exist before any stage starts running them.  A
    // dangling rule name is a spec error, terminal like a bad selector.
    let rules: Api<Rule> = Api::namespaced(ctx.client.clone(), &ns);
    for rule_name in [&snap.spec.pre_exec_rule, &snap.spec.post_exec_rule]
        .into_iter()
        .flatten()
    {
        match rules.get(rule_name).await {
            Ok(_) => {}
            Err(e) if crate::error::is_not_found(&e) => {
                status.status = GroupSnapshotStatus::Failed;
                status.stage = GroupSnapshotStage::Final;
                persist_status(ctx, api, &name, &status).await?;
                return Err(Error::validation(format!(
                    "referenced rule {rule_name:?} does not exist"
                )));
            }
            Err(e) => return Err(e.into()),
        }
    }

    status.status = GroupSnapshotStatus::InProgress;
    status.stage = if snap.spec.pre_exec_rule.is_some() {
        GroupSnapshotStage::PreSnapshot
    } else {
        GroupSnapshotStage::Snapshot
    };
    persist_status(ctx, api, &name, &status).await?;
    info!(%name, next = %status.stage, "pre-checks passed");
    Ok(Action::requeue(Duration::ZERO))
}

// ── PreSnapshot ───────────────────────────────────────────────────────────────

async fn handle_pre_snapshot(
    snap: &GroupVolumeSnapshot,
    ctx: &Context,
    api: &Api<GroupVolumeSnapshot>,
) -> Result<Action> {
    let name = snap.name_any();
    let ns = snap.namespace().unwrap_or_default();

    let Some(rule_name) = snap.spec.pre_exec_rule.clone() else {
        let mut status = snap.status.clone().unwrap_or_default();
        status.status = GroupSnapshotStatus::InProgress;
        status.stage = GroupSnapshotStage::Snapshot;
        persist_status(ctx, api, &name, &status).await?;
        return Ok(Action::requeue(Duration::ZERO));
    };

    info!(%name, %rule_name, "running pre-snapshot rule");
    let rules: Api<Rule> = Api::namespaced(ctx.client.clone(), &ns);
    let rule = rules.get(&rule_name).await?;

    match ctx.rule_executor.execute(&rule, RulePhase::PreExec, snap, &ns).await {
        Ok(channel) => {
            // The rule may have mutated the resource externally; work from a
            // fresh copy before advancing the stage.
            let refreshed = api.get(&name).await?;

            if let Some(sender) = channel {
                let uid = refreshed.metadata.uid.clone().unwrap_or_default();
                ctx.bg_channels.lock().unwrap().insert(uid, sender);
            }

            let mut status = refreshed.status.clone().unwrap_or_default();
            status.stage = GroupSnapshotStage::Snapshot;
            persist_status(ctx, api, &name, &status).await?;
            Ok(Action::requeue(Duration::ZERO))
        }
        Err(e) => Err(e),
    }
}

// ── Snapshot ──────────────────────────────────────────────────────────────────

/// What the snapshot stage should do with a driver response.
#[derive(Debug, PartialEq, Eq)]
pub enum SnapshotEvaluation {
    /// Some snapshot failed but the retry budget allows a restart.
    Retry { failed_tasks: Vec<String> },
    /// Some snapshot failed and retries are exhausted (or disabled).
    Exhausted { failed_tasks: Vec<String> },
    /// Every snapshot reports Ready.
    AllDone,
    /// No failures, not all ready yet.
    InProgress,
}

/// Classify a driver response against the retry budget.
pub fn evaluate_snapshot_records(
    records: &[VolumeSnapshotRecord],
    num_retries: i32,
    max_retries: i32,
) -> SnapshotEvaluation {
    let (failed, failed_tasks) = is_any_snapshot_failed(records);
    if failed {
        if num_retries < max_retries {
            SnapshotEvaluation::Retry { failed_tasks }
        } else {
            SnapshotEvaluation::Exhausted { failed_tasks }
        }
    } else if are_all_snapshots_done(records) {
        SnapshotEvaluation::AllDone
    } else {
        SnapshotEvaluation::InProgress
    }
}

async fn handle_snapshot(
    snap: &GroupVolumeSnapshot,
    ctx: &Context,
    api: &Api<GroupVolumeSnapshot>,
) -> Result<Action> {
    let name = snap.name_any();
    let driver = ctx.drivers.get("")?;
    let mut status = snap.status.clone().unwrap_or_default();

    let records = if status.volume_snapshots.is_empty() {
        info!(%name, "creating new group snapshot");
        driver.create_group_snapshot(snap).await?
    } else {
        debug!(%name, "group snapshot active, checking status");
        driver.get_group_snapshot_status(snap).await?
    };

    if records.is_empty() {
        return Err(Error::driver(
            "group snapshot call returned 0 snapshots in response from driver",
        ));
    }

    let action = match evaluate_snapshot_records(&records, status.num_retries, snap.spec.max_retries)
    {
        SnapshotEvaluation::Retry { failed_tasks } => {
            status.num_retries += 1;
            // Clearing the records makes the next pass call create again.
            status.volume_snapshots = Vec::new();
            status.stage = GroupSnapshotStage::Snapshot;
            status.status = GroupSnapshotStatus::Pending;
            let note = format!(
                "Some snapshots in group have failed: {failed_tasks:?}. Resetting group snapshot for retry: {}",
                status.num_retries
            );
            warn!(%name, %note, "group snapshot retry");
            warn_event(ctx, snap, &note).await;
            Action::requeue(RESYNC)
        }
        SnapshotEvaluation::Exhausted { failed_tasks } => {
            let note = if snap.spec.max_retries == 0 {
                format!(
                    "Some snapshots in group have failed: {failed_tasks:?}. Failing the group snapshot as retries are not enabled"
                )
            } else {
                format!(
                    "Some snapshots in group have failed: {failed_tasks:?}. Failing the group snapshot as all {} retries are exhausted",
                    snap.spec.max_retries
                )
            };
            warn!(%name, %note, "group snapshot failed");
            warn_event(ctx, snap, &note).await;
            // The post-hook still runs for a failed group.
            status.volume_snapshots = records;
            status.stage = GroupSnapshotStage::PostSnapshot;
            status.status = GroupSnapshotStatus::Failed;
            Action::requeue(Duration::ZERO)
        }
        SnapshotEvaluation::AllDone => {
            info!(%name, "all snapshots in group are done");
            let materialized =
                snapshot_objects::create_snapshot_and_data_objects(ctx, snap, records).await?;
            status.volume_snapshots = materialized;
            status.stage = GroupSnapshotStage::PostSnapshot;
            status.status = GroupSnapshotStatus::InProgress;
            Action::requeue(Duration::ZERO)
        }
        SnapshotEvaluation::InProgress => {
            debug!(%name, "some snapshots still in progress");
            status.volume_snapshots = records;
            status.stage = GroupSnapshotStage::Snapshot;
            status.status = GroupSnapshotStatus::InProgress;
            Action::requeue(RESYNC)
        }
    };

    persist_status(ctx, api, &name, &status).await?;

    // Once every snapshot has been triggered the pre-hook background
    // commands have served their purpose, success or not.
    if are_all_snapshots_started(&status.volume_snapshots) {
        let uid = snap.metadata.uid.clone().unwrap_or_default();
        if let Some(sender) = ctx.bg_channels.lock().unwrap().remove(&uid) {
            let _ = sender.send(());
            debug!(%name, "terminated background pre-hook commands");
        }
    }

    Ok(action)
}

// ── PostSnapshot ──────────────────────────────────────────────────────────────

async fn handle_post_snapshot(
    snap: &GroupVolumeSnapshot,
    ctx: &Context,
    api: &Api<GroupVolumeSnapshot>,
) -> Result<Action> {
    let name = snap.name_any();
    let ns = snap.namespace().unwrap_or_default();

    let Some(rule_name) = snap.spec.post_exec_rule.clone() else {
        let mut status = snap.status.clone().unwrap_or_default();
        finalize_status(&mut status);
        persist_status(ctx, api, &name, &status).await?;
        return Ok(Action::await_change());
    };

    info!(%name, %rule_name, "running post-snapshot rule");
    let rules: Api<Rule> = Api::namespaced(ctx.client.clone(), &ns);
    let rule = rules.get(&rule_name).await?;
    ctx.rule_executor
        .execute(&rule, RulePhase::PostExec, snap, &ns)
        .await?;

    // Refresh before finalizing, the rule may have mutated the resource.
    let refreshed = api.get(&name).await?;
    let mut status = refreshed.status.clone().unwrap_or_default();
    finalize_status(&mut status);
    persist_status(ctx, api, &name, &status).await?;
    Ok(Action::await_change())
}

/// Move to Final, preserving a Failed outcome from the snapshot stage.
fn finalize_status(status: &mut GroupVolumeSnapshotStatus) {
    if status.status != GroupSnapshotStatus::Failed {
        status.status = GroupSnapshotStatus::Successful;
    }
    status.stage = GroupSnapshotStage::Final;
}

// ── Final ─────────────────────────────────────────────────────────────────────

/// Terminal upkeep: keep the restore-namespaces annotation on every child
/// snapshot in sync with the spec.  Never re-evaluates the stage.
async fn handle_final(snap: &GroupVolumeSnapshot, ctx: &Context) -> Result<Action> {
    let children = snap
        .status
        .as_ref()
        .map(|s| s.volume_snapshots.as_slice())
        .unwrap_or_default();
    if children.is_empty() {
        return Ok(Action::await_change());
    }

    let name = snap.name_any();
    let ns = snap.namespace().unwrap_or_default();
    let desired = snap.spec.restore_namespaces.join(",");

    let snapshots: Api<crate::crd::snapshot::VolumeSnapshot> =
        Api::namespaced(ctx.client.clone(), &ns);

    let first = snapshots.get(&children[0].volume_snapshot_name).await?;
    let current = first
        .annotations()
        .get(crate::crd::shared::RESTORE_NAMESPACES_ANNOTATION)
        .cloned()
        .unwrap_or_default();
    if current == desired {
        return Ok(Action::await_change());
    }

    info!(%name, %desired, "updating restore namespaces on child snapshots");
    for child in children {
        match snapshots.get(&child.volume_snapshot_name).await {
            Ok(_) => {}
            Err(e) if crate::error::is_not_found(&e) => continue,
            Err(e) => return Err(e.into()),
        }
        let annotation_key = crate::crd::shared::RESTORE_NAMESPACES_ANNOTATION;
        let patch = json!({
            "metadata": {
                "annotations": {
                    annotation_key: &desired,
                }
            }
        });
        snapshots
            .patch(
                &child.volume_snapshot_name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
    }

    Ok(Action::await_change())
}

// ── Delete ────────────────────────────────────────────────────────────────────

async fn handle_delete(snap: &GroupVolumeSnapshot, ctx: &Context) -> Result<Action> {
    let name = snap.name_any();
    info!(%name, "cleaning up group snapshot");

    let uid = snap.metadata.uid.clone().unwrap_or_default();

    // A still-registered background hook would otherwise outlive its owner.
    if let Some(sender) = ctx.bg_channels.lock().unwrap().remove(&uid) {
        let _ = sender.send(());
        debug!(%name, "terminated background pre-hook commands on delete");
    }

    ctx.min_resource_versions.lock().unwrap().remove(&uid);

    let driver = ctx.drivers.get("")?;
    driver.delete_group_snapshot(snap).await?;

    Ok(Action::await_change())
}

// ── Condition evaluation ──────────────────────────────────────────────────────

/// Whether any record's latest condition reports an error, along with the
/// task ids of the failed snapshots.
pub fn is_any_snapshot_failed(records: &[VolumeSnapshotRecord]) -> (bool, Vec<String>) {
    let mut failed_tasks = Vec::new();
    for record in records {
        if let Some(last) = record.conditions.first() {
            if last.status == "True" && last.condition_type == SnapshotConditionType::Error {
                failed_tasks.push(record.task_id.clone());
            }
        }
    }
    (!failed_tasks.is_empty(), failed_tasks)
}

/// True when every record's latest condition is Ready/True.  An empty or
/// condition-less record set is never done.
pub fn are_all_snapshots_done(records: &[VolumeSnapshotRecord]) -> bool {
    if records.is_empty() {
        return false;
    }
    records.iter().all(|record| {
        record
            .conditions
            .first()
            .is_some_and(|c| c.status == "True" && c.condition_type == SnapshotConditionType::Ready)
    })
}

/// True when every record has at least one condition.  Conditions only
/// appear once the driver has started the snapshot.
pub fn are_all_snapshots_started(records: &[VolumeSnapshotRecord]) -> bool {
    if records.is_empty() {
        return false;
    }
    records.iter().all(|record| !record.conditions.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::shared::SnapshotCondition;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
        LabelSelector, LabelSelectorRequirement,
    };
    use std::collections::BTreeMap;

    fn record(task: &str, condition: Option<(SnapshotConditionType, &str)>) -> VolumeSnapshotRecord {
        VolumeSnapshotRecord {
            parent_volume_id: format!("vol-{task}"),
            task_id: task.to_string(),
            conditions: condition
                .map(|(t, s)| {
                    vec![SnapshotCondition {
                        condition_type: t,
                        status: s.to_string(),
                        message: String::new(),
                    }]
                })
                .unwrap_or_default(),
            ..Default::default()
        }
    }

    #[test]
    fn selector_with_match_expressions_fails_validation() {
        let selector = LabelSelector {
            match_labels: Some(BTreeMap::from([("app".into(), "db".into())])),
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "tier".into(),
                operator: "In".into(),
                values: Some(vec!["web".into()]),
            }]),
        };
        assert!(matches!(
            validate_pvc_selector(&selector),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn empty_match_labels_fails_validation() {
        let selector = LabelSelector::default();
        assert!(matches!(
            validate_pvc_selector(&selector),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn all_ready_snapshots_are_done() {
        let records = vec![
            record("t1", Some((SnapshotConditionType::Ready, "True"))),
            record("t2", Some((SnapshotConditionType::Ready, "True"))),
        ];
        assert!(are_all_snapshots_done(&records));
    }

    #[test]
    fn missing_or_empty_conditions_are_not_done() {
        assert!(!are_all_snapshots_done(&[]));
        let records = vec![
            record("t1", Some((SnapshotConditionType::Ready, "True"))),
            record("t2", None),
        ];
        assert!(!are_all_snapshots_done(&records));
    }

    #[test]
    fn pending_condition_is_started_but_not_done() {
        let records = vec![record("t1", Some((SnapshotConditionType::Pending, "True")))];
        assert!(are_all_snapshots_started(&records));
        assert!(!are_all_snapshots_done(&records));
        assert!(!are_all_snapshots_started(&[]));
    }

    #[test]
    fn failed_snapshots_report_task_ids() {
        let records = vec![
            record("t1", Some((SnapshotConditionType::Error, "True"))),
            record("t2", Some((SnapshotConditionType::Ready, "True"))),
        ];
        let (failed, tasks) = is_any_snapshot_failed(&records);
        assert!(failed);
        assert_eq!(tasks, vec!["t1".to_string()]);
    }

    #[test]
    fn error_condition_with_false_status_is_not_failed() {
        let records = vec![record("t1", Some((SnapshotConditionType::Error, "False")))];
        let (failed, _) = is_any_snapshot_failed(&records);
        assert!(!failed);
    }

    #[test]
    fn retry_budget_drives_evaluation() {
        let failed = vec![record("t1", Some((SnapshotConditionType::Error, "True")))];

        // Budget of 2: first two failures retry, the third exhausts.
        assert!(matches!(
            evaluate_snapshot_records(&failed, 0, 2),
            SnapshotEvaluation::Retry { .. }
        ));
        assert!(matches!(
            evaluate_snapshot_records(&failed, 1, 2),
            SnapshotEvaluation::Retry { .. }
        ));
        assert!(matches!(
            evaluate_snapshot_records(&failed, 2, 2),
            SnapshotEvaluation::Exhausted { .. }
        ));

        // Retries disabled: first failure exhausts immediately.
        assert!(matches!(
            evaluate_snapshot_records(&failed, 0, 0),
            SnapshotEvaluation::Exhausted { .. }
        ));
    }

    #[test]
    fn mixed_in_flight_is_in_progress() {
        let records = vec![
            record("t1", Some((SnapshotConditionType::Ready, "True"))),
            record("t2", Some((SnapshotConditionType::Pending, "True"))),
        ];
        assert_eq!(
            evaluate_snapshot_records(&records, 0, 0),
            SnapshotEvaluation::InProgress
        );
    }
}
