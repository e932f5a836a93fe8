use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use kube::core::DynamicObject;
use kube::runtime::events::Reporter;
use kube::Client;
use tokio::sync::oneshot;
use tracing::info;
use tracing_subscriber::EnvFilter;

use snapshot_operator::collector::ResourceCollector;
use snapshot_operator::controller::{application_restore, group_snapshot};
use snapshot_operator::crd::backup_location::BackupLocation;
use snapshot_operator::crd::group_volume_snapshot::GroupVolumeSnapshot;
use snapshot_operator::crd::rule::Rule;
use snapshot_operator::crd::shared::ObjectInfo;
use snapshot_operator::drivers::DriverRegistry;
use snapshot_operator::error::{Error, Result};
use snapshot_operator::objectstore::ObjectStore;
use snapshot_operator::rules::{RuleExecutor, RulePhase};

#[derive(Parser)]
#[command(
    name = "snapshot-operator",
    about = "Group volume snapshot and application restore operator"
)]
struct Args {
    /// Namespace whose restores may target arbitrary namespaces.
    #[arg(long, env = "ADMIN_NAMESPACE", default_value = "kube-system")]
    admin_namespace: String,
}

/// Placeholder backends for deployments built without any configured
/// collaborator.  Every call fails with a message naming what is missing,
/// so a misconfigured deployment surfaces it on first use instead of
/// silently doing nothing.
struct Unconfigured;

#[async_trait]
impl RuleExecutor for Unconfigured {
    async fn execute(
        &self,
        _rule: &Rule,
        _phase: RulePhase,
        _owner: &GroupVolumeSnapshot,
        _namespace: &str,
    ) -> Result<Option<oneshot::Sender<()>>> {
        Err(Error::Rule("no rule executor configured".to_string()))
    }
}

#[async_trait]
impl ObjectStore for Unconfigured {
    async fn exists(&self, _location: &BackupLocation, _path: &str) -> Result<bool> {
        Err(Error::object_store("no object store backend configured"))
    }

    async fn read_all(&self, _location: &BackupLocation, _path: &str) -> Result<Vec<u8>> {
        Err(Error::object_store("no object store backend configured"))
    }

    async fn decrypt(&self, _data: Vec<u8>, _key: &str) -> Result<Vec<u8>> {
        Err(Error::object_store("no object store backend configured"))
    }
}

#[async_trait]
impl ResourceCollector for Unconfigured {
    async fn prepare_resource_for_apply(
        &self,
        _object: &mut DynamicObject,
        _all_objects: &[DynamicObject],
        _include_filter: &HashMap<ObjectInfo, bool>,
        _namespace_mapping: &BTreeMap<String, String>,
        _pv_name_mapping: Option<&HashMap<String, String>>,
        _include_optional_resource_types: bool,
    ) -> Result<bool> {
        Err(Error::reconcile("no resource collector configured"))
    }

    async fn apply_resource(&self, _object: &DynamicObject) -> Result<()> {
        Err(Error::reconcile("no resource collector configured"))
    }

    async fn delete_resources(&self, _objects: &[DynamicObject]) -> Result<()> {
        Err(Error::reconcile("no resource collector configured"))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let client = Client::try_default().await?;
    let reporter = Reporter {
        controller: "snapshot-operator".into(),
        instance: std::env::var("POD_NAME").ok(),
    };

    // Driver registrations go here; a build without them still answers
    // every reconcile, it just fails them with "no volume driver
    // registered".
    let drivers = DriverRegistry::new();

    let snapshot_ctx = Arc::new(group_snapshot::Context::new(
        client.clone(),
        drivers.clone(),
        Arc::new(Unconfigured),
        reporter.clone(),
    ));
    let restore_ctx = Arc::new(application_restore::Context {
        client,
        drivers,
        collector: Arc::new(Unconfigured),
        object_store: Arc::new(Unconfigured),
        reporter,
        admin_namespace: args.admin_namespace,
    });

    info!("starting snapshot-operator controllers");
    tokio::join!(
        group_snapshot::run(snapshot_ctx),
        application_restore::run(restore_ctx),
    );
    Ok(())
}
