//! Volume driver contract and registry.
//!
//! Driver implementations live outside this crate; the controllers resolve a
//! driver by name once per reconciliation and drive it through the
//! create/poll/cancel calls below.  All calls are synchronous from the
//! controller's point of view and must be safely re-callable on redelivery.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolume;
use kube::core::DynamicObject;

use crate::crd::application_backup::{ApplicationBackup, BackupVolumeInfo};
use crate::crd::application_restore::{ApplicationRestore, RestoreVolumeInfo};
use crate::crd::group_volume_snapshot::{GroupVolumeSnapshot, VolumeSnapshotRecord};
use crate::error::{Error, Result};

/// Driver assumed for backup volume records that don't name one.
pub const DEFAULT_DRIVER_NAME: &str = "native";

/// Reserved name for the generic CSI driver.  Volumes owned by it are
/// restored through the native snapshot/restore path, not manifest re-apply.
pub const CSI_DRIVER_NAME: &str = "csi";

/// Basic facts about a volume, resolved from its driver-side id.
#[derive(Clone, Debug, Default)]
pub struct VolumeInfo {
    /// Name of the PersistentVolume backing this volume.
    pub volume_name: String,
    pub size: u64,
}

#[async_trait]
pub trait VolumeDriver: Send + Sync {
    fn name(&self) -> &str;

    /// Trigger a new group snapshot.  Returns one record per member volume.
    async fn create_group_snapshot(
        &self,
        group_snapshot: &GroupVolumeSnapshot,
    ) -> Result<Vec<VolumeSnapshotRecord>>;

    /// Poll an in-flight group snapshot.  Returns the full record set.
    async fn get_group_snapshot_status(
        &self,
        group_snapshot: &GroupVolumeSnapshot,
    ) -> Result<Vec<VolumeSnapshotRecord>>;

    /// Abort and clean up a group snapshot (driver-side state only).
    async fn delete_group_snapshot(&self, group_snapshot: &GroupVolumeSnapshot) -> Result<()>;

    async fn inspect_volume(&self, volume_id: &str) -> Result<VolumeInfo>;

    /// Start restoring the given backed-up volumes.  Returns one record per
    /// volume; a failure here is treated as non-transient by the caller.
    async fn start_restore(
        &self,
        restore: &ApplicationRestore,
        volumes: &[BackupVolumeInfo],
    ) -> Result<Vec<RestoreVolumeInfo>>;

    /// Poll all of this driver's volumes for the restore.  The returned set
    /// is authoritative and replaces previously recorded state.
    async fn get_restore_status(
        &self,
        restore: &ApplicationRestore,
    ) -> Result<Vec<RestoreVolumeInfo>>;

    /// Abort an in-flight restore.  Must be a no-op when the restore has
    /// already finished or never started.
    async fn cancel_restore(&self, restore: &ApplicationRestore) -> Result<()>;

    /// Resources the driver needs applied before its volume restore starts,
    /// selected from the backup's full manifest set.
    async fn get_pre_restore_resources(
        &self,
        backup: &ApplicationBackup,
        objects: &[DynamicObject],
    ) -> Result<Vec<DynamicObject>>;

    /// Whether this driver provisioned the given PersistentVolume.
    fn owns_pv(&self, pv: &PersistentVolume) -> bool;
}

/// Name → driver lookup, populated once at startup.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn VolumeDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, driver: Arc<dyn VolumeDriver>) {
        self.drivers.insert(driver.name().to_string(), driver);
    }

    /// Resolve a driver by name, falling back to the default driver name for
    /// an empty string.
    pub fn get(&self, name: &str) -> Result<Arc<dyn VolumeDriver>> {
        let name = if name.is_empty() {
            DEFAULT_DRIVER_NAME
        } else {
            name
        };
        self.drivers
            .get(name)
            .cloned()
            .ok_or_else(|| Error::driver(format!("no volume driver registered for {name:?}")))
    }

    /// Resolve which driver provisioned a PersistentVolume.  A PV with a
    /// `spec.csi` source that no registered driver claims belongs to the
    /// generic CSI path.
    pub fn driver_name_for_pv(&self, pv: &PersistentVolume) -> Result<String> {
        for driver in self.drivers.values() {
            if driver.owns_pv(pv) {
                return Ok(driver.name().to_string());
            }
        }
        let is_csi = pv
            .spec
            .as_ref()
            .is_some_and(|spec| spec.csi.is_some());
        if is_csi {
            return Ok(CSI_DRIVER_NAME.to_string());
        }
        Err(Error::driver(format!(
            "no driver found for PersistentVolume {:?}",
            pv.metadata.name.as_deref().unwrap_or("")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{CSIPersistentVolumeSource, PersistentVolumeSpec};

    fn csi_pv(driver: &str) -> PersistentVolume {
        PersistentVolume {
            spec: Some(PersistentVolumeSpec {
                csi: Some(CSIPersistentVolumeSource {
                    driver: driver.to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn empty_name_resolves_default_driver() {
        let registry = DriverRegistry::new();
        let err = match registry.get("") {
            Ok(_) => panic!("empty registry must not resolve a driver"),
            Err(e) => e,
        };
        assert!(err.to_string().contains(DEFAULT_DRIVER_NAME));
    }

    #[test]
    fn unclaimed_csi_pv_belongs_to_generic_csi() {
        let registry = DriverRegistry::new();
        let name = registry.driver_name_for_pv(&csi_pv("ebs.csi.aws.com")).unwrap();
        assert_eq!(name, CSI_DRIVER_NAME);
    }

    #[test]
    fn non_csi_pv_without_owner_is_an_error() {
        let registry = DriverRegistry::new();
        let pv = PersistentVolume::default();
        assert!(registry.driver_name_for_pv(&pv).is_err());
    }
}
