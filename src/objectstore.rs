//! Object store contract plus the payload-download helpers shared by the
//! restore path.  Bucket implementations (S3 and friends) are external; the
//! controllers only read backup payloads written by the backup side.

use async_trait::async_trait;
use kube::core::DynamicObject;

use crate::crd::backup_location::BackupLocation;
use crate::error::{Error, Result};

/// Payload object holding the captured namespace manifests.
pub const NAMESPACES_OBJECT: &str = "namespaces.json";
/// Payload object holding every captured resource manifest.
pub const RESOURCES_OBJECT: &str = "resources.json";
/// Payload object holding captured CustomResourceDefinitions.
pub const CRDS_OBJECT: &str = "crds.json";

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn exists(&self, location: &BackupLocation, path: &str) -> Result<bool>;

    async fn read_all(&self, location: &BackupLocation, path: &str) -> Result<Vec<u8>>;

    /// Symmetric decryption of a payload read from an encrypted location.
    async fn decrypt(&self, data: Vec<u8>, key: &str) -> Result<Vec<u8>>;
}

/// Read one payload object from under the backup's path, decrypting when the
/// location carries an encryption key.  With `skip_if_missing`, a missing
/// object returns `None` instead of an error (some payloads are optional).
pub async fn download_object(
    store: &dyn ObjectStore,
    location: &BackupLocation,
    backup_path: &str,
    object_name: &str,
    skip_if_missing: bool,
) -> Result<Option<Vec<u8>>> {
    let path = join_path(backup_path, object_name);

    if skip_if_missing && !store.exists(location, &path).await.unwrap_or(false) {
        return Ok(None);
    }

    let mut data = store.read_all(location, &path).await?;
    if let Some(key) = location.spec.encryption_key.as_deref() {
        if !key.is_empty() {
            data = store.decrypt(data, key).await?;
        }
    }
    Ok(Some(data))
}

/// Download and parse the backup's full resource manifest set.
pub async fn download_resource_objects(
    store: &dyn ObjectStore,
    location: &BackupLocation,
    backup_path: &str,
) -> Result<Vec<DynamicObject>> {
    let data = download_object(store, location, backup_path, RESOURCES_OBJECT, false)
        .await?
        .ok_or_else(|| Error::object_store(format!("{RESOURCES_OBJECT} missing from backup")))?;
    let objects: Vec<DynamicObject> = serde_json::from_slice(&data)?;
    Ok(objects)
}

fn join_path(prefix: &str, object: &str) -> String {
    if prefix.is_empty() {
        object.to_string()
    } else {
        format!("{}/{}", prefix.trim_end_matches('/'), object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_path_handles_prefixes() {
        assert_eq!(join_path("", "resources.json"), "resources.json");
        assert_eq!(join_path("backups/b1", "crds.json"), "backups/b1/crds.json");
        assert_eq!(join_path("backups/b1/", "crds.json"), "backups/b1/crds.json");
    }
}
