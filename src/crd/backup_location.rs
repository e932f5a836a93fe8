use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// BackupLocation names a bucket (or bucket prefix) in the external object
/// store.  The store implementation behind it is out of scope; the
/// controllers only pass the location through to the ObjectStore trait and
/// honor its encryption key.
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "snapshot-operator.io",
    version = "v1alpha1",
    kind = "BackupLocation",
    shortname = "bkploc",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct BackupLocationSpec {
    /// Bucket path or prefix.
    #[serde(default)]
    pub path: String,

    /// Symmetric key used to decrypt payloads read from this location.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key: Option<String>,
}
