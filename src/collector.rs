//! Resource collector contract: the external library that filters,
//! transforms, applies and deletes arbitrary Kubernetes manifests against
//! remap rules.  The restore controller treats it as an opaque capability.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use kube::core::DynamicObject;

use crate::crd::shared::ObjectInfo;
use crate::error::Result;

#[async_trait]
pub trait ResourceCollector: Send + Sync {
    /// Decide whether an object should be skipped, and transform it in
    /// place (namespace remap, PV name remap) when it should be applied.
    /// An empty include-filter map means everything is included.
    #[allow(clippy::too_many_arguments)]
    async fn prepare_resource_for_apply(
        &self,
        object: &mut DynamicObject,
        all_objects: &[DynamicObject],
        include_filter: &HashMap<ObjectInfo, bool>,
        namespace_mapping: &BTreeMap<String, String>,
        pv_name_mapping: Option<&HashMap<String, String>>,
        include_optional_resource_types: bool,
    ) -> Result<bool>;

    /// Create the object.  Surfaces the API server's 409 AlreadyExists as a
    /// `kube::Error` so callers can apply their replace policy.
    async fn apply_resource(&self, object: &DynamicObject) -> Result<()>;

    /// Delete the given objects, ignoring ones already gone.
    async fn delete_resources(&self, objects: &[DynamicObject]) -> Result<()>;
}
