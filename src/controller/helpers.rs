//! Shared helpers for the two reconcilers: event publishing, owner
//! references, and the resource-version floor gate that suppresses stale
//! resync deliveries.

use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::runtime::events::{Event as KubeEvent, EventType, Recorder, Reporter};
use kube::{Client, Resource, ResourceExt};
use tracing::warn;

use crate::error::{Error, Result};

/// Field manager name used for server-side apply patches.
pub const FIELD_MANAGER: &str = "snapshot-operator";

/// Finalizer gating deletion of both resource kinds until collaborator
/// cleanup has run.
pub const FINALIZER_CLEANUP: &str = "snapshot-operator.io/cleanup";

/// Build a controller OwnerReference for any kube-rs `Resource` whose
/// Kubernetes metadata is known at compile time.
pub fn controller_owner_ref<K: Resource<DynamicType = ()>>(obj: &K) -> OwnerReference {
    OwnerReference {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        name: obj.name_any(),
        uid: obj.meta().uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Build an ObjectReference from any kube Resource.
pub fn kube_object_ref<K: Resource<DynamicType = ()>>(obj: &K) -> ObjectReference {
    ObjectReference {
        api_version: Some(K::api_version(&()).to_string()),
        kind: Some(K::kind(&()).to_string()),
        name: Some(obj.name_any()),
        namespace: obj.namespace(),
        uid: obj.meta().uid.clone(),
        resource_version: obj.meta().resource_version.clone(),
        ..Default::default()
    }
}

/// Publish a Kubernetes event attached to the given resource.
/// Errors are logged but never block reconciliation.
pub async fn publish_event<K: Resource<DynamicType = ()>>(
    client: &Client,
    reporter: &Reporter,
    obj: &K,
    type_: EventType,
    reason: &str,
    action: &str,
    note: Option<String>,
) {
    let rec = Recorder::new(client.clone(), reporter.clone());
    let oref = kube_object_ref(obj);
    if let Err(e) = rec
        .publish(
            &KubeEvent {
                type_,
                reason: reason.to_string(),
                note,
                action: action.to_string(),
                secondary: None,
            },
            &oref,
        )
        .await
    {
        warn!(%e, "failed to publish event");
    }
}

// ── Resource-version floor ────────────────────────────────────────────────────

/// Decide whether an incoming event passes the recorded floor for its UID.
/// Kubernetes resource versions are opaque but numeric in practice; both
/// sides must parse or the event is rejected as malformed.
pub fn version_floor_allows(floor: &str, incoming: &str) -> Result<bool> {
    let floor_version: u64 = floor
        .parse()
        .map_err(|_| Error::reconcile(format!("unparseable floor resource version {floor:?}")))?;
    let incoming_version: u64 = incoming.parse().map_err(|_| {
        Error::reconcile(format!("unparseable resource version {incoming:?}"))
    })?;
    Ok(incoming_version >= floor_version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floor_blocks_older_versions() {
        assert!(!version_floor_allows("5", "3").unwrap());
        assert!(version_floor_allows("5", "5").unwrap());
        assert!(version_floor_allows("5", "7").unwrap());
    }

    #[test]
    fn unparseable_versions_are_rejected() {
        assert!(version_floor_allows("abc", "3").is_err());
        assert!(version_floor_allows("5", "x").is_err());
    }
}
