use std::collections::HashMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group for all operator-owned custom resources.
pub const API_GROUP: &str = "snapshot-operator.io";

/// Annotation carrying the CSV list of namespaces allowed to restore from a
/// child snapshot object.
pub const RESTORE_NAMESPACES_ANNOTATION: &str = "snapshot-operator.io/restore-namespaces";

/// ObjectInfo identifies a single Kubernetes resource by group, version,
/// kind, namespace and name.  Used both for include-filters in restore specs
/// and as the identity key for per-resource restore records.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct ObjectInfo {
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
}

impl ObjectInfo {
    /// The legacy core group is written both as "" and as "core" depending on
    /// where the object came from.  Normalise to "core" so lookups match.
    pub fn normalized(&self) -> ObjectInfo {
        let mut info = self.clone();
        if info.group.is_empty() {
            info.group = "core".to_string();
        }
        info
    }
}

/// Build a lookup set from an include-resources filter.  An empty filter
/// yields an empty map, which callers treat as "include everything".
pub fn create_objects_map(include: &[ObjectInfo]) -> HashMap<ObjectInfo, bool> {
    include
        .iter()
        .map(|info| (info.normalized(), true))
        .collect()
}

/// Condition reported by a volume driver for a single snapshot in a group.
/// The first entry in a record's condition list is the latest one.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct SnapshotCondition {
    #[serde(rename = "type")]
    pub condition_type: SnapshotConditionType,
    /// "True" / "False" / "Unknown", matching core v1 condition conventions.
    pub status: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum SnapshotConditionType {
    Ready,
    Error,
    Pending,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn objects_map_normalizes_core_group() {
        let include = vec![ObjectInfo {
            group: String::new(),
            version: "v1".into(),
            kind: "PersistentVolumeClaim".into(),
            namespace: "ns1".into(),
            name: "data".into(),
        }];
        let map = create_objects_map(&include);

        let key = ObjectInfo {
            group: "core".into(),
            version: "v1".into(),
            kind: "PersistentVolumeClaim".into(),
            namespace: "ns1".into(),
            name: "data".into(),
        };
        assert!(map.contains_key(&key));
    }

    #[test]
    fn empty_filter_yields_empty_map() {
        assert!(create_objects_map(&[]).is_empty());
    }
}
