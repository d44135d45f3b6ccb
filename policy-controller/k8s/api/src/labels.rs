//! Labels and annotations written on the objects the controller manages.

use kube::api::ObjectMeta;
use std::collections::BTreeMap;

/// Marks an object as owned by the controller. Only objects carrying this
/// label are ever updated or garbage-collected.
pub const MANAGED: &str = "policyhierarchy.dev/managed";

pub const MANAGED_VALUE: &str = "full";

/// The label selector matching every managed object.
pub const MANAGED_SELECTOR: &str = "policyhierarchy.dev/managed=full";

/// The import token of the most recent import along an object's ancestry.
pub const IMPORT_TOKEN: &str = "policyhierarchy.dev/import-token";

/// The time of the most recent import along an object's ancestry.
pub const IMPORT_TIME: &str = "policyhierarchy.dev/import-time";

pub fn is_managed(meta: &ObjectMeta) -> bool {
    meta.labels
        .as_ref()
        .and_then(|labels| labels.get(MANAGED))
        .map(|v| v == MANAGED_VALUE)
        .unwrap_or(false)
}

/// Returns a label map with the managed label set.
pub fn managed() -> BTreeMap<String, String> {
    Some((MANAGED.to_string(), MANAGED_VALUE.to_string()))
        .into_iter()
        .collect()
}
