use hierarchy_controller_k8s_api::{ApiResource, GroupVersionKind, Resource, ResourceExt};
use serde::Serialize;
use std::fmt;

/// Identifies a single object on the cluster, independent of its Rust type.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef {
    pub api_version: String,
    pub kind: String,
    pub plural: String,
    pub namespace: Option<String>,
    pub name: String,
}

/// An idempotent intent to converge a single object.
#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    Upsert(Upsert),
    Delete(ObjectRef),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Upsert {
    pub target: ObjectRef,
    pub payload: Payload,
}

/// The desired state carried by an upsert.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    /// A full object, applied to the object's main resource.
    Object(serde_json::Value),

    /// A partial object applied to the object's `status` subresource.
    Status(serde_json::Value),
}

// === impl ObjectRef ===

impl ObjectRef {
    pub fn new<K>(namespace: Option<String>, name: impl Into<String>) -> Self
    where
        K: Resource<DynamicType = ()>,
    {
        Self {
            api_version: K::api_version(&()).into_owned(),
            kind: K::kind(&()).into_owned(),
            plural: K::plural(&()).into_owned(),
            namespace,
            name: name.into(),
        }
    }

    pub fn of<K>(resource: &K) -> Self
    where
        K: Resource<DynamicType = ()>,
    {
        Self::new::<K>(resource.namespace(), resource.name_any())
    }

    pub fn api_resource(&self) -> ApiResource {
        let (group, version) = match self.api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", self.api_version.as_str()),
        };
        ApiResource::from_gvk_with_plural(
            &GroupVersionKind::gvk(group, version, &self.kind),
            &self.plural,
        )
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

// === impl Action ===

impl Action {
    /// Builds an upsert that applies the full object.
    pub fn upsert<K>(resource: &K) -> Result<Self, serde_json::Error>
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        let mut payload = serde_json::to_value(resource)?;
        // Server-side apply requires the type metadata in the body.
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("apiVersion".into(), K::api_version(&()).into());
            obj.insert("kind".into(), K::kind(&()).into());
        }
        Ok(Self::Upsert(Upsert {
            target: ObjectRef::of(resource),
            payload: Payload::Object(payload),
        }))
    }

    /// Builds an upsert of an object's status subresource.
    pub fn upsert_status<K, S>(
        namespace: Option<String>,
        name: &str,
        status: &S,
    ) -> Result<Self, serde_json::Error>
    where
        K: Resource<DynamicType = ()>,
        S: Serialize,
    {
        let status = serde_json::to_value(status)?;
        let payload = serde_json::json!({
            "apiVersion": K::api_version(&()),
            "kind": K::kind(&()),
            "metadata": { "name": name },
            "status": status,
        });
        Ok(Self::Upsert(Upsert {
            target: ObjectRef::new::<K>(namespace, name),
            payload: Payload::Status(payload),
        }))
    }

    pub fn delete<K>(namespace: Option<String>, name: impl Into<String>) -> Self
    where
        K: Resource<DynamicType = ()>,
    {
        Self::Delete(ObjectRef::new::<K>(namespace, name))
    }

    pub fn target(&self) -> &ObjectRef {
        match self {
            Self::Upsert(Upsert { target, .. }) => target,
            Self::Delete(target) => target,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Self::Delete(_))
    }

    pub(crate) fn op(&self) -> &'static str {
        match self {
            Self::Upsert(Upsert {
                payload: Payload::Status(_),
                ..
            }) => "upsert_status",
            Self::Upsert(_) => "upsert",
            Self::Delete(_) => "delete",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.op(), self.target())
    }
}
