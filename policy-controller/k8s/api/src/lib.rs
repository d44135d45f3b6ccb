#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod labels;
pub mod policy;

pub use self::policy::{PolicyNode, PolicyNodeSpec, PolicyNodeStatus, PolicyNodeType, QuotaStatus};
pub use k8s_openapi::{
    api::{
        self,
        core::v1::{Namespace, Pod, ResourceQuota, ResourceQuotaSpec, ResourceQuotaStatus},
        rbac::v1::{Role, RoleBinding},
    },
    apimachinery::pkg::{api::resource::Quantity, apis::meta::v1::Time},
};
pub use kube::{
    api::{Api, DeleteParams, ObjectMeta, Patch, PatchParams, ResourceExt},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    error::ErrorResponse,
    Client, Error, Resource,
};

/// The API group that owns `PolicyNode` resources and the controller's
/// labels and annotations.
pub const API_GROUP: &str = "policyhierarchy.dev";

/// The name of the `ResourceQuota` materialized in each managed namespace.
pub const RESOURCE_QUOTA_NAME: &str = "pn-resource-quota";
