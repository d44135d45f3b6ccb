use k8s_openapi::{
    api::{
        core::v1::ResourceQuotaSpec,
        rbac::v1::{Role, RoleBinding},
    },
    apimachinery::pkg::{api::resource::Quantity, apis::meta::v1::Time},
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

/// Declares a single node of the policy hierarchy.
///
/// Nodes form a tree through their `parent` references. Policies declared on
/// a node are inherited by every namespace beneath it.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "policyhierarchy.dev",
    version = "v1",
    kind = "PolicyNode",
    status = "PolicyNodeStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct PolicyNodeSpec {
    #[serde(rename = "type")]
    pub type_: PolicyNodeType,

    /// The name of the parent node. Empty for roots.
    #[serde(default)]
    pub parent: String,

    #[serde(default)]
    pub roles: Vec<Role>,

    #[serde(default)]
    pub role_bindings: Vec<RoleBinding>,

    pub resource_quota: Option<ResourceQuotaSpec>,

    #[serde(default)]
    pub import_token: String,

    pub import_time: Option<Time>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum PolicyNodeType {
    /// An interior node. Never materializes a namespace.
    AbstractNamespace,

    /// Materializes a namespace that receives flattened policy.
    #[default]
    Namespace,

    /// A namespace that exists but whose policy is not enforced.
    UnmanagedNamespace,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PolicyNodeStatus {
    pub quota: Option<QuotaStatus>,
}

/// Hierarchical quota state for a node: the tightest limits inherited along
/// its ancestry and the usage rolled up from the namespaces beneath it.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct QuotaStatus {
    #[serde(default)]
    pub hard: BTreeMap<String, Quantity>,

    #[serde(default)]
    pub used: BTreeMap<String, Quantity>,
}

// === impl PolicyNodeSpec ===

impl PolicyNodeSpec {
    /// Returns the parent's name, or `None` for a root node.
    pub fn parent(&self) -> Option<&str> {
        if self.parent.is_empty() {
            None
        } else {
            Some(&self.parent)
        }
    }

    /// Returns the hard limits declared directly on this node.
    pub fn quota_hard(&self) -> Option<&BTreeMap<String, Quantity>> {
        self.resource_quota.as_ref()?.hard.as_ref()
    }
}

// === impl PolicyNodeType ===

impl PolicyNodeType {
    pub fn is_abstract(&self) -> bool {
        matches!(self, Self::AbstractNamespace)
    }

    /// Indicates whether the controller materializes policy into the node's
    /// namespace.
    pub fn is_managed_namespace(&self) -> bool {
        matches!(self, Self::Namespace)
    }
}

impl fmt::Display for PolicyNodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::AbstractNamespace => "AbstractNamespace",
            Self::Namespace => "Namespace",
            Self::UnmanagedNamespace => "UnmanagedNamespace",
        })
    }
}
