//! The hierarchical policy engine.
//!
//! A [`hierarchy::Tree`] holds the declared `PolicyNode`s. Every node's
//! effective policy is computed by walking its [`hierarchy::Ancestry`] from the
//! root down, folding each node's declarations into an
//! [`aggregate::AggregatedNode`]. RBAC and quota define their own merge
//! semantics on top of this shared walk.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod aggregate;
mod error;
pub mod hierarchy;
pub mod quantity;
pub mod quota;
pub mod rbac;

pub use self::{
    aggregate::AggregatedNode,
    error::{ConsistencyError, Error},
    hierarchy::{Ancestry, Import, Tree, Validator},
    quantity::Quantity,
    quota::{
        EffectiveLimits, HierarchicalQuota, HierarchicalQuotaCache, QuotaNode, QuotaViolation,
        ResourceList,
    },
    rbac::{Instances, RbacAggregate},
};

/// The name under which a policy node is indexed.
pub(crate) fn node_name(node: &hierarchy_controller_k8s_api::PolicyNode) -> String {
    use hierarchy_controller_k8s_api::ResourceExt;
    node.name_any()
}
