//! Hierarchy Controller Indexes
//!
//! The controller watches `PolicyNode` resources along with the managed
//! objects it generates from them. Each index below observes a subset of
//! these watches:
//!
//! - A [`TreeIndex`] mirrors the declared policy tree so that admission can
//!   validate proposed changes against it.
//! - An [`RbacSyncer`] flattens the roles and role bindings each managed
//!   namespace inherits from its ancestors.
//! - A [`Syncer`] materializes the objects each node declares for itself, such
//!   as the namespace's `ResourceQuota` (see [`ResourceQuotaUnpacker`]).
//! - A [`QuotaIndex`] rolls up quota usage through the tree to admit requests
//!   and publish each node's quota status.
//!
//! ```text
//! [ PolicyNode ] -> [ Tree ] -> [ Ancestry ] -> [ Instances ] -> [ Action ]
//! ```
//!
//! Syncers never write to the cluster directly. They enqueue [`Action`]s on a
//! shared [`Queue`] that a single controller drains.
//!
//! [`Action`]: hierarchy_controller_k8s_actions::Action
//! [`Queue`]: hierarchy_controller_k8s_actions::Queue

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod metrics;
pub mod quota;
pub mod rbac;
pub mod syncer;
pub mod tree;


pub use self::{
    metrics::{IndexMetrics, SizedIndex},
    quota::{QuotaIndex, SharedQuotaIndex},
    rbac::{RbacSyncer, SharedRbacSyncer},
    syncer::{ResourceQuotaUnpacker, Syncer, Unpacker},
    tree::{SharedTreeIndex, TreeIndex},
};
