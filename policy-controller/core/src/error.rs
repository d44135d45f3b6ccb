use hierarchy_controller_k8s_api::PolicyNodeType;
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum Error {
    #[error("policy node {0} not found")]
    NotFound(String),

    #[error(transparent)]
    Consistency(#[from] ConsistencyError),
}

/// Describes a policy tree that violates the hierarchy's invariants.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ConsistencyError {
    #[error("cycle detected at policy node {repeated}: {}", .cycle.join(" -> "))]
    Cycle {
        repeated: String,
        /// The nodes that form the cycle, starting and ending with `repeated`.
        cycle: Vec<String>,
    },

    #[error(
        "policy node {node} has parent {parent} of type {parent_type}, parents must be of type AbstractNamespace (ancestry: {})",
        .ancestry.join(" -> ")
    )]
    InvalidParent {
        node: String,
        parent: String,
        parent_type: PolicyNodeType,
        ancestry: Vec<String>,
    },

    #[error(
        "policy node {node} has parent {parent} which does not exist (ancestry: {})",
        .ancestry.join(" -> ")
    )]
    ParentNotFound {
        node: String,
        parent: String,
        ancestry: Vec<String>,
    },

    #[error("only one root policy node is allowed, found: {}", .roots.join(", "))]
    MultipleRoots { roots: Vec<String> },

    #[error("policy node {node} cannot be removed while it has children: {}", .children.join(", "))]
    Orphans { node: String, children: Vec<String> },

    #[error("policy node {0} already exists")]
    AlreadyExists(String),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
