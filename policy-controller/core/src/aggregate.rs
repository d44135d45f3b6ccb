//! Top-down aggregation of inherited policy.
//!
//! Each policy kind implements [`AggregatedNode`] to describe how a node's own
//! declarations merge with everything inherited from above it. The tree walk
//! itself lives in [`Ancestry::aggregate`] and is shared by all kinds.

use crate::Ancestry;
use hierarchy_controller_k8s_api::PolicyNode;

pub trait AggregatedNode: Sized {
    type Output;

    /// Returns a new aggregate holding everything accumulated so far plus
    /// `node`'s own declarations.
    fn aggregated(&self, node: &PolicyNode) -> Self;

    /// Materializes the merged policy for the last node aggregated.
    fn generate(&self) -> Self::Output;
}

impl Ancestry {
    /// Folds the ancestry from the root down to the node, so that a node's
    /// declarations are applied after (and may override) its ancestors'.
    pub fn aggregate<A, F>(&self, factory: F) -> A::Output
    where
        A: AggregatedNode,
        F: FnOnce() -> A,
    {
        self.iter()
            .rev()
            .fold(factory(), |acc, node| acc.aggregated(node))
            .generate()
    }
}
