use crate::metrics::SizedIndex;
use hierarchy_controller_core::Tree;
use hierarchy_controller_k8s_api::{PolicyNode, ResourceExt};
use kubert::index::{ClusterRemoved, IndexClusterResource};
use parking_lot::RwLock;
use std::sync::Arc;

pub type SharedTreeIndex = Arc<RwLock<TreeIndex>>;

/// Mirrors the cluster's policy nodes for admission decisions.
#[derive(Debug, Default)]
pub struct TreeIndex {
    tree: Tree,
}

// === impl TreeIndex ===

impl TreeIndex {
    pub fn shared() -> SharedTreeIndex {
        Arc::new(RwLock::new(Self::default()))
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// Returns a copy of the current tree that callers may mutate freely.
    pub fn snapshot(&self) -> Tree {
        self.tree.clone()
    }
}

impl IndexClusterResource<PolicyNode> for TreeIndex {
    fn apply(&mut self, node: PolicyNode) {
        tracing::trace!(name = %node.name_any(), "Indexing policy node");
        self.tree.insert(node);
    }

    fn delete(&mut self, name: String) {
        tracing::trace!(%name, "Removing policy node");
        self.tree.remove(&name);
    }

    fn reset(&mut self, nodes: Vec<PolicyNode>, removed: ClusterRemoved) {
        tracing::debug!(nodes = nodes.len(), removed = removed.len(), "Resetting policy tree");
        self.tree = nodes.into_iter().collect();
    }
}

impl SizedIndex<PolicyNode> for TreeIndex {
    fn size(&self, _namespace: Option<&str>) -> usize {
        self.tree.len()
    }
}
