use super::{Nodes, QuotaNode, QuotaViolation, ResourceList};
use hierarchy_controller_k8s_api::PolicyNode;

/// A snapshot of hierarchical quota state for a single admission decision.
///
/// The cache is rebuilt in full from the current policy nodes and leaf usage
/// each time it is constructed and is never updated afterwards.
#[derive(Clone, Debug)]
pub struct HierarchicalQuotaCache {
    nodes: Nodes,
}

impl HierarchicalQuotaCache {
    /// Builds quota nodes for `nodes` and rolls up the observed usage of each
    /// leaf namespace into all of its ancestors.
    pub fn new<'n>(
        nodes: impl IntoIterator<Item = &'n PolicyNode>,
        usage: impl IntoIterator<Item = (String, ResourceList)>,
    ) -> Self {
        let mut nodes = Nodes::new(nodes);
        for (namespace, used) in usage {
            if nodes.get(&namespace).is_none() {
                tracing::debug!(%namespace, "Skipping usage for a namespace outside of the policy tree");
                continue;
            }
            nodes.add_usage(&namespace, &used);
        }
        Self { nodes }
    }

    /// Checks that `increment` may be added to `namespace`'s usage without
    /// exceeding the hard limit of any of its ancestors.
    ///
    /// Namespaces without a policy node are not governed and always admitted.
    pub fn admit(&self, namespace: &str, increment: &ResourceList) -> Result<(), QuotaViolation> {
        self.nodes.admit(namespace, increment)
    }

    pub fn node(&self, name: &str) -> Option<&QuotaNode> {
        self.nodes.get(name)
    }
}
