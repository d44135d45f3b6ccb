use super::{EffectiveLimits, Nodes, QuotaNode, QuotaViolation, ResourceList};
use crate::{Error, Tree};
use ahash::AHashMap as HashMap;
use hierarchy_controller_k8s_api::QuotaStatus;

/// Hierarchical quota state that is kept up to date as leaf usage changes.
///
/// Changes to the tree itself require a new `HierarchicalQuota`; changes to a
/// leaf's usage are propagated incrementally with
/// [`HierarchicalQuota::update_leaf`].
#[derive(Clone, Debug, Default)]
pub struct HierarchicalQuota {
    tree: Tree,
    nodes: Nodes,
    leaves: HashMap<String, ResourceList>,
}

impl HierarchicalQuota {
    pub fn new(tree: Tree, usage: impl IntoIterator<Item = (String, ResourceList)>) -> Self {
        let mut nodes = Nodes::new(tree.nodes().map(|n| &**n));
        let mut leaves = HashMap::new();
        for (namespace, used) in usage {
            if !tree.contains(&namespace) {
                tracing::debug!(%namespace, "Skipping usage for a namespace outside of the policy tree");
                continue;
            }
            nodes.add_usage(&namespace, &used);
            leaves.insert(namespace, used);
        }
        Self {
            tree,
            nodes,
            leaves,
        }
    }

    /// Records `namespace`'s current usage and propagates the change to its
    /// ancestors.
    ///
    /// Returns the names of the nodes whose usage changed, from the namespace
    /// upwards. Nothing changes when the usage is unchanged.
    pub fn update_leaf(&mut self, namespace: &str, used: ResourceList) -> Result<Vec<String>, Error> {
        if !self.tree.contains(namespace) {
            return Err(Error::NotFound(namespace.to_string()));
        }

        let delta = match self.leaves.get(namespace) {
            Some(prior) => used.delta(prior),
            None => used.clone(),
        };
        if used.is_empty() {
            self.leaves.remove(namespace);
        } else {
            self.leaves.insert(namespace.to_string(), used);
        }

        if delta.is_zero() {
            return Ok(Vec::new());
        }
        Ok(self.nodes.add_usage(namespace, &delta))
    }

    pub fn admit(&self, namespace: &str, increment: &ResourceList) -> Result<(), QuotaViolation> {
        self.nodes.admit(namespace, increment)
    }

    /// Describes a node's quota: the tightest limits along its ancestry and
    /// the usage rolled up beneath it.
    pub fn status(&self, name: &str) -> Result<QuotaStatus, Error> {
        let node = self
            .nodes
            .get(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        let hard = self.tree.ancestry(name)?.aggregate(EffectiveLimits::default);
        Ok(QuotaStatus {
            hard: hard.to_k8s(),
            used: node.used.to_k8s(),
        })
    }

    pub fn node(&self, name: &str) -> Option<&QuotaNode> {
        self.nodes.get(name)
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }
}
