//! Hierarchical quota state.
//!
//! The quota index observes policy nodes and the usage reported by each
//! managed namespace's `ResourceQuota`. Admission decisions are made against a
//! [`HierarchicalQuotaCache`] that is rebuilt from this state for every
//! request. The index also keeps a [`HierarchicalQuota`] up to date so that
//! each node's effective limits and rolled-up usage can be published on its
//! status.

use crate::metrics::SizedIndex;
use ahash::AHashMap as HashMap;
use hierarchy_controller_core::{
    HierarchicalQuota, HierarchicalQuotaCache, QuotaViolation, ResourceList, Tree,
};
use hierarchy_controller_k8s_actions::{Action, Queue};
use hierarchy_controller_k8s_api::{
    labels, PolicyNode, PolicyNodeStatus, QuotaStatus, ResourceExt, ResourceQuota,
    RESOURCE_QUOTA_NAME,
};
use kubert::index::{ClusterRemoved, IndexClusterResource, IndexNamespacedResource, NamespacedRemoved};
use parking_lot::RwLock;
use std::sync::Arc;

pub type SharedQuotaIndex = Arc<RwLock<QuotaIndex>>;

pub struct QuotaIndex {
    tree: Tree,
    /// Usage reported by each namespace's managed quota.
    usage: HashMap<String, ResourceList>,
    quota: HierarchicalQuota,
    /// The quota status last observed on, or written to, each node.
    published: HashMap<String, QuotaStatus>,
    queue: Queue,
}

// === impl QuotaIndex ===

impl QuotaIndex {
    pub fn new(queue: Queue) -> Self {
        Self {
            tree: Tree::default(),
            usage: HashMap::default(),
            quota: HierarchicalQuota::default(),
            published: HashMap::default(),
            queue,
        }
    }

    pub fn shared(queue: Queue) -> SharedQuotaIndex {
        Arc::new(RwLock::new(Self::new(queue)))
    }

    /// Builds a snapshot of the current quota state.
    pub fn cache(&self) -> HierarchicalQuotaCache {
        HierarchicalQuotaCache::new(
            self.tree.nodes().map(|n| &**n),
            self.usage.iter().map(|(ns, used)| (ns.clone(), used.clone())),
        )
    }

    /// Checks whether `increment` may be added to `namespace`'s usage.
    pub fn admit(&self, namespace: &str, increment: &ResourceList) -> Result<(), QuotaViolation> {
        self.cache().admit(namespace, increment)
    }

    fn rebuild(&mut self) {
        self.quota = HierarchicalQuota::new(
            self.tree.clone(),
            self.usage.iter().map(|(ns, used)| (ns.clone(), used.clone())),
        );
        let names = self.tree.names().map(String::from).collect::<Vec<_>>();
        self.publish(names);
    }

    fn update_usage(&mut self, namespace: String, used: ResourceList) {
        if used.is_empty() {
            self.usage.remove(&namespace);
        } else {
            self.usage.insert(namespace.clone(), used.clone());
        }

        match self.quota.update_leaf(&namespace, used) {
            Ok(changed) => self.publish(changed),
            Err(error) if error.is_not_found() => {
                tracing::debug!(%namespace, "Quota usage reported for a namespace outside of the policy tree");
            }
            Err(error) => tracing::warn!(%namespace, %error, "Failed to update quota usage"),
        }
    }

    /// Enqueues a status update for each named node whose quota status
    /// differs from the one last published. Nodes that have never had a
    /// status are treated as having an empty one.
    fn publish(&mut self, names: impl IntoIterator<Item = String>) {
        for name in names {
            let status = match self.quota.status(&name) {
                Ok(status) => status,
                Err(error) => {
                    tracing::debug!(%name, %error, "Skipping quota status");
                    continue;
                }
            };
            let prior = self.published.get(&name).cloned().unwrap_or_default();
            if prior == status {
                continue;
            }

            let update = PolicyNodeStatus {
                quota: Some(status.clone()),
            };
            match Action::upsert_status::<PolicyNode, _>(None, &name, &update) {
                Ok(action) => {
                    tracing::debug!(%name, "Publishing quota status");
                    self.queue.add(action);
                    self.published.insert(name, status);
                }
                Err(error) => tracing::error!(%name, %error, "Failed to serialize quota status"),
            }
        }
    }

    fn observe_status(&mut self, node: &PolicyNode) {
        let observed = node.status.as_ref().and_then(|s| s.quota.clone());
        match observed {
            Some(status) => {
                self.published.insert(node.name_any(), status);
            }
            None => {
                self.published.remove(&node.name_any());
            }
        }
    }
}

impl IndexClusterResource<PolicyNode> for QuotaIndex {
    fn apply(&mut self, node: PolicyNode) {
        self.observe_status(&node);
        self.tree.insert(node);
        self.rebuild();
    }

    fn delete(&mut self, name: String) {
        self.published.remove(&name);
        self.tree.remove(&name);
        self.rebuild();
    }

    fn reset(&mut self, nodes: Vec<PolicyNode>, _removed: ClusterRemoved) {
        self.published.clear();
        for node in &nodes {
            self.observe_status(node);
        }
        self.tree = nodes.into_iter().collect();
        self.rebuild();
    }
}

impl IndexNamespacedResource<ResourceQuota> for QuotaIndex {
    fn apply(&mut self, quota: ResourceQuota) {
        if let Some((namespace, used)) = observed_usage(&quota) {
            self.update_usage(namespace, used);
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        if name == RESOURCE_QUOTA_NAME {
            self.update_usage(namespace, ResourceList::default());
        }
    }

    fn reset(&mut self, quotas: Vec<ResourceQuota>, _removed: NamespacedRemoved) {
        self.usage = quotas.iter().filter_map(observed_usage).collect();
        self.rebuild();
    }
}

/// Returns the usage reported by a namespace's managed quota.
fn observed_usage(quota: &ResourceQuota) -> Option<(String, ResourceList)> {
    if quota.name_any() != RESOURCE_QUOTA_NAME || !labels::is_managed(&quota.metadata) {
        return None;
    }
    let namespace = quota.namespace()?;
    let used = quota
        .status
        .as_ref()
        .and_then(|s| s.used.as_ref())
        .map(ResourceList::from_k8s_lossy)
        .unwrap_or_default();
    Some((namespace, used))
}

impl SizedIndex<PolicyNode> for QuotaIndex {
    fn size(&self, _namespace: Option<&str>) -> usize {
        self.tree.len()
    }
}

impl SizedIndex<ResourceQuota> for QuotaIndex {
    fn size(&self, namespace: Option<&str>) -> usize {
        match namespace {
            Some(ns) => usize::from(self.usage.contains_key(ns)),
            None => self.usage.len(),
        }
    }
}
