//! Hierarchical resource quota.
//!
//! Hard limits may be declared on any node of the tree. Usage is observed on
//! leaf namespaces and rolled up into every ancestor, so that an ancestor's
//! limit bounds the sum of its descendants' usage.

use crate::{aggregate::AggregatedNode, node_name, quantity::ParseError, Quantity};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use hierarchy_controller_k8s_api::{self as k8s, PolicyNode};
use std::collections::{btree_map, BTreeMap};

mod cache;
mod tree;

#[cfg(test)]
mod tests;

pub use self::{cache::HierarchicalQuotaCache, tree::HierarchicalQuota};

/// Quantities keyed by resource name.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceList(BTreeMap<String, Quantity>);

/// The quota state of a single policy node.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QuotaNode {
    /// Limits declared directly on the node.
    pub hard: ResourceList,
    /// Usage summed over every namespace at or beneath the node.
    pub used: ResourceList,
    pub parent: Option<String>,
    pub is_abstract: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error(
    "exceeded quota in policy node {namespace}: requested {resource}={requested}, used {resource}={used}, limited {resource}={limit}"
)]
pub struct QuotaViolation {
    pub resource: String,
    pub namespace: String,
    pub requested: Quantity,
    pub used: Quantity,
    pub limit: Quantity,
}

/// Folds the tightest limit for each resource along an ancestry.
#[derive(Clone, Debug, Default)]
pub struct EffectiveLimits(ResourceList);

/// Quota nodes keyed by name.
#[derive(Clone, Debug, Default)]
struct Nodes(HashMap<String, QuotaNode>);

// === impl ResourceList ===

impl ResourceList {
    pub fn get(&self, resource: &str) -> Option<Quantity> {
        self.0.get(resource).copied()
    }

    pub fn insert(&mut self, resource: impl Into<String>, q: Quantity) -> Option<Quantity> {
        self.0.insert(resource.into(), q)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Quantity)> {
        self.0.iter().map(|(r, q)| (r.as_str(), *q))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Adds `other` resource by resource. Resources missing from `self` are
    /// initialized with `other`'s quantity.
    pub fn add(&mut self, other: &ResourceList) {
        for (resource, q) in other.iter() {
            *self.0.entry(resource.to_string()).or_default() += q;
        }
    }

    /// Subtracts `other` resource by resource. Entries that reach zero are
    /// kept.
    pub fn sub(&mut self, other: &ResourceList) {
        for (resource, q) in other.iter() {
            *self.0.entry(resource.to_string()).or_default() -= q;
        }
    }

    /// Returns `self - other`, covering the resources of both lists.
    pub fn delta(&self, other: &ResourceList) -> ResourceList {
        let mut delta = self.clone();
        delta.sub(other);
        delta
    }

    /// Lowers each of `self`'s limits to `other`'s where `other`'s is tighter.
    pub fn restrict(&mut self, other: &ResourceList) {
        for (resource, q) in other.iter() {
            match self.0.entry(resource.to_string()) {
                btree_map::Entry::Vacant(e) => {
                    e.insert(q);
                }
                btree_map::Entry::Occupied(mut e) => {
                    if q < *e.get() {
                        e.insert(q);
                    }
                }
            }
        }
    }

    pub fn is_zero(&self) -> bool {
        self.0.values().all(Quantity::is_zero)
    }

    pub fn try_from_k8s(list: &BTreeMap<String, k8s::Quantity>) -> Result<Self, ParseError> {
        list.iter()
            .map(|(resource, q)| Ok((resource.clone(), Quantity::try_from(q)?)))
            .collect()
    }

    /// Parses a list, dropping (and logging) quantities that do not parse.
    pub fn from_k8s_lossy(list: &BTreeMap<String, k8s::Quantity>) -> Self {
        list.iter()
            .filter_map(|(resource, q)| match Quantity::try_from(q) {
                Ok(q) => Some((resource.clone(), q)),
                Err(error) => {
                    tracing::warn!(%resource, %error, "Ignoring invalid quantity");
                    None
                }
            })
            .collect()
    }

    pub fn to_k8s(&self) -> BTreeMap<String, k8s::Quantity> {
        self.0
            .iter()
            .map(|(resource, q)| (resource.clone(), (*q).into()))
            .collect()
    }
}

impl FromIterator<(String, Quantity)> for ResourceList {
    fn from_iter<T: IntoIterator<Item = (String, Quantity)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<BTreeMap<String, Quantity>> for ResourceList {
    fn from(list: BTreeMap<String, Quantity>) -> Self {
        Self(list)
    }
}

// === impl QuotaNode ===

impl QuotaNode {
    fn new(node: &PolicyNode) -> Self {
        Self {
            hard: node
                .spec
                .quota_hard()
                .map(ResourceList::from_k8s_lossy)
                .unwrap_or_default(),
            used: ResourceList::default(),
            parent: node.spec.parent().map(Into::into),
            is_abstract: node.spec.type_.is_abstract(),
        }
    }
}

// === impl EffectiveLimits ===

impl AggregatedNode for EffectiveLimits {
    type Output = ResourceList;

    fn aggregated(&self, node: &PolicyNode) -> Self {
        let mut limits = self.0.clone();
        if let Some(hard) = node.spec.quota_hard() {
            limits.restrict(&ResourceList::from_k8s_lossy(hard));
        }
        Self(limits)
    }

    fn generate(&self) -> ResourceList {
        self.0.clone()
    }
}

// === impl Nodes ===

impl Nodes {
    fn new<'n>(nodes: impl IntoIterator<Item = &'n PolicyNode>) -> Self {
        Self(
            nodes
                .into_iter()
                .map(|node| (node_name(node), QuotaNode::new(node)))
                .collect(),
        )
    }

    fn get(&self, name: &str) -> Option<&QuotaNode> {
        self.0.get(name)
    }

    /// Returns `name` followed by each of its ancestors that has a quota node.
    ///
    /// The walk stops at the first missing node and at the first revisited
    /// name.
    fn path(&self, name: &str) -> Vec<String> {
        let mut path = Vec::new();
        let mut visited = HashSet::new();
        let mut current = Some(name.to_string());
        while let Some(name) = current.take() {
            let Some(node) = self.0.get(&name) else {
                break;
            };
            if !visited.insert(name.clone()) {
                tracing::warn!(%name, "Cycle detected while rolling up quota usage");
                break;
            }
            current = node.parent.clone();
            path.push(name);
        }
        path
    }

    /// Adds `delta` to the usage of `name` and each of its ancestors,
    /// returning the nodes that were updated.
    fn add_usage(&mut self, name: &str, delta: &ResourceList) -> Vec<String> {
        let path = self.path(name);
        for name in &path {
            if let Some(node) = self.0.get_mut(name) {
                node.used.add(delta);
            }
        }
        path
    }

    fn admit(&self, namespace: &str, increment: &ResourceList) -> Result<(), QuotaViolation> {
        let Some(leaf) = self.0.get(namespace) else {
            tracing::debug!(%namespace, "Namespace is not governed by hierarchical quota");
            return Ok(());
        };

        // The namespace's own limits are enforced by its ResourceQuota.
        let Some(parent) = leaf.parent.as_deref() else {
            return Ok(());
        };

        for name in self.path(parent) {
            let Some(node) = self.0.get(&name) else {
                continue;
            };
            for (resource, requested) in increment.iter() {
                let Some(limit) = node.hard.get(resource) else {
                    continue;
                };
                let used = node.used.get(resource).unwrap_or_default();
                if used + requested > limit {
                    return Err(QuotaViolation {
                        resource: resource.to_string(),
                        namespace: name,
                        requested,
                        used,
                        limit,
                    });
                }
            }
        }
        Ok(())
    }
}
