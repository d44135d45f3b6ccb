//! Reconciles objects that are declared one-to-one by policy nodes.
//!
//! An [`Unpacker`] describes which objects a single node declares. The
//! [`Syncer`] turns policy node events into actions for those objects and
//! mirrors the managed objects that exist on the cluster, so that a full
//! resync can remove managed objects that are no longer declared.

use crate::metrics::SizedIndex;
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use hierarchy_controller_k8s_actions::{Action, ObjectRef, Queue};
use hierarchy_controller_k8s_api::{
    labels, ObjectMeta, PolicyNode, PolicyNodeType, Resource, ResourceExt, ResourceQuota,
    ResourceQuotaSpec, RESOURCE_QUOTA_NAME,
};
use kubert::index::{ClusterRemoved, IndexClusterResource, IndexNamespacedResource, NamespacedRemoved};
use parking_lot::RwLock;
use serde::Serialize;
use std::{collections::BTreeSet, sync::Arc};
use tokio::time;

pub trait Unpacker {
    type Resource: Resource<DynamicType = ()> + Serialize;

    /// Returns the objects `node` declares.
    fn upserts(&self, node: &PolicyNode) -> Vec<Self::Resource>;

    /// Returns references to every object `node` declares.
    fn names(&self, node: &PolicyNode) -> BTreeSet<ObjectRef> {
        self.upserts(node).iter().map(ObjectRef::of).collect()
    }

    /// Returns the objects `old` declares that `new` no longer does.
    fn update_removals(&self, old: &PolicyNode, new: &PolicyNode) -> Vec<ObjectRef> {
        let new = self.names(new);
        self.names(old)
            .into_iter()
            .filter(|name| !new.contains(name))
            .collect()
    }
}

pub struct Syncer<U> {
    unpacker: U,
    nodes: HashMap<String, PolicyNode>,
    /// Managed objects observed on the cluster, by namespace.
    live: HashMap<String, HashSet<String>>,
    queue: Queue,
}

/// Materializes a node's quota spec as a `ResourceQuota` in its namespace.
#[derive(Clone, Debug, Default)]
pub struct ResourceQuotaUnpacker;

// === impl Syncer ===

impl<U: Unpacker> Syncer<U> {
    pub fn new(unpacker: U, queue: Queue) -> Self {
        Self {
            unpacker,
            nodes: HashMap::default(),
            live: HashMap::default(),
            queue,
        }
    }

    pub fn shared(unpacker: U, queue: Queue) -> Arc<RwLock<Self>> {
        Arc::new(RwLock::new(Self::new(unpacker, queue)))
    }

    /// Runs a full resync on a fixed interval.
    ///
    /// Each pass replays the nodes this syncer already holds, so it repairs
    /// drift in the live objects it mirrors. PolicyNode events missed by the
    /// watch are recovered when the watch restarts and `reset` is called.
    pub async fn run(syncer: Arc<RwLock<Self>>, period: time::Duration) {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        interval.tick().await;
        loop {
            interval.tick().await;
            let nodes = syncer.read().nodes.values().cloned().collect::<Vec<_>>();
            tracing::debug!(nodes = nodes.len(), "Resyncing");
            syncer.write().periodic_resync(nodes);
        }
    }

    pub fn on_create(&mut self, node: PolicyNode) {
        self.upsert_all(&node);
        self.nodes.insert(node.name_any(), node);
    }

    /// Removes whatever `old` declared that `new` no longer does, then applies
    /// everything `new` declares.
    pub fn on_update(&mut self, old: &PolicyNode, new: PolicyNode) {
        for target in self.unpacker.update_removals(old, &new) {
            self.queue.add(Action::Delete(target));
        }
        self.upsert_all(&new);
        self.nodes.insert(new.name_any(), new);
    }

    pub fn on_delete(&mut self, name: &str) {
        let Some(node) = self.nodes.remove(name) else {
            return;
        };
        for target in self.unpacker.names(&node) {
            self.queue.add(Action::Delete(target));
        }
    }

    /// Rebuilds the declared state from `nodes` and converges the cluster to
    /// it.
    ///
    /// Managed objects that no node declares are deleted, except in the
    /// namespaces of unmanaged namespace nodes. Objects without the managed
    /// label are never observed and so never touched.
    pub fn periodic_resync(&mut self, nodes: Vec<PolicyNode>) {
        self.nodes = nodes.into_iter().map(|n| (n.name_any(), n)).collect();

        let declared = self
            .nodes
            .values()
            .flat_map(|node| self.unpacker.names(node))
            .collect::<BTreeSet<_>>();

        let mut orphans = self
            .live
            .iter()
            .filter(|(ns, _)| !self.is_unmanaged(ns))
            .flat_map(|(ns, names)| {
                names
                    .iter()
                    .map(move |name| ObjectRef::new::<U::Resource>(Some(ns.clone()), name.clone()))
            })
            .filter(|target| !declared.contains(target))
            .collect::<Vec<_>>();
        orphans.sort();
        for target in orphans {
            tracing::info!(%target, "Deleting undeclared object");
            self.queue.add(Action::Delete(target));
        }

        let mut nodes = self.nodes.values().collect::<Vec<_>>();
        nodes.sort_by_key(|n| n.name_any());
        for node in nodes {
            self.upsert_all(node);
        }
    }

    fn upsert_all(&self, node: &PolicyNode) {
        for resource in self.unpacker.upserts(node) {
            match Action::upsert(&resource) {
                Ok(action) => {
                    self.queue.add(action);
                }
                Err(error) => {
                    tracing::error!(node = %node.name_any(), %error, "Failed to serialize object")
                }
            }
        }
    }

    fn is_unmanaged(&self, namespace: &str) -> bool {
        self.nodes
            .get(namespace)
            .map(|n| n.spec.type_ == PolicyNodeType::UnmanagedNamespace)
            .unwrap_or(false)
    }
}

impl<U: Unpacker> IndexClusterResource<PolicyNode> for Syncer<U> {
    fn apply(&mut self, node: PolicyNode) {
        match self.nodes.get(&node.name_any()).cloned() {
            Some(old) if old.spec == node.spec => {
                self.nodes.insert(node.name_any(), node);
            }
            Some(old) => self.on_update(&old, node),
            None => self.on_create(node),
        }
    }

    fn delete(&mut self, name: String) {
        self.on_delete(&name);
    }

    fn reset(&mut self, nodes: Vec<PolicyNode>, _removed: ClusterRemoved) {
        self.periodic_resync(nodes);
    }
}

impl<U> IndexNamespacedResource<U::Resource> for Syncer<U>
where
    U: Unpacker,
    U::Resource: ResourceExt,
{
    fn apply(&mut self, resource: U::Resource) {
        let Some(namespace) = resource.namespace() else {
            return;
        };
        if !labels::is_managed(resource.meta()) {
            return;
        }
        self.live
            .entry(namespace)
            .or_default()
            .insert(resource.name_any());
    }

    fn delete(&mut self, namespace: String, name: String) {
        if let Some(names) = self.live.get_mut(&namespace) {
            names.remove(&name);
            if names.is_empty() {
                self.live.remove(&namespace);
            }
        }
    }

    fn reset(&mut self, resources: Vec<U::Resource>, _removed: NamespacedRemoved) {
        self.live.clear();
        for resource in resources {
            IndexNamespacedResource::apply(self, resource);
        }
    }
}

impl<U: Unpacker> SizedIndex<PolicyNode> for Syncer<U> {
    fn size(&self, _namespace: Option<&str>) -> usize {
        self.nodes.len()
    }
}

// === impl ResourceQuotaUnpacker ===

impl Unpacker for ResourceQuotaUnpacker {
    type Resource = ResourceQuota;

    fn upserts(&self, node: &PolicyNode) -> Vec<ResourceQuota> {
        if !node.spec.type_.is_managed_namespace() {
            return Vec::new();
        }
        let Some(hard) = node.spec.quota_hard() else {
            return Vec::new();
        };

        vec![ResourceQuota {
            metadata: ObjectMeta {
                name: Some(RESOURCE_QUOTA_NAME.to_string()),
                namespace: Some(node.name_any()),
                labels: Some(labels::managed()),
                ..Default::default()
            },
            spec: Some(ResourceQuotaSpec {
                hard: Some(hard.clone()),
                ..Default::default()
            }),
            status: None,
        }]
    }
}
