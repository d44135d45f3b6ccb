//! Flattens inherited RBAC policy into each managed namespace.
//!
//! Unlike objects that a node declares for itself, a namespace's roles and
//! role bindings depend on every node above it. A change to one node is
//! therefore evaluated over the node's whole subtree: the subtree is flattened
//! before and after the change is applied to the tree, and the difference is
//! reconciled namespace by namespace.

use crate::metrics::SizedIndex;
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use hierarchy_controller_core::{rbac, Instances, Tree};
use hierarchy_controller_k8s_actions::{Action, ObjectRef, Queue};
use hierarchy_controller_k8s_api::{
    labels, PolicyNode, PolicyNodeType, Resource, ResourceExt, Role, RoleBinding,
};
use kubert::index::{ClusterRemoved, IndexClusterResource, IndexNamespacedResource, NamespacedRemoved};
use parking_lot::RwLock;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};
use tokio::time;

pub type SharedRbacSyncer = Arc<RwLock<RbacSyncer>>;

pub struct RbacSyncer {
    tree: Tree,
    live_roles: Live,
    live_role_bindings: Live,
    queue: Queue,
}

/// The flattened policy of each namespace in a subtree.
type Evaluation = BTreeMap<String, Instances>;

/// Managed objects of a single kind observed on the cluster, by namespace.
#[derive(Debug, Default)]
struct Live(HashMap<String, HashSet<String>>);

// === impl RbacSyncer ===

impl RbacSyncer {
    pub fn new(queue: Queue) -> Self {
        Self {
            tree: Tree::default(),
            live_roles: Live::default(),
            live_role_bindings: Live::default(),
            queue,
        }
    }

    pub fn shared(queue: Queue) -> SharedRbacSyncer {
        Arc::new(RwLock::new(Self::new(queue)))
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// Runs a full resync on a fixed interval.
    ///
    /// Each pass replays the nodes this syncer already holds, so it repairs
    /// drift in the live objects it mirrors. PolicyNode events missed by the
    /// watch are recovered when the watch restarts and `reset` is called.
    pub async fn run(syncer: SharedRbacSyncer, period: time::Duration) {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        // The first tick completes immediately, before the index is populated.
        interval.tick().await;
        loop {
            interval.tick().await;
            let nodes = syncer
                .read()
                .tree
                .nodes()
                .map(|n| (**n).clone())
                .collect::<Vec<_>>();
            tracing::debug!(nodes = nodes.len(), "Resyncing RBAC");
            syncer.write().periodic_resync(nodes);
        }
    }

    pub fn on_create(&mut self, node: PolicyNode) {
        let name = node.name_any();
        self.tree.insert(node);
        let evaluation = self.evaluate(&name);
        self.reconcile(&Evaluation::default(), &evaluation);
    }

    /// Re-evaluates the node's subtree as it was before and after the update,
    /// deleting objects that are no longer generated and applying the rest.
    pub fn on_update(&mut self, old: &PolicyNode, new: PolicyNode) {
        let before = self.evaluate(&old.name_any());
        let name = new.name_any();
        self.tree.insert(new);
        let after = self.evaluate(&name);
        self.reconcile(&before, &after);
    }

    pub fn on_delete(&mut self, name: &str) {
        let before = self.evaluate(name);
        self.tree.remove(name);
        self.reconcile(&before, &Evaluation::default());
    }

    /// Rebuilds the tree from `nodes` and converges every managed namespace
    /// to its flattened policy.
    ///
    /// Managed objects in namespaces that are no longer declared are deleted.
    /// Unmanaged namespaces, and namespaces whose ancestry cannot be
    /// resolved, are left untouched.
    pub fn periodic_resync(&mut self, nodes: Vec<PolicyNode>) {
        self.tree = nodes.into_iter().collect();

        let mut desired = Evaluation::new();
        let mut reached = HashSet::new();
        for root in self.tree.roots() {
            match self.tree.subtree(root) {
                Ok(names) => reached.extend(names),
                Err(error) => tracing::warn!(%root, %error, "Failed to walk policy tree"),
            }
        }
        let mut reached = reached.into_iter().collect::<Vec<_>>();
        reached.sort();
        for name in &reached {
            desired.extend(self.flatten(name));
        }

        let skip = self
            .tree
            .nodes()
            .filter_map(|node| {
                let name = node.name_any();
                match node.spec.type_ {
                    PolicyNodeType::UnmanagedNamespace => Some(name),
                    PolicyNodeType::Namespace if !desired.contains_key(&name) => {
                        tracing::warn!(namespace = %name, "Namespace is not reachable from a root; skipping");
                        Some(name)
                    }
                    _ => None,
                }
            })
            .collect::<HashSet<_>>();

        let roles = self
            .live_roles
            .iter()
            .map(|(ns, name)| ObjectRef::new::<Role>(Some(ns.to_string()), name));
        let bindings = self
            .live_role_bindings
            .iter()
            .map(|(ns, name)| ObjectRef::new::<RoleBinding>(Some(ns.to_string()), name));
        let mut deletes = roles
            .chain(bindings)
            .filter(|target| {
                let ns = target.namespace.as_deref().unwrap_or_default();
                !skip.contains(ns) && !desired.get(ns).is_some_and(|i| generates(i, target))
            })
            .collect::<Vec<_>>();
        deletes.sort();
        for target in deletes {
            tracing::info!(%target, "Deleting undeclared object");
            self.queue.add(Action::Delete(target));
        }

        for instances in desired.values() {
            self.upsert(instances);
        }
    }

    /// Flattens policy for every managed namespace in `name`'s subtree.
    fn evaluate(&self, name: &str) -> Evaluation {
        match self.tree.subtree(name) {
            Ok(names) => names.iter().flat_map(|n| self.flatten(n)).collect(),
            Err(error) if error.is_not_found() => Evaluation::default(),
            Err(error) => {
                tracing::warn!(%name, %error, "Failed to walk policy tree");
                Evaluation::default()
            }
        }
    }

    fn flatten(&self, name: &str) -> Option<(String, Instances)> {
        let node = self.tree.get(name)?;
        if !node.spec.type_.is_managed_namespace() {
            return None;
        }
        match self.tree.ancestry(name) {
            Ok(ancestry) => Some((name.to_string(), rbac::flatten(&ancestry))),
            Err(error) => {
                tracing::warn!(namespace = %name, %error, "Failed to resolve ancestry");
                None
            }
        }
    }

    /// Deletes objects in `before` that are absent from `after`, then upserts
    /// everything in `after`.
    fn reconcile(&self, before: &Evaluation, after: &Evaluation) {
        let mut deletes = BTreeSet::new();
        for (ns, old) in before {
            let new = after.get(ns);
            for target in targets(old) {
                if !new.is_some_and(|i| generates(i, &target)) {
                    deletes.insert(target);
                }
            }
        }
        for target in deletes {
            self.queue.add(Action::Delete(target));
        }

        for instances in after.values() {
            self.upsert(instances);
        }
    }

    fn upsert(&self, instances: &Instances) {
        let roles = instances.roles.iter().map(Action::upsert);
        let bindings = instances.role_bindings.iter().map(Action::upsert);
        for action in roles.chain(bindings) {
            match action {
                Ok(action) => {
                    self.queue.add(action);
                }
                Err(error) => tracing::error!(%error, "Failed to serialize RBAC object"),
            }
        }
    }
}

fn targets(instances: &Instances) -> impl Iterator<Item = ObjectRef> + '_ {
    let roles = instances.roles.iter().map(ObjectRef::of);
    let bindings = instances.role_bindings.iter().map(ObjectRef::of);
    roles.chain(bindings)
}

fn generates(instances: &Instances, target: &ObjectRef) -> bool {
    targets(instances).any(|t| t == *target)
}

impl IndexClusterResource<PolicyNode> for RbacSyncer {
    fn apply(&mut self, node: PolicyNode) {
        match self.tree.get(&node.name_any()).cloned() {
            Some(old) if old.spec == node.spec => {
                self.tree.insert(node);
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

impl IndexNamespacedResource<Role> for RbacSyncer {
    fn apply(&mut self, role: Role) {
        self.live_roles.apply(&role);
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.live_roles.delete(&namespace, &name);
    }

    fn reset(&mut self, roles: Vec<Role>, _removed: NamespacedRemoved) {
        self.live_roles = Live::default();
        for role in &roles {
            self.live_roles.apply(role);
        }
    }
}

impl IndexNamespacedResource<RoleBinding> for RbacSyncer {
    fn apply(&mut self, binding: RoleBinding) {
        self.live_role_bindings.apply(&binding);
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.live_role_bindings.delete(&namespace, &name);
    }

    fn reset(&mut self, bindings: Vec<RoleBinding>, _removed: NamespacedRemoved) {
        self.live_role_bindings = Live::default();
        for binding in &bindings {
            self.live_role_bindings.apply(binding);
        }
    }
}

impl SizedIndex<PolicyNode> for RbacSyncer {
    fn size(&self, _namespace: Option<&str>) -> usize {
        self.tree.len()
    }
}

impl SizedIndex<Role> for RbacSyncer {
    fn size(&self, namespace: Option<&str>) -> usize {
        self.live_roles.size(namespace)
    }
}

impl SizedIndex<RoleBinding> for RbacSyncer {
    fn size(&self, namespace: Option<&str>) -> usize {
        self.live_role_bindings.size(namespace)
    }
}

// === impl Live ===

impl Live {
    fn apply<K: Resource>(&mut self, resource: &K) {
        let Some(namespace) = resource.meta().namespace.clone() else {
            return;
        };
        if !labels::is_managed(resource.meta()) {
            return;
        }
        self.0
            .entry(namespace)
            .or_default()
            .insert(resource.name_any());
    }

    fn delete(&mut self, namespace: &str, name: &str) {
        if let Some(names) = self.0.get_mut(namespace) {
            names.remove(name);
            if names.is_empty() {
                self.0.remove(namespace);
            }
        }
    }

    fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .flat_map(|(ns, names)| names.iter().map(move |n| (ns.as_str(), n.as_str())))
    }

    fn size(&self, namespace: Option<&str>) -> usize {
        match namespace {
            Some(ns) => self.0.get(ns).map(|s| s.len()).unwrap_or(0),
            None => self.0.values().map(|s| s.len()).sum(),
        }
    }
}
