//! The declared policy tree.
//!
//! Nodes are held in an arena keyed by name; a node refers to its parent by
//! name. A parent -> children index is maintained alongside the arena so that
//! subtrees can be walked top-down. Every traversal tracks the names it has
//! visited, so malformed data produces a [`ConsistencyError`] rather than an
//! unbounded walk.

use crate::{node_name, ConsistencyError, Error};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use hierarchy_controller_k8s_api::PolicyNode;
use std::{collections::BTreeSet, sync::Arc};

mod validator;


pub use self::validator::Validator;

#[derive(Clone, Debug, Default)]
pub struct Tree {
    nodes: HashMap<String, Arc<PolicyNode>>,
    children: HashMap<String, BTreeSet<String>>,
}

/// The path from a node up to its root: `[node, parent, ..., root]`.
///
/// An ancestry is computed from the tree's current state on every call and is
/// never cached.
#[derive(Clone, Debug)]
pub struct Ancestry(Vec<Arc<PolicyNode>>);

/// The provenance of the most recent import along an ancestry.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Import {
    pub token: String,
    /// The import time, formatted as RFC 3339.
    pub time: String,
}

// === impl Tree ===

impl Tree {
    /// Inserts or replaces a node, returning the node it replaced.
    pub fn insert(&mut self, node: PolicyNode) -> Option<Arc<PolicyNode>> {
        let name = node_name(&node);
        let prior = self.remove(&name);
        if let Some(parent) = node.spec.parent() {
            self.children
                .entry(parent.to_string())
                .or_default()
                .insert(name.clone());
        }
        self.nodes.insert(name, Arc::new(node));
        prior
    }

    /// Removes a node, returning it if it existed. The node's children remain
    /// in the tree.
    pub fn remove(&mut self, name: &str) -> Option<Arc<PolicyNode>> {
        let node = self.nodes.remove(name)?;
        if let Some(parent) = node.spec.parent() {
            if let Some(siblings) = self.children.get_mut(parent) {
                siblings.remove(name);
                if siblings.is_empty() {
                    self.children.remove(parent);
                }
            }
        }
        Some(node)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<PolicyNode>> {
        self.nodes.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Arc<PolicyNode>> {
        self.nodes.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    /// Returns the names of a node's direct children, in sorted order.
    pub fn children(&self, name: &str) -> impl Iterator<Item = &str> {
        self.children
            .get(name)
            .into_iter()
            .flat_map(|c| c.iter().map(String::as_str))
    }

    /// Returns the names of all nodes without a parent, in sorted order.
    pub fn roots(&self) -> Vec<&str> {
        let mut roots = self
            .nodes
            .iter()
            .filter(|(_, node)| node.spec.parent().is_none())
            .map(|(name, _)| name.as_str())
            .collect::<Vec<_>>();
        roots.sort_unstable();
        roots
    }

    /// Resolves the path from `name` to its root.
    ///
    /// Fails if the node does not exist, if a parent does not exist or is not
    /// an `AbstractNamespace`, or if the parent references form a cycle.
    pub fn ancestry(&self, name: &str) -> Result<Ancestry, Error> {
        let mut node = self
            .nodes
            .get(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;

        let mut path = Vec::new();
        let mut visited = HashSet::new();
        loop {
            let current = node_name(node);
            visited.insert(current.clone());
            path.push(node.clone());

            let parent = match node.spec.parent() {
                Some(parent) => parent,
                None => return Ok(Ancestry(path)),
            };

            if visited.contains(parent) {
                let start = path
                    .iter()
                    .position(|n| node_name(n) == parent)
                    .unwrap_or(0);
                let mut cycle = path[start..].iter().map(|n| node_name(n)).collect::<Vec<_>>();
                cycle.push(parent.to_string());
                return Err(ConsistencyError::Cycle {
                    repeated: parent.to_string(),
                    cycle,
                }
                .into());
            }

            node = match self.nodes.get(parent) {
                Some(next) => next,
                None => {
                    return Err(ConsistencyError::ParentNotFound {
                        node: current,
                        parent: parent.to_string(),
                        ancestry: names(&path),
                    }
                    .into())
                }
            };

            if !node.spec.type_.is_abstract() {
                return Err(ConsistencyError::InvalidParent {
                    node: current,
                    parent: parent.to_string(),
                    parent_type: node.spec.type_,
                    ancestry: names(&path),
                }
                .into());
            }
        }
    }

    /// Lists `name` and all of its descendants, depth-first with `name`
    /// first.
    pub fn subtree(&self, name: &str) -> Result<Vec<String>, Error> {
        if !self.nodes.contains_key(name) {
            return Err(Error::NotFound(name.to_string()));
        }

        // No path can be longer than the number of nodes.
        let max_depth = self.nodes.len();
        let mut visited = HashSet::new();
        let mut names = Vec::new();
        let mut stack = vec![(name.to_string(), 0usize)];
        while let Some((current, depth)) = stack.pop() {
            if depth > max_depth || !visited.insert(current.clone()) {
                let mut cycle = vec![name.to_string()];
                if current != name {
                    cycle.push(current.clone());
                }
                cycle.push(name.to_string());
                return Err(ConsistencyError::Cycle {
                    repeated: current,
                    cycle,
                }
                .into());
            }

            if let Some(children) = self.children.get(&current) {
                // Push in reverse so that children are visited in sorted order.
                for child in children.iter().rev() {
                    stack.push((child.clone(), depth + 1));
                }
            }
            names.push(current);
        }

        Ok(names)
    }

    /// Checks every node in the tree.
    pub fn validate(&self, allow_multiple_roots: bool) -> Result<(), Error> {
        let roots = self.roots();
        if !allow_multiple_roots && roots.len() > 1 {
            return Err(ConsistencyError::MultipleRoots {
                roots: roots.into_iter().map(Into::into).collect(),
            }
            .into());
        }

        let mut names = self.names().collect::<Vec<_>>();
        names.sort_unstable();
        for name in names {
            self.ancestry(name)?;
        }
        Ok(())
    }
}

impl FromIterator<PolicyNode> for Tree {
    fn from_iter<T: IntoIterator<Item = PolicyNode>>(iter: T) -> Self {
        let mut tree = Self::default();
        for node in iter {
            tree.insert(node);
        }
        tree
    }
}

// === impl Ancestry ===

impl Ancestry {
    /// The node whose ancestry this is.
    pub fn node(&self) -> &PolicyNode {
        &self.0[0]
    }

    pub fn root(&self) -> &PolicyNode {
        &self.0[self.0.len() - 1]
    }

    /// Iterates from the node up to the root.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &PolicyNode> {
        self.0.iter().map(|n| &**n)
    }

    pub fn names(&self) -> Vec<String> {
        names(&self.0)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the most recent import among all nodes in the ancestry.
    ///
    /// Nodes that were never imported are ignored; if no node carries an
    /// import time, the node's own token is used.
    pub fn import(&self) -> Option<Import> {
        self.iter()
            .filter_map(Import::timed)
            .reduce(Import::latest)
            .or_else(|| Import::untimed(self.node()))
    }
}

// === impl Import ===

impl Import {
    /// The import recorded on `node`, if it carries an import time.
    pub(crate) fn timed(node: &PolicyNode) -> Option<Self> {
        let time = node.spec.import_time.as_ref()?;
        let time = serde_json::to_value(time).ok()?.as_str()?.to_string();
        Some(Self {
            token: node.spec.import_token.clone(),
            time,
        })
    }

    /// The token recorded on `node` without a time.
    pub(crate) fn untimed(node: &PolicyNode) -> Option<Self> {
        let token = &node.spec.import_token;
        if token.is_empty() {
            return None;
        }
        Some(Self {
            token: token.clone(),
            time: String::new(),
        })
    }

    /// Returns the later of two imports, preferring `b` on ties.
    pub(crate) fn latest(a: Self, b: Self) -> Self {
        // RFC 3339 timestamps in UTC sort lexicographically.
        if a.time > b.time {
            a
        } else {
            b
        }
    }
}

fn names(path: &[Arc<PolicyNode>]) -> Vec<String> {
    path.iter().map(|n| node_name(n)).collect()
}
