use super::Tree;
use crate::{node_name, ConsistencyError, Error};
use hierarchy_controller_k8s_api::PolicyNode;

/// Checks proposed tree mutations before they are admitted.
///
/// A validator holds its own copy of the tree: mutations are applied to the
/// copy and [`Validator::validate`] then checks the resulting tree as a whole.
#[derive(Clone, Debug)]
pub struct Validator {
    tree: Tree,
    allow_multiple_roots: bool,
}

impl Validator {
    pub fn new(tree: Tree, allow_multiple_roots: bool) -> Self {
        Self {
            tree,
            allow_multiple_roots,
        }
    }

    pub fn add(&mut self, node: PolicyNode) -> Result<(), Error> {
        let name = node_name(&node);
        if self.tree.contains(&name) {
            return Err(ConsistencyError::AlreadyExists(name).into());
        }
        self.tree.insert(node);
        Ok(())
    }

    pub fn update(&mut self, node: PolicyNode) -> Result<(), Error> {
        let name = node_name(&node);
        if !self.tree.contains(&name) {
            return Err(Error::NotFound(name));
        }
        self.tree.insert(node);
        Ok(())
    }

    /// Removes a leaf node. Nodes that still have children cannot be removed.
    pub fn remove(&mut self, name: &str) -> Result<(), Error> {
        if !self.tree.contains(name) {
            return Err(Error::NotFound(name.to_string()));
        }

        let children = self.tree.children(name).map(String::from).collect::<Vec<_>>();
        if !children.is_empty() {
            return Err(ConsistencyError::Orphans {
                node: name.to_string(),
                children,
            }
            .into());
        }

        self.tree.remove(name);
        Ok(())
    }

    pub fn validate(&self) -> Result<(), Error> {
        self.tree.validate(self.allow_multiple_roots)
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }
}
