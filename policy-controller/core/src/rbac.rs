//! Flattening of inherited RBAC policy.
//!
//! Every `Namespace` node receives the roles and role bindings declared on it
//! and on each of its ancestors. A declaration on a node replaces a same-named
//! declaration inherited from above.

use crate::{aggregate::AggregatedNode, hierarchy::Import, node_name, Ancestry};
use hierarchy_controller_k8s_api::{labels, ObjectMeta, PolicyNode, Role, RoleBinding};
use std::collections::BTreeMap;

#[derive(Clone, Debug, Default)]
pub struct RbacAggregate {
    namespace: String,
    roles: BTreeMap<String, Role>,
    role_bindings: BTreeMap<String, RoleBinding>,
    latest: Option<Import>,
    token: Option<Import>,
}

/// The RBAC objects that should exist in a namespace.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Instances {
    pub roles: Vec<Role>,
    pub role_bindings: Vec<RoleBinding>,
}

/// Computes the RBAC objects for the node at the bottom of `ancestry`.
pub fn flatten(ancestry: &Ancestry) -> Instances {
    ancestry.aggregate(RbacAggregate::default)
}

// === impl RbacAggregate ===

impl AggregatedNode for RbacAggregate {
    type Output = Instances;

    fn aggregated(&self, node: &PolicyNode) -> Self {
        let mut next = self.clone();
        next.namespace = node_name(node);

        for role in &node.spec.roles {
            match role.metadata.name.as_ref() {
                Some(name) => {
                    next.roles.insert(name.clone(), role.clone());
                }
                None => tracing::warn!(node = %next.namespace, "Ignoring role without a name"),
            }
        }
        for binding in &node.spec.role_bindings {
            match binding.metadata.name.as_ref() {
                Some(name) => {
                    next.role_bindings.insert(name.clone(), binding.clone());
                }
                None => {
                    tracing::warn!(node = %next.namespace, "Ignoring role binding without a name")
                }
            }
        }

        next.latest = match (next.latest.take(), Import::timed(node)) {
            (Some(a), Some(b)) => Some(Import::latest(a, b)),
            (a, b) => a.or(b),
        };
        next.token = Import::untimed(node);
        next
    }

    fn generate(&self) -> Instances {
        let import = self.latest.as_ref().or(self.token.as_ref());
        Instances {
            roles: self
                .roles
                .values()
                .map(|role| Role {
                    metadata: self.metadata(&role.metadata, import),
                    ..role.clone()
                })
                .collect(),
            role_bindings: self
                .role_bindings
                .values()
                .map(|binding| RoleBinding {
                    metadata: self.metadata(&binding.metadata, import),
                    ..binding.clone()
                })
                .collect(),
        }
    }
}

impl RbacAggregate {
    /// Builds fresh metadata for a generated object, keeping only the declared
    /// name, labels and annotations.
    fn metadata(&self, declared: &ObjectMeta, import: Option<&Import>) -> ObjectMeta {
        let mut object_labels = declared.labels.clone().unwrap_or_default();
        object_labels.extend(labels::managed());

        let mut annotations = declared.annotations.clone().unwrap_or_default();
        if let Some(import) = import {
            annotations.insert(labels::IMPORT_TOKEN.to_string(), import.token.clone());
            if !import.time.is_empty() {
                annotations.insert(labels::IMPORT_TIME.to_string(), import.time.clone());
            }
        }

        ObjectMeta {
            name: declared.name.clone(),
            namespace: Some(self.namespace.clone()),
            labels: Some(object_labels),
            annotations: if annotations.is_empty() {
                None
            } else {
                Some(annotations)
            },
            ..Default::default()
        }
    }
}

// === impl Instances ===

impl Instances {
    pub fn is_empty(&self) -> bool {
        self.roles.is_empty() && self.role_bindings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{hierarchy::tests::mk_node, Tree};
    use hierarchy_controller_k8s_api::{
        api::rbac::v1::{PolicyRule, RoleRef, Subject},
        PolicyNodeType::{AbstractNamespace, Namespace},
    };
    use maplit::btreemap;
    use pretty_assertions::assert_eq;

    fn mk_role(name: &str, verbs: &[&str]) -> Role {
        Role {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                // Server-populated fields are never copied.
                resource_version: Some("42".to_string()),
                ..Default::default()
            },
            rules: Some(vec![PolicyRule {
                api_groups: Some(vec![String::new()]),
                resources: Some(vec!["pods".to_string()]),
                verbs: verbs.iter().map(|v| v.to_string()).collect(),
                ..Default::default()
            }]),
        }
    }

    fn mk_binding(name: &str, role: &str, user: &str) -> RoleBinding {
        RoleBinding {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "Role".to_string(),
                name: role.to_string(),
            },
            subjects: Some(vec![Subject {
                kind: "User".to_string(),
                name: user.to_string(),
                ..Default::default()
            }]),
        }
    }

    fn mk_tree() -> Tree {
        let mut root = mk_node("root", None, AbstractNamespace);
        root.spec.roles = vec![mk_role("reader", &["get"]), mk_role("admin", &["*"])];
        root.spec.role_bindings = vec![mk_binding("admins", "admin", "alice")];
        root.spec.import_token = "t1".to_string();

        let mut eng = mk_node("eng", Some("root"), AbstractNamespace);
        eng.spec.roles = vec![mk_role("reader", &["get", "list"])];

        let mut frontend = mk_node("frontend", Some("eng"), Namespace);
        frontend.spec.role_bindings = vec![mk_binding("readers", "reader", "bob")];

        [root, eng, frontend, mk_node("backend", Some("eng"), Namespace)]
            .into_iter()
            .collect()
    }

    #[test]
    fn inherits_from_all_ancestors() {
        let tree = mk_tree();
        let instances = flatten(&tree.ancestry("frontend").unwrap());

        let roles = instances
            .roles
            .iter()
            .map(|r| r.metadata.name.clone().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(roles, vec!["admin", "reader"]);

        let bindings = instances
            .role_bindings
            .iter()
            .map(|b| b.metadata.name.clone().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(bindings, vec!["admins", "readers"]);
    }

    #[test]
    fn descendants_override_same_named_declarations() {
        let tree = mk_tree();
        let instances = flatten(&tree.ancestry("backend").unwrap());
        let reader = instances
            .roles
            .iter()
            .find(|r| r.metadata.name.as_deref() == Some("reader"))
            .unwrap();
        assert_eq!(
            reader.rules.as_ref().unwrap()[0].verbs,
            vec!["get".to_string(), "list".to_string()]
        );

        let instances = flatten(&tree.ancestry("root").unwrap());
        let reader = instances
            .roles
            .iter()
            .find(|r| r.metadata.name.as_deref() == Some("reader"))
            .unwrap();
        assert_eq!(reader.rules.as_ref().unwrap()[0].verbs, vec!["get".to_string()]);
    }

    #[test]
    fn generates_managed_metadata() {
        let tree = mk_tree();
        let instances = flatten(&tree.ancestry("backend").unwrap());
        for meta in instances
            .roles
            .iter()
            .map(|r| &r.metadata)
            .chain(instances.role_bindings.iter().map(|b| &b.metadata))
        {
            assert_eq!(meta.namespace.as_deref(), Some("backend"));
            assert!(labels::is_managed(meta));
            assert_eq!(meta.resource_version, None);
            // No node along the ancestry carries an import time, and backend
            // has no token of its own.
            assert_eq!(meta.annotations, None);
        }
    }

    #[test]
    fn annotates_latest_import() {
        let mut tree = mk_tree();
        let mut eng = (**tree.get("eng").unwrap()).clone();
        eng.spec.import_token = "t2".to_string();
        eng.spec.import_time =
            Some(serde_json::from_value(serde_json::json!("2024-03-01T12:00:00Z")).unwrap());
        tree.insert(eng);

        let instances = flatten(&tree.ancestry("frontend").unwrap());
        assert_eq!(
            instances.roles[0].metadata.annotations,
            Some(btreemap! {
                labels::IMPORT_TOKEN.to_string() => "t2".to_string(),
                labels::IMPORT_TIME.to_string() => "2024-03-01T12:00:00Z".to_string(),
            })
        );
    }

    #[test]
    fn nodes_without_declarations_are_empty() {
        let tree = [
            mk_node("root", None, AbstractNamespace),
            mk_node("leaf", Some("root"), Namespace),
        ]
        .into_iter()
        .collect::<Tree>();
        assert!(flatten(&tree.ancestry("leaf").unwrap()).is_empty());
    }
}
