use super::*;
use crate::{hierarchy::tests::mk_node, Tree};
use hierarchy_controller_k8s_api::{
    PolicyNodeType::{self, AbstractNamespace, Namespace},
    QuotaStatus, ResourceQuotaSpec,
};
use maplit::btreemap;
use pretty_assertions::assert_eq;
use rstest::rstest;

fn mk_quota_node(
    name: &str,
    parent: Option<&str>,
    type_: PolicyNodeType,
    hard: &[(&str, &str)],
) -> PolicyNode {
    let mut node = mk_node(name, parent, type_);
    if !hard.is_empty() {
        node.spec.resource_quota = Some(ResourceQuotaSpec {
            hard: Some(
                hard.iter()
                    .map(|(r, q)| (r.to_string(), k8s::Quantity(q.to_string())))
                    .collect(),
            ),
            ..Default::default()
        });
    }
    node
}

fn list(items: &[(&str, i64)]) -> ResourceList {
    items
        .iter()
        .map(|(r, q)| (r.to_string(), Quantity::from_units(*q)))
        .collect()
}

/// kittiesandponies (hay: 10, milk: 5)
/// ├── kitties (hay: 5), using hay: 2
/// └── ponies
fn kitties() -> Vec<PolicyNode> {
    vec![
        mk_quota_node(
            "kittiesandponies",
            None,
            AbstractNamespace,
            &[("hay", "10"), ("milk", "5")],
        ),
        mk_quota_node("kitties", Some("kittiesandponies"), Namespace, &[("hay", "5")]),
        mk_quota_node("ponies", Some("kittiesandponies"), Namespace, &[]),
    ]
}

fn kitties_usage() -> Vec<(String, ResourceList)> {
    vec![("kitties".to_string(), list(&[("hay", 2)]))]
}

#[test]
fn rolls_up_leaf_usage() {
    let nodes = kitties();
    let cache = HierarchicalQuotaCache::new(&nodes, kitties_usage());

    assert_eq!(cache.node("kitties").unwrap().used, list(&[("hay", 2)]));
    assert_eq!(cache.node("ponies").unwrap().used, ResourceList::default());

    let root = cache.node("kittiesandponies").unwrap();
    assert_eq!(root.used, list(&[("hay", 2)]));
    assert_eq!(root.hard, list(&[("hay", 10), ("milk", 5)]));
    assert!(root.is_abstract);
    assert_eq!(root.parent, None);
}

#[test]
fn checks_against_parent_aggregate() {
    let nodes = kitties();
    let cache = HierarchicalQuotaCache::new(&nodes, kitties_usage());

    // The leaf's own limit of 5 is enforced by its ResourceQuota, not here;
    // the parent's aggregate is 2 + 7 <= 10.
    assert_eq!(cache.admit("kitties", &list(&[("hay", 7)])), Ok(()));
}

#[test]
fn rejects_ancestor_violations() {
    let nodes = kitties();
    let cache = HierarchicalQuotaCache::new(&nodes, kitties_usage());

    let err = cache.admit("kitties", &list(&[("milk", 7)])).unwrap_err();
    assert_eq!(
        err,
        QuotaViolation {
            resource: "milk".to_string(),
            namespace: "kittiesandponies".to_string(),
            requested: Quantity::from_units(7),
            used: Quantity::ZERO,
            limit: Quantity::from_units(5),
        }
    );
    let msg = err.to_string();
    assert!(msg.contains("milk"), "{msg}");
    assert!(msg.contains("kittiesandponies"), "{msg}");
}

#[test]
fn sibling_usage_counts_against_shared_ancestors() {
    let nodes = kitties();
    let usage = vec![
        ("kitties".to_string(), list(&[("hay", 2)])),
        ("ponies".to_string(), list(&[("hay", 6)])),
    ];
    let cache = HierarchicalQuotaCache::new(&nodes, usage);

    assert_eq!(cache.admit("ponies", &list(&[("hay", 2)])), Ok(()));
    assert!(cache.admit("ponies", &list(&[("hay", 3)])).is_err());
}

#[test]
fn ungoverned_namespaces_are_admitted() {
    let nodes = kitties();
    let usage = vec![("elsewhere".to_string(), list(&[("hay", 100)]))];
    let cache = HierarchicalQuotaCache::new(&nodes, usage);

    assert!(cache.node("elsewhere").is_none());
    assert_eq!(cache.node("kittiesandponies").unwrap().used, ResourceList::default());
    assert_eq!(cache.admit("elsewhere", &list(&[("hay", 1000)])), Ok(()));
    // Roots have no ancestors to check.
    assert_eq!(cache.admit("kittiesandponies", &list(&[("hay", 1000)])), Ok(()));
}

#[test]
fn missing_ancestors_are_not_governed() {
    let mut nodes = kitties();
    nodes.push(mk_quota_node("stray", Some("gone"), Namespace, &[]));
    let cache = HierarchicalQuotaCache::new(&nodes, Vec::new());
    assert_eq!(cache.admit("stray", &list(&[("hay", 1000)])), Ok(()));
}

#[test]
fn rollup_terminates_on_cycles() {
    let nodes = vec![
        mk_quota_node("a", Some("b"), AbstractNamespace, &[("hay", "1")]),
        mk_quota_node("b", Some("a"), AbstractNamespace, &[]),
    ];
    let cache = HierarchicalQuotaCache::new(&nodes, vec![("a".to_string(), list(&[("hay", 1)]))]);
    assert_eq!(cache.node("b").unwrap().used, list(&[("hay", 1)]));
    assert!(cache.admit("b", &list(&[("hay", 1)])).is_err());
}

/// root (cpu: 10)
/// └── org (cpu: 6)
///     └── team (cpu: 4)
///         └── leaf, using cpu: 1
fn deep() -> (Vec<PolicyNode>, Vec<(String, ResourceList)>) {
    let nodes = vec![
        mk_quota_node("root", None, AbstractNamespace, &[("cpu", "10")]),
        mk_quota_node("org", Some("root"), AbstractNamespace, &[("cpu", "6")]),
        mk_quota_node("team", Some("org"), AbstractNamespace, &[("cpu", "4")]),
        mk_quota_node("leaf", Some("team"), Namespace, &[]),
    ];
    (nodes, vec![("leaf".to_string(), list(&[("cpu", 1)]))])
}

/// Each level is checked with every other level's limit relaxed, so that
/// each boundary is exercised in isolation.
#[rstest]
#[case("team", 4)]
#[case("org", 6)]
#[case("root", 10)]
fn admits_up_to_each_limit(#[case] level: &str, #[case] limit: i64) {
    let (mut nodes, usage) = deep();
    for node in nodes.iter_mut() {
        let name = crate::node_name(node);
        if name != level && node.spec.resource_quota.is_some() {
            let parent = node.spec.parent().map(String::from);
            *node = mk_quota_node(
                &name,
                parent.as_deref(),
                node.spec.type_,
                &[("cpu", "1000")],
            );
        }
    }
    let cache = HierarchicalQuotaCache::new(&nodes, usage);

    let remaining = limit - 1;
    assert_eq!(cache.admit("leaf", &list(&[("cpu", remaining)])), Ok(()));

    let err = cache
        .admit("leaf", &list(&[("cpu", remaining + 1)]))
        .unwrap_err();
    assert_eq!(err.namespace, level);
    assert_eq!(err.limit, Quantity::from_units(limit));
    assert_eq!(err.used, Quantity::from_units(1));
}

#[test]
fn admits_fractional_quantities_at_the_limit() {
    let nodes = vec![
        mk_quota_node("root", None, AbstractNamespace, &[("cpu", "1500m")]),
        mk_quota_node("leaf", Some("root"), Namespace, &[]),
    ];
    let usage = vec![(
        "leaf".to_string(),
        ResourceList::from(btreemap! { "cpu".to_string() => Quantity::from_millis(500) }),
    )];
    let cache = HierarchicalQuotaCache::new(&nodes, usage);

    let at = ResourceList::from(btreemap! { "cpu".to_string() => Quantity::from_units(1) });
    assert_eq!(cache.admit("leaf", &at), Ok(()));

    let over = ResourceList::from(btreemap! { "cpu".to_string() => Quantity::from_millis(1001) });
    assert!(cache.admit("leaf", &over).is_err());
}

#[test]
fn unlisted_resources_are_unlimited() {
    let nodes = kitties();
    let cache = HierarchicalQuotaCache::new(&nodes, kitties_usage());
    assert_eq!(cache.admit("kitties", &list(&[("oats", 1_000_000)])), Ok(()));
}

#[test]
fn update_leaf_propagates_deltas() {
    let tree = kitties().into_iter().collect::<Tree>();
    let mut quota = HierarchicalQuota::new(tree, kitties_usage());

    let changed = quota
        .update_leaf("ponies", list(&[("hay", 3)]))
        .unwrap();
    assert_eq!(changed, vec!["ponies", "kittiesandponies"]);
    assert_eq!(quota.node("kittiesandponies").unwrap().used, list(&[("hay", 5)]));

    let changed = quota
        .update_leaf("kitties", list(&[("hay", 1), ("milk", 1)]))
        .unwrap();
    assert_eq!(changed, vec!["kitties", "kittiesandponies"]);
    assert_eq!(
        quota.node("kittiesandponies").unwrap().used,
        list(&[("hay", 4), ("milk", 1)])
    );

    // Unchanged usage changes nothing.
    assert!(quota
        .update_leaf("kitties", list(&[("hay", 1), ("milk", 1)]))
        .unwrap()
        .is_empty());

    // Removing usage subtracts it from the ancestors.
    quota.update_leaf("kitties", ResourceList::default()).unwrap();
    assert_eq!(
        quota.node("kittiesandponies").unwrap().used,
        list(&[("hay", 3), ("milk", 0)])
    );

    assert!(quota
        .update_leaf("elsewhere", list(&[("hay", 1)]))
        .unwrap_err()
        .is_not_found());
}

#[test]
fn update_leaf_matches_full_rebuild() {
    let nodes = kitties();
    let mut quota = HierarchicalQuota::new(nodes.iter().cloned().collect(), kitties_usage());
    quota.update_leaf("ponies", list(&[("hay", 4)])).unwrap();
    quota.update_leaf("kitties", list(&[("hay", 3)])).unwrap();

    let rebuilt = HierarchicalQuotaCache::new(
        &nodes,
        vec![
            ("kitties".to_string(), list(&[("hay", 3)])),
            ("ponies".to_string(), list(&[("hay", 4)])),
        ],
    );
    for name in ["kittiesandponies", "kitties", "ponies"] {
        assert_eq!(quota.node(name), rebuilt.node(name), "{name}");
    }

    assert!(quota.admit("ponies", &list(&[("hay", 3)])).is_ok());
    assert!(quota.admit("ponies", &list(&[("hay", 4)])).is_err());
}

#[test]
fn status_reports_effective_limits() {
    let tree = kitties().into_iter().collect::<Tree>();
    let quota = HierarchicalQuota::new(tree, kitties_usage());

    assert_eq!(
        quota.status("kitties").unwrap(),
        QuotaStatus {
            hard: btreemap! {
                "hay".to_string() => k8s::Quantity("5".to_string()),
                "milk".to_string() => k8s::Quantity("5".to_string()),
            },
            used: btreemap! { "hay".to_string() => k8s::Quantity("2".to_string()) },
        }
    );
    assert_eq!(
        quota.status("ponies").unwrap().hard,
        btreemap! {
            "hay".to_string() => k8s::Quantity("10".to_string()),
            "milk".to_string() => k8s::Quantity("5".to_string()),
        }
    );
    assert!(quota.status("elsewhere").unwrap_err().is_not_found());
}

#[test]
fn effective_limits_take_the_minimum() {
    let tree = [
        mk_quota_node("root", None, AbstractNamespace, &[("cpu", "2"), ("memory", "1Gi")]),
        mk_quota_node("mid", Some("root"), AbstractNamespace, &[("cpu", "4")]),
        mk_quota_node("leaf", Some("mid"), Namespace, &[("memory", "512Mi"), ("pods", "3")]),
    ]
    .into_iter()
    .collect::<Tree>();

    let limits = tree
        .ancestry("leaf")
        .unwrap()
        .aggregate(EffectiveLimits::default);
    assert_eq!(
        limits.to_k8s(),
        btreemap! {
            "cpu".to_string() => k8s::Quantity("2".to_string()),
            "memory".to_string() => k8s::Quantity("536870912".to_string()),
            "pods".to_string() => k8s::Quantity("3".to_string()),
        }
    );
}

#[test]
fn resource_list_arithmetic() {
    let mut a = list(&[("cpu", 2), ("pods", 1)]);
    a.add(&list(&[("cpu", 1), ("memory", 5)]));
    assert_eq!(a, list(&[("cpu", 3), ("memory", 5), ("pods", 1)]));

    a.sub(&list(&[("pods", 1)]));
    assert_eq!(a.get("pods"), Some(Quantity::ZERO));

    let delta = list(&[("cpu", 1)]).delta(&list(&[("cpu", 3), ("memory", 2)]));
    assert_eq!(delta, list(&[("cpu", -2), ("memory", -2)]));
    assert!(!delta.is_zero());
    assert!(list(&[("cpu", 0)]).is_zero());

    assert!(ResourceList::try_from_k8s(&btreemap! {
        "cpu".to_string() => k8s::Quantity("lots".to_string()),
    })
    .is_err());
}
