use super::*;
use crate::QuotaIndex;
use hierarchy_controller_core::ResourceList;
use hierarchy_controller_k8s_actions::Payload;
use hierarchy_controller_k8s_api::{
    PolicyNodeStatus,
    PolicyNodeType::{AbstractNamespace, Namespace},
    QuotaStatus, ResourceQuota, ResourceQuotaStatus, RESOURCE_QUOTA_NAME,
};
use kubert::index::{IndexClusterResource, IndexNamespacedResource};
use pretty_assertions::assert_eq;

/// root (pods: 10)
/// ├── other
/// └── team (pods: 4)
fn mk_nodes() -> Vec<PolicyNode> {
    let mut root = mk_node("root", None, AbstractNamespace);
    root.spec.resource_quota = Some(mk_hard(&[("pods", "10")]));

    let mut team = mk_node("team", Some("root"), Namespace);
    team.spec.resource_quota = Some(mk_hard(&[("pods", "4")]));

    vec![root, team, mk_node("other", Some("root"), Namespace)]
}

fn mk_usage(namespace: &str, name: &str, used: &[(&str, &str)]) -> ResourceQuota {
    ResourceQuota {
        metadata: ObjectMeta {
            namespace: Some(namespace.to_string()),
            name: Some(name.to_string()),
            labels: Some(labels::managed()),
            ..Default::default()
        },
        spec: None,
        status: Some(ResourceQuotaStatus {
            used: Some(mk_quantities(used)),
            ..Default::default()
        }),
    }
}

fn mk_increment(resources: &[(&str, &str)]) -> ResourceList {
    ResourceList::from_k8s_lossy(&mk_quantities(resources))
}

async fn mk_index() -> (QuotaIndex, Queue) {
    let queue = Queue::default();
    let mut index = QuotaIndex::new(queue.clone());
    for node in mk_nodes() {
        IndexClusterResource::apply(&mut index, node);
    }
    drain(&queue).await;
    (index, queue)
}

/// Returns the quota status carried by a status upsert.
fn published(action: &Action) -> QuotaStatus {
    let Action::Upsert(upsert) = action else {
        panic!("expected an upsert: {action:?}");
    };
    let Payload::Status(payload) = &upsert.payload else {
        panic!("expected a status update: {action:?}");
    };
    let status = serde_json::from_value::<PolicyNodeStatus>(payload["status"].clone())
        .expect("status must deserialize");
    status.quota.expect("quota status must be set")
}

#[tokio::test]
async fn publishes_effective_limits() {
    let queue = Queue::default();
    let mut index = QuotaIndex::new(queue.clone());
    for node in mk_nodes() {
        IndexClusterResource::apply(&mut index, node);
    }

    let actions = drain(&queue).await;
    assert_eq!(
        targets(&actions),
        vec!["upsert PolicyNode root", "upsert PolicyNode team", "upsert PolicyNode other"]
    );
    assert_eq!(
        published(&actions[1]),
        QuotaStatus {
            hard: mk_quantities(&[("pods", "4")]),
            used: BTreeMap::new(),
        }
    );
    assert_eq!(published(&actions[2]).hard, mk_quantities(&[("pods", "10")]));
}

#[tokio::test]
async fn rolls_up_observed_usage() {
    let (mut index, queue) = mk_index().await;

    IndexNamespacedResource::apply(&mut index, mk_usage("team", RESOURCE_QUOTA_NAME, &[("pods", "3")]));

    let actions = drain(&queue).await;
    assert_eq!(
        targets(&actions),
        vec!["upsert PolicyNode team", "upsert PolicyNode root"]
    );
    assert_eq!(
        published(&actions[1]),
        QuotaStatus {
            hard: mk_quantities(&[("pods", "10")]),
            used: mk_quantities(&[("pods", "3")]),
        }
    );

    // Unchanged usage is not republished.
    IndexNamespacedResource::apply(&mut index, mk_usage("team", RESOURCE_QUOTA_NAME, &[("pods", "3")]));
    assert!(drain(&queue).await.is_empty());
}

#[tokio::test]
async fn ignores_foreign_quotas() {
    let (mut index, queue) = mk_index().await;

    let mut unlabeled = mk_usage("team", RESOURCE_QUOTA_NAME, &[("pods", "3")]);
    unlabeled.metadata.labels = None;
    IndexNamespacedResource::apply(&mut index, unlabeled);
    IndexNamespacedResource::apply(&mut index, mk_usage("team", "compute", &[("pods", "3")]));
    IndexNamespacedResource::apply(&mut index, mk_usage("elsewhere", RESOURCE_QUOTA_NAME, &[("pods", "3")]));

    assert!(drain(&queue).await.is_empty());
    assert!(index.admit("other", &mk_increment(&[("pods", "10")])).is_ok());
}

#[tokio::test]
async fn admits_against_ancestors() {
    let (mut index, _queue) = mk_index().await;
    IndexNamespacedResource::apply(&mut index, mk_usage("team", RESOURCE_QUOTA_NAME, &[("pods", "3")]));

    assert!(index.admit("other", &mk_increment(&[("pods", "7")])).is_ok());

    let violation = index
        .admit("other", &mk_increment(&[("pods", "8")]))
        .expect_err("root's limit must be enforced");
    assert_eq!(violation.namespace, "root");
    assert_eq!(violation.resource, "pods");
    assert_eq!(violation.used.to_string(), "3");
    assert_eq!(violation.limit.to_string(), "10");

    // A namespace's own limits are left to its ResourceQuota.
    assert!(index.admit("team", &mk_increment(&[("pods", "5")])).is_ok());
    assert!(index.admit("unknown", &mk_increment(&[("pods", "100")])).is_ok());
}

#[tokio::test]
async fn deleted_quota_releases_usage() {
    let (mut index, queue) = mk_index().await;
    IndexNamespacedResource::apply(&mut index, mk_usage("team", RESOURCE_QUOTA_NAME, &[("pods", "3")]));
    drain(&queue).await;

    IndexNamespacedResource::<ResourceQuota>::delete(
        &mut index,
        "team".to_string(),
        RESOURCE_QUOTA_NAME.to_string(),
    );

    let actions = drain(&queue).await;
    assert_eq!(
        targets(&actions),
        vec!["upsert PolicyNode team", "upsert PolicyNode root"]
    );
    assert_eq!(published(&actions[1]).used, mk_quantities(&[("pods", "0")]));
    assert!(index.admit("other", &mk_increment(&[("pods", "10")])).is_ok());
}

#[tokio::test]
async fn observed_status_is_not_republished() {
    let queue = Queue::default();
    let mut index = QuotaIndex::new(queue.clone());

    let mut root = mk_nodes().remove(0);
    root.status = Some(PolicyNodeStatus {
        quota: Some(QuotaStatus {
            hard: mk_quantities(&[("pods", "10")]),
            used: BTreeMap::new(),
        }),
    });
    IndexClusterResource::apply(&mut index, root);

    assert!(drain(&queue).await.is_empty());
}

#[tokio::test]
async fn nodes_without_quota_publish_nothing() {
    let queue = Queue::default();
    let mut index = QuotaIndex::new(queue.clone());

    IndexClusterResource::apply(&mut index, mk_node("root", None, AbstractNamespace));
    IndexClusterResource::apply(&mut index, mk_node("team", Some("root"), Namespace));

    assert!(drain(&queue).await.is_empty());
}
