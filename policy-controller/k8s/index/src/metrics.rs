use kube::ResourceExt;
use kubert::index::{ClusterRemoved, IndexClusterResource, IndexNamespacedResource, NamespacedRemoved};
use parking_lot::RwLock;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};
use std::sync::Arc;

/// Wraps an index, recording the events it processes.
pub struct IndexMetrics<T> {
    inner: T,

    index_size: Family<NamespacedIndexLabels, Gauge>,
    index_applies: Family<NamespacedIndexLabels, Counter>,
    index_deletes: Family<NamespacedIndexLabels, Counter>,
    index_resets: Family<IndexLabels, Counter>,
}

/// Cluster-scoped resources are recorded with an empty namespace.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct NamespacedIndexLabels {
    namespace: String,
    kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct IndexLabels {
    kind: String,
}

pub trait SizedIndex<R> {
    /// The number of `R` resources held in `namespace`, or held in total for
    /// cluster-scoped resources.
    fn size(&self, namespace: Option<&str>) -> usize;
}

impl<T, R> SizedIndex<R> for Arc<RwLock<T>>
where
    T: SizedIndex<R>,
{
    fn size(&self, namespace: Option<&str>) -> usize {
        self.read().size(namespace)
    }
}

impl<T> IndexMetrics<T> {
    pub fn register(inner: T, prom: &mut Registry) -> Self {
        let index_size = Family::default();
        prom.register(
            "index_size",
            "Gauge of the number of resources in the index",
            index_size.clone(),
        );

        let index_applies = Family::default();
        prom.register(
            "index_applies",
            "Count of applies to the index",
            index_applies.clone(),
        );

        let index_deletes = Family::default();
        prom.register(
            "index_deletes",
            "Count of deletes to the index",
            index_deletes.clone(),
        );

        let index_resets = Family::default();
        prom.register(
            "index_resets",
            "Count of resets to the index",
            index_resets.clone(),
        );

        Self {
            inner,
            index_size,
            index_applies,
            index_deletes,
            index_resets,
        }
    }

    pub fn shared(self) -> Arc<RwLock<Self>> {
        Arc::new(RwLock::new(self))
    }

    fn labels<R>(namespace: &str) -> NamespacedIndexLabels
    where
        R: ResourceExt<DynamicType = ()>,
    {
        NamespacedIndexLabels {
            namespace: namespace.to_string(),
            kind: R::kind(&()).to_string(),
        }
    }

    fn record_reset<R>(&self)
    where
        R: ResourceExt<DynamicType = ()>,
    {
        self.index_resets
            .get_or_create(&IndexLabels {
                kind: R::kind(&()).to_string(),
            })
            .inc();
    }
}

impl<T> IndexMetrics<Arc<RwLock<T>>> {
    fn set_size<R>(&self, namespace: Option<&str>)
    where
        R: ResourceExt<DynamicType = ()>,
        T: SizedIndex<R>,
    {
        let size = SizedIndex::<R>::size(&self.inner, namespace);
        self.index_size
            .get_or_create(&Self::labels::<R>(namespace.unwrap_or_default()))
            .set(size as i64);
    }
}

impl<R, T> IndexNamespacedResource<R> for IndexMetrics<Arc<RwLock<T>>>
where
    T: SizedIndex<R>,
    T: IndexNamespacedResource<R>,
    R: ResourceExt<DynamicType = ()>,
{
    fn apply(&mut self, resource: R) {
        let namespace = resource.namespace().unwrap_or_default();
        self.index_applies
            .get_or_create(&Self::labels::<R>(&namespace))
            .inc();
        self.inner.write().apply(resource);
        self.set_size::<R>(Some(&namespace));
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.index_deletes
            .get_or_create(&Self::labels::<R>(&namespace))
            .inc();
        self.inner.write().delete(namespace.clone(), name);
        self.set_size::<R>(Some(&namespace));
    }

    fn reset(&mut self, resources: Vec<R>, removed: NamespacedRemoved) {
        let namespaces = resources
            .iter()
            .flat_map(|r| r.namespace())
            .chain(removed.keys().cloned())
            .collect::<Vec<_>>();
        self.record_reset::<R>();
        self.inner.write().reset(resources, removed);
        for ns in namespaces {
            self.set_size::<R>(Some(&ns));
        }
    }
}

impl<R, T> IndexClusterResource<R> for IndexMetrics<Arc<RwLock<T>>>
where
    T: SizedIndex<R>,
    T: IndexClusterResource<R>,
    R: ResourceExt<DynamicType = ()>,
{
    fn apply(&mut self, resource: R) {
        self.index_applies.get_or_create(&Self::labels::<R>("")).inc();
        self.inner.write().apply(resource);
        self.set_size::<R>(None);
    }

    fn delete(&mut self, name: String) {
        self.index_deletes.get_or_create(&Self::labels::<R>("")).inc();
        self.inner.write().delete(name);
        self.set_size::<R>(None);
    }

    fn reset(&mut self, resources: Vec<R>, removed: ClusterRemoved) {
        self.record_reset::<R>();
        self.inner.write().reset(resources, removed);
        self.set_size::<R>(None);
    }
}
