use kubert::index::{ClusterRemoved, IndexClusterResource, IndexNamespacedResource, NamespacedRemoved};
use parking_lot::RwLock;
use std::sync::Arc;

/// Fans a single watch out to several indexes.
///
/// Indexes are updated in the order they were pushed.
pub struct IndexList<A, T = A> {
    index: Arc<RwLock<A>>,
    tail: Option<T>,
}

impl<A> IndexList<A> {
    pub fn new(index: Arc<RwLock<A>>) -> Self {
        Self { index, tail: None }
    }
}

impl<A, T> IndexList<A, T> {
    pub fn push<B>(self, index: Arc<RwLock<B>>) -> IndexList<B, Self> {
        IndexList {
            index,
            tail: Some(self),
        }
    }

    pub fn shared(self) -> Arc<RwLock<Self>> {
        Arc::new(RwLock::new(self))
    }
}

impl<A, T, R> IndexNamespacedResource<R> for IndexList<A, T>
where
    A: IndexNamespacedResource<R>,
    T: IndexNamespacedResource<R>,
    R: Clone,
{
    fn apply(&mut self, resource: R) {
        if let Some(tail) = &mut self.tail {
            tail.apply(resource.clone());
        }
        self.index.write().apply(resource);
    }

    fn delete(&mut self, namespace: String, name: String) {
        if let Some(tail) = &mut self.tail {
            tail.delete(namespace.clone(), name.clone());
        }
        self.index.write().delete(namespace, name);
    }

    fn reset(&mut self, resources: Vec<R>, removed: NamespacedRemoved) {
        if let Some(tail) = &mut self.tail {
            tail.reset(resources.clone(), removed.clone());
        }
        self.index.write().reset(resources, removed);
    }
}

impl<A, T, R> IndexClusterResource<R> for IndexList<A, T>
where
    A: IndexClusterResource<R>,
    T: IndexClusterResource<R>,
    R: Clone,
{
    fn apply(&mut self, resource: R) {
        if let Some(tail) = &mut self.tail {
            tail.apply(resource.clone());
        }
        self.index.write().apply(resource);
    }

    fn delete(&mut self, name: String) {
        if let Some(tail) = &mut self.tail {
            tail.delete(name.clone());
        }
        self.index.write().delete(name);
    }

    fn reset(&mut self, resources: Vec<R>, removed: ClusterRemoved) {
        if let Some(tail) = &mut self.tail {
            tail.reset(resources.clone(), removed.clone());
        }
        self.index.write().reset(resources, removed);
    }
}
