//! Read-only lookups over an [`Indexer`].

use std::sync::Arc;

use tern_core::{object_key, CacheError, LabelSelector, Resource};

use crate::{Indexer, Store, NAMESPACE_INDEX};

/// Read-only facade over the indexer. Cheap to clone; every call reads the
/// indexer's current state.
pub struct Lister<K> {
    indexer: Arc<Indexer<K>>,
}

impl<K> Clone for Lister<K> {
    fn clone(&self) -> Self {
        Self { indexer: Arc::clone(&self.indexer) }
    }
}

impl<K: Resource> Lister<K> {
    pub fn new(indexer: Arc<Indexer<K>>) -> Self {
        Self { indexer }
    }

    pub fn get(&self, key: &str) -> Option<Arc<K>> {
        self.indexer.get(key)
    }

    pub fn get_namespaced(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        self.indexer.get(&object_key(Some(namespace), name))
    }

    pub fn list(&self) -> Vec<Arc<K>> {
        self.indexer.list()
    }

    pub fn list_by_index(&self, index_name: &str, value: &str) -> Result<Vec<Arc<K>>, CacheError> {
        self.indexer.by_index(index_name, value)
    }

    /// Objects whose labels satisfy `selector`.
    pub fn list_selected(&self, selector: &LabelSelector) -> Vec<Arc<K>> {
        if selector.is_empty() {
            return self.list();
        }
        self.indexer.list().into_iter().filter(|o| selector.matches(o.labels())).collect()
    }

    /// Objects in one namespace; requires the namespace index.
    pub fn list_in_namespace(&self, namespace: &str) -> Result<Vec<Arc<K>>, CacheError> {
        self.indexer.by_index(NAMESPACE_INDEX, namespace)
    }

    pub fn len(&self) -> usize {
        self.indexer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
