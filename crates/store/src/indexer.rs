//! Thread-safe object store with secondary indices.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rustc_hash::{FxHashMap, FxHashSet};
use tern_core::{CacheError, IndexValues, Resource};
use tracing::debug;

use crate::Store;

/// Name of the built-in namespace index.
pub const NAMESPACE_INDEX: &str = "namespace";

/// Pure mapping from an object to zero or more index values.
pub type IndexFn<K> = Arc<dyn Fn(&K) -> IndexValues + Send + Sync>;

/// Index function for [`NAMESPACE_INDEX`]. Cluster-scoped objects index under `""`.
pub fn namespace_index<K: Resource>(obj: &K) -> IndexValues {
    let mut out = IndexValues::new();
    out.push(obj.namespace().unwrap_or("").to_string());
    out
}

/// Named index functions, registered before the indexer is populated.
pub struct Indexers<K> {
    fns: FxHashMap<String, IndexFn<K>>,
}

impl<K> Clone for Indexers<K> {
    fn clone(&self) -> Self {
        Self { fns: self.fns.clone() }
    }
}

impl<K> Default for Indexers<K> {
    fn default() -> Self {
        Self { fns: FxHashMap::default() }
    }
}

impl<K> Indexers<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&K) -> IndexValues + Send + Sync + 'static,
    {
        self.fns.insert(name.into(), Arc::new(f));
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, f: IndexFn<K>) {
        self.fns.insert(name.into(), f);
    }

    pub fn names(&self) -> Vec<String> {
        let mut v: Vec<String> = self.fns.keys().cloned().collect();
        v.sort_unstable();
        v
    }

    pub fn is_empty(&self) -> bool {
        self.fns.is_empty()
    }
}

impl<K: Resource> Indexers<K> {
    /// Indexers holding only the namespace index.
    pub fn namespaced() -> Self {
        Self::new().with(NAMESPACE_INDEX, namespace_index::<K>)
    }
}

// index value -> primary keys
type Index = FxHashMap<String, FxHashSet<String>>;

struct Inner<K> {
    items: FxHashMap<String, Arc<K>>,
    indexers: FxHashMap<String, IndexFn<K>>,
    indices: FxHashMap<String, Index>,
}

impl<K> Inner<K> {
    /// Move `key` from the buckets of `old` to the buckets of `new` for every index.
    fn update_indices(&mut self, key: &str, old: Option<&K>, new: Option<&K>) {
        for (name, f) in self.indexers.iter() {
            let old_vals: FxHashSet<String> = old.map(|o| f(o).into_iter().collect()).unwrap_or_default();
            let new_vals: FxHashSet<String> = new.map(|n| f(n).into_iter().collect()).unwrap_or_default();
            if old_vals == new_vals {
                continue;
            }
            let index = self.indices.entry(name.clone()).or_default();
            for v in old_vals.difference(&new_vals) {
                if let Some(set) = index.get_mut(v) {
                    set.remove(key);
                    if set.is_empty() {
                        index.remove(v);
                    }
                }
            }
            for v in new_vals.difference(&old_vals) {
                index.entry(v.clone()).or_default().insert(key.to_string());
            }
        }
    }

    fn upsert(&mut self, key: &str, obj: Arc<K>) -> Option<Arc<K>> {
        let old = self.items.insert(key.to_string(), Arc::clone(&obj));
        self.update_indices(key, old.as_deref(), Some(&*obj));
        old
    }

    fn remove(&mut self, key: &str) -> Option<Arc<K>> {
        let old = self.items.remove(key)?;
        self.update_indices(key, Some(&*old), None);
        Some(old)
    }
}

/// Key → object map plus secondary indices, guarded by one read/write lock.
///
/// Every mutation recomputes index membership for the key under the write lock,
/// so readers never observe an object without its index entries or vice versa.
pub struct Indexer<K> {
    inner: RwLock<Inner<K>>,
}

impl<K> Indexer<K> {
    pub fn new(indexers: Indexers<K>) -> Self {
        let indices = indexers.fns.keys().map(|n| (n.clone(), Index::default())).collect();
        Self { inner: RwLock::new(Inner { items: FxHashMap::default(), indexers: indexers.fns, indices }) }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner<K>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner<K>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Objects whose index function `index_name` produced `value`.
    pub fn by_index(&self, index_name: &str, value: &str) -> Result<Vec<Arc<K>>, CacheError> {
        let inner = self.read();
        let index = inner.indices.get(index_name).ok_or_else(|| CacheError::IndexNotFound(index_name.to_string()))?;
        Ok(index
            .get(value)
            .map(|keys| keys.iter().filter_map(|k| inner.items.get(k).cloned()).collect())
            .unwrap_or_default())
    }

    /// Primary keys in the `value` bucket of `index_name`, sorted.
    pub fn index_keys(&self, index_name: &str, value: &str) -> Result<Vec<String>, CacheError> {
        let inner = self.read();
        let index = inner.indices.get(index_name).ok_or_else(|| CacheError::IndexNotFound(index_name.to_string()))?;
        let mut keys: Vec<String> = index.get(value).map(|s| s.iter().cloned().collect()).unwrap_or_default();
        keys.sort_unstable();
        Ok(keys)
    }

    /// Non-empty bucket values of an index, sorted. Unknown index yields nothing.
    pub fn list_index_values(&self, index_name: &str) -> Vec<String> {
        let inner = self.read();
        let mut vals: Vec<String> = inner.indices.get(index_name).map(|i| i.keys().cloned().collect()).unwrap_or_default();
        vals.sort_unstable();
        vals
    }

    pub fn index_names(&self) -> Vec<String> {
        let inner = self.read();
        let mut names: Vec<String> = inner.indexers.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// Register more index functions and build them over the current items.
    pub fn add_indexers(&self, indexers: Indexers<K>) -> Result<(), CacheError> {
        let mut inner = self.write();
        if let Some(dup) = indexers.fns.keys().find(|n| inner.indexers.contains_key(*n)) {
            return Err(CacheError::IndexConflict(dup.clone()));
        }
        for (name, f) in indexers.fns {
            let mut index = Index::default();
            for (key, obj) in inner.items.iter() {
                for v in f(obj) {
                    index.entry(v).or_default().insert(key.clone());
                }
            }
            debug!(index = %name, buckets = index.len(), "index registered");
            inner.indices.insert(name.clone(), index);
            inner.indexers.insert(name, f);
        }
        Ok(())
    }
}

impl<K: Send + Sync> Store<K> for Indexer<K> {
    fn add(&self, key: &str, obj: Arc<K>) -> Option<Arc<K>> {
        self.write().upsert(key, obj)
    }

    fn update(&self, key: &str, obj: Arc<K>) -> Option<Arc<K>> {
        self.write().upsert(key, obj)
    }

    fn delete(&self, key: &str) -> Option<Arc<K>> {
        self.write().remove(key)
    }

    fn get(&self, key: &str) -> Option<Arc<K>> {
        self.read().items.get(key).cloned()
    }

    fn list(&self) -> Vec<Arc<K>> {
        self.read().items.values().cloned().collect()
    }

    fn list_keys(&self) -> Vec<String> {
        self.read().items.keys().cloned().collect()
    }

    fn len(&self) -> usize {
        self.read().items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    #[derive(Debug, Clone, PartialEq)]
    struct Net {
        name: String,
        class: String,
        tags: Vec<String>,
    }

    impl Resource for Net {
        fn name(&self) -> &str { &self.name }
        fn resource_version(&self) -> Option<&str> { None }
    }

    fn net(name: &str, class: &str, tags: &[&str]) -> Arc<Net> {
        Arc::new(Net { name: name.into(), class: class.into(), tags: tags.iter().map(|t| t.to_string()).collect() })
    }

    fn indexer() -> Indexer<Net> {
        Indexer::new(
            Indexers::new()
                .with("class", |n: &Net| smallvec![n.class.clone()])
                .with("tag", |n: &Net| n.tags.iter().cloned().collect()),
        )
    }

    #[test]
    fn update_relocates_index_membership() {
        let ix = indexer();
        ix.add("a", net("a", "gpu", &[]));
        ix.add("b", net("b", "gpu", &[]));
        assert_eq!(ix.index_keys("class", "gpu").unwrap(), vec!["a", "b"]);

        ix.update("a", net("a", "sriov", &[]));
        assert_eq!(ix.index_keys("class", "gpu").unwrap(), vec!["b"]);
        assert_eq!(ix.index_keys("class", "sriov").unwrap(), vec!["a"]);
    }

    #[test]
    fn delete_removes_from_every_bucket_and_prunes() {
        let ix = indexer();
        ix.add("a", net("a", "gpu", &["x", "y"]));
        assert_eq!(ix.list_index_values("tag"), vec!["x", "y"]);
        let old = ix.delete("a").expect("present");
        assert_eq!(old.class, "gpu");
        assert!(ix.list_index_values("tag").is_empty());
        assert!(ix.by_index("class", "gpu").unwrap().is_empty());
        assert!(ix.delete("a").is_none());
    }

    #[test]
    fn multi_valued_index_with_duplicates() {
        let ix = indexer();
        ix.add("a", net("a", "gpu", &["x", "x", "z"]));
        assert_eq!(ix.index_keys("tag", "x").unwrap(), vec!["a"]);
        ix.update("a", net("a", "gpu", &["z"]));
        assert!(ix.index_keys("tag", "x").unwrap().is_empty());
        assert_eq!(ix.index_keys("tag", "z").unwrap(), vec!["a"]);
    }

    #[test]
    fn unknown_index_is_an_error() {
        let ix = indexer();
        assert_eq!(ix.by_index("nope", "v").unwrap_err(), CacheError::IndexNotFound("nope".into()));
    }

    #[test]
    fn add_indexers_builds_over_existing_items() {
        let ix: Indexer<Net> = Indexer::new(Indexers::new());
        ix.add("a", net("a", "gpu", &[]));
        ix.add("b", net("b", "cpu", &[]));
        ix.add_indexers(Indexers::new().with("class", |n: &Net| smallvec![n.class.clone()])).expect("ok");
        assert_eq!(ix.index_keys("class", "cpu").unwrap(), vec!["b"]);
        let err = ix.add_indexers(Indexers::new().with("class", |_: &Net| IndexValues::new())).unwrap_err();
        assert_eq!(err, CacheError::IndexConflict("class".into()));
    }

    #[test]
    fn list_is_a_snapshot() {
        let ix = indexer();
        ix.add("a", net("a", "gpu", &[]));
        let snap = ix.list();
        ix.delete("a");
        assert_eq!(snap.len(), 1);
        assert_eq!(ix.len(), 0);
    }
}
