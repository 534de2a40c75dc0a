//! Tern store: indexed in-RAM cache, delta queue and listers.

#![forbid(unsafe_code)]

use std::sync::Arc;

mod delta_queue;
mod indexer;
mod lister;

pub use delta_queue::{DeltaCompression, DeltaQueue, DeltaRun};
pub use indexer::{namespace_index, IndexFn, Indexer, Indexers, NAMESPACE_INDEX};
pub use lister::Lister;

/// Thread-safe key → object map. Writers are exclusive, readers concurrent.
///
/// `add` and `update` are both upserts; each mutation returns the previous value.
pub trait Store<K>: Send + Sync {
    fn add(&self, key: &str, obj: Arc<K>) -> Option<Arc<K>>;
    fn update(&self, key: &str, obj: Arc<K>) -> Option<Arc<K>>;
    fn delete(&self, key: &str) -> Option<Arc<K>>;
    fn get(&self, key: &str) -> Option<Arc<K>>;
    /// Snapshot of every stored object, in no particular order.
    fn list(&self) -> Vec<Arc<K>>;
    fn list_keys(&self) -> Vec<String>;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
