//! Tern core types: resources, deltas and the list/watch seam.
//!
//! Everything downstream (store, queue, reflector, informer) is generic over a
//! [`Resource`] and talks to the authority only through [`ListerWatcher`].

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

mod error;
mod selector;

pub use error::{AuthorityError, CacheError, QueueClosed};
pub use selector::{LabelSelector, Requirement, SelectorError};

/// Values produced by an index function for one object. Most objects map to one or two.
pub type IndexValues = SmallVec<[String; 2]>;

/// A keyed, versioned object mirrored from the authority.
///
/// The key must be unique within one resource collection and derived only from
/// the object's identity. The version token is opaque and only used to resume a
/// watch; it is never compared across keys.
pub trait Resource: Clone + Send + Sync + 'static {
    fn name(&self) -> &str;

    fn namespace(&self) -> Option<&str> {
        None
    }

    /// Server-assigned version token (`metadata.resourceVersion` for kube objects).
    fn resource_version(&self) -> Option<&str>;

    fn labels(&self) -> Option<&BTreeMap<String, String>> {
        None
    }

    fn key(&self) -> String {
        object_key(self.namespace(), self.name())
    }
}

/// `namespace/name` for namespaced objects, `name` for cluster-scoped ones.
pub fn object_key(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() => format!("{}/{}", ns, name),
        _ => name.to_string(),
    }
}

/// Split a key produced by [`object_key`] back into `(namespace, name)`.
pub fn split_object_key(key: &str) -> (Option<&str>, &str) {
    match key.split_once('/') {
        Some((ns, name)) => (Some(ns), name),
        None => (None, key),
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DeltaKind {
    Added,
    Updated,
    Deleted,
    /// Part of an authoritative full set (re-List) or a resync replay.
    Replaced,
}

impl DeltaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeltaKind::Added => "added",
            DeltaKind::Updated => "updated",
            DeltaKind::Deleted => "deleted",
            DeltaKind::Replaced => "replaced",
        }
    }
}

impl std::fmt::Display for DeltaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observed change to a single keyed object.
#[derive(Debug)]
pub struct Delta<K> {
    pub kind: DeltaKind,
    /// For `Deleted`, the last state known at the time of deletion.
    pub object: Arc<K>,
}

impl<K> Clone for Delta<K> {
    fn clone(&self) -> Self {
        Self { kind: self.kind, object: Arc::clone(&self.object) }
    }
}

impl<K: Resource> Delta<K> {
    pub fn new(kind: DeltaKind, object: impl Into<Arc<K>>) -> Self {
        Self { kind, object: object.into() }
    }

    pub fn key(&self) -> String {
        self.object.key()
    }
}

/// Event delivered by a watch stream.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<K> {
    Added(K),
    Updated(K),
    Deleted(K),
    /// Progress notification carrying only a newer version token.
    Bookmark(String),
}

impl<K: Resource> WatchEvent<K> {
    pub fn version(&self) -> Option<&str> {
        match self {
            WatchEvent::Added(o) | WatchEvent::Updated(o) | WatchEvent::Deleted(o) => o.resource_version(),
            WatchEvent::Bookmark(rv) => Some(rv.as_str()),
        }
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            WatchEvent::Added(_) => "added",
            WatchEvent::Updated(_) => "updated",
            WatchEvent::Deleted(_) => "deleted",
            WatchEvent::Bookmark(_) => "bookmark",
        }
    }
}

/// Result of a full List: the items plus the collection version to watch from.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectList<K> {
    pub items: Vec<K>,
    pub resource_version: String,
}

/// Options forwarded to List calls. Selectors are opaque to the cache.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListOptions {
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
}

/// Options forwarded to Watch calls.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchOptions {
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
    /// Version token to resume from (the last applied cursor).
    pub resource_version: String,
    /// Server-side watch timeout; the stream closes cleanly once it elapses.
    pub timeout_secs: Option<u32>,
    pub allow_bookmarks: bool,
}

impl WatchOptions {
    pub fn from_list(opts: &ListOptions, resource_version: impl Into<String>) -> Self {
        Self {
            label_selector: opts.label_selector.clone(),
            field_selector: opts.field_selector.clone(),
            resource_version: resource_version.into(),
            timeout_secs: None,
            allow_bookmarks: false,
        }
    }
}

pub type WatchStream<K> = BoxStream<'static, Result<WatchEvent<K>, AuthorityError>>;

/// The authority client: a full List plus a resumable Watch.
#[async_trait::async_trait]
pub trait ListerWatcher<K: Resource>: Send + Sync {
    async fn list(&self, opts: &ListOptions) -> Result<ObjectList<K>, AuthorityError>;

    /// Open a watch at `opts.resource_version`. Stream errors end the watch.
    async fn watch(&self, opts: &WatchOptions) -> Result<WatchStream<K>, AuthorityError>;
}

pub mod prelude {
    pub use super::{
        object_key, AuthorityError, CacheError, Delta, DeltaKind, IndexValues, LabelSelector, ListOptions,
        ListerWatcher, ObjectList, QueueClosed, Resource, WatchEvent, WatchOptions, WatchStream,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Obj {
        ns: Option<String>,
        name: String,
        rv: String,
    }

    impl Resource for Obj {
        fn name(&self) -> &str { &self.name }
        fn namespace(&self) -> Option<&str> { self.ns.as_deref() }
        fn resource_version(&self) -> Option<&str> { Some(&self.rv) }
    }

    #[test]
    fn key_includes_namespace_when_present() {
        let o = Obj { ns: Some("prod".into()), name: "a".into(), rv: "1".into() };
        assert_eq!(o.key(), "prod/a");
        let c = Obj { ns: None, name: "net-a".into(), rv: "1".into() };
        assert_eq!(c.key(), "net-a");
        assert_eq!(object_key(Some(""), "x"), "x");
    }

    #[test]
    fn split_key_roundtrips_namespaced_and_cluster_keys() {
        assert_eq!(split_object_key("prod/a"), (Some("prod"), "a"));
        assert_eq!(split_object_key("net-a"), (None, "net-a"));
    }

    #[test]
    fn watch_event_version_comes_from_object_or_bookmark() {
        let o = Obj { ns: None, name: "a".into(), rv: "42".into() };
        assert_eq!(WatchEvent::Updated(o).version(), Some("42"));
        assert_eq!(WatchEvent::<Obj>::Bookmark("50".into()).version(), Some("50"));
    }

    #[test]
    fn watch_options_inherit_selectors() {
        let lo = ListOptions { label_selector: Some("app=x".into()), field_selector: None };
        let wo = WatchOptions::from_list(&lo, "7");
        assert_eq!(wo.label_selector.as_deref(), Some("app=x"));
        assert_eq!(wo.resource_version, "7");
        assert!(!wo.allow_bookmarks);
    }
}
