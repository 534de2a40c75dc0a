//! Ordered, deduplicating hand-off between the reflector and the processing loop.
//!
//! A FIFO of keys plus one pending delta run per key. Re-pushing a key appends to
//! its run and keeps the position where the key was first enqueued.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rustc_hash::{FxHashMap, FxHashSet};
use tern_core::{Delta, DeltaKind, QueueClosed, Resource};
use tokio::sync::{watch, Notify};
use tracing::{debug, trace};

use crate::Store;

/// How a `Deleted` delta interacts with the pending run for its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeltaCompression {
    /// A delete replaces the pending run with a single `Deleted`; if the key was
    /// never applied to the store, the run disappears entirely.
    #[default]
    CollapseDeletes,
    /// Every transition is delivered; only back-to-back deletes are merged.
    KeepTransitions,
}

/// All pending deltas for one key, oldest first.
#[derive(Debug)]
pub struct DeltaRun<K> {
    pub key: String,
    pub deltas: Vec<Delta<K>>,
}

struct InFlight<K> {
    key: String,
    last: Delta<K>,
}

struct QueueInner<K> {
    items: FxHashMap<String, Vec<Delta<K>>>,
    order: VecDeque<String>,
    in_flight: Option<InFlight<K>>,
    populated: bool,
    // keys from the first replace that are not yet fully applied
    initial: FxHashSet<String>,
    closed: bool,
}

impl<K> QueueInner<K> {
    fn is_in_flight(&self, key: &str) -> bool {
        self.in_flight.as_ref().is_some_and(|f| f.key == key)
    }
}

enum Action {
    Append,
    Start,
    Collapse,
    Drop,
    Forget,
}

/// Delta FIFO consumed by a single processing loop.
///
/// `known` is the store the consumer applies deltas to; the queue reads it to
/// decide whether a deleted key was ever observed, to find keys missing from a
/// re-List, and to replay state on resync.
pub struct DeltaQueue<K> {
    inner: Mutex<QueueInner<K>>,
    known: Arc<dyn Store<K>>,
    compression: DeltaCompression,
    notify: Notify,
    synced: watch::Sender<bool>,
}

impl<K: Resource> DeltaQueue<K> {
    pub fn new(known: Arc<dyn Store<K>>) -> Self {
        Self::with_compression(known, DeltaCompression::default())
    }

    pub fn with_compression(known: Arc<dyn Store<K>>, compression: DeltaCompression) -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            inner: Mutex::new(QueueInner {
                items: FxHashMap::default(),
                order: VecDeque::new(),
                in_flight: None,
                populated: false,
                initial: FxHashSet::default(),
                closed: false,
            }),
            known,
            compression,
            notify: Notify::new(),
            synced,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner<K>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn compression(&self) -> DeltaCompression {
        self.compression
    }

    /// Queue one delta. Ignored once the queue is closed.
    pub fn push(&self, delta: Delta<K>) {
        {
            let mut inner = self.lock();
            if inner.closed {
                trace!(key = %delta.key(), "push after close ignored");
                return;
            }
            self.enqueue_locked(&mut inner, delta);
            metrics::gauge!("delta_queue_depth", inner.order.len() as f64);
        }
        self.notify.notify_one();
    }

    pub fn add(&self, obj: K) {
        self.push(Delta::new(DeltaKind::Added, obj))
    }

    pub fn update(&self, obj: K) {
        self.push(Delta::new(DeltaKind::Updated, obj))
    }

    pub fn delete(&self, obj: K) {
        self.push(Delta::new(DeltaKind::Deleted, obj))
    }

    /// Returns true when the delta left a pending run behind.
    fn enqueue_locked(&self, inner: &mut QueueInner<K>, delta: Delta<K>) -> bool {
        let key = delta.key();
        let is_delete = delta.kind == DeltaKind::Deleted;
        let observed = || inner.is_in_flight(&key) || self.known.get(&key).is_some();
        let action = match inner.items.get(&key) {
            None if is_delete && !observed() => Action::Drop,
            None => Action::Start,
            Some(run) if is_delete && run.last().is_some_and(|d| d.kind == DeltaKind::Deleted) => Action::Drop,
            Some(_) if is_delete && self.compression == DeltaCompression::CollapseDeletes => {
                if observed() { Action::Collapse } else { Action::Forget }
            }
            Some(_) => Action::Append,
        };
        match action {
            Action::Start => {
                inner.order.push_back(key.clone());
                inner.items.insert(key, vec![delta]);
            }
            Action::Append => {
                if let Some(run) = inner.items.get_mut(&key) {
                    run.push(delta);
                }
            }
            Action::Collapse => {
                if let Some(run) = inner.items.get_mut(&key) {
                    trace!(key = %key, dropped = run.len(), "pending run collapsed into delete");
                    run.clear();
                    run.push(delta);
                }
            }
            Action::Forget => {
                inner.items.remove(&key);
                inner.order.retain(|k| k != &key);
                debug!(key = %key, "unobserved key deleted before processing; run dropped");
                self.settle_initial(inner, &key);
                return false;
            }
            Action::Drop => {
                trace!(key = %key, "delete for unknown key or duplicate delete ignored");
                return inner.items.contains_key(&key);
            }
        }
        true
    }

    fn settle_initial(&self, inner: &mut QueueInner<K>, key: &str) {
        if inner.initial.remove(key) && inner.populated && inner.initial.is_empty() {
            self.mark_synced();
        }
    }

    fn mark_synced(&self) {
        if !*self.synced.borrow() {
            debug!("initial list fully applied; queue synced");
            self.synced.send_replace(true);
        }
    }

    /// Queue the authoritative full set from a List.
    ///
    /// Every listed object becomes a `Replaced` delta. Objects known to the store
    /// (or pending) but absent from the list get a `Deleted` delta carrying their
    /// last known state. The first call defines the initial population that
    /// [`DeltaQueue::has_synced`] waits for.
    pub fn replace(&self, items: Vec<K>, resource_version: &str) {
        {
            let mut inner = self.lock();
            if inner.closed {
                return;
            }
            let listed_count = items.len();
            let mut listed: FxHashSet<String> = FxHashSet::default();
            for obj in items {
                let delta = Delta::new(DeltaKind::Replaced, obj);
                listed.insert(delta.key());
                self.enqueue_locked(&mut inner, delta);
            }

            let mut deletions = 0usize;
            for key in self.known.list_keys() {
                if listed.contains(&key) {
                    continue;
                }
                if let Some(old) = self.known.get(&key) {
                    if self.enqueue_locked(&mut inner, Delta { kind: DeltaKind::Deleted, object: old }) {
                        deletions += 1;
                    }
                }
            }
            // pending or in-flight objects the store has not seen yet
            let mut stale: Vec<Arc<K>> = inner
                .order
                .iter()
                .filter(|k| !listed.contains(*k) && self.known.get(k).is_none())
                .filter_map(|k| inner.items.get(k).and_then(|run| run.last()))
                .filter(|d| d.kind != DeltaKind::Deleted)
                .map(|d| Arc::clone(&d.object))
                .collect();
            // the consumer may apply the in-flight run at any point above, so its
            // key is deleted whether or not the store holds it yet
            if let Some(f) = inner.in_flight.as_ref() {
                if !listed.contains(&f.key) && f.last.kind != DeltaKind::Deleted && !inner.items.contains_key(&f.key) {
                    stale.push(self.known.get(&f.key).unwrap_or_else(|| Arc::clone(&f.last.object)));
                }
            }
            for obj in stale {
                if self.enqueue_locked(&mut inner, Delta { kind: DeltaKind::Deleted, object: obj }) {
                    deletions += 1;
                }
            }

            if !inner.populated {
                inner.populated = true;
                inner.initial = inner.items.keys().cloned().collect();
                if inner.initial.is_empty() {
                    self.mark_synced();
                }
            }
            metrics::gauge!("delta_queue_depth", inner.order.len() as f64);
            debug!(rv = %resource_version, listed = listed_count, deletions, pending = inner.order.len(), "replace queued");
        }
        self.notify.notify_one();
    }

    /// Queue a `Replaced` delta for every stored key without a pending run.
    /// Returns the number of keys queued.
    pub fn resync(&self) -> usize {
        let queued = {
            let mut inner = self.lock();
            if inner.closed {
                return 0;
            }
            let mut queued = 0usize;
            for key in self.known.list_keys() {
                if inner.items.contains_key(&key) || inner.is_in_flight(&key) {
                    continue;
                }
                if let Some(obj) = self.known.get(&key) {
                    self.enqueue_locked(&mut inner, Delta { kind: DeltaKind::Replaced, object: obj });
                    queued += 1;
                }
            }
            metrics::gauge!("delta_queue_depth", inner.order.len() as f64);
            queued
        };
        if queued > 0 {
            self.notify.notify_one();
        }
        queued
    }

    /// Wait for the next key's run. The caller must call [`DeltaQueue::done`]
    /// once the run has been applied.
    pub async fn pop(&self) -> Result<DeltaRun<K>, QueueClosed> {
        loop {
            {
                let mut inner = self.lock();
                if inner.closed {
                    return Err(QueueClosed);
                }
                while let Some(key) = inner.order.pop_front() {
                    let Some(deltas) = inner.items.remove(&key) else { continue };
                    let Some(last) = deltas.last().cloned() else { continue };
                    inner.in_flight = Some(InFlight { key: key.clone(), last });
                    metrics::gauge!("delta_queue_depth", inner.order.len() as f64);
                    return Ok(DeltaRun { key, deltas });
                }
            }
            self.notify.notified().await;
        }
    }

    /// Mark the run popped for `key` as applied.
    pub fn done(&self, key: &str) {
        let mut inner = self.lock();
        if inner.is_in_flight(key) {
            inner.in_flight = None;
        }
        // a run queued while this one was in flight settles on its own `done`
        if !inner.items.contains_key(key) {
            self.settle_initial(&mut inner, key);
        }
    }

    /// Close the queue: pending and future pops return [`QueueClosed`].
    pub fn close(&self) {
        {
            let mut inner = self.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            debug!(pending = inner.order.len(), "delta queue closed");
        }
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// True once every key from the first replace has been popped and applied.
    /// Never reverts.
    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    pub async fn wait_synced(&self) {
        let mut rx = self.synced.subscribe();
        let _ = rx.wait_for(|synced| *synced).await;
    }

    /// Number of keys with a pending run.
    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pending keys in pop order.
    pub fn pending_keys(&self) -> Vec<String> {
        self.lock().order.iter().cloned().collect()
    }

    /// Snapshot of the pending run for `key`.
    pub fn pending(&self, key: &str) -> Option<Vec<Delta<K>>> {
        self.lock().items.get(key).cloned()
    }
}
