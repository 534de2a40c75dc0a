//! Event handler registry and failure-isolated dispatch.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::{error, warn};

/// Callbacks notified of every change applied to the informer's indexer.
///
/// Callbacks run on the informer's processing loop: a slow callback delays
/// delivery to every other handler. Returned errors and panics are logged and
/// never stop delivery.
pub trait ResourceEventHandler<K>: Send + Sync {
    fn on_add(&self, _obj: &Arc<K>) -> anyhow::Result<()> {
        Ok(())
    }

    /// `old` and `new` may be identical when the change came from a re-List or resync.
    fn on_update(&self, _old: &Arc<K>, _new: &Arc<K>) -> anyhow::Result<()> {
        Ok(())
    }

    /// `obj` is the final state carried by the deletion; for deletions inferred
    /// from a re-List it is the last state the cache held.
    fn on_delete(&self, _obj: &Arc<K>) -> anyhow::Result<()> {
        Ok(())
    }
}

type AddFn<K> = Box<dyn Fn(&Arc<K>) + Send + Sync>;
type UpdateFn<K> = Box<dyn Fn(&Arc<K>, &Arc<K>) + Send + Sync>;

/// Closure-based handler; unset callbacks ignore their event.
pub struct HandlerFns<K> {
    add: Option<AddFn<K>>,
    update: Option<UpdateFn<K>>,
    delete: Option<AddFn<K>>,
}

impl<K> Default for HandlerFns<K> {
    fn default() -> Self {
        Self { add: None, update: None, delete: None }
    }
}

impl<K> HandlerFns<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_add(mut self, f: impl Fn(&Arc<K>) + Send + Sync + 'static) -> Self {
        self.add = Some(Box::new(f));
        self
    }

    pub fn on_update(mut self, f: impl Fn(&Arc<K>, &Arc<K>) + Send + Sync + 'static) -> Self {
        self.update = Some(Box::new(f));
        self
    }

    pub fn on_delete(mut self, f: impl Fn(&Arc<K>) + Send + Sync + 'static) -> Self {
        self.delete = Some(Box::new(f));
        self
    }
}

impl<K> ResourceEventHandler<K> for HandlerFns<K> {
    fn on_add(&self, obj: &Arc<K>) -> anyhow::Result<()> {
        if let Some(f) = &self.add { f(obj) }
        Ok(())
    }

    fn on_update(&self, old: &Arc<K>, new: &Arc<K>) -> anyhow::Result<()> {
        if let Some(f) = &self.update { f(old, new) }
        Ok(())
    }

    fn on_delete(&self, obj: &Arc<K>) -> anyhow::Result<()> {
        if let Some(f) = &self.delete { f(obj) }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl HandlerId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler-{}", self.0)
    }
}

/// Returned by `add_handler`; pass it back to `remove_handler`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerRegistration {
    pub(crate) id: HandlerId,
    pub(crate) replayed: usize,
}

impl HandlerRegistration {
    pub fn id(&self) -> HandlerId {
        self.id
    }

    /// Number of synthetic `on_add` calls delivered at registration.
    pub fn replayed(&self) -> usize {
        self.replayed
    }
}

pub(crate) enum Notification<K> {
    Add(Arc<K>),
    Update { old: Arc<K>, new: Arc<K> },
    Delete(Arc<K>),
}

impl<K> Notification<K> {
    fn label(&self) -> &'static str {
        match self {
            Notification::Add(_) => "add",
            Notification::Update { .. } => "update",
            Notification::Delete(_) => "delete",
        }
    }
}

pub(crate) struct Listener<K> {
    pub(crate) id: HandlerId,
    handler: Arc<dyn ResourceEventHandler<K>>,
}

impl<K> Listener<K> {
    /// Invoke the matching callback; a panic or error is logged and swallowed.
    pub(crate) fn deliver(&self, note: &Notification<K>) {
        let res = catch_unwind(AssertUnwindSafe(|| match note {
            Notification::Add(obj) => self.handler.on_add(obj),
            Notification::Update { old, new } => self.handler.on_update(old, new),
            Notification::Delete(obj) => self.handler.on_delete(obj),
        }));
        match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                metrics::counter!("informer_handler_failures_total", 1, "mode" => "error");
                warn!(handler = %self.id, event = note.label(), error = %e, "handler returned error");
            }
            Err(panic) => {
                metrics::counter!("informer_handler_failures_total", 1, "mode" => "panic");
                error!(handler = %self.id, event = note.label(), panic = %panic_message(panic.as_ref()), "handler panicked; continuing");
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Copy-on-write list of listeners; dispatch reads a snapshot without locking.
pub(crate) struct Processor<K> {
    listeners: ArcSwap<Vec<Arc<Listener<K>>>>,
    next_id: AtomicU64,
}

impl<K> Processor<K> {
    pub(crate) fn new() -> Self {
        Self { listeners: ArcSwap::from_pointee(Vec::new()), next_id: AtomicU64::new(1) }
    }

    pub(crate) fn listener(&self, handler: Arc<dyn ResourceEventHandler<K>>) -> Arc<Listener<K>> {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        Arc::new(Listener { id, handler })
    }

    pub(crate) fn insert(&self, listener: Arc<Listener<K>>) {
        self.listeners.rcu(|cur| {
            let mut next = Vec::clone(cur);
            next.push(Arc::clone(&listener));
            next
        });
        metrics::gauge!("informer_handlers", self.len() as f64);
    }

    pub(crate) fn remove(&self, id: HandlerId) -> bool {
        let mut removed = false;
        self.listeners.rcu(|cur| {
            let next: Vec<Arc<Listener<K>>> = cur.iter().filter(|l| l.id != id).cloned().collect();
            removed = next.len() != cur.len();
            next
        });
        metrics::gauge!("informer_handlers", self.len() as f64);
        removed
    }

    pub(crate) fn snapshot(&self) -> Arc<Vec<Arc<Listener<K>>>> {
        self.listeners.load_full()
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.load().len()
    }
}
