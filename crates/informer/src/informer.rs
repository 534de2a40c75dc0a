//! Shared indexed informer: one reflector, one indexer, many handlers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tern_core::{CacheError, Delta, DeltaKind, ListerWatcher, QueueClosed, Resource};
use tern_store::{DeltaQueue, Indexer, Indexers, Lister, Store};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::handler::{HandlerFns, HandlerRegistration, Notification, Processor, ResourceEventHandler};
use crate::{InformerConfig, Reflector, ReflectorState};

/// Closes the queue when dropped so the processing loop ends even if the
/// reflector task panics.
struct CloseOnDrop<K: Resource>(Arc<DeltaQueue<K>>);

impl<K: Resource> Drop for CloseOnDrop<K> {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// Watch-synchronized indexed cache for one resource collection.
///
/// The processing loop is the only writer of the indexer. Each popped delta
/// run is applied to the indexer first and then delivered, in order, to every
/// registered handler.
pub struct SharedIndexInformer<K: Resource> {
    name: String,
    indexer: Arc<Indexer<K>>,
    queue: Arc<DeltaQueue<K>>,
    reflector: Arc<Reflector<K>>,
    processor: Processor<K>,
    // serializes delta application with handler registration replay
    delivery: Mutex<()>,
    started: AtomicBool,
    shutdown: CancellationToken,
}

impl<K: Resource> SharedIndexInformer<K> {
    pub fn new(lw: Arc<dyn ListerWatcher<K>>, indexers: Indexers<K>, config: InformerConfig) -> Self {
        let indexer = Arc::new(Indexer::new(indexers));
        let queue = Arc::new(DeltaQueue::with_compression(
            Arc::clone(&indexer) as Arc<dyn Store<K>>,
            config.compression,
        ));
        let name = config.name.clone();
        let reflector = Arc::new(Reflector::new(lw, Arc::clone(&queue), config));
        Self {
            name,
            indexer,
            queue,
            reflector,
            processor: Processor::new(),
            delivery: Mutex::new(()),
            started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn indexer(&self) -> Arc<Indexer<K>> {
        Arc::clone(&self.indexer)
    }

    pub fn lister(&self) -> Lister<K> {
        Lister::new(Arc::clone(&self.indexer))
    }

    /// True once every object from the initial List has been applied. Never reverts.
    pub fn has_synced(&self) -> bool {
        self.queue.has_synced()
    }

    /// Wait for the initial sync; returns the sync state if `stop` fires first.
    pub async fn wait_for_sync(&self, stop: &CancellationToken) -> bool {
        tokio::select! {
            _ = self.queue.wait_synced() => true,
            _ = stop.cancelled() => self.has_synced(),
        }
    }

    pub fn last_sync_version(&self) -> String {
        self.reflector.last_sync_version()
    }

    pub fn reflector_state(&self) -> watch::Receiver<ReflectorState> {
        self.reflector.state()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Register more index functions. Only allowed before [`SharedIndexInformer::run`].
    pub fn add_indexers(&self, indexers: Indexers<K>) -> Result<(), CacheError> {
        if self.is_started() {
            return Err(CacheError::AlreadyStarted);
        }
        self.indexer.add_indexers(indexers)
    }

    fn lock_delivery(&self) -> MutexGuard<'_, ()> {
        self.delivery.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a handler. It first receives `on_add` for every object currently
    /// in the indexer, then every live change after that.
    ///
    /// Must not be called from inside a handler callback of the same informer.
    pub fn add_handler(&self, handler: impl ResourceEventHandler<K> + 'static) -> HandlerRegistration {
        let _guard = self.lock_delivery();
        let listener = self.processor.listener(Arc::new(handler));
        let snapshot = self.indexer.list();
        let replayed = snapshot.len();
        for obj in snapshot {
            listener.deliver(&Notification::Add(obj));
        }
        let id = listener.id;
        self.processor.insert(listener);
        info!(informer = %self.name, handler = %id, replayed, "handler registered");
        HandlerRegistration { id, replayed }
    }

    /// Convenience form of [`SharedIndexInformer::add_handler`] taking three closures.
    pub fn add_handler_fns(
        &self,
        on_add: impl Fn(&Arc<K>) + Send + Sync + 'static,
        on_update: impl Fn(&Arc<K>, &Arc<K>) + Send + Sync + 'static,
        on_delete: impl Fn(&Arc<K>) + Send + Sync + 'static,
    ) -> HandlerRegistration {
        self.add_handler(HandlerFns::new().on_add(on_add).on_update(on_update).on_delete(on_delete))
    }

    /// Stop delivering to a handler. A delta already being dispatched may still reach it.
    pub fn remove_handler(&self, registration: &HandlerRegistration) -> bool {
        let removed = self.processor.remove(registration.id);
        if removed {
            info!(informer = %self.name, handler = %registration.id, "handler removed");
        } else {
            warn!(informer = %self.name, handler = %registration.id, "attempted to remove unknown handler");
        }
        removed
    }

    pub fn handler_count(&self) -> usize {
        self.processor.len()
    }

    /// Request shutdown of a running informer.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Run the reflector and the processing loop until `stop` fires or
    /// [`SharedIndexInformer::stop`] is called. A second call returns immediately.
    pub async fn run(self: Arc<Self>, stop: CancellationToken) {
        if self.started.swap(true, Ordering::AcqRel) {
            warn!(informer = %self.name, "informer already started");
            return;
        }
        info!(informer = %self.name, handlers = self.handler_count(), "informer started");
        let token = self.shutdown.child_token();
        let forward = tokio::spawn({
            let token = token.clone();
            async move {
                tokio::select! {
                    _ = stop.cancelled() => token.cancel(),
                    _ = token.cancelled() => {}
                }
            }
        });
        let producer = tokio::spawn({
            let reflector = Arc::clone(&self.reflector);
            let close = CloseOnDrop(Arc::clone(&self.queue));
            let token = token.clone();
            async move {
                let _close = close;
                reflector.run(token).await;
            }
        });

        self.process_loop().await;

        token.cancel();
        if let Err(e) = producer.await {
            error!(informer = %self.name, error = %e, "reflector task failed");
        }
        let _ = forward.await;
        info!(informer = %self.name, items = self.indexer.len(), "informer stopped");
    }

    async fn process_loop(&self) {
        loop {
            let run = match self.queue.pop().await {
                Ok(run) => run,
                Err(QueueClosed) => {
                    debug!(informer = %self.name, "delta queue closed; processing loop exiting");
                    break;
                }
            };
            self.process_run(&run.key, run.deltas);
            self.queue.done(&run.key);
        }
    }

    fn process_run(&self, key: &str, deltas: Vec<Delta<K>>) {
        let _guard = self.lock_delivery();
        let listeners = self.processor.snapshot();
        for delta in deltas {
            metrics::counter!("informer_deltas_total", 1, "kind" => delta.kind.as_str());
            let note = match delta.kind {
                DeltaKind::Deleted => match self.indexer.delete(key) {
                    Some(_) => Notification::Delete(delta.object),
                    None => {
                        debug!(informer = %self.name, key = %key, "delete for unknown key ignored");
                        continue;
                    }
                },
                // an update for a key the cache never saw is delivered as an add
                DeltaKind::Added | DeltaKind::Updated | DeltaKind::Replaced => {
                    match self.indexer.update(key, Arc::clone(&delta.object)) {
                        Some(old) => Notification::Update { old, new: delta.object },
                        None => Notification::Add(delta.object),
                    }
                }
            };
            trace!(informer = %self.name, key = %key, kind = %delta.kind, listeners = listeners.len(), "delta applied");
            for listener in listeners.iter() {
                listener.deliver(&note);
            }
        }
    }
}
