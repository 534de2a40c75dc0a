//! One shared informer per resource type.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::join_all;
use tern_core::Resource;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{InformerConfig, SharedIndexInformer};

#[async_trait::async_trait]
trait InformerControl: Send + Sync {
    fn name(&self) -> &str;
    fn spawn(&self, stop: CancellationToken) -> JoinHandle<()>;
    async fn wait_for_sync(&self, stop: &CancellationToken) -> bool;
}

#[async_trait::async_trait]
impl<K: Resource> InformerControl for Arc<SharedIndexInformer<K>> {
    fn name(&self) -> &str {
        SharedIndexInformer::<K>::name(&**self)
    }

    fn spawn(&self, stop: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run(stop))
    }

    async fn wait_for_sync(&self, stop: &CancellationToken) -> bool {
        SharedIndexInformer::<K>::wait_for_sync(&**self, stop).await
    }
}

struct Entry {
    informer: Arc<dyn Any + Send + Sync>,
    control: Arc<dyn InformerControl>,
    started: bool,
}

/// Hands out one [`SharedIndexInformer`] per resource type so that every
/// consumer of a type shares one List/Watch connection and one cache.
pub struct InformerFactory {
    defaults: InformerConfig,
    informers: Mutex<HashMap<TypeId, Entry>>,
}

impl InformerFactory {
    pub fn new(defaults: InformerConfig) -> Self {
        Self { defaults, informers: Mutex::new(HashMap::new()) }
    }

    pub fn defaults(&self) -> &InformerConfig {
        &self.defaults
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TypeId, Entry>> {
        self.informers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the informer for `K`, building it with `build` on first use.
    pub fn informer_for<K, F>(&self, build: F) -> Arc<SharedIndexInformer<K>>
    where
        K: Resource,
        F: FnOnce(&InformerConfig) -> SharedIndexInformer<K>,
    {
        let mut map = self.lock();
        if let Some(existing) = map.get(&TypeId::of::<K>()) {
            if let Ok(informer) = Arc::clone(&existing.informer).downcast::<SharedIndexInformer<K>>() {
                return informer;
            }
        }
        let informer = Arc::new(build(&self.defaults));
        debug!(informer = %informer.name(), "informer created");
        map.insert(
            TypeId::of::<K>(),
            Entry {
                informer: Arc::clone(&informer) as Arc<dyn Any + Send + Sync>,
                control: Arc::new(Arc::clone(&informer)),
                started: false,
            },
        );
        informer
    }

    /// Spawn every informer that has not been started yet.
    pub fn start(&self, stop: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut map = self.lock();
        let mut handles = Vec::new();
        for entry in map.values_mut().filter(|e| !e.started) {
            entry.started = true;
            info!(informer = %entry.control.name(), "starting informer");
            handles.push(entry.control.spawn(stop.clone()));
        }
        handles
    }

    /// Wait until every started informer has synced. Returns `(name, synced)` pairs.
    pub async fn wait_for_cache_sync(&self, stop: &CancellationToken) -> Vec<(String, bool)> {
        let controls: Vec<(String, Arc<dyn InformerControl>)> = {
            let map = self.lock();
            map.values()
                .filter(|e| e.started)
                .map(|e| (e.control.name().to_string(), Arc::clone(&e.control)))
                .collect()
        };
        let waits = controls.iter().map(|(_, c)| c.wait_for_sync(stop));
        let results = join_all(waits).await;
        controls.into_iter().map(|(name, _)| name).zip(results).collect()
    }
}
