//! PodNetwork informer and lister constructors.

use std::sync::Arc;
use std::time::Duration;

use kube::{Api, Client};
use tern_core::LabelSelector;
use tern_informer::{InformerConfig, InformerFactory, SharedIndexInformer};
use tern_store::{Indexer, Indexers, Lister};

use crate::{KubeListerWatcher, PodNetwork, TweakListOptions};

const INFORMER_NAME: &str = "podnetworks";

/// Standalone PodNetwork informer. Prefer [`PodNetworkInformer::from_factory`]
/// so that every consumer shares one watch connection and one cache.
pub fn new_pod_network_informer(
    client: Client,
    resync_period: Option<Duration>,
    indexers: Indexers<PodNetwork>,
) -> SharedIndexInformer<PodNetwork> {
    new_filtered_pod_network_informer(client, resync_period, indexers, None)
}

/// Like [`new_pod_network_informer`], with `tweak` applied to every List and Watch.
pub fn new_filtered_pod_network_informer(
    client: Client,
    resync_period: Option<Duration>,
    indexers: Indexers<PodNetwork>,
    tweak: Option<TweakListOptions>,
) -> SharedIndexInformer<PodNetwork> {
    let config = InformerConfig::default().with_resync(resync_period);
    pod_network_informer_with_config(client, config, indexers, tweak)
}

/// Fully configurable form used by the constructors above.
pub fn pod_network_informer_with_config(
    client: Client,
    config: InformerConfig,
    indexers: Indexers<PodNetwork>,
    tweak: Option<TweakListOptions>,
) -> SharedIndexInformer<PodNetwork> {
    let api: Api<PodNetwork> = Api::all(client);
    let mut lw = KubeListerWatcher::new(api);
    if let Some(tweak) = tweak {
        lw = lw.with_tweak(tweak);
    }
    let config = if config.name == InformerConfig::default().name { config.with_name(INFORMER_NAME) } else { config };
    SharedIndexInformer::new(Arc::new(lw), indexers, config)
}

/// Shared PodNetwork informer plus its lister.
#[derive(Clone)]
pub struct PodNetworkInformer {
    informer: Arc<SharedIndexInformer<PodNetwork>>,
}

impl PodNetworkInformer {
    /// Reuse the factory's PodNetwork informer, creating it (with the namespace
    /// index and the factory defaults) on first use.
    pub fn from_factory(factory: &InformerFactory, client: Client, tweak: Option<TweakListOptions>) -> Self {
        let informer = factory.informer_for(|defaults| {
            pod_network_informer_with_config(client, defaults.clone(), Indexers::namespaced(), tweak)
        });
        Self { informer }
    }

    pub fn informer(&self) -> Arc<SharedIndexInformer<PodNetwork>> {
        Arc::clone(&self.informer)
    }

    pub fn lister(&self) -> PodNetworkLister {
        PodNetworkLister::new(self.informer.indexer())
    }
}

/// Read-only PodNetwork lookups from the informer cache.
#[derive(Clone)]
pub struct PodNetworkLister {
    inner: Lister<PodNetwork>,
}

impl PodNetworkLister {
    pub fn new(indexer: Arc<Indexer<PodNetwork>>) -> Self {
        Self { inner: Lister::new(indexer) }
    }

    pub fn get(&self, name: &str) -> Option<Arc<PodNetwork>> {
        self.inner.get(name)
    }

    /// Matching networks, ordered by name.
    pub fn list(&self, selector: &LabelSelector) -> Vec<Arc<PodNetwork>> {
        let mut out = self.inner.list_selected(selector);
        out.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tern_store::Store;

    use crate::PodNetworkSpec;

    fn pn(name: &str, tier: &str) -> PodNetwork {
        let mut p = PodNetwork::new(name, PodNetworkSpec::default());
        p.metadata.labels = Some(BTreeMap::from([("tier".to_string(), tier.to_string())]));
        p.metadata.resource_version = Some("1".to_string());
        p
    }

    #[test]
    fn lister_gets_by_name_and_filters_by_label() {
        let indexer = Arc::new(Indexer::new(Indexers::namespaced()));
        for p in [pn("zeta", "fast"), pn("alpha", "fast"), pn("mid", "slow")] {
            indexer.add(&tern_core::Resource::key(&p), Arc::new(p));
        }
        let lister = PodNetworkLister::new(indexer);
        assert_eq!(lister.get("mid").map(|p| p.spec.enabled), Some(true));
        assert!(lister.get("missing").is_none());

        let fast: LabelSelector = "tier=fast".parse().unwrap();
        let names: Vec<_> = lister.list(&fast).iter().filter_map(|p| p.metadata.name.clone()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        assert_eq!(lister.list(&LabelSelector::everything()).len(), 3);
    }
}
