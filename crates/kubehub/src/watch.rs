//! Kube API server as a [`ListerWatcher`].

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use futures::{StreamExt, TryStreamExt};
use kube::api::{Api, ListParams, WatchParams};
use kube::core::WatchEvent as KubeEvent;
use serde::de::DeserializeOwned;
use tern_core::{AuthorityError, ListOptions, ListerWatcher, ObjectList, WatchEvent, WatchOptions, WatchStream};
use tracing::debug;

/// Rewrites the options of every List and Watch call (label/field selectors).
pub type TweakListOptions = Arc<dyn Fn(&mut ListOptions) + Send + Sync>;

// the API server rejects watch timeouts of 295s and above
const MAX_WATCH_TIMEOUT_SECS: u32 = 290;

/// List/Watch for one kube resource collection through a typed [`Api`].
pub struct KubeListerWatcher<K> {
    api: Api<K>,
    tweak: Option<TweakListOptions>,
}

impl<K> KubeListerWatcher<K>
where
    K: kube::Resource + Clone + DeserializeOwned + Debug,
{
    pub fn new(api: Api<K>) -> Self {
        Self { api, tweak: None }
    }

    pub fn with_tweak(mut self, tweak: TweakListOptions) -> Self {
        self.tweak = Some(tweak);
        self
    }

    fn tweaked(&self, label_selector: &Option<String>, field_selector: &Option<String>) -> ListOptions {
        let mut opts = ListOptions { label_selector: label_selector.clone(), field_selector: field_selector.clone() };
        if let Some(tweak) = &self.tweak {
            tweak(&mut opts);
        }
        opts
    }
}

pub(crate) fn list_params(opts: &ListOptions) -> ListParams {
    let mut lp = ListParams::default();
    if let Some(l) = opts.label_selector.as_deref().filter(|s| !s.is_empty()) {
        lp = lp.labels(l);
    }
    if let Some(f) = opts.field_selector.as_deref().filter(|s| !s.is_empty()) {
        lp = lp.fields(f);
    }
    lp
}

pub(crate) fn watch_params(opts: &ListOptions, timeout_secs: Option<u32>, bookmarks: bool) -> WatchParams {
    let mut wp = WatchParams::default();
    if let Some(l) = opts.label_selector.as_deref().filter(|s| !s.is_empty()) {
        wp = wp.labels(l);
    }
    if let Some(f) = opts.field_selector.as_deref().filter(|s| !s.is_empty()) {
        wp = wp.fields(f);
    }
    if let Some(secs) = timeout_secs {
        wp = wp.timeout(secs.clamp(1, MAX_WATCH_TIMEOUT_SECS));
    }
    if !bookmarks {
        wp = wp.disable_bookmarks();
    }
    wp
}

/// Map a kube client error; `410 Gone` means the resume cursor is too old.
pub fn authority_error(err: kube::Error) -> AuthorityError {
    match err {
        kube::Error::Api(resp) if resp.code == 410 => AuthorityError::Expired(resp.message),
        kube::Error::Api(resp) => AuthorityError::Request(format!("{} ({}): {}", resp.reason, resp.code, resp.message)),
        kube::Error::SerdeError(e) => AuthorityError::Decode(e.to_string()),
        other => AuthorityError::Request(other.to_string()),
    }
}

pub fn convert_event<K>(ev: KubeEvent<K>) -> Result<WatchEvent<K>, AuthorityError> {
    match ev {
        KubeEvent::Added(o) => Ok(WatchEvent::Added(o)),
        KubeEvent::Modified(o) => Ok(WatchEvent::Updated(o)),
        KubeEvent::Deleted(o) => Ok(WatchEvent::Deleted(o)),
        KubeEvent::Bookmark(b) => Ok(WatchEvent::Bookmark(b.metadata.resource_version)),
        KubeEvent::Error(resp) => Err(authority_error(kube::Error::Api(resp))),
    }
}

#[async_trait::async_trait]
impl<K> ListerWatcher<K> for KubeListerWatcher<K>
where
    K: kube::Resource + tern_core::Resource + Clone + DeserializeOwned + Debug,
{
    async fn list(&self, opts: &ListOptions) -> Result<ObjectList<K>, AuthorityError> {
        let opts = self.tweaked(&opts.label_selector, &opts.field_selector);
        let t0 = Instant::now();
        let res = self.api.list(&list_params(&opts)).await;
        metrics::histogram!("kubehub_request_ms", t0.elapsed().as_secs_f64() * 1000.0, "verb" => "list");
        let list = res.map_err(|e| {
            metrics::counter!("kubehub_request_errors_total", 1, "verb" => "list");
            authority_error(e)
        })?;
        let resource_version = list.metadata.resource_version.unwrap_or_default();
        debug!(count = list.items.len(), rv = %resource_version, took_ms = %t0.elapsed().as_millis(), "kube list ok");
        Ok(ObjectList { items: list.items, resource_version })
    }

    async fn watch(&self, opts: &WatchOptions) -> Result<WatchStream<K>, AuthorityError> {
        let tweaked = self.tweaked(&opts.label_selector, &opts.field_selector);
        let wp = watch_params(&tweaked, opts.timeout_secs, opts.allow_bookmarks);
        let stream = self.api.watch(&wp, &opts.resource_version).await.map_err(|e| {
            metrics::counter!("kubehub_request_errors_total", 1, "verb" => "watch");
            authority_error(e)
        })?;
        debug!(rv = %opts.resource_version, timeout = ?wp.timeout, "kube watch opened");
        Ok(stream.map_err(authority_error).and_then(|ev| futures::future::ready(convert_event(ev))).boxed())
    }
}
