#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::channel::mpsc;
use futures::StreamExt;
use tern_core::{
    AuthorityError, ListOptions, ListerWatcher, ObjectList, Resource, WatchEvent, WatchOptions, WatchStream,
};
use tern_informer::{BackoffConfig, InformerConfig, ResourceEventHandler};

#[derive(Debug, Clone, PartialEq)]
pub struct Obj {
    pub ns: Option<String>,
    pub name: String,
    pub rv: String,
    pub labels: BTreeMap<String, String>,
}

impl Resource for Obj {
    fn name(&self) -> &str {
        &self.name
    }
    fn namespace(&self) -> Option<&str> {
        self.ns.as_deref()
    }
    fn resource_version(&self) -> Option<&str> {
        Some(&self.rv)
    }
    fn labels(&self) -> Option<&BTreeMap<String, String>> {
        Some(&self.labels)
    }
}

pub fn obj(name: &str, rv: &str) -> Obj {
    Obj { ns: None, name: name.to_string(), rv: rv.to_string(), labels: BTreeMap::new() }
}

pub fn labeled(name: &str, rv: &str, labels: &[(&str, &str)]) -> Obj {
    let mut o = obj(name, rv);
    o.labels = labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    o
}

pub type WatchTx = mpsc::UnboundedSender<Result<WatchEvent<Obj>, AuthorityError>>;

/// ListerWatcher that replays queued List responses and watch streams in order.
/// Once a queue runs dry, the next call parks forever.
#[derive(Default)]
pub struct Scripted {
    lists: Mutex<VecDeque<Result<ObjectList<Obj>, AuthorityError>>>,
    watches: Mutex<VecDeque<mpsc::UnboundedReceiver<Result<WatchEvent<Obj>, AuthorityError>>>>,
    pub list_calls: AtomicUsize,
    pub watch_opts: Mutex<Vec<WatchOptions>>,
}

impl Scripted {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_list(&self, items: Vec<Obj>, rv: &str) {
        self.lists
            .lock()
            .unwrap()
            .push_back(Ok(ObjectList { items, resource_version: rv.to_string() }));
    }

    pub fn push_list_error(&self, msg: &str) {
        self.lists.lock().unwrap().push_back(Err(AuthorityError::Request(msg.to_string())));
    }

    /// Queue a watch stream; events sent on the returned handle reach the reflector.
    /// Dropping the handle ends the stream.
    pub fn push_watch(&self) -> WatchTx {
        let (tx, rx) = mpsc::unbounded();
        self.watches.lock().unwrap().push_back(rx);
        tx
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn watch_versions(&self) -> Vec<String> {
        self.watch_opts.lock().unwrap().iter().map(|o| o.resource_version.clone()).collect()
    }
}

#[async_trait::async_trait]
impl ListerWatcher<Obj> for Scripted {
    async fn list(&self, _opts: &ListOptions) -> Result<ObjectList<Obj>, AuthorityError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.lists.lock().unwrap().pop_front();
        match next {
            Some(res) => res,
            None => futures::future::pending().await,
        }
    }

    async fn watch(&self, opts: &WatchOptions) -> Result<WatchStream<Obj>, AuthorityError> {
        self.watch_opts.lock().unwrap().push(opts.clone());
        let next = self.watches.lock().unwrap().pop_front();
        match next {
            Some(rx) => Ok(rx.boxed()),
            None => Ok(futures::stream::pending().boxed()),
        }
    }
}

pub fn config(name: &str) -> InformerConfig {
    InformerConfig::default().with_name(name).with_backoff(BackoffConfig {
        initial: Duration::from_millis(10),
        max: Duration::from_millis(50),
        factor: 2.0,
        reset_after: Duration::from_secs(60),
    })
}

/// Handler that records every callback as a compact string.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<String>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    fn push(&self, e: String) {
        self.events.lock().unwrap().push(e);
    }
}

impl ResourceEventHandler<Obj> for Arc<Recorder> {
    fn on_add(&self, obj: &Arc<Obj>) -> anyhow::Result<()> {
        self.push(format!("add:{}@{}", obj.name, obj.rv));
        Ok(())
    }

    fn on_update(&self, old: &Arc<Obj>, new: &Arc<Obj>) -> anyhow::Result<()> {
        self.push(format!("update:{}@{}->{}", new.name, old.rv, new.rv));
        Ok(())
    }

    fn on_delete(&self, obj: &Arc<Obj>) -> anyhow::Result<()> {
        self.push(format!("delete:{}@{}", obj.name, obj.rv));
        Ok(())
    }
}

/// Poll `cond` until it holds; panics after five seconds.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within 5s");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
