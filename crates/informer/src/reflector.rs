//! List → sync → watch loop feeding a [`DeltaQueue`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use futures::StreamExt;
use tern_core::{AuthorityError, Delta, DeltaKind, ListerWatcher, Resource, WatchEvent, WatchOptions};
use tern_store::DeltaQueue;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{Backoff, InformerConfig};

// A watch that closes this fast without delivering anything is treated as a failure.
const MIN_WATCH_DURATION: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReflectorState {
    Idle,
    Listing,
    Syncing,
    Watching,
}

enum CycleEnd {
    Stopped,
    StreamClosed,
}

// How far one List + Watch cycle got before it ended.
#[derive(Default)]
struct Progress {
    listed: bool,
    events: usize,
}

/// Drives List + Watch against the authority and pushes every change into the queue.
///
/// The reflector is the only producer of its queue. It never trusts a cursor
/// after the watch ends: every stream end or expiry goes back to a full List.
pub struct Reflector<K: Resource> {
    name: String,
    lw: Arc<dyn ListerWatcher<K>>,
    queue: Arc<DeltaQueue<K>>,
    config: InformerConfig,
    cursor: ArcSwap<String>,
    state: watch::Sender<ReflectorState>,
}

impl<K: Resource> Reflector<K> {
    pub fn new(lw: Arc<dyn ListerWatcher<K>>, queue: Arc<DeltaQueue<K>>, config: InformerConfig) -> Self {
        let (state, _) = watch::channel(ReflectorState::Idle);
        Self { name: config.name.clone(), lw, queue, config, cursor: ArcSwap::from_pointee(String::new()), state }
    }

    /// Version token of the last applied List or watch event; empty before the first List.
    pub fn last_sync_version(&self) -> String {
        self.cursor.load().as_ref().clone()
    }

    pub fn state(&self) -> watch::Receiver<ReflectorState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: ReflectorState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            trace!(reflector = %self.name, from = ?prev, to = ?next, "reflector state");
        }
    }

    /// Run until `stop` fires. Errors are retried with backoff and never end the loop.
    pub async fn run(&self, stop: CancellationToken) {
        info!(reflector = %self.name, "reflector started");
        let resync = self.spawn_resync(stop.child_token());
        let mut backoff = Backoff::new(self.config.backoff.clone());
        // set after an immediate relist on expiry; cleared once a watch delivers
        let mut expired_relist = false;
        while !stop.is_cancelled() {
            let started = Instant::now();
            let mut progress = Progress::default();
            let res = self.list_and_watch(&stop, &mut progress).await;
            if progress.events > 0 {
                expired_relist = false;
            }
            match res {
                Ok(CycleEnd::Stopped) => break,
                Ok(CycleEnd::StreamClosed) => {
                    metrics::counter!("reflector_relists_total", 1, "reason" => "closed");
                    debug!(reflector = %self.name, "watch closed; relisting");
                    if started.elapsed() >= backoff.reset_after() {
                        backoff.reset();
                    }
                }
                // a stale cursor on a working watch: one relist straight away
                Err(e) if e.is_expired() && progress.listed && !expired_relist => {
                    expired_relist = true;
                    metrics::counter!("reflector_relists_total", 1, "reason" => "expired");
                    info!(reflector = %self.name, error = %e, "cursor expired; relisting");
                    tokio::task::yield_now().await;
                }
                Err(e) => {
                    metrics::counter!("reflector_relists_total", 1, "reason" => "error");
                    if started.elapsed() >= backoff.reset_after() {
                        backoff.reset();
                    }
                    let delay = backoff.next_delay();
                    warn!(reflector = %self.name, error = %e, delay_ms = delay.as_millis() as u64, "list/watch failed; backing off");
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        if let Some(handle) = resync {
            handle.abort();
            let _ = handle.await;
        }
        self.set_state(ReflectorState::Idle);
        info!(reflector = %self.name, rv = %self.last_sync_version(), "reflector stopped");
    }

    fn spawn_resync(&self, stop: CancellationToken) -> Option<JoinHandle<()>> {
        let period = self.config.resync_period.filter(|p| !p.is_zero())?;
        let queue = Arc::clone(&self.queue);
        let name = self.name.clone();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let queued = queue.resync();
                        metrics::counter!("reflector_resyncs_total", 1);
                        debug!(reflector = %name, queued, "periodic resync");
                    }
                }
            }
        }))
    }

    async fn list_and_watch(&self, stop: &CancellationToken, progress: &mut Progress) -> Result<CycleEnd, AuthorityError> {
        self.set_state(ReflectorState::Listing);
        let t0 = Instant::now();
        let listed = tokio::select! {
            _ = stop.cancelled() => return Ok(CycleEnd::Stopped),
            res = self.lw.list(&self.config.list_options) => res,
        };
        let list = match listed {
            Ok(list) => list,
            Err(e) => {
                metrics::counter!("reflector_list_errors_total", 1);
                return Err(e);
            }
        };
        let count = list.items.len();
        let rv = list.resource_version;
        progress.listed = true;
        self.queue.replace(list.items, &rv);
        self.cursor.store(Arc::new(rv.clone()));
        metrics::counter!("reflector_lists_total", 1);
        metrics::histogram!("reflector_list_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(reflector = %self.name, count, rv = %rv, took_ms = %t0.elapsed().as_millis(), "list ok");

        self.set_state(ReflectorState::Syncing);
        tokio::select! {
            _ = stop.cancelled() => return Ok(CycleEnd::Stopped),
            _ = self.queue.wait_synced() => {}
        }

        self.set_state(ReflectorState::Watching);
        self.watch(stop, progress).await
    }

    async fn watch(&self, stop: &CancellationToken, progress: &mut Progress) -> Result<CycleEnd, AuthorityError> {
        let mut opts = WatchOptions::from_list(&self.config.list_options, self.last_sync_version());
        opts.timeout_secs = self.config.watch_timeout.map(|d| d.as_secs().min(u32::MAX as u64) as u32);
        opts.allow_bookmarks = self.config.allow_bookmarks;
        let mut stream = tokio::select! {
            _ = stop.cancelled() => return Ok(CycleEnd::Stopped),
            res = self.lw.watch(&opts) => res?,
        };
        debug!(reflector = %self.name, rv = %opts.resource_version, "watch opened");
        let started = Instant::now();
        loop {
            let next = tokio::select! {
                _ = stop.cancelled() => return Ok(CycleEnd::Stopped),
                next = stream.next() => next,
            };
            match next {
                Some(Ok(ev)) => {
                    progress.events += 1;
                    self.apply_event(ev);
                }
                Some(Err(e)) => return Err(e),
                None if progress.events == 0 && started.elapsed() < MIN_WATCH_DURATION => {
                    return Err(AuthorityError::Request("watch closed immediately without events".to_string()));
                }
                None => {
                    debug!(reflector = %self.name, events = progress.events, "watch stream ended");
                    return Ok(CycleEnd::StreamClosed);
                }
            }
        }
    }

    fn apply_event(&self, ev: WatchEvent<K>) {
        metrics::counter!("reflector_watch_events_total", 1, "kind" => ev.kind_str());
        let version = ev.version().filter(|v| !v.is_empty()).map(str::to_string);
        match ev {
            WatchEvent::Added(o) => self.queue.push(Delta::new(DeltaKind::Added, o)),
            WatchEvent::Updated(o) => self.queue.push(Delta::new(DeltaKind::Updated, o)),
            WatchEvent::Deleted(o) => self.queue.push(Delta::new(DeltaKind::Deleted, o)),
            WatchEvent::Bookmark(_) => trace!(reflector = %self.name, "bookmark"),
        }
        if let Some(v) = version {
            self.cursor.store(Arc::new(v));
        }
    }
}
