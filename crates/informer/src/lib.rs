//! Rudder informer: reflects a retriever's list+watch output into a keyed
//! in-memory store and emits per-object events, including periodic synthetic
//! resync events.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use rudder_core::{
    ClusterObject, Event, EventKind, Key, ListOptions, RetrieveError, Retriever, WatchEvent,
    WatchOptions,
};

/// Last observed snapshot per key. Writes come only from the informer task;
/// readers get a consistent `Arc` clone per call.
///
/// Deleted objects move into a tombstone side-map before the Deleted event is
/// emitted, so a worker reconciling the deletion can still resolve the final
/// snapshot after the key has left the main map.
pub struct Store<O> {
    objects: RwLock<FxHashMap<Key, Arc<O>>>,
    tombstones: Mutex<FxHashMap<Key, Arc<O>>>,
}

impl<O: ClusterObject> Store<O> {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(FxHashMap::default()),
            tombstones: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<O>> {
        self.objects.read().unwrap().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.read().unwrap().contains_key(key)
    }

    pub fn keys(&self) -> Vec<Key> {
        self.objects.read().unwrap().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.objects.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert or replace the snapshot for the object's key. A stale tombstone
    /// for a re-created key is discarded.
    pub fn insert(&self, object: Arc<O>) -> Key {
        let key = object.key();
        self.tombstones.lock().unwrap().remove(&key);
        self.objects.write().unwrap().insert(key.clone(), object);
        key
    }

    /// Drop the key from the live map, parking its final snapshot in the
    /// tombstone map.
    pub fn entomb(&self, key: &str, last: Arc<O>) {
        self.tombstones.lock().unwrap().insert(key.to_string(), last);
        self.objects.write().unwrap().remove(key);
    }

    /// Peek the tombstoned snapshot for a deleted key, if any.
    pub fn tombstone(&self, key: &str) -> Option<Arc<O>> {
        self.tombstones.lock().unwrap().get(key).cloned()
    }

    /// Take the tombstoned snapshot for a deleted key, if any.
    pub fn take_tombstone(&self, key: &str) -> Option<Arc<O>> {
        self.tombstones.lock().unwrap().remove(key)
    }

    pub fn clear_tombstone(&self, key: &str) {
        self.tombstones.lock().unwrap().remove(key);
    }
}

impl<O: ClusterObject> Default for Store<O> {
    fn default() -> Self {
        Self::new()
    }
}

fn watch_backoff_max() -> Duration {
    let secs = std::env::var("RUDDER_WATCH_BACKOFF_MAX_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(30);
    Duration::from_secs(secs.max(1))
}

/// Sleep that loses to shutdown. Returns false when the token fired.
async fn sleep_or_shutdown(shutdown: &CancellationToken, d: Duration) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(d) => true,
    }
}

/// Maintains the [`Store`] consistent with the server and forwards every
/// observation as an [`Event`] on the channel given at construction.
pub struct Informer<O: ClusterObject> {
    retriever: Arc<dyn Retriever<O>>,
    store: Arc<Store<O>>,
    events: mpsc::Sender<Event<O>>,
    resync_interval: Duration,
    cursor: String,
}

impl<O: ClusterObject> Informer<O> {
    pub fn new(
        retriever: Arc<dyn Retriever<O>>,
        store: Arc<Store<O>>,
        events: mpsc::Sender<Event<O>>,
        resync_interval: Duration,
    ) -> Self {
        Self {
            retriever,
            store,
            events,
            resync_interval,
            cursor: String::new(),
        }
    }

    /// Initial list: populate the store, record the list version and emit a
    /// synthetic Added for every listed object. Retries transport failures
    /// with backoff until the first list succeeds. Returns false if shutdown
    /// fired or the event channel closed before completion.
    pub async fn bootstrap(&mut self, shutdown: &CancellationToken) -> bool {
        let max_backoff = watch_backoff_max();
        let mut backoff = Duration::from_secs(1);
        loop {
            match self.retriever.list(ListOptions::default()).await {
                Ok(list) => {
                    info!(count = list.items.len(), version = %list.resource_version, "initial list complete");
                    self.cursor = list.resource_version;
                    for obj in list.items {
                        let obj = Arc::new(obj);
                        let key = self.store.insert(Arc::clone(&obj));
                        if !self.emit(EventKind::Added, key, obj).await {
                            return false;
                        }
                    }
                    return true;
                }
                Err(err) => {
                    warn!(error = %err, "initial list failed; backing off");
                    counter!("list_errors_total", 1u64);
                    if !sleep_or_shutdown(shutdown, backoff).await {
                        return false;
                    }
                    backoff = (backoff * 2).min(max_backoff);
                }
            }
        }
    }

    /// Steady-state loop: watch from the recorded cursor, apply each event to
    /// the store and forward it. Reconnects with exponential backoff on
    /// transport failures; relists from scratch when the server reports the
    /// version expired. Runs until shutdown.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let max_backoff = watch_backoff_max();
        let mut backoff = Duration::from_secs(1);
        let start = tokio::time::Instant::now() + self.resync_interval;
        let mut resync = tokio::time::interval_at(start, self.resync_interval);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let opts = WatchOptions {
                resource_version: self.cursor.clone(),
            };
            let mut stream = match self.retriever.watch(opts).await {
                Ok(s) => {
                    backoff = Duration::from_secs(1);
                    s
                }
                Err(RetrieveError::Expired(reason)) => {
                    warn!(reason = %reason, "watch expired on connect; relisting");
                    if !self.relist(&shutdown).await {
                        return;
                    }
                    continue;
                }
                Err(err) => {
                    warn!(error = %err, "watch connect failed; backing off");
                    counter!("watch_errors_total", 1u64);
                    if !sleep_or_shutdown(&shutdown, backoff).await {
                        return;
                    }
                    backoff = (backoff * 2).min(max_backoff);
                    continue;
                }
            };
            debug!(version = %self.cursor, "watch stream opened");

            let reconnect_backoff = loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = resync.tick() => {
                        if !self.resync().await {
                            return;
                        }
                    }
                    item = stream.recv() => match item {
                        None => {
                            warn!("watch stream ended");
                            break true;
                        }
                        Some(Ok(ev)) => {
                            if !self.apply(ev).await {
                                return;
                            }
                        }
                        Some(Err(RetrieveError::Expired(reason))) => {
                            warn!(reason = %reason, "watch stream expired; relisting");
                            if !self.relist(&shutdown).await {
                                return;
                            }
                            // Fresh cursor; reconnect without extra delay.
                            break false;
                        }
                        Some(Err(err)) => {
                            warn!(error = %err, "watch stream error; reconnecting");
                            counter!("watch_errors_total", 1u64);
                            break true;
                        }
                    }
                }
            };

            if reconnect_backoff {
                if !sleep_or_shutdown(&shutdown, backoff).await {
                    return;
                }
                backoff = (backoff * 2).min(max_backoff);
            }
            counter!("watch_restarts_total", 1u64);
        }
    }

    async fn apply(&mut self, ev: WatchEvent<O>) -> bool {
        match ev {
            WatchEvent::Added(o) => {
                self.cursor = o.resource_version().to_string();
                let obj = Arc::new(o);
                let key = self.store.insert(Arc::clone(&obj));
                self.emit(EventKind::Added, key, obj).await
            }
            WatchEvent::Modified(o) => {
                self.cursor = o.resource_version().to_string();
                let obj = Arc::new(o);
                let key = self.store.insert(Arc::clone(&obj));
                self.emit(EventKind::Updated, key, obj).await
            }
            WatchEvent::Deleted(o) => {
                self.cursor = o.resource_version().to_string();
                let obj = Arc::new(o);
                let key = obj.key();
                // Tombstone first: the key leaves the live map before the
                // event is visible, yet deletion workers still resolve it.
                self.store.entomb(&key, Arc::clone(&obj));
                self.emit(EventKind::Deleted, key, obj).await
            }
            WatchEvent::Bookmark { resource_version } => {
                self.cursor = resource_version;
                true
            }
        }
    }

    /// Synthesize a Sync event for every key currently in the store.
    async fn resync(&self) -> bool {
        let keys = self.store.keys();
        debug!(count = keys.len(), "resync tick");
        counter!("resync_total", 1u64);
        for key in keys {
            if let Some(obj) = self.store.get(&key) {
                if !self.emit(EventKind::Sync, key, obj).await {
                    return false;
                }
            }
        }
        true
    }

    /// Recovery after lost watch history: list from scratch, re-emit Added
    /// for everything that exists now and a Deleted for keys that vanished
    /// while we were blind.
    async fn relist(&mut self, shutdown: &CancellationToken) -> bool {
        counter!("relist_total", 1u64);
        let max_backoff = watch_backoff_max();
        let mut backoff = Duration::from_secs(1);
        let list = loop {
            match self.retriever.list(ListOptions::default()).await {
                Ok(l) => break l,
                Err(err) => {
                    warn!(error = %err, "relist failed; backing off");
                    counter!("list_errors_total", 1u64);
                    if !sleep_or_shutdown(shutdown, backoff).await {
                        return false;
                    }
                    backoff = (backoff * 2).min(max_backoff);
                }
            }
        };
        info!(count = list.items.len(), version = %list.resource_version, "relist complete");
        self.cursor = list.resource_version;

        let previous = self.store.keys();
        let mut fresh: FxHashSet<Key> = FxHashSet::default();
        for obj in list.items {
            let obj = Arc::new(obj);
            let key = self.store.insert(Arc::clone(&obj));
            fresh.insert(key.clone());
            if !self.emit(EventKind::Added, key, obj).await {
                return false;
            }
        }
        for key in previous {
            if !fresh.contains(&key) {
                if let Some(last) = self.store.get(&key) {
                    self.store.entomb(&key, Arc::clone(&last));
                    if !self.emit(EventKind::Deleted, key, last).await {
                        return false;
                    }
                }
            }
        }
        true
    }

    async fn emit(&self, kind: EventKind, key: Key, object: Arc<O>) -> bool {
        self.events.send(Event { kind, key, object }).await.is_ok()
    }
}
