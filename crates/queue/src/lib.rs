//! Rudder work queue: a deduplicating FIFO of object keys with delayed
//! requeue and per-key exponential rate limiting.
//!
//! A key is in at most one of three places: the FIFO (enqueued), the
//! processing set, or nowhere. Adding a key that is being processed sets a
//! dirty bit so it is re-enqueued on `done`. This collapses bursts of updates
//! into at most one reconciliation past the current one and serializes work
//! per key without per-key locks.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tracing::debug;

use rudder_core::Key;

const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

struct State {
    order: VecDeque<Key>,
    enqueued: FxHashSet<Key>,
    processing: FxHashSet<Key>,
    dirty: FxHashSet<Key>,
    shutdown: bool,
}

struct Inner {
    name: String,
    state: Mutex<State>,
    wake: Notify,
    // Per-key failure counts driving the exponential backoff.
    requeues: Mutex<FxHashMap<Key, u32>>,
    base_delay: Duration,
    max_delay: Duration,
}

/// Cheaply cloneable handle; clones share the queue.
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl WorkQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_delays(name, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }

    /// Queue with a custom backoff window for rate-limited requeues.
    pub fn with_delays(name: impl Into<String>, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(State {
                    order: VecDeque::new(),
                    enqueued: FxHashSet::default(),
                    processing: FxHashSet::default(),
                    dirty: FxHashSet::default(),
                    shutdown: false,
                }),
                wake: Notify::new(),
                requeues: Mutex::new(FxHashMap::default()),
                base_delay,
                max_delay,
            }),
        }
    }

    /// Enqueue `key` unless it is already enqueued or being processed. A key
    /// added while processing is marked dirty and re-enqueued on [`done`].
    ///
    /// [`done`]: WorkQueue::done
    pub fn add(&self, key: impl Into<Key>) {
        let key = key.into();
        let mut st = self.inner.state.lock().unwrap();
        if st.shutdown {
            return;
        }
        if st.processing.contains(&key) {
            st.dirty.insert(key);
            counter!("queue_dedup_total", 1u64);
            return;
        }
        if !st.enqueued.insert(key.clone()) {
            counter!("queue_dedup_total", 1u64);
            return;
        }
        st.order.push_back(key);
        counter!("queue_adds_total", 1u64);
        drop(st);
        self.inner.wake.notify_one();
    }

    /// Pop the oldest key, moving it to the processing set. Blocks until an
    /// item is available; returns `None` once the queue has shut down.
    pub async fn get(&self) -> Option<Key> {
        loop {
            let notified = self.inner.wake.notified();
            tokio::pin!(notified);
            // Register interest before inspecting state so a wakeup between
            // the unlock and the await is not lost.
            notified.as_mut().enable();
            {
                let mut st = self.inner.state.lock().unwrap();
                if st.shutdown {
                    return None;
                }
                if let Some(key) = st.order.pop_front() {
                    st.enqueued.remove(&key);
                    st.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Release `key` from the processing set, re-enqueueing it if it went
    /// dirty while being processed.
    pub fn done(&self, key: &str) {
        let mut st = self.inner.state.lock().unwrap();
        st.processing.remove(key);
        if st.dirty.remove(key) && !st.shutdown && st.enqueued.insert(key.to_string()) {
            st.order.push_back(key.to_string());
            drop(st);
            self.inner.wake.notify_one();
        }
    }

    /// Schedule a deferred [`add`] after `delay`.
    ///
    /// [`add`]: WorkQueue::add
    pub fn add_after(&self, key: impl Into<Key>, delay: Duration) {
        let key = key.into();
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Schedule with the key's current backoff delay and bump its requeue
    /// count.
    pub fn add_rate_limited(&self, key: impl Into<Key>) {
        let key = key.into();
        let delay = self.next_delay(&key);
        debug!(queue = %self.inner.name, key = %key, delay_ms = delay.as_millis() as u64, "rate-limited requeue");
        counter!("queue_retries_total", 1u64);
        self.add_after(key, delay);
    }

    /// Requeue count accumulated for `key` since its last [`forget`].
    ///
    /// [`forget`]: WorkQueue::forget
    pub fn requeues(&self, key: &str) -> u32 {
        self.inner.requeues.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    /// Reset the rate-limit state for `key`.
    pub fn forget(&self, key: &str) {
        self.inner.requeues.lock().unwrap().remove(key);
    }

    /// Wake all blocked [`get`] callers and discard pending items. Keys
    /// already handed out still go through [`done`] but are not re-enqueued.
    ///
    /// [`get`]: WorkQueue::get
    /// [`done`]: WorkQueue::done
    pub fn shutdown(&self) {
        let mut st = self.inner.state.lock().unwrap();
        st.shutdown = true;
        st.order.clear();
        st.enqueued.clear();
        st.dirty.clear();
        drop(st);
        debug!(queue = %self.inner.name, "queue shut down");
        self.inner.wake.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().unwrap().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn next_delay(&self, key: &str) -> Duration {
        let mut rq = self.inner.requeues.lock().unwrap();
        let n = rq.entry(key.to_string()).or_insert(0);
        let exp = *n;
        *n += 1;
        let raw = self.inner.base_delay.as_secs_f64() * 2f64.powi(exp.min(62) as i32);
        Duration::from_secs_f64(raw.min(self.inner.max_delay.as_secs_f64()))
    }
}
