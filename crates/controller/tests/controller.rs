#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use rudder_controller::{Config, ConfigError, Controller};
use rudder_core::{
    handler_fn, ClusterObject, EventStream, Handler, ListOptions, ObjectList, RetrieveError,
    Retriever, WatchEvent, WatchItem, WatchOptions,
};
use rudder_leader::{Elector, LeaseLock, LeaseRecord, LockConfig, MemoryLeaseLock};

#[derive(Clone, Debug, PartialEq)]
struct Obj {
    name: String,
    rv: String,
}

impl ClusterObject for Obj {
    fn namespace(&self) -> Option<&str> {
        None
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn resource_version(&self) -> &str {
        &self.rv
    }
}

fn namespaces(prefix: &str, n: usize) -> Vec<Obj> {
    (0..n)
        .map(|i| Obj {
            name: format!("{prefix}-{i}"),
            rv: i.to_string(),
        })
        .collect()
}

/// Retriever driven by the test: scripted lists, hand-fed watch streams.
#[derive(Default)]
struct FakeRetriever {
    lists: Mutex<VecDeque<ObjectList<Obj>>>,
    last_list: Mutex<Option<ObjectList<Obj>>>,
    senders: Mutex<Vec<mpsc::Sender<WatchItem<Obj>>>>,
}

impl FakeRetriever {
    fn with_items(items: Vec<Obj>) -> Arc<Self> {
        let fake = Self::default();
        fake.lists.lock().unwrap().push_back(ObjectList {
            resource_version: "1".into(),
            items,
        });
        Arc::new(fake)
    }

    fn as_retriever(self: &Arc<Self>) -> Arc<dyn Retriever<Obj>> {
        Arc::clone(self) as Arc<dyn Retriever<Obj>>
    }

    fn watch_calls(&self) -> usize {
        self.senders.lock().unwrap().len()
    }

    async fn send(&self, item: WatchItem<Obj>) {
        let tx = self
            .senders
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no open watch stream");
        tx.send(item).await.expect("watch stream closed");
    }
}

#[async_trait]
impl Retriever<Obj> for FakeRetriever {
    async fn list(&self, _opts: ListOptions) -> Result<ObjectList<Obj>, RetrieveError> {
        if let Some(list) = self.lists.lock().unwrap().pop_front() {
            *self.last_list.lock().unwrap() = Some(list.clone());
            return Ok(list);
        }
        Ok(self
            .last_list
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| ObjectList {
                resource_version: "0".into(),
                items: Vec::new(),
            }))
    }

    async fn watch(&self, _opts: WatchOptions) -> Result<EventStream<Obj>, RetrieveError> {
        let (tx, rx) = mpsc::channel(256);
        self.senders.lock().unwrap().push(tx);
        Ok(rx)
    }
}

/// Counts invocations, total and per key.
#[derive(Default)]
struct Counts {
    total: AtomicUsize,
    per_key: Mutex<HashMap<String, usize>>,
}

impl Counts {
    fn record(&self, key: &str) {
        self.total.fetch_add(1, Ordering::SeqCst);
        *self.per_key.lock().unwrap().entry(key.to_string()).or_insert(0) += 1;
    }

    fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    fn for_key(&self, key: &str) -> usize {
        self.per_key.lock().unwrap().get(key).copied().unwrap_or(0)
    }
}

fn counting_handler(counts: Arc<Counts>, fail: bool) -> Arc<dyn Handler<Obj>> {
    Arc::new(handler_fn(
        move |_ctx: CancellationToken, obj: Option<Arc<Obj>>| {
            let counts = Arc::clone(&counts);
            async move {
                let key = obj.map(|o| o.key()).unwrap_or_default();
                counts.record(&key);
                if fail {
                    anyhow::bail!("wanted error");
                }
                Ok(())
            }
        },
    ))
}

async fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

#[test]
fn config_validation_fails_fast() {
    let retriever = FakeRetriever::with_items(Vec::new());
    let counts = Arc::new(Counts::default());

    let cfg = Config::new("", retriever.as_retriever(), counting_handler(counts.clone(), false));
    assert!(matches!(Controller::new(cfg), Err(ConfigError::MissingName)));

    let mut cfg = Config::new("test", retriever.as_retriever(), counting_handler(counts.clone(), false));
    cfg.concurrent_workers = 0;
    assert!(matches!(Controller::new(cfg), Err(ConfigError::NoWorkers)));

    let mut cfg = Config::new("test", retriever.as_retriever(), counting_handler(counts, false));
    cfg.resync_interval = Duration::ZERO;
    assert!(matches!(Controller::new(cfg), Err(ConfigError::ZeroResync)));
}

// Listing N objects drives exactly one reconciliation per object.
#[tokio::test(flavor = "multi_thread")]
async fn fan_out_reconciles_every_listed_object() {
    let retriever = FakeRetriever::with_items(namespaces("testing", 10));
    let counts = Arc::new(Counts::default());
    let cfg = Config::new("test", retriever.as_retriever(), counting_handler(counts.clone(), false));
    let controller = Controller::new(cfg).unwrap();

    let shutdown = CancellationToken::new();
    let run = tokio::spawn(controller.run(shutdown.clone()));

    assert!(wait_until(Duration::from_secs(2), || counts.total() == 10).await);
    // Settle: no duplicate reconciliations show up.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(counts.total(), 10);
    for i in 0..10 {
        assert_eq!(counts.for_key(&format!("testing-{i}")), 1);
    }

    shutdown.cancel();
    run.await.unwrap();
}

// A permanently failing handler gets 1 + retries attempts per key, then the
// key is dropped without surfacing an error.
#[tokio::test(flavor = "multi_thread")]
async fn failing_handler_retried_then_dropped() {
    let retriever = FakeRetriever::with_items(namespaces("testing", 11));
    let counts = Arc::new(Counts::default());
    let mut cfg = Config::new("test", retriever.as_retriever(), counting_handler(counts.clone(), true));
    cfg.processing_job_retries = 3;
    let controller = Controller::new(cfg).unwrap();

    let shutdown = CancellationToken::new();
    let run = tokio::spawn(controller.run(shutdown.clone()));

    // 11 keys x (1 + 3) attempts.
    assert!(wait_until(Duration::from_secs(3), || counts.total() == 44).await);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(counts.total(), 44);
    for i in 0..11 {
        assert_eq!(counts.for_key(&format!("testing-{i}")), 4);
    }

    shutdown.cancel();
    run.await.unwrap();
}

struct SharedLock(Arc<MemoryLeaseLock>);

#[async_trait]
impl LeaseLock for SharedLock {
    async fn get(&self) -> Result<Option<LeaseRecord>, rudder_leader::LockError> {
        self.0.get().await
    }
    async fn create(&self, record: &LeaseRecord) -> Result<LeaseRecord, rudder_leader::LockError> {
        self.0.create(record).await
    }
    async fn update(&self, record: &LeaseRecord) -> Result<LeaseRecord, rudder_leader::LockError> {
        self.0.update(record).await
    }
}

// Three replicas over one lease: only the leader's handler sees events.
#[tokio::test(flavor = "multi_thread")]
async fn leader_election_gates_replicas() {
    let lease_cfg = LockConfig {
        lease_duration: Duration::from_secs(9999),
        renew_deadline: Duration::from_secs(9998),
        retry_period: Duration::from_secs(500),
    };
    let lock = Arc::new(MemoryLeaseLock::new());
    let retriever = FakeRetriever::with_items(namespaces("testing", 5));
    let shutdown = CancellationToken::new();

    let mut runs = Vec::new();
    let mut counters = Vec::new();
    for i in 0..3 {
        let counts = Arc::new(Counts::default());
        let elector =
            Elector::new("test", SharedLock(Arc::clone(&lock)), lease_cfg).unwrap();
        let mut cfg = Config::new(
            format!("test-{i}"),
            retriever.as_retriever(),
            counting_handler(counts.clone(), false),
        );
        cfg.leader_elector = Some(Arc::new(elector));
        let controller = Controller::new(cfg).unwrap();
        runs.push(tokio::spawn(controller.run(shutdown.clone())));
        counters.push(counts);
        if i == 0 {
            // Let the first replica win the campaign.
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    assert!(wait_until(Duration::from_secs(2), || counters[0].total() == 5).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(counters[0].total(), 5);
    assert_eq!(counters[1].total(), 0);
    assert_eq!(counters[2].total(), 0);

    shutdown.cancel();
    for run in runs {
        run.await.unwrap();
    }
}

// A burst of updates for a key mid-reconciliation collapses into exactly one
// follow-up reconciliation.
#[tokio::test(flavor = "multi_thread")]
async fn update_burst_collapses_to_one_followup() {
    let retriever = FakeRetriever::with_items(namespaces("testing", 1));
    let counts = Arc::new(Counts::default());
    let handler: Arc<dyn Handler<Obj>> = {
        let counts = Arc::clone(&counts);
        Arc::new(handler_fn(
            move |_ctx: CancellationToken, obj: Option<Arc<Obj>>| {
                let counts = Arc::clone(&counts);
                async move {
                    counts.record(&obj.map(|o| o.key()).unwrap_or_default());
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    Ok::<_, anyhow::Error>(())
                }
            },
        ))
    };
    let cfg = Config::new("test", retriever.as_retriever(), handler);
    let controller = Controller::new(cfg).unwrap();

    let shutdown = CancellationToken::new();
    let run = tokio::spawn(controller.run(shutdown.clone()));

    // First reconciliation is sleeping; flood the watch with updates.
    assert!(wait_until(Duration::from_secs(2), || counts.total() == 1).await);
    assert!(wait_until(Duration::from_secs(2), || retriever.watch_calls() == 1).await);
    for rv in 0..50 {
        retriever
            .send(Ok(WatchEvent::Modified(Obj {
                name: "testing-0".into(),
                rv: format!("burst-{rv}"),
            })))
            .await;
    }

    assert!(wait_until(Duration::from_secs(2), || counts.total() == 2).await);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(counts.total(), 2);

    shutdown.cancel();
    run.await.unwrap();
}

// With no watch traffic, resync keeps re-driving reconciliation.
#[tokio::test(flavor = "multi_thread")]
async fn resync_drives_convergence() {
    let retriever = FakeRetriever::with_items(namespaces("testing", 1));
    let counts = Arc::new(Counts::default());
    let mut cfg = Config::new("test", retriever.as_retriever(), counting_handler(counts.clone(), false));
    cfg.resync_interval = Duration::from_millis(100);
    let controller = Controller::new(cfg).unwrap();

    let shutdown = CancellationToken::new();
    let run = tokio::spawn(controller.run(shutdown.clone()));

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(
        counts.total() >= 9,
        "expected at least 9 reconciliations, got {}",
        counts.total()
    );

    shutdown.cancel();
    run.await.unwrap();
}

// Cancellation drains workers cooperatively; nothing runs after Run returns.
#[tokio::test(flavor = "multi_thread")]
async fn graceful_shutdown_stops_reconciliation() {
    let retriever = FakeRetriever::with_items(namespaces("testing", 3));
    let counts = Arc::new(Counts::default());
    let handler: Arc<dyn Handler<Obj>> = {
        let counts = Arc::clone(&counts);
        Arc::new(handler_fn(
            move |_ctx: CancellationToken, obj: Option<Arc<Obj>>| {
                let counts = Arc::clone(&counts);
                async move {
                    counts.record(&obj.map(|o| o.key()).unwrap_or_default());
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok::<_, anyhow::Error>(())
                }
            },
        ))
    };
    let cfg = Config::new("test", retriever.as_retriever(), handler);
    let controller = Controller::new(cfg).unwrap();

    let shutdown = CancellationToken::new();
    let run = tokio::spawn(controller.run(shutdown.clone()));

    assert!(wait_until(Duration::from_secs(2), || counts.total() >= 1).await);
    let cancelled_at = Instant::now();
    shutdown.cancel();
    run.await.unwrap();
    assert!(
        cancelled_at.elapsed() < Duration::from_secs(1),
        "run must return within one drain window"
    );

    let after_return = counts.total();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(counts.total(), after_return);
}
