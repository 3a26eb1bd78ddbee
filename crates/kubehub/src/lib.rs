//! Rudder kubehub: Kubernetes adapters for the controller framework, a
//! retriever over dynamic objects and a lease lock over
//! `coordination.k8s.io/v1` Leases.

#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, ListParams, PostParams, WatchParams};
use kube::core::{DynamicObject, ErrorResponse, GroupVersionKind, WatchEvent as KubeWatchEvent};
use kube::discovery::Scope;
use kube::Client;
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use rudder_core::{
    ClusterObject, EventStream, ListOptions, ObjectList, RetrieveError, Retriever, WatchEvent,
    WatchOptions,
};
use rudder_leader::{LeaseLock, LeaseRecord, LockError};

/// Newtype over [`DynamicObject`] carrying the identity surface the
/// framework needs.
#[derive(Clone, Debug)]
pub struct KubeObject(pub DynamicObject);

impl ClusterObject for KubeObject {
    fn namespace(&self) -> Option<&str> {
        self.0.metadata.namespace.as_deref()
    }

    fn name(&self) -> &str {
        self.0.metadata.name.as_deref().unwrap_or_default()
    }

    fn resource_version(&self) -> &str {
        self.0.metadata.resource_version.as_deref().unwrap_or_default()
    }
}

fn parse_gvk_key(key: &str) -> anyhow::Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok(GroupVersionKind {
            group: String::new(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        [group, version, kind] => Ok(GroupVersionKind {
            group: (*group).to_string(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

fn default_page_limit() -> u32 {
    std::env::var("RUDDER_LIST_PAGE_LIMIT")
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(500)
}

fn watch_channel_cap() -> usize {
    std::env::var("RUDDER_WATCH_QUEUE_CAP")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|cap| *cap > 0)
        .unwrap_or(1024)
}

fn classify_status(status: ErrorResponse) -> RetrieveError {
    if status.code == 410 || status.reason == "Expired" {
        RetrieveError::Expired(status.message)
    } else {
        RetrieveError::Transport(status.message)
    }
}

fn classify_error(err: kube::Error) -> RetrieveError {
    match err {
        kube::Error::Api(status) => classify_status(status),
        other => RetrieveError::Transport(other.to_string()),
    }
}

/// Retriever over one dynamic resource kind.
pub struct KubeRetriever {
    api: Api<DynamicObject>,
    page_limit: u32,
}

impl KubeRetriever {
    pub fn new(api: Api<DynamicObject>) -> Self {
        Self {
            api,
            page_limit: default_page_limit(),
        }
    }

    /// Resolve a `v1/Kind` or `group/v1/Kind` key against the server and
    /// build a retriever scoped to `namespace` (all namespaces when `None`
    /// or for cluster-scoped kinds).
    pub async fn for_gvk(
        client: Client,
        gvk_key: &str,
        namespace: Option<&str>,
    ) -> anyhow::Result<Self> {
        let gvk = parse_gvk_key(gvk_key)?;
        let (ar, caps) = kube::discovery::oneshot::pinned_kind(&client, &gvk).await?;
        let namespaced = matches!(caps.scope, Scope::Namespaced);
        info!(gvk = %gvk_key, ns = ?namespace, namespaced, "retriever resolved");
        let api: Api<DynamicObject> = if namespaced {
            match namespace {
                Some(ns) => Api::namespaced_with(client, ns, &ar),
                None => Api::all_with(client, &ar),
            }
        } else {
            Api::all_with(client, &ar)
        };
        Ok(Self::new(api))
    }
}

#[async_trait]
impl Retriever<KubeObject> for KubeRetriever {
    async fn list(&self, opts: ListOptions) -> Result<ObjectList<KubeObject>, RetrieveError> {
        let limit = if opts.page_limit > 0 {
            opts.page_limit
        } else {
            self.page_limit
        };
        let mut items = Vec::new();
        let mut resource_version = String::new();
        let mut continue_token: Option<String> = None;
        loop {
            let mut params = ListParams::default();
            if limit > 0 {
                params = params.limit(limit);
            }
            if let Some(ref token) = continue_token {
                params = params.continue_token(token);
            }
            let page = self.api.list(&params).await.map_err(classify_error)?;
            if let Some(rv) = page.metadata.resource_version.clone() {
                resource_version = rv;
            }
            continue_token = page.metadata.continue_.clone().filter(|t| !t.is_empty());
            items.extend(page.items.into_iter().map(KubeObject));
            counter!("snapshot_pages_total", 1u64);
            if continue_token.is_none() {
                break;
            }
            tokio::task::yield_now().await;
        }
        Ok(ObjectList {
            resource_version,
            items,
        })
    }

    async fn watch(&self, opts: WatchOptions) -> Result<EventStream<KubeObject>, RetrieveError> {
        let params = WatchParams::default();
        let stream = self
            .api
            .watch(&params, &opts.resource_version)
            .await
            .map_err(classify_error)?;
        debug!(version = %opts.resource_version, "watch opened");

        let (tx, rx) = mpsc::channel(watch_channel_cap());
        tokio::spawn(async move {
            futures::pin_mut!(stream);
            while let Some(item) = stream.next().await {
                let mapped = match item {
                    Ok(KubeWatchEvent::Added(o)) => Ok(WatchEvent::Added(KubeObject(o))),
                    Ok(KubeWatchEvent::Modified(o)) => Ok(WatchEvent::Modified(KubeObject(o))),
                    Ok(KubeWatchEvent::Deleted(o)) => Ok(WatchEvent::Deleted(KubeObject(o))),
                    Ok(KubeWatchEvent::Bookmark(b)) => Ok(WatchEvent::Bookmark {
                        resource_version: b.metadata.resource_version,
                    }),
                    Ok(KubeWatchEvent::Error(status)) => Err(classify_status(status)),
                    Err(err) => Err(classify_error(err)),
                };
                // A stream-level failure ends this watch; the informer
                // decides between backoff-reconnect and relist.
                let failed = mapped.is_err();
                if failed {
                    counter!("watch_stream_errors_total", 1u64);
                }
                if tx.send(mapped).await.is_err() || failed {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

/// Lease lock over a named `coordination.k8s.io/v1` Lease. The object's
/// resourceVersion is the compare-and-swap token.
pub struct KubeLeaseLock {
    api: Api<Lease>,
    name: String,
}

impl KubeLeaseLock {
    pub fn new(client: Client, namespace: &str, name: impl Into<String>) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.into(),
        }
    }

    fn to_lease(&self, record: &LeaseRecord) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                resource_version: (!record.version.is_empty()).then(|| record.version.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: (!record.holder_identity.is_empty())
                    .then(|| record.holder_identity.clone()),
                lease_duration_seconds: Some(record.lease_duration.as_secs() as i32),
                acquire_time: record.acquire_time.map(MicroTime),
                renew_time: record.renew_time.map(MicroTime),
                lease_transitions: Some(record.transitions as i32),
            }),
        }
    }
}

fn record_from_lease(lease: &Lease) -> LeaseRecord {
    let spec = lease.spec.clone().unwrap_or_default();
    LeaseRecord {
        holder_identity: spec.holder_identity.unwrap_or_default(),
        lease_duration: Duration::from_secs(spec.lease_duration_seconds.unwrap_or(0).max(0) as u64),
        acquire_time: spec.acquire_time.map(|t| t.0),
        renew_time: spec.renew_time.map(|t| t.0),
        transitions: spec.lease_transitions.unwrap_or(0).max(0) as u32,
        version: lease.metadata.resource_version.clone().unwrap_or_default(),
    }
}

fn classify_lock_error(err: kube::Error) -> LockError {
    match err {
        kube::Error::Api(status) if status.code == 409 => LockError::Conflict,
        other => LockError::Transport(anyhow::Error::new(other)),
    }
}

#[async_trait]
impl LeaseLock for KubeLeaseLock {
    async fn get(&self) -> Result<Option<LeaseRecord>, LockError> {
        match self.api.get_opt(&self.name).await {
            Ok(lease) => Ok(lease.as_ref().map(record_from_lease)),
            Err(err) => Err(LockError::Transport(anyhow::Error::new(err))),
        }
    }

    async fn create(&self, record: &LeaseRecord) -> Result<LeaseRecord, LockError> {
        self.api
            .create(&PostParams::default(), &self.to_lease(record))
            .await
            .map(|lease| record_from_lease(&lease))
            .map_err(classify_lock_error)
    }

    async fn update(&self, record: &LeaseRecord) -> Result<LeaseRecord, LockError> {
        if record.version.is_empty() {
            warn!(lease = %self.name, "refusing lease update without a resource version");
            return Err(LockError::Conflict);
        }
        self.api
            .replace(&self.name, &PostParams::default(), &self.to_lease(record))
            .await
            .map(|lease| record_from_lease(&lease))
            .map_err(classify_lock_error)
    }
}
