//! Rudder core types: object identity, events, and the seams between the
//! retriever, the engine, and the leader elector.

#![forbid(unsafe_code)]

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Key identifying an object within a single resource kind: `ns/name`, or
/// plain `name` for cluster-scoped objects.
pub type Key = String;

/// Minimal identity surface the framework needs from a cluster resource.
pub trait ClusterObject: Clone + Send + Sync + 'static {
    fn namespace(&self) -> Option<&str>;
    fn name(&self) -> &str;
    /// Server-assigned, monotonically increasing version string.
    fn resource_version(&self) -> &str;

    fn key(&self) -> Key {
        match self.namespace() {
            Some(ns) => format!("{}/{}", ns, self.name()),
            None => self.name().to_string(),
        }
    }
}

/// Kind of a local event handed from the informer to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Added,
    Updated,
    Deleted,
    /// Synthesized by the resync timer, never sourced from the server.
    Sync,
}

/// A local per-object event. Deleted events carry the last known snapshot.
#[derive(Debug, Clone)]
pub struct Event<O> {
    pub kind: EventKind,
    pub key: Key,
    pub object: Arc<O>,
}

/// Errors surfaced by a retriever.
#[derive(Debug, thiserror::Error)]
pub enum RetrieveError {
    /// Transient I/O failure; the caller reconnects with backoff.
    #[error("transport: {0}")]
    Transport(String),
    /// The server lost watch history for the requested version; the caller
    /// must drop its state and relist from scratch.
    #[error("resource version expired: {0}")]
    Expired(String),
}

/// Server-sent change events as read off a watch stream.
#[derive(Debug, Clone)]
pub enum WatchEvent<O> {
    Added(O),
    Modified(O),
    Deleted(O),
    /// Advances the resource-version cursor without an object payload.
    Bookmark { resource_version: String },
}

/// Item on the watch channel: an event or a stream-level failure.
pub type WatchItem<O> = Result<WatchEvent<O>, RetrieveError>;

/// Long-lived change stream produced by [`Retriever::watch`].
pub type EventStream<O> = mpsc::Receiver<WatchItem<O>>;

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// Server-side page size; 0 disables paging.
    pub page_limit: u32,
}

#[derive(Debug, Clone, Default)]
pub struct WatchOptions {
    /// Version to resume from, as returned by the last list or bookmark.
    pub resource_version: String,
}

/// A consistent snapshot of a resource kind at one version.
#[derive(Debug, Clone)]
pub struct ObjectList<O> {
    pub resource_version: String,
    pub items: Vec<O>,
}

/// List + watch pair over one resource kind.
#[async_trait]
pub trait Retriever<O: ClusterObject>: Send + Sync {
    async fn list(&self, opts: ListOptions) -> Result<ObjectList<O>, RetrieveError>;
    async fn watch(&self, opts: WatchOptions) -> Result<EventStream<O>, RetrieveError>;
}

/// User reconciliation logic. Invoked with the current cached snapshot for a
/// key; `None` is the tombstone for a deletion whose snapshot is gone.
/// Implementations must be idempotent and level-driven: the event that
/// triggered the invocation is never exposed.
#[async_trait]
pub trait Handler<O: ClusterObject>: Send + Sync {
    async fn handle(&self, ctx: CancellationToken, object: Option<Arc<O>>) -> anyhow::Result<()>;
}

/// Adapts an async closure into a [`Handler`].
pub fn handler_fn<F>(f: F) -> HandlerFn<F> {
    HandlerFn(f)
}

pub struct HandlerFn<F>(F);

#[async_trait]
impl<O, F, Fut> Handler<O> for HandlerFn<F>
where
    O: ClusterObject,
    F: Fn(CancellationToken, Option<Arc<O>>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, ctx: CancellationToken, object: Option<Arc<O>>) -> anyhow::Result<()> {
        (self.0)(ctx, object).await
    }
}

/// Start-signal capability the engine composes with instead of owning an
/// elector. Implementations block until leadership is held, then hand back a
/// token that is cancelled if leadership is later lost. `None` means the
/// shutdown token fired before acquisition.
#[async_trait]
pub trait LeaderGate: Send + Sync {
    async fn acquired(&self, shutdown: &CancellationToken) -> Option<CancellationToken>;
}
