//! Rudder leader election: single-writer mutual exclusion over a named lease
//! record with compare-and-swap semantics, gating engine start across
//! replicas.
//!
//! All expiry comparisons use this process's clock; timestamps written by
//! other holders are only read back for the record we compare-and-swap
//! against. Tolerating skew is the job of the `LockConfig` invariant
//! (`retry_period < renew_deadline < lease_duration`).

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use rudder_core::LeaderGate;

/// Timing knobs for the election protocol.
#[derive(Debug, Clone, Copy)]
pub struct LockConfig {
    /// How long a lease stays valid without renewal.
    pub lease_duration: Duration,
    /// How long the holder keeps retrying a failing renewal before yielding.
    pub renew_deadline: Duration,
    /// Probe and renewal cadence.
    pub retry_period: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
        }
    }
}

impl LockConfig {
    pub fn validate(&self) -> Result<(), ElectorError> {
        if self.retry_period.is_zero() {
            return Err(ElectorError::Config("retry_period must be positive".into()));
        }
        if self.retry_period >= self.renew_deadline || self.renew_deadline >= self.lease_duration {
            return Err(ElectorError::Config(
                "require retry_period < renew_deadline < lease_duration".into(),
            ));
        }
        Ok(())
    }
}

/// A lease as stored in the cluster. `version` is the backing store's
/// compare-and-swap token and is never interpreted here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    pub holder_identity: String,
    pub lease_duration: Duration,
    pub acquire_time: Option<DateTime<Utc>>,
    pub renew_time: Option<DateTime<Utc>>,
    pub transitions: u32,
    pub version: String,
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// The record changed underneath us; re-read and retry.
    #[error("lease version conflict")]
    Conflict,
    #[error("lease transport: {0}")]
    Transport(#[source] anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ElectorError {
    #[error("invalid lock config: {0}")]
    Config(String),
}

/// Storage backing a lease. Implementations must provide compare-and-swap
/// updates keyed on [`LeaseRecord::version`].
#[async_trait]
pub trait LeaseLock: Send + Sync + 'static {
    async fn get(&self) -> Result<Option<LeaseRecord>, LockError>;
    /// Create the lease; [`LockError::Conflict`] if it already exists.
    async fn create(&self, record: &LeaseRecord) -> Result<LeaseRecord, LockError>;
    /// Replace the lease iff `record.version` still matches the stored one.
    async fn update(&self, record: &LeaseRecord) -> Result<LeaseRecord, LockError>;
}

#[derive(Default)]
struct MemoryLease {
    record: Option<LeaseRecord>,
    next_version: u64,
}

/// In-process [`LeaseLock`]. Useful for single-process deployments and as the
/// test double shared by multiple electors.
#[derive(Default)]
pub struct MemoryLeaseLock {
    inner: Mutex<MemoryLease>,
}

impl MemoryLeaseLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaseLock for MemoryLeaseLock {
    async fn get(&self) -> Result<Option<LeaseRecord>, LockError> {
        Ok(self.inner.lock().unwrap().record.clone())
    }

    async fn create(&self, record: &LeaseRecord) -> Result<LeaseRecord, LockError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.record.is_some() {
            return Err(LockError::Conflict);
        }
        inner.next_version += 1;
        let mut stored = record.clone();
        stored.version = inner.next_version.to_string();
        inner.record = Some(stored.clone());
        Ok(stored)
    }

    async fn update(&self, record: &LeaseRecord) -> Result<LeaseRecord, LockError> {
        let mut inner = self.inner.lock().unwrap();
        match &inner.record {
            Some(current) if current.version == record.version => {
                inner.next_version += 1;
                let mut stored = record.clone();
                stored.version = inner.next_version.to_string();
                inner.record = Some(stored.clone());
                Ok(stored)
            }
            _ => Err(LockError::Conflict),
        }
    }
}

/// Single-writer elector over one lease. Cheap to clone; clones share the
/// lock handle.
pub struct Elector<L> {
    name: String,
    identity: String,
    cfg: LockConfig,
    lock: Arc<L>,
}

impl<L> Clone for Elector<L> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            identity: self.identity.clone(),
            cfg: self.cfg,
            lock: Arc::clone(&self.lock),
        }
    }
}

impl<L: LeaseLock> Elector<L> {
    pub fn new(name: impl Into<String>, lock: L, cfg: LockConfig) -> Result<Self, ElectorError> {
        cfg.validate()?;
        let name = name.into();
        let identity = format!("{}-{}", name, uuid::Uuid::new_v4());
        Ok(Self {
            name,
            identity,
            cfg,
            lock: Arc::new(lock),
        })
    }

    /// Replace the generated identity, e.g. with a pod name.
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    fn expired(&self, record: &LeaseRecord, now: DateTime<Utc>) -> bool {
        match record.renew_time {
            Some(renewed) => {
                let ttl = chrono::Duration::milliseconds(record.lease_duration.as_millis() as i64);
                now > renewed + ttl
            }
            None => true,
        }
    }

    fn fresh_record(&self, now: DateTime<Utc>, transitions: u32) -> LeaseRecord {
        LeaseRecord {
            holder_identity: self.identity.clone(),
            lease_duration: self.cfg.lease_duration,
            acquire_time: Some(now),
            renew_time: Some(now),
            transitions,
            version: String::new(),
        }
    }

    /// One acquisition probe. `Ok(Some)` carries the stored record we now
    /// hold; `Ok(None)` means someone else holds an unexpired lease or won
    /// the race.
    async fn try_acquire(&self) -> Result<Option<LeaseRecord>, LockError> {
        let now = Utc::now();
        match self.lock.get().await? {
            None => {
                let record = self.fresh_record(now, 0);
                match self.lock.create(&record).await {
                    Ok(stored) => Ok(Some(stored)),
                    Err(LockError::Conflict) => Ok(None),
                    Err(err) => Err(err),
                }
            }
            Some(current) if current.holder_identity == self.identity => {
                // Still ours from a previous incarnation; refresh.
                let mut record = current;
                record.renew_time = Some(now);
                match self.lock.update(&record).await {
                    Ok(stored) => Ok(Some(stored)),
                    Err(LockError::Conflict) => Ok(None),
                    Err(err) => Err(err),
                }
            }
            Some(current) if self.expired(&current, now) => {
                let mut record = self.fresh_record(now, current.transitions.saturating_add(1));
                record.version = current.version;
                match self.lock.update(&record).await {
                    Ok(stored) => Ok(Some(stored)),
                    Err(LockError::Conflict) => Ok(None),
                    Err(err) => Err(err),
                }
            }
            Some(_held_elsewhere) => Ok(None),
        }
    }

    async fn renew_loop(self, mut record: LeaseRecord, lead: CancellationToken) {
        let mut last_renewed = Instant::now();
        loop {
            tokio::select! {
                _ = lead.cancelled() => {
                    // Graceful stop: the engine's shutdown reached us, not a
                    // takeover. Hand the lease back so successors start fast.
                    self.release(record).await;
                    return;
                }
                _ = tokio::time::sleep(self.cfg.retry_period) => {}
            }
            let mut next = record.clone();
            next.renew_time = Some(Utc::now());
            match self.lock.update(&next).await {
                Ok(stored) => {
                    record = stored;
                    last_renewed = Instant::now();
                }
                Err(LockError::Conflict) => {
                    warn!(lease = %self.name, identity = %self.identity, "lease taken over; leadership lost");
                    lead.cancel();
                    return;
                }
                Err(err) => {
                    if last_renewed.elapsed() >= self.cfg.renew_deadline {
                        warn!(lease = %self.name, identity = %self.identity, error = %err,
                              "renew deadline exceeded; leadership lost");
                        lead.cancel();
                        return;
                    }
                    debug!(lease = %self.name, error = %err, "lease renew failed; retrying");
                }
            }
        }
    }

    /// Best-effort release: clear the holder identity so successors need not
    /// wait out the full lease duration.
    async fn release(&self, record: LeaseRecord) {
        let mut next = record;
        next.holder_identity = String::new();
        next.acquire_time = None;
        next.renew_time = None;
        match self.lock.update(&next).await {
            Ok(_) => info!(lease = %self.name, identity = %self.identity, "lease released"),
            Err(err) => debug!(lease = %self.name, error = %err, "lease release failed"),
        }
    }
}

#[async_trait]
impl<L: LeaseLock> LeaderGate for Elector<L> {
    async fn acquired(&self, shutdown: &CancellationToken) -> Option<CancellationToken> {
        info!(lease = %self.name, identity = %self.identity, "campaigning for lease");
        let record = loop {
            if shutdown.is_cancelled() {
                return None;
            }
            match self.try_acquire().await {
                Ok(Some(record)) => break record,
                Ok(None) => {}
                Err(err) => warn!(lease = %self.name, error = %err, "lease probe failed"),
            }
            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = tokio::time::sleep(self.cfg.retry_period) => {}
            }
        };
        info!(lease = %self.name, identity = %self.identity, transitions = record.transitions,
              "leadership acquired");
        let lead = shutdown.child_token();
        tokio::spawn(self.clone().renew_loop(record, lead.clone()));
        Some(lead)
    }
}
