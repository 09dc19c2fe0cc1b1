//! Core Lease Registry functionality

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::{
    sync::{oneshot, Mutex},
    task::AbortHandle,
    time::sleep,
};
use tracing::{debug, trace, warn};

use super::error::{Error, Result};
use super::types::*;

/// A held lease. Its presence in the map is what makes the name held.
struct LeaseEntry {
    owner: String,
    created_at: DateTime<Utc>,
    granted_at: Instant,
    renew_count: u64,

    /// Identifies the expiry timer currently armed for this entry
    epoch: u64,
    expiry: AbortHandle,

    /// Contending acquirers in arrival order
    wait_queue: Vec<oneshot::Sender<Termination>>,
}

impl LeaseEntry {
    fn status(&self) -> LeaseStatus {
        LeaseStatus {
            owner: self.owner.clone(),
            age: self.granted_at.elapsed().as_millis() as u64,
            created_at: self.created_at,
            renew_count: self.renew_count,
            wait_queue_length: self.live_waiters(),
        }
    }

    /// Queued waiters whose callers are still listening
    fn live_waiters(&self) -> usize {
        self.wait_queue.iter().filter(|tx| !tx.is_closed()).count()
    }
}

/// Inner state for the LeaseRegistry
struct Inner {
    config: RegistryConfig,

    /// Currently held leases by name
    leases: HashMap<String, LeaseEntry>,

    stats: RegistryStats,

    /// Counter for generating unique timer epochs
    epoch_counter: u64,
}

impl Inner {
    fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            leases: HashMap::new(),
            stats: RegistryStats::default(),
            epoch_counter: 0,
        }
    }

    /// Remove the entry and deliver the outcome to every queued waiter.
    ///
    /// Returns the number of waiters that were still listening, or `None` if
    /// the name was not held.
    fn terminate(&mut self, name: &str, outcome: Termination) -> Option<usize> {
        let entry = self.leases.remove(name)?;
        let queued = entry.wait_queue.len();
        let delivered = entry
            .wait_queue
            .into_iter()
            .map(|waiter| waiter.send(outcome.clone()).is_ok())
            .filter(|sent| *sent)
            .count();
        if delivered < queued {
            trace!(lease = name, queued, delivered, "some waiters went away");
        }
        Some(delivered)
    }

    /// Terminate the lease as expired, if `epoch` is still the armed timer.
    fn expire(&mut self, name: &str, epoch: u64) {
        match self.leases.get(name) {
            Some(entry) if entry.epoch == epoch => {}
            _ => {
                trace!(lease = name, epoch, "stale expiry timer");
                return;
            }
        }
        self.stats.expire += 1;
        if let Some(delivered) = self.terminate(name, Termination::Expired) {
            debug!(lease = name, delivered, "lease expired");
        }
    }
}

/// The central coordinator for named leases
#[derive(Clone)]
pub struct LeaseRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl LeaseRegistry {
    /// Create a new lease registry with the given configuration
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::new(config))),
        }
    }

    /// Acquire the named lease for `owner`.
    ///
    /// A free name is granted immediately. A name already held by `owner` is
    /// renewed. A name held by anyone else parks the caller until that lease
    /// terminates.
    #[tracing::instrument(skip(self))]
    pub async fn acquire(&self, name: &str, owner: &str) -> Acquired {
        let mut guard = self.inner.lock().await;
        let Inner {
            config,
            leases,
            stats,
            epoch_counter,
        } = &mut *guard;
        let ttl = config.ttl;
        *epoch_counter += 1;
        let epoch = *epoch_counter;

        if let Some(entry) = leases.get_mut(name) {
            if entry.owner != owner {
                let (tx, rx) = oneshot::channel();
                entry.wait_queue.retain(|waiter| !waiter.is_closed());
                entry.wait_queue.push(tx);
                stats.wait += 1;
                debug!(queued = entry.wait_queue.len(), "lease held, waiting");
                return Acquired::Queued(Waiter { rx });
            }

            entry.expiry.abort();
            entry.expiry = self.schedule_expiry(name, epoch, ttl);
            entry.epoch = epoch;
            entry.renew_count += 1;
            stats.renew += 1;
            debug!(renew_count = entry.renew_count, "lease renewed");
            return Acquired::Renewed(LeaseGrant {
                ttl,
                owner: entry.owner.clone(),
                age: entry.granted_at.elapsed(),
                renew_count: entry.renew_count,
                wait_queue_length: Some(entry.live_waiters()),
            });
        }

        leases.insert(
            name.to_owned(),
            LeaseEntry {
                owner: owner.to_owned(),
                created_at: Utc::now(),
                granted_at: Instant::now(),
                renew_count: 0,
                epoch,
                expiry: self.schedule_expiry(name, epoch, ttl),
                wait_queue: vec![],
            },
        );
        stats.grant += 1;
        debug!("lease granted");
        Acquired::Granted(LeaseGrant {
            ttl,
            owner: owner.to_owned(),
            age: Duration::ZERO,
            renew_count: 0,
            wait_queue_length: None,
        })
    }

    /// Release the named lease held by `owner`, handing `payload` to every
    /// waiter. A missing or `null` payload is delivered as an empty object.
    ///
    /// Returns the number of waiters the payload was delivered to.
    #[tracing::instrument(skip(self, payload))]
    pub async fn release(&self, name: &str, owner: &str, payload: Option<Value>) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        let entry = inner.leases.get(name).ok_or(Error::LeaseNotFound)?;
        if entry.owner != owner {
            warn!(holder = %entry.owner, "release by non-owner rejected");
            return Err(Error::OwnershipConflict {
                owner: entry.owner.clone(),
            });
        }
        entry.expiry.abort();
        inner.stats.release += 1;
        let payload = payload
            .filter(|p| !p.is_null())
            .unwrap_or_else(|| json!({}));
        let delivered = inner
            .terminate(name, Termination::Released(payload))
            .unwrap_or_default();
        debug!(delivered, "lease released");
        Ok(delivered)
    }

    /// Snapshot of a single held lease
    pub async fn lease(&self, name: &str) -> Option<LeaseStatus> {
        let inner = self.inner.lock().await;
        inner.leases.get(name).map(LeaseEntry::status)
    }

    /// Snapshot of every held lease and the transition counters, taken
    /// under a single lock.
    pub async fn snapshot(&self) -> RegistrySnapshot {
        let inner = self.inner.lock().await;
        RegistrySnapshot {
            leases: inner
                .leases
                .iter()
                .map(|(name, entry)| (name.clone(), entry.status()))
                .collect(),
            stats: inner.stats,
        }
    }

    /// Get the transition counters
    pub async fn stats(&self) -> RegistryStats {
        self.inner.lock().await.stats
    }

    /// Get the configured lease TTL
    pub async fn ttl(&self) -> Duration {
        self.inner.lock().await.config.ttl
    }

    /// Drop every lease without counting a release or expiry.
    ///
    /// Expiry timers are aborted and waiters are disconnected, observing
    /// `None` from [`Waiter::outcome`]. Returns the number of leases dropped.
    #[tracing::instrument(skip_all)]
    pub async fn close(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let dropped = inner.leases.len();
        for (_, entry) in inner.leases.drain() {
            entry.expiry.abort();
        }
        debug!(dropped, "registry closed");
        dropped
    }

    /// Arm an expiry timer for the lease `name` at `epoch`.
    ///
    /// The timer holds only a weak reference, so it never keeps a dropped
    /// registry alive, and it does nothing if the entry has since been
    /// renewed, released or re-granted.
    fn schedule_expiry(&self, name: &str, epoch: u64, ttl: Duration) -> AbortHandle {
        let inner: Weak<Mutex<Inner>> = Arc::downgrade(&self.inner);
        let name = name.to_owned();
        tokio::spawn(async move {
            sleep(ttl).await;
            if let Some(inner) = inner.upgrade() {
                inner.lock().await.expire(&name, epoch);
            }
        })
        .abort_handle()
    }
}
