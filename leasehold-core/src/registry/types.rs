//! Types for the Lease Registry

use std::{collections::BTreeMap, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

/// Lease time-to-live used when none is configured
pub const DEFAULT_TTL: Duration = Duration::from_millis(15_000);

/// Configuration for the lease registry
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Inactivity window after which an unrenewed lease expires
    pub ttl: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { ttl: DEFAULT_TTL }
    }
}

/// Details handed to the owner when a lease is granted or renewed
#[derive(Debug, Clone, PartialEq)]
pub struct LeaseGrant {
    pub ttl: Duration,
    pub owner: String,
    pub age: Duration,
    pub renew_count: u64,

    /// Only reported on renewal
    pub wait_queue_length: Option<usize>,
}

/// The outcome broadcast to every waiter when a lease terminates
#[derive(Debug, Clone, PartialEq)]
pub enum Termination {
    /// The owner released the lease, leaving this payload behind
    Released(Value),

    /// Nobody renewed or released the lease within its TTL
    Expired,
}

/// A contended acquire, parked until the held lease terminates
#[derive(Debug)]
pub struct Waiter {
    pub(super) rx: oneshot::Receiver<Termination>,
}

impl Waiter {
    /// Wait for the held lease to terminate.
    ///
    /// Returns `None` if the registry was closed before the lease terminated.
    pub async fn outcome(self) -> Option<Termination> {
        self.rx.await.ok()
    }
}

/// Result of an acquire request
#[derive(Debug)]
pub enum Acquired {
    /// The name was free and now belongs to the caller
    Granted(LeaseGrant),

    /// The caller already owned the name; its expiry window was reset
    Renewed(LeaseGrant),

    /// Another owner holds the name
    Queued(Waiter),
}

impl Acquired {
    /// The grant details, if the caller now holds the lease
    pub fn grant(&self) -> Option<&LeaseGrant> {
        match self {
            Acquired::Granted(grant) | Acquired::Renewed(grant) => Some(grant),
            Acquired::Queued(_) => None,
        }
    }
}

/// Point-in-time view of one held lease
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseStatus {
    pub owner: String,

    /// Milliseconds since the lease was granted
    pub age: u64,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,

    pub renew_count: u64,
    pub wait_queue_length: usize,
}

/// Registry transition counters, kept for the life of the process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub grant: u64,
    pub wait: u64,
    pub renew: u64,
    pub release: u64,
    pub expire: u64,
}

/// Consistent view of every held lease and the counters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistrySnapshot {
    pub leases: BTreeMap<String, LeaseStatus>,
    pub stats: RegistryStats,
}
