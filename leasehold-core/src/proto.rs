//! JSON bodies and routes shared by the server and the controller.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::registry::{LeaseGrant, LeaseStatus, RegistryStats, DEFAULT_TTL};

/// Path segment of the lease resource; the lease name is the next segment.
pub const LEASE_PATH: &str = "lease";
pub const STATUS_PATH: &str = "status";

pub const MALFORMED_BODY_MESSAGE: &str = "Unable to parse request body as JSON.";

fn default_ttl_ms() -> u64 {
    DEFAULT_TTL.as_millis() as u64
}

/// Query string carried by acquire and release
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OwnerQuery {
    #[serde(default)]
    pub owner: String,
}

/// Body of a `201` answer to an acquire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantBody {
    /// Server lease TTL in milliseconds
    #[serde(default = "default_ttl_ms")]
    pub ttl: u64,
    pub owner: String,

    /// Milliseconds since the lease was granted
    #[serde(default)]
    pub age: u64,
    #[serde(default)]
    pub renew_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_queue_length: Option<usize>,
}

impl From<&LeaseGrant> for GrantBody {
    fn from(grant: &LeaseGrant) -> Self {
        Self {
            ttl: grant.ttl.as_millis() as u64,
            owner: grant.owner.clone(),
            age: grant.age.as_millis() as u64,
            renew_count: grant.renew_count,
            wait_queue_length: grant.wait_queue_length,
        }
    }
}

/// Body of a `400` answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: u16,
    pub error: String,
}

/// Process memory in bytes
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemoryUsage {
    pub rss: u64,
    #[serde(rename = "virtual")]
    pub virtual_memory: u64,
}

/// Body of `GET /status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusBody {
    pub lease: BTreeMap<String, LeaseStatus>,
    pub lease_stats: RegistryStats,

    /// Seconds since the server started
    pub uptime: f64,
    pub memory: Option<MemoryUsage>,
}
