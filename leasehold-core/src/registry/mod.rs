//! Lease Registry
//!
//! The authoritative in-memory map from lease name to lease state. Holds at
//! most one owner per name, parks contending acquirers in a wait queue, and
//! broadcasts a single termination outcome to every parked caller when the
//! lease is released or expires.

mod error;
mod types;

mod manager;


pub use error::{Error, Result};
pub use manager::LeaseRegistry;
pub use types::{
    Acquired, LeaseGrant, LeaseStatus, RegistryConfig, RegistrySnapshot, RegistryStats,
    Termination, Waiter, DEFAULT_TTL,
};
