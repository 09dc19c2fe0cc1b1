//! Lease Controller
//!
//! Client side of the lease protocol: a single acquire call, an automatic
//! renewal loop while the lease is held, and a guarded one-time release.

mod controller;
mod error;

pub use controller::{
    default_owner, Acquisition, AcquireOptions, ControllerConfig, LeaseController, LeaseHandle,
    DEFAULT_ACQUIRE_TIMEOUT, DEFAULT_URL,
};
pub use error::{Error, Result};
