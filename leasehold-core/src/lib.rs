//! Named-lease coordination.
//!
//! A [`registry::LeaseRegistry`] holds at most one lease per name, parks
//! contending callers until the lease terminates, and broadcasts the outcome
//! of the termination to all of them. [`server`] exposes the registry over
//! HTTP, and [`client::LeaseController`] drives acquire, renew and release
//! against it.

mod error;

pub mod client;
pub mod proto;
pub mod registry;
pub mod server;

pub use client::{Acquisition, LeaseController, LeaseHandle};
pub use error::{is_cancelled, CancelError, Error, Result};
pub use registry::LeaseRegistry;
pub use server::ServerConfig;

#[cfg(test)]
mod tests;
