//! Service Deployment Module
//!
//! Long-lived services deployed across the cluster with a chosen cardinality, and
//! proxies that route calls to them.
//!
//! ## Submodules
//! - **`types`**: the [`types::Service`] trait, descriptors, cardinalities and the
//!   per-node registry of service types.
//! - **`assignment`**: the deterministic placement function and the versioned
//!   cluster-wide assignment table.
//! - **`manager`**: deployment coordination and local instance lifecycle.
//! - **`proxy`**: location-aware, optionally sticky call routing.

pub mod assignment;
pub mod manager;
pub mod proxy;
pub mod types;
