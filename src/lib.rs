//! Distributed Compute & Service Fabric
//!
//! This library crate defines the modules that make up one fabric node. It serves as
//! the foundation for the binary executable (`main.rs`).
//!
//! ## Architecture Modules
//! - **`cluster`**: membership. A UDP gossip protocol (SWIM-like) for real deployments
//!   and an in-process cluster for tests, both behind the `ClusterView` trait, plus
//!   `ClusterGroup` projections.
//! - **`messaging`**: point-to-point envelopes between nodes, over HTTP or in-process.
//! - **`compute`**: split-execute-reduce tasks with result policies, failover and
//!   sibling cancellation.
//! - **`service`**: deployment of long-lived services under cardinality constraints,
//!   rebalanced on membership changes, and proxies that route calls to them.
//! - **`checkpoint`**: pluggable storage for job and task checkpoints.
//! - **`grid`**: wires the above into a node and exposes its facades.
//! - **`config`** / **`error`**: tunables and the error taxonomy.

pub mod checkpoint;
pub mod cluster;
pub mod compute;
pub mod config;
pub mod error;
pub mod grid;
pub mod messaging;
pub mod service;
