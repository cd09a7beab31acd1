//! Checkpoint Module
//!
//! Keyed blobs that a running job persists through an external store so that they can
//! outlive the job. Jobs never touch a store directly: they go through their session,
//! which applies the scope rules:
//! - **Job scope**: removed when the job that saved it finishes.
//! - **Task scope**: registered with the task's origin node (a [`CheckpointRequest`])
//!   and removed when the task session ends.
//!
//! Stores are expected to be shared by the nodes that use them (a database, a shared
//! filesystem); [`memory::InMemoryCheckpointStore`] is shared by passing the same
//! instance to every in-process node.

pub mod memory;
pub mod store;
pub mod types;

pub use store::{CheckpointStore, CheckpointStores};
pub use types::{CheckpointRequest, CheckpointScope};
