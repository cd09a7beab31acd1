//! Cluster Membership Module
//!
//! Answers "who is in the cluster" for the compute and service subsystems, which only
//! ever see the [`view::ClusterView`] trait.
//!
//! ## Implementations
//! - **`local`**: in-process membership with explicit join/leave, used to run several
//!   nodes inside one process.
//! - **`gossip`**: UDP gossip (SWIM-inspired) with an `Alive -> Suspect -> Dead` failure
//!   detector and incarnation numbers, used by the node binary.
//!
//! ## Projections
//! [`view::ClusterGroup`] is a serializable node filter evaluated against the live
//! membership. It doubles as service affinity filter and proxy routing scope.

pub mod gossip;
pub mod local;
pub mod types;
pub mod view;
