//! Distributed Compute Module
//!
//! Split-execute-reduce over the cluster, with sibling cancellation.
//!
//! ## Flow
//! 1. **Submit**: [`processor::TaskProcessor::submit`] validates the argument and starts a
//!    coordinator for the task on the submitting (origin) node.
//! 2. **Split & schedule**: the coordinator splits the task into [`types::JobSpec`]s,
//!    picks an owner per job through the [`balancer::LoadBalancer`], fixes the sibling
//!    set, and only then sends the jobs out.
//! 3. **Execute**: the [`worker::JobWorker`] on each owner instantiates the job from the
//!    [`job::JobRegistry`] and runs it with a cancellation token.
//! 4. **Collect**: every result goes through the task's result policy (wait, reduce
//!    early, or fail over to another node).
//! 5. **Reduce**: results are reduced in submission order and the future completes.
//!
//! Any job may cancel any sibling (itself included). The cancel goes to the origin,
//! which knows the sibling's current owner, and from there to the owner's worker.
//!
//! ## Submodules
//! - **`task`** / **`job`**: user-facing traits and the job type registry.
//! - **`session`**: origin-side session state, job-side session view, sibling handles.
//! - **`coordinator`**: the per-task state machine.
//! - **`processor`**: origin-side routing and the task future.
//! - **`worker`**: execution side.
//! - **`protocol`**: wire messages.

pub mod balancer;
pub mod coordinator;
pub mod job;
pub mod processor;
pub mod protocol;
pub mod session;
pub mod task;
pub mod types;
pub mod worker;

#[cfg(test)]
mod tests;
