use super::types::{JobResult, JobSpec, ResultPolicy};

use anyhow::Result;
use serde_json::Value;

/// User-supplied splitting, result-policy and reduce logic.
pub trait ComputeTask: Send + Sync + 'static {
    fn name(&self) -> &str {
        "task"
    }

    /// When true, submitting without an argument (or with JSON null) is rejected
    /// before anything is scheduled.
    fn requires_argument(&self) -> bool {
        false
    }

    /// Splits the task into jobs. `grid_size` is the number of live members.
    fn split(&self, grid_size: usize, arg: Option<&Value>) -> Result<Vec<JobSpec>>;

    /// Called once per arrival with the newest result and every result received so
    /// far (the newest included, arrival order). Calls are never concurrent.
    ///
    /// Default: fail over errors, otherwise keep waiting.
    fn result(&self, latest: &JobResult, received: &[JobResult]) -> ResultPolicy {
        let _ = received;
        if latest.is_error() {
            ResultPolicy::Failover
        } else {
            ResultPolicy::Wait
        }
    }

    /// Folds the received results, given in job submission order.
    fn reduce(&self, results: &[JobResult]) -> Result<Value>;
}
