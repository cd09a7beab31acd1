//! Compute Module Tests
//!
//! ## Test Scopes
//! - **Lifecycle**: split, schedule, reduce in submission order, zero jobs, argument
//!   validation, split and reduce errors.
//! - **Result policy**: early reduce, failover to another node, exhausted failover,
//!   panicking jobs.
//! - **Cancellation**: sibling cancel from inside a job, task cancel, task timeout,
//!   cancel before arrival, late cancels and repeated cancels at the worker, bounded
//!   tombstones, a sibling cancelled before its job arrives.
//! - **Topology**: failover when a job's owner leaves.
//! - **Session**: siblings, attributes and checkpoint scopes.

#[cfg(test)]
mod tests {
    use crate::checkpoint::CheckpointScope;
    use crate::cluster::types::NodeId;
    use crate::compute::job::{ComputeJob, JobContext};
    use crate::compute::protocol::ExecuteJobRequest;
    use crate::compute::task::ComputeTask;
    use crate::compute::types::{JobId, JobResult, JobSpec, ResultPolicy, SessionId, TaskState};
    use crate::config::FabricConfig;
    use crate::error::FabricError;
    use crate::grid::{GridNode, LocalGrid};
    use crate::messaging::envelope::{Envelope, Topic};

    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::collections::{BTreeSet, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    const SPLIT_COUNT: usize = 5;

    /// Shared observation point for jobs running on any node of a test grid.
    #[derive(Default)]
    struct Observer {
        started: AtomicUsize,
        cancel_hooks: AtomicUsize,
        parked: AtomicUsize,
        park_on: Mutex<HashSet<String>>,
    }

    /// Waits for every sibling to start. Job 1 then cancels all the others, which
    /// report "interrupt-job-data" once interrupted.
    struct SiblingJob {
        observer: Arc<Observer>,
    }

    #[async_trait]
    impl ComputeJob for SiblingJob {
        async fn execute(&self, ctx: JobContext) -> anyhow::Result<Value> {
            self.observer.started.fetch_add(1, Ordering::SeqCst);

            let mut all_started = false;
            for _ in 0..150 {
                if self.observer.started.load(Ordering::SeqCst) >= SPLIT_COUNT {
                    all_started = true;
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            anyhow::ensure!(all_started, "siblings did not start");

            if ctx.argument() == &json!(1) {
                let me = ctx.job_id().clone();
                for sibling in ctx.session().siblings() {
                    if sibling.job_id() != &me {
                        // Twice: the second request must be a no-op.
                        sibling.cancel();
                        sibling.cancel();
                    }
                }
                return Ok(json!(1));
            }

            tokio::select! {
                _ = ctx.cancelled() => Ok(json!("interrupt-job-data")),
                _ = tokio::time::sleep(Duration::from_secs(10)) => Ok(ctx.argument().clone()),
            }
        }

        fn cancel(&self) {
            self.observer.cancel_hooks.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Counts cancel hooks; runs until cancelled.
    struct HookedJob {
        observer: Arc<Observer>,
    }

    #[async_trait]
    impl ComputeJob for HookedJob {
        async fn execute(&self, ctx: JobContext) -> anyhow::Result<Value> {
            self.observer.started.fetch_add(1, Ordering::SeqCst);
            ctx.cancelled().await;
            Ok(json!("interrupted"))
        }

        fn cancel(&self) {
            self.observer.cancel_hooks.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn register_jobs(node: &GridNode, observer: &Arc<Observer>) {
        let jobs = node.jobs();

        jobs.register_fn("echo", |ctx: JobContext| async move {
            Ok(json!({ "value": ctx.argument().clone(), "node": ctx.node_id().to_string() }))
        });

        jobs.register_fn("fail", |_ctx: JobContext| async move { Err(anyhow::anyhow!("boom")) });

        jobs.register_fn("panic", |_ctx: JobContext| async move {
            let exploded: Option<Value> = None;
            Ok(exploded.expect("job exploded"))
        });

        jobs.register_fn("wait", |ctx: JobContext| async move {
            tokio::select! {
                _ = ctx.cancelled() => Ok(json!("interrupted")),
                _ = tokio::time::sleep(Duration::from_secs(10)) => Ok(json!("done")),
            }
        });

        jobs.register_fn("fail-unless", |ctx: JobContext| async move {
            let node = ctx.node_id().to_string();
            if ctx.argument()["good"] == json!(node) {
                Ok(json!(node))
            } else {
                Err(anyhow::anyhow!("not welcome on {}", node))
            }
        });

        let park_observer = observer.clone();
        jobs.register_fn("park", move |ctx: JobContext| {
            let observer = park_observer.clone();
            async move {
                let node = ctx.node_id().to_string();
                let park = observer
                    .park_on
                    .lock()
                    .unwrap()
                    .contains(&node);
                if !park {
                    return Ok(json!(node));
                }

                observer.parked.fetch_add(1, Ordering::SeqCst);
                tokio::select! {
                    _ = ctx.cancelled() => Ok(json!("interrupted")),
                    _ = tokio::time::sleep(Duration::from_secs(10)) => Ok(json!("parked")),
                }
            }
        });

        jobs.register_fn("siblings", |ctx: JobContext| async move {
            let siblings = ctx.session().siblings();
            let this_job = ctx.session().this_job();
            anyhow::ensure!(
                this_job.as_ref().map(|job| job.job_id()) == Some(ctx.job_id()),
                "job is missing from its own sibling set"
            );
            Ok(json!(siblings.len()))
        });

        jobs.register_fn("attribute", |ctx: JobContext| async move {
            let key = format!("job-{}", ctx.argument());
            ctx.session()
                .set_attribute(key.clone(), json!(ctx.node_id().to_string()))
                .await?;
            let value = ctx.session().attribute(&key).await?;
            Ok(value.unwrap_or(Value::Null))
        });

        jobs.register_fn("checkpoint", |ctx: JobContext| async move {
            let session = ctx.session();
            session
                .save_checkpoint("task-state", b"task".to_vec(), CheckpointScope::Task)
                .await?;
            session
                .save_checkpoint("job-state", b"job".to_vec(), CheckpointScope::Job)
                .await?;

            let task_state = session.load_checkpoint("task-state").await?;
            let job_state = session.load_checkpoint("job-state").await?;
            let missing_store = session
                .save_checkpoint_in(Some("nowhere"), "x", Vec::new(), CheckpointScope::Job)
                .await;

            Ok(json!({
                "task": task_state.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()),
                "job": job_state.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()),
                "unknown_store_rejected": matches!(missing_store, Err(FabricError::InvalidArgument(_))),
            }))
        });

        jobs.register_fn("delayed", |ctx: JobContext| async move {
            let delay = ctx.argument()["delay_ms"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(ctx.argument()["index"].clone())
        });

        jobs.register_fn("cancel-others", |ctx: JobContext| async move {
            let me = ctx.job_id().clone();
            for sibling in ctx.session().siblings() {
                if sibling.job_id() != &me {
                    sibling.cancel();
                }
            }
            Ok(json!("cancelled-others"))
        });

        let sibling_observer = observer.clone();
        jobs.register("sibling", move || SiblingJob {
            observer: sibling_observer.clone(),
        });

        let hooked_observer = observer.clone();
        jobs.register("hooked", move || HookedJob {
            observer: hooked_observer.clone(),
        });
    }

    fn test_config() -> FabricConfig {
        FabricConfig {
            request_timeout_ms: 1000,
            cancel_ack_timeout_ms: 500,
            max_failover_attempts: 2,
            ..FabricConfig::default()
        }
    }

    async fn start_grid(nodes: usize, observer: &Arc<Observer>) -> (LocalGrid, Vec<Arc<GridNode>>) {
        let grid = LocalGrid::new(test_config());
        let mut started = Vec::new();
        for _ in 0..nodes {
            let observer = observer.clone();
            started.push(grid.start_node_with(move |node| register_jobs(node, &observer)).await);
        }
        (grid, started)
    }

    /// Polls `condition` for up to three seconds.
    async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..60 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        condition()
    }

    /// Runs a fixed list of jobs. Reduce returns the job values in order and keeps a
    /// copy of what it was given.
    struct ScriptedTask {
        jobs: Vec<JobSpec>,
        reduce_early: bool,
        arrived: Mutex<Vec<Value>>,
        reduced: Mutex<Vec<JobResult>>,
    }

    impl ScriptedTask {
        fn new(jobs: Vec<JobSpec>) -> Self {
            Self {
                jobs,
                reduce_early: false,
                arrived: Mutex::new(Vec::new()),
                reduced: Mutex::new(Vec::new()),
            }
        }

        fn repeat(job_type: &str, count: usize) -> Self {
            Self::new((0..count).map(|i| JobSpec::new(job_type, json!(i))).collect())
        }

        fn reduce_early(mut self) -> Self {
            self.reduce_early = true;
            self
        }

        /// Job values in the order the results came in.
        fn arrived(&self) -> Vec<Value> {
            self.arrived.lock().unwrap().clone()
        }

        fn reduced(&self) -> Vec<JobResult> {
            self.reduced.lock().unwrap().clone()
        }
    }

    impl ComputeTask for ScriptedTask {
        fn name(&self) -> &str {
            "scripted"
        }

        fn split(&self, _grid_size: usize, _arg: Option<&Value>) -> anyhow::Result<Vec<JobSpec>> {
            Ok(self.jobs.clone())
        }

        fn result(&self, latest: &JobResult, _received: &[JobResult]) -> ResultPolicy {
            self.arrived
                .lock()
                .unwrap()
                .push(latest.value.clone().unwrap_or(Value::Null));

            if latest.is_error() {
                ResultPolicy::Failover
            } else if self.reduce_early {
                ResultPolicy::Reduce
            } else {
                ResultPolicy::Wait
            }
        }

        fn reduce(&self, results: &[JobResult]) -> anyhow::Result<Value> {
            *self.reduced.lock().unwrap() = results.to_vec();
            Ok(Value::Array(
                results
                    .iter()
                    .map(|result| result.value.clone().unwrap_or(Value::Null))
                    .collect(),
            ))
        }
    }

    // ============================================================
    // LIFECYCLE TESTS
    // ============================================================

    /// Echoes every element of a JSON array argument, one job per element.
    struct EchoTask;

    impl ComputeTask for EchoTask {
        fn name(&self) -> &str {
            "echo"
        }

        fn requires_argument(&self) -> bool {
            true
        }

        fn split(&self, _grid_size: usize, arg: Option<&Value>) -> anyhow::Result<Vec<JobSpec>> {
            let items = arg
                .and_then(Value::as_array)
                .ok_or_else(|| anyhow::anyhow!("expected an array argument"))?;
            Ok(items.iter().map(|item| JobSpec::new("echo", item.clone())).collect())
        }

        fn reduce(&self, results: &[JobResult]) -> anyhow::Result<Value> {
            let values: Vec<Value> = results
                .iter()
                .map(|result| result.value.as_ref().map_or(Value::Null, |value| value["value"].clone()))
                .collect();
            Ok(Value::Array(values))
        }
    }

    // ===== TEST 1: SPLIT, SPREAD AND REDUCE IN ORDER =====

    #[tokio::test]
    async fn test_results_are_reduced_in_submission_order() {
        // ARRANGE
        let observer = Arc::new(Observer::default());
        let (_grid, nodes) = start_grid(3, &observer).await;
        let items = json!(["a", "b", "c", "d", "e", "f"]);

        // ACT
        let outcome = nodes[0]
            .compute()
            .execute(Arc::new(EchoTask), Some(items.clone()))
            .await
            .unwrap();

        // ASSERT
        assert_eq!(outcome.value(), Some(&items));
    }

    #[tokio::test]
    async fn test_jobs_are_spread_over_all_members() {
        let observer = Arc::new(Observer::default());
        let (_grid, nodes) = start_grid(3, &observer).await;
        let task = Arc::new(ScriptedTask::repeat("echo", 6));

        nodes[1].compute().execute(task.clone(), None).await.unwrap();

        let owners: BTreeSet<NodeId> = task.reduced().into_iter().map(|result| result.node_id).collect();
        assert_eq!(owners.len(), 3);
    }

    #[tokio::test]
    async fn test_reduce_order_ignores_arrival_order() {
        // ARRANGE
        let observer = Arc::new(Observer::default());
        let (_grid, nodes) = start_grid(3, &observer).await;
        let count = 5u64;
        let specs = (0..count)
            .map(|i| JobSpec::new("delayed", json!({ "index": i, "delay_ms": (count - i) * 80 })))
            .collect();
        let task = Arc::new(ScriptedTask::new(specs));

        // ACT
        let outcome = nodes[0].compute().execute(task.clone(), None).await.unwrap();

        // ASSERT
        assert_eq!(task.arrived(), vec![json!(4), json!(3), json!(2), json!(1), json!(0)]);
        assert_eq!(outcome.value(), Some(&json!([0, 1, 2, 3, 4])));
    }

    // ===== TEST 2: ZERO JOBS =====

    #[tokio::test]
    async fn test_zero_jobs_reduce_immediately() {
        let observer = Arc::new(Observer::default());
        let (_grid, nodes) = start_grid(1, &observer).await;

        let outcome = nodes[0]
            .compute()
            .execute(Arc::new(ScriptedTask::new(Vec::new())), None)
            .await
            .unwrap();

        assert_eq!(outcome.value(), Some(&json!([])));
    }

    // ===== TEST 3: ARGUMENT VALIDATION =====

    #[tokio::test]
    async fn test_missing_argument_is_rejected_before_scheduling() {
        let observer = Arc::new(Observer::default());
        let (_grid, nodes) = start_grid(1, &observer).await;
        let compute = nodes[0].compute();

        let missing = compute.submit(Arc::new(EchoTask), None);
        let null = compute.submit(Arc::new(EchoTask), Some(Value::Null));

        assert!(matches!(missing, Err(FabricError::InvalidArgument(_))));
        assert!(matches!(null, Err(FabricError::InvalidArgument(_))));
        assert_eq!(compute.active_sessions(), 0);
    }

    // ===== TEST 4: SPLIT AND REDUCE ERRORS =====

    #[tokio::test]
    async fn test_split_error_fails_the_task() {
        let observer = Arc::new(Observer::default());
        let (_grid, nodes) = start_grid(1, &observer).await;

        let result = nodes[0].compute().execute(Arc::new(EchoTask), Some(json!(42))).await;

        match result {
            Err(FabricError::Split(message)) => assert!(message.contains("array"), "{}", message),
            other => panic!("expected Split error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reduce_error_fails_the_task() {
        struct BrokenReduce;

        impl ComputeTask for BrokenReduce {
            fn split(&self, _grid_size: usize, _arg: Option<&Value>) -> anyhow::Result<Vec<JobSpec>> {
                Ok(vec![JobSpec::new("echo", json!(1))])
            }

            fn reduce(&self, _results: &[JobResult]) -> anyhow::Result<Value> {
                Err(anyhow::anyhow!("cannot fold"))
            }
        }

        let observer = Arc::new(Observer::default());
        let (_grid, nodes) = start_grid(2, &observer).await;

        let result = nodes[0].compute().execute(Arc::new(BrokenReduce), None).await;

        assert!(matches!(result, Err(FabricError::Reduce(ref message)) if message.contains("cannot fold")));
    }

    // ============================================================
    // RESULT POLICY TESTS
    // ============================================================

    // ===== TEST 5: EARLY REDUCE =====

    #[tokio::test]
    async fn test_early_reduce_cancels_outstanding_jobs() {
        // ARRANGE
        let observer = Arc::new(Observer::default());
        let (_grid, nodes) = start_grid(3, &observer).await;
        let task = Arc::new(
            ScriptedTask::new(vec![
                JobSpec::new("wait", json!(0)),
                JobSpec::new("echo", json!("fast")),
                JobSpec::new("wait", json!(2)),
            ])
            .reduce_early(),
        );

        // ACT
        let outcome = nodes[0].compute().execute(task.clone(), None).await.unwrap();

        // ASSERT
        let reduced = task.reduced();
        assert_eq!(reduced.len(), 1);
        assert_eq!(outcome.value().unwrap()[0]["value"], json!("fast"));
        assert!(
            eventually(|| nodes.iter().all(|node| node.worker().running_jobs() == 0)).await,
            "waiting jobs were not cancelled"
        );
    }

    // ===== TEST 6: FAILOVER =====

    #[tokio::test]
    async fn test_failed_job_is_retried_on_another_node() {
        let observer = Arc::new(Observer::default());
        let (_grid, nodes) = start_grid(3, &observer).await;
        let good = nodes[2].id().to_string();
        let task = Arc::new(ScriptedTask::new(vec![JobSpec::new("fail-unless", json!({ "good": good }))]));

        let outcome = nodes[0].compute().execute(task.clone(), None).await.unwrap();

        assert_eq!(outcome.value(), Some(&json!([good])));
        assert_eq!(task.reduced()[0].node_id, *nodes[2].id());
    }

    #[tokio::test]
    async fn test_exhausted_failover_fails_the_task() {
        let observer = Arc::new(Observer::default());
        let (_grid, nodes) = start_grid(2, &observer).await;

        let result = nodes[0]
            .compute()
            .execute(Arc::new(ScriptedTask::repeat("fail", 1)), None)
            .await;

        match result {
            Err(FabricError::JobExecution { message, .. }) => assert!(message.contains("boom"), "{}", message),
            other => panic!("expected JobExecution, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_panicking_job_is_reported_as_error() {
        let observer = Arc::new(Observer::default());
        let (_grid, nodes) = start_grid(1, &observer).await;

        let result = nodes[0]
            .compute()
            .execute(Arc::new(ScriptedTask::repeat("panic", 1)), None)
            .await;

        match result {
            Err(FabricError::JobExecution { message, .. }) => assert!(message.contains("panicked"), "{}", message),
            other => panic!("expected JobExecution, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wait_policy_keeps_errors_when_not_failing_over() {
        struct KeepErrors;

        impl ComputeTask for KeepErrors {
            fn split(&self, _grid_size: usize, _arg: Option<&Value>) -> anyhow::Result<Vec<JobSpec>> {
                Ok(vec![JobSpec::new("fail", Value::Null), JobSpec::new("echo", json!("ok"))])
            }

            fn result(&self, _latest: &JobResult, _received: &[JobResult]) -> ResultPolicy {
                ResultPolicy::Wait
            }

            fn reduce(&self, results: &[JobResult]) -> anyhow::Result<Value> {
                Ok(json!(results.iter().filter(|result| result.is_error()).count()))
            }
        }

        let observer = Arc::new(Observer::default());
        let (_grid, nodes) = start_grid(2, &observer).await;

        let outcome = nodes[0].compute().execute(Arc::new(KeepErrors), None).await.unwrap();

        assert_eq!(outcome.value(), Some(&json!(1)));
    }

    // ============================================================
    // CANCELLATION TESTS
    // ============================================================

    /// Five sibling jobs; job 1 cancels the other four.
    struct CancelSiblingsTask {
        reduced: Mutex<Vec<JobResult>>,
    }

    impl ComputeTask for CancelSiblingsTask {
        fn name(&self) -> &str {
            "cancel-siblings"
        }

        fn split(&self, _grid_size: usize, _arg: Option<&Value>) -> anyhow::Result<Vec<JobSpec>> {
            Ok((1..=SPLIT_COUNT).map(|i| JobSpec::new("sibling", json!(i))).collect())
        }

        fn result(&self, _latest: &JobResult, received: &[JobResult]) -> ResultPolicy {
            if received.len() == SPLIT_COUNT {
                ResultPolicy::Reduce
            } else {
                ResultPolicy::Wait
            }
        }

        fn reduce(&self, results: &[JobResult]) -> anyhow::Result<Value> {
            anyhow::ensure!(results.len() == SPLIT_COUNT, "invalid results size {}", results.len());
            *self.reduced.lock().unwrap() = results.to_vec();
            Ok(json!("interrupt-task-data"))
        }
    }

    // ===== TEST 7: CANCEL SIBLINGS FROM A JOB =====

    #[tokio::test]
    async fn test_job_cancels_its_siblings() {
        // ARRANGE
        let observer = Arc::new(Observer::default());
        let (_grid, nodes) = start_grid(3, &observer).await;
        let task = Arc::new(CancelSiblingsTask {
            reduced: Mutex::new(Vec::new()),
        });

        // ACT
        let outcome = nodes[0].compute().execute(task.clone(), None).await.unwrap();

        // ASSERT
        assert_eq!(outcome.value(), Some(&json!("interrupt-task-data")));
        assert!(eventually(|| observer.cancel_hooks.load(Ordering::SeqCst) == SPLIT_COUNT - 1).await);

        let reduced = task.reduced.lock().unwrap().clone();
        let cancelled: Vec<&JobResult> = reduced.iter().filter(|result| result.cancelled).collect();
        assert_eq!(cancelled.len(), SPLIT_COUNT - 1);
        assert!(cancelled.iter().all(|result| result.value == Some(json!("interrupt-job-data"))));
        assert_eq!(reduced[0].value, Some(json!(1)));
        assert!(!reduced[0].cancelled);

        // Repeated cancels never ran a hook twice.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(observer.cancel_hooks.load(Ordering::SeqCst), SPLIT_COUNT - 1);
    }

    // ===== TEST 8: TASK CANCEL AND TIMEOUT =====

    #[tokio::test]
    async fn test_cancelling_a_task_cancels_its_jobs() {
        // ARRANGE
        let observer = Arc::new(Observer::default());
        let (_grid, nodes) = start_grid(2, &observer).await;
        let future = nodes[0]
            .compute()
            .submit(Arc::new(ScriptedTask::repeat("hooked", 2)), None)
            .unwrap();
        assert!(eventually(|| observer.started.load(Ordering::SeqCst) == 2).await);
        assert_eq!(future.state(), TaskState::Collecting);

        // ACT
        let session_id = future.session_id().clone();
        assert!(nodes[0].compute().cancel(&session_id));
        let outcome = future.get().await.unwrap();

        // ASSERT
        assert!(outcome.is_cancelled());
        assert!(eventually(|| observer.cancel_hooks.load(Ordering::SeqCst) == 2).await);
        assert!(eventually(|| nodes[0].compute().active_sessions() == 0).await);
        assert!(!nodes[0].compute().cancel(&session_id));
    }

    #[tokio::test]
    async fn test_task_timeout() {
        let observer = Arc::new(Observer::default());
        let (_grid, nodes) = start_grid(2, &observer).await;

        let result = nodes[1]
            .compute()
            .submit_with_timeout(
                Arc::new(ScriptedTask::repeat("wait", 2)),
                None,
                Duration::from_millis(200),
            )
            .unwrap()
            .get()
            .await;

        assert!(matches!(result, Err(FabricError::Timeout(_))), "{:?}", result);
        assert!(eventually(|| nodes.iter().all(|node| node.worker().running_jobs() == 0)).await);
    }

    // ===== TEST 9: WORKER-LEVEL CANCEL =====

    fn execute_request(origin: &NodeId, session_id: &SessionId, job_id: &JobId, job_type: &str) -> ExecuteJobRequest {
        ExecuteJobRequest {
            session_id: session_id.clone(),
            origin: origin.clone(),
            task_name: "direct".to_string(),
            job_id: job_id.clone(),
            attempt: 0,
            spec: JobSpec::new(job_type, Value::Null),
            siblings: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_cancel_before_arrival_prevents_execution() {
        // ARRANGE
        let observer = Arc::new(Observer::default());
        let (_grid, nodes) = start_grid(1, &observer).await;
        let worker = nodes[0].worker();
        let session_id = SessionId::new();
        let job_id = JobId::new();

        // ACT
        worker.cancel(&session_id, &job_id);
        worker.cancel(&session_id, &job_id);
        let tombstoned = worker.is_tombstoned(&session_id, &job_id);
        worker.execute(execute_request(nodes[0].id(), &session_id, &job_id, "hooked"));

        // ASSERT
        assert!(tombstoned);
        assert!(!worker.is_tombstoned(&session_id, &job_id));
        assert_eq!(worker.running_jobs(), 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(observer.started.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_repeated_cancel_runs_hook_once() {
        let observer = Arc::new(Observer::default());
        let (_grid, nodes) = start_grid(1, &observer).await;
        let worker = nodes[0].worker();
        let session_id = SessionId::new();
        let job_id = JobId::new();

        worker.execute(execute_request(nodes[0].id(), &session_id, &job_id, "hooked"));
        assert!(eventually(|| observer.started.load(Ordering::SeqCst) == 1).await);

        worker.cancel(&session_id, &job_id);
        worker.cancel(&session_id, &job_id);

        assert!(eventually(|| worker.running_jobs() == 0).await);
        assert_eq!(observer.cancel_hooks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_runs_job_once() {
        let observer = Arc::new(Observer::default());
        let (_grid, nodes) = start_grid(1, &observer).await;
        let worker = nodes[0].worker();
        let session_id = SessionId::new();
        let job_id = JobId::new();
        let request = execute_request(nodes[0].id(), &session_id, &job_id, "hooked");

        worker.execute(request.clone());
        worker.execute(request);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(observer.started.load(Ordering::SeqCst), 1);
        worker.cancel(&session_id, &job_id);
        assert!(eventually(|| worker.running_jobs() == 0).await);
    }

    #[tokio::test]
    async fn test_cancel_after_finish_leaves_no_tombstone() {
        // ARRANGE
        let observer = Arc::new(Observer::default());
        let (_grid, nodes) = start_grid(1, &observer).await;
        let worker = nodes[0].worker();
        let session_id = SessionId::new();
        let job_id = JobId::new();
        let request = execute_request(nodes[0].id(), &session_id, &job_id, "echo");

        worker.execute(request.clone());
        assert!(eventually(|| worker.running_jobs() == 0).await);

        // ACT
        worker.cancel(&session_id, &job_id);
        worker.execute(request);

        // ASSERT
        assert!(!worker.is_tombstoned(&session_id, &job_id));
        assert_eq!(worker.running_jobs(), 0);
    }

    #[tokio::test]
    async fn test_tombstones_are_evicted_oldest_first() {
        // ARRANGE
        let observer = Arc::new(Observer::default());
        let grid = LocalGrid::new(FabricConfig {
            tombstone_capacity: 2,
            ..test_config()
        });
        let node = {
            let observer = observer.clone();
            grid.start_node_with(move |node| register_jobs(node, &observer)).await
        };
        let worker = node.worker();
        let session_id = SessionId::new();
        let job_ids: Vec<JobId> = (0..3).map(|_| JobId::new()).collect();

        // ACT
        for job_id in &job_ids {
            worker.cancel(&session_id, job_id);
        }

        // ASSERT
        assert!(!worker.is_tombstoned(&session_id, &job_ids[0]));
        assert!(worker.is_tombstoned(&session_id, &job_ids[1]));
        assert!(worker.is_tombstoned(&session_id, &job_ids[2]));

        worker.execute(execute_request(node.id(), &session_id, &job_ids[2], "hooked"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(observer.started.load(Ordering::SeqCst), 0);
    }

    /// Holds `job_type` deliveries to `node` until a cancel for the job has landed.
    fn hold_until_cancelled(node: &GridNode, job_type: &'static str) {
        let worker = node.worker().clone();
        node.channel().dispatcher().register(Topic::Job, move |from, envelope| {
            let worker = worker.clone();
            async move {
                if let Envelope::ExecuteJob(request) = &envelope
                    && request.spec.job_type == job_type
                {
                    for _ in 0..60 {
                        if worker.is_tombstoned(&request.session_id, &request.job_id) {
                            break;
                        }
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
                worker.handle_message(from, envelope).await
            }
        });
    }

    #[tokio::test]
    async fn test_sibling_cancelled_before_arrival_reduces_as_cancelled() {
        // ARRANGE
        let observer = Arc::new(Observer::default());
        let (_grid, nodes) = start_grid(1, &observer).await;
        hold_until_cancelled(&nodes[0], "hooked");
        let task = Arc::new(ScriptedTask::new(vec![
            JobSpec::new("cancel-others", Value::Null),
            JobSpec::new("hooked", Value::Null),
        ]));

        // ACT
        let outcome = nodes[0].compute().execute(task.clone(), None).await.unwrap();

        // ASSERT
        assert_eq!(outcome.value(), Some(&json!(["cancelled-others", null])));

        let reduced = task.reduced();
        assert!(!reduced[0].cancelled);
        assert!(reduced[1].cancelled);
        assert!(!reduced[1].is_error());
        assert_eq!(reduced[1].value, None);

        assert_eq!(observer.started.load(Ordering::SeqCst), 0);
        assert_eq!(observer.cancel_hooks.load(Ordering::SeqCst), 0);
    }

    // ============================================================
    // TOPOLOGY TESTS
    // ============================================================

    // ===== TEST 10: OWNER LEAVES =====

    #[tokio::test]
    async fn test_jobs_of_a_departed_node_fail_over() {
        // ARRANGE
        let observer = Arc::new(Observer::default());
        let (grid, nodes) = start_grid(3, &observer).await;
        let leaving = nodes[2].id().clone();
        observer.park_on.lock().unwrap().insert(leaving.to_string());

        let task = Arc::new(ScriptedTask::repeat("park", 3));
        let future = nodes[0].compute().submit(task.clone(), None).unwrap();
        assert!(eventually(|| observer.parked.load(Ordering::SeqCst) == 1).await);

        // ACT
        grid.stop_node(&leaving).await;
        let outcome = future.get().await.unwrap();

        // ASSERT
        let values = outcome.value().unwrap().as_array().unwrap().clone();
        assert_eq!(values.len(), 3);
        assert!(values.iter().all(|value| value != &json!(leaving.to_string())));
        assert!(task.reduced().iter().all(|result| result.node_id != leaving));
    }

    // ============================================================
    // SESSION TESTS
    // ============================================================

    // ===== TEST 11: SIBLINGS AND ATTRIBUTES =====

    #[tokio::test]
    async fn test_every_job_sees_the_full_sibling_set() {
        let observer = Arc::new(Observer::default());
        let (_grid, nodes) = start_grid(3, &observer).await;
        let task = Arc::new(ScriptedTask::repeat("siblings", 4));

        let future = nodes[0].compute().submit(task, None).unwrap();
        let session = future.session().clone();
        let outcome = future.get().await.unwrap();

        assert_eq!(outcome.value(), Some(&json!([4, 4, 4, 4])));
        assert_eq!(session.sibling_count(), 4);
        assert_eq!(session.task_name(), "scripted");
    }

    #[tokio::test]
    async fn test_job_attributes_live_on_the_task_session() {
        let observer = Arc::new(Observer::default());
        let (_grid, nodes) = start_grid(2, &observer).await;
        let task = Arc::new(ScriptedTask::repeat("attribute", 2));

        let future = nodes[1].compute().submit(task.clone(), None).unwrap();
        let session = future.session().clone();
        future.get().await.unwrap();

        for result in task.reduced() {
            assert_eq!(result.value, Some(json!(result.node_id.to_string())));
        }
        assert!(session.attribute("job-0").is_some());
        assert!(session.attribute("job-1").is_some());
        assert_eq!(session.attribute("job-2"), None);
    }

    // ===== TEST 12: CHECKPOINTS =====

    #[tokio::test]
    async fn test_checkpoint_scopes_are_cleaned_up() {
        // ARRANGE
        let observer = Arc::new(Observer::default());
        let (grid, nodes) = start_grid(2, &observer).await;
        let store = grid.checkpoints().resolve(None).unwrap();

        // ACT
        let future = nodes[0]
            .compute()
            .submit(Arc::new(ScriptedTask::repeat("checkpoint", 1)), None)
            .unwrap();
        let session_id = future.session_id().clone();
        let outcome = future.get().await.unwrap();

        // ASSERT
        let seen = &outcome.value().unwrap()[0];
        assert_eq!(seen["task"], json!("task"));
        assert_eq!(seen["job"], json!("job"));
        assert_eq!(seen["unknown_store_rejected"], json!(true));

        // Job scope is gone as soon as the job finished.
        assert_eq!(store.load(&session_id, "job-state").await.unwrap(), None);

        // Task scope goes when the task session ends.
        let mut released = false;
        for _ in 0..60 {
            if store.load(&session_id, "task-state").await.unwrap().is_none() {
                released = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(released, "task checkpoint survived its session");
    }
}
