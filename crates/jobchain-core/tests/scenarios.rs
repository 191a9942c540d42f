//! End-to-end scenario tests mirroring spec.md §8 scenarios 1-6, run against
//! the in-memory `StateAdapter`/`NotifyAdapter` doubles from `jobchain-testing`.

use jobchain_core::{
    async_trait, AbortReason, AttemptContext, AttemptError, ChainId, ClientError, ContinueWithSpec,
    ContinuationRequest, Disposition, Executor, ExecutorConfig, JobProcessor, JobTypeDef,
    JobTypeRegistry, JobTypeValidationError, ProcessorRegistry, Reaper, ReaperConfig,
    StartJobChainSpec, StateAdapter, StateError, TypeRegistry, WaitForChainConfig,
};
use jobchain_core::{Client, DeduplicationScope, DeduplicationSpec};
use jobchain_testing::{InMemoryNotifyAdapter, InMemoryStateAdapter};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Thin [`TypeRegistry`] wired to the runtime graph checks [`JobTypeRegistry`]
/// already performs at construction; schema validation is a no-op (real
/// schema validation is the external type registry's job, out of scope here
/// per spec.md §1).
struct TestRegistry(JobTypeRegistry);

impl TestRegistry {
    fn new(defs: impl IntoIterator<Item = JobTypeDef>) -> Self {
        Self(JobTypeRegistry::new(defs).expect("test registry graph is valid"))
    }
}

impl TypeRegistry for TestRegistry {
    fn validate_entry(&self, type_name: &str) -> Result<(), JobTypeValidationError> {
        if self.0.is_entry(type_name) {
            Ok(())
        } else {
            Err(JobTypeValidationError::NotEntryPoint(type_name.to_string()))
        }
    }

    fn parse_input(&self, _type_name: &str, value: &Value) -> Result<Value, JobTypeValidationError> {
        Ok(value.clone())
    }

    fn parse_output(&self, _type_name: &str, value: &Value) -> Result<Value, JobTypeValidationError> {
        Ok(value.clone())
    }

    fn validate_continue_with(
        &self,
        from_type_name: &str,
        to: &ContinuationRequest,
    ) -> Result<(), JobTypeValidationError> {
        if self.0.allows_continuation(from_type_name, &to.type_name) {
            Ok(())
        } else {
            Err(JobTypeValidationError::InvalidContinuation(
                from_type_name.to_string(),
                to.type_name.clone(),
            ))
        }
    }

    fn validate_blockers(
        &self,
        type_name: &str,
        blockers: &[ContinuationRequest],
    ) -> Result<(), JobTypeValidationError> {
        for blocker in blockers {
            if !self.0.allows_blocker(type_name, &blocker.type_name) {
                return Err(JobTypeValidationError::InvalidBlockers(type_name.to_string()));
            }
        }
        Ok(())
    }
}

fn chain_spec(type_name: &str, input: Value) -> StartJobChainSpec {
    StartJobChainSpec {
        type_name: type_name.to_string(),
        input,
        blockers: Vec::new(),
        deduplication: None,
        schedule: None,
        trace_context: None,
    }
}

/// Scenario 1: register `test` (entry, `{value}` -> `{result}`), start with
/// `{value:10}`, worker doubles it. Expected `output = {result:20}`.
#[tokio::test]
async fn scenario_1_simple_chain() {
    let state = InMemoryStateAdapter::new();
    let notify = Arc::new(InMemoryNotifyAdapter::new());
    let registry = TestRegistry::new([JobTypeDef::new("test").entry()]);
    let client = Client::new(state.clone(), notify.clone(), registry);

    struct Doubler;
    #[async_trait]
    impl JobProcessor for Doubler {
        async fn process(&self, ctx: &AttemptContext) -> Result<Disposition, AttemptError> {
            let value = ctx.input()["value"].as_i64().unwrap();
            Ok(Disposition::Complete(json!({ "result": value * 2 })))
        }
    }

    let processors = ProcessorRegistry::new().register("test", Arc::new(Doubler));
    let mut config = ExecutorConfig::new("worker-1");
    config.poll_interval_ms = 15;
    let executor = Arc::new(Executor::new(state.clone(), notify.clone(), config, processors));
    let handle = {
        let executor = executor.clone();
        tokio::spawn(async move { executor.run().await })
    };

    let created = client
        .start_job_chain(chain_spec("test", json!({ "value": 10 })))
        .await
        .unwrap();
    assert!(!created.deduplicated);

    let view = client
        .wait_for_job_chain_completion(
            created.id,
            "test",
            WaitForChainConfig { poll_interval_ms: 10, timeout_ms: 5_000 },
            None,
        )
        .await
        .unwrap();

    executor.request_stop();
    handle.await.unwrap();

    assert_eq!(view.output, Some(json!({ "result": 20 })));
}

/// Scenario 2: `first(entry, null) -> second({v:1})`, `second` returns
/// `{r: v*3+1}`. Expected terminal output `{r:4}`.
#[tokio::test]
async fn scenario_2_two_step_continuation() {
    let state = InMemoryStateAdapter::new();
    let notify = Arc::new(InMemoryNotifyAdapter::new());
    let registry = TestRegistry::new([
        JobTypeDef::new("first").entry().continue_with("second"),
        JobTypeDef::new("second"),
    ]);
    let client = Client::new(state.clone(), notify.clone(), registry);

    struct FirstProcessor;
    #[async_trait]
    impl JobProcessor for FirstProcessor {
        async fn process(&self, _ctx: &AttemptContext) -> Result<Disposition, AttemptError> {
            Ok(Disposition::ContinueWith(ContinueWithSpec {
                type_name: "second".to_string(),
                input: json!({ "v": 1 }),
                schedule: None,
                blockers: Vec::new(),
            }))
        }
    }

    struct SecondProcessor;
    #[async_trait]
    impl JobProcessor for SecondProcessor {
        async fn process(&self, ctx: &AttemptContext) -> Result<Disposition, AttemptError> {
            let v = ctx.input()["v"].as_i64().unwrap();
            Ok(Disposition::Complete(json!({ "r": v * 3 + 1 })))
        }
    }

    let processors = ProcessorRegistry::new()
        .register("first", Arc::new(FirstProcessor))
        .register("second", Arc::new(SecondProcessor));
    let mut config = ExecutorConfig::new("worker-1");
    config.poll_interval_ms = 15;
    let executor = Arc::new(Executor::new(state.clone(), notify.clone(), config, processors));
    let handle = {
        let executor = executor.clone();
        tokio::spawn(async move { executor.run().await })
    };

    let created = client
        .start_job_chain(chain_spec("first", Value::Null))
        .await
        .unwrap();

    let view = client
        .wait_for_job_chain_completion(
            created.id,
            "first",
            WaitForChainConfig { poll_interval_ms: 10, timeout_ms: 5_000 },
            None,
        )
        .await
        .unwrap();

    executor.request_stop();
    handle.await.unwrap();

    assert_eq!(view.output, Some(json!({ "r": 4 })));
}

/// Scenario 3: `blocker(entry, {v}) -> {result:v}`, `main(entry, null,
/// blockers:[blocker])`. Created in one transaction so `main` adopts
/// `blocker`'s root. Worker completes `blocker`, unblocking `main`, whose
/// processor reads the blocker's output via `get_job_blockers` and returns
/// `{finalResult: v}`. Delete from `blocker.id` is rejected; delete from
/// `main.id` cascades and removes both.
#[tokio::test]
async fn scenario_3_blocker_with_adoption() {
    let state = InMemoryStateAdapter::new();
    let notify = Arc::new(InMemoryNotifyAdapter::new());
    let registry = TestRegistry::new([
        JobTypeDef::new("blocker").entry(),
        JobTypeDef::new("main").entry().blocker("blocker"),
    ]);
    let client = Client::new(state.clone(), notify.clone(), registry);
    let client_ref = &client;

    let (blocker_id, main_id): (ChainId, ChainId) = client_ref
        .with_notify(move |ctx| async move {
            let blocker = client_ref
                .create_job_chain_in(ctx, chain_spec("blocker", json!({ "v": 7 })))
                .await?;
            let mut main_spec = chain_spec("main", Value::Null);
            main_spec.blockers = vec![blocker.id];
            let main = client_ref.create_job_chain_in(ctx, main_spec).await?;
            Ok::<_, ClientError>((blocker.id, main.id))
        })
        .await
        .unwrap();

    struct BlockerProcessor;
    #[async_trait]
    impl JobProcessor for BlockerProcessor {
        async fn process(&self, ctx: &AttemptContext) -> Result<Disposition, AttemptError> {
            let v = ctx.input()["v"].as_i64().unwrap();
            Ok(Disposition::Complete(json!({ "result": v })))
        }
    }

    struct MainProcessor {
        state: InMemoryStateAdapter,
    }
    #[async_trait]
    impl JobProcessor for MainProcessor {
        async fn process(&self, ctx: &AttemptContext) -> Result<Disposition, AttemptError> {
            let blockers = self
                .state
                .get_job_blockers(ctx.job().id)
                .await
                .map_err(|e| AttemptError::Failed(e.into()))?;
            let blocker_output = blockers
                .first()
                .and_then(|b| b.current_blocker_state.output.clone())
                .unwrap_or(Value::Null);
            let v = blocker_output["result"].as_i64().unwrap_or(0);
            Ok(Disposition::Complete(json!({ "finalResult": v })))
        }
    }

    let processors = ProcessorRegistry::new()
        .register("blocker", Arc::new(BlockerProcessor))
        .register(
            "main",
            Arc::new(MainProcessor { state: state.clone() }),
        );
    let mut config = ExecutorConfig::new("worker-1");
    config.poll_interval_ms = 15;
    let executor = Arc::new(Executor::new(state.clone(), notify.clone(), config, processors));
    let handle = {
        let executor = executor.clone();
        tokio::spawn(async move { executor.run().await })
    };

    let view = client
        .wait_for_job_chain_completion(
            main_id,
            "main",
            WaitForChainConfig { poll_interval_ms: 10, timeout_ms: 5_000 },
            None,
        )
        .await
        .unwrap();

    executor.request_stop();
    handle.await.unwrap();

    assert_eq!(view.output, Some(json!({ "finalResult": 7 })));

    match client.delete_job_chains(&[blocker_id]).await {
        Err(ClientError::State(StateError::MustDeleteFromRoot(root))) => {
            assert_eq!(root, main_id)
        }
        other => panic!("expected MustDeleteFromRoot, got {other:?}"),
    }

    client.delete_job_chains(&[main_id]).await.unwrap();
    assert!(client.get_job_chain(blocker_id, "blocker").await.unwrap().is_none());
    assert!(client.get_job_chain(main_id, "main").await.unwrap().is_none());
}

/// Scenario 4: `leaseMs=10`, `renewIntervalMs=1000` (too slow to renew
/// inside the test window). Worker A acquires and sleeps 150ms. The
/// Reaper observes the expired lease and resets the job to `pending`;
/// Worker B re-acquires and completes quickly. A's attempt must not write
/// an output, and exactly one `completed` row must exist.
#[tokio::test]
async fn scenario_4_lease_loss_causes_reap() {
    let state = InMemoryStateAdapter::new();
    let notify = Arc::new(InMemoryNotifyAdapter::new());
    let registry = TestRegistry::new([JobTypeDef::new("lease_test").entry()]);
    let client = Client::new(state.clone(), notify.clone(), registry);

    let created = client
        .start_job_chain(chain_spec("lease_test", Value::Null))
        .await
        .unwrap();

    let wrote_output = Arc::new(AtomicBool::new(false));

    struct SleepyProcessor {
        wrote_output: Arc<AtomicBool>,
    }
    #[async_trait]
    impl JobProcessor for SleepyProcessor {
        async fn process(&self, ctx: &AttemptContext) -> Result<Disposition, AttemptError> {
            tokio::time::sleep(Duration::from_millis(150)).await;
            if ctx.abort_signal().reason().is_some() {
                return Err(AttemptError::Failed(anyhow::anyhow!(
                    "abandoning work after losing ownership"
                )));
            }
            self.wrote_output.store(true, Ordering::SeqCst);
            Ok(Disposition::Complete(json!({ "worker": "A" })))
        }
    }

    struct QuickProcessor;
    #[async_trait]
    impl JobProcessor for QuickProcessor {
        async fn process(&self, _ctx: &AttemptContext) -> Result<Disposition, AttemptError> {
            Ok(Disposition::Complete(json!({ "worker": "B" })))
        }
    }

    let mut config_a = ExecutorConfig::new("worker-a");
    config_a.lease.lease_ms = 10;
    config_a.lease.renew_interval_ms = 1_000;
    config_a.poll_interval_ms = 20;
    let processors_a = ProcessorRegistry::new().register(
        "lease_test",
        Arc::new(SleepyProcessor { wrote_output: wrote_output.clone() }),
    );
    let executor_a = Arc::new(Executor::new(state.clone(), notify.clone(), config_a, processors_a));

    let mut config_b = ExecutorConfig::new("worker-b");
    config_b.poll_interval_ms = 15;
    let processors_b = ProcessorRegistry::new().register("lease_test", Arc::new(QuickProcessor));
    let executor_b = Arc::new(Executor::new(state.clone(), notify.clone(), config_b, processors_b));

    let mut reaper = Reaper::start(
        state.clone(),
        notify.clone(),
        vec!["lease_test".to_string()],
        ReaperConfig { interval_ms: 15 },
    );

    let handle_a = {
        let executor_a = executor_a.clone();
        tokio::spawn(async move { executor_a.run().await })
    };
    // Give worker A a head start so it is the one that acquires the job.
    tokio::time::sleep(Duration::from_millis(15)).await;
    let handle_b = {
        let executor_b = executor_b.clone();
        tokio::spawn(async move { executor_b.run().await })
    };

    let view = client
        .wait_for_job_chain_completion(
            created.id,
            "lease_test",
            WaitForChainConfig { poll_interval_ms: 10, timeout_ms: 5_000 },
            None,
        )
        .await
        .unwrap();

    executor_a.request_stop();
    executor_b.request_stop();
    reaper.stop().await;
    handle_a.await.unwrap();
    handle_b.await.unwrap();

    assert_eq!(view.output, Some(json!({ "worker": "B" })));
    assert!(!wrote_output.load(Ordering::SeqCst));
}

/// Scenario 5a: `scope=incomplete` collapses a second start onto the first,
/// but once the first chain completes, a later start with the same key
/// creates a fresh chain instead of matching the (now completed) one.
#[tokio::test]
async fn scenario_5_dedup_incomplete_ignores_completed_chains() {
    let state = InMemoryStateAdapter::new();
    let notify = Arc::new(InMemoryNotifyAdapter::new());
    let registry = TestRegistry::new([JobTypeDef::new("dedup_test").entry()]);
    let client = Client::new(state.clone(), notify.clone(), registry);

    let mut spec = chain_spec("dedup_test", json!({ "n": 1 }));
    spec.deduplication = Some(DeduplicationSpec {
        key: "k".to_string(),
        scope: DeduplicationScope::Incomplete,
        window_ms: None,
    });

    let first = client.start_job_chain(spec.clone()).await.unwrap();
    assert!(!first.deduplicated);

    let second = client.start_job_chain(spec.clone()).await.unwrap();
    assert!(second.deduplicated);
    assert_eq!(second.id, first.id);

    client
        .complete_job_chain(first.id, "dedup_test", |_job| async { Some(json!({ "done": true })) })
        .await
        .unwrap();

    let third = client.start_job_chain(spec.clone()).await.unwrap();
    assert!(!third.deduplicated);
    assert_ne!(third.id, first.id);
}

/// Scenario 5b: `scope=any` collapses onto a completed chain within the
/// window, unlike `incomplete`.
#[tokio::test]
async fn scenario_5_dedup_any_collapses_onto_completed() {
    let state = InMemoryStateAdapter::new();
    let notify = Arc::new(InMemoryNotifyAdapter::new());
    let registry = TestRegistry::new([JobTypeDef::new("dedup_test").entry()]);
    let client = Client::new(state.clone(), notify.clone(), registry);

    let mut spec = chain_spec("dedup_test", json!({ "n": 1 }));
    spec.deduplication = Some(DeduplicationSpec {
        key: "k".to_string(),
        scope: DeduplicationScope::Any,
        window_ms: None,
    });

    let first = client.start_job_chain(spec.clone()).await.unwrap();
    client
        .complete_job_chain(first.id, "dedup_test", |_job| async { Some(json!({ "done": true })) })
        .await
        .unwrap();

    let second = client.start_job_chain(spec.clone()).await.unwrap();
    assert!(second.deduplicated);
    assert_eq!(second.id, first.id);
}

/// Scenario 5c: `windowMs=50` with a 100ms gap, neither scope collapses.
#[tokio::test]
async fn scenario_5_dedup_window_excludes_stale_candidates() {
    let state = InMemoryStateAdapter::new();
    let notify = Arc::new(InMemoryNotifyAdapter::new());
    let registry = TestRegistry::new([JobTypeDef::new("dedup_test").entry()]);
    let client = Client::new(state.clone(), notify.clone(), registry);

    let mut spec = chain_spec("dedup_test", json!({ "n": 1 }));
    spec.deduplication = Some(DeduplicationSpec {
        key: "k".to_string(),
        scope: DeduplicationScope::Any,
        window_ms: Some(50),
    });

    let first = client.start_job_chain(spec.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let second = client.start_job_chain(spec.clone()).await.unwrap();

    assert!(!second.deduplicated);
    assert_ne!(second.id, first.id);
}

/// Scenario 6: a staged-mode processor sleeps after its acquiring
/// transaction commits. External code completes the chain via
/// `completeJobChain` while it sleeps. The handler observes
/// `AbortReason::AlreadyCompleted` and abandons its own completion attempt;
/// the durable output is the one from the workerless path.
#[tokio::test]
async fn scenario_6_workerless_completion_aborts_running_worker() {
    let state = InMemoryStateAdapter::new();
    let notify = Arc::new(InMemoryNotifyAdapter::new());
    let registry = TestRegistry::new([JobTypeDef::new("workerless_test").entry()]);
    let client = Client::new(state.clone(), notify.clone(), registry);

    let created = client
        .start_job_chain(chain_spec("workerless_test", Value::Null))
        .await
        .unwrap();

    let saw_already_completed = Arc::new(AtomicBool::new(false));

    struct SlowProcessor {
        saw_already_completed: Arc<AtomicBool>,
    }
    #[async_trait]
    impl JobProcessor for SlowProcessor {
        async fn process(&self, ctx: &AttemptContext) -> Result<Disposition, AttemptError> {
            tokio::time::sleep(Duration::from_millis(300)).await;
            if ctx.abort_signal().reason() == Some(AbortReason::AlreadyCompleted) {
                self.saw_already_completed.store(true, Ordering::SeqCst);
                return Err(AttemptError::Failed(anyhow::anyhow!(
                    "abandoning completion after external workerless completion"
                )));
            }
            Ok(Disposition::Complete(json!({ "worker": true })))
        }
    }

    let processors = ProcessorRegistry::new().register(
        "workerless_test",
        Arc::new(SlowProcessor { saw_already_completed: saw_already_completed.clone() }),
    );
    let mut config = ExecutorConfig::new("worker-1");
    config.poll_interval_ms = 15;
    let executor = Arc::new(Executor::new(state.clone(), notify.clone(), config, processors));
    let handle = {
        let executor = executor.clone();
        tokio::spawn(async move { executor.run().await })
    };

    // Give the worker time to acquire the job and enter its sleep.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let view = client
        .complete_job_chain(created.id, "workerless_test", |_job| async {
            Some(json!({ "result": 99 }))
        })
        .await
        .unwrap();
    assert_eq!(view.output, Some(json!({ "result": 99 })));

    tokio::time::sleep(Duration::from_millis(400)).await;
    executor.request_stop();
    handle.await.unwrap();

    assert!(saw_already_completed.load(Ordering::SeqCst));

    let final_view = client
        .get_job_chain(created.id, "workerless_test")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(final_view.output, Some(json!({ "result": 99 })));
}
