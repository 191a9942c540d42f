//! Executor / worker loop (§4.4). Polls for ready jobs of a set of owned
//! types, dispatches each acquired job to the Runner, and bounds how many
//! attempts run concurrently with a semaphore — the same pattern worker
//! loops in this corpus use for concurrency limiting.

use crate::config::{ExecutorConfig, RetryConfig};
use crate::error::RunnerError;
use crate::notify::NotifyAdapter;
use crate::retry;
use crate::runner::{AttemptOutcome, JobProcessor, PrepareMode};
use crate::state::StateAdapter;
use crate::tx::TxContext;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};

/// A registered `(typeName → processor)` table, owned by one Executor.
#[derive(Default)]
pub struct ProcessorRegistry {
    processors: HashMap<String, Arc<dyn JobProcessor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, type_name: impl Into<String>, processor: Arc<dyn JobProcessor>) -> Self {
        self.processors.insert(type_name.into(), processor);
        self
    }

    pub fn type_names(&self) -> Vec<String> {
        self.processors.keys().cloned().collect()
    }

    fn get(&self, type_name: &str) -> Option<Arc<dyn JobProcessor>> {
        self.processors.get(type_name).cloned()
    }
}

/// Runs the worker loop for one process (§4.4). Owns no state itself beyond
/// configuration and a handle to stop; all durable state lives behind
/// `StateAdapter`.
pub struct Executor<A: StateAdapter + Clone, N: NotifyAdapter> {
    state: A,
    notify: Arc<N>,
    config: ExecutorConfig,
    processors: Arc<ProcessorRegistry>,
    stop: Arc<tokio::sync::Notify>,
    stopped: Arc<std::sync::atomic::AtomicBool>,
}

impl<A, N> Executor<A, N>
where
    A: StateAdapter + Clone,
    N: NotifyAdapter,
{
    pub fn new(state: A, notify: Arc<N>, config: ExecutorConfig, processors: ProcessorRegistry) -> Self {
        Self {
            state,
            notify,
            config,
            processors: Arc::new(processors),
            stop: Arc::new(tokio::sync::Notify::new()),
            stopped: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    /// Request the loop stop. In-flight attempts are joined, never killed
    /// (§4.4 "Stop semantics").
    pub fn request_stop(&self) {
        self.stopped.store(true, std::sync::atomic::Ordering::SeqCst);
        self.stop.notify_waiters();
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Run the worker loop until `request_stop` is called. Returns once every
    /// in-flight attempt has finished.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn run(&self) {
        let own_types = self.processors.type_names();
        if own_types.is_empty() {
            warn!("executor started with no registered processors, nothing to do");
            return;
        }

        if let Err(err) = self.state.reap_expired_leases(&own_types).await {
            warn!(error = %err, "initial lease reap failed");
        }

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut inflight = Vec::new();

        loop {
            if self.is_stopped() {
                break;
            }

            let permit = tokio::select! {
                _ = self.stop.notified() => break,
                permit = semaphore.clone().acquire_owned() => permit.expect("semaphore never closed"),
            };

            if self.is_stopped() {
                drop(permit);
                break;
            }

            if !self.wait_for_work(&own_types).await {
                drop(permit);
                continue;
            }

            let state = self.state.clone();
            let notify = self.notify.clone();
            let processors = self.processors.clone();
            let config = self.config.clone();
            let own_types_for_task = own_types.clone();
            let stop = self.stop.clone();

            let handle = tokio::spawn(async move {
                let _permit = permit;
                perform_job_loop(state, notify, processors, config, own_types_for_task, stop).await;
            });
            inflight.push(handle);

            inflight.retain(|h: &tokio::task::JoinHandle<()>| !h.is_finished());
        }

        for handle in inflight {
            let _ = handle.await;
        }
        info!("executor loop stopped, all attempts drained");
    }

    /// Step 2 of §4.4: race the `job-scheduled` subscription against a
    /// jittered sleep capped by the adapter's own availability estimate.
    async fn wait_for_work(&self, own_types: &[String]) -> bool {
        let pull_delay_ms = match self.state.get_next_job_available_in_ms(own_types).await {
            Ok(Some(ms)) => ms.min(self.config.poll_interval_ms).max(0),
            Ok(None) => self.config.poll_interval_ms,
            Err(err) => {
                warn!(error = %err, "failed to compute next job availability, falling back to poll interval");
                self.config.poll_interval_ms
            }
        };

        let jittered = retry::jittered_ms(pull_delay_ms).max(0) as u64;
        let mut subscription = self.notify.listen_job_scheduled(own_types.to_vec()).await;

        tokio::select! {
            _ = self.stop.notified() => false,
            _ = subscription.notified() => true,
            _ = tokio::time::sleep(std::time::Duration::from_millis(jittered)) => true,
        }
    }
}

/// Step 3 of §4.4: keep performing jobs back-to-back while the adapter keeps
/// reporting more available, pacing each iteration by `nextJobDelayMs`.
///
/// A `perform_job` error is a fatal/transient store failure (§7
/// "Repeated transient failures at the worker-loop level use
/// `workerLoopRetryConfig` with its own backoff"), not an attempt-level
/// error — those are already recovered inside `perform_job`/the Runner.
/// Rather than falling straight back to the outer poll interval, this loop
/// retries in place with its own escalating backoff, resetting the
/// consecutive-failure count on the next successful iteration.
async fn perform_job_loop<A, N>(
    state: A,
    notify: Arc<N>,
    processors: Arc<ProcessorRegistry>,
    config: ExecutorConfig,
    own_types: Vec<String>,
    stop: Arc<tokio::sync::Notify>,
) where
    A: StateAdapter + Clone,
    N: NotifyAdapter,
{
    let mut consecutive_failures: i32 = 0;

    loop {
        match perform_job(&state, notify.as_ref(), &processors, &config, &own_types).await {
            Ok(true) => {
                consecutive_failures = 0;
                let delay = retry::jittered_ms(config.next_job_delay_ms).max(0) as u64;
                if delay > 0 {
                    tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                }
            }
            Ok(false) => break,
            Err(err) => {
                consecutive_failures += 1;
                let worker_loop_retry = RetryConfig {
                    initial_delay_ms: config.worker_loop_retry.initial_delay_ms,
                    multiplier: config.worker_loop_retry.multiplier,
                    max_delay_ms: config.worker_loop_retry.max_delay_ms,
                };
                let delay_ms = retry::backoff_delay_ms(&worker_loop_retry, consecutive_failures);
                error!(error = %err, attempt = consecutive_failures, delay_ms, "worker loop attempt failed, backing off before retrying");

                tokio::select! {
                    _ = stop.notified() => break,
                    _ = tokio::time::sleep(std::time::Duration::from_millis(delay_ms.max(0) as u64)) => {}
                }
            }
        }
    }
}

/// §4.4 step 4: `performJob()`. Opens a transaction, acquires one job, and
/// dispatches it to the Runner in whichever `PrepareMode` the matched
/// processor declares. Returns whether another job may be immediately
/// available.
#[instrument(skip(state, notify, processors, config), fields(worker_id = %config.worker_id))]
async fn perform_job<A, N>(
    state: &A,
    notify: &N,
    processors: &ProcessorRegistry,
    config: &ExecutorConfig,
    own_types: &[String],
) -> Result<bool, RunnerError>
where
    A: StateAdapter + Clone,
    N: NotifyAdapter,
{
    let mut ctx = TxContext::begin(state).await?;
    let adapter = ctx.adapter();
    let job = adapter
        .acquire_job(ctx.tx(), own_types, &config.worker_id, config.lease.lease_ms)
        .await?;

    let Some(job) = job else {
        ctx.rollback().await?;
        return Ok(false);
    };

    let processor = match processors.get(&job.type_name) {
        Some(processor) => processor,
        None => {
            ctx.rollback().await?;
            return Err(RunnerError::NoProcessorRegistered(job.type_name));
        }
    };

    debug!(job_id = %job.id, type_name = %job.type_name, attempt = job.attempt, "acquired job");

    match processor.prepare_mode() {
        PrepareMode::Atomic => {
            let outcome = crate::runner::run_attempt_atomic(
                &mut ctx,
                job,
                &config.worker_id,
                &config.retry,
                processor.as_ref(),
            )
            .await?;
            ctx.commit(notify).await?;
            log_outcome(outcome);
        }
        PrepareMode::Staged => {
            ctx.commit(notify).await?;
            let outcome = crate::runner::run_attempt_staged(
                state,
                notify,
                job,
                &config.worker_id,
                &config.lease,
                &config.retry,
                processor.as_ref(),
            )
            .await?;
            log_outcome(outcome);
        }
    }

    Ok(true)
}

fn log_outcome(outcome: AttemptOutcome) {
    match outcome {
        AttemptOutcome::Completed => debug!("attempt completed"),
        AttemptOutcome::Continued => debug!("attempt continued chain"),
        AttemptOutcome::Rescheduled => debug!("attempt rescheduled"),
        AttemptOutcome::AbortedSilently(reason) => {
            debug!(?reason, "attempt aborted silently, not a worker error")
        }
    }
}
