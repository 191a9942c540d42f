//! Job Process Runner (§4.2): the per-attempt state machine. Orchestrates
//! prepare mode selection, lease lifecycle, ownership-loss handling,
//! completion, continuation, and retry/reschedule.
//!
//! The source models this as a handler that calls `prepare(...)` and
//! `complete(callback)` at most once each, enforced at runtime by throwing
//! if called twice. Re-architected here per §9 ("exceptions for control
//! flow" / "closed-over callbacks"): a [`JobProcessor`] simply *returns* a
//! [`Disposition`] once, so "called at most once" becomes a property of
//! Rust's single-return-value control flow rather than a runtime check.

use crate::abort::AbortSignal;
use crate::config::{LeaseConfig, RetryConfig};
use crate::error::{AbortReason, RunnerError, StateError};
use crate::model::{ContinueWithSpec, Job};
use crate::notify::NotifyAdapter;
use crate::retry;
use crate::state::StateAdapter;
use crate::tx::TxContext;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, instrument, warn};

/// Which transaction shape an attempt uses (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareMode {
    /// The entire attempt runs inside the acquiring transaction. No lease
    /// renewal occurs. Best for short attempts that finish well within the
    /// database transaction timeout.
    Atomic,
    /// The acquiring transaction commits immediately after acquisition.
    /// The Runner then starts the Lease Manager and subscribes to
    /// ownership-loss while the handler runs, opening a fresh transaction
    /// for the complete phase.
    Staged,
}

/// Read-only attempt context handed to a [`JobProcessor`].
pub struct AttemptContext {
    job: Job,
    abort: AbortSignal,
}

impl AttemptContext {
    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn input(&self) -> &Value {
        &self.job.input
    }

    pub fn attempt(&self) -> i32 {
        self.job.attempt
    }

    /// The abort signal for this attempt (§4.2, §5). Handlers are expected
    /// to honor it at natural suspension points but are not required to.
    pub fn abort_signal(&self) -> &AbortSignal {
        &self.abort
    }
}

/// What an attempt handler decided to do (§4.2 "complete phase").
pub enum Disposition {
    /// Mark this job, and its chain if this was the terminal job,
    /// completed with `output`.
    Complete(Value),
    /// Insert exactly one successor job and mark this job completed with a
    /// `null` output (§4.1 `continueWithJob`).
    ContinueWith(ContinueWithSpec),
}

/// A handler's per-attempt error. The `Reschedule` sentinel mirrors the
/// source's `rescheduleJob(schedule)` thrown value (§4.2, §9 "Exceptions
/// for control flow") — a typed value instead of a thrown sentinel error.
#[derive(Debug, thiserror::Error)]
pub enum AttemptError {
    #[error("explicit reschedule requested")]
    Reschedule {
        schedule: chrono::DateTime<chrono::Utc>,
    },
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

#[async_trait]
pub trait JobProcessor: Send + Sync {
    /// The prepare mode this processor requires. Defaults to `Staged`,
    /// matching "if prepare is never called, auto-setup runs
    /// prepare({mode: staged}) lazily before complete" (§4.2) — the Runner
    /// never calls an explicit atomic fast path unless a processor opts in.
    fn prepare_mode(&self) -> PrepareMode {
        PrepareMode::Staged
    }

    async fn process(&self, ctx: &AttemptContext) -> Result<Disposition, AttemptError>;
}

/// Final disposition of one attempt, as reported to the Executor for its
/// own poll-again decision and observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Completed,
    Continued,
    Rescheduled,
    /// The complete phase's revalidation found the job already completed,
    /// deleted, or held by another worker. Not a worker error (§4.2, §7).
    AbortedSilently(AbortReason),
}

/// Run one attempt in **atomic** mode: `ctx` is the same transaction the
/// Executor used to acquire the job. The caller is responsible for
/// committing it afterwards.
#[instrument(skip(ctx, processor), fields(job_id = %job.id, worker_id))]
pub async fn run_attempt_atomic<A: StateAdapter>(
    ctx: &mut TxContext<'_, A>,
    job: Job,
    worker_id: &str,
    retry_config: &RetryConfig,
    processor: &dyn JobProcessor,
) -> Result<AttemptOutcome, RunnerError> {
    let attempt_ctx = AttemptContext {
        job: job.clone(),
        abort: AbortSignal::new(),
    };

    match processor.process(&attempt_ctx).await {
        Ok(disposition) => apply_disposition(ctx, &job, worker_id, disposition).await,
        Err(AttemptError::Reschedule { schedule }) => {
            reschedule(ctx, &job, worker_id, schedule, "").await
        }
        Err(AttemptError::Failed(err)) => {
            let schedule = retry::next_schedule(retry_config, job.attempt, chrono::Utc::now());
            reschedule(ctx, &job, worker_id, schedule, &err.to_string()).await
        }
    }
}

/// Run one attempt in **staged** mode. The caller has already committed
/// the acquiring transaction (after `acquire_job`); this function opens and
/// commits the complete-phase transaction itself.
#[instrument(skip(state, notify, processor), fields(job_id = %job.id, worker_id))]
pub async fn run_attempt_staged<A, N>(
    state: &A,
    notify: &N,
    job: Job,
    worker_id: &str,
    lease_config: &LeaseConfig,
    retry_config: &RetryConfig,
    processor: &dyn JobProcessor,
) -> Result<AttemptOutcome, RunnerError>
where
    A: StateAdapter + Clone,
    N: NotifyAdapter,
{
    let abort = AbortSignal::new();

    let mut lease_manager = crate::lease::LeaseManager::start(
        state.clone(),
        job.id,
        worker_id.to_string(),
        *lease_config,
        abort.clone(),
    );

    let mut ownership_lost = notify.listen_job_ownership_lost(job.id).await;
    let abort_for_listener = abort.clone();
    let listener_task = tokio::spawn(async move {
        ownership_lost.notified().await;
        abort_for_listener.fire(AbortReason::AlreadyCompleted);
    });

    let attempt_ctx = AttemptContext {
        job: job.clone(),
        abort: abort.clone(),
    };

    let process_result = processor.process(&attempt_ctx).await;
    lease_manager.stop().await;
    listener_task.abort();

    let disposition_result = match process_result {
        Ok(disposition) => Ok(disposition),
        Err(AttemptError::Reschedule { schedule }) => {
            return complete_phase_reschedule(state, notify, &job, worker_id, schedule, "").await;
        }
        Err(AttemptError::Failed(err)) => {
            let schedule = retry::next_schedule(retry_config, job.attempt, chrono::Utc::now());
            return complete_phase_reschedule(
                state,
                notify,
                &job,
                worker_id,
                schedule,
                &err.to_string(),
            )
            .await;
        }
    };

    let disposition = disposition_result.expect("checked above");

    let mut ctx = TxContext::begin(state).await?;
    match ctx.tx_refetch_for_complete(&job, worker_id).await {
        Ok(()) => {
            let outcome = apply_disposition(&mut ctx, &job, worker_id, disposition).await;
            match outcome {
                Ok(outcome) => {
                    ctx.commit(notify).await?;
                    Ok(outcome)
                }
                Err(err) => {
                    let _ = ctx.rollback().await;
                    Err(err)
                }
            }
        }
        Err(reason) => {
            let _ = ctx.rollback().await;
            info!(job_id = %job.id, ?reason, "complete phase revalidation failed, exiting silently");
            Ok(AttemptOutcome::AbortedSilently(reason))
        }
    }
}

/// Helper extension so the revalidation step reads naturally at the call
/// site above; lives here rather than on `TxContext` itself since it is
/// specific to the runner's refetch-then-classify dance (§4.2).
#[async_trait::async_trait]
trait RefetchForComplete<A: StateAdapter> {
    async fn tx_refetch_for_complete(
        &mut self,
        job: &Job,
        worker_id: &str,
    ) -> Result<(), AbortReason>;
}

#[async_trait::async_trait]
impl<A: StateAdapter + Send + Sync> RefetchForComplete<A> for TxContext<'_, A> {
    async fn tx_refetch_for_complete(
        &mut self,
        job: &Job,
        worker_id: &str,
    ) -> Result<(), AbortReason> {
        let adapter = self.adapter();
        match adapter.refetch_job_for_update(self.tx(), job.id, worker_id).await {
            Ok(_) => Ok(()),
            Err(StateError::AlreadyCompleted) => Err(AbortReason::AlreadyCompleted),
            Err(StateError::NotFound) => Err(AbortReason::NotFound),
            Err(StateError::TakenByAnotherWorker) => Err(AbortReason::TakenByAnotherWorker),
            Err(_) => Err(AbortReason::Error),
        }
    }
}

async fn complete_phase_reschedule<A, N>(
    state: &A,
    notify: &N,
    job: &Job,
    worker_id: &str,
    schedule: chrono::DateTime<chrono::Utc>,
    error_text: &str,
) -> Result<AttemptOutcome, RunnerError>
where
    A: StateAdapter,
    N: NotifyAdapter,
{
    let mut ctx = TxContext::begin(state).await?;
    match ctx.tx_refetch_for_complete(job, worker_id).await {
        Ok(()) => match reschedule(&mut ctx, job, worker_id, schedule, error_text).await {
            Ok(outcome) => {
                ctx.commit(notify).await?;
                Ok(outcome)
            }
            Err(err) => {
                let _ = ctx.rollback().await;
                Err(err)
            }
        },
        Err(reason) => {
            let _ = ctx.rollback().await;
            Ok(AttemptOutcome::AbortedSilently(reason))
        }
    }
}

async fn apply_disposition<A: StateAdapter>(
    ctx: &mut TxContext<'_, A>,
    job: &Job,
    worker_id: &str,
    disposition: Disposition,
) -> Result<AttemptOutcome, RunnerError> {
    let adapter = ctx.adapter();
    match disposition {
        Disposition::Complete(output) => {
            let completed = adapter.complete_job(ctx.tx(), job.id, output, worker_id).await?;
            crate::blocker::unblock_dependents(ctx, completed.chain_id).await?;
            Ok(AttemptOutcome::Completed)
        }
        Disposition::ContinueWith(spec) => {
            let type_name = spec.type_name.clone();
            adapter.continue_with_job(ctx.tx(), job.id, spec).await?;
            ctx.defer_job_scheduled(vec![type_name]);
            Ok(AttemptOutcome::Continued)
        }
    }
}

async fn reschedule<A: StateAdapter>(
    ctx: &mut TxContext<'_, A>,
    job: &Job,
    worker_id: &str,
    schedule: chrono::DateTime<chrono::Utc>,
    error_text: &str,
) -> Result<AttemptOutcome, RunnerError> {
    let adapter = ctx.adapter();
    adapter
        .reschedule_job(ctx.tx(), job.id, schedule, error_text, worker_id)
        .await?;
    ctx.defer_job_scheduled(vec![job.type_name.clone()]);
    if !error_text.is_empty() {
        warn!(job_id = %job.id, error = error_text, "attempt rescheduled after failure");
    }
    Ok(AttemptOutcome::Rescheduled)
}
