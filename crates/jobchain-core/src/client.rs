//! Client API (§4.8): the public surface application code calls to start,
//! inspect, workerlessly complete, delete, and wait on job chains.
//!
//! Every mutating operation here is a single call to
//! [`crate::tx::run_in_transaction`] — callers never see a bare `StateAdapter`
//! or manage a `TxContext` themselves, matching §9's "forbid state calls
//! outside a context".

use crate::blocker::{unblock_dependents, wire_blockers};
use crate::error::{ClientError, StateError};
use crate::model::{ChainId, ChainView, CreatedChain, Job, JobStatus, StartJobChainSpec};
use crate::notify::NotifyAdapter;
use crate::registry::TypeRegistry;
use crate::state::StateAdapter;
use crate::tx::{run_in_transaction, TxContext};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::instrument;

/// Application-facing handle bundling a state store, a notify backend, and
/// the caller's type registry. Cheap to clone: every field is itself meant
/// to be a cheap handle (a pool, a broadcast sender, an immutable registry).
pub struct Client<A: StateAdapter, N: NotifyAdapter, R: TypeRegistry> {
    state: A,
    notify: N,
    registry: Arc<R>,
}

impl<A, N, R> Client<A, N, R>
where
    A: StateAdapter,
    N: NotifyAdapter,
    R: TypeRegistry,
{
    pub fn new(state: A, notify: N, registry: R) -> Self {
        Self {
            state,
            notify,
            registry: Arc::new(registry),
        }
    }

    pub fn state(&self) -> &A {
        &self.state
    }

    pub fn notify(&self) -> &N {
        &self.notify
    }

    /// `startJobChain` (§4.8). Validates `type_name` is a registered entry
    /// type and runs `input` through the registry's parser before insertion.
    ///
    /// Blockers are taken as already-existing chain ids (see
    /// [`crate::model::StartJobChainSpec`]); this client does not re-run
    /// `validateBlockers` against them, since doing so would need each
    /// blocker's type name and original input, neither of which survive past
    /// its own `start_job_chain` call (see DESIGN.md).
    #[instrument(skip(self, spec), fields(type_name = %spec.type_name))]
    pub async fn start_job_chain(&self, spec: StartJobChainSpec) -> Result<CreatedChain, ClientError> {
        run_in_transaction(&self.state, &self.notify, |ctx: &mut TxContext<'_, A>| async move {
            self.create_job_chain_in(ctx, spec).await
        })
        .await
    }

    /// Create a chain head inside an already-open transaction, for composing
    /// several chain creations into one commit — the pattern §4.5 calls
    /// "blocker edges declared at creation time" adoption, and the one
    /// `withNotify` (§4.8) exists to enable: a caller building a chain and
    /// its blocker together reaches this through [`Client::with_notify`]
    /// instead of two separate [`Client::start_job_chain`] transactions, so
    /// a blocker created moments earlier in the same `with_notify` call is
    /// adopted into the new chain's root rather than staying independent.
    pub async fn create_job_chain_in(
        &self,
        ctx: &mut TxContext<'_, A>,
        spec: StartJobChainSpec,
    ) -> Result<CreatedChain, ClientError> {
        self.registry.validate_entry(&spec.type_name)?;
        let parsed_input = self.registry.parse_input(&spec.type_name, &spec.input)?;

        let mut spec = spec;
        spec.input = parsed_input;
        let blockers = spec.blockers.clone();
        let type_name = spec.type_name.clone();

        let created = ctx.adapter().create_job_chain(ctx.tx(), spec).await?;
        ctx.mark_created(created.id);

        if !created.deduplicated {
            wire_blockers(ctx, created.id, created.id, &blockers).await?;
            // Best-effort: a spurious notification for a job that turned
            // out blocked is harmless (notify is at-most-once-per-event,
            // never authoritative — §4.9, §5).
            ctx.defer_job_scheduled(vec![type_name]);
        }

        Ok(created)
    }

    /// `getJobChain` (§4.8). `None` if not found.
    pub async fn get_job_chain(
        &self,
        id: ChainId,
        type_name: &str,
    ) -> Result<Option<ChainView>, ClientError> {
        Ok(self.state.get_job_chain(id, type_name).await?)
    }

    /// `completeJobChain` (§4.8). `complete` receives the chain's current
    /// job and returns `Some(output)` to finalize it or `None` to leave it
    /// untouched (read-only inspection). On finalization, emits
    /// `job-ownership-lost` so any worker mid-attempt on this job aborts.
    #[instrument(skip(self, complete))]
    pub async fn complete_job_chain<F, Fut>(
        &self,
        chain_id: ChainId,
        type_name: &str,
        complete: F,
    ) -> Result<ChainView, ClientError>
    where
        F: for<'b> FnOnce(&'b Job) -> Fut + Send,
        Fut: Future<Output = Option<Value>> + Send,
    {
        run_in_transaction(&self.state, &self.notify, |ctx: &mut TxContext<'_, A>| async move {
            let job = ctx
                .adapter()
                .lock_chain_head_for_completion(ctx.tx(), chain_id, type_name)
                .await?;

            if job.status == JobStatus::Completed {
                return Err(ClientError::State(StateError::AlreadyCompleted));
            }

            let decision = complete(&job).await;

            let final_job = match decision {
                Some(output) => {
                    let parsed_output = self.registry.parse_output(&job.type_name, &output)?;
                    let completed = ctx
                        .adapter()
                        .force_complete_job(ctx.tx(), job.id, parsed_output)
                        .await?;
                    ctx.defer_job_ownership_lost(job.id);
                    unblock_dependents(ctx, completed.chain_id).await?;
                    completed
                }
                None => job,
            };

            Ok::<_, ClientError>(job_to_chain_view(&final_job))
        })
        .await
    }

    /// `deleteJobChains` (§4.8). Rejects with distinct errors for
    /// non-root-id and external-dependent closures (§7).
    pub async fn delete_job_chains(&self, root_chain_ids: &[ChainId]) -> Result<(), ClientError> {
        run_in_transaction(&self.state, &self.notify, |ctx: &mut TxContext<'_, A>| async move {
            ctx.adapter()
                .delete_job_chains(ctx.tx(), root_chain_ids)
                .await?;
            Ok::<_, ClientError>(())
        })
        .await
    }

    /// `waitForJobChainCompletion` (§4.8). Polls `getJobChain` until
    /// `status = completed`, a deadline elapses, or `cancel` fires —
    /// whichever comes first.
    pub async fn wait_for_job_chain_completion(
        &self,
        chain_id: ChainId,
        type_name: &str,
        config: crate::config::WaitForChainConfig,
        cancel: Option<&tokio::sync::Notify>,
    ) -> Result<ChainView, ClientError> {
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_millis(config.timeout_ms.max(0) as u64);
        let poll_interval = std::time::Duration::from_millis(config.poll_interval_ms.max(1) as u64);

        loop {
            match self.state.get_job_chain(chain_id, type_name).await? {
                None => return Err(ClientError::NotFound(chain_id)),
                Some(view) if view.status == JobStatus::Completed => return Ok(view),
                Some(_) => {}
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(ClientError::WaitForJobChainCompletionTimeoutError(chain_id));
            }

            let cancelled = tokio::select! {
                _ = tokio::time::sleep_until(deadline.min(tokio::time::Instant::now() + poll_interval)) => false,
                _ = wait_cancel(cancel) => true,
            };

            if cancelled {
                return Err(ClientError::WaitForJobChainCompletionTimeoutError(chain_id));
            }
        }
    }

    /// `withNotify` (§4.8): run several client-level mutations inside one
    /// transaction, with pending notifications flushed exactly once after
    /// it commits. `f` receives the same `TxContext` every
    /// [`StateAdapter`]-level helper in this crate takes.
    pub async fn with_notify<F, Fut, T>(&self, f: F) -> Result<T, ClientError>
    where
        F: for<'b> FnOnce(&'b mut TxContext<'_, A>) -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        run_in_transaction(&self.state, &self.notify, f).await
    }
}

async fn wait_cancel(cancel: Option<&tokio::sync::Notify>) {
    match cancel {
        Some(notify) => notify.notified().await,
        None => std::future::pending().await,
    }
}

fn job_to_chain_view(job: &Job) -> ChainView {
    ChainView {
        id: job.chain_id,
        type_name: job.chain_type_name.clone(),
        root_chain_id: job.root_chain_id,
        status: job.status,
        current_job_id: job.id,
        output: job.output.clone(),
        last_attempt_error: job.last_attempt_error.clone(),
        created_at: job.created_at,
        completed_at: job.completed_at,
    }
}
