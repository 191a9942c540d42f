//! The State Adapter contract (§4.1). This is the transactional boundary:
//! every mutating operation takes `&mut Self::Tx`, obtained only from
//! [`crate::tx::run_in_transaction`]. Three operations manage their own
//! transaction internally because they are each a single atomic unit that is
//! never nested inside a caller's transaction: `acquire_job`,
//! `renew_job_lease`, `reap_expired_leases`. The remaining reads
//! (`get_job_blockers`, `get_next_job_available_in_ms`, `get_job_chain`) are
//! declared read-only and safe to call outside a transaction.

use crate::error::StateError;
use crate::model::{
    BlockerState, ChainId, ChainView, ContinueWithSpec, CreatedChain, Job, JobId,
    StartJobChainSpec, TypeName,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

#[async_trait]
pub trait StateAdapter: Send + Sync + 'static {
    /// An open transaction handle. Implementations that genuinely have no
    /// notion of a transaction (the in-memory test double) may use a
    /// zero-sized marker and rely on a single mutex for serialization.
    type Tx: Send;

    async fn begin(&self) -> Result<Self::Tx, StateError>;
    async fn commit(&self, tx: Self::Tx) -> Result<(), StateError>;
    async fn rollback(&self, tx: Self::Tx) -> Result<(), StateError>;

    // ---- Transactional operations -----------------------------------

    /// Insert a chain head job in `pending`. Honors deduplication: returns
    /// `{id, deduplicated:true}` without inserting a new row if a matching
    /// record exists in the chosen scope/window (§4.6).
    async fn create_job_chain(
        &self,
        tx: &mut Self::Tx,
        spec: StartJobChainSpec,
    ) -> Result<CreatedChain, StateError>;

    /// Insert blocker edges for `job_id`, one per `blocker_chain_ids`
    /// entry. Each edge is marked satisfied immediately if its blocker
    /// chain is already completed. Sets `status = blocked` on `job_id` iff
    /// at least one inserted edge is unsatisfied, `pending` otherwise.
    /// Rejects with [`StateError::BlockerChainDeleted`] if any referenced
    /// chain has been deleted.
    async fn add_job_blockers(
        &self,
        tx: &mut Self::Tx,
        job_id: JobId,
        blocker_chain_ids: &[ChainId],
    ) -> Result<(), StateError>;

    /// Update `root_chain_id` transitively for `chain_id` and every job
    /// originated or continued from it, so that `delete_job_chains` from
    /// `new_root_chain_id` cascades to it (§4.5 "adopted chain"). Only
    /// called by the blocker resolver for chains created in the same
    /// transaction as the blocker declaration (see DESIGN.md, Open
    /// Question resolution).
    async fn adopt_chain(
        &self,
        tx: &mut Self::Tx,
        chain_id: ChainId,
        new_root_chain_id: ChainId,
    ) -> Result<(), StateError>;

    /// Row-lock and validate current ownership without mutating anything.
    /// `TakenByAnotherWorker` if `worker_id` mismatches, `NotFound` if
    /// deleted, `AlreadyCompleted` if completed.
    async fn refetch_job_for_update(
        &self,
        tx: &mut Self::Tx,
        job_id: JobId,
        worker_id: &str,
    ) -> Result<Job, StateError>;

    /// Set `status = completed`, `output`, `completed_at`. Rejects if
    /// `worker_id` mismatches or the job is already completed.
    async fn complete_job(
        &self,
        tx: &mut Self::Tx,
        job_id: JobId,
        output: Value,
        worker_id: &str,
    ) -> Result<Job, StateError>;

    /// Insert a successor job inheriting `chain_id`, `chain_type_name`,
    /// `root_chain_id` from `from_job_id`'s chain; sets `origin_id =
    /// from_job_id`. Atomically marks `from_job_id` itself `completed`
    /// (with a `null` output — the chain's externally visible output is
    /// always the terminal job's) in the same statement/transaction, so
    /// callers never call `complete_job` separately for a job that
    /// continues.
    async fn continue_with_job(
        &self,
        tx: &mut Self::Tx,
        from_job_id: JobId,
        spec: ContinueWithSpec,
    ) -> Result<Job, StateError>;

    /// Row-lock the chain's current job (the most recent of its
    /// continuation, not necessarily the head) with no ownership check, for
    /// workerless completion (§4.8 `completeJobChain`). `NotFound` if the
    /// chain doesn't exist or `type_name` doesn't match its `chain_type_name`.
    async fn lock_chain_head_for_completion(
        &self,
        tx: &mut Self::Tx,
        chain_id: ChainId,
        type_name: &str,
    ) -> Result<Job, StateError>;

    /// Complete `job_id` with `output` regardless of current `worker_id` or
    /// lease state (§4.8 `completeJobChain`'s workerless path). Rejects only
    /// with `AlreadyCompleted`.
    async fn force_complete_job(
        &self,
        tx: &mut Self::Tx,
        job_id: JobId,
        output: Value,
    ) -> Result<Job, StateError>;

    /// For every edge referencing `blocker_chain_id`, mark it satisfied.
    /// For every blocked job whose edges are now all satisfied, set
    /// `status = pending` and `scheduled_at = now`. Idempotent. Returns the
    /// id and type name of each job that transitioned to `pending` so the
    /// caller can emit `job-scheduled` notifications without a second
    /// round-trip to look up type names.
    async fn schedule_blocked_jobs(
        &self,
        tx: &mut Self::Tx,
        blocker_chain_id: ChainId,
    ) -> Result<Vec<(JobId, TypeName)>, StateError>;

    /// Set `status = pending`, advance `attempt`, write
    /// `last_attempt_error`, set `scheduled_at` per `schedule`. Rejects on
    /// ownership mismatch.
    async fn reschedule_job(
        &self,
        tx: &mut Self::Tx,
        job_id: JobId,
        schedule: DateTime<Utc>,
        error_text: &str,
        worker_id: &str,
    ) -> Result<(), StateError>;

    /// Delete the root chains and the transitive tree of originated,
    /// continued, and blocker chains whose root is in `root_chain_ids`.
    /// Rejects with [`StateError::MustDeleteFromRoot`] if any id names a
    /// non-root chain, or [`StateError::ExternalDependents`] if any chain
    /// in the closure has an incoming blocker edge from a chain outside
    /// the closure.
    async fn delete_job_chains(
        &self,
        tx: &mut Self::Tx,
        root_chain_ids: &[ChainId],
    ) -> Result<(), StateError>;

    /// Atomically pick one `pending` job of one of `type_names` whose
    /// `scheduled_at <= now`, set `status = acquired`, `worker_id`,
    /// `lease_expires_at = now + lease_ms`. At most one worker acquires a
    /// given job. `None` if no job is ready. Called by the Executor inside
    /// a transaction it opened itself (§4.4 step 4); the Runner either
    /// keeps using that same transaction (atomic mode) or lets it commit
    /// right after acquisition (staged mode, §4.2).
    async fn acquire_job(
        &self,
        tx: &mut Self::Tx,
        type_names: &[TypeName],
        worker_id: &str,
        lease_ms: i64,
    ) -> Result<Option<Job>, StateError>;

    // ---- Self-contained atomic operations ----------------------------
    //
    // These two are standalone maintenance operations invoked on their own
    // timers (the Lease Manager's periodic renewal, the Reaper's sweep),
    // never nested inside a caller's business transaction, so they manage
    // their own transaction internally.

    /// Extend `lease_expires_at`. `TakenByAnotherWorker` if `worker_id`
    /// mismatches, `NotFound` if deleted, `AlreadyCompleted` if completed.
    async fn renew_job_lease(
        &self,
        job_id: JobId,
        worker_id: &str,
        lease_ms: i64,
    ) -> Result<(), StateError>;

    /// For every `acquired` job of one of `type_names` whose
    /// `lease_expires_at < now`, revert to `pending` and bump `attempt`.
    /// Returns the reclaimed job ids so the caller can emit
    /// `job-ownership-lost`.
    async fn reap_expired_leases(&self, type_names: &[TypeName]) -> Result<Vec<JobId>, StateError>;

    // ---- Read-only operations -----------------------------------------

    /// Ordered as declared on the blocked job.
    async fn get_job_blockers(&self, job_id: JobId) -> Result<Vec<BlockerState>, StateError>;

    /// Milliseconds until the earliest `pending` job of `type_names`
    /// becomes available, or `None` if there is none scheduled. The caller
    /// (the Scheduler, §4.4 step 2) caps this against its own poll
    /// interval.
    async fn get_next_job_available_in_ms(
        &self,
        type_names: &[TypeName],
    ) -> Result<Option<i64>, StateError>;

    /// Chain view for client consumption. `None` if not found.
    async fn get_job_chain(
        &self,
        id: ChainId,
        type_name: &str,
    ) -> Result<Option<ChainView>, StateError>;
}
