//! `StateAdapter` over PostgreSQL. Row-locking follows the `FOR UPDATE SKIP
//! LOCKED` claim pattern, generalized from "claim any ready job" to "claim
//! a job of one of several types, validate ownership on every mutation, and
//! track chain/blocker/dedup bookkeeping alongside the row itself".

use crate::SCHEMA_SQL;
use chrono::{DateTime, Duration, Utc};
use jobchain_core::{
    select_match, BlockerState, ChainId, ChainView, ContinueWithSpec, CreatedChain,
    DedupCandidate, Job, JobId, JobStatus, StartJobChainSpec, StateAdapter, StateError, TypeName,
};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

/// PostgreSQL-backed [`StateAdapter`]. Cheap to clone: `PgPool` is itself a
/// handle onto a shared connection pool.
#[derive(Clone)]
pub struct PgStateAdapter {
    pool: PgPool,
}

impl PgStateAdapter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs [`SCHEMA_SQL`] against the pool. Not part of the `StateAdapter`
    /// contract — a convenience for `demos/*` binaries and integration
    /// tests that need a scratch schema without a separate migrations
    /// runner.
    pub async fn run_schema(&self) -> Result<(), StateError> {
        sqlx::raw_sql(SCHEMA_SQL)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    /// Per-status row counts. Not part of the `StateAdapter` contract —
    /// an operator/demo convenience.
    pub async fn stats(&self) -> Result<QueueStats, StateError> {
        let row: (i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending')  AS pending,
                COUNT(*) FILTER (WHERE status = 'blocked')  AS blocked,
                COUNT(*) FILTER (WHERE status = 'acquired') AS acquired,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed
            FROM jobs
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(QueueStats {
            pending: row.0 as u64,
            blocked: row.1 as u64,
            acquired: row.2 as u64,
            completed: row.3 as u64,
        })
    }
}

/// Snapshot of job counts by status, returned by [`PgStateAdapter::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: u64,
    pub blocked: u64,
    pub acquired: u64,
    pub completed: u64,
}

fn map_sqlx(err: sqlx::Error) -> StateError {
    StateError::Transient(err.into())
}

fn parse_status(raw: &str) -> Result<JobStatus, StateError> {
    match raw {
        "pending" => Ok(JobStatus::Pending),
        "blocked" => Ok(JobStatus::Blocked),
        "acquired" => Ok(JobStatus::Acquired),
        "completed" => Ok(JobStatus::Completed),
        other => Err(StateError::Unknown(anyhow::anyhow!(
            "unrecognized job status `{other}`"
        ))),
    }
}

fn scope_str(scope: jobchain_core::DeduplicationScope) -> &'static str {
    match scope {
        jobchain_core::DeduplicationScope::Incomplete => "incomplete",
        jobchain_core::DeduplicationScope::Any => "any",
    }
}

/// Raw row shape matching `schema.sql`'s `jobs` table, one level below the
/// richer [`Job`] model (`status`/`dedup_scope` stay strings until parsed).
#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    type_name: String,
    chain_id: Uuid,
    chain_type_name: String,
    root_chain_id: Uuid,
    origin_id: Option<Uuid>,
    status: String,
    input: Value,
    output: Option<Value>,
    attempt: i32,
    scheduled_at: DateTime<Utc>,
    lease_expires_at: Option<DateTime<Utc>>,
    worker_id: Option<String>,
    last_attempt_error: Option<String>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    trace_context: Option<Value>,
    dedup_key: Option<String>,
    dedup_scope: Option<String>,
    dedup_window_ms: Option<i64>,
}

impl TryFrom<JobRow> for Job {
    type Error = StateError;

    fn try_from(row: JobRow) -> Result<Self, StateError> {
        Ok(Job {
            id: row.id,
            type_name: row.type_name,
            chain_id: row.chain_id,
            chain_type_name: row.chain_type_name,
            root_chain_id: row.root_chain_id,
            origin_id: row.origin_id,
            input: row.input,
            status: parse_status(&row.status)?,
            attempt: row.attempt,
            scheduled_at: row.scheduled_at,
            lease_expires_at: row.lease_expires_at,
            worker_id: row.worker_id,
            output: row.output,
            last_attempt_error: row.last_attempt_error,
            created_at: row.created_at,
            completed_at: row.completed_at,
            trace_context: row.trace_context,
            deduplication_key: row.dedup_key,
            deduplication_scope: row
                .dedup_scope
                .as_deref()
                .map(|s| match s {
                    "incomplete" => Ok(jobchain_core::DeduplicationScope::Incomplete),
                    "any" => Ok(jobchain_core::DeduplicationScope::Any),
                    other => Err(StateError::Unknown(anyhow::anyhow!(
                        "unrecognized dedup scope `{other}`"
                    ))),
                })
                .transpose()?,
            deduplication_window_ms: row.dedup_window_ms,
        })
    }
}

/// The current (most recently continued-to) job of a chain: the one no
/// other job in the chain names as its `origin_id`.
const CURRENT_CHAIN_JOB_SQL: &str = r#"
    SELECT * FROM jobs
    WHERE chain_id = $1 AND id NOT IN (
        SELECT origin_id FROM jobs WHERE chain_id = $1 AND origin_id IS NOT NULL
    )
"#;

#[async_trait::async_trait]
impl StateAdapter for PgStateAdapter {
    type Tx = sqlx::Transaction<'static, sqlx::Postgres>;

    async fn begin(&self) -> Result<Self::Tx, StateError> {
        self.pool.begin().await.map_err(map_sqlx)
    }

    async fn commit(&self, tx: Self::Tx) -> Result<(), StateError> {
        tx.commit().await.map_err(map_sqlx)
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<(), StateError> {
        tx.rollback().await.map_err(map_sqlx)
    }

    async fn create_job_chain(
        &self,
        tx: &mut Self::Tx,
        spec: StartJobChainSpec,
    ) -> Result<CreatedChain, StateError> {
        if let Some(dedup) = &spec.deduplication {
            #[derive(sqlx::FromRow)]
            struct DedupRow {
                id: Uuid,
                created_at: DateTime<Utc>,
                status: String,
            }

            let rows: Vec<DedupRow> = sqlx::query_as(
                "SELECT id, created_at, status FROM jobs WHERE id = chain_id AND dedup_key = $1",
            )
            .bind(&dedup.key)
            .fetch_all(&mut **tx)
            .await
            .map_err(map_sqlx)?;

            let candidates = rows
                .iter()
                .map(|r| {
                    Ok(DedupCandidate {
                        chain_id: r.id,
                        created_at: r.created_at,
                        completed: parse_status(&r.status)? == JobStatus::Completed,
                    })
                })
                .collect::<Result<Vec<_>, StateError>>()?;

            if let Some(existing_id) =
                select_match(&candidates, dedup.scope, dedup.window_ms, Utc::now())
            {
                let status = rows
                    .iter()
                    .find(|r| r.id == existing_id)
                    .map(|r| parse_status(&r.status))
                    .transpose()?
                    .unwrap_or(JobStatus::Pending);
                return Ok(CreatedChain {
                    id: existing_id,
                    status,
                    deduplicated: true,
                });
            }
        }

        let now = Utc::now();
        let id = Uuid::new_v4();
        let scheduled_at = spec.schedule.unwrap_or(now);
        let (dedup_key, dedup_scope, dedup_window_ms) = match &spec.deduplication {
            Some(d) => (
                Some(d.key.clone()),
                Some(scope_str(d.scope).to_string()),
                d.window_ms,
            ),
            None => (None, None, None),
        };

        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, type_name, chain_id, chain_type_name, root_chain_id, origin_id,
                status, input, output, attempt, scheduled_at, lease_expires_at, worker_id,
                last_attempt_error, created_at, completed_at, trace_context,
                dedup_key, dedup_scope, dedup_window_ms
            ) VALUES (
                $1, $2, $1, $2, $1, NULL,
                'pending', $3, NULL, 1, $4, NULL, NULL,
                NULL, $5, NULL, $6,
                $7, $8, $9
            )
            "#,
        )
        .bind(id)
        .bind(&spec.type_name)
        .bind(&spec.input)
        .bind(scheduled_at)
        .bind(now)
        .bind(&spec.trace_context)
        .bind(dedup_key)
        .bind(dedup_scope)
        .bind(dedup_window_ms)
        .execute(&mut **tx)
        .await
        .map_err(map_sqlx)?;

        Ok(CreatedChain {
            id,
            status: JobStatus::Pending,
            deduplicated: false,
        })
    }

    async fn add_job_blockers(
        &self,
        tx: &mut Self::Tx,
        job_id: JobId,
        blocker_chain_ids: &[ChainId],
    ) -> Result<(), StateError> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM jobs WHERE id = $1)")
            .bind(job_id)
            .fetch_one(&mut **tx)
            .await
            .map_err(map_sqlx)?;
        if !exists {
            return Err(StateError::NotFound);
        }

        if blocker_chain_ids.is_empty() {
            return Ok(());
        }

        let mut any_unsatisfied = false;
        for &blocker_chain_id in blocker_chain_ids {
            let blocker_exists: bool =
                sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM jobs WHERE id = $1)")
                    .bind(blocker_chain_id)
                    .fetch_one(&mut **tx)
                    .await
                    .map_err(map_sqlx)?;
            if !blocker_exists {
                return Err(StateError::BlockerChainDeleted);
            }

            let current: Option<JobRow> = sqlx::query_as(CURRENT_CHAIN_JOB_SQL)
                .bind(blocker_chain_id)
                .fetch_optional(&mut **tx)
                .await
                .map_err(map_sqlx)?;
            let satisfied = current
                .map(|r| r.status == "completed")
                .unwrap_or(false);

            sqlx::query(
                "INSERT INTO job_blockers (blocked_job_id, blocker_chain_id, satisfied) VALUES ($1, $2, $3)",
            )
            .bind(job_id)
            .bind(blocker_chain_id)
            .bind(satisfied)
            .execute(&mut **tx)
            .await
            .map_err(map_sqlx)?;

            any_unsatisfied |= !satisfied;
        }

        let new_status = if any_unsatisfied { "blocked" } else { "pending" };
        sqlx::query("UPDATE jobs SET status = $1 WHERE id = $2")
            .bind(new_status)
            .bind(job_id)
            .execute(&mut **tx)
            .await
            .map_err(map_sqlx)?;

        Ok(())
    }

    async fn adopt_chain(
        &self,
        tx: &mut Self::Tx,
        chain_id: ChainId,
        new_root_chain_id: ChainId,
    ) -> Result<(), StateError> {
        sqlx::query("UPDATE jobs SET root_chain_id = $1 WHERE root_chain_id = $2")
            .bind(new_root_chain_id)
            .bind(chain_id)
            .execute(&mut **tx)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn refetch_job_for_update(
        &self,
        tx: &mut Self::Tx,
        job_id: JobId,
        worker_id: &str,
    ) -> Result<Job, StateError> {
        let row: Option<JobRow> = sqlx::query_as("SELECT * FROM jobs WHERE id = $1 FOR UPDATE")
            .bind(job_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(map_sqlx)?;
        let job = Job::try_from(row.ok_or(StateError::NotFound)?)?;
        if job.status == JobStatus::Completed {
            return Err(StateError::AlreadyCompleted);
        }
        if job.worker_id.as_deref() != Some(worker_id) {
            return Err(StateError::TakenByAnotherWorker);
        }
        Ok(job)
    }

    async fn complete_job(
        &self,
        tx: &mut Self::Tx,
        job_id: JobId,
        output: Value,
        worker_id: &str,
    ) -> Result<Job, StateError> {
        let current: Option<JobRow> = sqlx::query_as("SELECT * FROM jobs WHERE id = $1 FOR UPDATE")
            .bind(job_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(map_sqlx)?;
        let current = current.ok_or(StateError::NotFound)?;
        if current.status == "completed" {
            return Err(StateError::AlreadyCompleted);
        }
        if current.worker_id.as_deref() != Some(worker_id) {
            return Err(StateError::TakenByAnotherWorker);
        }

        let row: JobRow = sqlx::query_as(
            "UPDATE jobs SET status = 'completed', output = $1, completed_at = $2 WHERE id = $3 RETURNING *",
        )
        .bind(&output)
        .bind(Utc::now())
        .bind(job_id)
        .fetch_one(&mut **tx)
        .await
        .map_err(map_sqlx)?;

        Job::try_from(row)
    }

    async fn continue_with_job(
        &self,
        tx: &mut Self::Tx,
        from_job_id: JobId,
        spec: ContinueWithSpec,
    ) -> Result<Job, StateError> {
        let from_row: Option<JobRow> =
            sqlx::query_as("SELECT * FROM jobs WHERE id = $1 FOR UPDATE")
                .bind(from_job_id)
                .fetch_optional(&mut **tx)
                .await
                .map_err(map_sqlx)?;
        let from = Job::try_from(from_row.ok_or(StateError::NotFound)?)?;
        if from.status == JobStatus::Completed {
            return Err(StateError::AlreadyCompleted);
        }

        let now = Utc::now();
        let new_id = Uuid::new_v4();
        let scheduled_at = spec.schedule.unwrap_or(now);

        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, type_name, chain_id, chain_type_name, root_chain_id, origin_id,
                status, input, output, attempt, scheduled_at, lease_expires_at, worker_id,
                last_attempt_error, created_at, completed_at, trace_context,
                dedup_key, dedup_scope, dedup_window_ms
            ) VALUES (
                $1, $2, $3, $4, $5, $6,
                'pending', $7, NULL, 1, $8, NULL, NULL,
                NULL, $9, NULL, $10,
                NULL, NULL, NULL
            )
            "#,
        )
        .bind(new_id)
        .bind(&spec.type_name)
        .bind(from.chain_id)
        .bind(&from.chain_type_name)
        .bind(from.root_chain_id)
        .bind(from_job_id)
        .bind(&spec.input)
        .bind(scheduled_at)
        .bind(now)
        .bind(&from.trace_context)
        .execute(&mut **tx)
        .await
        .map_err(map_sqlx)?;

        if !spec.blockers.is_empty() {
            self.add_job_blockers(tx, new_id, &spec.blockers).await?;
        }

        sqlx::query("UPDATE jobs SET status = 'completed', output = $1, completed_at = $2 WHERE id = $3")
            .bind(Value::Null)
            .bind(now)
            .bind(from_job_id)
            .execute(&mut **tx)
            .await
            .map_err(map_sqlx)?;

        let row: JobRow = sqlx::query_as("SELECT * FROM jobs WHERE id = $1")
            .bind(new_id)
            .fetch_one(&mut **tx)
            .await
            .map_err(map_sqlx)?;
        Job::try_from(row)
    }

    async fn lock_chain_head_for_completion(
        &self,
        tx: &mut Self::Tx,
        chain_id: ChainId,
        type_name: &str,
    ) -> Result<Job, StateError> {
        let head: Option<JobRow> = sqlx::query_as("SELECT * FROM jobs WHERE id = $1")
            .bind(chain_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(map_sqlx)?;
        let head = head.ok_or(StateError::NotFound)?;
        if head.chain_type_name != type_name {
            return Err(StateError::NotFound);
        }

        let row: Option<JobRow> = sqlx::query_as(&format!("{CURRENT_CHAIN_JOB_SQL} FOR UPDATE"))
            .bind(chain_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(map_sqlx)?;
        Job::try_from(row.ok_or(StateError::NotFound)?)
    }

    async fn force_complete_job(
        &self,
        tx: &mut Self::Tx,
        job_id: JobId,
        output: Value,
    ) -> Result<Job, StateError> {
        let existing: Option<(String,)> = sqlx::query_as("SELECT status FROM jobs WHERE id = $1 FOR UPDATE")
            .bind(job_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(map_sqlx)?;
        let (status,) = existing.ok_or(StateError::NotFound)?;
        if status == "completed" {
            return Err(StateError::AlreadyCompleted);
        }

        let row: JobRow = sqlx::query_as(
            r#"
            UPDATE jobs
            SET status = 'completed', output = $1, completed_at = $2, worker_id = NULL, lease_expires_at = NULL
            WHERE id = $3
            RETURNING *
            "#,
        )
        .bind(&output)
        .bind(Utc::now())
        .bind(job_id)
        .fetch_one(&mut **tx)
        .await
        .map_err(map_sqlx)?;

        Job::try_from(row)
    }

    async fn schedule_blocked_jobs(
        &self,
        tx: &mut Self::Tx,
        blocker_chain_id: ChainId,
    ) -> Result<Vec<(JobId, TypeName)>, StateError> {
        let candidate_job_ids: Vec<Uuid> = sqlx::query_scalar(
            "SELECT DISTINCT blocked_job_id FROM job_blockers WHERE blocker_chain_id = $1 AND satisfied = FALSE",
        )
        .bind(blocker_chain_id)
        .fetch_all(&mut **tx)
        .await
        .map_err(map_sqlx)?;

        sqlx::query("UPDATE job_blockers SET satisfied = TRUE WHERE blocker_chain_id = $1")
            .bind(blocker_chain_id)
            .execute(&mut **tx)
            .await
            .map_err(map_sqlx)?;

        let mut unblocked = Vec::new();
        for job_id in candidate_job_ids {
            let all_satisfied: bool = sqlx::query_scalar(
                "SELECT COALESCE(BOOL_AND(satisfied), TRUE) FROM job_blockers WHERE blocked_job_id = $1",
            )
            .bind(job_id)
            .fetch_one(&mut **tx)
            .await
            .map_err(map_sqlx)?;

            if !all_satisfied {
                continue;
            }

            let updated: Option<(String,)> = sqlx::query_as(
                "UPDATE jobs SET status = 'pending', scheduled_at = $1 WHERE id = $2 AND status = 'blocked' RETURNING type_name",
            )
            .bind(Utc::now())
            .bind(job_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(map_sqlx)?;

            if let Some((type_name,)) = updated {
                unblocked.push((job_id, type_name));
            }
        }

        Ok(unblocked)
    }

    async fn reschedule_job(
        &self,
        tx: &mut Self::Tx,
        job_id: JobId,
        schedule: DateTime<Utc>,
        error_text: &str,
        worker_id: &str,
    ) -> Result<(), StateError> {
        let existing: Option<(String, Option<String>)> =
            sqlx::query_as("SELECT status, worker_id FROM jobs WHERE id = $1 FOR UPDATE")
                .bind(job_id)
                .fetch_optional(&mut **tx)
                .await
                .map_err(map_sqlx)?;
        let (status, existing_worker) = existing.ok_or(StateError::NotFound)?;
        if status == "completed" {
            return Err(StateError::AlreadyCompleted);
        }
        if existing_worker.as_deref() != Some(worker_id) {
            return Err(StateError::TakenByAnotherWorker);
        }

        let error_text_opt = if error_text.is_empty() { None } else { Some(error_text) };
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending', attempt = attempt + 1, last_attempt_error = $1,
                scheduled_at = $2, worker_id = NULL, lease_expires_at = NULL
            WHERE id = $3
            "#,
        )
        .bind(error_text_opt)
        .bind(schedule)
        .bind(job_id)
        .execute(&mut **tx)
        .await
        .map_err(map_sqlx)?;

        Ok(())
    }

    async fn delete_job_chains(
        &self,
        tx: &mut Self::Tx,
        root_chain_ids: &[ChainId],
    ) -> Result<(), StateError> {
        for &root_id in root_chain_ids {
            let root_chain_id: Option<Uuid> =
                sqlx::query_scalar("SELECT root_chain_id FROM jobs WHERE id = $1")
                    .bind(root_id)
                    .fetch_optional(&mut **tx)
                    .await
                    .map_err(map_sqlx)?;
            match root_chain_id {
                None => return Err(StateError::NotFound),
                Some(actual_root) if actual_root != root_id => {
                    return Err(StateError::MustDeleteFromRoot(actual_root));
                }
                Some(_) => {}
            }
        }

        let closure_job_ids: Vec<Uuid> = sqlx::query_scalar(
            "SELECT id FROM jobs WHERE root_chain_id = ANY($1)",
        )
        .bind(root_chain_ids)
        .fetch_all(&mut **tx)
        .await
        .map_err(map_sqlx)?;

        let dependent: Option<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT blocker_chain_id FROM job_blockers
            WHERE blocker_chain_id = ANY($1) AND blocked_job_id <> ALL($1)
            LIMIT 1
            "#,
        )
        .bind(&closure_job_ids)
        .fetch_optional(&mut **tx)
        .await
        .map_err(map_sqlx)?;

        if let Some((blocker_chain_id,)) = dependent {
            return Err(StateError::ExternalDependents(blocker_chain_id));
        }

        sqlx::query("DELETE FROM job_blockers WHERE blocked_job_id = ANY($1) OR blocker_chain_id = ANY($1)")
            .bind(&closure_job_ids)
            .execute(&mut **tx)
            .await
            .map_err(map_sqlx)?;

        sqlx::query("DELETE FROM jobs WHERE id = ANY($1)")
            .bind(&closure_job_ids)
            .execute(&mut **tx)
            .await
            .map_err(map_sqlx)?;

        Ok(())
    }

    async fn acquire_job(
        &self,
        tx: &mut Self::Tx,
        type_names: &[TypeName],
        worker_id: &str,
        lease_ms: i64,
    ) -> Result<Option<Job>, StateError> {
        let now = Utc::now();
        let lease_expires_at = now + Duration::milliseconds(lease_ms);

        let row: Option<JobRow> = sqlx::query_as(
            r#"
            WITH candidate AS (
                SELECT id FROM jobs
                WHERE status = 'pending' AND type_name = ANY($1) AND scheduled_at <= $2
                ORDER BY scheduled_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'acquired', worker_id = $3, lease_expires_at = $4
            WHERE id IN (SELECT id FROM candidate)
            RETURNING *
            "#,
        )
        .bind(type_names)
        .bind(now)
        .bind(worker_id)
        .bind(lease_expires_at)
        .fetch_optional(&mut **tx)
        .await
        .map_err(map_sqlx)?;

        row.map(Job::try_from).transpose()
    }

    async fn renew_job_lease(
        &self,
        job_id: JobId,
        worker_id: &str,
        lease_ms: i64,
    ) -> Result<(), StateError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        let existing: Option<(String, Option<String>)> =
            sqlx::query_as("SELECT status, worker_id FROM jobs WHERE id = $1 FOR UPDATE")
                .bind(job_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_sqlx)?;
        let (status, existing_worker) = existing.ok_or(StateError::NotFound)?;
        if status == "completed" {
            return Err(StateError::AlreadyCompleted);
        }
        if existing_worker.as_deref() != Some(worker_id) {
            return Err(StateError::TakenByAnotherWorker);
        }

        sqlx::query("UPDATE jobs SET lease_expires_at = $1 WHERE id = $2")
            .bind(Utc::now() + Duration::milliseconds(lease_ms))
            .bind(job_id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;

        tx.commit().await.map_err(map_sqlx)?;
        Ok(())
    }

    async fn reap_expired_leases(&self, type_names: &[TypeName]) -> Result<Vec<JobId>, StateError> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE jobs
            SET status = 'pending', attempt = attempt + 1, worker_id = NULL, lease_expires_at = NULL
            WHERE status = 'acquired' AND type_name = ANY($1) AND lease_expires_at < $2
            RETURNING id
            "#,
        )
        .bind(type_names)
        .bind(Utc::now())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn get_job_blockers(&self, job_id: JobId) -> Result<Vec<BlockerState>, StateError> {
        let edges: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT blocker_chain_id FROM job_blockers WHERE blocked_job_id = $1",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        let mut states = Vec::with_capacity(edges.len());
        for (blocker_chain_id,) in edges {
            let head_row: Option<JobRow> = sqlx::query_as("SELECT * FROM jobs WHERE id = $1")
                .bind(blocker_chain_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx)?;
            let original_blocker_head = Job::try_from(head_row.ok_or(StateError::NotFound)?)?;

            let current_row: Option<JobRow> = sqlx::query_as(CURRENT_CHAIN_JOB_SQL)
                .bind(blocker_chain_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx)?;
            let current_blocker_state = match current_row {
                Some(row) => Job::try_from(row)?,
                None => original_blocker_head.clone(),
            };

            states.push(BlockerState {
                original_blocker_head,
                current_blocker_state,
            });
        }

        Ok(states)
    }

    async fn get_next_job_available_in_ms(
        &self,
        type_names: &[TypeName],
    ) -> Result<Option<i64>, StateError> {
        let earliest: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT MIN(scheduled_at) FROM jobs WHERE status = 'pending' AND type_name = ANY($1)",
        )
        .bind(type_names)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(earliest.map(|at| (at - Utc::now()).num_milliseconds().max(0)))
    }

    async fn get_job_chain(
        &self,
        id: ChainId,
        type_name: &str,
    ) -> Result<Option<ChainView>, StateError> {
        let head: Option<JobRow> = sqlx::query_as("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        let Some(head) = head else {
            return Ok(None);
        };
        if head.chain_type_name != type_name {
            return Ok(None);
        }
        let head = Job::try_from(head)?;

        let tip_row: Option<JobRow> = sqlx::query_as(CURRENT_CHAIN_JOB_SQL)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        let tip = match tip_row {
            Some(row) => Job::try_from(row)?,
            None => head.clone(),
        };

        Ok(Some(ChainView {
            id: head.chain_id,
            type_name: head.chain_type_name,
            root_chain_id: tip.root_chain_id,
            status: tip.status,
            current_job_id: tip.id,
            output: tip.output,
            last_attempt_error: tip.last_attempt_error,
            created_at: head.created_at,
            completed_at: tip.completed_at,
        }))
    }
}
