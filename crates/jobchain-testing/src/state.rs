//! In-memory State Adapter. Mutating operations serialize through one
//! global lock (`tx_lock`) that stands in for a real transaction: at most
//! one logical transaction is open at a time, and each mutation records a
//! before-image in the transaction's undo log so `rollback` can restore it.
//!
//! This trades true snapshot isolation for simplicity — acceptable for a
//! single-process test double where callers typically `.await` a commit
//! before issuing the next read.

use chrono::Utc;
use dashmap::DashMap;
use jobchain_core::{
    BlockerEdge, BlockerState, ChainId, ChainView, ContinueWithSpec, CreatedChain, Job, JobId,
    JobStatus, StartJobChainSpec, StateAdapter, StateError, TypeName,
};
use jobchain_core::{select_match, DedupCandidate};
use serde_json::Value;
use smallvec::SmallVec;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

type EdgeList = SmallVec<[BlockerEdge; 4]>;

enum Undo {
    Job(JobId, Option<Job>),
    Blockers(JobId, Option<EdgeList>),
}

pub struct MemTx {
    _guard: OwnedMutexGuard<()>,
    undo: Vec<Undo>,
}

struct Inner {
    jobs: DashMap<JobId, Job>,
    blockers: DashMap<JobId, EdgeList>,
    tx_lock: Arc<Mutex<()>>,
}

/// In-memory, single-process [`StateAdapter`]. Cheap to clone: it's a
/// handle onto a shared `Arc<Inner>`, mirroring a connection-pool handle.
#[derive(Clone)]
pub struct InMemoryStateAdapter {
    inner: Arc<Inner>,
}

impl Default for InMemoryStateAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStateAdapter {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                jobs: DashMap::new(),
                blockers: DashMap::new(),
                tx_lock: Arc::new(Mutex::new(())),
            }),
        }
    }

    fn put_job(&self, tx: &mut MemTx, job: Job) {
        let id = job.id;
        let prior = self.inner.jobs.insert(id, job);
        tx.undo.push(Undo::Job(id, prior));
    }

    fn record_job_undo(&self, tx: &mut MemTx, id: JobId) {
        let prior = self.inner.jobs.get(&id).map(|r| r.clone());
        tx.undo.push(Undo::Job(id, prior));
    }

    fn put_blockers(&self, tx: &mut MemTx, job_id: JobId, edges: EdgeList) {
        let prior = self.inner.blockers.insert(job_id, edges);
        tx.undo.push(Undo::Blockers(job_id, prior));
    }

    /// The current (most recently continued-to) job of a chain: the one no
    /// other job in the same `chain_id` names as its `origin_id`.
    fn current_chain_job(&self, chain_id: ChainId) -> Option<Job> {
        let members: Vec<Job> = self
            .inner
            .jobs
            .iter()
            .filter(|e| e.chain_id == chain_id)
            .map(|e| e.clone())
            .collect();
        let origins: std::collections::HashSet<JobId> =
            members.iter().filter_map(|j| j.origin_id).collect();
        members.into_iter().find(|j| !origins.contains(&j.id))
    }

    /// Wire blocker edges onto `job_id`, returning whether the job should
    /// be left `blocked` (at least one unsatisfied edge).
    fn wire_blockers_locked(
        &self,
        tx: &mut MemTx,
        job_id: JobId,
        blocker_chain_ids: &[ChainId],
    ) -> Result<bool, StateError> {
        if blocker_chain_ids.is_empty() {
            return Ok(false);
        }

        let mut edges = EdgeList::new();
        for &blocker_chain_id in blocker_chain_ids {
            if !self.inner.jobs.contains_key(&blocker_chain_id) {
                return Err(StateError::BlockerChainDeleted);
            }
            let satisfied = self
                .current_chain_job(blocker_chain_id)
                .map(|j| j.status == JobStatus::Completed)
                .unwrap_or(false);
            edges.push(BlockerEdge {
                blocked_job_id: job_id,
                blocker_chain_id,
                satisfied,
            });
        }

        let any_unsatisfied = edges.iter().any(|e| !e.satisfied);
        self.put_blockers(tx, job_id, edges);
        Ok(any_unsatisfied)
    }
}

#[async_trait::async_trait]
impl StateAdapter for InMemoryStateAdapter {
    type Tx = MemTx;

    async fn begin(&self) -> Result<Self::Tx, StateError> {
        let guard = self.inner.tx_lock.clone().lock_owned().await;
        Ok(MemTx {
            _guard: guard,
            undo: Vec::new(),
        })
    }

    async fn commit(&self, _tx: Self::Tx) -> Result<(), StateError> {
        Ok(())
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<(), StateError> {
        for entry in tx.undo.into_iter().rev() {
            match entry {
                Undo::Job(id, Some(prior)) => {
                    self.inner.jobs.insert(id, prior);
                }
                Undo::Job(id, None) => {
                    self.inner.jobs.remove(&id);
                }
                Undo::Blockers(id, Some(prior)) => {
                    self.inner.blockers.insert(id, prior);
                }
                Undo::Blockers(id, None) => {
                    self.inner.blockers.remove(&id);
                }
            }
        }
        Ok(())
    }

    async fn create_job_chain(
        &self,
        tx: &mut Self::Tx,
        spec: StartJobChainSpec,
    ) -> Result<CreatedChain, StateError> {
        if let Some(dedup) = &spec.deduplication {
            let candidates: Vec<DedupCandidate> = self
                .inner
                .jobs
                .iter()
                .filter(|e| e.is_chain_head() && e.deduplication_key.as_deref() == Some(&dedup.key))
                .map(|e| DedupCandidate {
                    chain_id: e.id,
                    created_at: e.created_at,
                    completed: e.status == JobStatus::Completed,
                })
                .collect();

            if let Some(existing_id) =
                select_match(&candidates, dedup.scope, dedup.window_ms, Utc::now())
            {
                let existing = self.inner.jobs.get(&existing_id).unwrap();
                return Ok(CreatedChain {
                    id: existing_id,
                    status: existing.status,
                    deduplicated: true,
                });
            }
        }

        let now = Utc::now();
        let id = uuid::Uuid::new_v4();
        let job = Job {
            id,
            type_name: spec.type_name.clone(),
            chain_id: id,
            chain_type_name: spec.type_name,
            root_chain_id: id,
            origin_id: None,
            input: spec.input,
            status: JobStatus::Pending,
            attempt: 1,
            scheduled_at: spec.schedule.unwrap_or(now),
            lease_expires_at: None,
            worker_id: None,
            output: None,
            last_attempt_error: None,
            created_at: now,
            completed_at: None,
            trace_context: spec.trace_context,
            deduplication_key: spec.deduplication.as_ref().map(|d| d.key.clone()),
            deduplication_scope: spec.deduplication.as_ref().map(|d| d.scope),
            deduplication_window_ms: spec.deduplication.as_ref().and_then(|d| d.window_ms),
        };

        self.put_job(tx, job);
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
        if !self.inner.jobs.contains_key(&job_id) {
            return Err(StateError::NotFound);
        }

        let blocked = self.wire_blockers_locked(tx, job_id, blocker_chain_ids)?;

        self.record_job_undo(tx, job_id);
        let mut job = self.inner.jobs.get_mut(&job_id).ok_or(StateError::NotFound)?;
        job.status = if blocked { JobStatus::Blocked } else { JobStatus::Pending };
        Ok(())
    }

    async fn adopt_chain(
        &self,
        tx: &mut Self::Tx,
        chain_id: ChainId,
        new_root_chain_id: ChainId,
    ) -> Result<(), StateError> {
        let affected: Vec<JobId> = self
            .inner
            .jobs
            .iter()
            .filter(|e| e.root_chain_id == chain_id)
            .map(|e| e.id)
            .collect();

        for job_id in affected {
            self.record_job_undo(tx, job_id);
            if let Some(mut job) = self.inner.jobs.get_mut(&job_id) {
                job.root_chain_id = new_root_chain_id;
            }
        }
        Ok(())
    }

    async fn refetch_job_for_update(
        &self,
        _tx: &mut Self::Tx,
        job_id: JobId,
        worker_id: &str,
    ) -> Result<Job, StateError> {
        let job = self.inner.jobs.get(&job_id).ok_or(StateError::NotFound)?;
        if job.status == JobStatus::Completed {
            return Err(StateError::AlreadyCompleted);
        }
        if job.worker_id.as_deref() != Some(worker_id) {
            return Err(StateError::TakenByAnotherWorker);
        }
        Ok(job.clone())
    }

    async fn complete_job(
        &self,
        tx: &mut Self::Tx,
        job_id: JobId,
        output: Value,
        worker_id: &str,
    ) -> Result<Job, StateError> {
        {
            let job = self.inner.jobs.get(&job_id).ok_or(StateError::NotFound)?;
            if job.status == JobStatus::Completed {
                return Err(StateError::AlreadyCompleted);
            }
            if job.worker_id.as_deref() != Some(worker_id) {
                return Err(StateError::TakenByAnotherWorker);
            }
        }

        self.record_job_undo(tx, job_id);
        let mut job = self.inner.jobs.get_mut(&job_id).ok_or(StateError::NotFound)?;
        job.status = JobStatus::Completed;
        job.output = Some(output);
        job.completed_at = Some(Utc::now());
        Ok(job.clone())
    }

    async fn continue_with_job(
        &self,
        tx: &mut Self::Tx,
        from_job_id: JobId,
        spec: ContinueWithSpec,
    ) -> Result<Job, StateError> {
        let from = self
            .inner
            .jobs
            .get(&from_job_id)
            .ok_or(StateError::NotFound)?
            .clone();
        if from.status == JobStatus::Completed {
            return Err(StateError::AlreadyCompleted);
        }

        let now = Utc::now();
        let new_id = uuid::Uuid::new_v4();
        let new_job = Job {
            id: new_id,
            type_name: spec.type_name,
            chain_id: from.chain_id,
            chain_type_name: from.chain_type_name.clone(),
            root_chain_id: from.root_chain_id,
            origin_id: Some(from_job_id),
            input: spec.input,
            status: JobStatus::Pending,
            attempt: 1,
            scheduled_at: spec.schedule.unwrap_or(now),
            lease_expires_at: None,
            worker_id: None,
            output: None,
            last_attempt_error: None,
            created_at: now,
            completed_at: None,
            trace_context: from.trace_context.clone(),
            deduplication_key: None,
            deduplication_scope: None,
            deduplication_window_ms: None,
        };

        self.put_job(tx, new_job.clone());
        let blocked = self.wire_blockers_locked(tx, new_id, &spec.blockers)?;
        if blocked {
            self.record_job_undo(tx, new_id);
            if let Some(mut job) = self.inner.jobs.get_mut(&new_id) {
                job.status = JobStatus::Blocked;
            }
        }

        self.record_job_undo(tx, from_job_id);
        let mut from_mut = self.inner.jobs.get_mut(&from_job_id).ok_or(StateError::NotFound)?;
        from_mut.status = JobStatus::Completed;
        from_mut.output = Some(Value::Null);
        from_mut.completed_at = Some(now);

        Ok(self.inner.jobs.get(&new_id).unwrap().clone())
    }

    async fn lock_chain_head_for_completion(
        &self,
        _tx: &mut Self::Tx,
        chain_id: ChainId,
        type_name: &str,
    ) -> Result<Job, StateError> {
        let head = self.inner.jobs.get(&chain_id).ok_or(StateError::NotFound)?;
        if head.chain_type_name != type_name {
            return Err(StateError::NotFound);
        }
        drop(head);
        self.current_chain_job(chain_id).ok_or(StateError::NotFound)
    }

    async fn force_complete_job(
        &self,
        tx: &mut Self::Tx,
        job_id: JobId,
        output: Value,
    ) -> Result<Job, StateError> {
        {
            let job = self.inner.jobs.get(&job_id).ok_or(StateError::NotFound)?;
            if job.status == JobStatus::Completed {
                return Err(StateError::AlreadyCompleted);
            }
        }
        self.record_job_undo(tx, job_id);
        let mut job = self.inner.jobs.get_mut(&job_id).ok_or(StateError::NotFound)?;
        job.status = JobStatus::Completed;
        job.output = Some(output);
        job.completed_at = Some(Utc::now());
        job.worker_id = None;
        job.lease_expires_at = None;
        Ok(job.clone())
    }

    async fn schedule_blocked_jobs(
        &self,
        tx: &mut Self::Tx,
        blocker_chain_id: ChainId,
    ) -> Result<Vec<(JobId, TypeName)>, StateError> {
        let candidates: Vec<JobId> = self
            .inner
            .blockers
            .iter()
            .filter(|e| {
                e.value()
                    .iter()
                    .any(|edge| edge.blocker_chain_id == blocker_chain_id && !edge.satisfied)
            })
            .map(|e| *e.key())
            .collect();

        let mut unblocked = Vec::new();
        for job_id in candidates {
            let mut edges = self.inner.blockers.get(&job_id).map(|e| e.clone()).unwrap_or_default();
            for edge in edges.iter_mut() {
                if edge.blocker_chain_id == blocker_chain_id {
                    edge.satisfied = true;
                }
            }
            self.put_blockers(tx, job_id, edges.clone());

            if edges.iter().all(|e| e.satisfied) {
                self.record_job_undo(tx, job_id);
                if let Some(mut job) = self.inner.jobs.get_mut(&job_id) {
                    if job.status == JobStatus::Blocked {
                        job.status = JobStatus::Pending;
                        job.scheduled_at = Utc::now();
                        unblocked.push((job.id, job.type_name.clone()));
                    }
                }
            }
        }

        Ok(unblocked)
    }

    async fn reschedule_job(
        &self,
        tx: &mut Self::Tx,
        job_id: JobId,
        schedule: chrono::DateTime<Utc>,
        error_text: &str,
        worker_id: &str,
    ) -> Result<(), StateError> {
        {
            let job = self.inner.jobs.get(&job_id).ok_or(StateError::NotFound)?;
            if job.status == JobStatus::Completed {
                return Err(StateError::AlreadyCompleted);
            }
            if job.worker_id.as_deref() != Some(worker_id) {
                return Err(StateError::TakenByAnotherWorker);
            }
        }

        self.record_job_undo(tx, job_id);
        let mut job = self.inner.jobs.get_mut(&job_id).ok_or(StateError::NotFound)?;
        job.status = JobStatus::Pending;
        job.attempt += 1;
        job.last_attempt_error = if error_text.is_empty() {
            None
        } else {
            Some(error_text.to_string())
        };
        job.scheduled_at = schedule;
        job.worker_id = None;
        job.lease_expires_at = None;
        Ok(())
    }

    async fn delete_job_chains(
        &self,
        tx: &mut Self::Tx,
        root_chain_ids: &[ChainId],
    ) -> Result<(), StateError> {
        for &root_id in root_chain_ids {
            let head = self.inner.jobs.get(&root_id).ok_or(StateError::NotFound)?;
            if head.root_chain_id != root_id {
                return Err(StateError::MustDeleteFromRoot(head.root_chain_id));
            }
        }

        let roots: std::collections::HashSet<ChainId> = root_chain_ids.iter().copied().collect();
        let closure_jobs: Vec<Job> = self
            .inner
            .jobs
            .iter()
            .filter(|e| roots.contains(&e.root_chain_id))
            .map(|e| e.clone())
            .collect();
        let closure_chain_ids: std::collections::HashSet<ChainId> =
            closure_jobs.iter().map(|j| j.chain_id).collect();

        for edges in self.inner.blockers.iter() {
            for edge in edges.value().iter() {
                if closure_chain_ids.contains(&edge.blocker_chain_id) {
                    let dependent_in_closure = closure_jobs.iter().any(|j| j.id == edge.blocked_job_id);
                    if !dependent_in_closure {
                        return Err(StateError::ExternalDependents(edge.blocker_chain_id));
                    }
                }
            }
        }

        for job in &closure_jobs {
            self.record_job_undo(tx, job.id);
            self.inner.jobs.remove(&job.id);
            if let Some(prior) = self.inner.blockers.remove(&job.id) {
                tx.undo.push(Undo::Blockers(job.id, Some(prior.1)));
            } else {
                tx.undo.push(Undo::Blockers(job.id, None));
            }
        }

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
        let candidate = self
            .inner
            .jobs
            .iter()
            .filter(|e| {
                e.status == JobStatus::Pending
                    && type_names.contains(&e.type_name)
                    && e.scheduled_at <= now
            })
            .min_by_key(|e| e.scheduled_at)
            .map(|e| e.id);

        let Some(job_id) = candidate else {
            return Ok(None);
        };

        self.record_job_undo(tx, job_id);
        let mut job = self.inner.jobs.get_mut(&job_id).ok_or(StateError::NotFound)?;
        job.status = JobStatus::Acquired;
        job.worker_id = Some(worker_id.to_string());
        job.lease_expires_at = Some(now + chrono::Duration::milliseconds(lease_ms));
        Ok(Some(job.clone()))
    }

    async fn renew_job_lease(
        &self,
        job_id: JobId,
        worker_id: &str,
        lease_ms: i64,
    ) -> Result<(), StateError> {
        let _guard = self.inner.tx_lock.lock().await;
        let mut job = self.inner.jobs.get_mut(&job_id).ok_or(StateError::NotFound)?;
        if job.status == JobStatus::Completed {
            return Err(StateError::AlreadyCompleted);
        }
        if job.worker_id.as_deref() != Some(worker_id) {
            return Err(StateError::TakenByAnotherWorker);
        }
        job.lease_expires_at = Some(Utc::now() + chrono::Duration::milliseconds(lease_ms));
        Ok(())
    }

    async fn reap_expired_leases(&self, type_names: &[TypeName]) -> Result<Vec<JobId>, StateError> {
        let _guard = self.inner.tx_lock.lock().await;
        let now = Utc::now();
        let expired: Vec<JobId> = self
            .inner
            .jobs
            .iter()
            .filter(|e| {
                e.status == JobStatus::Acquired
                    && type_names.contains(&e.type_name)
                    && e.lease_expires_at.map(|exp| exp < now).unwrap_or(false)
            })
            .map(|e| e.id)
            .collect();

        for job_id in &expired {
            if let Some(mut job) = self.inner.jobs.get_mut(job_id) {
                job.status = JobStatus::Pending;
                job.attempt += 1;
                job.worker_id = None;
                job.lease_expires_at = None;
            }
        }

        Ok(expired)
    }

    async fn get_job_blockers(&self, job_id: JobId) -> Result<Vec<BlockerState>, StateError> {
        let edges = self.inner.blockers.get(&job_id).map(|e| e.clone()).unwrap_or_default();
        let mut states = Vec::with_capacity(edges.len());
        for edge in edges.iter() {
            let original_blocker_head = self
                .inner
                .jobs
                .get(&edge.blocker_chain_id)
                .ok_or(StateError::NotFound)?
                .clone();
            let current_blocker_state = self
                .current_chain_job(edge.blocker_chain_id)
                .unwrap_or_else(|| original_blocker_head.clone());
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
        let now = Utc::now();
        let earliest = self
            .inner
            .jobs
            .iter()
            .filter(|e| e.status == JobStatus::Pending && type_names.contains(&e.type_name))
            .map(|e| e.scheduled_at)
            .min();

        Ok(earliest.map(|at| (at - now).num_milliseconds().max(0)))
    }

    async fn get_job_chain(
        &self,
        id: ChainId,
        type_name: &str,
    ) -> Result<Option<ChainView>, StateError> {
        let head = match self.inner.jobs.get(&id) {
            Some(h) if h.chain_type_name == type_name => h.clone(),
            _ => return Ok(None),
        };
        let tip = self.current_chain_job(id).unwrap_or_else(|| head.clone());

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
