//! Notify Adapter contract (§4.1 "4% Notify Adapter contract", §6) and the
//! notify-context deferral that queues emissions until the enclosing
//! transaction commits (§4.9, §5, §9 "Deferred notify within a transaction").

use crate::model::JobId;
use async_trait::async_trait;

/// Best-effort pub/sub for the two channels the core depends on. Delivery
/// may be lost; no core invariant ever depends on a notification arriving —
/// the authoritative signal is always a state-adapter read
/// (`refetchJobForUpdate` returning `TakenByAnotherWorker`, for instance).
#[async_trait]
pub trait NotifyAdapter: Send + Sync + 'static {
    /// Emit after a transaction creates or reschedules a job of any of
    /// these types.
    async fn notify_job_scheduled(&self, type_names: &[String]);

    /// Fires at most once per event; may coalesce multiple scheduling
    /// notifications for the same type set. Returns a disposer closure the
    /// caller drops (or calls) to unsubscribe.
    async fn listen_job_scheduled(&self, type_names: Vec<String>) -> JobScheduledSubscription;

    /// Emit after the reaper reclaims a job or after workerless completion
    /// of it.
    async fn notify_job_ownership_lost(&self, job_id: JobId);

    async fn listen_job_ownership_lost(&self, job_id: JobId) -> JobOwnershipLostSubscription;
}

/// Delegating impl so a single `Arc<N>` can be shared between a [`Client`]
/// and an [`crate::executor::Executor`] (both need their own owned `N`
/// bound, and concrete adapters are typically wrapped once in an `Arc` at
/// process startup rather than cloned).
///
/// [`Client`]: crate::client::Client
#[async_trait]
impl<T> NotifyAdapter for std::sync::Arc<T>
where
    T: NotifyAdapter + ?Sized,
{
    async fn notify_job_scheduled(&self, type_names: &[String]) {
        (**self).notify_job_scheduled(type_names).await
    }

    async fn listen_job_scheduled(&self, type_names: Vec<String>) -> JobScheduledSubscription {
        (**self).listen_job_scheduled(type_names).await
    }

    async fn notify_job_ownership_lost(&self, job_id: JobId) {
        (**self).notify_job_ownership_lost(job_id).await
    }

    async fn listen_job_ownership_lost(&self, job_id: JobId) -> JobOwnershipLostSubscription {
        (**self).listen_job_ownership_lost(job_id).await
    }
}

/// A live subscription to `job-scheduled(typeNames)`. Dropping it
/// unsubscribes.
pub struct JobScheduledSubscription {
    pub(crate) receiver: tokio::sync::broadcast::Receiver<Vec<String>>,
    pub(crate) type_names: Vec<String>,
}

impl JobScheduledSubscription {
    /// Constructor for concrete `NotifyAdapter` implementations backed by a
    /// `tokio::sync::broadcast` channel of type-name batches.
    pub fn from_receiver(
        receiver: tokio::sync::broadcast::Receiver<Vec<String>>,
        type_names: Vec<String>,
    ) -> Self {
        Self {
            receiver,
            type_names,
        }
    }

    /// Resolves when a scheduling event for one of the subscribed type
    /// names is observed. Never resolves with an error: a lagged receiver
    /// (missed events because the channel overflowed) is treated as "an
    /// event happened", consistent with "may coalesce" / "at-most-once
    /// delivery, never depend on it".
    pub async fn notified(&mut self) {
        loop {
            match self.receiver.recv().await {
                Ok(types) => {
                    if types.iter().any(|t| self.type_names.contains(t)) {
                        return;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => return,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    // No publisher left; block forever rather than busy-loop.
                    std::future::pending::<()>().await;
                }
            }
        }
    }
}

/// A live subscription to `job-ownership-lost(jobId)`.
pub struct JobOwnershipLostSubscription {
    pub(crate) receiver: tokio::sync::broadcast::Receiver<JobId>,
    pub(crate) job_id: JobId,
}

impl JobOwnershipLostSubscription {
    /// Constructor for concrete `NotifyAdapter` implementations backed by a
    /// `tokio::sync::broadcast` channel of job ids.
    pub fn from_receiver(receiver: tokio::sync::broadcast::Receiver<JobId>, job_id: JobId) -> Self {
        Self { receiver, job_id }
    }

    pub async fn notified(&mut self) {
        loop {
            match self.receiver.recv().await {
                Ok(id) if id == self.job_id => return,
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => return,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    std::future::pending::<()>().await;
                }
            }
        }
    }
}

/// A queued notification, flushed after commit and dropped on rollback.
pub(crate) enum DeferredNotification {
    JobScheduled(Vec<String>),
    JobOwnershipLost(JobId),
}

/// Task list attached to the current transaction context (§9). Collected
/// while the transaction runs; flushed only once the enclosing
/// `run_in_transaction` call successfully commits.
#[derive(Default)]
pub struct NotifyDeferral {
    pub(crate) pending: Vec<DeferredNotification>,
}

impl NotifyDeferral {
    pub fn defer_job_scheduled(&mut self, type_names: impl Into<Vec<String>>) {
        self.pending
            .push(DeferredNotification::JobScheduled(type_names.into()));
    }

    pub fn defer_job_ownership_lost(&mut self, job_id: JobId) {
        self.pending
            .push(DeferredNotification::JobOwnershipLost(job_id));
    }

    pub(crate) async fn flush(self, notify: &dyn NotifyAdapter) {
        for item in self.pending {
            match item {
                DeferredNotification::JobScheduled(types) => {
                    notify.notify_job_scheduled(&types).await
                }
                DeferredNotification::JobOwnershipLost(job_id) => {
                    notify.notify_job_ownership_lost(job_id).await
                }
            }
        }
    }
}
