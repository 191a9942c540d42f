//! PostgreSQL `LISTEN`/`NOTIFY` implementation of the Notify Adapter
//! contract. `pg_notify` fans a payload out to every connection currently
//! listening on a channel; this adapter keeps one background `PgListener`
//! per process and re-fans each notification out to local
//! `tokio::sync::broadcast` subscribers, the same shape the in-memory
//! double uses, so a [`Client`](jobchain_core::Client) or
//! [`Executor`](jobchain_core::Executor) can be generic over either.
//!
//! Best-effort by contract (§4.9): a missed or lagged notification is never
//! the only signal anything depends on. If the listener connection drops,
//! this adapter reconnects with a fixed backoff and keeps serving `notify_*`
//! calls (which go through the pool, not the listener connection) the
//! whole time.

use jobchain_core::{JobId, JobOwnershipLostSubscription, JobScheduledSubscription, NotifyAdapter};
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const CHANNEL_JOB_SCHEDULED: &str = "jobchain_job_scheduled";
const CHANNEL_JOB_OWNERSHIP_LOST: &str = "jobchain_job_ownership_lost";
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum NotifyPgError {
    #[error("failed to start listener: {0}")]
    Listen(#[source] sqlx::Error),
}

/// PostgreSQL-backed [`NotifyAdapter`]. Holds the pool used to send
/// notifications and the background listener task's handle.
pub struct PgNotifyAdapter {
    pool: PgPool,
    job_scheduled: broadcast::Sender<Vec<String>>,
    job_ownership_lost: broadcast::Sender<JobId>,
    listener_task: JoinHandle<()>,
}

impl PgNotifyAdapter {
    /// Opens a dedicated listener connection against `pool`'s database and
    /// spawns the background fan-out task. Returns once the first `LISTEN`
    /// has been issued; subsequent disconnects are retried internally and
    /// never surface to the caller.
    pub async fn connect(pool: PgPool) -> Result<Self, NotifyPgError> {
        let mut listener = PgListener::connect_with(&pool)
            .await
            .map_err(NotifyPgError::Listen)?;
        listener
            .listen_all([CHANNEL_JOB_SCHEDULED, CHANNEL_JOB_OWNERSHIP_LOST])
            .await
            .map_err(NotifyPgError::Listen)?;

        let (job_scheduled_tx, _) = broadcast::channel(256);
        let (job_ownership_lost_tx, _) = broadcast::channel(256);

        let listener_task = tokio::spawn(run_listener(
            pool.clone(),
            listener,
            job_scheduled_tx.clone(),
            job_ownership_lost_tx.clone(),
        ));

        Ok(Self {
            pool,
            job_scheduled: job_scheduled_tx,
            job_ownership_lost: job_ownership_lost_tx,
            listener_task,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl Drop for PgNotifyAdapter {
    fn drop(&mut self) {
        self.listener_task.abort();
    }
}

/// Owns the live `PgListener` and re-dispatches each notification to the
/// matching local broadcast channel, reconnecting on error. Runs for the
/// lifetime of the owning [`PgNotifyAdapter`].
async fn run_listener(
    pool: PgPool,
    mut listener: PgListener,
    job_scheduled: broadcast::Sender<Vec<String>>,
    job_ownership_lost: broadcast::Sender<JobId>,
) {
    loop {
        match listener.recv().await {
            Ok(notification) => {
                let channel = notification.channel();
                let payload = notification.payload();
                if channel == CHANNEL_JOB_SCHEDULED {
                    match serde_json::from_str::<Vec<String>>(payload) {
                        Ok(type_names) => {
                            let _ = job_scheduled.send(type_names);
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "dropping malformed job-scheduled notification")
                        }
                    }
                } else if channel == CHANNEL_JOB_OWNERSHIP_LOST {
                    match payload.parse::<JobId>() {
                        Ok(job_id) => {
                            let _ = job_ownership_lost.send(job_id);
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "dropping malformed job-ownership-lost notification")
                        }
                    }
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "listener connection lost, reconnecting");
                tokio::time::sleep(RECONNECT_BACKOFF).await;
                match PgListener::connect_with(&pool).await {
                    Ok(mut fresh) => {
                        if let Err(err) = fresh
                            .listen_all([CHANNEL_JOB_SCHEDULED, CHANNEL_JOB_OWNERSHIP_LOST])
                            .await
                        {
                            tracing::warn!(error = %err, "failed to re-subscribe after reconnect");
                            continue;
                        }
                        listener = fresh;
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "reconnect attempt failed");
                    }
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl NotifyAdapter for PgNotifyAdapter {
    async fn notify_job_scheduled(&self, type_names: &[String]) {
        let payload = match serde_json::to_string(type_names) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(error = %err, "failed to encode job-scheduled payload");
                return;
            }
        };
        if let Err(err) = sqlx::query("SELECT pg_notify($1, $2)")
            .bind(CHANNEL_JOB_SCHEDULED)
            .bind(payload)
            .execute(&self.pool)
            .await
        {
            tracing::warn!(error = %err, "failed to send job-scheduled notification");
        }
    }

    async fn listen_job_scheduled(&self, type_names: Vec<String>) -> JobScheduledSubscription {
        JobScheduledSubscription::from_receiver(self.job_scheduled.subscribe(), type_names)
    }

    async fn notify_job_ownership_lost(&self, job_id: JobId) {
        if let Err(err) = sqlx::query("SELECT pg_notify($1, $2)")
            .bind(CHANNEL_JOB_OWNERSHIP_LOST)
            .bind(job_id.to_string())
            .execute(&self.pool)
            .await
        {
            tracing::warn!(error = %err, "failed to send job-ownership-lost notification");
        }
    }

    async fn listen_job_ownership_lost(&self, job_id: JobId) -> JobOwnershipLostSubscription {
        JobOwnershipLostSubscription::from_receiver(self.job_ownership_lost.subscribe(), job_id)
    }
}
