//! Lease Manager (§4.3): renews a worker's lease on an acquired job on a
//! timer, during the window between a staged prepare's commit and the
//! complete phase's own transaction.

use crate::abort::AbortSignal;
use crate::config::LeaseConfig;
use crate::error::AbortReason;
use crate::model::JobId;
use crate::state::StateAdapter;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Runs lease renewal for one in-flight staged attempt. Stop is idempotent
/// and joins the in-flight renewal before returning (§4.3).
pub struct LeaseManager {
    handle: Option<JoinHandle<()>>,
    stop: Arc<tokio::sync::Notify>,
}

impl LeaseManager {
    /// Start renewing `job_id`'s lease every `config.renew_interval_ms`
    /// until `stop()` is called or renewal fails unrecoverably, in which
    /// case `abort` fires with [`AbortReason::Error`] (or
    /// [`AbortReason::TakenByAnotherWorker`] when another worker is
    /// detected holding the job).
    pub fn start<A: StateAdapter + Clone>(
        state: A,
        job_id: JobId,
        worker_id: String,
        config: LeaseConfig,
        abort: AbortSignal,
    ) -> Self {
        let stop = Arc::new(tokio::sync::Notify::new());
        let stop_for_task = stop.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(config.renew_interval());
            interval.tick().await; // first tick fires immediately; skip it

            let mut committed = false;
            loop {
                tokio::select! {
                    _ = stop_for_task.notified() => {
                        debug!(%job_id, "lease manager stopping");
                        return;
                    }
                    _ = interval.tick() => {
                        match state.renew_job_lease(job_id, &worker_id, config.lease_ms).await {
                            Ok(()) => {
                                if !committed {
                                    committed = true;
                                    debug!(%job_id, "lease renewal committed");
                                }
                            }
                            Err(crate::error::StateError::TakenByAnotherWorker) => {
                                warn!(%job_id, "lease taken by another worker");
                                abort.fire(AbortReason::TakenByAnotherWorker);
                                return;
                            }
                            Err(crate::error::StateError::AlreadyCompleted) => {
                                abort.fire(AbortReason::AlreadyCompleted);
                                return;
                            }
                            Err(crate::error::StateError::NotFound) => {
                                abort.fire(AbortReason::NotFound);
                                return;
                            }
                            Err(err) => {
                                warn!(%job_id, error = %err, "lease renewal failed irrecoverably");
                                abort.fire(AbortReason::Error);
                                return;
                            }
                        }
                    }
                }
            }
        });

        Self {
            handle: Some(handle),
            stop,
        }
    }

    /// Idempotent: calling `stop` more than once, or after the task already
    /// exited on its own, is a no-op.
    pub async fn stop(&mut self) {
        self.stop.notify_waiters();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for LeaseManager {
    fn drop(&mut self) {
        self.stop.notify_waiters();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
