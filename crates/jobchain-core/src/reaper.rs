//! Reaper (§4.7): periodically reclaims jobs whose lease has expired,
//! reverting them to `pending` and notifying any still-running handler that
//! it has lost ownership.
//!
//! A plain `tokio::spawn` loop racing a stop signal against a sleep,
//! the periodic-cleanup-task pattern used for stale-job recovery.

use crate::notify::NotifyAdapter;
use crate::state::StateAdapter;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub interval_ms: i64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self { interval_ms: 15_000 }
    }
}

/// Runs `reap_expired_leases` on a timer for a fixed set of owned types,
/// emitting `job-ownership-lost` for each reclaimed job (§4.7).
///
/// An Executor also reaps its own types once at startup (§4.4 step 1); this
/// is the periodic counterpart that keeps running for the lifetime of the
/// process so a worker that crashes mid-lease gets reclaimed by any other
/// worker sharing its types, not just by its own restart.
pub struct Reaper {
    handle: Option<JoinHandle<()>>,
    stop: Arc<tokio::sync::Notify>,
}

impl Reaper {
    pub fn start<A, N>(state: A, notify: Arc<N>, type_names: Vec<String>, config: ReaperConfig) -> Self
    where
        A: StateAdapter,
        N: NotifyAdapter,
    {
        let stop = Arc::new(tokio::sync::Notify::new());
        let stop_for_task = stop.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(config.interval_ms.max(1) as u64));
            loop {
                tokio::select! {
                    _ = stop_for_task.notified() => {
                        debug!("reaper stopping");
                        return;
                    }
                    _ = interval.tick() => {
                        match state.reap_expired_leases(&type_names).await {
                            Ok(reclaimed) => {
                                for job_id in reclaimed {
                                    debug!(%job_id, "reaped expired lease");
                                    notify.notify_job_ownership_lost(job_id).await;
                                }
                            }
                            Err(err) => warn!(error = %err, "reap sweep failed"),
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

    pub async fn stop(&mut self) {
        self.stop.notify_waiters();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.stop.notify_waiters();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
