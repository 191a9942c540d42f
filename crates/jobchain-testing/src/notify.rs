//! In-memory Notify Adapter: thin wrapper over a pair of broadcast channels,
//! matching the shape every real `NotifyAdapter` backend is expected to
//! expose (§6).

use jobchain_core::{JobId, JobOwnershipLostSubscription, JobScheduledSubscription, NotifyAdapter};
use tokio::sync::broadcast;

pub struct InMemoryNotifyAdapter {
    job_scheduled: broadcast::Sender<Vec<String>>,
    job_ownership_lost: broadcast::Sender<JobId>,
}

impl Default for InMemoryNotifyAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryNotifyAdapter {
    pub fn new() -> Self {
        let (job_scheduled, _) = broadcast::channel(256);
        let (job_ownership_lost, _) = broadcast::channel(256);
        Self {
            job_scheduled,
            job_ownership_lost,
        }
    }
}

#[async_trait::async_trait]
impl NotifyAdapter for InMemoryNotifyAdapter {
    async fn notify_job_scheduled(&self, type_names: &[String]) {
        let _ = self.job_scheduled.send(type_names.to_vec());
    }

    async fn listen_job_scheduled(&self, type_names: Vec<String>) -> JobScheduledSubscription {
        JobScheduledSubscription::from_receiver(self.job_scheduled.subscribe(), type_names)
    }

    async fn notify_job_ownership_lost(&self, job_id: JobId) {
        let _ = self.job_ownership_lost.send(job_id);
    }

    async fn listen_job_ownership_lost(&self, job_id: JobId) -> JobOwnershipLostSubscription {
        JobOwnershipLostSubscription::from_receiver(self.job_ownership_lost.subscribe(), job_id)
    }
}
