//! The explicit `TxContext` the source's monkeyed transaction contexts are
//! re-architected into (§9). Every mutating state operation needs
//! `&mut A::Tx`, and the only way to get one is through a `TxContext` — so
//! there is no way to call a state operation outside a transaction; the
//! type system forbids it instead of a runtime check.

use crate::error::StateError;
use crate::model::{ChainId, JobId};
use crate::notify::{NotifyAdapter, NotifyDeferral};
use crate::state::StateAdapter;
use std::collections::HashSet;
use std::future::Future;

/// A running transaction plus the notify-deferral task list (§4.9, §9) and
/// the set of chain ids created so far in this transaction, which the
/// blocker resolver consults to decide adoption (§4.5).
pub struct TxContext<'a, A: StateAdapter> {
    adapter: &'a A,
    tx: A::Tx,
    notify: NotifyDeferral,
    created_chains: HashSet<ChainId>,
}

impl<'a, A: StateAdapter> TxContext<'a, A> {
    pub async fn begin(adapter: &'a A) -> Result<Self, StateError> {
        let tx = adapter.begin().await?;
        Ok(Self {
            adapter,
            tx,
            notify: NotifyDeferral::default(),
            created_chains: HashSet::new(),
        })
    }

    pub fn adapter(&self) -> &'a A {
        self.adapter
    }

    pub fn tx(&mut self) -> &mut A::Tx {
        &mut self.tx
    }

    pub fn defer_job_scheduled(&mut self, type_names: impl Into<Vec<String>>) {
        self.notify.defer_job_scheduled(type_names);
    }

    pub fn defer_job_ownership_lost(&mut self, job_id: JobId) {
        self.notify.defer_job_ownership_lost(job_id);
    }

    pub(crate) fn mark_created(&mut self, chain_id: ChainId) {
        self.created_chains.insert(chain_id);
    }

    pub(crate) fn was_created_here(&self, chain_id: ChainId) -> bool {
        self.created_chains.contains(&chain_id)
    }

    /// Commit the transaction and flush every notification queued on it.
    /// Notifications are emitted strictly after the commit succeeds.
    pub async fn commit<N: NotifyAdapter>(self, notify: &N) -> Result<(), StateError> {
        self.adapter.commit(self.tx).await?;
        self.notify.flush(notify).await;
        Ok(())
    }

    /// Roll back, dropping every queued notification unsent.
    pub async fn rollback(self) -> Result<(), StateError> {
        self.adapter.rollback(self.tx).await
    }
}

/// Run `f` inside a fresh transaction against `adapter`, committing and
/// flushing deferred notifications on success, rolling back and dropping
/// them on failure.
pub async fn run_in_transaction<'a, A, N, F, Fut, T, E>(
    adapter: &'a A,
    notify: &'a N,
    f: F,
) -> Result<T, E>
where
    A: StateAdapter,
    N: NotifyAdapter,
    F: for<'b> FnOnce(&'b mut TxContext<'a, A>) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<StateError>,
{
    let mut ctx = TxContext::begin(adapter).await.map_err(E::from)?;
    match f(&mut ctx).await {
        Ok(value) => {
            ctx.commit(notify).await.map_err(E::from)?;
            Ok(value)
        }
        Err(err) => {
            let _ = ctx.rollback().await;
            Err(err)
        }
    }
}
