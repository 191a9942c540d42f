//! Blocker Resolver (§4.5): wires structural dependencies between chains
//! and handles adoption and cascading unblocking.
//!
//! This module holds the orchestration that every `StateAdapter`
//! implementation would otherwise have to duplicate: deciding *when* to
//! adopt a blocker chain's root, and fanning the single
//! `schedule_blocked_jobs` primitive out into a `job-scheduled`
//! notification. The individual mutations (`add_job_blockers`,
//! `adopt_chain`, `schedule_blocked_jobs`) remain `StateAdapter` primitives
//! so each backend controls its own row-locking strategy.

use crate::model::{ChainId, JobId, TypeName};
use crate::state::StateAdapter;
use crate::tx::TxContext;

/// Wire `blockers` onto `job_id`, adopting any blocker chain that was
/// created earlier in this same transaction (§9 Open Question: "blocker
/// edges declared at creation time" are adopted; chains started during
/// processing but never used as blockers stay independent).
///
/// Must be called in the same transaction that created `job_id`, after the
/// blocker chains themselves already exist (each blocker is created with
/// its own prior `startJobChain`/`create_job_chain` call).
pub async fn wire_blockers<A: StateAdapter>(
    ctx: &mut TxContext<'_, A>,
    job_id: JobId,
    new_root_chain_id: ChainId,
    blockers: &[ChainId],
) -> Result<(), crate::error::StateError> {
    if blockers.is_empty() {
        return Ok(());
    }

    for &blocker_chain_id in blockers {
        if ctx.was_created_here(blocker_chain_id) {
            let adapter = ctx.adapter();
            adapter
                .adopt_chain(ctx.tx(), blocker_chain_id, new_root_chain_id)
                .await?;
        }
    }

    let adapter = ctx.adapter();
    adapter.add_job_blockers(ctx.tx(), job_id, blockers).await
}

/// Called after a chain completes: walk its outgoing blocker edges and
/// unblock dependents, deferring a `job-scheduled` notification for any
/// job types that just became runnable.
pub async fn unblock_dependents<A: StateAdapter>(
    ctx: &mut TxContext<'_, A>,
    completed_chain_id: ChainId,
) -> Result<Vec<JobId>, crate::error::StateError> {
    let adapter = ctx.adapter();
    let unblocked = adapter
        .schedule_blocked_jobs(ctx.tx(), completed_chain_id)
        .await?;

    if !unblocked.is_empty() {
        let type_names: Vec<TypeName> = unblocked
            .iter()
            .map(|(_, type_name)| type_name.clone())
            .collect();
        ctx.defer_job_scheduled(type_names);
    }

    Ok(unblocked.into_iter().map(|(id, _)| id).collect())
}
