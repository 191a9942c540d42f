//! Deduplication engine (§4.6). `create_job_chain` is expected to invoke
//! this matching logic before inserting a new head row. The logic is pure
//! and backend-agnostic: a `StateAdapter` implementation queries its own
//! storage for candidates (e.g. a SQL `WHERE dedup_key = $1 AND
//! dedup_scope = $2 AND created_at >= $3` for the Postgres backend's
//! `(dedup_key, dedup_scope, created_at)` index) and then hands the
//! candidate set to [`select_match`] to apply the scope/window/tie-break
//! rules identically everywhere.

use crate::model::{ChainId, DeduplicationScope};
use chrono::{DateTime, Duration, Utc};

/// One existing chain that shares a deduplication key with a new request.
#[derive(Debug, Clone, Copy)]
pub struct DedupCandidate {
    pub chain_id: ChainId,
    pub created_at: DateTime<Utc>,
    pub completed: bool,
}

/// Resolve a `(key, scope, window)` triple against the candidate set
/// already filtered by key. Returns the chain id to collapse onto, if any.
///
/// - `scope = Incomplete` only matches non-completed candidates.
/// - `scope = Any` matches any candidate, completed or not.
/// - `window_ms = None` is an unbounded lookback.
/// - `window_ms = Some(0)` never matches — the safe interpretation chosen
///   for the Open Question in §9 (see DESIGN.md).
/// - Ties are broken by most recent `created_at`.
pub fn select_match(
    candidates: &[DedupCandidate],
    scope: DeduplicationScope,
    window_ms: Option<i64>,
    now: DateTime<Utc>,
) -> Option<ChainId> {
    if window_ms == Some(0) {
        return None;
    }

    let cutoff = window_ms.map(|w| now - Duration::milliseconds(w));

    candidates
        .iter()
        .filter(|c| match scope {
            DeduplicationScope::Incomplete => !c.completed,
            DeduplicationScope::Any => true,
        })
        .filter(|c| cutoff.map(|cut| c.created_at >= cut).unwrap_or(true))
        .max_by_key(|c| c.created_at)
        .map(|c| c.chain_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn candidate(created_at: DateTime<Utc>, completed: bool) -> DedupCandidate {
        DedupCandidate {
            chain_id: Uuid::new_v4(),
            created_at,
            completed,
        }
    }

    #[test]
    fn incomplete_scope_skips_completed() {
        let now = Utc::now();
        let completed = candidate(now, true);
        let incomplete = candidate(now - Duration::seconds(1), false);
        let result = select_match(
            &[completed, incomplete],
            DeduplicationScope::Incomplete,
            None,
            now,
        );
        assert_eq!(result, Some(incomplete.chain_id));
    }

    #[test]
    fn any_scope_prefers_most_recent() {
        let now = Utc::now();
        let older = candidate(now - Duration::seconds(10), true);
        let newer = candidate(now - Duration::seconds(1), false);
        let result = select_match(&[older, newer], DeduplicationScope::Any, None, now);
        assert_eq!(result, Some(newer.chain_id));
    }

    #[test]
    fn zero_window_never_matches() {
        let now = Utc::now();
        let exact = candidate(now, false);
        let result = select_match(&[exact], DeduplicationScope::Any, Some(0), now);
        assert_eq!(result, None);
    }

    #[test]
    fn window_excludes_stale_candidates() {
        let now = Utc::now();
        let stale = candidate(now - Duration::milliseconds(200), false);
        let result = select_match(&[stale], DeduplicationScope::Any, Some(50), now);
        assert_eq!(result, None);
    }
}
