//! Core data model: job types, durable job rows, chains, blocker edges.
//!
//! Mirrors §3 of the design: a chain is not a row of its own, it is a view
//! derived from the jobs that share a `chain_id`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use uuid::Uuid;

/// Opaque identifier for a job row.
pub type JobId = Uuid;

/// Opaque identifier for a chain (equal to the id of its head job).
pub type ChainId = Uuid;

/// A registered job type name. Validated against the type registry at the
/// client boundary; core code treats it as an opaque string.
pub type TypeName = String;

/// Status of a durable job row. See §3 for the transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Blocked,
    Acquired,
    Completed,
}

/// A reference to a permitted continuation or blocker target, as declared on
/// a `JobTypeDef`. The type registry is the authority on whether an instance
/// actually matches one of these; core only stores the declared set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeRef {
    pub type_name: TypeName,
}

/// A registered job type definition (§3 "JobType definition").
///
/// Registered once per process and held immutable thereafter. Construction
/// validates the two graph invariants from §3: non-entry types can't be
/// heads or blockers, and every referenced type must exist in the set passed
/// to [`JobTypeRegistry::new`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobTypeDef {
    pub type_name: TypeName,
    pub entry: bool,
    pub continue_with: Vec<TypeRef>,
    pub blockers: Vec<TypeRef>,
}

impl JobTypeDef {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            entry: false,
            continue_with: Vec::new(),
            blockers: Vec::new(),
        }
    }

    pub fn entry(mut self) -> Self {
        self.entry = true;
        self
    }

    pub fn continue_with(mut self, type_name: impl Into<String>) -> Self {
        self.continue_with.push(TypeRef {
            type_name: type_name.into(),
        });
        self
    }

    pub fn blocker(mut self, type_name: impl Into<String>) -> Self {
        self.blockers.push(TypeRef {
            type_name: type_name.into(),
        });
        self
    }
}

/// A set of registered job types with graph-validity already checked.
///
/// This is the runtime, reachability-on-construction stand-in the source's
/// compile-time type-level graph checks are re-architected into (§9,
/// "Generic type-level graph checks").
#[derive(Debug, Clone, Default)]
pub struct JobTypeRegistry {
    types: std::collections::HashMap<TypeName, JobTypeDef>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryBuildError {
    #[error("duplicate job type definition for `{0}`")]
    Duplicate(TypeName),
    #[error("job type `{0}` declares continue_with target `{1}` which is not defined")]
    UnknownContinuation(TypeName, TypeName),
    #[error("job type `{0}` declares blocker target `{1}` which is not defined")]
    UnknownBlocker(TypeName, TypeName),
    #[error("job type `{0}` is listed as a blocker target but is not an entry type")]
    BlockerNotEntry(TypeName),
}

impl JobTypeRegistry {
    pub fn new(defs: impl IntoIterator<Item = JobTypeDef>) -> Result<Self, RegistryBuildError> {
        let mut types = std::collections::HashMap::new();
        for def in defs {
            let name = def.type_name.clone();
            if types.insert(name.clone(), def).is_some() {
                return Err(RegistryBuildError::Duplicate(name));
            }
        }

        for def in types.values() {
            for target in &def.continue_with {
                if !types.contains_key(&target.type_name) {
                    return Err(RegistryBuildError::UnknownContinuation(
                        def.type_name.clone(),
                        target.type_name.clone(),
                    ));
                }
            }
            for target in &def.blockers {
                match types.get(&target.type_name) {
                    None => {
                        return Err(RegistryBuildError::UnknownBlocker(
                            def.type_name.clone(),
                            target.type_name.clone(),
                        ))
                    }
                    Some(blocker_def) if !blocker_def.entry => {
                        return Err(RegistryBuildError::BlockerNotEntry(
                            target.type_name.clone(),
                        ))
                    }
                    Some(_) => {}
                }
            }
        }

        Ok(Self { types })
    }

    pub fn get(&self, type_name: &str) -> Option<&JobTypeDef> {
        self.types.get(type_name)
    }

    pub fn is_entry(&self, type_name: &str) -> bool {
        self.types.get(type_name).map(|t| t.entry).unwrap_or(false)
    }

    pub fn allows_continuation(&self, from: &str, to: &str) -> bool {
        self.types
            .get(from)
            .map(|t| t.continue_with.iter().any(|r| r.type_name == to))
            .unwrap_or(false)
    }

    pub fn allows_blocker(&self, type_name: &str, blocker: &str) -> bool {
        self.types
            .get(type_name)
            .map(|t| t.blockers.iter().any(|r| r.type_name == blocker))
            .unwrap_or(false)
    }

    /// Reachability of continuation types from `type_name`, used to detect
    /// self-continuing cycles at validation time rather than needing any
    /// compile-time recursion (§9).
    pub fn reachable_continuations(&self, type_name: &str) -> HashSet<TypeName> {
        let mut visited = HashSet::new();
        let mut stack = vec![type_name.to_string()];
        while let Some(current) = stack.pop() {
            if let Some(def) = self.types.get(&current) {
                for target in &def.continue_with {
                    if visited.insert(target.type_name.clone()) {
                        stack.push(target.type_name.clone());
                    }
                }
            }
        }
        visited
    }
}

/// Durable job row (§3 "Job").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub type_name: TypeName,
    pub chain_id: ChainId,
    pub chain_type_name: TypeName,
    pub root_chain_id: ChainId,
    pub origin_id: Option<JobId>,
    pub input: Value,
    pub status: JobStatus,
    pub attempt: i32,
    pub scheduled_at: DateTime<Utc>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub output: Option<Value>,
    pub last_attempt_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub trace_context: Option<Value>,
    pub deduplication_key: Option<String>,
    pub deduplication_scope: Option<DeduplicationScope>,
    pub deduplication_window_ms: Option<i64>,
}

impl Job {
    pub fn is_chain_head(&self) -> bool {
        self.id == self.chain_id
    }
}

/// Scope of a deduplication window (§3 "Deduplication record", §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeduplicationScope {
    /// Collapse only against non-completed chains.
    Incomplete,
    /// Collapse against any chain within the window, completed or not.
    Any,
}

/// Deduplication request attached to `startJobChain` (§4.8).
#[derive(Debug, Clone)]
pub struct DeduplicationSpec {
    pub key: String,
    pub scope: DeduplicationScope,
    /// `None` means unbounded lookback. `Some(0)` means "no match" per the
    /// Open Question resolution in §9 (documented in DESIGN.md).
    pub window_ms: Option<i64>,
}

/// A blocker edge (§3 "Blocker edge").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockerEdge {
    pub blocked_job_id: JobId,
    pub blocker_chain_id: ChainId,
    pub satisfied: bool,
}

/// One entry returned by `getJobBlockers`: the originally declared blocker
/// head job plus its current state.
#[derive(Debug, Clone)]
pub struct BlockerState {
    pub original_blocker_head: Job,
    pub current_blocker_state: Job,
}

/// A chain view derived for client consumption (§3 "Chain").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainView {
    pub id: ChainId,
    pub type_name: TypeName,
    pub root_chain_id: ChainId,
    pub status: JobStatus,
    pub current_job_id: JobId,
    pub output: Option<Value>,
    pub last_attempt_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Result of `createJobChain`, `startJobChain`, `continueWithJob`.
#[derive(Debug, Clone)]
pub struct CreatedChain {
    pub id: ChainId,
    pub status: JobStatus,
    pub deduplicated: bool,
}

/// Specification for a new chain head (§4.8 `startJobChain`).
///
/// `blockers` names chain ids that must already exist — either created in
/// an earlier transaction, or created earlier in the *same* transaction
/// (in which case the blocker resolver adopts them, §4.5). A blocker is
/// never implicitly created by this spec; the caller creates it with its
/// own `startJobChain` call first.
#[derive(Debug, Clone)]
pub struct StartJobChainSpec {
    pub type_name: TypeName,
    pub input: Value,
    pub blockers: Vec<ChainId>,
    pub deduplication: Option<DeduplicationSpec>,
    pub schedule: Option<DateTime<Utc>>,
    pub trace_context: Option<Value>,
}

/// Specification for a continuation job (§4.1 `continueWithJob`).
#[derive(Debug, Clone)]
pub struct ContinueWithSpec {
    pub type_name: TypeName,
    pub input: Value,
    pub schedule: Option<DateTime<Utc>>,
    pub blockers: Vec<ChainId>,
}
