//! # jobchain-core
//!
//! Durable, database-backed job chain orchestration. A chain is a sequence
//! of jobs connected by continuations; workers acquire jobs under lease,
//! process them, and either complete the chain, continue it with one more
//! job, or reschedule the current attempt. Chains can structurally depend on
//! other chains via blocker edges.
//!
//! This crate is backend-agnostic: it defines the [`StateAdapter`] and
//! [`NotifyAdapter`] contracts a concrete store (Postgres, or an in-memory
//! double for tests) implements, plus the policy — dedup resolution, retry
//! backoff, blocker wiring, the attempt state machine, the worker loop, and
//! the reaper — built on top of them.
//!
//! ## Layout
//!
//! - [`model`] — durable row shapes, job type registration.
//! - [`state`] — the `StateAdapter` transactional contract.
//! - [`notify`] — the `NotifyAdapter` pub/sub contract and commit-deferred
//!   notification queue.
//! - [`tx`] — `TxContext`, the only way to obtain a `StateAdapter::Tx`.
//! - [`runner`] — the per-attempt state machine (atomic/staged prepare).
//! - [`executor`] — the worker loop: poll, acquire, dispatch, concurrency.
//! - [`reaper`] — periodic lease reclamation.
//! - [`lease`] — per-attempt lease renewal for staged-mode attempts.
//! - [`abort`] — the typed-reason cancellation signal handed to handlers.
//! - [`blocker`] — structural dependency wiring and cascading unblock.
//! - [`dedup`] — deduplication candidate selection.
//! - [`retry`] — backoff scheduling.
//! - [`registry`] — the external type registry contract.
//! - [`client`] — the application-facing API (start/complete/delete/wait).
//! - [`config`] — plain configuration structs for every component.
//! - [`error`] — the error taxonomy for each contract.

mod abort;
mod blocker;
mod client;
mod config;
mod dedup;
mod error;
mod executor;
mod lease;
mod model;
mod notify;
mod reaper;
mod registry;
mod retry;
mod runner;
mod state;
mod tx;

pub use abort::AbortSignal;
pub use blocker::{unblock_dependents, wire_blockers};
pub use client::Client;
pub use config::{
    DeduplicationConfig, ExecutorConfig, LeaseConfig, RetryConfig, WaitForChainConfig,
    WorkerLoopRetryConfig,
};
pub use dedup::{select_match, DedupCandidate};
pub use error::{
    AbortReason, Categorizable, ClientError, JobTypeValidationError, RunnerError,
    SafeErrorCategory, StateError,
};
pub use executor::{Executor, ProcessorRegistry};
pub use lease::LeaseManager;
pub use model::{
    BlockerEdge, BlockerState, ChainId, ChainView, ContinueWithSpec, CreatedChain,
    DeduplicationScope, DeduplicationSpec, Job, JobId, JobStatus, JobTypeDef, JobTypeRegistry,
    RegistryBuildError, StartJobChainSpec, TypeName, TypeRef,
};
pub use notify::{
    JobOwnershipLostSubscription, JobScheduledSubscription, NotifyAdapter, NotifyDeferral,
};
pub use reaper::{Reaper, ReaperConfig};
pub use registry::{ContinuationRequest, TypeRegistry};
pub use retry::{backoff_delay_ms, jittered_ms, next_schedule};
pub use runner::{
    AttemptContext, AttemptError, AttemptOutcome, Disposition, JobProcessor, PrepareMode,
};
pub use state::StateAdapter;
pub use tx::{run_in_transaction, TxContext};

// Re-export the async-trait attribute macro so downstream `StateAdapter`,
// `NotifyAdapter`, and `JobProcessor` implementors don't need their own
// dependency on it.
pub use async_trait::async_trait;
