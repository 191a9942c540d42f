//! Error taxonomy (§7). Each contract gets its own `thiserror` enum so
//! callers can match on kind instead of parsing strings.

use crate::model::{ChainId, JobId};
use thiserror::Error;

/// Errors returned by the State Adapter contract (§4.1, §6).
#[derive(Debug, Error)]
pub enum StateError {
    #[error("job or chain not found")]
    NotFound,

    #[error("job already completed")]
    AlreadyCompleted,

    #[error("job is held by another worker")]
    TakenByAnotherWorker,

    #[error("referenced chain has been deleted")]
    BlockerChainDeleted,

    #[error("delete rejected: {0} must be deleted from its root chain")]
    MustDeleteFromRoot(ChainId),

    #[error("delete rejected: external job chains depend on {0}")]
    ExternalDependents(ChainId),

    #[error("transient store error: {0}")]
    Transient(#[source] anyhow::Error),

    #[error("unknown store error: {0}")]
    Unknown(#[source] anyhow::Error),
}

/// A coarse classification used by the retry policy (§4.2, §7) and by the
/// worker loop's own backoff (`workerLoopRetryConfig`).
pub trait Categorizable {
    fn category(&self) -> SafeErrorCategory;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafeErrorCategory {
    /// Ownership/consistency errors: swallowed by callers, never logged as
    /// worker errors (§7).
    OwnershipLost,
    /// Transient store error: retry per policy.
    Transient,
    /// Unknown/unclassified: retry conservatively, log loudly.
    Unknown,
}

impl Categorizable for StateError {
    fn category(&self) -> SafeErrorCategory {
        match self {
            StateError::NotFound
            | StateError::AlreadyCompleted
            | StateError::TakenByAnotherWorker
            | StateError::BlockerChainDeleted => SafeErrorCategory::OwnershipLost,
            StateError::Transient(_) => SafeErrorCategory::Transient,
            StateError::MustDeleteFromRoot(_)
            | StateError::ExternalDependents(_)
            | StateError::Unknown(_) => SafeErrorCategory::Unknown,
        }
    }
}

/// Errors surfaced by the Job Process Runner (§4.2).
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("prepare() called more than once")]
    PrepareCalledTwice,

    #[error("prepare() accessed after auto-setup already ran")]
    PrepareAfterAutoSetup,

    #[error("complete() called more than once")]
    CompleteCalledTwice,

    #[error("continueWith() called more than once")]
    ContinueWithCalledTwice,

    #[error("no processor registered for acquired type `{0}`")]
    NoProcessorRegistered(String),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("attempt handler error: {0}")]
    Handler(#[source] anyhow::Error),
}

/// Typed reason carried by the attempt abort signal (§4.2, §5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    TakenByAnotherWorker,
    AlreadyCompleted,
    NotFound,
    Error,
}

/// Errors surfaced by the Client API (§4.8).
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Validation(#[from] JobTypeValidationError),

    #[error("chain {0} was not found")]
    NotFound(JobId),

    #[error("timed out waiting for job chain {0} to complete")]
    WaitForJobChainCompletionTimeoutError(ChainId),
}

/// Errors from the external Type Registry contract (§6). Core treats these
/// as opaque rejections raised at the client boundary; it never constructs
/// them itself beyond wrapping what the registry returns.
#[derive(Debug, Error)]
pub enum JobTypeValidationError {
    #[error("`{0}` is not a permitted chain entry point")]
    NotEntryPoint(String),

    #[error("invalid input for `{0}`: {1}")]
    InvalidInput(String, String),

    #[error("invalid output for `{0}`: {1}")]
    InvalidOutput(String, String),

    #[error("invalid continuation from `{0}` to `{1}`")]
    InvalidContinuation(String, String),

    #[error("invalid blocker set for `{0}`")]
    InvalidBlockers(String),
}
