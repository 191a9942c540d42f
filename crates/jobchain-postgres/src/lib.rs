//! PostgreSQL implementation of the jobchain `StateAdapter` contract.
//!
//! # Database Schema
//!
//! ```sql
//! CREATE TABLE jobs (
//!     id UUID PRIMARY KEY,
//!     type_name TEXT NOT NULL,
//!     chain_id UUID NOT NULL,
//!     chain_type_name TEXT NOT NULL,
//!     root_chain_id UUID NOT NULL,
//!     origin_id UUID,
//!     status TEXT NOT NULL DEFAULT 'pending',
//!     input JSONB NOT NULL,
//!     output JSONB,
//!     attempt INTEGER NOT NULL DEFAULT 1,
//!     scheduled_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     lease_expires_at TIMESTAMPTZ,
//!     worker_id TEXT,
//!     last_attempt_error TEXT,
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     completed_at TIMESTAMPTZ,
//!     trace_context JSONB,
//!     dedup_key TEXT,
//!     dedup_scope TEXT,
//!     dedup_window_ms BIGINT
//! );
//!
//! CREATE TABLE job_blockers (
//!     blocked_job_id UUID NOT NULL REFERENCES jobs(id),
//!     blocker_chain_id UUID NOT NULL REFERENCES jobs(id),
//!     satisfied BOOLEAN NOT NULL DEFAULT FALSE,
//!     PRIMARY KEY (blocked_job_id, blocker_chain_id)
//! );
//!
//! CREATE INDEX idx_jobs_acquire ON jobs (status, type_name, scheduled_at);
//! CREATE INDEX idx_jobs_reap ON jobs (status, lease_expires_at);
//! CREATE INDEX idx_jobs_dedup ON jobs (dedup_key, dedup_scope, created_at);
//! CREATE INDEX idx_jobs_root ON jobs (root_chain_id);
//! CREATE INDEX idx_jobs_chain ON jobs (chain_id);
//! CREATE INDEX idx_job_blockers_blocker ON job_blockers (blocker_chain_id);
//! ```
//!
//! [`SCHEMA_SQL`] carries this text so `demos/*` binaries and integration
//! tests can bootstrap a scratch database without a separate migrations
//! runner.

mod adapter;

pub use adapter::{PgStateAdapter, QueueStats};

/// The schema declared in the module doc comment, as runnable SQL.
pub const SCHEMA_SQL: &str = include_str!("schema.sql");
