//! In-memory [`StateAdapter`](jobchain_core::StateAdapter) and
//! [`NotifyAdapter`](jobchain_core::NotifyAdapter) implementations for
//! exercising `jobchain-core` without a database.
//!
//! Backs a pending-item map with [`dashmap::DashMap`] rather than a
//! `Mutex<HashMap>`. Mutating operations still serialize through one global
//! lock to emulate a single-writer transaction; `DashMap` lets read-only
//! operations (the ones this crate's contract allows to run outside a
//! transaction) avoid contending with it.

mod notify;
mod state;

pub use notify::InMemoryNotifyAdapter;
pub use state::InMemoryStateAdapter;
