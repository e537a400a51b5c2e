//! Per-key set store backing the shared directories.
//!
//! The directories need nothing beyond set-add, set-remove, and set-read on
//! a string key, so any store offering those three operations can back them.
//! Members may carry a lease: once it lapses, reads no longer return the
//! member even if nobody removed it.

pub mod memory;
pub mod sqlite;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors raised by a set store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// `SQLite` error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Connection pool error.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// The blocking worker panicked or was cancelled.
    #[error("store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// The store cannot be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// A shared mapping from string keys to sets of string members.
///
/// Every operation is additive or subtractive on a single member; nothing
/// overwrites a whole set, so concurrent writers from different processes
/// commute.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SetStore: Send + Sync {
    /// Add `member` to the set at `key`. Re-adding refreshes the lease.
    ///
    /// `lease` of `None` keeps the member until it is removed.
    async fn add(&self, key: &str, member: &str, lease: Option<Duration>) -> Result<()>;

    /// Remove `member` from the set at `key`. Absent members are a no-op.
    async fn remove(&self, key: &str, member: &str) -> Result<()>;

    /// Current unexpired members of the set at `key`, sorted.
    async fn members(&self, key: &str) -> Result<Vec<String>>;

    /// Delete members whose lease has lapsed, across every key. Returns the
    /// number deleted.
    async fn purge_expired(&self) -> Result<usize>;
}
