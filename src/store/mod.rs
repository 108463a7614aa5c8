//! Coordination store access.
//!
//! The scheduler only needs a narrow contract from its backing store:
//!
//! - **Key/value**: get, recursive list, put and subtree delete
//! - **Blocking list**: a keys query that waits until the prefix's modify
//!   index moves past a cursor, bounded by a wait time
//! - **Session locks**: TTL sessions that can hold a lock on a key
//!
//! # Implementations
//!
//! - [`MemoryStore`]: in-process store used for single-node mode and tests
//! - [`ConsulStore`]: Consul HTTP API client

pub mod consul;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

pub use consul::ConsulStore;
pub use memory::MemoryStore;

/// A single key with its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: String,
}

/// Cursor for a blocking query.
///
/// A `wait_index` of 0 never blocks.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryOptions {
    pub wait_index: u64,
    pub wait_time: Option<Duration>,
}

impl QueryOptions {
    pub fn blocking(wait_index: u64, wait_time: Duration) -> Self {
        Self {
            wait_index,
            wait_time: Some(wait_time),
        }
    }
}

/// Metadata returned with a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryMeta {
    /// Modify index of the queried prefix. Always at least 1.
    pub last_index: u64,
}

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// All keys (recursively) under `prefix`, sorted by key.
    async fn list(&self, prefix: &str) -> Result<Vec<KvPair>>;

    /// Keys under `prefix`. With a separator, deeper keys are collapsed up to
    /// and including the first separator after the prefix.
    ///
    /// Blocks while the prefix index is not greater than `opts.wait_index`,
    /// at most `opts.wait_time`.
    async fn keys(
        &self,
        prefix: &str,
        separator: Option<&str>,
        opts: &QueryOptions,
    ) -> Result<(Vec<String>, QueryMeta)>;

    async fn put(&self, key: &str, value: &str) -> Result<()>;

    /// Delete every key starting with `prefix`.
    async fn delete_tree(&self, prefix: &str) -> Result<()>;

    async fn create_session(&self, ttl: Duration) -> Result<String>;

    /// Fails with [`SchedulerError::SessionLost`](crate::error::SchedulerError::SessionLost)
    /// when the session expired or was destroyed.
    async fn renew_session(&self, session: &str) -> Result<()>;

    async fn destroy_session(&self, session: &str) -> Result<()>;

    /// Try to take the lock on `key` for `session`. Returns false when another
    /// session holds it.
    async fn acquire_lock(&self, key: &str, session: &str) -> Result<bool>;

    async fn release_lock(&self, key: &str, session: &str) -> Result<bool>;

    /// Session currently holding the lock on `key`, if any.
    async fn lock_holder(&self, key: &str) -> Result<Option<String>>;
}

/// Last path segment of a key, ignoring a trailing separator.
///
/// `"a/actions/id1/"` and `"a/actions/id1"` both give `"id1"`.
pub fn key_base(key: &str) -> &str {
    let trimmed = key.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}
